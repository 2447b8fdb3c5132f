//! # Encoder
//!
//! Raw frames in, Annex-B NAL units out.
//!
//! ```text
//!  encode() ──try_send──▶ [encode thread] ──engine──▶ [output thread] ──▶ unit_tx
//!                          owns the engine           package_output()
//! ```
//!
//! On every keyframe the SPS and PPS are pulled out of the sample's format
//! description and delivered ahead of the slice data, so a receiver can
//! join at any keyframe.

use bytes::{Buf, Bytes};
use crossbeam_channel::{bounded, Receiver, Sender};
use serde::Serialize;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::thread;
use tracing::{debug, info, trace, warn};

use crate::engine::{
    CompressionEngine, EngineOutput, EngineStatus, ProfileLevel, RawFrame, SessionProperties,
};
use crate::error::{CodecError, EncoderError, SubmitError};
use crate::format::{FormatDescription, MediaTime};
use vidlink_transport::nal::{annex_b, LENGTH_PREFIX_SIZE};

// ─── Configuration ──────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct EncoderConfig {
    pub width: u32,
    pub height: u32,
    /// 0.0 (smallest) to 1.0 (best).
    pub quality: f32,
    pub keyframe_interval: u32,
    pub realtime: bool,
    pub profile: ProfileLevel,
    /// Frames waiting for the engine before `encode` starts dropping.
    pub queue_capacity: usize,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        EncoderConfig {
            width: 1280,
            height: 720,
            quality: 0.7,
            keyframe_interval: 60,
            realtime: true,
            profile: ProfileLevel::BaselineAuto,
            queue_capacity: 8,
        }
    }
}

impl EncoderConfig {
    fn session_properties(&self) -> SessionProperties {
        SessionProperties {
            realtime: self.realtime,
            profile: self.profile,
            keyframe_interval: self.keyframe_interval,
            quality: self.quality.clamp(0.0, 1.0),
            allow_frame_reordering: false,
        }
    }
}

// ─── Statistics ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize)]
pub struct EncoderStats {
    pub frames_submitted: u64,
    /// Frames rejected because the encode queue was full.
    pub frames_dropped: u64,
    /// Frames the engine refused outright.
    pub engine_errors: u64,
    pub samples_packaged: u64,
    pub keyframes: u64,
    pub discarded_no_sample: u64,
    pub discarded_status: u64,
    pub discarded_not_ready: u64,
    pub discarded_frame_dropped: u64,
    pub parameter_set_failures: u64,
    pub truncated_samples: u64,
    pub units_emitted: u64,
}

// ─── Output Packaging ───────────────────────────────────────────────────────

/// Why an engine callback produced no units.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Discard {
    NoSample,
    Status(String),
    DataNotReady,
    FrameDropped,
}

impl fmt::Display for Discard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Discard::NoSample => f.write_str("no sample buffer"),
            Discard::Status(msg) => write!(f, "engine status: {msg}"),
            Discard::DataNotReady => f.write_str("sample data not ready"),
            Discard::FrameDropped => f.write_str("frame dropped by engine"),
        }
    }
}

/// Units produced from one engine callback, in delivery order.
#[derive(Debug, Clone, Default)]
pub struct Packaged {
    /// Start-code-prefixed NAL units.
    pub units: Vec<Bytes>,
    pub keyframe: bool,
    pub presentation: MediaTime,
    /// Set when a keyframe's parameter sets could not be extracted. The
    /// slice data is still in `units`.
    pub parameter_set_error: Option<CodecError>,
    /// Set when the sample ended in the middle of a sub-unit. Units before
    /// the damage are still in `units`.
    pub truncated: Option<CodecError>,
}

/// Pull SPS and PPS out of a format description.
pub fn extract_parameter_sets(format: &FormatDescription) -> Result<[Bytes; 2], CodecError> {
    let count = format.parameter_set_count();
    if count != 2 {
        return Err(CodecError::ParameterSetCount(count));
    }
    let sps = format
        .parameter_set(0)
        .ok_or(CodecError::MissingParameterSet(0))?;
    let pps = format
        .parameter_set(1)
        .ok_or(CodecError::MissingParameterSet(1))?;
    Ok([sps.clone(), pps.clone()])
}

/// Split 4-byte big-endian length-prefixed sub-units.
///
/// Stops at the first sub-unit that runs past the end of `data`; everything
/// before it is returned alongside the error.
pub fn split_length_prefixed(data: &Bytes) -> (Vec<Bytes>, Option<CodecError>) {
    let mut units = Vec::new();
    let mut offset = 0;
    while offset < data.len() {
        let remaining = data.len() - offset;
        if remaining < LENGTH_PREFIX_SIZE {
            return (units, Some(CodecError::MissingLengthPrefix(remaining)));
        }
        let declared = (&data[offset..offset + LENGTH_PREFIX_SIZE]).get_u32() as usize;
        let actual = remaining - LENGTH_PREFIX_SIZE;
        if declared > actual {
            return (units, Some(CodecError::LengthMismatch { declared, actual }));
        }
        let start = offset + LENGTH_PREFIX_SIZE;
        if declared > 0 {
            units.push(data.slice(start..start + declared));
        }
        offset = start + declared;
    }
    (units, None)
}

/// Turn one engine callback into Annex-B units.
///
/// The checks run in a fixed order: missing sample, failed status,
/// unmaterialised data, dropped frame.
pub fn package_output(output: EngineOutput) -> Result<Packaged, Discard> {
    let sample = output.sample.ok_or(Discard::NoSample)?;
    if let EngineStatus::Failed(msg) = output.status {
        return Err(Discard::Status(msg));
    }
    let data = sample.data.ok_or(Discard::DataNotReady)?;
    if output.flags.frame_dropped {
        return Err(Discard::FrameDropped);
    }

    let mut packaged = Packaged {
        keyframe: sample.keyframe,
        presentation: sample.presentation,
        ..Packaged::default()
    };

    if sample.keyframe {
        let sets = sample
            .format
            .as_ref()
            .ok_or(CodecError::MissingParameterSets)
            .and_then(extract_parameter_sets);
        match sets {
            Ok([sps, pps]) => {
                packaged.units.push(annex_b(&sps));
                packaged.units.push(annex_b(&pps));
            }
            Err(e) => packaged.parameter_set_error = Some(e),
        }
    }

    let (slices, truncated) = split_length_prefixed(&data);
    packaged
        .units
        .extend(slices.iter().map(|slice| annex_b(slice)));
    packaged.truncated = truncated;
    Ok(packaged)
}

// ─── Encoder ────────────────────────────────────────────────────────────────

struct EncodeJob {
    frame: RawFrame,
    presentation: MediaTime,
    duration: MediaTime,
}

/// Threaded H.264 encoder front end.
///
/// Dropping the encoder flushes the engine and joins both threads.
pub struct Encoder {
    job_tx: Option<Sender<EncodeJob>>,
    stats: Arc<Mutex<EncoderStats>>,
    handles: Vec<thread::JoinHandle<()>>,
}

impl Encoder {
    /// Configure `engine` and start the encode and output threads.
    ///
    /// Every delivered unit is sent on `unit_tx` in Annex-B form.
    pub fn new<E: CompressionEngine>(
        mut engine: E,
        config: EncoderConfig,
        unit_tx: Sender<Bytes>,
    ) -> Result<Self, EncoderError> {
        let (output_tx, output_rx) = bounded(config.queue_capacity.max(1) * 2);
        engine
            .create_session(config.width, config.height, output_tx)
            .map_err(EncoderError::CreateSession)?;
        engine
            .set_properties(&config.session_properties())
            .map_err(EncoderError::SetProperties)?;
        engine
            .prepare_to_encode()
            .map_err(EncoderError::PrepareToEncode)?;

        let stats = Arc::new(Mutex::new(EncoderStats::default()));
        let (job_tx, job_rx) = bounded(config.queue_capacity.max(1));

        let output_stats = stats.clone();
        let output_handle = thread::Builder::new()
            .name("vidlink-enc-out".into())
            .spawn(move || output_loop(output_rx, unit_tx, output_stats))?;

        let encode_stats = stats.clone();
        let encode_handle = thread::Builder::new()
            .name("vidlink-encode".into())
            .spawn(move || encode_loop(engine, job_rx, encode_stats))?;

        info!(
            width = config.width,
            height = config.height,
            keyframe_interval = config.keyframe_interval,
            profile = ?config.profile,
            "encoder started"
        );

        Ok(Encoder {
            job_tx: Some(job_tx),
            stats,
            handles: vec![encode_handle, output_handle],
        })
    }

    /// Queue a frame. Never blocks; a full queue drops the frame.
    pub fn encode(
        &self,
        frame: RawFrame,
        presentation: MediaTime,
        duration: MediaTime,
    ) -> Result<(), SubmitError> {
        let tx = self.job_tx.as_ref().ok_or(SubmitError::Disconnected)?;
        let result = tx
            .try_send(EncodeJob {
                frame,
                presentation,
                duration,
            })
            .map_err(SubmitError::from);

        let mut stats = self.stats.lock().unwrap_or_else(|e| e.into_inner());
        match result {
            Ok(()) => stats.frames_submitted += 1,
            Err(SubmitError::Full) => {
                stats.frames_dropped += 1;
                warn!(dropped = stats.frames_dropped, "encode queue full, dropping frame");
            }
            Err(SubmitError::Disconnected) => {}
        }
        result
    }

    pub fn stats(&self) -> EncoderStats {
        self.stats.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Flush the engine and join the worker threads. Idempotent.
    pub fn shutdown(&mut self) {
        self.job_tx = None;
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for Encoder {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn encode_loop<E: CompressionEngine>(
    mut engine: E,
    job_rx: Receiver<EncodeJob>,
    stats: Arc<Mutex<EncoderStats>>,
) {
    for job in job_rx {
        if let Err(e) = engine.encode_frame(job.frame, job.presentation, job.duration) {
            warn!(error = %e, "engine rejected frame");
            stats.lock().unwrap_or_else(|e| e.into_inner()).engine_errors += 1;
        }
    }
    engine.invalidate();
    debug!("encode thread exiting");
    // Dropping the engine closes its output channel and ends the output thread.
}

fn output_loop(
    output_rx: Receiver<EngineOutput>,
    unit_tx: Sender<Bytes>,
    stats: Arc<Mutex<EncoderStats>>,
) {
    for output in output_rx {
        let packaged = match package_output(output) {
            Ok(p) => p,
            Err(reason) => {
                warn!(%reason, "discarding encoder output");
                let mut s = stats.lock().unwrap_or_else(|e| e.into_inner());
                match reason {
                    Discard::NoSample => s.discarded_no_sample += 1,
                    Discard::Status(_) => s.discarded_status += 1,
                    Discard::DataNotReady => s.discarded_not_ready += 1,
                    Discard::FrameDropped => s.discarded_frame_dropped += 1,
                }
                continue;
            }
        };

        if let Some(e) = &packaged.parameter_set_error {
            warn!(error = %e, "keyframe without usable parameter sets");
        }
        if let Some(e) = &packaged.truncated {
            warn!(error = %e, "truncated sample, remainder abandoned");
        }
        trace!(
            units = packaged.units.len(),
            keyframe = packaged.keyframe,
            pts = ?packaged.presentation.as_secs_f64(),
            "sample packaged"
        );

        {
            let mut s = stats.lock().unwrap_or_else(|e| e.into_inner());
            s.samples_packaged += 1;
            s.keyframes += u64::from(packaged.keyframe);
            s.parameter_set_failures += u64::from(packaged.parameter_set_error.is_some());
            s.truncated_samples += u64::from(packaged.truncated.is_some());
            s.units_emitted += packaged.units.len() as u64;
        }

        for unit in packaged.units {
            if unit_tx.send(unit).is_err() {
                debug!("unit receiver gone, output thread exiting");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{CompressedSample, EncodeInfoFlags};
    use crate::error::EngineError;
    use crate::intra::{IntraEngine, INTRA_PPS};
    use crate::sps::SpsInfo;
    use std::time::Duration;

    fn format() -> FormatDescription {
        FormatDescription::from_sps_pps(
            SpsInfo::baseline(64, 48, 10).to_nal(),
            Bytes::from_static(&INTRA_PPS),
        )
        .unwrap()
    }

    fn sample(keyframe: bool, data: &'static [u8]) -> CompressedSample {
        CompressedSample {
            data: Some(Bytes::from_static(data)),
            format: Some(format()),
            keyframe,
            presentation: MediaTime::ZERO,
            duration: MediaTime::INVALID,
        }
    }

    #[test]
    fn keyframe_emits_parameter_sets_first() {
        let out = package_output(EngineOutput::sample(sample(
            true,
            &[0, 0, 0, 3, 0x65, 0xAA, 0xBB, 0, 0, 0, 2, 0x65, 0xCC],
        )))
        .unwrap();
        assert_eq!(out.units.len(), 4);
        assert_eq!(out.units[0][4] & 0x1F, 7);
        assert_eq!(&out.units[1][..], &[0, 0, 0, 1, 0x68, 0xCE, 0x38, 0x80]);
        assert_eq!(&out.units[2][..], &[0, 0, 0, 1, 0x65, 0xAA, 0xBB]);
        assert_eq!(&out.units[3][..], &[0, 0, 0, 1, 0x65, 0xCC]);
        assert!(out.units.iter().all(|u| u.starts_with(&[0, 0, 0, 1])));
    }

    #[test]
    fn non_keyframe_has_only_slices() {
        let out = package_output(EngineOutput::sample(sample(false, &[0, 0, 0, 1, 0x41]))).unwrap();
        assert_eq!(out.units, vec![Bytes::from_static(&[0, 0, 0, 1, 0x41])]);
    }

    #[test]
    fn discard_reasons_checked_in_order() {
        let none = EngineOutput {
            status: EngineStatus::Failed("boom".into()),
            flags: EncodeInfoFlags::default(),
            sample: None,
        };
        assert_eq!(package_output(none).unwrap_err(), Discard::NoSample);

        let mut failed = EngineOutput::sample(sample(false, &[]));
        failed.status = EngineStatus::Failed("boom".into());
        failed.flags.frame_dropped = true;
        assert_eq!(
            package_output(failed).unwrap_err(),
            Discard::Status("boom".into())
        );

        let mut not_ready = EngineOutput::sample(sample(false, &[]));
        not_ready.sample.as_mut().unwrap().data = None;
        not_ready.flags.frame_dropped = true;
        assert_eq!(package_output(not_ready).unwrap_err(), Discard::DataNotReady);

        let mut dropped = EngineOutput::sample(sample(false, &[]));
        dropped.flags.frame_dropped = true;
        assert_eq!(package_output(dropped).unwrap_err(), Discard::FrameDropped);
    }

    #[test]
    fn bad_parameter_sets_still_deliver_slices() {
        let mut s = sample(true, &[0, 0, 0, 1, 0x65]);
        s.format = Some(
            FormatDescription::from_parameter_sets(vec![
                SpsInfo::baseline(64, 48, 10).to_nal(),
                Bytes::from_static(&INTRA_PPS),
                Bytes::from_static(&INTRA_PPS),
            ])
            .unwrap(),
        );
        let out = package_output(EngineOutput::sample(s)).unwrap();
        assert_eq!(out.parameter_set_error, Some(CodecError::ParameterSetCount(3)));
        assert_eq!(out.units, vec![Bytes::from_static(&[0, 0, 0, 1, 0x65])]);

        let mut s = sample(true, &[0, 0, 0, 1, 0x65]);
        s.format = None;
        let out = package_output(EngineOutput::sample(s)).unwrap();
        assert_eq!(out.parameter_set_error, Some(CodecError::MissingParameterSets));
        assert_eq!(out.units.len(), 1);
    }

    #[test]
    fn truncated_sub_unit_abandons_rest() {
        let data = Bytes::from_static(&[0, 0, 0, 1, 0x41, 0, 0, 0, 9, 0x41, 0x01]);
        let (units, err) = split_length_prefixed(&data);
        assert_eq!(units, vec![Bytes::from_static(&[0x41])]);
        assert_eq!(
            err,
            Some(CodecError::LengthMismatch {
                declared: 9,
                actual: 2
            })
        );

        let (units, err) = split_length_prefixed(&Bytes::from_static(&[0, 0, 0, 1, 0x41, 0, 0]));
        assert_eq!(units.len(), 1);
        assert_eq!(err, Some(CodecError::MissingLengthPrefix(2)));
    }

    struct FailingEngine(u8);

    impl CompressionEngine for FailingEngine {
        fn create_session(
            &mut self,
            _: u32,
            _: u32,
            _: Sender<EngineOutput>,
        ) -> Result<(), EngineError> {
            if self.0 == 0 {
                return Err(EngineError::new("no hardware"));
            }
            Ok(())
        }
        fn set_properties(&mut self, _: &SessionProperties) -> Result<(), EngineError> {
            if self.0 == 1 {
                return Err(EngineError::new("bad bitrate"));
            }
            Ok(())
        }
        fn prepare_to_encode(&mut self) -> Result<(), EngineError> {
            Err(EngineError::new("busy"))
        }
        fn encode_frame(&mut self, _: RawFrame, _: MediaTime, _: MediaTime) -> Result<(), EngineError> {
            Ok(())
        }
    }

    #[test]
    fn setup_failures_are_distinct() {
        let (tx, _rx) = bounded(1);
        assert!(matches!(
            Encoder::new(FailingEngine(0), EncoderConfig::default(), tx.clone()),
            Err(EncoderError::CreateSession(_))
        ));
        assert!(matches!(
            Encoder::new(FailingEngine(1), EncoderConfig::default(), tx.clone()),
            Err(EncoderError::SetProperties(_))
        ));
        assert!(matches!(
            Encoder::new(FailingEngine(2), EncoderConfig::default(), tx),
            Err(EncoderError::PrepareToEncode(_))
        ));
    }

    #[test]
    fn threaded_encoder_delivers_in_order() {
        let (unit_tx, unit_rx) = bounded(64);
        let config = EncoderConfig {
            width: 16,
            height: 16,
            keyframe_interval: 2,
            queue_capacity: 16,
            ..EncoderConfig::default()
        };
        let mut encoder = Encoder::new(IntraEngine::new(), config, unit_tx).unwrap();
        for n in 0..4u8 {
            let data = Bytes::from(vec![n + 1; RawFrame::i420_len(16, 16)]);
            let frame = RawFrame::new(16, 16, data).unwrap();
            encoder
                .encode(frame, MediaTime::new(n.into(), 30), MediaTime::new(1, 30))
                .unwrap();
        }
        encoder.shutdown();

        let units: Vec<Bytes> = unit_rx.try_iter().collect();
        let types: Vec<u8> = units.iter().map(|u| u[4] & 0x1F).collect();
        // SPS, PPS, IDR, P, SPS, PPS, IDR, P
        assert_eq!(types, vec![7, 8, 5, 1, 7, 8, 5, 1]);
        assert_eq!(units[3][5], 2, "second frame follows the first");

        let stats = encoder.stats();
        assert_eq!(stats.frames_submitted, 4);
        assert_eq!(stats.samples_packaged, 4);
        assert_eq!(stats.keyframes, 2);
        assert_eq!(stats.units_emitted, 8);
        assert!(unit_rx.recv_timeout(Duration::from_millis(10)).is_err());
        assert_eq!(
            encoder.encode(
                RawFrame::new(16, 16, Bytes::from(vec![0; RawFrame::i420_len(16, 16)])).unwrap(),
                MediaTime::ZERO,
                MediaTime::INVALID
            ),
            Err(SubmitError::Disconnected)
        );
    }
}
