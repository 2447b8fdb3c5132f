//! # Decoder
//!
//! NAL units in, display-ready [`SampleBuffer`]s out.
//!
//! Parameter sets are tracked by [`ParameterState`]. A format description is
//! built as soon as both an SPS and a PPS are known, and rebuilt whenever a
//! new one of either arrives while the pair is still retained. The first
//! slice decoded against a description releases the retained pair, so a
//! lone parameter set arriving afterwards starts collecting afresh instead
//! of rebuilding against stale data.
//!
//! ```text
//!               SPS               PPS             slice
//!  Empty      → HaveSps         → HavePps        → Empty (dropped)
//!  HaveSps    → HaveSps         → build          → Empty (dropped)
//!  HavePps    → build           → HavePps        → Empty (dropped)
//!  Built+pair → build(new sps)  → build(new pps) → Built (emit)
//!  Built      → HaveSps         → HavePps        → Built (emit)
//! ```
//!
//! A failed build leaves the decoder `Empty`.

use bytes::Bytes;
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use serde::Serialize;
use std::sync::{Arc, Mutex};
use std::thread;
use tracing::{debug, info, warn};

use crate::error::SubmitError;
use crate::format::{FormatDescription, MediaTime, SampleBuffer, SampleTiming};
use vidlink_transport::nal::{NalKind, NalUnit};

// ─── Parameter State ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub enum ParameterState {
    #[default]
    Empty,
    HaveSps(Bytes),
    HavePps(Bytes),
    Built {
        format: Arc<FormatDescription>,
        /// SPS and PPS the description was built from, until the first
        /// slice is decoded against it.
        retained: Option<(Bytes, Bytes)>,
    },
}

impl ParameterState {
    pub fn format(&self) -> Option<&Arc<FormatDescription>> {
        match self {
            ParameterState::Built { format, .. } => Some(format),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ParameterState::Empty => "empty",
            ParameterState::HaveSps(_) => "have_sps",
            ParameterState::HavePps(_) => "have_pps",
            ParameterState::Built {
                retained: Some(_), ..
            } => "built_retained",
            ParameterState::Built { retained: None, .. } => "built",
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DecoderStats {
    pub units_received: u64,
    /// Units rejected because the decode queue was full.
    pub units_dropped: u64,
    pub format_builds: u64,
    pub build_failures: u64,
    pub samples_delivered: u64,
    /// Slices that arrived with no usable format, or failed to wrap.
    pub slices_dropped: u64,
    /// Samples lost because the display queue was full.
    pub display_overruns: u64,
}

// ─── Core ───────────────────────────────────────────────────────────────────

/// Single-threaded decode logic. [`Decoder`] runs one on its own thread.
#[derive(Default)]
pub struct DecoderCore {
    state: ParameterState,
    stats: DecoderStats,
}

impl DecoderCore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Advance the parameter state with one unit. Returns a sample when a
    /// slice could be wrapped against the current description.
    pub fn push(&mut self, unit: NalUnit) -> Option<SampleBuffer> {
        self.stats.units_received += 1;
        let state = std::mem::take(&mut self.state);
        let payload = unit.payload().clone();

        let (next, sample) = match (state, unit.kind()) {
            (ParameterState::Empty, NalKind::SequenceParams)
            | (ParameterState::HaveSps(_), NalKind::SequenceParams)
            | (ParameterState::Built { retained: None, .. }, NalKind::SequenceParams) => {
                (ParameterState::HaveSps(payload), None)
            }
            (ParameterState::Empty, NalKind::PictureParams)
            | (ParameterState::HavePps(_), NalKind::PictureParams)
            | (ParameterState::Built { retained: None, .. }, NalKind::PictureParams) => {
                (ParameterState::HavePps(payload), None)
            }
            (ParameterState::HaveSps(sps), NalKind::PictureParams) => {
                (self.build(sps, payload), None)
            }
            (ParameterState::HavePps(pps), NalKind::SequenceParams) => {
                (self.build(payload, pps), None)
            }
            (
                ParameterState::Built {
                    retained: Some((_, pps)),
                    ..
                },
                NalKind::SequenceParams,
            ) => (self.build(payload, pps), None),
            (
                ParameterState::Built {
                    retained: Some((sps, _)),
                    ..
                },
                NalKind::PictureParams,
            ) => (self.build(sps, payload), None),
            (ParameterState::Built { format, .. }, NalKind::CodedSlice) => {
                let sample = self.wrap(&format, &unit);
                (
                    ParameterState::Built {
                        format,
                        retained: None,
                    },
                    sample,
                )
            }
            (state, NalKind::CodedSlice) => {
                self.stats.slices_dropped += 1;
                debug!(state = state.name(), "slice before format description, dropped");
                (ParameterState::Empty, None)
            }
        };

        self.state = next;
        sample
    }

    fn build(&mut self, sps: Bytes, pps: Bytes) -> ParameterState {
        match FormatDescription::from_sps_pps(sps.clone(), pps.clone()) {
            Ok(format) => {
                self.stats.format_builds += 1;
                info!(
                    codec = %format.codec_string(),
                    width = format.info().width,
                    height = format.info().height,
                    "format description built"
                );
                ParameterState::Built {
                    format: Arc::new(format),
                    retained: Some((sps, pps)),
                }
            }
            Err(e) => {
                self.stats.build_failures += 1;
                warn!(error = %e, "failed to build format description");
                ParameterState::Empty
            }
        }
    }

    fn wrap(&mut self, format: &Arc<FormatDescription>, unit: &NalUnit) -> Option<SampleBuffer> {
        let timing = SampleTiming {
            duration: MediaTime::INVALID,
            presentation: MediaTime::ZERO,
            decode: MediaTime::INVALID,
        };
        match SampleBuffer::from_length_prefixed(format.clone(), unit.wire_bytes(), timing) {
            Ok(sample) => {
                self.stats.samples_delivered += 1;
                Some(sample.with_display_immediately(true))
            }
            Err(e) => {
                self.stats.slices_dropped += 1;
                warn!(error = %e, "failed to wrap slice");
                None
            }
        }
    }

    pub fn state(&self) -> &ParameterState {
        &self.state
    }

    pub fn stats(&self) -> &DecoderStats {
        &self.stats
    }
}

// ─── Threaded Decoder ───────────────────────────────────────────────────────

/// Runs a [`DecoderCore`] on a dedicated thread. Units are decoded strictly
/// in submission order; samples go to the display channel.
pub struct Decoder {
    unit_tx: Option<Sender<NalUnit>>,
    stats: Arc<Mutex<DecoderStats>>,
    handle: Option<thread::JoinHandle<()>>,
}

impl Decoder {
    pub fn spawn(queue_capacity: usize, display_tx: Sender<SampleBuffer>) -> std::io::Result<Self> {
        let (unit_tx, unit_rx) = bounded(queue_capacity.max(1));
        let stats = Arc::new(Mutex::new(DecoderStats::default()));
        let thread_stats = stats.clone();
        let handle = thread::Builder::new()
            .name("vidlink-decode".into())
            .spawn(move || decode_loop(unit_rx, display_tx, thread_stats))?;
        Ok(Decoder {
            unit_tx: Some(unit_tx),
            stats,
            handle: Some(handle),
        })
    }

    /// Queue a unit for decoding. Never blocks; a full queue drops the unit.
    pub fn decode(&self, unit: NalUnit) -> Result<(), SubmitError> {
        let tx = self.unit_tx.as_ref().ok_or(SubmitError::Disconnected)?;
        let result = tx.try_send(unit).map_err(SubmitError::from);
        if result == Err(SubmitError::Full) {
            let mut stats = self.stats.lock().unwrap_or_else(|e| e.into_inner());
            stats.units_dropped += 1;
            warn!(dropped = stats.units_dropped, "decode queue full, dropping unit");
        }
        result
    }

    /// A sender feeding this decoder directly, for upstream stages that
    /// should block rather than drop.
    pub fn input(&self) -> Option<Sender<NalUnit>> {
        self.unit_tx.clone()
    }

    pub fn stats(&self) -> DecoderStats {
        self.stats.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Drain queued units and stop the decode thread. Idempotent.
    ///
    /// Senders handed out by [`input`](Self::input) keep the thread alive
    /// until they are dropped too.
    pub fn shutdown(&mut self) {
        self.unit_tx = None;
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Decoder {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn decode_loop(
    unit_rx: Receiver<NalUnit>,
    display_tx: Sender<SampleBuffer>,
    stats: Arc<Mutex<DecoderStats>>,
) {
    let mut core = DecoderCore::new();
    let mut overruns = 0u64;
    for unit in unit_rx {
        if let Some(sample) = core.push(unit) {
            match display_tx.try_send(sample) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    overruns += 1;
                    warn!(overruns, "display queue full, dropping sample");
                }
                Err(TrySendError::Disconnected(_)) => {
                    debug!("display receiver gone, decode thread exiting");
                    break;
                }
            }
        }
        let mut s = stats.lock().unwrap_or_else(|e| e.into_inner());
        let dropped = s.units_dropped;
        *s = core.stats().clone();
        s.units_dropped = dropped;
        s.display_overruns = overruns;
    }
}
