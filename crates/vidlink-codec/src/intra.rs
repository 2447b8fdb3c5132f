//! # Intra Reference Engine
//!
//! An uncompressed, intra-only [`CompressionEngine`]. Each frame becomes one
//! slice NAL unit whose body is the raw I420 picture with emulation
//! prevention applied, so the output is a well-formed Annex-B/AVCC stream
//! that exercises every stage of the pipeline. A real baseline SPS describes
//! the picture size; [`render`] reverses the packing on the receive side.
//!
//! The slices are not decodable by a standard H.264 decoder.

use bytes::{BufMut, Bytes, BytesMut};
use crossbeam_channel::Sender;
use tracing::debug;

use crate::emulation;
use crate::engine::{
    CompressedSample, CompressionEngine, EngineOutput, ProfileLevel, RawFrame, SessionProperties,
};
use crate::error::{CodecError, EngineError};
use crate::format::{FormatDescription, MediaTime, SampleBuffer};
use crate::sps::SpsInfo;
use vidlink_transport::nal::{LENGTH_PREFIX_SIZE, NAL_TYPE_IDR};

/// PPS paired with every SPS this engine writes.
pub const INTRA_PPS: [u8; 4] = [0x68, 0xCE, 0x38, 0x80];

const IDR_HEADER: u8 = 0x65;
const NON_IDR_HEADER: u8 = 0x41;
const NAL_TYPE_NON_IDR: u8 = 1;
const RBSP_STOP: u8 = 0x80;
const MAX_DIMENSION: u32 = 8192;

/// Smallest level whose frame-size limit fits the picture.
fn level_for(width: u32, height: u32) -> u8 {
    let mbs = width.div_ceil(16) * height.div_ceil(16);
    match mbs {
        0..=99 => 10,
        100..=396 => 20,
        397..=1620 => 30,
        1621..=3600 => 31,
        3601..=8192 => 40,
        8193..=22080 => 50,
        _ => 51,
    }
}

#[derive(Default)]
pub struct IntraEngine {
    size: Option<(u32, u32)>,
    output: Option<Sender<EngineOutput>>,
    format: Option<FormatDescription>,
    keyframe_interval: Option<u32>,
    prepared: bool,
    frames: u64,
}

impl IntraEngine {
    pub fn new() -> Self {
        Self::default()
    }

    fn not_ready(what: &str) -> EngineError {
        EngineError::new(format!("{what} before session setup completed"))
    }
}

impl CompressionEngine for IntraEngine {
    fn create_session(
        &mut self,
        width: u32,
        height: u32,
        output: Sender<EngineOutput>,
    ) -> Result<(), EngineError> {
        if width == 0 || height == 0 || width > MAX_DIMENSION || height > MAX_DIMENSION {
            return Err(EngineError::new(format!("unsupported size {width}x{height}")));
        }
        if width % 2 != 0 || height % 2 != 0 {
            return Err(EngineError::new(format!(
                "I420 needs even dimensions, got {width}x{height}"
            )));
        }
        let sps = SpsInfo::baseline(width, height, level_for(width, height)).to_nal();
        let format =
            FormatDescription::from_sps_pps(sps, Bytes::from_static(&INTRA_PPS))
                .map_err(|e| EngineError::new(e.to_string()))?;
        debug!(codec = %format.codec_string(), width, height, "intra session created");

        self.size = Some((width, height));
        self.output = Some(output);
        self.format = Some(format);
        Ok(())
    }

    fn set_properties(&mut self, properties: &SessionProperties) -> Result<(), EngineError> {
        if self.size.is_none() {
            return Err(Self::not_ready("set_properties"));
        }
        if properties.profile != ProfileLevel::BaselineAuto {
            return Err(EngineError::new(format!(
                "profile {:?} not supported, only baseline",
                properties.profile
            )));
        }
        if properties.keyframe_interval == 0 {
            return Err(EngineError::new("keyframe interval must be at least 1"));
        }
        if properties.allow_frame_reordering {
            return Err(EngineError::new("frame reordering not supported"));
        }
        // Quality has no effect on uncompressed slices.
        self.keyframe_interval = Some(properties.keyframe_interval);
        Ok(())
    }

    fn prepare_to_encode(&mut self) -> Result<(), EngineError> {
        if self.keyframe_interval.is_none() {
            return Err(Self::not_ready("prepare_to_encode"));
        }
        self.prepared = true;
        Ok(())
    }

    fn encode_frame(
        &mut self,
        frame: RawFrame,
        presentation: MediaTime,
        duration: MediaTime,
    ) -> Result<(), EngineError> {
        let (Some((width, height)), Some(interval), Some(output), true) = (
            self.size,
            self.keyframe_interval,
            self.output.as_ref(),
            self.prepared,
        ) else {
            return Err(Self::not_ready("encode_frame"));
        };
        if (frame.width(), frame.height()) != (width, height) {
            return Err(EngineError::new(format!(
                "frame is {}x{}, session is {width}x{height}",
                frame.width(),
                frame.height()
            )));
        }

        let keyframe = self.frames % u64::from(interval) == 0;
        self.frames += 1;

        let mut rbsp = Vec::with_capacity(frame.data().len() + 1);
        rbsp.extend_from_slice(frame.data());
        rbsp.push(RBSP_STOP);
        let body = emulation::escape(&rbsp);

        let mut avcc = BytesMut::with_capacity(LENGTH_PREFIX_SIZE + 1 + body.len());
        avcc.put_u32(body.len() as u32 + 1);
        avcc.put_u8(if keyframe { IDR_HEADER } else { NON_IDR_HEADER });
        avcc.extend_from_slice(&body);

        let sample = CompressedSample {
            data: Some(avcc.freeze()),
            format: self.format.clone(),
            keyframe,
            presentation,
            duration,
        };
        output
            .send(EngineOutput::sample(sample))
            .map_err(|_| EngineError::new("engine output closed"))
    }

    fn invalidate(&mut self) {
        self.output = None;
        self.prepared = false;
    }
}

/// Recover the picture carried by a slice produced by [`IntraEngine`].
pub fn render(sample: &SampleBuffer) -> Result<RawFrame, CodecError> {
    let nal = sample.nal();
    let (&header, body) = nal
        .split_first()
        .ok_or(CodecError::MalformedSlice("empty slice"))?;
    let nal_type = header & 0x1F;
    if nal_type != NAL_TYPE_IDR && nal_type != NAL_TYPE_NON_IDR {
        return Err(CodecError::WrongNalType {
            expected: NAL_TYPE_IDR,
            found: nal_type,
        });
    }

    let mut rbsp = emulation::unescape(body);
    if rbsp.pop() != Some(RBSP_STOP) {
        return Err(CodecError::MalformedSlice("missing stop byte"));
    }
    let (width, height) = sample.format().dimensions();
    RawFrame::new(width, height, Bytes::from(rbsp))
}
