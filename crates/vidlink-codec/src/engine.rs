//! # Compression Engine Seam
//!
//! The encoder drives a [`CompressionEngine`] through three setup calls and
//! then hands it frames. Engines report results asynchronously on an output
//! channel, one [`EngineOutput`] per submitted frame, in submission order.

use bytes::Bytes;
use crossbeam_channel::Sender;
use serde::{Deserialize, Serialize};

use crate::error::{CodecError, EngineError};
use crate::format::{FormatDescription, MediaTime};

// ─── Raw Frames ──────────────────────────────────────────────────────────────

/// An uncompressed 8-bit I420 picture (Y plane, then U, then V).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
    width: u32,
    height: u32,
    data: Bytes,
}

impl RawFrame {
    pub fn new(width: u32, height: u32, data: Bytes) -> Result<Self, CodecError> {
        let expected = Self::i420_len(width, height);
        if data.len() != expected {
            return Err(CodecError::PictureSize {
                expected,
                actual: data.len(),
            });
        }
        Ok(RawFrame {
            width,
            height,
            data,
        })
    }

    /// Byte size of an I420 picture. Chroma planes round up for odd sizes.
    pub fn i420_len(width: u32, height: u32) -> usize {
        let luma = width as usize * height as usize;
        let chroma = width.div_ceil(2) as usize * height.div_ceil(2) as usize;
        luma + 2 * chroma
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn into_data(self) -> Bytes {
        self.data
    }
}

// ─── Session Properties ──────────────────────────────────────────────────────

/// Requested profile. `Auto` lets the engine pick the level.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProfileLevel {
    #[default]
    BaselineAuto,
    MainAuto,
    HighAuto,
}

/// Properties applied to an engine session before encoding starts.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionProperties {
    pub realtime: bool,
    pub profile: ProfileLevel,
    /// Frames between forced keyframes.
    pub keyframe_interval: u32,
    /// 0.0 (smallest) to 1.0 (best).
    pub quality: f32,
    pub allow_frame_reordering: bool,
}

// ─── Engine Output ───────────────────────────────────────────────────────────

/// Status of one encode callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineStatus {
    Ok,
    Failed(String),
}

/// Per-callback flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EncodeInfoFlags {
    pub asynchronous: bool,
    pub frame_dropped: bool,
}

/// A compressed sample as produced by an engine.
#[derive(Debug, Clone)]
pub struct CompressedSample {
    /// Slice data as 4-byte big-endian length-prefixed NAL units. `None`
    /// while the engine has not materialised the bytes.
    pub data: Option<Bytes>,
    pub format: Option<FormatDescription>,
    pub keyframe: bool,
    pub presentation: MediaTime,
    pub duration: MediaTime,
}

/// One engine callback.
#[derive(Debug, Clone)]
pub struct EngineOutput {
    pub status: EngineStatus,
    pub flags: EncodeInfoFlags,
    pub sample: Option<CompressedSample>,
}

impl EngineOutput {
    pub fn sample(sample: CompressedSample) -> Self {
        EngineOutput {
            status: EngineStatus::Ok,
            flags: EncodeInfoFlags::default(),
            sample: Some(sample),
        }
    }
}

// ─── Engine Trait ────────────────────────────────────────────────────────────

/// A frame compressor. Called from a single encoder thread.
pub trait CompressionEngine: Send + 'static {
    /// Allocate a session for frames of the given size. Results of later
    /// [`encode_frame`](Self::encode_frame) calls go to `output`.
    fn create_session(
        &mut self,
        width: u32,
        height: u32,
        output: Sender<EngineOutput>,
    ) -> Result<(), EngineError>;

    fn set_properties(&mut self, properties: &SessionProperties) -> Result<(), EngineError>;

    fn prepare_to_encode(&mut self) -> Result<(), EngineError>;

    /// Submit one frame. An `Err` means no output will be produced for it.
    fn encode_frame(
        &mut self,
        frame: RawFrame,
        presentation: MediaTime,
        duration: MediaTime,
    ) -> Result<(), EngineError>;

    /// Flush pending output and release the session.
    fn invalidate(&mut self) {}
}
