//! # Format Descriptions & Sample Buffers
//!
//! A [`FormatDescription`] is the decoder-side configuration built from one
//! SPS and one or more PPS. A [`SampleBuffer`] pairs one length-prefixed
//! coded slice with the description it must be decoded against, plus the
//! timing attached to it.

use bytes::{Buf, Bytes};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;

use crate::error::CodecError;
use crate::sps::SpsInfo;
use vidlink_transport::nal::{LENGTH_PREFIX_SIZE, NAL_TYPE_PPS};

// ─── Media Time ──────────────────────────────────────────────────────────────

/// Rational timestamp (`value / timescale` seconds). A zero timescale marks
/// the time as invalid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct MediaTime {
    pub value: i64,
    pub timescale: u32,
}

impl MediaTime {
    pub const INVALID: MediaTime = MediaTime {
        value: 0,
        timescale: 0,
    };
    pub const ZERO: MediaTime = MediaTime {
        value: 0,
        timescale: 1,
    };

    pub const fn new(value: i64, timescale: u32) -> Self {
        MediaTime { value, timescale }
    }

    #[inline]
    pub fn is_valid(&self) -> bool {
        self.timescale != 0
    }

    pub fn as_secs_f64(&self) -> Option<f64> {
        self.is_valid()
            .then(|| self.value as f64 / f64::from(self.timescale))
    }
}

impl Default for MediaTime {
    fn default() -> Self {
        MediaTime::INVALID
    }
}

/// Timing attached to a sample.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SampleTiming {
    pub duration: MediaTime,
    pub presentation: MediaTime,
    pub decode: MediaTime,
}

// ─── Format Description ──────────────────────────────────────────────────────

/// Codec configuration derived from H.264 parameter sets.
#[derive(Clone, PartialEq, Eq)]
pub struct FormatDescription {
    parameter_sets: Vec<Bytes>,
    info: SpsInfo,
}

impl FormatDescription {
    /// Build from an SPS followed by one or more PPS, each a complete NAL
    /// unit without start code.
    pub fn from_parameter_sets(parameter_sets: Vec<Bytes>) -> Result<Self, CodecError> {
        if parameter_sets.len() < 2 {
            return Err(CodecError::MissingParameterSets);
        }
        if let Some(index) = parameter_sets.iter().position(|set| set.is_empty()) {
            return Err(CodecError::EmptyParameterSet(index));
        }
        let info = SpsInfo::parse(&parameter_sets[0])?;
        for pps in &parameter_sets[1..] {
            let found = pps[0] & 0x1F;
            if found != NAL_TYPE_PPS {
                return Err(CodecError::WrongNalType {
                    expected: NAL_TYPE_PPS,
                    found,
                });
            }
        }
        Ok(FormatDescription {
            parameter_sets,
            info,
        })
    }

    pub fn from_sps_pps(sps: Bytes, pps: Bytes) -> Result<Self, CodecError> {
        Self::from_parameter_sets(vec![sps, pps])
    }

    pub fn parameter_set_count(&self) -> usize {
        self.parameter_sets.len()
    }

    pub fn parameter_set(&self, index: usize) -> Option<&Bytes> {
        self.parameter_sets.get(index)
    }

    pub fn info(&self) -> &SpsInfo {
        &self.info
    }

    /// Display dimensions (width, height) after cropping.
    pub fn dimensions(&self) -> (u32, u32) {
        (self.info.width, self.info.height)
    }

    /// RFC 6381 codec string, e.g. `avc1.42C01E`.
    pub fn codec_string(&self) -> String {
        format!(
            "avc1.{:02X}{:02X}{:02X}",
            self.info.profile_idc, self.info.constraint_flags, self.info.level_idc
        )
    }
}

impl fmt::Debug for FormatDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FormatDescription")
            .field("codec", &self.codec_string())
            .field("width", &self.info.width)
            .field("height", &self.info.height)
            .field("parameter_sets", &self.parameter_sets.len())
            .finish()
    }
}

// ─── Sample Buffer ───────────────────────────────────────────────────────────

/// One decodable coded slice, ready for a display layer.
#[derive(Debug, Clone)]
pub struct SampleBuffer {
    format: Arc<FormatDescription>,
    data: Bytes,
    timing: SampleTiming,
    display_immediately: bool,
}

impl SampleBuffer {
    /// Wrap a 4-byte big-endian length-prefixed slice. The prefix must match
    /// the number of bytes that follow it.
    pub fn from_length_prefixed(
        format: Arc<FormatDescription>,
        data: Bytes,
        timing: SampleTiming,
    ) -> Result<Self, CodecError> {
        if data.len() < LENGTH_PREFIX_SIZE {
            return Err(CodecError::MissingLengthPrefix(data.len()));
        }
        let declared = (&data[..LENGTH_PREFIX_SIZE]).get_u32() as usize;
        let actual = data.len() - LENGTH_PREFIX_SIZE;
        if declared != actual {
            return Err(CodecError::LengthMismatch { declared, actual });
        }
        Ok(SampleBuffer {
            format,
            data,
            timing,
            display_immediately: false,
        })
    }

    /// Mark the sample for display as soon as it is decoded, ignoring its
    /// presentation time.
    pub fn with_display_immediately(mut self, display_immediately: bool) -> Self {
        self.display_immediately = display_immediately;
        self
    }

    pub fn format(&self) -> &Arc<FormatDescription> {
        &self.format
    }

    /// Length-prefixed slice bytes.
    pub fn data(&self) -> &Bytes {
        &self.data
    }

    /// The slice NAL unit without its length prefix.
    pub fn nal(&self) -> &[u8] {
        &self.data[LENGTH_PREFIX_SIZE..]
    }

    pub fn timing(&self) -> SampleTiming {
        self.timing
    }

    pub fn display_immediately(&self) -> bool {
        self.display_immediately
    }
}
