//! # NAL Units
//!
//! A NAL unit is the smallest self-contained piece of an H.264 elementary
//! stream. vidlink only distinguishes the three kinds the decoder cares about:
//! the two parameter sets and everything else (coded slices, SEI, AUD…).
//!
//! ```text
//!  H.264 NAL header (first payload byte)
//!  +---+-----+---------+
//!  | F | NRI |  Type   |
//!  +---+-----+---------+
//!    1    2       5 bits
//! ```

use bytes::{BufMut, Bytes, BytesMut};
use std::fmt;

/// Annex-B start code delimiting NAL units in a byte stream.
pub const START_CODE: [u8; 4] = [0x00, 0x00, 0x00, 0x01];

/// Size of the big-endian length prefix used by length-prefixed (AVCC) units.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// NAL type of a sequence parameter set.
pub const NAL_TYPE_SPS: u8 = 7;
/// NAL type of a picture parameter set.
pub const NAL_TYPE_PPS: u8 = 8;
/// NAL type of an IDR slice.
pub const NAL_TYPE_IDR: u8 = 5;

// ─── Kind ───────────────────────────────────────────────────────────────────

/// Decoder-relevant classification of a NAL unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NalKind {
    /// Sequence parameter set (type 7).
    SequenceParams,
    /// Picture parameter set (type 8).
    PictureParams,
    /// Any other unit. Carried to the decoder with a length prefix.
    CodedSlice,
}

impl NalKind {
    /// Classify from the first payload byte (low 5 bits are the NAL type).
    #[inline]
    pub fn from_header(header: u8) -> Self {
        match header & 0x1F {
            NAL_TYPE_SPS => NalKind::SequenceParams,
            NAL_TYPE_PPS => NalKind::PictureParams,
            _ => NalKind::CodedSlice,
        }
    }

    /// Whether this kind is one of the two parameter sets.
    #[inline]
    pub fn is_parameter_set(self) -> bool {
        matches!(self, NalKind::SequenceParams | NalKind::PictureParams)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            NalKind::SequenceParams => "sps",
            NalKind::PictureParams => "pps",
            NalKind::CodedSlice => "slice",
        }
    }
}

impl fmt::Display for NalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─── Unit ───────────────────────────────────────────────────────────────────

/// An immutable NAL unit. The kind is fixed when the unit is built.
#[derive(Clone, PartialEq, Eq)]
pub struct NalUnit {
    kind: NalKind,
    payload: Bytes,
}

impl NalUnit {
    /// Build a unit from its body (no start code, no length prefix).
    ///
    /// Returns `None` for an empty payload: there is no header byte to
    /// classify.
    pub fn new(payload: Bytes) -> Option<Self> {
        let header = *payload.first()?;
        Some(NalUnit {
            kind: NalKind::from_header(header),
            payload,
        })
    }

    /// Build a unit from an Annex-B buffer that starts with [`START_CODE`].
    pub fn from_annex_b(mut data: Bytes) -> Option<Self> {
        if !data.starts_with(&START_CODE) {
            return None;
        }
        let _ = data.split_to(START_CODE.len());
        Self::new(data)
    }

    #[inline]
    pub fn kind(&self) -> NalKind {
        self.kind
    }

    /// The unit body, excluding any start code or length prefix.
    #[inline]
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Raw 5-bit NAL type.
    #[inline]
    pub fn nal_type(&self) -> u8 {
        self.payload[0] & 0x1F
    }

    /// Whether this is an IDR slice.
    pub fn is_idr(&self) -> bool {
        self.nal_type() == NAL_TYPE_IDR
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// Representation handed to the decoder.
    ///
    /// Coded slices get a 4-byte big-endian length prefix; parameter sets are
    /// returned verbatim.
    pub fn wire_bytes(&self) -> Bytes {
        match self.kind {
            NalKind::CodedSlice => {
                let mut buf = BytesMut::with_capacity(LENGTH_PREFIX_SIZE + self.payload.len());
                buf.put_u32(self.payload.len() as u32);
                buf.extend_from_slice(&self.payload);
                buf.freeze()
            }
            NalKind::SequenceParams | NalKind::PictureParams => self.payload.clone(),
        }
    }

    /// Start-code-prefixed representation, as carried on the network.
    pub fn annex_b(&self) -> Bytes {
        annex_b(&self.payload)
    }
}

impl fmt::Debug for NalUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NalUnit")
            .field("kind", &self.kind)
            .field("nal_type", &self.nal_type())
            .field("len", &self.payload.len())
            .finish()
    }
}

/// Prefix `body` with the Annex-B start code.
pub fn annex_b(body: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(START_CODE.len() + body.len());
    buf.extend_from_slice(&START_CODE);
    buf.extend_from_slice(body);
    buf.freeze()
}
