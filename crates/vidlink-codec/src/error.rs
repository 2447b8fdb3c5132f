//! Error types shared by the codec pipeline.

use std::io;
use thiserror::Error;

/// Failure reported by a [`CompressionEngine`](crate::engine::CompressionEngine).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct EngineError(pub String);

impl EngineError {
    pub fn new(msg: impl Into<String>) -> Self {
        EngineError(msg.into())
    }
}

/// Fatal encoder setup failures. Each stage of engine setup has its own
/// variant so callers can tell them apart.
#[derive(Debug, Error)]
pub enum EncoderError {
    #[error("failed to create compression session")]
    CreateSession(#[source] EngineError),
    #[error("failed to set compression session properties")]
    SetProperties(#[source] EngineError),
    #[error("failed to prepare compression session")]
    PrepareToEncode(#[source] EngineError),
    #[error("failed to spawn encoder thread")]
    Spawn(#[from] io::Error),
}

/// Bitstream and format-description errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("bitstream ended after {bits} bits")]
    UnexpectedEnd { bits: usize },
    #[error("exp-Golomb code longer than 32 bits")]
    GolombOverflow,
    #[error("NAL unit type {found} where {expected} was required")]
    WrongNalType { expected: u8, found: u8 },
    #[error("malformed sequence parameter set: {0}")]
    MalformedSps(&'static str),
    #[error("malformed slice: {0}")]
    MalformedSlice(&'static str),
    #[error("a format description needs an SPS and a PPS")]
    MissingParameterSets,
    #[error("parameter set {0} is empty")]
    EmptyParameterSet(usize),
    #[error("expected 2 parameter sets, found {0}")]
    ParameterSetCount(usize),
    #[error("parameter set {0} not present")]
    MissingParameterSet(usize),
    #[error("sample too short for a length prefix ({0} bytes)")]
    MissingLengthPrefix(usize),
    #[error("length prefix declares {declared} bytes but {actual} follow")]
    LengthMismatch { declared: usize, actual: usize },
    #[error("sample holds {actual} bytes of picture data, expected {expected}")]
    PictureSize { expected: usize, actual: usize },
}

/// Returned when handing work to a pipeline stage without blocking.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum SubmitError {
    /// The stage's input queue is saturated; the item was dropped.
    #[error("stage queue full")]
    Full,
    /// The stage thread has exited.
    #[error("stage stopped")]
    Disconnected,
}

impl<T> From<crossbeam_channel::TrySendError<T>> for SubmitError {
    fn from(err: crossbeam_channel::TrySendError<T>) -> Self {
        match err {
            crossbeam_channel::TrySendError::Full(_) => SubmitError::Full,
            crossbeam_channel::TrySendError::Disconnected(_) => SubmitError::Disconnected,
        }
    }
}
