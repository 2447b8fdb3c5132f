//! # vidlink-codec
//!
//! H.264 encode/decode pipeline around a pluggable compression engine.
//!
//! ## Crate structure
//!
//! - [`engine`]: the [`CompressionEngine`](engine::CompressionEngine) seam and raw frames
//! - [`encoder`]: threaded encoder with keyframe parameter-set injection
//! - [`decoder`]: parameter-set state machine and threaded decoder
//! - [`stage`]: threaded Annex-B parse stage
//! - [`format`]: format descriptions, sample buffers, media time
//! - [`sps`]: SPS bit-level reader and writer
//! - [`emulation`]: emulation-prevention escaping
//! - [`intra`]: uncompressed reference engine

pub mod decoder;
pub mod emulation;
pub mod encoder;
pub mod engine;
pub mod error;
pub mod format;
pub mod intra;
pub mod sps;
pub mod stage;

pub use decoder::{Decoder, DecoderCore, ParameterState};
pub use encoder::{Encoder, EncoderConfig};
pub use engine::{CompressionEngine, RawFrame};
pub use error::{CodecError, EncoderError, EngineError, SubmitError};
pub use format::{FormatDescription, MediaTime, SampleBuffer};
pub use intra::IntraEngine;
pub use stage::NaluStream;
