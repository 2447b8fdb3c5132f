//! # vidlink-transport
//!
//! Byte-level layer of the vidlink LAN video link.
//!
//! H.264 travels as an Annex-B elementary stream inside typed messages on a
//! reliable stream transport. This crate holds the pure, I/O-free pieces
//! that sit on either side of the socket.
//!
//! ## Crate structure
//!
//! - [`nal`]: NAL unit classification and wire representations
//! - [`parser`]: incremental start-code splitter for Annex-B streams
//! - [`wire`]: message header serialization and stream reassembly

pub mod nal;
pub mod parser;
pub mod wire;

pub use nal::{NalKind, NalUnit};
pub use parser::{NaluParser, ParseError, ParserConfig};
pub use wire::{FrameError, Message, MessageDecoder, MessageType};
