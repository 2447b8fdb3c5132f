//! # vidlink Wire Format
//!
//! Typed message framing over a reliable byte stream (TCP). Every message is
//! a fixed 8-byte header followed by the payload.
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                     Message Type (32, BE)                     |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                    Payload Length (32, BE)                    |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                     Payload (0..len bytes)                    |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! Type codes this build does not know decode as [`MessageType::Invalid`]
//! and are handed to the consumer like any other message.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::VecDeque;
use std::fmt;
use thiserror::Error;

// ─── Constants ───────────────────────────────────────────────────────────────

/// Encoded header size: 4 (type) + 4 (payload length).
pub const HEADER_SIZE: usize = 8;

/// Largest payload a peer may announce (64 MiB).
pub const MAX_PAYLOAD_LEN: usize = 64 * 1024 * 1024;

/// Payload of a disconnect notification.
pub const DISCONNECT_PAYLOAD: &[u8] = b"Disconnect";

// ─── Message Type ────────────────────────────────────────────────────────────

/// Application message types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum MessageType {
    /// Unknown or unassigned type code.
    Invalid = 0,
    /// Annex-B encoded NAL unit(s).
    VideoData = 1,
    /// Free-form UTF-8 text for the user.
    Text = 2,
    /// The sender is closing the connection.
    Disconnect = 3,
}

impl MessageType {
    /// Map a wire code to a type. Unknown codes become `Invalid`.
    pub fn from_code(code: u32) -> Self {
        match code {
            1 => MessageType::VideoData,
            2 => MessageType::Text,
            3 => MessageType::Disconnect,
            _ => MessageType::Invalid,
        }
    }

    #[inline]
    pub fn code(self) -> u32 {
        self as u32
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MessageType::Invalid => "invalid",
            MessageType::VideoData => "video",
            MessageType::Text => "text",
            MessageType::Disconnect => "disconnect",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─── Errors ─────────────────────────────────────────────────────────────────

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// The peer announced a payload beyond [`MAX_PAYLOAD_LEN`]. The stream
    /// cannot be resynchronised and must be closed.
    #[error("announced payload of {len} bytes exceeds limit of {limit}")]
    PayloadTooLarge { len: usize, limit: usize },
}

// ─── Header ─────────────────────────────────────────────────────────────────

/// Decoded message header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub message_type: MessageType,
    /// Type code exactly as it appeared on the wire.
    pub raw_type: u32,
    pub payload_len: u32,
}

impl FrameHeader {
    pub fn new(message_type: MessageType, payload_len: u32) -> Self {
        FrameHeader {
            message_type,
            raw_type: message_type.code(),
            payload_len,
        }
    }

    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u32(self.raw_type);
        buf.put_u32(self.payload_len);
    }

    /// Decode a header. Returns `None` if fewer than [`HEADER_SIZE`] bytes
    /// are available.
    pub fn decode(buf: &mut impl Buf) -> Option<Self> {
        if buf.remaining() < HEADER_SIZE {
            return None;
        }
        let raw_type = buf.get_u32();
        let payload_len = buf.get_u32();
        Some(FrameHeader {
            message_type: MessageType::from_code(raw_type),
            raw_type,
            payload_len,
        })
    }
}

// ─── Message ────────────────────────────────────────────────────────────────

/// A framed application message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub header: FrameHeader,
    pub payload: Bytes,
}

impl Message {
    pub fn new(message_type: MessageType, payload: Bytes) -> Self {
        Message {
            header: FrameHeader::new(message_type, payload.len() as u32),
            payload,
        }
    }

    pub fn video(payload: Bytes) -> Self {
        Self::new(MessageType::VideoData, payload)
    }

    pub fn text(text: &str) -> Self {
        Self::new(MessageType::Text, Bytes::copy_from_slice(text.as_bytes()))
    }

    pub fn disconnect() -> Self {
        Self::new(MessageType::Disconnect, Bytes::from_static(DISCONNECT_PAYLOAD))
    }

    #[inline]
    pub fn message_type(&self) -> MessageType {
        self.header.message_type
    }

    /// Serialize header + payload into one contiguous buffer.
    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + self.payload.len());
        self.header.encode(&mut buf);
        buf.extend_from_slice(&self.payload);
        buf
    }

    /// Decode one complete message from the front of `data`.
    ///
    /// Returns `None` (consuming nothing useful) if the header or payload is
    /// incomplete. Use [`MessageDecoder`] for streams.
    pub fn decode(data: &mut impl Buf) -> Option<Self> {
        let header = FrameHeader::decode(data)?;
        let len = header.payload_len as usize;
        if data.remaining() < len {
            return None;
        }
        let payload = data.copy_to_bytes(len);
        Some(Message { header, payload })
    }
}

/// Encode a message without building a [`Message`] first.
pub fn encode_message(message_type: MessageType, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(HEADER_SIZE + payload.len());
    FrameHeader::new(message_type, payload.len() as u32).encode(&mut buf);
    buf.extend_from_slice(payload);
    buf.freeze()
}

// ─── Stream Decoder ─────────────────────────────────────────────────────────

/// Reassembles messages from arbitrary reads of the byte stream.
///
/// Partial headers and payloads are buffered; a single read holding several
/// messages yields all of them.
#[derive(Default)]
pub struct MessageDecoder {
    buf: BytesMut,
    pending: Option<FrameHeader>,
    ready: VecDeque<Message>,
}

impl MessageDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes read from the transport and decode every complete
    /// message they finish.
    pub fn push(&mut self, data: &[u8]) -> Result<(), FrameError> {
        self.buf.extend_from_slice(data);
        loop {
            let header = match self.pending.take() {
                Some(header) => header,
                None => match FrameHeader::decode(&mut self.buf) {
                    Some(header) => {
                        let len = header.payload_len as usize;
                        if len > MAX_PAYLOAD_LEN {
                            return Err(FrameError::PayloadTooLarge {
                                len,
                                limit: MAX_PAYLOAD_LEN,
                            });
                        }
                        header
                    }
                    None => return Ok(()),
                },
            };

            let len = header.payload_len as usize;
            if self.buf.len() < len {
                self.buf.reserve(len - self.buf.len());
                self.pending = Some(header);
                return Ok(());
            }
            let payload = self.buf.split_to(len).freeze();
            self.ready.push_back(Message { header, payload });
        }
    }

    /// Next fully decoded message, in stream order.
    pub fn next_message(&mut self) -> Option<Message> {
        self.ready.pop_front()
    }

    pub fn drain_messages(&mut self) -> impl Iterator<Item = Message> + '_ {
        self.ready.drain(..)
    }

    /// Bytes buffered towards the next message (header already consumed
    /// bytes are not counted).
    pub fn buffered_len(&self) -> usize {
        self.buf.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_roundtrip() {
        let hdr = FrameHeader::new(MessageType::VideoData, 1400);
        let mut buf = BytesMut::new();
        hdr.encode(&mut buf);
        assert_eq!(buf.len(), HEADER_SIZE);
        assert_eq!(&buf[..], &[0, 0, 0, 1, 0, 0, 0x05, 0x78]);
        let decoded = FrameHeader::decode(&mut buf).unwrap();
        assert_eq!(decoded, hdr);
    }

    #[test]
    fn short_header_is_none() {
        assert!(FrameHeader::decode(&mut &[0u8, 0, 0, 1, 0, 0, 0][..]).is_none());
    }

    #[test]
    fn full_message_roundtrip() {
        let msg = Message::video(Bytes::from_static(&[0, 0, 0, 1, 0x65, 0x88]));
        let encoded = msg.encode();
        let decoded = Message::decode(&mut encoded.freeze()).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn disconnect_carries_marker_payload() {
        let msg = Message::disconnect();
        assert_eq!(msg.message_type(), MessageType::Disconnect);
        assert_eq!(&msg.payload[..], b"Disconnect");
    }

    #[test]
    fn unknown_type_decodes_as_invalid() {
        let mut buf = BytesMut::new();
        buf.put_u32(0xBEEF);
        buf.put_u32(2);
        buf.extend_from_slice(b"hi");

        let mut dec = MessageDecoder::new();
        dec.push(&buf).unwrap();
        let msg = dec.next_message().unwrap();
        assert_eq!(msg.message_type(), MessageType::Invalid);
        assert_eq!(msg.header.raw_type, 0xBEEF);
        assert_eq!(&msg.payload[..], b"hi");
    }

    #[test]
    fn decoder_handles_split_header_and_payload() {
        let wire = encode_message(MessageType::Text, b"hello vidlink");
        let mut dec = MessageDecoder::new();
        dec.push(&wire[..3]).unwrap();
        assert!(dec.next_message().is_none());
        dec.push(&wire[3..10]).unwrap();
        assert!(dec.next_message().is_none());
        dec.push(&wire[10..]).unwrap();
        let msg = dec.next_message().unwrap();
        assert_eq!(msg.message_type(), MessageType::Text);
        assert_eq!(&msg.payload[..], b"hello vidlink");
        assert_eq!(dec.buffered_len(), 0);
    }

    #[test]
    fn decoder_yields_every_message_in_one_read() {
        let mut wire = BytesMut::new();
        wire.extend_from_slice(&encode_message(MessageType::Disconnect, b""));
        wire.extend_from_slice(&encode_message(MessageType::VideoData, &[1, 2, 3]));
        wire.extend_from_slice(&encode_message(MessageType::Text, b"x"));
        wire.extend_from_slice(&encode_message(MessageType::VideoData, &[9])[..5]);

        let mut dec = MessageDecoder::new();
        dec.push(&wire).unwrap();
        let types: Vec<_> = dec.drain_messages().map(|m| m.message_type()).collect();
        assert_eq!(
            types,
            vec![
                MessageType::Disconnect,
                MessageType::VideoData,
                MessageType::Text
            ]
        );
        assert_eq!(dec.buffered_len(), 5);
    }

    #[test]
    fn oversized_announcement_is_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32(MessageType::VideoData.code());
        buf.put_u32((MAX_PAYLOAD_LEN + 1) as u32);
        let mut dec = MessageDecoder::new();
        assert_eq!(
            dec.push(&buf),
            Err(FrameError::PayloadTooLarge {
                len: MAX_PAYLOAD_LEN + 1,
                limit: MAX_PAYLOAD_LEN
            })
        );
    }
}
