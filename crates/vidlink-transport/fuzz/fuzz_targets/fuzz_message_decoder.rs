#![no_main]

use libfuzzer_sys::fuzz_target;
use vidlink_transport::wire::{FrameHeader, MessageDecoder};

/// Push arbitrary bytes through the streaming message decoder.
///
/// The decoder must never panic: it either yields messages, waits for more
/// bytes, or reports an oversized announcement.
fuzz_target!(|data: &[u8]| {
    let mut decoder = MessageDecoder::new();
    for piece in data.chunks(7) {
        if decoder.push(piece).is_err() {
            return;
        }
        for msg in decoder.drain_messages() {
            assert_eq!(msg.payload.len(), msg.header.payload_len as usize);
        }
    }

    // Header re-encode must be stable for whatever the first 8 bytes are.
    if let Some(header) = FrameHeader::decode(&mut &data[..]) {
        let mut buf = bytes::BytesMut::new();
        header.encode(&mut buf);
        let re = FrameHeader::decode(&mut &buf[..]).unwrap();
        assert_eq!(re, header);
    }
});
