//! Synthetic I420 test pattern: diagonal luma bars that drift one step per
//! frame over a slowly rotating chroma tint.

use bytes::{BufMut, BytesMut};
use vidlink_codec::engine::RawFrame;
use vidlink_codec::error::CodecError;

pub struct TestPattern {
    width: u32,
    height: u32,
    frame: u64,
}

impl TestPattern {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            frame: 0,
        }
    }

    pub fn frames_generated(&self) -> u64 {
        self.frame
    }

    pub fn next_frame(&mut self) -> Result<RawFrame, CodecError> {
        let (w, h) = (self.width as usize, self.height as usize);
        let shift = (self.frame % 256) as usize;
        let mut buf = BytesMut::with_capacity(RawFrame::i420_len(self.width, self.height));

        for y in 0..h {
            for x in 0..w {
                let band = ((x + y + shift * 4) / 16) % 8;
                buf.put_u8(16 + (band as u8) * 29);
            }
        }
        let (cw, ch) = (w / 2, h / 2);
        let tint = (self.frame / 4 % 256) as u8;
        for plane_offset in [0u8, 128] {
            let value = tint.wrapping_add(plane_offset);
            for _ in 0..cw * ch {
                buf.put_u8(value);
            }
        }

        self.frame += 1;
        RawFrame::new(self.width, self.height, buf.freeze())
    }
}
