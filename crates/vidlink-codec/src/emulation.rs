//! Emulation prevention.
//!
//! Inside a NAL unit the byte pattern `00 00 0x` (x ≤ 3) is forbidden so the
//! payload can never be mistaken for a start code. The encoder inserts an
//! `0x03` after every pair of zero bytes that would otherwise be followed by
//! such a byte; readers strip it again before parsing the RBSP.

/// Escape an RBSP into a NAL payload.
pub fn escape(rbsp: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(rbsp.len() + rbsp.len() / 64 + 1);
    let mut zeros = 0usize;
    for &b in rbsp {
        if zeros >= 2 && b <= 3 {
            out.push(0x03);
            zeros = 0;
        }
        out.push(b);
        zeros = if b == 0 { zeros + 1 } else { 0 };
    }
    out
}

/// Strip emulation-prevention bytes from a NAL payload.
pub fn unescape(ebsp: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(ebsp.len());
    let mut zeros = 0usize;
    for &b in ebsp {
        if zeros >= 2 && b == 0x03 {
            zeros = 0;
            continue;
        }
        out.push(b);
        zeros = if b == 0 { zeros + 1 } else { 0 };
    }
    out
}
