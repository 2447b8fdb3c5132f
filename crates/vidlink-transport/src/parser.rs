//! # NALU Stream Parser
//!
//! Pure logic, no I/O. Accepts an Annex-B byte stream in arbitrarily sized
//! chunks and cuts it into [`NalUnit`]s at `00 00 00 01` start codes.
//!
//! ## Scanning
//!
//! The parser keeps a growable accumulation buffer and a scan position. The
//! scan position only ever moves forward, and is reset to zero only after a
//! confirmed consume (a start code was found and everything up to and
//! including it was removed from the buffer). At each position `i` the window
//! `[i, i+3]` is inspected:
//!
//! ```text
//!   window == 00 00 00 01  → boundary: emit buf[..i], drop i+4 bytes, i = 0
//!   buf[i+3] != 0          → no start code can begin in i+1..=i+3, i += 4
//!   otherwise              → i += 1
//! ```
//!
//! Scanning stops when fewer than four bytes remain ahead of `i` and resumes
//! from the same position on the next [`NaluParser::feed`]. Because the scan
//! position is a pure function of the buffered bytes, the emitted sequence is
//! independent of how the stream was chunked.
//!
//! ## Overflow
//!
//! When more than `max_pending` bytes pile up without a start code the buffer
//! is dropped and the parser enters resync: the bytes up to the next start
//! code are the tail of the dropped unit and are discarded, never emitted.

use bytes::{Buf, BytesMut};
use serde::Serialize;
use std::collections::VecDeque;
use thiserror::Error;
use tracing::{debug, trace};

use crate::nal::{NalUnit, START_CODE};

/// Default bound on bytes buffered without seeing a start code (16 MiB).
pub const DEFAULT_MAX_PENDING: usize = 16 * 1024 * 1024;

// ─── Errors ─────────────────────────────────────────────────────────────────

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// The stream ran past `limit` bytes without a start code. The buffered
    /// bytes were discarded; parsing resumes at the next start code.
    #[error("pending NAL data overflow: {pending} bytes buffered, limit {limit}")]
    Overflow { pending: usize, limit: usize },
}

// ─── Configuration ──────────────────────────────────────────────────────────

/// Parser configuration.
#[derive(Debug, Clone)]
pub struct ParserConfig {
    /// Maximum bytes held while waiting for the next start code.
    pub max_pending: usize,
}

impl Default for ParserConfig {
    fn default() -> Self {
        ParserConfig {
            max_pending: DEFAULT_MAX_PENDING,
        }
    }
}

/// Parser counters.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ParserStats {
    /// Total bytes fed.
    pub bytes_fed: u64,
    /// Units emitted.
    pub units_emitted: u64,
    /// Boundaries with nothing between them.
    pub empty_segments: u64,
    /// Overflow resets.
    pub overflows: u64,
    /// Bytes thrown away by overflow resets and `finish`.
    pub bytes_discarded: u64,
}

// ─── Parser ─────────────────────────────────────────────────────────────────

/// Incremental Annex-B splitter. One instance per connection.
pub struct NaluParser {
    config: ParserConfig,
    buf: BytesMut,
    scan_pos: usize,
    units: VecDeque<NalUnit>,
    /// Set after an overflow until the next start code.
    resyncing: bool,
    stats: ParserStats,
}

impl NaluParser {
    pub fn new(config: ParserConfig) -> Self {
        NaluParser {
            config,
            buf: BytesMut::new(),
            scan_pos: 0,
            units: VecDeque::new(),
            resyncing: false,
            stats: ParserStats::default(),
        }
    }

    /// Append a chunk and cut out every unit it completes.
    ///
    /// Completed units are queued for [`drain_units`](Self::drain_units).
    /// On overflow the units completed before the overflow stay queued.
    pub fn feed(&mut self, data: &[u8]) -> Result<(), ParseError> {
        self.stats.bytes_fed += data.len() as u64;
        self.buf.extend_from_slice(data);
        self.scan();

        if self.buf.len() > self.config.max_pending {
            let pending = self.buf.len();
            self.stats.overflows += 1;
            self.stats.bytes_discarded += pending as u64;
            self.buf.clear();
            self.scan_pos = 0;
            self.resyncing = true;
            return Err(ParseError::Overflow {
                pending,
                limit: self.config.max_pending,
            });
        }
        Ok(())
    }

    fn scan(&mut self) {
        while self.scan_pos + START_CODE.len() <= self.buf.len() {
            let i = self.scan_pos;
            let window = &self.buf[i..i + START_CODE.len()];

            if window == START_CODE {
                if self.resyncing {
                    // Tail of the unit dropped on overflow.
                    self.resyncing = false;
                    self.stats.bytes_discarded += i as u64;
                    self.buf.advance(i);
                    debug!(bytes = i, "resynchronised after overflow");
                } else if i == 0 {
                    self.stats.empty_segments += 1;
                } else {
                    let segment = self.buf.split_to(i).freeze();
                    // Non-empty by construction, so `new` always succeeds.
                    if let Some(unit) = NalUnit::new(segment) {
                        trace!(kind = %unit.kind(), len = unit.len(), "nal unit");
                        self.stats.units_emitted += 1;
                        self.units.push_back(unit);
                    }
                }
                self.buf.advance(START_CODE.len());
                self.scan_pos = 0;
            } else if window[3] != 0 {
                self.scan_pos += 4;
            } else {
                self.scan_pos += 1;
            }
        }
    }

    /// Take every unit completed so far, in stream order.
    pub fn drain_units(&mut self) -> impl Iterator<Item = NalUnit> + '_ {
        self.units.drain(..)
    }

    /// End of stream. The trailing partial unit can never be completed, so it
    /// is discarded; returns how many bytes were dropped.
    pub fn finish(&mut self) -> usize {
        let dropped = self.buf.len();
        if dropped > 0 {
            debug!(bytes = dropped, "discarding incomplete trailing NAL unit");
        }
        self.stats.bytes_discarded += dropped as u64;
        self.buf.clear();
        self.scan_pos = 0;
        self.resyncing = false;
        dropped
    }

    /// Bytes buffered but not yet part of an emitted unit.
    pub fn pending_len(&self) -> usize {
        self.buf.len()
    }

    pub fn stats(&self) -> &ParserStats {
        &self.stats
    }
}

impl Default for NaluParser {
    fn default() -> Self {
        Self::new(ParserConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nal::NalKind;

    fn parse_all(parser: &mut NaluParser, data: &[u8]) -> Vec<NalUnit> {
        parser.feed(data).unwrap();
        parser.drain_units().collect()
    }

    #[test]
    fn splits_at_start_codes() {
        let stream = [
            0, 0, 0, 1, 0x67, 0x42, 0, 0, 0, 1, 0x68, 0xCE, 0, 0, 0, 1, 0x65, 0x88, 0x84, 0, 0,
            0, 1,
        ];
        let mut parser = NaluParser::default();
        let units = parse_all(&mut parser, &stream);
        let kinds: Vec<_> = units.iter().map(NalUnit::kind).collect();
        assert_eq!(
            kinds,
            vec![
                NalKind::SequenceParams,
                NalKind::PictureParams,
                NalKind::CodedSlice
            ]
        );
        assert_eq!(&units[0].payload()[..], &[0x67, 0x42]);
        assert_eq!(&units[2].payload()[..], &[0x65, 0x88, 0x84]);
        assert_eq!(parser.pending_len(), 0);
    }

    #[test]
    fn trailing_unit_waits_for_next_start_code() {
        let mut parser = NaluParser::default();
        let units = parse_all(&mut parser, &[0, 0, 0, 1, 0x41, 1, 2, 3]);
        assert!(units.is_empty());
        assert_eq!(parser.pending_len(), 4);

        let units = parse_all(&mut parser, &[0, 0, 0, 1]);
        assert_eq!(units.len(), 1);
        assert_eq!(&units[0].payload()[..], &[0x41, 1, 2, 3]);
    }

    #[test]
    fn back_to_back_start_codes_yield_nothing() {
        let mut parser = NaluParser::default();
        let units = parse_all(&mut parser, &[0, 0, 0, 1, 0, 0, 0, 1, 0, 0, 0, 1]);
        assert!(units.is_empty());
        assert_eq!(parser.stats().empty_segments, 3);
        assert_eq!(parser.stats().units_emitted, 0);
    }

    #[test]
    fn leading_bytes_before_first_start_code_form_a_unit() {
        let mut parser = NaluParser::default();
        let units = parse_all(&mut parser, &[0x41, 0xAA, 0, 0, 0, 1]);
        assert_eq!(units.len(), 1);
        assert_eq!(&units[0].payload()[..], &[0x41, 0xAA]);
    }

    #[test]
    fn three_byte_start_code_is_not_a_boundary() {
        let mut parser = NaluParser::default();
        let units = parse_all(&mut parser, &[0, 0, 0, 1, 0x41, 0, 0, 1, 0x41, 0, 0, 0, 1]);
        assert_eq!(units.len(), 1);
        assert_eq!(&units[0].payload()[..], &[0x41, 0, 0, 1, 0x41]);
    }

    #[test]
    fn start_code_split_across_feeds() {
        let mut parser = NaluParser::default();
        assert!(parse_all(&mut parser, &[0, 0, 0, 1, 0x41, 7, 0]).is_empty());
        assert!(parse_all(&mut parser, &[0]).is_empty());
        let units = parse_all(&mut parser, &[0, 1, 0x68]);
        assert_eq!(units.len(), 1);
        assert_eq!(&units[0].payload()[..], &[0x41, 7]);
        assert_eq!(parser.pending_len(), 1);
    }

    #[test]
    fn extra_leading_zero_stays_with_previous_unit() {
        // 00 00 00 00 01: the boundary is the last four bytes.
        let mut parser = NaluParser::default();
        let units = parse_all(&mut parser, &[0, 0, 0, 1, 0x41, 5, 0, 0, 0, 0, 1]);
        assert_eq!(units.len(), 1);
        assert_eq!(&units[0].payload()[..], &[0x41, 5, 0]);
    }

    #[test]
    fn finish_discards_partial_tail() {
        let mut parser = NaluParser::default();
        parser.feed(&[0, 0, 0, 1, 0x41, 1, 2]).unwrap();
        assert_eq!(parser.finish(), 3);
        assert_eq!(parser.pending_len(), 0);
        assert_eq!(parser.drain_units().count(), 0);
    }

    #[test]
    fn overflow_resets_and_resynchronises() {
        let mut parser = NaluParser::new(ParserConfig { max_pending: 8 });
        let err = parser.feed(&[0x41; 16]).unwrap_err();
        assert_eq!(
            err,
            ParseError::Overflow {
                pending: 16,
                limit: 8
            }
        );
        assert_eq!(parser.pending_len(), 0);

        let units = parse_all(&mut parser, &[0, 0, 0, 1, 0x41, 1, 0, 0, 0, 1]);
        assert_eq!(units.len(), 1);
        assert_eq!(parser.stats().overflows, 1);
    }

    #[test]
    fn overflow_drops_the_rest_of_the_oversized_unit() {
        let mut parser = NaluParser::new(ParserConfig { max_pending: 8 });
        let mut stream = vec![0, 0, 0, 1, 0x65];
        stream.extend_from_slice(&[0xAA; 10]);
        assert!(parser.feed(&stream).is_err());

        // 67 42 AA is still the overflowed slice, not a parameter set.
        let units = parse_all(&mut parser, &[0x67, 0x42, 0xAA, 0, 0, 0, 1, 0x41, 1, 0, 0, 0, 1]);
        assert_eq!(units.len(), 1);
        assert_eq!(units[0].kind(), NalKind::CodedSlice);
        assert_eq!(&units[0].payload()[..], &[0x41, 1]);
        // 11 bytes at the overflow, 3 more while resyncing.
        assert_eq!(parser.stats().bytes_discarded, 11 + 3);
    }
}
