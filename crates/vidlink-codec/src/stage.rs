//! # Parse Stage
//!
//! Runs a [`NaluParser`] on its own thread so socket readers never do the
//! start-code scan. One stage per incoming video stream.

use bytes::Bytes;
use crossbeam_channel::{bounded, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread;
use tracing::{debug, warn};

use crate::error::SubmitError;
use vidlink_transport::nal::NalUnit;
use vidlink_transport::parser::{NaluParser, ParserConfig, ParserStats};

/// Threaded Annex-B splitter.
///
/// Chunks handed to [`feed`](Self::feed) are parsed in order; every unit
/// completed is forwarded to the unit channel, blocking if it is full.
pub struct NaluStream {
    chunk_tx: Option<Sender<Bytes>>,
    stats: Arc<Mutex<ParserStats>>,
    handle: Option<thread::JoinHandle<()>>,
}

impl NaluStream {
    pub fn spawn(
        config: ParserConfig,
        queue_capacity: usize,
        unit_tx: Sender<NalUnit>,
    ) -> std::io::Result<Self> {
        let (chunk_tx, chunk_rx) = bounded(queue_capacity.max(1));
        let stats = Arc::new(Mutex::new(ParserStats::default()));
        let thread_stats = stats.clone();
        let handle = thread::Builder::new()
            .name("vidlink-parse".into())
            .spawn(move || parse_loop(NaluParser::new(config), chunk_rx, unit_tx, thread_stats))?;
        Ok(NaluStream {
            chunk_tx: Some(chunk_tx),
            stats,
            handle: Some(handle),
        })
    }

    /// Queue a chunk of the byte stream. Never blocks; a full queue drops
    /// the chunk and the parser resynchronises at the next start code.
    pub fn feed(&self, chunk: Bytes) -> Result<(), SubmitError> {
        let tx = self.chunk_tx.as_ref().ok_or(SubmitError::Disconnected)?;
        let result = tx.try_send(chunk).map_err(SubmitError::from);
        if result == Err(SubmitError::Full) {
            warn!("parse queue full, dropping stream chunk");
        }
        result
    }

    pub fn stats(&self) -> ParserStats {
        self.stats.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Parse what is queued, discard the trailing partial unit and stop.
    /// Idempotent.
    pub fn shutdown(&mut self) {
        self.chunk_tx = None;
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for NaluStream {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn parse_loop(
    mut parser: NaluParser,
    chunk_rx: Receiver<Bytes>,
    unit_tx: Sender<NalUnit>,
    stats: Arc<Mutex<ParserStats>>,
) {
    for chunk in chunk_rx {
        if let Err(e) = parser.feed(&chunk) {
            warn!(error = %e, "NAL parser overflow, resynchronising");
        }
        for unit in parser.drain_units() {
            if unit_tx.send(unit).is_err() {
                debug!("unit receiver gone, parse thread exiting");
                return;
            }
        }
        *stats.lock().unwrap_or_else(|e| e.into_inner()) = parser.stats().clone();
    }
    parser.finish();
    *stats.lock().unwrap_or_else(|e| e.into_inner()) = parser.stats().clone();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use vidlink_transport::nal::NalKind;

    #[test]
    fn units_cross_chunk_boundaries() {
        let (unit_tx, unit_rx) = bounded(16);
        let mut stream = NaluStream::spawn(ParserConfig::default(), 16, unit_tx).unwrap();
        stream.feed(Bytes::from_static(&[0, 0, 0, 1, 0x67, 0x42, 0, 0])).unwrap();
        stream.feed(Bytes::from_static(&[0, 1, 0x68, 0xCE, 0, 0, 0, 1, 0x65])).unwrap();

        let first = unit_rx.recv_timeout(Duration::from_secs(2)).unwrap();
        let second = unit_rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(first.kind(), NalKind::SequenceParams);
        assert_eq!(&first.payload()[..], &[0x67, 0x42]);
        assert_eq!(second.kind(), NalKind::PictureParams);

        stream.shutdown();
        assert!(unit_rx.try_recv().is_err());
        let stats = stream.stats();
        assert_eq!(stats.units_emitted, 2);
        assert_eq!(stats.bytes_discarded, 1);
        assert_eq!(stream.feed(Bytes::new()), Err(SubmitError::Disconnected));
    }
}
