//! # Pipelines
//!
//! Glue between a [`Session`](crate::session::Session) and the codec
//! stages.
//!
//! ```text
//!  Streamer:  frame ─▶ Encoder ─▶ Annex-B units ─▶ forward ─▶ broadcast(VideoData)
//!
//!  Host:      VideoEvent ─▶ host thread ─▶ NaluStream ─▶ Decoder ─▶ display
//!                            (one active peer)
//! ```
//!
//! The host decodes a single peer at a time. The first peer to send video
//! becomes active; video from anyone else is dropped until the active
//! peer's stream ends. Each active stream gets a fresh parser and decoder,
//! so parameter sets never leak from one peer to the next.

use bytes::Bytes;
use crossbeam_channel::{bounded, select, Receiver, Sender};
use serde::Serialize;
use std::io;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use tracing::{debug, info, warn};

use crate::session::{SessionHandle, VideoEvent};
use vidlink_codec::decoder::{Decoder, DecoderStats};
use vidlink_codec::encoder::{Encoder, EncoderConfig, EncoderStats};
use vidlink_codec::engine::{CompressionEngine, RawFrame};
use vidlink_codec::error::{EncoderError, SubmitError};
use vidlink_codec::format::{MediaTime, SampleBuffer};
use vidlink_codec::stage::NaluStream;
use vidlink_transport::parser::{ParserConfig, ParserStats};
use vidlink_transport::wire::MessageType;

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Capacity of every inter-stage queue.
    pub channel_capacity: usize,
    pub parser: ParserConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig {
            channel_capacity: 64,
            parser: ParserConfig::default(),
        }
    }
}

// ─── Streamer ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize)]
pub struct StreamerStats {
    pub units_forwarded: u64,
    pub bytes_forwarded: u64,
    pub encoder: EncoderStats,
}

/// Encodes frames and broadcasts every unit to the session's peers.
pub struct StreamerPipeline {
    encoder: Encoder,
    forwarded: Arc<Mutex<StreamerStats>>,
    forward: Option<JoinHandle<()>>,
}

impl StreamerPipeline {
    pub fn start<E: CompressionEngine>(
        engine: E,
        config: EncoderConfig,
        pipeline: &PipelineConfig,
        session: SessionHandle,
    ) -> Result<Self, EncoderError> {
        let (unit_tx, unit_rx) = bounded(pipeline.channel_capacity.max(1));
        let encoder = Encoder::new(engine, config, unit_tx)?;

        let forwarded = Arc::new(Mutex::new(StreamerStats::default()));
        let stats = forwarded.clone();
        let forward = thread::Builder::new()
            .name("vidlink-forward".into())
            .spawn(move || forward_loop(unit_rx, session, stats))?;

        Ok(StreamerPipeline {
            encoder,
            forwarded,
            forward: Some(forward),
        })
    }

    pub fn encode(
        &self,
        frame: RawFrame,
        presentation: MediaTime,
        duration: MediaTime,
    ) -> Result<(), SubmitError> {
        self.encoder.encode(frame, presentation, duration)
    }

    pub fn stats(&self) -> StreamerStats {
        let mut stats = self.forwarded.lock().unwrap_or_else(|e| e.into_inner()).clone();
        stats.encoder = self.encoder.stats();
        stats
    }

    /// Flush the encoder, forward what it produced and stop. Idempotent.
    pub fn shutdown(&mut self) {
        self.encoder.shutdown();
        if let Some(forward) = self.forward.take() {
            let _ = forward.join();
        }
    }
}

impl Drop for StreamerPipeline {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn forward_loop(unit_rx: Receiver<Bytes>, session: SessionHandle, stats: Arc<Mutex<StreamerStats>>) {
    for unit in unit_rx {
        session.broadcast(MessageType::VideoData, &unit);
        let mut stats = stats.lock().unwrap_or_else(|e| e.into_inner());
        stats.units_forwarded += 1;
        stats.bytes_forwarded += unit.len() as u64;
    }
    debug!("forward loop exiting");
}

// ─── Host ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize)]
pub struct HostStats {
    pub active_peer: Option<String>,
    pub streams_started: u64,
    pub chunks_fed: u64,
    pub bytes_fed: u64,
    /// Chunks the parse queue had no room for.
    pub chunks_dropped: u64,
    /// Video from peers other than the active one.
    pub foreign_dropped: u64,
    /// Current stream only.
    pub parser: ParserStats,
    /// Current stream only.
    pub decoder: DecoderStats,
}

struct ActiveStream {
    peer: String,
    // Field order matters: the parser is flushed into the decoder before
    // the decoder stops.
    stream: NaluStream,
    decoder: Decoder,
}

impl ActiveStream {
    fn open(peer: String, config: &PipelineConfig, display_tx: Sender<SampleBuffer>) -> io::Result<Self> {
        let decoder = Decoder::spawn(config.channel_capacity, display_tx)?;
        let input = decoder.input().ok_or_else(|| io::Error::other("decoder already stopped"))?;
        let stream = NaluStream::spawn(config.parser.clone(), config.channel_capacity, input)?;
        Ok(ActiveStream {
            peer,
            stream,
            decoder,
        })
    }

    fn close(mut self) -> (ParserStats, DecoderStats) {
        self.stream.shutdown();
        self.decoder.shutdown();
        (self.stream.stats(), self.decoder.stats())
    }
}

/// Decodes the session's video into display-ready samples.
pub struct HostPipeline {
    stats: Arc<Mutex<HostStats>>,
    stop_tx: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl HostPipeline {
    pub fn spawn(
        video_rx: Receiver<VideoEvent>,
        display_tx: Sender<SampleBuffer>,
        config: PipelineConfig,
    ) -> io::Result<Self> {
        let stats = Arc::new(Mutex::new(HostStats::default()));
        let (stop_tx, stop_rx) = bounded(1);
        let thread_stats = stats.clone();
        let thread = thread::Builder::new()
            .name("vidlink-host".into())
            .spawn(move || host_loop(video_rx, stop_rx, display_tx, config, thread_stats))?;
        Ok(HostPipeline {
            stats,
            stop_tx: Some(stop_tx),
            thread: Some(thread),
        })
    }

    pub fn stats(&self) -> HostStats {
        self.stats.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Close the active stream and stop. Idempotent.
    pub fn shutdown(&mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for HostPipeline {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn host_loop(
    video_rx: Receiver<VideoEvent>,
    stop_rx: Receiver<()>,
    display_tx: Sender<SampleBuffer>,
    config: PipelineConfig,
    stats: Arc<Mutex<HostStats>>,
) {
    let mut active: Option<ActiveStream> = None;

    loop {
        let event = select! {
            recv(stop_rx) -> _ => break,
            recv(video_rx) -> event => match event {
                Ok(event) => event,
                Err(_) => break,
            },
        };

        match event {
            VideoEvent::Data { peer, data } => {
                if active.is_none() {
                    match ActiveStream::open(peer.clone(), &config, display_tx.clone()) {
                        Ok(stream) => {
                            info!(%peer, "decoding stream from peer");
                            let mut s = stats.lock().unwrap_or_else(|e| e.into_inner());
                            s.streams_started += 1;
                            s.active_peer = Some(peer.clone());
                            active = Some(stream);
                        }
                        Err(e) => {
                            warn!(%peer, error = %e, "failed to start decode stages");
                            continue;
                        }
                    }
                }
                let Some(current) = active.as_ref() else {
                    continue;
                };

                let mut s = stats.lock().unwrap_or_else(|e| e.into_inner());
                if current.peer != peer {
                    s.foreign_dropped += 1;
                    debug!(%peer, active = %current.peer, "ignoring video from inactive peer");
                    continue;
                }
                let len = data.len() as u64;
                match current.stream.feed(data) {
                    Ok(()) => {
                        s.chunks_fed += 1;
                        s.bytes_fed += len;
                    }
                    Err(_) => s.chunks_dropped += 1,
                }
                s.parser = current.stream.stats();
                s.decoder = current.decoder.stats();
            }
            VideoEvent::End { peer } => {
                if active.as_ref().is_some_and(|a| a.peer == peer) {
                    if let Some(stream) = active.take() {
                        let (parser, decoder) = stream.close();
                        info!(%peer, units = parser.units_emitted, samples = decoder.samples_delivered, "peer stream ended");
                        let mut s = stats.lock().unwrap_or_else(|e| e.into_inner());
                        s.active_peer = None;
                        s.parser = parser;
                        s.decoder = decoder;
                    }
                }
            }
        }
    }

    if let Some(stream) = active.take() {
        let (parser, decoder) = stream.close();
        let mut s = stats.lock().unwrap_or_else(|e| e.into_inner());
        s.active_peer = None;
        s.parser = parser;
        s.decoder = decoder;
    }
    debug!("host loop exiting");
}
