//! # vidlink
//!
//! LAN video link node. One machine streams, the other hosts.
//!
//! ## Usage
//!
//! ```bash
//! # Stream a 640x480 test pattern to whoever connects
//! vidlink stream --listen 0.0.0.0:7878
//!
//! # Connect to a streamer and decode, writing raw I420 frames to a file
//! vidlink host --peer camera=192.168.1.20:7878 --dump frames.yuv
//!
//! # Everything from a config file
//! vidlink --config vidlink.toml host
//! ```

mod pattern;

use std::fs::File;
use std::io::{BufWriter, Write};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context};
use clap::{Parser, Subcommand};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError};
use tracing_subscriber::EnvFilter;

use pattern::TestPattern;
use vidlink_codec::format::MediaTime;
use vidlink_codec::intra::{render, IntraEngine};
use vidlink_session::config::NodeConfig;
use vidlink_session::connection::Endpoint;
use vidlink_session::discovery::StaticDiscovery;
use vidlink_session::listener::PeerListener;
use vidlink_session::pipeline::{HostPipeline, StreamerPipeline};
use vidlink_session::session::{Role, Session, SessionEvent};

const STATS_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
#[command(name = "vidlink", about = "Stream H.264 video between two machines on a LAN")]
struct Cli {
    /// TOML config file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Node name override.
    #[arg(long, global = true)]
    name: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Encode a synthetic test pattern and stream it to connecting hosts.
    Stream {
        /// Listen address override.
        #[arg(long)]
        listen: Option<SocketAddr>,

        #[arg(long)]
        width: Option<u32>,

        #[arg(long)]
        height: Option<u32>,

        #[arg(long)]
        fps: Option<u32>,

        /// Stop after this many frames.
        #[arg(long)]
        frames: Option<u64>,
    },
    /// Connect to streamers, then decode and render what they send.
    Host {
        /// Extra peer as NAME=ADDR. Repeatable.
        #[arg(long = "peer", value_parser = parse_peer)]
        peers: Vec<Endpoint>,

        /// Append rendered I420 frames to this file.
        #[arg(long)]
        dump: Option<PathBuf>,
    },
}

fn parse_peer(s: &str) -> Result<Endpoint, String> {
    let (name, addr) = s
        .split_once('=')
        .ok_or_else(|| format!("expected NAME=ADDR, got {s:?}"))?;
    let addr = addr
        .parse()
        .map_err(|e| format!("bad peer address {addr:?}: {e}"))?;
    Ok(Endpoint::new(name.trim(), addr))
}

fn main() -> anyhow::Result<()> {
    // ── Logging ─────────────────────────────────────────────────
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(true)
        .compact()
        .init();

    // ── Config ──────────────────────────────────────────────────
    let cli = Cli::parse();
    let mut config = match &cli.config {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("reading config {}", path.display()))?;
            NodeConfig::from_toml_str(&text)
                .with_context(|| format!("loading config {}", path.display()))?
        }
        None => NodeConfig::default(),
    };
    if let Some(name) = cli.name {
        config.name = name;
    }

    // ── Graceful shutdown ───────────────────────────────────────
    let running = Arc::new(AtomicBool::new(true));
    {
        let running = running.clone();
        ctrlc::set_handler(move || {
            tracing::info!("shutting down...");
            running.store(false, Ordering::Relaxed);
        })
        .context("installing Ctrl-C handler")?;
    }

    match cli.command {
        Command::Stream {
            listen,
            width,
            height,
            fps,
            frames,
        } => {
            if let Some(listen) = listen {
                config.network.listen = listen;
            }
            if let Some(width) = width {
                config.video.width = width;
            }
            if let Some(height) = height {
                config.video.height = height;
            }
            if let Some(fps) = fps {
                config.video.fps = fps;
            }
            config.video.validate().context("invalid video settings")?;
            run_streamer(&config, frames, &running)
        }
        Command::Host { peers, dump } => {
            config.network.peers.extend(peers);
            run_host(&config, dump, &running)
        }
    }
}

// ─── Streamer ───────────────────────────────────────────────────────────────

fn run_streamer(config: &NodeConfig, max_frames: Option<u64>, running: &AtomicBool) -> anyhow::Result<()> {
    tracing::info!(
        name = %config.name,
        listen = %config.network.listen,
        width = config.video.width,
        height = config.video.height,
        fps = config.video.fps,
        "vidlink streamer starting"
    );

    let mut session = Session::new(config.session_config(Role::Streamer)).context("starting session")?;
    let events = session.events();
    let mut listener = PeerListener::bind(config.network.listen, session.handle())
        .with_context(|| format!("binding {}", config.network.listen))?;
    let mut pipeline = StreamerPipeline::start(
        IntraEngine::new(),
        config.encoder_config(),
        &config.pipeline,
        session.handle(),
    )
    .context("starting encoder")?;

    let mut pattern = TestPattern::new(config.video.width, config.video.height);
    let frame_interval = Duration::from_secs(1) / config.video.fps;
    let fps = config.video.fps;
    let mut next_frame = Instant::now();
    let mut last_stats_log = Instant::now();

    while running.load(Ordering::Relaxed) {
        if max_frames.is_some_and(|max| pattern.frames_generated() >= max) {
            break;
        }
        drain_events(&events);

        if session.connection_count() > 0 {
            let n = pattern.frames_generated() as i64;
            let frame = pattern.next_frame()?;
            let _ = pipeline.encode(frame, MediaTime::new(n, fps), MediaTime::new(1, fps));
        }

        next_frame += frame_interval;
        let now = Instant::now();
        if next_frame > now {
            std::thread::sleep(next_frame - now);
        } else {
            next_frame = now;
        }

        if last_stats_log.elapsed() >= STATS_INTERVAL {
            let stats = pipeline.stats();
            tracing::info!(
                peers = session.connection_count(),
                frames = stats.encoder.frames_submitted,
                dropped = stats.encoder.frames_dropped,
                keyframes = stats.encoder.keyframes,
                units = stats.units_forwarded,
                bytes = stats.bytes_forwarded,
                "streamer stats"
            );
            last_stats_log = Instant::now();
        }
    }

    // ── Cleanup ─────────────────────────────────────────────────
    pipeline.shutdown();
    session.send_disconnect_to_all();
    listener.shutdown();
    session.shutdown();

    let stats = pipeline.stats();
    tracing::debug!(stats = %serde_json::to_string(&stats)?, "final streamer stats");
    tracing::info!(
        frames = stats.encoder.frames_submitted,
        bytes = stats.bytes_forwarded,
        "vidlink streamer stopped"
    );
    Ok(())
}

// ─── Host ───────────────────────────────────────────────────────────────────

fn run_host(config: &NodeConfig, dump: Option<PathBuf>, running: &AtomicBool) -> anyhow::Result<()> {
    if config.network.peers.is_empty() {
        return Err(anyhow!("no peers configured; pass --peer NAME=ADDR or add [[network.peers]]"));
    }
    tracing::info!(name = %config.name, peers = config.network.peers.len(), "vidlink host starting");

    let mut session = Session::new(config.session_config(Role::Host)).context("starting session")?;
    let events = session.events();
    session
        .start_discovery(Box::new(StaticDiscovery::new(config.network.peers.clone())))
        .context("starting discovery")?;

    let (display_tx, display_rx) = bounded(config.pipeline.channel_capacity);
    let mut host = HostPipeline::spawn(session.video(), display_tx, config.pipeline.clone())
        .context("starting decode pipeline")?;

    for peer in session.discovered_peers().iter() {
        if let Err(e) = session.create_connection(peer) {
            tracing::warn!(%peer, error = %e, "could not start connection");
        }
    }

    let mut sink = match &dump {
        Some(path) => Some(BufWriter::new(
            File::create(path).with_context(|| format!("creating {}", path.display()))?,
        )),
        None => None,
    };

    // ── Display loop ────────────────────────────────────────────
    let mut frames_rendered: u64 = 0;
    let mut last_stats_log = Instant::now();

    while running.load(Ordering::Relaxed) {
        match display_rx.recv_timeout(Duration::from_millis(100)) {
            Ok(sample) => match render(&sample) {
                Ok(frame) => {
                    frames_rendered += 1;
                    if let Some(sink) = sink.as_mut() {
                        sink.write_all(frame.data()).context("writing frame dump")?;
                    }
                }
                Err(e) => tracing::warn!(error = %e, "failed to render sample"),
            },
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
        drain_events(&events);

        if last_stats_log.elapsed() >= STATS_INTERVAL {
            let stats = host.stats();
            tracing::info!(
                peers = session.connection_count(),
                active = ?stats.active_peer,
                frames = frames_rendered,
                bytes = stats.bytes_fed,
                units = stats.parser.units_emitted,
                slices_dropped = stats.decoder.slices_dropped,
                foreign_dropped = stats.foreign_dropped,
                "host stats"
            );
            last_stats_log = Instant::now();
        }
    }

    // ── Cleanup ─────────────────────────────────────────────────
    session.send_disconnect_to_all();
    session.shutdown();
    host.shutdown();
    if let Some(mut sink) = sink {
        sink.flush().context("flushing frame dump")?;
    }

    let stats = host.stats();
    tracing::debug!(stats = %serde_json::to_string(&stats)?, "final host stats");
    tracing::info!(frames = frames_rendered, streams = stats.streams_started, "vidlink host stopped");
    Ok(())
}

fn drain_events(events: &Receiver<SessionEvent>) {
    for event in events.try_iter() {
        match event {
            SessionEvent::PeersChanged(peers) => {
                tracing::info!(count = peers.len(), "discovered peers changed")
            }
            SessionEvent::Connected { peer } => tracing::info!(%peer, "peer connected"),
            SessionEvent::ConnectionFailed { peer, error } => {
                tracing::warn!(%peer, %error, "connection failed")
            }
            SessionEvent::ConnectionClosed { peer } => tracing::info!(%peer, "connection closed"),
            SessionEvent::Text { peer, text } => tracing::info!(%peer, %text, "message"),
            SessionEvent::PeerDisconnected { peer } => tracing::info!(%peer, "peer disconnected"),
            SessionEvent::SendFailed { peer, error } => {
                tracing::debug!(%peer, %error, "send failed")
            }
        }
    }
}
