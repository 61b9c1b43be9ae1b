//! # huddle
//!
//! Command-line harness around the Huddle libraries:
//! - `demo`: a voice channel with synthetic participants in one process
//! - `call`: a direct call between two synthetic participants
//! - `purge`: delete persisted signals for a session
//! - `windows`: parse a capture-helper window listing from stdin

use clap::{Parser, Subcommand};
use huddle_common::config::{AppConfig, ConnectionEngine, SignalBackend};
use huddle_common::HuddleError;
use huddle_signal::{MemorySignalStore, RedisSignalStore, SignalStore};
use huddle_voice::capture::CaptureWindow;
use huddle_voice::connection::{ConnectionFactory, ConnectionState};
use huddle_voice::devices::{DisplayConstraints, SyntheticDevices};
use huddle_voice::membership::MemoryMembership;
use huddle_voice::mixer::SoundClip;
use huddle_voice::registry::ProcessorRegistry;
use huddle_voice::rtc::RtcEngine;
use huddle_voice::sim::SimEngine;
use huddle_voice::{
    CallState, DirectCallSession, MediaStream, SessionContext, SessionEvents, StreamRole,
    VoiceChannelSession, VoiceConfig,
};
use std::io::Read;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "huddle", version, about = "Peer-to-peer voice sessions")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a voice channel with synthetic participants.
    Demo {
        #[arg(short, long, default_value_t = 3)]
        participants: usize,
        /// How long everyone stays connected.
        #[arg(long, default_value_t = 1_000)]
        hold_ms: u64,
        /// The first participant shares their screen.
        #[arg(long)]
        share: bool,
    },
    /// Place and accept a direct call between two synthetic participants.
    Call {
        #[arg(long, default_value_t = 1_000)]
        hold_ms: u64,
        /// The callee rejects instead of accepting.
        #[arg(long)]
        reject: bool,
    },
    /// Delete persisted signals of a session.
    Purge {
        #[arg(long)]
        session: Uuid,
        /// Only signals addressed to this participant.
        #[arg(long)]
        recipient: Option<Uuid>,
    },
    /// Parse a `pid;handle;title` window listing from stdin.
    Windows {
        #[arg(long)]
        json: bool,
    },
}

/// Logs everything a session reports, tagged with whose session it is.
struct LogEvents {
    who: usize,
}

impl SessionEvents for LogEvents {
    fn on_stream(&self, peer: Uuid, role: StreamRole, stream: &MediaStream) {
        tracing::info!(who = self.who, peer = %peer, role = ?role, tracks = stream.len(), "Stream");
    }

    fn on_connection_state(&self, peer: Uuid, state: ConnectionState) {
        tracing::info!(who = self.who, peer = %peer, state = %state, "Connection");
    }

    fn on_link_failed(&self, peer: Uuid, error: &HuddleError) {
        tracing::warn!(who = self.who, peer = %peer, code = error.error_code(), error = %error, "Link failed");
    }

    fn on_call_state(&self, state: CallState) {
        tracing::info!(who = self.who, state = %state, "Call");
    }

    fn on_remote_screen_share(&self, peer: Uuid, active: bool) {
        tracing::info!(who = self.who, peer = %peer, active, "Remote screen share");
    }
}

async fn open_store(config: &AppConfig) -> anyhow::Result<Arc<dyn SignalStore>> {
    match config.signaling.backend {
        SignalBackend::Memory => Ok(Arc::new(MemorySignalStore::with_capacity(
            config.signaling.feed_capacity,
        ))),
        SignalBackend::Redis => {
            let url = config
                .signaling
                .redis_url
                .as_deref()
                .ok_or_else(|| anyhow::anyhow!("signaling.redis_url is required for the redis backend"))?;
            Ok(Arc::new(RedisSignalStore::connect(url, &config.signaling).await?))
        }
    }
}

fn open_engine(config: &AppConfig) -> Arc<dyn ConnectionFactory> {
    match config.ice.engine {
        ConnectionEngine::Rtc => {
            let engine = RtcEngine::new(&config.ice);
            tracing::info!(host = %engine.host_ip(), "Using str0m peer connections");
            Arc::new(engine)
        }
        ConnectionEngine::Sim => Arc::new(SimEngine::new()),
    }
}

/// Shared pieces of an in-process network.
struct Harness {
    store: Arc<dyn SignalStore>,
    engine: Arc<dyn ConnectionFactory>,
    membership: Arc<MemoryMembership>,
    config: VoiceConfig,
}

impl Harness {
    async fn new(config: &AppConfig) -> anyhow::Result<Self> {
        Ok(Self {
            store: open_store(config).await?,
            engine: open_engine(config),
            membership: Arc::new(MemoryMembership::new()),
            config: VoiceConfig::from(config),
        })
    }

    fn participant(&self, who: usize) -> SessionContext {
        SessionContext {
            local_id: Uuid::new_v4(),
            store: self.store.clone(),
            factory: self.engine.clone(),
            devices: Arc::new(SyntheticDevices::new()),
            membership: self.membership.clone(),
            processors: Arc::new(ProcessorRegistry::new()),
            config: self.config.clone(),
            events: Arc::new(LogEvents { who }),
        }
    }
}

async fn run_demo(config: &AppConfig, participants: usize, hold: Duration, share: bool) -> anyhow::Result<()> {
    let harness = Harness::new(config).await?;
    let channel = Uuid::new_v4();
    tracing::info!(channel = %channel, participants, "Starting voice channel demo");

    let mut sessions = Vec::with_capacity(participants);
    for who in 0..participants {
        let session = VoiceChannelSession::join(harness.participant(who), channel).await?;
        sessions.push(session);
    }

    if let Some(first) = sessions.first() {
        if share {
            first.toggle_screen_share(&DisplayConstraints::default()).await?;
        }
        let chime: Vec<f32> = (0..4_800)
            .map(|i| (i as f32 * 440.0 * std::f32::consts::TAU / 48_000.0).sin() * 0.2)
            .collect();
        first.play_sound(&SoundClip::new("chime", chime)).await?;
    }

    tokio::time::sleep(hold).await;

    for (who, session) in sessions.iter().enumerate() {
        let report = session.leave().await;
        tracing::info!(
            who,
            links_closed = report.links_closed,
            tracks_stopped = report.tracks_stopped,
            "Left"
        );
    }
    Ok(())
}

async fn run_call(config: &AppConfig, hold: Duration, reject: bool) -> anyhow::Result<()> {
    let harness = Harness::new(config).await?;
    let caller_ctx = harness.participant(0);
    let callee_ctx = harness.participant(1);
    let (caller_id, callee_id) = (caller_ctx.local_id, callee_ctx.local_id);

    let caller = DirectCallSession::start(caller_ctx, callee_id).await?;
    let callee = DirectCallSession::incoming(callee_ctx, caller.call_id(), caller_id).await?;

    if reject {
        callee.reject().await?;
    } else {
        callee.accept().await?;
        tokio::time::sleep(hold).await;
        let report = caller.end_call().await;
        tracing::info!(
            links_closed = report.links_closed,
            tracks_stopped = report.tracks_stopped,
            "Caller hung up"
        );
    }

    // Let the other side observe the ending.
    tokio::time::sleep(Duration::from_millis(100)).await;
    tracing::info!(caller = %caller.state(), callee = %callee.state(), "Call finished");
    Ok(())
}

async fn run_purge(config: &AppConfig, session: Uuid, recipient: Option<Uuid>) -> anyhow::Result<()> {
    let store = open_store(config).await?;
    let purged = store.purge(session, recipient).await?;
    tracing::info!(session = %session, recipient = ?recipient, purged, "Signals purged");
    println!("{purged}");
    Ok(())
}

fn run_windows(json: bool) -> anyhow::Result<()> {
    let mut listing = String::new();
    std::io::stdin().read_to_string(&mut listing)?;
    let windows = CaptureWindow::parse_listing(&listing);
    if json {
        println!("{}", serde_json::to_string_pretty(&windows)?);
    } else {
        for window in &windows {
            println!("{:>8}  {:<12}  {}", window.pid, window.handle, window.title);
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = huddle_common::config::init()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "huddle=debug,huddle_voice=debug,huddle_signal=debug".into()),
        )
        .with_target(true)
        .with_thread_ids(true)
        .init();

    tracing::info!("Huddle v{}", env!("CARGO_PKG_VERSION"));

    match Cli::parse().command {
        Command::Demo {
            participants,
            hold_ms,
            share,
        } => run_demo(config, participants, Duration::from_millis(hold_ms), share).await,
        Command::Call { hold_ms, reject } => run_call(config, Duration::from_millis(hold_ms), reject).await,
        Command::Purge { session, recipient } => run_purge(config, session, recipient).await,
        Command::Windows { json } => run_windows(json),
    }
}
