//! Application configuration loaded from environment variables and config files.
//!
//! Supports `.env` files for development and environment variables for production.
//! Config precedence: env vars > .env file > config.toml > defaults
//!
//! Library code never reads the global; it takes the section structs below,
//! whose `Default` impls carry the same values as the loader defaults.

use serde::Deserialize;
use std::net::IpAddr;
use std::sync::OnceLock;
use std::time::Duration;

static CONFIG: OnceLock<AppConfig> = OnceLock::new();

/// Public STUN servers. There is no TURN relay: peers behind symmetric NAT will not connect.
pub const DEFAULT_STUN_URLS: &[&str] = &[
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
    "stun:stun.cloudflare.com:3478",
];

/// Initialize the global configuration from environment.
///
/// Should be called once at application startup. Later calls return the cached value.
pub fn init() -> Result<&'static AppConfig, config::ConfigError> {
    if let Some(cfg) = CONFIG.get() {
        return Ok(cfg);
    }

    // Load .env file if present (development)
    let _ = dotenvy::dotenv();

    let stun_urls: Vec<String> = DEFAULT_STUN_URLS.iter().map(|s| s.to_string()).collect();

    let cfg = config::Config::builder()
        .set_default("signaling.backend", "memory")?
        .set_default("signaling.subscribe_timeout_ms", 10_000)?
        .set_default("signaling.signal_ttl_secs", 3_600)?
        .set_default("signaling.feed_capacity", 256)?
        .set_default("negotiation.stabilize_timeout_ms", 100)?
        .set_default("negotiation.stabilize_poll_ms", 10)?
        .set_default("negotiation.video_ready_timeout_ms", 500)?
        .set_default("ice.stun_urls", stun_urls)?
        .set_default("ice.engine", "rtc")?
        .set_default("audio.sample_rate", 48_000)?
        .set_default("audio.frame_size", 480)? // 10ms at 48kHz, one RNNoise frame
        .set_default("audio.mic_gain", 1.0)?
        .set_default("audio.sound_gain", 1.0)?
        .set_default("audio.noise_suppression", true)?
        .set_default("audio.echo_cancellation", true)?
        .set_default("audio.auto_gain_control", true)?
        .set_default("audio.soundpad_routing", "mixed")?
        // Optional config file
        .add_source(config::File::with_name("config").required(false))
        // Environment variables (HUDDLE__SIGNALING__REDIS_URL, HUDDLE__AUDIO__MIC_GAIN, etc.)
        .add_source(
            config::Environment::with_prefix("HUDDLE")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("ice.stun_urls")
                .try_parsing(true),
        )
        .build()?;

    let app_config: AppConfig = cfg.try_deserialize()?;
    Ok(CONFIG.get_or_init(|| app_config))
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub signaling: SignalingConfig,
    pub negotiation: NegotiationConfig,
    pub ice: IceConfig,
    pub audio: AudioConfig,
}

/// Where signals are persisted and pushed from.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SignalBackend {
    /// In-process only; both parties must live in the same process.
    Memory,
    /// Redis lists for replay plus pub/sub for live delivery.
    Redis,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SignalingConfig {
    pub backend: SignalBackend,
    /// Redis connection URL, required when `backend = "redis"`.
    pub redis_url: Option<String>,
    /// Upper bound for opening a feed and replaying history.
    pub subscribe_timeout_ms: u64,
    /// Persisted signals expire after this even if nobody purges them.
    pub signal_ttl_secs: u64,
    /// Buffered signals per subscription before the producer waits.
    pub feed_capacity: usize,
}

impl SignalingConfig {
    pub fn subscribe_timeout(&self) -> Duration {
        Duration::from_millis(self.subscribe_timeout_ms)
    }
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            backend: SignalBackend::Memory,
            redis_url: None,
            subscribe_timeout_ms: 10_000,
            signal_ttl_secs: 3_600,
            feed_capacity: 256,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct NegotiationConfig {
    /// How long an incoming offer waits for the connection to return to `stable`.
    pub stabilize_timeout_ms: u64,
    pub stabilize_poll_ms: u64,
    /// Remote video is held back at most this long waiting for its first frame.
    pub video_ready_timeout_ms: u64,
}

impl NegotiationConfig {
    pub fn stabilize_timeout(&self) -> Duration {
        Duration::from_millis(self.stabilize_timeout_ms)
    }

    pub fn stabilize_poll(&self) -> Duration {
        Duration::from_millis(self.stabilize_poll_ms.max(1))
    }

    pub fn video_ready_timeout(&self) -> Duration {
        Duration::from_millis(self.video_ready_timeout_ms)
    }
}

impl Default for NegotiationConfig {
    fn default() -> Self {
        Self {
            stabilize_timeout_ms: 100,
            stabilize_poll_ms: 10,
            video_ready_timeout_ms: 500,
        }
    }
}

/// Which implementation backs peer connections.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionEngine {
    /// Real SDP, ICE and DTLS over UDP.
    Rtc,
    /// In-process connections that exchange no packets.
    Sim,
}

#[derive(Debug, Deserialize, Clone)]
pub struct IceConfig {
    pub stun_urls: Vec<String>,
    pub engine: ConnectionEngine,
    /// Address host candidates are gathered on. Unset picks the outbound interface.
    #[serde(default)]
    pub host_ip: Option<IpAddr>,
}

impl Default for IceConfig {
    fn default() -> Self {
        Self {
            stun_urls: DEFAULT_STUN_URLS.iter().map(|s| s.to_string()).collect(),
            engine: ConnectionEngine::Rtc,
            host_ip: None,
        }
    }
}

/// How soundboard audio reaches remote peers.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum SoundpadRouting {
    /// Mixed into the single outbound voice track.
    Mixed,
    /// Sent as a second plain audio track, negotiated after the microphone.
    SeparateTrack,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AudioConfig {
    pub sample_rate: u32,
    pub frame_size: usize,
    pub mic_gain: f32,
    pub sound_gain: f32,
    pub noise_suppression: bool,
    pub echo_cancellation: bool,
    pub auto_gain_control: bool,
    pub soundpad_routing: SoundpadRouting,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: 48_000,
            frame_size: 480,
            mic_gain: 1.0,
            sound_gain: 1.0,
            noise_suppression: true,
            echo_cancellation: true,
            auto_gain_control: true,
            soundpad_routing: SoundpadRouting::Mixed,
        }
    }
}
