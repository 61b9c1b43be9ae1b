//! # huddle-voice
//!
//! Peer-to-peer audio/video sessions on top of the signal relay.
//!
//! ## Architecture
//!
//! ```text
//!  VoiceChannelSession / DirectCallSession
//!        │  one per remote participant
//!        ▼
//!     PeerLink ──── Negotiator (offer/answer, rollback, ICE buffering)
//!        │   │
//!        │   └──── SignalingChannel (huddle-signal)
//!        ▼
//!   PeerConnection (trait; RtcEngine over str0m, SimEngine in-process)
//!        │ inbound tracks
//!        ▼
//!   TrackClassifier ──► PlaybackRouter ──► SessionEvents
//! ```
//!
//! Local capture goes through [`devices::MediaDevices`] and the
//! [`mixer::AudioMixer`], which sums the soundboard into (or beside) the
//! outbound voice track and runs RNNoise on it.

pub mod capture;
pub mod classify;
pub mod connection;
pub mod devices;
pub mod link;
pub mod media;
pub mod membership;
pub mod mixer;
pub mod negotiate;
pub mod playback;
pub mod registry;
pub mod rtc;
pub mod session;
pub mod sim;

#[cfg(test)]
mod testkit;

use huddle_common::config::{AppConfig, AudioConfig, IceConfig, NegotiationConfig, SignalingConfig};

pub use classify::{StreamRole, TrackRole};
pub use link::{PeerLink, PeerLinkEvents};
pub use media::{MediaStream, MediaTrack, TrackKind};
pub use session::{
    CallDirection, CallState, DirectCallSession, EndReason, SessionContext, SessionEvents,
    TeardownReport, VoiceChannelSession,
};

/// The configuration sections a session reads.
#[derive(Debug, Clone, Default)]
pub struct VoiceConfig {
    pub signaling: SignalingConfig,
    pub negotiation: NegotiationConfig,
    pub ice: IceConfig,
    pub audio: AudioConfig,
}

impl From<&AppConfig> for VoiceConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            signaling: config.signaling.clone(),
            negotiation: config.negotiation.clone(),
            ice: config.ice.clone(),
            audio: config.audio.clone(),
        }
    }
}
