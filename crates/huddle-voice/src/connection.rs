//! Peer connection seam.
//!
//! The rest of the crate talks to a WebRTC-style connection only through
//! [`PeerConnection`] and the [`ConnectionEvent`] stream its factory hands
//! back. The in-process engine in [`crate::sim`] implements both.

use crate::media::{MediaStream, MediaTrack};
use async_trait::async_trait;
use huddle_common::config::IceConfig;
use huddle_common::Result;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingState {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
    Closed,
}

impl std::fmt::Display for SignalingState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Stable => "stable",
            Self::HaveLocalOffer => "have-local-offer",
            Self::HaveRemoteOffer => "have-remote-offer",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

/// Payload of `offer` and `answer` signals.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

/// Payload of `ice-candidate` signals.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default)]
    pub sdp_mid: Option<String>,
    #[serde(default)]
    pub sdp_m_line_index: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::New => "new",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Failed => "failed",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Handle to one outgoing track on a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SenderId(pub u64);

/// Things the connection reports asynchronously.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// A remote track arrived, with the remote streams it is grouped in.
    /// The streams already contain every track announced together with it.
    Track {
        track: MediaTrack,
        streams: Vec<MediaStream>,
    },
    TrackRemoved { track_id: String },
    /// A local candidate was gathered and must be sent to the peer.
    IceCandidate(IceCandidate),
    StateChange(ConnectionState),
    /// The local sender set changed.
    NegotiationNeeded,
}

/// STUN/TURN server entry handed to the connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    pub username: Option<String>,
    pub credential: Option<String>,
}

impl IceServer {
    /// One credential-less entry per configured STUN url.
    pub fn from_config(config: &IceConfig) -> Vec<Self> {
        config
            .stun_urls
            .iter()
            .map(|url| Self {
                urls: vec![url.clone()],
                username: None,
                credential: None,
            })
            .collect()
    }
}

/// One peer-to-peer media connection.
#[async_trait]
pub trait PeerConnection: Send + Sync {
    fn signaling_state(&self) -> SignalingState;
    fn connection_state(&self) -> ConnectionState;
    fn has_remote_description(&self) -> bool;
    /// Senders an answer could not carry; the owner should offer them.
    fn needs_offer(&self) -> bool {
        false
    }

    async fn create_offer(&self) -> Result<SessionDescription>;
    async fn create_answer(&self) -> Result<SessionDescription>;
    async fn set_local_description(&self, description: SessionDescription) -> Result<()>;
    /// Applying a remote offer while a local offer is pending rolls the local offer back.
    async fn set_remote_description(&self, description: SessionDescription) -> Result<()>;
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;

    fn add_track(&self, track: MediaTrack, stream: &MediaStream) -> Result<SenderId>;
    fn remove_track(&self, sender: SenderId) -> Result<()>;
    /// Stop or resume sending media on a sender without renegotiating.
    fn set_sender_active(&self, sender: SenderId, active: bool) -> Result<()>;

    fn close(&self);
}

/// Creates connections between a local and a remote participant.
pub trait ConnectionFactory: Send + Sync {
    fn create(
        &self,
        local: Uuid,
        remote: Uuid,
        ice_servers: &[IceServer],
    ) -> Result<(Arc<dyn PeerConnection>, mpsc::UnboundedReceiver<ConnectionEvent>)>;
}
