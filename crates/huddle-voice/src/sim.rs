//! In-process connection engine.
//!
//! Follows the offer/answer rules of a browser peer connection closely
//! enough for the negotiation layer to be exercised end to end: descriptions
//! carry the sender set as `m=<kind> <track-id> <stream-id> <label>` lines,
//! applying a remote description raises track events grouped by stream id,
//! and remote video only goes live after a warm-up.

use crate::connection::{
    ConnectionEvent, ConnectionFactory, ConnectionState, IceCandidate, IceServer, PeerConnection,
    SdpType, SenderId, SessionDescription, SignalingState,
};
use crate::media::{MediaStream, MediaTrack, ReadyState, TrackKind};
use async_trait::async_trait;
use huddle_common::{HuddleError, Result};
use rand::Rng;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

const DEFAULT_VIDEO_WARMUP: Duration = Duration::from_millis(20);

struct Created {
    local: Uuid,
    remote: Uuid,
    connection: Arc<SimConnection>,
}

/// Factory for [`SimConnection`]s. Keeps every connection it made for inspection.
pub struct SimEngine {
    video_warmup: Duration,
    created: Mutex<Vec<Created>>,
}

impl SimEngine {
    pub fn new() -> Self {
        Self::with_video_warmup(DEFAULT_VIDEO_WARMUP)
    }

    pub fn with_video_warmup(video_warmup: Duration) -> Self {
        Self {
            video_warmup,
            created: Mutex::new(Vec::new()),
        }
    }

    fn created(&self) -> MutexGuard<'_, Vec<Created>> {
        self.created.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Most recent connection `local` opened towards `remote`.
    pub fn connection(&self, local: Uuid, remote: Uuid) -> Option<Arc<SimConnection>> {
        self.created()
            .iter()
            .rev()
            .find(|c| c.local == local && c.remote == remote)
            .map(|c| c.connection.clone())
    }

    pub fn connections_from(&self, local: Uuid) -> usize {
        self.created().iter().filter(|c| c.local == local).count()
    }

    pub fn connections_between(&self, local: Uuid, remote: Uuid) -> usize {
        self.created()
            .iter()
            .filter(|c| c.local == local && c.remote == remote)
            .count()
    }
}

impl Default for SimEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionFactory for SimEngine {
    fn create(
        &self,
        local: Uuid,
        remote: Uuid,
        ice_servers: &[IceServer],
    ) -> Result<(Arc<dyn PeerConnection>, mpsc::UnboundedReceiver<ConnectionEvent>)> {
        let (tx, rx) = mpsc::unbounded_channel();
        let connection = Arc::new(SimConnection::new(local, remote, tx, self.video_warmup));

        tracing::debug!(
            local = %local,
            remote = %remote,
            ice_servers = ice_servers.len(),
            "Connection created"
        );

        self.created().push(Created {
            local,
            remote,
            connection: connection.clone(),
        });
        let connection: Arc<dyn PeerConnection> = connection;
        Ok((connection, rx))
    }
}

struct Sender {
    id: SenderId,
    track: MediaTrack,
    stream_id: String,
    active: bool,
}

struct RemoteTrack {
    track: MediaTrack,
    stream_id: String,
}

struct State {
    signaling: SignalingState,
    connection: ConnectionState,
    local_description: Option<SessionDescription>,
    remote_description: Option<SessionDescription>,
    senders: Vec<Sender>,
    next_sender: u64,
    version: u64,
    gathered: bool,
    offers_created: u32,
    applied_candidates: Vec<IceCandidate>,
    remote_tracks: HashMap<String, RemoteTrack>,
    remote_streams: HashMap<String, MediaStream>,
}

#[derive(Debug, Clone, PartialEq)]
struct Announced {
    kind: TrackKind,
    track_id: String,
    stream_id: String,
    label: String,
}

pub struct SimConnection {
    local: Uuid,
    remote: Uuid,
    ufrag: String,
    video_warmup: Duration,
    state: Mutex<State>,
    events: Mutex<Option<mpsc::UnboundedSender<ConnectionEvent>>>,
}

impl SimConnection {
    fn new(
        local: Uuid,
        remote: Uuid,
        events: mpsc::UnboundedSender<ConnectionEvent>,
        video_warmup: Duration,
    ) -> Self {
        let ufrag: String = rand::rng()
            .sample_iter(rand::distr::Alphanumeric)
            .take(8)
            .map(char::from)
            .collect();
        Self {
            local,
            remote,
            ufrag,
            video_warmup,
            state: Mutex::new(State {
                signaling: SignalingState::Stable,
                connection: ConnectionState::New,
                local_description: None,
                remote_description: None,
                senders: Vec::new(),
                next_sender: 1,
                version: 0,
                gathered: false,
                offers_created: 0,
                applied_candidates: Vec::new(),
                remote_tracks: HashMap::new(),
                remote_streams: HashMap::new(),
            }),
            events: Mutex::new(Some(events)),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn emit(&self, events: Vec<ConnectionEvent>) {
        let guard = self.events.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(tx) = guard.as_ref() {
            for event in events {
                let _ = tx.send(event);
            }
        }
    }

    pub fn local(&self) -> Uuid {
        self.local
    }

    pub fn remote(&self) -> Uuid {
        self.remote
    }

    /// Remote candidates applied so far, in order.
    pub fn applied_candidates(&self) -> Vec<IceCandidate> {
        self.state().applied_candidates.clone()
    }

    pub fn offers_created(&self) -> u32 {
        self.state().offers_created
    }

    pub fn sender_count(&self) -> usize {
        self.state().senders.len()
    }

    /// Whether the sender currently carrying `track_id` is sending.
    pub fn sender_active(&self, track_id: &str) -> Option<bool> {
        self.state()
            .senders
            .iter()
            .find(|s| s.track.id() == track_id)
            .map(|s| s.active)
    }

    pub fn remote_track_count(&self) -> usize {
        self.state().remote_tracks.len()
    }

    fn render(&self, state: &State) -> String {
        let mut sdp = format!(
            "v=0\no=huddle {} {} IN IP4 0.0.0.0\ns=-\na=ice-ufrag:{}\n",
            self.local.simple(),
            state.version,
            self.ufrag
        );
        for sender in &state.senders {
            sdp.push_str(&format!(
                "m={} {} {} {}\n",
                sender.track.kind(),
                sender.track.id(),
                sender.stream_id,
                sender.track.label()
            ));
        }
        sdp
    }

    fn host_candidate(&self) -> IceCandidate {
        let port: u16 = rand::rng().random_range(49_152..=65_535);
        IceCandidate {
            candidate: format!(
                "candidate:1 1 udp 2122260223 127.0.0.1 {port} typ host ufrag {}",
                self.ufrag
            ),
            sdp_mid: Some("0".into()),
            sdp_m_line_index: Some(0),
        }
    }

    fn check_connected(state: &mut State) -> Option<ConnectionEvent> {
        let ready = state.local_description.is_some()
            && state.remote_description.is_some()
            && !state.applied_candidates.is_empty();
        if ready && matches!(state.connection, ConnectionState::New | ConnectionState::Connecting) {
            state.connection = ConnectionState::Connected;
            return Some(ConnectionEvent::StateChange(ConnectionState::Connected));
        }
        None
    }

    /// Diff the announced set against what we have. Removals are reported
    /// first; new tracks are placed in their streams before any event goes
    /// out, so every event sees the complete grouping.
    fn apply_remote_tracks(&self, state: &mut State, announced: Vec<Announced>) -> Vec<ConnectionEvent> {
        let mut events = Vec::new();

        let gone: Vec<String> = state
            .remote_tracks
            .keys()
            .filter(|id| !announced.iter().any(|a| &a.track_id == *id))
            .cloned()
            .collect();
        for track_id in gone {
            if let Some(remote) = state.remote_tracks.remove(&track_id) {
                if let Some(stream) = state.remote_streams.get(&remote.stream_id) {
                    stream.remove_track(&track_id);
                }
                remote.track.stop();
                events.push(ConnectionEvent::TrackRemoved { track_id });
            }
        }

        let mut added = Vec::new();
        for a in announced {
            if state.remote_tracks.contains_key(&a.track_id) {
                continue;
            }
            let initial = match a.kind {
                TrackKind::Audio => ReadyState::Live,
                TrackKind::Video => ReadyState::New,
            };
            let track = MediaTrack::with_id(a.track_id.clone(), a.kind, a.label, initial);
            let stream = state
                .remote_streams
                .entry(a.stream_id.clone())
                .or_insert_with(|| MediaStream::with_id(a.stream_id.clone()))
                .clone();
            stream.add_track(track.clone());
            state.remote_tracks.insert(
                a.track_id,
                RemoteTrack {
                    track: track.clone(),
                    stream_id: a.stream_id,
                },
            );
            added.push((track, stream));
        }

        for (track, stream) in added {
            if track.kind() == TrackKind::Video {
                let warming = track.clone();
                let warmup = self.video_warmup;
                tokio::spawn(async move {
                    tokio::time::sleep(warmup).await;
                    warming.mark_live();
                });
            }
            events.push(ConnectionEvent::Track {
                track,
                streams: vec![stream],
            });
        }
        events
    }

    fn sender_index(state: &State, sender: SenderId) -> Result<usize> {
        state
            .senders
            .iter()
            .position(|s| s.id == sender)
            .ok_or_else(|| HuddleError::connection(format!("unknown sender {}", sender.0)))
    }

    fn ensure_open(state: &State, op: &'static str) -> Result<()> {
        if state.signaling == SignalingState::Closed {
            return Err(HuddleError::InvalidSignalingState {
                op,
                state: SignalingState::Closed.to_string(),
            });
        }
        Ok(())
    }
}

fn parse_tracks(sdp: &str) -> Result<Vec<Announced>> {
    if !sdp.starts_with("v=0") {
        return Err(HuddleError::connection("not a session description"));
    }
    sdp.lines()
        .filter_map(|line| line.strip_prefix("m="))
        .map(|media| {
            let mut parts = media.splitn(4, ' ');
            let kind = match parts.next() {
                Some("audio") => TrackKind::Audio,
                Some("video") => TrackKind::Video,
                other => {
                    return Err(HuddleError::connection(format!(
                        "unsupported media kind {other:?}"
                    )));
                }
            };
            let track_id = parts
                .next()
                .filter(|s| !s.is_empty())
                .ok_or_else(|| HuddleError::connection("media line without track id"))?;
            let stream_id = parts
                .next()
                .filter(|s| !s.is_empty())
                .ok_or_else(|| HuddleError::connection("media line without stream id"))?;
            Ok(Announced {
                kind,
                track_id: track_id.to_string(),
                stream_id: stream_id.to_string(),
                label: parts.next().unwrap_or_default().to_string(),
            })
        })
        .collect()
}

#[async_trait]
impl PeerConnection for SimConnection {
    fn signaling_state(&self) -> SignalingState {
        self.state().signaling
    }

    fn connection_state(&self) -> ConnectionState {
        self.state().connection
    }

    fn has_remote_description(&self) -> bool {
        self.state().remote_description.is_some()
    }

    async fn create_offer(&self) -> Result<SessionDescription> {
        let mut state = self.state();
        Self::ensure_open(&state, "create offer")?;
        state.version += 1;
        state.offers_created += 1;
        Ok(SessionDescription {
            sdp_type: SdpType::Offer,
            sdp: self.render(&state),
        })
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let mut state = self.state();
        if state.signaling != SignalingState::HaveRemoteOffer {
            return Err(HuddleError::InvalidSignalingState {
                op: "create answer",
                state: state.signaling.to_string(),
            });
        }
        state.version += 1;
        Ok(SessionDescription {
            sdp_type: SdpType::Answer,
            sdp: self.render(&state),
        })
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<()> {
        let events = {
            let mut state = self.state();
            let next = match (description.sdp_type, state.signaling) {
                (SdpType::Offer, SignalingState::Stable | SignalingState::HaveLocalOffer) => {
                    SignalingState::HaveLocalOffer
                }
                (SdpType::Answer, SignalingState::HaveRemoteOffer) => SignalingState::Stable,
                (_, current) => {
                    return Err(HuddleError::InvalidSignalingState {
                        op: "set local description",
                        state: current.to_string(),
                    });
                }
            };
            state.signaling = next;
            state.local_description = Some(description);

            let mut events = Vec::new();
            if !state.gathered {
                state.gathered = true;
                events.push(ConnectionEvent::IceCandidate(self.host_candidate()));
            }
            if state.connection == ConnectionState::New {
                state.connection = ConnectionState::Connecting;
                events.push(ConnectionEvent::StateChange(ConnectionState::Connecting));
            }
            events.extend(Self::check_connected(&mut state));
            events
        };
        self.emit(events);
        Ok(())
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        let events = {
            let mut state = self.state();
            let next = match (description.sdp_type, state.signaling) {
                (SdpType::Offer, SignalingState::Stable) => SignalingState::HaveRemoteOffer,
                (SdpType::Offer, SignalingState::HaveLocalOffer) => {
                    tracing::debug!(remote = %self.remote, "Rolling back local offer");
                    SignalingState::HaveRemoteOffer
                }
                (SdpType::Answer, SignalingState::HaveLocalOffer) => SignalingState::Stable,
                (_, current) => {
                    return Err(HuddleError::InvalidSignalingState {
                        op: "set remote description",
                        state: current.to_string(),
                    });
                }
            };
            let announced = parse_tracks(&description.sdp)?;
            state.signaling = next;
            state.remote_description = Some(description);

            let mut events = self.apply_remote_tracks(&mut state, announced);
            events.extend(Self::check_connected(&mut state));
            events
        };
        self.emit(events);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        let events = {
            let mut state = self.state();
            Self::ensure_open(&state, "add ICE candidate")?;
            if state.remote_description.is_none() {
                return Err(HuddleError::InvalidSignalingState {
                    op: "add ICE candidate",
                    state: "no remote description".into(),
                });
            }
            // Empty candidate marks end of gathering.
            if candidate.candidate.is_empty() {
                return Ok(());
            }
            state.applied_candidates.push(candidate);
            Self::check_connected(&mut state).into_iter().collect::<Vec<_>>()
        };
        self.emit(events);
        Ok(())
    }

    fn add_track(&self, track: MediaTrack, stream: &MediaStream) -> Result<SenderId> {
        let id = {
            let mut state = self.state();
            Self::ensure_open(&state, "add track")?;
            if state.senders.iter().any(|s| s.track.id() == track.id()) {
                return Err(HuddleError::connection(format!(
                    "track {} already has a sender",
                    track.id()
                )));
            }
            let id = SenderId(state.next_sender);
            state.next_sender += 1;
            state.senders.push(Sender {
                id,
                track,
                stream_id: stream.id().to_string(),
                active: true,
            });
            id
        };
        self.emit(vec![ConnectionEvent::NegotiationNeeded]);
        Ok(id)
    }

    fn remove_track(&self, sender: SenderId) -> Result<()> {
        {
            let mut state = self.state();
            Self::ensure_open(&state, "remove track")?;
            let index = Self::sender_index(&state, sender)?;
            state.senders.remove(index);
        }
        self.emit(vec![ConnectionEvent::NegotiationNeeded]);
        Ok(())
    }

    fn set_sender_active(&self, sender: SenderId, active: bool) -> Result<()> {
        let mut state = self.state();
        Self::ensure_open(&state, "toggle sender")?;
        let index = Self::sender_index(&state, sender)?;
        state.senders[index].active = active;
        Ok(())
    }

    fn close(&self) {
        {
            let mut state = self.state();
            if state.signaling == SignalingState::Closed {
                return;
            }
            state.signaling = SignalingState::Closed;
            state.connection = ConnectionState::Closed;
            for remote in state.remote_tracks.values() {
                remote.track.stop();
            }
        }
        self.events.lock().unwrap_or_else(|e| e.into_inner()).take();
        tracing::debug!(local = %self.local, remote = %self.remote, "Connection closed");
    }
}
