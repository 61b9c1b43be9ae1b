//! One peer-to-peer link inside a session.
//!
//! A link owns its connection and its subscription to the peer's signals.
//! Two background pumps feed it: connection events and inbound signals. Both
//! hold only a weak reference, so a closed or dropped link is never touched
//! again by late events.

use crate::classify::{StreamRole, TrackClassifier, TrackRole};
use crate::connection::{
    ConnectionEvent, ConnectionFactory, ConnectionState, IceCandidate, IceServer, PeerConnection,
    SenderId, SignalingState,
};
use crate::media::{MediaStream, MediaTrack, ReadyState, TrackKind};
use crate::negotiate::{Negotiator, Outcome};
use huddle_common::config::NegotiationConfig;
use huddle_common::{HuddleError, Result};
use huddle_signal::{Signal, SignalKind, SignalSink, SignalingChannel, Subscription};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use uuid::Uuid;

/// Listener for what happens on a link. Every method defaults to a no-op.
pub trait PeerLinkEvents: Send + Sync {
    fn on_voice_stream(&self, _peer: Uuid, _stream: &MediaStream) {}
    fn on_screen_share_stream(&self, _peer: Uuid, _stream: &MediaStream) {}
    fn on_soundpad_stream(&self, _peer: Uuid, _stream: &MediaStream) {}
    fn on_remote_stream(&self, _peer: Uuid, _stream: &MediaStream) {}
    fn on_ice_candidate(&self, _peer: Uuid, _candidate: &IceCandidate) {}
    fn on_connection_state_change(&self, _peer: Uuid, _state: ConnectionState) {}
    fn on_renegotiation_needed(&self, _peer: Uuid) {}
}

/// Reports from a link to the session that owns it.
#[derive(Debug)]
pub enum LinkNotice {
    /// A non-negotiation signal (call control, screen-share announcements).
    Control { peer: Uuid, signal: Signal },
    /// An offer was answered or an answer was applied.
    Negotiated { peer: Uuid, outcome: Outcome },
    NegotiationFailed { peer: Uuid, error: HuddleError },
    ConnectionState { peer: Uuid, state: ConnectionState },
}

/// Everything a session hands each link it opens.
#[derive(Clone)]
pub struct LinkContext {
    pub local_id: Uuid,
    pub signals: Arc<SignalingChannel>,
    pub factory: Arc<dyn ConnectionFactory>,
    pub ice_servers: Vec<IceServer>,
    pub negotiation: NegotiationConfig,
    pub events: Arc<dyn PeerLinkEvents>,
    pub notices: mpsc::UnboundedSender<LinkNotice>,
}

struct LocalSender {
    sender: SenderId,
    track_id: String,
    stream_id: String,
    kind: TrackKind,
}

pub struct PeerLink {
    peer: Uuid,
    conn: Arc<dyn PeerConnection>,
    sink: Arc<dyn SignalSink>,
    negotiator: Negotiator,
    classifier: Mutex<TrackClassifier>,
    senders: Mutex<Vec<LocalSender>>,
    events: Arc<dyn PeerLinkEvents>,
    notices: mpsc::UnboundedSender<LinkNotice>,
    video_ready_timeout: Duration,
    closed: AtomicBool,
    tasks: Mutex<Vec<AbortHandle>>,
}

fn guard<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl PeerLink {
    /// Create the connection, subscribe to the peer's signals, attach the
    /// outbound streams in order, and start the pumps.
    ///
    /// A failed subscription is fatal: the connection is closed and the
    /// error returned, nothing keeps running.
    pub async fn open(ctx: &LinkContext, peer: Uuid, outbound: &[MediaStream]) -> Result<Arc<Self>> {
        let (conn, conn_events) = ctx.factory.create(ctx.local_id, peer, &ctx.ice_servers)?;

        let subscription = match ctx.signals.subscribe(peer).await {
            Ok(subscription) => subscription,
            Err(e) => {
                tracing::error!(peer = %peer, error = %e, "Could not subscribe to peer signals");
                conn.close();
                return Err(e);
            }
        };

        let sink: Arc<dyn SignalSink> = ctx.signals.clone();
        let link = Arc::new(Self {
            peer,
            negotiator: Negotiator::new(peer, conn.clone(), sink.clone(), ctx.negotiation.clone()),
            conn,
            sink,
            classifier: Mutex::new(TrackClassifier::new(peer)),
            senders: Mutex::new(Vec::new()),
            events: ctx.events.clone(),
            notices: ctx.notices.clone(),
            video_ready_timeout: ctx.negotiation.video_ready_timeout(),
            closed: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        });

        for stream in outbound {
            if let Err(e) = link.attach_stream(stream) {
                link.close();
                return Err(e);
            }
        }

        link.spawn_pumps(conn_events, subscription);
        tracing::info!(peer = %peer, streams = outbound.len(), "Peer link opened");
        Ok(link)
    }

    fn spawn_pumps(
        self: &Arc<Self>,
        mut conn_events: mpsc::UnboundedReceiver<ConnectionEvent>,
        mut signals: Subscription,
    ) {
        let weak = Arc::downgrade(self);
        let events_pump = tokio::spawn(async move {
            while let Some(event) = conn_events.recv().await {
                let Some(link) = weak.upgrade() else { break };
                link.handle_connection_event(event).await;
            }
        });

        let weak: Weak<Self> = Arc::downgrade(self);
        let signal_pump = tokio::spawn(async move {
            while let Some(signal) = signals.next().await {
                let Some(link) = weak.upgrade() else { break };
                link.handle_signal(signal).await;
            }
        });

        self.track_task(events_pump.abort_handle());
        self.track_task(signal_pump.abort_handle());
    }

    fn track_task(&self, handle: AbortHandle) {
        let mut tasks = guard(&self.tasks);
        tasks.retain(|t| !t.is_finished());
        tasks.push(handle);
    }

    pub fn peer(&self) -> Uuid {
        self.peer
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn signaling_state(&self) -> SignalingState {
        self.conn.signaling_state()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.conn.connection_state()
    }

    pub async fn pending_candidates(&self) -> usize {
        self.negotiator.pending_candidates().await
    }

    /// Current handle to one of the peer's inbound streams.
    pub fn stream(&self, role: StreamRole) -> MediaStream {
        guard(&self.classifier).stream(role).clone()
    }

    pub fn sender_count(&self) -> usize {
        guard(&self.senders).len()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(HuddleError::LinkClosed { peer: self.peer });
        }
        Ok(())
    }

    /// Send `offer` to the peer.
    pub async fn initiate(&self) -> Result<()> {
        self.ensure_open()?;
        self.negotiator.initiate().await
    }

    pub async fn renegotiate(&self) -> Result<()> {
        self.ensure_open()?;
        self.negotiator.renegotiate().await
    }

    /// Start sending every track of `stream` not already sent, in stream order.
    pub fn attach_stream(&self, stream: &MediaStream) -> Result<usize> {
        self.ensure_open()?;
        let mut senders = guard(&self.senders);
        let mut added = 0;
        for track in stream.tracks() {
            if senders.iter().any(|s| s.track_id == track.id()) {
                continue;
            }
            let track_id = track.id().to_string();
            let kind = track.kind();
            let sender = self.conn.add_track(track, stream)?;
            senders.push(LocalSender {
                sender,
                track_id,
                stream_id: stream.id().to_string(),
                kind,
            });
            added += 1;
        }
        tracing::debug!(peer = %self.peer, stream = stream.id(), added, "Stream attached");
        Ok(added)
    }

    /// Stop sending every track that was attached from `stream`.
    pub fn detach_stream(&self, stream: &MediaStream) -> Result<usize> {
        self.ensure_open()?;
        let mut senders = guard(&self.senders);
        let mut removed = 0;
        let mut kept = Vec::with_capacity(senders.len());
        for local in senders.drain(..) {
            if local.stream_id == stream.id() {
                self.conn.remove_track(local.sender)?;
                removed += 1;
            } else {
                kept.push(local);
            }
        }
        *senders = kept;
        tracing::debug!(peer = %self.peer, stream = stream.id(), removed, "Stream detached");
        Ok(removed)
    }

    /// Pause or resume the audio senders of the voice stream (mute).
    pub fn set_voice_sending(&self, voice: &MediaStream, sending: bool) -> Result<()> {
        self.ensure_open()?;
        let senders = guard(&self.senders);
        for local in senders
            .iter()
            .filter(|s| s.stream_id == voice.id() && s.kind == TrackKind::Audio)
        {
            self.conn.set_sender_active(local.sender, sending)?;
        }
        Ok(())
    }

    /// Close the connection and stop the pumps. Local capture is left
    /// alone; the session owns it. Returns `false` if already closed.
    pub fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        for task in guard(&self.tasks).drain(..) {
            task.abort();
        }
        self.conn.close();
        tracing::info!(peer = %self.peer, "Peer link closed");
        true
    }

    pub(crate) async fn handle_connection_event(self: &Arc<Self>, event: ConnectionEvent) {
        if self.is_closed() {
            tracing::trace!(peer = %self.peer, "Connection event after close ignored");
            return;
        }

        match event {
            ConnectionEvent::Track { track, streams } => self.on_remote_track(track, &streams),
            ConnectionEvent::TrackRemoved { track_id } => {
                let changed = guard(&self.classifier).remove(&track_id);
                tracing::debug!(peer = %self.peer, track = %track_id, buckets = changed.len(), "Remote track removed");
                self.notify(&changed);
            }
            ConnectionEvent::IceCandidate(candidate) => self.send_candidate(candidate).await,
            ConnectionEvent::StateChange(state) => {
                tracing::debug!(peer = %self.peer, state = %state, "Connection state changed");
                self.events.on_connection_state_change(self.peer, state);
                let _ = self.notices.send(LinkNotice::ConnectionState {
                    peer: self.peer,
                    state,
                });
            }
            ConnectionEvent::NegotiationNeeded => self.events.on_renegotiation_needed(self.peer),
        }
    }

    fn on_remote_track(self: &Arc<Self>, track: MediaTrack, streams: &[MediaStream]) {
        let role = guard(&self.classifier).classify(&track, streams);
        tracing::debug!(
            peer = %self.peer,
            track = track.id(),
            kind = %track.kind(),
            role = ?role,
            "Remote track classified"
        );

        if role != TrackRole::ScreenShareVideo || track.ready_state() != ReadyState::New {
            self.expose(role, &track);
            return;
        }

        // Hold new video back until its first frame, but not for long.
        let weak = Arc::downgrade(self);
        let timeout = self.video_ready_timeout;
        let waiter = tokio::spawn(async move {
            if !track.wait_live(timeout).await {
                tracing::debug!(track = track.id(), "Remote video not live yet; exposing anyway");
            }
            if let Some(link) = weak.upgrade() {
                link.expose(role, &track);
            }
        });
        self.track_task(waiter.abort_handle());
    }

    fn expose(&self, role: TrackRole, track: &MediaTrack) {
        if self.is_closed() || track.ready_state() == ReadyState::Ended {
            return;
        }
        let changed = guard(&self.classifier).admit(role, track);
        self.notify(&changed);
    }

    fn notify(&self, changed: &[StreamRole]) {
        for role in changed {
            let stream = self.stream(*role);
            match role {
                StreamRole::Voice => self.events.on_voice_stream(self.peer, &stream),
                StreamRole::ScreenShare => self.events.on_screen_share_stream(self.peer, &stream),
                StreamRole::Soundpad => self.events.on_soundpad_stream(self.peer, &stream),
                StreamRole::Remote => self.events.on_remote_stream(self.peer, &stream),
            }
        }
    }

    async fn send_candidate(&self, candidate: IceCandidate) {
        self.events.on_ice_candidate(self.peer, &candidate);
        let sent = match serde_json::to_value(&candidate) {
            Ok(payload) => self
                .sink
                .send(self.peer, SignalKind::IceCandidate, payload)
                .await
                .map(|_| ()),
            Err(e) => Err(e.into()),
        };
        if let Err(e) = sent {
            if self.is_closed() {
                return;
            }
            tracing::warn!(peer = %self.peer, error = %e, "Failed to send ICE candidate");
            let _ = self.notices.send(LinkNotice::NegotiationFailed {
                peer: self.peer,
                error: e,
            });
        }
    }

    pub(crate) async fn handle_signal(self: &Arc<Self>, signal: Signal) {
        if self.is_closed() {
            return;
        }
        if signal.kind.is_control() {
            let _ = self.notices.send(LinkNotice::Control {
                peer: self.peer,
                signal,
            });
            return;
        }

        match self.negotiator.handle_signal(&signal).await {
            Ok(Outcome::Unchanged) => {}
            Ok(outcome) => {
                let _ = self.notices.send(LinkNotice::Negotiated {
                    peer: self.peer,
                    outcome,
                });
                if self.conn.needs_offer() && self.signaling_state() == SignalingState::Stable {
                    tracing::debug!(peer = %self.peer, "Offering senders the answer left out");
                    if let Err(e) = self.negotiator.renegotiate().await {
                        if !self.is_closed() {
                            let _ = self.notices.send(LinkNotice::NegotiationFailed {
                                peer: self.peer,
                                error: e,
                            });
                        }
                    }
                }
            }
            Err(e) if self.is_closed() => {
                tracing::debug!(peer = %self.peer, error = %e, "Negotiation error after close ignored");
            }
            Err(e) => {
                tracing::error!(peer = %self.peer, kind = %signal.kind, error = %e, "Negotiation failed");
                let _ = self.notices.send(LinkNotice::NegotiationFailed {
                    peer: self.peer,
                    error: e,
                });
            }
        }
    }
}

impl Drop for PeerLink {
    fn drop(&mut self) {
        self.close();
    }
}
