//! Peer connections on top of `str0m`.
//!
//! str0m is sans-IO: every connection owns a UDP socket and a driver task
//! that feeds datagrams and timeouts into the [`Rtc`] and flushes whatever
//! it wants to transmit. The offer/answer surface of [`PeerConnection`] is
//! mapped onto str0m's `SdpApi`:
//!
//! - Each side offers its own senders as `sendonly` m-lines. An answer
//!   cannot add media, so after answering, a side with unsent senders
//!   reports [`PeerConnection::needs_offer`] and the link offers them.
//! - Remote tracks are read from the remote description's `a=mid`,
//!   `a=msid` and direction attributes, so stream grouping survives.
//! - Applying a remote offer while our own is pending drops the pending
//!   offer; its senders go out with the next one.

use crate::connection::{
    ConnectionEvent, ConnectionFactory, ConnectionState, IceCandidate, IceServer, PeerConnection,
    SdpType, SenderId, SessionDescription, SignalingState,
};
use crate::media::{MediaStream, MediaTrack, ReadyState, TrackKind};
use async_trait::async_trait;
use huddle_common::config::IceConfig;
use huddle_common::{HuddleError, Result};
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;
use str0m::change::{SdpAnswer, SdpOffer, SdpPendingOffer};
use str0m::media::{Direction, MediaKind, Mid};
use str0m::net::{Protocol, Receive};
use str0m::{Candidate, Event, IceConnectionState, Input, Output, Rtc, RtcError};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Notify};
use tokio::task::AbortHandle;
use uuid::Uuid;

/// Largest datagram we expect; anything longer is truncated by the socket.
const MTU: usize = 2000;

/// Pick the address of the interface that routes to the internet. Nothing
/// is sent: connecting a UDP socket only resolves the route.
fn outbound_ip() -> IpAddr {
    std::net::UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))
        .and_then(|socket| {
            socket.connect((Ipv4Addr::new(192, 0, 2, 1), 9))?;
            socket.local_addr()
        })
        .map(|addr| addr.ip())
        .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST))
}

fn sdp_error(what: &str, e: impl std::fmt::Display) -> HuddleError {
    HuddleError::connection(format!("{what}: {e}"))
}

fn media_kind(kind: TrackKind) -> MediaKind {
    match kind {
        TrackKind::Audio => MediaKind::Audio,
        TrackKind::Video => MediaKind::Video,
    }
}

/// Factory for [`RtcConnection`]s. Must be used from within a Tokio runtime.
pub struct RtcEngine {
    host_ip: IpAddr,
}

impl RtcEngine {
    /// Host candidates on `ice.host_ip`, or on the outbound interface when unset.
    pub fn new(config: &IceConfig) -> Self {
        Self::with_host_ip(config.host_ip.unwrap_or_else(outbound_ip))
    }

    pub fn with_host_ip(host_ip: IpAddr) -> Self {
        Self { host_ip }
    }

    pub fn host_ip(&self) -> IpAddr {
        self.host_ip
    }
}

impl ConnectionFactory for RtcEngine {
    fn create(
        &self,
        local: Uuid,
        remote: Uuid,
        ice_servers: &[IceServer],
    ) -> Result<(Arc<dyn PeerConnection>, mpsc::UnboundedReceiver<ConnectionEvent>)> {
        let bind = SocketAddr::new(self.host_ip, 0);
        let socket = std::net::UdpSocket::bind(bind)
            .and_then(|socket| {
                socket.set_nonblocking(true)?;
                Ok(socket)
            })
            .and_then(UdpSocket::from_std)
            .map_err(|e| HuddleError::connection(format!("could not bind {bind}: {e}")))?;
        let local_addr = socket
            .local_addr()
            .map_err(|e| HuddleError::connection(format!("socket has no address: {e}")))?;

        let mut rtc = Rtc::builder().build(Instant::now());
        let candidate = Candidate::host(local_addr, Protocol::Udp)
            .map_err(|e| sdp_error("host candidate", e))?;
        rtc.add_local_candidate(candidate.clone());

        // TODO: gather server-reflexive candidates from `ice_servers`; only host candidates are offered.
        tracing::debug!(
            local = %local,
            remote = %remote,
            addr = %local_addr,
            ice_servers = ice_servers.len(),
            "Connection created"
        );

        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            state: Mutex::new(State::new(rtc, candidate)),
            wake: Notify::new(),
            events: Mutex::new(Some(tx)),
        });
        let driver = tokio::spawn(drive(shared.clone(), socket, local_addr, remote));

        let connection: Arc<dyn PeerConnection> = Arc::new(RtcConnection {
            local,
            remote,
            shared,
            driver: driver.abort_handle(),
        });
        Ok((connection, rx))
    }
}

struct Sender {
    id: SenderId,
    track_id: String,
    stream_id: String,
    kind: TrackKind,
    /// Set once an offer carried the sender.
    mid: Option<Mid>,
    active: bool,
}

struct PendingOffer {
    sdp: String,
    pending: SdpPendingOffer,
    /// Senders that got their m-line in this offer.
    adding: Vec<SenderId>,
    /// M-lines this offer turns inactive.
    retiring: Vec<Mid>,
}

struct RemoteTrack {
    track: MediaTrack,
    stream_id: String,
}

/// A sending m-line announced by the remote description.
#[derive(Debug, Clone, PartialEq)]
struct Announced {
    mid: String,
    kind: TrackKind,
    stream_id: String,
    track_id: String,
}

struct State {
    rtc: Rtc,
    local_candidate: Candidate,
    signaling: SignalingState,
    connection: ConnectionState,
    offer: Option<PendingOffer>,
    answer: Option<String>,
    has_remote: bool,
    gathered: bool,
    senders: Vec<Sender>,
    next_sender: u64,
    /// M-lines of removed senders still to be turned inactive.
    retired: Vec<Mid>,
    /// Keyed by mid.
    remote_tracks: HashMap<String, RemoteTrack>,
    remote_streams: HashMap<String, MediaStream>,
}

impl State {
    fn new(rtc: Rtc, local_candidate: Candidate) -> Self {
        Self {
            rtc,
            local_candidate,
            signaling: SignalingState::Stable,
            connection: ConnectionState::New,
            offer: None,
            answer: None,
            has_remote: false,
            gathered: false,
            senders: Vec::new(),
            next_sender: 1,
            retired: Vec::new(),
            remote_tracks: HashMap::new(),
            remote_streams: HashMap::new(),
        }
    }

    fn ensure_open(&self, op: &'static str) -> Result<()> {
        if self.signaling == SignalingState::Closed {
            return Err(HuddleError::InvalidSignalingState {
                op,
                state: SignalingState::Closed.to_string(),
            });
        }
        Ok(())
    }

    fn wrong_state(&self, op: &'static str) -> HuddleError {
        HuddleError::InvalidSignalingState {
            op,
            state: self.signaling.to_string(),
        }
    }

    fn needs_offer(&self) -> bool {
        self.signaling != SignalingState::Closed
            && (self.senders.iter().any(|s| s.mid.is_none()) || !self.retired.is_empty())
    }

    fn set_connection(&mut self, next: ConnectionState, events: &mut Vec<ConnectionEvent>) {
        if self.connection != next && self.connection != ConnectionState::Closed {
            self.connection = next;
            events.push(ConnectionEvent::StateChange(next));
        }
    }

    /// Our pending offer lost to a remote one: its senders go out next time.
    fn roll_back(&mut self) {
        if let Some(offer) = self.offer.take() {
            for sender in self.senders.iter_mut().filter(|s| offer.adding.contains(&s.id)) {
                sender.mid = None;
            }
            tracing::debug!(senders = offer.adding.len(), "Local offer rolled back");
        }
    }

    fn sender_index(&self, sender: SenderId) -> Result<usize> {
        self.senders
            .iter()
            .position(|s| s.id == sender)
            .ok_or_else(|| HuddleError::connection(format!("unknown sender {}", sender.0)))
    }

    /// Diff the announced set against the tracks we have, removals first.
    fn apply_remote_tracks(&mut self, announced: Vec<Announced>) -> Vec<ConnectionEvent> {
        let mut events = Vec::new();

        let gone: Vec<String> = self
            .remote_tracks
            .keys()
            .filter(|mid| !announced.iter().any(|a| &a.mid == *mid))
            .cloned()
            .collect();
        for mid in gone {
            if let Some(remote) = self.remote_tracks.remove(&mid) {
                if let Some(stream) = self.remote_streams.get(&remote.stream_id) {
                    stream.remove_track(remote.track.id());
                }
                remote.track.stop();
                events.push(ConnectionEvent::TrackRemoved {
                    track_id: remote.track.id().to_string(),
                });
            }
        }

        let mut added = Vec::new();
        for a in announced {
            if self.remote_tracks.contains_key(&a.mid) {
                continue;
            }
            // Video stays `New` until its first packet.
            let initial = match a.kind {
                TrackKind::Audio => ReadyState::Live,
                TrackKind::Video => ReadyState::New,
            };
            let track = MediaTrack::with_id(a.track_id, a.kind, format!("remote {}", a.kind), initial);
            let stream = self
                .remote_streams
                .entry(a.stream_id.clone())
                .or_insert_with(|| MediaStream::with_id(a.stream_id.clone()))
                .clone();
            stream.add_track(track.clone());
            self.remote_tracks.insert(
                a.mid,
                RemoteTrack {
                    track: track.clone(),
                    stream_id: a.stream_id,
                },
            );
            added.push((track, stream));
        }

        events.extend(added.into_iter().map(|(track, stream)| ConnectionEvent::Track {
            track,
            streams: vec![stream],
        }));
        events
    }

    fn on_event(&mut self, event: Event, events: &mut Vec<ConnectionEvent>) {
        match event {
            Event::Connected => self.set_connection(ConnectionState::Connected, events),
            Event::IceConnectionStateChange(ice) => match ice {
                IceConnectionState::New | IceConnectionState::Checking => {
                    self.set_connection(ConnectionState::Connecting, events)
                }
                IceConnectionState::Disconnected => {
                    self.set_connection(ConnectionState::Disconnected, events)
                }
                // DTLS still has to finish; `Event::Connected` follows.
                _ => {}
            },
            Event::MediaData(data) => {
                if let Some(remote) = self.remote_tracks.get(&data.mid.to_string()) {
                    remote.track.mark_live();
                }
            }
            _ => {}
        }
    }

    /// Drain str0m's output until it asks to be woken at a deadline.
    fn poll(
        &mut self,
        transmits: &mut Vec<(SocketAddr, Vec<u8>)>,
        events: &mut Vec<ConnectionEvent>,
    ) -> std::result::Result<Instant, RtcError> {
        loop {
            match self.rtc.poll_output()? {
                Output::Timeout(at) => return Ok(at),
                Output::Transmit(t) => transmits.push((t.destination, t.contents.to_vec())),
                Output::Event(event) => self.on_event(event, events),
            }
        }
    }
}

/// Parse the sending audio/video m-lines of a description.
///
/// A line counts when its port is not zero and its direction is `sendrecv`
/// (the default) or `sendonly`. Without an `a=msid` the mid stands in for
/// both ids, which puts the track in a stream of its own.
fn announced_tracks(sdp: &str) -> Vec<Announced> {
    #[derive(Default)]
    struct Section {
        kind: Option<TrackKind>,
        open: bool,
        sending: bool,
        mid: Option<String>,
        msid: Option<(String, Option<String>)>,
    }

    impl Section {
        fn finish(self) -> Option<Announced> {
            let kind = self.kind?;
            let mid = self.mid?;
            if !self.open || !self.sending {
                return None;
            }
            let (stream_id, track_id) = match self.msid {
                Some((stream, track)) if stream != "-" => (stream, track),
                Some((_, track)) => (format!("mid-{mid}"), track),
                None => (format!("mid-{mid}"), None),
            };
            Some(Announced {
                track_id: track_id.unwrap_or_else(|| format!("mid-{mid}")),
                stream_id,
                kind,
                mid,
            })
        }
    }

    let mut found = Vec::new();
    let mut current: Option<Section> = None;
    for line in sdp.lines().map(str::trim_end) {
        if let Some(media) = line.strip_prefix("m=") {
            found.extend(current.take().and_then(Section::finish));
            let mut parts = media.split_whitespace();
            let kind = match parts.next() {
                Some("audio") => Some(TrackKind::Audio),
                Some("video") => Some(TrackKind::Video),
                _ => None,
            };
            current = Some(Section {
                kind,
                open: parts.next().is_some_and(|port| port != "0"),
                sending: true,
                ..Section::default()
            });
            continue;
        }
        let Some(section) = current.as_mut() else { continue };
        if let Some(mid) = line.strip_prefix("a=mid:") {
            section.mid = Some(mid.to_string());
        } else if let Some(msid) = line.strip_prefix("a=msid:") {
            let mut ids = msid.split_whitespace().map(str::to_string);
            if let Some(stream) = ids.next() {
                section.msid = Some((stream, ids.next()));
            }
        } else if matches!(line, "a=sendrecv" | "a=sendonly") {
            section.sending = true;
        } else if matches!(line, "a=recvonly" | "a=inactive") {
            section.sending = false;
        }
    }
    found.extend(current.and_then(Section::finish));
    found
}

fn first_mid(sdp: &str) -> Option<String> {
    sdp.lines()
        .find_map(|line| line.trim_end().strip_prefix("a=mid:"))
        .map(str::to_string)
}

struct Shared {
    state: Mutex<State>,
    wake: Notify,
    events: Mutex<Option<mpsc::UnboundedSender<ConnectionEvent>>>,
}

impl Shared {
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
}

enum Wake {
    Poked,
    Timeout,
    Received(usize, SocketAddr),
}

/// Sans-IO loop: flush output, then wait for a poke, the next deadline or a datagram.
async fn drive(shared: Arc<Shared>, socket: UdpSocket, local_addr: SocketAddr, remote: Uuid) {
    let mut buf = vec![0u8; MTU];
    loop {
        let mut transmits = Vec::new();
        let mut events = Vec::new();
        let polled = {
            let mut state = shared.state();
            if state.signaling == SignalingState::Closed {
                return;
            }
            let polled = state.poll(&mut transmits, &mut events);
            if polled.is_err() {
                state.set_connection(ConnectionState::Failed, &mut events);
            }
            polled
        };

        for (destination, contents) in &transmits {
            if let Err(e) = socket.send_to(contents, *destination).await {
                tracing::debug!(remote = %remote, to = %destination, error = %e, "Datagram not sent");
            }
        }
        shared.emit(events);

        let deadline = match polled {
            Ok(deadline) => deadline,
            Err(e) => {
                tracing::error!(remote = %remote, error = %e, "Connection failed");
                return;
            }
        };

        let woke = tokio::select! {
            _ = shared.wake.notified() => Wake::Poked,
            _ = tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)) => Wake::Timeout,
            received = socket.recv_from(&mut buf) => match received {
                Ok((len, source)) => Wake::Received(len, source),
                Err(e) => {
                    tracing::debug!(remote = %remote, error = %e, "Receive failed");
                    Wake::Poked
                }
            },
        };

        let handled = match woke {
            Wake::Poked => Ok(()),
            Wake::Timeout => shared.state().rtc.handle_input(Input::Timeout(Instant::now())),
            Wake::Received(len, source) => match <&[u8]>::try_into(&buf[..len]) {
                Ok(contents) => {
                    let input = Input::Receive(
                        Instant::now(),
                        Receive {
                            proto: Protocol::Udp,
                            source,
                            destination: local_addr,
                            contents,
                        },
                    );
                    shared.state().rtc.handle_input(input)
                }
                Err(e) => {
                    tracing::trace!(remote = %remote, from = %source, error = ?e, "Unrecognized datagram");
                    Ok(())
                }
            },
        };
        if let Err(e) = handled {
            tracing::warn!(remote = %remote, error = %e, "Input rejected");
        }
    }
}

/// One str0m-backed peer connection.
pub struct RtcConnection {
    local: Uuid,
    remote: Uuid,
    shared: Arc<Shared>,
    driver: AbortHandle,
}

impl RtcConnection {
    fn commit(&self, events: Vec<ConnectionEvent>) {
        self.shared.wake.notify_one();
        self.shared.emit(events);
    }
}

#[async_trait]
impl PeerConnection for RtcConnection {
    fn signaling_state(&self) -> SignalingState {
        self.shared.state().signaling
    }

    fn connection_state(&self) -> ConnectionState {
        self.shared.state().connection
    }

    fn has_remote_description(&self) -> bool {
        self.shared.state().has_remote
    }

    fn needs_offer(&self) -> bool {
        self.shared.state().needs_offer()
    }

    async fn create_offer(&self) -> Result<SessionDescription> {
        let mut guard = self.shared.state();
        let state = &mut *guard;
        state.ensure_open("create offer")?;
        match state.signaling {
            SignalingState::HaveLocalOffer => {
                if let Some(offer) = &state.offer {
                    return Ok(SessionDescription {
                        sdp_type: SdpType::Offer,
                        sdp: offer.sdp.clone(),
                    });
                }
            }
            SignalingState::HaveRemoteOffer => return Err(state.wrong_state("create offer")),
            _ => {}
        }
        // An offer created but never applied is replaced.
        state.roll_back();

        let rtc = &state.rtc;
        state.retired.retain(|mid| rtc.media(*mid).is_some());

        let mut api = state.rtc.sdp_api();
        let mut adding = Vec::new();
        for sender in state.senders.iter_mut().filter(|s| s.mid.is_none()) {
            let mid = api.add_media(
                media_kind(sender.kind),
                Direction::SendOnly,
                Some(sender.stream_id.clone()),
                Some(sender.track_id.clone()),
                None,
            );
            sender.mid = Some(mid);
            adding.push(sender.id);
        }
        for mid in &state.retired {
            api.set_direction(*mid, Direction::Inactive);
        }
        let Some((offer, pending)) = api.apply() else {
            return Err(HuddleError::connection("no media changes to offer"));
        };

        let sdp = offer.to_sdp_string();
        state.offer = Some(PendingOffer {
            sdp: sdp.clone(),
            pending,
            adding,
            retiring: state.retired.clone(),
        });
        Ok(SessionDescription {
            sdp_type: SdpType::Offer,
            sdp,
        })
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let state = self.shared.state();
        match (&state.answer, state.signaling) {
            (Some(sdp), SignalingState::HaveRemoteOffer) => Ok(SessionDescription {
                sdp_type: SdpType::Answer,
                sdp: sdp.clone(),
            }),
            _ => Err(state.wrong_state("create answer")),
        }
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<()> {
        let events = {
            let mut state = self.shared.state();
            state.ensure_open("set local description")?;
            let matches = match description.sdp_type {
                SdpType::Offer => state.offer.as_ref().is_some_and(|o| o.sdp == description.sdp),
                SdpType::Answer => state.answer.as_deref() == Some(description.sdp.as_str()),
            };
            match (description.sdp_type, state.signaling) {
                (SdpType::Offer, SignalingState::Stable | SignalingState::HaveLocalOffer) if matches => {
                    state.signaling = SignalingState::HaveLocalOffer;
                }
                (SdpType::Answer, SignalingState::HaveRemoteOffer) if matches => {
                    state.signaling = SignalingState::Stable;
                    state.answer = None;
                }
                _ => return Err(state.wrong_state("set local description")),
            }

            let mut events = Vec::new();
            if !state.gathered {
                state.gathered = true;
                let line = state.local_candidate.to_sdp_string();
                events.push(ConnectionEvent::IceCandidate(IceCandidate {
                    candidate: line.trim_start_matches("a=").to_string(),
                    sdp_mid: first_mid(&description.sdp),
                    sdp_m_line_index: Some(0),
                }));
            }
            if state.connection == ConnectionState::New {
                state.set_connection(ConnectionState::Connecting, &mut events);
            }
            if description.sdp_type == SdpType::Answer && state.needs_offer() {
                events.push(ConnectionEvent::NegotiationNeeded);
            }
            events
        };
        self.commit(events);
        Ok(())
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        let announced = announced_tracks(&description.sdp);
        let events = {
            let mut guard = self.shared.state();
            let state = &mut *guard;
            state.ensure_open("set remote description")?;
            match (description.sdp_type, state.signaling) {
                (SdpType::Offer, SignalingState::Stable | SignalingState::HaveLocalOffer) => {
                    let offer = SdpOffer::from_sdp_string(&description.sdp)
                        .map_err(|e| sdp_error("unreadable offer", e))?;
                    if state.signaling == SignalingState::HaveLocalOffer {
                        tracing::debug!(remote = %self.remote, "Rolling back local offer");
                    }
                    state.roll_back();
                    let answer = state
                        .rtc
                        .sdp_api()
                        .accept_offer(offer)
                        .map_err(|e| sdp_error("offer rejected", e))?;
                    state.answer = Some(answer.to_sdp_string());
                    state.signaling = SignalingState::HaveRemoteOffer;
                }
                (SdpType::Answer, SignalingState::HaveLocalOffer) => {
                    let answer = SdpAnswer::from_sdp_string(&description.sdp)
                        .map_err(|e| sdp_error("unreadable answer", e))?;
                    let Some(offer) = state.offer.take() else {
                        return Err(state.wrong_state("set remote description"));
                    };
                    let PendingOffer {
                        pending,
                        adding,
                        retiring,
                        ..
                    } = offer;
                    if let Err(e) = state.rtc.sdp_api().accept_answer(pending, answer) {
                        for sender in state.senders.iter_mut().filter(|s| adding.contains(&s.id)) {
                            sender.mid = None;
                        }
                        state.signaling = SignalingState::Stable;
                        return Err(sdp_error("answer rejected", e));
                    }
                    state.retired.retain(|mid| !retiring.contains(mid));
                    state.signaling = SignalingState::Stable;
                }
                _ => return Err(state.wrong_state("set remote description")),
            }
            state.has_remote = true;

            let mut events = state.apply_remote_tracks(announced);
            if description.sdp_type == SdpType::Answer && state.needs_offer() {
                events.push(ConnectionEvent::NegotiationNeeded);
            }
            events
        };
        self.commit(events);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        {
            let mut state = self.shared.state();
            state.ensure_open("add ICE candidate")?;
            if !state.has_remote {
                return Err(HuddleError::InvalidSignalingState {
                    op: "add ICE candidate",
                    state: "no remote description".into(),
                });
            }
            let line = candidate.candidate.trim().trim_start_matches("a=");
            // Empty candidate marks end of gathering.
            if line.is_empty() {
                return Ok(());
            }
            let parsed = Candidate::from_sdp_string(line).map_err(|e| sdp_error("bad ICE candidate", e))?;
            state.rtc.add_remote_candidate(parsed);
        }
        self.commit(Vec::new());
        Ok(())
    }

    fn add_track(&self, track: MediaTrack, stream: &MediaStream) -> Result<SenderId> {
        let id = {
            let mut state = self.shared.state();
            state.ensure_open("add track")?;
            if state.senders.iter().any(|s| s.track_id == track.id()) {
                return Err(HuddleError::connection(format!(
                    "track {} already has a sender",
                    track.id()
                )));
            }
            let id = SenderId(state.next_sender);
            state.next_sender += 1;
            state.senders.push(Sender {
                id,
                track_id: track.id().to_string(),
                stream_id: stream.id().to_string(),
                kind: track.kind(),
                mid: None,
                active: true,
            });
            id
        };
        self.shared.emit(vec![ConnectionEvent::NegotiationNeeded]);
        Ok(id)
    }

    fn remove_track(&self, sender: SenderId) -> Result<()> {
        {
            let mut state = self.shared.state();
            state.ensure_open("remove track")?;
            let index = state.sender_index(sender)?;
            let removed = state.senders.remove(index);
            state.retired.extend(removed.mid);
        }
        self.shared.emit(vec![ConnectionEvent::NegotiationNeeded]);
        Ok(())
    }

    fn set_sender_active(&self, sender: SenderId, active: bool) -> Result<()> {
        let mut state = self.shared.state();
        state.ensure_open("toggle sender")?;
        let index = state.sender_index(sender)?;
        let entry = &mut state.senders[index];
        if entry.active != active {
            entry.active = active;
            tracing::debug!(remote = %self.remote, track = %entry.track_id, active, "Sender toggled");
        }
        Ok(())
    }

    fn close(&self) {
        {
            let mut state = self.shared.state();
            if state.signaling == SignalingState::Closed {
                return;
            }
            state.signaling = SignalingState::Closed;
            state.connection = ConnectionState::Closed;
            state.offer = None;
            for remote in state.remote_tracks.values() {
                remote.track.stop();
            }
            state.rtc.disconnect();
        }
        self.driver.abort();
        self.shared.events.lock().unwrap_or_else(|e| e.into_inner()).take();
        tracing::debug!(local = %self.local, remote = %self.remote, "Connection closed");
    }
}

impl Drop for RtcConnection {
    fn drop(&mut self) {
        self.driver.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::StreamRole;
    use crate::link::{LinkContext, LinkNotice, PeerLink};
    use crate::testkit::{eventually, Recorder};
    use huddle_common::config::{NegotiationConfig, SignalingConfig};
    use huddle_signal::{MemorySignalStore, SignalStore, SignalingChannel};
    use std::time::Duration;

    fn engine() -> RtcEngine {
        RtcEngine::with_host_ip(IpAddr::V4(Ipv4Addr::LOCALHOST))
    }

    fn pair(
        engine: &RtcEngine,
    ) -> (
        Arc<dyn PeerConnection>,
        mpsc::UnboundedReceiver<ConnectionEvent>,
        Arc<dyn PeerConnection>,
        mpsc::UnboundedReceiver<ConnectionEvent>,
    ) {
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let (ca, ea) = engine.create(a, b, &[]).unwrap();
        let (cb, eb) = engine.create(b, a, &[]).unwrap();
        (ca, ea, cb, eb)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<ConnectionEvent>) -> Vec<ConnectionEvent> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            out.push(event);
        }
        out
    }

    fn mic() -> MediaStream {
        MediaStream::from_tracks([MediaTrack::new(TrackKind::Audio, "mic")])
    }

    #[test]
    fn reads_sending_lines_of_a_browser_offer() {
        let sdp = "v=0\r\n\
            o=- 4611731400430051336 2 IN IP4 127.0.0.1\r\n\
            s=-\r\n\
            t=0 0\r\n\
            a=group:BUNDLE 0 1 2\r\n\
            m=audio 9 UDP/TLS/RTP/SAVPF 111\r\n\
            c=IN IP4 0.0.0.0\r\n\
            a=mid:0\r\n\
            a=sendrecv\r\n\
            a=msid:voice-stream voice-track\r\n\
            a=rtpmap:111 opus/48000/2\r\n\
            m=video 9 UDP/TLS/RTP/SAVPF 96\r\n\
            a=mid:1\r\n\
            a=recvonly\r\n\
            m=application 9 UDP/DTLS/SCTP webrtc-datachannel\r\n\
            a=mid:2\r\n\
            m=audio 0 UDP/TLS/RTP/SAVPF 111\r\n\
            a=mid:3\r\n\
            a=sendonly\r\n";

        let found = announced_tracks(sdp);
        assert_eq!(
            found,
            vec![Announced {
                mid: "0".into(),
                kind: TrackKind::Audio,
                stream_id: "voice-stream".into(),
                track_id: "voice-track".into(),
            }]
        );
    }

    #[test]
    fn missing_msid_falls_back_to_the_mid() {
        let found = announced_tracks("v=0\nm=video 9 RTP/SAVPF 96\na=mid:v\na=msid:- t\n");
        assert_eq!(found[0].stream_id, "mid-v");
        assert_eq!(found[0].track_id, "t");
    }

    #[tokio::test]
    async fn offer_carries_each_sender_with_its_stream() {
        let engine = engine();
        let (a, _ea, b, mut eb) = pair(&engine);

        let voice = mic();
        let screen = MediaStream::from_tracks([
            MediaTrack::new(TrackKind::Video, "screen"),
            MediaTrack::new(TrackKind::Audio, "system"),
        ]);
        for stream in [&voice, &screen] {
            for track in stream.tracks() {
                a.add_track(track, stream).unwrap();
            }
        }

        let offer = a.create_offer().await.unwrap();
        assert!(offer.sdp.contains(&format!("a=msid:{} ", voice.id())));
        a.set_local_description(offer.clone()).await.unwrap();
        assert_eq!(a.signaling_state(), SignalingState::HaveLocalOffer);

        b.set_remote_description(offer).await.unwrap();
        let answer = b.create_answer().await.unwrap();
        b.set_local_description(answer.clone()).await.unwrap();
        a.set_remote_description(answer).await.unwrap();
        assert_eq!(a.signaling_state(), SignalingState::Stable);
        assert_eq!(b.signaling_state(), SignalingState::Stable);
        assert!(!a.needs_offer());

        let mut tracks = Vec::new();
        for event in drain(&mut eb) {
            if let ConnectionEvent::Track { track, streams } = event {
                tracks.push((track, streams));
            }
        }
        assert_eq!(tracks.len(), 3);
        let (video, grouping) = tracks
            .iter()
            .find(|(t, _)| t.kind() == TrackKind::Video)
            .unwrap();
        assert_eq!(video.id(), screen.video_tracks()[0].id());
        assert_eq!(video.ready_state(), ReadyState::New);
        assert_eq!(grouping[0].id(), screen.id());
        assert_eq!(grouping[0].len(), 2);
    }

    #[tokio::test]
    async fn answering_side_offers_its_own_senders_next() {
        let engine = engine();
        let (a, _ea, b, mut eb) = pair(&engine);
        let (a_mic, b_mic) = (mic(), mic());
        a.add_track(a_mic.tracks()[0].clone(), &a_mic).unwrap();
        b.add_track(b_mic.tracks()[0].clone(), &b_mic).unwrap();

        let offer = a.create_offer().await.unwrap();
        a.set_local_description(offer.clone()).await.unwrap();
        b.set_remote_description(offer).await.unwrap();
        let answer = b.create_answer().await.unwrap();
        b.set_local_description(answer).await.unwrap();

        assert!(b.needs_offer());
        assert!(drain(&mut eb)
            .iter()
            .any(|e| matches!(e, ConnectionEvent::NegotiationNeeded)));
    }

    #[tokio::test]
    async fn colliding_offer_rolls_ours_back() {
        let engine = engine();
        let (a, _ea, b, _eb) = pair(&engine);
        let (a_mic, b_mic) = (mic(), mic());
        a.add_track(a_mic.tracks()[0].clone(), &a_mic).unwrap();
        b.add_track(b_mic.tracks()[0].clone(), &b_mic).unwrap();

        let ours = a.create_offer().await.unwrap();
        a.set_local_description(ours).await.unwrap();
        let theirs = b.create_offer().await.unwrap();
        b.set_local_description(theirs.clone()).await.unwrap();

        a.set_remote_description(theirs).await.unwrap();
        assert_eq!(a.signaling_state(), SignalingState::HaveRemoteOffer);
        let answer = a.create_answer().await.unwrap();
        a.set_local_description(answer).await.unwrap();
        assert_eq!(a.signaling_state(), SignalingState::Stable);
        // Our microphone was in the dropped offer.
        assert!(a.needs_offer());
    }

    #[tokio::test]
    async fn local_candidate_is_the_bound_socket() {
        let engine = engine();
        let (a, mut ea, _b, _eb) = pair(&engine);
        let voice = mic();
        a.add_track(voice.tracks()[0].clone(), &voice).unwrap();
        let offer = a.create_offer().await.unwrap();
        a.set_local_description(offer).await.unwrap();

        let candidate = drain(&mut ea)
            .into_iter()
            .find_map(|e| match e {
                ConnectionEvent::IceCandidate(c) => Some(c),
                _ => None,
            })
            .unwrap();
        assert!(candidate.candidate.starts_with("candidate:"));
        assert!(candidate.candidate.contains("127.0.0.1"));
        assert!(candidate.candidate.contains("typ host"));
        assert!(Candidate::from_sdp_string(&candidate.candidate).is_ok());
    }

    #[tokio::test]
    async fn rejects_out_of_order_descriptions_and_garbage() {
        let engine = engine();
        let (a, _ea, _b, _eb) = pair(&engine);

        let err = a.create_answer().await.unwrap_err();
        assert_eq!(err.error_code(), "INVALID_SIGNALING_STATE");

        let bogus = SessionDescription {
            sdp_type: SdpType::Offer,
            sdp: "hello".into(),
        };
        assert!(a.set_remote_description(bogus).await.is_err());
        assert!(!a.has_remote_description());

        // Nothing to send yet.
        assert!(a.create_offer().await.is_err());

        a.close();
        a.close();
        assert_eq!(a.signaling_state(), SignalingState::Closed);
        assert_eq!(a.connection_state(), ConnectionState::Closed);
    }

    fn context(
        store: Arc<dyn SignalStore>,
        factory: Arc<RtcEngine>,
        session: Uuid,
        me: Uuid,
        events: Arc<Recorder>,
    ) -> (LinkContext, mpsc::UnboundedReceiver<LinkNotice>) {
        let (notices, rx) = mpsc::unbounded_channel();
        let ctx = LinkContext {
            local_id: me,
            signals: Arc::new(SignalingChannel::new(store, session, me, &SignalingConfig::default())),
            factory,
            ice_servers: Vec::new(),
            negotiation: NegotiationConfig::default(),
            events,
            notices,
        };
        (ctx, rx)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn loopback_links_connect_and_hear_each_other() {
        let store: Arc<dyn SignalStore> = Arc::new(MemorySignalStore::new());
        let engine = Arc::new(engine());
        let (session, a_id, b_id) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let (seen_by_a, seen_by_b) = (Arc::new(Recorder::default()), Arc::new(Recorder::default()));

        let (ctx_a, _rx_a) = context(store.clone(), engine.clone(), session, a_id, seen_by_a.clone());
        let (ctx_b, _rx_b) = context(store, engine, session, b_id, seen_by_b.clone());
        let (a_mic, b_mic) = (mic(), mic());
        let a = PeerLink::open(&ctx_a, b_id, &[a_mic.clone()]).await.unwrap();
        let b = PeerLink::open(&ctx_b, a_id, &[b_mic.clone()]).await.unwrap();
        a.initiate().await.unwrap();

        eventually("B hears A", || seen_by_b.stream_len(a_id, StreamRole::Voice) == 1).await;
        eventually("A hears B", || seen_by_a.stream_len(b_id, StreamRole::Voice) == 1).await;
        assert_eq!(b.stream(StreamRole::Voice).tracks()[0].id(), a_mic.tracks()[0].id());
        assert_eq!(a.stream(StreamRole::Voice).tracks()[0].id(), b_mic.tracks()[0].id());

        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        while a.connection_state() != ConnectionState::Connected
            || b.connection_state() != ConnectionState::Connected
        {
            assert!(tokio::time::Instant::now() < deadline, "ICE and DTLS never completed");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        assert!(a.close());
        assert!(b.close());
    }
}
