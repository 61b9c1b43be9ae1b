//! Shared helpers for the in-crate tests.

use crate::classify::StreamRole;
use crate::connection::ConnectionState;
use crate::devices::SyntheticDevices;
use crate::link::PeerLinkEvents;
use crate::media::MediaStream;
use crate::membership::MemoryMembership;
use crate::registry::ProcessorRegistry;
use crate::session::{CallState, SessionContext, SessionEvents};
use crate::sim::SimEngine;
use crate::VoiceConfig;
use huddle_common::HuddleError;
use huddle_signal::MemorySignalStore;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

/// Poll `check` until it holds, failing the test after a few seconds.
pub(crate) async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check() {
        if tokio::time::Instant::now() >= deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Records every callback it receives.
#[derive(Default)]
pub(crate) struct Recorder {
    streams: Mutex<HashMap<(Uuid, StreamRole), MediaStream>>,
    states: Mutex<Vec<(Uuid, ConnectionState)>>,
    failures: Mutex<Vec<(Uuid, String)>>,
    calls: Mutex<Vec<CallState>>,
    screen_shares: Mutex<Vec<(Uuid, bool)>>,
}

impl Recorder {
    fn record(&self, peer: Uuid, role: StreamRole, stream: &MediaStream) {
        self.streams.lock().unwrap().insert((peer, role), stream.clone());
    }

    pub(crate) fn stream(&self, peer: Uuid, role: StreamRole) -> Option<MediaStream> {
        self.streams.lock().unwrap().get(&(peer, role)).cloned()
    }

    pub(crate) fn stream_len(&self, peer: Uuid, role: StreamRole) -> usize {
        self.stream(peer, role).map(|s| s.len()).unwrap_or(0)
    }

    pub(crate) fn failures(&self) -> Vec<(Uuid, String)> {
        self.failures.lock().unwrap().clone()
    }

    pub(crate) fn call_states(&self) -> Vec<CallState> {
        self.calls.lock().unwrap().clone()
    }

    pub(crate) fn screen_shares(&self) -> Vec<(Uuid, bool)> {
        self.screen_shares.lock().unwrap().clone()
    }

    pub(crate) fn connected_to(&self, peer: Uuid) -> bool {
        self.states
            .lock()
            .unwrap()
            .iter()
            .any(|(p, s)| *p == peer && *s == ConnectionState::Connected)
    }
}

impl PeerLinkEvents for Recorder {
    fn on_voice_stream(&self, peer: Uuid, stream: &MediaStream) {
        self.record(peer, StreamRole::Voice, stream);
    }

    fn on_screen_share_stream(&self, peer: Uuid, stream: &MediaStream) {
        self.record(peer, StreamRole::ScreenShare, stream);
    }

    fn on_soundpad_stream(&self, peer: Uuid, stream: &MediaStream) {
        self.record(peer, StreamRole::Soundpad, stream);
    }

    fn on_remote_stream(&self, peer: Uuid, stream: &MediaStream) {
        self.record(peer, StreamRole::Remote, stream);
    }

    fn on_connection_state_change(&self, peer: Uuid, state: ConnectionState) {
        self.states.lock().unwrap().push((peer, state));
    }
}

impl SessionEvents for Recorder {
    fn on_stream(&self, peer: Uuid, role: StreamRole, stream: &MediaStream) {
        self.record(peer, role, stream);
    }

    fn on_connection_state(&self, peer: Uuid, state: ConnectionState) {
        self.states.lock().unwrap().push((peer, state));
    }

    fn on_link_failed(&self, peer: Uuid, error: &HuddleError) {
        self.failures.lock().unwrap().push((peer, error.error_code().to_string()));
    }

    fn on_call_state(&self, state: CallState) {
        self.calls.lock().unwrap().push(state);
    }

    fn on_remote_screen_share(&self, peer: Uuid, active: bool) {
        self.screen_shares.lock().unwrap().push((peer, active));
    }
}

/// One shared signal store, connection engine and membership directory.
pub(crate) struct Network {
    pub store: Arc<MemorySignalStore>,
    pub engine: Arc<SimEngine>,
    pub membership: Arc<MemoryMembership>,
}

/// A participant's view of the network plus its observers.
pub(crate) struct Participant {
    pub id: Uuid,
    pub ctx: SessionContext,
    pub devices: Arc<SyntheticDevices>,
    pub events: Arc<Recorder>,
    pub processors: Arc<ProcessorRegistry>,
}

impl Network {
    pub(crate) fn new() -> Self {
        Self {
            store: Arc::new(MemorySignalStore::new()),
            engine: Arc::new(SimEngine::with_video_warmup(Duration::from_millis(5))),
            membership: Arc::new(MemoryMembership::new()),
        }
    }

    pub(crate) fn participant(&self) -> Participant {
        let id = Uuid::new_v4();
        let devices = Arc::new(SyntheticDevices::new());
        let events = Arc::new(Recorder::default());
        let processors = Arc::new(ProcessorRegistry::new());
        let ctx = SessionContext {
            local_id: id,
            store: self.store.clone(),
            factory: self.engine.clone(),
            devices: devices.clone(),
            membership: self.membership.clone(),
            processors: processors.clone(),
            config: VoiceConfig::default(),
            events: events.clone(),
        };
        Participant {
            id,
            ctx,
            devices,
            events,
            processors,
        }
    }
}
