//! Session controllers: a voice-channel mesh and a one-to-one direct call.
//!
//! Both own the participant's local media, one [`PeerLink`] per remote
//! participant, and a playback router. They share the plumbing in
//! [`SessionCore`]; what differs is who initiates and how a session ends.

mod direct_call;
mod voice_channel;

pub use direct_call::{CallDirection, CallState, DirectCallSession, EndReason};
pub use voice_channel::VoiceChannelSession;

use crate::classify::StreamRole;
use crate::connection::{ConnectionFactory, ConnectionState, IceCandidate, IceServer};
use crate::devices::{AudioConstraints, DisplayConstraints, MediaDevices};
use crate::link::{LinkContext, LinkNotice, PeerLink, PeerLinkEvents};
use crate::media::MediaStream;
use crate::membership::MembershipDirectory;
use crate::mixer::{AudioMixer, SoundClip};
use crate::playback::PlaybackRouter;
use crate::registry::{ProcessorId, ProcessorRegistry};
use crate::VoiceConfig;
use huddle_common::{HuddleError, Result};
use huddle_signal::{PurgeScope, SignalStore, SignalingChannel};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use uuid::Uuid;

/// What the UI hears from a session. Every method defaults to a no-op.
pub trait SessionEvents: Send + Sync {
    /// A peer's stream was created or its track set changed.
    fn on_stream(&self, _peer: Uuid, _role: StreamRole, _stream: &MediaStream) {}
    fn on_connection_state(&self, _peer: Uuid, _state: ConnectionState) {}
    /// A link-level failure worth showing. Failures on closed links never arrive here.
    fn on_link_failed(&self, _peer: Uuid, _error: &HuddleError) {}
    fn on_call_state(&self, _state: CallState) {}
    fn on_remote_screen_share(&self, _peer: Uuid, _active: bool) {}
}

pub struct NoopEvents;

impl SessionEvents for NoopEvents {}

/// Everything a session needs from the outside world.
#[derive(Clone)]
pub struct SessionContext {
    pub local_id: Uuid,
    pub store: Arc<dyn SignalStore>,
    pub factory: Arc<dyn ConnectionFactory>,
    pub devices: Arc<dyn MediaDevices>,
    pub membership: Arc<dyn MembershipDirectory>,
    pub processors: Arc<ProcessorRegistry>,
    pub config: VoiceConfig,
    pub events: Arc<dyn SessionEvents>,
}

/// What a teardown released.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TeardownReport {
    pub links_closed: usize,
    pub tracks_stopped: usize,
}

/// Local toggles, reset on teardown.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MediaFlags {
    pub muted: bool,
    pub deafened: bool,
    pub screen_sharing: bool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Routes classified inbound streams into playback and on to the UI.
struct StreamRelay {
    router: Arc<PlaybackRouter>,
    events: Arc<dyn SessionEvents>,
}

impl StreamRelay {
    fn deliver(&self, peer: Uuid, role: StreamRole, stream: &MediaStream) {
        if self.router.attach(peer, role, stream) {
            self.events.on_stream(peer, role, stream);
        }
    }
}

impl PeerLinkEvents for StreamRelay {
    fn on_voice_stream(&self, peer: Uuid, stream: &MediaStream) {
        self.deliver(peer, StreamRole::Voice, stream);
    }

    fn on_screen_share_stream(&self, peer: Uuid, stream: &MediaStream) {
        self.deliver(peer, StreamRole::ScreenShare, stream);
    }

    fn on_soundpad_stream(&self, peer: Uuid, stream: &MediaStream) {
        self.deliver(peer, StreamRole::Soundpad, stream);
    }

    fn on_remote_stream(&self, peer: Uuid, stream: &MediaStream) {
        self.deliver(peer, StreamRole::Remote, stream);
    }

    fn on_ice_candidate(&self, peer: Uuid, candidate: &IceCandidate) {
        tracing::trace!(peer = %peer, mid = ?candidate.sdp_mid, "Local ICE candidate");
    }

    fn on_connection_state_change(&self, peer: Uuid, state: ConnectionState) {
        self.events.on_connection_state(peer, state);
    }

    fn on_renegotiation_needed(&self, peer: Uuid) {
        tracing::trace!(peer = %peer, "Renegotiation needed");
    }
}

/// The participant's own capture plus the mixer that feeds peers.
struct LocalMedia {
    microphone: MediaStream,
    /// Carries the mixer output, not the raw microphone.
    outbound: MediaStream,
    soundpad: Option<MediaStream>,
    screen: Option<MediaStream>,
    mixer: Arc<AudioMixer>,
    processor: ProcessorId,
    pump: Option<AbortHandle>,
}

impl LocalMedia {
    async fn acquire(ctx: &SessionContext) -> Result<Self> {
        let constraints = AudioConstraints::from(&ctx.config.audio);
        let microphone = ctx.devices.microphone(&constraints).await?;

        let mixer = Arc::new(AudioMixer::new(&ctx.config.audio));
        let outbound = MediaStream::from_tracks([mixer.output_track().clone()]);
        let soundpad = mixer
            .sound_track()
            .map(|track| MediaStream::from_tracks([track.clone()]));
        let processor = ctx.processors.register(mixer.clone());
        let pump = ctx
            .devices
            .audio_io()
            .map(|io| mixer.spawn_pump(io, &ctx.config.audio));

        tracing::info!(
            microphone = microphone.len(),
            routing = ?mixer.routing(),
            pumped = pump.is_some(),
            "Local media acquired"
        );
        Ok(Self {
            microphone,
            outbound,
            soundpad,
            screen: None,
            mixer,
            processor,
            pump,
        })
    }

    /// Streams every link sends, voice first.
    fn link_streams(&self) -> Vec<MediaStream> {
        let mut streams = vec![self.outbound.clone()];
        streams.extend(self.soundpad.clone());
        streams.extend(self.screen.clone());
        streams
    }

    fn set_muted(&self, muted: bool) {
        for track in self.outbound.audio_tracks() {
            track.set_enabled(!muted);
        }
    }

    fn release(self, processors: &ProcessorRegistry) -> usize {
        if let Some(pump) = &self.pump {
            pump.abort();
        }
        processors.unregister(self.processor);
        self.mixer.stop_sounds();
        let mut stopped = 0;
        for stream in self
            .screen
            .iter()
            .chain(self.soundpad.iter())
            .chain([&self.outbound, &self.microphone])
        {
            stopped += stream.stop_all();
        }
        stopped
    }
}

/// Plumbing shared by both session kinds.
pub(crate) struct SessionCore {
    ctx: SessionContext,
    signals: Arc<SignalingChannel>,
    router: Arc<PlaybackRouter>,
    relay: Arc<StreamRelay>,
    ice_servers: Vec<IceServer>,
    media: tokio::sync::Mutex<Option<LocalMedia>>,
    flags: Mutex<MediaFlags>,
    /// Taken on shutdown so the notice loop ends once the links are gone.
    notices: Mutex<Option<mpsc::UnboundedSender<LinkNotice>>>,
    tasks: Mutex<Vec<AbortHandle>>,
}

impl SessionCore {
    pub(crate) fn new(ctx: SessionContext, session_id: Uuid) -> (Self, mpsc::UnboundedReceiver<LinkNotice>) {
        let signals = Arc::new(SignalingChannel::new(
            ctx.store.clone(),
            session_id,
            ctx.local_id,
            &ctx.config.signaling,
        ));
        let router = Arc::new(PlaybackRouter::new(ctx.local_id));
        let relay = Arc::new(StreamRelay {
            router: router.clone(),
            events: ctx.events.clone(),
        });
        let ice_servers = IceServer::from_config(&ctx.config.ice);
        let (tx, rx) = mpsc::unbounded_channel();
        let core = Self {
            ctx,
            signals,
            router,
            relay,
            ice_servers,
            media: tokio::sync::Mutex::new(None),
            flags: Mutex::new(MediaFlags::default()),
            notices: Mutex::new(Some(tx)),
            tasks: Mutex::new(Vec::new()),
        };
        (core, rx)
    }

    pub(crate) fn ctx(&self) -> &SessionContext {
        &self.ctx
    }

    pub(crate) fn local_id(&self) -> Uuid {
        self.ctx.local_id
    }

    pub(crate) fn signals(&self) -> &Arc<SignalingChannel> {
        &self.signals
    }

    pub(crate) fn router(&self) -> &Arc<PlaybackRouter> {
        &self.router
    }

    pub(crate) fn flags(&self) -> MediaFlags {
        *lock(&self.flags)
    }

    pub(crate) fn notice_sender(&self) -> Option<mpsc::UnboundedSender<LinkNotice>> {
        lock(&self.notices).clone()
    }

    pub(crate) fn track_task(&self, handle: AbortHandle) {
        let mut tasks = lock(&self.tasks);
        tasks.retain(|t| !t.is_finished());
        tasks.push(handle);
    }

    pub(crate) async fn acquire_media(&self) -> Result<()> {
        let media = LocalMedia::acquire(&self.ctx).await?;
        media.set_muted(self.flags().muted);
        *self.media.lock().await = Some(media);
        Ok(())
    }

    pub(crate) async fn mixer(&self) -> Option<Arc<AudioMixer>> {
        self.media.lock().await.as_ref().map(|m| m.mixer.clone())
    }

    /// Open a link to `peer` carrying the current local streams.
    pub(crate) async fn open_link(&self, peer: Uuid) -> Result<Arc<PeerLink>> {
        let notices = self
            .notice_sender()
            .ok_or(HuddleError::LinkClosed { peer })?;
        let (streams, outbound) = {
            let media = self.media.lock().await;
            match media.as_ref() {
                Some(m) => (m.link_streams(), Some(m.outbound.clone())),
                None => (Vec::new(), None),
            }
        };

        let ctx = LinkContext {
            local_id: self.ctx.local_id,
            signals: self.signals.clone(),
            factory: self.ctx.factory.clone(),
            ice_servers: self.ice_servers.clone(),
            negotiation: self.ctx.config.negotiation.clone(),
            events: self.relay.clone(),
            notices,
        };
        let link = PeerLink::open(&ctx, peer, &streams).await?;

        if let Some(outbound) = outbound.filter(|_| self.flags().muted) {
            link.set_voice_sending(&outbound, false)?;
        }
        Ok(link)
    }

    pub(crate) async fn toggle_mute(&self, links: &[Arc<PeerLink>]) -> bool {
        let muted = {
            let mut flags = lock(&self.flags);
            flags.muted = !flags.muted;
            flags.muted
        };
        if let Some(media) = self.media.lock().await.as_ref() {
            media.set_muted(muted);
            for link in links {
                if let Err(e) = link.set_voice_sending(&media.outbound, !muted) {
                    tracing::debug!(peer = %link.peer(), error = %e, "Could not update voice sender");
                }
            }
        }
        tracing::info!(muted, "Microphone toggled");
        muted
    }

    /// Deafen is local only: inbound audio goes silent, our sending is untouched.
    pub(crate) fn toggle_deafen(&self) -> bool {
        let deafened = {
            let mut flags = lock(&self.flags);
            flags.deafened = !flags.deafened;
            flags.deafened
        };
        self.router.set_deafened(deafened);
        tracing::info!(deafened, "Deafen toggled");
        deafened
    }

    pub(crate) async fn start_screen_share(
        &self,
        constraints: &DisplayConstraints,
        links: &[Arc<PeerLink>],
    ) -> Result<()> {
        let screen = self.ctx.devices.display(constraints).await?;
        {
            let mut media = self.media.lock().await;
            let Some(media) = media.as_mut() else {
                screen.stop_all();
                return Err(HuddleError::InvalidCallState {
                    action: "share screen",
                    state: "without local media".into(),
                });
            };
            if let Some(previous) = media.screen.replace(screen.clone()) {
                previous.stop_all();
            }
        }
        lock(&self.flags).screen_sharing = true;

        for link in links {
            let result = match link.attach_stream(&screen) {
                Ok(_) => link.renegotiate().await,
                Err(e) => Err(e),
            };
            if let Err(e) = result {
                tracing::warn!(peer = %link.peer(), error = %e, "Could not share screen with peer");
                self.report_link_failure(link.peer(), &e);
            }
        }
        tracing::info!(
            tracks = screen.len(),
            audio = !screen.audio_tracks().is_empty(),
            peers = links.len(),
            "Screen share started"
        );
        Ok(())
    }

    /// Returns how many capture tracks were stopped; 0 if nothing was shared.
    pub(crate) async fn stop_screen_share(&self, links: &[Arc<PeerLink>]) -> usize {
        let screen = self.media.lock().await.as_mut().and_then(|m| m.screen.take());
        lock(&self.flags).screen_sharing = false;
        let Some(screen) = screen else { return 0 };

        for link in links {
            let result = match link.detach_stream(&screen) {
                Ok(_) => link.renegotiate().await,
                Err(e) => Err(e),
            };
            if let Err(e) = result {
                tracing::warn!(peer = %link.peer(), error = %e, "Could not withdraw screen share");
                self.report_link_failure(link.peer(), &e);
            }
        }
        let stopped = screen.stop_all();
        tracing::info!(stopped, "Screen share stopped");
        stopped
    }

    pub(crate) async fn play_sound(&self, clip: &SoundClip) -> Result<()> {
        let media = self.media.lock().await;
        let media = media.as_ref().ok_or(HuddleError::InvalidCallState {
            action: "play a sound",
            state: "without local media".into(),
        })?;
        media.mixer.play(clip);
        Ok(())
    }

    pub(crate) fn report_link_failure(&self, peer: Uuid, error: &HuddleError) {
        if error.is_user_visible() {
            self.ctx.events.on_link_failed(peer, error);
        }
    }

    /// Close links, then release capture, then purge signals.
    pub(crate) async fn shutdown(&self, links: Vec<Arc<PeerLink>>, scope: PurgeScope) -> TeardownReport {
        for task in lock(&self.tasks).drain(..) {
            task.abort();
        }
        lock(&self.notices).take();

        let links_closed = links.iter().filter(|link| link.close()).count();
        drop(links);
        self.router.clear();

        let tracks_stopped = match self.media.lock().await.take() {
            Some(media) => media.release(&self.ctx.processors),
            None => 0,
        };
        *lock(&self.flags) = MediaFlags::default();
        self.router.set_deafened(false);

        match self.signals.teardown(scope).await {
            Ok(purged) => tracing::debug!(purged, scope = ?scope, "Signals purged"),
            Err(e) => tracing::warn!(error = %e, "Failed to purge signals"),
        }

        TeardownReport {
            links_closed,
            tracks_stopped,
        }
    }
}
