//! One-to-one call: ringing, accept or reject, hang up.
//!
//! The caller opens its link straight away and sends the offer. The callee
//! only watches for call control while ringing; accepting opens its link,
//! whose subscription replays the waiting offer.

use super::{lock, MediaFlags, SessionContext, SessionCore, TeardownReport};
use crate::devices::DisplayConstraints;
use crate::link::{LinkNotice, PeerLink};
use crate::mixer::{AudioMixer, SoundClip};
use crate::negotiate::Outcome;
use crate::playback::PlaybackRouter;
use huddle_common::{ids, HuddleError, Result};
use huddle_signal::{PurgeScope, SignalKind, SignalSink};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallDirection {
    Outgoing,
    Incoming,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    /// We hung up.
    HungUp,
    RemoteEnded,
    Rejected,
    Cancelled,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    Ringing(CallDirection),
    Active,
    Ended(EndReason),
}

impl CallState {
    pub fn is_ended(self) -> bool {
        matches!(self, Self::Ended(_))
    }
}

impl std::fmt::Display for CallState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ringing(CallDirection::Outgoing) => f.write_str("ringing (outgoing)"),
            Self::Ringing(CallDirection::Incoming) => f.write_str("ringing (incoming)"),
            Self::Active => f.write_str("active"),
            Self::Ended(reason) => write!(f, "ended ({reason:?})"),
        }
    }
}

pub struct DirectCallSession {
    call_id: Uuid,
    peer: Uuid,
    core: SessionCore,
    state: Mutex<CallState>,
    link: tokio::sync::Mutex<Option<Arc<PeerLink>>>,
    /// Control watch used until the callee accepts.
    ringing: Mutex<Option<AbortHandle>>,
}

impl DirectCallSession {
    fn create(
        ctx: SessionContext,
        call_id: Uuid,
        peer: Uuid,
        direction: CallDirection,
    ) -> Arc<Self> {
        let (core, notices) = SessionCore::new(ctx, call_id);
        let session = Arc::new(Self {
            call_id,
            peer,
            core,
            state: Mutex::new(CallState::Ringing(direction)),
            link: tokio::sync::Mutex::new(None),
            ringing: Mutex::new(None),
        });
        session.spawn_notice_loop(notices);
        session
            .core
            .ctx()
            .events
            .on_call_state(CallState::Ringing(direction));
        session
    }

    /// Call `callee`: acquire the microphone, open the link and send the offer.
    pub async fn start(ctx: SessionContext, callee: Uuid) -> Result<Arc<Self>> {
        let session = Self::create(ctx, ids::call_id(), callee, CallDirection::Outgoing);
        tracing::info!(call = %session.call_id, callee = %callee, "Placing call");

        if let Err(e) = session.dial().await {
            tracing::error!(call = %session.call_id, error = %e, "Could not place call");
            session.finish(EndReason::Failed).await;
            return Err(e);
        }
        Ok(session)
    }

    /// A call from `caller` is ringing. Nothing is captured until [`accept`](Self::accept).
    pub async fn incoming(ctx: SessionContext, call_id: Uuid, caller: Uuid) -> Result<Arc<Self>> {
        let session = Self::create(ctx, call_id, caller, CallDirection::Incoming);
        if let Err(e) = session.watch_ringing().await {
            tracing::error!(call = %call_id, error = %e, "Could not watch incoming call");
            session.finish(EndReason::Failed).await;
            return Err(e);
        }
        tracing::info!(call = %call_id, caller = %caller, "Incoming call");
        Ok(session)
    }

    fn spawn_notice_loop(self: &Arc<Self>, mut notices: mpsc::UnboundedReceiver<LinkNotice>) {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some(notice) = notices.recv().await {
                let Some(session) = weak.upgrade() else { break };
                session.on_notice(notice).await;
            }
        });
    }

    async fn watch_ringing(&self) -> Result<()> {
        let mut subscription = self.core.signals().subscribe(self.peer).await?;
        let notices = self
            .core
            .notice_sender()
            .ok_or(HuddleError::LinkClosed { peer: self.peer })?;
        let peer = self.peer;
        let watcher = tokio::spawn(async move {
            while let Some(signal) = subscription.next().await {
                if !signal.kind.is_control() {
                    continue;
                }
                if notices.send(LinkNotice::Control { peer, signal }).is_err() {
                    break;
                }
            }
        });
        *lock(&self.ringing) = Some(watcher.abort_handle());
        Ok(())
    }

    fn stop_ringing(&self) {
        if let Some(watcher) = lock(&self.ringing).take() {
            watcher.abort();
        }
    }

    async fn on_notice(&self, notice: LinkNotice) {
        match notice {
            LinkNotice::Control { peer, signal } => match signal.kind {
                SignalKind::CallEnded => {
                    self.finish(EndReason::RemoteEnded).await;
                }
                SignalKind::CallRejected if self.state() == CallState::Ringing(CallDirection::Outgoing) => {
                    self.finish(EndReason::Rejected).await;
                }
                SignalKind::CallCancelled if self.state() == CallState::Ringing(CallDirection::Incoming) => {
                    self.finish(EndReason::Cancelled).await;
                }
                SignalKind::ScreenShareStarted => self.core.ctx().events.on_remote_screen_share(peer, true),
                SignalKind::ScreenShareStopped => self.core.ctx().events.on_remote_screen_share(peer, false),
                kind => {
                    tracing::debug!(call = %self.call_id, kind = %kind, state = %self.state(), "Call control ignored");
                }
            },
            LinkNotice::Negotiated {
                outcome: Outcome::Completed,
                ..
            } => {
                self.transition(CallState::Active, |s| {
                    s == CallState::Ringing(CallDirection::Outgoing)
                });
            }
            LinkNotice::Negotiated { .. } => {}
            LinkNotice::NegotiationFailed { peer, error } => {
                tracing::warn!(call = %self.call_id, error = %error, "Call negotiation failed");
                self.core.report_link_failure(peer, &error);
            }
            LinkNotice::ConnectionState { state, .. } => {
                tracing::debug!(call = %self.call_id, state = %state, "Call connection state");
            }
        }
    }

    /// Move to `to` if `allowed` accepts the current state.
    fn transition(&self, to: CallState, allowed: impl FnOnce(CallState) -> bool) -> bool {
        let from = {
            let mut state = lock(&self.state);
            let from = *state;
            if !allowed(from) {
                return false;
            }
            *state = to;
            from
        };
        tracing::info!(call = %self.call_id, from = %from, to = %to, "Call state changed");
        self.core.ctx().events.on_call_state(to);
        true
    }

    fn expect_state(&self, action: &'static str, expected: CallState) -> Result<()> {
        let state = self.state();
        if state == expected {
            Ok(())
        } else {
            Err(HuddleError::InvalidCallState {
                action,
                state: state.to_string(),
            })
        }
    }

    fn ensure_live(&self, action: &'static str) -> Result<()> {
        let state = self.state();
        if state.is_ended() {
            return Err(HuddleError::InvalidCallState {
                action,
                state: state.to_string(),
            });
        }
        Ok(())
    }

    async fn connect(&self) -> Result<()> {
        self.core.acquire_media().await?;
        let link = self.core.open_link(self.peer).await?;
        *self.link.lock().await = Some(link);
        Ok(())
    }

    async fn dial(&self) -> Result<()> {
        self.connect().await?;
        let link = self
            .link
            .lock()
            .await
            .clone()
            .ok_or(HuddleError::LinkClosed { peer: self.peer })?;
        link.initiate().await
    }

    async fn link_list(&self) -> Vec<Arc<PeerLink>> {
        self.link.lock().await.iter().cloned().collect()
    }

    /// Best effort; a lost control signal must not block local teardown.
    async fn notify_peer(&self, kind: SignalKind) {
        let payload = serde_json::json!({ "call_id": self.call_id });
        if let Err(e) = self.core.signals().send(self.peer, kind, payload).await {
            tracing::warn!(call = %self.call_id, kind = %kind, error = %e, "Could not notify peer");
        }
    }

    /// Answer a ringing incoming call.
    pub async fn accept(&self) -> Result<()> {
        self.expect_state("accept", CallState::Ringing(CallDirection::Incoming))?;
        self.stop_ringing();

        if let Err(e) = self.connect().await {
            tracing::error!(call = %self.call_id, error = %e, "Could not accept call");
            if !self.state().is_ended() {
                self.notify_peer(SignalKind::CallEnded).await;
            }
            self.finish(EndReason::Failed).await;
            return Err(e);
        }

        if !self.transition(CallState::Active, |s| {
            s == CallState::Ringing(CallDirection::Incoming)
        }) {
            // Cancelled while we were connecting: release what we just opened.
            self.finish(EndReason::Cancelled).await;
            return Err(HuddleError::InvalidCallState {
                action: "accept",
                state: self.state().to_string(),
            });
        }
        Ok(())
    }

    pub async fn reject(&self) -> Result<TeardownReport> {
        self.expect_state("reject", CallState::Ringing(CallDirection::Incoming))?;
        self.notify_peer(SignalKind::CallRejected).await;
        Ok(self.finish(EndReason::Rejected).await)
    }

    pub async fn cancel(&self) -> Result<TeardownReport> {
        self.expect_state("cancel", CallState::Ringing(CallDirection::Outgoing))?;
        self.notify_peer(SignalKind::CallCancelled).await;
        Ok(self.finish(EndReason::Cancelled).await)
    }

    /// Hang up from any state. Ringing calls are cancelled or rejected.
    pub async fn end_call(&self) -> TeardownReport {
        let (kind, reason) = match self.state() {
            CallState::Active => (SignalKind::CallEnded, EndReason::HungUp),
            CallState::Ringing(CallDirection::Outgoing) => (SignalKind::CallCancelled, EndReason::Cancelled),
            CallState::Ringing(CallDirection::Incoming) => (SignalKind::CallRejected, EndReason::Rejected),
            CallState::Ended(_) => return TeardownReport::default(),
        };
        self.notify_peer(kind).await;
        self.finish(reason).await
    }

    /// Tear everything down. Only the first call changes state; later calls
    /// release anything opened in the meantime.
    async fn finish(&self, reason: EndReason) -> TeardownReport {
        let first = self.transition(CallState::Ended(reason), |s| !s.is_ended());
        self.stop_ringing();
        let links: Vec<Arc<PeerLink>> = self.link.lock().await.take().into_iter().collect();
        let report = self.core.shutdown(links, PurgeScope::Session).await;
        if first {
            tracing::info!(
                call = %self.call_id,
                reason = ?reason,
                links_closed = report.links_closed,
                tracks_stopped = report.tracks_stopped,
                "Call ended"
            );
        }
        report
    }

    pub async fn toggle_mute(&self) -> Result<bool> {
        self.ensure_live("toggle mute")?;
        let links = self.link_list().await;
        Ok(self.core.toggle_mute(&links).await)
    }

    pub fn toggle_deafen(&self) -> Result<bool> {
        self.ensure_live("toggle deafen")?;
        Ok(self.core.toggle_deafen())
    }

    /// Start or stop sharing the screen and tell the peer. Returns whether a
    /// share is now active.
    pub async fn toggle_screen_share(&self, constraints: &DisplayConstraints) -> Result<bool> {
        self.expect_state("share screen", CallState::Active)?;
        let links = self.link_list().await;
        if self.core.flags().screen_sharing {
            self.core.stop_screen_share(&links).await;
            self.notify_peer(SignalKind::ScreenShareStopped).await;
            Ok(false)
        } else {
            self.core.start_screen_share(constraints, &links).await?;
            self.notify_peer(SignalKind::ScreenShareStarted).await;
            Ok(true)
        }
    }

    pub async fn play_sound(&self, clip: &SoundClip) -> Result<()> {
        self.ensure_live("play a sound")?;
        self.core.play_sound(clip).await
    }

    pub fn set_user_volume(&self, percent: u16) -> u8 {
        self.core.router().set_user_volume(self.peer, percent)
    }

    pub fn call_id(&self) -> Uuid {
        self.call_id
    }

    pub fn peer(&self) -> Uuid {
        self.peer
    }

    pub fn state(&self) -> CallState {
        *lock(&self.state)
    }

    pub fn flags(&self) -> MediaFlags {
        self.core.flags()
    }

    pub async fn link(&self) -> Option<Arc<PeerLink>> {
        self.link.lock().await.clone()
    }

    pub fn router(&self) -> &PlaybackRouter {
        self.core.router()
    }

    pub async fn mixer(&self) -> Option<Arc<AudioMixer>> {
        self.core.mixer().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::StreamRole;
    use crate::testkit::{eventually, Network, Participant};

    async fn ring(net: &Network) -> (Participant, Participant, Arc<DirectCallSession>, Arc<DirectCallSession>) {
        let (a, b) = (net.participant(), net.participant());
        let caller = DirectCallSession::start(a.ctx.clone(), b.id).await.unwrap();
        let callee = DirectCallSession::incoming(b.ctx.clone(), caller.call_id(), a.id)
            .await
            .unwrap();
        (a, b, caller, callee)
    }

    #[tokio::test]
    async fn accepted_call_carries_voice_both_ways() {
        let net = Network::new();
        let (a, b, caller, callee) = ring(&net).await;
        assert_eq!(caller.state(), CallState::Ringing(CallDirection::Outgoing));
        assert_eq!(callee.state(), CallState::Ringing(CallDirection::Incoming));
        // Nothing is captured while ringing.
        assert!(b.processors.is_empty());

        callee.accept().await.unwrap();
        assert_eq!(callee.state(), CallState::Active);
        eventually("caller active", || caller.state() == CallState::Active).await;
        eventually("voice both ways", || {
            a.events.stream_len(b.id, StreamRole::Voice) == 1
                && b.events.stream_len(a.id, StreamRole::Voice) == 1
        })
        .await;
        eventually("connected", || a.events.connected_to(b.id) && b.events.connected_to(a.id)).await;

        assert_eq!(
            a.events.call_states(),
            vec![CallState::Ringing(CallDirection::Outgoing), CallState::Active]
        );
        assert_eq!(
            b.events.call_states(),
            vec![CallState::Ringing(CallDirection::Incoming), CallState::Active]
        );

        let report = caller.end_call().await;
        assert_eq!(report.links_closed, 1);
        assert_eq!(report.tracks_stopped, 2);
        assert_eq!(caller.state(), CallState::Ended(EndReason::HungUp));
        assert_eq!(caller.end_call().await, TeardownReport::default());

        eventually("callee sees hang-up", || {
            callee.state() == CallState::Ended(EndReason::RemoteEnded)
        })
        .await;
        eventually("callee released media", || b.processors.is_empty()).await;
        assert!(a.processors.is_empty());
    }

    #[tokio::test]
    async fn rejected_call_ends_for_the_caller() {
        let net = Network::new();
        let (a, _b, caller, callee) = ring(&net).await;

        assert!(callee.cancel().await.is_err());
        let report = callee.reject().await.unwrap();
        assert_eq!(report.links_closed, 0);
        assert_eq!(callee.state(), CallState::Ended(EndReason::Rejected));

        eventually("caller sees rejection", || {
            caller.state() == CallState::Ended(EndReason::Rejected)
        })
        .await;
        eventually("caller released media", || a.processors.is_empty()).await;
        assert!(caller.link().await.is_none());
    }

    #[tokio::test]
    async fn cancelled_call_stops_ringing() {
        let net = Network::new();
        let (_a, b, caller, callee) = ring(&net).await;

        assert!(caller.accept().await.is_err());
        caller.cancel().await.unwrap();
        eventually("callee sees cancel", || {
            callee.state() == CallState::Ended(EndReason::Cancelled)
        })
        .await;
        assert_eq!(
            b.events.call_states(),
            vec![
                CallState::Ringing(CallDirection::Incoming),
                CallState::Ended(EndReason::Cancelled)
            ]
        );
        assert!(callee.accept().await.is_err());
    }

    #[tokio::test]
    async fn refused_microphone_fails_the_accept() {
        let net = Network::new();
        let (a, b, caller, callee) = ring(&net).await;
        b.devices.deny_microphone(true);

        let err = callee.accept().await.unwrap_err();
        assert_eq!(err.error_code(), "PERMISSION_DENIED");
        assert_eq!(callee.state(), CallState::Ended(EndReason::Failed));
        assert!(b.processors.is_empty());

        eventually("caller sees the call end", || {
            caller.state() == CallState::Ended(EndReason::RemoteEnded)
        })
        .await;
        eventually("caller released media", || a.processors.is_empty()).await;
    }

    #[tokio::test]
    async fn unplugged_microphone_fails_the_call_attempt() {
        let net = Network::new();
        let (a, b) = (net.participant(), net.participant());
        a.devices.unplug_microphone(true);

        let err = match DirectCallSession::start(a.ctx.clone(), b.id).await {
            Ok(_) => panic!("call should not start"),
            Err(e) => e,
        };
        assert_eq!(err.error_code(), "DEVICE_UNAVAILABLE");
        assert_eq!(net.engine.connections_from(a.id), 0);
        assert_eq!(
            a.events.call_states(),
            vec![
                CallState::Ringing(CallDirection::Outgoing),
                CallState::Ended(EndReason::Failed)
            ]
        );
    }

    #[tokio::test]
    async fn screen_share_is_announced_to_the_peer() {
        let net = Network::new();
        let (a, b, caller, callee) = ring(&net).await;
        callee.accept().await.unwrap();
        eventually("caller active", || caller.state() == CallState::Active).await;

        assert!(caller.toggle_screen_share(&DisplayConstraints::default()).await.unwrap());
        eventually("screen video arrives", || {
            b.events.stream_len(a.id, StreamRole::ScreenShare) == 1
        })
        .await;
        eventually("share announced", || b.events.screen_shares().contains(&(a.id, true))).await;

        assert!(!caller.toggle_screen_share(&DisplayConstraints::default()).await.unwrap());
        eventually("share withdrawn", || b.events.screen_shares().contains(&(a.id, false))).await;
        assert!(!caller.flags().screen_sharing);

        callee.end_call().await;
        eventually("caller sees hang-up", || {
            caller.state() == CallState::Ended(EndReason::RemoteEnded)
        })
        .await;
    }
}
