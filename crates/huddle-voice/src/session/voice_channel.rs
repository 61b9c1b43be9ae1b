//! Full-mesh voice channel.
//!
//! The joiner opens links to everyone already present and sends the offers.
//! Members already present answer from responder links they open when the
//! membership change arrives. Offers that land before that are replayed from
//! the signal history when the responder subscribes.

use super::{MediaFlags, SessionContext, SessionCore, TeardownReport};
use crate::devices::DisplayConstraints;
use crate::link::{LinkNotice, PeerLink};
use crate::membership::{MemberState, MemberUpdate, MembershipChange};
use crate::mixer::{AudioMixer, SoundClip};
use crate::playback::PlaybackRouter;
use huddle_common::{HuddleError, Result};
use huddle_signal::{PurgeScope, SignalKind};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, RwLock};
use uuid::Uuid;

pub struct VoiceChannelSession {
    channel_id: Uuid,
    core: SessionCore,
    links: RwLock<HashMap<Uuid, Arc<PeerLink>>>,
    active: AtomicBool,
}

impl VoiceChannelSession {
    /// Acquire the microphone, join the channel and connect to every member.
    ///
    /// Any failure tears down whatever was started and returns the error;
    /// nothing keeps running.
    pub async fn join(ctx: SessionContext, channel_id: Uuid) -> Result<Arc<Self>> {
        let (core, notices) = SessionCore::new(ctx, channel_id);
        let session = Arc::new(Self {
            channel_id,
            core,
            links: RwLock::new(HashMap::new()),
            active: AtomicBool::new(true),
        });

        if let Err(e) = session.establish(notices).await {
            tracing::error!(channel = %channel_id, error = %e, "Joining voice channel failed");
            session.leave().await;
            return Err(e);
        }
        Ok(session)
    }

    async fn establish(self: &Arc<Self>, notices: mpsc::UnboundedReceiver<LinkNotice>) -> Result<()> {
        self.core.acquire_media().await?;

        let ctx = self.core.ctx();
        let local = self.core.local_id();
        // Watch before joining so our own join and anything after it is seen.
        let changes = ctx.membership.watch();
        ctx.membership
            .join(MemberState::new(self.channel_id, local))
            .await?;
        let members = ctx.membership.members(self.channel_id).await?;

        self.spawn_notice_loop(notices);
        for member in members.iter().filter(|m| m.user_id != local) {
            let link = self.core.open_link(member.user_id).await?;
            self.links.write().await.insert(member.user_id, link.clone());
            link.initiate().await?;
        }
        self.spawn_membership_watch(changes);

        tracing::info!(
            channel = %self.channel_id,
            peers = members.len().saturating_sub(1),
            "Joined voice channel"
        );
        Ok(())
    }

    fn spawn_notice_loop(self: &Arc<Self>, mut notices: mpsc::UnboundedReceiver<LinkNotice>) {
        let weak = Arc::downgrade(self);
        // Ends once the session and every link have dropped their senders.
        tokio::spawn(async move {
            while let Some(notice) = notices.recv().await {
                let Some(session) = weak.upgrade() else { break };
                session.on_notice(notice);
            }
        });
    }

    fn on_notice(&self, notice: LinkNotice) {
        match notice {
            LinkNotice::Control { peer, signal } => match signal.kind {
                SignalKind::ScreenShareStarted => self.core.ctx().events.on_remote_screen_share(peer, true),
                SignalKind::ScreenShareStopped => self.core.ctx().events.on_remote_screen_share(peer, false),
                kind => tracing::debug!(peer = %peer, kind = %kind, "Call control ignored in a voice channel"),
            },
            LinkNotice::NegotiationFailed { peer, error } => {
                tracing::warn!(channel = %self.channel_id, peer = %peer, error = %error, "Negotiation with member failed");
                self.core.report_link_failure(peer, &error);
            }
            LinkNotice::ConnectionState { peer, state } => {
                tracing::debug!(channel = %self.channel_id, peer = %peer, state = %state, "Member connection state");
            }
            LinkNotice::Negotiated { .. } => {}
        }
    }

    fn spawn_membership_watch(self: &Arc<Self>, mut changes: broadcast::Receiver<MembershipChange>) {
        let weak = Arc::downgrade(self);
        let channel_id = self.channel_id;
        let watcher = tokio::spawn(async move {
            loop {
                match changes.recv().await {
                    Ok(change) if change.channel_id() != channel_id => continue,
                    Ok(MembershipChange::Updated(_)) => continue,
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(channel = %channel_id, skipped, "Membership watch lagged; resyncing");
                    }
                    Err(RecvError::Closed) => break,
                }
                let Some(session) = weak.upgrade() else { break };
                if let Err(e) = session.reconcile().await {
                    tracing::warn!(channel = %channel_id, error = %e, "Membership reconcile failed");
                }
            }
        });
        self.core.track_task(watcher.abort_handle());
    }

    /// Bring the link set in line with the current member list: close links
    /// to departed members, open responder links to new ones.
    pub async fn reconcile(&self) -> Result<()> {
        if !self.is_active() {
            return Ok(());
        }
        let local = self.core.local_id();
        let present: HashSet<Uuid> = self
            .core
            .ctx()
            .membership
            .members(self.channel_id)
            .await?
            .into_iter()
            .map(|m| m.user_id)
            .filter(|id| *id != local)
            .collect();

        let departed: Vec<Arc<PeerLink>> = {
            let mut links = self.links.write().await;
            let gone: Vec<Uuid> = links
                .keys()
                .filter(|id| !present.contains(id))
                .copied()
                .collect();
            gone.iter().filter_map(|id| links.remove(id)).collect()
        };
        for link in departed {
            let peer = link.peer();
            link.close();
            let detached = self.core.router().detach_peer(peer);
            // Our answer and candidates must not greet the member if they rejoin.
            if let Err(e) = self.core.signals().forget(peer).await {
                tracing::warn!(channel = %self.channel_id, peer = %peer, error = %e, "Could not purge signals to departed member");
            }
            tracing::info!(channel = %self.channel_id, peer = %peer, detached, "Member left");
        }

        let missing: Vec<Uuid> = {
            let links = self.links.read().await;
            present
                .iter()
                .filter(|id| !links.contains_key(id))
                .copied()
                .collect()
        };
        for peer in missing {
            match self.core.open_link(peer).await {
                Ok(link) => {
                    if !self.is_active() {
                        link.close();
                        return Ok(());
                    }
                    let mut links = self.links.write().await;
                    if links.contains_key(&peer) {
                        link.close();
                        continue;
                    }
                    links.insert(peer, link);
                    tracing::info!(channel = %self.channel_id, peer = %peer, "Member joined; awaiting offer");
                }
                Err(e) => {
                    tracing::warn!(channel = %self.channel_id, peer = %peer, error = %e, "Could not open link to member");
                    self.core.report_link_failure(peer, &e);
                }
            }
        }
        Ok(())
    }

    fn ensure_active(&self, action: &'static str) -> Result<()> {
        if self.is_active() {
            Ok(())
        } else {
            Err(HuddleError::InvalidCallState {
                action,
                state: "left".into(),
            })
        }
    }

    async fn link_list(&self) -> Vec<Arc<PeerLink>> {
        self.links.read().await.values().cloned().collect()
    }

    async fn publish(&self, update: MemberUpdate) {
        let result = self
            .core
            .ctx()
            .membership
            .update(self.channel_id, self.core.local_id(), update)
            .await;
        if let Err(e) = result {
            tracing::warn!(channel = %self.channel_id, error = %e, "Could not publish member flags");
        }
    }

    /// Returns the new mute state.
    pub async fn toggle_mute(&self) -> Result<bool> {
        self.ensure_active("toggle mute")?;
        let links = self.link_list().await;
        let muted = self.core.toggle_mute(&links).await;
        self.publish(MemberUpdate {
            is_muted: Some(muted),
            ..MemberUpdate::default()
        })
        .await;
        Ok(muted)
    }

    /// Returns the new deafen state.
    pub async fn toggle_deafen(&self) -> Result<bool> {
        self.ensure_active("toggle deafen")?;
        let deafened = self.core.toggle_deafen();
        self.publish(MemberUpdate {
            is_deafened: Some(deafened),
            ..MemberUpdate::default()
        })
        .await;
        Ok(deafened)
    }

    /// Start or stop sharing the screen with every member. Returns whether
    /// a share is now active.
    pub async fn toggle_screen_share(&self, constraints: &DisplayConstraints) -> Result<bool> {
        self.ensure_active("share screen")?;
        let links = self.link_list().await;
        let sharing = if self.core.flags().screen_sharing {
            self.core.stop_screen_share(&links).await;
            false
        } else {
            self.core.start_screen_share(constraints, &links).await?;
            true
        };
        self.publish(MemberUpdate {
            is_screen_sharing: Some(sharing),
            ..MemberUpdate::default()
        })
        .await;
        Ok(sharing)
    }

    pub async fn play_sound(&self, clip: &SoundClip) -> Result<()> {
        self.ensure_active("play a sound")?;
        self.core.play_sound(clip).await
    }

    /// Playback volume for one member, in percent.
    pub fn set_user_volume(&self, peer: Uuid, percent: u16) -> u8 {
        self.core.router().set_user_volume(peer, percent)
    }

    /// Close every link, stop capture, purge the signals we sent and
    /// received, and leave the channel.
    /// A second call does nothing.
    pub async fn leave(&self) -> TeardownReport {
        if !self.active.swap(false, Ordering::AcqRel) {
            return TeardownReport::default();
        }
        let links: Vec<Arc<PeerLink>> = self.links.write().await.drain().map(|(_, l)| l).collect();
        let report = self.core.shutdown(links, PurgeScope::Participant).await;

        let ctx = self.core.ctx();
        if let Err(e) = ctx.membership.leave(self.channel_id, ctx.local_id).await {
            tracing::warn!(channel = %self.channel_id, error = %e, "Could not leave membership");
        }
        tracing::info!(
            channel = %self.channel_id,
            links_closed = report.links_closed,
            tracks_stopped = report.tracks_stopped,
            "Left voice channel"
        );
        report
    }

    pub fn channel_id(&self) -> Uuid {
        self.channel_id
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn flags(&self) -> MediaFlags {
        self.core.flags()
    }

    pub async fn link(&self, peer: Uuid) -> Option<Arc<PeerLink>> {
        self.links.read().await.get(&peer).cloned()
    }

    pub async fn peers(&self) -> Vec<Uuid> {
        let mut peers: Vec<Uuid> = self.links.read().await.keys().copied().collect();
        peers.sort();
        peers
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
    use crate::media::TrackKind;
    use crate::membership::MembershipDirectory;
    use crate::testkit::{eventually, Network};
    use huddle_signal::SignalStore;

    #[tokio::test]
    async fn three_members_form_a_full_mesh() {
        let net = Network::new();
        let channel = Uuid::new_v4();
        let (a, b, c) = (net.participant(), net.participant(), net.participant());

        let sb = VoiceChannelSession::join(b.ctx.clone(), channel).await.unwrap();
        let sc = VoiceChannelSession::join(c.ctx.clone(), channel).await.unwrap();
        let sa = VoiceChannelSession::join(a.ctx.clone(), channel).await.unwrap();

        for (events, peers) in [(&a.events, [b.id, c.id]), (&b.events, [a.id, c.id]), (&c.events, [a.id, b.id])] {
            for peer in peers {
                eventually("voice from every member", || {
                    events.stream_len(peer, StreamRole::Voice) == 1
                })
                .await;
            }
        }

        assert_eq!(sa.peers().await.len(), 2);
        assert_eq!(sb.peers().await.len(), 2);
        assert_eq!(sc.peers().await.len(), 2);
        assert_eq!(net.engine.connections_from(a.id), 2);
        assert_eq!(net.engine.connections_between(b.id, a.id), 1);
        assert_eq!(net.engine.connections_between(c.id, a.id), 1);
        assert_eq!(net.engine.connections_between(b.id, c.id), 1);

        // The joiner offers; members already present only answer.
        for peer in [b.id, c.id] {
            assert_eq!(net.engine.connection(a.id, peer).unwrap().offers_created(), 1);
            assert_eq!(net.engine.connection(peer, a.id).unwrap().offers_created(), 0);
        }

        for session in [&sa, &sb, &sc] {
            session.leave().await;
        }
    }

    #[tokio::test]
    async fn screen_share_reaches_members_as_one_stream() {
        let net = Network::new();
        let channel = Uuid::new_v4();
        let (a, b) = (net.participant(), net.participant());
        let sb = VoiceChannelSession::join(b.ctx.clone(), channel).await.unwrap();
        let sa = VoiceChannelSession::join(a.ctx.clone(), channel).await.unwrap();
        eventually("voice", || b.events.stream_len(a.id, StreamRole::Voice) == 1).await;

        let constraints = DisplayConstraints::default().with_audio(crate::capture::ScreenAudioSource::application(4242));
        assert!(sa.toggle_screen_share(&constraints).await.unwrap());
        assert!(sa.flags().screen_sharing);

        eventually("screen share video and audio", || {
            b.events.stream_len(a.id, StreamRole::ScreenShare) == 2
        })
        .await;
        let share = b.events.stream(a.id, StreamRole::ScreenShare).unwrap();
        assert_eq!(share.video_tracks().len(), 1);
        assert_eq!(share.audio_tracks().len(), 1);
        // Screen audio never lands in the voice stream.
        assert_eq!(b.events.stream_len(a.id, StreamRole::Voice), 1);
        assert_eq!(b.events.stream(a.id, StreamRole::Voice).unwrap().tracks()[0].kind(), TrackKind::Audio);

        let member = net
            .membership
            .members(channel)
            .await
            .unwrap()
            .into_iter()
            .find(|m| m.user_id == a.id)
            .unwrap();
        assert!(member.is_screen_sharing);

        assert!(!sa.toggle_screen_share(&constraints).await.unwrap());
        eventually("screen share withdrawn", || {
            b.events.stream_len(a.id, StreamRole::ScreenShare) == 0
        })
        .await;

        sa.leave().await;
        sb.leave().await;
    }

    #[tokio::test]
    async fn deafen_silences_playback_without_muting() {
        let net = Network::new();
        let channel = Uuid::new_v4();
        let (a, b) = (net.participant(), net.participant());
        let sb = VoiceChannelSession::join(b.ctx.clone(), channel).await.unwrap();
        let sa = VoiceChannelSession::join(a.ctx.clone(), channel).await.unwrap();
        eventually("voice both ways", || {
            a.events.stream_len(b.id, StreamRole::Voice) == 1
                && b.events.stream_len(a.id, StreamRole::Voice) == 1
        })
        .await;

        assert!(sa.toggle_deafen().await.unwrap());
        assert_eq!(sa.router().effective_volume(b.id, StreamRole::Voice), Some(0.0));
        assert_eq!(sb.router().effective_volume(a.id, StreamRole::Voice), Some(1.0));

        let outbound = sa.mixer().await.unwrap().output_track().id().to_string();
        let conn = net.engine.connection(a.id, b.id).unwrap();
        assert_eq!(conn.sender_active(&outbound), Some(true));

        assert!(sa.toggle_mute().await.unwrap());
        assert_eq!(conn.sender_active(&outbound), Some(false));
        assert!(!sa.mixer().await.unwrap().output_track().is_enabled());

        let flags = sa.flags();
        assert!(flags.muted && flags.deafened);
        sa.leave().await;
        sb.leave().await;
    }

    #[tokio::test]
    async fn leaving_releases_everything_once() {
        let net = Network::new();
        let channel = Uuid::new_v4();
        let (a, b) = (net.participant(), net.participant());
        let sb = VoiceChannelSession::join(b.ctx.clone(), channel).await.unwrap();
        let sa = VoiceChannelSession::join(a.ctx.clone(), channel).await.unwrap();
        eventually("B sees A", || b.events.stream_len(a.id, StreamRole::Voice) == 1).await;
        assert_eq!(a.processors.len(), 1);

        let report = sa.leave().await;
        assert_eq!(report.links_closed, 1);
        // Microphone plus mixer output.
        assert_eq!(report.tracks_stopped, 2);
        assert!(a.processors.is_empty());
        assert!(!sa.is_active());
        assert_eq!(sa.leave().await, TeardownReport::default());
        assert!(sa.toggle_mute().await.is_err());

        // B drops its link to A once the departure is broadcast.
        eventually("B forgets A", || sb.router().stream(a.id, StreamRole::Voice).is_none()).await;
        assert!(sb.link(a.id).await.is_none());
        sb.leave().await;
    }

    #[tokio::test]
    async fn rejoining_member_is_heard_as_voice_again() {
        let net = Network::new();
        let channel = Uuid::new_v4();
        let (a, b) = (net.participant(), net.participant());
        let sb = VoiceChannelSession::join(b.ctx.clone(), channel).await.unwrap();
        let sa = VoiceChannelSession::join(a.ctx.clone(), channel).await.unwrap();
        eventually("B hears A", || b.events.stream_len(a.id, StreamRole::Voice) == 1).await;

        sa.leave().await;
        assert!(net.store.history(channel, b.id, a.id).await.unwrap().is_empty());
        eventually("B forgets A", || sb.router().stream(a.id, StreamRole::Voice).is_none()).await;
        let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(5);
        while !net.store.history(channel, a.id, b.id).await.unwrap().is_empty() {
            assert!(tokio::time::Instant::now() < deadline, "B's answer to A was never purged");
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }

        let sa = VoiceChannelSession::join(a.ctx.clone(), channel).await.unwrap();
        let voice = sa.mixer().await.unwrap().output_track().id().to_string();
        eventually("B hears A's new voice track as voice", || {
            b.events
                .stream(a.id, StreamRole::Voice)
                .is_some_and(|s| s.contains(&voice))
        })
        .await;

        let link = sb.link(a.id).await.unwrap();
        let heard = link.stream(StreamRole::Voice).tracks();
        assert_eq!(heard.len(), 1);
        assert_eq!(heard[0].id(), voice);
        assert!(link.stream(StreamRole::Soundpad).is_empty());
        assert_eq!(net.engine.connections_between(b.id, a.id), 2);

        sa.leave().await;
        sb.leave().await;
    }

    #[tokio::test]
    async fn soundboard_is_pumped_to_peers_and_the_local_monitor() {
        let net = Network::new();
        let channel = Uuid::new_v4();
        let a = net.participant();
        let audio = a.devices.audio().clone();
        let sa = VoiceChannelSession::join(a.ctx.clone(), channel).await.unwrap();
        eventually("mixer pump running", || audio.outbound().blocks > 0).await;

        sa.play_sound(&SoundClip::new("ding", vec![0.25; 96_000])).await.unwrap();
        eventually("clip heard locally", || audio.monitor().last_peak > 0.2).await;
        eventually("clip sent to peers", || audio.outbound().last_peak > 0.2).await;

        assert!(sa.toggle_mute().await.unwrap());
        eventually("muted outbound is silent", || audio.outbound().last_peak == 0.0).await;
        assert!(audio.monitor().last_peak > 0.2);

        sa.leave().await;
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        let blocks = audio.outbound().blocks;
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(audio.outbound().blocks, blocks);
    }

    #[tokio::test]
    async fn refused_microphone_leaves_nothing_behind() {
        let net = Network::new();
        let channel = Uuid::new_v4();
        let (a, b) = (net.participant(), net.participant());
        let sb = VoiceChannelSession::join(b.ctx.clone(), channel).await.unwrap();

        a.devices.deny_microphone(true);
        let err = match VoiceChannelSession::join(a.ctx.clone(), channel).await {
            Ok(_) => panic!("join should fail"),
            Err(e) => e,
        };
        assert_eq!(err.error_code(), "PERMISSION_DENIED");
        assert!(a.processors.is_empty());
        assert_eq!(net.engine.connections_from(a.id), 0);
        assert_eq!(net.membership.members(channel).await.unwrap().len(), 1);
        assert!(sb.peers().await.is_empty());
        sb.leave().await;
    }
}
