//! Offer/answer/ICE orchestration for one peer connection.

use crate::connection::{IceCandidate, PeerConnection, SessionDescription, SignalingState};
use huddle_common::config::NegotiationConfig;
use huddle_common::{HuddleError, Result};
use huddle_signal::{Signal, SignalKind, SignalSink};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::Instant;
use uuid::Uuid;

/// What a handled signal did to the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// A remote offer was answered.
    Answered,
    /// A remote answer was applied; our offer is complete.
    Completed,
    /// Nothing changed state (candidate, ignored answer, control kind).
    Unchanged,
}

pub struct Negotiator {
    peer: Uuid,
    conn: Arc<dyn PeerConnection>,
    sink: Arc<dyn SignalSink>,
    config: NegotiationConfig,
    /// Candidates that arrived before any remote description, in arrival order.
    pending: Mutex<VecDeque<IceCandidate>>,
}

impl Negotiator {
    pub fn new(
        peer: Uuid,
        conn: Arc<dyn PeerConnection>,
        sink: Arc<dyn SignalSink>,
        config: NegotiationConfig,
    ) -> Self {
        Self {
            peer,
            conn,
            sink,
            config,
            pending: Mutex::new(VecDeque::new()),
        }
    }

    pub fn peer(&self) -> Uuid {
        self.peer
    }

    /// Create an offer, apply it locally, and send it.
    pub async fn initiate(&self) -> Result<()> {
        let offer = self.conn.create_offer().await?;
        self.conn.set_local_description(offer.clone()).await?;
        self.sink
            .send(self.peer, SignalKind::Offer, serde_json::to_value(&offer)?)
            .await?;
        tracing::info!(peer = %self.peer, "Offer sent");
        Ok(())
    }

    /// Same as `initiate`; used after the local track set changed.
    pub async fn renegotiate(&self) -> Result<()> {
        tracing::debug!(peer = %self.peer, state = %self.conn.signaling_state(), "Renegotiating");
        self.initiate().await
    }

    /// Route one negotiation signal. Control kinds are not ours and are ignored.
    pub async fn handle_signal(&self, signal: &Signal) -> Result<Outcome> {
        match signal.kind {
            SignalKind::Offer => {
                self.handle_offer(signal.decode()?).await?;
                Ok(Outcome::Answered)
            }
            SignalKind::Answer => self.handle_answer(signal.decode()?).await,
            SignalKind::IceCandidate => {
                self.handle_candidate(signal.decode()?).await?;
                Ok(Outcome::Unchanged)
            }
            _ => Ok(Outcome::Unchanged),
        }
    }

    /// Apply a remote offer and answer it.
    ///
    /// An offer that lands mid-negotiation waits briefly for `stable`. If our
    /// own offer is still pending after that, it is rolled back in favour of
    /// the remote one; any other state fails this attempt.
    pub async fn handle_offer(&self, offer: SessionDescription) -> Result<()> {
        self.await_stable().await?;

        self.conn.set_remote_description(offer).await?;
        self.flush_candidates().await;

        let answer = self.conn.create_answer().await?;
        self.conn.set_local_description(answer.clone()).await?;
        self.sink
            .send(self.peer, SignalKind::Answer, serde_json::to_value(&answer)?)
            .await?;
        tracing::info!(peer = %self.peer, "Answer sent");
        Ok(())
    }

    /// Apply a remote answer. Failures here are logged and absorbed: a stale
    /// or duplicate answer must not tear the link down.
    pub async fn handle_answer(&self, answer: SessionDescription) -> Result<Outcome> {
        let state = self.conn.signaling_state();
        if state != SignalingState::HaveLocalOffer {
            tracing::warn!(peer = %self.peer, state = %state, "Answer received without a pending offer; applying anyway");
        }

        match self.conn.set_remote_description(answer).await {
            Ok(()) => {
                self.flush_candidates().await;
                tracing::debug!(peer = %self.peer, "Answer applied");
                Ok(Outcome::Completed)
            }
            Err(e) => {
                tracing::warn!(peer = %self.peer, error = %e, "Answer rejected; continuing");
                Ok(Outcome::Unchanged)
            }
        }
    }

    /// Apply a remote candidate, or queue it until a remote description exists.
    pub async fn handle_candidate(&self, candidate: IceCandidate) -> Result<()> {
        let mut pending = self.pending.lock().await;
        if !self.conn.has_remote_description() {
            pending.push_back(candidate);
            tracing::debug!(peer = %self.peer, queued = pending.len(), "ICE candidate buffered");
            return Ok(());
        }
        self.apply_candidate(candidate).await;
        Ok(())
    }

    pub async fn pending_candidates(&self) -> usize {
        self.pending.lock().await.len()
    }

    async fn flush_candidates(&self) {
        let mut pending = self.pending.lock().await;
        if pending.is_empty() {
            return;
        }
        tracing::debug!(peer = %self.peer, count = pending.len(), "Flushing buffered ICE candidates");
        while let Some(candidate) = pending.pop_front() {
            self.apply_candidate(candidate).await;
        }
    }

    // A single bad candidate is not worth failing the connection over.
    async fn apply_candidate(&self, candidate: IceCandidate) {
        if let Err(e) = self.conn.add_ice_candidate(candidate).await {
            tracing::warn!(peer = %self.peer, error = %e, "ICE candidate rejected");
        }
    }

    async fn await_stable(&self) -> Result<()> {
        let deadline = Instant::now() + self.config.stabilize_timeout();
        loop {
            if self.conn.signaling_state() == SignalingState::Stable {
                return Ok(());
            }
            if Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(self.config.stabilize_poll()).await;
        }

        match self.conn.signaling_state() {
            SignalingState::Stable => Ok(()),
            SignalingState::HaveLocalOffer => {
                tracing::warn!(peer = %self.peer, "Offer collision; rolling back our pending offer");
                Ok(())
            }
            state => {
                tracing::error!(peer = %self.peer, state = %state, "Connection did not stabilize");
                Err(HuddleError::Unstable {
                    state: state.to_string(),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{ConnectionFactory, ConnectionState, SdpType};
    use crate::media::{MediaStream, MediaTrack, TrackKind};
    use crate::sim::{SimConnection, SimEngine};
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;

    /// Captures outgoing signals instead of relaying them.
    #[derive(Default)]
    struct Outbox {
        sent: StdMutex<Vec<Signal>>,
    }

    impl Outbox {
        fn take(&self, kind: SignalKind) -> Signal {
            let mut sent = self.sent.lock().unwrap();
            let index = sent.iter().position(|s| s.kind == kind).unwrap();
            sent.remove(index)
        }
    }

    #[async_trait]
    impl SignalSink for Outbox {
        async fn send(&self, to: Uuid, kind: SignalKind, payload: serde_json::Value) -> Result<Signal> {
            let signal = Signal::new(Uuid::nil(), Uuid::nil(), to, kind, payload);
            self.sent.lock().unwrap().push(signal.clone());
            Ok(signal)
        }
    }

    struct Side {
        negotiator: Negotiator,
        outbox: Arc<Outbox>,
        sim: Arc<SimConnection>,
    }

    fn side(engine: &SimEngine, local: Uuid, remote: Uuid) -> Side {
        let (conn, _events) = engine.create(local, remote, &[]).unwrap();
        let outbox = Arc::new(Outbox::default());
        Side {
            negotiator: Negotiator::new(remote, conn, outbox.clone(), NegotiationConfig::default()),
            outbox,
            sim: engine.connection(local, remote).unwrap(),
        }
    }

    fn candidate(n: u32) -> IceCandidate {
        IceCandidate {
            candidate: format!("candidate:{n} 1 udp 1 127.0.0.1 {n} typ host"),
            sdp_mid: Some("0".into()),
            sdp_m_line_index: Some(0),
        }
    }

    #[tokio::test]
    async fn offer_answer_round_trip_settles_both_sides() {
        let engine = SimEngine::new();
        let (a_id, b_id) = (Uuid::new_v4(), Uuid::new_v4());
        let a = side(&engine, a_id, b_id);
        let b = side(&engine, b_id, a_id);

        let mic = MediaStream::from_tracks([MediaTrack::new(TrackKind::Audio, "mic")]);
        a.sim.add_track(mic.tracks()[0].clone(), &mic).unwrap();

        a.negotiator.initiate().await.unwrap();
        let offer = a.outbox.take(SignalKind::Offer);
        assert_eq!(b.negotiator.handle_signal(&offer).await.unwrap(), Outcome::Answered);
        let answer = b.outbox.take(SignalKind::Answer);
        assert_eq!(a.negotiator.handle_signal(&answer).await.unwrap(), Outcome::Completed);

        assert_eq!(a.sim.signaling_state(), SignalingState::Stable);
        assert_eq!(b.sim.signaling_state(), SignalingState::Stable);
        assert_eq!(b.sim.remote_track_count(), 1);
        assert_eq!(a.negotiator.pending_candidates().await, 0);
        assert_eq!(b.negotiator.pending_candidates().await, 0);
    }

    #[tokio::test]
    async fn early_candidates_are_buffered_then_applied_in_order() {
        let engine = SimEngine::new();
        let (a_id, b_id) = (Uuid::new_v4(), Uuid::new_v4());
        let a = side(&engine, a_id, b_id);
        let b = side(&engine, b_id, a_id);

        for n in 1..=3 {
            b.negotiator.handle_candidate(candidate(n)).await.unwrap();
        }
        assert_eq!(b.negotiator.pending_candidates().await, 3);
        assert!(b.sim.applied_candidates().is_empty());

        a.negotiator.initiate().await.unwrap();
        b.negotiator
            .handle_signal(&a.outbox.take(SignalKind::Offer))
            .await
            .unwrap();

        assert_eq!(b.negotiator.pending_candidates().await, 0);
        assert_eq!(b.sim.applied_candidates(), vec![candidate(1), candidate(2), candidate(3)]);

        // Once a remote description exists, candidates go straight through.
        b.negotiator.handle_candidate(candidate(4)).await.unwrap();
        assert_eq!(b.sim.applied_candidates().len(), 4);
        assert_eq!(b.sim.connection_state(), ConnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn offer_collision_rolls_back_our_offer() {
        let engine = SimEngine::new();
        let (a_id, b_id) = (Uuid::new_v4(), Uuid::new_v4());
        let a = side(&engine, a_id, b_id);
        let b = side(&engine, b_id, a_id);

        a.negotiator.initiate().await.unwrap();
        b.negotiator.initiate().await.unwrap();
        let a_offer = a.outbox.take(SignalKind::Offer);
        let b_offer = b.outbox.take(SignalKind::Offer);

        a.negotiator.handle_signal(&b_offer).await.unwrap();
        b.negotiator.handle_signal(&a_offer).await.unwrap();
        assert_eq!(a.sim.signaling_state(), SignalingState::Stable);
        assert_eq!(b.sim.signaling_state(), SignalingState::Stable);

        // The crossing answers are stale now and must be absorbed.
        let stale = a.negotiator
            .handle_signal(&b.outbox.take(SignalKind::Answer))
            .await
            .unwrap();
        assert_eq!(stale, Outcome::Unchanged);
    }

    #[tokio::test(start_paused = true)]
    async fn offer_fails_when_connection_never_stabilizes() {
        let engine = SimEngine::new();
        let (a_id, b_id, c_id) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let a = side(&engine, a_id, b_id);
        let other = side(&engine, c_id, b_id);

        // Park `a` in have-remote-offer.
        let parked = other.sim.create_offer().await.unwrap();
        a.sim.set_remote_description(parked).await.unwrap();

        let offer = SessionDescription {
            sdp_type: SdpType::Offer,
            sdp: "v=0\n".into(),
        };
        let started = Instant::now();
        let err = a.negotiator.handle_offer(offer).await.unwrap_err();
        assert_eq!(err.error_code(), "UNSTABLE_NEGOTIATION");
        assert!(started.elapsed() >= NegotiationConfig::default().stabilize_timeout());
    }

    #[tokio::test]
    async fn malformed_payload_is_reported() {
        let engine = SimEngine::new();
        let a = side(&engine, Uuid::new_v4(), Uuid::new_v4());
        let bogus = Signal::new(
            Uuid::nil(),
            Uuid::nil(),
            Uuid::nil(),
            SignalKind::Offer,
            serde_json::json!({ "type": "offer" }),
        );
        let err = a.negotiator.handle_signal(&bogus).await.unwrap_err();
        assert_eq!(err.error_code(), "MALFORMED_SIGNAL");
    }
}
