//! Per-session signaling channel: send, replay-then-live subscribe, teardown.

use crate::signal::{Signal, SignalKind};
use crate::store::SignalStore;
use async_trait::async_trait;
use huddle_common::config::SignalingConfig;
use huddle_common::{HuddleError, Result};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::{AbortHandle, JoinHandle};
use uuid::Uuid;

/// Outbound half of the transport. The negotiation layer only needs this.
#[async_trait]
pub trait SignalSink: Send + Sync {
    async fn send(&self, to: Uuid, kind: SignalKind, payload: serde_json::Value) -> Result<Signal>;
}

/// What `teardown` deletes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PurgeScope {
    /// Every signal of the session (direct calls: both parties are done).
    Session,
    /// Signals addressed to us and signals we sent (voice channels: the
    /// others keep negotiating among themselves).
    Participant,
}

/// Signaling for one participant within one session.
pub struct SignalingChannel {
    store: Arc<dyn SignalStore>,
    session_id: Uuid,
    self_id: Uuid,
    subscribe_timeout: Duration,
    feed_capacity: usize,
    feeds: Mutex<Vec<AbortHandle>>,
}

impl SignalingChannel {
    pub fn new(
        store: Arc<dyn SignalStore>,
        session_id: Uuid,
        self_id: Uuid,
        config: &SignalingConfig,
    ) -> Self {
        Self {
            store,
            session_id,
            self_id,
            subscribe_timeout: config.subscribe_timeout(),
            feed_capacity: config.feed_capacity.max(1),
            feeds: Mutex::new(Vec::new()),
        }
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn self_id(&self) -> Uuid {
        self.self_id
    }

    /// Subscribe to signals sent to us by `peer`.
    ///
    /// The live feed is opened before history is read, so nothing inserted
    /// during the replay is lost; anything seen in both is delivered once.
    /// Opening the feed and reading history together are bounded by the
    /// subscribe timeout. There is no retry here: the caller aborts the call attempt.
    pub async fn subscribe(&self, peer: Uuid) -> Result<Subscription> {
        let setup = async {
            let live = self.store.listen(self.session_id, self.self_id).await?;
            let history = self
                .store
                .history(self.session_id, self.self_id, peer)
                .await?;
            Ok::<_, HuddleError>((live, history))
        };

        let (mut live, history) = match tokio::time::timeout(self.subscribe_timeout, setup).await
        {
            Ok(result) => result?,
            Err(_) => {
                tracing::error!(
                    session = %self.session_id,
                    peer = %peer,
                    timeout_ms = self.subscribe_timeout.as_millis() as u64,
                    "Signal subscription timed out"
                );
                return Err(HuddleError::SubscribeTimeout {
                    peer,
                    timeout_ms: self.subscribe_timeout.as_millis() as u64,
                });
            }
        };

        tracing::debug!(
            session = %self.session_id,
            peer = %peer,
            replayed = history.len(),
            "Signal subscription established"
        );

        let (tx, rx) = mpsc::channel(self.feed_capacity);
        let task = tokio::spawn(async move {
            let mut seen: HashSet<Uuid> = HashSet::new();

            for signal in history {
                if seen.insert(signal.id) && tx.send(signal).await.is_err() {
                    return;
                }
            }

            while let Some(signal) = live.recv().await {
                if signal.from != peer {
                    continue;
                }
                if !seen.insert(signal.id) {
                    tracing::debug!(signal = %signal.id, kind = %signal.kind, "Duplicate signal dropped");
                    continue;
                }
                if tx.send(signal).await.is_err() {
                    break;
                }
            }
        });

        if let Ok(mut feeds) = self.feeds.lock() {
            feeds.retain(|h| !h.is_finished());
            feeds.push(task.abort_handle());
        }

        Ok(Subscription { peer, rx, task })
    }

    /// Stop every feed and purge persisted signals. Signals are transient, not an audit log.
    pub async fn teardown(&self, scope: PurgeScope) -> Result<u64> {
        if let Ok(mut feeds) = self.feeds.lock() {
            for feed in feeds.drain(..) {
                feed.abort();
            }
        }

        let removed = match scope {
            PurgeScope::Session => self.store.purge(self.session_id, None).await?,
            PurgeScope::Participant => {
                self.store.purge(self.session_id, Some(self.self_id)).await?
                    + self.store.purge_sent(self.session_id, self.self_id, None).await?
            }
        };

        tracing::info!(
            session = %self.session_id,
            scope = ?scope,
            removed,
            "Signaling torn down"
        );
        Ok(removed)
    }

    /// Delete what we sent to `peer`, so a later link to the same peer
    /// replays nothing from this one.
    pub async fn forget(&self, peer: Uuid) -> Result<u64> {
        let removed = self
            .store
            .purge_sent(self.session_id, self.self_id, Some(peer))
            .await?;
        tracing::debug!(session = %self.session_id, peer = %peer, removed, "Signals to peer purged");
        Ok(removed)
    }
}

#[async_trait]
impl SignalSink for SignalingChannel {
    async fn send(&self, to: Uuid, kind: SignalKind, payload: serde_json::Value) -> Result<Signal> {
        let signal = Signal::new(self.session_id, self.self_id, to, kind, payload);
        self.store.insert(&signal).await?;
        Ok(signal)
    }
}

/// Ordered, de-duplicated signals from one peer. Dropping it stops the feed.
pub struct Subscription {
    peer: Uuid,
    rx: mpsc::Receiver<Signal>,
    task: JoinHandle<()>,
}

impl Subscription {
    pub fn peer(&self) -> Uuid {
        self.peer
    }

    /// Next signal, or `None` once the feed has stopped.
    pub async fn next(&mut self) -> Option<Signal> {
        self.rx.recv().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemorySignalStore;
    use serde_json::json;

    fn channel(store: Arc<dyn SignalStore>, session: Uuid, me: Uuid) -> SignalingChannel {
        SignalingChannel::new(store, session, me, &SignalingConfig::default())
    }

    #[tokio::test]
    async fn replays_history_before_live_in_order() {
        let store = Arc::new(MemorySignalStore::new());
        let (session, a, b) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let from_a = channel(store.clone(), session, a);
        let at_b = channel(store.clone(), session, b);

        from_a.send(b, SignalKind::Offer, json!({ "n": 1 })).await.unwrap();
        from_a.send(b, SignalKind::IceCandidate, json!({ "n": 2 })).await.unwrap();

        let mut sub = at_b.subscribe(a).await.unwrap();
        from_a.send(b, SignalKind::IceCandidate, json!({ "n": 3 })).await.unwrap();

        for expected in 1..=3 {
            let signal = sub.next().await.unwrap();
            assert_eq!(signal.payload["n"], expected);
        }
    }

    #[tokio::test]
    async fn replayed_then_pushed_signal_is_delivered_once() {
        let store = Arc::new(MemorySignalStore::new());
        let (session, a, b) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let from_a = channel(store.clone(), session, a);
        let at_b = channel(store.clone(), session, b);

        let offer = from_a.send(b, SignalKind::Offer, json!({})).await.unwrap();
        let mut sub = at_b.subscribe(a).await.unwrap();

        // The relay retries the same row over the live feed.
        store.redeliver(&offer);
        let ended = from_a.send(b, SignalKind::CallEnded, json!({})).await.unwrap();

        assert_eq!(sub.next().await.unwrap().id, offer.id);
        assert_eq!(sub.next().await.unwrap().id, ended.id);
    }

    #[tokio::test]
    async fn other_senders_are_filtered_out() {
        let store = Arc::new(MemorySignalStore::new());
        let (session, a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let at_b = channel(store.clone(), session, b);
        let mut sub = at_b.subscribe(a).await.unwrap();

        channel(store.clone(), session, c)
            .send(b, SignalKind::Offer, json!({}))
            .await
            .unwrap();
        let from_a = channel(store.clone(), session, a)
            .send(b, SignalKind::Answer, json!({}))
            .await
            .unwrap();

        assert_eq!(sub.next().await.unwrap().id, from_a.id);
    }

    struct StalledStore;

    #[async_trait]
    impl SignalStore for StalledStore {
        async fn insert(&self, _signal: &Signal) -> Result<()> {
            Ok(())
        }
        async fn history(&self, _s: Uuid, _t: Uuid, _f: Uuid) -> Result<Vec<Signal>> {
            Ok(Vec::new())
        }
        async fn listen(&self, _s: Uuid, _t: Uuid) -> Result<mpsc::Receiver<Signal>> {
            std::future::pending().await
        }
        async fn purge(&self, _s: Uuid, _r: Option<Uuid>) -> Result<u64> {
            Ok(0)
        }
        async fn purge_sent(&self, _s: Uuid, _f: Uuid, _t: Option<Uuid>) -> Result<u64> {
            Ok(0)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn subscribe_times_out() {
        let peer = Uuid::new_v4();
        let channel = channel(Arc::new(StalledStore), Uuid::new_v4(), Uuid::new_v4());
        match channel.subscribe(peer).await {
            Err(HuddleError::SubscribeTimeout { peer: p, timeout_ms }) => {
                assert_eq!(p, peer);
                assert_eq!(timeout_ms, 10_000);
            }
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("subscription should not succeed"),
        }
    }

    #[tokio::test]
    async fn teardown_purges_by_scope() {
        let store = Arc::new(MemorySignalStore::new());
        let (session, a, b) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let c = Uuid::new_v4();
        let ch_a = channel(store.clone(), session, a);
        let ch_b = channel(store.clone(), session, b);
        let ch_c = channel(store.clone(), session, c);
        ch_a.send(b, SignalKind::Offer, json!({})).await.unwrap();
        ch_b.send(a, SignalKind::Answer, json!({})).await.unwrap();
        ch_c.send(a, SignalKind::Offer, json!({})).await.unwrap();

        // B's inbox and B's answer go; C's offer to A stays.
        assert_eq!(ch_b.teardown(PurgeScope::Participant).await.unwrap(), 2);
        assert_eq!(store.len().await, 1);
        assert_eq!(ch_a.teardown(PurgeScope::Session).await.unwrap(), 1);
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn forgetting_a_peer_drops_only_what_we_sent_it() {
        let store = Arc::new(MemorySignalStore::new());
        let (session, a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let ch_a = channel(store.clone(), session, a);
        ch_a.send(b, SignalKind::Answer, json!({})).await.unwrap();
        ch_a.send(c, SignalKind::Answer, json!({})).await.unwrap();
        channel(store.clone(), session, b)
            .send(a, SignalKind::Offer, json!({}))
            .await
            .unwrap();

        assert_eq!(ch_a.forget(b).await.unwrap(), 1);
        assert!(store.history(session, b, a).await.unwrap().is_empty());
        assert_eq!(store.history(session, c, a).await.unwrap().len(), 1);
        assert_eq!(store.history(session, a, b).await.unwrap().len(), 1);
    }
}
