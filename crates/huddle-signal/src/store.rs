//! Signal persistence + push seam, and the in-process store.

use crate::signal::Signal;
use async_trait::async_trait;
use huddle_common::Result;
use tokio::sync::{broadcast, mpsc, RwLock};
use uuid::Uuid;

/// Durable, at-least-once signal relay.
///
/// Implementations persist each signal once and push it to live listeners of
/// its `(session_id, to)` inbox. Nothing here de-duplicates; that is the
/// subscriber's job.
#[async_trait]
pub trait SignalStore: Send + Sync {
    /// Persist one signal and push it to live listeners.
    async fn insert(&self, signal: &Signal) -> Result<()>;

    /// Persisted signals for `to` from `from`, ordered by creation time.
    async fn history(&self, session_id: Uuid, to: Uuid, from: Uuid) -> Result<Vec<Signal>>;

    /// Live feed of everything inserted into `to`'s inbox after this call returns.
    async fn listen(&self, session_id: Uuid, to: Uuid) -> Result<mpsc::Receiver<Signal>>;

    /// Delete persisted signals for a session, or only `recipient`'s inbox.
    /// Returns how many signals were removed.
    async fn purge(&self, session_id: Uuid, recipient: Option<Uuid>) -> Result<u64>;

    /// Delete signals `from` sent in a session, or only those it sent to `to`.
    async fn purge_sent(&self, session_id: Uuid, from: Uuid, to: Option<Uuid>) -> Result<u64>;
}

/// In-process signal store: a row table plus a broadcast fan-out.
///
/// Both parties must share the same instance (tests, the local demo, or
/// several sessions embedded in one process).
pub struct MemorySignalStore {
    rows: RwLock<Vec<Signal>>,
    live: broadcast::Sender<Signal>,
    feed_capacity: usize,
}

impl MemorySignalStore {
    pub fn new() -> Self {
        Self::with_capacity(256)
    }

    pub fn with_capacity(feed_capacity: usize) -> Self {
        let (live, _) = broadcast::channel(10_000);
        Self {
            rows: RwLock::new(Vec::new()),
            live,
            feed_capacity: feed_capacity.max(1),
        }
    }

    /// Number of persisted signals across all sessions.
    pub async fn len(&self) -> usize {
        self.rows.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.rows.read().await.is_empty()
    }

    /// Re-push an already persisted signal, as a retrying relay would.
    pub fn redeliver(&self, signal: &Signal) {
        let _ = self.live.send(signal.clone());
    }
}

impl Default for MemorySignalStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SignalStore for MemorySignalStore {
    async fn insert(&self, signal: &Signal) -> Result<()> {
        self.rows.write().await.push(signal.clone());
        // No receivers is fine: the row is still there for replay.
        let _ = self.live.send(signal.clone());
        tracing::debug!(
            session = %signal.session_id,
            from = %signal.from,
            to = %signal.to,
            kind = %signal.kind,
            "Signal stored"
        );
        Ok(())
    }

    async fn history(&self, session_id: Uuid, to: Uuid, from: Uuid) -> Result<Vec<Signal>> {
        let mut signals: Vec<Signal> = self
            .rows
            .read()
            .await
            .iter()
            .filter(|s| s.is_for(session_id, to) && s.from == from)
            .cloned()
            .collect();
        signals.sort_by_key(Signal::order_key);
        Ok(signals)
    }

    async fn listen(&self, session_id: Uuid, to: Uuid) -> Result<mpsc::Receiver<Signal>> {
        let mut rx = self.live.subscribe();
        let (tx, out) = mpsc::channel(self.feed_capacity);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tx.closed() => break,
                    msg = rx.recv() => match msg {
                        Ok(signal) if signal.is_for(session_id, to) => {
                            if tx.send(signal).await.is_err() {
                                break;
                            }
                        }
                        Ok(_) => {}
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::warn!(
                                session = %session_id,
                                to = %to,
                                skipped,
                                "Signal feed lagged; missed signals are only recoverable by replay"
                            );
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
        });

        Ok(out)
    }

    async fn purge(&self, session_id: Uuid, recipient: Option<Uuid>) -> Result<u64> {
        let mut rows = self.rows.write().await;
        let before = rows.len();
        rows.retain(|s| match recipient {
            Some(to) => !s.is_for(session_id, to),
            None => s.session_id != session_id,
        });
        let removed = (before - rows.len()) as u64;

        tracing::debug!(session = %session_id, recipient = ?recipient, removed, "Signals purged");
        Ok(removed)
    }

    async fn purge_sent(&self, session_id: Uuid, from: Uuid, to: Option<Uuid>) -> Result<u64> {
        let mut rows = self.rows.write().await;
        let before = rows.len();
        rows.retain(|s| {
            let sent = s.session_id == session_id && s.from == from;
            !(sent && to.is_none_or(|to| s.to == to))
        });
        let removed = (before - rows.len()) as u64;

        tracing::debug!(session = %session_id, from = %from, to = ?to, removed, "Sent signals purged");
        Ok(removed)
    }
}
