//! Redis-backed signal store.
//!
//! Layout per session:
//! - `huddle:signals:{session}:{to}`: list of JSON signals, one per recipient inbox
//! - `huddle:signal-keys:{session}`: set of inbox keys, for purging the whole session
//! - `huddle:feed:{session}:{to}`: pub/sub channel for live push
//!
//! Every key carries the signal TTL, so abandoned sessions clean themselves up.

use crate::signal::Signal;
use crate::store::SignalStore;
use async_trait::async_trait;
use futures_util::StreamExt;
use huddle_common::config::SignalingConfig;
use huddle_common::Result;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tokio::sync::mpsc;
use uuid::Uuid;

pub struct RedisSignalStore {
    client: redis::Client,
    conn: ConnectionManager,
    ttl_secs: u64,
    feed_capacity: usize,
}

impl RedisSignalStore {
    /// Connect using the signaling config section.
    pub async fn connect(url: &str, config: &SignalingConfig) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client.clone()).await?;

        tracing::info!(ttl_secs = config.signal_ttl_secs, "Connected to Redis signal store");

        Ok(Self {
            client,
            conn,
            ttl_secs: config.signal_ttl_secs,
            feed_capacity: config.feed_capacity.max(1),
        })
    }

    fn inbox_key(session_id: Uuid, to: Uuid) -> String {
        format!("huddle:signals:{session_id}:{to}")
    }

    fn index_key(session_id: Uuid) -> String {
        format!("huddle:signal-keys:{session_id}")
    }

    fn feed_channel(session_id: Uuid, to: Uuid) -> String {
        format!("huddle:feed:{session_id}:{to}")
    }
}

#[async_trait]
impl SignalStore for RedisSignalStore {
    async fn insert(&self, signal: &Signal) -> Result<()> {
        let json = serde_json::to_string(signal)?;
        let inbox = Self::inbox_key(signal.session_id, signal.to);
        let index = Self::index_key(signal.session_id);
        let channel = Self::feed_channel(signal.session_id, signal.to);
        let ttl = self.ttl_secs as i64;

        let mut conn = self.conn.clone();
        let _: () = redis::pipe()
            .atomic()
            .rpush(&inbox, &json)
            .ignore()
            .expire(&inbox, ttl)
            .ignore()
            .sadd(&index, &inbox)
            .ignore()
            .expire(&index, ttl)
            .ignore()
            .publish(&channel, &json)
            .ignore()
            .query_async(&mut conn)
            .await?;

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
        let mut conn = self.conn.clone();
        let raw: Vec<String> = conn.lrange(Self::inbox_key(session_id, to), 0, -1).await?;

        let mut signals: Vec<Signal> = raw
            .iter()
            .filter_map(|json| match serde_json::from_str::<Signal>(json) {
                Ok(signal) => Some(signal),
                Err(e) => {
                    tracing::warn!(session = %session_id, error = %e, "Skipping unreadable signal");
                    None
                }
            })
            .filter(|s| s.is_for(session_id, to) && s.from == from)
            .collect();
        signals.sort_by_key(Signal::order_key);
        Ok(signals)
    }

    async fn listen(&self, session_id: Uuid, to: Uuid) -> Result<mpsc::Receiver<Signal>> {
        let channel = Self::feed_channel(session_id, to);
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(&channel).await?;

        let (tx, out) = mpsc::channel(self.feed_capacity);
        tokio::spawn(async move {
            let mut messages = Box::pin(pubsub.into_on_message());
            loop {
                tokio::select! {
                    _ = tx.closed() => break,
                    msg = messages.next() => {
                        let Some(msg) = msg else {
                            tracing::warn!(channel = %channel, "Redis signal feed ended");
                            break;
                        };
                        let payload: String = match msg.get_payload() {
                            Ok(p) => p,
                            Err(e) => {
                                tracing::warn!(channel = %channel, error = %e, "Bad pub/sub payload");
                                continue;
                            }
                        };
                        match serde_json::from_str::<Signal>(&payload) {
                            Ok(signal) if signal.is_for(session_id, to) => {
                                if tx.send(signal).await.is_err() {
                                    break;
                                }
                            }
                            Ok(_) => {}
                            Err(e) => {
                                tracing::warn!(channel = %channel, error = %e, "Skipping unreadable signal");
                            }
                        }
                    }
                }
            }
        });

        Ok(out)
    }

    async fn purge(&self, session_id: Uuid, recipient: Option<Uuid>) -> Result<u64> {
        let mut conn = self.conn.clone();
        let index = Self::index_key(session_id);

        let inboxes: Vec<String> = match recipient {
            Some(to) => vec![Self::inbox_key(session_id, to)],
            None => conn.smembers(&index).await?,
        };

        let mut removed = 0u64;
        for inbox in &inboxes {
            let len: u64 = conn.llen(inbox).await?;
            let _: () = conn.del(inbox).await?;
            let _: () = conn.srem(&index, inbox).await?;
            removed += len;
        }
        if recipient.is_none() {
            let _: () = conn.del(&index).await?;
        }

        tracing::debug!(session = %session_id, recipient = ?recipient, removed, "Signals purged");
        Ok(removed)
    }

    async fn purge_sent(&self, session_id: Uuid, from: Uuid, to: Option<Uuid>) -> Result<u64> {
        let mut conn = self.conn.clone();
        let inboxes: Vec<String> = match to {
            Some(to) => vec![Self::inbox_key(session_id, to)],
            None => conn.smembers(Self::index_key(session_id)).await?,
        };

        let mut removed = 0u64;
        for inbox in &inboxes {
            let raw: Vec<String> = conn.lrange(inbox, 0, -1).await?;
            for json in raw {
                let sent = serde_json::from_str::<Signal>(&json)
                    .map(|s| s.from == from)
                    .unwrap_or(false);
                if sent {
                    let n: u64 = conn.lrem(inbox, 1, &json).await?;
                    removed += n;
                }
            }
        }

        tracing::debug!(session = %session_id, from = %from, to = ?to, removed, "Sent signals purged");
        Ok(removed)
    }
}
