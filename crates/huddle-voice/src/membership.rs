//! Voice channel membership: who is in which channel, and their flags.
//!
//! Voice channel sessions read the member list on join and reconcile their
//! links whenever a change for their channel is broadcast.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use huddle_common::{HuddleError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

/// One member row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemberState {
    pub channel_id: Uuid,
    pub user_id: Uuid,
    pub is_muted: bool,
    pub is_deafened: bool,
    pub is_screen_sharing: bool,
    pub joined_at: DateTime<Utc>,
}

impl MemberState {
    pub fn new(channel_id: Uuid, user_id: Uuid) -> Self {
        Self {
            channel_id,
            user_id,
            is_muted: false,
            is_deafened: false,
            is_screen_sharing: false,
            joined_at: Utc::now(),
        }
    }
}

/// Flag changes; `None` leaves a flag as it is.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub struct MemberUpdate {
    pub is_muted: Option<bool>,
    pub is_deafened: Option<bool>,
    pub is_screen_sharing: Option<bool>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MembershipChange {
    Joined(MemberState),
    Updated(MemberState),
    Left { channel_id: Uuid, user_id: Uuid },
}

impl MembershipChange {
    pub fn channel_id(&self) -> Uuid {
        match self {
            Self::Joined(m) | Self::Updated(m) => m.channel_id,
            Self::Left { channel_id, .. } => *channel_id,
        }
    }

    pub fn user_id(&self) -> Uuid {
        match self {
            Self::Joined(m) | Self::Updated(m) => m.user_id,
            Self::Left { user_id, .. } => *user_id,
        }
    }
}

#[async_trait]
pub trait MembershipDirectory: Send + Sync {
    /// Add a member. A user already in another channel leaves it first.
    async fn join(&self, member: MemberState) -> Result<()>;
    /// Returns whether the user was in `channel_id`.
    async fn leave(&self, channel_id: Uuid, user_id: Uuid) -> Result<bool>;
    async fn update(&self, channel_id: Uuid, user_id: Uuid, update: MemberUpdate) -> Result<MemberState>;
    /// Members of a channel in join order.
    async fn members(&self, channel_id: Uuid) -> Result<Vec<MemberState>>;
    /// Changes for every channel, from now on.
    fn watch(&self) -> broadcast::Receiver<MembershipChange>;
}

/// In-memory directory with a user index and a channel index.
#[derive(Clone)]
pub struct MemoryMembership {
    by_user: Arc<RwLock<HashMap<Uuid, MemberState>>>,
    by_channel: Arc<RwLock<HashMap<Uuid, Vec<Uuid>>>>,
    changes: broadcast::Sender<MembershipChange>,
}

impl MemoryMembership {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(1024);
        Self {
            by_user: Arc::new(RwLock::new(HashMap::new())),
            by_channel: Arc::new(RwLock::new(HashMap::new())),
            changes,
        }
    }

    /// Where a user currently is.
    pub async fn channel_of(&self, user_id: Uuid) -> Option<Uuid> {
        self.by_user.read().await.get(&user_id).map(|m| m.channel_id)
    }

    async fn remove(&self, user_id: Uuid) -> Option<MemberState> {
        let state = self.by_user.write().await.remove(&user_id)?;
        let mut channels = self.by_channel.write().await;
        if let Some(members) = channels.get_mut(&state.channel_id) {
            members.retain(|u| *u != user_id);
            if members.is_empty() {
                channels.remove(&state.channel_id);
            }
        }
        Some(state)
    }

    fn publish(&self, change: MembershipChange) {
        // Nobody watching is fine.
        let _ = self.changes.send(change);
    }
}

impl Default for MemoryMembership {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MembershipDirectory for MemoryMembership {
    async fn join(&self, member: MemberState) -> Result<()> {
        if let Some(previous) = self.remove(member.user_id).await {
            tracing::info!(
                user = %previous.user_id,
                channel = %previous.channel_id,
                "User moved out of voice channel"
            );
            self.publish(MembershipChange::Left {
                channel_id: previous.channel_id,
                user_id: previous.user_id,
            });
        }

        self.by_user
            .write()
            .await
            .insert(member.user_id, member.clone());
        self.by_channel
            .write()
            .await
            .entry(member.channel_id)
            .or_default()
            .push(member.user_id);

        tracing::info!(user = %member.user_id, channel = %member.channel_id, "User joined voice channel");
        self.publish(MembershipChange::Joined(member));
        Ok(())
    }

    async fn leave(&self, channel_id: Uuid, user_id: Uuid) -> Result<bool> {
        if self.channel_of(user_id).await != Some(channel_id) {
            return Ok(false);
        }
        self.remove(user_id).await;
        tracing::info!(user = %user_id, channel = %channel_id, "User left voice channel");
        self.publish(MembershipChange::Left { channel_id, user_id });
        Ok(true)
    }

    async fn update(&self, channel_id: Uuid, user_id: Uuid, update: MemberUpdate) -> Result<MemberState> {
        let state = {
            let mut users = self.by_user.write().await;
            let state = users
                .get_mut(&user_id)
                .filter(|s| s.channel_id == channel_id)
                .ok_or_else(|| HuddleError::Membership {
                    message: format!("{user_id} is not in voice channel {channel_id}"),
                })?;
            if let Some(muted) = update.is_muted {
                state.is_muted = muted;
            }
            if let Some(deafened) = update.is_deafened {
                state.is_deafened = deafened;
            }
            if let Some(sharing) = update.is_screen_sharing {
                state.is_screen_sharing = sharing;
            }
            state.clone()
        };
        self.publish(MembershipChange::Updated(state.clone()));
        Ok(state)
    }

    async fn members(&self, channel_id: Uuid) -> Result<Vec<MemberState>> {
        let ids = self
            .by_channel
            .read()
            .await
            .get(&channel_id)
            .cloned()
            .unwrap_or_default();
        let users = self.by_user.read().await;
        Ok(ids.iter().filter_map(|id| users.get(id).cloned()).collect())
    }

    fn watch(&self) -> broadcast::Receiver<MembershipChange> {
        self.changes.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn joining_elsewhere_leaves_the_old_channel() {
        let dir = MemoryMembership::new();
        let (lobby, games, user) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let mut changes = dir.watch();

        dir.join(MemberState::new(lobby, user)).await.unwrap();
        dir.join(MemberState::new(games, user)).await.unwrap();

        assert!(dir.members(lobby).await.unwrap().is_empty());
        assert_eq!(dir.members(games).await.unwrap().len(), 1);
        assert_eq!(dir.channel_of(user).await, Some(games));

        assert!(matches!(changes.recv().await.unwrap(), MembershipChange::Joined(_)));
        let left = changes.recv().await.unwrap();
        assert_eq!(left, MembershipChange::Left { channel_id: lobby, user_id: user });
    }

    #[tokio::test]
    async fn members_are_listed_in_join_order() {
        let dir = MemoryMembership::new();
        let channel = Uuid::new_v4();
        let users: Vec<Uuid> = (0..3).map(|_| Uuid::new_v4()).collect();
        for user in &users {
            dir.join(MemberState::new(channel, *user)).await.unwrap();
        }
        let listed: Vec<Uuid> = dir
            .members(channel)
            .await
            .unwrap()
            .iter()
            .map(|m| m.user_id)
            .collect();
        assert_eq!(listed, users);
    }

    #[tokio::test]
    async fn update_requires_membership() {
        let dir = MemoryMembership::new();
        let (channel, user) = (Uuid::new_v4(), Uuid::new_v4());
        let update = MemberUpdate {
            is_muted: Some(true),
            ..MemberUpdate::default()
        };
        assert!(dir.update(channel, user, update).await.is_err());

        dir.join(MemberState::new(channel, user)).await.unwrap();
        let state = dir.update(channel, user, update).await.unwrap();
        assert!(state.is_muted);
        assert!(!state.is_deafened);

        assert!(dir.leave(channel, user).await.unwrap());
        assert!(!dir.leave(channel, user).await.unwrap());
    }
}
