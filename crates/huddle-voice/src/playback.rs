//! Where inbound streams are played and how loud.

use crate::classify::StreamRole;
use crate::media::MediaStream;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

pub const DEFAULT_VOLUME: u8 = 100;
pub const MAX_VOLUME: u8 = 200;

/// Per-session playback table: one entry per (peer, stream role).
pub struct PlaybackRouter {
    local_id: Uuid,
    deafened: AtomicBool,
    entries: Mutex<HashMap<(Uuid, StreamRole), MediaStream>>,
    volumes: Mutex<HashMap<Uuid, u8>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl PlaybackRouter {
    pub fn new(local_id: Uuid) -> Self {
        Self {
            local_id,
            deafened: AtomicBool::new(false),
            entries: Mutex::new(HashMap::new()),
            volumes: Mutex::new(HashMap::new()),
        }
    }

    /// Route a peer's stream to playback. Our own streams are refused so we
    /// never hear ourselves.
    pub fn attach(&self, owner: Uuid, role: StreamRole, stream: &MediaStream) -> bool {
        if owner == self.local_id {
            tracing::warn!(role = ?role, "Refusing to play back a local stream");
            return false;
        }
        lock(&self.entries).insert((owner, role), stream.clone());
        true
    }

    /// Drop every entry for `peer`. Returns how many were removed.
    pub fn detach_peer(&self, peer: Uuid) -> usize {
        let mut entries = lock(&self.entries);
        let before = entries.len();
        entries.retain(|(owner, _), _| *owner != peer);
        before - entries.len()
    }

    pub fn stream(&self, peer: Uuid, role: StreamRole) -> Option<MediaStream> {
        lock(&self.entries).get(&(peer, role)).cloned()
    }

    pub fn peers(&self) -> Vec<Uuid> {
        let mut peers: Vec<Uuid> = lock(&self.entries).keys().map(|(p, _)| *p).collect();
        peers.sort();
        peers.dedup();
        peers
    }

    pub fn set_deafened(&self, deafened: bool) {
        self.deafened.store(deafened, Ordering::Release);
    }

    pub fn is_deafened(&self) -> bool {
        self.deafened.load(Ordering::Acquire)
    }

    /// Set a peer's volume in percent, clamped to `MAX_VOLUME`. Returns the applied value.
    pub fn set_user_volume(&self, peer: Uuid, percent: u16) -> u8 {
        let volume = percent.min(MAX_VOLUME as u16) as u8;
        lock(&self.volumes).insert(peer, volume);
        volume
    }

    pub fn user_volume(&self, peer: Uuid) -> u8 {
        lock(&self.volumes).get(&peer).copied().unwrap_or(DEFAULT_VOLUME)
    }

    /// Linear playback gain for an attached entry, `None` if nothing is attached.
    /// Deafen silences every audio-carrying role.
    pub fn effective_volume(&self, peer: Uuid, role: StreamRole) -> Option<f32> {
        if !lock(&self.entries).contains_key(&(peer, role)) {
            return None;
        }
        if !role.carries_audio() || self.is_deafened() {
            return Some(0.0);
        }
        Some(self.user_volume(peer) as f32 / 100.0)
    }

    pub fn clear(&self) -> usize {
        let mut entries = lock(&self.entries);
        let count = entries.len();
        entries.clear();
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn own_streams_are_never_played() {
        let me = Uuid::new_v4();
        let router = PlaybackRouter::new(me);
        assert!(!router.attach(me, StreamRole::Voice, &MediaStream::new()));
        assert!(router.stream(me, StreamRole::Voice).is_none());
    }

    #[test]
    fn deafen_zeroes_all_inbound_audio() {
        let router = PlaybackRouter::new(Uuid::new_v4());
        let peer = Uuid::new_v4();
        for role in [StreamRole::Voice, StreamRole::Soundpad, StreamRole::ScreenShare] {
            router.attach(peer, role, &MediaStream::new());
        }
        router.set_user_volume(peer, 150);
        assert_eq!(router.effective_volume(peer, StreamRole::Voice), Some(1.5));

        router.set_deafened(true);
        for role in [StreamRole::Voice, StreamRole::Soundpad, StreamRole::ScreenShare] {
            assert_eq!(router.effective_volume(peer, role), Some(0.0));
        }
        router.set_deafened(false);
        assert_eq!(router.effective_volume(peer, StreamRole::Soundpad), Some(1.5));
    }

    #[test]
    fn volume_is_capped_and_defaults_to_full() {
        let router = PlaybackRouter::new(Uuid::new_v4());
        let peer = Uuid::new_v4();
        assert_eq!(router.user_volume(peer), DEFAULT_VOLUME);
        assert_eq!(router.set_user_volume(peer, 500), MAX_VOLUME);
        assert_eq!(router.effective_volume(peer, StreamRole::Voice), None);
    }

    #[test]
    fn detach_removes_every_role() {
        let router = PlaybackRouter::new(Uuid::new_v4());
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        router.attach(a, StreamRole::Voice, &MediaStream::new());
        router.attach(a, StreamRole::Remote, &MediaStream::new());
        router.attach(b, StreamRole::Voice, &MediaStream::new());
        assert_eq!(router.detach_peer(a), 2);
        assert_eq!(router.peers(), vec![b]);
        assert_eq!(router.clear(), 1);
    }
}
