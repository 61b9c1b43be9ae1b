//! Media track and stream handles.
//!
//! Both are cheap shared references: cloning a [`MediaTrack`] or
//! [`MediaStream`] yields another handle to the same underlying object, so a
//! stream mutated by the classifier is seen by every listener holding it.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

impl std::fmt::Display for TrackKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Audio => f.write_str("audio"),
            Self::Video => f.write_str("video"),
        }
    }
}

/// Lifecycle of a track.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyState {
    /// Negotiated but no media has arrived yet (remote video before its first frame).
    New,
    Live,
    /// Stopped locally or removed by the remote side. Terminal.
    Ended,
}

struct TrackInner {
    id: String,
    kind: TrackKind,
    label: String,
    enabled: AtomicBool,
    state: watch::Sender<ReadyState>,
}

/// Shared handle to one audio or video track.
#[derive(Clone)]
pub struct MediaTrack {
    inner: Arc<TrackInner>,
}

impl MediaTrack {
    /// A live local track with a fresh id.
    pub fn new(kind: TrackKind, label: impl Into<String>) -> Self {
        Self::with_id(Uuid::new_v4().to_string(), kind, label, ReadyState::Live)
    }

    pub fn with_id(
        id: impl Into<String>,
        kind: TrackKind,
        label: impl Into<String>,
        state: ReadyState,
    ) -> Self {
        let (state, _) = watch::channel(state);
        Self {
            inner: Arc::new(TrackInner {
                id: id.into(),
                kind,
                label: label.into(),
                enabled: AtomicBool::new(true),
                state,
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn kind(&self) -> TrackKind {
        self.inner.kind
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::Acquire)
    }

    /// Enabled flag only; the capture device keeps running.
    pub fn set_enabled(&self, enabled: bool) {
        self.inner.enabled.store(enabled, Ordering::Release);
    }

    pub fn ready_state(&self) -> ReadyState {
        *self.inner.state.borrow()
    }

    /// First media arrived.
    pub fn mark_live(&self) {
        self.inner.state.send_if_modified(|state| {
            if *state == ReadyState::New {
                *state = ReadyState::Live;
                true
            } else {
                false
            }
        });
    }

    /// Stop the track. Returns `true` only for the call that actually stopped it.
    pub fn stop(&self) -> bool {
        self.inner.state.send_if_modified(|state| {
            if *state == ReadyState::Ended {
                false
            } else {
                *state = ReadyState::Ended;
                true
            }
        })
    }

    /// Wait until the track leaves `New`, bounded by `timeout`.
    /// Returns whether it is live.
    pub async fn wait_live(&self, timeout: Duration) -> bool {
        let mut rx = self.inner.state.subscribe();
        match tokio::time::timeout(timeout, rx.wait_for(|s| *s != ReadyState::New)).await {
            Ok(Ok(state)) => *state == ReadyState::Live,
            _ => false,
        }
    }

    /// Whether both handles point at the same track object.
    pub fn same_track(&self, other: &MediaTrack) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl std::fmt::Debug for MediaTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaTrack")
            .field("id", &self.inner.id)
            .field("kind", &self.inner.kind)
            .field("label", &self.inner.label)
            .field("enabled", &self.is_enabled())
            .field("state", &self.ready_state())
            .finish()
    }
}

/// Shared, mutable grouping of tracks.
#[derive(Clone)]
pub struct MediaStream {
    id: Arc<str>,
    tracks: Arc<Mutex<Vec<MediaTrack>>>,
}

impl MediaStream {
    pub fn new() -> Self {
        Self::with_id(Uuid::new_v4().to_string())
    }

    pub fn with_id(id: impl Into<String>) -> Self {
        Self {
            id: Arc::from(id.into()),
            tracks: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn from_tracks(tracks: impl IntoIterator<Item = MediaTrack>) -> Self {
        let stream = Self::new();
        for track in tracks {
            stream.add_track(track);
        }
        stream
    }

    fn lock(&self) -> MutexGuard<'_, Vec<MediaTrack>> {
        self.tracks.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Snapshot of the current tracks, in insertion order.
    pub fn tracks(&self) -> Vec<MediaTrack> {
        self.lock().clone()
    }

    pub fn audio_tracks(&self) -> Vec<MediaTrack> {
        self.tracks_of(TrackKind::Audio)
    }

    pub fn video_tracks(&self) -> Vec<MediaTrack> {
        self.tracks_of(TrackKind::Video)
    }

    fn tracks_of(&self, kind: TrackKind) -> Vec<MediaTrack> {
        self.lock().iter().filter(|t| t.kind() == kind).cloned().collect()
    }

    pub fn has_video(&self) -> bool {
        self.lock().iter().any(|t| t.kind() == TrackKind::Video)
    }

    /// Add a track unless one with the same id is already present.
    pub fn add_track(&self, track: MediaTrack) -> bool {
        let mut tracks = self.lock();
        if tracks.iter().any(|t| t.id() == track.id()) {
            return false;
        }
        tracks.push(track);
        true
    }

    pub fn remove_track(&self, track_id: &str) -> Option<MediaTrack> {
        let mut tracks = self.lock();
        let index = tracks.iter().position(|t| t.id() == track_id)?;
        Some(tracks.remove(index))
    }

    pub fn contains(&self, track_id: &str) -> bool {
        self.lock().iter().any(|t| t.id() == track_id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Stop every track. Returns how many were actually stopped by this call.
    pub fn stop_all(&self) -> usize {
        self.tracks().iter().filter(|t| t.stop()).count()
    }

    pub fn same_stream(&self, other: &MediaStream) -> bool {
        Arc::ptr_eq(&self.tracks, &other.tracks)
    }
}

impl Default for MediaStream {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MediaStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaStream")
            .field("id", &self.id)
            .field("tracks", &self.lock().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stop_reports_only_the_first_call() {
        let track = MediaTrack::new(TrackKind::Audio, "mic");
        assert!(track.stop());
        assert!(!track.stop());
        assert_eq!(track.ready_state(), ReadyState::Ended);
    }

    #[test]
    fn clones_share_state() {
        let track = MediaTrack::new(TrackKind::Audio, "mic");
        let other = track.clone();
        other.set_enabled(false);
        assert!(!track.is_enabled());
        assert!(track.same_track(&other));

        let stream = MediaStream::new();
        let view = stream.clone();
        stream.add_track(track);
        assert_eq!(view.len(), 1);
        assert!(view.same_stream(&stream));
    }

    #[test]
    fn stream_rejects_duplicate_ids() {
        let track = MediaTrack::new(TrackKind::Video, "screen");
        let stream = MediaStream::from_tracks([track.clone()]);
        assert!(!stream.add_track(track.clone()));
        assert!(stream.has_video());
        assert!(stream.remove_track(track.id()).is_some());
        assert!(stream.is_empty());
        assert!(stream.remove_track(track.id()).is_none());
    }

    #[tokio::test]
    async fn wait_live_resolves_when_marked() {
        let track = MediaTrack::with_id("v", TrackKind::Video, "remote", ReadyState::New);
        let waiter = track.clone();
        let handle = tokio::spawn(async move { waiter.wait_live(Duration::from_secs(1)).await });
        track.mark_live();
        assert!(handle.await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn wait_live_gives_up_after_timeout() {
        let track = MediaTrack::with_id("v", TrackKind::Video, "remote", ReadyState::New);
        assert!(!track.wait_live(Duration::from_millis(500)).await);
        assert_eq!(track.ready_state(), ReadyState::New);
    }
}
