//! Sorting inbound tracks into purpose streams.
//!
//! The wire carries no purpose tag, so purpose is inferred:
//! 1. audio grouped with a video track is screen-share audio;
//! 2. the first other audio track is the peer's voice, later ones are soundpad;
//! 3. video is screen-share video and also goes to the generic remote stream.
//!
//! Rule 2 relies on every client attaching its voice track before anything else.

use crate::media::{MediaStream, MediaTrack, TrackKind};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackRole {
    Voice,
    ScreenShareVideo,
    ScreenShareAudio,
    Soundpad,
}

/// One of the four per-peer streams handed to listeners.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamRole {
    Voice,
    ScreenShare,
    Soundpad,
    /// Every inbound video track, regardless of purpose.
    Remote,
}

impl StreamRole {
    /// Whether the stream can carry audio the user hears.
    pub fn carries_audio(self) -> bool {
        !matches!(self, Self::Remote)
    }
}

impl TrackRole {
    /// Buckets a track of this role lands in.
    pub fn buckets(self) -> &'static [StreamRole] {
        match self {
            Self::Voice => &[StreamRole::Voice],
            Self::ScreenShareAudio => &[StreamRole::ScreenShare],
            Self::Soundpad => &[StreamRole::Soundpad],
            Self::ScreenShareVideo => &[StreamRole::Remote, StreamRole::ScreenShare],
        }
    }
}

/// Classification state for one remote peer.
pub struct TrackClassifier {
    voice: MediaStream,
    screen_share: MediaStream,
    soundpad: MediaStream,
    remote: MediaStream,
    voice_claimed: bool,
}

impl TrackClassifier {
    pub fn new(peer: Uuid) -> Self {
        Self {
            voice: MediaStream::with_id(format!("{peer}-voice")),
            screen_share: MediaStream::with_id(format!("{peer}-screen-share")),
            soundpad: MediaStream::with_id(format!("{peer}-soundpad")),
            remote: MediaStream::with_id(format!("{peer}-remote")),
            voice_claimed: false,
        }
    }

    /// Decide the role of a newly arrived track. `grouping` is the set of
    /// remote streams the track arrived in, already fully populated.
    pub fn classify(&mut self, track: &MediaTrack, grouping: &[MediaStream]) -> TrackRole {
        match track.kind() {
            TrackKind::Video => TrackRole::ScreenShareVideo,
            TrackKind::Audio if grouping.iter().any(MediaStream::has_video) => {
                TrackRole::ScreenShareAudio
            }
            TrackKind::Audio if !self.voice_claimed => {
                self.voice_claimed = true;
                TrackRole::Voice
            }
            TrackKind::Audio => TrackRole::Soundpad,
        }
    }

    /// Place a classified track. Returns the buckets that changed.
    pub fn admit(&mut self, role: TrackRole, track: &MediaTrack) -> Vec<StreamRole> {
        role.buckets()
            .iter()
            .copied()
            .filter(|bucket| self.stream(*bucket).add_track(track.clone()))
            .collect()
    }

    /// Drop a track from whichever buckets hold it. Returns the buckets that changed;
    /// the buckets themselves stay around (possibly empty).
    pub fn remove(&mut self, track_id: &str) -> Vec<StreamRole> {
        [
            StreamRole::Voice,
            StreamRole::ScreenShare,
            StreamRole::Soundpad,
            StreamRole::Remote,
        ]
        .into_iter()
        .filter(|bucket| self.stream(*bucket).remove_track(track_id).is_some())
        .collect()
    }

    pub fn stream(&self, role: StreamRole) -> &MediaStream {
        match role {
            StreamRole::Voice => &self.voice,
            StreamRole::ScreenShare => &self.screen_share,
            StreamRole::Soundpad => &self.soundpad,
            StreamRole::Remote => &self.remote,
        }
    }
}
