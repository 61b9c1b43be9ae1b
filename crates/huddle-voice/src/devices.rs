//! Capture device access.

use crate::capture::ScreenAudioSource;
use crate::media::{MediaStream, MediaTrack, TrackKind};
use crate::mixer::AudioIo;
use async_trait::async_trait;
use huddle_common::config::AudioConfig;
use huddle_common::{HuddleError, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug, Clone, PartialEq)]
pub struct AudioConstraints {
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub auto_gain_control: bool,
    pub sample_rate: u32,
}

impl From<&AudioConfig> for AudioConstraints {
    fn from(config: &AudioConfig) -> Self {
        Self {
            echo_cancellation: config.echo_cancellation,
            noise_suppression: config.noise_suppression,
            auto_gain_control: config.auto_gain_control,
            sample_rate: config.sample_rate,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DisplayConstraints {
    pub width: u32,
    pub height: u32,
    pub frame_rate: u32,
    /// Capture system audio alongside the picture.
    pub audio: Option<ScreenAudioSource>,
}

impl DisplayConstraints {
    pub fn with_audio(mut self, source: ScreenAudioSource) -> Self {
        self.audio = Some(source);
        self
    }
}

impl Default for DisplayConstraints {
    fn default() -> Self {
        Self {
            width: 1920,
            height: 1080,
            frame_rate: 30,
            audio: None,
        }
    }
}

/// Source of local capture streams.
///
/// Display capture returns one stream; when system audio is requested its
/// audio track is grouped in that same stream, which is how peers tell
/// screen-share audio apart from a microphone.
#[async_trait]
pub trait MediaDevices: Send + Sync {
    async fn microphone(&self, constraints: &AudioConstraints) -> Result<MediaStream>;
    async fn display(&self, constraints: &DisplayConstraints) -> Result<MediaStream>;

    /// Sample-level access for the mixer pump. Without it the mixer is
    /// only driven by whoever holds it.
    fn audio_io(&self) -> Option<Arc<dyn AudioIo>> {
        None
    }
}

/// Running level of one output path.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Meter {
    pub blocks: u64,
    /// Loudest sample ever written.
    pub peak: f32,
    /// Loudest sample of the most recent block.
    pub last_peak: f32,
}

impl Meter {
    fn record(&mut self, block: &[f32]) {
        let peak = block.iter().fold(0.0f32, |acc, s| acc.max(s.abs()));
        self.blocks += 1;
        self.peak = self.peak.max(peak);
        self.last_peak = peak;
    }
}

/// Sample side of [`SyntheticDevices`]: a constant-level microphone and
/// meters on every output.
#[derive(Default)]
pub struct SyntheticAudio {
    microphone_level: Mutex<f32>,
    outbound: Mutex<Meter>,
    soundpad: Mutex<Meter>,
    monitor: Mutex<Meter>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl SyntheticAudio {
    pub fn set_microphone_level(&self, level: f32) {
        *lock(&self.microphone_level) = level;
    }

    pub fn outbound(&self) -> Meter {
        *lock(&self.outbound)
    }

    pub fn soundpad(&self) -> Meter {
        *lock(&self.soundpad)
    }

    pub fn monitor(&self) -> Meter {
        *lock(&self.monitor)
    }
}

impl AudioIo for SyntheticAudio {
    fn read_microphone(&self, block: &mut [f32]) -> bool {
        block.fill(*lock(&self.microphone_level));
        true
    }

    fn write_outbound(&self, block: &[f32]) {
        lock(&self.outbound).record(block);
    }

    fn write_soundpad(&self, block: &[f32]) {
        lock(&self.soundpad).record(block);
    }

    fn write_monitor(&self, block: &[f32]) {
        lock(&self.monitor).record(block);
    }
}

/// Device layer that fabricates live tracks, with switches to simulate refusal.
#[derive(Default)]
pub struct SyntheticDevices {
    deny_microphone: AtomicBool,
    deny_display: AtomicBool,
    no_microphone: AtomicBool,
    audio: Arc<SyntheticAudio>,
}

impl SyntheticDevices {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn audio(&self) -> &Arc<SyntheticAudio> {
        &self.audio
    }

    pub fn deny_microphone(&self, deny: bool) {
        self.deny_microphone.store(deny, Ordering::Release);
    }

    pub fn deny_display(&self, deny: bool) {
        self.deny_display.store(deny, Ordering::Release);
    }

    /// Pretend no input device is plugged in.
    pub fn unplug_microphone(&self, unplugged: bool) {
        self.no_microphone.store(unplugged, Ordering::Release);
    }
}

#[async_trait]
impl MediaDevices for SyntheticDevices {
    async fn microphone(&self, constraints: &AudioConstraints) -> Result<MediaStream> {
        if self.no_microphone.load(Ordering::Acquire) {
            return Err(HuddleError::DeviceUnavailable {
                device: "microphone".into(),
            });
        }
        if self.deny_microphone.load(Ordering::Acquire) {
            return Err(HuddleError::PermissionDenied {
                device: "microphone".into(),
            });
        }

        tracing::debug!(
            echo_cancellation = constraints.echo_cancellation,
            noise_suppression = constraints.noise_suppression,
            auto_gain_control = constraints.auto_gain_control,
            "Microphone opened"
        );
        Ok(MediaStream::from_tracks([MediaTrack::new(
            TrackKind::Audio,
            "microphone",
        )]))
    }

    async fn display(&self, constraints: &DisplayConstraints) -> Result<MediaStream> {
        if self.deny_display.load(Ordering::Acquire) {
            return Err(HuddleError::PermissionDenied {
                device: "display".into(),
            });
        }

        let stream = MediaStream::new();
        stream.add_track(MediaTrack::new(
            TrackKind::Video,
            format!("screen {}x{}@{}", constraints.width, constraints.height, constraints.frame_rate),
        ));
        if let Some(source) = constraints.audio {
            stream.add_track(MediaTrack::new(
                TrackKind::Audio,
                format!("system audio pid {}", source.pid),
            ));
        }

        tracing::debug!(
            width = constraints.width,
            height = constraints.height,
            with_audio = constraints.audio.is_some(),
            "Display capture started"
        );
        Ok(stream)
    }

    fn audio_io(&self) -> Option<Arc<dyn AudioIo>> {
        let audio: Arc<dyn AudioIo> = self.audio.clone();
        Some(audio)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn display_groups_system_audio_with_video() {
        let devices = SyntheticDevices::new();
        let stream = devices
            .display(&DisplayConstraints::default().with_audio(ScreenAudioSource::application(7)))
            .await
            .unwrap();
        assert_eq!(stream.video_tracks().len(), 1);
        assert_eq!(stream.audio_tracks().len(), 1);
    }

    #[tokio::test]
    async fn refusals_map_to_device_errors() {
        let devices = SyntheticDevices::new();
        let constraints = AudioConstraints::from(&AudioConfig::default());

        devices.deny_microphone(true);
        let err = devices.microphone(&constraints).await.unwrap_err();
        assert_eq!(err.error_code(), "PERMISSION_DENIED");

        devices.unplug_microphone(true);
        let err = devices.microphone(&constraints).await.unwrap_err();
        assert_eq!(err.error_code(), "DEVICE_UNAVAILABLE");
    }

    #[test]
    fn meters_track_peak_and_last_block() {
        let audio = SyntheticAudio::default();
        audio.write_outbound(&[0.1, -0.6, 0.2]);
        audio.write_outbound(&[0.0, 0.05]);
        let meter = audio.outbound();
        assert_eq!(meter.blocks, 2);
        assert_eq!(meter.peak, 0.6);
        assert_eq!(meter.last_peak, 0.05);
        assert_eq!(audio.monitor(), Meter::default());
    }
}
