//! Local audio mixing: microphone plus soundboard clips.
//!
//! A played clip starts two independent voices, one feeding the outbound
//! mix and one feeding local monitoring, so the clip is heard locally while
//! peers hear it too. All buffers are mono `f32` in `[-1.0, 1.0]`.
//!
//! [`AudioMixer::spawn_pump`] drives the mixer in real time against an
//! [`AudioIo`]: one block of `audio.frame_size` samples per frame period.

use crate::media::{MediaTrack, TrackKind};
use crate::registry::AudioProcessor;
use huddle_common::config::{AudioConfig, SoundpadRouting};
use nnnoiseless::{DenoiseState, FRAME_SIZE};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::AbortHandle;
use tokio::time::MissedTickBehavior;

/// The capture and playout side of the mixer.
pub trait AudioIo: Send + Sync {
    /// Fill `block` with the next microphone samples. `false` means no
    /// input is available and the block is treated as silence.
    fn read_microphone(&self, block: &mut [f32]) -> bool;
    /// One block of the outbound voice track.
    fn write_outbound(&self, block: &[f32]);
    /// One block of the dedicated soundboard track. Only called with separate routing.
    fn write_soundpad(&self, _block: &[f32]) {}
    /// One block of local monitoring.
    fn write_monitor(&self, block: &[f32]);
}

/// Upper bound for any gain stage (+12 dB).
pub const MAX_GAIN: f32 = 4.0;

/// Lock-free gain value shared with the mixing path.
pub struct GainStage(AtomicU32);

impl GainStage {
    pub fn new(gain: f32) -> Self {
        let stage = Self(AtomicU32::new(0));
        stage.set(gain);
        stage
    }

    pub fn get(&self) -> f32 {
        f32::from_bits(self.0.load(Ordering::Relaxed))
    }

    /// Clamped to `0.0..=MAX_GAIN`; NaN counts as silence.
    pub fn set(&self, gain: f32) {
        let gain = if gain.is_nan() { 0.0 } else { gain.clamp(0.0, MAX_GAIN) };
        self.0.store(gain.to_bits(), Ordering::Relaxed);
    }
}

/// A decoded sound, shared by every voice playing it.
#[derive(Clone)]
pub struct SoundClip {
    name: Arc<str>,
    samples: Arc<[f32]>,
}

impl SoundClip {
    pub fn new(name: impl Into<String>, samples: Vec<f32>) -> Self {
        Self {
            name: Arc::from(name.into()),
            samples: Arc::from(samples),
        }
    }

    /// Decode mono signed 16-bit little-endian PCM.
    pub fn from_s16le(name: impl Into<String>, bytes: &[u8]) -> Self {
        Self::new(name, crate::capture::decode_s16le(bytes))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

impl std::fmt::Debug for SoundClip {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SoundClip")
            .field("name", &self.name)
            .field("samples", &self.samples.len())
            .finish()
    }
}

struct Voice {
    samples: Arc<[f32]>,
    cursor: usize,
}

impl Voice {
    /// Add the next chunk into `out`. Returns `true` once the clip is exhausted.
    fn mix_into(&mut self, out: &mut [f32], gain: f32) -> bool {
        let remaining = &self.samples[self.cursor..];
        let n = remaining.len().min(out.len());
        for (o, s) in out.iter_mut().zip(&remaining[..n]) {
            *o += s * gain;
        }
        self.cursor += n;
        self.cursor >= self.samples.len()
    }
}

fn mix_voices(voices: &mut Vec<Voice>, out: &mut [f32], gain: f32) {
    voices.retain_mut(|voice| !voice.mix_into(out, gain));
}

fn clamp_all(out: &mut [f32]) {
    for sample in out.iter_mut() {
        *sample = sample.clamp(-1.0, 1.0);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

pub struct AudioMixer {
    routing: SoundpadRouting,
    mic_gain: GainStage,
    sound_gain: GainStage,
    outbound: Mutex<Vec<Voice>>,
    monitor: Mutex<Vec<Voice>>,
    noise_suppression: AtomicBool,
    denoiser: Mutex<Option<Box<DenoiseState<'static>>>>,
    output: MediaTrack,
    sound_output: Option<MediaTrack>,
}

impl AudioMixer {
    pub fn new(config: &AudioConfig) -> Self {
        let sound_output = match config.soundpad_routing {
            SoundpadRouting::Mixed => None,
            SoundpadRouting::SeparateTrack => Some(MediaTrack::new(TrackKind::Audio, "soundpad")),
        };
        Self {
            routing: config.soundpad_routing,
            mic_gain: GainStage::new(config.mic_gain),
            sound_gain: GainStage::new(config.sound_gain),
            outbound: Mutex::new(Vec::new()),
            monitor: Mutex::new(Vec::new()),
            noise_suppression: AtomicBool::new(config.noise_suppression),
            denoiser: Mutex::new(None),
            output: MediaTrack::new(TrackKind::Audio, "voice"),
            sound_output,
        }
    }

    pub fn routing(&self) -> SoundpadRouting {
        self.routing
    }

    /// The track peers receive as this participant's voice.
    pub fn output_track(&self) -> &MediaTrack {
        &self.output
    }

    /// Dedicated soundboard track, only with separate-track routing.
    pub fn sound_track(&self) -> Option<&MediaTrack> {
        self.sound_output.as_ref()
    }

    pub fn mic_gain(&self) -> &GainStage {
        &self.mic_gain
    }

    pub fn sound_gain(&self) -> &GainStage {
        &self.sound_gain
    }

    pub fn noise_suppression(&self) -> bool {
        self.noise_suppression.load(Ordering::Acquire)
    }

    /// Start a clip on both the outbound and the local monitor path.
    pub fn play(&self, clip: &SoundClip) {
        if clip.is_empty() {
            return;
        }
        lock(&self.outbound).push(Voice {
            samples: clip.samples.clone(),
            cursor: 0,
        });
        lock(&self.monitor).push(Voice {
            samples: clip.samples.clone(),
            cursor: 0,
        });
        tracing::debug!(clip = clip.name(), samples = clip.len(), "Sound started");
    }

    /// Clips still feeding the outbound path.
    pub fn playing(&self) -> usize {
        lock(&self.outbound).len()
    }

    pub fn stop_sounds(&self) {
        lock(&self.outbound).clear();
        lock(&self.monitor).clear();
    }

    /// Produce one outbound block from a microphone block.
    ///
    /// With mixed routing the soundboard is summed in. A disabled output
    /// track (mute) yields silence but clips keep advancing.
    pub fn mix_outbound(&self, mic: &[f32], out: &mut [f32]) {
        out.fill(0.0);
        let gain = self.mic_gain.get();
        for (o, m) in out.iter_mut().zip(mic) {
            *o = m * gain;
        }
        if self.noise_suppression() {
            self.denoise(out);
        }

        if self.routing == SoundpadRouting::Mixed {
            mix_voices(&mut lock(&self.outbound), out, self.sound_gain.get());
        }

        if !self.output.is_enabled() {
            out.fill(0.0);
        }
        clamp_all(out);
    }

    /// Soundboard-only block for the dedicated track. Silent with mixed routing.
    pub fn render_sound_only(&self, out: &mut [f32]) {
        out.fill(0.0);
        if self.routing == SoundpadRouting::SeparateTrack {
            mix_voices(&mut lock(&self.outbound), out, self.sound_gain.get());
        }
        clamp_all(out);
    }

    /// Local monitor block. Never contains the microphone.
    pub fn render_local(&self, out: &mut [f32]) {
        out.fill(0.0);
        mix_voices(&mut lock(&self.monitor), out, self.sound_gain.get());
        clamp_all(out);
    }

    /// Mix one block per frame period until aborted or the mixer is dropped.
    pub fn spawn_pump(self: &Arc<Self>, io: Arc<dyn AudioIo>, config: &AudioConfig) -> AbortHandle {
        let frame = config.frame_size.max(1);
        let period = Duration::from_secs_f64(frame as f64 / f64::from(config.sample_rate.max(1)));
        let weak = Arc::downgrade(self);

        let pump = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let mut mic = vec![0.0f32; frame];
            let mut block = vec![0.0f32; frame];

            loop {
                ticker.tick().await;
                let Some(mixer) = weak.upgrade() else { break };

                if !io.read_microphone(&mut mic) {
                    mic.fill(0.0);
                }
                mixer.mix_outbound(&mic, &mut block);
                io.write_outbound(&block);

                if mixer.routing == SoundpadRouting::SeparateTrack {
                    mixer.render_sound_only(&mut block);
                    io.write_soundpad(&block);
                }

                mixer.render_local(&mut block);
                io.write_monitor(&block);
            }
        });

        tracing::debug!(frame, period_us = period.as_micros() as u64, "Mixer pump started");
        pump.abort_handle()
    }

    /// RNNoise on whole frames; a trailing partial frame passes through.
    fn denoise(&self, buf: &mut [f32]) {
        let mut guard = lock(&self.denoiser);
        let state = guard.get_or_insert_with(DenoiseState::new);
        let scale = i16::MAX as f32;
        let mut input = [0.0f32; FRAME_SIZE];
        let mut output = [0.0f32; FRAME_SIZE];

        for frame in buf.chunks_exact_mut(FRAME_SIZE) {
            for (i, s) in frame.iter().enumerate() {
                input[i] = (s * scale).clamp(-scale - 1.0, scale);
            }
            state.process_frame(&mut output, &input);
            for (s, d) in frame.iter_mut().zip(output.iter()) {
                *s = d / scale;
            }
        }
    }
}

impl AudioProcessor for AudioMixer {
    fn name(&self) -> &str {
        "mixer"
    }

    fn set_noise_suppression(&self, enabled: bool) {
        self.noise_suppression.store(enabled, Ordering::Release);
        if !enabled {
            lock(&self.denoiser).take();
        }
    }
}
