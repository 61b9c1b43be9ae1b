//! Application window listing and system-audio loopback formats.
//!
//! A native capture helper lists capturable windows one per line as
//! `pid;window-handle;title`, and streams one application's audio (or
//! everything except it) as interleaved signed 16-bit little-endian PCM.

use serde::{Deserialize, Serialize};

/// A window that can be offered as a screen-share source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureWindow {
    pub pid: u32,
    /// Platform window handle, kept opaque.
    pub handle: String,
    pub title: String,
}

impl CaptureWindow {
    /// Parse a helper listing. Blank and malformed lines are skipped; titles may contain `;`.
    pub fn parse_listing(listing: &str) -> Vec<CaptureWindow> {
        listing
            .lines()
            .filter_map(|line| {
                let line = line.trim_end_matches('\r');
                if line.trim().is_empty() {
                    return None;
                }
                let mut parts = line.splitn(3, ';');
                let pid = parts.next()?.trim().parse::<u32>().ok()?;
                let handle = parts.next()?.trim();
                let title = parts.next()?.trim();
                if handle.is_empty() {
                    tracing::debug!(line, "Skipping window entry without a handle");
                    return None;
                }
                Some(CaptureWindow {
                    pid,
                    handle: handle.to_string(),
                    title: title.to_string(),
                })
            })
            .collect()
    }
}

/// Which processes a loopback capture covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LoopbackMode {
    /// Only the target process and its children.
    IncludeProcessTree,
    /// Everything except the target process tree (e.g. all audio but our own).
    ExcludeProcessTree,
}

/// System audio to attach to a screen share.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScreenAudioSource {
    pub pid: u32,
    pub mode: LoopbackMode,
}

impl ScreenAudioSource {
    pub fn application(pid: u32) -> Self {
        Self {
            pid,
            mode: LoopbackMode::IncludeProcessTree,
        }
    }

    pub fn everything_except(pid: u32) -> Self {
        Self {
            pid,
            mode: LoopbackMode::ExcludeProcessTree,
        }
    }
}

/// Loopback PCM layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PcmFormat {
    pub sample_rate: u32,
    pub channels: u16,
    pub bits_per_sample: u16,
}

impl PcmFormat {
    pub fn bytes_per_frame(&self) -> usize {
        self.channels as usize * (self.bits_per_sample as usize / 8)
    }

    pub fn bytes_per_second(&self) -> usize {
        self.sample_rate as usize * self.bytes_per_frame()
    }
}

impl Default for PcmFormat {
    fn default() -> Self {
        Self {
            sample_rate: 44_100,
            channels: 2,
            bits_per_sample: 16,
        }
    }
}

/// Decode signed 16-bit little-endian PCM into `[-1.0, 1.0)` samples.
/// A trailing odd byte is ignored.
pub fn decode_s16le(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]) as f32 / 32768.0)
        .collect()
}
