//! Registry of live audio processors.
//!
//! Sessions register their mixer when they acquire media and unregister it
//! on teardown, so a global noise-suppression toggle reaches exactly the
//! processors that are running.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

pub trait AudioProcessor: Send + Sync {
    fn name(&self) -> &str;
    fn set_noise_suppression(&self, enabled: bool);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProcessorId(u64);

#[derive(Default)]
pub struct ProcessorRegistry {
    next: AtomicU64,
    processors: RwLock<HashMap<ProcessorId, Arc<dyn AudioProcessor>>>,
    /// Last explicit toggle; `None` leaves processors at their configured setting.
    noise_suppression: Mutex<Option<bool>>,
}

impl ProcessorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a processor. It picks up the current toggle if one was set.
    pub fn register(&self, processor: Arc<dyn AudioProcessor>) -> ProcessorId {
        let id = ProcessorId(self.next.fetch_add(1, Ordering::Relaxed));
        if let Some(enabled) = *self.noise_suppression.lock().unwrap_or_else(|e| e.into_inner()) {
            processor.set_noise_suppression(enabled);
        }
        tracing::debug!(processor = processor.name(), id = id.0, "Audio processor registered");
        self.processors
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, processor);
        id
    }

    pub fn unregister(&self, id: ProcessorId) -> bool {
        let removed = self
            .processors
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id)
            .is_some();
        if removed {
            tracing::debug!(id = id.0, "Audio processor unregistered");
        }
        removed
    }

    /// Apply the toggle to every registered processor. Returns how many were updated.
    pub fn set_noise_suppression(&self, enabled: bool) -> usize {
        *self.noise_suppression.lock().unwrap_or_else(|e| e.into_inner()) = Some(enabled);
        let processors = self.processors.read().unwrap_or_else(|e| e.into_inner());
        for processor in processors.values() {
            processor.set_noise_suppression(enabled);
        }
        tracing::info!(enabled, processors = processors.len(), "Noise suppression toggled");
        processors.len()
    }

    pub fn noise_suppression(&self) -> Option<bool> {
        *self.noise_suppression.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn len(&self) -> usize {
        self.processors.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
