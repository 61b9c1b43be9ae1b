//! Identifiers for signals, sessions, and participants.
//!
//! Stores order signals by creation time, so signal ids are UUID v7
//! (millisecond timestamp prefix) and sort the same way `created_at` does.

use uuid::Uuid;

/// Id for a freshly created signal.
pub fn signal_id() -> Uuid {
    Uuid::now_v7()
}

/// Id for an ad-hoc direct call.
pub fn call_id() -> Uuid {
    Uuid::now_v7()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signal_ids_are_unique() {
        assert_ne!(signal_id(), signal_id());
    }

    #[test]
    fn signal_ids_sort_by_creation() {
        let first = signal_id();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let second = signal_id();
        assert!(first < second);
    }
}
