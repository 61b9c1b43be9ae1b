//! # huddle-signal
//!
//! Signaling transport for peer links. Signals (SDP offers/answers, ICE
//! candidates, call-control notices) are persisted once and pushed live to
//! the single participant they are addressed to.
//!
//! The relay is at-least-once, so consumers subscribe through
//! [`SignalingChannel::subscribe`], which:
//! - opens the live feed first,
//! - replays persisted signals in creation order,
//! - then forwards live signals, dropping any id it has already delivered.
//!
//! Two stores are provided: [`MemorySignalStore`] for single-process use and
//! tests, and [`RedisSignalStore`] (lists for replay, pub/sub for live push).

pub mod channel;
pub mod redis_store;
pub mod signal;
pub mod store;

pub use channel::{PurgeScope, SignalSink, SignalingChannel, Subscription};
pub use redis_store::RedisSignalStore;
pub use signal::{Signal, SignalKind};
pub use store::{MemorySignalStore, SignalStore};
