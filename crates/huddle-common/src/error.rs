//! Centralized error type for Huddle.
//!
//! Every crate returns [`HuddleError`]. Each variant maps onto one class of the
//! failure taxonomy so the session layer can decide what reaches the user.

use uuid::Uuid;

/// Failure classes. Only the session controllers turn these into user-visible state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Signal send/subscribe failed. Call setup aborts.
    Transport,
    /// A description could not be applied in the current signaling state.
    Negotiation,
    /// Capture denied or no device.
    Device,
    /// A completion arrived for a link that no longer exists. Never surfaced.
    PostTeardown,
    Configuration,
    Internal,
}

/// Core error type used across all Huddle crates.
#[derive(Debug, thiserror::Error)]
pub enum HuddleError {
    // === Transport ===
    #[error("Signal store error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Subscribing to signals from {peer} timed out after {timeout_ms}ms")]
    SubscribeTimeout { peer: Uuid, timeout_ms: u64 },

    #[error("Signal feed closed")]
    TransportClosed,

    #[error("Malformed signal: {reason}")]
    MalformedSignal { reason: String },

    // === Negotiation ===
    #[error("Cannot {op} in signaling state {state}")]
    InvalidSignalingState { op: &'static str, state: String },

    #[error("Connection never stabilized (stuck in {state})")]
    Unstable { state: String },

    #[error("Peer connection error: {message}")]
    Connection { message: String },

    // === Devices ===
    #[error("Permission denied for {device}")]
    PermissionDenied { device: String },

    #[error("{device} unavailable")]
    DeviceUnavailable { device: String },

    // === Sessions ===
    #[error("Membership error: {message}")]
    Membership { message: String },

    #[error("Cannot {action} while call is {state}")]
    InvalidCallState { action: &'static str, state: String },

    #[error("Link to {peer} is closed")]
    LinkClosed { peer: Uuid },

    // === Infrastructure ===
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl HuddleError {
    /// Which taxonomy class this error belongs to.
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Redis(_)
            | Self::Serialization(_)
            | Self::SubscribeTimeout { .. }
            | Self::TransportClosed
            | Self::MalformedSignal { .. } => ErrorClass::Transport,
            Self::InvalidSignalingState { .. } | Self::Unstable { .. } | Self::Connection { .. } => {
                ErrorClass::Negotiation
            }
            Self::PermissionDenied { .. } | Self::DeviceUnavailable { .. } => ErrorClass::Device,
            Self::LinkClosed { .. } => ErrorClass::PostTeardown,
            Self::Config(_) => ErrorClass::Configuration,
            Self::Membership { .. } | Self::InvalidCallState { .. } | Self::Internal(_) => {
                ErrorClass::Internal
            }
        }
    }

    /// Error code string for programmatic handling by the UI.
    pub fn error_code(&self) -> &str {
        match self {
            Self::Redis(_) => "SIGNAL_STORE_ERROR",
            Self::Serialization(_) => "SERIALIZATION_ERROR",
            Self::SubscribeTimeout { .. } => "SUBSCRIBE_TIMEOUT",
            Self::TransportClosed => "TRANSPORT_CLOSED",
            Self::MalformedSignal { .. } => "MALFORMED_SIGNAL",
            Self::InvalidSignalingState { .. } => "INVALID_SIGNALING_STATE",
            Self::Unstable { .. } => "UNSTABLE_NEGOTIATION",
            Self::Connection { .. } => "CONNECTION_ERROR",
            Self::PermissionDenied { .. } => "PERMISSION_DENIED",
            Self::DeviceUnavailable { .. } => "DEVICE_UNAVAILABLE",
            Self::Membership { .. } => "MEMBERSHIP_ERROR",
            Self::InvalidCallState { .. } => "INVALID_CALL_STATE",
            Self::LinkClosed { .. } => "LINK_CLOSED",
            Self::Config(_) => "CONFIG_ERROR",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Whether the session layer should show this to the user.
    pub fn is_user_visible(&self) -> bool {
        self.class() != ErrorClass::PostTeardown
    }

    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    pub fn malformed(reason: impl Into<String>) -> Self {
        Self::MalformedSignal {
            reason: reason.into(),
        }
    }
}

/// Convenience type alias for Results using HuddleError.
pub type Result<T> = std::result::Result<T, HuddleError>;
