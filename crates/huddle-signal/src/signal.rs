//! The signal row / wire message.

use chrono::{DateTime, Utc};
use huddle_common::{HuddleError, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// What a signal carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignalKind {
    Offer,
    Answer,
    IceCandidate,
    CallEnded,
    CallRejected,
    CallCancelled,
    ScreenShareStarted,
    ScreenShareStopped,
}

impl SignalKind {
    /// Offer, answer and ICE candidates go to the negotiation orchestrator.
    pub fn is_negotiation(self) -> bool {
        matches!(self, Self::Offer | Self::Answer | Self::IceCandidate)
    }

    /// Everything else is handled by the session controller.
    pub fn is_control(self) -> bool {
        !self.is_negotiation()
    }
}

impl std::fmt::Display for SignalKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Offer => "offer",
            Self::Answer => "answer",
            Self::IceCandidate => "ice-candidate",
            Self::CallEnded => "call-ended",
            Self::CallRejected => "call-rejected",
            Self::CallCancelled => "call-cancelled",
            Self::ScreenShareStarted => "screen-share-started",
            Self::ScreenShareStopped => "screen-share-stopped",
        };
        f.write_str(name)
    }
}

/// One signaling message between exactly two participants of one session.
///
/// Only meaningful to the `(session_id, to)` pair; stores must never deliver it elsewhere.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub id: Uuid,
    /// Voice channel id, or the call id for direct calls.
    #[serde(alias = "call_id")]
    pub session_id: Uuid,
    #[serde(rename = "from_user_id")]
    pub from: Uuid,
    #[serde(rename = "to_user_id")]
    pub to: Uuid,
    #[serde(rename = "signal_type")]
    pub kind: SignalKind,
    /// SDP description, ICE candidate descriptor, or `{}` for control kinds.
    #[serde(default = "empty_payload")]
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

fn empty_payload() -> serde_json::Value {
    serde_json::Value::Object(Default::default())
}

impl Signal {
    pub fn new(
        session_id: Uuid,
        from: Uuid,
        to: Uuid,
        kind: SignalKind,
        payload: serde_json::Value,
    ) -> Self {
        let payload = if payload.is_null() {
            empty_payload()
        } else {
            payload
        };
        Self {
            id: huddle_common::ids::signal_id(),
            session_id,
            from,
            to,
            kind,
            payload,
            created_at: Utc::now(),
        }
    }

    /// Whether this signal belongs in `to`'s inbox for `session_id`.
    pub fn is_for(&self, session_id: Uuid, to: Uuid) -> bool {
        self.session_id == session_id && self.to == to
    }

    /// Decode the kind-dependent payload.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.payload.clone()).map_err(|e| {
            HuddleError::malformed(format!("{} payload from {}: {e}", self.kind, self.from))
        })
    }

    /// Creation-order sort key. Ids break ties within one millisecond.
    pub fn order_key(&self) -> (DateTime<Utc>, Uuid) {
        (self.created_at, self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn wire_names_follow_the_signal_table() {
        let session = Uuid::new_v4();
        let signal = Signal::new(
            session,
            Uuid::new_v4(),
            Uuid::new_v4(),
            SignalKind::IceCandidate,
            json!({ "candidate": "candidate:1 1 udp 1 127.0.0.1 9 typ host" }),
        );
        let value = serde_json::to_value(&signal).unwrap();
        assert_eq!(value["signal_type"], "ice-candidate");
        assert!(value.get("from_user_id").is_some());
        assert!(value.get("to_user_id").is_some());
        assert_eq!(value["session_id"], json!(session));
    }

    #[test]
    fn call_id_is_accepted_as_session_id() {
        let call = Uuid::new_v4();
        let raw = json!({
            "id": Uuid::new_v4(),
            "call_id": call,
            "from_user_id": Uuid::new_v4(),
            "to_user_id": Uuid::new_v4(),
            "signal_type": "call-rejected",
            "created_at": Utc::now(),
        });
        let signal: Signal = serde_json::from_value(raw).unwrap();
        assert_eq!(signal.session_id, call);
        assert_eq!(signal.kind, SignalKind::CallRejected);
        assert!(signal.kind.is_control());
        assert_eq!(signal.payload, json!({}));
    }

    #[test]
    fn null_payload_becomes_empty_object() {
        let signal = Signal::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            Uuid::new_v4(),
            SignalKind::CallEnded,
            serde_json::Value::Null,
        );
        assert_eq!(signal.payload, json!({}));
    }

    #[test]
    fn decode_reports_malformed_payloads() {
        #[derive(Debug, Deserialize)]
        struct Sdp {
            #[allow(dead_code)]
            sdp: String,
        }
        let signal = Signal::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            Uuid::new_v4(),
            SignalKind::Offer,
            json!({ "type": "offer" }),
        );
        let err = signal.decode::<Sdp>().unwrap_err();
        assert_eq!(err.error_code(), "MALFORMED_SIGNAL");
    }
}
