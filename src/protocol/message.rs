//! Wire message envelope and payloads (§4.2).
//!
//! Every message on the wire is a JSON object `{type, id?, timestamp,
//! payload?}` terminated by a single `\n`. `type` and `payload` are kept
//! loosely coupled — the envelope is deserialized in two steps so an
//! `error`/unknown-type message never trips a payload-shape mismatch before
//! we've even looked at `type`.

use crate::types::{ObjectiveId, SessionId, WorkerId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One activity event as carried in an `activity` message (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityEventPayload {
    pub id: String,
    pub session_id: SessionId,
    pub objective_id: ObjectiveId,
    pub iteration: u32,
    pub event_type: String,
    pub content: Value,
    pub tokens_input: u64,
    pub tokens_output: u64,
    pub hat: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// The dispatch unit carried in a `dispatch` message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectivePayload {
    pub objective: Value,
    pub project: Value,
    /// Opaque sealed blob, base64-encoded: the worker's own secrets.
    pub secrets_encrypted: String,
    pub sync_config: Value,
    pub dispatched_at: DateTime<Utc>,
    pub hq_public_key: String,
}

/// A finished session's report, carried in a `completed` message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionReportPayload {
    pub objective_id: ObjectiveId,
    pub session_id: SessionId,
    pub status: String,
    pub summary: String,
    pub pr_url: Option<String>,
    pub total_tokens: u64,
    pub iterations: u32,
    pub checklist_done: Vec<String>,
    pub errors: Vec<String>,
    pub completed_at: DateTime<Utc>,
}

/// The fixed set of message payloads (§4.2's table). `Unknown` covers any
/// message type this build doesn't recognize — receivers log and ignore it
/// rather than failing the connection (forward-compat).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum Payload {
    Dispatch {
        objective: ObjectivePayload,
    },
    Cancel {
        objective_id: ObjectiveId,
        reason: Option<String>,
    },
    Shutdown,
    Ping,
    Ready {
        worker_id: WorkerId,
        version: String,
        public_key: String,
    },
    Accepted {
        objective_id: ObjectiveId,
        session_id: SessionId,
    },
    Progress {
        objective_id: ObjectiveId,
        session_id: SessionId,
        iteration: u32,
        tokens_input: u64,
        tokens_output: u64,
        hat: Option<String>,
        status: Option<String>,
    },
    Activity {
        objective_id: ObjectiveId,
        session_id: SessionId,
        events: Vec<ActivityEventPayload>,
    },
    Heartbeat {
        objective_id: Option<ObjectiveId>,
        session_id: Option<SessionId>,
        progress: Option<Value>,
    },
    Completed {
        report: CompletionReportPayload,
    },
    Failed {
        objective_id: ObjectiveId,
        session_id: SessionId,
        error: String,
        iteration: u32,
    },
    Cancelled {
        objective_id: ObjectiveId,
        session_id: SessionId,
        error: String,
        iteration: u32,
    },
    Pong,
    ShutdownAck,
    Error {
        code: String,
        message: String,
    },
    #[serde(other)]
    Unknown,
}

impl Payload {
    /// The `type` discriminant as it appears on the wire, for logging.
    pub fn type_name(&self) -> &'static str {
        match self {
            Payload::Dispatch { .. } => "dispatch",
            Payload::Cancel { .. } => "cancel",
            Payload::Shutdown => "shutdown",
            Payload::Ping => "ping",
            Payload::Ready { .. } => "ready",
            Payload::Accepted { .. } => "accepted",
            Payload::Progress { .. } => "progress",
            Payload::Activity { .. } => "activity",
            Payload::Heartbeat { .. } => "heartbeat",
            Payload::Completed { .. } => "completed",
            Payload::Failed { .. } => "failed",
            Payload::Cancelled { .. } => "cancelled",
            Payload::Pong => "pong",
            Payload::ShutdownAck => "shutdown_ack",
            Payload::Error { .. } => "error",
            Payload::Unknown => "unknown",
        }
    }
}

/// The envelope wrapping every `Payload` on the wire: `{type, id?,
/// timestamp, payload?}`. `serde(flatten)` lets the tagged `Payload` enum
/// contribute both `type` and `payload` fields directly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub id: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub payload: Payload,
}

impl Envelope {
    pub fn new(payload: Payload) -> Self {
        Self {
            id: None,
            timestamp: Utc::now(),
            payload,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ping_round_trips_with_no_payload_field() {
        let env = Envelope::new(Payload::Ping);
        let line = serde_json::to_string(&env).unwrap();
        assert!(!line.contains("\"payload\""));
        let parsed: Envelope = serde_json::from_str(&line).unwrap();
        assert!(matches!(parsed.payload, Payload::Ping));
    }

    #[test]
    fn unknown_type_is_tolerated() {
        let line = r#"{"type":"some_future_type","timestamp":"2026-01-01T00:00:00Z"}"#;
        let parsed: Envelope = serde_json::from_str(line).unwrap();
        assert!(matches!(parsed.payload, Payload::Unknown));
    }

    #[test]
    fn cancel_round_trips_with_payload() {
        let env = Envelope::new(Payload::Cancel {
            objective_id: ObjectiveId::from_string("obj-1".to_string()).unwrap(),
            reason: Some("superseded".to_string()),
        });
        let line = serde_json::to_string(&env).unwrap();
        let parsed: Envelope = serde_json::from_str(&line).unwrap();
        match parsed.payload {
            Payload::Cancel { objective_id, reason } => {
                assert_eq!(objective_id.as_str(), "obj-1");
                assert_eq!(reason.as_deref(), Some("superseded"));
            }
            other => panic!("unexpected payload: {other:?}"),
        }
    }
}
