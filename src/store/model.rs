//! Row-shaped types passed to and from the store (§3, §4.3).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// An objective as handed down by HQ, ready for `store_objective`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Objective {
    pub id: String,
    pub title: String,
    pub description: String,
    pub hat: String,
    pub base_branch: String,
    pub token_budget: u64,
    pub checklist: Vec<String>,
}

/// A persisted objective, as read back from the store.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ObjectiveRow {
    pub id: String,
    pub title: String,
    pub description: String,
    pub hat: String,
    pub base_branch: String,
    pub token_budget: i64,
    pub checklist: String,
    pub status: String,
    pub created_at: String,
    pub completed_at: Option<String>,
}

/// A persisted session, as read back from the store.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SessionRow {
    pub id: String,
    pub objective_id: String,
    pub hat: String,
    pub status: String,
    pub iteration_count: i64,
    pub created_at: String,
    pub started_at: Option<String>,
    pub ended_at: Option<String>,
}

/// An activity event ready for `record_activity`. The caller (the recorder,
/// §4.4) has already assigned `id` and `created_at`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityEvent {
    pub id: String,
    pub session_id: String,
    pub objective_id: String,
    pub iteration: u32,
    pub event_type: String,
    pub content: String,
    pub tokens_input: u64,
    pub tokens_output: u64,
    pub hat: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A persisted activity event, as read back by `get_unsynced_activity`.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ActivityRow {
    pub id: String,
    pub session_id: String,
    pub objective_id: String,
    pub iteration: i64,
    pub event_type: String,
    pub content: String,
    pub tokens_input: i64,
    pub tokens_output: i64,
    pub hat: Option<String>,
    pub created_at: String,
    pub synced: bool,
}

/// A session checkpoint (§3 "SessionState checkpoint"). At most one row per
/// `session_id`; `status == "running"` is the only one considered
/// incomplete for recovery.
///
/// `done`/`failed` are stored as JSON arrays in their own TEXT columns, so
/// this type is assembled by hand in `store::ops` rather than derived via
/// `sqlx::FromRow`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionState {
    pub session_id: String,
    pub objective_id: String,
    pub hat: String,
    pub iteration: u32,
    pub tokens_input: u64,
    pub tokens_output: u64,
    /// Serialized conversation history (JSON array of messages).
    pub conversation: String,
    pub scratchpad: String,
    pub done: Vec<String>,
    pub failed: Vec<String>,
    /// Serialized `Vec<HatVisit>` (JSON).
    pub hat_history: String,
    pub transition_count: u32,
    pub previous_hat: Option<String>,
    pub status: String,
    pub work_dir: String,
}
