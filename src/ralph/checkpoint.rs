//! Completion reporting (§3 `CompletionReport`, §4.2's `completed` message).

use crate::protocol::CompletionReportPayload;
use crate::ralph::session::Session;
use crate::types::{ObjectiveId, SessionId};
use chrono::{DateTime, Utc};

/// A finished session's final report, handed to the worker handle for
/// checkpointing and upstream delivery.
#[derive(Debug, Clone)]
pub struct CompletionReport {
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

impl CompletionReport {
    pub fn new(session: &Session, status: impl Into<String>, summary: impl Into<String>) -> Self {
        Self {
            objective_id: session.objective_id.clone(),
            session_id: session.session_id.clone(),
            status: status.into(),
            summary: summary.into(),
            pr_url: session.pr_url.clone(),
            total_tokens: session.total_tokens(),
            iterations: session.iteration_count,
            checklist_done: session.done.clone(),
            errors: session.failed.iter().cloned().collect(),
            completed_at: Utc::now(),
        }
    }

    pub fn into_payload(self) -> CompletionReportPayload {
        CompletionReportPayload {
            objective_id: self.objective_id,
            session_id: self.session_id,
            status: self.status,
            summary: self.summary,
            pr_url: self.pr_url,
            total_tokens: self.total_tokens,
            iterations: self.iterations,
            checklist_done: self.checklist_done,
            errors: self.errors,
            completed_at: self.completed_at,
        }
    }
}
