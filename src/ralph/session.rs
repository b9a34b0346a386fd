//! Session state (§3): the in-memory shape of one execution of one
//! objective, plus conversion to and from the store's checkpoint row.

use crate::ralph::hat::{Hat, HatVisit, MAX_HAT_VISITS, MAX_TOTAL_TRANSITIONS};
use crate::store::SessionState as CheckpointRow;
use crate::types::{BudgetKind, Error, ObjectiveId, ProjectId, Result, SessionId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

/// The project a session works against (§3). Cloning/remote access is
/// delegated — only the identifying fields the loop needs live here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: ProjectId,
    pub name: String,
    pub github_owner: Option<String>,
    pub github_repo: Option<String>,
    pub clone_url: Option<String>,
}

/// A worker's decrypted secret material (§3), unsealed from the dispatch
/// envelope's `secrets_encrypted` field.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerSecrets {
    pub llm_api_key: String,
    pub github_token: Option<String>,
    pub extra: std::collections::HashMap<String, String>,
}

/// One execution of one objective by one worker. `done` and `failed` are
/// kept disjoint; `hat_history`'s last entry always mirrors the current hat.
#[derive(Debug, Clone)]
pub struct Session {
    pub session_id: SessionId,
    pub objective_id: ObjectiveId,
    pub work_dir: PathBuf,

    pub hat: Hat,
    pub iteration_count: u32,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub started_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,

    pub token_budget: u64,
    pub max_iterations: u32,
    pub max_runtime: Duration,

    pub scratchpad: String,
    pub predecessor_context: Option<String>,

    /// Completed item ids in the order they were marked done (§8: the
    /// happy-path report asserts `checklist_done == ["1", "2"]`, not just a
    /// count, so a `HashSet` can't back this field).
    pub done: Vec<String>,
    pub failed: HashSet<String>,

    pub hat_history: Vec<HatVisit>,
    pub transition_count: u32,
    pub previous_hat: Option<Hat>,

    pub quality_gate_runs: u32,
    pub pr_url: Option<String>,
}

impl Session {
    pub fn new(
        session_id: SessionId,
        objective_id: ObjectiveId,
        work_dir: PathBuf,
        hat: Hat,
        token_budget: u64,
        max_iterations: u32,
        max_runtime: Duration,
    ) -> Self {
        let now = Utc::now();
        Self {
            session_id,
            objective_id,
            work_dir,
            hat,
            iteration_count: 0,
            input_tokens: 0,
            output_tokens: 0,
            started_at: now,
            last_activity: now,
            token_budget,
            max_iterations,
            max_runtime,
            scratchpad: String::new(),
            predecessor_context: None,
            done: Vec::new(),
            failed: HashSet::new(),
            hat_history: vec![HatVisit::open(hat, now)],
            transition_count: 0,
            previous_hat: None,
            quality_gate_runs: 0,
            pr_url: None,
        }
    }

    /// §4.6 step 4: account for one iteration's token usage and bump
    /// `last_activity`.
    pub fn record_iteration(&mut self, input_tokens: u64, output_tokens: u64) {
        self.iteration_count += 1;
        self.input_tokens += input_tokens;
        self.output_tokens += output_tokens;
        self.last_activity = Utc::now();
    }

    pub fn total_tokens(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }

    /// §4.6 step 2: check every configured budget. `0` means unlimited.
    pub fn budget_exceeded(&self) -> Option<BudgetKind> {
        if self.max_iterations != 0 && self.iteration_count >= self.max_iterations {
            return Some(BudgetKind::IterationLimit);
        }
        if self.token_budget != 0 && self.total_tokens() >= self.token_budget {
            return Some(BudgetKind::TokenBudget);
        }
        if self.max_runtime != Duration::ZERO {
            let elapsed = (Utc::now() - self.started_at)
                .to_std()
                .unwrap_or(Duration::ZERO);
            if elapsed >= self.max_runtime {
                return Some(BudgetKind::RuntimeLimit);
            }
        }
        None
    }

    pub fn mark_checklist_done(&mut self, item_id: &str) {
        self.failed.remove(item_id);
        if !self.done.iter().any(|id| id == item_id) {
            self.done.push(item_id.to_string());
        }
    }

    pub fn mark_checklist_failed(&mut self, item_id: &str) {
        self.done.retain(|id| id != item_id);
        self.failed.insert(item_id.to_string());
    }

    pub fn set_scratchpad(&mut self, content: String) {
        self.scratchpad = content;
    }

    /// §4.6 step 8: transition to the hat targeted by `event`, enforcing the
    /// per-hat visit cap and the total-transition cap. Closes out the
    /// current `HatVisit` before opening the next.
    pub fn transition_to(&mut self, next: Hat, event: &str) -> Result<()> {
        if self.transition_count >= MAX_TOTAL_TRANSITIONS {
            return Err(Error::loop_limit(format!(
                "session exceeded {MAX_TOTAL_TRANSITIONS} total hat transitions"
            )));
        }
        let visits_for_next = self
            .hat_history
            .iter()
            .filter(|visit| visit.hat == next)
            .count() as u32;
        if visits_for_next >= MAX_HAT_VISITS {
            return Err(Error::loop_limit(format!(
                "hat {next} already visited {MAX_HAT_VISITS} times"
            )));
        }

        let now = Utc::now();
        if let Some(current) = self.hat_history.last_mut() {
            current.ended_at = Some(now);
            current.exit_event = Some(event.to_string());
        }
        self.previous_hat = Some(self.hat);
        self.hat = next;
        self.transition_count += 1;
        self.hat_history.push(HatVisit::open(next, now));
        Ok(())
    }

    /// Serialize to the store's checkpoint row. `conversation` is supplied
    /// separately by the loop, which owns the message history.
    pub fn to_checkpoint(&self, conversation_json: String, status: &str) -> Result<CheckpointRow> {
        Ok(CheckpointRow {
            session_id: self.session_id.as_str().to_string(),
            objective_id: self.objective_id.as_str().to_string(),
            hat: self.hat.as_str().to_string(),
            iteration: self.iteration_count,
            tokens_input: self.input_tokens,
            tokens_output: self.output_tokens,
            conversation: conversation_json,
            scratchpad: self.scratchpad.clone(),
            done: self.done.clone(),
            failed: self.failed.iter().cloned().collect(),
            hat_history: serde_json::to_string(&self.hat_history)?,
            transition_count: self.transition_count,
            previous_hat: self.previous_hat.map(|h| h.as_str().to_string()),
            status: status.to_string(),
            work_dir: self.work_dir.display().to_string(),
        })
    }

    /// Rehydrate from a checkpoint row. Returns the conversation JSON
    /// alongside so the caller can deserialize it into its own message type.
    pub fn from_checkpoint(
        row: CheckpointRow,
        token_budget: u64,
        max_iterations: u32,
        max_runtime: Duration,
    ) -> Result<(Self, String)> {
        let hat = Hat::from_str(&row.hat)
            .ok_or_else(|| Error::storage(format!("unknown hat in checkpoint: {}", row.hat)))?;
        let hat_history: Vec<HatVisit> = serde_json::from_str(&row.hat_history)?;
        let previous_hat = row
            .previous_hat
            .as_deref()
            .map(|h| {
                Hat::from_str(h).ok_or_else(|| Error::storage(format!("unknown previous hat in checkpoint: {h}")))
            })
            .transpose()?;

        let session = Session {
            session_id: SessionId::from_string(row.session_id)
                .map_err(|e| Error::storage(e.to_string()))?,
            objective_id: ObjectiveId::from_string(row.objective_id)
                .map_err(|e| Error::storage(e.to_string()))?,
            work_dir: PathBuf::from(row.work_dir),
            hat,
            iteration_count: row.iteration,
            input_tokens: row.tokens_input,
            output_tokens: row.tokens_output,
            started_at: hat_history.first().map(|v| v.started_at).unwrap_or_else(Utc::now),
            last_activity: Utc::now(),
            token_budget,
            max_iterations,
            max_runtime,
            scratchpad: row.scratchpad,
            predecessor_context: None,
            done: row.done,
            failed: row.failed.into_iter().collect(),
            hat_history,
            transition_count: row.transition_count,
            previous_hat,
            quality_gate_runs: 0,
            pr_url: None,
        };
        Ok((session, row.conversation))
    }
}
