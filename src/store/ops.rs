//! Store operations (§4.3's operation contract).

use crate::crypto::MasterKey;
use crate::store::model::{
    ActivityEvent, ActivityRow, Objective, ObjectiveRow, SessionRow, SessionState,
};
use crate::types::{Error, Result};
use chrono::Utc;
use sqlx::{Row, SqlitePool};

pub struct Store {
    pub(crate) pool: SqlitePool,
    pub(crate) master_key: Option<MasterKey>,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("master_key_configured", &self.master_key.is_some())
            .finish_non_exhaustive()
    }
}

impl Store {
    pub(crate) fn from_pool(pool: SqlitePool, master_key: Option<MasterKey>) -> Self {
        Self { pool, master_key }
    }

    pub async fn store_objective(&self, objective: &Objective) -> Result<()> {
        let checklist = serde_json::to_string(&objective.checklist)?;
        sqlx::query(
            "INSERT INTO objectives (id, title, description, hat, base_branch, token_budget, checklist, status, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, 'pending', ?)",
        )
        .bind(&objective.id)
        .bind(&objective.title)
        .bind(&objective.description)
        .bind(&objective.hat)
        .bind(&objective.base_branch)
        .bind(objective.token_budget as i64)
        .bind(checklist)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn update_objective_status(&self, id: &str, status: &str) -> Result<()> {
        if is_terminal_objective_status(status) {
            sqlx::query("UPDATE objectives SET status = ?, completed_at = ? WHERE id = ?")
                .bind(status)
                .bind(Utc::now().to_rfc3339())
                .bind(id)
                .execute(&self.pool)
                .await?;
        } else {
            sqlx::query("UPDATE objectives SET status = ? WHERE id = ?")
                .bind(status)
                .bind(id)
                .execute(&self.pool)
                .await?;
        }
        Ok(())
    }

    pub async fn get_objective(&self, id: &str) -> Result<Option<ObjectiveRow>> {
        let row = sqlx::query_as::<_, ObjectiveRow>("SELECT * FROM objectives WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    pub async fn create_session(&self, session_id: &str, objective_id: &str, hat: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO sessions (id, objective_id, hat, status, iteration_count, created_at)
             VALUES (?, ?, ?, 'pending', 0, ?)",
        )
        .bind(session_id)
        .bind(objective_id)
        .bind(hat)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn update_session_status(&self, session_id: &str, status: &str) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        if status == "running" {
            sqlx::query(
                "UPDATE sessions SET status = ?, started_at = COALESCE(started_at, ?) WHERE id = ?",
            )
            .bind(status)
            .bind(now)
            .bind(session_id)
            .execute(&self.pool)
            .await?;
        } else if is_terminal_session_status(status) {
            sqlx::query("UPDATE sessions SET status = ?, ended_at = ? WHERE id = ?")
                .bind(status)
                .bind(now)
                .bind(session_id)
                .execute(&self.pool)
                .await?;
        } else {
            sqlx::query("UPDATE sessions SET status = ? WHERE id = ?")
                .bind(status)
                .bind(session_id)
                .execute(&self.pool)
                .await?;
        }
        Ok(())
    }

    pub async fn increment_session_iteration(&self, session_id: &str) -> Result<()> {
        sqlx::query("UPDATE sessions SET iteration_count = iteration_count + 1 WHERE id = ?")
            .bind(session_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn get_session(&self, session_id: &str) -> Result<Option<SessionRow>> {
        let row = sqlx::query_as::<_, SessionRow>("SELECT * FROM sessions WHERE id = ?")
            .bind(session_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    pub async fn record_activity(&self, event: &ActivityEvent) -> Result<()> {
        sqlx::query(
            "INSERT INTO activity (id, session_id, objective_id, iteration, event_type, content, tokens_input, tokens_output, hat, created_at, synced)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0)",
        )
        .bind(&event.id)
        .bind(&event.session_id)
        .bind(&event.objective_id)
        .bind(event.iteration as i64)
        .bind(&event.event_type)
        .bind(&event.content)
        .bind(event.tokens_input as i64)
        .bind(event.tokens_output as i64)
        .bind(&event.hat)
        .bind(event.created_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_unsynced_activity(&self, limit: u32) -> Result<Vec<ActivityRow>> {
        let rows = sqlx::query_as::<_, ActivityRow>(
            "SELECT * FROM activity WHERE synced = 0 ORDER BY created_at ASC LIMIT ?",
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Idempotent; an empty `ids` is a no-op.
    pub async fn mark_activity_synced(&self, ids: &[String]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let placeholders = vec!["?"; ids.len()].join(",");
        let sql = format!("UPDATE activity SET synced = 1 WHERE id IN ({placeholders})");
        let mut query = sqlx::query(&sql);
        for id in ids {
            query = query.bind(id);
        }
        query.execute(&self.pool).await?;
        Ok(())
    }

    pub async fn get_objective_token_usage(&self, objective_id: &str) -> Result<(u64, u64)> {
        let row = sqlx::query(
            "SELECT COALESCE(SUM(tokens_input), 0) AS sum_in, COALESCE(SUM(tokens_output), 0) AS sum_out
             FROM activity WHERE objective_id = ?",
        )
        .bind(objective_id)
        .fetch_one(&self.pool)
        .await?;
        let sum_in: i64 = row.try_get("sum_in")?;
        let sum_out: i64 = row.try_get("sum_out")?;
        Ok((sum_in as u64, sum_out as u64))
    }

    pub async fn get_objective_iteration_count(&self, objective_id: &str) -> Result<u32> {
        let row = sqlx::query(
            "SELECT COALESCE(MAX(iteration), 0) AS max_iter FROM activity WHERE objective_id = ?",
        )
        .bind(objective_id)
        .fetch_one(&self.pool)
        .await?;
        let max_iter: i64 = row.try_get("max_iter")?;
        Ok(max_iter as u32)
    }

    /// Transparently encrypts with the master key when one is configured.
    /// An unconfigured store persists plaintext.
    pub async fn store_secret(&self, key: &str, value: &[u8]) -> Result<()> {
        let (stored, encrypted) = match &self.master_key {
            Some(master_key) => (master_key.encrypt(value)?, true),
            None => (value.to_vec(), false),
        };
        sqlx::query(
            "INSERT INTO secrets (key, value, encrypted) VALUES (?, ?, ?)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, encrypted = excluded.encrypted",
        )
        .bind(key)
        .bind(stored)
        .bind(encrypted)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// An encrypted-but-unconfigured reader returns ciphertext unchanged.
    pub async fn get_secret(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let row = sqlx::query("SELECT value, encrypted FROM secrets WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else { return Ok(None) };
        let value: Vec<u8> = row.try_get("value")?;
        let encrypted: bool = row.try_get("encrypted")?;
        match (encrypted, &self.master_key) {
            (true, Some(master_key)) => Ok(Some(master_key.decrypt(&value)?)),
            _ => Ok(Some(value)),
        }
    }

    /// Upsert by `session_id`.
    pub async fn save_session_state(&self, state: &SessionState) -> Result<()> {
        let done = serde_json::to_string(&state.done)?;
        let failed = serde_json::to_string(&state.failed)?;
        sqlx::query(
            "INSERT INTO session_state
                (session_id, objective_id, hat, iteration, tokens_input, tokens_output,
                 conversation, scratchpad, done, failed, hat_history, transition_count,
                 previous_hat, status, work_dir, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(session_id) DO UPDATE SET
                hat = excluded.hat,
                iteration = excluded.iteration,
                tokens_input = excluded.tokens_input,
                tokens_output = excluded.tokens_output,
                conversation = excluded.conversation,
                scratchpad = excluded.scratchpad,
                done = excluded.done,
                failed = excluded.failed,
                hat_history = excluded.hat_history,
                transition_count = excluded.transition_count,
                previous_hat = excluded.previous_hat,
                status = excluded.status,
                work_dir = excluded.work_dir,
                updated_at = excluded.updated_at",
        )
        .bind(&state.session_id)
        .bind(&state.objective_id)
        .bind(&state.hat)
        .bind(state.iteration as i64)
        .bind(state.tokens_input as i64)
        .bind(state.tokens_output as i64)
        .bind(&state.conversation)
        .bind(&state.scratchpad)
        .bind(done)
        .bind(failed)
        .bind(&state.hat_history)
        .bind(state.transition_count as i64)
        .bind(&state.previous_hat)
        .bind(&state.status)
        .bind(&state.work_dir)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Returns the oldest `status='running'` row, or `None`.
    pub async fn get_incomplete_session(&self) -> Result<Option<SessionState>> {
        let row = sqlx::query(
            "SELECT * FROM session_state WHERE status = 'running' ORDER BY updated_at ASC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?;
        let Some(row) = row else { return Ok(None) };
        Ok(Some(session_state_from_row(row)?))
    }

    pub async fn mark_session_complete(&self, session_id: &str, status: &str) -> Result<()> {
        sqlx::query("UPDATE session_state SET status = ?, updated_at = ? WHERE session_id = ?")
            .bind(status)
            .bind(Utc::now().to_rfc3339())
            .bind(session_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn delete_session_state(&self, session_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM session_state WHERE session_id = ?")
            .bind(session_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

fn session_state_from_row(row: sqlx::sqlite::SqliteRow) -> Result<SessionState> {
    let done_raw: String = row.try_get("done")?;
    let failed_raw: String = row.try_get("failed")?;
    let iteration: i64 = row.try_get("iteration")?;
    let tokens_input: i64 = row.try_get("tokens_input")?;
    let tokens_output: i64 = row.try_get("tokens_output")?;
    let transition_count: i64 = row.try_get("transition_count")?;
    Ok(SessionState {
        session_id: row.try_get("session_id")?,
        objective_id: row.try_get("objective_id")?,
        hat: row.try_get("hat")?,
        iteration: iteration as u32,
        tokens_input: tokens_input as u64,
        tokens_output: tokens_output as u64,
        conversation: row.try_get("conversation")?,
        scratchpad: row.try_get("scratchpad")?,
        done: serde_json::from_str(&done_raw).map_err(Error::from)?,
        failed: serde_json::from_str(&failed_raw).map_err(Error::from)?,
        hat_history: row.try_get("hat_history")?,
        transition_count: transition_count as u32,
        previous_hat: row.try_get("previous_hat")?,
        status: row.try_get("status")?,
        work_dir: row.try_get("work_dir")?,
    })
}

fn is_terminal_objective_status(status: &str) -> bool {
    matches!(status, "completed" | "failed" | "cancelled")
}

fn is_terminal_session_status(status: &str) -> bool {
    matches!(
        status,
        "completed" | "failed" | "loop_limit" | "cancelled" | "hat_transition"
    )
}
