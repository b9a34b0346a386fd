//! The worker-local durable store (§2 "C3"): a single-file ACID database
//! covering objectives, sessions, activity (with sync flag), session
//! checkpoints, and optionally-encrypted secrets.

mod model;
mod ops;
mod schema;

pub use model::{ActivityEvent, ActivityRow, Objective, ObjectiveRow, SessionRow, SessionState};
pub use ops::Store;

use crate::crypto::MasterKey;
use crate::types::Result;
use sqlx::sqlite::SqlitePoolOptions;
use std::time::Duration;

impl Store {
    /// Open (creating if absent) the sqlite file at `path`.
    pub async fn open(path: &str, master_key: Option<MasterKey>) -> Result<Self> {
        let url = format!("sqlite:{path}?mode=rwc");
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .acquire_timeout(Duration::from_secs(5))
            .connect(&url)
            .await?;
        schema::ensure_schema(&pool).await?;
        Ok(Self::from_pool(pool, master_key))
    }

    /// An in-memory store, for tests.
    pub async fn open_memory(master_key: Option<MasterKey>) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        schema::ensure_schema(&pool).await?;
        Ok(Self::from_pool(pool, master_key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::model::{ActivityEvent, Objective, SessionState};
    use chrono::Utc;

    async fn memory_store() -> Store {
        Store::open_memory(None).await.unwrap()
    }

    fn sample_objective() -> Objective {
        Objective {
            id: "obj-1".to_string(),
            title: "Add feature".to_string(),
            description: "Do the thing".to_string(),
            hat: "explorer".to_string(),
            base_branch: "main".to_string(),
            token_budget: 0,
            checklist: vec!["step one".to_string(), "step two".to_string()],
        }
    }

    #[tokio::test]
    async fn store_and_fetch_objective() {
        let store = memory_store().await;
        store.store_objective(&sample_objective()).await.unwrap();
        let row = store.get_objective("obj-1").await.unwrap().unwrap();
        assert_eq!(row.status, "pending");
        assert_eq!(row.title, "Add feature");
    }

    #[tokio::test]
    async fn update_objective_status_sets_completed_at_only_when_terminal() {
        let store = memory_store().await;
        store.store_objective(&sample_objective()).await.unwrap();
        store.update_objective_status("obj-1", "running").await.unwrap();
        let row = store.get_objective("obj-1").await.unwrap().unwrap();
        assert!(row.completed_at.is_none());

        store.update_objective_status("obj-1", "completed").await.unwrap();
        let row = store.get_objective("obj-1").await.unwrap().unwrap();
        assert!(row.completed_at.is_some());
    }

    #[tokio::test]
    async fn session_lifecycle_sets_started_and_ended_at() {
        let store = memory_store().await;
        store.store_objective(&sample_objective()).await.unwrap();
        store.create_session("sess-1", "obj-1", "explorer").await.unwrap();
        let row = store.get_session("sess-1").await.unwrap().unwrap();
        assert!(row.started_at.is_none());

        store.update_session_status("sess-1", "running").await.unwrap();
        let row = store.get_session("sess-1").await.unwrap().unwrap();
        assert!(row.started_at.is_some());
        assert!(row.ended_at.is_none());

        store.increment_session_iteration("sess-1").await.unwrap();
        let row = store.get_session("sess-1").await.unwrap().unwrap();
        assert_eq!(row.iteration_count, 1);

        store.update_session_status("sess-1", "completed").await.unwrap();
        let row = store.get_session("sess-1").await.unwrap().unwrap();
        assert!(row.ended_at.is_some());
    }

    #[tokio::test]
    async fn activity_sync_cycle() {
        let store = memory_store().await;
        store.store_objective(&sample_objective()).await.unwrap();
        store.create_session("sess-1", "obj-1", "explorer").await.unwrap();

        let event = ActivityEvent {
            id: "evt-1".to_string(),
            session_id: "sess-1".to_string(),
            objective_id: "obj-1".to_string(),
            iteration: 1,
            event_type: "assistant_response".to_string(),
            content: "hello".to_string(),
            tokens_input: 10,
            tokens_output: 20,
            hat: Some("explorer".to_string()),
            created_at: Utc::now(),
        };
        store.record_activity(&event).await.unwrap();

        let unsynced = store.get_unsynced_activity(10).await.unwrap();
        assert_eq!(unsynced.len(), 1);

        let (sum_in, sum_out) = store.get_objective_token_usage("obj-1").await.unwrap();
        assert_eq!((sum_in, sum_out), (10, 20));
        assert_eq!(store.get_objective_iteration_count("obj-1").await.unwrap(), 1);

        store
            .mark_activity_synced(&[event.id.clone()])
            .await
            .unwrap();
        assert!(store.get_unsynced_activity(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn mark_activity_synced_on_empty_ids_is_a_no_op() {
        let store = memory_store().await;
        store.mark_activity_synced(&[]).await.unwrap();
    }

    #[tokio::test]
    async fn unconfigured_store_round_trips_plaintext_secret() {
        let store = Store::open_memory(None).await.unwrap();
        store.store_secret("anthropic_key", b"sk-plain").await.unwrap();
        let value = store.get_secret("anthropic_key").await.unwrap().unwrap();
        assert_eq!(value, b"sk-plain");
    }

    #[tokio::test]
    async fn configured_store_encrypts_secrets_transparently() {
        let key = crate::crypto::MasterKey::generate();
        let store = Store::open_memory(Some(key)).await.unwrap();
        store.store_secret("github_token", b"gh-secret").await.unwrap();
        let value = store.get_secret("github_token").await.unwrap().unwrap();
        assert_eq!(value, b"gh-secret");
    }

    #[tokio::test]
    async fn encrypted_but_unconfigured_reader_returns_ciphertext_unchanged() {
        let key = crate::crypto::MasterKey::generate();
        let encrypted_store = Store::open_memory(Some(key)).await.unwrap();
        encrypted_store.store_secret("token", b"plain").await.unwrap();

        // Re-open the same in-memory database with no master key configured
        // by reaching into the pool directly (simulating a later process
        // that lost its key).
        let pool = encrypted_store.pool.clone();
        let unconfigured_store = Store::from_pool(pool, None);
        let value = unconfigured_store.get_secret("token").await.unwrap().unwrap();
        assert_ne!(value, b"plain");
    }

    #[tokio::test]
    async fn session_state_checkpoint_round_trip() {
        let store = memory_store().await;
        let state = SessionState {
            session_id: "sess-1".to_string(),
            objective_id: "obj-1".to_string(),
            hat: "creator".to_string(),
            iteration: 3,
            tokens_input: 100,
            tokens_output: 200,
            conversation: "[]".to_string(),
            scratchpad: "notes".to_string(),
            done: vec!["item-1".to_string()],
            failed: vec![],
            hat_history: "[]".to_string(),
            transition_count: 1,
            previous_hat: Some("explorer".to_string()),
            status: "running".to_string(),
            work_dir: "/tmp/work".to_string(),
        };
        store.save_session_state(&state).await.unwrap();

        let restored = store.get_incomplete_session().await.unwrap().unwrap();
        assert_eq!(restored.session_id, "sess-1");
        assert_eq!(restored.done, vec!["item-1".to_string()]);

        store.mark_session_complete("sess-1", "completed").await.unwrap();
        assert!(store.get_incomplete_session().await.unwrap().is_none());

        store.delete_session_state("sess-1").await.unwrap();
    }

    #[tokio::test]
    async fn save_session_state_upserts_by_session_id() {
        let store = memory_store().await;
        let mut state = SessionState {
            session_id: "sess-1".to_string(),
            objective_id: "obj-1".to_string(),
            hat: "explorer".to_string(),
            iteration: 1,
            tokens_input: 1,
            tokens_output: 1,
            conversation: "[]".to_string(),
            scratchpad: String::new(),
            done: vec![],
            failed: vec![],
            hat_history: "[]".to_string(),
            transition_count: 0,
            previous_hat: None,
            status: "running".to_string(),
            work_dir: "/tmp/work".to_string(),
        };
        store.save_session_state(&state).await.unwrap();
        state.iteration = 5;
        state.hat = "planner".to_string();
        store.save_session_state(&state).await.unwrap();

        let restored = store.get_incomplete_session().await.unwrap().unwrap();
        assert_eq!(restored.iteration, 5);
        assert_eq!(restored.hat, "planner");
    }
}
