//! The activity recorder (§2 "C4"): wraps the store and the wire connection,
//! buffering events in memory and periodically flushing them upstream.
//!
//! Grounded on the same periodic-background-task shape as the teacher's
//! cleanup service: an `Arc<Mutex<...>>`-guarded pending list plus a
//! `tokio::time::interval` loop, except here the loop also talks to a
//! [`Conn`] instead of just sweeping local state.

use crate::protocol::{ActivityEventPayload, Conn, Payload};
use crate::store::{ActivityEvent, Store};
use crate::types::{ObjectiveId, Result, SessionId};
use chrono::Utc;
use serde_json::Value;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Mutex;
use tokio::time::{interval, Duration};
use tracing::warn;
use uuid::Uuid;

/// Append-only event buffer feeding both the store and the wire connection.
pub struct Recorder<R, W> {
    store: Arc<Store>,
    conn: Option<Arc<Conn<R, W>>>,
    pending: Mutex<Vec<ActivityEvent>>,
}

impl<R, W> std::fmt::Debug for Recorder<R, W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Recorder")
            .field("has_conn", &self.conn.is_some())
            .finish_non_exhaustive()
    }
}

impl<R, W> Recorder<R, W>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(store: Arc<Store>, conn: Option<Arc<Conn<R, W>>>) -> Self {
        Self {
            store,
            conn,
            pending: Mutex::new(Vec::new()),
        }
    }

    /// Record one event: assigns a fresh id and timestamp, persists it to
    /// the store with `synced=false`, and appends it to the pending list.
    pub async fn record(
        &self,
        session_id: &SessionId,
        objective_id: &ObjectiveId,
        iteration: u32,
        event_type: &str,
        content: Value,
        tokens_input: u64,
        tokens_output: u64,
        hat: Option<String>,
    ) -> Result<()> {
        let content_str = match &content {
            Value::String(s) => s.clone(),
            other => serde_json::to_string(other)?,
        };
        let event = ActivityEvent {
            id: Uuid::new_v4().to_string(),
            session_id: session_id.as_str().to_string(),
            objective_id: objective_id.as_str().to_string(),
            iteration,
            event_type: event_type.to_string(),
            content: content_str,
            tokens_input,
            tokens_output,
            hat,
            created_at: Utc::now(),
        };
        self.store.record_activity(&event).await?;
        self.pending.lock().await.push(event);
        Ok(())
    }

    /// Atomically takes ownership of the pending list, sends one `activity`
    /// message, and on success marks those events synced. On failure the
    /// batch is prepended back for retry. With no connection configured,
    /// pending is cleared without retry (the data is already durable).
    pub async fn flush(&self) -> Result<()> {
        let Some(conn) = &self.conn else {
            self.pending.lock().await.clear();
            return Ok(());
        };

        let batch = {
            let mut pending = self.pending.lock().await;
            std::mem::take(&mut *pending)
        };
        if batch.is_empty() {
            return Ok(());
        }

        let (objective_id, session_id) = (
            ObjectiveId::from_string(batch[0].objective_id.clone())
                .map_err(|e| crate::types::Error::internal(e.to_string()))?,
            SessionId::from_string(batch[0].session_id.clone())
                .map_err(|e| crate::types::Error::internal(e.to_string()))?,
        );
        let events = batch
            .iter()
            .map(|event| ActivityEventPayload {
                id: event.id.clone(),
                session_id: SessionId::from_string(event.session_id.clone()).unwrap_or_else(
                    |_| session_id.clone(),
                ),
                objective_id: ObjectiveId::from_string(event.objective_id.clone())
                    .unwrap_or_else(|_| objective_id.clone()),
                iteration: event.iteration,
                event_type: event.event_type.clone(),
                content: serde_json::from_str(&event.content)
                    .unwrap_or_else(|_| Value::String(event.content.clone())),
                tokens_input: event.tokens_input,
                tokens_output: event.tokens_output,
                hat: event.hat.clone(),
                created_at: event.created_at,
            })
            .collect();

        let send_result = conn
            .send(Payload::Activity {
                objective_id,
                session_id,
                events,
            })
            .await;

        match send_result {
            Ok(()) => {
                let ids: Vec<String> = batch.iter().map(|e| e.id.clone()).collect();
                self.store.mark_activity_synced(&ids).await?;
                Ok(())
            }
            Err(err) => {
                warn!(error = %err, "activity flush failed, retrying next cycle");
                let mut pending = self.pending.lock().await;
                let mut retry = batch;
                retry.append(&mut pending);
                *pending = retry;
                Err(err)
            }
        }
    }

    /// Run the sync loop: wake every `sync_interval` and flush. Intended to
    /// be spawned as its own task; returns only when `stop` fires.
    pub async fn run_sync_loop(self: Arc<Self>, sync_interval: Duration, mut stop: tokio::sync::watch::Receiver<bool>) {
        let mut ticker = interval(sync_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(err) = self.flush().await {
                        warn!(error = %err, "periodic activity flush failed");
                    }
                }
                _ = stop.changed() => {
                    if *stop.borrow() {
                        break;
                    }
                }
            }
        }
        if let Err(err) = self.flush().await {
            warn!(error = %err, "final activity flush failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Payload;
    use tokio::io::duplex;

    fn ids() -> (SessionId, ObjectiveId) {
        (SessionId::new(), ObjectiveId::from_string("obj-1".to_string()).unwrap())
    }

    #[tokio::test]
    async fn record_persists_to_store_with_unsynced_flag() {
        let store = Arc::new(Store::open_memory(None).await.unwrap());
        let (session_id, objective_id) = ids();
        store
            .store_objective(&crate::store::Objective {
                id: objective_id.as_str().to_string(),
                title: "t".to_string(),
                description: "d".to_string(),
                hat: "explorer".to_string(),
                base_branch: "main".to_string(),
                token_budget: 0,
                checklist: vec![],
            })
            .await
            .unwrap();
        store
            .create_session(session_id.as_str(), objective_id.as_str(), "explorer")
            .await
            .unwrap();

        let recorder: Recorder<tokio::io::DuplexStream, tokio::io::DuplexStream> =
            Recorder::new(store.clone(), None);
        recorder
            .record(
                &session_id,
                &objective_id,
                1,
                "assistant_response",
                Value::String("hi".to_string()),
                5,
                10,
                Some("explorer".to_string()),
            )
            .await
            .unwrap();

        let unsynced = store.get_unsynced_activity(10).await.unwrap();
        assert_eq!(unsynced.len(), 1);
        assert!(!unsynced[0].synced);
    }

    #[tokio::test]
    async fn flush_with_no_connection_clears_pending_without_retry() {
        let store = Arc::new(Store::open_memory(None).await.unwrap());
        let (session_id, objective_id) = ids();
        store
            .store_objective(&crate::store::Objective {
                id: objective_id.as_str().to_string(),
                title: "t".to_string(),
                description: "d".to_string(),
                hat: "explorer".to_string(),
                base_branch: "main".to_string(),
                token_budget: 0,
                checklist: vec![],
            })
            .await
            .unwrap();
        store
            .create_session(session_id.as_str(), objective_id.as_str(), "explorer")
            .await
            .unwrap();

        let recorder: Recorder<tokio::io::DuplexStream, tokio::io::DuplexStream> =
            Recorder::new(store.clone(), None);
        recorder
            .record(
                &session_id,
                &objective_id,
                1,
                "debug_log",
                Value::String("hi".to_string()),
                0,
                0,
                None,
            )
            .await
            .unwrap();
        recorder.flush().await.unwrap();
        // Data remains durable in the store even though it was never synced.
        let unsynced = store.get_unsynced_activity(10).await.unwrap();
        assert_eq!(unsynced.len(), 1);
    }

    #[tokio::test]
    async fn flush_with_connection_sends_batch_and_marks_synced() {
        let store = Arc::new(Store::open_memory(None).await.unwrap());
        let (session_id, objective_id) = ids();
        store
            .store_objective(&crate::store::Objective {
                id: objective_id.as_str().to_string(),
                title: "t".to_string(),
                description: "d".to_string(),
                hat: "explorer".to_string(),
                base_branch: "main".to_string(),
                token_budget: 0,
                checklist: vec![],
            })
            .await
            .unwrap();
        store
            .create_session(session_id.as_str(), objective_id.as_str(), "explorer")
            .await
            .unwrap();

        let (a_read, b_write) = duplex(65536);
        let (b_read, a_write) = duplex(65536);
        let conn = Arc::new(Conn::new(a_read, a_write));
        let other = Conn::new(b_read, b_write);

        let recorder = Recorder::new(store.clone(), Some(conn));
        recorder
            .record(
                &session_id,
                &objective_id,
                1,
                "assistant_response",
                Value::String("hi".to_string()),
                1,
                2,
                Some("explorer".to_string()),
            )
            .await
            .unwrap();

        recorder.flush().await.unwrap();
        let envelope = other.receive().await.unwrap();
        assert!(matches!(envelope.payload, Payload::Activity { .. }));

        let unsynced = store.get_unsynced_activity(10).await.unwrap();
        assert!(unsynced.is_empty());
    }
}
