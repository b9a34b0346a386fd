//! The pool manager (§2 "C8"): owns local and remote worker handles,
//! serializes dispatch through a bounded queue, re-encrypts secrets
//! per-dispatch, fans out worker events, and runs the health loop.
//!
//! Grounded on the teacher's `kernel::services::ServiceRegistry` for the
//! `HashMap<id, handle>` bookkeeping plus load/health classification, and on
//! `kernel::cleanup::CleanupService` for the periodic-tick background task
//! shape the health loop reuses.

use crate::crypto::{seal, PublicKey};
use crate::protocol::ObjectivePayload;
use crate::types::{Error, ObjectiveId, PoolConfig, Result, WorkerId};
use crate::worker::{HandleState, WorkerEvent, WorkerHandle};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{watch, Mutex, RwLock, Semaphore};
use tracing::{info, warn};

/// Callbacks the manager drives as worker events arrive, registered once by
/// whatever owns the manager (HQ's dispatch surface, out of scope here).
pub trait EventSink: Send + Sync {
    fn on_progress(&self, worker_id: &WorkerId, event: &WorkerEvent) {
        let _ = (worker_id, event);
    }
    fn on_activity(&self, worker_id: &WorkerId, event: &WorkerEvent) {
        let _ = (worker_id, event);
    }
    fn on_completed(&self, worker_id: &WorkerId, event: &WorkerEvent) {
        let _ = (worker_id, event);
    }
    fn on_failed(&self, worker_id: &WorkerId, event: &WorkerEvent) {
        let _ = (worker_id, event);
    }
}

struct NoOpEventSink;
impl EventSink for NoOpEventSink {}

struct WorkerSlot {
    handle: Arc<dyn WorkerHandle>,
    public_key: Option<PublicKey>,
}

/// Owns every worker the process knows about, local and remote, and
/// arbitrates dispatch across them.
pub struct PoolManager {
    local: RwLock<HashMap<WorkerId, WorkerSlot>>,
    remote: RwLock<HashMap<WorkerId, WorkerSlot>>,
    dispatch_permits: Semaphore,
    config: PoolConfig,
    sink: Arc<dyn EventSink>,
    stop: watch::Sender<bool>,
}

impl PoolManager {
    pub fn new(config: PoolConfig) -> Arc<Self> {
        Self::with_sink(config, Arc::new(NoOpEventSink))
    }

    pub fn with_sink(config: PoolConfig, sink: Arc<dyn EventSink>) -> Arc<Self> {
        let (stop_tx, _stop_rx) = watch::channel(false);
        Arc::new(Self {
            local: RwLock::new(HashMap::new()),
            remote: RwLock::new(HashMap::new()),
            dispatch_permits: Semaphore::new(config.dispatch_queue_capacity),
            config,
            sink,
            stop: stop_tx,
        })
    }

    fn stop_receiver(&self) -> watch::Receiver<bool> {
        self.stop.subscribe()
    }

    /// Register a freshly spawned local worker and start forwarding its
    /// events.
    pub async fn register_local_worker(self: &Arc<Self>, handle: Arc<dyn WorkerHandle>) {
        self.register(&self.local, handle).await;
    }

    /// Register an externally authenticated remote worker (§4.8's
    /// `RegisterRemoteWorker`). Its event channel closing deregisters it.
    pub async fn register_remote_worker(self: &Arc<Self>, handle: Arc<dyn WorkerHandle>) {
        self.register(&self.remote, handle).await;
    }

    async fn register(self: &Arc<Self>, pool: &RwLock<HashMap<WorkerId, WorkerSlot>>, handle: Arc<dyn WorkerHandle>) {
        let id = handle.id().clone();
        let public_key = handle
            .public_key()
            .await
            .and_then(|key| PublicKey::from_str(&key).ok());

        if let Some(mut events) = handle.take_events().await {
            let this = self.clone();
            let worker_id = id.clone();
            let is_remote = std::ptr::eq(pool, &self.remote);
            tokio::spawn(async move {
                while let Some(event) = events.recv().await {
                    this.forward_event(&worker_id, event);
                }
                info!(worker_id = %worker_id, "worker event channel closed");
                if is_remote {
                    this.remote.write().await.remove(&worker_id);
                }
            });
        }

        pool.write().await.insert(id, WorkerSlot { handle, public_key });
    }

    fn forward_event(&self, worker_id: &WorkerId, event: WorkerEvent) {
        match &event {
            WorkerEvent::Progress { .. } => self.sink.on_progress(worker_id, &event),
            WorkerEvent::Activity { .. } => self.sink.on_activity(worker_id, &event),
            WorkerEvent::Completed { .. } => self.sink.on_completed(worker_id, &event),
            WorkerEvent::Failed { .. } | WorkerEvent::Cancelled { .. } => self.sink.on_failed(worker_id, &event),
        }
    }

    /// Select an idle worker (local preferred, first-fit) and dispatch to
    /// it, re-encrypting `secrets` for its public key. Blocks (bounded by
    /// the queue's semaphore) until a slot is free or the request is
    /// cancelled.
    pub async fn dispatch(
        &self,
        mut objective: ObjectivePayload,
        secrets_plaintext: &[u8],
        mut cancel: watch::Receiver<bool>,
    ) -> Result<WorkerId> {
        let _permit = tokio::select! {
            permit = self.dispatch_permits.acquire() => permit.map_err(|_| Error::internal("dispatch semaphore closed"))?,
            _ = cancel.changed() => return Err(Error::cancelled("dispatch cancelled while queued")),
        };

        loop {
            if *cancel.borrow() {
                return Err(Error::cancelled("dispatch cancelled while waiting for an idle worker"));
            }
            if let Some((id, public_key)) = self.find_idle_worker().await {
                let sealed = seal(&public_key, secrets_plaintext)?;
                objective.secrets_encrypted = base64::encode(sealed);

                let handle = self.handle_for(&id).await.ok_or_else(|| Error::not_found(format!("worker {id} vanished")))?;
                handle.dispatch(objective).await?;
                return Ok(id);
            }
            tokio::select! {
                _ = tokio::time::sleep(std::time::Duration::from_millis(100)) => {}
                _ = cancel.changed() => return Err(Error::cancelled("dispatch cancelled while waiting for an idle worker")),
            }
        }
    }

    async fn find_idle_worker(&self) -> Option<(WorkerId, PublicKey)> {
        for pool in [&self.local, &self.remote] {
            let guard = pool.read().await;
            for (id, slot) in guard.iter() {
                if slot.handle.status().await.state == HandleState::Idle {
                    if let Some(public_key) = &slot.public_key {
                        return Some((id.clone(), public_key.clone()));
                    }
                }
            }
        }
        None
    }

    async fn handle_for(&self, id: &WorkerId) -> Option<Arc<dyn WorkerHandle>> {
        if let Some(slot) = self.local.read().await.get(id) {
            return Some(slot.handle.clone());
        }
        self.remote.read().await.get(id).map(|slot| slot.handle.clone())
    }

    /// §4.8's `CancelObjective`: find whichever worker currently carries
    /// `objective_id` and send it `cancel`.
    pub async fn cancel_objective(&self, objective_id: &ObjectiveId, reason: Option<String>) -> Result<()> {
        for pool in [&self.local, &self.remote] {
            let guard = pool.read().await;
            for slot in guard.values() {
                let status = slot.handle.status().await;
                if status.objective_id.as_ref() == Some(objective_id) {
                    return slot.handle.cancel(objective_id, reason).await;
                }
            }
        }
        Err(Error::not_found(format!("no worker holds objective {objective_id}")))
    }

    /// Run the health loop: at each tick, local workers in `error` or
    /// `stopped` state, or stalled past `stalled_threshold`, are removed and
    /// (at most one per tick) replaced via `respawn`. Stops when
    /// [`Self::shutdown`] is called.
    pub async fn run_health_loop<F, Fut>(self: Arc<Self>, respawn: F)
    where
        F: Fn(WorkerId) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Option<Arc<dyn WorkerHandle>>> + Send,
    {
        let mut stop = self.stop_receiver();
        let mut ticker = tokio::time::interval(self.config.health_check_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.health_tick(&respawn).await;
                }
                _ = stop.changed() => {
                    if *stop.borrow() {
                        break;
                    }
                }
            }
        }
    }

    async fn health_tick<F, Fut>(&self, respawn: &F)
    where
        F: Fn(WorkerId) -> Fut,
        Fut: std::future::Future<Output = Option<Arc<dyn WorkerHandle>>>,
    {
        let unhealthy = {
            let guard = self.local.read().await;
            let mut unhealthy = Vec::new();
            for (id, slot) in guard.iter() {
                let status = slot.handle.status().await;
                let stalled = slot.handle.is_stalled(self.config.stalled_threshold).await;
                if matches!(status.state, HandleState::Error | HandleState::Stopped) || stalled {
                    unhealthy.push(id.clone());
                }
            }
            unhealthy
        };

        // At most one restart per tick.
        let Some(id) = unhealthy.into_iter().next() else { return };
        warn!(worker_id = %id, "removing unhealthy worker from pool");
        let removed = self.local.write().await.remove(&id);
        if let Some(slot) = removed {
            if let Err(err) = slot.handle.stop().await {
                warn!(worker_id = %id, error = %err, "best-effort stop of unhealthy worker failed");
            }
        }
        if let Some(replacement) = respawn(id.clone()).await {
            self.register_local_worker(replacement).await;
            info!(worker_id = %id, "replacement worker spawned");
        } else {
            warn!(worker_id = %id, "no replacement worker spawned");
        }
    }

    pub fn shutdown(&self) {
        let _ = self.stop.send(true);
    }

    pub async fn worker_count(&self) -> (usize, usize) {
        (self.local.read().await.len(), self.remote.read().await.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::{HandleState, WorkerKind, WorkerStatus};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::sync::mpsc;
    use tokio::sync::Mutex as AsyncMutex;

    struct FakeWorker {
        id: WorkerId,
        state: AsyncMutex<HandleState>,
        public_key: String,
        objective: AsyncMutex<Option<ObjectiveId>>,
        dispatched: AtomicBool,
        events: AsyncMutex<Option<mpsc::Receiver<WorkerEvent>>>,
    }

    impl FakeWorker {
        fn idle(id: &str) -> (Arc<Self>, mpsc::Sender<WorkerEvent>) {
            let (tx, rx) = mpsc::channel(10);
            (
                Arc::new(Self {
                    id: WorkerId::from_string(id.to_string()).unwrap(),
                    state: AsyncMutex::new(HandleState::Idle),
                    public_key: crate::crypto::Identity::generate().public.to_wire_string(),
                    objective: AsyncMutex::new(None),
                    dispatched: AtomicBool::new(false),
                    events: AsyncMutex::new(Some(rx)),
                }),
                tx,
            )
        }
    }

    #[async_trait]
    impl WorkerHandle for FakeWorker {
        fn id(&self) -> &WorkerId {
            &self.id
        }
        fn kind(&self) -> WorkerKind {
            WorkerKind::Local
        }
        async fn dispatch(&self, _objective: ObjectivePayload) -> Result<()> {
            let mut state = self.state.lock().await;
            if *state != HandleState::Idle {
                return Err(Error::state_transition("not idle"));
            }
            *state = HandleState::Running;
            self.dispatched.store(true, Ordering::SeqCst);
            *self.objective.lock().await = Some(ObjectiveId::from_string("obj-1".to_string()).unwrap());
            Ok(())
        }
        async fn status(&self) -> WorkerStatus {
            WorkerStatus {
                state: *self.state.lock().await,
                objective_id: self.objective.lock().await.clone(),
                session_id: None,
                iteration: 0,
                tokens_input: 0,
                tokens_output: 0,
                last_error: None,
            }
        }
        async fn cancel(&self, _objective_id: &ObjectiveId, _reason: Option<String>) -> Result<()> {
            Ok(())
        }
        async fn stop(&self) -> Result<()> {
            *self.state.lock().await = HandleState::Stopped;
            Ok(())
        }
        async fn public_key(&self) -> Option<String> {
            Some(self.public_key.clone())
        }
        async fn is_stalled(&self, _threshold: std::time::Duration) -> bool {
            false
        }
        async fn take_events(&self) -> Option<mpsc::Receiver<WorkerEvent>> {
            self.events.lock().await.take()
        }
    }

    fn objective_payload() -> ObjectivePayload {
        ObjectivePayload {
            objective: serde_json::json!({}),
            project: serde_json::json!({}),
            secrets_encrypted: String::new(),
            sync_config: serde_json::json!({}),
            dispatched_at: chrono::Utc::now(),
            hq_public_key: "hq".to_string(),
        }
    }

    #[tokio::test]
    async fn dispatch_picks_the_idle_worker_and_seals_secrets() {
        let manager = PoolManager::new(PoolConfig::default());
        let (worker, _tx) = FakeWorker::idle("w1");
        manager.register_local_worker(worker.clone()).await;

        let (_cancel_tx, cancel_rx) = watch::channel(false);
        let id = manager.dispatch(objective_payload(), b"secret-token", cancel_rx).await.unwrap();
        assert_eq!(id.as_str(), "w1");
        assert!(worker.dispatched.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn dispatch_fails_with_no_idle_worker_when_cancelled() {
        let manager = PoolManager::new(PoolConfig::default());
        let (cancel_tx, cancel_rx) = watch::channel(false);
        cancel_tx.send(true).unwrap();
        let result = manager.dispatch(objective_payload(), b"secret", cancel_rx).await;
        assert!(matches!(result, Err(Error::Cancelled(_))));
    }

    #[tokio::test]
    async fn cancel_objective_finds_the_carrying_worker() {
        let manager = PoolManager::new(PoolConfig::default());
        let (worker, _tx) = FakeWorker::idle("w1");
        manager.register_local_worker(worker.clone()).await;
        let (_cancel_tx, cancel_rx) = watch::channel(false);
        manager.dispatch(objective_payload(), b"secret", cancel_rx).await.unwrap();

        let objective_id = ObjectiveId::from_string("obj-1".to_string()).unwrap();
        manager.cancel_objective(&objective_id, None).await.unwrap();
    }

    #[tokio::test]
    async fn cancel_objective_not_found_is_a_typed_error() {
        let manager = PoolManager::new(PoolConfig::default());
        let objective_id = ObjectiveId::from_string("obj-404".to_string()).unwrap();
        let result = manager.cancel_objective(&objective_id, None).await;
        assert!(matches!(result, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn worker_count_reflects_registrations() {
        let manager = PoolManager::new(PoolConfig::default());
        let (worker, _tx) = FakeWorker::idle("w1");
        manager.register_local_worker(worker).await;
        assert_eq!(manager.worker_count().await, (1, 0));
    }
}
