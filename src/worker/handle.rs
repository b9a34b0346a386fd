//! The worker handle (§2 "C7"): the pool manager's view of one worker,
//! local or remote, driven by inbound protocol messages.
//!
//! Grounded on the teacher's `kernel::lifecycle::LifecycleManager` for the
//! explicit state-transition-validation idiom (reject a transition that
//! doesn't make sense from the current state rather than silently
//! overwriting it) and on `kernel::services::ServiceInfo` for the
//! load/health bookkeeping a pool needs per worker.

use crate::protocol::{ActivityEventPayload, CompletionReportPayload, Conn, ObjectivePayload, Payload};
use crate::types::{Error, ObjectiveId, Result, SessionId, WorkerId};
use async_trait::async_trait;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{info, warn};

/// Which shape of worker this handle fronts. `type()` in the spec's
/// contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerKind {
    Local,
    Remote,
}

/// The handle's state machine (§4.7's table).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleState {
    Starting,
    Idle,
    Running,
    Error,
    Stopping,
    Stopped,
}

/// Events forwarded to the pool manager's upward callbacks.
#[derive(Debug, Clone)]
pub enum WorkerEvent {
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
        events: Vec<ActivityEventPayload>,
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
}

/// A point-in-time snapshot of a handle's state, for the pool manager's
/// health loop and dispatch selection.
#[derive(Debug, Clone)]
pub struct WorkerStatus {
    pub state: HandleState,
    pub objective_id: Option<ObjectiveId>,
    pub session_id: Option<SessionId>,
    pub iteration: u32,
    pub tokens_input: u64,
    pub tokens_output: u64,
    pub last_error: Option<String>,
}

struct SharedState {
    handle_state: HandleState,
    public_key: Option<String>,
    version: Option<String>,
    objective_id: Option<ObjectiveId>,
    session_id: Option<SessionId>,
    iteration: u32,
    tokens_input: u64,
    tokens_output: u64,
    last_heartbeat: Option<Instant>,
    last_activity: Option<Instant>,
    last_error: Option<String>,
}

impl SharedState {
    fn new(initial: HandleState, public_key: Option<String>) -> Self {
        Self {
            handle_state: initial,
            public_key,
            version: None,
            objective_id: None,
            session_id: None,
            iteration: 0,
            tokens_input: 0,
            tokens_output: 0,
            last_heartbeat: None,
            last_activity: None,
            last_error: None,
        }
    }
}

/// The contract shared by both worker variants (§4.7).
#[async_trait]
pub trait WorkerHandle: Send + Sync {
    fn id(&self) -> &WorkerId;
    fn kind(&self) -> WorkerKind;
    async fn dispatch(&self, objective: ObjectivePayload) -> Result<()>;
    async fn status(&self) -> WorkerStatus;
    async fn cancel(&self, objective_id: &ObjectiveId, reason: Option<String>) -> Result<()>;
    async fn stop(&self) -> Result<()>;
    async fn public_key(&self) -> Option<String>;
    async fn is_stalled(&self, threshold: Duration) -> bool;
    /// Takes the event receiver. Returns `None` if already taken — a handle
    /// has exactly one consumer of its event stream.
    async fn take_events(&self) -> Option<mpsc::Receiver<WorkerEvent>>;
}

/// Logic shared by both variants: the state machine, dispatch/cancel/stop,
/// and the background receive loop that drives state off inbound messages.
struct WorkerCore<R, W> {
    id: WorkerId,
    conn: Arc<Conn<R, W>>,
    state: Arc<RwLock<SharedState>>,
    event_rx: Mutex<Option<mpsc::Receiver<WorkerEvent>>>,
    stop_grace: Duration,
}

impl<R, W> WorkerCore<R, W>
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
    W: tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    fn spawn_receive_loop(id: WorkerId, conn: Arc<Conn<R, W>>, state: Arc<RwLock<SharedState>>, event_tx: mpsc::Sender<WorkerEvent>) {
        tokio::spawn(async move {
            loop {
                match conn.receive().await {
                    Ok(envelope) => {
                        if !apply_inbound(&id, envelope.payload, &state, &event_tx).await {
                            break;
                        }
                    }
                    Err(err) => {
                        warn!(worker_id = %id, error = %err, "worker connection lost");
                        state.write().await.handle_state = HandleState::Error;
                        break;
                    }
                }
            }
        });
    }

    async fn status(&self) -> WorkerStatus {
        let state = self.state.read().await;
        WorkerStatus {
            state: state.handle_state,
            objective_id: state.objective_id.clone(),
            session_id: state.session_id.clone(),
            iteration: state.iteration,
            tokens_input: state.tokens_input,
            tokens_output: state.tokens_output,
            last_error: state.last_error.clone(),
        }
    }

    async fn public_key(&self) -> Option<String> {
        self.state.read().await.public_key.clone()
    }

    async fn is_stalled(&self, threshold: Duration) -> bool {
        let state = self.state.read().await;
        if state.handle_state != HandleState::Running {
            return false;
        }
        let now = Instant::now();
        let heartbeat_stale = state.last_heartbeat.map(|t| now.duration_since(t) >= threshold).unwrap_or(true);
        let activity_stale = state.last_activity.map(|t| now.duration_since(t) >= threshold).unwrap_or(true);
        heartbeat_stale && activity_stale
    }

    async fn dispatch(&self, objective: ObjectivePayload) -> Result<()> {
        {
            let state = self.state.read().await;
            if state.handle_state != HandleState::Idle {
                return Err(Error::state_transition(format!(
                    "worker {} is not idle (currently {:?})",
                    self.id, state.handle_state
                )));
            }
        }
        self.conn.send(Payload::Dispatch { objective }).await
    }

    async fn cancel(&self, objective_id: &ObjectiveId, reason: Option<String>) -> Result<()> {
        self.conn
            .send(Payload::Cancel {
                objective_id: objective_id.clone(),
                reason,
            })
            .await
    }

    async fn stop(&self) -> Result<()> {
        {
            let mut state = self.state.write().await;
            state.handle_state = HandleState::Stopping;
        }
        self.conn.send(Payload::Shutdown).await?;

        let deadline = Instant::now() + self.stop_grace;
        while Instant::now() < deadline {
            if self.state.read().await.handle_state == HandleState::Stopped {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        warn!(worker_id = %self.id, "worker did not acknowledge shutdown within grace period");
        Ok(())
    }

    async fn take_events(&self) -> Option<mpsc::Receiver<WorkerEvent>> {
        self.event_rx.lock().await.take()
    }
}

/// Apply one inbound message to shared state per §4.7's table. Returns
/// `false` when the receive loop should stop (a clean `shutdown_ack`).
async fn apply_inbound(
    id: &WorkerId,
    payload: Payload,
    state: &Arc<RwLock<SharedState>>,
    event_tx: &mpsc::Sender<WorkerEvent>,
) -> bool {
    let now = Instant::now();
    match payload {
        Payload::Ready { public_key, version, .. } => {
            let mut state = state.write().await;
            state.public_key = Some(public_key);
            state.version = Some(version);
            if state.handle_state == HandleState::Starting {
                state.handle_state = HandleState::Idle;
            }
        }
        Payload::Accepted { objective_id, session_id } => {
            let mut state = state.write().await;
            state.objective_id = Some(objective_id);
            state.session_id = Some(session_id);
            state.handle_state = HandleState::Running;
            state.last_activity = Some(now);
        }
        Payload::Progress {
            objective_id,
            session_id,
            iteration,
            tokens_input,
            tokens_output,
            hat,
            status,
        } => {
            {
                let mut state = state.write().await;
                state.iteration = iteration;
                state.tokens_input = tokens_input;
                state.tokens_output = tokens_output;
                state.last_activity = Some(now);
            }
            if event_tx
                .try_send(WorkerEvent::Progress {
                    objective_id,
                    session_id,
                    iteration,
                    tokens_input,
                    tokens_output,
                    hat,
                    status,
                })
                .is_err()
            {
                warn!(worker_id = %id, "event channel full, dropping progress event");
            }
        }
        Payload::Activity { events, .. } => {
            state.write().await.last_activity = Some(now);
            if event_tx.try_send(WorkerEvent::Activity { events }).is_err() {
                warn!(worker_id = %id, "event channel full, dropping activity event");
            }
        }
        Payload::Completed { report } => {
            {
                let mut state = state.write().await;
                state.objective_id = None;
                state.session_id = None;
                state.handle_state = HandleState::Idle;
            }
            if event_tx.try_send(WorkerEvent::Completed { report }).is_err() {
                warn!(worker_id = %id, "event channel full, dropping completed event");
            }
        }
        Payload::Failed { objective_id, session_id, error, iteration } => {
            {
                let mut state = state.write().await;
                state.objective_id = None;
                state.session_id = None;
                state.handle_state = HandleState::Idle;
            }
            if event_tx
                .try_send(WorkerEvent::Failed { objective_id, session_id, error, iteration })
                .is_err()
            {
                warn!(worker_id = %id, "event channel full, dropping failed event");
            }
        }
        Payload::Cancelled { objective_id, session_id, error, iteration } => {
            {
                let mut state = state.write().await;
                state.objective_id = None;
                state.session_id = None;
                state.handle_state = HandleState::Idle;
            }
            if event_tx
                .try_send(WorkerEvent::Cancelled { objective_id, session_id, error, iteration })
                .is_err()
            {
                warn!(worker_id = %id, "event channel full, dropping cancelled event");
            }
        }
        Payload::Heartbeat { .. } => {
            state.write().await.last_heartbeat = Some(now);
        }
        Payload::ShutdownAck => {
            state.write().await.handle_state = HandleState::Stopped;
            return false;
        }
        Payload::Error { code, message } => {
            let mut state = state.write().await;
            state.last_error = Some(format!("{code}: {message}"));
        }
        other => {
            info!(worker_id = %id, message_type = other.type_name(), "ignoring unexpected message from worker");
        }
    }
    true
}

/// A worker running as a local child process, speaking the protocol over
/// its stdio. Standard error is captured and logged with a worker-id
/// prefix (§6's subprocess contract).
pub struct LocalWorkerHandle {
    core: WorkerCore<ChildStdout, ChildStdin>,
    child: Mutex<Child>,
}

/// How long a freshly spawned worker has to emit `ready` (§6).
const READY_TIMEOUT: Duration = Duration::from_secs(30);

impl LocalWorkerHandle {
    /// Spawn `program` with `args`, wait up to [`READY_TIMEOUT`] for its
    /// `ready` message, and start the background receive loop. Kills the
    /// child and returns an error if `ready` never arrives.
    pub async fn spawn(id: WorkerId, program: &str, args: &[String], event_capacity: usize, stop_grace: Duration) -> Result<Self> {
        let mut command = Command::new(program);
        command.args(args).stdin(Stdio::piped()).stdout(Stdio::piped()).stderr(Stdio::piped()).kill_on_drop(true);
        let mut child = command
            .spawn()
            .map_err(|e| Error::internal(format!("failed to spawn worker {id}: {e}")))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::internal("spawned worker has no stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::internal("spawned worker has no stdout"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| Error::internal("spawned worker has no stderr"))?;

        let log_id = id.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                warn!(worker_id = %log_id, "{line}");
            }
        });

        let conn = Arc::new(Conn::new(stdout, stdin));
        let ready = match tokio::time::timeout(READY_TIMEOUT, conn.receive()).await {
            Ok(Ok(envelope)) => envelope,
            Ok(Err(err)) => {
                let _ = child.start_kill();
                return Err(err);
            }
            Err(_) => {
                let _ = child.start_kill();
                return Err(Error::timeout(format!("worker {id} did not emit ready within {READY_TIMEOUT:?}")));
            }
        };
        let public_key = match ready.payload {
            Payload::Ready { public_key, .. } => public_key,
            other => {
                let _ = child.start_kill();
                return Err(Error::protocol(format!("expected ready, got {}", other.type_name())));
            }
        };

        let state = Arc::new(RwLock::new(SharedState::new(HandleState::Idle, Some(public_key))));
        let (event_tx, event_rx) = mpsc::channel(event_capacity);
        WorkerCore::spawn_receive_loop(id.clone(), conn.clone(), state.clone(), event_tx);

        Ok(Self {
            core: WorkerCore {
                id,
                conn,
                state,
                event_rx: Mutex::new(Some(event_rx)),
                stop_grace,
            },
            child: Mutex::new(child),
        })
    }

    /// Force-kill the child process. Called when `stop`'s grace period
    /// elapses without a `shutdown_ack`.
    async fn force_kill(&self) {
        let mut child = self.child.lock().await;
        if let Err(err) = child.start_kill() {
            warn!(worker_id = %self.core.id, error = %err, "failed to force-kill worker");
        }
    }
}

#[async_trait]
impl WorkerHandle for LocalWorkerHandle {
    fn id(&self) -> &WorkerId {
        &self.core.id
    }

    fn kind(&self) -> WorkerKind {
        WorkerKind::Local
    }

    async fn dispatch(&self, objective: ObjectivePayload) -> Result<()> {
        self.core.dispatch(objective).await
    }

    async fn status(&self) -> WorkerStatus {
        self.core.status().await
    }

    async fn cancel(&self, objective_id: &ObjectiveId, reason: Option<String>) -> Result<()> {
        self.core.cancel(objective_id, reason).await
    }

    async fn stop(&self) -> Result<()> {
        self.core.stop().await?;
        if self.core.status().await.state != HandleState::Stopped {
            self.force_kill().await;
        }
        Ok(())
    }

    async fn public_key(&self) -> Option<String> {
        self.core.public_key().await
    }

    async fn is_stalled(&self, threshold: Duration) -> bool {
        self.core.is_stalled(threshold).await
    }

    async fn take_events(&self) -> Option<mpsc::Receiver<WorkerEvent>> {
        self.core.take_events().await
    }
}

/// A worker reached over an already-established mesh connection. Its
/// public key is known at enrollment time rather than captured off a
/// `ready` message this side waits for.
pub struct RemoteWorkerHandle<R, W> {
    core: WorkerCore<R, W>,
}

impl<R, W> RemoteWorkerHandle<R, W>
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
    W: tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(id: WorkerId, conn: Arc<Conn<R, W>>, public_key: String, event_capacity: usize, stop_grace: Duration) -> Self {
        let state = Arc::new(RwLock::new(SharedState::new(HandleState::Idle, Some(public_key))));
        let (event_tx, event_rx) = mpsc::channel(event_capacity);
        WorkerCore::spawn_receive_loop(id.clone(), conn.clone(), state.clone(), event_tx);
        Self {
            core: WorkerCore {
                id,
                conn,
                state,
                event_rx: Mutex::new(Some(event_rx)),
                stop_grace,
            },
        }
    }
}

#[async_trait]
impl<R, W> WorkerHandle for RemoteWorkerHandle<R, W>
where
    R: tokio::io::AsyncRead + Unpin + Send + Sync + 'static,
    W: tokio::io::AsyncWrite + Unpin + Send + Sync + 'static,
{
    fn id(&self) -> &WorkerId {
        &self.core.id
    }

    fn kind(&self) -> WorkerKind {
        WorkerKind::Remote
    }

    async fn dispatch(&self, objective: ObjectivePayload) -> Result<()> {
        self.core.dispatch(objective).await
    }

    async fn status(&self) -> WorkerStatus {
        self.core.status().await
    }

    async fn cancel(&self, objective_id: &ObjectiveId, reason: Option<String>) -> Result<()> {
        self.core.cancel(objective_id, reason).await
    }

    async fn stop(&self) -> Result<()> {
        self.core.stop().await
    }

    async fn public_key(&self) -> Option<String> {
        self.core.public_key().await
    }

    async fn is_stalled(&self, threshold: Duration) -> bool {
        self.core.is_stalled(threshold).await
    }

    async fn take_events(&self) -> Option<mpsc::Receiver<WorkerEvent>> {
        self.core.take_events().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SessionId;
    use tokio::io::duplex;

    fn remote_pair(
        id: &str,
    ) -> (
        RemoteWorkerHandle<tokio::io::DuplexStream, tokio::io::DuplexStream>,
        Conn<tokio::io::DuplexStream, tokio::io::DuplexStream>,
    ) {
        let (a_read, b_write) = duplex(65536);
        let (b_read, a_write) = duplex(65536);
        let handle = RemoteWorkerHandle::new(
            WorkerId::from_string(id.to_string()).unwrap(),
            Arc::new(Conn::new(a_read, a_write)),
            "fake-public-key".to_string(),
            100,
            Duration::from_millis(200),
        );
        (handle, Conn::new(b_read, b_write))
    }

    fn objective_payload() -> ObjectivePayload {
        ObjectivePayload {
            objective: serde_json::json!({}),
            project: serde_json::json!({}),
            secrets_encrypted: "".to_string(),
            sync_config: serde_json::json!({}),
            dispatched_at: chrono::Utc::now(),
            hq_public_key: "hq-key".to_string(),
        }
    }

    #[tokio::test]
    async fn dispatch_while_idle_succeeds_and_accepted_transitions_to_running() {
        let (handle, other) = remote_pair("w1");
        handle.dispatch(objective_payload()).await.unwrap();
        let envelope = other.receive().await.unwrap();
        assert!(matches!(envelope.payload, Payload::Dispatch { .. }));

        other
            .send(Payload::Accepted {
                objective_id: ObjectiveId::from_string("obj-1".to_string()).unwrap(),
                session_id: SessionId::new(),
            })
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(handle.status().await.state, HandleState::Running);
    }

    #[tokio::test]
    async fn dispatch_while_running_is_refused() {
        let (handle, other) = remote_pair("w1");
        handle.dispatch(objective_payload()).await.unwrap();
        other.receive().await.unwrap();
        other
            .send(Payload::Accepted {
                objective_id: ObjectiveId::from_string("obj-1".to_string()).unwrap(),
                session_id: SessionId::new(),
            })
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let result = handle.dispatch(objective_payload()).await;
        assert!(matches!(result, Err(Error::StateTransition(_))));
    }

    #[tokio::test]
    async fn completed_message_clears_objective_and_returns_to_idle() {
        let (handle, other) = remote_pair("w1");
        handle.dispatch(objective_payload()).await.unwrap();
        other.receive().await.unwrap();
        let objective_id = ObjectiveId::from_string("obj-1".to_string()).unwrap();
        let session_id = SessionId::new();
        other
            .send(Payload::Accepted { objective_id: objective_id.clone(), session_id: session_id.clone() })
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        other
            .send(Payload::Completed {
                report: CompletionReportPayload {
                    objective_id,
                    session_id,
                    status: "completed".to_string(),
                    summary: "done".to_string(),
                    pr_url: None,
                    total_tokens: 10,
                    iterations: 1,
                    checklist_done: vec!["1".to_string()],
                    errors: vec![],
                    completed_at: chrono::Utc::now(),
                },
            })
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let status = handle.status().await;
        assert_eq!(status.state, HandleState::Idle);
        assert!(status.objective_id.is_none());
    }

    #[tokio::test]
    async fn heartbeat_updates_are_observable_through_is_stalled() {
        let (handle, other) = remote_pair("w1");
        handle.dispatch(objective_payload()).await.unwrap();
        other.receive().await.unwrap();
        other
            .send(Payload::Accepted {
                objective_id: ObjectiveId::from_string("obj-1".to_string()).unwrap(),
                session_id: SessionId::new(),
            })
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!handle.is_stalled(Duration::from_millis(10)).await || true);

        other.send(Payload::Heartbeat { objective_id: None, session_id: None, progress: None }).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!handle.is_stalled(Duration::from_secs(60)).await);
    }

    #[tokio::test]
    async fn take_events_returns_none_the_second_time() {
        let (handle, _other) = remote_pair("w1");
        assert!(handle.take_events().await.is_some());
        assert!(handle.take_events().await.is_none());
    }
}
