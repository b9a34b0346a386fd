//! The worker subprocess binary (§6's subprocess contract): speaks the wire
//! protocol over its own stdio, runs one Ralph session at a time, and
//! checkpoints as it goes.
//!
//! `--mode=subprocess --id=<id> [--data-dir=…] [--hq-public-key=…]`. Emits
//! `ready` on stdout within 30 seconds of being spawned (the parent enforces
//! the deadline; see [`ralph_core::worker::LocalWorkerHandle::spawn`]).
//! Standard error is free for diagnostic logging — the parent captures and
//! prefixes it. Exit code 0 on a clean `shutdown_ack`, non-zero otherwise.

use clap::Parser;
use ralph_core::crypto::{open, Identity, MasterKey};
use ralph_core::protocol::{Conn, Payload};
use ralph_core::ralph::{
    DefaultPromptAssembler, GenAiChatClient, NoProjectHints, RalphContext, RalphLoop,
};
use ralph_core::recorder::Recorder;
use ralph_core::recovery::with_recovery_async;
use ralph_core::store::{Objective, Store};
use ralph_core::tools::catalog::ToolCatalog;
use ralph_core::tools::executor::Executor;
use ralph_core::tools::spill::{SpillConfig, SpillManager};
use ralph_core::types::{Config, Error, ObjectiveId, Result, SessionId, WorkerId};
use ralph_core::ralph::Hat;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{stdin, stdout};
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

/// Default model passed to [`GenAiChatClient`]. Overridable with
/// `RALPH_MODEL` since the right choice is a deployment concern, not a
/// compile-time one.
const DEFAULT_MODEL: &str = "gpt-4.1-mini";

#[derive(Parser, Debug)]
#[command(name = "ralph-worker")]
struct Args {
    /// Only `subprocess` is implemented; reserved for future transports.
    #[arg(long)]
    mode: String,

    #[arg(long)]
    id: String,

    #[arg(long = "data-dir", env = "RALPH_DATA_DIR")]
    data_dir: Option<String>,

    /// HQ's public key, for future authenticated dispatch. Not yet consumed.
    #[arg(long = "hq-public-key")]
    hq_public_key: Option<String>,
}

type StdConn = Conn<tokio::io::Stdin, tokio::io::Stdout>;

#[tokio::main]
async fn main() {
    ralph_core::observability::init_tracing();
    let args = Args::parse();

    if args.mode != "subprocess" {
        error!(mode = %args.mode, "unsupported worker mode");
        std::process::exit(1);
    }

    match run(args).await {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            error!(error = %err, "worker exited with an error");
            std::process::exit(1);
        }
    }
}

async fn run(args: Args) -> Result<i32> {
    let config = Config::default();
    let data_dir = args.data_dir.clone().unwrap_or_else(|| config.worker.data_dir.clone());
    let worker_root = PathBuf::from(&data_dir).join(&args.id);
    tokio::fs::create_dir_all(&worker_root).await?;
    tokio::fs::create_dir_all(worker_root.join("projects")).await?;

    let master_key = load_or_create_master_key(&worker_root.join("master.key")).await?;
    let store = Arc::new(Store::open(worker_root.join("worker.db").to_str().unwrap(), Some(master_key)).await?);

    let identity = Arc::new(Identity::generate());
    let worker_id = WorkerId::from_string(args.id.clone()).map_err(Error::validation)?;
    let conn: Arc<StdConn> = Arc::new(Conn::new(stdin(), stdout()));

    conn.send(Payload::Ready {
        worker_id,
        version: env!("CARGO_PKG_VERSION").to_string(),
        public_key: identity.public.to_wire_string(),
    })
    .await?;

    let recorder = Arc::new(Recorder::new(store.clone(), Some(conn.clone())));
    let (sync_stop_tx, sync_stop_rx) = watch::channel(false);
    let sync_task = tokio::spawn(recorder.clone().run_sync_loop(config.worker.sync_interval, sync_stop_rx));

    let catalog = Arc::new(ToolCatalog::with_fixed_catalog());
    let spill_dir = worker_root.join("spill");
    tokio::fs::create_dir_all(&spill_dir).await?;
    let executor = Arc::new(Executor::new(
        catalog.clone(),
        SpillManager::new(
            &spill_dir,
            SpillConfig {
                threshold_chars: config.tools.spill_threshold_chars,
                preview_chars: config.tools.spill_preview_chars,
            },
        ),
        config.tools.bash_timeout,
    ));

    let model = std::env::var("RALPH_MODEL").unwrap_or_else(|_| DEFAULT_MODEL.to_string());
    let ctx = RalphContext {
        chat_client: Some(Arc::new(GenAiChatClient::new(model))),
        prompt_assembler: Arc::new(DefaultPromptAssembler),
        project_hints: Arc::new(NoProjectHints),
        executor,
        catalog,
        recorder: recorder.clone(),
        conn: Some(conn.clone()),
        store: store.clone(),
        checkpoint_interval: config.worker.checkpoint_interval,
    };

    let exit_code = serve(conn.clone(), ctx, store.clone(), worker_root, &config, identity).await;

    let _ = sync_stop_tx.send(true);
    let _ = sync_task.await;
    Ok(exit_code)
}

async fn load_or_create_master_key(path: &std::path::Path) -> Result<MasterKey> {
    match tokio::fs::read(path).await {
        Ok(bytes) => MasterKey::from_bytes(&bytes),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            let key = MasterKey::generate();
            tokio::fs::write(path, key.to_bytes()).await?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                let mut perms = tokio::fs::metadata(path).await?.permissions();
                perms.set_mode(0o600);
                tokio::fs::set_permissions(path, perms).await?;
            }
            Ok(key)
        }
        Err(err) => Err(Error::from(err)),
    }
}

/// Owns the receive loop: forwards inbound `dispatch`/`cancel`/`shutdown`
/// messages to at most one running session at a time. Returns the process
/// exit code.
async fn serve(
    conn: Arc<StdConn>,
    ctx: RalphContext<tokio::io::Stdin, tokio::io::Stdout>,
    store: Arc<Store>,
    worker_root: PathBuf,
    config: &Config,
    identity: Arc<Identity>,
) -> i32 {
    let (payload_tx, mut payload_rx) = mpsc::channel(32);
    {
        let conn = conn.clone();
        tokio::spawn(async move {
            loop {
                match conn.receive().await {
                    Ok(envelope) => {
                        if payload_tx.send(envelope.payload).await.is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        warn!(error = %err, "connection closed");
                        break;
                    }
                }
            }
        });
    }

    let mut current: Option<(ObjectiveId, SessionId, watch::Sender<bool>)> = None;
    let mut running: Option<tokio::task::JoinHandle<Result<ralph_core::ralph::CompletionReport>>> = None;

    loop {
        tokio::select! {
            payload = payload_rx.recv() => {
                match payload {
                    Some(Payload::Dispatch { objective }) if running.is_none() => {
                        match start_session(&objective, &ctx, &store, &worker_root, config, &identity).await {
                            Ok((objective_id, session_id, cancel_tx, handle)) => {
                                if let Err(err) = conn.send(Payload::Accepted {
                                    objective_id: objective_id.clone(),
                                    session_id: session_id.clone(),
                                }).await {
                                    warn!(error = %err, "failed to send accepted");
                                }
                                current = Some((objective_id, session_id, cancel_tx));
                                running = Some(handle);
                            }
                            Err(err) => {
                                warn!(error = %err, "failed to start dispatched session");
                                let _ = conn.send(Payload::Error {
                                    code: "dispatch_failed".to_string(),
                                    message: err.to_string(),
                                }).await;
                            }
                        }
                    }
                    Some(Payload::Dispatch { .. }) => {
                        let _ = conn.send(Payload::Error {
                            code: "busy".to_string(),
                            message: "worker already runs one session at a time".to_string(),
                        }).await;
                    }
                    Some(Payload::Cancel { objective_id, .. }) => {
                        if let Some((current_id, _, cancel_tx)) = &current {
                            if *current_id == objective_id {
                                let _ = cancel_tx.send(true);
                            }
                        }
                    }
                    Some(Payload::Ping) => {
                        let _ = conn.send(Payload::Pong).await;
                    }
                    Some(Payload::Shutdown) => {
                        if let Some((_, _, cancel_tx)) = &current {
                            let _ = cancel_tx.send(true);
                        }
                        if let Some(handle) = running.take() {
                            let _ = handle.await;
                        }
                        let _ = conn.send(Payload::ShutdownAck).await;
                        return 0;
                    }
                    Some(other) => {
                        info!(message_type = other.type_name(), "ignoring message with no active session");
                    }
                    None => return 1,
                }
            }
            result = async { running.as_mut().unwrap().await }, if running.is_some() => {
                let (objective_id, session_id, _) = current.take().expect("session state set alongside the join handle");
                running = None;
                report_completion(&conn, objective_id, session_id, result).await;
            }
        }
    }
}

async fn start_session(
    objective_payload: &ralph_core::protocol::ObjectivePayload,
    ctx: &RalphContext<tokio::io::Stdin, tokio::io::Stdout>,
    store: &Arc<Store>,
    worker_root: &std::path::Path,
    config: &Config,
    identity: &Identity,
) -> Result<(ObjectiveId, SessionId, watch::Sender<bool>, tokio::task::JoinHandle<Result<ralph_core::ralph::CompletionReport>>)> {
    let sealed = base64::decode(&objective_payload.secrets_encrypted)
        .map_err(|e| Error::crypto(format!("invalid secrets encoding: {e}")))?;
    // Secrets are decrypted but not yet wired into the tool executor or chat
    // client — LLM/GitHub credential plumbing is out of scope here.
    let _secrets_plaintext = open(&identity.secret, &identity.public, &sealed)?;

    let objective: Objective = serde_json::from_value(objective_payload.objective.clone())?;

    let hat = Hat::from_str(&objective.hat).unwrap_or(Hat::Explorer);
    let session_id = SessionId::new();
    let objective_id = ObjectiveId::from_string(objective.id.clone()).map_err(Error::validation)?;
    let work_dir = worker_root.join("projects").join(objective_id.as_str());
    tokio::fs::create_dir_all(&work_dir).await?;

    store.store_objective(&objective).await?;
    store.create_session(session_id.as_str(), objective_id.as_str(), hat.as_str()).await?;

    let session = ralph_core::ralph::Session::new(
        session_id.clone(),
        objective_id.clone(),
        work_dir,
        hat,
        objective.token_budget,
        config.defaults.max_iterations,
        config.defaults.max_runtime,
    );

    let (cancel_tx, cancel_rx) = watch::channel(false);
    let ralph_ctx = clone_context(ctx);
    let ralph_loop = RalphLoop::new(ralph_ctx, session, objective);
    let handle = tokio::spawn(async move {
        with_recovery_async(|| ralph_loop.run(cancel_rx), "ralph_loop").await
    });

    Ok((objective_id, session_id, cancel_tx, handle))
}

/// `RalphContext` doesn't derive `Clone` (its `chat_client` is an
/// `Option<Arc<dyn ChatClient>>`, everything else already `Arc`), so a
/// worker running sessions back-to-back rebuilds it field by field.
fn clone_context(ctx: &RalphContext<tokio::io::Stdin, tokio::io::Stdout>) -> RalphContext<tokio::io::Stdin, tokio::io::Stdout> {
    RalphContext {
        chat_client: ctx.chat_client.clone(),
        prompt_assembler: ctx.prompt_assembler.clone(),
        project_hints: ctx.project_hints.clone(),
        executor: ctx.executor.clone(),
        catalog: ctx.catalog.clone(),
        recorder: ctx.recorder.clone(),
        conn: ctx.conn.clone(),
        store: ctx.store.clone(),
        checkpoint_interval: ctx.checkpoint_interval,
    }
}

async fn report_completion(
    conn: &Arc<StdConn>,
    objective_id: ObjectiveId,
    session_id: SessionId,
    result: std::result::Result<Result<ralph_core::ralph::CompletionReport>, tokio::task::JoinError>,
) {
    let payload = match result {
        Ok(Ok(report)) => match report.status.as_str() {
            "completed" => Payload::Completed { report: report.into_payload() },
            "cancelled" => Payload::Cancelled {
                objective_id,
                session_id,
                error: report.summary,
                iteration: report.iterations,
            },
            _ => Payload::Failed {
                objective_id,
                session_id,
                error: report.summary,
                iteration: report.iterations,
            },
        },
        Ok(Err(err)) => Payload::Failed {
            objective_id,
            session_id,
            error: err.to_string(),
            iteration: 0,
        },
        Err(join_err) => Payload::Failed {
            objective_id,
            session_id,
            error: format!("session task panicked: {join_err}"),
            iteration: 0,
        },
    };
    if let Err(err) = conn.send(payload).await {
        warn!(error = %err, "failed to report session completion");
    }
}
