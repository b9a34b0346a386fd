//! The Ralph execution loop (§2 "C6", §4.6): the bounded, multi-phase,
//! tool-calling loop a worker runs for one session.
//!
//! Grounded on the teacher's `kernel::orchestrator::Orchestrator` for the
//! instruction/routing shape (decide what happens next, act, repeat) and on
//! its bounds-checking step (`check_bounds`) for the budget check here.

use crate::protocol::{Conn, Payload};
use crate::ralph::chat_client::{ChatClient, ContentBlock, Message, Role};
use crate::ralph::checkpoint::CompletionReport;
use crate::ralph::hat::target_hat;
use crate::ralph::prompt::PromptAssembler;
use crate::ralph::session::Session;
use crate::ralph::signals::{parse_signals, Signal};
use crate::recorder::Recorder;
use crate::store::{Objective, Store};
use crate::tools::catalog::ToolCatalog;
use crate::tools::executor::{ExecutionContext, Executor};
use crate::types::{Error, Result};
use serde_json::json;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::watch;
use tracing::{info, warn};

/// Out-of-scope per the spec: project hints loading. Only the rendering
/// contract matters — a loader may fold extra context into the system
/// prompt, or return nothing.
pub trait ProjectHintsLoader: Send + Sync {
    fn hints(&self) -> Option<String>;
}

/// The default loader, used whenever no hints source is configured.
#[derive(Debug, Clone, Default)]
pub struct NoProjectHints;

impl ProjectHintsLoader for NoProjectHints {
    fn hints(&self) -> Option<String> {
        None
    }
}

/// Everything the loop needs beyond the session and objective it's running:
/// all shared, all swappable at the construction boundary.
pub struct RalphContext<R, W> {
    pub chat_client: Option<Arc<dyn ChatClient>>,
    pub prompt_assembler: Arc<dyn PromptAssembler>,
    pub project_hints: Arc<dyn ProjectHintsLoader>,
    pub executor: Arc<Executor>,
    pub catalog: Arc<ToolCatalog>,
    pub recorder: Arc<Recorder<R, W>>,
    pub conn: Option<Arc<Conn<R, W>>>,
    pub store: Arc<Store>,
    pub checkpoint_interval: u32,
}

pub struct RalphLoop<R, W> {
    ctx: RalphContext<R, W>,
    session: Session,
    objective: Objective,
    conversation: Vec<Message>,
}

impl<R, W> RalphLoop<R, W>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    /// Start a fresh session: seeds the conversation with the initial task
    /// prompt (checklist-bearing if the objective has one, free-form
    /// otherwise) and records it as the first activity event.
    pub fn new(ctx: RalphContext<R, W>, session: Session, objective: Objective) -> Self {
        let initial = ctx.prompt_assembler.initial_task_prompt(&objective);
        let conversation = vec![Message::user_text(initial)];
        Self {
            ctx,
            session,
            objective,
            conversation,
        }
    }

    /// Resume from a checkpoint: the conversation is exactly what was
    /// persisted, with no re-seeding.
    pub fn resume(ctx: RalphContext<R, W>, session: Session, objective: Objective, conversation: Vec<Message>) -> Self {
        Self {
            ctx,
            session,
            objective,
            conversation,
        }
    }

    fn allowed_tool_ids(&self) -> Vec<String> {
        crate::tools::profiles::resolve_tools(&self.ctx.catalog, self.session.hat.as_str())
    }

    fn tool_entries(&self, ids: &[String]) -> Vec<crate::tools::catalog::ToolEntry> {
        ids.iter()
            .filter_map(|id| self.ctx.catalog.get(id).cloned())
            .collect()
    }

    async fn record_activity(&self, event_type: &str, content: serde_json::Value, tokens_input: u64, tokens_output: u64) {
        if let Err(err) = self
            .ctx
            .recorder
            .record(
                &self.session.session_id,
                &self.session.objective_id,
                self.session.iteration_count,
                event_type,
                content,
                tokens_input,
                tokens_output,
                Some(self.session.hat.as_str().to_string()),
            )
            .await
        {
            warn!(error = %err, event_type, "failed to record activity");
        }
    }

    async fn send_progress(&self, status: Option<&str>) {
        let Some(conn) = &self.ctx.conn else { return };
        let payload = Payload::Progress {
            objective_id: self.session.objective_id.clone(),
            session_id: self.session.session_id.clone(),
            iteration: self.session.iteration_count,
            tokens_input: self.session.input_tokens,
            tokens_output: self.session.output_tokens,
            hat: Some(self.session.hat.as_str().to_string()),
            status: status.map(|s| s.to_string()),
        };
        if let Err(err) = conn.send(payload).await {
            warn!(error = %err, "failed to send progress message");
        }
    }

    async fn checkpoint(&self, status: &str) {
        let conversation_json = match serde_json::to_string(&self.conversation) {
            Ok(json) => json,
            Err(err) => {
                warn!(error = %err, "failed to serialize conversation for checkpoint");
                return;
            }
        };
        let row = match self.session.to_checkpoint(conversation_json, status) {
            Ok(row) => row,
            Err(err) => {
                warn!(error = %err, "failed to build checkpoint row");
                return;
            }
        };
        if let Err(err) = self.ctx.store.save_session_state(&row).await {
            warn!(error = %err, "failed to persist checkpoint");
        }
    }

    async fn finish(mut self, status: &str, summary: impl Into<String>) -> CompletionReport {
        self.checkpoint(status).await;
        if let Err(err) = self.ctx.store.mark_session_complete(self.session.session_id.as_str(), status).await {
            warn!(error = %err, "failed to mark session complete in the store");
        }
        let summary = summary.into();
        self.record_activity(
            "session_finished",
            json!({ "status": status, "summary": summary }),
            0,
            0,
        )
        .await;
        self.send_progress(Some(status)).await;
        CompletionReport::new(&self.session, status, summary)
    }

    /// Apply every checklist/scratchpad signal found in a response,
    /// regardless of whether that response also used a tool.
    fn apply_non_terminal_signals(&mut self, signals: &[Signal]) {
        for signal in signals {
            match signal {
                Signal::ChecklistDone(id) => self.session.mark_checklist_done(id),
                Signal::ChecklistFailed(id, _reason) => self.session.mark_checklist_failed(id),
                Signal::Scratchpad(content) => self.session.set_scratchpad(content.clone()),
                Signal::Event(_) => {}
            }
        }
    }

    /// Run the full 9-step loop to completion. The only `Err` path is a
    /// startup-time misconfiguration (no chat client); every other terminal
    /// condition — completion, cancellation, a budget, a loop limit, or an
    /// LLM call failure — produces an `Ok(CompletionReport)` whose `status`
    /// field says which.
    pub async fn run(mut self, mut cancel: watch::Receiver<bool>) -> Result<CompletionReport> {
        let Some(chat_client) = self.ctx.chat_client.clone() else {
            return Err(Error::misconfiguration("no chat client configured"));
        };

        loop {
            // 1. cancellation check
            if *cancel.borrow() {
                return Ok(self.finish("cancelled", "session cancelled").await);
            }

            // 2. budget check
            if let Some(kind) = self.session.budget_exceeded() {
                let status = Error::budget_exceeded(kind).report_status();
                return Ok(self.finish(status, format!("{kind}")).await);
            }

            // 3. LLM call
            let tool_ids = self.allowed_tool_ids();
            let tools = self.tool_entries(&tool_ids);
            let mut system_prompt = self.ctx.prompt_assembler.system_prompt(self.session.hat, &self.objective);
            if let Some(hints) = self.ctx.project_hints.hints() {
                system_prompt.push_str("\n\nproject hints:\n");
                system_prompt.push_str(&hints);
            }

            let response = match chat_client.send(&system_prompt, &self.conversation, &tools).await {
                Ok(response) => response,
                Err(err) => {
                    return Ok(self.finish("failed", format!("llm call failed: {err}")).await);
                }
            };

            let assistant_message = Message {
                role: Role::Assistant,
                content: response.content.clone(),
            };
            let response_text = assistant_message.text();
            let tool_uses: Vec<(String, String, serde_json::Value)> = assistant_message
                .tool_uses()
                .into_iter()
                .map(|(id, name, input)| (id.to_string(), name.to_string(), input.clone()))
                .collect();
            self.conversation.push(assistant_message);

            // 4. accounting
            self.session.record_iteration(response.input_tokens, response.output_tokens);
            self.record_activity(
                "assistant_response",
                serde_json::Value::String(response_text.clone()),
                response.input_tokens,
                response.output_tokens,
            )
            .await;
            self.send_progress(None).await;

            // 5. checkpoint every N iterations
            if self.ctx.checkpoint_interval > 0 && self.session.iteration_count % self.ctx.checkpoint_interval == 0 {
                self.checkpoint("running").await;
            }

            let signals = parse_signals(&response_text);
            self.apply_non_terminal_signals(&signals);

            // 6. tool-use branch
            if !tool_uses.is_empty() {
                let mut results = Vec::with_capacity(tool_uses.len());
                for (call_id, name, input) in tool_uses {
                    let exec_ctx = ExecutionContext {
                        session_id: self.session.session_id.clone(),
                        work_dir: self.session.work_dir.clone(),
                        allowed_tools: tool_ids.clone(),
                        read_only: false,
                    };
                    let result = self.ctx.executor.execute(&exec_ctx, &name, input.clone()).await;
                    if name == "github_create_pr" && !result.is_error {
                        self.session.pr_url = Some(result.output.clone());
                    }
                    self.record_activity(
                        "tool_call",
                        json!({ "tool": name, "input": input, "is_error": result.is_error }),
                        0,
                        0,
                    )
                    .await;
                    results.push(ContentBlock::ToolResult {
                        tool_use_id: call_id,
                        content: result.output,
                        is_error: result.is_error,
                    });
                }
                self.conversation.push(Message::user_tool_results(results));
                continue;
            }

            // 7. completion detection
            let completed = signals
                .iter()
                .any(|signal| matches!(signal, Signal::Event(event) if event == "task.complete"));
            if completed {
                return Ok(self.finish("completed", "task marked complete").await);
            }

            // 8. hat-transition detection, with loop-limit enforcement
            let transition_event = signals.iter().find_map(|signal| match signal {
                Signal::Event(event) => target_hat(event).map(|hat| (event.clone(), hat)),
                _ => None,
            });
            if let Some((event, target)) = transition_event {
                match self.session.transition_to(target, &event) {
                    Ok(()) => {
                        info!(from = %self.session.previous_hat.unwrap(), to = %target, event = %event, "hat transition");
                        let handoff = self
                            .ctx
                            .prompt_assembler
                            .handoff_prompt(self.session.previous_hat.unwrap(), &event, &self.session.scratchpad);
                        self.conversation.push(Message::user_text(handoff));
                        continue;
                    }
                    Err(err) => {
                        let status = err.report_status();
                        return Ok(self.finish(status, err.to_string()).await);
                    }
                }
            }

            // 9. continuation
            let continuation = self.ctx.prompt_assembler.continuation_prompt(self.session.hat);
            self.conversation.push(Message::user_text(continuation));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ralph::chat_client::ChatResponse;
    use crate::ralph::hat::Hat;
    use crate::ralph::prompt::DefaultPromptAssembler;
    use crate::tools::spill::{SpillConfig, SpillManager};
    use async_trait::async_trait;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tempfile::tempdir;
    use tokio::sync::Mutex as AsyncMutex;

    struct ScriptedChatClient {
        responses: AsyncMutex<Vec<ChatResponse>>,
        calls: AtomicUsize,
    }

    impl ScriptedChatClient {
        fn new(responses: Vec<ChatResponse>) -> Self {
            Self {
                responses: AsyncMutex::new(responses),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl ChatClient for ScriptedChatClient {
        async fn send(
            &self,
            _system_prompt: &str,
            _messages: &[Message],
            _tools: &[crate::tools::catalog::ToolEntry],
        ) -> Result<ChatResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut responses = self.responses.lock().await;
            if responses.is_empty() {
                return Ok(ChatResponse {
                    content: vec![ContentBlock::Text {
                        text: "EVENT:task.complete".to_string(),
                    }],
                    input_tokens: 1,
                    output_tokens: 1,
                });
            }
            Ok(responses.remove(0))
        }
    }

    fn text_response(text: &str) -> ChatResponse {
        ChatResponse {
            content: vec![ContentBlock::Text { text: text.to_string() }],
            input_tokens: 10,
            output_tokens: 5,
        }
    }

    fn objective() -> Objective {
        Objective {
            id: "obj-1".to_string(),
            title: "t".to_string(),
            description: "d".to_string(),
            hat: "explorer".to_string(),
            base_branch: "main".to_string(),
            token_budget: 0,
            checklist: vec![],
        }
    }

    async fn build_ctx(
        chat_client: Option<Arc<dyn ChatClient>>,
    ) -> (RalphContext<tokio::io::DuplexStream, tokio::io::DuplexStream>, tempfile::TempDir) {
        let store = Arc::new(Store::open_memory(None).await.unwrap());
        let catalog = Arc::new(ToolCatalog::with_fixed_catalog());
        let spill_dir = tempdir().unwrap();
        let executor = Arc::new(Executor::new(
            catalog.clone(),
            SpillManager::new(spill_dir.path(), SpillConfig { threshold_chars: 200_000, preview_chars: 1000 }),
            Duration::from_secs(5),
        ));
        let recorder = Arc::new(Recorder::new(store.clone(), None));
        let ctx = RalphContext {
            chat_client,
            prompt_assembler: Arc::new(DefaultPromptAssembler),
            project_hints: Arc::new(NoProjectHints),
            executor,
            catalog,
            recorder,
            conn: None,
            store,
            checkpoint_interval: 5,
        };
        (ctx, spill_dir)
    }

    async fn seed_session(ctx: &RalphContext<tokio::io::DuplexStream, tokio::io::DuplexStream>, objective: &Objective) -> Session {
        ctx.store
            .store_objective(&crate::store::Objective {
                id: objective.id.clone(),
                title: objective.title.clone(),
                description: objective.description.clone(),
                hat: objective.hat.clone(),
                base_branch: objective.base_branch.clone(),
                token_budget: objective.token_budget,
                checklist: objective.checklist.clone(),
            })
            .await
            .unwrap();
        let session = Session::new(
            crate::types::SessionId::new(),
            crate::types::ObjectiveId::from_string(objective.id.clone()).unwrap(),
            PathBuf::from("/tmp"),
            Hat::Explorer,
            0,
            0,
            Duration::ZERO,
        );
        ctx.store
            .create_session(session.session_id.as_str(), objective.id.as_str(), "explorer")
            .await
            .unwrap();
        session
    }

    #[tokio::test]
    async fn missing_chat_client_is_a_misconfiguration_error() {
        let (ctx, _dir) = build_ctx(None).await;
        let objective = objective();
        let session = seed_session(&ctx, &objective).await;
        let ralph = RalphLoop::new(ctx, session, objective);
        let (_tx, rx) = watch::channel(false);
        let result = ralph.run(rx).await;
        assert!(matches!(result, Err(Error::Misconfiguration(_))));
    }

    #[tokio::test]
    async fn immediate_completion_signal_ends_the_loop() {
        let client: Arc<dyn ChatClient> = Arc::new(ScriptedChatClient::new(vec![text_response("EVENT:task.complete")]));
        let (ctx, _dir) = build_ctx(Some(client)).await;
        let objective = objective();
        let session = seed_session(&ctx, &objective).await;
        let ralph = RalphLoop::new(ctx, session, objective);
        let (_tx, rx) = watch::channel(false);
        let report = ralph.run(rx).await.unwrap();
        assert_eq!(report.status, "completed");
        assert_eq!(report.iterations, 1);
    }

    #[tokio::test]
    async fn cancellation_is_observed_before_the_first_llm_call() {
        let client: Arc<dyn ChatClient> = Arc::new(ScriptedChatClient::new(vec![]));
        let (ctx, _dir) = build_ctx(Some(client)).await;
        let objective = objective();
        let session = seed_session(&ctx, &objective).await;
        let ralph = RalphLoop::new(ctx, session, objective);
        let (tx, rx) = watch::channel(false);
        tx.send(true).unwrap();
        let report = ralph.run(rx).await.unwrap();
        assert_eq!(report.status, "cancelled");
    }

    #[tokio::test]
    async fn zero_iteration_budget_trips_immediately() {
        let client: Arc<dyn ChatClient> = Arc::new(ScriptedChatClient::new(vec![]));
        let (ctx, _dir) = build_ctx(Some(client)).await;
        let objective = objective();
        let mut session = seed_session(&ctx, &objective).await;
        session.max_iterations = 1;
        session.iteration_count = 1;
        let ralph = RalphLoop::new(ctx, session, objective);
        let (_tx, rx) = watch::channel(false);
        let report = ralph.run(rx).await.unwrap();
        assert_eq!(report.status, "budget_exceeded");
    }

    #[tokio::test]
    async fn hat_transition_event_advances_the_session() {
        let client: Arc<dyn ChatClient> = Arc::new(ScriptedChatClient::new(vec![
            text_response("EVENT:plan.complete"),
            text_response("EVENT:task.complete"),
        ]));
        let (ctx, _dir) = build_ctx(Some(client)).await;
        let objective = objective();
        let session = seed_session(&ctx, &objective).await;
        let ralph = RalphLoop::new(ctx, session, objective);
        let (_tx, rx) = watch::channel(false);
        let report = ralph.run(rx).await.unwrap();
        assert_eq!(report.status, "completed");
        assert_eq!(report.iterations, 2);
    }

    #[tokio::test]
    async fn llm_call_failure_produces_a_failed_report() {
        struct FailingChatClient;
        #[async_trait]
        impl ChatClient for FailingChatClient {
            async fn send(
                &self,
                _system_prompt: &str,
                _messages: &[Message],
                _tools: &[crate::tools::catalog::ToolEntry],
            ) -> Result<ChatResponse> {
                Err(Error::internal("provider unreachable"))
            }
        }
        let client: Arc<dyn ChatClient> = Arc::new(FailingChatClient);
        let (ctx, _dir) = build_ctx(Some(client)).await;
        let objective = objective();
        let session = seed_session(&ctx, &objective).await;
        let ralph = RalphLoop::new(ctx, session, objective);
        let (_tx, rx) = watch::channel(false);
        let report = ralph.run(rx).await.unwrap();
        assert_eq!(report.status, "failed");
    }
}
