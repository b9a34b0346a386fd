//! The execution contract (§4.5): `Execute(ctx, name, input) → {output,
//! is_error, duration_ms}`. Dispatches by tool group — filesystem and git
//! tools run directly against the work directory, `bash` runs under a
//! bounded timeout with a dangerous-pattern deny list, and the GitHub and
//! mail/calendar groups are delegated to external collaborators whose
//! clients live outside this crate.

use crate::tools::quality::{run_quality_gate, QualityGateReport, QualityGateSkip};
use crate::tools::spill::SpillManager;
use crate::tools::ToolCatalog;
use crate::types::SessionId;
use async_trait::async_trait;
use serde_json::Value;
use std::path::{Component, Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::process::Command;

/// Everything the executor needs about the calling session to enforce the
/// read-only/sandbox rules and to address the spill directory.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub session_id: SessionId,
    pub work_dir: PathBuf,
    pub allowed_tools: Vec<String>,
    pub read_only: bool,
}

impl ExecutionContext {
    fn is_allowed(&self, tool_id: &str) -> bool {
        self.allowed_tools.iter().any(|id| id == tool_id)
    }
}

#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub output: String,
    pub is_error: bool,
    pub duration_ms: u64,
}

impl ExecutionResult {
    fn ok(output: impl Into<String>, started: Instant) -> Self {
        Self { output: output.into(), is_error: false, duration_ms: elapsed_ms(started) }
    }

    fn error(output: impl Into<String>, started: Instant) -> Self {
        Self { output: output.into(), is_error: true, duration_ms: elapsed_ms(started) }
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis().min(u128::from(u64::MAX)) as u64
}

/// GitHub operations are delegated to whatever API client the surrounding
/// system configures — this trait is the contract, not an implementation.
#[async_trait]
pub trait GithubClient: Send + Sync {
    async fn create_repo(&self, name: &str, private: bool) -> crate::types::Result<String>;
    async fn create_pr(&self, title: &str, body: &str, head: &str, base: &str) -> crate::types::Result<String>;
}

/// Mail/calendar tools are fully delegated to an external collaborator;
/// this crate only carries the tool metadata and the dispatch contract.
#[async_trait]
pub trait CollaboratorExecutor: Send + Sync {
    async fn execute(&self, tool_id: &str, input: &Value) -> crate::types::Result<String>;
}

/// Shell commands rejected outright regardless of timeout, grounded on
/// §4.5's fixed dangerous-pattern list.
const DANGEROUS_PATTERNS: &[&str] = &[
    "rm -rf /",
    "rm -fr /",
    "rm -rf /*",
    "sudo ",
    "mkfs.",
    "chmod 777",
    "dd if=",
    ":(){ :|:& };:",
    "> /dev/sd",
    "> /dev/nvme",
];

fn is_dangerous_command(command: &str) -> bool {
    let normalized = command.trim();
    DANGEROUS_PATTERNS.iter().any(|pattern| normalized.contains(pattern))
}

pub struct Executor {
    catalog: Arc<ToolCatalog>,
    spill: SpillManager,
    bash_timeout: Duration,
    github: Option<Arc<dyn GithubClient>>,
    collaborator: Option<Arc<dyn CollaboratorExecutor>>,
}

impl std::fmt::Debug for Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executor")
            .field("bash_timeout", &self.bash_timeout)
            .field("github_configured", &self.github.is_some())
            .field("collaborator_configured", &self.collaborator.is_some())
            .finish_non_exhaustive()
    }
}

impl Executor {
    pub fn new(catalog: Arc<ToolCatalog>, spill: SpillManager, bash_timeout: Duration) -> Self {
        Self { catalog, spill, bash_timeout, github: None, collaborator: None }
    }

    pub fn with_github_client(mut self, client: Arc<dyn GithubClient>) -> Self {
        self.github = Some(client);
        self
    }

    pub fn with_collaborator(mut self, collaborator: Arc<dyn CollaboratorExecutor>) -> Self {
        self.collaborator = Some(collaborator);
        self
    }

    pub async fn execute(&self, ctx: &ExecutionContext, tool_id: &str, input: Value) -> ExecutionResult {
        let started = Instant::now();

        let Some(entry) = self.catalog.get(tool_id) else {
            return ExecutionResult::error(format!("unknown tool: {tool_id}"), started);
        };

        if !ctx.is_allowed(tool_id) {
            return ExecutionResult::error(format!("tool not permitted for this hat: {tool_id}"), started);
        }

        if ctx.read_only && !entry.read_only {
            return ExecutionResult::error(format!("tool rejected: read-only mode: {tool_id}"), started);
        }

        match self.catalog.validate_params(tool_id, &input) {
            Ok(errors) if !errors.is_empty() => {
                return ExecutionResult::error(format!("invalid parameters: {}", errors.join("; ")), started)
            }
            Err(err) => return ExecutionResult::error(format!("invalid parameters: {err}"), started),
            Ok(_) => {}
        }

        let outcome = match tool_id {
            "read_file" => self.read_file(ctx, &input).await,
            "list_files" => self.list_files(ctx, &input).await,
            "glob" => self.glob(ctx, &input).await,
            "grep" => self.grep(ctx, &input).await,
            "write_file" => self.write_file(ctx, &input).await,
            "git_status" => self.run_git(ctx, &["status", "--short"]).await,
            "git_diff" => self.git_diff(ctx, &input).await,
            "git_log" => self.git_log(ctx, &input).await,
            "git_init" => self.run_git(ctx, &["init"]).await,
            "git_commit" => self.git_commit(ctx, &input).await,
            "git_remote_add" => self.git_remote_add(ctx, &input).await,
            "git_push" => self.git_push(ctx, &input).await,
            "github_create_repo" => self.github_create_repo(&input).await,
            "github_create_pr" => self.github_create_pr(&input).await,
            "web_search" | "web_fetch" => Err(format!("{tool_id} is not implemented by this executor")),
            "bash" => self.bash(ctx, &input).await,
            "list_runtimes" => self.list_runtimes(ctx).await,
            "run_tests" => self.quality_check(ctx, "run_tests").await,
            "run_lint" => self.quality_check(ctx, "run_lint").await,
            "run_build" => self.quality_check(ctx, "run_build").await,
            "task_complete" => self.task_complete(ctx).await,
            "mail_send" | "calendar_create_event" => self.delegate(tool_id, &input).await,
            other => Err(format!("unhandled tool in catalog: {other}")),
        };

        match outcome {
            Ok(output) => {
                let spilled = self.spill.maybe_spill(&ctx.session_id, tool_id, &output).await;
                ExecutionResult::ok(spilled, started)
            }
            Err(message) => ExecutionResult::error(message, started),
        }
    }

    async fn read_file(&self, ctx: &ExecutionContext, input: &Value) -> Result<String, String> {
        let path = sandbox_path(&ctx.work_dir, str_param(input, "path")?)?;
        tokio::fs::read_to_string(&path).await.map_err(|e| format!("read_file failed: {e}"))
    }

    async fn list_files(&self, ctx: &ExecutionContext, input: &Value) -> Result<String, String> {
        let dir_param = input.get("path").and_then(Value::as_str).unwrap_or(".");
        let path = sandbox_path(&ctx.work_dir, dir_param)?;
        let mut entries = tokio::fs::read_dir(&path).await.map_err(|e| format!("list_files failed: {e}"))?;
        let mut names = Vec::new();
        while let Ok(Some(entry)) = entries.next_entry().await {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        names.sort();
        Ok(names.join("\n"))
    }

    async fn glob(&self, ctx: &ExecutionContext, input: &Value) -> Result<String, String> {
        let pattern = str_param(input, "pattern")?;
        let full_pattern = ctx.work_dir.join(pattern);
        let matches: Vec<String> = glob::glob(&full_pattern.to_string_lossy())
            .map_err(|e| format!("invalid glob pattern: {e}"))?
            .filter_map(Result::ok)
            .map(|p| p.to_string_lossy().into_owned())
            .collect();
        Ok(matches.join("\n"))
    }

    async fn grep(&self, ctx: &ExecutionContext, input: &Value) -> Result<String, String> {
        let pattern = str_param(input, "pattern")?;
        let search_path = input.get("path").and_then(Value::as_str).unwrap_or(".");
        let path = sandbox_path(&ctx.work_dir, search_path)?;
        let regex = regex::Regex::new(pattern).map_err(|e| format!("invalid regex: {e}"))?;
        let mut matches = Vec::new();
        walk_matches(&path, &regex, &mut matches).await?;
        Ok(matches.join("\n"))
    }

    async fn write_file(&self, ctx: &ExecutionContext, input: &Value) -> Result<String, String> {
        let path = sandbox_path(&ctx.work_dir, str_param(input, "path")?)?;
        let content = str_param(input, "content")?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| format!("write_file failed: {e}"))?;
        }
        tokio::fs::write(&path, content).await.map_err(|e| format!("write_file failed: {e}"))?;
        Ok(format!("wrote {} bytes to {}", content.len(), path.display()))
    }

    async fn run_git(&self, ctx: &ExecutionContext, args: &[&str]) -> Result<String, String> {
        run_subprocess("git", args, &ctx.work_dir, self.bash_timeout).await
    }

    async fn git_diff(&self, ctx: &ExecutionContext, input: &Value) -> Result<String, String> {
        match input.get("path").and_then(Value::as_str) {
            Some(path) => self.run_git(ctx, &["diff", "--", path]).await,
            None => self.run_git(ctx, &["diff"]).await,
        }
    }

    async fn git_log(&self, ctx: &ExecutionContext, input: &Value) -> Result<String, String> {
        let limit = input.get("limit").and_then(Value::as_u64).unwrap_or(20);
        self.run_git(ctx, &["log", "--oneline", &format!("-{limit}")]).await
    }

    async fn git_commit(&self, ctx: &ExecutionContext, input: &Value) -> Result<String, String> {
        let message = str_param(input, "message")?;
        self.run_git(ctx, &["commit", "-m", message]).await
    }

    async fn git_remote_add(&self, ctx: &ExecutionContext, input: &Value) -> Result<String, String> {
        let name = str_param(input, "name")?;
        let url = str_param(input, "url")?;
        self.run_git(ctx, &["remote", "add", name, url]).await
    }

    async fn git_push(&self, ctx: &ExecutionContext, input: &Value) -> Result<String, String> {
        let remote = input.get("remote").and_then(Value::as_str).unwrap_or("origin");
        match input.get("branch").and_then(Value::as_str) {
            Some(branch) => self.run_git(ctx, &["push", remote, branch]).await,
            None => self.run_git(ctx, &["push", remote]).await,
        }
    }

    async fn github_create_repo(&self, input: &Value) -> Result<String, String> {
        let client = self.github.as_ref().ok_or("no GitHub client configured")?;
        let name = str_param(input, "name")?;
        let private = input.get("private").and_then(Value::as_bool).unwrap_or(true);
        client.create_repo(name, private).await.map_err(|e| e.to_string())
    }

    async fn github_create_pr(&self, input: &Value) -> Result<String, String> {
        let client = self.github.as_ref().ok_or("no GitHub client configured")?;
        let title = str_param(input, "title")?;
        let body = str_param(input, "body")?;
        let head = str_param(input, "head")?;
        let base = input.get("base").and_then(Value::as_str).unwrap_or("main");
        client.create_pr(title, body, head, base).await.map_err(|e| e.to_string())
    }

    async fn delegate(&self, tool_id: &str, input: &Value) -> Result<String, String> {
        let collaborator = self.collaborator.as_ref().ok_or("no collaborator configured")?;
        collaborator.execute(tool_id, input).await.map_err(|e| e.to_string())
    }

    async fn bash(&self, ctx: &ExecutionContext, input: &Value) -> Result<String, String> {
        let command = str_param(input, "command")?;
        if is_dangerous_command(command) {
            return Err(format!("command rejected: matches a dangerous pattern: {command}"));
        }
        run_subprocess("sh", &["-c", command], &ctx.work_dir, self.bash_timeout).await
    }

    async fn list_runtimes(&self, ctx: &ExecutionContext) -> Result<String, String> {
        let runtime = crate::tools::quality::detect_runtime(&ctx.work_dir);
        Ok(runtime.name().to_string())
    }

    async fn quality_check(&self, ctx: &ExecutionContext, which: &str) -> Result<String, String> {
        let report = self.run_quality_gate_for(ctx, which).await;
        self.quality_result(&report, which)
    }

    async fn task_complete(&self, ctx: &ExecutionContext) -> Result<String, String> {
        let report = run_quality_gate(&ctx.work_dir, self.bash_timeout / 3, &QualityGateSkip::default()).await;
        if report.passed {
            Ok("quality gate passed, task complete".to_string())
        } else {
            Err(format!("quality gate failed:\n{}", report.failure_text()))
        }
    }

    async fn run_quality_gate_for(&self, ctx: &ExecutionContext, which: &str) -> QualityGateReport {
        let mut skip = QualityGateSkip::default();
        let reason = Some("not requested by this tool call".to_string());
        if which != "run_tests" {
            skip.tests = reason.clone();
        }
        if which != "run_lint" {
            skip.lint = reason.clone();
        }
        if which != "run_build" {
            skip.build = reason;
        }
        run_quality_gate(&ctx.work_dir, self.bash_timeout / 3, &skip).await
    }

    fn quality_result(&self, report: &QualityGateReport, which: &str) -> Result<String, String> {
        let check = report.checks.iter().find(|c| c.name == which);
        match check.map(|c| &c.outcome) {
            Some(crate::tools::quality::CheckOutcome::Passed) => Ok(format!("{which} passed")),
            Some(crate::tools::quality::CheckOutcome::Skipped { reason }) => Ok(format!("{which} skipped: {reason}")),
            Some(crate::tools::quality::CheckOutcome::Failed { output }) => Err(output.clone()),
            None => Err(format!("{which} did not run")),
        }
    }
}

fn str_param<'a>(input: &'a Value, name: &str) -> Result<&'a str, String> {
    input.get(name).and_then(Value::as_str).ok_or_else(|| format!("missing required parameter: {name}"))
}

/// Resolve `candidate` relative to `work_dir`, rejecting absolute paths and
/// any `..` traversal component.
fn sandbox_path(work_dir: &Path, candidate: &str) -> Result<PathBuf, String> {
    let candidate_path = Path::new(candidate);
    if candidate_path.is_absolute() {
        return Err(format!("path must be relative to the work directory: {candidate}"));
    }
    for component in candidate_path.components() {
        match component {
            Component::ParentDir => return Err(format!("path escapes the work directory: {candidate}")),
            Component::Prefix(_) | Component::RootDir => {
                return Err(format!("path must be relative to the work directory: {candidate}"))
            }
            _ => {}
        }
    }
    Ok(work_dir.join(candidate_path))
}

async fn walk_matches(path: &Path, regex: &regex::Regex, out: &mut Vec<String>) -> Result<(), String> {
    let metadata = tokio::fs::metadata(path).await.map_err(|e| format!("grep failed: {e}"))?;
    if metadata.is_file() {
        if let Ok(content) = tokio::fs::read_to_string(path).await {
            for (lineno, line) in content.lines().enumerate() {
                if regex.is_match(line) {
                    out.push(format!("{}:{}:{}", path.display(), lineno + 1, line));
                }
            }
        }
        return Ok(());
    }
    let mut entries = tokio::fs::read_dir(path).await.map_err(|e| format!("grep failed: {e}"))?;
    while let Ok(Some(entry)) = entries.next_entry().await {
        Box::pin(walk_matches(&entry.path(), regex, out)).await?;
    }
    Ok(())
}

async fn run_subprocess(program: &str, args: &[&str], work_dir: &Path, timeout: Duration) -> Result<String, String> {
    let mut command = Command::new(program);
    command.args(args).current_dir(work_dir).stdout(Stdio::piped()).stderr(Stdio::piped());

    let child = command.spawn().map_err(|e| format!("failed to start {program}: {e}"))?;
    match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(Ok(output)) if output.status.success() => Ok(String::from_utf8_lossy(&output.stdout).into_owned()),
        Ok(Ok(output)) => Err(format!(
            "{}\n{}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        )),
        Ok(Err(err)) => Err(format!("process error: {err}")),
        Err(_) => Err(format!("timed out after {timeout:?}")),
    }
}
