//! The quality gate (§4.5): `task_complete` triggers `run_tests`,
//! `run_lint`, `run_build`, auto-detected from the project type, unless
//! individually skipped.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

/// Detected project toolchain, used to pick the concrete subcommand for
/// each quality check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Runtime {
    Cargo,
    Node,
    Python,
    Go,
    Unknown,
}

impl Runtime {
    pub fn name(&self) -> &'static str {
        match self {
            Runtime::Cargo => "cargo",
            Runtime::Node => "node",
            Runtime::Python => "python",
            Runtime::Go => "go",
            Runtime::Unknown => "unknown",
        }
    }

    fn test_command(&self) -> Option<(&'static str, &'static [&'static str])> {
        match self {
            Runtime::Cargo => Some(("cargo", &["test"])),
            Runtime::Node => Some(("npm", &["test"])),
            Runtime::Python => Some(("pytest", &[])),
            Runtime::Go => Some(("go", &["test", "./..."])),
            Runtime::Unknown => None,
        }
    }

    fn lint_command(&self) -> Option<(&'static str, &'static [&'static str])> {
        match self {
            Runtime::Cargo => Some(("cargo", &["clippy", "--", "-D", "warnings"])),
            Runtime::Node => Some(("npx", &["eslint", "."])),
            Runtime::Python => Some(("ruff", &["check", "."])),
            Runtime::Go => Some(("go", &["vet", "./..."])),
            Runtime::Unknown => None,
        }
    }

    fn build_command(&self) -> Option<(&'static str, &'static [&'static str])> {
        match self {
            Runtime::Cargo => Some(("cargo", &["build"])),
            Runtime::Node => Some(("npm", &["run", "build"])),
            Runtime::Python => None,
            Runtime::Go => Some(("go", &["build", "./..."])),
            Runtime::Unknown => None,
        }
    }
}

/// Detect the project's runtime from marker files in `work_dir`.
pub fn detect_runtime(work_dir: &Path) -> Runtime {
    if work_dir.join("Cargo.toml").exists() {
        Runtime::Cargo
    } else if work_dir.join("package.json").exists() {
        Runtime::Node
    } else if work_dir.join("go.mod").exists() {
        Runtime::Go
    } else if work_dir.join("pyproject.toml").exists() || work_dir.join("requirements.txt").exists() {
        Runtime::Python
    } else {
        Runtime::Unknown
    }
}

/// The outcome of one quality check.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CheckOutcome {
    Passed,
    Skipped { reason: String },
    Failed { output: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckResult {
    pub name: String,
    pub outcome: CheckOutcome,
}

/// Which checks the caller asked to skip, with a reason recorded in the
/// report for transparency.
#[derive(Debug, Clone, Default)]
pub struct QualityGateSkip {
    pub tests: Option<String>,
    pub lint: Option<String>,
    pub build: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityGateReport {
    pub checks: Vec<CheckResult>,
    pub passed: bool,
}

impl QualityGateReport {
    /// Aggregated failure text for surfacing through `task_complete`.
    pub fn failure_text(&self) -> String {
        self.checks
            .iter()
            .filter_map(|c| match &c.outcome {
                CheckOutcome::Failed { output } => Some(format!("{}:\n{}", c.name, output)),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}

/// Run the quality gate in `work_dir`. Each enabled check gets its own
/// slice of `per_check_timeout` (the bash timeout budget split three ways,
/// rather than one check starving the others).
pub async fn run_quality_gate(
    work_dir: &Path,
    per_check_timeout: Duration,
    skip: &QualityGateSkip,
) -> QualityGateReport {
    let runtime = detect_runtime(work_dir);
    let mut checks = Vec::with_capacity(3);

    checks.push(run_or_skip("run_tests", skip.tests.as_deref(), runtime.test_command(), work_dir, per_check_timeout).await);
    checks.push(run_or_skip("run_lint", skip.lint.as_deref(), runtime.lint_command(), work_dir, per_check_timeout).await);
    checks.push(run_or_skip("run_build", skip.build.as_deref(), runtime.build_command(), work_dir, per_check_timeout).await);

    let passed = checks.iter().all(|c| !matches!(c.outcome, CheckOutcome::Failed { .. }));
    QualityGateReport { checks, passed }
}

async fn run_or_skip(
    name: &str,
    explicit_skip: Option<&str>,
    command: Option<(&'static str, &'static [&'static str])>,
    work_dir: &Path,
    timeout: Duration,
) -> CheckResult {
    if let Some(reason) = explicit_skip {
        return CheckResult {
            name: name.to_string(),
            outcome: CheckOutcome::Skipped { reason: reason.to_string() },
        };
    }
    let Some((program, args)) = command else {
        return CheckResult {
            name: name.to_string(),
            outcome: CheckOutcome::Skipped { reason: "no runtime detected".to_string() },
        };
    };
    CheckResult {
        name: name.to_string(),
        outcome: run_check(program, args, work_dir, timeout).await,
    }
}

async fn run_check(program: &str, args: &[&str], work_dir: &Path, timeout: Duration) -> CheckOutcome {
    let mut command = Command::new(program);
    command
        .args(args)
        .current_dir(work_dir)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let spawned = match command.spawn() {
        Ok(child) => child,
        Err(err) => return CheckOutcome::Failed { output: format!("failed to start {program}: {err}") },
    };

    match tokio::time::timeout(timeout, spawned.wait_with_output()).await {
        Ok(Ok(output)) if output.status.success() => CheckOutcome::Passed,
        Ok(Ok(output)) => CheckOutcome::Failed {
            output: format!(
                "{}\n{}",
                String::from_utf8_lossy(&output.stdout),
                String::from_utf8_lossy(&output.stderr)
            ),
        },
        Ok(Err(err)) => CheckOutcome::Failed { output: format!("process error: {err}") },
        Err(_) => CheckOutcome::Failed { output: format!("timed out after {timeout:?}") },
    }
}
