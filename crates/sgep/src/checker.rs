//! Checker-tool invocation.
//!
//! A check action runs as a subprocess with `--checker-invocation` and
//! `--checker-invocation-result` pointing at temp files. The invocation
//! carries the triggered files, directory, and CL description; the result
//! carries per-check outcomes and optional fix commands. A checker that
//! exits non-zero without writing a result gets one synthesized from its
//! captured output.

use serde::{Deserialize, Serialize};
use sge_core::ChangedFile;
use sgeb::invocation::InvocationError;
use sgeb::process::{self, LogSink, ProcessError};
use sgeb::results::{BuildResult, CheckResult, NamedLog};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

pub const CHECKER_INVOCATION_FLAG: &str = "--checker-invocation";
pub const CHECKER_INVOCATION_RESULT_FLAG: &str = "--checker-invocation-result";

#[derive(Debug, Error)]
pub enum CheckerError {
    #[error(transparent)]
    Process(#[from] ProcessError),
    #[error(transparent)]
    Invocation(#[from] InvocationError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, CheckerError>;

/// One check the tool should run, with the files that triggered it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggeredCheck {
    pub check: String,
    /// Root-relative directory of the policy that declared the check.
    pub dir: String,
    pub files: Vec<ChangedFile>,
}

/// The descriptor written for the checker tool.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckerInvocation {
    pub triggered_checks: Vec<TriggeredCheck>,
    #[serde(default)]
    pub cl_description: String,
    #[serde(default)]
    pub log_labels: Vec<String>,
}

/// One check's outcome as reported by the tool.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckerCheckResult {
    pub name: String,
    pub success: bool,
    #[serde(default)]
    pub logs: Vec<String>,
    /// Command line that would fix the findings, when supported.
    #[serde(default)]
    pub fix: Option<String>,
}

/// The result file the tool writes before exiting.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckerInvocationResult {
    pub results: Vec<CheckerCheckResult>,
}

static INVOCATION_COUNTER: AtomicU64 = AtomicU64::new(0);

fn temp_pair() -> (PathBuf, PathBuf) {
    let n = INVOCATION_COUNTER.fetch_add(1, Ordering::Relaxed);
    let stem = format!("sgep-checker-{}-{n}", std::process::id());
    let dir = std::env::temp_dir();
    (
        dir.join(format!("{stem}.json")),
        dir.join(format!("{stem}.result.json")),
    )
}

/// Run a checker binary over one triggered check and lift whatever
/// happened into a `CheckResult`.
pub async fn run_checker(
    name: &str,
    bin: &Path,
    workspace_root: &Path,
    invocation: &CheckerInvocation,
    sink: Arc<dyn LogSink>,
    cancel: &CancellationToken,
) -> Result<CheckResult> {
    let (inv_path, result_path) = temp_pair();
    let data = serde_json::to_vec_pretty(invocation).expect("invocation serializes");
    std::fs::write(&inv_path, data)?;

    let mut cmd = Command::new(bin);
    cmd.current_dir(workspace_root);
    cmd.arg(format!("{CHECKER_INVOCATION_FLAG}={}", inv_path.display()));
    cmd.arg(format!(
        "{CHECKER_INVOCATION_RESULT_FLAG}={}",
        result_path.display()
    ));

    let output = process::run_supervised(cmd, sink, Duration::ZERO, cancel).await?;

    let parsed: Option<CheckerInvocationResult> = match std::fs::read(&result_path) {
        Ok(data) if !data.is_empty() => serde_json::from_slice(&data).ok(),
        _ => None,
    };
    std::fs::remove_file(&inv_path).ok();
    std::fs::remove_file(&result_path).ok();

    let check = match parsed {
        Some(result) => {
            let sub: Vec<BuildResult> = result
                .results
                .iter()
                .map(|r| BuildResult {
                    name: r.name.clone(),
                    success: r.success,
                    cause: None,
                    logs: r
                        .logs
                        .iter()
                        .map(|l| NamedLog::new("log", l.clone()))
                        .collect(),
                    artifacts: Vec::new(),
                })
                .collect();
            let fix = result.results.iter().find_map(|r| r.fix.clone());
            CheckResult {
                name: name.to_string(),
                success: output.success() && sub.iter().all(|r| r.success),
                results: sub,
                logs: Vec::new(),
                fix,
            }
        }
        // No result file: synthesize from the captured output.
        None => CheckResult {
            name: name.to_string(),
            success: output.success(),
            results: vec![BuildResult {
                name: name.to_string(),
                success: output.success(),
                cause: None,
                logs: vec![NamedLog::new("output", output.output.clone())],
                artifacts: Vec::new(),
            }],
            logs: Vec::new(),
            fix: None,
        },
    };
    Ok(check)
}
