//! Delegate build-tool invocation.
//!
//! The delegate does the actual compiling; we hand it targets, point it at
//! an event file, and parse that stream afterwards. The delegate exiting
//! non-zero is not an error here: the event stream carries the failure
//! detail and the engine turns it into results.

use crate::config::DelegateConfig;
use crate::events::EventLog;
use crate::process::{self, CapturedOutput, LogSink, ProcessError};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Flag handing the delegate its event-file destination.
pub const EVENT_FILE_FLAG: &str = "--build_event_binary_file";

#[derive(Debug, Error)]
pub enum DelegateError {
    #[error(transparent)]
    Process(#[from] ProcessError),
    #[error("io error on event file {0}: {1}")]
    EventFile(PathBuf, std::io::Error),
}

pub type Result<T> = std::result::Result<T, DelegateError>;

/// What one delegate run produced: the parsed stream plus the raw output.
#[derive(Debug)]
pub struct DelegateRun {
    pub log: EventLog,
    pub output: CapturedOutput,
}

/// A configured delegate, bound to the monorepo root.
#[derive(Debug, Clone)]
pub struct Delegate {
    config: DelegateConfig,
    workspace_root: PathBuf,
}

impl Delegate {
    pub fn new(config: DelegateConfig, workspace_root: &Path) -> Self {
        Self {
            config,
            workspace_root: workspace_root.to_path_buf(),
        }
    }

    /// The argument vector a run would use; presubmit sort keys hang off
    /// its length.
    pub fn args_for(verb: &str, targets: &[String], args: &[String]) -> Vec<String> {
        let mut v = vec![verb.to_string()];
        v.extend(args.iter().cloned());
        v.extend(targets.iter().cloned());
        v
    }

    async fn run(
        &self,
        verb: &str,
        targets: &[String],
        args: &[String],
        event_file: &Path,
        sink: Arc<dyn LogSink>,
        cancel: &CancellationToken,
    ) -> Result<DelegateRun> {
        let mut cmd = Command::new(&self.config.command);
        cmd.current_dir(&self.workspace_root);
        cmd.arg(verb);
        cmd.arg(format!("{EVENT_FILE_FLAG}={}", event_file.display()));
        cmd.args(&self.config.extra_args);
        cmd.args(args);
        cmd.args(targets);

        debug!(verb, targets = ?targets, "invoking delegate");
        let output = process::run_supervised(cmd, sink, Duration::ZERO, cancel).await?;

        let log = match std::fs::read(event_file) {
            Ok(data) => EventLog::parse(&data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => EventLog::default(),
            Err(e) => return Err(DelegateError::EventFile(event_file.to_path_buf(), e)),
        };
        Ok(DelegateRun { log, output })
    }

    pub async fn build(
        &self,
        targets: &[String],
        args: &[String],
        event_file: &Path,
        sink: Arc<dyn LogSink>,
        cancel: &CancellationToken,
    ) -> Result<DelegateRun> {
        self.run("build", targets, args, event_file, sink, cancel)
            .await
    }

    pub async fn test(
        &self,
        targets: &[String],
        args: &[String],
        event_file: &Path,
        sink: Arc<dyn LogSink>,
        cancel: &CancellationToken,
    ) -> Result<DelegateRun> {
        self.run("test", targets, args, event_file, sink, cancel)
            .await
    }
}
