//! Presubmit listeners: streamed progress for operators and metrics.
//!
//! Listeners observe a serial run: end-of-check always lands before the
//! next start-of-check. Metric publishing happens on a background task
//! joined at shutdown so a slow sink never stalls the run.

use chrono::{DateTime, Utc};
use sgeb::results::CheckResult;
use std::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Observer of one presubmit run.
pub trait PresubmitListener: Send + Sync {
    fn on_presubmit_start(&self, _total_checks: usize) {}
    fn on_check_start(&self, _name: &str) {}
    fn on_check_result(&self, _result: &CheckResult) {}
    fn on_presubmit_end(&self, _success: bool) {}
}

/// Logs progress through tracing.
#[derive(Debug, Default)]
pub struct LoggingListener;

impl PresubmitListener for LoggingListener {
    fn on_presubmit_start(&self, total_checks: usize) {
        info!(checks = total_checks, "presubmit starting");
    }

    fn on_check_start(&self, name: &str) {
        info!(check = name, "running");
    }

    fn on_check_result(&self, result: &CheckResult) {
        if result.success {
            info!(check = %result.name, "PASSED");
            return;
        }
        error!(check = %result.name, "FAILED");
        for sub in &result.results {
            for log in &sub.logs {
                for line in log.contents.lines() {
                    error!(check = %result.name, sub = %sub.name, "{line}");
                }
            }
        }
    }

    fn on_presubmit_end(&self, success: bool) {
        if success {
            info!("presubmit passed");
        } else {
            error!("presubmit failed");
        }
    }
}

/// A recorded run duration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunMetric {
    pub begin: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub checks: usize,
    pub success: bool,
}

/// Records run timing and publishes it off the hot path.
///
/// The end timestamp is stamped at emission time, so the computed
/// duration is always non-negative.
#[derive(Debug, Default)]
pub struct MetricsListener {
    begin: Mutex<Option<DateTime<Utc>>>,
    checks: Mutex<usize>,
    recorded: Mutex<Vec<RunMetric>>,
    publishers: Mutex<Vec<JoinHandle<()>>>,
}

impl MetricsListener {
    pub fn new() -> Self {
        Self::default()
    }

    /// Metrics recorded so far, for assertions.
    pub fn recorded(&self) -> Vec<RunMetric> {
        self.recorded.lock().unwrap().clone()
    }

    /// Join outstanding publish tasks. Call once at shutdown.
    pub async fn join(&self) {
        let handles = std::mem::take(&mut *self.publishers.lock().unwrap());
        for handle in handles {
            handle.await.ok();
        }
    }
}

impl PresubmitListener for MetricsListener {
    fn on_presubmit_start(&self, total_checks: usize) {
        *self.begin.lock().unwrap() = Some(Utc::now());
        *self.checks.lock().unwrap() = total_checks;
    }

    fn on_presubmit_end(&self, success: bool) {
        let begin = self.begin.lock().unwrap().take().unwrap_or_else(Utc::now);
        let end = Utc::now();
        let metric = RunMetric {
            begin,
            end,
            checks: *self.checks.lock().unwrap(),
            success,
        };
        self.recorded.lock().unwrap().push(metric);
        let handle = tokio::spawn(async move {
            let duration_ms = (metric.end - metric.begin).num_milliseconds();
            info!(
                target: "metrics",
                duration_ms,
                checks = metric.checks,
                success = metric.success,
                "presubmit run"
            );
        });
        self.publishers.lock().unwrap().push(handle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn metrics_duration_is_non_negative() {
        let metrics = MetricsListener::new();
        metrics.on_presubmit_start(3);
        metrics.on_presubmit_end(true);
        metrics.join().await;
        let recorded = metrics.recorded();
        assert_eq!(recorded.len(), 1);
        assert!(recorded[0].end >= recorded[0].begin);
        assert_eq!(recorded[0].checks, 3);
    }

    #[tokio::test]
    async fn end_without_start_still_records() {
        let metrics = MetricsListener::new();
        metrics.on_presubmit_end(false);
        metrics.join().await;
        let recorded = metrics.recorded();
        assert_eq!(recorded.len(), 1);
        assert!(recorded[0].end >= recorded[0].begin);
    }
}
