//! Post-submit controller: a persistent, eventually-consistent state
//! machine per post-submit unit.
//!
//! Each tick reads the unit's record from the KV store, advances the
//! machine, and writes back only when something changed. Work runs on the
//! remote CI fleet; the worker writes a task record the controller polls
//! on later ticks. Timeouts are logical, computed from recorded start
//! timestamps, never wall-clock watchdogs.

use crate::kv::{self, KvStore};
use crate::notify::{should_notify, Notification, Notifier};
use crate::remote::{DispatchOptions, RemoteAction, RemoteDispatcher, RemoteError};
use chrono::{DateTime, Duration, Timelike, Utc};
use serde::{Deserialize, Serialize};
use sge_core::pathexpr::ExpressionSet;
use sge_core::{Label, Monorepo, PostSubmit, Unit, UnitRegistry};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

/// A queued task unclaimed for this long gets re-created.
pub const QUEUE_TIMEOUT_SECS: i64 = 300;
/// Default running-task timeout, overridable per unit.
pub const DEFAULT_TASK_TIMEOUT_SECS: i64 = 7200;
/// Back-off before retrying a failed unit.
pub const RETRY_INTERVAL_SECS: i64 = 7200;
/// Daily-cadence skew guard: no re-trigger within this window.
pub const DAILY_SKEW_HOURS: i64 = 4;

#[derive(Debug, Error)]
pub enum PostSubmitError {
    #[error(transparent)]
    Kv(#[from] kv::KvError),
    #[error(transparent)]
    Expr(#[from] sge_core::pathexpr::PathExprError),
    #[error(transparent)]
    Label(#[from] sge_core::label::LabelError),
    #[error(transparent)]
    Registry(#[from] sge_core::registry::RegistryError),
    #[error("bad state record for {key}: {source}")]
    BadRecord {
        key: String,
        source: serde_json::Error,
    },
}

pub type Result<T> = std::result::Result<T, PostSubmitError>;

/// Unit health as persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UnitStatus {
    #[default]
    Success,
    Pending,
    Failed,
}

/// Remote task progress as written by the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    #[default]
    Running,
    Success,
    Failed,
}

/// Reference to the in-flight task, stored inside the unit state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRef {
    pub key: String,
    pub start_time: DateTime<Utc>,
    pub cl: u64,
}

/// The per-unit persistent record. Only `dirty` records write back;
/// the flag itself never persists.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UnitState {
    pub status: UnitStatus,
    /// Last terminal health; recovery detection compares against it.
    pub success: bool,
    pub task: Option<TaskRef>,
    pub last_post_submit_cl: u64,
    pub last_post_submit_time: Option<DateTime<Utc>>,
    pub next_retry: Option<DateTime<Utc>>,
    #[serde(skip)]
    pub dirty: bool,
}

/// The record a fleet worker writes under the task key.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskRecord {
    pub action: String,
    pub label: String,
    pub start: Option<DateTime<Utc>>,
    pub results_url: String,
    pub status: TaskStatus,
}

/// Per-unit state key: label slashes become colons.
pub fn state_key(env: &str, label: &Label) -> String {
    format!("sge-postsubmit-{env}:{}", label.key_form())
}

/// Fresh task key.
pub fn new_task_key() -> String {
    format!("sge-postsubmit-task:{}", Uuid::now_v7())
}

/// High-water mark for the last CL the controller observed.
pub fn last_cl_key(env: &str) -> String {
    format!("sge-postsubmit-{env}-last-cl")
}

/// What one tick sees of the world.
#[derive(Debug, Clone, Default)]
pub struct TickContext {
    pub now: DateTime<Utc>,
    pub current_cl: u64,
    /// Root-relative files changed since the last observed CL.
    pub changed_files: Vec<String>,
}

/// One launched task, as recorded by the test launcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchedTask {
    pub action: RemoteAction,
    pub label: String,
    pub task_key: String,
}

/// Hands created tasks to the fleet (or records them in tests).
pub enum TaskLauncher {
    Remote {
        dispatcher: RemoteDispatcher,
        log_level: String,
        invoker_url: String,
    },
    Recording(Mutex<Vec<LaunchedTask>>),
}

impl std::fmt::Debug for TaskLauncher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Remote { .. } => f.write_str("Remote"),
            Self::Recording(_) => f.write_str("Recording"),
        }
    }
}

impl TaskLauncher {
    pub fn recording() -> Self {
        Self::Recording(Mutex::new(Vec::new()))
    }

    async fn launch(
        &self,
        action: RemoteAction,
        label: &Label,
        task_key: &str,
        base_cl: u64,
    ) -> std::result::Result<(), RemoteError> {
        match self {
            Self::Remote {
                dispatcher,
                log_level,
                invoker_url,
            } => {
                let opts = DispatchOptions {
                    base_cl,
                    change: None,
                    task_key: Some(task_key.to_string()),
                    log_level: log_level.clone(),
                    invoker: "postsubmit".to_string(),
                    invoker_url: invoker_url.clone(),
                    args: Vec::new(),
                };
                dispatcher.dispatch(action, label, &opts).await
            }
            Self::Recording(launched) => {
                launched.lock().unwrap().push(LaunchedTask {
                    action,
                    label: label.to_string(),
                    task_key: task_key.to_string(),
                });
                Ok(())
            }
        }
    }

    pub fn launched(&self) -> Vec<LaunchedTask> {
        match self {
            Self::Recording(launched) => launched.lock().unwrap().clone(),
            Self::Remote { .. } => Vec::new(),
        }
    }
}

/// The controller: stateless between ticks apart from what the KV store
/// holds.
#[derive(Debug)]
pub struct PostSubmitController {
    mr: Arc<Monorepo>,
    kv: Arc<KvStore>,
    notifier: Arc<Notifier>,
    launcher: TaskLauncher,
    env: String,
}

impl PostSubmitController {
    pub fn new(
        mr: Arc<Monorepo>,
        kv: Arc<KvStore>,
        notifier: Arc<Notifier>,
        launcher: TaskLauncher,
        env: impl Into<String>,
    ) -> Self {
        Self {
            mr,
            kv,
            notifier,
            launcher,
            env: env.into(),
        }
    }

    pub fn launcher(&self) -> &TaskLauncher {
        &self.launcher
    }

    /// Tick every post-submit unit the registry knows about, then advance
    /// the last-observed-CL high-water mark. Returns the ticked labels.
    pub async fn tick_all(
        &self,
        registry: &UnitRegistry,
        ctx: &TickContext,
    ) -> Result<Vec<String>> {
        let mut ticked = Vec::new();
        for dir in registry.walk("")? {
            let Some(catalog) = registry.catalog(&dir)? else {
                continue;
            };
            for unit in &catalog.units {
                let Some(ps) = unit.post_submit() else {
                    continue;
                };
                let action = match unit {
                    Unit::Publish(_) => RemoteAction::Publish,
                    Unit::Task(_) => RemoteAction::Task,
                    _ => continue,
                };
                let label = Label::parse(
                    &self.mr,
                    self.mr.root(),
                    &format!("//{dir}:{}", unit.name()),
                    None,
                )?;
                if let Err(e) = self.tick_unit(&label, ps, action, ctx).await {
                    // One broken unit must not starve the rest of the tick.
                    warn!(label = %label, error = %e, "post-submit tick failed");
                }
                ticked.push(label.to_string());
            }
        }
        if ctx.current_cl > 0 {
            if let Err(e) = self
                .kv
                .write(&last_cl_key(&self.env), &ctx.current_cl.to_string())
                .await
            {
                warn!(error = %e, "failed to advance last-cl high-water mark");
            }
        }
        Ok(ticked)
    }

    /// One unit's tick: read, advance, conditional write-back.
    pub async fn tick_unit(
        &self,
        label: &Label,
        ps: &PostSubmit,
        action: RemoteAction,
        ctx: &TickContext,
    ) -> Result<()> {
        let key = state_key(&self.env, label);
        let raw = self.kv.read(&key).await?;
        let mut state = if kv::is_unset(&raw) {
            UnitState {
                success: true,
                ..UnitState::default()
            }
        } else {
            serde_json::from_str(&raw).map_err(|source| PostSubmitError::BadRecord {
                key: key.clone(),
                source,
            })?
        };

        self.advance(label, ps, action, ctx, &mut state).await?;

        if state.dirty {
            let serialized = serde_json::to_string(&state).expect("state serializes");
            self.kv.write(&key, &serialized).await?;
        }
        Ok(())
    }

    async fn advance(
        &self,
        label: &Label,
        ps: &PostSubmit,
        action: RemoteAction,
        ctx: &TickContext,
        state: &mut UnitState,
    ) -> Result<()> {
        match state.status {
            UnitStatus::Success => {
                if self.triggered(label, ps, ctx, state)? {
                    info!(label = %label, "triggered, creating task");
                    self.create_task(label, action, ctx, state).await;
                }
            }
            UnitStatus::Failed => {
                let ready = state.next_retry.map_or(true, |at| ctx.now >= at);
                if ready {
                    state.next_retry = None;
                    info!(label = %label, "retry interval elapsed, creating task");
                    self.create_task(label, action, ctx, state).await;
                }
            }
            UnitStatus::Pending => {
                self.poll_pending(label, ps, action, ctx, state).await?;
            }
        }
        Ok(())
    }

    async fn poll_pending(
        &self,
        label: &Label,
        ps: &PostSubmit,
        action: RemoteAction,
        ctx: &TickContext,
        state: &mut UnitState,
    ) -> Result<()> {
        let Some(task) = state.task.clone() else {
            // Pending with no task reference: recover by creating one.
            self.create_task(label, action, ctx, state).await;
            return Ok(());
        };
        let raw = self.kv.read(&task.key).await?;
        if kv::is_unset(&raw) {
            // Worker has not claimed the task yet.
            let queue_age = ctx.now - task.start_time;
            if queue_age >= Duration::seconds(QUEUE_TIMEOUT_SECS) {
                warn!(label = %label, task_key = %task.key, "task never claimed, re-creating");
                self.create_task(label, action, ctx, state).await;
            }
            return Ok(());
        }
        let record: TaskRecord =
            serde_json::from_str(&raw).map_err(|source| PostSubmitError::BadRecord {
                key: task.key.clone(),
                source,
            })?;
        match record.status {
            TaskStatus::Running => {
                let started = record.start.unwrap_or(task.start_time);
                let timeout = ps
                    .timeout_sec
                    .map_or(DEFAULT_TASK_TIMEOUT_SECS, |t| t as i64);
                if ctx.now - started >= Duration::seconds(timeout) {
                    warn!(label = %label, task_key = %task.key, "task timed out");
                    self.complete_failed(label, ps, ctx, state, "timed out").await;
                }
            }
            TaskStatus::Success => {
                let was_healthy = state.success;
                state.status = UnitStatus::Success;
                state.success = true;
                state.last_post_submit_cl = task.cl;
                state.last_post_submit_time = Some(ctx.now);
                state.task = None;
                state.next_retry = None;
                state.dirty = true;
                self.notify(label, ps, was_healthy, true, &record.results_url)
                    .await;
            }
            TaskStatus::Failed => {
                self.complete_failed(label, ps, ctx, state, &record.results_url)
                    .await;
            }
        }
        Ok(())
    }

    async fn complete_failed(
        &self,
        label: &Label,
        ps: &PostSubmit,
        ctx: &TickContext,
        state: &mut UnitState,
        detail: &str,
    ) {
        let was_healthy = state.success;
        state.status = UnitStatus::Failed;
        state.success = false;
        state.task = None;
        state.next_retry = Some(ctx.now + Duration::seconds(RETRY_INTERVAL_SECS));
        state.dirty = true;
        self.notify(label, ps, was_healthy, false, detail).await;
    }

    async fn create_task(
        &self,
        label: &Label,
        action: RemoteAction,
        ctx: &TickContext,
        state: &mut UnitState,
    ) {
        let task_key = new_task_key();
        if let Err(e) = self
            .launcher
            .launch(action, label, &task_key, ctx.current_cl)
            .await
        {
            // The queue-timeout path re-creates the task on a later tick.
            warn!(label = %label, error = %e, "dispatch failed, will retry via queue timeout");
        }
        state.task = Some(TaskRef {
            key: task_key,
            start_time: ctx.now,
            cl: ctx.current_cl,
        });
        state.status = UnitStatus::Pending;
        state.dirty = true;
    }

    fn triggered(
        &self,
        label: &Label,
        ps: &PostSubmit,
        ctx: &TickContext,
        state: &UnitState,
    ) -> Result<bool> {
        if ps.trigger_always_for_testing {
            return Ok(true);
        }
        if !ps.trigger_paths.is_empty() {
            let dir = label.package_dir(&self.mr)?;
            let set = ExpressionSet::new(&self.mr, &self.mr.resolve(&dir), &ps.trigger_paths)?;
            if ctx.changed_files.iter().any(|f| set.matches(f).0) {
                return Ok(true);
            }
        }
        if let Some(hhmm) = &ps.daily_at_utc {
            // Validated as "HH:00" at unit parse; an unparsable record
            // simply never matches.
            let hour: u32 = hhmm.get(..2).and_then(|h| h.parse().ok()).unwrap_or(25);
            if ctx.now.hour() == hour {
                let recent = state.last_post_submit_time.is_some_and(|t| {
                    ctx.now - t < Duration::hours(DAILY_SKEW_HOURS)
                });
                if !recent {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    async fn notify(
        &self,
        label: &Label,
        ps: &PostSubmit,
        was_healthy: bool,
        now_healthy: bool,
        detail: &str,
    ) {
        for notify in &ps.notify {
            if !should_notify(notify.policy, was_healthy, now_healthy) {
                continue;
            }
            let outcome = if now_healthy { "succeeded" } else { "failed" };
            self.notifier
                .send(Notification {
                    to: notify.email.clone(),
                    subject: format!("post-submit {label} {outcome}"),
                    body: format!("unit: {label}\noutcome: {outcome}\n{detail}\n"),
                })
                .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use sge_core::{Notify, NotifyPolicy};
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        controller: PostSubmitController,
        kv: Arc<KvStore>,
        notifier: Arc<Notifier>,
        label: Label,
    }

    fn at(hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 10, hour, minute, 0).unwrap()
    }

    fn ctx(now: DateTime<Utc>, changed: &[&str]) -> TickContext {
        TickContext {
            now,
            current_cl: 100,
            changed_files: changed.iter().map(|s| (*s).to_string()).collect(),
        }
    }

    impl Fixture {
        fn new() -> Self {
            let dir = TempDir::new().unwrap();
            let mr = Arc::new(Monorepo::with_sub_repos(dir.path(), vec![]));
            let kv = Arc::new(KvStore::mem());
            let notifier = Arc::new(Notifier::recording());
            let label = Label::parse(&mr, dir.path(), "//svc/indexer:push", None).unwrap();
            let controller = PostSubmitController::new(
                Arc::clone(&mr),
                Arc::clone(&kv),
                Arc::clone(&notifier),
                TaskLauncher::recording(),
                "dev",
            );
            Self {
                _dir: dir,
                controller,
                kv,
                notifier,
                label,
            }
        }

        async fn tick(&self, ps: &PostSubmit, ctx: &TickContext) {
            self.controller
                .tick_unit(&self.label, ps, RemoteAction::Publish, ctx)
                .await
                .unwrap();
        }

        async fn state(&self) -> UnitState {
            let raw = self
                .kv
                .read(&state_key("dev", &self.label))
                .await
                .unwrap();
            serde_json::from_str(&raw).unwrap()
        }

        async fn write_task_record(&self, status: TaskStatus, start: DateTime<Utc>) {
            let task_key = self.state().await.task.unwrap().key;
            let record = TaskRecord {
                action: "publish".into(),
                label: self.label.to_string(),
                start: Some(start),
                results_url: "https://ci/results/1".into(),
                status,
            };
            self.kv
                .write(&task_key, &serde_json::to_string(&record).unwrap())
                .await
                .unwrap();
        }

        fn email_count(&self) -> usize {
            self.notifier.as_recording().unwrap().count()
        }
    }

    fn always_config(policy: NotifyPolicy) -> PostSubmit {
        PostSubmit {
            trigger_always_for_testing: true,
            notify: vec![Notify {
                email: "team@example.com".into(),
                policy,
            }],
            ..PostSubmit::default()
        }
    }

    #[tokio::test]
    async fn happy_path_runs_task_to_success() {
        let fx = Fixture::new();
        let ps = always_config(NotifyPolicy::NotifyAlways);
        let t0 = at(9, 0);

        // Tick 1: fresh state counts as SUCCESS, trigger creates a task.
        fx.tick(&ps, &ctx(t0, &[])).await;
        let state = fx.state().await;
        assert_eq!(state.status, UnitStatus::Pending);
        let first_key = state.task.as_ref().unwrap().key.clone();
        assert!(first_key.starts_with("sge-postsubmit-task:"));
        assert_eq!(fx.controller.launcher().launched().len(), 1);

        // Tick 2: record absent, queue age zero, no-op.
        fx.tick(&ps, &ctx(t0, &[])).await;
        assert_eq!(fx.state().await.task.unwrap().key, first_key);

        // Tick 3: worker reports RUNNING, still no-op.
        fx.write_task_record(TaskStatus::Running, t0).await;
        fx.tick(&ps, &ctx(at(9, 5), &[])).await;
        assert_eq!(fx.state().await.status, UnitStatus::Pending);
        assert_eq!(fx.email_count(), 0);

        // Tick 4: worker reports SUCCESS.
        fx.write_task_record(TaskStatus::Success, t0).await;
        fx.tick(&ps, &ctx(at(9, 10), &[])).await;
        let state = fx.state().await;
        assert_eq!(state.status, UnitStatus::Success);
        assert!(state.success);
        assert_eq!(state.last_post_submit_cl, 100);
        assert!(state.task.is_none());
        assert_eq!(fx.email_count(), 1);
    }

    #[tokio::test]
    async fn failure_sets_retry_and_waits_out_the_interval() {
        let fx = Fixture::new();
        let ps = always_config(NotifyPolicy::NotifyOnFailure);
        let t0 = at(9, 0);

        fx.tick(&ps, &ctx(t0, &[])).await;
        fx.write_task_record(TaskStatus::Failed, t0).await;
        fx.tick(&ps, &ctx(at(9, 1), &[])).await;
        let state = fx.state().await;
        assert_eq!(state.status, UnitStatus::Failed);
        assert!(!state.success);
        assert_eq!(
            state.next_retry.unwrap(),
            at(9, 1) + Duration::seconds(RETRY_INTERVAL_SECS)
        );
        assert_eq!(fx.email_count(), 1);

        // Before the retry interval: no-op, no extra email.
        fx.tick(&ps, &ctx(at(10, 0), &[])).await;
        assert_eq!(fx.state().await.status, UnitStatus::Failed);
        assert_eq!(fx.email_count(), 1);

        // After the interval: a second task goes out.
        fx.tick(&ps, &ctx(at(11, 2), &[])).await;
        let state = fx.state().await;
        assert_eq!(state.status, UnitStatus::Pending);
        assert!(state.next_retry.is_none());
        assert_eq!(fx.controller.launcher().launched().len(), 2);
    }

    #[tokio::test]
    async fn queue_timeout_recreates_then_task_timeout_fails() {
        let fx = Fixture::new();
        let ps = always_config(NotifyPolicy::NotifyNever);
        let t0 = at(9, 0);

        fx.tick(&ps, &ctx(t0, &[])).await;
        let first_key = fx.state().await.task.unwrap().key;

        // Queue age reaches Q: a fresh task replaces the unclaimed one.
        let t1 = t0 + Duration::seconds(QUEUE_TIMEOUT_SECS);
        fx.tick(&ps, &ctx(t1, &[])).await;
        let state = fx.state().await;
        assert_eq!(state.status, UnitStatus::Pending);
        let second_key = state.task.unwrap().key;
        assert_ne!(second_key, first_key);
        assert_eq!(fx.controller.launcher().launched().len(), 2);

        // Second task runs past the default timeout: treated as failed.
        fx.write_task_record(TaskStatus::Running, t1).await;
        let t2 = t1 + Duration::seconds(DEFAULT_TASK_TIMEOUT_SECS);
        fx.tick(&ps, &ctx(t2, &[])).await;
        let state = fx.state().await;
        assert_eq!(state.status, UnitStatus::Failed);
        assert!(state.next_retry.is_some());
    }

    #[tokio::test]
    async fn per_unit_timeout_override_applies() {
        let fx = Fixture::new();
        let ps = PostSubmit {
            timeout_sec: Some(60),
            ..always_config(NotifyPolicy::NotifyNever)
        };
        let t0 = at(9, 0);
        fx.tick(&ps, &ctx(t0, &[])).await;
        fx.write_task_record(TaskStatus::Running, t0).await;
        fx.tick(&ps, &ctx(t0 + Duration::seconds(61), &[])).await;
        assert_eq!(fx.state().await.status, UnitStatus::Failed);
    }

    #[tokio::test]
    async fn daily_cadence_triggers_at_declared_hour_with_skew_guard() {
        let fx = Fixture::new();
        let ps = PostSubmit {
            daily_at_utc: Some("00:00".into()),
            ..PostSubmit::default()
        };

        // Noon: not the declared hour.
        fx.tick(&ps, &ctx(at(12, 0), &[])).await;
        assert!(fx.controller.launcher().launched().is_empty());

        // Midnight: triggered.
        let midnight = Utc.with_ymd_and_hms(2024, 5, 11, 0, 5, 0).unwrap();
        fx.tick(&ps, &ctx(midnight, &[])).await;
        assert_eq!(fx.controller.launcher().launched().len(), 1);

        // Task completes; a tick in the same hour stays quiet (4h skew).
        fx.write_task_record(TaskStatus::Success, midnight).await;
        let later = Utc.with_ymd_and_hms(2024, 5, 11, 0, 30, 0).unwrap();
        fx.tick(&ps, &ctx(later, &[])).await;
        assert_eq!(fx.state().await.status, UnitStatus::Success);
        fx.tick(&ps, &ctx(Utc.with_ymd_and_hms(2024, 5, 11, 0, 45, 0).unwrap(), &[]))
            .await;
        assert_eq!(fx.controller.launcher().launched().len(), 1);

        // Next midnight: triggered again.
        let next = Utc.with_ymd_and_hms(2024, 5, 12, 0, 1, 0).unwrap();
        fx.tick(&ps, &ctx(next, &[])).await;
        assert_eq!(fx.controller.launcher().launched().len(), 2);
    }

    #[tokio::test]
    async fn path_trigger_matches_changed_files() {
        let fx = Fixture::new();
        let ps = PostSubmit {
            trigger_paths: vec!["//triggerme/...".into()],
            ..PostSubmit::default()
        };
        let t0 = at(9, 0);

        fx.tick(&ps, &ctx(t0, &[])).await;
        assert!(fx.controller.launcher().launched().is_empty());

        fx.tick(&ps, &ctx(t0, &["donottrigger/foo.txt"])).await;
        assert!(fx.controller.launcher().launched().is_empty());

        fx.tick(&ps, &ctx(t0, &["triggerme/foo.txt"])).await;
        assert_eq!(fx.controller.launcher().launched().len(), 1);
        assert_eq!(fx.state().await.status, UnitStatus::Pending);
    }

    #[tokio::test]
    async fn recovery_email_fires_under_recovery_policy() {
        let fx = Fixture::new();
        let ps = always_config(NotifyPolicy::NotifyOnFailureAndRecovery);
        let t0 = at(9, 0);

        // Fail once.
        fx.tick(&ps, &ctx(t0, &[])).await;
        fx.write_task_record(TaskStatus::Failed, t0).await;
        fx.tick(&ps, &ctx(at(9, 1), &[])).await;
        assert_eq!(fx.email_count(), 1);

        // Retry succeeds: that's a recovery, one more email.
        fx.tick(&ps, &ctx(at(12, 0), &[])).await;
        fx.write_task_record(TaskStatus::Success, at(12, 0)).await;
        fx.tick(&ps, &ctx(at(12, 5), &[])).await;
        assert_eq!(fx.email_count(), 2);

        // Steady-state success: silent.
        fx.tick(&ps, &ctx(at(13, 0), &[])).await;
        fx.write_task_record(TaskStatus::Success, at(13, 0)).await;
        fx.tick(&ps, &ctx(at(13, 5), &[])).await;
        assert_eq!(fx.email_count(), 2);
    }

    #[tokio::test]
    async fn clean_tick_writes_nothing_back() {
        let fx = Fixture::new();
        let ps = PostSubmit::default(); // no triggers at all
        fx.tick(&ps, &ctx(at(9, 0), &[])).await;
        let mem = fx.kv.as_mem().unwrap();
        assert!(mem.keys().is_empty());
    }

    #[tokio::test]
    async fn tick_all_walks_registry_and_advances_high_water() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("svc")).unwrap();
        std::fs::write(
            dir.path().join("svc/BUILDUNIT"),
            r#"
task_unit {
  name: "sync"
  bin: "//tools/sync"
  post_submit { trigger_always_for_testing: true }
}
"#,
        )
        .unwrap();
        let mr = Arc::new(Monorepo::with_sub_repos(dir.path(), vec![]));
        let registry = UnitRegistry::new(Arc::clone(&mr));
        let kv = Arc::new(KvStore::mem());
        let controller = PostSubmitController::new(
            mr,
            Arc::clone(&kv),
            Arc::new(Notifier::recording()),
            TaskLauncher::recording(),
            "dev",
        );
        let ticked = controller
            .tick_all(&registry, &ctx(at(9, 0), &[]))
            .await
            .unwrap();
        assert_eq!(ticked, vec!["//svc:sync".to_string()]);
        assert_eq!(controller.launcher().launched().len(), 1);
        assert_eq!(
            kv.read(&last_cl_key("dev")).await.unwrap(),
            "100"
        );
    }
}
