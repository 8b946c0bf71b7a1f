//! The build engine: executes build, test, publish, cron, and task units.
//!
//! Delegate-target units go through the external build tool and its event
//! stream; bin-backed units run bespoke tool binaries over the
//! tool-invocation protocol. The engine owns two per-context caches: unit
//! results (failures included) and resolved tool binaries, the latter
//! copied into a content-derived scratch subdirectory so the delegate
//! cannot overwrite a cached bit from under us.

use crate::config::SystemConfig;
use crate::delegate::{Delegate, DelegateError};
use crate::events::{EventLog, FailureLog, FileRef, TestStatus};
use crate::invocation::{
    ArtifactSet, BuildInvocation, CronInvocation, InvocationError, PublishInvocation,
    TaskInvocation, TestInvocation, ToolInvocation, ToolInvocationResult, TOOL_INVOCATION_FLAG,
    TOOL_INVOCATION_RESULT_FLAG,
};
use crate::process::{self, LogSink, ProcessError};
use crate::results::{BuildResult, NamedLog, PublishResult, TestResult};
use chrono::Utc;
use sge_core::label::LabelError;
use sge_core::monorepo::MonorepoError;
use sge_core::registry::RegistryError;
use sge_core::{Label, Monorepo, TargetExpression, TestUnit, Unit, UnitRegistry};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Label(#[from] LabelError),
    #[error(transparent)]
    Monorepo(#[from] MonorepoError),
    #[error(transparent)]
    Invocation(#[from] InvocationError),
    #[error(transparent)]
    Process(#[from] ProcessError),
    #[error(transparent)]
    Delegate(#[from] DelegateError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("{label} is a {found}, expected a {expected}")]
    WrongKind {
        label: String,
        expected: &'static str,
        found: &'static str,
    },
    #[error("bin {} not found", .0.display())]
    BinNotFound(PathBuf),
    #[error("built bin {0} produced no artifacts")]
    NoExecutable(String),
    #[error("building bin {label} failed")]
    BinBuildFailed {
        label: String,
        result: Box<BuildResult>,
    },
}

pub type Result<T> = std::result::Result<T, EngineError>;

/// Per-invocation knobs threaded into tool descriptors and flags.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub log_level: String,
    /// Changelist the run is pinned at (0 = head).
    pub base_cl: u64,
    /// Pending-change identifier, when operating on one.
    pub change: Option<String>,
    /// Results URL advertised to publish tools.
    pub ci_result_url: String,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            base_cl: 0,
            change: None,
            ci_result_url: String::new(),
        }
    }
}

/// A resolved tool binary: its runnable path, plus the build result when
/// the bin was a build-unit label.
#[derive(Debug, Clone)]
pub struct ResolvedBin {
    pub path: PathBuf,
    pub build: Option<BuildResult>,
}

struct ToolRun {
    result: BuildResult,
    publish: Vec<crate::invocation::PublishOutcome>,
}

/// One engine instance is one execution context: caches live and die with
/// it.
pub struct Engine {
    registry: Arc<UnitRegistry>,
    delegate: Delegate,
    scratch: PathBuf,
    sink: Arc<dyn LogSink>,
    cancel: CancellationToken,
    opts: EngineOptions,
    results: Mutex<HashMap<String, BuildResult>>,
    tools: Mutex<HashMap<String, PathBuf>>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("scratch", &self.scratch)
            .finish_non_exhaustive()
    }
}

impl Engine {
    pub fn new(
        registry: Arc<UnitRegistry>,
        config: &SystemConfig,
        scratch: PathBuf,
        sink: Arc<dyn LogSink>,
        cancel: CancellationToken,
        opts: EngineOptions,
    ) -> Self {
        let delegate = Delegate::new(config.delegate.clone(), registry.monorepo().root());
        Self {
            registry,
            delegate,
            scratch,
            sink,
            cancel,
            opts,
            results: Mutex::new(HashMap::new()),
            tools: Mutex::new(HashMap::new()),
        }
    }

    pub fn monorepo(&self) -> &Arc<Monorepo> {
        self.registry.monorepo()
    }

    pub fn registry(&self) -> &Arc<UnitRegistry> {
        &self.registry
    }

    pub fn options(&self) -> &EngineOptions {
        &self.opts
    }

    fn output_base(&self) -> PathBuf {
        self.scratch.join("out")
    }

    /// Stable output path for a unit role: `a/b/c.out` for `//a/b:c`.
    fn stable_path(label: &Label, role: &str) -> String {
        format!("{}.{role}", label.stable_stem())
    }

    /// Output and logs directories are wiped and recreated per build.
    fn prepare_dir(&self, dir: &Path) -> Result<()> {
        if dir.exists() {
            std::fs::remove_dir_all(dir)?;
        }
        std::fs::create_dir_all(dir)?;
        Ok(())
    }

    fn log_labels(&self, label: &Label) -> Vec<String> {
        let mut labels = vec![format!("unit={label}")];
        if let Some(change) = &self.opts.change {
            labels.push(format!("change={change}"));
        }
        labels
    }

    // --- Build ---

    /// Build a unit, serving repeats (including cached failures) from the
    /// per-context result cache.
    pub async fn build(&self, label: &Label) -> Result<BuildResult> {
        let key = label.to_string();
        if let Some(hit) = self.results.lock().unwrap().get(&key) {
            debug!(label = %key, "build cache hit");
            return Ok(hit.clone());
        }
        let unit = self.registry.unit(label)?;
        let kind = unit.kind();
        let Unit::Build(unit) = unit else {
            return Err(EngineError::WrongKind {
                label: key,
                expected: "build_unit",
                found: kind,
            });
        };
        info!(label = %key, "building");
        let result = self.build_build_unit(label, &unit).await?;
        self.results.lock().unwrap().insert(key, result.clone());
        Ok(result)
    }

    async fn build_build_unit(
        &self,
        label: &Label,
        unit: &sge_core::BuildUnit,
    ) -> Result<BuildResult> {
        if let Some(target) = &unit.target {
            return self.build_delegate_target(&unit.name, target, &unit.args).await;
        }
        let bin = unit.bin.as_deref().expect("validated at parse");
        let dir = label.package_dir(self.monorepo())?;
        let abs_dir = self.monorepo().resolve(&dir);

        // Deps build in declaration order; the first failure is inherited.
        let mut inputs = Vec::new();
        for dep in &unit.deps {
            let dep_label = Label::parse(self.monorepo(), &abs_dir, dep, None)?;
            let dep_result = Box::pin(self.build(&dep_label)).await?;
            if !dep_result.success {
                let named = BuildResult {
                    name: dep.clone(),
                    ..dep_result
                };
                return Ok(BuildResult::from_dep_failure(&unit.name, &named));
            }
            inputs.push(ArtifactSet {
                unit: dep.clone(),
                files: dep_result.artifacts.clone(),
            });
        }

        let resolved = match Box::pin(self.resolve_bin(&abs_dir, bin)).await {
            Ok(r) => r,
            Err(EngineError::BinBuildFailed { label: bl, result }) => {
                let named = BuildResult {
                    name: bl,
                    ..*result
                };
                return Ok(BuildResult::from_dep_failure(&unit.name, &named));
            }
            Err(e) => return Err(e),
        };

        let output_dir = self.output_base().join(Self::stable_path(label, "out"));
        let logs_dir = self.scratch.join("logs").join(label.stable_stem());
        self.prepare_dir(&output_dir)?;
        self.prepare_dir(&logs_dir)?;

        let invocation = ToolInvocation {
            build_unit_dir: abs_dir,
            inputs,
            logs_dir,
            log_labels: self.log_labels(label),
            build: Some(BuildInvocation {
                output_dir: output_dir.clone(),
                output_stable_path: Self::stable_path(label, "out"),
                output_base: self.output_base(),
            }),
            ..ToolInvocation::default()
        };
        let mut run = self
            .run_tool(&unit.name, &resolved.path, &unit.args, &unit.env_vars, invocation)
            .await?;
        if run.result.success && run.result.artifacts.is_empty() {
            run.result.artifacts = collect_files(&output_dir)?;
        }
        Ok(run.result)
    }

    async fn build_delegate_target(
        &self,
        name: &str,
        target: &str,
        args: &[String],
    ) -> Result<BuildResult> {
        let event_file = self.event_file_path();
        let run = self
            .delegate
            .build(
                &[target.to_string()],
                args,
                &event_file,
                Arc::clone(&self.sink),
                &self.cancel,
            )
            .await?;
        Ok(self.delegate_target_result(name, target, &run.log, &run.output))
    }

    fn delegate_target_result(
        &self,
        name: &str,
        target: &str,
        log: &EventLog,
        output: &process::CapturedOutput,
    ) -> BuildResult {
        if let Some(outcome) = log.target_outcome(target) {
            if outcome.success && output.success() {
                return BuildResult {
                    name: name.to_string(),
                    success: true,
                    cause: None,
                    logs: Vec::new(),
                    artifacts: outcome
                        .artifacts
                        .iter()
                        .map(|f| PathBuf::from(f.local_path()))
                        .collect(),
                };
            }
            return BuildResult::failed(name, failures_to_logs(&outcome.failures));
        }
        // Never completed: aborted patterns carry the reason, otherwise the
        // captured output is all we have.
        let mut logs: Vec<NamedLog> = log
            .aborted_patterns()
            .into_iter()
            .map(|a| NamedLog::new(a.pattern, a.description))
            .collect();
        if logs.is_empty() {
            logs.push(NamedLog::new("output", output.output.clone()));
        }
        BuildResult::failed(name, logs)
    }

    // --- Test ---

    /// Run a test unit, suite, or build-test unit. One sub-result per
    /// executed member.
    pub async fn test(&self, label: &Label) -> Result<TestResult> {
        let members = self.expand_tests(vec![label.clone()])?;
        let mut out = TestResult {
            name: label.to_string(),
            results: Vec::new(),
        };
        for member in members {
            let unit = self.registry.unit(&member)?;
            match unit {
                Unit::Test(u) => {
                    let mut results = self.run_test_unit(&member, &u).await?;
                    out.results.append(&mut results);
                }
                Unit::BuildTest(u) => {
                    let dir = member.package_dir(self.monorepo())?;
                    let abs_dir = self.monorepo().resolve(&dir);
                    let build_label =
                        Label::parse(self.monorepo(), &abs_dir, &u.build_unit, None)?;
                    let built = Box::pin(self.build(&build_label)).await?;
                    out.results.push(BuildResult {
                        name: u.name.clone(),
                        success: built.success,
                        cause: built.cause.clone(),
                        logs: built.logs.clone(),
                        artifacts: Vec::new(),
                    });
                }
                other => {
                    return Err(EngineError::WrongKind {
                        label: member.to_string(),
                        expected: "test_unit",
                        found: other.kind(),
                    })
                }
            }
        }
        Ok(out)
    }

    async fn run_test_unit(&self, label: &Label, unit: &TestUnit) -> Result<Vec<BuildResult>> {
        if !unit.targets.is_empty() {
            let event_file = self.event_file_path();
            let run = self
                .delegate
                .test(
                    &unit.targets,
                    &unit.args,
                    &event_file,
                    Arc::clone(&self.sink),
                    &self.cancel,
                )
                .await?;
            let outcomes = run.log.test_outcomes();
            let mut results = Vec::new();
            for target in &unit.targets {
                let result = match outcomes.iter().find(|o| &o.label == target) {
                    Some(outcome) => BuildResult {
                        name: target.clone(),
                        success: outcome.status.passed(),
                        cause: None,
                        logs: test_logs(&outcome.logs, outcome.status),
                        artifacts: Vec::new(),
                    },
                    // The delegate never got to the test: report the build
                    // failure in its place.
                    None => self.delegate_target_result(target, target, &run.log, &run.output),
                };
                results.push(result);
            }
            return Ok(results);
        }

        let bin = unit.bin.as_deref().expect("validated at parse");
        let dir = label.package_dir(self.monorepo())?;
        let abs_dir = self.monorepo().resolve(&dir);
        let mut inputs = Vec::new();
        for dep in &unit.deps {
            let dep_label = Label::parse(self.monorepo(), &abs_dir, dep, None)?;
            let dep_result = Box::pin(self.build(&dep_label)).await?;
            if !dep_result.success {
                let named = BuildResult {
                    name: dep.clone(),
                    ..dep_result
                };
                return Ok(vec![BuildResult::from_dep_failure(&unit.name, &named)]);
            }
            inputs.push(ArtifactSet {
                unit: dep.clone(),
                files: dep_result.artifacts.clone(),
            });
        }
        let resolved = match Box::pin(self.resolve_bin(&abs_dir, bin)).await {
            Ok(r) => r,
            Err(EngineError::BinBuildFailed { label: bl, result }) => {
                let named = BuildResult {
                    name: bl,
                    ..*result
                };
                return Ok(vec![BuildResult::from_dep_failure(&unit.name, &named)]);
            }
            Err(e) => return Err(e),
        };
        let logs_dir = self.scratch.join("logs").join(label.stable_stem());
        self.prepare_dir(&logs_dir)?;
        let invocation = ToolInvocation {
            build_unit_dir: abs_dir,
            inputs,
            logs_dir,
            log_labels: self.log_labels(label),
            test: Some(TestInvocation {}),
            ..ToolInvocation::default()
        };
        let run = self
            .run_tool(&unit.name, &resolved.path, &unit.args, &[], invocation)
            .await?;
        Ok(vec![run.result])
    }

    // --- Publish ---

    /// Publish a unit: nested publish units recurse, direct units build
    /// their inputs and hand the descriptor to the publish tool.
    pub async fn publish(&self, label: &Label, args: &[String]) -> Result<Vec<PublishResult>> {
        let unit = self.registry.unit(label)?;
        let kind = unit.kind();
        let Unit::Publish(unit) = unit else {
            return Err(EngineError::WrongKind {
                label: label.to_string(),
                expected: "publish_unit",
                found: kind,
            });
        };
        let dir = label.package_dir(self.monorepo())?;
        let abs_dir = self.monorepo().resolve(&dir);

        if !unit.publish_units.is_empty() {
            let mut all = Vec::new();
            for nested in &unit.publish_units {
                let nested_label = Label::parse(self.monorepo(), &abs_dir, nested, None)?;
                let mut results = Box::pin(self.publish(&nested_label, args)).await?;
                all.append(&mut results);
            }
            return Ok(all);
        }

        let bin = unit.bin.as_deref().expect("validated at parse");
        let mut inputs = Vec::new();
        for build_unit in &unit.build_units {
            let dep_label = Label::parse(self.monorepo(), &abs_dir, build_unit, None)?;
            let dep_result = Box::pin(self.build(&dep_label)).await?;
            if !dep_result.success {
                return Ok(vec![PublishResult {
                    name: unit.name.clone(),
                    success: false,
                    logs: dep_result.logs,
                }]);
            }
            inputs.push(ArtifactSet {
                unit: build_unit.clone(),
                files: dep_result.artifacts.clone(),
            });
        }
        let resolved = match Box::pin(self.resolve_bin(&abs_dir, bin)).await {
            Ok(r) => r,
            Err(EngineError::BinBuildFailed { result, .. }) => {
                return Ok(vec![PublishResult {
                    name: unit.name.clone(),
                    success: false,
                    logs: result.logs,
                }])
            }
            Err(e) => return Err(e),
        };
        let logs_dir = self.scratch.join("logs").join(label.stable_stem());
        self.prepare_dir(&logs_dir)?;
        let invocation = ToolInvocation {
            build_unit_dir: abs_dir,
            inputs,
            logs_dir,
            log_labels: self.log_labels(label),
            publish: Some(PublishInvocation {
                base_cl: self.opts.base_cl,
                ci_result_url: self.opts.ci_result_url.clone(),
                invocation_time: Utc::now().to_rfc3339(),
            }),
            ..ToolInvocation::default()
        };
        let tool_args = args.to_vec();
        let run = self
            .run_tool(&unit.name, &resolved.path, &tool_args, &[], invocation)
            .await?;
        if run.publish.is_empty() {
            return Ok(vec![PublishResult {
                name: unit.name.clone(),
                success: run.result.success,
                logs: run.result.logs,
            }]);
        }
        Ok(run
            .publish
            .into_iter()
            .map(|p| PublishResult {
                name: p.name,
                success: p.success,
                logs: p.logs,
            })
            .collect())
    }

    // --- Cron / task ---

    pub async fn run_cron(&self, label: &Label, args: &[String]) -> Result<BuildResult> {
        let unit = self.registry.unit(label)?;
        let kind = unit.kind();
        let Unit::Cron(unit) = unit else {
            return Err(EngineError::WrongKind {
                label: label.to_string(),
                expected: "cron_unit",
                found: kind,
            });
        };
        self.run_bin_unit(
            label,
            &unit.name,
            &unit.bin,
            &unit.args,
            args,
            ToolInvocation {
                cron: Some(CronInvocation {}),
                ..ToolInvocation::default()
            },
        )
        .await
    }

    pub async fn run_task(&self, label: &Label, args: &[String]) -> Result<BuildResult> {
        let unit = self.registry.unit(label)?;
        let kind = unit.kind();
        let Unit::Task(unit) = unit else {
            return Err(EngineError::WrongKind {
                label: label.to_string(),
                expected: "task_unit",
                found: kind,
            });
        };
        self.run_bin_unit(
            label,
            &unit.name,
            &unit.bin,
            &unit.args,
            args,
            ToolInvocation {
                task: Some(TaskInvocation {}),
                ..ToolInvocation::default()
            },
        )
        .await
    }

    async fn run_bin_unit(
        &self,
        label: &Label,
        name: &str,
        bin: &str,
        unit_args: &[String],
        extra_args: &[String],
        mut invocation: ToolInvocation,
    ) -> Result<BuildResult> {
        let dir = label.package_dir(self.monorepo())?;
        let abs_dir = self.monorepo().resolve(&dir);
        let resolved = match Box::pin(self.resolve_bin(&abs_dir, bin)).await {
            Ok(r) => r,
            Err(EngineError::BinBuildFailed { label: bl, result }) => {
                let named = BuildResult {
                    name: bl,
                    ..*result
                };
                return Ok(BuildResult::from_dep_failure(name, &named));
            }
            Err(e) => return Err(e),
        };
        let logs_dir = self.scratch.join("logs").join(label.stable_stem());
        self.prepare_dir(&logs_dir)?;
        invocation.build_unit_dir = abs_dir;
        invocation.logs_dir = logs_dir;
        invocation.log_labels = self.log_labels(label);
        let mut args = unit_args.to_vec();
        args.extend(extra_args.iter().cloned());
        let run = self
            .run_tool(name, &resolved.path, &args, &[], invocation)
            .await?;
        Ok(run.result)
    }

    // --- Tool-invocation protocol ---

    async fn run_tool(
        &self,
        name: &str,
        bin: &Path,
        args: &[String],
        env_vars: &[String],
        invocation: ToolInvocation,
    ) -> Result<ToolRun> {
        let inv_dir = self.scratch.join("invocations");
        std::fs::create_dir_all(&inv_dir)?;
        let id = Uuid::now_v7();
        let inv_path = inv_dir.join(format!("{id}.json"));
        let result_path = inv_dir.join(format!("{id}.result.json"));
        invocation.write(&inv_path)?;

        let mut cmd = Command::new(bin);
        cmd.current_dir(self.monorepo().root());
        cmd.arg(format!("{TOOL_INVOCATION_FLAG}={}", inv_path.display()));
        cmd.arg(format!(
            "{TOOL_INVOCATION_RESULT_FLAG}={}",
            result_path.display()
        ));
        cmd.args(args);
        cmd.arg(format!("-log_level={}", self.opts.log_level));
        for pair in env_vars {
            if let Some((key, value)) = pair.split_once('=') {
                cmd.env(key, value);
            }
        }

        let output = process::run_supervised(
            cmd,
            Arc::clone(&self.sink),
            Duration::ZERO,
            &self.cancel,
        )
        .await?;

        match ToolInvocationResult::read(&result_path)? {
            Some(tool_result) => {
                let mut logs = tool_result.logs;
                if !tool_result.message.is_empty() {
                    logs.push(NamedLog::new("message", tool_result.message));
                }
                Ok(ToolRun {
                    result: BuildResult {
                        name: name.to_string(),
                        success: output.success() && tool_result.success,
                        cause: None,
                        logs,
                        artifacts: tool_result.artifacts,
                    },
                    publish: tool_result.publish_results,
                })
            }
            // Tool crashed (or never wrote a result): the combined captured
            // output is the whole story.
            None => Ok(ToolRun {
                result: BuildResult {
                    name: name.to_string(),
                    success: output.success(),
                    cause: None,
                    logs: vec![NamedLog::new("output", output.output)],
                    artifacts: Vec::new(),
                },
                publish: Vec::new(),
            }),
        }
    }

    // --- Bin resolution & tool cache ---

    /// Resolve a unit's `bin` string: a label (contains `:` or names a
    /// directory) is built on demand and served from the tool cache; a
    /// checked-in path resolves against the monorepo root.
    pub async fn resolve_bin(&self, rel_to: &Path, bin: &str) -> Result<ResolvedBin> {
        let mr = Arc::clone(self.monorepo());
        let is_label = bin.contains(':') || {
            mr.new_path(rel_to, bin)
                .map(|p| mr.resolve(&p).is_dir())
                .unwrap_or(false)
        };
        if !is_label {
            let rel = mr.new_path(rel_to, bin)?;
            let abs = mr.resolve(&rel);
            if !abs.is_file() {
                return Err(EngineError::BinNotFound(abs));
            }
            return Ok(ResolvedBin {
                path: abs,
                build: None,
            });
        }

        let label = Label::parse(&mr, rel_to, bin, None)?;
        let key = label.to_string();
        if let Some(cached) = self.tools.lock().unwrap().get(&key) {
            let build = self.results.lock().unwrap().get(&key).cloned();
            return Ok(ResolvedBin {
                path: cached.clone(),
                build,
            });
        }
        let result = Box::pin(self.build(&label)).await?;
        if !result.success {
            return Err(EngineError::BinBuildFailed {
                label: key,
                result: Box::new(result),
            });
        }
        let exe = result
            .artifacts
            .first()
            .cloned()
            .ok_or_else(|| EngineError::NoExecutable(key.clone()))?;
        let cached = self.cache_tool(&exe)?;
        self.tools.lock().unwrap().insert(key, cached.clone());
        Ok(ResolvedBin {
            path: cached,
            build: Some(result),
        })
    }

    /// Copy a built executable into a content-derived scratch subdirectory.
    /// The delegate may overwrite its own output area on the next build;
    /// the cached copy stays stable.
    fn cache_tool(&self, exe: &Path) -> Result<PathBuf> {
        let contents = std::fs::read(exe)?;
        let digest = Sha256::digest(&contents);
        let hex: String = digest.iter().take(8).map(|b| format!("{b:02x}")).collect();
        let dir = self.scratch.join("tools").join(hex);
        std::fs::create_dir_all(&dir)?;
        let dest = dir.join(exe.file_name().unwrap_or_default());
        if !dest.exists() {
            std::fs::copy(exe, &dest)?;
        }
        Ok(dest)
    }

    // --- Expansion ---

    /// Expand a target expression into concrete test labels: a unit label
    /// expands to itself, suites to their member union, and a `...`
    /// subtree to every test-like unit declared under it.
    pub fn expand_target_expression(&self, expr: &TargetExpression) -> Result<Vec<Label>> {
        match expr {
            TargetExpression::Label(label) => self.expand_tests(vec![label.clone()]),
            TargetExpression::Subtree(dir) => {
                let seeds = self.subtree_test_labels(dir)?;
                self.expand_tests(seeds)
            }
        }
    }

    fn subtree_test_labels(&self, dir: &str) -> Result<Vec<Label>> {
        let mr = Arc::clone(self.monorepo());
        let mut labels = Vec::new();
        for decl_dir in self.registry.walk(dir)? {
            let Some(catalog) = self.registry.catalog(&decl_dir)? else {
                continue;
            };
            for unit in &catalog.units {
                if matches!(unit, Unit::Test(_) | Unit::BuildTest(_) | Unit::Suite(_)) {
                    labels.push(Label::parse(
                        &mr,
                        mr.root(),
                        &format!("//{}:{}", decl_dir, unit.name()),
                        None,
                    )?);
                }
            }
        }
        Ok(labels)
    }

    /// Resolve suites down to test/build-test labels. A seen-set prevents
    /// cycles and duplicate enqueues.
    fn expand_tests(&self, seeds: Vec<Label>) -> Result<Vec<Label>> {
        let mr = Arc::clone(self.monorepo());
        let mut out = Vec::new();
        let mut seen = HashSet::new();
        let mut queue: VecDeque<Label> = seeds.into();
        while let Some(label) = queue.pop_front() {
            if !seen.insert(label.to_string()) {
                continue;
            }
            match self.registry.unit(&label)? {
                Unit::Test(_) | Unit::BuildTest(_) => out.push(label),
                Unit::Suite(suite) => {
                    let dir = label.package_dir(&mr)?;
                    let abs_dir = mr.resolve(&dir);
                    for member in &suite.test_units {
                        if member == "..." {
                            for seed in self.subtree_test_labels(&dir)? {
                                queue.push_back(seed);
                            }
                        } else {
                            queue.push_back(Label::parse(&mr, &abs_dir, member, None)?);
                        }
                    }
                }
                other => {
                    return Err(EngineError::WrongKind {
                        label: label.to_string(),
                        expected: "test_unit",
                        found: other.kind(),
                    })
                }
            }
        }
        Ok(out)
    }

    /// Length of the delegate argument vector a unit would run with.
    /// Presubmit orders checks by decreasing key so longer (more specific)
    /// argument sets run together, minimizing delegate re-configuration.
    pub fn delegate_sort_key(&self, label: &Label) -> usize {
        match self.registry.unit(label) {
            Ok(Unit::Test(u)) if !u.targets.is_empty() => {
                Delegate::args_for("test", &u.targets, &u.args).len()
            }
            Ok(Unit::Build(u)) if u.target.is_some() => {
                Delegate::args_for("build", std::slice::from_ref(u.target.as_ref().unwrap()), &u.args).len()
            }
            _ => 0,
        }
    }

    fn event_file_path(&self) -> PathBuf {
        let dir = self.scratch.join("events");
        std::fs::create_dir_all(&dir).ok();
        dir.join(format!("{}.bin", Uuid::now_v7()))
    }
}

fn failures_to_logs(failures: &[FailureLog]) -> Vec<NamedLog> {
    let mut logs = Vec::new();
    for failure in failures {
        for file in &failure.files {
            let path = file.local_path();
            match std::fs::read_to_string(path) {
                Ok(contents) => logs.push(NamedLog::new(&file.name, contents)),
                Err(_) => logs.push(NamedLog::new(&file.name, path)),
            }
        }
        if !failure.message.is_empty() {
            logs.push(NamedLog::new("failure", &failure.message));
        }
    }
    logs
}

fn test_logs(refs: &[FileRef], status: TestStatus) -> Vec<NamedLog> {
    let mut logs = Vec::new();
    for file in refs {
        let path = file.local_path();
        match std::fs::read_to_string(path) {
            Ok(contents) => logs.push(NamedLog::new(&file.name, contents)),
            Err(_) => logs.push(NamedLog::new(&file.name, path)),
        }
    }
    if logs.is_empty() && !status.passed() {
        logs.push(NamedLog::new("status", status.as_str()));
    }
    logs
}

fn collect_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in walkdir::WalkDir::new(dir) {
        let entry = entry.map_err(|e| {
            EngineError::Io(e.into_io_error().unwrap_or_else(|| {
                std::io::Error::new(std::io::ErrorKind::Other, "walk error")
            }))
        })?;
        if entry.file_type().is_file() {
            files.push(entry.path().to_path_buf());
        }
    }
    files.sort();
    Ok(files)
}
