//! Presubmit orchestrator: from a changelist to one result per intended
//! check.
//!
//! Pipeline: bucketize changed files, locate policy files, build each
//! policy's matcher, expand triggered policies into checks, run the
//! checks serially in sort order, and stream progress to listeners.
//! Internal failures never disappear: they lift into synthetic failed
//! results so the run always yields one result per intended check.

use crate::checker::{self, CheckerInvocation, TriggeredCheck};
use crate::listeners::PresubmitListener;
use crate::locator;
use sge_core::monorepo::normalize;
use sge_core::{ChangedFile, Changelist, CheckDecl, Label, TargetExpression};
use sgeb::config::{CheckerConfig, SystemConfig};
use sgeb::engine::Engine;
use sgeb::process::{self, LogSink};
use sgeb::results::CheckResult;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum PresubmitError {
    #[error(transparent)]
    Locator(#[from] locator::LocatorError),
}

pub type Result<T> = std::result::Result<T, PresubmitError>;

/// One concrete check to run.
#[derive(Debug)]
enum Check {
    Action {
        action: String,
        checker: CheckerConfig,
        policy_dir: String,
        files: Vec<ChangedFile>,
    },
    Build(Label),
    Test(Label),
    /// An expansion-time failure, carried so the run still reports it.
    Fail { name: String, error: String },
}

impl Check {
    fn name(&self) -> String {
        match self {
            Self::Action { action, .. } => action.clone(),
            Self::Build(label) => format!("build {label}"),
            Self::Test(label) => format!("test {label}"),
            Self::Fail { name, .. } => name.clone(),
        }
    }

    fn sort_key(&self, engine: &Engine) -> usize {
        match self {
            Self::Build(label) | Self::Test(label) => engine.delegate_sort_key(label),
            Self::Action { .. } | Self::Fail { .. } => 0,
        }
    }
}

/// The presubmit runner for one monorepo.
pub struct Presubmit {
    engine: Arc<Engine>,
    config: SystemConfig,
    listeners: Vec<Arc<dyn PresubmitListener>>,
    sink: Arc<dyn LogSink>,
    cancel: CancellationToken,
    fix_only: bool,
}

impl std::fmt::Debug for Presubmit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Presubmit")
            .field("fix_only", &self.fix_only)
            .finish_non_exhaustive()
    }
}

impl Presubmit {
    pub fn new(
        engine: Arc<Engine>,
        config: SystemConfig,
        sink: Arc<dyn LogSink>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            engine,
            config,
            listeners: Vec::new(),
            sink,
            cancel,
            fix_only: false,
        }
    }

    pub fn with_fix_only(mut self, fix_only: bool) -> Self {
        self.fix_only = fix_only;
        self
    }

    pub fn add_listener(&mut self, listener: Arc<dyn PresubmitListener>) {
        self.listeners.push(listener);
    }

    /// Run the presubmit over a changelist. Always yields one result per
    /// intended check; `Err` is reserved for the locator failing outright.
    pub async fn run(&self, cl: &Changelist) -> Result<Vec<CheckResult>> {
        let files = self.bucketize(cl);
        let paths: Vec<String> = files.iter().map(|f| f.path.clone()).collect();
        let policies = locator::locate_policies(self.engine.monorepo(), &paths).await?;
        let mut checks = self.expand_checks(&policies, &files, cl);

        // Longer delegate argument vectors first: more specific argument
        // sets run together, minimizing delegate re-configuration.
        checks.sort_by_key(|c| std::cmp::Reverse(c.sort_key(&self.engine)));

        for listener in &self.listeners {
            listener.on_presubmit_start(checks.len());
        }
        let mut results = Vec::with_capacity(checks.len());
        let mut all_passed = true;
        for check in &checks {
            let name = check.name();
            for listener in &self.listeners {
                listener.on_check_start(&name);
            }
            let result = self.run_check(check, cl).await;
            all_passed &= result.success;
            for listener in &self.listeners {
                listener.on_check_result(&result);
            }
            results.push(result);
        }
        for listener in &self.listeners {
            listener.on_presubmit_end(all_passed);
        }
        Ok(results)
    }

    /// Keep the changed files that belong to this monorepo; anything else
    /// is out of scope for this run.
    fn bucketize(&self, cl: &Changelist) -> Vec<ChangedFile> {
        cl.files
            .iter()
            .filter_map(|f| match normalize(&f.path) {
                Ok(path) if !path.is_empty() => Some(ChangedFile {
                    path,
                    status: f.status,
                }),
                _ => {
                    warn!(path = %f.path, "changed file outside the monorepo, skipping");
                    None
                }
            })
            .collect()
    }

    fn expand_checks(
        &self,
        policies: &[sge_core::PresubmitPolicy],
        files: &[ChangedFile],
        cl: &Changelist,
    ) -> Vec<Check> {
        let mr = self.engine.monorepo();
        let mut checks = Vec::new();
        let mut seen_builds: HashSet<String> = HashSet::new();
        let mut seen_tests: HashSet<String> = HashSet::new();

        for policy in policies {
            let matcher = match policy.matcher(mr) {
                Ok(m) => m,
                Err(e) => {
                    checks.push(Check::Fail {
                        name: format!("policy {}", policy.dir),
                        error: e.to_string(),
                    });
                    continue;
                }
            };
            let triggered: Vec<ChangedFile> = files
                .iter()
                .filter(|f| matcher.matches(&f.path).0)
                .cloned()
                .collect();
            if triggered.is_empty() {
                continue;
            }
            info!(policy = %policy.dir, files = triggered.len(), "policy triggered");
            let policy_abs = mr.resolve(&policy.dir);

            for decl in &policy.checks {
                match decl {
                    CheckDecl::Action(action) => {
                        let Some(checker) = self.config.checker(action) else {
                            checks.push(Check::Fail {
                                name: action.clone(),
                                error: format!("unknown check action {action:?}"),
                            });
                            continue;
                        };
                        if self.fix_only && !checker.fix {
                            info!(check = %action, "skipping: no fix support");
                            continue;
                        }
                        if checker.wants_cl_description && cl.description.is_none() {
                            info!(check = %action, "skipping: no CL description available");
                            continue;
                        }
                        checks.push(Check::Action {
                            action: action.clone(),
                            checker: checker.clone(),
                            policy_dir: policy.dir.clone(),
                            files: triggered.clone(),
                        });
                    }
                    CheckDecl::Build(unit) => {
                        match Label::parse(mr, &policy_abs, unit, None) {
                            Ok(label) => {
                                if seen_builds.insert(label.to_string()) {
                                    checks.push(Check::Build(label));
                                }
                            }
                            Err(e) => checks.push(Check::Fail {
                                name: format!("build {unit}"),
                                error: e.to_string(),
                            }),
                        }
                    }
                    CheckDecl::Test(unit) => {
                        let expanded = Label::parse(mr, &policy_abs, unit, None)
                            .map_err(|e| e.to_string())
                            .and_then(|label| {
                                self.engine
                                    .expand_target_expression(&TargetExpression::Label(label))
                                    .map_err(|e| e.to_string())
                            });
                        match expanded {
                            Ok(labels) => {
                                for label in labels {
                                    if seen_tests.insert(label.to_string()) {
                                        checks.push(Check::Test(label));
                                    }
                                }
                            }
                            Err(error) => checks.push(Check::Fail {
                                name: format!("test {unit}"),
                                error,
                            }),
                        }
                    }
                }
            }
        }
        checks
    }

    async fn run_check(&self, check: &Check, cl: &Changelist) -> CheckResult {
        match check {
            Check::Fail { name, error } => CheckResult::fail_check(name, error),
            Check::Build(label) => match self.engine.build(label).await {
                Ok(result) => CheckResult {
                    name: check.name(),
                    success: result.success,
                    results: vec![result],
                    logs: Vec::new(),
                    fix: None,
                },
                Err(e) => CheckResult::fail_check(check.name(), e),
            },
            Check::Test(label) => match self.engine.test(label).await {
                Ok(result) => CheckResult {
                    name: check.name(),
                    success: result.success(),
                    results: result.results,
                    logs: Vec::new(),
                    fix: None,
                },
                Err(e) => CheckResult::fail_check(check.name(), e),
            },
            Check::Action {
                action,
                checker,
                policy_dir,
                files,
            } => {
                let mr = self.engine.monorepo();
                let resolved = match self.engine.resolve_bin(mr.root(), &checker.bin).await {
                    Ok(r) => r,
                    Err(e) => return CheckResult::fail_check(action, e),
                };
                let invocation = CheckerInvocation {
                    triggered_checks: vec![TriggeredCheck {
                        check: action.clone(),
                        dir: policy_dir.clone(),
                        files: files.clone(),
                    }],
                    cl_description: cl.description.clone().unwrap_or_default(),
                    log_labels: vec![format!("check={action}")],
                };
                match checker::run_checker(
                    action,
                    &resolved.path,
                    mr.root(),
                    &invocation,
                    Arc::clone(&self.sink),
                    &self.cancel,
                )
                .await
                {
                    Ok(result) => result,
                    Err(e) => CheckResult::fail_check(action, e),
                }
            }
        }
    }

    /// Apply the fix commands the checks returned (fix mode). Each fix
    /// runs from the monorepo root; outcomes are reported per check.
    pub async fn apply_fixes(&self, results: &[CheckResult]) -> Vec<(String, bool)> {
        let mut applied = Vec::new();
        for result in results {
            let Some(fix) = &result.fix else {
                continue;
            };
            info!(check = %result.name, fix = %fix, "applying fix");
            let mut cmd = tokio::process::Command::new("sh");
            cmd.arg("-c")
                .arg(fix)
                .current_dir(self.engine.monorepo().root());
            let ok = match process::run_supervised(
                cmd,
                Arc::clone(&self.sink),
                Duration::ZERO,
                &self.cancel,
            )
            .await
            {
                Ok(output) => output.success(),
                Err(e) => {
                    warn!(check = %result.name, error = %e, "fix failed to run");
                    false
                }
            };
            applied.push((result.name.clone(), ok));
        }
        applied
    }
}

#[cfg(test)]
#[cfg(unix)]
mod tests {
    use super::*;
    use sge_core::{FileStatus, Monorepo, UnitRegistry};
    use sgeb::config::CheckerConfig;
    use sgeb::engine::EngineOptions;
    use sgeb::process::NullSink;
    use std::os::unix::fs::PermissionsExt;
    use std::sync::Mutex;
    use tempfile::TempDir;

    const OK_TOOL: &str = r#"#!/bin/sh
res=""
for a in "$@"; do
  case "$a" in
    --tool-invocation-result=*) res="${a#--tool-invocation-result=}" ;;
  esac
done
echo '{"success": true}' > "$res"
"#;

    const OK_CHECKER: &str = r#"#!/bin/sh
res=""
for a in "$@"; do
  case "$a" in
    --checker-invocation-result=*) res="${a#--checker-invocation-result=}" ;;
  esac
done
echo '{"results": [{"name": "fmt", "success": true}]}' > "$res"
"#;

    struct Fixture {
        _dir: TempDir,
        presubmit: Presubmit,
    }

    fn fixture(files: &[(&str, &str)], checks: Vec<CheckerConfig>) -> Fixture {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(sge_core::WORKSPACE_FILE), "").unwrap();
        for (rel, content) in files {
            let path = dir.path().join(rel);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(&path, content).unwrap();
            if rel.ends_with(".sh") {
                std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
            }
        }
        let mr = Arc::new(Monorepo::open(dir.path()).unwrap());
        let registry = Arc::new(UnitRegistry::new(mr));
        let config = SystemConfig {
            checks,
            ..SystemConfig::default()
        };
        let engine = Arc::new(Engine::new(
            registry,
            &config,
            dir.path().join(".scratch"),
            Arc::new(NullSink),
            CancellationToken::new(),
            EngineOptions::default(),
        ));
        let presubmit = Presubmit::new(
            engine,
            config,
            Arc::new(NullSink),
            CancellationToken::new(),
        );
        Fixture {
            _dir: dir,
            presubmit,
        }
    }

    fn cl(paths: &[&str]) -> Changelist {
        Changelist {
            number: 7,
            description: Some("change things".into()),
            files: paths
                .iter()
                .map(|p| ChangedFile::new(*p, FileStatus::Edit))
                .collect(),
        }
    }

    fn fmt_checker() -> CheckerConfig {
        CheckerConfig {
            action: "fmt".into(),
            bin: "//tools/checker.sh".into(),
            fix: true,
            wants_cl_description: false,
        }
    }

    #[tokio::test]
    async fn untriggered_policy_runs_nothing() {
        let fx = fixture(
            &[
                ("tools/checker.sh", OK_CHECKER),
                ("libs/PRESUBMIT", "presubmit { include: \"....rs\" check: \"fmt\" }"),
            ],
            vec![fmt_checker()],
        );
        let results = fx.presubmit.run(&cl(&["libs/readme.txt"])).await.unwrap();
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn triggered_action_check_runs() {
        let fx = fixture(
            &[
                ("tools/checker.sh", OK_CHECKER),
                ("libs/PRESUBMIT", "presubmit { include: \"....rs\" check: \"fmt\" }"),
            ],
            vec![fmt_checker()],
        );
        let results = fx.presubmit.run(&cl(&["libs/a.rs"])).await.unwrap();
        assert_eq!(results.len(), 1);
        assert!(results[0].success);
        assert_eq!(results[0].name, "fmt");
    }

    #[tokio::test]
    async fn unknown_action_becomes_synthetic_failure() {
        let fx = fixture(
            &[("libs/PRESUBMIT", "presubmit { check: \"mystery\" }")],
            vec![],
        );
        let results = fx.presubmit.run(&cl(&["libs/a.rs"])).await.unwrap();
        assert_eq!(results.len(), 1);
        assert!(!results[0].success);
        assert!(results[0].results[0].logs[0]
            .contents
            .contains("unknown check action"));
    }

    #[tokio::test]
    async fn fix_only_skips_checkers_without_fix_support() {
        let no_fix = CheckerConfig {
            action: "lint".into(),
            bin: "//tools/checker.sh".into(),
            fix: false,
            wants_cl_description: false,
        };
        let fx = fixture(
            &[
                ("tools/checker.sh", OK_CHECKER),
                (
                    "libs/PRESUBMIT",
                    "presubmit { check: \"fmt\" check: \"lint\" }",
                ),
            ],
            vec![fmt_checker(), no_fix],
        );
        let fx = Fixture {
            presubmit: fx.presubmit.with_fix_only(true),
            _dir: fx._dir,
        };
        let results = fx.presubmit.run(&cl(&["libs/a.rs"])).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].name, "fmt");
    }

    #[tokio::test]
    async fn description_requiring_check_skipped_without_description() {
        let wants_cl = CheckerConfig {
            action: "desc".into(),
            bin: "//tools/checker.sh".into(),
            fix: false,
            wants_cl_description: true,
        };
        let fx = fixture(
            &[
                ("tools/checker.sh", OK_CHECKER),
                ("libs/PRESUBMIT", "presubmit { check: \"desc\" }"),
            ],
            vec![wants_cl],
        );
        let mut no_desc = cl(&["libs/a.rs"]);
        no_desc.description = None;
        let results = fx.presubmit.run(&no_desc).await.unwrap();
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn check_build_dedupes_across_policies() {
        let fx = fixture(
            &[
                ("tools/ok.sh", OK_TOOL),
                (
                    "BUILDUNIT",
                    "build_unit { name: \"shared\" bin: \"//tools/ok.sh\" }",
                ),
                ("a/PRESUBMIT", "presubmit { check_build: \"//:shared\" }"),
                ("b/PRESUBMIT", "presubmit { check_build: \"//:shared\" }"),
            ],
            vec![],
        );
        let results = fx
            .presubmit
            .run(&cl(&["a/x.rs", "b/y.rs"]))
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].name, "build //:shared");
        assert!(results[0].success);
    }

    #[tokio::test]
    async fn check_test_expands_suites_then_dedupes() {
        let fx = fixture(
            &[
                ("tools/ok.sh", OK_TOOL),
                (
                    "libs/BUILDUNIT",
                    r#"
build_unit { name: "l" bin: "//tools/ok.sh" }
build_test_unit { name: "l_builds" build_unit: "l" }
test_suite { name: "all" test_unit: "l_builds" }
"#,
                ),
                (
                    "libs/PRESUBMIT",
                    "presubmit { check_test: \"//libs:all\" check_test: \"//libs:l_builds\" }",
                ),
            ],
            vec![],
        );
        let results = fx.presubmit.run(&cl(&["libs/a.rs"])).await.unwrap();
        // The suite expands to l_builds; the direct reference dedupes away.
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].name, "test //libs:l_builds");
        assert!(results[0].success);
    }

    #[tokio::test]
    async fn listeners_observe_serial_run() {
        #[derive(Default)]
        struct OrderListener(Mutex<Vec<String>>);
        impl PresubmitListener for OrderListener {
            fn on_presubmit_start(&self, n: usize) {
                self.0.lock().unwrap().push(format!("start {n}"));
            }
            fn on_check_start(&self, name: &str) {
                self.0.lock().unwrap().push(format!("check-start {name}"));
            }
            fn on_check_result(&self, result: &CheckResult) {
                self.0
                    .lock()
                    .unwrap()
                    .push(format!("check-end {}", result.name));
            }
            fn on_presubmit_end(&self, success: bool) {
                self.0.lock().unwrap().push(format!("end {success}"));
            }
        }

        let mut fx = fixture(
            &[
                ("tools/checker.sh", OK_CHECKER),
                ("libs/PRESUBMIT", "presubmit { check: \"fmt\" }"),
            ],
            vec![fmt_checker()],
        );
        let listener = Arc::new(OrderListener::default());
        fx.presubmit.add_listener(Arc::clone(&listener) as Arc<dyn PresubmitListener>);
        fx.presubmit.run(&cl(&["libs/a.rs"])).await.unwrap();
        let events = listener.0.lock().unwrap().clone();
        assert_eq!(
            events,
            vec!["start 1", "check-start fmt", "check-end fmt", "end true"]
        );
    }

    #[tokio::test]
    async fn failing_checker_with_fix_is_applied_in_fix_mode() {
        let fixing_checker = r#"#!/bin/sh
res=""
for a in "$@"; do
  case "$a" in
    --checker-invocation-result=*) res="${a#--checker-invocation-result=}" ;;
  esac
done
cat > "$res" <<'EOF'
{"results": [{"name": "fmt", "success": false, "logs": ["bad format"], "fix": "touch fixed.marker"}]}
EOF
exit 1
"#;
        let fx = fixture(
            &[
                ("tools/checker.sh", fixing_checker),
                ("libs/PRESUBMIT", "presubmit { check: \"fmt\" }"),
            ],
            vec![fmt_checker()],
        );
        let results = fx.presubmit.run(&cl(&["libs/a.rs"])).await.unwrap();
        assert!(!results[0].success);
        let applied = fx.presubmit.apply_fixes(&results).await;
        assert_eq!(applied, vec![("fmt".to_string(), true)]);
        assert!(fx
            .presubmit
            .engine
            .monorepo()
            .root()
            .join("fixed.marker")
            .is_file());
    }
}
