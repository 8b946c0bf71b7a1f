//! Cron driver: runs declared cron units on their frequency, with the
//! last-run time persisted in the KV store.

use crate::engine::{Engine, EngineError};
use crate::kv::{self, KvStore};
use crate::notify::{should_notify, Notification, Notifier};
use chrono::{DateTime, Duration, Utc};
use sge_core::{Label, Unit};
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum CronError {
    #[error(transparent)]
    Kv(#[from] kv::KvError),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error(transparent)]
    Registry(#[from] sge_core::registry::RegistryError),
    #[error(transparent)]
    Label(#[from] sge_core::label::LabelError),
}

pub type Result<T> = std::result::Result<T, CronError>;

pub fn cron_state_key(label: &Label) -> String {
    format!("sge-cron:{}", label.key_form())
}

/// One cron sweep outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronRun {
    pub label: String,
    pub success: bool,
}

/// Walks the registry and runs every cron unit whose interval elapsed.
#[derive(Debug)]
pub struct CronDriver {
    kv: Arc<KvStore>,
    notifier: Arc<Notifier>,
}

impl CronDriver {
    pub fn new(kv: Arc<KvStore>, notifier: Arc<Notifier>) -> Self {
        Self { kv, notifier }
    }

    pub async fn run(&self, engine: &Engine, now: DateTime<Utc>) -> Result<Vec<CronRun>> {
        let registry = engine.registry();
        let mr = engine.monorepo();
        let mut runs = Vec::new();
        for dir in registry.walk("")? {
            let Some(catalog) = registry.catalog(&dir)? else {
                continue;
            };
            for unit in &catalog.units {
                let Unit::Cron(cron) = unit else {
                    continue;
                };
                let label =
                    Label::parse(mr, mr.root(), &format!("//{dir}:{}", cron.name), None)?;
                if !self.due(&label, cron.frequency_minutes, now).await? {
                    continue;
                }
                info!(label = %label, "running cron unit");
                let result = engine.run_cron(&label, &[]).await?;
                self.kv
                    .write(&cron_state_key(&label), &now.to_rfc3339())
                    .await?;
                if !result.success {
                    for notify in &cron.notify {
                        // Cron has no persisted health; prior state is
                        // treated as healthy.
                        if should_notify(notify.policy, true, false) {
                            self.notifier
                                .send(Notification {
                                    to: notify.email.clone(),
                                    subject: format!("cron {label} failed"),
                                    body: result
                                        .logs
                                        .iter()
                                        .map(|l| format!("--- {}\n{}\n", l.name, l.contents))
                                        .collect(),
                                })
                                .await;
                        }
                    }
                }
                runs.push(CronRun {
                    label: label.to_string(),
                    success: result.success,
                });
            }
        }
        Ok(runs)
    }

    async fn due(&self, label: &Label, frequency_minutes: u32, now: DateTime<Utc>) -> Result<bool> {
        let raw = self.kv.read(&cron_state_key(label)).await?;
        if kv::is_unset(&raw) {
            return Ok(true);
        }
        let Ok(last) = DateTime::parse_from_rfc3339(&raw) else {
            warn!(label = %label, value = %raw, "bad cron timestamp, rerunning");
            return Ok(true);
        };
        Ok(now - last.with_timezone(&Utc) >= Duration::minutes(i64::from(frequency_minutes)))
    }
}

#[cfg(test)]
#[cfg(unix)]
mod tests {
    use super::*;
    use crate::config::SystemConfig;
    use crate::engine::EngineOptions;
    use crate::process::NullSink;
    use sge_core::{Monorepo, UnitRegistry};
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;
    use tokio_util::sync::CancellationToken;

    const OK_TOOL: &str = r#"#!/bin/sh
res=""
for a in "$@"; do
  case "$a" in
    --tool-invocation-result=*) res="${a#--tool-invocation-result=}" ;;
  esac
done
echo '{"success": true}' > "$res"
"#;

    struct Fixture {
        dir: TempDir,
        engine: Engine,
        kv: Arc<KvStore>,
        driver: CronDriver,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(sge_core::WORKSPACE_FILE), "").unwrap();
        std::fs::create_dir_all(dir.path().join("tools")).unwrap();
        let tool = dir.path().join("tools/ok.sh");
        std::fs::write(&tool, OK_TOOL).unwrap();
        std::fs::set_permissions(&tool, std::fs::Permissions::from_mode(0o755)).unwrap();
        std::fs::create_dir_all(dir.path().join("jobs")).unwrap();
        std::fs::write(
            dir.path().join("jobs/BUILDUNIT"),
            r#"
cron_unit {
  name: "nightly"
  bin: "//tools/ok.sh"
  config { frequency_minutes: 60 }
}
"#,
        )
        .unwrap();
        let mr = Arc::new(Monorepo::open(dir.path()).unwrap());
        let registry = Arc::new(UnitRegistry::new(mr));
        let scratch = dir.path().join(".scratch");
        let engine = Engine::new(
            registry,
            &SystemConfig::default(),
            scratch,
            Arc::new(NullSink),
            CancellationToken::new(),
            EngineOptions::default(),
        );
        let kv = Arc::new(KvStore::mem());
        let driver = CronDriver::new(Arc::clone(&kv), Arc::new(Notifier::recording()));
        Fixture {
            dir,
            engine,
            kv,
            driver,
        }
    }

    #[tokio::test]
    async fn first_run_executes_and_records_time() {
        let fx = fixture();
        let now = Utc::now();
        let runs = fx.driver.run(&fx.engine, now).await.unwrap();
        assert_eq!(runs.len(), 1);
        assert!(runs[0].success);
        let mr = Monorepo::open(fx.dir.path()).unwrap();
        let label = Label::parse(&mr, fx.dir.path(), "//jobs:nightly", None).unwrap();
        let stored = fx.kv.read(&cron_state_key(&label)).await.unwrap();
        assert!(!kv::is_unset(&stored));
    }

    #[tokio::test]
    async fn within_interval_is_skipped() {
        let fx = fixture();
        let now = Utc::now();
        fx.driver.run(&fx.engine, now).await.unwrap();
        let runs = fx
            .driver
            .run(&fx.engine, now + Duration::minutes(30))
            .await
            .unwrap();
        assert!(runs.is_empty());
        let runs = fx
            .driver
            .run(&fx.engine, now + Duration::minutes(60))
            .await
            .unwrap();
        assert_eq!(runs.len(), 1);
    }
}
