//! Auto-publisher: runs `auto_publish` publish units after changes land
//! and tracks their health in the KV store.
//!
//! Failure emails are rate-limited through `last_email_time` so a unit
//! broken overnight pages once, not once per tick.

use crate::engine::{Engine, EngineError};
use crate::kv::{self, KvStore};
use crate::notify::{Notification, Notifier};
use crate::results::PublishResult;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sge_core::{Label, Unit};
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

/// Minimum gap between failure emails for one unit.
pub const EMAIL_INTERVAL_HOURS: i64 = 24;

#[derive(Debug, Error)]
pub enum AutoPublishError {
    #[error(transparent)]
    Kv(#[from] kv::KvError),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error(transparent)]
    Registry(#[from] sge_core::registry::RegistryError),
    #[error(transparent)]
    Label(#[from] sge_core::label::LabelError),
}

pub type Result<T> = std::result::Result<T, AutoPublishError>;

/// Persistent per-unit publish health. Unknown (legacy) fields on read
/// are ignored and treated as absent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PublishState {
    pub healthy: bool,
    pub last_email_time: Option<DateTime<Utc>>,
}

pub fn publish_state_key(label: &Label) -> String {
    format!("sge-publish:{}", label.key_form())
}

/// Drives every auto-publish unit once per invocation.
#[derive(Debug)]
pub struct AutoPublisher {
    kv: Arc<KvStore>,
    notifier: Arc<Notifier>,
}

impl AutoPublisher {
    pub fn new(kv: Arc<KvStore>, notifier: Arc<Notifier>) -> Self {
        Self { kv, notifier }
    }

    /// Publish every `auto_publish` unit and record health transitions.
    /// Returns each unit's results keyed by label.
    pub async fn run(
        &self,
        engine: &Engine,
        now: DateTime<Utc>,
    ) -> Result<Vec<(String, Vec<PublishResult>)>> {
        let registry = engine.registry();
        let mr = engine.monorepo();
        let mut all = Vec::new();
        for dir in registry.walk("")? {
            let Some(catalog) = registry.catalog(&dir)? else {
                continue;
            };
            for unit in &catalog.units {
                let Unit::Publish(publish) = unit else {
                    continue;
                };
                if !publish.auto_publish {
                    continue;
                }
                let label = Label::parse(
                    mr,
                    mr.root(),
                    &format!("//{dir}:{}", publish.name),
                    None,
                )?;
                info!(label = %label, "auto-publishing");
                // One broken unit must not starve the sweep; engine errors
                // lift into a failed result for this unit.
                let results = match engine.publish(&label, &[]).await {
                    Ok(results) => results,
                    Err(e) => {
                        warn!(label = %label, error = %e, "auto-publish errored");
                        vec![PublishResult {
                            name: publish.name.clone(),
                            success: false,
                            logs: vec![crate::results::NamedLog::new(
                                "error",
                                e.to_string(),
                            )],
                        }]
                    }
                };
                let success = results.iter().all(|r| r.success);
                self.record(&label, publish, success, &results, now).await;
                all.push((label.to_string(), results));
            }
        }
        Ok(all)
    }

    async fn record(
        &self,
        label: &Label,
        unit: &sge_core::PublishUnit,
        success: bool,
        results: &[PublishResult],
        now: DateTime<Utc>,
    ) {
        let key = publish_state_key(label);
        let mut state = match self.kv.read(&key).await {
            Ok(raw) if !kv::is_unset(&raw) => {
                serde_json::from_str(&raw).unwrap_or_default()
            }
            Ok(_) => PublishState {
                healthy: true,
                ..PublishState::default()
            },
            Err(e) => {
                warn!(label = %label, error = %e, "publish state read failed, assuming healthy");
                PublishState {
                    healthy: true,
                    ..PublishState::default()
                }
            }
        };

        let mut changed = state.healthy != success;
        state.healthy = success;
        if !success && self.should_email(&state, now) {
            let failed: Vec<&str> = results
                .iter()
                .filter(|r| !r.success)
                .map(|r| r.name.as_str())
                .collect();
            if let Some(ps) = &unit.post_submit {
                for notify in &ps.notify {
                    self.notifier
                        .send(Notification {
                            to: notify.email.clone(),
                            subject: format!("auto-publish {label} failed"),
                            body: format!("failed deliverables: {}\n", failed.join(", ")),
                        })
                        .await;
                }
            }
            state.last_email_time = Some(now);
            changed = true;
        }

        if changed {
            let serialized = serde_json::to_string(&state).expect("state serializes");
            if let Err(e) = self.kv.write(&key, &serialized).await {
                warn!(label = %label, error = %e, "publish state write failed");
            }
        }
    }

    fn should_email(&self, state: &PublishState, now: DateTime<Utc>) -> bool {
        state
            .last_email_time
            .map_or(true, |t| now - t >= Duration::hours(EMAIL_INTERVAL_HOURS))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legacy_fields_are_ignored_on_read() {
        let raw = r#"{"healthy": true, "last_publish_ms": 123, "last_email_ms": 456}"#;
        let state: PublishState = serde_json::from_str(raw).unwrap();
        assert!(state.healthy);
        assert!(state.last_email_time.is_none());
    }

    #[test]
    fn email_rate_limit() {
        let publisher = AutoPublisher::new(
            Arc::new(KvStore::mem()),
            Arc::new(Notifier::recording()),
        );
        let now = Utc::now();
        let fresh = PublishState {
            healthy: false,
            last_email_time: Some(now - Duration::hours(1)),
        };
        assert!(!publisher.should_email(&fresh, now));
        let stale = PublishState {
            healthy: false,
            last_email_time: Some(now - Duration::hours(EMAIL_INTERVAL_HOURS)),
        };
        assert!(publisher.should_email(&stale, now));
        assert!(publisher.should_email(&PublishState::default(), now));
    }
}
