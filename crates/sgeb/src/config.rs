//! System configuration: `sge.toml` at the monorepo root.
//!
//! Carries the environment name, the delegate build-tool command, the CI
//! fleet endpoint, SMTP settings, and the checker-tool registry presubmit
//! actions resolve through. A missing file yields defaults, which is what
//! tests run against.

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Conventional config filename at the monorepo root.
pub const CONFIG_FILE: &str = "sge.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {CONFIG_FILE}: {0}")]
    Read(#[from] std::io::Error),
    #[error("failed to parse {CONFIG_FILE}: {0}")]
    Parse(#[from] toml::de::Error),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DelegateConfig {
    /// Delegate build-tool command name or path.
    pub command: String,
    /// Extra arguments prepended to every delegate invocation.
    pub extra_args: Vec<String>,
}

impl Default for DelegateConfig {
    fn default() -> Self {
        Self {
            command: "bazel".to_string(),
            extra_args: Vec::new(),
        }
    }
}

/// CI fleet endpoint for remote dispatch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CiConfig {
    pub endpoint: String,
    pub username: String,
    pub token: String,
}

/// SMTP settings for notifications.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MailConfig {
    pub smtp_host: String,
    pub from: String,
}

/// The external key-value store command (the VCS binary), invoked as
/// `<command> read <key>` / `<command> write <key> <value>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KvConfig {
    pub command: String,
}

impl Default for KvConfig {
    fn default() -> Self {
        Self {
            command: "sge-kv".to_string(),
        }
    }
}

/// One checker tool the presubmit `check <action>` form resolves to.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckerConfig {
    /// Action name referenced by policy files.
    pub action: String,
    /// Checker binary: a build-unit label or a checked-in path.
    pub bin: String,
    /// Whether the tool can apply fixes (fix-only mode filter).
    pub fix: bool,
    /// Whether the tool needs the CL description to run.
    pub wants_cl_description: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemConfig {
    /// Environment name baked into KV-store keys (`dev`, `prod`, ...).
    pub environment: String,
    pub delegate: DelegateConfig,
    pub ci: CiConfig,
    pub mail: MailConfig,
    pub kv: KvConfig,
    pub checks: Vec<CheckerConfig>,
}

impl SystemConfig {
    /// Load the config from the monorepo root; a missing file is the
    /// default config.
    pub fn load(root: &Path) -> Result<Self> {
        let path = root.join(CONFIG_FILE);
        let content = match std::fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Self::default());
            }
            Err(e) => return Err(e.into()),
        };
        Ok(toml::from_str(&content)?)
    }

    /// Look up a checker tool by action name.
    pub fn checker(&self, action: &str) -> Option<&CheckerConfig> {
        self.checks.iter().find(|c| c.action == action)
    }
}
