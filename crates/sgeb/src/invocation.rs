//! The tool-invocation protocol between the engine and bespoke tool
//! binaries.
//!
//! The engine writes a descriptor file, launches the tool with
//! `--tool-invocation=<descriptor>` and `--tool-invocation-result=<result>`,
//! and reads the result file back after exit. Role-specific sub-messages
//! carry what build, test, publish, cron, and task tools each need.

use crate::results::NamedLog;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const TOOL_INVOCATION_FLAG: &str = "--tool-invocation";
pub const TOOL_INVOCATION_RESULT_FLAG: &str = "--tool-invocation-result";

#[derive(Debug, Error)]
pub enum InvocationError {
    #[error("io error on {}: {}", .0.display(), .1)]
    Io(PathBuf, std::io::Error),
    #[error("bad invocation file {}: {}", .0.display(), .1)]
    Decode(PathBuf, serde_json::Error),
}

pub type Result<T> = std::result::Result<T, InvocationError>;

/// A dependency's artifacts handed to the tool as inputs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactSet {
    /// Name of the unit that produced the files.
    pub unit: String,
    pub files: Vec<PathBuf>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildInvocation {
    /// Absolute directory the tool writes outputs into.
    pub output_dir: PathBuf,
    /// Root-relative stable path of the output (`a/b/c.out`).
    pub output_stable_path: String,
    /// Absolute base directory all outputs live under.
    pub output_base: PathBuf,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestInvocation {}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishInvocation {
    pub base_cl: u64,
    pub ci_result_url: String,
    pub invocation_time: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CronInvocation {}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskInvocation {}

/// The descriptor handed to every tool binary.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolInvocation {
    /// Absolute directory of the unit's declaration file.
    pub build_unit_dir: PathBuf,
    /// Artifacts of built dependencies, in dep declaration order.
    pub inputs: Vec<ArtifactSet>,
    /// Absolute directory the tool writes its log files into.
    pub logs_dir: PathBuf,
    /// Labels attached to every log line the tool emits.
    pub log_labels: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub build: Option<BuildInvocation>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub test: Option<TestInvocation>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub publish: Option<PublishInvocation>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cron: Option<CronInvocation>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task: Option<TaskInvocation>,
}

/// One published deliverable reported by a publish tool.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishOutcome {
    pub name: String,
    pub success: bool,
    pub logs: Vec<NamedLog>,
}

/// What a tool binary writes to the result path before exiting.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolInvocationResult {
    pub success: bool,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub logs: Vec<NamedLog>,
    /// Output artifacts, absolute paths.
    #[serde(default)]
    pub artifacts: Vec<PathBuf>,
    /// Per-deliverable results from publish tools.
    #[serde(default)]
    pub publish_results: Vec<PublishOutcome>,
}

impl ToolInvocation {
    pub fn write(&self, path: &Path) -> Result<()> {
        let data = serde_json::to_vec_pretty(self).expect("descriptor serializes");
        std::fs::write(path, data).map_err(|e| InvocationError::Io(path.to_path_buf(), e))
    }

    pub fn read(path: &Path) -> Result<Self> {
        let data =
            std::fs::read(path).map_err(|e| InvocationError::Io(path.to_path_buf(), e))?;
        serde_json::from_slice(&data).map_err(|e| InvocationError::Decode(path.to_path_buf(), e))
    }
}

impl ToolInvocationResult {
    pub fn write(&self, path: &Path) -> Result<()> {
        let data = serde_json::to_vec_pretty(self).expect("result serializes");
        std::fs::write(path, data).map_err(|e| InvocationError::Io(path.to_path_buf(), e))
    }

    /// Read a result file if the tool produced one.
    pub fn read(path: &Path) -> Result<Option<Self>> {
        let data = match std::fs::read(path) {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(InvocationError::Io(path.to_path_buf(), e)),
        };
        if data.is_empty() {
            return Ok(None);
        }
        serde_json::from_slice(&data)
            .map(Some)
            .map_err(|e| InvocationError::Decode(path.to_path_buf(), e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn descriptor_roundtrips() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("invocation.json");
        let invocation = ToolInvocation {
            build_unit_dir: "/repo/tools/fmt".into(),
            inputs: vec![ArtifactSet {
                unit: "dep".into(),
                files: vec!["/out/dep.bin".into()],
            }],
            logs_dir: "/logs".into(),
            log_labels: vec!["unit=fmt".into()],
            build: Some(BuildInvocation {
                output_dir: "/out/tools/fmt".into(),
                output_stable_path: "tools/fmt/fmt.out".into(),
                output_base: "/out".into(),
            }),
            ..ToolInvocation::default()
        };
        invocation.write(&path).unwrap();
        assert_eq!(ToolInvocation::read(&path).unwrap(), invocation);
    }

    #[test]
    fn missing_result_reads_as_none() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("result.json");
        assert!(ToolInvocationResult::read(&path).unwrap().is_none());
        std::fs::write(&path, "").unwrap();
        assert!(ToolInvocationResult::read(&path).unwrap().is_none());
    }

    #[test]
    fn result_defaults_fill_missing_fields() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("result.json");
        std::fs::write(&path, r#"{"success": true}"#).unwrap();
        let result = ToolInvocationResult::read(&path).unwrap().unwrap();
        assert!(result.success);
        assert!(result.logs.is_empty());
        assert!(result.publish_results.is_empty());
    }
}
