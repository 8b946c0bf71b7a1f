//! Result types shared by the engine, presubmit, and post-submit paths.
//!
//! Every runner lifts its failures into these records rather than losing
//! them: a pipeline always yields one result per intended unit of work.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// A named log blob attached to a result.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamedLog {
    pub name: String,
    pub contents: String,
}

impl NamedLog {
    pub fn new(name: impl Into<String>, contents: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            contents: contents.into(),
        }
    }
}

/// Outcome of building or running one unit.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BuildResult {
    pub name: String,
    pub success: bool,
    /// Name of the failed dependency when the failure was inherited.
    pub cause: Option<String>,
    pub logs: Vec<NamedLog>,
    /// Output artifacts, absolute paths, sorted.
    pub artifacts: Vec<PathBuf>,
}

impl BuildResult {
    pub fn ok(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            success: true,
            ..Self::default()
        }
    }

    pub fn failed(name: impl Into<String>, logs: Vec<NamedLog>) -> Self {
        Self {
            name: name.into(),
            success: false,
            logs,
            ..Self::default()
        }
    }

    /// Inherit a dependency's failure: same logs, cause points at the dep.
    pub fn from_dep_failure(name: impl Into<String>, dep: &BuildResult) -> Self {
        Self {
            name: name.into(),
            success: false,
            cause: Some(dep.name.clone()),
            logs: dep.logs.clone(),
            artifacts: Vec::new(),
        }
    }
}

/// Outcome of a test invocation: one sub-result per executed test target.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TestResult {
    pub name: String,
    pub results: Vec<BuildResult>,
}

impl TestResult {
    pub fn success(&self) -> bool {
        self.results.iter().all(|r| r.success)
    }
}

/// Outcome of one published deliverable.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PublishResult {
    pub name: String,
    pub success: bool,
    pub logs: Vec<NamedLog>,
}

/// Outcome of one presubmit check.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CheckResult {
    pub name: String,
    pub success: bool,
    pub results: Vec<BuildResult>,
    pub logs: Vec<NamedLog>,
    /// Fix command advertised by the checker, when it supports fixes.
    pub fix: Option<String>,
}

impl CheckResult {
    /// Lift an internal error into a synthetic failed check so the
    /// presubmit still yields one result per intended check.
    pub fn fail_check(name: impl Into<String>, error: impl std::fmt::Display) -> Self {
        let name = name.into();
        Self {
            success: false,
            results: vec![BuildResult::failed(
                name.clone(),
                vec![NamedLog::new("error", error.to_string())],
            )],
            name,
            ..Self::default()
        }
    }
}
