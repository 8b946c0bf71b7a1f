//! Presubmit policy files: per-directory declarations of which checks
//! apply to which path patterns.

use crate::monorepo::Monorepo;
use crate::pathexpr::{ExpressionSet, PathExprError};
use crate::textfile::{self, TextValue};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Conventional policy filename (bare or with the text extension).
pub const POLICY_FILE: &str = "PRESUBMIT";
pub const POLICY_FILE_EXT: &str = "PRESUBMIT.textpb";

#[derive(Debug, Error)]
pub enum PolicyError {
    #[error(transparent)]
    Parse(#[from] textfile::TextFileError),
    #[error(transparent)]
    Expr(#[from] PathExprError),
    #[error("io error reading {}: {}", .0.display(), .1)]
    Io(PathBuf, std::io::Error),
}

pub type Result<T> = std::result::Result<T, PolicyError>;

/// One declared check inside a policy.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CheckDecl {
    /// A checker-tool action looked up in the tool-config registry.
    Action(String),
    /// A build unit reference, deduplicated across triggered policies.
    Build(String),
    /// A test unit reference, expanded through suites then deduplicated.
    Test(String),
}

/// A parsed per-directory presubmit policy.
#[derive(Debug, Clone, Default)]
pub struct PresubmitPolicy {
    /// Root-relative directory the policy file lives in.
    pub dir: String,
    pub include: Vec<String>,
    pub exclude: Vec<String>,
    pub checks: Vec<CheckDecl>,
}

impl PresubmitPolicy {
    /// Probe a directory for a policy file.
    pub fn file_in(dir: &Path) -> Option<PathBuf> {
        for name in [POLICY_FILE, POLICY_FILE_EXT] {
            let candidate = dir.join(name);
            if candidate.is_file() {
                return Some(candidate);
            }
        }
        None
    }

    /// Load the policy declared by a root-relative directory, if any.
    pub fn load(mr: &Monorepo, dir: &str) -> Result<Option<Self>> {
        let Some(file) = Self::file_in(&mr.resolve(dir)) else {
            return Ok(None);
        };
        let content =
            std::fs::read_to_string(&file).map_err(|e| PolicyError::Io(file.clone(), e))?;
        Ok(Some(Self::parse(dir, &content)?))
    }

    /// Parse a policy file's content. Multiple `presubmit` blocks merge in
    /// declaration order.
    pub fn parse(dir: &str, input: &str) -> Result<Self> {
        let msg = textfile::parse(input)?;
        let mut policy = Self {
            dir: dir.to_string(),
            ..Self::default()
        };
        for block in msg.messages("presubmit") {
            for (name, value) in &block.fields {
                let Some(text) = value.as_str() else {
                    // `check_build { build_unit: "x" }` spelling.
                    if let TextValue::Message(m) = value {
                        match name.as_str() {
                            "check_build" => {
                                if let Some(u) = m.string("build_unit") {
                                    policy.checks.push(CheckDecl::Build(u));
                                }
                            }
                            "check_test" => {
                                if let Some(u) = m.string("test_unit") {
                                    policy.checks.push(CheckDecl::Test(u));
                                }
                            }
                            _ => {}
                        }
                    }
                    continue;
                };
                match name.as_str() {
                    "include" => policy.include.push(text.to_string()),
                    "exclude" => policy.exclude.push(text.to_string()),
                    "check" => policy.checks.push(CheckDecl::Action(text.to_string())),
                    "check_build" => policy.checks.push(CheckDecl::Build(text.to_string())),
                    "check_test" => policy.checks.push(CheckDecl::Test(text.to_string())),
                    _ => {}
                }
            }
        }
        Ok(policy)
    }

    /// Compile the include/exclude lists into an expression set rooted at
    /// the policy's directory. An empty include list defaults to `...`.
    pub fn matcher(&self, mr: &Monorepo) -> Result<ExpressionSet> {
        let rel_to = mr.resolve(&self.dir);
        let mut specs: Vec<String> = if self.include.is_empty() {
            vec!["...".to_string()]
        } else {
            self.include.clone()
        };
        specs.extend(self.exclude.iter().map(|e| format!("-{e}")));
        Ok(ExpressionSet::new(mr, &rel_to, &specs)?)
    }
}
