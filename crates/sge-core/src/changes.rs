//! Changelist views: the per-file change records presubmit and the
//! post-submit controller consume.

use serde::{Deserialize, Serialize};

/// What happened to a file in a changelist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FileStatus {
    Create,
    Edit,
    Delete,
}

impl FileStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "CREATE",
            Self::Edit => "EDIT",
            Self::Delete => "DELETE",
        }
    }
}

/// One changed file, root-relative.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangedFile {
    pub path: String,
    pub status: FileStatus,
}

impl ChangedFile {
    pub fn new(path: impl Into<String>, status: FileStatus) -> Self {
        Self {
            path: path.into(),
            status,
        }
    }
}

/// A changelist view: id, optional description, changed files.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Changelist {
    /// Changelist number; 0 means unknown/default.
    pub number: u64,
    pub description: Option<String>,
    pub files: Vec<ChangedFile>,
}

impl Changelist {
    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.files.iter().map(|f| f.path.as_str())
    }
}
