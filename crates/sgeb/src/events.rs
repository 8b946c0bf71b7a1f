//! Parser for the delegate build tool's event stream.
//!
//! The delegate writes a stream of varint-length-prefixed JSON events; we
//! consume a fixed subset of them: target configuration and completion,
//! test results, named file sets (depsets), action completions, and
//! aborts. The parser is total: unknown events are skipped, missing
//! optional fields default, and an empty stream yields an empty log.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use tracing::warn;

/// A file reference carried by an event.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct FileRef {
    pub name: String,
    pub uri: String,
}

impl FileRef {
    /// Local filesystem path: the `file://` URI when present, else the
    /// stable name.
    pub fn local_path(&self) -> &str {
        self.uri.strip_prefix("file://").unwrap_or(if self.uri.is_empty() {
            &self.name
        } else {
            &self.uri
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct TargetId {
    pub label: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct NamedSetId {
    pub id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PatternId {
    pub pattern: Vec<String>,
}

/// Event identity: exactly one of the optional sub-ids is set by the
/// delegate; we tolerate any combination.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EventId {
    pub target_configured: Option<TargetId>,
    pub target_completed: Option<TargetId>,
    pub test_result: Option<TargetId>,
    pub named_set: Option<NamedSetId>,
    pub action_completed: Option<TargetId>,
    pub configured_label: Option<TargetId>,
    pub pattern: Option<PatternId>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TargetConfigured {
    pub target_kind: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct OutputGroup {
    pub name: String,
    pub file_sets: Vec<NamedSetId>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TargetCompleted {
    pub success: bool,
    pub output_group: Vec<OutputGroup>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TestResultPayload {
    pub status: String,
    pub test_action_output: Vec<FileRef>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct NamedSetOfFiles {
    pub files: Vec<FileRef>,
    pub file_sets: Vec<NamedSetId>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FailureDetail {
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ActionExecuted {
    pub success: bool,
    pub stdout: Option<FileRef>,
    pub stderr: Option<FileRef>,
    pub failure_detail: Option<FailureDetail>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Aborted {
    pub description: String,
}

/// One event off the stream: an id, child ids, and whichever payload the
/// delegate attached.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BuildEvent {
    pub id: EventId,
    pub children: Vec<EventId>,
    pub configured: Option<TargetConfigured>,
    pub completed: Option<TargetCompleted>,
    pub test_result: Option<TestResultPayload>,
    pub named_set_of_files: Option<NamedSetOfFiles>,
    pub action: Option<ActionExecuted>,
    pub aborted: Option<Aborted>,
}

/// Per-test status, parsed from the delegate's status string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TestStatus {
    Passed,
    Failed,
    Flaky,
    Timeout,
    Incomplete,
    NoStatus,
}

impl TestStatus {
    pub fn parse(s: &str) -> Self {
        match s {
            "PASSED" => Self::Passed,
            "FAILED" => Self::Failed,
            "FLAKY" => Self::Flaky,
            "TIMEOUT" => Self::Timeout,
            "INCOMPLETE" => Self::Incomplete,
            _ => Self::NoStatus,
        }
    }

    pub fn passed(&self) -> bool {
        matches!(self, Self::Passed | Self::Flaky)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Passed => "PASSED",
            Self::Failed => "FAILED",
            Self::Flaky => "FLAKY",
            Self::Timeout => "TIMEOUT",
            Self::Incomplete => "INCOMPLETE",
            Self::NoStatus => "NO_STATUS",
        }
    }
}

/// A failure's evidence: file references plus the delegate's message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FailureLog {
    pub files: Vec<FileRef>,
    pub message: String,
}

/// Outcome extracted for one completed target.
#[derive(Debug, Clone, Default)]
pub struct TargetOutcome {
    pub label: String,
    pub success: bool,
    /// Flattened default-output-group artifacts, sorted by stable path.
    pub artifacts: Vec<FileRef>,
    pub failures: Vec<FailureLog>,
}

/// Outcome extracted for one test label.
#[derive(Debug, Clone)]
pub struct TestOutcome {
    pub label: String,
    pub status: TestStatus,
    /// `test.log` output references only.
    pub logs: Vec<FileRef>,
}

/// An aborted pattern: the originating pattern string and the reason.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatternAbort {
    pub pattern: String,
    pub description: String,
}

/// The decoded event stream plus the queries the engine runs over it.
#[derive(Debug, Clone, Default)]
pub struct EventLog {
    pub events: Vec<BuildEvent>,
}

fn read_varint(data: &[u8], pos: &mut usize) -> Option<u64> {
    let mut value: u64 = 0;
    let mut shift = 0u32;
    loop {
        let byte = *data.get(*pos)?;
        *pos += 1;
        value |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Some(value);
        }
        shift += 7;
        if shift >= 64 {
            return None;
        }
    }
}

fn write_varint(out: &mut Vec<u8>, mut value: u64) {
    loop {
        let mut byte = (value & 0x7f) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
        }
        out.push(byte);
        if value == 0 {
            return;
        }
    }
}

impl EventLog {
    /// Decode a whole stream. Undecodable frames and trailing garbage are
    /// skipped with a warning; the parser never fails on content.
    pub fn parse(data: &[u8]) -> Self {
        let mut events = Vec::new();
        let mut pos = 0usize;
        while pos < data.len() {
            let Some(len) = read_varint(data, &mut pos) else {
                warn!(offset = pos, "truncated varint in event stream, stopping");
                break;
            };
            let len = len as usize;
            let Some(frame) = data.get(pos..pos + len) else {
                warn!(offset = pos, "truncated frame in event stream, stopping");
                break;
            };
            pos += len;
            match serde_json::from_slice::<BuildEvent>(frame) {
                Ok(event) => events.push(event),
                Err(e) => warn!(error = %e, "skipping undecodable event"),
            }
        }
        Self { events }
    }

    /// Encode events back into the framed form. Fixture builder for tests
    /// and the fake delegate.
    pub fn encode(events: &[BuildEvent]) -> Vec<u8> {
        let mut out = Vec::new();
        for event in events {
            let frame = serde_json::to_vec(event).expect("event serializes");
            write_varint(&mut out, frame.len() as u64);
            out.extend_from_slice(&frame);
        }
        out
    }

    /// Labels whose configured kind marks them as test rules
    /// (suffix-matched, e.g. `go_test rule`).
    pub fn test_rule_labels(&self) -> HashSet<String> {
        self.events
            .iter()
            .filter_map(|e| {
                let id = e.id.target_configured.as_ref()?;
                let kind = &e.configured.as_ref()?.target_kind;
                kind.ends_with("test rule").then(|| id.label.clone())
            })
            .collect()
    }

    fn depsets(&self) -> HashMap<&str, &NamedSetOfFiles> {
        self.events
            .iter()
            .filter_map(|e| {
                let id = e.id.named_set.as_ref()?;
                let set = e.named_set_of_files.as_ref()?;
                Some((id.id.as_str(), set))
            })
            .collect()
    }

    /// Flatten depset roots into their files: DFS with a visited set so a
    /// DAG emits each file exactly once, sorted by stable path.
    pub fn flatten_file_sets(&self, roots: &[NamedSetId]) -> Vec<FileRef> {
        let depsets = self.depsets();
        let mut visited: HashSet<&str> = HashSet::new();
        let mut stack: Vec<&str> = roots.iter().map(|r| r.id.as_str()).collect();
        let mut files: Vec<FileRef> = Vec::new();
        let mut seen_files: HashSet<String> = HashSet::new();
        while let Some(id) = stack.pop() {
            if !visited.insert(id) {
                continue;
            }
            let Some(set) = depsets.get(id) else {
                continue;
            };
            for file in &set.files {
                if seen_files.insert(file.local_path().to_string()) {
                    files.push(file.clone());
                }
            }
            for child in &set.file_sets {
                stack.push(child.id.as_str());
            }
        }
        files.sort_by(|a, b| a.local_path().cmp(b.local_path()));
        files
    }

    fn action_for(&self, label: &str) -> Option<&BuildEvent> {
        self.events.iter().find(|e| {
            e.id.action_completed
                .as_ref()
                .is_some_and(|id| id.label == label)
                && e.action.is_some()
        })
    }

    fn abort_for(&self, label: &str) -> Option<&Aborted> {
        self.events.iter().find_map(|e| {
            let id = e.id.configured_label.as_ref()?;
            (id.label == label).then_some(e.aborted.as_ref())?
        })
    }

    /// Chase a failed target's children for the cause: action completions
    /// contribute stderr/stdout references and the failure-detail message;
    /// aborted configured labels contribute their description.
    fn chase_failure(&self, completed: &BuildEvent) -> Vec<FailureLog> {
        let mut failures = Vec::new();
        for child in &completed.children {
            if let Some(action_id) = &child.action_completed {
                if let Some(event) = self.action_for(&action_id.label) {
                    let action = event.action.as_ref().expect("filtered on action");
                    let mut files = Vec::new();
                    if let Some(stderr) = &action.stderr {
                        files.push(stderr.clone());
                    }
                    if let Some(stdout) = &action.stdout {
                        files.push(stdout.clone());
                    }
                    failures.push(FailureLog {
                        files,
                        message: action
                            .failure_detail
                            .as_ref()
                            .map(|d| d.message.clone())
                            .unwrap_or_default(),
                    });
                }
            }
            if let Some(configured) = &child.configured_label {
                if let Some(aborted) = self.abort_for(&configured.label) {
                    failures.push(FailureLog {
                        files: Vec::new(),
                        message: aborted.description.clone(),
                    });
                }
            }
        }
        failures
    }

    /// Outcome for one target label, or None when the stream never
    /// completed it.
    pub fn target_outcome(&self, label: &str) -> Option<TargetOutcome> {
        let event = self.events.iter().find(|e| {
            e.id.target_completed
                .as_ref()
                .is_some_and(|id| id.label == label)
                && e.completed.is_some()
        })?;
        let completed = event.completed.as_ref().expect("filtered on completed");
        let outcome = if completed.success {
            let roots: Vec<NamedSetId> = completed
                .output_group
                .iter()
                .flat_map(|g| g.file_sets.iter().cloned())
                .collect();
            TargetOutcome {
                label: label.to_string(),
                success: true,
                artifacts: self.flatten_file_sets(&roots),
                failures: Vec::new(),
            }
        } else {
            TargetOutcome {
                label: label.to_string(),
                success: false,
                artifacts: Vec::new(),
                failures: self.chase_failure(event),
            }
        };
        Some(outcome)
    }

    /// All test outcomes in stream order, output filtered to `test.log`.
    pub fn test_outcomes(&self) -> Vec<TestOutcome> {
        self.events
            .iter()
            .filter_map(|e| {
                let id = e.id.test_result.as_ref()?;
                let payload = e.test_result.as_ref()?;
                let logs = payload
                    .test_action_output
                    .iter()
                    .filter(|f| f.name == "test.log" || f.name.ends_with("/test.log"))
                    .cloned()
                    .collect();
                Some(TestOutcome {
                    label: id.label.clone(),
                    status: TestStatus::parse(&payload.status),
                    logs,
                })
            })
            .collect()
    }

    /// Aborts attributed to originating patterns: name is the joined
    /// pattern, logs carry the description.
    pub fn aborted_patterns(&self) -> Vec<PatternAbort> {
        self.events
            .iter()
            .filter_map(|e| {
                let id = e.id.pattern.as_ref()?;
                let aborted = e.aborted.as_ref()?;
                Some(PatternAbort {
                    pattern: id.pattern.join(" "),
                    description: aborted.description.clone(),
                })
            })
            .collect()
    }
}
