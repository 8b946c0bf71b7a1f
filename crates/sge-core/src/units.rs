//! Unit declarations: the typed catalog parsed from a directory's
//! `BUILDUNIT` file.
//!
//! A unit is a named runnable thing attached to a directory: a delegate
//! build target, an ad-hoc tool binary, a test, a composite suite, a
//! publish pipeline, a cron job, or a one-shot task. Validation happens at
//! parse time; a catalog that loads is internally consistent.

use crate::textfile::{self, TextMessage};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Conventional declaration filename (bare or with the text extension).
pub const UNIT_FILE: &str = "BUILDUNIT";
pub const UNIT_FILE_EXT: &str = "BUILDUNIT.textpb";

#[derive(Debug, Error)]
pub enum UnitError {
    #[error(transparent)]
    Parse(#[from] textfile::TextFileError),
    #[error("unit {0}: missing name")]
    MissingName(String),
    #[error("unit {0}: target and bin are mutually exclusive")]
    TargetAndBin(String),
    #[error("unit {0}: needs a target or a bin")]
    NoTargetOrBin(String),
    #[error("units named {0} appear twice: two units must not share the same name")]
    SameName(String),
    #[error("unit {0}: delegate-target units must not declare deps")]
    TargetWithDeps(String),
    #[error("unit {0}: delegate-target units must not declare env_vars")]
    TargetWithEnv(String),
    #[error("unit {0}: needs (bin, build_unit) or nested publish_unit entries, not both")]
    PublishShape(String),
    #[error("unit {0}: trigger_paths and frequency are mutually exclusive")]
    TriggerPathsAndFrequency(String),
    #[error("unit {0}: bad frequency {1:?}")]
    BadFrequency(String, String),
    #[error("unit {0}: missing bin")]
    MissingBin(String),
}

pub type Result<T> = std::result::Result<T, UnitError>;

/// Notification routing policy for post-submit and cron results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NotifyPolicy {
    #[default]
    NotifyNever,
    NotifyOnFailure,
    NotifyOnFailureAndRecovery,
    NotifyAlways,
}

impl NotifyPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotifyNever => "NOTIFY_NEVER",
            Self::NotifyOnFailure => "NOTIFY_ON_FAILURE",
            Self::NotifyOnFailureAndRecovery => "NOTIFY_ON_FAILURE_AND_RECOVERY",
            Self::NotifyAlways => "NOTIFY_ALWAYS",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "NOTIFY_NEVER" => Some(Self::NotifyNever),
            "NOTIFY_ON_FAILURE" => Some(Self::NotifyOnFailure),
            "NOTIFY_ON_FAILURE_AND_RECOVERY" => Some(Self::NotifyOnFailureAndRecovery),
            "NOTIFY_ALWAYS" => Some(Self::NotifyAlways),
            _ => None,
        }
    }
}

/// A notification target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notify {
    pub email: String,
    pub policy: NotifyPolicy,
}

/// Post-submit configuration attached to publish and task units.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostSubmit {
    /// Path expressions that trigger a run when matched by a changed file.
    pub trigger_paths: Vec<String>,
    /// `HH:00` UTC daily cadence, exclusive with trigger_paths.
    pub daily_at_utc: Option<String>,
    pub notify: Vec<Notify>,
    /// Per-unit task timeout override, seconds.
    pub timeout_sec: Option<u64>,
    /// Debug flag: trigger on every controller tick.
    pub trigger_always_for_testing: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildUnit {
    pub name: String,
    /// Delegate build-tool target.
    pub target: Option<String>,
    /// Ad-hoc tool binary: a label of another build unit or a checked-in
    /// executable path.
    pub bin: Option<String>,
    pub args: Vec<String>,
    pub deps: Vec<String>,
    pub env_vars: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestUnit {
    pub name: String,
    pub targets: Vec<String>,
    pub bin: Option<String>,
    pub args: Vec<String>,
    pub deps: Vec<String>,
}

/// A build whose success is the test: passing means building succeeds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildTestUnit {
    pub name: String,
    pub build_unit: String,
}

/// A composite of test units; a `...` member recurses over the subtree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestSuite {
    pub name: String,
    pub test_units: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishUnit {
    pub name: String,
    pub bin: Option<String>,
    pub build_units: Vec<String>,
    /// Nested publish units, exclusive with (bin, build_units).
    pub publish_units: Vec<String>,
    pub post_submit: Option<PostSubmit>,
    pub auto_publish: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CronUnit {
    pub name: String,
    pub bin: String,
    pub args: Vec<String>,
    pub frequency_minutes: u32,
    pub notify: Vec<Notify>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskUnit {
    pub name: String,
    pub bin: String,
    pub args: Vec<String>,
    pub post_submit: Option<PostSubmit>,
}

/// Any declared unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Unit {
    Build(BuildUnit),
    Test(TestUnit),
    BuildTest(BuildTestUnit),
    Suite(TestSuite),
    Publish(PublishUnit),
    Cron(CronUnit),
    Task(TaskUnit),
}

impl Unit {
    pub fn name(&self) -> &str {
        match self {
            Self::Build(u) => &u.name,
            Self::Test(u) => &u.name,
            Self::BuildTest(u) => &u.name,
            Self::Suite(u) => &u.name,
            Self::Publish(u) => &u.name,
            Self::Cron(u) => &u.name,
            Self::Task(u) => &u.name,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Build(_) => "build_unit",
            Self::Test(_) => "test_unit",
            Self::BuildTest(_) => "build_test_unit",
            Self::Suite(_) => "test_suite",
            Self::Publish(_) => "publish_unit",
            Self::Cron(_) => "cron_unit",
            Self::Task(_) => "task_unit",
        }
    }

    /// Post-submit block, for the kinds that carry one.
    pub fn post_submit(&self) -> Option<&PostSubmit> {
        match self {
            Self::Publish(u) => u.post_submit.as_ref(),
            Self::Task(u) => u.post_submit.as_ref(),
            _ => None,
        }
    }
}

/// Every unit declared by one directory's `BUILDUNIT` file.
#[derive(Debug, Clone, Default)]
pub struct UnitCatalog {
    /// Root-relative directory the catalog belongs to.
    pub dir: String,
    pub units: Vec<Unit>,
}

impl UnitCatalog {
    /// Parse and validate a declaration file's content.
    pub fn parse(dir: &str, input: &str) -> Result<Self> {
        let msg = textfile::parse(input)?;
        let mut units = Vec::new();
        for (name, value) in &msg.fields {
            let crate::textfile::TextValue::Message(body) = value else {
                continue;
            };
            let unit = match name.as_str() {
                "build_unit" => Unit::Build(parse_build_unit(body)?),
                "test_unit" => Unit::Test(parse_test_unit(body)?),
                "build_test_unit" => Unit::BuildTest(parse_build_test_unit(body)?),
                "test_suite" => Unit::Suite(parse_test_suite(body)?),
                "publish_unit" => Unit::Publish(parse_publish_unit(body)?),
                "cron_unit" => Unit::Cron(parse_cron_unit(body)?),
                "task_unit" => Unit::Task(parse_task_unit(body)?),
                _ => continue,
            };
            units.push(unit);
        }

        for (i, unit) in units.iter().enumerate() {
            if units[..i].iter().any(|u| u.name() == unit.name()) {
                return Err(UnitError::SameName(unit.name().to_string()));
            }
        }

        Ok(Self {
            dir: dir.to_string(),
            units,
        })
    }

    pub fn get(&self, name: &str) -> Option<&Unit> {
        self.units.iter().find(|u| u.name() == name)
    }
}

fn required_name(body: &TextMessage, kind: &str) -> Result<String> {
    body.string("name")
        .filter(|s| !s.is_empty())
        .ok_or_else(|| UnitError::MissingName(kind.to_string()))
}

fn parse_notify_list(body: &TextMessage) -> Vec<Notify> {
    body.messages("notify")
        .into_iter()
        .filter_map(|n| {
            let email = n.string("email")?;
            let policy = n
                .string("policy")
                .and_then(|p| NotifyPolicy::parse(&p))
                .unwrap_or_default();
            Some(Notify { email, policy })
        })
        .collect()
}

fn parse_post_submit(name: &str, body: &TextMessage) -> Result<PostSubmit> {
    let trigger_paths = body.strings("trigger_paths");
    let daily_at_utc = body
        .message("frequency")
        .and_then(|f| f.string("daily_at_utc"));
    if !trigger_paths.is_empty() && daily_at_utc.is_some() {
        return Err(UnitError::TriggerPathsAndFrequency(name.to_string()));
    }
    if let Some(hhmm) = &daily_at_utc {
        let hour = hhmm
            .strip_suffix(":00")
            .and_then(|h| h.parse::<u32>().ok())
            .filter(|h| *h < 24 && hhmm.len() == 5);
        if hour.is_none() {
            return Err(UnitError::BadFrequency(name.to_string(), hhmm.clone()));
        }
    }
    Ok(PostSubmit {
        trigger_paths,
        daily_at_utc,
        notify: parse_notify_list(body),
        timeout_sec: body.int("timeout_sec").map(|v| v.max(0) as u64),
        trigger_always_for_testing: body.bool("trigger_always_for_testing").unwrap_or(false),
    })
}

fn parse_build_unit(body: &TextMessage) -> Result<BuildUnit> {
    let name = required_name(body, "build_unit")?;
    let target = body.string("target");
    let bin = body.string("bin");
    let deps = body.strings("deps");
    let env_vars = body.strings("env_vars");
    match (&target, &bin) {
        (Some(_), Some(_)) => return Err(UnitError::TargetAndBin(name)),
        (None, None) => return Err(UnitError::NoTargetOrBin(name)),
        _ => {}
    }
    if target.is_some() {
        if !deps.is_empty() {
            return Err(UnitError::TargetWithDeps(name));
        }
        if !env_vars.is_empty() {
            return Err(UnitError::TargetWithEnv(name));
        }
    }
    Ok(BuildUnit {
        name,
        target,
        bin,
        args: body.strings("args"),
        deps,
        env_vars,
    })
}

fn parse_test_unit(body: &TextMessage) -> Result<TestUnit> {
    let name = required_name(body, "test_unit")?;
    let targets = body.strings("target");
    let bin = body.string("bin");
    let deps = body.strings("deps");
    if !targets.is_empty() && bin.is_some() {
        return Err(UnitError::TargetAndBin(name));
    }
    if targets.is_empty() && bin.is_none() {
        return Err(UnitError::NoTargetOrBin(name));
    }
    if !targets.is_empty() && !deps.is_empty() {
        return Err(UnitError::TargetWithDeps(name));
    }
    Ok(TestUnit {
        name,
        targets,
        bin,
        args: body.strings("args"),
        deps,
    })
}

fn parse_build_test_unit(body: &TextMessage) -> Result<BuildTestUnit> {
    let name = required_name(body, "build_test_unit")?;
    let build_unit = body
        .string("build_unit")
        .ok_or_else(|| UnitError::MissingBin(name.clone()))?;
    Ok(BuildTestUnit { name, build_unit })
}

fn parse_test_suite(body: &TextMessage) -> Result<TestSuite> {
    let name = required_name(body, "test_suite")?;
    Ok(TestSuite {
        name,
        test_units: body.strings("test_unit"),
    })
}

fn parse_publish_unit(body: &TextMessage) -> Result<PublishUnit> {
    let name = required_name(body, "publish_unit")?;
    let bin = body.string("bin");
    let build_units = body.strings("build_unit");
    let publish_units = body.strings("publish_unit");
    let direct = bin.is_some();
    let nested = !publish_units.is_empty();
    if direct == nested {
        return Err(UnitError::PublishShape(name));
    }
    let post_submit = body
        .message("post_submit")
        .map(|ps| parse_post_submit(&name, ps))
        .transpose()?;
    Ok(PublishUnit {
        name,
        bin,
        build_units,
        publish_units,
        post_submit,
        auto_publish: body.bool("auto_publish").unwrap_or(false),
    })
}

fn parse_cron_unit(body: &TextMessage) -> Result<CronUnit> {
    let name = required_name(body, "cron_unit")?;
    let bin = body
        .string("bin")
        .ok_or_else(|| UnitError::MissingBin(name.clone()))?;
    let config = body.message("config");
    let frequency_minutes = config
        .and_then(|c| c.int("frequency_minutes"))
        .unwrap_or(0)
        .max(0) as u32;
    let notify = config.map(parse_notify_list).unwrap_or_default();
    Ok(CronUnit {
        name,
        bin,
        args: body.strings("args"),
        frequency_minutes,
        notify,
    })
}

fn parse_task_unit(body: &TextMessage) -> Result<TaskUnit> {
    let name = required_name(body, "task_unit")?;
    let bin = body
        .string("bin")
        .ok_or_else(|| UnitError::MissingBin(name.clone()))?;
    let post_submit = body
        .message("post_submit")
        .map(|ps| parse_post_submit(&name, ps))
        .transpose()?;
    Ok(TaskUnit {
        name,
        bin,
        args: body.strings("args"),
        post_submit,
    })
}
