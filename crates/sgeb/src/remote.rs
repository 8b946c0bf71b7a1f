//! Remote dispatcher: hands unit work to the external CI fleet.
//!
//! Each dispatch is one authenticated HTTP POST with URL-encoded fields.
//! Arguments are joined on `;`, so an argument containing the separator is
//! rejected up front. TLS verification is intentionally disabled: the
//! fleet sits behind an internal-IP reverse proxy whose certificate never
//! matches the address we dial.

use crate::config::CiConfig;
use serde::{Deserialize, Serialize};
use sge_core::Label;
use thiserror::Error;
use tracing::info;

/// Separator the fleet splits the args field on.
pub const ARG_SEPARATOR: char = ';';

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("argument {0:?} contains the {ARG_SEPARATOR:?} separator")]
    BadArgument(String),
    #[error("dispatch failed with HTTP {0}")]
    Status(u16),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
}

pub type Result<T> = std::result::Result<T, RemoteError>;

/// The action the fleet should perform on the label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RemoteAction {
    Build,
    Test,
    Publish,
    Task,
}

impl RemoteAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Build => "build",
            Self::Test => "test",
            Self::Publish => "publish",
            Self::Task => "task",
        }
    }
}

/// Per-dispatch options.
#[derive(Debug, Clone, Default)]
pub struct DispatchOptions {
    pub base_cl: u64,
    /// Pending-change identifier, when dispatching presubmit work.
    pub change: Option<String>,
    /// Task key the worker writes its task record under.
    pub task_key: Option<String>,
    pub log_level: String,
    pub invoker: String,
    pub invoker_url: String,
    pub args: Vec<String>,
}

/// Client for the CI fleet endpoint.
#[derive(Debug, Clone)]
pub struct RemoteDispatcher {
    client: reqwest::Client,
    config: CiConfig,
}

impl RemoteDispatcher {
    pub fn new(config: CiConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            // Internal reverse proxy; the cert never matches.
            .danger_accept_invalid_certs(true)
            .build()?;
        Ok(Self { client, config })
    }

    /// Dispatch one unit of work. Success is HTTP 200/201, everything
    /// else is an error.
    pub async fn dispatch(
        &self,
        action: RemoteAction,
        label: &Label,
        opts: &DispatchOptions,
    ) -> Result<()> {
        for arg in &opts.args {
            if arg.contains(ARG_SEPARATOR) {
                return Err(RemoteError::BadArgument(arg.clone()));
            }
        }
        let body = encode_form(action, label, opts);
        info!(action = action.as_str(), label = %label, "dispatching to CI fleet");
        let response = self
            .client
            .post(&self.config.endpoint)
            .basic_auth(&self.config.username, Some(&self.config.token))
            .header("Content-Type", "application/x-www-form-urlencoded")
            .body(body)
            .send()
            .await?;
        let status = response.status().as_u16();
        if status == 200 || status == 201 {
            return Ok(());
        }
        Err(RemoteError::Status(status))
    }
}

fn encode_form(action: RemoteAction, label: &Label, opts: &DispatchOptions) -> String {
    let mut fields: Vec<(&str, String)> = vec![
        ("action", action.as_str().to_string()),
        ("label", label.to_string()),
        ("base_cl", opts.base_cl.to_string()),
        ("log_level", opts.log_level.clone()),
        ("invoker", opts.invoker.clone()),
        ("invoker_url", opts.invoker_url.clone()),
        (
            "args",
            opts.args.join(&ARG_SEPARATOR.to_string()),
        ),
    ];
    if let Some(change) = &opts.change {
        fields.push(("change", change.clone()));
    }
    if let Some(task_key) = &opts.task_key {
        fields.push(("task_key", task_key.clone()));
    }
    fields
        .iter()
        .map(|(k, v)| format!("{k}={}", urlencoding::encode(v)))
        .collect::<Vec<_>>()
        .join("&")
}
