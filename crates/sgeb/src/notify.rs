//! Notifications: policy-gated email delivery for post-submit, publish,
//! and cron outcomes.
//!
//! Rendering stays minimal here; the interesting part is the gating.
//! Recovery means the prior state was failing and the new one is healthy.

use lettre::message::header::ContentType;
use lettre::transport::smtp::AsyncSmtpTransport;
use lettre::{AsyncTransport, Message, Tokio1Executor};
use sge_core::NotifyPolicy;
use std::sync::Mutex;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("bad address {0}: {1}")]
    Address(String, String),
    #[error("failed to build message: {0}")]
    Build(#[from] lettre::error::Error),
    #[error("smtp error: {0}")]
    Smtp(#[from] lettre::transport::smtp::Error),
}

pub type Result<T> = std::result::Result<T, NotifyError>;

/// Whether a transition should notify under a policy.
///
/// `was_healthy` is the prior persisted state; `now_healthy` the new one.
pub fn should_notify(policy: NotifyPolicy, was_healthy: bool, now_healthy: bool) -> bool {
    match policy {
        NotifyPolicy::NotifyNever => false,
        NotifyPolicy::NotifyAlways => true,
        NotifyPolicy::NotifyOnFailure => !now_healthy,
        NotifyPolicy::NotifyOnFailureAndRecovery => {
            !now_healthy || (!was_healthy && now_healthy)
        }
    }
}

/// One outbound notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub to: String,
    pub subject: String,
    pub body: String,
}

/// Delivery backend: SMTP in production, a recorder in tests, or nothing.
pub enum Notifier {
    Smtp(SmtpNotifier),
    Recording(RecordingNotifier),
    Disabled,
}

impl std::fmt::Debug for Notifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self {
            Self::Smtp(_) => "Smtp",
            Self::Recording(_) => "Recording",
            Self::Disabled => "Disabled",
        };
        f.write_str(kind)
    }
}

impl Notifier {
    pub fn smtp(host: &str, from: &str) -> Result<Self> {
        Ok(Self::Smtp(SmtpNotifier::new(host, from)?))
    }

    pub fn recording() -> Self {
        Self::Recording(RecordingNotifier::default())
    }

    /// Send, logging and swallowing transport failures: a lost email must
    /// not fail the tick that produced it.
    pub async fn send(&self, notification: Notification) {
        match self {
            Self::Smtp(smtp) => {
                if let Err(e) = smtp.send(&notification).await {
                    warn!(to = %notification.to, error = %e, "failed to send notification");
                }
            }
            Self::Recording(rec) => rec.record(notification),
            Self::Disabled => {
                info!(to = %notification.to, subject = %notification.subject, "notifications disabled, dropping");
            }
        }
    }

    /// Test seam: the recorder, when this notifier is one.
    pub fn as_recording(&self) -> Option<&RecordingNotifier> {
        match self {
            Self::Recording(rec) => Some(rec),
            _ => None,
        }
    }
}

/// SMTP delivery over the configured relay.
pub struct SmtpNotifier {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: String,
}

impl SmtpNotifier {
    pub fn new(host: &str, from: &str) -> Result<Self> {
        let transport = AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(host).build();
        Ok(Self {
            transport,
            from: from.to_string(),
        })
    }

    async fn send(&self, notification: &Notification) -> Result<()> {
        let message = Message::builder()
            .from(
                self.from
                    .parse()
                    .map_err(|e| NotifyError::Address(self.from.clone(), format!("{e:?}")))?,
            )
            .to(notification
                .to
                .parse()
                .map_err(|e| NotifyError::Address(notification.to.clone(), format!("{e:?}")))?)
            .subject(&notification.subject)
            .header(ContentType::TEXT_PLAIN)
            .body(notification.body.clone())?;
        self.transport.send(message).await?;
        Ok(())
    }
}

/// Records notifications for assertions.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<Notification>>,
}

impl RecordingNotifier {
    fn record(&self, notification: Notification) {
        self.sent.lock().unwrap().push(notification);
    }

    pub fn sent(&self) -> Vec<Notification> {
        self.sent.lock().unwrap().clone()
    }

    pub fn count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }
}
