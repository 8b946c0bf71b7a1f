//! sgep - presubmit orchestrator
//!
//! Library components: the policy-file locator, check expansion and
//! execution, checker-tool invocation, and run listeners.

pub mod checker;
pub mod listeners;
pub mod locator;
pub mod orchestrator;

pub use listeners::{LoggingListener, MetricsListener, PresubmitListener};
pub use orchestrator::Presubmit;
