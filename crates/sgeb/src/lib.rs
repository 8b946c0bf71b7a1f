//! sgeb - monorepo build engine
//!
//! Library components for the build/test/publish/cron/task engine, the
//! delegate event-stream parser, and the post-submit side: controller,
//! auto-publisher, cron driver, KV store, notifications, remote dispatch.

pub mod autopublish;
pub mod config;
pub mod cron;
pub mod delegate;
pub mod engine;
pub mod events;
pub mod invocation;
pub mod kv;
pub mod notify;
pub mod postsubmit;
pub mod process;
pub mod remote;
pub mod results;

pub use config::SystemConfig;
pub use engine::{Engine, EngineError, EngineOptions, ResolvedBin};
pub use kv::KvStore;
pub use notify::Notifier;
pub use results::{BuildResult, CheckResult, NamedLog, PublishResult, TestResult};
