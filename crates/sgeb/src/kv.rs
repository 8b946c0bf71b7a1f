//! The external key-value store: the sole durable state of the
//! post-submit controller, auto-publisher, and cron driver.
//!
//! Keys live in the VCS; reads and writes shell out to its binary. The
//! store has no transactions and no notifications, and an unset key is
//! returned as the literal string `"0"` — callers treat that sentinel as
//! absent rather than inventing a nullable read path.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;

/// The value the store returns for a key that was never written.
pub const UNSET_VALUE: &str = "0";

#[derive(Debug, Error)]
pub enum KvError {
    #[error("kv command failed for {key}: {message}")]
    Command { key: String, message: String },
    #[error("io error running kv command: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, KvError>;

/// Whether a stored value means "nothing here yet".
pub fn is_unset(value: &str) -> bool {
    value == UNSET_VALUE || value.is_empty()
}

/// Linearizable-per-key string store: the VCS binary in production, an
/// in-memory map in tests.
#[derive(Debug)]
pub enum KvStore {
    Vcs(VcsKvStore),
    Mem(MemKvStore),
}

impl KvStore {
    pub fn vcs(command: impl Into<String>) -> Self {
        Self::Vcs(VcsKvStore::new(command))
    }

    pub fn mem() -> Self {
        Self::Mem(MemKvStore::default())
    }

    /// Read a key; an unset key yields `"0"`.
    pub async fn read(&self, key: &str) -> Result<String> {
        match self {
            Self::Vcs(store) => store.read(key).await,
            Self::Mem(store) => Ok(store.read(key)),
        }
    }

    pub async fn write(&self, key: &str, value: &str) -> Result<()> {
        match self {
            Self::Vcs(store) => store.write(key, value).await,
            Self::Mem(store) => {
                store.write(key, value);
                Ok(())
            }
        }
    }

    /// Test seam: the in-memory map, when this store is one.
    pub fn as_mem(&self) -> Option<&MemKvStore> {
        match self {
            Self::Mem(store) => Some(store),
            Self::Vcs(_) => None,
        }
    }
}

/// Store backed by the VCS binary: `<command> read <key>` /
/// `<command> write <key> <value>`.
#[derive(Debug, Clone)]
pub struct VcsKvStore {
    command: String,
    timeout: Duration,
}

impl VcsKvStore {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            timeout: Duration::from_secs(60),
        }
    }

    async fn run(&self, args: &[&str], key: &str) -> Result<String> {
        let output = tokio::time::timeout(
            self.timeout,
            Command::new(&self.command).args(args).output(),
        )
        .await
        .map_err(|_| KvError::Command {
            key: key.to_string(),
            message: "timed out".to_string(),
        })??;
        if !output.status.success() {
            return Err(KvError::Command {
                key: key.to_string(),
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    pub async fn read(&self, key: &str) -> Result<String> {
        let value = self.run(&["read", key], key).await?;
        if value.is_empty() {
            return Ok(UNSET_VALUE.to_string());
        }
        Ok(value)
    }

    pub async fn write(&self, key: &str, value: &str) -> Result<()> {
        self.run(&["write", key, value], key).await?;
        Ok(())
    }
}

/// In-memory store for tests and dry runs. Unset keys read as `"0"`.
#[derive(Debug, Default)]
pub struct MemKvStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemKvStore {
    pub fn read(&self, key: &str) -> String {
        self.entries
            .lock()
            .unwrap()
            .get(key)
            .cloned()
            .unwrap_or_else(|| UNSET_VALUE.to_string())
    }

    pub fn write(&self, key: &str, value: &str) {
        self.entries
            .lock()
            .unwrap()
            .insert(key.to_string(), value.to_string());
    }

    pub fn remove(&self, key: &str) {
        self.entries.lock().unwrap().remove(key);
    }

    /// Snapshot of all written keys, for assertions.
    pub fn entries(&self) -> HashMap<String, String> {
        self.entries.lock().unwrap().clone()
    }

    /// Keys currently set, sorted.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.entries.lock().unwrap().keys().cloned().collect();
        keys.sort();
        keys
    }
}
