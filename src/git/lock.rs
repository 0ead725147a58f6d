//! Keyed async locks
//!
//! Pushes to the same (repository, branch) must not interleave: they share a
//! working copy and would race on the remote tip. Each key gets its own
//! `tokio::sync::Mutex`, created on first use.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Map of per-key mutexes
#[derive(Default)]
pub struct KeyedLocks {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl KeyedLocks {
    /// Create an empty lock set
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `key`
    pub async fn lock(&self, key: &str) -> OwnedMutexGuard<()> {
        let mutex = self
            .locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        mutex.lock_owned().await
    }

    /// Number of keys seen so far
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    /// True when no key was ever locked
    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

/// Lock key for a target branch
pub fn branch_key(repository: &str, branch: &str) -> String {
    format!("{}#{}", super::normalize_repository(repository), branch)
}
