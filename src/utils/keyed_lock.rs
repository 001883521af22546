//! Named mutual-exclusion sections.
//!
//! Deploys of the same (owner, repository) pair and every balance-affecting
//! operation for one user must run one at a time. Each key gets its own
//! async mutex; unrelated keys never contend.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

type Sections = DashMap<String, Arc<Mutex<()>>>;

#[derive(Debug, Default)]
pub struct KeyedLocks {
    sections: Arc<Sections>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `key`. The section is held until the
    /// returned guard is dropped.
    pub async fn lock(&self, key: &str) -> SectionGuard {
        // Clone the Arc out so the shard lock is not held across the await
        let section = self
            .sections
            .entry(key.to_owned())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();

        SectionGuard {
            guard: Some(section.lock_owned().await),
            key: key.to_owned(),
            sections: self.sections.clone(),
        }
    }

    /// Number of keys with a holder or waiter
    pub fn len(&self) -> usize {
        self.sections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sections.is_empty()
    }

    /// Lock key for one (owner, repository) pair
    pub fn pair_key(owner_id: &str, repo_name: &str) -> String {
        format!("{owner_id}/{repo_name}")
    }
}

/// Exclusive hold on one key. The last holder out removes the key.
#[derive(Debug)]
pub struct SectionGuard {
    guard: Option<OwnedMutexGuard<()>>,
    key: String,
    sections: Arc<Sections>,
}

impl Drop for SectionGuard {
    fn drop(&mut self) {
        drop(self.guard.take());
        // Waiters hold their own clone of the section, so it stays while any exist
        self.sections
            .remove_if(&self.key, |_, section| Arc::strong_count(section) == 1);
    }
}
