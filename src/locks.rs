//! Per-message mutual exclusion.
//!
//! Every read-modify-write of a message's labels runs while holding the guard
//! for that message id, so two concurrent edits of the same message cannot
//! lose each other's update. Different ids never contend.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Entries are pruned once the map grows past this many ids.
const PRUNE_THRESHOLD: usize = 256;

pub type MessageGuard = OwnedMutexGuard<()>;

#[derive(Debug, Clone, Default)]
pub struct MessageLocks {
    slots: Arc<Mutex<HashMap<String, Arc<AsyncMutex<()>>>>>,
}

impl MessageLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits for exclusive access to `message_id`.
    pub async fn lock(&self, message_id: &str) -> MessageGuard {
        let slot = {
            let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
            if slots.len() >= PRUNE_THRESHOLD {
                // Only the map holds an idle slot.
                slots.retain(|_, slot| Arc::strong_count(slot) > 1);
            }
            slots.entry(message_id.to_string()).or_default().clone()
        };
        slot.lock_owned().await
    }

    /// Locks several ids in sorted order so overlapping batches cannot deadlock.
    pub async fn lock_many<'a>(&self, ids: impl IntoIterator<Item = &'a str>) -> Vec<MessageGuard> {
        let mut ids: Vec<&str> = ids.into_iter().collect();
        ids.sort_unstable();
        ids.dedup();

        let mut guards = Vec::with_capacity(ids.len());
        for id in ids {
            guards.push(self.lock(id).await);
        }
        guards
    }

    pub fn len(&self) -> usize {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
