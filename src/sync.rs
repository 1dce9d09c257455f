//! Keeps the replica in step with the authoritative store.
//!
//! Consistency is eventual: the authoritative store is written first and the
//! replica is reconciled afterwards, message by message. A reconciliation that
//! fails part-way is remembered in [`SyncState`] and can be re-run with
//! [`SyncCoordinator::retry_pending`].

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::engine::LabelEngine;
use crate::error::{MailError, MailResult};
use crate::labels::Tag;
use crate::locks::MessageLocks;
use crate::models::{Label, Message};
use crate::replica::{ReplicaStore, SYSTEM_OWNER};
use crate::store::MailStore;

/// A reconciliation that has not converged yet.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingReconciliation {
    pub message_id: String,
    pub owner_id: String,
    pub label_ids: Vec<String>,
    pub attempts: u32,
    pub last_error: String,
    pub first_failed_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct SyncState {
    pub pending: HashMap<String, PendingReconciliation>,
}

impl SyncState {
    pub fn record_failure(&mut self, message_id: &str, owner_id: &str, label_ids: &[String], error: &MailError) {
        let entry = self
            .pending
            .entry(message_id.to_string())
            .or_insert_with(|| PendingReconciliation {
                message_id: message_id.to_string(),
                owner_id: owner_id.to_string(),
                label_ids: Vec::new(),
                attempts: 0,
                last_error: String::new(),
                first_failed_at: Utc::now(),
            });
        entry.owner_id = owner_id.to_string();
        entry.label_ids = label_ids.to_vec();
        entry.attempts += 1;
        entry.last_error = error.to_string();
    }

    pub fn resolve(&mut self, message_id: &str) -> bool {
        self.pending.remove(message_id).is_some()
    }

    pub fn is_pending(&self, message_id: &str) -> bool {
        self.pending.contains_key(message_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum MirrorOutcome {
    Mirrored,
    Removed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    pub mirrored: usize,
    pub removed: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryReport {
    pub resolved: usize,
    pub still_pending: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClearTrashReport {
    pub count: usize,
    pub replica_removed: usize,
}

#[derive(Clone)]
pub struct SyncCoordinator {
    engine: LabelEngine,
    replica: ReplicaStore,
    state: Arc<Mutex<SyncState>>,
}

impl SyncCoordinator {
    pub fn new(engine: LabelEngine, replica: ReplicaStore) -> Self {
        Self {
            engine,
            replica,
            state: Arc::new(Mutex::new(SyncState::default())),
        }
    }

    pub fn engine(&self) -> &LabelEngine {
        &self.engine
    }

    pub fn replica(&self) -> &ReplicaStore {
        &self.replica
    }

    fn store(&self) -> &MailStore {
        self.engine.store()
    }

    fn locks(&self) -> &MessageLocks {
        self.engine.locks()
    }

    pub fn pending_reconciliations(&self) -> Vec<PendingReconciliation> {
        let mut pending: Vec<PendingReconciliation> = match self.state.lock() {
            Ok(state) => state.pending.values().cloned().collect(),
            Err(_) => Vec::new(),
        };
        pending.sort_by(|a, b| a.message_id.cmp(&b.message_id));
        pending
    }

    fn record_failure(&self, message_id: &str, owner_id: &str, label_ids: &[String], error: &MailError) {
        if let Ok(mut state) = self.state.lock() {
            state.record_failure(message_id, owner_id, label_ids, error);
        }
    }

    fn resolve(&self, message_id: &str) {
        if let Ok(mut state) = self.state.lock() {
            if state.resolve(message_id) {
                info!(message_id, "pending reconciliation resolved");
            }
        }
    }

    /// Overwrites the replica's label links for `message_id` with `label_ids`.
    ///
    /// Runs three steps that are not atomic together: mirror any unknown
    /// labels (named after their id), clear every existing link, then insert
    /// one link per id. If the last step fails the message is left with fewer
    /// links than it should have; the failure is recorded and reported as
    /// [`MailError::PartialReconciliation`]. Re-running with the same input
    /// converges to the same link set.
    pub async fn replace_authoritative(
        &self,
        message_id: &str,
        label_ids: &[String],
        owner_id: &str,
    ) -> MailResult<usize> {
        let _guard = self.locks().lock(message_id).await;
        self.replace_links(message_id, label_ids, owner_id).await
    }

    // Caller holds the message lock.
    async fn replace_links(&self, message_id: &str, label_ids: &[String], owner_id: &str) -> MailResult<usize> {
        let mut ids: Vec<String> = Vec::with_capacity(label_ids.len());
        for id in label_ids {
            if !ids.contains(id) {
                ids.push(id.clone());
            }
        }

        let result = self.rebuild_links(message_id, &ids, owner_id).await;
        match &result {
            Ok(linked) => {
                debug!(message_id, linked, "links replaced");
                self.resolve(message_id);
            }
            Err(err) => {
                warn!(message_id, owner_id, error = %err, "reconciliation failed");
                self.record_failure(message_id, owner_id, &ids, err);
            }
        }
        result
    }

    async fn rebuild_links(&self, message_id: &str, ids: &[String], owner_id: &str) -> MailResult<usize> {
        let mut missing = Vec::new();
        for id in ids {
            if self.replica.get_label(id).await?.is_none() {
                let owner = match Tag::parse(id) {
                    Ok(tag) if tag.is_reserved() => SYSTEM_OWNER,
                    _ => owner_id,
                };
                missing.push(Label::new(id.clone(), owner, id.clone()));
            }
        }
        self.replica.upsert_labels(&missing).await?;

        self.replica.clear_links_for_message(message_id).await?;

        let mut linked = 0;
        for id in ids {
            if let Err(err) = self.replica.add_link(message_id, id).await {
                warn!(message_id, label_id = %id, linked, expected = ids.len(), error = %err, "relinking interrupted");
                return Err(MailError::PartialReconciliation {
                    message_id: message_id.to_string(),
                    linked,
                    expected: ids.len(),
                });
            }
            linked += 1;
        }
        Ok(linked)
    }

    /// Replica label rows for the tags of `message`. Reserved tags map to
    /// shared rows; custom tags to the owner's label, or a per-owner
    /// placeholder when no label entity exists.
    async fn label_rows(&self, message: &Message) -> MailResult<Vec<Label>> {
        let mut rows = Vec::with_capacity(message.labels.len());
        for name in message.labels.names() {
            let tag = Tag::parse(&name)?;
            let row = if tag.is_reserved() {
                Label::new(tag.as_str(), SYSTEM_OWNER, tag.as_str())
            } else {
                match self.store().find_label_by_name(&message.owner_id, &name).await? {
                    Some(label) => label,
                    None => Label::new(format!("{}/{name}", message.owner_id), &message.owner_id, &name),
                }
            };
            rows.push(row);
        }
        Ok(rows)
    }

    /// Copies the authoritative state of one message into the replica, or
    /// drops it from the replica when the authoritative store no longer has it.
    pub async fn mirror_message(&self, message_id: &str) -> MailResult<MirrorOutcome> {
        let _guard = self.locks().lock(message_id).await;
        self.mirror_locked(message_id).await
    }

    async fn mirror_locked(&self, message_id: &str) -> MailResult<MirrorOutcome> {
        let Some(message) = self.store().get_message(message_id).await? else {
            self.replica.delete_message(message_id).await?;
            self.resolve(message_id);
            return Ok(MirrorOutcome::Removed);
        };

        let rows = self.label_rows(&message).await?;
        let ids: Vec<String> = rows.iter().map(|label| label.id.clone()).collect();

        let prepared = async {
            self.replica.upsert_message(&message).await?;
            self.replica.save_labels(&rows).await?;
            Ok::<_, MailError>(())
        }
        .await;
        if let Err(err) = prepared {
            self.record_failure(message_id, &message.owner_id, &ids, &err);
            return Err(err);
        }

        self.replace_links(message_id, &ids, &message.owner_id).await?;
        Ok(MirrorOutcome::Mirrored)
    }

    /// Mirrors after a successful authoritative write. Failures are logged and
    /// left in the pending ledger rather than failing the caller.
    pub async fn mirror_quietly(&self, message_id: &str) {
        if let Err(err) = self.mirror_message(message_id).await {
            warn!(message_id, error = %err, "replica left behind; will retry");
        }
    }

    pub async fn mirror_many(&self, messages: &[Message]) {
        for message in messages {
            self.mirror_quietly(&message.id).await;
        }
    }

    /// Re-runs every pending reconciliation.
    pub async fn retry_pending(&self) -> RetryReport {
        let pending = self.pending_reconciliations();
        let mut report = RetryReport::default();

        for entry in pending {
            let _guard = self.locks().lock(&entry.message_id).await;
            let result = match self.store().get_message(&entry.message_id).await {
                Ok(Some(_)) => self.mirror_locked(&entry.message_id).await.map(|_| ()),
                Ok(None) => self
                    .replace_links(&entry.message_id, &entry.label_ids, &entry.owner_id)
                    .await
                    .map(|_| ()),
                Err(err) => Err(err),
            };
            match result {
                Ok(()) => report.resolved += 1,
                Err(err) => {
                    debug!(message_id = %entry.message_id, error = %err, "still pending");
                    report.still_pending += 1;
                }
            }
        }

        info!(resolved = report.resolved, still_pending = report.still_pending, "pending reconciliations retried");
        report
    }

    /// Mirrors every message of `owner_id` and drops replica messages the
    /// authoritative store no longer has.
    pub async fn sync_owner(&self, owner_id: &str) -> MailResult<SyncReport> {
        let authoritative: Vec<String> = self
            .store()
            .messages_for_owner(owner_id)
            .await?
            .into_iter()
            .map(|message| message.id)
            .collect();
        let known: HashSet<&str> = authoritative.iter().map(String::as_str).collect();

        let mut report = SyncReport::default();
        for id in &authoritative {
            match self.mirror_message(id).await {
                Ok(_) => report.mirrored += 1,
                Err(err) => {
                    warn!(message_id = %id, error = %err, "mirroring failed");
                    report.failed += 1;
                }
            }
        }

        for id in self.replica.message_ids_for_owner(owner_id).await? {
            if known.contains(id.as_str()) {
                continue;
            }
            match self.mirror_message(&id).await {
                Ok(MirrorOutcome::Removed) => report.removed += 1,
                Ok(MirrorOutcome::Mirrored) => report.mirrored += 1,
                Err(err) => {
                    warn!(message_id = %id, error = %err, "dropping stale message failed");
                    report.failed += 1;
                }
            }
        }

        info!(owner_id, mirrored = report.mirrored, removed = report.removed, failed = report.failed, "owner synced");
        Ok(report)
    }

    pub async fn mark_all_read(&self, owner_id: &str) -> MailResult<Vec<Message>> {
        let changed = self.engine.mark_all_read(owner_id).await?;
        self.mirror_many(&changed).await;
        Ok(changed)
    }

    pub async fn mark_many_unread(&self, owner_id: &str, ids: &[String]) -> MailResult<Vec<Message>> {
        let changed = self.engine.mark_many_unread(owner_id, ids).await?;
        self.mirror_many(&changed).await;
        Ok(changed)
    }

    /// Deletes the owner's trashed messages from both stores. The replica
    /// loses exactly the messages the authoritative sweep removed.
    pub async fn clear_trash(&self, owner_id: &str) -> MailResult<ClearTrashReport> {
        let removed = self.engine.clear_trash(owner_id).await?;
        let _guards = self.locks().lock_many(removed.iter().map(String::as_str)).await;

        let replica_removed = match self.replica.delete_messages(&removed).await {
            Ok(count) => count as usize,
            Err(err) => {
                warn!(owner_id, error = %err, "replica trash sweep failed; a mailbox sync will drop the rest");
                0
            }
        };
        for id in &removed {
            self.resolve(id);
        }

        Ok(ClearTrashReport {
            count: removed.len(),
            replica_removed,
        })
    }

    pub async fn create_label(&self, owner_id: &str, name: &str) -> MailResult<Label> {
        let label = self.store().create_label(owner_id, name).await?;
        if let Err(err) = self.replica.save_label(&label).await {
            warn!(label_id = %label.id, error = %err, "replica label not saved");
        }
        Ok(label)
    }

    pub async fn rename_label(&self, id: &str, owner_id: &str, name: &str) -> MailResult<Label> {
        let (label, retagged) = self.engine.rename_label(id, owner_id, name).await?;
        if let Err(err) = self.replica.save_label(&label).await {
            warn!(label_id = %label.id, error = %err, "replica label not saved");
        }
        self.mirror_many(&retagged).await;
        Ok(label)
    }

    pub async fn delete_label(&self, id: &str, owner_id: &str) -> MailResult<Label> {
        let (label, stripped) = self.engine.delete_label(id, owner_id).await?;
        if let Err(err) = self.replica.delete_label(&label.id).await {
            warn!(label_id = %label.id, error = %err, "replica label not deleted");
        }
        self.mirror_many(&stripped).await;
        Ok(label)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failures_accumulate_attempts() {
        let mut state = SyncState::default();
        let err = MailError::Cancelled;
        let ids = vec!["inbox".to_string()];

        state.record_failure("m1", "bob", &ids, &err);
        state.record_failure("m1", "bob", &ids, &err);
        assert_eq!(state.pending["m1"].attempts, 2);
        assert!(state.is_pending("m1"));

        assert!(state.resolve("m1"));
        assert!(!state.resolve("m1"));
    }
}
