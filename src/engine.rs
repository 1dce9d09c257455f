//! Label mutations against the authoritative store.
//!
//! Each operation takes the message's lock, loads the caller's copy, applies
//! the pure transition from [`crate::labels`] and writes the result back. The
//! lock is held for the whole read-modify-write, including any blacklist calls
//! a spam toggle makes.

use serde::Serialize;
use tracing::{debug, info};

use crate::classifier::{BlacklistEffect, SpamClassifier};
use crate::error::{MailError, MailResult};
use crate::labels::Tag;
use crate::locks::{MessageGuard, MessageLocks};
use crate::models::{Label, Message};
use crate::store::MailStore;

/// Result of a label edit.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LabelUpdate {
    pub message: Message,
    pub changed: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub blacklist: Vec<BlacklistEffect>,
}

impl LabelUpdate {
    fn plain(message: Message, changed: bool) -> Self {
        Self {
            message,
            changed,
            blacklist: Vec::new(),
        }
    }
}

#[derive(Clone)]
pub struct LabelEngine {
    store: MailStore,
    classifier: SpamClassifier,
    locks: MessageLocks,
}

impl LabelEngine {
    pub fn new(store: MailStore, classifier: SpamClassifier, locks: MessageLocks) -> Self {
        Self {
            store,
            classifier,
            locks,
        }
    }

    pub fn store(&self) -> &MailStore {
        &self.store
    }

    pub fn classifier(&self) -> &SpamClassifier {
        &self.classifier
    }

    pub fn locks(&self) -> &MessageLocks {
        &self.locks
    }

    /// Canonical tag for `name` in the mailbox of `owner_id`. Custom names
    /// take the spelling of an existing label with the same name in any case.
    async fn resolve_tag(&self, owner_id: &str, name: &str) -> MailResult<Tag> {
        match Tag::parse(name)? {
            Tag::Custom(name) => match self.store.find_label_by_name(owner_id, &name).await? {
                Some(label) => Ok(Tag::Custom(label.name)),
                None => Ok(Tag::Custom(name)),
            },
            reserved => Ok(reserved),
        }
    }

    /// The owner's label named `name`, created on first reference.
    async fn ensure_label(&self, owner_id: &str, name: &str) -> MailResult<Label> {
        if let Some(label) = self.store.find_label_by_name(owner_id, name).await? {
            return Ok(label);
        }
        match self.store.create_label(owner_id, name).await {
            Ok(label) => {
                debug!(owner_id, name, "label created on first use");
                Ok(label)
            }
            // Lost a race with another first use.
            Err(MailError::Conflict(_)) => self
                .store
                .find_label_by_name(owner_id, name)
                .await?
                .ok_or_else(|| MailError::not_found(format!("label {name}"))),
            Err(err) => Err(err),
        }
    }

    pub async fn add_label(&self, message_id: &str, owner_id: &str, name: &str) -> MailResult<LabelUpdate> {
        let tag = self.resolve_tag(owner_id, name).await?;
        let _guard = self.locks.lock(message_id).await;
        let mut message = self.store.get_owned_message(message_id, owner_id).await?;

        if tag == Tag::Spam {
            if message.labels.is_spam() {
                return Ok(LabelUpdate::plain(message, false));
            }
            let toggle = self.classifier.mark_spam(&message).await?;
            message.labels = toggle.labels;
            message.sync_flags();
            self.store.save_labels(&message).await?;
            return Ok(LabelUpdate {
                message,
                changed: true,
                blacklist: toggle.effects,
            });
        }

        let mut labels = message.labels.clone();
        let changed = labels.add(tag.clone())?;
        if changed {
            if let Tag::Custom(name) = &tag {
                self.ensure_label(owner_id, name).await?;
            }
            message.labels = labels;
            message.sync_flags();
            self.store.save_labels(&message).await?;
            info!(message_id, owner_id, label = %tag, "label added");
        }
        Ok(LabelUpdate::plain(message, changed))
    }

    pub async fn remove_label(&self, message_id: &str, owner_id: &str, name: &str) -> MailResult<LabelUpdate> {
        let tag = self.resolve_tag(owner_id, name).await?;
        let _guard = self.locks.lock(message_id).await;
        let mut message = self.store.get_owned_message(message_id, owner_id).await?;

        if tag == Tag::Spam {
            if !message.labels.is_spam() {
                return Ok(LabelUpdate::plain(message, false));
            }
            let toggle = self.classifier.unmark_spam(&message).await;
            message.labels = toggle.labels;
            message.sync_flags();
            self.store.save_labels(&message).await?;
            return Ok(LabelUpdate {
                message,
                changed: true,
                blacklist: toggle.effects,
            });
        }

        let changed = message.labels.remove(&tag);
        if changed {
            message.sync_flags();
            self.store.save_labels(&message).await?;
            info!(message_id, owner_id, label = %tag, "label removed");
        }
        Ok(LabelUpdate::plain(message, changed))
    }

    /// Returns the message and its new `starred` state.
    pub async fn toggle_star(&self, message_id: &str, owner_id: &str) -> MailResult<(Message, bool)> {
        let _guard = self.locks.lock(message_id).await;
        let mut message = self.store.get_owned_message(message_id, owner_id).await?;
        let starred = message.toggle_star();
        self.store.save_labels(&message).await?;
        debug!(message_id, starred, "star toggled");
        Ok((message, starred))
    }

    pub async fn toggle_archive(&self, message_id: &str, owner_id: &str) -> MailResult<Message> {
        let _guard = self.locks.lock(message_id).await;
        let mut message = self.store.get_owned_message(message_id, owner_id).await?;
        let archived = message.labels.toggle_archive()?;
        self.store.save_labels(&message).await?;
        debug!(message_id, archived, "archive toggled");
        Ok(message)
    }

    pub async fn toggle_trash(&self, message_id: &str, owner_id: &str) -> MailResult<Message> {
        let _guard = self.locks.lock(message_id).await;
        let mut message = self.store.get_owned_message(message_id, owner_id).await?;
        let trashed = message.labels.toggle_trash();
        self.store.save_labels(&message).await?;
        debug!(message_id, trashed, "trash toggled");
        Ok(message)
    }

    pub async fn toggle_spam(&self, message_id: &str, owner_id: &str) -> MailResult<LabelUpdate> {
        let _guard = self.locks.lock(message_id).await;
        let mut message = self.store.get_owned_message(message_id, owner_id).await?;
        let toggle = self.classifier.reclassify_on_spam_toggle(&message).await?;
        message.labels = toggle.labels;
        message.sync_flags();
        self.store.save_labels(&message).await?;
        info!(message_id, owner_id, spam = toggle.spam, "spam toggled");
        Ok(LabelUpdate {
            message,
            changed: true,
            blacklist: toggle.effects,
        })
    }

    pub async fn mark_read(&self, message_id: &str, owner_id: &str, read: bool) -> MailResult<Message> {
        let _guard = self.locks.lock(message_id).await;
        let mut message = self.store.get_owned_message(message_id, owner_id).await?;
        if message.set_read(read) {
            self.store.save_labels(&message).await?;
        }
        Ok(message)
    }

    /// Marks every message of `owner_id` as read. Returns the messages that changed.
    pub async fn mark_all_read(&self, owner_id: &str) -> MailResult<Vec<Message>> {
        let ids: Vec<String> = self
            .store
            .messages_for_owner(owner_id)
            .await?
            .into_iter()
            .map(|message| message.id)
            .collect();
        self.set_read_many(owner_id, &ids, true).await
    }

    /// Marks the listed messages as unread. Ids that are missing or belong to
    /// someone else are skipped.
    pub async fn mark_many_unread(&self, owner_id: &str, ids: &[String]) -> MailResult<Vec<Message>> {
        self.set_read_many(owner_id, ids, false).await
    }

    /// Renames one of the owner's labels and re-tags their messages.
    /// Returns the label and the messages that changed.
    pub async fn rename_label(&self, id: &str, owner_id: &str, name: &str) -> MailResult<(Label, Vec<Message>)> {
        let _guards = self.lock_mailbox(owner_id).await?;
        self.store.rename_label(id, owner_id, name).await
    }

    /// Deletes one of the owner's labels and strips it from their messages.
    pub async fn delete_label(&self, id: &str, owner_id: &str) -> MailResult<(Label, Vec<Message>)> {
        let _guards = self.lock_mailbox(owner_id).await?;
        self.store.delete_label(id, owner_id).await
    }

    /// Deletes the owner's trashed messages. A message restored before its
    /// lock is taken survives. Returns the deleted ids.
    pub async fn clear_trash(&self, owner_id: &str) -> MailResult<Vec<String>> {
        let candidates = self.store.trashed_ids(owner_id).await?;
        let _guards = self.locks.lock_many(candidates.iter().map(String::as_str)).await;
        self.store.delete_trashed(owner_id, &candidates).await
    }

    // Messages created after the listing start without custom tags.
    async fn lock_mailbox(&self, owner_id: &str) -> MailResult<Vec<MessageGuard>> {
        let ids = self.store.message_ids_for_owner(owner_id).await?;
        Ok(self.locks.lock_many(ids.iter().map(String::as_str)).await)
    }

    async fn set_read_many(&self, owner_id: &str, ids: &[String], read: bool) -> MailResult<Vec<Message>> {
        let _guards = self.locks.lock_many(ids.iter().map(String::as_str)).await;

        let mut changed = Vec::new();
        for id in ids {
            match self.store.get_owned_message(id, owner_id).await {
                Ok(mut message) => {
                    if message.set_read(read) {
                        changed.push(message);
                    }
                }
                Err(MailError::NotFound(_)) => debug!(message_id = %id, "skipping unknown message"),
                Err(err) => return Err(err),
            }
        }

        self.store.save_labels_many(&changed).await?;
        info!(owner_id, read, requested = ids.len(), changed = changed.len(), "read state updated");
        Ok(changed)
    }
}
