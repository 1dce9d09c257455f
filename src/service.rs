//! One operation per mailbox route. Validates request bodies, runs the label
//! engine against the authoritative store and mirrors every change into the
//! replica.

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use crate::engine::{LabelEngine, LabelUpdate};
use crate::error::{MailError, MailResult};
use crate::labels::{Folder, LabelSet, Tag};
use crate::models::{
    BlacklistRequest, ComposeRequest, EditDraftRequest, IdsRequest, Label, LabelAction, LabelNameRequest,
    LabelRequest, Message, User,
};
use crate::oracle::{AddOutcome, RemoveOutcome};
use crate::replica::ReplicaStore;
use crate::store::{self, MailStore};
use crate::sync::{ClearTrashReport, PendingReconciliation, RetryReport, SyncCoordinator, SyncReport};

/// Both copies produced by one send.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SendResult {
    pub sender_copy: Message,
    pub recipient_copy: Message,
}

fn required(value: Option<String>, field: &str) -> MailResult<String> {
    match value.map(|v| v.trim().to_string()) {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(MailError::validation(format!("{field} is required"))),
    }
}

fn trimmed(value: Option<String>) -> String {
    value.map(|v| v.trim().to_string()).unwrap_or_default()
}

#[derive(Clone)]
pub struct MailboxService {
    sync: SyncCoordinator,
}

impl MailboxService {
    pub fn new(sync: SyncCoordinator) -> Self {
        Self { sync }
    }

    pub fn sync(&self) -> &SyncCoordinator {
        &self.sync
    }

    pub fn engine(&self) -> &LabelEngine {
        self.sync.engine()
    }

    pub fn store(&self) -> &MailStore {
        self.sync.engine().store()
    }

    pub fn replica(&self) -> &ReplicaStore {
        self.sync.replica()
    }

    async fn user(&self, id: &str, missing: &str) -> MailResult<User> {
        self.store()
            .get_user(id)
            .await?
            .ok_or_else(|| MailError::validation(missing))
    }

    fn compose(sender: &User, recipient: &User, subject: String, content: String, owner_id: &str, labels: LabelSet) -> Message {
        Message {
            id: Uuid::new_v4().to_string(),
            sender_id: sender.id.clone(),
            sender_name: sender.display_name(),
            recipient_id: recipient.id.clone(),
            recipient_name: recipient.display_name(),
            recipient_email: recipient.email.clone(),
            subject,
            content,
            timestamp: store::now(),
            owner_id: owner_id.to_string(),
            read: false,
            starred: false,
            labels,
        }
    }

    /// Classifies and delivers a message. Nothing is stored unless
    /// classification finishes; cancelling `cancel` abandons the send.
    pub async fn send(&self, caller: &str, request: ComposeRequest, cancel: &CancellationToken) -> MailResult<SendResult> {
        let to = required(request.to, "to")?;
        let subject = required(request.subject, "subject")?;
        let content = required(request.content, "content")?;

        let sender = self.user(caller, "Sender not found").await?;
        let recipient = self.user(&to, "Recipient not found").await?;

        let labels = self
            .engine()
            .classifier()
            .classify_incoming(&subject, &content, cancel)
            .await?;
        if cancel.is_cancelled() {
            return Err(MailError::Cancelled);
        }

        let recipient_copy = Self::compose(&sender, &recipient, subject, content, &recipient.id, labels);
        let sender_copy = Message {
            id: Uuid::new_v4().to_string(),
            owner_id: sender.id.clone(),
            labels: LabelSet::of([Tag::Sent]),
            ..recipient_copy.clone()
        };

        self.store().insert_pair(&sender_copy, &recipient_copy).await?;
        self.sync.mirror_quietly(&sender_copy.id).await;
        self.sync.mirror_quietly(&recipient_copy.id).await;

        info!(
            sender_id = %sender.id,
            recipient_id = %recipient.id,
            spam = recipient_copy.labels.is_spam(),
            "message sent"
        );
        Ok(SendResult {
            sender_copy,
            recipient_copy,
        })
    }

    pub async fn save_draft(&self, caller: &str, request: ComposeRequest) -> MailResult<Message> {
        if request.to.is_none() && request.subject.is_none() && request.content.is_none() {
            return Err(MailError::validation("Draft is empty"));
        }
        let to = required(request.to, "to")?;
        let sender = self.user(caller, "Sender not found").await?;
        let recipient = self.user(&to, "Recipient not found").await?;

        let draft = Self::compose(
            &sender,
            &recipient,
            trimmed(request.subject),
            trimmed(request.content),
            &sender.id,
            LabelSet::of([Tag::Drafts]),
        );
        self.store().insert_message(&draft).await?;
        self.sync.mirror_quietly(&draft.id).await;
        debug!(message_id = %draft.id, "draft saved");
        Ok(draft)
    }

    pub async fn edit_draft(&self, caller: &str, id: &str, request: EditDraftRequest) -> MailResult<Message> {
        let guard = self.engine().locks().lock(id).await;
        let mut draft = self.store().get_owned_message(id, caller).await?;
        if !draft.labels.contains(&Tag::Drafts) {
            return Err(MailError::validation("only drafts can be edited"));
        }

        if let Some(subject) = request.subject.filter(|s| !s.trim().is_empty()) {
            draft.subject = subject.trim().to_string();
        }
        if let Some(content) = request.content.filter(|c| !c.trim().is_empty()) {
            draft.content = content.trim().to_string();
        }
        self.store().update_content(&draft).await?;
        drop(guard);

        self.sync.mirror_quietly(id).await;
        Ok(draft)
    }

    pub async fn get(&self, caller: &str, id: &str) -> MailResult<Message> {
        self.store().get_owned_message(id, caller).await
    }

    /// Folder listing; the inbox when no label is given.
    pub async fn list(&self, caller: &str, label: Option<&str>) -> MailResult<Vec<Message>> {
        let folder = match label.map(str::trim).filter(|l| !l.is_empty()) {
            Some(label) => self.folder(caller, label).await?,
            None => Folder::Inbox,
        };
        self.store().messages_in_folder(caller, &folder).await
    }

    pub async fn spam(&self, caller: &str) -> MailResult<Vec<Message>> {
        self.store().messages_in_folder(caller, &Folder::Spam).await
    }

    // Custom folder names take the spelling of the caller's label, if any.
    async fn folder(&self, caller: &str, name: &str) -> MailResult<Folder> {
        match Folder::parse(name)? {
            Folder::Custom(name) => match self.store().find_label_by_name(caller, &name).await? {
                Some(label) => Ok(Folder::Custom(label.name)),
                None => Ok(Folder::Custom(name)),
            },
            folder => Ok(folder),
        }
    }

    pub async fn delete(&self, caller: &str, id: &str) -> MailResult<()> {
        {
            let _guard = self.engine().locks().lock(id).await;
            self.store().delete_message(id, caller).await?;
        }
        self.sync.mirror_quietly(id).await;
        Ok(())
    }

    pub async fn apply_label(&self, caller: &str, id: &str, request: LabelRequest) -> MailResult<LabelUpdate> {
        let label = required(request.label, "label")?;
        let update = match request.action {
            LabelAction::Add => self.engine().add_label(id, caller, &label).await?,
            LabelAction::Remove => self.engine().remove_label(id, caller, &label).await?,
        };
        if update.changed {
            self.sync.mirror_quietly(id).await;
        }
        Ok(update)
    }

    pub async fn remove_label(&self, caller: &str, id: &str, label: &str) -> MailResult<LabelUpdate> {
        self.apply_label(
            caller,
            id,
            LabelRequest {
                label: Some(label.to_string()),
                action: LabelAction::Remove,
            },
        )
        .await
    }

    pub async fn toggle_star(&self, caller: &str, id: &str) -> MailResult<Message> {
        let (message, _) = self.engine().toggle_star(id, caller).await?;
        self.sync.mirror_quietly(id).await;
        Ok(message)
    }

    pub async fn toggle_spam(&self, caller: &str, id: &str) -> MailResult<LabelUpdate> {
        let update = self.engine().toggle_spam(id, caller).await?;
        self.sync.mirror_quietly(id).await;
        Ok(update)
    }

    pub async fn toggle_archive(&self, caller: &str, id: &str) -> MailResult<Message> {
        let message = self.engine().toggle_archive(id, caller).await?;
        self.sync.mirror_quietly(id).await;
        Ok(message)
    }

    pub async fn toggle_trash(&self, caller: &str, id: &str) -> MailResult<Message> {
        let message = self.engine().toggle_trash(id, caller).await?;
        self.sync.mirror_quietly(id).await;
        Ok(message)
    }

    pub async fn mark_read(&self, caller: &str, id: &str, read: bool) -> MailResult<Message> {
        let message = self.engine().mark_read(id, caller, read).await?;
        self.sync.mirror_quietly(id).await;
        Ok(message)
    }

    pub async fn mark_all_read(&self, caller: &str) -> MailResult<usize> {
        Ok(self.sync.mark_all_read(caller).await?.len())
    }

    pub async fn mark_unread(&self, caller: &str, request: IdsRequest) -> MailResult<usize> {
        if request.ids.is_empty() {
            return Err(MailError::validation("ids must not be empty"));
        }
        Ok(self.sync.mark_many_unread(caller, &request.ids).await?.len())
    }

    pub async fn clear_trash(&self, caller: &str) -> MailResult<ClearTrashReport> {
        self.sync.clear_trash(caller).await
    }

    pub async fn search(&self, caller: &str, query: &str) -> MailResult<Vec<Message>> {
        let query = query.trim();
        if query.is_empty() {
            return Err(MailError::validation("query is required"));
        }
        self.store().search(caller, query, None).await
    }

    pub async fn search_in_label(&self, caller: &str, label: &str, query: &str) -> MailResult<Vec<Message>> {
        let query = query.trim();
        if query.is_empty() {
            return Err(MailError::validation("query is required"));
        }
        let folder = self.folder(caller, label).await?;
        self.store().search(caller, query, Some(&folder)).await
    }

    pub async fn list_labels(&self, caller: &str) -> MailResult<Vec<Label>> {
        self.store().list_labels(caller).await
    }

    pub async fn get_label(&self, caller: &str, id: &str) -> MailResult<Label> {
        self.store().get_label(id, caller).await
    }

    pub async fn create_label(&self, caller: &str, request: LabelNameRequest) -> MailResult<Label> {
        let name = required(request.name, "name")?;
        self.sync.create_label(caller, &name).await
    }

    pub async fn rename_label(&self, caller: &str, id: &str, request: LabelNameRequest) -> MailResult<Label> {
        let name = required(request.name, "name")?;
        self.sync.rename_label(id, caller, &name).await
    }

    pub async fn delete_label(&self, caller: &str, id: &str) -> MailResult<Label> {
        self.sync.delete_label(id, caller).await
    }

    pub async fn label_emails(&self, caller: &str, name: &str) -> MailResult<Vec<Message>> {
        self.list(caller, Some(name)).await
    }

    pub async fn blacklist_add(&self, request: BlacklistRequest) -> MailResult<AddOutcome> {
        let url = required(request.url, "url")?;
        let outcome = self.engine().classifier().oracle().add(&url).await?;
        info!(url = %url, ?outcome, "blacklist add");
        Ok(outcome)
    }

    pub async fn blacklist_remove(&self, url: &str) -> MailResult<RemoveOutcome> {
        let outcome = self.engine().classifier().oracle().remove(url).await?;
        info!(url, ?outcome, "blacklist remove");
        Ok(outcome)
    }

    pub async fn sync_mailbox(&self, caller: &str) -> MailResult<SyncReport> {
        self.sync.sync_owner(caller).await
    }

    pub fn pending(&self, caller: &str) -> Vec<PendingReconciliation> {
        self.sync
            .pending_reconciliations()
            .into_iter()
            .filter(|entry| entry.owner_id == caller)
            .collect()
    }

    pub async fn retry_pending(&self) -> RetryReport {
        self.sync.retry_pending().await
    }
}
