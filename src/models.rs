use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::labels::{LabelSet, Tag};

/// One mailbox-scoped copy of a message. A send produces two of these (the
/// sender's and the recipient's) that never share state afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub sender_id: String,
    pub sender_name: String,
    pub recipient_id: String,
    pub recipient_name: String,
    pub recipient_email: String,
    pub subject: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub owner_id: String,
    pub read: bool,
    pub starred: bool,
    pub labels: LabelSet,
}

impl Message {
    /// Flips `starred` and keeps the `starred` tag in step. Returns the new state.
    pub fn toggle_star(&mut self) -> bool {
        self.starred = !self.starred;
        if self.starred {
            self.labels.insert(Tag::Starred);
        } else {
            self.labels.remove(&Tag::Starred);
        }
        self.starred
    }

    /// Sets `read` and keeps the `read` tag in step. Returns whether anything changed.
    pub fn set_read(&mut self, read: bool) -> bool {
        let changed = self.read != read || self.labels.contains(&Tag::Read) != read;
        self.read = read;
        if read {
            self.labels.insert(Tag::Read);
        } else {
            self.labels.remove(&Tag::Read);
        }
        changed
    }

    /// Re-derives the boolean flags after a label-level edit touched
    /// `starred` or `read` directly.
    pub fn sync_flags(&mut self) {
        self.starred = self.labels.contains(&Tag::Starred);
        self.read = self.labels.contains(&Tag::Read);
    }

    pub fn text(&self) -> String {
        format!("{} {}", self.subject, self.content)
    }
}

/// A user-defined label. Names are unique per owner, compared case-insensitively.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Label {
    pub id: String,
    pub owner_id: String,
    pub name: String,
    #[sqlx(default)]
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub display_name: String,
}

impl Label {
    pub fn new(id: impl Into<String>, owner_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            owner_id: owner_id.into(),
            name: name.into(),
            display_name: String::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct MessageLabelLink {
    pub message_id: String,
    pub label_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlacklistEntry {
    pub url: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Directory entry used to resolve sender and recipient names.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: String,
    pub first_name: String,
    pub last_name: String,
    pub email: String,
}

impl User {
    pub fn display_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
            .trim()
            .to_string()
    }
}

/// A replica message together with its linked labels.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageWithLabels {
    pub message: Message,
    pub label_rows: Vec<Label>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ComposeRequest {
    #[serde(default)]
    pub to: Option<String>,
    #[serde(default)]
    pub subject: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct EditDraftRequest {
    #[serde(default)]
    pub subject: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LabelAction {
    #[default]
    Add,
    Remove,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LabelRequest {
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub action: LabelAction,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IdsRequest {
    pub ids: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReadRequest {
    #[serde(default = "default_read")]
    pub read: bool,
}

fn default_read() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct LabelNameRequest {
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BlacklistRequest {
    #[serde(default, alias = "id")]
    pub url: Option<String>,
}

#[cfg(test)]
pub(crate) fn sample_message(id: &str, owner: &str, labels: &[&str]) -> Message {
    Message {
        id: id.to_string(),
        sender_id: "alice".to_string(),
        sender_name: "Alice Doe".to_string(),
        recipient_id: "bob".to_string(),
        recipient_name: "Bob Roe".to_string(),
        recipient_email: "bob@example.com".to_string(),
        subject: "hello".to_string(),
        content: "body".to_string(),
        timestamp: crate::store::now(),
        owner_id: owner.to_string(),
        read: false,
        starred: false,
        labels: LabelSet::parse_all(labels).unwrap(),
    }
}
