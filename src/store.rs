//! Authoritative mailbox store. Labels are embedded on each message row as a
//! JSON array of canonical tag names.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{Executor, Row, Sqlite};
use tracing::{debug, info};

use crate::error::{MailError, MailResult};
use crate::labels::{Folder, LabelSet, Tag};
use crate::models::{Label, Message, User};

const MESSAGE_COLUMNS: &str = "id, owner_id, sender_id, sender_name, recipient_id, recipient_name, \
     recipient_email, subject, content, timestamp, read, starred, labels";

pub fn millis_to_datetime(millis: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_millis(millis).unwrap_or_default()
}

/// Current time at the precision the stores keep.
pub fn now() -> DateTime<Utc> {
    millis_to_datetime(Utc::now().timestamp_millis())
}

/// `%`, `_` and `\` escaped for a `LIKE ... ESCAPE '\'` pattern.
pub(crate) fn like_pattern(query: &str) -> String {
    let mut pattern = String::with_capacity(query.len() + 2);
    pattern.push('%');
    for c in query.chars() {
        if matches!(c, '%' | '_' | '\\') {
            pattern.push('\\');
        }
        pattern.push(c);
    }
    pattern.push('%');
    pattern
}

pub(crate) async fn connect(url: &str) -> MailResult<SqlitePool> {
    let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
    Ok(SqlitePool::connect_with(options).await?)
}

/// A single-connection in-memory database. Every connection to
/// `sqlite::memory:` is its own database, so the pool must never open a
/// second one or recycle the first.
pub(crate) async fn connect_memory() -> MailResult<SqlitePool> {
    Ok(SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await?)
}

fn message_from_row(row: &SqliteRow) -> MailResult<Message> {
    let labels: String = row.get("labels");
    Ok(Message {
        id: row.get("id"),
        owner_id: row.get("owner_id"),
        sender_id: row.get("sender_id"),
        sender_name: row.get("sender_name"),
        recipient_id: row.get("recipient_id"),
        recipient_name: row.get("recipient_name"),
        recipient_email: row.get("recipient_email"),
        subject: row.get("subject"),
        content: row.get("content"),
        timestamp: millis_to_datetime(row.get("timestamp")),
        read: row.get("read"),
        starred: row.get("starred"),
        labels: serde_json::from_str::<LabelSet>(&labels)?,
    })
}

async fn insert_message_with<'e, E>(executor: E, message: &Message) -> MailResult<()>
where
    E: Executor<'e, Database = Sqlite>,
{
    let labels = serde_json::to_string(&message.labels)?;
    sqlx::query(
        "INSERT INTO messages (id, owner_id, sender_id, sender_name, recipient_id, recipient_name,
             recipient_email, subject, content, timestamp, read, starred, labels)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&message.id)
    .bind(&message.owner_id)
    .bind(&message.sender_id)
    .bind(&message.sender_name)
    .bind(&message.recipient_id)
    .bind(&message.recipient_name)
    .bind(&message.recipient_email)
    .bind(&message.subject)
    .bind(&message.content)
    .bind(message.timestamp.timestamp_millis())
    .bind(message.read)
    .bind(message.starred)
    .bind(labels)
    .execute(executor)
    .await?;
    Ok(())
}

async fn write_labels_with<'e, E>(executor: E, message: &Message) -> MailResult<()>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query("UPDATE messages SET labels = ?, read = ?, starred = ? WHERE id = ?")
        .bind(serde_json::to_string(&message.labels)?)
        .bind(message.read)
        .bind(message.starred)
        .bind(&message.id)
        .execute(executor)
        .await?;
    Ok(())
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .is_some_and(|db| db.is_unique_violation())
}

#[derive(Debug, Clone)]
pub struct MailStore {
    pool: SqlitePool,
}

impl MailStore {
    pub async fn open(database_url: &str) -> MailResult<Self> {
        let store = Self {
            pool: connect(database_url).await?,
        };
        store.run_migrations().await?;
        Ok(store)
    }

    pub async fn open_memory() -> MailResult<Self> {
        let store = Self {
            pool: connect_memory().await?,
        };
        store.run_migrations().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn run_migrations(&self) -> MailResult<()> {
        let schema = include_str!("../migrations/mailbox.sql");
        sqlx::query(schema).execute(&self.pool).await?;
        Ok(())
    }

    pub async fn upsert_user(&self, user: &User) -> MailResult<()> {
        sqlx::query(
            "INSERT INTO users (id, first_name, last_name, email) VALUES (?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET first_name=excluded.first_name,
             last_name=excluded.last_name, email=excluded.email",
        )
        .bind(&user.id)
        .bind(&user.first_name)
        .bind(&user.last_name)
        .bind(&user.email)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_user(&self, id: &str) -> MailResult<Option<User>> {
        let user = sqlx::query_as::<_, User>(
            "SELECT id, first_name, last_name, email FROM users WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(user)
    }

    pub async fn insert_message(&self, message: &Message) -> MailResult<()> {
        insert_message_with(&self.pool, message).await?;
        debug!(message_id = %message.id, owner_id = %message.owner_id, "message stored");
        Ok(())
    }

    /// Stores both copies of one send, or neither.
    pub async fn insert_pair(&self, sender_copy: &Message, recipient_copy: &Message) -> MailResult<()> {
        let mut tx = self.pool.begin().await?;
        insert_message_with(&mut *tx, sender_copy).await?;
        insert_message_with(&mut *tx, recipient_copy).await?;
        tx.commit().await?;
        info!(
            sender_copy = %sender_copy.id,
            recipient_copy = %recipient_copy.id,
            "send stored"
        );
        Ok(())
    }

    pub async fn get_message(&self, id: &str) -> MailResult<Option<Message>> {
        let row = sqlx::query(&format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(message_from_row).transpose()
    }

    /// The message, provided it belongs to `owner_id`. Someone else's message
    /// is reported exactly like a missing one.
    pub async fn get_owned_message(&self, id: &str, owner_id: &str) -> MailResult<Message> {
        match self.get_message(id).await? {
            Some(message) if message.owner_id == owner_id => Ok(message),
            _ => Err(MailError::not_found(format!("message {id}"))),
        }
    }

    /// Persists the label set and derived flags of `message`.
    pub async fn save_labels(&self, message: &Message) -> MailResult<()> {
        write_labels_with(&self.pool, message).await?;
        debug!(message_id = %message.id, labels = ?message.labels.names(), "labels stored");
        Ok(())
    }

    /// Persists several label sets in one transaction.
    pub async fn save_labels_many(&self, messages: &[Message]) -> MailResult<()> {
        let mut tx = self.pool.begin().await?;
        for message in messages {
            write_labels_with(&mut *tx, message).await?;
        }
        tx.commit().await?;
        debug!(count = messages.len(), "labels stored");
        Ok(())
    }

    pub async fn update_content(&self, message: &Message) -> MailResult<()> {
        let result = sqlx::query(
            "UPDATE messages SET subject = ?, content = ?, timestamp = ? WHERE id = ?",
        )
        .bind(&message.subject)
        .bind(&message.content)
        .bind(message.timestamp.timestamp_millis())
        .bind(&message.id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(MailError::not_found(format!("message {}", message.id)));
        }
        Ok(())
    }

    pub async fn delete_message(&self, id: &str, owner_id: &str) -> MailResult<()> {
        let result = sqlx::query("DELETE FROM messages WHERE id = ? AND owner_id = ?")
            .bind(id)
            .bind(owner_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(MailError::not_found(format!("message {id}")));
        }
        info!(message_id = id, owner_id, "message deleted");
        Ok(())
    }

    /// All of an owner's messages, newest first.
    pub async fn messages_for_owner(&self, owner_id: &str) -> MailResult<Vec<Message>> {
        let rows = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE owner_id = ?
             ORDER BY timestamp DESC, id DESC"
        ))
        .bind(owner_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(message_from_row).collect()
    }

    pub async fn message_ids_for_owner(&self, owner_id: &str) -> MailResult<Vec<String>> {
        let ids = sqlx::query_scalar::<_, String>("SELECT id FROM messages WHERE owner_id = ?")
            .bind(owner_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(ids)
    }

    pub async fn messages_in_folder(&self, owner_id: &str, folder: &Folder) -> MailResult<Vec<Message>> {
        Ok(self
            .messages_for_owner(owner_id)
            .await?
            .into_iter()
            .filter(|message| folder.matches(message, owner_id))
            .collect())
    }

    /// Case-insensitive substring match on subject and content, newest first,
    /// optionally restricted to a folder.
    pub async fn search(
        &self,
        owner_id: &str,
        query: &str,
        folder: Option<&Folder>,
    ) -> MailResult<Vec<Message>> {
        let pattern = like_pattern(query);
        let rows = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages
             WHERE owner_id = ? AND (subject LIKE ? ESCAPE '\\' OR content LIKE ? ESCAPE '\\')
             ORDER BY timestamp DESC, id DESC"
        ))
        .bind(owner_id)
        .bind(&pattern)
        .bind(&pattern)
        .fetch_all(&self.pool)
        .await?;

        let mut messages = rows
            .iter()
            .map(message_from_row)
            .collect::<MailResult<Vec<_>>>()?;
        if let Some(folder) = folder {
            messages.retain(|message| folder.matches(message, owner_id));
        }
        Ok(messages)
    }

    /// Ids of the owner's messages tagged `trash`.
    pub async fn trashed_ids(&self, owner_id: &str) -> MailResult<Vec<String>> {
        Ok(self
            .messages_for_owner(owner_id)
            .await?
            .into_iter()
            .filter(|message| message.labels.contains(&Tag::Trash))
            .map(|message| message.id)
            .collect())
    }

    /// Deletes those of `ids` that belong to `owner_id` and still carry
    /// `trash` when re-read inside the transaction. Returns the deleted ids.
    pub async fn delete_trashed(&self, owner_id: &str, ids: &[String]) -> MailResult<Vec<String>> {
        let mut removed = Vec::with_capacity(ids.len());
        let mut tx = self.pool.begin().await?;
        for id in ids {
            let row = sqlx::query(&format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ? AND owner_id = ?"
            ))
            .bind(id)
            .bind(owner_id)
            .fetch_optional(&mut *tx)
            .await?;
            let Some(message) = row.as_ref().map(message_from_row).transpose()? else {
                continue;
            };
            if !message.labels.contains(&Tag::Trash) {
                debug!(message_id = %id, "no longer trashed, kept");
                continue;
            }
            sqlx::query("DELETE FROM messages WHERE id = ?")
                .bind(id)
                .execute(&mut *tx)
                .await?;
            removed.push(message.id);
        }
        tx.commit().await?;

        info!(owner_id, count = removed.len(), "trash cleared");
        Ok(removed)
    }

    pub async fn list_labels(&self, owner_id: &str) -> MailResult<Vec<Label>> {
        let labels = sqlx::query_as::<_, Label>(
            "SELECT id, owner_id, name FROM labels WHERE owner_id = ? ORDER BY name COLLATE NOCASE ASC",
        )
        .bind(owner_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(labels)
    }

    pub async fn get_label(&self, id: &str, owner_id: &str) -> MailResult<Label> {
        sqlx::query_as::<_, Label>("SELECT id, owner_id, name FROM labels WHERE id = ? AND owner_id = ?")
            .bind(id)
            .bind(owner_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| MailError::not_found(format!("label {id}")))
    }

    pub async fn find_label_by_name(&self, owner_id: &str, name: &str) -> MailResult<Option<Label>> {
        let label = sqlx::query_as::<_, Label>(
            "SELECT id, owner_id, name FROM labels WHERE owner_id = ? AND name = ? COLLATE NOCASE",
        )
        .bind(owner_id)
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        Ok(label)
    }

    pub async fn create_label(&self, owner_id: &str, name: &str) -> MailResult<Label> {
        let name = custom_label_name(name)?;
        if self.find_label_by_name(owner_id, &name).await?.is_some() {
            return Err(MailError::Conflict(format!("label `{name}` already exists")));
        }

        let label = Label::new(uuid::Uuid::new_v4().to_string(), owner_id, name);
        sqlx::query("INSERT INTO labels (id, owner_id, name) VALUES (?, ?, ?)")
            .bind(&label.id)
            .bind(&label.owner_id)
            .bind(&label.name)
            .execute(&self.pool)
            .await
            .map_err(|err| {
                if is_unique_violation(&err) {
                    MailError::Conflict(format!("label `{}` already exists", label.name))
                } else {
                    err.into()
                }
            })?;

        info!(label_id = %label.id, owner_id, name = %label.name, "label created");
        Ok(label)
    }

    /// Renames a label and re-tags the owner's messages that carried the old
    /// name. Returns the updated label and the re-tagged messages. The caller
    /// holds the locks of the owner's messages.
    pub async fn rename_label(
        &self,
        id: &str,
        owner_id: &str,
        new_name: &str,
    ) -> MailResult<(Label, Vec<Message>)> {
        let new_name = custom_label_name(new_name)?;
        let mut label = self.get_label(id, owner_id).await?;
        if let Some(existing) = self.find_label_by_name(owner_id, &new_name).await? {
            if existing.id != label.id {
                return Err(MailError::Conflict(format!("label `{new_name}` already exists")));
            }
        }

        let old_tag = Tag::Custom(label.name.clone());
        let new_tag = Tag::Custom(new_name.clone());
        let messages = self.messages_for_owner(owner_id).await?;
        let mut retagged = Vec::new();

        let mut tx = self.pool.begin().await?;
        sqlx::query("UPDATE labels SET name = ? WHERE id = ?")
            .bind(&new_name)
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(|err| {
                if is_unique_violation(&err) {
                    MailError::Conflict(format!("label `{new_name}` already exists"))
                } else {
                    err.into()
                }
            })?;
        for mut message in messages {
            if message.labels.remove(&old_tag) {
                message.labels.insert(new_tag.clone());
                write_labels_with(&mut *tx, &message).await?;
                retagged.push(message);
            }
        }
        tx.commit().await?;

        info!(label_id = id, owner_id, from = %label.name, to = %new_name, retagged = retagged.len(), "label renamed");
        label.name = new_name;
        Ok((label, retagged))
    }

    /// Deletes a label and strips its name from the owner's messages.
    /// Returns the deleted label and the messages that lost it. The caller
    /// holds the locks of the owner's messages.
    pub async fn delete_label(&self, id: &str, owner_id: &str) -> MailResult<(Label, Vec<Message>)> {
        let label = self.get_label(id, owner_id).await?;
        let tag = Tag::Custom(label.name.clone());
        let messages = self.messages_for_owner(owner_id).await?;
        let mut stripped = Vec::new();

        let mut tx = self.pool.begin().await?;
        for mut message in messages {
            if message.labels.remove(&tag) {
                write_labels_with(&mut *tx, &message).await?;
                stripped.push(message);
            }
        }
        sqlx::query("DELETE FROM labels WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        info!(label_id = id, owner_id, stripped = stripped.len(), "label deleted");
        Ok((label, stripped))
    }
}

/// User labels are plain custom tags; reserved names are refused.
fn custom_label_name(raw: &str) -> MailResult<String> {
    match Tag::parse(raw)? {
        Tag::Custom(name) => Ok(name),
        reserved => Err(MailError::validation(format!(
            "`{reserved}` is a reserved label name"
        ))),
    }
}
