//! Offline mirror of the mailbox: message rows plus a normalized
//! message/label relation.
//!
//! Every write bumps a version counter. [`Subscription`]s re-read their query
//! whenever it moves, so a subscriber watching a message during
//! `replace_authoritative` can observe the intermediate state where the old
//! links are cleared and the new ones are not yet written. That window is
//! expected; the final snapshot always reflects the rebuilt relation.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use futures::Stream;
use futures::stream;
use inflections::case::to_title_case;
use serde::Serialize;
use sqlx::Row;
use sqlx::sqlite::{SqlitePool, SqliteRow};
use tokio::sync::watch;
use tracing::{debug, info};

use crate::error::MailResult;
use crate::labels::{Folder, LabelSet, Tag};
use crate::models::{Label, Message, MessageLabelLink, MessageWithLabels};
use crate::store::{self, like_pattern, millis_to_datetime};

/// Owner of the shared rows that mirror reserved tags.
pub const SYSTEM_OWNER: &str = "";

const MESSAGE_COLUMNS: &str = "m.id, m.owner_id, m.sender_id, m.sender_name, m.recipient_id, \
     m.recipient_name, m.recipient_email, m.subject, m.content, m.timestamp, m.read, m.starred";

fn message_from_row(row: &SqliteRow, labels: LabelSet) -> Message {
    Message {
        id: row.get(0),
        owner_id: row.get(1),
        sender_id: row.get(2),
        sender_name: row.get(3),
        recipient_id: row.get(4),
        recipient_name: row.get(5),
        recipient_email: row.get(6),
        subject: row.get(7),
        content: row.get(8),
        timestamp: millis_to_datetime(row.get(9)),
        read: row.get(10),
        starred: row.get(11),
        labels,
    }
}

fn with_display_name(mut label: Label) -> Label {
    label.display_name = to_title_case(&label.name);
    label
}

#[derive(Debug, Clone)]
pub struct ReplicaStore {
    pool: SqlitePool,
    version: Arc<watch::Sender<u64>>,
}

impl ReplicaStore {
    pub async fn new(database_url: &str) -> MailResult<Self> {
        let replica = Self::with_pool(store::connect(database_url).await?);
        replica.run_migrations().await?;
        Ok(replica)
    }

    pub async fn open_memory() -> MailResult<Self> {
        let replica = Self::with_pool(store::connect_memory().await?);
        replica.run_migrations().await?;
        Ok(replica)
    }

    fn with_pool(pool: SqlitePool) -> Self {
        let (version, _) = watch::channel(0);
        Self {
            pool,
            version: Arc::new(version),
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn run_migrations(&self) -> MailResult<()> {
        let schema = include_str!("../migrations/replica.sql");
        sqlx::query(schema).execute(&self.pool).await?;
        Ok(())
    }

    pub fn version(&self) -> u64 {
        *self.version.borrow()
    }

    fn bump(&self) {
        self.version.send_modify(|version| *version += 1);
    }

    pub fn subscribe(&self, query: WatchQuery) -> Subscription {
        Subscription {
            replica: self.clone(),
            query,
            changes: self.version.subscribe(),
        }
    }

    pub async fn upsert_message(&self, message: &Message) -> MailResult<()> {
        sqlx::query(
            "INSERT INTO messages (id, owner_id, sender_id, sender_name, recipient_id, recipient_name,
                 recipient_email, subject, content, timestamp, read, starred)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET subject=excluded.subject, content=excluded.content,
             timestamp=excluded.timestamp, read=excluded.read, starred=excluded.starred",
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
        .execute(&self.pool)
        .await?;
        self.bump();
        Ok(())
    }

    /// Inserts labels that are not mirrored yet; existing rows are left alone.
    /// Returns how many were new.
    pub async fn upsert_labels(&self, labels: &[Label]) -> MailResult<u64> {
        let mut inserted = 0;
        for label in labels {
            inserted += sqlx::query("INSERT OR IGNORE INTO labels (id, owner_id, name) VALUES (?, ?, ?)")
                .bind(&label.id)
                .bind(&label.owner_id)
                .bind(&label.name)
                .execute(&self.pool)
                .await?
                .rows_affected();
        }
        if inserted > 0 {
            self.bump();
        }
        Ok(inserted)
    }

    /// Overwrites a mirrored label, e.g. after a rename.
    pub async fn save_label(&self, label: &Label) -> MailResult<()> {
        sqlx::query(
            "INSERT INTO labels (id, owner_id, name) VALUES (?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET name=excluded.name",
        )
        .bind(&label.id)
        .bind(&label.owner_id)
        .bind(&label.name)
        .execute(&self.pool)
        .await?;
        self.bump();
        Ok(())
    }

    /// Upserts label rows, replacing the name of rows that already exist.
    pub async fn save_labels(&self, labels: &[Label]) -> MailResult<()> {
        if labels.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        for label in labels {
            sqlx::query(
                "INSERT INTO labels (id, owner_id, name) VALUES (?, ?, ?)
                 ON CONFLICT(id) DO UPDATE SET name=excluded.name",
            )
            .bind(&label.id)
            .bind(&label.owner_id)
            .bind(&label.name)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        self.bump();
        Ok(())
    }

    pub async fn get_label(&self, id: &str) -> MailResult<Option<Label>> {
        let label = sqlx::query_as::<_, Label>("SELECT id, owner_id, name FROM labels WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(label.map(with_display_name))
    }

    /// The owner's labels plus the shared reserved ones, inbox first.
    pub async fn get_labels(&self, owner_id: &str) -> MailResult<Vec<Label>> {
        let mut labels: Vec<Label> = sqlx::query_as::<_, Label>(
            "SELECT id, owner_id, name FROM labels WHERE owner_id = ? OR owner_id = ? ORDER BY name ASC",
        )
        .bind(owner_id)
        .bind(SYSTEM_OWNER)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(with_display_name)
        .collect();

        let inbox = Tag::Inbox.as_str();
        labels.sort_by(|a, b| {
            if a.id == inbox {
                std::cmp::Ordering::Less
            } else if b.id == inbox {
                std::cmp::Ordering::Greater
            } else {
                a.name.cmp(&b.name)
            }
        });

        Ok(labels)
    }

    /// Deletes a label and every link that references it.
    pub async fn delete_label(&self, id: &str) -> MailResult<u64> {
        let mut tx = self.pool.begin().await?;
        let unlinked = sqlx::query("DELETE FROM message_labels WHERE label_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        sqlx::query("DELETE FROM labels WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        self.bump();
        info!(label_id = id, unlinked, "replica label deleted");
        Ok(unlinked)
    }

    pub async fn add_link(&self, message_id: &str, label_id: &str) -> MailResult<()> {
        sqlx::query("INSERT OR IGNORE INTO message_labels (message_id, label_id) VALUES (?, ?)")
            .bind(message_id)
            .bind(label_id)
            .execute(&self.pool)
            .await?;
        self.bump();
        Ok(())
    }

    pub async fn clear_links_for_message(&self, message_id: &str) -> MailResult<u64> {
        let cleared = sqlx::query("DELETE FROM message_labels WHERE message_id = ?")
            .bind(message_id)
            .execute(&self.pool)
            .await?
            .rows_affected();
        self.bump();
        debug!(message_id, cleared, "replica links cleared");
        Ok(cleared)
    }

    pub async fn links_for_message(&self, message_id: &str) -> MailResult<Vec<MessageLabelLink>> {
        let links = sqlx::query_as::<_, MessageLabelLink>(
            "SELECT message_id, label_id FROM message_labels WHERE message_id = ? ORDER BY label_id ASC",
        )
        .bind(message_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(links)
    }

    pub async fn links_for_label(&self, label_id: &str) -> MailResult<Vec<MessageLabelLink>> {
        let links = sqlx::query_as::<_, MessageLabelLink>(
            "SELECT message_id, label_id FROM message_labels WHERE label_id = ? ORDER BY message_id ASC",
        )
        .bind(label_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(links)
    }

    pub async fn labels_for_message(&self, message_id: &str) -> MailResult<Vec<Label>> {
        let labels = sqlx::query_as::<_, Label>(
            "SELECT l.id, l.owner_id, l.name FROM labels l
             JOIN message_labels ml ON l.id = ml.label_id
             WHERE ml.message_id = ?
             ORDER BY l.name ASC",
        )
        .bind(message_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(labels.into_iter().map(with_display_name).collect())
    }

    pub async fn get_message(&self, id: &str) -> MailResult<Option<MessageWithLabels>> {
        let Some(row) = sqlx::query(&format!("SELECT {MESSAGE_COLUMNS} FROM messages m WHERE m.id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
        else {
            return Ok(None);
        };

        let label_rows = self.labels_for_message(id).await?;
        let labels = label_rows
            .iter()
            .filter_map(|label| Tag::parse(&label.name).ok())
            .collect();
        Ok(Some(MessageWithLabels {
            message: message_from_row(&row, labels),
            label_rows,
        }))
    }

    // Tag sets for every message of `owner_id`, built from the link relation.
    async fn tag_sets(&self, owner_id: &str) -> MailResult<HashMap<String, LabelSet>> {
        let rows = sqlx::query(
            "SELECT ml.message_id, l.name FROM message_labels ml
             JOIN labels l ON l.id = ml.label_id
             JOIN messages m ON m.id = ml.message_id
             WHERE m.owner_id = ?",
        )
        .bind(owner_id)
        .fetch_all(&self.pool)
        .await?;

        let mut sets: HashMap<String, LabelSet> = HashMap::new();
        for row in rows {
            let name: String = row.get(1);
            if let Ok(tag) = Tag::parse(&name) {
                sets.entry(row.get(0)).or_default().insert(tag);
            }
        }
        Ok(sets)
    }

    /// All of an owner's mirrored messages, newest first.
    pub async fn messages_for_owner(&self, owner_id: &str) -> MailResult<Vec<Message>> {
        let rows = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages m WHERE m.owner_id = ?
             ORDER BY m.timestamp DESC, m.id DESC"
        ))
        .bind(owner_id)
        .fetch_all(&self.pool)
        .await?;

        let mut sets = self.tag_sets(owner_id).await?;
        Ok(rows
            .iter()
            .map(|row| {
                let id: String = row.get(0);
                let labels = sets.remove(&id).unwrap_or_default();
                message_from_row(row, labels)
            })
            .collect())
    }

    pub async fn message_ids_for_owner(&self, owner_id: &str) -> MailResult<Vec<String>> {
        let rows = sqlx::query("SELECT id FROM messages WHERE owner_id = ? ORDER BY id ASC")
            .bind(owner_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(|row| row.get(0)).collect())
    }

    /// Messages linked to `label_id`, newest first.
    pub async fn messages_by_label(&self, owner_id: &str, label_id: &str) -> MailResult<Vec<Message>> {
        let linked: HashSet<String> = self
            .links_for_label(label_id)
            .await?
            .into_iter()
            .map(|link| link.message_id)
            .collect();
        Ok(self
            .messages_for_owner(owner_id)
            .await?
            .into_iter()
            .filter(|message| linked.contains(&message.id))
            .collect())
    }

    pub async fn messages_in_folder(&self, owner_id: &str, folder: &Folder) -> MailResult<Vec<Message>> {
        Ok(self
            .messages_for_owner(owner_id)
            .await?
            .into_iter()
            .filter(|message| folder.matches(message, owner_id))
            .collect())
    }

    /// Case-insensitive substring match on subject, content, sender name and
    /// recipient email.
    pub async fn search(&self, owner_id: &str, query: &str) -> MailResult<Vec<Message>> {
        let pattern = like_pattern(query);
        let rows = sqlx::query(
            "SELECT id FROM messages
             WHERE owner_id = ?1 AND (subject LIKE ?2 ESCAPE '\\' OR content LIKE ?2 ESCAPE '\\'
                 OR sender_name LIKE ?2 ESCAPE '\\' OR recipient_email LIKE ?2 ESCAPE '\\')",
        )
        .bind(owner_id)
        .bind(&pattern)
        .fetch_all(&self.pool)
        .await?;
        let hits: HashSet<String> = rows.into_iter().map(|row| row.get(0)).collect();

        Ok(self
            .messages_for_owner(owner_id)
            .await?
            .into_iter()
            .filter(|message| hits.contains(&message.id))
            .collect())
    }

    pub async fn delete_message(&self, id: &str) -> MailResult<bool> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM message_labels WHERE message_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        let deleted = sqlx::query("DELETE FROM messages WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        tx.commit().await?;
        self.bump();
        Ok(deleted > 0)
    }

    /// Deletes the listed messages with their links. Returns how many
    /// messages were present.
    pub async fn delete_messages(&self, ids: &[String]) -> MailResult<u64> {
        let mut deleted = 0;
        let mut tx = self.pool.begin().await?;
        for id in ids {
            sqlx::query("DELETE FROM message_labels WHERE message_id = ?")
                .bind(id)
                .execute(&mut *tx)
                .await?;
            deleted += sqlx::query("DELETE FROM messages WHERE id = ?")
                .bind(id)
                .execute(&mut *tx)
                .await?
                .rows_affected();
        }
        tx.commit().await?;
        self.bump();

        info!(requested = ids.len(), deleted, "replica messages deleted");
        Ok(deleted)
    }
}

/// What a [`Subscription`] watches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchQuery {
    Message(String),
    Mailbox(String),
    Label { owner_id: String, label_id: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase", untagged)]
pub enum Snapshot {
    Message(Option<MessageWithLabels>),
    Messages(Vec<Message>),
}

/// Reactive read of one [`WatchQuery`].
pub struct Subscription {
    replica: ReplicaStore,
    query: WatchQuery,
    changes: watch::Receiver<u64>,
}

impl Subscription {
    pub fn query(&self) -> &WatchQuery {
        &self.query
    }

    pub async fn current(&self) -> MailResult<Snapshot> {
        match &self.query {
            WatchQuery::Message(id) => Ok(Snapshot::Message(self.replica.get_message(id).await?)),
            WatchQuery::Mailbox(owner_id) => Ok(Snapshot::Messages(
                self.replica.messages_for_owner(owner_id).await?,
            )),
            WatchQuery::Label { owner_id, label_id } => Ok(Snapshot::Messages(
                self.replica.messages_by_label(owner_id, label_id).await?,
            )),
        }
    }

    /// Waits for the next write and returns the fresh snapshot. `None` once
    /// the replica is gone.
    pub async fn changed(&mut self) -> Option<MailResult<Snapshot>> {
        self.changes.changed().await.ok()?;
        self.changes.borrow_and_update();
        Some(self.current().await)
    }

    /// The current snapshot followed by one snapshot per observed change.
    pub fn into_stream(self) -> impl Stream<Item = MailResult<Snapshot>> {
        stream::unfold((self, true), |(mut subscription, first)| async move {
            let next = if first {
                Some(subscription.current().await)
            } else {
                subscription.changed().await
            };
            next.map(|snapshot| (snapshot, (subscription, false)))
        })
    }
}

#[cfg(test)]
mod tests {
    use futures::StreamExt;

    use super::*;
    use crate::models::sample_message;

    async fn replica() -> ReplicaStore {
        ReplicaStore::open_memory().await.unwrap()
    }

    fn system(name: &str) -> Label {
        Label::new(name, SYSTEM_OWNER, name)
    }

    async fn mirror(replica: &ReplicaStore, message: &Message) {
        replica.upsert_message(message).await.unwrap();
        let labels: Vec<Label> = message.labels.iter().map(|t| system(t.as_str())).collect();
        replica.upsert_labels(&labels).await.unwrap();
        for label in &labels {
            replica.add_link(&message.id, &label.id).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_message_labels_come_from_links() {
        let replica = replica().await;
        mirror(&replica, &sample_message("m1", "bob", &["inbox", "starred"])).await;

        let found = replica.get_message("m1").await.unwrap().unwrap();
        assert_eq!(found.message.labels.names(), ["inbox", "starred"]);
        assert_eq!(found.label_rows.len(), 2);
        assert_eq!(found.label_rows[0].display_name, "Inbox");
    }

    #[tokio::test]
    async fn test_upsert_labels_ignores_existing() {
        let replica = replica().await;
        assert_eq!(replica.upsert_labels(&[system("inbox")]).await.unwrap(), 1);

        let renamed = Label::new("inbox", SYSTEM_OWNER, "something else");
        assert_eq!(replica.upsert_labels(&[renamed]).await.unwrap(), 0);
        assert_eq!(replica.get_label("inbox").await.unwrap().unwrap().name, "inbox");
    }

    #[tokio::test]
    async fn test_get_labels_puts_inbox_first() {
        let replica = replica().await;
        replica
            .upsert_labels(&[
                system("archive"),
                system("inbox"),
                Label::new("l1", "bob", "work"),
                Label::new("l2", "carol", "private"),
            ])
            .await
            .unwrap();

        let names: Vec<String> = replica
            .get_labels("bob")
            .await
            .unwrap()
            .into_iter()
            .map(|l| l.name)
            .collect();
        assert_eq!(names, ["inbox", "archive", "work"]);
    }

    #[tokio::test]
    async fn test_delete_label_cascades_links() {
        let replica = replica().await;
        mirror(&replica, &sample_message("m1", "bob", &["inbox", "work"])).await;
        mirror(&replica, &sample_message("m2", "bob", &["work"])).await;

        assert_eq!(replica.delete_label("work").await.unwrap(), 2);
        assert!(replica.links_for_label("work").await.unwrap().is_empty());
        assert_eq!(replica.links_for_message("m1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_delete_messages_takes_links_along() {
        let replica = replica().await;
        mirror(&replica, &sample_message("t1", "bob", &["trash"])).await;
        mirror(&replica, &sample_message("t2", "bob", &["trash", "work"])).await;
        mirror(&replica, &sample_message("keep", "bob", &["trash"])).await;

        let ids = vec!["t1".to_string(), "t2".to_string(), "gone".to_string()];
        assert_eq!(replica.delete_messages(&ids).await.unwrap(), 2);
        assert!(replica.get_message("t1").await.unwrap().is_none());
        assert!(replica.links_for_message("t2").await.unwrap().is_empty());
        assert!(replica.get_message("keep").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_save_labels_replaces_names() {
        let replica = replica().await;
        replica.upsert_labels(&[Label::new("l1", "bob", "l1")]).await.unwrap();
        replica.upsert_labels(&[Label::new("l1", "bob", "work")]).await.unwrap();
        assert_eq!(replica.get_label("l1").await.unwrap().unwrap().name, "l1");

        replica.save_labels(&[Label::new("l1", "bob", "work")]).await.unwrap();
        assert_eq!(replica.get_label("l1").await.unwrap().unwrap().name, "work");
    }

    #[tokio::test]
    async fn test_search_matches_sender_and_recipient() {
        let replica = replica().await;
        mirror(&replica, &sample_message("m1", "bob", &["inbox"])).await;

        assert_eq!(replica.search("bob", "alice doe").await.unwrap().len(), 1);
        assert_eq!(replica.search("bob", "BOB@EXAMPLE").await.unwrap().len(), 1);
        assert!(replica.search("bob", "nobody").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_subscription_sees_each_write() {
        let replica = replica().await;
        mirror(&replica, &sample_message("m1", "bob", &["inbox"])).await;

        let mut stream = Box::pin(replica.subscribe(WatchQuery::Message("m1".into())).into_stream());
        let first = stream.next().await.unwrap().unwrap();
        let Snapshot::Message(Some(first)) = first else {
            panic!("expected message snapshot");
        };
        assert_eq!(first.message.labels.names(), ["inbox"]);

        replica.clear_links_for_message("m1").await.unwrap();
        let Snapshot::Message(Some(cleared)) = stream.next().await.unwrap().unwrap() else {
            panic!("expected message snapshot");
        };
        assert!(cleared.message.labels.is_empty());
    }
}
