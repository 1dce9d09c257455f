#![allow(dead_code)]

use tagmail::build_service;
use tagmail::config::Config;
use tagmail::models::{ComposeRequest, Message, User};
use tagmail::replica::ReplicaStore;
use tagmail::service::{MailboxService, SendResult};
use tagmail::store::MailStore;
use tokio_util::sync::CancellationToken;

pub const ALICE: &str = "alice";
pub const BOB: &str = "bob";
pub const CAROL: &str = "carol";

/// Full stack over in-memory stores with three known users.
pub async fn service() -> MailboxService {
    service_with(Config::default()).await
}

pub async fn service_with(config: Config) -> MailboxService {
    let store = MailStore::open_memory().await.unwrap();
    let replica = ReplicaStore::open_memory().await.unwrap();
    for (id, first, last) in [(ALICE, "Alice", "Doe"), (BOB, "Bob", "Roe"), (CAROL, "Carol", "Poe")] {
        store
            .upsert_user(&User {
                id: id.to_string(),
                first_name: first.to_string(),
                last_name: last.to_string(),
                email: format!("{id}@example.com"),
            })
            .await
            .unwrap();
    }
    build_service(&config, store, replica).unwrap()
}

pub fn compose(to: &str, subject: &str, content: &str) -> ComposeRequest {
    ComposeRequest {
        to: Some(to.to_string()),
        subject: Some(subject.to_string()),
        content: Some(content.to_string()),
    }
}

pub async fn send(service: &MailboxService, from: &str, to: &str, content: &str) -> SendResult {
    service
        .send(from, compose(to, "hello", content), &CancellationToken::new())
        .await
        .unwrap()
}

pub async fn replica_labels(service: &MailboxService, id: &str) -> Vec<String> {
    service
        .replica()
        .get_message(id)
        .await
        .unwrap()
        .map(|found| found.message.labels.names())
        .unwrap_or_default()
}

pub fn ids(messages: &[Message]) -> Vec<&str> {
    messages.iter().map(|m| m.id.as_str()).collect()
}
