pub mod classifier;
pub mod config;
pub mod engine;
pub mod error;
pub mod http;
pub mod labels;
pub mod locks;
pub mod models;
pub mod oracle;
pub mod replica;
pub mod service;
pub mod store;
pub mod sync;
pub mod urls;

use std::time::Duration;

use classifier::SpamClassifier;
use config::Config;
use engine::LabelEngine;
use error::MailResult;
use locks::MessageLocks;
use replica::ReplicaStore;
use service::MailboxService;
use store::MailStore;
use sync::SyncCoordinator;

/// Wires the full stack over already-opened stores.
pub fn build_service(config: &Config, store: MailStore, replica: ReplicaStore) -> MailResult<MailboxService> {
    let oracle = oracle::from_config(&config.oracle, store.pool())?;
    let classifier = SpamClassifier::new(
        oracle,
        config.classification.on_oracle_failure,
        Duration::from_millis(config.classification.timeout_ms),
    );
    let engine = LabelEngine::new(store, classifier, MessageLocks::new());
    Ok(MailboxService::new(SyncCoordinator::new(engine, replica)))
}
