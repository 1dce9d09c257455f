mod common;

use std::time::Duration;

use common::{ALICE, BOB, CAROL, compose, ids, replica_labels, send};
use tagmail::classifier::ClassificationPolicy;
use tagmail::config::{Config, OracleBackend};
use tagmail::error::MailError;
use tagmail::models::{BlacklistRequest, LabelAction, LabelRequest};
use tagmail::oracle::AddOutcome;
use tokio_util::sync::CancellationToken;

fn label(name: &str, action: LabelAction) -> LabelRequest {
    LabelRequest {
        label: Some(name.to_string()),
        action,
    }
}

async fn blacklist(service: &tagmail::service::MailboxService, url: &str) {
    let outcome = service
        .blacklist_add(BlacklistRequest {
            url: Some(url.to_string()),
        })
        .await
        .unwrap();
    assert_eq!(outcome, AddOutcome::Added);
}

#[tokio::test]
async fn clean_message_lands_in_inbox_and_sent() {
    let service = common::service().await;
    let sent = send(&service, ALICE, BOB, "lunch at noon?").await;

    assert_eq!(sent.recipient_copy.labels.names(), vec!["inbox"]);
    assert_eq!(sent.sender_copy.labels.names(), vec!["sent"]);
    assert_eq!(sent.recipient_copy.owner_id, BOB);
    assert_eq!(sent.sender_copy.owner_id, ALICE);
    assert_eq!(sent.recipient_copy.sender_name, "Alice Doe");

    let inbox = service.list(BOB, None).await.unwrap();
    assert_eq!(ids(&inbox), vec![sent.recipient_copy.id.as_str()]);
    let outbox = service.list(ALICE, Some("sent")).await.unwrap();
    assert_eq!(ids(&outbox), vec![sent.sender_copy.id.as_str()]);
    assert!(service.list(ALICE, None).await.unwrap().is_empty());

    assert_eq!(replica_labels(&service, &sent.recipient_copy.id).await, vec!["inbox"]);
    assert_eq!(replica_labels(&service, &sent.sender_copy.id).await, vec!["sent"]);
}

#[tokio::test]
async fn blacklisted_url_sends_recipient_copy_to_spam() {
    let service = common::service().await;
    blacklist(&service, "http://evil.test/x").await;

    let sent = send(&service, ALICE, BOB, "see http://evil.test/x").await;

    assert_eq!(sent.recipient_copy.labels.names(), vec!["spam"]);
    assert_eq!(sent.sender_copy.labels.names(), vec!["sent"]);
    assert!(service.list(BOB, None).await.unwrap().is_empty());
    assert_eq!(ids(&service.spam(BOB).await.unwrap()), vec![sent.recipient_copy.id.as_str()]);
    assert_eq!(replica_labels(&service, &sent.recipient_copy.id).await, vec!["spam"]);
}

#[tokio::test]
async fn marking_spam_blacklists_urls_and_keeps_star() {
    let service = common::service().await;
    let sent = send(&service, ALICE, BOB, "cheap pills at www.pills.test today").await;
    let id = sent.recipient_copy.id;
    service.toggle_star(BOB, &id).await.unwrap();

    let update = service
        .apply_label(BOB, &id, label("spam", LabelAction::Add))
        .await
        .unwrap();

    assert!(update.changed);
    assert_eq!(update.message.labels.names(), vec!["spam", "starred"]);
    assert!(update.message.starred);
    assert_eq!(update.blacklist.len(), 1);
    assert!(
        service
            .engine()
            .classifier()
            .oracle()
            .is_blacklisted("http://www.pills.test")
            .await
            .unwrap()
    );
    assert_eq!(replica_labels(&service, &id).await, vec!["spam", "starred"]);

    // The next message carrying the URL is classified as spam.
    let again = send(&service, CAROL, BOB, "still http://www.pills.test").await;
    assert!(again.recipient_copy.labels.is_spam());
}

#[tokio::test]
async fn unmarking_spam_only_drops_the_spam_tag() {
    let service = common::service().await;
    blacklist(&service, "http://promo.test").await;
    let sent = send(&service, ALICE, BOB, "http://promo.test").await;
    let id = sent.recipient_copy.id;

    let update = service.toggle_spam(BOB, &id).await.unwrap();

    assert!(update.message.labels.is_empty());
    assert!(
        !service
            .engine()
            .classifier()
            .oracle()
            .is_blacklisted("http://promo.test")
            .await
            .unwrap()
    );
    assert!(service.spam(BOB).await.unwrap().is_empty());

    // Moving it back is an explicit label operation.
    service.apply_label(BOB, &id, label("primary", LabelAction::Add)).await.unwrap();
    assert_eq!(ids(&service.list(BOB, Some("Inbox")).await.unwrap()), vec![id.as_str()]);
}

#[tokio::test]
async fn custom_labels_follow_the_owner_spelling() {
    let service = common::service().await;
    let sent = send(&service, ALICE, BOB, "quarterly numbers").await;
    let id = sent.recipient_copy.id;

    service.apply_label(BOB, &id, label("Work", LabelAction::Add)).await.unwrap();
    let again = service
        .apply_label(BOB, &id, label("work", LabelAction::Add))
        .await
        .unwrap();
    assert!(!again.changed);
    assert_eq!(again.message.labels.names(), vec!["Work", "inbox"]);

    let labels = service.list_labels(BOB).await.unwrap();
    assert_eq!(labels.len(), 1);
    assert_eq!(labels[0].name, "Work");

    assert_eq!(ids(&service.label_emails(BOB, "WORK").await.unwrap()), vec![id.as_str()]);
    assert!(service.list_labels(ALICE).await.unwrap().is_empty());

    service.remove_label(BOB, &id, "work").await.unwrap();
    assert!(service.label_emails(BOB, "Work").await.unwrap().is_empty());
}

#[tokio::test]
async fn folders_order_newest_first_and_hide_trash() {
    let service = common::service().await;
    let first = send(&service, ALICE, BOB, "one").await.recipient_copy.id;
    tokio::time::sleep(Duration::from_millis(5)).await;
    let second = send(&service, CAROL, BOB, "two").await.recipient_copy.id;
    tokio::time::sleep(Duration::from_millis(5)).await;
    let third = send(&service, ALICE, BOB, "three").await.recipient_copy.id;

    let inbox = service.list(BOB, None).await.unwrap();
    assert_eq!(ids(&inbox), vec![third.as_str(), second.as_str(), first.as_str()]);

    service.toggle_trash(BOB, &second).await.unwrap();
    service.toggle_archive(BOB, &first).await.unwrap();

    assert_eq!(ids(&service.list(BOB, None).await.unwrap()), vec![third.as_str()]);
    assert_eq!(ids(&service.list(BOB, Some("trash")).await.unwrap()), vec![second.as_str()]);
    assert_eq!(ids(&service.list(BOB, Some("archive")).await.unwrap()), vec![first.as_str()]);

    // Restoring from trash puts the message back in the inbox.
    service.toggle_trash(BOB, &second).await.unwrap();
    assert_eq!(
        ids(&service.list(BOB, None).await.unwrap()),
        vec![third.as_str(), second.as_str()]
    );
}

#[tokio::test]
async fn read_state_tracks_the_read_tag() {
    let service = common::service().await;
    let a = send(&service, ALICE, BOB, "a").await.recipient_copy.id;
    let b = send(&service, ALICE, BOB, "b").await.recipient_copy.id;

    assert_eq!(service.mark_all_read(BOB).await.unwrap(), 2);
    let message = service.get(BOB, &a).await.unwrap();
    assert!(message.read);
    assert!(message.labels.names().contains(&"read".to_string()));
    assert!(replica_labels(&service, &a).await.contains(&"read".to_string()));

    let changed = service
        .mark_unread(
            BOB,
            tagmail::models::IdsRequest {
                ids: vec![b.clone(), "missing".to_string()],
            },
        )
        .await
        .unwrap();
    assert_eq!(changed, 1);
    assert!(!service.get(BOB, &b).await.unwrap().read);
    assert_eq!(replica_labels(&service, &b).await, vec!["inbox"]);
}

#[tokio::test]
async fn search_is_scoped_to_the_caller() {
    let service = common::service().await;
    let hit = send(&service, ALICE, BOB, "the 100% discount").await;
    send(&service, ALICE, CAROL, "the 100% discount").await;
    send(&service, ALICE, BOB, "nothing here").await;

    let found = service.search(BOB, "100%").await.unwrap();
    assert_eq!(ids(&found), vec![hit.recipient_copy.id.as_str()]);
    assert!(service.search(BOB, "100_").await.unwrap().is_empty());
    assert!(matches!(service.search(BOB, "  ").await, Err(MailError::Validation(_))));

    let in_sent = service.search_in_label(ALICE, "sent", "discount").await.unwrap();
    assert_eq!(in_sent.len(), 2);
    assert!(service.search_in_label(BOB, "spam", "discount").await.unwrap().is_empty());
}

#[tokio::test]
async fn foreign_messages_are_not_found() {
    let service = common::service().await;
    let sent = send(&service, ALICE, BOB, "private").await;

    assert!(matches!(
        service.get(CAROL, &sent.recipient_copy.id).await,
        Err(MailError::NotFound(_))
    ));
    assert!(matches!(
        service.toggle_star(CAROL, &sent.recipient_copy.id).await,
        Err(MailError::NotFound(_))
    ));
    assert!(matches!(
        service.delete(CAROL, &sent.recipient_copy.id).await,
        Err(MailError::NotFound(_))
    ));
}

#[tokio::test]
async fn send_validates_fields_and_recipient() {
    let service = common::service().await;
    let cancel = CancellationToken::new();

    let missing = tagmail::models::ComposeRequest {
        to: Some(BOB.to_string()),
        subject: None,
        content: Some("hi".to_string()),
    };
    assert!(matches!(
        service.send(ALICE, missing, &cancel).await,
        Err(MailError::Validation(_))
    ));
    assert!(matches!(
        service.send(ALICE, compose("nobody", "s", "c"), &cancel).await,
        Err(MailError::Validation(_))
    ));
    assert!(service.store().messages_for_owner(ALICE).await.unwrap().is_empty());
}

#[tokio::test]
async fn drafts_are_editable_until_sent() {
    let service = common::service().await;
    let draft = service
        .save_draft(ALICE, compose(BOB, "draft", "first take"))
        .await
        .unwrap();
    assert_eq!(draft.labels.names(), vec!["drafts"]);

    let edited = service
        .edit_draft(
            ALICE,
            &draft.id,
            tagmail::models::EditDraftRequest {
                subject: None,
                content: Some("second take".to_string()),
            },
        )
        .await
        .unwrap();
    assert_eq!(edited.subject, "draft");
    assert_eq!(edited.content, "second take");

    let empty = tagmail::models::ComposeRequest {
        to: None,
        subject: None,
        content: None,
    };
    assert!(matches!(
        service.save_draft(ALICE, empty).await,
        Err(MailError::Validation(_))
    ));

    let sent = send(&service, ALICE, BOB, "real").await;
    assert!(matches!(
        service
            .edit_draft(
                ALICE,
                &sent.sender_copy.id,
                tagmail::models::EditDraftRequest {
                    subject: Some("x".to_string()),
                    content: None,
                },
            )
            .await,
        Err(MailError::Validation(_))
    ));
}

#[tokio::test]
async fn cancelled_send_stores_nothing() {
    let service = common::service().await;
    let cancel = CancellationToken::new();
    cancel.cancel();

    let result = service
        .send(ALICE, compose(BOB, "s", "http://a.test"), &cancel)
        .await;

    assert!(matches!(result, Err(MailError::Cancelled)));
    assert!(service.store().messages_for_owner(ALICE).await.unwrap().is_empty());
    assert!(service.store().messages_for_owner(BOB).await.unwrap().is_empty());
}

#[tokio::test]
async fn unreachable_oracle_fails_closed() {
    // Reserve a port, then release it so nothing is listening there.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap().to_string();
    drop(listener);

    let mut config = Config::default();
    config.oracle.backend = OracleBackend::Remote;
    config.oracle.address = address;
    config.oracle.timeout_ms = 500;
    let service = common::service_with(config).await;

    let result = service
        .send(ALICE, compose(BOB, "s", "visit http://a.test"), &CancellationToken::new())
        .await;

    assert!(matches!(result, Err(MailError::OracleUnavailable(_))));
    assert!(service.store().messages_for_owner(ALICE).await.unwrap().is_empty());
    assert!(service.store().messages_for_owner(BOB).await.unwrap().is_empty());

    // Messages without URLs never consult the oracle.
    let plain = send(&service, ALICE, BOB, "no links").await;
    assert_eq!(plain.recipient_copy.labels.names(), vec!["inbox"]);
}

#[tokio::test]
async fn unreachable_oracle_fails_open_when_configured() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap().to_string();
    drop(listener);

    let mut config = Config::default();
    config.oracle.backend = OracleBackend::Remote;
    config.oracle.address = address;
    config.oracle.timeout_ms = 500;
    config.classification.on_oracle_failure = ClassificationPolicy::FailOpen;
    let service = common::service_with(config).await;

    let sent = send(&service, ALICE, BOB, "visit http://a.test").await;
    assert_eq!(sent.recipient_copy.labels.names(), vec!["inbox"]);
}
