//! Spam classification of incoming mail and spam-toggle reclassification.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{MailError, MailResult};
use crate::labels::{LabelSet, Tag};
use crate::models::Message;
use crate::oracle::{AddOutcome, BlacklistOracle, RemoveOutcome};
use crate::urls::extract_urls;

/// What initial classification does when the oracle cannot answer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClassificationPolicy {
    /// Reject the delivery with `OracleUnavailable`.
    #[default]
    FailClosed,
    /// Deliver to the inbox and log a warning.
    FailOpen,
}

/// Blacklist change made while toggling spam.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase", tag = "result")]
pub enum BlacklistEffect {
    Added { url: String },
    AlreadyPresent { url: String },
    Removed { url: String },
    NotFound { url: String },
    /// Removal failed; tolerated because un-marking spam must still succeed.
    Failed { url: String, error: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SpamToggle {
    pub labels: LabelSet,
    pub spam: bool,
    pub effects: Vec<BlacklistEffect>,
}

#[derive(Clone)]
pub struct SpamClassifier {
    oracle: Arc<dyn BlacklistOracle>,
    policy: ClassificationPolicy,
    budget: Duration,
}

impl SpamClassifier {
    pub fn new(oracle: Arc<dyn BlacklistOracle>, policy: ClassificationPolicy, budget: Duration) -> Self {
        Self {
            oracle,
            policy,
            budget,
        }
    }

    pub fn oracle(&self) -> &Arc<dyn BlacklistOracle> {
        &self.oracle
    }

    pub fn policy(&self) -> ClassificationPolicy {
        self.policy
    }

    /// Initial label set for a newly delivered message: `{spam}` when any URL
    /// in subject or content is blacklisted, `{inbox}` otherwise.
    ///
    /// URLs are checked one at a time and the scan stops at the first hit.
    /// The scan is pure until it returns, so cancelling it (or running out of
    /// budget) never leaves a half-classified message behind.
    pub async fn classify_incoming(
        &self,
        subject: &str,
        content: &str,
        cancel: &CancellationToken,
    ) -> MailResult<LabelSet> {
        let urls = extract_urls(&format!("{subject} {content}"));
        debug!(count = urls.len(), "classifying incoming message");

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!("classification cancelled");
                return Err(MailError::Cancelled);
            }
            outcome = time::timeout(self.budget, self.first_blacklisted(&urls)) => outcome,
        };

        let scan = match outcome {
            Ok(scan) => scan,
            Err(_) => Err(MailError::OracleUnavailable(format!(
                "classification exceeded {}ms",
                self.budget.as_millis()
            ))),
        };

        match scan {
            Ok(Some(url)) => {
                info!(url = %url, "blacklisted url found, delivering to spam");
                Ok(LabelSet::of([Tag::Spam]))
            }
            Ok(None) => Ok(LabelSet::of([Tag::Inbox])),
            Err(err @ MailError::OracleUnavailable(_)) => match self.policy {
                ClassificationPolicy::FailClosed => Err(err),
                ClassificationPolicy::FailOpen => {
                    warn!(error = %err, "oracle unavailable, delivering to inbox");
                    Ok(LabelSet::of([Tag::Inbox]))
                }
            },
            Err(err) => Err(err),
        }
    }

    async fn first_blacklisted(&self, urls: &[String]) -> MailResult<Option<String>> {
        for url in urls {
            if self.oracle.is_blacklisted(url).await? {
                return Ok(Some(url.clone()));
            }
        }
        Ok(None)
    }

    /// Flips the spam state of `message`, updating the blacklist accordingly.
    pub async fn reclassify_on_spam_toggle(&self, message: &Message) -> MailResult<SpamToggle> {
        if message.labels.is_spam() {
            Ok(self.unmark_spam(message).await)
        } else {
            self.mark_spam(message).await
        }
    }

    /// Blacklists every URL of `message` and strips its folder-like tags.
    /// Any oracle failure aborts before the label set changes.
    pub async fn mark_spam(&self, message: &Message) -> MailResult<SpamToggle> {
        let urls = extract_urls(&message.text());

        let effects = time::timeout(self.budget, async {
            let mut effects = Vec::with_capacity(urls.len());
            for url in &urls {
                let effect = match self.oracle.add(url).await? {
                    AddOutcome::Added => BlacklistEffect::Added { url: url.clone() },
                    AddOutcome::AlreadyPresent => BlacklistEffect::AlreadyPresent { url: url.clone() },
                };
                effects.push(effect);
            }
            Ok::<_, MailError>(effects)
        })
        .await
        .map_err(|_| {
            MailError::OracleUnavailable(format!(
                "blacklisting exceeded {}ms",
                self.budget.as_millis()
            ))
        })??;

        let mut labels = message.labels.clone();
        let dropped = labels.mark_spam();
        info!(
            message_id = %message.id,
            urls = urls.len(),
            dropped = ?dropped,
            "marked as spam"
        );

        Ok(SpamToggle {
            labels,
            spam: true,
            effects,
        })
    }

    /// Drops `spam` and un-blacklists the message's URLs on a best-effort basis.
    pub async fn unmark_spam(&self, message: &Message) -> SpamToggle {
        let urls = extract_urls(&message.text());
        let mut effects = Vec::with_capacity(urls.len());

        for url in &urls {
            let effect = match time::timeout(self.budget, self.oracle.remove(url)).await {
                Ok(Ok(RemoveOutcome::Removed)) => BlacklistEffect::Removed { url: url.clone() },
                Ok(Ok(RemoveOutcome::NotFound)) => BlacklistEffect::NotFound { url: url.clone() },
                Ok(Err(err)) => {
                    warn!(url = %url, error = %err, "blacklist removal failed");
                    BlacklistEffect::Failed {
                        url: url.clone(),
                        error: err.to_string(),
                    }
                }
                Err(_) => {
                    warn!(url = %url, "blacklist removal timed out");
                    BlacklistEffect::Failed {
                        url: url.clone(),
                        error: "timed out".to_string(),
                    }
                }
            };
            effects.push(effect);
        }

        let mut labels = message.labels.clone();
        labels.unmark_spam();
        info!(message_id = %message.id, urls = urls.len(), "unmarked as spam");

        SpamToggle {
            labels,
            spam: false,
            effects,
        }
    }
}
