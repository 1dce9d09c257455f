use std::io;

use thiserror::Error;

pub type MailResult<T> = Result<T, MailError>;

#[derive(Debug, Error)]
pub enum MailError {
    /// Message or label absent, or not owned by the caller.
    #[error("not found: {0}")]
    NotFound(String),
    #[error("invalid input: {0}")]
    Validation(String),
    #[error("conflict: {0}")]
    Conflict(String),
    /// The blacklist oracle failed or timed out. Classification must not
    /// guess an outcome when this happens.
    #[error("blacklist oracle unavailable: {0}")]
    OracleUnavailable(String),
    #[error("operation cancelled")]
    Cancelled,
    /// `replace_authoritative` stopped after clearing the old links. The
    /// message may carry fewer labels than it should until the call is retried.
    #[error(
        "reconciliation of message {message_id} interrupted after clearing links ({linked}/{expected} relinked); retry required"
    )]
    PartialReconciliation {
        message_id: String,
        linked: usize,
        expected: usize,
    },
    #[error("configuration error: {0}")]
    Config(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl MailError {
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    pub fn validation(what: impl Into<String>) -> Self {
        Self::Validation(what.into())
    }

    /// True for failures a caller can resolve by retrying the same request.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::OracleUnavailable(_) | Self::PartialReconciliation { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_reconciliation_mentions_retry() {
        let err = MailError::PartialReconciliation {
            message_id: "m-1".to_string(),
            linked: 1,
            expected: 3,
        };
        let text = err.to_string();
        assert!(text.contains("m-1"));
        assert!(text.contains("1/3"));
        assert!(text.contains("retry"));
        assert!(err.is_retryable());
    }

    #[test]
    fn validation_is_not_retryable() {
        assert!(!MailError::validation("empty label").is_retryable());
    }
}
