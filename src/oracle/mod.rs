//! Blacklist membership oracle.
//!
//! Call sites only ever see `Arc<dyn BlacklistOracle>`; the realization is
//! chosen once at startup by [`from_config`].

pub mod exact;
pub mod remote;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use sqlx::sqlite::SqlitePool;

use crate::config::{OracleBackend, OracleConfig};
use crate::error::{MailError, MailResult};

pub use exact::ExactSetOracle;
pub use remote::RemoteOracle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum AddOutcome {
    Added,
    AlreadyPresent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum RemoveOutcome {
    Removed,
    NotFound,
}

/// Answers whether a URL is disallowed and maintains the shared blacklist.
///
/// `add` and `remove` are idempotent: retrying after a timeout reports
/// `AlreadyPresent` / `NotFound` instead of failing.
#[async_trait]
pub trait BlacklistOracle: Send + Sync {
    async fn is_blacklisted(&self, url: &str) -> MailResult<bool>;

    async fn add(&self, url: &str) -> MailResult<AddOutcome>;

    async fn remove(&self, url: &str) -> MailResult<RemoveOutcome>;
}

/// Builds the configured oracle. The exact-set realization shares the
/// authoritative store's pool.
pub fn from_config(config: &OracleConfig, pool: &SqlitePool) -> MailResult<Arc<dyn BlacklistOracle>> {
    match config.backend {
        OracleBackend::Exact => {
            tracing::info!("using exact-set blacklist oracle");
            Ok(Arc::new(ExactSetOracle::new(pool.clone())))
        }
        OracleBackend::Remote => {
            let address = config.address.trim();
            if address.is_empty() {
                return Err(MailError::Config(
                    "oracle.address is required for the remote backend".to_string(),
                ));
            }
            tracing::info!(address, timeout_ms = config.timeout_ms, "using remote blacklist oracle");
            Ok(Arc::new(RemoteOracle::new(
                address,
                Duration::from_millis(config.timeout_ms),
            )))
        }
    }
}

pub(crate) fn validate_url(url: &str) -> MailResult<&str> {
    let url = url.trim();
    if url.is_empty() {
        return Err(MailError::validation("url must be a non-empty string"));
    }
    if url.chars().any(char::is_whitespace) {
        return Err(MailError::validation("url must not contain whitespace"));
    }
    Ok(url)
}
