//! Credential access log
//!
//! Every decrypt attempt is recorded, successful or not, with who asked and
//! what happened - never with the secret value. Persistence belongs to the
//! external operation-log store; the relay appends through [`AccessLog`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessAction {
    /// Decrypted for internal use (opening a channel).
    Decrypt,
    /// Explicit operator-facing reveal of the secret value.
    Reveal,
}

impl AccessAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccessAction::Decrypt => "decrypt",
            AccessAction::Reveal => "reveal",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessOutcome {
    Success,
    Denied,
    Failed,
}

#[derive(Debug, Clone)]
pub struct AccessEntry {
    pub credential_id: i64,
    pub caller: String,
    pub action: AccessAction,
    pub outcome: AccessOutcome,
    pub at: DateTime<Utc>,
}

impl AccessEntry {
    pub fn new(
        credential_id: i64,
        caller: &str,
        action: AccessAction,
        outcome: AccessOutcome,
    ) -> Self {
        Self {
            credential_id,
            caller: caller.to_string(),
            action,
            outcome,
            at: Utc::now(),
        }
    }
}

/// Append-only sink for access entries.
#[async_trait]
pub trait AccessLog: Send + Sync {
    async fn append(&self, entry: AccessEntry);
}

/// Default sink: structured log lines. Deployments with an audit table
/// implement [`AccessLog`] against it instead.
pub struct TracingAccessLog;

#[async_trait]
impl AccessLog for TracingAccessLog {
    async fn append(&self, entry: AccessEntry) {
        info!(
            credential_id = entry.credential_id,
            caller = %entry.caller,
            action = entry.action.as_str(),
            outcome = ?entry.outcome,
            "credential access"
        );
    }
}
