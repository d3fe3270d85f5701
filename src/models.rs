use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Gmail,
    Slack,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Gmail => "gmail",
            Provider::Slack => "slack",
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Provider {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "gmail" => Ok(Provider::Gmail),
            "slack" => Ok(Provider::Slack),
            other => Err(format!("unknown provider '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Inbound,
    Outbound,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Inbound => "inbound",
            Direction::Outbound => "outbound",
        }
    }
}

impl FromStr for Direction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "inbound" => Ok(Direction::Inbound),
            "outbound" => Ok(Direction::Outbound),
            other => Err(format!("unknown direction '{}'", other)),
        }
    }
}

/// One platform credential set owned by a user. Tokens stay sealed here;
/// they are opened only right before an adapter call.
#[derive(Debug, Clone)]
pub struct ConnectedAccount {
    pub id: String,
    pub user_id: String,
    pub provider: Provider,
    pub external_account_id: String,
    pub access_token_encrypted: String,
    pub refresh_token_encrypted: Option<String>,
    pub token_expires_at: Option<i64>,
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl ConnectedAccount {
    pub fn last_sync_at(&self) -> Option<DateTime<Utc>> {
        self.metadata
            .get("last_sync_at")
            .and_then(|v| v.as_str())
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc))
    }
}

/// Input for the account-connection write. Tokens are plaintext here and
/// sealed before they reach the store.
#[derive(Clone)]
pub struct NewAccount {
    pub user_id: String,
    pub provider: Provider,
    pub external_account_id: String,
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub token_expires_at: Option<DateTime<Utc>>,
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Thread {
    pub id: String,
    pub user_id: String,
    pub account_id: String,
    pub provider_thread_id: String,
    pub subject: Option<String>,
    /// Epoch milliseconds.
    pub last_message_at: i64,
    pub is_unread: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub thread_id: String,
    pub account_id: String,
    pub provider_message_id: String,
    pub sender: String,
    pub recipients: Vec<String>,
    pub body_text: String,
    /// Epoch milliseconds.
    pub sent_at: i64,
    pub is_unread: bool,
    pub direction: Direction,
}

/// Provider-agnostic shape of one remote message, produced by an adapter
/// and consumed by the reconciler.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedItem {
    pub provider_thread_id: String,
    pub provider_message_id: String,
    pub subject: Option<String>,
    pub sender: String,
    pub recipients: Vec<String>,
    pub body_text: String,
    pub sent_at: DateTime<Utc>,
    pub is_unread: bool,
    pub direction: Direction,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncReason {
    Manual,
    Scheduled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountSyncJob {
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_id: Option<String>,
    pub reason: SyncReason,
}

/// Queue payload. A sweep is expanded by the processor into one
/// `AccountSyncJob` per known user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum SyncJob {
    Sweep,
    Account(AccountSyncJob),
}

pub const MANUAL_JOB_NAME: &str = "sync-account";
pub const SCHEDULED_JOB_NAME: &str = "scheduled-sync";

impl SyncJob {
    pub fn manual(user_id: impl Into<String>, account_id: Option<String>) -> Self {
        SyncJob::Account(AccountSyncJob {
            user_id: user_id.into(),
            account_id,
            reason: SyncReason::Manual,
        })
    }

    pub fn job_name(&self) -> &'static str {
        match self {
            SyncJob::Sweep => SCHEDULED_JOB_NAME,
            SyncJob::Account(job) => match job.reason {
                SyncReason::Manual => MANUAL_JOB_NAME,
                SyncReason::Scheduled => SCHEDULED_JOB_NAME,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sync_job_payload_shape() {
        let job = SyncJob::manual("u-1", Some("a-1".to_string()));
        let json = serde_json::to_value(&job).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "kind": "account",
                "userId": "u-1",
                "accountId": "a-1",
                "reason": "manual"
            })
        );

        let sweep: SyncJob = serde_json::from_str(r#"{"kind":"sweep"}"#).unwrap();
        assert_eq!(sweep, SyncJob::Sweep);
        assert_eq!(sweep.job_name(), SCHEDULED_JOB_NAME);
    }

    #[test]
    fn last_sync_at_reads_metadata() {
        let mut metadata = serde_json::Map::new();
        metadata.insert(
            "last_sync_at".to_string(),
            serde_json::Value::String("2024-05-01T10:00:00+00:00".to_string()),
        );
        let account = ConnectedAccount {
            id: "a".into(),
            user_id: "u".into(),
            provider: Provider::Slack,
            external_account_id: "U1".into(),
            access_token_encrypted: String::new(),
            refresh_token_encrypted: None,
            token_expires_at: None,
            metadata,
        };
        assert_eq!(
            account.last_sync_at().map(|t| t.timestamp()),
            Some(1_714_557_600)
        );
    }
}
