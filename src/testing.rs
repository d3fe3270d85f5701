//! Shared fixtures for unit tests.

use crate::error::{Result, SyncError};
use crate::models::{Direction, NewAccount, NormalizedItem, Provider};
use crate::providers::{Credentials, ProviderAdapter, ReplyDraft, SyncHints};
use crate::vault::SecretVault;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use std::sync::Mutex;
use std::time::Duration;

pub fn vault() -> SecretVault {
    SecretVault::from_key_bytes(&[42u8; 32]).unwrap()
}

pub fn new_account(user_id: &str, provider: Provider, external_id: &str) -> NewAccount {
    NewAccount {
        user_id: user_id.to_string(),
        provider,
        external_account_id: external_id.to_string(),
        access_token: format!("access-{}", external_id),
        refresh_token: Some(format!("refresh-{}", external_id)),
        token_expires_at: None,
        metadata: serde_json::Map::new(),
    }
}

pub fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).unwrap()
}

pub fn item(thread: &str, message: &str, sent_at: DateTime<Utc>, unread: bool) -> NormalizedItem {
    NormalizedItem {
        provider_thread_id: thread.to_string(),
        provider_message_id: message.to_string(),
        subject: Some(format!("subject of {}", thread)),
        sender: "x@example.com".to_string(),
        recipients: vec!["me@example.com".to_string()],
        body_text: "hi".to_string(),
        sent_at,
        is_unread: unread,
        direction: Direction::Inbound,
    }
}

/// Scripted adapter: returns the configured items, or fails with the
/// configured error kind, optionally after a delay. Records the credentials
/// and drafts it was given.
#[derive(Default)]
pub struct FakeAdapter {
    pub items: Mutex<Vec<NormalizedItem>>,
    pub fail_with: Mutex<Option<fn() -> SyncError>>,
    pub seen_tokens: Mutex<Vec<String>>,
    pub drafts: Mutex<Vec<ReplyDraft>>,
    pub delay: Option<Duration>,
}

impl FakeAdapter {
    pub fn returning(items: Vec<NormalizedItem>) -> Self {
        Self {
            items: Mutex::new(items),
            ..Default::default()
        }
    }

    pub fn failing(make_error: fn() -> SyncError) -> Self {
        Self {
            fail_with: Mutex::new(Some(make_error)),
            ..Default::default()
        }
    }

    pub fn slow(delay: Duration, items: Vec<NormalizedItem>) -> Self {
        Self {
            items: Mutex::new(items),
            delay: Some(delay),
            ..Default::default()
        }
    }

    /// Never answers within any test's lifetime.
    pub fn hanging() -> Self {
        Self::slow(Duration::from_secs(3600), Vec::new())
    }

    pub fn set_items(&self, items: Vec<NormalizedItem>) {
        *self.items.lock().unwrap() = items;
    }
}

#[async_trait]
impl ProviderAdapter for FakeAdapter {
    async fn fetch_recent(
        &self,
        credentials: &Credentials,
        _hints: &SyncHints,
    ) -> Result<Vec<NormalizedItem>> {
        self.seen_tokens
            .lock()
            .unwrap()
            .push(credentials.access_token.clone());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(make_error) = *self.fail_with.lock().unwrap() {
            return Err(make_error());
        }
        Ok(self.items.lock().unwrap().clone())
    }

    async fn send_reply(&self, _credentials: &Credentials, draft: &ReplyDraft) -> Result<String> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(make_error) = *self.fail_with.lock().unwrap() {
            return Err(make_error());
        }
        self.drafts.lock().unwrap().push(draft.clone());
        Ok(format!("sent-{}", self.drafts.lock().unwrap().len()))
    }
}
