use crate::db::Database;
use crate::error::{Result, SyncError};
use crate::providers::{Adapters, DEFAULT_PROVIDER_TIMEOUT, ReplyDraft, with_deadline};
use crate::sync::{AccountLocks, open_credentials};
use crate::vault::SecretVault;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

pub const MAX_REPLY_CHARS: usize = 5000;

/// Outbound replies and explicit read transitions. Sync never writes
/// outbound rows or clears unread flags; this service does both.
pub struct ReplyService {
    db: Database,
    vault: Arc<SecretVault>,
    adapters: Adapters,
    locks: AccountLocks,
    provider_timeout: Duration,
}

impl ReplyService {
    pub fn new(
        db: Database,
        vault: Arc<SecretVault>,
        adapters: Adapters,
        locks: AccountLocks,
    ) -> Self {
        Self {
            db,
            vault,
            adapters,
            locks,
            provider_timeout: DEFAULT_PROVIDER_TIMEOUT,
        }
    }

    pub fn with_provider_timeout(mut self, limit: Duration) -> Self {
        self.provider_timeout = limit;
        self
    }

    /// Sends `body` into the thread through its provider and records it.
    /// Returns the local id of the new outbound message.
    pub async fn send_reply(&self, user_id: &str, thread_id: &str, body: &str) -> Result<String> {
        let length = body.chars().count();
        if body.trim().is_empty() || length > MAX_REPLY_CHARS {
            return Err(SyncError::InvalidInput(format!(
                "reply body must be 1 to {} characters",
                MAX_REPLY_CHARS
            )));
        }

        let ctx = self
            .db
            .reply_context(user_id, thread_id)
            .await?
            .ok_or(SyncError::ThreadNotFound)?;

        let _guard = self.locks.lock(&ctx.account.id).await;
        let credentials = open_credentials(&self.vault, &ctx.account)?;
        let draft = ReplyDraft {
            provider_thread_id: ctx.thread.provider_thread_id.clone(),
            recipient: ctx.latest_inbound_sender.clone(),
            subject: ctx.thread.subject.clone(),
            body: body.to_string(),
            in_reply_to: ctx.latest_provider_message_id.clone(),
        };

        let adapter = self.adapters.for_provider(ctx.account.provider);
        let provider_message_id =
            with_deadline(self.provider_timeout, adapter.send_reply(&credentials, &draft)).await?;

        let message_id = self
            .db
            .record_outbound_reply(&ctx.thread, &provider_message_id, body, Utc::now())
            .await?;
        info!(
            thread_id = %ctx.thread.id,
            provider = %ctx.account.provider,
            message_id = %message_id,
            "reply sent"
        );
        Ok(message_id)
    }

    pub async fn mark_thread_read(&self, user_id: &str, thread_id: &str) -> Result<()> {
        let thread = self
            .db
            .get_thread(thread_id)
            .await?
            .filter(|t| t.user_id == user_id)
            .ok_or(SyncError::ThreadNotFound)?;

        let _guard = self.locks.lock(&thread.account_id).await;
        if !self.db.mark_thread_read(user_id, thread_id).await? {
            return Err(SyncError::ThreadNotFound);
        }
        Ok(())
    }
}
