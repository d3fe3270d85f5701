use crate::db::{Database, new_id, now_millis};
use crate::error::Result;
use crate::models::NormalizedItem;
use sqlx::Row;

#[derive(Debug, Clone)]
pub struct MergeContext {
    pub user_id: String,
    pub account_id: String,
}

/// Folds normalized provider items into the store.
///
/// Each item is one transaction: the thread row is upserted first, then the
/// message row that references it. Thread fields only move forward
/// (`last_message_at` is a running max, `is_unread` is sticky), while message
/// fields are last-write-wins, including the thread a message belongs to.
/// Callers must hold the account lock so two merges into one account never
/// interleave.
#[derive(Clone)]
pub struct Reconciler {
    db: Database,
}

impl Reconciler {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Merges one item and returns the local thread id it landed in.
    pub async fn merge(&self, item: &NormalizedItem, ctx: &MergeContext) -> Result<String> {
        let now = now_millis();
        let sent_at = item.sent_at.timestamp_millis();
        let recipients = serde_json::to_string(&item.recipients)?;

        let mut tx = self.db.begin().await?;

        let thread_row = sqlx::query(
            "INSERT INTO threads (id, user_id, account_id, provider_thread_id, subject,
                                  last_message_at, is_unread, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(account_id, provider_thread_id) DO UPDATE SET
                subject = COALESCE(excluded.subject, threads.subject),
                last_message_at = MAX(threads.last_message_at, excluded.last_message_at),
                is_unread = (threads.is_unread OR excluded.is_unread),
                updated_at = excluded.updated_at
             RETURNING id",
        )
        .bind(new_id())
        .bind(&ctx.user_id)
        .bind(&ctx.account_id)
        .bind(&item.provider_thread_id)
        .bind(&item.subject)
        .bind(sent_at)
        .bind(item.is_unread)
        .bind(now)
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;
        let thread_id: String = thread_row.try_get(0)?;

        sqlx::query(
            "INSERT INTO messages (id, thread_id, account_id, provider_message_id, sender, recipients,
                                   body_text, sent_at, is_unread, direction, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(account_id, provider_message_id) DO UPDATE SET
                thread_id = excluded.thread_id,
                sender = excluded.sender,
                recipients = excluded.recipients,
                body_text = excluded.body_text,
                sent_at = excluded.sent_at,
                is_unread = excluded.is_unread,
                direction = excluded.direction",
        )
        .bind(new_id())
        .bind(&thread_id)
        .bind(&ctx.account_id)
        .bind(&item.provider_message_id)
        .bind(&item.sender)
        .bind(recipients)
        .bind(&item.body_text)
        .bind(sent_at)
        .bind(item.is_unread)
        .bind(item.direction.as_str())
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(thread_id)
    }
}
