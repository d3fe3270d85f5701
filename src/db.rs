use crate::error::Result;
use crate::models::{self, ConnectedAccount, Direction, NewAccount, Provider};
use crate::vault::SecretVault;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, Sqlite, Transaction};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};

#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

#[derive(Debug, Clone, Default)]
pub struct ThreadFilter {
    pub provider: Option<Provider>,
    pub unread_only: bool,
    pub limit: i64,
}

/// What the reply path needs to address a provider thread.
#[derive(Debug, Clone)]
pub struct ReplyContext {
    pub thread: models::Thread,
    pub account: ConnectedAccount,
    pub latest_inbound_sender: Option<String>,
    pub latest_provider_message_id: Option<String>,
}

pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

impl Database {
    pub async fn new(database_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(30));

        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await?;
        info!(url = %database_url, "connected to store");
        Ok(Self { pool })
    }

    /// Single-connection in-memory store, used by tests and dry runs.
    pub async fn open_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        let db = Self { pool };
        db.run_migrations().await?;
        Ok(db)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    pub async fn run_migrations(&self) -> Result<()> {
        let schema = include_str!("../schema.sql");
        sqlx::query(schema).execute(&self.pool).await?;
        debug!("schema applied");
        Ok(())
    }

    pub async fn begin(&self) -> Result<Transaction<'static, Sqlite>> {
        Ok(self.pool.begin().await?)
    }

    pub async fn create_user(&self, email: &str) -> Result<String> {
        let id = new_id();
        sqlx::query("INSERT INTO users (id, email, created_at) VALUES (?, ?, ?)")
            .bind(&id)
            .bind(email)
            .bind(now_millis())
            .execute(&self.pool)
            .await?;
        Ok(id)
    }

    pub async fn list_user_ids(&self) -> Result<Vec<String>> {
        let rows = sqlx::query("SELECT id FROM users ORDER BY created_at ASC")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(|r| r.get(0)).collect())
    }

    /// Account-connection write: seals tokens and upserts on
    /// (user, provider, external account id). Returns the account id.
    pub async fn upsert_account(&self, account: &NewAccount, vault: &SecretVault) -> Result<String> {
        let access = vault.seal_str(&account.access_token)?;
        let refresh = account
            .refresh_token
            .as_deref()
            .map(|t| vault.seal_str(t))
            .transpose()?;
        let metadata = serde_json::Value::Object(account.metadata.clone()).to_string();
        let now = now_millis();

        let row = sqlx::query(
            "INSERT INTO accounts (id, user_id, provider, external_account_id, access_token_encrypted,
                                   refresh_token_encrypted, token_expires_at, metadata, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(user_id, provider, external_account_id) DO UPDATE SET
                access_token_encrypted = excluded.access_token_encrypted,
                refresh_token_encrypted = excluded.refresh_token_encrypted,
                token_expires_at = excluded.token_expires_at,
                metadata = excluded.metadata,
                updated_at = excluded.updated_at
             RETURNING id",
        )
        .bind(new_id())
        .bind(&account.user_id)
        .bind(account.provider.as_str())
        .bind(&account.external_account_id)
        .bind(access)
        .bind(refresh)
        .bind(account.token_expires_at.map(|t| t.timestamp_millis()))
        .bind(metadata)
        .bind(now)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.get(0))
    }

    /// Account Loader: the one named account when it belongs to the user,
    /// otherwise every account of the user.
    pub async fn load_accounts(
        &self,
        user_id: &str,
        account_id: Option<&str>,
    ) -> Result<Vec<ConnectedAccount>> {
        let rows = match account_id {
            Some(account_id) => {
                sqlx::query(
                    "SELECT id, user_id, provider, external_account_id, access_token_encrypted,
                            refresh_token_encrypted, token_expires_at, metadata
                     FROM accounts
                     WHERE id = ? AND user_id = ?",
                )
                .bind(account_id)
                .bind(user_id)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    "SELECT id, user_id, provider, external_account_id, access_token_encrypted,
                            refresh_token_encrypted, token_expires_at, metadata
                     FROM accounts
                     WHERE user_id = ?
                     ORDER BY created_at ASC",
                )
                .bind(user_id)
                .fetch_all(&self.pool)
                .await?
            }
        };

        rows.iter().map(account_from_row).collect()
    }

    pub async fn account_owned_by(&self, user_id: &str, account_id: &str) -> Result<bool> {
        let row = sqlx::query("SELECT 1 FROM accounts WHERE id = ? AND user_id = ?")
            .bind(account_id)
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    pub async fn stamp_last_sync(&self, account_id: &str, at: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            "UPDATE accounts
             SET metadata = json_set(metadata, '$.last_sync_at', ?),
                 updated_at = ?
             WHERE id = ?",
        )
        .bind(at.to_rfc3339())
        .bind(now_millis())
        .bind(account_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_thread(&self, thread_id: &str) -> Result<Option<models::Thread>> {
        let thread = sqlx::query_as::<_, models::Thread>(
            "SELECT id, user_id, account_id, provider_thread_id, subject, last_message_at, is_unread
             FROM threads WHERE id = ?",
        )
        .bind(thread_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(thread)
    }

    pub async fn find_thread(
        &self,
        account_id: &str,
        provider_thread_id: &str,
    ) -> Result<Option<models::Thread>> {
        let thread = sqlx::query_as::<_, models::Thread>(
            "SELECT id, user_id, account_id, provider_thread_id, subject, last_message_at, is_unread
             FROM threads WHERE account_id = ? AND provider_thread_id = ?",
        )
        .bind(account_id)
        .bind(provider_thread_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(thread)
    }

    pub async fn list_threads(
        &self,
        user_id: &str,
        filter: &ThreadFilter,
    ) -> Result<Vec<models::Thread>> {
        let threads = sqlx::query_as::<_, models::Thread>(
            "SELECT t.id, t.user_id, t.account_id, t.provider_thread_id, t.subject,
                    t.last_message_at, t.is_unread
             FROM threads t
             JOIN accounts a ON a.id = t.account_id
             WHERE t.user_id = ?
               AND (? IS NULL OR a.provider = ?)
               AND (? = 0 OR t.is_unread = 1)
             ORDER BY t.last_message_at DESC
             LIMIT ?",
        )
        .bind(user_id)
        .bind(filter.provider.map(|p| p.as_str()))
        .bind(filter.provider.map(|p| p.as_str()))
        .bind(filter.unread_only)
        .bind(if filter.limit > 0 { filter.limit } else { 25 })
        .fetch_all(&self.pool)
        .await?;
        Ok(threads)
    }

    pub async fn thread_messages(&self, thread_id: &str, limit: i64) -> Result<Vec<models::Message>> {
        let rows = sqlx::query(
            "SELECT id, thread_id, account_id, provider_message_id, sender, recipients, body_text,
                    sent_at, is_unread, direction
             FROM messages
             WHERE thread_id = ?
             ORDER BY sent_at DESC
             LIMIT ?",
        )
        .bind(thread_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(message_from_row).collect()
    }

    pub async fn find_message(
        &self,
        account_id: &str,
        provider_message_id: &str,
    ) -> Result<Option<models::Message>> {
        let row = sqlx::query(
            "SELECT id, thread_id, account_id, provider_message_id, sender, recipients, body_text,
                    sent_at, is_unread, direction
             FROM messages
             WHERE account_id = ? AND provider_message_id = ?",
        )
        .bind(account_id)
        .bind(provider_message_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(message_from_row).transpose()
    }

    pub async fn unread_messages(
        &self,
        user_id: &str,
        provider: Option<Provider>,
        limit: i64,
    ) -> Result<Vec<models::Message>> {
        let rows = sqlx::query(
            "SELECT m.id, m.thread_id, m.account_id, m.provider_message_id, m.sender, m.recipients,
                    m.body_text, m.sent_at, m.is_unread, m.direction
             FROM messages m
             JOIN threads t ON t.id = m.thread_id
             JOIN accounts a ON a.id = m.account_id
             WHERE t.user_id = ?
               AND m.is_unread = 1
               AND (? IS NULL OR a.provider = ?)
             ORDER BY m.sent_at DESC
             LIMIT ?",
        )
        .bind(user_id)
        .bind(provider.map(|p| p.as_str()))
        .bind(provider.map(|p| p.as_str()))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(message_from_row).collect()
    }

    /// Most recent messages whose sender or thread subject matches `term`.
    pub async fn search_messages(
        &self,
        term: &str,
        limit: i64,
    ) -> Result<Vec<(Option<String>, models::Message)>> {
        let pattern = format!("%{}%", term);
        let rows = sqlx::query(
            "SELECT m.id, m.thread_id, m.account_id, m.provider_message_id, m.sender, m.recipients,
                    m.body_text, m.sent_at, m.is_unread, m.direction, t.subject
             FROM messages m
             JOIN threads t ON t.id = m.thread_id
             WHERE m.sender LIKE ? OR t.subject LIKE ?
             ORDER BY m.sent_at DESC
             LIMIT ?",
        )
        .bind(&pattern)
        .bind(&pattern)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> Result<_> { Ok((row.try_get("subject")?, message_from_row(row)?)) })
            .collect()
    }

    pub async fn reply_context(&self, user_id: &str, thread_id: &str) -> Result<Option<ReplyContext>> {
        let Some(thread) = self.get_thread(thread_id).await? else {
            return Ok(None);
        };
        if thread.user_id != user_id {
            return Ok(None);
        }
        let mut accounts = self.load_accounts(user_id, Some(&thread.account_id)).await?;
        let Some(account) = accounts.pop() else {
            return Ok(None);
        };

        let latest_inbound = sqlx::query(
            "SELECT sender FROM messages
             WHERE thread_id = ? AND direction = 'inbound'
             ORDER BY sent_at DESC
             LIMIT 1",
        )
        .bind(thread_id)
        .fetch_optional(&self.pool)
        .await?;

        let latest = sqlx::query(
            "SELECT provider_message_id FROM messages
             WHERE thread_id = ?
             ORDER BY sent_at DESC
             LIMIT 1",
        )
        .bind(thread_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(Some(ReplyContext {
            thread,
            account,
            latest_inbound_sender: latest_inbound.map(|r| r.get(0)),
            latest_provider_message_id: latest.map(|r| r.get(0)),
        }))
    }

    /// Records a sent reply: new outbound message, thread moved forward and
    /// marked read, in one transaction.
    pub async fn record_outbound_reply(
        &self,
        thread: &models::Thread,
        provider_message_id: &str,
        body: &str,
        sent_at: DateTime<Utc>,
    ) -> Result<String> {
        let id = new_id();
        let sent_at = sent_at.timestamp_millis();
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO messages (id, thread_id, account_id, provider_message_id, sender, recipients,
                                   body_text, sent_at, is_unread, direction, created_at)
             VALUES (?, ?, ?, ?, 'assistant', '[]', ?, ?, 0, 'outbound', ?)",
        )
        .bind(&id)
        .bind(&thread.id)
        .bind(&thread.account_id)
        .bind(provider_message_id)
        .bind(body)
        .bind(sent_at)
        .bind(now_millis())
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "UPDATE threads
             SET last_message_at = MAX(last_message_at, ?),
                 is_unread = 0,
                 updated_at = ?
             WHERE id = ?",
        )
        .bind(sent_at)
        .bind(now_millis())
        .bind(&thread.id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(id)
    }

    /// The explicit read transition. Returns false when the thread is not
    /// the user's.
    pub async fn mark_thread_read(&self, user_id: &str, thread_id: &str) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            "UPDATE threads SET is_unread = 0, updated_at = ? WHERE id = ? AND user_id = ?",
        )
        .bind(now_millis())
        .bind(thread_id)
        .bind(user_id)
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        sqlx::query("UPDATE messages SET is_unread = 0 WHERE thread_id = ?")
            .bind(thread_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(true)
    }
}

fn decode_error(msg: String) -> sqlx::Error {
    sqlx::Error::Decode(msg.into())
}

fn account_from_row(row: &SqliteRow) -> Result<ConnectedAccount> {
    let provider: String = row.try_get("provider")?;
    let metadata: String = row.try_get("metadata")?;
    let metadata = match serde_json::from_str::<serde_json::Value>(&metadata) {
        Ok(serde_json::Value::Object(map)) => map,
        Ok(_) => serde_json::Map::new(),
        Err(e) => return Err(decode_error(format!("account metadata: {}", e)).into()),
    };

    Ok(ConnectedAccount {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        provider: Provider::from_str(&provider).map_err(decode_error)?,
        external_account_id: row.try_get("external_account_id")?,
        access_token_encrypted: row.try_get("access_token_encrypted")?,
        refresh_token_encrypted: row.try_get("refresh_token_encrypted")?,
        token_expires_at: row.try_get("token_expires_at")?,
        metadata,
    })
}

fn message_from_row(row: &SqliteRow) -> Result<models::Message> {
    let recipients: String = row.try_get("recipients")?;
    let direction: String = row.try_get("direction")?;

    Ok(models::Message {
        id: row.try_get("id")?,
        thread_id: row.try_get("thread_id")?,
        account_id: row.try_get("account_id")?,
        provider_message_id: row.try_get("provider_message_id")?,
        sender: row.try_get("sender")?,
        recipients: serde_json::from_str(&recipients)
            .map_err(|e| decode_error(format!("message recipients: {}", e)))?,
        body_text: row.try_get("body_text")?,
        sent_at: row.try_get("sent_at")?,
        is_unread: row.try_get("is_unread")?,
        direction: Direction::from_str(&direction).map_err(decode_error)?,
    })
}
