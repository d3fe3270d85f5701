use crate::db::Database;
use crate::error::{Result, SyncError};
use crate::models::{AccountSyncJob, ConnectedAccount, SyncJob, SyncReason};
use crate::providers::{Adapters, Credentials, DEFAULT_PROVIDER_TIMEOUT, SyncHints, with_deadline};
use crate::reconcile::{MergeContext, Reconciler};
use crate::vault::SecretVault;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, error, info, warn};

/// In-process lock per account id. Every writer into an account's threads
/// (sync merges and replies) holds it, so upserts for one account never
/// interleave across workers. Entries are dropped once nobody holds or
/// waits on them.
#[derive(Clone, Default)]
pub struct AccountLocks {
    inner: Arc<Mutex<LockMap>>,
}

type LockMap = HashMap<String, Arc<AsyncMutex<()>>>;

impl AccountLocks {
    pub async fn lock(&self, account_id: &str) -> AccountGuard {
        let slot = {
            let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            map.entry(account_id.to_string()).or_default().clone()
        };
        let guard = slot.clone().lock_owned().await;
        AccountGuard {
            guard: Some(guard),
            slot,
            account_id: account_id.to_string(),
            map: self.inner.clone(),
        }
    }

    /// Number of accounts with a live lock entry.
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Held account lock. Releases on drop and removes the map entry when it
/// was the last reference.
pub struct AccountGuard {
    guard: Option<OwnedMutexGuard<()>>,
    slot: Arc<AsyncMutex<()>>,
    account_id: String,
    map: Arc<Mutex<LockMap>>,
}

impl Drop for AccountGuard {
    fn drop(&mut self) {
        drop(self.guard.take());
        let mut map = self.map.lock().unwrap_or_else(|e| e.into_inner());
        // One reference in the map, one here. Waiters clone under this mutex.
        let idle = Arc::strong_count(&self.slot) == 2
            && map
                .get(&self.account_id)
                .is_some_and(|current| Arc::ptr_eq(current, &self.slot));
        if idle {
            map.remove(&self.account_id);
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JobReport {
    pub users: usize,
    pub accounts_synced: usize,
    pub accounts_failed: usize,
    pub items_merged: usize,
}

impl JobReport {
    fn absorb(&mut self, other: JobReport) {
        self.users += other.users;
        self.accounts_synced += other.accounts_synced;
        self.accounts_failed += other.accounts_failed;
        self.items_merged += other.items_merged;
    }
}

pub struct SyncProcessor {
    db: Database,
    vault: Arc<SecretVault>,
    adapters: Adapters,
    reconciler: Reconciler,
    locks: AccountLocks,
    batch_size: u32,
    provider_timeout: Duration,
}

impl SyncProcessor {
    pub fn new(
        db: Database,
        vault: Arc<SecretVault>,
        adapters: Adapters,
        locks: AccountLocks,
        batch_size: u32,
    ) -> Self {
        let reconciler = Reconciler::new(db.clone());
        Self {
            db,
            vault,
            adapters,
            reconciler,
            locks,
            batch_size,
            provider_timeout: DEFAULT_PROVIDER_TIMEOUT,
        }
    }

    pub fn with_provider_timeout(mut self, limit: Duration) -> Self {
        self.provider_timeout = limit;
        self
    }

    /// Runs one queue job. Per-account failures are logged and counted in
    /// the report; only systemic errors come back as `Err`.
    pub async fn process(&self, job: &SyncJob) -> Result<JobReport> {
        match job {
            SyncJob::Sweep => self.sweep().await,
            SyncJob::Account(job) => self.process_user(job).await,
        }
    }

    async fn sweep(&self) -> Result<JobReport> {
        let user_ids = self.db.list_user_ids().await?;
        info!(users = user_ids.len(), "starting scheduled sweep");

        let mut report = JobReport::default();
        for user_id in user_ids {
            let job = AccountSyncJob {
                user_id,
                account_id: None,
                reason: SyncReason::Scheduled,
            };
            report.absorb(self.process_user(&job).await?);
        }
        info!(?report, "sweep finished");
        Ok(report)
    }

    async fn process_user(&self, job: &AccountSyncJob) -> Result<JobReport> {
        let accounts = self
            .db
            .load_accounts(&job.user_id, job.account_id.as_deref())
            .await?;

        if accounts.is_empty() {
            match &job.account_id {
                Some(account_id) => warn!(
                    user_id = %job.user_id,
                    account_id = %account_id,
                    "account not found for user, nothing to sync"
                ),
                None => debug!(user_id = %job.user_id, "user has no connected accounts"),
            }
        }

        let mut report = JobReport {
            users: 1,
            ..Default::default()
        };

        for account in &accounts {
            match self.sync_account(account).await {
                Ok(merged) => {
                    report.accounts_synced += 1;
                    report.items_merged += merged;
                    info!(
                        account_id = %account.id,
                        provider = %account.provider,
                        reason = ?job.reason,
                        merged,
                        "account synced"
                    );
                }
                Err(e) if e.is_systemic() => return Err(e),
                Err(e) => {
                    report.accounts_failed += 1;
                    match e {
                        SyncError::TamperedOrCorrupt => error!(
                            account_id = %account.id,
                            provider = %account.provider,
                            "stored credentials failed integrity check"
                        ),
                        other => warn!(
                            account_id = %account.id,
                            provider = %account.provider,
                            kind = other.kind(),
                            error = %other,
                            "account sync failed"
                        ),
                    }
                }
            }
        }

        Ok(report)
    }

    /// Syncs one account under its lock and returns the number of items
    /// merged.
    async fn sync_account(&self, account: &ConnectedAccount) -> Result<usize> {
        let _guard = self.locks.lock(&account.id).await;

        let credentials = open_credentials(&self.vault, account)?;
        let hints = SyncHints {
            external_account_id: account.external_account_id.clone(),
            last_sync_at: account.last_sync_at(),
            batch_size: self.batch_size,
        };

        let adapter = self.adapters.for_provider(account.provider);
        let items = with_deadline(
            self.provider_timeout,
            adapter.fetch_recent(&credentials, &hints),
        )
        .await?;
        drop(credentials);
        debug!(account_id = %account.id, fetched = items.len(), "fetched provider items");

        let ctx = MergeContext {
            user_id: account.user_id.clone(),
            account_id: account.id.clone(),
        };
        for item in &items {
            self.reconciler.merge(item, &ctx).await?;
        }

        self.db.stamp_last_sync(&account.id, Utc::now()).await?;
        Ok(items.len())
    }
}

pub(crate) fn open_credentials(
    vault: &SecretVault,
    account: &ConnectedAccount,
) -> Result<Credentials> {
    Ok(Credentials {
        access_token: vault.open_str(&account.access_token_encrypted)?,
        refresh_token: account
            .refresh_token_encrypted
            .as_deref()
            .map(|sealed| vault.open_str(sealed))
            .transpose()?,
    })
}
