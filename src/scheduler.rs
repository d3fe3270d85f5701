use crate::db::Database;
use crate::error::{Result, SyncError};
use crate::models::{MANUAL_JOB_NAME, SCHEDULED_JOB_NAME, SyncJob};
use crate::queue::{JobOptions, JobQueue};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{error, info};

pub const SWEEP_DEDUP_KEY: &str = "sweep";

/// Periodically enqueues a sweep job. The sweep is expanded per user by the
/// processor, not here.
pub struct Scheduler {
    queue: Arc<dyn JobQueue>,
    interval: Duration,
    options: JobOptions,
}

impl Scheduler {
    pub fn new(queue: Arc<dyn JobQueue>, interval: Duration, options: JobOptions) -> Self {
        Self {
            queue,
            interval,
            options: options.with_dedup_key(SWEEP_DEDUP_KEY),
        }
    }

    pub async fn enqueue_sweep(&self) -> Result<String> {
        self.queue
            .enqueue(SCHEDULED_JOB_NAME, &SyncJob::Sweep, &self.options)
            .await
    }

    /// Ticks once immediately, then every interval, until `shutdown` flips.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(every_secs = self.interval.as_secs(), "scheduler started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.enqueue_sweep().await {
                        Ok(job_id) => info!(job_id = %job_id, "sweep enqueued"),
                        Err(e) => error!(error = %e, "failed to enqueue sweep"),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("scheduler stopped");
    }
}

/// Queues a manual sync for one user, optionally narrowed to one account.
/// Repeated requests for the same target collapse while one is pending.
pub async fn enqueue_manual_sync(
    db: &Database,
    queue: &dyn JobQueue,
    options: &JobOptions,
    user_id: &str,
    account_id: Option<&str>,
) -> Result<String> {
    if let Some(account_id) = account_id {
        if !db.account_owned_by(user_id, account_id).await? {
            return Err(SyncError::AccountNotFound);
        }
    }

    let dedup_key = format!("manual:{}:{}", user_id, account_id.unwrap_or("*"));
    let job = SyncJob::manual(user_id, account_id.map(str::to_string));
    queue
        .enqueue(MANUAL_JOB_NAME, &job, &options.clone().with_dedup_key(dedup_key))
        .await
}
