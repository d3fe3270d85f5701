//! Durable job queue over the `sync_jobs` table.
//!
//! Delivery is at-least-once: a reserved job carries a lease, and a job whose
//! lease runs out before `complete`/`fail` is handed out again. Consumers must
//! therefore be idempotent.

use crate::config::QueueSettings;
use crate::db::{Database, new_id, now_millis};
use crate::error::{Result, SyncError};
use crate::models::SyncJob;
use async_trait::async_trait;
use sqlx::Row;
use sqlx::sqlite::SqliteRow;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    Fixed { delay_ms: u64 },
    Exponential { delay_ms: u64 },
}

impl Backoff {
    /// Delay before retrying after the `attempt`-th delivery failed
    /// (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        match *self {
            Backoff::Fixed { delay_ms } => Duration::from_millis(delay_ms),
            Backoff::Exponential { delay_ms } => {
                let factor = 1u64 << attempt.saturating_sub(1).min(20);
                Duration::from_millis(delay_ms.saturating_mul(factor))
            }
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Backoff::Fixed { .. } => "fixed",
            Backoff::Exponential { .. } => "exponential",
        }
    }

    fn delay_ms(&self) -> u64 {
        match *self {
            Backoff::Fixed { delay_ms } | Backoff::Exponential { delay_ms } => delay_ms,
        }
    }

    fn from_parts(kind: &str, delay_ms: u64) -> Self {
        match kind {
            "fixed" => Backoff::Fixed { delay_ms },
            _ => Backoff::Exponential { delay_ms },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobOptions {
    pub attempts: u32,
    pub backoff: Backoff,
    pub keep_completed: u32,
    pub keep_failed: u32,
    /// Collapses this job into an identical one that is still waiting or
    /// running.
    pub dedup_key: Option<String>,
}

impl JobOptions {
    pub fn from_settings(settings: &QueueSettings) -> Self {
        Self {
            attempts: settings.attempts.max(1),
            backoff: Backoff::Exponential {
                delay_ms: settings.backoff_ms,
            },
            keep_completed: settings.keep_completed,
            keep_failed: settings.keep_failed,
            dedup_key: None,
        }
    }

    pub fn with_dedup_key(mut self, key: impl Into<String>) -> Self {
        self.dedup_key = Some(key.into());
        self
    }
}

impl Default for JobOptions {
    fn default() -> Self {
        Self::from_settings(&QueueSettings::default())
    }
}

/// One leased delivery of a job.
#[derive(Debug, Clone)]
pub struct QueuedJob {
    pub id: String,
    pub name: String,
    pub payload: String,
    /// 1-based delivery number; doubles as the lease token.
    pub attempt: u32,
    pub max_attempts: u32,
    pub backoff: Backoff,
    pub keep_completed: u32,
    pub keep_failed: u32,
}

impl QueuedJob {
    pub fn decode(&self) -> Result<SyncJob> {
        Ok(serde_json::from_str(&self.payload)?)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    Retrying { delay: Duration },
    Parked,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueCounts {
    pub waiting: i64,
    pub active: i64,
    pub completed: i64,
    pub failed: i64,
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Enqueues `job` and returns its id. With a dedup key, returns the id of
    /// the pending job it collapsed into instead.
    async fn enqueue(&self, name: &str, job: &SyncJob, options: &JobOptions) -> Result<String>;

    /// Leases the oldest due job, if any.
    async fn reserve(&self) -> Result<Option<QueuedJob>>;

    /// Pushes the lease of a job this delivery still holds one visibility
    /// window past now. Returns false once the lease has been lost.
    async fn extend_lease(&self, job: &QueuedJob) -> Result<bool>;

    async fn complete(&self, job: &QueuedJob) -> Result<()>;

    async fn fail(&self, job: &QueuedJob, error: &str) -> Result<FailOutcome>;

    async fn counts(&self) -> Result<QueueCounts>;
}

#[derive(Clone)]
pub struct SqliteJobQueue {
    db: Database,
    queue: String,
    visibility: Duration,
}

impl SqliteJobQueue {
    pub fn new(db: Database, queue: impl Into<String>, visibility: Duration) -> Self {
        Self {
            db,
            queue: queue.into(),
            visibility,
        }
    }

    pub fn from_settings(db: Database, settings: &QueueSettings) -> Self {
        Self::new(
            db,
            settings.name.clone(),
            Duration::from_secs(settings.visibility_seconds.max(1)),
        )
    }

    async fn prune(&self, state: &str, keep: u32) -> Result<()> {
        let pruned = sqlx::query(
            "DELETE FROM sync_jobs
             WHERE queue = ?1 AND state = ?2
               AND id NOT IN (
                   SELECT id FROM sync_jobs
                   WHERE queue = ?1 AND state = ?2
                   ORDER BY finished_at DESC
                   LIMIT ?3
               )",
        )
        .bind(&self.queue)
        .bind(state)
        .bind(i64::from(keep))
        .execute(self.db.pool())
        .await?;
        if pruned.rows_affected() > 0 {
            debug!(queue = %self.queue, state, pruned = pruned.rows_affected(), "pruned jobs");
        }
        Ok(())
    }

    /// Parks running jobs whose lease ran out on their final attempt.
    async fn park_exhausted_leases(&self, now: i64) -> Result<()> {
        let parked = sqlx::query(
            "UPDATE sync_jobs
             SET state = 'failed', locked_until = NULL, finished_at = ?2,
                 last_error = 'lease expired on final attempt'
             WHERE queue = ?1 AND state = 'active' AND locked_until <= ?2
               AND attempts >= max_attempts",
        )
        .bind(&self.queue)
        .bind(now)
        .execute(self.db.pool())
        .await?;
        if parked.rows_affected() > 0 {
            warn!(queue = %self.queue, parked = parked.rows_affected(), "parked jobs with expired leases");
        }
        Ok(())
    }
}

#[async_trait]
impl JobQueue for SqliteJobQueue {
    async fn enqueue(&self, name: &str, job: &SyncJob, options: &JobOptions) -> Result<String> {
        let id = new_id();
        let payload = serde_json::to_string(job)?;
        let now = now_millis();

        let inserted = sqlx::query(
            "INSERT OR IGNORE INTO sync_jobs (id, queue, name, payload, dedup_key, state, attempts,
                                              max_attempts, backoff_kind, backoff_delay_ms,
                                              keep_completed, keep_failed, run_at, created_at)
             VALUES (?, ?, ?, ?, ?, 'waiting', 0, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(&self.queue)
        .bind(name)
        .bind(&payload)
        .bind(&options.dedup_key)
        .bind(i64::from(options.attempts.max(1)))
        .bind(options.backoff.kind())
        .bind(options.backoff.delay_ms() as i64)
        .bind(i64::from(options.keep_completed))
        .bind(i64::from(options.keep_failed))
        .bind(now)
        .bind(now)
        .execute(self.db.pool())
        .await?;

        if inserted.rows_affected() == 1 {
            debug!(queue = %self.queue, job_id = %id, name, "enqueued job");
            return Ok(id);
        }

        let existing = sqlx::query(
            "SELECT id FROM sync_jobs
             WHERE queue = ? AND dedup_key = ? AND state IN ('waiting', 'active')",
        )
        .bind(&self.queue)
        .bind(&options.dedup_key)
        .fetch_optional(self.db.pool())
        .await?;

        match existing {
            Some(row) => {
                let existing_id: String = row.try_get(0)?;
                debug!(queue = %self.queue, job_id = %existing_id, name, "job already pending");
                Ok(existing_id)
            }
            // The pending duplicate finished between the insert and the lookup.
            None => Err(SyncError::InvalidInput(format!(
                "job '{}' could not be enqueued, retry",
                name
            ))),
        }
    }

    async fn reserve(&self) -> Result<Option<QueuedJob>> {
        let now = now_millis();
        self.park_exhausted_leases(now).await?;

        let lease_until = now + self.visibility.as_millis() as i64;
        let row = sqlx::query(
            "UPDATE sync_jobs
             SET state = 'active', attempts = attempts + 1, locked_until = ?3
             WHERE id = (
                 SELECT id FROM sync_jobs
                 WHERE queue = ?1
                   AND ((state = 'waiting' AND run_at <= ?2)
                        OR (state = 'active' AND locked_until <= ?2))
                   AND attempts < max_attempts
                 ORDER BY run_at ASC, created_at ASC
                 LIMIT 1
             )
             RETURNING id, name, payload, attempts, max_attempts, backoff_kind,
                       backoff_delay_ms, keep_completed, keep_failed",
        )
        .bind(&self.queue)
        .bind(now)
        .bind(lease_until)
        .fetch_optional(self.db.pool())
        .await?;

        row.as_ref().map(queued_job_from_row).transpose()
    }

    async fn extend_lease(&self, job: &QueuedJob) -> Result<bool> {
        let lease_until = now_millis() + self.visibility.as_millis() as i64;
        let extended = sqlx::query(
            "UPDATE sync_jobs SET locked_until = ?
             WHERE id = ? AND state = 'active' AND attempts = ?",
        )
        .bind(lease_until)
        .bind(&job.id)
        .bind(i64::from(job.attempt))
        .execute(self.db.pool())
        .await?;
        Ok(extended.rows_affected() == 1)
    }

    async fn complete(&self, job: &QueuedJob) -> Result<()> {
        let done = sqlx::query(
            "UPDATE sync_jobs
             SET state = 'completed', locked_until = NULL, last_error = NULL, finished_at = ?
             WHERE id = ? AND state = 'active' AND attempts = ?",
        )
        .bind(now_millis())
        .bind(&job.id)
        .bind(i64::from(job.attempt))
        .execute(self.db.pool())
        .await?;

        if done.rows_affected() == 0 {
            warn!(job_id = %job.id, attempt = job.attempt, "lease lost before completion");
            return Ok(());
        }
        self.prune("completed", job.keep_completed).await
    }

    async fn fail(&self, job: &QueuedJob, error: &str) -> Result<FailOutcome> {
        let now = now_millis();

        if job.attempt >= job.max_attempts {
            sqlx::query(
                "UPDATE sync_jobs
                 SET state = 'failed', locked_until = NULL, last_error = ?, finished_at = ?
                 WHERE id = ? AND state = 'active' AND attempts = ?",
            )
            .bind(error)
            .bind(now)
            .bind(&job.id)
            .bind(i64::from(job.attempt))
            .execute(self.db.pool())
            .await?;
            warn!(job_id = %job.id, attempts = job.attempt, error, "job parked as failed");
            self.prune("failed", job.keep_failed).await?;
            return Ok(FailOutcome::Parked);
        }

        let delay = job.backoff.delay_for(job.attempt);
        sqlx::query(
            "UPDATE sync_jobs
             SET state = 'waiting', locked_until = NULL, last_error = ?, run_at = ?
             WHERE id = ? AND state = 'active' AND attempts = ?",
        )
        .bind(error)
        .bind(now + delay.as_millis() as i64)
        .bind(&job.id)
        .bind(i64::from(job.attempt))
        .execute(self.db.pool())
        .await?;
        debug!(job_id = %job.id, attempt = job.attempt, delay_ms = delay.as_millis() as u64, "job scheduled for retry");
        Ok(FailOutcome::Retrying { delay })
    }

    async fn counts(&self) -> Result<QueueCounts> {
        let rows = sqlx::query(
            "SELECT state, COUNT(*) AS total FROM sync_jobs WHERE queue = ? GROUP BY state",
        )
        .bind(&self.queue)
        .fetch_all(self.db.pool())
        .await?;

        let mut counts = QueueCounts::default();
        for row in rows {
            let state: String = row.try_get("state")?;
            let total: i64 = row.try_get("total")?;
            match state.as_str() {
                "waiting" => counts.waiting = total,
                "active" => counts.active = total,
                "completed" => counts.completed = total,
                "failed" => counts.failed = total,
                _ => {}
            }
        }
        Ok(counts)
    }
}

fn queued_job_from_row(row: &SqliteRow) -> Result<QueuedJob> {
    let kind: String = row.try_get("backoff_kind")?;
    let delay_ms: i64 = row.try_get("backoff_delay_ms")?;
    let attempts: i64 = row.try_get("attempts")?;
    let max_attempts: i64 = row.try_get("max_attempts")?;
    let keep_completed: i64 = row.try_get("keep_completed")?;
    let keep_failed: i64 = row.try_get("keep_failed")?;

    Ok(QueuedJob {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        payload: row.try_get("payload")?,
        attempt: attempts.max(0) as u32,
        max_attempts: max_attempts.max(1) as u32,
        backoff: Backoff::from_parts(&kind, delay_ms.max(0) as u64),
        keep_completed: keep_completed.max(0) as u32,
        keep_failed: keep_failed.max(0) as u32,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{MANUAL_JOB_NAME, SCHEDULED_JOB_NAME};

    async fn queue(visibility: Duration) -> SqliteJobQueue {
        let db = Database::open_memory().await.unwrap();
        SqliteJobQueue::new(db, "test", visibility)
    }

    fn no_backoff(attempts: u32) -> JobOptions {
        JobOptions {
            attempts,
            backoff: Backoff::Fixed { delay_ms: 0 },
            keep_completed: 10,
            keep_failed: 10,
            dedup_key: None,
        }
    }

    #[test]
    fn exponential_backoff_doubles() {
        let backoff = Backoff::Exponential { delay_ms: 1000 };
        assert_eq!(backoff.delay_for(1), Duration::from_millis(1000));
        assert_eq!(backoff.delay_for(2), Duration::from_millis(2000));
        assert_eq!(backoff.delay_for(3), Duration::from_millis(4000));
        assert_eq!(
            Backoff::Fixed { delay_ms: 50 }.delay_for(5),
            Duration::from_millis(50)
        );
    }

    #[tokio::test]
    async fn reserve_complete_round() {
        let queue = queue(Duration::from_secs(60)).await;
        let job = SyncJob::manual("u-1", None);
        let id = queue
            .enqueue(MANUAL_JOB_NAME, &job, &no_backoff(3))
            .await
            .unwrap();

        let leased = queue.reserve().await.unwrap().unwrap();
        assert_eq!(leased.id, id);
        assert_eq!(leased.attempt, 1);
        assert_eq!(leased.decode().unwrap(), job);
        assert!(queue.reserve().await.unwrap().is_none());

        queue.complete(&leased).await.unwrap();
        let counts = queue.counts().await.unwrap();
        assert_eq!(counts.completed, 1);
        assert_eq!(counts.active, 0);
    }

    #[tokio::test]
    async fn failures_retry_then_park() {
        let queue = queue(Duration::from_secs(60)).await;
        queue
            .enqueue(MANUAL_JOB_NAME, &SyncJob::manual("u-1", None), &no_backoff(2))
            .await
            .unwrap();

        let first = queue.reserve().await.unwrap().unwrap();
        assert_eq!(
            queue.fail(&first, "store down").await.unwrap(),
            FailOutcome::Retrying {
                delay: Duration::ZERO
            }
        );

        let second = queue.reserve().await.unwrap().unwrap();
        assert_eq!(second.attempt, 2);
        assert_eq!(queue.fail(&second, "store down").await.unwrap(), FailOutcome::Parked);

        assert!(queue.reserve().await.unwrap().is_none());
        let counts = queue.counts().await.unwrap();
        assert_eq!(counts.failed, 1);
        assert_eq!(counts.waiting, 0);
    }

    #[tokio::test]
    async fn expired_leases_are_redelivered() {
        let queue = queue(Duration::ZERO).await;
        queue
            .enqueue(MANUAL_JOB_NAME, &SyncJob::manual("u-1", None), &no_backoff(3))
            .await
            .unwrap();

        let first = queue.reserve().await.unwrap().unwrap();
        let again = queue.reserve().await.unwrap().unwrap();
        assert_eq!(first.id, again.id);
        assert_eq!(again.attempt, 2);

        // The stale delivery can no longer settle the job.
        queue.complete(&first).await.unwrap();
        assert_eq!(queue.counts().await.unwrap().completed, 0);

        queue.complete(&again).await.unwrap();
        assert_eq!(queue.counts().await.unwrap().completed, 1);
    }

    #[tokio::test]
    async fn extended_lease_is_not_redelivered() {
        let queue = queue(Duration::from_millis(300)).await;
        queue
            .enqueue(MANUAL_JOB_NAME, &SyncJob::manual("u-1", None), &no_backoff(3))
            .await
            .unwrap();

        let job = queue.reserve().await.unwrap().unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(queue.extend_lease(&job).await.unwrap());
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(queue.reserve().await.unwrap().is_none());

        queue.complete(&job).await.unwrap();
        assert!(!queue.extend_lease(&job).await.unwrap());
    }

    #[tokio::test]
    async fn stale_delivery_cannot_extend() {
        let queue = queue(Duration::ZERO).await;
        queue
            .enqueue(MANUAL_JOB_NAME, &SyncJob::manual("u-1", None), &no_backoff(3))
            .await
            .unwrap();

        let first = queue.reserve().await.unwrap().unwrap();
        let again = queue.reserve().await.unwrap().unwrap();
        assert!(!queue.extend_lease(&first).await.unwrap());
        assert!(queue.extend_lease(&again).await.unwrap());
    }

    #[tokio::test]
    async fn expired_final_lease_is_parked() {
        let queue = queue(Duration::ZERO).await;
        queue
            .enqueue(MANUAL_JOB_NAME, &SyncJob::manual("u-1", None), &no_backoff(1))
            .await
            .unwrap();

        queue.reserve().await.unwrap().unwrap();
        assert!(queue.reserve().await.unwrap().is_none());
        assert_eq!(queue.counts().await.unwrap().failed, 1);
    }

    #[tokio::test]
    async fn dedup_key_collapses_pending_jobs() {
        let queue = queue(Duration::from_secs(60)).await;
        let options = no_backoff(3).with_dedup_key("sweep");

        let a = queue
            .enqueue(SCHEDULED_JOB_NAME, &SyncJob::Sweep, &options)
            .await
            .unwrap();
        let b = queue
            .enqueue(SCHEDULED_JOB_NAME, &SyncJob::Sweep, &options)
            .await
            .unwrap();
        assert_eq!(a, b);
        assert_eq!(queue.counts().await.unwrap().waiting, 1);

        let leased = queue.reserve().await.unwrap().unwrap();
        queue.complete(&leased).await.unwrap();

        let c = queue
            .enqueue(SCHEDULED_JOB_NAME, &SyncJob::Sweep, &options)
            .await
            .unwrap();
        assert_ne!(a, c);
    }

    #[tokio::test]
    async fn retention_prunes_oldest_completed() {
        let queue = queue(Duration::from_secs(60)).await;
        let mut options = no_backoff(1);
        options.keep_completed = 2;

        for user in ["u-1", "u-2", "u-3", "u-4"] {
            queue
                .enqueue(MANUAL_JOB_NAME, &SyncJob::manual(user, None), &options)
                .await
                .unwrap();
            let leased = queue.reserve().await.unwrap().unwrap();
            queue.complete(&leased).await.unwrap();
        }
        assert_eq!(queue.counts().await.unwrap().completed, 2);
    }
}
