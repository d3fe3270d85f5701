use crate::error::Result;
use crate::queue::{FailOutcome, JobQueue, QueuedJob};
use crate::sync::SyncProcessor;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Fixed set of workers pulling from the queue. Each worker runs one job to
/// completion before reserving the next, renewing its lease while it works.
pub struct WorkerPool {
    queue: Arc<dyn JobQueue>,
    processor: Arc<SyncProcessor>,
    concurrency: usize,
    poll_interval: Duration,
    lease_refresh: Duration,
}

impl WorkerPool {
    pub fn new(
        queue: Arc<dyn JobQueue>,
        processor: Arc<SyncProcessor>,
        concurrency: usize,
        poll_interval: Duration,
        lease_refresh: Duration,
    ) -> Self {
        Self {
            queue,
            processor,
            concurrency: concurrency.max(1),
            poll_interval,
            lease_refresh: lease_refresh.max(Duration::from_millis(10)),
        }
    }

    /// Runs until `shutdown` flips. In-flight jobs finish; nothing new is
    /// reserved after the signal. Dropping or aborting this future aborts
    /// every worker with it.
    pub async fn run(self, shutdown: watch::Receiver<bool>) {
        info!(concurrency = self.concurrency, "worker pool started");
        let mut workers = JoinSet::new();
        for worker in 0..self.concurrency {
            let context = WorkerContext {
                worker,
                queue: self.queue.clone(),
                processor: self.processor.clone(),
                poll_interval: self.poll_interval,
                lease_refresh: self.lease_refresh,
            };
            workers.spawn(worker_loop(context, shutdown.clone()));
        }

        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "worker task panicked");
            }
        }
        info!("worker pool stopped");
    }
}

struct WorkerContext {
    worker: usize,
    queue: Arc<dyn JobQueue>,
    processor: Arc<SyncProcessor>,
    poll_interval: Duration,
    lease_refresh: Duration,
}

async fn worker_loop(ctx: WorkerContext, mut shutdown: watch::Receiver<bool>) {
    let worker = ctx.worker;
    loop {
        if *shutdown.borrow() {
            break;
        }

        match ctx.queue.reserve().await {
            Ok(Some(job)) => {
                let settled =
                    run_job(ctx.queue.as_ref(), &ctx.processor, &job, ctx.lease_refresh).await;
                if let Err(e) = settled {
                    error!(worker, job_id = %job.id, error = %e, "failed to settle job");
                }
                continue;
            }
            Ok(None) => {}
            Err(e) => error!(worker, error = %e, "failed to reserve job"),
        }

        tokio::select! {
            _ = tokio::time::sleep(ctx.poll_interval) => {}
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }
    debug!(worker, "worker exiting");
}

async fn run_job(
    queue: &dyn JobQueue,
    processor: &SyncProcessor,
    job: &QueuedJob,
    lease_refresh: Duration,
) -> Result<()> {
    debug!(job_id = %job.id, name = %job.name, attempt = job.attempt, "processing job");

    let outcome = match job.decode() {
        Ok(payload) => {
            let work = processor.process(&payload);
            tokio::pin!(work);
            tokio::select! {
                outcome = &mut work => outcome,
                () = keep_lease(queue, job, lease_refresh) => work.await,
            }
        }
        Err(e) => Err(e),
    };

    match outcome {
        Ok(report) => {
            info!(job_id = %job.id, name = %job.name, ?report, "job completed");
            queue.complete(job).await
        }
        Err(e) => {
            let message = e.to_string();
            match queue.fail(job, &message).await? {
                FailOutcome::Retrying { delay } => warn!(
                    job_id = %job.id,
                    kind = e.kind(),
                    error = %message,
                    retry_in_ms = delay.as_millis() as u64,
                    "job failed, will retry"
                ),
                FailOutcome::Parked => error!(
                    job_id = %job.id,
                    kind = e.kind(),
                    error = %message,
                    "job failed permanently"
                ),
            }
            Ok(())
        }
    }
}

/// Renews the lease every `every` until the queue reports it lost.
async fn keep_lease(queue: &dyn JobQueue, job: &QueuedJob, every: Duration) {
    let mut ticks = tokio::time::interval(every);
    ticks.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticks.tick().await;
    loop {
        ticks.tick().await;
        match queue.extend_lease(job).await {
            Ok(true) => debug!(job_id = %job.id, attempt = job.attempt, "lease extended"),
            Ok(false) => {
                warn!(job_id = %job.id, attempt = job.attempt, "lease lost while processing");
                return;
            }
            Err(e) => warn!(job_id = %job.id, error = %e, "failed to extend lease"),
        }
    }
}
