use anyhow::Context;
use inbox_sync::config::Config;
use inbox_sync::db::Database;
use inbox_sync::error::SyncError;
use inbox_sync::providers::Adapters;
use inbox_sync::queue::{JobOptions, JobQueue, SqliteJobQueue};
use inbox_sync::scheduler::{Scheduler, enqueue_manual_sync};
use inbox_sync::sync::{AccountLocks, SyncProcessor};
use inbox_sync::vault::SecretVault;
use inbox_sync::worker::WorkerPool;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,inbox_sync=debug")),
        )
        .init();

    let config = Config::load()?;
    let db = Database::new(&config.database_url).await?;
    db.run_migrations().await?;

    let queue: Arc<dyn JobQueue> =
        Arc::new(SqliteJobQueue::from_settings(db.clone(), &config.queue));
    let options = JobOptions::from_settings(&config.queue);

    // Enqueue-only mode: inbox-sync --enqueue <user_id> [account_id]
    let args: Vec<String> = std::env::args().collect();
    if let Some(pos) = args.iter().position(|arg| arg == "--enqueue") {
        let user_id = args
            .get(pos + 1)
            .context("Usage: inbox-sync --enqueue <user_id> [account_id]")?;
        let account_id = args.get(pos + 2).map(String::as_str);
        let queued =
            enqueue_manual_sync(&db, queue.as_ref(), &options, user_id, account_id).await;
        let job_id = match queued {
            Ok(id) => id,
            Err(SyncError::AccountNotFound) => {
                db.close().await;
                anyhow::bail!("account not found");
            }
            Err(e) => {
                warn!(user_id = %user_id, kind = e.kind(), error = %e, "manual sync not queued");
                db.close().await;
                anyhow::bail!("sync could not be queued");
            }
        };
        println!("Queued sync job {}", job_id);
        db.close().await;
        return Ok(());
    }

    let key = config
        .encryption_key
        .as_ref()
        .ok_or(SyncError::ConfigMissing("ENCRYPTION_KEY"))?;
    let vault = Arc::new(SecretVault::from_base64_key(&key.0)?);
    let adapters = Adapters::from_config(&config)?;
    let locks = AccountLocks::default();

    let processor = Arc::new(SyncProcessor::new(
        db.clone(),
        vault,
        adapters,
        locks,
        config.sync.batch_size,
    )
    .with_provider_timeout(config.provider_timeout()));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let scheduler = Scheduler::new(queue.clone(), config.schedule_interval(), options);
    let scheduler_handle = tokio::spawn(scheduler.run(shutdown_rx.clone()));

    let pool = WorkerPool::new(
        queue.clone(),
        processor,
        config.sync.concurrency,
        Duration::from_millis(config.queue.poll_millis),
        config.lease_refresh(),
    );
    let mut pool_handle = tokio::spawn(pool.run(shutdown_rx));

    info!(
        queue = %config.queue.name,
        concurrency = config.sync.concurrency,
        "inbox-sync worker running"
    );

    let pool_exited = tokio::select! {
        _ = shutdown_signal() => {
            info!("shutdown requested");
            false
        }
        _ = &mut pool_handle => {
            warn!("worker pool exited unexpectedly");
            true
        }
    };
    let _ = shutdown_tx.send(true);

    let _ = scheduler_handle.await;
    if !pool_exited
        && tokio::time::timeout(config.shutdown_grace(), &mut pool_handle)
            .await
            .is_err()
    {
        warn!("in-flight jobs did not finish in time, leaving them to lease expiry");
        pool_handle.abort();
    }

    db.close().await;
    info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(_) => {
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
