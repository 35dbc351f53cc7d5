//! Stale lock watchdog.
//!
//! Runs on its own interval, independent of the worker pool, and
//! force-releases locks older than `watchdog_timeout`. This is what frees
//! mailboxes left locked by a crashed worker or a dead process.

use std::sync::Arc;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::AggregatorConfig;
use crate::mailbox::MailboxId;
use crate::scheduler::Scheduler;

/// Spawn the watchdog loop. It stops when `cancel` fires.
pub fn spawn_watchdog(
    scheduler: Arc<Scheduler>,
    config: &AggregatorConfig,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    let interval = config.watchdog_interval;
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // Skip immediate first tick
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    sweep(&scheduler).await;
                }
            }
        }
        debug!("Watchdog stopped");
    })
}

/// One watchdog pass. Returns the reclaimed mailboxes.
pub async fn sweep(scheduler: &Scheduler) -> Vec<MailboxId> {
    let reclaimed = scheduler.reclaim_stale(Utc::now()).await;
    if reclaimed.is_empty() {
        debug!("No stale locks");
    } else {
        info!(count = reclaimed.len(), mailboxes = ?reclaimed, "Reclaimed stale locks");
    }
    reclaimed
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use uuid::Uuid;

    use super::*;
    use crate::lock_store::LockStore;
    use crate::scheduler::SchedulerDeps;
    use crate::test_support::{
        FakeBilling, FakeDirectory, FakeRepository, RecordingAlerts, descriptor,
    };

    const TEST_TICK: Duration = Duration::from_millis(20);

    fn scheduler(repository: Arc<FakeRepository>, config: AggregatorConfig) -> Arc<Scheduler> {
        let locks = Arc::new(LockStore::new(repository.clone(), None, Uuid::new_v4()));
        Arc::new(Scheduler::new(
            config,
            SchedulerDeps {
                repository,
                billing: Arc::new(FakeBilling::default()),
                directory: Arc::new(FakeDirectory::default()),
                alerts: Arc::new(RecordingAlerts::default()),
                locks,
                journal: None,
            },
        ))
    }

    #[tokio::test]
    async fn sweep_frees_stale_locks_once() {
        let repository = Arc::new(FakeRepository::with_mailboxes([descriptor(1, 1, "u")]));
        let config = AggregatorConfig {
            watchdog_timeout: Duration::ZERO,
            ..AggregatorConfig::default()
        };
        let scheduler = scheduler(repository.clone(), config);
        let acquired = scheduler.acquire_up_to(1).await;
        assert_eq!(acquired.len(), 1);

        assert_eq!(sweep(&scheduler).await, vec![1]);
        assert!(sweep(&scheduler).await.is_empty());
        assert!(!repository.is_row_locked(1));

        // The worker's own release is now a no-op.
        assert!(!scheduler.release(&acquired[0]).await);
    }

    #[tokio::test]
    async fn fresh_locks_survive_a_sweep() {
        let repository = Arc::new(FakeRepository::with_mailboxes([descriptor(1, 1, "u")]));
        let scheduler = scheduler(repository.clone(), AggregatorConfig::default());
        scheduler.acquire_up_to(1).await;

        assert!(sweep(&scheduler).await.is_empty());
        assert!(repository.is_row_locked(1));
    }

    #[tokio::test]
    async fn loop_reclaims_and_stops_on_cancel() {
        let repository = Arc::new(FakeRepository::with_mailboxes([descriptor(1, 1, "u")]));
        let config = AggregatorConfig {
            watchdog_timeout: Duration::ZERO,
            watchdog_interval: TEST_TICK,
            ..AggregatorConfig::default()
        };
        let scheduler = scheduler(repository.clone(), config.clone());
        scheduler.acquire_up_to(1).await;

        let cancel = CancellationToken::new();
        let handle = spawn_watchdog(scheduler.clone(), &config, cancel.clone());
        tokio::time::sleep(TEST_TICK * 5).await;
        assert!(!repository.is_row_locked(1));

        cancel.cancel();
        handle.await.unwrap();
    }
}
