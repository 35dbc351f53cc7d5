//! Process wiring: startup, recovery, the run loop and orderly shutdown.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::collaborators::{
    AlertSink, BillingService, MailboxHandler, TenantDirectory, UnreadSink,
};
use crate::config::AggregatorConfig;
use crate::error::Result;
use crate::journal::Journal;
use crate::lock_store::LockStore;
use crate::notify::NotificationDispatcher;
use crate::scheduler::{Scheduler, SchedulerDeps};
use crate::store::MailboxRepository;
use crate::watchdog::spawn_watchdog;
use crate::worker::{PoolReport, WorkerPool};

/// Everything the aggregator talks to.
pub struct Collaborators {
    pub repository: Arc<dyn MailboxRepository>,
    pub billing: Arc<dyn BillingService>,
    pub directory: Arc<dyn TenantDirectory>,
    pub alerts: Arc<dyn AlertSink>,
    pub handler: Arc<dyn MailboxHandler>,
    pub unread: Arc<dyn UnreadSink>,
}

pub struct Launcher {
    config: AggregatorConfig,
    collaborators: Collaborators,
}

impl Launcher {
    pub fn new(config: AggregatorConfig, collaborators: Collaborators) -> Self {
        Self {
            config,
            collaborators,
        }
    }

    /// Run the aggregator until `cancel` fires.
    ///
    /// Fails before polling anything if the configuration is invalid or the
    /// journal was left dirty by a crash mid-write.
    pub async fn run(self, cancel: CancellationToken) -> Result<PoolReport> {
        let Self {
            config,
            collaborators,
        } = self;
        config.validate()?;

        let journal = if config.use_dump {
            Some(Arc::new(Journal::open(&config.dump_path).await?))
        } else {
            info!("Journal disabled; locks will not survive a restart");
            None
        };

        let owner = Uuid::new_v4();
        let locks = Arc::new(LockStore::new(
            collaborators.repository.clone(),
            journal.clone(),
            owner,
        ));
        let scheduler = Arc::new(Scheduler::new(
            config.clone(),
            SchedulerDeps {
                repository: collaborators.repository.clone(),
                billing: collaborators.billing,
                directory: collaborators.directory,
                alerts: collaborators.alerts,
                locks,
                journal: journal.clone(),
            },
        ));
        scheduler.recover().await;

        let (notifications, dispatcher) =
            NotificationDispatcher::spawn(collaborators.unread, cancel.child_token());
        let watchdog = spawn_watchdog(scheduler.clone(), &config, cancel.child_token());

        info!(%owner, max_tasks = config.max_tasks_at_once, "Aggregator started");
        let pool = WorkerPool::new(
            config,
            scheduler.clone(),
            collaborators.handler,
            collaborators.repository,
            notifications,
        );
        let report = pool.run(cancel.clone()).await;

        // Best effort whatever the pool left behind.
        scheduler.release_all().await;
        cancel.cancel();
        for (name, handle) in [("dispatcher", dispatcher), ("watchdog", watchdog)] {
            if let Err(e) = handle.await {
                warn!(task = name, "Background task ended abnormally: {e}");
            }
        }

        let stats = scheduler.stats().await;
        if let Some(journal) = journal {
            journal.close().await;
        }
        info!(
            completed = report.completed,
            failed = report.failed,
            locked = stats.locked,
            "Aggregator stopped"
        );
        Ok(report)
    }
}
