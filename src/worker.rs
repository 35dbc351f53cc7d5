//! Worker pool.
//!
//! Keeps up to `max_tasks_at_once` polls running. Each cycle asks the
//! scheduler for the shortfall, spawns one task per acquired mailbox and
//! waits for a completion (or `check_timeout`) before topping up again.
//! Every finished task releases its mailbox, whatever the outcome.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::task::{self, JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::collaborators::MailboxHandler;
use crate::config::AggregatorConfig;
use crate::error::PollError;
use crate::mailbox::{Lease, MailboxDescriptor};
use crate::notify::NotificationDispatcher;
use crate::scheduler::Scheduler;
use crate::store::MailboxRepository;

/// Totals of one pool run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolReport {
    pub completed: usize,
    pub failed: usize,
    /// Tasks that panicked or were aborted at shutdown.
    pub crashed: usize,
}

pub struct WorkerPool {
    config: AggregatorConfig,
    scheduler: Arc<Scheduler>,
    handler: Arc<dyn MailboxHandler>,
    repository: Arc<dyn MailboxRepository>,
    notifications: NotificationDispatcher,
}

type Running = HashMap<task::Id, Lease>;

impl WorkerPool {
    pub fn new(
        config: AggregatorConfig,
        scheduler: Arc<Scheduler>,
        handler: Arc<dyn MailboxHandler>,
        repository: Arc<dyn MailboxRepository>,
        notifications: NotificationDispatcher,
    ) -> Self {
        Self {
            config,
            scheduler,
            handler,
            repository,
            notifications,
        }
    }

    /// Run until `cancel` fires, then drain in-flight polls.
    pub async fn run(&self, cancel: CancellationToken) -> PoolReport {
        let mut tasks: JoinSet<Result<u32, PollError>> = JoinSet::new();
        let mut running = Running::new();
        let mut report = PoolReport::default();

        info!(
            max_tasks = self.config.max_tasks_at_once,
            "Worker pool started"
        );

        while !cancel.is_cancelled() {
            let shortfall = self.config.max_tasks_at_once.saturating_sub(tasks.len());
            if shortfall > 0 {
                for lease in self.scheduler.acquire_up_to(shortfall).await {
                    self.spawn(&mut tasks, &mut running, lease, &cancel);
                }
            }

            if tasks.is_empty() {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(self.config.check_interval) => continue,
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                joined = tasks.join_next_with_id() => {
                    if let Some(joined) = joined {
                        self.finish(&mut running, joined, &mut report).await;
                    }
                }
                _ = tokio::time::sleep(self.config.check_timeout) => {
                    debug!(running = tasks.len(), "No poll finished within check timeout");
                }
            }
        }

        self.drain(tasks, running, &mut report).await;
        info!(
            completed = report.completed,
            failed = report.failed,
            crashed = report.crashed,
            "Worker pool stopped"
        );
        report
    }

    fn spawn(
        &self,
        tasks: &mut JoinSet<Result<u32, PollError>>,
        running: &mut Running,
        lease: Lease,
        cancel: &CancellationToken,
    ) {
        let handler = Arc::clone(&self.handler);
        let cancel = cancel.clone();
        let polled = lease.mailbox.clone();
        let limit = self.config.tcp_timeout;
        let handle = tasks.spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => Err(PollError::Cancelled),
                result = tokio::time::timeout(limit, handler.poll_mailbox(&polled)) => {
                    result.unwrap_or(Err(PollError::Timeout(limit)))
                }
            }
        });
        debug!(
            mailbox_id = lease.mailbox.mailbox_id,
            address = %lease.mailbox.address,
            "Spawned poll"
        );
        running.insert(handle.id(), lease);
    }

    async fn finish(
        &self,
        running: &mut Running,
        joined: Result<(task::Id, Result<u32, PollError>), JoinError>,
        report: &mut PoolReport,
    ) {
        let (id, outcome) = match joined {
            Ok((id, result)) => (id, Ok(result)),
            Err(e) => (e.id(), Err(e)),
        };
        let Some(lease) = running.remove(&id) else {
            error!(task_id = %id, "Finished task is not tracked by the pool");
            return;
        };
        let mailbox = &lease.mailbox;

        match outcome {
            Ok(Ok(new_messages)) => {
                report.completed += 1;
                debug!(mailbox_id = mailbox.mailbox_id, new_messages, "Poll finished");
                if new_messages > 0 {
                    self.notifications.enqueue(mailbox.notification_target());
                }
                if mailbox.date_auth_error.is_some() {
                    self.record_auth_error(mailbox, false).await;
                }
            }
            Ok(Err(PollError::AuthFailed { address, reason })) => {
                report.failed += 1;
                warn!(mailbox_id = mailbox.mailbox_id, %address, "Authentication failed: {reason}");
                if mailbox.date_auth_error.is_none() {
                    self.record_auth_error(mailbox, true).await;
                }
            }
            Ok(Err(e @ PollError::Timeout(_))) => {
                report.failed += 1;
                warn!(mailbox_id = mailbox.mailbox_id, address = %mailbox.address, "{e}");
            }
            Ok(Err(e)) => {
                report.failed += 1;
                warn!(mailbox_id = mailbox.mailbox_id, "Poll failed: {e}");
            }
            Err(e) => {
                report.crashed += 1;
                if e.is_panic() {
                    error!(mailbox_id = mailbox.mailbox_id, "Poll task panicked");
                } else {
                    warn!(mailbox_id = mailbox.mailbox_id, "Poll task aborted");
                }
            }
        }

        self.scheduler.release(&lease).await;
    }

    async fn record_auth_error(&self, mailbox: &MailboxDescriptor, failed: bool) {
        let at = failed.then(Utc::now);
        if let Err(e) = self.repository.set_auth_error(mailbox.mailbox_id, at).await {
            warn!(mailbox_id = mailbox.mailbox_id, "Failed to record auth state: {e}");
        }
    }

    /// Give in-flight polls the shutdown grace period, then abort the rest.
    async fn drain(
        &self,
        mut tasks: JoinSet<Result<u32, PollError>>,
        mut running: Running,
        report: &mut PoolReport,
    ) {
        if tasks.is_empty() {
            return;
        }
        info!(in_flight = tasks.len(), "Waiting for in-flight polls");

        let deadline = tokio::time::sleep(self.config.shutdown_grace);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                joined = tasks.join_next_with_id() => match joined {
                    Some(joined) => self.finish(&mut running, joined, report).await,
                    None => break,
                },
                _ = &mut deadline => {
                    warn!(in_flight = tasks.len(), "Shutdown grace expired; aborting polls");
                    tasks.abort_all();
                    while let Some(joined) = tasks.join_next_with_id().await {
                        self.finish(&mut running, joined, report).await;
                    }
                    break;
                }
            }
        }

        // Anything still tracked lost its task without a join result.
        for (_, lease) in running.drain() {
            error!(mailbox_id = lease.mailbox_id(), "Releasing mailbox of an untracked task");
            self.scheduler.release(&lease).await;
        }
    }
}
