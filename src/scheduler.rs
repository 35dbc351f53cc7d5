//! Ready queue and admission control.
//!
//! The scheduler hands out locked mailboxes to the worker pool. It keeps a
//! bounded FIFO of due mailboxes loaded from the store, reloads it when it
//! runs dry or gets too old, and admits each popped mailbox through the
//! tenant tariff cache and the per-mailbox gate before locking it.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use tokio::sync::{Mutex, mpsc};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::admission::{
    Admission, AdmissionCache, DeferReason, DisableReason, MailboxGate, Scope, TariffState,
    to_chrono,
};
use crate::collaborators::{Alert, AlertKind, AlertSink, BillingService, TenantDirectory};
use crate::config::AggregatorConfig;
use crate::journal::Journal;
use crate::lock_store::{LockAttempt, LockStore};
use crate::mailbox::{Lease, MailboxDescriptor, MailboxId, TenantId};
use crate::store::{MailboxRepository, QueueQuery};

/// Collaborators the scheduler drives.
pub struct SchedulerDeps {
    pub repository: Arc<dyn MailboxRepository>,
    pub billing: Arc<dyn BillingService>,
    pub directory: Arc<dyn TenantDirectory>,
    pub alerts: Arc<dyn AlertSink>,
    pub locks: Arc<LockStore>,
    pub journal: Option<Arc<Journal>>,
}

/// Point-in-time view of the scheduler, for logging.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerStats {
    pub queued: usize,
    pub locked: usize,
    pub cached_tenants: usize,
    pub queue_age: Option<Duration>,
}

/// What crash recovery brought back.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub locks: usize,
    pub decisions: usize,
    pub clean_shutdown: bool,
}

struct QueueState {
    ready: VecDeque<MailboxDescriptor>,
    loaded_at: Option<Instant>,
    evicted: mpsc::UnboundedReceiver<TenantId>,
}

impl QueueState {
    fn needs_reload(&self, lifetime: Duration) -> bool {
        match self.loaded_at {
            None => true,
            Some(at) => self.ready.is_empty() || at.elapsed() >= lifetime,
        }
    }

    fn purge_tenant(&mut self, tenant: TenantId) {
        let before = self.ready.len();
        self.ready.retain(|m| m.tenant != tenant);
        let purged = before - self.ready.len();
        if purged > 0 {
            debug!(tenant, purged, "Purged tenant from ready queue");
        }
    }
}

pub struct Scheduler {
    config: AggregatorConfig,
    repository: Arc<dyn MailboxRepository>,
    billing: Arc<dyn BillingService>,
    gate: MailboxGate,
    alerts: Arc<dyn AlertSink>,
    locks: Arc<LockStore>,
    journal: Option<Arc<Journal>>,
    cache: AdmissionCache,
    state: Mutex<QueueState>,
}

impl Scheduler {
    pub fn new(config: AggregatorConfig, deps: SchedulerDeps) -> Self {
        let (evicted_tx, evicted_rx) = mpsc::unbounded_channel();
        let cache = AdmissionCache::new(config.tenant_caching_period).with_eviction_callback(
            move |tenant| {
                let _ = evicted_tx.send(tenant);
            },
        );

        Self {
            gate: MailboxGate::new(deps.directory, config.clone()),
            config,
            repository: deps.repository,
            billing: deps.billing,
            alerts: deps.alerts,
            locks: deps.locks,
            journal: deps.journal,
            cache,
            state: Mutex::new(QueueState {
                ready: VecDeque::new(),
                loaded_at: None,
                evicted: evicted_rx,
            }),
        }
    }

    /// Bring locks and tenant decisions back from the journal. Must run
    /// before the first acquire.
    pub async fn recover(&self) -> RecoveryReport {
        let Some(ref journal) = self.journal else {
            return RecoveryReport {
                clean_shutdown: true,
                ..RecoveryReport::default()
            };
        };

        let snapshot = journal.load().await;
        let report = RecoveryReport {
            locks: self.locks.restore(snapshot.locks),
            decisions: self.cache.restore(snapshot.decisions, Utc::now()),
            clean_shutdown: snapshot.clean_shutdown,
        };
        // Expired decisions were evicted during restore.
        self.forget_evicted(&mut *self.state.lock().await).await;

        if report.clean_shutdown {
            info!(
                locks = report.locks,
                decisions = report.decisions,
                "Recovered scheduler state"
            );
        } else {
            warn!(
                locks = report.locks,
                decisions = report.decisions,
                "Recovered scheduler state after an unclean shutdown"
            );
        }
        report
    }

    /// Lock and return up to `n` admitted mailboxes.
    ///
    /// May return fewer (including none). Reloads the ready queue at most
    /// once per call.
    pub async fn acquire_up_to(&self, n: usize) -> Vec<Lease> {
        self.acquire_at(n, Utc::now()).await
    }

    pub(crate) async fn acquire_at(&self, n: usize, now: DateTime<Utc>) -> Vec<Lease> {
        let mut acquired = Vec::new();
        if n == 0 {
            return acquired;
        }

        let mut state = self.state.lock().await;
        self.cache.purge_expired(now);
        self.forget_evicted(&mut state).await;

        let mut reloaded = false;
        while acquired.len() < n {
            if !reloaded && state.needs_reload(self.config.queue_lifetime) {
                self.reload(&mut state, now).await;
                reloaded = true;
            }
            let Some(mailbox) = state.ready.pop_front() else {
                break;
            };

            if !self.admit(&mut state, &mailbox, now).await {
                continue;
            }
            match self.locks.try_lock(&mailbox, now).await {
                Ok(LockAttempt::Locked(lock)) => acquired.push(Lease { mailbox, lock }),
                Ok(LockAttempt::Busy | LockAttempt::Duplicate) => {}
                Err(e) => warn!(mailbox_id = mailbox.mailbox_id, "Failed to lock mailbox: {e}"),
            }
        }

        if !acquired.is_empty() {
            debug!(requested = n, acquired = acquired.len(), "Acquired mailboxes");
        }
        acquired
    }

    /// Release a mailbox after its poll finished. Returns false if the
    /// lease no longer holds the lock (already released, or reclaimed by
    /// the watchdog and possibly locked again since).
    pub async fn release(&self, lease: &Lease) -> bool {
        self.locks.release(&lease.lock, Some(Utc::now())).await
    }

    /// Release every lock this process holds. Used at shutdown; nothing is
    /// recorded as checked.
    pub async fn release_all(&self) -> usize {
        let records = self.locks.records();
        let released = join_all(
            records
                .iter()
                .map(|record| self.locks.release(record, None)),
        )
        .await;
        let count = released.into_iter().filter(|r| *r).count();
        if count > 0 {
            info!(count, "Released all mailbox locks");
        }
        count
    }

    /// Force-release locks older than the watchdog timeout.
    pub async fn reclaim_stale(&self, now: DateTime<Utc>) -> Vec<MailboxId> {
        self.locks
            .reclaim_stale(self.config.watchdog_timeout, now)
            .await
    }

    pub async fn stats(&self) -> SchedulerStats {
        let state = self.state.lock().await;
        SchedulerStats {
            queued: state.ready.len(),
            locked: self.locks.len(),
            cached_tenants: self.cache.len(),
            queue_age: state.loaded_at.map(|at| at.elapsed()),
        }
    }

    pub fn locks(&self) -> &Arc<LockStore> {
        &self.locks
    }

    async fn reload(&self, state: &mut QueueState, now: DateTime<Utc>) {
        let query = QueueQuery {
            now,
            limit: self.config.max_items_limit,
            active_checked_before: now - to_chrono(self.config.active_interval),
            inactive_checked_before: now - to_chrono(self.config.inactive_interval),
        };
        match self.repository.load_queue(query).await {
            Ok(mailboxes) => {
                debug!(count = mailboxes.len(), "Loaded ready queue");
                state.ready = mailboxes.into();
                state.loaded_at = Some(Instant::now());
            }
            Err(e) => {
                // Retried on the next acquire.
                error!("Failed to load ready queue: {e}");
                state.ready.clear();
                state.loaded_at = None;
            }
        }
    }

    async fn forget_evicted(&self, state: &mut QueueState) {
        while let Ok(tenant) = state.evicted.try_recv() {
            if let Some(ref journal) = self.journal {
                journal.remove_decision(tenant).await;
            }
        }
    }

    async fn tariff(&self, tenant: TenantId, now: DateTime<Utc>) -> TariffState {
        if let Some(decision) = self.cache.get(tenant, now) {
            return decision.tariff;
        }
        let tariff = self.billing.tariff_state(tenant).await;
        let decision = self.cache.put(tenant, tariff, now);
        if let Some(ref journal) = self.journal {
            journal.upsert_decision(tenant, &decision).await;
        }
        debug!(tenant, %tariff, "Cached tenant decision");
        tariff
    }

    /// Run both admission layers for a popped mailbox and apply the outcome.
    async fn admit(
        &self,
        state: &mut QueueState,
        mailbox: &MailboxDescriptor,
        now: DateTime<Utc>,
    ) -> bool {
        let tariff = self.tariff(mailbox.tenant, now).await;
        let admission = match tariff.admission(now, &self.config) {
            Admission::Proceed => self.gate.check(mailbox, now).await,
            other => other,
        };

        match admission {
            Admission::Proceed => {
                if mailbox.quota_error
                    && let Err(e) = self
                        .repository
                        .set_quota_error(mailbox.mailbox_id, false)
                        .await
                {
                    warn!(mailbox_id = mailbox.mailbox_id, "Failed to clear quota error: {e}");
                }
                true
            }
            Admission::Defer {
                until,
                scope,
                reason,
            } => {
                if reason == DeferReason::QuotaExhausted {
                    self.quota_exhausted(mailbox).await;
                }
                self.defer(state, mailbox, until, scope, reason).await;
                false
            }
            Admission::Disable { scope, reason } => {
                self.disable(state, mailbox, scope, reason).await;
                false
            }
        }
    }

    async fn defer(
        &self,
        state: &mut QueueState,
        mailbox: &MailboxDescriptor,
        until: DateTime<Utc>,
        scope: Scope,
        reason: DeferReason,
    ) {
        let result = match scope {
            Scope::Tenant => {
                state.purge_tenant(mailbox.tenant);
                self.repository
                    .defer_tenant_mailboxes(mailbox.tenant, until)
                    .await
                    .map(|_| ())
            }
            Scope::Mailbox => self.repository.defer_mailbox(mailbox.mailbox_id, until).await,
        };
        match result {
            Ok(()) => info!(
                mailbox_id = mailbox.mailbox_id,
                tenant = mailbox.tenant,
                ?scope,
                ?reason,
                %until,
                "Deferred mailbox"
            ),
            Err(e) => warn!(
                mailbox_id = mailbox.mailbox_id,
                tenant = mailbox.tenant,
                "Failed to defer: {e}"
            ),
        }
    }

    async fn disable(
        &self,
        state: &mut QueueState,
        mailbox: &MailboxDescriptor,
        scope: Scope,
        reason: DisableReason,
    ) {
        let disabled = match scope {
            Scope::Tenant => {
                state.purge_tenant(mailbox.tenant);
                self.repository.disable_tenant_mailboxes(mailbox.tenant).await
            }
            Scope::Mailbox => self
                .repository
                .disable_mailbox(mailbox.mailbox_id)
                .await
                .map(|()| 1),
        };
        let disabled = match disabled {
            Ok(count) => count,
            Err(e) => {
                warn!(
                    mailbox_id = mailbox.mailbox_id,
                    tenant = mailbox.tenant,
                    "Failed to disable: {e}"
                );
                return;
            }
        };
        warn!(
            mailbox_id = mailbox.mailbox_id,
            tenant = mailbox.tenant,
            ?reason,
            disabled,
            "Disabled mailboxes"
        );

        // Disabled mailboxes never come back, so this fires once.
        if disabled > 0 {
            let alert = match reason {
                DisableReason::TenantLongDead => Alert {
                    kind: AlertKind::TenantLongDead,
                    tenant: mailbox.tenant,
                    user_id: None,
                    mailbox_id: None,
                },
                DisableReason::UserTerminated => Alert {
                    kind: AlertKind::UserTerminated,
                    tenant: mailbox.tenant,
                    user_id: Some(mailbox.user_id.clone()),
                    mailbox_id: Some(mailbox.mailbox_id),
                },
            };
            self.raise(alert).await;
        }
    }

    /// Flag the mailbox and alert on the transition into quota error.
    async fn quota_exhausted(&self, mailbox: &MailboxDescriptor) {
        if mailbox.quota_error {
            return;
        }
        if let Err(e) = self
            .repository
            .set_quota_error(mailbox.mailbox_id, true)
            .await
        {
            warn!(mailbox_id = mailbox.mailbox_id, "Failed to set quota error: {e}");
        }
        self.raise(Alert {
            kind: AlertKind::QuotaExhausted,
            tenant: mailbox.tenant,
            user_id: Some(mailbox.user_id.clone()),
            mailbox_id: Some(mailbox.mailbox_id),
        })
        .await;
    }

    async fn raise(&self, alert: Alert) {
        let kind = alert.kind;
        let tenant = alert.tenant;
        if let Err(e) = self.alerts.raise(alert).await {
            warn!(%kind, tenant, "Failed to raise alert: {e}");
        }
    }
}
