//! In-memory collaborators for unit tests.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::admission::TariffState;
use crate::collaborators::{
    Alert, AlertSink, BillingService, MailboxHandler, TenantDirectory, UnreadSink,
};
use crate::error::{CollaboratorError, DatabaseError, PollError};
use crate::mailbox::{LockRecord, MailboxDescriptor, MailboxId, NotificationTarget, TenantId};
use crate::store::{MailboxRepository, QueueQuery};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

pub fn descriptor(mailbox_id: MailboxId, tenant: TenantId, user_id: &str) -> MailboxDescriptor {
    MailboxDescriptor {
        mailbox_id,
        tenant,
        user_id: user_id.to_string(),
        address: format!("{user_id}-{mailbox_id}@example.com"),
        is_active: false,
        date_checked: None,
        date_user_checked: None,
        quota_error: false,
        date_auth_error: None,
    }
}

// ── Repository ──────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct FakeRow {
    mailbox: MailboxDescriptor,
    enabled: bool,
    locked: Option<LockRecord>,
    next_attempt_at: Option<DateTime<Utc>>,
}

#[derive(Default)]
pub struct FakeRepository {
    rows: Mutex<Vec<FakeRow>>,
    loads: AtomicUsize,
    unlocks: AtomicUsize,
}

impl FakeRepository {
    pub fn with_mailboxes(mailboxes: impl IntoIterator<Item = MailboxDescriptor>) -> Self {
        let repository = Self::default();
        for mailbox in mailboxes {
            repository.add(mailbox);
        }
        repository
    }

    pub fn add(&self, mailbox: MailboxDescriptor) {
        lock(&self.rows).push(FakeRow {
            mailbox,
            enabled: true,
            locked: None,
            next_attempt_at: None,
        });
    }

    pub fn is_row_locked(&self, mailbox_id: MailboxId) -> bool {
        self.row(mailbox_id).is_some_and(|r| r.locked.is_some())
    }

    pub fn is_enabled(&self, mailbox_id: MailboxId) -> bool {
        self.row(mailbox_id).is_some_and(|r| r.enabled)
    }

    pub fn next_attempt_at(&self, mailbox_id: MailboxId) -> Option<DateTime<Utc>> {
        self.row(mailbox_id).and_then(|r| r.next_attempt_at)
    }

    pub fn mailbox(&self, mailbox_id: MailboxId) -> Option<MailboxDescriptor> {
        self.row(mailbox_id).map(|r| r.mailbox)
    }

    pub fn load_calls(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    pub fn unlock_calls(&self) -> usize {
        self.unlocks.load(Ordering::SeqCst)
    }

    fn row(&self, mailbox_id: MailboxId) -> Option<FakeRow> {
        lock(&self.rows)
            .iter()
            .find(|r| r.mailbox.mailbox_id == mailbox_id)
            .cloned()
    }

    fn update<F>(&self, mailbox_id: MailboxId, f: F) -> Result<(), DatabaseError>
    where
        F: FnOnce(&mut FakeRow),
    {
        let mut rows = lock(&self.rows);
        let row = rows
            .iter_mut()
            .find(|r| r.mailbox.mailbox_id == mailbox_id)
            .ok_or_else(|| DatabaseError::NotFound {
                entity: "mailbox".to_string(),
                id: mailbox_id.to_string(),
            })?;
        f(row);
        Ok(())
    }

    fn update_tenant<F>(&self, tenant: TenantId, f: F) -> u64
    where
        F: Fn(&mut FakeRow),
    {
        let mut changed = 0;
        for row in lock(&self.rows)
            .iter_mut()
            .filter(|r| r.mailbox.tenant == tenant)
        {
            f(row);
            changed += 1;
        }
        changed
    }
}

#[async_trait]
impl MailboxRepository for FakeRepository {
    async fn load_queue(&self, query: QueueQuery) -> Result<Vec<MailboxDescriptor>, DatabaseError> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        Ok(lock(&self.rows)
            .iter()
            .filter(|r| r.enabled && r.locked.is_none())
            .filter(|r| r.next_attempt_at.is_none_or(|at| at <= query.now))
            .map(|r| r.mailbox.clone())
            .take(query.limit)
            .collect())
    }

    async fn lock_mailbox(&self, lock: &LockRecord) -> Result<bool, DatabaseError> {
        let mut taken = false;
        self.update(lock.mailbox_id, |row| {
            if row.locked.is_none() {
                row.locked = Some(lock.clone());
                taken = true;
            }
        })?;
        Ok(taken)
    }

    async fn unlock_mailbox(
        &self,
        lock: &LockRecord,
        checked_at: Option<DateTime<Utc>>,
    ) -> Result<bool, DatabaseError> {
        self.unlocks.fetch_add(1, Ordering::SeqCst);
        let mut cleared = false;
        self.update(lock.mailbox_id, |row| {
            if row.locked.as_ref().is_some_and(|held| held.same_lock(lock)) {
                row.locked = None;
                if checked_at.is_some() {
                    row.mailbox.date_checked = checked_at;
                }
                cleared = true;
            }
        })?;
        Ok(cleared)
    }

    async fn reclaim_lock(
        &self,
        mailbox_id: MailboxId,
        cutoff: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let mut cleared = false;
        self.update(mailbox_id, |row| {
            if row.locked.as_ref().is_some_and(|held| held.locked_at <= cutoff) {
                row.locked = None;
                cleared = true;
            }
        })?;
        Ok(cleared)
    }

    async fn stale_locks(&self, cutoff: DateTime<Utc>) -> Result<Vec<MailboxId>, DatabaseError> {
        Ok(lock(&self.rows)
            .iter()
            .filter(|r| r.locked.as_ref().is_some_and(|held| held.locked_at <= cutoff))
            .map(|r| r.mailbox.mailbox_id)
            .collect())
    }

    async fn disable_mailbox(&self, mailbox_id: MailboxId) -> Result<(), DatabaseError> {
        self.update(mailbox_id, |row| row.enabled = false)
    }

    async fn disable_tenant_mailboxes(&self, tenant: TenantId) -> Result<u64, DatabaseError> {
        Ok(self.update_tenant(tenant, |row| row.enabled = false))
    }

    async fn defer_mailbox(
        &self,
        mailbox_id: MailboxId,
        until: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        self.update(mailbox_id, |row| row.next_attempt_at = Some(until))
    }

    async fn defer_tenant_mailboxes(
        &self,
        tenant: TenantId,
        until: DateTime<Utc>,
    ) -> Result<u64, DatabaseError> {
        Ok(self.update_tenant(tenant, |row| row.next_attempt_at = Some(until)))
    }

    async fn set_quota_error(
        &self,
        mailbox_id: MailboxId,
        value: bool,
    ) -> Result<(), DatabaseError> {
        self.update(mailbox_id, |row| row.mailbox.quota_error = value)
    }

    async fn set_auth_error(
        &self,
        mailbox_id: MailboxId,
        at: Option<DateTime<Utc>>,
    ) -> Result<(), DatabaseError> {
        self.update(mailbox_id, |row| row.mailbox.date_auth_error = at)
    }
}

// ── Billing / directory / alerts ────────────────────────────────────

#[derive(Default)]
pub struct FakeBilling {
    states: Mutex<HashMap<TenantId, TariffState>>,
    calls: AtomicUsize,
}

impl FakeBilling {
    pub fn set(&self, tenant: TenantId, state: TariffState) {
        lock(&self.states).insert(tenant, state);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BillingService for FakeBilling {
    async fn tariff_state(&self, tenant: TenantId) -> TariffState {
        self.calls.fetch_add(1, Ordering::SeqCst);
        lock(&self.states)
            .get(&tenant)
            .copied()
            .unwrap_or(TariffState::Active)
    }
}

#[derive(Default)]
pub struct FakeDirectory {
    terminated: Mutex<HashSet<(TenantId, String)>>,
    exhausted: Mutex<HashSet<TenantId>>,
    failing: Mutex<bool>,
}

impl FakeDirectory {
    pub fn terminate_user(&self, tenant: TenantId, user_id: &str) {
        lock(&self.terminated).insert((tenant, user_id.to_string()));
    }

    pub fn set_quota_exhausted(&self, tenant: TenantId, exhausted: bool) {
        let mut set = lock(&self.exhausted);
        if exhausted {
            set.insert(tenant);
        } else {
            set.remove(&tenant);
        }
    }

    pub fn fail_lookups(&self, fail: bool) {
        *lock(&self.failing) = fail;
    }

    fn check_available(&self) -> Result<(), CollaboratorError> {
        if *lock(&self.failing) {
            return Err(CollaboratorError::Unavailable {
                name: "directory".to_string(),
                reason: "test failure".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl TenantDirectory for FakeDirectory {
    async fn is_quota_exhausted(&self, tenant: TenantId) -> Result<bool, CollaboratorError> {
        self.check_available()?;
        Ok(lock(&self.exhausted).contains(&tenant))
    }

    async fn is_user_terminated(
        &self,
        tenant: TenantId,
        user_id: &str,
    ) -> Result<bool, CollaboratorError> {
        self.check_available()?;
        Ok(lock(&self.terminated).contains(&(tenant, user_id.to_string())))
    }
}

#[derive(Default)]
pub struct RecordingAlerts {
    alerts: Mutex<Vec<Alert>>,
}

impl RecordingAlerts {
    pub fn alerts(&self) -> Vec<Alert> {
        lock(&self.alerts).clone()
    }
}

#[async_trait]
impl AlertSink for RecordingAlerts {
    async fn raise(&self, alert: Alert) -> Result<(), CollaboratorError> {
        lock(&self.alerts).push(alert);
        Ok(())
    }
}

// ── Handler / unread sink ───────────────────────────────────────────

/// Scripted outcome of one poll.
#[derive(Debug, Clone, Copy)]
pub enum PollScript {
    NewMessages(u32),
    AuthFailure,
    /// The mail server refuses the connection.
    Unreachable,
    /// Never finishes on its own.
    Hang,
    Panic,
}

pub struct FakeHandler {
    delay: Duration,
    scripts: Mutex<HashMap<MailboxId, PollScript>>,
    polled: Mutex<Vec<MailboxId>>,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl FakeHandler {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            scripts: Mutex::new(HashMap::new()),
            polled: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    pub fn script(&self, mailbox_id: MailboxId, script: PollScript) {
        lock(&self.scripts).insert(mailbox_id, script);
    }

    pub fn polled(&self) -> Vec<MailboxId> {
        lock(&self.polled).clone()
    }

    /// Highest number of polls observed running at once.
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl MailboxHandler for FakeHandler {
    async fn poll_mailbox(&self, mailbox: &MailboxDescriptor) -> Result<u32, PollError> {
        lock(&self.polled).push(mailbox.mailbox_id);
        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(running, Ordering::SeqCst);
        let _guard = InFlight(&self.in_flight);

        let script = lock(&self.scripts)
            .get(&mailbox.mailbox_id)
            .copied()
            .unwrap_or(PollScript::NewMessages(0));
        match script {
            PollScript::Hang => std::future::pending().await,
            PollScript::Panic => panic!("scripted poll panic"),
            PollScript::AuthFailure => {
                tokio::time::sleep(self.delay).await;
                Err(PollError::AuthFailed {
                    address: mailbox.address.clone(),
                    reason: "bad password".to_string(),
                })
            }
            PollScript::Unreachable => {
                tokio::time::sleep(self.delay).await;
                Err(PollError::Connection {
                    host: "mail.example.com".to_string(),
                    reason: "connection refused".to_string(),
                })
            }
            PollScript::NewMessages(n) => {
                tokio::time::sleep(self.delay).await;
                Ok(n)
            }
        }
    }
}

#[derive(Default)]
pub struct RecordingUnreadSink {
    counts: Mutex<HashMap<NotificationTarget, u32>>,
    pushes: Mutex<Vec<(NotificationTarget, u32)>>,
    failing: Mutex<bool>,
}

impl RecordingUnreadSink {
    pub fn set_count(&self, target: NotificationTarget, count: u32) {
        lock(&self.counts).insert(target, count);
    }

    pub fn fail_pushes(&self, fail: bool) {
        *lock(&self.failing) = fail;
    }

    pub fn pushes(&self) -> Vec<(NotificationTarget, u32)> {
        lock(&self.pushes).clone()
    }
}

#[async_trait]
impl UnreadSink for RecordingUnreadSink {
    async fn unread_count(&self, target: &NotificationTarget) -> Result<u32, CollaboratorError> {
        Ok(lock(&self.counts).get(target).copied().unwrap_or(0))
    }

    async fn push_unread_count(
        &self,
        target: &NotificationTarget,
        count: u32,
    ) -> Result<(), CollaboratorError> {
        if *lock(&self.failing) {
            return Err(CollaboratorError::Unavailable {
                name: "push".to_string(),
                reason: "test failure".to_string(),
            });
        }
        lock(&self.pushes).push((target.clone(), count));
        Ok(())
    }
}
