//! `MailboxRepository`: the durable side of queue loading and locking.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use crate::error::DatabaseError;
use crate::mailbox::{LockRecord, MailboxDescriptor, MailboxId, TenantId};

/// Parameters of one ready-queue load.
#[derive(Debug, Clone, Copy)]
pub struct QueueQuery {
    pub now: DateTime<Utc>,
    pub limit: usize,
    /// Active mailboxes checked after this are skipped.
    pub active_checked_before: DateTime<Utc>,
    /// Inactive mailboxes checked after this are skipped; user checks after
    /// this make a mailbox active.
    pub inactive_checked_before: DateTime<Utc>,
}

/// Mailbox source and durable row lock.
///
/// The row lock is the source of truth for "being processed": it is
/// independent of any process and must be re-checkable after a restart.
#[async_trait]
pub trait MailboxRepository: Send + Sync {
    /// Load due, enabled, unlocked mailboxes. Active mailboxes come first,
    /// then the least recently checked.
    async fn load_queue(&self, query: QueueQuery) -> Result<Vec<MailboxDescriptor>, DatabaseError>;

    /// Take the row lock described by `lock` if nobody holds it. Returns
    /// whether it was taken.
    async fn lock_mailbox(&self, lock: &LockRecord) -> Result<bool, DatabaseError>;

    /// Clear the row lock, but only while it is still this exact `lock`.
    /// `checked_at` records a finished check; shutdown releases pass `None`.
    /// Returns whether the row was cleared.
    async fn unlock_mailbox(
        &self,
        lock: &LockRecord,
        checked_at: Option<DateTime<Utc>>,
    ) -> Result<bool, DatabaseError>;

    /// Force-clear a row lock taken at or before `cutoff`, whoever holds it.
    /// Returns whether the row was cleared.
    async fn reclaim_lock(
        &self,
        mailbox_id: MailboxId,
        cutoff: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;

    /// Mailboxes whose row lock was taken at or before `cutoff`.
    async fn stale_locks(&self, cutoff: DateTime<Utc>) -> Result<Vec<MailboxId>, DatabaseError>;

    async fn disable_mailbox(&self, mailbox_id: MailboxId) -> Result<(), DatabaseError>;

    /// Disable every mailbox of the tenant. Returns how many changed.
    async fn disable_tenant_mailboxes(&self, tenant: TenantId) -> Result<u64, DatabaseError>;

    async fn defer_mailbox(
        &self,
        mailbox_id: MailboxId,
        until: DateTime<Utc>,
    ) -> Result<(), DatabaseError>;

    /// Push the next attempt of every mailbox of the tenant.
    async fn defer_tenant_mailboxes(
        &self,
        tenant: TenantId,
        until: DateTime<Utc>,
    ) -> Result<u64, DatabaseError>;

    async fn set_quota_error(&self, mailbox_id: MailboxId, value: bool)
    -> Result<(), DatabaseError>;

    async fn set_auth_error(
        &self,
        mailbox_id: MailboxId,
        at: Option<DateTime<Utc>>,
    ) -> Result<(), DatabaseError>;
}
