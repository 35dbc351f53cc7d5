//! Mailbox identity and lock records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Mailbox identifier in the mailbox store.
pub type MailboxId = i64;

/// Tenant identifier.
pub type TenantId = i64;

/// Snapshot of a mailbox taken when the ready queue is loaded.
///
/// Owned by the scheduler while queued and handed to a worker once locked.
/// It is never written back; the store stays the source of truth.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MailboxDescriptor {
    pub mailbox_id: MailboxId,
    pub tenant: TenantId,
    pub user_id: String,
    pub address: String,
    /// The owning user checked mail recently.
    pub is_active: bool,
    pub date_checked: Option<DateTime<Utc>>,
    pub date_user_checked: Option<DateTime<Utc>>,
    /// Set while the tenant is known to be out of storage quota.
    pub quota_error: bool,
    pub date_auth_error: Option<DateTime<Utc>>,
}

impl MailboxDescriptor {
    /// Who gets notified about new mail in this mailbox.
    pub fn notification_target(&self) -> NotificationTarget {
        NotificationTarget {
            tenant: self.tenant,
            user_id: self.user_id.clone(),
        }
    }
}

/// One currently-locked mailbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    pub mailbox_id: MailboxId,
    pub tenant: TenantId,
    pub user_id: String,
    pub address: String,
    pub locked_at: DateTime<Utc>,
    /// Marker of the process that took the lock.
    pub owner: Uuid,
    /// Unique per acquisition. A later lock on the same mailbox gets a new
    /// one, so a late release of an older lock cannot clear it.
    pub lock_id: Uuid,
}

impl LockRecord {
    pub fn new(mailbox: &MailboxDescriptor, locked_at: DateTime<Utc>, owner: Uuid) -> Self {
        Self {
            mailbox_id: mailbox.mailbox_id,
            tenant: mailbox.tenant,
            user_id: mailbox.user_id.clone(),
            address: mailbox.address.clone(),
            // Stored with millisecond precision.
            locked_at: DateTime::from_timestamp_millis(locked_at.timestamp_millis())
                .unwrap_or(locked_at),
            owner,
            lock_id: Uuid::new_v4(),
        }
    }

    /// Whether `other` is this very acquisition.
    pub fn same_lock(&self, other: &LockRecord) -> bool {
        self.mailbox_id == other.mailbox_id && self.lock_id == other.lock_id
    }

    /// Whether the lock has been held for at least `timeout` at `now`.
    pub fn is_stale(&self, now: DateTime<Utc>, timeout: std::time::Duration) -> bool {
        match chrono::Duration::from_std(timeout) {
            Ok(timeout) => now - self.locked_at >= timeout,
            Err(_) => false,
        }
    }
}

/// A locked mailbox handed to a worker, together with the lock it holds.
///
/// Releasing a lease clears exactly that lock. If the watchdog reclaimed it
/// and the mailbox was locked again, the release changes nothing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub mailbox: MailboxDescriptor,
    pub lock: LockRecord,
}

impl Lease {
    pub fn mailbox_id(&self) -> MailboxId {
        self.mailbox.mailbox_id
    }
}

/// Recipient of an unread-count notification.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NotificationTarget {
    pub tenant: TenantId,
    pub user_id: String,
}
