//! Mailbox locks.
//!
//! The durable row lock in the mailbox store is authoritative. This process
//! keeps a read-through copy of the locks it holds (updated on every
//! mutation) and mirrors them into the crash-recovery journal.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::admission::to_chrono;
use crate::error::DatabaseError;
use crate::journal::Journal;
use crate::mailbox::{LockRecord, MailboxDescriptor, MailboxId};
use crate::store::MailboxRepository;

/// Result of a lock attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockAttempt {
    Locked(LockRecord),
    /// Somebody else holds the row lock.
    Busy,
    /// This process already holds the lock; handing it out again would
    /// break exclusivity.
    Duplicate,
}

pub struct LockStore {
    repository: Arc<dyn MailboxRepository>,
    journal: Option<Arc<Journal>>,
    owner: Uuid,
    held: Mutex<HashMap<MailboxId, LockRecord>>,
}

impl LockStore {
    pub fn new(
        repository: Arc<dyn MailboxRepository>,
        journal: Option<Arc<Journal>>,
        owner: Uuid,
    ) -> Self {
        Self {
            repository,
            journal,
            owner,
            held: Mutex::new(HashMap::new()),
        }
    }

    /// Marker written into every lock this process takes.
    pub fn owner(&self) -> Uuid {
        self.owner
    }

    /// Take the lock for `mailbox` if nobody holds it.
    pub async fn try_lock(
        &self,
        mailbox: &MailboxDescriptor,
        now: DateTime<Utc>,
    ) -> Result<LockAttempt, DatabaseError> {
        if self.held().contains_key(&mailbox.mailbox_id) {
            error!(
                mailbox_id = mailbox.mailbox_id,
                "Mailbox is already locked by this process"
            );
            return Ok(LockAttempt::Duplicate);
        }

        let record = LockRecord::new(mailbox, now, self.owner);
        if !self.repository.lock_mailbox(&record).await? {
            debug!(mailbox_id = mailbox.mailbox_id, "Mailbox lock is busy");
            return Ok(LockAttempt::Busy);
        }

        {
            let mut held = self.held();
            if held.contains_key(&record.mailbox_id) {
                error!(
                    mailbox_id = record.mailbox_id,
                    "Row lock granted for a mailbox already held"
                );
                return Ok(LockAttempt::Duplicate);
            }
            held.insert(record.mailbox_id, record.clone());
        }

        if let Some(ref journal) = self.journal {
            journal.insert_lock(&record).await;
        }
        debug!(mailbox_id = record.mailbox_id, "Mailbox locked");
        Ok(LockAttempt::Locked(record))
    }

    /// Drop `lock` if this process still holds it. Returns false (and
    /// changes nothing) when the mailbox is not held or is held under a
    /// newer lock.
    pub async fn release(&self, lock: &LockRecord, checked_at: Option<DateTime<Utc>>) -> bool {
        let mailbox_id = lock.mailbox_id;
        {
            let mut held = self.held();
            match held.get(&mailbox_id).map(|current| current.same_lock(lock)) {
                Some(true) => {
                    held.remove(&mailbox_id);
                }
                Some(false) => {
                    info!(mailbox_id, "Release of a superseded lock; ignoring");
                    return false;
                }
                None => {
                    info!(mailbox_id, "Release of a mailbox that is not locked; ignoring");
                    return false;
                }
            }
        }

        match self.repository.unlock_mailbox(lock, checked_at).await {
            Ok(true) => {}
            Ok(false) => warn!(mailbox_id, "Row lock was no longer held under this lock"),
            // The row stays locked until the watchdog reclaims it.
            Err(e) => warn!(mailbox_id, "Failed to clear row lock: {e}"),
        }
        if let Some(ref journal) = self.journal {
            journal.remove_lock(lock).await;
        }
        true
    }

    /// Reclaim every lock older than `timeout`, whether held here or left
    /// behind by another (possibly dead) process. Returns the reclaimed ids.
    pub async fn reclaim_stale(&self, timeout: Duration, now: DateTime<Utc>) -> Vec<MailboxId> {
        let cutoff = now - to_chrono(timeout);

        let mut stale: BTreeSet<MailboxId> = match self.repository.stale_locks(cutoff).await {
            Ok(ids) => ids.into_iter().collect(),
            Err(e) => {
                warn!("Failed to scan for stale locks: {e}");
                BTreeSet::new()
            }
        };
        stale.extend(
            self.held()
                .values()
                .filter(|r| r.is_stale(now, timeout))
                .map(|r| r.mailbox_id),
        );

        let mut reclaimed = Vec::with_capacity(stale.len());
        for mailbox_id in stale {
            let record = {
                let mut held = self.held();
                if held
                    .get(&mailbox_id)
                    .is_some_and(|r| !r.is_stale(now, timeout))
                {
                    continue;
                }
                held.remove(&mailbox_id)
            };

            let cleared = match self.repository.reclaim_lock(mailbox_id, cutoff).await {
                Ok(cleared) => cleared,
                Err(e) => {
                    warn!(mailbox_id, "Failed to reclaim row lock: {e}");
                    false
                }
            };
            match record {
                Some(record) => {
                    warn!(
                        mailbox_id,
                        owner = %record.owner,
                        locked_at = %record.locked_at,
                        "Reclaiming stale lock"
                    );
                    if let Some(ref journal) = self.journal {
                        journal.remove_lock(&record).await;
                    }
                }
                None if cleared => {
                    warn!(mailbox_id, "Reclaimed stale lock left by another process")
                }
                None => continue,
            }
            reclaimed.push(mailbox_id);
        }
        reclaimed
    }

    /// Rebuild the held set from journal records. The row locks are still
    /// taken in the store, so nothing is written.
    pub fn restore(&self, records: impl IntoIterator<Item = LockRecord>) -> usize {
        let mut held = self.held();
        let mut restored = 0;
        for record in records {
            if held.insert(record.mailbox_id, record).is_none() {
                restored += 1;
            }
        }
        restored
    }

    pub fn is_locked(&self, mailbox_id: MailboxId) -> bool {
        self.held().contains_key(&mailbox_id)
    }

    /// Snapshot of every lock held by this process.
    pub fn records(&self) -> Vec<LockRecord> {
        let mut records: Vec<LockRecord> = self.held().values().cloned().collect();
        records.sort_by_key(|r| r.mailbox_id);
        records
    }

    pub fn len(&self) -> usize {
        self.held().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn held(&self) -> MutexGuard<'_, HashMap<MailboxId, LockRecord>> {
        self.held.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
