//! Tenant admission control.
//!
//! Two layers decide whether a queued mailbox may be polled:
//! - the tenant's tariff state (`Active`, `Overdue`, `LongDead`, `Unknown`),
//!   looked up once per caching period and kept in [`AdmissionCache`];
//! - for active tenants, a per-mailbox [`MailboxGate`] that checks the
//!   owning user and the tenant's storage quota.
//!
//! Both layers produce an [`Admission`] the scheduler switches on.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::collaborators::TenantDirectory;
use crate::config::AggregatorConfig;
use crate::mailbox::{MailboxDescriptor, TenantId};

/// Billing state of a tenant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TariffState {
    Active,
    /// Payment is late; polling is paused but the tenant keeps its mailboxes.
    Overdue,
    /// Tenant is gone for good; its mailboxes get disabled.
    LongDead,
    /// Billing could not be asked.
    Unknown,
}

impl fmt::Display for TariffState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Active => "active",
            Self::Overdue => "overdue",
            Self::LongDead => "long_dead",
            Self::Unknown => "unknown",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for TariffState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "overdue" => Ok(Self::Overdue),
            "long_dead" => Ok(Self::LongDead),
            "unknown" => Ok(Self::Unknown),
            other => Err(format!("unknown tariff state: {other}")),
        }
    }
}

/// Why a mailbox was pushed back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeferReason {
    TenantOverdue,
    BillingUnknown,
    QuotaExhausted,
    /// The directory could not be asked.
    LookupFailed,
}

/// Why a mailbox was taken out of rotation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisableReason {
    TenantLongDead,
    UserTerminated,
}

/// How far an outcome reaches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    Mailbox,
    Tenant,
}

/// Outcome of an admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Proceed,
    Defer {
        until: DateTime<Utc>,
        scope: Scope,
        reason: DeferReason,
    },
    Disable {
        scope: Scope,
        reason: DisableReason,
    },
}

impl TariffState {
    /// Tenant-level admission. `Unknown` is handled like `Overdue`.
    pub fn admission(self, now: DateTime<Utc>, config: &AggregatorConfig) -> Admission {
        let overdue_until = now + to_chrono(config.overdue_account_delay);
        match self {
            Self::Active => Admission::Proceed,
            Self::Overdue => Admission::Defer {
                until: overdue_until,
                scope: Scope::Tenant,
                reason: DeferReason::TenantOverdue,
            },
            Self::Unknown => Admission::Defer {
                until: overdue_until,
                scope: Scope::Tenant,
                reason: DeferReason::BillingUnknown,
            },
            Self::LongDead => Admission::Disable {
                scope: Scope::Tenant,
                reason: DisableReason::TenantLongDead,
            },
        }
    }
}

/// A cached tenant decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdmissionDecision {
    pub tariff: TariffState,
    pub expires_at: DateTime<Utc>,
}

impl AdmissionDecision {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

type EvictionCallback = Box<dyn Fn(TenantId) + Send + Sync>;

/// TTL map of tenant decisions.
///
/// Expired entries are never returned. Evicting one fires the eviction
/// callback so the journal copy can be dropped too.
pub struct AdmissionCache {
    ttl: Duration,
    entries: Mutex<HashMap<TenantId, AdmissionDecision>>,
    on_evict: Option<EvictionCallback>,
}

impl AdmissionCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
            on_evict: None,
        }
    }

    /// Register the callback fired for every evicted tenant.
    pub fn with_eviction_callback<F>(mut self, callback: F) -> Self
    where
        F: Fn(TenantId) + Send + Sync + 'static,
    {
        self.on_evict = Some(Box::new(callback));
        self
    }

    /// Look up an unexpired decision, evicting it if it has expired.
    pub fn get(&self, tenant: TenantId, now: DateTime<Utc>) -> Option<AdmissionDecision> {
        let evicted = {
            let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
            let expired = match entries.get(&tenant) {
                Some(decision) if !decision.is_expired(now) => return Some(*decision),
                Some(_) => true,
                None => false,
            };
            if expired {
                entries.remove(&tenant);
            }
            expired
        };
        if evicted {
            self.evicted(tenant);
        }
        None
    }

    /// Cache a fresh decision for the configured TTL and return it.
    pub fn put(&self, tenant: TenantId, tariff: TariffState, now: DateTime<Utc>) -> AdmissionDecision {
        let decision = AdmissionDecision {
            tariff,
            expires_at: now + to_chrono(self.ttl),
        };
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(tenant, decision);
        decision
    }

    /// Re-insert decisions read back from the journal. Expired ones are
    /// evicted immediately. Returns how many were kept.
    pub fn restore(
        &self,
        decisions: impl IntoIterator<Item = (TenantId, AdmissionDecision)>,
        now: DateTime<Utc>,
    ) -> usize {
        let mut expired = Vec::new();
        let mut kept = 0;
        {
            let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
            for (tenant, decision) in decisions {
                if decision.is_expired(now) {
                    expired.push(tenant);
                } else {
                    entries.insert(tenant, decision);
                    kept += 1;
                }
            }
        }
        for tenant in expired {
            self.evicted(tenant);
        }
        kept
    }

    /// Evict every expired entry. Returns the evicted tenants.
    pub fn purge_expired(&self, now: DateTime<Utc>) -> Vec<TenantId> {
        let expired: Vec<TenantId> = {
            let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
            let expired: Vec<TenantId> = entries
                .iter()
                .filter(|(_, d)| d.is_expired(now))
                .map(|(t, _)| *t)
                .collect();
            for tenant in &expired {
                entries.remove(tenant);
            }
            expired
        };
        for tenant in &expired {
            self.evicted(*tenant);
        }
        expired
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn evicted(&self, tenant: TenantId) {
        debug!(tenant, "Admission decision expired");
        if let Some(ref callback) = self.on_evict {
            callback(tenant);
        }
    }
}

/// Per-mailbox checks for mailboxes of active tenants.
pub struct MailboxGate {
    directory: Arc<dyn TenantDirectory>,
    config: AggregatorConfig,
}

impl MailboxGate {
    pub fn new(directory: Arc<dyn TenantDirectory>, config: AggregatorConfig) -> Self {
        Self { directory, config }
    }

    /// Check the owning user, then the tenant's storage quota.
    ///
    /// Directory failures defer the mailbox like an overdue tenant would.
    pub async fn check(&self, mailbox: &MailboxDescriptor, now: DateTime<Utc>) -> Admission {
        let lookup_failed = Admission::Defer {
            until: now + to_chrono(self.config.overdue_account_delay),
            scope: Scope::Mailbox,
            reason: DeferReason::LookupFailed,
        };

        match self
            .directory
            .is_user_terminated(mailbox.tenant, &mailbox.user_id)
            .await
        {
            Ok(true) => {
                return Admission::Disable {
                    scope: Scope::Mailbox,
                    reason: DisableReason::UserTerminated,
                };
            }
            Ok(false) => {}
            Err(e) => {
                warn!(
                    mailbox_id = mailbox.mailbox_id,
                    tenant = mailbox.tenant,
                    "User lookup failed: {e}"
                );
                return lookup_failed;
            }
        }

        match self.directory.is_quota_exhausted(mailbox.tenant).await {
            Ok(true) => Admission::Defer {
                until: now + to_chrono(self.config.quota_ended_delay),
                scope: Scope::Tenant,
                reason: DeferReason::QuotaExhausted,
            },
            Ok(false) => Admission::Proceed,
            Err(e) => {
                warn!(tenant = mailbox.tenant, "Quota lookup failed: {e}");
                lookup_failed
            }
        }
    }
}

pub(crate) fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::days(36_500))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::test_support::{FakeDirectory, descriptor};

    #[test]
    fn decision_is_a_miss_at_expiry() {
        let cache = AdmissionCache::new(Duration::from_secs(60));
        let t0 = Utc::now();
        cache.put(7, TariffState::Active, t0);

        assert_eq!(
            cache.get(7, t0 + chrono::Duration::seconds(59)).map(|d| d.tariff),
            Some(TariffState::Active)
        );
        assert!(cache.get(7, t0 + chrono::Duration::seconds(60)).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn eviction_fires_callback_once() {
        let evictions = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&evictions);
        let cache = AdmissionCache::new(Duration::from_secs(1))
            .with_eviction_callback(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        let t0 = Utc::now();
        cache.put(1, TariffState::Overdue, t0);
        cache.put(2, TariffState::Active, t0 + chrono::Duration::seconds(10));

        let later = t0 + chrono::Duration::seconds(5);
        assert_eq!(cache.purge_expired(later), vec![1]);
        assert!(cache.get(1, later).is_none());
        assert_eq!(evictions.load(Ordering::SeqCst), 1);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn restore_drops_expired_entries() {
        let cache = AdmissionCache::new(Duration::from_secs(60));
        let now = Utc::now();
        let kept = cache.restore(
            [
                (
                    1,
                    AdmissionDecision {
                        tariff: TariffState::Active,
                        expires_at: now + chrono::Duration::seconds(30),
                    },
                ),
                (
                    2,
                    AdmissionDecision {
                        tariff: TariffState::Overdue,
                        expires_at: now - chrono::Duration::seconds(1),
                    },
                ),
            ],
            now,
        );
        assert_eq!(kept, 1);
        assert!(cache.get(1, now).is_some());
        assert!(cache.get(2, now).is_none());
    }

    #[test]
    fn tariff_admission_table() {
        let config = AggregatorConfig::default();
        let now = Utc::now();
        assert_eq!(TariffState::Active.admission(now, &config), Admission::Proceed);
        assert!(matches!(
            TariffState::Unknown.admission(now, &config),
            Admission::Defer {
                scope: Scope::Tenant,
                reason: DeferReason::BillingUnknown,
                ..
            }
        ));
        assert!(matches!(
            TariffState::LongDead.admission(now, &config),
            Admission::Disable {
                scope: Scope::Tenant,
                reason: DisableReason::TenantLongDead
            }
        ));
    }

    #[test]
    fn tariff_round_trips_through_strings() {
        for state in [
            TariffState::Active,
            TariffState::Overdue,
            TariffState::LongDead,
            TariffState::Unknown,
        ] {
            assert_eq!(state.to_string().parse::<TariffState>(), Ok(state));
        }
    }

    #[tokio::test]
    async fn gate_checks_user_before_quota() {
        let directory = Arc::new(FakeDirectory::default());
        directory.terminate_user(1, "bob");
        directory.set_quota_exhausted(1, true);
        let gate = MailboxGate::new(directory.clone(), AggregatorConfig::default());

        let now = Utc::now();
        assert!(matches!(
            gate.check(&descriptor(10, 1, "bob"), now).await,
            Admission::Disable {
                reason: DisableReason::UserTerminated,
                ..
            }
        ));
        assert!(matches!(
            gate.check(&descriptor(11, 1, "alice"), now).await,
            Admission::Defer {
                reason: DeferReason::QuotaExhausted,
                ..
            }
        ));

        directory.set_quota_exhausted(1, false);
        assert_eq!(gate.check(&descriptor(11, 1, "alice"), now).await, Admission::Proceed);
    }

    #[tokio::test]
    async fn gate_defers_when_directory_fails() {
        let directory = Arc::new(FakeDirectory::default());
        directory.fail_lookups(true);
        let gate = MailboxGate::new(directory, AggregatorConfig::default());
        assert!(matches!(
            gate.check(&descriptor(1, 1, "u"), Utc::now()).await,
            Admission::Defer {
                reason: DeferReason::LookupFailed,
                ..
            }
        ));
    }
}
