//! Contracts of the services the aggregator drives but does not implement.
//!
//! Protocol clients, billing, the tenant directory, tenant-facing alerts
//! and the unread-count push are all pluggable. The mailbox store contract
//! lives in [`crate::store::MailboxRepository`].

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::admission::TariffState;
use crate::error::{CollaboratorError, PollError};
use crate::mailbox::{MailboxDescriptor, MailboxId, NotificationTarget, TenantId};

/// Protocol client (IMAP/POP3) entry point.
#[async_trait]
pub trait MailboxHandler: Send + Sync {
    /// Fetch and persist new messages, returning how many arrived.
    ///
    /// The worker pool abandons a poll that runs past
    /// `AggregatorConfig::tcp_timeout`.
    async fn poll_mailbox(&self, mailbox: &MailboxDescriptor) -> Result<u32, PollError>;
}

/// Billing service.
#[async_trait]
pub trait BillingService: Send + Sync {
    /// Current tariff state. Lookup failures are reported as `Unknown`.
    async fn tariff_state(&self, tenant: TenantId) -> TariffState;
}

/// Tenant/user directory and storage quota.
#[async_trait]
pub trait TenantDirectory: Send + Sync {
    async fn is_quota_exhausted(&self, tenant: TenantId) -> Result<bool, CollaboratorError>;

    /// True when the user was terminated or removed.
    async fn is_user_terminated(
        &self,
        tenant: TenantId,
        user_id: &str,
    ) -> Result<bool, CollaboratorError>;
}

/// Kinds of tenant-facing alerts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    QuotaExhausted,
    TenantLongDead,
    UserTerminated,
}

impl fmt::Display for AlertKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::QuotaExhausted => "quota_exhausted",
            Self::TenantLongDead => "tenant_long_dead",
            Self::UserTerminated => "user_terminated",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for AlertKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "quota_exhausted" => Ok(Self::QuotaExhausted),
            "tenant_long_dead" => Ok(Self::TenantLongDead),
            "user_terminated" => Ok(Self::UserTerminated),
            other => Err(format!("unknown alert kind: {other}")),
        }
    }
}

/// A tenant-facing alert raised by admission control.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Alert {
    pub kind: AlertKind,
    pub tenant: TenantId,
    pub user_id: Option<String>,
    pub mailbox_id: Option<MailboxId>,
}

/// Where alerts go.
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn raise(&self, alert: Alert) -> Result<(), CollaboratorError>;
}

/// Unread-count computation and push for one user.
///
/// Whether the count is per folder or aggregated across folders is the
/// sink's decision.
#[async_trait]
pub trait UnreadSink: Send + Sync {
    async fn unread_count(&self, target: &NotificationTarget) -> Result<u32, CollaboratorError>;

    async fn push_unread_count(
        &self,
        target: &NotificationTarget,
        count: u32,
    ) -> Result<(), CollaboratorError>;
}
