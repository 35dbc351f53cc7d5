//! libSQL backend: mailbox store, billing, directory and alerts.
//!
//! Supports local file and in-memory databases. Timestamps are stored as
//! Unix milliseconds.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::admission::TariffState;
use crate::collaborators::{Alert, AlertSink, BillingService, TenantDirectory};
use crate::error::{CollaboratorError, DatabaseError};
use crate::mailbox::{LockRecord, MailboxDescriptor, MailboxId, TenantId};
use crate::store::migrations;
use crate::store::traits::{MailboxRepository, QueueQuery};

/// libSQL mailbox store.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlStore {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

/// A mailbox to register.
#[derive(Debug, Clone)]
pub struct NewMailbox {
    pub tenant: TenantId,
    pub user_id: String,
    pub address: String,
}

/// An alert as persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredAlert {
    pub id: i64,
    pub alert: Alert,
    pub created_at: DateTime<Utc>,
}

impl LibSqlStore {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let store = Self {
            db: Arc::new(db),
            conn,
        };
        migrations::run_migrations(&store.conn).await?;
        info!(path = %path.display(), "Mailbox store opened");
        Ok(store)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let store = Self {
            db: Arc::new(db),
            conn,
        };
        migrations::run_migrations(&store.conn).await?;
        Ok(store)
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }

    async fn lookup_tariff(&self, tenant: TenantId) -> Result<Option<String>, libsql::Error> {
        let mut rows = self
            .conn()
            .query("SELECT tariff FROM tenants WHERE id = ?1", params![tenant])
            .await?;
        match rows.next().await? {
            Some(row) => Ok(Some(row.get::<String>(0)?)),
            None => Ok(None),
        }
    }

    // ── Administration ──────────────────────────────────────────────

    /// Create or update a tenant.
    pub async fn upsert_tenant(
        &self,
        tenant: TenantId,
        tariff: TariffState,
        quota_exhausted: bool,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO tenants (id, tariff, quota_exhausted) VALUES (?1, ?2, ?3)
                 ON CONFLICT(id) DO UPDATE SET tariff = excluded.tariff, quota_exhausted = excluded.quota_exhausted",
                params![tenant, tariff.to_string(), quota_exhausted as i64],
            )
            .await
            .map_err(query_err)?;
        Ok(())
    }

    /// Create or update a user.
    pub async fn upsert_user(
        &self,
        tenant: TenantId,
        user_id: &str,
        terminated: bool,
        removed: bool,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO users (tenant, id, terminated, removed) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(tenant, id) DO UPDATE SET terminated = excluded.terminated, removed = excluded.removed",
                params![tenant, user_id, terminated as i64, removed as i64],
            )
            .await
            .map_err(query_err)?;
        Ok(())
    }

    /// Register a mailbox. Returns its id.
    pub async fn insert_mailbox(&self, mailbox: &NewMailbox) -> Result<MailboxId, DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO mailboxes (tenant, user_id, address) VALUES (?1, ?2, ?3)",
                params![mailbox.tenant, mailbox.user_id.clone(), mailbox.address.clone()],
            )
            .await
            .map_err(query_err)?;
        Ok(self.conn().last_insert_rowid())
    }

    /// Manual re-enable of a disabled mailbox.
    pub async fn enable_mailbox(&self, mailbox_id: MailboxId) -> Result<(), DatabaseError> {
        let changed = self
            .conn()
            .execute(
                "UPDATE mailboxes SET enabled = 1, next_attempt_at = NULL WHERE id = ?1",
                params![mailbox_id],
            )
            .await
            .map_err(query_err)?;
        if changed == 0 {
            return Err(DatabaseError::NotFound {
                entity: "mailbox".to_string(),
                id: mailbox_id.to_string(),
            });
        }
        info!(mailbox_id, "Mailbox re-enabled");
        Ok(())
    }

    /// Record that the owning user looked at the mailbox.
    pub async fn touch_user_checked(
        &self,
        mailbox_id: MailboxId,
        at: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE mailboxes SET date_user_checked = ?2 WHERE id = ?1",
                params![mailbox_id, at.timestamp_millis()],
            )
            .await
            .map_err(query_err)?;
        Ok(())
    }

    /// Current state of one mailbox, regardless of lock or schedule.
    pub async fn get_mailbox(
        &self,
        mailbox_id: MailboxId,
    ) -> Result<Option<MailboxRow>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT id, tenant, user_id, address, enabled, is_processed, locked_at, lock_owner, date_checked, next_attempt_at, quota_error, date_auth_error
                 FROM mailboxes WHERE id = ?1",
                params![mailbox_id],
            )
            .await
            .map_err(query_err)?;

        match rows.next().await.map_err(query_err)? {
            Some(row) => Ok(Some(row_to_mailbox_row(&row).map_err(query_err)?)),
            None => Ok(None),
        }
    }

    /// Alerts raised for a tenant, oldest first.
    pub async fn list_alerts(&self, tenant: TenantId) -> Result<Vec<StoredAlert>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT id, tenant, user_id, mailbox_id, kind, created_at FROM alerts WHERE tenant = ?1 ORDER BY id",
                params![tenant],
            )
            .await
            .map_err(query_err)?;

        let mut alerts = Vec::new();
        while let Some(row) = rows.next().await.map_err(query_err)? {
            let kind: String = row.get(4).map_err(query_err)?;
            alerts.push(StoredAlert {
                id: row.get(0).map_err(query_err)?,
                alert: Alert {
                    kind: kind.parse().map_err(DatabaseError::Serialization)?,
                    tenant: row.get(1).map_err(query_err)?,
                    user_id: row.get::<String>(2).ok(),
                    mailbox_id: row.get::<i64>(3).ok(),
                },
                created_at: millis_to_datetime(row.get(5).map_err(query_err)?),
            });
        }
        Ok(alerts)
    }
}

/// Full state of one mailbox row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailboxRow {
    pub mailbox_id: MailboxId,
    pub tenant: TenantId,
    pub user_id: String,
    pub address: String,
    pub enabled: bool,
    pub is_processed: bool,
    pub locked_at: Option<DateTime<Utc>>,
    pub lock_owner: Option<Uuid>,
    pub date_checked: Option<DateTime<Utc>>,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub quota_error: bool,
    pub date_auth_error: Option<DateTime<Utc>>,
}

// ── Helper functions ────────────────────────────────────────────────

fn query_err(e: libsql::Error) -> DatabaseError {
    DatabaseError::Query(e.to_string())
}

fn millis_to_datetime(millis: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(millis).unwrap_or(DateTime::<Utc>::MIN_UTC)
}

fn optional_datetime(row: &libsql::Row, idx: i32) -> Option<DateTime<Utc>> {
    row.get::<i64>(idx).ok().map(millis_to_datetime)
}

fn opt_millis(at: Option<DateTime<Utc>>) -> libsql::Value {
    match at {
        Some(at) => libsql::Value::Integer(at.timestamp_millis()),
        None => libsql::Value::Null,
    }
}

/// Column order matches `QUEUE_COLUMNS`.
fn row_to_descriptor(row: &libsql::Row) -> Result<MailboxDescriptor, libsql::Error> {
    Ok(MailboxDescriptor {
        mailbox_id: row.get(0)?,
        tenant: row.get(1)?,
        user_id: row.get(2)?,
        address: row.get(3)?,
        date_checked: optional_datetime(row, 4),
        date_user_checked: optional_datetime(row, 5),
        quota_error: row.get::<i64>(6)? != 0,
        date_auth_error: optional_datetime(row, 7),
        is_active: row.get::<i64>(8)? != 0,
    })
}

fn row_to_mailbox_row(row: &libsql::Row) -> Result<MailboxRow, libsql::Error> {
    Ok(MailboxRow {
        mailbox_id: row.get(0)?,
        tenant: row.get(1)?,
        user_id: row.get(2)?,
        address: row.get(3)?,
        enabled: row.get::<i64>(4)? != 0,
        is_processed: row.get::<i64>(5)? != 0,
        locked_at: optional_datetime(row, 6),
        lock_owner: row
            .get::<String>(7)
            .ok()
            .and_then(|s| Uuid::parse_str(&s).ok()),
        date_checked: optional_datetime(row, 8),
        next_attempt_at: optional_datetime(row, 9),
        quota_error: row.get::<i64>(10)? != 0,
        date_auth_error: optional_datetime(row, 11),
    })
}

const QUEUE_COLUMNS: &str = "id, tenant, user_id, address, date_checked, date_user_checked, quota_error, date_auth_error, \
     (date_user_checked IS NOT NULL AND date_user_checked >= ?2) AS is_active";

// ── Trait implementations ───────────────────────────────────────────

#[async_trait]
impl MailboxRepository for LibSqlStore {
    async fn load_queue(&self, query: QueueQuery) -> Result<Vec<MailboxDescriptor>, DatabaseError> {
        let sql = format!(
            "SELECT {QUEUE_COLUMNS} FROM mailboxes
             WHERE enabled = 1 AND is_removed = 0 AND is_processed = 0
               AND (next_attempt_at IS NULL OR next_attempt_at <= ?1)
               AND (date_checked IS NULL
                    OR (date_user_checked >= ?2 AND date_checked <= ?3)
                    OR date_checked <= ?2)
             ORDER BY is_active DESC, date_checked IS NOT NULL, date_checked, id
             LIMIT ?4"
        );
        let mut rows = self
            .conn()
            .query(
                &sql,
                params![
                    query.now.timestamp_millis(),
                    query.inactive_checked_before.timestamp_millis(),
                    query.active_checked_before.timestamp_millis(),
                    query.limit as i64,
                ],
            )
            .await
            .map_err(query_err)?;

        let mut mailboxes = Vec::new();
        while let Some(row) = rows.next().await.map_err(query_err)? {
            mailboxes.push(row_to_descriptor(&row).map_err(query_err)?);
        }
        debug!(count = mailboxes.len(), "Loaded mailbox queue");
        Ok(mailboxes)
    }

    async fn lock_mailbox(&self, lock: &LockRecord) -> Result<bool, DatabaseError> {
        let changed = self
            .conn()
            .execute(
                "UPDATE mailboxes SET is_processed = 1, locked_at = ?2, lock_owner = ?3, lock_id = ?4
                 WHERE id = ?1 AND is_processed = 0",
                params![
                    lock.mailbox_id,
                    lock.locked_at.timestamp_millis(),
                    lock.owner.to_string(),
                    lock.lock_id.to_string(),
                ],
            )
            .await
            .map_err(query_err)?;
        Ok(changed == 1)
    }

    async fn unlock_mailbox(
        &self,
        lock: &LockRecord,
        checked_at: Option<DateTime<Utc>>,
    ) -> Result<bool, DatabaseError> {
        let changed = self
            .conn()
            .execute(
                "UPDATE mailboxes SET is_processed = 0, locked_at = NULL, lock_owner = NULL, lock_id = NULL,
                        date_checked = COALESCE(?2, date_checked)
                 WHERE id = ?1 AND is_processed = 1 AND lock_owner = ?3 AND lock_id = ?4",
                params![
                    lock.mailbox_id,
                    opt_millis(checked_at),
                    lock.owner.to_string(),
                    lock.lock_id.to_string(),
                ],
            )
            .await
            .map_err(query_err)?;
        Ok(changed == 1)
    }

    async fn reclaim_lock(
        &self,
        mailbox_id: MailboxId,
        cutoff: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let changed = self
            .conn()
            .execute(
                "UPDATE mailboxes SET is_processed = 0, locked_at = NULL, lock_owner = NULL, lock_id = NULL
                 WHERE id = ?1 AND is_processed = 1 AND locked_at <= ?2",
                params![mailbox_id, cutoff.timestamp_millis()],
            )
            .await
            .map_err(query_err)?;
        Ok(changed == 1)
    }

    async fn stale_locks(&self, cutoff: DateTime<Utc>) -> Result<Vec<MailboxId>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT id FROM mailboxes WHERE is_processed = 1 AND locked_at <= ?1 ORDER BY locked_at",
                params![cutoff.timestamp_millis()],
            )
            .await
            .map_err(query_err)?;

        let mut ids = Vec::new();
        while let Some(row) = rows.next().await.map_err(query_err)? {
            ids.push(row.get(0).map_err(query_err)?);
        }
        Ok(ids)
    }

    async fn disable_mailbox(&self, mailbox_id: MailboxId) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE mailboxes SET enabled = 0 WHERE id = ?1",
                params![mailbox_id],
            )
            .await
            .map_err(query_err)?;
        Ok(())
    }

    async fn disable_tenant_mailboxes(&self, tenant: TenantId) -> Result<u64, DatabaseError> {
        self.conn()
            .execute(
                "UPDATE mailboxes SET enabled = 0 WHERE tenant = ?1 AND enabled = 1",
                params![tenant],
            )
            .await
            .map_err(query_err)
    }

    async fn defer_mailbox(
        &self,
        mailbox_id: MailboxId,
        until: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE mailboxes SET next_attempt_at = ?2 WHERE id = ?1",
                params![mailbox_id, until.timestamp_millis()],
            )
            .await
            .map_err(query_err)?;
        Ok(())
    }

    async fn defer_tenant_mailboxes(
        &self,
        tenant: TenantId,
        until: DateTime<Utc>,
    ) -> Result<u64, DatabaseError> {
        self.conn()
            .execute(
                "UPDATE mailboxes SET next_attempt_at = ?2 WHERE tenant = ?1 AND enabled = 1",
                params![tenant, until.timestamp_millis()],
            )
            .await
            .map_err(query_err)
    }

    async fn set_quota_error(
        &self,
        mailbox_id: MailboxId,
        value: bool,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE mailboxes SET quota_error = ?2 WHERE id = ?1",
                params![mailbox_id, value as i64],
            )
            .await
            .map_err(query_err)?;
        Ok(())
    }

    async fn set_auth_error(
        &self,
        mailbox_id: MailboxId,
        at: Option<DateTime<Utc>>,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE mailboxes SET date_auth_error = ?2 WHERE id = ?1",
                params![mailbox_id, opt_millis(at)],
            )
            .await
            .map_err(query_err)?;
        Ok(())
    }
}

#[async_trait]
impl BillingService for LibSqlStore {
    async fn tariff_state(&self, tenant: TenantId) -> TariffState {
        let result = self.lookup_tariff(tenant).await;

        match result {
            Ok(Some(tariff)) => tariff.parse().unwrap_or_else(|e| {
                warn!(tenant, "Unrecognised tariff: {e}");
                TariffState::Unknown
            }),
            Ok(None) => {
                warn!(tenant, "Tenant has no billing record");
                TariffState::Unknown
            }
            Err(e) => {
                warn!(tenant, "Tariff lookup failed: {e}");
                TariffState::Unknown
            }
        }
    }
}

#[async_trait]
impl TenantDirectory for LibSqlStore {
    async fn is_quota_exhausted(&self, tenant: TenantId) -> Result<bool, CollaboratorError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT quota_exhausted FROM tenants WHERE id = ?1",
                params![tenant],
            )
            .await
            .map_err(query_err)?;
        match rows.next().await.map_err(query_err)? {
            Some(row) => Ok(row.get::<i64>(0).map_err(query_err)? != 0),
            None => Ok(false),
        }
    }

    async fn is_user_terminated(
        &self,
        tenant: TenantId,
        user_id: &str,
    ) -> Result<bool, CollaboratorError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT terminated, removed FROM users WHERE tenant = ?1 AND id = ?2",
                params![tenant, user_id],
            )
            .await
            .map_err(query_err)?;
        match rows.next().await.map_err(query_err)? {
            Some(row) => {
                let terminated = row.get::<i64>(0).map_err(query_err)? != 0;
                let removed = row.get::<i64>(1).map_err(query_err)? != 0;
                Ok(terminated || removed)
            }
            // Unknown users count as removed.
            None => Ok(true),
        }
    }
}

#[async_trait]
impl AlertSink for LibSqlStore {
    async fn raise(&self, alert: Alert) -> Result<(), CollaboratorError> {
        let user_id = match alert.user_id {
            Some(ref user_id) => libsql::Value::Text(user_id.clone()),
            None => libsql::Value::Null,
        };
        let mailbox_id = match alert.mailbox_id {
            Some(id) => libsql::Value::Integer(id),
            None => libsql::Value::Null,
        };
        self.conn()
            .execute(
                "INSERT INTO alerts (tenant, user_id, mailbox_id, kind, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    alert.tenant,
                    user_id,
                    mailbox_id,
                    alert.kind.to_string(),
                    Utc::now().timestamp_millis(),
                ],
            )
            .await
            .map_err(query_err)?;
        info!(tenant = alert.tenant, kind = %alert.kind, "Alert raised");
        Ok(())
    }
}
