//! Crash-recovery journal.
//!
//! A local libSQL file mirroring the locks this process holds and the tenant
//! decisions it has cached. It is read back once at startup so the in-memory
//! lock set and admission cache are rebuilt before any new scheduling.
//!
//! Every mutating write is bracketed by a `dirty` marker. A journal found
//! dirty at startup was interrupted mid-write and refuses to open. Any other
//! read or write failure deletes and recreates the file: a damaged journal
//! only costs recovery information, it never blocks scheduling.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use libsql::params::Params;
use libsql::{Connection, Value, params};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::admission::AdmissionDecision;
use crate::error::JournalError;
use crate::mailbox::{LockRecord, TenantId};

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS locked_mailboxes (
        mailbox_id INTEGER PRIMARY KEY,
        tenant INTEGER NOT NULL,
        user_id TEXT NOT NULL,
        address TEXT NOT NULL,
        locked_at INTEGER NOT NULL,
        owner TEXT NOT NULL,
        lock_id TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS tenant_decisions (
        tenant INTEGER PRIMARY KEY,
        decision TEXT NOT NULL,
        expires_at INTEGER NOT NULL
    );

    CREATE TABLE IF NOT EXISTS journal_state (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL
    );
"#;

const DIRTY: &str = "dirty";
const CLEAN_SHUTDOWN: &str = "clean_shutdown";

/// Everything the journal held at startup.
#[derive(Debug, Default, Clone)]
pub struct JournalSnapshot {
    pub locks: Vec<LockRecord>,
    pub decisions: Vec<(TenantId, AdmissionDecision)>,
    /// Whether the previous process shut down in order.
    pub clean_shutdown: bool,
}

struct Handle {
    // Keeps the database alive for the connection.
    _db: libsql::Database,
    conn: Connection,
}

/// Durable mirror of in-flight locks and cached decisions.
pub struct Journal {
    path: PathBuf,
    handle: Mutex<Handle>,
}

impl Journal {
    /// Open (or create) the journal at `path`.
    ///
    /// Fails with [`JournalError::UncleanShutdown`] when the previous process
    /// died in the middle of a journal write. A journal that cannot be read
    /// at all is recreated empty.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, JournalError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }

        let handle = match connect(&path).await {
            Ok(handle) => match read_state(&handle.conn, DIRTY).await {
                Ok(Some(flag)) if flag == "1" => {
                    return Err(JournalError::UncleanShutdown { path });
                }
                Ok(_) => handle,
                Err(e) => {
                    error!(path = %path.display(), "Journal unreadable, recreating: {e}");
                    drop(handle);
                    recreate_file(&path).await?
                }
            },
            Err(e) => {
                error!(path = %path.display(), "Failed to open journal, recreating: {e}");
                recreate_file(&path).await?
            }
        };

        info!(path = %path.display(), "Journal opened");
        Ok(Self {
            path,
            handle: Mutex::new(handle),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read back every lock and decision. On failure the journal is
    /// recreated and an empty snapshot returned.
    ///
    /// Also clears the clean-shutdown flag for the current run.
    pub async fn load(&self) -> JournalSnapshot {
        let mut handle = self.handle.lock().await;
        match read_snapshot(&handle.conn).await {
            Ok(snapshot) => {
                if let Err(e) = write_state(&handle.conn, CLEAN_SHUTDOWN, "0").await {
                    warn!("Failed to reset clean-shutdown flag: {e}");
                }
                info!(
                    locks = snapshot.locks.len(),
                    decisions = snapshot.decisions.len(),
                    clean_shutdown = snapshot.clean_shutdown,
                    "Journal loaded"
                );
                snapshot
            }
            Err(e) => {
                error!("Journal load failed, starting from an empty journal: {e}");
                self.reset(&mut handle).await;
                JournalSnapshot::default()
            }
        }
    }

    /// Record a freshly taken lock.
    pub async fn insert_lock(&self, record: &LockRecord) {
        self.write(
            "insert_lock",
            "INSERT OR REPLACE INTO locked_mailboxes (mailbox_id, tenant, user_id, address, locked_at, owner, lock_id) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            vec![
                Value::Integer(record.mailbox_id),
                Value::Integer(record.tenant),
                Value::Text(record.user_id.clone()),
                Value::Text(record.address.clone()),
                Value::Integer(record.locked_at.timestamp_millis()),
                Value::Text(record.owner.to_string()),
                Value::Text(record.lock_id.to_string()),
            ],
        )
        .await;
    }

    /// Forget `record`. A newer lock on the same mailbox is left alone.
    pub async fn remove_lock(&self, record: &LockRecord) {
        self.write(
            "remove_lock",
            "DELETE FROM locked_mailboxes WHERE mailbox_id = ?1 AND lock_id = ?2",
            vec![
                Value::Integer(record.mailbox_id),
                Value::Text(record.lock_id.to_string()),
            ],
        )
        .await;
    }

    pub async fn upsert_decision(&self, tenant: TenantId, decision: &AdmissionDecision) {
        let json = match serde_json::to_string(decision) {
            Ok(json) => json,
            Err(e) => {
                error!(tenant, "Failed to serialize admission decision: {e}");
                return;
            }
        };
        self.write(
            "upsert_decision",
            "INSERT OR REPLACE INTO tenant_decisions (tenant, decision, expires_at) VALUES (?1, ?2, ?3)",
            vec![
                Value::Integer(tenant),
                Value::Text(json),
                Value::Integer(decision.expires_at.timestamp_millis()),
            ],
        )
        .await;
    }

    pub async fn remove_decision(&self, tenant: TenantId) {
        self.write(
            "remove_decision",
            "DELETE FROM tenant_decisions WHERE tenant = ?1",
            vec![Value::Integer(tenant)],
        )
        .await;
    }

    /// Mark the journal as cleanly closed.
    pub async fn close(&self) {
        let handle = self.handle.lock().await;
        match write_state(&handle.conn, CLEAN_SHUTDOWN, "1").await {
            Ok(()) => info!(path = %self.path.display(), "Journal closed"),
            Err(e) => warn!("Failed to mark journal closed: {e}"),
        }
    }

    /// Run one mutating statement under the dirty marker.
    async fn write(&self, op: &'static str, sql: &'static str, values: Vec<Value>) {
        let mut handle = self.handle.lock().await;
        match bracketed_write(&handle.conn, sql, values).await {
            Ok(()) => debug!(op, "Journal write"),
            Err(e) => {
                error!(op, "Journal write failed, recreating journal: {e}");
                self.reset(&mut handle).await;
            }
        }
    }

    async fn reset(&self, handle: &mut Handle) {
        match recreate_file(&self.path).await {
            Ok(fresh) => *handle = fresh,
            Err(e) => error!(path = %self.path.display(), "Failed to recreate journal: {e}"),
        }
    }
}

async fn connect(path: &Path) -> Result<Handle, JournalError> {
    let db = libsql::Builder::new_local(path)
        .build()
        .await
        .map_err(|e| JournalError::Open {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
    let conn = db.connect().map_err(|e| JournalError::Open {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    conn.execute_batch(SCHEMA).await?;
    Ok(Handle { _db: db, conn })
}

/// Delete the journal file (and its sidecars) and start over.
async fn recreate_file(path: &Path) -> Result<Handle, JournalError> {
    for suffix in ["", "-wal", "-shm", "-journal"] {
        let mut candidate = path.as_os_str().to_owned();
        candidate.push(suffix);
        match tokio::fs::remove_file(&candidate).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
    }
    let handle = connect(path).await?;
    warn!(path = %path.display(), "Journal recreated empty");
    Ok(handle)
}

async fn bracketed_write(
    conn: &Connection,
    sql: &str,
    values: Vec<Value>,
) -> Result<(), JournalError> {
    write_state(conn, DIRTY, "1").await?;
    conn.execute(sql, Params::Positional(values)).await?;
    write_state(conn, DIRTY, "0").await
}

async fn read_state(conn: &Connection, key: &str) -> Result<Option<String>, JournalError> {
    let mut rows = conn
        .query("SELECT value FROM journal_state WHERE key = ?1", params![key])
        .await?;
    match rows.next().await? {
        Some(row) => Ok(Some(row.get::<String>(0)?)),
        None => Ok(None),
    }
}

async fn write_state(conn: &Connection, key: &str, value: &str) -> Result<(), JournalError> {
    conn.execute(
        "INSERT OR REPLACE INTO journal_state (key, value) VALUES (?1, ?2)",
        params![key, value],
    )
    .await?;
    Ok(())
}

async fn read_snapshot(conn: &Connection) -> Result<JournalSnapshot, JournalError> {
    let mut snapshot = JournalSnapshot {
        clean_shutdown: read_state(conn, CLEAN_SHUTDOWN).await?.as_deref() == Some("1"),
        ..Default::default()
    };

    let mut rows = conn
        .query(
            "SELECT mailbox_id, tenant, user_id, address, locked_at, owner, lock_id FROM locked_mailboxes ORDER BY locked_at",
            (),
        )
        .await?;
    while let Some(row) = rows.next().await? {
        let owner: String = row.get(5)?;
        let lock_id: String = row.get(6)?;
        snapshot.locks.push(LockRecord {
            mailbox_id: row.get(0)?,
            tenant: row.get(1)?,
            user_id: row.get(2)?,
            address: row.get(3)?,
            locked_at: millis_to_datetime(row.get(4)?)?,
            owner: Uuid::parse_str(&owner)
                .map_err(|e| JournalError::Corrupt(format!("lock owner {owner}: {e}")))?,
            lock_id: Uuid::parse_str(&lock_id)
                .map_err(|e| JournalError::Corrupt(format!("lock id {lock_id}: {e}")))?,
        });
    }

    let mut rows = conn
        .query("SELECT tenant, decision FROM tenant_decisions", ())
        .await?;
    while let Some(row) = rows.next().await? {
        let tenant: TenantId = row.get(0)?;
        let json: String = row.get(1)?;
        let decision: AdmissionDecision = serde_json::from_str(&json)
            .map_err(|e| JournalError::Corrupt(format!("decision for tenant {tenant}: {e}")))?;
        snapshot.decisions.push((tenant, decision));
    }

    Ok(snapshot)
}

fn millis_to_datetime(millis: i64) -> Result<DateTime<Utc>, JournalError> {
    DateTime::from_timestamp_millis(millis)
        .ok_or_else(|| JournalError::Corrupt(format!("timestamp out of range: {millis}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::TariffState;
    use crate::mailbox::MailboxId;

    fn record(mailbox_id: MailboxId) -> LockRecord {
        LockRecord {
            mailbox_id,
            tenant: 1,
            user_id: "user".into(),
            address: format!("box{mailbox_id}@example.com"),
            locked_at: DateTime::from_timestamp_millis(Utc::now().timestamp_millis()).unwrap(),
            owner: Uuid::new_v4(),
            lock_id: Uuid::new_v4(),
        }
    }

    #[tokio::test]
    async fn locks_survive_reopen() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("dump.db");

        let journal = Journal::open(&path).await.unwrap();
        let (a, b, c) = (record(1), record(2), record(3));
        journal.insert_lock(&a).await;
        journal.insert_lock(&b).await;
        journal.insert_lock(&c).await;
        journal.remove_lock(&b).await;
        // A stale record for the same mailbox does not remove the live one.
        journal
            .remove_lock(&LockRecord {
                lock_id: Uuid::new_v4(),
                ..c.clone()
            })
            .await;
        drop(journal);

        let journal = Journal::open(&path).await.unwrap();
        let snapshot = journal.load().await;
        assert_eq!(snapshot.locks.len(), 2);
        assert!(snapshot.locks.contains(&a));
        assert!(snapshot.locks.contains(&c));
        assert!(!snapshot.clean_shutdown);
    }

    #[tokio::test]
    async fn decisions_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("dump.db");
        let journal = Journal::open(&path).await.unwrap();

        let decision = AdmissionDecision {
            tariff: TariffState::Overdue,
            expires_at: DateTime::from_timestamp_millis(1_900_000_000_000).unwrap(),
        };
        journal.upsert_decision(42, &decision).await;
        journal.upsert_decision(43, &decision).await;
        journal.remove_decision(43).await;

        let snapshot = journal.load().await;
        assert_eq!(snapshot.decisions, vec![(42, decision)]);
    }

    #[tokio::test]
    async fn close_marks_clean_shutdown() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("dump.db");
        let journal = Journal::open(&path).await.unwrap();
        journal.close().await;
        drop(journal);

        let journal = Journal::open(&path).await.unwrap();
        assert!(journal.load().await.clean_shutdown);
        // The flag is reset for the new run.
        assert!(!journal.load().await.clean_shutdown);
    }

    #[tokio::test]
    async fn dirty_marker_refuses_to_open() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("dump.db");
        {
            let journal = Journal::open(&path).await.unwrap();
            let handle = journal.handle.lock().await;
            write_state(&handle.conn, DIRTY, "1").await.unwrap();
        }

        let err = Journal::open(&path).await.err().unwrap();
        assert!(matches!(err, JournalError::UncleanShutdown { .. }));
    }

    #[tokio::test]
    async fn corrupt_file_is_recreated() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("dump.db");
        std::fs::write(&path, b"definitely not a database file, just noise").unwrap();

        let journal = Journal::open(&path).await.unwrap();
        let snapshot = journal.load().await;
        assert!(snapshot.locks.is_empty());

        journal.insert_lock(&record(9)).await;
        assert_eq!(journal.load().await.locks.len(), 1);
    }

    #[tokio::test]
    async fn corrupt_entry_resets_journal() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("dump.db");
        let journal = Journal::open(&path).await.unwrap();
        journal.insert_lock(&record(1)).await;
        {
            let handle = journal.handle.lock().await;
            handle
                .conn
                .execute(
                    "INSERT INTO tenant_decisions (tenant, decision, expires_at) VALUES (1, 'garbage', 0)",
                    (),
                )
                .await
                .unwrap();
        }

        let snapshot = journal.load().await;
        assert!(snapshot.locks.is_empty());
        assert!(snapshot.decisions.is_empty());
        assert!(journal.load().await.locks.is_empty());
    }
}
