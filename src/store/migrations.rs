//! Mailbox store schema, versioned in the `_migrations` table.

use chrono::Utc;
use libsql::{Connection, params};
use tracing::{debug, info};

use crate::error::DatabaseError;

struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "initial_schema",
        sql: r#"
            CREATE TABLE IF NOT EXISTS tenants (
                id INTEGER PRIMARY KEY,
                tariff TEXT NOT NULL DEFAULT 'active',
                quota_exhausted INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS users (
                tenant INTEGER NOT NULL,
                id TEXT NOT NULL,
                terminated INTEGER NOT NULL DEFAULT 0,
                removed INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (tenant, id)
            );

            CREATE TABLE IF NOT EXISTS mailboxes (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                tenant INTEGER NOT NULL,
                user_id TEXT NOT NULL,
                address TEXT NOT NULL,
                enabled INTEGER NOT NULL DEFAULT 1,
                is_removed INTEGER NOT NULL DEFAULT 0,
                is_processed INTEGER NOT NULL DEFAULT 0,
                locked_at INTEGER,
                lock_owner TEXT,
                date_checked INTEGER,
                date_user_checked INTEGER,
                next_attempt_at INTEGER,
                quota_error INTEGER NOT NULL DEFAULT 0,
                date_auth_error INTEGER
            );
            CREATE INDEX IF NOT EXISTS idx_mailboxes_tenant ON mailboxes(tenant);
            CREATE INDEX IF NOT EXISTS idx_mailboxes_processed ON mailboxes(is_processed, locked_at);
            CREATE INDEX IF NOT EXISTS idx_mailboxes_checked ON mailboxes(date_checked);
        "#,
    },
    Migration {
        version: 2,
        name: "tenant_alerts",
        sql: r#"
            CREATE TABLE IF NOT EXISTS alerts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                tenant INTEGER NOT NULL,
                user_id TEXT,
                mailbox_id INTEGER,
                kind TEXT NOT NULL,
                created_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_alerts_tenant ON alerts(tenant);
        "#,
    },
    Migration {
        version: 3,
        name: "per_acquisition_lock_id",
        sql: "ALTER TABLE mailboxes ADD COLUMN lock_id TEXT;",
    },
];

fn migration_err(step: &str) -> impl FnOnce(libsql::Error) -> DatabaseError + '_ {
    move |e| DatabaseError::Migration(format!("{step}: {e}"))
}

/// Bring the schema up to the newest version. Safe to call on every start.
pub async fn run_migrations(conn: &Connection) -> Result<(), DatabaseError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at INTEGER NOT NULL
        )",
    )
    .await
    .map_err(migration_err("create _migrations"))?;

    let applied = schema_version(conn).await?;
    let pending: Vec<&Migration> = MIGRATIONS.iter().filter(|m| m.version > applied).collect();
    if pending.is_empty() {
        debug!(version = applied, "Mailbox schema is current");
        return Ok(());
    }

    for migration in pending {
        let step = format!("V{} {}", migration.version, migration.name);
        conn.execute_batch(migration.sql)
            .await
            .map_err(migration_err(&step))?;
        conn.execute(
            "INSERT OR IGNORE INTO _migrations (version, name, applied_at) VALUES (?1, ?2, ?3)",
            params![
                migration.version,
                migration.name,
                Utc::now().timestamp_millis()
            ],
        )
        .await
        .map_err(migration_err(&step))?;
        info!(version = migration.version, name = migration.name, "Applied mailbox schema migration");
    }
    Ok(())
}

/// Highest applied version; 0 on a fresh database.
async fn schema_version(conn: &Connection) -> Result<i64, DatabaseError> {
    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM _migrations", ())
        .await
        .map_err(migration_err("read schema version"))?;
    match rows.next().await.map_err(migration_err("read schema version"))? {
        Some(row) => row.get(0).map_err(migration_err("read schema version")),
        None => Ok(0),
    }
}
