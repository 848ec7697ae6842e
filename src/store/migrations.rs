//! Version-tracked database migrations for the libSQL backend.
//!
//! Each migration has a version number and SQL. `run_migrations()` checks
//! the current version and applies only the new ones sequentially.

use libsql::Connection;

use crate::error::DatabaseError;

struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

/// All migrations in order. Add new versions to the end.
static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "supplier_directory",
        sql: r#"
            CREATE TABLE IF NOT EXISTS suppliers (
                email_domain TEXT PRIMARY KEY,
                supplier_id TEXT NOT NULL,
                supplier_name TEXT,
                supplier_type TEXT NOT NULL,
                ap_routing_code TEXT NOT NULL,
                default_currency TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_suppliers_supplier_id ON suppliers(supplier_id);
        "#,
    },
    Migration {
        version: 2,
        name: "processing_records",
        sql: r#"
            CREATE TABLE IF NOT EXISTS processing_records (
                message_id TEXT NOT NULL,
                attempt INTEGER NOT NULL,
                final_stage TEXT NOT NULL,
                outcome TEXT NOT NULL,
                record TEXT NOT NULL,
                created_at TEXT NOT NULL,
                PRIMARY KEY (message_id, attempt)
            );
            CREATE INDEX IF NOT EXISTS idx_processing_records_outcome
                ON processing_records(outcome);
        "#,
    },
    Migration {
        version: 3,
        name: "work_queue",
        sql: r#"
            CREATE TABLE IF NOT EXISTS work_queue (
                id TEXT PRIMARY KEY,
                body TEXT NOT NULL,
                receive_count INTEGER NOT NULL DEFAULT 0,
                status TEXT NOT NULL DEFAULT 'ready',
                visible_at TEXT NOT NULL,
                enqueued_at TEXT NOT NULL,
                dead_lettered_at TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_work_queue_ready
                ON work_queue(status, visible_at);
        "#,
    },
];

/// Apply every migration newer than the recorded version.
pub async fn run_migrations(conn: &Connection) -> Result<(), DatabaseError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        (),
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("Failed to create _migrations table: {e}")))?;

    let current_version = get_current_version(conn).await?;

    for migration in MIGRATIONS {
        if migration.version > current_version {
            tracing::info!(
                version = migration.version,
                name = migration.name,
                "Applying migration"
            );
            conn.execute_batch(migration.sql).await.map_err(|e| {
                DatabaseError::Migration(format!(
                    "Migration V{} ({}) failed: {e}",
                    migration.version, migration.name
                ))
            })?;
            seed_version(conn, migration.version, migration.name).await?;
        }
    }

    Ok(())
}

/// Highest applied migration version, or 0 if none.
async fn get_current_version(conn: &Connection) -> Result<i64, DatabaseError> {
    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM _migrations", ())
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to query migration version: {e}")))?;

    let row = rows
        .next()
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to read migration version: {e}")))?;

    match row {
        Some(row) => row.get::<i64>(0).map_err(|e| {
            DatabaseError::Migration(format!("Failed to parse migration version: {e}"))
        }),
        None => Ok(0),
    }
}

async fn seed_version(conn: &Connection, version: i64, name: &str) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT OR IGNORE INTO _migrations (version, name) VALUES (?1, ?2)",
        libsql::params![version, name],
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("Failed to record migration V{version}: {e}")))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_conn() -> Connection {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .unwrap();
        db.connect().unwrap()
    }

    async fn table_exists(conn: &Connection, table: &str) -> bool {
        let mut rows = conn
            .query(
                "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name=?1",
                libsql::params![table],
            )
            .await
            .unwrap();
        let row = rows.next().await.unwrap().unwrap();
        row.get::<i64>(0).unwrap() == 1
    }

    #[tokio::test]
    async fn migrations_create_all_tables() {
        let conn = test_conn().await;
        run_migrations(&conn).await.unwrap();
        for table in ["suppliers", "processing_records", "work_queue", "_migrations"] {
            assert!(table_exists(&conn, table).await, "missing table {table}");
        }
        assert_eq!(get_current_version(&conn).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn migrations_are_idempotent() {
        let conn = test_conn().await;
        run_migrations(&conn).await.unwrap();
        run_migrations(&conn).await.unwrap();
        assert_eq!(get_current_version(&conn).await.unwrap(), 3);
    }
}
