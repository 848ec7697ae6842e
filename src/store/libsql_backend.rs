//! libSQL backend: supplier directory, audit log and work queue.
//!
//! Supports local file and in-memory databases. A single connection is
//! reused for all operations; `libsql::Connection` is `Send + Sync`.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::DEFAULT_MAX_ATTEMPTS;
use crate::error::{DatabaseError, QueueError};
use crate::pipeline::types::{ProcessingRecord, RoutingCode, SupplierRecord, SupplierType};
use crate::store::migrations;
use crate::store::traits::{AuditStore, QueueEntry, SupplierDirectory, WorkQueue};

/// Queue substrate policy.
#[derive(Debug, Clone, Copy)]
pub struct QueueSettings {
    /// Receives after which an entry is moved to the dead-letter state.
    pub max_receives: u32,
    /// How long a received entry stays hidden from other receivers.
    pub visibility_timeout: Duration,
    /// Delay before a released entry becomes visible again.
    pub release_delay: Duration,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            max_receives: DEFAULT_MAX_ATTEMPTS,
            visibility_timeout: Duration::from_secs(900),
            release_delay: Duration::ZERO,
        }
    }
}

/// Directory row as loaded from a JSON seed file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupplierSeed {
    pub email_domain: String,
    pub supplier_id: String,
    pub supplier_name: Option<String>,
    pub supplier_type: String,
    pub ap_routing_code: String,
    #[serde(default)]
    pub default_currency: Option<String>,
}

/// A queue entry the substrate gave up on.
#[derive(Debug, Clone)]
pub struct DeadLetter {
    pub id: String,
    pub body: String,
    pub receive_count: u32,
    pub enqueued_at: DateTime<Utc>,
    pub dead_lettered_at: Option<DateTime<Utc>>,
}

/// libSQL database backend.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
    queue: QueueSettings,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let backend = Self::from_database(db).await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;
        Self::from_database(db).await
    }

    async fn from_database(db: LibSqlDatabase) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;
        migrations::run_migrations(&conn).await?;
        Ok(Self {
            db: Arc::new(db),
            conn,
            queue: QueueSettings::default(),
        })
    }

    pub fn with_queue_settings(mut self, settings: QueueSettings) -> Self {
        self.queue = settings;
        self
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }

    // ── Supplier administration ─────────────────────────────────────

    /// Insert or replace a directory entry.
    pub async fn upsert_supplier(
        &self,
        email_domain: &str,
        record: &SupplierRecord,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT OR REPLACE INTO suppliers
                    (email_domain, supplier_id, supplier_name, supplier_type, ap_routing_code, default_currency)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    email_domain.trim().to_lowercase(),
                    record.supplier_id.as_str(),
                    opt_text(record.supplier_name.as_deref()),
                    record.supplier_type.as_str(),
                    record.routing_code.as_str(),
                    opt_text(record.default_currency.as_deref()),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("upsert_supplier: {e}")))?;
        debug!(email_domain, supplier_id = %record.supplier_id, "Supplier upserted");
        Ok(())
    }

    /// Load a batch of seed rows. Returns how many were written.
    pub async fn load_suppliers(&self, seeds: &[SupplierSeed]) -> Result<usize, DatabaseError> {
        for seed in seeds {
            let record = SupplierRecord {
                supplier_id: seed.supplier_id.clone(),
                supplier_name: seed.supplier_name.clone(),
                supplier_type: seed
                    .supplier_type
                    .parse()
                    .map_err(DatabaseError::Serialization)?,
                routing_code: seed
                    .ap_routing_code
                    .parse()
                    .map_err(DatabaseError::Serialization)?,
                default_currency: seed.default_currency.clone(),
                unknown_vendor: false,
            };
            self.upsert_supplier(&seed.email_domain, &record).await?;
        }
        info!(count = seeds.len(), "Suppliers loaded");
        Ok(seeds.len())
    }

    // ── Queue administration ────────────────────────────────────────

    /// Add a new entry to the work queue. Returns its id.
    pub async fn enqueue(&self, body: &str) -> Result<String, DatabaseError> {
        let id = Uuid::new_v4().to_string();
        let now = timestamp(Utc::now());
        self.conn()
            .execute(
                "INSERT INTO work_queue (id, body, receive_count, status, visible_at, enqueued_at)
                 VALUES (?1, ?2, 0, 'ready', ?3, ?3)",
                params![id.clone(), body, now],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("enqueue: {e}")))?;
        debug!(id = %id, "Queue entry enqueued");
        Ok(id)
    }

    /// Entries moved to the dead-letter state, oldest first.
    pub async fn dead_letters(&self) -> Result<Vec<DeadLetter>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT id, body, receive_count, enqueued_at, dead_lettered_at
                 FROM work_queue WHERE status = 'dead' ORDER BY enqueued_at ASC",
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("dead_letters: {e}")))?;

        let mut entries = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("dead_letters: {e}")))?
        {
            let enqueued: String = row
                .get(3)
                .map_err(|e| DatabaseError::Query(format!("row parse: {e}")))?;
            let dead_lettered: Option<String> = row.get(4).ok();
            entries.push(DeadLetter {
                id: row
                    .get(0)
                    .map_err(|e| DatabaseError::Query(format!("row parse: {e}")))?,
                body: row
                    .get(1)
                    .map_err(|e| DatabaseError::Query(format!("row parse: {e}")))?,
                receive_count: row.get::<i64>(2).unwrap_or(0).max(0) as u32,
                enqueued_at: parse_datetime(&enqueued),
                dead_lettered_at: dead_lettered.as_deref().map(parse_datetime),
            });
        }
        Ok(entries)
    }

    async fn query_supplier(
        &self,
        sql: &str,
        value: &str,
        op: &str,
    ) -> Result<Option<SupplierRecord>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(sql, params![value])
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => row_to_supplier(&row).map(Some),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("{op}: {e}"))),
        }
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Fixed-width UTC timestamp so stored values compare lexicographically.
fn timestamp(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

const SUPPLIER_COLUMNS: &str =
    "supplier_id, supplier_name, supplier_type, ap_routing_code, default_currency";

fn row_to_supplier(row: &libsql::Row) -> Result<SupplierRecord, DatabaseError> {
    let parse_err = |e: libsql::Error| DatabaseError::Query(format!("row parse: {e}"));
    let supplier_type: String = row.get(2).map_err(parse_err)?;
    let routing_code: String = row.get(3).map_err(parse_err)?;

    Ok(SupplierRecord {
        supplier_id: row.get(0).map_err(parse_err)?,
        supplier_name: row.get(1).ok(),
        supplier_type: supplier_type
            .parse::<SupplierType>()
            .map_err(DatabaseError::Serialization)?,
        routing_code: routing_code
            .parse::<RoutingCode>()
            .map_err(DatabaseError::Serialization)?,
        default_currency: row.get(4).ok(),
        unknown_vendor: false,
    })
}

// ── Supplier directory ──────────────────────────────────────────────

#[async_trait]
impl SupplierDirectory for LibSqlBackend {
    async fn find_by_domain(&self, domain: &str) -> Result<Option<SupplierRecord>, DatabaseError> {
        self.query_supplier(
            &format!("SELECT {SUPPLIER_COLUMNS} FROM suppliers WHERE email_domain = ?1"),
            &domain.trim().to_lowercase(),
            "find_by_domain",
        )
        .await
    }

    async fn find_by_name(&self, name: &str) -> Result<Option<SupplierRecord>, DatabaseError> {
        let name = name.trim();
        if name.is_empty() {
            return Ok(None);
        }
        self.query_supplier(
            &format!(
                "SELECT {SUPPLIER_COLUMNS} FROM suppliers
                 WHERE supplier_name IS NOT NULL AND instr(lower(supplier_name), lower(?1)) > 0
                 ORDER BY supplier_id ASC LIMIT 1"
            ),
            name,
            "find_by_name",
        )
        .await
    }
}

// ── Audit log ───────────────────────────────────────────────────────

#[async_trait]
impl AuditStore for LibSqlBackend {
    async fn append(&self, record: &ProcessingRecord) -> Result<bool, DatabaseError> {
        let json = serde_json::to_string(record)
            .map_err(|e| DatabaseError::Serialization(format!("processing record: {e}")))?;
        let written = self
            .conn()
            .execute(
                "INSERT OR IGNORE INTO processing_records
                    (message_id, attempt, final_stage, outcome, record, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    record.message_id.as_str(),
                    record.attempt as i64,
                    record.final_stage.as_str(),
                    record.outcome.as_str(),
                    json,
                    timestamp(Utc::now()),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("append processing record: {e}")))?;

        if written == 0 {
            warn!(
                message_id = %record.message_id,
                attempt = record.attempt,
                "Processing record already exists, keeping the original"
            );
        }
        Ok(written > 0)
    }

    async fn records_for(&self, message_id: &str) -> Result<Vec<ProcessingRecord>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT record FROM processing_records WHERE message_id = ?1 ORDER BY attempt ASC",
                params![message_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("records_for: {e}")))?;

        let mut records = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("records_for: {e}")))?
        {
            let json: String = row
                .get(0)
                .map_err(|e| DatabaseError::Query(format!("row parse: {e}")))?;
            match serde_json::from_str(&json) {
                Ok(record) => records.push(record),
                Err(e) => warn!(message_id, error = %e, "Skipping unreadable processing record"),
            }
        }
        Ok(records)
    }
}

// ── Work queue ──────────────────────────────────────────────────────

#[async_trait]
impl WorkQueue for LibSqlBackend {
    async fn receive(&self) -> Result<Option<QueueEntry>, QueueError> {
        loop {
            let now = Utc::now();
            let mut rows = self
                .conn()
                .query(
                    "SELECT id, body, receive_count, enqueued_at FROM work_queue
                     WHERE status = 'ready' AND visible_at <= ?1
                     ORDER BY enqueued_at ASC LIMIT 1",
                    params![timestamp(now)],
                )
                .await
                .map_err(|e| DatabaseError::Query(format!("receive: {e}")))?;

            let Some(row) = rows
                .next()
                .await
                .map_err(|e| DatabaseError::Query(format!("receive: {e}")))?
            else {
                return Ok(None);
            };

            let parse_err = |e: libsql::Error| DatabaseError::Query(format!("row parse: {e}"));
            let id: String = row.get(0).map_err(parse_err)?;
            let body: String = row.get(1).map_err(parse_err)?;
            let receive_count: i64 = row.get(2).map_err(parse_err)?;
            let enqueued: String = row.get(3).map_err(parse_err)?;
            drop(rows);

            if receive_count >= self.queue.max_receives as i64 {
                self.conn()
                    .execute(
                        "UPDATE work_queue SET status = 'dead', dead_lettered_at = ?1
                         WHERE id = ?2 AND receive_count = ?3 AND status = 'ready'",
                        params![timestamp(now), id.clone(), receive_count],
                    )
                    .await
                    .map_err(|e| DatabaseError::Query(format!("dead-letter: {e}")))?;
                warn!(id = %id, receive_count, "Queue entry moved to dead-letter");
                continue;
            }

            let invisible_until = now
                + chrono::Duration::from_std(self.queue.visibility_timeout)
                    .unwrap_or_else(|_| chrono::Duration::seconds(900));
            let claimed = self
                .conn()
                .execute(
                    "UPDATE work_queue SET receive_count = receive_count + 1, visible_at = ?1
                     WHERE id = ?2 AND receive_count = ?3 AND status = 'ready'",
                    params![timestamp(invisible_until), id.clone(), receive_count],
                )
                .await
                .map_err(|e| DatabaseError::Query(format!("claim: {e}")))?;

            if claimed == 0 {
                // Another receiver won the race; look again.
                continue;
            }

            return Ok(Some(QueueEntry {
                id,
                receive_count: (receive_count + 1) as u32,
                body,
                enqueued_at: parse_datetime(&enqueued),
            }));
        }
    }

    async fn ack(&self, id: &str) -> Result<(), QueueError> {
        self.conn()
            .execute("DELETE FROM work_queue WHERE id = ?1", params![id])
            .await
            .map_err(|e| DatabaseError::Query(format!("ack: {e}")))?;
        debug!(id, "Queue entry acknowledged");
        Ok(())
    }

    async fn release(&self, id: &str) -> Result<(), QueueError> {
        let visible_at = Utc::now()
            + chrono::Duration::from_std(self.queue.release_delay)
                .unwrap_or_else(|_| chrono::Duration::zero());
        self.conn()
            .execute(
                "UPDATE work_queue SET visible_at = ?1 WHERE id = ?2 AND status = 'ready'",
                params![timestamp(visible_at), id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("release: {e}")))?;
        debug!(id, "Queue entry released for redelivery");
        Ok(())
    }
}
