//! Storage boundaries the pipeline depends on.
//!
//! Each external collaborator is a trait so the core can run against the
//! libSQL backend in production and against in-memory fakes in tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::{BlobError, DatabaseError, QueueError};
use crate::pipeline::types::{ProcessingRecord, SupplierRecord};

/// Read-only supplier lookup.
#[async_trait]
pub trait SupplierDirectory: Send + Sync {
    /// Exact match on the sender's email domain.
    async fn find_by_domain(&self, domain: &str) -> Result<Option<SupplierRecord>, DatabaseError>;

    /// Fallback scan: first supplier whose name contains `name`, ignoring case.
    async fn find_by_name(&self, name: &str) -> Result<Option<SupplierRecord>, DatabaseError>;
}

/// Append-only store of processing attempts.
#[async_trait]
pub trait AuditStore: Send + Sync {
    /// Append one record. Returns `false` if a record with the same
    /// `(message_id, attempt)` already exists; existing records are never
    /// overwritten.
    async fn append(&self, record: &ProcessingRecord) -> Result<bool, DatabaseError>;

    /// All records for a message, oldest attempt first.
    async fn records_for(&self, message_id: &str) -> Result<Vec<ProcessingRecord>, DatabaseError>;
}

/// Raw message bytes by key.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Vec<u8>, BlobError>;
}

/// One received queue entry.
#[derive(Debug, Clone)]
pub struct QueueEntry {
    /// Stable id across redeliveries.
    pub id: String,
    /// How many times this entry has been received, including this one.
    pub receive_count: u32,
    /// Opaque payload as enqueued.
    pub body: String,
    pub enqueued_at: DateTime<Utc>,
}

/// At-least-once work queue.
///
/// Redelivery counting and dead-lettering belong to the implementation;
/// callers only acknowledge or release.
#[async_trait]
pub trait WorkQueue: Send + Sync {
    /// Take the next visible entry, hiding it from other receivers.
    async fn receive(&self) -> Result<Option<QueueEntry>, QueueError>;

    /// Remove a processed entry.
    async fn ack(&self, id: &str) -> Result<(), QueueError>;

    /// Give an entry back for redelivery.
    async fn release(&self, id: &str) -> Result<(), QueueError>;
}
