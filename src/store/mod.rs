//! Persistence layer: supplier directory, audit log, work queue and raw
//! message blobs.

pub mod blob;
pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use blob::FsBlobStore;
pub use libsql_backend::{DeadLetter, LibSqlBackend, QueueSettings, SupplierSeed};
pub use traits::{AuditStore, BlobStore, QueueEntry, SupplierDirectory, WorkQueue};
