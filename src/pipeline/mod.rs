//! Invoice email processing pipeline.
//!
//! Every queued message flows through, in order:
//! 1. `ExtractionStage::extract()`: parse the raw email, read PDF attachments
//! 2. `SupplierResolver::resolve()`: domain lookup, name scan, unknown vendor
//! 3. `IntentClassifier::classify()`: keyword rules, then the model
//! 4. `Router::route()`: destination lookup, per-invoice split, subjects
//!
//! `Orchestrator` sequences the stages, dispatches the delivery units and
//! writes the audit record; `IngestionCoordinator` feeds it from the queue.
//!
//! **No default destination exists.** A recipient missing from the routing
//! table fails the attempt.

pub mod classification;
pub mod coordinator;
pub mod extraction;
pub mod mail;
pub mod orchestrator;
pub mod routing;
pub mod rules;
pub mod supplier;
pub mod types;

pub use classification::IntentClassifier;
pub use coordinator::{CoordinatorOutcome, IngestionCoordinator, QueuePayload, spawn_workers};
pub use extraction::ExtractionStage;
pub use orchestrator::{Orchestrator, PipelineDeps};
pub use routing::{Router, RoutingInput, format_subject};
pub use rules::RulesEngine;
pub use supplier::SupplierResolver;
