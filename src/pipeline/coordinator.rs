//! Ingestion coordinator and worker pool.
//!
//! Loop per worker:
//! 1. `receive()` one entry from the work queue
//! 2. Build the `InboundMessage` from its payload
//! 3. `orchestrator.process()` with the receive count as attempt number
//! 4. `ack` on success, `release` otherwise (the queue dead-letters)

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::WorkerConfig;
use crate::error::QueueError;
use crate::pipeline::orchestrator::Orchestrator;
use crate::pipeline::types::{InboundMessage, Outcome};
use crate::store::{QueueEntry, WorkQueue};

/// JSON body of a work queue entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuePayload {
    pub blob_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
}

impl QueuePayload {
    pub fn new(blob_key: impl Into<String>) -> Self {
        Self {
            blob_key: blob_key.into(),
            sender: None,
            recipient: None,
            subject: None,
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// What one `run_once` call did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoordinatorOutcome {
    /// Nothing visible in the queue.
    Idle,
    /// Entry processed and removed.
    Acknowledged { message_id: String, outcome: Outcome },
    /// Entry left for redelivery. `last_attempt` means the queue will
    /// dead-letter it instead of delivering it again.
    Released { message_id: String, attempt: u32, last_attempt: bool },
}

pub struct IngestionCoordinator {
    queue: Arc<dyn WorkQueue>,
    orchestrator: Arc<Orchestrator>,
}

impl IngestionCoordinator {
    pub fn new(queue: Arc<dyn WorkQueue>, orchestrator: Arc<Orchestrator>) -> Self {
        Self {
            queue,
            orchestrator,
        }
    }

    /// Receive and process at most one entry.
    pub async fn run_once(&self) -> Result<CoordinatorOutcome, QueueError> {
        let Some(entry) = self.queue.receive().await? else {
            return Ok(CoordinatorOutcome::Idle);
        };
        let attempt = entry.receive_count;
        let last_attempt = attempt >= self.orchestrator.config().max_attempts;

        let message = match inbound_from_entry(&entry) {
            Ok(message) => message,
            Err(e) => {
                error!(id = %entry.id, attempt, error = %e, "Unreadable queue entry");
                self.queue.release(&entry.id).await?;
                return Ok(CoordinatorOutcome::Released {
                    message_id: entry.id,
                    attempt,
                    last_attempt,
                });
            }
        };

        match self.orchestrator.process(&message, attempt).await {
            Ok(record) => {
                self.queue.ack(&entry.id).await?;
                debug!(id = %entry.id, outcome = record.outcome.as_str(), "Queue entry acknowledged");
                Ok(CoordinatorOutcome::Acknowledged {
                    message_id: entry.id,
                    outcome: record.outcome,
                })
            }
            Err(e) => {
                if last_attempt {
                    warn!(id = %entry.id, attempt, error = %e, "Final attempt failed, entry will be dead-lettered");
                } else {
                    info!(id = %entry.id, attempt, error = %e, "Attempt failed, leaving entry for redelivery");
                }
                self.queue.release(&entry.id).await?;
                Ok(CoordinatorOutcome::Released {
                    message_id: entry.id,
                    attempt,
                    last_attempt,
                })
            }
        }
    }
}

/// Build the pipeline input from a queue entry.
pub fn inbound_from_entry(entry: &QueueEntry) -> Result<InboundMessage, QueueError> {
    let payload: QueuePayload =
        serde_json::from_str(&entry.body).map_err(|e| QueueError::InvalidPayload {
            id: entry.id.clone(),
            reason: e.to_string(),
        })?;
    if payload.blob_key.trim().is_empty() {
        return Err(QueueError::InvalidPayload {
            id: entry.id.clone(),
            reason: "empty blob_key".into(),
        });
    }

    Ok(InboundMessage {
        id: entry.id.clone(),
        blob_key: payload.blob_key,
        sender: payload.sender,
        recipient: payload.recipient,
        subject: payload.subject,
        received_at: entry.enqueued_at,
    })
}

/// Spawn `concurrency` coordinator loops.
///
/// Each worker polls the queue, sleeping `poll_interval` when it is empty
/// or erroring. Returns the handles and a shutdown flag; workers exit after
/// their current entry once the flag is set.
pub fn spawn_workers(
    coordinator: Arc<IngestionCoordinator>,
    config: &WorkerConfig,
) -> (Vec<JoinHandle<()>>, Arc<AtomicBool>) {
    let shutdown = Arc::new(AtomicBool::new(false));
    let poll_interval = config.poll_interval;

    let handles = (0..config.concurrency.max(1))
        .map(|worker| {
            let coordinator = Arc::clone(&coordinator);
            let shutdown = Arc::clone(&shutdown);
            tokio::spawn(async move {
                info!(worker, "Ingestion worker started");
                loop {
                    if shutdown.load(Ordering::Relaxed) {
                        info!(worker, "Ingestion worker shutting down");
                        return;
                    }

                    match coordinator.run_once().await {
                        Ok(CoordinatorOutcome::Idle) => tokio::time::sleep(poll_interval).await,
                        Ok(outcome) => debug!(worker, ?outcome, "Queue entry handled"),
                        Err(e) => {
                            error!(worker, error = %e, "Queue operation failed");
                            tokio::time::sleep(poll_interval).await;
                        }
                    }
                }
            })
        })
        .collect();

    (handles, shutdown)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn entry(body: &str) -> QueueEntry {
        QueueEntry {
            id: "q-1".into(),
            receive_count: 2,
            body: body.into(),
            enqueued_at: Utc::now(),
        }
    }

    #[test]
    fn payload_with_envelope() {
        let message = inbound_from_entry(&entry(
            r#"{"blob_key": "in/1.eml", "recipient": "invoices@corp.com"}"#,
        ))
        .unwrap();
        assert_eq!(message.id, "q-1");
        assert_eq!(message.blob_key, "in/1.eml");
        assert_eq!(message.recipient.as_deref(), Some("invoices@corp.com"));
        assert!(message.sender.is_none());
    }

    #[test]
    fn payload_json_omits_missing_envelope() {
        let json = QueuePayload::new("in/2.eml").to_json().unwrap();
        assert_eq!(json, r#"{"blob_key":"in/2.eml"}"#);
    }

    #[test]
    fn invalid_payloads_are_rejected() {
        for body in ["not json", r#"{"sender": "a@b.com"}"#, r#"{"blob_key": "  "}"#] {
            assert!(
                matches!(inbound_from_entry(&entry(body)), Err(QueueError::InvalidPayload { .. })),
                "{body}"
            );
        }
    }
}
