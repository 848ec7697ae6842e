//! Pipeline orchestrator: one processing attempt for one message.
//!
//! RECEIVED → EXTRACTED → SUPPLIER_RESOLVED → CLASSIFIED → ROUTED →
//! DELIVERED. Stages run strictly in order; the first stage error aborts
//! the attempt. Delivery units are dispatched independently and units
//! already delivered by an earlier attempt are skipped. Exactly one
//! [`ProcessingRecord`] is appended per attempt. The orchestrator never
//! retries; that belongs to the queue.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, error, info, warn};

use crate::channels::DeliveryChannel;
use crate::config::PipelineConfig;
use crate::error::{PipelineError, StageError};
use crate::llm::LlmProvider;
use crate::pipeline::classification::IntentClassifier;
use crate::pipeline::extraction::ExtractionStage;
use crate::pipeline::routing::{Router, RoutingInput};
use crate::pipeline::supplier::SupplierResolver;
use crate::pipeline::types::{
    FailureDetail, InboundMessage, IntentCode, Outcome, ProcessingRecord, RoutingDecision, Stage,
    UnitResult, UnitStatus,
};
use crate::store::{AuditStore, BlobStore, SupplierDirectory};

/// External collaborators the pipeline is wired to.
#[derive(Clone)]
pub struct PipelineDeps {
    pub blobs: Arc<dyn BlobStore>,
    pub llm: Arc<dyn LlmProvider>,
    pub directory: Arc<dyn SupplierDirectory>,
    pub audit: Arc<dyn AuditStore>,
    pub delivery: Arc<dyn DeliveryChannel>,
}

/// Supplier and classification facts gathered before a failure.
#[derive(Default)]
struct Summary {
    supplier_id: Option<String>,
    intent_code: Option<IntentCode>,
    confidence: Option<u8>,
    manual_review_required: bool,
}

pub struct Orchestrator {
    config: PipelineConfig,
    extraction: ExtractionStage,
    resolver: SupplierResolver,
    classifier: IntentClassifier,
    router: Router,
    audit: Arc<dyn AuditStore>,
    delivery: Arc<dyn DeliveryChannel>,
}

impl Orchestrator {
    pub fn new(config: PipelineConfig, deps: PipelineDeps) -> Self {
        let classifier =
            IntentClassifier::new(deps.llm.clone()).with_review_threshold(config.review_threshold);
        Self {
            extraction: ExtractionStage::new(deps.blobs, deps.llm),
            resolver: SupplierResolver::new(deps.directory),
            classifier,
            router: Router::new(config.routing.clone()),
            audit: deps.audit,
            delivery: deps.delivery,
            config,
        }
    }

    /// Replace the classifier (custom rules, thresholds).
    pub fn with_classifier(mut self, classifier: IntentClassifier) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Run one attempt. `attempt` is 1-based and comes from the queue's
    /// receive count.
    ///
    /// `Ok` means the entry can be acknowledged: everything was delivered,
    /// or the only failures were permanent delivery rejections. `Err`
    /// means the entry should be left for redelivery.
    pub async fn process(
        &self,
        message: &InboundMessage,
        attempt: u32,
    ) -> Result<ProcessingRecord, PipelineError> {
        let started_at = Utc::now();
        let mut summary = Summary::default();
        info!(message_id = %message.id, attempt, blob_key = %message.blob_key, "Processing message");

        let decision = match self.run_stages(message, &mut summary).await {
            Ok(decision) => decision,
            Err(err) => {
                let stage = err.stage();
                let outcome = self.failure_outcome(attempt);
                error!(
                    message_id = %message.id,
                    attempt,
                    stage = %stage,
                    outcome = outcome.as_str(),
                    error = %err,
                    "Processing attempt failed"
                );
                let cause = match &err {
                    PipelineError::Stage { source, .. } => source.to_string(),
                    other => other.to_string(),
                };
                self.write_record(ProcessingRecord {
                    message_id: message.id.clone(),
                    attempt,
                    final_stage: stage,
                    outcome,
                    failure: Some(FailureDetail { stage, cause }),
                    supplier_id: summary.supplier_id,
                    intent_code: summary.intent_code,
                    confidence: summary.confidence,
                    manual_review_required: summary.manual_review_required,
                    units: vec![],
                    started_at,
                    finished_at: Utc::now(),
                })
                .await;
                return Err(err);
            }
        };

        let units = self.dispatch(message, attempt, decision).await;
        let total = units.len();
        let failed: Vec<&UnitResult> = units
            .iter()
            .filter(|u| u.status == UnitStatus::Failed)
            .collect();
        let transient = failed.iter().filter(|u| u.transient).count();
        let settled = total - failed.len();

        let outcome = if failed.is_empty() {
            Outcome::Delivered
        } else if transient > 0 && attempt >= self.config.max_attempts {
            Outcome::DeadLettered
        } else if settled > 0 {
            Outcome::PartialDeliveryFailure
        } else {
            Outcome::Failed
        };

        let failure = (!failed.is_empty()).then(|| FailureDetail {
            stage: Stage::Delivered,
            cause: format!(
                "{} of {} delivery units failed: {}",
                failed.len(),
                total,
                failed
                    .iter()
                    .map(|u| format!(
                        "{} ({})",
                        u.invoice_reference,
                        u.error.as_deref().unwrap_or("unknown error")
                    ))
                    .collect::<Vec<_>>()
                    .join("; ")
            ),
        });
        let failed_count = failed.len();

        let record = ProcessingRecord {
            message_id: message.id.clone(),
            attempt,
            final_stage: Stage::Delivered,
            outcome,
            failure,
            supplier_id: summary.supplier_id,
            intent_code: summary.intent_code,
            confidence: summary.confidence,
            manual_review_required: summary.manual_review_required,
            units,
            started_at,
            finished_at: Utc::now(),
        };
        self.write_record(record.clone()).await;

        info!(
            message_id = %message.id,
            attempt,
            outcome = outcome.as_str(),
            delivered = settled,
            failed = failed_count,
            "Processing attempt finished"
        );

        if transient > 0 {
            return Err(PipelineError::DeliveryIncomplete {
                failed: transient,
                total,
            });
        }
        Ok(record)
    }

    async fn run_stages(
        &self,
        message: &InboundMessage,
        summary: &mut Summary,
    ) -> Result<RoutingDecision, PipelineError> {
        let timeout = self.config.stage_timeout;

        let extraction = bounded(timeout, self.extraction.extract(message))
            .await
            .unwrap_or(Err(StageError::ExtractionTimeout { timeout }))
            .map_err(|source| stage_error(Stage::Extracted, source))?;
        debug!(message_id = %message.id, stage = %Stage::Extracted, "Stage complete");

        let supplier = self.resolver.resolve(&extraction).await;
        summary.supplier_id = Some(supplier.supplier_id.clone());
        debug!(message_id = %message.id, stage = %Stage::SupplierResolved, "Stage complete");

        let classification = bounded(timeout, self.classifier.classify(&extraction))
            .await
            .unwrap_or(Err(StageError::ClassificationTimeout { timeout }))
            .map_err(|source| stage_error(Stage::Classified, source))?;
        summary.intent_code = Some(classification.intent_code);
        summary.confidence = Some(classification.confidence);
        summary.manual_review_required = classification.manual_review_required;
        if classification.manual_review_required {
            warn!(
                message_id = %message.id,
                confidence = classification.confidence,
                "Low confidence classification, flagged for manual review"
            );
        }
        debug!(message_id = %message.id, stage = %Stage::Classified, "Stage complete");

        let decision = self
            .router
            .route(RoutingInput {
                extraction: &extraction,
                supplier: &supplier,
                classification: &classification,
                recipient: &extraction.recipient_address,
                received_at: message.received_at,
            })
            .map_err(|source| stage_error(Stage::Routed, source))?;
        debug!(
            message_id = %message.id,
            stage = %Stage::Routed,
            units = decision.units.len(),
            "Stage complete"
        );

        Ok(decision)
    }

    /// Send every unit independently, skipping ones a previous attempt
    /// already delivered.
    async fn dispatch(
        &self,
        message: &InboundMessage,
        attempt: u32,
        decision: RoutingDecision,
    ) -> Vec<UnitResult> {
        let already = self.previously_delivered(&message.id).await;
        let mut results = Vec::with_capacity(decision.units.len());

        for unit in decision.units {
            if already.contains(&unit.invoice_reference) {
                info!(
                    message_id = %message.id,
                    attempt,
                    invoice_reference = %unit.invoice_reference,
                    "Unit already delivered by an earlier attempt, skipping"
                );
                results.push(UnitResult {
                    invoice_reference: unit.invoice_reference,
                    formatted_subject: unit.formatted_subject,
                    destination_address: unit.destination_address,
                    status: UnitStatus::SkippedAlreadyDelivered,
                    receipt: None,
                    error: None,
                    transient: false,
                });
                continue;
            }

            let sent = match bounded(self.config.stage_timeout, self.delivery.deliver(&unit)).await {
                Some(Ok(receipt)) => Ok(receipt),
                Some(Err(e)) => Err((e.to_string(), e.is_transient())),
                None => Err(("delivery timed out".to_string(), true)),
            };

            let result = match sent {
                Ok(receipt) => {
                    info!(
                        message_id = %message.id,
                        attempt,
                        invoice_reference = %unit.invoice_reference,
                        destination = %unit.destination_address,
                        "Unit delivered"
                    );
                    UnitResult {
                        invoice_reference: unit.invoice_reference,
                        formatted_subject: unit.formatted_subject,
                        destination_address: unit.destination_address,
                        status: UnitStatus::Delivered,
                        receipt: Some(receipt),
                        error: None,
                        transient: false,
                    }
                }
                Err((reason, transient)) => {
                    warn!(
                        message_id = %message.id,
                        attempt,
                        invoice_reference = %unit.invoice_reference,
                        transient,
                        error = %reason,
                        "Unit delivery failed"
                    );
                    UnitResult {
                        invoice_reference: unit.invoice_reference,
                        formatted_subject: unit.formatted_subject,
                        destination_address: unit.destination_address,
                        status: UnitStatus::Failed,
                        receipt: None,
                        error: Some(reason),
                        transient,
                    }
                }
            };
            results.push(result);
        }

        results
    }

    /// Invoice references an earlier attempt of this message settled.
    ///
    /// Keyed on the reference alone: the subject carries the intent and
    /// supplier, which may differ between attempts.
    async fn previously_delivered(&self, message_id: &str) -> HashSet<String> {
        match self.audit.records_for(message_id).await {
            Ok(records) => records
                .into_iter()
                .flat_map(|r| r.units)
                .filter(UnitResult::is_settled)
                .map(|u| u.invoice_reference)
                .collect(),
            Err(e) => {
                warn!(message_id, error = %e, "Could not read earlier attempts, sending all units");
                HashSet::new()
            }
        }
    }

    fn failure_outcome(&self, attempt: u32) -> Outcome {
        if attempt >= self.config.max_attempts {
            Outcome::DeadLettered
        } else {
            Outcome::Failed
        }
    }

    async fn write_record(&self, record: ProcessingRecord) {
        match self.audit.append(&record).await {
            Ok(true) => debug!(message_id = %record.message_id, attempt = record.attempt, "Audit record written"),
            Ok(false) => {}
            Err(e) => error!(
                message_id = %record.message_id,
                attempt = record.attempt,
                error = %e,
                "Failed to write audit record"
            ),
        }
    }
}

fn stage_error(stage: Stage, source: StageError) -> PipelineError {
    PipelineError::Stage { stage, source }
}

/// `None` when the future does not finish within `limit`.
async fn bounded<T>(limit: Duration, fut: impl Future<Output = T>) -> Option<T> {
    tokio::time::timeout(limit, fut).await.ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    use async_trait::async_trait;

    use crate::config::RoutingTable;
    use crate::error::{BlobError, DatabaseError, DeliveryError, LlmError};
    use crate::llm::{CompletionRequest, CompletionResponse, FinishReason};
    use crate::pipeline::types::{DeliveryUnit, SupplierRecord};

    const RAW: &str = "From: billing@acme.com\r\n\
To: invoices@corp.com\r\n\
Subject: Invoice INV-100\r\n\
\r\n\
Please pay INV-100.\r\n";

    struct OneBlob;

    #[async_trait]
    impl BlobStore for OneBlob {
        async fn get(&self, key: &str) -> Result<Vec<u8>, BlobError> {
            if key == "msg.eml" {
                Ok(RAW.as_bytes().to_vec())
            } else {
                Err(BlobError::NotFound(key.into()))
            }
        }
    }

    struct SlowLlm {
        delay: Duration,
    }

    #[async_trait]
    impl LlmProvider for SlowLlm {
        fn model_name(&self) -> &str {
            "slow"
        }

        async fn complete(&self, _request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
            tokio::time::sleep(self.delay).await;
            Ok(CompletionResponse {
                content: r#"{"intent_code": "INV", "confidence": 91, "reasoning": "invoice"}"#.into(),
                input_tokens: 1,
                output_tokens: 1,
                finish_reason: FinishReason::Stop,
            })
        }
    }

    struct EmptyDirectory;

    #[async_trait]
    impl SupplierDirectory for EmptyDirectory {
        async fn find_by_domain(&self, _domain: &str) -> Result<Option<SupplierRecord>, DatabaseError> {
            Ok(None)
        }

        async fn find_by_name(&self, _name: &str) -> Result<Option<SupplierRecord>, DatabaseError> {
            Ok(None)
        }
    }

    #[derive(Default)]
    struct MemoryAudit {
        records: Mutex<HashMap<(String, u32), ProcessingRecord>>,
        broken: bool,
    }

    #[async_trait]
    impl AuditStore for MemoryAudit {
        async fn append(&self, record: &ProcessingRecord) -> Result<bool, DatabaseError> {
            if self.broken {
                return Err(DatabaseError::Query("disk full".into()));
            }
            let mut records = self.records.lock().unwrap();
            let key = (record.message_id.clone(), record.attempt);
            if records.contains_key(&key) {
                return Ok(false);
            }
            records.insert(key, record.clone());
            Ok(true)
        }

        async fn records_for(&self, message_id: &str) -> Result<Vec<ProcessingRecord>, DatabaseError> {
            let records = self.records.lock().unwrap();
            let mut found: Vec<_> = records
                .values()
                .filter(|r| r.message_id == message_id)
                .cloned()
                .collect();
            found.sort_by_key(|r| r.attempt);
            Ok(found)
        }
    }

    struct Rejecting {
        transient: bool,
    }

    #[async_trait]
    impl DeliveryChannel for Rejecting {
        fn name(&self) -> &str {
            "rejecting"
        }

        async fn deliver(&self, unit: &DeliveryUnit) -> Result<String, DeliveryError> {
            let destination = unit.destination_address.clone();
            let reason = "mailbox unavailable".to_string();
            Err(if self.transient {
                DeliveryError::Transient { destination, reason }
            } else {
                DeliveryError::Permanent { destination, reason }
            })
        }
    }

    fn orchestrator(
        llm_delay: Duration,
        audit: Arc<MemoryAudit>,
        transient: bool,
    ) -> Orchestrator {
        let mut config = PipelineConfig::new(RoutingTable::new([("invoices@corp.com", "ap@corp.com")]));
        config.stage_timeout = Duration::from_millis(50);
        Orchestrator::new(
            config,
            PipelineDeps {
                blobs: Arc::new(OneBlob),
                llm: Arc::new(SlowLlm { delay: llm_delay }),
                directory: Arc::new(EmptyDirectory),
                audit,
                delivery: Arc::new(Rejecting { transient }),
            },
        )
    }

    fn message(blob_key: &str) -> InboundMessage {
        InboundMessage {
            id: "m-1".into(),
            blob_key: blob_key.into(),
            sender: None,
            recipient: None,
            subject: None,
            received_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn slow_model_is_classification_timeout() {
        let audit = Arc::new(MemoryAudit::default());
        let orch = orchestrator(Duration::from_secs(5), audit.clone(), false);

        let err = orch.process(&message("msg.eml"), 1).await.unwrap_err();
        assert_eq!(err.stage(), Stage::Classified);
        assert!(matches!(
            err,
            PipelineError::Stage {
                source: StageError::ClassificationTimeout { .. },
                ..
            }
        ));

        let records = audit.records_for("m-1").await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].outcome, Outcome::Failed);
        assert_eq!(records[0].supplier_id.as_deref(), Some("UNKNOWN_VENDOR"));
        assert!(records[0].failure.as_ref().unwrap().cause.starts_with("ClassificationTimeout"));
    }

    #[tokio::test]
    async fn last_attempt_failure_is_dead_lettered() {
        let audit = Arc::new(MemoryAudit::default());
        let orch = orchestrator(Duration::ZERO, audit.clone(), false);

        let err = orch.process(&message("gone.eml"), 3).await.unwrap_err();
        assert_eq!(err.stage(), Stage::Extracted);

        let records = audit.records_for("m-1").await.unwrap();
        assert_eq!(records[0].outcome, Outcome::DeadLettered);
        assert_eq!(records[0].final_stage, Stage::Extracted);
    }

    #[tokio::test]
    async fn permanent_rejection_is_acknowledged_as_failed() {
        let audit = Arc::new(MemoryAudit::default());
        let orch = orchestrator(Duration::ZERO, audit.clone(), false);

        let record = orch.process(&message("msg.eml"), 1).await.unwrap();
        assert_eq!(record.outcome, Outcome::Failed);
        assert_eq!(record.final_stage, Stage::Delivered);
        assert_eq!(record.units.len(), 1);
        assert!(!record.units[0].transient);
    }

    #[tokio::test]
    async fn transient_rejection_asks_for_redelivery() {
        let audit = Arc::new(MemoryAudit::default());
        let orch = orchestrator(Duration::ZERO, audit.clone(), true);

        let err = orch.process(&message("msg.eml"), 1).await.unwrap_err();
        assert!(matches!(err, PipelineError::DeliveryIncomplete { failed: 1, total: 1 }));

        let err = orch.process(&message("msg.eml"), 3).await.unwrap_err();
        assert_eq!(err.stage(), Stage::Delivered);
        let records = audit.records_for("m-1").await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].outcome, Outcome::DeadLettered);
    }

    #[tokio::test]
    async fn audit_failure_does_not_change_outcome() {
        let audit = Arc::new(MemoryAudit {
            broken: true,
            ..Default::default()
        });
        let orch = orchestrator(Duration::ZERO, audit, false);
        let record = orch.process(&message("msg.eml"), 1).await.unwrap();
        assert_eq!(record.outcome, Outcome::Failed);
    }
}
