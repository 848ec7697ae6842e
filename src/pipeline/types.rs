//! Shared types for the invoice processing pipeline.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Supplier id used when no directory record matches.
pub const UNKNOWN_VENDOR_ID: &str = "UNKNOWN_VENDOR";

/// Invoice reference used when the message carries no invoice number.
pub const NO_INVOICE_NUMBER: &str = "NO_INVOICE_NUMBER";

// ── Inbound message ─────────────────────────────────────────────────

/// One unit of work pulled from the queue.
///
/// The raw RFC 5322 bytes live in the blob store under `blob_key`; the
/// envelope fields are whatever the queue notification carried and may
/// be absent. Immutable for the duration of one processing attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    /// Stable id of the queue entry (same across redeliveries).
    pub id: String,
    /// Locator of the raw message in the blob store.
    pub blob_key: String,
    /// Envelope sender, if known before parsing.
    pub sender: Option<String>,
    /// Envelope recipient, if known before parsing.
    pub recipient: Option<String>,
    /// Envelope subject, if known before parsing.
    pub subject: Option<String>,
    /// When the message entered the queue.
    pub received_at: DateTime<Utc>,
}

// ── Extraction ──────────────────────────────────────────────────────

/// A single invoice found in a message or its attachments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvoiceCandidate {
    pub invoice_number: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub po_number: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amount: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub currency: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<String>,
}

impl InvoiceCandidate {
    /// Candidate carrying only an invoice number (body-text fallback).
    pub fn number_only(invoice_number: impl Into<String>) -> Self {
        Self {
            invoice_number: invoice_number.into(),
            po_number: None,
            amount: None,
            currency: None,
            date: None,
        }
    }
}

/// What happened to one attachment during extraction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttachmentSummary {
    pub filename: String,
    /// Invoice numbers the document service found in this attachment.
    pub invoice_numbers: usize,
    /// Set when the attachment could not be parsed (body-only degradation).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Structured view of one inbound email. Never mutated after creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionResult {
    pub sender_address: String,
    pub sender_domain: String,
    pub recipient_address: String,
    pub subject: String,
    /// Supplier name as printed on the invoice, when the service found one.
    pub supplier_name: Option<String>,
    /// Ordered, de-duplicated invoice candidates. May be empty.
    pub invoices: Vec<InvoiceCandidate>,
    pub po_numbers: Vec<String>,
    pub body_text: String,
    pub attachments: Vec<AttachmentSummary>,
}

// ── Supplier ────────────────────────────────────────────────────────

/// Commercial relationship tier of a supplier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SupplierType {
    Standard,
    Strategic,
    OneTime,
    Unknown,
}

impl SupplierType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Standard => "STANDARD",
            Self::Strategic => "STRATEGIC",
            Self::OneTime => "ONE_TIME",
            Self::Unknown => "UNKNOWN",
        }
    }
}

impl FromStr for SupplierType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "STANDARD" => Ok(Self::Standard),
            "STRATEGIC" => Ok(Self::Strategic),
            "ONE_TIME" => Ok(Self::OneTime),
            "UNKNOWN" => Ok(Self::Unknown),
            other => Err(format!("unknown supplier type '{other}'")),
        }
    }
}

/// Accounts-payable routing tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RoutingCode {
    /// Straight-through processing inbox.
    ApInbox,
    /// Needs manual handling by the AP team.
    ApManual,
}

impl RoutingCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ApInbox => "AP_INBOX",
            Self::ApManual => "AP_MANUAL",
        }
    }
}

impl FromStr for RoutingCode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "AP_INBOX" => Ok(Self::ApInbox),
            "AP_MANUAL" => Ok(Self::ApManual),
            other => Err(format!("unknown routing code '{other}'")),
        }
    }
}

/// Supplier identity as held in the directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SupplierRecord {
    pub supplier_id: String,
    pub supplier_name: Option<String>,
    pub supplier_type: SupplierType,
    pub routing_code: RoutingCode,
    #[serde(default)]
    pub default_currency: Option<String>,
    /// True only for the synthesized record of a directory miss.
    #[serde(default)]
    pub unknown_vendor: bool,
}

impl SupplierRecord {
    /// The record used when neither domain nor name matched.
    pub fn unknown() -> Self {
        Self {
            supplier_id: UNKNOWN_VENDOR_ID.to_string(),
            supplier_name: None,
            supplier_type: SupplierType::Unknown,
            routing_code: RoutingCode::ApManual,
            default_currency: None,
            unknown_vendor: true,
        }
    }
}

// ── Classification ──────────────────────────────────────────────────

/// Business intent of a supplier email. The taxonomy is closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum IntentCode {
    /// Invoice submitted for payment.
    Inv,
    /// Credit note or credit memo.
    Crn,
    /// Payment status inquiry or remittance.
    Pay,
    /// Dispute, discrepancy or complaint.
    Dis,
    /// Duplicate invoice submission.
    Dup,
    /// Anything else.
    Oth,
}

impl IntentCode {
    pub const ALL: [IntentCode; 6] = [
        Self::Inv,
        Self::Crn,
        Self::Pay,
        Self::Dis,
        Self::Dup,
        Self::Oth,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Inv => "INV",
            Self::Crn => "CRN",
            Self::Pay => "PAY",
            Self::Dis => "DIS",
            Self::Dup => "DUP",
            Self::Oth => "OTH",
        }
    }

    /// Parse a code case-insensitively. Unknown codes return `None`.
    pub fn parse(s: &str) -> Option<Self> {
        let upper = s.trim().to_ascii_uppercase();
        Self::ALL.into_iter().find(|c| c.as_str() == upper)
    }
}

impl fmt::Display for IntentCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Bucketed classification certainty.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfidenceLevel {
    High,
    Medium,
    Low,
}

impl ConfidenceLevel {
    /// high ≥ 90, medium 70–89, low < 70.
    pub fn from_confidence(confidence: u8) -> Self {
        match confidence {
            90.. => Self::High,
            70..=89 => Self::Medium,
            _ => Self::Low,
        }
    }
}

/// Where a classification came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClassificationSource {
    /// Keyword rules matched before any model call.
    Rules,
    /// The model returned a well-formed answer.
    Model,
    /// The model answer was unusable; OTH was assumed.
    Fallback,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassificationResult {
    pub intent_code: IntentCode,
    /// 0–100.
    pub confidence: u8,
    pub confidence_level: ConfidenceLevel,
    pub manual_review_required: bool,
    pub reasoning: String,
    pub source: ClassificationSource,
}

impl ClassificationResult {
    /// Build a result, deriving level and review flag from `confidence`.
    ///
    /// `confidence` is clamped to 0–100.
    pub fn new(
        intent_code: IntentCode,
        confidence: i64,
        review_threshold: u8,
        reasoning: impl Into<String>,
        source: ClassificationSource,
    ) -> Self {
        let confidence = confidence.clamp(0, 100) as u8;
        Self {
            intent_code,
            confidence,
            confidence_level: ConfidenceLevel::from_confidence(confidence),
            manual_review_required: confidence < review_threshold,
            reasoning: reasoning.into(),
            source,
        }
    }
}

// ── Routing ─────────────────────────────────────────────────────────

/// One independently routed outbound email.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryUnit {
    pub formatted_subject: String,
    pub destination_address: String,
    pub invoice_reference: String,
    pub supplier_id: String,
    pub intent_code: IntentCode,
    pub body: String,
}

/// Ordered fan-out of one message. Never empty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingDecision {
    pub units: Vec<DeliveryUnit>,
}

// ── Processing state & audit ────────────────────────────────────────

/// Pipeline progress marker. Stages are strictly ordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Stage {
    Received,
    Extracted,
    SupplierResolved,
    Classified,
    Routed,
    Delivered,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Received => "RECEIVED",
            Self::Extracted => "EXTRACTED",
            Self::SupplierResolved => "SUPPLIER_RESOLVED",
            Self::Classified => "CLASSIFIED",
            Self::Routed => "ROUTED",
            Self::Delivered => "DELIVERED",
        }
    }

    /// The stage that follows this one, if any.
    pub fn next(&self) -> Option<Stage> {
        match self {
            Self::Received => Some(Self::Extracted),
            Self::Extracted => Some(Self::SupplierResolved),
            Self::SupplierResolved => Some(Self::Classified),
            Self::Classified => Some(Self::Routed),
            Self::Routed => Some(Self::Delivered),
            Self::Delivered => None,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "RECEIVED" => Ok(Self::Received),
            "EXTRACTED" => Ok(Self::Extracted),
            "SUPPLIER_RESOLVED" => Ok(Self::SupplierResolved),
            "CLASSIFIED" => Ok(Self::Classified),
            "ROUTED" => Ok(Self::Routed),
            "DELIVERED" => Ok(Self::Delivered),
            other => Err(format!("unknown stage '{other}'")),
        }
    }
}

/// Terminal result of one processing attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Outcome {
    Delivered,
    PartialDeliveryFailure,
    Failed,
    /// Failed on the last attempt the queue will make.
    DeadLettered,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Delivered => "DELIVERED",
            Self::PartialDeliveryFailure => "PARTIAL_DELIVERY_FAILURE",
            Self::Failed => "FAILED",
            Self::DeadLettered => "DEAD_LETTERED",
        }
    }
}

impl FromStr for Outcome {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "DELIVERED" => Ok(Self::Delivered),
            "PARTIAL_DELIVERY_FAILURE" => Ok(Self::PartialDeliveryFailure),
            "FAILED" => Ok(Self::Failed),
            "DEAD_LETTERED" => Ok(Self::DeadLettered),
            other => Err(format!("unknown outcome '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UnitStatus {
    Delivered,
    /// A previous attempt already delivered this exact unit.
    SkippedAlreadyDelivered,
    Failed,
}

/// Audit entry for one delivery unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitResult {
    pub invoice_reference: String,
    pub formatted_subject: String,
    pub destination_address: String,
    pub status: UnitStatus,
    /// Transport receipt (e.g. SMTP queue id) for delivered units.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receipt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub transient: bool,
}

impl UnitResult {
    /// Whether this unit reached its destination in this or an earlier attempt.
    pub fn is_settled(&self) -> bool {
        matches!(
            self.status,
            UnitStatus::Delivered | UnitStatus::SkippedAlreadyDelivered
        )
    }
}

/// Stage and cause of a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureDetail {
    pub stage: Stage,
    pub cause: String,
}

/// Append-only audit record of one processing attempt.
///
/// `(message_id, attempt)` is the idempotency key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingRecord {
    pub message_id: String,
    pub attempt: u32,
    /// Last stage reached, or the stage that failed.
    pub final_stage: Stage,
    pub outcome: Outcome,
    pub failure: Option<FailureDetail>,
    pub supplier_id: Option<String>,
    pub intent_code: Option<IntentCode>,
    pub confidence: Option<u8>,
    pub manual_review_required: bool,
    pub units: Vec<UnitResult>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn confidence_level_boundaries() {
        assert_eq!(ConfidenceLevel::from_confidence(100), ConfidenceLevel::High);
        assert_eq!(ConfidenceLevel::from_confidence(90), ConfidenceLevel::High);
        assert_eq!(ConfidenceLevel::from_confidence(89), ConfidenceLevel::Medium);
        assert_eq!(ConfidenceLevel::from_confidence(70), ConfidenceLevel::Medium);
        assert_eq!(ConfidenceLevel::from_confidence(69), ConfidenceLevel::Low);
        assert_eq!(ConfidenceLevel::from_confidence(0), ConfidenceLevel::Low);
    }

    #[test]
    fn manual_review_iff_below_threshold() {
        for confidence in 0..=100 {
            let result = ClassificationResult::new(
                IntentCode::Inv,
                confidence,
                70,
                "",
                ClassificationSource::Model,
            );
            assert_eq!(result.manual_review_required, confidence < 70, "{confidence}");
        }
    }

    #[test]
    fn classification_confidence_clamped() {
        let high = ClassificationResult::new(
            IntentCode::Pay,
            250,
            70,
            "",
            ClassificationSource::Model,
        );
        assert_eq!(high.confidence, 100);
        let low = ClassificationResult::new(IntentCode::Pay, -5, 70, "", ClassificationSource::Model);
        assert_eq!(low.confidence, 0);
        assert!(low.manual_review_required);
    }

    #[test]
    fn intent_code_parse_is_case_insensitive() {
        assert_eq!(IntentCode::parse("inv"), Some(IntentCode::Inv));
        assert_eq!(IntentCode::parse(" CRN "), Some(IntentCode::Crn));
        assert_eq!(IntentCode::parse("escalate"), None);
    }

    #[test]
    fn intent_code_serializes_uppercase() {
        let json = serde_json::to_string(&IntentCode::Dup).unwrap();
        assert_eq!(json, "\"DUP\"");
    }

    #[test]
    fn unknown_supplier_routes_manually() {
        let record = SupplierRecord::unknown();
        assert_eq!(record.supplier_id, UNKNOWN_VENDOR_ID);
        assert_eq!(record.supplier_type, SupplierType::Unknown);
        assert_eq!(record.routing_code, RoutingCode::ApManual);
        assert!(record.unknown_vendor);
    }

    #[test]
    fn supplier_enums_parse_directory_strings() {
        assert_eq!("one_time".parse::<SupplierType>(), Ok(SupplierType::OneTime));
        assert_eq!("AP_INBOX".parse::<RoutingCode>(), Ok(RoutingCode::ApInbox));
        assert!("VIP".parse::<SupplierType>().is_err());
    }

    #[test]
    fn stages_are_strictly_ordered() {
        let mut stage = Stage::Received;
        let mut seen = vec![stage];
        while let Some(next) = stage.next() {
            assert!(next > stage);
            stage = next;
            seen.push(stage);
        }
        assert_eq!(seen.len(), 6);
        assert_eq!(stage, Stage::Delivered);
    }

    #[test]
    fn stage_and_outcome_round_trip_through_strings() {
        for stage in [Stage::Received, Stage::SupplierResolved, Stage::Delivered] {
            assert_eq!(stage.as_str().parse::<Stage>(), Ok(stage));
        }
        assert_eq!(
            "PARTIAL_DELIVERY_FAILURE".parse::<Outcome>(),
            Ok(Outcome::PartialDeliveryFailure)
        );
    }
}
