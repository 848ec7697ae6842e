//! Routing and splitting engine.
//!
//! Pure computation: no I/O, no clock. The same inputs always produce
//! byte-identical delivery units, which is what makes re-delivery after a
//! retry detectable by subject.

use chrono::{DateTime, SecondsFormat, Utc};
use tracing::{debug, warn};

use crate::config::RoutingTable;
use crate::error::StageError;
use crate::pipeline::mail::escape_html;
use crate::pipeline::types::{
    ClassificationResult, ConfidenceLevel, DeliveryUnit, ExtractionResult, IntentCode,
    NO_INVOICE_NUMBER, RoutingDecision, SupplierRecord,
};

/// Everything routing needs besides the static table.
#[derive(Debug, Clone, Copy)]
pub struct RoutingInput<'a> {
    pub extraction: &'a ExtractionResult,
    pub supplier: &'a SupplierRecord,
    pub classification: &'a ClassificationResult,
    /// Original recipient address of the inbound message.
    pub recipient: &'a str,
    pub received_at: DateTime<Utc>,
}

pub struct Router {
    routing: RoutingTable,
}

impl Router {
    pub fn new(routing: RoutingTable) -> Self {
        Self { routing }
    }

    /// Resolve the destination and produce one unit per invoice candidate
    /// (exactly one when there are zero or one candidates).
    ///
    /// An unmapped recipient is always an error; there is no default inbox.
    pub fn route(&self, input: RoutingInput<'_>) -> Result<RoutingDecision, StageError> {
        let Some(destination) = self.routing.destination_for(input.recipient) else {
            warn!(recipient = %input.recipient, "No routing configured for recipient");
            return Err(StageError::UnroutableDestination {
                recipient: input.recipient.to_string(),
            });
        };

        let references: Vec<&str> = match input.extraction.invoices.as_slice() {
            [] => vec![NO_INVOICE_NUMBER],
            candidates => candidates.iter().map(|c| c.invoice_number.as_str()).collect(),
        };

        let units: Vec<DeliveryUnit> = references
            .into_iter()
            .map(|reference| DeliveryUnit {
                formatted_subject: format_subject(
                    &input.extraction.subject,
                    reference,
                    &input.supplier.supplier_id,
                    input.classification.intent_code,
                ),
                destination_address: destination.to_string(),
                invoice_reference: reference.to_string(),
                supplier_id: input.supplier.supplier_id.clone(),
                intent_code: input.classification.intent_code,
                body: render_body(&input, reference),
            })
            .collect();

        debug!(
            destination,
            units = units.len(),
            split = units.len() > 1,
            "Routing decision"
        );
        Ok(RoutingDecision { units })
    }
}

/// `"<subject> >> Invoice# <ref> | Vendor <supplier_id> | <intent> <<"`
///
/// The subject is used as given; extraction has already trimmed it.
pub fn format_subject(
    subject: &str,
    invoice_reference: &str,
    supplier_id: &str,
    intent: IntentCode,
) -> String {
    format!(
        "{} >> Invoice# {} | Vendor {} | {} <<",
        subject,
        invoice_reference,
        supplier_id,
        intent
    )
}

fn render_body(input: &RoutingInput<'_>, reference: &str) -> String {
    let classification = input.classification;
    let supplier = input.supplier;
    let level = match classification.confidence_level {
        ConfidenceLevel::High => "high",
        ConfidenceLevel::Medium => "medium",
        ConfidenceLevel::Low => "low",
    };

    let mut footer = String::from("---\nProcessed by AP Invoice Routing System\n");
    footer.push_str(&format!("Supplier ID: {}\n", supplier.supplier_id));
    if let Some(name) = &supplier.supplier_name {
        footer.push_str(&format!("Supplier Name: {name}\n"));
    }
    footer.push_str(&format!("Invoice Number: {reference}\n"));
    footer.push_str(&format!("Intent Code: {}\n", classification.intent_code));
    footer.push_str(&format!(
        "Confidence: {} ({level})\n",
        classification.confidence
    ));
    if classification.manual_review_required {
        footer.push_str("Manual Review: REQUIRED\n");
    }
    footer.push_str(&format!(
        "Received: {}\n",
        input
            .received_at
            .to_rfc3339_opts(SecondsFormat::Secs, true)
    ));

    let original = input.extraction.body_text.trim_end();
    if original.is_empty() {
        footer
    } else {
        format!("{original}\n\n{footer}")
    }
}

/// HTML alternative of a unit body: escaped text with line breaks kept.
pub fn render_html(body: &str) -> String {
    let escaped = escape_html(body).replace('\n', "<br>\n");
    format!(
        "<html>\n<body style=\"font-family: sans-serif; line-height: 1.5;\">\n<p>{escaped}</p>\n</body>\n</html>\n"
    )
}
