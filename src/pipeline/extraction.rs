//! Extraction stage: raw message bytes → [`ExtractionResult`].
//!
//! PDF attachments go to the document-understanding service one at a time.
//! A failed attachment is logged and skipped; the body regexes are the
//! fallback when no attachment yields invoice or PO numbers.

use std::str::FromStr;
use std::sync::{Arc, LazyLock};

use mail_parser::{MessageParser, MimeHeaders};
use regex::Regex;
use rust_decimal::Decimal;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::error::{LlmError, StageError};
use crate::llm::json::parse_json_object;
use crate::llm::{ChatMessage, CompletionRequest, LlmProvider};
use crate::pipeline::mail::{domain_of, extract_addresses, first_address, strip_html};
use crate::pipeline::types::{
    AttachmentSummary, ExtractionResult, InboundMessage, InvoiceCandidate,
};
use crate::store::BlobStore;

const ATTACHMENT_PROMPT: &str = r#"Extract from this invoice/document:
1. Invoice number(s) (e.g. INV-458921)
2. PO number(s)
3. Supplier name
4. Invoice date
5. Total amount and currency

Return JSON only:
{
  "invoice_numbers": ["list"],
  "po_numbers": ["list"],
  "supplier_name": "name or null",
  "invoice_date": "date or null",
  "total_amount": "amount or null",
  "currency": "USD/EUR/etc or null"
}"#;

const ATTACHMENT_MAX_TOKENS: u32 = 2000;

static BODY_INVOICE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[A-Z]{2,}-\d{3,}").expect("valid invoice pattern"));

static BODY_PO: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:PO|P\.O\.)\s*#?\s*(\d{5,})").expect("valid PO pattern")
});

/// Fields the document service returns for one attachment.
#[derive(Debug, Default, Deserialize)]
struct DocumentFields {
    #[serde(default)]
    invoice_numbers: Vec<String>,
    #[serde(default)]
    po_numbers: Vec<String>,
    #[serde(default)]
    supplier_name: Option<String>,
    #[serde(default)]
    invoice_date: Option<String>,
    #[serde(default)]
    total_amount: Option<serde_json::Value>,
    #[serde(default)]
    currency: Option<String>,
}

/// Turns an inbound message into structured invoice data.
pub struct ExtractionStage {
    blobs: Arc<dyn BlobStore>,
    llm: Arc<dyn LlmProvider>,
}

impl ExtractionStage {
    pub fn new(blobs: Arc<dyn BlobStore>, llm: Arc<dyn LlmProvider>) -> Self {
        Self { blobs, llm }
    }

    /// Load, parse and extract one message.
    ///
    /// Fails only when the blob cannot be read or the bytes do not parse as
    /// a message. An empty body with no PDF gives zero candidates.
    pub async fn extract(&self, message: &InboundMessage) -> Result<ExtractionResult, StageError> {
        let raw = self.blobs.get(&message.blob_key).await.map_err(|e| {
            StageError::Extraction(format!("cannot read blob {}: {e}", message.blob_key))
        })?;

        let parsed = MessageParser::default()
            .parse(&raw[..])
            .ok_or_else(|| StageError::Extraction("message could not be parsed".into()))?;

        let sender_address = parsed
            .from()
            .and_then(|addr| addr.first())
            .and_then(|a| a.address())
            .map(|s| s.trim().to_string())
            .or_else(|| message.sender.as_deref().and_then(first_address))
            .unwrap_or_default();
        let sender_domain = domain_of(&sender_address);

        let recipient_address = extract_addresses(parsed.to())
            .into_iter()
            .next()
            .or_else(|| message.recipient.as_deref().and_then(first_address))
            .unwrap_or_default();

        let subject = parsed
            .subject()
            .map(|s| s.trim().to_string())
            .or_else(|| message.subject.clone())
            .unwrap_or_default();

        let body_text = if let Some(text) = parsed.body_text(0) {
            text.to_string()
        } else if let Some(html) = parsed.body_html(0) {
            strip_html(html.as_ref())
        } else {
            String::new()
        };

        let pdfs: Vec<(String, Vec<u8>)> = parsed
            .attachments()
            .filter_map(|part| {
                let part: &mail_parser::MessagePart = part;
                let name = MimeHeaders::attachment_name(part).unwrap_or("").to_string();
                let is_pdf = MimeHeaders::content_type(part)
                    .is_some_and(|ct| {
                        ct.ctype().eq_ignore_ascii_case("application")
                            && ct.subtype().is_some_and(|s| s.eq_ignore_ascii_case("pdf"))
                    })
                    || name.to_ascii_lowercase().ends_with(".pdf");
                is_pdf.then(|| (name, part.contents().to_vec()))
            })
            .collect();

        if body_text.trim().is_empty() && pdfs.is_empty() {
            debug!(message_id = %message.id, "Message has no body text and no PDF attachments");
        }

        info!(
            message_id = %message.id,
            sender = %sender_address,
            recipient = %recipient_address,
            attachments = pdfs.len(),
            "Extracting message"
        );

        let mut invoices: Vec<InvoiceCandidate> = Vec::new();
        let mut po_numbers: Vec<String> = Vec::new();
        let mut supplier_name: Option<String> = None;
        let mut attachments = Vec::with_capacity(pdfs.len());

        for (filename, bytes) in pdfs {
            match self.extract_document(bytes).await {
                Ok(fields) => {
                    debug!(
                        message_id = %message.id,
                        filename = %filename,
                        invoice_numbers = ?fields.invoice_numbers,
                        po_numbers = ?fields.po_numbers,
                        "Attachment extracted"
                    );
                    attachments.push(AttachmentSummary {
                        filename,
                        invoice_numbers: fields.invoice_numbers.len(),
                        error: None,
                    });
                    if supplier_name.is_none() {
                        supplier_name = fields
                            .supplier_name
                            .as_deref()
                            .map(str::trim)
                            .filter(|s| !s.is_empty() && !s.eq_ignore_ascii_case("null"))
                            .map(String::from);
                    }
                    for candidate in candidates_from(&fields) {
                        push_candidate(&mut invoices, candidate);
                    }
                    for po in fields.po_numbers {
                        push_unique(&mut po_numbers, po);
                    }
                }
                Err(e) => {
                    warn!(
                        message_id = %message.id,
                        filename = %filename,
                        error = %e,
                        "Attachment extraction failed, continuing with body only"
                    );
                    attachments.push(AttachmentSummary {
                        filename,
                        invoice_numbers: 0,
                        error: Some(e.to_string()),
                    });
                }
            }
        }

        if invoices.is_empty() {
            debug!(message_id = %message.id, "No invoice numbers from attachments, scanning body");
            for number in body_invoice_numbers(&body_text) {
                push_candidate(&mut invoices, InvoiceCandidate::number_only(number));
            }
        }
        if po_numbers.is_empty() {
            for po in body_po_numbers(&body_text) {
                push_unique(&mut po_numbers, po);
            }
        }

        info!(
            message_id = %message.id,
            invoices = invoices.len(),
            po_numbers = po_numbers.len(),
            "Extraction complete"
        );

        Ok(ExtractionResult {
            sender_address,
            sender_domain,
            recipient_address,
            subject,
            supplier_name,
            invoices,
            po_numbers,
            body_text,
            attachments,
        })
    }

    async fn extract_document(&self, pdf: Vec<u8>) -> Result<DocumentFields, LlmError> {
        let request = CompletionRequest::new(vec![ChatMessage::user_with_pdf(pdf, ATTACHMENT_PROMPT)])
            .with_max_tokens(ATTACHMENT_MAX_TOKENS)
            .with_temperature(0.0);
        let response = self.llm.complete(request).await?;
        parse_json_object(&response.content).map_err(|e| LlmError::InvalidResponse {
            provider: self.llm.model_name().to_string(),
            reason: format!("attachment fields: {e}"),
        })
    }
}

/// Invoice numbers found in free text, first-seen order, no duplicates.
pub fn body_invoice_numbers(body: &str) -> Vec<String> {
    let mut found = Vec::new();
    for m in BODY_INVOICE.find_iter(body) {
        push_unique(&mut found, m.as_str().to_string());
    }
    found
}

/// PO numbers found in free text, first-seen order, no duplicates.
pub fn body_po_numbers(body: &str) -> Vec<String> {
    let mut found = Vec::new();
    for caps in BODY_PO.captures_iter(body) {
        if let Some(m) = caps.get(1) {
            push_unique(&mut found, m.as_str().to_string());
        }
    }
    found
}

/// Amount, currency and date only belong to a candidate when the document
/// names exactly one invoice.
fn candidates_from(fields: &DocumentFields) -> Vec<InvoiceCandidate> {
    let numbers: Vec<&str> = fields
        .invoice_numbers
        .iter()
        .map(|n| n.trim())
        .filter(|n| !n.is_empty())
        .collect();

    if let [number] = numbers.as_slice() {
        return vec![InvoiceCandidate {
            invoice_number: (*number).to_string(),
            po_number: fields.po_numbers.first().cloned(),
            amount: fields.total_amount.as_ref().and_then(parse_amount),
            currency: non_null(fields.currency.as_deref()),
            date: non_null(fields.invoice_date.as_deref()),
        }];
    }

    numbers
        .into_iter()
        .map(InvoiceCandidate::number_only)
        .collect()
}

fn non_null(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|s| !s.is_empty() && !s.eq_ignore_ascii_case("null"))
        .map(String::from)
}

/// Accepts numbers or strings such as `"$12,450.00"`.
fn parse_amount(value: &serde_json::Value) -> Option<Decimal> {
    match value {
        serde_json::Value::Number(n) => Decimal::from_str(&n.to_string()).ok(),
        serde_json::Value::String(s) => {
            let cleaned: String = s
                .chars()
                .filter(|c| c.is_ascii_digit() || *c == '.' || *c == '-')
                .collect();
            if cleaned.is_empty() {
                None
            } else {
                Decimal::from_str(&cleaned).ok()
            }
        }
        _ => None,
    }
}

fn push_candidate(candidates: &mut Vec<InvoiceCandidate>, candidate: InvoiceCandidate) {
    if !candidates
        .iter()
        .any(|c| c.invoice_number == candidate.invoice_number)
    {
        candidates.push(candidate);
    }
}

fn push_unique(values: &mut Vec<String>, value: String) {
    let value = value.trim().to_string();
    if !value.is_empty() && !values.contains(&value) {
        values.push(value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use async_trait::async_trait;
    use chrono::Utc;
    use rust_decimal_macros::dec;

    use crate::error::BlobError;
    use crate::llm::{CompletionResponse, FinishReason};

    struct MemoryBlobs(HashMap<String, Vec<u8>>);

    #[async_trait]
    impl BlobStore for MemoryBlobs {
        async fn get(&self, key: &str) -> Result<Vec<u8>, BlobError> {
            self.0
                .get(key)
                .cloned()
                .ok_or_else(|| BlobError::NotFound(key.to_string()))
        }
    }

    /// Returns a canned reply, or an error when `reply` is None.
    struct CannedLlm {
        reply: Option<String>,
    }

    #[async_trait]
    impl LlmProvider for CannedLlm {
        fn model_name(&self) -> &str {
            "canned"
        }

        async fn complete(&self, _request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
            match &self.reply {
                Some(content) => Ok(CompletionResponse {
                    content: content.clone(),
                    input_tokens: 0,
                    output_tokens: 0,
                    finish_reason: FinishReason::Stop,
                }),
                None => Err(LlmError::RequestFailed {
                    provider: "canned".into(),
                    reason: "HTTP 500: boom".into(),
                }),
            }
        }
    }

    fn message(blob_key: &str) -> InboundMessage {
        InboundMessage {
            id: "msg-1".into(),
            blob_key: blob_key.into(),
            sender: None,
            recipient: Some("ap-fallback@corp.com".into()),
            subject: None,
            received_at: Utc::now(),
        }
    }

    fn stage(blobs: &[(&str, &str)], reply: Option<&str>) -> ExtractionStage {
        let blobs = blobs
            .iter()
            .map(|(k, v)| (k.to_string(), v.as_bytes().to_vec()))
            .collect();
        ExtractionStage::new(
            Arc::new(MemoryBlobs(blobs)),
            Arc::new(CannedLlm {
                reply: reply.map(String::from),
            }),
        )
    }

    const PLAIN: &str = "From: \"Acme Billing\" <Billing@Acme.com>\r\n\
To: invoices@corp.com\r\n\
Subject: Invoices INV-1001 and INV-1002\r\n\
Content-Type: text/plain\r\n\
\r\n\
Please pay INV-1001 and INV-1002 (PO# 4500012345).\r\n\
Reminder: INV-1001 is the earlier one.\r\n";

    const WITH_PDF: &str = "From: billing@acme.com\r\n\
To: invoices@corp.com\r\n\
Subject: Invoice attached\r\n\
MIME-Version: 1.0\r\n\
Content-Type: multipart/mixed; boundary=\"b1\"\r\n\
\r\n\
--b1\r\n\
Content-Type: text/plain\r\n\
\r\n\
See attached. Body mentions ABC-999 which should be ignored.\r\n\
--b1\r\n\
Content-Type: application/pdf; name=\"inv.pdf\"\r\n\
Content-Disposition: attachment; filename=\"inv.pdf\"\r\n\
Content-Transfer-Encoding: base64\r\n\
\r\n\
JVBERi0xLjQK\r\n\
--b1--\r\n";

    #[tokio::test]
    async fn body_fallback_preserves_first_seen_order() {
        let stage = stage(&[("a.eml", PLAIN)], None);
        let result = stage.extract(&message("a.eml")).await.unwrap();

        assert_eq!(result.sender_address, "Billing@Acme.com");
        assert_eq!(result.sender_domain, "acme.com");
        assert_eq!(result.recipient_address, "invoices@corp.com");
        assert_eq!(result.subject, "Invoices INV-1001 and INV-1002");
        let numbers: Vec<_> = result.invoices.iter().map(|c| c.invoice_number.as_str()).collect();
        assert_eq!(numbers, vec!["INV-1001", "INV-1002"]);
        assert_eq!(result.po_numbers, vec!["4500012345"]);
        assert!(result.attachments.is_empty());
    }

    #[tokio::test]
    async fn pdf_fields_become_candidate() {
        let reply = r#"```json
{"invoice_numbers": ["INV-458921"], "po_numbers": ["PO-77"], "supplier_name": "Acme Industrial",
 "invoice_date": "2026-09-30", "total_amount": "$12,450.00", "currency": "USD"}
```"#;
        let stage = stage(&[("b.eml", WITH_PDF)], Some(reply));
        let result = stage.extract(&message("b.eml")).await.unwrap();

        assert_eq!(result.invoices.len(), 1);
        let candidate = &result.invoices[0];
        assert_eq!(candidate.invoice_number, "INV-458921");
        assert_eq!(candidate.amount, Some(dec!(12450.00)));
        assert_eq!(candidate.currency.as_deref(), Some("USD"));
        assert_eq!(candidate.po_number.as_deref(), Some("PO-77"));
        assert_eq!(result.supplier_name.as_deref(), Some("Acme Industrial"));
        assert_eq!(result.attachments.len(), 1);
        assert_eq!(result.attachments[0].invoice_numbers, 1);
    }

    #[tokio::test]
    async fn failed_attachment_degrades_to_body() {
        let stage = stage(&[("b.eml", WITH_PDF)], None);
        let result = stage.extract(&message("b.eml")).await.unwrap();

        assert_eq!(result.invoices.len(), 1);
        assert_eq!(result.invoices[0].invoice_number, "ABC-999");
        assert!(result.attachments[0].error.is_some());
    }

    #[tokio::test]
    async fn missing_blob_is_extraction_error() {
        let stage = stage(&[], None);
        let err = stage.extract(&message("missing.eml")).await.unwrap_err();
        assert!(matches!(err, StageError::Extraction(_)));
        assert!(err.to_string().starts_with("ExtractionError"));
    }

    #[tokio::test]
    async fn empty_body_yields_zero_candidates() {
        let subject_only = "From: billing@acme.com\r\nTo: invoices@corp.com\r\nSubject: Invoice INV-9\r\n\r\n";
        let spreadsheet_only = "From: billing@acme.com\r\n\
To: invoices@corp.com\r\n\
Subject: Statement\r\n\
MIME-Version: 1.0\r\n\
Content-Type: multipart/mixed; boundary=\"b2\"\r\n\
\r\n\
--b2\r\n\
Content-Type: text/csv; name=\"lines.csv\"\r\n\
Content-Disposition: attachment; filename=\"lines.csv\"\r\n\
\r\n\
line,amount\r\n\
--b2--\r\n";
        let stage = stage(&[("d.eml", subject_only), ("e.eml", spreadsheet_only)], None);

        let result = stage.extract(&message("d.eml")).await.unwrap();
        assert_eq!(result.subject, "Invoice INV-9");
        assert_eq!(result.sender_domain, "acme.com");
        assert!(result.body_text.trim().is_empty());
        assert!(result.invoices.is_empty());

        let result = stage.extract(&message("e.eml")).await.unwrap();
        assert!(result.invoices.is_empty());
        assert!(result.attachments.is_empty());
    }

    #[tokio::test]
    async fn envelope_recipient_is_fallback() {
        let raw = "From: a@vendor.io\r\nSubject: hello\r\n\r\nNo numbers here.\r\n";
        let stage = stage(&[("c.eml", raw)], None);
        let result = stage.extract(&message("c.eml")).await.unwrap();
        assert_eq!(result.recipient_address, "ap-fallback@corp.com");
        assert!(result.invoices.is_empty());
    }

    #[test]
    fn multi_invoice_document_keeps_numbers_only() {
        let fields = DocumentFields {
            invoice_numbers: vec!["INV-1".into(), " INV-2 ".into(), "".into()],
            total_amount: Some(serde_json::json!(500)),
            ..Default::default()
        };
        let candidates = candidates_from(&fields);
        assert_eq!(candidates.len(), 2);
        assert_eq!(candidates[1].invoice_number, "INV-2");
        assert!(candidates.iter().all(|c| c.amount.is_none()));
    }

    #[test]
    fn amount_parsing() {
        assert_eq!(parse_amount(&serde_json::json!(12.5)), Some(dec!(12.5)));
        assert_eq!(parse_amount(&serde_json::json!("EUR 1,000.10")), Some(dec!(1000.10)));
        assert_eq!(parse_amount(&serde_json::json!("null")), None);
        assert_eq!(parse_amount(&serde_json::Value::Null), None);
    }

    #[test]
    fn body_regexes() {
        assert_eq!(
            body_invoice_numbers("see INV-458921, CR-1234 and A-12345, INV-458921"),
            vec!["INV-458921", "CR-1234"]
        );
        assert_eq!(
            body_po_numbers("P.O. # 12345 and PO 678901, PO#1234"),
            vec!["12345", "678901"]
        );
    }
}
