//! Intent classification stage.
//!
//! Subject keyword rules first; otherwise the model is asked for one intent code
//! with a confidence score. Anything the model says that cannot be read as
//! a known code becomes `OTH` at confidence 0.

use std::sync::Arc;

use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::config::DEFAULT_REVIEW_THRESHOLD;
use crate::error::StageError;
use crate::llm::json::parse_json_object;
use crate::llm::{ChatMessage, CompletionRequest, LlmProvider};
use crate::pipeline::rules::RulesEngine;
use crate::pipeline::types::{
    ClassificationResult, ClassificationSource, ExtractionResult, IntentCode,
};

const CLASSIFY_MAX_TOKENS: u32 = 300;
const MAX_BODY_CHARS: usize = 12_000;

#[derive(Debug, Deserialize)]
struct ModelVerdict {
    intent_code: String,
    confidence: serde_json::Value,
    #[serde(default)]
    reasoning: Option<String>,
}

pub struct IntentClassifier {
    llm: Arc<dyn LlmProvider>,
    rules: RulesEngine,
    review_threshold: u8,
}

impl IntentClassifier {
    pub fn new(llm: Arc<dyn LlmProvider>) -> Self {
        Self {
            llm,
            rules: RulesEngine::default_rules(),
            review_threshold: DEFAULT_REVIEW_THRESHOLD,
        }
    }

    pub fn with_rules(mut self, rules: RulesEngine) -> Self {
        self.rules = rules;
        self
    }

    pub fn with_review_threshold(mut self, threshold: u8) -> Self {
        self.review_threshold = threshold.min(100);
        self
    }

    /// Classify one message. Only a failed model call is an error.
    pub async fn classify(
        &self,
        extraction: &ExtractionResult,
    ) -> Result<ClassificationResult, StageError> {
        if let Some(hit) = self.rules.evaluate(&extraction.subject, &extraction.body_text) {
            info!(intent = %hit.intent, confidence = hit.confidence, "Classified by rules");
            return Ok(ClassificationResult::new(
                hit.intent,
                i64::from(hit.confidence),
                self.review_threshold,
                hit.reason,
                ClassificationSource::Rules,
            ));
        }

        let request = CompletionRequest::new(vec![ChatMessage::user(build_prompt(extraction))])
            .with_max_tokens(CLASSIFY_MAX_TOKENS)
            .with_temperature(0.0);

        let response = self
            .llm
            .complete(request)
            .await
            .map_err(|e| StageError::ClassificationFailed(e.to_string()))?;
        debug!(raw = %response.content, "Classification response");

        let result = match parse_verdict(&response.content) {
            Some((intent, confidence, reasoning)) => ClassificationResult::new(
                intent,
                confidence,
                self.review_threshold,
                reasoning,
                ClassificationSource::Model,
            ),
            None => {
                warn!("Unreadable classification response, falling back to OTH");
                ClassificationResult::new(
                    IntentCode::Oth,
                    0,
                    self.review_threshold,
                    "parse error",
                    ClassificationSource::Fallback,
                )
            }
        };

        info!(
            intent = %result.intent_code,
            confidence = result.confidence,
            manual_review = result.manual_review_required,
            "Classified by model"
        );
        Ok(result)
    }
}

fn build_prompt(extraction: &ExtractionResult) -> String {
    let first = extraction.invoices.first();
    let amount = first
        .and_then(|c| c.amount)
        .map(|a| a.to_string())
        .unwrap_or_else(|| "None".into());
    let date = first
        .and_then(|c| c.date.clone())
        .unwrap_or_else(|| "None".into());
    let body: String = extraction.body_text.chars().take(MAX_BODY_CHARS).collect();

    format!(
        r#"Classify this supplier invoice email into ONE intent code.

Subject: {subject}
Body: {body}
Invoice data: amount={amount}, date={date}

Codes:
- INV: Supplier submitting an invoice for payment
- CRN: Credit note or credit memo
- PAY: Payment status inquiry or remittance
- DIS: Dispute, discrepancy, or complaint
- DUP: Duplicate invoice submission
- OTH: Other / unclear

Return JSON only:
{{"intent_code": "INV|CRN|PAY|DIS|DUP|OTH", "confidence": 0-100, "reasoning": "Brief explanation"}}"#,
        subject = extraction.subject,
    )
}

/// Intent, raw confidence and reasoning, or None when the reply is unusable.
fn parse_verdict(text: &str) -> Option<(IntentCode, i64, String)> {
    let verdict: ModelVerdict = parse_json_object(text).ok()?;
    let intent = IntentCode::parse(&verdict.intent_code)?;
    let confidence = match &verdict.confidence {
        serde_json::Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f.round() as i64))?,
        serde_json::Value::String(s) => s.trim().trim_end_matches('%').parse::<f64>().ok()?.round() as i64,
        _ => return None,
    };
    Some((intent, confidence, verdict.reasoning.unwrap_or_default()))
}
