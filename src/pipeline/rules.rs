//! Pre-model keyword rules for intent classification.
//!
//! Runs before the model call to short-circuit unmistakable cases:
//! - "credit note" / "credit memo" → CRN
//! - "duplicate invoice" → DUP
//! - dispute and discrepancy wording → DIS
//! - remittance advice and payment status questions → PAY
//!
//! The default rules only look at the subject; body text is full of payment
//! terms and boilerplate and is left to the model. If the rules engine
//! returns a match, the model call is skipped entirely. Plain invoice
//! submissions are never decided here.

use std::sync::LazyLock;

use regex::Regex;
use tracing::debug;

use crate::pipeline::types::IntentCode;

/// Which field a rule matches against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleField {
    Subject,
    Content,
}

/// A single keyword rule with a compiled regex.
#[derive(Debug, Clone)]
pub struct IntentRule {
    /// Human-readable pattern description.
    pub pattern: String,
    pub regex: Regex,
    pub field: RuleField,
    pub intent: IntentCode,
    /// Confidence reported when the rule fires.
    pub confidence: u8,
    /// Why this rule triggers; becomes the classification reasoning.
    pub reason: String,
}

/// Result of a rule firing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleMatch {
    pub intent: IntentCode,
    pub confidence: u8,
    pub reason: String,
}

static DUPLICATE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(duplicate (invoice|submission|copy)|re-?submitt?(ed|ing) (the |our )?invoice)")
        .expect("valid duplicate pattern")
});

static CREDIT_NOTE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bcredit[\s-]?(note|memo)s?\b").expect("valid credit note pattern")
});

static DISPUTE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(disputed?|disputing|discrepanc(y|ies)|overcharged?|billing error)\b")
        .expect("valid dispute pattern")
});

static PAYMENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(remittance advice|payment status|status of (our|my|the) payment|when will (we|i) (be paid|receive payment)|(has|have) (this|these|the|our) invoices? been paid)",
    )
    .expect("valid payment pattern")
});

/// Pre-model rules engine.
pub struct RulesEngine {
    rules: Vec<IntentRule>,
}

impl RulesEngine {
    /// Create a rules engine with the default subject keyword rules.
    pub fn default_rules() -> Self {
        let table: [(&str, &LazyLock<Regex>, IntentCode, &str); 4] = [
            ("duplicate invoice", &DUPLICATE, IntentCode::Dup, "duplicate submission wording"),
            ("credit note/memo", &CREDIT_NOTE, IntentCode::Crn, "credit note wording"),
            ("dispute/discrepancy", &DISPUTE, IntentCode::Dis, "dispute or discrepancy wording"),
            ("remittance/payment status", &PAYMENT, IntentCode::Pay, "payment status or remittance wording"),
        ];

        let rules = table
            .iter()
            .map(|(pattern, regex, intent, reason)| IntentRule {
                pattern: (*pattern).into(),
                regex: Regex::clone(regex),
                field: RuleField::Subject,
                intent: *intent,
                confidence: 95,
                reason: format!("{reason} in subject"),
            })
            .collect();

        Self { rules }
    }

    /// Create an empty rules engine (every message goes to the model).
    pub fn empty() -> Self {
        Self { rules: Vec::new() }
    }

    /// Add a custom rule after the existing ones.
    pub fn add_rule(
        &mut self,
        pattern: &str,
        field: RuleField,
        intent: IntentCode,
        confidence: u8,
        reason: &str,
    ) -> Result<(), regex::Error> {
        self.rules.push(IntentRule {
            pattern: pattern.into(),
            regex: Regex::new(pattern)?,
            field,
            intent,
            confidence: confidence.min(100),
            reason: reason.into(),
        });
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Evaluate subject and body against all rules, first match wins.
    ///
    /// Returns `None` if no rule matches (fall through to the model).
    pub fn evaluate(&self, subject: &str, body: &str) -> Option<RuleMatch> {
        for rule in &self.rules {
            let value = match rule.field {
                RuleField::Subject => subject,
                RuleField::Content => body,
            };
            if value.is_empty() {
                continue;
            }

            if rule.regex.is_match(value) {
                debug!(
                    rule = %rule.pattern,
                    intent = %rule.intent,
                    confidence = rule.confidence,
                    "Message matched intent rule"
                );
                return Some(RuleMatch {
                    intent: rule.intent,
                    confidence: rule.confidence,
                    reason: rule.reason.clone(),
                });
            }
        }

        None
    }
}
