//! Anthropic Messages API client.

use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::debug;

use crate::error::LlmError;
use crate::llm::provider::{
    ChatMessage, CompletionRequest, CompletionResponse, ContentBlock, FinishReason, LlmProvider,
};
use crate::llm::retry::{RetryPolicy, with_retry};

const PROVIDER: &str = "anthropic";
const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const API_VERSION: &str = "2023-06-01";

pub struct AnthropicProvider {
    client: reqwest::Client,
    api_key: SecretString,
    model: String,
    base_url: String,
    retry: RetryPolicy,
}

impl AnthropicProvider {
    pub fn new(api_key: SecretString, model: impl Into<String>) -> Result<Self, LlmError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| LlmError::RequestFailed {
                provider: PROVIDER.into(),
                reason: format!("Failed to build HTTP client: {e}"),
            })?;
        Ok(Self {
            client,
            api_key,
            model: model.into(),
            base_url: DEFAULT_BASE_URL.into(),
            retry: RetryPolicy::default(),
        })
    }

    /// Point the client at a different endpoint (proxies, tests).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    async fn send_once(&self, body: &Value) -> Result<CompletionResponse, LlmError> {
        let response = self
            .client
            .post(format!("{}/v1/messages", self.base_url.trim_end_matches('/')))
            .header("x-api-key", self.api_key.expose_secret())
            .header("anthropic-version", API_VERSION)
            .json(body)
            .send()
            .await
            .map_err(|e| LlmError::RequestFailed {
                provider: PROVIDER.into(),
                reason: format!("transport: {e}"),
            })?;

        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_secs);
            return Err(LlmError::RateLimited {
                provider: PROVIDER.into(),
                retry_after,
            });
        }
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN
        {
            return Err(LlmError::AuthFailed {
                provider: PROVIDER.into(),
            });
        }
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let preview: String = text.chars().take(300).collect();
            return Err(LlmError::RequestFailed {
                provider: PROVIDER.into(),
                reason: format!("HTTP {}: {preview}", status.as_u16()),
            });
        }

        let parsed: MessagesResponse =
            response
                .json()
                .await
                .map_err(|e| LlmError::InvalidResponse {
                    provider: PROVIDER.into(),
                    reason: format!("undecodable body: {e}"),
                })?;
        Ok(parsed.into_completion())
    }
}

#[async_trait]
impl LlmProvider for AnthropicProvider {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete(
        &self,
        request: CompletionRequest,
    ) -> Result<CompletionResponse, LlmError> {
        let body = build_request_body(&self.model, &request);
        let response = with_retry(self.retry, || self.send_once(&body)).await?;
        debug!(
            model = %self.model,
            input_tokens = response.input_tokens,
            output_tokens = response.output_tokens,
            "Provider call complete"
        );
        Ok(response)
    }
}

/// Build the Messages API JSON body.
fn build_request_body(model: &str, request: &CompletionRequest) -> Value {
    let messages: Vec<Value> = request.messages.iter().map(message_to_json).collect();
    let mut body = json!({
        "model": model,
        "max_tokens": request.max_tokens,
        "messages": messages,
    });
    if let Some(system) = &request.system {
        body["system"] = Value::String(system.clone());
    }
    if let Some(temperature) = request.temperature {
        body["temperature"] = json!(temperature);
    }
    body
}

fn message_to_json(message: &ChatMessage) -> Value {
    let content: Vec<Value> = message
        .content
        .iter()
        .map(|block| match block {
            ContentBlock::Text(text) => json!({"type": "text", "text": text}),
            ContentBlock::Document { media_type, data } => json!({
                "type": "document",
                "source": {
                    "type": "base64",
                    "media_type": media_type,
                    "data": BASE64.encode(data),
                },
            }),
        })
        .collect();
    json!({"role": message.role, "content": content})
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ResponseBlock>,
    #[serde(default)]
    stop_reason: Option<String>,
    #[serde(default)]
    usage: Usage,
}

#[derive(Debug, Deserialize)]
struct ResponseBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: String,
}

#[derive(Debug, Default, Deserialize)]
struct Usage {
    #[serde(default)]
    input_tokens: u32,
    #[serde(default)]
    output_tokens: u32,
}

impl MessagesResponse {
    fn into_completion(self) -> CompletionResponse {
        let content = self
            .content
            .into_iter()
            .filter(|b| b.kind == "text")
            .map(|b| b.text)
            .collect::<Vec<_>>()
            .join("");
        let finish_reason = match self.stop_reason.as_deref() {
            Some("end_turn") | Some("stop_sequence") => FinishReason::Stop,
            Some("max_tokens") => FinishReason::Length,
            _ => FinishReason::Other,
        };
        CompletionResponse {
            content,
            input_tokens: self.usage.input_tokens,
            output_tokens: self.usage.output_tokens,
            finish_reason,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_body_encodes_pdf_as_base64_document() {
        let request = CompletionRequest::new(vec![ChatMessage::user_with_pdf(
            b"%PDF-1.4".to_vec(),
            "Extract invoice numbers",
        )])
        .with_max_tokens(2000);
        let body = build_request_body("test-model", &request);

        assert_eq!(body["model"], "test-model");
        assert_eq!(body["max_tokens"], 2000);
        let content = &body["messages"][0]["content"];
        assert_eq!(body["messages"][0]["role"], "user");
        assert_eq!(content[0]["type"], "document");
        assert_eq!(content[0]["source"]["media_type"], "application/pdf");
        assert_eq!(content[0]["source"]["data"], BASE64.encode(b"%PDF-1.4"));
        assert_eq!(content[1]["text"], "Extract invoice numbers");
    }

    #[test]
    fn request_body_includes_optional_fields_only_when_set() {
        let plain = build_request_body("m", &CompletionRequest::new(vec![ChatMessage::user("hi")]));
        assert!(plain.get("system").is_none());
        assert!(plain.get("temperature").is_none());

        let full = build_request_body(
            "m",
            &CompletionRequest::new(vec![ChatMessage::user("hi")])
                .with_system("be terse")
                .with_temperature(0.0),
        );
        assert_eq!(full["system"], "be terse");
        assert!(full["temperature"].is_number());
    }

    #[test]
    fn response_joins_text_blocks() {
        let raw = r#"{
            "content": [
                {"type": "text", "text": "{\"intent_code\": "},
                {"type": "text", "text": "\"INV\"}"}
            ],
            "stop_reason": "end_turn",
            "usage": {"input_tokens": 12, "output_tokens": 5}
        }"#;
        let parsed: MessagesResponse = serde_json::from_str(raw).unwrap();
        let completion = parsed.into_completion();
        assert_eq!(completion.content, r#"{"intent_code": "INV"}"#);
        assert_eq!(completion.finish_reason, FinishReason::Stop);
        assert_eq!(completion.input_tokens, 12);
    }

    #[test]
    fn provider_reports_model_name() {
        let provider =
            AnthropicProvider::new(SecretString::from("sk-test"), "claude-test").unwrap();
        assert_eq!(provider.model_name(), "claude-test");
    }
}
