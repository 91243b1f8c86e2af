//! Anthropic Messages API adapter
//!
//! Stateless: every call sends the whole conversation it is given. The
//! continuation loop owns the history.

use crate::AiProviderAdapter;
use async_trait::async_trait;
use dialectic_core::config::ProviderSettings;
use dialectic_core::{
    AdapterResponse, ApiKey, ChatRequest, DialecticError, FinishReason, ModelDescriptor, Result,
    Role, TokenUsage,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, instrument, warn};

const ANTHROPIC_VERSION: &str = "2023-06-01";

// Backoff when a 429 carries no retry-after header
const INITIAL_BACKOFF_SECS: u64 = 5;
const MAX_BACKOFF_SECS: u64 = 120;

#[derive(Debug, Serialize)]
struct WireMessage {
    role: &'static str,
    content: String,
}

#[derive(Debug, Serialize)]
struct WireRequest {
    model: String,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    messages: Vec<WireMessage>,
}

#[derive(Debug, Deserialize)]
struct WireResponse {
    #[serde(default)]
    content: Vec<WireContent>,
    #[serde(default)]
    stop_reason: Option<String>,
    #[serde(default)]
    usage: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct WireContent {
    #[serde(rename = "type")]
    content_type: String,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireModelList {
    data: Vec<WireModel>,
}

#[derive(Debug, Deserialize)]
struct WireModel {
    id: String,
    #[serde(default)]
    display_name: Option<String>,
}

/// Adapter for `POST /v1/messages`
#[derive(Debug, Clone)]
pub struct AnthropicAdapter {
    http: reqwest::Client,
    base_url: String,
    max_tokens: u32,
    timeout: Duration,
    rate_limit_retries: u32,
}

impl AnthropicAdapter {
    pub fn new(settings: &ProviderSettings) -> Result<Self> {
        let timeout = settings.request_timeout();
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| DialecticError::Config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http,
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            max_tokens: settings.max_tokens,
            timeout,
            rate_limit_retries: settings.rate_limit_retries,
        })
    }

    fn map_send_error(&self, e: reqwest::Error) -> DialecticError {
        if e.is_timeout() {
            DialecticError::Timeout(self.timeout.as_secs())
        } else {
            DialecticError::Provider(format!("Failed to send request: {}", e))
        }
    }
}

#[async_trait]
impl AiProviderAdapter for AnthropicAdapter {
    #[instrument(skip(self, request, api_key), fields(history_len = request.messages.len()))]
    async fn send_message(
        &self,
        request: &ChatRequest,
        model_identifier: &str,
        api_key: &ApiKey,
    ) -> Result<AdapterResponse> {
        let body = build_wire_request(request, model_identifier, self.max_tokens);
        let url = format!("{}/v1/messages", self.base_url);

        let mut retries = 0;
        let mut backoff_secs = INITIAL_BACKOFF_SECS;

        loop {
            debug!(attempt = retries + 1, "sending request to Anthropic");

            let response = self
                .http
                .post(&url)
                .header("x-api-key", api_key.expose())
                .header("anthropic-version", ANTHROPIC_VERSION)
                .json(&body)
                .send()
                .await
                .map_err(|e| self.map_send_error(e))?;

            let status = response.status();

            if status.as_u16() == 429 {
                retries += 1;
                if retries > self.rate_limit_retries {
                    let text = response.text().await.unwrap_or_default();
                    return Err(DialecticError::RateLimited(format!(
                        "still rate limited after {} retries: {}",
                        self.rate_limit_retries, text
                    )));
                }

                let wait_secs = response
                    .headers()
                    .get("retry-after")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|s| s.trim().parse::<u64>().ok())
                    .unwrap_or(backoff_secs);

                warn!(
                    wait_secs,
                    retry = retries,
                    max_retries = self.rate_limit_retries,
                    "rate limited by Anthropic, backing off"
                );
                tokio::time::sleep(Duration::from_secs(wait_secs)).await;
                backoff_secs = (backoff_secs * 2).min(MAX_BACKOFF_SECS);
                continue;
            }

            if !status.is_success() {
                let text = response.text().await.unwrap_or_default();
                return Err(classify_error(status.as_u16(), &text));
            }

            let wire: WireResponse = response.json().await.map_err(|e| {
                if e.is_timeout() {
                    DialecticError::Timeout(self.timeout.as_secs())
                } else {
                    DialecticError::Provider(format!("Failed to parse response: {}", e))
                }
            })?;

            return Ok(into_adapter_response(request, wire));
        }
    }

    async fn list_models(&self, api_key: &ApiKey) -> Result<Vec<ModelDescriptor>> {
        let response = self
            .http
            .get(format!("{}/v1/models", self.base_url))
            .header("x-api-key", api_key.expose())
            .header("anthropic-version", ANTHROPIC_VERSION)
            .send()
            .await
            .map_err(|e| self.map_send_error(e))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(classify_error(status.as_u16(), &text));
        }

        let list: WireModelList = response
            .json()
            .await
            .map_err(|e| DialecticError::Provider(format!("Failed to parse model list: {}", e)))?;

        Ok(list
            .data
            .into_iter()
            .map(|m| ModelDescriptor {
                display_name: m.display_name.unwrap_or_else(|| m.id.clone()),
                id: m.id,
            })
            .collect())
    }

    fn provider_name(&self) -> &str {
        "anthropic"
    }
}

/// System turns move to the top-level `system` field; the API only accepts
/// user and assistant turns in `messages`.
fn build_wire_request(request: &ChatRequest, model: &str, max_tokens: u32) -> WireRequest {
    let mut system = Vec::new();
    let mut messages = Vec::with_capacity(request.messages.len());

    for message in &request.messages {
        match message.role {
            Role::System => system.push(message.content.as_str()),
            Role::User => messages.push(WireMessage {
                role: "user",
                content: message.content.clone(),
            }),
            Role::Assistant => messages.push(WireMessage {
                role: "assistant",
                content: message.content.clone(),
            }),
        }
    }

    WireRequest {
        model: model.to_string(),
        max_tokens,
        system: (!system.is_empty()).then(|| system.join("\n\n")),
        messages,
    }
}

fn map_stop_reason(reason: &str) -> FinishReason {
    match reason {
        "end_turn" | "stop_sequence" => FinishReason::Stop,
        "max_tokens" => FinishReason::MaxTokens,
        "tool_use" => FinishReason::ToolCalls,
        other => FinishReason::Other(other.to_string()),
    }
}

fn into_adapter_response(request: &ChatRequest, wire: WireResponse) -> AdapterResponse {
    let content: String = wire
        .content
        .iter()
        .filter(|block| block.content_type == "text")
        .filter_map(|block| block.text.as_deref())
        .collect();

    let finish_reason = wire.stop_reason.as_deref().map(map_stop_reason);
    let mut response = AdapterResponse::assistant(request, content, finish_reason);
    response.token_usage = wire.usage.as_ref().map(usage_from_wire);
    response
}

/// Reads token counts leniently; a missing, null or non-integer count is zero
fn usage_from_wire(usage: &serde_json::Value) -> TokenUsage {
    let count = |field: &str| match usage.get(field) {
        Some(value) => value.as_u64().unwrap_or_else(|| {
            debug!(field, %value, "malformed token count, treating as zero");
            0
        }),
        None => {
            debug!(field, "token count missing, treating as zero");
            0
        }
    };
    TokenUsage::new(count("input_tokens"), count("output_tokens"))
}

fn classify_error(status: u16, body: &str) -> DialecticError {
    let lowered = body.to_lowercase();
    if status == 400 && (lowered.contains("prompt is too long") || lowered.contains("context window")) {
        return DialecticError::ContextWindow(body.to_string());
    }
    DialecticError::Provider(format!("Anthropic API error {}: {}", status, body))
}
