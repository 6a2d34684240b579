//! Upstream client: one POST to `<baseUrl>/v1/chat/completions`,
//! response classification, and the request "prepare" step.

use std::{sync::Arc, time::Duration};

use chat_protocol::{ChatCompletionRequest, ChatCompletionResponse, ToolDefinition};
use reqwest::Client;
use serde_json::Value;
use tracing::warn;

use crate::{
    error::{translate_connection_failure, translate_upstream_5xx, GatewayError},
    stats::StatsRegistry,
};

pub struct UpstreamClient {
    client: Client,
    base_url: String,
    timeout: Duration,
    stats: Arc<StatsRegistry>,
}

impl UpstreamClient {
    pub fn new(base_url: String, timeout_ms: u64, stats: Arc<StatsRegistry>) -> Self {
        Self {
            client: Client::new(),
            base_url,
            timeout: Duration::from_millis(timeout_ms),
            stats,
        }
    }

    pub fn stats(&self) -> &Arc<StatsRegistry> {
        &self.stats
    }

    /// Issue one chat-completion call and classify the result
    /// `resolved_model` is the model string actually sent
    /// (post virtual-model resolution), used for usage-stat bucketing.
    pub async fn call(
        &self,
        payload: &ChatCompletionRequest,
        resolved_model: &str,
    ) -> Result<ChatCompletionResponse, GatewayError> {
        let url = format!("{}/v1/chat/completions", self.base_url.trim_end_matches('/'));

        let send = self.client.post(&url).json(payload).send();
        let response = match tokio::time::timeout(self.timeout, send).await {
            Err(_) => {
                self.stats.record_error(resolved_model);
                return Err(GatewayError::timeout());
            }
            Ok(Err(e)) => {
                self.stats.record_error(resolved_model);
                return Err(translate_connection_failure(&e.to_string()));
            }
            Ok(Ok(r)) => r,
        };

        let status = response.status().as_u16();
        let body_text = response.text().await.unwrap_or_default();

        if status == 200 {
            let parsed: ChatCompletionResponse = match serde_json::from_str(&body_text) {
                Ok(p) => p,
                Err(e) => {
                    self.stats.record_error(resolved_model);
                    return Err(GatewayError::internal_error(format!(
                        "malformed upstream 200 response: {e}"
                    )));
                }
            };
            self.stats.record_success(resolved_model, parsed.usage.as_ref());
            return Ok(parsed);
        }

        let message = extract_error_message(&body_text);

        if status == 429 {
            self.stats.record_rate_limit(resolved_model);
            return Err(GatewayError::rate_limit_exceeded(message));
        }

        if status >= 500 {
            self.stats.record_error(resolved_model);
            return Err(translate_upstream_5xx(status, &message));
        }

        self.stats.record_error(resolved_model);
        warn!(status, "upstream returned unexpected non-200 status");
        Err(GatewayError::new(502, "upstream_error", message)
            .with_details(serde_json::json!({ "original_status": status })))
    }
}

/// Prefers `extra_fields.raw_response.error.message`, then `error.message`,
/// falling back to the raw body text.
fn extract_error_message(body_text: &str) -> String {
    let Ok(value) = serde_json::from_str::<Value>(body_text) else {
        return body_text.to_string();
    };
    value
        .pointer("/extra_fields/raw_response/error/message")
        .and_then(Value::as_str)
        .or_else(|| value.pointer("/error/message").and_then(Value::as_str))
        .map(str::to_string)
        .unwrap_or(body_text.to_string())
}

/// Mutates the caller's payload into the form the upstream expects
/// ("prepare step"). `model_override` is set by the virtual-
/// model router when resolving a chain candidate; `keep_fallbacks` is
/// false on that same path, since virtual and upstream fallbacks are
/// mutually exclusive.
pub fn prepare(
    payload: &mut ChatCompletionRequest,
    tools: Vec<ToolDefinition>,
    fallbacks: &[String],
    keep_fallbacks: bool,
    model_override: Option<&str>,
) {
    payload.stream = Some(false);
    payload.stream_options = None;

    if let Some(model) = model_override {
        payload.model = model.to_string();
    }

    if keep_fallbacks && !fallbacks.is_empty() {
        payload.fallbacks = Some(
            fallbacks
                .iter()
                .map(|s| Value::String(s.clone()))
                .collect(),
        );
    } else {
        payload.fallbacks = None;
    }

    payload.tools = Some(dedup_tools(tools));

    for message in &mut payload.messages {
        if let Some(calls) = message.tool_calls.as_mut() {
            for call in calls.iter_mut() {
                call.index = None;
            }
        }
    }
}

fn dedup_tools(tools: Vec<ToolDefinition>) -> Vec<ToolDefinition> {
    let mut seen = std::collections::HashSet::new();
    tools
        .into_iter()
        .filter(|t| seen.insert(t.function.name.clone()))
        .collect()
}
