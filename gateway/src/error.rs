//! Error translation layer: maps upstream/transport failures
//! into caller-actionable `{error:{message,type,details?}}` bodies, and
//! the context-overflow regex battery.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use serde_json::Value;

#[derive(Debug, Clone, Serialize)]
pub struct GatewayError {
    #[serde(skip)]
    pub status: u16,
    #[serde(rename = "type")]
    pub error_type: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl GatewayError {
    pub fn new(status: u16, error_type: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            error_type,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn json_parse_error() -> Self {
        Self::new(
            400,
            "json_parse_error",
            "Failed to parse JSON body. Please ensure your request is valid JSON.",
        )
    }

    pub fn rate_limit_exceeded(message: impl Into<String>) -> Self {
        Self::new(429, "rate_limit_exceeded", message)
    }

    pub fn context_overflow(original: impl Into<String>) -> Self {
        Self::new(
            503,
            "context_overflow",
            "Context overflow: prompt too large for the model. Try /reset (or /new) to start a fresh session, or use a larger-context model.",
        )
        .with_details(serde_json::json!({ "original_error": original.into() }))
    }

    pub fn upstream_error(original_status: u16, message: impl Into<String>) -> Self {
        Self::new(502, "upstream_error", message).with_details(serde_json::json!({
            "original_status": original_status
        }))
    }

    pub fn timeout() -> Self {
        Self::new(504, "timeout", "Upstream request timed out")
    }

    pub fn service_unavailable(message: impl Into<String>) -> Self {
        Self::new(503, "service_unavailable", message)
    }

    pub fn internal_error(message: impl Into<String>) -> Self {
        Self::new(500, "internal_error", message)
    }

    pub fn all_providers_failed(last_error: GatewayError) -> Self {
        Self::new(502, "all_providers_failed", "All providers in the chain failed").with_details(
            serde_json::json!({ "details": last_error }),
        )
    }

    pub fn body(&self) -> Value {
        serde_json::json!({ "error": self })
    }

    pub fn status_code(&self) -> StatusCode {
        StatusCode::from_u16(self.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        (self.status_code(), Json(self.body())).into_response()
    }
}

/// Case-insensitive patterns that identify an upstream 5xx as a context
/// overflow rather than a generic upstream error.
static CONTEXT_OVERFLOW_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"(?i)cannot read properties of (undefined|null).*prompt",
        r"(?i)prompt_tokens.*(undefined|null)",
        r"(?i)context (window|length).*exceeded",
        r"(?i)maximum context.*exceeded",
        r"(?i)request.*too large",
        r"(?i)prompt is too long",
        r"(?i)exceeds model context",
        r"(?i)413.*too large",
        r"(?i)request size exceeds",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("static context-overflow pattern must compile"))
    .collect()
});

pub fn is_context_overflow(message: &str) -> bool {
    CONTEXT_OVERFLOW_PATTERNS.iter().any(|re| re.is_match(message))
}

/// Translate an upstream 5xx response into a `GatewayError`, preserving
/// the original message in `details` for observability.
pub fn translate_upstream_5xx(original_status: u16, message: &str) -> GatewayError {
    if is_context_overflow(message) {
        GatewayError::context_overflow(message)
    } else {
        GatewayError::upstream_error(original_status, message.to_string())
    }
}

/// Translate a connection/DNS-failure exception message the same way a
/// 5xx body would be, defaulting to 503 when nothing matches.
pub fn translate_connection_failure(message: &str) -> GatewayError {
    if is_context_overflow(message) {
        GatewayError::context_overflow(message)
    } else {
        GatewayError::service_unavailable(message.to_string())
    }
}
