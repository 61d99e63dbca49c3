//! OpenAI-compatible chat-completion request/response types. Only
//! `messages` and `max_tokens` are consulted by the limiter; the rest of
//! the surface is accepted and round-tripped so a client library sending
//! the full OpenAI request shape isn't rejected by a schema mismatch.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

/// Concrete, strictly-typed request body: no dynamic/duck-typed schema —
/// serde's own type-checking rejects a malformed field rather than a
/// hand-rolled validation layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub max_tokens: Option<u64>,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub top_p: Option<f64>,
    #[serde(default)]
    pub n: Option<u32>,
    #[serde(default)]
    pub stream: Option<bool>,
    #[serde(default)]
    pub stop: Option<serde_json::Value>,
    #[serde(default)]
    pub presence_penalty: Option<f64>,
    #[serde(default)]
    pub frequency_penalty: Option<f64>,
    #[serde(default)]
    pub logit_bias: Option<HashMap<String, f64>>,
    #[serde(default)]
    pub user: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Choice {
    pub index: u32,
    pub message: ChatMessage,
    pub finish_reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompletionResponse {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub model: String,
    pub choices: Vec<Choice>,
    pub usage: Usage,
    #[serde(default)]
    pub system_fingerprint: Option<String>,
}

/// `{"error": {...}}` — the shared envelope for 401, 429, and 400
/// bodies. The two error kinds don't share a field set: an
/// invalid-request error is just `{message, type}`, while a rate-limit
/// error always carries `param` (literally `null`) and `code` too. An
/// untagged enum lets each variant serialize only its own fields instead
/// of `Option`s that would either always or never appear.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorBody {
    pub error: ErrorDetail,
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum ErrorDetail {
    InvalidRequest {
        message: String,
        #[serde(rename = "type")]
        error_type: String,
    },
    RateLimit {
        message: String,
        #[serde(rename = "type")]
        error_type: String,
        param: Option<String>,
        code: String,
    },
}

impl ErrorBody {
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self {
            error: ErrorDetail::InvalidRequest {
                message: message.into(),
                error_type: "invalid_request_error".to_string(),
            },
        }
    }

    pub fn rate_limit_exceeded() -> Self {
        Self {
            error: ErrorDetail::RateLimit {
                message: "Rate limit exceeded".to_string(),
                error_type: "rate_limit_exceeded".to_string(),
                param: None,
                code: "rate_limit_exceeded".to_string(),
            },
        }
    }
}
