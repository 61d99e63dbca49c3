//! Stub downstream responder, present only to make the system runnable
//! without a real model provider.

use crate::config::MockDelayConfig;
use crate::openai::{ChatCompletionRequest, ChatCompletionResponse, Choice, ChatMessage, Usage};
use crate::tokenizer::{count_tokens, estimate_input, Tokenizer};
use rand::Rng;

const TEMPLATES: &[&str] = &[
    "This is a mock response. Your request has been successfully processed.",
    "I understand your request. This is a system-generated test response.",
    "Processing complete. This is a mock response from the rate limiter system.",
    "Message received. Currently using model: {model}.",
    "This is an auto-generated response for testing rate limiting functionality.",
];

/// Sleeps for a uniformly random delay, returns a canned completion, and
/// reports `prompt_tokens`/`completion_tokens` for the caller to `Record`.
pub struct StubResponder {
    delay: MockDelayConfig,
}

impl StubResponder {
    pub fn new(delay: MockDelayConfig) -> Self {
        Self { delay }
    }

    pub async fn respond(
        &self,
        request: &ChatCompletionRequest,
        tokenizer: &dyn Tokenizer,
    ) -> ChatCompletionResponse {
        let delay_secs = {
            let mut rng = rand::thread_rng();
            rng.gen_range(self.delay.min_seconds..=self.delay.max_seconds)
        };
        tokio::time::sleep(std::time::Duration::from_secs_f64(delay_secs)).await;

        let prompt_tokens = estimate_input(request, tokenizer);
        let content = generate_mock_content(request);
        let completion_tokens = count_tokens(&content, tokenizer);

        ChatCompletionResponse {
            id: format!("chatcmpl-{}", random_hex8()),
            object: "chat.completion".to_string(),
            created: chrono::Utc::now().timestamp(),
            model: request.model.clone(),
            choices: vec![Choice {
                index: 0,
                message: ChatMessage {
                    role: "assistant".to_string(),
                    content,
                },
                finish_reason: "stop".to_string(),
            }],
            usage: Usage {
                prompt_tokens,
                completion_tokens,
                total_tokens: prompt_tokens + completion_tokens,
            },
            system_fingerprint: Some("fp_mock".to_string()),
        }
    }
}

fn generate_mock_content(request: &ChatCompletionRequest) -> String {
    let mut rng = rand::thread_rng();
    let idx = rng.gen_range(0..TEMPLATES.len());
    let mut content = TEMPLATES[idx].replace("{model}", &request.model);

    if let Some(max_tokens) = request.max_tokens {
        if max_tokens > 50 {
            let repeats = max_tokens / 20;
            for _ in 0..repeats {
                content.push_str(" This is additional content to fill the response.");
            }
        }
    }

    content
}

fn random_hex8() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..8].to_string()
}
