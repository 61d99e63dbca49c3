//! Token Estimator: wraps the external tokenizer and turns a request
//! body into an input-token estimate plus an output-token reservation.

use crate::openai::ChatCompletionRequest;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};
use tiktoken_rs::CoreBPE;

/// Raised when a BPE encoding cannot be built for a model, and
/// `cl100k_base` itself cannot be constructed either. Never raised by
/// `encode_len` — `tiktoken-rs`'s encode call does not fail once a
/// `CoreBPE` exists.
#[derive(Debug, Clone)]
pub struct TokenizerError(pub String);

impl fmt::Display for TokenizerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for TokenizerError {}

/// Injectable tokenizer: a single-method `encode(text) -> token_count`
/// interface, so production code binds to a real BPE tokenizer while
/// tests bind to a cheap stub.
pub trait Tokenizer: Send + Sync {
    fn encode_len(&self, text: &str) -> usize;
}

/// Test double: token count is simply byte length, letting tests assert
/// exact numbers without depending on a real BPE vocabulary.
pub struct FixedLenTokenizer;

impl Tokenizer for FixedLenTokenizer {
    fn encode_len(&self, text: &str) -> usize {
        text.len()
    }
}

/// Used only when `TokenizerCache::get` fails to construct a real BPE
/// encoding — the same conservative byte-length/4 approximation as
/// `estimate_input_fallback`, exposed as a `Tokenizer` so the responder's
/// completion-token count still has something to call.
pub struct FallbackTokenizer;

impl Tokenizer for FallbackTokenizer {
    fn encode_len(&self, text: &str) -> usize {
        text.len() / 4
    }
}

/// Real tokenizer bound to one model's BPE encoding, wrapping
/// `tiktoken-rs`. Construct through `TokenizerCache` rather than
/// directly — building a `CoreBPE` is not free and should happen once
/// per distinct model name.
pub struct BpeTokenizer {
    bpe: CoreBPE,
}

impl Tokenizer for BpeTokenizer {
    fn encode_len(&self, text: &str) -> usize {
        self.bpe.encode_with_special_tokens(text).len()
    }
}

/// Caches one `BpeTokenizer` per distinct model name, avoiding rebuilding
/// a `CoreBPE` on every request when a process serves more than one
/// model.
pub struct TokenizerCache {
    cache: RwLock<HashMap<String, Arc<dyn Tokenizer>>>,
}

impl TokenizerCache {
    pub fn new() -> Self {
        Self {
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Resolve a model-specific BPE encoding, falling back to
    /// `cl100k_base` when the model is unrecognized. Errors only when
    /// `cl100k_base` itself cannot be constructed — the caller should log
    /// it and fall back to [`estimate_input_fallback`] plus
    /// [`FallbackTokenizer`], never treat it as fatal.
    pub fn get(&self, model: &str) -> Result<Arc<dyn Tokenizer>, TokenizerError> {
        if let Some(t) = self.cache.read().unwrap().get(model) {
            return Ok(t.clone());
        }

        let bpe = tiktoken_rs::get_bpe_from_model(model)
            .or_else(|_| tiktoken_rs::cl100k_base())
            .map_err(|e| TokenizerError(e.to_string()))?;

        let tokenizer: Arc<dyn Tokenizer> = Arc::new(BpeTokenizer { bpe });
        self.cache
            .write()
            .unwrap()
            .insert(model.to_string(), tokenizer.clone());
        Ok(tokenizer)
    }
}

impl Default for TokenizerCache {
    fn default() -> Self {
        Self::new()
    }
}

/// `estimate_input(request) = Σ over messages of tokenize(role) +
/// tokenize(content) + 4, + 2` — the per-message and conversation
/// framing overhead the chat-completion wire format charges, reproduced
/// exactly.
pub fn estimate_input(request: &ChatCompletionRequest, tokenizer: &dyn Tokenizer) -> u64 {
    let mut total: u64 = 0;
    for message in &request.messages {
        total += tokenizer.encode_len(&message.role) as u64;
        total += tokenizer.encode_len(&message.content) as u64;
        total += 4;
    }
    total + 2
}

/// Fallback used when the tokenizer itself errors: conservative
/// byte-length approximation, never fatal.
pub fn estimate_input_fallback(request: &ChatCompletionRequest) -> u64 {
    let mut total: u64 = 0;
    for message in &request.messages {
        total += (message.role.len() + message.content.len()) as u64 / 4;
    }
    total
}

/// `reserved_output(request) = request.max_tokens if set else 1000`.
pub fn reserved_output(request: &ChatCompletionRequest) -> u64 {
    request.max_tokens.unwrap_or(1000)
}

/// `count_tokens(text)` — tokenizer length, used when the downstream
/// responder's completion is charged at `Record` time.
pub fn count_tokens(text: &str, tokenizer: &dyn Tokenizer) -> u64 {
    tokenizer.encode_len(text) as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::openai::ChatMessage;

    fn request(messages: Vec<(&str, &str)>, max_tokens: Option<u64>) -> ChatCompletionRequest {
        ChatCompletionRequest {
            model: "gpt-3.5-turbo".to_string(),
            messages: messages
                .into_iter()
                .map(|(role, content)| ChatMessage {
                    role: role.to_string(),
                    content: content.to_string(),
                })
                .collect(),
            max_tokens,
            temperature: None,
            top_p: None,
            n: None,
            stream: None,
            stop: None,
            presence_penalty: None,
            frequency_penalty: None,
            logit_bias: None,
            user: None,
        }
    }

    #[test]
    fn test_estimate_input_matches_formula() {
        let tok = FixedLenTokenizer;
        let req = request(vec![("user", "Hi")], None);
        // tokenize("user")=4 + tokenize("Hi")=2 + 4 + 2 = 12
        assert_eq!(estimate_input(&req, &tok), 12);
    }

    #[test]
    fn test_estimate_input_sums_across_messages() {
        let tok = FixedLenTokenizer;
        let req = request(vec![("system", "a"), ("user", "bb")], None);
        // (6+1+4) + (4+2+4) + 2 = 11 + 10 + 2 = 23
        assert_eq!(estimate_input(&req, &tok), 23);
    }

    #[test]
    fn test_estimate_input_is_deterministic() {
        let tok = FixedLenTokenizer;
        let req = request(vec![("user", "same input")], Some(10));
        assert_eq!(estimate_input(&req, &tok), estimate_input(&req, &tok));
    }

    #[test]
    fn test_reserved_output_defaults_to_1000() {
        let req = request(vec![("user", "x")], None);
        assert_eq!(reserved_output(&req), 1000);
    }

    #[test]
    fn test_reserved_output_uses_max_tokens_when_set() {
        let req = request(vec![("user", "x")], Some(42));
        assert_eq!(reserved_output(&req), 42);
    }

    #[test]
    fn test_fallback_is_conservative_byte_estimate() {
        let req = request(vec![("user", "12345678")], None);
        // (4 + 8) / 4 = 3
        assert_eq!(estimate_input_fallback(&req), 3);
    }

    #[test]
    fn test_tokenizer_cache_returns_same_model_instance() {
        let cache = TokenizerCache::new();
        let a = cache.get("gpt-3.5-turbo").unwrap();
        let b = cache.get("gpt-3.5-turbo").unwrap();
        assert_eq!(a.encode_len("hello"), b.encode_len("hello"));
    }

    #[test]
    fn test_tokenizer_cache_falls_back_for_unknown_model() {
        let cache = TokenizerCache::new();
        let t = cache.get("not-a-real-model-xyz").unwrap();
        assert!(t.encode_len("hello world") > 0);
    }

    #[test]
    fn test_fallback_tokenizer_matches_byte_div_4() {
        let t = FallbackTokenizer;
        assert_eq!(t.encode_len("12345678"), 2);
    }
}
