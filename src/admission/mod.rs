//! Admission Handler: auth, Check, serve, Record, headers. The HTTP
//! edge (`server::run_public_server`) extracts the
//! `Authorization` header and body bytes from a `hyper::Request` and
//! hands them to [`process`], which is pure enough to unit-test without
//! any real listener.

use crate::error::GatewayError;
use crate::limiter::LimiterCore;
use crate::openai::{ChatCompletionRequest, ChatCompletionResponse, ErrorBody};
use crate::registry::LimitsRegistry;
use crate::responder::StubResponder;
use crate::store::StoreError;
use crate::tokenizer::{estimate_input, estimate_input_fallback, reserved_output, FallbackTokenizer, Tokenizer, TokenizerCache};
use std::sync::Arc;

/// Everything the admission path reads from but does not own — borrowed
/// for the lifetime of one request.
pub struct AdmissionDeps<'a> {
    pub registry: &'a LimitsRegistry,
    pub tokenizer_cache: &'a TokenizerCache,
    pub limiter: &'a LimiterCore,
    pub responder: &'a StubResponder,
    pub key_ttl_seconds: u64,
}

/// Fully rendered HTTP response: status, header pairs, JSON body.
pub struct AdmissionResponse {
    pub status: u16,
    pub headers: Vec<(&'static str, String)>,
    pub body: String,
}

impl AdmissionResponse {
    fn json(status: u16, body: impl serde::Serialize) -> Self {
        let body = serde_json::to_string(&body).unwrap_or_else(|e| {
            tracing::error!("admission: {}", GatewayError::Internal(e.to_string()));
            "{}".to_string()
        });
        Self {
            status,
            headers: Vec::new(),
            body,
        }
    }
}

/// Maps a [`GatewayError`] to its HTTP status and body. `QuotaExceeded`
/// and `TokenizerError` are never routed through here — both need
/// context (a header snapshot, a fallback estimate) that only their own
/// call sites have.
fn error_response(err: GatewayError) -> AdmissionResponse {
    match &err {
        GatewayError::Auth(msg) => AdmissionResponse::json(401, ErrorBody::invalid_request(msg.clone())),
        GatewayError::BadRequest(msg) => AdmissionResponse::json(400, ErrorBody::invalid_request(msg.clone())),
        GatewayError::StoreTransient(_) | GatewayError::StoreFatal(_) => {
            let kind = if matches!(err, GatewayError::StoreFatal(_)) { "fatal" } else { "transient" };
            metrics::counter!("admission_store_errors_total", "kind" => kind).increment(1);
            metrics::counter!("admission_requests_total", "outcome" => "store_error").increment(1);
            tracing::error!("admission: store error, error={}", err);
            let mut resp = AdmissionResponse::json(503, ErrorBody::invalid_request("service temporarily unavailable"));
            resp.headers.push(("Retry-After", "1".to_string()));
            resp
        }
        GatewayError::QuotaExceeded | GatewayError::TokenizerError(_) | GatewayError::Internal(_) => {
            tracing::error!("admission: unexpected error path, error={}", err);
            AdmissionResponse::json(500, ErrorBody::invalid_request(err.to_string()))
        }
    }
}

fn store_error(err: StoreError) -> GatewayError {
    match err {
        StoreError::Transient(msg) => GatewayError::StoreTransient(msg),
        StoreError::Fatal(msg) => GatewayError::StoreFatal(msg),
    }
}

const UNAUTHORIZED_BODY_MSG: &str = "Invalid authorization header";
const UNKNOWN_KEY_MSG: &str = "Invalid API key";

/// Run the full Check → serve → Record pipeline for one request.
///
/// `authorization` is the raw header value (if present); `body` is the
/// raw request payload. `now_seconds` is injected so tests don't depend
/// on wall-clock time.
pub async fn process(
    deps: &AdmissionDeps<'_>,
    authorization: Option<&str>,
    body: &[u8],
    now_seconds: u64,
) -> AdmissionResponse {
    let api_key = match extract_bearer(authorization) {
        Some(k) => k,
        None => {
            metrics::counter!("admission_requests_total", "outcome" => "unauthorized")
                .increment(1);
            return error_response(GatewayError::Auth(UNAUTHORIZED_BODY_MSG.to_string()));
        }
    };

    let Some(limits) = deps.registry.lookup(api_key) else {
        metrics::counter!("admission_requests_total", "outcome" => "unauthorized").increment(1);
        return error_response(GatewayError::Auth(UNKNOWN_KEY_MSG.to_string()));
    };

    let request: ChatCompletionRequest = match serde_json::from_slice(body) {
        Ok(r) => r,
        Err(e) => {
            metrics::counter!("admission_requests_total", "outcome" => "bad_request").increment(1);
            return error_response(GatewayError::BadRequest(format!(
                "malformed request body: {e}"
            )));
        }
    };

    if request.stream == Some(true) {
        metrics::counter!("admission_requests_total", "outcome" => "bad_request").increment(1);
        return error_response(GatewayError::BadRequest(
            "streaming responses are not supported".to_string(),
        ));
    }

    let (tokenizer, input_est): (Arc<dyn Tokenizer>, u64) = match deps.tokenizer_cache.get(&request.model) {
        Ok(t) => {
            let est = estimate_input(&request, t.as_ref());
            (t, est)
        }
        Err(e) => {
            tracing::warn!("admission: {}", GatewayError::TokenizerError(e.to_string()));
            metrics::counter!("admission_tokenizer_errors_total").increment(1);
            (Arc::new(FallbackTokenizer), estimate_input_fallback(&request))
        }
    };
    let output_res = reserved_output(&request);

    let decision = match with_one_retry(|| {
        deps.limiter
            .check(api_key, limits, input_est, output_res, now_seconds)
    })
    .await
    {
        Ok(d) => d,
        Err(e) => return error_response(store_error(e)),
    };

    if !decision.admit {
        metrics::counter!("admission_decisions_total", "outcome" => "reject").increment(1);
        metrics::counter!("admission_requests_total", "outcome" => "rate_limited").increment(1);
        tracing::debug!("admission: {}", GatewayError::QuotaExceeded);
        let mut resp = AdmissionResponse::json(429, ErrorBody::rate_limit_exceeded());
        resp.headers = LimiterCore::headers(&decision.snapshot, now_seconds);
        return resp;
    }

    metrics::counter!("admission_decisions_total", "outcome" => "admit").increment(1);

    let response: ChatCompletionResponse = deps.responder.respond(&request, tokenizer.as_ref()).await;

    if let Err(e) = with_one_retry(|| {
        deps.limiter.record(
            api_key,
            response.usage.prompt_tokens,
            response.usage.completion_tokens,
            deps.key_ttl_seconds,
            now_seconds,
        )
    })
    .await
    {
        // The response has already been generated and is not discarded:
        // Record failing loses accounting, not correctness of the
        // response just served.
        tracing::warn!("admission: record failed after serving response, error={}", e);
        metrics::counter!("admission_store_errors_total", "kind" => "record").increment(1);
    }

    metrics::counter!("admission_requests_total", "outcome" => "served").increment(1);

    let mut resp = AdmissionResponse::json(200, response);
    resp.headers = LimiterCore::headers(&decision.snapshot, now_seconds);
    resp
}

fn extract_bearer(authorization: Option<&str>) -> Option<&str> {
    authorization?.strip_prefix("Bearer ").filter(|k| !k.is_empty())
}

/// Retries a transient store failure exactly once before surfacing it.
async fn with_one_retry<F, Fut, T>(mut op: F) -> Result<T, StoreError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, StoreError>>,
{
    match op().await {
        Ok(v) => Ok(v),
        Err(StoreError::Transient(_)) => op().await,
        Err(e) => Err(e),
    }
}
