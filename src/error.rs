use thiserror::Error;

/// Error kinds propagated from the admission path to the HTTP edge.
///
/// Per-request errors never propagate beyond the request that raised
/// them; background GC errors are logged only and never surface as a
/// `GatewayError`.
#[derive(Error, Debug)]
pub enum GatewayError {
    /// Missing or malformed `Authorization` header, or an API key not
    /// present in the registry. No store interaction has happened yet.
    #[error("auth error: {0}")]
    Auth(String),
    /// Caller's request body failed to parse as a chat-completion request.
    #[error("bad request: {0}")]
    BadRequest(String),
    /// Checked out of budget on at least one metric. `Record` was not
    /// called.
    #[error("rate limit exceeded")]
    QuotaExceeded,
    /// The counter store failed after one retry. The limiter never
    /// admits blind when it cannot read counts.
    #[error("store transient error: {0}")]
    StoreTransient(String),
    /// The counter store could not be reached at startup.
    #[error("store fatal error: {0}")]
    StoreFatal(String),
    /// Building or running the BPE encoding failed. Never surfaced to the
    /// caller as an error response — the admission path logs it and
    /// substitutes the conservative byte-length estimate instead.
    #[error("tokenizer error: {0}")]
    TokenizerError(String),
    #[error("internal error: {0}")]
    Internal(String),
}
