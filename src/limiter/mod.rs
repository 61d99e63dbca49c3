//! Limiter Core: the check/record protocol, composing the Counter
//! Store Adapter, Segmented Window Engine, and Token Estimator.

use crate::gc::GcHandle;
use crate::registry::Limits;
use crate::store::{CounterStore, IncrBatch, StoreError};
use crate::window::WindowEngine;
use chrono::{TimeZone, Utc};
use std::sync::Arc;

fn rpm_key(api_key: &str) -> String {
    format!("rate_limit:rpm:{api_key}")
}
fn itpm_key(api_key: &str) -> String {
    format!("rate_limit:input_tpm:{api_key}")
}
fn otpm_key(api_key: &str) -> String {
    format!("rate_limit:output_tpm:{api_key}")
}

/// Per-metric `{limit, used, remaining}` snapshot.
#[derive(Debug, Clone, Copy)]
pub struct MetricSnapshot {
    pub limit: u64,
    pub used: u64,
    pub remaining: u64,
}

impl MetricSnapshot {
    fn new(limit: u64, used: u64) -> Self {
        Self {
            limit,
            used,
            remaining: limit.saturating_sub(used),
        }
    }
}

/// Immutable per-decision record of limits, current usage, and window
/// edges.
#[derive(Debug, Clone, Copy)]
pub struct BudgetSnapshot {
    pub rpm: MetricSnapshot,
    pub input_tpm: MetricSnapshot,
    pub output_tpm: MetricSnapshot,
    pub window_start: u64,
    pub window_end: u64,
}

/// `admit: bool`, snapshot, and — if rejected — `retry_after_seconds`
/// the caller should wait before retrying.
#[derive(Debug, Clone, Copy)]
pub struct Decision {
    pub admit: bool,
    pub snapshot: BudgetSnapshot,
    pub retry_after_seconds: u64,
}

/// Composes the Counter Store Adapter, Window Engine, and Token Estimator
/// into the check/record protocol.
pub struct LimiterCore {
    store: Arc<dyn CounterStore>,
    window: Arc<WindowEngine>,
    gc: GcHandle,
}

impl LimiterCore {
    pub fn new(store: Arc<dyn CounterStore>, window: Arc<WindowEngine>, gc: GcHandle) -> Self {
        Self { store, window, gc }
    }

    /// Read-only admission test. Does not reserve: between this check and
    /// the matching `record`, concurrent requests may also be admitted.
    /// Overcommit is bounded by concurrency and tolerated in exchange for
    /// lock-free operation.
    ///
    /// `input_est`/`output_res` are computed by the caller rather than
    /// here — the admission path falls back to a byte-length estimate
    /// when the real tokenizer is unavailable, and this layer doesn't
    /// need to know which source produced the numbers.
    pub async fn check(
        &self,
        api_key: &str,
        limits: Limits,
        input_est: u64,
        output_res: u64,
        now_seconds: u64,
    ) -> Result<Decision, StoreError> {
        let current_segment = self.window.current_segment(now_seconds);
        let keys = [rpm_key(api_key), itpm_key(api_key), otpm_key(api_key)];
        let key_refs: Vec<&str> = keys.iter().map(String::as_str).collect();

        let sums = self
            .window
            .window_sums(self.store.as_ref(), &key_refs, current_segment)
            .await?;
        let (used_rpm, used_itpm, used_otpm) = (sums[0], sums[1], sums[2]);

        let admit_rpm = used_rpm + 1 <= limits.rpm;
        let admit_itpm = used_itpm + input_est <= limits.input_tpm;
        let admit_otpm = used_otpm + output_res <= limits.output_tpm;
        let admit = admit_rpm && admit_itpm && admit_otpm;

        let (window_start, window_end) = self.window.window_start_end(current_segment);

        let snapshot = BudgetSnapshot {
            rpm: MetricSnapshot::new(limits.rpm, used_rpm),
            input_tpm: MetricSnapshot::new(limits.input_tpm, used_itpm),
            output_tpm: MetricSnapshot::new(limits.output_tpm, used_otpm),
            window_start,
            window_end,
        };

        let retry_after_seconds = window_end.saturating_sub(now_seconds);

        Ok(Decision {
            admit,
            snapshot,
            retry_after_seconds,
        })
    }

    /// Post-service write of actual consumption. Pipelines the three
    /// `HINCRBY`s plus their `EXPIRE`s into one round trip, then enqueues
    /// opportunistic GC on each key rather than spawning a raw task per
    /// call.
    pub async fn record(
        &self,
        api_key: &str,
        actual_input_tokens: u64,
        actual_output_tokens: u64,
        ttl_seconds: u64,
        now_seconds: u64,
    ) -> Result<(), StoreError> {
        let current_segment = self.window.current_segment(now_seconds);
        let keys = [rpm_key(api_key), itpm_key(api_key), otpm_key(api_key)];

        let mut batch = IncrBatch::new();
        batch.hincrby(&keys[0], current_segment, 1);
        batch.hincrby(&keys[1], current_segment, actual_input_tokens as i64);
        batch.hincrby(&keys[2], current_segment, actual_output_tokens as i64);
        batch.expire(&keys[0], ttl_seconds);
        batch.expire(&keys[1], ttl_seconds);
        batch.expire(&keys[2], ttl_seconds);

        self.store.execute(batch).await?;

        for key in &keys {
            self.gc.enqueue(key.clone(), current_segment);
        }

        Ok(())
    }

    /// Produces the rate-limit header set attached to every admitted and
    /// rejected response.
    pub fn headers(snapshot: &BudgetSnapshot, now_seconds: u64) -> Vec<(&'static str, String)> {
        let reset = iso8601(snapshot.window_end);
        let retry_after = snapshot.window_end.saturating_sub(now_seconds);
        let mut buf = itoa::Buffer::new();

        vec![
            (
                "X-RateLimit-Limit-Requests",
                buf.format(snapshot.rpm.limit).to_string(),
            ),
            (
                "X-RateLimit-Limit-Tokens-Input",
                buf.format(snapshot.input_tpm.limit).to_string(),
            ),
            (
                "X-RateLimit-Limit-Tokens-Output",
                buf.format(snapshot.output_tpm.limit).to_string(),
            ),
            (
                "X-RateLimit-Remaining-Requests",
                buf.format(snapshot.rpm.remaining).to_string(),
            ),
            (
                "X-RateLimit-Remaining-Tokens-Input",
                buf.format(snapshot.input_tpm.remaining).to_string(),
            ),
            (
                "X-RateLimit-Remaining-Tokens-Output",
                buf.format(snapshot.output_tpm.remaining).to_string(),
            ),
            ("X-RateLimit-Reset-Requests", reset.clone()),
            ("X-RateLimit-Reset-Tokens", reset),
            ("Retry-After", buf.format(retry_after).to_string()),
        ]
    }
}

fn iso8601(unix_seconds: u64) -> String {
    Utc.timestamp_opt(unix_seconds as i64, 0)
        .single()
        .map(|dt| dt.to_rfc3339())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WindowConfig;
    use crate::gc::spawn_gc_worker;
    use crate::openai::ChatMessage;
    use crate::store::InMemoryStore;
    use crate::tokenizer::{estimate_input, reserved_output, FixedLenTokenizer};

    fn make_limiter() -> (LimiterCore, Arc<dyn CounterStore>) {
        let store: Arc<dyn CounterStore> = Arc::new(InMemoryStore::new());
        let window = Arc::new(WindowEngine::new(WindowConfig {
            window_size_seconds: 60,
            window_segments: 12,
        }));
        let gc = spawn_gc_worker(store.clone(), window.clone(), 64);
        (LimiterCore::new(store.clone(), window, gc), store)
    }

    fn request(content: &str, max_tokens: Option<u64>) -> ChatCompletionRequest {
        ChatCompletionRequest {
            model: "gpt-3.5-turbo".to_string(),
            messages: vec![ChatMessage {
                role: "user".to_string(),
                content: content.to_string(),
            }],
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

    #[tokio::test]
    async fn test_check_admits_first_request_on_empty_store() {
        let (limiter, _store) = make_limiter();
        let limits = Limits {
            rpm: 10000,
            input_tpm: 1000,
            output_tpm: 1000,
        };
        let tok = FixedLenTokenizer;
        let req = request("Hi", None);
        let decision = limiter
            .check(
                "test-key-1",
                limits,
                estimate_input(&req, &tok),
                reserved_output(&req),
                0,
            )
            .await
            .unwrap();
        assert!(decision.admit);
        assert_eq!(decision.snapshot.rpm.remaining, 9999);
    }

    #[tokio::test]
    async fn test_record_then_check_reflects_usage() {
        let (limiter, _store) = make_limiter();
        let limits = Limits {
            rpm: 10,
            input_tpm: 10000,
            output_tpm: 10000,
        };
        let tok = FixedLenTokenizer;

        limiter.record("k", 5, 7, 120, 0).await.unwrap();
        let req = request("Hi", None);
        let decision = limiter
            .check(
                "k",
                limits,
                estimate_input(&req, &tok),
                reserved_output(&req),
                0,
            )
            .await
            .unwrap();

        assert_eq!(decision.snapshot.rpm.used, 1);
        assert_eq!(decision.snapshot.input_tpm.used, 5);
        assert_eq!(decision.snapshot.output_tpm.used, 7);
    }

    #[tokio::test]
    async fn test_check_rejects_on_itpm_with_large_message() {
        let (limiter, _store) = make_limiter();
        let limits = Limits {
            rpm: 10000,
            input_tpm: 1000,
            output_tpm: 1000,
        };
        let tok = FixedLenTokenizer;
        let huge = "x".repeat(1500);
        let req = request(&huge, None);
        let decision = limiter
            .check(
                "test-key-1",
                limits,
                estimate_input(&req, &tok),
                reserved_output(&req),
                0,
            )
            .await
            .unwrap();
        assert!(!decision.admit);
        assert_eq!(decision.snapshot.input_tpm.remaining, 0);
    }

    #[tokio::test]
    async fn test_usage_falls_out_after_full_window() {
        let (limiter, _store) = make_limiter();
        let limits = Limits {
            rpm: 10,
            input_tpm: 10000,
            output_tpm: 10000,
        };
        let tok = FixedLenTokenizer;

        limiter.record("k", 1, 1, 120, 0).await.unwrap();
        let req = request("Hi", None);
        let decision_now = limiter
            .check(
                "k",
                limits,
                estimate_input(&req, &tok),
                reserved_output(&req),
                0,
            )
            .await
            .unwrap();
        assert_eq!(decision_now.snapshot.rpm.used, 1);

        // One full window later.
        let decision_later = limiter
            .check(
                "k",
                limits,
                estimate_input(&req, &tok),
                reserved_output(&req),
                60,
            )
            .await
            .unwrap();
        assert_eq!(decision_later.snapshot.rpm.used, 0);
    }

    #[tokio::test]
    async fn test_two_concurrent_records_sum_their_increases() {
        let (limiter, _store) = make_limiter();
        let limiter = Arc::new(limiter);
        let (a, b) = (5u64, 7u64);

        let first = {
            let limiter = limiter.clone();
            tokio::spawn(async move { limiter.record("shared-key", a, b, 120, 0).await })
        };
        let second = {
            let limiter = limiter.clone();
            tokio::spawn(async move { limiter.record("shared-key", a, b, 120, 0).await })
        };
        first.await.unwrap().unwrap();
        second.await.unwrap().unwrap();

        let limits = Limits {
            rpm: 10000,
            input_tpm: 10000,
            output_tpm: 10000,
        };
        let decision = limiter.check("shared-key", limits, 0, 0, 0).await.unwrap();

        assert_eq!(decision.snapshot.rpm.used, 2);
        assert_eq!(decision.snapshot.input_tpm.used, 2 * a);
        assert_eq!(decision.snapshot.output_tpm.used, 2 * b);
    }

    #[test]
    fn test_headers_remaining_is_max_0_limit_minus_used() {
        let snapshot = BudgetSnapshot {
            rpm: MetricSnapshot::new(10, 15),
            input_tpm: MetricSnapshot::new(100, 10),
            output_tpm: MetricSnapshot::new(100, 10),
            window_start: 0,
            window_end: 60,
        };
        assert_eq!(snapshot.rpm.remaining, 0);
        let headers = LimiterCore::headers(&snapshot, 0);
        let retry_after = headers
            .iter()
            .find(|(k, _)| *k == "Retry-After")
            .unwrap()
            .1
            .clone();
        assert_eq!(retry_after, "60");
    }

    #[test]
    fn test_retry_after_zero_when_now_past_window_end() {
        let snapshot = BudgetSnapshot {
            rpm: MetricSnapshot::new(10, 1),
            input_tpm: MetricSnapshot::new(100, 1),
            output_tpm: MetricSnapshot::new(100, 1),
            window_start: 0,
            window_end: 60,
        };
        let headers = LimiterCore::headers(&snapshot, 100);
        let retry_after = headers
            .iter()
            .find(|(k, _)| *k == "Retry-After")
            .unwrap()
            .1
            .clone();
        assert_eq!(retry_after, "0");
    }
}
