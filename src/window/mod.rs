//! Segmented Window Engine: translates wall-clock time into segment
//! indices, sums a trailing window against a `CounterHash`, and
//! garbage-collects stale segments opportunistically.

use crate::config::WindowConfig;
use crate::store::{CounterStore, StoreError};
use std::time::{SystemTime, UNIX_EPOCH};

/// Clock source injected so tests can control "now" without real sleeps.
pub trait Clock: Send + Sync {
    fn now_seconds(&self) -> u64;
}

/// Production clock: wall-clock `SystemTime`.
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_seconds(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before unix epoch")
            .as_secs()
    }
}

/// Maps clock time to segment indices and computes trailing-window sums.
pub struct WindowEngine {
    config: WindowConfig,
}

impl WindowEngine {
    pub fn new(config: WindowConfig) -> Self {
        Self { config }
    }

    pub fn segment_size(&self) -> u64 {
        self.config.segment_size_seconds()
    }

    pub fn segments_per_window(&self) -> u64 {
        self.config.window_segments
    }

    /// `current_segment() = floor(now_seconds / segment_size)`.
    pub fn current_segment(&self, now_seconds: u64) -> u64 {
        now_seconds / self.segment_size()
    }

    /// `[current − segments + 1, current]`, inclusive, `segments` fields
    /// total. Saturates at zero rather than going negative — segment
    /// indices are unsigned (unix time is never negative here).
    pub fn window_range(&self, current_segment: u64) -> Vec<u64> {
        let segments = self.segments_per_window();
        let start = current_segment.saturating_sub(segments - 1);
        (start..=current_segment).collect()
    }

    /// Wall-clock `[window_start, window_end)` for the window ending at
    /// `current_segment`. `window_end` is the exclusive open edge of the
    /// current segment, i.e. `(current + 1) * segment_size` — the
    /// segment-aligned open edge, not the precise wall-clock instant one
    /// window ago.
    pub fn window_start_end(&self, current_segment: u64) -> (u64, u64) {
        let segments = self.segments_per_window();
        let start_segment = current_segment.saturating_sub(segments - 1);
        let window_start = start_segment * self.segment_size();
        let window_end = (current_segment + 1) * self.segment_size();
        (window_start, window_end)
    }

    /// Read the `segments` fields for `hash_key` in one round trip; sum,
    /// treating missing fields as 0.
    pub async fn window_sum(
        &self,
        store: &dyn CounterStore,
        hash_key: &str,
        current_segment: u64,
    ) -> Result<u64, StoreError> {
        let fields = self.window_range(current_segment);
        let values = store.hash_multi_get(hash_key, &fields).await?;
        Ok(values.iter().sum())
    }

    /// Read the trailing-window sum for several hashes in a single
    /// pipelined round trip — used to read `used_rpm`/`used_itpm`/
    /// `used_otpm` together in one round trip.
    pub async fn window_sums(
        &self,
        store: &dyn CounterStore,
        hash_keys: &[&str],
        current_segment: u64,
    ) -> Result<Vec<u64>, StoreError> {
        let fields = self.window_range(current_segment);
        let requests: Vec<(&str, &[u64])> = hash_keys.iter().map(|k| (*k, fields.as_slice())).collect();
        let rows = store.pipelined_hash_multi_get(&requests).await?;
        Ok(rows.into_iter().map(|row| row.iter().sum()).collect())
    }

    /// Read all fields, delete any whose index falls before the current
    /// window. Correctness never depends on GC promptness — TTL bounds
    /// storage, and out-of-window fields are simply never read by
    /// `window_sum`.
    pub async fn gc(
        &self,
        store: &dyn CounterStore,
        hash_key: &str,
        current_segment: u64,
    ) -> Result<usize, StoreError> {
        let segments = self.segments_per_window();
        let floor = current_segment.saturating_sub(segments - 1);
        let fields = store.hash_keys(hash_key).await?;
        let stale: Vec<u64> = fields.into_iter().filter(|f| *f < floor).collect();
        let removed = stale.len();
        if !stale.is_empty() {
            store.hash_delete(hash_key, &stale).await?;
        }
        Ok(removed)
    }
}
