//! Counter Store Adapter: a thin abstraction over the shared key-value
//! service backing the sliding-window counters. Built on the hash-map
//! operations `redis`'s async API exposes directly (`HINCRBY`, `HMGET`,
//! `HKEYS`, `HDEL`, `EXPIRE`), pipelined via `redis::pipe()` into one
//! round trip per batch.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::collections::HashMap;

/// Errors the limiter distinguishes when talking to the counter store.
/// `Transient` is retried once by the caller before surfacing; `Fatal`
/// means the store could not be reached at all (refused at startup).
#[derive(Debug)]
pub enum StoreError {
    Transient(String),
    Fatal(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Transient(msg) => write!(f, "transient store error: {msg}"),
            StoreError::Fatal(msg) => write!(f, "fatal store error: {msg}"),
        }
    }
}

impl std::error::Error for StoreError {}

enum BatchOp {
    HIncrBy { key: String, field: u64, delta: i64 },
    Expire { key: String, ttl_seconds: u64 },
}

/// One batch of `HINCRBY` / `EXPIRE` commands executed as a single
/// pipelined round trip. Not a transaction (no `MULTI`/`EXEC`): server
/// ordering is preserved, but there is no atomicity across the batch.
#[derive(Default)]
pub struct IncrBatch {
    ops: Vec<BatchOp>,
}

impl IncrBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn hincrby(&mut self, key: &str, field: u64, delta: i64) -> &mut Self {
        self.ops.push(BatchOp::HIncrBy {
            key: key.to_string(),
            field,
            delta,
        });
        self
    }

    pub fn expire(&mut self, key: &str, ttl_seconds: u64) -> &mut Self {
        self.ops.push(BatchOp::Expire {
            key: key.to_string(),
            ttl_seconds,
        });
        self
    }
}

/// Abstraction over the shared counter store. Implemented against Redis
/// in production; an in-memory fake backs unit and component tests that
/// need no live store.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Read `fields` from `key`'s hash in one round trip. Missing fields
    /// are reported as 0.
    async fn hash_multi_get(&self, key: &str, fields: &[u64]) -> Result<Vec<u64>, StoreError>;

    /// List all field names (segment indices) currently present in `key`'s
    /// hash.
    async fn hash_keys(&self, key: &str) -> Result<Vec<u64>, StoreError>;

    /// Delete `fields` from `key`'s hash in one round trip.
    async fn hash_delete(&self, key: &str, fields: &[u64]) -> Result<(), StoreError>;

    /// Execute a pre-built batch of increments/expirations as one
    /// pipelined round trip.
    async fn execute(&self, batch: IncrBatch) -> Result<(), StoreError>;

    /// Read several hashes' fields in one pipelined round trip — used by
    /// `Check` to read `used_rpm`/`used_itpm`/`used_otpm` together.
    /// Default implementation issues one `hash_multi_get` per request
    /// sequentially; `RedisCounterStore` overrides this with a real
    /// `redis::pipe()` batch.
    async fn pipelined_hash_multi_get(
        &self,
        requests: &[(&str, &[u64])],
    ) -> Result<Vec<Vec<u64>>, StoreError> {
        let mut out = Vec::with_capacity(requests.len());
        for (key, fields) in requests {
            out.push(self.hash_multi_get(key, fields).await?);
        }
        Ok(out)
    }
}

/// Redis-backed implementation over a pooled, auto-reconnecting
/// `ConnectionManager` — the idiomatic choice for a single long-lived
/// shared connection in a tokio service (this crate has no per-request
/// connection checkout/return cost).
#[derive(Clone)]
pub struct RedisCounterStore {
    conn: ConnectionManager,
}

impl RedisCounterStore {
    /// Connect to Redis at `url`. Fails fast — the caller treats a
    /// connection failure at startup as `StoreFatal` and refuses to start.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url).map_err(|e| StoreError::Fatal(e.to_string()))?;
        let conn = client
            .get_connection_manager()
            .await
            .map_err(|e| StoreError::Fatal(e.to_string()))?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn hash_multi_get(&self, key: &str, fields: &[u64]) -> Result<Vec<u64>, StoreError> {
        if fields.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        let values: Vec<Option<u64>> = conn
            .hget(key, fields)
            .await
            .map_err(|e| StoreError::Transient(e.to_string()))?;
        Ok(values.into_iter().map(|v| v.unwrap_or(0)).collect())
    }

    async fn hash_keys(&self, key: &str) -> Result<Vec<u64>, StoreError> {
        let mut conn = self.conn.clone();
        let fields: Vec<String> = conn
            .hkeys(key)
            .await
            .map_err(|e| StoreError::Transient(e.to_string()))?;
        Ok(fields.iter().filter_map(|f| f.parse().ok()).collect())
    }

    async fn pipelined_hash_multi_get(
        &self,
        requests: &[(&str, &[u64])],
    ) -> Result<Vec<Vec<u64>>, StoreError> {
        if requests.is_empty() {
            return Ok(Vec::new());
        }
        let mut pipe = redis::pipe();
        for (key, fields) in requests {
            pipe.cmd("HMGET").arg(*key).arg(*fields);
        }
        let mut conn = self.conn.clone();
        let rows: Vec<Vec<Option<u64>>> = pipe
            .query_async(&mut conn)
            .await
            .map_err(|e| StoreError::Transient(e.to_string()))?;
        Ok(rows
            .into_iter()
            .map(|row| row.into_iter().map(|v| v.unwrap_or(0)).collect())
            .collect())
    }

    async fn hash_delete(&self, key: &str, fields: &[u64]) -> Result<(), StoreError> {
        if fields.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        let _: () = conn
            .hdel(key, fields)
            .await
            .map_err(|e| StoreError::Transient(e.to_string()))?;
        Ok(())
    }

    async fn execute(&self, batch: IncrBatch) -> Result<(), StoreError> {
        let mut pipe = redis::pipe();
        for op in &batch.ops {
            match op {
                BatchOp::HIncrBy { key, field, delta } => {
                    pipe.cmd("HINCRBY").arg(key).arg(field).arg(delta).ignore();
                }
                BatchOp::Expire { key, ttl_seconds } => {
                    pipe.cmd("EXPIRE").arg(key).arg(ttl_seconds).ignore();
                }
            }
        }
        let mut conn = self.conn.clone();
        pipe.query_async::<()>(&mut conn)
            .await
            .map_err(|e| StoreError::Transient(e.to_string()))?;
        Ok(())
    }
}

/// In-process fake backing unit and component tests. Stores hashes as
/// plain maps behind a mutex — single-process, not meant to model
/// cross-node concurrency, only to exercise the `CounterStore` contract
/// without a live Redis.
#[derive(Default)]
pub struct InMemoryStore {
    hashes: tokio::sync::Mutex<HashMap<String, HashMap<u64, i64>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CounterStore for InMemoryStore {
    async fn hash_multi_get(&self, key: &str, fields: &[u64]) -> Result<Vec<u64>, StoreError> {
        let hashes = self.hashes.lock().await;
        let hash = hashes.get(key);
        Ok(fields
            .iter()
            .map(|f| hash.and_then(|h| h.get(f)).copied().unwrap_or(0).max(0) as u64)
            .collect())
    }

    async fn hash_keys(&self, key: &str) -> Result<Vec<u64>, StoreError> {
        let hashes = self.hashes.lock().await;
        Ok(hashes
            .get(key)
            .map(|h| h.keys().copied().collect())
            .unwrap_or_default())
    }

    async fn hash_delete(&self, key: &str, fields: &[u64]) -> Result<(), StoreError> {
        let mut hashes = self.hashes.lock().await;
        if let Some(hash) = hashes.get_mut(key) {
            for f in fields {
                hash.remove(f);
            }
        }
        Ok(())
    }

    async fn execute(&self, batch: IncrBatch) -> Result<(), StoreError> {
        // EXPIRE is a no-op here — the fake has no TTL semantics; limiter
        // correctness never depends on TTL promptness.
        let mut hashes = self.hashes.lock().await;
        for op in &batch.ops {
            if let BatchOp::HIncrBy { key, field, delta } = op {
                let hash = hashes.entry(key.clone()).or_default();
                *hash.entry(*field).or_insert(0) += delta;
            }
        }
        Ok(())
    }
}

/// Test double that always fails, modeling an unreachable store.
pub struct FailingStore;

#[async_trait]
impl CounterStore for FailingStore {
    async fn hash_multi_get(&self, _key: &str, _fields: &[u64]) -> Result<Vec<u64>, StoreError> {
        Err(StoreError::Transient("store unreachable".into()))
    }

    async fn hash_keys(&self, _key: &str) -> Result<Vec<u64>, StoreError> {
        Err(StoreError::Transient("store unreachable".into()))
    }

    async fn hash_delete(&self, _key: &str, _fields: &[u64]) -> Result<(), StoreError> {
        Err(StoreError::Transient("store unreachable".into()))
    }

    async fn execute(&self, _batch: IncrBatch) -> Result<(), StoreError> {
        Err(StoreError::Transient("store unreachable".into()))
    }
}
