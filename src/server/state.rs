//! Shared application state: `Arc<Config>` constructed once in `main`
//! and threaded through every component — no global singleton.

use crate::config::Config;
use crate::gc::{spawn_gc_worker, GcHandle};
use crate::limiter::LimiterCore;
use crate::metrics::Metrics;
use crate::registry::LimitsRegistry;
use crate::responder::StubResponder;
use crate::store::{CounterStore, RedisCounterStore};
use crate::tokenizer::TokenizerCache;
use crate::window::WindowEngine;
use anyhow::Result;
use std::sync::Arc;

/// A small multiple of expected concurrent keys — three per request
/// (rpm/itpm/otpm), sized generously against bursty traffic.
const GC_QUEUE_CAPACITY: usize = 1024;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub metrics: Metrics,
    pub registry: Arc<LimitsRegistry>,
    pub tokenizer_cache: Arc<TokenizerCache>,
    pub window: Arc<WindowEngine>,
    pub limiter: Arc<LimiterCore>,
    pub responder: Arc<StubResponder>,
    pub gc: GcHandle,
}

impl AppState {
    /// Connects to Redis. A connection failure here is `StoreFatal` — the
    /// process refuses to start rather than serve with no counter store.
    pub async fn new(config: Arc<Config>) -> Result<Self> {
        let store: Arc<dyn CounterStore> =
            Arc::new(RedisCounterStore::connect(&config.redis.connection_url()).await?);

        let metrics = Metrics::install();

        let window = Arc::new(WindowEngine::new(config.window));
        let registry = Arc::new(LimitsRegistry::from_config(&config.registry));
        let tokenizer_cache = Arc::new(TokenizerCache::new());
        let responder = Arc::new(StubResponder::new(config.mock_delay));
        let gc = spawn_gc_worker(store.clone(), window.clone(), GC_QUEUE_CAPACITY);
        let limiter = Arc::new(LimiterCore::new(store, window.clone(), gc.clone()));

        Ok(Self {
            config,
            metrics,
            registry,
            tokenizer_cache,
            window,
            limiter,
            responder,
            gc,
        })
    }
}
