//! Attaches a fresh [`Cache`] to every inbound request.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::Response;
use callonce::{Cache, CacheOptions, CacheScope, Event, EventData, Observer, TracingObserver};
use serde::Serialize;

use crate::service::RequestService;

/// Counts the cache events of a single request.
#[derive(Debug, Default)]
struct CacheCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    dedups: AtomicU64,
}

/// A snapshot of the cache events of a single request.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub dedups: u64,
}

/// Observes the cache of one request: counts events, reports them as metrics, and optionally logs
/// them.
#[derive(Debug)]
struct RequestObserver {
    counters: Arc<CacheCounters>,
    log: Option<TracingObserver>,
}

impl Observer for RequestObserver {
    fn on(&self, event: &EventData<'_>) {
        let counter = match event.event {
            Event::Hit => &self.counters.hits,
            Event::Miss => &self.counters.misses,
            Event::Dedup => &self.counters.dedups,
        };
        counter.fetch_add(1, Ordering::Relaxed);

        metric!(
            counter("cache.events") += 1,
            "event" => event.event.as_str(),
            "key" => event.key,
        );

        if let Some(log) = &self.log {
            log.on(event);
        }
    }
}

/// The cache of the current request, as extracted from the request extensions.
#[derive(Clone, Debug)]
pub struct RequestCache {
    cache: Cache,
    counters: Arc<CacheCounters>,
}

impl RequestCache {
    fn new(log_events: bool) -> Self {
        let counters = Arc::<CacheCounters>::default();
        let observer = RequestObserver {
            counters: Arc::clone(&counters),
            log: log_events.then_some(TracingObserver),
        };
        let cache = Cache::with_options(CacheOptions::default().observer(observer));

        Self { cache, counters }
    }

    /// The cache events of this request so far.
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            dedups: self.counters.dedups.load(Ordering::Relaxed),
        }
    }
}

impl CacheScope for RequestCache {
    fn cache(&self) -> Option<&Cache> {
        Some(&self.cache)
    }
}

/// Middleware that creates the cache for a request, and reports its use once the request is done.
pub async fn attach_cache(
    State(service): State<RequestService>,
    mut request: Request,
    next: Next,
) -> Response {
    let cache = RequestCache::new(service.log_cache_events());
    request.extensions_mut().insert(cache.clone());

    let response = next.run(request).await;

    let stats = cache.stats();
    metric!(histogram("cache.computations_per_request") = stats.misses);
    metric!(histogram("cache.slots_per_request") = cache.cache.len() as u64);
    tracing::debug!(
        hits = stats.hits,
        misses = stats.misses,
        dedups = stats.dedups,
        upstream_fetches = service.directory().fetches(),
        "request cache discarded"
    );

    response
}
