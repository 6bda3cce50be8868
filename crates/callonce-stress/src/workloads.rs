use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use callonce::{CacheOptions, Key, Scope, TracingObserver};
use futures::future::join_all;
use serde::Deserialize;

static VALUE: LazyLock<Key<String>> = LazyLock::new(|| Key::new("value"));

#[derive(Debug, Deserialize)]
pub struct WorkloadsConfig {
    pub workloads: Vec<Workload>,
}

fn default_fanout() -> usize {
    8
}

fn default_identifiers() -> usize {
    1
}

fn default_cached() -> bool {
    true
}

/// A workload repeatedly runs operations, `concurrency` of them at a time.
#[derive(Clone, Debug, Deserialize)]
pub struct Workload {
    pub concurrency: usize,
    /// The number of concurrent `get` calls in every operation.
    #[serde(default = "default_fanout")]
    pub fanout: usize,
    /// The number of distinct lookups the calls of an operation are spread over.
    #[serde(default = "default_identifiers")]
    pub identifiers: usize,
    /// The time every computation takes.
    #[serde(default, with = "humantime_serde")]
    pub latency: Duration,
    /// Whether computations fail.
    #[serde(default)]
    pub fail: bool,
    /// Whether operations get a cache, or call every computation directly.
    #[serde(default = "default_cached")]
    pub cached: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Failure;

/// What a single operation did.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct OperationReport {
    /// How often a computation actually ran.
    pub computations: usize,
    /// How many `get` calls returned an error.
    pub failures: usize,
}

/// Runs one operation of `workload`, with its own cache.
pub async fn run_operation(workload: &Workload, log_events: bool) -> OperationReport {
    let computations = Arc::new(AtomicUsize::new(0));

    let scope = if workload.cached {
        let mut options = CacheOptions::default();
        if log_events {
            options = options.observer(TracingObserver);
        }
        Scope::root().create_scope(options)
    } else {
        Scope::root()
    };

    let identifiers = workload.identifiers.max(1);
    let calls = (0..workload.fanout).map(|i| {
        let identifier = (i % identifiers).to_string();
        let computations = Arc::clone(&computations);
        let latency = workload.latency;
        let fail = workload.fail;
        let scope = &scope;

        async move {
            let value = format!("value-{identifier}");
            let compute = move || {
                computations.fetch_add(1, Ordering::Relaxed);
                async move {
                    if !latency.is_zero() {
                        tokio::time::sleep(latency).await;
                    }
                    if fail { Err(Failure) } else { Ok(value) }
                }
            };
            callonce::get(scope, compute, &[VALUE.lookup(identifier)]).await
        }
    });

    let results = join_all(calls).await;
    let failures = results.iter().filter(|result| result.is_err()).count();
    tracing::trace!(failures, "operation finished");

    OperationReport {
        computations: computations.load(Ordering::Relaxed),
        failures,
    }
}
