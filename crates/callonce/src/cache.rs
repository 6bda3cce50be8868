//! The per-operation cache and its `get` / `forget` operations.

use std::any::type_name;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use futures::channel::oneshot;
use parking_lot::RwLock;

use crate::computation::{Admission, Computations, ErasedValue, Outcome, panic_message};
use crate::error::CallError;
use crate::events::{Event, EventData, Observer};
use crate::key::{FullKey, Lookup};

/// Options to configure a new [`Cache`].
#[derive(Clone, Default)]
pub struct CacheOptions {
    observer: Option<Arc<dyn Observer>>,
}

impl CacheOptions {
    /// Attaches an observer that is notified of every hit, miss and dedup.
    pub fn observer<O>(mut self, observer: O) -> Self
    where
        O: Observer + 'static,
    {
        self.observer = Some(Arc::new(observer));
        self
    }

    /// Attaches an observer that is shared with other caches.
    pub fn shared_observer(mut self, observer: Arc<dyn Observer>) -> Self {
        self.observer = Some(observer);
        self
    }
}

impl fmt::Debug for CacheOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheOptions")
            .field("observer", &self.observer.is_some())
            .finish()
    }
}

/// A call-coalescing cache, scoped to a single operation.
///
/// A `Cache` is a cheap handle, clones refer to the same store. It is meant to be created at the
/// start of an operation (such as an inbound request) and dropped at its end. Entries never expire
/// on their own.
#[derive(Clone, Default)]
pub struct Cache {
    inner: Arc<CacheInner>,
}

#[derive(Default)]
struct CacheInner {
    store: RwLock<HashMap<FullKey, ErasedValue>>,
    computations: Computations,
    observer: Option<Arc<dyn Observer>>,
}

impl CacheInner {
    /// Returns the first stored value among `keys`, together with its position.
    fn find(&self, keys: &[FullKey]) -> Option<(usize, ErasedValue)> {
        let store = self.store.read();
        keys.iter()
            .enumerate()
            .find_map(|(index, key)| Some((index, Arc::clone(store.get(key)?))))
    }

    /// Writes `value` into every slot of `keys` that is still vacant, except the one it was found
    /// at.
    fn backfill(&self, keys: &[FullKey], found: usize, value: &ErasedValue) {
        if keys.len() < 2 {
            return;
        }

        let mut store = self.store.write();
        for (index, key) in keys.iter().enumerate() {
            if index != found && !store.contains_key(key) {
                store.insert(key.clone(), Arc::clone(value));
            }
        }
    }

    fn insert(&self, keys: &[FullKey], value: &ErasedValue) {
        let mut store = self.store.write();
        for key in keys {
            store.insert(key.clone(), Arc::clone(value));
        }
    }

    fn emit<T>(&self, event: Event, lookup: &Lookup<'_, T>) {
        if let Some(observer) = &self.observer {
            observer.on(&EventData {
                event,
                key: lookup.key().name(),
                identifier: lookup.identifier(),
            });
        }
    }
}

impl Cache {
    /// Creates an empty cache without an observer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty cache with the given options.
    pub fn with_options(options: CacheOptions) -> Self {
        let inner = CacheInner {
            observer: options.observer,
            ..Default::default()
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    /// Returns the value stored under any of `lookups`, or computes it at most once.
    ///
    /// The lookups are checked in order, and the first stored one wins. Its value is then also
    /// written to all other vacant `lookups`, so every identifier of an entity hits from now on.
    ///
    /// If none of the lookups is stored, concurrent callers are coalesced on the first lookup:
    /// only one of them invokes `compute`, and all of them receive its outcome. A successful value
    /// is stored under every lookup, while a failure is shared but never stored. The computation
    /// is spawned on the current tokio runtime and runs to completion even if the calling future
    /// is dropped.
    ///
    /// Without any lookups, `compute` is invoked directly and nothing is cached.
    ///
    /// # Panics
    ///
    /// If `compute` panics, the panic is re-raised in every coalesced caller. The cache itself is
    /// left intact and the next call for the same lookups starts a fresh computation.
    pub async fn get<T, E, F, Fut>(
        &self,
        compute: F,
        lookups: &[Lookup<'_, T>],
    ) -> Result<T, CallError<E>>
    where
        T: Clone + Send + Sync + 'static,
        E: Clone + Send + Sync + 'static,
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let Some(first) = lookups.first() else {
            return compute().await.map_err(CallError::Failed);
        };

        let inner = &self.inner;
        let keys: Vec<FullKey> = lookups.iter().map(Lookup::full_key).collect();

        if let Some((index, value)) = inner.find(&keys) {
            inner.emit(Event::Hit, &lookups[index]);
            inner.backfill(&keys, index, &value);
            return downcast(&value, &keys[index]);
        }

        let group = match inner.computations.admit(&keys[0]) {
            Admission::Joined(channel) => {
                tracing::trace!(key = %keys[0], "joining in-flight computation");
                drop(compute);
                let outcome = channel.await;
                inner.emit(Event::Dedup, first);
                return resolve(outcome, &keys[0]);
            }
            Admission::Admitted(group) => group,
        };

        // Another caller may have stored the value while we were being admitted.
        if let Some((index, value)) = inner.find(&keys) {
            inner.emit(Event::Hit, &lookups[index]);
            inner.backfill(&keys, index, &value);
            group.resolve(Outcome::Resolved(Arc::clone(&value)));
            return downcast(&value, &keys[index]);
        }

        inner.emit(Event::Miss, first);
        tracing::trace!(key = %keys[0], "computing");

        let future = match panic::catch_unwind(AssertUnwindSafe(compute)) {
            Ok(future) => future,
            Err(payload) => {
                group.resolve(Outcome::Panicked(panic_message(&*payload)));
                panic::resume_unwind(payload);
            }
        };

        let first_key = keys[0].clone();
        let store = Arc::clone(inner);
        let channel = group.spawn(async move {
            match future.await {
                Ok(value) => {
                    let value: ErasedValue = Arc::new(value);
                    store.insert(&keys, &value);
                    Outcome::Resolved(value)
                }
                Err(error) => Outcome::Failed(Arc::new(error)),
            }
        });

        resolve(channel.await, &first_key)
    }

    /// Removes the stored values of exactly the given `lookups`.
    ///
    /// Other lookups that were backfilled with the same value are not affected, and computations
    /// that are currently in flight still store their result once they complete.
    pub fn forget<T>(&self, lookups: &[Lookup<'_, T>]) {
        if lookups.is_empty() {
            return;
        }

        let mut store = self.inner.store.write();
        for lookup in lookups {
            store.remove(&lookup.full_key());
        }
    }

    /// Returns `true` if a value is stored under `lookup`.
    pub fn contains<T>(&self, lookup: &Lookup<'_, T>) -> bool {
        self.inner.store.read().contains_key(&lookup.full_key())
    }

    /// The number of occupied slots.
    ///
    /// A value that was stored under several lookups occupies several slots.
    pub fn len(&self) -> usize {
        self.inner.store.read().len()
    }

    /// Returns `true` if nothing has been stored yet.
    pub fn is_empty(&self) -> bool {
        self.inner.store.read().is_empty()
    }
}

impl fmt::Debug for Cache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cache")
            .field("slots", &self.len())
            .field("computations", &self.inner.computations)
            .field("observer", &self.inner.observer.is_some())
            .finish()
    }
}

fn downcast<T, E>(value: &ErasedValue, key: &FullKey) -> Result<T, CallError<E>>
where
    T: Clone + 'static,
{
    match (**value).downcast_ref::<T>() {
        Some(value) => Ok(value.clone()),
        None => Err(CallError::TypeMismatch {
            key: key.to_string(),
            expected: type_name::<T>(),
        }),
    }
}

fn resolve<T, E>(
    outcome: Result<Outcome, oneshot::Canceled>,
    key: &FullKey,
) -> Result<T, CallError<E>>
where
    T: Clone + 'static,
    E: Clone + 'static,
{
    match outcome {
        Ok(Outcome::Resolved(value)) => downcast(&value, key),
        Ok(Outcome::Failed(error)) => match (*error).downcast_ref::<E>() {
            Some(error) => Err(CallError::Failed(error.clone())),
            None => Err(CallError::TypeMismatch {
                key: key.to_string(),
                expected: type_name::<E>(),
            }),
        },
        Ok(Outcome::Panicked(message)) => panic::resume_unwind(Box::new(message.to_string())),
        Err(oneshot::Canceled) => Err(CallError::Cancelled {
            key: key.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use std::convert::Infallible;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use futures::FutureExt;
    use futures::future::join_all;
    use parking_lot::Mutex;

    use crate::key::Key;

    use super::*;

    #[derive(Clone, Default)]
    struct Recorder(Arc<Mutex<Vec<(Event, String, String)>>>);

    impl Recorder {
        fn events(&self) -> Vec<(Event, String, String)> {
            self.0.lock().clone()
        }

        fn count(&self, event: Event) -> usize {
            self.0.lock().iter().filter(|(e, ..)| *e == event).count()
        }
    }

    impl Observer for Recorder {
        fn on(&self, event: &EventData<'_>) {
            self.0.lock().push((
                event.event,
                event.key.to_owned(),
                event.identifier.to_owned(),
            ));
        }
    }

    fn record(cache_events: &[(Event, &str, &str)]) -> Vec<(Event, String, String)> {
        cache_events
            .iter()
            .map(|(event, key, identifier)| (*event, key.to_string(), identifier.to_string()))
            .collect()
    }

    async fn explode() -> Result<u32, String> {
        panic!("boom")
    }

    #[tokio::test]
    async fn test_concurrent_callers_compute_once() {
        let cache = Cache::new();
        let key = Key::<String>::new("user");
        let calls = Arc::new(AtomicUsize::new(0));

        let callers = (0..10).map(|_| {
            let calls = Arc::clone(&calls);
            let cache = &cache;
            let key = &key;
            async move {
                let compute = move || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async {
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        Ok::<_, Infallible>("alice".to_owned())
                    }
                };
                cache.get(compute, &[key.lookup("1")]).await
            }
        });
        let results = join_all(callers).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        for result in results {
            assert_eq!(result.unwrap(), "alice");
        }
    }

    #[tokio::test]
    async fn test_hit_does_not_recompute() {
        let cache = Cache::new();
        let key = Key::<u32>::new("answer");
        let calls = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let calls = Arc::clone(&calls);
            let compute = move || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok::<_, Infallible>(42) }
            };
            assert_eq!(cache.get(compute, &[key.lookup("x")]).await, Ok(42));
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn test_failure_is_not_cached() {
        let cache = Cache::new();
        let key = Key::<u32>::new("answer");
        let lookups = [key.lookup("a"), key.lookup("b")];
        let calls = Arc::new(AtomicUsize::new(0));

        let failed = cache
            .get(|| async { Err::<u32, _>("upstream down") }, &lookups)
            .await;
        assert_eq!(failed, Err(CallError::Failed("upstream down")));
        assert!(cache.is_empty());

        for lookup in &lookups {
            let calls = Arc::clone(&calls);
            let compute = move || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok::<_, &str>(7) }
            };
            let succeeded = cache.get(compute, std::slice::from_ref(lookup)).await;
            assert_eq!(succeeded, Ok(7));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        let cached = cache
            .get(|| async { Ok::<_, &str>(8) }, &lookups)
            .await;
        assert_eq!(cached, Ok(7));
        assert_eq!(cache.len(), 2);
    }

    #[tokio::test]
    async fn test_failure_is_shared_with_waiters() {
        let cache = Cache::new();
        let key = Key::<u32>::new("answer");
        let calls = Arc::new(AtomicUsize::new(0));

        let callers = (0..3).map(|_| {
            let calls = Arc::clone(&calls);
            let cache = &cache;
            let key = &key;
            async move {
                let compute = move || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async {
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        Err::<u32, _>("nope".to_owned())
                    }
                };
                cache.get(compute, &[key.lookup("x")]).await
            }
        });

        for result in join_all(callers).await {
            assert_eq!(result, Err(CallError::Failed("nope".to_owned())));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_any_lookup_hits_and_backfills() {
        let cache = Cache::new();
        let key = Key::<String>::new("user");

        cache
            .get(|| async { Ok::<_, Infallible>("bob".to_owned()) }, &[key.lookup("id:1")])
            .await
            .unwrap();

        let unexpected = || async { Ok::<_, Infallible>("unexpected".to_owned()) };
        let hit = cache
            .get(unexpected, &[key.lookup("email:bob"), key.lookup("id:1")])
            .await;
        assert_eq!(hit.unwrap(), "bob");
        assert!(cache.contains(&key.lookup("email:bob")));

        let backfilled = cache.get(unexpected, &[key.lookup("email:bob")]).await;
        assert_eq!(backfilled.unwrap(), "bob");
    }

    #[tokio::test]
    async fn test_backfill_keeps_existing_slots() {
        let cache = Cache::new();
        let key = Key::<u32>::new("n");

        cache.get(|| async { Ok::<_, Infallible>(1) }, &[key.lookup("a")]).await.unwrap();
        cache.get(|| async { Ok::<_, Infallible>(2) }, &[key.lookup("b")]).await.unwrap();

        let unexpected = || async { Ok::<_, Infallible>(3) };
        let hit = cache.get(unexpected, &[key.lookup("a"), key.lookup("b")]).await;
        assert_eq!(hit, Ok(1));
        assert_eq!(cache.get(unexpected, &[key.lookup("b")]).await, Ok(2));
    }

    #[tokio::test]
    async fn test_success_is_stored_under_every_lookup() {
        let cache = Cache::new();
        let key = Key::<String>::new("user");
        let calls = Arc::new(AtomicUsize::new(0));

        let counted = |calls: Arc<AtomicUsize>| {
            move || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok::<_, Infallible>("carol".to_owned()) }
            }
        };

        let lookups = [key.lookup("id:3"), key.lookup("email:carol")];
        cache.get(counted(calls.clone()), &lookups).await.unwrap();
        cache.get(counted(calls.clone()), &[key.lookup("id:3")]).await.unwrap();
        cache.get(counted(calls.clone()), &[key.lookup("email:carol")]).await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.len(), 2);
    }

    #[tokio::test]
    async fn test_forget_only_removes_given_lookups() {
        let cache = Cache::new();
        let key = Key::<u32>::new("n");
        let calls = Arc::new(AtomicUsize::new(0));

        let counted = |calls: Arc<AtomicUsize>| {
            move || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok::<_, Infallible>(5) }
            }
        };

        let lookups = [key.lookup("a"), key.lookup("b")];
        cache.get(counted(calls.clone()), &lookups).await.unwrap();

        cache.forget(&[key.lookup("a")]);
        assert!(!cache.contains(&key.lookup("a")));
        assert!(cache.contains(&key.lookup("b")));

        cache.get(counted(calls.clone()), &[key.lookup("b")]).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        cache.get(counted(calls.clone()), &[key.lookup("a")]).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_absent_value_is_cached() {
        let cache = Cache::new();
        let key = Key::<Option<String>>::new("user");
        let calls = Arc::new(AtomicUsize::new(0));

        for _ in 0..2 {
            let calls = Arc::clone(&calls);
            let compute = move || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok::<Option<String>, Infallible>(None) }
            };
            assert_eq!(cache.get(compute, &[key.lookup("ghost")]).await, Ok(None));
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_without_lookups_always_computes() {
        let cache = Cache::new();
        let calls = Arc::new(AtomicUsize::new(0));

        for _ in 0..2 {
            let calls = Arc::clone(&calls);
            let compute = move || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok::<u32, Infallible>(1) }
            };
            cache.get(compute, &[]).await.unwrap();
        }

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_panic_does_not_poison() {
        let cache = Cache::new();
        let key = Key::<u32>::new("n");

        let panicked = AssertUnwindSafe(cache.get(explode, &[key.lookup("x")]))
            .catch_unwind()
            .await;
        let payload = panicked.unwrap_err();
        assert_eq!(payload.downcast_ref::<String>().map(String::as_str), Some("boom"));
        assert!(cache.is_empty());

        let recovered = cache
            .get(|| async { Ok::<_, String>(9) }, &[key.lookup("x")])
            .await;
        assert_eq!(recovered, Ok(9));
        assert!(cache.contains(&key.lookup("x")));
    }

    #[tokio::test]
    async fn test_synchronous_panic_does_not_poison() {
        let cache = Cache::new();
        let key = Key::<u32>::new("n");

        let compute = || -> std::future::Ready<Result<u32, String>> { panic!("eager") };
        let panicked = AssertUnwindSafe(cache.get(compute, &[key.lookup("x")]))
            .catch_unwind()
            .await;
        assert!(panicked.is_err());

        let recovered = cache
            .get(|| async { Ok::<_, String>(9) }, &[key.lookup("x")])
            .await;
        assert_eq!(recovered, Ok(9));
    }

    #[tokio::test]
    async fn test_mismatched_error_types() {
        let cache = Cache::new();
        let key = Key::<u32>::new("n");

        let lookups = [key.lookup("x")];

        let winner = cache.get(
            || async {
                tokio::time::sleep(Duration::from_millis(10)).await;
                Err::<u32, _>("text".to_owned())
            },
            &lookups,
        );
        let joiner = cache.get(|| async { Err::<u32, i32>(1) }, &lookups);

        let (winner, joiner) = futures::join!(winner, joiner);
        assert_eq!(winner, Err(CallError::Failed("text".to_owned())));
        assert!(matches!(
            joiner,
            Err(CallError::TypeMismatch { expected, .. }) if expected == type_name::<i32>()
        ));
    }

    #[tokio::test]
    async fn test_observer_sequence() {
        let recorder = Recorder::default();
        let cache = Cache::with_options(CacheOptions::default().observer(recorder.clone()));
        let key = Key::<u32>::new("n");

        let compute = || async { Ok::<_, Infallible>(1) };
        cache.get(compute, &[key.lookup("a")]).await.unwrap();
        cache.get(compute, &[key.lookup("a")]).await.unwrap();
        cache.get(compute, &[key.lookup("b")]).await.unwrap();
        cache.get(compute, &[key.lookup("b")]).await.unwrap();
        cache.get(compute, &[key.lookup("a")]).await.unwrap();

        assert_eq!(
            recorder.events(),
            record(&[
                (Event::Miss, "n", "a"),
                (Event::Hit, "n", "a"),
                (Event::Miss, "n", "b"),
                (Event::Hit, "n", "b"),
                (Event::Hit, "n", "a"),
            ])
        );
    }

    #[tokio::test]
    async fn test_hit_reports_matching_lookup() {
        let recorder = Recorder::default();
        let cache = Cache::with_options(CacheOptions::default().observer(recorder.clone()));
        let key = Key::<u32>::new("n");

        let compute = || async { Ok::<_, Infallible>(1) };
        cache.get(compute, &[key.lookup("b")]).await.unwrap();
        cache.get(compute, &[key.lookup("a"), key.lookup("b")]).await.unwrap();

        assert_eq!(
            recorder.events(),
            record(&[(Event::Miss, "n", "b"), (Event::Hit, "n", "b")])
        );
    }

    #[tokio::test]
    async fn test_dedup_once_per_waiter() {
        let recorder = Recorder::default();
        let cache = Cache::with_options(CacheOptions::default().observer(recorder.clone()));
        let key = Key::<u32>::new("n");
        let lookups = [key.lookup("x")];

        let callers = (0..5).map(|_| {
            cache.get(
                || async {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    Ok::<_, Infallible>(1)
                },
                &lookups,
            )
        });
        for result in join_all(callers).await {
            assert_eq!(result, Ok(1));
        }

        assert_eq!(recorder.count(Event::Miss), 1);
        assert_eq!(recorder.count(Event::Dedup), 4);
        assert_eq!(recorder.count(Event::Hit), 0);
    }
}
