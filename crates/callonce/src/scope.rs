//! Explicit per-operation handles that may carry a [`Cache`].
//!
//! Code deep down the call graph usually does not own the cache it should use. Instead it is
//! handed some operation handle, and asks it for the cache with [`CacheScope::cache`]. When the
//! handle carries no cache, the free [`get`] and [`forget`] functions degrade to calling the
//! computation directly.

use std::future::Future;
use std::sync::Arc;

use crate::cache::{Cache, CacheOptions};
use crate::error::CallError;
use crate::key::Lookup;

/// Something that may carry the [`Cache`] of the current operation.
pub trait CacheScope {
    /// The cache bound to this operation, if any.
    fn cache(&self) -> Option<&Cache>;
}

impl CacheScope for Cache {
    fn cache(&self) -> Option<&Cache> {
        Some(self)
    }
}

impl CacheScope for Option<Cache> {
    fn cache(&self) -> Option<&Cache> {
        self.as_ref()
    }
}

impl CacheScope for () {
    fn cache(&self) -> Option<&Cache> {
        None
    }
}

impl<S: CacheScope + ?Sized> CacheScope for &S {
    fn cache(&self) -> Option<&Cache> {
        (**self).cache()
    }
}

impl<S: CacheScope + ?Sized> CacheScope for Arc<S> {
    fn cache(&self) -> Option<&Cache> {
        (**self).cache()
    }
}

/// An operation handle.
///
/// The root scope carries no cache. Every call to [`create_scope`](Self::create_scope) derives a
/// scope for a new operation with its own, empty cache.
#[derive(Clone, Debug, Default)]
pub struct Scope {
    cache: Option<Cache>,
}

impl Scope {
    /// Creates a scope without a cache.
    pub fn root() -> Self {
        Self::default()
    }

    /// Derives a scope for a new operation, with a fresh cache configured by `options`.
    pub fn create_scope(&self, options: CacheOptions) -> Self {
        Self {
            cache: Some(Cache::with_options(options)),
        }
    }
}

impl CacheScope for Scope {
    fn cache(&self) -> Option<&Cache> {
        self.cache.as_ref()
    }
}

impl From<Cache> for Scope {
    fn from(cache: Cache) -> Self {
        Self { cache: Some(cache) }
    }
}

/// Runs `compute` through the cache of `scope`, see [`Cache::get`].
///
/// Without a cache, `compute` is awaited directly. Nothing is coalesced or cached, and no events
/// are emitted.
pub async fn get<S, T, E, F, Fut>(
    scope: &S,
    compute: F,
    lookups: &[Lookup<'_, T>],
) -> Result<T, CallError<E>>
where
    S: CacheScope + ?Sized,
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
    F: FnOnce() -> Fut + Send,
    Fut: Future<Output = Result<T, E>> + Send + 'static,
{
    match scope.cache() {
        Some(cache) => cache.get(compute, lookups).await,
        None => compute().await.map_err(CallError::Failed),
    }
}

/// Removes `lookups` from the cache of `scope`, see [`Cache::forget`].
///
/// Does nothing if `scope` has no cache.
pub fn forget<S, T>(scope: &S, lookups: &[Lookup<'_, T>])
where
    S: CacheScope + ?Sized,
{
    if let Some(cache) = scope.cache() {
        cache.forget(lookups);
    }
}
