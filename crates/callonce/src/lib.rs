//! Request-scoped call coalescing and memoization.
//!
//! In fan-out services, a single inbound request often spawns many concurrent tasks that
//! independently load the same downstream resource. A [`Cache`] makes sure such a computation runs
//! exactly once per unique input: concurrent callers share the in-flight computation, and
//! successful results are kept for the rest of the operation.
//!
//! Unlike a plain single-flight group, results outlive the in-flight call. Unlike a global cache,
//! no eviction policy is needed, as the cache is created per operation and dropped with it.
//!
//! # Behavior
//!
//! Concurrent callers for the same [`Lookup`] share a single computation. The first caller starts
//! it, the others wait for and receive the same outcome. Successful values are stored, and later
//! calls return them without computing again. Failures are handed to every concurrent waiter but
//! are never stored, so the next call retries.
//!
//! If an operation has no cache, [`get`] simply awaits the computation.
//!
//! # Usage
//!
//! Define typed keys once, create a cache for every operation, and call [`get`] anywhere below:
//!
//! ```
//! use std::sync::LazyLock;
//!
//! use callonce::{CacheOptions, CallError, Key, Scope};
//!
//! static USER: LazyLock<Key<String>> = LazyLock::new(|| Key::new("user"));
//!
//! async fn fetch_user(id: String) -> Result<String, String> {
//!     Ok(format!("user {id}"))
//! }
//!
//! async fn load_user(scope: &Scope, id: &str) -> Result<String, CallError<String>> {
//!     let owned = id.to_owned();
//!     callonce::get(scope, || fetch_user(owned), &[USER.lookup(id)]).await
//! }
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let request = Scope::root().create_scope(CacheOptions::default());
//! assert_eq!(load_user(&request, "42").await.unwrap(), "user 42");
//! # }
//! ```
//!
//! No matter how many tasks call `load_user` with the same id within one operation, `fetch_user`
//! runs at most once.

#![warn(missing_docs)]

mod cache;
mod computation;
mod error;
mod events;
mod key;
mod scope;

pub use cache::{Cache, CacheOptions};
pub use error::CallError;
pub use events::{Event, EventData, Observer, TracingObserver};
pub use key::{Key, Lookup, lookup};
pub use scope::{CacheScope, Scope, forget, get};
