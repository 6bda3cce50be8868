use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::channel::oneshot;
use futures::future::{FutureExt, Shared};
use parking_lot::Mutex;
use tracing::Instrument;

use crate::key::FullKey;

/// A type-erased value, as it is held in the store and passed through computation channels.
pub(crate) type ErasedValue = Arc<dyn Any + Send + Sync>;

/// The outcome of a computation, as observed by every caller coalesced onto it.
#[derive(Clone)]
pub(crate) enum Outcome {
    /// The computation succeeded with the contained value.
    Resolved(ErasedValue),
    /// The computation returned the contained error.
    Failed(ErasedValue),
    /// The computation panicked with the contained message.
    Panicked(Arc<str>),
}

pub(crate) type ComputationChannel = Shared<oneshot::Receiver<Outcome>>;
type ComputationMap = Arc<Mutex<HashMap<FullKey, ComputationChannel>>>;

/// Keeps track of the currently running computations, by the key they are coalesced on.
#[derive(Default)]
pub(crate) struct Computations {
    channels: ComputationMap,
}

/// The result of asking to be admitted to the computation for a key.
pub(crate) enum Admission {
    /// Another caller is already computing this key, await its channel.
    Joined(ComputationChannel),
    /// This caller is the first one, and is responsible for producing the outcome.
    Admitted(Group),
}

impl Computations {
    /// Joins the running computation for `key`, or registers a new one.
    pub fn admit(&self, key: &FullKey) -> Admission {
        let mut channels = self.channels.lock();
        if let Some(channel) = channels.get(key) {
            return Admission::Joined(channel.clone());
        }

        let (sender, receiver) = oneshot::channel();
        let channel = receiver.shared();
        let evicted = channels.insert(key.clone(), channel.clone());
        debug_assert!(evicted.is_none());

        let remove_computation_token = {
            let channels = Arc::clone(&self.channels);
            let key = key.clone();
            CallOnDrop::new(move || {
                channels.lock().remove(&key);
            })
        };

        Admission::Admitted(Group {
            sender,
            channel,
            remove_computation_token,
        })
    }

    /// The number of computations currently in flight.
    pub fn len(&self) -> usize {
        self.channels.lock().len()
    }
}

/// A freshly registered computation, owned by the caller that was admitted first.
///
/// Dropping a group without resolving it evicts it from the registry, and all waiters observe a
/// cancelled channel.
pub(crate) struct Group {
    sender: oneshot::Sender<Outcome>,
    channel: ComputationChannel,
    remove_computation_token: CallOnDrop,
}

impl Group {
    /// Delivers `outcome` to all waiters without running a computation.
    pub fn resolve(self, outcome: Outcome) {
        let Group {
            sender,
            remove_computation_token,
            ..
        } = self;
        drop(remove_computation_token);
        sender.send(outcome).ok();
    }

    /// Spawns `computation` on the current runtime, returning the channel its outcome is sent to.
    ///
    /// The computation runs to completion even if nobody awaits the channel anymore. A panic
    /// inside the computation is delivered as [`Outcome::Panicked`].
    pub fn spawn<F>(self, computation: F) -> ComputationChannel
    where
        F: Future<Output = Outcome> + Send + 'static,
    {
        let Group {
            sender,
            channel,
            remove_computation_token,
        } = self;

        let future = async move {
            let outcome = match AssertUnwindSafe(computation).catch_unwind().await {
                Ok(outcome) => outcome,
                Err(payload) => Outcome::Panicked(panic_message(&*payload)),
            };
            // Drop the token first to evict from the map. This ensures that callers either
            // get a channel that will receive data, or they create a new channel.
            drop(remove_computation_token);
            sender.send(outcome).ok();
        };

        tokio::spawn(future.in_current_span());

        channel
    }
}

/// Extracts a readable message from a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> Arc<str> {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        Arc::from(*message)
    } else if let Some(message) = payload.downcast_ref::<String>() {
        Arc::from(message.as_str())
    } else {
        Arc::from("computation panicked")
    }
}

/// Execute a callback on dropping of the container type.
///
/// The callback must not panic under any circumstance. Since it is called while dropping an item,
/// this might result in aborting program execution.
pub(crate) struct CallOnDrop {
    f: Option<Box<dyn FnOnce() + Send + 'static>>,
}

impl CallOnDrop {
    /// Creates a new `CallOnDrop`.
    pub fn new<F: FnOnce() + Send + 'static>(f: F) -> CallOnDrop {
        CallOnDrop {
            f: Some(Box::new(f)),
        }
    }
}

impl Drop for CallOnDrop {
    fn drop(&mut self) {
        if let Some(f) = self.f.take() {
            f();
        }
    }
}

impl fmt::Debug for Computations {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Computations")
            .field("running", &self.len())
            .finish()
    }
}
