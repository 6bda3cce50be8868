//! Cache lifecycle events and their observers.

use std::fmt;

use serde::Serialize;

/// The kind of a cache event.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Event {
    /// A `get` call was served from the store without invoking the computation.
    Hit,
    /// A `get` call invoked the computation.
    Miss,
    /// A concurrent caller shared an in-flight computation instead of starting its own.
    Dedup,
}

impl Event {
    /// The lowercase name of this event.
    pub fn as_str(&self) -> &'static str {
        match self {
            Event::Hit => "hit",
            Event::Miss => "miss",
            Event::Dedup => "dedup",
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The details of a cache event.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct EventData<'a> {
    /// What happened.
    pub event: Event,
    /// The name of the [`Key`](crate::Key) of the triggering lookup.
    pub key: &'a str,
    /// The identifier of the triggering lookup.
    pub identifier: &'a str,
}

/// Receives cache lifecycle events.
///
/// Observers are invoked synchronously on the task of the `get` call that triggered the event, and
/// that call does not return before the observer does. A cache can be used from many tasks at once,
/// so implementations need to be thread safe.
pub trait Observer: Send + Sync {
    /// Called once per event.
    fn on(&self, event: &EventData<'_>);
}

impl<F> Observer for F
where
    F: Fn(&EventData<'_>) + Send + Sync,
{
    fn on(&self, event: &EventData<'_>) {
        self(event)
    }
}

/// An [`Observer`] that logs every event at `DEBUG` level.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingObserver;

impl Observer for TracingObserver {
    fn on(&self, event: &EventData<'_>) {
        tracing::debug!(
            event = event.event.as_str(),
            key = event.key,
            identifier = event.identifier,
            "callonce {}",
            event.event,
        );
    }
}
