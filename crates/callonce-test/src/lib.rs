//! Helpers for testing the cache and the web server.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that all console output
//!    is captured by the test runner.
//!
//!  - When using a [`Server`], make sure that it is held until all requests to it have been made.
//!    The server is shut down as soon as the handle is dropped.

use std::fmt;
use std::net::{SocketAddr, TcpListener};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use axum::Router;
use callonce::{Event, EventData, Observer};
use parking_lot::Mutex;
use reqwest::Url;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from the `callonce` crates and mutes all
///    other logs (such as hyper or tower).
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("callonce=trace,callonce_server=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// A single event as seen by a [`RecordingObserver`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecordedEvent {
    /// What happened.
    pub event: Event,
    /// The key name of the triggering lookup.
    pub key: String,
    /// The identifier of the triggering lookup.
    pub identifier: String,
}

impl RecordedEvent {
    /// Creates the expected record of an event, for comparisons in assertions.
    pub fn new(event: Event, key: &str, identifier: &str) -> Self {
        Self {
            event,
            key: key.to_owned(),
            identifier: identifier.to_owned(),
        }
    }
}

/// An observer that records every event, in the order they were emitted.
///
/// Clones share the same recording, so one clone can be handed to the cache while another one is
/// kept around for assertions.
#[derive(Clone, Default)]
pub struct RecordingObserver {
    events: Arc<Mutex<Vec<RecordedEvent>>>,
}

impl RecordingObserver {
    /// Creates an empty recording.
    pub fn new() -> Self {
        Self::default()
    }

    /// All events recorded so far.
    pub fn events(&self) -> Vec<RecordedEvent> {
        self.events.lock().clone()
    }

    /// The number of recorded events of the given kind.
    pub fn count(&self, event: Event) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|recorded| recorded.event == event)
            .count()
    }

    /// Discards all events recorded so far.
    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl Observer for RecordingObserver {
    fn on(&self, event: &EventData<'_>) {
        self.events
            .lock()
            .push(RecordedEvent::new(event.event, event.key, event.identifier));
    }
}

impl fmt::Debug for RecordingObserver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.events.lock().iter()).finish()
    }
}

/// Counts how often a computation was actually invoked.
#[derive(Clone, Debug, Default)]
pub struct CallCounter(Arc<AtomicUsize>);

impl CallCounter {
    /// Creates a counter starting at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Increments the counter, returning the number of calls including this one.
    pub fn hit(&self) -> usize {
        self.0.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// The number of calls so far.
    pub fn get(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}

/// A web server running in the background, for the duration of a test.
pub struct Server {
    handle: tokio::task::JoinHandle<()>,
    socket: SocketAddr,
}

impl Server {
    /// Serves `router` on an ephemeral port on localhost.
    ///
    /// Must be called from within a tokio runtime.
    pub fn with_router(router: Router) -> Self {
        let listener = TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0))).unwrap();
        listener.set_nonblocking(true).unwrap();
        let socket = listener.local_addr().unwrap();
        let listener = tokio::net::TcpListener::from_std(listener).unwrap();

        let handle = tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        Self { handle, socket }
    }

    /// Returns the socket address that this server listens on.
    pub fn addr(&self) -> SocketAddr {
        self.socket
    }

    /// Returns the port that this server listens on.
    pub fn port(&self) -> u16 {
        self.addr().port()
    }

    /// Returns a full URL pointing to the given path.
    ///
    /// This URL uses `localhost` as hostname.
    pub fn url(&self, path: &str) -> Url {
        let path = path.trim_start_matches('/');
        format!("http://localhost:{}/{}", self.port(), path)
            .parse()
            .unwrap()
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
