//! A demo web service with request-scoped call coalescing.
//!
//! Every inbound request gets its own [`callonce::Cache`]. Handlers fan out concurrent loads from a
//! simulated upstream directory, and each distinct load reaches the upstream at most once per
//! request.

#![warn(missing_debug_implementations, clippy::all)]

#[macro_use]
mod metrics;

mod cli;
mod config;
mod directory;
mod endpoints;
mod healthcheck;
mod logging;
mod request_cache;
mod server;
mod service;

fn main() {
    match cli::execute() {
        Ok(()) => std::process::exit(0),
        Err(error) => {
            logging::ensure_log_error(&error);
            std::process::exit(1);
        }
    }
}
