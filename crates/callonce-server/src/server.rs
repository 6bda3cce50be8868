use std::net::SocketAddr;

use anyhow::{Context, Result};

use crate::config::Config;
use crate::endpoints;
use crate::service::RequestService;

/// Starts the HTTP server based on the loaded config.
pub fn run(config: Config) -> Result<()> {
    // Log this metric before actually starting the server. This allows to see restarts even if
    // service creation fails.
    metric!(counter("server.starting") += 1);

    let megs = 1024 * 1024;
    let web_pool = tokio::runtime::Builder::new_multi_thread()
        .thread_name("callonce-web")
        .enable_all()
        .thread_stack_size(8 * megs)
        .build()?;

    let service = RequestService::create(&config);
    let socket = config
        .bind
        .parse::<SocketAddr>()
        .context("invalid bind address")?;

    web_pool.block_on(async move {
        let listener = tokio::net::TcpListener::bind(socket)
            .await
            .with_context(|| format!("failed to bind to {socket}"))?;
        tracing::info!("Starting HTTP server on {}", socket);

        axum::serve(listener, endpoints::create_app(service))
            .await
            .context("server failed")
    })?;
    tracing::info!("System shutdown complete");

    Ok(())
}
