use std::net::SocketAddr;

use anyhow::{Context, Result};
use mxcache_service::config::Config;
use mxcache_service::metric;

use crate::endpoints;
use crate::service::ProxyService;

/// Starts the HTTP server based on the loaded config.
pub fn run(config: Config) -> Result<()> {
    // Log this metric before actually starting the server. This allows to see restarts even if
    // service creation fails.
    metric!(counter("server.starting") += 1);

    let megs = 1024 * 1024;
    let web_pool = tokio::runtime::Builder::new_multi_thread()
        .thread_name("mxcache-web")
        .enable_all()
        .thread_stack_size(8 * megs)
        .build()?;

    let service = {
        let _guard = web_pool.enter();
        ProxyService::create(&config).context("failed to create service state")?
    };
    let socket = config
        .bind
        .parse::<SocketAddr>()
        .with_context(|| format!("invalid bind address {}", config.bind))?;

    tracing::info!(
        upstream = config.upstream.as_ref().map(|url| url.as_str()),
        cache_ttl = ?config.cache_ttl,
        "Starting HTTP server on {}",
        socket
    );

    web_pool.block_on(async move {
        let listener = tokio::net::TcpListener::bind(socket)
            .await
            .with_context(|| format!("failed to bind to {socket}"))?;
        axum::serve(listener, endpoints::create_app(service))
            .await
            .context("server failed")
    })?;
    tracing::info!("System shutdown complete");

    Ok(())
}
