//! Standalone QKD key manager: serves the key pool over HTTP.
//!
//! Configuration comes from `QUMAIL_*` variables, log filtering from `RUST_LOG`.

use std::sync::Arc;

use anyhow::Context;
use qumail_core::config::Config;
use qumail_core::key_pool::http::create_router;
use qumail_core::key_pool::{KeyPool, ReservationSweeper};
use qumail_core::utils::logging::init_tracing;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing("info");

    let config = Config::from_env();
    info!(
        bind_addr = %config.server.bind_addr,
        otp_bytes_per_peer = config.pool.otp_bytes_per_peer,
        aes_keys_per_peer = config.pool.aes_keys_per_peer,
        reservation_ttl_secs = config.pool.reservation_ttl.as_secs(),
        "starting QKD key manager"
    );

    let pool = Arc::new(KeyPool::new(config.pool.clone()));
    let sweeper = ReservationSweeper::spawn(Arc::clone(&pool), config.pool.sweep_interval);

    let listener = tokio::net::TcpListener::bind(config.server.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.server.bind_addr))?;
    info!(addr = %listener.local_addr()?, "listening");

    axum::serve(listener, create_router(Arc::clone(&pool)))
        .with_graceful_shutdown(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %err, "failed to listen for shutdown signal");
            }
        })
        .await
        .context("server error")?;

    sweeper.stop().await;
    let stats = pool.stats();
    info!(
        allocated = stats.total_allocated,
        consumed = stats.total_consumed,
        released = stats.total_released,
        expired = stats.total_expired,
        "key manager stopped"
    );
    Ok(())
}
