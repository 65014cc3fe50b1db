//! meshgate
//!
//! Transparent multi-protocol gateway.
//!
//! This service:
//! - Accepts TCP and Unix connections on configured listeners
//! - Sniffs TLS SNI, SOCKS5, HTTP CONNECT, HTTP/2 prefaces and iptables
//!   original destinations
//! - Routes by hostname and optionally terminates TLS
//! - Proxies to the destination, or serves the stream in-process

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use meshgate::config::{Config, FileConfig};
use meshgate::debug;
use meshgate::proxy::{Gateway, PortListener, RustlsTerminator, TcpDialer};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to GATEWAY_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting meshgate");

    let resolved = FileConfig::load(&config.config_path)?.resolve()?;
    info!(
        config_path = %config.config_path.display(),
        listener_count = resolved.listeners.len(),
        route_count = resolved.routes.len(),
        debug_addr = ?config.debug_addr,
        sniff_timeout_ms = config.sniff_timeout.as_millis() as u64,
        "Configuration loaded"
    );

    let gateway = Arc::new(
        Gateway::new(resolved.routes.clone())
            .with_dialer(Arc::new(TcpDialer::with_timeout(config.connect_timeout)))
            .with_tls_terminator(Arc::new(RustlsTerminator::new(
                config.tls_handshake_timeout,
            )))
            .with_sniff_timeout(config.sniff_timeout),
    );

    let mut listener_handles = Vec::new();
    for listener_config in resolved.listeners {
        let address = listener_config.address.clone();
        let listener = match PortListener::bind(listener_config, Arc::clone(&gateway)).await {
            Ok(listener) => listener,
            Err(e) => {
                error!(address = %address, error = %e, "Failed to bind listener");
                return Err(e).with_context(|| format!("Failed to bind listener {address}"));
            }
        };
        listener_handles.push(tokio::spawn(async move {
            if let Err(e) = listener.run().await {
                error!(address = %address, error = %e, "Listener error");
            }
        }));
    }

    if let Some(addr) = config.debug_addr {
        let debug_gateway = Arc::clone(&gateway);
        tokio::spawn(async move {
            if let Err(e) = debug::bind_and_serve(addr, debug_gateway).await {
                error!(addr = %addr, error = %e, "Debug server failed");
            }
        });
    }

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;

    gateway.shutdown();
    for handle in listener_handles {
        let _ = handle.await;
    }
    info!(
        active_streams = gateway.active_count(),
        "Listeners stopped, exiting"
    );
    Ok(())
}
