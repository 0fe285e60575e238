//! burrow
//!
//! SOCKS5 tunneling proxy.
//!
//! This service:
//! - Accepts client connections on the configured listen address
//! - Negotiates SOCKS5 CONNECT (no authentication)
//! - Resolves and connects to the requested target
//! - Relays bytes until either side closes or goes idle

use std::sync::Arc;

use anyhow::Result;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use burrow_tunnel::config::{duration_ms, Config};
use burrow_tunnel::{Listener, ListenerConfig, Socks5Handler};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to BURROW_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting burrow");
    info!(
        listen_addr = %config.listen_addr,
        idle_timeout_ms = duration_ms(config.idle_timeout),
        max_connections = config.max_connections,
        "Configuration loaded"
    );

    let mut listener_config = ListenerConfig::new(config.listen_addr);
    listener_config.max_connections = config.max_connections;
    listener_config.idle_timeout = config.idle_timeout;

    let listener = match Listener::bind(listener_config).await {
        Ok(listener) => Arc::new(listener),
        Err(e) => {
            error!(bind_addr = %config.listen_addr, error = %e, "Failed to bind listener");
            return Err(e.into());
        }
    };

    tokio::select! {
        result = listener.run(Socks5Handler::new) => {
            if let Err(e) = &result {
                error!(error = %e, "Listener error");
            }
            result?;
        }
        signal = tokio::signal::ctrl_c() => {
            signal?;
            info!("Shutdown signal received");
        }
    }

    Ok(())
}
