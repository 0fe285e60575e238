//! Proxy configuration (env-driven).

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::listener::DEFAULT_MAX_CONNECTIONS;

/// Proxy configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Address the SOCKS5 listener binds to.
    pub listen_addr: SocketAddr,

    /// Idle timeout applied to every socket operation.
    pub idle_timeout: Duration,

    /// Maximum concurrent tunnels.
    pub max_connections: usize,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let listen_addr: SocketAddr = var("BURROW_LISTEN_ADDR")
            .unwrap_or_else(|| "127.0.0.1:1080".to_string())
            .parse()
            .context("BURROW_LISTEN_ADDR must be a socket address (example: 127.0.0.1:1080).")?;

        let idle_timeout_ms: u64 = var("BURROW_IDLE_TIMEOUT_MS")
            .map(|v| v.parse())
            .transpose()
            .context("BURROW_IDLE_TIMEOUT_MS must be an integer (milliseconds).")?
            .unwrap_or(60_000);
        let idle_timeout = Duration::from_millis(idle_timeout_ms.max(100));

        let max_connections: usize = var("BURROW_MAX_CONNECTIONS")
            .map(|v| v.parse())
            .transpose()
            .context("BURROW_MAX_CONNECTIONS must be an integer.")?
            .unwrap_or(DEFAULT_MAX_CONNECTIONS)
            .max(1);

        let log_level = var("BURROW_LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        Ok(Self {
            listen_addr,
            idle_timeout,
            max_connections,
            log_level,
        })
    }
}

/// Whole milliseconds in `d` for log fields, saturating at `u64::MAX`.
pub fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
