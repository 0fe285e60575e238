//! DNS resolution via `tokio::net::lookup_host`.
//!
//! The lookup is address-family unspecified and returns the first answer
//! only. Multi-answer results are not enumerated: a target with a dead first
//! address fails even if a later one would have worked.

use std::io;
use std::net::SocketAddr;

use tokio::net;
use tracing::{debug, trace};

/// Resolve `host` and return the first address, paired with `port`.
///
/// `host` is the name as received; bytes that are not UTF-8 fail with
/// `InvalidInput` without a lookup. IP literals short-circuit inside
/// `lookup_host` and never touch DNS. Cancellation is best effort: dropping
/// this future does not stop the blocking lookup already handed to the
/// runtime's blocking pool.
pub async fn resolve_first(host: impl Into<Vec<u8>>, port: u16) -> io::Result<SocketAddr> {
    let host = String::from_utf8(host.into()).map_err(|e| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("host name is not valid UTF-8: {e}"),
        )
    })?;
    trace!(host = %host, port, "resolving");

    let mut addrs = net::lookup_host((host.as_str(), port)).await?;
    match addrs.next() {
        Some(addr) => {
            debug!(host = %host, addr = %addr, "resolved");
            Ok(addr)
        }
        None => Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("no addresses found for {}", host),
        )),
    }
}
