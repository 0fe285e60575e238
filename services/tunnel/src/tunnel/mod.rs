//! Tunnel connection core.
//!
//! This module provides:
//! - Per-socket state machines with independent read and write directions
//! - Per-socket idle timers
//! - DNS resolution of connect targets
//! - Refcounted asynchronous teardown of a client/target socket pair
//!
//! The protocol itself lives in a [`TunnelHandler`] supplied by the caller.
//!
//! ## Architecture
//!
//! ```text
//! Listener -> Tunnel::serve -> on_init -> read(incoming)
//!                 |
//!                 +-- completions --> TunnelHandler hooks --> read/write/connect/resolve
//!                 |
//!                 +-- idle timer expiry --> on_timeout --> shutdown --> on_destroy
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! use burrow_tunnel::tunnel::{Tunnel, TunnelConfig};
//!
//! let (stream, _) = listener.accept().await?;
//! tokio::spawn(Tunnel::serve(stream, TunnelConfig::default(), MyHandler::default()));
//! ```

mod error;
mod resolver;
mod session;
mod socket;
mod timer;

pub use error::TunnelError;
pub use resolver::resolve_first;
pub use session::{Tunnel, TunnelConfig, TunnelHandler, DEFAULT_IDLE_TIMEOUT, DEFAULT_READ_SIZE};
pub use socket::{OpStatus, Side, SocketCtx, SocketState};
