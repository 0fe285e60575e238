pub mod config;
pub mod listener;
pub mod socks5;
pub mod tunnel;

pub use listener::{Listener, ListenerConfig, ListenerStats};
pub use socks5::Socks5Handler;
pub use tunnel::{
    OpStatus, Side, SocketCtx, SocketState, Tunnel, TunnelConfig, TunnelError, TunnelHandler,
};
