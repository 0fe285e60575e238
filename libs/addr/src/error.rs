//! Error types for target address encoding and decoding.

use thiserror::Error;

/// Errors that can occur when decoding or encoding a target address.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AddrError {
    /// The input buffer is empty.
    #[error("address buffer is empty")]
    Empty,

    /// The address type tag is not IPv4, domain name or IPv6.
    #[error("unknown address type: {0:#04x}")]
    UnknownType(u8),

    /// The input ends before the declared payload and port.
    #[error("truncated address: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },

    /// The domain name does not fit the 1-byte length prefix.
    #[error("domain name too long: {0} bytes (max 255)")]
    DomainTooLong(usize),

    /// The output buffer cannot hold the encoded address.
    #[error("output buffer too small: need {needed} bytes, have {capacity}")]
    BufferTooSmall { needed: usize, capacity: usize },

    /// The host is not a numeric IPv4 or IPv6 literal.
    #[error("invalid numeric address: {0}")]
    InvalidAddress(String),

    /// Port 0 cannot be used as a destination.
    #[error("port must be non-zero")]
    ZeroPort,
}

impl AddrError {
    /// Returns true if more input could turn this failure into a success.
    pub fn is_truncated(&self) -> bool {
        matches!(self, AddrError::Empty | AddrError::Truncated { .. })
    }
}
