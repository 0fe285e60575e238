//! # burrow-addr
//!
//! Wire codec for the tagged target address used to describe proxy
//! destinations.
//!
//! ## Wire Format
//!
//! ```text
//! +------+---------------------------+----------+
//! | kind | payload                   | port     |
//! +------+---------------------------+----------+
//! | 0x01 | 4-byte IPv4 address       | u16 (BE) |
//! | 0x03 | 1-byte len + len bytes    | u16 (BE) |
//! | 0x04 | 16-byte IPv6 address      | u16 (BE) |
//! +------+---------------------------+----------+
//! ```
//!
//! Any other kind byte is rejected. Decoding never yields a partial result.
//! Domain names are carried as raw bytes; they are not required to be UTF-8.

mod error;

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

pub use error::AddrError;

/// Address type tag: IPv4.
pub const ADDR_TYPE_IPV4: u8 = 0x01;

/// Address type tag: domain name.
pub const ADDR_TYPE_DOMAIN: u8 = 0x03;

/// Address type tag: IPv6.
pub const ADDR_TYPE_IPV6: u8 = 0x04;

/// Maximum domain name length (bounded by the 1-byte length prefix).
pub const MAX_DOMAIN_LEN: usize = 255;

const TAG_LEN: usize = 1;
const PORT_LEN: usize = 2;
const IPV4_LEN: usize = 4;
const IPV6_LEN: usize = 16;

/// The kind of a target address, as carried by the wire tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressKind {
    Ipv4,
    DomainName,
    Ipv6,
}

impl AddressKind {
    /// The tag byte for this kind.
    pub fn tag(self) -> u8 {
        match self {
            AddressKind::Ipv4 => ADDR_TYPE_IPV4,
            AddressKind::DomainName => ADDR_TYPE_DOMAIN,
            AddressKind::Ipv6 => ADDR_TYPE_IPV6,
        }
    }

    /// Map a tag byte back to a kind.
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            ADDR_TYPE_IPV4 => Some(AddressKind::Ipv4),
            ADDR_TYPE_DOMAIN => Some(AddressKind::DomainName),
            ADDR_TYPE_IPV6 => Some(AddressKind::Ipv6),
            _ => None,
        }
    }
}

/// Host part of a target address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Host {
    V4(Ipv4Addr),
    V6(Ipv6Addr),
    /// Name bytes exactly as carried on the wire.
    Domain(Vec<u8>),
}

/// A proxy destination: host plus port (host byte order in memory).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TargetAddress {
    pub host: Host,
    pub port: u16,
}

impl TargetAddress {
    /// Create a target address from a host and port.
    pub fn new(host: Host, port: u16) -> Self {
        Self { host, port }
    }

    /// Create a domain-name target, rejecting names the wire cannot carry.
    pub fn domain(name: impl Into<Vec<u8>>, port: u16) -> Result<Self, AddrError> {
        let name = name.into();
        if name.len() > MAX_DOMAIN_LEN {
            return Err(AddrError::DomainTooLong(name.len()));
        }
        Ok(Self::new(Host::Domain(name), port))
    }

    /// The address kind.
    pub fn kind(&self) -> AddressKind {
        match self.host {
            Host::V4(_) => AddressKind::Ipv4,
            Host::V6(_) => AddressKind::Ipv6,
            Host::Domain(_) => AddressKind::DomainName,
        }
    }

    /// The socket address for IP targets; `None` for domain names.
    pub fn to_socket_addr(&self) -> Option<SocketAddr> {
        match &self.host {
            Host::V4(ip) => Some(SocketAddr::new(IpAddr::V4(*ip), self.port)),
            Host::V6(ip) => Some(SocketAddr::new(IpAddr::V6(*ip), self.port)),
            Host::Domain(_) => None,
        }
    }

    /// Parse a complete target address from the start of `data`.
    ///
    /// Trailing bytes after the port are ignored; use [`TargetAddress::decode`]
    /// to learn where the address ends.
    pub fn parse(data: &[u8]) -> Result<Self, AddrError> {
        Self::decode(data).map(|(addr, _)| addr)
    }

    /// Decode a target address, returning it and the number of bytes consumed.
    pub fn decode(data: &[u8]) -> Result<(Self, usize), AddrError> {
        let Some(&tag) = data.first() else {
            return Err(AddrError::Empty);
        };
        let kind = AddressKind::from_tag(tag).ok_or(AddrError::UnknownType(tag))?;

        let mut offset = TAG_LEN;
        let host = match kind {
            AddressKind::Ipv4 => {
                let octets = take_array::<IPV4_LEN>(data, offset)?;
                offset += IPV4_LEN;
                Host::V4(Ipv4Addr::from(octets))
            }
            AddressKind::DomainName => {
                let len = take(data, offset, 1)?[0] as usize;
                offset += 1;
                // Check the name and the port together before copying.
                if data.len() < offset + len + PORT_LEN {
                    return Err(truncated(offset + len + PORT_LEN, data.len()));
                }
                let name = data[offset..offset + len].to_vec();
                offset += len;
                Host::Domain(name)
            }
            AddressKind::Ipv6 => {
                let octets = take_array::<IPV6_LEN>(data, offset)?;
                offset += IPV6_LEN;
                Host::V6(Ipv6Addr::from(octets))
            }
        };

        let port = u16::from_be_bytes(take_array::<PORT_LEN>(data, offset)?);
        offset += PORT_LEN;

        Ok((Self { host, port }, offset))
    }

    /// Exact wire length of this address: tag + payload + port.
    ///
    /// Returns 0 when the address cannot be encoded (an oversized domain).
    pub fn encoded_len(&self) -> usize {
        let payload = match &self.host {
            Host::V4(_) => IPV4_LEN,
            Host::V6(_) => IPV6_LEN,
            Host::Domain(name) if name.len() <= MAX_DOMAIN_LEN => 1 + name.len(),
            Host::Domain(_) => return 0,
        };
        TAG_LEN + payload + PORT_LEN
    }

    /// Encode into `buf`, returning the number of bytes written.
    pub fn encode(&self, buf: &mut [u8]) -> Result<usize, AddrError> {
        if let Host::Domain(name) = &self.host {
            if name.len() > MAX_DOMAIN_LEN {
                return Err(AddrError::DomainTooLong(name.len()));
            }
        }

        let needed = self.encoded_len();
        if buf.len() < needed {
            return Err(AddrError::BufferTooSmall {
                needed,
                capacity: buf.len(),
            });
        }

        buf[0] = self.kind().tag();
        let mut offset = TAG_LEN;
        match &self.host {
            Host::V4(ip) => {
                buf[offset..offset + IPV4_LEN].copy_from_slice(&ip.octets());
                offset += IPV4_LEN;
            }
            Host::V6(ip) => {
                buf[offset..offset + IPV6_LEN].copy_from_slice(&ip.octets());
                offset += IPV6_LEN;
            }
            Host::Domain(name) => {
                buf[offset] = name.len() as u8;
                offset += 1;
                buf[offset..offset + name.len()].copy_from_slice(name);
                offset += name.len();
            }
        }
        buf[offset..offset + PORT_LEN].copy_from_slice(&self.port.to_be_bytes());
        offset += PORT_LEN;

        Ok(offset)
    }

    /// Encode into a freshly allocated buffer.
    pub fn to_bytes(&self) -> Result<Vec<u8>, AddrError> {
        let mut buf = vec![0u8; self.encoded_len()];
        let written = self.encode(&mut buf)?;
        buf.truncate(written);
        Ok(buf)
    }
}

impl From<SocketAddr> for TargetAddress {
    fn from(addr: SocketAddr) -> Self {
        let host = match addr.ip() {
            IpAddr::V4(ip) => Host::V4(ip),
            IpAddr::V6(ip) => Host::V6(ip),
        };
        Self::new(host, addr.port())
    }
}

impl fmt::Display for TargetAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.host {
            Host::V4(ip) => write!(f, "{}:{}", ip, self.port),
            Host::V6(ip) => write!(f, "[{}]:{}", ip, self.port),
            Host::Domain(name) => write!(f, "{}:{}", String::from_utf8_lossy(name), self.port),
        }
    }
}

/// Convert a numeric host literal and port into a socket address.
///
/// No DNS lookup is performed: the host must be an IPv4 or IPv6 literal.
/// Port 0 is rejected.
pub fn numeric_socket_addr(host: &str, port: u16) -> Result<SocketAddr, AddrError> {
    if port == 0 {
        return Err(AddrError::ZeroPort);
    }
    let literal = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    let ip: IpAddr = literal
        .parse()
        .map_err(|_| AddrError::InvalidAddress(host.to_string()))?;
    Ok(SocketAddr::new(ip, port))
}

fn take(data: &[u8], offset: usize, len: usize) -> Result<&[u8], AddrError> {
    data.get(offset..offset + len)
        .ok_or_else(|| truncated(offset + len, data.len()))
}

fn take_array<const N: usize>(data: &[u8], offset: usize) -> Result<[u8; N], AddrError> {
    let mut out = [0u8; N];
    out.copy_from_slice(take(data, offset, N)?);
    Ok(out)
}

fn truncated(needed: usize, available: usize) -> AddrError {
    AddrError::Truncated { needed, available }
}
