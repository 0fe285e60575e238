//! SOCKS5 CONNECT handler (RFC 1928, no authentication).
//!
//! Drives a tunnel through the method negotiation and the CONNECT request,
//! then relays bytes in both directions. Handshake frames may arrive split
//! across reads; partial frames are buffered until complete, and bytes the
//! client sends right after its request are forwarded once the target is
//! connected.
//!
//! The relay keeps one chunk in flight per direction: a read pauses its
//! socket until the chunk has been written to the peer.

use std::io;
use std::net::SocketAddr;

use burrow_addr::{numeric_socket_addr, AddrError, Host, TargetAddress};
use bytes::Bytes;
use tracing::{debug, trace};

use crate::tunnel::{OpStatus, Side, SocketState, Tunnel, TunnelError, TunnelHandler};

const SOCKS_VERSION: u8 = 0x05;
const AUTH_NONE: u8 = 0x00;
const AUTH_NO_ACCEPTABLE: u8 = 0xFF;
const CMD_CONNECT: u8 = 0x01;

const REP_SUCCESS: u8 = 0x00;
const REP_GENERAL_FAILURE: u8 = 0x01;
const REP_NETWORK_UNREACHABLE: u8 = 0x03;
const REP_HOST_UNREACHABLE: u8 = 0x04;
const REP_CMD_NOT_SUPPORTED: u8 = 0x07;
const REP_ATYP_NOT_SUPPORTED: u8 = 0x08;

const METHOD_ACCEPTED: [u8; 2] = [SOCKS_VERSION, AUTH_NONE];
const METHOD_REJECTED: [u8; 2] = [SOCKS_VERSION, AUTH_NO_ACCEPTABLE];

/// Read size while negotiating; a full domain CONNECT request is 262 bytes.
const HANDSHAKE_READ_SIZE: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Greeting,
    Request,
    Resolving,
    Connecting,
    Relay,
    /// An error reply is being written; shut down once it completes. Writes
    /// queue here so a reply may follow a method reply still in flight.
    Closing,
}

/// A parsed CONNECT request, or the reply code to reject it with.
#[derive(Debug, PartialEq, Eq)]
enum Request {
    Connect { target: TargetAddress, len: usize },
    Reject(u8),
}

/// Per-tunnel SOCKS5 state.
#[derive(Debug)]
pub struct Socks5Handler {
    phase: Phase,
    pending: Vec<u8>,
    target: Option<TargetAddress>,
    bytes_up: u64,
    bytes_down: u64,
}

impl Default for Socks5Handler {
    fn default() -> Self {
        Self::new()
    }
}

impl Socks5Handler {
    pub fn new() -> Self {
        Self {
            phase: Phase::Greeting,
            pending: Vec::new(),
            target: None,
            bytes_up: 0,
            bytes_down: 0,
        }
    }

    /// The requested target, once the CONNECT request has been parsed.
    pub fn target(&self) -> Option<&TargetAddress> {
        self.target.as_ref()
    }

    /// Bytes relayed client to target and target to client.
    pub fn bytes_relayed(&self) -> (u64, u64) {
        (self.bytes_up, self.bytes_down)
    }

    /// Consume buffered handshake bytes for as long as complete frames are
    /// available, then ask for more.
    fn advance(tunnel: &mut Tunnel<Self>) -> Result<(), TunnelError> {
        loop {
            let handler = tunnel.handler_mut();
            match handler.phase {
                Phase::Greeting => {
                    let Some((len, no_auth)) = parse_greeting(&handler.pending)? else {
                        return tunnel.read(Side::Incoming);
                    };
                    handler.pending.drain(..len);

                    if !no_auth {
                        debug!("client offers no acceptable auth method");
                        handler.phase = Phase::Closing;
                        return tunnel.write(Side::Incoming, Bytes::from_static(&METHOD_REJECTED));
                    }
                    handler.phase = Phase::Request;
                    tunnel.write(Side::Incoming, Bytes::from_static(&METHOD_ACCEPTED))?;
                }
                Phase::Request => {
                    let Some(request) = parse_request(&handler.pending)? else {
                        return tunnel.read(Side::Incoming);
                    };
                    return match request {
                        Request::Connect { target, len } => {
                            handler.pending.drain(..len);
                            Self::open(tunnel, target)
                        }
                        Request::Reject(code) => Self::reject(tunnel, code),
                    };
                }
                _ => return Ok(()),
            }
        }
    }

    fn open(tunnel: &mut Tunnel<Self>, target: TargetAddress) -> Result<(), TunnelError> {
        debug!(target = %target, "CONNECT");

        let addr = match &target.host {
            Host::Domain(name) => std::str::from_utf8(name)
                .ok()
                .and_then(|name| numeric_socket_addr(name, target.port).ok()),
            _ => target.to_socket_addr(),
        };
        let (host, port) = (target.host.clone(), target.port);
        tunnel.handler_mut().target = Some(target);

        match (addr, host) {
            (Some(addr), _) => {
                tunnel.handler_mut().phase = Phase::Connecting;
                tunnel.socket_mut(Side::Outgoing).set_target(addr);
                tunnel.connect(Side::Outgoing)
            }
            (None, Host::Domain(name)) => {
                tunnel.handler_mut().phase = Phase::Resolving;
                tunnel.resolve(Side::Outgoing, name, port)
            }
            (None, _) => Self::reject(tunnel, REP_GENERAL_FAILURE),
        }
    }

    /// Send an error reply; the tunnel shuts down once it is written.
    fn reject(tunnel: &mut Tunnel<Self>, code: u8) -> Result<(), TunnelError> {
        debug!(code, "rejecting request");
        tunnel.handler_mut().phase = Phase::Closing;
        tunnel.write(Side::Incoming, reply(code, None)?)
    }

    fn relay(tunnel: &mut Tunnel<Self>, side: Side) -> Result<(), TunnelError> {
        let data = Bytes::copy_from_slice(tunnel.socket(side).data());
        let len = data.len() as u64;

        let handler = tunnel.handler_mut();
        match side {
            Side::Incoming => handler.bytes_up += len,
            Side::Outgoing => handler.bytes_down += len,
        }

        trace!(side = %side, len, "relaying");
        tunnel.write(side.peer(), data)?;
        tunnel.read_stop(side);
        Ok(())
    }
}

impl TunnelHandler for Socks5Handler {
    fn on_init(_tunnel: &mut Tunnel<Self>) -> bool {
        trace!("SOCKS5 session started");
        true
    }

    fn on_outgoing_connected(tunnel: &mut Tunnel<Self>, side: Side) -> Result<(), TunnelError> {
        let socket = tunnel.socket(side);
        if !socket.result().is_success() {
            debug!(result = ?socket.result(), "connect failed");
            let code = reply_code(socket.result());
            return Self::reject(tunnel, code);
        }

        let reply = reply(REP_SUCCESS, socket.local_addr())?;
        tunnel.handler_mut().phase = Phase::Relay;
        tunnel.write(Side::Incoming, reply)?;
        tunnel.read(Side::Outgoing)?;

        let handler = tunnel.handler_mut();
        let early = std::mem::take(&mut handler.pending);
        if early.is_empty() {
            tunnel.read(Side::Incoming)
        } else {
            handler.bytes_up += early.len() as u64;
            tunnel.write(Side::Outgoing, early)
        }
    }

    fn on_read_done(tunnel: &mut Tunnel<Self>, side: Side) -> Result<(), TunnelError> {
        if tunnel.handler().phase == Phase::Relay {
            return Self::relay(tunnel, side);
        }
        if side != Side::Incoming {
            return Err(TunnelError::protocol("target sent data before the relay started"));
        }

        let socket = tunnel.socket_mut(Side::Incoming);
        let data = socket.data().to_vec();
        socket.consume();
        tunnel.handler_mut().pending.extend_from_slice(&data);

        Self::advance(tunnel)
    }

    fn on_write_done(tunnel: &mut Tunnel<Self>, side: Side) -> Result<(), TunnelError> {
        let result = tunnel.socket(side).result();
        if !result.is_success() {
            debug!(side = %side, result = ?result, "write failed");
            tunnel.shutdown();
            return Ok(());
        }

        let phase = tunnel.handler().phase;
        match phase {
            // Wait for a reply queued behind an earlier write.
            Phase::Closing if tunnel.socket(side).write_state() == SocketState::Completed => {
                tunnel.shutdown()
            }
            Phase::Relay => {
                // The chunk read from the peer has been delivered; resume it.
                let peer = side.peer();
                if tunnel.socket(peer).read_state() == SocketState::Idle {
                    tunnel.read(peer)?;
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn on_resolve_done(tunnel: &mut Tunnel<Self>, side: Side) -> Result<(), TunnelError> {
        let result = tunnel.socket(side).result();
        if !result.is_success() {
            debug!(result = ?result, "resolve failed");
            return Self::reject(tunnel, REP_HOST_UNREACHABLE);
        }

        tunnel.handler_mut().phase = Phase::Connecting;
        tunnel.connect(side)
    }

    fn on_timeout(tunnel: &mut Tunnel<Self>, side: Side) {
        debug!(side = %side, phase = ?tunnel.handler().phase, "SOCKS5 session idle");
    }

    fn on_destroy(tunnel: &mut Tunnel<Self>) {
        let handler = tunnel.handler();
        debug!(
            target = ?handler.target.as_ref().map(ToString::to_string),
            bytes_up = handler.bytes_up,
            bytes_down = handler.bytes_down,
            "SOCKS5 session finished"
        );
    }

    fn is_streaming(&self) -> bool {
        matches!(self.phase, Phase::Relay | Phase::Closing)
    }

    fn alloc_size_hint(&self, requested: usize) -> usize {
        if self.phase == Phase::Relay {
            requested
        } else {
            requested.min(HANDSHAKE_READ_SIZE)
        }
    }
}

/// Parse a method-selection greeting.
///
/// Returns the frame length and whether "no authentication" is offered, or
/// `None` if the frame is incomplete.
fn parse_greeting(buf: &[u8]) -> Result<Option<(usize, bool)>, TunnelError> {
    let [version, nmethods, ..] = buf else {
        return Ok(None);
    };
    if *version != SOCKS_VERSION {
        return Err(TunnelError::protocol(format!(
            "unsupported SOCKS version {version}"
        )));
    }

    let len = 2 + *nmethods as usize;
    Ok(buf.get(2..len).map(|methods| (len, methods.contains(&AUTH_NONE))))
}

/// Parse a request frame: `VER CMD RSV ATYP ADDR PORT`.
fn parse_request(buf: &[u8]) -> Result<Option<Request>, TunnelError> {
    let [version, command, _reserved, rest @ ..] = buf else {
        return Ok(None);
    };
    if *version != SOCKS_VERSION {
        return Err(TunnelError::protocol(format!(
            "unexpected version {version} in request"
        )));
    }
    if *command != CMD_CONNECT {
        debug!(command, "unsupported command");
        return Ok(Some(Request::Reject(REP_CMD_NOT_SUPPORTED)));
    }

    match TargetAddress::decode(rest) {
        Ok((target, used)) => Ok(Some(Request::Connect {
            target,
            len: 3 + used,
        })),
        Err(e) if e.is_truncated() => Ok(None),
        Err(AddrError::UnknownType(tag)) => {
            debug!(tag, "unsupported address type");
            Ok(Some(Request::Reject(REP_ATYP_NOT_SUPPORTED)))
        }
        Err(e) => {
            debug!(error = %e, "malformed request address");
            Ok(Some(Request::Reject(REP_GENERAL_FAILURE)))
        }
    }
}

/// Build a reply frame: `VER REP RSV ATYP BND.ADDR BND.PORT`.
fn reply(code: u8, bound: Option<SocketAddr>) -> Result<Bytes, TunnelError> {
    let bound = TargetAddress::from(bound.unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 0))));
    let addr = bound
        .to_bytes()
        .map_err(|e| TunnelError::protocol(e.to_string()))?;

    let mut frame = Vec::with_capacity(3 + addr.len());
    frame.extend_from_slice(&[SOCKS_VERSION, code, 0x00]);
    frame.extend_from_slice(&addr);
    Ok(frame.into())
}

fn reply_code(status: OpStatus) -> u8 {
    match status {
        OpStatus::Failed(io::ErrorKind::NetworkUnreachable) => REP_NETWORK_UNREACHABLE,
        OpStatus::Failed(
            io::ErrorKind::HostUnreachable | io::ErrorKind::NotFound | io::ErrorKind::TimedOut,
        ) => REP_HOST_UNREACHABLE,
        _ => REP_GENERAL_FAILURE,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_greeting_incomplete() {
        assert_eq!(parse_greeting(&[]).unwrap(), None);
        assert_eq!(parse_greeting(&[0x05]).unwrap(), None);
        assert_eq!(parse_greeting(&[0x05, 0x02, 0x00]).unwrap(), None);
    }

    #[test]
    fn test_greeting_methods() {
        assert_eq!(
            parse_greeting(&[0x05, 0x02, 0x02, 0x00]).unwrap(),
            Some((4, true))
        );
        assert_eq!(parse_greeting(&[0x05, 0x01, 0x02]).unwrap(), Some((3, false)));
        assert_eq!(parse_greeting(&[0x05, 0x00]).unwrap(), Some((2, false)));
    }

    #[test]
    fn test_greeting_bad_version() {
        assert!(matches!(
            parse_greeting(&[0x04, 0x01, 0x00]),
            Err(TunnelError::Protocol(_))
        ));
    }

    #[test]
    fn test_request_ipv4_connect() {
        let frame = [0x05, 0x01, 0x00, 0x01, 10, 0, 0, 1, 0x1F, 0x90];
        let request = parse_request(&frame).unwrap().unwrap();
        assert_eq!(
            request,
            Request::Connect {
                target: "10.0.0.1:8080".parse::<SocketAddr>().unwrap().into(),
                len: frame.len(),
            }
        );
    }

    #[test]
    fn test_request_domain_with_early_data() {
        let mut frame = vec![0x05, 0x01, 0x00, 0x03, 11];
        frame.extend_from_slice(b"example.com");
        frame.extend_from_slice(&[0x01, 0xBB]);
        let request_len = frame.len();
        frame.extend_from_slice(b"GET / HTTP/1.1\r\n");

        match parse_request(&frame).unwrap() {
            Some(Request::Connect { target, len }) => {
                assert_eq!(target, TargetAddress::domain("example.com", 443).unwrap());
                assert_eq!(len, request_len);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_request_non_utf8_domain_is_accepted() {
        let frame = [0x05, 0x01, 0x00, 0x03, 0x02, 0xC3, 0x28, 0x00, 0x50];
        assert_eq!(
            parse_request(&frame).unwrap(),
            Some(Request::Connect {
                target: TargetAddress::new(Host::Domain(vec![0xC3, 0x28]), 80),
                len: frame.len(),
            })
        );
    }

    #[test]
    fn test_request_incomplete_at_every_boundary() {
        let frame = [0x05, 0x01, 0x00, 0x04, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1, 0, 80];
        for cut in 0..frame.len() {
            assert_eq!(parse_request(&frame[..cut]).unwrap(), None, "cut at {cut}");
        }
        assert!(parse_request(&frame).unwrap().is_some());
    }

    #[test]
    fn test_request_rejections() {
        assert_eq!(
            parse_request(&[0x05, 0x02, 0x00, 0x01]).unwrap(),
            Some(Request::Reject(REP_CMD_NOT_SUPPORTED))
        );
        assert_eq!(
            parse_request(&[0x05, 0x01, 0x00, 0x09, 1, 2]).unwrap(),
            Some(Request::Reject(REP_ATYP_NOT_SUPPORTED))
        );
        assert!(parse_request(&[0x06, 0x01, 0x00, 0x01]).is_err());
    }

    #[test]
    fn test_reply_frames() {
        let ok = reply(REP_SUCCESS, Some("127.0.0.1:4321".parse().unwrap())).unwrap();
        assert_eq!(&ok[..], &[0x05, 0x00, 0x00, 0x01, 127, 0, 0, 1, 0x10, 0xE1]);

        let failed = reply(REP_HOST_UNREACHABLE, None).unwrap();
        assert_eq!(&failed[..], &[0x05, 0x04, 0x00, 0x01, 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn test_reply_codes() {
        assert_eq!(
            reply_code(OpStatus::Failed(io::ErrorKind::NotFound)),
            REP_HOST_UNREACHABLE
        );
        assert_eq!(
            reply_code(OpStatus::Failed(io::ErrorKind::NetworkUnreachable)),
            REP_NETWORK_UNREACHABLE
        );
        assert_eq!(reply_code(OpStatus::Canceled), REP_GENERAL_FAILURE);
    }

    #[test]
    fn test_handshake_read_size() {
        let mut handler = Socks5Handler::new();
        assert_eq!(handler.alloc_size_hint(65536), HANDSHAKE_READ_SIZE);
        assert!(!handler.is_streaming());

        handler.phase = Phase::Relay;
        assert_eq!(handler.alloc_size_hint(65536), 65536);
        assert!(handler.is_streaming());
    }
}
