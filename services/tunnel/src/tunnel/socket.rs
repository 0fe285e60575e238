//! Socket context: one stream, one idle timer, one read buffer and the
//! read/write state machine.
//!
//! Read and write states are independent; a socket may read and write at the
//! same time. Closing forces both states to [`SocketState::Closed`], which is
//! terminal.

use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::future::AbortHandle;
use tokio::net::TcpStream;
use tokio::time::Sleep;

use super::timer::IdleTimer;

/// Which of the tunnel's two sockets an operation applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    /// The accepted client connection.
    Incoming,
    /// The connection to the proxy target.
    Outgoing,
}

impl Side {
    /// The other socket of the pair.
    pub fn peer(self) -> Side {
        match self {
            Side::Incoming => Side::Outgoing,
            Side::Outgoing => Side::Incoming,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Incoming => f.write_str("incoming"),
            Side::Outgoing => f.write_str("outgoing"),
        }
    }
}

/// State of one direction (read or write) of a socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketState {
    Idle,
    InProgress,
    Completed,
    Closed,
}

/// Outcome of the last operation on a socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpStatus {
    /// The operation succeeded; carries the byte count for reads and writes.
    Success(usize),
    /// The operation failed. Idle timeouts are `Failed(TimedOut)`.
    Failed(io::ErrorKind),
    /// The operation was canceled before it could complete.
    Canceled,
}

impl OpStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, OpStatus::Success(_))
    }
}

impl From<&io::Error> for OpStatus {
    fn from(e: &io::Error) -> Self {
        OpStatus::Failed(e.kind())
    }
}

/// Abort handles for the operations in flight on one socket.
#[derive(Default)]
pub(crate) struct InFlight {
    pub(crate) read: Option<AbortHandle>,
    pub(crate) write: Option<AbortHandle>,
    pub(crate) connect: Option<AbortHandle>,
    pub(crate) resolve: Option<AbortHandle>,
}

impl InFlight {
    pub(crate) fn any(&self) -> bool {
        self.read.is_some()
            || self.write.is_some()
            || self.connect.is_some()
            || self.resolve.is_some()
    }

    /// Abort stream operations. Resolution is canceled separately by the
    /// tunnel, which owns the pending flag.
    pub(crate) fn abort_io(&mut self) {
        for handle in [self.read.take(), self.write.take(), self.connect.take()]
            .into_iter()
            .flatten()
        {
            handle.abort();
        }
    }
}

/// Per-socket state owned by a tunnel.
pub struct SocketCtx {
    side: Side,
    pub(crate) stream: Option<Arc<TcpStream>>,
    pub(crate) timer: IdleTimer,
    pub(crate) buf: Vec<u8>,
    pub(crate) read_len: usize,
    pub(crate) rdstate: SocketState,
    pub(crate) wrstate: SocketState,
    pub(crate) result: OpStatus,
    pub(crate) target: Option<SocketAddr>,
    pub(crate) write_queue: VecDeque<Bytes>,
    pub(crate) in_flight: InFlight,
    peer_addr: Option<SocketAddr>,
    local_addr: Option<SocketAddr>,
}

impl SocketCtx {
    pub(crate) fn new(side: Side, idle_timeout: Duration) -> Self {
        Self {
            side,
            stream: None,
            timer: IdleTimer::new(idle_timeout),
            buf: Vec::new(),
            read_len: 0,
            rdstate: SocketState::Idle,
            wrstate: SocketState::Idle,
            result: OpStatus::Success(0),
            target: None,
            write_queue: VecDeque::new(),
            in_flight: InFlight::default(),
            peer_addr: None,
            local_addr: None,
        }
    }

    /// Wire a connected stream to this socket.
    pub(crate) fn attach(&mut self, stream: TcpStream) {
        self.peer_addr = stream.peer_addr().ok();
        self.local_addr = stream.local_addr().ok();
        self.stream = Some(Arc::new(stream));
    }

    /// Which side of the tunnel this socket is.
    pub fn side(&self) -> Side {
        self.side
    }

    pub fn read_state(&self) -> SocketState {
        self.rdstate
    }

    pub fn write_state(&self) -> SocketState {
        self.wrstate
    }

    /// Result of the last completed (or timed out) operation.
    pub fn result(&self) -> OpStatus {
        self.result
    }

    /// Bytes delivered by the last completed read.
    ///
    /// Empty unless the read state is [`SocketState::Completed`].
    pub fn data(&self) -> &[u8] {
        if self.rdstate == SocketState::Completed {
            &self.buf[..self.read_len]
        } else {
            &[]
        }
    }

    /// Mark the last read as consumed so the next read may start.
    pub fn consume(&mut self) {
        if self.rdstate == SocketState::Completed {
            self.rdstate = SocketState::Idle;
            self.read_len = 0;
        }
    }

    /// Current read buffer capacity in bytes.
    pub fn buffer_capacity(&self) -> usize {
        self.buf.len()
    }

    /// The resolved or configured connect target.
    pub fn target(&self) -> Option<SocketAddr> {
        self.target
    }

    pub fn set_target(&mut self, addr: SocketAddr) {
        self.target = Some(addr);
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    pub fn is_closed(&self) -> bool {
        self.rdstate == SocketState::Closed
    }

    /// Stop reading: cancel an in-flight read and return to `Idle`.
    ///
    /// The idle timer is disarmed unless another operation still needs it.
    pub(crate) fn read_stop(&mut self) {
        if self.is_closed() {
            return;
        }
        if let Some(handle) = self.in_flight.read.take() {
            handle.abort();
            if !self.in_flight.any() {
                self.timer.stop();
            }
        }
        self.rdstate = SocketState::Idle;
    }

    /// Transition both directions to `Closed` and hand back the resources
    /// that must be closed asynchronously.
    pub(crate) fn begin_close(&mut self) -> (Option<Arc<TcpStream>>, Option<Pin<Box<Sleep>>>) {
        debug_assert!(self.rdstate != SocketState::Closed);
        debug_assert!(self.wrstate != SocketState::Closed);
        self.rdstate = SocketState::Closed;
        self.wrstate = SocketState::Closed;
        self.in_flight.abort_io();
        self.write_queue.clear();
        (self.stream.take(), self.timer.close())
    }
}

impl fmt::Debug for SocketCtx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SocketCtx")
            .field("side", &self.side)
            .field("rdstate", &self.rdstate)
            .field("wrstate", &self.wrstate)
            .field("result", &self.result)
            .field("target", &self.target)
            .field("peer_addr", &self.peer_addr)
            .finish()
    }
}
