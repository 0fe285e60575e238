//! Tunnel (session) lifecycle.
//!
//! A [`Tunnel`] owns the incoming and outgoing [`SocketCtx`], the
//! collaborator's [`TunnelHandler`], and every operation in flight. It runs as
//! a single task: operations are boxed futures polled from one
//! `FuturesUnordered`, and each completion is dispatched back to the handler
//! on the same task, so no state is ever shared or locked.
//!
//! ## Teardown
//!
//! ```text
//! shutdown ─┬─ abort pending resolve (best effort)
//!           ├─ close incoming ─┬─ stream close ──┐
//!           │                  └─ timer close ───┤
//!           ├─ close outgoing ─┬─ stream close ──┤  each completion releases
//!           │                  └─ timer close ───┤  the close barrier once
//!           └─ terminated = true                 │
//!                                                └─> count == 0: on_destroy, drop
//! ```
//!
//! Completions that arrive after `shutdown` observe `terminated` and do
//! nothing, except close completions, which drive the barrier.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::future::{abortable, AbortHandle, BoxFuture, FutureExt};
use futures_util::stream::{FuturesUnordered, StreamExt};
use tokio::net::TcpStream;
use tracing::{debug, trace, Instrument};

use crate::config::duration_ms;

use super::error::TunnelError;
use super::resolver;
use super::socket::{OpStatus, Side, SocketCtx, SocketState};

/// Default idle timeout for every socket operation.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Read size requested from [`TunnelHandler::alloc_size_hint`] before each read.
pub const DEFAULT_READ_SIZE: usize = 64 * 1024;

/// Per-tunnel configuration supplied by the listener.
#[derive(Debug, Clone)]
pub struct TunnelConfig {
    /// Idle timeout armed by every read, write, connect and resolve.
    pub idle_timeout: Duration,
    /// Local address of the listener that accepted the connection.
    pub listener_addr: Option<SocketAddr>,
}

impl TunnelConfig {
    pub fn new(idle_timeout: Duration) -> Self {
        Self {
            idle_timeout,
            listener_addr: None,
        }
    }

    pub fn with_listener_addr(mut self, addr: SocketAddr) -> Self {
        self.listener_addr = Some(addr);
        self
    }
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self::new(DEFAULT_IDLE_TIMEOUT)
    }
}

/// Protocol hooks supplied by the collaborator driving a tunnel.
///
/// Each completion hook inspects the socket's recorded result and decides the
/// next operation (another read, a write, a connect) or calls
/// [`Tunnel::shutdown`]. A hook returning `Err` shuts the tunnel down.
///
/// Hooks receive the whole tunnel; the handler's own state is reachable
/// through [`Tunnel::handler`] and [`Tunnel::handler_mut`].
pub trait TunnelHandler: Send + Sized + 'static {
    /// Called once after both sockets exist. Returning `false` shuts the
    /// tunnel down before any I/O starts.
    fn on_init(tunnel: &mut Tunnel<Self>) -> bool;

    /// A connect finished (successfully or not, except refusal).
    fn on_outgoing_connected(tunnel: &mut Tunnel<Self>, side: Side) -> Result<(), TunnelError>;

    /// A read delivered data; it is available through [`SocketCtx::data`].
    fn on_read_done(tunnel: &mut Tunnel<Self>, side: Side) -> Result<(), TunnelError>;

    /// A write finished; the outcome is in [`SocketCtx::result`].
    fn on_write_done(tunnel: &mut Tunnel<Self>, side: Side) -> Result<(), TunnelError>;

    /// A resolution finished; on success the socket's target is set.
    fn on_resolve_done(tunnel: &mut Tunnel<Self>, side: Side) -> Result<(), TunnelError>;

    /// An idle timer expired. The tunnel shuts down right after this returns.
    fn on_timeout(_tunnel: &mut Tunnel<Self>, _side: Side) {}

    /// Final hook, called exactly once before the tunnel is dropped.
    fn on_destroy(_tunnel: &mut Tunnel<Self>) {}

    /// Whether reads and writes are continuous rather than one at a time.
    fn is_streaming(&self) -> bool;

    /// Adjust the read buffer size requested before each read.
    fn alloc_size_hint(&self, requested: usize) -> usize {
        requested
    }
}

#[derive(Debug, Clone, Copy)]
enum Op {
    Read,
    Write,
    Connect,
    Resolve,
}

#[derive(Debug, Clone, Copy)]
enum Resource {
    Stream,
    Timer,
}

enum Completion {
    /// The stream became readable; the bytes are taken in `read_done`.
    Read {
        side: Side,
        result: io::Result<()>,
    },
    Write {
        side: Side,
        result: io::Result<usize>,
    },
    Connect {
        side: Side,
        result: io::Result<TcpStream>,
    },
    Resolve {
        side: Side,
        result: io::Result<SocketAddr>,
    },
    Canceled {
        side: Side,
        op: Op,
    },
    Closed {
        side: Side,
        resource: Resource,
    },
}

enum Event {
    Done(Completion),
    Expired(Side),
}

/// Counts outstanding asynchronous closes. The tunnel is destroyed when the
/// count returns to zero.
#[derive(Debug, Default)]
pub(crate) struct CloseBarrier {
    outstanding: usize,
}

impl CloseBarrier {
    pub(crate) fn acquire(&mut self) {
        self.outstanding += 1;
    }

    /// Returns true when the last outstanding close has completed.
    pub(crate) fn release(&mut self) -> bool {
        debug_assert!(self.outstanding > 0, "close barrier released too often");
        self.outstanding = self.outstanding.saturating_sub(1);
        self.outstanding == 0
    }

    pub(crate) fn outstanding(&self) -> usize {
        self.outstanding
    }
}

/// A paired client/target session driven by a [`TunnelHandler`].
pub struct Tunnel<H: TunnelHandler> {
    incoming: SocketCtx,
    outgoing: SocketCtx,
    barrier: CloseBarrier,
    terminated: bool,
    destroyed: bool,
    resolve_pending: bool,
    listener_addr: Option<SocketAddr>,
    idle_timeout: Duration,
    ops: FuturesUnordered<BoxFuture<'static, Completion>>,
    handler: H,
}

impl<H: TunnelHandler> Tunnel<H> {
    /// Run a tunnel for an accepted connection until it is destroyed.
    ///
    /// Calls [`TunnelHandler::on_init`]; on success the first read is issued
    /// on the incoming socket, otherwise the tunnel shuts down without I/O.
    pub async fn serve(stream: TcpStream, config: TunnelConfig, handler: H) {
        let peer = stream.peer_addr().ok();
        let span = tracing::debug_span!("tunnel", peer = ?peer);

        async move {
            let mut tunnel = Self::new(config, handler);
            tunnel.incoming.attach(stream);
            tunnel.init();
            tunnel.run().await;
        }
        .instrument(span)
        .await
    }

    pub(crate) fn new(config: TunnelConfig, handler: H) -> Self {
        Self {
            incoming: SocketCtx::new(Side::Incoming, config.idle_timeout),
            outgoing: SocketCtx::new(Side::Outgoing, config.idle_timeout),
            barrier: CloseBarrier::default(),
            terminated: false,
            destroyed: false,
            resolve_pending: false,
            listener_addr: config.listener_addr,
            idle_timeout: config.idle_timeout,
            ops: FuturesUnordered::new(),
            handler,
        }
    }

    fn init(&mut self) {
        if !H::on_init(self) {
            debug!("handler rejected tunnel at init");
            self.shutdown();
            return;
        }

        // Wait for the initial packet.
        if let Err(e) = self.read(Side::Incoming) {
            debug!(error = %e, "initial read failed");
            self.shutdown();
        }
    }

    async fn run(&mut self) {
        while !self.destroyed {
            if !self.terminated
                && self.ops.is_empty()
                && !self.incoming.timer.is_armed()
                && !self.outgoing.timer.is_armed()
            {
                debug!("tunnel stalled with nothing in flight");
                self.shutdown();
                continue;
            }

            let event = tokio::select! {
                Some(done) = self.ops.next(), if !self.ops.is_empty() => Event::Done(done),
                () = self.incoming.timer.expired() => Event::Expired(Side::Incoming),
                () = self.outgoing.timer.expired() => Event::Expired(Side::Outgoing),
            };

            match event {
                Event::Done(done) => self.complete(done),
                Event::Expired(side) => self.timer_expired(side),
            }
        }
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    pub fn socket(&self, side: Side) -> &SocketCtx {
        match side {
            Side::Incoming => &self.incoming,
            Side::Outgoing => &self.outgoing,
        }
    }

    pub fn socket_mut(&mut self, side: Side) -> &mut SocketCtx {
        match side {
            Side::Incoming => &mut self.incoming,
            Side::Outgoing => &mut self.outgoing,
        }
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    pub fn handler_mut(&mut self) -> &mut H {
        &mut self.handler
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    pub fn is_resolve_pending(&self) -> bool {
        self.resolve_pending
    }

    /// Number of asynchronous closes still outstanding.
    pub fn ref_count(&self) -> usize {
        self.barrier.outstanding()
    }

    pub fn listener_addr(&self) -> Option<SocketAddr> {
        self.listener_addr
    }

    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    // ------------------------------------------------------------------
    // Operations
    // ------------------------------------------------------------------

    /// Start reading from `side`.
    ///
    /// The read state must be `Idle` (streaming tunnels may also re-read from
    /// `Completed`). The buffer is resized to the handler's size hint.
    pub fn read(&mut self, side: Side) -> Result<(), TunnelError> {
        self.ensure_live()?;
        let streaming = self.handler.is_streaming();
        let size = self.handler.alloc_size_hint(DEFAULT_READ_SIZE).max(1);

        let socket = self.socket_mut(side);
        match socket.rdstate {
            SocketState::Idle => {}
            SocketState::Completed if streaming => {}
            SocketState::Closed => return Err(TunnelError::SocketClosed(side)),
            state => {
                return Err(TunnelError::InvalidState {
                    op: "read",
                    side,
                    state,
                })
            }
        }
        let stream = socket
            .stream
            .clone()
            .ok_or(TunnelError::NotConnected(side))?;

        socket.buf.resize(size, 0);
        socket.buf.shrink_to(size);
        socket.read_len = 0;
        socket.rdstate = SocketState::InProgress;
        socket.timer.start();

        self.spawn_read(side, stream);
        Ok(())
    }

    /// Stop reading from `side` and reset its read state to `Idle`.
    pub fn read_stop(&mut self, side: Side) {
        self.socket_mut(side).read_stop();
    }

    /// Write `data` to `side`.
    ///
    /// The write state must be `Idle` or `Completed`. Streaming tunnels may
    /// write while a write is in progress; the data is queued behind it.
    pub fn write(&mut self, side: Side, data: impl Into<Bytes>) -> Result<(), TunnelError> {
        self.ensure_live()?;
        let streaming = self.handler.is_streaming();
        let data = data.into();

        let socket = self.socket_mut(side);
        match socket.wrstate {
            SocketState::Idle | SocketState::Completed => {}
            SocketState::InProgress if streaming => {
                socket.write_queue.push_back(data);
                return Ok(());
            }
            SocketState::Closed => return Err(TunnelError::SocketClosed(side)),
            state => {
                return Err(TunnelError::InvalidState {
                    op: "write",
                    side,
                    state,
                })
            }
        }
        let stream = socket
            .stream
            .clone()
            .ok_or(TunnelError::NotConnected(side))?;

        socket.wrstate = SocketState::InProgress;
        socket.timer.start();

        self.spawn_write(side, stream, data);
        Ok(())
    }

    /// Connect `side` to its target address.
    pub fn connect(&mut self, side: Side) -> Result<(), TunnelError> {
        self.ensure_live()?;

        let socket = self.socket_mut(side);
        if socket.is_closed() {
            return Err(TunnelError::SocketClosed(side));
        }
        if socket.stream.is_some() || socket.in_flight.connect.is_some() {
            return Err(TunnelError::AlreadyConnected(side));
        }
        let addr = socket.target.ok_or(TunnelError::NoTargetAddress(side))?;
        socket.timer.start();

        trace!(side = %side, addr = %addr, "connecting");
        let handle = self.push(side, Op::Connect, async move {
            Completion::Connect {
                side,
                result: TcpStream::connect(addr).await,
            }
        });
        self.socket_mut(side).in_flight.connect = Some(handle);
        Ok(())
    }

    /// Resolve `host` and store the first answer (with `port`) as the
    /// target of `side`.
    ///
    /// `host` is taken as raw name bytes; a name that is not UTF-8 is
    /// reported to [`TunnelHandler::on_resolve_done`] as a failed lookup.
    pub fn resolve(
        &mut self,
        side: Side,
        host: impl Into<Vec<u8>>,
        port: u16,
    ) -> Result<(), TunnelError> {
        self.ensure_live()?;
        if self.resolve_pending {
            return Err(TunnelError::ResolvePending);
        }
        if self.socket(side).is_closed() {
            return Err(TunnelError::SocketClosed(side));
        }

        let host = host.into();
        let handle = self.push(side, Op::Resolve, async move {
            Completion::Resolve {
                side,
                result: resolver::resolve_first(host, port).await,
            }
        });

        let socket = self.socket_mut(side);
        socket.in_flight.resolve = Some(handle);
        socket.timer.start();
        self.resolve_pending = true;
        Ok(())
    }

    /// Shut the tunnel down. Idempotent.
    ///
    /// Cancels a pending resolution (best effort), closes both sockets and
    /// marks the tunnel terminated. The tunnel is destroyed once every close
    /// has completed.
    pub fn shutdown(&mut self) {
        if self.terminated {
            return;
        }
        debug!(resolve_pending = self.resolve_pending, "shutting down tunnel");

        // The resolve completion still runs and observes the cancellation.
        if self.resolve_pending {
            for side in [Side::Incoming, Side::Outgoing] {
                if let Some(handle) = self.socket_mut(side).in_flight.resolve.take() {
                    handle.abort();
                }
            }
        }

        self.close_socket(Side::Incoming);
        self.close_socket(Side::Outgoing);
        self.terminated = true;
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn ensure_live(&self) -> Result<(), TunnelError> {
        if self.terminated {
            Err(TunnelError::Terminated)
        } else {
            Ok(())
        }
    }

    fn push<F>(&mut self, side: Side, op: Op, fut: F) -> AbortHandle
    where
        F: Future<Output = Completion> + Send + 'static,
    {
        let (fut, handle) = abortable(fut);
        self.ops.push(
            fut.map(move |done| done.unwrap_or(Completion::Canceled { side, op }))
                .boxed(),
        );
        handle
    }

    fn spawn_read(&mut self, side: Side, stream: Arc<TcpStream>) {
        let handle = self.push(side, Op::Read, async move {
            Completion::Read {
                side,
                result: stream.readable().await,
            }
        });
        self.socket_mut(side).in_flight.read = Some(handle);
    }

    fn spawn_write(&mut self, side: Side, stream: Arc<TcpStream>, data: Bytes) {
        let handle = self.push(side, Op::Write, async move {
            let result = write_all(&stream, &data).await.map(|()| data.len());
            Completion::Write { side, result }
        });
        self.socket_mut(side).in_flight.write = Some(handle);
    }

    fn close_socket(&mut self, side: Side) {
        let (stream, timer) = self.socket_mut(side).begin_close();

        self.barrier.acquire();
        self.ops.push(
            async move {
                if let Some(stream) = stream {
                    release_stream(stream).await;
                }
                Completion::Closed {
                    side,
                    resource: Resource::Stream,
                }
            }
            .boxed(),
        );

        self.barrier.acquire();
        self.ops.push(
            async move {
                drop(timer);
                Completion::Closed {
                    side,
                    resource: Resource::Timer,
                }
            }
            .boxed(),
        );
    }

    fn complete(&mut self, done: Completion) {
        match done {
            Completion::Read { side, result } => self.read_done(side, result),
            Completion::Write { side, result } => self.write_done(side, result),
            Completion::Connect { side, result } => self.connect_done(side, result),
            Completion::Resolve { side, result } => self.resolve_done(side, Some(result)),
            Completion::Canceled { side, op } => self.canceled(side, op),
            Completion::Closed { side, resource } => self.close_done(side, resource),
        }
    }

    fn read_done(&mut self, side: Side, result: io::Result<()>) {
        if self.terminated {
            return;
        }

        let socket = self.socket_mut(side);
        socket.in_flight.read = None;
        let Some(stream) = socket.stream.clone() else {
            return;
        };
        let result = result.and_then(|()| stream.try_read(&mut socket.buf));

        // Spurious readiness: nothing to report yet, keep the read armed.
        if matches!(&result, Err(e) if e.kind() == io::ErrorKind::WouldBlock) {
            self.spawn_read(side, stream);
            return;
        }

        settle_timer(socket);

        let n = match result {
            Ok(0) => {
                socket.result = OpStatus::Failed(io::ErrorKind::UnexpectedEof);
                trace!(side = %side, "end of stream");
                self.shutdown();
                return;
            }
            Err(e) => {
                socket.result = OpStatus::from(&e);
                trace!(side = %side, error = %e, "read failed");
                self.shutdown();
                return;
            }
            Ok(n) => n,
        };

        socket.rdstate = SocketState::Completed;
        socket.read_len = n;
        socket.result = OpStatus::Success(n);

        let outcome = H::on_read_done(self, side);
        self.after_hook(outcome, "on_read_done");

        // Streaming reads keep going unless the handler stopped or re-issued.
        if !self.terminated
            && self.handler.is_streaming()
            && self.socket(side).rdstate == SocketState::Completed
        {
            if let Err(e) = self.read(side) {
                debug!(side = %side, error = %e, "could not continue streaming read");
                self.shutdown();
            }
        }
    }

    fn write_done(&mut self, side: Side, result: io::Result<usize>) {
        if self.terminated {
            return;
        }

        let socket = self.socket_mut(side);
        socket.in_flight.write = None;
        settle_timer(socket);
        socket.wrstate = SocketState::Completed;
        socket.result = match &result {
            Ok(n) => OpStatus::Success(*n),
            Err(e) => {
                socket.write_queue.clear();
                OpStatus::from(e)
            }
        };

        if let Some(next) = socket.write_queue.pop_front() {
            if let Some(stream) = socket.stream.clone() {
                socket.wrstate = SocketState::InProgress;
                socket.timer.start();
                self.spawn_write(side, stream, next);
            }
        }

        let outcome = H::on_write_done(self, side);
        self.after_hook(outcome, "on_write_done");
    }

    fn connect_done(&mut self, side: Side, result: io::Result<TcpStream>) {
        if self.terminated {
            return;
        }

        let socket = self.socket_mut(side);
        socket.in_flight.connect = None;
        settle_timer(socket);

        match result {
            Ok(stream) => {
                socket.attach(stream);
                socket.result = OpStatus::Success(0);
            }
            Err(e) => {
                socket.result = OpStatus::from(&e);
                if e.kind() == io::ErrorKind::ConnectionRefused {
                    debug!(side = %side, "connection refused");
                    self.shutdown();
                    return;
                }
            }
        }

        let outcome = H::on_outgoing_connected(self, side);
        self.after_hook(outcome, "on_outgoing_connected");
    }

    /// `None` means the lookup was canceled.
    fn resolve_done(&mut self, side: Side, result: Option<io::Result<SocketAddr>>) {
        self.resolve_pending = false;
        if self.terminated {
            return;
        }

        let socket = self.socket_mut(side);
        socket.in_flight.resolve = None;
        settle_timer(socket);
        socket.result = match result {
            Some(Ok(addr)) => {
                socket.target = Some(addr);
                OpStatus::Success(0)
            }
            Some(Err(e)) => {
                trace!(side = %side, error = %e, "resolve failed");
                OpStatus::from(&e)
            }
            None => OpStatus::Canceled,
        };

        let outcome = H::on_resolve_done(self, side);
        self.after_hook(outcome, "on_resolve_done");
    }

    fn canceled(&mut self, side: Side, op: Op) {
        match op {
            Op::Resolve => self.resolve_done(side, None),
            // Reads are only canceled by read_stop or close; neither expects
            // a completion.
            Op::Read => {}
            Op::Write | Op::Connect => {
                if self.terminated {
                    return;
                }
                self.socket_mut(side).result = OpStatus::Canceled;
                self.shutdown();
            }
        }
    }

    fn timer_expired(&mut self, side: Side) {
        let socket = self.socket_mut(side);
        socket.timer.stop();
        socket.result = OpStatus::Failed(io::ErrorKind::TimedOut);

        if self.terminated {
            return;
        }

        debug!(side = %side, timeout_ms = duration_ms(self.idle_timeout), "idle timeout");
        H::on_timeout(self, side);
        self.shutdown();
    }

    fn close_done(&mut self, side: Side, resource: Resource) {
        trace!(
            side = %side,
            resource = ?resource,
            outstanding = self.barrier.outstanding(),
            "close completed"
        );
        if self.barrier.release() {
            self.destroy();
        }
    }

    fn destroy(&mut self) {
        debug_assert!(!self.destroyed);
        H::on_destroy(self);
        self.destroyed = true;
        debug!("tunnel destroyed");
    }

    fn after_hook(&mut self, outcome: Result<(), TunnelError>, hook: &'static str) {
        if let Err(e) = outcome {
            debug!(hook, error = %e, "handler failed, shutting down");
            self.shutdown();
        }
    }
}

/// Disarm the idle timer unless another operation on the socket still needs it.
fn settle_timer(socket: &mut SocketCtx) {
    if !socket.in_flight.any() {
        socket.timer.stop();
    }
}

/// Drop the tunnel's handle once it is the last one, so the descriptor is
/// closed when the close completes. Aborted reads and writes release their
/// clones the next time they are polled.
async fn release_stream(mut stream: Arc<TcpStream>) {
    loop {
        match Arc::try_unwrap(stream) {
            Ok(owned) => {
                drop(owned);
                return;
            }
            Err(shared) => {
                stream = shared;
                tokio::task::yield_now().await;
            }
        }
    }
}

async fn write_all(stream: &TcpStream, mut data: &[u8]) -> io::Result<()> {
    while !data.is_empty() {
        stream.writable().await?;
        match stream.try_write(data) {
            Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
            Ok(n) => data = &data[n..],
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(())
}
