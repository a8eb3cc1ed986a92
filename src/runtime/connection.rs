//! Connection state machine.
//!
//! A connection moves through its states in one direction only:
//!
//! ```text
//! Connecting -> Connected -> Disconnecting -> Disconnected
//! ```
//!
//! Every connection belongs to exactly one shard, and only that shard's worker
//! drives it. Each event is handled by [`Connection::handle_event`], which
//! pumps bytes between the socket and the connection's buffers and invokes the
//! user handlers. mio readiness is edge-triggered, so a connection that is
//! still readable after one pass queues a synthetic read event for itself.

use crate::runtime::codec::{decode_frame, encode_frame, DecodeOutcome, Message};
use crate::runtime::connector::RequestResult;
use crate::runtime::context::Context;
use crate::runtime::event::{ConnEvent, Event, Readiness};
use crate::runtime::timeout::TimeoutEntry;
use crate::runtime::{lock, Buffer};
use mio::net::TcpStream;
use std::fmt;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tracing::{debug, trace};

/// Minimum free space offered to each socket read.
const MIN_READ_SPACE: usize = 512;

/// User callback invoked with the connection it belongs to.
pub type Handler = Arc<dyn Fn(&mut Connection) + Send + Sync>;

/// The three optional lifecycle callbacks of a connection.
#[derive(Clone, Default)]
pub struct Handlers {
    /// Runs once, when the first event is delivered.
    pub on_connected: Option<Handler>,
    /// Runs whenever unread input is buffered and no await is pending.
    pub on_receive: Option<Handler>,
    /// Runs once, when the connection terminates.
    pub on_disconnecting: Option<Handler>,
}

impl Handlers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connected<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut Connection) + Send + Sync + 'static,
    {
        self.on_connected = Some(Arc::new(f));
        self
    }

    pub fn receive<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut Connection) + Send + Sync + 'static,
    {
        self.on_receive = Some(Arc::new(f));
        self
    }

    pub fn disconnecting<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut Connection) + Send + Sync + 'static,
    {
        self.on_disconnecting = Some(Arc::new(f));
        self
    }
}

impl fmt::Debug for Handlers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handlers")
            .field("on_connected", &self.on_connected.is_some())
            .field("on_receive", &self.on_receive.is_some())
            .field("on_disconnecting", &self.on_disconnecting.is_some())
            .finish()
    }
}

/// Connection lifecycle state, ordered by progression.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum Status {
    Connecting = 0,
    Connected = 1,
    Disconnecting = 2,
    Disconnected = 3,
}

impl Status {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Status::Connecting,
            1 => Status::Connected,
            2 => Status::Disconnecting,
            _ => Status::Disconnected,
        }
    }
}

/// Which side opened the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnKind {
    /// Accepted by the listener.
    Passive,
    /// Opened by the connector for a sub-request.
    Active,
}

struct ConnShared {
    id: usize,
    shard: usize,
    status: Arc<AtomicU8>,
    inner: Mutex<Connection>,
}

/// Shared, strong handle to a connection.
#[derive(Clone)]
pub struct ConnectionRef(Arc<ConnShared>);

impl ConnectionRef {
    pub fn id(&self) -> usize {
        self.0.id
    }

    pub fn shard(&self) -> usize {
        self.0.shard
    }

    /// Current status, read without locking the connection.
    pub fn status(&self) -> Status {
        Status::from_u8(self.0.status.load(Ordering::Acquire))
    }

    pub fn is_connected(&self) -> bool {
        self.status() == Status::Connected
    }

    /// Lock the connection and run `f` on it.
    ///
    /// Must not be called from inside a handler of the same connection.
    pub fn with<R>(&self, f: impl FnOnce(&mut Connection) -> R) -> R {
        let mut conn = lock(&self.0.inner);
        f(&mut conn)
    }

    pub fn downgrade(&self) -> WeakConnection {
        WeakConnection(Arc::downgrade(&self.0))
    }

    /// Check if both handles refer to the same connection.
    pub fn ptr_eq(a: &ConnectionRef, b: &ConnectionRef) -> bool {
        Arc::ptr_eq(&a.0, &b.0)
    }

    pub(crate) fn handle_event(&self, event: ConnEvent) {
        self.with(|conn| conn.handle_event(event));
    }
}

impl fmt::Debug for ConnectionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionRef")
            .field("id", &self.id())
            .field("shard", &self.shard())
            .field("status", &self.status())
            .finish()
    }
}

/// Non-owning handle to a connection.
#[derive(Clone, Default)]
pub struct WeakConnection(Weak<ConnShared>);

impl WeakConnection {
    /// A handle that never upgrades.
    pub fn new() -> Self {
        Self(Weak::new())
    }

    pub fn upgrade(&self) -> Option<ConnectionRef> {
        self.0.upgrade().map(ConnectionRef)
    }

    /// Check if this handle points at `conn`.
    pub fn refers_to(&self, conn: &ConnectionRef) -> bool {
        std::ptr::eq(self.0.as_ptr(), Arc::as_ptr(&conn.0))
    }
}

impl fmt::Debug for WeakConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.upgrade() {
            Some(conn) => write!(f, "WeakConnection({})", conn.id()),
            None => f.write_str("WeakConnection(gone)"),
        }
    }
}

/// Installed await: the results it waits for and its continuation.
struct PendingAwait {
    results: Vec<RequestResult>,
    handler: Handler,
    fired: bool,
}

/// One socket endpoint and its buffered I/O state.
pub struct Connection {
    id: usize,
    shard: usize,
    kind: ConnKind,
    status: Arc<AtomicU8>,
    stream: Option<TcpStream>,
    peer: Option<SocketAddr>,
    endpoint: Option<SocketAddr>,
    input: Buffer,
    output: Buffer,
    readable: bool,
    writable: bool,
    write_closed: bool,
    handlers: Handlers,
    pending_await: Option<PendingAwait>,
    idle_entry: Option<Weak<TimeoutEntry>>,
    ctx: Arc<Context>,
    this: WeakConnection,
}

pub(crate) struct ConnectionParams {
    pub id: usize,
    pub shard: usize,
    pub kind: ConnKind,
    pub stream: TcpStream,
    pub peer: Option<SocketAddr>,
    pub endpoint: Option<SocketAddr>,
    pub handlers: Handlers,
}

impl Connection {
    pub(crate) fn create(ctx: Arc<Context>, params: ConnectionParams) -> ConnectionRef {
        let status = Arc::new(AtomicU8::new(Status::Connecting as u8));
        let buffer_size = ctx.tuning().buffer_size;
        let shared = Arc::new_cyclic(|weak| ConnShared {
            id: params.id,
            shard: params.shard,
            status: Arc::clone(&status),
            inner: Mutex::new(Connection {
                id: params.id,
                shard: params.shard,
                kind: params.kind,
                status,
                stream: Some(params.stream),
                peer: params.peer,
                endpoint: params.endpoint,
                input: Buffer::with_capacity(buffer_size),
                output: Buffer::with_capacity(buffer_size),
                readable: false,
                writable: false,
                write_closed: false,
                handlers: params.handlers,
                pending_await: None,
                idle_entry: None,
                ctx,
                this: WeakConnection(weak.clone()),
            }),
        });
        ConnectionRef(shared)
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn shard(&self) -> usize {
        self.shard
    }

    pub fn kind(&self) -> ConnKind {
        self.kind
    }

    pub fn status(&self) -> Status {
        Status::from_u8(self.status.load(Ordering::Acquire))
    }

    pub fn is_connected(&self) -> bool {
        self.status() == Status::Connected
    }

    pub fn is_disconnecting(&self) -> bool {
        self.status() == Status::Disconnecting
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// Remote `host:port` this connection was opened for (active side only).
    pub fn endpoint(&self) -> Option<SocketAddr> {
        self.endpoint
    }

    pub fn input(&self) -> &Buffer {
        &self.input
    }

    pub fn input_mut(&mut self) -> &mut Buffer {
        &mut self.input
    }

    pub fn output(&self) -> &Buffer {
        &self.output
    }

    pub fn output_mut(&mut self) -> &mut Buffer {
        &mut self.output
    }

    /// Shareable handle to this connection.
    pub fn handle(&self) -> Option<ConnectionRef> {
        self.this.upgrade()
    }

    pub(crate) fn context(&self) -> &Arc<Context> {
        &self.ctx
    }

    pub(crate) fn weak(&self) -> WeakConnection {
        self.this.clone()
    }

    pub(crate) fn clear_handlers(&mut self) {
        self.handlers = Handlers::default();
    }

    /// Queue bytes for sending. Dropped unless connected.
    ///
    /// Output is flushed after the current event, or by [`Connection::flush`].
    pub fn write_data(&mut self, data: impl AsRef<[u8]>) {
        let data = data.as_ref();
        if !self.is_connected() {
            debug!(conn_id = self.id, len = data.len(), status = ?self.status(), "Dropping write on inactive connection");
            return;
        }
        self.clock_in();
        self.output.append(data);
    }

    /// Queue one framed message for sending. Dropped unless connected.
    pub fn write_message(&mut self, message: &dyn Message) {
        if !self.is_connected() {
            debug!(conn_id = self.id, type_name = message.type_name(), "Dropping message on inactive connection");
            return;
        }
        self.clock_in();
        encode_frame(message, &mut self.output);
    }

    /// Decode one frame from the input buffer.
    pub fn decode_message(&mut self) -> DecodeOutcome {
        let max_frame_size = self.ctx.tuning().max_frame_size;
        decode_frame(&mut self.input, self.ctx.messages(), max_frame_size)
    }

    /// Write as much buffered output as the socket accepts right now.
    pub fn flush(&mut self) {
        self.send_data();
        self.half_close_if_drained();
    }

    /// Run `action` on this connection's shard after roughly `duration`.
    pub fn set_timeout<F>(&mut self, duration: Duration, action: F) -> Weak<TimeoutEntry>
    where
        F: FnOnce() + Send + 'static,
    {
        self.ctx
            .schedule(self.shard, self.weak(), duration, Some(Box::new(action)))
    }

    /// Close politely: pending output is still sent, then the write side is
    /// half-closed. Further input is read and discarded.
    pub fn shutdown(&mut self) {
        if self.status() >= Status::Disconnecting {
            return;
        }
        debug!(conn_id = self.id, "Connection shutting down");
        self.set_status(Status::Disconnecting);
        self.flush();
    }

    /// Close immediately. Idempotent.
    pub fn terminate(&mut self) {
        if self.status() == Status::Disconnected {
            return;
        }
        self.set_status(Status::Disconnected);

        if self.kind == ConnKind::Active {
            if let Some(endpoint) = self.endpoint {
                self.ctx.connector().remove_idle(endpoint, &self.this);
            }
        }

        if let Some(handler) = self.handlers.on_disconnecting.clone() {
            handler(self);
        }

        if let Some(mut stream) = self.stream.take() {
            if let Err(e) = self.ctx.deregister(&mut stream) {
                debug!(conn_id = self.id, error = %e, "Deregister failed");
            }
        }
        self.ctx.remove_connection(self.id, &self.this);

        self.handlers = Handlers::default();
        self.pending_await = None;
        self.idle_entry = None;
        self.input.clear();
        self.output.clear();

        debug!(conn_id = self.id, shard = self.shard, peer = ?self.peer, "Connection terminated");
    }

    /// Wait for every result in `results` to settle, then run `handler`.
    ///
    /// If all are already settled the handler runs before this returns.
    /// Otherwise inbound delivery to this connection is suppressed until
    /// [`Connection::request_resolved`] is called or the await is replaced.
    pub fn await_results<F>(&mut self, results: &[RequestResult], handler: F)
    where
        F: Fn(&mut Connection) + Send + Sync + 'static,
    {
        if results.iter().all(RequestResult::is_settled) {
            handler(self);
            return;
        }
        trace!(conn_id = self.id, pending = results.len(), "Await installed");
        self.pending_await = Some(PendingAwait {
            results: results.to_vec(),
            handler: Arc::new(handler),
            fired: false,
        });
    }

    /// Clear the installed await and resume inbound delivery.
    pub fn request_resolved(&mut self) {
        self.pending_await = None;
        if !self.input.is_empty() {
            self.inject(Readiness::Read);
        }
    }

    /// Check if an await is installed.
    pub fn is_awaiting(&self) -> bool {
        self.pending_await.is_some()
    }

    /// Send `message` to `host:port` using the default timeout.
    pub fn sub_request(&mut self, host: &str, port: u16, message: &dyn Message) -> RequestResult {
        let ctx = Arc::clone(&self.ctx);
        ctx.connector()
            .init_sub_request(self, host, port, message, None)
    }

    /// Send `message` to `host:port`, rejecting after `timeout`.
    pub fn sub_request_with_timeout(
        &mut self,
        host: &str,
        port: u16,
        message: &dyn Message,
        timeout: Duration,
    ) -> RequestResult {
        let ctx = Arc::clone(&self.ctx);
        ctx.connector()
            .init_sub_request(self, host, port, message, Some(timeout))
    }

    pub(crate) fn handle_event(&mut self, event: ConnEvent) {
        if self.status() == Status::Disconnected {
            return;
        }

        match event {
            ConnEvent::Io(readiness) => {
                self.readable |= readiness.is_readable();
                self.writable |= readiness.is_writable();
            }
            ConnEvent::Settled { sub_id, outcome } => {
                trace!(conn_id = self.id, sub_id, ?outcome, "Sub-request settled");
                if self.is_connected() {
                    self.clock_in();
                    self.resume_await();
                }
            }
        }

        if self.status() == Status::Connecting && !self.finish_connect() {
            return;
        }

        self.pump();
    }

    /// Install a new set of handlers on a pooled connection and replay the
    /// connect step for them.
    pub(crate) fn rebind(&mut self, handlers: Handlers) {
        self.handlers = handlers;
        if self.status() >= Status::Disconnecting {
            debug!(conn_id = self.id, "Pooled connection closed before reuse");
            if let Some(handler) = self.handlers.on_disconnecting.clone() {
                handler(self);
            }
            self.handlers = Handlers::default();
            return;
        }

        self.input.clear();
        trace!(conn_id = self.id, endpoint = ?self.endpoint, "Pooled connection rebound");
        if self.is_connected() {
            self.invoke_connected();
        }
        self.pump();
    }

    /// Take the Connecting -> Connected step. Returns false if the socket
    /// is not connected yet or failed.
    fn finish_connect(&mut self) -> bool {
        if self.kind == ConnKind::Active {
            let connected = match self.stream.as_ref() {
                None => return false,
                Some(stream) => match stream.take_error() {
                    Ok(None) => stream.peer_addr(),
                    Ok(Some(e)) | Err(e) => Err(e),
                },
            };
            match connected {
                Ok(addr) => self.peer = Some(addr),
                Err(e) if e.kind() == io::ErrorKind::NotConnected => return false,
                Err(e) => {
                    debug!(conn_id = self.id, endpoint = ?self.endpoint, error = %e, "Connect failed");
                    self.terminate();
                    return false;
                }
            }
        }

        self.set_status(Status::Connected);
        debug!(conn_id = self.id, shard = self.shard, kind = ?self.kind, peer = ?self.peer, "Connection established");

        if self.kind == ConnKind::Passive {
            if let Some(idle) = self.ctx.tuning().idle_timeout {
                self.idle_entry = Some(self.ctx.schedule(self.shard, self.weak(), idle, None));
            }
        }

        self.invoke_connected();
        true
    }

    fn pump(&mut self) {
        self.send_data();
        self.receive_data();

        if self.is_connected() && !self.input.is_empty() && self.pending_await.is_none() {
            if let Some(handler) = self.handlers.on_receive.clone() {
                handler(self);
            }
        }

        self.send_data();

        if self.readable && self.status() < Status::Disconnected {
            self.inject(Readiness::Read);
        }

        self.half_close_if_drained();
    }

    fn invoke_connected(&mut self) {
        if let Some(handler) = self.handlers.on_connected.clone() {
            handler(self);
        }
    }

    fn resume_await(&mut self) {
        let handler = match self.pending_await.as_mut() {
            Some(pending) if !pending.fired && pending.results.iter().all(RequestResult::is_settled) => {
                pending.fired = true;
                Arc::clone(&pending.handler)
            }
            _ => return,
        };
        trace!(conn_id = self.id, "Await complete");
        handler(self);
    }

    fn receive_data(&mut self) {
        let tuning = self.ctx.tuning();
        let (budget, cap) = (tuning.read_budget, tuning.max_suppressed_input);
        let mut total = 0;

        while self.readable {
            if self.pending_await.is_some() && self.input.len() >= cap {
                debug!(conn_id = self.id, buffered = self.input.len(), "Input suppressed while awaiting");
                self.readable = false;
                break;
            }
            if total >= budget {
                break;
            }

            let Some(stream) = self.stream.as_mut() else {
                return;
            };
            let spare = self.input.spare(MIN_READ_SPACE);
            match stream.read(spare) {
                Ok(0) => {
                    debug!(conn_id = self.id, peer = ?self.peer, "Peer closed connection");
                    self.terminate();
                    return;
                }
                Ok(n) => {
                    if self.is_connected() {
                        self.input.commit(n);
                    }
                    total += n;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => self.readable = false,
                Err(e) => {
                    debug!(conn_id = self.id, error = %e, "Read failed");
                    self.terminate();
                    return;
                }
            }
        }

        if total > 0 {
            trace!(conn_id = self.id, bytes = total, "Read");
            self.clock_in();
        }
    }

    fn send_data(&mut self) {
        let mut total = 0;

        while self.writable && !self.output.is_empty() {
            let Some(stream) = self.stream.as_mut() else {
                return;
            };
            match stream.write(self.output.as_slice()) {
                Ok(0) => {
                    debug!(conn_id = self.id, "Write returned zero bytes");
                    self.terminate();
                    return;
                }
                Ok(n) => {
                    self.output.consume(n);
                    total += n;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => self.writable = false,
                Err(e) => {
                    debug!(conn_id = self.id, error = %e, "Write failed");
                    self.terminate();
                    return;
                }
            }
        }

        if total > 0 {
            trace!(conn_id = self.id, bytes = total, "Wrote");
        }
    }

    fn half_close_if_drained(&mut self) {
        if !self.is_disconnecting() || self.write_closed || !self.output.is_empty() {
            return;
        }
        if let Some(stream) = self.stream.as_ref() {
            if let Err(e) = stream.shutdown(Shutdown::Write) {
                debug!(conn_id = self.id, error = %e, "Half-close failed");
            }
        }
        self.write_closed = true;
    }

    fn inject(&self, readiness: Readiness) {
        if let Some(conn) = self.handle() {
            self.ctx.post(self.shard, Event::Io { conn, readiness });
        }
    }

    fn clock_in(&self) {
        if let Some(entry) = &self.idle_entry {
            self.ctx.clock_in(self.shard, entry);
        }
    }

    fn set_status(&self, status: Status) {
        // fetch_max keeps the state machine forward-only
        self.status.fetch_max(status as u8, Ordering::AcqRel);
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("shard", &self.shard)
            .field("kind", &self.kind)
            .field("status", &self.status())
            .field("peer", &self.peer)
            .field("input", &self.input.len())
            .field("output", &self.output.len())
            .field("awaiting", &self.pending_await.is_some())
            .finish()
    }
}
