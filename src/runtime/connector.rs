//! Outbound sub-requests and the idle connection pool.
//!
//! A handler on a master connection calls [`Connector::init_sub_request`]
//! (usually through [`Connection::sub_request`]) and immediately gets a
//! [`RequestResult`] back. The request is sent on a pooled connection to the
//! same endpoint if one is idle, or on a freshly opened one. When the response
//! arrives, times out, or the connection drops, the result settles exactly
//! once and a settlement event is posted to the master's shard.
//!
//! Resolved sub-connections go back to their endpoint's pool with their
//! handlers cleared. Rejected ones are always terminated.

use crate::runtime::codec::{encode_to_bytes, DecodeOutcome, Message};
use crate::runtime::connection::{Connection, ConnectionRef, Handlers, WeakConnection};
use crate::runtime::event::Event;
use crate::runtime::lock;
use bytes::Bytes;
use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, trace, warn};

/// Sub-request timeout when none is configured.
pub const DEFAULT_SUB_REQUEST_TIMEOUT: Duration = Duration::from_secs(6);

/// Why a sub-request was rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Rejection {
    #[error("request timed out")]
    Timeout,

    #[error("connection closed by peer")]
    ConnectionClosedByPeer,

    #[error("unknown message type: {0}")]
    UnknownMessageType(String),

    #[error("parse error: {0}")]
    ParseError(String),

    #[error("connect failed")]
    ConnectFailed,
}

/// Settlement kind carried to the master's shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    Resolved,
    Rejected,
}

/// Observable state of a [`RequestResult`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultStatus {
    Pending,
    Resolved,
    Rejected,
}

enum ResultState {
    Pending,
    Resolved(Arc<dyn Message>),
    Rejected(Rejection),
}

struct ResultInner {
    master: WeakConnection,
    sub: OnceLock<ConnectionRef>,
    state: Mutex<ResultState>,
}

/// Shared outcome of one sub-request. Settles at most once.
#[derive(Clone)]
pub struct RequestResult(Arc<ResultInner>);

impl RequestResult {
    pub(crate) fn new(master: &Connection) -> Self {
        Self(Arc::new(ResultInner {
            master: master.weak(),
            sub: OnceLock::new(),
            state: Mutex::new(ResultState::Pending),
        }))
    }

    /// A result that is rejected before any connection exists.
    pub(crate) fn rejected(master: &Connection, reason: Rejection) -> Self {
        let result = Self::new(master);
        result.settle(ResultState::Rejected(reason));
        result
    }

    pub fn status(&self) -> ResultStatus {
        match &*lock(&self.0.state) {
            ResultState::Pending => ResultStatus::Pending,
            ResultState::Resolved(_) => ResultStatus::Resolved,
            ResultState::Rejected(_) => ResultStatus::Rejected,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.status() == ResultStatus::Pending
    }

    pub fn is_resolved(&self) -> bool {
        self.status() == ResultStatus::Resolved
    }

    pub fn is_rejected(&self) -> bool {
        self.status() == ResultStatus::Rejected
    }

    pub fn is_settled(&self) -> bool {
        !self.is_pending()
    }

    /// The decoded response, once resolved.
    pub fn message(&self) -> Option<Arc<dyn Message>> {
        match &*lock(&self.0.state) {
            ResultState::Resolved(message) => Some(Arc::clone(message)),
            _ => None,
        }
    }

    /// The decoded response as a concrete type.
    pub fn message_as<T: Message>(&self) -> Option<Arc<T>> {
        self.message()?.downcast_arc::<T>().ok()
    }

    /// Why the request was rejected, once rejected.
    pub fn rejection(&self) -> Option<Rejection> {
        match &*lock(&self.0.state) {
            ResultState::Rejected(reason) => Some(reason.clone()),
            _ => None,
        }
    }

    /// The connection that carried the request, if one was opened or reused.
    pub fn sub_connection(&self) -> Option<ConnectionRef> {
        self.0.sub.get().cloned()
    }

    /// Check if both requests were carried by the same connection.
    pub fn same_sub_connection(&self, other: &RequestResult) -> bool {
        match (self.0.sub.get(), other.0.sub.get()) {
            (Some(a), Some(b)) => ConnectionRef::ptr_eq(a, b),
            _ => false,
        }
    }

    pub(crate) fn bind_sub(&self, sub: ConnectionRef) {
        let _ = self.0.sub.set(sub);
    }

    /// Settle with `message`, hand the sub-connection back to its pool and
    /// notify the master.
    pub(crate) fn resolve(&self, sub: &mut Connection, message: Box<dyn Message>) {
        if !self.settle(ResultState::Resolved(Arc::from(message))) {
            return;
        }
        trace!(sub = sub.id(), endpoint = ?sub.endpoint(), "Sub-request resolved");

        sub.clear_handlers();
        if sub.is_connected() {
            if let (Some(endpoint), Some(handle)) = (sub.endpoint(), sub.handle()) {
                sub.context().connector().release(endpoint, handle);
            }
        }
        self.notify(sub, Settlement::Resolved);
    }

    /// Settle with `reason`, notify the master and terminate the
    /// sub-connection.
    pub(crate) fn reject(&self, sub: &mut Connection, reason: Rejection) {
        let detail = reason.to_string();
        if !self.settle(ResultState::Rejected(reason)) {
            return;
        }
        debug!(sub = sub.id(), endpoint = ?sub.endpoint(), reason = %detail, "Sub-request rejected");
        self.notify(sub, Settlement::Rejected);
        sub.terminate();
    }

    fn settle(&self, state: ResultState) -> bool {
        let mut current = lock(&self.0.state);
        if !matches!(*current, ResultState::Pending) {
            return false;
        }
        *current = state;
        true
    }

    fn notify(&self, sub: &Connection, outcome: Settlement) {
        let Some(master) = self.0.master.upgrade() else {
            trace!(sub = sub.id(), "Master gone before settlement");
            return;
        };
        let shard = master.shard();
        sub.context().post(
            shard,
            Event::Settled {
                master,
                sub_id: sub.id(),
                outcome,
            },
        );
    }
}

impl fmt::Debug for RequestResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestResult")
            .field("status", &self.status())
            .field("sub", &self.0.sub.get().map(ConnectionRef::id))
            .field("rejection", &self.rejection())
            .finish()
    }
}

/// Idle, connected sub-connections to one endpoint.
#[derive(Debug)]
pub struct ConnectionPool {
    endpoint: SocketAddr,
    idle: Mutex<Vec<ConnectionRef>>,
}

impl ConnectionPool {
    pub fn new(endpoint: SocketAddr) -> Self {
        Self {
            endpoint,
            idle: Mutex::new(Vec::new()),
        }
    }

    pub fn endpoint(&self) -> SocketAddr {
        self.endpoint
    }

    /// Take the most recently released connection that is still connected.
    ///
    /// Stale entries found on the way are discarded.
    pub fn pop(&self) -> Option<ConnectionRef> {
        let mut stale = Vec::new();
        let found = {
            let mut idle = lock(&self.idle);
            loop {
                match idle.pop() {
                    Some(conn) if conn.is_connected() => break Some(conn),
                    Some(conn) => stale.push(conn),
                    None => break None,
                }
            }
        };
        if !stale.is_empty() {
            trace!(endpoint = %self.endpoint, discarded = stale.len(), "Discarding stale pooled connections");
        }
        found
    }

    pub fn insert(&self, conn: ConnectionRef) {
        let mut idle = lock(&self.idle);
        if !idle.iter().any(|c| ConnectionRef::ptr_eq(c, &conn)) {
            idle.push(conn);
        }
    }

    /// Remove `conn` if present.
    pub fn remove(&self, conn: &WeakConnection) -> Option<ConnectionRef> {
        let mut idle = lock(&self.idle);
        let pos = idle.iter().position(|c| conn.refers_to(c))?;
        Some(idle.swap_remove(pos))
    }

    pub fn len(&self) -> usize {
        lock(&self.idle).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.idle).is_empty()
    }

    fn clear(&self) -> Vec<ConnectionRef> {
        lock(&self.idle).drain(..).collect()
    }
}

/// Opens or reuses outbound connections for sub-requests.
#[derive(Debug)]
pub struct Connector {
    pools: Mutex<HashMap<SocketAddr, Arc<ConnectionPool>>>,
    default_timeout: Duration,
}

impl Connector {
    pub fn new(default_timeout: Duration) -> Self {
        Self {
            pools: Mutex::new(HashMap::new()),
            default_timeout,
        }
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Pool for `endpoint`, created on first use.
    pub fn pool(&self, endpoint: SocketAddr) -> Arc<ConnectionPool> {
        let mut pools = lock(&self.pools);
        Arc::clone(
            pools
                .entry(endpoint)
                .or_insert_with(|| Arc::new(ConnectionPool::new(endpoint))),
        )
    }

    /// Number of idle connections pooled for `endpoint`.
    pub fn idle_count(&self, endpoint: SocketAddr) -> usize {
        let pool = lock(&self.pools).get(&endpoint).cloned();
        pool.map_or(0, |p| p.len())
    }

    /// Send `message` to `host:port` on behalf of `master`.
    ///
    /// `host` must be an IP address literal. The result is returned before
    /// any I/O happens; an unusable address or a failed connect yields a
    /// result that is already rejected with [`Rejection::ConnectFailed`].
    pub fn init_sub_request(
        &self,
        master: &mut Connection,
        host: &str,
        port: u16,
        message: &dyn Message,
        timeout: Option<Duration>,
    ) -> RequestResult {
        let ip: IpAddr = match host.parse() {
            Ok(ip) => ip,
            Err(_) => {
                warn!(master = master.id(), host, "Sub-request host is not an IP address");
                return RequestResult::rejected(master, Rejection::ConnectFailed);
            }
        };
        let endpoint = SocketAddr::new(ip, port);
        let timeout = timeout.unwrap_or(self.default_timeout);
        let ctx = Arc::clone(master.context());

        let result = RequestResult::new(master);
        let handlers = sub_request_handlers(&result, encode_to_bytes(message), timeout);

        if let Some(sub) = self.pool(endpoint).pop() {
            debug!(master = master.id(), sub = sub.id(), %endpoint, "Reusing pooled connection");
            result.bind_sub(sub.clone());
            let shard = sub.shard();
            ctx.post(shard, Event::Rebind { conn: sub, handlers });
            return result;
        }

        match ctx.connect(endpoint, handlers) {
            Ok(sub) => {
                debug!(master = master.id(), sub = sub.id(), %endpoint, "Opened sub-connection");
                result.bind_sub(sub);
                result
            }
            Err(e) => {
                debug!(master = master.id(), %endpoint, error = %e, "Sub-connection failed");
                result.settle(ResultState::Rejected(Rejection::ConnectFailed));
                result
            }
        }
    }

    /// Return a resolved sub-connection to its pool.
    pub(crate) fn release(&self, endpoint: SocketAddr, conn: ConnectionRef) {
        trace!(conn_id = conn.id(), %endpoint, "Pooling sub-connection");
        self.pool(endpoint).insert(conn);
    }

    /// Forget `conn` if it is pooled for `endpoint`.
    pub(crate) fn remove_idle(&self, endpoint: SocketAddr, conn: &WeakConnection) {
        let pool = lock(&self.pools).get(&endpoint).cloned();
        if let Some(pool) = pool {
            pool.remove(conn);
        }
    }

    /// Drop every pool and return the connections they held.
    pub(crate) fn clear(&self) -> Vec<ConnectionRef> {
        let pools: Vec<_> = lock(&self.pools).drain().map(|(_, p)| p).collect();
        pools.iter().flat_map(|p| p.clear()).collect()
    }
}

/// Handlers that drive one request over a sub-connection.
fn sub_request_handlers(result: &RequestResult, frame: Bytes, timeout: Duration) -> Handlers {
    let on_connected = {
        let result = result.clone();
        move |c: &mut Connection| {
            if let Some(handle) = c.handle() {
                result.bind_sub(handle);
            }
            c.write_data(&frame);

            let sub = c.weak();
            let pending = result.clone();
            c.set_timeout(timeout, move || {
                let Some(sub) = sub.upgrade() else {
                    return;
                };
                sub.with(|s| {
                    if pending.is_pending() {
                        pending.reject(s, Rejection::Timeout);
                    }
                });
            });
        }
    };

    let on_receive = {
        let result = result.clone();
        move |c: &mut Connection| {
            if !result.is_pending() {
                return;
            }
            match c.decode_message() {
                DecodeOutcome::Decoded { message, .. } => result.resolve(c, message),
                DecodeOutcome::Incomplete => {}
                DecodeOutcome::UnknownType(name) => {
                    result.reject(c, Rejection::UnknownMessageType(name))
                }
                DecodeOutcome::ParseError(detail) => result.reject(c, Rejection::ParseError(detail)),
            }
        }
    };

    let on_disconnecting = {
        let result = result.clone();
        move |c: &mut Connection| {
            if result.is_pending() {
                result.reject(c, Rejection::ConnectionClosedByPeer);
            }
        }
    };

    Handlers::new()
        .connected(on_connected)
        .receive(on_receive)
        .disconnecting(on_disconnecting)
}
