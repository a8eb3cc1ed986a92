//! Reactor: the single thread that owns the mio `Poll`.
//!
//! The reactor never touches connection state. It accepts new connections,
//! turns readiness into events on the owning shard's queue, and broadcasts
//! ticks of the shared interval timer to every shard.

use crate::runtime::connection::{ConnKind, Handlers};
use crate::runtime::context::Context;
use crate::runtime::event::{Event, Readiness};
use mio::net::TcpListener;
use mio::{Events, Poll, Token};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

pub(crate) const LISTENER: Token = Token(usize::MAX);
pub(crate) const WAKER: Token = Token(usize::MAX - 1);

/// Periodic interval timer driven by the reactor's poll timeout.
#[derive(Debug)]
pub(crate) struct Ticker {
    interval: Duration,
    next: Instant,
}

impl Ticker {
    pub fn new(interval: Duration, now: Instant) -> Self {
        let interval = interval.max(Duration::from_millis(1));
        Self {
            interval,
            next: now + interval,
        }
    }

    /// Time left until the next tick is due.
    pub fn timeout(&self, now: Instant) -> Duration {
        self.next.saturating_duration_since(now)
    }

    /// Number of whole intervals that have elapsed since the last call.
    pub fn expirations(&mut self, now: Instant) -> u64 {
        if now < self.next {
            return 0;
        }
        let behind = now.duration_since(self.next).as_nanos() / self.interval.as_nanos();
        let count = (behind + 1).min(u32::MAX as u128) as u32;
        self.next += self.interval * count;
        count as u64
    }
}

pub(crate) struct ReactorParams {
    pub poll: Poll,
    pub listener: TcpListener,
    pub ctx: Arc<Context>,
    pub handlers: Handlers,
    pub stop: Arc<AtomicBool>,
    pub poll_timeout: Duration,
    pub max_events: usize,
}

pub(crate) struct Reactor {
    poll: Poll,
    listener: TcpListener,
    ctx: Arc<Context>,
    handlers: Handlers,
    stop: Arc<AtomicBool>,
    poll_timeout: Duration,
    max_events: usize,
    ticker: Ticker,
}

impl Reactor {
    pub fn new(params: ReactorParams) -> Self {
        let tick = params.ctx.tuning().tick;
        Self {
            poll: params.poll,
            listener: params.listener,
            ctx: params.ctx,
            handlers: params.handlers,
            stop: params.stop,
            poll_timeout: params.poll_timeout,
            max_events: params.max_events.max(1),
            ticker: Ticker::new(tick, Instant::now()),
        }
    }

    /// Poll until the stop flag is raised.
    pub fn run(&mut self) -> io::Result<()> {
        let mut events = Events::with_capacity(self.max_events);
        let mut ready: Vec<(Token, Option<Readiness>)> = Vec::with_capacity(self.max_events);

        while !self.stop.load(Ordering::Acquire) {
            let timeout = self.poll_timeout.min(self.ticker.timeout(Instant::now()));
            if let Err(e) = self.poll.poll(&mut events, Some(timeout)) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(e);
            }

            ready.clear();
            ready.extend(events.iter().map(|event| {
                let readable = event.is_readable() || event.is_read_closed() || event.is_error();
                let writable = event.is_writable() || event.is_write_closed();
                (event.token(), Readiness::from_flags(readable, writable))
            }));

            for (token, readiness) in ready.drain(..) {
                match token {
                    LISTENER => self.accept(),
                    WAKER => {}
                    Token(id) => {
                        let (Some(conn), Some(readiness)) = (self.ctx.lookup(id), readiness) else {
                            continue;
                        };
                        let shard = conn.shard();
                        self.ctx.post(shard, Event::Io { conn, readiness });
                    }
                }
            }

            let expirations = self.ticker.expirations(Instant::now());
            if expirations > 0 {
                self.ctx.broadcast_tick(expirations);
            }
        }

        info!("Reactor stopped");
        Ok(())
    }

    fn accept(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!(peer = %peer, error = %e, "Failed to set TCP_NODELAY");
                    }
                    match self.ctx.register_connection(
                        stream,
                        Some(peer),
                        ConnKind::Passive,
                        None,
                        self.handlers.clone(),
                    ) {
                        Ok(conn) => {
                            debug!(conn_id = conn.id(), shard = conn.shard(), peer = %peer, "Accepted connection")
                        }
                        Err(e) => warn!(peer = %peer, error = %e, "Rejecting connection"),
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(error = %e, "Accept error");
                    break;
                }
            }
        }
    }
}

/// Bind a non-blocking listener with address and port reuse.
pub(crate) fn create_listener(addr: SocketAddr, backlog: i32) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_port(true)?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;

    Ok(socket.into())
}
