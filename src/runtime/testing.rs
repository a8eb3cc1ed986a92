//! Loopback fixtures shared by the runtime unit tests.

use crate::config::Config;
use crate::runtime::codec::MessageRegistry;
use crate::runtime::connection::{ConnKind, ConnectionRef, Handlers};
use crate::runtime::context::Context;
use crate::runtime::worker::dispatch;
use mio::net::TcpStream;
use mio::Poll;
use std::net::{TcpListener, TcpStream as StdStream};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// A context with no reactor or workers; tests drive events by hand.
pub struct Harness {
    _poll: Poll,
    pub ctx: Arc<Context>,
}

impl Harness {
    pub fn new(config: Config) -> Self {
        Self::with_messages(config, MessageRegistry::new())
    }

    pub fn with_messages(config: Config, messages: MessageRegistry) -> Self {
        let poll = Poll::new().unwrap();
        let registry = poll.registry().try_clone().unwrap();
        let ctx = Context::new(registry, &config, messages);
        Self { _poll: poll, ctx }
    }

    pub fn standard() -> Self {
        Self::new(Config::default())
    }

    /// Register the server half of a loopback pair; returns the client half.
    ///
    /// Active connections get the peer address as their endpoint.
    pub fn pair(&self, kind: ConnKind, handlers: Handlers) -> (ConnectionRef, StdStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = StdStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, peer) = listener.accept().unwrap();
        server.set_nonblocking(true).unwrap();
        client
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();

        let endpoint = (kind == ConnKind::Active).then_some(peer);
        let conn = self
            .ctx
            .register_connection(
                TcpStream::from_std(server),
                Some(peer),
                kind,
                endpoint,
                handlers,
            )
            .unwrap();
        (conn, client)
    }

    /// Dispatch everything queued for `shard`, including follow-ups.
    pub fn drain_queue(&self, shard: usize) {
        while let Some(event) = self.ctx.shard(shard).queue.try_pop() {
            dispatch(&self.ctx, shard, event);
        }
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.ctx.drain();
    }
}

/// Give loopback bytes time to arrive.
pub fn settle_time() {
    thread::sleep(Duration::from_millis(30));
}
