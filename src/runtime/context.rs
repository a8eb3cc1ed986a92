//! Shared runtime state, constructed once per server and passed as `Arc`.

use crate::config::Config;
use crate::runtime::codec::MessageRegistry;
use crate::runtime::connection::{
    ConnKind, Connection, ConnectionParams, ConnectionRef, Handlers, WeakConnection,
};
use crate::runtime::connector::Connector;
use crate::runtime::event::Event;
use crate::runtime::lock;
use crate::runtime::queue::EventQueue;
use crate::runtime::timeout::{TimeoutAction, TimeoutEntry, TimeoutWheel};
use mio::net::TcpStream;
use mio::{Interest, Registry, Token};
use slab::Slab;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Resolved runtime tunables.
#[derive(Debug, Clone)]
pub struct Tuning {
    pub shards: usize,
    pub buffer_size: usize,
    pub read_budget: usize,
    pub max_frame_size: usize,
    pub max_suppressed_input: usize,
    /// Idle eviction window for passive connections, if enabled.
    pub idle_timeout: Option<Duration>,
    pub sub_request_timeout: Duration,
    pub max_connections: usize,
    pub tick: Duration,
    pub wheel_slots: usize,
}

impl Tuning {
    pub fn from_config(config: &Config) -> Self {
        let shards = if config.workers == 0 {
            num_cpus()
        } else {
            config.workers
        };
        let tick = config.tick().max(Duration::from_millis(1));
        let wheel_slots = config.wheel_slots.max(1);

        Self {
            shards,
            buffer_size: config.buffer_size,
            read_budget: config.read_budget.max(1),
            max_frame_size: config.max_frame_size,
            max_suppressed_input: config.max_suppressed_input.max(1),
            idle_timeout: config
                .idle_timeout
                .then(|| tick * wheel_slots as u32),
            sub_request_timeout: config.sub_request_timeout(),
            max_connections: config.max_connections,
            tick,
            wheel_slots,
        }
    }
}

/// Per-shard work queue and timeout wheel.
pub struct Shard {
    pub queue: EventQueue,
    pub wheel: Mutex<TimeoutWheel>,
}

/// Everything shared between the reactor, the workers and the connections.
pub struct Context {
    registry: Registry,
    shards: Vec<Shard>,
    connections: Mutex<Slab<ConnectionRef>>,
    connector: Connector,
    messages: MessageRegistry,
    tuning: Tuning,
    running: AtomicBool,
}

impl Context {
    pub fn new(registry: Registry, config: &Config, messages: MessageRegistry) -> Arc<Self> {
        let tuning = Tuning::from_config(config);
        let shards = (0..tuning.shards)
            .map(|_| Shard {
                queue: EventQueue::new(),
                wheel: Mutex::new(TimeoutWheel::new(tuning.wheel_slots, tuning.tick)),
            })
            .collect();

        Arc::new(Self {
            registry,
            shards,
            connections: Mutex::new(Slab::with_capacity(tuning.max_connections.min(1024))),
            connector: Connector::new(tuning.sub_request_timeout),
            messages,
            tuning,
            running: AtomicBool::new(true),
        })
    }

    pub fn tuning(&self) -> &Tuning {
        &self.tuning
    }

    pub fn messages(&self) -> &MessageRegistry {
        &self.messages
    }

    pub fn connector(&self) -> &Connector {
        &self.connector
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    pub fn shard(&self, index: usize) -> &Shard {
        &self.shards[index % self.shards.len()]
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Queue `event` on `shard`. Returns false once the shard is closed.
    pub fn post(&self, shard: usize, event: Event) -> bool {
        let accepted = self.shard(shard).queue.push(event);
        if !accepted {
            trace!(shard, "Dropping event for closed shard");
        }
        accepted
    }

    pub fn broadcast_tick(&self, expirations: u64) {
        for shard in &self.shards {
            shard.queue.push(Event::Tick { expirations });
        }
    }

    pub fn broadcast_shutdown(&self) {
        for shard in &self.shards {
            shard.queue.push(Event::Shutdown);
        }
    }

    pub fn schedule(
        &self,
        shard: usize,
        connection: WeakConnection,
        duration: Duration,
        action: Option<TimeoutAction>,
    ) -> Weak<TimeoutEntry> {
        lock(&self.shard(shard).wheel).schedule(connection, duration, action)
    }

    pub fn clock_in(&self, shard: usize, entry: &Weak<TimeoutEntry>) {
        lock(&self.shard(shard).wheel).clock_in(entry);
    }

    /// Advance `shard`'s wheel by one tick. The caller drops what is returned
    /// after the lock is gone, which fires the expired entries.
    pub fn expire(&self, shard: usize) -> Vec<Arc<TimeoutEntry>> {
        lock(&self.shard(shard).wheel).advance()
    }

    /// Add a connected or connecting socket to the table and the poller.
    ///
    /// The table slot doubles as the poll token and picks the shard.
    pub fn register_connection(
        self: &Arc<Self>,
        mut stream: TcpStream,
        peer: Option<SocketAddr>,
        kind: ConnKind,
        endpoint: Option<SocketAddr>,
        handlers: Handlers,
    ) -> io::Result<ConnectionRef> {
        let mut connections = lock(&self.connections);
        if connections.len() >= self.tuning.max_connections {
            warn!(max = self.tuning.max_connections, "Connection limit reached");
            return Err(io::Error::other("connection limit reached"));
        }

        let entry = connections.vacant_entry();
        let id = entry.key();
        let shard = id % self.shards.len();
        self.registry
            .register(&mut stream, Token(id), Interest::READABLE | Interest::WRITABLE)?;

        let conn = Connection::create(
            Arc::clone(self),
            ConnectionParams {
                id,
                shard,
                kind,
                stream,
                peer,
                endpoint,
                handlers,
            },
        );
        entry.insert(conn.clone());

        debug!(conn_id = id, shard, ?kind, ?peer, ?endpoint, "Connection registered");
        Ok(conn)
    }

    /// Start a non-blocking connect to `endpoint`.
    pub fn connect(
        self: &Arc<Self>,
        endpoint: SocketAddr,
        handlers: Handlers,
    ) -> io::Result<ConnectionRef> {
        if !self.is_running() {
            return Err(io::Error::other("runtime is shutting down"));
        }
        let stream = TcpStream::connect(endpoint)?;
        self.register_connection(stream, None, ConnKind::Active, Some(endpoint), handlers)
    }

    pub fn lookup(&self, id: usize) -> Option<ConnectionRef> {
        lock(&self.connections).get(id).cloned()
    }

    pub fn connection_count(&self) -> usize {
        lock(&self.connections).len()
    }

    pub(crate) fn remove_connection(&self, id: usize, conn: &WeakConnection) {
        let removed = {
            let mut connections = lock(&self.connections);
            let owned = connections
                .get(id)
                .is_some_and(|current| conn.refers_to(current));
            owned.then(|| connections.remove(id))
        };
        drop(removed);
    }

    pub(crate) fn deregister(&self, stream: &mut TcpStream) -> io::Result<()> {
        self.registry.deregister(stream)
    }

    /// Tear everything down after the workers have stopped.
    ///
    /// Terminates every connection, discards pending timeouts without running
    /// them, and empties the queues and pools.
    pub fn drain(&self) {
        self.running.store(false, Ordering::Release);

        let connections: Vec<_> = lock(&self.connections).drain().collect();
        let open = connections.len();
        for conn in &connections {
            conn.with(|c| c.terminate());
        }

        for shard in &self.shards {
            let entries = lock(&shard.wheel).clear();
            for entry in entries {
                entry.disarm();
            }
            shard.queue.close();
            drop(shard.queue.clear());
        }

        let pooled = self.connector.clear().len();
        debug!(open, pooled, "Runtime drained");
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("shards", &self.shards.len())
            .field("connections", &self.connection_count())
            .field("messages", &self.messages)
            .field("tuning", &self.tuning)
            .finish()
    }
}

fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::connection::Status;
    use crate::runtime::testing::Harness;

    #[test]
    fn test_tuning_from_config() {
        let tuning = Tuning::from_config(&Config {
            workers: 3,
            idle_timeout: true,
            tick_ms: 200,
            wheel_slots: 5,
            ..Config::default()
        });
        assert_eq!(tuning.shards, 3);
        assert_eq!(tuning.idle_timeout, Some(Duration::from_secs(1)));

        let tuning = Tuning::from_config(&Config {
            workers: 0,
            ..Config::default()
        });
        assert!(tuning.shards >= 1);
        assert_eq!(tuning.idle_timeout, None);
    }

    #[test]
    fn test_connection_ids_pick_shards() {
        let harness = Harness::standard();
        let (a, _ca) = harness.pair(ConnKind::Passive, Handlers::new());
        let (b, _cb) = harness.pair(ConnKind::Passive, Handlers::new());

        assert_ne!(a.id(), b.id());
        assert_eq!(a.shard(), a.id() % harness.ctx.shard_count());
        assert_eq!(b.shard(), b.id() % harness.ctx.shard_count());
        assert!(ConnectionRef::ptr_eq(&harness.ctx.lookup(a.id()).unwrap(), &a));
    }

    #[test]
    fn test_connection_limit() {
        let harness = Harness::new(Config {
            max_connections: 1,
            ..Config::default()
        });
        let _first = harness.pair(ConnKind::Passive, Handlers::new());

        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let _client = std::net::TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, peer) = listener.accept().unwrap();
        server.set_nonblocking(true).unwrap();
        let refused = harness.ctx.register_connection(
            TcpStream::from_std(server),
            Some(peer),
            ConnKind::Passive,
            None,
            Handlers::new(),
        );
        assert!(refused.is_err());
        assert_eq!(harness.ctx.connection_count(), 1);
    }

    #[test]
    fn test_drain_terminates_everything() {
        let harness = Harness::standard();
        let (a, _ca) = harness.pair(ConnKind::Passive, Handlers::new());
        let (b, _cb) = harness.pair(ConnKind::Active, Handlers::new());
        a.with(|c| c.set_timeout(Duration::from_secs(1), || panic!("must not run")));

        harness.ctx.drain();
        assert_eq!(a.status(), Status::Disconnected);
        assert_eq!(b.status(), Status::Disconnected);
        assert_eq!(harness.ctx.connection_count(), 0);
        assert!(!harness.ctx.post(0, Event::Shutdown));
        assert!(harness
            .ctx
            .connect("127.0.0.1:1".parse().unwrap(), Handlers::new())
            .is_err());
    }
}
