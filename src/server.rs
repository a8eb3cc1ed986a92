//! TCP server: the embedding surface of the runtime.
//!
//! A `Server` binds its listener up front, collects handlers and message
//! types, and then `run()` blocks on the reactor until shut down.

use crate::config::Config;
use crate::error::{Error, Result};
use crate::runtime::reactor::{create_listener, Reactor, ReactorParams, LISTENER, WAKER};
use crate::runtime::{worker, Connection, Context, Handlers, MessageRegistry};
use mio::net::TcpListener;
use mio::{Interest, Poll, Waker};
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info, warn};

/// Server instance
pub struct Server {
    config: Config,
    poll: Poll,
    listener: TcpListener,
    local_addr: SocketAddr,
    waker: Arc<Waker>,
    stop: Arc<AtomicBool>,
    handlers: Handlers,
    messages: MessageRegistry,
}

impl Server {
    /// Bind the listening socket described by `config`.
    pub fn bind(config: Config) -> Result<Self> {
        let addr: SocketAddr = config
            .listen
            .parse()
            .map_err(|_| Error::InvalidAddress(config.listen.clone()))?;

        let listener = create_listener(addr, config.backlog).map_err(|source| Error::Bind {
            addr: config.listen.clone(),
            source,
        })?;
        let mut listener = TcpListener::from_std(listener);
        let local_addr = listener.local_addr()?;

        let poll = Poll::new()?;
        poll.registry()
            .register(&mut listener, LISTENER, Interest::READABLE)?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER)?);

        info!(addr = %local_addr, "Server listening");

        Ok(Server {
            config,
            poll,
            listener,
            local_addr,
            waker,
            stop: Arc::new(AtomicBool::new(false)),
            handlers: Handlers::new(),
            messages: MessageRegistry::new(),
        })
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Handler run once for every accepted connection.
    pub fn on_connected<F>(&mut self, f: F) -> &mut Self
    where
        F: Fn(&mut Connection) + Send + Sync + 'static,
    {
        self.handlers.on_connected = Some(Arc::new(f));
        self
    }

    /// Handler run whenever an accepted connection has unread input.
    pub fn on_receive<F>(&mut self, f: F) -> &mut Self
    where
        F: Fn(&mut Connection) + Send + Sync + 'static,
    {
        self.handlers.on_receive = Some(Arc::new(f));
        self
    }

    /// Handler run once when an accepted connection terminates.
    pub fn on_disconnecting<F>(&mut self, f: F) -> &mut Self
    where
        F: Fn(&mut Connection) + Send + Sync + 'static,
    {
        self.handlers.on_disconnecting = Some(Arc::new(f));
        self
    }

    /// Message types this server can decode, on both sides.
    pub fn messages_mut(&mut self) -> &mut MessageRegistry {
        &mut self.messages
    }

    /// Handle that stops `run()` from any thread.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            stop: Arc::clone(&self.stop),
            waker: Arc::clone(&self.waker),
        }
    }

    /// Start the workers and block on the reactor until shutdown.
    ///
    /// Workers finish the events already queued, then every remaining
    /// connection is terminated.
    pub fn run(self) -> Result<()> {
        let registry = self.poll.registry().try_clone()?;
        let ctx = Context::new(registry, &self.config, self.messages);

        let workers = match worker::spawn(&ctx) {
            Ok(workers) => workers,
            Err(e) => {
                ctx.broadcast_shutdown();
                ctx.drain();
                return Err(e.into());
            }
        };

        info!(
            addr = %self.local_addr,
            workers = workers.len(),
            types = ctx.messages().len(),
            "Server started"
        );

        let mut reactor = Reactor::new(ReactorParams {
            poll: self.poll,
            listener: self.listener,
            ctx: Arc::clone(&ctx),
            handlers: self.handlers,
            stop: self.stop,
            poll_timeout: self.config.poll_timeout(),
            max_events: self.config.max_events,
        });
        let outcome = reactor.run();
        if let Err(ref e) = outcome {
            error!(error = %e, "Reactor failed");
        }

        ctx.broadcast_shutdown();
        for handle in workers {
            if handle.join().is_err() {
                warn!("Worker panicked");
            }
        }
        ctx.drain();

        info!(addr = %self.local_addr, "Server stopped");
        outcome.map_err(Error::from)
    }
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("local_addr", &self.local_addr)
            .field("handlers", &self.handlers)
            .field("messages", &self.messages)
            .finish()
    }
}

/// Stops a running server.
///
/// `shutdown()` is an atomic store followed by a wake of the reactor,
/// so it is safe to call from a signal handler.
#[derive(Clone)]
pub struct ShutdownHandle {
    stop: Arc<AtomicBool>,
    waker: Arc<Waker>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        self.stop.store(true, Ordering::Release);
        let _ = self.waker.wake();
    }

    pub fn is_shutdown(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }
}

impl fmt::Debug for ShutdownHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShutdownHandle")
            .field("stop", &self.is_shutdown())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpStream;
    use std::thread;
    use std::time::{Duration, Instant};

    fn local_config() -> Config {
        Config {
            listen: "127.0.0.1:0".to_string(),
            ..Config::default()
        }
    }

    #[test]
    fn test_invalid_listen_address() {
        let config = Config {
            listen: "not an address".to_string(),
            ..Config::default()
        };
        assert!(matches!(Server::bind(config), Err(Error::InvalidAddress(_))));
    }

    #[test]
    fn test_run_until_shutdown() {
        let mut server = Server::bind(local_config()).unwrap();
        server.on_receive(|c| {
            let data = c.input_mut().take_all();
            c.write_data(data);
        });
        let addr = server.local_addr();
        let handle = server.shutdown_handle();
        let runner = thread::spawn(move || server.run());

        let mut client = TcpStream::connect(addr).unwrap();
        client
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        client.write_all(b"ping").unwrap();
        let mut reply = [0u8; 4];
        client.read_exact(&mut reply).unwrap();
        assert_eq!(&reply, b"ping");

        let started = Instant::now();
        handle.shutdown();
        runner.join().unwrap().unwrap();
        assert!(started.elapsed() < Duration::from_secs(2));

        // The remaining connection was closed during the drain
        let mut rest = Vec::new();
        assert_eq!(client.read_to_end(&mut rest).unwrap_or(0), 0);
    }
}
