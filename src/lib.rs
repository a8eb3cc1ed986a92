//! meshwire: an event-driven TCP server and client framework.
//!
//! A single reactor thread polls sockets and routes readiness to sharded
//! worker threads. Each connection lives on one shard, so its handlers
//! never run concurrently. Handlers can issue framed sub-requests to other
//! servers and await their results without blocking the worker.
//!
//! Features:
//! - Length-prefixed message framing with a registry of decodable types
//! - Outbound connections pooled per endpoint and reused across requests
//! - Coarse idle and request timeouts on a per-shard wheel
//! - Configuration via CLI arguments or TOML file

pub mod config;
pub mod error;
pub mod runtime;
pub mod server;
pub mod services;

pub use config::Config;
pub use error::{Error, Result};
pub use server::{Server, ShutdownHandle};
