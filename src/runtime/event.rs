//! Work items exchanged between the reactor, workers and sub-requests.

use crate::runtime::connection::{ConnectionRef, Handlers};
use crate::runtime::connector::Settlement;
use std::fmt;

/// Socket readiness carried by an I/O event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    Read,
    Write,
    ReadWrite,
}

impl Readiness {
    /// Build from mio's flags; `None` if neither direction is ready.
    pub fn from_flags(readable: bool, writable: bool) -> Option<Self> {
        match (readable, writable) {
            (true, true) => Some(Readiness::ReadWrite),
            (true, false) => Some(Readiness::Read),
            (false, true) => Some(Readiness::Write),
            (false, false) => None,
        }
    }

    pub fn is_readable(self) -> bool {
        matches!(self, Readiness::Read | Readiness::ReadWrite)
    }

    pub fn is_writable(self) -> bool {
        matches!(self, Readiness::Write | Readiness::ReadWrite)
    }
}

/// One unit of work for a shard's worker.
pub enum Event {
    /// Readiness (real or synthetic) on a connection.
    Io {
        conn: ConnectionRef,
        readiness: Readiness,
    },
    /// A sub-request of `master` settled.
    Settled {
        master: ConnectionRef,
        sub_id: usize,
        outcome: Settlement,
    },
    /// A pooled connection was handed a new request.
    Rebind {
        conn: ConnectionRef,
        handlers: Handlers,
    },
    /// The shared ticker fired `expirations` times since the last tick.
    Tick { expirations: u64 },
    /// Stop the worker.
    Shutdown,
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Event::Io { conn, readiness } => f
                .debug_struct("Io")
                .field("conn_id", &conn.id())
                .field("readiness", readiness)
                .finish(),
            Event::Settled {
                master,
                sub_id,
                outcome,
            } => f
                .debug_struct("Settled")
                .field("master", &master.id())
                .field("sub_id", sub_id)
                .field("outcome", outcome)
                .finish(),
            Event::Rebind { conn, .. } => {
                f.debug_struct("Rebind").field("conn_id", &conn.id()).finish()
            }
            Event::Tick { expirations } => f
                .debug_struct("Tick")
                .field("expirations", expirations)
                .finish(),
            Event::Shutdown => f.write_str("Shutdown"),
        }
    }
}

/// Event as seen by a single connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnEvent {
    Io(Readiness),
    Settled { sub_id: usize, outcome: Settlement },
}
