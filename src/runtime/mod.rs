//! Event-driven runtime.
//!
//! One reactor thread owns the mio `Poll` and routes readiness to shards.
//! Each shard has a blocking event queue, a timeout wheel and one worker
//! thread that is the only mutator of the shard's connections:
//!
//! - `Buffer`: growable per-connection byte buffer
//! - `codec`: length-prefixed frames and the message registry
//! - `Connection`: connection state machine and await combinator
//! - `Connector`: outbound sub-requests and connection pools
//! - `TimeoutWheel`: coarse bucketed timeouts

mod buffer;
pub mod codec;
mod connection;
mod connector;
mod context;
mod event;
mod queue;
pub(crate) mod reactor;
mod timeout;
pub(crate) mod worker;

#[cfg(test)]
pub(crate) mod testing;

pub use buffer::{Buffer, DEFAULT_BUFFER_SIZE};
pub use codec::{
    decode_frame, encode_frame, encode_to_bytes, json_payload, DecodeOutcome, Message,
    MessageDecoder, MessageRegistry, DEFAULT_MAX_FRAME_SIZE,
};
pub use connection::{
    ConnKind, Connection, ConnectionRef, Handler, Handlers, Status, WeakConnection,
};
pub use connector::{
    ConnectionPool, Connector, Rejection, RequestResult, ResultStatus, Settlement,
    DEFAULT_SUB_REQUEST_TIMEOUT,
};
pub use context::{Context, Shard, Tuning};
pub use event::{ConnEvent, Event, Readiness};
pub use queue::EventQueue;
pub use timeout::{TimeoutAction, TimeoutEntry, TimeoutWheel, DEFAULT_TICK, DEFAULT_WHEEL_SLOTS};

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lock a mutex, recovering the guard if a panicking thread poisoned it.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
