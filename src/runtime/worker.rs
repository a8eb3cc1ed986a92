//! Shard workers.
//!
//! One thread per shard pops events from the shard's queue and applies them
//! in order. A worker is the only thread that mutates the connections of its
//! shard.

use crate::runtime::context::Context;
use crate::runtime::event::{ConnEvent, Event};
use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{info, trace};

/// Start one worker thread per shard.
pub(crate) fn spawn(ctx: &Arc<Context>) -> io::Result<Vec<JoinHandle<()>>> {
    let mut handles = Vec::with_capacity(ctx.shard_count());

    for shard in 0..ctx.shard_count() {
        let ctx = Arc::clone(ctx);
        let handle = thread::Builder::new()
            .name(format!("worker-{shard}"))
            .spawn(move || worker_loop(ctx, shard))?;
        handles.push(handle);
    }

    Ok(handles)
}

fn worker_loop(ctx: Arc<Context>, shard: usize) {
    info!(shard, "Worker started");

    let queue = &ctx.shard(shard).queue;
    while let Some(event) = queue.pop() {
        if matches!(event, Event::Shutdown) {
            break;
        }
        dispatch(&ctx, shard, event);
    }

    info!(shard, "Worker stopped");
}

/// Apply one event on `shard`.
pub(crate) fn dispatch(ctx: &Context, shard: usize, event: Event) {
    match event {
        Event::Io { conn, readiness } => conn.handle_event(ConnEvent::Io(readiness)),
        Event::Settled {
            master,
            sub_id,
            outcome,
        } => master.handle_event(ConnEvent::Settled { sub_id, outcome }),
        Event::Rebind { conn, handlers } => conn.with(|c| c.rebind(handlers)),
        Event::Tick { expirations } => {
            // A full turn clears every bucket; further advances are no-ops
            let turns = expirations.min(ctx.tuning().wheel_slots as u64);
            for _ in 0..turns {
                let expired = ctx.expire(shard);
                if !expired.is_empty() {
                    trace!(shard, count = expired.len(), "Timeout bucket cleared");
                }
                drop(expired);
            }
        }
        Event::Shutdown => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::connection::{ConnKind, Handlers, Status};
    use crate::runtime::event::Readiness;
    use crate::runtime::testing::Harness;
    use std::time::Duration;

    #[test]
    fn test_workers_drain_in_order_and_stop() {
        let harness = Harness::standard();
        let (conn, _client) = harness.pair(ConnKind::Passive, Handlers::new());
        let handles = spawn(&harness.ctx).unwrap();
        assert_eq!(handles.len(), harness.ctx.shard_count());

        harness.ctx.post(
            conn.shard(),
            Event::Io {
                conn: conn.clone(),
                readiness: Readiness::Write,
            },
        );
        harness.ctx.broadcast_shutdown();
        for handle in handles {
            handle.join().unwrap();
        }

        // The I/O event queued ahead of the shutdown was applied
        assert_eq!(conn.status(), Status::Connected);
    }

    #[test]
    fn test_tick_fires_due_timeouts() {
        let harness = Harness::standard();
        let (conn, _client) = harness.pair(ConnKind::Passive, Handlers::new());
        conn.with(|c| {
            let handle = c.handle().unwrap();
            c.set_timeout(Duration::from_secs(1), move || handle.with(|c| c.terminate()))
        });

        dispatch(&harness.ctx, conn.shard(), Event::Tick { expirations: 1 });
        assert_eq!(conn.status(), Status::Disconnected);
    }
}
