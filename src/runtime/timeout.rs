//! Coarse timeout wheel.
//!
//! A ring of `N` buckets advanced by one slot per tick. An entry placed
//! `ticks` slots ahead fires on the `ticks`-th tick after placement. Entries
//! are reference counted: a bucket holds one strong reference, and an entry
//! fires when the last bucket holding it is cleared. Clocking an entry in adds
//! a reference to the bucket just behind the current index, giving it the
//! full `N` ticks again.
//!
//! The wheel itself never runs user code. [`TimeoutWheel::advance`] hands the
//! expired references back to the caller, who drops them once the wheel lock
//! is released.

use crate::runtime::connection::WeakConnection;
use crate::runtime::lock;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tracing::trace;

/// Number of buckets when not configured.
pub const DEFAULT_WHEEL_SLOTS: usize = 10;

/// Tick interval when not configured.
pub const DEFAULT_TICK: Duration = Duration::from_secs(1);

/// Custom action run when an entry expires.
pub type TimeoutAction = Box<dyn FnOnce() + Send>;

/// A scheduled timeout.
///
/// On drop, runs the custom action if one is set; otherwise terminates the
/// connection if it is still alive.
pub struct TimeoutEntry {
    id: u64,
    connection: WeakConnection,
    action: Mutex<Option<TimeoutAction>>,
    armed: AtomicBool,
}

impl TimeoutEntry {
    /// Wheel-unique id of this entry.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Discard the action and make expiry a no-op.
    pub fn disarm(&self) {
        self.armed.store(false, Ordering::Release);
        let action = lock(&self.action).take();
        drop(action);
    }
}

impl fmt::Debug for TimeoutEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimeoutEntry")
            .field("id", &self.id)
            .field("connection", &self.connection)
            .finish()
    }
}

impl Drop for TimeoutEntry {
    fn drop(&mut self) {
        if !self.armed.load(Ordering::Acquire) {
            return;
        }
        let action = self.action.get_mut().ok().and_then(Option::take);
        match action {
            Some(action) => {
                trace!(entry = self.id, "Running timeout action");
                action();
            }
            None => {
                if let Some(conn) = self.connection.upgrade() {
                    trace!(entry = self.id, conn_id = conn.id(), "Idle timeout expired");
                    conn.with(|c| c.terminate());
                }
            }
        }
    }
}

/// Bucketed timeout ring.
pub struct TimeoutWheel {
    buckets: Vec<HashMap<u64, Arc<TimeoutEntry>>>,
    index: usize,
    tick: Duration,
    next_id: u64,
}

impl TimeoutWheel {
    /// Create a wheel with `slots` buckets of `tick` each.
    pub fn new(slots: usize, tick: Duration) -> Self {
        let slots = slots.max(1);
        Self {
            buckets: (0..slots).map(|_| HashMap::new()).collect(),
            index: 0,
            tick: tick.max(Duration::from_millis(1)),
            next_id: 0,
        }
    }

    /// Number of buckets.
    pub fn slots(&self) -> usize {
        self.buckets.len()
    }

    /// Duration of one tick.
    pub fn tick(&self) -> Duration {
        self.tick
    }

    /// Ticks until a duration expires: `duration / tick` rounded to the
    /// nearest tick, clamped to `1..=slots`.
    pub fn ticks_for(&self, duration: Duration) -> usize {
        let tick = self.tick.as_nanos();
        let rounded = (duration.as_nanos() + tick / 2) / tick;
        (rounded.min(self.slots() as u128) as usize).max(1)
    }

    /// Schedule a timeout for `connection` after `duration`.
    ///
    /// Returns a weak handle that stays upgradable until the entry fires.
    pub fn schedule(
        &mut self,
        connection: WeakConnection,
        duration: Duration,
        action: Option<TimeoutAction>,
    ) -> Weak<TimeoutEntry> {
        let ticks = self.ticks_for(duration);
        let bucket = (self.index + ticks - 1) % self.slots();

        let id = self.next_id;
        self.next_id += 1;
        let entry = Arc::new(TimeoutEntry {
            id,
            connection,
            action: Mutex::new(action),
            armed: AtomicBool::new(true),
        });
        let weak = Arc::downgrade(&entry);
        self.buckets[bucket].insert(id, entry);

        trace!(entry = id, ticks, bucket, "Timeout scheduled");
        weak
    }

    /// Push an entry's expiry out to the maximum remaining time.
    ///
    /// Returns false if the entry has already fired.
    pub fn clock_in(&mut self, entry: &Weak<TimeoutEntry>) -> bool {
        let Some(entry) = entry.upgrade() else {
            return false;
        };
        let slots = self.slots();
        let bucket = (self.index + slots - 1) % slots;
        self.buckets[bucket].insert(entry.id, entry);
        true
    }

    /// Clear the current bucket and move to the next one.
    ///
    /// Returns the references removed from the bucket. Entries with no other
    /// bucket reference fire when the caller drops them.
    pub fn advance(&mut self) -> Vec<Arc<TimeoutEntry>> {
        let expired: Vec<_> = self.buckets[self.index].drain().map(|(_, e)| e).collect();
        self.index = (self.index + 1) % self.slots();
        expired
    }

    /// Remove every reference held by the wheel.
    pub fn clear(&mut self) -> Vec<Arc<TimeoutEntry>> {
        self.buckets
            .iter_mut()
            .flat_map(|bucket| bucket.drain().map(|(_, e)| e))
            .collect()
    }

    /// Total references held across all buckets.
    pub fn len(&self) -> usize {
        self.buckets.iter().map(HashMap::len).sum()
    }

    /// Check if no bucket holds anything.
    pub fn is_empty(&self) -> bool {
        self.buckets.iter().all(HashMap::is_empty)
    }
}

impl fmt::Debug for TimeoutWheel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimeoutWheel")
            .field("slots", &self.slots())
            .field("index", &self.index)
            .field("tick", &self.tick)
            .field("entries", &self.len())
            .finish()
    }
}
