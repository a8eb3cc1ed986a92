//! Blocking FIFO work queue, one per shard.

use crate::runtime::event::Event;
use crate::runtime::lock;
use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};

#[derive(Debug, Default)]
struct QueueState {
    events: VecDeque<Event>,
    closed: bool,
}

/// Multi-producer, single-consumer event queue.
#[derive(Debug, Default)]
pub struct EventQueue {
    state: Mutex<QueueState>,
    ready: Condvar,
}

impl EventQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an event and wake the consumer.
    ///
    /// Returns false (dropping the event) once the queue is closed.
    pub fn push(&self, event: Event) -> bool {
        let mut state = lock(&self.state);
        if state.closed {
            return false;
        }
        state.events.push_back(event);
        drop(state);
        self.ready.notify_one();
        true
    }

    /// Block until an event is available.
    ///
    /// Returns `None` once the queue is closed and drained.
    pub fn pop(&self) -> Option<Event> {
        let mut state = lock(&self.state);
        loop {
            if let Some(event) = state.events.pop_front() {
                return Some(event);
            }
            if state.closed {
                return None;
            }
            state = match self.ready.wait(state) {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
        }
    }

    /// Pop without blocking.
    pub fn try_pop(&self) -> Option<Event> {
        lock(&self.state).events.pop_front()
    }

    /// Refuse further pushes and wake any blocked consumer.
    pub fn close(&self) {
        lock(&self.state).closed = true;
        self.ready.notify_all();
    }

    /// Remove every queued event.
    pub fn clear(&self) -> Vec<Event> {
        lock(&self.state).events.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        lock(&self.state).events.len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.state).events.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    fn tick(n: u64) -> Event {
        Event::Tick { expirations: n }
    }

    fn expirations(event: Option<Event>) -> Option<u64> {
        match event {
            Some(Event::Tick { expirations }) => Some(expirations),
            _ => None,
        }
    }

    #[test]
    fn test_fifo_order() {
        let queue = EventQueue::new();
        for n in 1..=3 {
            assert!(queue.push(tick(n)));
        }
        assert_eq!(queue.len(), 3);
        assert_eq!(expirations(queue.pop()), Some(1));
        assert_eq!(expirations(queue.pop()), Some(2));
        assert_eq!(expirations(queue.try_pop()), Some(3));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_pop_blocks_until_push() {
        let queue = Arc::new(EventQueue::new());
        let consumer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || expirations(queue.pop()))
        };

        thread::sleep(Duration::from_millis(50));
        queue.push(tick(42));
        assert_eq!(consumer.join().unwrap(), Some(42));
    }

    #[test]
    fn test_close_wakes_consumer() {
        let queue = Arc::new(EventQueue::new());
        let consumer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.pop().is_none())
        };

        thread::sleep(Duration::from_millis(50));
        queue.close();
        assert!(consumer.join().unwrap());
        assert!(!queue.push(tick(1)));
    }

    #[test]
    fn test_close_drains_remaining_events() {
        let queue = EventQueue::new();
        queue.push(tick(1));
        queue.push(Event::Shutdown);
        queue.close();

        assert_eq!(expirations(queue.pop()), Some(1));
        assert!(matches!(queue.pop(), Some(Event::Shutdown)));
        assert!(queue.pop().is_none());
    }
}
