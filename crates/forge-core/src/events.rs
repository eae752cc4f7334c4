//! Single-writer multi-reader build event stream.
//!
//! The publisher notifies every subscriber synchronously, in registration
//! order, but a slow subscriber never blocks the others: each subscriber
//! owns a bounded queue, and a publish that would overflow it drops the
//! subscriber's oldest buffered event and marks the subscriber lossy rather
//! than blocking the publisher or the other subscribers.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};

use crate::graph::TargetId;

/// One build-event payload. All variants carry the elapsed time since build
/// start so subscribers can reconstruct a timeline without wall-clock reads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event {
    BuildStarted { elapsed: Duration, target_count: usize },
    TargetStarted { elapsed: Duration, target: TargetId },
    TargetCompleted { elapsed: Duration, target: TargetId },
    TargetFailed { elapsed: Duration, target: TargetId, cause: Option<TargetId> },
    TargetCached { elapsed: Duration, target: TargetId },
    BuildCompleted { elapsed: Duration, built: usize, cached: usize, failed: usize },
    BuildFailed { elapsed: Duration, built: usize, cached: usize, failed: usize },
    Statistics { elapsed: Duration, cache_hits: u64, cache_misses: u64, bytes_written: u64 },
}

const DEFAULT_SUBSCRIBER_CAPACITY: usize = 1024;

struct SubscriberQueue {
    buffer: Mutex<std::collections::VecDeque<Event>>,
    condvar: Condvar,
    capacity: usize,
    lossy: AtomicBool,
    dropped: AtomicU64,
    closed: AtomicBool,
}

/// Handle returned to a subscriber for draining its queue.
pub struct Subscription {
    queue: Arc<SubscriberQueue>,
}

impl Subscription {
    /// Blocks until at least one event is available or the publisher is
    /// dropped, returning `None` only once the queue is closed and drained.
    pub fn recv(&self) -> Option<Event> {
        let mut buffer = self.queue.buffer.lock();
        loop {
            if let Some(event) = buffer.pop_front() {
                return Some(event);
            }
            if self.queue.closed.load(Ordering::Acquire) {
                return None;
            }
            self.queue.condvar.wait(&mut buffer);
        }
    }

    /// Drains whatever is currently buffered without blocking.
    pub fn drain(&self) -> Vec<Event> {
        self.queue.buffer.lock().drain(..).collect()
    }

    /// Whether this subscriber has ever had an event dropped for overflow.
    pub fn is_lossy(&self) -> bool {
        self.queue.lossy.load(Ordering::Relaxed)
    }

    pub fn dropped_count(&self) -> u64 {
        self.queue.dropped.load(Ordering::Relaxed)
    }
}

/// Single-writer publisher. Clone to share a handle with the scheduler and
/// executor; all clones publish into the same fan-out.
#[derive(Clone)]
pub struct EventBus {
    subscribers: Arc<Mutex<Vec<Arc<SubscriberQueue>>>>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            subscribers: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn subscribe(&self) -> Subscription {
        self.subscribe_with_capacity(DEFAULT_SUBSCRIBER_CAPACITY)
    }

    pub fn subscribe_with_capacity(&self, capacity: usize) -> Subscription {
        let queue = Arc::new(SubscriberQueue {
            buffer: Mutex::new(std::collections::VecDeque::with_capacity(capacity.min(64))),
            condvar: Condvar::new(),
            capacity,
            lossy: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        });
        self.subscribers.lock().push(queue.clone());
        Subscription { queue }
    }

    /// Publishes `event` to every current subscriber, in registration order.
    /// Never blocks: a full subscriber queue drops its oldest entry to make
    /// room, rather than applying backpressure to the publisher.
    pub fn publish(&self, event: Event) {
        let subscribers = self.subscribers.lock();
        for sub in subscribers.iter() {
            let mut buffer = sub.buffer.lock();
            if buffer.len() >= sub.capacity {
                buffer.pop_front();
                sub.lossy.store(true, Ordering::Relaxed);
                sub.dropped.fetch_add(1, Ordering::Relaxed);
            }
            buffer.push_back(event.clone());
            sub.condvar.notify_one();
        }
    }

    /// Marks every subscriber closed; blocked `recv` calls return `None`
    /// once their buffer drains. Call once the build is fully finished.
    pub fn close(&self) {
        let subscribers = self.subscribers.lock();
        for sub in subscribers.iter() {
            sub.closed.store(true, Ordering::Release);
            sub.condvar.notify_all();
        }
    }
}
