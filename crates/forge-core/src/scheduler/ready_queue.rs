//! Fine-grained-locked priority ready queue.
//!
//! Nodes become ready from multiple worker threads concurrently (on
//! dependency completion) and are consumed by the worker pool. A
//! `Mutex<BinaryHeap>` plus a `Condvar` is the "fine-grained lock" option
//! from the concurrency model (§5) -- simpler than a lock-free MPMC queue
//! and sufficient at the node-completion frequencies a build graph sees.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use parking_lot::{Condvar, Mutex};

use crate::graph::NodeIndex;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
struct ReadyItem {
    priority: u64,
    index: NodeIndex,
}

impl Ord for ReadyItem {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority.cmp(&other.priority).then_with(|| other.index.0.cmp(&self.index.0))
    }
}

impl PartialOrd for ReadyItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Shared ready queue, ordered by a caller-supplied priority (the
/// critical-path heuristic in §4.6 when enabled, or insertion order when
/// every item carries the same priority).
pub struct ReadyQueue {
    heap: Mutex<BinaryHeap<ReadyItem>>,
    condvar: Condvar,
    closed: Mutex<bool>,
}

impl Default for ReadyQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl ReadyQueue {
    pub fn new() -> Self {
        Self {
            heap: Mutex::new(BinaryHeap::new()),
            condvar: Condvar::new(),
            closed: Mutex::new(false),
        }
    }

    pub fn push(&self, index: NodeIndex, priority: u64) {
        self.heap.lock().push(ReadyItem { priority, index });
        self.condvar.notify_one();
    }

    pub fn len(&self) -> usize {
        self.heap.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Blocks until an item is available or the queue is closed, returning
    /// `None` only once closed with nothing left to drain.
    pub fn pop_blocking(&self) -> Option<NodeIndex> {
        let mut heap = self.heap.lock();
        loop {
            if let Some(item) = heap.pop() {
                return Some(item.index);
            }
            if *self.closed.lock() {
                return None;
            }
            self.condvar.wait(&mut heap);
        }
    }

    /// Signals every blocked worker to wake up and check for closure.
    /// Called once the scheduler determines no more work can ever arrive.
    pub fn close(&self) {
        *self.closed.lock() = true;
        self.condvar.notify_all();
    }
}
