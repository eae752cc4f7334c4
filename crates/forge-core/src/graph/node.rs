//! Runtime node wrapping a [`Target`] with atomic scheduling state.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::target::Target;

/// Index of a node within its owning [`super::BuildGraph`]'s arena. Stable
/// for the lifetime of the graph; never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeIndex(pub usize);

/// Where a [`BuildNode`] sits in its lifecycle.
///
/// `Pending -> Ready -> Building -> {Success, Cached}` on the happy path;
/// `Building -> Ready` on a retryable failure; `Building -> Failed` or
/// `Pending -> Failed` (cascade) otherwise. See the scheduler module for
/// the state machine that drives these transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum NodeStatus {
    Pending = 0,
    Ready = 1,
    Building = 2,
    Success = 3,
    Cached = 4,
    Failed = 5,
}

impl NodeStatus {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Pending,
            1 => Self::Ready,
            2 => Self::Building,
            3 => Self::Success,
            4 => Self::Cached,
            5 => Self::Failed,
            _ => unreachable!("NodeStatus values are only ever written through this enum"),
        }
    }
}

/// Atomic holder for [`NodeStatus`], exposing compare-and-swap transitions
/// so exactly one worker can move a node out of `Ready`.
#[derive(Debug)]
pub struct AtomicStatus(AtomicU8);

impl AtomicStatus {
    pub fn new(initial: NodeStatus) -> Self {
        Self(AtomicU8::new(initial as u8))
    }

    pub fn load(&self) -> NodeStatus {
        NodeStatus::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Attempts `from -> to`; returns `true` iff this call performed the
    /// transition. Callers racing on the same node will see exactly one
    /// `true`.
    pub fn try_transition(&self, from: NodeStatus, to: NodeStatus) -> bool {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// A [`Target`] plus the mutable state the scheduler advances it through.
#[derive(Debug)]
pub struct BuildNode {
    pub target: Target,
    pub index: NodeIndex,
    status: AtomicStatus,
    pending_deps: AtomicUsize,
    pub dependencies: Vec<NodeIndex>,
    dependents: Mutex<Vec<NodeIndex>>,
    retry_attempts: AtomicUsize,
    last_error: Mutex<Option<String>>,
    discovered_outputs: Mutex<Vec<PathBuf>>,
}

impl BuildNode {
    pub fn new(target: Target, index: NodeIndex, dependencies: Vec<NodeIndex>) -> Self {
        let pending = dependencies.len();
        Self {
            target,
            index,
            status: AtomicStatus::new(NodeStatus::Pending),
            pending_deps: AtomicUsize::new(pending),
            dependencies,
            dependents: Mutex::new(Vec::new()),
            retry_attempts: AtomicUsize::new(0),
            last_error: Mutex::new(None),
            discovered_outputs: Mutex::new(Vec::new()),
        }
    }

    pub fn status(&self) -> NodeStatus {
        self.status.load()
    }

    pub fn try_transition(&self, from: NodeStatus, to: NodeStatus) -> bool {
        self.status.try_transition(from, to)
    }

    /// Force a status regardless of current value. Used only for cascade
    /// failures, where any pre-build status is valid to override.
    pub fn force_status(&self, to: NodeStatus) {
        self.status.0.store(to as u8, Ordering::Release);
    }

    pub fn pending_deps(&self) -> usize {
        self.pending_deps.load(Ordering::Acquire)
    }

    pub fn set_pending_deps(&self, value: usize) {
        self.pending_deps.store(value, Ordering::Release);
    }

    /// Decrements `pendingDeps` by one and returns the new value. Used by
    /// the scheduler's ready-detection on a dependency's completion.
    pub fn decrement_pending_deps(&self) -> usize {
        self.pending_deps.fetch_sub(1, Ordering::AcqRel) - 1
    }

    pub fn increment_pending_deps(&self) {
        self.pending_deps.fetch_add(1, Ordering::AcqRel);
    }

    pub fn dependents(&self) -> Vec<NodeIndex> {
        self.dependents.lock().clone()
    }

    pub fn add_dependent(&self, idx: NodeIndex) {
        self.dependents.lock().push(idx);
    }

    pub fn retry_attempts(&self) -> usize {
        self.retry_attempts.load(Ordering::Acquire)
    }

    pub fn increment_retry_attempts(&self) -> usize {
        self.retry_attempts.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn set_last_error(&self, message: impl Into<String>) {
        *self.last_error.lock() = Some(message.into());
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().clone()
    }

    pub fn set_discovered_outputs(&self, outputs: Vec<PathBuf>) {
        *self.discovered_outputs.lock() = outputs;
    }

    pub fn discovered_outputs(&self) -> Vec<PathBuf> {
        self.discovered_outputs.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::target::TargetType;

    fn node(deps: Vec<NodeIndex>) -> BuildNode {
        let target = Target::new("//pkg:a", TargetType::Library, "rust");
        BuildNode::new(target, NodeIndex(0), deps)
    }

    #[test]
    fn pending_deps_starts_at_dependency_count() {
        let n = node(vec![NodeIndex(1), NodeIndex(2)]);
        assert_eq!(n.pending_deps(), 2);
    }

    #[test]
    fn only_one_transition_succeeds_under_contention() {
        let n = node(vec![]);
        assert!(n.try_transition(NodeStatus::Pending, NodeStatus::Ready));
        assert!(!n.try_transition(NodeStatus::Pending, NodeStatus::Ready));
        assert_eq!(n.status(), NodeStatus::Ready);
    }

    #[test]
    fn decrement_reaches_zero() {
        let n = node(vec![NodeIndex(1)]);
        assert_eq!(n.decrement_pending_deps(), 0);
    }
}
