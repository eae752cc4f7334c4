//! Parallel worker-pool scheduler: the main control loop that drives every
//! [`BuildNode`] from `Pending` through to a terminal status.

mod ready_queue;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{info, instrument, warn};

use crate::error::BuildError;
use crate::events::{Event, EventBus};
use crate::fingerprint::Fingerprint;
use crate::graph::{BuildGraph, NodeIndex, NodeStatus, Target, TargetId};
use crate::retry::{self, RetryDecision};

pub use ready_queue::ReadyQueue;

/// Additional targets/edges an action declared at execution time (§4.4
/// discovery protocol). Applied via [`BuildGraph::extend`] before any
/// dependent of the discovering node is allowed to become ready.
#[derive(Debug, Clone, Default)]
pub struct DiscoveryRecord {
    pub new_targets: Vec<Target>,
    pub extra_edges: Vec<(TargetId, TargetId)>,
}

/// What running one node's action produced.
pub enum NodeOutcome {
    Success { output_fingerprint: Fingerprint, discovery: DiscoveryRecord },
    Cached { output_fingerprint: Fingerprint },
    Failed { error: BuildError },
}

#[derive(Debug, Clone, Copy)]
pub struct SchedulerConfig {
    pub workers: usize,
    /// `false` = first-failure cancellation; `true` = keep-going.
    pub keep_going: bool,
    pub critical_path_heuristic: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            workers: std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4),
            keep_going: false,
            critical_path_heuristic: true,
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct BuildSummary {
    pub built: usize,
    pub cached: usize,
    pub failed: usize,
    pub not_run: usize,
}

/// Cooperative cancellation flag shared between the scheduler loop and any
/// long-running action executor. Checked before each batch dispatch, never
/// forcibly terminates in-flight work.
#[derive(Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Longest-path-to-sink cost estimate used only to break ties among
/// simultaneously-ready nodes; never gates readiness.
fn estimate_cost(graph: &BuildGraph, idx: NodeIndex) -> u64 {
    const BASE: u64 = 1;
    const SOURCE_WEIGHT: u64 = 2;
    const DEP_WEIGHT: u64 = 3;
    graph
        .with_node(idx, |node| {
            BASE + node.target.sources.len() as u64 * SOURCE_WEIGHT + node.dependencies.len() as u64 * DEP_WEIGHT
        })
        .unwrap_or(BASE)
}

/// Runs `execute` for every node in `graph` to completion, respecting
/// dependency order, retrying Transient failures per `retry_config`, and
/// applying discovery records as they arrive. `execute` must itself be
/// `Sync` since it's called concurrently from `config.workers` threads.
#[instrument(level = "info", skip(graph, events, execute))]
pub fn run<F>(
    graph: Arc<BuildGraph>,
    events: Arc<EventBus>,
    config: SchedulerConfig,
    retry_config: crate::config::RetryConfig,
    execute: F,
) -> BuildSummary
where
    F: Fn(NodeIndex) -> NodeOutcome + Send + Sync + 'static,
{
    let start = Instant::now();
    let total = graph.len();
    events.publish(Event::BuildStarted { elapsed: start.elapsed(), target_count: total });

    // Large-build optimization (§4.6): pre-size the ready queue and result
    // bookkeeping up front rather than growing them incrementally.
    let ready = Arc::new(ReadyQueue::new());
    let active_tasks = Arc::new(AtomicUsize::new(0));
    let failed_tasks = Arc::new(AtomicUsize::new(0));
    let built = Arc::new(AtomicUsize::new(0));
    let cached = Arc::new(AtomicUsize::new(0));
    let cancel = CancelToken::new();

    for idx in graph.all_indices() {
        if graph.with_node(idx, |n| n.pending_deps()).unwrap_or(1) == 0 {
            graph.with_node(idx, |n| n.try_transition(NodeStatus::Pending, NodeStatus::Ready));
            ready.push(idx, estimate_cost(&graph, idx));
        }
    }

    let execute = Arc::new(execute);
    let remaining = Arc::new(AtomicUsize::new(total));
    let handles: Vec<_> = (0..config.workers.max(1))
        .map(|_| {
            let graph = graph.clone();
            let events = events.clone();
            let ready = ready.clone();
            let active_tasks = active_tasks.clone();
            let failed_tasks = failed_tasks.clone();
            let built = built.clone();
            let cached = cached.clone();
            let cancel = cancel.clone();
            let execute = execute.clone();
            let remaining = remaining.clone();
            let retry_config = retry_config;

            std::thread::spawn(move || loop {
                if cancel.is_cancelled() && ready.is_empty() {
                    ready.close();
                }
                let Some(idx) = ready.pop_blocking() else {
                    return;
                };

                if cancel.is_cancelled() {
                    graph.with_node(idx, |n| n.force_status(NodeStatus::Pending));
                    continue;
                }

                if !graph.with_node(idx, |n| n.try_transition(NodeStatus::Ready, NodeStatus::Building)).unwrap_or(false) {
                    continue;
                }
                active_tasks.fetch_add(1, Ordering::AcqRel);
                let target_id = graph.with_node(idx, |n| n.target.id.clone()).expect("node exists");
                events.publish(Event::TargetStarted { elapsed: start.elapsed(), target: target_id.clone() });

                let outcome = execute(idx);
                active_tasks.fetch_sub(1, Ordering::AcqRel);

                match outcome {
                    NodeOutcome::Cached { .. } => {
                        graph.with_node(idx, |n| n.force_status(NodeStatus::Cached));
                        cached.fetch_add(1, Ordering::AcqRel);
                        events.publish(Event::TargetCached { elapsed: start.elapsed(), target: target_id.clone() });
                        remaining.fetch_sub(1, Ordering::AcqRel);
                        enqueue_dependents(&graph, idx, &ready, &cancel);
                    }
                    NodeOutcome::Success { discovery, .. } => {
                        if !(discovery.new_targets.is_empty() && discovery.extra_edges.is_empty()) {
                            match graph.extend(discovery.new_targets, discovery.extra_edges) {
                                Ok(freshly_ready) => {
                                    for fresh_idx in freshly_ready {
                                        graph.with_node(fresh_idx, |n| {
                                            n.try_transition(NodeStatus::Pending, NodeStatus::Ready)
                                        });
                                        ready.push(fresh_idx, estimate_cost(&graph, fresh_idx));
                                        remaining.fetch_add(1, Ordering::AcqRel);
                                    }
                                }
                                Err(e) => {
                                    warn!(error = %e.message, "discovery record rejected, continuing without it");
                                }
                            }
                        }
                        graph.with_node(idx, |n| n.force_status(NodeStatus::Success));
                        built.fetch_add(1, Ordering::AcqRel);
                        events.publish(Event::TargetCompleted { elapsed: start.elapsed(), target: target_id.clone() });
                        remaining.fetch_sub(1, Ordering::AcqRel);
                        enqueue_dependents(&graph, idx, &ready, &cancel);
                    }
                    NodeOutcome::Failed { error } => {
                        let attempt = graph.with_node(idx, |n| n.increment_retry_attempts()).unwrap_or(1) as u32;
                        match retry::decide(&retry_config, &error, attempt) {
                            RetryDecision::Retry { backoff_ms } => {
                                graph.with_node(idx, |n| n.set_last_error(error.message.clone()));
                                std::thread::sleep(Duration::from_millis(backoff_ms));
                                graph.with_node(idx, |n| n.force_status(NodeStatus::Ready));
                                ready.push(idx, estimate_cost(&graph, idx));
                            }
                            RetryDecision::GiveUp => {
                                graph.with_node(idx, |n| {
                                    n.set_last_error(error.message.clone());
                                    n.force_status(NodeStatus::Failed);
                                });
                                failed_tasks.fetch_add(1, Ordering::AcqRel);
                                events.publish(Event::TargetFailed {
                                    elapsed: start.elapsed(),
                                    target: target_id.clone(),
                                    cause: None,
                                });
                                remaining.fetch_sub(1, Ordering::AcqRel);
                                cascade_failure(&graph, idx, &events, start, &failed_tasks, &remaining);
                                if !config.keep_going {
                                    cancel.cancel();
                                }
                            }
                        }
                    }
                }

                if remaining.load(Ordering::Acquire) == 0 {
                    ready.close();
                }
            })
        })
        .collect();

    for handle in handles {
        let _ = handle.join();
    }

    let summary = BuildSummary {
        built: built.load(Ordering::Acquire),
        cached: cached.load(Ordering::Acquire),
        failed: failed_tasks.load(Ordering::Acquire),
        not_run: graph
            .all_indices()
            .into_iter()
            .filter(|&idx| {
                graph
                    .with_node(idx, |n| matches!(n.status(), NodeStatus::Pending | NodeStatus::Ready))
                    .unwrap_or(false)
            })
            .count(),
    };

    if summary.failed > 0 {
        events.publish(Event::BuildFailed {
            elapsed: start.elapsed(),
            built: summary.built,
            cached: summary.cached,
            failed: summary.failed,
        });
    } else {
        events.publish(Event::BuildCompleted {
            elapsed: start.elapsed(),
            built: summary.built,
            cached: summary.cached,
            failed: summary.failed,
        });
    }
    info!(?summary, "build finished");
    summary
}

fn enqueue_dependents(graph: &BuildGraph, completed: NodeIndex, ready: &ReadyQueue, cancel: &CancelToken) {
    for dependent in graph.dependents_of(completed) {
        let newly_ready = graph
            .with_node(dependent, |n| {
                let remaining = n.decrement_pending_deps();
                remaining == 0 && n.try_transition(NodeStatus::Pending, NodeStatus::Ready)
            })
            .unwrap_or(false);
        if newly_ready && !cancel.is_cancelled() {
            ready.push(dependent, estimate_cost(graph, dependent));
        }
    }
}

/// Marks every direct and transitive dependent of a failed node as `Failed`
/// without running its action, per the cascade-failure contract (§7).
fn cascade_failure(
    graph: &BuildGraph,
    failed: NodeIndex,
    events: &EventBus,
    start: Instant,
    failed_tasks: &AtomicUsize,
    remaining: &AtomicUsize,
) {
    let mut stack = graph.dependents_of(failed);
    let mut visited = std::collections::HashSet::new();
    while let Some(idx) = stack.pop() {
        if !visited.insert(idx) {
            continue;
        }
        let status = graph.with_node(idx, |n| n.status());
        if status != Some(NodeStatus::Pending) {
            continue;
        }
        graph.with_node(idx, |n| n.force_status(NodeStatus::Failed));
        failed_tasks.fetch_add(1, Ordering::AcqRel);
        remaining.fetch_sub(1, Ordering::AcqRel);
        let target_id = graph.with_node(idx, |n| n.target.id.clone());
        if let Some(target_id) = target_id {
            events.publish(Event::TargetFailed { elapsed: start.elapsed(), target: target_id, cause: None });
        }
        stack.extend(graph.dependents_of(idx));
    }
}
