//! Polyglot build engine core.
//!
//! Given a [`config::WorkspaceConfig`] and a populated [`services::BuildServices`],
//! [`run`] builds every declared target to the minimum work required: a
//! [`graph::BuildGraph`] orders the work, a [`scheduler`] dispatches it across
//! a worker pool, an [`executor::ActionExecutor`] runs each action hermetically
//! against an [`action_cache::ActionCache`] backed by a [`content_store::ContentStore`],
//! and a [`dep_analyzer::DepAnalyzer`] decides what's dirty on incremental runs.
//! Nothing in this crate reads a config file, calls `std::process::exit`, or
//! prints to stdout -- see each module's doc comment for its part of the
//! contract.

pub mod action_cache;
pub mod binary_format;
pub mod checkpoint;
pub mod config;
pub mod content_store;
pub mod dep_analyzer;
pub mod error;
pub mod events;
pub mod executor;
pub mod fingerprint;
pub mod graph;
pub mod language_handler;
pub mod retry;
pub mod scheduler;
pub mod services;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tracing::{info, warn};

use crate::action_cache::ActionCache;
use crate::checkpoint::{Checkpoint, CheckpointStore, NodeSnapshot};
use crate::config::WorkspaceConfig;
use crate::content_store::ContentStore;
use crate::error::{BuildError, BuildResult, ErrorKind};
use crate::events::EventBus;
use crate::executor::{Action, ActionExecutor, ActionOutcome, ExecutionRecord};
use crate::fingerprint::Fingerprint;
use crate::graph::{BuildGraph, NodeStatus, TargetId};
use crate::language_handler::LanguageHandler;
use crate::scheduler::{DiscoveryRecord, NodeOutcome, SchedulerConfig};
use crate::services::BuildServices;

const TOOL_VERSION: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));
const DEFAULT_ACTION_TIMEOUT: Duration = Duration::from_secs(600);

/// Everything a caller needs after a run: the scheduler's tally plus a
/// handle to the event stream (already closed by the time this returns).
pub struct BuildOutcome {
    pub summary: scheduler::BuildSummary,
    pub events: Arc<EventBus>,
}

/// Runs every target in `config` to completion. `now` is a caller-supplied
/// Unix timestamp (this crate never reads the system clock itself, keeping
/// it a pure function of its inputs and testable without real time).
///
/// Builds its own [`EventBus`] with no subscribers; use
/// [`run_with_events`] when the caller needs to observe the event sequence
/// as the build progresses rather than just the final summary.
#[tracing::instrument(level = "info", skip(config, services))]
pub fn run(config: WorkspaceConfig, services: BuildServices, now: u64) -> BuildResult<BuildOutcome> {
    run_with_events(config, services, now, Arc::new(EventBus::new()))
}

/// Same as [`run`], but against a caller-supplied [`EventBus`]. Subscribe
/// to `events` before calling this function to observe `BuildStarted`
/// through `BuildCompleted`/`BuildFailed` as they're published; subscribing
/// afterward only sees events published to a fresh subscription, i.e.
/// nothing, since a subscriber's queue starts empty at subscribe time.
#[tracing::instrument(level = "info", skip(config, services, events))]
pub fn run_with_events(
    config: WorkspaceConfig,
    services: BuildServices,
    now: u64,
    events: Arc<EventBus>,
) -> BuildResult<BuildOutcome> {
    let content = Arc::new(ContentStore::open(config.options.cache_dir.join("objects"))?);
    let action_cache = Arc::new(ActionCache::open(
        config.options.cache_dir.join("actions"),
        content.clone(),
        &workspace_secret(&config),
    )?);
    let executor = Arc::new(ActionExecutor::new(action_cache.clone(), content.clone(), config.options.cache_dir.join("scratch"))?);
    let graph = Arc::new(BuildGraph::build(config.targets.clone())?);
    let output_fingerprints: Arc<DashMap<TargetId, Fingerprint>> = Arc::new(DashMap::new());

    let checkpoint_store = CheckpointStore::new(config.checkpointing.path.clone());
    if config.checkpointing.enabled {
        if let Some(loaded) = checkpoint_store.load_or_warn() {
            let current_digest = graph.identity_digest();
            if loaded.graph_digest == current_digest {
                info!(nodes = loaded.nodes.len(), "resuming from checkpoint");
                checkpoint::apply(&graph, &loaded, &output_fingerprints);
            } else {
                warn!("checkpoint graph digest does not match the current build graph, ignoring it");
            }
        }
    }

    let config = Arc::new(config);
    let sched_config = SchedulerConfig {
        workers: config.options.max_jobs.max(1),
        keep_going: false,
        critical_path_heuristic: true,
    };

    let execute = build_executor_closure(graph.clone(), config.clone(), services, executor.clone(), output_fingerprints.clone());
    let summary = scheduler::run(graph.clone(), events.clone(), sched_config, config.retry, execute);

    if config.checkpointing.enabled {
        let mut fresh_checkpoint = Checkpoint::new(now, graph.identity_digest());
        for idx in graph.all_indices() {
            let Some((target, status)) = graph.with_node(idx, |n| (n.target.clone(), n.status())) else { continue };
            if matches!(status, NodeStatus::Success | NodeStatus::Cached | NodeStatus::Failed) {
                let output_fingerprint = output_fingerprints.get(&target.id).map(|r| *r.value());
                let retry_attempts = graph.with_node(idx, |n| n.retry_attempts()).unwrap_or(0);
                fresh_checkpoint.record(
                    target.id.clone(),
                    NodeSnapshot {
                        status,
                        output_fingerprint,
                        retry_attempts,
                        source_fingerprint: checkpoint::source_fingerprint(&target),
                    },
                );
            }
        }
        if let Err(e) = checkpoint_store.save(&fresh_checkpoint) {
            warn!(error = %e.message, "failed to persist checkpoint");
        }
    }

    events.close();
    Ok(BuildOutcome { summary, events })
}

/// Derives a workspace-scoped HMAC key for the action cache from the
/// workspace root path. Not a secrecy boundary -- only enough to separate
/// cache entries between workspaces that happen to share a cache directory.
fn workspace_secret(config: &WorkspaceConfig) -> Vec<u8> {
    Fingerprint::of_bytes(config.root.to_string_lossy().as_bytes()).as_bytes().to_vec()
}

fn build_executor_closure(
    graph: Arc<BuildGraph>,
    config: Arc<WorkspaceConfig>,
    services: BuildServices,
    executor: Arc<ActionExecutor>,
    output_fingerprints: Arc<DashMap<TargetId, Fingerprint>>,
) -> impl Fn(graph::NodeIndex) -> NodeOutcome + Send + Sync + 'static {
    let services = Arc::new(services);
    // Built once per run: maps a target's declared output path back to the
    // target that produces it, so a discovered import resolving to that
    // path can be turned into a dependency edge in `resolve_discovery`.
    let output_path_index: Arc<HashMap<PathBuf, TargetId>> = Arc::new(
        graph
            .all_indices()
            .into_iter()
            .filter_map(|idx| graph.with_node(idx, |n| (n.target.output_path.clone(), n.target.id.clone())))
            .collect(),
    );
    move |idx| {
        let Some(target) = graph.with_node(idx, |n| n.target.clone()) else {
            return NodeOutcome::Failed { error: BuildError::internal("scheduler referenced an unknown node index") };
        };

        let handler = match services.language_handler(&target.language) {
            Some(handler) => handler,
            None => {
                return NodeOutcome::Failed {
                    error: BuildError::new(
                        ErrorKind::Language,
                        "LANGUAGE_HANDLER_NOT_REGISTERED",
                        format!("no LanguageHandler registered for language {:?}", target.language),
                    )
                    .with_target(target.id.clone()),
                }
            }
        };

        let plan = match handler.plan(&target, &config) {
            Ok(plan) => plan,
            Err(error) => return NodeOutcome::Failed { error },
        };

        let source_fingerprints: BuildResult<Vec<Fingerprint>> =
            target.sources.iter().map(|path| Fingerprint::of_file(path)).collect();
        let source_fingerprints = match source_fingerprints {
            Ok(fps) => fps,
            Err(error) => return NodeOutcome::Failed { error: error.wrap("fingerprinting sources") },
        };

        let dep_fingerprints: Vec<Fingerprint> = graph
            .with_node(idx, |n| n.dependencies.clone())
            .unwrap_or_default()
            .into_iter()
            .filter_map(|dep_idx| graph.with_node(dep_idx, |n| n.target.id.clone()))
            .filter_map(|dep_id| output_fingerprints.get(&dep_id).map(|r| *r.value()))
            .collect();

        let action = Action {
            target: target.id.clone(),
            plan,
            ordered_source_fingerprints: source_fingerprints,
            ordered_dep_output_fingerprints: dep_fingerprints,
            canonical_env: config.canonical_env_for(&target),
            tool_version: TOOL_VERSION.to_string(),
            timeout: DEFAULT_ACTION_TIMEOUT,
        };

        match executor.run_blocking(&action, 0) {
            Ok(ActionOutcome::Cached(entry)) => {
                output_fingerprints.insert(target.id.clone(), entry.output_fingerprint);
                NodeOutcome::Cached { output_fingerprint: entry.output_fingerprint }
            }
            Ok(ActionOutcome::Executed { entry, record }) => {
                output_fingerprints.insert(target.id.clone(), entry.output_fingerprint);
                let discovery = resolve_discovery(&handler, &record, &output_path_index, &target.id);
                NodeOutcome::Success { output_fingerprint: entry.output_fingerprint, discovery }
            }
            Err(error) => NodeOutcome::Failed { error },
        }
    }
}

/// Turns an action's untracked output files into new dependency edges: each
/// file a handler's import analysis resolves to another target's declared
/// output path becomes a dependency of the target that just ran on the
/// target that produced it. Discovery never introduces brand-new targets
/// here, since a compiler's own file imports only ever point at targets the
/// graph already knows about.
fn resolve_discovery(
    handler: &Arc<dyn LanguageHandler>,
    record: &ExecutionRecord,
    output_path_index: &HashMap<PathBuf, TargetId>,
    target_id: &TargetId,
) -> DiscoveryRecord {
    if record.discovered_outputs.is_empty() {
        return DiscoveryRecord::default();
    }
    let imports = match handler.analyze_imports(&record.discovered_outputs) {
        Ok(imports) => imports,
        Err(error) => {
            warn!(error = %error.message, target = %target_id, "discovery import analysis failed, continuing without it");
            return DiscoveryRecord::default();
        }
    };
    let extra_edges: std::collections::HashSet<(TargetId, TargetId)> = imports
        .into_iter()
        .filter_map(|import| output_path_index.get(&import.file).cloned())
        .filter(|dep_id| dep_id != target_id)
        .map(|dep_id| (target_id.clone(), dep_id))
        .collect();
    DiscoveryRecord { new_targets: Vec::new(), extra_edges: extra_edges.into_iter().collect() }
}
