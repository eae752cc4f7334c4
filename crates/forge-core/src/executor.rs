//! Hermetic action execution: input staging, argv-only subprocess
//! invocation, output capture, and the cache-lookup-or-build path tying
//! [`ActionCache`] and [`ContentStore`] together (§4.5).

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::process::Command;
use tokio::time::timeout;
use tracing::{instrument, warn};

use crate::action_cache::{ActionCache, ActionKey, CacheEntry};
use crate::content_store::ContentStore;
use crate::error::{BuildError, BuildResult, ErrorKind, RecoveryClass};
use crate::fingerprint::Fingerprint;
use crate::graph::TargetId;
use crate::language_handler::ActionPlan;

/// Inputs to one action invocation, already resolved to concrete fingerprints.
#[derive(Debug, Clone)]
pub struct Action {
    pub target: TargetId,
    pub plan: ActionPlan,
    pub ordered_source_fingerprints: Vec<Fingerprint>,
    pub ordered_dep_output_fingerprints: Vec<Fingerprint>,
    pub canonical_env: Vec<(String, String)>,
    pub tool_version: String,
    pub timeout: Duration,
}

impl Action {
    pub fn action_key(&self) -> ActionKey {
        ActionKey::compute(
            &self.target,
            &self.ordered_source_fingerprints,
            &self.ordered_dep_output_fingerprints,
            &self.plan.args,
            &self.canonical_env,
            &self.tool_version,
        )
    }
}

/// What actually happened when an action ran (as opposed to a cache hit).
#[derive(Debug, Clone)]
pub struct ExecutionRecord {
    pub exit_code: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub discovered_outputs: Vec<PathBuf>,
}

pub enum ActionOutcome {
    Cached(CacheEntry),
    Executed { entry: CacheEntry, record: ExecutionRecord },
}

const DEFAULT_ACTION_TIMEOUT: Duration = Duration::from_secs(600);

/// Ties [`ActionCache`] lookups to real subprocess execution. One instance
/// is shared across every worker thread.
pub struct ActionExecutor {
    cache: Arc<ActionCache>,
    content: Arc<ContentStore>,
    scratch_root: PathBuf,
    runtime: tokio::runtime::Runtime,
}

impl ActionExecutor {
    pub fn new(cache: Arc<ActionCache>, content: Arc<ContentStore>, scratch_root: impl Into<PathBuf>) -> BuildResult<Self> {
        let scratch_root = scratch_root.into();
        std::fs::create_dir_all(&scratch_root)
            .map_err(|e| BuildError::io("IO_CREATE_FAILED", &e, &scratch_root).wrap("preparing scratch root"))?;
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| BuildError::new(ErrorKind::System, "EXECUTOR_RUNTIME_INIT_FAILED", e.to_string()))?;
        Ok(Self { cache, content, scratch_root, runtime })
    }

    /// Synchronous entry point for scheduler worker threads: each worker
    /// owns no async runtime of its own, so the one suspension point (the
    /// subprocess wait) is driven by a private single-threaded runtime here.
    pub fn run_blocking(&self, action: &Action, now: u64) -> BuildResult<ActionOutcome> {
        self.runtime.block_on(self.run(action, now))
    }

    #[instrument(level = "info", skip(self, action), fields(target = %action.target))]
    async fn run(&self, action: &Action, now: u64) -> BuildResult<ActionOutcome> {
        let key = action.action_key();
        if let Some(entry) = self.cache.lookup(&key)? {
            return Ok(ActionOutcome::Cached(entry));
        }

        validate_hermeticity(&action.plan)?;

        let scratch = self.stage_scratch_dir(action)?;
        let record = self.invoke(action, &scratch).await?;

        if record.exit_code != 0 {
            let _ = std::fs::remove_dir_all(&scratch);
            return Err(BuildError::new(
                ErrorKind::Build,
                "BUILD_ACTION_FAILED",
                format!("action exited with status {}", record.exit_code),
            )
            .with_target(action.target.clone()));
        }

        // Outputs must be read back before the scratch directory is removed
        // below; a relative `declared_outputs` entry only exists inside it.
        let mut outputs = Vec::with_capacity(action.plan.declared_outputs.len());
        let read_result: BuildResult<()> = (|| {
            for path in &action.plan.declared_outputs {
                let full = scratch.join(path);
                let bytes = std::fs::read(&full)
                    .map_err(|e| BuildError::io("IO_NOT_FOUND", &e, &full).wrap("reading declared output"))?;
                outputs.push((path.clone(), bytes));
            }
            Ok(())
        })();

        if let Err(e) = std::fs::remove_dir_all(&scratch) {
            warn!(error = %e, path = %scratch.display(), "failed to clean up scratch directory");
        }
        read_result?;

        let entry = self.cache.put(key, outputs, now)?;
        Ok(ActionOutcome::Executed { entry, record })
    }

    fn stage_scratch_dir(&self, action: &Action) -> BuildResult<PathBuf> {
        let dir = self.scratch_root.join(format!("action-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir(&dir).map_err(|e| BuildError::io("IO_CREATE_FAILED", &e, &dir).wrap("creating scratch directory"))?;

        for input in &action.plan.declared_inputs {
            let Some(name) = input.file_name() else { continue };
            let dest = dir.join(name);
            stage_one(input, &dest)?;
        }
        Ok(dir)
    }

    async fn invoke(&self, action: &Action, scratch: &Path) -> BuildResult<ExecutionRecord> {
        let mut command = Command::new(&action.plan.program);
        command.args(&action.plan.args);
        command.current_dir(scratch);
        command.env_clear();
        for (k, v) in &action.canonical_env {
            command.env(k, v);
        }
        command.kill_on_drop(true);

        let action_timeout = if action.timeout.is_zero() { DEFAULT_ACTION_TIMEOUT } else { action.timeout };
        let output = match timeout(action_timeout, command.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(BuildError::new(ErrorKind::System, "EXECUTOR_SPAWN_FAILED", e.to_string())
                    .with_target(action.target.clone()));
            }
            Err(_) => {
                return Err(BuildError::new(
                    ErrorKind::System,
                    "EXECUTOR_TIMEOUT",
                    format!("action exceeded {action_timeout:?}"),
                )
                .with_target(action.target.clone())
                .with_recoverability(RecoveryClass::Transient));
            }
        };

        Ok(ExecutionRecord {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: output.stdout,
            stderr: output.stderr,
            discovered_outputs: discover_untracked_outputs(scratch, &action.plan.declared_outputs),
        })
    }
}

/// Walks the scratch directory after an action runs and returns every file
/// under it, relative to `scratch`, that wasn't in `declared_outputs` --
/// output the language handler's static plan didn't predict. Used to drive
/// the discovery protocol: a handler's import analysis over these files may
/// turn up dependency edges the graph didn't already know about.
fn discover_untracked_outputs(scratch: &Path, declared_outputs: &[PathBuf]) -> Vec<PathBuf> {
    let declared: HashSet<&PathBuf> = declared_outputs.iter().collect();
    let mut discovered: Vec<PathBuf> = walkdir::WalkDir::new(scratch)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .filter_map(|entry| entry.path().strip_prefix(scratch).ok().map(Path::to_path_buf))
        .filter(|relative| !declared.contains(relative))
        .collect();
    discovered.sort();
    discovered
}

/// Copies `src` to `dest`, preferring a hard link (cheap, preserves content
/// identity) and falling back to a real copy when linking isn't possible
/// (cross-device staging directories, read-only source filesystems).
fn stage_one(src: &Path, dest: &Path) -> BuildResult<()> {
    if std::fs::hard_link(src, dest).is_ok() {
        return Ok(());
    }
    std::fs::copy(src, dest).map_err(|e| BuildError::io("IO_READ_FAILED", &e, src).wrap("staging action input"))?;
    Ok(())
}

/// Declared inputs and outputs must be disjoint; a plan that reads from a
/// path it also declares as an output could read back content it's about to
/// overwrite, defeating reproducibility.
fn validate_hermeticity(plan: &ActionPlan) -> BuildResult<()> {
    let outputs: std::collections::HashSet<&PathBuf> = plan.declared_outputs.iter().collect();
    for input in &plan.declared_inputs {
        if outputs.contains(input) {
            return Err(BuildError::new(
                ErrorKind::Build,
                "EXECUTOR_HERMETICITY_VIOLATION",
                format!("{} is declared as both an input and an output", input.display()),
            ));
        }
    }
    Ok(())
}

#[allow(dead_code)]
fn empty_env() -> BTreeMap<String, String> {
    BTreeMap::new()
}
