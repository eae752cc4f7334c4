//! `WorkspaceConfig`: the plain value produced by the (external) DSL parser
//! and consumed by every other component in this crate. Nothing here reads
//! a file or an environment variable directly -- construction is the
//! caller's responsibility, keeping the core a pure function of its inputs.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::graph::Target;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Options {
    pub cache_dir: PathBuf,
    pub output_dir: PathBuf,
    pub parallel: bool,
    pub incremental: bool,
    pub verbose: bool,
    pub max_jobs: usize,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            cache_dir: PathBuf::from(".builder-cache"),
            output_dir: PathBuf::from("out"),
            parallel: true,
            incremental: true,
            verbose: false,
            max_jobs: num_cpus(),
        }
    }
}

fn num_cpus() -> usize {
    std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpointing {
    pub enabled: bool,
    pub interval: Duration,
    pub path: PathBuf,
}

impl Default for Checkpointing {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(10),
            path: PathBuf::from(".builder-cache/checkpoint.bin"),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RetryConfig {
    pub enabled: bool,
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub exponential: bool,
    pub jitter: bool,
}

impl Default for RetryConfig {
    /// A single unified policy for every Transient error kind (§9 open
    /// question: IO `locked` and Cache `timeout` both resolve to this one
    /// table rather than a per-kind schedule).
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: 3,
            initial_backoff: Duration::from_millis(200),
            exponential: true,
            jitter: true,
        }
    }
}

/// Small, explicit allowlist of host environment variables the core itself
/// ever reads. Everything else is either workspace-declared (`Target.env`,
/// `global_env`) or irrelevant to a hermetic build.
pub const RECOGNIZED_ENV_VARS: &[&str] = &[
    "BUILDER_VERBOSE",
    "BUILDER_TRACING_ENABLED",
    "BUILDER_TRACING_EXPORTER",
    "BUILDER_TRACING_OUTPUT",
    "BUILDER_SIMD_DISABLED",
    "BUILDER_AUDIT_EXEC",
];

/// Environment variables never included in an action's canonical env subset,
/// regardless of `global_env`/`Target.env` contents, because they vary by
/// host/session and would make an `ActionKey` non-reproducible.
pub const ACTION_ENV_DENYLIST: &[&str] = &["PATH", "HOME", "USER", "PWD", "SHELL", "TMPDIR", "TERM"];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceConfig {
    pub root: PathBuf,
    pub targets: Vec<Target>,
    pub options: Options,
    pub global_env: HashMap<String, String>,
    pub checkpointing: Checkpointing,
    pub retry: RetryConfig,
}

impl WorkspaceConfig {
    pub fn new(root: impl Into<PathBuf>, targets: Vec<Target>) -> Self {
        Self {
            root: root.into(),
            targets,
            options: Options::default(),
            global_env: HashMap::new(),
            checkpointing: Checkpointing::default(),
            retry: RetryConfig::default(),
        }
    }

    /// The canonical env subset for ActionKey purposes: the sorted union of
    /// `global_env` and a target's own `env`, minus [`ACTION_ENV_DENYLIST`].
    pub fn canonical_env_for(&self, target: &Target) -> Vec<(String, String)> {
        let mut merged: HashMap<&str, &str> = HashMap::new();
        for (k, v) in &self.global_env {
            merged.insert(k.as_str(), v.as_str());
        }
        for (k, v) in &target.env {
            merged.insert(k.as_str(), v.as_str());
        }
        let mut entries: Vec<(String, String)> = merged
            .into_iter()
            .filter(|(k, _)| !ACTION_ENV_DENYLIST.contains(k))
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::TargetType;

    #[test]
    fn canonical_env_excludes_denylist_and_merges_target_over_global() {
        let mut target = Target::new("//p:a", TargetType::Library, "rust");
        target.env.insert("LEVEL".to_string(), "debug".to_string());
        target.env.insert("PATH".to_string(), "/usr/bin".to_string());

        let mut config = WorkspaceConfig::new("/ws", vec![target.clone()]);
        config.global_env.insert("LEVEL".to_string(), "release".to_string());
        config.global_env.insert("REGION".to_string(), "us".to_string());

        let env = config.canonical_env_for(&target);
        assert_eq!(
            env,
            vec![("LEVEL".to_string(), "debug".to_string()), ("REGION".to_string(), "us".to_string())]
        );
    }
}
