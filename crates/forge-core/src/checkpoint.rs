//! Checkpoint persistence and resume planning (§4.7).
//!
//! A checkpoint is a snapshot of every node's terminal status, output
//! fingerprint, and source fingerprint, plus a digest of the graph it was
//! taken against, written with the same magic-header + CRC32 +
//! atomic-rename integrity pattern the action cache uses for its entries.
//! Resuming a build reads the most recent valid checkpoint, rejects it
//! outright if its graph digest no longer matches, and otherwise turns it
//! into a set of nodes the scheduler can skip -- except for any whose
//! sources have since changed, which rebuild instead.

use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{instrument, warn};

use crate::error::{BuildError, BuildResult, ErrorKind};
use crate::fingerprint::{CanonicalWriter, Fingerprint};
use crate::graph::{BuildGraph, NodeStatus, Target, TargetId};

const CHECKPOINT_MAGIC: &[u8; 4] = b"FCHK";
const CHECKPOINT_FORMAT_VERSION: u32 = 1;
const CHECKPOINT_HEADER_SIZE: usize = 20;

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum CheckpointIntegrityError {
    #[error("checkpoint file too small: {size} bytes (minimum {minimum})")]
    FileTooSmall { size: usize, minimum: usize },
    #[error("invalid checkpoint magic: expected {expected:?}, found {found:?}")]
    InvalidMagic { expected: [u8; 4], found: [u8; 4] },
    #[error("unsupported checkpoint format version: found {found}, supported up to {supported}")]
    UnsupportedVersion { found: u32, supported: u32 },
    #[error("checkpoint checksum mismatch: expected {expected:#010x}, computed {computed:#010x}")]
    ChecksumMismatch { expected: u32, computed: u32 },
    #[error("checkpoint length mismatch: declared {declared}, actual {actual}")]
    LengthMismatch { declared: u64, actual: u64 },
}

/// Wraps/unwraps a checkpoint payload with a 20-byte integrity header:
/// magic(4) + version(4) + crc32(4) + length(8), matching the layout used
/// throughout this codebase's other persisted-state formats.
struct IntegrityWrapper;

impl IntegrityWrapper {
    fn wrap(payload: &[u8]) -> Vec<u8> {
        let checksum = crc32fast::hash(payload);
        let length = payload.len() as u64;
        let mut out = Vec::with_capacity(CHECKPOINT_HEADER_SIZE + payload.len());
        out.extend_from_slice(CHECKPOINT_MAGIC);
        out.extend_from_slice(&CHECKPOINT_FORMAT_VERSION.to_le_bytes());
        out.extend_from_slice(&checksum.to_le_bytes());
        out.extend_from_slice(&length.to_le_bytes());
        out.extend_from_slice(payload);
        out
    }

    fn unwrap(data: &[u8]) -> Result<&[u8], CheckpointIntegrityError> {
        if data.len() < CHECKPOINT_HEADER_SIZE {
            return Err(CheckpointIntegrityError::FileTooSmall { size: data.len(), minimum: CHECKPOINT_HEADER_SIZE });
        }
        let magic: [u8; 4] = data[0..4].try_into().expect("slice is exactly 4 bytes");
        if &magic != CHECKPOINT_MAGIC {
            return Err(CheckpointIntegrityError::InvalidMagic { expected: *CHECKPOINT_MAGIC, found: magic });
        }
        let version = u32::from_le_bytes(data[4..8].try_into().expect("slice is exactly 4 bytes"));
        if version > CHECKPOINT_FORMAT_VERSION {
            return Err(CheckpointIntegrityError::UnsupportedVersion { found: version, supported: CHECKPOINT_FORMAT_VERSION });
        }
        let stored_checksum = u32::from_le_bytes(data[8..12].try_into().expect("slice is exactly 4 bytes"));
        let declared_length = u64::from_le_bytes(data[12..20].try_into().expect("slice is exactly 8 bytes"));
        let payload = &data[CHECKPOINT_HEADER_SIZE..];
        if declared_length != payload.len() as u64 {
            return Err(CheckpointIntegrityError::LengthMismatch { declared: declared_length, actual: payload.len() as u64 });
        }
        let computed = crc32fast::hash(payload);
        if computed != stored_checksum {
            return Err(CheckpointIntegrityError::ChecksumMismatch { expected: stored_checksum, computed });
        }
        Ok(payload)
    }
}

/// One node's terminal state at checkpoint time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSnapshot {
    pub status: NodeStatus,
    pub output_fingerprint: Option<Fingerprint>,
    pub retry_attempts: usize,
    /// Combined fingerprint of this target's declared sources at the moment
    /// the snapshot was taken, from [`source_fingerprint`]. Re-checked on
    /// resume so a node whose sources changed on disk since the checkpoint
    /// was written is rebuilt rather than skipped.
    pub source_fingerprint: Fingerprint,
}

/// A full build snapshot: every node that had reached a terminal status
/// (`Success`, `Cached`, or `Failed`) when the checkpoint was taken, plus
/// the graph's [`BuildGraph::identity_digest`] at that time so a checkpoint
/// taken against a different graph shape is rejected outright rather than
/// applied node-by-node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub taken_at: u64,
    pub graph_digest: Fingerprint,
    pub nodes: HashMap<TargetId, NodeSnapshot>,
}

impl Checkpoint {
    pub fn new(taken_at: u64, graph_digest: Fingerprint) -> Self {
        Self { taken_at, graph_digest, nodes: HashMap::new() }
    }

    pub fn record(&mut self, target: TargetId, snapshot: NodeSnapshot) {
        self.nodes.insert(target, snapshot);
    }
}

/// Canonical fingerprint over a target's declared source files' current
/// content, in declaration order, matching the length-prefixed/fixed-width
/// encoding [`crate::action_cache::ActionKey::compute`] uses. A missing
/// source file hashes as a fixed zero sentinel rather than being skipped,
/// so a file reappearing with new content still changes the result.
pub fn source_fingerprint(target: &Target) -> Fingerprint {
    let mut w = CanonicalWriter::new();
    for path in &target.sources {
        w.write_str(&path.to_string_lossy());
        match Fingerprint::of_file(path) {
            Ok(fp) => w.write_bytes(fp.as_bytes()),
            Err(_) => w.write_bytes(&[0u8; 32]),
        }
    }
    Fingerprint::of_bytes(&w.into_bytes())
}

/// What a resumed build should do with each previously-known target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResumeAction {
    /// Checkpoint says this target already finished; scheduler may skip
    /// straight to the recorded status without calling the executor.
    Skip(NodeStatus),
    /// No usable checkpoint entry; build it normally.
    Rebuild,
}

/// Persists and loads [`Checkpoint`]s under a single file path, matching
/// the action cache's temp-write-fsync-rename durability pattern.
pub struct CheckpointStore {
    path: PathBuf,
}

impl CheckpointStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    #[instrument(level = "debug", skip(self, checkpoint))]
    pub fn save(&self, checkpoint: &Checkpoint) -> BuildResult<()> {
        let payload = bincode::serialize(checkpoint).map_err(|e| BuildError::internal(e.to_string()))?;
        let framed = IntegrityWrapper::wrap(&payload);

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| BuildError::io("IO_CREATE_FAILED", &e, parent).wrap("preparing checkpoint directory"))?;
        }
        let tmp_path = self.path.with_extension(format!("tmp-{}", uuid::Uuid::new_v4()));
        let write_result = (|| -> std::io::Result<()> {
            let mut file = std::fs::File::create(&tmp_path)?;
            file.write_all(&framed)?;
            file.sync_all()?;
            Ok(())
        })();
        if let Err(e) = write_result {
            let _ = std::fs::remove_file(&tmp_path);
            return Err(BuildError::io("IO_WRITE_FAILED", &e, &self.path).wrap("writing checkpoint"));
        }
        std::fs::rename(&tmp_path, &self.path)
            .map_err(|e| BuildError::io("IO_WRITE_FAILED", &e, &self.path).wrap("finalizing checkpoint"))?;
        Ok(())
    }

    /// Loads the checkpoint at this path. A missing file is not an error --
    /// it means there is nothing to resume from -- but a present-and-corrupt
    /// file is, since silently discarding it could mask a real problem.
    #[instrument(level = "debug", skip(self))]
    pub fn load(&self) -> BuildResult<Option<Checkpoint>> {
        let bytes = match std::fs::read(&self.path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(BuildError::io("IO_READ_FAILED", &e, &self.path).wrap("loading checkpoint")),
        };
        let payload = IntegrityWrapper::unwrap(&bytes).map_err(|e| {
            BuildError::new(ErrorKind::Cache, "CHECKPOINT_INTEGRITY_FAILED", e.to_string()).with_file(&self.path)
        })?;
        let checkpoint: Checkpoint =
            bincode::deserialize(payload).map_err(|e| BuildError::internal(e.to_string()))?;
        Ok(Some(checkpoint))
    }

    /// Best-effort load used by a resume planner: corruption degrades to
    /// "nothing to resume from" with a warning, rather than failing the
    /// whole build over a stale or damaged checkpoint file.
    pub fn load_or_warn(&self) -> Option<Checkpoint> {
        match self.load() {
            Ok(c) => c,
            Err(e) => {
                warn!(error = %e.message, path = %self.path.display(), "ignoring unreadable checkpoint");
                None
            }
        }
    }
}

/// Decides, for a single target, what a resumed build should do with it
/// given the prior checkpoint. Only `Success`/`Cached` entries are honored;
/// a `Failed` entry still forces a rebuild, since a resumed build always
/// retries work that failed last time.
pub fn resume_action(checkpoint: Option<&Checkpoint>, target: &TargetId) -> ResumeAction {
    let Some(checkpoint) = checkpoint else {
        return ResumeAction::Rebuild;
    };
    match checkpoint.nodes.get(target) {
        Some(snapshot) if matches!(snapshot.status, NodeStatus::Success | NodeStatus::Cached) => {
            ResumeAction::Skip(snapshot.status)
        }
        _ => ResumeAction::Rebuild,
    }
}

/// Applies a loaded checkpoint to a freshly-built graph before the scheduler
/// takes its initial ready-set snapshot: every target the checkpoint says
/// already finished, and whose declared sources still fingerprint the same
/// as when the checkpoint was taken, is forced straight to its recorded
/// terminal status, and its dependents' `pendingDeps` are decremented
/// exactly as if the node had just completed normally, so the scheduler's
/// ready-detection still works unmodified. A target whose sources have
/// drifted is left `Pending` and rebuilds normally instead. Processing in
/// topological order means a dependency is always applied (and its output
/// fingerprint recorded) before its dependents are considered.
///
/// Callers are expected to have already checked `checkpoint.graph_digest`
/// against the current graph's [`BuildGraph::identity_digest`] and to call
/// this only when they match; this function does not re-check it.
pub fn apply(graph: &BuildGraph, checkpoint: &Checkpoint, output_fingerprints: &DashMap<TargetId, Fingerprint>) {
    for target in graph.topo_order() {
        let Some(idx) = graph.index_of(&target) else { continue };
        match resume_action(Some(checkpoint), &target) {
            ResumeAction::Skip(status) => {
                let snapshot = checkpoint
                    .nodes
                    .get(&target)
                    .expect("resume_action only returns Skip for a target present in the checkpoint");
                let current_source_fingerprint = graph.with_node(idx, |n| source_fingerprint(&n.target));
                if current_source_fingerprint != Some(snapshot.source_fingerprint) {
                    continue;
                }
                graph.with_node(idx, |n| n.force_status(status));
                if let Some(fp) = snapshot.output_fingerprint {
                    output_fingerprints.insert(target.clone(), fp);
                }
                for dependent in graph.dependents_of(idx) {
                    graph.with_node(dependent, |n| n.decrement_pending_deps());
                }
            }
            ResumeAction::Rebuild => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path().join("checkpoint.bin"));
        let mut checkpoint = Checkpoint::new(42, Fingerprint::empty());
        checkpoint.record(
            TargetId::new("//p:a"),
            NodeSnapshot {
                status: NodeStatus::Success,
                output_fingerprint: Some(Fingerprint::empty()),
                retry_attempts: 0,
                source_fingerprint: Fingerprint::empty(),
            },
        );
        store.save(&checkpoint).unwrap();

        let loaded = store.load().unwrap().unwrap();
        assert_eq!(loaded.taken_at, 42);
        assert_eq!(loaded.nodes[&TargetId::new("//p:a")].status, NodeStatus::Success);
    }

    #[test]
    fn missing_file_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path().join("nope.bin"));
        assert!(store.load().unwrap().is_none());
    }

    #[test]
    fn corrupted_checksum_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path().join("checkpoint.bin"));
        store.save(&Checkpoint::new(1, Fingerprint::empty())).unwrap();

        let mut bytes = std::fs::read(dir.path().join("checkpoint.bin")).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        std::fs::write(dir.path().join("checkpoint.bin"), bytes).unwrap();

        let err = store.load().unwrap_err();
        assert_eq!(err.code, "CHECKPOINT_INTEGRITY_FAILED");
    }

    #[test]
    fn resume_skips_success_and_rebuilds_failed() {
        let mut checkpoint = Checkpoint::new(0, Fingerprint::empty());
        checkpoint.record(
            TargetId::new("//p:a"),
            NodeSnapshot {
                status: NodeStatus::Success,
                output_fingerprint: None,
                retry_attempts: 0,
                source_fingerprint: Fingerprint::empty(),
            },
        );
        checkpoint.record(
            TargetId::new("//p:b"),
            NodeSnapshot {
                status: NodeStatus::Failed,
                output_fingerprint: None,
                retry_attempts: 3,
                source_fingerprint: Fingerprint::empty(),
            },
        );

        assert_eq!(resume_action(Some(&checkpoint), &TargetId::new("//p:a")), ResumeAction::Skip(NodeStatus::Success));
        assert_eq!(resume_action(Some(&checkpoint), &TargetId::new("//p:b")), ResumeAction::Rebuild);
        assert_eq!(resume_action(Some(&checkpoint), &TargetId::new("//p:c")), ResumeAction::Rebuild);
        assert_eq!(resume_action(None, &TargetId::new("//p:a")), ResumeAction::Rebuild);
    }

    #[test]
    fn apply_unblocks_dependent_of_previously_completed_node() {
        use crate::graph::TargetType;

        let target_a = Target::new("//p:a", TargetType::Library, "rust");
        let graph = BuildGraph::build(vec![
            target_a.clone(),
            Target::new("//p:b", TargetType::Library, "rust").with_deps([TargetId::new("//p:a")]),
        ])
        .unwrap();
        let b_idx = graph.index_of(&TargetId::new("//p:b")).unwrap();
        assert_eq!(graph.with_node(b_idx, |n| n.pending_deps()), Some(1));

        let mut checkpoint = Checkpoint::new(0, Fingerprint::empty());
        checkpoint.record(
            TargetId::new("//p:a"),
            NodeSnapshot {
                status: NodeStatus::Success,
                output_fingerprint: Some(Fingerprint::empty()),
                retry_attempts: 0,
                source_fingerprint: source_fingerprint(&target_a),
            },
        );
        let output_fps = DashMap::new();
        apply(&graph, &checkpoint, &output_fps);

        assert_eq!(graph.with_node(b_idx, |n| n.pending_deps()), Some(0));
        assert!(output_fps.contains_key(&TargetId::new("//p:a")));
    }

    #[test]
    fn apply_rebuilds_when_a_source_file_changed_since_the_checkpoint() {
        use crate::graph::TargetType;

        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("a.rs");
        std::fs::write(&source, b"fn main() {}").unwrap();
        let target_a = Target::new("//p:a", TargetType::Library, "rust").with_sources([source.clone()]);
        let graph = BuildGraph::build(vec![target_a.clone()]).unwrap();
        let idx = graph.index_of(&TargetId::new("//p:a")).unwrap();

        let mut checkpoint = Checkpoint::new(0, Fingerprint::empty());
        checkpoint.record(
            TargetId::new("//p:a"),
            NodeSnapshot {
                status: NodeStatus::Success,
                output_fingerprint: Some(Fingerprint::empty()),
                retry_attempts: 0,
                source_fingerprint: source_fingerprint(&target_a),
            },
        );

        std::fs::write(&source, b"fn main() { changed(); }").unwrap();

        let output_fps = DashMap::new();
        apply(&graph, &checkpoint, &output_fps);

        assert_eq!(graph.with_node(idx, |n| n.status()), Some(NodeStatus::Pending));
        assert!(!output_fps.contains_key(&TargetId::new("//p:a")));
    }
}
