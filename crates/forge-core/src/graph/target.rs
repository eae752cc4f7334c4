//! [`TargetId`] and the immutable [`Target`] value it identifies.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Stable identifier of the form `//package:name`.
///
/// Comparison is bytewise; hashing uses FNV-1a rather than the default
/// SipHash, since target IDs are looked up at very high frequency during
/// scheduling and don't need DoS-resistant hashing.
#[derive(Clone, Eq, Serialize, Deserialize)]
pub struct TargetId(Arc<str>);

impl TargetId {
    pub fn new(raw: impl Into<Arc<str>>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl PartialEq for TargetId {
    fn eq(&self, other: &Self) -> bool {
        self.0.as_bytes() == other.0.as_bytes()
    }
}

impl PartialOrd for TargetId {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TargetId {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.as_bytes().cmp(other.0.as_bytes())
    }
}

impl Hash for TargetId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        // FNV-1a, 64-bit.
        let mut hash = 0xcbf29ce484222325u64;
        for &byte in self.0.as_bytes() {
            hash ^= u64::from(byte);
            hash = hash.wrapping_mul(0x100000001b3);
        }
        state.write_u64(hash);
    }
}

impl fmt::Debug for TargetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TargetId({})", self.0)
    }
}

impl fmt::Display for TargetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for TargetId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for TargetId {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

/// What kind of artifact a [`Target`] produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TargetType {
    Executable,
    Library,
    Test,
    Custom,
}

/// Immutable declaration of one buildable unit. `deps` names other targets
/// by [`TargetId`]; the graph resolves those references at construction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    pub id: TargetId,
    pub target_type: TargetType,
    pub language: String,
    pub sources: Vec<PathBuf>,
    pub deps: BTreeSet<TargetId>,
    pub flags: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub output_path: PathBuf,
    pub lang_config: BTreeMap<String, String>,
}

impl Target {
    pub fn new(id: impl Into<TargetId>, target_type: TargetType, language: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            target_type,
            language: language.into(),
            sources: Vec::new(),
            deps: BTreeSet::new(),
            flags: Vec::new(),
            env: BTreeMap::new(),
            output_path: PathBuf::new(),
            lang_config: BTreeMap::new(),
        }
    }

    pub fn with_sources(mut self, sources: impl IntoIterator<Item = PathBuf>) -> Self {
        self.sources = sources.into_iter().collect();
        self
    }

    pub fn with_deps(mut self, deps: impl IntoIterator<Item = TargetId>) -> Self {
        self.deps = deps.into_iter().collect();
        self
    }

    pub fn with_output_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.output_path = path.into();
        self
    }
}
