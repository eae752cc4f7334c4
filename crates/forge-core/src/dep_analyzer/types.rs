//! Shared value types for symbol-level incremental analysis.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::BuildResult;
use crate::fingerprint::Fingerprint;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SymbolKind {
    Class,
    Struct,
    Function,
    Method,
    Namespace,
    Module,
    Other,
}

/// One named, source-range-addressable unit inside a file. `content_hash`
/// covers exactly `[start_line, end_line]` after comment stripping, so
/// reformatting a comment never marks the symbol dirty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AstSymbol {
    pub name: String,
    pub kind: SymbolKind,
    pub start_line: u32,
    pub end_line: u32,
    pub signature: String,
    pub content_hash: Fingerprint,
    pub dependencies: BTreeSet<String>,
    pub used_types: BTreeSet<String>,
}

/// Parse result for one source file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileAst {
    pub file_path: PathBuf,
    pub file_hash: Fingerprint,
    /// Seconds since Unix epoch. Supplied by the caller rather than read
    /// from the clock here, so parsing stays a pure function of its input.
    pub parsed_at: u64,
    pub symbols: Vec<AstSymbol>,
    pub includes: Vec<String>,
}

/// Pluggable per-language parser. Implementations MUST be deterministic:
/// identical bytes produce an identical `FileAst` (up to symbol ordering).
/// A parse failure is never fatal to the build -- callers degrade to
/// file-level invalidation for that file.
pub trait AstParser: Send + Sync {
    fn parse_file(&self, path: &Path, parsed_at: u64) -> BuildResult<FileAst>;

    fn parse_content(&self, content: &str, path: &Path, parsed_at: u64) -> BuildResult<FileAst>;
}
