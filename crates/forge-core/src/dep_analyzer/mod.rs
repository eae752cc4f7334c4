//! Incremental dependency analysis: file-level fingerprinting plus, where a
//! parser is registered for the language, symbol-level AST diffing.

mod file_analyzer;
mod invalidator;
mod types;
mod watcher;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, warn};

use crate::error::BuildResult;
use crate::fingerprint::Fingerprint;

pub use file_analyzer::{FileFingerprints, IncludeResolver};
pub use invalidator::{diff_symbols, propagate, DirtySet, SymbolGraph};
pub use types::{AstParser, AstSymbol, FileAst, SymbolKind};
pub use watcher::{FileChangeKind, FileEvent, FileWatcher};

/// Owns the prior-run state (`FileAst` per file, file fingerprints) and
/// produces a [`DirtySet`] describing what must rebuild.
pub struct DepAnalyzer {
    parsers: HashMap<String, Arc<dyn AstParser>>,
    fingerprints: FileFingerprints,
    resolver: IncludeResolver,
    previous_asts: DashMap<PathBuf, FileAst>,
}

impl DepAnalyzer {
    pub fn new(parsers: HashMap<String, Arc<dyn AstParser>>, search_paths: Vec<PathBuf>) -> Self {
        Self {
            parsers,
            fingerprints: FileFingerprints::new(),
            resolver: IncludeResolver::new(search_paths),
            previous_asts: DashMap::new(),
        }
    }

    /// Runs one invalidation pass over `files` (a language tag per path, so
    /// the right parser can be selected). Files with no registered parser,
    /// or whose parse fails, degrade to file-level invalidation.
    #[tracing::instrument(level = "debug", skip(self, files))]
    pub fn analyze(&self, files: &[(PathBuf, String)], parsed_at: u64) -> BuildResult<DirtySet> {
        let mut changed_paths = Vec::new();
        for (path, _lang) in files {
            if self.fingerprints.refresh(path)? {
                changed_paths.push(path.clone());
            }
        }

        let mut current_asts: HashMap<PathBuf, FileAst> = HashMap::new();
        let mut dirty = DirtySet::default();

        for (path, lang) in files {
            let parser = self.parsers.get(lang);
            match parser {
                Some(parser) => match parser.parse_file(path, parsed_at) {
                    Ok(new_ast) => {
                        if changed_paths.contains(path) {
                            if let Some(old_ast) = self.previous_asts.get(path) {
                                let dirty_names = diff_symbols(&old_ast, &new_ast);
                                for name in dirty_names {
                                    dirty.dirty_symbols.insert((path.clone(), name));
                                }
                            } else {
                                dirty.dirty_files.insert(path.clone());
                            }
                        }
                        self.previous_asts.insert(path.clone(), new_ast.clone());
                        current_asts.insert(path.clone(), new_ast);
                    }
                    Err(e) => {
                        warn!(path = %path.display(), error = %e.message, "parse failed, degrading to file-level invalidation");
                        if changed_paths.contains(path) {
                            dirty.dirty_files.insert(path.clone());
                        }
                    }
                },
                None => {
                    if changed_paths.contains(path) {
                        dirty.dirty_files.insert(path.clone());
                    }
                }
            }
        }

        let includes_by_file: Vec<(PathBuf, Vec<String>)> =
            current_asts.iter().map(|(p, ast)| (p.clone(), ast.includes.clone())).collect();
        let file_dependents = file_analyzer::build_include_dependents(&includes_by_file, &self.resolver);
        let graph = SymbolGraph::build(&current_asts, file_dependents);

        debug!(changed = changed_paths.len(), dirty_files = dirty.dirty_files.len(), "invalidation pass computed");
        Ok(propagate(dirty, &graph))
    }

    pub fn file_fingerprint(&self, path: &Path) -> Option<Fingerprint> {
        self.fingerprints.get(path)
    }

    pub fn forget(&self, path: &Path) {
        self.fingerprints.forget(path);
        self.previous_asts.remove(path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    struct StubParser;

    impl AstParser for StubParser {
        fn parse_file(&self, path: &Path, parsed_at: u64) -> BuildResult<FileAst> {
            let content = std::fs::read_to_string(path).unwrap_or_default();
            self.parse_content(&content, path, parsed_at)
        }

        fn parse_content(&self, content: &str, path: &Path, parsed_at: u64) -> BuildResult<FileAst> {
            Ok(FileAst {
                file_path: path.to_path_buf(),
                file_hash: Fingerprint::of_bytes(content.as_bytes()),
                parsed_at,
                symbols: vec![AstSymbol {
                    name: "main".to_string(),
                    kind: SymbolKind::Function,
                    start_line: 1,
                    end_line: 1,
                    signature: "fn main()".to_string(),
                    content_hash: Fingerprint::of_bytes(content.as_bytes()),
                    dependencies: BTreeSet::new(),
                    used_types: BTreeSet::new(),
                }],
                includes: Vec::new(),
            })
        }
    }

    #[test]
    fn unchanged_file_produces_no_dirty_entries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.rs");
        std::fs::write(&path, b"fn main() {}").unwrap();

        let mut parsers: HashMap<String, Arc<dyn AstParser>> = HashMap::new();
        parsers.insert("rust".to_string(), Arc::new(StubParser));
        let analyzer = DepAnalyzer::new(parsers, vec![dir.path().to_path_buf()]);

        analyzer.analyze(&[(path.clone(), "rust".to_string())], 0).unwrap();
        let second = analyzer.analyze(&[(path.clone(), "rust".to_string())], 1).unwrap();
        assert!(second.dirty_files.is_empty());
        assert!(second.dirty_symbols.is_empty());
    }

    #[test]
    fn changed_file_marks_symbol_dirty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.rs");
        std::fs::write(&path, b"fn main() {}").unwrap();

        let mut parsers: HashMap<String, Arc<dyn AstParser>> = HashMap::new();
        parsers.insert("rust".to_string(), Arc::new(StubParser));
        let analyzer = DepAnalyzer::new(parsers, vec![]);

        analyzer.analyze(&[(path.clone(), "rust".to_string())], 0).unwrap();
        std::fs::write(&path, b"fn main() { 1; }").unwrap();
        let second = analyzer.analyze(&[(path.clone(), "rust".to_string())], 1).unwrap();
        assert!(second.dirty_symbols.contains(&(path, "main".to_string())));
    }

    #[test]
    fn file_with_no_registered_parser_falls_back_to_file_level() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.py");
        std::fs::write(&path, b"print(1)").unwrap();

        let analyzer = DepAnalyzer::new(HashMap::new(), vec![]);
        analyzer.analyze(&[(path.clone(), "python".to_string())], 0).unwrap();
        std::fs::write(&path, b"print(2)").unwrap();
        let second = analyzer.analyze(&[(path.clone(), "python".to_string())], 1).unwrap();
        assert!(second.dirty_files.contains(&path));
    }
}
