//! Diffing and BFS dirty-propagation over the symbol graph.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};

use super::types::FileAst;

/// Result of one invalidation pass.
#[derive(Debug, Default, Clone)]
pub struct DirtySet {
    pub dirty_files: BTreeSet<PathBuf>,
    /// `(file, symbol name)` pairs marked dirty by the AST layer. Empty for
    /// files that only have file-level tracking (no parser, or parse
    /// failure -- see [`DirtySet::whole_file`]).
    pub dirty_symbols: BTreeSet<(PathBuf, String)>,
}

impl DirtySet {
    pub fn whole_file(path: PathBuf) -> Self {
        let mut s = Self::default();
        s.dirty_files.insert(path);
        s
    }

    fn merge(&mut self, other: DirtySet) {
        self.dirty_files.extend(other.dirty_files);
        self.dirty_symbols.extend(other.dirty_symbols);
    }
}

/// Compares old and new parses of the same file and returns the names of
/// symbols that are new, removed, or whose `content_hash` changed.
pub fn diff_symbols(old: &FileAst, new: &FileAst) -> BTreeSet<String> {
    let old_by_name: HashMap<&str, &super::types::AstSymbol> =
        old.symbols.iter().map(|s| (s.name.as_str(), s)).collect();
    let new_by_name: HashMap<&str, &super::types::AstSymbol> =
        new.symbols.iter().map(|s| (s.name.as_str(), s)).collect();

    let mut dirty = BTreeSet::new();
    for (name, new_symbol) in &new_by_name {
        match old_by_name.get(name) {
            Some(old_symbol) if old_symbol.content_hash == new_symbol.content_hash => {}
            _ => {
                dirty.insert((*name).to_string());
            }
        }
    }
    for name in old_by_name.keys() {
        if !new_by_name.contains_key(name) {
            dirty.insert((*name).to_string());
        }
    }
    dirty
}

/// The reverse dependency graph the BFS propagates over: both the
/// file-level include-dependents and the symbol-level dependents (a symbol
/// S depends on T means T's dependents include S).
pub struct SymbolGraph {
    pub file_dependents: HashMap<PathBuf, BTreeSet<PathBuf>>,
    pub symbol_dependents: HashMap<(PathBuf, String), BTreeSet<(PathBuf, String)>>,
}

impl SymbolGraph {
    /// Builds the dependents map from a set of currently-parsed files. A
    /// symbol's `dependencies` names are resolved first against its own
    /// file's symbol table, then against every file it (transitively, via
    /// one hop) includes -- good enough for the common case of same-module
    /// and direct-include references without requiring full cross-file
    /// type resolution.
    pub fn build(files: &HashMap<PathBuf, FileAst>, file_dependents: HashMap<PathBuf, BTreeSet<PathBuf>>) -> Self {
        let mut symbol_dependents: HashMap<(PathBuf, String), BTreeSet<(PathBuf, String)>> = HashMap::new();

        for (path, ast) in files {
            let local: HashSet<&str> = ast.symbols.iter().map(|s| s.name.as_str()).collect();
            for symbol in &ast.symbols {
                // Cross-file references (not resolvable against this file's
                // own symbol table) fall back to file-level dirtying via
                // `file_dependents` in `propagate`.
                for dep_name in &symbol.dependencies {
                    if local.contains(dep_name.as_str()) {
                        symbol_dependents
                            .entry((path.clone(), dep_name.clone()))
                            .or_default()
                            .insert((path.clone(), symbol.name.clone()));
                    }
                }
            }
        }

        Self { file_dependents, symbol_dependents }
    }
}

/// BFS-propagates dirtiness from `changed` files/symbols across `graph`,
/// returning the full transitive dirty set. A whole-file change marks every
/// file that (transitively) includes it dirty; a symbol-level change also
/// marks its symbol-level dependents, falling back to the containing file's
/// include-dependents so cross-file symbol references are never missed.
pub fn propagate(changed: DirtySet, graph: &SymbolGraph) -> DirtySet {
    let mut result = changed.clone();
    let mut file_queue: VecDeque<PathBuf> = changed.dirty_files.iter().cloned().collect();
    let mut symbol_queue: VecDeque<(PathBuf, String)> = changed.dirty_symbols.iter().cloned().collect();

    for (file, _) in &changed.dirty_symbols {
        file_queue.push_back(file.clone());
    }

    let mut visited_files: HashSet<PathBuf> = result.dirty_files.clone();
    let mut visited_symbols: HashSet<(PathBuf, String)> = result.dirty_symbols.clone();

    while !file_queue.is_empty() || !symbol_queue.is_empty() {
        while let Some(file) = file_queue.pop_front() {
            if let Some(dependents) = graph.file_dependents.get(&file) {
                for dependent in dependents {
                    if visited_files.insert(dependent.clone()) {
                        result.dirty_files.insert(dependent.clone());
                        file_queue.push_back(dependent.clone());
                    }
                }
            }
        }
        while let Some(symbol) = symbol_queue.pop_front() {
            if let Some(dependents) = graph.symbol_dependents.get(&symbol) {
                for dependent in dependents.clone() {
                    if visited_symbols.insert(dependent.clone()) {
                        result.dirty_symbols.insert(dependent.clone());
                        symbol_queue.push_back(dependent);
                    }
                }
            }
        }
    }
    result
}

pub fn merge_all(sets: impl IntoIterator<Item = DirtySet>) -> DirtySet {
    let mut out = DirtySet::default();
    for s in sets {
        out.merge(s);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dep_analyzer::types::{AstSymbol, SymbolKind};
    use crate::fingerprint::Fingerprint;

    fn symbol(name: &str, hash: &[u8], deps: &[&str]) -> AstSymbol {
        AstSymbol {
            name: name.to_string(),
            kind: SymbolKind::Function,
            start_line: 1,
            end_line: 2,
            signature: format!("fn {name}()"),
            content_hash: Fingerprint::of_bytes(hash),
            dependencies: deps.iter().map(|s| s.to_string()).collect(),
            used_types: BTreeSet::new(),
        }
    }

    fn ast(path: &str, symbols: Vec<AstSymbol>) -> FileAst {
        FileAst {
            file_path: PathBuf::from(path),
            file_hash: Fingerprint::of_bytes(path.as_bytes()),
            parsed_at: 0,
            symbols,
            includes: Vec::new(),
        }
    }

    #[test]
    fn diff_detects_changed_new_and_removed_symbols() {
        let old = ast("a.rs", vec![symbol("f", b"v1", &[]), symbol("g", b"x", &[])]);
        let new = ast("a.rs", vec![symbol("f", b"v2", &[]), symbol("h", b"x", &[])]);
        let dirty = diff_symbols(&old, &new);
        assert_eq!(dirty, BTreeSet::from(["f".to_string(), "g".to_string(), "h".to_string()]));
    }

    #[test]
    fn unchanged_symbols_are_not_dirty() {
        let old = ast("a.rs", vec![symbol("f", b"same", &[])]);
        let new = ast("a.rs", vec![symbol("f", b"same", &[])]);
        assert!(diff_symbols(&old, &new).is_empty());
    }

    #[test]
    fn propagation_follows_symbol_dependents_within_a_file() {
        let path = PathBuf::from("a.rs");
        let mut files = HashMap::new();
        files.insert(path.clone(), ast("a.rs", vec![symbol("base", b"1", &[]), symbol("user", b"2", &["base"])]));
        let graph = SymbolGraph::build(&files, HashMap::new());

        let changed = DirtySet {
            dirty_files: BTreeSet::new(),
            dirty_symbols: BTreeSet::from([(path.clone(), "base".to_string())]),
        };
        let result = propagate(changed, &graph);
        assert!(result.dirty_symbols.contains(&(path, "user".to_string())));
    }

    #[test]
    fn propagation_follows_file_include_chain() {
        let mut file_dependents = HashMap::new();
        file_dependents.insert(PathBuf::from("a.rs"), BTreeSet::from([PathBuf::from("b.rs")]));
        file_dependents.insert(PathBuf::from("b.rs"), BTreeSet::from([PathBuf::from("c.rs")]));
        let graph = SymbolGraph { file_dependents, symbol_dependents: HashMap::new() };

        let changed = DirtySet::whole_file(PathBuf::from("a.rs"));
        let result = propagate(changed, &graph);
        assert!(result.dirty_files.contains(&PathBuf::from("b.rs")));
        assert!(result.dirty_files.contains(&PathBuf::from("c.rs")));
    }
}
