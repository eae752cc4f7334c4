//! File-level fingerprinting and `#include`/`use`/`import` resolution
//! against configured search paths.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use dashmap::DashMap;

use crate::error::BuildResult;
use crate::fingerprint::Fingerprint;

/// Computes and caches per-file content fingerprints for the file-level
/// layer of analysis (used even for languages with no [`super::AstParser`]).
#[derive(Default)]
pub struct FileFingerprints {
    known: DashMap<PathBuf, Fingerprint>,
}

impl FileFingerprints {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fingerprints `path`, returning whether it differs from the
    /// previously recorded fingerprint (a fresh file counts as changed).
    pub fn refresh(&self, path: &Path) -> BuildResult<bool> {
        let current = Fingerprint::of_file(path)?;
        let changed = match self.known.get(path) {
            Some(prev) => *prev != current,
            None => true,
        };
        self.known.insert(path.to_path_buf(), current);
        Ok(changed)
    }

    pub fn get(&self, path: &Path) -> Option<Fingerprint> {
        self.known.get(path).map(|r| *r.value())
    }

    pub fn forget(&self, path: &Path) {
        self.known.remove(path);
    }
}

/// Resolves raw include strings (as emitted by
/// [`crate::language_handler::LanguageHandler::analyze_imports`]) against a
/// fixed list of search roots. A reference that resolves to nothing under
/// any root is treated as external/out-of-graph, not an error.
pub struct IncludeResolver {
    search_paths: Vec<PathBuf>,
    cache: DashMap<(PathBuf, String), Option<PathBuf>>,
}

impl IncludeResolver {
    pub fn new(search_paths: Vec<PathBuf>) -> Self {
        Self {
            search_paths,
            cache: DashMap::new(),
        }
    }

    /// Resolves `include` as referenced from `from_file`. Checks the
    /// including file's own directory first, then each search path in
    /// order. Returns `None` for an unresolved (external/system) reference.
    pub fn resolve(&self, from_file: &Path, include: &str) -> Option<PathBuf> {
        let key = (from_file.to_path_buf(), include.to_string());
        if let Some(cached) = self.cache.get(&key) {
            return cached.clone();
        }

        let mut candidates = Vec::new();
        if let Some(dir) = from_file.parent() {
            candidates.push(dir.join(include));
        }
        for root in &self.search_paths {
            candidates.push(root.join(include));
        }

        let resolved = candidates.into_iter().find(|p| p.is_file());
        self.cache.insert(key, resolved.clone());
        resolved
    }
}

/// Reverse-of-includes map: for each resolved file, which files include it.
/// Used by the invalidator to propagate a changed file's dirtiness to
/// everything that transitively includes it.
pub fn build_include_dependents(
    includes_by_file: &[(PathBuf, Vec<String>)],
    resolver: &IncludeResolver,
) -> std::collections::HashMap<PathBuf, BTreeSet<PathBuf>> {
    let mut dependents: std::collections::HashMap<PathBuf, BTreeSet<PathBuf>> = std::collections::HashMap::new();
    for (file, includes) in includes_by_file {
        for include in includes {
            if let Some(resolved) = resolver.resolve(file, include) {
                dependents.entry(resolved).or_default().insert(file.clone());
            }
        }
    }
    dependents
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refresh_reports_change_on_first_sight_and_on_modification() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.rs");
        std::fs::write(&path, b"fn a() {}").unwrap();

        let tracker = FileFingerprints::new();
        assert!(tracker.refresh(&path).unwrap());
        assert!(!tracker.refresh(&path).unwrap());

        std::fs::write(&path, b"fn a() { 1 }").unwrap();
        assert!(tracker.refresh(&path).unwrap());
    }

    #[test]
    fn resolver_prefers_including_files_own_directory() {
        let dir = tempfile::tempdir().unwrap();
        let sub = dir.path().join("pkg");
        std::fs::create_dir_all(&sub).unwrap();
        std::fs::write(sub.join("helper.rs"), b"").unwrap();

        let resolver = IncludeResolver::new(vec![dir.path().to_path_buf()]);
        let from = sub.join("main.rs");
        let resolved = resolver.resolve(&from, "helper.rs").unwrap();
        assert_eq!(resolved, sub.join("helper.rs"));
    }

    #[test]
    fn unresolvable_include_is_out_of_graph() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = IncludeResolver::new(vec![dir.path().to_path_buf()]);
        assert!(resolver.resolve(&dir.path().join("main.rs"), "std::io").is_none());
    }
}
