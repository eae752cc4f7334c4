//! The contract the core calls into for anything language-specific. The
//! core never parses language syntax itself (beyond the optional
//! [`crate::dep_analyzer::ASTParser`] for symbol-level incrementality); all
//! compiler/toolchain knowledge lives behind this trait.

use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::config::WorkspaceConfig;
use crate::error::BuildResult;
use crate::graph::Target;

/// One resolved `#include`/`use`/`import` reference discovered by
/// [`LanguageHandler::analyze_imports`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Import {
    pub file: PathBuf,
    pub symbol: String,
}

/// What the executor should run and how to interpret its result.
#[derive(Debug, Clone)]
pub struct ActionPlan {
    pub program: String,
    pub args: Vec<String>,
    pub declared_inputs: Vec<PathBuf>,
    pub declared_outputs: Vec<PathBuf>,
    pub env: BTreeMap<String, String>,
}

/// Per-language toolchain adapter. Implementations are registered into a
/// [`crate::services::BuildServices`] keyed by `Target.language`, replacing
/// the process-wide singleton registry pattern.
pub trait LanguageHandler: Send + Sync {
    fn plan(&self, target: &Target, config: &WorkspaceConfig) -> BuildResult<ActionPlan>;

    fn analyze_imports(&self, sources: &[PathBuf]) -> BuildResult<Vec<Import>>;

    fn get_outputs(&self, target: &Target, config: &WorkspaceConfig) -> BuildResult<Vec<PathBuf>>;
}

/// A handler for tests and examples: runs a fixed no-op argv and declares no
/// outputs of its own, since it has no real toolchain behind it to produce
/// any.
pub struct EchoLanguageHandler;

impl LanguageHandler for EchoLanguageHandler {
    fn plan(&self, target: &Target, _config: &WorkspaceConfig) -> BuildResult<ActionPlan> {
        Ok(ActionPlan {
            program: "true".to_string(),
            args: Vec::new(),
            declared_inputs: target.sources.clone(),
            declared_outputs: Vec::new(),
            env: BTreeMap::new(),
        })
    }

    fn analyze_imports(&self, _sources: &[PathBuf]) -> BuildResult<Vec<Import>> {
        Ok(Vec::new())
    }

    fn get_outputs(&self, _target: &Target, _config: &WorkspaceConfig) -> BuildResult<Vec<PathBuf>> {
        Ok(Vec::new())
    }
}

