//! `BuildServices`: the single composition root that owns every trait-object
//! registry this crate needs, in place of the process-wide singleton
//! registries the pattern this replaces would otherwise reach for. One
//! instance is built per run and threaded through explicitly.

use std::collections::HashMap;
use std::sync::Arc;

use crate::dep_analyzer::AstParser;
use crate::language_handler::LanguageHandler;

/// Owns the per-language adapters a run needs, keyed by `Target.language`.
/// Both registries are populated once at startup and are read-only for the
/// remainder of the run, so lookups need no locking beyond the `HashMap`
/// itself.
#[derive(Default)]
pub struct BuildServices {
    language_handlers: HashMap<String, Arc<dyn LanguageHandler>>,
    ast_parsers: HashMap<String, Arc<dyn AstParser>>,
}

impl BuildServices {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_language_handler(&mut self, language: impl Into<String>, handler: Arc<dyn LanguageHandler>) -> &mut Self {
        self.language_handlers.insert(language.into(), handler);
        self
    }

    pub fn register_ast_parser(&mut self, language: impl Into<String>, parser: Arc<dyn AstParser>) -> &mut Self {
        self.ast_parsers.insert(language.into(), parser);
        self
    }

    pub fn language_handler(&self, language: &str) -> Option<Arc<dyn LanguageHandler>> {
        self.language_handlers.get(language).cloned()
    }

    pub fn ast_parsers(&self) -> HashMap<String, Arc<dyn AstParser>> {
        self.ast_parsers.clone()
    }

    pub fn languages(&self) -> impl Iterator<Item = &str> {
        self.language_handlers.keys().map(String::as_str)
    }
}
