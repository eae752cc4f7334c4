//! Fixtures for exercising [`forge_core`] without a real toolchain behind
//! every target: a disposable workspace directory plus a [`LanguageHandler`]
//! that writes scripted output content through `sh -c`, the same way
//! `forge-core`'s own executor tests stand up a fake action.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use tempfile::TempDir;

use forge_core::config::WorkspaceConfig;
use forge_core::error::BuildResult;
use forge_core::graph::Target;
use forge_core::language_handler::{ActionPlan, Import, LanguageHandler};

/// A disposable workspace: a tempdir plus the [`WorkspaceConfig`] pointed at
/// it. Builder methods consume and return `Self` so a fixture reads as one
/// expression; call [`FixtureWorkspace::into_parts`] to get the pieces
/// [`forge_core::run`] needs.
pub struct FixtureWorkspace {
    dir: TempDir,
    config: WorkspaceConfig,
}

impl FixtureWorkspace {
    #[must_use]
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("fixture tempdir");
        let mut config = WorkspaceConfig::new(dir.path(), Vec::new());
        config.options.cache_dir = dir.path().join("cache");
        // Checkpointing is off by default: most fixtures build once and
        // assert on the outcome, and an on-disk checkpoint from one test
        // run has no business affecting another test's tempdir-scoped run.
        config.checkpointing.enabled = false;
        Self { dir, config }
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    /// Writes `content` to `relative` under the workspace root, creating
    /// parent directories as needed, and returns the absolute path.
    pub fn write_source(&self, relative: impl AsRef<Path>, content: &str) -> PathBuf {
        let path = self.dir.path().join(relative.as_ref());
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).expect("fixture source parent directories");
        }
        std::fs::write(&path, content).expect("fixture source write");
        path
    }

    #[must_use]
    pub fn add_target(mut self, target: Target) -> Self {
        self.config.targets.push(target);
        self
    }

    #[must_use]
    pub fn checkpointing_enabled(mut self, enabled: bool) -> Self {
        self.config.checkpointing.enabled = enabled;
        self
    }

    #[must_use]
    pub fn max_jobs(mut self, jobs: usize) -> Self {
        self.config.options.max_jobs = jobs;
        self
    }

    /// Hands back the `WorkspaceConfig` alongside the `TempDir` guard that
    /// keeps the workspace root alive for as long as the caller needs it.
    pub fn into_parts(self) -> (TempDir, WorkspaceConfig) {
        (self.dir, self.config)
    }
}

impl Default for FixtureWorkspace {
    fn default() -> Self {
        Self::new()
    }
}

/// A [`LanguageHandler`] that plans a `sh -c` invocation writing fixed or
/// per-target content to `target.output_path`, instead of invoking a real
/// compiler. Use [`constant_output`] when every target should produce the
/// same bytes, or [`ScriptedLanguageHandler::new`] to derive content (e.g.
/// from a target's sources) at plan time.
pub struct ScriptedLanguageHandler<F> {
    content: F,
}

impl<F> ScriptedLanguageHandler<F>
where
    F: Fn(&Target) -> String + Send + Sync,
{
    pub fn new(content: F) -> Self {
        Self { content }
    }
}

/// Builds a [`ScriptedLanguageHandler`] where every planned target writes
/// the same fixed `content`.
#[must_use]
pub fn constant_output(content: impl Into<String>) -> ScriptedLanguageHandler<impl Fn(&Target) -> String + Send + Sync> {
    let content = content.into();
    ScriptedLanguageHandler::new(move |_target: &Target| content.clone())
}

impl<F> LanguageHandler for ScriptedLanguageHandler<F>
where
    F: Fn(&Target) -> String + Send + Sync,
{
    fn plan(&self, target: &Target, _config: &WorkspaceConfig) -> BuildResult<ActionPlan> {
        let body = (self.content)(target);
        let script = format!("printf '%s' {} > {}", shell_quote(&body), target.output_path.display());
        Ok(ActionPlan {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), script],
            declared_inputs: target.sources.clone(),
            declared_outputs: vec![target.output_path.clone()],
            env: BTreeMap::new(),
        })
    }

    fn analyze_imports(&self, _sources: &[PathBuf]) -> BuildResult<Vec<Import>> {
        Ok(Vec::new())
    }

    fn get_outputs(&self, target: &Target, _config: &WorkspaceConfig) -> BuildResult<Vec<PathBuf>> {
        Ok(vec![target.output_path.clone()])
    }
}

fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use forge_core::graph::TargetType;
    use forge_core::services::BuildServices;

    #[test]
    fn fixture_workspace_runs_a_scripted_target_to_completion() {
        let fixture = FixtureWorkspace::new().add_target(
            Target::new("//p:a", TargetType::Library, "rust").with_output_path("a.out"),
        );
        let (_dir, config) = fixture.into_parts();

        let mut services = BuildServices::new();
        services.register_language_handler("rust", Arc::new(constant_output("built")));

        let outcome = forge_core::run(config, services, 0).unwrap();
        assert_eq!(outcome.summary.failed, 0);
        assert_eq!(outcome.summary.built, 1);
    }

    #[test]
    fn shell_quote_escapes_embedded_single_quotes() {
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }
}
