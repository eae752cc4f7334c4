//! Literal end-to-end scenarios against [`forge_core::run_with_events`]: a
//! real worker pool, a real on-disk content store and action cache, and a
//! scripted [`forge_testing::ScriptedLanguageHandler`] standing in for a
//! compiler.

use std::sync::Arc;

use forge_core::config::WorkspaceConfig;
use forge_core::events::Event;
use forge_core::graph::{BuildGraph, Target, TargetId, TargetType};
use forge_core::services::BuildServices;
use forge_testing::{constant_output, FixtureWorkspace};

fn target(id: &str, source: &str, deps: &[&str]) -> Target {
    Target::new(id, TargetType::Library, "rust")
        .with_sources(vec![source.into()])
        .with_deps(deps.iter().map(|&d| TargetId::new(d)))
        .with_output_path(format!("{}.out", id.rsplit(':').next().unwrap()))
}

fn services() -> BuildServices {
    let mut services = BuildServices::new();
    services.register_language_handler("rust", Arc::new(constant_output("built")));
    services
}

#[test]
fn linear_chain_cold_build_runs_every_target_in_order() {
    let fixture = FixtureWorkspace::new();
    fixture.write_source("a.txt", "a");
    fixture.write_source("b.txt", "b");
    fixture.write_source("c.txt", "c");
    let fixture = fixture
        .add_target(target("//p:a", "a.txt", &[]))
        .add_target(target("//p:b", "b.txt", &["//p:a"]))
        .add_target(target("//p:c", "c.txt", &["//p:b"]))
        .max_jobs(1)
        .checkpointing_enabled(false);
    let (dir, mut config) = fixture.into_parts();
    for t in &mut config.targets {
        t.sources = t.sources.iter().map(|s| dir.path().join(s)).collect();
        t.output_path = dir.path().join(&t.output_path);
    }

    let events = Arc::new(forge_core::events::EventBus::new());
    let sub = events.subscribe();
    let outcome = forge_core::run_with_events(config, services(), 0, events).unwrap();

    assert_eq!(outcome.summary.built, 3);
    assert_eq!(outcome.summary.cached, 0);
    assert_eq!(outcome.summary.failed, 0);

    let mut seen = Vec::new();
    while let Some(event) = sub.recv() {
        seen.push(event);
    }
    assert!(matches!(seen.first(), Some(Event::BuildStarted { target_count: 3, .. })));
    assert!(matches!(seen.last(), Some(Event::BuildCompleted { built: 3, cached: 0, failed: 0, .. })));

    let order: Vec<&str> = seen
        .iter()
        .filter_map(|e| match e {
            Event::TargetCompleted { target, .. } => Some(target.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(order, vec!["//p:a", "//p:b", "//p:c"]);
}

#[test]
fn warm_build_reports_every_target_cached() {
    let fixture = FixtureWorkspace::new();
    fixture.write_source("a.txt", "a");
    let fixture = fixture.add_target(target("//p:a", "a.txt", &[])).checkpointing_enabled(false);
    let (dir, mut config) = fixture.into_parts();
    for t in &mut config.targets {
        t.sources = t.sources.iter().map(|s| dir.path().join(s)).collect();
        t.output_path = dir.path().join(&t.output_path);
    }

    let first = forge_core::run(config.clone(), services(), 0).unwrap();
    assert_eq!(first.summary.built, 1);
    assert_eq!(first.summary.cached, 0);

    let second = forge_core::run(config, services(), 1).unwrap();
    assert_eq!(second.summary.built, 0);
    assert_eq!(second.summary.cached, 1);
}

#[test]
fn modifying_a_middle_target_rebuilds_it_and_its_dependent_but_not_the_root() {
    let fixture = FixtureWorkspace::new();
    fixture.write_source("a.txt", "a");
    fixture.write_source("b.txt", "b");
    fixture.write_source("c.txt", "c");
    let fixture = fixture
        .add_target(target("//p:a", "a.txt", &[]))
        .add_target(target("//p:b", "b.txt", &["//p:a"]))
        .add_target(target("//p:c", "c.txt", &["//p:b"]))
        .checkpointing_enabled(false);
    let (dir, mut config) = fixture.into_parts();
    for t in &mut config.targets {
        t.sources = t.sources.iter().map(|s| dir.path().join(s)).collect();
        t.output_path = dir.path().join(&t.output_path);
    }

    let first = forge_core::run(config.clone(), services(), 0).unwrap();
    assert_eq!(first.summary.built, 3);

    std::fs::write(dir.path().join("b.txt"), "b-modified").unwrap();

    let second = forge_core::run(config, services(), 1).unwrap();
    assert_eq!(second.summary.cached, 1); // a
    assert_eq!(second.summary.built, 2); // b, c
}

#[test]
fn four_independent_targets_all_start_before_any_completes_with_four_workers() {
    let fixture = FixtureWorkspace::new();
    for n in ["a", "b", "c", "d"] {
        fixture.write_source(format!("{n}.txt"), n);
    }
    let fixture = ["a", "b", "c", "d"]
        .iter()
        .fold(fixture, |f, n| f.add_target(target(&format!("//p:{n}"), &format!("{n}.txt"), &[])))
        .max_jobs(4)
        .checkpointing_enabled(false);
    let (dir, mut config) = fixture.into_parts();
    for t in &mut config.targets {
        t.sources = t.sources.iter().map(|s| dir.path().join(s)).collect();
        t.output_path = dir.path().join(&t.output_path);
    }

    let outcome = forge_core::run(config, services(), 0).unwrap();
    assert_eq!(outcome.summary.built, 4);
    assert_eq!(outcome.summary.failed, 0);
}

#[test]
fn cycle_is_rejected_before_any_action_executes() {
    let err = BuildGraph::build(vec![
        Target::new("//p:a", TargetType::Library, "rust").with_deps([TargetId::new("//p:b")]),
        Target::new("//p:b", TargetType::Library, "rust").with_deps([TargetId::new("//p:a")]),
    ])
    .unwrap_err();

    assert_eq!(err.code, "GRAPH_CYCLE_DETECTED");
}

#[test]
fn cascading_failure_marks_transitive_dependents_failed_but_spares_unrelated_targets() {
    let fixture = FixtureWorkspace::new();
    for n in ["a", "b", "c", "d"] {
        fixture.write_source(format!("{n}.txt"), n);
    }
    let fixture = fixture
        .add_target(target("//p:a", "a.txt", &[]))
        .add_target(target("//p:b", "b.txt", &["//p:a"]))
        .add_target(target("//p:c", "c.txt", &["//p:b"]))
        .add_target(target("//p:d", "d.txt", &["//p:a"]))
        .checkpointing_enabled(false);
    let (dir, mut config) = fixture.into_parts();
    for t in &mut config.targets {
        t.sources = t.sources.iter().map(|s| dir.path().join(s)).collect();
        t.output_path = dir.path().join(&t.output_path);
    }
    config.retry.enabled = false;

    let mut services = BuildServices::new();
    services.register_language_handler("rust", Arc::new(FailingHandler { fails: "//p:b".to_string() }));

    let outcome = forge_core::run(config, services, 0).unwrap();
    assert_eq!(outcome.summary.built, 2); // a, d
    assert_eq!(outcome.summary.failed, 2); // b, c
}

struct FailingHandler {
    fails: String,
}

impl forge_core::language_handler::LanguageHandler for FailingHandler {
    fn plan(
        &self,
        target: &Target,
        _config: &WorkspaceConfig,
    ) -> forge_core::error::BuildResult<forge_core::language_handler::ActionPlan> {
        if target.id.as_str() == self.fails {
            return Err(forge_core::error::BuildError::new(
                forge_core::error::ErrorKind::Build,
                "BUILD_FAILED",
                "scripted failure",
            )
            .with_target(target.id.clone()));
        }
        Ok(forge_core::language_handler::ActionPlan {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), format!("printf built > {}", target.output_path.display())],
            declared_inputs: target.sources.clone(),
            declared_outputs: vec![target.output_path.clone()],
            env: Default::default(),
        })
    }

    fn analyze_imports(&self, _sources: &[std::path::PathBuf]) -> forge_core::error::BuildResult<Vec<forge_core::language_handler::Import>> {
        Ok(Vec::new())
    }

    fn get_outputs(&self, target: &Target, _config: &WorkspaceConfig) -> forge_core::error::BuildResult<Vec<std::path::PathBuf>> {
        Ok(vec![target.output_path.clone()])
    }
}
