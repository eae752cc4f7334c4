//! Target dependency graph: construction, topological ordering, cycle
//! detection, and guarded dynamic extension for discovered targets.

mod node;
mod target;

use std::collections::{BTreeSet, HashMap, HashSet};

use parking_lot::RwLock;

use crate::error::{BuildError, BuildResult, ErrorKind, Suggestion, SuggestionTag};
use crate::fingerprint::{CanonicalWriter, Fingerprint};

pub use node::{AtomicStatus, BuildNode, NodeIndex, NodeStatus};
pub use target::{Target, TargetId, TargetType};

struct GraphInner {
    nodes: Vec<BuildNode>,
    index_of: HashMap<TargetId, NodeIndex>,
}

/// Owns every [`BuildNode`] for one build run. Topology is immutable after
/// [`BuildGraph::build`] except through [`BuildGraph::extend`], which takes
/// an exclusive lock and applies all of its additions or none of them.
pub struct BuildGraph {
    inner: RwLock<GraphInner>,
}

impl BuildGraph {
    /// Constructs a graph from a full target set. Fails if any `deps` entry
    /// names an unknown target, or if the target set contains a cycle.
    pub fn build(targets: Vec<Target>) -> BuildResult<Self> {
        let mut index_of = HashMap::with_capacity(targets.len());
        for (i, t) in targets.iter().enumerate() {
            if index_of.insert(t.id.clone(), NodeIndex(i)).is_some() {
                return Err(BuildError::new(
                    ErrorKind::Graph,
                    "GRAPH_DUPLICATE_TARGET",
                    format!("target {} declared more than once", t.id),
                )
                .with_target(t.id.clone()));
            }
        }

        let mut dependency_lists = Vec::with_capacity(targets.len());
        for t in &targets {
            let mut deps = Vec::with_capacity(t.deps.len());
            for dep_id in &t.deps {
                let idx = index_of.get(dep_id).copied().ok_or_else(|| {
                    BuildError::new(
                        ErrorKind::Graph,
                        "GRAPH_UNKNOWN_DEPENDENCY",
                        format!("target {} depends on unknown target {}", t.id, dep_id),
                    )
                    .with_target(t.id.clone())
                    .with_suggestion(Suggestion::new(
                        SuggestionTag::Configuration,
                        format!("declare a target named {dep_id} or remove the dependency"),
                    ))
                })?;
                deps.push(idx);
            }
            dependency_lists.push(deps);
        }

        detect_cycle(&targets, &index_of)?;

        let mut nodes: Vec<BuildNode> = targets
            .into_iter()
            .zip(dependency_lists)
            .enumerate()
            .map(|(i, (target, deps))| BuildNode::new(target, NodeIndex(i), deps))
            .collect();

        for i in 0..nodes.len() {
            let deps = nodes[i].dependencies.clone();
            for dep_idx in deps {
                nodes[dep_idx.0].add_dependent(NodeIndex(i));
            }
        }

        Ok(Self {
            inner: RwLock::new(GraphInner { nodes, index_of }),
        })
    }

    pub fn len(&self) -> usize {
        self.inner.read().nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn index_of(&self, id: &TargetId) -> Option<NodeIndex> {
        self.inner.read().index_of.get(id).copied()
    }

    pub fn with_node<R>(&self, idx: NodeIndex, f: impl FnOnce(&BuildNode) -> R) -> Option<R> {
        self.inner.read().nodes.get(idx.0).map(f)
    }

    pub fn node_by_id<R>(&self, id: &TargetId, f: impl FnOnce(&BuildNode) -> R) -> Option<R> {
        let inner = self.inner.read();
        let idx = *inner.index_of.get(id)?;
        inner.nodes.get(idx.0).map(f)
    }

    pub fn dependents_of(&self, idx: NodeIndex) -> Vec<NodeIndex> {
        self.inner.read().nodes[idx.0].dependents()
    }

    pub fn all_indices(&self) -> Vec<NodeIndex> {
        (0..self.len()).map(NodeIndex).collect()
    }

    /// Digest over every target's structural identity (id, language,
    /// sources, deps, flags, env, output path), in topological order so the
    /// same graph shape always hashes identically regardless of declaration
    /// order. Catches a checkpoint taken against a different build graph;
    /// it does not catch a source file changing in place under an unchanged
    /// path -- see [`crate::checkpoint::source_fingerprint`] for that.
    pub fn identity_digest(&self) -> Fingerprint {
        let mut w = CanonicalWriter::new();
        for id in self.topo_order() {
            let Some(idx) = self.index_of(&id) else { continue };
            self.with_node(idx, |n| {
                w.write_str(n.target.id.as_str());
                w.write_str(&n.target.language);
                let sources: Vec<String> =
                    n.target.sources.iter().map(|p| p.to_string_lossy().into_owned()).collect();
                w.write_ordered_strings(sources.iter().map(String::as_str));
                let deps: Vec<String> = n.target.deps.iter().map(|d| d.as_str().to_string()).collect();
                w.write_ordered_strings(deps.iter().map(String::as_str));
                w.write_ordered_strings(n.target.flags.iter().map(String::as_str));
                w.write_sorted_map(n.target.env.iter().map(|(k, v)| (k.as_str(), v.as_str())));
                w.write_str(&n.target.output_path.to_string_lossy());
            });
        }
        Fingerprint::of_bytes(&w.into_bytes())
    }

    /// Kahn's algorithm with deterministic tie-break: among nodes whose
    /// in-degree has just reached zero, the lexicographically smallest
    /// `TargetId` is emitted first. Same order every run given the same
    /// graph, independent of construction or thread scheduling.
    pub fn topo_order(&self) -> Vec<TargetId> {
        let inner = self.inner.read();
        let n = inner.nodes.len();
        let mut remaining: Vec<usize> = inner.nodes.iter().map(|n| n.dependencies.len()).collect();

        let mut ready: BTreeSet<TargetId> = BTreeSet::new();
        for (i, &deg) in remaining.iter().enumerate() {
            if deg == 0 {
                ready.insert(inner.nodes[i].target.id.clone());
            }
        }

        let mut order = Vec::with_capacity(n);
        while let Some(id) = ready.iter().next().cloned() {
            ready.remove(&id);
            let idx = inner.index_of[&id];
            order.push(id);
            for dep_idx in inner.nodes[idx.0].dependents() {
                remaining[dep_idx.0] -= 1;
                if remaining[dep_idx.0] == 0 {
                    ready.insert(inner.nodes[dep_idx.0].target.id.clone());
                }
            }
        }
        order
    }

    /// Transitive closure over `deps` for the given roots, including the
    /// roots themselves. Used to produce a build subgraph for a selected
    /// set of targets.
    pub fn transitive_closure(&self, roots: &[TargetId]) -> BuildResult<HashSet<TargetId>> {
        let inner = self.inner.read();
        let mut seen = HashSet::new();
        let mut stack: Vec<TargetId> = Vec::new();
        for root in roots {
            if !inner.index_of.contains_key(root) {
                return Err(BuildError::new(
                    ErrorKind::Graph,
                    "GRAPH_TARGET_NOT_FOUND",
                    format!("no such target {root}"),
                ));
            }
            stack.push(root.clone());
        }
        while let Some(id) = stack.pop() {
            if !seen.insert(id.clone()) {
                continue;
            }
            let idx = inner.index_of[&id];
            for dep_idx in &inner.nodes[idx.0].dependencies {
                stack.push(inner.nodes[dep_idx.0].target.id.clone());
            }
        }
        Ok(seen)
    }

    /// Adds `new_targets` plus `extra_edges` (each `(from, to)` meaning
    /// `from` depends on `to`) to the graph. Validates acyclicity of the
    /// resulting graph before mutating anything; on any error the graph is
    /// left exactly as it was. Returns the indices of newly-ready nodes
    /// (new nodes with zero pending deps) for the caller to enqueue.
    pub fn extend(
        &self,
        new_targets: Vec<Target>,
        extra_edges: Vec<(TargetId, TargetId)>,
    ) -> BuildResult<Vec<NodeIndex>> {
        let mut inner = self.inner.write();

        for t in &new_targets {
            if inner.index_of.contains_key(&t.id) {
                return Err(BuildError::new(
                    ErrorKind::Graph,
                    "GRAPH_DISCOVERY_COLLISION",
                    format!("discovered target {} collides with an existing target", t.id),
                )
                .with_target(t.id.clone()));
            }
        }

        // Build a draft adjacency (from -> set of to) covering the existing
        // graph plus every proposed addition, to test acyclicity before
        // touching real state.
        let base_len = inner.nodes.len();
        let mut draft_deps: Vec<BTreeSet<usize>> = inner
            .nodes
            .iter()
            .map(|n| n.dependencies.iter().map(|i| i.0).collect())
            .collect();
        let mut draft_id_of: Vec<TargetId> = inner.nodes.iter().map(|n| n.target.id.clone()).collect();
        let mut draft_index_of = inner.index_of.clone();

        for t in &new_targets {
            draft_index_of.insert(t.id.clone(), NodeIndex(draft_id_of.len()));
            draft_id_of.push(t.id.clone());
            draft_deps.push(BTreeSet::new());
        }

        for (i, t) in new_targets.iter().enumerate() {
            let from_idx = base_len + i;
            for dep_id in &t.deps {
                let dep_idx = draft_index_of.get(dep_id).copied().ok_or_else(|| {
                    BuildError::new(
                        ErrorKind::Graph,
                        "GRAPH_UNKNOWN_DEPENDENCY",
                        format!("discovered target {} depends on unknown target {dep_id}", t.id),
                    )
                })?;
                draft_deps[from_idx].insert(dep_idx.0);
            }
        }

        for (from, to) in &extra_edges {
            let from_idx = draft_index_of.get(from).copied().ok_or_else(|| {
                BuildError::new(ErrorKind::Graph, "GRAPH_TARGET_NOT_FOUND", format!("no such target {from}"))
            })?;
            let to_idx = draft_index_of.get(to).copied().ok_or_else(|| {
                BuildError::new(ErrorKind::Graph, "GRAPH_TARGET_NOT_FOUND", format!("no such target {to}"))
            })?;
            draft_deps[from_idx.0].insert(to_idx.0);
        }

        if let Some(cycle) = find_cycle_indices(&draft_deps, &draft_id_of) {
            let names: Vec<String> = cycle.iter().map(ToString::to_string).collect();
            return Err(BuildError::new(
                ErrorKind::Graph,
                "GRAPH_CYCLE_DETECTED",
                format!("extension would introduce a cycle: {}", names.join("->")),
            ));
        }

        // Validated: apply for real. New nodes first, then wire up edges
        // (both the new nodes' own deps and the extra cross edges), then
        // fix up pendingDeps for every node whose dependency set grew.
        let mut newly_added_indices = Vec::with_capacity(new_targets.len());
        for t in new_targets {
            let idx = NodeIndex(inner.nodes.len());
            let deps: Vec<NodeIndex> = draft_deps[idx.0]
                .iter()
                .map(|&i| NodeIndex(i))
                .collect();
            inner.index_of.insert(t.id.clone(), idx);
            inner.nodes.push(BuildNode::new(t, idx, deps));
            newly_added_indices.push(idx);
        }

        for (from, to) in extra_edges {
            let from_idx = inner.index_of[&from];
            let to_idx = inner.index_of[&to];
            inner.nodes[to_idx.0].add_dependent(from_idx);
            inner.nodes[from_idx.0].increment_pending_deps();
        }

        for &idx in &newly_added_indices {
            for dep_idx in inner.nodes[idx.0].dependencies.clone() {
                inner.nodes[dep_idx.0].add_dependent(idx);
            }
        }

        let mut freshly_ready = Vec::new();
        for &idx in &newly_added_indices {
            if inner.nodes[idx.0].pending_deps() == 0 {
                freshly_ready.push(idx);
            }
        }
        Ok(freshly_ready)
    }
}

fn detect_cycle(targets: &[Target], index_of: &HashMap<TargetId, NodeIndex>) -> BuildResult<()> {
    let deps: Vec<BTreeSet<usize>> = targets
        .iter()
        .map(|t| t.deps.iter().filter_map(|d| index_of.get(d)).map(|i| i.0).collect())
        .collect();
    let ids: Vec<TargetId> = targets.iter().map(|t| t.id.clone()).collect();
    if let Some(cycle) = find_cycle_indices(&deps, &ids) {
        let names: Vec<String> = cycle.iter().map(ToString::to_string).collect();
        return Err(BuildError::new(
            ErrorKind::Graph,
            "GRAPH_CYCLE_DETECTED",
            format!("cycle detected: {}", names.join("->")),
        ));
    }
    Ok(())
}

/// DFS-based cycle detection with three-color marking. On finding a back
/// edge, returns the cycle as a sequence of `TargetId`s starting and ending
/// at the repeated node.
fn find_cycle_indices(deps: &[BTreeSet<usize>], ids: &[TargetId]) -> Option<Vec<TargetId>> {
    #[derive(Clone, Copy, PartialEq)]
    enum Color {
        White,
        Gray,
        Black,
    }

    let n = deps.len();
    let mut color = vec![Color::White; n];
    let mut path: Vec<usize> = Vec::new();

    for start in 0..n {
        if color[start] != Color::White {
            continue;
        }
        let mut stack = vec![(start, deps[start].iter().copied().collect::<Vec<_>>().into_iter())];
        color[start] = Color::Gray;
        path.push(start);

        while let Some((node, iter)) = stack.last_mut() {
            let node = *node;
            if let Some(next) = iter.next() {
                match color[next] {
                    Color::White => {
                        color[next] = Color::Gray;
                        path.push(next);
                        stack.push((next, deps[next].iter().copied().collect::<Vec<_>>().into_iter()));
                    }
                    Color::Gray => {
                        let cycle_start = path.iter().position(|&i| i == next).unwrap();
                        let mut cycle: Vec<TargetId> = path[cycle_start..].iter().map(|&i| ids[i].clone()).collect();
                        cycle.push(ids[next].clone());
                        return Some(cycle);
                    }
                    Color::Black => {}
                }
            } else {
                color[node] = Color::Black;
                path.pop();
                stack.pop();
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target(id: &str, deps: &[&str]) -> Target {
        Target::new(id, TargetType::Library, "rust").with_deps(deps.iter().map(|&d| TargetId::new(d)))
    }

    #[test]
    fn linear_chain_topo_order_is_dependency_first() {
        let graph = BuildGraph::build(vec![
            target("//p:a", &[]),
            target("//p:b", &["//p:a"]),
            target("//p:c", &["//p:b"]),
        ])
        .unwrap();
        let order = graph.topo_order();
        assert_eq!(
            order,
            vec![TargetId::new("//p:a"), TargetId::new("//p:b"), TargetId::new("//p:c")]
        );
    }

    #[test]
    fn topo_order_ties_break_by_ascending_id() {
        let graph = BuildGraph::build(vec![target("//p:b", &[]), target("//p:a", &[]), target("//p:c", &[])]).unwrap();
        let order = graph.topo_order();
        assert_eq!(
            order,
            vec![TargetId::new("//p:a"), TargetId::new("//p:b"), TargetId::new("//p:c")]
        );
    }

    #[test]
    fn cycle_is_rejected_at_construction() {
        let err = BuildGraph::build(vec![target("//p:a", &["//p:b"]), target("//p:b", &["//p:a"])]).unwrap_err();
        assert_eq!(err.code, "GRAPH_CYCLE_DETECTED");
    }

    #[test]
    fn unknown_dependency_is_rejected() {
        let err = BuildGraph::build(vec![target("//p:a", &["//p:missing"])]).unwrap_err();
        assert_eq!(err.code, "GRAPH_UNKNOWN_DEPENDENCY");
    }

    #[test]
    fn dependents_are_reverse_of_dependencies() {
        let graph = BuildGraph::build(vec![target("//p:a", &[]), target("//p:b", &["//p:a"])]).unwrap();
        let a_idx = graph.index_of(&TargetId::new("//p:a")).unwrap();
        let dependents = graph.dependents_of(a_idx);
        assert_eq!(dependents.len(), 1);
    }

    #[test]
    fn extend_adds_nodes_and_reports_freshly_ready() {
        let graph = BuildGraph::build(vec![target("//p:a", &[])]).unwrap();
        let ready = graph.extend(vec![target("//p:b", &["//p:a"])], vec![]).unwrap();
        assert_eq!(graph.len(), 2);
        // //p:b still has one pending dep on //p:a, so it is not yet ready.
        assert!(ready.is_empty());
    }

    #[test]
    fn extend_rejects_cycle_and_leaves_graph_untouched() {
        let graph = BuildGraph::build(vec![target("//p:a", &[])]).unwrap();
        let err = graph
            .extend(vec![target("//p:c", &["//p:a"])], vec![(TargetId::new("//p:a"), TargetId::new("//p:c"))])
            .unwrap_err();
        assert_eq!(err.code, "GRAPH_CYCLE_DETECTED");
        assert_eq!(graph.len(), 1);
    }

    #[test]
    fn extend_rejects_id_collision() {
        let graph = BuildGraph::build(vec![target("//p:a", &[])]).unwrap();
        let err = graph.extend(vec![target("//p:a", &[])], vec![]).unwrap_err();
        assert_eq!(err.code, "GRAPH_DISCOVERY_COLLISION");
    }

    #[test]
    fn identity_digest_is_stable_and_order_independent() {
        let a = BuildGraph::build(vec![target("//p:a", &[]), target("//p:b", &["//p:a"])]).unwrap();
        let b = BuildGraph::build(vec![target("//p:b", &["//p:a"]), target("//p:a", &[])]).unwrap();
        assert_eq!(a.identity_digest(), b.identity_digest());
    }

    #[test]
    fn identity_digest_changes_when_a_dependency_is_added() {
        let before = BuildGraph::build(vec![target("//p:a", &[]), target("//p:b", &[])]).unwrap();
        let after = BuildGraph::build(vec![target("//p:a", &[]), target("//p:b", &["//p:a"])]).unwrap();
        assert_ne!(before.identity_digest(), after.identity_digest());
    }

    #[test]
    fn transitive_closure_includes_root_and_all_deps() {
        let graph = BuildGraph::build(vec![
            target("//p:a", &[]),
            target("//p:b", &["//p:a"]),
            target("//p:c", &["//p:b"]),
        ])
        .unwrap();
        let closure = graph.transitive_closure(&[TargetId::new("//p:c")]).unwrap();
        assert_eq!(closure.len(), 3);
    }
}
