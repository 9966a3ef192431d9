use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SwarmError};

/// Opaque build target label, e.g. `//lib/core:core`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Target(String);

impl Target {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Target {
    fn from(name: &str) -> Self {
        Self(name.to_string())
    }
}

impl From<String> for Target {
    fn from(name: String) -> Self {
        Self(name)
    }
}

/// One node of the dependency graph.
///
/// Build deps must exist before this target builds. Runtime deps are
/// needed when the target's output runs; an uncacheable runtime dep is
/// materialized by the executing engine itself and never scheduled.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetNode {
    pub name: Target,
    #[serde(default)]
    pub deps: Vec<Target>,
    #[serde(default)]
    pub runtime_deps: Vec<Target>,
    /// Target can never be served from a cache.
    #[serde(default)]
    pub uncacheable: bool,
    /// Failures of this target do not fail the build.
    #[serde(default)]
    pub best_effort: bool,
}

impl TargetNode {
    pub fn new(name: impl Into<Target>) -> Self {
        Self {
            name: name.into(),
            deps: Vec::new(),
            runtime_deps: Vec::new(),
            uncacheable: false,
            best_effort: false,
        }
    }

    pub fn with_deps(mut self, deps: impl IntoIterator<Item = impl Into<Target>>) -> Self {
        self.deps = deps.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_runtime_deps(
        mut self,
        deps: impl IntoIterator<Item = impl Into<Target>>,
    ) -> Self {
        self.runtime_deps = deps.into_iter().map(Into::into).collect();
        self
    }

    pub fn uncacheable(mut self) -> Self {
        self.uncacheable = true;
        self
    }

    pub fn best_effort(mut self) -> Self {
        self.best_effort = true;
        self
    }
}

/// Validated dependency graph for one build.
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    nodes: HashMap<Target, TargetNode>,
    top_level: Vec<Target>,
}

impl DependencyGraph {
    /// Build a graph from its nodes and the requested top-level targets.
    ///
    /// Rejects duplicate nodes, references to undeclared targets, and
    /// dependency cycles (through build or runtime edges).
    pub fn new(nodes: Vec<TargetNode>, top_level: Vec<Target>) -> Result<Self> {
        let mut table: HashMap<Target, TargetNode> = HashMap::with_capacity(nodes.len());
        for node in nodes {
            if table.insert(node.name.clone(), node.clone()).is_some() {
                return Err(SwarmError::InvalidGraph(format!(
                    "duplicate target declaration: {}",
                    node.name
                )));
            }
        }

        for node in table.values() {
            for dep in node.deps.iter().chain(node.runtime_deps.iter()) {
                if !table.contains_key(dep) {
                    return Err(SwarmError::InvalidGraph(format!(
                        "{} depends on undeclared target {}",
                        node.name, dep
                    )));
                }
            }
        }
        for top in &top_level {
            if !table.contains_key(top) {
                return Err(SwarmError::InvalidGraph(format!(
                    "top-level target {} is not declared",
                    top
                )));
            }
        }

        let graph = Self {
            nodes: table,
            top_level,
        };
        graph.check_acyclic()?;
        Ok(graph)
    }

    /// Kahn-style cycle check over the union of build and runtime edges.
    fn check_acyclic(&self) -> Result<()> {
        let mut outstanding: HashMap<&Target, usize> = HashMap::with_capacity(self.nodes.len());
        let mut dependents: HashMap<&Target, Vec<&Target>> = HashMap::new();

        for node in self.nodes.values() {
            let count = node.deps.len() + node.runtime_deps.len();
            outstanding.insert(&node.name, count);
            for dep in node.deps.iter().chain(node.runtime_deps.iter()) {
                dependents.entry(dep).or_default().push(&node.name);
            }
        }

        let mut ready: VecDeque<&Target> = outstanding
            .iter()
            .filter(|(_, &count)| count == 0)
            .map(|(&t, _)| t)
            .collect();
        let mut removed = 0usize;

        while let Some(t) = ready.pop_front() {
            removed += 1;
            if let Some(parents) = dependents.get(t) {
                for &parent in parents {
                    let count = outstanding
                        .get_mut(parent)
                        .ok_or_else(|| SwarmError::Internal("cycle check bookkeeping".into()))?;
                    *count -= 1;
                    if *count == 0 {
                        ready.push_back(parent);
                    }
                }
            }
        }

        if removed < self.nodes.len() {
            let stuck = outstanding
                .iter()
                .filter(|(_, &count)| count > 0)
                .map(|(&t, _)| t)
                .min()
                .ok_or_else(|| SwarmError::Internal("cycle check bookkeeping".into()))?;
            return Err(SwarmError::DependencyCycle(stuck.to_string()));
        }
        Ok(())
    }

    pub fn contains(&self, target: &Target) -> bool {
        self.nodes.contains_key(target)
    }

    pub fn build_deps(&self, target: &Target) -> &[Target] {
        self.nodes.get(target).map(|n| n.deps.as_slice()).unwrap_or(&[])
    }

    pub fn runtime_deps(&self, target: &Target) -> &[Target] {
        self.nodes
            .get(target)
            .map(|n| n.runtime_deps.as_slice())
            .unwrap_or(&[])
    }

    pub fn is_uncacheable(&self, target: &Target) -> bool {
        self.nodes.get(target).map(|n| n.uncacheable).unwrap_or(false)
    }

    pub fn is_best_effort(&self, target: &Target) -> bool {
        self.nodes.get(target).map(|n| n.best_effort).unwrap_or(false)
    }

    pub fn top_level_targets(&self) -> &[Target] {
        &self.top_level
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Every target reachable from the top-level set through build deps
    /// plus cacheable runtime deps, i.e. everything the distributed
    /// build could be asked to provide.
    pub fn reachable_targets(&self) -> HashSet<Target> {
        let mut seen: HashSet<Target> = HashSet::new();
        let mut stack: Vec<&Target> = self.top_level.iter().collect();
        while let Some(t) = stack.pop() {
            if !seen.insert(t.clone()) {
                continue;
            }
            for dep in self.build_deps(t) {
                stack.push(dep);
            }
            for dep in self.runtime_deps(t) {
                if !self.is_uncacheable(dep) {
                    stack.push(dep);
                }
            }
        }
        seen
    }
}

/// On-disk description of a build: the graph plus the cache status the
/// scheduler should assume. This is the file the CLI loads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphSpec {
    pub targets: Vec<TargetNode>,
    pub top_level: Vec<Target>,
    #[serde(default)]
    pub remote_cache_hits: Vec<Target>,
    #[serde(default)]
    pub local_cache_hits: Vec<Target>,
}

impl GraphSpec {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let spec: GraphSpec = serde_json::from_str(&raw)?;
        Ok(spec)
    }

    pub fn build_graph(&self) -> Result<DependencyGraph> {
        DependencyGraph::new(self.targets.clone(), self.top_level.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn node(name: &str, deps: &[&str]) -> TargetNode {
        TargetNode::new(name).with_deps(deps.iter().copied())
    }

    #[test]
    fn valid_graph_builds() {
        let graph = DependencyGraph::new(
            vec![node("root", &["mid"]), node("mid", &["leaf"]), node("leaf", &[])],
            vec![Target::from("root")],
        )
        .unwrap();
        assert_eq!(graph.len(), 3);
        assert_eq!(graph.build_deps(&Target::from("root")), &[Target::from("mid")]);
    }

    #[test]
    fn undeclared_dependency_is_rejected() {
        let err = DependencyGraph::new(vec![node("root", &["ghost"])], vec![Target::from("root")])
            .unwrap_err();
        assert!(matches!(err, SwarmError::InvalidGraph(_)));
    }

    #[test]
    fn undeclared_top_level_is_rejected() {
        let err =
            DependencyGraph::new(vec![node("a", &[])], vec![Target::from("missing")]).unwrap_err();
        assert!(matches!(err, SwarmError::InvalidGraph(_)));
    }

    #[test]
    fn duplicate_declaration_is_rejected() {
        let err = DependencyGraph::new(
            vec![node("a", &[]), node("a", &[])],
            vec![Target::from("a")],
        )
        .unwrap_err();
        assert!(matches!(err, SwarmError::InvalidGraph(_)));
    }

    #[test]
    fn build_dep_cycle_is_rejected() {
        let err = DependencyGraph::new(
            vec![node("a", &["b"]), node("b", &["a"])],
            vec![Target::from("a")],
        )
        .unwrap_err();
        assert!(matches!(err, SwarmError::DependencyCycle(_)));
    }

    #[test]
    fn runtime_dep_cycle_is_rejected() {
        let err = DependencyGraph::new(
            vec![
                TargetNode::new("a").with_runtime_deps(["b"]),
                node("b", &["a"]),
            ],
            vec![Target::from("a")],
        )
        .unwrap_err();
        assert!(matches!(err, SwarmError::DependencyCycle(_)));
    }

    #[test]
    fn reachability_skips_uncacheable_runtime_deps() {
        let graph = DependencyGraph::new(
            vec![
                TargetNode::new("root")
                    .with_deps(["build_dep"])
                    .with_runtime_deps(["cacheable", "transient"]),
                node("build_dep", &[]),
                node("cacheable", &[]),
                TargetNode::new("transient").uncacheable(),
                node("unreferenced", &[]),
            ],
            vec![Target::from("root")],
        )
        .unwrap();

        let reachable = graph.reachable_targets();
        assert!(reachable.contains(&Target::from("root")));
        assert!(reachable.contains(&Target::from("build_dep")));
        assert!(reachable.contains(&Target::from("cacheable")));
        assert!(!reachable.contains(&Target::from("transient")));
        assert!(!reachable.contains(&Target::from("unreferenced")));
    }

    #[test]
    fn graph_spec_parses_with_defaults() {
        let raw = r#"{
            "targets": [
                {"name": "//:root", "deps": ["//:leaf"]},
                {"name": "//:leaf"}
            ],
            "top_level": ["//:root"],
            "remote_cache_hits": ["//:leaf"]
        }"#;
        let spec: GraphSpec = serde_json::from_str(raw).unwrap();
        assert_eq!(spec.targets.len(), 2);
        assert_eq!(spec.remote_cache_hits, vec![Target::from("//:leaf")]);
        assert!(spec.local_cache_hits.is_empty());
        let graph = spec.build_graph().unwrap();
        assert!(graph.contains(&Target::from("//:root")));
    }

    #[test]
    fn graph_spec_loads_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"targets": [{{"name": "a"}}], "top_level": ["a"]}}"#
        )
        .unwrap();
        let spec = GraphSpec::load(file.path()).unwrap();
        assert_eq!(spec.top_level, vec![Target::from("a")]);
    }
}
