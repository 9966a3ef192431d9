use std::collections::{HashMap, HashSet};

use crate::cache::{ArtifactUploader, CacheHitSet, CacheStatusOracle};
use crate::error::Result;
use crate::events::BuildRulePublisher;
use crate::graph::{DependencyGraph, Target};

use super::queue::WorkQueue;
use super::work_unit::WorkUnit;

/// Build the dispatch queue for one distributed build.
///
/// Walks the graph from the top-level targets, prunes everything a
/// cache already holds, collapses single-file dependency chains into
/// work units, publishes synthesized lifecycle events for the pruned
/// targets, and hands the critical local-only artifacts to the
/// uploader.
///
/// Pruning stops at the first skippable target on each path: a target
/// is skippable when some cache holds it and every cacheable runtime
/// dep of it is itself skippable. Nothing below a skippable target is
/// visited, so the pruned set is the skippable frontier, not the whole
/// cached subgraph. Uncacheable runtime deps are invisible here; the
/// engine executing their dependent materializes them on its own.
pub fn build_work_queue(
    graph: &DependencyGraph,
    oracle: &dyn CacheStatusOracle,
    publisher: &dyn BuildRulePublisher,
    uploader: &dyn ArtifactUploader,
) -> Result<WorkQueue> {
    let reachable: Vec<Target> = graph.reachable_targets().into_iter().collect();
    let hits = oracle.classify(&reachable)?;
    let mut skip = SkippableIndex {
        graph,
        hits: &hits,
        memo: HashMap::new(),
    };

    // Schedule traversal. Scheduled targets get ordering edges to their
    // scheduled children; skippable children become the pruned frontier
    // and are not descended into. Runtime dep edges order execution
    // exactly like build dep edges.
    let mut scheduled: HashSet<Target> = HashSet::new();
    let mut scheduled_order: Vec<Target> = Vec::new();
    let mut pruned: Vec<Target> = Vec::new();
    let mut pruned_set: HashSet<Target> = HashSet::new();
    let mut deps_of: HashMap<Target, HashSet<Target>> = HashMap::new();
    let mut dependents_of: HashMap<Target, HashSet<Target>> = HashMap::new();
    let mut stack: Vec<Target> = Vec::new();

    for top in graph.top_level_targets() {
        if skip.is_skippable(top) {
            if pruned_set.insert(top.clone()) {
                pruned.push(top.clone());
            }
        } else if scheduled.insert(top.clone()) {
            scheduled_order.push(top.clone());
            stack.push(top.clone());
        }
    }

    while let Some(parent) = stack.pop() {
        let mut children: Vec<Target> = graph.build_deps(&parent).to_vec();
        for dep in graph.runtime_deps(&parent) {
            if !graph.is_uncacheable(dep) {
                children.push(dep.clone());
            }
        }
        for child in children {
            if skip.is_skippable(&child) {
                if pruned_set.insert(child.clone()) {
                    pruned.push(child.clone());
                }
                continue;
            }
            deps_of.entry(parent.clone()).or_default().insert(child.clone());
            dependents_of
                .entry(child.clone())
                .or_default()
                .insert(parent.clone());
            if scheduled.insert(child.clone()) {
                scheduled_order.push(child.clone());
                stack.push(child.clone());
            }
        }
    }

    // Chain collapsing: a target whose single scheduled dep has no
    // other scheduled dependent joins that dep's unit, directly after
    // it. `prev` maps a target to the unit member built just before it.
    let mut prev: HashMap<Target, Target> = HashMap::new();
    let mut next: HashMap<Target, Target> = HashMap::new();
    for target in &scheduled_order {
        let Some(deps) = deps_of.get(target) else {
            continue;
        };
        if deps.len() != 1 {
            continue;
        }
        let Some(dep) = deps.iter().next().cloned() else {
            continue;
        };
        let sole_dependent = dependents_of.get(&dep).map(|d| d.len()) == Some(1);
        if sole_dependent {
            prev.insert(target.clone(), dep.clone());
            next.insert(dep, target.clone());
        }
    }

    let mut units: Vec<(WorkUnit, usize)> = Vec::new();
    let mut dependent_units: HashMap<Target, Vec<usize>> = HashMap::new();
    for head in &scheduled_order {
        if prev.contains_key(head) {
            continue;
        }
        let mut chain = vec![head.clone()];
        let mut cursor = head.clone();
        while let Some(follower) = next.get(&cursor) {
            chain.push(follower.clone());
            cursor = follower.clone();
        }

        let id = units.len();
        let external_deps = deps_of.get(head).map(|d| d.len()).unwrap_or(0);
        if let Some(deps) = deps_of.get(head) {
            for dep in deps {
                dependent_units.entry(dep.clone()).or_default().push(id);
            }
        }
        units.push((WorkUnit::new(chain), external_deps));
    }

    // Pruned targets never reach a minion, so their lifecycle events
    // are synthesized here, one started batch and one finished batch.
    if !pruned.is_empty() {
        if let Err(e) = publisher.targets_started(&pruned) {
            tracing::warn!(error = %e, "Dropping synthesized started events for pruned targets");
        }
        if let Err(e) = publisher.targets_finished(&pruned) {
            tracing::warn!(error = %e, "Dropping synthesized finished events for pruned targets");
        }
    }

    let uploads = critical_local_artifacts(graph, &hits, &pruned);
    if !uploads.is_empty() {
        tracing::info!(count = uploads.len(), "Uploading locally cached artifacts the fleet will need");
        if let Err(e) = uploader.upload_critical_artifacts(&uploads) {
            tracing::warn!(error = %e, "Critical artifact upload failed; remote fetches of these targets may miss");
        }
    }

    let queue = WorkQueue::new(units, dependent_units, pruned);
    tracing::info!(
        scheduled = queue.scheduled_count(),
        pruned = queue.pruned_targets().len(),
        "Constructed work queue"
    );
    Ok(queue)
}

/// Pruned targets that only the local cache holds, plus transitively
/// any cacheable runtime deps of those that are also local-only. The
/// fleet fetches these instead of building them, so they must be pushed
/// to the remote cache first. Build deps of pruned targets are not
/// chased: nothing will fetch them.
fn critical_local_artifacts(
    graph: &DependencyGraph,
    hits: &CacheHitSet,
    pruned: &[Target],
) -> Vec<Target> {
    let local_only = |t: &Target| hits.is_local_hit(t) && !hits.is_remote_hit(t);

    let mut uploads: Vec<Target> = Vec::new();
    let mut upload_set: HashSet<Target> = HashSet::new();
    let mut stack: Vec<Target> = Vec::new();
    for target in pruned {
        if local_only(target) && upload_set.insert(target.clone()) {
            uploads.push(target.clone());
            stack.push(target.clone());
        }
    }
    while let Some(target) = stack.pop() {
        for dep in graph.runtime_deps(&target) {
            if graph.is_uncacheable(dep) {
                continue;
            }
            if local_only(dep) && upload_set.insert(dep.clone()) {
                uploads.push(dep.clone());
                stack.push(dep.clone());
            }
        }
    }
    uploads
}

struct SkippableIndex<'a> {
    graph: &'a DependencyGraph,
    hits: &'a CacheHitSet,
    memo: HashMap<Target, bool>,
}

impl SkippableIndex<'_> {
    fn is_skippable(&mut self, target: &Target) -> bool {
        if let Some(&known) = self.memo.get(target) {
            return known;
        }
        let skippable = if self.graph.is_uncacheable(target) || !self.hits.is_hit(target) {
            false
        } else {
            let runtime_deps: Vec<Target> = self.graph.runtime_deps(target).to_vec();
            runtime_deps
                .iter()
                .filter(|dep| !self.graph.is_uncacheable(dep))
                .all(|dep| self.is_skippable(dep))
        };
        self.memo.insert(target.clone(), skippable);
        skippable
    }
}
