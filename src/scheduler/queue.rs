use std::collections::{HashMap, HashSet, VecDeque};

use crate::error::{Result, SwarmError};
use crate::graph::Target;

use super::work_unit::WorkUnit;

struct PendingUnit {
    unit: WorkUnit,
    /// Finish reports still required before the unit's first target can
    /// build. Only a unit's first target has dependencies outside the
    /// unit, so one counter per unit is enough.
    unsatisfied: usize,
}

/// Dispatch queue over the scheduled portion of the build graph.
///
/// Built once per build by [`super::factory::build_work_queue`]; the
/// coordinator then drives it with finish reports and dequeues. Plain
/// synchronous structure, callers serialize access.
pub struct WorkQueue {
    pending: HashMap<usize, PendingUnit>,
    ready: VecDeque<usize>,
    /// Unit ids whose first target depends on this target.
    dependent_units: HashMap<Target, Vec<usize>>,
    scheduled: HashSet<Target>,
    finished: HashSet<Target>,
    pruned: Vec<Target>,
}

impl WorkQueue {
    pub(crate) fn new(
        units: Vec<(WorkUnit, usize)>,
        dependent_units: HashMap<Target, Vec<usize>>,
        pruned: Vec<Target>,
    ) -> Self {
        let mut pending = HashMap::with_capacity(units.len());
        let mut ready = VecDeque::new();
        let mut scheduled = HashSet::new();
        for (id, (unit, unsatisfied)) in units.into_iter().enumerate() {
            for target in unit.targets() {
                scheduled.insert(target.clone());
            }
            if unsatisfied == 0 {
                ready.push_back(id);
            }
            pending.insert(id, PendingUnit { unit, unsatisfied });
        }
        Self {
            pending,
            ready,
            dependent_units,
            scheduled,
            finished: HashSet::new(),
            pruned,
        }
    }

    /// Record newly finished targets, then hand out up to `max_units`
    /// units whose first target has no unfinished dependencies left.
    ///
    /// A finish report for a target that was never scheduled is a
    /// structural error. A repeat report for an already finished target
    /// is ignored, so retried reports and re-dispatched units cannot
    /// unlock a dependent twice.
    pub fn dequeue_zero_dependency_work_units(
        &mut self,
        finished: &[Target],
        max_units: usize,
    ) -> Result<Vec<WorkUnit>> {
        for target in finished {
            self.mark_finished(target)?;
        }

        let mut dispatched = Vec::new();
        while dispatched.len() < max_units {
            let Some(id) = self.ready.pop_front() else {
                break;
            };
            let pending = self
                .pending
                .remove(&id)
                .ok_or_else(|| SwarmError::Internal(format!("ready unit {} not pending", id)))?;
            dispatched.push(pending.unit);
        }
        if !dispatched.is_empty() {
            tracing::debug!(units = dispatched.len(), "Dispatching work units");
        }
        Ok(dispatched)
    }

    fn mark_finished(&mut self, target: &Target) -> Result<()> {
        if !self.scheduled.contains(target) {
            return Err(SwarmError::UnknownTarget(target.to_string()));
        }
        if !self.finished.insert(target.clone()) {
            tracing::warn!(target = %target, "Ignoring repeated finish report");
            return Ok(());
        }
        if let Some(unit_ids) = self.dependent_units.get(target) {
            for id in unit_ids {
                if let Some(unit) = self.pending.get_mut(id) {
                    unit.unsatisfied = unit.unsatisfied.saturating_sub(1);
                    if unit.unsatisfied == 0 {
                        self.ready.push_back(*id);
                    }
                }
            }
        }
        Ok(())
    }

    /// True once every work unit has been handed out. Targets may still
    /// be building; completion additionally needs [`Self::all_targets_finished`].
    pub fn is_fully_dispatched(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn all_targets_finished(&self) -> bool {
        self.finished.len() == self.scheduled.len()
    }

    pub fn is_scheduled(&self, target: &Target) -> bool {
        self.scheduled.contains(target)
    }

    pub fn scheduled_count(&self) -> usize {
        self.scheduled.len()
    }

    pub fn finished_count(&self) -> usize {
        self.finished.len()
    }

    pub fn pruned_targets(&self) -> &[Target] {
        &self.pruned
    }

    /// Scheduled plus pruned, i.e. every target this build accounts for.
    pub fn total_targets(&self) -> usize {
        self.scheduled.len() + self.pruned.len()
    }

    /// Percentage of targets either finished or pruned. Drives the
    /// most-rules-finished signal for the local build race.
    pub fn percent_finished(&self) -> u32 {
        let total = self.total_targets();
        if total == 0 {
            return 100;
        }
        ((self.finished.len() + self.pruned.len()) * 100 / total) as u32
    }
}
