use std::collections::{HashMap, HashSet};
use std::time::Instant;

use crate::graph::Target;
use crate::scheduler::WorkUnit;

/// Liveness and in-flight work for one minion.
#[derive(Debug)]
pub struct MinionRecord {
    pub last_heartbeat: Instant,
    pub units: Vec<WorkUnit>,
}

impl MinionRecord {
    fn new() -> Self {
        Self {
            last_heartbeat: Instant::now(),
            units: Vec::new(),
        }
    }

    pub fn is_alive(&self, timeout_ms: u64) -> bool {
        self.last_heartbeat.elapsed().as_millis() < timeout_ms as u128
    }
}

/// Tracks which minions are alive and which work units each holds, so
/// a dead minion's unfinished units can be handed to someone else.
///
/// Any RPC from a minion counts as a heartbeat; unknown minions are
/// registered on first contact.
#[derive(Debug, Default)]
pub struct MinionHealthTracker {
    minions: HashMap<String, MinionRecord>,
    ever_registered: bool,
}

impl MinionHealthTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a sign of life, registering the minion on first contact.
    pub fn record_heartbeat(&mut self, minion_id: &str) {
        if let Some(record) = self.minions.get_mut(minion_id) {
            record.last_heartbeat = Instant::now();
            return;
        }
        tracing::info!(minion_id = %minion_id, "Minion registered");
        self.ever_registered = true;
        self.minions.insert(minion_id.to_string(), MinionRecord::new());
    }

    /// Remember which units a minion is now responsible for.
    pub fn record_dispatch(&mut self, minion_id: &str, units: &[WorkUnit]) {
        let record = self
            .minions
            .entry(minion_id.to_string())
            .or_insert_with(MinionRecord::new);
        record.units.extend(units.iter().cloned());
    }

    /// Drop minions that missed the heartbeat timeout. Returns each
    /// dead minion together with its units that still contain at least
    /// one unfinished target; fully finished units need no successor.
    pub fn remove_dead(
        &mut self,
        timeout_ms: u64,
        finished: &HashSet<Target>,
    ) -> Vec<(String, Vec<WorkUnit>)> {
        let dead_ids: Vec<String> = self
            .minions
            .iter()
            .filter(|(_, record)| !record.is_alive(timeout_ms))
            .map(|(id, _)| id.clone())
            .collect();

        let mut dead = Vec::new();
        for id in dead_ids {
            if let Some(record) = self.minions.remove(&id) {
                let unfinished: Vec<WorkUnit> = record
                    .units
                    .into_iter()
                    .filter(|unit| unit.targets().iter().any(|t| !finished.contains(t)))
                    .collect();
                dead.push((id, unfinished));
            }
        }
        dead
    }

    pub fn minion_count(&self) -> usize {
        self.minions.len()
    }

    /// True once any minion has ever checked in. Guards the
    /// all-minions-dead verdict against firing before the fleet has
    /// connected at all.
    pub fn ever_registered(&self) -> bool {
        self.ever_registered
    }
}
