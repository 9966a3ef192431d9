//! Build-wide scheduling brain.
//!
//! One `Coordinator` exists per distributed build. It owns the work
//! queue, answers minion polls, tracks minion liveness, republishes
//! rule lifecycle events, and settles the final exit state everything
//! else (CLI, racing controller, joint runner) waits on.

pub mod health;

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::watch;

use crate::build_id::BuildId;
use crate::config::CoordinatorConfig;
use crate::error::{Result, SwarmError};
use crate::events::EventManager;
use crate::graph::{DependencyGraph, Target};
use crate::race::RemoteBuildNotifier;
use crate::scheduler::{WorkQueue, WorkUnit};

use health::MinionHealthTracker;

/// Final status of a distributed build: process-style exit code plus a
/// human-readable reason.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitState {
    pub code: i32,
    pub message: String,
}

impl ExitState {
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            code: 0,
            message: message.into(),
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            code: 1,
            message: message.into(),
        }
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self {
            code: 2,
            message: message.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.code == 0
    }
}

/// Coarse outcome for completion checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildOutcome {
    InProgress,
    Succeeded,
    Failed,
}

/// Progress counters, readable in every phase and after failure.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BuildProgress {
    pub total: usize,
    pub scheduled: usize,
    pub started: usize,
    pub finished: usize,
    pub failed: usize,
    pub pruned: usize,
}

enum Phase {
    /// Queue construction (cache classification) still running. Minions
    /// already poll and get empty batches with `continue_polling`.
    Preparing,
    Distributing,
    Done,
}

struct CoreState {
    phase: Phase,
    queue: Option<WorkQueue>,
    /// Whole units reclaimed from dead minions, served before fresh
    /// dequeues.
    redispatch: VecDeque<WorkUnit>,
    health: MinionHealthTracker,
    started: HashSet<Target>,
    /// Global finish dedup. Reports arrive at least once per target
    /// (report RPC plus poll piggyback, and again after re-dispatch);
    /// only the first one reaches the queue and the event stream.
    finished: HashSet<Target>,
    failed: HashSet<Target>,
    most_rules_signaled: bool,
}

/// Deferred side effects of a state change, applied after the state
/// lock is released so event publication never runs under it.
#[derive(Default)]
struct SideEffects {
    started_events: Vec<Target>,
    finished_events: Vec<Target>,
    started_signals: Vec<Target>,
    completed_signals: Vec<Target>,
    most_rules: bool,
    remote_completed: bool,
}

pub struct Coordinator {
    build_id: BuildId,
    config: CoordinatorConfig,
    graph: Arc<DependencyGraph>,
    events: Arc<EventManager>,
    notifier: Arc<dyn RemoteBuildNotifier>,
    state: Mutex<CoreState>,
    exit_tx: watch::Sender<Option<ExitState>>,
}

impl Coordinator {
    pub fn new(
        build_id: BuildId,
        config: CoordinatorConfig,
        graph: Arc<DependencyGraph>,
        events: Arc<EventManager>,
        notifier: Arc<dyn RemoteBuildNotifier>,
    ) -> Self {
        let (exit_tx, _) = watch::channel(None);
        Self {
            build_id,
            config,
            graph,
            events,
            notifier,
            state: Mutex::new(CoreState {
                phase: Phase::Preparing,
                queue: None,
                redispatch: VecDeque::new(),
                health: MinionHealthTracker::new(),
                started: HashSet::new(),
                finished: HashSet::new(),
                failed: HashSet::new(),
                most_rules_signaled: false,
            }),
            exit_tx,
        }
    }

    pub fn build_id(&self) -> &BuildId {
        &self.build_id
    }

    /// Reject requests carrying a foreign build id.
    pub fn ensure_build(&self, build_id: &str) -> Result<()> {
        if build_id != self.build_id.as_str() {
            return Err(SwarmError::BuildIdMismatch {
                expected: self.build_id.to_string(),
                got: build_id.to_string(),
            });
        }
        Ok(())
    }

    /// Install the constructed work queue and go live. Called once by
    /// the preparation task; minions polling in the meantime received
    /// empty batches.
    pub fn install_queue(&self, queue: WorkQueue) {
        let mut fx = SideEffects::default();
        let mut state = self.lock_state();
        if !matches!(state.phase, Phase::Preparing) {
            tracing::warn!("Ignoring queue install outside the preparation phase");
            drop(state);
            return;
        }

        fx.completed_signals
            .extend(queue.pruned_targets().iter().cloned());
        let percent = queue.percent_finished();
        let complete = queue.is_fully_dispatched() && queue.all_targets_finished();
        tracing::info!(
            scheduled = queue.scheduled_count(),
            pruned = queue.pruned_targets().len(),
            "Work queue ready, entering distribution phase"
        );
        state.queue = Some(queue);
        state.phase = Phase::Distributing;

        if !state.most_rules_signaled && percent >= self.config.most_rules_percent {
            state.most_rules_signaled = true;
            fx.most_rules = true;
        }
        if complete {
            // Everything was served from caches.
            self.finish_locked(
                &mut state,
                &mut fx,
                ExitState::success("All targets were satisfied by caches"),
            );
        }
        drop(state);
        self.apply(fx);
    }

    /// Abort the build because the queue could not be constructed.
    pub fn fail_preparation(&self, reason: String) {
        let mut fx = SideEffects::default();
        let mut state = self.lock_state();
        self.finish_locked(&mut state, &mut fx, ExitState::failure(reason));
        drop(state);
        self.apply(fx);
    }

    /// Minion poll: absorb piggybacked finish reports, then hand out up
    /// to `max_units` units (re-dispatched units from dead minions
    /// first). The returned flag tells the minion whether to keep
    /// polling.
    pub fn request_work_units(
        &self,
        minion_id: &str,
        max_units: usize,
        finished: &[Target],
    ) -> Result<(Vec<WorkUnit>, bool)> {
        let mut fx = SideEffects::default();
        let mut state = self.lock_state();
        state.health.record_heartbeat(minion_id);

        let result = match state.phase {
            Phase::Preparing => Ok((Vec::new(), true)),
            Phase::Done => Ok((Vec::new(), false)),
            Phase::Distributing => {
                self.dispatch_locked(&mut state, minion_id, max_units, finished, &mut fx)
            }
        };
        drop(state);
        self.apply(fx);
        result
    }

    fn dispatch_locked(
        &self,
        state: &mut CoreState,
        minion_id: &str,
        max_units: usize,
        finished: &[Target],
        fx: &mut SideEffects,
    ) -> Result<(Vec<WorkUnit>, bool)> {
        let reports: Vec<(Target, bool)> = finished.iter().map(|t| (t.clone(), true)).collect();
        self.ingest_finished_locked(state, minion_id, &reports, fx)?;
        if matches!(state.phase, Phase::Done) {
            return Ok((Vec::new(), false));
        }

        let mut units: Vec<WorkUnit> = Vec::new();
        while units.len() < max_units {
            let Some(unit) = state.redispatch.pop_front() else {
                break;
            };
            // Fully finished by now: the presumed-dead owner's reports
            // landed after the sweep. Nothing left to run.
            if unit.targets().iter().all(|t| state.finished.contains(t)) {
                tracing::debug!(targets = unit.len(), "Discarding fully finished orphaned unit");
                continue;
            }
            tracing::info!(
                minion_id = %minion_id,
                targets = unit.len(),
                "Re-dispatching orphaned work unit"
            );
            units.push(unit);
        }
        self.evaluate_completion_locked(state, fx);
        if matches!(state.phase, Phase::Done) {
            return Ok((units, false));
        }
        if units.len() < max_units {
            let queue = state
                .queue
                .as_mut()
                .ok_or_else(|| SwarmError::Internal("distributing without a work queue".into()))?;
            let fresh =
                queue.dequeue_zero_dependency_work_units(&[], max_units - units.len())?;
            units.extend(fresh);
        }
        state.health.record_dispatch(minion_id, &units);
        Ok((units, true))
    }

    /// A minion began building a target. Deduplicated per target so a
    /// re-dispatched unit does not replay lifecycle events.
    pub fn report_target_started(&self, minion_id: &str, target: &Target) -> Result<bool> {
        let mut fx = SideEffects::default();
        let mut state = self.lock_state();
        state.health.record_heartbeat(minion_id);

        let keep_polling = match state.phase {
            Phase::Done => false,
            Phase::Preparing => {
                return Err(SwarmError::Internal(format!(
                    "started report for {} before any work was dispatched",
                    target
                )))
            }
            Phase::Distributing => {
                let scheduled = state
                    .queue
                    .as_ref()
                    .map(|q| q.is_scheduled(target))
                    .unwrap_or(false);
                if !scheduled {
                    return Err(SwarmError::UnknownTarget(target.to_string()));
                }
                if state.started.insert(target.clone()) {
                    fx.started_events.push(target.clone());
                    fx.started_signals.push(target.clone());
                } else {
                    tracing::debug!(target = %target, minion_id = %minion_id, "Duplicate started report");
                }
                true
            }
        };
        drop(state);
        self.apply(fx);
        Ok(keep_polling)
    }

    /// A minion finished (or failed) a target.
    pub fn report_target_finished(
        &self,
        minion_id: &str,
        target: &Target,
        success: bool,
    ) -> Result<bool> {
        let mut fx = SideEffects::default();
        let mut state = self.lock_state();
        state.health.record_heartbeat(minion_id);

        let keep_polling = match state.phase {
            Phase::Done => false,
            Phase::Preparing => {
                return Err(SwarmError::Internal(format!(
                    "finish report for {} before any work was dispatched",
                    target
                )))
            }
            Phase::Distributing => {
                let reports = [(target.clone(), success)];
                self.ingest_finished_locked(&mut state, minion_id, &reports, &mut fx)?;
                !matches!(state.phase, Phase::Done)
            }
        };
        drop(state);
        self.apply(fx);
        Ok(keep_polling)
    }

    /// Liveness ping. Returns whether the minion should keep polling.
    pub fn heartbeat(&self, minion_id: &str) -> bool {
        let mut state = self.lock_state();
        state.health.record_heartbeat(minion_id);
        !matches!(state.phase, Phase::Done)
    }

    /// Sweep for minions past the heartbeat timeout; their unfinished
    /// units go to the re-dispatch pool. When every known minion is
    /// gone mid-distribution there is nobody left to run the pool, so
    /// the build fails.
    pub fn check_dead_minions(&self) {
        let mut fx = SideEffects::default();
        let mut state = self.lock_state();
        if !matches!(state.phase, Phase::Distributing) {
            drop(state);
            return;
        }

        let st = &mut *state;
        let dead = st
            .health
            .remove_dead(self.config.heartbeat_timeout_ms, &st.finished);
        for (minion_id, units) in dead {
            tracing::warn!(
                minion_id = %minion_id,
                units = units.len(),
                "Minion presumed dead, reclaiming its work"
            );
            st.redispatch.extend(units);
        }
        // Success is re-checked first: with every target finished a
        // dead fleet no longer matters.
        self.evaluate_completion_locked(st, &mut fx);
        if st.health.ever_registered() && st.health.minion_count() == 0 {
            self.finish_locked(st, &mut fx, ExitState::failure("All minions are dead"));
        }
        drop(state);
        self.apply(fx);
    }

    /// Abort the build from outside, e.g. because the local racing
    /// build already won.
    pub fn cancel(&self, reason: &str) {
        let mut fx = SideEffects::default();
        let mut state = self.lock_state();
        self.finish_locked(&mut state, &mut fx, ExitState::cancelled(reason));
        drop(state);
        self.apply(fx);
    }

    pub fn outcome(&self) -> BuildOutcome {
        match self.exit_state() {
            None => BuildOutcome::InProgress,
            Some(exit) if exit.is_success() => BuildOutcome::Succeeded,
            Some(_) => BuildOutcome::Failed,
        }
    }

    pub fn exit_state(&self) -> Option<ExitState> {
        self.exit_tx.borrow().clone()
    }

    pub fn subscribe_exit(&self) -> watch::Receiver<Option<ExitState>> {
        self.exit_tx.subscribe()
    }

    /// Block until the build reaches a terminal state.
    pub async fn wait_for_exit(&self) -> ExitState {
        let mut rx = self.exit_tx.subscribe();
        loop {
            if let Some(exit) = rx.borrow_and_update().clone() {
                return exit;
            }
            if rx.changed().await.is_err() {
                return ExitState::failure("Coordinator dropped before finishing");
            }
        }
    }

    pub fn progress(&self) -> BuildProgress {
        let state = self.lock_state();
        let mut progress = BuildProgress {
            started: state.started.len(),
            failed: state.failed.len(),
            ..BuildProgress::default()
        };
        if let Some(queue) = state.queue.as_ref() {
            progress.total = queue.total_targets();
            progress.scheduled = queue.scheduled_count();
            progress.finished = queue.finished_count();
            progress.pruned = queue.pruned_targets().len();
        }
        progress
    }

    pub fn minion_count(&self) -> usize {
        self.lock_state().health.minion_count()
    }

    /// Shared ingest path for finish reports from both the report RPC
    /// and the poll piggyback list.
    fn ingest_finished_locked(
        &self,
        state: &mut CoreState,
        minion_id: &str,
        reports: &[(Target, bool)],
        fx: &mut SideEffects,
    ) -> Result<()> {
        // Structural validation first, so bad reports poison nothing.
        if let Some(queue) = state.queue.as_ref() {
            for (target, _) in reports {
                if !queue.is_scheduled(target) {
                    let message = format!("Finish report for unscheduled target {}", target);
                    self.finish_locked(state, fx, ExitState::failure(message));
                    return Err(SwarmError::UnknownTarget(target.to_string()));
                }
            }
        }

        let mut newly: Vec<Target> = Vec::new();
        for (target, success) in reports {
            if state.finished.contains(target) {
                tracing::debug!(target = %target, minion_id = %minion_id, "Duplicate finish report");
                continue;
            }
            if !*success {
                state.failed.insert(target.clone());
                if !self.graph.is_best_effort(target) {
                    let message = format!("Target {} failed on minion {}", target, minion_id);
                    tracing::error!(target = %target, minion_id = %minion_id, "Target failed, failing the build");
                    self.finish_locked(state, fx, ExitState::failure(message));
                    continue;
                }
                tracing::warn!(target = %target, "Best-effort target failed, continuing");
            }
            state.finished.insert(target.clone());
            newly.push(target.clone());
        }
        if !newly.is_empty() {
            if let Some(queue) = state.queue.as_mut() {
                // Records the finishes and unlocks dependent units; the
                // zero max dispatches nothing here.
                queue.dequeue_zero_dependency_work_units(&newly, 0)?;
            }
            fx.finished_events.extend(newly.iter().cloned());
            fx.completed_signals.extend(newly);
        }
        self.evaluate_completion_locked(state, fx);
        Ok(())
    }

    /// Progress-driven transitions: the most-rules signal and the
    /// success terminal state. Re-checked after every ingest and every
    /// re-dispatch pool change, not just on fresh finishes: a pooled
    /// unit whose targets all finished in the meantime (its presumed-
    /// dead minion reported after the sweep) must not hold the build
    /// open.
    fn evaluate_completion_locked(&self, state: &mut CoreState, fx: &mut SideEffects) {
        if matches!(state.phase, Phase::Done) {
            return;
        }
        let (percent, complete) = match state.queue.as_ref() {
            Some(queue) => (
                queue.percent_finished(),
                queue.is_fully_dispatched() && queue.all_targets_finished(),
            ),
            None => return,
        };
        if !state.most_rules_signaled && percent >= self.config.most_rules_percent {
            state.most_rules_signaled = true;
            tracing::info!(percent, "Most build rules finished");
            fx.most_rules = true;
        }
        if complete {
            // With every target finished, anything still pooled is a
            // leftover copy and cannot name unfinished work.
            let finished = &state.finished;
            state
                .redispatch
                .retain(|unit| unit.targets().iter().any(|t| !finished.contains(t)));
            if state.redispatch.is_empty() {
                self.finish_locked(state, fx, ExitState::success("All targets built"));
            }
        }
    }

    /// Terminal transition; the first one wins. On success the event
    /// manager is told the build is complete so the final flush is
    /// clean.
    fn finish_locked(&self, state: &mut CoreState, fx: &mut SideEffects, exit: ExitState) {
        if matches!(state.phase, Phase::Done) {
            return;
        }
        state.phase = Phase::Done;
        if exit.is_success() {
            self.events.record_all_finished();
            fx.remote_completed = true;
        }
        tracing::info!(code = exit.code, message = %exit.message, "Distributed build finished");
        let _ = self.exit_tx.send(Some(exit));
    }

    fn apply(&self, fx: SideEffects) {
        self.events.record_started(&fx.started_events);
        self.events.record_finished(&fx.finished_events);
        for target in &fx.started_signals {
            self.notifier.signal_rule_started(target);
        }
        for target in &fx.completed_signals {
            self.notifier.signal_rule_completed(target);
        }
        if fx.most_rules {
            self.notifier.signal_most_rules_finished();
        }
        if fx.remote_completed {
            self.notifier.signal_remote_build_completed();
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, CoreState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
