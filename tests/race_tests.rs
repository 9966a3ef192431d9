//! Racing and synchronized build-phase tests against scripted local
//! and remote builds.

mod test_harness;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use swarmbuild::coordinator::ExitState;
use swarmbuild::error::Result;
use swarmbuild::race::{
    BuildController, LocalBuildMode, LocalBuildRunner, RacePhaseResult, RaceSignals,
    RacingBuildPhase, RemoteBuildHandle, RemoteBuildNotifier, SynchronizedBuildPhase,
};

use test_harness::assert_eventually;

/// Scripted distributed build: the test decides when and how it exits.
struct FakeRemote {
    exit_tx: watch::Sender<Option<ExitState>>,
    cancels: Mutex<Vec<String>>,
}

impl FakeRemote {
    fn new() -> Arc<Self> {
        let (exit_tx, _) = watch::channel(None);
        Arc::new(Self {
            exit_tx,
            cancels: Mutex::new(Vec::new()),
        })
    }

    fn finish(&self, exit: ExitState) {
        self.exit_tx.send_replace(Some(exit));
    }

    fn cancel_reasons(&self) -> Vec<String> {
        self.cancels.lock().unwrap().clone()
    }
}

impl RemoteBuildHandle for FakeRemote {
    fn subscribe_exit(&self) -> watch::Receiver<Option<ExitState>> {
        self.exit_tx.subscribe()
    }

    fn cancel(&self, reason: &str) {
        self.cancels.lock().unwrap().push(reason.to_string());
    }
}

/// Local build that parks until the test hands it an exit code, or
/// returns a shell-style interrupt code when cancelled.
struct ControlledRunner {
    code_tx: watch::Sender<Option<i32>>,
    cancelled: AtomicUsize,
    modes: Mutex<Vec<LocalBuildMode>>,
}

const CANCEL_CODE: i32 = 130;

impl ControlledRunner {
    fn new() -> Arc<Self> {
        let (code_tx, _) = watch::channel(None);
        Arc::new(Self {
            code_tx,
            cancelled: AtomicUsize::new(0),
            modes: Mutex::new(Vec::new()),
        })
    }

    fn finish_with(&self, code: i32) {
        self.code_tx.send_replace(Some(code));
    }

    fn cancel_count(&self) -> usize {
        self.cancelled.load(Ordering::SeqCst)
    }

    fn modes(&self) -> Vec<LocalBuildMode> {
        self.modes.lock().unwrap().clone()
    }
}

#[tonic::async_trait]
impl LocalBuildRunner for ControlledRunner {
    async fn run_local_build(&self, mode: LocalBuildMode, token: CancellationToken) -> Result<i32> {
        self.modes.lock().unwrap().push(mode);
        let mut rx = self.code_tx.subscribe();
        loop {
            if let Some(code) = *rx.borrow_and_update() {
                return Ok(code);
            }
            tokio::select! {
                _ = token.cancelled() => {
                    self.cancelled.fetch_add(1, Ordering::SeqCst);
                    return Ok(CANCEL_CODE);
                }
                changed = rx.changed() => {
                    if changed.is_err() {
                        return Ok(1);
                    }
                }
            }
        }
    }
}

// =============================================================================
// Racing phase
// =============================================================================

#[tokio::test]
async fn test_local_win_decides_and_cancels_remote() {
    let remote = FakeRemote::new();
    let runner = ControlledRunner::new();
    runner.finish_with(0);

    let phase = RacingBuildPhase::new(
        remote.clone(),
        Arc::new(RaceSignals::new()),
        runner.clone(),
        true,
    );
    assert_eq!(phase.run().await, RacePhaseResult::Decided(0));
    assert_eq!(
        remote.cancel_reasons(),
        vec!["Local build finished before the distributed build"]
    );
    assert_eq!(runner.modes(), vec![LocalBuildMode::Racing]);
    assert_eq!(runner.cancel_count(), 0);
}

#[tokio::test]
async fn test_local_failure_also_decides_the_race() {
    let remote = FakeRemote::new();
    let runner = ControlledRunner::new();
    runner.finish_with(7);

    let phase = RacingBuildPhase::new(
        remote.clone(),
        Arc::new(RaceSignals::new()),
        runner.clone(),
        true,
    );
    // The local verdict is final either way.
    assert_eq!(phase.run().await, RacePhaseResult::Decided(7));
    assert_eq!(remote.cancel_reasons().len(), 1);
}

#[tokio::test]
async fn test_remote_success_stops_racer_undecided() {
    let remote = FakeRemote::new();
    let runner = ControlledRunner::new();
    remote.finish(ExitState::success("All targets built"));

    let phase = RacingBuildPhase::new(
        remote.clone(),
        Arc::new(RaceSignals::new()),
        runner.clone(),
        true,
    );
    assert_eq!(phase.run().await, RacePhaseResult::Undecided);
    assert_eq!(runner.cancel_count(), 1);
    assert!(remote.cancel_reasons().is_empty());
}

#[tokio::test]
async fn test_remote_failure_with_fallback_waits_for_local() {
    let remote = FakeRemote::new();
    let runner = ControlledRunner::new();
    remote.finish(ExitState::failure("All minions are dead"));

    let phase = RacingBuildPhase::new(
        remote.clone(),
        Arc::new(RaceSignals::new()),
        runner.clone(),
        true,
    );
    let handle = tokio::spawn(async move { phase.run().await });

    // The racer keeps building.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!handle.is_finished());
    assert_eq!(runner.cancel_count(), 0);

    runner.finish_with(0);
    assert_eq!(handle.await.unwrap(), RacePhaseResult::Decided(0));
}

#[tokio::test]
async fn test_remote_failure_without_fallback_adopts_remote_code() {
    let remote = FakeRemote::new();
    let runner = ControlledRunner::new();
    remote.finish(ExitState::failure("All minions are dead"));

    let phase = RacingBuildPhase::new(
        remote.clone(),
        Arc::new(RaceSignals::new()),
        runner.clone(),
        false,
    );
    assert_eq!(phase.run().await, RacePhaseResult::Decided(1));
    assert_eq!(runner.cancel_count(), 1);
}

#[tokio::test]
async fn test_most_rules_stops_racer_for_synchronized_phase() {
    let remote = FakeRemote::new();
    let runner = ControlledRunner::new();
    let signals = Arc::new(RaceSignals::new());
    signals.signal_most_rules_finished();

    let phase = RacingBuildPhase::new(remote.clone(), signals, runner.clone(), true);
    assert_eq!(phase.run().await, RacePhaseResult::Undecided);
    assert_eq!(runner.cancel_count(), 1);
    // The distributed build keeps going into the synchronized phase.
    assert!(remote.cancel_reasons().is_empty());
}

#[tokio::test]
async fn test_remote_failure_checked_before_most_rules() {
    let remote = FakeRemote::new();
    let runner = ControlledRunner::new();
    let signals = Arc::new(RaceSignals::new());
    remote.finish(ExitState::failure("fleet lost"));
    signals.signal_most_rules_finished();

    let phase = RacingBuildPhase::new(remote.clone(), signals, runner.clone(), false);
    // A dead distributed build outranks its own most-rules signal.
    assert_eq!(phase.run().await, RacePhaseResult::Decided(1));
    assert_eq!(runner.cancel_count(), 1);
}

// =============================================================================
// Synchronized phase
// =============================================================================

#[tokio::test]
async fn test_synchronized_local_win_cancels_live_remote() {
    let remote = FakeRemote::new();
    let runner = ControlledRunner::new();
    runner.finish_with(0);

    let phase = SynchronizedBuildPhase::new(remote.clone(), runner.clone(), true);
    assert_eq!(phase.run().await, 0);
    assert_eq!(
        remote.cancel_reasons(),
        vec!["Local build finished before the distributed build"]
    );
    assert_eq!(runner.modes(), vec![LocalBuildMode::Synchronized]);
}

#[tokio::test]
async fn test_synchronized_remote_success_waits_for_local() {
    let remote = FakeRemote::new();
    let runner = ControlledRunner::new();
    remote.finish(ExitState::success("All targets built"));

    let phase = SynchronizedBuildPhase::new(remote.clone(), runner.clone(), true);
    let handle = tokio::spawn(async move { phase.run().await });

    // The remote result alone does not end the local build.
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(!handle.is_finished());

    runner.finish_with(0);
    assert_eq!(handle.await.unwrap(), 0);
    // The remote build already exited; there was nothing to cancel.
    assert!(remote.cancel_reasons().is_empty());
}

#[tokio::test]
async fn test_synchronized_remote_failure_with_fallback_continues() {
    let remote = FakeRemote::new();
    let runner = ControlledRunner::new();
    remote.finish(ExitState::failure("fleet lost"));

    let phase = SynchronizedBuildPhase::new(remote.clone(), runner.clone(), true);
    let handle = tokio::spawn(async move { phase.run().await });

    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(!handle.is_finished());
    assert_eq!(runner.cancel_count(), 0);

    runner.finish_with(0);
    assert_eq!(handle.await.unwrap(), 0);
}

#[tokio::test]
async fn test_synchronized_remote_failure_without_fallback_stops_local() {
    let remote = FakeRemote::new();
    let runner = ControlledRunner::new();
    remote.finish(ExitState::failure("fleet lost"));

    let phase = SynchronizedBuildPhase::new(remote.clone(), runner.clone(), false);
    assert_eq!(phase.run().await, 1);
    assert_eq!(runner.cancel_count(), 1);
}

// =============================================================================
// Controller
// =============================================================================

#[tokio::test]
async fn test_controller_skips_racing_when_disabled() {
    let remote = FakeRemote::new();
    let runner = ControlledRunner::new();
    runner.finish_with(0);

    let controller = BuildController::new(
        remote.clone(),
        Arc::new(RaceSignals::new()),
        runner.clone(),
        false,
        true,
    );
    let exit = controller.build().await;
    assert_eq!(exit, ExitState::success("Build finished"));
    assert_eq!(runner.modes(), vec![LocalBuildMode::Synchronized]);
}

#[tokio::test]
async fn test_controller_returns_racing_decision_directly() {
    let remote = FakeRemote::new();
    let runner = ControlledRunner::new();
    runner.finish_with(0);

    let controller = BuildController::new(
        remote.clone(),
        Arc::new(RaceSignals::new()),
        runner.clone(),
        true,
        true,
    );
    let exit = controller.build().await;
    assert_eq!(exit, ExitState::success("Build finished"));
    // The race settled it; no synchronized build ran.
    assert_eq!(runner.modes(), vec![LocalBuildMode::Racing]);
    assert_eq!(remote.cancel_reasons().len(), 1);
}

#[tokio::test]
async fn test_controller_runs_synchronized_after_undecided_race() {
    let remote = FakeRemote::new();
    let runner = ControlledRunner::new();
    let signals = Arc::new(RaceSignals::new());
    signals.signal_most_rules_finished();

    let controller =
        BuildController::new(remote.clone(), signals, runner.clone(), true, true);
    let handle = tokio::spawn(async move { controller.build().await });

    let r = runner.clone();
    assert_eventually(
        || {
            let r = r.clone();
            async move { r.modes().len() == 2 }
        },
        Duration::from_secs(2),
        "synchronized build should start after the undecided race",
    )
    .await;

    runner.finish_with(0);
    assert_eq!(handle.await.unwrap(), ExitState::success("Build finished"));
    assert_eq!(
        runner.modes(),
        vec![LocalBuildMode::Racing, LocalBuildMode::Synchronized]
    );
    assert_eq!(runner.cancel_count(), 1);
}

#[tokio::test]
async fn test_controller_maps_nonzero_code_to_failure() {
    let remote = FakeRemote::new();
    let runner = ControlledRunner::new();
    runner.finish_with(9);

    let controller = BuildController::new(
        remote.clone(),
        Arc::new(RaceSignals::new()),
        runner.clone(),
        false,
        true,
    );
    let exit = controller.build().await;
    assert_eq!(exit.code, 9);
    assert_eq!(exit.message, "Build failed with exit code 9");
    assert!(!exit.is_success());
}
