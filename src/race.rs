//! Race between the local build and the distributed build.
//!
//! While the fleet builds, the client can run the same build locally.
//! Whichever side finishes first wins; if the distributed build merely
//! gets *most* rules done, the racer is stopped and a second local
//! build runs in lockstep with the remote one, fetching finished
//! artifacts instead of rebuilding them.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::coordinator::ExitState;
use crate::error::Result;
use crate::graph::Target;

/// Signals raised by the coordinator as the distributed build makes
/// progress. The race side (and through it the local build engine)
/// listens on these.
pub trait RemoteBuildNotifier: Send + Sync {
    fn signal_rule_started(&self, target: &Target);
    fn signal_rule_completed(&self, target: &Target);
    fn signal_most_rules_finished(&self);
    fn signal_remote_build_completed(&self);
}

/// Notifier for builds with nothing racing against them.
pub struct NoopNotifier;

impl RemoteBuildNotifier for NoopNotifier {
    fn signal_rule_started(&self, _target: &Target) {}
    fn signal_rule_completed(&self, _target: &Target) {}
    fn signal_most_rules_finished(&self) {}
    fn signal_remote_build_completed(&self) {}
}

/// Latched notifier state the race phases wait on.
///
/// Every signal bumps a watch channel, so waiters re-check conditions
/// without lost wakeups.
pub struct RaceSignals {
    most_rules_finished: AtomicBool,
    remote_build_completed: AtomicBool,
    started_rules: Mutex<HashSet<Target>>,
    completed_rules: Mutex<HashSet<Target>>,
    version: watch::Sender<u64>,
}

impl RaceSignals {
    pub fn new() -> Self {
        let (version, _) = watch::channel(0);
        Self {
            most_rules_finished: AtomicBool::new(false),
            remote_build_completed: AtomicBool::new(false),
            started_rules: Mutex::new(HashSet::new()),
            completed_rules: Mutex::new(HashSet::new()),
            version,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.version.subscribe()
    }

    pub fn most_rules_finished(&self) -> bool {
        self.most_rules_finished.load(Ordering::SeqCst)
    }

    pub fn remote_build_completed(&self) -> bool {
        self.remote_build_completed.load(Ordering::SeqCst)
    }

    pub fn is_rule_completed(&self, target: &Target) -> bool {
        self.lock(&self.completed_rules).contains(target)
    }

    pub fn completed_rule_count(&self) -> usize {
        self.lock(&self.completed_rules).len()
    }

    pub fn started_rule_count(&self) -> usize {
        self.lock(&self.started_rules).len()
    }

    fn bump(&self) {
        self.version.send_modify(|v| *v += 1);
    }

    fn lock<'a>(
        &self,
        set: &'a Mutex<HashSet<Target>>,
    ) -> std::sync::MutexGuard<'a, HashSet<Target>> {
        set.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for RaceSignals {
    fn default() -> Self {
        Self::new()
    }
}

impl RemoteBuildNotifier for RaceSignals {
    fn signal_rule_started(&self, target: &Target) {
        self.lock(&self.started_rules).insert(target.clone());
        self.bump();
    }

    fn signal_rule_completed(&self, target: &Target) {
        self.lock(&self.completed_rules).insert(target.clone());
        self.bump();
    }

    fn signal_most_rules_finished(&self) {
        self.most_rules_finished.store(true, Ordering::SeqCst);
        self.bump();
    }

    fn signal_remote_build_completed(&self) {
        self.remote_build_completed.store(true, Ordering::SeqCst);
        self.bump();
    }
}

/// The race side's view of the distributed build: watch its exit state,
/// cancel it when the local build makes it moot.
pub trait RemoteBuildHandle: Send + Sync {
    fn subscribe_exit(&self) -> watch::Receiver<Option<ExitState>>;
    fn cancel(&self, reason: &str);
}

impl RemoteBuildHandle for crate::coordinator::Coordinator {
    fn subscribe_exit(&self) -> watch::Receiver<Option<ExitState>> {
        self.subscribe_exit()
    }

    fn cancel(&self, reason: &str) {
        self.cancel(reason)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalBuildMode {
    /// Full local build racing the fleet from scratch.
    Racing,
    /// Local build running after most rules finished remotely,
    /// fetching remote artifacts as they appear.
    Synchronized,
}

/// Runs one local build. The real build engine sits behind this seam;
/// tests and the CLI provide their own.
#[tonic::async_trait]
pub trait LocalBuildRunner: Send + Sync {
    /// Returns the local build's exit code. Implementations should
    /// return promptly once `token` is cancelled.
    async fn run_local_build(&self, mode: LocalBuildMode, token: CancellationToken) -> Result<i32>;
}

/// One spawned local build with its cancellation token and result slot.
struct LocalBuild {
    token: CancellationToken,
    result_rx: watch::Receiver<Option<i32>>,
}

impl LocalBuild {
    fn spawn(runner: Arc<dyn LocalBuildRunner>, mode: LocalBuildMode) -> Self {
        let (result_tx, result_rx) = watch::channel(None);
        let token = CancellationToken::new();
        let task_token = token.clone();
        tokio::spawn(async move {
            let code = match runner.run_local_build(mode, task_token).await {
                Ok(code) => code,
                Err(e) => {
                    tracing::warn!(error = %e, "Local build runner failed");
                    1
                }
            };
            let _ = result_tx.send(Some(code));
        });
        Self { token, result_rx }
    }

    fn result(&mut self) -> Option<i32> {
        *self.result_rx.borrow_and_update()
    }

    fn cancel(&self) {
        self.token.cancel();
    }

    async fn wait(&mut self) -> i32 {
        loop {
            if let Some(code) = *self.result_rx.borrow_and_update() {
                return code;
            }
            if self.result_rx.changed().await.is_err() {
                return 1;
            }
        }
    }
}

/// What the racing phase settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RacePhaseResult {
    /// The race fully decided the build; this is the final exit code.
    Decided(i32),
    /// Proceed to the synchronized phase.
    Undecided,
}

/// First phase of a two-stage client build: a local build races the
/// fleet until one of them finishes or most remote rules are done.
pub struct RacingBuildPhase {
    remote: Arc<dyn RemoteBuildHandle>,
    signals: Arc<RaceSignals>,
    runner: Arc<dyn LocalBuildRunner>,
    local_fallback: bool,
}

impl RacingBuildPhase {
    pub fn new(
        remote: Arc<dyn RemoteBuildHandle>,
        signals: Arc<RaceSignals>,
        runner: Arc<dyn LocalBuildRunner>,
        local_fallback: bool,
    ) -> Self {
        Self {
            remote,
            signals,
            runner,
            local_fallback,
        }
    }

    /// Wait until something settles the race. Conditions are re-checked
    /// in a fixed order on every wakeup; the local build finishing
    /// always takes precedence, the most-rules signal is the most
    /// general and is checked last.
    pub async fn run(&self) -> RacePhaseResult {
        let mut local = LocalBuild::spawn(self.runner.clone(), LocalBuildMode::Racing);
        let mut exit_rx = self.remote.subscribe_exit();
        let mut signal_rx = self.signals.subscribe();

        loop {
            // Mark the current signal version as seen before checking
            // conditions, so a bump landing mid-check still wakes the
            // select below.
            let _ = signal_rx.borrow_and_update();

            if let Some(code) = local.result() {
                tracing::info!(code, "Local build finished before the distributed build");
                self.remote
                    .cancel("Local build finished before the distributed build");
                return RacePhaseResult::Decided(code);
            }

            let remote_exit = exit_rx.borrow_and_update().clone();
            if let Some(exit) = remote_exit {
                if exit.is_success() {
                    tracing::warn!(
                        "Distributed build finished before the local racing build; stopping the racer"
                    );
                    local.cancel();
                    local.wait().await;
                    return RacePhaseResult::Undecided;
                }
                if self.local_fallback {
                    tracing::warn!(
                        code = exit.code,
                        "Distributed build failed, falling back to the local build"
                    );
                    let code = local.wait().await;
                    return RacePhaseResult::Decided(code);
                }
                tracing::error!(code = exit.code, message = %exit.message, "Distributed build failed");
                local.cancel();
                local.wait().await;
                return RacePhaseResult::Decided(exit.code);
            }

            if self.signals.most_rules_finished() {
                tracing::info!(
                    "Most rules finished remotely, stopping the racer for a synchronized build"
                );
                local.cancel();
                local.wait().await;
                return RacePhaseResult::Undecided;
            }

            tokio::select! {
                changed = local.result_rx.changed() => {
                    if changed.is_err() {
                        return RacePhaseResult::Decided(1);
                    }
                }
                _ = exit_rx.changed() => {}
                _ = signal_rx.changed() => {}
            }
        }
    }
}

/// Second phase: the local build runs to completion alongside the
/// remote one, fetching remote artifacts. The remote build is only
/// load-bearing here if the local build dies.
pub struct SynchronizedBuildPhase {
    remote: Arc<dyn RemoteBuildHandle>,
    runner: Arc<dyn LocalBuildRunner>,
    local_fallback: bool,
}

impl SynchronizedBuildPhase {
    pub fn new(
        remote: Arc<dyn RemoteBuildHandle>,
        runner: Arc<dyn LocalBuildRunner>,
        local_fallback: bool,
    ) -> Self {
        Self {
            remote,
            runner,
            local_fallback,
        }
    }

    pub async fn run(&self) -> i32 {
        let mut local = LocalBuild::spawn(self.runner.clone(), LocalBuildMode::Synchronized);
        let mut exit_rx = self.remote.subscribe_exit();

        loop {
            if let Some(code) = local.result() {
                if exit_rx.borrow().is_none() {
                    self.remote
                        .cancel("Local build finished before the distributed build");
                }
                return code;
            }

            let remote_exit = exit_rx.borrow_and_update().clone();
            if let Some(exit) = remote_exit {
                if exit.is_success() {
                    // Local build keeps going, fetching the finished
                    // remote artifacts.
                    return local.wait().await;
                }
                if self.local_fallback {
                    tracing::warn!(
                        code = exit.code,
                        "Distributed build failed, local build continues without it"
                    );
                    return local.wait().await;
                }
                tracing::error!(code = exit.code, message = %exit.message, "Distributed build failed");
                local.cancel();
                local.wait().await;
                return exit.code;
            }

            tokio::select! {
                changed = local.result_rx.changed() => {
                    if changed.is_err() {
                        return 1;
                    }
                }
                _ = exit_rx.changed() => {}
            }
        }
    }
}

/// Client-side build driver: optional racing phase, then a
/// synchronized phase when the race did not settle the build.
pub struct BuildController {
    remote: Arc<dyn RemoteBuildHandle>,
    signals: Arc<RaceSignals>,
    runner: Arc<dyn LocalBuildRunner>,
    racing_enabled: bool,
    local_fallback: bool,
}

impl BuildController {
    pub fn new(
        remote: Arc<dyn RemoteBuildHandle>,
        signals: Arc<RaceSignals>,
        runner: Arc<dyn LocalBuildRunner>,
        racing_enabled: bool,
        local_fallback: bool,
    ) -> Self {
        Self {
            remote,
            signals,
            runner,
            racing_enabled,
            local_fallback,
        }
    }

    pub async fn build(&self) -> ExitState {
        if self.racing_enabled {
            let racing = RacingBuildPhase::new(
                self.remote.clone(),
                self.signals.clone(),
                self.runner.clone(),
                self.local_fallback,
            );
            if let RacePhaseResult::Decided(code) = racing.run().await {
                return Self::exit_from_code(code);
            }
        }

        let synchronized = SynchronizedBuildPhase::new(
            self.remote.clone(),
            self.runner.clone(),
            self.local_fallback,
        );
        let code = synchronized.run().await;
        Self::exit_from_code(code)
    }

    fn exit_from_code(code: i32) -> ExitState {
        if code == 0 {
            ExitState::success("Build finished")
        } else {
            ExitState {
                code,
                message: format!("Build failed with exit code {}", code),
            }
        }
    }
}
