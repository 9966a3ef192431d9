//! Minion: polls the coordinator for work units and builds them.
//!
//! One poll loop per minion. Each dispatched WorkUnit runs as its own
//! task, building targets strictly in the unit's order; the poll loop
//! keeps requesting work for however many slots are free. Finished
//! targets are reported individually and also ride along on the next
//! poll, so a lost report never strands the build.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::build_id::BuildId;
use crate::config::MinionConfig;
use crate::error::Result;
use crate::executor::BuildExecutor;
use crate::graph::Target;
use crate::scheduler::WorkUnit;

const REPORT_ATTEMPTS: u32 = 3;

/// Everything a minion needs from the coordinator. Implemented over
/// gRPC for real deployments and directly on the coordinator for
/// in-process minions.
///
/// The returned booleans mean "keep polling": false tells the minion
/// the build reached a terminal state.
#[tonic::async_trait]
pub trait CoordinatorConnection: Send + Sync {
    async fn request_work_units(
        &self,
        build_id: &BuildId,
        minion_id: &str,
        max_units: usize,
        finished: &[Target],
    ) -> Result<(Vec<WorkUnit>, bool)>;

    async fn report_target_started(
        &self,
        build_id: &BuildId,
        minion_id: &str,
        target: &Target,
    ) -> Result<bool>;

    async fn report_target_finished(
        &self,
        build_id: &BuildId,
        minion_id: &str,
        target: &Target,
        success: bool,
    ) -> Result<bool>;

    async fn heartbeat(&self, build_id: &BuildId, minion_id: &str) -> Result<bool>;
}

/// Side channel telling an embedded minion the overall build is done.
#[tonic::async_trait]
pub trait BuildCompletionChecker: Send + Sync {
    async fn is_finished(&self) -> bool;
}

/// Standalone minions have no side channel; they poll until the
/// coordinator tells them to stop.
pub struct NoCompletionSignal;

#[tonic::async_trait]
impl BuildCompletionChecker for NoCompletionSignal {
    async fn is_finished(&self) -> bool {
        false
    }
}

pub struct Minion {
    config: MinionConfig,
    build_id: BuildId,
    connection: Arc<dyn CoordinatorConnection>,
    executor: Arc<dyn BuildExecutor>,
    completion: Arc<dyn BuildCompletionChecker>,
}

impl Minion {
    pub fn new(
        config: MinionConfig,
        build_id: BuildId,
        connection: Arc<dyn CoordinatorConnection>,
        executor: Arc<dyn BuildExecutor>,
        completion: Arc<dyn BuildCompletionChecker>,
    ) -> Self {
        Self {
            config,
            build_id,
            connection,
            executor,
            completion,
        }
    }

    /// Poll until the coordinator reports the build finished, the
    /// completion checker fires, or `token` is cancelled. In-flight
    /// units are drained before returning.
    pub async fn run(&self, token: CancellationToken) -> Result<()> {
        tracing::info!(
            minion_id = %self.config.minion_id,
            build_id = %self.build_id,
            "Minion starting"
        );

        let mut poll =
            tokio::time::interval(Duration::from_millis(self.config.poll_interval_ms.max(1)));
        let (done_tx, mut done_rx) = mpsc::unbounded_channel::<Target>();
        let in_flight = Arc::new(AtomicUsize::new(0));
        let mut finished: Vec<Target> = Vec::new();

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    tracing::info!(minion_id = %self.config.minion_id, "Minion shutting down");
                    break;
                }
                _ = poll.tick() => {
                    while let Ok(target) = done_rx.try_recv() {
                        finished.push(target);
                    }

                    if self.completion.is_finished().await {
                        tracing::info!(minion_id = %self.config.minion_id, "Build finished, stopping poll loop");
                        break;
                    }

                    let free = self
                        .config
                        .max_parallel_units
                        .saturating_sub(in_flight.load(Ordering::SeqCst));
                    match self
                        .connection
                        .request_work_units(
                            &self.build_id,
                            &self.config.minion_id,
                            free,
                            &finished,
                        )
                        .await
                    {
                        Ok((units, keep_polling)) => {
                            finished.clear();
                            for unit in units {
                                self.spawn_unit(unit, done_tx.clone(), in_flight.clone());
                            }
                            if !keep_polling {
                                tracing::info!(minion_id = %self.config.minion_id, "Coordinator reports build complete");
                                break;
                            }
                        }
                        Err(e) => {
                            // Finished targets stay buffered for the retry.
                            tracing::warn!(
                                minion_id = %self.config.minion_id,
                                error = %e,
                                "Work request failed, backing off"
                            );
                            self.jitter_sleep().await;
                        }
                    }
                }
            }
        }

        self.drain(&mut done_rx, &mut finished, &in_flight, &token)
            .await;
        Ok(())
    }

    /// Run one work unit to completion in its own task. Targets build
    /// strictly in order. Whether to keep going after a failed target
    /// is the coordinator's call: its finish-report response says
    /// whether the build is still live.
    fn spawn_unit(
        &self,
        unit: WorkUnit,
        done_tx: mpsc::UnboundedSender<Target>,
        in_flight: Arc<AtomicUsize>,
    ) {
        in_flight.fetch_add(1, Ordering::SeqCst);
        let connection = self.connection.clone();
        let executor = self.executor.clone();
        let build_id = self.build_id.clone();
        let minion_id = self.config.minion_id.clone();
        let retry_jitter_ms = self.config.retry_jitter_ms;

        tokio::spawn(async move {
            let targets = unit.into_targets();
            tracing::debug!(
                minion_id = %minion_id,
                targets = targets.len(),
                "Starting work unit"
            );

            for target in targets {
                if let Err(e) = connection
                    .report_target_started(&build_id, &minion_id, &target)
                    .await
                {
                    tracing::warn!(target = %target, error = %e, "Could not report target start");
                }

                let success = match executor.build_target(&target).await {
                    Ok(outcome) => outcome.success,
                    Err(e) => {
                        tracing::warn!(target = %target, error = %e, "Build could not run");
                        false
                    }
                };

                let keep_going = report_finished_with_retry(
                    connection.as_ref(),
                    &build_id,
                    &minion_id,
                    &target,
                    success,
                    retry_jitter_ms,
                )
                .await;

                if success {
                    // Also rides along on the next poll; the
                    // coordinator deduplicates.
                    let _ = done_tx.send(target);
                }

                if !keep_going {
                    tracing::info!(
                        minion_id = %minion_id,
                        "Build no longer live, abandoning remainder of work unit"
                    );
                    break;
                }
            }

            in_flight.fetch_sub(1, Ordering::SeqCst);
        });
    }

    /// Wait out in-flight units, heartbeating so the coordinator does
    /// not declare us dead, then hand over any undelivered finishes.
    async fn drain(
        &self,
        done_rx: &mut mpsc::UnboundedReceiver<Target>,
        finished: &mut Vec<Target>,
        in_flight: &AtomicUsize,
        token: &CancellationToken,
    ) {
        while in_flight.load(Ordering::SeqCst) > 0 && !token.is_cancelled() {
            if let Err(e) = self
                .connection
                .heartbeat(&self.build_id, &self.config.minion_id)
                .await
            {
                tracing::debug!(error = %e, "Heartbeat failed during drain");
            }
            tokio::time::sleep(Duration::from_millis(self.config.poll_interval_ms.max(1))).await;
        }

        while let Ok(target) = done_rx.try_recv() {
            finished.push(target);
        }
        if !finished.is_empty() {
            if let Err(e) = self
                .connection
                .request_work_units(&self.build_id, &self.config.minion_id, 0, finished)
                .await
            {
                tracing::warn!(error = %e, "Could not deliver final finished targets");
            }
        }
        tracing::info!(minion_id = %self.config.minion_id, "Minion drained");
    }

    async fn jitter_sleep(&self) {
        let jitter = rand::thread_rng().gen_range(0..=self.config.retry_jitter_ms.max(1));
        tokio::time::sleep(Duration::from_millis(jitter)).await;
    }
}

/// Finish reports are load-bearing for failed targets (successes also
/// piggyback on polls), so give them a few attempts.
async fn report_finished_with_retry(
    connection: &dyn CoordinatorConnection,
    build_id: &BuildId,
    minion_id: &str,
    target: &Target,
    success: bool,
    retry_jitter_ms: u64,
) -> bool {
    for attempt in 1..=REPORT_ATTEMPTS {
        match connection
            .report_target_finished(build_id, minion_id, target, success)
            .await
        {
            Ok(keep_polling) => return keep_polling,
            Err(e) => {
                tracing::warn!(
                    target = %target,
                    attempt,
                    error = %e,
                    "Could not report target finish"
                );
                let jitter = rand::thread_rng().gen_range(0..=retry_jitter_ms.max(1));
                tokio::time::sleep(Duration::from_millis(jitter)).await;
            }
        }
    }
    // Out of attempts. A successful finish still reaches the
    // coordinator on the next poll; assume the build is live.
    true
}
