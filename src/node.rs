//! Process wiring for the coordinator side.
//!
//! `CoordinatorNode` assembles the coordinator core, its event
//! pipeline, and the background loops, and exposes the hooks the CLI
//! and in-process minions attach to.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::build_id::BuildId;
use crate::cache::{ArtifactUploader, CacheStatusOracle};
use crate::config::CoordinatorConfig;
use crate::coordinator::{Coordinator, ExitState};
use crate::error::Result;
use crate::events::{EventManager, SystemClock};
use crate::graph::{DependencyGraph, Target};
use crate::grpc::{BroadcastPublisher, CoordinatorGrpcService, GrpcServer};
use crate::minion::{BuildCompletionChecker, CoordinatorConnection};
use crate::race::RemoteBuildNotifier;
use crate::scheduler::{build_work_queue, WorkUnit};

pub struct CoordinatorNode {
    config: CoordinatorConfig,
    graph: Arc<DependencyGraph>,
    coordinator: Arc<Coordinator>,
    events: Arc<EventManager>,
    publisher: BroadcastPublisher,
}

impl CoordinatorNode {
    pub fn new(
        config: CoordinatorConfig,
        graph: DependencyGraph,
        notifier: Arc<dyn RemoteBuildNotifier>,
    ) -> Self {
        let publisher = BroadcastPublisher::new(1024);
        let events = Arc::new(EventManager::new(
            Arc::new(SystemClock),
            Arc::new(publisher.clone()),
            config.event_publish_margin_ms,
        ));
        let graph = Arc::new(graph);
        let coordinator = Arc::new(Coordinator::new(
            BuildId::generate(),
            config.clone(),
            graph.clone(),
            events.clone(),
            notifier,
        ));
        Self {
            config,
            graph,
            coordinator,
            events,
            publisher,
        }
    }

    pub fn coordinator(&self) -> Arc<Coordinator> {
        self.coordinator.clone()
    }

    pub fn events(&self) -> Arc<EventManager> {
        self.events.clone()
    }

    pub fn build_id(&self) -> &BuildId {
        self.coordinator.build_id()
    }

    /// Start queue preparation and the background loops:
    ///
    /// 1. Queue construction (cache classification, pruning, chaining)
    ///    runs off the async runtime; minions polling in the meantime
    ///    get empty batches.
    /// 2. The event flush loop republishes finish events once aged.
    /// 3. The dead-minion sweep reclaims work from silent minions.
    /// 4. An exit monitor force-flushes events when the build fails or
    ///    is cancelled. On success the margin still applies and the
    ///    flush loop drains the tail on its normal cadence.
    pub fn start(
        &self,
        oracle: Arc<dyn CacheStatusOracle>,
        uploader: Arc<dyn ArtifactUploader>,
        token: &CancellationToken,
    ) {
        let coordinator = self.coordinator.clone();
        let graph = self.graph.clone();
        let events = self.events.clone();
        tokio::task::spawn_blocking(move || {
            match build_work_queue(&graph, oracle.as_ref(), events.as_ref(), uploader.as_ref()) {
                Ok(queue) => coordinator.install_queue(queue),
                Err(e) => {
                    tracing::error!(error = %e, "Work queue construction failed");
                    coordinator.fail_preparation(format!("Could not prepare the build: {}", e));
                }
            }
        });

        let events = self.events.clone();
        let flush_token = token.clone();
        let flush_interval = self.config.event_flush_interval_ms;
        tokio::spawn(async move {
            events.run_flush_loop(flush_interval, flush_token).await;
        });

        let coordinator = self.coordinator.clone();
        let sweep_token = token.clone();
        let sweep_interval = self.config.dead_minion_check_interval_ms;
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_millis(sweep_interval.max(1)));
            let mut exit_rx = coordinator.subscribe_exit();
            loop {
                tokio::select! {
                    _ = sweep_token.cancelled() => break,
                    _ = exit_rx.changed() => {
                        if exit_rx.borrow().is_some() {
                            break;
                        }
                    }
                    _ = tick.tick() => coordinator.check_dead_minions(),
                }
            }
        });

        let coordinator = self.coordinator.clone();
        let events = self.events.clone();
        let monitor_token = token.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = monitor_token.cancelled() => {}
                exit = coordinator.wait_for_exit() => {
                    if !exit.is_success() {
                        events.flush_all();
                    }
                }
            }
        });
    }

    /// Run the gRPC surface until `token` is cancelled.
    pub async fn serve(&self, token: CancellationToken) -> Result<()> {
        let service =
            CoordinatorGrpcService::new(self.coordinator.clone(), self.publisher.sender());
        let server = GrpcServer::new(self.config.listen_addr, self.config.tls.clone(), service);
        server.run(token).await
    }

    /// Direct connection for minions living in this process.
    pub fn in_process_connection(&self) -> Arc<InProcessConnection> {
        Arc::new(InProcessConnection {
            coordinator: self.coordinator.clone(),
        })
    }

    pub fn completion_checker(&self) -> Arc<CoordinatorOutcomeChecker> {
        Arc::new(CoordinatorOutcomeChecker {
            coordinator: self.coordinator.clone(),
        })
    }

    pub async fn wait_for_exit(&self) -> ExitState {
        self.coordinator.wait_for_exit().await
    }
}

/// CoordinatorConnection for minions sharing the coordinator's
/// process. Same build id discipline as the gRPC path.
pub struct InProcessConnection {
    coordinator: Arc<Coordinator>,
}

#[tonic::async_trait]
impl CoordinatorConnection for InProcessConnection {
    async fn request_work_units(
        &self,
        build_id: &BuildId,
        minion_id: &str,
        max_units: usize,
        finished: &[Target],
    ) -> Result<(Vec<WorkUnit>, bool)> {
        self.coordinator.ensure_build(build_id.as_str())?;
        self.coordinator
            .request_work_units(minion_id, max_units, finished)
    }

    async fn report_target_started(
        &self,
        build_id: &BuildId,
        minion_id: &str,
        target: &Target,
    ) -> Result<bool> {
        self.coordinator.ensure_build(build_id.as_str())?;
        self.coordinator.report_target_started(minion_id, target)
    }

    async fn report_target_finished(
        &self,
        build_id: &BuildId,
        minion_id: &str,
        target: &Target,
        success: bool,
    ) -> Result<bool> {
        self.coordinator.ensure_build(build_id.as_str())?;
        self.coordinator
            .report_target_finished(minion_id, target, success)
    }

    async fn heartbeat(&self, build_id: &BuildId, minion_id: &str) -> Result<bool> {
        self.coordinator.ensure_build(build_id.as_str())?;
        Ok(self.coordinator.heartbeat(minion_id))
    }
}

/// Lets embedded minions notice the build reached a terminal state
/// without waiting for their next poll response.
pub struct CoordinatorOutcomeChecker {
    coordinator: Arc<Coordinator>,
}

#[tonic::async_trait]
impl BuildCompletionChecker for CoordinatorOutcomeChecker {
    async fn is_finished(&self) -> bool {
        self.coordinator.exit_state().is_some()
    }
}
