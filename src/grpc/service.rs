use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::broadcast;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status};

use crate::coordinator::Coordinator;
use crate::error::SwarmError;
use crate::events::BuildRulePublisher;
use crate::graph::Target;
use crate::proto;
use crate::proto::coordinator_service_server::CoordinatorService;
use crate::scheduler::WorkUnit;

/// Publisher that fans rule lifecycle events out to gRPC watchers.
///
/// Sits behind the EventManager, so finished events arrive here only
/// after the synchronization margin. A send with no watchers is fine.
#[derive(Clone)]
pub struct BroadcastPublisher {
    event_tx: broadcast::Sender<proto::BuildEvent>,
}

impl BroadcastPublisher {
    pub fn new(capacity: usize) -> Self {
        let (event_tx, _) = broadcast::channel(capacity);
        Self { event_tx }
    }

    pub fn sender(&self) -> broadcast::Sender<proto::BuildEvent> {
        self.event_tx.clone()
    }

    fn send_batch(&self, targets: &[Target], kind: proto::EventKind) {
        let timestamp_ms = chrono::Utc::now().timestamp_millis();
        for target in targets {
            let _ = self.event_tx.send(proto::BuildEvent {
                target: target.to_string(),
                kind: kind as i32,
                timestamp_ms,
            });
        }
        tracing::debug!(count = targets.len(), kind = ?kind, "Published rule events");
    }
}

impl BuildRulePublisher for BroadcastPublisher {
    fn targets_started(&self, targets: &[Target]) -> crate::error::Result<()> {
        self.send_batch(targets, proto::EventKind::Started);
        Ok(())
    }

    fn targets_finished(&self, targets: &[Target]) -> crate::error::Result<()> {
        self.send_batch(targets, proto::EventKind::Finished);
        Ok(())
    }
}

/// gRPC surface of the coordinator. Validates the build id on every
/// request, then hands off to the coordinator core.
pub struct CoordinatorGrpcService {
    coordinator: Arc<Coordinator>,
    event_tx: broadcast::Sender<proto::BuildEvent>,
}

impl CoordinatorGrpcService {
    pub fn new(
        coordinator: Arc<Coordinator>,
        event_tx: broadcast::Sender<proto::BuildEvent>,
    ) -> Self {
        Self {
            coordinator,
            event_tx,
        }
    }
}

type EventStream = Pin<Box<dyn tokio_stream::Stream<Item = Result<proto::BuildEvent, Status>> + Send>>;

#[tonic::async_trait]
impl CoordinatorService for CoordinatorGrpcService {
    type WatchBuildEventsStream = EventStream;

    async fn request_work_units(
        &self,
        request: Request<proto::RequestWorkUnitsRequest>,
    ) -> Result<Response<proto::RequestWorkUnitsResponse>, Status> {
        let req = request.into_inner();
        self.coordinator
            .ensure_build(&req.build_id)
            .map_err(error_to_status)?;

        let finished: Vec<Target> = req.finished_targets.into_iter().map(Target::from).collect();
        let (units, continue_polling) = self
            .coordinator
            .request_work_units(&req.minion_id, req.max_units as usize, &finished)
            .map_err(error_to_status)?;

        Ok(Response::new(proto::RequestWorkUnitsResponse {
            work_units: units.into_iter().map(work_unit_to_proto).collect(),
            continue_polling,
        }))
    }

    async fn report_target_started(
        &self,
        request: Request<proto::ReportTargetStartedRequest>,
    ) -> Result<Response<proto::ReportAck>, Status> {
        let req = request.into_inner();
        self.coordinator
            .ensure_build(&req.build_id)
            .map_err(error_to_status)?;

        let target = Target::from(req.target);
        let continue_polling = self
            .coordinator
            .report_target_started(&req.minion_id, &target)
            .map_err(error_to_status)?;

        Ok(Response::new(proto::ReportAck { continue_polling }))
    }

    async fn report_target_finished(
        &self,
        request: Request<proto::ReportTargetFinishedRequest>,
    ) -> Result<Response<proto::ReportAck>, Status> {
        let req = request.into_inner();
        self.coordinator
            .ensure_build(&req.build_id)
            .map_err(error_to_status)?;

        let target = Target::from(req.target);
        let continue_polling = self
            .coordinator
            .report_target_finished(&req.minion_id, &target, req.success)
            .map_err(error_to_status)?;

        Ok(Response::new(proto::ReportAck { continue_polling }))
    }

    async fn heartbeat(
        &self,
        request: Request<proto::HeartbeatRequest>,
    ) -> Result<Response<proto::HeartbeatResponse>, Status> {
        let req = request.into_inner();
        self.coordinator
            .ensure_build(&req.build_id)
            .map_err(error_to_status)?;

        let continue_polling = self.coordinator.heartbeat(&req.minion_id);
        Ok(Response::new(proto::HeartbeatResponse { continue_polling }))
    }

    async fn watch_build_events(
        &self,
        request: Request<proto::WatchBuildEventsRequest>,
    ) -> Result<Response<Self::WatchBuildEventsStream>, Status> {
        let req = request.into_inner();
        self.coordinator
            .ensure_build(&req.build_id)
            .map_err(error_to_status)?;

        let mut events = self.event_tx.subscribe();
        let (tx, rx) = tokio::sync::mpsc::channel(32);

        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => {
                        if tx.send(Ok(event)).await.is_err() {
                            // Watcher disconnected
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Event watcher fell behind, events dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        let stream = ReceiverStream::new(rx);
        Ok(Response::new(Box::pin(stream) as Self::WatchBuildEventsStream))
    }
}

fn work_unit_to_proto(unit: WorkUnit) -> proto::WorkUnit {
    proto::WorkUnit {
        targets: unit
            .into_targets()
            .into_iter()
            .map(|t| t.to_string())
            .collect(),
    }
}

fn error_to_status(e: SwarmError) -> Status {
    match e {
        SwarmError::BuildIdMismatch { .. } => Status::failed_precondition(e.to_string()),
        SwarmError::UnknownTarget(_) | SwarmError::InvalidBuildId(_) | SwarmError::InvalidGraph(_) => {
            Status::invalid_argument(e.to_string())
        }
        other => Status::internal(other.to_string()),
    }
}
