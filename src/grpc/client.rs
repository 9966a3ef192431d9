use tokio::sync::Mutex;
use tonic::transport::{Channel, Endpoint};

use crate::build_id::BuildId;
use crate::config::TlsConfig;
use crate::error::{Result, SwarmError};
use crate::graph::Target;
use crate::minion::CoordinatorConnection;
use crate::proto;
use crate::proto::coordinator_service_client::CoordinatorServiceClient;
use crate::scheduler::WorkUnit;
use crate::tls::TlsIdentity;

/// Minion-side connection to the coordinator over gRPC.
///
/// The channel is established on first use and cached; a failed call
/// leaves the cache alone since tonic channels reconnect on their own.
pub struct GrpcCoordinatorConnection {
    addr: String,
    tls: TlsConfig,
    client: Mutex<Option<CoordinatorServiceClient<Channel>>>,
}

impl GrpcCoordinatorConnection {
    pub fn new(addr: impl Into<String>, tls: TlsConfig) -> Self {
        Self {
            addr: addr.into(),
            tls,
            client: Mutex::new(None),
        }
    }

    async fn client(&self) -> Result<CoordinatorServiceClient<Channel>> {
        let mut slot = self.client.lock().await;
        if let Some(client) = slot.as_ref() {
            return Ok(client.clone());
        }

        let channel = self.create_channel().await?;
        let client = CoordinatorServiceClient::new(channel);
        *slot = Some(client.clone());
        Ok(client)
    }

    /// Dial the coordinator, with TLS when fully configured.
    async fn create_channel(&self) -> Result<Channel> {
        let use_tls = self.tls.is_complete();
        let uri = if use_tls {
            format!("https://{}", self.addr)
        } else {
            format!("http://{}", self.addr)
        };

        let endpoint = Endpoint::from_shared(uri)
            .map_err(|e| SwarmError::Config(format!("Invalid coordinator address: {}", e)))?;

        let channel = if use_tls {
            let identity = TlsIdentity::load(&self.tls).await?;
            endpoint
                .tls_config(identity.client_tls_config())?
                .connect()
                .await?
        } else {
            endpoint.connect().await?
        };
        Ok(channel)
    }
}

#[tonic::async_trait]
impl CoordinatorConnection for GrpcCoordinatorConnection {
    async fn request_work_units(
        &self,
        build_id: &BuildId,
        minion_id: &str,
        max_units: usize,
        finished: &[Target],
    ) -> Result<(Vec<WorkUnit>, bool)> {
        let mut client = self.client().await?;
        let response = client
            .request_work_units(proto::RequestWorkUnitsRequest {
                build_id: build_id.to_string(),
                minion_id: minion_id.to_string(),
                max_units: max_units as u32,
                finished_targets: finished.iter().map(|t| t.to_string()).collect(),
            })
            .await?;

        let resp = response.into_inner();
        let units = resp.work_units.into_iter().map(proto_to_work_unit).collect();
        Ok((units, resp.continue_polling))
    }

    async fn report_target_started(
        &self,
        build_id: &BuildId,
        minion_id: &str,
        target: &Target,
    ) -> Result<bool> {
        let mut client = self.client().await?;
        let response = client
            .report_target_started(proto::ReportTargetStartedRequest {
                build_id: build_id.to_string(),
                minion_id: minion_id.to_string(),
                target: target.to_string(),
            })
            .await?;
        Ok(response.into_inner().continue_polling)
    }

    async fn report_target_finished(
        &self,
        build_id: &BuildId,
        minion_id: &str,
        target: &Target,
        success: bool,
    ) -> Result<bool> {
        let mut client = self.client().await?;
        let response = client
            .report_target_finished(proto::ReportTargetFinishedRequest {
                build_id: build_id.to_string(),
                minion_id: minion_id.to_string(),
                target: target.to_string(),
                success,
            })
            .await?;
        Ok(response.into_inner().continue_polling)
    }

    async fn heartbeat(&self, build_id: &BuildId, minion_id: &str) -> Result<bool> {
        let mut client = self.client().await?;
        let response = client
            .heartbeat(proto::HeartbeatRequest {
                build_id: build_id.to_string(),
                minion_id: minion_id.to_string(),
            })
            .await?;
        Ok(response.into_inner().continue_polling)
    }
}

fn proto_to_work_unit(unit: proto::WorkUnit) -> WorkUnit {
    WorkUnit::new(unit.targets.into_iter().map(Target::from).collect())
}
