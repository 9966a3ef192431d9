use std::net::SocketAddr;

use tokio_util::sync::CancellationToken;
use tonic::transport::Server;

use crate::config::TlsConfig;
use crate::error::{Result, SwarmError};
use crate::grpc::service::CoordinatorGrpcService;
use crate::proto::coordinator_service_server::CoordinatorServiceServer;
use crate::tls::TlsIdentity;

pub struct GrpcServer {
    addr: SocketAddr,
    tls: TlsConfig,
    service: CoordinatorGrpcService,
}

impl GrpcServer {
    pub fn new(addr: SocketAddr, tls: TlsConfig, service: CoordinatorGrpcService) -> Self {
        Self { addr, tls, service }
    }

    /// Serve until `token` is cancelled.
    pub async fn run(self, token: CancellationToken) -> Result<()> {
        let mut builder = Server::builder();

        if self.tls.is_complete() {
            let identity = TlsIdentity::load(&self.tls).await?;
            builder = builder.tls_config(identity.server_tls_config())?;
            tracing::info!(addr = %self.addr, "Starting coordinator gRPC server with mTLS");
        } else if self.tls.enabled {
            if !self.tls.allow_insecure {
                return Err(SwarmError::Config(
                    "TLS enabled but certificate paths are missing".to_string(),
                ));
            }
            tracing::warn!(
                addr = %self.addr,
                "TLS enabled but not fully configured, serving plaintext"
            );
        } else {
            tracing::info!(addr = %self.addr, "Starting coordinator gRPC server");
        }

        builder
            .add_service(CoordinatorServiceServer::new(self.service))
            .serve_with_shutdown(self.addr, token.cancelled_owned())
            .await?;
        Ok(())
    }
}
