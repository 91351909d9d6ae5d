use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::transport::Server;

use crate::auth::{self, AuthInterceptor};
use crate::config::HubConfig;
use crate::error::Result;
use crate::grpc::deploy_service::DeployService;
use crate::grpc::dispatch_service::DispatchService;
use crate::hub::Hub;
use crate::proto::deploy_server::DeployServer;
use crate::proto::dispatch_server::DispatchServer;
use crate::tls::TlsIdentity;

pub struct GrpcServer {
    config: HubConfig,
    hub: Arc<Hub>,
    tls_identity: Option<TlsIdentity>,
}

impl GrpcServer {
    pub fn new(config: HubConfig, hub: Arc<Hub>, tls_identity: Option<TlsIdentity>) -> Self {
        Self {
            config,
            hub,
            tls_identity,
        }
    }

    /// Bind the configured address and serve until `shutdown` fires.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let listener = TcpListener::bind(self.config.listen_addr).await?;
        self.serve(listener, shutdown).await
    }

    /// Serve on an already bound listener. Tests bind port 0 and read the address back.
    pub async fn serve(self, listener: TcpListener, shutdown: CancellationToken) -> Result<()> {
        let interceptor = AuthInterceptor::new(auth::from_config(&self.config.auth));
        let deploy = DeployServer::with_interceptor(
            DeployService::new(self.hub.clone()),
            interceptor.clone(),
        );
        let dispatch =
            DispatchServer::with_interceptor(DispatchService::new(self.hub.clone()), interceptor);

        let mut builder = Server::builder();
        if let Some(tls) = &self.tls_identity {
            builder = builder.tls_config(tls.server_tls_config())?;
        }

        tracing::info!(
            addr = ?listener.local_addr().ok(),
            tls = self.tls_identity.is_some(),
            auth = self.config.auth.is_enabled(),
            "Starting gRPC server"
        );

        builder
            .add_service(deploy)
            .add_service(dispatch)
            .serve_with_incoming_shutdown(TcpListenerStream::new(listener), async move {
                shutdown.cancelled().await
            })
            .await?;

        tracing::info!("gRPC server stopped");
        Ok(())
    }
}
