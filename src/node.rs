use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::api::{run_api, ApiState};
use crate::config::HubConfig;
use crate::error::Result;
use crate::grpc::GrpcServer;
use crate::hub::Hub;
use crate::store::{DeploymentStore, MemoryStore, PersistenceSink};
use crate::tls::TlsIdentity;

/// A running hub process: gRPC services, the reaper, and the optional HTTP API.
pub struct HubNode {
    pub config: HubConfig,
    pub hub: Arc<Hub>,
}

impl HubNode {
    /// Hub backed by an in-memory audit store. Must be called within a tokio runtime.
    pub fn new(config: HubConfig) -> Self {
        Self::with_store(config, Arc::new(MemoryStore::new()))
    }

    pub fn with_store(config: HubConfig, store: Arc<dyn DeploymentStore>) -> Self {
        let sink = PersistenceSink::spawn(store);
        let hub = Arc::new(Hub::with_persistence(config.clone(), sink));
        Self { config, hub }
    }

    /// Run every subsystem until `shutdown` fires.
    ///
    /// 1. Loads TLS material if configured (or falls back to plaintext when allowed)
    /// 2. Spawns the reaper
    /// 3. Spawns the HTTP API if an address is configured
    /// 4. Runs the gRPC server (blocking)
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let listener = TcpListener::bind(self.config.listen_addr).await?;
        self.serve(listener, shutdown).await
    }

    pub async fn serve(self, listener: TcpListener, shutdown: CancellationToken) -> Result<()> {
        let tls_identity = self.load_tls().await?;

        let hub = self.hub.clone();
        let reap_interval = self.config.reap_interval;
        let reaper_shutdown = shutdown.clone();
        tokio::spawn(async move {
            Self::reaper_loop(hub, reap_interval, reaper_shutdown).await;
        });

        if let Some(api_addr) = self.config.api_addr {
            let state = ApiState {
                hub: self.hub.clone(),
            };
            let api_shutdown = shutdown.clone();
            tokio::spawn(async move {
                run_api(api_addr, state, api_shutdown).await;
            });
        }

        GrpcServer::new(self.config.clone(), self.hub.clone(), tls_identity)
            .serve(listener, shutdown)
            .await
    }

    async fn load_tls(&self) -> Result<Option<TlsIdentity>> {
        let tls = &self.config.tls;
        if !tls.enabled {
            return Ok(None);
        }
        match TlsIdentity::load(tls).await {
            Ok(identity) => {
                tracing::info!("TLS enabled for gRPC server");
                Ok(Some(identity))
            }
            Err(e) if tls.allow_insecure => {
                tracing::warn!(error = %e, "TLS material unusable, running in plaintext");
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Periodically drop finished deployments past retention.
    async fn reaper_loop(hub: Arc<Hub>, every: Duration, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(every.max(Duration::from_millis(1)));
        // The first tick completes immediately.
        interval.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    hub.reap().await;
                }
            }
        }
    }
}
