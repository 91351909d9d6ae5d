use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::{Stream, StreamExt};
use tonic::service::interceptor::InterceptedService;
use tonic::transport::Channel;
use tonic::Status;

use crate::auth::BearerToken;
use crate::config::TlsConfig;
use crate::deployment::convert::{request_from_proto, status_to_proto};
use crate::deployment::{DeploymentRequest, DeploymentStatus};
use crate::grpc::channel::{connect_lazy, ConnectError};
use crate::hub::{Hub, ReportAck};
use crate::proto::dispatch_client::DispatchClient;
use crate::proto::GetDeploymentOpts;

pub type DeploymentStream = Pin<Box<dyn Stream<Item = Result<DeploymentRequest, Status>> + Send>>;

/// What a cluster agent needs from the hub.
#[async_trait]
pub trait DispatchApi: Send + Sync {
    /// Stream of work for `cluster`, in queue order, until the connection drops.
    async fn deployments(&self, cluster: &str, agent_id: &str) -> Result<DeploymentStream, Status>;

    async fn report_status(&self, status: &DeploymentStatus) -> Result<ReportAck, Status>;
}

#[derive(Clone)]
pub struct GrpcDispatchApi {
    client: DispatchClient<InterceptedService<Channel, BearerToken>>,
}

impl GrpcDispatchApi {
    pub fn new(channel: Channel, token: BearerToken) -> Self {
        Self {
            client: DispatchClient::with_interceptor(channel, token),
        }
    }

    pub async fn connect(
        server: &str,
        tls: &TlsConfig,
        auth_token: Option<&str>,
    ) -> Result<Self, ConnectError> {
        let channel = connect_lazy(server, tls).await?;
        let token = BearerToken::new(auth_token).map_err(|_| ConnectError::InvalidToken)?;
        Ok(Self::new(channel, token))
    }
}

#[async_trait]
impl DispatchApi for GrpcDispatchApi {
    async fn deployments(&self, cluster: &str, agent_id: &str) -> Result<DeploymentStream, Status> {
        let mut client = self.client.clone();
        let stream = client
            .deployments(GetDeploymentOpts {
                cluster: cluster.to_string(),
                agent_id: agent_id.to_string(),
            })
            .await?
            .into_inner();
        Ok(Box::pin(
            stream.map(|item| item.and_then(request_from_proto)),
        ))
    }

    async fn report_status(&self, status: &DeploymentStatus) -> Result<ReportAck, Status> {
        let mut client = self.client.clone();
        let ack = client
            .report_status(status_to_proto(status))
            .await?
            .into_inner();
        Ok(ReportAck {
            continue_reporting: ack.continue_reporting,
        })
    }
}

/// [`DispatchApi`] on a [`Hub`] in the same process.
#[derive(Clone)]
pub struct LocalDispatchApi {
    hub: Arc<Hub>,
}

impl LocalDispatchApi {
    pub fn new(hub: Arc<Hub>) -> Self {
        Self { hub }
    }
}

#[async_trait]
impl DispatchApi for LocalDispatchApi {
    async fn deployments(&self, cluster: &str, agent_id: &str) -> Result<DeploymentStream, Status> {
        let mut session = self.hub.dequeue(cluster, agent_id).await;
        let (tx, rx) = tokio::sync::mpsc::channel(1);
        tokio::spawn(async move {
            loop {
                let next = tokio::select! {
                    _ = tx.closed() => break,
                    next = session.next() => next,
                };
                let item = next.map_err(Status::from);
                let failed = item.is_err();
                if tx.send(item).await.is_err() || failed {
                    break;
                }
            }
        });
        Ok(Box::pin(ReceiverStream::new(rx)))
    }

    async fn report_status(&self, status: &DeploymentStatus) -> Result<ReportAck, Status> {
        Ok(self.hub.report_status(status.clone()).await?)
    }
}
