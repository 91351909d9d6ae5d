use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::{Stream, StreamExt};
use tonic::service::interceptor::InterceptedService;
use tonic::transport::Channel;
use tonic::Status;
use uuid::Uuid;

use crate::auth::BearerToken;
use crate::config::ClientConfig;
use crate::deployment::convert::{request_to_proto, status_from_proto};
use crate::deployment::{DeploymentRequest, DeploymentStatus};
use crate::grpc::channel::{connect_lazy, ConnectError};
use crate::hub::Hub;
use crate::proto::deploy_client::DeployClient;
use crate::proto::StatusRequest;

pub type StatusStream = Pin<Box<dyn Stream<Item = Result<DeploymentStatus, Status>> + Send>>;

/// What a submitting client needs from the hub.
#[async_trait]
pub trait DeployApi: Send + Sync {
    async fn deploy(&self, request: &DeploymentRequest) -> Result<DeploymentStatus, Status>;

    async fn status(&self, id: Uuid, trace_parent: &str) -> Result<StatusStream, Status>;
}

#[async_trait]
impl<T: DeployApi + ?Sized> DeployApi for Arc<T> {
    async fn deploy(&self, request: &DeploymentRequest) -> Result<DeploymentStatus, Status> {
        (**self).deploy(request).await
    }

    async fn status(&self, id: Uuid, trace_parent: &str) -> Result<StatusStream, Status> {
        (**self).status(id, trace_parent).await
    }
}

/// [`DeployApi`] over gRPC.
#[derive(Clone)]
pub struct GrpcDeployApi {
    client: DeployClient<InterceptedService<Channel, BearerToken>>,
}

impl GrpcDeployApi {
    pub fn new(channel: Channel, token: BearerToken) -> Self {
        Self {
            client: DeployClient::with_interceptor(channel, token),
        }
    }

    pub async fn connect(config: &ClientConfig) -> Result<Self, ConnectError> {
        let channel = connect_lazy(&config.server, &config.tls).await?;
        let token = BearerToken::new(config.auth_token.as_deref())
            .map_err(|_| ConnectError::InvalidToken)?;
        Ok(Self::new(channel, token))
    }
}

#[async_trait]
impl DeployApi for GrpcDeployApi {
    async fn deploy(&self, request: &DeploymentRequest) -> Result<DeploymentStatus, Status> {
        let mut client = self.client.clone();
        let status = client
            .deploy(request_to_proto(request))
            .await?
            .into_inner();
        status_from_proto(status)
    }

    async fn status(&self, id: Uuid, trace_parent: &str) -> Result<StatusStream, Status> {
        let mut client = self.client.clone();
        let stream = client
            .status(StatusRequest {
                request_id: id.to_string(),
                trace_parent: trace_parent.to_string(),
            })
            .await?
            .into_inner();
        let stream = stream.map(|item| item.and_then(status_from_proto));
        Ok(Box::pin(stream))
    }
}

/// [`DeployApi`] calling a [`Hub`] in the same process.
#[derive(Clone)]
pub struct LocalDeployApi {
    hub: Arc<Hub>,
}

impl LocalDeployApi {
    pub fn new(hub: Arc<Hub>) -> Self {
        Self { hub }
    }
}

#[async_trait]
impl DeployApi for LocalDeployApi {
    async fn deploy(&self, request: &DeploymentRequest) -> Result<DeploymentStatus, Status> {
        Ok(self.hub.submit(request.clone()).await?)
    }

    async fn status(&self, id: Uuid, _trace_parent: &str) -> Result<StatusStream, Status> {
        let mut subscription = self.hub.subscribe(id).await;
        let (tx, rx) = tokio::sync::mpsc::channel(16);
        tokio::spawn(async move {
            loop {
                let next = tokio::select! {
                    _ = tx.closed() => break,
                    next = subscription.next() => next,
                };
                match next {
                    Some(status) => {
                        if tx.send(Ok(status)).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
        });
        Ok(Box::pin(ReceiverStream::new(rx)))
    }
}
