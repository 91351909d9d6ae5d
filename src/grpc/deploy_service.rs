use std::pin::Pin;
use std::sync::Arc;

use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status};

use crate::deployment::convert::{parse_id, request_from_proto, status_to_proto};
use crate::hub::Hub;
use crate::proto::deploy_server::Deploy;
use crate::proto::{DeploymentRequest, DeploymentStatus, StatusRequest};

/// Client-facing API: submit deployments and watch their status.
pub struct DeployService {
    hub: Arc<Hub>,
}

impl DeployService {
    pub fn new(hub: Arc<Hub>) -> Self {
        Self { hub }
    }
}

type StatusStream =
    Pin<Box<dyn tokio_stream::Stream<Item = Result<DeploymentStatus, Status>> + Send>>;

#[tonic::async_trait]
impl Deploy for DeployService {
    type StatusStream = StatusStream;

    async fn deploy(
        &self,
        request: Request<DeploymentRequest>,
    ) -> Result<Response<DeploymentStatus>, Status> {
        let req = request_from_proto(request.into_inner())?;
        let status = self.hub.submit(req).await?;
        Ok(Response::new(status_to_proto(&status)))
    }

    async fn status(
        &self,
        request: Request<StatusRequest>,
    ) -> Result<Response<Self::StatusStream>, Status> {
        let req = request.into_inner();
        let id = parse_id(&req.request_id)?;
        let mut subscription = self.hub.subscribe(id).await;

        tracing::debug!(
            deployment_id = %id,
            trace_parent = %req.trace_parent,
            "Watcher subscribed"
        );

        let (tx, rx) = tokio::sync::mpsc::channel(16);
        tokio::spawn(async move {
            loop {
                let next = tokio::select! {
                    _ = tx.closed() => {
                        tracing::debug!(deployment_id = %id, "Watcher disconnected");
                        break;
                    }
                    next = subscription.next() => next,
                };
                let Some(status) = next else {
                    break;
                };
                if tx.send(Ok(status_to_proto(&status))).await.is_err() {
                    break;
                }
            }
        });

        let stream = ReceiverStream::new(rx);
        Ok(Response::new(Box::pin(stream) as Self::StatusStream))
    }
}
