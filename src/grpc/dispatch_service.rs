use std::pin::Pin;
use std::sync::Arc;

use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status};

use crate::deployment::convert::{request_to_proto, status_from_proto};
use crate::hub::Hub;
use crate::proto::dispatch_server::Dispatch;
use crate::proto::{DeploymentRequest, DeploymentStatus, GetDeploymentOpts, ReportStatusOpts};

/// Agent-facing API: stream work for a cluster and report progress.
pub struct DispatchService {
    hub: Arc<Hub>,
}

impl DispatchService {
    pub fn new(hub: Arc<Hub>) -> Self {
        Self { hub }
    }
}

type DeploymentsStream =
    Pin<Box<dyn tokio_stream::Stream<Item = Result<DeploymentRequest, Status>> + Send>>;

#[tonic::async_trait]
impl Dispatch for DispatchService {
    type DeploymentsStream = DeploymentsStream;

    async fn deployments(
        &self,
        request: Request<GetDeploymentOpts>,
    ) -> Result<Response<Self::DeploymentsStream>, Status> {
        let opts = request.into_inner();
        if opts.cluster.trim().is_empty() {
            return Err(Status::invalid_argument("cluster required"));
        }

        let mut session = self.hub.dequeue(&opts.cluster, &opts.agent_id).await;

        // The session only claims again once the agent's previous request got its final report.
        let (tx, rx) = tokio::sync::mpsc::channel(1);
        tokio::spawn(async move {
            loop {
                let next = tokio::select! {
                    _ = tx.closed() => break,
                    next = session.next() => next,
                };
                match next {
                    Ok(request) => {
                        if tx.send(Ok(request_to_proto(&request))).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        let _ = tx.send(Err(e.into())).await;
                        break;
                    }
                }
            }
            // Dropping the session requeues whatever the agent left unfinished.
            drop(session);
        });

        let stream = ReceiverStream::new(rx);
        Ok(Response::new(Box::pin(stream) as Self::DeploymentsStream))
    }

    async fn report_status(
        &self,
        request: Request<DeploymentStatus>,
    ) -> Result<Response<ReportStatusOpts>, Status> {
        let status = status_from_proto(request.into_inner())?;
        let ack = self.hub.report_status(status).await?;
        Ok(Response::new(ReportStatusOpts {
            continue_reporting: ack.continue_reporting,
        }))
    }
}
