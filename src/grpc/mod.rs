pub mod channel;
pub mod deploy_service;
pub mod dispatch_service;
pub mod server;

pub use deploy_service::DeployService;
pub use dispatch_service::DispatchService;
pub use server::GrpcServer;
