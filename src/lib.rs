pub mod agent;
pub mod api;
pub mod auth;
pub mod client;
pub mod config;
pub mod deployment;
pub mod error;
pub mod grpc;
pub mod hub;
pub mod node;
pub mod shutdown;
pub mod store;
pub mod telemetry;
pub mod tls;

// Re-export generated protobuf types
pub mod proto {
    tonic::include_proto!("deploy");
}
