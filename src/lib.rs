pub mod build_id;
pub mod cache;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod events;
pub mod executor;
pub mod graph;
pub mod grpc;
pub mod minion;
pub mod node;
pub mod race;
pub mod scheduler;
pub mod shutdown;
pub mod tls;

// Re-export generated protobuf types
pub mod proto {
    tonic::include_proto!("coordinator");
}

pub use error::{Result, SwarmError};
