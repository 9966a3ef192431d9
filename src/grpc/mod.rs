pub mod client;
pub mod server;
pub mod service;

pub use client::GrpcCoordinatorConnection;
pub use server::GrpcServer;
pub use service::{BroadcastPublisher, CoordinatorGrpcService};
