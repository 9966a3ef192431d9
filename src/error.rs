use thiserror::Error;

#[derive(Error, Debug)]
pub enum SwarmError {
    #[error("Unknown target: {0}")]
    UnknownTarget(String),

    #[error("Dependency cycle through target: {0}")]
    DependencyCycle(String),

    #[error("Invalid graph: {0}")]
    InvalidGraph(String),

    #[error("Invalid build id: {0}")]
    InvalidBuildId(String),

    #[error("Build id mismatch: expected {expected}, got {got}")]
    BuildIdMismatch { expected: String, got: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Build execution failed for {target}: {reason}")]
    Execution { target: String, reason: String },

    #[error("Event publish error: {0}")]
    Publish(String),

    #[error("Cache status lookup failed: {0}")]
    CacheLookup(String),

    #[error("TLS error: {0}")]
    Tls(#[from] crate::tls::TlsError),

    #[error("gRPC error: {0}")]
    Grpc(#[from] tonic::Status),

    #[error("Transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, SwarmError>;
