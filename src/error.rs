use thiserror::Error;

#[derive(Error, Debug)]
pub enum RaftError {
    #[error("Not the leader, current leader is node {0:?}")]
    NotLeader(Option<u64>),

    #[error("Node has been shut down")]
    Shutdown,

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Persistence failure: {0}")]
    Persistence(String),

    #[error("Codec error: {0}")]
    Codec(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("gRPC error: {0}")]
    Grpc(#[from] tonic::Status),

    #[error("Transport setup error: {0}")]
    TransportSetup(#[from] tonic::transport::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl RaftError {
    /// Errors after which the peer must not keep serving.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Persistence(_) | Self::Shutdown)
    }
}

impl From<serde_json::Error> for RaftError {
    fn from(e: serde_json::Error) -> Self {
        Self::Codec(e.to_string())
    }
}

impl From<RaftError> for tonic::Status {
    fn from(e: RaftError) -> Self {
        match e {
            RaftError::NotLeader(_) => tonic::Status::failed_precondition(e.to_string()),
            RaftError::InvalidArgument(msg) => tonic::Status::invalid_argument(msg),
            RaftError::Shutdown => tonic::Status::unavailable(e.to_string()),
            RaftError::Grpc(status) => status,
            other => tonic::Status::internal(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, RaftError>;
