pub mod config;
pub mod dashboard;
pub mod error;
pub mod grpc;
pub mod node;
pub mod raft;
pub mod shutdown;
pub mod state_machine;

/// In-process network used by the integration tests.
pub mod testing;

// Re-export generated protobuf types
pub mod proto {
    tonic::include_proto!("raft");
}
