pub mod client_service;
pub mod cluster_service;
mod convert;
pub mod server;
pub mod transport;

pub use server::GrpcServer;
pub use transport::GrpcTransport;
