pub mod node;
pub mod persist;
pub mod rpc;
pub mod state;
pub mod timer;
pub mod transport;

pub use node::{ApplyMsg, RaftNode, RaftStatus};
pub use persist::{FilePersister, MemoryPersister, Persister};
pub use state::{LogEntry, RaftRole, RaftState};
pub use transport::Transport;
