use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;

use crate::config::NodeConfig;
use crate::dashboard::{run_dashboard, DashboardState};
use crate::error::Result;
use crate::grpc::{GrpcServer, GrpcTransport};
use crate::raft::{ApplyMsg, FilePersister, MemoryPersister, Persister, RaftNode};
use crate::state_machine::KvStore;

/// Main node that wires the Raft peer to its transport, storage and the
/// key-value state machine.
pub struct Node {
    pub config: NodeConfig,
    pub raft_node: Arc<RaftNode>,
    pub kv: Arc<RwLock<KvStore>>,
    pub dashboard_addr: Option<SocketAddr>,
    apply_rx: mpsc::Receiver<ApplyMsg>,
}

impl Node {
    pub fn new(config: NodeConfig, dashboard_addr: Option<SocketAddr>) -> Result<Self> {
        let persister: Arc<dyn Persister> = match &config.data_dir {
            Some(dir) => Arc::new(FilePersister::new(dir)?),
            None => Arc::new(MemoryPersister::new()),
        };
        let transport = Arc::new(GrpcTransport::new(&config));
        let (apply_tx, apply_rx) = mpsc::channel(config.apply_channel_capacity);

        let raft_node = RaftNode::new(config.clone(), transport, persister, apply_tx)?;

        Ok(Self {
            config,
            raft_node,
            kv: Arc::new(RwLock::new(KvStore::new())),
            dashboard_addr,
            apply_rx,
        })
    }

    /// Run the node with all components.
    ///
    /// Spawns the Raft peer, the apply loop and the optional dashboard, then
    /// serves gRPC until `shutdown` is cancelled. The Raft peer is killed on
    /// the way out.
    ///
    /// # Errors
    ///
    /// Returns an error if the gRPC server fails to start or encounters a fatal error.
    pub async fn run(
        self,
        shutdown: CancellationToken,
    ) -> std::result::Result<(), Box<dyn std::error::Error>> {
        // A fatal Raft error takes the whole node down
        let raft_shutdown = self.raft_node.shutdown_token();
        let node_shutdown = shutdown.clone();
        tokio::spawn(async move {
            raft_shutdown.cancelled().await;
            node_shutdown.cancel();
        });

        tokio::spawn(self.raft_node.clone().run());

        tokio::spawn(apply_loop(
            self.raft_node.clone(),
            self.kv.clone(),
            self.apply_rx,
            self.config.max_raft_state_bytes,
        ));

        if let Some(dashboard_addr) = self.dashboard_addr {
            let dashboard_state = DashboardState {
                raft_node: self.raft_node.clone(),
                kv: self.kv.clone(),
            };
            tokio::spawn(run_dashboard(
                dashboard_addr,
                dashboard_state,
                shutdown.clone(),
            ));
        }

        let server = GrpcServer::new(self.config.listen_addr, self.raft_node.clone());
        let result = server.run(shutdown).await;

        self.raft_node.kill();
        result?;
        Ok(())
    }
}

/// Feed apply-channel messages into `kv`.
///
/// Snapshots are installed only when `cond_install_snapshot` agrees. With a
/// `snapshot_threshold`, the store is snapshotted whenever the persisted Raft
/// state reaches that many bytes.
pub async fn apply_loop(
    raft_node: Arc<RaftNode>,
    kv: Arc<RwLock<KvStore>>,
    mut apply_rx: mpsc::Receiver<ApplyMsg>,
    snapshot_threshold: Option<usize>,
) {
    while let Some(msg) = apply_rx.recv().await {
        match msg {
            ApplyMsg::Command { index, command, .. } => {
                kv.write().await.apply(index, &command);

                let Some(threshold) = snapshot_threshold else {
                    continue;
                };
                if raft_node.raft_state_size() < threshold {
                    continue;
                }

                let data = match kv.read().await.snapshot() {
                    Ok(data) => data,
                    Err(e) => {
                        tracing::warn!(index, error = %e, "Failed to encode snapshot");
                        continue;
                    }
                };
                if let Err(e) = raft_node.snapshot(index, data).await {
                    tracing::warn!(index, error = %e, "Snapshot rejected");
                    if e.is_fatal() {
                        break;
                    }
                }
            }
            ApplyMsg::Snapshot { index, term, data } => {
                match raft_node.cond_install_snapshot(term, index, data.clone()).await {
                    Ok(true) => {
                        if let Err(e) = kv.write().await.restore(index, &data) {
                            tracing::error!(index, error = %e, "Failed to restore snapshot");
                        }
                    }
                    Ok(false) => {
                        tracing::debug!(index, term, "Skipping stale snapshot");
                    }
                    Err(e) => {
                        tracing::warn!(index, error = %e, "Snapshot install failed");
                        if e.is_fatal() {
                            break;
                        }
                    }
                }
            }
        }
    }

    tracing::debug!(node_id = raft_node.id, "Apply loop stopped");
}
