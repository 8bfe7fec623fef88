//! In-process network for driving clusters of `RaftNode`s in tests.
//!
//! Every peer gets a `MemoryTransport` that calls the target node's RPC
//! handlers directly. The network can take nodes offline, cut individual
//! links, split the cluster into partitions, and drop or delay messages at
//! random to simulate an unreliable network.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use rand::Rng;

use crate::error::{RaftError, Result};
use crate::raft::rpc::{
    AppendEntriesArgs, AppendEntriesReply, InstallSnapshotArgs, InstallSnapshotReply,
    RequestVoteArgs, RequestVoteReply,
};
use crate::raft::transport::Transport;
use crate::raft::RaftNode;

/// Fraction of messages lost in each direction while unreliable.
const UNRELIABLE_DROP_PERCENT: u32 = 10;
const UNRELIABLE_MAX_DELAY_MS: u64 = 25;

#[derive(Default)]
struct NetworkState {
    nodes: HashMap<u64, Weak<RaftNode>>,
    disconnected: HashSet<u64>,
    /// Directed links that drop everything.
    cut_links: HashSet<(u64, u64)>,
    unreliable: bool,
}

#[derive(Clone, Default)]
pub struct MemoryNetwork {
    inner: Arc<Mutex<NetworkState>>,
    rpc_count: Arc<AtomicU64>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, NetworkState> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Transport for the peer `from`.
    pub fn transport(&self, from: u64) -> Arc<MemoryTransport> {
        Arc::new(MemoryTransport {
            network: self.clone(),
            from,
        })
    }

    /// Route RPCs addressed to `node.id` to this node. Re-registering an id
    /// replaces the previous node, which is how a restarted peer rejoins.
    pub fn register(&self, node: &Arc<RaftNode>) {
        self.lock().nodes.insert(node.id, Arc::downgrade(node));
    }

    pub fn unregister(&self, id: u64) {
        self.lock().nodes.remove(&id);
    }

    /// Take `id` off the network: nothing it sends or is sent arrives.
    pub fn disconnect(&self, id: u64) {
        tracing::debug!(node_id = id, "Network: disconnect");
        self.lock().disconnected.insert(id);
    }

    pub fn connect(&self, id: u64) {
        tracing::debug!(node_id = id, "Network: connect");
        self.lock().disconnected.remove(&id);
    }

    pub fn is_connected(&self, id: u64) -> bool {
        !self.lock().disconnected.contains(&id)
    }

    /// Cut the link between `a` and `b` in both directions.
    pub fn cut(&self, a: u64, b: u64) {
        let mut state = self.lock();
        state.cut_links.insert((a, b));
        state.cut_links.insert((b, a));
    }

    pub fn heal(&self, a: u64, b: u64) {
        let mut state = self.lock();
        state.cut_links.remove(&(a, b));
        state.cut_links.remove(&(b, a));
    }

    /// Split the cluster so that only peers in the same group can talk.
    pub fn partition(&self, groups: &[&[u64]]) {
        let mut state = self.lock();
        state.cut_links.clear();
        for (i, group) in groups.iter().enumerate() {
            for other in groups.iter().skip(i + 1) {
                for &a in group.iter() {
                    for &b in other.iter() {
                        state.cut_links.insert((a, b));
                        state.cut_links.insert((b, a));
                    }
                }
            }
        }
        tracing::debug!(groups = ?groups, "Network: partitioned");
    }

    /// Remove every partition and cut link. Disconnected nodes stay offline.
    pub fn heal_all(&self) {
        self.lock().cut_links.clear();
        tracing::debug!("Network: healed");
    }

    pub fn set_unreliable(&self, unreliable: bool) {
        self.lock().unreliable = unreliable;
    }

    /// Total RPCs attempted through this network.
    pub fn rpc_count(&self) -> u64 {
        self.rpc_count.load(Ordering::Relaxed)
    }

    fn can_reach(&self, from: u64, to: u64) -> bool {
        let state = self.lock();
        !state.disconnected.contains(&from)
            && !state.disconnected.contains(&to)
            && !state.cut_links.contains(&(from, to))
    }

    /// Resolve the target of a message, applying loss and delay.
    async fn deliver(&self, from: u64, to: u64) -> Result<Arc<RaftNode>> {
        self.rpc_count.fetch_add(1, Ordering::Relaxed);

        let (node, unreliable) = {
            let state = self.lock();
            (state.nodes.get(&to).and_then(Weak::upgrade), state.unreliable)
        };

        if unreliable {
            let (drop, delay_ms) = {
                let mut rng = rand::thread_rng();
                (
                    rng.gen_range(0..100) < UNRELIABLE_DROP_PERCENT,
                    rng.gen_range(0..=UNRELIABLE_MAX_DELAY_MS),
                )
            };
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            if drop {
                return Err(RaftError::Transport(format!("message {} -> {} lost", from, to)));
            }
        }

        if !self.can_reach(from, to) {
            return Err(RaftError::Transport(format!("{} cannot reach {}", from, to)));
        }
        node.ok_or_else(|| RaftError::Transport(format!("node {} is not running", to)))
    }

    /// Apply the same rules to the reply on its way back.
    fn respond<T>(&self, from: u64, to: u64, reply: T) -> Result<T> {
        let unreliable = self.lock().unreliable;
        if unreliable {
            let drop = rand::thread_rng().gen_range(0..100) < UNRELIABLE_DROP_PERCENT;
            if drop {
                return Err(RaftError::Transport(format!("reply {} -> {} lost", to, from)));
            }
        }
        if !self.can_reach(to, from) {
            return Err(RaftError::Transport(format!("{} cannot reach {}", to, from)));
        }
        Ok(reply)
    }
}

/// One peer's view of a `MemoryNetwork`.
pub struct MemoryTransport {
    network: MemoryNetwork,
    from: u64,
}

#[tonic::async_trait]
impl Transport for MemoryTransport {
    async fn request_vote(&self, target: u64, args: RequestVoteArgs) -> Result<RequestVoteReply> {
        let node = self.network.deliver(self.from, target).await?;
        let reply = node.handle_request_vote(args).await?;
        self.network.respond(self.from, target, reply)
    }

    async fn append_entries(
        &self,
        target: u64,
        args: AppendEntriesArgs,
    ) -> Result<AppendEntriesReply> {
        let node = self.network.deliver(self.from, target).await?;
        let reply = node.handle_append_entries(args).await?;
        self.network.respond(self.from, target, reply)
    }

    async fn install_snapshot(
        &self,
        target: u64,
        args: InstallSnapshotArgs,
    ) -> Result<InstallSnapshotReply> {
        let node = self.network.deliver(self.from, target).await?;
        let reply = node.handle_install_snapshot(args).await?;
        self.network.respond(self.from, target, reply)
    }
}
