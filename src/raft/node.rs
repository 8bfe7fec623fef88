use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{mpsc, Notify, RwLock};
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::config::NodeConfig;
use crate::error::{RaftError, Result};
use crate::raft::persist::{encode_hard_state, encode_snapshot, restore, Persister};
use crate::raft::rpc::{
    self, AppendEntriesArgs, AppendEntriesReply, InstallSnapshotArgs, InstallSnapshotReply,
    RequestVoteArgs, RequestVoteReply,
};
use crate::raft::state::{quorum_size, LogEntry, RaftRole, RaftState};
use crate::raft::timer::random_election_timeout;
use crate::raft::transport::Transport;

/// Message delivered to the application on the apply channel, in index order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyMsg {
    /// A committed log entry.
    Command {
        index: u64,
        term: u64,
        command: Vec<u8>,
    },
    /// State machine contents through `index`, replacing everything applied so far.
    Snapshot { index: u64, term: u64, data: Vec<u8> },
}

impl ApplyMsg {
    pub fn index(&self) -> u64 {
        match self {
            ApplyMsg::Command { index, .. } | ApplyMsg::Snapshot { index, .. } => *index,
        }
    }
}

/// Read-only view of a peer, for status endpoints and tests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RaftStatus {
    pub node_id: u64,
    pub role: RaftRole,
    pub term: u64,
    pub leader_id: Option<u64>,
    pub commit_index: u64,
    /// Highest index handed to the apply channel. Messages still buffered in
    /// the channel count, so the application may be behind this by up to
    /// the channel capacity.
    pub last_applied: u64,
    pub last_log_index: u64,
    pub last_log_term: u64,
    pub snapshot_index: u64,
    pub snapshot_term: u64,
    pub log_len: usize,
}

enum Outbound {
    Append(AppendEntriesArgs),
    Snapshot(InstallSnapshotArgs),
}

/// A single Raft peer.
///
/// All protocol state lives behind one lock. Outbound RPCs run on spawned
/// tasks that never hold the lock while waiting, and re-check term and role
/// before acting on a reply. Committed entries are handed to the application
/// by a dedicated applier task over a bounded channel, outside the lock.
pub struct RaftNode {
    pub id: u64,
    config: NodeConfig,
    peer_ids: Vec<u64>,
    state: RwLock<RaftState>,
    transport: Arc<dyn Transport>,
    persister: Arc<dyn Persister>,
    apply_tx: mpsc::Sender<ApplyMsg>,
    /// Single-slot wakeup that restarts the election timer.
    election_reset: Notify,
    replicate_now: Notify,
    apply_notify: Notify,
    shutdown: CancellationToken,
}

impl RaftNode {
    /// Create a peer, restoring whatever `persister` holds. A persisted
    /// snapshot is replayed on the apply channel before any entry.
    pub fn new(
        config: NodeConfig,
        transport: Arc<dyn Transport>,
        persister: Arc<dyn Persister>,
        apply_tx: mpsc::Sender<ApplyMsg>,
    ) -> Result<Arc<Self>> {
        config.validate()?;

        let mut state = restore(persister.as_ref())?;
        state.queue_snapshot_delivery();

        tracing::info!(
            node_id = config.node_id,
            term = state.current_term,
            last_log_index = state.last_log_index(),
            snapshot_index = state.snapshot_last_index,
            "Restored raft state"
        );

        Ok(Arc::new(Self {
            id: config.node_id,
            peer_ids: config.peer_ids(),
            config,
            state: RwLock::new(state),
            transport,
            persister,
            apply_tx,
            election_reset: Notify::new(),
            replicate_now: Notify::new(),
            apply_notify: Notify::new(),
            shutdown: CancellationToken::new(),
        }))
    }

    /// Drive timers, elections, replication and the applier until `kill()`.
    pub async fn run(self: Arc<Self>) {
        let applier = tokio::spawn(Arc::clone(&self).run_applier());
        self.apply_notify.notify_one();

        let heartbeat = Duration::from_millis(self.config.heartbeat_interval_ms);

        loop {
            let role = self.state.read().await.role;

            if role == RaftRole::Leader {
                self.broadcast_append_entries().await;
                tokio::select! {
                    _ = self.shutdown.cancelled() => break,
                    _ = tokio::time::sleep(heartbeat) => {}
                    _ = self.replicate_now.notified() => {}
                }
            } else {
                let election_timeout = random_election_timeout(
                    self.config.election_timeout_min_ms,
                    self.config.election_timeout_max_ms,
                );
                tokio::select! {
                    _ = self.shutdown.cancelled() => break,
                    _ = self.election_reset.notified() => {}
                    _ = tokio::time::sleep(election_timeout) => {
                        tracing::info!(
                            node_id = self.id,
                            timeout_ms = election_timeout.as_millis() as u64,
                            "Election timeout, starting election"
                        );
                        self.start_election().await;
                    }
                }
            }
        }

        let _ = applier.await;
        tracing::info!(node_id = self.id, "Raft node stopped");
    }

    /// Stop the peer. Inbound RPCs and `start` fail with `Shutdown` afterwards.
    pub fn kill(&self) {
        if !self.shutdown.is_cancelled() {
            tracing::info!(node_id = self.id, "Killing raft node");
        }
        self.shutdown.cancel();
    }

    pub fn killed(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    fn ensure_running(&self) -> Result<()> {
        if self.killed() {
            return Err(RaftError::Shutdown);
        }
        Ok(())
    }

    fn check_sender(&self, sender: u64) -> Result<()> {
        if !self.peer_ids.contains(&sender) {
            tracing::warn!(node_id = self.id, sender, "RPC from unknown peer");
            return Err(RaftError::InvalidArgument(format!(
                "node {} is not a member of this cluster",
                sender
            )));
        }
        Ok(())
    }

    /// Flush whatever the last mutation marked dirty. A failure is fatal: the
    /// peer kills itself rather than answer from state it could not save.
    fn persist_locked(&self, state: &mut RaftState) -> Result<()> {
        let needs = state.take_persist_needs();
        if !needs.any() {
            return Ok(());
        }

        let result = encode_hard_state(state).and_then(|hard| {
            let snapshot = if needs.snapshot {
                encode_snapshot(state)?
            } else {
                None
            };
            match snapshot {
                Some(snapshot) => self.persister.save_state_and_snapshot(&hard, &snapshot),
                None => self.persister.save_raft_state(&hard),
            }
        });

        result.map_err(|e| {
            tracing::error!(node_id = self.id, error = %e, "Failed to persist raft state");
            self.shutdown.cancel();
            match e {
                RaftError::Persistence(msg) => RaftError::Persistence(msg),
                other => RaftError::Persistence(other.to_string()),
            }
        })
    }

    // ---- Command submission API ----

    /// Append `command` to the log if this peer is the leader.
    ///
    /// Returns the index the command will occupy if it commits and the current
    /// term. Acceptance does not guarantee the command ever commits.
    pub async fn start(&self, command: Vec<u8>) -> Result<(u64, u64)> {
        self.ensure_running()?;

        let mut state = self.state.write().await;
        if state.role != RaftRole::Leader {
            return Err(RaftError::NotLeader(state.leader_id));
        }

        let entry = state.append_entry(command);
        let (index, term) = (entry.index, entry.term);
        self.persist_locked(&mut state)?;
        tracing::debug!(node_id = self.id, index, term, "Appended command to log");

        if state.advance_leader_commit(self.config.cluster_size()) {
            self.apply_notify.notify_one();
        }
        drop(state);

        self.replicate_now.notify_one();
        Ok((index, term))
    }

    /// Current term and whether this peer believes it is the leader.
    pub async fn get_state(&self) -> (u64, bool) {
        let state = self.state.read().await;
        (state.current_term, state.role == RaftRole::Leader)
    }

    pub async fn is_leader(&self) -> bool {
        self.state.read().await.role == RaftRole::Leader
    }

    pub async fn leader_id(&self) -> Option<u64> {
        self.state.read().await.leader_id
    }

    pub async fn status(&self) -> RaftStatus {
        let state = self.state.read().await;
        RaftStatus {
            node_id: self.id,
            role: state.role,
            term: state.current_term,
            leader_id: state.leader_id,
            commit_index: state.commit_index,
            last_applied: state.last_applied,
            last_log_index: state.last_log_index(),
            last_log_term: state.last_log_term(),
            snapshot_index: state.snapshot_last_index,
            snapshot_term: state.snapshot_last_term,
            log_len: state.log.len(),
        }
    }

    /// Entries still held in memory (those after the snapshot).
    pub async fn log_entries(&self) -> Vec<LogEntry> {
        self.state.read().await.log.clone()
    }

    pub fn raft_state_size(&self) -> usize {
        self.persister.raft_state_size()
    }

    // ---- Snapshot API ----

    /// The application has captured its state through `index`; discard the
    /// log up to there. Older or equal snapshots are ignored.
    pub async fn snapshot(&self, index: u64, data: Vec<u8>) -> Result<()> {
        self.ensure_running()?;

        let mut state = self.state.write().await;
        if index <= state.snapshot_last_index {
            return Ok(());
        }
        if index > state.last_applied {
            return Err(RaftError::InvalidArgument(format!(
                "snapshot index {} is beyond last applied {}",
                index, state.last_applied
            )));
        }
        let term = state.term_at(index).ok_or_else(|| {
            RaftError::InvalidArgument(format!("no log entry at snapshot index {}", index))
        })?;

        state.compact_to(index, term, data);
        self.persist_locked(&mut state)?;

        tracing::info!(
            node_id = self.id,
            snapshot_index = index,
            snapshot_term = term,
            remaining_entries = state.log.len(),
            "Compacted log"
        );
        Ok(())
    }

    /// Called by the application after receiving `ApplyMsg::Snapshot`.
    ///
    /// Returns true if the application should switch to the snapshot: it is
    /// the snapshot this peer already holds, or it is newer than everything
    /// applied so far (and is installed here). Returns false if stale.
    pub async fn cond_install_snapshot(
        &self,
        term: u64,
        index: u64,
        data: Vec<u8>,
    ) -> Result<bool> {
        self.ensure_running()?;

        let mut state = self.state.write().await;

        if index < state.snapshot_last_index {
            return Ok(false);
        }
        if index == state.snapshot_last_index && term == state.snapshot_last_term {
            state.last_applied = state.last_applied.max(index);
            return Ok(true);
        }
        if index <= state.last_applied {
            return Ok(false);
        }

        state.compact_to(index, term, data);
        state.last_applied = index;
        if matches!(&state.pending_snapshot, Some(p) if p.index <= index) {
            state.pending_snapshot = None;
        }
        self.persist_locked(&mut state)?;

        tracing::info!(
            node_id = self.id,
            snapshot_index = index,
            snapshot_term = term,
            "Installed snapshot from application"
        );
        Ok(true)
    }

    // ---- Inbound RPCs ----

    pub async fn handle_request_vote(&self, args: RequestVoteArgs) -> Result<RequestVoteReply> {
        self.ensure_running()?;
        self.check_sender(args.candidate_id)?;

        let mut state = self.state.write().await;
        let reply = rpc::handle_request_vote(&mut state, &args, self.id)?;
        self.persist_locked(&mut state)?;

        if reply.vote_granted {
            self.election_reset.notify_one();
        }
        Ok(reply)
    }

    pub async fn handle_append_entries(
        &self,
        args: AppendEntriesArgs,
    ) -> Result<AppendEntriesReply> {
        self.ensure_running()?;
        self.check_sender(args.leader_id)?;

        let mut state = self.state.write().await;
        let commit_before = state.commit_index;
        let reply = rpc::handle_append_entries(&mut state, &args, self.id)?;
        self.persist_locked(&mut state)?;

        if reply.term == args.term {
            self.election_reset.notify_one();
        }
        if state.commit_index > commit_before {
            tracing::debug!(
                node_id = self.id,
                commit_index = state.commit_index,
                "Follower commit index advanced"
            );
            self.apply_notify.notify_one();
        }
        Ok(reply)
    }

    pub async fn handle_install_snapshot(
        &self,
        args: InstallSnapshotArgs,
    ) -> Result<InstallSnapshotReply> {
        self.ensure_running()?;
        self.check_sender(args.leader_id)?;

        let mut state = self.state.write().await;
        let reply = rpc::handle_install_snapshot(&mut state, &args, self.id)?;
        self.persist_locked(&mut state)?;

        if reply.term == args.term {
            self.election_reset.notify_one();
        }
        if state.pending_snapshot.is_some() {
            self.apply_notify.notify_one();
        }
        Ok(reply)
    }

    // ---- Election ----

    async fn start_election(self: &Arc<Self>) {
        let args = {
            let mut state = self.state.write().await;
            if state.role == RaftRole::Leader {
                return;
            }
            state.become_candidate(self.id);
            if self.persist_locked(&mut state).is_err() {
                return;
            }

            tracing::info!(node_id = self.id, term = state.current_term, "Starting election");

            if state.votes_received.len() >= quorum_size(self.config.cluster_size()) {
                self.win_election(&mut state);
                return;
            }

            RequestVoteArgs {
                term: state.current_term,
                candidate_id: self.id,
                last_log_index: state.last_log_index(),
                last_log_term: state.last_log_term(),
            }
        };

        for &peer_id in &self.peer_ids {
            let node = Arc::clone(self);
            let args = args.clone();
            tokio::spawn(async move {
                let term = args.term;
                match node.transport.request_vote(peer_id, args).await {
                    Ok(reply) => node.handle_vote_reply(peer_id, term, reply).await,
                    Err(e) => {
                        tracing::trace!(node_id = node.id, peer_id, error = %e, "Vote request failed");
                    }
                }
            });
        }
    }

    async fn handle_vote_reply(&self, peer_id: u64, term: u64, reply: RequestVoteReply) {
        let mut state = self.state.write().await;

        if reply.term > state.current_term {
            self.step_down(&mut state, reply.term);
            return;
        }
        if state.role != RaftRole::Candidate || state.current_term != term {
            return;
        }
        if !reply.vote_granted {
            return;
        }

        let votes = state.record_vote(peer_id);
        tracing::debug!(node_id = self.id, peer_id, term, votes, "Received vote");

        if votes >= quorum_size(self.config.cluster_size()) {
            self.win_election(&mut state);
        }
    }

    fn win_election(&self, state: &mut RaftState) {
        let votes = state.votes_received.len();
        state.become_leader(self.id, &self.peer_ids);
        tracing::info!(
            node_id = self.id,
            term = state.current_term,
            votes,
            "Became leader"
        );
        // Wake the ticker so it starts heartbeating immediately
        self.election_reset.notify_one();
    }

    /// Adopt a newer term seen in a reply and fall back to follower.
    fn step_down(&self, state: &mut RaftState, term: u64) {
        tracing::info!(
            node_id = self.id,
            old_term = state.current_term,
            new_term = term,
            "Saw higher term, stepping down"
        );
        state.become_follower(term);
        if self.persist_locked(state).is_ok() {
            self.election_reset.notify_one();
        }
    }

    // ---- Replication ----

    fn build_request(&self, state: &RaftState, peer_id: u64) -> Outbound {
        let last_log_index = state.last_log_index();
        let next = state
            .next_index
            .get(&peer_id)
            .copied()
            .unwrap_or(last_log_index + 1)
            .min(last_log_index + 1);

        if next <= state.snapshot_last_index {
            if let Some(data) = &state.snapshot {
                return Outbound::Snapshot(InstallSnapshotArgs {
                    term: state.current_term,
                    leader_id: self.id,
                    last_included_index: state.snapshot_last_index,
                    last_included_term: state.snapshot_last_term,
                    data: data.clone(),
                });
            }
        }

        let next = next.max(state.snapshot_last_index + 1);
        let prev_log_index = next - 1;
        Outbound::Append(AppendEntriesArgs {
            term: state.current_term,
            leader_id: self.id,
            prev_log_index,
            prev_log_term: state.term_at(prev_log_index).unwrap_or(0),
            entries: state.entries_from(next, self.config.max_entries_per_append),
            leader_commit: state.commit_index,
        })
    }

    async fn broadcast_append_entries(self: &Arc<Self>) {
        let requests: Vec<(u64, Outbound)> = {
            let state = self.state.read().await;
            if state.role != RaftRole::Leader || self.killed() {
                return;
            }
            self.peer_ids
                .iter()
                .map(|&peer_id| (peer_id, self.build_request(&state, peer_id)))
                .collect()
        };

        for (peer_id, request) in requests {
            let node = Arc::clone(self);
            tokio::spawn(async move {
                match request {
                    Outbound::Append(args) => {
                        let (term, sent_through) = (args.term, args.last_index());
                        match node.transport.append_entries(peer_id, args).await {
                            Ok(reply) => {
                                node.handle_append_reply(peer_id, term, sent_through, reply)
                                    .await
                            }
                            Err(e) => {
                                tracing::trace!(node_id = node.id, peer_id, error = %e, "AppendEntries failed");
                            }
                        }
                    }
                    Outbound::Snapshot(args) => {
                        let (term, snapshot_index) = (args.term, args.last_included_index);
                        tracing::debug!(node_id = node.id, peer_id, snapshot_index, "Sending snapshot");
                        match node.transport.install_snapshot(peer_id, args).await {
                            Ok(reply) => {
                                node.handle_snapshot_reply(peer_id, term, snapshot_index, reply)
                                    .await
                            }
                            Err(e) => {
                                tracing::trace!(node_id = node.id, peer_id, error = %e, "InstallSnapshot failed");
                            }
                        }
                    }
                }
            });
        }
    }

    async fn handle_append_reply(
        &self,
        peer_id: u64,
        term: u64,
        sent_through: u64,
        reply: AppendEntriesReply,
    ) {
        let mut state = self.state.write().await;

        if reply.term > state.current_term {
            self.step_down(&mut state, reply.term);
            return;
        }
        if state.role != RaftRole::Leader || state.current_term != term {
            return;
        }

        let matched = state.match_index.get(&peer_id).copied().unwrap_or(0);

        if reply.success {
            let matched = matched.max(sent_through);
            state.match_index.insert(peer_id, matched);
            let next = state.next_index.entry(peer_id).or_insert(matched + 1);
            *next = (*next).max(matched + 1);

            if state.advance_leader_commit(self.config.cluster_size()) {
                tracing::debug!(
                    node_id = self.id,
                    commit_index = state.commit_index,
                    "Updated commit index"
                );
                self.apply_notify.notify_one();
            }
        } else if reply.conflict_index > 0 {
            let backed_up = match reply.conflict_term {
                Some(conflict_term) => state
                    .last_index_of_term(conflict_term)
                    .map(|i| i + 1)
                    .unwrap_or(reply.conflict_index),
                None => reply.conflict_index,
            };
            let next = backed_up.max(matched + 1);
            tracing::debug!(node_id = self.id, peer_id, next_index = next, "Backing up next index");
            state.next_index.insert(peer_id, next);
        }
    }

    async fn handle_snapshot_reply(
        &self,
        peer_id: u64,
        term: u64,
        snapshot_index: u64,
        reply: InstallSnapshotReply,
    ) {
        let mut state = self.state.write().await;

        if reply.term > state.current_term {
            self.step_down(&mut state, reply.term);
            return;
        }
        if state.role != RaftRole::Leader || state.current_term != term {
            return;
        }

        let matched = state
            .match_index
            .get(&peer_id)
            .copied()
            .unwrap_or(0)
            .max(snapshot_index);
        state.match_index.insert(peer_id, matched);
        let next = state.next_index.entry(peer_id).or_insert(matched + 1);
        *next = (*next).max(matched + 1);

        if state.advance_leader_commit(self.config.cluster_size()) {
            self.apply_notify.notify_one();
        }
    }

    // ---- Apply pipeline ----

    /// Next messages for the application, marking them applied. A pending
    /// snapshot newer than `last_applied` goes out alone, ahead of entries.
    ///
    /// `last_applied` moves when the batch is taken, before the sends: the
    /// application may call `snapshot(index)` the moment it receives `index`,
    /// and that call must already see `index` as applied.
    fn next_apply_batch(state: &mut RaftState) -> Vec<ApplyMsg> {
        if let Some(snapshot) = state.pending_snapshot.take() {
            if snapshot.index > state.last_applied {
                state.last_applied = snapshot.index;
                return vec![ApplyMsg::Snapshot {
                    index: snapshot.index,
                    term: snapshot.term,
                    data: snapshot.data,
                }];
            }
        }

        let first = state.last_applied + 1;
        let batch: Vec<ApplyMsg> = (first..=state.commit_index)
            .map_while(|index| state.get_entry(index))
            .map(|entry| ApplyMsg::Command {
                index: entry.index,
                term: entry.term,
                command: entry.command.clone(),
            })
            .collect();

        if let Some(last) = batch.last() {
            state.last_applied = last.index();
        }
        batch
    }

    async fn run_applier(self: Arc<Self>) {
        loop {
            let batch = {
                let mut state = self.state.write().await;
                Self::next_apply_batch(&mut state)
            };

            if batch.is_empty() {
                tokio::select! {
                    _ = self.shutdown.cancelled() => return,
                    _ = self.apply_notify.notified() => continue,
                }
            }

            tracing::trace!(
                node_id = self.id,
                first = batch[0].index(),
                count = batch.len(),
                "Applying batch"
            );

            // Sent without holding the state lock
            for msg in batch {
                tokio::select! {
                    _ = self.shutdown.cancelled() => return,
                    sent = self.apply_tx.send(msg) => {
                        if sent.is_err() {
                            tracing::warn!(node_id = self.id, "Apply channel closed, stopping applier");
                            return;
                        }
                    }
                }
            }
        }
    }
}
