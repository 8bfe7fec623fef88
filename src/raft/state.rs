use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

/// Raft node role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RaftRole {
    Follower,
    Candidate,
    Leader,
}

impl std::fmt::Display for RaftRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RaftRole::Follower => write!(f, "follower"),
            RaftRole::Candidate => write!(f, "candidate"),
            RaftRole::Leader => write!(f, "leader"),
        }
    }
}

/// A single entry in the Raft log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub index: u64,
    pub term: u64,
    pub command: Vec<u8>,
}

/// Snapshot handed to the apply pipeline but not yet delivered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingSnapshot {
    pub index: u64,
    pub term: u64,
    pub data: Vec<u8>,
}

/// Which parts of the durable state changed since the last persist.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PersistNeeds {
    pub hard_state: bool,
    pub snapshot: bool,
}

impl PersistNeeds {
    pub fn any(&self) -> bool {
        self.hard_state || self.snapshot
    }
}

/// Strict majority of `cluster_size` voters.
pub fn quorum_size(cluster_size: usize) -> usize {
    cluster_size / 2 + 1
}

/// Peer state, guarded by the node's single lock.
///
/// Every method assumes the caller holds that lock; nothing here performs I/O.
/// Mutators of `current_term`, `voted_for`, the log or the snapshot record what
/// must be persisted in `persist_needs`, and the node flushes it before
/// replying to any RPC.
///
/// # Raft Safety Invariants
///
/// ## Election Safety
/// At most one leader can be elected in a given term. Enforced by:
/// - Each node votes for at most one candidate per term (`voted_for`)
/// - Candidate must receive a strict majority of votes to become leader
///
/// ## Leader Append-Only
/// A leader never overwrites or deletes entries in its log. Enforced by:
/// - Leaders only append new entries via `append_entry()`
/// - Log truncation only occurs on followers during replication conflicts
///
/// ## Log Matching
/// If two logs contain an entry with the same index and term, then the logs
/// are identical in all entries up through that index. Enforced by:
/// - `AppendEntries` consistency check (prev_log_index, prev_log_term)
/// - Conflicting entries are truncated before appending
///
/// ## Leader Completeness
/// If a log entry is committed in a given term, that entry will be present
/// in the logs of all leaders for higher terms. Enforced by:
/// - Vote restriction: candidates must have up-to-date logs (`is_log_up_to_date`)
/// - Leaders only commit entries from their current term
///
/// ## State Machine Safety
/// If a server has applied a log entry at a given index, no other server will
/// ever apply a different entry for that index. Enforced by:
/// - Entries are only applied after being committed (`last_applied <= commit_index`)
/// - Committed entries are never overwritten (Leader Completeness)
#[derive(Debug)]
pub struct RaftState {
    // Persistent state
    pub current_term: u64,
    pub voted_for: Option<u64>,
    /// Entries after `snapshot_last_index`, in index order.
    pub log: Vec<LogEntry>,
    pub snapshot_last_index: u64,
    pub snapshot_last_term: u64,
    pub snapshot: Option<Vec<u8>>,

    // Volatile state on all servers
    pub commit_index: u64,
    pub last_applied: u64,

    // Volatile state on leaders (reinitialized after election)
    pub next_index: HashMap<u64, u64>,
    pub match_index: HashMap<u64, u64>,

    pub role: RaftRole,
    pub leader_id: Option<u64>,

    // Votes received in current election (for candidates)
    pub votes_received: HashSet<u64>,

    pub pending_snapshot: Option<PendingSnapshot>,
    pub persist_needs: PersistNeeds,
}

impl RaftState {
    pub fn new() -> Self {
        Self {
            current_term: 0,
            voted_for: None,
            log: Vec::new(),
            snapshot_last_index: 0,
            snapshot_last_term: 0,
            snapshot: None,
            commit_index: 0,
            last_applied: 0,
            next_index: HashMap::new(),
            match_index: HashMap::new(),
            role: RaftRole::Follower,
            leader_id: None,
            votes_received: HashSet::new(),
            pending_snapshot: None,
            persist_needs: PersistNeeds::default(),
        }
    }

    pub fn last_log_index(&self) -> u64 {
        self.log
            .last()
            .map(|e| e.index)
            .unwrap_or(self.snapshot_last_index)
    }

    pub fn last_log_term(&self) -> u64 {
        self.log
            .last()
            .map(|e| e.term)
            .unwrap_or(self.snapshot_last_term)
    }

    fn position(&self, index: u64) -> Option<usize> {
        if index <= self.snapshot_last_index {
            return None;
        }
        let pos = (index - self.snapshot_last_index - 1) as usize;
        (pos < self.log.len()).then_some(pos)
    }

    /// Get log entry at index (1-indexed). Compacted entries are gone.
    pub fn get_entry(&self, index: u64) -> Option<&LogEntry> {
        self.position(index).map(|pos| &self.log[pos])
    }

    /// Term of the entry at `index`, including the snapshot boundary.
    /// `None` if the index is compacted away or beyond the log.
    pub fn term_at(&self, index: u64) -> Option<u64> {
        if index == self.snapshot_last_index {
            return Some(self.snapshot_last_term);
        }
        self.get_entry(index).map(|e| e.term)
    }

    /// Up to `limit` entries starting from `start_index` (inclusive)
    pub fn entries_from(&self, start_index: u64, limit: usize) -> Vec<LogEntry> {
        let first = start_index.max(self.snapshot_last_index + 1);
        match self.position(first) {
            Some(pos) => self.log[pos..].iter().take(limit).cloned().collect(),
            None => Vec::new(),
        }
    }

    /// First index in the retained log carrying `term`.
    pub fn first_index_of_term(&self, term: u64) -> Option<u64> {
        self.log.iter().find(|e| e.term == term).map(|e| e.index)
    }

    /// Last index in the retained log carrying `term`.
    pub fn last_index_of_term(&self, term: u64) -> Option<u64> {
        self.log.iter().rev().find(|e| e.term == term).map(|e| e.index)
    }

    /// Append a new entry to the log
    pub fn append_entry(&mut self, command: Vec<u8>) -> &LogEntry {
        let entry = LogEntry {
            index: self.last_log_index() + 1,
            term: self.current_term,
            command,
        };
        self.log.push(entry);
        self.persist_needs.hard_state = true;
        &self.log[self.log.len() - 1]
    }

    /// Drop every entry with index >= `from_index`.
    pub fn truncate_from(&mut self, from_index: u64) {
        if let Some(pos) = self.position(from_index) {
            self.log.truncate(pos);
            self.persist_needs.hard_state = true;
        }
    }

    /// Merge entries received from the leader that follow `prev_log_index`.
    ///
    /// Existing entries that agree are kept; the log is cut only at the first
    /// index whose term differs, so a delayed duplicate never shortens it.
    pub fn merge_entries(&mut self, entries: &[LogEntry]) {
        for (offset, entry) in entries.iter().enumerate() {
            if entry.index <= self.snapshot_last_index {
                continue;
            }
            match self.term_at(entry.index) {
                Some(term) if term == entry.term => continue,
                Some(_) => {
                    self.truncate_from(entry.index);
                    self.log.extend(entries[offset..].iter().cloned());
                    self.persist_needs.hard_state = true;
                    return;
                }
                None => {
                    self.log.extend(entries[offset..].iter().cloned());
                    self.persist_needs.hard_state = true;
                    return;
                }
            }
        }
    }

    /// Check if candidate's log is at least as up-to-date as ours
    pub fn is_log_up_to_date(&self, last_log_index: u64, last_log_term: u64) -> bool {
        let our_last_term = self.last_log_term();
        let our_last_index = self.last_log_index();

        last_log_term > our_last_term
            || (last_log_term == our_last_term && last_log_index >= our_last_index)
    }

    /// Adopt `term` if it is newer; clears the vote for the old term.
    /// Returns true if the term advanced.
    pub fn observe_term(&mut self, term: u64) -> bool {
        if term <= self.current_term {
            return false;
        }
        self.current_term = term;
        self.voted_for = None;
        self.persist_needs.hard_state = true;
        true
    }

    /// Transition to follower state, adopting `term` if it is newer
    pub fn become_follower(&mut self, term: u64) {
        if self.observe_term(term) {
            self.leader_id = None;
        }
        self.role = RaftRole::Follower;
        self.votes_received.clear();
        self.next_index.clear();
        self.match_index.clear();
    }

    /// Transition to candidate state
    pub fn become_candidate(&mut self, my_id: u64) {
        self.role = RaftRole::Candidate;
        self.current_term += 1;
        self.voted_for = Some(my_id);
        self.votes_received.clear();
        self.votes_received.insert(my_id);
        self.leader_id = None;
        self.persist_needs.hard_state = true;
    }

    /// Transition to leader state
    pub fn become_leader(&mut self, my_id: u64, peer_ids: &[u64]) {
        self.role = RaftRole::Leader;
        self.leader_id = Some(my_id);
        self.votes_received.clear();

        let last_log_index = self.last_log_index();
        self.next_index.clear();
        self.match_index.clear();
        for &peer_id in peer_ids {
            self.next_index.insert(peer_id, last_log_index + 1);
            self.match_index.insert(peer_id, 0);
        }
    }

    /// Record a granted vote; returns the number of distinct votes held.
    pub fn record_vote(&mut self, voter: u64) -> usize {
        self.votes_received.insert(voter);
        self.votes_received.len()
    }

    /// Leader-side commit rule: the highest index stored on a majority whose
    /// entry belongs to the current term. Returns true if `commit_index` moved.
    pub fn advance_leader_commit(&mut self, cluster_size: usize) -> bool {
        if self.role != RaftRole::Leader {
            return false;
        }

        let mut match_indices: Vec<u64> = self.match_index.values().copied().collect();
        match_indices.push(self.last_log_index()); // Include self
        match_indices.sort_unstable_by(|a, b| b.cmp(a));

        let quorum = quorum_size(cluster_size);
        let Some(&candidate) = match_indices.get(quorum - 1) else {
            return false;
        };

        if candidate > self.commit_index && self.term_at(candidate) == Some(self.current_term) {
            self.commit_index = candidate;
            return true;
        }
        false
    }

    /// Discard the log through `index`, recording `term` as the snapshot
    /// boundary. Entries after `index` survive only if the log agrees with
    /// the snapshot at `index`.
    pub fn compact_to(&mut self, index: u64, term: u64, data: Vec<u8>) {
        if self.term_at(index) == Some(term) && index <= self.last_log_index() {
            let keep_from = match self.position(index) {
                Some(pos) => pos + 1,
                None => 0,
            };
            self.log.drain(..keep_from);
        } else {
            self.log.clear();
        }

        self.snapshot_last_index = index;
        self.snapshot_last_term = term;
        self.snapshot = Some(data);
        self.commit_index = self.commit_index.max(index);
        self.persist_needs.hard_state = true;
        self.persist_needs.snapshot = true;
    }

    /// Hand the current snapshot to the apply pipeline.
    pub fn queue_snapshot_delivery(&mut self) {
        if let Some(data) = &self.snapshot {
            self.pending_snapshot = Some(PendingSnapshot {
                index: self.snapshot_last_index,
                term: self.snapshot_last_term,
                data: data.clone(),
            });
        }
    }

    pub fn take_persist_needs(&mut self) -> PersistNeeds {
        std::mem::take(&mut self.persist_needs)
    }
}

impl Default for RaftState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(index: u64, term: u64) -> LogEntry {
        LogEntry {
            index,
            term,
            command: format!("cmd{}", index).into_bytes(),
        }
    }

    #[test]
    fn test_new_state_is_follower() {
        let state = RaftState::new();
        assert_eq!(state.role, RaftRole::Follower);
        assert_eq!(state.current_term, 0);
        assert_eq!(state.voted_for, None);
        assert!(state.log.is_empty());
        assert_eq!(state.last_log_index(), 0);
        assert_eq!(state.term_at(0), Some(0));
    }

    #[test]
    fn test_become_candidate() {
        let mut state = RaftState::new();
        state.become_candidate(1);

        assert_eq!(state.role, RaftRole::Candidate);
        assert_eq!(state.current_term, 1);
        assert_eq!(state.voted_for, Some(1));
        assert_eq!(state.votes_received.len(), 1);
        assert_eq!(state.leader_id, None);
        assert!(state.persist_needs.hard_state);
    }

    #[test]
    fn test_become_leader() {
        let mut state = RaftState::new();
        state.become_candidate(1);
        state.become_leader(1, &[2, 3]);

        assert_eq!(state.role, RaftRole::Leader);
        assert_eq!(state.leader_id, Some(1));
        assert_eq!(state.next_index.get(&2), Some(&1));
        assert_eq!(state.next_index.get(&3), Some(&1));
        assert_eq!(state.match_index.get(&2), Some(&0));
        assert_eq!(state.match_index.get(&3), Some(&0));
    }

    #[test]
    fn test_become_follower_with_higher_term_clears_vote() {
        let mut state = RaftState::new();
        state.become_candidate(1);
        state.become_follower(5);

        assert_eq!(state.role, RaftRole::Follower);
        assert_eq!(state.current_term, 5);
        assert_eq!(state.voted_for, None);
        assert!(state.votes_received.is_empty());
    }

    #[test]
    fn test_become_follower_same_term_keeps_vote() {
        let mut state = RaftState::new();
        state.become_candidate(1);
        state.become_follower(1);

        assert_eq!(state.role, RaftRole::Follower);
        assert_eq!(state.current_term, 1);
        assert_eq!(state.voted_for, Some(1));
    }

    #[test]
    fn test_append_entry() {
        let mut state = RaftState::new();
        state.current_term = 1;

        let entry = state.append_entry(b"a".to_vec());
        assert_eq!(entry.term, 1);
        assert_eq!(entry.index, 1);

        state.current_term = 2;
        let entry2 = state.append_entry(b"b".to_vec());
        assert_eq!(entry2.term, 2);
        assert_eq!(entry2.index, 2);

        assert_eq!(state.last_log_index(), 2);
        assert_eq!(state.last_log_term(), 2);
    }

    #[test]
    fn test_get_entry_and_entries_from() {
        let mut state = RaftState::new();
        state.log = vec![entry(1, 1), entry(2, 2), entry(3, 3)];

        assert!(state.get_entry(0).is_none());
        assert_eq!(state.get_entry(2).unwrap().term, 2);
        assert!(state.get_entry(4).is_none());

        let entries = state.entries_from(2, 10);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].index, 2);

        assert_eq!(state.entries_from(1, 2).len(), 2);
        assert!(state.entries_from(10, 10).is_empty());
    }

    #[test]
    fn test_merge_truncates_at_first_conflict() {
        let mut state = RaftState::new();
        state.log = vec![entry(1, 1), entry(2, 1), entry(3, 1)];

        state.merge_entries(&[entry(2, 1), entry(3, 2), entry(4, 2)]);

        let terms: Vec<u64> = state.log.iter().map(|e| e.term).collect();
        assert_eq!(terms, vec![1, 1, 2, 2]);
        assert_eq!(state.last_log_index(), 4);
    }

    #[test]
    fn test_merge_ignores_stale_duplicate() {
        let mut state = RaftState::new();
        state.log = vec![entry(1, 1), entry(2, 1), entry(3, 1)];

        state.merge_entries(&[entry(2, 1)]);

        assert_eq!(state.log.len(), 3);
        assert!(!state.persist_needs.hard_state);
    }

    #[test]
    fn test_is_log_up_to_date() {
        let mut state = RaftState::new();

        // Empty log - any log is up-to-date
        assert!(state.is_log_up_to_date(0, 0));
        assert!(state.is_log_up_to_date(1, 1));

        state.log = vec![entry(1, 1), entry(2, 2)];

        // Higher term is always up-to-date
        assert!(state.is_log_up_to_date(1, 3));
        // Same term, same or higher index is up-to-date
        assert!(state.is_log_up_to_date(2, 2));
        assert!(state.is_log_up_to_date(3, 2));
        // Lower term is never up-to-date
        assert!(!state.is_log_up_to_date(5, 1));
        // Same term, lower index is not up-to-date
        assert!(!state.is_log_up_to_date(1, 2));
    }

    #[test]
    fn test_quorum_is_strict_majority() {
        assert_eq!(quorum_size(1), 1);
        assert_eq!(quorum_size(2), 2);
        assert_eq!(quorum_size(3), 2);
        assert_eq!(quorum_size(4), 3);
        assert_eq!(quorum_size(5), 3);
    }

    #[test]
    fn test_leader_commits_only_current_term_entries() {
        let mut state = RaftState::new();
        state.log = vec![entry(1, 1), entry(2, 2)];
        state.current_term = 3;
        state.become_leader(1, &[2, 3]);

        // Majority has index 2 but it belongs to term 2
        state.match_index.insert(2, 2);
        assert!(!state.advance_leader_commit(3));
        assert_eq!(state.commit_index, 0);

        // A current-term entry replicated on a majority commits everything before it
        state.append_entry(b"x".to_vec());
        state.match_index.insert(2, 3);
        assert!(state.advance_leader_commit(3));
        assert_eq!(state.commit_index, 3);
    }

    #[test]
    fn test_leader_commit_needs_majority_in_even_cluster() {
        let mut state = RaftState::new();
        state.current_term = 1;
        state.become_leader(1, &[2, 3, 4]);
        state.append_entry(b"x".to_vec());

        // Leader + one follower is only half of four
        state.match_index.insert(2, 1);
        assert!(!state.advance_leader_commit(4));

        state.match_index.insert(3, 1);
        assert!(state.advance_leader_commit(4));
        assert_eq!(state.commit_index, 1);
    }

    #[test]
    fn test_compact_keeps_matching_suffix() {
        let mut state = RaftState::new();
        state.log = (1..=5).map(|i| entry(i, 1)).collect();

        state.compact_to(3, 1, b"snap".to_vec());

        assert_eq!(state.snapshot_last_index, 3);
        assert_eq!(state.log.len(), 2);
        assert_eq!(state.log[0].index, 4);
        assert_eq!(state.last_log_index(), 5);
        assert_eq!(state.term_at(3), Some(1));
        assert!(state.get_entry(3).is_none());
        assert_eq!(state.entries_from(1, 10).len(), 2);
        assert!(state.persist_needs.snapshot);
    }

    #[test]
    fn test_compact_discards_conflicting_log() {
        let mut state = RaftState::new();
        state.log = (1..=5).map(|i| entry(i, 1)).collect();

        state.compact_to(8, 2, b"snap".to_vec());

        assert!(state.log.is_empty());
        assert_eq!(state.last_log_index(), 8);
        assert_eq!(state.last_log_term(), 2);
        assert_eq!(state.commit_index, 8);
    }

    #[test]
    fn test_state_transitions() {
        let mut state = RaftState::new();
        assert_eq!(state.role, RaftRole::Follower);

        state.become_candidate(1);
        assert_eq!(state.role, RaftRole::Candidate);
        assert_eq!(state.current_term, 1);

        assert_eq!(state.record_vote(2), 2);
        assert_eq!(state.record_vote(2), 2);
        state.become_leader(1, &[2, 3]);
        assert_eq!(state.role, RaftRole::Leader);

        state.become_follower(5);
        assert_eq!(state.role, RaftRole::Follower);
        assert_eq!(state.current_term, 5);
        assert!(state.next_index.is_empty());
    }
}
