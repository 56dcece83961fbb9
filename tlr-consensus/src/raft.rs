//! Core Raft state machine.
//!
//! `RaftNode` is a pure, single-threaded state machine: it owns the
//! persistent state (term, vote, log), the volatile state (role, commit and
//! apply watermarks), and the leader bookkeeping (next/match indices). It
//! performs no I/O. Every handler returns the wire response together with
//! [`Effects`] telling the driver what must happen before the response may
//! leave the node (durable flush) and after (apply pipeline).
//!
//! # References
//!
//! - Raft Extended Paper: <https://raft.github.io/raft.pdf>

use crate::log::Log;
use crate::message::{AppendEntriesRequest, AppendEntriesResponse, VoteRequest, VoteResponse};
use bytes::Bytes;
use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};
use tlr_core::{LogEntry, LogId, NodeId, Term};

/// Raft node role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RaftState {
    /// Following a leader, voting when asked.
    Follower,
    /// Conducting an election.
    Candidate,
    /// Leading the cluster, replicating log entries.
    Leader,
}

/// Driver obligations produced by a handler: flush durable state before the
/// reply leaves the node, and/or drain newly committed entries afterwards.
#[derive(Debug, Clone, Copy, Default)]
pub struct Effects {
    pub persist: bool,
    pub apply: bool,
}

/// Outcome of a vote response seen by a candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoteTally {
    /// Quorum reached; the node is now leader.
    Won,
    /// The response carried a newer term; the node is now a follower and the
    /// driver must persist the term change.
    SteppedDown,
    /// Still collecting votes (or the response was stale and dropped).
    Pending,
}

pub struct RaftNode {
    id: NodeId,
    peer_ids: Vec<NodeId>,

    // Persistent state (flushed by the driver before dependent replies).
    state: RaftState,
    current_term: Term,
    voted_for: Option<NodeId>,
    log: Log,

    // Volatile state.
    commit_index: LogId,
    last_applied: LogId,
    leader_id: Option<NodeId>,
    last_heartbeat: Instant,

    // Leader state, reinitialized on every election win.
    next_index: HashMap<NodeId, LogId>,
    match_index: HashMap<NodeId, LogId>,

    // Candidate state.
    votes_received: HashSet<NodeId>,
}

impl RaftNode {
    #[must_use]
    pub fn new(id: NodeId, peer_ids: Vec<NodeId>) -> Self {
        Self {
            id,
            peer_ids,
            state: RaftState::Follower,
            current_term: 0,
            voted_for: None,
            log: Log::new(),
            commit_index: 0,
            last_applied: 0,
            leader_id: None,
            last_heartbeat: Instant::now(),
            next_index: HashMap::new(),
            match_index: HashMap::new(),
            votes_received: HashSet::new(),
        }
    }

    /// Install recovered durable state. Must run before the node serves RPCs.
    pub fn restore(&mut self, term: Term, voted_for: Option<NodeId>, entries: Vec<LogEntry>) {
        self.current_term = term;
        self.voted_for = voted_for;
        self.log = Log::from_entries(entries);
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    #[inline]
    #[must_use]
    pub const fn id(&self) -> NodeId {
        self.id
    }

    #[inline]
    #[must_use]
    pub const fn state(&self) -> RaftState {
        self.state
    }

    #[inline]
    #[must_use]
    pub const fn current_term(&self) -> Term {
        self.current_term
    }

    #[inline]
    #[must_use]
    pub const fn voted_for(&self) -> Option<NodeId> {
        self.voted_for
    }

    #[inline]
    #[must_use]
    pub const fn leader_id(&self) -> Option<NodeId> {
        self.leader_id
    }

    #[inline]
    #[must_use]
    pub const fn commit_index(&self) -> LogId {
        self.commit_index
    }

    #[inline]
    #[must_use]
    pub const fn last_applied(&self) -> LogId {
        self.last_applied
    }

    #[must_use]
    pub fn log(&self) -> &Log {
        &self.log
    }

    /// Number of voting members, this node included.
    #[must_use]
    pub fn cluster_size(&self) -> usize {
        self.peer_ids.len() + 1
    }

    /// Votes or replicas required for quorum: strictly more than half.
    #[must_use]
    pub fn majority(&self) -> usize {
        self.cluster_size() / 2 + 1
    }

    /// Has the election threshold elapsed since the last valid leader contact
    /// (AppendEntries from a current leader, or a vote we granted)?
    #[must_use]
    pub fn election_timed_out(&self, threshold: Duration) -> bool {
        self.last_heartbeat.elapsed() > threshold
    }

    // =========================================================================
    // Role transitions
    // =========================================================================

    /// Leave the follower role after a heartbeat timeout. The election itself
    /// (term increment, self vote) happens on candidate entry.
    pub fn to_candidate(&mut self) {
        self.state = RaftState::Candidate;
    }

    /// Begin a new election round: bump the term, vote for self, forget the
    /// old leader. The driver must persist before broadcasting the request.
    pub fn start_election(&mut self) -> VoteRequest {
        self.state = RaftState::Candidate;
        self.current_term += 1;
        self.voted_for = Some(self.id);
        self.leader_id = None;
        self.votes_received.clear();
        self.votes_received.insert(self.id);

        tracing::info!(
            target: "tiller::raft",
            node_id = self.id,
            term = self.current_term,
            "Starting election"
        );

        self.vote_request()
    }

    /// The RequestVote broadcast for the current election round.
    #[must_use]
    pub fn vote_request(&self) -> VoteRequest {
        VoteRequest {
            term: self.current_term,
            candidate_id: self.id,
            last_log_id: self.log.last_id(),
            last_log_term: self.log.last_term(),
        }
    }

    /// `true` when the granted votes collected so far (self included) form a
    /// quorum. Checked on candidate entry so a single-node cluster wins
    /// without any network traffic.
    #[must_use]
    pub fn has_vote_quorum(&self) -> bool {
        self.votes_received.len() >= self.majority()
    }

    /// Step down, adopting `term` if it is newer. Returns `true` when the
    /// term advanced, in which case the vote was cleared and the driver must
    /// persist. A same-term step-down (candidate hearing a legitimate leader)
    /// keeps the vote: one vote per term.
    fn become_follower(&mut self, term: Term) -> bool {
        let was_leader = self.state == RaftState::Leader;
        let term_advanced = term > self.current_term;

        self.state = RaftState::Follower;
        self.votes_received.clear();
        if term_advanced {
            self.current_term = term;
            self.voted_for = None;
        }

        if was_leader {
            tracing::warn!(
                target: "tiller::raft",
                node_id = self.id,
                term = self.current_term,
                "Stepped down from leader"
            );
        }

        term_advanced
    }

    /// Election won: reinitialize the replication indices for every peer.
    pub fn become_leader(&mut self) {
        self.state = RaftState::Leader;
        self.leader_id = Some(self.id);
        self.votes_received.clear();

        let next = self.log.last_id() + 1;
        for &peer in &self.peer_ids {
            self.next_index.insert(peer, next);
            self.match_index.insert(peer, 0);
        }

        tracing::info!(
            target: "tiller::raft",
            node_id = self.id,
            term = self.current_term,
            "Became leader"
        );
    }

    // =========================================================================
    // RequestVote (receive side)
    // =========================================================================

    pub fn handle_vote_request(&mut self, req: &VoteRequest) -> (VoteResponse, Effects) {
        let mut effects = Effects::default();

        // Stale candidate: reject without touching the election timer.
        if req.term < self.current_term {
            tracing::debug!(
                target: "tiller::raft",
                node_id = self.id,
                term = self.current_term,
                candidate = req.candidate_id,
                candidate_term = req.term,
                "Rejecting vote request from older term"
            );
            return (self.vote_response(false), effects);
        }

        if req.term > self.current_term {
            effects.persist |= self.become_follower(req.term);
        }

        // One vote per term.
        if let Some(voted) = self.voted_for {
            if voted != req.candidate_id {
                tracing::debug!(
                    target: "tiller::raft",
                    node_id = self.id,
                    term = self.current_term,
                    voted_for = voted,
                    candidate = req.candidate_id,
                    "Rejecting vote request, already voted this term"
                );
                return (self.vote_response(false), effects);
            }
        }

        // Raft §5.4.1: only vote for candidates whose log is at least as
        // up-to-date as ours.
        if !self.candidate_log_up_to_date(req.last_log_id, req.last_log_term) {
            tracing::debug!(
                target: "tiller::raft",
                node_id = self.id,
                term = self.current_term,
                candidate = req.candidate_id,
                "Rejecting vote request, candidate log is behind"
            );
            return (self.vote_response(false), effects);
        }

        self.voted_for = Some(req.candidate_id);
        effects.persist = true;
        // A granted vote counts as leader contact; a rejected one does not.
        self.last_heartbeat = Instant::now();

        tracing::info!(
            target: "tiller::raft",
            node_id = self.id,
            term = self.current_term,
            candidate = req.candidate_id,
            "Granted vote"
        );

        (self.vote_response(true), effects)
    }

    fn vote_response(&self, vote_granted: bool) -> VoteResponse {
        VoteResponse {
            term: self.current_term,
            vote_granted,
        }
    }

    /// Compare terms first, then ids.
    fn candidate_log_up_to_date(&self, last_log_id: LogId, last_log_term: Term) -> bool {
        if last_log_term != self.log.last_term() {
            last_log_term > self.log.last_term()
        } else {
            last_log_id >= self.log.last_id()
        }
    }

    /// Tally a vote response (candidate only). Stale responses (an older
    /// term, or any response arriving after the role changed) are dropped.
    pub fn handle_vote_response(&mut self, from: NodeId, resp: &VoteResponse) -> VoteTally {
        if resp.term > self.current_term {
            self.become_follower(resp.term);
            tracing::info!(
                target: "tiller::raft",
                node_id = self.id,
                peer = from,
                term = self.current_term,
                "Newer term on vote response, stepping down"
            );
            return VoteTally::SteppedDown;
        }

        if self.state != RaftState::Candidate || resp.term < self.current_term {
            return VoteTally::Pending;
        }

        if resp.vote_granted {
            self.votes_received.insert(from);
            tracing::debug!(
                target: "tiller::raft",
                node_id = self.id,
                peer = from,
                granted = self.votes_received.len(),
                needed = self.majority(),
                "Vote granted"
            );
            if self.has_vote_quorum() {
                self.become_leader();
                return VoteTally::Won;
            }
        }

        VoteTally::Pending
    }

    // =========================================================================
    // AppendEntries (receive side)
    // =========================================================================

    /// Handle a replication request or heartbeat. Steps run in a fixed order:
    /// stale-term rejection, leader-contact bookkeeping, term adoption,
    /// same-term demotion, consistency check, conflict-aware append, commit
    /// advancement.
    pub fn handle_append_entries(
        &mut self,
        req: &AppendEntriesRequest,
    ) -> (AppendEntriesResponse, Effects) {
        let mut effects = Effects::default();

        if req.term < self.current_term {
            tracing::debug!(
                target: "tiller::raft",
                node_id = self.id,
                term = self.current_term,
                leader_term = req.term,
                "Rejecting append entries from older term"
            );
            return (self.append_response(false), effects);
        }

        // From here on the sender is a legitimate leader of this term or
        // later: reset the election timer and remember it for redirects.
        self.last_heartbeat = Instant::now();
        self.leader_id = Some(req.leader_id);

        if req.term > self.current_term {
            effects.persist |= self.become_follower(req.term);
        }
        if self.state != RaftState::Follower {
            // Same-term AppendEntries can only come from the term's elected
            // leader; a candidate (or a split leader) yields to it.
            self.become_follower(req.term);
        }

        // Log-matching check on the entry preceding the batch.
        if req.prev_log_id > 0 && !self.log.matches(req.prev_log_id, req.prev_log_term) {
            tracing::debug!(
                target: "tiller::raft",
                node_id = self.id,
                prev_log_id = req.prev_log_id,
                prev_log_term = req.prev_log_term,
                local_term = self.log.term_at(req.prev_log_id),
                "Previous log entry missing or mismatched"
            );
            return (self.append_response(false), effects);
        }

        // A conformant leader sends a contiguous batch anchored at
        // prev_log_id; reject anything else before touching the log.
        for (i, entry) in req.entries.iter().enumerate() {
            if entry.id != req.prev_log_id + 1 + i as u64 {
                tracing::warn!(
                    target: "tiller::raft",
                    node_id = self.id,
                    entry_id = entry.id,
                    prev_log_id = req.prev_log_id,
                    "Rejecting non-contiguous append batch"
                );
                return (self.append_response(false), effects);
            }
        }

        // Conflict-aware append: skip entries we already hold, truncate from
        // the first conflicting id, append the rest. Re-delivery of a
        // duplicate request leaves the log untouched.
        for entry in &req.entries {
            match self.log.term_at(entry.id) {
                Some(term) if term == entry.term => {}
                Some(_) => {
                    self.log.truncate_from(entry.id);
                    self.log.append(entry.clone());
                    effects.persist = true;
                }
                None => {
                    self.log.append(entry.clone());
                    effects.persist = true;
                }
            }
        }
        if effects.persist && !req.entries.is_empty() {
            tracing::debug!(
                target: "tiller::raft",
                node_id = self.id,
                entries = req.entries.len(),
                last_log_id = self.log.last_id(),
                "Appended entries from leader"
            );
        }

        if req.leader_commit_id > self.commit_index {
            self.commit_index = req.leader_commit_id.min(self.log.last_id());
            effects.apply = true;
            tracing::debug!(
                target: "tiller::raft",
                node_id = self.id,
                commit_index = self.commit_index,
                "Commit index advanced from leader"
            );
        }

        (self.append_response(true), effects)
    }

    fn append_response(&self, success: bool) -> AppendEntriesResponse {
        AppendEntriesResponse {
            term: self.current_term,
            success,
        }
    }

    // =========================================================================
    // Leader (send side)
    // =========================================================================

    /// Build the AppendEntries request for `peer`: everything from its next
    /// index (empty for a pure heartbeat), anchored at the preceding entry.
    #[must_use]
    pub fn append_request_for(&self, peer: NodeId) -> AppendEntriesRequest {
        let next = self
            .next_index
            .get(&peer)
            .copied()
            .unwrap_or_else(|| self.log.last_id() + 1);
        let prev_log_id = next - 1;

        AppendEntriesRequest {
            term: self.current_term,
            leader_id: self.id,
            prev_log_id,
            prev_log_term: self.log.term_at(prev_log_id).unwrap_or(0),
            entries: self.log.entries_from(next),
            leader_commit_id: self.commit_index,
        }
    }

    /// Append a client command to the local log (leader only). The driver
    /// persists before acknowledging the client.
    pub fn append_local(&mut self, data: Bytes) -> LogEntry {
        debug_assert_eq!(self.state, RaftState::Leader);
        let entry = LogEntry::new(self.log.last_id() + 1, self.current_term, data);
        self.log.append(entry.clone());
        entry
    }

    /// Reconcile an AppendEntries response against the request context it
    /// answers (`sent_term`, `prev_log_id`, `entries_len`). Responses from a
    /// superseded term or role are dropped; match-index updates are monotone
    /// so reordered replies cannot regress replication state.
    pub fn handle_append_response(
        &mut self,
        from: NodeId,
        sent_term: Term,
        prev_log_id: LogId,
        entries_len: u64,
        resp: &AppendEntriesResponse,
    ) -> Effects {
        let mut effects = Effects::default();

        if resp.term > self.current_term {
            self.become_follower(resp.term);
            tracing::info!(
                target: "tiller::raft",
                node_id = self.id,
                peer = from,
                term = self.current_term,
                "Newer term on append response, stepping down"
            );
            effects.persist = true;
            return effects;
        }

        if self.state != RaftState::Leader
            || sent_term != self.current_term
            || resp.term < self.current_term
        {
            return effects;
        }

        if resp.success {
            if entries_len > 0 {
                let acked = prev_log_id + entries_len;
                let matched = self.match_index.entry(from).or_insert(0);
                if acked > *matched {
                    *matched = acked;
                }
                let matched = *matched;
                self.next_index.insert(from, matched + 1);
                tracing::debug!(
                    target: "tiller::raft",
                    node_id = self.id,
                    peer = from,
                    match_index = matched,
                    "Append entries acknowledged"
                );
            }
        } else {
            // Log inconsistency: back off one entry and retry next tick.
            let next = self.next_index.entry(from).or_insert(1);
            *next = next.saturating_sub(1).max(1);
            tracing::debug!(
                target: "tiller::raft",
                node_id = self.id,
                peer = from,
                next_index = *next,
                "Append entries rejected, backing off"
            );
        }

        effects.apply = self.advance_commit();
        effects
    }

    /// Commitment rule: the largest N > commitIndex replicated on a quorum
    /// (self counts via its own log tail) whose entry carries the current
    /// term. Entries from earlier terms commit only transitively beneath a
    /// current-term entry.
    pub fn advance_commit(&mut self) -> bool {
        if self.state != RaftState::Leader {
            return false;
        }

        for n in (self.commit_index + 1..=self.log.last_id()).rev() {
            let replicas = 1 + self
                .peer_ids
                .iter()
                .filter(|peer| self.match_index.get(peer).copied().unwrap_or(0) >= n)
                .count();
            if replicas < self.majority() {
                continue;
            }
            if self.log.term_at(n) != Some(self.current_term) {
                // Every entry below carries an even older term.
                return false;
            }
            self.commit_index = n;
            tracing::info!(
                target: "tiller::raft",
                node_id = self.id,
                commit_index = n,
                replicas,
                "Commit index advanced"
            );
            return true;
        }

        false
    }

    // =========================================================================
    // Apply pipeline
    // =========================================================================

    /// Next committed-but-unapplied entry, in strict id order.
    #[must_use]
    pub fn next_unapplied(&self) -> Option<LogEntry> {
        if self.last_applied < self.commit_index {
            self.log.get(self.last_applied + 1).cloned()
        } else {
            None
        }
    }

    /// Advance the applied watermark after a delivery.
    pub fn mark_applied(&mut self, id: LogId) {
        debug_assert_eq!(id, self.last_applied + 1, "entries apply in order");
        self.last_applied = id;
    }
}
