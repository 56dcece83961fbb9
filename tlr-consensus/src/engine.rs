//! Single-owner event loop driving the Raft state machine.
//!
//! Exactly one task owns the mutable state: inbound RPCs, client submits and
//! status probes arrive as [`Inbound`] events on one channel, each carrying a
//! oneshot reply sink; timers fire inside the role loops; outbound RPCs run
//! on fire-and-forget tasks that push replies back onto per-role reply
//! channels consumed by the same loop. There are no locks because there is no
//! concurrent access.
//!
//! Returning from a role function re-enters the outer loop, which re-reads
//! the role and dispatches again; this is the only way the role changes hands.
//! Durable state is flushed before any reply or outbound RPC that reflects
//! it; a failed flush is fatal and stops the engine.

use crate::config::RaftConfig;
use crate::message::{AppendEntriesRequest, AppendEntriesResponse, VoteRequest, VoteResponse};
use crate::peer::Peer;
use crate::persist::{self, Persister};
use crate::raft::{RaftNode, RaftState, VoteTally};
use bytes::Bytes;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tlr_core::{LogEntry, LogId, NodeId, Result, Term, TillerError};
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, error, info, trace, warn};

/// Events multiplexed onto the engine's single inbound channel.
enum Inbound {
    RequestVote {
        req: VoteRequest,
        tx: oneshot::Sender<VoteResponse>,
    },
    AppendEntries {
        req: AppendEntriesRequest,
        tx: oneshot::Sender<AppendEntriesResponse>,
    },
    ApplyCommand {
        data: Bytes,
        tx: oneshot::Sender<Result<LogEntry>>,
    },
    Status {
        tx: oneshot::Sender<RaftStatus>,
    },
}

/// Vote broadcast reply, tagged with the responding peer.
struct VoteReply {
    peer: NodeId,
    resp: VoteResponse,
}

/// Append broadcast reply, tagged with the request context needed to
/// reconcile it under reordering.
struct AppendReply {
    peer: NodeId,
    sent_term: Term,
    prev_log_id: LogId,
    entries_len: u64,
    resp: AppendEntriesResponse,
}

/// What serving an inbound event implies for the current role loop.
enum Served {
    Quiet,
    /// A client command was appended; the leader loop replicates immediately
    /// instead of waiting for the next tick.
    AppendedCommand,
}

/// Point-in-time snapshot of a running engine, served through the inbound
/// channel so it is consistent with the state machine.
#[derive(Debug, Clone)]
pub struct RaftStatus {
    pub id: NodeId,
    pub state: RaftState,
    pub term: Term,
    pub voted_for: Option<NodeId>,
    pub last_log_id: LogId,
    pub last_log_term: Term,
    pub commit_index: LogId,
    pub last_applied: LogId,
    pub leader_id: Option<NodeId>,
}

/// Clonable surface of a running engine.
///
/// The host transport calls [`request_vote`](Self::request_vote) and
/// [`append_entries`](Self::append_entries) for inbound peer messages;
/// clients call [`apply_command`](Self::apply_command).
#[derive(Clone)]
pub struct RaftHandle {
    tx: mpsc::Sender<Inbound>,
}

impl RaftHandle {
    pub async fn request_vote(&self, req: VoteRequest) -> Result<VoteResponse> {
        self.call(|tx| Inbound::RequestVote { req, tx }).await
    }

    pub async fn append_entries(&self, req: AppendEntriesRequest) -> Result<AppendEntriesResponse> {
        self.call(|tx| Inbound::AppendEntries { req, tx }).await
    }

    /// Submit a command. On the leader this durably appends a new entry and
    /// returns it immediately; commitment is observed on the apply stream.
    /// Elsewhere it fails with [`TillerError::NotLeader`] carrying the last
    /// known leader as a redirect hint.
    pub async fn apply_command(&self, data: Bytes) -> Result<LogEntry> {
        self.call(|tx| Inbound::ApplyCommand { data, tx }).await?
    }

    pub async fn status(&self) -> Result<RaftStatus> {
        self.call(|tx| Inbound::Status { tx }).await
    }

    async fn call<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Inbound) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(make(tx))
            .await
            .map_err(|_| TillerError::ChannelDisconnected("engine inbound channel"))?;
        rx.await
            .map_err(|_| TillerError::ChannelDisconnected("engine reply channel"))
    }
}

/// The consensus engine for one node.
///
/// Created with the cluster's peer handles and a [`Persister`], then driven
/// to completion with [`run`](Self::run). All interaction goes through the
/// [`RaftHandle`] and the apply stream returned by [`new`](Self::new).
pub struct RaftEngine<P, S> {
    config: RaftConfig,
    node: RaftNode,
    peers: HashMap<NodeId, Arc<P>>,
    persister: S,
    inbound_rx: mpsc::Receiver<Inbound>,
    apply_tx: mpsc::Sender<LogEntry>,
    apply_stream_open: bool,
}

impl<P, S> RaftEngine<P, S>
where
    P: Peer + 'static,
    S: Persister,
{
    /// Build an engine. Returns the engine itself, the handle the host wires
    /// into its transport and clients, and the single-consumer stream of
    /// committed entries in strict id order.
    pub fn new(
        id: NodeId,
        peers: HashMap<NodeId, P>,
        persister: S,
        config: RaftConfig,
    ) -> Result<(Self, RaftHandle, mpsc::Receiver<LogEntry>)> {
        config.validate()?;
        if peers.contains_key(&id) {
            return Err(TillerError::Config(format!(
                "peer map must not contain the node's own id {id}"
            )));
        }

        let (inbound_tx, inbound_rx) = mpsc::channel(config.rpc_channel_capacity);
        let (apply_tx, apply_rx) = mpsc::channel(config.apply_channel_capacity);

        let peer_ids: Vec<NodeId> = peers.keys().copied().collect();
        let engine = Self {
            config,
            node: RaftNode::new(id, peer_ids),
            peers: peers.into_iter().map(|(id, p)| (id, Arc::new(p))).collect(),
            persister,
            inbound_rx,
            apply_tx,
            apply_stream_open: true,
        };

        Ok((engine, RaftHandle { tx: inbound_tx }, apply_rx))
    }

    /// Run the engine until `shutdown` fires (or its sender is dropped).
    ///
    /// Loads persisted state first; a load failure aborts startup. A failed
    /// durable flush later is equally fatal: the persist-before-reply
    /// discipline cannot be honored, so the node stops participating.
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
        if let Err(e) = self.load_state() {
            error!(
                target: "tiller::engine",
                node_id = self.node.id(),
                error = %e,
                "Failed to load persisted state"
            );
            return Err(e);
        }

        info!(
            target: "tiller::engine",
            node_id = self.node.id(),
            term = self.node.current_term(),
            voted_for = ?self.node.voted_for(),
            log_entries = self.node.log().len(),
            "Starting raft engine"
        );

        loop {
            let keep_running = match self.node.state() {
                RaftState::Follower => self.run_follower(&mut shutdown).await,
                RaftState::Candidate => self.run_candidate(&mut shutdown).await,
                RaftState::Leader => self.run_leader(&mut shutdown).await,
            };

            match keep_running {
                Ok(true) => {}
                Ok(false) => {
                    info!(
                        target: "tiller::engine",
                        node_id = self.node.id(),
                        "Engine stopped gracefully"
                    );
                    return Ok(());
                }
                Err(e) => {
                    error!(
                        target: "tiller::engine",
                        node_id = self.node.id(),
                        error = %e,
                        "Engine stopped on fatal error"
                    );
                    return Err(e);
                }
            }
        }
    }

    // =========================================================================
    // Role loops
    // =========================================================================

    async fn run_follower(&mut self, shutdown: &mut broadcast::Receiver<()>) -> Result<bool> {
        debug!(
            target: "tiller::engine",
            node_id = self.node.id(),
            term = self.node.current_term(),
            "Running follower"
        );

        let timeout = tokio::time::sleep(random_timeout(self.config.heartbeat_timeout));
        tokio::pin!(timeout);

        while self.node.state() == RaftState::Follower {
            tokio::select! {
                () = timeout.as_mut() => {
                    if self.node.election_timed_out(self.config.heartbeat_timeout) {
                        info!(
                            target: "tiller::engine",
                            node_id = self.node.id(),
                            term = self.node.current_term(),
                            "Heartbeat timeout, standing for election"
                        );
                        self.node.to_candidate();
                    } else {
                        timeout.as_mut().reset(
                            tokio::time::Instant::now()
                                + random_timeout(self.config.heartbeat_timeout),
                        );
                    }
                }
                event = self.inbound_rx.recv() => {
                    let Some(event) = event else { return Ok(false) };
                    self.serve(event).await?;
                }
                _ = shutdown.recv() => return Ok(false),
            }
        }
        Ok(true)
    }

    async fn run_candidate(&mut self, shutdown: &mut broadcast::Receiver<()>) -> Result<bool> {
        // Entering candidacy is itself the retry path: every (re-)entry bumps
        // the term, votes for self and rebroadcasts with a fresh random
        // election window.
        let vote_req = self.node.start_election();
        self.save_state()?;

        // A single-node cluster is its own quorum.
        if self.node.has_vote_quorum() {
            self.node.become_leader();
            return Ok(true);
        }

        let (reply_tx, mut reply_rx) = mpsc::channel::<VoteReply>(self.peers.len().max(1));
        self.broadcast_request_vote(&vote_req, &reply_tx, shutdown);

        let timeout = tokio::time::sleep(random_timeout(self.config.heartbeat_timeout));
        tokio::pin!(timeout);

        while self.node.state() == RaftState::Candidate {
            tokio::select! {
                () = timeout.as_mut() => {
                    debug!(
                        target: "tiller::engine",
                        node_id = self.node.id(),
                        term = self.node.current_term(),
                        "Election timed out, restarting"
                    );
                    return Ok(true);
                }
                Some(reply) = reply_rx.recv() => {
                    if self.node.handle_vote_response(reply.peer, &reply.resp)
                        == VoteTally::SteppedDown
                    {
                        self.save_state()?;
                    }
                }
                event = self.inbound_rx.recv() => {
                    let Some(event) = event else { return Ok(false) };
                    self.serve(event).await?;
                }
                _ = shutdown.recv() => return Ok(false),
            }
        }
        Ok(true)
    }

    async fn run_leader(&mut self, shutdown: &mut broadcast::Receiver<()>) -> Result<bool> {
        debug!(
            target: "tiller::engine",
            node_id = self.node.id(),
            term = self.node.current_term(),
            "Running leader"
        );

        // The first tick fires immediately, announcing leadership.
        let mut ticker = tokio::time::interval(self.config.heartbeat_interval);
        let (reply_tx, mut reply_rx) = mpsc::channel::<AppendReply>(self.peers.len().max(1));

        while self.node.state() == RaftState::Leader {
            tokio::select! {
                _ = ticker.tick() => {
                    self.broadcast_append_entries(&reply_tx, shutdown);
                }
                Some(reply) = reply_rx.recv() => {
                    let effects = self.node.handle_append_response(
                        reply.peer,
                        reply.sent_term,
                        reply.prev_log_id,
                        reply.entries_len,
                        &reply.resp,
                    );
                    if effects.persist {
                        self.save_state()?;
                    }
                    if effects.apply {
                        self.apply_committed().await;
                    }
                }
                event = self.inbound_rx.recv() => {
                    let Some(event) = event else { return Ok(false) };
                    if matches!(self.serve(event).await?, Served::AppendedCommand) {
                        self.broadcast_append_entries(&reply_tx, shutdown);
                    }
                }
                _ = shutdown.recv() => return Ok(false),
            }
        }
        Ok(true)
    }

    // =========================================================================
    // Inbound events
    // =========================================================================

    async fn serve(&mut self, event: Inbound) -> Result<Served> {
        match event {
            Inbound::RequestVote { req, tx } => {
                let (resp, effects) = self.node.handle_vote_request(&req);
                if effects.persist {
                    self.save_state()?;
                }
                let _ = tx.send(resp);
                Ok(Served::Quiet)
            }
            Inbound::AppendEntries { req, tx } => {
                let (resp, effects) = self.node.handle_append_entries(&req);
                if effects.persist {
                    self.save_state()?;
                }
                let _ = tx.send(resp);
                if effects.apply {
                    self.apply_committed().await;
                }
                Ok(Served::Quiet)
            }
            Inbound::ApplyCommand { data, tx } => {
                if self.node.state() != RaftState::Leader {
                    let _ = tx.send(Err(TillerError::NotLeader {
                        leader: self.node.leader_id(),
                    }));
                    return Ok(Served::Quiet);
                }

                let entry = self.node.append_local(data);
                self.save_state()?;
                info!(
                    target: "tiller::engine",
                    node_id = self.node.id(),
                    id = entry.id,
                    term = entry.term,
                    "Accepted client command"
                );
                let _ = tx.send(Ok(entry));

                // A single-node cluster commits without network traffic.
                if self.node.advance_commit() {
                    self.apply_committed().await;
                }
                Ok(Served::AppendedCommand)
            }
            Inbound::Status { tx } => {
                let _ = tx.send(self.status());
                Ok(Served::Quiet)
            }
        }
    }

    fn status(&self) -> RaftStatus {
        RaftStatus {
            id: self.node.id(),
            state: self.node.state(),
            term: self.node.current_term(),
            voted_for: self.node.voted_for(),
            last_log_id: self.node.log().last_id(),
            last_log_term: self.node.log().last_term(),
            commit_index: self.node.commit_index(),
            last_applied: self.node.last_applied(),
            leader_id: self.node.leader_id(),
        }
    }

    // =========================================================================
    // Outbound broadcasts
    // =========================================================================

    /// One fire-and-forget task per peer so a slow or dead peer cannot stall
    /// the loop. Tasks carry an immutable request snapshot, never touch
    /// engine state, and are cancelled by the shutdown signal; transport
    /// failures are logged and retried implicitly on the next round.
    fn broadcast_request_vote(
        &self,
        req: &VoteRequest,
        reply_tx: &mpsc::Sender<VoteReply>,
        shutdown: &broadcast::Receiver<()>,
    ) {
        debug!(
            target: "tiller::engine",
            node_id = self.node.id(),
            term = req.term,
            "Broadcasting vote request"
        );

        for (&peer_id, peer) in &self.peers {
            let peer = Arc::clone(peer);
            let req = req.clone();
            let reply_tx = reply_tx.clone();
            let mut shutdown = shutdown.resubscribe();
            tokio::spawn(async move {
                tokio::select! {
                    result = peer.request_vote(req) => match result {
                        Ok(resp) => {
                            let _ = reply_tx.send(VoteReply { peer: peer_id, resp }).await;
                        }
                        Err(e) => warn!(
                            target: "tiller::engine",
                            peer = peer_id,
                            error = %e,
                            "RequestVote RPC failed"
                        ),
                    },
                    _ = shutdown.recv() => {}
                }
            });
        }
    }

    fn broadcast_append_entries(
        &self,
        reply_tx: &mpsc::Sender<AppendReply>,
        shutdown: &broadcast::Receiver<()>,
    ) {
        for (&peer_id, peer) in &self.peers {
            let req = self.node.append_request_for(peer_id);
            trace!(
                target: "tiller::engine",
                node_id = self.node.id(),
                peer = peer_id,
                prev_log_id = req.prev_log_id,
                entries = req.entries.len(),
                "Sending append entries"
            );

            let sent_term = req.term;
            let prev_log_id = req.prev_log_id;
            let entries_len = req.entries.len() as u64;
            let peer = Arc::clone(peer);
            let reply_tx = reply_tx.clone();
            let mut shutdown = shutdown.resubscribe();
            tokio::spawn(async move {
                tokio::select! {
                    result = peer.append_entries(req) => match result {
                        Ok(resp) => {
                            let _ = reply_tx
                                .send(AppendReply {
                                    peer: peer_id,
                                    sent_term,
                                    prev_log_id,
                                    entries_len,
                                    resp,
                                })
                                .await;
                        }
                        Err(e) => warn!(
                            target: "tiller::engine",
                            peer = peer_id,
                            error = %e,
                            "AppendEntries RPC failed"
                        ),
                    },
                    _ = shutdown.recv() => {}
                }
            });
        }
    }

    // =========================================================================
    // Apply pipeline & durability
    // =========================================================================

    /// Deliver committed entries in strict id order, advancing the applied
    /// watermark after each delivery. The channel is bounded and may block
    /// the loop when the host falls behind; entries are never skipped or
    /// reordered.
    async fn apply_committed(&mut self) {
        while let Some(entry) = self.node.next_unapplied() {
            let id = entry.id;
            if self.apply_tx.send(entry).await.is_err() && self.apply_stream_open {
                self.apply_stream_open = false;
                warn!(
                    target: "tiller::engine",
                    node_id = self.node.id(),
                    id,
                    "Apply stream receiver dropped, committed entries will not be delivered"
                );
            }
            self.node.mark_applied(id);
        }
    }

    fn save_state(&mut self) -> Result<()> {
        let blob = persist::encode_state(
            self.node.current_term(),
            self.node.voted_for(),
            self.node.log(),
        );
        self.persister.save(&blob)
    }

    fn load_state(&mut self) -> Result<()> {
        let Some(blob) = self.persister.load()? else {
            info!(
                target: "tiller::engine",
                node_id = self.node.id(),
                "No persisted state, starting fresh"
            );
            return Ok(());
        };

        let (term, voted_for, entries) = persist::decode_state(&blob)?;
        info!(
            target: "tiller::engine",
            node_id = self.node.id(),
            term,
            voted_for = ?voted_for,
            log_entries = entries.len(),
            "Restored persisted state"
        );
        self.node.restore(term, voted_for, entries);
        Ok(())
    }
}

/// Fresh random duration in `[base, 2 * base)`, drawn on every timer arm and
/// every candidacy so elections desynchronize across the cluster.
fn random_timeout(base: Duration) -> Duration {
    let mut hasher = DefaultHasher::new();
    SystemTime::now().hash(&mut hasher);
    let jitter = hasher.finish() % (base.as_millis().max(1) as u64);
    base + Duration::from_millis(jitter)
}
