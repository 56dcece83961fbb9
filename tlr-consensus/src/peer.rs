//! Peer transport contract.
//!
//! The engine talks to each remote node through one [`Peer`] handle supplied
//! by the host. The wire protocol, connection management, and authentication
//! are entirely the host's concern.

use crate::message::{AppendEntriesRequest, AppendEntriesResponse, VoteRequest, VoteResponse};
use std::future::Future;
use std::pin::Pin;
use tlr_core::Result;

/// A future that resolves to the peer's reply, or a transport error on an
/// unreachable peer or timeout.
pub type RpcFuture<T> = Pin<Box<dyn Future<Output = Result<T>> + Send>>;

/// One remote peer.
///
/// Methods take `&self` and return `'static` futures, so implementations
/// clone whatever they need (a connection pool handle, a channel sender) into
/// the future. The engine fires these calls on detached tasks: a slow peer
/// only delays its own reply, never the consensus loop. Transport errors are
/// logged by the engine and retried implicitly on the next heartbeat round.
pub trait Peer: Send + Sync {
    fn request_vote(&self, req: VoteRequest) -> RpcFuture<VoteResponse>;

    fn append_entries(&self, req: AppendEntriesRequest) -> RpcFuture<AppendEntriesResponse>;
}
