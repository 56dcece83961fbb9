#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![allow(clippy::module_name_repetitions)]

mod config;
mod engine;
mod log;
mod message;
mod peer;
mod persist;
mod raft;

pub use config::RaftConfig;
pub use engine::{RaftEngine, RaftHandle, RaftStatus};
pub use log::Log;
pub use message::{AppendEntriesRequest, AppendEntriesResponse, VoteRequest, VoteResponse};
pub use peer::{Peer, RpcFuture};
pub use persist::{FilePersister, MemoryPersister, Persister};
pub use raft::{Effects, RaftNode, RaftState, VoteTally};
