use crate::NodeId;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TillerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("not the leader (known leader: {leader:?})")]
    NotLeader { leader: Option<NodeId> },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid data: {0}")]
    InvalidData(String),

    #[error("data corruption: {0}")]
    DataCorruption(String),

    #[error("channel disconnected: {0}")]
    ChannelDisconnected(&'static str),
}

pub type Result<T> = std::result::Result<T, TillerError>;
