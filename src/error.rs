// Crate-wide error type.
//
// One named variant per failure category, string payloads for context,
// `#[from]` conversions for the handful of upstream error types we
// actually touch. Consensus-safety-affecting failures (storage, log
// inconsistency) and liveness-only failures (timeout, transport) share
// this enum; callers distinguish by matching, not by type.

use crate::types::NodeId;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ClusterError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("RPC timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("not the leader (known leader: {leader_id:?})")]
    NotLeader { leader_id: Option<NodeId> },

    #[error("commit timeout")]
    CommitTimeout,

    #[error("no longer leader")]
    NoLongerLeader,

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("state machine error: {0}")]
    StateMachine(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, ClusterError>;

impl From<serde_json::Error> for ClusterError {
    fn from(e: serde_json::Error) -> Self {
        ClusterError::Serialization(e.to_string())
    }
}

impl From<bincode::error::EncodeError> for ClusterError {
    fn from(e: bincode::error::EncodeError) -> Self {
        ClusterError::Serialization(e.to_string())
    }
}

impl From<bincode::error::DecodeError> for ClusterError {
    fn from(e: bincode::error::DecodeError) -> Self {
        ClusterError::Serialization(e.to_string())
    }
}
