//! Error types for the runtime.

use thiserror::Error;

/// Result type for node operations.
pub type Result<T> = std::result::Result<T, NodeError>;

/// Error type boxed by [`StateMachine`](crate::StateMachine) implementations.
pub type FsmError = Box<dyn std::error::Error + Send + Sync>;

/// Errors surfaced by the replicated node.
#[derive(Debug, Error)]
pub enum NodeError {
    /// Invalid or contradictory configuration. Fatal at startup.
    #[error("configuration error: {0}")]
    Config(String),

    /// WAL or snapshot durability failure. Fatal to the Ready loop.
    #[error("storage error: {0}")]
    Storage(String),

    /// Error returned by the Raft engine on propose/step.
    #[error("raft error: {0}")]
    Raft(#[from] raft::Error),

    /// The user state machine failed to apply or restore. Fatal to the
    /// Ready loop: replicas must not diverge.
    #[error("state machine error: {0}")]
    Fsm(#[source] FsmError),

    /// Join/rejoin/leave handshake failure after the backoff budget.
    #[error("membership error: {0}")]
    Membership(String),

    /// Peer transport setup failure. Send-side losses are absorbed, not
    /// reported through this variant.
    #[error("transport error: {0}")]
    Transport(String),

    /// Waiting for a conf-change commit exceeded its deadline.
    #[error("timed out waiting for config change")]
    ConfChangeTimeout,

    /// This node's id appeared in a committed `RemoveNode` entry. The
    /// Ready loop exits deliberately with this sentinel.
    #[error("removed from cluster")]
    RemovedFromCluster,

    /// The node is not running (never started, stopping, or its Ready
    /// loop has exited).
    #[error("node is not running")]
    Stopped,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for NodeError {
    fn from(e: serde_json::Error) -> Self {
        NodeError::Serialization(e.to_string())
    }
}

impl From<protobuf::ProtobufError> for NodeError {
    fn from(e: protobuf::ProtobufError) -> Self {
        NodeError::Serialization(e.to_string())
    }
}

impl NodeError {
    /// Whether this error is the deliberate self-removal exit, as opposed
    /// to a failure.
    pub fn is_removed(&self) -> bool {
        matches!(self, NodeError::RemovedFromCluster)
    }
}
