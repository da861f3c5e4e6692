//! Cheap, cloneable access to a running node.
//!
//! The Ready loop owns the raft instance outright; everything else (HTTP
//! handlers, the public [`Node`](super::Node) surface, tests) talks to it
//! through a request channel plus the shared registries.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use raft::eraftpb::{ConfChange, Message};
use tokio::sync::{mpsc, oneshot};

use super::{NodeState, Shared};
use crate::error::{NodeError, Result};
use crate::types::PeerMap;

/// A request consumed by the Ready loop.
pub(crate) enum NodeRequest {
    Propose {
        data: Vec<u8>,
        reply: oneshot::Sender<Result<()>>,
    },
    ProposeConfChange {
        cc: ConfChange,
        reply: oneshot::Sender<Result<()>>,
    },
    /// An inbound raft message from a peer.
    Step(Message),
    Status {
        reply: oneshot::Sender<NodeStatus>,
    },
}

/// Point-in-time view of the raft engine's state.
#[derive(Debug, Clone)]
pub struct NodeStatus {
    pub id: u64,
    /// Current leader, or 0 when none is known.
    pub leader_id: u64,
    pub term: u64,
    pub applied: u64,
    pub committed: u64,
    pub first_index: u64,
    pub last_index: u64,
    pub is_leader: bool,
}

#[derive(Clone)]
pub(crate) struct NodeHandle {
    shared: Arc<Shared>,
    requests: mpsc::Sender<NodeRequest>,
}

impl NodeHandle {
    pub fn new(shared: Arc<Shared>, requests: mpsc::Sender<NodeRequest>) -> NodeHandle {
        NodeHandle { shared, requests }
    }

    pub fn id(&self) -> u64 {
        self.shared.id
    }

    pub fn cluster_id(&self) -> u64 {
        self.shared.cluster_id
    }

    pub fn shared(&self) -> &Arc<Shared> {
        &self.shared
    }

    pub fn peers_snapshot(&self) -> PeerMap {
        self.shared.peers.read().clone()
    }

    /// Whether membership requests may be accepted right now.
    pub fn can_alter_membership(&self) -> bool {
        self.shared.lifecycle.get() == NodeState::Running
            && self.shared.alive.load(Ordering::Acquire)
            && !self.shared.removed.load(Ordering::Acquire)
    }

    /// Submit an opaque entry. Returns once the proposal is enqueued with
    /// the raft engine, not once it commits; use an observer for
    /// confirmation.
    pub async fn propose(&self, data: Vec<u8>) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(NodeRequest::Propose { data, reply }).await?;
        rx.await.map_err(|_| NodeError::Stopped)?
    }

    pub async fn propose_conf_change(&self, cc: ConfChange) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(NodeRequest::ProposeConfChange { cc, reply })
            .await?;
        rx.await.map_err(|_| NodeError::Stopped)?
    }

    /// Forward an inbound raft message to the engine.
    pub async fn step(&self, message: Message) -> Result<()> {
        self.send(NodeRequest::Step(message)).await
    }

    pub async fn status(&self) -> Result<NodeStatus> {
        let (reply, rx) = oneshot::channel();
        self.send(NodeRequest::Status { reply }).await?;
        rx.await.map_err(|_| NodeError::Stopped)
    }

    async fn send(&self, request: NodeRequest) -> Result<()> {
        self.requests
            .send(request)
            .await
            .map_err(|_| NodeError::Stopped)
    }
}
