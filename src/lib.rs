//! Embeddable Raft-replicated state-machine runtime.
//!
//! skiff wraps the [`raft`](https://docs.rs/raft) consensus engine and
//! exposes a simple contract: bytes proposed on any member are applied,
//! durably and in the same order, to a user-supplied state machine on
//! every replica. The host brings a deterministic [`StateMachine`] plus
//! two ports; skiff handles membership discovery, log persistence, the
//! snapshot lifecycle, peer transport, and the Ready-loop bookkeeping.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │                          Node                              │
//! │                                                            │
//! │  membership API ──┐                   ┌── peer transport   │
//! │  (api_port)       │                   │   (raft_port)      │
//! │                   ▼                   ▼                    │
//! │              ┌─────────────────────────────┐               │
//! │              │         Ready loop          │               │
//! │              │  raft engine · in-mem log   │               │
//! │              └──┬──────────┬──────────┬────┘               │
//! │                 ▼          ▼          ▼                    │
//! │             WAL+snap   StateMachine  observers             │
//! └────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use skiff::{Node, NodeConfig, StateMachine};
//!
//! let config = NodeConfig::builder()
//!     .raft_port(7001)
//!     .api_port(8001)
//!     .bootstrap_node(true)
//!     .build()?;
//!
//! let node = Node::start(config, MyStateMachine::default()).await?;
//! node.propose(b"set x = 1".to_vec()).await?;
//! ```
//!
//! Further members join by pointing `bootstrap_peers` at any existing
//! member's api port; a restarted node finds its WAL and rejoins with its
//! prior identity and state.

mod config;
mod discovery;
mod error;
mod fsm;
mod node;
mod observer;
mod storage;
mod transport;
mod types;

pub use config::{BackoffConfig, NodeConfig, NodeConfigBuilder, SnapshotPolicy, DEFAULT_CLUSTER_ID};
pub use error::{FsmError, NodeError, Result};
pub use fsm::StateMachine;
pub use node::{Node, NodeState, NodeStatus};
pub use observer::{Observation, Observer};
pub use types::{
    ClusterId, EntryKind, JoinRequest, LogEntry, MembersResponse, NodeId, PeerMap, PeerRecord,
};
