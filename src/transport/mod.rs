//! Peer transport: raft message exchange between cluster members.
//!
//! Outbound sends are fire-and-forget; a dropped message is recovered by
//! raft's own retransmission. The peer set maps node ids to the single
//! `http://ip:raft_port` URL each member advertises, and is mutated only
//! when membership entries are applied.

mod server;

pub(crate) use server::start_server;

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::RwLock;
use protobuf::Message as PbMessage;
use raft::eraftpb::Message;
use tracing::{debug, warn};

/// Identifies the sending node on every transport request.
pub(crate) const HEADER_NODE_ID: &str = "x-skiff-node-id";
/// Guards against cross-cluster message delivery.
pub(crate) const HEADER_CLUSTER_ID: &str = "x-skiff-cluster-id";
/// The sender's own transport URL, so a receiver can answer a peer it has
/// not learned through membership yet (a node freshly added to the cluster
/// must reply to the leader before it has applied any entries).
pub(crate) const HEADER_PEER_URL: &str = "x-skiff-peer-url";

const SEND_TIMEOUT: Duration = Duration::from_secs(5);

/// The managed peer set plus the outbound HTTP client.
pub(crate) struct Transport {
    self_id: u64,
    cluster_id: u64,
    self_url: String,
    client: reqwest::Client,
    peers: RwLock<HashMap<u64, String>>,
}

impl Transport {
    pub fn new(self_id: u64, cluster_id: u64, self_url: String) -> Transport {
        Transport {
            self_id,
            cluster_id,
            self_url,
            client: reqwest::Client::new(),
            peers: RwLock::new(HashMap::new()),
        }
    }

    pub fn add_peer(&self, id: u64, url: String) {
        debug!(peer = id, %url, "transport peer added");
        self.peers.write().insert(id, url);
    }

    /// Record a peer learned from an inbound request rather than from
    /// membership. Never overwrites a configured entry.
    pub fn add_remote(&self, id: u64, url: String) {
        let mut peers = self.peers.write();
        if !peers.contains_key(&id) {
            debug!(peer = id, %url, "transport remote learned from inbound request");
            peers.insert(id, url);
        }
    }

    pub fn remove_peer(&self, id: u64) {
        debug!(peer = id, "transport peer removed");
        self.peers.write().remove(&id);
    }

    pub fn peer_url(&self, id: u64) -> Option<String> {
        self.peers.read().get(&id).cloned()
    }

    /// Fire-and-forget delivery of a batch of raft messages.
    pub fn send(&self, messages: Vec<Message>) {
        for message in messages {
            let to = message.get_to();
            let Some(url) = self.peer_url(to) else {
                debug!(peer = to, "dropping message to unknown peer");
                continue;
            };
            let bytes = match message.write_to_bytes() {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!(error = %e, "failed to encode raft message");
                    continue;
                }
            };

            let request = self
                .client
                .post(format!("{}/raft", url))
                .timeout(SEND_TIMEOUT)
                .header(HEADER_NODE_ID, self.self_id.to_string())
                .header(HEADER_CLUSTER_ID, self.cluster_id.to_string())
                .header(HEADER_PEER_URL, self.self_url.clone())
                .body(bytes);

            tokio::spawn(async move {
                match request.send().await {
                    Ok(response) if !response.status().is_success() => {
                        debug!(peer = to, status = %response.status(), "peer rejected message");
                    }
                    Err(e) => {
                        // Raft retransmits; unreachable peers are routine.
                        debug!(peer = to, error = %e, "message send failed");
                    }
                    Ok(_) => {}
                }
            });
        }
    }
}
