//! Core data types shared across the runtime.

use std::collections::HashMap;
use std::fmt;

use raft::eraftpb::{Entry, EntryType};
use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Unique 64-bit identifier of a replica. Stable for the node's lifetime
/// and independent of its network address.
pub type NodeId = u64;

/// Identifier shared by all members of one cluster.
pub type ClusterId = u64;

/// Network coordinates of one cluster member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerRecord {
    /// Host the peer advertises to the rest of the cluster.
    pub ip: String,
    /// Port of the peer's raft transport listener.
    pub raft_port: u16,
    /// Port of the peer's membership HTTP listener.
    pub api_port: u16,
}

impl PeerRecord {
    /// URL the raft transport uses to reach this peer. The sole URL kept
    /// per peer.
    pub fn raft_url(&self) -> String {
        format!("http://{}:{}", self.ip, self.raft_port)
    }

    /// Base URL of the peer's membership HTTP API.
    pub fn api_url(&self) -> String {
        format!("http://{}:{}", self.ip, self.api_port)
    }
}

/// Mapping from node id to peer record for every currently-configured
/// cluster member, including self.
///
/// Serialized with **decimal-string keys**: node ids are full 64-bit values
/// and routinely exceed the 53-bit safe integer range of common JSON
/// parsers, so the wire encoding must not key maps by JSON numbers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerMap(HashMap<NodeId, PeerRecord>);

impl PeerMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, id: NodeId, record: PeerRecord) -> Option<PeerRecord> {
        self.0.insert(id, record)
    }

    pub fn remove(&mut self, id: NodeId) -> Option<PeerRecord> {
        self.0.remove(&id)
    }

    pub fn get(&self, id: NodeId) -> Option<&PeerRecord> {
        self.0.get(&id)
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.0.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&NodeId, &PeerRecord)> {
        self.0.iter()
    }
}

impl From<HashMap<NodeId, PeerRecord>> for PeerMap {
    fn from(map: HashMap<NodeId, PeerRecord>) -> Self {
        Self(map)
    }
}

impl FromIterator<(NodeId, PeerRecord)> for PeerMap {
    fn from_iter<I: IntoIterator<Item = (NodeId, PeerRecord)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl Serialize for PeerMap {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (id, record) in &self.0 {
            map.serialize_entry(&id.to_string(), record)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for PeerMap {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct PeerMapVisitor;

        impl<'de> Visitor<'de> for PeerMapVisitor {
            type Value = PeerMap;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a map of decimal node-id strings to peer records")
            }

            fn visit_map<A: MapAccess<'de>>(
                self,
                mut access: A,
            ) -> std::result::Result<Self::Value, A::Error> {
                let mut out = HashMap::with_capacity(access.size_hint().unwrap_or(0));
                while let Some((key, record)) = access.next_entry::<String, PeerRecord>()? {
                    let id = key.parse::<NodeId>().map_err(serde::de::Error::custom)?;
                    out.insert(id, record);
                }
                Ok(PeerMap(out))
            }
        }

        deserializer.deserialize_map(PeerMapVisitor)
    }
}

/// Kind of a committed log entry as seen by observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    /// Opaque user payload destined for the state machine.
    Normal,
    /// Cluster membership mutation.
    ConfChange,
}

/// A committed raft log entry, decoupled from the engine's wire types.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub index: u64,
    pub term: u64,
    pub kind: EntryKind,
    pub data: Vec<u8>,
}

impl LogEntry {
    pub(crate) fn from_raft(entry: &Entry) -> Self {
        let kind = match entry.get_entry_type() {
            EntryType::EntryNormal => EntryKind::Normal,
            EntryType::EntryConfChange | EntryType::EntryConfChangeV2 => EntryKind::ConfChange,
        };
        LogEntry {
            index: entry.get_index(),
            term: entry.get_term(),
            kind,
            data: entry.get_data().to_vec(),
        }
    }
}

/// Body of `POST /cluster/members` and `POST /cluster/members/rejoin`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinRequest {
    pub id: NodeId,
    pub ip: String,
    pub raft_port: u16,
    pub api_port: u16,
}

impl JoinRequest {
    pub fn record(&self) -> PeerRecord {
        PeerRecord {
            ip: self.ip.clone(),
            raft_port: self.raft_port,
            api_port: self.api_port,
        }
    }
}

/// Body of `GET /cluster/members` responses (and rejoin replies).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MembersResponse {
    pub peers: PeerMap,
}

/// The payload this layer stores inside every raft-level snapshot.
///
/// `metadata.peers` is the ground truth for rebuilding the transport when a
/// follower installs the snapshot; `data` is the user state machine's own
/// serialization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct SnapshotEnvelope {
    pub metadata: EnvelopeMetadata,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct EnvelopeMetadata {
    pub peers: PeerMap,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(port: u16) -> PeerRecord {
        PeerRecord {
            ip: "10.0.0.7".to_string(),
            raft_port: port,
            api_port: port + 1,
        }
    }

    #[test]
    fn peer_map_serializes_with_string_keys() {
        let mut peers = PeerMap::new();
        peers.insert(42, record(7000));

        let json = serde_json::to_value(&peers).expect("serialize");
        let obj = json.as_object().expect("object");
        assert!(obj.contains_key("42"), "keys must be decimal strings");
        assert_eq!(obj["42"]["raft_port"], 7000);
    }

    #[test]
    fn peer_map_round_trips_ids_beyond_double_precision() {
        // Larger than 2^53; a numeric JSON key would lose precision.
        let id: NodeId = 0xDEAD_BEEF_CAFE_F00D;
        let mut peers = PeerMap::new();
        peers.insert(id, record(7001));

        let json = serde_json::to_string(&peers).expect("serialize");
        assert!(json.contains(&format!("\"{}\"", id)));

        let back: PeerMap = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, peers);
    }

    #[test]
    fn peer_map_rejects_non_numeric_keys() {
        let err = serde_json::from_str::<PeerMap>(r#"{"not-a-number": {"ip":"x","raft_port":1,"api_port":2}}"#);
        assert!(err.is_err());
    }

    #[test]
    fn envelope_round_trip() {
        let mut peers = PeerMap::new();
        peers.insert(1, record(7000));
        peers.insert(u64::MAX, record(7002));

        let envelope = SnapshotEnvelope {
            metadata: EnvelopeMetadata { peers },
            data: b"fsm state".to_vec(),
        };

        let bytes = serde_json::to_vec(&envelope).expect("serialize");
        let back: SnapshotEnvelope = serde_json::from_slice(&bytes).expect("deserialize");
        assert_eq!(back.metadata.peers, envelope.metadata.peers);
        assert_eq!(back.data, envelope.data);
    }

    #[test]
    fn peer_urls() {
        let rec = record(7000);
        assert_eq!(rec.raft_url(), "http://10.0.0.7:7000");
        assert_eq!(rec.api_url(), "http://10.0.0.7:7001");
    }
}
