//! Conf-change proposals with commit confirmation.
//!
//! A membership change is only useful once it commits, so these helpers
//! register an observer matching the conf-change entry *before* proposing,
//! then block on the observation. The filter is a pure predicate; the
//! actual membership mutation happens exactly once, in the Ready loop's
//! committed-entry path.

use std::time::Duration;

use protobuf::Message as PbMessage;
use raft::eraftpb::{ConfChange, ConfChangeType};
use tokio::sync::mpsc;
use tracing::debug;

use super::NodeHandle;
use crate::error::{NodeError, Result};
use crate::observer::{Observation, Observer};
use crate::types::{EntryKind, PeerRecord};

/// How long a single conf-change proposal waits for its commit.
pub(crate) const CONF_CHANGE_WAIT: Duration = Duration::from_secs(10);

impl NodeHandle {
    /// Propose adding `id` with its network coordinates and wait (up to
    /// [`CONF_CHANGE_WAIT`]) for the change to commit.
    pub async fn propose_member_add(&self, id: u64, record: &PeerRecord) -> Result<()> {
        let context = serde_json::to_vec(record)?;
        self.conf_change_and_wait(ConfChangeType::AddNode, id, context)
            .await
    }

    /// Propose removing `id` and wait for a single commit window.
    pub async fn propose_member_remove_once(&self, id: u64) -> Result<()> {
        self.conf_change_and_wait(ConfChangeType::RemoveNode, id, Vec::new())
            .await
    }

    /// Propose removing `id`, re-proposing on timeout until the removal
    /// commits. A node being removed must eventually succeed; the loop
    /// ends early only when this node itself stops.
    pub async fn propose_member_remove(&self, id: u64) -> Result<()> {
        loop {
            match self.propose_member_remove_once(id).await {
                Err(NodeError::ConfChangeTimeout) => {
                    debug!(node = id, "removal not yet committed, re-proposing");
                }
                other => return other,
            }
        }
    }

    async fn conf_change_and_wait(
        &self,
        change_type: ConfChangeType,
        id: u64,
        context: Vec<u8>,
    ) -> Result<()> {
        // Register before proposing so the commit cannot slip past us.
        let (tx, mut rx) = mpsc::channel(1);
        let observer = Observer::new(tx, conf_change_filter(change_type, id));
        let observer_id = self.shared().observers.register(observer);

        let outcome = async {
            let mut cc = ConfChange::default();
            cc.set_change_type(change_type);
            cc.set_node_id(id);
            cc.set_context(context.into());
            self.propose_conf_change(cc).await?;

            match tokio::time::timeout(CONF_CHANGE_WAIT, rx.recv()).await {
                Ok(Some(_)) => Ok(()),
                Ok(None) => Err(NodeError::Stopped),
                Err(_) => Err(NodeError::ConfChangeTimeout),
            }
        }
        .await;

        self.shared().observers.unregister(observer_id);
        outcome
    }
}

/// Matches the committed conf-change entry for `(change_type, id)`.
fn conf_change_filter(
    change_type: ConfChangeType,
    id: u64,
) -> impl Fn(&Observation) -> bool + Send + Sync + 'static {
    move |observation| {
        let Observation::Committed(entry) = observation;
        if entry.kind != EntryKind::ConfChange {
            return false;
        }
        match ConfChange::parse_from_bytes(&entry.data) {
            Ok(cc) => cc.get_change_type() == change_type && cc.get_node_id() == id,
            Err(_) => false,
        }
    }
}
