//! The seam between committed raft entries and user state.

use crate::error::FsmError;

/// A deterministic state machine replicated by the runtime.
///
/// The runtime guarantees:
///
/// - `apply` is called exactly once per committed normal entry, in log
///   order, from the single Ready-loop task;
/// - `restore` is called only between the creation of the raft structures
///   and the resumption of `apply`, never concurrently with it;
/// - `snapshot` is called on the Ready-loop task when the snapshot ticker
///   fires.
///
/// In exchange the implementation must be deterministic: two replicas that
/// apply the same entry sequence must reach the same state. `apply` runs on
/// the consensus path, so expensive work should be deferred internally.
pub trait StateMachine: Send + 'static {
    /// Apply one committed entry.
    ///
    /// An error here is fatal to the node: a state machine that fails
    /// non-deterministically has already diverged from its replicas.
    fn apply(&mut self, entry: &[u8]) -> std::result::Result<(), FsmError>;

    /// Produce a serialization of the current state.
    fn snapshot(&self) -> std::result::Result<Vec<u8>, FsmError>;

    /// Replace the current state with a previously produced snapshot.
    fn restore(&mut self, snapshot: &[u8]) -> std::result::Result<(), FsmError>;
}
