//! Fan-out of applied entries to registered observers.
//!
//! Observers are the runtime's confirmation mechanism: a caller that wants
//! to know when a proposal commits registers a filter + channel pair before
//! proposing, then waits on the channel. Dispatch is non-blocking, so a
//! one-shot wait should use a channel with capacity at least 1.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::mpsc;

use crate::types::LogEntry;

/// Something an observer can be notified about.
///
/// Tagged so future observation kinds can ride the same channels.
#[derive(Debug, Clone)]
pub enum Observation {
    /// A log entry the node has just applied.
    Committed(LogEntry),
}

/// Predicate deciding whether an observation is delivered to one observer.
///
/// Filters run on the Ready-loop task for every applied entry; they must be
/// cheap and must not touch the registry they are dispatched from.
pub type ObserverFilter = dyn Fn(&Observation) -> bool + Send + Sync;

/// A filter + channel pair registered with the node.
pub struct Observer {
    filter: Box<ObserverFilter>,
    tx: mpsc::Sender<Observation>,
}

impl Observer {
    /// Create an observer delivering matching observations to `tx`.
    pub fn new<F>(tx: mpsc::Sender<Observation>, filter: F) -> Self
    where
        F: Fn(&Observation) -> bool + Send + Sync + 'static,
    {
        Observer {
            filter: Box::new(filter),
            tx,
        }
    }
}

/// Registry of live observers.
///
/// Registration and removal take the write lock; dispatch takes the read
/// lock only long enough to snapshot the current set, then runs filters
/// outside it. An observer never sees an entry applied before its
/// registration, and misses notifications whose channel is full at
/// dispatch time.
#[derive(Default)]
pub(crate) struct ObserverRegistry {
    observers: RwLock<HashMap<u64, Arc<Observer>>>,
    next_id: AtomicU64,
}

impl ObserverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an observer; the returned id unregisters it.
    pub fn register(&self, observer: Observer) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.observers.write().insert(id, Arc::new(observer));
        id
    }

    /// Remove an observer. Unknown ids are ignored.
    pub fn unregister(&self, id: u64) {
        self.observers.write().remove(&id);
    }

    /// Deliver an observation to every observer whose filter matches.
    pub fn observe(&self, observation: &Observation) {
        let targets: Vec<Arc<Observer>> = self.observers.read().values().cloned().collect();
        for observer in targets {
            if (observer.filter)(observation) {
                // Non-blocking by contract: a full channel misses this one.
                let _ = observer.tx.try_send(observation.clone());
            }
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.observers.read().len()
    }
}
