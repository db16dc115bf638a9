//! Worker registry.
//!
//! Tracks the workers currently connected to the relay, keyed by their
//! declared backend id. Each entry owns the outbound frame sender of exactly
//! one control connection; dropping an entry drops that sender, which ends the
//! connection's write loop.
//!
//! Worker selection is delegated to a [`SelectionPolicy`]. The default
//! [`FirstAvailable`] policy routes to the lowest backend id, which is
//! deterministic with a single worker and picks exactly one when several are
//! connected. It does no load balancing and ignores capabilities.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

use crate::protocol::{Frame, Registration};

/// Identifies one accepted control connection for the lifetime of the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Outbound half of a control connection, as seen by the dispatch loop.
///
/// Unbounded so that the dispatch loop never waits on a slow socket.
pub type FrameSender = mpsc::UnboundedSender<Frame>;

/// A registered worker.
#[derive(Debug)]
pub struct Worker {
    /// Declared backend id.
    pub id: String,
    /// Declared capabilities.
    pub capabilities: Vec<String>,
    /// Declared version tag.
    pub version: String,
    /// Connection the worker registered on.
    pub connection: ConnectionId,
    /// Frame sender for that connection.
    pub outbound: FrameSender,
    /// When the registration frame was processed.
    pub registered_at: DateTime<Utc>,
}

impl Worker {
    /// Build a worker from its registration frame.
    pub fn new(registration: Registration, connection: ConnectionId, outbound: FrameSender) -> Self {
        Self {
            id: registration.backend_id,
            capabilities: registration.capabilities,
            version: registration.version,
            connection,
            outbound,
            registered_at: Utc::now(),
        }
    }

    /// Queue a frame for this worker. Returns false if the connection is gone.
    pub fn send(&self, frame: Frame) -> bool {
        self.outbound.send(frame).is_ok()
    }
}

/// Strategy for choosing the worker that receives the next job.
pub trait SelectionPolicy: Send + 'static {
    /// Pick one worker, or `None` if none is suitable.
    fn select<'a>(&mut self, workers: &'a BTreeMap<String, Worker>) -> Option<&'a Worker>;
}

/// Route to the first registered worker in id order.
#[derive(Debug, Default, Clone, Copy)]
pub struct FirstAvailable;

impl SelectionPolicy for FirstAvailable {
    fn select<'a>(&mut self, workers: &'a BTreeMap<String, Worker>) -> Option<&'a Worker> {
        workers.values().next()
    }
}

/// Registry of connected workers.
pub struct WorkerRegistry {
    workers: BTreeMap<String, Worker>,
    policy: Box<dyn SelectionPolicy>,
}

impl WorkerRegistry {
    /// Create an empty registry with the [`FirstAvailable`] policy.
    pub fn new() -> Self {
        Self::with_policy(FirstAvailable)
    }

    /// Create an empty registry with a custom selection policy.
    pub fn with_policy(policy: impl SelectionPolicy) -> Self {
        Self {
            workers: BTreeMap::new(),
            policy: Box::new(policy),
        }
    }

    /// Register a worker, replacing any entry with the same id.
    ///
    /// Returns the entries that were displaced: the previous holder of the id
    /// and, if the same connection had registered under another id, that
    /// entry. Dropping them closes their connections when they are not the
    /// connection being registered.
    pub fn register(&mut self, worker: Worker) -> Vec<Worker> {
        let mut displaced = Vec::new();

        let stale_id = self
            .workers
            .iter()
            .find(|(id, w)| w.connection == worker.connection && **id != worker.id)
            .map(|(id, _)| id.clone());
        if let Some(id) = stale_id {
            displaced.extend(self.workers.remove(&id));
        }

        if let Some(previous) = self.workers.insert(worker.id.clone(), worker) {
            displaced.push(previous);
        }
        displaced
    }

    /// Remove a worker by id.
    pub fn deregister(&mut self, id: &str) -> Option<Worker> {
        self.workers.remove(id)
    }

    /// Remove the worker owned by a closing connection.
    ///
    /// An entry that has since been replaced by a registration on another
    /// connection is left alone.
    pub fn deregister_connection(&mut self, connection: ConnectionId) -> Option<Worker> {
        let id = self
            .workers
            .iter()
            .find(|(_, w)| w.connection == connection)
            .map(|(id, _)| id.clone())?;
        self.workers.remove(&id)
    }

    /// Choose a worker for a new job.
    pub fn select_worker(&mut self) -> Option<&Worker> {
        self.policy.select(&self.workers)
    }

    /// Look up the worker registered on a connection.
    pub fn by_connection(&self, connection: ConnectionId) -> Option<&Worker> {
        self.workers.values().find(|w| w.connection == connection)
    }

    /// Registered worker ids, in id order.
    pub fn ids(&self) -> Vec<String> {
        self.workers.keys().cloned().collect()
    }

    /// Number of registered workers.
    pub fn len(&self) -> usize {
        self.workers.len()
    }

    /// Check if no worker is registered.
    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }
}

impl Default for WorkerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn worker(id: &str, conn: u64) -> (Worker, mpsc::UnboundedReceiver<Frame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let registration = Registration {
            backend_id: id.to_string(),
            capabilities: vec!["chat".to_string()],
            version: "v1".to_string(),
        };
        (Worker::new(registration, ConnectionId(conn), tx), rx)
    }

    #[test]
    fn test_register_and_select_single_worker() {
        let mut registry = WorkerRegistry::new();
        let (w, _rx) = worker("backend-1", 1);
        assert!(registry.register(w).is_empty());

        assert_eq!(registry.len(), 1);
        assert_eq!(registry.select_worker().unwrap().id, "backend-1");
        assert_eq!(registry.select_worker().unwrap().id, "backend-1");
    }

    #[test]
    fn test_select_on_empty_registry_fails() {
        let mut registry = WorkerRegistry::new();
        assert!(registry.select_worker().is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_re_register_same_id_does_not_double_count() {
        let mut registry = WorkerRegistry::new();
        let (first, mut first_rx) = worker("backend-1", 1);
        let (second, _rx) = worker("backend-1", 2);

        registry.register(first);
        let displaced = registry.register(second);

        assert_eq!(registry.len(), 1);
        assert_eq!(displaced.len(), 1);
        assert_eq!(displaced[0].connection, ConnectionId(1));
        assert_eq!(
            registry.by_connection(ConnectionId(2)).map(|w| w.id.as_str()),
            Some("backend-1")
        );
        assert!(registry.by_connection(ConnectionId(1)).is_none());

        // Dropping the displaced entry closes the old connection's queue.
        drop(displaced);
        assert!(matches!(
            first_rx.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));
    }

    #[test]
    fn test_connection_reregistering_under_new_id_replaces_entry() {
        let mut registry = WorkerRegistry::new();
        let (a, _rx_a) = worker("backend-a", 1);
        let (b, _rx_b) = worker("backend-b", 1);

        registry.register(a);
        let displaced = registry.register(b);

        assert_eq!(displaced.len(), 1);
        assert_eq!(displaced[0].id, "backend-a");
        assert_eq!(registry.ids(), vec!["backend-b".to_string()]);
    }

    #[test]
    fn test_deregister_connection_ignores_replaced_entry() {
        let mut registry = WorkerRegistry::new();
        let (first, _rx1) = worker("backend-1", 1);
        let (second, _rx2) = worker("backend-1", 2);
        registry.register(first);
        registry.register(second);

        // The old connection closing must not remove the new registration.
        assert!(registry.deregister_connection(ConnectionId(1)).is_none());
        assert_eq!(registry.len(), 1);

        assert!(registry.deregister_connection(ConnectionId(2)).is_some());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_two_workers_select_exactly_one() {
        let mut registry = WorkerRegistry::new();
        let (w2, _rx2) = worker("backend-2", 2);
        let (w1, _rx1) = worker("backend-1", 1);
        registry.register(w2);
        registry.register(w1);

        let chosen = registry.select_worker().unwrap();
        assert_eq!(chosen.id, "backend-1");
        assert_eq!(registry.by_connection(ConnectionId(2)).unwrap().id, "backend-2");
    }

    #[test]
    fn test_custom_policy() {
        struct LastAvailable;
        impl SelectionPolicy for LastAvailable {
            fn select<'a>(&mut self, workers: &'a BTreeMap<String, Worker>) -> Option<&'a Worker> {
                workers.values().next_back()
            }
        }

        let mut registry = WorkerRegistry::with_policy(LastAvailable);
        let (w1, _rx1) = worker("backend-1", 1);
        let (w2, _rx2) = worker("backend-2", 2);
        registry.register(w1);
        registry.register(w2);

        assert_eq!(registry.select_worker().unwrap().id, "backend-2");
    }

    #[test]
    fn test_deregister_by_id() {
        let mut registry = WorkerRegistry::new();
        let (w, _rx) = worker("backend-1", 1);
        registry.register(w);
        assert!(registry.deregister("backend-1").is_some());
        assert!(registry.deregister("backend-1").is_none());
    }
}
