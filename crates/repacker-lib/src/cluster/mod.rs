//! Cluster state collaborator boundary
//!
//! The informer/cache layer that actually talks to the Kubernetes API
//! lives behind the [`ClusterState`] trait: listings and lookups for
//! pods, nodes, PDBs and workload owners, the cordon and evict calls,
//! and one-shot delete notifications keyed by pod identity. The core
//! never touches the API server directly.

#[cfg(test)]
pub(crate) mod fake;

use crate::models::{NodeInfo, PdbInfo, PodId, PodInfo, WorkloadRef};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use thiserror::Error;
use tokio::sync::oneshot;

/// Errors surfaced by the cluster collaborator
#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("{kind} {name:?} not found")]
    NotFound { kind: &'static str, name: String },
    #[error("eviction of {pod} blocked by disruption budget: {message}")]
    DisruptionBudget { pod: PodId, message: String },
    #[error("cluster api error: {0}")]
    Api(String),
}

impl ClusterError {
    /// True for the one error kind the eviction engine retries on
    pub fn is_disruption_budget(&self) -> bool {
        matches!(self, ClusterError::DisruptionBudget { .. })
    }
}

/// Read and mutate access to cluster state
#[async_trait]
pub trait ClusterState: Send + Sync {
    async fn list_pods(&self) -> Result<Vec<PodInfo>, ClusterError>;

    async fn get_pod(&self, id: &PodId) -> Result<PodInfo, ClusterError>;

    async fn list_nodes(&self) -> Result<Vec<NodeInfo>, ClusterError>;

    async fn get_node(&self, name: &str) -> Result<NodeInfo, ClusterError>;

    async fn list_pdbs(&self, namespace: &str) -> Result<Vec<PdbInfo>, ClusterError>;

    /// Resolve the controller owning a pod, if any
    async fn get_workload_owner(&self, id: &PodId)
        -> Result<Option<WorkloadRef>, ClusterError>;

    /// Mark a node unschedulable without disturbing its pods
    async fn cordon_node(&self, name: &str) -> Result<(), ClusterError>;

    /// Request graceful, PDB-checked removal of a pod
    async fn evict_pod(&self, id: &PodId) -> Result<(), ClusterError>;

    /// Register a one-shot signal fired when the pod is observed gone
    async fn register_delete_callback(&self, id: &PodId) -> oneshot::Receiver<()>;

    /// Drop a registered delete signal without firing it
    async fn unregister_delete_callback(&self, id: &PodId);
}

/// One-shot delete notifications keyed by pod identity
///
/// A concrete [`ClusterState`] wires its informer delete events into
/// [`DeleteCallbackRegistry::fire`].
#[derive(Default)]
pub struct DeleteCallbackRegistry {
    pending: Mutex<HashMap<PodId, oneshot::Sender<()>>>,
}

impl DeleteCallbackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register interest in a pod's deletion
    ///
    /// A second registration for the same pod replaces the first; the
    /// superseded receiver resolves as closed.
    pub fn register(&self, id: &PodId) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        let mut pending = self.pending.lock().expect("callback registry poisoned");
        pending.insert(id.clone(), tx);
        rx
    }

    pub fn unregister(&self, id: &PodId) {
        let mut pending = self.pending.lock().expect("callback registry poisoned");
        pending.remove(id);
    }

    /// Fire the callback for a deleted pod, if one is registered
    pub fn fire(&self, id: &PodId) -> bool {
        let sender = {
            let mut pending = self.pending.lock().expect("callback registry poisoned");
            pending.remove(id)
        };
        match sender {
            Some(tx) => tx.send(()).is_ok(),
            None => false,
        }
    }

    /// True while a registration for the pod is outstanding
    ///
    /// Pollers driving [`fire`](Self::fire) check this between
    /// attempts so they stop once the registration is dropped.
    pub fn is_pending(&self, id: &PodId) -> bool {
        self.pending
            .lock()
            .expect("callback registry poisoned")
            .contains_key(id)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().expect("callback registry poisoned").len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn registered_callback_fires_once() {
        let registry = DeleteCallbackRegistry::new();
        let id = PodId::new("default", "web-0");
        let rx = registry.register(&id);

        assert!(registry.fire(&id));
        assert!(rx.await.is_ok());
        // Second fire has nothing to deliver.
        assert!(!registry.fire(&id));
    }

    #[tokio::test]
    async fn unregister_closes_the_channel() {
        let registry = DeleteCallbackRegistry::new();
        let id = PodId::new("default", "web-0");
        let rx = registry.register(&id);

        registry.unregister(&id);
        assert!(rx.await.is_err());
        assert_eq!(registry.pending_count(), 0);
    }

    #[tokio::test]
    async fn pending_tracks_the_registration_lifetime() {
        let registry = DeleteCallbackRegistry::new();
        let id = PodId::new("default", "web-0");
        assert!(!registry.is_pending(&id));

        let _rx = registry.register(&id);
        assert!(registry.is_pending(&id));

        registry.unregister(&id);
        assert!(!registry.is_pending(&id));

        let _rx = registry.register(&id);
        registry.fire(&id);
        assert!(!registry.is_pending(&id));
    }

    #[tokio::test]
    async fn reregistration_supersedes_previous_receiver() {
        let registry = DeleteCallbackRegistry::new();
        let id = PodId::new("default", "web-0");
        let first = registry.register(&id);
        let second = registry.register(&id);

        registry.fire(&id);
        assert!(first.await.is_err());
        assert!(second.await.is_ok());
    }
}
