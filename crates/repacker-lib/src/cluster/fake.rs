//! In-memory cluster double used across the crate's tests

use super::{ClusterError, ClusterState, DeleteCallbackRegistry};
use crate::models::{NodeInfo, PdbInfo, PodId, PodInfo, WorkloadRef};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::oneshot;

/// Tracks how many calls overlap, for parallelism assertions
#[derive(Default)]
struct ConcurrencyProbe {
    current: AtomicUsize,
    max: AtomicUsize,
}

impl ConcurrencyProbe {
    fn enter(&self) {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.max.fetch_max(now, Ordering::SeqCst);
    }

    fn exit(&self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
    }

    fn max(&self) -> usize {
        self.max.load(Ordering::SeqCst)
    }
}

/// Scripted in-memory [`ClusterState`] that records every mutation
#[derive(Default)]
pub struct FakeCluster {
    pods: Mutex<HashMap<PodId, PodInfo>>,
    nodes: Mutex<HashMap<String, NodeInfo>>,
    pdbs: Mutex<Vec<PdbInfo>>,
    callbacks: DeleteCallbackRegistry,

    /// Pods whose eviction fails with a PDB conflict this many times
    pdb_conflicts: Mutex<HashMap<PodId, u32>>,
    /// Pods whose eviction always fails with a non-PDB error
    evict_failures: Mutex<HashSet<PodId>>,
    /// Nodes whose cordon call fails
    cordon_failures: Mutex<HashSet<String>>,
    /// When set, a successful eviction immediately deletes the pod
    /// and fires its delete callback
    auto_delete: bool,

    /// Artificial latency so overlap can be observed
    evict_delay: Mutex<Duration>,
    cordon_delay: Mutex<Duration>,
    evict_probe: ConcurrencyProbe,
    cordon_probe: ConcurrencyProbe,

    pub evictions: Mutex<Vec<PodId>>,
    pub cordons: Mutex<Vec<String>>,
}

impl FakeCluster {
    pub fn new() -> Self {
        Self {
            auto_delete: true,
            ..Self::default()
        }
    }

    /// A fake whose evictions succeed but never confirm deletion
    pub fn without_auto_delete() -> Self {
        Self::default()
    }

    pub fn add_pod(&self, pod: PodInfo) {
        self.pods.lock().unwrap().insert(pod.id.clone(), pod);
    }

    pub fn add_node(&self, node: NodeInfo) {
        self.nodes.lock().unwrap().insert(node.name.clone(), node);
    }

    pub fn add_pdb(&self, pdb: PdbInfo) {
        self.pdbs.lock().unwrap().push(pdb);
    }

    pub fn fail_eviction_with_pdb_conflict(&self, id: &PodId, times: u32) {
        self.pdb_conflicts.lock().unwrap().insert(id.clone(), times);
    }

    pub fn fail_eviction(&self, id: &PodId) {
        self.evict_failures.lock().unwrap().insert(id.clone());
    }

    pub fn fail_cordon(&self, node: &str) {
        self.cordon_failures.lock().unwrap().insert(node.to_string());
    }

    /// Simulate the informer observing a pod deletion
    pub fn delete_pod(&self, id: &PodId) {
        self.pods.lock().unwrap().remove(id);
        self.callbacks.fire(id);
    }

    pub fn eviction_count(&self, id: &PodId) -> usize {
        self.evictions.lock().unwrap().iter().filter(|p| *p == id).count()
    }

    pub fn cordoned(&self, node: &str) -> bool {
        self.cordons.lock().unwrap().iter().any(|n| n == node)
    }

    pub fn set_evict_delay(&self, delay: Duration) {
        *self.evict_delay.lock().unwrap() = delay;
    }

    pub fn set_cordon_delay(&self, delay: Duration) {
        *self.cordon_delay.lock().unwrap() = delay;
    }

    pub fn max_concurrent_evictions(&self) -> usize {
        self.evict_probe.max()
    }

    pub fn max_concurrent_cordons(&self) -> usize {
        self.cordon_probe.max()
    }
}

#[async_trait]
impl ClusterState for FakeCluster {
    async fn list_pods(&self) -> Result<Vec<PodInfo>, ClusterError> {
        let mut pods: Vec<PodInfo> = self.pods.lock().unwrap().values().cloned().collect();
        pods.sort_by(|a, b| a.id.to_string().cmp(&b.id.to_string()));
        Ok(pods)
    }

    async fn get_pod(&self, id: &PodId) -> Result<PodInfo, ClusterError> {
        self.pods
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .ok_or_else(|| ClusterError::NotFound {
                kind: "pod",
                name: id.to_string(),
            })
    }

    async fn list_nodes(&self) -> Result<Vec<NodeInfo>, ClusterError> {
        let mut nodes: Vec<NodeInfo> = self.nodes.lock().unwrap().values().cloned().collect();
        nodes.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(nodes)
    }

    async fn get_node(&self, name: &str) -> Result<NodeInfo, ClusterError> {
        self.nodes
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| ClusterError::NotFound {
                kind: "node",
                name: name.to_string(),
            })
    }

    async fn list_pdbs(&self, namespace: &str) -> Result<Vec<PdbInfo>, ClusterError> {
        Ok(self
            .pdbs
            .lock()
            .unwrap()
            .iter()
            .filter(|p| p.namespace == namespace)
            .cloned()
            .collect())
    }

    async fn get_workload_owner(
        &self,
        id: &PodId,
    ) -> Result<Option<WorkloadRef>, ClusterError> {
        Ok(self.get_pod(id).await?.owner)
    }

    async fn cordon_node(&self, name: &str) -> Result<(), ClusterError> {
        self.cordon_probe.enter();
        let delay = *self.cordon_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.cordon_probe.exit();
        if self.cordon_failures.lock().unwrap().contains(name) {
            return Err(ClusterError::Api(format!("cordon of {name} refused")));
        }
        if let Some(node) = self.nodes.lock().unwrap().get_mut(name) {
            node.unschedulable = true;
        }
        self.cordons.lock().unwrap().push(name.to_string());
        Ok(())
    }

    async fn evict_pod(&self, id: &PodId) -> Result<(), ClusterError> {
        self.evict_probe.enter();
        let delay = *self.evict_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.evict_probe.exit();
        self.evictions.lock().unwrap().push(id.clone());
        if self.evict_failures.lock().unwrap().contains(id) {
            return Err(ClusterError::Api(format!("eviction of {id} refused")));
        }
        {
            let mut conflicts = self.pdb_conflicts.lock().unwrap();
            if let Some(remaining) = conflicts.get_mut(id) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(ClusterError::DisruptionBudget {
                        pod: id.clone(),
                        message: "Cannot evict pod as it would violate the pod's disruption budget"
                            .to_string(),
                    });
                }
            }
        }
        if self.auto_delete {
            self.delete_pod(id);
        }
        Ok(())
    }

    async fn register_delete_callback(&self, id: &PodId) -> oneshot::Receiver<()> {
        self.callbacks.register(id)
    }

    async fn unregister_delete_callback(&self, id: &PodId) {
        self.callbacks.unregister(id);
    }
}
