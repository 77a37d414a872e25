//! Eviction engine
//!
//! Executes one migration run's node batches: cordons each affected
//! node before touching its pods, then evicts with bounded parallelism
//! at two levels: a fixed pool of node workers and a global semaphore
//! capping in-flight evictions. Disruption-budget conflicts retry on a
//! fixed interval until the budget allows the eviction; every other
//! per-entry failure is logged and does not abort siblings.

use crate::cluster::{ClusterError, ClusterState};
use crate::models::{NodeEvictionBatch, PlanEntry};
use crate::observability::RepackerMetrics;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Bounds and pacing for a migration run
#[derive(Debug, Clone)]
pub struct EvictionConfig {
    /// Nodes migrated concurrently
    pub max_eviction_nodes: usize,
    /// In-flight pod evictions across all nodes
    pub max_eviction_parallel: usize,
    /// Fixed interval between eviction attempts on a PDB conflict
    pub retry_interval: Duration,
}

impl Default for EvictionConfig {
    fn default() -> Self {
        Self {
            max_eviction_nodes: 3,
            max_eviction_parallel: 5,
            retry_interval: Duration::from_secs(5),
        }
    }
}

/// Outcome of one plan entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryOutcome {
    Evicted,
    Failed,
    Cancelled,
}

/// Counts for one migration run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub evicted: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub nodes_aborted: usize,
}

/// Resolves once the run is cancelled
///
/// The cancel channel is level-triggered: a receiver observes the
/// signal even when it was raised before this call. A closed channel
/// counts as cancellation so a dropped sender can never strand a
/// retry loop.
async fn wait_cancelled(cancel: &mut watch::Receiver<bool>) {
    loop {
        if *cancel.borrow() {
            return;
        }
        if cancel.changed().await.is_err() {
            return;
        }
    }
}

/// Executes migration plans against the cluster
pub struct EvictionEngine {
    cluster: Arc<dyn ClusterState>,
    config: EvictionConfig,
    gate: Arc<Semaphore>,
    metrics: RepackerMetrics,
}

impl EvictionEngine {
    pub fn new(cluster: Arc<dyn ClusterState>, config: EvictionConfig) -> Self {
        let gate = Arc::new(Semaphore::new(config.max_eviction_parallel));
        Self {
            cluster,
            config,
            gate,
            metrics: RepackerMetrics::new(),
        }
    }

    /// Run all node batches to completion or cancellation
    pub async fn execute(
        &self,
        batches: Vec<NodeEvictionBatch>,
        cancel: watch::Receiver<bool>,
    ) -> RunSummary {
        if batches.is_empty() {
            return RunSummary::default();
        }
        let worker_count = self.config.max_eviction_nodes.min(batches.len()).max(1);
        let queue = Arc::new(Mutex::new(VecDeque::from(batches)));

        let mut workers = JoinSet::new();
        for _ in 0..worker_count {
            let cluster = Arc::clone(&self.cluster);
            let gate = Arc::clone(&self.gate);
            let queue = Arc::clone(&queue);
            let cancel = cancel.clone();
            let retry_interval = self.config.retry_interval;
            let metrics = self.metrics.clone();
            workers.spawn(async move {
                let mut summary = RunSummary::default();
                loop {
                    let batch = { queue.lock().await.pop_front() };
                    let Some(batch) = batch else { break };
                    // A batch dequeued after the signal is written off
                    // without cordoning its node.
                    if *cancel.borrow() {
                        debug!(
                            trace_id = %batch.trace_id,
                            node = %batch.node,
                            "batch cancelled before start"
                        );
                        summary.cancelled += batch.entries.len();
                        continue;
                    }
                    run_node_batch(
                        &cluster,
                        &gate,
                        retry_interval,
                        &metrics,
                        batch,
                        &cancel,
                        &mut summary,
                    )
                    .await;
                }
                summary
            });
        }

        let mut total = RunSummary::default();
        while let Some(result) = workers.join_next().await {
            if let Ok(summary) = result {
                total.evicted += summary.evicted;
                total.failed += summary.failed;
                total.cancelled += summary.cancelled;
                total.nodes_aborted += summary.nodes_aborted;
            }
        }
        info!(
            evicted = total.evicted,
            failed = total.failed,
            cancelled = total.cancelled,
            nodes_aborted = total.nodes_aborted,
            "migration run finished"
        );
        total
    }
}

/// Cordon one node and evict all of its plan entries concurrently
async fn run_node_batch(
    cluster: &Arc<dyn ClusterState>,
    gate: &Arc<Semaphore>,
    retry_interval: Duration,
    metrics: &RepackerMetrics,
    batch: NodeEvictionBatch,
    cancel: &watch::Receiver<bool>,
    summary: &mut RunSummary,
) {
    // No partial eviction on an uncordoned node.
    if let Err(e) = cluster.cordon_node(&batch.node).await {
        warn!(
            trace_id = %batch.trace_id,
            node = %batch.node,
            error = %e,
            "cordon failed, aborting node migration"
        );
        summary.nodes_aborted += 1;
        return;
    }
    debug!(trace_id = %batch.trace_id, node = %batch.node, entries = batch.entries.len(), "node cordoned");

    let mut entries = JoinSet::new();
    for entry in batch.entries {
        let cluster = Arc::clone(cluster);
        let gate = Arc::clone(gate);
        let trace_id = batch.trace_id.clone();
        let cancel = cancel.clone();
        let metrics = metrics.clone();
        entries.spawn(async move {
            run_entry(cluster, gate, retry_interval, metrics, trace_id, entry, cancel).await
        });
    }
    while let Some(result) = entries.join_next().await {
        match result {
            Ok(EntryOutcome::Evicted) => summary.evicted += 1,
            Ok(EntryOutcome::Failed) => summary.failed += 1,
            Ok(EntryOutcome::Cancelled) => summary.cancelled += 1,
            Err(e) => {
                warn!(error = %e, "eviction task panicked");
                summary.failed += 1;
            }
        }
    }
}

/// Evict one pod and wait for its deletion to be observed
async fn run_entry(
    cluster: Arc<dyn ClusterState>,
    gate: Arc<Semaphore>,
    retry_interval: Duration,
    metrics: RepackerMetrics,
    trace_id: String,
    entry: PlanEntry,
    mut cancel: watch::Receiver<bool>,
) -> EntryOutcome {
    // Global eviction slot; blocks until in-flight evictions drop
    // below the configured bound.
    let permit = tokio::select! {
        permit = gate.acquire_owned() => match permit {
            Ok(p) => p,
            Err(_) => return EntryOutcome::Cancelled,
        },
        _ = wait_cancelled(&mut cancel) => {
            debug!(trace_id = %trace_id, pod = %entry.item, "cancelled before eviction");
            return EntryOutcome::Cancelled;
        }
    };
    let _permit = permit;
    metrics.inc_inflight_evictions();
    let outcome = evict_and_confirm(
        &cluster,
        retry_interval,
        &metrics,
        &trace_id,
        &entry,
        &mut cancel,
    )
    .await;
    metrics.dec_inflight_evictions();
    outcome
}

async fn evict_and_confirm(
    cluster: &Arc<dyn ClusterState>,
    retry_interval: Duration,
    metrics: &RepackerMetrics,
    trace_id: &str,
    entry: &PlanEntry,
    cancel: &mut watch::Receiver<bool>,
) -> EntryOutcome {
    loop {
        if *cancel.borrow() {
            return EntryOutcome::Cancelled;
        }
        match cluster.evict_pod(&entry.item).await {
            Ok(()) => break,
            Err(e) if e.is_disruption_budget() => {
                metrics.inc_eviction_retries();
                if let Ok(pdbs) = cluster.list_pdbs(&entry.item.namespace).await {
                    let names: Vec<&str> = pdbs.iter().map(|p| p.name.as_str()).collect();
                    debug!(
                        trace_id = %trace_id,
                        pod = %entry.item,
                        budgets = ?names,
                        "eviction blocked by disruption budget, will retry"
                    );
                }
                tokio::select! {
                    _ = tokio::time::sleep(retry_interval) => {}
                    _ = wait_cancelled(cancel) => return EntryOutcome::Cancelled,
                }
            }
            Err(e) => {
                warn!(trace_id = %trace_id, pod = %entry.item, error = %e, "eviction failed");
                metrics.inc_eviction_failures();
                return EntryOutcome::Failed;
            }
        }
    }

    // Migration must not proceed on a pod that is merely
    // marked-for-deletion; wait until the collaborator observes it
    // gone.
    let deleted = cluster.register_delete_callback(&entry.item).await;
    match cluster.get_pod(&entry.item).await {
        Err(ClusterError::NotFound { .. }) => {
            // Deleted between the eviction call and the registration.
            cluster.unregister_delete_callback(&entry.item).await;
            metrics.inc_evictions();
            return EntryOutcome::Evicted;
        }
        Err(e) => {
            warn!(trace_id = %trace_id, pod = %entry.item, error = %e, "lookup after eviction failed");
        }
        Ok(_) => {}
    }
    tokio::select! {
        result = deleted => {
            if result.is_err() {
                // Registration was superseded; the pod's fate is owned
                // by whoever replaced it.
                return EntryOutcome::Cancelled;
            }
            debug!(trace_id = %trace_id, pod = %entry.item, "pod deletion confirmed");
            metrics.inc_evictions();
            EntryOutcome::Evicted
        }
        _ = wait_cancelled(cancel) => {
            cluster.unregister_delete_callback(&entry.item).await;
            debug!(trace_id = %trace_id, pod = %entry.item, "cancelled while awaiting deletion");
            EntryOutcome::Cancelled
        }
    }
}
