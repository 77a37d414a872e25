//! Core data models for the cluster repacker

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Identity of a pod: namespace plus name
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PodId {
    pub namespace: String,
    pub name: String,
}

impl PodId {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Parse a `namespace/name` string as emitted by the optimizer
    pub fn parse(s: &str) -> Option<Self> {
        let (namespace, name) = s.split_once('/')?;
        if namespace.is_empty() || name.is_empty() {
            return None;
        }
        Some(Self::new(namespace, name))
    }
}

impl fmt::Display for PodId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Identity of the workload controller that owns a pod
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkloadId {
    pub namespace: String,
    pub kind: String,
    pub name: String,
}

impl fmt::Display for WorkloadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.namespace, self.kind, self.name)
    }
}

/// Reference from a pod to its owning workload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadRef {
    pub kind: String,
    pub name: String,
}

impl WorkloadRef {
    pub fn workload_id(&self, namespace: &str) -> WorkloadId {
        WorkloadId {
            namespace: namespace.to_string(),
            kind: self.kind.clone(),
            name: self.name.clone(),
        }
    }
}

/// A pod as observed in the cluster snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PodInfo {
    pub id: PodId,
    pub node_name: String,
    pub owner: Option<WorkloadRef>,
    pub cpu_request_millicores: u64,
    pub memory_request_bytes: u64,
    #[serde(default)]
    pub scheduling: SchedulingRules,
}

/// Scheduling constraints attached to a pod's workload
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchedulingRules {
    #[serde(default)]
    pub node_selector: HashMap<String, String>,
    #[serde(default)]
    pub required_node_affinity: Vec<String>,
    #[serde(default)]
    pub preferred_node_affinity: Vec<String>,
    #[serde(default)]
    pub pod_affinity: Vec<String>,
    #[serde(default)]
    pub pod_anti_affinity: Vec<String>,
}

impl SchedulingRules {
    pub fn is_empty(&self) -> bool {
        self.node_selector.is_empty()
            && self.required_node_affinity.is_empty()
            && self.preferred_node_affinity.is_empty()
            && self.pod_affinity.is_empty()
            && self.pod_anti_affinity.is_empty()
    }
}

/// A node as observed in the cluster snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeInfo {
    pub name: String,
    pub cpu_allocatable_millicores: u64,
    pub memory_allocatable_bytes: u64,
    pub unschedulable: bool,
}

/// A PodDisruptionBudget as observed in the cluster snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PdbInfo {
    pub namespace: String,
    pub name: String,
    pub disruptions_allowed: i32,
}

/// Pod feature record submitted to the optimizer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PodRecord {
    pub item: String,
    pub node: String,
    pub cpu_millicores: u64,
    pub memory_bytes: u64,
    pub eligible: bool,
}

/// Node feature record submitted to the optimizer
///
/// Available capacity is allocatable minus the requests of pods that
/// cannot be migrated off the node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub name: String,
    pub cpu_allocatable_millicores: u64,
    pub memory_allocatable_bytes: u64,
    pub cpu_available_millicores: u64,
    pub memory_available_bytes: u64,
    pub unschedulable: bool,
}

/// One movement in a migration plan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanEntry {
    pub item: PodId,
    pub from: String,
    pub to: String,
    pub priority: i32,
}

/// The plan produced by one successful calculation cycle
///
/// Immutable once stored; superseded wholesale by the next cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationPlan {
    pub computed_at: i64,
    pub entries: Vec<PlanEntry>,
}

impl MigrationPlan {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Plan entries grouped under the workload that owns their pods
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkloadPlanSet {
    pub workload: WorkloadId,
    pub entries: Vec<PlanEntry>,
}

impl WorkloadPlanSet {
    /// Deduplicated destination node names for this workload
    pub fn destination_nodes(&self) -> Vec<String> {
        let mut nodes: Vec<String> = Vec::new();
        for entry in &self.entries {
            if !nodes.iter().any(|n| n == &entry.to) {
                nodes.push(entry.to.clone());
            }
        }
        nodes
    }
}

/// One node's worth of eviction work within a migration run
#[derive(Debug, Clone)]
pub struct NodeEvictionBatch {
    pub trace_id: String,
    pub node: String,
    pub entries: Vec<PlanEntry>,
}
