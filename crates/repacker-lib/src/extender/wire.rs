//! Scheduler-extender wire payloads
//!
//! Serde mirrors of the upstream scheduler-extension JSON contract.
//! Field names follow the wire casing exactly; only the fields this
//! service reads or writes are modeled.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Pod identity as it appears inside extender payloads
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PodMeta {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
}

/// The pod envelope in filter/prioritize requests
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PodView {
    #[serde(default)]
    pub metadata: PodMeta,
}

/// Arguments for `/filter` and `/prioritize`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExtenderArgs {
    #[serde(default)]
    pub pod: PodView,
    /// Candidate node names offered by the scheduler
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nodenames: Option<Vec<String>>,
}

/// Result of `/filter`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExtenderFilterResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nodenames: Option<Vec<String>>,
    /// Per-node rejection reasons
    #[serde(default, rename = "failedNodes", skip_serializing_if = "HashMap::is_empty")]
    pub failed_nodes: HashMap<String, String>,
    /// Non-empty when the whole filter failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// One scored host in a `/prioritize` response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostPriority {
    pub host: String,
    pub score: i64,
}

/// Arguments for `/bind`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExtenderBindingArgs {
    #[serde(rename = "podName", default)]
    pub pod_name: String,
    #[serde(rename = "podNamespace", default)]
    pub pod_namespace: String,
    #[serde(rename = "podUID", default)]
    pub pod_uid: String,
    #[serde(default)]
    pub node: String,
}

/// Result of `/bind`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExtenderBindingResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Arguments for `/preempt`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExtenderPreemptionArgs {
    #[serde(default)]
    pub pod: PodView,
    #[serde(
        rename = "nodeNameToMetaVictims",
        default,
        skip_serializing_if = "HashMap::is_empty"
    )]
    pub node_name_to_meta_victims: HashMap<String, MetaVictims>,
}

/// Result of `/preempt`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExtenderPreemptionResult {
    #[serde(
        rename = "nodeNameToMetaVictims",
        default,
        skip_serializing_if = "HashMap::is_empty"
    )]
    pub node_name_to_meta_victims: HashMap<String, MetaVictims>,
}

/// Victim pods proposed for preemption on one node
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetaVictims {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pods: Vec<MetaPod>,
    #[serde(
        rename = "numPDBViolations",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub num_pdb_violations: Option<i64>,
}

/// A victim pod referenced by UID only
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetaPod {
    #[serde(rename = "UID", default)]
    pub uid: String,
}
