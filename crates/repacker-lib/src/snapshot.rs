//! Cluster snapshot and feature records for the optimizer
//!
//! Builds the pod and node arrays submitted to the optimizer from the
//! live cluster state, together with the affinity scope derived from
//! each workload's scheduling rules. Required rules become forced
//! constraints, preferred rules become soft constraints.

use crate::cluster::ClusterState;
use crate::models::{NodeRecord, PodInfo, PodRecord};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::debug;

/// Namespaces whose pods are never migrated
pub const DENY_LIST_NAMESPACES: &[&str] = &["kube-system", "kube-public", "kube-node-lease"];

/// Owner kind whose pods are never migrated
const DAEMONSET_KIND: &str = "DaemonSet";

/// One affinity constraint in the optimizer scope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScopeRule {
    pub item: String,
    pub rule: String,
    /// Forced rules must hold in any returned plan; soft rules only
    /// bias the optimization
    pub forced: bool,
}

/// Snapshot of the cluster prepared for one calculation cycle
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterSnapshot {
    pub pods: Vec<PodRecord>,
    pub nodes: Vec<NodeRecord>,
    pub scope: Vec<ScopeRule>,
    pub taken_at: i64,
}

/// Migration eligibility per the fixed policy rules
pub fn is_eligible(pod: &PodInfo) -> bool {
    if DENY_LIST_NAMESPACES.contains(&pod.id.namespace.as_str()) {
        return false;
    }
    if let Some(owner) = &pod.owner {
        if owner.kind == DAEMONSET_KIND {
            return false;
        }
    }
    true
}

/// Derive the optimizer scope from one pod's scheduling rules
fn scope_rules(pod: &PodInfo) -> Vec<ScopeRule> {
    let item = pod.id.to_string();
    let mut rules = Vec::new();
    for (key, value) in &pod.scheduling.node_selector {
        rules.push(ScopeRule {
            item: item.clone(),
            rule: format!("nodeSelector:{key}={value}"),
            forced: true,
        });
    }
    for expr in &pod.scheduling.required_node_affinity {
        rules.push(ScopeRule {
            item: item.clone(),
            rule: format!("nodeAffinity:{expr}"),
            forced: true,
        });
    }
    for expr in &pod.scheduling.preferred_node_affinity {
        rules.push(ScopeRule {
            item: item.clone(),
            rule: format!("nodeAffinity:{expr}"),
            forced: false,
        });
    }
    for expr in &pod.scheduling.pod_affinity {
        rules.push(ScopeRule {
            item: item.clone(),
            rule: format!("podAffinity:{expr}"),
            forced: true,
        });
    }
    for expr in &pod.scheduling.pod_anti_affinity {
        rules.push(ScopeRule {
            item: item.clone(),
            rule: format!("podAntiAffinity:{expr}"),
            forced: true,
        });
    }
    rules
}

/// Snapshot the cluster into optimizer feature records
///
/// Ineligible pods are excluded from the pod array but their requests
/// are still subtracted from their node's available capacity, so the
/// optimizer never over-commits capacity already pinned down by
/// non-movable pods.
pub async fn take_snapshot(cluster: &dyn ClusterState) -> Result<ClusterSnapshot> {
    let pods = cluster.list_pods().await?;
    let nodes = cluster.list_nodes().await?;

    let mut pinned_cpu: HashMap<String, u64> = HashMap::new();
    let mut pinned_mem: HashMap<String, u64> = HashMap::new();
    let mut pod_records = Vec::new();
    let mut scope = Vec::new();

    for pod in &pods {
        if !is_eligible(pod) {
            *pinned_cpu.entry(pod.node_name.clone()).or_default() +=
                pod.cpu_request_millicores;
            *pinned_mem.entry(pod.node_name.clone()).or_default() += pod.memory_request_bytes;
            debug!(pod = %pod.id, node = %pod.node_name, "pod excluded from migration");
            continue;
        }
        scope.extend(scope_rules(pod));
        pod_records.push(PodRecord {
            item: pod.id.to_string(),
            node: pod.node_name.clone(),
            cpu_millicores: pod.cpu_request_millicores,
            memory_bytes: pod.memory_request_bytes,
            eligible: true,
        });
    }

    let node_records = nodes
        .iter()
        .map(|node| {
            let pinned_c = pinned_cpu.get(&node.name).copied().unwrap_or(0);
            let pinned_m = pinned_mem.get(&node.name).copied().unwrap_or(0);
            NodeRecord {
                name: node.name.clone(),
                cpu_allocatable_millicores: node.cpu_allocatable_millicores,
                memory_allocatable_bytes: node.memory_allocatable_bytes,
                cpu_available_millicores: node
                    .cpu_allocatable_millicores
                    .saturating_sub(pinned_c),
                memory_available_bytes: node.memory_allocatable_bytes.saturating_sub(pinned_m),
                unschedulable: node.unschedulable,
            }
        })
        .collect();

    Ok(ClusterSnapshot {
        pods: pod_records,
        nodes: node_records,
        scope,
        taken_at: chrono::Utc::now().timestamp(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::fake::FakeCluster;
    use crate::models::{NodeInfo, PodId, PodInfo, SchedulingRules, WorkloadRef};
    use std::collections::HashMap;

    fn pod(ns: &str, name: &str, node: &str, cpu: u64, owner_kind: Option<&str>) -> PodInfo {
        PodInfo {
            id: PodId::new(ns, name),
            node_name: node.to_string(),
            owner: owner_kind.map(|kind| WorkloadRef {
                kind: kind.to_string(),
                name: format!("{name}-owner"),
            }),
            cpu_request_millicores: cpu,
            memory_request_bytes: cpu * 1024 * 1024,
            scheduling: SchedulingRules::default(),
        }
    }

    fn node(name: &str, cpu: u64) -> NodeInfo {
        NodeInfo {
            name: name.to_string(),
            cpu_allocatable_millicores: cpu,
            memory_allocatable_bytes: cpu * 1024 * 1024,
            unschedulable: false,
        }
    }

    #[test]
    fn deny_list_namespaces_are_ineligible() {
        assert!(!is_eligible(&pod(
            "kube-system",
            "dns",
            "node1",
            100,
            Some("Deployment")
        )));
        assert!(is_eligible(&pod("default", "web", "node1", 100, Some("Deployment"))));
    }

    #[test]
    fn daemonset_pods_are_ineligible() {
        assert!(!is_eligible(&pod(
            "default",
            "logger",
            "node1",
            100,
            Some("DaemonSet")
        )));
    }

    #[tokio::test]
    async fn ineligible_requests_still_reduce_available_capacity() {
        let cluster = FakeCluster::new();
        cluster.add_node(node("node1", 4000));
        cluster.add_pod(pod("default", "web", "node1", 1000, Some("Deployment")));
        cluster.add_pod(pod("default", "logger", "node1", 500, Some("DaemonSet")));

        let snapshot = take_snapshot(&cluster).await.unwrap();

        // Only the movable pod is submitted.
        assert_eq!(snapshot.pods.len(), 1);
        assert_eq!(snapshot.pods[0].item, "default/web");

        // Available capacity subtracts the daemonset pod but not the
        // movable one.
        let n = &snapshot.nodes[0];
        assert_eq!(n.cpu_allocatable_millicores, 4000);
        assert_eq!(n.cpu_available_millicores, 3500);
    }

    #[tokio::test]
    async fn required_rules_are_forced_and_preferred_are_soft() {
        let cluster = FakeCluster::new();
        cluster.add_node(node("node1", 4000));
        let mut p = pod("default", "web", "node1", 1000, Some("Deployment"));
        p.scheduling = SchedulingRules {
            node_selector: HashMap::from([("disktype".to_string(), "ssd".to_string())]),
            required_node_affinity: vec!["zone in (a,b)".to_string()],
            preferred_node_affinity: vec!["zone in (a)".to_string()],
            pod_affinity: vec![],
            pod_anti_affinity: vec!["app=web".to_string()],
        };
        cluster.add_pod(p);

        let snapshot = take_snapshot(&cluster).await.unwrap();
        let forced: Vec<_> = snapshot.scope.iter().filter(|r| r.forced).collect();
        let soft: Vec<_> = snapshot.scope.iter().filter(|r| !r.forced).collect();
        assert_eq!(forced.len(), 3);
        assert_eq!(soft.len(), 1);
        assert!(soft[0].rule.starts_with("nodeAffinity:"));
    }
}
