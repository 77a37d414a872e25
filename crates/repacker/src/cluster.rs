//! Kubernetes API server backed cluster state
//!
//! A thin REST client implementing [`ClusterState`] directly against
//! the API server. Deletion notifications are driven by polling the
//! pod resource rather than a watch cache; the eviction engine only
//! needs the one-shot gone signal.

use async_trait::async_trait;
use repacker_lib::cluster::{ClusterError, ClusterState, DeleteCallbackRegistry};
use repacker_lib::models::{NodeInfo, PdbInfo, PodId, PodInfo, SchedulingRules, WorkloadRef};
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, warn};

const DELETE_POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Default, Deserialize)]
struct ObjectList<T> {
    #[serde(default)]
    items: Vec<T>,
}

#[derive(Debug, Default, Deserialize)]
struct KubeMeta {
    #[serde(default)]
    name: String,
    #[serde(default)]
    namespace: String,
    #[serde(default, rename = "ownerReferences")]
    owner_references: Vec<OwnerReference>,
}

#[derive(Debug, Deserialize)]
struct OwnerReference {
    kind: String,
    name: String,
    #[serde(default)]
    controller: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
struct KubePod {
    #[serde(default)]
    metadata: KubeMeta,
    #[serde(default)]
    spec: KubePodSpec,
}

#[derive(Debug, Default, Deserialize)]
struct KubePodSpec {
    #[serde(default, rename = "nodeName")]
    node_name: Option<String>,
    #[serde(default, rename = "nodeSelector")]
    node_selector: HashMap<String, String>,
    #[serde(default)]
    affinity: Option<serde_json::Value>,
    #[serde(default)]
    containers: Vec<KubeContainer>,
}

#[derive(Debug, Default, Deserialize)]
struct KubeContainer {
    #[serde(default)]
    resources: KubeResources,
}

#[derive(Debug, Default, Deserialize)]
struct KubeResources {
    #[serde(default)]
    requests: HashMap<String, String>,
}

#[derive(Debug, Default, Deserialize)]
struct KubeNode {
    #[serde(default)]
    metadata: KubeMeta,
    #[serde(default)]
    spec: KubeNodeSpec,
    #[serde(default)]
    status: KubeNodeStatus,
}

#[derive(Debug, Default, Deserialize)]
struct KubeNodeSpec {
    #[serde(default)]
    unschedulable: bool,
}

#[derive(Debug, Default, Deserialize)]
struct KubeNodeStatus {
    #[serde(default)]
    allocatable: HashMap<String, String>,
}

#[derive(Debug, Default, Deserialize)]
struct KubePdb {
    #[serde(default)]
    metadata: KubeMeta,
    #[serde(default)]
    status: KubePdbStatus,
}

#[derive(Debug, Default, Deserialize)]
struct KubePdbStatus {
    #[serde(default, rename = "disruptionsAllowed")]
    disruptions_allowed: i32,
}

/// Parse a Kubernetes cpu quantity into millicores
fn parse_cpu_millicores(quantity: &str) -> u64 {
    let trimmed = quantity.trim();
    if let Some(millis) = trimmed.strip_suffix('m') {
        return millis.parse().unwrap_or(0);
    }
    trimmed
        .parse::<f64>()
        .map(|cores| (cores * 1000.0) as u64)
        .unwrap_or(0)
}

/// Parse a Kubernetes memory quantity into bytes
fn parse_memory_bytes(quantity: &str) -> u64 {
    let trimmed = quantity.trim();
    let suffixes: [(&str, u64); 8] = [
        ("Ki", 1 << 10),
        ("Mi", 1 << 20),
        ("Gi", 1 << 30),
        ("Ti", 1 << 40),
        ("K", 1_000),
        ("M", 1_000_000),
        ("G", 1_000_000_000),
        ("T", 1_000_000_000_000),
    ];
    for (suffix, multiplier) in suffixes {
        if let Some(value) = trimmed.strip_suffix(suffix) {
            return value
                .parse::<f64>()
                .map(|v| (v * multiplier as f64) as u64)
                .unwrap_or(0);
        }
    }
    trimmed.parse().unwrap_or(0)
}

fn json_array_strings(value: Option<&serde_json::Value>) -> Vec<String> {
    value
        .and_then(|v| v.as_array())
        .map(|terms| terms.iter().map(|t| t.to_string()).collect())
        .unwrap_or_default()
}

fn scheduling_rules(spec: &KubePodSpec) -> SchedulingRules {
    let mut rules = SchedulingRules {
        node_selector: spec.node_selector.clone(),
        ..Default::default()
    };
    if let Some(affinity) = spec.affinity.as_ref() {
        let node_affinity = affinity.get("nodeAffinity");
        rules.required_node_affinity = json_array_strings(node_affinity.and_then(|a| {
            a.get("requiredDuringSchedulingIgnoredDuringExecution")
                .and_then(|r| r.get("nodeSelectorTerms"))
        }));
        rules.preferred_node_affinity = json_array_strings(
            node_affinity.and_then(|a| a.get("preferredDuringSchedulingIgnoredDuringExecution")),
        );
        rules.pod_affinity = json_array_strings(affinity.get("podAffinity").and_then(|a| {
            a.get("requiredDuringSchedulingIgnoredDuringExecution")
        }));
        rules.pod_anti_affinity =
            json_array_strings(affinity.get("podAntiAffinity").and_then(|a| {
                a.get("requiredDuringSchedulingIgnoredDuringExecution")
            }));
    }
    rules
}

fn pod_info(pod: KubePod) -> PodInfo {
    let mut cpu = 0;
    let mut memory = 0;
    for container in &pod.spec.containers {
        if let Some(request) = container.resources.requests.get("cpu") {
            cpu += parse_cpu_millicores(request);
        }
        if let Some(request) = container.resources.requests.get("memory") {
            memory += parse_memory_bytes(request);
        }
    }
    let owner = pod
        .metadata
        .owner_references
        .iter()
        .find(|r| r.controller.unwrap_or(false))
        .or_else(|| pod.metadata.owner_references.first())
        .map(|r| WorkloadRef {
            kind: r.kind.clone(),
            name: r.name.clone(),
        });
    let scheduling = scheduling_rules(&pod.spec);
    PodInfo {
        id: PodId::new(pod.metadata.namespace, pod.metadata.name),
        node_name: pod.spec.node_name.unwrap_or_default(),
        owner,
        cpu_request_millicores: cpu,
        memory_request_bytes: memory,
        scheduling,
    }
}

fn node_info(node: KubeNode) -> NodeInfo {
    let cpu = node
        .status
        .allocatable
        .get("cpu")
        .map(|q| parse_cpu_millicores(q))
        .unwrap_or(0);
    let memory = node
        .status
        .allocatable
        .get("memory")
        .map(|q| parse_memory_bytes(q))
        .unwrap_or(0);
    NodeInfo {
        name: node.metadata.name,
        cpu_allocatable_millicores: cpu,
        memory_allocatable_bytes: memory,
        unschedulable: node.spec.unschedulable,
    }
}

/// REST-backed implementation of the cluster state boundary
pub struct ApiServerCluster {
    client: reqwest::Client,
    base_url: String,
    token: String,
    deletes: Arc<DeleteCallbackRegistry>,
}

impl ApiServerCluster {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> anyhow::Result<Arc<Self>> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Arc::new(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
            deletes: Arc::new(DeleteCallbackRegistry::new()),
        }))
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let mut builder = self
            .client
            .request(method, format!("{}{}", self.base_url, path));
        if !self.token.is_empty() {
            builder = builder.bearer_auth(&self.token);
        }
        builder
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        kind: &'static str,
        name: &str,
    ) -> Result<T, ClusterError> {
        let response = self
            .request(reqwest::Method::GET, path)
            .send()
            .await
            .map_err(|e| ClusterError::Api(e.to_string()))?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(ClusterError::NotFound {
                kind,
                name: name.to_string(),
            });
        }
        if !response.status().is_success() {
            return Err(ClusterError::Api(format!(
                "GET {} returned {}",
                path,
                response.status()
            )));
        }
        response
            .json()
            .await
            .map_err(|e| ClusterError::Api(e.to_string()))
    }

    /// One full list of pods and nodes, proving the API server is
    /// reachable and readable before the control loops start
    pub async fn wait_for_sync(&self) -> Result<(), ClusterError> {
        let pods = self.list_pods().await?;
        let nodes = self.list_nodes().await?;
        debug!(pods = pods.len(), nodes = nodes.len(), "initial cluster sync complete");
        Ok(())
    }
}

#[async_trait]
impl ClusterState for ApiServerCluster {
    async fn list_pods(&self) -> Result<Vec<PodInfo>, ClusterError> {
        let list: ObjectList<KubePod> = self.get_json("/api/v1/pods", "podlist", "all").await?;
        Ok(list.items.into_iter().map(pod_info).collect())
    }

    async fn get_pod(&self, id: &PodId) -> Result<PodInfo, ClusterError> {
        let path = format!("/api/v1/namespaces/{}/pods/{}", id.namespace, id.name);
        let pod: KubePod = self.get_json(&path, "pod", &id.to_string()).await?;
        Ok(pod_info(pod))
    }

    async fn list_nodes(&self) -> Result<Vec<NodeInfo>, ClusterError> {
        let list: ObjectList<KubeNode> =
            self.get_json("/api/v1/nodes", "nodelist", "all").await?;
        Ok(list.items.into_iter().map(node_info).collect())
    }

    async fn get_node(&self, name: &str) -> Result<NodeInfo, ClusterError> {
        let path = format!("/api/v1/nodes/{}", name);
        let node: KubeNode = self.get_json(&path, "node", name).await?;
        Ok(node_info(node))
    }

    async fn list_pdbs(&self, namespace: &str) -> Result<Vec<PdbInfo>, ClusterError> {
        let path = format!(
            "/apis/policy/v1/namespaces/{}/poddisruptionbudgets",
            namespace
        );
        let list: ObjectList<KubePdb> = self.get_json(&path, "pdblist", namespace).await?;
        Ok(list
            .items
            .into_iter()
            .map(|pdb| PdbInfo {
                namespace: pdb.metadata.namespace,
                name: pdb.metadata.name,
                disruptions_allowed: pdb.status.disruptions_allowed,
            })
            .collect())
    }

    async fn get_workload_owner(
        &self,
        id: &PodId,
    ) -> Result<Option<WorkloadRef>, ClusterError> {
        let pod = self.get_pod(id).await?;
        Ok(pod.owner)
    }

    async fn cordon_node(&self, name: &str) -> Result<(), ClusterError> {
        let path = format!("/api/v1/nodes/{}", name);
        let response = self
            .request(reqwest::Method::PATCH, &path)
            .header("content-type", "application/strategic-merge-patch+json")
            .json(&json!({"spec": {"unschedulable": true}}))
            .send()
            .await
            .map_err(|e| ClusterError::Api(e.to_string()))?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(ClusterError::NotFound {
                kind: "node",
                name: name.to_string(),
            });
        }
        if !response.status().is_success() {
            return Err(ClusterError::Api(format!(
                "cordon of {} returned {}",
                name,
                response.status()
            )));
        }
        Ok(())
    }

    async fn evict_pod(&self, id: &PodId) -> Result<(), ClusterError> {
        let path = format!(
            "/api/v1/namespaces/{}/pods/{}/eviction",
            id.namespace, id.name
        );
        let body = json!({
            "apiVersion": "policy/v1",
            "kind": "Eviction",
            "metadata": {"name": id.name, "namespace": id.namespace}
        });
        let response = self
            .request(reqwest::Method::POST, &path)
            .json(&body)
            .send()
            .await
            .map_err(|e| ClusterError::Api(e.to_string()))?;
        match response.status() {
            status if status.is_success() => Ok(()),
            StatusCode::NOT_FOUND => Err(ClusterError::NotFound {
                kind: "pod",
                name: id.to_string(),
            }),
            // The API server answers 429 when a disruption budget
            // blocks the eviction.
            StatusCode::TOO_MANY_REQUESTS => {
                let message = response.text().await.unwrap_or_default();
                Err(ClusterError::DisruptionBudget {
                    pod: id.clone(),
                    message,
                })
            }
            status => Err(ClusterError::Api(format!(
                "eviction of {} returned {}",
                id, status
            ))),
        }
    }

    async fn register_delete_callback(&self, id: &PodId) -> oneshot::Receiver<()> {
        let rx = self.deletes.register(id);
        let id = id.clone();
        let client = self.client.clone();
        let base_url = self.base_url.clone();
        let token = self.token.clone();
        let poller = PollHandle {
            client,
            base_url,
            token,
        };
        let registry = Arc::clone(&self.deletes);
        tokio::spawn(poll_for_deletion(
            poller,
            registry,
            id,
            DELETE_POLL_INTERVAL,
        ));
        rx
    }

    async fn unregister_delete_callback(&self, id: &PodId) {
        self.deletes.unregister(id);
    }
}

/// Poll the API server until the pod is gone or its registration ends
///
/// The loop checks the registry before every poll, so an unregistered
/// or superseded callback stops the task instead of leaving it GETing
/// the API server for a pod nobody is waiting on.
async fn poll_for_deletion(
    poller: PollHandle,
    registry: Arc<DeleteCallbackRegistry>,
    id: PodId,
    interval: Duration,
) {
    loop {
        tokio::time::sleep(interval).await;
        if !registry.is_pending(&id) {
            debug!(pod = %id, "delete poll stopped, registration dropped");
            break;
        }
        match poller.pod_exists(&id).await {
            Ok(false) => {
                registry.fire(&id);
                break;
            }
            Ok(true) => {}
            Err(e) => {
                warn!(pod = %id, error = %e, "delete poll failed");
            }
        }
    }
}

struct PollHandle {
    client: reqwest::Client,
    base_url: String,
    token: String,
}

impl PollHandle {
    async fn pod_exists(&self, id: &PodId) -> Result<bool, ClusterError> {
        let path = format!("/api/v1/namespaces/{}/pods/{}", id.namespace, id.name);
        let mut builder = self
            .client
            .get(format!("{}{}", self.base_url, path));
        if !self.token.is_empty() {
            builder = builder.bearer_auth(&self.token);
        }
        let response = builder
            .send()
            .await
            .map_err(|e| ClusterError::Api(e.to_string()))?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(false);
        }
        if !response.status().is_success() {
            return Err(ClusterError::Api(format!(
                "delete poll returned {}",
                response.status()
            )));
        }
        Ok(true)
    }
}
