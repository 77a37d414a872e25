//! Scheduler-extender HTTP service
//!
//! Answers the scheduler's filter/prioritize/bind/preempt callbacks
//! from the workload plan map. A pod whose workload has no plan set
//! gets a failed filter rather than the full node list, so pods this
//! service never planned for are left to other placement mechanisms.

pub mod wire;

use crate::cluster::ClusterState;
use crate::models::{PodId, WorkloadId};
use crate::observability::RepackerMetrics;
use crate::store::PlanStore;
use axum::{
    extract::rejection::JsonRejection,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use serde_json::json;
use std::sync::Arc;
use tower_http::catch_panic::CatchPanicLayer;
use tracing::{info, warn};
use wire::{
    ExtenderArgs, ExtenderBindingArgs, ExtenderBindingResult, ExtenderFilterResult,
    ExtenderPreemptionArgs, ExtenderPreemptionResult, HostPriority,
};

/// Score given to nodes named in the workload's plan
const PLAN_NODE_SCORE: i64 = 10;

/// Shared state for the extender handlers
#[derive(Clone)]
pub struct ExtenderState {
    cluster: Arc<dyn ClusterState>,
    store: Arc<PlanStore>,
    metrics: RepackerMetrics,
}

impl ExtenderState {
    pub fn new(cluster: Arc<dyn ClusterState>, store: Arc<PlanStore>) -> Self {
        Self {
            cluster,
            store,
            metrics: RepackerMetrics::new(),
        }
    }

    /// Resolve a pod to its workload's planned destination nodes
    pub(crate) async fn filter_nodes(
        &self,
        pod: &PodId,
        candidates: Option<&[String]>,
        correlation_id: &str,
    ) -> ExtenderFilterResult {
        let owner = match self.cluster.get_workload_owner(pod).await {
            Ok(Some(owner)) => owner,
            Ok(None) => {
                return ExtenderFilterResult {
                    nodenames: Some(Vec::new()),
                    error: Some(format!("pod {} has no owning workload", pod)),
                    ..Default::default()
                };
            }
            Err(e) => {
                return ExtenderFilterResult {
                    nodenames: Some(Vec::new()),
                    error: Some(format!("owner lookup for {} failed: {}", pod, e)),
                    ..Default::default()
                };
            }
        };
        let workload = owner.workload_id(&pod.namespace);

        let Some(plan) = self.store.workload_plan(&workload).await else {
            return ExtenderFilterResult {
                nodenames: Some(Vec::new()),
                error: Some(format!(
                    "no migration plan for {}",
                    workload_label(&workload)
                )),
                ..Default::default()
            };
        };

        let mut result = ExtenderFilterResult {
            nodenames: Some(Vec::new()),
            ..Default::default()
        };
        for node in plan.destination_nodes() {
            if let Some(candidates) = candidates {
                if !candidates.iter().any(|c| c == &node) {
                    result
                        .failed_nodes
                        .insert(node, "not offered by the scheduler".to_string());
                    continue;
                }
            }
            match self.cluster.get_node(&node).await {
                Ok(resolved) => {
                    if let Some(names) = result.nodenames.as_mut() {
                        names.push(resolved.name);
                    }
                }
                Err(e) => {
                    warn!(
                        correlation_id = %correlation_id,
                        node = %node,
                        error = %e,
                        "planned destination node did not resolve, skipping"
                    );
                    result.failed_nodes.insert(node, e.to_string());
                }
            }
        }
        result
    }

    /// Score candidates: planned destinations first, everything else zero
    async fn prioritize_nodes(&self, pod: &PodId, candidates: &[String]) -> Vec<HostPriority> {
        let destinations = match self.cluster.get_workload_owner(pod).await {
            Ok(Some(owner)) => {
                let workload = owner.workload_id(&pod.namespace);
                self.store
                    .workload_plan(&workload)
                    .await
                    .map(|plan| plan.destination_nodes())
                    .unwrap_or_default()
            }
            _ => Vec::new(),
        };
        candidates
            .iter()
            .map(|host| HostPriority {
                host: host.clone(),
                score: if destinations.iter().any(|d| d == host) {
                    PLAN_NODE_SCORE
                } else {
                    0
                },
            })
            .collect()
    }
}

fn workload_label(workload: &WorkloadId) -> String {
    format!(
        "{} {}/{}",
        workload.kind, workload.namespace, workload.name
    )
}

fn correlation_id(headers: &HeaderMap) -> String {
    headers
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| format!("ext-{}", chrono::Utc::now().timestamp_micros()))
}

fn error_response(message: String) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": message })),
    )
        .into_response()
}

async fn filter(
    State(state): State<Arc<ExtenderState>>,
    headers: HeaderMap,
    body: Result<Json<ExtenderArgs>, JsonRejection>,
) -> Response {
    state.metrics.inc_extender_requests();
    let correlation_id = correlation_id(&headers);
    let Json(args) = match body {
        Ok(body) => body,
        Err(e) => return error_response(e.to_string()),
    };
    let pod = PodId::new(args.pod.metadata.namespace, args.pod.metadata.name);
    let result = state
        .filter_nodes(&pod, args.nodenames.as_deref(), &correlation_id)
        .await;
    info!(
        correlation_id = %correlation_id,
        pod = %pod,
        allowed = result.nodenames.as_ref().map(Vec::len).unwrap_or(0),
        failed = result.failed_nodes.len(),
        error = result.error.as_deref().unwrap_or(""),
        "filter answered"
    );
    Json(result).into_response()
}

async fn prioritize(
    State(state): State<Arc<ExtenderState>>,
    headers: HeaderMap,
    body: Result<Json<ExtenderArgs>, JsonRejection>,
) -> Response {
    state.metrics.inc_extender_requests();
    let correlation_id = correlation_id(&headers);
    let Json(args) = match body {
        Ok(body) => body,
        Err(e) => return error_response(e.to_string()),
    };
    let pod = PodId::new(args.pod.metadata.namespace, args.pod.metadata.name);
    let candidates = args.nodenames.unwrap_or_default();
    let priorities = state.prioritize_nodes(&pod, &candidates).await;
    info!(
        correlation_id = %correlation_id,
        pod = %pod,
        candidates = candidates.len(),
        "prioritize answered"
    );
    Json(priorities).into_response()
}

/// Binding is left to the default scheduler path; acknowledging the
/// callback without an error delegates the actual bind.
async fn bind(
    State(state): State<Arc<ExtenderState>>,
    headers: HeaderMap,
    body: Result<Json<ExtenderBindingArgs>, JsonRejection>,
) -> Response {
    state.metrics.inc_extender_requests();
    let correlation_id = correlation_id(&headers);
    let Json(args) = match body {
        Ok(body) => body,
        Err(e) => return error_response(e.to_string()),
    };
    info!(
        correlation_id = %correlation_id,
        pod = %format!("{}/{}", args.pod_namespace, args.pod_name),
        node = %args.node,
        "bind delegated to default path"
    );
    Json(ExtenderBindingResult { error: None }).into_response()
}

/// Preemption choices are not altered; the proposed victims are
/// returned unmodified.
async fn preempt(
    State(state): State<Arc<ExtenderState>>,
    headers: HeaderMap,
    body: Result<Json<ExtenderPreemptionArgs>, JsonRejection>,
) -> Response {
    state.metrics.inc_extender_requests();
    let correlation_id = correlation_id(&headers);
    let Json(args) = match body {
        Ok(body) => body,
        Err(e) => return error_response(e.to_string()),
    };
    info!(
        correlation_id = %correlation_id,
        nodes = args.node_name_to_meta_victims.len(),
        "preempt passed through"
    );
    Json(ExtenderPreemptionResult {
        node_name_to_meta_victims: args.node_name_to_meta_victims,
    })
    .into_response()
}

fn handle_panic(_: Box<dyn std::any::Any + Send>) -> Response {
    error_response("extender handler panicked".to_string())
}

/// Create the extender router
pub fn create_router(state: Arc<ExtenderState>) -> Router {
    Router::new()
        .route("/filter", post(filter))
        .route("/prioritize", post(prioritize))
        .route("/bind", post(bind))
        .route("/preempt", post(preempt))
        .layer(CatchPanicLayer::custom(handle_panic))
        .with_state(state)
}

/// Start the extender server
pub async fn serve(port: u16, state: Arc<ExtenderState>) -> anyhow::Result<()> {
    let app = create_router(state);

    let addr = format!("0.0.0.0:{}", port);
    info!(addr = %addr, "Starting scheduler-extender server");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
