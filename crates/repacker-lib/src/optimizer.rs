//! Optimizer client for the calculation pipeline
//!
//! The placement optimization itself is a remote black box. This
//! module owns the wire contract: building the request from a cluster
//! snapshot, submitting it over HTTP, and validating and unwrapping
//! the ranked plans in the response. A local calculator exists as a
//! pluggable fallback but is an explicit stub today; remote operation
//! is a hard dependency.

use crate::codec::compress_payload;
use crate::models::{MigrationPlan, PlanEntry, PodId};
use crate::policy::DeschedulePolicy;
use crate::snapshot::{ClusterSnapshot, ScopeRule};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Errors from one calculation cycle
#[derive(Debug, Error)]
pub enum CalculateError {
    #[error("optimizer request failed: {0}")]
    Request(String),
    #[error("optimizer response rejected: {0}")]
    Validation(String),
    #[error("local optimization is not implemented")]
    LocalUnimplemented,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Configuration for the remote optimizer client
#[derive(Debug, Clone)]
pub struct OptimizerConfig {
    pub endpoint: String,
    pub app_id: String,
    pub token: String,
    pub request_timeout: Duration,
    pub iteration_limit: u32,
    pub population_size: u32,
    pub migration_cost_limit: u32,
    pub migration_waterline: f64,
    pub migration_degree: u32,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://repack-optimizer:9090/optimize".to_string(),
            app_id: "repacker".to_string(),
            token: String::new(),
            request_timeout: Duration::from_secs(60),
            iteration_limit: 1000,
            population_size: 64,
            migration_cost_limit: 100,
            migration_waterline: 0.8,
            migration_degree: 2,
        }
    }
}

// ── Request wire types ──────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizeRequest {
    pub app_id: String,
    pub token: String,
    pub data: RequestData,
    pub config: RequestConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestData {
    pub inputs: Vec<RequestInput>,
}

/// One compressed cluster snapshot in the request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestInput {
    /// gzip+base64 JSON pod array
    pub pod: String,
    /// gzip+base64 JSON node array
    pub node: String,
    pub time: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestConfig {
    pub predict_args: PredictArgs,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictArgs {
    pub scope: Vec<ScopeRule>,
    pub optimize_target: Vec<String>,
    pub iteration_limit: u32,
    pub population_size: u32,
    pub migration_cost_limit: u32,
    pub migration_waterline: f64,
    pub migration_degree: u32,
    pub is_compressed: bool,
}

// ── Response wire types ─────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct OptimizeResponse {
    pub result: bool,
    pub data: Option<ResponseOuter>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResponseOuter {
    #[serde(default)]
    pub result: bool,
    pub data: Option<ResponseInner>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResponseInner {
    pub status: String,
    #[serde(default)]
    pub data: Vec<ResultEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResultEntry {
    #[serde(default)]
    pub output: Vec<OutputEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OutputEntry {
    pub timestamp: i64,
    pub plan: PlanPayload,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PlanPayload {
    pub plan_count: u32,
    #[serde(default)]
    pub plans: Vec<RankedPlan>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RankedPlan {
    #[serde(default)]
    pub plan_tags: Vec<String>,
    #[serde(default)]
    pub migrate_plan: Vec<WirePlanEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WirePlanEntry {
    pub item: String,
    pub from: String,
    pub to: String,
    pub priority: i32,
}

/// Build the outbound request for one snapshot
pub fn build_request(
    snapshot: &ClusterSnapshot,
    policy: &DeschedulePolicy,
    config: &OptimizerConfig,
) -> Result<OptimizeRequest, CalculateError> {
    let pod = compress_payload(&snapshot.pods)?;
    let node = compress_payload(&snapshot.nodes)?;
    let mut optimize_target = vec!["node".to_string()];
    if policy.converge.profit_target.cpu > 0 {
        optimize_target.push("cpu".to_string());
    }
    if policy.converge.profit_target.mem > 0 {
        optimize_target.push("mem".to_string());
    }
    Ok(OptimizeRequest {
        app_id: config.app_id.clone(),
        token: config.token.clone(),
        data: RequestData {
            inputs: vec![RequestInput {
                pod,
                node,
                time: snapshot.taken_at,
            }],
        },
        config: RequestConfig {
            predict_args: PredictArgs {
                scope: snapshot.scope.clone(),
                optimize_target,
                iteration_limit: config.iteration_limit,
                population_size: config.population_size,
                migration_cost_limit: config.migration_cost_limit,
                migration_waterline: policy
                    .converge
                    .high_water_level
                    .min(config.migration_waterline),
                migration_degree: config.migration_degree,
                is_compressed: true,
            },
        },
    })
}

/// Validate a response and unwrap it into a migration plan
///
/// Any violation is a hard failure for the cycle, never a partial
/// success. The ranked plan list is preserved on the wire; the first
/// plan is the default selection strategy.
pub fn select_plan(response: &OptimizeResponse) -> Result<MigrationPlan, CalculateError> {
    if !response.result {
        return Err(CalculateError::Validation("result flag is false".into()));
    }
    let outer = response
        .data
        .as_ref()
        .ok_or_else(|| CalculateError::Validation("missing response data".into()))?;
    let inner = outer
        .data
        .as_ref()
        .ok_or_else(|| CalculateError::Validation("missing nested data".into()))?;
    if inner.status != "success" {
        return Err(CalculateError::Validation(format!(
            "status is {:?}, expected \"success\"",
            inner.status
        )));
    }
    let entry = inner
        .data
        .first()
        .ok_or_else(|| CalculateError::Validation("no result entries".into()))?;
    let output = entry
        .output
        .first()
        .ok_or_else(|| CalculateError::Validation("no outputs".into()))?;
    let ranked = output
        .plan
        .plans
        .first()
        .ok_or_else(|| CalculateError::Validation("no plans returned".into()))?;
    if ranked.migrate_plan.is_empty() {
        return Err(CalculateError::Validation("migrate plan is empty".into()));
    }

    let mut entries = Vec::with_capacity(ranked.migrate_plan.len());
    for wire in &ranked.migrate_plan {
        let item = PodId::parse(&wire.item).ok_or_else(|| {
            CalculateError::Validation(format!("bad pod identity {:?}", wire.item))
        })?;
        entries.push(PlanEntry {
            item,
            from: wire.from.clone(),
            to: wire.to.clone(),
            priority: wire.priority,
        });
    }
    Ok(MigrationPlan {
        computed_at: output.timestamp,
        entries,
    })
}

/// Strategy seam for plan computation
#[async_trait]
pub trait Calculator: Send + Sync {
    async fn calculate(
        &self,
        request: &OptimizeRequest,
    ) -> Result<MigrationPlan, CalculateError>;
}

/// HTTP client for the remote optimizer
pub struct RemoteOptimizer {
    client: reqwest::Client,
    config: OptimizerConfig,
}

impl RemoteOptimizer {
    pub fn new(config: OptimizerConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .unwrap_or_default();
        Self { client, config }
    }
}

#[async_trait]
impl Calculator for RemoteOptimizer {
    async fn calculate(
        &self,
        request: &OptimizeRequest,
    ) -> Result<MigrationPlan, CalculateError> {
        debug!(endpoint = %self.config.endpoint, "submitting optimization request");
        let response = self
            .client
            .post(&self.config.endpoint)
            .json(request)
            .send()
            .await
            .map_err(|e| CalculateError::Request(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(CalculateError::Request(format!(
                "optimizer returned {status}"
            )));
        }
        let body: OptimizeResponse = response
            .json()
            .await
            .map_err(|e| CalculateError::Request(format!("malformed response body: {e}")))?;
        select_plan(&body)
    }
}

/// Local calculator stub
///
/// Local-only operation is unsupported today; this exists so a real
/// implementation can slot in behind [`Calculator`] without touching
/// callers.
#[derive(Debug, Default)]
pub struct LocalOptimizer;

#[async_trait]
impl Calculator for LocalOptimizer {
    async fn calculate(
        &self,
        _request: &OptimizeRequest,
    ) -> Result<MigrationPlan, CalculateError> {
        Err(CalculateError::LocalUnimplemented)
    }
}

/// Tries the primary calculator, falling back on any error
pub struct FallbackCalculator {
    primary: Arc<dyn Calculator>,
    fallback: Arc<dyn Calculator>,
}

impl FallbackCalculator {
    pub fn new(primary: Arc<dyn Calculator>, fallback: Arc<dyn Calculator>) -> Self {
        Self { primary, fallback }
    }
}

#[async_trait]
impl Calculator for FallbackCalculator {
    async fn calculate(
        &self,
        request: &OptimizeRequest,
    ) -> Result<MigrationPlan, CalculateError> {
        match self.primary.calculate(request).await {
            Ok(plan) => Ok(plan),
            Err(e) => {
                warn!(error = %e, "remote optimizer failed, trying local calculator");
                self.fallback.calculate(request).await
            }
        }
    }
}
