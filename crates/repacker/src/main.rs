//! Repacker - cluster workload consolidation daemon
//!
//! Runs the policy-driven migration control loop, the scheduler
//! extender and the health/metrics API in one process.

use anyhow::{anyhow, Result};
use repacker_lib::{
    audit::AuditWriter,
    cluster::ClusterState,
    evict::{EvictionConfig, EvictionEngine},
    extender::{self, ExtenderState},
    health::{components, HealthRegistry},
    observability::{RepackerMetrics, StructuredLogger},
    optimizer::{Calculator, FallbackCalculator, LocalOptimizer, OptimizerConfig, RemoteOptimizer},
    orchestrator::{Orchestrator, OrchestratorConfig},
    policy::{
        validate_policy, ConvergeSpec, DeschedulePolicy, ProfitTarget, POLICY_NAME,
        POLICY_NAMESPACE, POLICY_TYPE_CONVERGE,
    },
    store::PlanStore,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod api;
mod cluster;
mod config;

const REPACKER_VERSION: &str = env!("CARGO_PKG_VERSION");

fn policy_from_config(config: &config::RepackerConfig) -> DeschedulePolicy {
    DeschedulePolicy {
        name: POLICY_NAME.to_string(),
        namespace: POLICY_NAMESPACE.to_string(),
        policy_type: POLICY_TYPE_CONVERGE.to_string(),
        converge: ConvergeSpec {
            disabled: false,
            time_range: config.time_range.clone(),
            profit_target: ProfitTarget::default(),
            min_pods: 1,
            max_pods: 50,
            low_water_level: 0.3,
            high_water_level: 0.8,
        },
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and env filter
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    info!("Starting repacker");

    // Load configuration
    let config = config::RepackerConfig::load()?;
    info!(cluster = %config.cluster_name, "Repacker configured");

    // Initialize health registry
    let health_registry = HealthRegistry::new();
    health_registry.register(components::CLUSTER).await;
    health_registry.register(components::ORCHESTRATOR).await;
    health_registry.register(components::CALCULATOR).await;
    health_registry.register(components::EVICTOR).await;
    health_registry.register(components::EXTENDER).await;

    // Initialize metrics
    let metrics = RepackerMetrics::new();

    // Initialize structured logger
    let logger = StructuredLogger::new(&config.cluster_name);
    logger.log_startup(REPACKER_VERSION);

    // Cluster client; a failure here aborts startup
    let cluster =
        cluster::ApiServerCluster::new(&config.kube_api_url, &config.kube_api_token)?;
    tokio::time::timeout(
        Duration::from_secs(config.cache_sync_timeout_secs),
        cluster.wait_for_sync(),
    )
    .await
    .map_err(|_| {
        anyhow!(
            "cluster state sync did not complete within {}s",
            config.cache_sync_timeout_secs
        )
    })??;
    info!("Cluster state synced");

    // Calculation pipeline: remote optimizer with the local fallback
    let optimizer_config = OptimizerConfig {
        endpoint: config.optimizer_endpoint.clone(),
        app_id: config.optimizer_app_id.clone(),
        token: config.optimizer_token.clone(),
        ..Default::default()
    };
    let remote: Arc<dyn Calculator> = Arc::new(RemoteOptimizer::new(optimizer_config.clone()));
    let local: Arc<dyn Calculator> = Arc::new(LocalOptimizer);
    let calculator: Arc<dyn Calculator> = Arc::new(FallbackCalculator::new(remote, local));

    // Eviction engine and plan store
    let store = Arc::new(PlanStore::new());
    let engine = Arc::new(EvictionEngine::new(
        Arc::clone(&cluster) as Arc<dyn ClusterState>,
        EvictionConfig {
            max_eviction_nodes: config.max_eviction_nodes,
            max_eviction_parallel: config.max_eviction_parallel,
            retry_interval: Duration::from_secs(config.eviction_retry_interval_secs),
        },
    ));

    // Shutdown fan-out; the orchestrator subscribes for its worker
    // loop and to cancel an in-flight migration run.
    let (shutdown_tx, _) = broadcast::channel(4);

    // Orchestrator wiring
    let orchestrator = Arc::new(Orchestrator::new(
        Arc::clone(&cluster) as Arc<dyn ClusterState>,
        calculator,
        engine,
        Arc::clone(&store),
        AuditWriter::new(&config.audit_dir),
        optimizer_config,
        OrchestratorConfig {
            calculation_deadline: Duration::from_secs(config.calculation_deadline_secs),
            migration_deadline: Duration::from_secs(config.migration_deadline_secs),
            calculation_interval: Duration::from_secs(config.calculation_interval_secs),
        },
        shutdown_tx.clone(),
        logger.clone(),
    ));

    // Install the configured policy
    let policy = policy_from_config(&config);
    validate_policy(&policy)?;
    orchestrator.create_or_update_job(&policy).await?;

    let worker = tokio::spawn(Arc::clone(&orchestrator).run());

    // Scheduler-extender server
    let extender_state = Arc::new(ExtenderState::new(
        Arc::clone(&cluster) as Arc<dyn ClusterState>,
        Arc::clone(&store),
    ));
    let _extender_handle = tokio::spawn(extender::serve(config.extender_port, extender_state));

    // Health and metrics server
    let app_state = Arc::new(api::AppState::new(health_registry.clone(), metrics.clone()));
    let _api_handle = tokio::spawn(api::serve(config.api_port, app_state));

    // Mark the daemon ready once everything is wired
    health_registry.set_ready(true).await;

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    logger.log_shutdown("SIGINT received");
    let _ = shutdown_tx.send(());
    orchestrator.delete_job().await;
    let _ = worker.await;
    info!("Shutting down");

    Ok(())
}
