//! Repacker configuration

use anyhow::Result;
use serde::Deserialize;

/// Repacker daemon configuration
#[derive(Debug, Clone, Deserialize)]
pub struct RepackerConfig {
    /// Cluster name reported in structured logs
    #[serde(default = "default_cluster_name")]
    pub cluster_name: String,

    /// API server port for health/metrics
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    /// Scheduler-extender port
    #[serde(default = "default_extender_port")]
    pub extender_port: u16,

    /// Kubernetes API server base URL
    #[serde(default = "default_kube_api_url")]
    pub kube_api_url: String,

    /// Bearer token for the API server, empty for anonymous
    #[serde(default)]
    pub kube_api_token: String,

    /// Remote optimizer endpoint
    #[serde(default = "default_optimizer_endpoint")]
    pub optimizer_endpoint: String,

    /// Application id sent with optimizer requests
    #[serde(default)]
    pub optimizer_app_id: String,

    /// Authentication token sent with optimizer requests
    #[serde(default)]
    pub optimizer_token: String,

    /// Upper bound on one calculation cycle in seconds
    #[serde(default = "default_calculation_deadline")]
    pub calculation_deadline_secs: u64,

    /// Upper bound on one migration run in seconds
    #[serde(default = "default_migration_deadline")]
    pub migration_deadline_secs: u64,

    /// Recurring calculation cadence in seconds
    #[serde(default = "default_calculation_interval")]
    pub calculation_interval_secs: u64,

    /// Startup bound on the initial cluster state sync in seconds
    #[serde(default = "default_cache_sync_timeout")]
    pub cache_sync_timeout_secs: u64,

    /// Nodes drained in parallel per migration run
    #[serde(default = "default_max_eviction_nodes")]
    pub max_eviction_nodes: usize,

    /// Global in-flight pod eviction bound
    #[serde(default = "default_max_eviction_parallel")]
    pub max_eviction_parallel: usize,

    /// Disruption-budget retry interval in seconds
    #[serde(default = "default_eviction_retry_interval")]
    pub eviction_retry_interval_secs: u64,

    /// Directory receiving plan audit artifacts
    #[serde(default = "default_audit_dir")]
    pub audit_dir: String,

    /// Cron time range driving migration runs
    #[serde(default = "default_time_range")]
    pub time_range: String,
}

fn default_cluster_name() -> String {
    std::env::var("CLUSTER_NAME").unwrap_or_else(|_| "default".to_string())
}

fn default_api_port() -> u16 {
    8080
}

fn default_extender_port() -> u16 {
    8880
}

fn default_kube_api_url() -> String {
    "https://kubernetes.default.svc".to_string()
}

fn default_optimizer_endpoint() -> String {
    "http://repack-optimizer:9090/optimize".to_string()
}

fn default_calculation_deadline() -> u64 {
    120
}

fn default_migration_deadline() -> u64 {
    1800
}

fn default_calculation_interval() -> u64 {
    300
}

fn default_cache_sync_timeout() -> u64 {
    60
}

fn default_max_eviction_nodes() -> usize {
    3
}

fn default_max_eviction_parallel() -> usize {
    5
}

fn default_eviction_retry_interval() -> u64 {
    5
}

fn default_audit_dir() -> String {
    "/var/log/repacker/plans".to_string()
}

fn default_time_range() -> String {
    "0 2 * * *".to_string()
}

impl RepackerConfig {
    /// Load configuration from environment variables
    pub fn load() -> Result<Self> {
        let config = config::Config::builder()
            .add_source(config::Environment::with_prefix("REPACKER"))
            .build()?;

        Ok(config.try_deserialize().unwrap_or_else(|_| RepackerConfig {
            cluster_name: default_cluster_name(),
            api_port: default_api_port(),
            extender_port: default_extender_port(),
            kube_api_url: default_kube_api_url(),
            kube_api_token: String::new(),
            optimizer_endpoint: default_optimizer_endpoint(),
            optimizer_app_id: String::new(),
            optimizer_token: String::new(),
            calculation_deadline_secs: default_calculation_deadline(),
            migration_deadline_secs: default_migration_deadline(),
            calculation_interval_secs: default_calculation_interval(),
            cache_sync_timeout_secs: default_cache_sync_timeout(),
            max_eviction_nodes: default_max_eviction_nodes(),
            max_eviction_parallel: default_max_eviction_parallel(),
            eviction_retry_interval_secs: default_eviction_retry_interval(),
            audit_dir: default_audit_dir(),
            time_range: default_time_range(),
        }))
    }
}
