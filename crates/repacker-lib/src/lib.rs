//! Repacker library for cluster workload consolidation
//!
//! This crate provides the core functionality for:
//! - Policy-driven migration orchestration on a cron cadence
//! - Cluster snapshotting and remote plan calculation
//! - Plan-driven pod eviction with bounded concurrency
//! - The scheduler-extender protocol service
//! - Health checks and observability

pub mod audit;
pub mod cluster;
pub mod codec;
pub mod evict;
pub mod extender;
pub mod health;
pub mod models;
pub mod observability;
pub mod optimizer;
pub mod orchestrator;
pub mod policy;
pub mod snapshot;
pub mod store;

pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use models::*;
pub use observability::{RepackerMetrics, StructuredLogger};
