//! Shared plan state between orchestrator, evictor and extender
//!
//! Both the migration plan and the per-workload plan map are replaced
//! wholesale at well-defined transition points (end of calculation,
//! start of migration), never mutated in place, so readers always see
//! a complete snapshot.

use crate::models::{MigrationPlan, WorkloadId, WorkloadPlanSet};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Snapshot store for the latest plan and workload plan sets
#[derive(Default)]
pub struct PlanStore {
    plan: RwLock<Option<Arc<MigrationPlan>>>,
    workload_plans: RwLock<Arc<HashMap<WorkloadId, WorkloadPlanSet>>>,
}

impl PlanStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a freshly calculated plan, superseding the previous one
    pub async fn replace_plan(&self, plan: MigrationPlan) {
        let mut slot = self.plan.write().await;
        *slot = Some(Arc::new(plan));
    }

    pub async fn current_plan(&self) -> Option<Arc<MigrationPlan>> {
        self.plan.read().await.clone()
    }

    /// Install the workload plan map derived at the start of a
    /// migration run
    pub async fn replace_workload_plans(&self, plans: HashMap<WorkloadId, WorkloadPlanSet>) {
        let mut slot = self.workload_plans.write().await;
        *slot = Arc::new(plans);
    }

    pub async fn workload_plan(&self, workload: &WorkloadId) -> Option<WorkloadPlanSet> {
        self.workload_plans.read().await.get(workload).cloned()
    }

    pub async fn workload_plan_count(&self) -> usize {
        self.workload_plans.read().await.len()
    }
}
