//! Migration orchestrator
//!
//! Translates policy changes into a cron schedule, guarantees that at
//! most one migration run proceeds at a time, keeps calculation and
//! migration mutually exclusive, and coalesces redundant calculation
//! requests through a single-slot queue.

mod cron;

pub use cron::{CronJobInstance, JobFlags};

use crate::audit::AuditWriter;
use crate::cluster::ClusterState;
use crate::evict::EvictionEngine;
use crate::models::{MigrationPlan, NodeEvictionBatch, PlanEntry, WorkloadId, WorkloadPlanSet};
use crate::observability::{RepackerMetrics, StructuredLogger};
use crate::optimizer::{build_request, Calculator, CalculateError, OptimizerConfig};
use crate::policy::{parse_time_range, DeschedulePolicy};
use crate::snapshot::take_snapshot;
use crate::store::PlanStore;
use anyhow::Result;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch, Mutex, RwLock};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Deadlines and cadence for the orchestrator loops
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Upper bound on one calculation cycle
    pub calculation_deadline: Duration,
    /// Upper bound on one migration run
    pub migration_deadline: Duration,
    /// Recurring cadence re-triggering the calculation merge logic
    pub calculation_interval: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            calculation_deadline: Duration::from_secs(120),
            migration_deadline: Duration::from_secs(1800),
            calculation_interval: Duration::from_secs(300),
        }
    }
}

/// Clears the shared migrating flag when a run ends, on every path
struct MigratingGuard<'a> {
    flag: &'a AtomicBool,
}

impl Drop for MigratingGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

/// Owns policy scheduling, plan state transitions and migration runs
pub struct Orchestrator {
    cluster: Arc<dyn ClusterState>,
    calculator: Arc<dyn Calculator>,
    engine: Arc<EvictionEngine>,
    store: Arc<PlanStore>,
    audit: AuditWriter,
    optimizer_config: OptimizerConfig,
    config: OrchestratorConfig,

    migrating: AtomicBool,
    job: Mutex<Option<CronJobInstance>>,
    job_flags: RwLock<Option<Arc<JobFlags>>>,
    policy: RwLock<Option<DeschedulePolicy>>,

    fire_tx: mpsc::Sender<()>,
    fire_rx: Mutex<Option<mpsc::Receiver<()>>>,
    calc_tx: mpsc::Sender<DeschedulePolicy>,
    calc_rx: Mutex<Option<mpsc::Receiver<DeschedulePolicy>>>,

    shutdown: broadcast::Sender<()>,
    metrics: RepackerMetrics,
    logger: StructuredLogger,
}

impl Orchestrator {
    pub fn new(
        cluster: Arc<dyn ClusterState>,
        calculator: Arc<dyn Calculator>,
        engine: Arc<EvictionEngine>,
        store: Arc<PlanStore>,
        audit: AuditWriter,
        optimizer_config: OptimizerConfig,
        config: OrchestratorConfig,
        shutdown: broadcast::Sender<()>,
        logger: StructuredLogger,
    ) -> Self {
        let (fire_tx, fire_rx) = mpsc::channel(1);
        // Single-slot queue: a request arriving while one is already
        // pending is dropped, not enqueued.
        let (calc_tx, calc_rx) = mpsc::channel(1);
        Self {
            cluster,
            calculator,
            engine,
            store,
            audit,
            optimizer_config,
            config,
            migrating: AtomicBool::new(false),
            job: Mutex::new(None),
            job_flags: RwLock::new(None),
            policy: RwLock::new(None),
            fire_tx,
            fire_rx: Mutex::new(Some(fire_rx)),
            calc_tx,
            calc_rx: Mutex::new(Some(calc_rx)),
            shutdown,
            metrics: RepackerMetrics::new(),
            logger,
        }
    }

    pub fn plan_store(&self) -> Arc<PlanStore> {
        Arc::clone(&self.store)
    }

    /// Install or refresh the cron job for a policy
    pub async fn create_or_update_job(&self, policy: &DeschedulePolicy) -> Result<()> {
        if policy.converge.disabled {
            info!(policy = %policy.name, "policy disabled, removing schedule");
            self.delete_job().await;
            return Ok(());
        }
        let schedule = parse_time_range(&policy.converge.time_range)?;

        let mut job = self.job.lock().await;
        match job.as_ref() {
            Some(existing) if existing.time_range() == policy.converge.time_range => {
                debug!(time_range = %policy.converge.time_range, "schedule unchanged");
            }
            Some(_) => {
                // Hold prev_job_stopped=false until the superseded
                // fire loop confirms exit; migrations stay blocked in
                // the interim.
                let flags = Arc::new(JobFlags::new(false));
                let next = CronJobInstance::start(
                    policy.converge.time_range.clone(),
                    schedule,
                    Arc::clone(&flags),
                    self.fire_tx.clone(),
                );
                let previous = job.replace(next);
                *self.job_flags.write().await = Some(Arc::clone(&flags));
                if let Some(previous) = previous {
                    tokio::spawn(async move {
                        previous.stop().await;
                        flags.set_prev_job_stopped();
                    });
                }
                info!(time_range = %policy.converge.time_range, "schedule replaced");
            }
            None => {
                let flags = Arc::new(JobFlags::new(true));
                let instance = CronJobInstance::start(
                    policy.converge.time_range.clone(),
                    schedule,
                    Arc::clone(&flags),
                    self.fire_tx.clone(),
                );
                *job = Some(instance);
                *self.job_flags.write().await = Some(flags);
                info!(time_range = %policy.converge.time_range, "schedule installed");
            }
        }
        drop(job);

        *self.policy.write().await = Some(policy.clone());
        Ok(())
    }

    /// Stop the cron entry for a deleted policy
    pub async fn delete_job(&self) {
        let previous = self.job.lock().await.take();
        if let Some(previous) = previous {
            let flags = previous.flags();
            previous.stop().await;
            flags.set_stopped();
            info!("schedule removed");
        }
    }

    /// Request a calculation, merged into the single pending slot
    pub fn request_calculation(&self, policy: &DeschedulePolicy) {
        if self.calc_tx.try_send(policy.clone()).is_err() {
            debug!("calculation already pending, request dropped");
        }
    }

    /// Run one calculation cycle
    ///
    /// Returns whether a new plan was installed. Refuses to run while
    /// a migration is mutating the cluster; that refusal is a skipped
    /// cycle, not an error.
    pub async fn calculate(&self, policy: &DeschedulePolicy) -> Result<bool> {
        if self.migrating.load(Ordering::SeqCst) {
            self.logger.log_calculation_skipped("migration in progress");
            self.metrics.inc_calculation_errors();
            return Ok(false);
        }
        let started = Instant::now();
        let outcome = tokio::time::timeout(
            self.config.calculation_deadline,
            self.run_calculation(policy),
        )
        .await;
        self.metrics
            .observe_calculation_latency(started.elapsed().as_secs_f64());

        let plan = match outcome {
            Ok(Ok(plan)) => plan,
            Ok(Err(e)) => {
                self.logger.log_calculation_skipped(&e.to_string());
                self.metrics.inc_calculation_errors();
                return Ok(false);
            }
            Err(_) => {
                self.logger.log_calculation_skipped("calculation deadline exceeded");
                self.metrics.inc_calculation_errors();
                return Ok(false);
            }
        };

        if let Err(e) = self.audit.record(&plan) {
            warn!(error = %e, "failed to write plan audit artifact");
        }
        self.metrics.inc_plans_computed();
        self.metrics.set_plan_entries(plan.entries.len() as i64);
        self.logger
            .log_plan_computed(plan.entries.len(), plan.computed_at);
        self.store.replace_plan(plan).await;
        Ok(true)
    }

    async fn run_calculation(
        &self,
        policy: &DeschedulePolicy,
    ) -> Result<MigrationPlan, CalculateError> {
        let snapshot = take_snapshot(self.cluster.as_ref())
            .await
            .map_err(CalculateError::Other)?;
        let request = build_request(&snapshot, policy, &self.optimizer_config)?;
        self.calculator.calculate(&request).await
    }

    /// Run one migration cycle against the stored plan
    ///
    /// A no-op (returns false, no side effects) unless the current
    /// job's flags allow it and no other run is in progress.
    pub async fn migrate(&self) -> bool {
        let flags = self.job_flags.read().await.clone();
        let Some(flags) = flags else {
            return false;
        };
        if !flags.can_migrate() {
            debug!("migration skipped, schedule transition in progress or stopped");
            return false;
        }
        let Some(guard) = self.begin_migration() else {
            debug!("migration already running");
            return false;
        };
        let _guard = guard;

        let Some(plan) = self.store.current_plan().await else {
            debug!("no migration plan available");
            return false;
        };
        let trace_id = format!("run-{}", chrono::Utc::now().timestamp_millis());
        let (workload_plans, batches) = self.derive_workload_plans(&plan, &trace_id).await;
        self.store.replace_workload_plans(workload_plans).await;
        if batches.is_empty() {
            debug!("migration plan has no executable entries");
            return false;
        }
        let entries: usize = batches.iter().map(|b| b.entries.len()).sum();
        self.logger
            .log_migration_run(&trace_id, batches.len(), entries);
        self.metrics.inc_migration_runs();

        // The whole run is bounded by the migration deadline and by
        // process shutdown; the engine treats the raised signal as
        // cancellation, not failure. The cancel channel is
        // level-triggered, so batches still queued when it fires
        // observe it whenever they are dequeued.
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let deadline = self.config.migration_deadline;
        let mut shutdown_rx = self.shutdown.subscribe();
        let timer = tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(deadline) => {
                    warn!("migration deadline exceeded, cancelling run");
                }
                _ = shutdown_rx.recv() => {
                    info!("shutdown requested, cancelling migration run");
                }
            }
            let _ = cancel_tx.send(true);
        });
        self.engine.execute(batches, cancel_rx).await;
        timer.abort();
        true
    }

    fn begin_migration(&self) -> Option<MigratingGuard<'_>> {
        self.migrating
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()?;
        Some(MigratingGuard {
            flag: &self.migrating,
        })
    }

    /// Group plan entries by workload and by source node
    ///
    /// Entries are dropped when the pod no longer resolves, lacks an
    /// owner reference (ownerless pods must never be evicted), or has
    /// moved off the plan's recorded source node (stale plan). The
    /// surviving set is then clamped to the policy's batch bounds:
    /// below `min_pods` the whole run is skipped, above `max_pods`
    /// only the highest-priority entries are kept.
    async fn derive_workload_plans(
        &self,
        plan: &MigrationPlan,
        trace_id: &str,
    ) -> (HashMap<WorkloadId, WorkloadPlanSet>, Vec<NodeEvictionBatch>) {
        let mut keep: Vec<(WorkloadId, PlanEntry)> = Vec::new();

        for entry in &plan.entries {
            let pod = match self.cluster.get_pod(&entry.item).await {
                Ok(pod) => pod,
                Err(e) => {
                    warn!(pod = %entry.item, error = %e, "plan entry skipped, pod lookup failed");
                    continue;
                }
            };
            let Some(owner) = pod.owner.as_ref() else {
                warn!(pod = %entry.item, "plan entry skipped, pod has no owner reference");
                continue;
            };
            if pod.node_name != entry.from {
                warn!(
                    pod = %entry.item,
                    planned_from = %entry.from,
                    actual = %pod.node_name,
                    "plan entry skipped, stale source node"
                );
                continue;
            }
            keep.push((owner.workload_id(&entry.item.namespace), entry.clone()));
        }

        if let Some(policy) = self.policy.read().await.as_ref() {
            let min = policy.converge.min_pods as usize;
            let max = policy.converge.max_pods as usize;
            if !keep.is_empty() && keep.len() < min {
                info!(
                    trace_id = %trace_id,
                    entries = keep.len(),
                    min_pods = min,
                    "plan below the minimum batch size, run skipped"
                );
                keep.clear();
            } else if keep.len() > max {
                info!(
                    trace_id = %trace_id,
                    entries = keep.len(),
                    max_pods = max,
                    "plan clamped to the maximum batch size"
                );
                keep.sort_by(|(_, a), (_, b)| b.priority.cmp(&a.priority));
                keep.truncate(max);
            }
        }

        let mut by_workload: HashMap<WorkloadId, WorkloadPlanSet> = HashMap::new();
        let mut by_node: HashMap<String, Vec<PlanEntry>> = HashMap::new();
        for (workload, entry) in keep {
            by_workload
                .entry(workload.clone())
                .or_insert_with(|| WorkloadPlanSet {
                    workload,
                    entries: Vec::new(),
                })
                .entries
                .push(entry.clone());
            by_node.entry(entry.from.clone()).or_default().push(entry);
        }

        let batches = by_node
            .into_iter()
            .map(|(node, entries)| NodeEvictionBatch {
                trace_id: trace_id.to_string(),
                node,
                entries,
            })
            .collect();
        (by_workload, batches)
    }

    /// Drive the orchestrator loops until shutdown
    ///
    /// Calculation and migration both run on this single worker, so a
    /// queued calculation can never overlap a migration run.
    pub async fn run(self: Arc<Self>) {
        let mut shutdown = self.shutdown.subscribe();
        let mut fire_rx = self
            .fire_rx
            .lock()
            .await
            .take()
            .expect("orchestrator run started twice");
        let mut calc_rx = self
            .calc_rx
            .lock()
            .await
            .take()
            .expect("orchestrator run started twice");
        let mut cadence = tokio::time::interval(self.config.calculation_interval);

        info!("orchestrator worker started");
        loop {
            tokio::select! {
                _ = cadence.tick() => {
                    let policy = self.policy.read().await.clone();
                    if let Some(policy) = policy {
                        if !policy.converge.disabled {
                            self.request_calculation(&policy);
                        }
                    }
                }
                Some(policy) = calc_rx.recv() => {
                    if let Err(e) = self.calculate(&policy).await {
                        warn!(error = %e, "calculation cycle failed");
                    }
                }
                Some(()) = fire_rx.recv() => {
                    let policy = self.policy.read().await.clone();
                    if let Some(policy) = policy {
                        self.request_calculation(&policy);
                    }
                    self.migrate().await;
                }
                _ = shutdown.recv() => {
                    info!("orchestrator worker shutting down");
                    break;
                }
            }
        }
    }
}
