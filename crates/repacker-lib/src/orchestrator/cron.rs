//! Cron job instances and run-state flags
//!
//! One [`CronJobInstance`] exists per installed policy schedule. When
//! the policy's time range changes the old instance is stopped
//! asynchronously and the new one holds `prev_job_stopped=false` until
//! the old fire loop confirms it has fully exited, so two overlapping
//! schedules can never both trigger migrations.

use chrono::Utc;
use cron::Schedule;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Completion flags for one schedule generation
///
/// All run-state booleans live here behind atomic transitions instead
/// of being scattered across tasks.
#[derive(Debug)]
pub struct JobFlags {
    prev_job_stopped: AtomicBool,
    stopped: AtomicBool,
}

impl JobFlags {
    pub fn new(prev_job_stopped: bool) -> Self {
        Self {
            prev_job_stopped: AtomicBool::new(prev_job_stopped),
            stopped: AtomicBool::new(false),
        }
    }

    /// True once the superseded schedule's fire loop has fully exited
    pub fn prev_job_stopped(&self) -> bool {
        self.prev_job_stopped.load(Ordering::SeqCst)
    }

    pub fn set_prev_job_stopped(&self) {
        self.prev_job_stopped.store(true, Ordering::SeqCst);
    }

    /// True once this instance has been told to stop
    pub fn stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub fn set_stopped(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    /// Migration may only proceed in the fully-active state
    pub fn can_migrate(&self) -> bool {
        self.prev_job_stopped() && !self.stopped()
    }
}

/// A running cron fire loop for one policy schedule
pub struct CronJobInstance {
    time_range: String,
    flags: Arc<JobFlags>,
    stop_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl CronJobInstance {
    /// Spawn the fire loop for a parsed schedule
    ///
    /// Fires are delivered through `fire_tx` with `try_send`, so a
    /// fire that arrives while the previous one is still being
    /// processed is coalesced rather than queued.
    pub fn start(
        time_range: String,
        schedule: Schedule,
        flags: Arc<JobFlags>,
        fire_tx: mpsc::Sender<()>,
    ) -> Self {
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let range = time_range.clone();
        let handle = tokio::spawn(async move {
            info!(time_range = %range, "cron fire loop started");
            loop {
                let Some(next) = schedule.upcoming(Utc).next() else {
                    break;
                };
                let wait = (next - Utc::now())
                    .to_std()
                    .unwrap_or(Duration::from_millis(0));
                tokio::select! {
                    _ = tokio::time::sleep(wait) => {
                        if fire_tx.try_send(()).is_err() {
                            debug!(time_range = %range, "cron fire coalesced");
                        }
                    }
                    changed = stop_rx.changed() => {
                        if changed.is_err() || *stop_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            info!(time_range = %range, "cron fire loop exited");
        });
        Self {
            time_range,
            flags,
            stop_tx,
            handle,
        }
    }

    pub fn time_range(&self) -> &str {
        &self.time_range
    }

    pub fn flags(&self) -> Arc<JobFlags> {
        Arc::clone(&self.flags)
    }

    /// Signal the fire loop and wait for it to fully exit
    pub async fn stop(self) {
        let _ = self.stop_tx.send(true);
        let _ = self.handle.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::parse_time_range;

    #[test]
    fn flags_gate_migration_on_both_conditions() {
        let active = JobFlags::new(true);
        assert!(active.can_migrate());

        let pending = JobFlags::new(false);
        assert!(!pending.can_migrate());
        pending.set_prev_job_stopped();
        assert!(pending.can_migrate());

        pending.set_stopped();
        assert!(!pending.can_migrate());
    }

    #[tokio::test]
    async fn fire_loop_fires_on_schedule() {
        // Every-second schedule so the test observes a fire quickly.
        let schedule = parse_time_range("* * * * * * *").unwrap();
        let (fire_tx, mut fire_rx) = mpsc::channel(1);
        let flags = Arc::new(JobFlags::new(true));
        let job = CronJobInstance::start("* * * * * * *".into(), schedule, flags, fire_tx);

        let fired = tokio::time::timeout(Duration::from_secs(3), fire_rx.recv()).await;
        assert!(fired.is_ok());

        job.stop().await;
    }

    #[tokio::test]
    async fn stop_returns_after_loop_exit() {
        let schedule = parse_time_range("*/5 * * * *").unwrap();
        let (fire_tx, _fire_rx) = mpsc::channel(1);
        let flags = Arc::new(JobFlags::new(true));
        let job = CronJobInstance::start("*/5 * * * *".into(), schedule, Arc::clone(&flags), fire_tx);

        tokio::time::timeout(Duration::from_secs(1), job.stop())
            .await
            .expect("stop should complete promptly");
    }
}
