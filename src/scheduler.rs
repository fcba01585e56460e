use std::{fmt, sync::Arc, time::Duration};

use serde::Serialize;
use tokio::{
    sync::Mutex,
    time::{interval_at, sleep, Instant, MissedTickBehavior},
};
use tracing::{error, info, warn};

use crate::{
    config::SyncConfig,
    orchestrator::{CleanupReport, Orchestrator, ReconcileReport},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Reconcile,
    Cleanup,
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobKind::Reconcile => f.write_str("reconcile"),
            JobKind::Cleanup => f.write_str("cleanup"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum JobRun {
    Reconciled { report: ReconcileReport },
    Cleaned { report: CleanupReport },
    Skipped { reason: String },
    Failed { error: String },
}

/// Periodic reconciliation and retention cleanup.
///
/// A job never overlaps with itself; a trigger that arrives while the same job
/// is running is skipped.
pub struct Scheduler {
    orchestrator: Arc<Orchestrator>,
    reconcile_guard: Mutex<()>,
    cleanup_guard: Mutex<()>,
    sync_interval: Duration,
    cleanup_interval: Duration,
    initial_delay: Duration,
}

impl Scheduler {
    pub fn new(orchestrator: Arc<Orchestrator>, config: &SyncConfig) -> Arc<Self> {
        Arc::new(Self {
            orchestrator,
            reconcile_guard: Mutex::new(()),
            cleanup_guard: Mutex::new(()),
            sync_interval: config.sync_interval,
            cleanup_interval: config.cleanup_interval,
            initial_delay: config.initial_sync_delay,
        })
    }

    /// Runs one job now. Errors and panics inside the job become
    /// [`JobRun::Failed`].
    pub async fn trigger(&self, kind: JobKind) -> JobRun {
        let guard = match kind {
            JobKind::Reconcile => &self.reconcile_guard,
            JobKind::Cleanup => &self.cleanup_guard,
        };
        let Ok(_running) = guard.try_lock() else {
            info!(job = %kind, "job already running; trigger skipped");
            return JobRun::Skipped {
                reason: format!("{kind} already running"),
            };
        };

        let orchestrator = self.orchestrator.clone();
        let handle = tokio::spawn(async move {
            match kind {
                JobKind::Reconcile => orchestrator
                    .reconciliation_pass()
                    .await
                    .map(|report| JobRun::Reconciled { report }),
                JobKind::Cleanup => orchestrator
                    .retention_cleanup()
                    .await
                    .map(|report| JobRun::Cleaned { report }),
            }
        });

        match handle.await {
            Ok(Ok(run)) => run,
            Ok(Err(err)) => {
                error!(job = %kind, error = %err, "scheduled job failed");
                JobRun::Failed {
                    error: err.to_string(),
                }
            }
            Err(join_err) => {
                error!(job = %kind, error = %join_err, "scheduled job panicked");
                JobRun::Failed {
                    error: format!("job aborted: {join_err}"),
                }
            }
        }
    }

    /// Drives both jobs until the task is dropped.
    pub async fn run(self: Arc<Self>) {
        info!(
            sync_interval_secs = self.sync_interval.as_secs(),
            cleanup_interval_secs = self.cleanup_interval.as_secs(),
            initial_delay_secs = self.initial_delay.as_secs(),
            "scheduler started"
        );
        tokio::join!(self.clone().reconcile_loop(), self.clone().cleanup_loop());
    }

    async fn reconcile_loop(self: Arc<Self>) {
        sleep(self.initial_delay).await;
        self.trigger(JobKind::Reconcile).await;

        let mut ticker = interval_at(Instant::now() + self.sync_interval, self.sync_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            if let JobRun::Skipped { reason } = self.trigger(JobKind::Reconcile).await {
                warn!(%reason, "scheduled reconciliation skipped");
            }
        }
    }

    async fn cleanup_loop(self: Arc<Self>) {
        let mut ticker = interval_at(
            Instant::now() + self.cleanup_interval,
            self.cleanup_interval,
        );
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            if let JobRun::Skipped { reason } = self.trigger(JobKind::Cleanup).await {
                warn!(%reason, "scheduled cleanup skipped");
            }
        }
    }
}
