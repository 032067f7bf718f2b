use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};

use super::{BackupCoordinator, BackupOutcome, BackupTag};
use crate::config::MIN_INTERVAL;

/// Owns the startup timer and the recurring timer that drive a
/// [`BackupCoordinator`].
///
/// Overlapping ticks are not coalesced here; the coordinator rejects a run
/// while another is in flight.
pub struct BackupScheduler {
    coordinator: Arc<BackupCoordinator>,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl BackupScheduler {
    /// Start both timers. Must be called from within a tokio runtime.
    pub fn start(coordinator: Arc<BackupCoordinator>) -> Self {
        let (shutdown, _) = watch::channel(false);
        let config = coordinator.config();
        let startup_delay = config.startup_delay;
        // Clamped again: the field is public.
        let interval = config.interval.max(MIN_INTERVAL);

        tracing::info!(
            target: "ledgerbox",
            event = "backup_scheduler_started",
            interval_secs = interval.as_secs(),
            startup_delay_secs = startup_delay.as_secs()
        );

        let startup = {
            let coordinator = coordinator.clone();
            let mut cancelled = shutdown.subscribe();
            tokio::spawn(async move {
                tokio::select! {
                    biased;
                    _ = cancelled.changed() => {
                        tracing::debug!(target: "ledgerbox", event = "startup_backup_cancelled");
                    }
                    _ = time::sleep(startup_delay) => {
                        let outcome = coordinator.create_backup(BackupTag::Startup).await;
                        log_outcome(BackupTag::Startup, &outcome);
                    }
                }
            })
        };

        let recurring = {
            let coordinator = coordinator.clone();
            let mut cancelled = shutdown.subscribe();
            tokio::spawn(async move {
                let mut ticker = time::interval_at(Instant::now() + interval, interval);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        biased;
                        _ = cancelled.changed() => break,
                        _ = ticker.tick() => {
                            let outcome = coordinator.create_backup(BackupTag::Auto).await;
                            log_outcome(BackupTag::Auto, &outcome);
                        }
                    }
                }
                tracing::debug!(target: "ledgerbox", event = "recurring_backup_cancelled");
            })
        };

        Self {
            coordinator,
            shutdown,
            tasks: vec![startup, recurring],
        }
    }

    /// Cancel both timers. A run already in progress is allowed to finish.
    pub async fn shutdown(mut self) {
        self.stop_timers().await;
    }

    /// Exit hook: cancel the timers, then take one final snapshot.
    pub async fn shutdown_with_final_backup(mut self) -> BackupOutcome {
        self.stop_timers().await;
        let outcome = self.coordinator.create_backup(BackupTag::Shutdown).await;
        log_outcome(BackupTag::Shutdown, &outcome);
        outcome
    }

    async fn stop_timers(&mut self) {
        let _ = self.shutdown.send(true);
        for task in std::mem::take(&mut self.tasks) {
            if let Err(err) = task.await {
                tracing::error!(target: "ledgerbox", event = "backup_timer_task_failed", error = %err);
            }
        }
        tracing::info!(target: "ledgerbox", event = "backup_scheduler_stopped");
    }
}

impl Drop for BackupScheduler {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

fn log_outcome(tag: BackupTag, outcome: &BackupOutcome) {
    match outcome {
        BackupOutcome::Completed(report) if !report.is_success() => tracing::warn!(
            target: "ledgerbox",
            event = "scheduled_backup_failed",
            tag = tag.as_str(),
            total = report.total
        ),
        BackupOutcome::Completed(_) => {}
        BackupOutcome::AlreadyRunning => tracing::debug!(
            target: "ledgerbox",
            event = "scheduled_backup_skipped",
            tag = tag.as_str(),
            reason = "already_running"
        ),
        BackupOutcome::SourceUnavailable { .. } => tracing::debug!(
            target: "ledgerbox",
            event = "scheduled_backup_skipped",
            tag = tag.as_str(),
            reason = "source_unavailable"
        ),
    }
}
