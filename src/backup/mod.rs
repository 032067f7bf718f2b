//! Local snapshot backups of the primary database file.
//!
//! [`BackupCoordinator`] copies the database to every configured destination,
//! prunes old snapshots, appends to the backup log and restores snapshots.
//! [`scheduler::BackupScheduler`] drives it from timers.

pub mod copier;
pub mod integrity;
pub mod journal;
pub mod naming;
pub mod retention;
pub mod scheduler;
mod swap;

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use chrono::{DateTime, SecondsFormat, Utc};
use futures::future::join_all;
use serde::Serialize;
use tokio::task;

use crate::config::BackupConfig;
use crate::{AppError, AppResult};

use self::copier::{copy_snapshot_cancellable, CopyOptions};
use self::journal::JournalEntry;
use self::naming::{unique_snapshot_name, SnapshotPattern};
use self::retention::SnapshotFile;

pub use self::naming::BackupTag;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DestinationResult {
    pub directory: String,
    pub path: String,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<AppError>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupReport {
    pub tag: BackupTag,
    pub file_name: String,
    pub started_at: String,
    pub duration_ms: u64,
    pub succeeded: usize,
    pub total: usize,
    pub destinations: Vec<DestinationResult>,
}

impl BackupReport {
    pub fn is_success(&self) -> bool {
        self.succeeded > 0
    }
}

/// Result of one `create_backup` call.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum BackupOutcome {
    /// Another run held the in-flight flag; nothing was touched.
    AlreadyRunning,
    /// The primary database is missing or empty; nothing to back up.
    SourceUnavailable { path: String },
    Completed(BackupReport),
}

impl BackupOutcome {
    /// True when at least one destination received a verified snapshot.
    pub fn succeeded(&self) -> bool {
        matches!(self, BackupOutcome::Completed(report) if report.is_success())
    }

    pub fn report(&self) -> Option<&BackupReport> {
        match self {
            BackupOutcome::Completed(report) => Some(report),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RestoreReport {
    pub snapshot_path: String,
    pub database_path: String,
    pub restored_bytes: u64,
    /// Snapshot of the database as it was before the restore, if there was one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub emergency_backup: Option<BackupReport>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PrimaryStatus {
    pub path: String,
    pub exists: bool,
    pub size_bytes: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LatestBackup {
    pub name: String,
    pub path: String,
    pub size_bytes: u64,
    pub modified_at: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DestinationStatus {
    pub directory: String,
    pub exists: bool,
    pub snapshot_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latest_backup: Option<LatestBackup>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupStatus {
    pub primary: PrimaryStatus,
    pub in_flight: bool,
    pub retention_max_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_run: Option<BackupReport>,
    pub destinations: Vec<DestinationStatus>,
}

/// Holds the in-flight flag for the duration of a run.
struct RunGuard {
    flag: Arc<AtomicBool>,
}

impl RunGuard {
    fn try_begin(flag: &Arc<AtomicBool>) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| Self { flag: flag.clone() })
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

pub struct BackupCoordinator {
    config: BackupConfig,
    pattern: SnapshotPattern,
    running: Arc<AtomicBool>,
    last_run: Mutex<Option<BackupReport>>,
}

impl BackupCoordinator {
    pub fn new(config: BackupConfig) -> AppResult<Self> {
        if config.destinations.is_empty() {
            return Err(AppError::new(
                "BACKUP/NO_DESTINATIONS",
                "No backup destinations are configured",
            ));
        }
        let pattern = SnapshotPattern::new(&config.file_prefix)?;
        Ok(Self {
            config,
            pattern,
            running: Arc::new(AtomicBool::new(false)),
            last_run: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &BackupConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub async fn manual_backup(&self) -> BackupOutcome {
        self.create_backup(BackupTag::Manual).await
    }

    pub async fn emergency_backup(&self) -> BackupOutcome {
        self.create_backup(BackupTag::Emergency).await
    }

    /// Snapshot the primary database to every destination.
    ///
    /// Returns immediately with [`BackupOutcome::AlreadyRunning`] if another
    /// run is in flight.
    pub async fn create_backup(&self, tag: BackupTag) -> BackupOutcome {
        let Some(_guard) = RunGuard::try_begin(&self.running) else {
            tracing::info!(
                target: "ledgerbox",
                event = "backup_run_rejected",
                tag = tag.as_str(),
                reason = "already_running"
            );
            return BackupOutcome::AlreadyRunning;
        };
        self.run_locked(tag).await
    }

    async fn run_locked(&self, tag: BackupTag) -> BackupOutcome {
        let primary = self.config.primary_path.clone();
        if source_size(&primary).is_none() {
            tracing::info!(
                target: "ledgerbox",
                event = "backup_source_unavailable",
                tag = tag.as_str(),
                path = %primary.display()
            );
            return BackupOutcome::SourceUnavailable {
                path: primary.display().to_string(),
            };
        }

        let started = Instant::now();
        let started_at = Utc::now();
        let dirs: Vec<&Path> = self.config.destinations.iter().map(PathBuf::as_path).collect();
        let total = dirs.len();
        tracing::info!(
            target: "ledgerbox",
            event = "backup_run_started",
            tag = tag.as_str(),
            destinations = total
        );

        let Some(file_name) =
            unique_snapshot_name(&dirs, &self.config.file_prefix, tag, &started_at)
        else {
            let error = AppError::new(
                "BACKUP/NAME_COLLISION",
                "Unable to allocate a snapshot file name",
            );
            tracing::error!(target: "ledgerbox", event = "backup_name_collision", tag = tag.as_str());
            let destinations = dirs
                .iter()
                .map(|dir| DestinationResult {
                    directory: dir.display().to_string(),
                    path: dir.display().to_string(),
                    ok: false,
                    size_bytes: None,
                    error: Some(error.clone()),
                })
                .collect();
            return self.finish(tag, String::new(), started, started_at, destinations);
        };

        let destinations = self.fan_out(&primary, &file_name).await;

        let pattern = self.pattern.clone();
        let prune_dirs = self.config.destinations.clone();
        let keep = self.config.max_count;
        let pruned = task::spawn_blocking(move || {
            for dir in &prune_dirs {
                if let Err(err) = retention::prune(dir, &pattern, keep) {
                    tracing::warn!(
                        target: "ledgerbox",
                        event = "retention_prune_failed",
                        path = %dir.display(),
                        error = %err
                    );
                }
            }
        })
        .await;
        if let Err(err) = pruned {
            tracing::error!(target: "ledgerbox", event = "retention_task_failed", error = %err);
        }

        self.finish(tag, file_name, started, started_at, destinations)
    }

    /// Copy the primary into every destination concurrently and wait for all
    /// copies to settle.
    async fn fan_out(&self, primary: &Path, file_name: &str) -> Vec<DestinationResult> {
        let options = CopyOptions {
            verify_sha256: self.config.verify_sha256,
        };
        let timeout = self.config.copy_timeout;

        let copies = self.config.destinations.iter().map(|dir| {
            let src = primary.to_path_buf();
            let dest = dir.join(file_name);
            let directory = dir.clone();
            async move {
                let cancelled = Arc::new(AtomicBool::new(false));
                let mut job = {
                    let dest = dest.clone();
                    let cancelled = cancelled.clone();
                    task::spawn_blocking(move || {
                        copy_snapshot_cancellable(&src, &dest, options, &cancelled)
                    })
                };
                let result = match tokio::time::timeout(timeout, &mut job).await {
                    Ok(Ok(Ok(len))) => Ok(len),
                    Ok(Ok(Err(err))) => Err(AppError::from(err)),
                    Ok(Err(join_err)) => Err(AppError::new(
                        "BACKUP/TASK",
                        "Snapshot copy task panicked",
                    )
                    .with_context("error", join_err.to_string())),
                    Err(_) => {
                        cancelled.store(true, Ordering::SeqCst);
                        reap_abandoned_copy(job, dest.clone());
                        Err(AppError::new(
                            "BACKUP/TIMEOUT",
                            "Snapshot copy did not finish in time",
                        )
                        .with_context("timeout_ms", timeout.as_millis().to_string()))
                    }
                };
                destination_result(&directory, &dest, result)
            }
        });

        join_all(copies).await
    }

    fn finish(
        &self,
        tag: BackupTag,
        file_name: String,
        started: Instant,
        started_at: DateTime<Utc>,
        destinations: Vec<DestinationResult>,
    ) -> BackupOutcome {
        let succeeded = destinations.iter().filter(|dest| dest.ok).count();
        let total = destinations.len();
        let report = BackupReport {
            tag,
            file_name,
            started_at: started_at.to_rfc3339_opts(SecondsFormat::Millis, true),
            duration_ms: started.elapsed().as_millis() as u64,
            succeeded,
            total,
            destinations,
        };

        if let Some(log_dir) = self.config.log_dir() {
            let entry = JournalEntry {
                at: Utc::now(),
                tag,
                file_name: report.file_name.clone(),
                succeeded,
                total,
            };
            if let Err(err) = journal::append(log_dir, &entry) {
                tracing::warn!(
                    target: "ledgerbox",
                    event = "backup_log_append_failed",
                    path = %log_dir.display(),
                    error = %err
                );
            }
        }

        if report.is_success() {
            tracing::info!(
                target: "ledgerbox",
                event = "backup_run_finished",
                tag = tag.as_str(),
                file = %report.file_name,
                succeeded,
                total,
                duration_ms = report.duration_ms
            );
        } else {
            tracing::error!(
                target: "ledgerbox",
                event = "backup_run_failed",
                tag = tag.as_str(),
                file = %report.file_name,
                total
            );
        }

        *self.last_run.lock().unwrap_or_else(|e| e.into_inner()) = Some(report.clone());
        BackupOutcome::Completed(report)
    }

    /// Replace the primary database with `snapshot`.
    ///
    /// The snapshot is staged next to the database and must pass
    /// `PRAGMA quick_check`. If a primary database exists, one emergency
    /// backup of it is taken first and the restore is abandoned unless that
    /// backup reached at least one destination.
    pub async fn restore_from_backup(&self, snapshot: impl AsRef<Path>) -> AppResult<RestoreReport> {
        let snapshot = snapshot.as_ref().to_path_buf();
        let result = self.restore_inner(&snapshot).await;
        match &result {
            Ok(report) => tracing::info!(
                target: "ledgerbox",
                event = "restore_finished",
                snapshot = %snapshot.display(),
                bytes = report.restored_bytes
            ),
            Err(err) => tracing::error!(
                target: "ledgerbox",
                event = "restore_failed",
                snapshot = %snapshot.display(),
                code = err.code(),
                error = %err
            ),
        }
        result
    }

    async fn restore_inner(&self, snapshot: &Path) -> AppResult<RestoreReport> {
        match fs::metadata(snapshot) {
            Ok(meta) if meta.is_file() && meta.len() > 0 => {}
            Ok(meta) if meta.is_file() => {
                return Err(AppError::new("RESTORE/EMPTY_SNAPSHOT", "Snapshot file is empty")
                    .with_context("path", snapshot.display().to_string()));
            }
            _ => {
                return Err(AppError::new("RESTORE/NOT_FOUND", "Snapshot file does not exist")
                    .with_context("path", snapshot.display().to_string()));
            }
        }

        let Some(_guard) = RunGuard::try_begin(&self.running) else {
            return Err(AppError::new(
                "BACKUP/BUSY",
                "A backup is in progress; try the restore again shortly",
            ));
        };

        let primary = self.config.primary_path.clone();
        let staged = {
            let snapshot = snapshot.to_path_buf();
            let primary = primary.clone();
            task::spawn_blocking(move || -> AppResult<swap::StagedSnapshot> {
                let staged = swap::stage_snapshot(&snapshot, &primary)?;
                let checked = integrity::quick_check(&staged.path);
                if let Err(err) = swap::remove_sidecars(&staged.path) {
                    tracing::warn!(
                        target: "ledgerbox",
                        event = "staged_sidecar_cleanup_failed",
                        path = %staged.path.display(),
                        error = %err
                    );
                }
                if let Err(err) = checked {
                    let _ = fs::remove_file(&staged.path);
                    return Err(err.with_context("snapshot", snapshot.display().to_string()));
                }
                Ok(staged)
            })
            .await
            .map_err(|err| {
                AppError::new("RESTORE/TASK", "Restore staging task panicked")
                    .with_context("error", err.to_string())
            })??
        };

        let emergency_backup = if primary.is_file() {
            match self.run_locked(BackupTag::Emergency).await {
                BackupOutcome::Completed(report) if report.is_success() => Some(report),
                BackupOutcome::SourceUnavailable { .. } => None,
                _ => {
                    let _ = fs::remove_file(&staged.path);
                    return Err(AppError::new(
                        "RESTORE/EMERGENCY_BACKUP_FAILED",
                        "Could not back up the current database before restoring",
                    )
                    .with_context("path", primary.display().to_string()));
                }
            }
        } else {
            None
        };

        let restored_bytes = staged.bytes;
        {
            let staged = staged.path;
            let primary = primary.clone();
            task::spawn_blocking(move || swap::promote_staged(&staged, &primary))
                .await
                .map_err(|err| {
                    AppError::new("RESTORE/TASK", "Restore promotion task panicked")
                        .with_context("error", err.to_string())
                })??;
        }

        Ok(RestoreReport {
            snapshot_path: snapshot.display().to_string(),
            database_path: primary.display().to_string(),
            restored_bytes,
            emergency_backup,
        })
    }

    /// Read-only view of the primary database and every destination.
    pub fn backup_status(&self) -> BackupStatus {
        let primary_path = &self.config.primary_path;
        let (exists, size_bytes) = match fs::metadata(primary_path) {
            Ok(meta) if meta.is_file() => (true, meta.len()),
            _ => (false, 0),
        };

        let destinations = self
            .config
            .destinations
            .iter()
            .map(|dir| self.destination_status(dir))
            .collect();

        BackupStatus {
            primary: PrimaryStatus {
                path: primary_path.display().to_string(),
                exists,
                size_bytes,
            },
            in_flight: self.is_running(),
            retention_max_count: self.config.max_count,
            last_run: self
                .last_run
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .clone(),
            destinations,
        }
    }

    fn destination_status(&self, dir: &Path) -> DestinationStatus {
        let snapshots = retention::list_snapshots(dir, &self.pattern).unwrap_or_else(|err| {
            tracing::warn!(
                target: "ledgerbox",
                event = "backup_status_list_failed",
                path = %dir.display(),
                error = %err
            );
            Vec::new()
        });
        DestinationStatus {
            directory: dir.display().to_string(),
            exists: dir.is_dir(),
            snapshot_count: snapshots.len(),
            latest_backup: snapshots.into_iter().next().map(latest_backup),
        }
    }
}

/// A copy that outlived its timeout keeps running on the blocking pool. Once
/// it settles, make sure nothing it wrote stays in the destination.
fn reap_abandoned_copy(job: task::JoinHandle<Result<u64, copier::CopyError>>, dest: PathBuf) {
    tokio::spawn(async move {
        if let Ok(Ok(_)) = job.await {
            let removed = task::spawn_blocking(move || copier::discard(&dest)).await;
            if let Err(err) = removed {
                tracing::error!(target: "ledgerbox", event = "abandoned_copy_reap_failed", error = %err);
            }
        }
    });
}

fn source_size(path: &Path) -> Option<u64> {
    fs::metadata(path)
        .ok()
        .filter(|meta| meta.is_file() && meta.len() > 0)
        .map(|meta| meta.len())
}

fn latest_backup(snapshot: SnapshotFile) -> LatestBackup {
    LatestBackup {
        name: snapshot.file_name,
        path: snapshot.path.display().to_string(),
        size_bytes: snapshot.size_bytes,
        modified_at: DateTime::<Utc>::from(snapshot.modified)
            .to_rfc3339_opts(SecondsFormat::Millis, true),
    }
}

fn destination_result(dir: &Path, dest: &Path, result: AppResult<u64>) -> DestinationResult {
    match result {
        Ok(len) => DestinationResult {
            directory: dir.display().to_string(),
            path: dest.display().to_string(),
            ok: true,
            size_bytes: Some(len),
            error: None,
        },
        Err(err) => {
            tracing::warn!(
                target: "ledgerbox",
                event = "snapshot_copy_failed",
                path = %dest.display(),
                code = err.code(),
                error = %err
            );
            DestinationResult {
                directory: dir.display().to_string(),
                path: dest.display().to_string(),
                ok: false,
                size_bytes: None,
                error: Some(err),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn coordinator(root: &Path) -> BackupCoordinator {
        let config = BackupConfig::new(
            root.join("ledgerbox.db"),
            vec![root.join("local"), root.join("docs")],
        )
        .with_max_count(3);
        BackupCoordinator::new(config).unwrap()
    }

    #[test]
    fn run_guard_releases_on_drop() {
        let flag = Arc::new(AtomicBool::new(false));
        let guard = RunGuard::try_begin(&flag).expect("first guard");
        assert!(RunGuard::try_begin(&flag).is_none());
        drop(guard);
        assert!(!flag.load(Ordering::SeqCst));
        assert!(RunGuard::try_begin(&flag).is_some());
    }

    #[test]
    fn rejects_empty_destination_list() {
        let err = BackupCoordinator::new(BackupConfig::new("/tmp/ledgerbox.db", Vec::new()))
            .err()
            .expect("empty destinations rejected");
        assert_eq!(err.code(), "BACKUP/NO_DESTINATIONS");
    }

    #[tokio::test]
    async fn failing_destination_does_not_block_the_others() {
        let tmp = tempdir().unwrap();
        fs::write(tmp.path().join("ledgerbox.db"), b"ledger bytes").unwrap();
        let blocker = tmp.path().join("blocker");
        fs::write(&blocker, b"a file, not a directory").unwrap();
        let config = BackupConfig::new(
            tmp.path().join("ledgerbox.db"),
            vec![tmp.path().join("local"), blocker.join("nested")],
        );
        let coordinator = BackupCoordinator::new(config).unwrap();

        let outcome = coordinator.manual_backup().await;
        let report = outcome.report().expect("completed");
        assert!(outcome.succeeded());
        assert_eq!((report.succeeded, report.total), (1, 2));
        assert!(report.destinations[0].ok);
        assert!(!report.destinations[1].ok);
        assert_eq!(
            report.destinations[1].error.as_ref().map(AppError::code),
            Some("BACKUP/IO")
        );

        let log = fs::read_to_string(tmp.path().join("local").join("backup.log")).unwrap();
        assert!(log.trim_end().ends_with("1/2"), "log: {log}");
    }

    #[tokio::test]
    async fn retention_applies_to_every_destination() {
        let tmp = tempdir().unwrap();
        fs::write(tmp.path().join("ledgerbox.db"), b"ledger bytes").unwrap();
        let coordinator = coordinator(tmp.path());

        for _ in 0..5 {
            assert!(coordinator.create_backup(BackupTag::Auto).await.succeeded());
        }

        let status = coordinator.backup_status();
        assert_eq!(status.destinations.len(), 2);
        for dest in &status.destinations {
            assert_eq!(dest.snapshot_count, 3, "{}", dest.directory);
        }
        let log = fs::read_to_string(tmp.path().join("local").join("backup.log")).unwrap();
        assert_eq!(log.lines().count(), 5);
    }

    #[tokio::test]
    async fn status_reports_last_run_and_flag() {
        let tmp = tempdir().unwrap();
        fs::write(tmp.path().join("ledgerbox.db"), b"ledger bytes").unwrap();
        let coordinator = coordinator(tmp.path());
        assert!(coordinator.backup_status().last_run.is_none());

        coordinator.manual_backup().await;
        let status = coordinator.backup_status();
        assert!(!status.in_flight);
        assert!(status.primary.exists);
        assert_eq!(status.primary.size_bytes, 12);
        let last = status.last_run.expect("last run recorded");
        assert_eq!(last.tag, BackupTag::Manual);
        assert_eq!(last.succeeded, 2);
    }

    #[test]
    fn outcome_serializes_with_discriminator() {
        let value = serde_json::to_value(BackupOutcome::AlreadyRunning).unwrap();
        assert_eq!(value["outcome"], "already_running");

        let value = serde_json::to_value(BackupOutcome::SourceUnavailable {
            path: "/x.db".into(),
        })
        .unwrap();
        assert_eq!(value["outcome"], "source_unavailable");
        assert_eq!(value["path"], "/x.db");
    }
}
