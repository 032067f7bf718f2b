use std::cmp::Ordering;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use super::naming::SnapshotPattern;

/// A snapshot file found on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotFile {
    pub path: PathBuf,
    pub file_name: String,
    pub size_bytes: u64,
    pub modified: SystemTime,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PruneReport {
    pub kept: usize,
    pub removed: Vec<PathBuf>,
    pub failed: Vec<PathBuf>,
}

/// List the snapshots in `dir`, newest first. Ties on modification time are
/// broken by file name so the order is stable.
pub fn list_snapshots(dir: &Path, pattern: &SnapshotPattern) -> io::Result<Vec<SnapshotFile>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err),
    };

    let mut out = Vec::new();
    for entry in entries {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                tracing::warn!(target: "ledgerbox", event = "skip_invalid_snapshot_entry", error = %err);
                continue;
            }
        };
        let file_name = entry.file_name().to_string_lossy().into_owned();
        if !pattern.matches(&file_name) {
            continue;
        }
        let meta = match entry.metadata() {
            Ok(meta) if meta.is_file() => meta,
            Ok(_) => continue,
            Err(err) => {
                tracing::warn!(
                    target: "ledgerbox",
                    event = "skip_unreadable_snapshot",
                    path = %entry.path().display(),
                    error = %err
                );
                continue;
            }
        };
        out.push(SnapshotFile {
            path: entry.path(),
            file_name,
            size_bytes: meta.len(),
            modified: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
        });
    }

    out.sort_by(newest_first);
    Ok(out)
}

fn newest_first(a: &SnapshotFile, b: &SnapshotFile) -> Ordering {
    b.modified
        .cmp(&a.modified)
        .then_with(|| b.file_name.cmp(&a.file_name))
}

/// Delete every snapshot in `dir` beyond the `keep` most recently modified.
/// Files that do not look like snapshots are never touched. A failed delete
/// is logged and pruning carries on with the rest.
pub fn prune(dir: &Path, pattern: &SnapshotPattern, keep: usize) -> io::Result<PruneReport> {
    let snapshots = list_snapshots(dir, pattern)?;
    let mut report = PruneReport {
        kept: snapshots.len().min(keep),
        ..PruneReport::default()
    };

    for snapshot in snapshots.into_iter().skip(keep) {
        match fs::remove_file(&snapshot.path) {
            Ok(()) => {
                tracing::debug!(
                    target: "ledgerbox",
                    event = "snapshot_pruned",
                    path = %snapshot.path.display()
                );
                report.removed.push(snapshot.path);
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => {
                tracing::warn!(
                    target: "ledgerbox",
                    event = "snapshot_prune_failed",
                    path = %snapshot.path.display(),
                    error = %err
                );
                report.failed.push(snapshot.path);
            }
        }
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::time::Duration;

    use chrono::{TimeZone, Utc};
    use proptest::prelude::*;
    use tempfile::tempdir;

    use crate::backup::naming::{snapshot_file_name, BackupTag};

    fn pattern() -> SnapshotPattern {
        SnapshotPattern::new("ledgerbox").unwrap()
    }

    /// Writes snapshot number `n` whose mtime is `mtime_secs` past an epoch.
    fn write_snapshot(dir: &Path, n: u32, mtime_secs: u64) -> PathBuf {
        let at = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()
            + chrono::Duration::seconds(i64::from(n));
        let path = dir.join(snapshot_file_name("ledgerbox", BackupTag::Auto, &at));
        fs::write(&path, format!("snapshot {n}")).unwrap();
        let file = File::options().write(true).open(&path).unwrap();
        file.set_modified(SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000 + mtime_secs))
            .unwrap();
        path
    }

    #[test]
    fn keeps_most_recently_modified_files() {
        let tmp = tempdir().unwrap();
        // Name order and mtime order deliberately disagree.
        let oldest = write_snapshot(tmp.path(), 3, 10);
        let middle = write_snapshot(tmp.path(), 1, 20);
        let newest = write_snapshot(tmp.path(), 2, 30);

        let report = prune(tmp.path(), &pattern(), 2).unwrap();
        assert_eq!(report.kept, 2);
        assert_eq!(report.removed, vec![oldest.clone()]);
        assert!(report.failed.is_empty());
        assert!(!oldest.exists());
        assert!(middle.exists());
        assert!(newest.exists());
    }

    #[test]
    fn leaves_unrelated_files_alone() {
        let tmp = tempdir().unwrap();
        fs::write(tmp.path().join("backup.log"), b"log").unwrap();
        fs::write(tmp.path().join("notes.txt"), b"keep me").unwrap();
        write_snapshot(tmp.path(), 1, 1);
        write_snapshot(tmp.path(), 2, 2);

        prune(tmp.path(), &pattern(), 1).unwrap();
        assert!(tmp.path().join("backup.log").exists());
        assert!(tmp.path().join("notes.txt").exists());
        assert_eq!(list_snapshots(tmp.path(), &pattern()).unwrap().len(), 1);
    }

    #[test]
    fn missing_directory_is_empty() {
        let tmp = tempdir().unwrap();
        let report = prune(&tmp.path().join("absent"), &pattern(), 3).unwrap();
        assert_eq!(report, PruneReport::default());
    }

    #[test]
    fn pruning_is_idempotent() {
        let tmp = tempdir().unwrap();
        for n in 0..5 {
            write_snapshot(tmp.path(), n, u64::from(n));
        }
        let first = prune(tmp.path(), &pattern(), 3).unwrap();
        assert_eq!(first.removed.len(), 2);
        let second = prune(tmp.path(), &pattern(), 3).unwrap();
        assert!(second.removed.is_empty());
        assert_eq!(second.kept, 3);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(24))]

        #[test]
        fn retains_exactly_the_newest(
            mtimes in proptest::collection::hash_set(0u64..10_000, 1..12),
            keep in 1usize..8,
        ) {
            let tmp = tempdir().unwrap();
            let mtimes: Vec<u64> = mtimes.into_iter().collect();
            for (n, mtime) in mtimes.iter().enumerate() {
                write_snapshot(tmp.path(), n as u32, *mtime);
            }

            prune(tmp.path(), &pattern(), keep).unwrap();

            let mut expected = mtimes.clone();
            expected.sort_unstable_by(|a, b| b.cmp(a));
            expected.truncate(keep);

            let remaining: Vec<u64> = list_snapshots(tmp.path(), &pattern())
                .unwrap()
                .into_iter()
                .map(|snap| {
                    snap.modified
                        .duration_since(SystemTime::UNIX_EPOCH)
                        .unwrap()
                        .as_secs()
                        - 1_700_000_000
                })
                .collect();
            prop_assert_eq!(remaining, expected);
        }
    }
}
