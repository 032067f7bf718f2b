use std::ffi::OsString;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

use crate::{AppError, AppResult};

const STAGING_SUFFIX: &str = ".restore.partial";

fn sync_file(path: &Path) -> io::Result<()> {
    File::open(path)?.sync_all()
}

fn sync_dir(path: &Path) -> io::Result<()> {
    File::open(path)?.sync_all()
}

fn with_suffix(base: &Path, suffix: &str) -> PathBuf {
    let mut os = OsString::from(base.as_os_str());
    os.push(suffix);
    PathBuf::from(os)
}

fn remove_sidecar(base: &Path, suffix: &str) -> io::Result<()> {
    match fs::remove_file(with_suffix(base, suffix)) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err),
    }
}

/// Remove the `-wal`, `-shm` and `-journal` files next to `db_path`. For the
/// live database they belong to the file being replaced and must not be
/// replayed on top of the restored one; for a staged copy they are leftovers
/// of the integrity check.
pub fn remove_sidecars(db_path: &Path) -> io::Result<()> {
    remove_sidecar(db_path, "-wal")?;
    remove_sidecar(db_path, "-shm")?;
    remove_sidecar(db_path, "-journal")?;
    Ok(())
}

#[derive(Debug)]
pub struct StagedSnapshot {
    pub path: PathBuf,
    pub bytes: u64,
}

/// Copy `snapshot` next to `live_path` so the final step is a same-directory
/// rename. The staged copy is removed if it does not match the snapshot size.
pub fn stage_snapshot(snapshot: &Path, live_path: &Path) -> AppResult<StagedSnapshot> {
    let parent = live_path.parent().ok_or_else(|| {
        AppError::new(
            "RESTORE/NO_PARENT",
            "Database path does not have a parent directory",
        )
        .with_context("path", live_path.display().to_string())
    })?;
    fs::create_dir_all(parent).map_err(|err| {
        AppError::from(err)
            .with_context("operation", "create_database_dir")
            .with_context("path", parent.display().to_string())
    })?;

    let staged = with_suffix(live_path, STAGING_SUFFIX);
    let expected = fs::copy(snapshot, &staged).map_err(|err| {
        let _ = fs::remove_file(&staged);
        AppError::from(err)
            .with_context("operation", "stage_snapshot")
            .with_context("from", snapshot.display().to_string())
            .with_context("to", staged.display().to_string())
    })?;

    let actual = fs::metadata(&staged).map(|meta| meta.len()).unwrap_or(0);
    if actual != expected || actual == 0 {
        let _ = fs::remove_file(&staged);
        return Err(
            AppError::new("RESTORE/SIZE_MISMATCH", "Staged snapshot does not match source size")
                .with_context("expected_bytes", expected.to_string())
                .with_context("actual_bytes", actual.to_string()),
        );
    }

    sync_file(&staged).map_err(|err| {
        let _ = fs::remove_file(&staged);
        AppError::from(err)
            .with_context("operation", "sync_staged_snapshot")
            .with_context("path", staged.display().to_string())
    })?;

    Ok(StagedSnapshot {
        path: staged,
        bytes: actual,
    })
}

/// Atomically replace the live database with a staged copy created by
/// [`stage_snapshot`]. On failure the live file is left untouched and the
/// staged copy is removed.
pub fn promote_staged(staged: &Path, live_path: &Path) -> AppResult<()> {
    let parent = live_path.parent().ok_or_else(|| {
        AppError::new(
            "RESTORE/NO_PARENT",
            "Database path does not have a parent directory",
        )
        .with_context("path", live_path.display().to_string())
    })?;
    if staged.parent() != Some(parent) {
        let _ = fs::remove_file(staged);
        return Err(AppError::new(
            "RESTORE/DIFFERENT_PARENT",
            "Staged snapshot must share the database's parent directory",
        )
        .with_context("live", live_path.display().to_string())
        .with_context("staged", staged.display().to_string()));
    }

    if let Err(err) = remove_sidecars(live_path) {
        let _ = fs::remove_file(staged);
        return Err(AppError::from(err)
            .with_context("operation", "remove_live_sidecars")
            .with_context("path", live_path.display().to_string()));
    }

    if let Err(err) = fs::rename(staged, live_path) {
        let _ = fs::remove_file(staged);
        return Err(AppError::from(err)
            .with_context("operation", "promote_snapshot")
            .with_context("from", staged.display().to_string())
            .with_context("to", live_path.display().to_string()));
    }

    sync_dir(parent).ok();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn stage_and_promote_replaces_live_file() {
        let dir = tempdir().unwrap();
        let backups = tempdir().unwrap();
        let live = dir.path().join("ledgerbox.db");
        let snapshot = backups.path().join("snap.db");
        fs::write(&live, b"old").unwrap();
        fs::write(with_suffix(&live, "-wal"), b"stale wal").unwrap();
        fs::write(&snapshot, b"restored contents").unwrap();

        let staged = stage_snapshot(&snapshot, &live).unwrap();
        assert_eq!(staged.path.parent(), live.parent());
        assert_eq!(staged.bytes, 17);
        promote_staged(&staged.path, &live).unwrap();

        assert_eq!(fs::read(&live).unwrap(), b"restored contents");
        assert!(!staged.path.exists());
        assert!(!with_suffix(&live, "-wal").exists());
        assert!(snapshot.exists());
    }

    #[test]
    fn remove_sidecars_clears_every_companion_file() {
        let dir = tempdir().unwrap();
        let db = dir.path().join("ledgerbox.db.restore.partial");
        fs::write(&db, b"db").unwrap();
        for suffix in ["-wal", "-shm", "-journal"] {
            fs::write(with_suffix(&db, suffix), b"x").unwrap();
        }

        remove_sidecars(&db).unwrap();
        remove_sidecars(&db).unwrap();

        let names: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|entry| entry.unwrap().file_name())
            .collect();
        assert_eq!(names, vec![OsString::from("ledgerbox.db.restore.partial")]);
    }

    #[test]
    fn promote_rejects_foreign_staging_path() {
        let dir = tempdir().unwrap();
        let other = tempdir().unwrap();
        let live = dir.path().join("ledgerbox.db");
        let staged = other.path().join("staged.db");
        fs::write(&live, b"old").unwrap();
        fs::write(&staged, b"new").unwrap();

        let err = promote_staged(&staged, &live).unwrap_err();
        assert_eq!(err.code(), "RESTORE/DIFFERENT_PARENT");
        assert_eq!(fs::read(&live).unwrap(), b"old");
    }
}
