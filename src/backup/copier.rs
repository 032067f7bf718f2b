use std::env;
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use fs2::available_space;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::AppError;

const REQUIRED_FREE_MULTIPLIER: f64 = 1.2;
const FAKE_FREE_BYTES_ENV: &str = "LEDGERBOX_BACKUP_FAKE_FREE_BYTES";

#[derive(Debug, Error)]
pub enum CopyError {
    #[error("source file {0} does not exist")]
    SourceMissing(PathBuf),
    #[error("source file {0} is empty")]
    SourceEmpty(PathBuf),
    #[error("destination {path} has no parent directory")]
    NoParent { path: PathBuf },
    #[error("failed to {operation} {path}: {source}")]
    Io {
        operation: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("not enough free space in {path} (need {required} bytes, have {available})")]
    LowDisk {
        path: PathBuf,
        required: u64,
        available: u64,
    },
    #[error("size mismatch after copy: source {source_len} bytes, copy {copy_len} bytes")]
    SizeMismatch { source_len: u64, copy_len: u64 },
    #[error("checksum mismatch after copy")]
    ChecksumMismatch,
    #[error("copy to {0} was abandoned")]
    Cancelled(PathBuf),
}

impl CopyError {
    pub fn code(&self) -> &'static str {
        match self {
            CopyError::SourceMissing(_) => "BACKUP/SOURCE_MISSING",
            CopyError::SourceEmpty(_) => "BACKUP/SOURCE_EMPTY",
            CopyError::NoParent { .. } => "BACKUP/NO_PARENT",
            CopyError::Io { .. } => "BACKUP/IO",
            CopyError::LowDisk { .. } => "BACKUP/LOW_DISK",
            CopyError::SizeMismatch { .. } => "BACKUP/SIZE_MISMATCH",
            CopyError::ChecksumMismatch => "BACKUP/CHECKSUM_MISMATCH",
            CopyError::Cancelled(_) => "BACKUP/CANCELLED",
        }
    }

    fn io(operation: &'static str, path: &Path, source: io::Error) -> Self {
        CopyError::Io {
            operation,
            path: path.to_path_buf(),
            source,
        }
    }
}

impl From<CopyError> for AppError {
    fn from(error: CopyError) -> Self {
        let code = error.code();
        let message = error.to_string();
        match error {
            CopyError::Io {
                operation, source, ..
            } => AppError::new(code, message)
                .with_context("operation", operation)
                .with_cause(source),
            _ => AppError::new(code, message),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CopyOptions {
    pub verify_sha256: bool,
}

/// Copy `src` to `dest` and confirm the copy has the source's byte length.
///
/// A copy that fails verification is removed before the error is returned.
/// Returns the number of bytes in the verified copy.
pub fn copy_snapshot(src: &Path, dest: &Path, options: CopyOptions) -> Result<u64, CopyError> {
    copy_snapshot_cancellable(src, dest, options, &AtomicBool::new(false))
}

/// Same as [`copy_snapshot`], but gives up once `cancelled` is set. The flag
/// is checked after the copy and again after verification; a copy finished
/// after cancellation is removed rather than kept.
pub fn copy_snapshot_cancellable(
    src: &Path,
    dest: &Path,
    options: CopyOptions,
    cancelled: &AtomicBool,
) -> Result<u64, CopyError> {
    let source_len = source_len(src)?;

    let parent = dest.parent().ok_or_else(|| CopyError::NoParent {
        path: dest.to_path_buf(),
    })?;
    fs::create_dir_all(parent).map_err(|err| CopyError::io("create directory", parent, err))?;

    let required = required_free_bytes(source_len);
    let available = free_disk_space(parent).map_err(|err| CopyError::io("stat free space", parent, err))?;
    if available < required {
        return Err(CopyError::LowDisk {
            path: parent.to_path_buf(),
            required,
            available,
        });
    }

    if let Err(err) = fs::copy(src, dest) {
        discard(dest);
        return Err(CopyError::io("copy to", dest, err));
    }

    let verified = still_wanted(dest, cancelled)
        .and_then(|()| verify_copy(src, dest, options))
        .and_then(|len| still_wanted(dest, cancelled).map(|()| len));
    keep_or_discard(dest, verified)
}

fn still_wanted(dest: &Path, cancelled: &AtomicBool) -> Result<(), CopyError> {
    if cancelled.load(Ordering::SeqCst) {
        return Err(CopyError::Cancelled(dest.to_path_buf()));
    }
    Ok(())
}

/// Pass a verified length through; remove `dest` when verification failed.
fn keep_or_discard(dest: &Path, verified: Result<u64, CopyError>) -> Result<u64, CopyError> {
    if verified.is_err() {
        discard(dest);
    }
    verified
}

fn source_len(src: &Path) -> Result<u64, CopyError> {
    let meta = match fs::metadata(src) {
        Ok(meta) => meta,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            return Err(CopyError::SourceMissing(src.to_path_buf()))
        }
        Err(err) => return Err(CopyError::io("stat", src, err)),
    };
    if !meta.is_file() {
        return Err(CopyError::SourceMissing(src.to_path_buf()));
    }
    if meta.len() == 0 {
        return Err(CopyError::SourceEmpty(src.to_path_buf()));
    }
    Ok(meta.len())
}

fn verify_copy(src: &Path, dest: &Path, options: CopyOptions) -> Result<u64, CopyError> {
    let source_len = fs::metadata(src)
        .map_err(|err| CopyError::io("re-stat", src, err))?
        .len();
    let copy_len = fs::metadata(dest)
        .map_err(|err| CopyError::io("re-stat", dest, err))?
        .len();
    if source_len != copy_len {
        return Err(CopyError::SizeMismatch {
            source_len,
            copy_len,
        });
    }

    if options.verify_sha256 {
        let expected = file_sha256(src).map_err(|err| CopyError::io("hash", src, err))?;
        let actual = file_sha256(dest).map_err(|err| CopyError::io("hash", dest, err))?;
        if expected != actual {
            return Err(CopyError::ChecksumMismatch);
        }
    }

    if let Err(err) = File::open(dest).and_then(|file| file.sync_all()) {
        tracing::debug!(
            target: "ledgerbox",
            event = "snapshot_sync_failed",
            path = %dest.display(),
            error = %err
        );
    }
    Ok(copy_len)
}

pub(crate) fn discard(dest: &Path) {
    match fs::remove_file(dest) {
        Ok(()) => {
            tracing::warn!(
                target: "ledgerbox",
                event = "snapshot_copy_discarded",
                path = %dest.display()
            );
        }
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => {
            tracing::error!(
                target: "ledgerbox",
                event = "snapshot_discard_failed",
                path = %dest.display(),
                error = %err
            );
        }
    }
}

pub fn required_free_bytes(size: u64) -> u64 {
    ((size as f64 * REQUIRED_FREE_MULTIPLIER).ceil()) as u64
}

fn free_disk_space(path: &Path) -> io::Result<u64> {
    if let Ok(fake) = env::var(FAKE_FREE_BYTES_ENV) {
        if let Ok(value) = fake.parse::<u64>() {
            return Ok(value);
        }
    }
    available_space(path)
}

pub fn file_sha256(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0_u8; 8192];
    loop {
        let read = file.read(&mut buf)?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}
