use std::fmt;
use std::path::Path;
use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::{AppError, AppResult};

pub const SNAPSHOT_EXTENSION: &str = "db";
const MAX_COLLISION_SUFFIX: u32 = 99;

/// Why a snapshot was taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupTag {
    Auto,
    Startup,
    Manual,
    Emergency,
    Shutdown,
}

impl BackupTag {
    pub const ALL: [BackupTag; 5] = [
        BackupTag::Auto,
        BackupTag::Startup,
        BackupTag::Manual,
        BackupTag::Emergency,
        BackupTag::Shutdown,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            BackupTag::Auto => "auto",
            BackupTag::Startup => "startup",
            BackupTag::Manual => "manual",
            BackupTag::Emergency => "emergency",
            BackupTag::Shutdown => "shutdown",
        }
    }
}

impl fmt::Display for BackupTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackupTag {
    type Err = AppError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        BackupTag::ALL
            .into_iter()
            .find(|tag| tag.as_str().eq_ignore_ascii_case(value.trim()))
            .ok_or_else(|| {
                AppError::new("BACKUP/INVALID_TAG", format!("Unknown backup tag: {value}"))
            })
    }
}

/// ISO-8601 UTC timestamp with `:` and `.` replaced so it is safe in file
/// names on every platform.
pub fn sanitized_timestamp(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
        .replace([':', '.'], "-")
}

fn snapshot_stem(prefix: &str, tag: BackupTag, at: &DateTime<Utc>) -> String {
    format!("{prefix}_{tag}_{}", sanitized_timestamp(at))
}

pub fn snapshot_file_name(prefix: &str, tag: BackupTag, at: &DateTime<Utc>) -> String {
    format!("{}.{SNAPSHOT_EXTENSION}", snapshot_stem(prefix, tag, at))
}

/// Pick a snapshot name not present in any of `dirs`. Two runs inside the
/// same millisecond get `-01`, `-02`, ... appended.
pub fn unique_snapshot_name(
    dirs: &[&Path],
    prefix: &str,
    tag: BackupTag,
    at: &DateTime<Utc>,
) -> Option<String> {
    let stem = snapshot_stem(prefix, tag, at);
    (0..=MAX_COLLISION_SUFFIX)
        .map(|suffix| {
            if suffix == 0 {
                format!("{stem}.{SNAPSHOT_EXTENSION}")
            } else {
                format!("{stem}-{suffix:02}.{SNAPSHOT_EXTENSION}")
            }
        })
        .find(|candidate| !dirs.iter().any(|dir| dir.join(candidate).exists()))
}

/// Recognises snapshot file names produced for one prefix.
#[derive(Debug, Clone)]
pub struct SnapshotPattern {
    regex: Regex,
}

impl SnapshotPattern {
    pub fn new(prefix: &str) -> AppResult<Self> {
        let tags = BackupTag::ALL.map(BackupTag::as_str).join("|");
        let pattern = format!(
            r"^{}_({tags})_\d{{4}}-\d{{2}}-\d{{2}}T\d{{2}}-\d{{2}}-\d{{2}}-\d{{3}}Z(-\d{{2}})?\.{SNAPSHOT_EXTENSION}$",
            regex::escape(prefix)
        );
        let regex = Regex::new(&pattern).map_err(|err| {
            AppError::new("BACKUP/INVALID_PREFIX", "Snapshot prefix produced an invalid pattern")
                .with_context("prefix", prefix)
                .with_context("error", err.to_string())
        })?;
        Ok(Self { regex })
    }

    pub fn matches(&self, file_name: &str) -> bool {
        self.regex.is_match(file_name)
    }

    pub fn tag_of(&self, file_name: &str) -> Option<BackupTag> {
        self.regex
            .captures(file_name)
            .and_then(|caps| caps.get(1))
            .and_then(|tag| tag.as_str().parse().ok())
    }
}
