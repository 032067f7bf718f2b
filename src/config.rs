use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::{AppError, AppResult};

pub const APP_DIR_NAME: &str = "ledgerbox";
pub const DB_FILE_NAME: &str = "ledgerbox.db";
pub const SNAPSHOT_PREFIX: &str = "ledgerbox";
pub const BACKUP_DIR_NAME: &str = "backups";
pub const EXTERNAL_BACKUP_DIR_NAME: &str = "LedgerBox Backups";
pub const LOGS_DIR_NAME: &str = "logs";

pub const FAKE_APPDATA_ENV: &str = "LEDGERBOX_FAKE_APPDATA";
const DB_PATH_ENV: &str = "LEDGERBOX_DB_PATH";
const BACKUP_DIRS_ENV: &str = "LEDGERBOX_BACKUP_DIRS";
const BACKUP_DESKTOP_ENV: &str = "LEDGERBOX_BACKUP_DESKTOP";
const MAX_COUNT_ENV: &str = "LEDGERBOX_BACKUP_MAX_COUNT";
const INTERVAL_ENV: &str = "LEDGERBOX_BACKUP_INTERVAL_SECS";
const STARTUP_DELAY_ENV: &str = "LEDGERBOX_BACKUP_STARTUP_DELAY_SECS";
const COPY_TIMEOUT_ENV: &str = "LEDGERBOX_BACKUP_COPY_TIMEOUT_SECS";
const VERIFY_SHA256_ENV: &str = "LEDGERBOX_BACKUP_VERIFY_SHA256";

pub const DEFAULT_MAX_COUNT: usize = 10;
pub const HARD_MAX_COUNT: usize = 100;
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(30 * 60);
pub const DEFAULT_STARTUP_DELAY: Duration = Duration::from_secs(30);
/// Shortest recurring interval the scheduler will run with.
pub const MIN_INTERVAL: Duration = Duration::from_millis(1);
pub const DEFAULT_COPY_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Everything the backup coordinator and scheduler need to know about the
/// host application. Built explicitly and handed to the services that use it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupConfig {
    pub primary_path: PathBuf,
    /// Snapshot destinations. The first entry also holds the backup log.
    pub destinations: Vec<PathBuf>,
    pub file_prefix: String,
    pub max_count: usize,
    pub interval: Duration,
    pub startup_delay: Duration,
    pub copy_timeout: Duration,
    pub verify_sha256: bool,
}

impl BackupConfig {
    pub fn new(primary_path: impl Into<PathBuf>, destinations: Vec<PathBuf>) -> Self {
        Self {
            primary_path: primary_path.into(),
            destinations,
            file_prefix: SNAPSHOT_PREFIX.to_string(),
            max_count: DEFAULT_MAX_COUNT,
            interval: DEFAULT_INTERVAL,
            startup_delay: DEFAULT_STARTUP_DELAY,
            copy_timeout: DEFAULT_COPY_TIMEOUT,
            verify_sha256: false,
        }
    }

    pub fn with_max_count(mut self, max_count: usize) -> Self {
        self.max_count = max_count.clamp(1, HARD_MAX_COUNT);
        self
    }

    pub fn with_file_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.file_prefix = prefix.into();
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval.max(MIN_INTERVAL);
        self
    }

    pub fn with_startup_delay(mut self, delay: Duration) -> Self {
        self.startup_delay = delay;
        self
    }

    pub fn with_copy_timeout(mut self, timeout: Duration) -> Self {
        self.copy_timeout = timeout;
        self
    }

    pub fn with_sha256_verification(mut self, enabled: bool) -> Self {
        self.verify_sha256 = enabled;
        self
    }

    /// Directory that receives the backup log.
    pub fn log_dir(&self) -> Option<&Path> {
        self.destinations.first().map(PathBuf::as_path)
    }

    /// Resolve the configuration the way the desktop app does, honouring the
    /// `LEDGERBOX_*` overrides.
    pub fn from_env() -> AppResult<Self> {
        let roots = HostRoots::resolve()?;

        let primary_path = env::var_os(DB_PATH_ENV)
            .filter(|value| !value.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| roots.app_data.join(DB_FILE_NAME));

        let destinations = match env::var_os(BACKUP_DIRS_ENV).filter(|value| !value.is_empty()) {
            Some(list) => env::split_paths(&list).collect(),
            None => default_destinations(&roots, env_flag(BACKUP_DESKTOP_ENV)),
        };

        if destinations.is_empty() {
            return Err(AppError::new(
                "BACKUP/NO_DESTINATIONS",
                "No backup destinations are configured",
            ));
        }

        let max_count = env_number::<usize>(MAX_COUNT_ENV)
            .filter(|value| *value > 0)
            .map(|value| value.min(HARD_MAX_COUNT))
            .unwrap_or(DEFAULT_MAX_COUNT);

        Ok(Self::new(primary_path, destinations)
            .with_max_count(max_count)
            .with_interval(env_secs(INTERVAL_ENV).unwrap_or(DEFAULT_INTERVAL))
            .with_startup_delay(env_secs(STARTUP_DELAY_ENV).unwrap_or(DEFAULT_STARTUP_DELAY))
            .with_copy_timeout(env_secs(COPY_TIMEOUT_ENV).unwrap_or(DEFAULT_COPY_TIMEOUT))
            .with_sha256_verification(env_flag(VERIFY_SHA256_ENV)))
    }
}

/// Host directories the default paths hang off.
#[derive(Debug, Clone)]
pub struct HostRoots {
    pub app_data: PathBuf,
    pub documents: Option<PathBuf>,
    pub desktop: Option<PathBuf>,
}

impl HostRoots {
    pub fn resolve() -> AppResult<Self> {
        if let Some(fake) = env::var_os(FAKE_APPDATA_ENV).filter(|value| !value.is_empty()) {
            let base = PathBuf::from(fake);
            return Ok(Self {
                app_data: base.clone(),
                documents: Some(base.join("Documents")),
                desktop: Some(base.join("Desktop")),
            });
        }

        let data = dirs::data_dir()
            .or_else(|| env::current_dir().ok())
            .ok_or_else(|| {
                AppError::new(
                    "CONFIG/NO_DATA_DIR",
                    "Failed to resolve the application data directory",
                )
            })?;
        Ok(Self {
            app_data: data.join(APP_DIR_NAME),
            documents: dirs::document_dir(),
            desktop: dirs::desktop_dir(),
        })
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.app_data.join(LOGS_DIR_NAME)
    }
}

fn default_destinations(roots: &HostRoots, include_desktop: bool) -> Vec<PathBuf> {
    let mut out = vec![roots.app_data.join(BACKUP_DIR_NAME)];
    if let Some(docs) = &roots.documents {
        out.push(docs.join(EXTERNAL_BACKUP_DIR_NAME));
    }
    if include_desktop {
        if let Some(desktop) = &roots.desktop {
            out.push(desktop.join(EXTERNAL_BACKUP_DIR_NAME));
        }
    }
    out
}

fn env_number<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|value| value.trim().parse::<T>().ok())
}

fn env_secs(key: &str) -> Option<Duration> {
    env_number::<u64>(key)
        .filter(|value| *value > 0)
        .map(Duration::from_secs)
}

fn env_flag(key: &str) -> bool {
    env::var(key)
        .map(|value| matches!(value.trim(), "1" | "true" | "TRUE" | "yes" | "YES"))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_clamps_retention() {
        let cfg = BackupConfig::new("/data/ledgerbox.db", vec![PathBuf::from("/data/local")])
            .with_max_count(0);
        assert_eq!(cfg.max_count, 1);

        let cfg = cfg.with_max_count(10_000);
        assert_eq!(cfg.max_count, HARD_MAX_COUNT);
    }

    #[test]
    fn builder_refuses_zero_interval() {
        let cfg = BackupConfig::new("/data/ledgerbox.db", vec![PathBuf::from("/data/local")])
            .with_interval(Duration::ZERO);
        assert_eq!(cfg.interval, MIN_INTERVAL);

        let cfg = cfg.with_interval(Duration::from_secs(90));
        assert_eq!(cfg.interval, Duration::from_secs(90));
    }

    #[test]
    fn defaults_match_documented_values() {
        let cfg = BackupConfig::new("/data/ledgerbox.db", vec![PathBuf::from("/data/local")]);
        assert_eq!(cfg.max_count, DEFAULT_MAX_COUNT);
        assert_eq!(cfg.interval, Duration::from_secs(1800));
        assert_eq!(cfg.startup_delay, Duration::from_secs(30));
        assert_eq!(cfg.file_prefix, "ledgerbox");
        assert!(!cfg.verify_sha256);
        assert_eq!(cfg.log_dir(), Some(Path::new("/data/local")));
    }

    #[test]
    fn default_destinations_skip_desktop_unless_requested() {
        let roots = HostRoots {
            app_data: PathBuf::from("/app"),
            documents: Some(PathBuf::from("/docs")),
            desktop: Some(PathBuf::from("/desk")),
        };
        let without = default_destinations(&roots, false);
        assert_eq!(
            without,
            vec![
                PathBuf::from("/app/backups"),
                PathBuf::from("/docs/LedgerBox Backups"),
            ]
        );
        let with = default_destinations(&roots, true);
        assert_eq!(with.len(), 3);
        assert_eq!(with[2], PathBuf::from("/desk/LedgerBox Backups"));
    }

    #[test]
    fn missing_documents_dir_leaves_primary_destination() {
        let roots = HostRoots {
            app_data: PathBuf::from("/app"),
            documents: None,
            desktop: None,
        };
        assert_eq!(
            default_destinations(&roots, true),
            vec![PathBuf::from("/app/backups")]
        );
    }
}
