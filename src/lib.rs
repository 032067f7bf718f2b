//! Local snapshot backups for the ledgerbox accounting database.
//!
//! The host application builds a [`config::BackupConfig`], wraps it in a
//! [`backup::BackupCoordinator`] and hands that to
//! [`backup::scheduler::BackupScheduler::start`] at startup. On exit it calls
//! `shutdown_with_final_backup` on the scheduler.

pub mod backup;
pub mod config;
pub mod error;
mod logging;

pub use backup::{BackupCoordinator, BackupOutcome, BackupTag};
pub use error::{AppError, AppResult};
pub use logging::{flush_file_logs, init_logging};
