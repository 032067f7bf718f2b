use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, SecondsFormat, Utc};

use super::naming::BackupTag;

pub const LOG_FILE_NAME: &str = "backup.log";

/// One line of the backup log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalEntry {
    pub at: DateTime<Utc>,
    pub tag: BackupTag,
    pub file_name: String,
    pub succeeded: usize,
    pub total: usize,
}

impl JournalEntry {
    pub fn render(&self) -> String {
        format!(
            "{} [{}] {} {}/{}",
            self.at.to_rfc3339_opts(SecondsFormat::Millis, true),
            self.tag,
            self.file_name,
            self.succeeded,
            self.total
        )
    }
}

pub fn log_path(dir: &Path) -> PathBuf {
    dir.join(LOG_FILE_NAME)
}

/// Append `entry` to the log in `dir`. Existing lines are never rewritten.
pub fn append(dir: &Path, entry: &JournalEntry) -> io::Result<()> {
    fs::create_dir_all(dir)?;
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path(dir))?;
    writeln!(file, "{}", entry.render())?;
    file.flush()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::tempdir;

    fn entry(tag: BackupTag, succeeded: usize) -> JournalEntry {
        JournalEntry {
            at: Utc.with_ymd_and_hms(2026, 10, 19, 9, 0, 0).unwrap(),
            tag,
            file_name: format!("ledgerbox_{tag}_2026-10-19T09-00-00-000Z.db"),
            succeeded,
            total: 2,
        }
    }

    #[test]
    fn renders_tag_file_and_ratio() {
        assert_eq!(
            entry(BackupTag::Manual, 2).render(),
            "2026-10-19T09:00:00.000Z [manual] ledgerbox_manual_2026-10-19T09-00-00-000Z.db 2/2"
        );
    }

    #[test]
    fn appends_without_rewriting() {
        let tmp = tempdir().unwrap();
        let dir = tmp.path().join("backups");
        append(&dir, &entry(BackupTag::Auto, 2)).unwrap();
        append(&dir, &entry(BackupTag::Emergency, 1)).unwrap();

        let contents = fs::read_to_string(log_path(&dir)).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("[auto]") && lines[0].ends_with("2/2"));
        assert!(lines[1].contains("[emergency]") && lines[1].ends_with("1/2"));
    }
}
