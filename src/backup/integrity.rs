use std::path::Path;

use rusqlite::{Connection, OpenFlags};

use crate::{AppError, AppResult};

/// Open `path` read-only and run `PRAGMA quick_check`. Anything other than a
/// single `ok` row is reported as `RESTORE/CORRUPT_SNAPSHOT`.
pub fn quick_check(path: &Path) -> AppResult<()> {
    let flags = OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX;
    let conn = Connection::open_with_flags(path, flags).map_err(|err| {
        AppError::new("RESTORE/CORRUPT_SNAPSHOT", "Snapshot could not be opened as a database")
            .with_context("path", path.display().to_string())
            .with_cause(err)
    })?;

    let problems = collect_quick_check(&conn).map_err(|err| {
        AppError::new("RESTORE/CORRUPT_SNAPSHOT", "Snapshot is not a readable database")
            .with_context("path", path.display().to_string())
            .with_cause(err)
    })?;

    if let Err((_, err)) = conn.close() {
        tracing::debug!(target: "ledgerbox", event = "quick_check_close_failed", error = %err);
    }

    if problems.is_empty() {
        return Ok(());
    }
    Err(
        AppError::new("RESTORE/CORRUPT_SNAPSHOT", "Snapshot failed the integrity check")
            .with_context("path", path.display().to_string())
            .with_context("details", problems.join("; ")),
    )
}

fn collect_quick_check(conn: &Connection) -> rusqlite::Result<Vec<String>> {
    let mut stmt = conn.prepare("PRAGMA quick_check")?;
    let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
    let mut problems = Vec::new();
    for row in rows {
        let line = row?;
        if !line.eq_ignore_ascii_case("ok") {
            problems.push(line);
        }
    }
    Ok(problems)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn accepts_a_real_database() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("snap.db");
        let conn = Connection::open(&path).unwrap();
        conn.execute_batch(
            "CREATE TABLE parties(id INTEGER PRIMARY KEY, name TEXT);
             INSERT INTO parties(name) VALUES ('Acme Traders');",
        )
        .unwrap();
        drop(conn);

        quick_check(&path).unwrap();
    }

    #[test]
    fn rejects_arbitrary_bytes() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("garbage.db");
        std::fs::write(&path, vec![0x42_u8; 4096]).unwrap();

        let err = quick_check(&path).unwrap_err();
        assert_eq!(err.code(), "RESTORE/CORRUPT_SNAPSHOT");
    }
}
