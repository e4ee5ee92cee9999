//! `validate [DATE]`: re-walks a backup's manifested files, recomputes
//! their checksums, and flips `status` between `OK` and `CORRUPT`
//! depending on what it finds. A backup is never trusted for restore
//! unless every manifested file validates.

use camino::Utf8Path;
use chrono::{DateTime, Utc};

use crate::catalog;
use crate::manifest;
use crate::model::{BackupRecord, BackupStatus};
use utils::error::{no_backup, system_error, RmanResult};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    Ok,
    Corrupt { first_bad_file: camino::Utf8PathBuf },
}

/// Validates one record in place: reads `file_database.txt` (and
/// `file_arclog.txt`/`file_srvlog.txt` when present), recomputes crc32c
/// for every listed file, and writes back `status = Ok` or `Corrupt`.
pub fn validate_one(root: &Utf8Path, backup: &mut BackupRecord) -> RmanResult<Outcome> {
    let lists = [
        (catalog::DATABASE_FILE_LIST, backup.database_dir(root)),
        (catalog::ARCLOG_FILE_LIST, backup.arclog_dir(root)),
        (catalog::SRVLOG_FILE_LIST, backup.srvlog_dir(root)),
    ];

    for (list_name, dir) in lists {
        let list_path = backup.path(root).join(list_name);
        if !list_path.exists() {
            continue;
        }
        let text = std::fs::read_to_string(&list_path).map_err(|e| system_error(format!("reading {list_path}: {e}")))?;
        let entries = manifest::read_manifest(&text, Some(&dir))?;
        if let Some(bad) = manifest::verify_entries(root, &entries)? {
            backup.status = BackupStatus::Corrupt;
            catalog::write(&backup.path(root), backup)?;
            return Ok(Outcome::Corrupt { first_bad_file: bad });
        }
    }

    backup.status = BackupStatus::Ok;
    catalog::write(&backup.path(root), backup)?;
    Ok(Outcome::Ok)
}

/// `validate [DATE]`: validates a single record, or every record in the
/// catalog when `at` is `None`.
pub fn validate(root: &Utf8Path, at: Option<DateTime<Utc>>) -> RmanResult<Vec<(BackupRecord, Outcome)>> {
    let mut backups = catalog::list(root)?;
    match at {
        Some(at) => {
            let idx = backups
                .iter()
                .position(|b| b.start_time == at)
                .ok_or_else(|| no_backup(format!("no backup found with start time {at}")))?;
            let outcome = validate_one(root, &mut backups[idx])?;
            Ok(vec![(backups.swap_remove(idx), outcome)])
        }
        None => {
            let mut out = Vec::with_capacity(backups.len());
            for mut backup in backups {
                let outcome = validate_one(root, &mut backup)?;
                out.push((backup, outcome));
            }
            Ok(out)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::BackupMode;

    fn sample(root: &Utf8Path) -> BackupRecord {
        let mut r = BackupRecord::new_running(BackupMode::Full, 1, Utc::now());
        r.status = BackupStatus::Done;
        catalog::create_backup_dirs(root, &r).unwrap();
        catalog::write(&r.path(root), &r).unwrap();
        r
    }

    #[test]
    fn validate_marks_ok_when_no_file_lists_present() {
        let dir = camino_tempfile::tempdir().unwrap();
        let root = dir.path();
        let mut r = sample(root);
        let outcome = validate_one(root, &mut r).unwrap();
        assert_eq!(outcome, Outcome::Ok);
        assert_eq!(r.status, BackupStatus::Ok);
    }

    #[test]
    fn validate_detects_corrupted_file() {
        let dir = camino_tempfile::tempdir().unwrap();
        let root = dir.path();
        let mut r = sample(root);

        let database_dir = r.database_dir(root);
        std::fs::write(database_dir.join("base1"), b"original").unwrap();
        let entry = manifest::ManifestEntry {
            path: database_dir.join("base1"),
            kind: manifest::EntryType::Regular,
            write_size: 8,
            crc: crc32c::crc32c(b"original"),
            mode: 0o600,
            mtime: Utc::now(),
            linked_path: None,
        };
        let text = manifest::write_manifest(&[entry], &database_dir);
        std::fs::write(r.path(root).join(catalog::DATABASE_FILE_LIST), text).unwrap();

        std::fs::write(database_dir.join("base1"), b"tampered").unwrap();

        let outcome = validate_one(root, &mut r).unwrap();
        assert!(matches!(outcome, Outcome::Corrupt { .. }));
        assert_eq!(r.status, BackupStatus::Corrupt);
    }
}
