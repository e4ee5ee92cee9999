//! Retention / purge engine: decides which catalog entries may be
//! deleted under a generations-and-days policy, then removes their
//! on-disk files and flips their status to `DELETED`.
//!
//! Mirrors two related but distinct operations: an explicit
//! `delete <date>` (keep every backup needed for PITR up to a given
//! boundary, regardless of policy) and the scheduled
//! `keep_generations`/`keep_days` purge run after every successful
//! backup.

use std::fs;
use std::io::Read;

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Duration, TimeZone, Utc};

use crate::catalog;
use crate::model::{BackupMode, BackupRecord, BackupStatus};
use pg_types::page::BLCKSZ;
use pg_types::walnaming::{is_wal_filename_shape, looks_like_wal_segment};
use utils::error::{system_error, RmanResult};

pub const KEEP_INFINITE: i64 = -1;

/// A log stream subject to the `keep_files`/`keep_days` pass: archive-log
/// entries are additionally gated on looking like a complete WAL segment,
/// server-log entries are not.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogStream {
    Archive,
    Server,
}

#[derive(Clone, Copy, Debug)]
pub struct RetentionPolicy {
    pub keep_generations: Option<u32>,
    pub keep_days: Option<i64>,
}

impl RetentionPolicy {
    pub fn none() -> RetentionPolicy {
        RetentionPolicy {
            keep_generations: None,
            keep_days: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.keep_generations.is_some() || self.keep_days.is_some()
    }

    /// Midnight UTC, `keep_days` days back from `now`; any backup started
    /// strictly before this instant is a candidate for the day-based cut.
    fn keep_after(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.keep_days.map(|days| {
            let naive = (now - Duration::days(days)).date_naive().and_hms_opt(0, 0, 0).unwrap();
            Utc.from_utc_datetime(&naive)
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verdict {
    Keep,
    Delete,
}

/// Plans which of `backups_desc` (newest start time first) to delete
/// under `policy`. `exclude_start_time` is the backup just produced by
/// the run that triggered this purge (excluded from the generation
/// count, per the "just taken" rule).
pub fn plan(
    backups_desc: &[BackupRecord],
    policy: &RetentionPolicy,
    now: DateTime<Utc>,
    exclude_start_time: Option<DateTime<Utc>>,
) -> Vec<Verdict> {
    let mut out = Vec::with_capacity(backups_desc.len());
    let mut existed_generations: u32 = 0;
    let mut check_generations = policy.keep_generations.is_some();
    let keep_generations = policy.keep_generations.unwrap_or(0);
    let mut check_days = policy.keep_days.is_some();
    let keep_after = policy.keep_after(now);
    let mut last_checked_is_valid_full_backup = false;

    for backup in backups_desc {
        let is_just_taken = exclude_start_time == Some(backup.start_time) && backup.status == BackupStatus::Done;

        if check_generations {
            if existed_generations < keep_generations {
                if is_just_taken {
                    out.push(Verdict::Keep);
                    continue;
                }
                if backup.mode == BackupMode::Full && backup.status == BackupStatus::Ok {
                    existed_generations += 1;
                }
                // Incremental/archive OK backups ride along with the
                // generation they precede; anything else just isn't
                // counted, but is still kept during this phase.
                out.push(Verdict::Keep);
                continue;
            } else {
                last_checked_is_valid_full_backup = true;
                check_generations = false;
            }
        }

        if check_days {
            let Some(keep_after) = keep_after else {
                check_days = false;
                out.push(Verdict::Keep);
                continue;
            };

            if backup.start_time >= keep_after || !last_checked_is_valid_full_backup {
                if is_just_taken {
                    out.push(Verdict::Keep);
                    continue;
                }
                if backup.status == BackupStatus::Ok {
                    if backup.mode == BackupMode::Full {
                        last_checked_is_valid_full_backup = true;
                    } else {
                        last_checked_is_valid_full_backup = false;
                    }
                }
                out.push(Verdict::Keep);
                continue;
            }
        }

        out.push(Verdict::Delete);
    }

    out
}

/// Phase one of removal: set status=DELETING, remove the manifest-listed
/// files (the `database`/`arclog`/`srvlog` subtrees), set status=DELETED.
/// The backup's own directory (`backup.ini`, file lists) survives this
/// phase; `purge_deleted` removes it later. A backup already `DELETED`
/// is a no-op, not an error — delete runs are expected to be re-entrant
/// after a prior interruption.
pub fn delete_backup_files(root: &Utf8Path, backup: &mut BackupRecord) -> RmanResult<()> {
    if backup.status == BackupStatus::Deleted {
        return Ok(());
    }

    backup.status = BackupStatus::Deleting;
    catalog::write(&backup.path(root), backup)?;

    for dir in [backup.database_dir(root), backup.arclog_dir(root), backup.srvlog_dir(root)] {
        if dir.exists() {
            std::fs::remove_dir_all(&dir).map_err(|e| system_error(format!("removing {dir}: {e}")))?;
        }
    }

    backup.status = BackupStatus::Deleted;
    catalog::write(&backup.path(root), backup)?;
    Ok(())
}

/// Phase two of removal: every catalog record with status=DELETED has its
/// own directory (`<root>/YYYYMMDD/HHMMSS`) removed outright, and the
/// `YYYYMMDD` parent is removed too if that was its last child. Idempotent:
/// a second run finds nothing left to do.
pub fn purge_deleted(root: &Utf8Path) -> RmanResult<usize> {
    let mut purged = 0;
    let mut touched_date_dirs: Vec<Utf8PathBuf> = Vec::new();

    for backup in catalog::list(root)? {
        if backup.status != BackupStatus::Deleted {
            continue;
        }
        let dir = backup.path(root);
        if !dir.exists() {
            continue;
        }
        let date_dir = dir
            .parent()
            .map(|p| p.to_path_buf())
            .unwrap_or_else(|| root.to_path_buf());
        fs::remove_dir_all(&dir).map_err(|e| system_error(format!("removing {dir}: {e}")))?;
        purged += 1;
        touched_date_dirs.push(date_dir);
    }

    touched_date_dirs.sort();
    touched_date_dirs.dedup();
    for date_dir in touched_date_dirs {
        let is_empty = fs::read_dir(&date_dir).map(|mut it| it.next().is_none()).unwrap_or(false);
        if is_empty {
            fs::remove_dir(&date_dir).map_err(|e| system_error(format!("removing {date_dir}: {e}")))?;
        }
    }

    Ok(purged)
}

/// Runs `plan` against the full catalog and marks every backup it selects
/// for removal as DELETED, in descending order (leaf backups before the
/// generations they depend on being already gone). Callers that also want
/// the on-disk directories of newly- and previously-DELETED records
/// reclaimed should follow this with `purge_deleted`.
pub fn purge(root: &Utf8Path, policy: &RetentionPolicy, now: DateTime<Utc>) -> RmanResult<usize> {
    if !policy.is_active() {
        return Ok(0);
    }
    let mut backups = catalog::list(root)?;

    let verdicts = plan(&backups, policy, now, None);
    let mut deleted = 0;
    for (backup, verdict) in backups.iter_mut().zip(verdicts) {
        if verdict == Verdict::Delete {
            delete_backup_files(root, backup)?;
            deleted += 1;
        }
    }
    Ok(deleted)
}

/// `delete DATE [--force]`: deletes every OK backup strictly older than
/// `before`, except that the latest OK FULL backup at or before `before`
/// is kept unless `force` is set (it anchors PITR for anything the user
/// might still want to restore up to `before`).
pub fn delete_before(root: &Utf8Path, before: DateTime<Utc>, force: bool) -> RmanResult<usize> {
    let mut backups = catalog::list(root)?; // descending

    let protect_start_time = if force {
        None
    } else {
        backups
            .iter()
            .find(|b| b.status == BackupStatus::Ok && b.mode == BackupMode::Full && b.start_time <= before)
            .map(|b| b.start_time)
    };

    let mut deleted = 0;
    for backup in backups.iter_mut() {
        if backup.status != BackupStatus::Ok || backup.start_time > before {
            continue;
        }
        if Some(backup.start_time) == protect_start_time {
            continue;
        }
        delete_backup_files(root, backup)?;
        deleted += 1;
    }
    Ok(deleted)
}

/// Time/count retention for archive-log or server-log files scattered
/// across every backup's `arclog`/`srvlog` directory, treated as one
/// pool. Sorts by mtime descending, keeps the first `keep_files`
/// regardless of age, and additionally keeps anything newer than
/// `keep_days` back from `now` (rounded to local midnight). A stream of
/// `LogStream::Archive` only considers complete WAL segments eligible —
/// `.history` files and anything that doesn't look like a finished
/// segment is left alone. `keep_files = None` and `keep_days = None`
/// together mean "keep everything"; no files are removed.
pub fn prune_log_stream(
    root: &Utf8Path,
    stream: LogStream,
    keep_files: Option<u32>,
    keep_days: Option<i64>,
    now: DateTime<Utc>,
    wal_seg_size: u64,
) -> RmanResult<usize> {
    if keep_files.is_none() && keep_days.is_none() {
        tracing::debug!(?stream, "log retention policy is infinite, nothing to prune");
        return Ok(0);
    }

    let mut candidates: Vec<(Utf8PathBuf, DateTime<Utc>)> = Vec::new();
    for backup in catalog::list(root)? {
        let dir = match stream {
            LogStream::Archive => backup.arclog_dir(root),
            LogStream::Server => backup.srvlog_dir(root),
        };
        if !dir.exists() {
            continue;
        }
        for entry in fs::read_dir(&dir).map_err(|e| system_error(format!("reading {dir}: {e}")))? {
            let entry = entry.map_err(|e| system_error(format!("reading {dir}: {e}")))?;
            if !entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
                continue;
            }
            let path = Utf8PathBuf::try_from(entry.path()).map_err(|e| system_error(format!("non-UTF8 path: {e}")))?;
            let name = path.file_name().unwrap_or("");
            if stream == LogStream::Archive && !is_complete_wal_segment(&path, name, wal_seg_size)? {
                continue;
            }
            let mtime = entry
                .metadata()
                .and_then(|m| m.modified())
                .map(DateTime::<Utc>::from)
                .map_err(|e| system_error(format!("stat {path}: {e}")))?;
            candidates.push((path, mtime));
        }
    }

    candidates.sort_by(|a, b| b.1.cmp(&a.1));

    let threshold = keep_days.map(|days| {
        let naive = (now - Duration::days(days)).date_naive().and_hms_opt(0, 0, 0).unwrap();
        Utc.from_utc_datetime(&naive)
    });

    let mut removed = 0;
    for (i, (path, mtime)) in candidates.iter().enumerate() {
        if let Some(keep_files) = keep_files {
            if (i as u32) < keep_files {
                continue;
            }
        }
        if let Some(threshold) = threshold {
            if *mtime >= threshold {
                continue;
            }
        }
        fs::remove_file(path).map_err(|e| system_error(format!("removing {path}: {e}")))?;
        removed += 1;
    }
    Ok(removed)
}

fn is_complete_wal_segment(path: &Utf8Path, name: &str, wal_seg_size: u64) -> RmanResult<bool> {
    if !is_wal_filename_shape(name) {
        return Ok(false);
    }
    let mut file = fs::File::open(path).map_err(|e| system_error(format!("opening {path}: {e}")))?;
    let mut block = [0u8; BLCKSZ];
    let mut read = 0;
    loop {
        let n = file
            .read(&mut block[read..])
            .map_err(|e| system_error(format!("reading {path}: {e}")))?;
        if n == 0 {
            break;
        }
        read += n;
        if read == block.len() {
            break;
        }
    }
    Ok(looks_like_wal_segment(&block[..read], wal_seg_size))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backup_at(mode: BackupMode, status: BackupStatus, days_ago: i64, now: DateTime<Utc>) -> BackupRecord {
        let mut b = BackupRecord::new_running(mode, 1, now - Duration::days(days_ago));
        b.status = status;
        b
    }

    #[test]
    fn keeps_within_generation_count() {
        let now = Utc::now();
        let backups = vec![
            backup_at(BackupMode::Incremental, BackupStatus::Ok, 1, now),
            backup_at(BackupMode::Full, BackupStatus::Ok, 2, now),
            backup_at(BackupMode::Incremental, BackupStatus::Ok, 10, now),
            backup_at(BackupMode::Full, BackupStatus::Ok, 11, now),
        ];
        let policy = RetentionPolicy {
            keep_generations: Some(1),
            keep_days: None,
        };
        let verdicts = plan(&backups, &policy, now, None);
        // Only the first full backup and everything newer than it survive;
        // the second generation's full + its incremental are deletable.
        assert_eq!(verdicts, vec![Verdict::Keep, Verdict::Keep, Verdict::Delete, Verdict::Delete]);
    }

    #[test]
    fn keeps_backups_newer_than_day_cutoff() {
        let now = Utc::now();
        let backups = vec![
            backup_at(BackupMode::Full, BackupStatus::Ok, 1, now),
            backup_at(BackupMode::Full, BackupStatus::Ok, 30, now),
        ];
        let policy = RetentionPolicy {
            keep_generations: None,
            keep_days: Some(7),
        };
        let verdicts = plan(&backups, &policy, now, None);
        assert_eq!(verdicts, vec![Verdict::Keep, Verdict::Delete]);
    }

    #[test]
    fn excludes_just_taken_backup_from_generation_count() {
        let now = Utc::now();
        let just_taken = backup_at(BackupMode::Full, BackupStatus::Done, 0, now);
        let older_full = backup_at(BackupMode::Full, BackupStatus::Ok, 5, now);
        let backups = vec![just_taken.clone(), older_full];
        let policy = RetentionPolicy {
            keep_generations: Some(1),
            keep_days: None,
        };
        let verdicts = plan(&backups, &policy, now, Some(just_taken.start_time));
        assert_eq!(verdicts, vec![Verdict::Keep, Verdict::Keep]);
    }

    #[test]
    fn inactive_policy_purges_nothing() {
        assert!(!RetentionPolicy::none().is_active());
    }

    #[test]
    fn delete_backup_files_is_idempotent_on_already_deleted() {
        let dir = camino_tempfile::tempdir().unwrap();
        let mut backup = backup_at(BackupMode::Full, BackupStatus::Deleted, 1, Utc::now());
        delete_backup_files(dir.path(), &mut backup).unwrap();
        assert_eq!(backup.status, BackupStatus::Deleted);
    }

    #[test]
    fn purge_deleted_removes_empty_date_parent() {
        let dir = camino_tempfile::tempdir().unwrap();
        let root = dir.path();

        let mut backup = backup_at(BackupMode::Full, BackupStatus::Deleted, 1, Utc::now());
        catalog::create_backup_dirs(root, &backup).unwrap();
        catalog::write(&backup.path(root), &backup).unwrap();
        delete_backup_files(root, &mut backup).unwrap();

        let date_dir = backup.path(root).parent().unwrap().to_path_buf();
        assert!(date_dir.exists());

        let purged = purge_deleted(root).unwrap();
        assert_eq!(purged, 1);
        assert!(!backup.path(root).exists());
        assert!(!date_dir.exists(), "empty YYYYMMDD parent should be cleaned up");

        assert_eq!(purge_deleted(root).unwrap(), 0);
    }

    #[test]
    fn delete_before_protects_latest_full_unless_forced() {
        let dir = camino_tempfile::tempdir().unwrap();
        let root = dir.path();
        let now = Utc::now();

        let mut a = backup_at(BackupMode::Full, BackupStatus::Ok, 30, now);
        let mut b = backup_at(BackupMode::Full, BackupStatus::Ok, 20, now);
        let mut c = backup_at(BackupMode::Full, BackupStatus::Ok, 10, now);
        let mut d = backup_at(BackupMode::Incremental, BackupStatus::Ok, 5, now);
        for rec in [&mut a, &mut b, &mut c, &mut d] {
            catalog::create_backup_dirs(root, rec).unwrap();
            catalog::write(&rec.path(root), rec).unwrap();
        }

        let before = b.start_time;
        let deleted = delete_before(root, before, false).unwrap();
        // a is strictly older than b and not the protected record, so it goes;
        // b is the latest OK FULL at-or-before `before` and is protected.
        assert_eq!(deleted, 1);
        let after = catalog::list(root).unwrap();
        let b_rec = after.iter().find(|r| r.start_time == b.start_time).unwrap();
        assert_eq!(b_rec.status, BackupStatus::Ok);
        let a_rec = after.iter().find(|r| r.start_time == a.start_time).unwrap();
        assert_eq!(a_rec.status, BackupStatus::Deleted);

        let deleted = delete_before(root, before, true).unwrap();
        assert_eq!(deleted, 1);
        let after = catalog::list(root).unwrap();
        let b_rec = after.iter().find(|r| r.start_time == b.start_time).unwrap();
        assert_eq!(b_rec.status, BackupStatus::Deleted);
    }

    #[test]
    fn prune_log_stream_keeps_first_n_regardless_of_age() {
        let dir = camino_tempfile::tempdir().unwrap();
        let root = dir.path();
        let now = Utc::now();

        let mut backup = backup_at(BackupMode::Archive, BackupStatus::Ok, 0, now);
        catalog::create_backup_dirs(root, &mut backup).unwrap();
        catalog::write(&backup.path(root), &backup).unwrap();

        let srvlog_dir = backup.srvlog_dir(root);
        for name in ["postgresql-2026-07-01.log", "postgresql-2026-07-15.log", "postgresql-2026-07-28.log"] {
            fs::write(srvlog_dir.join(name), b"x").unwrap();
        }

        let removed = prune_log_stream(root, LogStream::Server, Some(2), None, now, 16 * 1024 * 1024).unwrap();
        assert_eq!(removed, 1);
        let remaining: Vec<_> = fs::read_dir(&srvlog_dir).unwrap().collect();
        assert_eq!(remaining.len(), 2);
    }
}
