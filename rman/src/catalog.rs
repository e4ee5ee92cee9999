//! Backup catalog: the flock-guarded `rman.lock`, per-backup `backup.ini`
//! records, directory listing, and the "last completed backup of kind"
//! lookups the backup engine and restore planner both depend on.

use std::fs::{File, OpenOptions};
use std::io::Write as _;

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use fs2::FileExt;

use crate::ini;
use crate::model::{BackupMode, BackupRecord, BackupStatus, BYTES_INVALID};
use utils::error::{corrupted, system_error, RmanResult};
use utils::lsn::Lsn;

pub const BACKUP_INI_FILE: &str = "backup.ini";
pub const LOCK_FILE: &str = "rman.lock";
pub const SYSTEM_IDENTIFIER_FILE: &str = "system-identifier";
pub const RESTORE_WORK_DIR: &str = "pg_xlog.backup";
pub const TIMELINE_HISTORY_DIR: &str = "timeline_history";
pub const DATABASE_FILE_LIST: &str = "file_database.txt";
pub const ARCLOG_FILE_LIST: &str = "file_arclog.txt";
pub const SRVLOG_FILE_LIST: &str = "file_srvlog.txt";
pub const MKDIRS_SH_FILE: &str = "mkdirs.sh";
pub const PG_WAL_DIR_NAME: &str = "pg_wal";

/// Holds the catalog's advisory lock for the lifetime of the guard;
/// releasing is implicit on drop (close unlocks).
pub struct CatalogLock {
    _file: File,
}

/// Takes the non-blocking exclusive lock on `<root>/rman.lock`. A second
/// rman process racing to take a backup on the same catalog gets
/// `already_running` rather than blocking.
pub fn lock(root: &Utf8Path) -> RmanResult<CatalogLock> {
    let path = root.join(LOCK_FILE);
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(&path)
        .map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                corrupted(format!("catalog lock file missing: {path}"))
            } else {
                system_error(format!("opening {path}: {e}"))
            }
        })?;
    match file.try_lock_exclusive() {
        Ok(()) => Ok(CatalogLock { _file: file }),
        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
            Err(utils::error::already_running("another rman process holds the catalog lock"))
        }
        Err(e) => Err(system_error(format!("locking {path}: {e}"))),
    }
}

/// Ensures `<root>/rman.lock` exists (created once by `init`).
pub fn ensure_lock_file(root: &Utf8Path) -> RmanResult<()> {
    let path = root.join(LOCK_FILE);
    if !path.exists() {
        File::create(&path).map_err(|e| system_error(format!("creating {path}: {e}")))?;
    }
    Ok(())
}

/// Directory layout: `<root>/YYYYMMDD/HHMMSS/`.
pub fn backup_dirs(root: &Utf8Path) -> RmanResult<Vec<Utf8PathBuf>> {
    let mut out = Vec::new();
    for date_entry in std::fs::read_dir(root).map_err(|e| system_error(format!("reading {root}: {e}")))? {
        let date_entry = date_entry.map_err(|e| system_error(format!("reading {root}: {e}")))?;
        let date_name = date_entry.file_name();
        let date_name = date_name.to_string_lossy();
        if !date_entry.path().is_dir() || date_name.starts_with('.') {
            continue;
        }
        if date_name == RESTORE_WORK_DIR || date_name == TIMELINE_HISTORY_DIR {
            continue;
        }
        if date_name.len() != 8 || !date_name.bytes().all(|b| b.is_ascii_digit()) {
            continue;
        }
        let date_path = Utf8PathBuf::try_from(date_entry.path())
            .map_err(|e| system_error(format!("non-UTF8 path: {e}")))?;
        for time_entry in
            std::fs::read_dir(&date_path).map_err(|e| system_error(format!("reading {date_path}: {e}")))?
        {
            let time_entry = time_entry.map_err(|e| system_error(format!("reading {date_path}: {e}")))?;
            let time_name = time_entry.file_name();
            let time_name = time_name.to_string_lossy();
            if !time_entry.path().is_dir() || time_name.starts_with('.') {
                continue;
            }
            if time_name.len() != 6 || !time_name.bytes().all(|b| b.is_ascii_digit()) {
                continue;
            }
            out.push(date_path.join(time_name.as_ref()));
        }
    }
    out.sort();
    Ok(out)
}

/// Lists every record in the catalog, sorted descending by start time (the
/// newest backup first).
pub fn list(root: &Utf8Path) -> RmanResult<Vec<BackupRecord>> {
    let mut out = Vec::new();
    for dir in backup_dirs(root)? {
        let ini_path = dir.join(BACKUP_INI_FILE);
        if !ini_path.exists() {
            continue;
        }
        match read(&ini_path) {
            Ok(record) => out.push(record),
            Err(_) => continue, // a corrupted backup.ini is silently skipped by listing
        }
    }
    out.sort_by(|a, b| b.start_time.cmp(&a.start_time));
    Ok(out)
}

/// `backups` must already be sorted descending by start time, as returned
/// by `list`.
pub fn last_data_backup(backups: &[BackupRecord]) -> Option<&BackupRecord> {
    backups.iter().find(|b| b.status == BackupStatus::Ok && b.mode.have_database())
}

pub fn last_arclog_backup(backups: &[BackupRecord]) -> Option<&BackupRecord> {
    backups.iter().find(|b| b.status == BackupStatus::Ok && b.mode.have_arclog())
}

pub fn last_srvlog_backup(backups: &[BackupRecord]) -> Option<&BackupRecord> {
    backups.iter().find(|b| b.status == BackupStatus::Ok && b.with_serverlog)
}

fn bool_str(b: bool) -> &'static str {
    if b {
        "true"
    } else {
        "false"
    }
}

fn format_lsn_hex(lsn: Lsn) -> String {
    let (hi, lo) = lsn.segments();
    format!("{hi:x}/{lo:08x}")
}

fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.format("%Y-%m-%d %H:%M:%S").to_string()
}

fn parse_timestamp(s: &str) -> RmanResult<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
        .map(|naive| Utc.from_utc_datetime(&naive))
        .map_err(|e| corrupted(format!("invalid timestamp {s:?}: {e}")))
}

/// Renders `backup.ini`'s two sections from a record.
pub fn render(record: &BackupRecord) -> String {
    let mut w = ini::Writer::new();
    w.section("configuration");
    w.kv("BACKUP_MODE", record.mode.as_str());
    w.kv("FULL_BACKUP_ON_ERROR", bool_str(record.full_backup_on_error));
    w.kv("WITH_SERVERLOG", bool_str(record.with_serverlog));
    w.kv("COMPRESS_DATA", bool_str(record.compress_data));
    w.blank();

    w.section("result");
    w.kv("TIMELINEID", record.tli);
    w.kv("START_LSN", format_lsn_hex(record.start_lsn));
    w.kv("STOP_LSN", format_lsn_hex(record.stop_lsn));
    w.kv("START_TIME", format_timestamp(record.start_time));
    if let Some(end) = record.end_time {
        w.kv("END_TIME", format_timestamp(end));
    }
    w.kv("RECOVERY_XID", record.recovery_xid);
    if let Some(recovery) = record.recovery_time {
        w.kv("RECOVERY_TIME", format_timestamp(recovery));
    }
    if record.total_data_bytes != BYTES_INVALID {
        w.kv("TOTAL_DATA_BYTES", record.total_data_bytes);
    }
    if record.read_data_bytes != BYTES_INVALID {
        w.kv("READ_DATA_BYTES", record.read_data_bytes);
    }
    if record.read_arclog_bytes != BYTES_INVALID {
        w.kv("READ_ARCLOG_BYTES", record.read_arclog_bytes);
    }
    if record.read_srvlog_bytes != BYTES_INVALID {
        w.kv("READ_SRVLOG_BYTES", record.read_srvlog_bytes);
    }
    if record.write_bytes != BYTES_INVALID {
        w.kv("WRITE_BYTES", record.write_bytes);
    }
    w.kv("BLOCK_SIZE", record.block_size);
    w.kv("XLOG_BLOCK_SIZE", record.wal_block_size);
    w.kv("STATUS", record.status.as_str());
    w.finish()
}

/// Writes `backup.ini` atomically (tmp-write, fsync, rename).
pub fn write(dir: &Utf8Path, record: &BackupRecord) -> RmanResult<()> {
    let path = dir.join(BACKUP_INI_FILE);
    let text = render(record);
    utils::crashsafe::overwrite(&path, text.as_bytes())
        .map_err(|e| system_error(format!("writing {path}: {e}")))
}

/// Parses a `backup.ini` file back into a record.
pub fn read(path: &Utf8Path) -> RmanResult<BackupRecord> {
    let text = std::fs::read_to_string(path).map_err(|e| system_error(format!("reading {path}: {e}")))?;
    let map = ini::parse(&text)?;

    let get = |key: &str| map.get(key).map(|s| s.as_str());

    let mode = get("BACKUP_MODE")
        .map(|s| s.parse::<BackupMode>())
        .transpose()
        .map_err(|e| corrupted(format!("{path}: {e}")))?
        .ok_or_else(|| corrupted(format!("{path}: missing BACKUP_MODE")))?;

    let status = get("STATUS")
        .map(|s| s.parse::<BackupStatus>())
        .transpose()
        .map_err(|e| corrupted(format!("{path}: {e}")))?
        .unwrap_or(BackupStatus::Invalid);

    let tli = get("TIMELINEID").and_then(|s| s.parse().ok()).unwrap_or(0);
    let start_lsn = get("START_LSN").and_then(|s| s.parse::<Lsn>().ok()).unwrap_or(Lsn::INVALID);
    let stop_lsn = get("STOP_LSN").and_then(|s| s.parse::<Lsn>().ok()).unwrap_or(Lsn::INVALID);

    let start_time = get("START_TIME")
        .map(parse_timestamp)
        .transpose()?
        .ok_or_else(|| corrupted(format!("{path}: missing START_TIME")))?;
    let end_time = get("END_TIME").map(parse_timestamp).transpose()?;
    let recovery_time = get("RECOVERY_TIME").map(parse_timestamp).transpose()?;
    let recovery_xid = get("RECOVERY_XID").and_then(|s| s.parse().ok()).unwrap_or(0);

    let int_or_invalid = |key: &str| get(key).and_then(|s| s.parse().ok()).unwrap_or(BYTES_INVALID);

    Ok(BackupRecord {
        mode,
        status,
        tli,
        start_lsn,
        stop_lsn,
        start_time,
        end_time,
        recovery_time,
        recovery_xid,
        total_data_bytes: int_or_invalid("TOTAL_DATA_BYTES"),
        read_data_bytes: int_or_invalid("READ_DATA_BYTES"),
        read_arclog_bytes: int_or_invalid("READ_ARCLOG_BYTES"),
        read_srvlog_bytes: int_or_invalid("READ_SRVLOG_BYTES"),
        write_bytes: int_or_invalid("WRITE_BYTES"),
        block_size: get("BLOCK_SIZE").and_then(|s| s.parse().ok()).unwrap_or(0),
        wal_block_size: get("XLOG_BLOCK_SIZE").and_then(|s| s.parse().ok()).unwrap_or(0),
        with_serverlog: get("WITH_SERVERLOG").map(|s| s == "true").unwrap_or(false),
        compress_data: get("COMPRESS_DATA").map(|s| s == "true").unwrap_or(false),
        full_backup_on_error: get("FULL_BACKUP_ON_ERROR").map(|s| s == "true").unwrap_or(false),
    })
}

/// Creates `<root>/YYYYMMDD/HHMMSS/{database,arclog,srvlog}`.
pub fn create_backup_dirs(root: &Utf8Path, record: &BackupRecord) -> RmanResult<()> {
    for dir in [record.database_dir(root), record.arclog_dir(root), record.srvlog_dir(root)] {
        utils::crashsafe::create_dir_all(&dir).map_err(|e| system_error(format!("creating {dir}: {e}")))?;
    }
    Ok(())
}

/// Writes `<root>/system-identifier`, the catalog-wide pin against the
/// cluster's `pg_control` system identifier.
pub fn write_system_identifier(root: &Utf8Path, system_identifier: u64) -> RmanResult<()> {
    let path = root.join(SYSTEM_IDENTIFIER_FILE);
    let mut f = File::create(&path).map_err(|e| system_error(format!("creating {path}: {e}")))?;
    writeln!(f, "SYSTEM_IDENTIFIER={system_identifier}")
        .map_err(|e| system_error(format!("writing {path}: {e}")))
}

/// Reads `<root>/system-identifier` and fails loudly if it doesn't match
/// the cluster the caller is about to back up or restore against.
pub fn check_system_identifier(root: &Utf8Path, controlfile_identifier: u64) -> RmanResult<()> {
    let path = root.join(SYSTEM_IDENTIFIER_FILE);
    let text = std::fs::read_to_string(&path).map_err(|e| system_error(format!("reading {path}: {e}")))?;
    let catalog_identifier: u64 = text
        .lines()
        .find_map(|line| line.strip_prefix("SYSTEM_IDENTIFIER=")?.trim().parse().ok())
        .ok_or_else(|| corrupted(format!("{path}: missing SYSTEM_IDENTIFIER")))?;

    if catalog_identifier != controlfile_identifier {
        return Err(system_error(
            "system identifier of target database differs from the one this catalog was initialized against",
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::BackupRecord;

    fn sample() -> BackupRecord {
        let mut r = BackupRecord::new_running(
            BackupMode::Full,
            3,
            DateTime::parse_from_rfc3339("2026-07-28T09:30:05Z").unwrap().with_timezone(&Utc),
        );
        r.status = BackupStatus::Ok;
        r.start_lsn = Lsn(0x1_6001B8);
        r.stop_lsn = Lsn(0x1_60A000);
        r.end_time = Some(DateTime::parse_from_rfc3339("2026-07-28T09:31:00Z").unwrap().with_timezone(&Utc));
        r.total_data_bytes = 4096;
        r.write_bytes = 2048;
        r
    }

    #[test]
    fn render_and_read_round_trip() {
        let dir = camino_tempfile::tempdir().unwrap();
        let rec = sample();
        write(dir.path(), &rec).unwrap();
        let back = read(&dir.path().join(BACKUP_INI_FILE)).unwrap();
        assert_eq!(back.mode, rec.mode);
        assert_eq!(back.status, rec.status);
        assert_eq!(back.start_lsn, rec.start_lsn);
        assert_eq!(back.stop_lsn, rec.stop_lsn);
        assert_eq!(back.total_data_bytes, rec.total_data_bytes);
        assert_eq!(back.write_bytes, rec.write_bytes);
        assert_eq!(back.read_data_bytes, BYTES_INVALID);
    }

    #[test]
    fn last_of_kind_picks_most_recent_ok() {
        let mut older = sample();
        older.mode = BackupMode::Full;
        let mut newer = sample();
        newer.mode = BackupMode::Incremental;
        newer.start_time = older.start_time + chrono::Duration::hours(1);

        let list = vec![newer.clone(), older];
        let found = last_data_backup(&list).unwrap();
        assert_eq!(found.start_time, newer.start_time);
    }

    #[test]
    fn last_of_kind_skips_non_ok() {
        let mut rec = sample();
        rec.status = BackupStatus::Error;
        assert!(last_data_backup(&[rec]).is_none());
    }

    #[test]
    fn list_is_sorted_descending_by_start_time() {
        let dir = camino_tempfile::tempdir().unwrap();
        let root = dir.path();

        let mut older = sample();
        older.start_time = DateTime::parse_from_rfc3339("2026-07-27T09:30:05Z").unwrap().with_timezone(&Utc);
        let mut newer = sample();
        newer.start_time = DateTime::parse_from_rfc3339("2026-07-28T09:30:05Z").unwrap().with_timezone(&Utc);

        for rec in [&older, &newer] {
            let dir = rec.path(root);
            std::fs::create_dir_all(&dir).unwrap();
            write(&dir, rec).unwrap();
        }

        let backups = list(root).unwrap();
        assert_eq!(backups.len(), 2);
        assert_eq!(backups[0].start_time, newer.start_time);
        assert_eq!(backups[1].start_time, older.start_time);
    }

    #[test]
    fn backup_dirs_filters_reserved_names() {
        let dir = camino_tempfile::tempdir().unwrap();
        let root = dir.path();
        std::fs::create_dir_all(root.join("20260728/093005")).unwrap();
        std::fs::create_dir_all(root.join(RESTORE_WORK_DIR)).unwrap();
        std::fs::create_dir_all(root.join(TIMELINE_HISTORY_DIR)).unwrap();
        std::fs::write(root.join("somefile"), b"x").unwrap();

        let dirs = backup_dirs(root).unwrap();
        assert_eq!(dirs, vec![root.join("20260728/093005")]);
    }

    #[test]
    fn system_identifier_mismatch_is_rejected() {
        let dir = camino_tempfile::tempdir().unwrap();
        write_system_identifier(dir.path(), 12345).unwrap();
        assert!(check_system_identifier(dir.path(), 12345).is_ok());
        assert!(check_system_identifier(dir.path(), 99999).is_err());
    }
}
