//! The backup record data model.

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use utils::lsn::Lsn;

/// Sentinel for a byte count that wasn't copied this run (incremental
/// skip, or "not backed up yet").
pub const BYTES_INVALID: i64 = -1;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum BackupMode {
    /// Archived WAL only, no data files.
    Archive,
    /// Data-file delta against the preceding full-or-incremental.
    Incremental,
    /// Full copy of every data file.
    Full,
}

impl BackupMode {
    /// `HAVE_DATABASE`: a record at this mode or above carries data files.
    pub fn have_database(self) -> bool {
        self >= BackupMode::Incremental
    }

    /// `HAVE_ARCLOG`: a record at this mode or above carries archived WAL.
    pub fn have_arclog(self) -> bool {
        self >= BackupMode::Archive
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BackupMode::Archive => "ARCHIVE",
            BackupMode::Incremental => "INCREMENTAL",
            BackupMode::Full => "FULL",
        }
    }
}

impl std::str::FromStr for BackupMode {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "ARCHIVE" => Ok(BackupMode::Archive),
            "INCREMENTAL" => Ok(BackupMode::Incremental),
            "FULL" => Ok(BackupMode::Full),
            _ => anyhow::bail!("unknown backup mode '{s}'"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BackupStatus {
    Invalid,
    Ok,
    Running,
    Error,
    Deleting,
    Deleted,
    Done,
    Corrupt,
}

impl BackupStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            BackupStatus::Invalid => "INVALID",
            BackupStatus::Ok => "OK",
            BackupStatus::Running => "RUNNING",
            BackupStatus::Error => "ERROR",
            BackupStatus::Deleting => "DELETING",
            BackupStatus::Deleted => "DELETED",
            BackupStatus::Done => "DONE",
            BackupStatus::Corrupt => "CORRUPT",
        }
    }
}

impl std::str::FromStr for BackupStatus {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "INVALID" => Ok(BackupStatus::Invalid),
            "OK" => Ok(BackupStatus::Ok),
            "RUNNING" => Ok(BackupStatus::Running),
            "ERROR" => Ok(BackupStatus::Error),
            "DELETING" => Ok(BackupStatus::Deleting),
            "DELETED" => Ok(BackupStatus::Deleted),
            "DONE" => Ok(BackupStatus::Done),
            "CORRUPT" => Ok(BackupStatus::Corrupt),
            _ => anyhow::bail!("unknown backup status '{s}'"),
        }
    }
}

/// A single catalog entry, identified by its start time. Cloned freely;
/// the catalog is the only writer of a record's on-disk form.
#[derive(Clone, Debug)]
pub struct BackupRecord {
    pub mode: BackupMode,
    pub status: BackupStatus,
    pub tli: u32,
    pub start_lsn: Lsn,
    pub stop_lsn: Lsn,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub recovery_time: Option<DateTime<Utc>>,
    pub recovery_xid: u32,
    pub total_data_bytes: i64,
    pub read_data_bytes: i64,
    pub read_arclog_bytes: i64,
    pub read_srvlog_bytes: i64,
    pub write_bytes: i64,
    pub block_size: u32,
    pub wal_block_size: u32,
    pub with_serverlog: bool,
    pub compress_data: bool,
    pub full_backup_on_error: bool,
}

impl BackupRecord {
    pub fn new_running(mode: BackupMode, tli: u32, start_time: DateTime<Utc>) -> BackupRecord {
        BackupRecord {
            mode,
            status: BackupStatus::Running,
            tli,
            start_lsn: Lsn::INVALID,
            stop_lsn: Lsn::INVALID,
            start_time,
            end_time: None,
            recovery_time: None,
            recovery_xid: 0,
            total_data_bytes: BYTES_INVALID,
            read_data_bytes: BYTES_INVALID,
            read_arclog_bytes: BYTES_INVALID,
            read_srvlog_bytes: BYTES_INVALID,
            write_bytes: BYTES_INVALID,
            block_size: 0,
            wal_block_size: 0,
            with_serverlog: false,
            compress_data: false,
            full_backup_on_error: false,
        }
    }

    /// `<root>/YYYYMMDD/HHMMSS`, the deterministic filesystem key derived
    /// from `start_time`.
    pub fn path(&self, root: &Utf8Path) -> Utf8PathBuf {
        root.join(self.start_time.format("%Y%m%d").to_string())
            .join(self.start_time.format("%H%M%S").to_string())
    }

    pub fn database_dir(&self, root: &Utf8Path) -> Utf8PathBuf {
        self.path(root).join("database")
    }

    pub fn arclog_dir(&self, root: &Utf8Path) -> Utf8PathBuf {
        self.path(root).join("arclog")
    }

    pub fn srvlog_dir(&self, root: &Utf8Path) -> Utf8PathBuf {
        self.path(root).join("srvlog")
    }

    pub fn total_read_bytes(&self) -> i64 {
        let mut total = 0;
        if self.mode.have_database() && self.read_data_bytes > 0 {
            total += self.read_data_bytes;
        }
        if self.mode.have_arclog() && self.read_arclog_bytes > 0 {
            total += self.read_arclog_bytes;
        }
        if self.with_serverlog && self.read_srvlog_bytes > 0 {
            total += self.read_srvlog_bytes;
        }
        total
    }
}
