//! `show [detail] [DATE]`: prints the catalog, most recent first.
//!
//! Plain mode renders one row per backup in a table; `detail` mode dumps
//! every field of a single record the way its on-disk `backup.ini` reads.

use camino::Utf8Path;
use chrono::{DateTime, Utc};
use comfy_table::{Cell, ContentArrangement, Table};

use crate::catalog;
use crate::model::BackupRecord;
use utils::error::{no_backup, RmanResult};

pub fn show_table(root: &Utf8Path) -> RmanResult<String> {
    let backups = catalog::list(root)?;
    let mut table = Table::new();
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec!["Start", "End", "Mode", "Status", "TLI", "Data", "WAL"]);
    for b in &backups {
        table.add_row(vec![
            Cell::new(b.start_time.format("%Y-%m-%d %H:%M:%S")),
            Cell::new(
                b.end_time
                    .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                    .unwrap_or_else(|| "-".to_string()),
            ),
            Cell::new(b.mode.as_str()),
            Cell::new(b.status.as_str()),
            Cell::new(b.tli),
            Cell::new(human_bytes(b.total_data_bytes)),
            Cell::new(human_bytes(b.read_arclog_bytes)),
        ]);
    }
    Ok(table.to_string())
}

pub fn show_detail(root: &Utf8Path, at: DateTime<Utc>) -> RmanResult<String> {
    let backups = catalog::list(root)?;
    let backup = backups
        .iter()
        .find(|b| b.start_time == at)
        .ok_or_else(|| no_backup(format!("no backup found with start time {at}")))?;
    Ok(render_detail(backup))
}

pub fn render_detail(b: &BackupRecord) -> String {
    let mut out = String::new();
    out.push_str(&format!("# configuration\n"));
    out.push_str(&format!("BACKUP_MODE = '{}'\n", b.mode.as_str()));
    out.push_str(&format!("WITH_SERVERLOG = '{}'\n", b.with_serverlog));
    out.push_str(&format!("COMPRESS_DATA = '{}'\n", b.compress_data));
    out.push_str(&format!("\n# result\n"));
    out.push_str(&format!("TIMELINEID = {}\n", b.tli));
    out.push_str(&format!("START_LSN = {}\n", b.start_lsn));
    out.push_str(&format!("STOP_LSN = {}\n", b.stop_lsn));
    out.push_str(&format!("STATUS = {}\n", b.status.as_str()));
    out.push_str(&format!("START_TIME = '{}'\n", b.start_time.format("%Y-%m-%d %H:%M:%S")));
    if let Some(end) = b.end_time {
        out.push_str(&format!("END_TIME = '{}'\n", end.format("%Y-%m-%d %H:%M:%S")));
    }
    if let Some(recovery) = b.recovery_time {
        out.push_str(&format!("RECOVERY_TIME = '{}'\n", recovery.format("%Y-%m-%d %H:%M:%S")));
    }
    out.push_str(&format!("RECOVERY_XID = {}\n", b.recovery_xid));
    out.push_str(&format!("TOTAL_DATA_BYTES = {}\n", b.total_data_bytes));
    out.push_str(&format!("READ_DATA_BYTES = {}\n", b.read_data_bytes));
    out.push_str(&format!("READ_ARCLOG_BYTES = {}\n", b.read_arclog_bytes));
    out.push_str(&format!("READ_SRVLOG_BYTES = {}\n", b.read_srvlog_bytes));
    out.push_str(&format!("WRITE_BYTES = {}\n", b.write_bytes));
    out.push_str(&format!("BLOCK_SIZE = {}\n", b.block_size));
    out.push_str(&format!("WAL_BLOCK_SIZE = {}\n", b.wal_block_size));
    out
}

fn human_bytes(n: i64) -> String {
    if n < 0 {
        return "-".to_string();
    }
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut value = n as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{n}{}", UNITS[0])
    } else {
        format!("{value:.1}{}", UNITS[unit])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::BackupMode;

    #[test]
    fn table_lists_every_backup() {
        let dir = camino_tempfile::tempdir().unwrap();
        let root = dir.path();
        let r1 = BackupRecord::new_running(BackupMode::Full, 1, Utc::now());
        catalog::create_backup_dirs(root, &r1).unwrap();
        catalog::write(&r1.path(root), &r1).unwrap();

        let out = show_table(root).unwrap();
        assert!(out.contains("FULL"));
        assert!(out.contains("RUNNING"));
    }

    #[test]
    fn detail_requires_matching_start_time() {
        let dir = camino_tempfile::tempdir().unwrap();
        let root = dir.path();
        let err = show_detail(root, Utc::now()).unwrap_err();
        assert_eq!(err.kind, utils::error::ErrorKind::NoBackup);
    }

    #[test]
    fn human_bytes_scales_units() {
        assert_eq!(human_bytes(-1), "-");
        assert_eq!(human_bytes(512), "512B");
        assert_eq!(human_bytes(2048), "2.0KB");
    }
}
