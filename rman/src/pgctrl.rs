//! The database backup-control protocol: the small set of SQL calls rman
//! issues against the target server to bracket an online backup
//! (`pg_backup_start`/`pg_backup_stop`), force a WAL switch, and read the
//! server's version and block-size settings before trusting it.

use postgres::{Client, NoTls};

use pg_types::page::BLCKSZ;
use utils::error::{pg_command, pg_connect, pg_incompatible, RmanResult};
use utils::lsn::Lsn;

pub const DEFAULT_WAL_SEGMENT_SIZE: u64 = 16 * 1024 * 1024;
const MIN_SERVER_VERSION: i32 = 90600;

pub struct BackupBounds {
    pub tli: u32,
    pub start_lsn: Lsn,
}

pub struct StopResult {
    pub tli: u32,
    pub stop_lsn: Lsn,
    pub recovery_xid: u32,
    pub backup_label: Vec<u8>,
    pub tablespace_map: Option<Vec<u8>>,
}

/// The server-side collaborator the backup engine drives. Abstracted
/// behind a trait so the engine's state machine can be tested against a
/// fake without a live server.
pub trait BackupControl {
    fn check_server_version(&mut self) -> RmanResult<()>;
    fn backup_start(&mut self, label: &str, fast: bool) -> RmanResult<BackupBounds>;
    fn backup_stop(&mut self) -> RmanResult<StopResult>;
    fn switch_wal(&mut self) -> RmanResult<Lsn>;
    fn current_xid(&mut self) -> RmanResult<u32>;
}

/// Parses the `%08X%08X%08X` WAL filename plus byte offset returned by
/// `pg_walfile_name_offset`, per the control protocol's wire format.
fn parse_walfile_name_offset(name: &str, offset: i64, wal_seg_size: u64) -> RmanResult<(u32, Lsn)> {
    if name.len() != 24 || !name.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(pg_command(format!("invalid WAL file name returned by server: {name}")));
    }
    let tli = u32::from_str_radix(&name[0..8], 16)
        .map_err(|_| pg_command(format!("invalid WAL file name returned by server: {name}")))?;
    let log = u64::from_str_radix(&name[8..16], 16)
        .map_err(|_| pg_command(format!("invalid WAL file name returned by server: {name}")))?;
    let seg = u64::from_str_radix(&name[16..24], 16)
        .map_err(|_| pg_command(format!("invalid WAL file name returned by server: {name}")))?;
    let segs_per_log = 0x1_0000_0000u64 / wal_seg_size;
    let seg_no = log * segs_per_log + seg;
    let lsn = Lsn(seg_no * wal_seg_size + offset as u64);
    Ok((tli, lsn))
}

/// A live connection to the target server, using the plain synchronous
/// driver since rman issues at most one statement at a time and never
/// needs the extended pipeline the foreground backend might.
pub struct PgConnection {
    client: Client,
    wal_seg_size: u64,
}

impl PgConnection {
    pub fn connect(conninfo: &str, wal_seg_size: u64) -> RmanResult<PgConnection> {
        let client = Client::connect(conninfo, NoTls)
            .map_err(|e| pg_connect(format!("could not connect to server: {e}")))?;
        Ok(PgConnection { client, wal_seg_size })
    }

    fn walfile_name_offset(&mut self, sql: &str) -> RmanResult<(u32, Lsn)> {
        let row = self
            .client
            .query_one(sql, &[])
            .map_err(|e| pg_command(format!("{sql}: {e}")))?;
        let name: String = row.get(0);
        let offset: i64 = row.get(1);
        parse_walfile_name_offset(&name, offset, self.wal_seg_size)
    }
}

impl BackupControl for PgConnection {
    fn check_server_version(&mut self) -> RmanResult<()> {
        let row = self
            .client
            .query_one("SHOW server_version_num", &[])
            .map_err(|e| pg_command(format!("could not read server_version_num: {e}")))?;
        let version_str: String = row.get(0);
        let version: i32 = version_str
            .parse()
            .map_err(|_| pg_command(format!("unparseable server_version_num: {version_str}")))?;
        if version < MIN_SERVER_VERSION {
            return Err(pg_incompatible(format!(
                "server version is {version}, but must be {MIN_SERVER_VERSION} or higher"
            )));
        }

        for (setting, expected) in [("block_size", BLCKSZ as i64), ("wal_block_size", 8192)] {
            let row = self
                .client
                .query_one("SELECT current_setting($1)", &[&setting])
                .map_err(|e| pg_command(format!("could not get {setting}: {e}")))?;
            let value: String = row.get(0);
            let value: i64 = value
                .parse()
                .map_err(|_| pg_command(format!("unparseable {setting}: {value}")))?;
            if value != expected {
                return Err(pg_incompatible(format!("{setting} is {value}, expected {expected}")));
            }
        }
        Ok(())
    }

    fn backup_start(&mut self, label: &str, fast: bool) -> RmanResult<BackupBounds> {
        let row = self
            .client
            .query_one(
                "SELECT * from pg_walfile_name_offset(pg_backup_start($1, $2))",
                &[&label, &fast],
            )
            .map_err(|e| pg_command(format!("pg_backup_start(): {e}")))?;
        let name: String = row.get(0);
        let offset: i64 = row.get(1);
        let (tli, start_lsn) = parse_walfile_name_offset(&name, offset, self.wal_seg_size)?;
        Ok(BackupBounds { tli, start_lsn })
    }

    fn backup_stop(&mut self) -> RmanResult<StopResult> {
        self.client.execute("SET client_min_messages = warning", &[]).ok();

        let row = self
            .client
            .query_one("SELECT * FROM pg_backup_stop(true)", &[])
            .map_err(|e| pg_command(format!("pg_backup_stop(): {e}")))?;

        let backup_lsn: String = row.get(0);
        let backup_label: String = row.get(1);
        let tablespace_map: Option<String> = row.get(2);

        let (tli, stop_lsn) = {
            let row = self
                .client
                .query_one("SELECT * FROM pg_walfile_name_offset($1)", &[&backup_lsn])
                .map_err(|e| pg_command(format!("pg_walfile_name_offset({backup_lsn}): {e}")))?;
            let name: String = row.get(0);
            let offset: i64 = row.get(1);
            parse_walfile_name_offset(&name, offset, self.wal_seg_size)?
        };

        let recovery_xid = self.current_xid()?;

        Ok(StopResult {
            tli,
            stop_lsn,
            recovery_xid,
            backup_label: backup_label.into_bytes(),
            tablespace_map: tablespace_map.filter(|s| !s.is_empty()).map(|s| s.into_bytes()),
        })
    }

    fn switch_wal(&mut self) -> RmanResult<Lsn> {
        let (_, lsn) = self.walfile_name_offset("SELECT * FROM pg_walfile_name_offset(pg_switch_wal())")?;
        Ok(lsn)
    }

    fn current_xid(&mut self) -> RmanResult<u32> {
        let row = self
            .client
            .query_one("SELECT txid_current()", &[])
            .map_err(|e| pg_command(format!("txid_current(): {e}")))?;
        let xid: i64 = row.get(0);
        Ok(xid as u32)
    }
}

#[cfg(test)]
pub mod fake {
    use super::*;
    use std::cell::Cell;

    /// A stand-in collaborator that advances a monotonic LSN counter on
    /// every call, for exercising the backup engine's state machine
    /// without a live server.
    pub struct FakeBackupControl {
        next_lsn: Cell<u64>,
        pub tli: u32,
    }

    impl FakeBackupControl {
        pub fn new(tli: u32) -> FakeBackupControl {
            FakeBackupControl {
                next_lsn: Cell::new(0x100),
                tli,
            }
        }

        fn advance(&self) -> Lsn {
            let v = self.next_lsn.get();
            self.next_lsn.set(v + 0x1000);
            Lsn(v)
        }
    }

    impl BackupControl for FakeBackupControl {
        fn check_server_version(&mut self) -> RmanResult<()> {
            Ok(())
        }

        fn backup_start(&mut self, _label: &str, _fast: bool) -> RmanResult<BackupBounds> {
            Ok(BackupBounds {
                tli: self.tli,
                start_lsn: self.advance(),
            })
        }

        fn backup_stop(&mut self) -> RmanResult<StopResult> {
            Ok(StopResult {
                tli: self.tli,
                stop_lsn: self.advance(),
                recovery_xid: 42,
                backup_label: b"START WAL LOCATION: 0/100\n".to_vec(),
                tablespace_map: None,
            })
        }

        fn switch_wal(&mut self) -> RmanResult<Lsn> {
            Ok(self.advance())
        }

        fn current_xid(&mut self) -> RmanResult<u32> {
            Ok(42)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_walfile_name_offset() {
        let (tli, lsn) = parse_walfile_name_offset("0000000100000000000000A0", 512, DEFAULT_WAL_SEGMENT_SIZE).unwrap();
        assert_eq!(tli, 1);
        assert_eq!(lsn, Lsn(0xA0 * DEFAULT_WAL_SEGMENT_SIZE + 512));
    }

    #[test]
    fn rejects_malformed_walfile_name() {
        assert!(parse_walfile_name_offset("not-hex", 0, DEFAULT_WAL_SEGMENT_SIZE).is_err());
    }

    #[test]
    fn fake_control_advances_lsn_monotonically() {
        let mut fake = fake::FakeBackupControl::new(1);
        let start = fake.backup_start("test", true).unwrap();
        let stop = fake.backup_stop().unwrap();
        assert!(stop.stop_lsn > start.start_lsn);
    }
}
