//! Minimal reader for `global/pg_control`, the fixed-size binary file a
//! cluster carries its identity and compile-time compatibility constants
//! in. Only the fields the engine's preflight checks need are exposed;
//! everything else in the real file (checkpoint bookkeeping, recovery
//! state) is out of scope.

use anyhow::{bail, Context, Result};
use byteorder::{ByteOrder, NativeEndian};
use std::path::Path;

use crate::page::{BLCKSZ, DEFAULT_WAL_SEGMENT_SIZE};

const PG_CONTROL_VERSION: u32 = 1300;

// Field offsets within the control file this engine was built against.
// A real pg_control layout shifts these across major versions; a
// `pg_control_version` mismatch is reported as a warning rather than
// treated as fatal; what is fatal is a *system_identifier* mismatch
// against the catalog, checked by the caller.
mod offsets {
    pub const PG_CONTROL_VERSION: usize = 0;
    pub const SYSTEM_IDENTIFIER: usize = 8;
    pub const BLCKSZ: usize = 16;
    pub const XLOG_BLCKSZ: usize = 20;
    pub const XLOG_SEG_SIZE: usize = 24;
    pub const DATA_CHECKSUM_VERSION: usize = 32;
    pub const MIN_SIZE: usize = 40;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ControlFile {
    pub pg_control_version: u32,
    pub system_identifier: u64,
    pub block_size: u32,
    pub wal_block_size: u32,
    pub xlog_seg_size: u64,
    pub data_checksum_version: u32,
}

impl ControlFile {
    pub fn read(pgdata: &Path) -> Result<ControlFile> {
        let path = pgdata.join("global").join("pg_control");
        let buf = std::fs::read(&path)
            .with_context(|| format!("reading control file {}", path.display()))?;
        Self::parse(&buf).with_context(|| format!("parsing control file {}", path.display()))
    }

    pub fn parse(buf: &[u8]) -> Result<ControlFile> {
        if buf.len() < offsets::MIN_SIZE {
            bail!("control file too short: {} bytes", buf.len());
        }
        let cf = ControlFile {
            pg_control_version: NativeEndian::read_u32(&buf[offsets::PG_CONTROL_VERSION..]),
            system_identifier: NativeEndian::read_u64(&buf[offsets::SYSTEM_IDENTIFIER..]),
            block_size: NativeEndian::read_u32(&buf[offsets::BLCKSZ..]),
            wal_block_size: NativeEndian::read_u32(&buf[offsets::XLOG_BLCKSZ..]),
            xlog_seg_size: NativeEndian::read_u32(&buf[offsets::XLOG_SEG_SIZE..]) as u64,
            data_checksum_version: NativeEndian::read_u32(&buf[offsets::DATA_CHECKSUM_VERSION..]),
        };
        if cf.pg_control_version != PG_CONTROL_VERSION {
            tracing::warn!(
                found = cf.pg_control_version,
                expected = PG_CONTROL_VERSION,
                "pg_control version mismatch; results may be unreliable"
            );
        }
        Ok(cf)
    }

    pub fn xlog_seg_size_or_default(&self) -> u64 {
        if self.xlog_seg_size == 0 {
            DEFAULT_WAL_SEGMENT_SIZE
        } else {
            self.xlog_seg_size
        }
    }

    pub fn has_page_checksums(&self) -> bool {
        self.data_checksum_version > 0
    }

    /// Checks the compile-time block size constants against the
    /// cluster's. A mismatch here is a hard incompatibility that must
    /// fail before any file is touched.
    pub fn check_block_sizes(&self, server_block_size: u32, server_wal_block_size: u32) -> Result<()> {
        if self.block_size as usize != BLCKSZ || server_block_size as usize != BLCKSZ {
            bail!(
                "block size mismatch: control file {}, server {}, expected {}",
                self.block_size,
                server_block_size,
                BLCKSZ
            );
        }
        if self.wal_block_size != server_wal_block_size {
            bail!(
                "WAL block size mismatch: control file {}, server {}",
                self.wal_block_size,
                server_wal_block_size
            );
        }
        Ok(())
    }
}

/// Serializes a control file buffer for tests, mirroring `parse`'s layout.
#[cfg(test)]
pub fn encode_for_test(cf: &ControlFile) -> Vec<u8> {
    let mut buf = vec![0u8; offsets::MIN_SIZE];
    NativeEndian::write_u32(&mut buf[offsets::PG_CONTROL_VERSION..], cf.pg_control_version);
    NativeEndian::write_u64(&mut buf[offsets::SYSTEM_IDENTIFIER..], cf.system_identifier);
    NativeEndian::write_u32(&mut buf[offsets::BLCKSZ..], cf.block_size);
    NativeEndian::write_u32(&mut buf[offsets::XLOG_BLCKSZ..], cf.wal_block_size);
    NativeEndian::write_u32(&mut buf[offsets::XLOG_SEG_SIZE..], cf.xlog_seg_size as u32);
    NativeEndian::write_u32(
        &mut buf[offsets::DATA_CHECKSUM_VERSION..],
        cf.data_checksum_version,
    );
    buf
}
