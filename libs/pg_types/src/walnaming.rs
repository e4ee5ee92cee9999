//! WAL segment naming, `.history` file line parsing, and the long-header
//! sniff used by retention to decide whether an archived file is a
//! complete WAL segment.

use anyhow::{bail, Context, Result};
use byteorder::{ByteOrder, NativeEndian};
use utils::lsn::Lsn;

use crate::page::BLCKSZ;

/// Every real WAL segment filename is exactly this many hex digits:
/// 8 for the timeline, 8 for the "log" (high 32 bits of the segment
/// number), 8 for the "seg" (low bits).
pub const WAL_FILENAME_LEN: usize = 24;

/// `XLogFileName`: the canonical 24-hex-digit name of the segment
/// containing `lsn` on timeline `tli`, given the cluster's WAL segment
/// size.
pub fn xlog_file_name(tli: u32, lsn: Lsn, wal_seg_size: u64) -> String {
    let seg_no = lsn.segment_number(wal_seg_size);
    let segments_per_xlogid = 0x1_0000_0000u64 / wal_seg_size;
    let log = seg_no / segments_per_xlogid;
    let seg = seg_no % segments_per_xlogid;
    format!("{tli:08X}{log:08X}{seg:08X}")
}

/// True if `name`'s first 24 characters are a well-formed WAL segment
/// prefix (all hex digits). Filenames that don't match this shape must
/// be rejected outright rather than silently misordered by the
/// lexicographic comparison retention relies on.
pub fn is_wal_filename_shape(name: &str) -> bool {
    name.len() >= WAL_FILENAME_LEN
        && name.as_bytes()[..WAL_FILENAME_LEN]
            .iter()
            .all(|b| b.is_ascii_hexdigit())
}

pub fn wal_filename_prefix(name: &str) -> Option<&str> {
    is_wal_filename_shape(name).then(|| &name[..WAL_FILENAME_LEN])
}

/// Is `a` a WAL segment that comes no later than `b`? Both must already
/// have passed `is_wal_filename_shape`.
pub fn wal_name_le(a: &str, b: &str) -> bool {
    a[..WAL_FILENAME_LEN] <= b[..WAL_FILENAME_LEN]
}

const XLOG_PAGE_MAGIC: u16 = 0xD116;
const XLP_LONG_HEADER: u16 = 0x0002;
const LONG_HEADER_LEN: usize = 40;

/// Sniffs the first block of a file and reports whether it looks like a
/// complete WAL segment written with the given configuration. A segment
/// that's still being written (short file, or a `.partial` truncated
/// file) fails this check and is excluded from "complete WAL segments"
/// eligible for archive-log retention.
pub fn looks_like_wal_segment(first_block: &[u8], wal_seg_size: u64) -> bool {
    if first_block.len() < LONG_HEADER_LEN {
        return false;
    }
    let magic = NativeEndian::read_u16(&first_block[0..2]);
    let info = NativeEndian::read_u16(&first_block[2..4]);
    let sys_seg_size = NativeEndian::read_u32(&first_block[32..36]);
    let sys_blcksz = NativeEndian::read_u32(&first_block[36..40]);
    magic == XLOG_PAGE_MAGIC
        && (info & XLP_LONG_HEADER) != 0
        && sys_seg_size as u64 == wal_seg_size
        && sys_blcksz as usize == BLCKSZ
}

/// One entry of a `.history` file: the timeline that ended, and the LSN
/// at which it did.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HistoryEntry {
    pub tli: u32,
    pub end_lsn: Lsn,
}

/// Parses a `.history` file's contents. Enforces strictly increasing
/// timeline ids across lines.
pub fn parse_history(contents: &str) -> Result<Vec<HistoryEntry>> {
    let mut entries = Vec::new();
    let mut last_tli: Option<u32> = None;
    for (lineno, line) in contents.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut fields = line.split('\t');
        let tli_str = fields
            .next()
            .with_context(|| format!("history line {}: missing timeline field", lineno + 1))?;
        let lsn_str = fields
            .next()
            .with_context(|| format!("history line {}: missing LSN field", lineno + 1))?;
        let tli: u32 = tli_str
            .trim()
            .parse()
            .with_context(|| format!("history line {}: bad timeline '{tli_str}'", lineno + 1))?;
        let end_lsn: Lsn = lsn_str
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("history line {}: bad LSN: {e}", lineno + 1))?;
        if let Some(last) = last_tli {
            if tli <= last {
                bail!("history line {}: timeline {tli} is not increasing after {last}", lineno + 1);
            }
        }
        last_tli = Some(tli);
        entries.push(HistoryEntry { tli, end_lsn });
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn xlog_file_name_format() {
        let name = xlog_file_name(1, Lsn(0x2_0000_0000 + 0x20_0000), 16 * 1024 * 1024);
        assert_eq!(name.len(), WAL_FILENAME_LEN);
        assert_eq!(&name[0..8], "00000001");
    }

    #[test]
    fn filename_shape() {
        assert!(is_wal_filename_shape("00000001000000020000003A"));
        assert!(!is_wal_filename_shape("not-a-wal-name"));
        assert!(!is_wal_filename_shape("00000001.history"));
    }

    #[test]
    fn wal_ordering() {
        let a = "000000010000000000000001";
        let b = "000000010000000000000002";
        assert!(wal_name_le(a, b));
        assert!(!wal_name_le(b, a));
    }

    #[test]
    fn history_parsing_and_strict_increase() {
        let text = "1\t0/16001B8\tdescription\n2\t0/3000000\tdescription\n";
        let entries = parse_history(text).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].tli, 1);
        assert_eq!(entries[1].tli, 2);

        let bad = "2\t0/16001B8\t\n1\t0/3000000\t\n";
        assert!(parse_history(bad).is_err());
    }

    #[test]
    fn long_header_sniff() {
        let mut block = vec![0u8; LONG_HEADER_LEN];
        NativeEndian::write_u16(&mut block[0..2], XLOG_PAGE_MAGIC);
        NativeEndian::write_u16(&mut block[2..4], XLP_LONG_HEADER);
        NativeEndian::write_u32(&mut block[32..36], 16 * 1024 * 1024);
        NativeEndian::write_u32(&mut block[36..40], BLCKSZ as u32);
        assert!(looks_like_wal_segment(&block, 16 * 1024 * 1024));
        assert!(!looks_like_wal_segment(&block, 32 * 1024 * 1024));
    }
}
