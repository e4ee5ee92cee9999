//! Byte-accurate file copy with running CRC and optional streaming
//! compression, plus the page-aware data-file backup/restore paths that
//! produce and consume the incremental block-delta format.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};

use camino::Utf8Path;
use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;

use pg_types::page::{
    absolute_block_number, checksum_page, classify_page, parse_segno, BackupPageHeader, PageHeader,
    PageKind, BLCKSZ,
};
use utils::error::{corrupted, system_error, RmanError, RmanResult};
use utils::lsn::Lsn;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CopyMode {
    Plain,
    Compressed,
    Decompressed,
}

pub struct CopyOutcome {
    pub read_size: u64,
    pub write_size: u64,
    pub crc: u32,
}

/// A writer that tracks a running crc32c of every byte actually written
/// to the underlying sink — the manifest's integrity witness.
struct CrcWriter<W: Write> {
    inner: W,
    crc: u32,
    written: u64,
}

impl<W: Write> CrcWriter<W> {
    fn new(inner: W) -> Self {
        CrcWriter {
            inner,
            crc: 0,
            written: 0,
        }
    }
}

impl<W: Write> Write for CrcWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.crc = crc32c::crc32c_append(self.crc, &buf[..n]);
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Byte-accurate copy of `src` to `dst`. ENOENT on `src` is reported via
/// `Ok(None)` (the caller marks the manifest entry skipped); every other
/// I/O failure is fatal.
pub fn copy_file(src: &Utf8Path, dst: &Utf8Path, mode: CopyMode) -> RmanResult<Option<CopyOutcome>> {
    let mut input = match File::open(src) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(system_error(format!("opening {src}: {e}"))),
    };

    let src_mode = input
        .metadata()
        .map_err(|e| system_error(format!("stat {src}: {e}")))?
        .permissions();

    let out_file = File::create(dst).map_err(|e| system_error(format!("creating {dst}: {e}")))?;
    let mut read_size: u64 = 0;

    let crc = match mode {
        CopyMode::Plain => {
            let mut writer = CrcWriter::new(out_file);
            copy_stream(&mut input, &mut writer, &mut read_size)?;
            writer.crc
        }
        CopyMode::Compressed => {
            let writer = CrcWriter::new(out_file);
            let mut encoder = DeflateEncoder::new(writer, Compression::default());
            copy_stream(&mut input, &mut encoder, &mut read_size)?;
            let writer = encoder
                .finish()
                .map_err(|e| system_error(format!("finishing compression of {dst}: {e}")))?;
            writer.crc
        }
        CopyMode::Decompressed => {
            let mut writer = CrcWriter::new(out_file);
            let mut decoder = DeflateDecoder::new(input);
            copy_stream(&mut decoder, &mut writer, &mut read_size)?;
            writer.crc
        }
    };

    let write_size = if mode == CopyMode::Compressed {
        std::fs::metadata(dst)
            .map_err(|e| system_error(format!("stat {dst}: {e}")))?
            .len()
    } else {
        read_size
    };

    std::fs::set_permissions(dst, src_mode).map_err(|e| system_error(format!("chmod {dst}: {e}")))?;

    Ok(Some(CopyOutcome {
        read_size,
        write_size,
        crc,
    }))
}

fn copy_stream<R: Read, W: Write>(input: &mut R, output: &mut W, read_size: &mut u64) -> RmanResult<()> {
    let mut buf = [0u8; 64 * 1024];
    loop {
        utils::interrupt::check()?;
        let n = input
            .read(&mut buf)
            .map_err(|e| system_error(format!("reading input: {e}")))?;
        if n == 0 {
            break;
        }
        *read_size += n as u64;
        output
            .write_all(&buf[..n])
            .map_err(|e| system_error(format!("writing output: {e}")))?;
    }
    Ok(())
}

pub enum DataFileOutcome {
    /// The file was written in page-delta format.
    Written(CopyOutcome),
    /// Every block was filtered by the LSN predicate; nothing to keep.
    Skipped,
    /// The page-validity predicate failed; the file was copied verbatim
    /// instead, and the caller must downgrade the manifest entry's type
    /// to Regular.
    FellBackToPlainCopy(CopyOutcome),
    /// `src` vanished since the manifest was built.
    SourceVanished,
}

/// Either sink a backup stream writes through: plain or deflate-wrapped,
/// both counting the bytes and crc32c actually landed on disk.
enum Sink {
    Plain(CrcWriter<File>),
    Compressed(DeflateEncoder<CrcWriter<File>>),
}

impl Write for Sink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Sink::Plain(w) => w.write(buf),
            Sink::Compressed(w) => w.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Sink::Plain(w) => w.flush(),
            Sink::Compressed(w) => w.flush(),
        }
    }
}

impl Sink {
    fn finish(self) -> RmanResult<(u32, u64)> {
        match self {
            Sink::Plain(w) => Ok((w.crc, w.written)),
            Sink::Compressed(enc) => {
                let inner = enc
                    .finish()
                    .map_err(|e| system_error(format!("finishing compression: {e}")))?;
                Ok((inner.crc, inner.written))
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
pub fn backup_data_file(
    src: &Utf8Path,
    dst: &Utf8Path,
    since_lsn: Option<Lsn>,
    prev_missing: bool,
    incremental: bool,
    compress: bool,
    checksums_enabled: bool,
) -> RmanResult<DataFileOutcome> {
    let mut input = match File::open(src) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(DataFileOutcome::SourceVanished),
        Err(e) => return Err(system_error(format!("opening {src}: {e}"))),
    };

    let segno = if checksums_enabled {
        parse_segno(src.file_name().unwrap_or(""))
    } else {
        0
    };

    let out_file = File::create(dst).map_err(|e| system_error(format!("creating {dst}: {e}")))?;
    let mode = if compress { CopyMode::Compressed } else { CopyMode::Plain };
    let crc_writer = CrcWriter::new(out_file);
    let mut sink = if compress {
        Sink::Compressed(DeflateEncoder::new(crc_writer, Compression::default()))
    } else {
        Sink::Plain(crc_writer)
    };

    let mut read_size: u64 = 0;
    let mut blocks_written: u64 = 0;
    let mut blknum: u32 = 0;
    let mut buf = [0u8; BLCKSZ];

    loop {
        utils::interrupt::check()?;
        let n = read_full(&mut input, &mut buf)
            .map_err(|e| system_error(format!("reading block {blknum} of {src}: {e}")))?;

        if n < BLCKSZ {
            // Short final read: either an in-progress write we caught
            // mid-append, or (at block 0) proof this isn't a data file.
            if n == 0 {
                break;
            }
            if blknum == 0 {
                drop(sink);
                drop(input);
                let outcome = copy_file(src, dst, mode)?;
                return match outcome {
                    Some(o) => Ok(DataFileOutcome::FellBackToPlainCopy(o)),
                    None => Ok(DataFileOutcome::SourceVanished),
                };
            }
            let header = BackupPageHeader {
                block: blknum,
                hole_offset: 0,
                hole_length: 0,
                endpoint: false,
            };
            write_header_and_bytes(&mut sink, &header, &buf[..n], &[])?;
            blocks_written += 1;
            read_size += n as u64;
            break;
        }

        let (page_header, kind) = classify_page(blknum, &buf);
        let (hole_offset, hole_length) = match kind {
            PageKind::Recognized { hole_offset, hole_length } => (hole_offset, hole_length),
            PageKind::NotRecognized => {
                drop(sink);
                drop(input);
                let outcome = copy_file(src, dst, mode)?;
                return match outcome {
                    Some(o) => Ok(DataFileOutcome::FellBackToPlainCopy(o)),
                    None => Ok(DataFileOutcome::SourceVanished),
                };
            }
        };

        read_size += BLCKSZ as u64;

        if !prev_missing {
            if let Some(since) = since_lsn {
                if page_header.lsn.is_valid() && page_header.lsn < since {
                    blknum += 1;
                    continue;
                }
            }
        }

        let hole_end = hole_offset as usize + hole_length as usize;
        let mut page = buf;
        for b in &mut page[hole_offset as usize..hole_end] {
            *b = 0;
        }
        if checksums_enabled {
            let abs = absolute_block_number(blknum, segno);
            let checksum = checksum_page(&page, abs);
            PageHeader::write_checksum(&mut page, checksum);
        }

        let header = BackupPageHeader {
            block: blknum,
            hole_offset,
            hole_length,
            endpoint: false,
        };
        write_header_and_bytes(&mut sink, &header, &page[..hole_offset as usize], &page[hole_end..])?;
        blocks_written += 1;

        blknum += 1;
    }

    if incremental {
        let header = BackupPageHeader {
            block: blknum + 1,
            hole_offset: 0,
            hole_length: 0,
            endpoint: true,
        };
        write_header_and_bytes(&mut sink, &header, &[], &[])?;
    }

    let (crc, write_size) = sink.finish()?;

    if read_size == 0 {
        // Treat an empty file as not-a-data-file (a boundary PostgreSQL
        // itself can present mid-create).
        std::fs::remove_file(dst).ok();
        let outcome = copy_file(src, dst, mode)?;
        return match outcome {
            Some(o) => Ok(DataFileOutcome::FellBackToPlainCopy(o)),
            None => Ok(DataFileOutcome::SourceVanished),
        };
    }

    if blocks_written == 0 {
        std::fs::remove_file(dst).map_err(|e| system_error(format!("removing {dst}: {e}")))?;
        return Ok(DataFileOutcome::Skipped);
    }

    Ok(DataFileOutcome::Written(CopyOutcome {
        read_size,
        write_size,
        crc,
    }))
}

fn write_header_and_bytes(sink: &mut Sink, header: &BackupPageHeader, lower: &[u8], upper: &[u8]) -> RmanResult<()> {
    sink.write_all(&header.encode())
        .and_then(|_| sink.write_all(lower))
        .and_then(|_| sink.write_all(upper))
        .map_err(|e| system_error(format!("writing backup stream: {e}")))
}

fn read_full(input: &mut File, buf: &mut [u8; BLCKSZ]) -> io::Result<usize> {
    let mut total = 0;
    while total < BLCKSZ {
        let n = input.read(&mut buf[total..])?;
        if n == 0 {
            break;
        }
        total += n;
    }
    Ok(total)
}

/// Restores a page-delta data file written by `backup_data_file`.
pub fn restore_data_file(src: &Utf8Path, dst: &Utf8Path, compress: bool) -> RmanResult<()> {
    let input = File::open(src).map_err(|e| system_error(format!("opening {src}: {e}")))?;
    let mut out = match OpenOptions::new().write(true).read(true).open(dst) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            OpenOptions::new()
                .write(true)
                .create(true)
                .open(dst)
                .map_err(|e| system_error(format!("creating {dst}: {e}")))?
        }
        Err(e) => return Err(system_error(format!("opening {dst}: {e}"))),
    };

    let mut reader: Box<dyn Read> = if compress {
        Box::new(DeflateDecoder::new(input))
    } else {
        Box::new(input)
    };

    let mut expect_blknum: u32 = 0;
    loop {
        utils::interrupt::check()?;
        let mut header_buf = [0u8; BackupPageHeader::ENCODED_LEN];
        match read_exact_or_eof(&mut reader, &mut header_buf)? {
            None => break, // clean EOF between records
            Some(()) => {}
        }
        let header = BackupPageHeader::decode(&header_buf);

        if header.endpoint {
            let new_len = (header.block.saturating_sub(1)) as u64 * BLCKSZ as u64;
            out.set_len(new_len)
                .map_err(|e| system_error(format!("truncating {dst}: {e}")))?;
            return Ok(());
        }

        if header.block < expect_blknum
            || header.hole_offset as usize > BLCKSZ
            || header.hole_offset as usize + header.hole_length as usize > BLCKSZ
        {
            return Err(corrupted(format!("backup stream broken at block {expect_blknum} of {src}")));
        }

        let upper_offset = header.hole_offset as usize + header.hole_length as usize;
        let upper_len = BLCKSZ - upper_offset;

        let mut page = [0u8; BLCKSZ];
        reader
            .read_exact(&mut page[..header.hole_offset as usize])
            .map_err(|e| system_error(format!("reading block {} of {src}: {e}", header.block)))?;
        reader
            .read_exact(&mut page[upper_offset..upper_offset + upper_len])
            .map_err(|e| system_error(format!("reading block {} of {src}: {e}", header.block)))?;

        out.seek(SeekFrom::Start(header.block as u64 * BLCKSZ as u64))
            .map_err(|e| system_error(format!("seeking {dst}: {e}")))?;
        out.write_all(&page)
            .map_err(|e| system_error(format!("writing block {} of {dst}: {e}", header.block)))?;

        expect_blknum = header.block + 1;
    }
    Ok(())
}

/// `read_exact`, but reports a clean EOF (zero bytes read before any
/// were consumed) as `Ok(None)` instead of an error.
fn read_exact_or_eof<R: Read>(reader: &mut R, buf: &mut [u8]) -> RmanResult<Option<()>> {
    let mut total = 0;
    while total < buf.len() {
        let n = reader
            .read(&mut buf[total..])
            .map_err(|e| system_error(format!("reading backup stream: {e}")))?;
        if n == 0 {
            if total == 0 {
                return Ok(None);
            }
            return Err(corrupted("backup stream truncated mid-header"));
        }
        total += n;
    }
    Ok(Some(()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pg_types::page::BLCKSZ;
    use std::fs;

    fn write_page(lower: u16, upper: u16, special: u16, lsn: Lsn) -> [u8; BLCKSZ] {
        use byteorder::{ByteOrder, NativeEndian};
        let mut page = [0u8; BLCKSZ];
        let (hi, lo) = lsn.segments();
        NativeEndian::write_u32(&mut page[0..4], hi);
        NativeEndian::write_u32(&mut page[4..8], lo);
        NativeEndian::write_u16(&mut page[12..14], lower);
        NativeEndian::write_u16(&mut page[14..16], upper);
        NativeEndian::write_u16(&mut page[16..18], special);
        NativeEndian::write_u16(&mut page[18..20], BLCKSZ as u16 | 4);
        page
    }

    #[test]
    fn plain_copy_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let src = camino::Utf8Path::from_path(dir.path()).unwrap().join("src");
        let dst = camino::Utf8Path::from_path(dir.path()).unwrap().join("dst");
        fs::write(&src, b"hello world").unwrap();
        let outcome = copy_file(&src, &dst, CopyMode::Plain).unwrap().unwrap();
        assert_eq!(outcome.read_size, 11);
        assert_eq!(fs::read(&dst).unwrap(), b"hello world");
    }

    #[test]
    fn copy_file_missing_source_is_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let src = camino::Utf8Path::from_path(dir.path()).unwrap().join("nope");
        let dst = camino::Utf8Path::from_path(dir.path()).unwrap().join("dst");
        let outcome = copy_file(&src, &dst, CopyMode::Plain).unwrap();
        assert!(outcome.is_none());
    }

    #[test]
    fn compressed_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let src = camino::Utf8Path::from_path(dir.path()).unwrap().join("src");
        let compressed = camino::Utf8Path::from_path(dir.path()).unwrap().join("c");
        let roundtrip = camino::Utf8Path::from_path(dir.path()).unwrap().join("rt");
        let data = b"the quick brown fox jumps over the lazy dog".repeat(100);
        fs::write(&src, &data).unwrap();
        copy_file(&src, &compressed, CopyMode::Compressed).unwrap();
        copy_file(&compressed, &roundtrip, CopyMode::Decompressed).unwrap();
        assert_eq!(fs::read(&roundtrip).unwrap(), data);
    }

    #[test]
    fn full_data_file_backup_and_restore_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let root = camino::Utf8Path::from_path(dir.path()).unwrap();
        let src = root.join("rel");
        let mut data = Vec::new();
        for b in 0..3u32 {
            data.extend_from_slice(&write_page(24, 100, BLCKSZ as u16, Lsn((b + 1) as u64 * 10)));
        }
        fs::write(&src, &data).unwrap();

        let backup_out = root.join("rel.bak");
        let outcome = backup_data_file(&src, &backup_out, None, false, false, false, false).unwrap();
        let DataFileOutcome::Written(_) = outcome else {
            panic!("expected Written");
        };

        let restored = root.join("rel.restored");
        restore_data_file(&backup_out, &restored, false).unwrap();
        assert_eq!(fs::read(&restored).unwrap(), data);
    }

    #[test]
    fn incremental_skips_unmodified_blocks() {
        let dir = tempfile::tempdir().unwrap();
        let root = camino::Utf8Path::from_path(dir.path()).unwrap();
        let src = root.join("rel");
        let mut data = Vec::new();
        // Block 0 has LSN below the threshold (unmodified); block 1 above.
        data.extend_from_slice(&write_page(24, 100, BLCKSZ as u16, Lsn(5)));
        data.extend_from_slice(&write_page(24, 100, BLCKSZ as u16, Lsn(50)));
        fs::write(&src, &data).unwrap();

        let out = root.join("rel.bak");
        let outcome =
            backup_data_file(&src, &out, Some(Lsn(10)), false, true, false, false).unwrap();
        let DataFileOutcome::Written(_) = outcome else {
            panic!("expected Written");
        };

        // Only block 1 plus the endpoint sentinel should be present.
        let bytes = fs::read(&out).unwrap();
        let header = BackupPageHeader::decode(bytes[..BackupPageHeader::ENCODED_LEN].try_into().unwrap());
        assert_eq!(header.block, 1);
    }

    #[test]
    fn incremental_truncation_on_restore() {
        let dir = tempfile::tempdir().unwrap();
        let root = camino::Utf8Path::from_path(dir.path()).unwrap();

        // Base: 3 blocks.
        let base_src = root.join("base_rel");
        let mut base_data = Vec::new();
        base_data.extend_from_slice(&write_page(24, 100, BLCKSZ as u16, Lsn(5)));
        base_data.extend_from_slice(&write_page(24, 100, BLCKSZ as u16, Lsn(6)));
        base_data.extend_from_slice(&write_page(24, 100, BLCKSZ as u16, Lsn(7)));
        fs::write(&base_src, &base_data).unwrap();
        let base_bak = root.join("base.bak");
        backup_data_file(&base_src, &base_bak, None, false, false, false, false).unwrap();

        let restored = root.join("restored_rel");
        restore_data_file(&base_bak, &restored, false).unwrap();
        assert_eq!(fs::metadata(&restored).unwrap().len() as usize, 3 * BLCKSZ);

        // Incremental: the relation shrank to 2 blocks, both touched since
        // the base backup's LSN.
        let inc_src = root.join("inc_rel");
        let mut inc_data = Vec::new();
        inc_data.extend_from_slice(&write_page(24, 100, BLCKSZ as u16, Lsn(10)));
        inc_data.extend_from_slice(&write_page(24, 100, BLCKSZ as u16, Lsn(11)));
        fs::write(&inc_src, &inc_data).unwrap();
        let inc_bak = root.join("inc.bak");
        let outcome = backup_data_file(&inc_src, &inc_bak, Some(Lsn(8)), false, true, false, false).unwrap();
        assert!(matches!(outcome, DataFileOutcome::Written(_)));

        restore_data_file(&inc_bak, &restored, false).unwrap();
        // The endpoint record truncates the 3-block restore target down to
        // the 2 blocks the incremental actually carried.
        assert_eq!(fs::metadata(&restored).unwrap().len() as usize, 2 * BLCKSZ);
    }

    #[test]
    fn corrupted_page_header_falls_back_to_plain_copy() {
        let dir = tempfile::tempdir().unwrap();
        let root = camino::Utf8Path::from_path(dir.path()).unwrap();
        let src = root.join("rel");
        // pd_lower > pd_upper: invalid header.
        let page = write_page(200, 100, BLCKSZ as u16, Lsn(5));
        fs::write(&src, page).unwrap();

        let out = root.join("rel.bak");
        let outcome = backup_data_file(&src, &out, None, false, false, false, false).unwrap();
        match outcome {
            DataFileOutcome::FellBackToPlainCopy(o) => assert_eq!(o.read_size, BLCKSZ as u64),
            other => panic!("expected fallback, got {other:?}"),
        }
        assert_eq!(fs::read(&out).unwrap(), page);
    }
}

impl std::fmt::Debug for DataFileOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DataFileOutcome::Written(_) => write!(f, "Written"),
            DataFileOutcome::Skipped => write!(f, "Skipped"),
            DataFileOutcome::FellBackToPlainCopy(_) => write!(f, "FellBackToPlainCopy"),
            DataFileOutcome::SourceVanished => write!(f, "SourceVanished"),
        }
    }
}
