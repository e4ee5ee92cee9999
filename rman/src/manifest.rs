//! File Manifest & Directory Walker: depth-first enumeration of a root
//! into manifest entries, plus the manifest's textual codec.

use std::collections::HashSet;
use std::fs;
use std::os::unix::fs::{FileTypeExt, PermissionsExt};

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};

use crate::model::BYTES_INVALID;
use utils::error::{corrupted, system_error, RmanResult};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntryType {
    DataFile,
    Regular,
    Directory,
    Symlink,
    Socket,
}

impl EntryType {
    pub fn as_char(self) -> char {
        match self {
            EntryType::DataFile => 'F',
            EntryType::Regular => 'f',
            EntryType::Directory => 'd',
            EntryType::Symlink => 'l',
            EntryType::Socket => 's',
        }
    }

    pub fn from_char(c: char) -> Option<EntryType> {
        match c {
            'F' => Some(EntryType::DataFile),
            'f' => Some(EntryType::Regular),
            'd' => Some(EntryType::Directory),
            'l' => Some(EntryType::Symlink),
            's' => Some(EntryType::Socket),
            _ => None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct ManifestEntry {
    pub path: Utf8PathBuf,
    pub kind: EntryType,
    pub write_size: i64,
    pub crc: u32,
    pub mode: u32,
    pub mtime: DateTime<Utc>,
    pub linked_path: Option<Utf8PathBuf>,
}

impl ManifestEntry {
    pub fn is_skipped(&self) -> bool {
        self.write_size == BYTES_INVALID
    }

    /// `<relative path> <type> <write_size> <crc32c> <mode_octal> <iso8601_mtime>[ <linked_path>]`
    pub fn format_line(&self, relative_to: &Utf8Path) -> String {
        let rel = self.path.strip_prefix(relative_to).unwrap_or(&self.path);
        let mtime = self.mtime.format("%Y-%m-%d %H:%M:%S");
        let mut line = format!(
            "{} {} {} {} {:o} {}",
            rel,
            self.kind.as_char(),
            self.write_size,
            self.crc,
            self.mode,
            mtime
        );
        if let Some(linked) = &self.linked_path {
            line.push(' ');
            line.push_str(linked.as_str());
        }
        line
    }

    /// Parses one manifest line, strictly requiring the field count the
    /// writer emits. `root`, if non-empty, is joined onto the stored
    /// relative path to produce an absolute path.
    pub fn parse_line(line: &str, root: Option<&Utf8Path>) -> RmanResult<ManifestEntry> {
        let plausible_field_count = {
            // 7 fields for a regular/directory entry, 8 when a trailing
            // symlink target is present; re-checked field-by-field below.
            let n = line.split_whitespace().count();
            n == 7 || n == 8
        };
        if !plausible_field_count {
            return Err(corrupted(format!("malformed manifest line: {line:?}")));
        }
        let mut fields = line.split_whitespace();
        let path = fields
            .next()
            .ok_or_else(|| corrupted("manifest line missing path"))?;
        let type_char = fields
            .next()
            .and_then(|s| s.chars().next())
            .ok_or_else(|| corrupted("manifest line missing type"))?;
        let kind = EntryType::from_char(type_char)
            .ok_or_else(|| corrupted(format!("unknown manifest entry type '{type_char}'")))?;
        let write_size: i64 = fields
            .next()
            .ok_or_else(|| corrupted("manifest line missing write_size"))?
            .parse()
            .map_err(|_| corrupted("manifest write_size is not an integer"))?;
        let crc: u32 = fields
            .next()
            .ok_or_else(|| corrupted("manifest line missing crc"))?
            .parse()
            .map_err(|_| corrupted("manifest crc is not an integer"))?;
        let mode = u32::from_str_radix(
            fields.next().ok_or_else(|| corrupted("manifest line missing mode"))?,
            8,
        )
        .map_err(|_| corrupted("manifest mode is not octal"))?;

        let date = fields.next().ok_or_else(|| corrupted("manifest line missing date"))?;
        let time = fields.next().ok_or_else(|| corrupted("manifest line missing time"))?;
        let naive = NaiveDateTime::parse_from_str(&format!("{date} {time}"), "%Y-%m-%d %H:%M:%S")
            .map_err(|_| corrupted("manifest mtime is not parseable"))?;
        let mtime = Utc.from_utc_datetime(&naive);

        let linked_path = if kind == EntryType::Symlink {
            Some(Utf8PathBuf::from(
                fields.next().ok_or_else(|| corrupted("symlink entry missing target"))?,
            ))
        } else {
            None
        };
        if fields.next().is_some() {
            return Err(corrupted(format!("malformed manifest line: {line:?}")));
        }

        let path = match root {
            Some(root) => root.join(path),
            None => Utf8PathBuf::from(path),
        };

        Ok(ManifestEntry {
            path,
            kind,
            write_size,
            crc,
            mode,
            mtime,
            linked_path,
        })
    }
}

pub fn write_manifest(entries: &[ManifestEntry], relative_to: &Utf8Path) -> String {
    let mut out = String::new();
    for e in entries {
        out.push_str(&e.format_line(relative_to));
        out.push('\n');
    }
    out
}

pub fn read_manifest(text: &str, root: Option<&Utf8Path>) -> RmanResult<Vec<ManifestEntry>> {
    text.lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| ManifestEntry::parse_line(l, root))
        .collect()
}

/// Recomputes the crc32c of every manifested regular/data file under
/// `root` and compares it against the recorded value. Directories,
/// symlinks, and skipped entries (`write_size == BYTES_INVALID`) are not
/// content-checked. Returns the first mismatching path, if any; shared by
/// every verb that needs to trust a backup's files before using them.
pub fn verify_entries(root: &Utf8Path, entries: &[ManifestEntry]) -> RmanResult<Option<Utf8PathBuf>> {
    use std::io::Read;

    for entry in entries {
        if entry.is_skipped() || matches!(entry.kind, EntryType::Directory | EntryType::Symlink) {
            continue;
        }
        let mut file = fs::File::open(&entry.path).map_err(|e| system_error(format!("opening {}: {e}", entry.path)))?;
        let mut buf = [0u8; 64 * 1024];
        let mut crc = 0u32;
        loop {
            utils::interrupt::check()?;
            let n = file
                .read(&mut buf)
                .map_err(|e| system_error(format!("reading {}: {e}", entry.path)))?;
            if n == 0 {
                break;
            }
            crc = crc32c::crc32c_append(crc, &buf[..n]);
        }
        if crc != entry.crc {
            return Ok(Some(entry.path.clone()));
        }
    }
    Ok(None)
}

/// `base/`, `global/`, `pg_tblspc/` with a basename whose first character
/// is a digit.
pub fn is_data_file(relative_path: &Utf8Path) -> bool {
    let in_data_dir = relative_path.starts_with("base")
        || relative_path.starts_with("global")
        || relative_path.starts_with("pg_tblspc");
    if !in_data_dir {
        return false;
    }
    relative_path
        .file_name()
        .and_then(|n| n.chars().next())
        .map(|c| c.is_ascii_digit())
        .unwrap_or(false)
}

pub struct WalkOptions<'a> {
    pub exclude: &'a [Utf8PathBuf],
    pub exclude_names: &'a [String],
    /// One absolute path per line, already sorted for binary search.
    pub blacklist: &'a [Utf8PathBuf],
    pub chase_symlinks: bool,
}

/// Depth-first walk of `root`, returned in ascending lexicographic order
/// by absolute path.
pub fn walk(root: &Utf8Path, opts: &WalkOptions) -> RmanResult<Vec<ManifestEntry>> {
    let mut out = Vec::new();
    walk_dir(root, root, opts, 0, &mut out)?;
    out.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(out)
}

const MAX_SYMLINK_DEPTH: u32 = 1;

fn walk_dir(
    root: &Utf8Path,
    dir: &Utf8Path,
    opts: &WalkOptions,
    symlink_depth: u32,
    out: &mut Vec<ManifestEntry>,
) -> RmanResult<()> {
    utils::interrupt::check()?;
    let read_dir = fs::read_dir(dir).map_err(|e| system_error(format!("reading {dir}: {e}")))?;
    for entry in read_dir {
        let entry = entry.map_err(|e| system_error(format!("reading {dir}: {e}")))?;
        let path = Utf8PathBuf::from_path_buf(entry.path())
            .map_err(|p| system_error(format!("non-utf8 path: {p:?}")))?;

        if is_excluded(&path, root, opts) {
            continue;
        }

        let meta = fs::symlink_metadata(&path).map_err(|e| system_error(format!("stat {path}: {e}")))?;
        let file_type = meta.file_type();

        if file_type.is_symlink() {
            if opts.chase_symlinks && symlink_depth < MAX_SYMLINK_DEPTH {
                let target = fs::read_link(&path).map_err(|e| system_error(format!("readlink {path}: {e}")))?;
                let target = if target.is_absolute() {
                    Utf8PathBuf::from_path_buf(target)
                        .map_err(|p| system_error(format!("non-utf8 symlink target: {p:?}")))?
                } else {
                    Utf8PathBuf::from_path_buf(
                        path.parent().unwrap_or(Utf8Path::new("/")).as_std_path().join(&target),
                    )
                    .map_err(|p| system_error(format!("non-utf8 symlink target: {p:?}")))?
                };
                let target_meta = fs::metadata(&target);
                out.push(make_entry(&path, root, &meta, EntryType::Symlink, Some(target.clone()))?);
                if let Ok(tm) = target_meta {
                    if tm.is_dir() {
                        walk_dir(root, &target, opts, symlink_depth + 1, out)?;
                    }
                }
            } else {
                let target = fs::read_link(&path).ok().and_then(|t| Utf8PathBuf::from_path_buf(t).ok());
                out.push(make_entry(&path, root, &meta, EntryType::Symlink, target)?);
            }
        } else if file_type.is_dir() {
            out.push(make_entry(&path, root, &meta, EntryType::Directory, None)?);
            walk_dir(root, &path, opts, symlink_depth, out)?;
        } else if file_type.is_file() {
            let relative = path.strip_prefix(root).unwrap_or(&path);
            let kind = if is_data_file(relative) {
                EntryType::DataFile
            } else {
                EntryType::Regular
            };
            out.push(make_entry(&path, root, &meta, kind, None)?);
        } else if is_socket(&meta) {
            out.push(make_entry(&path, root, &meta, EntryType::Socket, None)?);
        }
        // other special files (fifos, device nodes) are silently skipped,
        // matching the original tool's readdir-driven walk.
    }
    Ok(())
}

fn make_entry(
    path: &Utf8Path,
    _root: &Utf8Path,
    meta: &fs::Metadata,
    kind: EntryType,
    linked_path: Option<Utf8PathBuf>,
) -> RmanResult<ManifestEntry> {
    let mtime = DateTime::<Utc>::from(
        meta.modified()
            .map_err(|e| system_error(format!("mtime of {path}: {e}")))?,
    );
    Ok(ManifestEntry {
        path: path.to_owned(),
        kind,
        write_size: BYTES_INVALID,
        crc: 0,
        mode: meta.permissions().mode() & 0o7777,
        mtime,
        linked_path,
    })
}

fn is_socket(meta: &fs::Metadata) -> bool {
    meta.file_type().is_socket()
}

fn is_excluded(path: &Utf8Path, root: &Utf8Path, opts: &WalkOptions) -> bool {
    if opts.exclude.iter().any(|e| e == path) {
        return true;
    }
    if let Some(name) = path.file_name() {
        if opts.exclude_names.iter().any(|n| n == name) {
            return true;
        }
    }
    if !opts.blacklist.is_empty() && opts.blacklist.binary_search(&path.to_owned()).is_ok() {
        return true;
    }
    let _ = root;
    false
}

/// Parses a blacklist file: one absolute path per non-comment line.
/// Returned pre-sorted for binary search.
pub fn parse_blacklist(text: &str) -> Vec<Utf8PathBuf> {
    let mut out: Vec<Utf8PathBuf> = text
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(Utf8PathBuf::from)
        .collect::<HashSet<_>>()
        .into_iter()
        .collect();
    out.sort();
    out
}

/// Writes `mkdirs.sh`: a shell script that recreates `root`'s directory
/// skeleton, replayed at restore time with CWD = pgdata.
pub fn generate_mkdirs_script(entries: &[ManifestEntry], relative_to: &Utf8Path) -> String {
    let mut out = String::from("#!/bin/sh\n# generated by rman backup, recreates the cluster directory skeleton\n");
    for e in entries {
        if e.kind == EntryType::Directory {
            let rel = e.path.strip_prefix(relative_to).unwrap_or(&e.path);
            out.push_str(&format!("mkdir -m 700 -p {rel}\n"));
        }
    }
    for e in entries {
        if e.kind == EntryType::Symlink {
            if let Some(linked) = &e.linked_path {
                let rel = e.path.strip_prefix(relative_to).unwrap_or(&e.path);
                out.push_str(&format!("rm -f {rel}\nln -s {linked} {rel}\n"));
            }
        }
    }
    out
}
