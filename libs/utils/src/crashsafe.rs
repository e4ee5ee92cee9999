//! Durable filesystem primitives: create-and-fsync, rename-and-fsync.
//!
//! Catalog writes (backup records, manifests) must survive a crash right
//! after the write syscall returns; plain `fs::write` doesn't guarantee
//! that without an explicit fsync of the file and its parent directory.

use std::fs::{self, File};
use std::io;
use camino::{Utf8Path, Utf8PathBuf};

pub fn create_dir_all(path: &Utf8Path) -> io::Result<()> {
    fs::create_dir_all(path)?;
    fsync_dir(path)
}

pub fn fsync_dir(path: &Utf8Path) -> io::Result<()> {
    File::open(path)?.sync_all()
}

/// Write `contents` to `path` via a temp file in the same directory, then
/// fsync the file and rename it into place, then fsync the parent
/// directory, so a crash never leaves a partially written file at `path`.
pub fn overwrite(path: &Utf8Path, contents: &[u8]) -> io::Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no parent"))?;
    let tmp_path: Utf8PathBuf = path.with_extension("tmp");
    {
        let mut f = File::create(&tmp_path)?;
        use std::io::Write;
        f.write_all(contents)?;
        f.sync_all()?;
    }
    fs::rename(&tmp_path, path)?;
    fsync_dir(parent)
}

/// Appends `.<suffix>` to the last path component, preserving any existing
/// extension (e.g. `foo.ini` + `tmp` -> `foo.ini.tmp`).
pub fn path_with_suffix_extension(path: &Utf8Path, suffix: &str) -> Utf8PathBuf {
    let file_name = path.file_name().unwrap_or_default();
    path.with_file_name(format!("{file_name}.{suffix}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overwrite_is_atomic_looking() {
        let dir = camino_tempfile::tempdir().unwrap();
        let path = dir.path().join("record.ini");
        overwrite(&path, b"hello").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"hello");
        overwrite(&path, b"world").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"world");
        assert!(!dir.path().join("record.ini.tmp").exists());
    }

    #[test]
    fn suffix_extension() {
        let p = Utf8Path::new("/a/b/backup.ini");
        assert_eq!(path_with_suffix_extension(p, "tmp"), Utf8Path::new("/a/b/backup.ini.tmp"));
    }
}
