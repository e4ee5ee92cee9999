//! `init`: creates a new, empty catalog at a directory.

use camino::Utf8Path;

use crate::catalog;
use utils::error::{args_error, system_error, RmanResult};

pub const DEFAULT_CONFIG_TEMPLATE: &str = "# pg_rman.ini\n# Uncomment and edit as needed.\n#BACKUP_MODE = 'FULL'\n#COMPRESS_DATA = 'false'\n#KEEP_GENERATIONS = '-1'\n#KEEP_DAYS = '-1'\n";

/// Creates `root` if missing, lays out the three top-level subdirectories,
/// the lock file, and a starter `pg_rman.ini`. Fails if `root` exists and
/// already looks like something other than an empty directory or an
/// existing catalog (has a `backup.ini`-bearing subtree already).
pub fn init(root: &Utf8Path) -> RmanResult<()> {
    if root.exists() {
        let mut entries = std::fs::read_dir(root).map_err(|e| system_error(format!("reading {root}: {e}")))?;
        let already_catalog = root.join(catalog::LOCK_FILE).exists();
        if entries.next().is_some() && !already_catalog {
            return Err(args_error(format!("{root} is not empty and is not an existing catalog")));
        }
    } else {
        utils::crashsafe::create_dir_all(root).map_err(|e| system_error(format!("creating {root}: {e}")))?;
    }

    catalog::ensure_lock_file(root)?;

    let config_path = root.join(crate::config::CONFIG_FILE);
    if !config_path.exists() {
        utils::crashsafe::overwrite(&config_path, DEFAULT_CONFIG_TEMPLATE.as_bytes())
            .map_err(|e| system_error(format!("writing {config_path}: {e}")))?;
    }

    tracing::info!(%root, "catalog initialized");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_creates_lock_and_config() {
        let dir = camino_tempfile::tempdir().unwrap();
        let root = dir.path().join("catalog");
        init(&root).unwrap();
        assert!(root.join(catalog::LOCK_FILE).exists());
        assert!(root.join(crate::config::CONFIG_FILE).exists());
    }

    #[test]
    fn init_is_idempotent_on_existing_catalog() {
        let dir = camino_tempfile::tempdir().unwrap();
        let root = dir.path().join("catalog");
        init(&root).unwrap();
        init(&root).unwrap();
    }

    #[test]
    fn init_rejects_nonempty_non_catalog_directory() {
        let dir = camino_tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("surprise"), b"x").unwrap();
        assert!(init(dir.path()).is_err());
    }
}
