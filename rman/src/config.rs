//! Layered configuration: compiled-in defaults, overridden by environment
//! variables, overridden by `<root>/pg_rman.ini`, overridden by CLI flags.

use std::env;

use camino::{Utf8Path, Utf8PathBuf};

use crate::ini;
use crate::model::BackupMode;
use utils::error::{args_error, RmanResult};

pub const CONFIG_FILE: &str = "pg_rman.ini";

/// Every field is `None` until some layer sets it; `resolve` folds the
/// layers together and what's left unset falls back to a hardcoded default.
#[derive(Clone, Debug, Default)]
pub struct Config {
    pub backup_path: Option<Utf8PathBuf>,
    pub pgdata: Option<Utf8PathBuf>,
    pub arclog_path: Option<Utf8PathBuf>,
    pub srvlog_path: Option<Utf8PathBuf>,
    pub conninfo: Option<String>,
    pub backup_mode: Option<BackupMode>,
    pub compress_data: Option<bool>,
    pub with_serverlog: Option<bool>,
    pub full_backup_on_error: Option<bool>,
    pub smooth_checkpoint: Option<bool>,
    pub standby: Option<bool>,
    /// -1 (`retention::KEEP_INFINITE`) means "keep forever"; `None` means
    /// "this layer didn't say".
    pub keep_generations: Option<i64>,
    pub keep_days: Option<i64>,
    pub keep_arclog_files: Option<i64>,
    pub keep_arclog_days: Option<i64>,
    pub keep_srvlog_files: Option<i64>,
    pub keep_srvlog_days: Option<i64>,
    pub archive_wait_timeout_secs: Option<u64>,
}

impl Config {
    /// `base` wins where `overlay` leaves a field unset; `overlay` wins
    /// otherwise. Call with layers ordered weakest-first:
    /// `defaults().merge(env).merge(file).merge(cli)`.
    fn merge(self, overlay: Config) -> Config {
        Config {
            backup_path: overlay.backup_path.or(self.backup_path),
            pgdata: overlay.pgdata.or(self.pgdata),
            arclog_path: overlay.arclog_path.or(self.arclog_path),
            srvlog_path: overlay.srvlog_path.or(self.srvlog_path),
            conninfo: overlay.conninfo.or(self.conninfo),
            backup_mode: overlay.backup_mode.or(self.backup_mode),
            compress_data: overlay.compress_data.or(self.compress_data),
            with_serverlog: overlay.with_serverlog.or(self.with_serverlog),
            full_backup_on_error: overlay.full_backup_on_error.or(self.full_backup_on_error),
            smooth_checkpoint: overlay.smooth_checkpoint.or(self.smooth_checkpoint),
            standby: overlay.standby.or(self.standby),
            keep_generations: overlay.keep_generations.or(self.keep_generations),
            keep_days: overlay.keep_days.or(self.keep_days),
            keep_arclog_files: overlay.keep_arclog_files.or(self.keep_arclog_files),
            keep_arclog_days: overlay.keep_arclog_days.or(self.keep_arclog_days),
            keep_srvlog_files: overlay.keep_srvlog_files.or(self.keep_srvlog_files),
            keep_srvlog_days: overlay.keep_srvlog_days.or(self.keep_srvlog_days),
            archive_wait_timeout_secs: overlay.archive_wait_timeout_secs.or(self.archive_wait_timeout_secs),
        }
    }

    pub fn compress_data_or_default(&self) -> bool {
        self.compress_data.unwrap_or(false)
    }

    pub fn with_serverlog_or_default(&self) -> bool {
        self.with_serverlog.unwrap_or(false)
    }

    pub fn full_backup_on_error_or_default(&self) -> bool {
        self.full_backup_on_error.unwrap_or(false)
    }

    pub fn smooth_checkpoint_or_default(&self) -> bool {
        self.smooth_checkpoint.unwrap_or(false)
    }

    pub fn standby_or_default(&self) -> bool {
        self.standby.unwrap_or(false)
    }

    pub fn archive_wait_timeout_or_default(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.archive_wait_timeout_secs.unwrap_or(10))
    }

    /// `-1`/unset both mean "keep forever".
    pub fn keep_generations_resolved(&self) -> Option<u32> {
        resolve_keep(self.keep_generations).map(|v| v as u32)
    }

    pub fn keep_days_resolved(&self) -> Option<i64> {
        resolve_keep(self.keep_days)
    }

    pub fn keep_arclog_files_resolved(&self) -> Option<u32> {
        resolve_keep(self.keep_arclog_files).map(|v| v as u32)
    }

    pub fn keep_arclog_days_resolved(&self) -> Option<i64> {
        resolve_keep(self.keep_arclog_days)
    }

    pub fn keep_srvlog_files_resolved(&self) -> Option<u32> {
        resolve_keep(self.keep_srvlog_files).map(|v| v as u32)
    }

    pub fn keep_srvlog_days_resolved(&self) -> Option<i64> {
        resolve_keep(self.keep_srvlog_days)
    }

    pub fn require_pgdata(&self) -> RmanResult<&Utf8Path> {
        self.pgdata.as_deref().ok_or_else(|| args_error("PGDATA is not set (pass --pgdata, PGDATA, or set it in pg_rman.ini)"))
    }

    pub fn require_backup_path(&self) -> RmanResult<&Utf8Path> {
        self.backup_path
            .as_deref()
            .ok_or_else(|| args_error("BACKUP_PATH is not set (pass --backup-path, BACKUP_PATH, or set it in pg_rman.ini)"))
    }

    pub fn require_conninfo(&self) -> RmanResult<&str> {
        self.conninfo
            .as_deref()
            .ok_or_else(|| args_error("connection info is not set (pass --conninfo, CONNINFO, or set it in pg_rman.ini)"))
    }

    pub fn arclog_path_or_pgdata(&self) -> Option<Utf8PathBuf> {
        self.arclog_path.clone().or_else(|| self.pgdata.clone().map(|p| p.join("pg_wal")))
    }
}

fn resolve_keep(v: Option<i64>) -> Option<i64> {
    match v {
        None => None,
        Some(n) if n < 0 => None,
        Some(n) => Some(n),
    }
}

const KEYS: &[&str] = &[
    "BACKUP_PATH",
    "PGDATA",
    "ARCLOG_PATH",
    "SRVLOG_PATH",
    "CONNINFO",
    "BACKUP_MODE",
    "COMPRESS_DATA",
    "WITH_SERVERLOG",
    "FULL_BACKUP_ON_ERROR",
    "SMOOTH_CHECKPOINT",
    "STANDBY",
    "KEEP_GENERATIONS",
    "KEEP_DAYS",
    "KEEP_ARCLOG_FILES",
    "KEEP_ARCLOG_DAYS",
    "KEEP_SRVLOG_FILES",
    "KEEP_SRVLOG_DAYS",
    "ARCHIVE_WAIT_TIMEOUT",
];

/// Reads every known key out of a `KEY -> string value` map (produced
/// either by environment lookup or by parsing `pg_rman.ini`) and builds a
/// `Config` from whichever keys are present.
fn from_map(get: impl Fn(&str) -> Option<String>) -> RmanResult<Config> {
    let mut cfg = Config::default();
    for key in KEYS {
        let Some(value) = get(key) else { continue };
        apply_key(&mut cfg, key, &value)?;
    }
    Ok(cfg)
}

fn apply_key(cfg: &mut Config, key: &str, value: &str) -> RmanResult<()> {
    let parse_bool = |v: &str| -> RmanResult<bool> {
        match v.to_ascii_lowercase().as_str() {
            "true" | "yes" | "on" | "1" => Ok(true),
            "false" | "no" | "off" | "0" => Ok(false),
            _ => Err(args_error(format!("{key}: not a boolean: {v:?}"))),
        }
    };
    let parse_int = |v: &str| -> RmanResult<i64> { v.parse().map_err(|_| args_error(format!("{key}: not an integer: {v:?}"))) };

    match key {
        "BACKUP_PATH" => cfg.backup_path = Some(Utf8PathBuf::from(value)),
        "PGDATA" => cfg.pgdata = Some(Utf8PathBuf::from(value)),
        "ARCLOG_PATH" => cfg.arclog_path = Some(Utf8PathBuf::from(value)),
        "SRVLOG_PATH" => cfg.srvlog_path = Some(Utf8PathBuf::from(value)),
        "CONNINFO" => cfg.conninfo = Some(value.to_string()),
        "BACKUP_MODE" => cfg.backup_mode = Some(value.parse().map_err(|e| args_error(format!("{key}: {e}")))?),
        "COMPRESS_DATA" => cfg.compress_data = Some(parse_bool(value)?),
        "WITH_SERVERLOG" => cfg.with_serverlog = Some(parse_bool(value)?),
        "FULL_BACKUP_ON_ERROR" => cfg.full_backup_on_error = Some(parse_bool(value)?),
        "SMOOTH_CHECKPOINT" => cfg.smooth_checkpoint = Some(parse_bool(value)?),
        "STANDBY" => cfg.standby = Some(parse_bool(value)?),
        "KEEP_GENERATIONS" => cfg.keep_generations = Some(parse_int(value)?),
        "KEEP_DAYS" => cfg.keep_days = Some(parse_int(value)?),
        "KEEP_ARCLOG_FILES" => cfg.keep_arclog_files = Some(parse_int(value)?),
        "KEEP_ARCLOG_DAYS" => cfg.keep_arclog_days = Some(parse_int(value)?),
        "KEEP_SRVLOG_FILES" => cfg.keep_srvlog_files = Some(parse_int(value)?),
        "KEEP_SRVLOG_DAYS" => cfg.keep_srvlog_days = Some(parse_int(value)?),
        "ARCHIVE_WAIT_TIMEOUT" => cfg.archive_wait_timeout_secs = Some(value.parse().map_err(|_| args_error(format!("{key}: not an integer: {value:?}")))?),
        _ => unreachable!("unknown config key {key}"),
    }
    Ok(())
}

fn from_env() -> RmanResult<Config> {
    from_map(|key| env::var(key).ok())
}

fn from_file(root: &Utf8Path) -> RmanResult<Config> {
    let path = root.join(CONFIG_FILE);
    if !path.exists() {
        return Ok(Config::default());
    }
    let text = std::fs::read_to_string(&path).map_err(|e| args_error(format!("reading {path}: {e}")))?;
    let map = ini::parse(&text)?;
    from_map(|key| map.get(key).cloned())
}

/// Loads the full layered configuration: defaults, then environment, then
/// `<root>/pg_rman.ini`, then `cli` (highest precedence, built from
/// whichever flags the user actually passed on this invocation).
pub fn load(root: &Utf8Path, cli: Config) -> RmanResult<Config> {
    let env = from_env()?;
    let file = from_file(root)?;
    Ok(Config::default().merge(env).merge(file).merge(cli))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_overrides_env_overrides_defaults() {
        let dir = camino_tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(CONFIG_FILE),
            "# configuration\nKEEP_GENERATIONS = '3'\nCOMPRESS_DATA = 'true'\n",
        )
        .unwrap();

        let cli = Config::default();
        let cfg = load(dir.path(), cli).unwrap();
        assert_eq!(cfg.keep_generations_resolved(), Some(3));
        assert!(cfg.compress_data_or_default());
    }

    #[test]
    fn cli_overrides_file() {
        let dir = camino_tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE), "KEEP_GENERATIONS = '3'\n").unwrap();

        let mut cli = Config::default();
        cli.keep_generations = Some(7);
        let cfg = load(dir.path(), cli).unwrap();
        assert_eq!(cfg.keep_generations_resolved(), Some(7));
    }

    #[test]
    fn negative_keep_value_means_infinite() {
        let mut cfg = Config::default();
        cfg.keep_generations = Some(-1);
        assert_eq!(cfg.keep_generations_resolved(), None);
    }

    #[test]
    fn rejects_unparseable_boolean() {
        let dir = camino_tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE), "COMPRESS_DATA = 'maybe'\n").unwrap();
        assert!(load(dir.path(), Config::default()).is_err());
    }
}
