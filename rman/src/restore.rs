//! Restore planner and driver.
//!
//! Resolves which full backup, incremental chain, and archived-WAL
//! sources satisfy a recovery target on a given timeline, then drives
//! the actual file restoration and recovery-configuration emission
//! against a target data directory.

use std::fs;
use std::io::Write as _;

use camino::Utf8Path;
use chrono::{DateTime, Utc};

use crate::catalog;
use crate::copier;
use crate::manifest::{self, EntryType, ManifestEntry};
use crate::model::{BackupMode, BackupRecord, BackupStatus};
use pg_types::walnaming::HistoryEntry;
use utils::error::{args_error, corrupted, no_backup, system_error, RmanResult};
use utils::lsn::Lsn;

const POSTGRES_CONF: &str = "postgresql.conf";
const POSTGRES_CONF_TMP: &str = "postgresql.conf.rman.tmp";
const RECOVERY_CONF_FILE: &str = "rman_recovery.conf";
const RMAN_COMMENT: &str = "# added by rman";
const RECOVERY_SIGNAL: &str = "recovery.signal";
const STANDBY_SIGNAL: &str = "standby.signal";

/// The `(time, xid, inclusive, action, timeline)` tuple a restore is
/// driven towards. All fields are optional; an empty target means
/// "restore to the most recent consistent point on the chosen timeline".
#[derive(Clone, Debug, Default)]
pub struct RecoveryTarget {
    pub time: Option<DateTime<Utc>>,
    pub xid: Option<u32>,
    pub inclusive: Option<bool>,
    pub action: Option<RecoveryTargetAction>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecoveryTargetAction {
    Pause,
    Promote,
    Shutdown,
}

impl RecoveryTargetAction {
    pub fn as_str(self) -> &'static str {
        match self {
            RecoveryTargetAction::Pause => "pause",
            RecoveryTargetAction::Promote => "promote",
            RecoveryTargetAction::Shutdown => "shutdown",
        }
    }
}

impl std::str::FromStr for RecoveryTargetAction {
    type Err = utils::error::RmanError;
    fn from_str(s: &str) -> RmanResult<Self> {
        match s.to_ascii_lowercase().as_str() {
            "pause" => Ok(RecoveryTargetAction::Pause),
            "promote" => Ok(RecoveryTargetAction::Promote),
            "shutdown" => Ok(RecoveryTargetAction::Shutdown),
            _ => Err(args_error(format!("invalid recovery target action '{s}'"))),
        }
    }
}

/// `backup.recovery_xid <= target.xid`, else `backup.recovery_time <=
/// target.time`, else unconditionally true. A backup whose recovery
/// time was never recorded is treated as older than any target, the
/// same way the original tool's zeroed timestamp sorts first.
pub fn satisfies_recovery_target(backup: &BackupRecord, target: &RecoveryTarget) -> bool {
    if let Some(xid) = target.xid {
        return backup.recovery_xid <= xid;
    }
    if let Some(time) = target.time {
        return backup.recovery_time.map(|t| t <= time).unwrap_or(true);
    }
    true
}

/// True if some branch has the backup's timeline and the backup's
/// stop_lsn falls before that branch closed.
pub fn satisfies_timeline(branches: &[HistoryEntry], backup: &BackupRecord) -> bool {
    branches.iter().any(|b| b.tli == backup.tli && backup.stop_lsn < b.end_lsn)
}

fn history_file_name(tli: u32) -> String {
    format!("{tli:08X}.history")
}

pub fn timeline_history_exists(history_dir: &Utf8Path, tli: u32) -> bool {
    // Timeline 1 is the root timeline and never has a history file.
    tli != 1 && history_dir.join(history_file_name(tli)).is_file()
}

/// Probes timeline history files upward from `start_tli` and returns the
/// newest one found, assuming no gaps in the sequence.
pub fn find_newest_timeline(history_dir: &Utf8Path, start_tli: u32) -> u32 {
    let mut newest = start_tli;
    let mut probe = start_tli + 1;
    while timeline_history_exists(history_dir, probe) {
        newest = probe;
        probe += 1;
    }
    newest
}

/// Parses `--recovery-target-timeline`, which accepts either a numeric
/// TLI or the literal `latest`.
pub fn resolve_target_timeline(spec: &str, current_tli: u32, history_dir: &Utf8Path) -> RmanResult<(u32, bool)> {
    if spec == "latest" {
        Ok((find_newest_timeline(history_dir, current_tli), true))
    } else {
        let tli: u32 = spec
            .parse()
            .map_err(|_| args_error("--recovery-target-timeline must be a 32-bit integer or 'latest'"))?;
        Ok((tli, false))
    }
}

/// Reads `<history_dir>/NNNNNNNN.history` (falling back to
/// `<fallback_dir>/NNNNNNNN.history` if the primary copy is missing) and
/// returns every ancestor timeline plus a sentinel `(target_tli, MAX)`
/// entry so the target timeline itself always satisfies.
pub fn read_timeline_branches(history_dir: &Utf8Path, fallback_dir: &Utf8Path, target_tli: u32) -> RmanResult<Vec<HistoryEntry>> {
    let name = history_file_name(target_tli);
    let primary = history_dir.join(&name);
    let fallback = fallback_dir.join(&name);

    let text = match fs::read_to_string(&primary) {
        Ok(t) => Some(t),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => match fs::read_to_string(&fallback) {
            Ok(t) => Some(t),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(system_error(format!("reading {fallback}: {e}"))),
        },
        Err(e) => return Err(system_error(format!("reading {primary}: {e}"))),
    };

    let mut branches = match text {
        Some(t) => pg_types::walnaming::parse_history(&t).map_err(|e| corrupted(format!("{primary}: {e}")))?,
        None => Vec::new(),
    };

    if let Some(last) = branches.last() {
        if target_tli <= last.tli {
            return Err(corrupted("timeline IDs must be less than the child timeline's ID"));
        }
    }

    branches.push(HistoryEntry {
        tli: target_tli,
        end_lsn: Lsn(u64::MAX),
    });
    Ok(branches)
}

/// The TLI of the newest full backup that satisfies `target`, used to
/// pick a default recovery target timeline when the caller didn't name
/// one explicitly.
pub fn full_backup_timeline(backups_desc: &[BackupRecord], target: &RecoveryTarget) -> RmanResult<u32> {
    backups_desc
        .iter()
        .find(|b| b.mode == BackupMode::Full && b.status == BackupStatus::Ok && satisfies_recovery_target(b, target))
        .map(|b| b.tli)
        .ok_or_else(|| no_backup("there is no valid full backup which can be used for the given recovery condition"))
}

/// A resolved restore plan: a base full backup, zero or more incremental
/// backups to apply on top of it (in ascending start-time order), and
/// the set of backups to pull archived WAL from (also ascending).
#[derive(Clone, Debug)]
pub struct RestorePlan {
    pub base: BackupRecord,
    pub incrementals: Vec<BackupRecord>,
    pub archive_sources: Vec<BackupRecord>,
}

/// `backups_desc` must be sorted newest-first (the catalog's natural
/// listing order).
pub fn plan_restore(backups_desc: &[BackupRecord], branches: &[HistoryEntry], target: &RecoveryTarget) -> RmanResult<RestorePlan> {
    let base_index = backups_desc
        .iter()
        .position(|b| {
            b.mode == BackupMode::Full
                && b.status == BackupStatus::Ok
                && satisfies_timeline(branches, b)
                && satisfies_recovery_target(b, target)
        })
        .ok_or_else(|| no_backup("there is no valid full backup which can be used for the given recovery condition"))?;

    let base = backups_desc[base_index].clone();

    let mut incrementals = Vec::new();
    let mut last_restored_index = base_index;
    for j in (0..base_index).rev() {
        let candidate = &backups_desc[j];
        if candidate.status == BackupStatus::Ok
            && candidate.tli == base.tli
            && candidate.mode == BackupMode::Incremental
            && satisfies_timeline(branches, candidate)
            && satisfies_recovery_target(candidate, target)
        {
            incrementals.push(candidate.clone());
            last_restored_index = j;
        }
    }

    let mut archive_sources = Vec::new();
    for k in (0..=last_restored_index).rev() {
        let candidate = &backups_desc[k];
        if candidate.status == BackupStatus::Ok && candidate.mode.have_arclog() && satisfies_timeline(branches, candidate) {
            archive_sources.push(candidate.clone());
        }
    }

    Ok(RestorePlan {
        base,
        incrementals,
        archive_sources,
    })
}

/// Removes every entry under `pgdata`, deepest first, without removing
/// `pgdata` itself. Only called once a valid base backup has already
/// been found, so a failed target search never destroys live data.
pub fn wipe_destination(pgdata: &Utf8Path) -> RmanResult<()> {
    let opts = manifest::WalkOptions {
        exclude: &[],
        exclude_names: &[],
        blacklist: &[],
        chase_symlinks: false,
    };
    let mut entries = manifest::walk(pgdata, &opts)?;
    entries.sort_by(|a, b| b.path.cmp(&a.path));
    for entry in entries {
        utils::interrupt::check()?;
        let result = match entry.kind {
            EntryType::Directory => fs::remove_dir(&entry.path),
            _ => fs::remove_file(&entry.path),
        };
        if let Err(e) = result {
            if e.kind() != std::io::ErrorKind::NotFound {
                return Err(system_error(format!("removing {}: {e}", entry.path)));
            }
        }
    }
    Ok(())
}

/// Restores one backup's manifested database files into `pgdata`,
/// verifying their on-disk crc32c first. Directories, symlinks, and
/// sockets carry no backed-up bytes (mkdirs.sh already recreated them);
/// entries with `write_size == BYTES_INVALID` (incremental-skipped
/// blocks) are likewise not copied. `DataFile` entries were written in
/// the page-delta format and go through `restore_data_file`; everything
/// else was copied verbatim (optionally gzipped) and is restored the
/// same way.
pub fn restore_database(backup: &BackupRecord, root: &Utf8Path, pgdata: &Utf8Path) -> RmanResult<()> {
    let database_dir = backup.database_dir(root);
    let list_path = backup.path(root).join(catalog::DATABASE_FILE_LIST);
    let text = fs::read_to_string(&list_path).map_err(|e| system_error(format!("reading {list_path}: {e}")))?;
    let entries = manifest::read_manifest(&text, Some(&database_dir))?;

    if let Some(bad) = manifest::verify_entries(&database_dir, &entries)? {
        return Err(corrupted(format!("{bad}: crc32c mismatch, backup is corrupt")));
    }

    run_mkdirs_script(&backup.path(root).join(catalog::MKDIRS_SH_FILE), pgdata)?;

    for entry in &entries {
        utils::interrupt::check()?;
        if matches!(entry.kind, EntryType::Directory | EntryType::Symlink | EntryType::Socket) || entry.is_skipped() {
            continue;
        }
        let relative = entry.path.strip_prefix(&database_dir).unwrap_or(&entry.path);
        let dst = pgdata.join(relative);
        if entry.kind == EntryType::DataFile {
            copier::restore_data_file(&entry.path, &dst, backup.compress_data)?;
        } else {
            let mode = if backup.compress_data { copier::CopyMode::Decompressed } else { copier::CopyMode::Plain };
            copier::copy_file(&entry.path, &dst, mode)?;
        }
    }
    Ok(())
}

/// Removes every regular/data file under `pgdata` whose relative path
/// isn't named by any manifest in `applied_database_dirs`, then drops
/// `postmaster.pid` unconditionally. Run once after the full backup and
/// every incremental in a plan have been applied, so a file dropped by
/// an incremental (renamed or truncated relation, removed tablespace
/// member) doesn't linger from an earlier layer.
pub fn prune_unlisted_files(pgdata: &Utf8Path, applied_database_dirs: &[&Utf8Path]) -> RmanResult<()> {
    let mut keep = std::collections::HashSet::new();
    let opts = manifest::WalkOptions {
        exclude: &[],
        exclude_names: &[],
        blacklist: &[],
        chase_symlinks: false,
    };
    for database_dir in applied_database_dirs {
        for entry in manifest::walk(database_dir, &opts)? {
            if entry.kind == EntryType::Directory {
                continue;
            }
            let relative = entry.path.strip_prefix(database_dir).unwrap_or(&entry.path).to_owned();
            keep.insert(relative);
        }
    }

    for entry in manifest::walk(pgdata, &opts)? {
        utils::interrupt::check()?;
        if entry.kind == EntryType::Directory {
            continue;
        }
        let relative = entry.path.strip_prefix(pgdata).unwrap_or(&entry.path).to_owned();
        if !keep.contains(&relative) {
            fs::remove_file(&entry.path).map_err(|e| system_error(format!("removing {}: {e}", entry.path)))?;
        }
    }

    remove_postmaster_pid(pgdata)
}

fn remove_postmaster_pid(pgdata: &Utf8Path) -> RmanResult<()> {
    let path = pgdata.join("postmaster.pid");
    match fs::remove_file(&path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(system_error(format!("removing {path}: {e}"))),
    }
}

/// Restores a backup's archived WAL into `arclog_path`. `.history`
/// files are skipped; they were already restored from the catalog's
/// `timeline_history/` directory. When `hard_copy` is false a symlink
/// back to the catalog's stored copy is created instead of duplicating
/// the bytes.
pub fn restore_archive_logs(backup: &BackupRecord, root: &Utf8Path, arclog_path: &Utf8Path, hard_copy: bool) -> RmanResult<()> {
    let arclog_dir = backup.arclog_dir(root);
    let list_path = backup.path(root).join(catalog::ARCLOG_FILE_LIST);
    let text = fs::read_to_string(&list_path).map_err(|e| system_error(format!("reading {list_path}: {e}")))?;
    let entries = manifest::read_manifest(&text, Some(&arclog_dir))?;

    if let Some(bad) = manifest::verify_entries(&arclog_dir, &entries)? {
        return Err(corrupted(format!("{bad}: crc32c mismatch, backup is corrupt")));
    }

    for entry in &entries {
        utils::interrupt::check()?;
        if entry.kind == EntryType::Directory || entry.is_skipped() {
            continue;
        }
        let relative = entry.path.strip_prefix(&arclog_dir).unwrap_or(&entry.path);
        if relative.as_str().ends_with(".history") {
            continue;
        }
        let dst = arclog_path.join(relative);
        if let Err(e) = fs::remove_file(&dst) {
            if e.kind() != std::io::ErrorKind::NotFound {
                return Err(system_error(format!("removing {dst}: {e}")));
            }
        }

        if backup.compress_data {
            copier::copy_file(&entry.path, &dst, copier::CopyMode::Decompressed)?;
        } else if hard_copy {
            copier::copy_file(&entry.path, &dst, copier::CopyMode::Plain)?;
        } else {
            std::os::unix::fs::symlink(&entry.path, &dst).map_err(|e| system_error(format!("linking {dst}: {e}")))?;
        }
    }
    Ok(())
}

/// Replays a backup's `mkdirs.sh` with `pgdata` as the working directory,
/// recreating the cluster's directory skeleton (and any tablespace
/// symlinks) before individual files are restored onto it.
fn run_mkdirs_script(script: &Utf8Path, pgdata: &Utf8Path) -> RmanResult<()> {
    let status = std::process::Command::new("sh")
        .arg(script.as_std_path())
        .current_dir(pgdata.as_std_path())
        .status()
        .map_err(|e| system_error(format!("running {script}: {e}")))?;
    if !status.success() {
        return Err(system_error(format!("{script} exited with {status}")));
    }
    Ok(())
}

const PG_WAL_STAGING_SUBDIR: &str = "pg_wal";

/// Copies the live cluster's online WAL and server logs into the
/// catalog's restore staging area (`<root>/<RESTORE_WORK_DIR>/`), unless
/// a staged copy already exists and this isn't a re-recovery (timeline
/// changed since the last restore attempt).
pub fn stage_online_files(root: &Utf8Path, pgdata: &Utf8Path, srvlog_path: &Utf8Path, re_recovery: bool) -> RmanResult<()> {
    let work_wal = root.join(catalog::RESTORE_WORK_DIR).join(PG_WAL_STAGING_SUBDIR);
    let already_staged = work_wal.is_dir() && fs::read_dir(&work_wal).map(|mut d| d.next().is_some()).unwrap_or(false);
    if already_staged && !re_recovery {
        return Ok(());
    }

    utils::crashsafe::create_dir_all(&work_wal).map_err(|e| system_error(format!("creating {work_wal}: {e}")))?;
    copy_tree(&pgdata.join(catalog::PG_WAL_DIR_NAME), &work_wal)?;

    let work_srvlog = root.join(catalog::RESTORE_WORK_DIR).join("srvlog");
    utils::crashsafe::create_dir_all(&work_srvlog).map_err(|e| system_error(format!("creating {work_srvlog}: {e}")))?;
    if srvlog_path.is_dir() {
        copy_tree(srvlog_path, &work_srvlog)?;
    }
    Ok(())
}

/// Copies the staged online WAL back into `<pgdata>/pg_wal/`.
pub fn restore_online_files(root: &Utf8Path, pgdata: &Utf8Path) -> RmanResult<()> {
    let work_wal = root.join(catalog::RESTORE_WORK_DIR).join(PG_WAL_STAGING_SUBDIR);
    copy_tree(&work_wal, &pgdata.join(catalog::PG_WAL_DIR_NAME))
}

fn copy_tree(src: &Utf8Path, dst: &Utf8Path) -> RmanResult<()> {
    if !src.is_dir() {
        return Ok(());
    }
    let opts = manifest::WalkOptions {
        exclude: &[],
        exclude_names: &[],
        blacklist: &[],
        chase_symlinks: false,
    };
    for entry in manifest::walk(src, &opts)? {
        utils::interrupt::check()?;
        let relative = entry.path.strip_prefix(src).unwrap_or(&entry.path);
        let to = dst.join(relative);
        match entry.kind {
            EntryType::Directory => {
                utils::crashsafe::create_dir_all(&to).map_err(|e| system_error(format!("creating {to}: {e}")))?;
            }
            _ => {
                copier::copy_file(&entry.path, &to, copier::CopyMode::Plain)?;
            }
        }
    }
    Ok(())
}

/// Writes `<pgconf_path>/rman_recovery.conf` with `restore_command` plus
/// whichever recovery-target parameters are set, then ensures exactly
/// one `include` directive for it in `postgresql.conf`, and finally
/// drops `recovery.signal` in place of any `standby.signal`.
pub fn configure_recovery(
    pgconf_path: &Utf8Path,
    pgdata: &Utf8Path,
    arclog_path: &Utf8Path,
    target: &RecoveryTarget,
    target_tli: u32,
    target_tli_latest: bool,
) -> RmanResult<()> {
    let conf_path = pgconf_path.join(POSTGRES_CONF);
    if !conf_path.is_file() {
        tracing::warn!(%conf_path, "postgresql.conf not found, skipping recovery configuration");
        return Ok(());
    }

    write_recovery_configuration_file(pgconf_path, arclog_path, target, target_tli, target_tli_latest)?;
    include_recovery_configuration(pgconf_path)?;
    create_recovery_signal(pgdata)?;
    remove_standby_signal(pgdata)?;
    Ok(())
}

fn write_recovery_configuration_file(
    pgconf_path: &Utf8Path,
    arclog_path: &Utf8Path,
    target: &RecoveryTarget,
    target_tli: u32,
    target_tli_latest: bool,
) -> RmanResult<()> {
    let path = pgconf_path.join(RECOVERY_CONF_FILE);
    let mut out = String::new();
    out.push_str(&format!("{RMAN_COMMENT}\n"));
    out.push_str(&format!("restore_command = 'cp {arclog_path}/%f %p'\n"));
    if let Some(time) = target.time {
        out.push_str(&format!("recovery_target_time = '{}'\n", time.format("%Y-%m-%d %H:%M:%S")));
    }
    if let Some(xid) = target.xid {
        out.push_str(&format!("recovery_target_xid = '{xid}'\n"));
    }
    if let Some(inclusive) = target.inclusive {
        out.push_str(&format!("recovery_target_inclusive = '{inclusive}'\n"));
    }
    if target_tli_latest {
        out.push_str("recovery_target_timeline = 'latest'\n");
    } else {
        out.push_str(&format!("recovery_target_timeline = '{target_tli}'\n"));
    }
    if let Some(action) = target.action {
        out.push_str(&format!("recovery_target_action = '{}'\n", action.as_str()));
    }
    utils::crashsafe::overwrite(&path, out.as_bytes()).map_err(|e| system_error(format!("writing {path}: {e}")))
}

fn include_recovery_configuration(pgconf_path: &Utf8Path) -> RmanResult<()> {
    remove_include_directive(pgconf_path)?;
    append_include_directive(pgconf_path)
}

fn remove_include_directive(pgconf_path: &Utf8Path) -> RmanResult<()> {
    let path = pgconf_path.join(POSTGRES_CONF);
    let tmp_path = pgconf_path.join(POSTGRES_CONF_TMP);

    let text = fs::read_to_string(&path).map_err(|e| system_error(format!("reading {path}: {e}")))?;
    let filtered: String = text
        .lines()
        .filter(|line| !(line.contains("include") && line.contains(RECOVERY_CONF_FILE)))
        .map(|line| format!("{line}\n"))
        .collect();

    fs::write(&tmp_path, filtered).map_err(|e| system_error(format!("writing {tmp_path}: {e}")))?;
    fs::rename(&tmp_path, &path).map_err(|e| system_error(format!("renaming {tmp_path} to {path}: {e}")))
}

fn append_include_directive(pgconf_path: &Utf8Path) -> RmanResult<()> {
    let path = pgconf_path.join(POSTGRES_CONF);
    let mut f = fs::OpenOptions::new()
        .append(true)
        .open(&path)
        .map_err(|e| system_error(format!("opening {path}: {e}")))?;
    writeln!(f, "include = '{RECOVERY_CONF_FILE}' {RMAN_COMMENT}").map_err(|e| system_error(format!("writing {path}: {e}")))
}

fn create_recovery_signal(pgdata: &Utf8Path) -> RmanResult<()> {
    let path = pgdata.join(RECOVERY_SIGNAL);
    fs::write(&path, format!("{RMAN_COMMENT}\n")).map_err(|e| system_error(format!("writing {path}: {e}")))
}

fn remove_standby_signal(pgdata: &Utf8Path) -> RmanResult<()> {
    let path = pgdata.join(STANDBY_SIGNAL);
    match fs::remove_file(&path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(system_error(format!("removing {path}: {e}"))),
    }
}

/// Everything a `restore` invocation needs besides the catalog itself.
pub struct RestoreRequest<'a> {
    pub pgdata: &'a Utf8Path,
    pub arclog_path: &'a Utf8Path,
    pub srvlog_path: &'a Utf8Path,
    pub target: RecoveryTarget,
    pub target_timeline: Option<&'a str>,
    pub hard_copy: bool,
}

/// Drives a full restore end to end: resolve the target timeline, build
/// a plan, wipe the destination, lay down the base backup and every
/// incremental on top of it in order, prune files no layer re-listed,
/// restore matching archived WAL, and write recovery configuration.
/// Returns the plan that was applied, so callers can report it.
pub fn restore(root: &Utf8Path, req: &RestoreRequest) -> RmanResult<RestorePlan> {
    let backups = catalog::list(root)?;
    let current_tli = backups
        .iter()
        .find(|b| b.mode == BackupMode::Full && b.status == BackupStatus::Ok)
        .map(|b| b.tli)
        .unwrap_or(1);

    let history_dir = root.join(catalog::TIMELINE_HISTORY_DIR);
    let staged_wal = root.join(catalog::RESTORE_WORK_DIR).join(PG_WAL_STAGING_SUBDIR);

    let (target_tli, target_tli_latest) = match req.target_timeline {
        Some(spec) => resolve_target_timeline(spec, current_tli, &history_dir)?,
        None => (full_backup_timeline(&backups, &req.target)?, false),
    };

    let branches = read_timeline_branches(&history_dir, &staged_wal, target_tli)?;
    let plan = plan_restore(&backups, &branches, &req.target)?;

    stage_online_files(root, req.pgdata, req.srvlog_path, true)?;
    wipe_destination(req.pgdata)?;

    restore_database(&plan.base, root, req.pgdata)?;
    let mut applied_dirs = vec![plan.base.database_dir(root)];
    for inc in &plan.incrementals {
        restore_database(inc, root, req.pgdata)?;
        applied_dirs.push(inc.database_dir(root));
    }
    let applied_refs: Vec<&Utf8Path> = applied_dirs.iter().map(|p| p.as_path()).collect();
    prune_unlisted_files(req.pgdata, &applied_refs)?;

    for source in &plan.archive_sources {
        restore_archive_logs(source, root, req.arclog_path, req.hard_copy)?;
    }
    restore_online_files(root, req.pgdata)?;

    configure_recovery(req.pgdata, req.pgdata, req.arclog_path, &req.target, target_tli, target_tli_latest)?;

    tracing::info!(
        base = %plan.base.start_time,
        incrementals = plan.incrementals.len(),
        archive_sources = plan.archive_sources.len(),
        "restore complete"
    );
    Ok(plan)
}
