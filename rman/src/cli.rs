//! Command-line surface: argument parsing, config layering, and verb
//! dispatch. `bin/rman.rs` is a thin wrapper around [`run`].

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};

use crate::config::Config;
use crate::model::BackupMode;
use crate::retention::LogStream;
use crate::{backup, catalog, config, daterange, init, pgctrl, restore, retention, show, validate};
use utils::error::{args_error, RmanResult};

#[derive(Parser, Debug)]
#[command(name = "rman", about = "Online backup and point-in-time recovery")]
pub struct Cli {
    /// Catalog root. Falls back to $BACKUP_PATH, then pg_rman.ini's own
    /// BACKUP_PATH is irrelevant here since this locates that very file.
    #[arg(short = 'B', long = "backup-path", global = true)]
    pub backup_path: Option<Utf8PathBuf>,

    #[arg(short = 'D', long = "pgdata", global = true)]
    pub pgdata: Option<Utf8PathBuf>,

    #[arg(long = "arclog-path", global = true)]
    pub arclog_path: Option<Utf8PathBuf>,

    #[arg(long = "srvlog-path", global = true)]
    pub srvlog_path: Option<Utf8PathBuf>,

    #[arg(short = 'c', long = "conninfo", global = true)]
    pub conninfo: Option<String>,

    #[arg(long = "log-format", default_value = "plain", global = true)]
    pub log_format: String,

    #[arg(long = "log-level", default_value = "info", global = true)]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Create an empty catalog at --backup-path.
    Init,

    /// Take an online backup.
    Backup {
        #[arg(short = 'b', long = "backup-mode")]
        mode: Option<String>,
        #[arg(short = 'Z', long = "compress-data")]
        compress_data: bool,
        #[arg(short = 's', long = "with-serverlog")]
        with_serverlog: bool,
        #[arg(short = 'C', long = "smooth-checkpoint")]
        smooth_checkpoint: bool,
        #[arg(long = "standby")]
        standby: bool,
        #[arg(short = 'F', long = "full-backup-on-error")]
        full_backup_on_error: bool,
        #[arg(long = "keep-generations")]
        keep_generations: Option<i64>,
        #[arg(long = "keep-days")]
        keep_days: Option<i64>,
    },

    /// Restore a cluster from the catalog.
    Restore {
        #[arg(long = "recovery-target-time")]
        recovery_target_time: Option<String>,
        #[arg(long = "recovery-target-xid")]
        recovery_target_xid: Option<u32>,
        #[arg(long = "recovery-target-inclusive")]
        recovery_target_inclusive: Option<bool>,
        #[arg(long = "recovery-target-action")]
        recovery_target_action: Option<String>,
        #[arg(long = "recovery-target-timeline")]
        recovery_target_timeline: Option<String>,
        #[arg(long = "hard-copy")]
        hard_copy: bool,
    },

    /// List backups, or show one in detail.
    Show {
        #[arg(long = "detail")]
        detail: bool,
        date: Vec<String>,
    },

    /// Recompute checksums and flip status to OK/CORRUPT.
    Validate { date: Vec<String> },

    /// Delete backups older than DATE.
    Delete {
        date: String,
        #[arg(long = "force")]
        force: bool,
    },

    /// Reclaim disk space for backups already marked DELETED.
    Purge,
}

/// Everything every verb needs but `init`: the resolved catalog root
/// plus the layered config.
struct Context {
    root: Utf8PathBuf,
    config: Config,
}

fn resolve_root(cli_backup_path: Option<&Utf8Path>) -> RmanResult<Utf8PathBuf> {
    if let Some(p) = cli_backup_path {
        return Ok(p.to_path_buf());
    }
    std::env::var("BACKUP_PATH")
        .ok()
        .map(Utf8PathBuf::from)
        .ok_or_else(|| args_error("no catalog given: pass --backup-path or set $BACKUP_PATH"))
}

fn build_context(cli: &Cli) -> RmanResult<Context> {
    let root = resolve_root(cli.backup_path.as_deref())?;
    let mut overlay = Config::default();
    overlay.backup_path = Some(root.clone());
    overlay.pgdata = cli.pgdata.clone();
    overlay.arclog_path = cli.arclog_path.clone();
    overlay.srvlog_path = cli.srvlog_path.clone();
    overlay.conninfo = cli.conninfo.clone();
    let cfg = config::load(&root, overlay)?;
    Ok(Context { root, config: cfg })
}

pub fn run(cli: Cli) -> RmanResult<()> {
    let format = cli.log_format.parse().map_err(|e| args_error(format!("{e}")))?;
    let _ = utils::logging::init(format, &cli.log_level);

    if let Commands::Init = &cli.command {
        let root = resolve_root(cli.backup_path.as_deref())?;
        init::init(&root)?;
        println!("catalog initialized at {root}");
        return Ok(());
    }

    let ctx = build_context(&cli)?;

    match &cli.command {
        Commands::Init => unreachable!(),
        Commands::Backup {
            mode,
            compress_data,
            with_serverlog,
            smooth_checkpoint,
            standby,
            full_backup_on_error,
            keep_generations,
            keep_days,
        } => run_backup(&ctx, mode.as_deref(), *compress_data, *with_serverlog, *smooth_checkpoint, *standby, *full_backup_on_error, *keep_generations, *keep_days),
        Commands::Restore {
            recovery_target_time,
            recovery_target_xid,
            recovery_target_inclusive,
            recovery_target_action,
            recovery_target_timeline,
            hard_copy,
        } => run_restore(
            &ctx,
            recovery_target_time.as_deref(),
            *recovery_target_xid,
            *recovery_target_inclusive,
            recovery_target_action.as_deref(),
            recovery_target_timeline.as_deref(),
            *hard_copy,
        ),
        Commands::Show { detail, date } => run_show(&ctx, *detail, date),
        Commands::Validate { date } => run_validate(&ctx, date),
        Commands::Delete { date, force } => run_delete(&ctx, date, *force),
        Commands::Purge => run_purge(&ctx),
    }
}

#[allow(clippy::too_many_arguments)]
fn run_backup(
    ctx: &Context,
    mode: Option<&str>,
    compress_data: bool,
    with_serverlog: bool,
    smooth_checkpoint: bool,
    standby: bool,
    full_backup_on_error: bool,
    keep_generations: Option<i64>,
    keep_days: Option<i64>,
) -> RmanResult<()> {
    let cfg = &ctx.config;
    let pgdata = cfg.require_pgdata()?;
    let conninfo = cfg.require_conninfo()?;
    let arclog_path = cfg.arclog_path_or_pgdata().ok_or_else(|| args_error("ARCLOG_PATH or PGDATA must be set"))?;
    let srvlog_path = cfg.srvlog_path.clone().unwrap_or_else(|| Utf8PathBuf::from("/var/log/postgresql"));

    let mode = match mode {
        Some(s) => s.parse().map_err(|e| args_error(format!("{e}")))?,
        None => cfg.backup_mode.unwrap_or(BackupMode::Full),
    };

    let mut retention_cfg = cfg.clone();
    if let Some(v) = keep_generations {
        retention_cfg.keep_generations = Some(v);
    }
    if let Some(v) = keep_days {
        retention_cfg.keep_days = Some(v);
    }

    let mut control = pgctrl::PgConnection::connect(conninfo, pgctrl::DEFAULT_WAL_SEGMENT_SIZE)?;
    let opts = backup::BackupOptions {
        mode,
        compress_data: compress_data || cfg.compress_data_or_default(),
        with_serverlog: with_serverlog || cfg.with_serverlog_or_default(),
        full_backup_on_error: full_backup_on_error || cfg.full_backup_on_error_or_default(),
        smooth_checkpoint: smooth_checkpoint || cfg.smooth_checkpoint_or_default(),
        standby: standby || cfg.standby_or_default(),
        archive_wait_timeout: cfg.archive_wait_timeout_or_default(),
        retention: retention::RetentionPolicy {
            keep_generations: retention_cfg.keep_generations_resolved(),
            keep_days: retention_cfg.keep_days_resolved(),
        },
    };

    let record = backup::run(&ctx.root, pgdata, &arclog_path, &srvlog_path, &mut control, &opts)?;
    println!("backup {} completed with status {}", record.start_time.format("%Y-%m-%d %H:%M:%S"), record.status.as_str());

    retention::prune_log_stream(&ctx.root, LogStream::Archive, cfg.keep_arclog_files_resolved(), cfg.keep_arclog_days_resolved(), Utc::now(), pgctrl::DEFAULT_WAL_SEGMENT_SIZE)?;
    retention::prune_log_stream(&ctx.root, LogStream::Server, cfg.keep_srvlog_files_resolved(), cfg.keep_srvlog_days_resolved(), Utc::now(), pgctrl::DEFAULT_WAL_SEGMENT_SIZE)?;
    Ok(())
}

fn run_restore(
    ctx: &Context,
    recovery_target_time: Option<&str>,
    recovery_target_xid: Option<u32>,
    recovery_target_inclusive: Option<bool>,
    recovery_target_action: Option<&str>,
    recovery_target_timeline: Option<&str>,
    hard_copy: bool,
) -> RmanResult<()> {
    let cfg = &ctx.config;
    let pgdata = cfg.require_pgdata()?;
    let arclog_path = cfg.arclog_path_or_pgdata().ok_or_else(|| args_error("ARCLOG_PATH or PGDATA must be set"))?;
    let srvlog_path = cfg.srvlog_path.clone().unwrap_or_else(|| Utf8PathBuf::from("/var/log/postgresql"));

    let target = restore::RecoveryTarget {
        time: recovery_target_time
            .map(|s| {
                let (start, _) = daterange::parse_token(s)?;
                Ok::<DateTime<Utc>, utils::error::RmanError>(start)
            })
            .transpose()?,
        xid: recovery_target_xid,
        inclusive: recovery_target_inclusive,
        action: recovery_target_action.map(|s| s.parse()).transpose()?,
    };

    let req = restore::RestoreRequest {
        pgdata,
        arclog_path: &arclog_path,
        srvlog_path: &srvlog_path,
        target,
        target_timeline: recovery_target_timeline,
        hard_copy,
    };
    let plan = restore::restore(&ctx.root, &req)?;
    println!(
        "restored from base backup {} plus {} incremental(s), {} archive source(s)",
        plan.base.start_time.format("%Y-%m-%d %H:%M:%S"),
        plan.incrementals.len(),
        plan.archive_sources.len()
    );
    Ok(())
}

fn run_show(ctx: &Context, detail: bool, date: &[String]) -> RmanResult<()> {
    if !detail && date.is_empty() {
        println!("{}", show::show_table(&ctx.root)?);
        return Ok(());
    }

    let backups = catalog::list(&ctx.root)?;
    let matches: Vec<_> = if date.is_empty() {
        backups.iter().collect()
    } else {
        let (start, end) = daterange::parse_range(date)?;
        backups.iter().filter(|b| b.start_time >= start && b.start_time < end).collect()
    };

    if matches.is_empty() {
        return Err(utils::error::no_backup("no backup matches the given date"));
    }

    if detail {
        for b in matches {
            println!("{}", show::render_detail(b));
        }
    } else {
        for b in matches {
            println!("{} {} {}", b.start_time.format("%Y-%m-%d %H:%M:%S"), b.mode.as_str(), b.status.as_str());
        }
    }
    Ok(())
}

fn run_validate(ctx: &Context, date: &[String]) -> RmanResult<()> {
    let mut backups = catalog::list(&ctx.root)?;
    let range = if date.is_empty() { None } else { Some(daterange::parse_range(date)?) };

    let mut any = false;
    for backup in backups.iter_mut() {
        if let Some((start, end)) = range {
            if backup.start_time < start || backup.start_time >= end {
                continue;
            }
        }
        any = true;
        let outcome = validate::validate_one(&ctx.root, backup)?;
        println!("{} {}: {:?}", backup.start_time.format("%Y-%m-%d %H:%M:%S"), backup.mode.as_str(), outcome);
    }
    if !any {
        return Err(utils::error::no_backup("no backup matches the given date"));
    }
    Ok(())
}

fn run_delete(ctx: &Context, date: &str, force: bool) -> RmanResult<()> {
    let (_, end) = daterange::parse_token(date)?;
    let deleted = retention::delete_before(&ctx.root, end, force)?;
    retention::purge_deleted(&ctx.root)?;
    println!("deleted {deleted} backup(s)");
    Ok(())
}

fn run_purge(ctx: &Context) -> RmanResult<()> {
    let policy = retention::RetentionPolicy {
        keep_generations: ctx.config.keep_generations_resolved(),
        keep_days: ctx.config.keep_days_resolved(),
    };
    let deleted = retention::purge(&ctx.root, &policy, Utc::now())?;
    let purged = retention::purge_deleted(&ctx.root)?;
    println!("marked {deleted} backup(s) for deletion, purged {purged} director{plural}", plural = if purged == 1 { "y" } else { "ies" });
    Ok(())
}
