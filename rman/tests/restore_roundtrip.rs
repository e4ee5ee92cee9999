//! End-to-end restore: assembles a FULL backup directly on disk (the
//! same artifacts `backup::run` would have produced — a manifest, a
//! mkdirs script, a catalog record) and drives `restore::restore`
//! against a fresh target directory, checking the files and recovery
//! configuration that come out the other end.

use camino::Utf8Path;
use chrono::Utc;

use rman::catalog;
use rman::copier::{self, CopyMode};
use rman::manifest::{self, EntryType, WalkOptions};
use rman::model::{BackupMode, BackupRecord, BackupStatus};
use rman::restore::{self, RecoveryTarget, RestoreRequest};
use utils::lsn::Lsn;

/// Lays out a plausible cluster directory under `pgdata`: a couple of
/// plain config files, a directory skeleton, and one "data file" content
/// (its exact byte layout doesn't matter here since it's backed up and
/// restored as a plain file, not through the page-aware path).
fn populate_source_cluster(pgdata: &Utf8Path) {
    std::fs::create_dir_all(pgdata.join("global")).unwrap();
    std::fs::create_dir_all(pgdata.join("base").join("1")).unwrap();
    std::fs::create_dir_all(pgdata.join("pg_wal")).unwrap();
    std::fs::write(pgdata.join("PG_VERSION"), b"16\n").unwrap();
    std::fs::write(pgdata.join("postgresql.conf"), b"# test cluster\nport = 5432\n").unwrap();
    std::fs::write(pgdata.join("global").join("pg_control"), b"pretend-control-file-bytes").unwrap();
    std::fs::write(pgdata.join("base").join("1").join("PG_VERSION"), b"16\n").unwrap();
}

/// Builds a FULL backup for `pgdata` directly in the catalog at `root`,
/// the way `backup::run` would after a successful copy phase, without
/// going through the database-control protocol this test has no server
/// for.
fn assemble_full_backup(root: &Utf8Path, pgdata: &Utf8Path) -> BackupRecord {
    let mut record = BackupRecord::new_running(BackupMode::Full, 1, Utc::now());
    record.start_lsn = Lsn(0x100);
    record.stop_lsn = Lsn(0x200);
    record.block_size = pg_types::page::BLCKSZ as u32;
    record.wal_block_size = 8192;
    // A freshly finished backup is `Done`; only `validate` promotes it to
    // `Ok`, which is what the restore planner requires. This fixture
    // stands in for that already-validated state.
    record.status = BackupStatus::Ok;
    record.end_time = Some(Utc::now());
    record.recovery_time = Some(Utc::now());

    catalog::create_backup_dirs(root, &record).unwrap();
    let database_dir = record.database_dir(root);

    let opts = WalkOptions {
        exclude: &[],
        exclude_names: &[],
        blacklist: &[],
        chase_symlinks: false,
    };
    let mut entries = manifest::walk(pgdata, &opts).unwrap();
    for entry in entries.iter_mut() {
        if entry.kind == EntryType::Directory {
            continue;
        }
        let relative = entry.path.strip_prefix(pgdata).unwrap();
        let dst = database_dir.join(relative);
        std::fs::create_dir_all(dst.parent().unwrap()).unwrap();
        let outcome = copier::copy_file(&entry.path, &dst, CopyMode::Plain).unwrap().unwrap();
        entry.write_size = outcome.write_size as i64;
        entry.crc = outcome.crc;
    }

    let manifest_text = manifest::write_manifest(&entries, &database_dir);
    std::fs::write(record.path(root).join(catalog::DATABASE_FILE_LIST), manifest_text).unwrap();

    let script = manifest::generate_mkdirs_script(&entries, pgdata);
    std::fs::write(record.path(root).join(catalog::MKDIRS_SH_FILE), script).unwrap();

    // A FULL backup always carries arclog, even if none was captured in this
    // fixture; restore_archive_logs reads this file for every archive
    // source the plan selects.
    let empty_arclog = manifest::write_manifest(&[], &record.path(root));
    std::fs::write(record.path(root).join(catalog::ARCLOG_FILE_LIST), empty_arclog).unwrap();

    catalog::write(&record.path(root), &record).unwrap();
    record
}

#[test]
fn full_restore_round_trip_lays_down_files_and_recovery_config() {
    let root_dir = camino_tempfile::tempdir().unwrap();
    let src_dir = camino_tempfile::tempdir().unwrap();
    let dst_dir = camino_tempfile::tempdir().unwrap();
    let root = root_dir.path();
    let src = src_dir.path();
    let dst = dst_dir.path();

    catalog::ensure_lock_file(root).unwrap();
    populate_source_cluster(src);
    assemble_full_backup(root, src);

    // The restore target starts out as an independent, pre-existing
    // data directory (as if a fresh `initdb` had already run there).
    std::fs::create_dir_all(dst).unwrap();
    std::fs::write(dst.join("postgresql.conf"), b"# fresh initdb\nport = 5433\n").unwrap();
    std::fs::create_dir_all(dst.join("pg_wal")).unwrap();

    let req = RestoreRequest {
        pgdata: dst,
        arclog_path: dst,
        srvlog_path: dst,
        target: RecoveryTarget::default(),
        target_timeline: None,
        hard_copy: true,
    };
    let plan = restore::restore(root, &req).unwrap();
    assert_eq!(plan.incrementals.len(), 0);

    assert_eq!(std::fs::read(dst.join("PG_VERSION")).unwrap(), b"16\n");
    assert_eq!(
        std::fs::read(dst.join("base").join("1").join("PG_VERSION")).unwrap(),
        b"16\n"
    );
    assert_eq!(
        std::fs::read(dst.join("global").join("pg_control")).unwrap(),
        b"pretend-control-file-bytes"
    );

    assert!(dst.join("recovery.signal").exists());
    assert!(!dst.join("standby.signal").exists());
    let recovery_conf = std::fs::read_to_string(dst.join("rman_recovery.conf")).unwrap();
    assert!(recovery_conf.contains("restore_command"));
    let postgresql_conf = std::fs::read_to_string(dst.join("postgresql.conf")).unwrap();
    assert!(postgresql_conf.contains("rman_recovery.conf"));
}

#[test]
fn restore_fails_cleanly_without_any_full_backup() {
    let root_dir = camino_tempfile::tempdir().unwrap();
    let dst_dir = camino_tempfile::tempdir().unwrap();
    let root = root_dir.path();
    let dst = dst_dir.path();
    catalog::ensure_lock_file(root).unwrap();
    std::fs::create_dir_all(dst).unwrap();

    let req = RestoreRequest {
        pgdata: dst,
        arclog_path: dst,
        srvlog_path: dst,
        target: RecoveryTarget::default(),
        target_timeline: None,
        hard_copy: true,
    };
    let err = restore::restore(root, &req).unwrap_err();
    assert_eq!(err.kind, utils::error::ErrorKind::NoBackup);
}
