//! A second process taking the catalog lock while a backup is in flight
//! must fail fast rather than block, so that `rman backup` invocations
//! never queue up silently against one another.

use rman::catalog;
use utils::error::ErrorKind;

#[test]
fn second_lock_attempt_fails_with_already_running() {
    let root_dir = camino_tempfile::tempdir().unwrap();
    let root = root_dir.path();
    catalog::ensure_lock_file(root).unwrap();

    let _held = catalog::lock(root).unwrap();
    let err = catalog::lock(root).unwrap_err();
    assert_eq!(err.kind, ErrorKind::AlreadyRunning);
}

#[test]
fn lock_is_released_on_drop_and_can_be_retaken() {
    let root_dir = camino_tempfile::tempdir().unwrap();
    let root = root_dir.path();
    catalog::ensure_lock_file(root).unwrap();

    {
        let _held = catalog::lock(root).unwrap();
    }
    // The guard's drop closed the file descriptor, which releases the
    // flock; a fresh attempt should succeed rather than inheriting the
    // stale lock.
    let _held_again = catalog::lock(root).unwrap();
}

#[test]
fn lock_without_init_reports_corrupted_catalog() {
    let root_dir = camino_tempfile::tempdir().unwrap();
    let root = root_dir.path();

    let err = catalog::lock(root).unwrap_err();
    assert_eq!(err.kind, ErrorKind::Corrupted);
}
