//! The `snapshot-script` protocol: an optional external executable,
//! dropped next to the catalog as `<root>/snapshot-script`, that lets a
//! storage-level snapshot stand in for a plain file copy of the cluster
//! and its tablespaces. Each mode prints one line of output per result
//! plus a final `SUCCESS` sentinel line; anything else is a failure.

use std::process::Command;

use camino::{Utf8Path, Utf8PathBuf};

use utils::cleanup::CleanupStack;
use utils::error::{system_error, RmanResult};

pub const SNAPSHOT_SCRIPT_FILE: &str = "snapshot-script";

const FREEZE: &str = "freeze";
const UNFREEZE: &str = "unfreeze";
const SPLIT: &str = "split";
const RESYNC: &str = "resync";
const MOUNT: &str = "mount";
const UMOUNT: &str = "umount";

pub fn script_path(root: &Utf8Path) -> Utf8PathBuf {
    root.join(SNAPSHOT_SCRIPT_FILE)
}

pub fn is_configured(root: &Utf8Path) -> bool {
    script_path(root).exists()
}

/// Runs `<script> <mode> [cleanup] [args...]`, returning its stdout lines
/// with the trailing `SUCCESS` sentinel stripped. A cleanup-mode failure
/// is reported to the caller rather than escalated, mirroring the
/// best-effort semantics of unwind-time snapshot teardown.
fn run(script: &Utf8Path, mode: &str, is_cleanup: bool, args: &[String]) -> RmanResult<Vec<String>> {
    let mut command = Command::new(script.as_std_path());
    command.arg(mode);
    if is_cleanup {
        command.arg("cleanup");
    }
    command.args(args);

    let output = command
        .output()
        .map_err(|e| system_error(format!("could not execute {script}: {e}")))?;

    let stdout = String::from_utf8_lossy(&output.stdout);
    let mut lines: Vec<String> = stdout.lines().map(|l| l.to_string()).collect();

    let succeeded = lines.last().map(|l| l == "SUCCESS").unwrap_or(false);
    if !succeeded {
        return Err(system_error(format!("snapshot-script failed: {mode}")));
    }
    lines.pop();
    Ok(lines)
}

/// Drives one full freeze/split/(caller copies)/mount/umount/resync
/// cycle, registering each step's inverse onto `cleanup` so an error
/// partway through still leaves the storage layer consistent.
pub struct SnapshotSession<'a> {
    script: Utf8PathBuf,
    cleanup: &'a mut CleanupStack,
}

impl<'a> SnapshotSession<'a> {
    pub fn new(root: &Utf8Path, cleanup: &'a mut CleanupStack) -> SnapshotSession<'a> {
        SnapshotSession {
            script: script_path(root),
            cleanup,
        }
    }

    /// Freezes filesystem I/O, then splits off the snapshot volume,
    /// returning the tablespace names (and `"PG-DATA"` if the cluster
    /// itself is included) the script reports as captured.
    pub fn freeze_and_split(&mut self) -> RmanResult<Vec<String>> {
        run(&self.script, FREEZE, false, &[])?;
        let script = self.script.clone();
        self.cleanup.push(move || {
            let _ = run(&script, UNFREEZE, true, &[]);
        });

        let names = run(&self.script, SPLIT, false, &[])?;
        let script = self.script.clone();
        self.cleanup.push(move || {
            let _ = run(&script, RESYNC, true, &[]);
        });

        self.unfreeze()?;
        Ok(names)
    }

    fn unfreeze(&mut self) -> RmanResult<()> {
        run(&self.script, UNFREEZE, false, &[])?;
        Ok(())
    }

    /// Mounts the split-off volume, returning the mount points to read
    /// files back from (one per tablespace oid passed in).
    pub fn mount(&mut self, tablespace_oids: &[String]) -> RmanResult<Vec<String>> {
        let mount_points = run(&self.script, MOUNT, false, tablespace_oids)?;
        let script = self.script.clone();
        self.cleanup.push(move || {
            let _ = run(&script, UMOUNT, true, &[]);
        });
        Ok(mount_points)
    }

    /// Unmounts and resyncs the snapshot volume back into the source,
    /// the normal (non-error) end of a snapshot-backed backup.
    pub fn umount_and_resync(&mut self) -> RmanResult<()> {
        run(&self.script, UMOUNT, false, &[])?;
        run(&self.script, RESYNC, false, &[])?;
        Ok(())
    }
}
