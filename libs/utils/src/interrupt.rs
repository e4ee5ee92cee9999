//! Process-wide cancellation flag, set from a signal handler and polled
//! at a bounded cadence by every copy loop, sleep, and compression chunk.

use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::{interrupted, RmanError};

static INTERRUPTED: AtomicBool = AtomicBool::new(false);

/// Install SIGINT/SIGTERM handlers that flip the flag. Safe to call once
/// at process start; signal-hook's flag registration is itself
/// async-signal-safe.
pub fn install_handlers() -> anyhow::Result<()> {
    signal_hook::flag::register(signal_hook::consts::SIGINT, Box::new(AtomicBoolAdapter))?;
    signal_hook::flag::register(signal_hook::consts::SIGTERM, Box::new(AtomicBoolAdapter))?;
    Ok(())
}

// signal_hook::flag::register wants an `Arc<AtomicBool>`; we keep a single
// process-wide static instead; this thin adapter implements `Deref` so it
// can stand in without a heap-allocated Arc.
struct AtomicBoolAdapter;

impl std::ops::Deref for AtomicBoolAdapter {
    type Target = AtomicBool;
    fn deref(&self) -> &AtomicBool {
        &INTERRUPTED
    }
}

pub fn set() {
    INTERRUPTED.store(true, Ordering::SeqCst);
}

pub fn is_set() -> bool {
    INTERRUPTED.load(Ordering::SeqCst)
}

pub fn reset_for_test() {
    INTERRUPTED.store(false, Ordering::SeqCst);
}

/// Call at the top of every copy loop iteration, every sleep, every
/// compression chunk.
pub fn check() -> Result<(), RmanError> {
    if is_set() {
        return Err(interrupted("interrupted by signal"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // The interrupt flag is a process-wide static; serialize the tests that
    // touch it so they don't race each other under a parallel test runner.
    static GUARD: Mutex<()> = Mutex::new(());

    #[test]
    fn flag_round_trip() {
        let _g = GUARD.lock().unwrap();
        reset_for_test();
        assert!(check().is_ok());
        set();
        assert!(check().is_err());
        reset_for_test();
    }
}
