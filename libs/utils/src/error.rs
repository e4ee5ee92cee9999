//! The error taxonomy used throughout the backup/restore engine.
//!
//! `ereport(ERROR, ...)` in the original tool this system plays the role of
//! maps onto a plain `Result<T, RmanError>`: every fallible operation
//! returns a `kind` plus a human message, with optional detail/hint lines,
//! so the CLI can print the `LEVEL: message / DETAIL: / HINT:` triad and
//! pick an exit code from `kind` alone.

use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    Args,
    System,
    Corrupted,
    AlreadyRunning,
    ArchiveFailed,
    NoBackup,
    PgCommand,
    PgConnect,
    PgIncompatible,
    PgRunning,
    Interrupted,
}

impl ErrorKind {
    /// Process exit code for this error kind, per the CLI contract.
    pub fn exit_code(self) -> i32 {
        match self {
            ErrorKind::Args => 1,
            ErrorKind::System => 2,
            ErrorKind::Corrupted => 3,
            ErrorKind::AlreadyRunning => 4,
            ErrorKind::ArchiveFailed => 5,
            ErrorKind::NoBackup => 6,
            ErrorKind::PgIncompatible => 7,
            ErrorKind::PgRunning => 8,
            ErrorKind::Interrupted => 9,
            ErrorKind::PgCommand => 10,
            ErrorKind::PgConnect => 11,
        }
    }
}

#[derive(Debug)]
pub struct RmanError {
    pub kind: ErrorKind,
    pub message: String,
    pub detail: Option<String>,
    pub hint: Option<String>,
}

impl RmanError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        RmanError {
            kind,
            message: message.into(),
            detail: None,
            hint: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    /// Render the `LEVEL: message\nDETAIL: ...\nHINT: ...` form expected on stderr.
    pub fn report(&self) -> String {
        let mut out = format!("ERROR: {}\n", self.message);
        if let Some(detail) = &self.detail {
            out.push_str(&format!("DETAIL: {detail}\n"));
        }
        if let Some(hint) = &self.hint {
            out.push_str(&format!("HINT: {hint}\n"));
        }
        out
    }
}

impl fmt::Display for RmanError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for RmanError {}

macro_rules! ctor {
    ($name:ident, $kind:ident) => {
        pub fn $name(message: impl Into<String>) -> RmanError {
            RmanError::new(ErrorKind::$kind, message)
        }
    };
}

ctor!(args_error, Args);
ctor!(system_error, System);
ctor!(corrupted, Corrupted);
ctor!(already_running, AlreadyRunning);
ctor!(archive_failed, ArchiveFailed);
ctor!(no_backup, NoBackup);
ctor!(pg_command, PgCommand);
ctor!(pg_connect, PgConnect);
ctor!(pg_incompatible, PgIncompatible);
ctor!(pg_running, PgRunning);
ctor!(interrupted, Interrupted);

pub type RmanResult<T> = Result<T, RmanError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_format() {
        let e = corrupted("bad crc").with_detail("file x").with_hint("rerun validate");
        let s = e.report();
        assert!(s.starts_with("ERROR: bad crc\n"));
        assert!(s.contains("DETAIL: file x\n"));
        assert!(s.contains("HINT: rerun validate\n"));
    }

    #[test]
    fn exit_codes_distinct() {
        let kinds = [
            ErrorKind::Args,
            ErrorKind::System,
            ErrorKind::Corrupted,
            ErrorKind::AlreadyRunning,
            ErrorKind::ArchiveFailed,
            ErrorKind::NoBackup,
            ErrorKind::PgCommand,
            ErrorKind::PgConnect,
            ErrorKind::PgIncompatible,
            ErrorKind::PgRunning,
            ErrorKind::Interrupted,
        ];
        let mut codes: Vec<i32> = kinds.iter().map(|k| k.exit_code()).collect();
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), kinds.len());
    }
}
