//! Online, incremental physical backup and point-in-time recovery for a
//! PostgreSQL-like cluster.
//!
//! `catalog` owns the on-disk backup ledger; `backup` and `restore` are
//! the two directions data flows; `retention` decides what may be
//! reclaimed; `config`/`cli` are the layered configuration and the
//! command surface built on top of all of the above.

pub mod backup;
pub mod catalog;
pub mod cli;
pub mod config;
pub mod copier;
pub mod daterange;
pub mod ini;
pub mod init;
pub mod manifest;
pub mod model;
pub mod pgctrl;
pub mod restore;
pub mod retention;
pub mod show;
pub mod snapshot;
pub mod validate;
