//! kbfetch server library
//!
//! Persistent, restartable acquisition of update packages:
//!
//! - [`db`]: session and package rows ([`db::Store`], PostgreSQL via sqlx)
//! - [`storage`]: per-session S3-compatible archive targets
//! - [`pipeline`]: the per-session stage machine, the polling daemon and
//!   staging cleanup
//! - [`commands`]: registration and export used by the CLI
//!
//! Catalog discovery, downloads and the shared concurrency gate come from
//! `kbfetch-ingest`.

#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod commands;
pub mod config;
pub mod db;
pub mod pipeline;
pub mod storage;
