//! kbfetch ingest library
//!
//! Network-facing building blocks shared by the one-shot CLI and the
//! server pipeline: catalog discovery, package download, the shared
//! concurrency gate, and metadata CSV export.

#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod catalog;
pub mod concurrency;
pub mod config;
pub mod download;
pub mod error;
pub mod export;
pub mod oneshot;

pub use catalog::{CatalogClient, UpdateCatalogClient};
pub use concurrency::{ConcurrencyController, OperationPermit};
pub use config::HttpConfig;
pub use download::{HttpFetcher, PackageFetcher};
pub use error::{IngestError, Result};
