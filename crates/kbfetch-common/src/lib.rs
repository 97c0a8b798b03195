//! kbfetch Common Library
//!
//! Shared types, utilities, and error handling for the kbfetch workspace.
//!
//! # Overview
//!
//! - **Status flags**: the persisted bitmask describing how far a session or
//!   package has progressed through the acquisition pipeline
//! - **Entities**: sessions, package tasks and the package metadata returned
//!   by catalog discovery
//! - **Checksums**: streaming content hashing of staged files
//! - **Logging**: one `tracing` subscriber setup shared by every binary
//!
//! # Example
//!
//! ```no_run
//! use kbfetch_common::types::{Stage, StatusFlags};
//!
//! let mut status = StatusFlags::registered();
//! assert!(status.advance(Stage::MetadataInProgress));
//! assert_eq!(status.bits(), StatusFlags::METADATA_IN_PROGRESS);
//! ```

#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod checksum;
pub mod error;
pub mod logging;
pub mod types;

// Re-export commonly used types
pub use error::{KbError, Result};
