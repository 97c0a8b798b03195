//! Session pipeline: stage machine, polling daemon, staging cleanup

pub mod cleanup;
pub mod daemon;
pub mod orchestrator;
pub mod staging;

pub use cleanup::{sweep, CleanupReport};
pub use daemon::{CycleReport, DaemonLoop};
pub use orchestrator::{PipelineOrchestrator, PipelineSettings, SessionOutcome};
pub use staging::StagingLocks;
