//! Pipeline status flags
//!
//! Sessions and packages persist their progress as an integer bitmask. In
//! memory the same information is held as a [`Stage`] plus two orthogonal
//! facts (error, cleaned up), so combinations such as "download skipped and
//! upload complete" cannot be constructed.
//!
//! Persisted encoding:
//!
//! - completed-stage bits accumulate (`MetadataComplete`, `DownloadComplete`
//!   or `DownloadSkipped`, `UploadComplete`)
//! - at most one in-progress bit is set, and it is cleared when the stage
//!   completes; `Registered` counts as the in-progress bit of the queue
//! - `Error` and `CleanupComplete` are independent of the stage
//!
//! With this encoding the integer value never decreases as a unit of work
//! moves forward.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::KbError;

/// Position of a session or package in the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Registered,
    MetadataInProgress,
    MetadataComplete,
    DownloadInProgress,
    DownloadComplete,
    /// Terminal alternative to `DownloadComplete`: the target file was already staged
    DownloadSkipped,
    UploadInProgress,
    UploadComplete,
}

impl Stage {
    /// Ordering used for monotonic advancement. `DownloadComplete` and
    /// `DownloadSkipped` share a rank so one can never replace the other.
    fn rank(self) -> u8 {
        match self {
            Stage::Registered => 0,
            Stage::MetadataInProgress => 1,
            Stage::MetadataComplete => 2,
            Stage::DownloadInProgress => 3,
            Stage::DownloadComplete | Stage::DownloadSkipped => 4,
            Stage::UploadInProgress => 5,
            Stage::UploadComplete => 6,
        }
    }

    /// The bit this stage owns in the persisted mask
    pub fn bit(self) -> u32 {
        match self {
            Stage::Registered => StatusFlags::REGISTERED,
            Stage::MetadataInProgress => StatusFlags::METADATA_IN_PROGRESS,
            Stage::MetadataComplete => StatusFlags::METADATA_COMPLETE,
            Stage::DownloadInProgress => StatusFlags::DOWNLOAD_IN_PROGRESS,
            Stage::DownloadComplete => StatusFlags::DOWNLOAD_COMPLETE,
            Stage::DownloadSkipped => StatusFlags::DOWNLOAD_SKIPPED,
            Stage::UploadInProgress => StatusFlags::UPLOAD_IN_PROGRESS,
            Stage::UploadComplete => StatusFlags::UPLOAD_COMPLETE,
        }
    }

    pub fn is_in_progress(self) -> bool {
        matches!(
            self,
            Stage::Registered
                | Stage::MetadataInProgress
                | Stage::DownloadInProgress
                | Stage::UploadInProgress
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Registered => "registered",
            Stage::MetadataInProgress => "metadata_in_progress",
            Stage::MetadataComplete => "metadata_complete",
            Stage::DownloadInProgress => "download_in_progress",
            Stage::DownloadComplete => "download_complete",
            Stage::DownloadSkipped => "download_skipped",
            Stage::UploadInProgress => "upload_in_progress",
            Stage::UploadComplete => "upload_complete",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Cumulative progress and error state of a session or package
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u32", try_from = "u32")]
pub struct StatusFlags {
    stage: Stage,
    error: bool,
    cleaned_up: bool,
}

impl StatusFlags {
    pub const REGISTERED: u32 = 0x1;
    pub const METADATA_IN_PROGRESS: u32 = 0x2;
    pub const METADATA_COMPLETE: u32 = 0x4;
    pub const DOWNLOAD_IN_PROGRESS: u32 = 0x8;
    pub const DOWNLOAD_COMPLETE: u32 = 0x10;
    pub const UPLOAD_IN_PROGRESS: u32 = 0x20;
    pub const UPLOAD_COMPLETE: u32 = 0x40;
    pub const DOWNLOAD_SKIPPED: u32 = 0x80;
    pub const ERROR: u32 = 0x100;
    pub const CLEANUP_COMPLETE: u32 = 0x200;

    const ALL: u32 = 0x3ff;

    /// Stage bits checked from the furthest stage back
    const PRECEDENCE: [Stage; 8] = [
        Stage::UploadComplete,
        Stage::UploadInProgress,
        Stage::DownloadSkipped,
        Stage::DownloadComplete,
        Stage::DownloadInProgress,
        Stage::MetadataComplete,
        Stage::MetadataInProgress,
        Stage::Registered,
    ];

    pub fn new(stage: Stage) -> Self {
        Self {
            stage,
            error: false,
            cleaned_up: false,
        }
    }

    pub fn registered() -> Self {
        Self::new(Stage::Registered)
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn has_error(&self) -> bool {
        self.error
    }

    pub fn is_cleaned_up(&self) -> bool {
        self.cleaned_up
    }

    /// Move forward to `next`.
    ///
    /// Returns `false` without changing anything when the move would go
    /// backwards or sideways, when `next` is the current stage, when the
    /// download was skipped, or when the error flag is set.
    pub fn advance(&mut self, next: Stage) -> bool {
        if self.error || self.stage == Stage::DownloadSkipped {
            return false;
        }
        if next.rank() <= self.stage.rank() {
            return false;
        }
        self.stage = next;
        true
    }

    /// Set the error flag. Returns `false` if it was already set.
    pub fn mark_error(&mut self) -> bool {
        !std::mem::replace(&mut self.error, true)
    }

    /// Set the cleanup tombstone. Returns `false` if it was already set.
    pub fn mark_cleaned_up(&mut self) -> bool {
        !std::mem::replace(&mut self.cleaned_up, true)
    }

    /// Whether the download stage is over for this unit of work
    pub fn download_settled(&self) -> bool {
        self.error || self.stage.rank() >= Stage::DownloadComplete.rank()
    }

    /// Persisted integer form
    pub fn bits(&self) -> u32 {
        let rank = self.stage.rank();
        let mut bits = 0;

        if rank >= Stage::MetadataComplete.rank() {
            bits |= Self::METADATA_COMPLETE;
        }
        if self.stage == Stage::DownloadSkipped {
            bits |= Self::DOWNLOAD_SKIPPED;
        } else if rank >= Stage::DownloadComplete.rank() {
            bits |= Self::DOWNLOAD_COMPLETE;
        }
        if self.stage == Stage::UploadComplete {
            bits |= Self::UPLOAD_COMPLETE;
        }
        if self.stage.is_in_progress() {
            bits |= self.stage.bit();
        }
        if self.error {
            bits |= Self::ERROR;
        }
        if self.cleaned_up {
            bits |= Self::CLEANUP_COMPLETE;
        }
        bits
    }

    /// Decode a persisted mask. The furthest stage bit present wins.
    pub fn from_bits(bits: u32) -> Result<Self, KbError> {
        if bits & !Self::ALL != 0 {
            return Err(KbError::InvalidStatus(bits));
        }

        let stage = Self::PRECEDENCE
            .iter()
            .copied()
            .find(|stage| bits & stage.bit() != 0)
            .ok_or(KbError::InvalidStatus(bits))?;

        Ok(Self {
            stage,
            error: bits & Self::ERROR != 0,
            cleaned_up: bits & Self::CLEANUP_COMPLETE != 0,
        })
    }

    /// `bits & mask == value`, the predicate used by status queries
    pub fn matches(&self, mask: u32, value: u32) -> bool {
        self.bits() & mask == value
    }
}

impl Default for StatusFlags {
    fn default() -> Self {
        Self::registered()
    }
}

impl From<StatusFlags> for u32 {
    fn from(status: StatusFlags) -> Self {
        status.bits()
    }
}

impl TryFrom<u32> for StatusFlags {
    type Error = KbError;

    fn try_from(bits: u32) -> Result<Self, Self::Error> {
        Self::from_bits(bits)
    }
}

impl fmt::Display for StatusFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.stage)?;
        if self.error {
            f.write_str("+error")?;
        }
        if self.cleaned_up {
            f.write_str("+cleaned_up")?;
        }
        write!(f, " ({:#05x})", self.bits())
    }
}
