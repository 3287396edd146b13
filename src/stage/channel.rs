//! Channel types for the staging pipeline.
//!
//! Two-stage pipeline: Generator -> Submitter
//! Using a bounded channel for backpressure.

use crate::naming::{NameMappingEntry, ShortId};
use crate::walk::SkipReason;
use serde::Serialize;
use std::path::PathBuf;
use tokio::sync::mpsc;

/// Channel size for Generator -> Submitter
pub const GENERATOR_CHANNEL_SIZE: usize = 1024;

// =============================================================================
// FileJob: Generator -> Submitter
// =============================================================================

/// A file ready to be read, transformed and submitted.
#[derive(Debug, Clone)]
pub struct FileJob {
    /// Mapping row (canonical path, short id, kind)
    pub entry: NameMappingEntry,

    /// Where to read the payload from
    pub source_path: PathBuf,

    /// Size at walk time
    pub size: u64,

    /// Original file name, used as the entry name inside archives
    pub name: String,
}

// =============================================================================
// Pipeline messages
// =============================================================================

#[derive(Debug)]
pub enum StageMessage {
    /// Directory to create before anything beneath it
    Mkdir(NameMappingEntry),

    /// File to submit
    File(FileJob),

    /// File already submitted by an earlier run
    AlreadyDone(FileJob),

    /// Dry run: entry that would be staged
    Planned(NameMappingEntry),

    /// Admitted by the rules but not staged
    Skipped(SkippedEntry),

    /// Could not be walked or mapped
    Failed(FailedEntry),

    /// End of walk - no more entries coming
    WalkEnd { files: u64, dirs: u64 },
}

pub type StageSender = mpsc::Sender<StageMessage>;
pub type StageReceiver = mpsc::Receiver<StageMessage>;

/// Create a bounded channel for Generator -> Submitter communication
pub fn stage_channel() -> (StageSender, StageReceiver) {
    mpsc::channel(GENERATOR_CHANNEL_SIZE)
}

// =============================================================================
// Results
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StagedFile {
    pub path: String,
    pub short_id: ShortId,
    /// Bytes read from the source
    pub source_bytes: u64,
    /// Bytes handed to the authoring boundary (after compression)
    pub staged_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedEntry {
    pub path: String,
    pub reason: SkipReason,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedEntry {
    pub path: String,
    pub error: String,
}

/// Counters for a staging run
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct StageStats {
    /// Files handed to the authoring boundary
    pub files_staged: u64,

    /// Directories created
    pub dirs_created: u64,

    /// Files skipped because an earlier run staged them
    pub files_already_done: u64,

    /// Files skipped by size or duplicate rules
    pub files_skipped: u64,

    /// Files that could not be read or mapped
    pub files_failed: u64,

    /// Files dropped after cancellation
    pub files_cancelled: u64,

    /// Bytes read from source files
    pub bytes_read: u64,

    /// Bytes submitted (after compression)
    pub bytes_staged: u64,
}

impl StageStats {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Everything a staging run produced
#[derive(Debug, Default, Clone)]
pub struct StagingResult {
    pub stats: StageStats,
    pub staged: Vec<StagedFile>,
    pub skipped: Vec<SkippedEntry>,
    pub failed: Vec<FailedEntry>,
    pub already_done: Vec<String>,
    /// Dry run only: paths that would be staged, in walk order
    pub would_stage: Vec<String>,
    /// Final mapping table, sorted by path
    pub mapping: Vec<NameMappingEntry>,
}

impl StagingResult {
    pub fn staged_file(&self, path: &str) -> Option<&StagedFile> {
        self.staged.iter().find(|f| f.path == path)
    }

    pub fn mapping_for(&self, path: &str) -> Option<&NameMappingEntry> {
        self.mapping.iter().find(|m| m.path == path)
    }
}
