//! Staging orchestrator.
//!
//! Two-task pipeline: Generator -> Submitter
//!
//! # Architecture
//!
//! ```text
//! +----------------+     +-----------------+     +--------------+
//! |   Generator    | --> |    Submitter    | --> | ImageAuthor  |
//! | (walk + names) |     | (read/compress) |     | (external)   |
//! +----------------+     +-----------------+     +--------------+
//! ```
//!
//! The Generator runs on a blocking thread and assigns identifiers in walk
//! order. The Submitter creates each directory before dispatching anything
//! after it, then fans files out to at most `StageOptions::workers()` tasks.
//! A fatal authoring error cancels the session: files in flight complete,
//! queued files are dropped.

pub mod channel;
pub mod finish;
pub mod generator;
pub mod pipeline;
pub mod submitter;

pub use channel::{
    stage_channel, FailedEntry, FileJob, SkippedEntry, StageMessage, StageReceiver, StageSender,
    StageStats, StagedFile, StagingResult, GENERATOR_CHANNEL_SIZE,
};
pub use finish::{finish, FinishOptions, FinishedImage};
pub use generator::{Generator, Planner, Step};
pub use pipeline::{Preflight, StageOptions, StagingSession};
pub use submitter::Submitter;
