use std::io;
use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, StageError>;

#[derive(Error, Debug)]
pub enum StageError {
    /// Bad option value; reported before the run starts.
    #[error("Configuration error: {0}")]
    Config(String),

    #[error(
        "Insufficient capacity at destination: required {required} bytes, available {available} bytes"
    )]
    InsufficientCapacity { required: u64, available: u64 },

    /// Per-entry problem. Logged and counted by the orchestrator, never fatal.
    #[error("Skipped {path}: {reason}")]
    Skippable { path: String, reason: String },

    /// The image authoring boundary refused a request. Aborts the run.
    #[error("Image authoring failed: {0}")]
    Authoring(String),

    #[error("No free short identifier after {attempts} attempts (length {length})")]
    IdentifierSpaceExhausted { attempts: usize, length: usize },

    #[error("Resume state error at {path}: {message}")]
    State { path: PathBuf, message: String },

    #[error("Compression failed for {name}: {message}")]
    Compression { name: String, message: String },

    #[error("Run cancelled")]
    Cancelled,

    /// A pipeline task panicked or was aborted.
    #[error("Task failed: {0}")]
    Task(String),

    #[error("Notification failed: {0}")]
    Notification(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl StageError {
    /// Whether this error must terminate the whole run.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            StageError::Skippable { .. } | StageError::Notification(_)
        )
    }

    pub fn skippable(path: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        StageError::Skippable {
            path: path.into(),
            reason: reason.to_string(),
        }
    }
}
