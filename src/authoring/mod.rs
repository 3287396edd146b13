//! Image authoring boundary.
//!
//! The staging core never encodes an image itself. It hands each directory
//! and file to an [`ImageAuthor`] under two names: the flat short path
//! (`/K3J9Q0ZB`, constrained namespace) and the original relative path
//! (unconstrained namespace). `commit` produces the image.

pub mod mkisofs;

pub use mkisofs::MkisofsAuthor;

use crate::error::{Result, StageError};
use crate::naming::EntryKind;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

#[async_trait]
pub trait ImageAuthor: Send + Sync {
    /// Create a directory. Called before anything beneath it is submitted.
    async fn create_directory(&self, short_path: &str, original_path: &str) -> Result<()>;

    /// Add a file whose payload is `data` (`data.len()` bytes).
    async fn add_file(&self, short_path: &str, original_path: &str, data: Bytes) -> Result<()>;

    /// Re-register an entry submitted by an earlier, interrupted run.
    ///
    /// Returns `false` if the author no longer holds the payload, in which
    /// case the caller submits the file again.
    async fn restore(&self, short_path: &str, original_path: &str, kind: EntryKind)
        -> Result<bool>;

    /// Encode the image at `destination`. Failure aborts the run.
    async fn commit(&self, destination: &Path) -> Result<()>;
}

/// One call observed by [`MemoryAuthor`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthorEvent {
    CreateDirectory {
        short_path: String,
        original_path: String,
    },
    AddFile {
        short_path: String,
        original_path: String,
        data: Bytes,
    },
    Restore {
        short_path: String,
        original_path: String,
        kind: EntryKind,
    },
    Commit {
        destination: PathBuf,
    },
}

/// Records every call in memory. Used by tests and embedding callers that
/// want to inspect what would be authored.
#[derive(Debug, Default)]
pub struct MemoryAuthor {
    events: Mutex<Vec<AuthorEvent>>,
    fail_paths: HashSet<String>,
    fail_commit: bool,
}

impl MemoryAuthor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject `add_file`/`create_directory` for this original path.
    pub fn failing_on(mut self, original_path: impl Into<String>) -> Self {
        self.fail_paths.insert(original_path.into());
        self
    }

    pub fn failing_commit(mut self) -> Self {
        self.fail_commit = true;
        self
    }

    fn push(&self, event: AuthorEvent) {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event);
    }

    pub fn events(&self) -> Vec<AuthorEvent> {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// `(original_path, payload)` of every added file, in submission order
    pub fn files(&self) -> Vec<(String, Bytes)> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                AuthorEvent::AddFile {
                    original_path,
                    data,
                    ..
                } => Some((original_path, data)),
                _ => None,
            })
            .collect()
    }

    pub fn directories(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                AuthorEvent::CreateDirectory { original_path, .. } => Some(original_path),
                _ => None,
            })
            .collect()
    }

    pub fn committed(&self) -> bool {
        self.events()
            .iter()
            .any(|e| matches!(e, AuthorEvent::Commit { .. }))
    }
}

#[async_trait]
impl ImageAuthor for MemoryAuthor {
    async fn create_directory(&self, short_path: &str, original_path: &str) -> Result<()> {
        if self.fail_paths.contains(original_path) {
            return Err(StageError::Authoring(format!(
                "cannot create directory {}",
                original_path
            )));
        }
        self.push(AuthorEvent::CreateDirectory {
            short_path: short_path.to_string(),
            original_path: original_path.to_string(),
        });
        Ok(())
    }

    async fn add_file(&self, short_path: &str, original_path: &str, data: Bytes) -> Result<()> {
        if self.fail_paths.contains(original_path) {
            return Err(StageError::Authoring(format!(
                "cannot add file {}",
                original_path
            )));
        }
        self.push(AuthorEvent::AddFile {
            short_path: short_path.to_string(),
            original_path: original_path.to_string(),
            data,
        });
        Ok(())
    }

    async fn restore(
        &self,
        short_path: &str,
        original_path: &str,
        kind: EntryKind,
    ) -> Result<bool> {
        self.push(AuthorEvent::Restore {
            short_path: short_path.to_string(),
            original_path: original_path.to_string(),
            kind,
        });
        Ok(true)
    }

    async fn commit(&self, destination: &Path) -> Result<()> {
        if self.fail_commit {
            return Err(StageError::Authoring(format!(
                "commit to {} rejected",
                destination.display()
            )));
        }
        self.push(AuthorEvent::Commit {
            destination: destination.to_path_buf(),
        });
        Ok(())
    }
}
