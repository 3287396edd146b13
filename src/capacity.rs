//! Pre-flight capacity check.
//!
//! Runs once, before anything is staged. A failure aborts the run with no
//! authoring calls made.

use crate::error::{Result, StageError};
use std::io;
use std::path::{Path, PathBuf};

/// Sizes computed before staging begins
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapacityBudget {
    pub required_bytes: u64,
    pub available_bytes: u64,
    pub per_file_ceiling: u64,
}

impl CapacityBudget {
    pub fn fits(&self) -> bool {
        self.required_bytes <= self.available_bytes
    }

    pub fn headroom(&self) -> i128 {
        self.available_bytes as i128 - self.required_bytes as i128
    }
}

/// Source of free-space figures for a destination
pub trait CapacityProbe: Send + Sync {
    fn available_bytes(&self, destination: &Path) -> io::Result<u64>;
}

/// Queries the filesystem holding the destination.
#[derive(Debug, Default, Clone, Copy)]
pub struct FsProbe;

impl CapacityProbe for FsProbe {
    fn available_bytes(&self, destination: &Path) -> io::Result<u64> {
        let dir = existing_ancestor(destination);
        fs2::available_space(&dir)
    }
}

/// Fixed figure, for tests and for callers that know their medium size.
#[derive(Debug, Clone, Copy)]
pub struct FixedCapacity(pub u64);

impl CapacityProbe for FixedCapacity {
    fn available_bytes(&self, _destination: &Path) -> io::Result<u64> {
        Ok(self.0)
    }
}

/// Nearest ancestor of `path` that exists (the destination file usually doesn't yet)
fn existing_ancestor(path: &Path) -> PathBuf {
    let mut current = if path.is_dir() {
        Some(path)
    } else {
        path.parent()
    };
    while let Some(dir) = current {
        if dir.as_os_str().is_empty() {
            break;
        }
        if dir.exists() {
            return dir.to_path_buf();
        }
        current = dir.parent();
    }
    PathBuf::from(".")
}

/// Compare `required_bytes` against the free space at `destination`.
pub fn check(
    required_bytes: u64,
    per_file_ceiling: u64,
    destination: &Path,
    probe: &dyn CapacityProbe,
) -> Result<CapacityBudget> {
    let available_bytes = probe.available_bytes(destination)?;
    let budget = CapacityBudget {
        required_bytes,
        available_bytes,
        per_file_ceiling,
    };

    tracing::info!(
        "Capacity: {} bytes required, {} bytes available at {}",
        required_bytes,
        available_bytes,
        destination.display()
    );

    if !budget.fits() {
        return Err(StageError::InsufficientCapacity {
            required: required_bytes,
            available: available_bytes,
        });
    }
    Ok(budget)
}
