//! isostage: stage file trees for optical-disc images under collision-free
//! short names, keeping the original paths recoverable.

pub mod authoring;
pub mod capacity;
pub mod cli;
pub mod config;
pub mod error;
pub mod integrity;
pub mod naming;
pub mod notify;
pub mod progress;
pub mod stage;
pub mod state;
pub mod transform;
pub mod walk;

pub use error::{Result, StageError};
