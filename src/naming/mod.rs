//! Short identifiers for the constrained (8.3) namespace of the image.
//!
//! Every staged file and directory gets a random token drawn from `A-Z0-9`.
//! Tokens carry no meaning and are not stable between runs; the resume state
//! persists them when a re-run has to reuse the same names.

pub mod table;

pub use table::{EntryKind, NameMappingEntry, NameTable};

use crate::error::{Result, StageError};
use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Alphabet legal in ISO 9660 level 1 file identifiers
pub const ID_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// Default token length (the 8 of 8.3)
pub const DEFAULT_ID_LENGTH: usize = 8;

/// Upper bound on redraws before giving up on a single assignment
pub const MAX_REDRAWS: usize = 1024;

/// An uppercase alphanumeric token naming one entry on the image.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ShortId(String);

impl ShortId {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Flat path of this entry in the constrained namespace, e.g. `/K3J9Q0ZB`.
    pub fn short_path(&self) -> String {
        format!("/{}", self.0)
    }
}

impl TryFrom<String> for ShortId {
    type Error = StageError;

    fn try_from(value: String) -> Result<Self> {
        let legal = !value.is_empty()
            && value.len() <= DEFAULT_ID_LENGTH
            && value.bytes().all(|b| ID_ALPHABET.contains(&b));
        if !legal {
            return Err(StageError::Config(format!(
                "'{}' is not a valid short identifier",
                value
            )));
        }
        Ok(ShortId(value))
    }
}

impl From<ShortId> for String {
    fn from(id: ShortId) -> Self {
        id.0
    }
}

impl fmt::Display for ShortId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Draws tokens uniformly from [`ID_ALPHABET`].
///
/// The generator itself does not know which tokens are live; uniqueness is
/// enforced by [`NameTable::assign`], which redraws on collision.
pub struct IdGenerator {
    length: usize,
    rng: Box<dyn RngCore + Send>,
}

impl IdGenerator {
    pub fn new(length: usize) -> Result<Self> {
        Self::with_rng(length, Box::new(StdRng::from_entropy()))
    }

    /// Deterministic generator for tests and benchmarks.
    pub fn seeded(length: usize, seed: u64) -> Result<Self> {
        Self::with_rng(length, Box::new(StdRng::seed_from_u64(seed)))
    }

    pub fn with_rng(length: usize, rng: Box<dyn RngCore + Send>) -> Result<Self> {
        if length == 0 || length > DEFAULT_ID_LENGTH {
            return Err(StageError::Config(format!(
                "identifier length must be between 1 and {}, got {}",
                DEFAULT_ID_LENGTH, length
            )));
        }
        Ok(Self { length, rng })
    }

    pub fn length(&self) -> usize {
        self.length
    }

    pub fn next_id(&mut self) -> ShortId {
        let token: String = (0..self.length)
            .map(|_| ID_ALPHABET[self.rng.gen_range(0..ID_ALPHABET.len())] as char)
            .collect();
        ShortId(token)
    }

    /// Number of distinct tokens this generator can produce.
    pub fn space(&self) -> u128 {
        (ID_ALPHABET.len() as u128).pow(self.length as u32)
    }
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self {
            length: DEFAULT_ID_LENGTH,
            rng: Box::new(StdRng::from_entropy()),
        }
    }
}
