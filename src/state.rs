// Resume state for interrupted staging runs
//
// Records, per relative path, the short identifier it was given and whether
// its payload has been handed to the authoring boundary. Stored as JSON next
// to the destination image; completions are journaled and compacted into
// the JSON file, which is always rewritten atomically.

use crate::error::{Result, StageError};
use crate::naming::{EntryKind, NameMappingEntry, ShortId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// Persisted record for one path
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateEntry {
    pub short_id: ShortId,
    pub kind: EntryKind,
    pub processed: bool,
}

/// Everything a re-run needs to skip finished work and reuse names
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagingState {
    #[serde(default = "StagingState::format_version")]
    pub version: u32,
    #[serde(default)]
    pub entries: BTreeMap<String, StateEntry>,
}

impl StagingState {
    /// Format version
    pub const FORMAT_VERSION: u32 = 1;

    fn format_version() -> u32 {
        Self::FORMAT_VERSION
    }

    pub fn new() -> Self {
        Self {
            version: Self::FORMAT_VERSION,
            entries: BTreeMap::new(),
        }
    }

    pub fn is_processed(&self, path: &str) -> bool {
        self.entries.get(path).map(|e| e.processed).unwrap_or(false)
    }

    pub fn processed_paths(&self) -> impl Iterator<Item = &str> {
        self.entries
            .iter()
            .filter(|(_, e)| e.processed)
            .map(|(p, _)| p.as_str())
    }

    /// Mapping rows to seed the name table with
    pub fn mappings(&self) -> impl Iterator<Item = NameMappingEntry> + '_ {
        self.entries.iter().map(|(path, e)| NameMappingEntry {
            path: path.clone(),
            short_id: e.short_id.clone(),
            kind: e.kind,
        })
    }
}

impl Default for StagingState {
    fn default() -> Self {
        Self::new()
    }
}

/// One completion, as appended to the journal
#[derive(Debug, Serialize, Deserialize)]
struct JournalRecord {
    path: String,
    short_id: ShortId,
    kind: EntryKind,
}

/// Resume state bound to a file on disk.
///
/// Completions are appended to `<state file>.journal` as JSON lines, so each
/// one costs a single small write. [`flush`](ResumeStore::flush) compacts the
/// journal into the state file; [`load`](ResumeStore::load) replays whatever
/// journal is left over from an interrupted run.
pub struct ResumeStore {
    state_file: PathBuf,
    journal_file: PathBuf,
    state: StagingState,
    journal: Option<fs::File>,
    // Changes not yet compacted into the state file
    dirty: bool,
    // Journal appends not yet synced
    unsynced: usize,
    checkpoint_every: usize,
}

impl ResumeStore {
    /// Default state file for a destination image: `<dest>.state.json`
    pub fn default_path(destination: &Path) -> PathBuf {
        let name = destination
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "image".to_string());
        destination.with_file_name(format!("{}.state.json", name))
    }

    /// Journal kept next to `state_file`
    pub fn journal_path(state_file: &Path) -> PathBuf {
        let name = state_file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "state".to_string());
        state_file.with_file_name(format!("{}.journal", name))
    }

    /// Open the store, loading prior state if the file exists.
    pub fn open(state_file: impl Into<PathBuf>) -> Result<Self> {
        let state_file = state_file.into();
        let state = Self::load(&state_file)?;
        tracing::debug!(
            "Loaded resume state from {} ({} entries)",
            state_file.display(),
            state.entries.len()
        );
        Ok(Self {
            journal_file: Self::journal_path(&state_file),
            state_file,
            state,
            journal: None,
            dirty: false,
            unsynced: 0,
            checkpoint_every: 1,
        })
    }

    /// Sync the journal every `n` completions (minimum 1).
    pub fn checkpoint_every(mut self, n: usize) -> Self {
        self.checkpoint_every = n.max(1);
        self
    }

    /// Load state from file plus any journal; missing files are an empty state.
    pub fn load(path: &Path) -> Result<StagingState> {
        let mut state = if path.exists() {
            let text = fs::read_to_string(path)?;
            serde_json::from_str::<StagingState>(&text).map_err(|e| StageError::State {
                path: path.to_path_buf(),
                message: e.to_string(),
            })?
        } else {
            StagingState::new()
        };
        if state.version != StagingState::FORMAT_VERSION {
            return Err(StageError::State {
                path: path.to_path_buf(),
                message: format!(
                    "unsupported state version {} (expected {})",
                    state.version,
                    StagingState::FORMAT_VERSION
                ),
            });
        }

        let journal = Self::journal_path(path);
        if journal.exists() {
            let text = fs::read_to_string(&journal)?;
            let mut replayed = 0usize;
            for line in text.lines().filter(|l| !l.trim().is_empty()) {
                let record: JournalRecord = match serde_json::from_str(line) {
                    Ok(record) => record,
                    Err(e) => {
                        // A torn last line from a crash; everything before it is intact
                        tracing::warn!("Ignoring unreadable journal record in {}: {}", journal.display(), e);
                        break;
                    }
                };
                state.entries.insert(
                    record.path,
                    StateEntry {
                        short_id: record.short_id,
                        kind: record.kind,
                        processed: true,
                    },
                );
                replayed += 1;
            }
            tracing::debug!("Replayed {} journal records from {}", replayed, journal.display());
        }
        Ok(state)
    }

    /// Write the full state (atomic) and drop the journal. Safe to call repeatedly.
    pub fn save(&mut self) -> Result<()> {
        if let Some(parent) = self.state_file.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let temp_file = self.state_file.with_extension("tmp");

        {
            let mut file = fs::File::create(&temp_file)?;
            serde_json::to_writer_pretty(&mut file, &self.state)?;
            writeln!(file)?;
            file.sync_all()?;
        }

        // Atomic rename
        fs::rename(&temp_file, &self.state_file)?;

        // Replaying the journal over the new state is harmless, so it goes last
        self.journal = None;
        match fs::remove_file(&self.journal_file) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        self.dirty = false;
        self.unsynced = 0;
        Ok(())
    }

    pub fn state(&self) -> &StagingState {
        &self.state
    }

    pub fn path(&self) -> &Path {
        &self.state_file
    }

    pub fn is_processed(&self, path: &str) -> bool {
        self.state.is_processed(path)
    }

    /// Remember the identifier given to `entry` (not yet processed).
    ///
    /// A row recorded under a different identifier or kind is replaced and
    /// loses its processed flag.
    pub fn record_mapping(&mut self, entry: &NameMappingEntry) {
        let fresh = StateEntry {
            short_id: entry.short_id.clone(),
            kind: entry.kind,
            processed: false,
        };
        match self.state.entries.get(&entry.path) {
            Some(existing) if existing.short_id == entry.short_id && existing.kind == entry.kind => {}
            _ => {
                self.state.entries.insert(entry.path.clone(), fresh);
                self.dirty = true;
            }
        }
    }

    /// Mark `path` done and append it to the journal, syncing every
    /// `checkpoint_every` completions.
    pub fn mark_processed(&mut self, entry: &NameMappingEntry) -> Result<()> {
        self.state.entries.insert(
            entry.path.clone(),
            StateEntry {
                short_id: entry.short_id.clone(),
                kind: entry.kind,
                processed: true,
            },
        );
        self.dirty = true;

        let mut line = serde_json::to_vec(&JournalRecord {
            path: entry.path.clone(),
            short_id: entry.short_id.clone(),
            kind: entry.kind,
        })?;
        line.push(b'\n');

        let sync = self.unsynced + 1 >= self.checkpoint_every;
        let journal = self.journal()?;
        journal.write_all(&line)?;
        if sync {
            journal.sync_data()?;
        }
        self.unsynced = if sync { 0 } else { self.unsynced + 1 };
        Ok(())
    }

    fn journal(&mut self) -> Result<&mut fs::File> {
        if self.journal.is_none() {
            if let Some(parent) = self.journal_file.parent() {
                if !parent.as_os_str().is_empty() {
                    fs::create_dir_all(parent)?;
                }
            }
            let file = fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.journal_file)?;
            self.journal = Some(file);
        }
        self.journal
            .as_mut()
            .ok_or_else(|| StageError::State {
                path: self.journal_file.clone(),
                message: "journal not open".to_string(),
            })
    }

    /// Compact pending changes into the state file, if any.
    pub fn flush(&mut self) -> Result<()> {
        if self.dirty {
            self.save()?;
        }
        Ok(())
    }

    /// Forget all recorded state (for --fresh)
    pub fn clear_all(&mut self) -> Result<()> {
        self.state.entries.clear();
        self.save()
    }
}
