//! Staging session.
//!
//! Owns the shared mutable state of a run (name table, identifier generator,
//! resume store) and orchestrates Generator and Submitter tasks.

use crate::authoring::ImageAuthor;
use crate::capacity::{self, CapacityBudget, CapacityProbe};
use crate::error::{Result, StageError};
use crate::naming::{EntryKind, IdGenerator, NameMappingEntry, NameTable, ShortId, DEFAULT_ID_LENGTH};
use crate::progress::ProgressSink;
use crate::stage::channel::{stage_channel, StageStats, StagingResult};
use crate::stage::generator::{Generator, Planner, Step};
use crate::stage::submitter::Submitter;
use crate::state::ResumeStore;
use crate::transform::CompressionMethod;
use crate::walk::{WalkRules, DEFAULT_FILE_CEILING};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio_util::sync::CancellationToken;

/// Options for one staging run
#[derive(Debug, Clone)]
pub struct StageOptions {
    /// Directory inside the image under which all roots are placed
    pub mount_prefix: String,
    pub rules: WalkRules,
    pub per_file_ceiling: u64,
    /// Cap on the sum of staged file sizes
    pub max_total_bytes: Option<u64>,
    pub compression: CompressionMethod,
    /// None: sequential. Some(n): up to n files in flight.
    pub concurrency: Option<usize>,
    pub dry_run: bool,
    pub id_length: usize,
    /// Sync the resume journal every n completed files
    pub checkpoint_every: usize,
    pub follow_links: bool,
}

impl Default for StageOptions {
    fn default() -> Self {
        Self {
            mount_prefix: String::new(),
            rules: WalkRules::default(),
            per_file_ceiling: DEFAULT_FILE_CEILING,
            max_total_bytes: None,
            compression: CompressionMethod::None,
            concurrency: None,
            dry_run: false,
            id_length: DEFAULT_ID_LENGTH,
            checkpoint_every: 1,
            follow_links: false,
        }
    }
}

impl StageOptions {
    /// Worker count for file submission (at least 1)
    pub fn workers(&self) -> usize {
        self.concurrency.unwrap_or(1).max(1)
    }
}

/// Result of the pre-flight pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Preflight {
    pub budget: CapacityBudget,
    /// Files that will be staged (drives progress)
    pub file_count: u64,
}

struct Naming {
    table: NameTable,
    ids: IdGenerator,
}

/// Shared state for one staging run.
///
/// The name table and the identifier generator sit behind one lock so that
/// drawing and collision checking happen as a single step. Resume store
/// writes run on the blocking pool.
pub struct StagingSession {
    options: StageOptions,
    rules: Arc<WalkRules>,
    naming: Mutex<Naming>,
    store: Arc<Mutex<Option<ResumeStore>>>,
    // Counters as of the last submitter exit, kept for failed runs
    stats: Mutex<StageStats>,
    cancel: CancellationToken,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl StagingSession {
    pub fn new(options: StageOptions) -> Result<Self> {
        let ids = IdGenerator::new(options.id_length)?;
        Ok(Self::with_ids(options, ids))
    }

    /// Session drawing identifiers from `ids` (seeded generators in tests)
    pub fn with_ids(options: StageOptions, ids: IdGenerator) -> Self {
        Self {
            rules: Arc::new(options.rules.clone()),
            options,
            naming: Mutex::new(Naming {
                table: NameTable::new(),
                ids,
            }),
            store: Arc::new(Mutex::new(None)),
            stats: Mutex::new(StageStats::new()),
            cancel: CancellationToken::new(),
        }
    }

    /// Attach a resume store; its recorded identifiers are reserved for reuse.
    pub fn with_resume(self, store: ResumeStore) -> Result<Self> {
        self.resume_from(store)?;
        Ok(self)
    }

    /// Attach a resume store to a shared session (before [`stage`](Self::stage)).
    pub fn resume_from(&self, store: ResumeStore) -> Result<()> {
        let store = store.checkpoint_every(self.options.checkpoint_every);
        {
            let mut naming = lock(&self.naming);
            for entry in store.state().mappings() {
                naming.table.reserve(entry)?;
            }
            tracing::info!(
                "Resuming from {} ({} recorded entries)",
                store.path().display(),
                naming.table.reserved_len()
            );
        }
        *lock(&self.store) = Some(store);
        Ok(())
    }

    pub fn options(&self) -> &StageOptions {
        &self.options
    }

    pub(crate) fn rules(&self) -> &Arc<WalkRules> {
        &self.rules
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn lookup(&self, path: &str) -> Option<ShortId> {
        lock(&self.naming).table.lookup(path).cloned()
    }

    pub fn reverse_lookup(&self, id: &ShortId) -> Option<String> {
        lock(&self.naming)
            .table
            .reverse_lookup(id)
            .map(str::to_string)
    }

    /// Current mapping, sorted by path
    pub fn mapping(&self) -> Vec<NameMappingEntry> {
        lock(&self.naming).table.sorted_entries()
    }

    pub fn export_mapping(&self, path: &Path) -> Result<()> {
        lock(&self.naming).table.export(path)?;
        tracing::info!("Mapping written to {}", path.display());
        Ok(())
    }

    /// Map `path` and remember the identifier for later runs.
    pub(crate) fn assign(&self, path: &str, kind: EntryKind) -> Result<NameMappingEntry> {
        let short_id = {
            let mut naming = lock(&self.naming);
            let Naming { table, ids } = &mut *naming;
            table.assign(path, kind, ids)?
        };
        let entry = NameMappingEntry {
            path: path.to_string(),
            short_id,
            kind,
        };
        if !self.options.dry_run {
            if let Some(store) = lock(&self.store).as_mut() {
                store.record_mapping(&entry);
            }
        }
        Ok(entry)
    }

    pub(crate) fn is_processed(&self, path: &str) -> bool {
        lock(&self.store)
            .as_ref()
            .map(|s| s.is_processed(path))
            .unwrap_or(false)
    }

    pub(crate) async fn mark_processed(&self, entry: &NameMappingEntry) -> Result<()> {
        let entry = entry.clone();
        self.with_store(move |store| store.mark_processed(&entry)).await
    }

    pub(crate) async fn flush_state(&self) -> Result<()> {
        self.with_store(|store| store.flush()).await
    }

    async fn with_store<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut ResumeStore) -> Result<()> + Send + 'static,
    {
        let attached = lock(&self.store).is_some();
        if !attached {
            return Ok(());
        }
        let store = Arc::clone(&self.store);
        tokio::task::spawn_blocking(move || match lock(&store).as_mut() {
            Some(store) => f(store),
            None => Ok(()),
        })
        .await
        .map_err(|e| StageError::Task(format!("resume state: {}", e)))?
    }

    /// Counters of the last run, including one that failed part way
    pub fn stats(&self) -> StageStats {
        lock(&self.stats).clone()
    }

    pub(crate) fn record_stats(&self, stats: &StageStats) {
        *lock(&self.stats) = stats.clone();
    }

    /// Walk once without mapping and check the destination has room.
    ///
    /// No identifiers are assigned and nothing is handed to an author, so a
    /// failure here leaves no trace. In a dry run an insufficient budget is
    /// only reported.
    pub fn preflight(
        &self,
        roots: &[PathBuf],
        destination: &Path,
        probe: &dyn CapacityProbe,
    ) -> Result<Preflight> {
        let mut required = 0u64;
        let mut file_count = 0u64;
        Planner::new(self, roots).plan(|step| {
            if let Step::File { source, .. } = step {
                required += source.size;
                file_count += 1;
            }
            Ok(())
        })?;

        let budget = match capacity::check(
            required,
            self.options.per_file_ceiling,
            destination,
            probe,
        ) {
            Ok(budget) => budget,
            Err(StageError::InsufficientCapacity {
                required,
                available,
            }) if self.options.dry_run => {
                tracing::warn!(
                    "Insufficient capacity: required {} bytes, available {} bytes",
                    required,
                    available
                );
                CapacityBudget {
                    required_bytes: required,
                    available_bytes: available,
                    per_file_ceiling: self.options.per_file_ceiling,
                }
            }
            Err(e) => return Err(e),
        };

        Ok(Preflight { budget, file_count })
    }

    /// Stage every root through `author`.
    pub async fn stage(
        self: &Arc<Self>,
        roots: Vec<PathBuf>,
        preflight: &Preflight,
        author: Arc<dyn ImageAuthor>,
        progress: Arc<dyn ProgressSink>,
    ) -> Result<StagingResult> {
        progress.total(preflight.file_count);
        tracing::info!(
            "Staging {} files from {} roots ({} workers)",
            preflight.file_count,
            roots.len(),
            self.options.workers()
        );

        let (tx, rx) = stage_channel();
        let gen_handle = Generator::new(Arc::clone(self), roots).spawn(tx);

        let submitter = Submitter::new(Arc::clone(self), author, Arc::clone(&progress));
        let submitted = submitter.run(rx).await;

        let generated = gen_handle
            .await
            .map_err(|e| StageError::Task(format!("generator: {}", e)))?;
        progress.finish();

        let mut result = submitted?;
        // A closed channel only means the submitter stopped first
        match generated {
            Ok(()) | Err(StageError::Cancelled) => {}
            Err(e) => {
                self.cancel();
                return Err(e);
            }
        }
        if self.cancel.is_cancelled() {
            return Err(StageError::Cancelled);
        }

        result.mapping = self.mapping();
        tracing::info!(
            "Staged {} files ({} bytes), {} already done, {} skipped, {} failed",
            result.stats.files_staged,
            result.stats.bytes_staged,
            result.stats.files_already_done,
            result.stats.files_skipped,
            result.stats.files_failed
        );
        Ok(result)
    }
}
