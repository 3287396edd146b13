//! Submitter task for the staging pipeline.
//!
//! Receives messages from the Generator. Directories are created inline, in
//! arrival order, so a directory always exists before anything beneath it is
//! dispatched. Files go to a bounded set of workers that read, transform and
//! submit them.

use crate::authoring::ImageAuthor;
use crate::error::{Result, StageError};
use crate::naming::{EntryKind, NameMappingEntry};
use crate::progress::ProgressSink;
use crate::stage::channel::{FileJob, StageMessage, StageReceiver, StagedFile, StagingResult};
use crate::stage::generator::failed_entry;
use crate::stage::pipeline::StagingSession;
use crate::transform::transform;
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};

/// What a worker hands back
struct Completion {
    job: FileJob,
    outcome: Result<StagedFile>,
}

/// Submitter state
pub struct Submitter {
    session: Arc<StagingSession>,
    author: Arc<dyn ImageAuthor>,
    progress: Arc<dyn ProgressSink>,
}

impl Submitter {
    pub fn new(
        session: Arc<StagingSession>,
        author: Arc<dyn ImageAuthor>,
        progress: Arc<dyn ProgressSink>,
    ) -> Self {
        Self {
            session,
            author,
            progress,
        }
    }

    /// Consume messages until the Generator is done or the run is cancelled.
    pub async fn run(self, mut rx: StageReceiver) -> Result<StagingResult> {
        let cancel = self.session.cancel_token();
        let permits = Arc::new(Semaphore::new(self.session.options().workers()));
        let mut workers: JoinSet<Completion> = JoinSet::new();
        let mut result = StagingResult::default();
        let mut fatal: Option<StageError> = None;

        loop {
            let msg = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                msg = rx.recv() => match msg {
                    Some(msg) => msg,
                    None => break,
                },
            };

            while let Some(joined) = workers.try_join_next() {
                self.collect(joined, &mut result, &mut fatal);
            }
            if fatal.is_some() {
                count_dropped(&msg, &mut result);
                break;
            }

            let job = match msg {
                StageMessage::Mkdir(entry) => {
                    if let Err(e) = self.create_directory(&entry).await {
                        tracing::error!("Failed to create directory {}: {}", entry.path, e);
                        fatal = Some(e);
                        break;
                    }
                    result.stats.dirs_created += 1;
                    continue;
                }
                StageMessage::File(job) => job,
                StageMessage::AlreadyDone(job) => {
                    let restored = self
                        .author
                        .restore(&job.entry.short_id.short_path(), &job.entry.path, EntryKind::File)
                        .await;
                    match restored {
                        Ok(true) => {
                            tracing::debug!("Already staged: {}", job.entry.path);
                            result.stats.files_already_done += 1;
                            result.already_done.push(job.entry.path);
                            self.progress.advance(1);
                            continue;
                        }
                        Ok(false) => {
                            tracing::debug!("Staged payload missing, resubmitting {}", job.entry.path);
                            job
                        }
                        Err(e) => {
                            tracing::error!("Failed to restore {}: {}", job.entry.path, e);
                            fatal = Some(e);
                            break;
                        }
                    }
                }
                StageMessage::Planned(entry) => {
                    result.would_stage.push(entry.path);
                    continue;
                }
                StageMessage::Skipped(skipped) => {
                    result.stats.files_skipped += 1;
                    result.skipped.push(skipped);
                    continue;
                }
                StageMessage::Failed(failed) => {
                    result.stats.files_failed += 1;
                    result.failed.push(failed);
                    continue;
                }
                StageMessage::WalkEnd { files, dirs } => {
                    tracing::debug!("Walk complete: {} files, {} directories", files, dirs);
                    continue;
                }
            };

            // Wait for a free worker; a fatal error in flight cancels the wait
            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                permit = Arc::clone(&permits).acquire_owned() => permit.ok(),
            };
            let Some(permit) = permit else {
                result.stats.files_cancelled += 1;
                break;
            };

            let session = Arc::clone(&self.session);
            let author = Arc::clone(&self.author);
            let cancel = cancel.clone();
            workers.spawn(async move {
                let outcome = stage_file(&job, author.as_ref(), &session).await;
                if let Err(e) = &outcome {
                    if e.is_fatal() {
                        cancel.cancel();
                    }
                }
                drop(permit);
                Completion { job, outcome }
            });
        }

        if fatal.is_some() || cancel.is_cancelled() {
            cancel.cancel();
            // Queued files are dropped
            rx.close();
            while let Some(msg) = rx.recv().await {
                count_dropped(&msg, &mut result);
            }
        }

        // In-flight files complete
        while let Some(joined) = workers.join_next().await {
            self.collect(joined, &mut result, &mut fatal);
        }

        self.session.record_stats(&result.stats);
        if let Err(e) = self.session.flush_state().await {
            tracing::error!("Failed to save resume state: {}", e);
            fatal.get_or_insert(e);
        }

        if let Some(e) = fatal {
            return Err(e);
        }
        if cancel.is_cancelled() {
            tracing::warn!(
                "Run cancelled: {} files staged, {} dropped",
                result.stats.files_staged,
                result.stats.files_cancelled
            );
            return Err(StageError::Cancelled);
        }
        Ok(result)
    }

    async fn create_directory(&self, entry: &NameMappingEntry) -> Result<()> {
        self.author
            .create_directory(&entry.short_id.short_path(), &entry.path)
            .await?;
        tracing::debug!("Created directory {} as {}", entry.path, entry.short_id);
        self.session.mark_processed(entry).await
    }

    fn collect(
        &self,
        joined: std::result::Result<Completion, JoinError>,
        result: &mut StagingResult,
        fatal: &mut Option<StageError>,
    ) {
        let Completion { job, outcome } = match joined {
            Ok(completion) => completion,
            Err(e) => {
                fatal.get_or_insert(StageError::Task(format!("file worker: {}", e)));
                return;
            }
        };

        match outcome {
            Ok(staged) => {
                tracing::debug!(
                    "Staged {} as {} ({} -> {} bytes)",
                    staged.path,
                    staged.short_id,
                    staged.source_bytes,
                    staged.staged_bytes
                );
                result.stats.files_staged += 1;
                result.stats.bytes_read += staged.source_bytes;
                result.stats.bytes_staged += staged.staged_bytes;
                result.staged.push(staged);
                self.progress.advance(1);
            }
            Err(e) if !e.is_fatal() => {
                tracing::warn!("{}", e);
                result.stats.files_failed += 1;
                result.failed.push(failed_entry(e));
                self.progress.advance(1);
            }
            Err(e) => {
                tracing::error!("Failed to stage {}: {}", job.entry.path, e);
                fatal.get_or_insert(e);
            }
        }
    }
}

fn count_dropped(msg: &StageMessage, result: &mut StagingResult) {
    if matches!(msg, StageMessage::File(_) | StageMessage::AlreadyDone(_)) {
        result.stats.files_cancelled += 1;
    }
}

/// Read, transform and submit one file.
///
/// Read and transform failures affect only this file; submission and
/// state failures are fatal.
async fn stage_file(
    job: &FileJob,
    author: &dyn ImageAuthor,
    session: &StagingSession,
) -> Result<StagedFile> {
    let path = &job.entry.path;
    let data = tokio::fs::read(&job.source_path)
        .await
        .map_err(|e| StageError::skippable(path.as_str(), e))?;
    let source_bytes = data.len() as u64;
    if source_bytes != job.size {
        tracing::debug!("{} changed size during the run ({} -> {})", path, job.size, source_bytes);
    }

    let method = session.options().compression;
    let payload = if method.is_none() {
        Bytes::from(data)
    } else {
        let name = job.name.clone();
        tokio::task::spawn_blocking(move || transform(Bytes::from(data), method, &name))
            .await
            .map_err(|e| StageError::Task(format!("compressing {}: {}", path, e)))?
            .map_err(|e| StageError::skippable(path.as_str(), e))?
    };
    let staged_bytes = payload.len() as u64;

    author
        .add_file(&job.entry.short_id.short_path(), path, payload)
        .await?;
    session.mark_processed(&job.entry).await?;

    Ok(StagedFile {
        path: path.clone(),
        short_id: job.entry.short_id.clone(),
        source_bytes,
        staged_bytes,
    })
}
