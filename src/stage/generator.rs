//! Generator task for the staging pipeline.
//!
//! Walks every root, applies the run-wide rules (duplicates, total cap),
//! assigns short identifiers and streams messages to the Submitter.
//! Runs on a blocking thread; use [`Generator::spawn`] from async code.

use crate::error::{Result, StageError};
use crate::naming::EntryKind;
use crate::stage::channel::{
    FailedEntry, FileJob, SkippedEntry, StageMessage, StageSender,
};
use crate::stage::pipeline::StagingSession;
use crate::walk::{mount_path, normalize_prefix, Flattener, SkipReason, SourceEntry, Walked};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::task::JoinHandle;

/// One decision made while planning the walk
#[derive(Debug)]
pub enum Step {
    /// Directory at `path` (mount prefix components have no source)
    Directory { path: String },
    /// File admitted for staging
    File { path: String, source: SourceEntry },
    Skipped(SkippedEntry),
    Failed(FailedEntry),
}

/// Walks all roots in order and reports each [`Step`].
///
/// Shared by preflight (counting) and the generator (mapping), so both see
/// exactly the same set of files.
pub struct Planner<'a> {
    session: &'a StagingSession,
    roots: &'a [PathBuf],
}

impl<'a> Planner<'a> {
    pub fn new(session: &'a StagingSession, roots: &'a [PathBuf]) -> Self {
        Self { session, roots }
    }

    pub fn plan<F>(&self, mut visit: F) -> Result<()>
    where
        F: FnMut(Step) -> Result<()>,
    {
        let options = self.session.options();
        let prefix = normalize_prefix(&options.mount_prefix)?;
        let cancel = self.session.cancel_token();

        // Canonical path -> kind of whatever claimed it first
        let mut seen: HashMap<String, EntryKind> = HashMap::new();
        let mut total: u64 = 0;

        if !prefix.is_empty() {
            let mut acc = String::new();
            for part in prefix.split('/') {
                if !acc.is_empty() {
                    acc.push('/');
                }
                acc.push_str(part);
                seen.insert(acc.clone(), EntryKind::Directory);
                visit(Step::Directory { path: acc.clone() })?;
            }
        }

        for root in self.roots {
            if cancel.is_cancelled() {
                break;
            }

            match std::fs::metadata(root) {
                Ok(meta) if meta.is_dir() || meta.is_file() => {}
                Ok(_) => {
                    tracing::warn!("Skipping invalid item: {}", root.display());
                    visit(Step::Skipped(SkippedEntry {
                        path: root.display().to_string(),
                        reason: SkipReason::InvalidRoot,
                    }))?;
                    continue;
                }
                Err(e) => {
                    visit(Step::Failed(FailedEntry {
                        path: root.display().to_string(),
                        error: e.to_string(),
                    }))?;
                    continue;
                }
            }

            let flattener = Flattener::new(root, Arc::clone(self.session.rules()))
                .file_ceiling(options.per_file_ceiling)
                .follow_links(options.follow_links);

            for item in flattener.walk() {
                if cancel.is_cancelled() {
                    break;
                }

                let (source, reason) = match item {
                    Ok(Walked::Entry(source)) => (source, None),
                    Ok(Walked::Skipped { entry, reason }) => (entry, Some(reason)),
                    Err(e) if !e.is_fatal() => {
                        visit(Step::Failed(failed_entry(e)))?;
                        continue;
                    }
                    Err(e) => return Err(e),
                };

                let path = mount_path(&prefix, &source.relative_path)?;
                if let Some(reason) = reason {
                    visit(Step::Skipped(SkippedEntry { path, reason }))?;
                    continue;
                }

                if let Some(kind) = seen.get(&path) {
                    if *kind == EntryKind::Directory && source.is_dir() {
                        // Same directory under two roots: contents merge
                        tracing::trace!("Merging directory {}", path);
                    } else {
                        visit(Step::Skipped(SkippedEntry {
                            path,
                            reason: SkipReason::Duplicate,
                        }))?;
                    }
                    continue;
                }
                seen.insert(path.clone(), source.kind);

                if source.is_dir() {
                    visit(Step::Directory { path })?;
                    continue;
                }

                if let Some(cap) = options.max_total_bytes {
                    if total.saturating_add(source.size) > cap {
                        visit(Step::Skipped(SkippedEntry {
                            path,
                            reason: SkipReason::ExceedsTotalCap {
                                size: source.size,
                                cap,
                            },
                        }))?;
                        continue;
                    }
                }
                total += source.size;
                visit(Step::File { path, source })?;
            }
        }
        Ok(())
    }
}

/// Turn a per-entry error into a report row
pub fn failed_entry(err: StageError) -> FailedEntry {
    match err {
        StageError::Skippable { path, reason } => FailedEntry {
            path,
            error: reason,
        },
        other => FailedEntry {
            path: String::new(),
            error: other.to_string(),
        },
    }
}

/// Generator state
pub struct Generator {
    session: Arc<StagingSession>,
    roots: Vec<PathBuf>,
}

impl Generator {
    pub fn new(session: Arc<StagingSession>, roots: Vec<PathBuf>) -> Self {
        Self { session, roots }
    }

    /// Run on the blocking pool.
    pub fn spawn(self, tx: StageSender) -> JoinHandle<Result<()>> {
        tokio::task::spawn_blocking(move || self.run(tx))
    }

    /// Walk, map and send. Blocking.
    pub fn run(self, tx: StageSender) -> Result<()> {
        let session = &self.session;
        let dry_run = session.options().dry_run;
        let mut files = 0u64;
        let mut dirs = 0u64;

        let send = |msg: StageMessage| {
            tx.blocking_send(msg).map_err(|_| StageError::Cancelled)
        };

        Planner::new(session, &self.roots).plan(|step| match step {
            Step::Directory { path } => match session.assign(&path, EntryKind::Directory) {
                Ok(entry) => {
                    dirs += 1;
                    tracing::debug!("{} -> {}", entry.path, entry.short_id);
                    if dry_run {
                        send(StageMessage::Planned(entry))
                    } else {
                        send(StageMessage::Mkdir(entry))
                    }
                }
                Err(e) if !e.is_fatal() => send(StageMessage::Failed(failed_entry(e))),
                Err(e) => Err(e),
            },
            Step::File { path, source } => {
                let entry = match session.assign(&path, EntryKind::File) {
                    Ok(entry) => entry,
                    Err(e) if !e.is_fatal() => {
                        return send(StageMessage::Failed(failed_entry(e)));
                    }
                    Err(e) => return Err(e),
                };
                files += 1;
                tracing::debug!("{} -> {}", entry.path, entry.short_id);

                if dry_run {
                    return send(StageMessage::Planned(entry));
                }

                let name = source.name().to_string();
                let already_done = session.is_processed(&entry.path);
                let job = FileJob {
                    entry,
                    source_path: source.source_path,
                    size: source.size,
                    name,
                };
                if already_done {
                    send(StageMessage::AlreadyDone(job))
                } else {
                    send(StageMessage::File(job))
                }
            }
            Step::Skipped(skipped) => {
                tracing::warn!("Skipping {}: {}", skipped.path, skipped.reason);
                send(StageMessage::Skipped(skipped))
            }
            Step::Failed(failed) => {
                tracing::warn!("Failed to read {}: {}", failed.path, failed.error);
                send(StageMessage::Failed(failed))
            }
        })?;

        send(StageMessage::WalkEnd { files, dirs })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stage::channel::stage_channel;
    use crate::stage::pipeline::StageOptions;
    use std::fs;
    use tempfile::TempDir;

    fn sample_tree() -> TempDir {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("a.txt"), b"aaaa").unwrap();
        fs::create_dir(tmp.path().join("sub")).unwrap();
        fs::write(tmp.path().join("sub/b.txt"), b"bbbbbbbbbb").unwrap();
        tmp
    }

    fn collect(session: StagingSession, roots: Vec<PathBuf>) -> Vec<StageMessage> {
        let (tx, mut rx) = stage_channel();
        Generator::new(Arc::new(session), roots).run(tx).unwrap();
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            out.push(msg);
        }
        out
    }

    #[test]
    fn test_directory_precedes_children() {
        let tmp = sample_tree();
        let session = StagingSession::new(StageOptions::default()).unwrap();
        let msgs = collect(session, vec![tmp.path().to_path_buf()]);

        let order: Vec<String> = msgs
            .iter()
            .filter_map(|m| match m {
                StageMessage::Mkdir(e) => Some(format!("d:{}", e.path)),
                StageMessage::File(j) => Some(format!("f:{}", j.entry.path)),
                _ => None,
            })
            .collect();
        assert_eq!(order, vec!["f:a.txt", "d:sub", "f:sub/b.txt"]);
        assert!(matches!(
            msgs.last(),
            Some(StageMessage::WalkEnd { files: 2, dirs: 1 })
        ));
    }

    #[test]
    fn test_mount_prefix_directories_come_first() {
        let tmp = sample_tree();
        let options = StageOptions {
            mount_prefix: "/backup/2024/".into(),
            ..Default::default()
        };
        let session = StagingSession::new(options).unwrap();
        let msgs = collect(session, vec![tmp.path().to_path_buf()]);

        let dirs: Vec<&str> = msgs
            .iter()
            .filter_map(|m| match m {
                StageMessage::Mkdir(e) => Some(e.path.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(dirs, vec!["backup", "backup/2024", "backup/2024/sub"]);
    }

    #[test]
    fn test_duplicate_file_across_roots_is_skipped() {
        let one = TempDir::new().unwrap();
        let two = TempDir::new().unwrap();
        fs::write(one.path().join("same.txt"), b"1").unwrap();
        fs::write(two.path().join("same.txt"), b"2").unwrap();

        let session = StagingSession::new(StageOptions::default()).unwrap();
        let msgs = collect(
            session,
            vec![one.path().to_path_buf(), two.path().to_path_buf()],
        );

        let files = msgs
            .iter()
            .filter(|m| matches!(m, StageMessage::File(_)))
            .count();
        assert_eq!(files, 1);
        assert!(msgs.iter().any(|m| matches!(
            m,
            StageMessage::Skipped(SkippedEntry { reason: SkipReason::Duplicate, .. })
        )));
    }

    #[test]
    fn test_total_cap_skips_overflowing_files() {
        let tmp = sample_tree();
        let options = StageOptions {
            max_total_bytes: Some(8),
            ..Default::default()
        };
        let session = StagingSession::new(options).unwrap();
        let msgs = collect(session, vec![tmp.path().to_path_buf()]);

        let skipped: Vec<&SkippedEntry> = msgs
            .iter()
            .filter_map(|m| match m {
                StageMessage::Skipped(s) => Some(s),
                _ => None,
            })
            .collect();
        assert_eq!(skipped.len(), 1);
        assert_eq!(skipped[0].path, "sub/b.txt");
        assert_eq!(
            skipped[0].reason,
            SkipReason::ExceedsTotalCap { size: 10, cap: 8 }
        );
    }

    #[test]
    fn test_missing_root_is_reported_as_failure() {
        let tmp = TempDir::new().unwrap();
        let session = StagingSession::new(StageOptions::default()).unwrap();
        let msgs = collect(session, vec![tmp.path().join("gone")]);
        assert!(matches!(msgs.first(), Some(StageMessage::Failed(_))));
    }

    #[test]
    fn test_dry_run_plans_without_jobs() {
        let tmp = sample_tree();
        let options = StageOptions {
            dry_run: true,
            ..Default::default()
        };
        let session = StagingSession::new(options).unwrap();
        let msgs = collect(session, vec![tmp.path().to_path_buf()]);

        assert!(msgs
            .iter()
            .all(|m| matches!(m, StageMessage::Planned(_) | StageMessage::WalkEnd { .. })));
        assert_eq!(msgs.len(), 4);
    }
}
