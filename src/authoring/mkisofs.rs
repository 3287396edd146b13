//! Authoring through an external mkisofs-compatible mastering tool.
//!
//! Payloads are written under their short identifiers into a persistent work
//! directory, so an interrupted run can be resumed without re-reading the
//! source. `commit` grafts every entry flat at the image root under its short
//! identifier, so the 8.3 namespace carries the identifiers themselves, and
//! adds [`MANIFEST_NAME`] mapping each identifier back to its original path.

use super::ImageAuthor;
use crate::error::{Result, StageError};
use crate::naming::{EntryKind, ShortId};
use crate::walk::is_supported_name;
use async_trait::async_trait;
use bytes::Bytes;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Mutex;
use tokio::fs;
use tokio::process::Command;

/// Default mastering tool
pub const DEFAULT_TOOL: &str = "xorriso";

/// Name of the mapping manifest placed at the image root (8.3 legal)
pub const MANIFEST_NAME: &str = "MAPPING.JSN";

const PATH_LIST_NAME: &str = "graft-points.lst";

#[derive(Debug, Clone, PartialEq, Eq)]
struct Graft {
    short_path: String,
    original_path: String,
    staged: PathBuf,
    kind: EntryKind,
}

pub struct MkisofsAuthor {
    tool: PathBuf,
    label: String,
    work_dir: PathBuf,
    grafts: Mutex<Vec<Graft>>,
}

impl MkisofsAuthor {
    /// Default work directory for a destination image: `<dest>.staging/`
    pub fn default_work_dir(destination: &Path) -> PathBuf {
        let name = destination
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "image".to_string());
        destination.with_file_name(format!("{}.staging", name))
    }

    pub fn new(work_dir: impl Into<PathBuf>, label: impl Into<String>) -> Result<Self> {
        let work_dir = work_dir.into();
        if !is_supported_name(&work_dir.to_string_lossy()) {
            return Err(StageError::Config(format!(
                "work directory may not contain line breaks: {:?}",
                work_dir
            )));
        }
        std::fs::create_dir_all(&work_dir)?;
        Ok(Self {
            tool: PathBuf::from(DEFAULT_TOOL),
            label: label.into(),
            work_dir,
            grafts: Mutex::new(Vec::new()),
        })
    }

    pub fn tool(mut self, tool: impl Into<PathBuf>) -> Self {
        self.tool = tool.into();
        self
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    /// Payload location for `short_path`, which must be `/` plus a short id.
    fn staged_path(&self, short_path: &str) -> Result<PathBuf> {
        let name = short_path.strip_prefix('/').unwrap_or(short_path);
        let id = ShortId::try_from(name.to_string()).map_err(|_| {
            StageError::Authoring(format!("not a short path: {:?}", short_path))
        })?;
        Ok(self.work_dir.join(id.as_str()))
    }

    fn record(&self, graft: Graft) {
        self.grafts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(graft);
    }

    fn snapshot(&self) -> Vec<Graft> {
        self.grafts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// xorriso needs `-as mkisofs`; genisoimage/mkisofs take the options directly
    fn emulation_args(&self) -> Vec<String> {
        let is_xorriso = self
            .tool
            .file_name()
            .map(|n| n.to_string_lossy().contains("xorriso"))
            .unwrap_or(false);
        if is_xorriso {
            vec!["-as".to_string(), "mkisofs".to_string()]
        } else {
            Vec::new()
        }
    }

    /// Graft-point list: one `/SHORTID=staged/path` line per entry
    fn path_list(&self, grafts: &[Graft], manifest: &Path) -> String {
        let mut out = String::new();
        for graft in grafts {
            out.push_str(&graft.short_path);
            if graft.kind == EntryKind::Directory {
                out.push('/');
            }
            out.push('=');
            out.push_str(&escape_graft(&graft.staged.to_string_lossy()));
            out.push('\n');
        }
        out.push_str(&format!(
            "/{}={}\n",
            MANIFEST_NAME,
            escape_graft(&manifest.to_string_lossy())
        ));
        out
    }

    fn manifest(grafts: &[Graft]) -> Result<String> {
        let rows: Vec<serde_json::Value> = grafts
            .iter()
            .map(|g| {
                serde_json::json!({
                    "short_path": g.short_path,
                    "path": g.original_path,
                    "kind": g.kind,
                })
            })
            .collect();
        Ok(serde_json::to_string_pretty(&rows)?)
    }
}

/// Escape `=` and `\` in a graft point.
fn escape_graft(path: &str) -> String {
    let mut out = String::with_capacity(path.len());
    for c in path.chars() {
        if c == '=' || c == '\\' {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

#[async_trait]
impl ImageAuthor for MkisofsAuthor {
    async fn create_directory(&self, short_path: &str, original_path: &str) -> Result<()> {
        // Empty stand-in directory so empty source directories survive
        let staged = self.staged_path(short_path)?;
        fs::create_dir_all(&staged).await.map_err(|e| {
            StageError::Authoring(format!("cannot create {}: {}", staged.display(), e))
        })?;
        self.record(Graft {
            short_path: short_path.to_string(),
            original_path: original_path.to_string(),
            staged,
            kind: EntryKind::Directory,
        });
        Ok(())
    }

    async fn add_file(&self, short_path: &str, original_path: &str, data: Bytes) -> Result<()> {
        let staged = self.staged_path(short_path)?;
        let temp = staged.with_extension("part");
        fs::write(&temp, &data)
            .await
            .map_err(|e| StageError::Authoring(format!("cannot write {}: {}", temp.display(), e)))?;
        fs::rename(&temp, &staged).await.map_err(|e| {
            StageError::Authoring(format!("cannot finalize {}: {}", staged.display(), e))
        })?;
        self.record(Graft {
            short_path: short_path.to_string(),
            original_path: original_path.to_string(),
            staged,
            kind: EntryKind::File,
        });
        Ok(())
    }

    async fn restore(
        &self,
        short_path: &str,
        original_path: &str,
        kind: EntryKind,
    ) -> Result<bool> {
        let staged = self.staged_path(short_path)?;
        let present = match fs::metadata(&staged).await {
            Ok(meta) => match kind {
                EntryKind::File => meta.is_file(),
                EntryKind::Directory => meta.is_dir(),
            },
            Err(_) => false,
        };
        if !present {
            tracing::debug!("No staged payload for {} at {}", original_path, staged.display());
            return Ok(false);
        }
        self.record(Graft {
            short_path: short_path.to_string(),
            original_path: original_path.to_string(),
            staged,
            kind,
        });
        Ok(true)
    }

    async fn commit(&self, destination: &Path) -> Result<()> {
        let grafts = self.snapshot();

        let manifest_path = self.work_dir.join(MANIFEST_NAME);
        fs::write(&manifest_path, Self::manifest(&grafts)?).await?;

        let list_path = self.work_dir.join(PATH_LIST_NAME);
        fs::write(&list_path, self.path_list(&grafts, &manifest_path)).await?;

        let mut cmd = Command::new(&self.tool);
        cmd.args(self.emulation_args());
        cmd.args(["-quiet", "-iso-level", "1", "-J", "-R", "-V"]);
        cmd.arg(&self.label);
        cmd.arg("-graft-points");
        cmd.arg("-path-list").arg(&list_path);
        cmd.arg("-o").arg(destination);

        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::null());
        cmd.stderr(Stdio::piped());

        tracing::info!(
            "Running {} for {} entries -> {}",
            self.tool.display(),
            grafts.len(),
            destination.display()
        );

        let output = cmd.output().await.map_err(|e| {
            StageError::Authoring(format!("failed to spawn {}: {}", self.tool.display(), e))
        })?;

        if !output.status.success() {
            return Err(StageError::Authoring(format!(
                "{} exited with {}: {}",
                self.tool.display(),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_escape_graft() {
        assert_eq!(escape_graft("/a=b\\c"), "/a\\=b\\\\c");
        assert_eq!(escape_graft("/plain/path"), "/plain/path");
    }

    #[test]
    fn test_default_work_dir() {
        assert_eq!(
            MkisofsAuthor::default_work_dir(Path::new("/out/disc.iso")),
            PathBuf::from("/out/disc.iso.staging")
        );
    }

    #[test]
    fn test_emulation_args() {
        let tmp = TempDir::new().unwrap();
        let author = MkisofsAuthor::new(tmp.path(), "LABEL").unwrap();
        assert_eq!(author.emulation_args(), vec!["-as", "mkisofs"]);
        let author = author.tool("/usr/bin/genisoimage");
        assert!(author.emulation_args().is_empty());
    }

    #[tokio::test]
    async fn test_files_are_staged_under_short_names() {
        let tmp = TempDir::new().unwrap();
        let author = MkisofsAuthor::new(tmp.path().join("work"), "LABEL").unwrap();

        author.create_directory("/DIR00001", "sub").await.unwrap();
        author
            .add_file("/FILE0001", "sub/b.txt", Bytes::from_static(b"0123456789"))
            .await
            .unwrap();

        let staged = tmp.path().join("work/FILE0001");
        assert_eq!(std::fs::read(&staged).unwrap(), b"0123456789");
        assert!(tmp.path().join("work/DIR00001").is_dir());

        let grafts = author.snapshot();
        let list = author.path_list(&grafts, Path::new("/m"));
        assert_eq!(
            list,
            format!(
                "/DIR00001/={}\n/FILE0001={}\n/MAPPING.JSN=/m\n",
                tmp.path().join("work/DIR00001").display(),
                staged.display()
            )
        );
        // Original names only reach the image through the manifest
        assert!(!list.contains("sub"));

        let manifest: Vec<serde_json::Value> =
            serde_json::from_str(&MkisofsAuthor::manifest(&grafts).unwrap()).unwrap();
        assert_eq!(manifest[1]["short_path"], "/FILE0001");
        assert_eq!(manifest[1]["path"], "sub/b.txt");
    }

    #[tokio::test]
    async fn test_line_breaks_never_reach_the_path_list() {
        let tmp = TempDir::new().unwrap();
        let author = MkisofsAuthor::new(tmp.path().join("work"), "LABEL").unwrap();

        author
            .add_file("/FILE0001", "etc/hostname\nzzz", Bytes::from_static(b"x"))
            .await
            .unwrap();
        let err = author
            .add_file("/A\nB", "a.txt", Bytes::from_static(b"x"))
            .await
            .unwrap_err();
        assert!(matches!(err, StageError::Authoring(_)));

        let list = author.path_list(&author.snapshot(), Path::new("/m"));
        assert_eq!(list.lines().count(), 2);
        assert!(list.lines().all(|line| line.contains('=')));

        assert!(MkisofsAuthor::new(tmp.path().join("bad\nwork"), "LABEL").is_err());
    }

    #[tokio::test]
    async fn test_restore_requires_staged_payload() {
        let tmp = TempDir::new().unwrap();
        let author = MkisofsAuthor::new(tmp.path(), "LABEL").unwrap();
        std::fs::write(tmp.path().join("KEPT0001"), "x").unwrap();

        assert!(author
            .restore("/KEPT0001", "kept.txt", EntryKind::File)
            .await
            .unwrap());
        assert!(!author
            .restore("/GONE0001", "gone.txt", EntryKind::File)
            .await
            .unwrap());
        assert_eq!(author.snapshot().len(), 1);
    }

    #[tokio::test]
    async fn test_commit_failure_is_fatal() {
        let tmp = TempDir::new().unwrap();
        let author = MkisofsAuthor::new(tmp.path().join("work"), "LABEL")
            .unwrap()
            .tool(tmp.path().join("no-such-mastering-tool"));
        let err = author
            .commit(&tmp.path().join("out.iso"))
            .await
            .unwrap_err();
        assert!(matches!(err, StageError::Authoring(_)));
        assert!(err.is_fatal());
    }
}
