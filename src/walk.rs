//! Source tree walker.
//!
//! Yields every file and directory under a root in depth-first,
//! parent-before-children order, with exclusion rules applied. Excluded
//! entries never appear; oversized files are surfaced as [`Walked::Skipped`]
//! so they can be reported.

use crate::error::{Result, StageError};
use crate::naming::EntryKind;
use ignore::{DirEntry, WalkBuilder};
use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

/// Default per-file ceiling (1 GiB)
pub const DEFAULT_FILE_CEILING: u64 = 1024 * 1024 * 1024;

/// Leading character marking a hidden file
pub const HIDDEN_MARKER: char = '.';

/// Exclusion policy for a walk.
#[derive(Debug, Clone, Default)]
pub struct WalkRules {
    /// Directory names whose whole subtree is pruned
    pub excluded_dir_names: HashSet<String>,
    /// File names that are skipped
    pub excluded_file_names: HashSet<String>,
    /// Whether files starting with `.` are staged
    pub include_hidden: bool,
    /// Glob patterns matched against the root-relative path (files and dirs)
    pub exclude_patterns: Vec<glob::Pattern>,
    /// When non-empty, only files whose name ends with one of these are staged
    pub include_suffixes: Vec<String>,
}

impl WalkRules {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn include_hidden(mut self, yes: bool) -> Self {
        self.include_hidden = yes;
        self
    }

    pub fn exclude_dir(mut self, name: impl Into<String>) -> Self {
        self.excluded_dir_names.insert(name.into());
        self
    }

    pub fn exclude_file(mut self, name: impl Into<String>) -> Self {
        self.excluded_file_names.insert(name.into());
        self
    }

    pub fn exclude_pattern(mut self, pattern: &str) -> Result<Self> {
        let compiled = glob::Pattern::new(pattern).map_err(|e| {
            StageError::Config(format!("invalid exclude pattern '{}': {}", pattern, e))
        })?;
        self.exclude_patterns.push(compiled);
        Ok(self)
    }

    pub fn include_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.include_suffixes.push(suffix.into());
        self
    }

    fn pattern_excluded(&self, relative: &str) -> bool {
        self.exclude_patterns.iter().any(|p| p.matches(relative))
    }

    /// Whether a directory is kept (its subtree visited).
    pub fn admits_dir(&self, name: &str, relative: &str) -> bool {
        !self.excluded_dir_names.contains(name) && !self.pattern_excluded(relative)
    }

    /// Whether a file is kept.
    pub fn admits_file(&self, name: &str, relative: &str) -> bool {
        if self.excluded_file_names.contains(name) {
            return false;
        }
        if !self.include_hidden && is_hidden(name) {
            return false;
        }
        if !self.include_suffixes.is_empty()
            && !self.include_suffixes.iter().any(|s| name.ends_with(s.as_str()))
        {
            return false;
        }
        !self.pattern_excluded(relative)
    }
}

pub fn is_hidden(name: &str) -> bool {
    name.starts_with(HIDDEN_MARKER)
}

/// One file or directory discovered by the walk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceEntry {
    /// Absolute (or caller-relative) path on the source filesystem
    pub source_path: PathBuf,
    /// Slash-separated path relative to the walk root
    pub relative_path: String,
    pub kind: EntryKind,
    /// Zero for directories
    pub size: u64,
    pub is_hidden: bool,
}

impl SourceEntry {
    pub fn name(&self) -> &str {
        self.relative_path
            .rsplit('/')
            .next()
            .unwrap_or(&self.relative_path)
    }

    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Directory
    }
}

/// Why an admitted entry is nevertheless not staged
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// Larger than the per-file ceiling
    Oversized { size: u64, ceiling: u64 },
    /// Would push the staged total past the image cap
    ExceedsTotalCap { size: u64, cap: u64 },
    /// Same relative path produced by two roots
    Duplicate,
    /// Root is neither a file nor a directory
    InvalidRoot,
    /// Symbolic link, and links are not followed
    Symlink,
    /// Socket, FIFO or device node
    SpecialFile,
    /// Path is not valid UTF-8 or contains a line break
    UnsupportedName,
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SkipReason::Oversized { size, ceiling } => {
                write!(f, "size {} exceeds per-file limit {}", size, ceiling)
            }
            SkipReason::ExceedsTotalCap { size, cap } => {
                write!(f, "size {} would exceed total image limit {}", size, cap)
            }
            SkipReason::Duplicate => write!(f, "path already staged from another root"),
            SkipReason::InvalidRoot => write!(f, "not a file or directory"),
            SkipReason::Symlink => write!(f, "symbolic link (links are not followed)"),
            SkipReason::SpecialFile => write!(f, "not a regular file"),
            SkipReason::UnsupportedName => {
                write!(f, "name is not valid UTF-8 or contains a line break")
            }
        }
    }
}

/// Item produced by [`Flattener::walk`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Walked {
    Entry(SourceEntry),
    Skipped { entry: SourceEntry, reason: SkipReason },
}

/// Walks one root. Each call to [`walk`](Flattener::walk) starts afresh.
pub struct Flattener {
    root: PathBuf,
    rules: Arc<WalkRules>,
    file_ceiling: u64,
    follow_links: bool,
}

impl Flattener {
    pub fn new(root: impl Into<PathBuf>, rules: Arc<WalkRules>) -> Self {
        Self {
            root: root.into(),
            rules,
            file_ceiling: DEFAULT_FILE_CEILING,
            follow_links: false,
        }
    }

    pub fn file_ceiling(mut self, ceiling: u64) -> Self {
        self.file_ceiling = ceiling;
        self
    }

    pub fn follow_links(mut self, follow: bool) -> Self {
        self.follow_links = follow;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Lazily walk the root.
    ///
    /// A root that is a regular file yields exactly that file, named by its
    /// file name. A directory root yields its contents but not itself.
    pub fn walk(&self) -> impl Iterator<Item = Result<Walked>> + '_ {
        let root = self.root.clone();
        let filter_root = root.clone();
        let filter_rules = Arc::clone(&self.rules);

        let mut builder = WalkBuilder::new(&root);
        builder
            .standard_filters(false)
            .follow_links(self.follow_links)
            .sort_by_file_name(|a, b| a.cmp(b))
            .filter_entry(move |entry| {
                if entry.depth() == 0 {
                    return true;
                }
                let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
                if !is_dir {
                    // Files are filtered after the walk so they can be counted
                    return true;
                }
                let name = entry.file_name().to_string_lossy();
                let relative = relative_path(&filter_root, entry.path());
                filter_rules.admits_dir(&name, &relative)
            });

        builder
            .build()
            .filter_map(move |result| self.classify(&root, result))
    }

    fn classify(
        &self,
        root: &Path,
        result: std::result::Result<DirEntry, ignore::Error>,
    ) -> Option<Result<Walked>> {
        let entry = match result {
            Ok(entry) => entry,
            Err(e) => {
                let path = walk_error_path(&e).unwrap_or_else(|| root.display().to_string());
                return Some(Err(StageError::skippable(path, e)));
            }
        };

        let file_type = entry.file_type()?;
        let is_dir = file_type.is_dir();

        if entry.depth() == 0 && is_dir {
            return None;
        }

        let name = entry.file_name().to_string_lossy().into_owned();
        let exact = if entry.depth() == 0 {
            entry.file_name().to_str().map(str::to_string)
        } else {
            utf8_relative_path(root, entry.path())
        };
        let supported = exact.as_deref().map(is_supported_name).unwrap_or(false);
        let relative = match exact {
            Some(relative) => relative,
            None if entry.depth() == 0 => name.clone(),
            None => relative_path(root, entry.path()),
        };

        let mut source = SourceEntry {
            source_path: entry.path().to_path_buf(),
            is_hidden: is_hidden(&name),
            relative_path: relative,
            kind: EntryKind::Directory,
            size: 0,
        };

        if is_dir {
            if !supported {
                return Some(Ok(Walked::Skipped {
                    entry: source,
                    reason: SkipReason::UnsupportedName,
                }));
            }
            return Some(Ok(Walked::Entry(source)));
        }

        source.kind = EntryKind::File;
        if !self.rules.admits_file(&name, &source.relative_path) {
            tracing::trace!("Excluded by rules: {}", source.relative_path);
            return None;
        }

        let reason = if file_type.is_symlink() {
            // Only reached when links are not followed
            Some(SkipReason::Symlink)
        } else if !file_type.is_file() {
            Some(SkipReason::SpecialFile)
        } else if !supported {
            Some(SkipReason::UnsupportedName)
        } else {
            None
        };
        if let Some(reason) = reason {
            return Some(Ok(Walked::Skipped {
                entry: source,
                reason,
            }));
        }

        let size = match entry.metadata() {
            Ok(meta) => meta.len(),
            Err(e) => return Some(Err(StageError::skippable(source.relative_path, e))),
        };
        source.size = size;

        if size > self.file_ceiling {
            return Some(Ok(Walked::Skipped {
                entry: source,
                reason: SkipReason::Oversized {
                    size,
                    ceiling: self.file_ceiling,
                },
            }));
        }

        Some(Ok(Walked::Entry(source)))
    }
}

fn walk_error_path(err: &ignore::Error) -> Option<String> {
    match err {
        ignore::Error::WithPath { path, .. } => Some(path.display().to_string()),
        ignore::Error::WithDepth { err, .. } => walk_error_path(err),
        _ => None,
    }
}

/// Slash-separated path of `path` relative to `root`.
pub fn relative_path(root: &Path, path: &Path) -> String {
    let rel = path.strip_prefix(root).unwrap_or(path);
    rel.components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

/// Like [`relative_path`], but `None` if any component is not valid UTF-8.
pub fn utf8_relative_path(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).unwrap_or(path);
    let mut parts = Vec::new();
    for c in rel.components() {
        if let Component::Normal(part) = c {
            parts.push(part.to_str()?);
        }
    }
    Some(parts.join("/"))
}

/// Paths with line breaks are never staged; they break line-based tool input.
pub fn is_supported_name(path: &str) -> bool {
    !path.contains(|c: char| c == '\n' || c == '\r')
}

/// Join a mount prefix and a root-relative path into the canonical staging path.
///
/// The prefix is normalised: leading/trailing slashes and `.` segments are
/// dropped; `..` is rejected.
pub fn mount_path(prefix: &str, relative: &str) -> Result<String> {
    let prefix = normalize_prefix(prefix)?;
    if prefix.is_empty() {
        Ok(relative.to_string())
    } else if relative.is_empty() {
        Ok(prefix)
    } else {
        Ok(format!("{}/{}", prefix, relative))
    }
}

pub fn normalize_prefix(prefix: &str) -> Result<String> {
    let mut parts = Vec::new();
    for part in prefix.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                return Err(StageError::Config(format!(
                    "mount prefix may not contain '..': {}",
                    prefix
                )))
            }
            p if !is_supported_name(p) => {
                return Err(StageError::Config(format!(
                    "mount prefix may not contain line breaks: {:?}",
                    prefix
                )))
            }
            p => parts.push(p),
        }
    }
    Ok(parts.join("/"))
}

/// Total bytes of all files a walk would stage (directories count zero).
pub fn required_bytes(flatteners: &[Flattener]) -> u64 {
    flatteners
        .iter()
        .flat_map(|f| f.walk())
        .filter_map(|item| match item {
            Ok(Walked::Entry(entry)) => Some(entry.size),
            _ => None,
        })
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn collect(flattener: &Flattener) -> Vec<Walked> {
        flattener.walk().map(|r| r.unwrap()).collect()
    }

    fn entry_paths(items: &[Walked]) -> Vec<String> {
        items
            .iter()
            .filter_map(|w| match w {
                Walked::Entry(e) => Some(e.relative_path.clone()),
                _ => None,
            })
            .collect()
    }

    fn sample_tree() -> TempDir {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("a.txt"), "abcd").unwrap();
        fs::create_dir(tmp.path().join("sub")).unwrap();
        fs::write(tmp.path().join("sub/b.txt"), "0123456789").unwrap();
        tmp
    }

    #[test]
    fn test_walk_basic_tree() {
        let tmp = sample_tree();
        let f = Flattener::new(tmp.path(), Arc::new(WalkRules::new()));
        let items = collect(&f);

        assert_eq!(entry_paths(&items), vec!["a.txt", "sub", "sub/b.txt"]);
        let sizes: Vec<u64> = items
            .iter()
            .map(|w| match w {
                Walked::Entry(e) => e.size,
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(sizes, vec![4, 0, 10]);
    }

    #[test]
    fn test_parent_before_children() {
        let tmp = TempDir::new().unwrap();
        fs::create_dir_all(tmp.path().join("x/y/z")).unwrap();
        fs::write(tmp.path().join("x/y/z/deep.bin"), "d").unwrap();
        fs::write(tmp.path().join("x/top.bin"), "t").unwrap();

        let f = Flattener::new(tmp.path(), Arc::new(WalkRules::new()));
        let paths = entry_paths(&collect(&f));

        let pos = |p: &str| paths.iter().position(|x| x == p).unwrap();
        assert!(pos("x") < pos("x/y"));
        assert!(pos("x") < pos("x/top.bin"));
        assert!(pos("x/y") < pos("x/y/z"));
        assert!(pos("x/y/z") < pos("x/y/z/deep.bin"));
    }

    #[test]
    fn test_hidden_files() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join(".hidden"), "h").unwrap();
        fs::write(tmp.path().join("shown"), "s").unwrap();

        let f = Flattener::new(tmp.path(), Arc::new(WalkRules::new()));
        assert_eq!(entry_paths(&collect(&f)), vec!["shown"]);

        let f = Flattener::new(tmp.path(), Arc::new(WalkRules::new().include_hidden(true)));
        let items = collect(&f);
        assert_eq!(entry_paths(&items), vec![".hidden", "shown"]);
        match &items[0] {
            Walked::Entry(e) => assert!(e.is_hidden),
            _ => panic!("expected entry"),
        }
    }

    #[test]
    fn test_excluded_dir_is_pruned() {
        let tmp = sample_tree();
        fs::create_dir(tmp.path().join("node_modules")).unwrap();
        fs::write(tmp.path().join("node_modules/pkg.js"), "x").unwrap();

        let rules = WalkRules::new().exclude_dir("node_modules");
        let f = Flattener::new(tmp.path(), Arc::new(rules));
        let paths = entry_paths(&collect(&f));
        assert!(!paths.iter().any(|p| p.starts_with("node_modules")));
        assert_eq!(paths.len(), 3);
    }

    #[test]
    fn test_excluded_file_name_and_pattern() {
        let tmp = sample_tree();
        fs::write(tmp.path().join("Thumbs.db"), "x").unwrap();
        fs::write(tmp.path().join("sub/skip.log"), "x").unwrap();

        let rules = WalkRules::new()
            .exclude_file("Thumbs.db")
            .exclude_pattern("**/*.log")
            .unwrap();
        let f = Flattener::new(tmp.path(), Arc::new(rules));
        assert_eq!(entry_paths(&collect(&f)), vec!["a.txt", "sub", "sub/b.txt"]);
    }

    #[test]
    fn test_include_suffix() {
        let tmp = sample_tree();
        fs::write(tmp.path().join("photo.jpg"), "x").unwrap();

        let rules = WalkRules::new().include_suffix(".jpg");
        let f = Flattener::new(tmp.path(), Arc::new(rules));
        // Directories are still walked
        assert_eq!(entry_paths(&collect(&f)), vec!["photo.jpg", "sub"]);
    }

    #[test]
    fn test_oversized_file_is_reported() {
        let tmp = sample_tree();
        let f = Flattener::new(tmp.path(), Arc::new(WalkRules::new())).file_ceiling(5);
        let items = collect(&f);

        assert_eq!(entry_paths(&items), vec!["a.txt", "sub"]);
        let skipped: Vec<_> = items
            .iter()
            .filter_map(|w| match w {
                Walked::Skipped { entry, reason } => Some((entry.relative_path.clone(), reason)),
                _ => None,
            })
            .collect();
        assert_eq!(skipped.len(), 1);
        assert_eq!(skipped[0].0, "sub/b.txt");
        assert_eq!(
            skipped[0].1,
            &SkipReason::Oversized {
                size: 10,
                ceiling: 5
            }
        );
    }

    #[test]
    fn test_file_root() {
        let tmp = sample_tree();
        let f = Flattener::new(tmp.path().join("a.txt"), Arc::new(WalkRules::new()));
        assert_eq!(entry_paths(&collect(&f)), vec!["a.txt"]);
    }

    #[test]
    fn test_walk_is_restartable() {
        let tmp = sample_tree();
        let f = Flattener::new(tmp.path(), Arc::new(WalkRules::new()));
        assert_eq!(collect(&f), collect(&f));
    }

    #[test]
    fn test_required_bytes() {
        let tmp = sample_tree();
        let f = Flattener::new(tmp.path(), Arc::new(WalkRules::new()));
        assert_eq!(required_bytes(&[f]), 14);
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_is_reported_unless_followed() {
        let tmp = sample_tree();
        std::os::unix::fs::symlink(tmp.path().join("a.txt"), tmp.path().join("link.txt")).unwrap();

        let f = Flattener::new(tmp.path(), Arc::new(WalkRules::new()));
        let items = collect(&f);
        assert!(!entry_paths(&items).contains(&"link.txt".to_string()));
        assert!(items.iter().any(|w| matches!(
            w,
            Walked::Skipped { entry, reason: SkipReason::Symlink } if entry.relative_path == "link.txt"
        )));

        let f = Flattener::new(tmp.path(), Arc::new(WalkRules::new())).follow_links(true);
        let items = collect(&f);
        assert!(entry_paths(&items).contains(&"link.txt".to_string()));
        assert!(!items.iter().any(|w| matches!(w, Walked::Skipped { .. })));
    }

    #[cfg(unix)]
    #[test]
    fn test_line_breaks_in_names_are_rejected() {
        let tmp = TempDir::new().unwrap();
        fs::create_dir(tmp.path().join("etc")).unwrap();
        fs::write(tmp.path().join("etc/hostname\nzzz"), "x").unwrap();
        fs::create_dir(tmp.path().join("bad\rdir")).unwrap();
        fs::write(tmp.path().join("bad\rdir/inner.txt"), "x").unwrap();

        let f = Flattener::new(tmp.path(), Arc::new(WalkRules::new()));
        let items = collect(&f);
        assert_eq!(entry_paths(&items), vec!["etc"]);

        let rejected: Vec<&str> = items
            .iter()
            .filter_map(|w| match w {
                Walked::Skipped {
                    entry,
                    reason: SkipReason::UnsupportedName,
                } => Some(entry.relative_path.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(rejected, vec!["bad\rdir", "bad\rdir/inner.txt", "etc/hostname\nzzz"]);
    }

    #[cfg(unix)]
    #[test]
    fn test_non_utf8_names_are_not_merged() {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;

        let tmp = TempDir::new().unwrap();
        let first = tmp.path().join(OsStr::from_bytes(b"name\xff"));
        let second = tmp.path().join(OsStr::from_bytes(b"name\xfe"));
        // Some filesystems refuse non-UTF-8 names
        if fs::write(&first, "1").is_err() || fs::write(&second, "2").is_err() {
            return;
        }

        let f = Flattener::new(tmp.path(), Arc::new(WalkRules::new()));
        let items = collect(&f);
        assert!(entry_paths(&items).is_empty());
        let rejected = items
            .iter()
            .filter(|w| matches!(w, Walked::Skipped { reason: SkipReason::UnsupportedName, .. }))
            .count();
        assert_eq!(rejected, 2);
    }

    #[test]
    fn test_mount_path() {
        assert_eq!(mount_path("", "a.txt").unwrap(), "a.txt");
        assert_eq!(mount_path("/", "a.txt").unwrap(), "a.txt");
        assert_eq!(mount_path("/backup/./2024/", "a.txt").unwrap(), "backup/2024/a.txt");
        assert!(mount_path("../up", "a.txt").is_err());
        assert!(mount_path("disc\n1", "a.txt").is_err());
    }
}
