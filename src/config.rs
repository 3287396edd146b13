//! Run configuration: optional TOML file merged under command-line flags.

use crate::cli::Cli;
use crate::error::{Result, StageError};
use crate::integrity::{ChecksumAlgorithm, ImageCompression};
use crate::naming::DEFAULT_ID_LENGTH;
use crate::stage::{FinishOptions, StageOptions};
use crate::state::ResumeStore;
use crate::authoring::mkisofs::{MkisofsAuthor, DEFAULT_TOOL};
use crate::transform::CompressionMethod;
use crate::walk::{WalkRules, DEFAULT_FILE_CEILING};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Longest volume label accepted
pub const MAX_LABEL_LEN: usize = 32;

/// chrono format of the default volume label
pub const DEFAULT_LABEL_FORMAT: &str = "ISO_%Y%m%d_%H%M%S";

/// Defaults read from `config.toml`. Every field is optional.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub mount_prefix: Option<String>,
    pub include_hidden: Option<bool>,
    pub follow_links: Option<bool>,
    pub exclude_dirs: Vec<String>,
    pub exclude_files: Vec<String>,
    pub exclude_patterns: Vec<String>,
    pub include_suffixes: Vec<String>,
    pub max_file_size: Option<u64>,
    pub max_total_size: Option<u64>,
    pub compression: Option<CompressionMethod>,
    pub compress_image: Option<ImageCompression>,
    pub checksum: Option<ChecksumAlgorithm>,
    pub parallel: Option<bool>,
    pub jobs: Option<usize>,
    pub checkpoint_every: Option<usize>,
    pub id_length: Option<usize>,
    pub email: Option<String>,
    pub mail_from: Option<String>,
    pub sendmail: Option<PathBuf>,
    pub tool: Option<PathBuf>,
}

impl Config {
    /// `$XDG_CONFIG_HOME/isostage/config.toml` (platform equivalent elsewhere)
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("isostage").join("config.toml"))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            StageError::Config(format!("cannot read config {}: {}", path.display(), e))
        })?;
        Self::parse(&content)
            .map_err(|e| StageError::Config(format!("{}: {}", path.display(), e)))
    }

    pub fn parse(content: &str) -> std::result::Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Load `explicit` (must exist), else the default file if present.
    pub fn discover(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load(path);
        }
        match Self::default_path() {
            Some(path) if path.is_file() => {
                tracing::debug!("Using config {}", path.display());
                Self::load(&path)
            }
            _ => Ok(Self::default()),
        }
    }
}

/// Everything a run needs, after flags, file and defaults are merged
#[derive(Debug, Clone)]
pub struct Settings {
    pub roots: Vec<PathBuf>,
    pub destination: PathBuf,
    pub label: String,
    pub options: StageOptions,
    pub finish: FinishOptions,
    pub state_file: PathBuf,
    pub work_dir: PathBuf,
    pub fresh: bool,
    pub tool: PathBuf,
    pub email: Option<String>,
    pub mail_from: Option<String>,
    pub sendmail: Option<PathBuf>,
    pub show_progress: bool,
}

impl Settings {
    /// Merge and validate. Flags win over the file.
    pub fn resolve(cli: &Cli, config: Config) -> Result<Self> {
        validate_destination(&cli.output)?;
        for root in &cli.sources {
            if std::fs::symlink_metadata(root).is_err() {
                return Err(StageError::Config(format!(
                    "source does not exist: {}",
                    root.display()
                )));
            }
        }

        let label = match &cli.label {
            Some(label) => validate_label(label)?,
            None => default_label(),
        };

        let mut rules = WalkRules::new()
            .include_hidden(cli.hidden || config.include_hidden.unwrap_or(false));
        for name in config.exclude_dirs.iter().chain(&cli.exclude_dirs) {
            rules = rules.exclude_dir(name.as_str());
        }
        for name in config.exclude_files.iter().chain(&cli.exclude_files) {
            rules = rules.exclude_file(name.as_str());
        }
        for pattern in config.exclude_patterns.iter().chain(&cli.exclude_patterns) {
            rules = rules.exclude_pattern(pattern)?;
        }
        for suffix in config.include_suffixes.iter().chain(&cli.include_suffixes) {
            rules = rules.include_suffix(suffix.as_str());
        }

        let parallel = cli.parallel || cli.jobs.is_some() || config.parallel.unwrap_or(false);
        let concurrency = parallel.then(|| {
            cli.jobs
                .or(config.jobs)
                .unwrap_or_else(num_cpus::get)
                .max(1)
        });

        let id_length = config.id_length.unwrap_or(DEFAULT_ID_LENGTH);
        if id_length == 0 || id_length > DEFAULT_ID_LENGTH {
            return Err(StageError::Config(format!(
                "id_length must be between 1 and {}, got {}",
                DEFAULT_ID_LENGTH, id_length
            )));
        }

        let options = StageOptions {
            mount_prefix: cli
                .mount_prefix
                .clone()
                .or(config.mount_prefix)
                .unwrap_or_default(),
            rules,
            per_file_ceiling: cli
                .max_file_size
                .or(config.max_file_size)
                .unwrap_or(DEFAULT_FILE_CEILING),
            max_total_bytes: cli.max_size.or(config.max_total_size),
            compression: cli.compression.or(config.compression).unwrap_or_default(),
            concurrency,
            dry_run: cli.dry_run,
            id_length,
            checkpoint_every: config.checkpoint_every.unwrap_or(1).max(1),
            follow_links: cli.follow_links || config.follow_links.unwrap_or(false),
        };

        let finish = FinishOptions {
            checksum: cli.checksum.or(config.checksum).unwrap_or_default(),
            compress_image: cli.compress_image.or(config.compress_image),
            mapping_out: cli.mapping_out.clone(),
        };

        Ok(Self {
            roots: cli.sources.clone(),
            state_file: cli
                .state_file
                .clone()
                .unwrap_or_else(|| ResumeStore::default_path(&cli.output)),
            work_dir: cli
                .work_dir
                .clone()
                .unwrap_or_else(|| MkisofsAuthor::default_work_dir(&cli.output)),
            destination: cli.output.clone(),
            label,
            options,
            finish,
            fresh: cli.fresh,
            tool: cli
                .tool
                .clone()
                .or(config.tool)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_TOOL)),
            email: cli.email.clone().or(config.email),
            mail_from: cli.mail_from.clone().or(config.mail_from),
            sendmail: config.sendmail,
            show_progress: !cli.quiet && !cli.no_progress && !cli.dry_run,
        })
    }
}

/// Destination must name an `.iso` file.
pub fn validate_destination(path: &Path) -> Result<()> {
    let is_iso = path
        .extension()
        .map(|ext| ext.eq_ignore_ascii_case("iso"))
        .unwrap_or(false);
    if !is_iso {
        return Err(StageError::Config(format!(
            "destination must have an .iso extension: {}",
            path.display()
        )));
    }
    Ok(())
}

/// Uppercase `label` and check it is a legal volume identifier.
pub fn validate_label(label: &str) -> Result<String> {
    let upper = label.to_ascii_uppercase();
    if upper.is_empty() || upper.len() > MAX_LABEL_LEN {
        return Err(StageError::Config(format!(
            "volume label must be 1 to {} characters: '{}'",
            MAX_LABEL_LEN, label
        )));
    }
    if let Some(bad) = upper
        .chars()
        .find(|c| !(c.is_ascii_uppercase() || c.is_ascii_digit() || *c == '_'))
    {
        return Err(StageError::Config(format!(
            "volume label may only contain A-Z, 0-9 and '_', found '{}'",
            bad
        )));
    }
    Ok(upper)
}

pub fn default_label() -> String {
    chrono::Local::now().format(DEFAULT_LABEL_FORMAT).to_string()
}
