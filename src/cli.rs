use crate::integrity::{ChecksumAlgorithm, ImageCompression};
use crate::transform::CompressionMethod;
use clap::{ArgAction, Parser};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "isostage")]
#[command(version)]
#[command(
    about = "Stage files into an ISO 9660 image under short names",
    long_about = "Stage files and directory trees into an ISO 9660 image.\n\n\
    Every entry is stored flat at the image root under a random 8-character\n\
    identifier, which keeps the image within legacy 8.3 naming. MAPPING.JSN at\n\
    the image root (and --mapping-out) maps each identifier back to its\n\
    original path.\n\n\
    Interrupted runs resume where they stopped: identifiers and completed\n\
    files are recorded in <OUTPUT>.state.json."
)]
pub struct Cli {
    /// Files or directories to stage
    #[arg(required = true, value_name = "SOURCE")]
    pub sources: Vec<PathBuf>,

    /// Image to create (must end in .iso)
    #[arg(short, long, value_name = "OUTPUT")]
    pub output: PathBuf,

    /// Volume label (A-Z, 0-9, _; default ISO_<timestamp>)
    #[arg(short, long)]
    pub label: Option<String>,

    /// Directory inside the image to place all sources under
    #[arg(long, value_name = "PATH")]
    pub mount_prefix: Option<String>,

    /// Include hidden files (names starting with '.')
    #[arg(long)]
    pub hidden: bool,

    /// Stage the targets of symbolic links instead of reporting them as skipped
    #[arg(short = 'L', long)]
    pub follow_links: bool,

    /// Skip directories with this name (repeatable)
    #[arg(long = "exclude-dir", value_name = "NAME")]
    pub exclude_dirs: Vec<String>,

    /// Skip files with this name (repeatable)
    #[arg(long = "exclude-file", value_name = "NAME")]
    pub exclude_files: Vec<String>,

    /// Skip paths matching this glob, relative to the source (repeatable)
    #[arg(long = "exclude", value_name = "GLOB")]
    pub exclude_patterns: Vec<String>,

    /// Only stage files ending with this suffix (repeatable)
    #[arg(long = "include-suffix", value_name = "SUFFIX")]
    pub include_suffixes: Vec<String>,

    /// Skip files larger than this (default 1 GiB)
    #[arg(long, value_name = "BYTES")]
    pub max_file_size: Option<u64>,

    /// Stop adding files once the staged total would exceed this
    #[arg(long, value_name = "BYTES")]
    pub max_size: Option<u64>,

    /// Compress each file: none, zip, tar.gz, tar.bz2, tar.xz, 7z
    #[arg(short = 'c', long, value_name = "METHOD")]
    pub compression: Option<CompressionMethod>,

    /// Compress the finished image: gz, bz2, xz
    #[arg(long, value_name = "METHOD")]
    pub compress_image: Option<ImageCompression>,

    /// Process files in parallel
    #[arg(short, long)]
    pub parallel: bool,

    /// Number of parallel workers (implies --parallel; default: CPU count)
    #[arg(short, long)]
    pub jobs: Option<usize>,

    /// Checksum of the image: sha256, sha1, md5, blake3
    #[arg(long, value_name = "ALGORITHM")]
    pub checksum: Option<ChecksumAlgorithm>,

    /// List what would be staged without creating an image
    #[arg(short = 'n', long)]
    pub dry_run: bool,

    /// Mail a summary to this address when done
    #[arg(long, value_name = "ADDRESS")]
    pub email: Option<String>,

    /// From address for --email
    #[arg(long, value_name = "ADDRESS")]
    pub mail_from: Option<String>,

    /// Resume state file (default: <OUTPUT>.state.json)
    #[arg(long)]
    pub state_file: Option<PathBuf>,

    /// Staging work directory (default: <OUTPUT>.staging)
    #[arg(long)]
    pub work_dir: Option<PathBuf>,

    /// Ignore any saved state and start over
    #[arg(long)]
    pub fresh: bool,

    /// Write the name mapping table to this file as JSON
    #[arg(long, value_name = "FILE")]
    pub mapping_out: Option<PathBuf>,

    /// Mastering tool (default: xorriso)
    #[arg(long, value_name = "PROGRAM")]
    pub tool: Option<PathBuf>,

    /// Config file (default: ~/.config/isostage/config.toml)
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Verbose output (-v info, -vv debug)
    #[arg(short, long, action = ArgAction::Count)]
    pub verbose: u8,

    /// Only print errors
    #[arg(short, long, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Disable the progress bar
    #[arg(long)]
    pub no_progress: bool,
}

impl Cli {
    /// Log filter implied by -v/-q
    pub fn log_level(&self) -> &'static str {
        if self.quiet {
            return "error";
        }
        match self.verbose {
            0 => "warn",
            1 => "info",
            _ => "debug",
        }
    }
}
