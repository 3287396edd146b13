use anyhow::{Context, Result};
use clap::Parser;
use colored::Colorize;
use isostage::authoring::{ImageAuthor, MemoryAuthor, MkisofsAuthor};
use isostage::capacity::FsProbe;
use isostage::cli::Cli;
use isostage::config::{Config, Settings};
use isostage::notify::{self, LogNotifier, Outcome, SendmailNotifier};
use isostage::progress::{BarProgress, NoProgress, ProgressSink};
use isostage::stage::{self, StageStats, StagingResult, StagingSession};
use isostage::state::ResumeStore;
use isostage::StageError;
use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// Conventional exit status for SIGINT
const EXIT_CANCELLED: u8 = 130;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(cli.log_level()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            if matches!(e.downcast_ref::<StageError>(), Some(StageError::Cancelled)) {
                eprintln!("{}", "Cancelled; rerun the same command to resume".yellow());
                return ExitCode::from(EXIT_CANCELLED);
            }
            eprintln!("{} {:#}", "error:".red().bold(), e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = Config::discover(cli.config.as_deref())?;
    let settings = Settings::resolve(&cli, config)?;

    let session = Arc::new(StagingSession::new(settings.options.clone())?);

    let cancel = session.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, waiting for in-flight files");
            cancel.cancel();
        }
    });

    let preflight = {
        let session = Arc::clone(&session);
        let roots = settings.roots.clone();
        let destination = settings.destination.clone();
        tokio::task::spawn_blocking(move || session.preflight(&roots, &destination, &FsProbe))
            .await
            .context("Preflight task failed")??
    };

    // State is touched only after preflight passes
    if !settings.options.dry_run {
        let mut store = ResumeStore::open(&settings.state_file)
            .with_context(|| format!("Failed to open state file {}", settings.state_file.display()))?;
        if settings.fresh {
            store.clear_all()?;
            if settings.work_dir.exists() {
                std::fs::remove_dir_all(&settings.work_dir).with_context(|| {
                    format!("Failed to clear work directory {}", settings.work_dir.display())
                })?;
            }
            tracing::info!("Starting fresh");
        }
        session.resume_from(store)?;
    }

    if settings.options.dry_run {
        let result = session
            .stage(
                settings.roots.clone(),
                &preflight,
                Arc::new(MemoryAuthor::new()),
                Arc::new(NoProgress),
            )
            .await?;
        print_plan(&result);
        return Ok(());
    }

    let author: Arc<dyn ImageAuthor> = Arc::new(
        MkisofsAuthor::new(&settings.work_dir, &settings.label)?.tool(&settings.tool),
    );
    let progress: Arc<dyn ProgressSink> = if settings.show_progress {
        Arc::new(BarProgress::new())
    } else {
        Arc::new(NoProgress)
    };

    let staged = session
        .stage(settings.roots.clone(), &preflight, Arc::clone(&author), progress)
        .await;
    let result = match staged {
        Ok(result) => result,
        Err(e) => {
            report(&settings, false, session.stats(), None, Some(&e));
            return Err(e.into());
        }
    };

    match stage::finish(&session, author.as_ref(), &settings.destination, &settings.finish).await {
        Ok(image) => {
            report(&settings, true, result.stats.clone(), Some(image.checksum.clone()), None);
            print_summary(&result);
            println!("{} {}", "checksum".bold(), image.checksum);
            if let Some(compressed) = image.compressed {
                println!("{} {}", "compressed".bold(), compressed.display());
            }
            Ok(())
        }
        Err(e) => {
            report(&settings, false, result.stats.clone(), None, Some(&e));
            Err(e).context("Failed to finalize image")
        }
    }
}

fn report(
    settings: &Settings,
    success: bool,
    stats: StageStats,
    checksum: Option<isostage::integrity::ChecksumRecord>,
    error: Option<&StageError>,
) {
    if matches!(error, Some(StageError::Cancelled)) {
        return;
    }
    let outcome = Outcome {
        success,
        destination: settings.destination.clone(),
        checksum,
        stats,
        error: error.map(|e| e.to_string()),
    };

    match &settings.email {
        Some(recipient) => {
            let mut notifier = SendmailNotifier::new();
            if let Some(program) = &settings.sendmail {
                notifier = notifier.program(program);
            }
            if let Some(from) = &settings.mail_from {
                notifier = notifier.sender(from);
            }
            notify::deliver(&notifier, &outcome, recipient);
        }
        None => {
            notify::deliver(&LogNotifier, &outcome, "log");
        }
    }
}

fn print_plan(result: &StagingResult) {
    for path in &result.would_stage {
        if let Some(row) = result.mapping_for(path) {
            println!("{}\t{}", row.short_id.short_path(), row.path);
        }
    }
    for skipped in &result.skipped {
        println!("{} {} ({})", "skip".yellow(), skipped.path, skipped.reason);
    }
    println!(
        "{} {} entries would be staged, {} skipped",
        "dry run:".bold(),
        result.would_stage.len(),
        result.skipped.len()
    );
}

fn print_summary(result: &StagingResult) {
    let stats = &result.stats;
    let failed = if stats.files_failed > 0 {
        stats.files_failed.to_string().red().to_string()
    } else {
        stats.files_failed.to_string()
    };
    println!(
        "{} {} files ({} bytes) staged, {} directories, {} already done, {} skipped, {} failed",
        "done:".green().bold(),
        stats.files_staged,
        stats.bytes_staged,
        stats.dirs_created,
        stats.files_already_done,
        stats.files_skipped,
        failed
    );
}
