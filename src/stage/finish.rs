//! Post-staging steps: commit, checksum, optional image compression and
//! mapping export.

use crate::authoring::ImageAuthor;
use crate::error::{Result, StageError};
use crate::integrity::{self, ChecksumAlgorithm, ChecksumRecord, ImageCompression};
use crate::stage::pipeline::StagingSession;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default)]
pub struct FinishOptions {
    pub checksum: ChecksumAlgorithm,
    pub compress_image: Option<ImageCompression>,
    /// Write the mapping table here as JSON
    pub mapping_out: Option<PathBuf>,
}

/// What the run produced on disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinishedImage {
    pub image: PathBuf,
    /// Checksum of the uncompressed image
    pub checksum: ChecksumRecord,
    pub compressed: Option<PathBuf>,
}

/// Commit the image and post-process it. Any failure here is fatal.
pub async fn finish(
    session: &StagingSession,
    author: &dyn ImageAuthor,
    destination: &Path,
    options: &FinishOptions,
) -> Result<FinishedImage> {
    author.commit(destination).await?;
    tracing::info!("Image committed: {}", destination.display());

    if let Some(path) = &options.mapping_out {
        session.export_mapping(path)?;
    }

    let image = destination.to_path_buf();
    let algorithm = options.checksum;
    let compress = options.compress_image;
    let (checksum, compressed) = tokio::task::spawn_blocking(move || -> Result<_> {
        let checksum = integrity::checksum(&image, algorithm)?;
        let compressed = compress
            .map(|method| integrity::compress_image(&image, method))
            .transpose()?;
        Ok((checksum, compressed))
    })
    .await
    .map_err(|e| StageError::Task(format!("checksum: {}", e)))??;

    tracing::info!("Checksum {}", checksum);
    Ok(FinishedImage {
        image: destination.to_path_buf(),
        checksum,
        compressed,
    })
}
