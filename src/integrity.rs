//! Post-run integrity: checksum of the produced image and optional
//! compression of the image file.

use crate::error::{Result, StageError};
use serde::{Deserialize, Serialize};
use sha2::Digest;
use std::fmt;
use std::fs::File;
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Read size for streaming checksums (64KB)
pub const CHECKSUM_CHUNK_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ChecksumAlgorithm {
    #[default]
    Sha256,
    Sha1,
    Md5,
    Blake3,
}

impl ChecksumAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChecksumAlgorithm::Sha256 => "sha256",
            ChecksumAlgorithm::Sha1 => "sha1",
            ChecksumAlgorithm::Md5 => "md5",
            ChecksumAlgorithm::Blake3 => "blake3",
        }
    }
}

impl FromStr for ChecksumAlgorithm {
    type Err = StageError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "sha256" => Ok(ChecksumAlgorithm::Sha256),
            "sha1" => Ok(ChecksumAlgorithm::Sha1),
            "md5" => Ok(ChecksumAlgorithm::Md5),
            "blake3" => Ok(ChecksumAlgorithm::Blake3),
            other => Err(StageError::Config(format!(
                "unsupported checksum algorithm '{}' (expected sha256, sha1, md5 or blake3)",
                other
            ))),
        }
    }
}

impl TryFrom<String> for ChecksumAlgorithm {
    type Error = StageError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<ChecksumAlgorithm> for String {
    fn from(a: ChecksumAlgorithm) -> Self {
        a.as_str().to_string()
    }
}

impl fmt::Display for ChecksumAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Digest of a produced image
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChecksumRecord {
    pub algorithm: ChecksumAlgorithm,
    pub digest_hex: String,
}

impl fmt::Display for ChecksumRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.digest_hex)
    }
}

fn stream_digest<D: Digest, R: Read>(mut reader: R) -> io::Result<String> {
    let mut hasher = D::new();
    let mut buf = vec![0u8; CHECKSUM_CHUNK_SIZE];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

fn stream_blake3<R: Read>(mut reader: R) -> io::Result<String> {
    let mut hasher = blake3::Hasher::new();
    let mut buf = vec![0u8; CHECKSUM_CHUNK_SIZE];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize().to_hex().to_string())
}

/// Digest `reader` in fixed-size chunks.
pub fn checksum_reader<R: Read>(reader: R, algorithm: ChecksumAlgorithm) -> io::Result<String> {
    match algorithm {
        ChecksumAlgorithm::Sha256 => stream_digest::<sha2::Sha256, _>(reader),
        ChecksumAlgorithm::Sha1 => stream_digest::<sha1::Sha1, _>(reader),
        ChecksumAlgorithm::Md5 => stream_digest::<md5::Md5, _>(reader),
        ChecksumAlgorithm::Blake3 => stream_blake3(reader),
    }
}

/// Digest the file at `path` without loading it whole.
pub fn checksum(path: &Path, algorithm: ChecksumAlgorithm) -> Result<ChecksumRecord> {
    let file = File::open(path)?;
    let digest_hex = checksum_reader(file, algorithm)?;
    Ok(ChecksumRecord {
        algorithm,
        digest_hex,
    })
}

/// Compression applied to the finished image file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ImageCompression {
    Gzip,
    Bzip2,
    Xz,
}

impl ImageCompression {
    pub fn extension(&self) -> &'static str {
        match self {
            ImageCompression::Gzip => "gz",
            ImageCompression::Bzip2 => "bz2",
            ImageCompression::Xz => "xz",
        }
    }
}

impl FromStr for ImageCompression {
    type Err = StageError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "gz" | "gzip" => Ok(ImageCompression::Gzip),
            "bz2" | "bzip2" => Ok(ImageCompression::Bzip2),
            "xz" => Ok(ImageCompression::Xz),
            other => Err(StageError::Config(format!(
                "unsupported image compression '{}' (expected gz, bz2 or xz)",
                other
            ))),
        }
    }
}

impl TryFrom<String> for ImageCompression {
    type Error = StageError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<ImageCompression> for String {
    fn from(c: ImageCompression) -> Self {
        c.extension().to_string()
    }
}

impl fmt::Display for ImageCompression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

/// Stream `image` through the encoder into `<image>.<ext>`; returns the new path.
pub fn compress_image(image: &Path, method: ImageCompression) -> Result<PathBuf> {
    let mut name = image.as_os_str().to_owned();
    name.push(".");
    name.push(method.extension());
    let output = PathBuf::from(name);

    let mut src = File::open(image)?;
    let dst = BufWriter::new(File::create(&output)?);

    match method {
        ImageCompression::Gzip => {
            let mut enc = flate2::write::GzEncoder::new(dst, flate2::Compression::default());
            io::copy(&mut src, &mut enc)?;
            enc.finish()?.flush()?;
        }
        ImageCompression::Bzip2 => {
            let mut enc = bzip2::write::BzEncoder::new(dst, bzip2::Compression::default());
            io::copy(&mut src, &mut enc)?;
            enc.finish()?.flush()?;
        }
        ImageCompression::Xz => {
            let mut enc = xz2::write::XzEncoder::new(dst, 6);
            io::copy(&mut src, &mut enc)?;
            enc.finish()?.flush()?;
        }
    }

    tracing::info!("Compressed image: {}", output.display());
    Ok(output)
}
