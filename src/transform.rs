//! Optional per-file compression applied before a payload is staged.
//!
//! Each method wraps the bytes in a single-entry container named after the
//! file's original name. The short identifier is only the external name on
//! the image; archives keep the real name inside.

use crate::error::{Result, StageError};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::{self, Cursor, Write};
use std::str::FromStr;

/// Container used for a staged payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum CompressionMethod {
    #[default]
    None,
    Zip,
    TarGzip,
    TarBzip2,
    TarXz,
    SevenZip,
}

impl CompressionMethod {
    pub const ALL: [CompressionMethod; 6] = [
        CompressionMethod::None,
        CompressionMethod::Zip,
        CompressionMethod::TarGzip,
        CompressionMethod::TarBzip2,
        CompressionMethod::TarXz,
        CompressionMethod::SevenZip,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CompressionMethod::None => "none",
            CompressionMethod::Zip => "zip",
            CompressionMethod::TarGzip => "tar.gz",
            CompressionMethod::TarBzip2 => "tar.bz2",
            CompressionMethod::TarXz => "tar.xz",
            CompressionMethod::SevenZip => "7z",
        }
    }

    pub fn is_none(&self) -> bool {
        *self == CompressionMethod::None
    }
}

impl FromStr for CompressionMethod {
    type Err = StageError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "none" | "" => Ok(CompressionMethod::None),
            "zip" => Ok(CompressionMethod::Zip),
            "tar.gz" | "tgz" => Ok(CompressionMethod::TarGzip),
            "tar.bz2" | "tbz2" => Ok(CompressionMethod::TarBzip2),
            "tar.xz" | "txz" => Ok(CompressionMethod::TarXz),
            "7z" => Ok(CompressionMethod::SevenZip),
            other => Err(StageError::Config(format!(
                "unsupported compression method '{}' (expected one of: {})",
                other,
                CompressionMethod::ALL
                    .iter()
                    .map(|m| m.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            ))),
        }
    }
}

impl TryFrom<String> for CompressionMethod {
    type Error = StageError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<CompressionMethod> for String {
    fn from(m: CompressionMethod) -> Self {
        m.as_str().to_string()
    }
}

impl fmt::Display for CompressionMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Produce the staged payload for `data`. The input buffer is never modified.
pub fn transform(data: Bytes, method: CompressionMethod, entry_name: &str) -> Result<Bytes> {
    let fail = |e: &dyn fmt::Display| StageError::Compression {
        name: entry_name.to_string(),
        message: e.to_string(),
    };

    let out = match method {
        CompressionMethod::None => return Ok(data),
        CompressionMethod::Zip => zip_entry(&data, entry_name).map_err(|e| fail(&e))?,
        CompressionMethod::TarGzip => {
            let encoder =
                flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
            tar_entry(encoder, &data, entry_name)
                .and_then(|enc| enc.finish())
                .map_err(|e| fail(&e))?
        }
        CompressionMethod::TarBzip2 => {
            let encoder = bzip2::write::BzEncoder::new(Vec::new(), bzip2::Compression::default());
            tar_entry(encoder, &data, entry_name)
                .and_then(|enc| enc.finish())
                .map_err(|e| fail(&e))?
        }
        CompressionMethod::TarXz => {
            let encoder = xz2::write::XzEncoder::new(Vec::new(), 6);
            tar_entry(encoder, &data, entry_name)
                .and_then(|enc| enc.finish())
                .map_err(|e| fail(&e))?
        }
        CompressionMethod::SevenZip => seven_zip_entry(&data, entry_name)?,
    };

    Ok(Bytes::from(out))
}

fn tar_entry<W: Write>(writer: W, data: &[u8], name: &str) -> io::Result<W> {
    let mut header = tar::Header::new_gnu();
    header.set_size(data.len() as u64);
    header.set_mode(0o644);
    header.set_entry_type(tar::EntryType::Regular);
    header.set_mtime(chrono::Utc::now().timestamp().max(0) as u64);

    let mut builder = tar::Builder::new(writer);
    builder.append_data(&mut header, name, data)?;
    builder.into_inner()
}

fn zip_entry(data: &[u8], name: &str) -> zip::result::ZipResult<Vec<u8>> {
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    let options = zip::write::SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Deflated);
    writer.start_file(name, options)?;
    writer.write_all(data)?;
    Ok(writer.finish()?.into_inner())
}

fn seven_zip_entry(data: &[u8], name: &str) -> Result<Vec<u8>> {
    let fail = |e: &dyn fmt::Display| StageError::Compression {
        name: name.to_string(),
        message: e.to_string(),
    };

    let mut writer = sevenz_rust::SevenZWriter::new(Cursor::new(Vec::new())).map_err(|e| fail(&e))?;
    let mut entry = sevenz_rust::SevenZArchiveEntry::new();
    entry.name = name.to_string();
    entry.has_stream = true;
    entry.is_directory = false;
    writer
        .push_archive_entry(entry, Some(data))
        .map_err(|e| fail(&e))?;
    let cursor = writer.finish().map_err(|e| fail(&e))?;
    Ok(cursor.into_inner())
}
