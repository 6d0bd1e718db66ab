//! Subband filename protocol
//!
//! Correlator output files are named `<timestamp>_sb<NN>.<ext>` where the
//! timestamp is `%Y-%m-%dT%H:%M:%S` UTC and `NN` is a zero-padded subband
//! index. Normalization rewrites only the timestamp prefix; the index and
//! suffix are preserved exactly.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use visflow_durable::persistence::parse_group_key;

/// Filename parse errors
#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum FilenameError {
    /// Path has no UTF-8 file name
    #[error("path has no UTF-8 file name: {0}")]
    NotUtf8(String),

    /// Name does not match `<timestamp>_sb<NN>.<ext>`
    #[error("file name does not match subband pattern: {0}")]
    Pattern(String),

    /// Timestamp prefix did not parse
    #[error("bad timestamp in file name: {0}")]
    Timestamp(String),

    /// Subband index did not parse
    #[error("bad subband index in file name: {0}")]
    Index(String),
}

/// Parsed subband filename.
#[derive(Debug, Clone, PartialEq)]
pub struct SubbandFilename {
    /// Timestamp embedded in the name (raw until normalized).
    pub raw_at: DateTime<Utc>,
    pub subband: u16,
    pub extension: String,
}

impl SubbandFilename {
    /// Parse a path's file name.
    pub fn parse(path: &Path) -> Result<Self, FilenameError> {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| FilenameError::NotUtf8(path.display().to_string()))?;

        // The timestamp itself contains '-' and ':', so anchor on "_sb".
        let marker = name
            .rfind("_sb")
            .ok_or_else(|| FilenameError::Pattern(name.to_string()))?;
        let (timestamp, rest) = name.split_at(marker);
        let rest = &rest[3..]; // strip "_sb"

        let dot = rest
            .find('.')
            .ok_or_else(|| FilenameError::Pattern(name.to_string()))?;
        let (index, extension) = rest.split_at(dot);
        let extension = &extension[1..];

        if index.len() != 2 || extension.is_empty() {
            return Err(FilenameError::Pattern(name.to_string()));
        }

        let subband: u16 = index
            .parse()
            .map_err(|_| FilenameError::Index(index.to_string()))?;
        let raw_at = parse_group_key(timestamp)
            .ok_or_else(|| FilenameError::Timestamp(timestamp.to_string()))?;

        Ok(Self {
            raw_at,
            subband,
            extension: extension.to_string(),
        })
    }
}

/// File name for a subband under a canonical group key.
pub fn canonical_name(group_key: &str, subband: u16, extension: &str) -> String {
    format!("{group_key}_sb{subband:02}.{extension}")
}

/// Full path for a subband under a canonical group key.
pub fn canonical_path(dir: &Path, group_key: &str, subband: u16, extension: &str) -> PathBuf {
    dir.join(canonical_name(group_key, subband, extension))
}
