use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

use crate::error::ErrorKind;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, ValueEnum, PartialEq, Eq, Hash, Default)]
pub enum ChecksumAlgorithm {
    #[serde(rename = "CRC32")]
    Crc32,
    #[serde(rename = "MD5")]
    Md5,
    #[serde(rename = "SHA1")]
    Sha1,
    #[serde(rename = "SHA256")]
    #[default]
    Sha256,
}

impl ChecksumAlgorithm {
    pub fn label(&self) -> &'static str {
        match self {
            ChecksumAlgorithm::Crc32 => "CRC32",
            ChecksumAlgorithm::Md5 => "MD5",
            ChecksumAlgorithm::Sha1 => "SHA1",
            ChecksumAlgorithm::Sha256 => "SHA256",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    #[default]
    Movie,
    Episode,
    Unknown,
}

impl MediaKind {
    pub const ALL: [MediaKind; 3] = [MediaKind::Movie, MediaKind::Episode, MediaKind::Unknown];
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaKind::Movie => write!(f, "movie"),
            MediaKind::Episode => write!(f, "episode"),
            MediaKind::Unknown => write!(f, "unknown"),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    Complete,
    Partial,
    Corrupted,
    Orphaned,
    Modified,
    Unknown,
}

impl HealthState {
    pub const ALL: [HealthState; 6] = [
        HealthState::Complete,
        HealthState::Partial,
        HealthState::Corrupted,
        HealthState::Orphaned,
        HealthState::Modified,
        HealthState::Unknown,
    ];

    /// States that mean the mirror copy should be re-acquired or reviewed.
    pub fn needs_attention(&self) -> bool {
        !matches!(self, HealthState::Complete)
    }
}

impl fmt::Display for HealthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            HealthState::Complete => "complete",
            HealthState::Partial => "partial",
            HealthState::Corrupted => "corrupted",
            HealthState::Orphaned => "orphaned",
            HealthState::Modified => "modified",
            HealthState::Unknown => "unknown",
        };
        f.write_str(label)
    }
}

/// One item of the remote library, as supplied by the discovery collaborator.
/// Read-only for this crate.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CatalogEntry {
    pub title: String,
    #[serde(default)]
    pub kind: MediaKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub show: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub season: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub episode: Option<u32>,
    pub size: u64,
    pub source_path: PathBuf,
    /// Expected content hash, when the library knows one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
}

impl CatalogEntry {
    pub fn movie(title: impl Into<String>, size: u64, source_path: impl Into<PathBuf>) -> Self {
        Self {
            title: title.into(),
            kind: MediaKind::Movie,
            show: None,
            season: None,
            episode: None,
            size,
            source_path: source_path.into(),
            checksum: None,
        }
    }

    pub fn episode(
        show: impl Into<String>,
        season: u32,
        episode: u32,
        title: impl Into<String>,
        size: u64,
        source_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            title: title.into(),
            kind: MediaKind::Episode,
            show: Some(show.into()),
            season: Some(season),
            episode: Some(episode),
            size,
            source_path: source_path.into(),
            checksum: None,
        }
    }

    pub fn episode_number(&self) -> Option<(u32, u32)> {
        match (self.season, self.episode) {
            (Some(s), Some(e)) => Some((s, e)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum MatchTier {
    Exact,
    Size,
    Fuzzy,
}

/// Weak reference from a mirror file back to the catalog: the entry's source
/// path is the lookup key.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CatalogMatch {
    pub source_path: PathBuf,
    pub tier: MatchTier,
    pub score: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MirrorFile {
    pub path: PathBuf,
    pub relative: PathBuf,
    pub size: u64,
    /// Modification time, whole seconds since the Unix epoch.
    pub modified: i64,
    pub extension: String,
    pub kind: MediaKind,
    pub checksum: Option<String>,
    pub catalog_match: Option<CatalogMatch>,
    pub ambiguous: bool,
    pub health: HealthState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

impl MirrorFile {
    pub fn file_name(&self) -> &str {
        self.path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
    }
}

/// Per-item problem recorded during a scan; never fatal to the scan.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScanWarning {
    pub path: PathBuf,
    pub kind: ErrorKind,
    pub message: String,
}

impl ScanWarning {
    pub fn new(path: impl Into<PathBuf>, kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for ScanWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}): {}", self.path.display(), self.kind, self.message)
    }
}
