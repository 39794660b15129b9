use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Closed classification of everything that can go wrong while reconciling a
/// mirror. Carried in scan warnings and journal outcomes so consumers can
/// group failures without parsing messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    NotADirectory,
    PermissionDenied,
    IoFailure,
    SpaceInsufficient,
    AmbiguousMatch,
    ConcurrentModification,
    SymlinkCycle,
    CacheCorrupted,
    Catalog,
    Journal,
    Config,
    Cancelled,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ErrorKind::NotFound => "not found",
            ErrorKind::NotADirectory => "not a directory",
            ErrorKind::PermissionDenied => "permission denied",
            ErrorKind::IoFailure => "i/o failure",
            ErrorKind::SpaceInsufficient => "insufficient space",
            ErrorKind::AmbiguousMatch => "ambiguous catalog match",
            ErrorKind::ConcurrentModification => "concurrent modification",
            ErrorKind::SymlinkCycle => "symlink cycle",
            ErrorKind::CacheCorrupted => "checksum cache corrupted",
            ErrorKind::Catalog => "catalog error",
            ErrorKind::Journal => "journal error",
            ErrorKind::Config => "configuration error",
            ErrorKind::Cancelled => "cancelled",
        };
        f.write_str(label)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("path does not exist: {}", .0.display())]
    NotFound(PathBuf),

    #[error("path is not a directory: {}", .0.display())]
    NotADirectory(PathBuf),

    #[error("permission denied: {}", .0.display())]
    PermissionDenied(PathBuf),

    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("insufficient space on {}: need {needed} bytes, {available} available", .volume.display())]
    SpaceInsufficient {
        volume: PathBuf,
        needed: u64,
        available: u64,
    },

    #[error("{} matches {} catalog entries equally", .path.display(), .candidates.len())]
    AmbiguousMatch {
        path: PathBuf,
        candidates: Vec<PathBuf>,
    },

    #[error("{} changed since selection: expected {expected} bytes, found {found}", .path.display())]
    ConcurrentModification {
        path: PathBuf,
        expected: u64,
        found: String,
    },

    #[error("checksum cache {} is unusable: {reason}", .path.display())]
    CacheCorrupted { path: PathBuf, reason: String },

    #[error("catalog error: {0}")]
    Catalog(String),

    #[error("journal error: {0}")]
    Journal(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("operation cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Wrap an I/O error for `path`, promoting the kinds that have their own
    /// variant in the taxonomy.
    pub fn io(path: impl AsRef<Path>, source: io::Error) -> Self {
        let path = path.as_ref().to_path_buf();
        match source.kind() {
            io::ErrorKind::NotFound => Error::NotFound(path),
            io::ErrorKind::PermissionDenied => Error::PermissionDenied(path),
            _ => Error::Io { path, source },
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::NotADirectory(_) => ErrorKind::NotADirectory,
            Error::PermissionDenied(_) => ErrorKind::PermissionDenied,
            Error::Io { .. } => ErrorKind::IoFailure,
            Error::SpaceInsufficient { .. } => ErrorKind::SpaceInsufficient,
            Error::AmbiguousMatch { .. } => ErrorKind::AmbiguousMatch,
            Error::ConcurrentModification { .. } => ErrorKind::ConcurrentModification,
            Error::CacheCorrupted { .. } => ErrorKind::CacheCorrupted,
            Error::Catalog(_) => ErrorKind::Catalog,
            Error::Journal(_) => ErrorKind::Journal,
            Error::Config(_) => ErrorKind::Config,
            Error::Database(_) => ErrorKind::CacheCorrupted,
            Error::Json(_) => ErrorKind::IoFailure,
            Error::Cancelled => ErrorKind::Cancelled,
        }
    }
}
