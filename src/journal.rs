//! Append-only audit trail of mutating actions, one JSON object per line.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{Error, ErrorKind, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Delete,
    Move,
    Copy,
}

impl ActionKind {
    pub fn label(&self) -> &'static str {
        match self {
            ActionKind::Delete => "DELETE",
            ActionKind::Move => "MOVE",
            ActionKind::Copy => "COPY",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome {
    Success,
    Failure { kind: ErrorKind, reason: String },
}

impl Outcome {
    pub fn failure(err: &Error) -> Self {
        Outcome::Failure {
            kind: err.kind(),
            reason: err.to_string(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationRecord {
    pub timestamp: DateTime<Utc>,
    pub action: ActionKind,
    pub source: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination: Option<PathBuf>,
    pub bytes: u64,
    pub outcome: Outcome,
    /// Extra context, e.g. a trash policy note for an intercepted delete.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

pub struct Journal {
    path: PathBuf,
    file: File,
}

impl Journal {
    /// Open `path` for appending, creating it and its parent directory.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| Error::io(path, e))?;
        Ok(Self {
            path: path.to_path_buf(),
            file,
        })
    }

    /// Write one record and flush it to stable storage before returning.
    pub fn append(&mut self, record: &OperationRecord) -> Result<()> {
        let mut line = serde_json::to_string(record)?;
        line.push('\n');
        self.file
            .write_all(line.as_bytes())
            .and_then(|_| self.file.sync_data())
            .map_err(|e| Error::Journal(format!("{}: {e}", self.path.display())))
    }

    /// Every record in the journal at `path`. Lines that do not parse (for
    /// example a torn final write) are skipped with a warning.
    pub fn read_all(path: &Path) -> Result<Vec<OperationRecord>> {
        let file = File::open(path).map_err(|e| Error::io(path, e))?;
        let mut records = Vec::new();
        for (idx, line) in BufReader::new(file).lines().enumerate() {
            let line = line.map_err(|e| Error::io(path, e))?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(&line) {
                Ok(record) => records.push(record),
                Err(e) => warn!(line = idx + 1, journal = %path.display(), "skipping bad journal line: {e}"),
            }
        }
        Ok(records)
    }
}
