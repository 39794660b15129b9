use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{HealthState, MediaKind, MirrorFile, ScanWarning};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tally {
    pub count: usize,
    pub bytes: u64,
}

impl Tally {
    fn add(&mut self, bytes: u64) {
        self.count += 1;
        self.bytes = self.bytes.saturating_add(bytes);
    }
}

/// Count and byte totals per health state and per media kind.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counters {
    pub total: Tally,
    pub by_health: BTreeMap<HealthState, Tally>,
    pub by_kind: BTreeMap<MediaKind, Tally>,
    pub ambiguous: usize,
}

impl Counters {
    pub fn from_files(files: &[MirrorFile]) -> Self {
        let mut counters = Counters::default();
        for file in files {
            counters.total.add(file.size);
            counters.by_health.entry(file.health).or_default().add(file.size);
            counters.by_kind.entry(file.kind).or_default().add(file.size);
            if file.ambiguous {
                counters.ambiguous += 1;
            }
        }
        counters
    }

    pub fn health(&self, state: HealthState) -> Tally {
        self.by_health.get(&state).copied().unwrap_or_default()
    }

    pub fn kind(&self, kind: MediaKind) -> Tally {
        self.by_kind.get(&kind).copied().unwrap_or_default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanStatus {
    Complete,
    Cancelled,
}

/// Point-in-time snapshot of a mirror tree. Built once per scan and never
/// patched afterwards; a later scan produces a new inventory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Inventory {
    pub root: PathBuf,
    pub scanned_at: DateTime<Utc>,
    pub files: Vec<MirrorFile>,
    pub counters: Counters,
    pub warnings: Vec<ScanWarning>,
    pub status: ScanStatus,
    /// Work units (the root's own files, then each top-level subdirectory)
    /// whose results are included.
    pub completed_subtrees: Vec<PathBuf>,
}

impl Inventory {
    pub fn new(
        root: PathBuf,
        mut files: Vec<MirrorFile>,
        mut warnings: Vec<ScanWarning>,
        status: ScanStatus,
        mut completed_subtrees: Vec<PathBuf>,
    ) -> Self {
        files.sort_by(|a, b| a.path.cmp(&b.path));
        warnings.sort_by(|a, b| a.path.cmp(&b.path).then_with(|| a.message.cmp(&b.message)));
        completed_subtrees.sort();
        let counters = Counters::from_files(&files);
        Self {
            root,
            scanned_at: Utc::now(),
            files,
            counters,
            warnings,
            status,
            completed_subtrees,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.status == ScanStatus::Complete
    }

    pub fn get(&self, path: &Path) -> Option<&MirrorFile> {
        self.files
            .binary_search_by(|f| f.path.as_path().cmp(path))
            .ok()
            .map(|idx| &self.files[idx])
    }

    pub fn files_with_health(&self, state: HealthState) -> impl Iterator<Item = &MirrorFile> {
        self.files.iter().filter(move |f| f.health == state)
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn total_bytes(&self) -> u64 {
        self.counters.total.bytes
    }
}
