//! Per-file health state machine.

use crate::cache::CacheRecord;
use crate::types::{CatalogEntry, HealthState};

/// What the scanner observed about a file on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileFacts {
    pub size: u64,
    pub mtime: i64,
    /// The file could not be stat'ed or read.
    pub read_failed: bool,
}

/// Checksum information available for one file: the digest computed in this
/// run (only when verification was requested) and the record persisted by an
/// earlier run.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChecksumEvidence<'a> {
    pub computed: Option<&'a str>,
    pub baseline: Option<&'a CacheRecord>,
}

pub fn classify(
    facts: &FileFacts,
    entry: Option<&CatalogEntry>,
    evidence: &ChecksumEvidence<'_>,
) -> HealthState {
    if facts.read_failed {
        return HealthState::Unknown;
    }
    let Some(entry) = entry else {
        return HealthState::Orphaned;
    };

    // A baseline only counts as known-good if it described a complete copy.
    let known_good = evidence.baseline.filter(|b| b.size == entry.size);

    if let Some(good) = known_good {
        let newer = facts.mtime > good.mtime;
        let size_differs = facts.size != good.size;
        let hash_differs = evidence.computed.is_some_and(|h| h != good.hash);
        if newer && (size_differs || hash_differs) {
            return HealthState::Modified;
        }
    }

    if facts.size < entry.size {
        return HealthState::Partial;
    }
    if facts.size > entry.size {
        return HealthState::Corrupted;
    }

    if let Some(computed) = evidence.computed {
        let expected_mismatch = entry
            .checksum
            .as_deref()
            .is_some_and(|expected| !expected.eq_ignore_ascii_case(computed));
        let baseline_mismatch = known_good.is_some_and(|good| good.hash != computed);
        if expected_mismatch || baseline_mismatch {
            return HealthState::Corrupted;
        }
    }

    HealthState::Complete
}
