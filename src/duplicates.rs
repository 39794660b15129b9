//! Duplicate detection over an inventory snapshot.
//!
//! Four independent passes each emit raw groups; [`merge_groups`] unions any
//! groups that share a member, keeping the highest confidence and every
//! strategy tag that contributed.

use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::cancel::CancelToken;
use crate::checksum::ChecksumService;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::inventory::Inventory;
use crate::normalize::{self, EpisodeNumber, TokenSet};
use crate::progress::ProgressReporter;
use crate::types::{HealthState, MirrorFile, ScanWarning};
use crate::utils::bounded_pool;

const HASH_BATCH: usize = 32;
/// Smallest `min/max` size ratio at which two files with matching sampled
/// windows are still compared.
const PARTIAL_MIN_SIZE_RATIO: f64 = 0.3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Strategy {
    ExactChecksum,
    FuzzyName,
    SizeSimilarity,
    PartialContent,
}

impl Strategy {
    pub const ALL: [Strategy; 4] = [
        Strategy::ExactChecksum,
        Strategy::FuzzyName,
        Strategy::SizeSimilarity,
        Strategy::PartialContent,
    ];

    pub fn tag(&self) -> &'static str {
        match self {
            Strategy::ExactChecksum => "exact-checksum",
            Strategy::FuzzyName => "fuzzy-name",
            Strategy::SizeSimilarity => "size-similarity",
            Strategy::PartialContent => "partial-content",
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Recommendation {
    /// Every member is byte-identical; all but the keeper can go.
    DeleteRedundant,
    /// Strong evidence of the same title; keep the keeper after a glance.
    KeepBest,
    Review,
}

impl fmt::Display for Recommendation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Recommendation::DeleteRedundant => "delete all but the keeper",
            Recommendation::KeepBest => "keep the best copy",
            Recommendation::Review => "review manually",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfidenceTier {
    VeryLow,
    Low,
    Medium,
    High,
    VeryHigh,
}

impl ConfidenceTier {
    pub fn from_score(score: f64) -> Self {
        if score >= 0.95 {
            ConfidenceTier::VeryHigh
        } else if score >= 0.8 {
            ConfidenceTier::High
        } else if score >= 0.6 {
            ConfidenceTier::Medium
        } else if score >= 0.4 {
            ConfidenceTier::Low
        } else {
            ConfidenceTier::VeryLow
        }
    }
}

/// Output of a single pass, before merging.
#[derive(Debug, Clone)]
pub struct RawGroup {
    pub members: Vec<MirrorFile>,
    pub strategy: Strategy,
    pub confidence: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct DuplicateGroup {
    /// Sorted by path.
    pub members: Vec<MirrorFile>,
    pub strategies: BTreeSet<Strategy>,
    pub confidence: f64,
    pub keeper: PathBuf,
    pub total_bytes: u64,
    pub reclaimable_bytes: u64,
    pub recommendation: Recommendation,
}

impl DuplicateGroup {
    pub fn keeper_file(&self) -> Option<&MirrorFile> {
        self.members.iter().find(|m| m.path == self.keeper)
    }

    pub fn redundant(&self) -> impl Iterator<Item = &MirrorFile> {
        self.members.iter().filter(move |m| m.path != self.keeper)
    }

    pub fn tier(&self) -> ConfidenceTier {
        ConfidenceTier::from_score(self.confidence)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DuplicateReport {
    pub groups: Vec<DuplicateGroup>,
    /// False when detection was cancelled before every pass finished.
    pub complete: bool,
    pub warnings: Vec<ScanWarning>,
}

impl DuplicateReport {
    pub fn reclaimable_bytes(&self) -> u64 {
        self.groups.iter().map(|g| g.reclaimable_bytes).sum()
    }
}

/// Total order used to pick the copy worth keeping: larger first, then more
/// recently modified, then shorter path, then path order.
pub fn keeper_order(a: &MirrorFile, b: &MirrorFile) -> Ordering {
    b.size
        .cmp(&a.size)
        .then_with(|| b.modified.cmp(&a.modified))
        .then_with(|| a.path.as_os_str().len().cmp(&b.path.as_os_str().len()))
        .then_with(|| a.path.cmp(&b.path))
}

struct UnionFind {
    parent: Vec<usize>,
}

impl UnionFind {
    fn new(n: usize) -> Self {
        Self {
            parent: (0..n).collect(),
        }
    }

    fn find(&mut self, mut x: usize) -> usize {
        while self.parent[x] != x {
            self.parent[x] = self.parent[self.parent[x]];
            x = self.parent[x];
        }
        x
    }

    fn union(&mut self, a: usize, b: usize) {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra != rb {
            // Smaller index wins so roots are stable.
            let (lo, hi) = if ra < rb { (ra, rb) } else { (rb, ra) };
            self.parent[hi] = lo;
        }
    }
}

/// Union raw groups that share at least one member (by path).
pub fn merge_groups(raw: Vec<RawGroup>) -> Vec<DuplicateGroup> {
    let mut index: HashMap<PathBuf, usize> = HashMap::new();
    let mut files: Vec<MirrorFile> = Vec::new();
    for group in &raw {
        for member in &group.members {
            if !index.contains_key(&member.path) {
                index.insert(member.path.clone(), files.len());
                files.push(member.clone());
            }
        }
    }

    let mut uf = UnionFind::new(files.len());
    for group in &raw {
        let ids: Vec<usize> = group.members.iter().map(|m| index[&m.path]).collect();
        for pair in ids.windows(2) {
            uf.union(pair[0], pair[1]);
        }
    }

    struct Acc {
        members: BTreeSet<usize>,
        strategies: BTreeSet<Strategy>,
        confidence: f64,
        exact_sets: Vec<BTreeSet<usize>>,
    }
    let mut components: HashMap<usize, Acc> = HashMap::new();
    for group in &raw {
        let ids: BTreeSet<usize> = group.members.iter().map(|m| index[&m.path]).collect();
        let Some(&first) = ids.iter().next() else {
            continue;
        };
        let root = uf.find(first);
        let acc = components.entry(root).or_insert_with(|| Acc {
            members: BTreeSet::new(),
            strategies: BTreeSet::new(),
            confidence: 0.0,
            exact_sets: Vec::new(),
        });
        acc.strategies.insert(group.strategy);
        acc.confidence = acc.confidence.max(group.confidence);
        if group.strategy == Strategy::ExactChecksum {
            acc.exact_sets.push(ids.clone());
        }
        acc.members.extend(ids);
    }

    let mut groups: Vec<DuplicateGroup> = components
        .into_values()
        .filter(|acc| acc.members.len() >= 2)
        .map(|acc| {
            let mut members: Vec<MirrorFile> =
                acc.members.iter().map(|&id| files[id].clone()).collect();
            members.sort_by(|a, b| a.path.cmp(&b.path));

            let keeper = members
                .iter()
                .min_by(|a, b| keeper_order(a, b))
                .map(|m| (m.path.clone(), m.size))
                .unwrap_or_default();
            let total_bytes: u64 = members.iter().map(|m| m.size).sum();
            let confidence = acc.confidence.clamp(0.0, 1.0);

            let identical = acc.exact_sets.iter().any(|set| *set == acc.members);
            let recommendation = if identical {
                Recommendation::DeleteRedundant
            } else if confidence >= 0.8 {
                Recommendation::KeepBest
            } else {
                Recommendation::Review
            };

            DuplicateGroup {
                members,
                strategies: acc.strategies,
                confidence,
                keeper: keeper.0,
                total_bytes,
                reclaimable_bytes: total_bytes.saturating_sub(keeper.1),
                recommendation,
            }
        })
        .collect();

    groups.sort_by(|a, b| {
        b.confidence
            .total_cmp(&a.confidence)
            .then_with(|| b.reclaimable_bytes.cmp(&a.reclaimable_bytes))
            .then_with(|| a.keeper.cmp(&b.keeper))
    });
    groups
}

struct Candidate<'a> {
    file: &'a MirrorFile,
    tokens: TokenSet,
    episode: Option<EpisodeNumber>,
}

pub struct DuplicateDetector<'a> {
    config: &'a Config,
    checksums: &'a ChecksumService,
}

impl<'a> DuplicateDetector<'a> {
    pub fn new(config: &'a Config, checksums: &'a ChecksumService) -> Self {
        Self { config, checksums }
    }

    pub fn detect(
        &self,
        inventory: &Inventory,
        cancel: &CancelToken,
        reporter: &dyn ProgressReporter,
    ) -> Result<DuplicateReport> {
        let files: Vec<&MirrorFile> = inventory
            .files
            .iter()
            .filter(|f| f.health != HealthState::Unknown)
            .collect();
        info!(files = files.len(), "detecting duplicates");

        let mut raw = Vec::new();
        let mut warnings = Vec::new();
        let mut complete = inventory.is_complete();

        let (exact, full_hashes) = self.exact_pass(&files, cancel, reporter, &mut warnings)?;
        reporter.on_detect_pass(Strategy::ExactChecksum, exact.len());
        raw.extend(exact);

        if !cancel.is_cancelled() {
            let candidates: Vec<Candidate> = files
                .iter()
                .map(|&f| Candidate {
                    file: f,
                    tokens: file_tokens(f),
                    episode: normalize::parse_episode(&f.path),
                })
                .collect();

            if let Some(groups) = self.fuzzy_name_pass(&candidates, cancel) {
                reporter.on_detect_pass(Strategy::FuzzyName, groups.len());
                raw.extend(groups);
            }
            if let Some(groups) = self.size_similarity_pass(&candidates, cancel) {
                reporter.on_detect_pass(Strategy::SizeSimilarity, groups.len());
                raw.extend(groups);
            }
        }

        if !cancel.is_cancelled() {
            let partial = self.partial_content_pass(&files, &full_hashes, cancel, &mut warnings)?;
            reporter.on_detect_pass(Strategy::PartialContent, partial.len());
            raw.extend(partial);
        }

        if cancel.is_cancelled() {
            warn!("duplicate detection cancelled, report is partial");
            complete = false;
        }

        let groups = merge_groups(raw);
        info!(
            groups = groups.len(),
            complete, "duplicate detection finished"
        );
        Ok(DuplicateReport {
            groups,
            complete,
            warnings,
        })
    }

    /// Files sharing a byte size are hashed; equal digests form a group.
    fn exact_pass(
        &self,
        files: &[&MirrorFile],
        cancel: &CancelToken,
        reporter: &dyn ProgressReporter,
        warnings: &mut Vec<ScanWarning>,
    ) -> Result<(Vec<RawGroup>, HashMap<PathBuf, String>)> {
        let mut by_size: HashMap<u64, Vec<&MirrorFile>> = HashMap::new();
        for file in files.iter().copied().filter(|f| f.size > 0) {
            by_size.entry(file.size).or_default().push(file);
        }
        let mut to_hash: Vec<PathBuf> = by_size
            .values()
            .filter(|bucket| bucket.len() > 1)
            .flatten()
            .map(|f| f.path.clone())
            .collect();
        to_hash.sort();
        debug!(
            candidates = to_hash.len(),
            buckets = by_size.len(),
            "exact pass size bucketing"
        );

        let mut hashes: HashMap<PathBuf, String> = HashMap::new();
        let total = to_hash.len();
        let pool = bounded_pool(self.config.hash_workers())?;
        pool.install(|| {
            let mut done = 0;
            for batch in to_hash.chunks(HASH_BATCH) {
                if cancel.is_cancelled() {
                    break;
                }
                for (path, result) in self.checksums.checksum_batch(batch, cancel) {
                    done += 1;
                    match result {
                        Ok(hash) => {
                            hashes.insert(path, hash);
                        }
                        Err(Error::Cancelled) => {}
                        Err(e) => warnings.push(ScanWarning::new(&path, e.kind(), e.to_string())),
                    }
                }
                reporter.on_hash_progress(done, total, batch.last().map(PathBuf::as_path));
            }
        });

        let mut buckets: HashMap<(u64, &str), Vec<MirrorFile>> = HashMap::new();
        for file in files {
            if let Some(hash) = hashes.get(&file.path) {
                buckets
                    .entry((file.size, hash.as_str()))
                    .or_default()
                    .push((*file).clone());
            }
        }
        let groups = buckets
            .into_values()
            .filter(|members| members.len() > 1)
            .map(|members| RawGroup {
                members,
                strategy: Strategy::ExactChecksum,
                confidence: 1.0,
            })
            .collect();
        Ok((groups, hashes))
    }

    fn fuzzy_name_pass(&self, candidates: &[Candidate], cancel: &CancelToken) -> Option<Vec<RawGroup>> {
        let threshold = self.config.fuzzy_duplicate_threshold;
        let mut groups = Vec::new();
        for (i, a) in candidates.iter().enumerate() {
            if cancel.is_cancelled() {
                return None;
            }
            if a.tokens.is_empty() {
                continue;
            }
            for b in &candidates[i + 1..] {
                if b.tokens.is_empty() || a.episode != b.episode {
                    continue;
                }
                let sim = normalize::jaccard(&a.tokens, &b.tokens);
                if sim < threshold {
                    continue;
                }
                let confidence = if threshold >= 1.0 {
                    1.0
                } else {
                    0.7 + 0.3 * (sim - threshold) / (1.0 - threshold)
                };
                groups.push(pair(a.file, b.file, Strategy::FuzzyName, confidence));
            }
        }
        Some(groups)
    }

    fn size_similarity_pass(
        &self,
        candidates: &[Candidate],
        cancel: &CancelToken,
    ) -> Option<Vec<RawGroup>> {
        let tolerance = self.config.size_duplicate_tolerance;
        let mut sorted: Vec<&Candidate> = candidates.iter().filter(|c| c.file.size > 0).collect();
        sorted.sort_by(|a, b| a.file.size.cmp(&b.file.size).then_with(|| a.file.path.cmp(&b.file.path)));

        let mut groups = Vec::new();
        for (i, a) in sorted.iter().enumerate() {
            if cancel.is_cancelled() {
                return None;
            }
            for b in &sorted[i + 1..] {
                let delta = (b.file.size - a.file.size) as f64 / b.file.size as f64;
                if delta > tolerance {
                    break;
                }
                if a.file.kind != b.file.kind
                    || a.episode != b.episode
                    || a.tokens.is_disjoint(&b.tokens)
                {
                    continue;
                }
                let confidence = if tolerance > 0.0 {
                    0.7 - 0.2 * (delta / tolerance)
                } else {
                    0.7
                };
                groups.push(pair(a.file, b.file, Strategy::SizeSimilarity, confidence));
            }
        }
        Some(groups)
    }

    /// Large files whose sampled windows agree but whose full digests were not
    /// shown equal by the exact pass. Sizes may differ, within
    /// [`PARTIAL_MIN_SIZE_RATIO`].
    fn partial_content_pass(
        &self,
        files: &[&MirrorFile],
        full_hashes: &HashMap<PathBuf, String>,
        cancel: &CancelToken,
        warnings: &mut Vec<ScanWarning>,
    ) -> Result<Vec<RawGroup>> {
        let min_size = self.config.partial_min_size.max(1);
        let sample = self.config.sample_size;
        let large: Vec<&MirrorFile> = files.iter().copied().filter(|f| f.size >= min_size).collect();
        if large.len() < 2 {
            return Ok(Vec::new());
        }

        let pool = bounded_pool(self.config.hash_workers())?;
        let fingerprints: Vec<(&MirrorFile, Result<String>)> = pool.install(|| {
            large
                .par_iter()
                .map(|f| {
                    if cancel.is_cancelled() {
                        return (*f, Err(Error::Cancelled));
                    }
                    (*f, self.checksums.sample_fingerprint(&f.path, f.size, sample))
                })
                .collect()
        });

        let mut buckets: HashMap<String, Vec<&MirrorFile>> = HashMap::new();
        for (file, result) in fingerprints {
            match result {
                Ok(fp) => buckets.entry(fp).or_default().push(file),
                Err(Error::Cancelled) => {}
                Err(e) => warnings.push(ScanWarning::new(&file.path, e.kind(), e.to_string())),
            }
        }

        let mut groups = Vec::new();
        for mut members in buckets.into_values().filter(|m| m.len() > 1) {
            members.sort_by(|a, b| a.size.cmp(&b.size).then_with(|| a.path.cmp(&b.path)));
            for (i, a) in members.iter().enumerate() {
                for b in &members[i + 1..] {
                    let ratio = a.size as f64 / b.size.max(1) as f64;
                    if ratio < PARTIAL_MIN_SIZE_RATIO {
                        continue;
                    }
                    let identical = matches!(
                        (full_hashes.get(&a.path), full_hashes.get(&b.path)),
                        (Some(x), Some(y)) if x == y
                    );
                    if identical {
                        continue;
                    }
                    groups.push(pair(a, b, Strategy::PartialContent, 0.4 + 0.2 * ratio));
                }
            }
        }
        debug!(groups = groups.len(), sampled = large.len(), "partial content pass");
        Ok(groups)
    }
}

fn file_tokens(file: &MirrorFile) -> TokenSet {
    let mut tokens = normalize::normalize(file.file_name());
    if normalize::parse_episode(&file.path).is_some() {
        tokens.extend(normalize::show_tokens(&file.path));
    }
    tokens
}

fn pair(a: &MirrorFile, b: &MirrorFile, strategy: Strategy, confidence: f64) -> RawGroup {
    RawGroup {
        members: vec![a.clone(), b.clone()],
        strategy,
        confidence,
    }
}

/// Convenience for callers that only hold paths.
pub fn group_containing<'g>(groups: &'g [DuplicateGroup], path: &Path) -> Option<&'g DuplicateGroup> {
    groups
        .iter()
        .find(|g| g.members.iter().any(|m| m.path == path))
}
