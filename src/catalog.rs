use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{Error, Result};
use crate::normalize::{self, EpisodeNumber, TokenSet};
use crate::types::{CatalogEntry, CatalogMatch, MatchTier};

/// Read-only view of the remote library. Entries are keyed by their source
/// path, which is what a `CatalogMatch` points back to.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    entries: Vec<CatalogEntry>,
    by_source: HashMap<PathBuf, usize>,
}

impl Catalog {
    pub fn new(entries: Vec<CatalogEntry>) -> Self {
        let by_source = entries
            .iter()
            .enumerate()
            .map(|(idx, e)| (e.source_path.clone(), idx))
            .collect();
        Self { entries, by_source }
    }

    /// Load a JSON array of catalog entries.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
        let entries: Vec<CatalogEntry> = serde_json::from_str(&text)
            .map_err(|e| Error::Catalog(format!("{}: {e}", path.display())))?;
        debug!(entries = entries.len(), path = %path.display(), "loaded catalog");
        Ok(Self::new(entries))
    }

    pub fn get(&self, source_path: &Path) -> Option<&CatalogEntry> {
        self.by_source.get(source_path).map(|&idx| &self.entries[idx])
    }

    pub fn entries(&self) -> &[CatalogEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MatchOptions {
    /// Relative size difference accepted by the size tier.
    pub size_tolerance: f64,
    /// Jaccard similarity the fuzzy tier must exceed.
    pub fuzzy_threshold: f64,
}

impl Default for MatchOptions {
    fn default() -> Self {
        Self {
            size_tolerance: 0.01,
            fuzzy_threshold: 0.6,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum MatchOutcome {
    Matched(CatalogMatch),
    /// Several entries are equally good exact matches; left for the caller.
    Ambiguous { candidates: Vec<PathBuf> },
    Unmatched,
}

struct EntryKeys {
    /// Title tokens, plus show and show+title for episodes.
    keys: Vec<TokenSet>,
    episode: Option<EpisodeNumber>,
}

/// Tiered resolution of mirror files back to catalog entries: exact token
/// match, then a unique size match, then the best fuzzy token similarity.
pub struct CatalogMatcher<'a> {
    catalog: &'a Catalog,
    options: MatchOptions,
    keys: Vec<EntryKeys>,
    exact: HashMap<TokenSet, Vec<usize>>,
}

impl<'a> CatalogMatcher<'a> {
    pub fn new(catalog: &'a Catalog, options: MatchOptions) -> Self {
        let mut keys = Vec::with_capacity(catalog.len());
        let mut exact: HashMap<TokenSet, Vec<usize>> = HashMap::new();

        for (idx, entry) in catalog.entries().iter().enumerate() {
            let title = normalize::normalize(&entry.title);
            let mut entry_keys = vec![title.clone()];
            if let Some(show) = entry.show.as_deref() {
                let show = normalize::normalize(show);
                let combined: TokenSet = show.union(&title).cloned().collect();
                entry_keys.push(show);
                entry_keys.push(combined);
            }
            entry_keys.retain(|k| !k.is_empty());
            entry_keys.sort();
            entry_keys.dedup();

            for key in &entry_keys {
                exact.entry(key.clone()).or_default().push(idx);
            }
            keys.push(EntryKeys {
                keys: entry_keys,
                episode: entry
                    .episode_number()
                    .map(|(season, episode)| EpisodeNumber { season, episode }),
            });
        }

        Self {
            catalog,
            options,
            keys,
            exact,
        }
    }

    pub fn match_file(&self, path: &Path, size: u64) -> MatchOutcome {
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default();
        let episode = normalize::parse_episode(path);

        let name_tokens = normalize::normalize(file_name);
        let mut file_keys = vec![name_tokens.clone()];
        if episode.is_some() {
            let show = normalize::show_tokens(path);
            file_keys.push(show.union(&name_tokens).cloned().collect());
            file_keys.push(show);
        }
        file_keys.retain(|k| !k.is_empty());

        let pool: Vec<usize> = (0..self.keys.len())
            .filter(|&idx| self.compatible(idx, episode))
            .collect();

        // Tier 1: exact token-set equality.
        let exact: BTreeSet<usize> = file_keys
            .iter()
            .filter_map(|k| self.exact.get(k))
            .flatten()
            .copied()
            .filter(|&idx| self.compatible(idx, episode))
            .collect();

        match exact.len() {
            0 => {}
            1 => {
                if let Some(&idx) = exact.first() {
                    return self.matched(idx, MatchTier::Exact, 1.0);
                }
            }
            _ => {
                let within: Vec<usize> = exact
                    .iter()
                    .copied()
                    .filter(|&idx| self.within_tolerance(idx, size))
                    .collect();
                if let [idx] = within.as_slice() {
                    let score = size_similarity(size, self.entry(*idx).size);
                    return self.matched(*idx, MatchTier::Size, score);
                }
                let candidates = exact
                    .iter()
                    .map(|&idx| self.entry(idx).source_path.clone())
                    .collect();
                debug!(path = %path.display(), "ambiguous exact catalog match");
                return MatchOutcome::Ambiguous { candidates };
            }
        }

        // Tier 2: a single entry of nearly the same size.
        let within: Vec<usize> = pool
            .iter()
            .copied()
            .filter(|&idx| self.within_tolerance(idx, size))
            .collect();
        if let [idx] = within.as_slice() {
            let score = size_similarity(size, self.entry(*idx).size);
            return self.matched(*idx, MatchTier::Size, score);
        }

        // Tier 3: best Jaccard similarity above the threshold.
        let mut best: Option<(f64, f64, usize)> = None;
        for &idx in &pool {
            let sim = file_keys
                .iter()
                .flat_map(|fk| self.keys[idx].keys.iter().map(move |ek| normalize::jaccard(fk, ek)))
                .fold(0.0_f64, f64::max);
            if sim <= self.options.fuzzy_threshold {
                continue;
            }
            let size_sim = size_similarity(size, self.entry(idx).size);
            let better = match best {
                None => true,
                Some((best_sim, best_size, best_idx)) => {
                    sim > best_sim
                        || (sim == best_sim && size_sim > best_size)
                        || (sim == best_sim
                            && size_sim == best_size
                            && self.entry(idx).source_path < self.entry(best_idx).source_path)
                }
            };
            if better {
                best = Some((sim, size_sim, idx));
            }
        }

        match best {
            Some((sim, _, idx)) => self.matched(idx, MatchTier::Fuzzy, sim),
            None => MatchOutcome::Unmatched,
        }
    }

    fn entry(&self, idx: usize) -> &CatalogEntry {
        &self.catalog.entries()[idx]
    }

    /// Episode files only pair with the same numbered episode; everything else
    /// never pairs with a numbered episode.
    fn compatible(&self, idx: usize, episode: Option<EpisodeNumber>) -> bool {
        match (episode, self.keys[idx].episode) {
            (Some(file), Some(entry)) => file == entry,
            (Some(_), None) => false,
            (None, Some(_)) => false,
            (None, None) => true,
        }
    }

    fn within_tolerance(&self, idx: usize, size: u64) -> bool {
        let expected = self.entry(idx).size;
        let larger = expected.max(size);
        if larger == 0 {
            return true;
        }
        (expected.abs_diff(size) as f64 / larger as f64) <= self.options.size_tolerance
    }

    fn matched(&self, idx: usize, tier: MatchTier, score: f64) -> MatchOutcome {
        MatchOutcome::Matched(CatalogMatch {
            source_path: self.entry(idx).source_path.clone(),
            tier,
            score,
        })
    }
}

/// Ratio of the smaller to the larger size; 0 when either is empty.
pub fn size_similarity(a: u64, b: u64) -> f64 {
    if a == 0 || b == 0 {
        return 0.0;
    }
    a.min(b) as f64 / a.max(b) as f64
}
