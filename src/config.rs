use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::catalog::MatchOptions;
use crate::cli::{Cli, Command};
use crate::error::{Error, Result};
use crate::types::ChecksumAlgorithm;
use crate::utils::build_globset;

pub const DEFAULT_EXTENSIONS: &[&str] = &["mkv", "mp4", "avi", "mov", "wmv", "flv", "webm", "m4v"];
pub const MAX_SCAN_THREADS: usize = 8;
pub const MAX_HASH_THREADS: usize = 8;

const MIB: u64 = 1024 * 1024;
const GIB: u64 = 1024 * MIB;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub root: Option<PathBuf>,
    pub catalog: Option<PathBuf>,
    pub cache: Option<PathBuf>,
    pub journal: Option<PathBuf>,
    pub extensions: Vec<String>,
    pub exclude: Vec<String>,
    pub algorithm: ChecksumAlgorithm,
    /// Compute checksums during scans.
    pub verify: bool,
    pub size_tolerance: f64,
    pub fuzzy_match_threshold: f64,
    pub fuzzy_duplicate_threshold: f64,
    pub size_duplicate_tolerance: f64,
    /// Bytes per sampled window in the partial-content pass.
    pub sample_size: u64,
    /// Files below this size are left to the exact pass.
    pub partial_min_size: u64,
    pub scan_threads: usize,
    pub hash_threads: usize,
    /// Free space that must remain on a destination after move/copy.
    pub safety_margin: u64,
    pub prune_empty_dirs: bool,
    pub verbose: u8,
    pub quiet: u8,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            root: None,
            catalog: None,
            cache: None,
            journal: None,
            extensions: DEFAULT_EXTENSIONS.iter().map(|e| e.to_string()).collect(),
            exclude: Vec::new(),
            algorithm: ChecksumAlgorithm::Sha256,
            verify: false,
            size_tolerance: 0.01,
            fuzzy_match_threshold: 0.6,
            fuzzy_duplicate_threshold: 0.8,
            size_duplicate_tolerance: 0.05,
            sample_size: MIB,
            partial_min_size: 64 * MIB,
            scan_threads: 4,
            hash_threads: num_cpus::get().clamp(1, MAX_HASH_THREADS),
            safety_margin: GIB,
            prune_empty_dirs: true,
            verbose: 0,
            quiet: 0,
        }
    }
}

impl Config {
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
        let config: Config = serde_json::from_str(&text)
            .map_err(|e| Error::Config(format!("{}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    fn validate_thresholds(&self) -> Result<()> {
        for (name, value) in [
            ("fuzzy-match-threshold", self.fuzzy_match_threshold),
            ("fuzzy-duplicate-threshold", self.fuzzy_duplicate_threshold),
        ] {
            if !(value > 0.0 && value <= 1.0) {
                return Err(Error::Config(format!("{name} must be in (0, 1], got {value}")));
            }
        }
        for (name, value) in [
            ("size-tolerance", self.size_tolerance),
            ("size-duplicate-tolerance", self.size_duplicate_tolerance),
        ] {
            if !(0.0..1.0).contains(&value) {
                return Err(Error::Config(format!("{name} must be in [0, 1), got {value}")));
            }
        }
        Ok(())
    }

    fn validate_threads(&self) -> Result<()> {
        if self.scan_threads == 0 {
            return Err(Error::Config("scan-threads must be at least 1".into()));
        }
        if self.hash_threads == 0 {
            return Err(Error::Config("hash-threads must be at least 1".into()));
        }
        Ok(())
    }

    fn validate_filters(&self) -> Result<()> {
        if self.extensions.iter().all(|e| e.trim().trim_start_matches('.').is_empty()) {
            return Err(Error::Config("at least one media extension is required".into()));
        }
        if self.sample_size == 0 {
            return Err(Error::Config("sample-size must be positive".into()));
        }
        build_globset(&self.exclude)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        self.validate_thresholds()?;
        self.validate_threads()?;
        self.validate_filters()?;
        Ok(())
    }

    /// Lower-cased extensions without the leading dot.
    pub fn extension_set(&self) -> HashSet<String> {
        self.extensions
            .iter()
            .map(|e| e.trim().trim_start_matches('.').to_ascii_lowercase())
            .filter(|e| !e.is_empty())
            .collect()
    }

    pub fn match_options(&self) -> MatchOptions {
        MatchOptions {
            size_tolerance: self.size_tolerance,
            fuzzy_threshold: self.fuzzy_match_threshold,
        }
    }

    pub fn scan_workers(&self) -> usize {
        self.scan_threads.clamp(1, MAX_SCAN_THREADS)
    }

    pub fn hash_workers(&self) -> usize {
        self.hash_threads.clamp(1, MAX_HASH_THREADS)
    }
}

impl TryFrom<Cli> for Config {
    type Error = anyhow::Error;

    fn try_from(cli: Cli) -> std::result::Result<Self, Self::Error> {
        let mut config = match cli.config.as_deref() {
            Some(path) => Config::from_json_file(path)?,
            None => Config::default(),
        };

        if let Some(target) = cli.command.target() {
            if target.root.is_some() {
                config.root = target.root.clone();
            }
            if target.catalog.is_some() {
                config.catalog = target.catalog.clone();
            }
        }
        if let Some(root) = cli.command.manifest_root() {
            config.root = Some(root.clone());
        }
        match &cli.command {
            Command::Scan { verify: true, .. } | Command::Verify { .. } => config.verify = true,
            _ => {}
        }

        if cli.cache.is_some() {
            config.cache = cli.cache;
        }
        if cli.journal.is_some() {
            config.journal = cli.journal;
        }
        if !cli.extensions.is_empty() {
            config.extensions = cli.extensions;
        }
        config.exclude.extend(cli.exclude);
        if let Some(algorithm) = cli.algorithm {
            config.algorithm = algorithm;
        }
        if let Some(n) = cli.scan_threads {
            config.scan_threads = n;
        }
        if let Some(n) = cli.hash_threads {
            config.hash_threads = n;
        }
        config.verbose = cli.verbose;
        config.quiet = cli.quiet;

        config.validate()?;

        Ok(config)
    }
}
