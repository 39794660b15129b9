//! Directory integrity manifests: a JSON snapshot of every media file's
//! checksum, and a later re-check against it.

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use globset::GlobSet;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use walkdir::WalkDir;

use crate::cancel::CancelToken;
use crate::checksum::ChecksumService;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::types::ChecksumAlgorithm;
use crate::utils::build_globset;

pub const MANIFEST_VERSION: &str = "1.0";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Manifest {
    pub version: String,
    pub created: DateTime<Utc>,
    pub root: PathBuf,
    pub algorithm: ChecksumAlgorithm,
    /// Root-relative path with `/` separators, to hex digest.
    pub files: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct ManifestReport {
    pub valid: Vec<String>,
    pub corrupted: Vec<String>,
    pub missing: Vec<String>,
    pub unlisted: Vec<String>,
    pub unreadable: Vec<String>,
}

impl ManifestReport {
    pub fn is_clean(&self) -> bool {
        self.corrupted.is_empty() && self.missing.is_empty() && self.unreadable.is_empty()
    }
}

fn relative_key(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let parts: Vec<_> = rel.components().map(|c| c.as_os_str().to_string_lossy()).collect();
    Some(parts.join("/"))
}

/// Media files under `root`, by relative key, honouring the configured
/// extensions and exclude globs.
fn media_files(root: &Path, config: &Config) -> Result<BTreeMap<String, PathBuf>> {
    let meta = fs::metadata(root).map_err(|e| Error::io(root, e))?;
    if !meta.is_dir() {
        return Err(Error::NotADirectory(root.to_path_buf()));
    }
    let extensions = config.extension_set();
    let excludes: Option<GlobSet> = build_globset(&config.exclude)?;

    let mut files = BTreeMap::new();
    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                warn!("skipping unreadable entry: {err}");
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        let Some(key) = relative_key(root, path) else {
            continue;
        };
        if excludes.as_ref().is_some_and(|set| set.is_match(&key)) {
            continue;
        }
        let wanted = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| extensions.contains(&e.to_ascii_lowercase()));
        if wanted {
            files.insert(key, path.to_path_buf());
        }
    }
    Ok(files)
}

impl Manifest {
    pub fn create(root: &Path, checksums: &ChecksumService, config: &Config) -> Result<Self> {
        let files = media_files(root, config)?;
        let paths: Vec<PathBuf> = files.values().cloned().collect();
        let hashed = checksums.checksum_many(&paths, config.hash_workers(), &CancelToken::new())?;
        let mut by_path: BTreeMap<PathBuf, String> = BTreeMap::new();
        for (path, result) in hashed {
            match result {
                Ok(hash) => {
                    by_path.insert(path, hash);
                }
                Err(err) => warn!(path = %path.display(), "left out of manifest: {err}"),
            }
        }

        let entries = files
            .into_iter()
            .filter_map(|(key, path)| by_path.remove(&path).map(|hash| (key, hash)))
            .collect::<BTreeMap<_, _>>();
        info!(root = %root.display(), files = entries.len(), "manifest created");

        Ok(Self {
            version: MANIFEST_VERSION.to_string(),
            created: Utc::now(),
            root: root.to_path_buf(),
            algorithm: checksums.algorithm(),
            files: entries,
        })
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
        }
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json).map_err(|e| Error::io(path, e))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Re-hash `root` and compare against the recorded digests. The service
    /// must use the manifest's algorithm.
    pub fn check(&self, root: &Path, checksums: &ChecksumService, config: &Config) -> Result<ManifestReport> {
        if checksums.algorithm() != self.algorithm {
            return Err(Error::Config(format!(
                "manifest uses {}, checker uses {}",
                self.algorithm.label(),
                checksums.algorithm().label()
            )));
        }
        let on_disk = media_files(root, config)?;
        let mut report = ManifestReport::default();

        let listed: Vec<(&String, &PathBuf)> = on_disk
            .iter()
            .filter(|(key, _)| self.files.contains_key(*key))
            .collect();
        let paths: Vec<PathBuf> = listed.iter().map(|(_, p)| (*p).clone()).collect();
        let hashed: BTreeMap<PathBuf, Result<String>> = checksums
            .checksum_many(&paths, config.hash_workers(), &CancelToken::new())?
            .into_iter()
            .collect();

        for (key, expected) in &self.files {
            let Some(path) = on_disk.get(key) else {
                report.missing.push(key.clone());
                continue;
            };
            match hashed.get(path) {
                Some(Ok(actual)) if actual.eq_ignore_ascii_case(expected) => report.valid.push(key.clone()),
                Some(Ok(_)) => report.corrupted.push(key.clone()),
                Some(Err(err)) => {
                    warn!(path = %path.display(), "could not verify: {err}");
                    report.unreadable.push(key.clone());
                }
                None => report.unreadable.push(key.clone()),
            }
        }

        let listed_keys: HashSet<&String> = self.files.keys().collect();
        report.unlisted = on_disk
            .keys()
            .filter(|key| !listed_keys.contains(key))
            .cloned()
            .collect();
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::ChecksumCache;
    use std::sync::Arc;
    use tempfile::tempdir;

    fn service(algorithm: ChecksumAlgorithm) -> ChecksumService {
        ChecksumService::new(Arc::new(ChecksumCache::in_memory(algorithm)), algorithm)
    }

    #[test]
    fn create_lists_media_with_forward_slashes() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("Show/Season 01")).unwrap();
        fs::write(dir.path().join("Show/Season 01/e01.mkv"), b"one").unwrap();
        fs::write(dir.path().join("notes.txt"), b"skip").unwrap();

        let manifest = Manifest::create(dir.path(), &service(ChecksumAlgorithm::Md5), &Config::default()).unwrap();
        assert_eq!(manifest.files.len(), 1);
        assert!(manifest.files.contains_key("Show/Season 01/e01.mkv"));
        assert_eq!(manifest.algorithm, ChecksumAlgorithm::Md5);
    }

    #[test]
    fn check_sorts_files_into_buckets() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("mirror");
        fs::create_dir_all(&root).unwrap();
        fs::write(root.join("keep.mkv"), b"same").unwrap();
        fs::write(root.join("rot.mkv"), b"before").unwrap();
        fs::write(root.join("gone.mkv"), b"bye").unwrap();

        let config = Config::default();
        let manifest = Manifest::create(&root, &service(ChecksumAlgorithm::Sha256), &config).unwrap();
        let saved = dir.path().join("manifest.json");
        manifest.save(&saved).unwrap();

        fs::write(root.join("rot.mkv"), b"after!").unwrap();
        fs::remove_file(root.join("gone.mkv")).unwrap();
        fs::write(root.join("new.mkv"), b"fresh").unwrap();

        let loaded = Manifest::load(&saved).unwrap();
        let report = loaded.check(&root, &service(ChecksumAlgorithm::Sha256), &config).unwrap();
        assert_eq!(report.valid, vec!["keep.mkv".to_string()]);
        assert_eq!(report.corrupted, vec!["rot.mkv".to_string()]);
        assert_eq!(report.missing, vec!["gone.mkv".to_string()]);
        assert_eq!(report.unlisted, vec!["new.mkv".to_string()]);
        assert!(!report.is_clean());
    }

    #[test]
    fn algorithm_mismatch_is_a_config_error() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("a.mkv"), b"x").unwrap();
        let config = Config::default();
        let manifest = Manifest::create(dir.path(), &service(ChecksumAlgorithm::Crc32), &config).unwrap();
        let err = manifest
            .check(dir.path(), &service(ChecksumAlgorithm::Sha1), &config)
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
