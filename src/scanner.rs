use std::collections::HashSet;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

use globset::GlobSet;
use rayon::prelude::*;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::cancel::CancelToken;
use crate::catalog::{Catalog, CatalogMatcher, MatchOutcome};
use crate::checksum::ChecksumService;
use crate::config::Config;
use crate::error::{Error, ErrorKind, Result};
use crate::health::{ChecksumEvidence, FileFacts, classify};
use crate::inventory::{Inventory, ScanStatus};
use crate::normalize;
use crate::progress::ProgressReporter;
use crate::types::{HealthState, MirrorFile, ScanWarning};
use crate::utils::{bounded_pool, build_globset, mtime_secs};

/// One independently scanned piece of the tree: the root's own files, or one
/// top-level subdirectory.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
enum WorkUnit {
    RootFiles(PathBuf),
    Subtree(PathBuf),
}

impl WorkUnit {
    fn path(&self) -> &Path {
        match self {
            WorkUnit::RootFiles(p) | WorkUnit::Subtree(p) => p,
        }
    }
}

struct UnitResult {
    unit: PathBuf,
    files: Vec<(PathBuf, MirrorFile)>,
    warnings: Vec<ScanWarning>,
}

pub struct MirrorScanner<'a> {
    config: &'a Config,
    catalog: &'a Catalog,
    matcher: CatalogMatcher<'a>,
    checksums: &'a ChecksumService,
    extensions: HashSet<String>,
    excludes: Option<GlobSet>,
}

impl<'a> MirrorScanner<'a> {
    pub fn new(
        config: &'a Config,
        catalog: &'a Catalog,
        checksums: &'a ChecksumService,
    ) -> Result<Self> {
        Ok(Self {
            config,
            catalog,
            matcher: CatalogMatcher::new(catalog, config.match_options()),
            checksums,
            extensions: config.extension_set(),
            excludes: build_globset(&config.exclude)?,
        })
    }

    /// Walk `root` and classify every media file below it.
    ///
    /// Per-file problems become warnings on the inventory. Only a missing or
    /// non-directory root is an error. After cancellation the inventory holds
    /// exactly the work units that finished and is marked cancelled.
    pub fn scan(
        &self,
        root: &Path,
        cancel: &CancelToken,
        reporter: &dyn ProgressReporter,
    ) -> Result<Inventory> {
        let meta = fs::metadata(root).map_err(|e| Error::io(root, e))?;
        if !meta.is_dir() {
            return Err(Error::NotADirectory(root.to_path_buf()));
        }

        let (units, mut warnings) = self.plan_units(root)?;
        info!(root = %root.display(), units = units.len(), "scanning mirror");
        reporter.on_scan_start(root, units.len());

        let threads = self.config.scan_workers();
        let results: Vec<Option<UnitResult>> = if threads == 1 {
            units
                .iter()
                .map(|unit| self.scan_unit(root, unit, cancel, reporter))
                .collect()
        } else {
            let pool = bounded_pool(threads)?;
            pool.install(|| {
                units
                    .par_iter()
                    .map(|unit| self.scan_unit(root, unit, cancel, reporter))
                    .collect()
            })
        };

        let mut status = ScanStatus::Complete;
        let mut completed = Vec::new();
        let mut collected = Vec::new();
        for result in results {
            match result {
                Some(unit) => {
                    completed.push(unit.unit);
                    collected.extend(unit.files);
                    warnings.extend(unit.warnings);
                }
                None => status = ScanStatus::Cancelled,
            }
        }

        // A file reachable through several links is kept once, under its
        // lexicographically first path.
        collected.sort_by(|a, b| a.1.path.cmp(&b.1.path));
        let mut seen = HashSet::new();
        let files: Vec<MirrorFile> = collected
            .into_iter()
            .filter(|(canonical, _)| seen.insert(canonical.clone()))
            .map(|(_, file)| file)
            .collect();

        let inventory = Inventory::new(root.to_path_buf(), files, warnings, status, completed);
        if inventory.is_complete() {
            info!(
                files = inventory.len(),
                warnings = inventory.warnings.len(),
                "scan complete"
            );
        } else {
            warn!(
                files = inventory.len(),
                units = inventory.completed_subtrees.len(),
                "scan cancelled, inventory is partial"
            );
        }
        reporter.on_scan_complete(&inventory);
        Ok(inventory)
    }

    fn plan_units(&self, root: &Path) -> Result<(Vec<WorkUnit>, Vec<ScanWarning>)> {
        let mut units = vec![WorkUnit::RootFiles(root.to_path_buf())];
        let mut warnings = Vec::new();

        let entries = fs::read_dir(root).map_err(|e| Error::io(root, e))?;
        for entry in entries {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warnings.push(io_warning(root, &e));
                    continue;
                }
            };
            let path = entry.path();
            if self.is_excluded(root, &path) {
                continue;
            }
            // Follows symlinks, so linked directories become their own unit.
            if path.is_dir() {
                units.push(WorkUnit::Subtree(path));
            }
        }
        units.sort();
        Ok((units, warnings))
    }

    fn is_excluded(&self, root: &Path, path: &Path) -> bool {
        let Some(excludes) = &self.excludes else {
            return false;
        };
        let relative = path.strip_prefix(root).unwrap_or(path);
        excludes.is_match(relative)
    }

    fn scan_unit(
        &self,
        root: &Path,
        unit: &WorkUnit,
        cancel: &CancelToken,
        reporter: &dyn ProgressReporter,
    ) -> Option<UnitResult> {
        if cancel.is_cancelled() {
            return None;
        }

        let mut walker = WalkDir::new(unit.path())
            .follow_links(true)
            .sort_by_file_name();
        walker = match unit {
            WorkUnit::RootFiles(_) => walker.min_depth(1).max_depth(1),
            WorkUnit::Subtree(_) => walker.min_depth(1),
        };

        let mut files = Vec::new();
        let mut warnings = Vec::new();
        let iter = walker
            .into_iter()
            .filter_entry(|e| !self.is_excluded(root, e.path()));

        for entry in iter {
            if cancel.is_cancelled() {
                debug!(unit = %unit.path().display(), "discarding interrupted unit");
                return None;
            }
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    warnings.push(walk_warning(unit.path(), &err));
                    continue;
                }
            };
            if !entry.file_type().is_file() || !self.is_media(entry.path()) {
                continue;
            }

            match self.inspect(root, entry.path()) {
                Ok((canonical, file, raised)) => {
                    reporter.on_file_scanned(&file);
                    warnings.extend(raised);
                    files.push((canonical, file));
                }
                Err(warning) => warnings.push(warning),
            }
        }

        reporter.on_subtree_complete(unit.path(), files.len());
        Some(UnitResult {
            unit: unit.path().to_path_buf(),
            files,
            warnings,
        })
    }

    fn is_media(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| self.extensions.contains(&e.to_ascii_lowercase()))
    }

    /// Build the record for one file, with every warning it raised. A file
    /// that cannot even be stat'ed is skipped with a warning; one that cannot
    /// be read is kept as Unknown.
    #[allow(clippy::type_complexity)]
    fn inspect(
        &self,
        root: &Path,
        path: &Path,
    ) -> std::result::Result<(PathBuf, MirrorFile, Vec<ScanWarning>), ScanWarning> {
        let meta = fs::metadata(path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => {
                ScanWarning::new(path, ErrorKind::NotFound, "vanished during scan")
            }
            _ => io_warning(path, &e),
        })?;
        let canonical = fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
        let size = meta.len();
        let mtime = mtime_secs(&meta);
        let mut warnings = Vec::new();
        let mut note = None;

        let mut read_failed = false;
        if let Err(e) = File::open(path) {
            read_failed = true;
            note = Some(format!("unreadable: {e}"));
            warnings.push(io_warning(path, &e));
        }

        let outcome = self.matcher.match_file(path, size);
        let (catalog_match, ambiguous) = match outcome {
            MatchOutcome::Matched(m) => (Some(m), false),
            MatchOutcome::Ambiguous { candidates } => {
                let err = Error::AmbiguousMatch {
                    path: path.to_path_buf(),
                    candidates,
                };
                note = Some(err.to_string());
                warnings.push(ScanWarning::new(path, err.kind(), err.to_string()));
                (None, true)
            }
            MatchOutcome::Unmatched => (None, false),
        };
        let entry = catalog_match
            .as_ref()
            .and_then(|m| self.catalog.get(&m.source_path));

        let mut checksum = None;
        if self.config.verify && !read_failed {
            match self.checksums.checksum(path) {
                Ok(hash) => checksum = Some(hash),
                Err(e) => {
                    read_failed = true;
                    note = Some(e.to_string());
                    warnings.push(ScanWarning::new(path, e.kind(), e.to_string()));
                }
            }
        }

        let facts = FileFacts {
            size,
            mtime,
            read_failed,
        };
        let evidence = ChecksumEvidence {
            computed: checksum.as_deref(),
            baseline: self.checksums.cache().baseline(path),
        };
        let health = classify(&facts, entry, &evidence);
        if health == HealthState::Modified && note.is_none() {
            note = Some("changed since last known-good checksum".to_string());
        }

        let kind = entry
            .map(|e| e.kind)
            .unwrap_or_else(|| normalize::classify_kind(path));

        let file = MirrorFile {
            path: path.to_path_buf(),
            relative: path.strip_prefix(root).unwrap_or(path).to_path_buf(),
            size,
            modified: mtime,
            extension: path
                .extension()
                .and_then(|e| e.to_str())
                .map(|e| e.to_ascii_lowercase())
                .unwrap_or_default(),
            kind,
            checksum,
            catalog_match,
            ambiguous,
            health,
            note,
        };
        Ok((canonical, file, warnings))
    }
}

fn io_warning(path: &Path, err: &io::Error) -> ScanWarning {
    let kind = match err.kind() {
        io::ErrorKind::NotFound => ErrorKind::NotFound,
        io::ErrorKind::PermissionDenied => ErrorKind::PermissionDenied,
        _ => ErrorKind::IoFailure,
    };
    ScanWarning::new(path, kind, err.to_string())
}

fn walk_warning(unit: &Path, err: &walkdir::Error) -> ScanWarning {
    let path = err.path().unwrap_or(unit);
    if let Some(ancestor) = err.loop_ancestor() {
        return ScanWarning::new(
            path,
            ErrorKind::SymlinkCycle,
            format!("symlink loops back to {}", ancestor.display()),
        );
    }
    match err.io_error() {
        Some(io_err) => io_warning(path, io_err),
        None => ScanWarning::new(path, ErrorKind::IoFailure, err.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::ChecksumCache;
    use crate::progress::SilentReporter;
    use crate::types::{CatalogEntry, ChecksumAlgorithm, MediaKind};
    use std::sync::Arc;
    use tempfile::tempdir;

    fn service() -> ChecksumService {
        ChecksumService::new(
            Arc::new(ChecksumCache::in_memory(ChecksumAlgorithm::Sha256)),
            ChecksumAlgorithm::Sha256,
        )
    }

    #[test]
    fn missing_root_is_fatal() {
        let dir = tempdir().unwrap();
        let config = Config::default();
        let catalog = Catalog::default();
        let svc = service();
        let scanner = MirrorScanner::new(&config, &catalog, &svc).unwrap();
        let err = scanner
            .scan(&dir.path().join("nope"), &CancelToken::new(), &SilentReporter)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);

        let file = dir.path().join("file.mkv");
        fs::write(&file, b"x").unwrap();
        let err = scanner
            .scan(&file, &CancelToken::new(), &SilentReporter)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotADirectory);
    }

    #[test]
    fn filters_extensions_and_excludes() {
        let dir = tempdir().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("Movies/Sample")).unwrap();
        fs::write(root.join("Movies/Heat.1995.mkv"), b"heat").unwrap();
        fs::write(root.join("Movies/Heat.1995.nfo"), b"info").unwrap();
        fs::write(root.join("Movies/Sample/heat-sample.mkv"), b"s").unwrap();
        fs::write(root.join("loose.MP4"), b"loose").unwrap();

        let config = Config {
            exclude: vec!["**/Sample".into()],
            ..Config::default()
        };
        let catalog = Catalog::new(vec![CatalogEntry::movie("Heat (1995)", 4, "/lib/heat.mkv")]);
        let svc = service();
        let scanner = MirrorScanner::new(&config, &catalog, &svc).unwrap();
        let inv = scanner
            .scan(root, &CancelToken::new(), &SilentReporter)
            .unwrap();

        let rel: Vec<_> = inv.files.iter().map(|f| f.relative.clone()).collect();
        assert_eq!(
            rel,
            vec![PathBuf::from("Movies/Heat.1995.mkv"), PathBuf::from("loose.MP4")]
        );
        let heat = &inv.files[0];
        assert_eq!(heat.health, HealthState::Complete);
        assert_eq!(heat.kind, MediaKind::Movie);
        assert_eq!(inv.files[1].health, HealthState::Orphaned);
        assert!(inv.is_complete());
        assert_eq!(inv.completed_subtrees.len(), 2);
    }

    #[cfg(unix)]
    #[test]
    fn symlink_cycles_are_warnings() {
        let dir = tempdir().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("Shows/Loop")).unwrap();
        fs::write(root.join("Shows/a.mkv"), b"a").unwrap();
        std::os::unix::fs::symlink(root.join("Shows"), root.join("Shows/Loop/back")).unwrap();

        let config = Config::default();
        let catalog = Catalog::default();
        let svc = service();
        let scanner = MirrorScanner::new(&config, &catalog, &svc).unwrap();
        let inv = scanner
            .scan(root, &CancelToken::new(), &SilentReporter)
            .unwrap();

        assert_eq!(inv.files.len(), 1);
        assert!(
            inv.warnings
                .iter()
                .any(|w| w.kind == ErrorKind::SymlinkCycle)
        );
    }

    #[test]
    fn ambiguous_matches_are_flagged() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("Halloween.2018.mkv"), b"0123456789").unwrap();

        let config = Config::default();
        let catalog = Catalog::new(vec![
            CatalogEntry::movie("Halloween (2018)", 100, "/lib/a.mkv"),
            CatalogEntry::movie("Halloween 2018", 200, "/lib/b.mkv"),
        ]);
        let svc = service();
        let scanner = MirrorScanner::new(&config, &catalog, &svc).unwrap();
        let inv = scanner
            .scan(dir.path(), &CancelToken::new(), &SilentReporter)
            .unwrap();

        let file = &inv.files[0];
        assert!(file.ambiguous);
        assert_eq!(file.health, HealthState::Orphaned);
        assert_eq!(inv.counters.ambiguous, 1);
        assert_eq!(inv.warnings[0].kind, ErrorKind::AmbiguousMatch);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn ambiguous_and_failed_verify_warnings_are_both_kept() {
        // Opening a directory succeeds but reading it does not.
        let dir = tempdir().unwrap();
        let path = dir.path().join("Halloween.2018.mkv");
        fs::create_dir(&path).unwrap();

        let config = Config {
            verify: true,
            ..Config::default()
        };
        let catalog = Catalog::new(vec![
            CatalogEntry::movie("Halloween (2018)", 100, "/lib/a.mkv"),
            CatalogEntry::movie("Halloween 2018", 200, "/lib/b.mkv"),
        ]);
        let svc = service();
        let scanner = MirrorScanner::new(&config, &catalog, &svc).unwrap();
        let (_, file, warnings) = scanner.inspect(dir.path(), &path).unwrap();

        assert!(file.ambiguous);
        assert_eq!(file.health, HealthState::Unknown);
        assert!(file.checksum.is_none());
        let kinds: Vec<ErrorKind> = warnings.iter().map(|w| w.kind).collect();
        assert_eq!(kinds, vec![ErrorKind::AmbiguousMatch, ErrorKind::IoFailure]);
    }
}
