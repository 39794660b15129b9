use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tempfile::tempdir;

use mirror_recon::cache::ChecksumCache;
use mirror_recon::cancel::CancelToken;
use mirror_recon::catalog::Catalog;
use mirror_recon::checksum::ChecksumService;
use mirror_recon::config::Config;
use mirror_recon::error::ErrorKind;
use mirror_recon::inventory::{Inventory, ScanStatus};
use mirror_recon::progress::{ProgressReporter, SilentReporter};
use mirror_recon::scanner::MirrorScanner;
use mirror_recon::types::{
    CatalogEntry, ChecksumAlgorithm, HealthState, MatchTier, MediaKind, MirrorFile,
};

const MEAN_GIRLS_SIZE: u64 = 1_400_000_000;

fn sparse_file(path: &Path, len: u64) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    File::create(path).unwrap().set_len(len).unwrap();
}

fn mean_girls_catalog() -> Catalog {
    Catalog::new(vec![CatalogEntry::movie(
        "Mean Girls (2004)",
        MEAN_GIRLS_SIZE,
        "/library/Movies/Mean Girls (2004)/Mean Girls (2004).mkv",
    )])
}

fn scan_with(config: &Config, catalog: &Catalog, checksums: &ChecksumService, root: &Path) -> Inventory {
    MirrorScanner::new(config, catalog, checksums)
        .unwrap()
        .scan(root, &CancelToken::new(), &SilentReporter)
        .unwrap()
}

fn in_memory_service() -> ChecksumService {
    ChecksumService::new(
        Arc::new(ChecksumCache::in_memory(ChecksumAlgorithm::Sha256)),
        ChecksumAlgorithm::Sha256,
    )
}

#[test]
fn full_size_release_is_complete_and_truncated_copy_is_partial() {
    let dir = tempdir().unwrap();
    let root = dir.path();
    let file = root.join("Movies/Mean.Girls.2004.BluRay.720p.mkv");
    sparse_file(&file, MEAN_GIRLS_SIZE);

    let config = Config::default();
    let catalog = mean_girls_catalog();
    let svc = in_memory_service();

    let inv = scan_with(&config, &catalog, &svc, root);
    let entry = &inv.files[0];
    let matched = entry.catalog_match.as_ref().unwrap();
    assert!(matches!(matched.tier, MatchTier::Exact | MatchTier::Size));
    assert_eq!(entry.health, HealthState::Complete);
    assert_eq!(entry.kind, MediaKind::Movie);

    File::options()
        .write(true)
        .open(&file)
        .unwrap()
        .set_len(700_000_000)
        .unwrap();
    let inv = scan_with(&config, &catalog, &svc, root);
    assert_eq!(inv.files[0].health, HealthState::Partial);
    assert_eq!(inv.counters.health(HealthState::Partial).count, 1);
}

#[test]
fn rescanning_an_unchanged_tree_is_idempotent() {
    let dir = tempdir().unwrap();
    let root = dir.path();
    sparse_file(&root.join("Movies/Mean.Girls.2004.BluRay.720p.mkv"), MEAN_GIRLS_SIZE);
    sparse_file(&root.join("Movies/Unrelated.Home.Video.mkv"), 1024);
    sparse_file(&root.join("TV/Some Show/Season 01/Some.Show.S01E01.mkv"), 2048);
    fs::write(root.join("loose.avi"), b"loose").unwrap();

    let config = Config {
        scan_threads: 4,
        ..Config::default()
    };
    let catalog = mean_girls_catalog();
    let svc = in_memory_service();

    let first = scan_with(&config, &catalog, &svc, root);
    let second = scan_with(&config, &catalog, &svc, root);

    assert_eq!(first.files, second.files);
    assert_eq!(first.counters, second.counters);
    assert_eq!(first.completed_subtrees, second.completed_subtrees);
    let paths: Vec<&PathBuf> = first.files.iter().map(|f| &f.path).collect();
    let mut sorted = paths.clone();
    sorted.sort();
    assert_eq!(paths, sorted);
    assert_eq!(first.counters.kind(MediaKind::Episode).count, 1);
}

struct CancelAfterFirstUnit {
    token: CancelToken,
}

impl ProgressReporter for CancelAfterFirstUnit {
    fn on_subtree_complete(&self, _subtree: &Path, _files: usize) {
        self.token.cancel();
    }
}

#[test]
fn cancelled_scan_returns_only_finished_units() {
    let dir = tempdir().unwrap();
    let root = dir.path();
    fs::write(root.join("top.mkv"), b"top").unwrap();
    fs::create_dir_all(root.join("A")).unwrap();
    fs::create_dir_all(root.join("B")).unwrap();
    fs::write(root.join("A/a.mkv"), b"a").unwrap();
    fs::write(root.join("B/b.mkv"), b"b").unwrap();

    let config = Config {
        scan_threads: 1,
        ..Config::default()
    };
    let catalog = Catalog::default();
    let svc = in_memory_service();
    let token = CancelToken::new();
    let reporter = CancelAfterFirstUnit {
        token: token.clone(),
    };

    let inv = MirrorScanner::new(&config, &catalog, &svc)
        .unwrap()
        .scan(root, &token, &reporter)
        .unwrap();

    assert_eq!(inv.status, ScanStatus::Cancelled);
    assert!(!inv.is_complete());
    assert_eq!(inv.completed_subtrees, vec![root.to_path_buf()]);
    let names: Vec<&str> = inv.files.iter().map(|f| f.file_name()).collect();
    assert_eq!(names, vec!["top.mkv"]);
}

#[test]
fn content_change_after_known_good_run_is_modified() {
    let dir = tempdir().unwrap();
    let root = dir.path().join("mirror");
    let db = dir.path().join("cache.db");
    let file = root.join("Heat.1995.mkv");
    fs::create_dir_all(&root).unwrap();
    fs::write(&file, b"original-bytes").unwrap();
    let old = SystemTime::now() - Duration::from_secs(3600);
    File::options().write(true).open(&file).unwrap().set_modified(old).unwrap();

    let catalog = Catalog::new(vec![CatalogEntry::movie("Heat (1995)", 14, "/lib/Heat (1995).mkv")]);
    let config = Config {
        verify: true,
        ..Config::default()
    };

    {
        let cache = ChecksumCache::open(&db, ChecksumAlgorithm::Sha256).unwrap();
        let svc = ChecksumService::new(Arc::new(cache), ChecksumAlgorithm::Sha256);
        let inv = scan_with(&config, &catalog, &svc, &root);
        assert_eq!(inv.files[0].health, HealthState::Complete);
        assert!(inv.files[0].checksum.is_some());
        svc.cache().save().unwrap();
    }

    fs::write(&file, b"tampered-bytes").unwrap();
    File::options()
        .write(true)
        .open(&file)
        .unwrap()
        .set_modified(SystemTime::now())
        .unwrap();

    let cache = ChecksumCache::open(&db, ChecksumAlgorithm::Sha256).unwrap();
    let svc = ChecksumService::new(Arc::new(cache), ChecksumAlgorithm::Sha256);
    let inv = scan_with(&config, &catalog, &svc, &root);
    assert_eq!(inv.files[0].health, HealthState::Modified);
    assert!(inv.files[0].note.is_some());
}

#[test]
fn catalog_loads_from_json() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("catalog.json");
    fs::write(
        &path,
        r#"[
            {"title": "Mean Girls (2004)", "size": 1400000000, "source_path": "/lib/mg.mkv"},
            {"title": "Pilot", "kind": "episode", "show": "The Office", "season": 1, "episode": 1,
             "size": 300, "source_path": "/lib/office/s01e01.mkv"}
        ]"#,
    )
    .unwrap();
    let catalog = Catalog::from_json_file(&path).unwrap();
    assert_eq!(catalog.len(), 2);
    assert_eq!(
        catalog.get(Path::new("/lib/office/s01e01.mkv")).unwrap().kind,
        MediaKind::Episode
    );
}

struct DeleteSibling {
    after: &'static str,
    victim: PathBuf,
}

impl ProgressReporter for DeleteSibling {
    fn on_file_scanned(&self, file: &MirrorFile) {
        if file.file_name() == self.after {
            fs::remove_file(&self.victim).unwrap();
        }
    }
}

#[test]
fn file_vanishing_mid_scan_is_a_warning() {
    let dir = tempdir().unwrap();
    let root = dir.path();
    fs::create_dir_all(root.join("Movies")).unwrap();
    fs::write(root.join("Movies/a.mkv"), b"a").unwrap();
    fs::write(root.join("Movies/b.mkv"), b"b").unwrap();
    fs::write(root.join("Movies/c.mkv"), b"c").unwrap();

    let config = Config {
        scan_threads: 1,
        ..Config::default()
    };
    let catalog = Catalog::default();
    let svc = in_memory_service();
    let reporter = DeleteSibling {
        after: "a.mkv",
        victim: root.join("Movies/b.mkv"),
    };
    let inv = MirrorScanner::new(&config, &catalog, &svc)
        .unwrap()
        .scan(root, &CancelToken::new(), &reporter)
        .unwrap();

    assert!(inv.is_complete());
    let names: Vec<&str> = inv.files.iter().map(|f| f.file_name()).collect();
    assert_eq!(names, vec!["a.mkv", "c.mkv"]);
    assert_eq!(inv.warnings.len(), 1);
    assert_eq!(inv.warnings[0].kind, ErrorKind::NotFound);
    assert_eq!(inv.warnings[0].path, root.join("Movies/b.mkv"));
}

#[cfg(unix)]
#[test]
fn unreadable_directories_are_skipped_with_warnings() {
    use std::os::unix::fs::{PermissionsExt, symlink};

    let dir = tempdir().unwrap();
    let root = dir.path();
    fs::create_dir_all(root.join("Shows/Locked")).unwrap();
    fs::write(root.join("Shows/Locked/hidden.mkv"), b"h").unwrap();
    fs::write(root.join("Shows/open.mkv"), b"o").unwrap();
    fs::write(root.join("top.mkv"), b"t").unwrap();
    symlink(root.join("nowhere"), root.join("Shows/Dangling")).unwrap();

    let locked = root.join("Shows/Locked");
    fs::set_permissions(&locked, fs::Permissions::from_mode(0o000)).unwrap();
    let enforced = fs::read_dir(&locked).is_err();

    let config = Config::default();
    let catalog = Catalog::default();
    let svc = in_memory_service();
    let inv = MirrorScanner::new(&config, &catalog, &svc)
        .unwrap()
        .scan(root, &CancelToken::new(), &SilentReporter)
        .unwrap();
    fs::set_permissions(&locked, fs::Permissions::from_mode(0o755)).unwrap();

    assert!(inv.is_complete());
    let names: Vec<&str> = inv.files.iter().map(|f| f.file_name()).collect();
    assert!(names.contains(&"open.mkv"));
    assert!(names.contains(&"top.mkv"));
    assert!(
        inv.warnings
            .iter()
            .any(|w| w.path == root.join("Shows/Dangling") && w.kind == ErrorKind::NotFound)
    );
    // Permission bits do not bind a privileged user.
    if enforced {
        assert_eq!(names, vec!["open.mkv", "top.mkv"]);
        assert!(
            inv.warnings
                .iter()
                .any(|w| w.path == locked && w.kind == ErrorKind::PermissionDenied)
        );
    }
}
