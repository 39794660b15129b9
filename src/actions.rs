//! Sequential delete/move/copy over inventory entries, with pre-flight safety
//! checks and a journal line per attempted item.
//!
//! Deletes are irreversible. A caller that wants trash semantics installs a
//! [`PreDeleteHook`]; when the hook intercepts, the executor leaves the file
//! alone and journals the hook's note instead.

use std::collections::HashMap;
use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::cancel::CancelToken;
use crate::error::{Error, Result};
pub use crate::journal::{ActionKind, Outcome};
use crate::journal::{Journal, OperationRecord};
use crate::progress::ProgressReporter;
use crate::types::MirrorFile;

const COPY_BUFFER: usize = 1 << 20;

#[derive(Debug, Clone)]
pub struct Action {
    pub kind: ActionKind,
    /// The entry as it looked when the user selected it.
    pub source: MirrorFile,
    /// Target file path for move/copy. Ignored for delete.
    pub destination: Option<PathBuf>,
}

impl Action {
    pub fn delete(source: MirrorFile) -> Self {
        Self {
            kind: ActionKind::Delete,
            source,
            destination: None,
        }
    }

    pub fn relocate(kind: ActionKind, source: MirrorFile, destination: PathBuf) -> Self {
        Self {
            kind,
            source,
            destination: Some(destination),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ItemResult {
    pub action: ActionKind,
    pub source: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub destination: Option<PathBuf>,
    pub bytes: u64,
    pub outcome: Outcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl ItemResult {
    pub fn succeeded(&self) -> bool {
        self.outcome.is_success()
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RunningTotals {
    pub completed: usize,
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub bytes_processed: u64,
    pub elapsed: Duration,
}

#[derive(Debug, Clone, Serialize)]
pub struct OperationSummary {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Actions never attempted because the batch was cancelled.
    pub skipped: usize,
    pub bytes_processed: u64,
    pub elapsed: Duration,
    pub items: Vec<ItemResult>,
    pub cancelled: bool,
}

impl OperationSummary {
    pub fn failures(&self) -> impl Iterator<Item = &ItemResult> {
        self.items.iter().filter(|item| !item.succeeded())
    }
}

/// Free-space lookup for a destination directory.
pub trait SpaceProbe: Send + Sync {
    fn available(&self, dir: &Path) -> io::Result<u64>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct DiskSpace;

impl SpaceProbe for DiskSpace {
    fn available(&self, dir: &Path) -> io::Result<u64> {
        fs4::available_space(dir)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeleteDecision {
    Proceed,
    /// The hook has taken care of the file (e.g. moved it to a trash area).
    Intercepted(String),
}

/// Runs before every delete. Lets an outer policy replace deletion.
pub trait PreDeleteHook: Send + Sync {
    fn before_delete(&self, file: &MirrorFile) -> DeleteDecision;
}

pub struct MutationExecutor {
    journal: Journal,
    space: Box<dyn SpaceProbe>,
    pre_delete: Option<Box<dyn PreDeleteHook>>,
    safety_margin: u64,
    prune_empty_dirs: bool,
    root: Option<PathBuf>,
}

impl MutationExecutor {
    pub fn new(journal: Journal) -> Self {
        Self {
            journal,
            space: Box::new(DiskSpace),
            pre_delete: None,
            safety_margin: 0,
            prune_empty_dirs: false,
            root: None,
        }
    }

    pub fn with_space_probe(mut self, probe: impl SpaceProbe + 'static) -> Self {
        self.space = Box::new(probe);
        self
    }

    pub fn with_pre_delete_hook(mut self, hook: impl PreDeleteHook + 'static) -> Self {
        self.pre_delete = Some(Box::new(hook));
        self
    }

    pub fn with_safety_margin(mut self, bytes: u64) -> Self {
        self.safety_margin = bytes;
        self
    }

    pub fn with_prune_empty_dirs(mut self, prune: bool) -> Self {
        self.prune_empty_dirs = prune;
        self
    }

    /// Directories at or above `root` are never pruned.
    pub fn with_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.root = Some(root.into());
        self
    }

    /// Run `actions` in order. Per-item failures land in the summary and the
    /// journal; only a journal write failure stops the batch with an error.
    pub fn execute(
        &mut self,
        actions: &[Action],
        cancel: &CancelToken,
        reporter: &dyn ProgressReporter,
    ) -> Result<OperationSummary> {
        let started = Instant::now();
        let mut preflight = self.reserve_space(actions);
        let mut totals = RunningTotals {
            total: actions.len(),
            ..RunningTotals::default()
        };
        let mut items = Vec::with_capacity(actions.len());
        let mut cancelled = false;

        for (idx, action) in actions.iter().enumerate() {
            if cancel.is_cancelled() {
                cancelled = true;
                info!(remaining = actions.len() - idx, "mutation batch cancelled");
                break;
            }

            let (outcome, destination, detail) = match preflight.remove(&idx) {
                Some(err) => (Outcome::failure(&err), action.destination.clone(), None),
                None => match self.apply(action) {
                    Ok((destination, detail)) => (Outcome::Success, destination, detail),
                    Err(err) => (Outcome::failure(&err), action.destination.clone(), None),
                },
            };

            let item = ItemResult {
                action: action.kind,
                source: action.source.path.clone(),
                destination,
                bytes: action.source.size,
                outcome,
                detail,
            };
            self.journal.append(&OperationRecord {
                timestamp: Utc::now(),
                action: item.action,
                source: item.source.clone(),
                destination: item.destination.clone(),
                bytes: item.bytes,
                outcome: item.outcome.clone(),
                detail: item.detail.clone(),
            })?;

            totals.completed += 1;
            if item.succeeded() {
                totals.succeeded += 1;
                totals.bytes_processed += item.bytes;
                debug!(action = item.action.label(), path = %item.source.display(), "done");
            } else {
                totals.failed += 1;
                if let Outcome::Failure { reason, .. } = &item.outcome {
                    warn!(action = item.action.label(), path = %item.source.display(), "{reason}");
                }
            }
            totals.elapsed = started.elapsed();
            reporter.on_action_complete(&item, &totals);
            items.push(item);
        }

        let summary = OperationSummary {
            total: actions.len(),
            succeeded: totals.succeeded,
            failed: totals.failed,
            skipped: actions.len() - items.len(),
            bytes_processed: totals.bytes_processed,
            elapsed: started.elapsed(),
            items,
            cancelled,
        };
        reporter.on_batch_complete(&summary);
        Ok(summary)
    }

    /// Charge every move/copy against the free space of its destination
    /// volume, in batch order. Items that do not fit under the safety margin
    /// fail up front; the rest of the batch is unaffected.
    fn reserve_space(&self, actions: &[Action]) -> HashMap<usize, Error> {
        let mut budgets: HashMap<PathBuf, u64> = HashMap::new();
        let mut failures = HashMap::new();

        for (idx, action) in actions.iter().enumerate() {
            if action.kind == ActionKind::Delete {
                continue;
            }
            let Some(dest) = action.destination.as_deref() else {
                failures.insert(
                    idx,
                    Error::Config(format!("{} has no destination", action.kind.label())),
                );
                continue;
            };
            let volume = existing_ancestor(dest);
            let remaining = match budgets.get(&volume) {
                Some(&left) => left,
                None => match self.space.available(&volume) {
                    Ok(free) => free,
                    Err(err) => {
                        failures.insert(idx, Error::io(&volume, err));
                        continue;
                    }
                },
            };
            let needed = action.source.size.saturating_add(self.safety_margin);
            if needed > remaining {
                failures.insert(
                    idx,
                    Error::SpaceInsufficient {
                        volume: volume.clone(),
                        needed,
                        available: remaining,
                    },
                );
                budgets.insert(volume, remaining);
            } else {
                budgets.insert(volume, remaining - action.source.size);
            }
        }
        failures
    }

    fn apply(&self, action: &Action) -> Result<(Option<PathBuf>, Option<String>)> {
        let source = &action.source;
        check_unchanged(source)?;

        match action.kind {
            ActionKind::Delete => {
                if let Some(hook) = &self.pre_delete {
                    if let DeleteDecision::Intercepted(note) = hook.before_delete(source) {
                        return Ok((None, Some(note)));
                    }
                }
                fs::remove_file(&source.path).map_err(|e| Error::io(&source.path, e))?;
                self.prune_from(&source.path);
                Ok((None, None))
            }
            ActionKind::Move | ActionKind::Copy => {
                let requested = action
                    .destination
                    .as_deref()
                    .ok_or_else(|| Error::Config(format!("{} has no destination", action.kind.label())))?;
                let target = free_name(requested);
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
                }
                if action.kind == ActionKind::Move {
                    move_file(&source.path, &target)?;
                    self.prune_from(&source.path);
                } else {
                    copy_file(&source.path, &target)?;
                }
                let detail = (target != requested).then(|| format!("renamed to {}", target.display()));
                Ok((Some(target), detail))
            }
        }
    }

    fn prune_from(&self, removed: &Path) {
        if !self.prune_empty_dirs {
            return;
        }
        let Some(root) = self.root.as_deref() else {
            return;
        };
        let mut dir = removed.parent();
        while let Some(current) = dir {
            if current == root || !current.starts_with(root) {
                break;
            }
            if fs::remove_dir(current).is_err() {
                break;
            }
            debug!(dir = %current.display(), "pruned empty directory");
            dir = current.parent();
        }
    }
}

fn check_unchanged(file: &MirrorFile) -> Result<()> {
    match fs::metadata(&file.path) {
        Ok(meta) if meta.len() == file.size => Ok(()),
        Ok(meta) => Err(Error::ConcurrentModification {
            path: file.path.clone(),
            expected: file.size,
            found: format!("{} bytes", meta.len()),
        }),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Err(Error::ConcurrentModification {
            path: file.path.clone(),
            expected: file.size,
            found: "no file".into(),
        }),
        Err(err) => Err(Error::io(&file.path, err)),
    }
}

/// `path` itself if unused, else the first free `stem_N.ext`.
fn free_name(path: &Path) -> PathBuf {
    if !path.exists() {
        return path.to_path_buf();
    }
    let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or_default();
    let ext = path.extension().and_then(|s| s.to_str());
    let mut n = 1;
    loop {
        let name = match ext {
            Some(ext) => format!("{stem}_{n}.{ext}"),
            None => format!("{stem}_{n}"),
        };
        let candidate = path.with_file_name(name);
        if !candidate.exists() {
            return candidate;
        }
        n += 1;
    }
}

fn existing_ancestor(path: &Path) -> PathBuf {
    path.ancestors()
        .skip(1)
        .find(|p| p.is_dir())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."))
}

fn move_file(src: &Path, dest: &Path) -> Result<()> {
    if fs::rename(src, dest).is_ok() {
        return Ok(());
    }
    copy_file(src, dest)?;
    fs::remove_file(src).map_err(|e| Error::io(src, e))
}

/// Copy through a `.partial` sibling so an interrupted copy never leaves a
/// full-looking file at `dest`. The source mtime is carried over.
fn copy_file(src: &Path, dest: &Path) -> Result<()> {
    let mut reader = fs::File::open(src).map_err(|e| Error::io(src, e))?;
    let modified = reader
        .metadata()
        .and_then(|m| m.modified())
        .map_err(|e| Error::io(src, e))?;

    let mut staging = dest.as_os_str().to_owned();
    staging.push(".partial");
    let staging = PathBuf::from(staging);

    let result = (|| -> io::Result<()> {
        let mut writer = fs::File::create(&staging)?;
        let mut buf = vec![0u8; COPY_BUFFER];
        loop {
            let n = reader.read(&mut buf)?;
            if n == 0 {
                break;
            }
            writer.write_all(&buf[..n])?;
        }
        writer.flush()?;
        writer.set_modified(modified)?;
        writer.sync_all()?;
        drop(writer);
        fs::rename(&staging, dest)
    })();

    result.map_err(|e| {
        let _ = fs::remove_file(&staging);
        Error::io(dest, e)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::progress::SilentReporter;
    use crate::types::{HealthState, MediaKind};
    use tempfile::tempdir;

    fn mirror_file(path: &Path, root: &Path) -> MirrorFile {
        let size = fs::metadata(path).unwrap().len();
        MirrorFile {
            path: path.to_path_buf(),
            relative: path.strip_prefix(root).unwrap().to_path_buf(),
            size,
            modified: 0,
            extension: "mkv".into(),
            kind: MediaKind::Movie,
            checksum: None,
            catalog_match: None,
            ambiguous: false,
            health: HealthState::Orphaned,
            note: None,
        }
    }

    struct FixedSpace(u64);

    impl SpaceProbe for FixedSpace {
        fn available(&self, _dir: &Path) -> io::Result<u64> {
            Ok(self.0)
        }
    }

    #[test]
    fn free_name_appends_counter() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("Movie.mkv");
        assert_eq!(free_name(&target), target);
        fs::write(&target, b"x").unwrap();
        fs::write(dir.path().join("Movie_1.mkv"), b"x").unwrap();
        assert_eq!(free_name(&target), dir.path().join("Movie_2.mkv"));
    }

    #[test]
    fn copy_keeps_source_and_mtime() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("mirror");
        fs::create_dir_all(&root).unwrap();
        let src = root.join("a.mkv");
        fs::write(&src, vec![7u8; 3000]).unwrap();
        let when = std::time::SystemTime::UNIX_EPOCH + Duration::from_secs(1_600_000_000);
        fs::File::options().write(true).open(&src).unwrap().set_modified(when).unwrap();

        let dest = dir.path().join("out/a.mkv");
        let mut exec = MutationExecutor::new(Journal::open(&dir.path().join("j.jsonl")).unwrap())
            .with_space_probe(FixedSpace(u64::MAX));
        let summary = exec
            .execute(
                &[Action::relocate(ActionKind::Copy, mirror_file(&src, &root), dest.clone())],
                &CancelToken::new(),
                &SilentReporter,
            )
            .unwrap();

        assert_eq!(summary.succeeded, 1);
        assert!(src.exists());
        assert_eq!(fs::read(&dest).unwrap().len(), 3000);
        assert_eq!(fs::metadata(&dest).unwrap().modified().unwrap(), when);
        assert!(!dir.path().join("out/a.mkv.partial").exists());
    }

    #[test]
    fn space_shortfall_fails_only_the_item_that_does_not_fit() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("mirror");
        fs::create_dir_all(&root).unwrap();
        let big = root.join("big.mkv");
        let small = root.join("small.mkv");
        fs::write(&big, vec![0u8; 800]).unwrap();
        fs::write(&small, vec![0u8; 100]).unwrap();

        let out = dir.path().join("out");
        let actions = vec![
            Action::relocate(ActionKind::Copy, mirror_file(&small, &root), out.join("small.mkv")),
            Action::relocate(ActionKind::Copy, mirror_file(&big, &root), out.join("big.mkv")),
        ];
        let mut exec = MutationExecutor::new(Journal::open(&dir.path().join("j.jsonl")).unwrap())
            .with_space_probe(FixedSpace(1000))
            .with_safety_margin(200);
        let summary = exec.execute(&actions, &CancelToken::new(), &SilentReporter).unwrap();

        assert!(summary.items[0].succeeded());
        match &summary.items[1].outcome {
            Outcome::Failure { kind, .. } => assert_eq!(*kind, ErrorKind::SpaceInsufficient),
            other => panic!("expected failure, got {other:?}"),
        }
        assert!(!out.join("big.mkv").exists());
    }

    #[test]
    fn delete_prunes_empty_parents_below_root() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("mirror");
        let nested = root.join("Show/Season 01");
        fs::create_dir_all(&nested).unwrap();
        let file = nested.join("ep.mkv");
        fs::write(&file, b"data").unwrap();

        let mut exec = MutationExecutor::new(Journal::open(&dir.path().join("j.jsonl")).unwrap())
            .with_prune_empty_dirs(true)
            .with_root(&root);
        exec.execute(&[Action::delete(mirror_file(&file, &root))], &CancelToken::new(), &SilentReporter)
            .unwrap();

        assert!(!root.join("Show").exists());
        assert!(root.exists());
    }

    #[test]
    fn cancelled_batch_skips_the_rest() {
        let dir = tempdir().unwrap();
        let root = dir.path().to_path_buf();
        let a = root.join("a.mkv");
        fs::write(&a, b"a").unwrap();

        let cancel = CancelToken::new();
        cancel.cancel();
        let mut exec = MutationExecutor::new(Journal::open(&root.join("j.jsonl")).unwrap());
        let summary = exec
            .execute(&[Action::delete(mirror_file(&a, &root))], &cancel, &SilentReporter)
            .unwrap();

        assert!(summary.cancelled);
        assert_eq!(summary.skipped, 1);
        assert!(a.exists());
        assert!(Journal::read_all(&root.join("j.jsonl")).unwrap().is_empty());
    }
}
