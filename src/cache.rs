use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use dashmap::DashMap;
use rusqlite::{Connection, OptionalExtension, params};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::types::ChecksumAlgorithm;
use crate::utils::mtime_secs;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheRecord {
    pub size: u64,
    pub mtime: i64,
    pub hash: String,
}

impl CacheRecord {
    pub fn is_fresh(&self, size: u64, mtime: i64) -> bool {
        self.size == size && self.mtime == mtime
    }
}

/// Checksums keyed by path and validated against (size, mtime).
///
/// The live map is sharded so concurrent hashers only contend on the shard of
/// the path they touch. `baseline` is the set of records as persisted by the
/// previous run and never changes after open.
pub struct ChecksumCache {
    records: DashMap<PathBuf, CacheRecord>,
    baseline: HashMap<PathBuf, CacheRecord>,
    db_path: Option<PathBuf>,
    algorithm: ChecksumAlgorithm,
    dirty: AtomicBool,
}

impl ChecksumCache {
    pub fn in_memory(algorithm: ChecksumAlgorithm) -> Self {
        Self {
            records: DashMap::new(),
            baseline: HashMap::new(),
            db_path: None,
            algorithm,
            dirty: AtomicBool::new(false),
        }
    }

    /// Open (or create) the SQLite cache at `path`. Records written with a
    /// different algorithm are ignored, records for vanished files are
    /// dropped, and records that no longer agree with the live file are kept
    /// only as the baseline.
    pub fn open(path: &Path, algorithm: ChecksumAlgorithm) -> Result<Self> {
        let conn = connect(path)?;
        init_schema(&conn).map_err(|e| corrupted(path, e))?;

        let stored_algorithm: Option<String> = conn
            .query_row("SELECT value FROM meta WHERE key = 'algorithm'", [], |r| {
                r.get(0)
            })
            .optional()
            .map_err(|e| corrupted(path, e))?;

        let mut cache = Self::in_memory(algorithm);
        cache.db_path = Some(path.to_path_buf());

        if stored_algorithm
            .as_deref()
            .is_some_and(|stored| stored != algorithm.label())
        {
            info!(
                cache = %path.display(),
                "checksum algorithm changed, discarding cached records"
            );
            cache.dirty.store(true, Ordering::Relaxed);
            return Ok(cache);
        }

        let mut stmt = conn
            .prepare("SELECT path, size, mtime, hash FROM checksums")
            .map_err(|e| corrupted(path, e))?;
        let rows = stmt
            .query_map([], |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, i64>(1)?,
                    r.get::<_, i64>(2)?,
                    r.get::<_, String>(3)?,
                ))
            })
            .map_err(|e| corrupted(path, e))?;

        let (mut fresh, mut stale, mut gone) = (0usize, 0usize, 0usize);
        for row in rows {
            let (file, size, mtime, hash) = row.map_err(|e| corrupted(path, e))?;
            let file = PathBuf::from(file);
            let record = CacheRecord {
                size: u64::try_from(size).unwrap_or(0),
                mtime,
                hash,
            };
            match fs::metadata(&file) {
                Ok(meta) => {
                    if record.is_fresh(meta.len(), mtime_secs(&meta)) {
                        cache.records.insert(file.clone(), record.clone());
                        fresh += 1;
                    } else {
                        stale += 1;
                    }
                    cache.baseline.insert(file, record);
                }
                Err(_) => gone += 1,
            }
        }
        if gone > 0 {
            cache.dirty.store(true, Ordering::Relaxed);
        }

        debug!(
            cache = %path.display(),
            fresh, stale, gone,
            "loaded checksum cache"
        );
        Ok(cache)
    }

    pub fn algorithm(&self) -> ChecksumAlgorithm {
        self.algorithm
    }

    /// A cached checksum, only if it was taken at exactly this size and mtime.
    pub fn lookup(&self, path: &Path, size: u64, mtime: i64) -> Option<String> {
        let record = self.records.get(path)?;
        record.is_fresh(size, mtime).then(|| record.hash.clone())
    }

    /// The record persisted by the previous run, whether or not it still
    /// matches the live file.
    pub fn baseline(&self, path: &Path) -> Option<&CacheRecord> {
        self.baseline.get(path)
    }

    pub fn insert(&self, path: PathBuf, size: u64, mtime: i64, hash: String) {
        self.records.insert(path, CacheRecord { size, mtime, hash });
        self.dirty.store(true, Ordering::Relaxed);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn path(&self) -> Option<&Path> {
        self.db_path.as_deref()
    }

    /// Write the cache back to its file. Baseline records that were not
    /// recomputed this run are carried forward as the last known-good value.
    pub fn save(&self) -> Result<()> {
        let Some(path) = self.db_path.as_deref() else {
            return Ok(());
        };
        if !self.dirty.load(Ordering::Relaxed) {
            return Ok(());
        }

        let mut merged: HashMap<PathBuf, CacheRecord> = self
            .baseline
            .iter()
            .filter(|(p, _)| p.exists())
            .map(|(p, r)| (p.clone(), r.clone()))
            .collect();
        for entry in self.records.iter() {
            merged.insert(entry.key().clone(), entry.value().clone());
        }

        let mut conn = connect(path)?;
        init_schema(&conn)?;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM checksums", [])?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO checksums (path, size, mtime, hash) VALUES (?1, ?2, ?3, ?4)",
            )?;
            for (file, record) in &merged {
                stmt.execute(params![
                    file.to_string_lossy(),
                    i64::try_from(record.size).unwrap_or(i64::MAX),
                    record.mtime,
                    record.hash
                ])?;
            }
        }
        tx.execute(
            "REPLACE INTO meta (key, value) VALUES ('algorithm', ?1)",
            params![self.algorithm.label()],
        )?;
        tx.commit()?;

        self.dirty.store(false, Ordering::Relaxed);
        debug!(cache = %path.display(), records = merged.len(), "saved checksum cache");
        Ok(())
    }
}

fn connect(path: &Path) -> Result<Connection> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
    }
    Connection::open(path).map_err(|e| corrupted(path, e))
}

fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "BEGIN;
        CREATE TABLE IF NOT EXISTS checksums (
            path TEXT PRIMARY KEY,
            size INTEGER NOT NULL,
            mtime INTEGER NOT NULL,
            hash TEXT NOT NULL
        );
        CREATE TABLE IF NOT EXISTS meta (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );
        COMMIT;",
    )
}

fn corrupted(path: &Path, err: rusqlite::Error) -> Error {
    Error::CacheCorrupted {
        path: path.to_path_buf(),
        reason: err.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::Write;
    use tempfile::tempdir;

    fn stamp(path: &Path) -> (u64, i64) {
        let meta = fs::metadata(path).unwrap();
        (meta.len(), mtime_secs(&meta))
    }

    #[test]
    fn lookup_rejects_stale_records() {
        let cache = ChecksumCache::in_memory(ChecksumAlgorithm::Sha256);
        cache.insert(PathBuf::from("/m/a.mkv"), 10, 100, "abc".into());
        assert_eq!(cache.lookup(Path::new("/m/a.mkv"), 10, 100).as_deref(), Some("abc"));
        assert!(cache.lookup(Path::new("/m/a.mkv"), 11, 100).is_none());
        assert!(cache.lookup(Path::new("/m/a.mkv"), 10, 101).is_none());
    }

    #[test]
    fn persists_and_reloads_records() {
        let dir = tempdir().unwrap();
        let media = dir.path().join("a.mkv");
        File::create(&media).unwrap().write_all(b"payload").unwrap();
        let (size, mtime) = stamp(&media);
        let db = dir.path().join("cache.sqlite");

        let cache = ChecksumCache::open(&db, ChecksumAlgorithm::Sha256).unwrap();
        cache.insert(media.clone(), size, mtime, "deadbeef".into());
        cache.save().unwrap();

        let reopened = ChecksumCache::open(&db, ChecksumAlgorithm::Sha256).unwrap();
        assert_eq!(reopened.lookup(&media, size, mtime).as_deref(), Some("deadbeef"));
        assert_eq!(reopened.baseline(&media).map(|r| r.hash.as_str()), Some("deadbeef"));
    }

    #[test]
    fn changed_files_survive_only_as_baseline() {
        let dir = tempdir().unwrap();
        let media = dir.path().join("a.mkv");
        File::create(&media).unwrap().write_all(b"payload").unwrap();
        let (size, mtime) = stamp(&media);
        let db = dir.path().join("cache.sqlite");

        let cache = ChecksumCache::open(&db, ChecksumAlgorithm::Sha256).unwrap();
        cache.insert(media.clone(), size, mtime, "deadbeef".into());
        cache.save().unwrap();

        fs::OpenOptions::new()
            .append(true)
            .open(&media)
            .unwrap()
            .write_all(b" more")
            .unwrap();
        let (new_size, new_mtime) = stamp(&media);

        let reopened = ChecksumCache::open(&db, ChecksumAlgorithm::Sha256).unwrap();
        assert!(reopened.lookup(&media, new_size, new_mtime).is_none());
        assert!(reopened.is_empty());
        assert_eq!(reopened.baseline(&media).map(|r| r.size), Some(size));
    }

    #[test]
    fn algorithm_change_discards_records() {
        let dir = tempdir().unwrap();
        let media = dir.path().join("a.mkv");
        File::create(&media).unwrap().write_all(b"payload").unwrap();
        let (size, mtime) = stamp(&media);
        let db = dir.path().join("cache.sqlite");

        let cache = ChecksumCache::open(&db, ChecksumAlgorithm::Sha256).unwrap();
        cache.insert(media.clone(), size, mtime, "deadbeef".into());
        cache.save().unwrap();

        let md5 = ChecksumCache::open(&db, ChecksumAlgorithm::Md5).unwrap();
        assert!(md5.lookup(&media, size, mtime).is_none());
        assert!(md5.baseline(&media).is_none());
    }

    #[test]
    fn garbage_file_is_reported_as_corrupted() {
        let dir = tempdir().unwrap();
        let db = dir.path().join("cache.sqlite");
        fs::write(&db, vec![0x42u8; 4096]).unwrap();
        match ChecksumCache::open(&db, ChecksumAlgorithm::Sha256) {
            Err(Error::CacheCorrupted { .. }) => {}
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("garbage cache opened"),
        }
    }
}
