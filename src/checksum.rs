use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use crc32fast::Hasher as Crc32;
use md5::{Digest as Md5Digest, Md5};
use rayon::prelude::*;
use sha1_smol::Sha1;
use sha2::Sha256;
use tracing::{debug, trace};

use crate::cache::ChecksumCache;
use crate::cancel::CancelToken;
use crate::error::{Error, Result};
use crate::types::ChecksumAlgorithm;
use crate::utils::{bounded_pool, mtime_secs};

const STREAM_CHUNK_SIZE: usize = 512 * 1024;

enum StreamHasher {
    Crc32(Crc32),
    Md5(Md5),
    Sha1(Sha1),
    Sha256(Sha256),
}

impl StreamHasher {
    fn new(algorithm: ChecksumAlgorithm) -> Self {
        match algorithm {
            ChecksumAlgorithm::Crc32 => StreamHasher::Crc32(Crc32::new()),
            ChecksumAlgorithm::Md5 => StreamHasher::Md5(Md5::new()),
            ChecksumAlgorithm::Sha1 => StreamHasher::Sha1(Sha1::new()),
            ChecksumAlgorithm::Sha256 => StreamHasher::Sha256(Sha256::new()),
        }
    }

    fn update(&mut self, slice: &[u8]) {
        match self {
            StreamHasher::Crc32(h) => h.update(slice),
            StreamHasher::Md5(h) => h.update(slice),
            StreamHasher::Sha1(h) => h.update(slice),
            StreamHasher::Sha256(h) => h.update(slice),
        }
    }

    fn finalize_hex(self) -> String {
        match self {
            StreamHasher::Crc32(h) => format!("{:08x}", h.finalize()),
            StreamHasher::Md5(h) => hex::encode(h.finalize()),
            StreamHasher::Sha1(h) => h.digest().to_string(),
            StreamHasher::Sha256(h) => hex::encode(h.finalize()),
        }
    }
}

/// Stream `reader` through the selected hash with a fixed buffer; returns the
/// hex digest and the number of bytes consumed.
pub fn hash_reader<R: Read>(mut reader: R, algorithm: ChecksumAlgorithm) -> io::Result<(String, u64)> {
    let mut hasher = StreamHasher::new(algorithm);
    let mut buf = vec![0u8; STREAM_CHUNK_SIZE];
    let mut processed: u64 = 0;
    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        processed = processed.saturating_add(n as u64);
        hasher.update(&buf[..n]);
    }
    Ok((hasher.finalize_hex(), processed))
}

pub fn hash_bytes(data: &[u8], algorithm: ChecksumAlgorithm) -> String {
    let mut hasher = StreamHasher::new(algorithm);
    hasher.update(data);
    hasher.finalize_hex()
}

/// Checksums backed by a shared [`ChecksumCache`].
///
/// The cache is consulted and updated only around the map access; file reads
/// happen without holding any guard.
pub struct ChecksumService {
    cache: Arc<ChecksumCache>,
    algorithm: ChecksumAlgorithm,
    full_reads: AtomicUsize,
}

impl ChecksumService {
    pub fn new(cache: Arc<ChecksumCache>, algorithm: ChecksumAlgorithm) -> Self {
        Self {
            cache,
            algorithm,
            full_reads: AtomicUsize::new(0),
        }
    }

    pub fn algorithm(&self) -> ChecksumAlgorithm {
        self.algorithm
    }

    pub fn cache(&self) -> &ChecksumCache {
        &self.cache
    }

    /// Number of complete file reads performed so far. Cache hits and sampled
    /// fingerprints do not count.
    pub fn full_reads(&self) -> usize {
        self.full_reads.load(Ordering::SeqCst)
    }

    pub fn checksum(&self, path: &Path) -> Result<String> {
        let meta = fs::metadata(path).map_err(|e| Error::io(path, e))?;
        let (size, mtime) = (meta.len(), mtime_secs(&meta));

        if let Some(hash) = self.cache.lookup(path, size, mtime) {
            trace!(path = %path.display(), "checksum cache hit");
            return Ok(hash);
        }

        let file = File::open(path).map_err(|e| Error::io(path, e))?;
        self.full_reads.fetch_add(1, Ordering::SeqCst);
        let (hash, read) = hash_reader(file, self.algorithm).map_err(|e| Error::io(path, e))?;

        // Only remember the digest if the file held still while we read it.
        let after = fs::metadata(path).map_err(|e| Error::io(path, e))?;
        if read == size && after.len() == size && mtime_secs(&after) == mtime {
            self.cache.insert(path.to_path_buf(), size, mtime, hash.clone());
        } else {
            debug!(path = %path.display(), "file changed while hashing, not caching");
        }
        Ok(hash)
    }

    /// Hash many files on a pool of at most `threads` workers. Duplicate
    /// paths are hashed once; results follow the order of first appearance.
    /// Once `cancel` fires, remaining paths report `Error::Cancelled`.
    pub fn checksum_many(
        &self,
        paths: &[PathBuf],
        threads: usize,
        cancel: &CancelToken,
    ) -> Result<Vec<(PathBuf, Result<String>)>> {
        let pool = bounded_pool(threads)?;
        Ok(pool.install(|| self.checksum_batch(paths, cancel)))
    }

    /// Same as [`checksum_many`](Self::checksum_many) but on whichever rayon
    /// pool the caller is running in.
    pub fn checksum_batch(
        &self,
        paths: &[PathBuf],
        cancel: &CancelToken,
    ) -> Vec<(PathBuf, Result<String>)> {
        let mut seen = HashSet::new();
        let unique: Vec<&PathBuf> = paths.iter().filter(|p| seen.insert(p.as_path())).collect();
        unique
            .par_iter()
            .map(|path| {
                if cancel.is_cancelled() {
                    return ((*path).clone(), Err(Error::Cancelled));
                }
                ((*path).clone(), self.checksum(path))
            })
            .collect()
    }

    /// Digests of three `sample_len` windows at the start, middle and end of
    /// the file. The size is not part of the result, so files of different
    /// lengths compare on their windows alone. Files no larger than three
    /// windows are hashed whole.
    pub fn sample_fingerprint(&self, path: &Path, size: u64, sample_len: u64) -> Result<String> {
        let mut file = File::open(path).map_err(|e| Error::io(path, e))?;
        let sample_len = sample_len.max(1);

        if size <= sample_len.saturating_mul(3) {
            let (hash, _) =
                hash_reader(&mut file, self.algorithm).map_err(|e| Error::io(path, e))?;
            return Ok(hash);
        }

        let offsets = [0, size / 2 - sample_len / 2, size - sample_len];
        let mut parts = Vec::with_capacity(offsets.len());
        let mut buf = vec![0u8; usize::try_from(sample_len).unwrap_or(STREAM_CHUNK_SIZE)];
        for offset in offsets {
            file.seek(SeekFrom::Start(offset))
                .map_err(|e| Error::io(path, e))?;
            file.read_exact(&mut buf).map_err(|e| Error::io(path, e))?;
            parts.push(hash_bytes(&buf, self.algorithm));
        }
        Ok(parts.join(":"))
    }
}
