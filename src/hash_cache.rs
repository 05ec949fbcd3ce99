//! Validated memoization of `path -> digest`, LRU-bounded and optionally
//! persistent.

use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::SystemTime;

use lru::LruCache;
use serde::{Deserialize, Serialize};

use crate::digest::{Algorithm, Digest};
use crate::error::{Result, SnugError};

/// Default bound on the number of entries the cache holds.
pub const DEFAULT_MAX_CACHE_SIZE: usize = 10_000;

/// `{ resolvedPath, digest, algorithm, fileSize, modificationTime, cacheTime }`.
/// Equality of `(fileSize, modificationTime, algorithm)` with the current
/// filesystem state is the sole validity predicate.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HashCacheEntry {
    pub resolved_path: PathBuf,
    pub digest: Digest,
    pub algorithm: Algorithm,
    pub file_size: u64,
    #[serde(with = "crate::time_serde")]
    pub modification_time: SystemTime,
    #[serde(with = "crate::time_serde")]
    pub cache_time: SystemTime,
}

/// Snapshot returned by [`HashCache::stats`].
#[derive(Clone, Copy, Debug)]
pub struct HashCacheStats {
    pub count: usize,
    pub capacity: usize,
}

/// The current stat of a file, as observed by the caller. Passed into
/// [`HashCache::put`] so the cache never has to re-stat the filesystem
/// itself.
#[derive(Clone, Copy, Debug)]
pub struct FileStat {
    pub size: u64,
    pub modified: SystemTime,
}

/// On-disk representation written by [`HashCache::save`] and read back by
/// [`HashCache::load`]. A flat JSON array round-trips losslessly regardless
/// of the in-memory LRU ordering (ordering itself is not semantically
/// meaningful here, only recency-of-use is, and that resets on load).
#[derive(Default, Serialize, Deserialize)]
struct CacheOnDisk {
    algorithm: Algorithm,
    entries: Vec<HashCacheEntry>,
}

/// `path -> digest` memoization, guarded by a single mutex so concurrent
/// `get`/`put` calls from many rayon worker threads observe a serialized,
/// non-torn LRU chain.
pub struct HashCache {
    algorithm: Algorithm,
    inner: Mutex<LruCache<PathBuf, HashCacheEntry>>,
    persist_path: Option<PathBuf>,
}

impl HashCache {
    pub fn new(algorithm: Algorithm, capacity: usize) -> Self {
        let capacity = std::num::NonZeroUsize::new(capacity)
            .unwrap_or(std::num::NonZeroUsize::new(DEFAULT_MAX_CACHE_SIZE).unwrap());
        Self {
            algorithm,
            inner: Mutex::new(LruCache::new(capacity)),
            persist_path: None,
        }
    }

    /// Attaches a backing file. `load()` reads from it; `save()` writes to
    /// it atomically (temp file + rename, matching the chunk store's
    /// write discipline).
    pub fn with_persist_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.persist_path = Some(path.into());
        self
    }

    /// Returns a cached digest iff a record exists, its `(fileSize,
    /// modificationTime, algorithm)` matches `stat`, and the algorithm
    /// matches the cache's configured algorithm. A mismatch is a miss
    /// *and* removes the stale record.
    pub fn get(&self, path: &Path, stat: FileStat) -> Option<Digest> {
        let mut guard = self.inner.lock().unwrap();
        let valid = match guard.peek(path) {
            Some(entry) => {
                entry.algorithm == self.algorithm
                    && entry.file_size == stat.size
                    && entry.modification_time == stat.modified
            }
            None => false,
        };

        if valid {
            guard.get(path).map(|entry| entry.digest.clone())
        } else {
            guard.pop(path);
            None
        }
    }

    /// Inserts or replaces the record for `path`. May evict the
    /// least-recently-used record if the cache is at capacity.
    pub fn put(&self, path: impl Into<PathBuf>, digest: Digest, stat: FileStat) {
        let path = path.into();
        let entry = HashCacheEntry {
            resolved_path: path.clone(),
            digest,
            algorithm: self.algorithm,
            file_size: stat.size,
            modification_time: stat.modified,
            cache_time: SystemTime::now(),
        };
        self.inner.lock().unwrap().put(path, entry);
    }

    pub fn remove(&self, path: &Path) {
        self.inner.lock().unwrap().pop(path);
    }

    pub fn clear(&self) {
        self.inner.lock().unwrap().clear();
    }

    pub fn stats(&self) -> HashCacheStats {
        let guard = self.inner.lock().unwrap();
        HashCacheStats {
            count: guard.len(),
            capacity: guard.cap().get(),
        }
    }

    /// Writes a durable representation. Persistence failures are non-fatal
    /// to in-memory operation; they surface only through this call's
    /// result.
    pub fn save(&self) -> Result<()> {
        let Some(path) = &self.persist_path else {
            return Ok(());
        };

        let guard = self.inner.lock().unwrap();
        let on_disk = CacheOnDisk {
            algorithm: self.algorithm,
            entries: guard.iter().map(|(_, entry)| entry.clone()).collect(),
        };
        drop(guard);

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| SnugError::io("hash_cache.save", path.clone(), e))?;
        }

        let temp_path = path.with_extension(format!(
            "tmp.{}",
            SystemTime::now()
                .duration_since(SystemTime::UNIX_EPOCH)
                .unwrap()
                .as_nanos()
        ));

        let file = File::create(&temp_path).map_err(|e| SnugError::io("hash_cache.save", temp_path.clone(), e))?;
        serde_json::to_writer(BufWriter::new(file), &on_disk)
            .map_err(|e| SnugError::InvalidFormat { reason: e.to_string() })?;

        std::fs::rename(&temp_path, path).map_err(|e| SnugError::io("hash_cache.save", path.clone(), e))?;
        Ok(())
    }

    /// Reads the durable representation written by `save()`, pre-filling
    /// the in-memory cache. Entries for an algorithm other than this
    /// cache's configured one are discarded: they can never produce a hit.
    pub fn load(&self) -> Result<()> {
        let Some(path) = &self.persist_path else {
            return Ok(());
        };

        if !path.exists() {
            return Ok(());
        }

        let file = File::open(path).map_err(|e| SnugError::io("hash_cache.load", path.clone(), e))?;
        let on_disk: CacheOnDisk = serde_json::from_reader(BufReader::new(file))
            .map_err(|e| SnugError::InvalidFormat { reason: e.to_string() })?;

        let mut guard = self.inner.lock().unwrap();
        for entry in on_disk.entries {
            if entry.algorithm == self.algorithm {
                guard.put(entry.resolved_path.clone(), entry);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest::Hasher;

    fn stat_now(size: u64) -> FileStat {
        FileStat {
            size,
            modified: SystemTime::now(),
        }
    }

    #[test]
    fn miss_then_hit_after_put() {
        let cache = HashCache::new(Algorithm::Sha256, 10);
        let path = PathBuf::from("a.txt");
        let stat = stat_now(5);

        assert!(cache.get(&path, stat).is_none());

        let digest = Hasher::hash_bytes(Algorithm::Sha256, b"hello");
        cache.put(&path, digest.clone(), stat);

        assert_eq!(cache.get(&path, stat), Some(digest));
    }

    #[test]
    fn mismatched_stat_is_a_miss_and_evicts() {
        let cache = HashCache::new(Algorithm::Sha256, 10);
        let path = PathBuf::from("a.txt");
        let stat = stat_now(5);
        let digest = Hasher::hash_bytes(Algorithm::Sha256, b"hello");
        cache.put(&path, digest, stat);

        let different_stat = stat_now(6);
        assert!(cache.get(&path, different_stat).is_none());
        // The stale record was evicted: even the original stat is now a miss.
        assert!(cache.get(&path, stat).is_none());
    }

    #[test]
    fn lru_eviction_respects_capacity() {
        let cache = HashCache::new(Algorithm::Sha256, 2);
        let stat = stat_now(1);
        let d = |b: &[u8]| Hasher::hash_bytes(Algorithm::Sha256, b);

        cache.put("a", d(b"a"), stat);
        cache.put("b", d(b"b"), stat);
        cache.put("c", d(b"c"), stat);

        assert_eq!(cache.stats().count, 2);
        assert!(cache.get(Path::new("a"), stat).is_none());
        assert!(cache.get(Path::new("b"), stat).is_some());
        assert!(cache.get(Path::new("c"), stat).is_some());
    }

    #[test]
    fn save_and_load_round_trips() -> anyhow::Result<()> {
        let dir = assert_fs::TempDir::new()?;
        let cache_path = dir.path().join("cache.json");

        let digest = Hasher::hash_bytes(Algorithm::Sha256, b"payload");
        let stat = stat_now(7);

        {
            let cache = HashCache::new(Algorithm::Sha256, 10).with_persist_path(&cache_path);
            cache.put("p.txt", digest.clone(), stat);
            cache.save()?;
        }

        let cache = HashCache::new(Algorithm::Sha256, 10).with_persist_path(&cache_path);
        cache.load()?;
        assert_eq!(cache.get(Path::new("p.txt"), stat), Some(digest));

        Ok(())
    }
}
