//! Composes N primary stores and M glacier stores into one logical store
//! with fallback reads and asynchronous glacier writes.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use crate::chunk_store::{ChunkMetadata, ChunkMetadataUpdate, ChunkStore};
use crate::digest::Digest;
use crate::error::{Result, SnugError};

/// Primaries are synchronously-consistent replicas; glaciers are lazy,
/// best-effort backups written in the background after a primary succeeds.
pub struct MirroredStore {
    primaries: Vec<Arc<dyn ChunkStore>>,
    glaciers: Vec<Arc<dyn ChunkStore>>,
    pending_glacier_writes: Mutex<Vec<JoinHandle<()>>>,
    cancelled: Arc<AtomicBool>,
}

impl MirroredStore {
    pub fn new(primaries: Vec<Arc<dyn ChunkStore>>, glaciers: Vec<Arc<dyn ChunkStore>>) -> Self {
        Self {
            primaries,
            glaciers,
            pending_glacier_writes: Mutex::new(Vec::new()),
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Best-effort cancellation of pending glacier writes. A glacier write
    /// already in flight against a single store is allowed to finish (its
    /// own temp+rename discipline keeps it from corrupting anything); this
    /// only stops the *next* glacier in the loop from starting.
    pub fn cancel_pending_glacier_writes(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Blocks until all dispatched glacier-write background threads have
    /// finished. Mostly useful for tests that want to assert on glacier
    /// state deterministically.
    pub fn join_pending_glacier_writes(&self) {
        let mut pending = self.pending_glacier_writes.lock().unwrap();
        for handle in pending.drain(..) {
            let _ = handle.join();
        }
    }

    fn dispatch_glacier_writes(&self, digest: Digest, bytes: Vec<u8>, metadata: Option<ChunkMetadataUpdate>) {
        if self.glaciers.is_empty() {
            return;
        }

        let glaciers = self.glaciers.clone();
        let cancelled = self.cancelled.clone();

        let handle = std::thread::spawn(move || {
            for glacier in &glaciers {
                if cancelled.load(Ordering::SeqCst) {
                    break;
                }
                if let Err(err) = glacier.write(&digest, &bytes, metadata.clone()) {
                    log::warn!("glacier write failed for {digest}: {err}");
                }
            }
        });

        let mut pending = self.pending_glacier_writes.lock().unwrap();
        pending.retain(|h| !h.is_finished());
        pending.push(handle);
    }
}

impl ChunkStore for MirroredStore {
    /// Succeeds iff at least one primary accepts the write. Attempts the
    /// rest of the primaries too (best effort) so their replicas stay in
    /// sync; after the primary phase returns, glacier writes are
    /// dispatched on a background thread and do not affect the result.
    fn write(&self, digest: &Digest, bytes: &[u8], metadata: Option<ChunkMetadataUpdate>) -> Result<Digest> {
        if self.primaries.is_empty() {
            return Err(SnugError::StorageUnavailable {
                reason: "no primary stores configured".into(),
            });
        }

        let mut first_error = None;
        let mut any_succeeded = false;

        for primary in &self.primaries {
            match primary.write(digest, bytes, metadata.clone()) {
                Ok(_) => any_succeeded = true,
                Err(err) => {
                    log::warn!("primary write failed for {digest}: {err}");
                    first_error.get_or_insert(err);
                }
            }
        }

        if !any_succeeded {
            return Err(first_error.unwrap_or(SnugError::StorageUnavailable {
                reason: "all primaries rejected the write".into(),
            }));
        }

        self.dispatch_glacier_writes(digest.clone(), bytes.to_vec(), metadata);

        Ok(digest.clone())
    }

    /// Tries primaries in priority order, falling back to the next on a
    /// miss or transient error, then falls back to the glaciers.
    /// Transparent to the caller.
    fn read(&self, digest: &Digest) -> Result<Option<Vec<u8>>> {
        for store in self.primaries.iter().chain(self.glaciers.iter()) {
            match store.read(digest) {
                Ok(Some(bytes)) => return Ok(Some(bytes)),
                Ok(None) => continue,
                Err(err) if err.is_transient() => continue,
                Err(err) => return Err(err),
            }
        }
        Ok(None)
    }

    fn read_range(&self, digest: &Digest, offset: u64, length: u64) -> Result<Option<Vec<u8>>> {
        for store in self.primaries.iter().chain(self.glaciers.iter()) {
            match store.read_range(digest, offset, length) {
                Ok(Some(bytes)) => return Ok(Some(bytes)),
                Ok(None) => continue,
                Err(err) if err.is_transient() => continue,
                Err(err) => return Err(err),
            }
        }
        Ok(None)
    }

    fn exists(&self, digest: &Digest) -> Result<bool> {
        for store in self.primaries.iter().chain(self.glaciers.iter()) {
            if store.exists(digest)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn exists_batch(&self, digests: &[Digest]) -> Result<HashMap<Digest, bool>> {
        let mut result: HashMap<Digest, bool> = digests.iter().map(|d| (d.clone(), false)).collect();
        for store in self.primaries.iter().chain(self.glaciers.iter()) {
            for (digest, found) in store.exists_batch(digests)? {
                if found {
                    result.insert(digest, true);
                }
            }
        }
        Ok(result)
    }

    fn size(&self, digest: &Digest) -> Result<Option<u64>> {
        for store in self.primaries.iter().chain(self.glaciers.iter()) {
            if let Some(size) = store.size(digest)? {
                return Ok(Some(size));
            }
        }
        Ok(None)
    }

    fn metadata(&self, digest: &Digest) -> Result<Option<ChunkMetadata>> {
        for store in self.primaries.iter().chain(self.glaciers.iter()) {
            if let Some(metadata) = store.metadata(digest)? {
                return Ok(Some(metadata));
            }
        }
        Ok(None)
    }

    fn delete(&self, digest: &Digest) -> Result<()> {
        for store in self.primaries.iter().chain(self.glaciers.iter()) {
            store.delete(digest)?;
        }
        Ok(())
    }

    fn list_digests(&self) -> Result<Vec<Digest>> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for store in self.primaries.iter().chain(self.glaciers.iter()) {
            for digest in store.list_digests()? {
                if seen.insert(digest.clone()) {
                    out.push(digest);
                }
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk_store::{FsChunkStore, OrganizationStrategy};
    use crate::digest::{Algorithm, Hasher};

    fn store() -> (assert_fs::TempDir, Arc<FsChunkStore>) {
        let dir = assert_fs::TempDir::new().unwrap();
        let store = Arc::new(FsChunkStore::new(dir.path(), OrganizationStrategy::default()).unwrap());
        (dir, store)
    }

    #[test]
    fn read_succeeds_if_any_store_holds_the_digest() {
        let (_d1, p1) = store();
        let (_d2, p2) = store();
        let digest = Hasher::hash_bytes(Algorithm::Sha256, b"mirrored");

        p2.write(&digest, b"mirrored", None).unwrap();

        let mirror = MirroredStore::new(vec![p1, p2], vec![]);
        assert_eq!(mirror.read(&digest).unwrap(), Some(b"mirrored".to_vec()));
    }

    #[test]
    fn write_succeeds_and_glacier_eventually_receives_bytes() {
        let (_d1, primary) = store();
        let (_d2, glacier) = store();
        let digest = Hasher::hash_bytes(Algorithm::Sha256, b"tiered");

        let mirror = MirroredStore::new(vec![primary.clone()], vec![glacier.clone()]);
        mirror.write(&digest, b"tiered", None).unwrap();
        mirror.join_pending_glacier_writes();

        assert_eq!(glacier.read(&digest).unwrap(), Some(b"tiered".to_vec()));
    }

    #[test]
    fn write_fails_only_if_every_primary_rejects() {
        let mirror = MirroredStore::new(vec![], vec![]);
        let digest = Hasher::hash_bytes(Algorithm::Sha256, b"x");
        assert!(mirror.write(&digest, b"x", None).is_err());
    }
}
