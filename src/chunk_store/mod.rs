//! The content-addressable primitive store all higher layers are built on,
//! plus its default filesystem backend and the mirroring composite (in
//! `mirror`).

mod fs;
mod mirror;

use std::collections::{HashMap, HashSet};
use std::time::SystemTime;

pub use fs::{FsChunkStore, OrganizationStrategy};
pub use mirror::MirroredStore;

use crate::digest::Digest;
use crate::error::Result;

/// Per-chunk sidecar. `content_hash` duplicates
/// the key the chunk is stored under so the sidecar is self-verifying even
/// if separated from its directory context.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct ChunkMetadata {
    pub size: u64,
    pub content_hash: Digest,
    pub hash_algorithm: crate::digest::Algorithm,
    pub original_filename: Option<String>,
    pub original_paths: HashSet<String>,
    #[serde(with = "crate::time_serde")]
    pub created: SystemTime,
    #[serde(with = "crate::time_serde")]
    pub modified: SystemTime,
    pub content_type: Option<String>,
    pub chunk_type: Option<String>,
    pub compression_info: Option<String>,
}

/// The metadata a single `write()` call contributes. `ChunkStore::write`
/// merges this into any metadata already on disk: `original_paths` is
/// unioned, `created` takes the min, `modified` takes the max, and
/// `original_filename` is overwritten (it is a single "most recent name"
/// field, never accumulated into `original_paths`).
#[derive(Clone, Debug)]
pub struct ChunkMetadataUpdate {
    pub original_filename: Option<String>,
    pub original_paths: HashSet<String>,
    pub created: SystemTime,
    pub modified: SystemTime,
    pub content_type: Option<String>,
    pub chunk_type: Option<String>,
    pub compression_info: Option<String>,
}

impl ChunkMetadataUpdate {
    /// Convenience constructor for the common archiver case: a single
    /// source path observed at one point in time.
    pub fn for_path(path: impl Into<String>, observed_at: SystemTime) -> Self {
        let path = path.into();
        Self {
            original_filename: Some(path.clone()),
            original_paths: std::iter::once(path).collect(),
            created: observed_at,
            modified: observed_at,
            content_type: None,
            chunk_type: None,
            compression_info: None,
        }
    }
}

impl ChunkMetadata {
    fn new(digest: &Digest, size: u64, update: &ChunkMetadataUpdate) -> Self {
        Self {
            size,
            content_hash: digest.clone(),
            hash_algorithm: digest.algorithm,
            original_filename: update.original_filename.clone(),
            original_paths: update.original_paths.clone(),
            created: update.created,
            modified: update.modified,
            content_type: update.content_type.clone(),
            chunk_type: update.chunk_type.clone(),
            compression_info: update.compression_info.clone(),
        }
    }

    /// Applies the merge law for an incoming write against already-present
    /// metadata.
    fn merge(&mut self, update: &ChunkMetadataUpdate) {
        self.original_paths.extend(update.original_paths.iter().cloned());
        if update.created < self.created {
            self.created = update.created;
        }
        if update.modified > self.modified {
            self.modified = update.modified;
        }
        if let Some(filename) = &update.original_filename {
            self.original_filename = Some(filename.clone());
        }
        if update.content_type.is_some() {
            self.content_type = update.content_type.clone();
        }
        if update.chunk_type.is_some() {
            self.chunk_type = update.chunk_type.clone();
        }
        if update.compression_info.is_some() {
            self.compression_info = update.compression_info.clone();
        }
    }
}

/// Content-addressable byte store keyed by digest.
///
/// Implementations must make `write` crash-safe (temp + rename, sidecar
/// merged after bytes land) and must serialize sidecar merges per digest so
/// concurrent writers of the same digest never tear the merged metadata.
pub trait ChunkStore: Send + Sync {
    /// Atomically persists `bytes` under `digest` and merges `metadata` per
    /// the merge law. If the digest already exists with byte-equal content
    /// this is a no-op for the bytes and a metadata merge only. Callers
    /// guarantee `digest == hash(bytes, digest.algorithm)`; an implementation
    /// MAY verify this and MUST return `IntegrityMismatch` if it does and
    /// the check fails.
    fn write(&self, digest: &Digest, bytes: &[u8], metadata: Option<ChunkMetadataUpdate>) -> Result<Digest>;

    /// Returns the full chunk, or `None` if the digest is absent.
    fn read(&self, digest: &Digest) -> Result<Option<Vec<u8>>>;

    /// Partial read. `None` if the digest is absent; `OutOfRange` if
    /// `offset > size`; trims at `size` if `offset + length > size`.
    fn read_range(&self, digest: &Digest, offset: u64, length: u64) -> Result<Option<Vec<u8>>>;

    fn exists(&self, digest: &Digest) -> Result<bool>;

    fn exists_batch(&self, digests: &[Digest]) -> Result<HashMap<Digest, bool>> {
        digests.iter().map(|d| Ok((d.clone(), self.exists(d)?))).collect()
    }

    fn size(&self, digest: &Digest) -> Result<Option<u64>>;

    fn metadata(&self, digest: &Digest) -> Result<Option<ChunkMetadata>>;

    /// Removes chunk and sidecar. Idempotent: no error if absent.
    fn delete(&self, digest: &Digest) -> Result<()>;

    /// Lists every digest currently stored. Exists to let an external,
    /// explicit garbage collector enumerate live chunks; the core itself
    /// never calls this to delete anything.
    fn list_digests(&self) -> Result<Vec<Digest>>;
}
