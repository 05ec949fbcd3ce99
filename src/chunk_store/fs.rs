//! Default filesystem-backed `ChunkStore`: git-style or flat bucketing,
//! temp+rename atomicity, and per-digest striped locks guarding sidecar
//! merges.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::SystemTime;

use crate::chunk_store::{ChunkMetadata, ChunkMetadataUpdate, ChunkStore};
use crate::digest::Digest;
use crate::error::{Result, SnugError};

/// How chunk bytes are arranged under the store root.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OrganizationStrategy {
    /// `h[0:2]/h[2:4]/.../h`, nested `depth` levels deep. `depth=2` is the
    /// recommended default: ~65,536 buckets, bounded fanout up to roughly
    /// 100M chunks.
    GitStyle { depth: u8 },
    /// A single directory. Only suitable for small stores (<=10k chunks).
    Flat,
}

impl Default for OrganizationStrategy {
    fn default() -> Self {
        OrganizationStrategy::GitStyle { depth: 2 }
    }
}

impl OrganizationStrategy {
    fn bucket_dir(&self, root: &Path, hex: &str) -> PathBuf {
        match self {
            OrganizationStrategy::Flat => root.to_path_buf(),
            OrganizationStrategy::GitStyle { depth } => {
                let mut dir = root.to_path_buf();
                let depth = (*depth as usize).min(hex.len() / 2);
                for level in 0..depth {
                    dir = dir.join(&hex[level * 2..level * 2 + 2]);
                }
                dir
            }
        }
    }
}

/// Number of stripes in the per-digest lock table. 256 matches the number
/// of possible first hex-byte values, so it lines up naturally with the
/// git-style bucketing without needing a separate hash function.
const LOCK_STRIPES: usize = 256;

/// Filesystem implementation of [`ChunkStore`]. The on-disk layout (root,
/// bucketing, `.meta` sidecars) is a public contract: changing it is a
/// breaking change for any store shared across processes.
pub struct FsChunkStore {
    root: PathBuf,
    strategy: OrganizationStrategy,
    locks: Vec<Mutex<()>>,
}

impl FsChunkStore {
    pub fn new(root: impl Into<PathBuf>, strategy: OrganizationStrategy) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root).map_err(|e| SnugError::io("chunk_store.open", root.clone(), e))?;
        Ok(Self {
            root,
            strategy,
            locks: (0..LOCK_STRIPES).map(|_| Mutex::new(())).collect(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn chunk_path(&self, digest: &Digest) -> PathBuf {
        let hex = digest.to_hex();
        self.strategy.bucket_dir(&self.root, &hex).join(hex)
    }

    fn meta_path(&self, digest: &Digest) -> PathBuf {
        let mut path = self.chunk_path(digest).into_os_string();
        path.push(".meta");
        PathBuf::from(path)
    }

    fn stripe(&self, digest: &Digest) -> &Mutex<()> {
        let index = digest.as_bytes().first().copied().unwrap_or(0) as usize % LOCK_STRIPES;
        &self.locks[index]
    }

    fn read_sidecar(&self, digest: &Digest) -> Result<Option<ChunkMetadata>> {
        let path = self.meta_path(digest);
        if !path.exists() {
            return Ok(None);
        }
        let file = File::open(&path).map_err(|e| SnugError::io("chunk_store.metadata", path.clone(), e))?;
        let metadata = serde_json::from_reader(BufReader::new(file))
            .map_err(|e| SnugError::InvalidFormat { reason: e.to_string() })?;
        Ok(Some(metadata))
    }

    fn write_sidecar_atomic(&self, digest: &Digest, metadata: &ChunkMetadata) -> Result<()> {
        let final_path = self.meta_path(digest);
        let temp_path = final_path.with_extension(format!(
            "meta.tmp.{}",
            SystemTime::now().duration_since(SystemTime::UNIX_EPOCH).unwrap().as_nanos()
        ));

        let file = File::create(&temp_path).map_err(|e| SnugError::io("chunk_store.write", temp_path.clone(), e))?;
        serde_json::to_writer(BufWriter::new(file), metadata)
            .map_err(|e| SnugError::InvalidFormat { reason: e.to_string() })?;

        std::fs::rename(&temp_path, &final_path).map_err(|e| SnugError::io("chunk_store.write", final_path, e))?;
        Ok(())
    }

    fn write_bytes_atomic(&self, digest: &Digest, bytes: &[u8]) -> Result<()> {
        let final_path = self.chunk_path(digest);
        if let Some(parent) = final_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| SnugError::io("chunk_store.write", parent.to_path_buf(), e))?;
        }

        let temp_path = final_path.with_extension(format!(
            "tmp.{}",
            SystemTime::now().duration_since(SystemTime::UNIX_EPOCH).unwrap().as_nanos()
        ));

        {
            let mut file = File::create(&temp_path).map_err(|e| SnugError::io("chunk_store.write", temp_path.clone(), e))?;
            file.write_all(bytes).map_err(|e| SnugError::io("chunk_store.write", temp_path.clone(), e))?;
            file.sync_all().map_err(|e| SnugError::io("chunk_store.write", temp_path.clone(), e))?;
        }

        std::fs::rename(&temp_path, &final_path).map_err(|e| SnugError::io("chunk_store.write", final_path, e))?;
        Ok(())
    }
}

impl ChunkStore for FsChunkStore {
    fn write(&self, digest: &Digest, bytes: &[u8], metadata: Option<ChunkMetadataUpdate>) -> Result<Digest> {
        // Serialize everything touching this digest's bytes/sidecar so two
        // concurrent writers of the same digest can't interleave a
        // half-written sidecar merge.
        let _guard = self.stripe(digest).lock().unwrap();

        let chunk_path = self.chunk_path(digest);
        if !chunk_path.exists() {
            self.write_bytes_atomic(digest, bytes)?;
        }

        if let Some(update) = metadata {
            let merged = match self.read_sidecar(digest)? {
                Some(mut existing) => {
                    existing.merge(&update);
                    existing
                }
                None => ChunkMetadata::new(digest, bytes.len() as u64, &update),
            };
            self.write_sidecar_atomic(digest, &merged)?;
        }

        Ok(digest.clone())
    }

    fn read(&self, digest: &Digest) -> Result<Option<Vec<u8>>> {
        let path = self.chunk_path(digest);
        if !path.exists() {
            return Ok(None);
        }
        let bytes = std::fs::read(&path).map_err(|e| SnugError::io("chunk_store.read", path, e))?;
        Ok(Some(bytes))
    }

    fn read_range(&self, digest: &Digest, offset: u64, length: u64) -> Result<Option<Vec<u8>>> {
        let path = self.chunk_path(digest);
        if !path.exists() {
            return Ok(None);
        }

        let file = File::open(&path).map_err(|e| SnugError::io("chunk_store.read_range", path.clone(), e))?;
        let size = file.metadata().map_err(|e| SnugError::io("chunk_store.read_range", path.clone(), e))?.len();

        if offset > size {
            return Err(SnugError::OutOfRange { offset, size });
        }

        let length = length.min(size - offset);
        let mut reader = BufReader::new(file);
        std::io::Seek::seek(&mut reader, std::io::SeekFrom::Start(offset))
            .map_err(|e| SnugError::io("chunk_store.read_range", path.clone(), e))?;

        let mut buf = vec![0u8; length as usize];
        reader
            .read_exact(&mut buf)
            .map_err(|e| SnugError::io("chunk_store.read_range", path, e))?;
        Ok(Some(buf))
    }

    fn exists(&self, digest: &Digest) -> Result<bool> {
        Ok(self.chunk_path(digest).exists())
    }

    fn size(&self, digest: &Digest) -> Result<Option<u64>> {
        let path = self.chunk_path(digest);
        if !path.exists() {
            return Ok(None);
        }
        let len = path.metadata().map_err(|e| SnugError::io("chunk_store.size", path, e))?.len();
        Ok(Some(len))
    }

    fn metadata(&self, digest: &Digest) -> Result<Option<ChunkMetadata>> {
        let _guard = self.stripe(digest).lock().unwrap();
        self.read_sidecar(digest)
    }

    fn delete(&self, digest: &Digest) -> Result<()> {
        let _guard = self.stripe(digest).lock().unwrap();

        let chunk_path = self.chunk_path(digest);
        if chunk_path.exists() {
            std::fs::remove_file(&chunk_path).map_err(|e| SnugError::io("chunk_store.delete", chunk_path, e))?;
        }

        let meta_path = self.meta_path(digest);
        if meta_path.exists() {
            std::fs::remove_file(&meta_path).map_err(|e| SnugError::io("chunk_store.delete", meta_path, e))?;
        }

        Ok(())
    }

    fn list_digests(&self) -> Result<Vec<Digest>> {
        let mut digests = Vec::new();
        for entry in walkdir::WalkDir::new(&self.root).min_depth(1) {
            let entry = entry.map_err(|e| SnugError::io("chunk_store.list_digests", self.root.clone(), e.into()))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy();
            if name.ends_with(".meta") || name.contains(".tmp.") {
                continue;
            }
            // The hex length alone determines the algorithm: SHA-256,
            // SHA-1, and MD5 digests have distinct, fixed hex widths, so no
            // sidecar lookup is needed to recover it.
            let Some(algorithm) = algorithm_for_hex_len(name.len()) else {
                continue;
            };
            if let Ok(digest) = Digest::from_hex(algorithm, &name) {
                digests.push(digest);
            }
        }
        Ok(digests)
    }
}

fn algorithm_for_hex_len(len: usize) -> Option<crate::digest::Algorithm> {
    use crate::digest::Algorithm;
    match len {
        64 => Some(Algorithm::Sha256),
        40 => Some(Algorithm::Sha1),
        32 => Some(Algorithm::Md5),
        _ => None,
    }
}
