//! Drives `TreeWalker` + `Hasher` + `ChunkStore` + `ManifestCodec` to
//! produce an archive.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use rayon::prelude::*;

use crate::chunk_store::{ChunkMetadataUpdate, ChunkStore};
use crate::digest::{Algorithm, Digest, Hasher};
use crate::error::{Result, SnugError};
use crate::hash_cache::{FileStat, HashCache};
use crate::ignore::IgnoreMatcher;
use crate::manifest::{ArchiveEntry, ArchiveManifest, CommonAttrs, ManifestCodec};
use crate::walker::{EntryStat, TreeWalker, WalkEntry, WalkOptions};

/// Closed set of options the archiver accepts, layered on top of
/// [`WalkOptions`].
#[derive(Clone, Debug)]
pub struct ArchiverOptions {
    /// Only `Sha256` and `Sha1` are valid primary write-time algorithms;
    /// `Md5` is rejected by [`Archiver::run`].
    pub hash_algorithm: Algorithm,
    pub walk_options: WalkOptions,
    pub ignore_patterns: Vec<String>,
    /// Bounded fan-out for hashing/writing: defaults to the number of CPU
    /// cores times two, but is configurable.
    pub concurrency: usize,
}

impl Default for ArchiverOptions {
    fn default() -> Self {
        let cores = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4);
        Self {
            hash_algorithm: Algorithm::Sha256,
            walk_options: WalkOptions::default(),
            ignore_patterns: Vec::new(),
            concurrency: cores * 2,
        }
    }
}

/// One entry's contribution to the manifest, plus the `(digest, size)` pair
/// to register in the `hashes` table if this entry carries content.
type BuiltEntry = (ArchiveEntry, Option<(Digest, u64)>);

/// Top-level driver for producing an archive from a source tree. Holds no
/// state across runs beyond the shared `HashCache`; a fresh `Archiver` can
/// be built per call or reused across many.
pub struct Archiver<'a> {
    store: Arc<dyn ChunkStore>,
    hash_cache: &'a HashCache,
    options: ArchiverOptions,
    cancelled: Arc<AtomicBool>,
}

impl<'a> Archiver<'a> {
    pub fn new(store: Arc<dyn ChunkStore>, hash_cache: &'a HashCache, options: ArchiverOptions) -> Self {
        Self {
            store,
            hash_cache,
            options,
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Requests cooperative cancellation. The archiver stops submitting new
    /// work and awaits in-flight hashes and chunk writes already dispatched
    /// to the thread pool; already-written chunks are retained but the
    /// manifest file is not written.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Walks `root`, builds the manifest, and writes it atomically to
    /// `output_path`. The `entries` order of the returned manifest is the
    /// tree's walk order regardless of how many files were hashed
    /// concurrently.
    pub fn run(&self, root: &Path, output_path: &Path) -> Result<ArchiveManifest> {
        if !self.options.hash_algorithm.is_valid_primary() {
            return Err(SnugError::InvalidFormat {
                reason: format!(
                    "{} is not a valid primary archive digest (only sha256 and sha1 are)",
                    self.options.hash_algorithm
                ),
            });
        }

        let ignore = IgnoreMatcher::new(&self.options.ignore_patterns);
        let walker = TreeWalker::new(root, self.options.walk_options.clone(), &ignore);
        let walked = walker.walk()?;

        let built = self.build_all(&walked)?;

        if self.cancelled.load(Ordering::SeqCst) {
            return Err(SnugError::Cancelled);
        }

        let mut manifest = ArchiveManifest::new(self.options.hash_algorithm);
        for (entry, hash_info) in built.into_iter().flatten() {
            if let Some((digest, size)) = hash_info {
                manifest.register_hash(&digest, size);
            }
            manifest.entries.push(entry);
        }
        manifest.validate()?;

        let bytes = ManifestCodec::emit(&manifest)?;
        write_atomic(output_path, &bytes)?;

        Ok(manifest)
    }

    /// Fans out over the walked entries with a bounded thread pool. Falls
    /// back to the global rayon pool if a dedicated pool of the configured
    /// size cannot be built (e.g. a prior call already pinned the global
    /// pool's size); either way, `entries` order is preserved because
    /// `par_iter().map(...).collect()` keeps each item's position.
    fn build_all(&self, entries: &[WalkEntry]) -> Result<Vec<Option<BuiltEntry>>> {
        let work = || entries.par_iter().map(|entry| self.build_entry(entry)).collect();

        match rayon::ThreadPoolBuilder::new().num_threads(self.options.concurrency.max(1)).build() {
            Ok(pool) => pool.install(work),
            Err(_) => work(),
        }
    }

    fn build_entry(&self, entry: &WalkEntry) -> Result<Option<BuiltEntry>> {
        if self.cancelled.load(Ordering::SeqCst) {
            return Err(SnugError::Cancelled);
        }

        match entry {
            WalkEntry::Directory { rel_path, stat, .. } => Ok(Some((
                ArchiveEntry::Directory {
                    path: rel_path.clone(),
                    attrs: attrs_from_stat(stat),
                },
                None,
            ))),
            WalkEntry::Symlink { rel_path, stat, target, .. } => Ok(Some((
                ArchiveEntry::Symlink {
                    path: rel_path.clone(),
                    symlink_target: target.to_string_lossy().into_owned(),
                    attrs: attrs_from_stat(stat),
                },
                None,
            ))),
            WalkEntry::Regular { rel_path, full_path, stat } => {
                match self.archive_regular_file(rel_path, full_path, stat) {
                    Ok(built) => Ok(Some(built)),
                    Err(err) if self.options.walk_options.skip_permission_errors && is_permission_kind(&err) => {
                        log::warn!("skipping {rel_path}: {err}");
                        Ok(None)
                    }
                    Err(err) => Err(err),
                }
            }
            WalkEntry::Special { rel_path, kind, .. } => {
                if !self.options.walk_options.include_special_files {
                    return Ok(None);
                }
                // "do not hash": the underlying device/socket content is
                // never read, so it is treated as the canonical empty chunk.
                let digest = Hasher::hash_bytes(self.options.hash_algorithm, b"");
                let update = ChunkMetadataUpdate {
                    original_filename: Some(basename(rel_path)),
                    original_paths: std::iter::once(rel_path.clone()).collect(),
                    created: SystemTime::now(),
                    modified: SystemTime::now(),
                    content_type: None,
                    chunk_type: Some(format!("special:{kind:?}")),
                    compression_info: None,
                };
                with_retry(|| self.store.write(&digest, b"", Some(update.clone())))?;
                Ok(Some((
                    ArchiveEntry::File {
                        path: rel_path.clone(),
                        digest: digest.clone(),
                        size: 0,
                        attrs: CommonAttrs::default(),
                    },
                    Some((digest, 0)),
                )))
            }
        }
    }

    fn archive_regular_file(&self, rel_path: &str, full_path: &Path, stat: &EntryStat) -> Result<BuiltEntry> {
        let file_stat = FileStat { size: stat.size, modified: stat.modified };

        let bytes = with_retry(|| {
            std::fs::read(full_path).map_err(|e| SnugError::io("archiver.read_file", full_path.to_path_buf(), e))
        })?;

        let digest = match self.hash_cache.get(Path::new(rel_path), file_stat) {
            Some(digest) => digest,
            None => {
                let digest = Hasher::hash_bytes(self.options.hash_algorithm, &bytes);
                self.hash_cache.put(rel_path.to_string(), digest.clone(), file_stat);
                digest
            }
        };

        let update = ChunkMetadataUpdate {
            original_filename: Some(basename(rel_path)),
            original_paths: std::iter::once(rel_path.to_string()).collect(),
            created: stat.created,
            modified: stat.modified,
            content_type: None,
            chunk_type: None,
            compression_info: None,
        };
        with_retry(|| self.store.write(&digest, &bytes, Some(update.clone())))?;

        Ok((
            ArchiveEntry::File {
                path: rel_path.to_string(),
                digest: digest.clone(),
                size: bytes.len() as u64,
                attrs: attrs_from_stat(stat),
            },
            Some((digest, bytes.len() as u64)),
        ))
    }
}

fn attrs_from_stat(stat: &EntryStat) -> CommonAttrs {
    CommonAttrs {
        permissions: Some(stat.permissions_mode),
        owner: None,
        group: None,
        modified: Some(stat.modified),
        created: Some(stat.created),
        extra: BTreeMap::new(),
    }
}

fn basename(rel_path: &str) -> String {
    rel_path.rsplit('/').next().unwrap_or(rel_path).to_string()
}

fn is_permission_kind(err: &SnugError) -> bool {
    matches!(err, SnugError::PermissionDenied { .. })
        || matches!(err, SnugError::Io { source, .. } if source.kind() == std::io::ErrorKind::PermissionDenied)
}

/// Retries a fallible operation once if its error is transient, then
/// surfaces the error.
fn with_retry<T>(mut f: impl FnMut() -> Result<T>) -> Result<T> {
    match f() {
        Ok(value) => Ok(value),
        Err(err) if err.is_transient() => f(),
        Err(err) => Err(err),
    }
}

/// Crash-safe write of the manifest file: temp sibling + fsync + rename,
/// matching the chunk store's own atomicity discipline.
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(|e| SnugError::io("archiver.write_manifest", parent.to_path_buf(), e))?;
        }
    }

    let temp_path: PathBuf = path.with_extension(format!(
        "tmp.{}",
        SystemTime::now().duration_since(SystemTime::UNIX_EPOCH).unwrap().as_nanos()
    ));

    {
        use std::io::Write;
        let mut file =
            std::fs::File::create(&temp_path).map_err(|e| SnugError::io("archiver.write_manifest", temp_path.clone(), e))?;
        file.write_all(bytes).map_err(|e| SnugError::io("archiver.write_manifest", temp_path.clone(), e))?;
        file.sync_all().map_err(|e| SnugError::io("archiver.write_manifest", temp_path.clone(), e))?;
    }

    std::fs::rename(&temp_path, path).map_err(|e| SnugError::io("archiver.write_manifest", path.to_path_buf(), e))?;
    Ok(())
}
