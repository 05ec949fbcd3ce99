//! Re-reads a manifest and checks referenced hashes exist, optionally
//! re-hashing the bytes on read.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::chunk_store::ChunkStore;
use crate::digest::{Digest, Hasher};
use crate::error::Result;
use crate::manifest::{ArchiveEntry, ArchiveManifest, ManifestCodec};

/// How thoroughly [`Validator::validate`] inspects the store.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ValidationLevel {
    /// Parse only; confirm hash references resolve and paths are safe. No
    /// store access.
    Quick,
    /// Quick, plus `store.exists(digest)` for each referenced digest.
    Default,
    /// Default, plus a full read and streaming re-hash of every chunk.
    Strict,
}

/// Structured report returned by [`Validator::validate`]. Never raised as
/// an error itself: validation failures are data, not exceptions.
#[derive(Clone, Debug, Default)]
pub struct ValidationReport {
    pub ok: bool,
    pub missing: Vec<Digest>,
    pub mismatched: Vec<Digest>,
    pub bad_paths: Vec<String>,
    pub counts: ValidationCounts,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct ValidationCounts {
    pub entries: usize,
    pub files: usize,
    pub dirs: usize,
    pub symlinks: usize,
}

pub struct Validator {
    store: Arc<dyn ChunkStore>,
    cancelled: Arc<AtomicBool>,
}

impl Validator {
    pub fn new(store: Arc<dyn ChunkStore>) -> Self {
        Self { store, cancelled: Arc::new(AtomicBool::new(false)) }
    }

    /// Immediately cancellable between entry checks.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Parses `archive_bytes` and validates at `level`. Throws only on
    /// parser failure or an unrecoverable store I/O error; a validation
    /// failure is reported in the returned [`ValidationReport`], not raised.
    pub fn validate(&self, archive_bytes: &[u8], level: ValidationLevel) -> Result<ValidationReport> {
        let manifest = ManifestCodec::parse(archive_bytes)?;
        self.validate_manifest(&manifest, level)
    }

    /// Validates an already-parsed manifest.
    pub fn validate_manifest(&self, manifest: &ArchiveManifest, level: ValidationLevel) -> Result<ValidationReport> {
        let mut report = ValidationReport { ok: true, ..Default::default() };

        for entry in &manifest.entries {
            if self.cancelled.load(Ordering::SeqCst) {
                return Err(crate::error::SnugError::Cancelled);
            }

            report.counts.entries += 1;
            match entry {
                ArchiveEntry::Directory { .. } => report.counts.dirs += 1,
                ArchiveEntry::Symlink { .. } => report.counts.symlinks += 1,
                ArchiveEntry::File { .. } => report.counts.files += 1,
            }

            if entry.validate_path().is_err() {
                report.bad_paths.push(entry.path().to_string());
                report.ok = false;
            }

            let ArchiveEntry::File { digest, size, .. } = entry else {
                continue;
            };

            if !manifest.hashes.contains_key(&digest.to_hex()) {
                // Already rejected at parse time in practice (the codec
                // enforces well-formedness), but a hand-built in-memory
                // manifest could still reach here.
                report.missing.push(digest.clone());
                report.ok = false;
                continue;
            }

            if level == ValidationLevel::Quick {
                continue;
            }

            if !self.store.exists(digest)? {
                report.missing.push(digest.clone());
                report.ok = false;
                continue;
            }

            if level == ValidationLevel::Default {
                continue;
            }

            match self.store.read(digest)? {
                None => {
                    report.missing.push(digest.clone());
                    report.ok = false;
                }
                Some(bytes) => {
                    let recomputed = Hasher::hash_bytes(digest.algorithm, &bytes);
                    if recomputed != *digest || bytes.len() as u64 != *size {
                        report.mismatched.push(digest.clone());
                        report.ok = false;
                    }
                }
            }
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk_store::{FsChunkStore, OrganizationStrategy};
    use crate::digest::Algorithm;
    use crate::manifest::CommonAttrs;

    fn manifest_with_one_file(bytes: &[u8]) -> (ArchiveManifest, Digest) {
        let digest = Hasher::hash_bytes(Algorithm::Sha256, bytes);
        let mut manifest = ArchiveManifest::new(Algorithm::Sha256);
        manifest.register_hash(&digest, bytes.len() as u64);
        manifest.entries.push(ArchiveEntry::File {
            path: "a.txt".into(),
            digest: digest.clone(),
            size: bytes.len() as u64,
            attrs: CommonAttrs::default(),
        });
        (manifest, digest)
    }

    #[test]
    fn strict_detects_tampered_bytes() {
        let dir = assert_fs::TempDir::new().unwrap();
        let store = Arc::new(FsChunkStore::new(dir.path(), OrganizationStrategy::default()).unwrap());

        let (manifest, digest) = manifest_with_one_file(b"hello");
        store.write(&digest, b"jello", None).unwrap(); // tampered: wrong bytes under the same name

        let validator = Validator::new(store);
        let strict = validator.validate_manifest(&manifest, ValidationLevel::Strict).unwrap();
        assert!(!strict.ok);
        assert_eq!(strict.mismatched, vec![digest.clone()]);

        let default_report = validator.validate_manifest(&manifest, ValidationLevel::Default).unwrap();
        assert!(default_report.ok); // existence-only check can't see the tamper
    }

    #[test]
    fn default_level_reports_missing_chunks_without_reading() {
        let dir = assert_fs::TempDir::new().unwrap();
        let store = Arc::new(FsChunkStore::new(dir.path(), OrganizationStrategy::default()).unwrap());

        let (manifest, digest) = manifest_with_one_file(b"never stored");

        let validator = Validator::new(store);
        let report = validator.validate_manifest(&manifest, ValidationLevel::Default).unwrap();
        assert!(!report.ok);
        assert_eq!(report.missing, vec![digest]);
    }

    #[test]
    fn quick_level_never_touches_the_store() {
        let dir = assert_fs::TempDir::new().unwrap();
        let store = Arc::new(FsChunkStore::new(dir.path(), OrganizationStrategy::default()).unwrap());

        let (manifest, _digest) = manifest_with_one_file(b"irrelevant");
        let validator = Validator::new(store);
        let report = validator.validate_manifest(&manifest, ValidationLevel::Quick).unwrap();
        assert!(report.ok);
        assert_eq!(report.counts.files, 1);
    }
}
