//! The archive manifest format: in-memory model plus the codec that
//! parses/emits its compressed wire form (in `codec`).

mod codec;

use std::collections::{BTreeMap, BTreeSet};
use std::time::SystemTime;

pub use codec::ManifestCodec;

use crate::digest::{Algorithm, Digest};
use crate::error::{Result, SnugError};

/// The literal format tag every manifest carries.
pub const FORMAT_TAG: &str = "snug";

/// Current manifest version this codec emits; the highest version this
/// codec can parse.
pub const CURRENT_VERSION: i64 = 1;

/// One key of the `hashes` anchor table: `{size, algorithm}`, keyed by
/// digest hex in [`ArchiveManifest::hashes`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HashTableEntry {
    pub size: u64,
    pub algorithm: Algorithm,
}

/// Optional default attributes factored out of repeated entries. An entry
/// whose own attribute is absent inherits the corresponding default
/// instead of a hardcoded fallback.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Defaults {
    pub owner: Option<String>,
    pub group: Option<String>,
    pub file_perms: Option<u32>,
    pub dir_perms: Option<u32>,
}

/// Attributes shared by all three entry variants.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CommonAttrs {
    pub permissions: Option<u32>,
    pub owner: Option<String>,
    pub group: Option<String>,
    pub modified: Option<SystemTime>,
    pub created: Option<SystemTime>,
    /// Fields present in the source document that this codec doesn't
    /// otherwise model. Preserved verbatim on parse and re-emitted
    /// unchanged.
    pub extra: BTreeMap<String, serde_yaml::Value>,
}

/// A tagged union of the three entry kinds. Modeled as a sum type rather
/// than a class hierarchy: no runtime polymorphism is needed and matching
/// on the variant is both clearer and cheaper.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ArchiveEntry {
    File {
        path: String,
        digest: Digest,
        size: u64,
        attrs: CommonAttrs,
    },
    Directory {
        path: String,
        attrs: CommonAttrs,
    },
    Symlink {
        path: String,
        symlink_target: String,
        attrs: CommonAttrs,
    },
}

impl ArchiveEntry {
    pub fn path(&self) -> &str {
        match self {
            ArchiveEntry::File { path, .. } => path,
            ArchiveEntry::Directory { path, .. } => path,
            ArchiveEntry::Symlink { path, .. } => path,
        }
    }

    pub fn attrs(&self) -> &CommonAttrs {
        match self {
            ArchiveEntry::File { attrs, .. } => attrs,
            ArchiveEntry::Directory { attrs, .. } => attrs,
            ArchiveEntry::Symlink { attrs, .. } => attrs,
        }
    }

    /// A relative, non-empty, `..`-free, non-absolute forward-slash path.
    pub fn validate_path(&self) -> Result<()> {
        validate_path_str(self.path())
    }
}

/// Shared path-safety check used by both the manifest well-formedness
/// invariant and the extractor's stricter escape check.
pub fn validate_path_str(path: &str) -> Result<()> {
    if path.is_empty() {
        return Err(SnugError::BadPath {
            path: path.to_string(),
            reason: "path is empty",
        });
    }
    if path.starts_with('/') {
        return Err(SnugError::BadPath {
            path: path.to_string(),
            reason: "path is absolute",
        });
    }
    if path.split('/').any(|segment| segment == "..") {
        return Err(SnugError::BadPath {
            path: path.to_string(),
            reason: "path contains a `..` segment",
        });
    }
    Ok(())
}

/// The in-memory, fully-resolved manifest.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ArchiveManifest {
    pub version: i64,
    pub hash_algorithm: Algorithm,
    pub hashes: BTreeMap<String, HashTableEntry>,
    pub defaults: Option<Defaults>,
    pub entries: Vec<ArchiveEntry>,
}

impl ArchiveManifest {
    pub fn new(hash_algorithm: Algorithm) -> Self {
        Self {
            version: CURRENT_VERSION,
            hash_algorithm,
            hashes: BTreeMap::new(),
            defaults: None,
            entries: Vec::new(),
        }
    }

    /// Registers a digest in the anchor table if not already present.
    pub fn register_hash(&mut self, digest: &Digest, size: u64) {
        self.hashes
            .entry(digest.to_hex())
            .or_insert(HashTableEntry { size, algorithm: digest.algorithm });
    }

    /// Checks the well-formedness invariant: every `File.digest` is a key
    /// in `hashes`, every path is unique, and every path passes the safety
    /// check.
    pub fn validate(&self) -> Result<()> {
        let mut seen_paths = BTreeSet::new();

        for entry in &self.entries {
            entry.validate_path()?;

            if !seen_paths.insert(entry.path().to_string()) {
                return Err(SnugError::InvalidFormat {
                    reason: format!("duplicate entry path: {}", entry.path()),
                });
            }

            if let ArchiveEntry::File { digest, .. } = entry {
                if !self.hashes.contains_key(&digest.to_hex()) {
                    return Err(SnugError::MissingHashReference {
                        path: entry.path().to_string(),
                        digest: digest.to_hex(),
                    });
                }
            }
        }

        Ok(())
    }
}
