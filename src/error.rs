//! The error kind table from the archive format design, realized as one
//! `thiserror`-derived enum. Every fallible core operation returns
//! `Result<T, SnugError>`; the CLI layer chains these with `anyhow::Context`.

use std::path::PathBuf;

use thiserror::Error;

use crate::digest::Digest;

/// A single error produced anywhere in the core. Each variant corresponds to
/// one row of the error kind table: it names the failing operation and,
/// where relevant, the offending path or digest.
#[derive(Debug, Error)]
pub enum SnugError {
    #[error("invalid archive format: {reason}")]
    InvalidFormat { reason: String },

    #[error("unsupported manifest version {found} (supported: {supported})")]
    VersionUnsupported { found: i64, supported: i64 },

    #[error("entry {path} references hash {digest} which is not present in the hashes table")]
    MissingHashReference { path: String, digest: String },

    #[error("bad path {path:?}: {reason}")]
    BadPath { path: String, reason: &'static str },

    #[error("path {path} escapes the extraction root")]
    PathEscape { path: String },

    #[error("chunk {digest} referenced by {path} is missing from the store")]
    MissingChunk { path: String, digest: Digest },

    #[error("integrity mismatch for digest {digest}: expected {expected} bytes, store reports {actual}")]
    IntegrityMismatch {
        digest: Digest,
        expected: String,
        actual: String,
    },

    #[error("digest {0} not found")]
    NotFound(Digest),

    #[error("storage unavailable: {reason}")]
    StorageUnavailable { reason: String },

    #[error("read out of range: offset {offset} exceeds chunk size {size}")]
    OutOfRange { offset: u64, size: u64 },

    #[error("permission denied: {path}")]
    PermissionDenied { path: PathBuf },

    #[error("broken symlink: {path} -> {target}")]
    BrokenSymlink { path: PathBuf, target: PathBuf },

    #[error("operation cancelled")]
    Cancelled,

    #[error("I/O error during {operation} on {path:?}: {source}")]
    Io {
        operation: &'static str,
        path: Option<PathBuf>,
        #[source]
        source: std::io::Error,
    },
}

impl SnugError {
    /// Wraps a raw I/O error with the operation and path that was being
    /// attempted, so the CLI can produce an "operation + offending path"
    /// diagnostic.
    pub fn io(operation: &'static str, path: impl Into<Option<PathBuf>>, source: std::io::Error) -> Self {
        SnugError::Io {
            operation,
            path: path.into(),
            source,
        }
    }

    /// True for the subset of kinds that are caller-recoverable via a
    /// single retry, or via an explicit opt-in
    /// (`skip_permission_errors`, `error_on_broken_symlinks=false`).
    pub fn is_transient(&self) -> bool {
        matches!(self, SnugError::Io { .. } | SnugError::StorageUnavailable { .. })
    }
}

pub type Result<T> = std::result::Result<T, SnugError>;
