//! # snug
//!
//! [![badge github]][url github]
//! [![badge crates.io]][url crates.io]
//! [![badge docs.rs]][url docs.rs]
//! [![badge license]][url license]
//!
//! [//]: # (@formatter:off)
//! [badge github]: https://img.shields.io/badge/github-FloGa%2Fsnug-green
//! [badge crates.io]: https://img.shields.io/crates/v/snug
//! [badge docs.rs]: https://img.shields.io/docsrs/snug
//! [badge license]: https://img.shields.io/crates/l/snug
//!
//! [url github]: https://github.com/FloGa/snug
//! [url crates.io]: https://crates.io/crates/snug
//! [url docs.rs]: https://docs.rs/snug
//! [url license]: https://github.com/FloGa/snug/blob/develop/LICENSE
//! [//]: # (@formatter:on)
//!
//! > A content-addressable archive engine: walks a source tree into a
//! > deduplicating chunk store and a small compressed manifest, and
//! > faithfully replays that manifest back into a tree.
//!
//! *snug* splits a directory tree into a tiny manifest file (the archive)
//! and a separate, deduplicating chunk store keyed by content hash. Two or
//! more archives that share files share chunks too, so the store only ever
//! holds one copy of any given byte sequence. The manifest itself stays
//! small (kilobytes, gzip-compressed) because it never carries file
//! content, only digests, paths, and attributes.
//!
//! This crate is split into an [Application](#application) part and a
//! [Library](#library) part.
//!
//! ## Application
//!
//! ### Installation
//!
//! ```shell
//! cargo install --locked snug
//! ```
//!
//! ### Usage
//!
//! ```shell
//! snug archive ./photos ./photos.snug
//! snug extract ./photos.snug ./restored
//! snug validate ./photos.snug --strict
//! snug list ./photos.snug
//! ```
//!
//! Chunk bytes are written under the directory named by `SNUG_STORAGE`, or
//! `~/.snug/config.yaml`'s `store_root` key if the environment variable is
//! unset.
//!
//! ## Library
//!
//! ### Installation
//!
//! ```shell
//! cargo add snug
//! ```
//!
//! ### Usage
//!
//! ```rust no_run
//! use std::sync::Arc;
//!
//! use snug::archiver::{Archiver, ArchiverOptions};
//! use snug::chunk_store::{FsChunkStore, OrganizationStrategy};
//! use snug::hash_cache::HashCache;
//! use snug::digest::Algorithm;
//!
//! fn main() -> anyhow::Result<()> {
//!     let store = Arc::new(FsChunkStore::new("store", OrganizationStrategy::default())?);
//!     let cache = HashCache::new(Algorithm::Sha256, 10_000);
//!
//!     let archiver = Archiver::new(store, &cache, ArchiverOptions::default());
//!     archiver.run("source".as_ref(), "archive.snug".as_ref())?;
//!
//!     Ok(())
//! }
//! ```

pub mod archiver;
pub mod chunk_store;
pub mod digest;
pub mod error;
pub mod extractor;
pub mod hash_cache;
pub mod ignore;
pub mod manifest;
mod time_serde;
pub mod validator;
pub mod walker;

pub use archiver::{Archiver, ArchiverOptions};
pub use chunk_store::{ChunkStore, FsChunkStore, MirroredStore};
pub use digest::{Algorithm, Digest, Hasher};
pub use error::{Result, SnugError};
pub use extractor::{ExtractOptions, Extractor};
pub use hash_cache::HashCache;
pub use ignore::IgnoreMatcher;
pub use manifest::{ArchiveEntry, ArchiveManifest, ManifestCodec};
pub use validator::{ValidationLevel, ValidationReport, Validator};
pub use walker::{TreeWalker, WalkOptions};
