use std::sync::Arc;

use anyhow::Result;
use assert_fs::prelude::*;
use assert_fs::TempDir;

use snug::chunk_store::{ChunkStore, FsChunkStore, OrganizationStrategy};
use snug::digest::Algorithm;
use snug::extractor::{ExtractOptions, Extractor};
use snug::manifest::ArchiveEntry;
use snug::validator::ValidationLevel;
use snug::{Archiver, ArchiverOptions, HashCache, Validator};

mod common;

#[test]
fn archive_then_extract_round_trips_through_the_public_api() -> Result<()> {
    let temp = TempDir::new()?;

    let source = temp.child("source");
    source.create_dir_all()?;
    source.child("notes.txt").write_str("first draft")?;
    source.child("nested").create_dir_all()?;
    source.child("nested/copy.txt").write_str("first draft")?; // duplicate content

    let store_dir = temp.child("store");
    let store: Arc<dyn ChunkStore> = Arc::new(FsChunkStore::new(store_dir.path(), OrganizationStrategy::default())?);

    let cache = HashCache::new(Algorithm::Sha256, 100);
    let archiver = Archiver::new(store.clone(), &cache, ArchiverOptions::default());

    let archive_path = temp.child("backup.snug");
    let manifest = archiver.run(source.path(), archive_path.path())?;

    // Two files, one distinct hash: the duplicate content is deduplicated.
    let file_count = manifest.entries.iter().filter(|e| matches!(e, ArchiveEntry::File { .. })).count();
    assert_eq!(file_count, 2);
    assert_eq!(manifest.hashes.len(), 1);

    let report = Validator::new(store.clone()).validate_manifest(&manifest, ValidationLevel::Strict)?;
    assert!(report.ok, "expected archive to validate cleanly: {report:?}");

    let restored = temp.child("restored");
    let bytes = std::fs::read(archive_path.path())?;
    Extractor::new(store, ExtractOptions::default()).extract(&bytes, restored.path())?;

    common::assert_trees_equal(source.path(), restored.path());

    Ok(())
}

#[test]
fn chunk_store_write_is_content_addressed_and_deduplicating() -> Result<()> {
    let dir = TempDir::new()?;
    let store = FsChunkStore::new(dir.path(), OrganizationStrategy::default())?;

    let digest = snug::digest::Hasher::hash_bytes(Algorithm::Sha256, b"same bytes");
    let update_a = snug::chunk_store::ChunkMetadataUpdate::for_path("a.txt", std::time::SystemTime::now());
    let update_b = snug::chunk_store::ChunkMetadataUpdate::for_path("b.txt", std::time::SystemTime::now());

    store.write(&digest, b"same bytes", Some(update_a))?;
    store.write(&digest, b"same bytes", Some(update_b))?;

    let meta = store.metadata(&digest)?.expect("chunk metadata should exist after write");
    assert_eq!(meta.original_paths.len(), 2, "both source paths should be recorded against the one chunk");
    assert_eq!(store.read(&digest)?.unwrap(), b"same bytes");

    Ok(())
}

#[test]
fn validator_flags_a_manifest_referencing_an_absent_chunk() -> Result<()> {
    let dir = TempDir::new()?;
    let store: Arc<dyn ChunkStore> = Arc::new(FsChunkStore::new(dir.path(), OrganizationStrategy::default())?);

    let digest = snug::digest::Hasher::hash_bytes(Algorithm::Sha256, b"never written to the store");
    let mut manifest = snug::manifest::ArchiveManifest::new(Algorithm::Sha256);
    manifest.register_hash(&digest, 27);
    manifest.entries.push(ArchiveEntry::File {
        path: "ghost.bin".into(),
        digest: digest.clone(),
        size: 27,
        attrs: Default::default(),
    });

    let report = Validator::new(store).validate_manifest(&manifest, ValidationLevel::Default)?;
    assert!(!report.ok);
    assert_eq!(report.missing, vec![digest]);

    Ok(())
}
