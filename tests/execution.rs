use anyhow::Result;
use assert_cmd::Command;
use assert_fs::fixture::ChildPath;
use assert_fs::prelude::*;
use assert_fs::TempDir;

mod common;

fn fixture(setup_origin: fn(&ChildPath) -> Result<()>) -> Result<()> {
    let temp = TempDir::new()?;

    let origin = temp.child("origin");
    origin.create_dir_all()?;
    setup_origin(&origin)?;

    let store = temp.child("store");
    let archive = temp.child("archive.snug");
    let restored = temp.child("restored");

    Command::new(&*common::BIN_PATH)
        .env("SNUG_STORAGE", store.path())
        .arg("archive")
        .arg(origin.path())
        .arg(archive.path())
        .assert()
        .success();

    archive.assert(predicates::path::is_file());

    Command::new(&*common::BIN_PATH)
        .env("SNUG_STORAGE", store.path())
        .arg("extract")
        .arg(archive.path())
        .arg(restored.path())
        .assert()
        .success();

    common::assert_trees_equal(origin.path(), restored.path());

    Command::new(&*common::BIN_PATH)
        .env("SNUG_STORAGE", store.path())
        .arg("validate")
        .arg("--strict")
        .arg(archive.path())
        .assert()
        .success();

    Ok(())
}

#[test]
fn empty_dir() -> Result<()> {
    fixture(|_origin| Ok(()))
}

#[test]
fn nested_subdirectories() -> Result<()> {
    fixture(|origin| {
        origin.child("a/b/c").create_dir_all()?;
        origin.child("a/b/c/leaf.txt").write_str("leaf")?;
        origin.child("a/sibling.txt").write_str("sibling")?;
        Ok(())
    })
}

#[test]
fn duplicate_file_contents_are_deduplicated() -> Result<()> {
    fixture(|origin| {
        origin.child("x").create_dir_all()?;
        origin.child("y").create_dir_all()?;
        origin.child("x/a.bin").write_str("same content")?;
        origin.child("y/b.bin").write_str("same content")?;
        Ok(())
    })
}

#[cfg(unix)]
#[test]
fn symlinks_round_trip() -> Result<()> {
    fixture(|origin| {
        origin.child("real.txt").write_str("data")?;
        std::os::unix::fs::symlink("real.txt", origin.child("link").path())?;
        Ok(())
    })
}

#[test]
fn list_prints_one_path_per_entry() -> Result<()> {
    let temp = TempDir::new()?;
    let origin = temp.child("origin");
    origin.create_dir_all()?;
    origin.child("a.txt").write_str("hello")?;

    let store = temp.child("store");
    let archive = temp.child("archive.snug");

    Command::new(&*common::BIN_PATH)
        .env("SNUG_STORAGE", store.path())
        .arg("archive")
        .arg(origin.path())
        .arg(archive.path())
        .assert()
        .success();

    Command::new(&*common::BIN_PATH)
        .arg("list")
        .arg(archive.path())
        .assert()
        .success()
        .stdout(predicates::str::contains("a.txt"));

    Ok(())
}

#[test]
fn info_reports_format_and_algorithm() -> Result<()> {
    let temp = TempDir::new()?;
    let origin = temp.child("origin");
    origin.create_dir_all()?;
    origin.child("a.txt").write_str("hello")?;

    let store = temp.child("store");
    let archive = temp.child("archive.snug");

    Command::new(&*common::BIN_PATH)
        .env("SNUG_STORAGE", store.path())
        .arg("archive")
        .arg(origin.path())
        .arg(archive.path())
        .assert()
        .success();

    Command::new(&*common::BIN_PATH)
        .arg("info")
        .arg(archive.path())
        .assert()
        .success()
        .stdout(predicates::str::contains("sha256"));

    Ok(())
}

#[test]
fn validate_reports_missing_chunk_and_fails() -> Result<()> {
    let temp = TempDir::new()?;
    let origin = temp.child("origin");
    origin.create_dir_all()?;
    origin.child("a.txt").write_str("hello")?;

    let store = temp.child("store");
    let archive = temp.child("archive.snug");

    Command::new(&*common::BIN_PATH)
        .env("SNUG_STORAGE", store.path())
        .arg("archive")
        .arg(origin.path())
        .arg(archive.path())
        .assert()
        .success();

    // Point at an empty, unrelated store: every chunk now appears missing.
    let other_store = temp.child("other-store");
    other_store.create_dir_all()?;

    Command::new(&*common::BIN_PATH)
        .env("SNUG_STORAGE", other_store.path())
        .arg("validate")
        .arg(archive.path())
        .assert()
        .failure();

    Ok(())
}
