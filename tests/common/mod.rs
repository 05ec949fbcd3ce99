use std::collections::BTreeSet;
use std::path::Path;
use std::path::PathBuf;

use lazy_static::lazy_static;

pub const BIN_NAME: &str = "snug";

lazy_static! {
    pub static ref BIN_PATH: PathBuf = assert_cmd::cargo::cargo_bin(BIN_NAME);
}

/// Recursively compares two directory trees for structural and content
/// equality: same relative paths, same file bytes, same symlink targets.
/// Used by the CLI round-trip tests in place of a dedicated diff crate.
pub fn assert_trees_equal(left: &Path, right: &Path) {
    let left_entries = list_relative(left);
    let right_entries = list_relative(right);
    assert_eq!(left_entries, right_entries, "directory trees have different entries");

    for rel in left_entries {
        let l = left.join(&rel);
        let r = right.join(&rel);
        let l_meta = std::fs::symlink_metadata(&l).unwrap();
        let r_meta = std::fs::symlink_metadata(&r).unwrap();

        if l_meta.file_type().is_symlink() {
            assert!(r_meta.file_type().is_symlink(), "{rel} is a symlink only on one side");
            assert_eq!(std::fs::read_link(&l).unwrap(), std::fs::read_link(&r).unwrap(), "symlink target mismatch at {rel}");
        } else if l_meta.is_dir() {
            assert!(r_meta.is_dir(), "{rel} is a directory only on one side");
        } else {
            assert_eq!(std::fs::read(&l).unwrap(), std::fs::read(&r).unwrap(), "file content mismatch at {rel}");
        }
    }
}

fn list_relative(root: &Path) -> BTreeSet<String> {
    walkdir::WalkDir::new(root)
        .min_depth(1)
        .follow_links(false)
        .into_iter()
        .map(|entry| entry.unwrap())
        .map(|entry| entry.path().strip_prefix(root).unwrap().to_string_lossy().replace('\\', "/"))
        .collect()
}
