//! Enumerates a tree, classifies entries, and applies ignore/symlink
//! policy. Built on `walkdir`.

use std::collections::HashSet;
use std::fs::Metadata;
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use crate::error::{Result, SnugError};
use crate::ignore::IgnoreMatcher;

/// Metadata captured for a walked entry: just what downstream code needs
/// (size, mtime, permissions), not a full platform `Metadata`.
#[derive(Clone, Debug)]
pub struct EntryStat {
    pub size: u64,
    pub modified: std::time::SystemTime,
    pub created: std::time::SystemTime,
    pub permissions_mode: u32,
}

impl EntryStat {
    fn from_metadata(metadata: &Metadata) -> Self {
        Self {
            size: metadata.len(),
            modified: metadata.modified().unwrap_or(std::time::SystemTime::UNIX_EPOCH),
            created: metadata.created().unwrap_or_else(|_| metadata.modified().unwrap_or(std::time::SystemTime::UNIX_EPOCH)),
            permissions_mode: file_mode(metadata),
        }
    }
}

#[cfg(unix)]
fn file_mode(metadata: &Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn file_mode(metadata: &Metadata) -> u32 {
    if metadata.permissions().readonly() {
        0o444
    } else {
        0o644
    }
}

/// A non-regular, non-directory, non-symlink filesystem object: block/char
/// device, socket, or FIFO.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SpecialKind {
    BlockDevice,
    CharDevice,
    Socket,
    Fifo,
}

/// One entry emitted by the walker.
#[derive(Debug)]
pub enum WalkEntry {
    Regular { rel_path: String, full_path: PathBuf, stat: EntryStat },
    Directory { rel_path: String, full_path: PathBuf, stat: EntryStat },
    Symlink { rel_path: String, full_path: PathBuf, stat: EntryStat, target: PathBuf },
    Special { rel_path: String, full_path: PathBuf, kind: SpecialKind },
}

impl WalkEntry {
    pub fn rel_path(&self) -> &str {
        match self {
            WalkEntry::Regular { rel_path, .. }
            | WalkEntry::Directory { rel_path, .. }
            | WalkEntry::Symlink { rel_path, .. }
            | WalkEntry::Special { rel_path, .. } => rel_path,
        }
    }
}

/// The closed enumeration of recognized walker options.
#[derive(Clone, Debug)]
pub struct WalkOptions {
    pub base_path: Option<String>,
    pub follow_symlinks: bool,
    pub error_on_broken_symlinks: bool,
    pub include_special_files: bool,
    pub skip_permission_errors: bool,
    pub skip_hidden_files: bool,
}

impl Default for WalkOptions {
    fn default() -> Self {
        Self {
            base_path: None,
            follow_symlinks: false,
            error_on_broken_symlinks: false,
            include_special_files: false,
            skip_permission_errors: false,
            skip_hidden_files: false,
        }
    }
}

/// Walks `root`, emitting entries in depth-first, lexicographic-within-
/// directory order.
pub struct TreeWalker<'a> {
    root: PathBuf,
    options: WalkOptions,
    ignore: &'a IgnoreMatcher,
}

impl<'a> TreeWalker<'a> {
    pub fn new(root: impl Into<PathBuf>, options: WalkOptions, ignore: &'a IgnoreMatcher) -> Self {
        Self { root: root.into(), options, ignore }
    }

    /// Walks the tree and returns every non-ignored entry in walk order.
    ///
    /// When `follow_symlinks` is set, `walkdir` itself is told to follow
    /// links (`follow_links(true)`) so it actually recurses into a
    /// symlinked directory's children rather than stopping at the link;
    /// cycle detection is then layered on top via
    /// [`walkdir::IntoIter::skip_current_dir`], keyed by the canonicalized
    /// path of every directory reached through a symlink (a plain,
    /// non-symlinked subdirectory can never introduce a cycle on its own).
    /// When unset, `walkdir` never follows links, so a symlink is always
    /// reported as a leaf [`WalkEntry::Symlink`] with its raw, unresolved
    /// target string.
    pub fn walk(&self) -> Result<Vec<WalkEntry>> {
        let mut entries = Vec::new();
        let mut entered_canonical_dirs: HashSet<PathBuf> = HashSet::new();
        let follow = self.options.follow_symlinks;

        // Seed with the root itself: a symlink that loops back to any
        // directory already on the path from the root (most commonly the
        // root itself) must be caught on its first re-entry, not its second.
        if follow {
            if let Ok(canonical_root) = std::fs::canonicalize(&self.root) {
                entered_canonical_dirs.insert(canonical_root);
            }
        }

        let mut walker = WalkDir::new(&self.root)
            .min_depth(1)
            .follow_links(follow)
            .sort_by_file_name()
            .into_iter();

        while let Some(step) = walker.next() {
            let dir_entry = match step {
                Ok(entry) => entry,
                Err(err) => {
                    let io_kind = err.io_error().map(|e| e.kind());
                    if follow && io_kind == Some(std::io::ErrorKind::NotFound) {
                        // `fs::metadata` on a broken symlink fails this way
                        // when walkdir tries to follow it.
                        let path = err.path().map(Path::to_path_buf).unwrap_or_default();
                        let target = std::fs::read_link(&path).unwrap_or_default();
                        if self.options.error_on_broken_symlinks {
                            return Err(SnugError::BrokenSymlink { path, target });
                        }
                        log::warn!("skipping broken symlink: {}", path.display());
                        continue;
                    }
                    if is_permission_error(&err) && self.options.skip_permission_errors {
                        log::warn!("skipping unreadable entry: {err}");
                        continue;
                    }
                    return Err(SnugError::io("tree_walker.walk", err.path().map(Path::to_path_buf), err.into()));
                }
            };

            let full_path = dir_entry.path().to_path_buf();
            let basename = dir_entry.file_name().to_string_lossy();

            if self.options.skip_hidden_files && basename.starts_with('.') {
                if dir_entry.file_type().is_dir() {
                    walker.skip_current_dir();
                }
                continue;
            }

            let rel_path = self.relative_path(&full_path)?;
            let is_symlink = dir_entry.path_is_symlink();

            // Not following: walkdir reports the raw (unresolved) type, so
            // a symlink always shows up here regardless of what it points
            // to. Preserve it as a leaf entry and never recurse into it.
            if is_symlink && !follow {
                if self.ignore.is_ignored(&rel_path, false) {
                    continue;
                }

                let target = std::fs::read_link(&full_path).map_err(|e| SnugError::io("tree_walker.read_link", full_path.clone(), e))?;
                let resolved = full_path.parent().unwrap_or(&self.root).join(&target);

                if !resolved.exists() {
                    if self.options.error_on_broken_symlinks {
                        return Err(SnugError::BrokenSymlink { path: full_path, target });
                    }
                    log::warn!("skipping broken symlink: {}", full_path.display());
                    continue;
                }

                let metadata = std::fs::symlink_metadata(&full_path).map_err(|e| SnugError::io("tree_walker.stat", full_path.clone(), e))?;
                entries.push(WalkEntry::Symlink {
                    rel_path,
                    full_path,
                    stat: EntryStat::from_metadata(&metadata),
                    target,
                });
                continue;
            }

            // Either a plain entry, or a followed symlink: walkdir has
            // already resolved `file_type`/`metadata` to the target's.
            let file_type = dir_entry.file_type();
            let is_dir_for_ignore = file_type.is_dir();
            if self.ignore.is_ignored(&rel_path, is_dir_for_ignore) {
                if is_dir_for_ignore {
                    walker.skip_current_dir();
                }
                continue;
            }

            let metadata = match dir_entry.metadata() {
                Ok(m) => m,
                Err(err) => {
                    if is_permission_error(&err) && self.options.skip_permission_errors {
                        log::warn!("skipping unreadable entry: {err}");
                        continue;
                    }
                    return Err(SnugError::io("tree_walker.stat", Some(full_path), err.into()));
                }
            };

            if file_type.is_dir() {
                if follow {
                    // A symlink can jump back to any directory already on
                    // the path from the root, not just one previously
                    // reached through another symlink; track every
                    // directory we enter so such a jump is caught on its
                    // first re-entry.
                    let canonical = std::fs::canonicalize(&full_path).map_err(|e| SnugError::io("tree_walker.canonicalize", full_path.clone(), e))?;
                    if !entered_canonical_dirs.insert(canonical) {
                        walker.skip_current_dir();
                        continue;
                    }
                }
                entries.push(WalkEntry::Directory { rel_path, full_path, stat: EntryStat::from_metadata(&metadata) });
            } else if file_type.is_file() {
                entries.push(WalkEntry::Regular { rel_path, full_path, stat: EntryStat::from_metadata(&metadata) });
            } else if let Some(kind) = special_kind(&metadata) {
                if self.options.include_special_files {
                    entries.push(WalkEntry::Special { rel_path, full_path, kind });
                }
            }
        }

        Ok(entries)
    }

    fn relative_path(&self, full_path: &Path) -> Result<String> {
        let stripped = full_path
            .strip_prefix(&self.root)
            .map_err(|_| SnugError::InvalidFormat { reason: format!("{} is not under {}", full_path.display(), self.root.display()) })?;

        let mut rel = stripped.to_string_lossy().replace('\\', "/");
        if let Some(base) = &self.options.base_path {
            rel = format!("{base}/{rel}");
        }
        Ok(rel)
    }
}

fn is_permission_error(err: &walkdir::Error) -> bool {
    err.io_error().map(|e| e.kind() == std::io::ErrorKind::PermissionDenied).unwrap_or(false)
}

#[cfg(unix)]
fn special_kind(metadata: &Metadata) -> Option<SpecialKind> {
    use std::os::unix::fs::FileTypeExt;
    let file_type = metadata.file_type();
    if file_type.is_block_device() {
        Some(SpecialKind::BlockDevice)
    } else if file_type.is_char_device() {
        Some(SpecialKind::CharDevice)
    } else if file_type.is_socket() {
        Some(SpecialKind::Socket)
    } else if file_type.is_fifo() {
        Some(SpecialKind::Fifo)
    } else {
        None
    }
}

#[cfg(not(unix))]
fn special_kind(_metadata: &Metadata) -> Option<SpecialKind> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_ignores() -> IgnoreMatcher {
        IgnoreMatcher::new(Vec::<String>::new())
    }

    #[test]
    fn walks_files_and_directories_in_lexicographic_order() -> anyhow::Result<()> {
        let dir = assert_fs::TempDir::new()?;
        std::fs::create_dir_all(dir.path().join("b"))?;
        std::fs::write(dir.path().join("a.txt"), "a")?;
        std::fs::write(dir.path().join("b/c.txt"), "c")?;

        let ignore = no_ignores();
        let walker = TreeWalker::new(dir.path(), WalkOptions::default(), &ignore);
        let entries = walker.walk()?;

        let paths: Vec<&str> = entries.iter().map(|e| e.rel_path()).collect();
        assert_eq!(paths, vec!["a.txt", "b", "b/c.txt"]);

        Ok(())
    }

    #[test]
    fn symlinks_are_preserved_when_not_following() -> anyhow::Result<()> {
        let dir = assert_fs::TempDir::new()?;
        std::fs::write(dir.path().join("real.txt"), "data")?;
        #[cfg(unix)]
        std::os::unix::fs::symlink("real.txt", dir.path().join("link"))?;

        #[cfg(unix)]
        {
            let ignore = no_ignores();
            let options = WalkOptions { follow_symlinks: false, ..Default::default() };
            let walker = TreeWalker::new(dir.path(), options, &ignore);
            let entries = walker.walk()?;

            let has_symlink = entries.iter().any(|e| matches!(e, WalkEntry::Symlink { rel_path, .. } if rel_path == "link"));
            assert!(has_symlink);
        }

        Ok(())
    }

    #[test]
    fn ignored_entries_are_skipped() -> anyhow::Result<()> {
        let dir = assert_fs::TempDir::new()?;
        std::fs::write(dir.path().join("a.txt"), "a")?;
        std::fs::write(dir.path().join("b.log"), "b")?;

        let ignore = IgnoreMatcher::new(["*.log"]);
        let walker = TreeWalker::new(dir.path(), WalkOptions::default(), &ignore);
        let entries = walker.walk()?;

        let paths: Vec<&str> = entries.iter().map(|e| e.rel_path()).collect();
        assert_eq!(paths, vec!["a.txt"]);

        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn following_a_symlinked_directory_recurses_into_its_children() -> anyhow::Result<()> {
        let dir = assert_fs::TempDir::new()?;
        std::fs::create_dir_all(dir.path().join("real"))?;
        std::fs::write(dir.path().join("real/leaf.txt"), "leaf")?;
        std::os::unix::fs::symlink(dir.path().join("real"), dir.path().join("link"))?;

        let ignore = no_ignores();
        let options = WalkOptions { follow_symlinks: true, ..Default::default() };
        let walker = TreeWalker::new(dir.path(), options, &ignore);
        let entries = walker.walk()?;

        let paths: Vec<&str> = entries.iter().map(|e| e.rel_path()).collect();
        assert!(paths.contains(&"link"));
        assert!(paths.contains(&"link/leaf.txt"), "expected the symlinked directory's contents to be walked, got {paths:?}");

        let link_entry = entries.iter().find(|e| e.rel_path() == "link").unwrap();
        assert!(matches!(link_entry, WalkEntry::Directory { .. }), "a followed symlinked directory should appear as Directory, not Symlink");

        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn following_symlinks_does_not_loop_on_a_cycle() -> anyhow::Result<()> {
        let dir = assert_fs::TempDir::new()?;
        std::fs::create_dir_all(dir.path().join("a"))?;
        std::os::unix::fs::symlink(dir.path(), dir.path().join("a/back-to-root"))?;

        let ignore = no_ignores();
        let options = WalkOptions { follow_symlinks: true, ..Default::default() };
        let walker = TreeWalker::new(dir.path(), options, &ignore);

        // Must terminate rather than recurse forever through the cycle.
        let entries = walker.walk()?;
        let paths: Vec<&str> = entries.iter().map(|e| e.rel_path()).collect();
        assert!(paths.contains(&"a"));
        assert!(paths.contains(&"a/back-to-root"));
        // The cyclic re-entry into the root is not expanded a second time.
        assert!(!paths.iter().any(|p| p.starts_with("a/back-to-root/")));

        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn broken_symlink_is_skipped_by_default_when_following() -> anyhow::Result<()> {
        let dir = assert_fs::TempDir::new()?;
        std::os::unix::fs::symlink(dir.path().join("does-not-exist"), dir.path().join("dangling"))?;

        let ignore = no_ignores();
        let options = WalkOptions { follow_symlinks: true, ..Default::default() };
        let walker = TreeWalker::new(dir.path(), options, &ignore);
        let entries = walker.walk()?;

        assert!(entries.is_empty());
        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn broken_symlink_is_fatal_when_requested_while_following() -> anyhow::Result<()> {
        let dir = assert_fs::TempDir::new()?;
        std::os::unix::fs::symlink(dir.path().join("does-not-exist"), dir.path().join("dangling"))?;

        let ignore = no_ignores();
        let options = WalkOptions { follow_symlinks: true, error_on_broken_symlinks: true, ..Default::default() };
        let walker = TreeWalker::new(dir.path(), options, &ignore);

        assert!(matches!(walker.walk(), Err(SnugError::BrokenSymlink { .. })));
        Ok(())
    }
}
