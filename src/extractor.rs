//! Consumes a manifest and materializes directories/files/symlinks from the
//! `ChunkStore`.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use crate::chunk_store::ChunkStore;
use crate::digest::Digest;
use crate::error::{Result, SnugError};
use crate::manifest::{ArchiveEntry, ArchiveManifest, CommonAttrs, ManifestCodec};

/// Extraction options.
#[derive(Clone, Copy, Debug)]
pub struct ExtractOptions {
    /// Replace existing files/directories' permissions.
    pub overwrite: bool,
    pub preserve_permissions: bool,
    pub preserve_timestamps: bool,
    pub error_on_broken_symlinks: bool,
}

impl Default for ExtractOptions {
    fn default() -> Self {
        Self {
            overwrite: false,
            preserve_permissions: true,
            preserve_timestamps: true,
            error_on_broken_symlinks: false,
        }
    }
}

/// Replays a manifest back into a directory tree, reading chunk bytes from
/// a `ChunkStore` by digest.
pub struct Extractor {
    store: Arc<dyn ChunkStore>,
    options: ExtractOptions,
    cancelled: Arc<AtomicBool>,
}

impl Extractor {
    pub fn new(store: Arc<dyn ChunkStore>, options: ExtractOptions) -> Self {
        Self { store, options, cancelled: Arc::new(AtomicBool::new(false)) }
    }

    /// Immediately cancellable between entries.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Parses `archive_bytes` and extracts into `output_root`.
    pub fn extract(&self, archive_bytes: &[u8], output_root: &Path) -> Result<ArchiveManifest> {
        let manifest = ManifestCodec::parse(archive_bytes)?;
        self.extract_manifest(&manifest, output_root)?;
        Ok(manifest)
    }

    /// Extracts an already-parsed manifest.
    pub fn extract_manifest(&self, manifest: &ArchiveManifest, output_root: &Path) -> Result<()> {
        std::fs::create_dir_all(output_root).map_err(|e| SnugError::io("extractor.prepare_root", output_root.to_path_buf(), e))?;

        let mut ordered: Vec<&ArchiveEntry> = manifest.entries.iter().collect();
        // The codec-preserved order already puts every ancestor before its
        // descendants; this stable sort only tightens the within-depth
        // order (directories, then files, then symlinks) so a file write
        // never races its containing directory's creation.
        ordered.sort_by_key(|entry| (path_depth(entry.path()), kind_rank(entry)));

        for entry in ordered {
            if self.cancelled.load(Ordering::SeqCst) {
                return Err(SnugError::Cancelled);
            }

            entry.validate_path()?;
            let target = resolve_within_root(output_root, entry.path())?;

            let result = match entry {
                ArchiveEntry::Directory { attrs, .. } => self.extract_directory(&target, attrs),
                ArchiveEntry::File { digest, path, attrs, .. } => self.extract_file(&target, digest, path, attrs),
                ArchiveEntry::Symlink { symlink_target, attrs, .. } => {
                    self.extract_symlink(&target, symlink_target, attrs)
                }
            };

            if let Err(err) = result {
                return Err(err);
            }
        }

        Ok(())
    }

    fn extract_directory(&self, target: &Path, attrs: &CommonAttrs) -> Result<()> {
        if !target.exists() {
            std::fs::create_dir_all(target).map_err(|e| SnugError::io("extractor.mkdir", target.to_path_buf(), e))?;
            self.apply_permissions(target, attrs)?;
        } else if self.options.overwrite {
            self.apply_permissions(target, attrs)?;
        }
        Ok(())
    }

    fn extract_file(&self, target: &Path, digest: &Digest, path: &str, attrs: &CommonAttrs) -> Result<()> {
        if target.exists() && !self.options.overwrite {
            log::debug!("extractor: leaving existing file in place: {}", target.display());
            return Ok(());
        }

        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent).map_err(|e| SnugError::io("extractor.mkdir", parent.to_path_buf(), e))?;
        }

        let bytes = self
            .store
            .read(digest)?
            .ok_or_else(|| SnugError::MissingChunk { path: path.to_string(), digest: digest.clone() })?;

        let temp_path = target.with_extension(format!(
            "snugtmp.{}",
            SystemTime::now().duration_since(SystemTime::UNIX_EPOCH).unwrap().as_nanos()
        ));

        let write_result = (|| -> Result<()> {
            use std::io::Write;
            let mut file =
                std::fs::File::create(&temp_path).map_err(|e| SnugError::io("extractor.write_file", temp_path.clone(), e))?;
            file.write_all(&bytes).map_err(|e| SnugError::io("extractor.write_file", temp_path.clone(), e))?;
            file.sync_all().map_err(|e| SnugError::io("extractor.write_file", temp_path.clone(), e))?;
            Ok(())
        })();

        if let Err(err) = write_result {
            // Partially written files are unlinked on abort.
            let _ = std::fs::remove_file(&temp_path);
            return Err(err);
        }

        std::fs::rename(&temp_path, target).map_err(|e| SnugError::io("extractor.write_file", target.to_path_buf(), e))?;

        self.apply_permissions(target, attrs)?;
        if self.options.preserve_timestamps {
            if let Some(modified) = attrs.modified {
                let file = std::fs::OpenOptions::new()
                    .write(true)
                    .open(target)
                    .map_err(|e| SnugError::io("extractor.set_modified", target.to_path_buf(), e))?;
                file.set_modified(modified).map_err(|e| SnugError::io("extractor.set_modified", target.to_path_buf(), e))?;
            }
        }

        Ok(())
    }

    fn extract_symlink(&self, target: &Path, symlink_target: &str, attrs: &CommonAttrs) -> Result<()> {
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent).map_err(|e| SnugError::io("extractor.mkdir", parent.to_path_buf(), e))?;
        }

        if self.options.error_on_broken_symlinks {
            let resolved = target.parent().unwrap_or(target).join(symlink_target);
            if !resolved.exists() {
                return Err(SnugError::BrokenSymlink { path: target.to_path_buf(), target: PathBuf::from(symlink_target) });
            }
        }

        if target.exists() || target.symlink_metadata().is_ok() {
            if !self.options.overwrite {
                log::debug!("extractor: leaving existing symlink in place: {}", target.display());
                return Ok(());
            }
            remove_existing(target).map_err(|e| SnugError::io("extractor.remove_existing", target.to_path_buf(), e))?;
        }

        create_symlink(symlink_target, target)
            .map_err(|e| SnugError::io("extractor.symlink", target.to_path_buf(), e))?;

        let _ = attrs; // symlink permissions are not portably settable; preserved in the manifest only.
        Ok(())
    }

    fn apply_permissions(&self, target: &Path, attrs: &CommonAttrs) -> Result<()> {
        if !self.options.preserve_permissions {
            return Ok(());
        }
        let Some(mode) = attrs.permissions else {
            return Ok(());
        };
        set_permissions_mode(target, mode).map_err(|e| SnugError::io("extractor.set_permissions", target.to_path_buf(), e))
    }
}

fn path_depth(path: &str) -> usize {
    path.matches('/').count()
}

fn kind_rank(entry: &ArchiveEntry) -> u8 {
    match entry {
        ArchiveEntry::Directory { .. } => 0,
        ArchiveEntry::File { .. } => 1,
        ArchiveEntry::Symlink { .. } => 2,
    }
}

/// Joins `rel_path` onto `output_root` and rejects anything that would
/// escape it. `ArchiveEntry::validate_path` already rejects absolute paths
/// and `..` segments; this is a belt-and-suspenders structural check on
/// the resolved path itself.
fn resolve_within_root(output_root: &Path, rel_path: &str) -> Result<PathBuf> {
    let mut depth: i64 = 0;
    for component in Path::new(rel_path).components() {
        match component {
            std::path::Component::Normal(_) => depth += 1,
            std::path::Component::ParentDir => depth -= 1,
            std::path::Component::CurDir => {}
            _ => {
                return Err(SnugError::PathEscape { path: rel_path.to_string() });
            }
        }
        if depth < 0 {
            return Err(SnugError::PathEscape { path: rel_path.to_string() });
        }
    }
    Ok(output_root.join(rel_path))
}

#[cfg(unix)]
fn set_permissions_mode(target: &Path, mode: u32) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(target, std::fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn set_permissions_mode(_target: &Path, _mode: u32) -> std::io::Result<()> {
    Ok(())
}

#[cfg(unix)]
fn create_symlink(symlink_target: &str, target: &Path) -> std::io::Result<()> {
    std::os::unix::fs::symlink(symlink_target, target)
}

#[cfg(windows)]
fn create_symlink(symlink_target: &str, target: &Path) -> std::io::Result<()> {
    if target.with_file_name(symlink_target).is_dir() {
        std::os::windows::fs::symlink_dir(symlink_target, target)
    } else {
        std::os::windows::fs::symlink_file(symlink_target, target)
    }
}

fn remove_existing(target: &Path) -> std::io::Result<()> {
    let metadata = std::fs::symlink_metadata(target)?;
    if metadata.is_dir() {
        std::fs::remove_dir_all(target)
    } else {
        std::fs::remove_file(target)
    }
}
