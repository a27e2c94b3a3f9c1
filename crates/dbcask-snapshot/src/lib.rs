//! Filesystem snapshot provider dispatch for dbcask.
//!
//! Three backends implement [`FsSnapshotProvider`]: this crate's own
//! [`CopyProvider`] (a universal recursive-copy fallback), and the optional
//! `dbcask-snapshot-subvol` (Btrfs-style CoW subvolumes) and
//! `dbcask-snapshot-overlay` (Linux overlay mounts) backends. [`provider_for`]
//! probes every backend compiled in and returns the highest-scoring one.

pub use dbcask_snapshot_traits::*;
use std::path::Path;
use tracing::debug;

mod copy_provider;
mod guard;

pub use copy_provider::CopyProvider;
pub use guard::CloneGuard;

/// Auto-detect and return the highest-scoring provider for `path`.
///
/// `CopyProvider` always registers a capability, so this never fails once
/// `path` itself passes validation.
pub fn provider_for(path: &Path) -> Result<Box<dyn FsSnapshotProvider>> {
    validate_destination_path(path)?;

    let mut best_provider: Option<Box<dyn FsSnapshotProvider>> = None;
    let mut best_score = 0;

    #[cfg(feature = "subvol")]
    {
        let provider = dbcask_snapshot_subvol::SubvolumeProvider::new();
        let capabilities = provider.detect_capabilities(path);
        debug!(provider = "subvol", score = capabilities.score, "probed provider");
        if capabilities.score > best_score {
            best_score = capabilities.score;
            best_provider = Some(Box::new(provider));
        }
    }

    #[cfg(feature = "overlay")]
    {
        let provider = dbcask_snapshot_overlay::OverlayProvider::new();
        let capabilities = provider.detect_capabilities(path);
        debug!(provider = "overlay", score = capabilities.score, "probed provider");
        if capabilities.score > best_score {
            best_score = capabilities.score;
            best_provider = Some(Box::new(provider));
        }
    }

    let copy_provider = CopyProvider::new();
    let capabilities = copy_provider.detect_capabilities(path);
    debug!(provider = "copy", score = capabilities.score, "probed provider");
    if capabilities.score > best_score {
        best_provider = Some(Box::new(copy_provider));
    }

    best_provider.ok_or_else(|| Error::provider("no suitable snapshot provider found"))
}

/// Validate a destination path for workspace creation.
pub fn validate_destination_path(dest: &Path) -> Result<()> {
    if let Some(parent) = dest.parent() {
        if !parent.exists() {
            std::fs::create_dir_all(parent).map_err(|e| {
                Error::provider(format!("cannot create parent directory {}: {e}", parent.display()))
            })?;
            if parent.exists() && std::fs::read_dir(parent).map_or(true, |mut d| d.next().is_none()) {
                let _ = std::fs::remove_dir(parent);
            }
        }
    }

    let invalid_paths = ["/dev", "/proc", "/sys", "/run"];
    for invalid in &invalid_paths {
        if dest.starts_with(invalid) {
            return Err(Error::provider(format!(
                "cannot create workspace in system directory: {}",
                dest.display()
            )));
        }
    }

    if dest == Path::new("/") {
        return Err(Error::provider("cannot create workspace at root directory"));
    }

    Ok(())
}

/// Validate a configured `(snapshot.kind, snapshot.root)` pair once at
/// startup, before any `provider_for` probing happens per request.
///
/// Unknown or empty `kind` strings are accepted — they resolve to the copy
/// fallback, which needs no root validation. The subvolume backend requires
/// a non-empty root that currently resolves to a Btrfs filesystem.
pub fn validate_store(kind: &str, root: Option<&Path>) -> Result<()> {
    match kind.trim().to_ascii_lowercase().as_str() {
        "btrfs" | "subvolume" => {
            let root = root.ok_or_else(|| Error::provider("snapshot.root is required for the subvolume backend"))?;
            if root.as_os_str().is_empty() {
                return Err(Error::provider("snapshot.root must not be empty for the subvolume backend"));
            }
            #[cfg(feature = "subvol")]
            {
                let existing = root.ancestors().find(|p| p.exists()).unwrap_or(root);
                let fs_type = dbcask_snapshot_subvol::SubvolumeProvider::fs_type(existing)?;
                if fs_type != "btrfs" {
                    return Err(Error::provider(format!(
                        "snapshot.root {} is on {fs_type}, not btrfs",
                        root.display()
                    )));
                }
            }
            #[cfg(not(feature = "subvol"))]
            {
                return Err(Error::unsupported("subvolume backend not compiled in"));
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

/// Recursively copy `src` into `dst`, creating `dst` if needed, preserving
/// each entry's mode bits and mtime.
pub(crate) fn copy_dir_recursive(src: &Path, dst: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dst)?;
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let file_type = entry.file_type()?;
        let dest_path = dst.join(entry.file_name());
        if file_type.is_dir() {
            copy_dir_recursive(&entry.path(), &dest_path)?;
            copy_metadata(&entry.path(), &dest_path)?;
        } else if file_type.is_symlink() {
            let target = std::fs::read_link(entry.path())?;
            #[cfg(unix)]
            std::os::unix::fs::symlink(target, &dest_path)?;
            #[cfg(not(unix))]
            std::fs::copy(entry.path(), &dest_path).map(|_| ())?;
        } else {
            std::fs::copy(entry.path(), &dest_path)?;
            copy_metadata(&entry.path(), &dest_path)?;
        }
    }
    copy_metadata(src, dst)
}

/// Copy mode bits and mtime from `src` onto `dst`. Best-effort: a dangling
/// symlink target or an unusual filesystem shouldn't fail the whole copy
/// over a metadata write it rejects.
fn copy_metadata(src: &Path, dst: &Path) -> std::io::Result<()> {
    let metadata = std::fs::metadata(src)?;
    let mtime = filetime::FileTime::from_last_modification_time(&metadata);
    let _ = filetime::set_file_mtime(dst, mtime);
    let _ = std::fs::set_permissions(dst, metadata.permissions());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_validation_rejects_system_directories() {
        assert!(validate_destination_path(Path::new("/dev/null")).is_err());
        assert!(validate_destination_path(Path::new("/proc/version")).is_err());
        assert!(validate_destination_path(Path::new("/sys/class")).is_err());
        assert!(validate_destination_path(Path::new("/run/lock")).is_err());
        assert!(validate_destination_path(Path::new("/")).is_err());
    }

    #[test]
    fn path_validation_accepts_ordinary_paths() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("workspace");
        assert!(validate_destination_path(&dest).is_ok());
    }

    #[test]
    fn provider_for_always_resolves_via_copy_fallback() {
        let dir = tempfile::tempdir().unwrap();
        let provider = provider_for(dir.path()).expect("copy fallback always available");
        assert!(provider.detect_capabilities(dir.path()).score > 0);
    }

    #[test]
    fn validate_store_accepts_unknown_or_empty_kind_without_a_root() {
        assert!(validate_store("", None).is_ok());
        assert!(validate_store("copy", None).is_ok());
        assert!(validate_store("made-up", None).is_ok());
    }

    #[test]
    fn validate_store_rejects_subvolume_backend_without_a_root() {
        assert!(validate_store("btrfs", None).is_err());
    }

    #[test]
    fn copy_dir_recursive_preserves_mtime() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        std::fs::create_dir_all(&src).unwrap();
        std::fs::write(src.join("file.txt"), b"hello").unwrap();

        let old_mtime = filetime::FileTime::from_unix_time(1_600_000_000, 0);
        filetime::set_file_mtime(src.join("file.txt"), old_mtime).unwrap();
        filetime::set_file_mtime(&src, old_mtime).unwrap();

        let dst = dir.path().join("dst");
        copy_dir_recursive(&src, &dst).unwrap();

        let copied_meta = std::fs::metadata(dst.join("file.txt")).unwrap();
        let copied_mtime = filetime::FileTime::from_last_modification_time(&copied_meta);
        assert_eq!(copied_mtime, old_mtime);
    }
}
