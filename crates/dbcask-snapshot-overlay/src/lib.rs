//! Linux overlay filesystem snapshot backend for dbcask.
//!
//! Each prepared workspace is a `{lower, upper, work, merged}` directory
//! quadruple: `lower` holds (or points at) the read-only base, `upper` and
//! `work` are the overlay filesystem's scratch directories, and `merged` is
//! the mounted union the caller executes against. Because the overlay only
//! ever materializes the *diff* in `upper`, taking an immutable snapshot
//! still requires copying the merged view out to its own directory — the
//! overlay mount itself is not addressable once the workspace is torn down.

use chrono::Utc;
use dbcask_snapshot_traits::{
    generate_unique_id, Error, FsSnapshotProvider, PreparedWorkspace, ProviderCapabilities, Result,
    SnapshotProviderKind, SnapshotRef, WorkingCopyMode,
};
use nix::mount::{mount, umount2, MntFlags, MsFlags};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

mod copy;

#[derive(Default)]
pub struct OverlayProvider;

impl OverlayProvider {
    pub fn new() -> Self {
        Self
    }

    /// Probe overlay availability by attempting a real, throwaway mount
    /// and immediately tearing it down, rather than trusting
    /// `/proc/filesystems` — the module can be registered but still refused
    /// by a sandboxed kernel (unprivileged user namespaces, LSM policy,
    /// missing `CAP_SYS_ADMIN`). Only run at construction time: a real
    /// mount/unmount cycle is too expensive to repeat per request.
    fn overlay_available() -> bool {
        if !cfg!(target_os = "linux") {
            return false;
        }
        let Ok(probe_root) = tempfile::tempdir() else { return false };
        let lower = probe_root.path().join("lower");
        let upper = probe_root.path().join("upper");
        let work = probe_root.path().join("work");
        let merged = probe_root.path().join("merged");
        if std::fs::create_dir_all(&lower).is_err()
            || std::fs::create_dir_all(&upper).is_err()
            || std::fs::create_dir_all(&work).is_err()
            || std::fs::create_dir_all(&merged).is_err()
        {
            return false;
        }

        let options = format!(
            "lowerdir={},upperdir={},workdir={}",
            lower.display(),
            upper.display(),
            work.display()
        );
        let mounted =
            mount(Some("overlay"), &merged, Some("overlay"), MsFlags::empty(), Some(options.as_str())).is_ok();
        if mounted {
            let _ = umount2(&merged, MntFlags::MNT_DETACH);
        }
        mounted
    }

    fn store_root() -> PathBuf {
        std::env::temp_dir().join("dbcask-overlay-store")
    }

    fn mount_overlay(&self, lower: &Path, upper: &Path, work: &Path, merged: &Path) -> Result<()> {
        std::fs::create_dir_all(upper)?;
        std::fs::create_dir_all(work)?;
        std::fs::create_dir_all(merged)?;

        let options = format!(
            "lowerdir={},upperdir={},workdir={}",
            lower.display(),
            upper.display(),
            work.display()
        );

        mount(Some("overlay"), merged, Some("overlay"), MsFlags::empty(), Some(options.as_str()))
            .map_err(|e| Error::provider(format!("mount overlay at {}: {e}", merged.display())))?;

        Ok(())
    }

    fn unmount_overlay(&self, merged: &Path) -> Result<()> {
        if !merged.exists() {
            return Ok(());
        }
        match umount2(merged, MntFlags::MNT_DETACH) {
            Ok(()) => Ok(()),
            Err(nix::errno::Errno::EINVAL) => {
                // Not a mount point (already unmounted or never mounted).
                Ok(())
            }
            Err(e) => Err(Error::provider(format!("umount {}: {e}", merged.display()))),
        }
    }

    fn allocate_triad(&self) -> (PathBuf, PathBuf, PathBuf, PathBuf) {
        let base = Self::store_root().join(generate_unique_id());
        (base.join("upper"), base.join("work"), base.join("merged"), base)
    }
}

impl FsSnapshotProvider for OverlayProvider {
    fn kind(&self) -> SnapshotProviderKind {
        SnapshotProviderKind::Overlay
    }

    fn detect_capabilities(&self, _root: &Path) -> ProviderCapabilities {
        if !Self::overlay_available() {
            return ProviderCapabilities {
                kind: self.kind(),
                score: 0,
                requires_db_stop: true,
                writable_clone: false,
                send_receive: false,
                notes: vec!["overlay filesystem not available on this host".to_string()],
            };
        }
        ProviderCapabilities {
            kind: self.kind(),
            score: 50,
            requires_db_stop: true,
            writable_clone: true,
            send_receive: false,
            notes: vec!["using Linux overlay mounts".to_string()],
        }
    }

    fn prepare_writable_workspace(
        &self,
        root: &Path,
        mode: WorkingCopyMode,
    ) -> Result<PreparedWorkspace> {
        if matches!(mode, WorkingCopyMode::InPlace) {
            return Ok(PreparedWorkspace {
                exec_path: root.to_path_buf(),
                working_copy: WorkingCopyMode::InPlace,
                provider: self.kind(),
                cleanup_token: format!("overlay:inplace:{}", root.display()),
            });
        }

        let (upper, work, merged, base) = self.allocate_triad();
        self.mount_overlay(root, &upper, &work, &merged)?;
        debug!(lower = %root.display(), merged = %merged.display(), "mounted overlay workspace");

        Ok(PreparedWorkspace {
            exec_path: merged,
            working_copy: WorkingCopyMode::CowOverlay,
            provider: self.kind(),
            cleanup_token: format!("overlay:cow:{}", base.display()),
        })
    }

    fn snapshot_now(&self, ws: &PreparedWorkspace, label: Option<&str>) -> Result<SnapshotRef> {
        let unique_id = generate_unique_id();
        let snapshot_path = Self::store_root().join(format!("snapshot-{unique_id}"));
        copy::copy_dir_recursive(&ws.exec_path, &snapshot_path).map_err(|e| {
            Error::provider(format!(
                "copy merged view {} -> {}: {e}",
                ws.exec_path.display(),
                snapshot_path.display()
            ))
        })?;

        let mut meta = HashMap::new();
        meta.insert("path".to_string(), snapshot_path.display().to_string());
        meta.insert("timestamp".to_string(), Utc::now().to_rfc3339());

        Ok(SnapshotRef {
            id: format!("overlay_{unique_id}"),
            label: label.map(str::to_string),
            provider: self.kind(),
            meta,
        })
    }

    fn mount_readonly(&self, snap: &SnapshotRef) -> Result<PathBuf> {
        let path = snap.meta.get("path").ok_or_else(|| Error::provider("snapshot missing path metadata"))?;
        let path = PathBuf::from(path);
        if path.exists() {
            Ok(path)
        } else {
            Err(Error::provider("overlay snapshot path does not exist"))
        }
    }

    fn branch_from_snapshot(
        &self,
        snap: &SnapshotRef,
        mode: WorkingCopyMode,
    ) -> Result<PreparedWorkspace> {
        let lower = self.mount_readonly(snap)?;
        self.prepare_writable_workspace(
            &lower,
            if matches!(mode, WorkingCopyMode::InPlace) {
                WorkingCopyMode::InPlace
            } else {
                WorkingCopyMode::CowOverlay
            },
        )
    }

    fn cleanup(&self, token: &str) -> Result<()> {
        if token.strip_prefix("overlay:inplace:").is_some() {
            return Ok(());
        }
        let Some(base) = token.strip_prefix("overlay:cow:") else {
            return Err(Error::provider(format!("invalid overlay cleanup token: {token}")));
        };
        let base = PathBuf::from(base);
        let merged = base.join("merged");

        if let Err(e) = self.unmount_overlay(&merged) {
            warn!(error = %e, path = %merged.display(), "overlay unmount failed during cleanup");
            return Err(e);
        }
        if base.exists() {
            std::fs::remove_dir_all(&base)
                .map_err(|e| Error::provider(format!("cleanup {}: {e}", base.display())))?;
        }
        Ok(())
    }
}
