//! Universal fallback snapshot backend: plain recursive directory copies.
//!
//! No filesystem-native CoW primitive is required, so this provider works
//! anywhere but pays the full cost of a deep copy on every workspace and
//! snapshot it creates.

use crate::copy_dir_recursive;
use dbcask_snapshot_traits::{
    Error, FsSnapshotProvider, PreparedWorkspace, ProviderCapabilities, Result, SnapshotProviderKind,
    SnapshotRef, WorkingCopyMode, generate_unique_id,
};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Root directory under which this provider materializes copies. Defaults to
/// a subdirectory of the OS temp dir; callers embedding the engine may point
/// it elsewhere (e.g. alongside the registry's data directory).
pub struct CopyProvider {
    store_root: PathBuf,
}

impl CopyProvider {
    pub fn new() -> Self {
        Self { store_root: std::env::temp_dir().join("dbcask-copy-store") }
    }

    pub fn with_store_root(store_root: PathBuf) -> Self {
        Self { store_root }
    }

    fn allocate_path(&self) -> PathBuf {
        self.store_root.join(generate_unique_id())
    }
}

impl Default for CopyProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl FsSnapshotProvider for CopyProvider {
    fn kind(&self) -> SnapshotProviderKind {
        SnapshotProviderKind::Copy
    }

    fn detect_capabilities(&self, _root: &Path) -> ProviderCapabilities {
        ProviderCapabilities {
            kind: SnapshotProviderKind::Copy,
            // Lowest score: always viable, never preferred over a CoW backend.
            score: 1,
            requires_db_stop: true,
            writable_clone: true,
            send_receive: false,
            notes: vec!["plain recursive copy, no CoW sharing".to_string()],
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
                provider: SnapshotProviderKind::Copy,
                cleanup_token: String::new(),
            });
        }

        let dest = self.allocate_path();
        copy_dir_recursive(root, &dest)
            .map_err(|e| Error::provider(format!("copy {} -> {}: {e}", root.display(), dest.display())))?;

        Ok(PreparedWorkspace {
            exec_path: dest.clone(),
            working_copy: WorkingCopyMode::CowOverlay,
            provider: SnapshotProviderKind::Copy,
            cleanup_token: format!("copy:{}", dest.display()),
        })
    }

    fn snapshot_now(&self, ws: &PreparedWorkspace, label: Option<&str>) -> Result<SnapshotRef> {
        let dest = self.allocate_path();
        copy_dir_recursive(&ws.exec_path, &dest).map_err(|e| {
            Error::provider(format!("snapshot {} -> {}: {e}", ws.exec_path.display(), dest.display()))
        })?;

        let mut meta = HashMap::new();
        meta.insert("path".to_string(), dest.display().to_string());

        Ok(SnapshotRef {
            id: generate_unique_id(),
            label: label.map(str::to_string),
            provider: SnapshotProviderKind::Copy,
            meta,
        })
    }

    fn mount_readonly(&self, snap: &SnapshotRef) -> Result<PathBuf> {
        let path = snap
            .meta
            .get("path")
            .ok_or_else(|| Error::provider("snapshot missing path metadata"))?;
        Ok(PathBuf::from(path))
    }

    fn branch_from_snapshot(
        &self,
        snap: &SnapshotRef,
        mode: WorkingCopyMode,
    ) -> Result<PreparedWorkspace> {
        let source = self.mount_readonly(snap)?;
        self.prepare_writable_workspace(&source, if matches!(mode, WorkingCopyMode::InPlace) {
            WorkingCopyMode::InPlace
        } else {
            WorkingCopyMode::CowOverlay
        })
    }

    fn cleanup(&self, token: &str) -> Result<()> {
        let Some(path) = token.strip_prefix("copy:") else {
            // Not ours; nothing to do (in-place workspaces carry an empty token).
            return Ok(());
        };
        if path.is_empty() {
            return Ok(());
        }
        let path = PathBuf::from(path);
        if path.exists() {
            std::fs::remove_dir_all(&path)
                .map_err(|e| Error::provider(format!("cleanup {}: {e}", path.display())))?;
        }
        Ok(())
    }
}
