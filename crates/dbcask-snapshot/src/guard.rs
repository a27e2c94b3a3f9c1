//! RAII cleanup guarantee for prepared workspaces.

use dbcask_snapshot_traits::{FsSnapshotProvider, PreparedWorkspace, Result};
use std::sync::Arc;
use tracing::warn;

/// Wraps a [`PreparedWorkspace`] and guarantees its `cleanup_token` is
/// released exactly once, on every exit path: normal drop, an explicit
/// [`CloneGuard::release`] call, or unwinding through an error return.
///
/// Callers that hand the workspace off to a longer-lived owner should call
/// [`CloneGuard::into_inner`] to disarm the guard rather than let it drop.
pub struct CloneGuard {
    provider: Arc<dyn FsSnapshotProvider>,
    workspace: Option<PreparedWorkspace>,
}

impl CloneGuard {
    pub fn new(provider: Arc<dyn FsSnapshotProvider>, workspace: PreparedWorkspace) -> Self {
        Self { provider, workspace: Some(workspace) }
    }

    pub fn workspace(&self) -> &PreparedWorkspace {
        self.workspace.as_ref().expect("workspace released")
    }

    /// Release the underlying resources now, rather than waiting for drop.
    pub fn release(mut self) -> Result<()> {
        self.release_inner()
    }

    /// Disarm the guard and hand back the workspace without releasing it.
    /// The caller becomes responsible for eventually calling
    /// `provider.cleanup(&workspace.cleanup_token)`.
    pub fn into_inner(mut self) -> PreparedWorkspace {
        self.workspace.take().expect("workspace released")
    }

    fn release_inner(&mut self) -> Result<()> {
        if let Some(ws) = self.workspace.take() {
            self.provider.cleanup(&ws.cleanup_token)?;
        }
        Ok(())
    }
}

impl Drop for CloneGuard {
    fn drop(&mut self) {
        if self.workspace.is_some() {
            if let Err(e) = self.release_inner() {
                warn!(error = %e, "clone guard cleanup failed on drop");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CopyProvider;
    use dbcask_snapshot_traits::WorkingCopyMode;

    #[test]
    fn drop_releases_the_workspace() {
        let src = tempfile::tempdir().unwrap();
        let store = tempfile::tempdir().unwrap();
        let provider: Arc<dyn FsSnapshotProvider> =
            Arc::new(CopyProvider::with_store_root(store.path().to_path_buf()));

        let ws = provider
            .prepare_writable_workspace(src.path(), WorkingCopyMode::CowOverlay)
            .unwrap();
        let exec_path = ws.exec_path.clone();
        {
            let _guard = CloneGuard::new(provider.clone(), ws);
        }
        assert!(!exec_path.exists());
    }

    #[test]
    fn into_inner_disarms_the_guard() {
        let src = tempfile::tempdir().unwrap();
        let store = tempfile::tempdir().unwrap();
        let provider: Arc<dyn FsSnapshotProvider> =
            Arc::new(CopyProvider::with_store_root(store.path().to_path_buf()));

        let ws = provider
            .prepare_writable_workspace(src.path(), WorkingCopyMode::CowOverlay)
            .unwrap();
        let exec_path = ws.exec_path.clone();
        let guard = CloneGuard::new(provider.clone(), ws);
        let reclaimed = guard.into_inner();
        assert_eq!(reclaimed.exec_path, exec_path);
        assert!(exec_path.exists());

        provider.cleanup(&reclaimed.cleanup_token).unwrap();
    }
}
