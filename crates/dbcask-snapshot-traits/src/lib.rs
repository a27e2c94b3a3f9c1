//! Common traits and types for dbcask filesystem snapshot providers.
//!
//! A snapshot provider knows how to take an immutable capture of a
//! directory (`snapshot_now`) and how to materialize a private writable
//! copy of either a live directory or a prior snapshot (`prepare_writable_workspace`
//! / `branch_from_snapshot`). Providers are backend-polymorphic: the same
//! trait is implemented by a plain recursive-copy backend and by backends
//! that use filesystem-native copy-on-write primitives.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by snapshot providers.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("provider error: {0}")]
    Provider(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("backend unsupported: {0}")]
    Unsupported(String),

    #[error("cleanup token already released: {0}")]
    AlreadyReleased(String),

    #[error("validation error: {0}")]
    Validation(String),
}

impl Error {
    pub fn provider<S: Into<String>>(message: S) -> Self {
        Self::Provider(message.into())
    }

    pub fn unsupported<S: Into<String>>(message: S) -> Self {
        Self::Unsupported(message.into())
    }

    pub fn validation<S: Into<String>>(message: S) -> Self {
        Self::Validation(message.into())
    }
}

/// Identifies which backend produced a capability set / workspace / snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SnapshotProviderKind {
    /// Plain recursive directory copy. Universal fallback.
    Copy,
    /// Copy-on-write subvolume snapshots (e.g. Btrfs).
    Subvolume,
    /// Overlay filesystem mounts (upper/lower/work directories).
    Overlay,
}

/// What a provider can do on the host it was probed against.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderCapabilities {
    pub kind: SnapshotProviderKind,
    /// Higher score wins when more than one provider is viable on a path.
    pub score: u32,
    /// The database must be quiesced before `snapshot_now` is called.
    pub requires_db_stop: bool,
    /// `prepare_writable_workspace`/`branch_from_snapshot` return a directory
    /// the caller may write into without affecting the snapshot source.
    pub writable_clone: bool,
    /// The backend can transfer snapshots to another host (send/receive).
    pub send_receive: bool,
    pub notes: Vec<String>,
}

/// How a workspace derived from a snapshot should behave.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkingCopyMode {
    /// Operate directly on the source path; no copy is made.
    InPlace,
    /// A private, writable copy-on-write clone.
    CowOverlay,
    /// Let the provider pick the best mode it supports.
    Auto,
}

/// A writable (or in-place) workspace prepared by a provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreparedWorkspace {
    /// Path the caller should execute against.
    pub exec_path: PathBuf,
    pub working_copy: WorkingCopyMode,
    pub provider: SnapshotProviderKind,
    /// Opaque token consumed by `FsSnapshotProvider::cleanup`.
    pub cleanup_token: String,
}

/// A reference to a point-in-time, read-only capture of a workspace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotRef {
    pub id: String,
    pub label: Option<String>,
    pub provider: SnapshotProviderKind,
    pub meta: HashMap<String, String>,
}

/// Backend-polymorphic snapshot/clone provider.
pub trait FsSnapshotProvider: Send + Sync {
    fn kind(&self) -> SnapshotProviderKind;

    /// Probe whether this backend can service `root`, and how well.
    fn detect_capabilities(&self, root: &Path) -> ProviderCapabilities;

    /// Prepare a workspace derived from a live directory.
    fn prepare_writable_workspace(
        &self,
        root: &Path,
        mode: WorkingCopyMode,
    ) -> Result<PreparedWorkspace>;

    /// Capture `ws.exec_path` as an immutable, addressable snapshot.
    fn snapshot_now(&self, ws: &PreparedWorkspace, label: Option<&str>) -> Result<SnapshotRef>;

    /// Resolve a snapshot to a path that may be read, but not written.
    fn mount_readonly(&self, snap: &SnapshotRef) -> Result<PathBuf>;

    /// Prepare a new workspace derived from a prior snapshot.
    fn branch_from_snapshot(
        &self,
        snap: &SnapshotRef,
        mode: WorkingCopyMode,
    ) -> Result<PreparedWorkspace>;

    /// Release whatever `prepare_writable_workspace`/`branch_from_snapshot`
    /// allocated, identified by `cleanup_token`.
    fn cleanup(&self, token: &str) -> Result<()>;
}

/// Generate a unique identifier suitable for naming provider-internal
/// resources (snapshot directories, subvolume names). Not used for state or
/// instance IDs — see `dbcask_ids::generate_id` for those.
pub fn generate_unique_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

impl SnapshotRef {
    /// Reconstruct a `SnapshotRef` from a path persisted in the registry.
    ///
    /// Providers disagree on which `meta` key holds the snapshot path
    /// (`CopyProvider`/`OverlayProvider` read `"path"`, `SubvolumeProvider`
    /// reads `"snapshot_path"`), so this populates both. Lets a process that
    /// didn't build a state still `branch_from_snapshot`/`mount_readonly`
    /// it, as long as it has the right provider for `provider`.
    pub fn from_recorded_path(provider: SnapshotProviderKind, id: String, path: &Path) -> Self {
        let path_str = path.display().to_string();
        let mut meta = HashMap::new();
        meta.insert("path".to_string(), path_str.clone());
        meta.insert("snapshot_path".to_string(), path_str);
        Self { id, label: None, provider, meta }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generate_unique_id_is_unique() {
        assert_ne!(generate_unique_id(), generate_unique_id());
    }

    #[test]
    fn error_constructors_wrap_message() {
        let err = Error::provider("boom");
        assert!(err.to_string().contains("boom"));
    }

    #[test]
    fn from_recorded_path_populates_both_meta_keys() {
        let snap = SnapshotRef::from_recorded_path(
            SnapshotProviderKind::Subvolume,
            "snap-1".to_string(),
            Path::new("/var/lib/dbcask/states/snap-1"),
        );
        assert_eq!(snap.meta.get("path").unwrap(), "/var/lib/dbcask/states/snap-1");
        assert_eq!(snap.meta.get("snapshot_path").unwrap(), "/var/lib/dbcask/states/snap-1");
        assert!(snap.label.is_none());
    }
}
