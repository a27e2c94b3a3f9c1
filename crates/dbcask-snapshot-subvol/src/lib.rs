//! Copy-on-write subvolume snapshot backend for dbcask.
//!
//! Targets Btrfs-style subvolumes: `btrfs subvolume snapshot -r` for
//! read-only captures, a second snapshot of that read-only capture for
//! writable branches, and `btrfs subvolume delete` for teardown. All work
//! goes through the `btrfs` CLI rather than ioctls directly, matching how
//! the rest of this backend family shells out to filesystem tooling.

use chrono::Utc;
use dbcask_snapshot_traits::{
    generate_unique_id, Error, FsSnapshotProvider, PreparedWorkspace, ProviderCapabilities, Result,
    SnapshotProviderKind, SnapshotRef, WorkingCopyMode,
};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tracing::debug;

/// Whether a path is, is not, or could not be determined to be a subvolume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubvolumeStatus {
    IsSubvolume,
    NotSubvolume,
    Indeterminate,
}

#[derive(Default)]
pub struct SubvolumeProvider;

impl SubvolumeProvider {
    pub fn new() -> Self {
        Self
    }

    fn btrfs_available() -> bool {
        if !cfg!(target_os = "linux") {
            return false;
        }
        std::process::Command::new("which")
            .arg("btrfs")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|s| s.success())
            .unwrap_or(false)
    }

    /// Filesystem type reported by `stat -f -c %T` for `path`, e.g.
    /// `"btrfs"`, `"ext4"`, `"tmpfs"`.
    pub fn fs_type(path: &Path) -> Result<String> {
        let output = std::process::Command::new("stat")
            .args(["-f", "-c", "%T"])
            .arg(path)
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .output()?;

        if !output.status.success() {
            return Err(Error::provider("failed to determine filesystem type"));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    /// Determine whether `path` is itself a Btrfs subvolume.
    ///
    /// Distinguishes "not a subvolume" from "couldn't tell" so that callers
    /// can choose to fall back to another provider only in the latter case.
    pub fn is_subvolume(&self, path: &Path) -> SubvolumeStatus {
        if !path.exists() {
            return SubvolumeStatus::NotSubvolume;
        }
        let output = std::process::Command::new("btrfs")
            .args(["subvolume", "show"])
            .arg(path)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output();

        match output {
            Ok(out) if out.status.success() => SubvolumeStatus::IsSubvolume,
            Ok(out) => {
                let stderr = String::from_utf8_lossy(&out.stderr);
                if stderr.contains("is not a subvolume") || stderr.contains("Not a Btrfs") {
                    SubvolumeStatus::NotSubvolume
                } else {
                    SubvolumeStatus::Indeterminate
                }
            }
            Err(_) => SubvolumeStatus::Indeterminate,
        }
    }

    /// Create `path` as a fresh, empty subvolume if it does not already
    /// exist as one. No-op if it is already a subvolume. If something else
    /// occupies `path` (a plain directory or file), it is removed first.
    pub fn ensure_subvolume(&self, path: &Path) -> Result<()> {
        match self.is_subvolume(path) {
            SubvolumeStatus::IsSubvolume => Ok(()),
            SubvolumeStatus::NotSubvolume if path.exists() => {
                std::fs::remove_dir_all(path)?;
                self.execute_btrfs_command(&[
                    "subvolume",
                    "create",
                    path.to_str().ok_or_else(|| Error::provider("non-utf8 path"))?,
                ])?;
                Ok(())
            }
            _ => {
                self.execute_btrfs_command(&[
                    "subvolume",
                    "create",
                    path.to_str().ok_or_else(|| Error::provider("non-utf8 path"))?,
                ])?;
                Ok(())
            }
        }
    }

    fn get_subvolume_for_path(&self, path: &Path) -> Result<String> {
        let output = std::process::Command::new("btrfs")
            .args(["subvolume", "show"])
            .arg(path)
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .output()?;

        if !output.status.success() {
            return Err(Error::provider(format!("path is not in a Btrfs subvolume: {}", path.display())));
        }

        let output_str = String::from_utf8_lossy(&output.stdout);
        output_str
            .lines()
            .next()
            .map(|l| l.trim().to_string())
            .ok_or_else(|| Error::provider("failed to parse btrfs subvolume show output"))
    }

    fn execute_btrfs_command(&self, args: &[&str]) -> Result<String> {
        let output = std::process::Command::new("btrfs")
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::provider(format!("btrfs command failed: {stderr}")));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    /// List immediate child subvolumes nested under `path`. Used to enrich
    /// the error when `subvolume delete` fails because children remain.
    fn list_nested_subvolumes(&self, path: &Path) -> Vec<String> {
        let Ok(output) = self.execute_btrfs_command(&["subvolume", "list", "-o", "--", path.to_str().unwrap_or(".")]) else {
            return Vec::new();
        };
        output.lines().map(str::to_string).collect()
    }

    fn delete_subvolume(&self, path: &Path) -> Result<()> {
        if !path.exists() {
            return Ok(());
        }
        let path_str = path.to_str().ok_or_else(|| Error::provider("non-utf8 path"))?;
        if let Err(e) = self.execute_btrfs_command(&["subvolume", "delete", path_str]) {
            let nested = self.list_nested_subvolumes(path);
            if nested.is_empty() {
                return Err(e);
            }
            return Err(Error::provider(format!(
                "{e}; {} nested subvolume(s) remain under {}: {}",
                nested.len(),
                path.display(),
                nested.join(", ")
            )));
        }
        Ok(())
    }
}

impl FsSnapshotProvider for SubvolumeProvider {
    fn kind(&self) -> SnapshotProviderKind {
        SnapshotProviderKind::Subvolume
    }

    fn detect_capabilities(&self, root: &Path) -> ProviderCapabilities {
        if !Self::btrfs_available() {
            return ProviderCapabilities {
                kind: self.kind(),
                score: 0,
                requires_db_stop: true,
                writable_clone: false,
                send_receive: false,
                notes: vec!["btrfs command not available".to_string()],
            };
        }

        match Self::fs_type(root) {
            Ok(fs_type) if fs_type == "btrfs" => match self.get_subvolume_for_path(root) {
                Ok(subvolume) => {
                    debug!(%subvolume, "root resolves to btrfs subvolume");
                    ProviderCapabilities {
                        kind: self.kind(),
                        score: 80,
                        requires_db_stop: true,
                        writable_clone: true,
                        send_receive: true,
                        notes: vec![format!("using btrfs subvolume: {subvolume}")],
                    }
                }
                Err(_) => ProviderCapabilities {
                    kind: self.kind(),
                    score: 0,
                    requires_db_stop: true,
                    writable_clone: false,
                    send_receive: false,
                    notes: vec!["path is not in a btrfs subvolume".to_string()],
                },
            },
            Ok(fs_type) => ProviderCapabilities {
                kind: self.kind(),
                score: 0,
                requires_db_stop: true,
                writable_clone: false,
                send_receive: false,
                notes: vec![format!("path is on {fs_type} filesystem, not btrfs")],
            },
            Err(e) => ProviderCapabilities {
                kind: self.kind(),
                score: 0,
                requires_db_stop: true,
                writable_clone: false,
                send_receive: false,
                notes: vec![format!("failed to detect filesystem: {e}")],
            },
        }
    }

    fn prepare_writable_workspace(
        &self,
        root: &Path,
        mode: WorkingCopyMode,
    ) -> Result<PreparedWorkspace> {
        match mode {
            WorkingCopyMode::InPlace => Ok(PreparedWorkspace {
                exec_path: root.to_path_buf(),
                working_copy: mode,
                provider: self.kind(),
                cleanup_token: format!("subvol:inplace:{}", root.display()),
            }),
            WorkingCopyMode::CowOverlay | WorkingCopyMode::Auto => {
                let unique_id = generate_unique_id();
                let snapshot_path = root.with_file_name(format!("dbcask_snapshot_{unique_id}"));

                self.execute_btrfs_command(&[
                    "subvolume",
                    "snapshot",
                    root.to_str().ok_or_else(|| Error::provider("non-utf8 path"))?,
                    snapshot_path.to_str().ok_or_else(|| Error::provider("non-utf8 path"))?,
                ])?;

                Ok(PreparedWorkspace {
                    exec_path: snapshot_path.clone(),
                    working_copy: WorkingCopyMode::CowOverlay,
                    provider: self.kind(),
                    cleanup_token: format!("subvol:cow:{}", snapshot_path.display()),
                })
            }
        }
    }

    fn snapshot_now(&self, ws: &PreparedWorkspace, label: Option<&str>) -> Result<SnapshotRef> {
        let unique_id = generate_unique_id();
        let snapshot_path = ws.exec_path.with_file_name(format!("dbcask_state_{unique_id}"));

        self.execute_btrfs_command(&[
            "subvolume",
            "snapshot",
            "-r",
            ws.exec_path.to_str().ok_or_else(|| Error::provider("non-utf8 path"))?,
            snapshot_path.to_str().ok_or_else(|| Error::provider("non-utf8 path"))?,
        ])?;

        let mut meta = HashMap::new();
        meta.insert("source_path".to_string(), ws.exec_path.to_string_lossy().to_string());
        meta.insert("snapshot_path".to_string(), snapshot_path.to_string_lossy().to_string());
        meta.insert("timestamp".to_string(), Utc::now().to_rfc3339());

        Ok(SnapshotRef {
            id: format!("subvol_{unique_id}"),
            label: label.map(str::to_string),
            provider: self.kind(),
            meta,
        })
    }

    fn mount_readonly(&self, snap: &SnapshotRef) -> Result<PathBuf> {
        let snapshot_path =
            snap.meta.get("snapshot_path").ok_or_else(|| Error::provider("snapshot missing path metadata"))?;
        let path = PathBuf::from(snapshot_path);
        if path.exists() {
            Ok(path)
        } else {
            Err(Error::provider("subvolume snapshot path does not exist"))
        }
    }

    fn branch_from_snapshot(
        &self,
        snap: &SnapshotRef,
        mode: WorkingCopyMode,
    ) -> Result<PreparedWorkspace> {
        if !matches!(mode, WorkingCopyMode::CowOverlay | WorkingCopyMode::Auto) {
            return Err(Error::unsupported("subvolume branching only supports CowOverlay mode"));
        }

        let snapshot_path = snap
            .meta
            .get("snapshot_path")
            .ok_or_else(|| Error::provider("snapshot missing path metadata"))?;
        let unique_id = generate_unique_id();
        let branch_path = Path::new(snapshot_path).with_file_name(format!("dbcask_branch_{unique_id}"));

        self.execute_btrfs_command(&[
            "subvolume",
            "snapshot",
            snapshot_path,
            branch_path.to_str().ok_or_else(|| Error::provider("non-utf8 path"))?,
        ])?;

        Ok(PreparedWorkspace {
            exec_path: branch_path.clone(),
            working_copy: WorkingCopyMode::CowOverlay,
            provider: self.kind(),
            cleanup_token: format!("subvol:branch:{}", branch_path.display()),
        })
    }

    fn cleanup(&self, token: &str) -> Result<()> {
        if let Some(path) = token.strip_prefix("subvol:inplace:") {
            let _ = path;
            return Ok(());
        }
        if let Some(path) = token.strip_prefix("subvol:cow:") {
            return self.delete_subvolume(Path::new(path));
        }
        if let Some(path) = token.strip_prefix("subvol:branch:") {
            return self.delete_subvolume(Path::new(path));
        }
        Err(Error::provider(format!("invalid subvolume cleanup token: {token}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detect_capabilities_scores_zero_without_btrfs_cli() {
        // On hosts without the btrfs CLI (most CI runners), score must be 0
        // rather than panicking or claiming a false capability.
        if SubvolumeProvider::btrfs_available() {
            return;
        }
        let provider = SubvolumeProvider::new();
        let caps = provider.detect_capabilities(Path::new("/tmp"));
        assert_eq!(caps.score, 0);
    }

    #[test]
    fn cleanup_rejects_unknown_token_shape() {
        let provider = SubvolumeProvider::new();
        assert!(provider.cleanup("garbage").is_err());
    }

    #[test]
    fn cleanup_is_a_noop_for_inplace_tokens() {
        let provider = SubvolumeProvider::new();
        assert!(provider.cleanup("subvol:inplace:/tmp/whatever").is_ok());
    }

    #[test]
    fn is_subvolume_is_false_not_indeterminate_for_a_missing_path() {
        let provider = SubvolumeProvider::new();
        let status = provider.is_subvolume(Path::new("/nonexistent/dbcask-subvol-test-path"));
        assert_eq!(status, SubvolumeStatus::NotSubvolume);
    }

    #[test]
    fn ensure_subvolume_replaces_a_plain_directory_in_place() {
        if !SubvolumeProvider::btrfs_available() {
            return;
        }
        let tmp = tempfile::tempdir().unwrap();
        let target = tmp.path().join("not-a-subvolume");
        std::fs::create_dir_all(&target).unwrap();
        std::fs::write(target.join("marker.txt"), b"leftover").unwrap();

        let provider = SubvolumeProvider::new();
        // Creation itself may still fail on a non-btrfs tempdir filesystem,
        // but the old leftover directory must be gone either way: the old
        // behavior rejected it outright instead of clearing it first.
        let _ = provider.ensure_subvolume(&target);
        assert!(!target.join("marker.txt").exists());
    }
}
