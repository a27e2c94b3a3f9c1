//! Abstract container/VM runtime adapter consumed by dbcask.
//!
//! dbcask never invokes a container runtime directly. Every lifecycle action
//! — materializing a base image, starting/stopping an instance, running a
//! command inside one — goes through [`RuntimeAdapter`]. Concrete adapters
//! (Docker, Firecracker, whatever a deployment wires in) live outside this
//! crate; [`InMemoryRuntime`] here exists only so the rest of dbcask can be
//! tested without a real runtime.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("runtime instance not found: {0}")]
    NotFound(String),

    #[error("runtime operation failed: {0}")]
    Operation(String),

    #[error("runtime instance {0} did not become ready within the deadline")]
    ReadyTimeout(String),
}

impl Error {
    pub fn operation<S: Into<String>>(message: S) -> Self {
        Self::Operation(message.into())
    }
}

/// Opaque handle identifying a runtime-managed instance (container/VM).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RuntimeHandle(pub String);

/// A command to run inside a runtime instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecRequest {
    pub command: Vec<String>,
    pub env: HashMap<String, String>,
    pub working_dir: Option<String>,
}

impl ExecRequest {
    pub fn new(command: Vec<String>) -> Self {
        Self { command, env: HashMap::new(), working_dir: None }
    }
}

/// The result of running a command via [`RuntimeAdapter::exec`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Lifecycle operations a runtime must provide for dbcask to manage instances
/// running on top of it. Every method is async: real adapters shell out to a
/// daemon or hypervisor API.
#[async_trait]
pub trait RuntimeAdapter: Send + Sync {
    /// Ensure the base image identified by `image_id` is present locally,
    /// pulling/building it if necessary.
    async fn init_base(&self, image_id: &str) -> Result<()>;

    /// Resolve `image_id` to a runtime-specific reference (e.g. a content
    /// digest) that can be pinned in the registry.
    async fn resolve_image(&self, image_id: &str) -> Result<String>;

    /// Start an instance from `image_id` rooted at `exec_path`, returning a
    /// handle the caller uses for subsequent operations.
    async fn start(&self, image_id: &str, exec_path: &str) -> Result<RuntimeHandle>;

    /// Stop a running instance. Must be idempotent: stopping an
    /// already-stopped instance is not an error.
    async fn stop(&self, handle: &RuntimeHandle) -> Result<()>;

    /// Run a command inside a running instance and collect its output.
    async fn exec(&self, handle: &RuntimeHandle, request: ExecRequest) -> Result<ExecOutput>;

    /// Block until the instance reports ready, or `timeout` elapses
    /// (surfaced as [`Error::ReadyTimeout`]). The caller supplies the
    /// deadline; this is the one call in the trait that does not inherit
    /// the ambient cancellation token, since readiness polling needs its
    /// own bound independent of whatever the caller's cancellation
    /// deadline happens to be.
    async fn wait_for_ready(&self, handle: &RuntimeHandle, timeout: Duration) -> Result<()>;
}

#[derive(Debug, Clone)]
struct InMemoryInstance {
    image_id: String,
    running: bool,
}

/// A `RuntimeAdapter` test double that tracks instance state in memory and
/// never shells out to anything. Used by dbcask-core and dbcask-connector
/// tests in place of a real container/VM runtime.
#[derive(Clone, Default)]
pub struct InMemoryRuntime {
    instances: Arc<RwLock<HashMap<String, InMemoryInstance>>>,
    next_id: Arc<RwLock<u64>>,
}

impl InMemoryRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn is_running(&self, handle: &RuntimeHandle) -> bool {
        self.instances.read().await.get(&handle.0).map(|i| i.running).unwrap_or(false)
    }
}

#[async_trait]
impl RuntimeAdapter for InMemoryRuntime {
    async fn init_base(&self, _image_id: &str) -> Result<()> {
        Ok(())
    }

    async fn resolve_image(&self, image_id: &str) -> Result<String> {
        Ok(format!("resolved:{image_id}"))
    }

    async fn start(&self, image_id: &str, _exec_path: &str) -> Result<RuntimeHandle> {
        let mut next_id = self.next_id.write().await;
        *next_id += 1;
        let handle = RuntimeHandle(format!("inmem-{next_id}"));
        self.instances
            .write()
            .await
            .insert(handle.0.clone(), InMemoryInstance { image_id: image_id.to_string(), running: true });
        Ok(handle)
    }

    async fn stop(&self, handle: &RuntimeHandle) -> Result<()> {
        if let Some(instance) = self.instances.write().await.get_mut(&handle.0) {
            instance.running = false;
        }
        Ok(())
    }

    async fn exec(&self, handle: &RuntimeHandle, request: ExecRequest) -> Result<ExecOutput> {
        let instances = self.instances.read().await;
        let instance = instances.get(&handle.0).ok_or_else(|| Error::NotFound(handle.0.clone()))?;
        if !instance.running {
            return Err(Error::operation(format!("instance {} is not running", handle.0)));
        }
        Ok(ExecOutput {
            exit_code: 0,
            stdout: format!("ran {:?} against {}", request.command, instance.image_id),
            stderr: String::new(),
        })
    }

    async fn wait_for_ready(&self, handle: &RuntimeHandle, timeout: Duration) -> Result<()> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.is_running(handle).await {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(Error::ReadyTimeout(handle.0.clone()));
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn start_stop_and_exec_round_trip() {
        let runtime = InMemoryRuntime::new();
        let handle = runtime.start("postgres:16", "/work").await.unwrap();
        assert!(runtime.is_running(&handle).await);

        runtime.wait_for_ready(&handle, Duration::from_secs(1)).await.unwrap();

        let out = runtime.exec(&handle, ExecRequest::new(vec!["pg_ctl".into(), "status".into()])).await.unwrap();
        assert!(out.success());

        runtime.stop(&handle).await.unwrap();
        assert!(!runtime.is_running(&handle).await);
    }

    #[tokio::test]
    async fn exec_against_unknown_handle_fails() {
        let runtime = InMemoryRuntime::new();
        let handle = RuntimeHandle("ghost".to_string());
        let result = runtime.exec(&handle, ExecRequest::new(vec!["true".into()])).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn wait_for_ready_fails_once_stopped() {
        let runtime = InMemoryRuntime::new();
        let handle = runtime.start("postgres:16", "/work").await.unwrap();
        runtime.stop(&handle).await.unwrap();
        assert!(runtime.wait_for_ready(&handle, Duration::from_millis(20)).await.is_err());
    }
}
