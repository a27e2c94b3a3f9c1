//! Prepare/resolve pipeline: fingerprint → lookup-or-create state →
//! materialize instance, with at-most-one-build-per-fingerprint
//! concurrency control.

use async_trait::async_trait;
use dbcask_registry::{InstanceRecord, NameRecord, Registry, StateRecord};
use dbcask_runtime::{ExecRequest, RuntimeAdapter, RuntimeHandle};
use dbcask_snapshot::CopyProvider;
use dbcask_snapshot_traits::{
    generate_unique_id, FsSnapshotProvider, PreparedWorkspace, SnapshotProviderKind, SnapshotRef,
    WorkingCopyMode,
};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Default deadline for [`dbcask_runtime::RuntimeAdapter::wait_for_ready`]
/// when a caller doesn't need a different one. Real adapters starting an
/// actual container/VM can take much longer than the in-memory test double;
/// this is generous rather than tight.
const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(60);

/// A single prepare-step kind, dispatched by `prepare_kind`. New kinds are
/// added by registering an implementation rather than touching `Engine`'s
/// control flow.
#[async_trait]
pub trait PrepareStep: Send + Sync {
    fn kind(&self) -> &str;

    async fn run(
        &self,
        runtime: &dyn RuntimeAdapter,
        handle: &RuntimeHandle,
        args: &[String],
    ) -> crate::Result<()>;
}

async fn run_command(
    runtime: &dyn RuntimeAdapter,
    handle: &RuntimeHandle,
    program: &str,
    args: &[String],
) -> crate::Result<()> {
    let mut command = vec![program.to_string()];
    command.extend(args.iter().cloned());
    let output = runtime.exec(handle, ExecRequest::new(command)).await?;
    if !output.success() {
        return Err(crate::Error::generic(format!(
            "{program} exited with status {}: {}",
            output.exit_code,
            output.stderr.trim()
        )));
    }
    Ok(())
}

/// Runs a `psql` script or inline statement against the instance.
pub struct PsqlStep;

#[async_trait]
impl PrepareStep for PsqlStep {
    fn kind(&self) -> &str {
        "psql"
    }

    async fn run(&self, runtime: &dyn RuntimeAdapter, handle: &RuntimeHandle, args: &[String]) -> crate::Result<()> {
        run_command(runtime, handle, "psql", args).await
    }
}

/// Runs a `pgbench` workload generator invocation against the instance.
pub struct PgbenchStep;

#[async_trait]
impl PrepareStep for PgbenchStep {
    fn kind(&self) -> &str {
        "pgbench"
    }

    async fn run(&self, runtime: &dyn RuntimeAdapter, handle: &RuntimeHandle, args: &[String]) -> crate::Result<()> {
        run_command(runtime, handle, "pgbench", args).await
    }
}

/// A request to get-or-create a prepared state and materialize a fresh
/// instance from it.
#[derive(Debug, Clone)]
pub struct PrepareRequest {
    pub image_id: String,
    pub prepare_kind: String,
    pub prepare_args: Vec<String>,
    /// If set, the new instance is also registered under this name with
    /// `is_primary = true`.
    pub name: Option<String>,
}

/// The result of a successful `Engine::prepare` call.
#[derive(Debug, Clone)]
pub struct PrepareOutcome {
    pub state_id: String,
    pub instance_id: String,
    pub fingerprint: String,
    /// `false` when an existing state was reused instead of built.
    pub created_new_state: bool,
}

fn provider_kind_to_str(kind: SnapshotProviderKind) -> &'static str {
    match kind {
        SnapshotProviderKind::Copy => "copy",
        SnapshotProviderKind::Subvolume => "subvolume",
        SnapshotProviderKind::Overlay => "overlay",
    }
}

fn parse_provider_kind(recorded: Option<&str>) -> crate::Result<SnapshotProviderKind> {
    match recorded {
        Some("copy") => Ok(SnapshotProviderKind::Copy),
        Some("subvolume") => Ok(SnapshotProviderKind::Subvolume),
        Some("overlay") => Ok(SnapshotProviderKind::Overlay),
        other => Err(crate::Error::integrity(format!("unrecognized snapshot provider recorded: {other:?}"))),
    }
}

/// Ties the registry, snapshot manager, runtime adapter, and DBMS connector
/// together into the prepare/resolve pipeline described in this crate's
/// module documentation.
pub struct Engine {
    registry: Registry,
    snapshot_root: PathBuf,
    /// Probed once at construction — the overlay/subvolume probe is
    /// comparatively expensive and this is a long-lived handle.
    provider: Arc<dyn FsSnapshotProvider>,
    /// `provider.detect_capabilities`, cached from that same construction-
    /// time probe. The overlay backend's probe performs a real throwaway
    /// mount/unmount cycle (see `dbcask-snapshot-overlay`), so this must not
    /// be recomputed on every `prepare`/`instantiate` call.
    capabilities: dbcask_snapshot_traits::ProviderCapabilities,
    runtime: Arc<dyn RuntimeAdapter>,
    connector: Arc<dyn dbcask_connector::DbConnector>,
    steps: HashMap<String, Arc<dyn PrepareStep>>,
    build_locks: AsyncMutex<HashMap<String, Arc<AsyncMutex<()>>>>,
    cancellation: CancellationToken,
}

impl Engine {
    pub fn new(
        registry: Registry,
        snapshot_root: PathBuf,
        runtime: Arc<dyn RuntimeAdapter>,
        connector: Arc<dyn dbcask_connector::DbConnector>,
    ) -> crate::Result<Self> {
        std::fs::create_dir_all(&snapshot_root)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&snapshot_root, std::fs::Permissions::from_mode(0o700))?;
        }

        // `provider_for`'s own `CopyProvider` defaults to a system temp
        // directory; when it's the one selected, replace it with a copy
        // provider rooted under this engine's configured state root so the
        // on-disk layout matches `states/<state_id>/` regardless of backend.
        let probed: Arc<dyn FsSnapshotProvider> = Arc::from(dbcask_snapshot::provider_for(&snapshot_root)?);
        let provider: Arc<dyn FsSnapshotProvider> = if probed.kind() == SnapshotProviderKind::Copy {
            Arc::new(CopyProvider::with_store_root(snapshot_root.join("states")))
        } else {
            probed
        };

        let capabilities = provider.detect_capabilities(&snapshot_root);

        let mut steps: HashMap<String, Arc<dyn PrepareStep>> = HashMap::new();
        steps.insert("psql".to_string(), Arc::new(PsqlStep));
        steps.insert("pgbench".to_string(), Arc::new(PgbenchStep));

        Ok(Self {
            registry,
            snapshot_root,
            provider,
            capabilities,
            runtime,
            connector,
            steps,
            build_locks: AsyncMutex::new(HashMap::new()),
            cancellation: CancellationToken::new(),
        })
    }

    /// Register a prepare step kind beyond the built-in `psql`/`pgbench`.
    pub fn register_step(&mut self, step: Arc<dyn PrepareStep>) {
        self.steps.insert(step.kind().to_string(), step);
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// The token every suspend point in this engine checks before
    /// continuing. Cancelling it (or a parent token it was derived from)
    /// causes the next `prepare`/`instantiate` suspension point to bail out
    /// with [`crate::Error::Cancelled`] and run the same compensating
    /// cleanup as a hard error on that path.
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancellation
    }

    /// Replace this engine's cancellation token with a child of `parent`,
    /// so cancelling `parent` also cancels every in-flight operation here.
    pub fn with_cancellation_parent(mut self, parent: &CancellationToken) -> Self {
        self.cancellation = parent.child_token();
        self
    }

    fn check_cancelled(&self) -> crate::Result<()> {
        if self.cancellation.is_cancelled() {
            return Err(crate::Error::Cancelled);
        }
        Ok(())
    }

    async fn fingerprint_lock(&self, fingerprint: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self.build_locks.lock().await;
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        locks.entry(fingerprint.to_string()).or_insert_with(|| Arc::new(AsyncMutex::new(()))).clone()
    }

    pub async fn prepare(&self, req: PrepareRequest) -> crate::Result<PrepareOutcome> {
        self.check_cancelled()?;
        let normalized_args = dbcask_ids::normalize_args(&req.prepare_args);
        let fingerprint = dbcask_ids::fingerprint(&req.image_id, &req.prepare_kind, &normalized_args).to_string();

        let (state_id, created_new_state) = match self.registry.get_state_by_fingerprint(&fingerprint)? {
            Some(state) => (state.id, false),
            None => {
                let lock = self.fingerprint_lock(&fingerprint).await;
                let _guard = lock.lock().await;
                match self.registry.get_state_by_fingerprint(&fingerprint)? {
                    Some(state) => (state.id, false),
                    None => (self.build_state(&req, &fingerprint, &normalized_args).await?, true),
                }
            }
        };

        self.check_cancelled()?;
        let (instance_id, _cleanup_token) = self.instantiate(&state_id).await?;

        if let Some(name) = &req.name {
            self.registry.upsert_name(&NameRecord {
                name: name.clone(),
                instance_id: Some(instance_id.clone()),
                state_id: Some(state_id.clone()),
                state_fingerprint: fingerprint.clone(),
                image_id: req.image_id.clone(),
                last_used_at: Some(chrono::Utc::now().to_rfc3339()),
                is_primary: true,
            })?;
        }

        Ok(PrepareOutcome { state_id, instance_id, fingerprint, created_new_state })
    }

    async fn build_state(
        &self,
        req: &PrepareRequest,
        fingerprint: &str,
        normalized_args: &[String],
    ) -> crate::Result<String> {
        let step = self
            .steps
            .get(&req.prepare_kind)
            .cloned()
            .ok_or_else(|| crate::Error::validation(format!("unrecognized prepare kind: {}", req.prepare_kind)))?;

        self.runtime.init_base(&req.image_id).await?;

        let build_dir = self.snapshot_root.join("build").join(generate_unique_id());
        std::fs::create_dir_all(&build_dir)?;

        let snapshot_result = self.run_build(&req.image_id, normalized_args, step.as_ref(), &build_dir).await;
        let _ = std::fs::remove_dir_all(&build_dir);
        let snap = snapshot_result?;

        let state_id = dbcask_ids::generate_id();
        let record = StateRecord {
            id: state_id.clone(),
            fingerprint: fingerprint.to_string(),
            image_id: req.image_id.clone(),
            prepare_kind: req.prepare_kind.clone(),
            prepare_args_normalized: serde_json::to_string(normalized_args)?,
            created_at: chrono::Utc::now().to_rfc3339(),
            size_bytes: None,
            status: "ready".to_string(),
            parent_state_id: None,
            last_used_at: None,
            use_count: 0,
            min_retention_until: None,
            evicted_at: None,
            eviction_reason: None,
            snapshot_path: snap.meta.get("snapshot_path").or_else(|| snap.meta.get("path")).cloned(),
            snapshot_provider: Some(provider_kind_to_str(snap.provider).to_string()),
        };

        if let Err(e) = self.registry.create_state(&record) {
            self.destroy_snapshot(&snap);
            return Err(e.into());
        }

        Ok(state_id)
    }

    async fn run_build(
        &self,
        image_id: &str,
        normalized_args: &[String],
        step: &dyn PrepareStep,
        build_dir: &Path,
    ) -> crate::Result<SnapshotRef> {
        let ws = self.provider.prepare_writable_workspace(build_dir, WorkingCopyMode::InPlace)?;

        let handle = self.runtime.start(image_id, &ws.exec_path.to_string_lossy()).await?;
        if let Err(e) = self.runtime.wait_for_ready(&handle, DEFAULT_READY_TIMEOUT).await {
            let _ = self.runtime.stop(&handle).await;
            return Err(e.into());
        }

        let step_result = match self.check_cancelled() {
            Ok(()) => step.run(self.runtime.as_ref(), &handle, normalized_args).await,
            Err(e) => Err(e),
        };
        let snapshot_result = match step_result {
            Ok(()) => self.quiesce_and_snapshot(&handle, &ws).await,
            Err(e) => Err(e),
        };

        if let Err(e) = self.runtime.stop(&handle).await {
            warn!(error = %e, "failed to stop build runtime instance");
        }

        snapshot_result
    }

    async fn quiesce_and_snapshot(&self, handle: &RuntimeHandle, ws: &PreparedWorkspace) -> crate::Result<SnapshotRef> {
        let caps = &self.capabilities;
        if caps.requires_db_stop {
            self.connector.quiesce(self.runtime.as_ref(), handle, &ws.exec_path.to_string_lossy()).await?;
        }
        Ok(self.provider.snapshot_now(ws, None)?)
    }

    fn destroy_snapshot(&self, snap: &SnapshotRef) {
        match self.provider.mount_readonly(snap) {
            Ok(path) => {
                if let Err(e) = std::fs::remove_dir_all(&path) {
                    warn!(error = %e, path = %path.display(), "failed to remove snapshot during compensating cleanup");
                }
            }
            Err(e) => warn!(error = %e, "failed to resolve snapshot path during compensating cleanup"),
        }
    }

    async fn instantiate(&self, state_id: &str) -> crate::Result<(String, String)> {
        self.check_cancelled()?;
        let entry = self
            .registry
            .get_state(state_id)?
            .ok_or_else(|| crate::Error::integrity(format!("state {state_id} missing from registry")))?;
        let state = entry.state;

        let snapshot_path = state
            .snapshot_path
            .clone()
            .ok_or_else(|| crate::Error::integrity(format!("state {state_id} has no recorded snapshot path")))?;
        if !Path::new(&snapshot_path).exists() {
            return Err(crate::Error::integrity(format!(
                "state {state_id} snapshot missing on disk: {snapshot_path}"
            )));
        }
        let provider_kind = parse_provider_kind(state.snapshot_provider.as_deref())?;
        let snap = SnapshotRef::from_recorded_path(provider_kind, state.id.clone(), Path::new(&snapshot_path));

        let caps = &self.capabilities;
        let (provider, ws): (Arc<dyn FsSnapshotProvider>, PreparedWorkspace) = if caps.writable_clone {
            let ws = self.provider.branch_from_snapshot(&snap, WorkingCopyMode::CowOverlay)?;
            (self.provider.clone(), ws)
        } else {
            let fallback: Arc<dyn FsSnapshotProvider> =
                Arc::new(CopyProvider::with_store_root(self.snapshot_root.join("instances")));
            let ws = fallback.branch_from_snapshot(&snap, WorkingCopyMode::CowOverlay)?;
            (fallback, ws)
        };

        // `guard` releases the clone on every early return below unless
        // explicitly disarmed after the instance row commits.
        let guard = dbcask_snapshot::CloneGuard::new(provider, ws);
        self.check_cancelled()?;

        let handle = self.runtime.start(&state.image_id, &guard.workspace().exec_path.to_string_lossy()).await?;
        if let Err(e) = self.runtime.wait_for_ready(&handle, DEFAULT_READY_TIMEOUT).await {
            let _ = self.runtime.stop(&handle).await;
            return Err(e.into());
        }

        let instance_id = dbcask_ids::generate_id();
        let cleanup_token = guard.workspace().cleanup_token.clone();
        let record = InstanceRecord {
            id: instance_id.clone(),
            state_id: state_id.to_string(),
            image_id: state.image_id.clone(),
            created_at: chrono::Utc::now().to_rfc3339(),
            expires_at: None,
            status: "active".to_string(),
            runtime_id: Some(handle.0.clone()),
            runtime_dir: Some(guard.workspace().exec_path.to_string_lossy().to_string()),
            clone_cleanup_token: Some(cleanup_token.clone()),
        };

        self.registry.create_instance(&record)?;
        guard.into_inner();

        Ok((instance_id, cleanup_token))
    }

    /// Stop the backing runtime instance (if any), release its clone, and
    /// remove the instance row. The `CloneGuard` used at creation is the
    /// only other thing capable of releasing this clone; once its token is
    /// persisted, this is the sole path back to a clean state.
    pub async fn destroy_instance(&self, instance_id: &str) -> crate::Result<()> {
        let entry = self
            .registry
            .get_instance(instance_id)?
            .ok_or_else(|| crate::Error::validation(format!("instance {instance_id} not found")))?;

        if let Some(runtime_id) = &entry.instance.runtime_id {
            let handle = RuntimeHandle(runtime_id.clone());
            if let Err(e) = self.runtime.stop(&handle).await {
                warn!(error = %e, "failed to stop runtime instance during destroy");
            }
        }

        if let Some(token) = &entry.instance.clone_cleanup_token {
            if let Err(e) = self.provider.cleanup(token) {
                warn!(error = %e, "failed to release clone during destroy");
            }
        }

        self.registry.delete_instance(instance_id)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dbcask_connector::PostgresConnector;
    use dbcask_runtime::InMemoryRuntime;

    fn engine(store_root: &Path) -> Engine {
        Engine::new(
            Registry::open_in_memory().unwrap(),
            store_root.to_path_buf(),
            Arc::new(InMemoryRuntime::new()),
            Arc::new(PostgresConnector::new()),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn repeated_prepare_reuses_the_cached_state() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());

        let req = || PrepareRequest {
            image_id: "postgres:16".to_string(),
            prepare_kind: "psql".to_string(),
            prepare_args: vec!["-f".to_string(), "init.sql".to_string()],
            name: None,
        };

        let first = engine.prepare(req()).await.unwrap();
        assert!(first.created_new_state);

        let second = engine.prepare(req()).await.unwrap();
        assert!(!second.created_new_state);
        assert_eq!(first.state_id, second.state_id);
        assert_ne!(first.instance_id, second.instance_id);

        let entry = engine.registry().get_state(&first.state_id).unwrap().unwrap();
        assert_eq!(entry.refcount, 2);
    }

    #[tokio::test]
    async fn distinct_fingerprints_produce_distinct_states() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());

        let a = engine
            .prepare(PrepareRequest {
                image_id: "postgres:16".to_string(),
                prepare_kind: "psql".to_string(),
                prepare_args: vec!["-f".to_string(), "a.sql".to_string()],
                name: None,
            })
            .await
            .unwrap();
        let b = engine
            .prepare(PrepareRequest {
                image_id: "postgres:16".to_string(),
                prepare_kind: "psql".to_string(),
                prepare_args: vec!["-f".to_string(), "b.sql".to_string()],
                name: None,
            })
            .await
            .unwrap();

        assert_ne!(a.state_id, b.state_id);
        assert_ne!(a.fingerprint, b.fingerprint);
    }

    #[tokio::test]
    async fn prepare_assigns_the_requested_name() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());

        let outcome = engine
            .prepare(PrepareRequest {
                image_id: "postgres:16".to_string(),
                prepare_kind: "psql".to_string(),
                prepare_args: vec![],
                name: Some("scratch".to_string()),
            })
            .await
            .unwrap();

        let name = engine.registry().get_name("scratch").unwrap().unwrap();
        assert_eq!(name.name.instance_id.as_deref(), Some(outcome.instance_id.as_str()));
        assert!(name.name.is_primary);
    }

    #[tokio::test]
    async fn delete_state_is_blocked_while_an_instance_references_it() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());

        let outcome = engine
            .prepare(PrepareRequest {
                image_id: "postgres:16".to_string(),
                prepare_kind: "psql".to_string(),
                prepare_args: vec![],
                name: None,
            })
            .await
            .unwrap();

        assert!(engine.registry().delete_state(&outcome.state_id).is_err());

        engine.destroy_instance(&outcome.instance_id).await.unwrap();
        engine.registry().delete_state(&outcome.state_id).unwrap();
    }

    #[tokio::test]
    async fn destroy_instance_releases_the_clone_directory() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());

        let outcome = engine
            .prepare(PrepareRequest {
                image_id: "postgres:16".to_string(),
                prepare_kind: "psql".to_string(),
                prepare_args: vec![],
                name: None,
            })
            .await
            .unwrap();

        let instance = engine.registry().get_instance(&outcome.instance_id).unwrap().unwrap();
        let clone_dir = instance.instance.runtime_dir.clone().unwrap();
        assert!(Path::new(&clone_dir).exists());

        engine.destroy_instance(&outcome.instance_id).await.unwrap();
        assert!(!Path::new(&clone_dir).exists());
    }

    #[tokio::test]
    async fn unrecognized_prepare_kind_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());

        let result = engine
            .prepare(PrepareRequest {
                image_id: "postgres:16".to_string(),
                prepare_kind: "mysqldump".to_string(),
                prepare_args: vec![],
                name: None,
            })
            .await;
        assert!(matches!(result, Err(crate::Error::Validation(_))));
    }

    #[tokio::test]
    async fn cancelling_the_token_aborts_the_next_suspension_point() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());
        engine.cancellation_token().cancel();

        let result = engine
            .prepare(PrepareRequest {
                image_id: "postgres:16".to_string(),
                prepare_kind: "psql".to_string(),
                prepare_args: vec![],
                name: None,
            })
            .await;
        assert!(matches!(result, Err(crate::Error::Cancelled)));
    }

    #[tokio::test]
    async fn a_cancelled_parent_token_cancels_a_child_engine() {
        let dir = tempfile::tempdir().unwrap();
        let parent = CancellationToken::new();
        let engine = engine(dir.path()).with_cancellation_parent(&parent);
        parent.cancel();

        let result = engine.resolve("anything").await;
        // `resolve` itself doesn't check cancellation (it never suspends on
        // anything but the registry), but `prepare` does.
        assert!(result.is_ok());

        let result = engine
            .prepare(PrepareRequest {
                image_id: "postgres:16".to_string(),
                prepare_kind: "psql".to_string(),
                prepare_args: vec![],
                name: None,
            })
            .await;
        assert!(matches!(result, Err(crate::Error::Cancelled)));
    }
}
