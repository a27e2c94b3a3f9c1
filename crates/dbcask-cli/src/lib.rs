//! `dbcask` command-line interface: a thin `clap` front end over
//! [`dbcask_core::Engine`] and [`dbcask_registry::Registry`] for local,
//! manual use of the prepare/resolve pipeline.

pub mod get;
pub mod list;
pub mod prepare;
pub mod rm;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use dbcask_connector::PostgresConnector;
use dbcask_core::Engine;
use dbcask_registry::{Database, Registry};
use dbcask_runtime::InMemoryRuntime;

#[derive(Parser)]
#[command(name = "dbcask")]
#[command(about = "Manage ephemeral database instances from a cache of prepared states")]
#[command(version, author, long_about = None)]
pub struct Cli {
    /// Path to the SQLite registry database. Defaults to the platform
    /// default (see `Database::default_path`), overridable with
    /// `DBCASK_HOME`.
    #[arg(long, global = true)]
    pub db_path: Option<PathBuf>,

    /// Root directory for prepared-state and instance snapshots. Defaults
    /// to a directory next to the registry database.
    #[arg(long, global = true)]
    pub state_root: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Get or build a prepared state and materialize a fresh instance.
    Prepare(prepare::PrepareArgs),
    /// Resolve an instance ID or name.
    Get(get::GetArgs),
    /// List states, instances, or names.
    List(list::ListArgs),
    /// Remove an instance or a state.
    Rm(rm::RmArgs),
}

/// Open the registry at `db_path`, or the platform default when unset.
pub fn open_registry(db_path: Option<&Path>) -> anyhow::Result<Registry> {
    let registry = match db_path {
        Some(path) => Registry::new(Database::open(path)?),
        None => Registry::open_default()?,
    };
    Ok(registry)
}

/// Resolve the snapshot store root: the explicit `--state-root`, or a
/// `state` directory next to the registry database.
pub fn resolve_state_root(db_path: Option<&Path>, state_root: Option<PathBuf>) -> anyhow::Result<PathBuf> {
    if let Some(root) = state_root {
        return Ok(root);
    }
    let db_path = match db_path {
        Some(path) => path.to_path_buf(),
        None => Database::default_path()?,
    };
    let parent = db_path.parent().map(Path::to_path_buf).unwrap_or_else(|| PathBuf::from("."));
    Ok(parent.join("state"))
}

/// Build the `Engine` this CLI drives everything through.
///
/// The CLI is a local, manual-use front end (per this crate's module
/// documentation); it runs against the in-memory runtime test double and a
/// `pg_ctl`-based Postgres connector rather than a real container or VM
/// runtime, which is an out-of-scope external collaborator for this crate.
pub fn build_engine(db_path: Option<&Path>, state_root: Option<PathBuf>) -> anyhow::Result<Engine> {
    let registry = open_registry(db_path)?;
    let root = resolve_state_root(db_path, state_root)?;
    let engine = Engine::new(registry, root, Arc::new(InMemoryRuntime::new()), Arc::new(PostgresConnector::new()))?;
    Ok(engine)
}
