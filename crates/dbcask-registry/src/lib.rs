//! Persistent registry of prepared database states, ephemeral instances,
//! and the names pointing at them.
//!
//! Backed by SQLite through [`rusqlite`], one [`connection::Database`]
//! handle wrapping a `Mutex<Connection>` in WAL mode. All mutating
//! operations run inside [`connection::Database::transaction`]. Every
//! operation here is synchronous — the registry does no I/O that benefits
//! from async.

mod connection;
mod migrations;
mod models;
pub mod schema;
pub mod wire;

pub use connection::Database;
pub use migrations::MigrationManager;
pub use models::{
    InstanceEntry, InstanceFilter, InstanceRecord, InstanceStatus, InstanceStore, NameEntry,
    NameFilter, NameRecord, NameStatus, NameStore, StateEntry, StateFilter, StateRecord, StateStore,
};
pub use wire::render_listing;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("registry error: {0}")]
    Generic(String),
}

impl Error {
    pub fn not_found<S: Into<String>>(message: S) -> Self {
        Self::NotFound(message.into())
    }

    pub fn conflict<S: Into<String>>(message: S) -> Self {
        Self::Conflict(message.into())
    }

    pub fn generic<S: Into<String>>(message: S) -> Self {
        Self::Generic(message.into())
    }
}

/// High-level facade combining the individual table stores for operations
/// that must span more than one table inside a single transaction.
pub struct Registry {
    db: Database,
}

impl Registry {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn open_default() -> Result<Self> {
        Ok(Self::new(Database::open_default()?))
    }

    pub fn open_in_memory() -> Result<Self> {
        Ok(Self::new(Database::open_in_memory()?))
    }

    pub fn create_state(&self, record: &StateRecord) -> Result<()> {
        self.db.transaction(|conn| StateStore::new(conn).insert(record))
    }

    pub fn get_state(&self, id: &str) -> Result<Option<StateEntry>> {
        self.db.transaction(|conn| StateStore::new(conn).get(id))
    }

    pub fn get_state_by_fingerprint(&self, fingerprint: &str) -> Result<Option<StateRecord>> {
        self.db.transaction(|conn| StateStore::new(conn).get_by_fingerprint(fingerprint))
    }

    pub fn list_states(&self, filter: &StateFilter) -> Result<Vec<StateEntry>> {
        self.db.transaction(|conn| StateStore::new(conn).list(filter))
    }

    pub fn delete_state(&self, id: &str) -> Result<()> {
        self.db.transaction(|conn| StateStore::new(conn).delete(id))
    }

    pub fn update_state_retention(&self, id: &str, min_retention_until: Option<&str>) -> Result<()> {
        self.db.transaction(|conn| StateStore::new(conn).update_retention(id, min_retention_until))
    }

    pub fn mark_state_evicted(&self, id: &str, reason: &str) -> Result<()> {
        self.db.transaction(|conn| StateStore::new(conn).mark_evicted(id, reason))
    }

    /// Insert an instance row and bump the parent state's `last_used_at` /
    /// `use_count` in the same transaction.
    pub fn create_instance(&self, record: &InstanceRecord) -> Result<()> {
        self.db.transaction(|conn| {
            InstanceStore::new(conn).insert(record)?;
            StateStore::new(conn).touch(&record.state_id)
        })
    }

    pub fn get_instance(&self, id: &str) -> Result<Option<InstanceEntry>> {
        self.db.transaction(|conn| InstanceStore::new(conn).get(id))
    }

    pub fn list_instances(&self, filter: &InstanceFilter) -> Result<Vec<InstanceEntry>> {
        self.db.transaction(|conn| InstanceStore::new(conn).list(filter))
    }

    pub fn delete_instance(&self, id: &str) -> Result<()> {
        self.db.transaction(|conn| InstanceStore::new(conn).delete(id))
    }

    pub fn upsert_name(&self, record: &NameRecord) -> Result<()> {
        self.db.transaction(|conn| NameStore::new(conn).upsert(record))
    }

    pub fn get_name(&self, name: &str) -> Result<Option<NameEntry>> {
        self.db.transaction(|conn| NameStore::new(conn).get(name))
    }

    pub fn list_names(&self, filter: &NameFilter) -> Result<Vec<NameEntry>> {
        self.db.transaction(|conn| NameStore::new(conn).list(filter))
    }

    /// Drop the handle. SQLite connections close on drop; this method
    /// exists for symmetry and explicit lifetime signaling in callers.
    pub fn close(self) {
        drop(self);
    }
}
