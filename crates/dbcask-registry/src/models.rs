//! Database models and persistence operations for the state/instance/name
//! registry.

use chrono::Utc;
use rusqlite::params;
use serde::{Deserialize, Serialize};

/// Row stored in the `states` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateRecord {
    pub id: String,
    pub fingerprint: String,
    pub image_id: String,
    pub prepare_kind: String,
    pub prepare_args_normalized: String,
    pub created_at: String,
    pub size_bytes: Option<i64>,
    pub status: String,
    pub parent_state_id: Option<String>,
    pub last_used_at: Option<String>,
    pub use_count: i64,
    pub min_retention_until: Option<String>,
    pub evicted_at: Option<String>,
    pub eviction_reason: Option<String>,
    /// On-disk location of the immutable snapshot this state was built
    /// into, as resolved by whichever `FsSnapshotProvider` built it.
    pub snapshot_path: Option<String>,
    /// Which provider kind produced `snapshot_path`, so a later process can
    /// reconstruct a `SnapshotRef` without re-probing the host.
    pub snapshot_provider: Option<String>,
}

/// A state row together with its read-time-computed refcount.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateEntry {
    pub state: StateRecord,
    pub refcount: i64,
}

#[derive(Debug, Clone, Default)]
pub struct StateFilter {
    pub prepare_kind: Option<String>,
    pub image_id: Option<String>,
    pub id_prefix: Option<String>,
}

/// Row stored in the `instances` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceRecord {
    pub id: String,
    pub state_id: String,
    pub image_id: String,
    pub created_at: String,
    pub expires_at: Option<String>,
    pub status: String,
    pub runtime_id: Option<String>,
    pub runtime_dir: Option<String>,
    /// Opaque token the owning snapshot provider's `cleanup` consumes to
    /// release this instance's clone. Persisted so the clone can be
    /// reclaimed even if the process that created it has since exited.
    pub clone_cleanup_token: Option<String>,
}

/// Derived instance status: never stored, computed at read time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstanceStatus {
    Active,
    Expired,
    Orphaned,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceEntry {
    pub instance: InstanceRecord,
    pub derived_status: InstanceStatus,
    pub primary_name: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct InstanceFilter {
    pub state_id: Option<String>,
    pub image_id: Option<String>,
    pub id_prefix: Option<String>,
}

/// Row stored in the `names` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NameRecord {
    pub name: String,
    pub instance_id: Option<String>,
    pub state_id: Option<String>,
    pub state_fingerprint: String,
    pub image_id: String,
    pub last_used_at: Option<String>,
    pub is_primary: bool,
}

/// Derived name status: never stored, computed at read time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NameStatus {
    Active,
    Expired,
    Missing,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NameEntry {
    pub name: NameRecord,
    pub derived_status: NameStatus,
}

#[derive(Debug, Clone, Default)]
pub struct NameFilter {
    pub instance_id: Option<String>,
    pub state_id: Option<String>,
    pub image_id: Option<String>,
}

fn state_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<StateRecord> {
    Ok(StateRecord {
        id: row.get("id")?,
        fingerprint: row.get("fingerprint")?,
        image_id: row.get("image_id")?,
        prepare_kind: row.get("prepare_kind")?,
        prepare_args_normalized: row.get("prepare_args_normalized")?,
        created_at: row.get("created_at")?,
        size_bytes: row.get("size_bytes")?,
        status: row.get("status")?,
        parent_state_id: row.get("parent_state_id")?,
        last_used_at: row.get("last_used_at")?,
        use_count: row.get("use_count")?,
        min_retention_until: row.get("min_retention_until")?,
        evicted_at: row.get("evicted_at")?,
        eviction_reason: row.get("eviction_reason")?,
        snapshot_path: row.get("snapshot_path")?,
        snapshot_provider: row.get("snapshot_provider")?,
    })
}

fn instance_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<InstanceRecord> {
    Ok(InstanceRecord {
        id: row.get("id")?,
        state_id: row.get("state_id")?,
        image_id: row.get("image_id")?,
        created_at: row.get("created_at")?,
        expires_at: row.get("expires_at")?,
        status: row.get("status")?,
        runtime_id: row.get("runtime_id")?,
        runtime_dir: row.get("runtime_dir")?,
        clone_cleanup_token: row.get("clone_cleanup_token")?,
    })
}

fn name_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<NameRecord> {
    let is_primary: i64 = row.get("is_primary")?;
    Ok(NameRecord {
        name: row.get("name")?,
        instance_id: row.get("instance_id")?,
        state_id: row.get("state_id")?,
        state_fingerprint: row.get("state_fingerprint")?,
        image_id: row.get("image_id")?,
        last_used_at: row.get("last_used_at")?,
        is_primary: is_primary != 0,
    })
}

fn is_expired(expires_at: &Option<String>) -> bool {
    match expires_at {
        Some(ts) => chrono::DateTime::parse_from_rfc3339(ts).map(|t| t < Utc::now()).unwrap_or(false),
        None => false,
    }
}

/// Database operations over the `states` table.
pub struct StateStore<'a> {
    conn: &'a rusqlite::Connection,
}

impl<'a> StateStore<'a> {
    pub fn new(conn: &'a rusqlite::Connection) -> Self {
        Self { conn }
    }

    pub fn insert(&self, record: &StateRecord) -> crate::Result<()> {
        self.conn.execute(
            r#"
            INSERT INTO states (
                id, fingerprint, image_id, prepare_kind, prepare_args_normalized,
                created_at, size_bytes, status, parent_state_id, last_used_at,
                use_count, min_retention_until, evicted_at, eviction_reason,
                snapshot_path, snapshot_provider
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
            params![
                record.id,
                record.fingerprint,
                record.image_id,
                record.prepare_kind,
                record.prepare_args_normalized,
                record.created_at,
                record.size_bytes,
                record.status,
                record.parent_state_id,
                record.last_used_at,
                record.use_count,
                record.min_retention_until,
                record.evicted_at,
                record.eviction_reason,
                record.snapshot_path,
                record.snapshot_provider,
            ],
        )?;
        Ok(())
    }

    fn refcount(&self, state_id: &str) -> crate::Result<i64> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM instances WHERE state_id = ?",
            params![state_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    pub fn get_by_fingerprint(&self, fingerprint: &str) -> crate::Result<Option<StateRecord>> {
        let mut stmt = self.conn.prepare("SELECT * FROM states WHERE fingerprint = ?")?;
        let mut rows = stmt.query_map(params![fingerprint], state_from_row)?;
        match rows.next() {
            Some(row) => Ok(Some(row?)),
            None => Ok(None),
        }
    }

    pub fn get(&self, id: &str) -> crate::Result<Option<StateEntry>> {
        let mut stmt = self.conn.prepare("SELECT * FROM states WHERE id = ?")?;
        let mut rows = stmt.query_map(params![id], state_from_row)?;
        let Some(state) = rows.next() else { return Ok(None) };
        let state = state?;
        let refcount = self.refcount(&state.id)?;
        Ok(Some(StateEntry { state, refcount }))
    }

    pub fn list(&self, filter: &StateFilter) -> crate::Result<Vec<StateEntry>> {
        let mut sql = "SELECT * FROM states WHERE 1=1".to_string();
        let mut conditions = Vec::new();
        if filter.prepare_kind.is_some() {
            conditions.push(" AND prepare_kind = ?");
        }
        if filter.image_id.is_some() {
            conditions.push(" AND image_id = ?");
        }
        if filter.id_prefix.is_some() {
            conditions.push(" AND lower(id) LIKE lower(?) || '%'");
        }
        sql.push_str(&conditions.join(""));

        let mut stmt = self.conn.prepare(&sql)?;
        let mut bound: Vec<&dyn rusqlite::ToSql> = Vec::new();
        if let Some(v) = &filter.prepare_kind {
            bound.push(v);
        }
        if let Some(v) = &filter.image_id {
            bound.push(v);
        }
        if let Some(v) = &filter.id_prefix {
            bound.push(v);
        }

        let rows = stmt.query_map(bound.as_slice(), state_from_row)?;
        let mut out = Vec::new();
        for row in rows {
            let state = row?;
            let refcount = self.refcount(&state.id)?;
            out.push(StateEntry { state, refcount });
        }
        Ok(out)
    }

    pub fn delete(&self, id: &str) -> crate::Result<()> {
        let refcount = self.refcount(id)?;
        if refcount > 0 {
            return Err(crate::Error::conflict(format!(
                "cannot delete state {id}: refcount is {refcount}"
            )));
        }
        let affected = self.conn.execute("DELETE FROM states WHERE id = ?", params![id])?;
        if affected == 0 {
            return Err(crate::Error::not_found(format!("state {id} not found")));
        }
        Ok(())
    }

    pub fn update_retention(&self, id: &str, min_retention_until: Option<&str>) -> crate::Result<()> {
        let affected = self.conn.execute(
            "UPDATE states SET min_retention_until = ? WHERE id = ?",
            params![min_retention_until, id],
        )?;
        if affected == 0 {
            return Err(crate::Error::not_found(format!("state {id} not found")));
        }
        Ok(())
    }

    pub fn mark_evicted(&self, id: &str, reason: &str) -> crate::Result<()> {
        let affected = self.conn.execute(
            "UPDATE states SET evicted_at = ?, eviction_reason = ?, status = 'evicted' WHERE id = ?",
            params![Utc::now().to_rfc3339(), reason, id],
        )?;
        if affected == 0 {
            return Err(crate::Error::not_found(format!("state {id} not found")));
        }
        Ok(())
    }

    pub fn touch(&self, id: &str) -> crate::Result<()> {
        let affected = self.conn.execute(
            "UPDATE states SET last_used_at = ?, use_count = use_count + 1 WHERE id = ?",
            params![Utc::now().to_rfc3339(), id],
        )?;
        if affected == 0 {
            return Err(crate::Error::not_found(format!("state {id} not found")));
        }
        Ok(())
    }
}

/// Database operations over the `instances` table.
pub struct InstanceStore<'a> {
    conn: &'a rusqlite::Connection,
}

impl<'a> InstanceStore<'a> {
    pub fn new(conn: &'a rusqlite::Connection) -> Self {
        Self { conn }
    }

    pub fn insert(&self, record: &InstanceRecord) -> crate::Result<()> {
        self.conn.execute(
            r#"
            INSERT INTO instances (
                id, state_id, image_id, created_at, expires_at, status, runtime_id, runtime_dir,
                clone_cleanup_token
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
            params![
                record.id,
                record.state_id,
                record.image_id,
                record.created_at,
                record.expires_at,
                record.status,
                record.runtime_id,
                record.runtime_dir,
                record.clone_cleanup_token,
            ],
        )?;
        Ok(())
    }

    fn primary_name(&self, instance_id: &str) -> crate::Result<Option<String>> {
        let mut stmt =
            self.conn.prepare("SELECT name FROM names WHERE instance_id = ? AND is_primary = 1")?;
        let mut rows = stmt.query_map(params![instance_id], |row| row.get::<_, String>(0))?;
        match rows.next() {
            Some(name) => Ok(Some(name?)),
            None => Ok(None),
        }
    }

    fn has_any_name(&self, instance_id: &str) -> crate::Result<bool> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM names WHERE instance_id = ?",
            params![instance_id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    fn to_entry(&self, instance: InstanceRecord) -> crate::Result<InstanceEntry> {
        let derived_status = if is_expired(&instance.expires_at) {
            InstanceStatus::Expired
        } else if !self.has_any_name(&instance.id)? {
            InstanceStatus::Orphaned
        } else {
            InstanceStatus::Active
        };
        let primary_name = self.primary_name(&instance.id)?;
        Ok(InstanceEntry { instance, derived_status, primary_name })
    }

    pub fn get(&self, id: &str) -> crate::Result<Option<InstanceEntry>> {
        let mut stmt = self.conn.prepare("SELECT * FROM instances WHERE id = ?")?;
        let mut rows = stmt.query_map(params![id], instance_from_row)?;
        match rows.next() {
            Some(row) => Ok(Some(self.to_entry(row?)?)),
            None => Ok(None),
        }
    }

    pub fn list(&self, filter: &InstanceFilter) -> crate::Result<Vec<InstanceEntry>> {
        let mut sql = "SELECT * FROM instances WHERE 1=1".to_string();
        let mut conditions = Vec::new();
        if filter.state_id.is_some() {
            conditions.push(" AND state_id = ?");
        }
        if filter.image_id.is_some() {
            conditions.push(" AND image_id = ?");
        }
        if filter.id_prefix.is_some() {
            conditions.push(" AND lower(id) LIKE lower(?) || '%'");
        }
        sql.push_str(&conditions.join(""));

        let mut stmt = self.conn.prepare(&sql)?;
        let mut bound: Vec<&dyn rusqlite::ToSql> = Vec::new();
        if let Some(v) = &filter.state_id {
            bound.push(v);
        }
        if let Some(v) = &filter.image_id {
            bound.push(v);
        }
        if let Some(v) = &filter.id_prefix {
            bound.push(v);
        }

        let rows = stmt.query_map(bound.as_slice(), instance_from_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(self.to_entry(row?)?);
        }
        Ok(out)
    }

    /// Soft-delete names pointing at `id`, then remove the instance row.
    pub fn delete(&self, id: &str) -> crate::Result<()> {
        self.conn.execute(
            "UPDATE names SET instance_id = NULL WHERE instance_id = ?",
            params![id],
        )?;
        let affected = self.conn.execute("DELETE FROM instances WHERE id = ?", params![id])?;
        if affected == 0 {
            return Err(crate::Error::not_found(format!("instance {id} not found")));
        }
        Ok(())
    }
}

/// Database operations over the `names` table.
pub struct NameStore<'a> {
    conn: &'a rusqlite::Connection,
}

impl<'a> NameStore<'a> {
    pub fn new(conn: &'a rusqlite::Connection) -> Self {
        Self { conn }
    }

    pub fn upsert(&self, record: &NameRecord) -> crate::Result<()> {
        self.conn.execute(
            r#"
            INSERT INTO names (name, instance_id, state_id, state_fingerprint, image_id, last_used_at, is_primary)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(name) DO UPDATE SET
                instance_id = excluded.instance_id,
                state_id = excluded.state_id,
                state_fingerprint = excluded.state_fingerprint,
                image_id = excluded.image_id,
                last_used_at = excluded.last_used_at,
                is_primary = excluded.is_primary
            "#,
            params![
                record.name,
                record.instance_id,
                record.state_id,
                record.state_fingerprint,
                record.image_id,
                record.last_used_at,
                record.is_primary as i64,
            ],
        )?;
        Ok(())
    }

    fn to_entry(&self, name: NameRecord) -> crate::Result<NameEntry> {
        let derived_status = match &name.instance_id {
            None => NameStatus::Missing,
            Some(instance_id) => {
                let expires_at: Option<Option<String>> = self
                    .conn
                    .query_row(
                        "SELECT expires_at FROM instances WHERE id = ?",
                        params![instance_id],
                        |row| row.get(0),
                    )
                    .ok();
                match expires_at {
                    Some(expires_at) if is_expired(&expires_at) => NameStatus::Expired,
                    Some(_) => NameStatus::Active,
                    None => NameStatus::Missing,
                }
            }
        };
        Ok(NameEntry { name, derived_status })
    }

    pub fn get(&self, name: &str) -> crate::Result<Option<NameEntry>> {
        let mut stmt = self.conn.prepare("SELECT * FROM names WHERE name = ?")?;
        let mut rows = stmt.query_map(params![name], name_from_row)?;
        match rows.next() {
            Some(row) => Ok(Some(self.to_entry(row?)?)),
            None => Ok(None),
        }
    }

    pub fn list(&self, filter: &NameFilter) -> crate::Result<Vec<NameEntry>> {
        let mut sql = "SELECT * FROM names WHERE 1=1".to_string();
        let mut conditions = Vec::new();
        if filter.instance_id.is_some() {
            conditions.push(" AND instance_id = ?");
        }
        if filter.state_id.is_some() {
            conditions.push(" AND state_id = ?");
        }
        if filter.image_id.is_some() {
            conditions.push(" AND image_id = ?");
        }
        sql.push_str(&conditions.join(""));

        let mut stmt = self.conn.prepare(&sql)?;
        let mut bound: Vec<&dyn rusqlite::ToSql> = Vec::new();
        if let Some(v) = &filter.instance_id {
            bound.push(v);
        }
        if let Some(v) = &filter.state_id {
            bound.push(v);
        }
        if let Some(v) = &filter.image_id {
            bound.push(v);
        }

        let rows = stmt.query_map(bound.as_slice(), name_from_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(self.to_entry(row?)?);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrations::MigrationManager;
    use rusqlite::Connection;

    fn fresh_conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        MigrationManager::migrate(&conn).unwrap();
        conn
    }

    fn sample_state(id: &str) -> StateRecord {
        StateRecord {
            id: id.to_string(),
            fingerprint: format!("fp-{id}"),
            image_id: "postgres:16".to_string(),
            prepare_kind: "psql".to_string(),
            prepare_args_normalized: "[]".to_string(),
            created_at: Utc::now().to_rfc3339(),
            size_bytes: None,
            status: "ready".to_string(),
            parent_state_id: None,
            last_used_at: None,
            use_count: 0,
            min_retention_until: None,
            evicted_at: None,
            eviction_reason: None,
            snapshot_path: None,
            snapshot_provider: None,
        }
    }

    #[test]
    fn delete_state_with_zero_refcount_succeeds() {
        let conn = fresh_conn();
        let store = StateStore::new(&conn);
        store.insert(&sample_state("aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa")).unwrap();
        store.delete("aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa").unwrap();
        assert!(store.get("aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa").unwrap().is_none());
    }

    #[test]
    fn delete_state_with_live_refcount_conflicts() {
        let conn = fresh_conn();
        let state_id = "bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb";
        StateStore::new(&conn).insert(&sample_state(state_id)).unwrap();
        InstanceStore::new(&conn)
            .insert(&InstanceRecord {
                id: "cccccccccccccccccccccccccccccccc".to_string(),
                state_id: state_id.to_string(),
                image_id: "postgres:16".to_string(),
                created_at: Utc::now().to_rfc3339(),
                expires_at: None,
                status: "active".to_string(),
                runtime_id: None,
                runtime_dir: None,
                clone_cleanup_token: None,
            })
            .unwrap();

        let result = StateStore::new(&conn).delete(state_id);
        assert!(matches!(result, Err(crate::Error::Conflict(_))));
    }

    #[test]
    fn delete_instance_soft_deletes_names() {
        let conn = fresh_conn();
        let state_id = "dddddddddddddddddddddddddddddddd";
        StateStore::new(&conn).insert(&sample_state(state_id)).unwrap();
        let instance_id = "eeeeeeeeeeeeeeeeeeeeeeeeeeeeeeee";
        InstanceStore::new(&conn)
            .insert(&InstanceRecord {
                id: instance_id.to_string(),
                state_id: state_id.to_string(),
                image_id: "postgres:16".to_string(),
                created_at: Utc::now().to_rfc3339(),
                expires_at: None,
                status: "active".to_string(),
                runtime_id: None,
                runtime_dir: None,
                clone_cleanup_token: None,
            })
            .unwrap();
        NameStore::new(&conn)
            .upsert(&NameRecord {
                name: "dev-db".to_string(),
                instance_id: Some(instance_id.to_string()),
                state_id: Some(state_id.to_string()),
                state_fingerprint: "fp-dddddddddddddddddddddddddddddddd".to_string(),
                image_id: "postgres:16".to_string(),
                last_used_at: None,
                is_primary: true,
            })
            .unwrap();

        InstanceStore::new(&conn).delete(instance_id).unwrap();

        let name = NameStore::new(&conn).get("dev-db").unwrap().unwrap();
        assert!(name.name.instance_id.is_none());
        assert_eq!(name.derived_status, NameStatus::Missing);
    }

    #[test]
    fn list_states_filters_by_id_prefix() {
        let conn = fresh_conn();
        let store = StateStore::new(&conn);
        store.insert(&sample_state("ffffffffffffffffffffffffffffffff")).unwrap();
        store.insert(&sample_state("00000000000000000000000000000001")).unwrap();

        let results = store
            .list(&StateFilter { id_prefix: Some("ffff".to_string()), ..Default::default() })
            .unwrap();
        assert_eq!(results.len(), 1);
    }

    #[test]
    fn update_retention_is_visible_on_next_read() {
        let conn = fresh_conn();
        let state_id = "11111111111111111111111111111112";
        let store = StateStore::new(&conn);
        store.insert(&sample_state(state_id)).unwrap();

        store.update_retention(state_id, Some("2030-01-01T00:00:00Z")).unwrap();

        let entry = store.get(state_id).unwrap().unwrap();
        assert_eq!(entry.state.min_retention_until.as_deref(), Some("2030-01-01T00:00:00Z"));
    }

    #[test]
    fn update_retention_on_unknown_state_is_not_found() {
        let conn = fresh_conn();
        let store = StateStore::new(&conn);
        let result = store.update_retention("22222222222222222222222222222222", Some("2030-01-01T00:00:00Z"));
        assert!(matches!(result, Err(crate::Error::NotFound(_))));
    }

    #[test]
    fn mark_evicted_records_reason_and_status_even_with_live_refcount() {
        // A state can be marked evicted while still referenced; only
        // `delete` enforces the refcount invariant (see DESIGN.md's
        // decision on this open question).
        let conn = fresh_conn();
        let state_id = "33333333333333333333333333333333";
        StateStore::new(&conn).insert(&sample_state(state_id)).unwrap();
        InstanceStore::new(&conn)
            .insert(&InstanceRecord {
                id: "44444444444444444444444444444444".to_string(),
                state_id: state_id.to_string(),
                image_id: "postgres:16".to_string(),
                created_at: Utc::now().to_rfc3339(),
                expires_at: None,
                status: "active".to_string(),
                runtime_id: None,
                runtime_dir: None,
                clone_cleanup_token: None,
            })
            .unwrap();

        let store = StateStore::new(&conn);
        store.mark_evicted(state_id, "lru-sweep").unwrap();

        let entry = store.get(state_id).unwrap().unwrap();
        assert!(entry.state.evicted_at.is_some());
        assert_eq!(entry.state.eviction_reason.as_deref(), Some("lru-sweep"));
        assert_eq!(entry.state.status, "evicted");
        assert_eq!(entry.refcount, 1);

        // Still blocked from actual deletion while referenced.
        assert!(store.delete(state_id).is_err());
    }
}
