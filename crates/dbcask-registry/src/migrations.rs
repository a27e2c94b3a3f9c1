//! Database migration management.

use rusqlite::{params, Connection};

/// Database migration manager.
pub struct MigrationManager;

impl MigrationManager {
    /// Apply all pending migrations to the database.
    pub fn migrate(conn: &Connection) -> crate::Result<()> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                applied_at DATETIME DEFAULT CURRENT_TIMESTAMP
            );
            "#,
        )?;

        let current_version = Self::current_version(conn)?.unwrap_or(0);

        if current_version < 1 {
            Self::apply_migration_1(conn)?;
        }
        if current_version < 2 {
            Self::apply_migration_2(conn)?;
        }
        if current_version < 3 {
            Self::apply_migration_3(conn)?;
        }

        Ok(())
    }

    /// Migration 1: base tables for states, instances, and names.
    fn apply_migration_1(conn: &Connection) -> crate::Result<()> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS states (
                id TEXT PRIMARY KEY,
                fingerprint TEXT NOT NULL UNIQUE,
                image_id TEXT NOT NULL,
                prepare_kind TEXT NOT NULL,
                prepare_args_normalized TEXT NOT NULL,
                created_at TEXT NOT NULL,
                size_bytes INTEGER,
                status TEXT NOT NULL DEFAULT 'ready'
            );

            CREATE TABLE IF NOT EXISTS instances (
                id TEXT PRIMARY KEY,
                state_id TEXT NOT NULL REFERENCES states(id),
                image_id TEXT NOT NULL,
                created_at TEXT NOT NULL,
                expires_at TEXT,
                status TEXT NOT NULL DEFAULT 'active'
            );

            CREATE TABLE IF NOT EXISTS names (
                name TEXT PRIMARY KEY,
                instance_id TEXT,
                state_id TEXT,
                state_fingerprint TEXT NOT NULL,
                image_id TEXT NOT NULL,
                last_used_at TEXT,
                is_primary INTEGER NOT NULL DEFAULT 0
            );

            CREATE INDEX IF NOT EXISTS idx_instances_state_id ON instances(state_id);
            CREATE INDEX IF NOT EXISTS idx_names_instance_id ON names(instance_id);
            CREATE INDEX IF NOT EXISTS idx_names_state_id ON names(state_id);

            INSERT OR REPLACE INTO schema_migrations (version) VALUES (1);
            "#,
        )?;
        Ok(())
    }

    /// Migration 2 (additive): columns that earlier versions of this schema
    /// lacked. Each `ALTER TABLE ... ADD COLUMN` tolerates already having
    /// been applied, so re-running this migration on an up-to-date database
    /// is a no-op rather than an error.
    fn apply_migration_2(conn: &Connection) -> crate::Result<()> {
        let statements = [
            "ALTER TABLE states ADD COLUMN parent_state_id TEXT",
            "ALTER TABLE states ADD COLUMN last_used_at TEXT",
            "ALTER TABLE states ADD COLUMN use_count INTEGER NOT NULL DEFAULT 0",
            "ALTER TABLE states ADD COLUMN min_retention_until TEXT",
            "ALTER TABLE states ADD COLUMN evicted_at TEXT",
            "ALTER TABLE states ADD COLUMN eviction_reason TEXT",
            "ALTER TABLE instances ADD COLUMN runtime_id TEXT",
            "ALTER TABLE instances ADD COLUMN runtime_dir TEXT",
        ];

        for stmt in statements {
            if let Err(e) = conn.execute(stmt, params![]) {
                if !Self::is_duplicate_column_error(&e) {
                    return Err(e.into());
                }
            }
        }

        conn.execute("INSERT OR REPLACE INTO schema_migrations (version) VALUES (2)", params![])?;
        Ok(())
    }

    /// Migration 3 (additive): where on disk a committed state's snapshot
    /// lives, and the token a clone's cleanup needs to release it. Neither
    /// existed in the original schema because early callers kept both in
    /// memory only; persisting them lets a state built by one process be
    /// instantiated, and an instance's clone reclaimed, by another.
    fn apply_migration_3(conn: &Connection) -> crate::Result<()> {
        let statements = [
            "ALTER TABLE states ADD COLUMN snapshot_path TEXT",
            "ALTER TABLE states ADD COLUMN snapshot_provider TEXT",
            "ALTER TABLE instances ADD COLUMN clone_cleanup_token TEXT",
        ];

        for stmt in statements {
            if let Err(e) = conn.execute(stmt, params![]) {
                if !Self::is_duplicate_column_error(&e) {
                    return Err(e.into());
                }
            }
        }

        conn.execute("INSERT OR REPLACE INTO schema_migrations (version) VALUES (3)", params![])?;
        Ok(())
    }

    fn is_duplicate_column_error(err: &rusqlite::Error) -> bool {
        matches!(
            err,
            rusqlite::Error::SqliteFailure(_, Some(msg)) if msg.contains("duplicate column name")
        )
    }

    /// Get the current schema version.
    pub fn current_version(conn: &Connection) -> crate::Result<Option<u32>> {
        let mut stmt = conn.prepare("SELECT MAX(version) FROM schema_migrations")?;
        let version: Option<u32> = stmt.query_row(params![], |row| row.get(0)).ok();
        Ok(version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrate_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        MigrationManager::migrate(&conn).unwrap();
        MigrationManager::migrate(&conn).unwrap();
        assert_eq!(MigrationManager::current_version(&conn).unwrap(), Some(3));
    }

    #[test]
    fn migration_2_adds_capacity_columns() {
        let conn = Connection::open_in_memory().unwrap();
        MigrationManager::migrate(&conn).unwrap();
        let mut stmt = conn.prepare("SELECT use_count FROM states LIMIT 1").unwrap();
        assert!(stmt.query(params![]).is_ok());
    }
}
