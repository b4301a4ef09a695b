// SQLite-backed key-value store (offline.db).

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};

use super::KeyValueStore;

const MIGRATION_V1_SQL: &str = r#"
CREATE TABLE offline_kv (
    key         TEXT PRIMARY KEY,
    value       TEXT NOT NULL,
    updated_at  TEXT NOT NULL
);
"#;

const MIGRATIONS: &[(i64, &str)] = &[(1, MIGRATION_V1_SQL)];

#[derive(Debug)]
pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create offline.db parent directory `{}`", parent.display())
            })?;
        }

        let conn = Connection::open(path)
            .with_context(|| format!("failed to open offline.db at `{}`", path.display()))?;
        Self::from_connection(conn)
    }

    /// Non-durable database, used in tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("failed to open in-memory sqlite")?;
        Self::from_connection(conn)
    }

    fn from_connection(mut conn: Connection) -> Result<Self> {
        // `journal_mode` returns a row, so it can't go through execute_batch.
        let _mode: String = conn
            .query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))
            .context("failed to configure sqlite journal mode for offline.db")?;

        ensure_migration_table(&conn)?;
        apply_pending_migrations(&mut conn)?;

        Ok(Self { conn })
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn schema_version(&self) -> Result<i64> {
        current_schema_version(&self.conn)
    }
}

impl KeyValueStore for SqliteStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        self.conn
            .query_row("SELECT value FROM offline_kv WHERE key = ?1", params![key], |row| {
                row.get(0)
            })
            .optional()
            .with_context(|| format!("failed to read offline entry `{key}`"))
    }

    fn set(&mut self, key: &str, value: &str) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO offline_kv (key, value, updated_at) VALUES (?1, ?2, datetime('now')) \
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value, \
                 updated_at = excluded.updated_at",
                params![key, value],
            )
            .with_context(|| format!("failed to write offline entry `{key}`"))?;
        Ok(())
    }

    fn remove(&mut self, key: &str) -> Result<()> {
        self.conn
            .execute("DELETE FROM offline_kv WHERE key = ?1", params![key])
            .with_context(|| format!("failed to delete offline entry `{key}`"))?;
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT key FROM offline_kv ORDER BY key ASC")
            .context("failed to prepare offline key listing")?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .context("failed to list offline keys")?;
        rows.collect::<std::result::Result<Vec<_>, _>>().context("failed to collect offline keys")
    }
}

fn ensure_migration_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS schema_migrations (
            version     INTEGER PRIMARY KEY,
            applied_at  TEXT NOT NULL
        );
        ",
    )
    .context("failed to ensure schema_migrations table exists")
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    conn.query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| row.get(0))
        .context("failed to read current schema version")
}

fn apply_pending_migrations(conn: &mut Connection) -> Result<()> {
    let mut current_version = current_schema_version(conn)?;

    for (version, sql) in MIGRATIONS {
        if *version <= current_version {
            continue;
        }

        let tx = conn.transaction().context("failed to start migration transaction")?;
        tx.execute_batch(sql)
            .with_context(|| format!("failed to apply offline.db migration v{version}"))?;
        tx.execute(
            "INSERT INTO schema_migrations (version, applied_at) VALUES (?1, datetime('now'))",
            params![version],
        )
        .with_context(|| format!("failed to record migration v{version}"))?;
        tx.commit().with_context(|| format!("failed to commit migration v{version}"))?;
        current_version = *version;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn open_creates_schema_and_records_migration() {
        let store = SqliteStore::open_in_memory().expect("store should open");
        assert_eq!(store.schema_version().expect("schema version"), 1);

        let exists: i64 = store
            .connection()
            .query_row(
                "SELECT COUNT(1) FROM sqlite_master WHERE type = 'table' AND name = 'offline_kv'",
                [],
                |row| row.get(0),
            )
            .expect("table existence query should succeed");
        assert_eq!(exists, 1);
    }

    #[test]
    fn set_overwrites_and_keys_are_sorted() {
        let mut store = SqliteStore::open_in_memory().expect("store should open");
        store.set("b", "two").unwrap();
        store.set("a", "one").unwrap();
        store.set("b", "deux").unwrap();

        assert_eq!(store.keys().unwrap(), vec!["a", "b"]);
        assert_eq!(store.get("b").unwrap().as_deref(), Some("deux"));
        assert_eq!(store.get("zzz").unwrap(), None);

        store.remove("a").unwrap();
        assert_eq!(store.keys().unwrap(), vec!["b"]);
    }

    #[test]
    fn reopening_is_idempotent_and_keeps_data() {
        let dir = tempdir().expect("tempdir should be created");
        let path = dir.path().join("nested").join("offline.db");

        {
            let mut first = SqliteStore::open(&path).expect("first open should succeed");
            first.set("change-1", "{}").unwrap();
        }

        let second = SqliteStore::open(&path).expect("second open should succeed");
        assert_eq!(second.schema_version().unwrap(), 1);
        assert_eq!(second.get("change-1").unwrap().as_deref(), Some("{}"));

        let migration_rows: i64 = second
            .connection()
            .query_row("SELECT COUNT(*) FROM schema_migrations", [], |row| row.get(0))
            .expect("schema migration count query should succeed");
        assert_eq!(migration_rows, 1);
    }
}
