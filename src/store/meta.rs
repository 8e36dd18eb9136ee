//! Store Metadata
//!
//! Embedded SQLite database holding the store identity, id generator
//! state and the relationship type registry.

use std::path::{Path, PathBuf};

use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::Mutex;

use super::{StoreId, META_FILE};
use crate::error::{Error, Result};

/// Metadata database of one store
pub struct MetaStore {
    /// Database connection
    conn: Mutex<Connection>,
    /// Database path
    path: PathBuf,
}

impl MetaStore {
    /// Create or open the metadata database in a store directory
    pub fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)?;

        let path = dir.join(META_FILE);
        let conn = Connection::open(&path)?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS store_identity (
                id INTEGER PRIMARY KEY CHECK (id = 0),
                creation_time INTEGER NOT NULL,
                random_id INTEGER NOT NULL,
                store_version INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS id_generators (
                id_type INTEGER PRIMARY KEY,
                high_id INTEGER NOT NULL,
                updated_at TEXT DEFAULT CURRENT_TIMESTAMP
            );

            CREATE TABLE IF NOT EXISTS free_ids (
                id_type INTEGER NOT NULL,
                id INTEGER NOT NULL,
                PRIMARY KEY (id_type, id)
            );

            CREATE TABLE IF NOT EXISTS relationship_types (
                name TEXT PRIMARY KEY,
                type_id INTEGER NOT NULL UNIQUE
            );

            CREATE TABLE IF NOT EXISTS node_state (
                key TEXT PRIMARY KEY,
                value_int INTEGER,
                updated_at TEXT DEFAULT CURRENT_TIMESTAMP
            );
            "#,
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
            path,
        })
    }

    /// Database file path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the persisted store identity
    pub async fn store_id(&self) -> Result<Option<StoreId>> {
        let conn = self.conn.lock().await;
        let id = conn
            .query_row(
                "SELECT creation_time, random_id, store_version FROM store_identity WHERE id = 0",
                [],
                |row| {
                    Ok(StoreId {
                        creation_time: row.get(0)?,
                        random_id: row.get(1)?,
                        store_version: row.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(id)
    }

    /// Persist the store identity. It is written once and never changed.
    pub async fn set_store_id(&self, store_id: &StoreId) -> Result<()> {
        let conn = self.conn.lock().await;
        let existing: Option<(i64, i64, i64)> = conn
            .query_row(
                "SELECT creation_time, random_id, store_version FROM store_identity WHERE id = 0",
                [],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;

        match existing {
            Some((creation_time, random_id, store_version)) => {
                let current = StoreId {
                    creation_time,
                    random_id,
                    store_version,
                };
                if current != *store_id {
                    return Err(Error::StoreMismatch {
                        expected: store_id.to_string(),
                        actual: current.to_string(),
                    });
                }
            }
            None => {
                conn.execute(
                    "INSERT INTO store_identity (id, creation_time, random_id, store_version) VALUES (0, ?1, ?2, ?3)",
                    params![store_id.creation_time, store_id.random_id, store_id.store_version],
                )?;
            }
        }
        Ok(())
    }

    /// Highest id handed out for an id type (exclusive)
    pub async fn high_id(&self, id_type: u8) -> Result<i64> {
        let conn = self.conn.lock().await;
        let high: Option<i64> = conn
            .query_row(
                "SELECT high_id FROM id_generators WHERE id_type = ?1",
                params![id_type as i64],
                |row| row.get(0),
            )
            .optional()?;
        Ok(high.unwrap_or(0))
    }

    /// Set the high id for an id type
    pub async fn set_high_id(&self, id_type: u8, high_id: i64) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            r#"
            INSERT INTO id_generators (id_type, high_id) VALUES (?1, ?2)
            ON CONFLICT(id_type) DO UPDATE SET high_id = ?2, updated_at = CURRENT_TIMESTAMP
            "#,
            params![id_type as i64, high_id],
        )?;
        Ok(())
    }

    /// Raise the high id, never lowering it
    pub async fn raise_high_id(&self, id_type: u8, at_least: i64) -> Result<i64> {
        let conn = self.conn.lock().await;
        conn.execute(
            r#"
            INSERT INTO id_generators (id_type, high_id) VALUES (?1, ?2)
            ON CONFLICT(id_type) DO UPDATE SET
                high_id = MAX(high_id, ?2), updated_at = CURRENT_TIMESTAMP
            "#,
            params![id_type as i64, at_least],
        )?;
        let high: i64 = conn.query_row(
            "SELECT high_id FROM id_generators WHERE id_type = ?1",
            params![id_type as i64],
            |row| row.get(0),
        )?;
        Ok(high)
    }

    /// Return ids to the free list
    pub async fn free_ids(&self, id_type: u8, ids: &[i64]) -> Result<()> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        for id in ids {
            tx.execute(
                "INSERT OR IGNORE INTO free_ids (id_type, id) VALUES (?1, ?2)",
                params![id_type as i64, id],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Take up to `max` ids from the free list, lowest first
    pub async fn take_free_ids(&self, id_type: u8, max: usize) -> Result<Vec<i64>> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;

        let ids = {
            let mut stmt =
                tx.prepare("SELECT id FROM free_ids WHERE id_type = ?1 ORDER BY id LIMIT ?2")?;
            let rows = stmt.query_map(params![id_type as i64, max as i64], |row| row.get(0))?;
            rows.collect::<std::result::Result<Vec<i64>, _>>()?
        };

        for id in &ids {
            tx.execute(
                "DELETE FROM free_ids WHERE id_type = ?1 AND id = ?2",
                params![id_type as i64, id],
            )?;
        }
        tx.commit()?;
        Ok(ids)
    }

    /// Look up a relationship type id by name
    pub async fn relationship_type(&self, name: &str) -> Result<Option<i32>> {
        let conn = self.conn.lock().await;
        let id = conn
            .query_row(
                "SELECT type_id FROM relationship_types WHERE name = ?1",
                params![name],
                |row| row.get(0),
            )
            .optional()?;
        Ok(id)
    }

    /// Register a relationship type, returning the existing id if known
    pub async fn create_relationship_type(&self, name: &str) -> Result<i32> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;

        let existing: Option<i32> = tx
            .query_row(
                "SELECT type_id FROM relationship_types WHERE name = ?1",
                params![name],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(id) = existing {
            return Ok(id);
        }

        let next: i32 = tx.query_row(
            "SELECT COALESCE(MAX(type_id) + 1, 0) FROM relationship_types",
            [],
            |row| row.get(0),
        )?;
        tx.execute(
            "INSERT INTO relationship_types (name, type_id) VALUES (?1, ?2)",
            params![name, next],
        )?;
        tx.commit()?;
        Ok(next)
    }

    /// Record a relationship type id assigned elsewhere
    pub async fn record_relationship_type(&self, name: &str, type_id: i32) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            r#"
            INSERT INTO relationship_types (name, type_id) VALUES (?1, ?2)
            ON CONFLICT(name) DO UPDATE SET type_id = ?2
            "#,
            params![name, type_id],
        )?;
        Ok(())
    }

    /// All relationship types, ordered by id
    pub async fn relationship_types(&self) -> Result<Vec<(String, i32)>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare("SELECT name, type_id FROM relationship_types ORDER BY type_id")?;
        let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
        let types = rows.collect::<std::result::Result<Vec<(String, i32)>, _>>()?;
        Ok(types)
    }

    /// Read an integer state value
    pub async fn state_int(&self, key: &str) -> Result<Option<i64>> {
        let conn = self.conn.lock().await;
        let value = conn
            .query_row(
                "SELECT value_int FROM node_state WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    /// Write an integer state value
    pub async fn set_state_int(&self, key: &str, value: i64) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            r#"
            INSERT INTO node_state (key, value_int) VALUES (?1, ?2)
            ON CONFLICT(key) DO UPDATE SET value_int = ?2, updated_at = CURRENT_TIMESTAMP
            "#,
            params![key, value],
        )?;
        Ok(())
    }

    /// Read the database file while no write is in flight
    pub async fn read_file(&self) -> Result<Vec<u8>> {
        let _conn = self.conn.lock().await;
        Ok(std::fs::read(&self.path)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_store_id_written_once() {
        let dir = tempdir().unwrap();
        let meta = MetaStore::open(dir.path()).unwrap();
        assert!(meta.store_id().await.unwrap().is_none());

        let id = StoreId::new();
        meta.set_store_id(&id).await.unwrap();
        meta.set_store_id(&id).await.unwrap();
        assert_eq!(meta.store_id().await.unwrap(), Some(id));

        let other = StoreId::new();
        assert!(matches!(
            meta.set_store_id(&other).await,
            Err(Error::StoreMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn test_high_id_only_rises() {
        let dir = tempdir().unwrap();
        let meta = MetaStore::open(dir.path()).unwrap();
        assert_eq!(meta.high_id(0).await.unwrap(), 0);
        assert_eq!(meta.raise_high_id(0, 100).await.unwrap(), 100);
        assert_eq!(meta.raise_high_id(0, 50).await.unwrap(), 100);
        meta.set_high_id(1, 7).await.unwrap();
        assert_eq!(meta.high_id(1).await.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_free_ids_taken_lowest_first() {
        let dir = tempdir().unwrap();
        let meta = MetaStore::open(dir.path()).unwrap();
        meta.free_ids(2, &[9, 3, 5]).await.unwrap();

        assert_eq!(meta.take_free_ids(2, 2).await.unwrap(), vec![3, 5]);
        assert_eq!(meta.take_free_ids(2, 10).await.unwrap(), vec![9]);
        assert!(meta.take_free_ids(2, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_relationship_types() {
        let dir = tempdir().unwrap();
        let meta = MetaStore::open(dir.path()).unwrap();

        let knows = meta.create_relationship_type("KNOWS").await.unwrap();
        let likes = meta.create_relationship_type("LIKES").await.unwrap();
        assert_eq!(knows, 0);
        assert_eq!(likes, 1);
        assert_eq!(meta.create_relationship_type("KNOWS").await.unwrap(), 0);

        meta.record_relationship_type("OWNS", 7).await.unwrap();
        assert_eq!(meta.relationship_type("OWNS").await.unwrap(), Some(7));
        assert_eq!(meta.relationship_types().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_reopen_keeps_state() {
        let dir = tempdir().unwrap();
        {
            let meta = MetaStore::open(dir.path()).unwrap();
            meta.set_state_int("kernel_ok", 1).await.unwrap();
        }
        let meta = MetaStore::open(dir.path()).unwrap();
        assert_eq!(meta.state_int("kernel_ok").await.unwrap(), Some(1));
        assert_eq!(meta.state_int("missing").await.unwrap(), None);
    }
}
