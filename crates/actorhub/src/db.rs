//! Shared SQLite schema and connection handling.
//!
//! Follows the teacher's own storage idiom (`rusqlite`, WAL mode, a cheap
//! `Clone`-able handle that opens a fresh connection per blocking operation
//! rather than holding a long-lived connection across an `.await`).

use anyhow::{Context, Result};
use rusqlite::Connection;
use std::path::{Path, PathBuf};

#[derive(Clone)]
pub struct Db {
    path: PathBuf,
}

impl Db {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).with_context(|| format!("create data dir: {}", parent.display()))?;
        }
        let conn = Connection::open(&path).with_context(|| format!("open db: {}", path.display()))?;
        init_schema(&conn)?;
        Ok(Self { path })
    }

    pub fn connect(&self) -> Result<Connection> {
        let conn = Connection::open(&self.path).with_context(|| format!("open db: {}", self.path.display()))?;
        conn.pragma_update(None, "foreign_keys", true)?;
        Ok(conn)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        PRAGMA journal_mode=WAL;

        CREATE TABLE IF NOT EXISTS objects (
          id TEXT PRIMARY KEY,
          json TEXT NOT NULL,
          created_at_ms INTEGER NOT NULL,
          updated_at_ms INTEGER NOT NULL,
          deleted INTEGER NOT NULL DEFAULT 0
        );

        CREATE TABLE IF NOT EXISTS collections (
          id TEXT PRIMARY KEY,
          owner TEXT NULL,
          private INTEGER NOT NULL DEFAULT 0,
          name_map TEXT NULL,
          created_at_ms INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS collection_items (
          seq INTEGER PRIMARY KEY AUTOINCREMENT,
          collection_id TEXT NOT NULL,
          item_iri TEXT NOT NULL,
          created_at_ms INTEGER NOT NULL,
          UNIQUE(collection_id, item_iri)
        );
        CREATE INDEX IF NOT EXISTS idx_collection_items_lookup ON collection_items(collection_id, seq DESC);

        CREATE TABLE IF NOT EXISTS accounts (
          username TEXT PRIMARY KEY,
          actor_id TEXT NOT NULL UNIQUE,
          password_hash TEXT NOT NULL,
          token TEXT NOT NULL UNIQUE,
          private_key_pem TEXT NOT NULL,
          created_at_ms INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS delivery_jobs (
          id TEXT PRIMARY KEY,
          sender_actor_id TEXT NOT NULL,
          target_inbox TEXT NOT NULL,
          activity_json BLOB NOT NULL,
          attempt INTEGER NOT NULL DEFAULT 0,
          status INTEGER NOT NULL DEFAULT 0,
          next_attempt_at_ms INTEGER NOT NULL,
          last_error TEXT NULL,
          created_at_ms INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_delivery_jobs_due ON delivery_jobs(status, next_attempt_at_ms);
        "#,
    )?;
    Ok(())
}

pub fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

#[cfg(test)]
pub fn test_db() -> Db {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("test.sqlite3");
    let db = Db::open(&path).expect("open test db");
    std::mem::forget(dir);
    db
}
