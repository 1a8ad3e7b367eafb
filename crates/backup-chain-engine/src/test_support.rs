use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Result;
use rusqlite::{params, Connection};
use tempfile::TempDir;

use crate::config::BackupConfig;

/// Seeded source database plus root and temp directories inside one tempdir.
/// `conversations` is left out on purpose so exports have a missing critical table.
pub struct Sandbox {
    dir: TempDir,
}

impl Sandbox {
    pub fn new() -> Result<Self> {
        let dir = TempDir::new()?;
        let sandbox = Self { dir };
        fs::create_dir_all(sandbox.path().join("tmp"))?;
        seed_database(&sandbox.database())?;
        Ok(sandbox)
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn database(&self) -> PathBuf {
        self.path().join("source.sqlite3")
    }

    pub fn config(&self) -> BackupConfig {
        BackupConfig {
            root: self.path().join("root"),
            database: self.database(),
            temp_root: self.path().join("tmp"),
            ..BackupConfig::default()
        }
    }
}

pub fn seed_database(path: &Path) -> Result<()> {
    let conn = Connection::open(path)?;
    conn.execute_batch(
        "CREATE TABLE agents (id INTEGER PRIMARY KEY, name TEXT NOT NULL, created_at TEXT NOT NULL);
         CREATE TABLE memories (
           id INTEGER PRIMARY KEY,
           agent_id INTEGER NOT NULL,
           content TEXT,
           embedding BLOB,
           score REAL
         );
         CREATE TABLE messages (id INTEGER PRIMARY KEY, body TEXT);
         CREATE TABLE system_logs (
           id INTEGER PRIMARY KEY AUTOINCREMENT,
           level TEXT, component TEXT, message TEXT, details TEXT, created_at TEXT
         );",
    )?;
    for (id, name) in [(1, "planner"), (2, "critic"), (3, "archivist")] {
        conn.execute(
            "INSERT INTO agents (id, name, created_at) VALUES (?1, ?2, '2025-01-01T00:00:00Z')",
            params![id, name],
        )?;
    }
    conn.execute(
        "INSERT INTO memories (id, agent_id, content, embedding, score) VALUES (1, 1, 'first', ?1, 0.5)",
        params![vec![0xde_u8, 0xad, 0xbe, 0xef]],
    )?;
    conn.execute(
        "INSERT INTO memories (id, agent_id, content, embedding, score) VALUES (2, 2, NULL, NULL, NULL)",
        [],
    )?;
    conn.execute("INSERT INTO messages (id, body) VALUES (1, 'hello')", [])?;
    Ok(())
}

pub fn row_count(path: &Path, table: &str) -> Result<i64> {
    let conn = Connection::open(path)?;
    Ok(conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))?)
}
