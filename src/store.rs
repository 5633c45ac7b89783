use std::path::Path;

use rusqlite::types::Value;
use rusqlite::{Connection, OpenFlags, params_from_iter};

use crate::error::{Error, Result};

/// Logical tables of the application store, in migration order.
pub const TABLES: &[&str] = &["proposals", "settings", "job_posts"];

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS proposals (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    title TEXT NOT NULL,
    client TEXT NOT NULL,
    body TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS settings (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS job_posts (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    title TEXT NOT NULL,
    description TEXT NOT NULL,
    url TEXT,
    captured_at TEXT NOT NULL
);
"#;

fn ensure_known_table(table: &str) -> Result<()> {
    if TABLES.contains(&table) {
        Ok(())
    } else {
        Err(Error::UnknownTable(table.to_string()))
    }
}

fn count_rows(conn: &Connection, table: &str) -> Result<u64> {
    ensure_known_table(table)?;
    let count: i64 = conn.query_row(&format!("SELECT count(*) FROM {table}"), [], |row| {
        row.get(0)
    })?;
    Ok(count as u64)
}

/// All rows of a table as untyped value vectors, in rowid order so source
/// and destination can be compared positionally.
fn read_rows(conn: &Connection, table: &str) -> Result<Vec<Vec<Value>>> {
    ensure_known_table(table)?;
    let mut stmt = conn.prepare(&format!("SELECT * FROM {table} ORDER BY rowid"))?;
    let column_count = stmt.column_count();
    let rows = stmt.query_map([], |row| {
        let mut values = Vec::with_capacity(column_count);
        for i in 0..column_count {
            values.push(row.get::<_, Value>(i)?);
        }
        Ok(values)
    })?;

    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

fn row_at(conn: &Connection, table: &str, offset: u64) -> Result<Option<Vec<Value>>> {
    ensure_known_table(table)?;
    let mut stmt =
        conn.prepare(&format!("SELECT * FROM {table} ORDER BY rowid LIMIT 1 OFFSET ?1"))?;
    let column_count = stmt.column_count();
    let mut rows = stmt.query_map([offset as i64], |row| {
        let mut values = Vec::with_capacity(column_count);
        for i in 0..column_count {
            values.push(row.get::<_, Value>(i)?);
        }
        Ok(values)
    })?;
    match rows.next() {
        Some(row) => Ok(Some(row?)),
        None => Ok(None),
    }
}

/// The plaintext application store. Opened read-only during migration so the
/// source cannot be mutated no matter what the rest of the pipeline does.
pub struct SourceStore {
    conn: Connection,
}

impl SourceStore {
    pub fn open_read_only(path: &Path) -> Result<Self> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        Ok(Self { conn })
    }

    /// Create (or open writable) a source store with the application schema.
    /// Used by bootstrap and tests; migration itself never goes through here.
    pub fn create(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self { conn })
    }

    pub fn count_rows(&self, table: &str) -> Result<u64> {
        count_rows(&self.conn, table)
    }

    pub fn read_rows(&self, table: &str) -> Result<Vec<Vec<Value>>> {
        read_rows(&self.conn, table)
    }

    pub fn row_at(&self, table: &str, offset: u64) -> Result<Option<Vec<Value>>> {
        row_at(&self.conn, table, offset)
    }

    pub fn insert_proposal(&self, title: &str, client: &str, body: &str) -> Result<i64> {
        let now = chrono::Utc::now().to_rfc3339();
        self.conn.execute(
            "INSERT INTO proposals (title, client, body, created_at) VALUES (?1, ?2, ?3, ?4)",
            (title, client, body, now),
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn insert_setting(&self, key: &str, value: &str) -> Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO settings (key, value) VALUES (?1, ?2)",
            (key, value),
        )?;
        Ok(())
    }

    pub fn insert_job_post(&self, title: &str, description: &str, url: Option<&str>) -> Result<i64> {
        let now = chrono::Utc::now().to_rfc3339();
        self.conn.execute(
            "INSERT INTO job_posts (title, description, url, captured_at) VALUES (?1, ?2, ?3, ?4)",
            (title, description, url, now),
        )?;
        Ok(self.conn.last_insert_rowid())
    }
}

/// The SQLCipher destination store, keyed with the derived key.
pub struct EncryptedStore {
    conn: Connection,
}

impl EncryptedStore {
    /// Create a fresh encrypted store. The file must not already exist; a
    /// retry always starts from a clean destination artifact.
    pub fn create(path: &Path, key_pragma: &str) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "key", key_pragma)?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self { conn })
    }

    pub fn open(path: &Path, key_pragma: &str) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "key", key_pragma)?;
        // Force a page read; a wrong key surfaces here as NotADatabase.
        conn.query_row("SELECT count(*) FROM sqlite_master", [], |row| {
            row.get::<_, i64>(0)
        })
        .map_err(|_| Error::CryptoFailure("cannot decrypt store with this key".to_string()))?;
        Ok(Self { conn })
    }

    /// Confirm encryption took effect: an attempt to read the file without
    /// the key must fail.
    pub fn unreadable_without_key(path: &Path) -> Result<bool> {
        let conn = Connection::open(path)?;
        let probe = conn.query_row("SELECT count(*) FROM sqlite_master", [], |row| {
            row.get::<_, i64>(0)
        });
        Ok(probe.is_err())
    }

    pub fn count_rows(&self, table: &str) -> Result<u64> {
        count_rows(&self.conn, table)
    }

    pub fn row_at(&self, table: &str, offset: u64) -> Result<Option<Vec<Value>>> {
        row_at(&self.conn, table, offset)
    }

    /// Bulk-insert untyped rows inside a single transaction.
    pub fn insert_rows(&mut self, table: &str, rows: &[Vec<Value>]) -> Result<()> {
        ensure_known_table(table)?;
        let tx = self.conn.transaction()?;
        for row in rows {
            let placeholders = (1..=row.len())
                .map(|i| format!("?{i}"))
                .collect::<Vec<_>>()
                .join(", ");
            tx.execute(
                &format!("INSERT INTO {table} VALUES ({placeholders})"),
                params_from_iter(row.iter()),
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Write, read back, and delete a probe row. The critical-path smoke
    /// test for post-update health checks.
    pub fn smoke_test(&self) -> Result<()> {
        const PROBE_KEY: &str = "__health_probe__";
        self.conn.execute(
            "INSERT OR REPLACE INTO settings (key, value) VALUES (?1, ?2)",
            (PROBE_KEY, "ok"),
        )?;
        let value: String = self.conn.query_row(
            "SELECT value FROM settings WHERE key = ?1",
            [PROBE_KEY],
            |row| row.get(0),
        )?;
        self.conn
            .execute("DELETE FROM settings WHERE key = ?1", [PROBE_KEY])?;
        if value != "ok" {
            return Err(Error::CryptoFailure(
                "smoke probe read back unexpected value".to_string(),
            ));
        }
        Ok(())
    }
}
