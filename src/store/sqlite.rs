//! SQLite implementation of the gateway store.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use super::{QueuedRequest, Store};

/// Default ceiling for cached response bodies (1 MiB).
pub const DEFAULT_CACHE_BODY_LIMIT: usize = 1024 * 1024;

/// Default row cap for the response cache.
pub const DEFAULT_CACHE_MAX_ENTRIES: u32 = 2048;

/// Schema for the gateway tables.
const SCHEMA: &str = r#"
-- Writes awaiting delivery, drained in ascending id order
CREATE TABLE IF NOT EXISTS request_queue (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    url TEXT NOT NULL,
    method TEXT NOT NULL,
    body TEXT,
    headers TEXT NOT NULL,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Memoized successful reads, keyed by normalized URL
CREATE TABLE IF NOT EXISTS response_cache (
    url TEXT PRIMARY KEY,
    body TEXT NOT NULL,
    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
);
"#;

/// SQLite-backed store for the write-queue and read-cache.
pub struct SqliteStore {
  conn: Mutex<Connection>,
  body_limit: usize,
  max_entries: u32,
}

impl SqliteStore {
  /// Open or create the database at the default location.
  pub fn open() -> Result<Self> {
    let path = Self::default_path()?;
    Self::open_at(&path)
  }

  /// Open or create the database at an explicit path.
  pub fn open_at(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create gateway data directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open gateway database at {}: {}", path.display(), e))?;

    Self::from_connection(conn)
  }

  /// Open an in-memory database. Used by tests.
  pub fn open_in_memory() -> Result<Self> {
    let conn =
      Connection::open_in_memory().map_err(|e| eyre!("Failed to open in-memory database: {}", e))?;
    Self::from_connection(conn)
  }

  fn from_connection(conn: Connection) -> Result<Self> {
    let store = Self {
      conn: Mutex::new(conn),
      body_limit: DEFAULT_CACHE_BODY_LIMIT,
      max_entries: DEFAULT_CACHE_MAX_ENTRIES,
    };
    store.run_migrations()?;
    Ok(store)
  }

  /// Override the cache body ceiling and row cap.
  pub fn with_limits(mut self, body_limit: usize, max_entries: u32) -> Self {
    self.body_limit = body_limit;
    self.max_entries = max_entries;
    self
  }

  /// Get the default database path.
  fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("lifeline").join("gateway.db"))
  }

  /// Run database migrations for the gateway tables.
  fn run_migrations(&self) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute_batch(SCHEMA)
      .map_err(|e| eyre!("Failed to run gateway migrations: {}", e))?;

    Ok(())
  }
}

impl Store for SqliteStore {
  fn enqueue(
    &self,
    url: &str,
    method: &str,
    body: Option<&str>,
    headers: &HashMap<String, String>,
  ) -> Result<i64> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let headers_json =
      serde_json::to_string(headers).map_err(|e| eyre!("Failed to serialize headers: {}", e))?;

    conn
      .execute(
        "INSERT INTO request_queue (url, method, body, headers) VALUES (?, ?, ?, ?)",
        params![url, method, body, headers_json],
      )
      .map_err(|e| eyre!("Failed to enqueue request: {}", e))?;

    Ok(conn.last_insert_rowid())
  }

  fn dequeue_oldest(&self, limit: u32) -> Result<Vec<QueuedRequest>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let mut stmt = conn
      .prepare(
        "SELECT id, url, method, body, headers, created_at FROM request_queue
         ORDER BY id ASC LIMIT ?",
      )
      .map_err(|e| eyre!("Failed to prepare queue query: {}", e))?;

    let rows: Vec<(i64, String, String, Option<String>, String, String)> = stmt
      .query_map(params![limit], |row| {
        Ok((
          row.get(0)?,
          row.get(1)?,
          row.get(2)?,
          row.get(3)?,
          row.get(4)?,
          row.get(5)?,
        ))
      })
      .map_err(|e| eyre!("Failed to query request queue: {}", e))?
      .filter_map(|r| r.ok())
      .collect();

    let mut requests = Vec::with_capacity(rows.len());
    for (id, url, method, body, headers_json, created_at) in rows {
      let headers: HashMap<String, String> = serde_json::from_str(&headers_json)
        .map_err(|e| eyre!("Failed to parse headers for queued request {}: {}", id, e))?;
      requests.push(QueuedRequest {
        id,
        url,
        method,
        body,
        headers,
        created_at: parse_datetime(&created_at)?,
      });
    }

    Ok(requests)
  }

  fn remove(&self, id: i64) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute("DELETE FROM request_queue WHERE id = ?", params![id])
      .map_err(|e| eyre!("Failed to remove queued request {}: {}", id, e))?;

    Ok(())
  }

  fn put_cache(&self, url: &str, body: &str) -> Result<()> {
    if body.len() > self.body_limit {
      return Ok(()); // Skip oversized bodies
    }

    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute(
        "INSERT OR REPLACE INTO response_cache (url, body, updated_at)
         VALUES (?, ?, datetime('now'))",
        params![url, body],
      )
      .map_err(|e| eyre!("Failed to store cached response: {}", e))?;

    // Keep the cache bounded: drop the least recently written rows
    conn
      .execute(
        "DELETE FROM response_cache WHERE url NOT IN (
           SELECT url FROM response_cache ORDER BY updated_at DESC, url LIMIT ?)",
        params![self.max_entries],
      )
      .map_err(|e| eyre!("Failed to prune response cache: {}", e))?;

    Ok(())
  }

  fn get_cache(&self, url: &str) -> Result<Option<String>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let body = conn
      .query_row(
        "SELECT body FROM response_cache WHERE url = ?",
        params![url],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read cached response: {}", e))?;

    Ok(body)
  }

  fn count_queued(&self) -> Result<i64> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let count = conn
      .query_row("SELECT COUNT(*) FROM request_queue", [], |row| row.get(0))
      .map_err(|e| eyre!("Failed to count queued requests: {}", e))?;

    Ok(count)
  }

  fn clear(&self) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute_batch("DELETE FROM request_queue; DELETE FROM response_cache;")
      .map_err(|e| eyre!("Failed to clear gateway store: {}", e))?;

    Ok(())
  }
}

/// Parse a datetime string from SQLite format.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  // SQLite stores as "YYYY-MM-DD HH:MM:SS"
  chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
    .map(|dt| dt.and_utc())
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}
