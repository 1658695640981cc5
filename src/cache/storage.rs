//! Cache storage trait and SQLite implementation.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::sync::Arc;

use super::traits::CacheEntry;
use crate::db::Database;
use crate::http::{Headers, Response};

/// Trait for cache storage backends.
///
/// Namespaces are disjoint: every lookup names exactly one.
pub trait CacheStorage: Send + Sync {
  /// Create a namespace if it does not exist yet.
  fn create_namespace(&self, namespace: &str) -> Result<()>;

  /// Names of all persisted namespaces.
  fn namespaces(&self) -> Result<Vec<String>>;

  /// Drop a namespace and every entry in it. Returns whether it existed.
  fn delete_namespace(&self, namespace: &str) -> Result<bool>;

  /// Get a single entry by key.
  fn get(&self, namespace: &str, key: &str) -> Result<Option<CacheEntry>>;

  /// Store an entry, replacing any entry with the same key. A replaced
  /// entry counts as newly inserted.
  fn put(&self, namespace: &str, entry: &CacheEntry) -> Result<()>;

  /// Store an entry without letting the namespace grow past `max_entries`.
  ///
  /// When a new key would exceed the bound, the oldest-inserted entries are
  /// evicted first. Count, eviction and insert happen atomically. Returns the
  /// evicted keys.
  fn put_bounded(
    &self,
    namespace: &str,
    entry: &CacheEntry,
    max_entries: usize,
  ) -> Result<Vec<String>>;

  /// Number of entries in a namespace.
  fn len(&self, namespace: &str) -> Result<usize>;

  /// Keys in insertion order, oldest first.
  fn keys(&self, namespace: &str) -> Result<Vec<String>>;
}

/// SQLite-based cache storage implementation.
pub struct SqliteStorage {
  db: Arc<Database>,
}

impl SqliteStorage {
  pub fn new(db: Arc<Database>) -> Self {
    Self { db }
  }
}

impl CacheStorage for SqliteStorage {
  fn create_namespace(&self, namespace: &str) -> Result<()> {
    let conn = self.db.lock()?;
    ensure_namespace(&conn, namespace)
  }

  fn namespaces(&self) -> Result<Vec<String>> {
    let conn = self.db.lock()?;
    let mut stmt = conn
      .prepare("SELECT name FROM cache_namespaces ORDER BY name")
      .map_err(|e| eyre!("Failed to prepare namespace query: {}", e))?;

    let names = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list namespaces: {}", e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read namespace row: {}", e))?;

    Ok(names)
  }

  fn delete_namespace(&self, namespace: &str) -> Result<bool> {
    let mut conn = self.db.lock()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute(
      "DELETE FROM cache_entries WHERE namespace = ?",
      params![namespace],
    )
    .map_err(|e| eyre!("Failed to delete entries of {}: {}", namespace, e))?;
    let deleted = tx
      .execute(
        "DELETE FROM cache_namespaces WHERE name = ?",
        params![namespace],
      )
      .map_err(|e| eyre!("Failed to delete namespace {}: {}", namespace, e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(deleted > 0)
  }

  fn get(&self, namespace: &str, key: &str) -> Result<Option<CacheEntry>> {
    let conn = self.db.lock()?;
    let mut stmt = conn
      .prepare(
        "SELECT method, url, status, headers, body, inserted_at, validated_at
         FROM cache_entries WHERE namespace = ? AND cache_key = ?",
      )
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let row = stmt
      .query_row(params![namespace, key], |row| {
        Ok(StoredRow {
          method: row.get(0)?,
          url: row.get(1)?,
          status: row.get(2)?,
          headers: row.get(3)?,
          body: row.get(4)?,
          inserted_at: row.get(5)?,
          validated_at: row.get(6)?,
        })
      })
      .optional()
      .map_err(|e| eyre!("Failed to read cache entry: {}", e))?;

    row.map(|r| r.into_entry(key)).transpose()
  }

  fn put(&self, namespace: &str, entry: &CacheEntry) -> Result<()> {
    let mut conn = self.db.lock()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    ensure_namespace(&tx, namespace)?;
    insert_entry(&tx, namespace, entry)?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))
  }

  fn put_bounded(
    &self,
    namespace: &str,
    entry: &CacheEntry,
    max_entries: usize,
  ) -> Result<Vec<String>> {
    let mut conn = self.db.lock()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    ensure_namespace(&tx, namespace)?;

    let replacing: bool = tx
      .query_row(
        "SELECT EXISTS(SELECT 1 FROM cache_entries WHERE namespace = ? AND cache_key = ?)",
        params![namespace, entry.key],
        |row| row.get(0),
      )
      .map_err(|e| eyre!("Failed to check existing entry: {}", e))?;

    let mut evicted = Vec::new();
    if !replacing {
      let mut count = count_entries(&tx, namespace)?;
      while count >= max_entries {
        let oldest: Option<(i64, String)> = tx
          .query_row(
            "SELECT id, cache_key FROM cache_entries WHERE namespace = ? ORDER BY id LIMIT 1",
            params![namespace],
            |row| Ok((row.get(0)?, row.get(1)?)),
          )
          .optional()
          .map_err(|e| eyre!("Failed to find oldest entry: {}", e))?;

        let Some((id, key)) = oldest else {
          break;
        };
        tx.execute("DELETE FROM cache_entries WHERE id = ?", params![id])
          .map_err(|e| eyre!("Failed to evict entry: {}", e))?;
        evicted.push(key);
        count -= 1;
      }
    }

    insert_entry(&tx, namespace, entry)?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(evicted)
  }

  fn len(&self, namespace: &str) -> Result<usize> {
    let conn = self.db.lock()?;
    count_entries(&conn, namespace)
  }

  fn keys(&self, namespace: &str) -> Result<Vec<String>> {
    let conn = self.db.lock()?;
    let mut stmt = conn
      .prepare("SELECT cache_key FROM cache_entries WHERE namespace = ? ORDER BY id")
      .map_err(|e| eyre!("Failed to prepare key query: {}", e))?;

    let keys = stmt
      .query_map(params![namespace], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list keys: {}", e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read key row: {}", e))?;

    Ok(keys)
  }
}

/// Raw columns of a cache row.
struct StoredRow {
  method: String,
  url: String,
  status: u16,
  headers: String,
  body: Vec<u8>,
  inserted_at: String,
  validated_at: Option<String>,
}

impl StoredRow {
  fn into_entry(self, key: &str) -> Result<CacheEntry> {
    let headers: Headers = serde_json::from_str(&self.headers)
      .map_err(|e| eyre!("Failed to deserialize cached headers: {}", e))?;

    Ok(CacheEntry {
      key: key.to_string(),
      method: self.method,
      url: self.url,
      response: Response {
        status: self.status,
        headers,
        body: self.body,
      },
      inserted_at: parse_datetime(&self.inserted_at)?,
      validated_at: self
        .validated_at
        .as_deref()
        .map(parse_datetime)
        .transpose()?,
    })
  }
}

fn ensure_namespace(conn: &Connection, namespace: &str) -> Result<()> {
  conn
    .execute(
      "INSERT OR IGNORE INTO cache_namespaces (name, created_at) VALUES (?, ?)",
      params![namespace, Utc::now().to_rfc3339()],
    )
    .map_err(|e| eyre!("Failed to create namespace {}: {}", namespace, e))?;
  Ok(())
}

fn insert_entry(conn: &Connection, namespace: &str, entry: &CacheEntry) -> Result<()> {
  let headers = serde_json::to_string(&entry.response.headers)
    .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;

  conn
    .execute(
      "INSERT OR REPLACE INTO cache_entries
         (namespace, cache_key, method, url, status, headers, body, inserted_at, validated_at)
       VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
      params![
        namespace,
        entry.key,
        entry.method,
        entry.url,
        entry.response.status,
        headers,
        entry.response.body,
        entry.inserted_at.to_rfc3339(),
        entry.validated_at.map(|t| t.to_rfc3339()),
      ],
    )
    .map_err(|e| eyre!("Failed to store cache entry: {}", e))?;
  Ok(())
}

fn count_entries(conn: &Connection, namespace: &str) -> Result<usize> {
  let count: i64 = conn
    .query_row(
      "SELECT COUNT(*) FROM cache_entries WHERE namespace = ?",
      params![namespace],
      |row| row.get(0),
    )
    .map_err(|e| eyre!("Failed to count entries: {}", e))?;
  Ok(count as usize)
}

/// Parse an RFC 3339 timestamp as written by this module.
pub(crate) fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}
