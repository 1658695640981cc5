//! Durable FIFO queue of mutations captured while the network was down.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use reqwest::Method;
use rusqlite::{params, OptionalExtension, Row};
use std::collections::BTreeSet;
use std::str::FromStr;
use std::sync::Arc;
use url::Url;

use crate::cache::parse_datetime;
use crate::db::Database;
use crate::http::{Headers, Request};

/// Lifecycle of a queued mutation. A mutation that replays successfully is
/// deleted, so there is no stored "succeeded" state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationStatus {
  /// Waiting for its first replay
  Pending,
  /// At least one replay failed; retried by later drains after backoff
  Failed,
  /// Retry budget exhausted; kept for inspection until retried or discarded
  Dead,
}

impl MutationStatus {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Pending => "pending",
      Self::Failed => "failed",
      Self::Dead => "dead",
    }
  }
}

impl FromStr for MutationStatus {
  type Err = color_eyre::Report;

  fn from_str(s: &str) -> Result<Self> {
    match s {
      "pending" => Ok(Self::Pending),
      "failed" => Ok(Self::Failed),
      "dead" => Ok(Self::Dead),
      other => Err(eyre!("Unknown mutation status '{}'", other)),
    }
  }
}

impl std::fmt::Display for MutationStatus {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Body and the headers needed to replay it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Payload {
  pub headers: Headers,
  pub body: Vec<u8>,
}

impl Payload {
  /// Capture the body of `request` plus the headers named in `preserve`.
  pub fn from_request(request: &Request, preserve: &BTreeSet<String>) -> Self {
    Self {
      headers: request
        .headers
        .iter()
        .filter(|(name, _)| preserve.contains(name.as_str()))
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect(),
      body: request.body.clone(),
    }
  }
}

/// One pending or failed offline write.
#[derive(Debug, Clone)]
pub struct QueuedMutation {
  pub id: i64,
  pub endpoint: String,
  pub method: String,
  pub payload: Payload,
  pub enqueued_at: DateTime<Utc>,
  pub attempts: u32,
  pub last_error: Option<String>,
  pub last_attempt_at: Option<DateTime<Utc>>,
  pub status: MutationStatus,
}

impl QueuedMutation {
  /// Rebuild the original request for replay.
  pub fn to_request(&self) -> Result<Request> {
    let method = Method::from_bytes(self.method.as_bytes())
      .map_err(|e| eyre!("Invalid method '{}' on mutation {}: {}", self.method, self.id, e))?;
    let url = Url::parse(&self.endpoint)
      .map_err(|e| eyre!("Invalid endpoint '{}' on mutation {}: {}", self.endpoint, self.id, e))?;

    let mut request = Request::new(method, url);
    request.headers = self.payload.headers.clone();
    request.body = self.payload.body.clone();
    Ok(request)
  }

  fn from_row(row: &Row<'_>) -> rusqlite::Result<RawMutation> {
    Ok(RawMutation {
      id: row.get(0)?,
      endpoint: row.get(1)?,
      method: row.get(2)?,
      headers: row.get(3)?,
      body: row.get(4)?,
      enqueued_at: row.get(5)?,
      attempts: row.get(6)?,
      last_error: row.get(7)?,
      last_attempt_at: row.get(8)?,
      status: row.get(9)?,
    })
  }
}

/// Column values before timestamp/status parsing.
struct RawMutation {
  id: i64,
  endpoint: String,
  method: String,
  headers: String,
  body: Vec<u8>,
  enqueued_at: String,
  attempts: u32,
  last_error: Option<String>,
  last_attempt_at: Option<String>,
  status: String,
}

impl RawMutation {
  fn parse(self) -> Result<QueuedMutation> {
    let headers: Headers = serde_json::from_str(&self.headers)
      .map_err(|e| eyre!("Failed to deserialize headers of mutation {}: {}", self.id, e))?;

    Ok(QueuedMutation {
      id: self.id,
      endpoint: self.endpoint,
      method: self.method,
      payload: Payload {
        headers,
        body: self.body,
      },
      enqueued_at: parse_datetime(&self.enqueued_at)?,
      attempts: self.attempts,
      last_error: self.last_error,
      last_attempt_at: self
        .last_attempt_at
        .as_deref()
        .map(parse_datetime)
        .transpose()?,
      status: self.status.parse()?,
    })
  }
}

/// Queue size by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueCounts {
  pub pending: usize,
  pub failed: usize,
  pub dead: usize,
}

impl QueueCounts {
  pub fn total(&self) -> usize {
    self.pending + self.failed + self.dead
  }
}

const SELECT_COLUMNS: &str = "SELECT id, endpoint, method, headers, body, enqueued_at, attempts,
  last_error, last_attempt_at, status FROM mutations";

/// SQLite-backed offline write queue.
#[derive(Clone)]
pub struct OfflineQueue {
  db: Arc<Database>,
}

impl OfflineQueue {
  pub fn new(db: Arc<Database>) -> Self {
    Self { db }
  }

  /// Persist a mutation as pending with zero attempts. Returns its id;
  /// ids increase with enqueue order.
  pub fn enqueue(&self, endpoint: &Url, method: &Method, payload: &Payload) -> Result<i64> {
    let conn = self.db.lock()?;
    let headers = serde_json::to_string(&payload.headers)
      .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;

    conn
      .execute(
        "INSERT INTO mutations (endpoint, method, headers, body, enqueued_at, attempts, status)
         VALUES (?, ?, ?, ?, ?, 0, ?)",
        params![
          endpoint.as_str(),
          method.as_str(),
          headers,
          payload.body,
          Utc::now().to_rfc3339(),
          MutationStatus::Pending.as_str(),
        ],
      )
      .map_err(|e| eyre!("Failed to enqueue mutation: {}", e))?;

    Ok(conn.last_insert_rowid())
  }

  /// Every queued mutation, whatever its status, in FIFO order.
  pub fn list_pending(&self) -> Result<Vec<QueuedMutation>> {
    let conn = self.db.lock()?;
    let mut stmt = conn
      .prepare(&format!("{} ORDER BY id", SELECT_COLUMNS))
      .map_err(|e| eyre!("Failed to prepare queue query: {}", e))?;

    let raw = stmt
      .query_map([], QueuedMutation::from_row)
      .map_err(|e| eyre!("Failed to list queue: {}", e))?
      .collect::<rusqlite::Result<Vec<_>>>()
      .map_err(|e| eyre!("Failed to read queue row: {}", e))?;

    raw.into_iter().map(RawMutation::parse).collect()
  }

  pub fn get(&self, id: i64) -> Result<Option<QueuedMutation>> {
    let conn = self.db.lock()?;
    let raw = conn
      .query_row(
        &format!("{} WHERE id = ?", SELECT_COLUMNS),
        params![id],
        QueuedMutation::from_row,
      )
      .optional()
      .map_err(|e| eyre!("Failed to read mutation {}: {}", id, e))?;

    raw.map(RawMutation::parse).transpose()
  }

  /// Confirmed replay: the mutation leaves the queue.
  pub fn mark_succeeded(&self, id: i64) -> Result<()> {
    let conn = self.db.lock()?;
    conn
      .execute("DELETE FROM mutations WHERE id = ?", params![id])
      .map_err(|e| eyre!("Failed to remove mutation {}: {}", id, e))?;
    Ok(())
  }

  /// Record a failed replay. The mutation stays queued. Returns the new
  /// attempt count.
  pub fn mark_failed(&self, id: i64, error: &str) -> Result<u32> {
    let mut conn = self.db.lock()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    let updated = tx
      .execute(
        "UPDATE mutations
         SET attempts = attempts + 1, last_error = ?, last_attempt_at = ?,
             status = CASE WHEN status = 'dead' THEN 'dead' ELSE 'failed' END
         WHERE id = ?",
        params![error, Utc::now().to_rfc3339(), id],
      )
      .map_err(|e| eyre!("Failed to mark mutation {} failed: {}", id, e))?;
    if updated == 0 {
      return Err(eyre!("Mutation {} not found", id));
    }

    let attempts: u32 = tx
      .query_row(
        "SELECT attempts FROM mutations WHERE id = ?",
        params![id],
        |row| row.get(0),
      )
      .map_err(|e| eyre!("Failed to read attempts of mutation {}: {}", id, e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(attempts)
  }

  /// Move a mutation to the dead-letter state.
  pub fn dead_letter(&self, id: i64) -> Result<()> {
    self.set_status(id, MutationStatus::Dead)
  }

  /// Operator retry: back to pending with the backoff cleared. Attempts
  /// are kept for the record. Returns false if no such mutation exists.
  pub fn retry(&self, id: i64) -> Result<bool> {
    let conn = self.db.lock()?;
    let updated = conn
      .execute(
        "UPDATE mutations SET status = ?, last_attempt_at = NULL WHERE id = ?",
        params![MutationStatus::Pending.as_str(), id],
      )
      .map_err(|e| eyre!("Failed to reset mutation {}: {}", id, e))?;
    Ok(updated > 0)
  }

  /// Operator discard. Returns false if no such mutation exists.
  pub fn discard(&self, id: i64) -> Result<bool> {
    let conn = self.db.lock()?;
    let deleted = conn
      .execute("DELETE FROM mutations WHERE id = ?", params![id])
      .map_err(|e| eyre!("Failed to discard mutation {}: {}", id, e))?;
    Ok(deleted > 0)
  }

  pub fn counts(&self) -> Result<QueueCounts> {
    let conn = self.db.lock()?;
    let mut stmt = conn
      .prepare("SELECT status, COUNT(*) FROM mutations GROUP BY status")
      .map_err(|e| eyre!("Failed to prepare count query: {}", e))?;

    let rows = stmt
      .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))
      .map_err(|e| eyre!("Failed to count queue: {}", e))?
      .collect::<rusqlite::Result<Vec<_>>>()
      .map_err(|e| eyre!("Failed to read count row: {}", e))?;

    let mut counts = QueueCounts::default();
    for (status, count) in rows {
      let count = count as usize;
      match status.parse()? {
        MutationStatus::Pending => counts.pending = count,
        MutationStatus::Failed => counts.failed = count,
        MutationStatus::Dead => counts.dead = count,
      }
    }
    Ok(counts)
  }

  fn set_status(&self, id: i64, status: MutationStatus) -> Result<()> {
    let conn = self.db.lock()?;
    conn
      .execute(
        "UPDATE mutations SET status = ? WHERE id = ?",
        params![status.as_str(), id],
      )
      .map_err(|e| eyre!("Failed to update mutation {}: {}", id, e))?;
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn queue() -> OfflineQueue {
    OfflineQueue::new(Arc::new(Database::open_in_memory().unwrap()))
  }

  fn url(path: &str) -> Url {
    Url::parse(&format!("https://app.example.com{}", path)).unwrap()
  }

  fn payload(body: &str) -> Payload {
    let mut headers = Headers::new();
    headers.insert("content-type".to_string(), "application/json".to_string());
    Payload {
      headers,
      body: body.as_bytes().to_vec(),
    }
  }

  #[test]
  fn test_list_preserves_enqueue_order() {
    let queue = queue();
    let ids: Vec<i64> = (0..5)
      .map(|i| {
        queue
          .enqueue(&url("/api/progress"), &Method::POST, &payload(&i.to_string()))
          .unwrap()
      })
      .collect();

    let listed: Vec<i64> = queue.list_pending().unwrap().iter().map(|m| m.id).collect();
    assert_eq!(listed, ids);

    let first = &queue.list_pending().unwrap()[0];
    assert_eq!(first.status, MutationStatus::Pending);
    assert_eq!(first.attempts, 0);
    assert_eq!(first.payload, payload("0"));
  }

  #[test]
  fn test_mark_succeeded_removes() {
    let queue = queue();
    let id = queue
      .enqueue(&url("/api/study-plan"), &Method::PUT, &payload("{}"))
      .unwrap();

    queue.mark_succeeded(id).unwrap();
    assert!(queue.get(id).unwrap().is_none());
    assert_eq!(queue.counts().unwrap().total(), 0);
  }

  #[test]
  fn test_mark_failed_keeps_entry() {
    let queue = queue();
    let id = queue
      .enqueue(&url("/api/study-plan"), &Method::PUT, &payload("{}"))
      .unwrap();

    assert_eq!(queue.mark_failed(id, "HTTP 500").unwrap(), 1);
    assert_eq!(queue.mark_failed(id, "HTTP 502").unwrap(), 2);

    let mutation = queue.get(id).unwrap().unwrap();
    assert_eq!(mutation.status, MutationStatus::Failed);
    assert_eq!(mutation.attempts, 2);
    assert_eq!(mutation.last_error.as_deref(), Some("HTTP 502"));
    assert!(mutation.last_attempt_at.is_some());
  }

  #[test]
  fn test_mark_failed_unknown_id_errors() {
    assert!(queue().mark_failed(99, "gone").is_err());
  }

  #[test]
  fn test_retry_and_discard() {
    let queue = queue();
    let id = queue
      .enqueue(&url("/api/study-plan"), &Method::POST, &payload("{}"))
      .unwrap();
    queue.mark_failed(id, "offline").unwrap();
    queue.dead_letter(id).unwrap();
    assert_eq!(queue.counts().unwrap().dead, 1);

    assert!(queue.retry(id).unwrap());
    let mutation = queue.get(id).unwrap().unwrap();
    assert_eq!(mutation.status, MutationStatus::Pending);
    assert!(mutation.last_attempt_at.is_none());
    assert_eq!(mutation.attempts, 1);

    assert!(queue.discard(id).unwrap());
    assert!(!queue.discard(id).unwrap());
    assert!(!queue.retry(id).unwrap());
  }

  #[test]
  fn test_payload_keeps_only_preserved_headers() {
    let request = Request::new(Method::POST, url("/api/progress"))
      .with_header("Content-Type", "application/json")
      .with_header("Cookie", "session=abc")
      .with_body("{\"done\":true}");
    let preserve: BTreeSet<String> = ["content-type".to_string()].into_iter().collect();

    let payload = Payload::from_request(&request, &preserve);
    assert_eq!(payload.headers.len(), 1);
    assert_eq!(payload.headers["content-type"], "application/json");
    assert_eq!(payload.body, b"{\"done\":true}");
  }

  #[test]
  fn test_queue_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("offsync.db");

    let id = {
      let queue = OfflineQueue::new(Arc::new(Database::open(&path).unwrap()));
      queue
        .enqueue(&url("/api/study-plan"), &Method::POST, &payload("{\"a\":1}"))
        .unwrap()
    };

    let queue = OfflineQueue::new(Arc::new(Database::open(&path).unwrap()));
    let mutation = queue.get(id).unwrap().unwrap();
    assert_eq!(mutation.endpoint, "https://app.example.com/api/study-plan");
    assert_eq!(mutation.method, "POST");

    let request = mutation.to_request().unwrap();
    assert_eq!(request.method, Method::POST);
    assert_eq!(request.body, b"{\"a\":1}");
  }
}
