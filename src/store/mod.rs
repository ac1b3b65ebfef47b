//! Durable local storage for the request gateway.
//!
//! Two tables back the offline behavior: a write-queue of requests that
//! could not be delivered, and a read-cache of successful responses. Both
//! survive host-process restarts and are independent of the UI lifecycle.

mod sqlite;

pub use sqlite::SqliteStore;

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use std::collections::HashMap;

/// A write operation that could not be delivered to the central server.
///
/// Records are immutable once enqueued: they are removed on confirmed
/// delivery or wiped by a store reset, never updated in place. Ascending
/// id is the delivery order.
#[derive(Debug, Clone)]
pub struct QueuedRequest {
  /// Monotonic queue id
  pub id: i64,
  /// Absolute target URL
  pub url: String,
  /// HTTP method
  pub method: String,
  /// Serialized request body, if any
  pub body: Option<String>,
  /// Headers captured at enqueue time
  pub headers: HashMap<String, String>,
  /// When the request was queued
  pub created_at: DateTime<Utc>,
}

/// Trait for gateway storage backends.
///
/// All operations are synchronous single-row disk accesses; callers must
/// treat them as briefly blocking and keep them out of tight loops.
pub trait Store: Send + Sync {
  /// Append a failed write to the queue, returning its id.
  fn enqueue(
    &self,
    url: &str,
    method: &str,
    body: Option<&str>,
    headers: &HashMap<String, String>,
  ) -> Result<i64>;

  /// Return up to `limit` queued requests in ascending id order.
  /// Does not remove them.
  fn dequeue_oldest(&self, limit: u32) -> Result<Vec<QueuedRequest>>;

  /// Delete one queued request. No error if it is already gone.
  fn remove(&self, id: i64) -> Result<()>;

  /// Upsert one cached response body. Bodies above the configured ceiling
  /// are skipped silently.
  fn put_cache(&self, url: &str, body: &str) -> Result<()>;

  /// Look up a cached response body by normalized URL.
  fn get_cache(&self, url: &str) -> Result<Option<String>>;

  /// Number of requests currently queued.
  fn count_queued(&self) -> Result<i64>;

  /// Wipe both tables. The only way queued records disappear without
  /// being delivered.
  fn clear(&self) -> Result<()>;
}

/// Storage implementation that persists nothing.
///
/// Used when offline support is disabled or the database could not be
/// opened: reads always miss, cache writes are discarded, and enqueueing
/// fails so the dispatcher surfaces the original network error instead of
/// acknowledging a write it cannot replay.
pub struct NoopStore;

impl Store for NoopStore {
  fn enqueue(
    &self,
    _url: &str,
    _method: &str,
    _body: Option<&str>,
    _headers: &HashMap<String, String>,
  ) -> Result<i64> {
    Err(eyre!("offline queue is disabled"))
  }

  fn dequeue_oldest(&self, _limit: u32) -> Result<Vec<QueuedRequest>> {
    Ok(Vec::new())
  }

  fn remove(&self, _id: i64) -> Result<()> {
    Ok(())
  }

  fn put_cache(&self, _url: &str, _body: &str) -> Result<()> {
    Ok(()) // Discard
  }

  fn get_cache(&self, _url: &str) -> Result<Option<String>> {
    Ok(None) // Always miss
  }

  fn count_queued(&self) -> Result<i64> {
    Ok(0)
  }

  fn clear(&self) -> Result<()> {
    Ok(())
  }
}
