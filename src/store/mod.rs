//! Durable crawl state: work queue, visited set, and error log.
//!
//! This module provides `SQLite`-backed persistence for the crawl so it can
//! be paused, killed, or resumed without loss or duplication. The store owns
//! a single connection; every operation is serialised through it, and
//! mutations are batched into an explicit transaction that is committed
//! every [`DEFAULT_BATCH_SIZE`] writes, on a coordinator timer, and on
//! shutdown.
//!
//! # Overview
//!
//! Three tables back the crawl:
//! - `queue` - deduplicating FIFO of `(url, depth)` awaiting processing
//! - `visited` - membership set with a monotonic id for export consumers
//! - `errors` - append-only fetch failure log
//!
//! # Example
//!
//! ```no_run
//! use crawler_core::Store;
//! use std::path::Path;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = Store::connect(Path::new("crawler.db")).await?;
//! store.enqueue("https://example.com/", 0).await?;
//! if let Some((url, depth)) = store.dequeue().await? {
//!     store.mark_visited(&url, depth).await?;
//! }
//! store.close().await?;
//! # Ok(())
//! # }
//! ```

mod error;

pub use error::{StoreDbErrorKind, StoreError};

use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqliteSynchronous};
use sqlx::{Connection, Row, SqliteConnection};
use tokio::sync::Mutex;
use tracing::{debug, instrument};

/// Mutations buffered before the store forces a commit.
pub const DEFAULT_BATCH_SIZE: u32 = 50;

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// A visited row as served to the export consumer.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct VisitedRow {
    /// Monotonic insertion id; strictly increasing, gaps permitted.
    pub id: i64,
    /// The visited URL.
    pub url: String,
}

/// Connection state guarded by the store mutex.
///
/// `conn` becomes `None` once the store is closed; `pending` counts
/// mutations in the open batch transaction.
#[derive(Debug)]
struct StoreInner {
    conn: Option<SqliteConnection>,
    pending: u32,
    in_txn: bool,
}

/// Durable, crash-tolerant crawl store.
///
/// Cloning is cheap; clones share the underlying connection. All
/// operations are atomic with respect to each other: the internal mutex
/// serialises access, so a concurrent `dequeue` either returns a different
/// row or comes back empty.
#[derive(Debug, Clone)]
pub struct Store {
    inner: Arc<Mutex<StoreInner>>,
    batch_size: u32,
}

impl Store {
    /// Opens (creating if missing) the database at `path` and prepares the
    /// schema.
    ///
    /// Applied on connect: WAL journalling, `synchronous=NORMAL`, and
    /// in-memory temp storage. The relaxed synchronous level trades the
    /// most recent unflushed batch for throughput; an abrupt power loss
    /// can drop up to one batch of mutations but never corrupts the file.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the file cannot be opened or
    /// the schema cannot be created. Both are fatal to a crawl.
    #[instrument(skip(path), fields(path = %path.display()))]
    pub async fn connect(path: &Path) -> Result<Self> {
        Self::connect_with_batch_size(path, DEFAULT_BATCH_SIZE).await
    }

    /// Opens the database with an explicit mutation batch size.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] on open or schema failure.
    #[instrument(skip(path), fields(path = %path.display()))]
    pub async fn connect_with_batch_size(path: &Path, batch_size: u32) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .pragma("temp_store", "MEMORY");

        let mut conn = SqliteConnection::connect_with(&options).await?;
        create_schema(&mut conn).await?;

        debug!(batch_size, "store connected");

        Ok(Self {
            inner: Arc::new(Mutex::new(StoreInner {
                conn: Some(conn),
                pending: 0,
                in_txn: false,
            })),
            batch_size: batch_size.max(1),
        })
    }

    /// Creates an in-memory store for testing.
    ///
    /// The database exists only for the lifetime of the connection. WAL
    /// mode is not applied since it provides no benefit in memory.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the connection fails.
    #[instrument]
    pub async fn connect_in_memory() -> Result<Self> {
        Self::connect_in_memory_with_batch_size(DEFAULT_BATCH_SIZE).await
    }

    /// Creates an in-memory store with an explicit batch size.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the connection fails.
    #[instrument]
    pub async fn connect_in_memory_with_batch_size(batch_size: u32) -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let mut conn = SqliteConnection::connect_with(&options).await?;
        create_schema(&mut conn).await?;

        Ok(Self {
            inner: Arc::new(Mutex::new(StoreInner {
                conn: Some(conn),
                pending: 0,
                in_txn: false,
            })),
            batch_size: batch_size.max(1),
        })
    }

    /// Inserts a URL into the queue if it is neither queued nor visited.
    ///
    /// Idempotent: re-enqueueing a known URL is a no-op, so callers never
    /// pre-check. A URL with a visited row does not grow the queue.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the insert fails; the pending
    /// batch is left intact.
    #[instrument(skip(self), fields(url = %url, depth))]
    pub async fn enqueue(&self, url: &str, depth: i64) -> Result<()> {
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;
        begin_if_needed(inner).await?;
        let conn = inner.conn.as_mut().ok_or(StoreError::Closed)?;
        sqlx::query(
            r"INSERT OR IGNORE INTO queue (url, depth)
              SELECT ?, ?
              WHERE NOT EXISTS (SELECT 1 FROM visited WHERE url = ?)",
        )
        .bind(url)
        .bind(depth)
        .bind(url)
        .execute(&mut *conn)
        .await?;
        note_mutation(inner, self.batch_size).await
    }

    /// Removes and returns the oldest queue entry.
    ///
    /// The read and delete form one critical section, so when multiple
    /// workers call concurrently each URL is handed to at most one caller.
    /// Returns `None` immediately when the queue is empty.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the delete fails.
    #[instrument(skip(self))]
    pub async fn dequeue(&self) -> Result<Option<(String, i64)>> {
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;
        begin_if_needed(inner).await?;
        let conn = inner.conn.as_mut().ok_or(StoreError::Closed)?;
        // Smallest rowid is the insertion-order head of the FIFO.
        let row = sqlx::query(
            r"DELETE FROM queue
              WHERE url = (SELECT url FROM queue ORDER BY rowid LIMIT 1)
              RETURNING url, depth",
        )
        .fetch_optional(&mut *conn)
        .await?;

        match row {
            Some(row) => {
                let url: String = row.get("url");
                let depth: i64 = row.get("depth");
                note_mutation(inner, self.batch_size).await?;
                Ok(Some((url, depth)))
            }
            None => Ok(None),
        }
    }

    /// Returns true when the URL has a visited row.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the query fails.
    #[instrument(skip(self), fields(url = %url))]
    pub async fn is_visited(&self, url: &str) -> Result<bool> {
        let mut guard = self.inner.lock().await;
        let conn = guard.conn.as_mut().ok_or(StoreError::Closed)?;
        let row = sqlx::query("SELECT 1 FROM visited WHERE url = ? LIMIT 1")
            .bind(url)
            .fetch_optional(&mut *conn)
            .await?;
        Ok(row.is_some())
    }

    /// Records the URL as visited. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the insert fails.
    #[instrument(skip(self), fields(url = %url, depth))]
    pub async fn mark_visited(&self, url: &str, depth: i64) -> Result<()> {
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;
        begin_if_needed(inner).await?;
        let conn = inner.conn.as_mut().ok_or(StoreError::Closed)?;
        sqlx::query("INSERT OR IGNORE INTO visited (url, depth) VALUES (?, ?)")
            .bind(url)
            .bind(depth)
            .execute(&mut *conn)
            .await?;
        note_mutation(inner, self.batch_size).await
    }

    /// Advisory queue depth; may race with concurrent writers.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the query fails.
    #[instrument(skip(self))]
    pub async fn queue_size(&self) -> Result<i64> {
        let mut guard = self.inner.lock().await;
        let conn = guard.conn.as_mut().ok_or(StoreError::Closed)?;
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM queue")
            .fetch_one(&mut *conn)
            .await?;
        Ok(count)
    }

    /// Appends a row to the error log.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the insert fails.
    #[instrument(skip(self, message), fields(url = %url, error_type = %error_type))]
    pub async fn log_error(&self, url: &str, error_type: &str, message: &str) -> Result<()> {
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;
        begin_if_needed(inner).await?;
        let conn = inner.conn.as_mut().ok_or(StoreError::Closed)?;
        sqlx::query("INSERT INTO errors (url, error_type, message) VALUES (?, ?, ?)")
            .bind(url)
            .bind(error_type)
            .bind(message)
            .execute(&mut *conn)
            .await?;
        note_mutation(inner, self.batch_size).await
    }

    /// Number of rows in the error log.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the query fails.
    #[instrument(skip(self))]
    pub async fn error_count(&self) -> Result<i64> {
        let mut guard = self.inner.lock().await;
        let conn = guard.conn.as_mut().ok_or(StoreError::Closed)?;
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM errors")
            .fetch_one(&mut *conn)
            .await?;
        Ok(count)
    }

    /// Returns visited rows with `id > last_id`, ascending, at most
    /// `limit` of them. Ids are strictly increasing across process
    /// restarts (gaps permitted, inversions never), which makes the
    /// export cursor resumable.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the query fails.
    #[instrument(skip(self))]
    pub async fn fetch_visited_since(&self, last_id: i64, limit: i64) -> Result<Vec<VisitedRow>> {
        let mut guard = self.inner.lock().await;
        let conn = guard.conn.as_mut().ok_or(StoreError::Closed)?;
        let rows = sqlx::query_as::<_, VisitedRow>(
            r"SELECT id, url
              FROM visited
              WHERE id > ?
              ORDER BY id
              LIMIT ?",
        )
        .bind(last_id)
        .bind(limit)
        .fetch_all(&mut *conn)
        .await?;
        Ok(rows)
    }

    /// Forces durability of the buffered batch.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the commit fails.
    #[instrument(skip(self))]
    pub async fn commit(&self) -> Result<()> {
        let mut guard = self.inner.lock().await;
        commit_pending(&mut guard).await
    }

    /// Commits the open batch and releases the connection.
    ///
    /// Subsequent operations return [`StoreError::Closed`]. Safe to call
    /// more than once.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the final commit or the close
    /// handshake fails.
    #[instrument(skip(self))]
    pub async fn close(&self) -> Result<()> {
        let mut guard = self.inner.lock().await;
        if guard.conn.is_none() {
            return Ok(());
        }
        commit_pending(&mut guard).await?;
        if let Some(conn) = guard.conn.take() {
            conn.close().await?;
        }
        Ok(())
    }
}

/// Opens the batch transaction if one is not already running.
async fn begin_if_needed(inner: &mut StoreInner) -> Result<()> {
    if inner.in_txn {
        return Ok(());
    }
    let conn = inner.conn.as_mut().ok_or(StoreError::Closed)?;
    sqlx::query("BEGIN").execute(&mut *conn).await?;
    inner.in_txn = true;
    Ok(())
}

/// Counts one mutation and commits when the batch is full.
async fn note_mutation(inner: &mut StoreInner, batch_size: u32) -> Result<()> {
    inner.pending += 1;
    if inner.pending >= batch_size {
        commit_pending(inner).await?;
    }
    Ok(())
}

/// Commits the open transaction, if any, and resets the batch counter.
async fn commit_pending(inner: &mut StoreInner) -> Result<()> {
    if !inner.in_txn {
        return Ok(());
    }
    let conn = inner.conn.as_mut().ok_or(StoreError::Closed)?;
    sqlx::query("COMMIT").execute(&mut *conn).await?;
    inner.in_txn = false;
    inner.pending = 0;
    Ok(())
}

async fn create_schema(conn: &mut SqliteConnection) -> Result<()> {
    sqlx::query(
        r"CREATE TABLE IF NOT EXISTS queue (
              url TEXT PRIMARY KEY,
              depth INTEGER,
              enqueued_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
          )",
    )
    .execute(&mut *conn)
    .await?;

    sqlx::query(
        r"CREATE TABLE IF NOT EXISTS visited (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              url TEXT UNIQUE,
              depth INTEGER,
              visited_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
          )",
    )
    .execute(&mut *conn)
    .await?;

    sqlx::query(
        r"CREATE TABLE IF NOT EXISTS errors (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              url TEXT,
              error_type TEXT,
              message TEXT,
              occurred_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
          )",
    )
    .execute(&mut *conn)
    .await?;

    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_enqueue_then_dequeue_round_trips() {
        let store = Store::connect_in_memory().await.unwrap();
        store.enqueue("https://a.test/", 0).await.unwrap();

        let item = store.dequeue().await.unwrap();
        assert_eq!(item, Some(("https://a.test/".to_string(), 0)));
        assert_eq!(store.dequeue().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_dequeue_preserves_insertion_order() {
        let store = Store::connect_in_memory().await.unwrap();
        store.enqueue("https://a.test/1", 0).await.unwrap();
        store.enqueue("https://a.test/2", 1).await.unwrap();
        store.enqueue("https://a.test/3", 2).await.unwrap();

        let (first, _) = store.dequeue().await.unwrap().unwrap();
        let (second, _) = store.dequeue().await.unwrap().unwrap();
        let (third, _) = store.dequeue().await.unwrap().unwrap();
        assert_eq!(first, "https://a.test/1");
        assert_eq!(second, "https://a.test/2");
        assert_eq!(third, "https://a.test/3");
    }

    #[tokio::test]
    async fn test_enqueue_is_deduplicating() {
        let store = Store::connect_in_memory().await.unwrap();
        store.enqueue("https://a.test/", 0).await.unwrap();
        store.enqueue("https://a.test/", 3).await.unwrap();

        assert_eq!(store.queue_size().await.unwrap(), 1);
        // The first depth wins.
        assert_eq!(
            store.dequeue().await.unwrap(),
            Some(("https://a.test/".to_string(), 0))
        );
    }

    #[tokio::test]
    async fn test_enqueue_filters_visited_urls() {
        let store = Store::connect_in_memory().await.unwrap();
        store.mark_visited("https://a.test/", 0).await.unwrap();

        store.enqueue("https://a.test/", 1).await.unwrap();
        assert_eq!(store.queue_size().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_mark_visited_is_idempotent() {
        let store = Store::connect_in_memory().await.unwrap();
        store.mark_visited("https://a.test/", 0).await.unwrap();
        store.mark_visited("https://a.test/", 2).await.unwrap();

        let rows = store.fetch_visited_since(0, 10).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].url, "https://a.test/");
    }

    #[tokio::test]
    async fn test_is_visited_reflects_mark() {
        let store = Store::connect_in_memory().await.unwrap();
        assert!(!store.is_visited("https://a.test/").await.unwrap());

        store.mark_visited("https://a.test/", 0).await.unwrap();
        assert!(store.is_visited("https://a.test/").await.unwrap());
    }

    #[tokio::test]
    async fn test_fetch_visited_since_orders_and_limits() {
        let store = Store::connect_in_memory().await.unwrap();
        for i in 0..5 {
            store
                .mark_visited(&format!("https://a.test/{i}"), 0)
                .await
                .unwrap();
        }

        let rows = store.fetch_visited_since(0, 3).await.unwrap();
        assert_eq!(rows.len(), 3);
        assert!(rows.windows(2).all(|pair| pair[0].id < pair[1].id));

        let rest = store
            .fetch_visited_since(rows.last().unwrap().id, 10)
            .await
            .unwrap();
        assert_eq!(rest.len(), 2);
        assert!(rest.iter().all(|row| row.id > rows.last().unwrap().id));
    }

    #[tokio::test]
    async fn test_log_error_appends() {
        let store = Store::connect_in_memory().await.unwrap();
        assert_eq!(store.error_count().await.unwrap(), 0);

        store
            .log_error("https://a.test/", "fetch_failed", "timeout")
            .await
            .unwrap();
        store
            .log_error("https://a.test/", "fetch_failed", "connection reset")
            .await
            .unwrap();
        assert_eq!(store.error_count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_small_batch_commits_automatically() {
        let store = Store::connect_in_memory_with_batch_size(2).await.unwrap();
        store.enqueue("https://a.test/1", 0).await.unwrap();
        store.enqueue("https://a.test/2", 0).await.unwrap();
        store.enqueue("https://a.test/3", 0).await.unwrap();

        // Reads go through the same connection, committed or not.
        assert_eq!(store.queue_size().await.unwrap(), 3);
        store.commit().await.unwrap();
        assert_eq!(store.queue_size().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_rejects_later_ops() {
        let store = Store::connect_in_memory().await.unwrap();
        store.enqueue("https://a.test/", 0).await.unwrap();
        store.close().await.unwrap();
        store.close().await.unwrap();

        let result = store.enqueue("https://a.test/2", 0).await;
        assert!(matches!(result, Err(StoreError::Closed)));
    }

    #[tokio::test]
    async fn test_file_store_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("crawl.db");

        let store = Store::connect(&path).await.unwrap();
        store.mark_visited("https://a.test/", 0).await.unwrap();
        store.enqueue("https://a.test/next", 1).await.unwrap();
        store.close().await.unwrap();

        let reopened = Store::connect(&path).await.unwrap();
        assert!(reopened.is_visited("https://a.test/").await.unwrap());
        assert_eq!(
            reopened.dequeue().await.unwrap(),
            Some(("https://a.test/next".to_string(), 1))
        );
        reopened.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_concurrent_dequeue_claims_each_url_once() {
        let store = Store::connect_in_memory().await.unwrap();
        for i in 0..20 {
            store
                .enqueue(&format!("https://a.test/{i}"), 0)
                .await
                .unwrap();
        }

        let mut handles = Vec::new();
        for _ in 0..10 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                let mut claimed = Vec::new();
                while let Some((url, _)) = store.dequeue().await.unwrap() {
                    claimed.push(url);
                }
                claimed
            }));
        }

        let mut all = Vec::new();
        for handle in handles {
            all.extend(handle.await.unwrap());
        }
        all.sort();
        all.dedup();
        assert_eq!(all.len(), 20, "every URL claimed exactly once");
    }
}
