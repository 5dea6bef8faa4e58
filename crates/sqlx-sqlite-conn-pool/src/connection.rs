//! A single native SQLite handle with serialized command execution

use libsqlite3_sys::sqlite3;
use parking_lot::Mutex;
use sqlx::Connection as _;
use sqlx::ConnectOptions;
use sqlx::sqlite::SqliteConnection;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::{debug, trace};

use crate::Result;
use crate::busy_handler::BusyHandler;
use crate::error::Error;
use crate::lock_policy::TableLockPolicy;
use crate::statement::{self, CheckpointMode, CheckpointResult, ExecuteResult};
use crate::storage::{OpenOptions, StorageLocation};
use crate::value::{FromValue, Row, Value};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of a [`Connection`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
   fn next() -> Self {
      ConnectionId(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
   }
}

/// One native database handle.
///
/// Every command (statement, batch, checkpoint) holds the connection's
/// execution lock from its first attempt until it succeeds or fails, so at most
/// one command drives the handle at any instant and retries of one command
/// never interleave with another.
///
/// Two kinds of contention are retried, each by its own strategy:
///
/// - `SQLITE_LOCKED` (a table locked by another shared-cache connection) is
///   governed by the [`TableLockPolicy`].
/// - `SQLITE_BUSY` (the database file locked by another connection) is
///   governed by the [`BusyHandler`].
///
/// Every other error is returned on first occurrence.
///
/// # Example
///
/// ```no_run
/// use sqlx_sqlite_conn_pool::{Connection, OpenOptions, StorageLocation, Value};
///
/// # async fn example() -> sqlx_sqlite_conn_pool::Result<()> {
/// let location = StorageLocation::on_disk("app.db");
/// let conn = Connection::open(&location, OpenOptions::new()).await?;
///
/// conn.execute("CREATE TABLE IF NOT EXISTS agents(name TEXT PRIMARY KEY)").await?;
/// conn.run("INSERT INTO agents(name) VALUES (?)", &[Value::from("Bond")]).await?;
///
/// let count: Option<i64> = conn.query("SELECT count(*) FROM agents", &[]).await?;
/// assert_eq!(count, Some(1));
///
/// conn.close().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct Connection {
   id: ConnectionId,

   /// Execution serializer; `None` once closed
   handle: tokio::sync::Mutex<Option<SqliteConnection>>,

   read_only: bool,
   shared_cache: bool,
   table_lock_policy: Mutex<TableLockPolicy>,
   busy_handler: Mutex<BusyHandler>,
}

impl Connection {
   /// Opens a native handle on `location`
   ///
   /// Fails with a [`SqliteErrorKind::CannotOpen`](crate::SqliteErrorKind::CannotOpen)
   /// error when the engine cannot open the location, for example because the
   /// parent directory does not exist.
   pub async fn open(location: &StorageLocation, options: OpenOptions) -> Result<Self> {
      location.validate()?;

      let conn = options.connect_options(location).connect().await?;
      let id = ConnectionId::next();

      debug!(
         ?id,
         ?location,
         read_only = options.is_read_only(),
         shared_cache = options.is_shared_cache(),
         "Opened connection"
      );

      Ok(Self {
         id,
         handle: tokio::sync::Mutex::new(Some(conn)),
         read_only: options.is_read_only(),
         shared_cache: options.is_shared_cache(),
         table_lock_policy: Mutex::new(options.lock_policy()),
         busy_handler: Mutex::new(BusyHandler::default()),
      })
   }

   pub fn id(&self) -> ConnectionId {
      self.id
   }

   pub fn is_read_only(&self) -> bool {
      self.read_only
   }

   pub fn is_shared_cache(&self) -> bool {
      self.shared_cache
   }

   pub fn table_lock_policy(&self) -> TableLockPolicy {
      *self.table_lock_policy.lock()
   }

   /// Replaces the policy applied to table lock conflicts.
   ///
   /// Takes effect for the next command; a command already retrying keeps the
   /// policy it started with.
   pub fn set_table_lock_policy(&self, policy: TableLockPolicy) {
      *self.table_lock_policy.lock() = policy;
   }

   /// Installs the strategy applied to busy conditions.
   ///
   /// Any engine-level busy handler on the handle (for instance one set with
   /// `PRAGMA busy_timeout`) is removed so that `handler` is the only one in
   /// effect.
   pub async fn set_busy_handler(&self, handler: BusyHandler) -> Result<()> {
      let mut guard = self.handle.lock().await;
      let conn = guard.as_mut().ok_or(Error::ConnectionClosed)?;

      {
         let mut locked = conn.lock_handle().await?;
         let db = locked.as_raw_handle();
         // SAFETY: the handle lock gives exclusive use of db for this call.
         unsafe { statement::clear_engine_busy_handler(db.as_ptr())? };
      }

      debug!(id = ?self.id, ?handler, "Installed busy handler");
      *self.busy_handler.lock() = handler;
      Ok(())
   }

   pub async fn is_closed(&self) -> bool {
      self.handle.lock().await.is_none()
   }

   /// Runs every statement in `sql`, discarding any result rows.
   ///
   /// If a statement hits a retryable lock, only that statement and the ones
   /// after it are re-run.
   pub async fn execute(&self, sql: &str) -> Result<()> {
      let mut offset = 0;
      self
         .with_retry(|db| {
            // SAFETY: with_retry hands out db exclusively for the duration of the call.
            unsafe { statement::execute_batch(db, &sql[offset..]) }.map_err(|failure| {
               offset += failure.resume_at;
               failure.error
            })
         })
         .await
   }

   /// Runs a single statement with bound parameters
   pub async fn run(&self, sql: &str, params: &[Value]) -> Result<ExecuteResult> {
      self
         // SAFETY: with_retry hands out db exclusively for the duration of the call.
         .with_retry(|db| unsafe { statement::run(db, sql, params) })
         .await
   }

   /// First column of the first row, or `None` when there are no rows
   pub async fn query<T: FromValue>(&self, sql: &str, params: &[Value]) -> Result<Option<T>> {
      match self.query_row(sql, params).await? {
         Some(row) => row.get(0).map(Some),
         None => Ok(None),
      }
   }

   /// First row, or `None` when there are no rows
   pub async fn query_row(&self, sql: &str, params: &[Value]) -> Result<Option<Row>> {
      let rows = self
         // SAFETY: with_retry hands out db exclusively for the duration of the call.
         .with_retry(|db| unsafe { statement::query(db, sql, params, Some(1)) })
         .await?;
      Ok(rows.into_iter().next())
   }

   /// Every row
   pub async fn query_rows(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
      self
         // SAFETY: with_retry hands out db exclusively for the duration of the call.
         .with_retry(|db| unsafe { statement::query(db, sql, params, None) })
         .await
   }

   /// Checkpoints the write-ahead log.
   ///
   /// Readers holding an old snapshot make `Restart` and `Truncate` report a
   /// busy condition, which goes through the installed [`BusyHandler`].
   pub async fn checkpoint(&self, mode: CheckpointMode) -> Result<CheckpointResult> {
      self
         // SAFETY: with_retry hands out db exclusively for the duration of the call.
         .with_retry(|db| unsafe { statement::checkpoint(db, mode) })
         .await
   }

   /// Closes the native handle. Calling it again is a no-op.
   pub async fn close(&self) -> Result<()> {
      let conn = self.handle.lock().await.take();
      if let Some(conn) = conn {
         conn.close().await?;
         debug!(id = ?self.id, "Closed connection");
      }
      Ok(())
   }

   /// Drives `attempt` until it succeeds or fails with a non-retryable error.
   ///
   /// The execution lock is held throughout; sqlx's handle lock only for the
   /// duration of each attempt, never across a sleep.
   async fn with_retry<T, F>(&self, mut attempt: F) -> Result<T>
   where
      F: FnMut(*mut sqlite3) -> Result<T>,
   {
      let mut guard = self.handle.lock().await;
      let conn = guard.as_mut().ok_or(Error::ConnectionClosed)?;

      let lock_policy = self.table_lock_policy();
      let busy_handler = self.busy_handler.lock().clone();
      let mut busy_attempts: u32 = 0;
      let mut busy_since: Option<Instant> = None;

      loop {
         let result = {
            let mut locked = conn.lock_handle().await?;
            attempt(locked.as_raw_handle().as_ptr())
         };

         let err = match result {
            Ok(value) => return Ok(value),
            Err(err) => err,
         };

         let delay = if err.is_locked() {
            lock_policy.retry_interval()
         } else if err.is_retryable_busy() {
            let waited = busy_since.get_or_insert_with(Instant::now).elapsed();
            let delay = busy_handler.retry_delay(busy_attempts, waited);
            busy_attempts += 1;
            delay
         } else {
            None
         };

         match delay {
            Some(delay) => {
               trace!(id = ?self.id, error = %err, ?delay, busy_attempts, "Retrying after contention");
               tokio::time::sleep(delay).await;
            }
            None => return Err(err),
         }
      }
   }
}
