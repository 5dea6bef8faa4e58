//! SQLite database with a pool of readers and a single writer

use futures::future::BoxFuture;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, error};

use crate::Result;
use crate::busy_handler::BusyHandler;
use crate::config::DatabaseConfig;
use crate::connection::Connection;
use crate::error::Error;
use crate::lock_policy::TableLockPolicy;
use crate::pool::{ConnectionPool, ConnectionPreparation};
use crate::statement::{CheckpointMode, CheckpointResult};
use crate::storage::{OpenOptions, StorageLocation};
use crate::write_guard::WriteGuard;

/// SQLite database with pooled read-only connections for concurrent reads and
/// one read-write connection for serialized writes.
///
/// The writer is owned by the database and is never pooled; it is reached
/// through [`acquire_writer`](Self::acquire_writer) or
/// [`execute_write`](Self::execute_write), both of which give exclusive use of
/// it. Reads go through the [`ConnectionPool`] via
/// [`execute_read`](Self::execute_read).
///
/// On-disk databases are switched to WAL mode when opened, so readers and the
/// writer do not block each other. In-memory and temporary locations are
/// private to each connection: readers do not see what the writer stores there.
///
/// # Example
///
/// ```no_run
/// use sqlx_sqlite_conn_pool::{Database, StorageLocation, Value};
///
/// # async fn example() -> sqlx_sqlite_conn_pool::Result<()> {
/// let db = Database::open(StorageLocation::on_disk("test.db"), None).await?;
///
/// db.execute_write(|conn| {
///    Box::pin(async move {
///       conn.execute("CREATE TABLE IF NOT EXISTS users(name TEXT)").await?;
///       conn.run("INSERT INTO users(name) VALUES (?)", &[Value::from("Alice")]).await?;
///       Ok(())
///    })
/// })
/// .await?;
///
/// let count = db
///    .execute_read(|conn| Box::pin(async move { conn.query::<i64>("SELECT count(*) FROM users", &[]).await }))
///    .await?;
/// assert_eq!(count, Some(1));
///
/// db.close().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct Database {
   /// The single read-write connection
   writer: tokio::sync::Mutex<Connection>,

   /// Read-only connections for concurrent reads
   pool: ConnectionPool,

   location: StorageLocation,

   /// Marks database as closed to prevent further operations
   closed: AtomicBool,
}

impl Database {
   /// Open a database with an optional configuration
   ///
   /// The file is created if it doesn't exist. Pass `None` to use the
   /// [`DatabaseConfig`] defaults; use [`builder`](Self::builder) to also
   /// install a custom busy handler or preparation steps.
   ///
   /// # Examples
   ///
   /// ```no_run
   /// use sqlx_sqlite_conn_pool::{Database, DatabaseConfig, StorageLocation};
   ///
   /// # async fn example() -> sqlx_sqlite_conn_pool::Result<()> {
   /// let config = DatabaseConfig {
   ///    busy_timeout_ms: Some(5000),
   ///    ..Default::default()
   /// };
   /// let db = Database::open(StorageLocation::on_disk("test.db"), Some(config)).await?;
   /// # Ok(())
   /// # }
   /// ```
   pub async fn open(location: StorageLocation, config: Option<DatabaseConfig>) -> Result<Self> {
      Self::builder(location)
         .config(config.unwrap_or_default())
         .open()
         .await
   }

   pub fn builder(location: StorageLocation) -> DatabaseBuilder {
      DatabaseBuilder::new(location)
   }

   pub fn location(&self) -> &StorageLocation {
      &self.location
   }

   /// The pool of readers
   pub fn pool(&self) -> Result<&ConnectionPool> {
      self.ensure_open()?;
      Ok(&self.pool)
   }

   /// Acquire exclusive access to the writer connection
   ///
   /// Waits while another `WriteGuard` is alive.
   pub async fn acquire_writer(&self) -> Result<WriteGuard<'_>> {
      self.ensure_open()?;
      let conn = self.writer.lock().await;

      // Closed while waiting for the writer
      self.ensure_open()?;
      Ok(WriteGuard::new(conn))
   }

   /// Runs `work` with exclusive use of the writer
   pub async fn execute_write<T, F>(&self, work: F) -> Result<T>
   where
      F: for<'c> FnOnce(&'c Connection) -> BoxFuture<'c, Result<T>>,
   {
      let writer = self.acquire_writer().await?;
      work(&writer).await
   }

   /// Runs `work` on a pooled reader, handed back to the pool on every exit path
   pub async fn execute_read<T, F>(&self, work: F) -> Result<T>
   where
      F: for<'c> FnOnce(&'c Connection) -> BoxFuture<'c, Result<T>>,
   {
      self.ensure_open()?;
      self.pool.execute(work).await.map_err(|e| match e {
         Error::PoolClosed => Error::DatabaseClosed,
         e => e,
      })
   }

   /// Replaces the writer's busy handler. Readers keep the one they were
   /// opened with.
   pub async fn set_busy_handler(&self, handler: BusyHandler) -> Result<()> {
      self.acquire_writer().await?.set_busy_handler(handler).await
   }

   /// Replaces the writer's table lock policy. Readers keep the one they were
   /// opened with.
   pub async fn set_table_lock_policy(&self, policy: TableLockPolicy) -> Result<()> {
      self.acquire_writer().await?.set_table_lock_policy(policy);
      Ok(())
   }

   /// Checkpoint the write-ahead log through the writer
   pub async fn checkpoint(&self, mode: CheckpointMode) -> Result<CheckpointResult> {
      self.acquire_writer().await?.checkpoint(mode).await
   }

   /// Close the database and clean up resources
   ///
   /// Closes the reader pool, folds the write-ahead log back into the database
   /// file and closes the writer. After calling close, any operation on this
   /// database returns [`Error::DatabaseClosed`]. Closing twice is a no-op.
   pub async fn close(&self) -> Result<()> {
      if self.closed.swap(true, Ordering::SeqCst) {
         return Ok(());
      }

      // Readers still checked out are closed when they come back
      self.pool.close().await;

      let writer = self.writer.lock().await;

      // Checkpoint WAL before closing the writer to flush changes and truncate the WAL file
      if self.location.path().is_some()
         && let Err(e) = writer.checkpoint(CheckpointMode::Truncate).await
      {
         error!("Failed to checkpoint database on close: {}", e);
      }

      writer.close().await?;
      debug!(location = ?self.location, "Closed database");

      Ok(())
   }

   /// Close the database and delete all database files
   ///
   /// This closes all connections and then deletes the database file, WAL file,
   /// and SHM file from disk. Use with caution!
   ///
   /// For in-memory and temporary locations this is the same as
   /// [`close`](Self::close).
   pub async fn remove(&self) -> Result<()> {
      self.close().await?;

      let Some(path) = self.location.path() else {
         return Ok(());
      };

      // Remove main database file - propagate errors (file should exist)
      std::fs::remove_file(path)?;

      // Remove WAL and SHM files - ignore "not found" but propagate other errors
      for suffix in ["-wal", "-shm"] {
         if let Err(e) = std::fs::remove_file(companion_path(path, suffix))
            && e.kind() != std::io::ErrorKind::NotFound
         {
            return Err(Error::Io(e));
         }
      }

      Ok(())
   }

   fn ensure_open(&self) -> Result<()> {
      if self.closed.load(Ordering::SeqCst) {
         return Err(Error::DatabaseClosed);
      }
      Ok(())
   }
}

/// `<path><suffix>`, how SQLite names the WAL and shared-memory files
fn companion_path(path: &Path, suffix: &str) -> PathBuf {
   let mut name = OsString::from(path.as_os_str());
   name.push(suffix);
   PathBuf::from(name)
}

/// Builder for a [`Database`] with settings [`DatabaseConfig`] cannot hold
///
/// # Example
///
/// ```no_run
/// use sqlx_sqlite_conn_pool::{BusyHandler, Database, StorageLocation};
///
/// # async fn example() -> sqlx_sqlite_conn_pool::Result<()> {
/// let db = Database::builder(StorageLocation::on_disk("test.db"))
///    .busy_handler(BusyHandler::custom(|attempts| attempts < 50))
///    .reader_preparation(|conn| Box::pin(async move { conn.execute("PRAGMA cache_size = -4000").await }))
///    .open()
///    .await?;
/// # Ok(())
/// # }
/// ```
pub struct DatabaseBuilder {
   location: StorageLocation,
   config: DatabaseConfig,
   busy_handler: Option<BusyHandler>,
   writer_preparation: Option<ConnectionPreparation>,
   reader_preparation: Option<ConnectionPreparation>,
}

impl DatabaseBuilder {
   fn new(location: StorageLocation) -> Self {
      Self {
         location,
         config: DatabaseConfig::default(),
         busy_handler: None,
         writer_preparation: None,
         reader_preparation: None,
      }
   }

   pub fn config(mut self, config: DatabaseConfig) -> Self {
      self.config = config;
      self
   }

   /// Busy handler for the writer and every reader. Takes precedence over
   /// `busy_timeout_ms` in the config.
   pub fn busy_handler(mut self, handler: BusyHandler) -> Self {
      self.busy_handler = Some(handler);
      self
   }

   /// Setup run once on the writer after it is opened
   pub fn writer_preparation<F>(mut self, preparation: F) -> Self
   where
      F: for<'c> Fn(&'c Connection) -> BoxFuture<'c, Result<()>> + Send + Sync + 'static,
   {
      self.writer_preparation = Some(Arc::new(preparation));
      self
   }

   /// Setup run once on every reader the pool opens
   pub fn reader_preparation<F>(mut self, preparation: F) -> Self
   where
      F: for<'c> Fn(&'c Connection) -> BoxFuture<'c, Result<()>> + Send + Sync + 'static,
   {
      self.reader_preparation = Some(Arc::new(preparation));
      self
   }

   /// Opens the writer, then prepares the reader pool
   ///
   /// Readers are opened lazily on the first read. The writer is opened first
   /// so a missing database file exists before any read-only open.
   pub async fn open(self) -> Result<Database> {
      let DatabaseBuilder {
         location,
         config,
         busy_handler,
         writer_preparation,
         reader_preparation,
      } = self;

      let busy_handler = busy_handler.unwrap_or_else(|| config.busy_handler());

      let writer_options = OpenOptions::new()
         .shared_cache(config.shared_cache)
         .table_lock_policy(config.table_lock_policy);
      let writer = Connection::open(&location, writer_options).await?;
      writer.set_busy_handler(busy_handler.clone()).await?;

      if location.path().is_some() {
         // https://www.sqlite.org/wal.html#performance_considerations
         writer
            .execute("PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL")
            .await?;
      }

      if let Some(preparation) = &writer_preparation {
         preparation(&writer).await?;
      }

      let pool = ConnectionPool::new(
         location.clone(),
         config
            .pool_options(busy_handler)
            .with_preparation(reader_preparation),
      );

      debug!(?location, ?config, "Opened database");

      Ok(Database {
         writer: tokio::sync::Mutex::new(writer),
         pool,
         location,
         closed: AtomicBool::new(false),
      })
   }
}

impl std::fmt::Debug for DatabaseBuilder {
   fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
      f.debug_struct("DatabaseBuilder")
         .field("location", &self.location)
         .field("config", &self.config)
         .field("busy_handler", &self.busy_handler)
         .field("writer_preparation", &self.writer_preparation.is_some())
         .field("reader_preparation", &self.reader_preparation.is_some())
         .finish()
   }
}

#[cfg(test)]
mod tests {
   use super::*;
   use std::time::{Duration, Instant};
   use tempfile::TempDir;

   async fn open_temp(dir: &TempDir) -> Database {
      Database::open(StorageLocation::on_disk(dir.path().join("test.db")), None)
         .await
         .unwrap()
   }

   #[test]
   fn test_companion_path_appends_suffix() {
      assert_eq!(
         companion_path(Path::new("/tmp/app.sqlite"), "-wal"),
         PathBuf::from("/tmp/app.sqlite-wal")
      );
      assert_eq!(
         companion_path(Path::new("data"), "-shm"),
         PathBuf::from("data-shm")
      );
   }

   #[tokio::test]
   async fn test_database_closed_error() {
      let dir = TempDir::new().unwrap();
      let db = open_temp(&dir).await;

      db.close().await.unwrap();

      assert!(matches!(db.pool(), Err(Error::DatabaseClosed)));
      assert!(matches!(
         db.acquire_writer().await,
         Err(Error::DatabaseClosed)
      ));
      assert!(matches!(
         db.execute_read(|conn| Box::pin(async move { conn.query::<i64>("SELECT 1", &[]).await }))
            .await,
         Err(Error::DatabaseClosed)
      ));
      assert!(matches!(
         db.checkpoint(CheckpointMode::Passive).await,
         Err(Error::DatabaseClosed)
      ));

      // Second close is a no-op
      db.close().await.unwrap();
   }

   #[tokio::test]
   async fn test_wal_mode_initialization() {
      let dir = TempDir::new().unwrap();
      let db = open_temp(&dir).await;

      let writer = db.acquire_writer().await.unwrap();

      let mode: Option<String> = writer.query("PRAGMA journal_mode", &[]).await.unwrap();
      assert_eq!(mode.unwrap().to_lowercase(), "wal");

      let sync: Option<i64> = writer.query("PRAGMA synchronous", &[]).await.unwrap();
      assert_eq!(sync, Some(1), "Sync mode should be NORMAL");

      drop(writer);
      db.remove().await.unwrap();
   }

   #[tokio::test]
   async fn test_wal_checkpoint_on_close() {
      let dir = TempDir::new().unwrap();
      let path = dir.path().join("test.db");
      let db = Database::open(StorageLocation::on_disk(&path), None)
         .await
         .unwrap();

      let writer = db.acquire_writer().await.unwrap();
      writer
         .execute("CREATE TABLE test (id INTEGER, value TEXT); INSERT INTO test VALUES (1, 'test')")
         .await
         .unwrap();
      drop(writer);

      let wal_path = companion_path(&path, "-wal");
      assert!(wal_path.exists(), "WAL file should exist after write");

      db.close().await.unwrap();

      // WAL file should be either 0 bytes or not exist
      if wal_path.exists() {
         let wal_size = std::fs::metadata(&wal_path).unwrap().len();
         assert_eq!(wal_size, 0, "WAL file should be 0 bytes after checkpoint");
      }
   }

   #[tokio::test]
   async fn test_remove() {
      let dir = TempDir::new().unwrap();
      let path = dir.path().join("test.db");
      let db = Database::open(StorageLocation::on_disk(&path), None)
         .await
         .unwrap();

      db.execute_write(|conn| Box::pin(async move { conn.execute("CREATE TABLE test (id INTEGER)").await }))
         .await
         .unwrap();

      assert!(path.exists(), "Database file should exist");

      db.remove().await.unwrap();

      assert!(!path.exists(), "Database file should be removed");
      assert!(!companion_path(&path, "-wal").exists(), "WAL file should be removed");
      assert!(!companion_path(&path, "-shm").exists(), "SHM file should be removed");
   }

   #[tokio::test]
   async fn test_write_serialization() {
      let dir = TempDir::new().unwrap();
      let db = Arc::new(open_temp(&dir).await);

      db.execute_write(|conn| {
         Box::pin(async move {
            conn.execute(
               "CREATE TABLE counter (id INTEGER PRIMARY KEY, value INTEGER);
                INSERT INTO counter (id, value) VALUES (1, 0);",
            )
            .await
         })
      })
      .await
      .unwrap();

      // 3 concurrent writers each hold the writer for 10ms
      let start = Instant::now();
      let mut handles = vec![];

      for _ in 0..3 {
         let db = Arc::clone(&db);
         handles.push(tokio::spawn(async move {
            let writer = db.acquire_writer().await.unwrap();
            tokio::time::sleep(Duration::from_millis(10)).await;
            writer
               .execute("UPDATE counter SET value = value + 1 WHERE id = 1")
               .await
               .unwrap();
         }));
      }

      for handle in handles {
         handle.await.unwrap();
      }

      let value = db
         .execute_read(|conn| {
            Box::pin(async move { conn.query::<i64>("SELECT value FROM counter WHERE id = 1", &[]).await })
         })
         .await
         .unwrap();
      assert_eq!(value, Some(3), "All 3 writes should have been serialized");

      assert!(
         start.elapsed().as_millis() >= 25,
         "Serialized writes took {}ms (expected ≥25ms, would be ~10ms if concurrent)",
         start.elapsed().as_millis()
      );

      db.remove().await.unwrap();
   }
}
