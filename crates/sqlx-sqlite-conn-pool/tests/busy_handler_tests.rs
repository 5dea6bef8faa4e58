//! A checkpoint contending with an open read transaction reports a busy
//! condition; these tests pin down how each busy handler reacts to it.

use sqlx_sqlite_conn_pool::{
   BusyHandler, CheckpointMode, Connection, Database, DatabaseConfig, OpenOptions,
   PooledConnection, SqliteErrorKind, StorageLocation,
};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tempfile::TempDir;

async fn open_database(dir: &TempDir, handler: Option<BusyHandler>) -> Database {
   let mut builder = Database::builder(StorageLocation::on_disk(dir.path().join("test.db")));
   if let Some(handler) = handler {
      builder = builder.busy_handler(handler);
   }
   let db = builder.open().await.unwrap();

   db.execute_write(|conn| {
      Box::pin(async move {
         conn
            .execute(
               "CREATE TABLE items(id INTEGER PRIMARY KEY, name TEXT);
                INSERT INTO items(name) VALUES ('a'), ('b');",
            )
            .await
      })
   })
   .await
   .unwrap();

   db
}

/// Checks out a reader holding a read transaction on the current WAL snapshot
async fn hold_read_transaction(db: &Database) -> PooledConnection {
   let reader = db.pool().unwrap().acquire().await.unwrap();
   reader
      .execute("BEGIN; SELECT count(*) FROM items;")
      .await
      .unwrap();
   reader
}

fn commit_after(reader: PooledConnection, delay: Duration) -> tokio::task::JoinHandle<()> {
   tokio::spawn(async move {
      tokio::time::sleep(delay).await;
      reader.execute("COMMIT").await.unwrap();
   })
}

#[tokio::test]
async fn test_default_behavior_surfaces_busy() {
   let dir = TempDir::new().unwrap();
   let db = open_database(&dir, None).await;
   let reader = hold_read_transaction(&db).await;

   let err = db.checkpoint(CheckpointMode::Truncate).await.unwrap_err();
   assert_eq!(err.sqlite_kind(), Some(SqliteErrorKind::Busy));
   assert_eq!(err.as_sqlite().unwrap().message, "database is locked");

   reader.execute("COMMIT").await.unwrap();
   drop(reader);

   db.checkpoint(CheckpointMode::Truncate).await.unwrap();
   db.remove().await.unwrap();
}

#[tokio::test]
async fn test_timeout_waits_for_reader() {
   let dir = TempDir::new().unwrap();
   let db = open_database(&dir, Some(BusyHandler::Timeout(Duration::from_secs(5)))).await;
   let reader = hold_read_transaction(&db).await;

   let start = Instant::now();
   let release = commit_after(reader, Duration::from_millis(200));

   db.checkpoint(CheckpointMode::Truncate).await.unwrap();
   assert!(
      start.elapsed() >= Duration::from_millis(150),
      "Checkpoint finished after {:?}, before the reader committed",
      start.elapsed()
   );

   release.await.unwrap();
   db.remove().await.unwrap();
}

#[tokio::test]
async fn test_timeout_budget_is_bounded() {
   let dir = TempDir::new().unwrap();
   let config = DatabaseConfig {
      busy_timeout_ms: Some(100),
      ..Default::default()
   };
   let db = Database::open(StorageLocation::on_disk(dir.path().join("test.db")), Some(config))
      .await
      .unwrap();
   db.execute_write(|conn| {
      Box::pin(async move { conn.execute("CREATE TABLE items(id INTEGER); INSERT INTO items VALUES (1);").await })
   })
   .await
   .unwrap();

   let reader = hold_read_transaction(&db).await;

   let start = Instant::now();
   let err = db.checkpoint(CheckpointMode::Truncate).await.unwrap_err();
   let elapsed = start.elapsed();

   assert_eq!(err.sqlite_kind(), Some(SqliteErrorKind::Busy));
   assert!(elapsed >= Duration::from_millis(100), "gave up after {elapsed:?}");
   assert!(elapsed < Duration::from_secs(2), "gave up after {elapsed:?}");

   reader.execute("COMMIT").await.unwrap();
   drop(reader);
   db.remove().await.unwrap();
}

#[tokio::test]
async fn test_custom_handler_is_consulted_until_success() {
   let dir = TempDir::new().unwrap();
   let seen = Arc::new(Mutex::new(Vec::new()));

   let recorder = Arc::clone(&seen);
   let handler = BusyHandler::custom(move |attempts| {
      recorder.lock().unwrap().push(attempts);
      true
   });

   let db = open_database(&dir, Some(handler)).await;
   let reader = hold_read_transaction(&db).await;
   let release = commit_after(reader, Duration::from_millis(100));

   db.checkpoint(CheckpointMode::Truncate).await.unwrap();
   release.await.unwrap();

   let seen = seen.lock().unwrap().clone();
   assert!(!seen.is_empty(), "custom busy handler was never called");
   assert_eq!(seen[0], 0);
   assert!(
      seen.windows(2).all(|w| w[1] == w[0] + 1),
      "attempt counts should increase by one: {seen:?}"
   );

   db.remove().await.unwrap();
}

#[tokio::test]
async fn test_custom_handler_can_give_up() {
   let dir = TempDir::new().unwrap();
   let db = open_database(&dir, Some(BusyHandler::custom(|attempts| attempts < 3))).await;
   let reader = hold_read_transaction(&db).await;

   let err = db.checkpoint(CheckpointMode::Truncate).await.unwrap_err();
   assert_eq!(err.sqlite_kind(), Some(SqliteErrorKind::Busy));

   reader.execute("COMMIT").await.unwrap();
   drop(reader);
   db.remove().await.unwrap();
}

#[tokio::test]
async fn test_handler_can_be_replaced() {
   let dir = TempDir::new().unwrap();
   let db = open_database(&dir, None).await;
   let reader = hold_read_transaction(&db).await;

   assert!(db.checkpoint(CheckpointMode::Truncate).await.is_err());

   db.set_busy_handler(BusyHandler::Timeout(Duration::from_secs(5)))
      .await
      .unwrap();
   let release = commit_after(reader, Duration::from_millis(50));

   db.checkpoint(CheckpointMode::Truncate).await.unwrap();
   release.await.unwrap();
   db.remove().await.unwrap();
}

#[tokio::test]
async fn test_stale_snapshot_is_not_retried() {
   const SQLITE_BUSY_SNAPSHOT: i32 = 517;

   let dir = TempDir::new().unwrap();
   let calls = Arc::new(AtomicU32::new(0));

   let counter = Arc::clone(&calls);
   let handler = BusyHandler::custom(move |attempts| {
      counter.fetch_add(1, Ordering::SeqCst);
      attempts < 200
   });
   let db = open_database(&dir, Some(handler)).await;

   let writer = db.acquire_writer().await.unwrap();
   writer
      .execute("BEGIN; SELECT count(*) FROM items;")
      .await
      .unwrap();

   // Another connection commits, leaving the writer's snapshot behind
   let other = Connection::open(db.location(), OpenOptions::new())
      .await
      .unwrap();
   other
      .run("INSERT INTO items(name) VALUES ('c')", &[])
      .await
      .unwrap();

   let start = Instant::now();
   let err = writer
      .run("INSERT INTO items(name) VALUES ('d')", &[])
      .await
      .unwrap_err();
   let elapsed = start.elapsed();

   assert_eq!(err.sqlite_kind(), Some(SqliteErrorKind::Busy));
   assert_eq!(err.as_sqlite().unwrap().code, SQLITE_BUSY_SNAPSHOT);
   assert_eq!(calls.load(Ordering::SeqCst), 0, "busy handler was consulted");
   assert!(elapsed < Duration::from_millis(250), "gave up after {elapsed:?}");

   writer.execute("ROLLBACK").await.unwrap();
   drop(writer);
   other.close().await.unwrap();
   db.remove().await.unwrap();
}
