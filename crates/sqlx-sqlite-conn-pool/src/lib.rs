//! # sqlx-sqlite-conn-pool
//!
//! Concurrency-safe access to a single SQLite database shared by many readers
//! and one writer, built on SQLx connections.
//!
//! ## Core Types
//!
//! - **[`Database`]**: One writer connection plus a pool of read-only connections
//! - **[`DatabaseConfig`]** / **[`DatabaseBuilder`]**: Database settings
//! - **[`ConnectionPool`]**: Read-only connections opened on demand and drained when idle
//! - **[`Connection`]**: One native handle with serialized command execution
//! - **[`WriteGuard`]**: RAII guard ensuring exclusive use of the writer
//! - **[`TableLockPolicy`]**: Retry behavior on shared-cache table lock conflicts
//! - **[`BusyHandler`]**: Retry behavior on whole-database busy conditions
//! - **[`Error`]**: Error type for database operations
//!
//! ## Architecture
//!
//! - **Serialized connections**: every command holds its connection's execution
//!   lock from first attempt to final result, retries included
//! - **Lock-aware retries**: `SQLITE_LOCKED` is routed to the [`TableLockPolicy`],
//!   `SQLITE_BUSY` to the [`BusyHandler`]; everything else fails immediately
//! - **Concurrent reads**: readers are opened lazily, recycled most recently
//!   released first, and drained down to one after an idle delay
//! - **Exclusive writes**: the single writer is owned by the [`Database`] and
//!   never pooled
//! - **WAL mode**: enabled when an on-disk database is opened
//!
//! ## Usage
//!
//! ```no_run
//! use sqlx_sqlite_conn_pool::{Database, DatabaseConfig, StorageLocation, TableLockPolicy, Value};
//!
//! #[tokio::main]
//! async fn main() -> sqlx_sqlite_conn_pool::Result<()> {
//!     let config = DatabaseConfig {
//!         busy_timeout_ms: Some(2000),
//!         table_lock_policy: TableLockPolicy::poll_millis(10),
//!         ..Default::default()
//!     };
//!     let db = Database::open(StorageLocation::on_disk("example.db"), Some(config)).await?;
//!
//!     // Exclusive writes
//!     let writer = db.acquire_writer().await?;
//!     writer.execute("CREATE TABLE IF NOT EXISTS users(name TEXT)").await?;
//!     writer.run("INSERT INTO users(name) VALUES (?)", &[Value::from("Alice")]).await?;
//!     drop(writer);
//!
//!     // Concurrent reads on pooled connections
//!     let rows = db
//!         .execute_read(|conn| Box::pin(async move { conn.query_rows("SELECT name FROM users", &[]).await }))
//!         .await?;
//!     for row in rows {
//!         let name: String = row.get_named("name")?;
//!         println!("{name}");
//!     }
//!
//!     db.close().await?;
//!     Ok(())
//! }
//! ```
//!
mod busy_handler;
mod config;
mod connection;
mod database;
mod error;
mod lock_policy;
mod pool;
mod statement;
mod storage;
mod value;
mod write_guard;

// Re-export public types
pub use busy_handler::{BusyCallback, BusyHandler};
pub use config::DatabaseConfig;
pub use connection::{Connection, ConnectionId};
pub use database::{Database, DatabaseBuilder};
pub use error::{Error, SqliteError, SqliteErrorKind};
pub use lock_policy::TableLockPolicy;
pub use pool::{ConnectionPool, ConnectionPreparation, DEFAULT_IDLE_DRAIN_DELAY, PoolOptions, PooledConnection};
pub use statement::{CheckpointMode, CheckpointResult, ExecuteResult};
pub use storage::{OpenOptions, StorageLocation};
pub use value::{FromValue, Row, StorageClass, Value};
pub use write_guard::WriteGuard;

/// A type alias for Results with our custom Error type
pub type Result<T> = std::result::Result<T, Error>;
