//! WriteGuard for exclusive use of the writer connection

use std::ops::Deref;
use tokio::sync::MutexGuard;

use crate::connection::Connection;

/// RAII guard for exclusive access to a database's single writer connection
///
/// Only one `WriteGuard` can exist at a time; other writers wait in
/// [`Database::acquire_writer`](crate::Database::acquire_writer) until it is
/// dropped. Holding the guard across several statements makes them one
/// uninterrupted unit of work, which is what an explicit transaction needs.
///
/// The guard derefs to [`Connection`].
///
/// # Example
///
/// ```no_run
/// use sqlx_sqlite_conn_pool::{Database, StorageLocation, Value};
///
/// # async fn example() -> sqlx_sqlite_conn_pool::Result<()> {
/// let db = Database::open(StorageLocation::on_disk("test.db"), None).await?;
///
/// let writer = db.acquire_writer().await?;
/// writer.execute("BEGIN IMMEDIATE").await?;
/// writer.run("INSERT INTO users (name) VALUES (?)", &[Value::from("Alice")]).await?;
/// writer.execute("COMMIT").await?;
/// // Writer is released when dropped
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct WriteGuard<'a> {
   conn: MutexGuard<'a, Connection>,
}

impl<'a> WriteGuard<'a> {
   pub(crate) fn new(conn: MutexGuard<'a, Connection>) -> Self {
      Self { conn }
   }
}

impl Deref for WriteGuard<'_> {
   type Target = Connection;

   fn deref(&self) -> &Self::Target {
      &self.conn
   }
}
