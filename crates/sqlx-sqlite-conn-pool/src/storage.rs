//! Where a database lives and how a handle to it is opened

use sqlx::sqlite::SqliteConnectOptions;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::Result;
use crate::lock_policy::TableLockPolicy;

/// Storage location of a database
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageLocation {
   /// A file on disk, created on first read-write open if missing
   OnDisk(PathBuf),
   /// A private in-memory database, distinct for every connection
   InMemory,
   /// SQLite's anonymous temporary database, deleted when the handle closes
   Temporary,
}

impl StorageLocation {
   pub fn on_disk(path: impl AsRef<Path>) -> Self {
      StorageLocation::OnDisk(path.as_ref().to_path_buf())
   }

   /// Filesystem path, for on-disk locations only
   pub fn path(&self) -> Option<&Path> {
      match self {
         StorageLocation::OnDisk(path) => Some(path),
         _ => None,
      }
   }

   fn filename(&self) -> &Path {
      match self {
         StorageLocation::OnDisk(path) => path,
         StorageLocation::InMemory => Path::new(":memory:"),
         StorageLocation::Temporary => Path::new(""),
      }
   }

   pub(crate) fn validate(&self) -> Result<()> {
      if let StorageLocation::OnDisk(path) = self
         && path.as_os_str().is_empty()
      {
         return Err(crate::error::Error::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "Database path cannot be empty",
         )));
      }
      Ok(())
   }
}

/// Flags used when opening a [`Connection`](crate::Connection)
///
/// # Examples
///
/// ```
/// use sqlx_sqlite_conn_pool::{OpenOptions, TableLockPolicy};
/// use std::time::Duration;
///
/// let options = OpenOptions::new()
///     .read_only(true)
///     .shared_cache(true)
///     .table_lock_policy(TableLockPolicy::Poll(Duration::from_millis(10)));
///
/// assert!(options.is_read_only());
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OpenOptions {
   read_only: bool,
   shared_cache: bool,
   table_lock_policy: TableLockPolicy,
}

impl OpenOptions {
   pub fn new() -> Self {
      Self::default()
   }

   pub fn read_only(mut self, read_only: bool) -> Self {
      self.read_only = read_only;
      self
   }

   pub fn shared_cache(mut self, shared_cache: bool) -> Self {
      self.shared_cache = shared_cache;
      self
   }

   pub fn table_lock_policy(mut self, policy: TableLockPolicy) -> Self {
      self.table_lock_policy = policy;
      self
   }

   pub fn is_read_only(&self) -> bool {
      self.read_only
   }

   pub fn is_shared_cache(&self) -> bool {
      self.shared_cache
   }

   pub fn lock_policy(&self) -> TableLockPolicy {
      self.table_lock_policy
   }

   /// sqlx connect options for `location` with these flags
   ///
   /// The engine's own busy timeout is disabled: busy conditions are handled by
   /// the connection's [`BusyHandler`](crate::BusyHandler) instead.
   pub(crate) fn connect_options(&self, location: &StorageLocation) -> SqliteConnectOptions {
      SqliteConnectOptions::new()
         .filename(location.filename())
         .read_only(self.read_only)
         .create_if_missing(!self.read_only)
         .shared_cache(self.shared_cache)
         .busy_timeout(Duration::ZERO)
   }
}
