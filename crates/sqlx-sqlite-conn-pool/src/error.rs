//! Error types for sqlx-sqlite-conn-pool

use libsqlite3_sys as ffi;
use std::fmt;
use thiserror::Error;

use crate::value::StorageClass;

/// Errors that may occur when working with sqlx-sqlite-conn-pool
#[derive(Error, Debug)]
pub enum Error {
   /// A native SQLite failure, carrying the engine's result code and message
   #[error(transparent)]
   Sqlite(#[from] SqliteError),

   /// IO error when accessing database files. Standard library IO errors
   /// are converted to this variant.
   #[error("IO error: {0}")]
   Io(#[from] std::io::Error),

   /// Error from the sqlx library that does not carry a native result code
   #[error("Sqlx error: {0}")]
   Sqlx(sqlx::Error),

   /// The connection has been closed and cannot be used
   #[error("Connection has been closed")]
   ConnectionClosed,

   /// The reader pool has been closed and cannot hand out connections
   #[error("Connection pool has been closed")]
   PoolClosed,

   /// Database has been closed and cannot be used
   #[error("Database has been closed")]
   DatabaseClosed,

   /// A column value could not be converted to the requested Rust type
   #[error("Type mismatch: expected {expected}, found {found}")]
   TypeMismatch {
      expected: &'static str,
      found: StorageClass,
   },

   /// An integer column value does not fit in the requested Rust type
   #[error("Integer {value} out of range for {target}")]
   IntegerOutOfRange { value: i64, target: &'static str },

   /// Column index past the end of the row
   #[error("Column index {index} out of range for row with {len} columns")]
   ColumnOutOfRange { index: usize, len: usize },

   /// No column with the given name exists in the row
   #[error("No column named '{0}'")]
   NoSuchColumn(String),

   /// Number of bound parameters does not match the statement
   #[error("Statement expects {expected} parameters, {actual} were supplied")]
   ParameterCount { expected: usize, actual: usize },
}

impl From<sqlx::Error> for Error {
   /// Database errors raised by sqlx (e.g. while opening a handle) are
   /// unwrapped into [`SqliteError`] so callers can match on the native code.
   fn from(err: sqlx::Error) -> Self {
      if let sqlx::Error::Database(db_err) = &err
         && let Some(code) = db_err.code().and_then(|c| c.parse::<i32>().ok())
      {
         return Error::Sqlite(SqliteError::new(code, db_err.message()));
      }
      Error::Sqlx(err)
   }
}

impl Error {
   /// The native SQLite error, if this is one
   pub fn as_sqlite(&self) -> Option<&SqliteError> {
      match self {
         Error::Sqlite(e) => Some(e),
         _ => None,
      }
   }

   /// Category of the native error, if this is one
   pub fn sqlite_kind(&self) -> Option<SqliteErrorKind> {
      self.as_sqlite().map(SqliteError::kind)
   }

   pub(crate) fn is_busy(&self) -> bool {
      self.sqlite_kind() == Some(SqliteErrorKind::Busy)
   }

   /// Busy conditions that can clear by waiting. A stale WAL snapshot
   /// (`SQLITE_BUSY_SNAPSHOT`) fails the same way until the transaction ends.
   pub(crate) fn is_retryable_busy(&self) -> bool {
      self.is_busy() && self.as_sqlite().map(|e| e.code) != Some(ffi::SQLITE_BUSY_SNAPSHOT)
   }

   pub(crate) fn is_locked(&self) -> bool {
      self.sqlite_kind() == Some(SqliteErrorKind::Locked)
   }
}

/// Broad category of a native result code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqliteErrorKind {
   /// The storage location could not be opened (`SQLITE_CANTOPEN`)
   CannotOpen,
   /// The whole database file is locked by another connection (`SQLITE_BUSY`)
   Busy,
   /// A table is locked by another shared-cache connection (`SQLITE_LOCKED`)
   Locked,
   /// A write was attempted through a read-only handle (`SQLITE_READONLY`)
   ReadOnly,
   /// A constraint such as UNIQUE or NOT NULL was violated (`SQLITE_CONSTRAINT`)
   Constraint,
   /// Anything else: syntax errors, misuse, I/O...
   Other,
}

/// A native SQLite failure
///
/// `code` keeps the extended result code reported by the engine (e.g.
/// `SQLITE_LOCKED_SHAREDCACHE`); [`primary_code`](Self::primary_code) strips it
/// down to the primary code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqliteError {
   pub code: i32,
   pub message: String,
}

impl SqliteError {
   pub fn new(code: i32, message: impl Into<String>) -> Self {
      Self {
         code,
         message: message.into(),
      }
   }

   pub fn primary_code(&self) -> i32 {
      self.code & 0xff
   }

   pub fn kind(&self) -> SqliteErrorKind {
      match self.primary_code() {
         ffi::SQLITE_CANTOPEN => SqliteErrorKind::CannotOpen,
         ffi::SQLITE_BUSY => SqliteErrorKind::Busy,
         ffi::SQLITE_LOCKED => SqliteErrorKind::Locked,
         ffi::SQLITE_READONLY => SqliteErrorKind::ReadOnly,
         ffi::SQLITE_CONSTRAINT => SqliteErrorKind::Constraint,
         _ => SqliteErrorKind::Other,
      }
   }
}

impl fmt::Display for SqliteError {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      write!(f, "SQLite error {}: {}", self.code, self.message)
   }
}

impl std::error::Error for SqliteError {}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn test_kind_uses_primary_code() {
      // SQLITE_LOCKED_SHAREDCACHE = SQLITE_LOCKED | (1 << 8)
      let err = SqliteError::new(ffi::SQLITE_LOCKED_SHAREDCACHE, "database table is locked");
      assert_eq!(err.primary_code(), ffi::SQLITE_LOCKED);
      assert_eq!(err.kind(), SqliteErrorKind::Locked);

      let err = SqliteError::new(ffi::SQLITE_CONSTRAINT_UNIQUE, "UNIQUE constraint failed");
      assert_eq!(err.kind(), SqliteErrorKind::Constraint);
   }

   #[test]
   fn test_kind_categories() {
      let cases = [
         (ffi::SQLITE_CANTOPEN, SqliteErrorKind::CannotOpen),
         (ffi::SQLITE_BUSY, SqliteErrorKind::Busy),
         (ffi::SQLITE_READONLY, SqliteErrorKind::ReadOnly),
         (ffi::SQLITE_ERROR, SqliteErrorKind::Other),
      ];

      for (code, kind) in cases {
         assert_eq!(SqliteError::new(code, "").kind(), kind, "code {code}");
      }
   }

   #[test]
   fn test_busy_and_locked_helpers() {
      let busy = Error::Sqlite(SqliteError::new(ffi::SQLITE_BUSY, "database is locked"));
      assert!(busy.is_busy());
      assert!(!busy.is_locked());

      let locked = Error::Sqlite(SqliteError::new(ffi::SQLITE_LOCKED, "database table is locked"));
      assert!(locked.is_locked());
      assert!(!locked.is_busy());

      assert!(!Error::ConnectionClosed.is_busy());
      assert_eq!(Error::ConnectionClosed.sqlite_kind(), None);
   }

   #[test]
   fn test_stale_snapshot_is_not_retryable() {
      let busy = Error::Sqlite(SqliteError::new(ffi::SQLITE_BUSY, "database is locked"));
      assert!(busy.is_retryable_busy());

      let recovery = Error::Sqlite(SqliteError::new(ffi::SQLITE_BUSY_RECOVERY, "database is locked"));
      assert!(recovery.is_retryable_busy());

      let snapshot = Error::Sqlite(SqliteError::new(ffi::SQLITE_BUSY_SNAPSHOT, "database is locked"));
      assert!(snapshot.is_busy());
      assert!(!snapshot.is_retryable_busy());
      assert_eq!(snapshot.sqlite_kind(), Some(SqliteErrorKind::Busy));
   }

   #[test]
   fn test_display_includes_code_and_message() {
      let err = Error::Sqlite(SqliteError::new(ffi::SQLITE_BUSY, "database is locked"));
      assert_eq!(err.to_string(), "SQLite error 5: database is locked");
   }

   #[test]
   fn test_non_database_sqlx_error_is_kept() {
      let err = Error::from(sqlx::Error::RowNotFound);
      assert!(matches!(err, Error::Sqlx(sqlx::Error::RowNotFound)));
   }
}
