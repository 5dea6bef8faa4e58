//! Native statement execution against a raw `sqlite3` handle.
//!
//! Every function here performs exactly one attempt: compile, bind, step and
//! finalize. Lock and busy retries live one level up, in
//! [`Connection`](crate::Connection), which re-runs the attempt from scratch.
//!
//! # Safety
//!
//! All functions require `db` to be a valid, open handle that no other thread
//! uses for the duration of the call. The connection guarantees this by holding
//! both its execution serializer and sqlx's handle lock.

use std::ffi::{CStr, c_char, c_int};
use std::ptr;
use std::sync::Arc;

use libsqlite3_sys::{self as ffi, sqlite3, sqlite3_stmt};

use crate::Result;
use crate::error::{Error, SqliteError};
use crate::value::{Row, Value};

/// Outcome of a single data-changing statement
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecuteResult {
   pub rows_affected: u64,
   pub last_insert_rowid: i64,
}

/// Frame counts reported by a WAL checkpoint
///
/// Both are `-1` when the database is not in WAL mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckpointResult {
   pub log_frames: i32,
   pub checkpointed_frames: i32,
}

/// WAL checkpoint mode, see `sqlite3_wal_checkpoint_v2`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointMode {
   /// Checkpoint as many frames as possible without waiting on anyone
   Passive,
   /// Wait for writers, then checkpoint every frame
   Full,
   /// Like `Full`, then wait for readers so the log restarts from the beginning
   Restart,
   /// Like `Restart`, then truncate the log file to zero bytes
   Truncate,
}

impl CheckpointMode {
   fn as_raw(self) -> c_int {
      match self {
         CheckpointMode::Passive => ffi::SQLITE_CHECKPOINT_PASSIVE,
         CheckpointMode::Full => ffi::SQLITE_CHECKPOINT_FULL,
         CheckpointMode::Restart => ffi::SQLITE_CHECKPOINT_RESTART,
         CheckpointMode::Truncate => ffi::SQLITE_CHECKPOINT_TRUNCATE,
      }
   }
}

/// A failed batch: the error plus the byte offset, within the batch, of the
/// statement that failed. Statements before the offset completed.
pub(crate) struct BatchFailure {
   pub error: Error,
   pub resume_at: usize,
}

/// Compiled statement, finalized on drop
struct Statement {
   raw: *mut sqlite3_stmt,
}

impl Drop for Statement {
   fn drop(&mut self) {
      // SAFETY: raw came from a successful sqlite3_prepare_v2 and is finalized once.
      unsafe {
         ffi::sqlite3_finalize(self.raw);
      }
   }
}

/// Current error on the handle, reported with `code`
unsafe fn last_error(db: *mut sqlite3, code: c_int) -> Error {
   // SAFETY: sqlite3_errmsg never returns null for a valid handle; the string
   // is owned by SQLite and copied before the next call on this handle.
   let message = unsafe {
      let msg = ffi::sqlite3_errmsg(db);
      if msg.is_null() {
         String::new()
      } else {
         CStr::from_ptr(msg).to_string_lossy().into_owned()
      }
   };
   // The extended code tells a stale WAL snapshot apart from plain busy
   let extended = unsafe { ffi::sqlite3_extended_errcode(db) };
   let code = if extended & 0xff == code & 0xff { extended } else { code };
   Error::Sqlite(SqliteError::new(code, message))
}

/// Byte length of a text or blob argument as SQLite takes it
fn byte_len(len: usize) -> Result<c_int> {
   c_int::try_from(len)
      .map_err(|_| Error::Sqlite(SqliteError::new(ffi::SQLITE_TOOBIG, "string or blob too big")))
}

/// Compiles the first statement in `sql`.
///
/// Returns `None` for input that holds no statement (whitespace or comments
/// only) together with the number of bytes consumed.
unsafe fn prepare(db: *mut sqlite3, sql: &str) -> Result<(Option<Statement>, usize)> {
   let mut raw = ptr::null_mut();
   let mut tail: *const c_char = ptr::null();
   let start = sql.as_ptr() as *const c_char;

   let len = byte_len(sql.len())?;

   // SAFETY: start/len describe a valid UTF-8 buffer that outlives the call.
   let rc = unsafe { ffi::sqlite3_prepare_v2(db, start, len, &mut raw, &mut tail) };
   if rc != ffi::SQLITE_OK {
      return Err(unsafe { last_error(db, rc) });
   }

   let consumed = if tail.is_null() {
      sql.len()
   } else {
      tail as usize - start as usize
   };

   let statement = (!raw.is_null()).then_some(Statement { raw });
   Ok((statement, consumed))
}

unsafe fn bind(db: *mut sqlite3, stmt: &Statement, params: &[Value]) -> Result<()> {
   let expected = unsafe { ffi::sqlite3_bind_parameter_count(stmt.raw) } as usize;
   if expected != params.len() {
      return Err(Error::ParameterCount {
         expected,
         actual: params.len(),
      });
   }

   for (index, value) in (1..).zip(params) {
      let len = match value {
         Value::Text(v) => byte_len(v.len())?,
         Value::Blob(v) => byte_len(v.len())?,
         _ => 0,
      };
      // SAFETY: stmt.raw is a live statement; text and blob contents are copied
      // by SQLite (SQLITE_TRANSIENT) before the call returns.
      let rc = unsafe {
         match value {
            Value::Null => ffi::sqlite3_bind_null(stmt.raw, index),
            Value::Integer(v) => ffi::sqlite3_bind_int64(stmt.raw, index, *v),
            Value::Real(v) => ffi::sqlite3_bind_double(stmt.raw, index, *v),
            Value::Text(v) => ffi::sqlite3_bind_text(
               stmt.raw,
               index,
               v.as_ptr() as *const c_char,
               len,
               ffi::SQLITE_TRANSIENT(),
            ),
            Value::Blob(v) => ffi::sqlite3_bind_blob(
               stmt.raw,
               index,
               v.as_ptr().cast(),
               len,
               ffi::SQLITE_TRANSIENT(),
            ),
         }
      };

      if rc != ffi::SQLITE_OK {
         return Err(unsafe { last_error(db, rc) });
      }
   }

   Ok(())
}

unsafe fn column_names(stmt: &Statement) -> Arc<[String]> {
   let count = unsafe { ffi::sqlite3_column_count(stmt.raw) };
   (0..count)
      .map(|i| {
         // SAFETY: i is within the column count of a live statement.
         let name = unsafe { ffi::sqlite3_column_name(stmt.raw, i) };
         if name.is_null() {
            String::new()
         } else {
            unsafe { CStr::from_ptr(name) }.to_string_lossy().into_owned()
         }
      })
      .collect()
}

unsafe fn column_value(stmt: &Statement, i: c_int) -> Value {
   // SAFETY: the statement is positioned on a row (last step returned
   // SQLITE_ROW) and i is within the column count. Pointers returned for text
   // and blob are copied before the next call on the statement.
   unsafe {
      match ffi::sqlite3_column_type(stmt.raw, i) {
         ffi::SQLITE_INTEGER => Value::Integer(ffi::sqlite3_column_int64(stmt.raw, i)),
         ffi::SQLITE_FLOAT => Value::Real(ffi::sqlite3_column_double(stmt.raw, i)),
         ffi::SQLITE_TEXT => {
            let text = ffi::sqlite3_column_text(stmt.raw, i);
            let len = ffi::sqlite3_column_bytes(stmt.raw, i) as usize;
            if text.is_null() || len == 0 {
               Value::Text(String::new())
            } else {
               let bytes = std::slice::from_raw_parts(text, len);
               Value::Text(String::from_utf8_lossy(bytes).into_owned())
            }
         }
         ffi::SQLITE_BLOB => {
            let blob = ffi::sqlite3_column_blob(stmt.raw, i);
            let len = ffi::sqlite3_column_bytes(stmt.raw, i) as usize;
            if blob.is_null() || len == 0 {
               Value::Blob(Vec::new())
            } else {
               Value::Blob(std::slice::from_raw_parts(blob as *const u8, len).to_vec())
            }
         }
         _ => Value::Null,
      }
   }
}

/// Steps a statement to completion, collecting at most `limit` rows.
///
/// Rows beyond the limit are not read; the statement is finalized on return.
unsafe fn step_rows(db: *mut sqlite3, stmt: &Statement, limit: Option<usize>) -> Result<Vec<Row>> {
   let columns = unsafe { column_names(stmt) };
   let width = columns.len() as c_int;
   let mut rows = Vec::new();

   loop {
      if limit.is_some_and(|limit| rows.len() >= limit) {
         return Ok(rows);
      }

      match unsafe { ffi::sqlite3_step(stmt.raw) } {
         ffi::SQLITE_ROW => {
            let values = (0..width).map(|i| unsafe { column_value(stmt, i) }).collect();
            rows.push(Row::new(Arc::clone(&columns), values));
         }
         ffi::SQLITE_DONE => return Ok(rows),
         rc => return Err(unsafe { last_error(db, rc) }),
      }
   }
}

/// Runs every statement in `sql`, discarding result rows.
pub(crate) unsafe fn execute_batch(
   db: *mut sqlite3,
   sql: &str,
) -> std::result::Result<(), BatchFailure> {
   let mut offset = 0;

   while offset < sql.len() {
      let resume_at = offset;
      let fail = move |error| BatchFailure { error, resume_at };

      let (statement, consumed) = unsafe { prepare(db, &sql[offset..]) }.map_err(fail)?;
      if let Some(statement) = statement {
         loop {
            match unsafe { ffi::sqlite3_step(statement.raw) } {
               ffi::SQLITE_ROW => continue,
               ffi::SQLITE_DONE => break,
               rc => return Err(fail(unsafe { last_error(db, rc) })),
            }
         }
      }

      if consumed == 0 {
         break;
      }
      offset += consumed;
   }

   Ok(())
}

/// Runs the first statement in `sql` with `params`, discarding result rows.
pub(crate) unsafe fn run(db: *mut sqlite3, sql: &str, params: &[Value]) -> Result<ExecuteResult> {
   let (statement, _) = unsafe { prepare(db, sql)? };
   if let Some(statement) = statement {
      unsafe {
         bind(db, &statement, params)?;
         loop {
            match ffi::sqlite3_step(statement.raw) {
               ffi::SQLITE_ROW => continue,
               ffi::SQLITE_DONE => break,
               rc => return Err(last_error(db, rc)),
            }
         }
      }
   }

   // SAFETY: db is valid; both calls only read connection state.
   unsafe {
      Ok(ExecuteResult {
         rows_affected: ffi::sqlite3_changes(db).max(0) as u64,
         last_insert_rowid: ffi::sqlite3_last_insert_rowid(db),
      })
   }
}

/// Runs the first statement in `sql` with `params`, returning up to `limit` rows.
pub(crate) unsafe fn query(
   db: *mut sqlite3,
   sql: &str,
   params: &[Value],
   limit: Option<usize>,
) -> Result<Vec<Row>> {
   let (statement, _) = unsafe { prepare(db, sql)? };
   match statement {
      Some(statement) => unsafe {
         bind(db, &statement, params)?;
         step_rows(db, &statement, limit)
      },
      None => Ok(Vec::new()),
   }
}

/// Checkpoints the write-ahead log of every attached database.
pub(crate) unsafe fn checkpoint(db: *mut sqlite3, mode: CheckpointMode) -> Result<CheckpointResult> {
   let mut log_frames: c_int = -1;
   let mut checkpointed_frames: c_int = -1;

   // SAFETY: a null schema name checkpoints all attached databases.
   let rc = unsafe {
      ffi::sqlite3_wal_checkpoint_v2(
         db,
         ptr::null(),
         mode.as_raw(),
         &mut log_frames,
         &mut checkpointed_frames,
      )
   };

   if rc != ffi::SQLITE_OK {
      return Err(unsafe { last_error(db, rc) });
   }

   Ok(CheckpointResult {
      log_frames,
      checkpointed_frames,
   })
}

/// Removes any engine-level busy handler from the handle.
pub(crate) unsafe fn clear_engine_busy_handler(db: *mut sqlite3) -> Result<()> {
   // SAFETY: a zero timeout uninstalls whatever busy handler is registered.
   let rc = unsafe { ffi::sqlite3_busy_timeout(db, 0) };
   if rc != ffi::SQLITE_OK {
      return Err(unsafe { last_error(db, rc) });
   }
   Ok(())
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn test_byte_len_rejects_oversized_values() {
      assert_eq!(byte_len(0).unwrap(), 0);
      assert_eq!(byte_len(c_int::MAX as usize).unwrap(), c_int::MAX);

      let err = byte_len(c_int::MAX as usize + 1).unwrap_err();
      assert_eq!(err.as_sqlite().unwrap().code, ffi::SQLITE_TOOBIG);
   }
}
