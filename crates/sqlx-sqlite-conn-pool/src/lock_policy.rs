//! Reaction to shared-cache table lock conflicts (`SQLITE_LOCKED`)

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How a connection reacts when a statement reports that a table is locked by
/// another connection sharing the same page cache.
///
/// Table locks only occur in shared-cache mode. They are reported with the
/// `SQLITE_LOCKED` result code and are distinct from whole-database busy
/// conditions, which are handled by [`BusyHandler`](crate::BusyHandler).
///
/// # Examples
///
/// ```
/// use sqlx_sqlite_conn_pool::TableLockPolicy;
/// use std::time::Duration;
///
/// let policy = TableLockPolicy::Poll(Duration::from_millis(10));
/// assert_eq!(policy.retry_interval(), Some(Duration::from_millis(10)));
/// assert_eq!(TableLockPolicy::FastFail.retry_interval(), None);
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TableLockPolicy {
   /// No retry: the first table lock error is returned
   Off,

   /// Explicitly fail fast. Behaves exactly like `Off`.
   #[default]
   FastFail,

   /// Sleep for the interval and re-run the statement from scratch, until it
   /// succeeds.
   ///
   /// There is no upper bound on the number of attempts. Wrap the call in
   /// `tokio::time::timeout` when a deadline is needed.
   Poll(#[serde(with = "duration_ms")] Duration),
}

impl TableLockPolicy {
   /// Convenience constructor for `Poll` from milliseconds
   pub fn poll_millis(interval_ms: u64) -> Self {
      TableLockPolicy::Poll(Duration::from_millis(interval_ms))
   }

   /// Delay before the next attempt, or `None` if the error should be returned
   pub fn retry_interval(&self) -> Option<Duration> {
      match self {
         TableLockPolicy::Off | TableLockPolicy::FastFail => None,
         TableLockPolicy::Poll(interval) => Some(*interval),
      }
   }
}

mod duration_ms {
   use serde::{Deserialize, Deserializer, Serializer};
   use std::time::Duration;

   pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
      s.serialize_u64(d.as_millis() as u64)
   }

   pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
      u64::deserialize(d).map(Duration::from_millis)
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn test_off_and_fast_fail_never_retry() {
      assert_eq!(TableLockPolicy::Off.retry_interval(), None);
      assert_eq!(TableLockPolicy::FastFail.retry_interval(), None);
   }

   #[test]
   fn test_poll_interval() {
      assert_eq!(
         TableLockPolicy::poll_millis(25).retry_interval(),
         Some(Duration::from_millis(25))
      );
   }

   #[test]
   fn test_serde_representation() {
      let json = serde_json::to_string(&TableLockPolicy::poll_millis(10)).unwrap();
      assert_eq!(json, r#"{"poll":10}"#);

      let policy: TableLockPolicy = serde_json::from_str(r#""fast_fail""#).unwrap();
      assert_eq!(policy, TableLockPolicy::FastFail);

      let policy: TableLockPolicy = serde_json::from_str(r#"{"poll":250}"#).unwrap();
      assert_eq!(policy, TableLockPolicy::Poll(Duration::from_millis(250)));
   }
}
