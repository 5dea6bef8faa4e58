//! Configuration for a [`Database`](crate::Database)

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::busy_handler::BusyHandler;
use crate::lock_policy::TableLockPolicy;
use crate::pool::PoolOptions;

/// Configuration shared by the writer and the reader pool of a database
///
/// Busy handling with a custom callback cannot be expressed here; install it
/// with [`DatabaseBuilder::busy_handler`](crate::DatabaseBuilder::busy_handler)
/// instead.
///
/// # Examples
///
/// ```
/// use sqlx_sqlite_conn_pool::{DatabaseConfig, TableLockPolicy};
///
/// // Use defaults
/// let config = DatabaseConfig::default();
///
/// // Shared cache with polling on table lock conflicts
/// let config = DatabaseConfig {
///     shared_cache: true,
///     table_lock_policy: TableLockPolicy::poll_millis(10),
///     ..Default::default()
/// };
///
/// // Wait up to two seconds on a busy database
/// let config = DatabaseConfig {
///     busy_timeout_ms: Some(2000),
///     ..Default::default()
/// };
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
   /// Open every connection in shared-cache mode
   ///
   /// Shared cache changes lock granularity from the whole database to single
   /// tables, so contention surfaces as table lock conflicts instead of busy
   /// conditions.
   ///
   /// Default: false
   pub shared_cache: bool,

   /// Reaction to table lock conflicts, for the writer and every reader
   ///
   /// Default: [`TableLockPolicy::FastFail`]
   pub table_lock_policy: TableLockPolicy,

   /// Budget for retrying on a busy database (in milliseconds)
   ///
   /// `None` surfaces busy conditions immediately.
   ///
   /// Default: None
   pub busy_timeout_ms: Option<u64>,

   /// Idle time after which an unused reader is closed (in milliseconds)
   ///
   /// At least one reader is always kept open.
   ///
   /// Default: 1000
   pub idle_drain_delay_ms: u64,
}

impl Default for DatabaseConfig {
   fn default() -> Self {
      Self {
         shared_cache: false,
         table_lock_policy: TableLockPolicy::default(),
         busy_timeout_ms: None,
         idle_drain_delay_ms: 1000,
      }
   }
}

impl DatabaseConfig {
   /// Busy handler described by `busy_timeout_ms`
   pub fn busy_handler(&self) -> BusyHandler {
      match self.busy_timeout_ms {
         Some(ms) => BusyHandler::Timeout(Duration::from_millis(ms)),
         None => BusyHandler::DefaultBehavior,
      }
   }

   pub fn idle_drain_delay(&self) -> Duration {
      Duration::from_millis(self.idle_drain_delay_ms)
   }

   pub(crate) fn pool_options(&self, busy_handler: BusyHandler) -> PoolOptions {
      PoolOptions::new()
         .shared_cache(self.shared_cache)
         .table_lock_policy(self.table_lock_policy)
         .busy_handler(busy_handler)
         .idle_drain_delay(self.idle_drain_delay())
   }
}
