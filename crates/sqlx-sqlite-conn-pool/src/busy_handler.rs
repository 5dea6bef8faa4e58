//! Reaction to whole-database lock conflicts (`SQLITE_BUSY`)

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Delays between attempts of the [`BusyHandler::Timeout`] strategy, in
/// milliseconds. The last entry repeats until the budget is spent.
const TIMEOUT_BACKOFF_MS: [u64; 12] = [1, 2, 5, 10, 15, 20, 25, 25, 25, 50, 50, 100];

/// Pause between attempts when a [`BusyHandler::Custom`] callback asks for a retry
const CUSTOM_RETRY_PAUSE: Duration = Duration::from_millis(1);

/// Callback deciding whether to retry after a busy condition. Receives the
/// number of retries already made for the current statement, starting at 0.
pub type BusyCallback = Arc<dyn Fn(u32) -> bool + Send + Sync>;

/// How a connection reacts when the engine reports that the database file is
/// locked by another connection.
///
/// The strategy is evaluated by the connection's statement routine each time a
/// native call returns `SQLITE_BUSY`; no callback is ever registered with the
/// engine itself.
///
/// # Examples
///
/// ```
/// use sqlx_sqlite_conn_pool::BusyHandler;
/// use std::time::Duration;
///
/// let patient = BusyHandler::Timeout(Duration::from_secs(2));
/// let bounded = BusyHandler::custom(|attempts| attempts < 100);
/// ```
#[derive(Clone, Default)]
pub enum BusyHandler {
   /// The busy error is returned to the caller immediately
   #[default]
   DefaultBehavior,

   /// Retry with a short backoff until the cumulative wait reaches the budget
   Timeout(Duration),

   /// Ask the callback after every busy error; `false` returns the error
   Custom(BusyCallback),
}

impl BusyHandler {
   pub fn custom<F>(callback: F) -> Self
   where
      F: Fn(u32) -> bool + Send + Sync + 'static,
   {
      BusyHandler::Custom(Arc::new(callback))
   }

   /// Delay before the next attempt, or `None` to give up and surface the
   /// busy error.
   ///
   /// `attempts` is the number of retries already made; `waited` the time
   /// spent since the first busy error of this statement.
   pub(crate) fn retry_delay(&self, attempts: u32, waited: Duration) -> Option<Duration> {
      match self {
         BusyHandler::DefaultBehavior => None,
         BusyHandler::Timeout(budget) => {
            let remaining = budget.checked_sub(waited).filter(|d| !d.is_zero())?;
            let step = TIMEOUT_BACKOFF_MS[(attempts as usize).min(TIMEOUT_BACKOFF_MS.len() - 1)];
            Some(Duration::from_millis(step).min(remaining))
         }
         BusyHandler::Custom(callback) => callback(attempts).then_some(CUSTOM_RETRY_PAUSE),
      }
   }
}

impl fmt::Debug for BusyHandler {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      match self {
         BusyHandler::DefaultBehavior => f.write_str("DefaultBehavior"),
         BusyHandler::Timeout(budget) => f.debug_tuple("Timeout").field(budget).finish(),
         BusyHandler::Custom(_) => f.write_str("Custom(..)"),
      }
   }
}
