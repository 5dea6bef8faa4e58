//! Pool of read-only connections

use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::ops::Deref;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

use crate::Result;
use crate::busy_handler::BusyHandler;
use crate::connection::{Connection, ConnectionId};
use crate::error::Error;
use crate::lock_policy::TableLockPolicy;
use crate::storage::{OpenOptions, StorageLocation};

/// Available connections kept by the idle drain, so the next request after a
/// quiet period does not pay for a cold open.
const MIN_RETAINED_CONNECTIONS: usize = 1;

/// Default time an available connection may sit unused before being evicted
pub const DEFAULT_IDLE_DRAIN_DELAY: Duration = Duration::from_secs(1);

/// Setup run once on every newly opened connection, before first use
pub type ConnectionPreparation =
   Arc<dyn for<'c> Fn(&'c Connection) -> BoxFuture<'c, Result<()>> + Send + Sync>;

/// Settings for the connections a [`ConnectionPool`] opens
///
/// # Example
///
/// ```
/// use sqlx_sqlite_conn_pool::{PoolOptions, TableLockPolicy};
/// use std::time::Duration;
///
/// let options = PoolOptions::new()
///     .idle_drain_delay(Duration::from_millis(250))
///     .table_lock_policy(TableLockPolicy::poll_millis(10))
///     .preparation(|conn| Box::pin(async move { conn.execute("PRAGMA cache_size = -4000").await }));
/// ```
#[derive(Clone)]
pub struct PoolOptions {
   shared_cache: bool,
   table_lock_policy: TableLockPolicy,
   busy_handler: Option<BusyHandler>,
   idle_drain_delay: Duration,
   preparation: Option<ConnectionPreparation>,
}

impl Default for PoolOptions {
   fn default() -> Self {
      Self {
         shared_cache: false,
         table_lock_policy: TableLockPolicy::default(),
         busy_handler: None,
         idle_drain_delay: DEFAULT_IDLE_DRAIN_DELAY,
         preparation: None,
      }
   }
}

impl PoolOptions {
   pub fn new() -> Self {
      Self::default()
   }

   pub fn shared_cache(mut self, shared_cache: bool) -> Self {
      self.shared_cache = shared_cache;
      self
   }

   pub fn table_lock_policy(mut self, policy: TableLockPolicy) -> Self {
      self.table_lock_policy = policy;
      self
   }

   pub fn busy_handler(mut self, handler: BusyHandler) -> Self {
      self.busy_handler = Some(handler);
      self
   }

   pub fn idle_drain_delay(mut self, delay: Duration) -> Self {
      self.idle_drain_delay = delay;
      self
   }

   pub fn preparation<F>(mut self, preparation: F) -> Self
   where
      F: for<'c> Fn(&'c Connection) -> BoxFuture<'c, Result<()>> + Send + Sync + 'static,
   {
      self.preparation = Some(Arc::new(preparation));
      self
   }

   pub(crate) fn with_preparation(mut self, preparation: Option<ConnectionPreparation>) -> Self {
      self.preparation = preparation;
      self
   }

   fn open_options(&self) -> OpenOptions {
      OpenOptions::new()
         .read_only(true)
         .shared_cache(self.shared_cache)
         .table_lock_policy(self.table_lock_policy)
   }
}

impl fmt::Debug for PoolOptions {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.debug_struct("PoolOptions")
         .field("shared_cache", &self.shared_cache)
         .field("table_lock_policy", &self.table_lock_policy)
         .field("busy_handler", &self.busy_handler)
         .field("idle_drain_delay", &self.idle_drain_delay)
         .field("preparation", &self.preparation.is_some())
         .finish()
   }
}

struct IdleConnection {
   conn: Arc<Connection>,
   released_at: Instant,
}

#[derive(Default)]
struct PoolState {
   /// Oldest release first; reuse takes from the back
   available: Vec<IdleConnection>,
   busy: HashMap<ConnectionId, Arc<Connection>>,
   drain_scheduled: bool,
   closed: bool,
}

impl PoolState {
   /// Removes available connections idle for at least `delay`, oldest first,
   /// never going below the retained minimum.
   fn evict_idle(&mut self, delay: Duration) -> Vec<Arc<Connection>> {
      let evictable = self.available.len().saturating_sub(MIN_RETAINED_CONNECTIONS);
      let expired = self
         .available
         .iter()
         .take(evictable)
         .take_while(|idle| idle.released_at.elapsed() >= delay)
         .count();

      self.available.drain(..expired).map(|idle| idle.conn).collect()
   }
}

struct PoolShared {
   location: StorageLocation,
   options: PoolOptions,
   state: Mutex<PoolState>,
}

/// A pool of read-only [`Connection`]s on one storage location.
///
/// Connections are opened lazily when no available one exists and are never
/// limited in number. Every connection the pool created is tracked as either
/// *available* or *busy* (checked out), never both. An idle drain closes
/// available connections unused for longer than the configured delay, always
/// keeping at least one.
///
/// The pool's bookkeeping lock is independent from each connection's execution
/// lock: checking connections in and out never waits on a running statement.
///
/// Cloning is cheap and yields a handle to the same pool.
///
/// # Example
///
/// ```no_run
/// use sqlx_sqlite_conn_pool::{ConnectionPool, PoolOptions, StorageLocation};
///
/// # async fn example() -> sqlx_sqlite_conn_pool::Result<()> {
/// let pool = ConnectionPool::new(StorageLocation::on_disk("app.db"), PoolOptions::new());
///
/// let count = pool
///    .execute(|conn| Box::pin(async move { conn.query::<i64>("SELECT count(*) FROM agents", &[]).await }))
///    .await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct ConnectionPool {
   shared: Arc<PoolShared>,
}

impl ConnectionPool {
   pub fn new(location: StorageLocation, options: PoolOptions) -> Self {
      Self {
         shared: Arc::new(PoolShared {
            location,
            options,
            state: Mutex::new(PoolState::default()),
         }),
      }
   }

   pub fn location(&self) -> &StorageLocation {
      &self.shared.location
   }

   /// Checks out a connection, reusing the most recently released available
   /// one or opening a new one.
   ///
   /// The connection is tracked as busy until handed back with
   /// [`enqueue_connection_for_reuse`](Self::enqueue_connection_for_reuse).
   /// Prefer [`acquire`](Self::acquire) or [`execute`](Self::execute), which
   /// hand it back automatically.
   pub async fn dequeue_connection_for_use(&self) -> Result<Arc<Connection>> {
      {
         let mut state = self.shared.state.lock();
         if state.closed {
            return Err(Error::PoolClosed);
         }

         if let Some(idle) = state.available.pop() {
            let conn = idle.conn;
            state.busy.insert(conn.id(), Arc::clone(&conn));
            return Ok(conn);
         }
      }

      let conn = Arc::new(self.open_connection().await?);

      let mut state = self.shared.state.lock();
      if state.closed {
         drop(state);
         close_detached(conn);
         return Err(Error::PoolClosed);
      }

      state.busy.insert(conn.id(), Arc::clone(&conn));
      debug!(
         id = ?conn.id(),
         busy = state.busy.len(),
         available = state.available.len(),
         "Opened pooled connection"
      );

      Ok(conn)
   }

   /// Hands a checked-out connection back to the available set.
   ///
   /// Connections the pool does not track as busy are ignored.
   pub fn enqueue_connection_for_reuse(&self, conn: &Arc<Connection>) {
      let mut state = self.shared.state.lock();

      let Some(conn) = state.busy.remove(&conn.id()) else {
         warn!(id = ?conn.id(), "Ignoring connection not checked out from this pool");
         return;
      };

      if state.closed {
         drop(state);
         close_detached(conn);
         return;
      }

      state.available.push(IdleConnection {
         conn,
         released_at: Instant::now(),
      });

      self.schedule_drain(&mut state);
   }

   /// Checks out a connection that is handed back when the guard drops
   pub async fn acquire(&self) -> Result<PooledConnection> {
      let conn = self.dequeue_connection_for_use().await?;
      Ok(PooledConnection {
         pool: self.clone(),
         conn,
      })
   }

   /// Runs `work` on a checked-out connection.
   ///
   /// The connection is handed back on every exit path, including errors and
   /// cancellation of the returned future. `work`'s result is returned as is.
   pub async fn execute<T, F>(&self, work: F) -> Result<T>
   where
      F: for<'c> FnOnce(&'c Connection) -> BoxFuture<'c, Result<T>>,
   {
      let conn = self.acquire().await?;
      work(&conn).await
   }

   pub fn available_count(&self) -> usize {
      self.shared.state.lock().available.len()
   }

   pub fn busy_count(&self) -> usize {
      self.shared.state.lock().busy.len()
   }

   pub fn is_available(&self, conn: &Connection) -> bool {
      let state = self.shared.state.lock();
      state.available.iter().any(|idle| idle.conn.id() == conn.id())
   }

   pub fn is_busy(&self, conn: &Connection) -> bool {
      self.shared.state.lock().busy.contains_key(&conn.id())
   }

   /// Closes every available connection and refuses further checkouts.
   ///
   /// Busy connections are closed when they are handed back.
   pub async fn close(&self) {
      let available = {
         let mut state = self.shared.state.lock();
         state.closed = true;
         std::mem::take(&mut state.available)
      };

      for idle in available {
         if let Err(e) = idle.conn.close().await {
            error!("Failed to close pooled connection: {}", e);
         }
      }
   }

   async fn open_connection(&self) -> Result<Connection> {
      let options = &self.shared.options;
      let conn = Connection::open(&self.shared.location, options.open_options()).await?;

      if let Some(handler) = &options.busy_handler {
         conn.set_busy_handler(handler.clone()).await?;
      }

      if let Some(preparation) = &options.preparation {
         preparation(&conn).await?;
      }

      Ok(conn)
   }

   /// Starts the idle drain when there is something it could evict
   fn schedule_drain(&self, state: &mut PoolState) {
      if state.drain_scheduled || state.available.len() <= MIN_RETAINED_CONNECTIONS {
         return;
      }

      // Without a runtime there is nothing to drive the timer; connections
      // simply stay available.
      let Ok(runtime) = tokio::runtime::Handle::try_current() else {
         return;
      };

      state.drain_scheduled = true;
      runtime.spawn(drain_idle_connections(
         Arc::downgrade(&self.shared),
         self.shared.options.idle_drain_delay,
      ));
   }
}

impl fmt::Debug for ConnectionPool {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      let state = self.shared.state.lock();
      f.debug_struct("ConnectionPool")
         .field("location", &self.shared.location)
         .field("available", &state.available.len())
         .field("busy", &state.busy.len())
         .finish()
   }
}

/// Periodically evicts idle connections while more than the retained minimum
/// is available. Exits when the pool is dropped or closed.
async fn drain_idle_connections(shared: Weak<PoolShared>, delay: Duration) {
   let mut scheduled = DrainScheduled {
      shared: shared.clone(),
      armed: true,
   };

   loop {
      tokio::time::sleep(delay).await;

      let Some(shared) = shared.upgrade() else {
         return;
      };

      let (evicted, done) = {
         let mut state = shared.state.lock();
         let evicted = state.evict_idle(delay);
         let done = state.closed || state.available.len() <= MIN_RETAINED_CONNECTIONS;
         if done {
            state.drain_scheduled = false;
            scheduled.armed = false;
         }
         (evicted, done)
      };
      drop(shared);

      if !evicted.is_empty() {
         debug!(count = evicted.len(), "Evicting idle pooled connections");
      }

      for conn in evicted {
         if let Err(e) = conn.close().await {
            error!("Failed to close idle connection: {}", e);
         }
      }

      if done {
         return;
      }
   }
}

/// Clears the pool's `drain_scheduled` flag if the drain task is dropped
/// before it finishes, e.g. when its runtime shuts down mid-sleep.
struct DrainScheduled {
   shared: Weak<PoolShared>,
   armed: bool,
}

impl Drop for DrainScheduled {
   fn drop(&mut self) {
      if self.armed
         && let Some(shared) = self.shared.upgrade()
      {
         shared.state.lock().drain_scheduled = false;
      }
   }
}

/// Closes a connection that left the pool's bookkeeping, from a sync context
fn close_detached(conn: Arc<Connection>) {
   if let Ok(runtime) = tokio::runtime::Handle::try_current() {
      runtime.spawn(async move {
         if let Err(e) = conn.close().await {
            error!("Failed to close pooled connection: {}", e);
         }
      });
   }
}

/// RAII guard for a connection checked out of a [`ConnectionPool`]
///
/// Derefs to [`Connection`]. The connection is handed back to the pool when
/// the guard is dropped.
#[must_use = "if unused, the connection is immediately handed back to the pool"]
pub struct PooledConnection {
   pool: ConnectionPool,
   conn: Arc<Connection>,
}

impl PooledConnection {
   /// Shared handle to the underlying connection. Holding it past the guard
   /// does not keep the connection checked out.
   pub fn connection(&self) -> &Arc<Connection> {
      &self.conn
   }
}

impl Deref for PooledConnection {
   type Target = Connection;

   fn deref(&self) -> &Self::Target {
      &self.conn
   }
}

impl Drop for PooledConnection {
   fn drop(&mut self) {
      self.pool.enqueue_connection_for_reuse(&self.conn);
   }
}

impl fmt::Debug for PooledConnection {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.debug_struct("PooledConnection")
         .field("id", &self.conn.id())
         .finish()
   }
}
