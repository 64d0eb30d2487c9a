//! The connection manager: one pooled MySQL handle plus the registry of
//! transactions opened on it.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use indexmap::IndexMap;
use serde_json::Value as JsonValue;
use sqlx::mysql::{MySqlConnection, MySqlRow};
use sqlx::{Connection, FromRow};
use sqlx_mysql_conn_mgr::{ConnectionConfig, DEFAULT_PING_FRESHNESS, MySqlDatabase, PoolConfig};
use tokio::sync::RwLock;
use tracing::{debug, trace};

use crate::error::{Phase, ResultExt};
use crate::facade::{self, WriteQueryResult};
use crate::options::CallOptions;
use crate::params::Params;
use crate::trace::{self, Call, SegmentContext, Tracer};
use crate::transaction::{
   MySqlTransaction, TransactionId, TransactionRegistry, TransactionSlot,
};
use crate::{Error, Result};

/// Connection manager for one MySQL database.
///
/// Owns a pool (once [`open`](Self::open) succeeds) and every transaction
/// begun on it. Closing or reopening the manager rolls back transactions
/// still open. Cloning is cheap; clones share the same state.
///
/// # Example
///
/// ```no_run
/// use sqlx_mysql_toolkit::{CallOptions, ConnectionConfig, MySql, PoolConfig};
/// use serde_json::json;
///
/// # async fn example() -> sqlx_mysql_toolkit::Result<()> {
/// let db = MySql::new(ConnectionConfig::from_env()?);
/// db.open(&PoolConfig::default(), CallOptions::new()).await?;
///
/// let tx = db.begin(CallOptions::new()).await?;
/// tx.execute(
///    "INSERT INTO users (name) VALUES (?)",
///    vec![json!("Alice")],
///    CallOptions::new(),
/// )
/// .await?;
/// tx.commit(CallOptions::new()).await?;
///
/// db.close(CallOptions::new()).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct MySql {
   inner: Arc<Inner>,
}

struct Inner {
   config: ConnectionConfig,
   tracer: Option<Arc<dyn Tracer>>,
   state: RwLock<ConnectionState>,
}

/// Everything mutable, behind one lock.
struct ConnectionState {
   database: Option<MySqlDatabase>,
   /// Bumped on every install so stale probes and begins can be told apart.
   generation: u64,
   last_ping: Option<Instant>,
   ping_freshness: Duration,
   trace_parent: Option<SegmentContext>,
   transactions: TransactionRegistry,
}

impl MySql {
   /// A disconnected manager. Call [`open`](Self::open) to connect.
   pub fn new(config: ConnectionConfig) -> Self {
      Self::build(config, None)
   }

   /// A disconnected manager that reports segments to `tracer`.
   pub fn with_tracer(config: ConnectionConfig, tracer: Arc<dyn Tracer>) -> Self {
      Self::build(config, Some(tracer))
   }

   fn build(config: ConnectionConfig, tracer: Option<Arc<dyn Tracer>>) -> Self {
      Self {
         inner: Arc::new(Inner {
            config,
            tracer,
            state: RwLock::new(ConnectionState {
               database: None,
               generation: 0,
               last_ping: None,
               ping_freshness: DEFAULT_PING_FRESHNESS,
               trace_parent: None,
               transactions: TransactionRegistry::default(),
            }),
         }),
      }
   }

   /// Connect, replacing any current pool.
   ///
   /// Open transactions are rolled back and the old pool is closed before
   /// the new one is built. The new pool is probed once; if the probe fails
   /// the manager is left disconnected.
   pub async fn open(&self, pool_config: &PoolConfig, options: CallOptions) -> Result<()> {
      const OP: &str = "Open";
      self
         .call(OP, &options)
         .await
         .run(None, async {
            let connect_options = self.inner.config.connect_options().during(OP, Phase::Config)?;

            self.shutdown().await;

            debug!("Opening MySQL pool for {}", self.inner.config.redacted_url());
            let database = MySqlDatabase::connect(
               connect_options,
               self.inner.config.connect_timeout,
               pool_config,
            )
            .await
            .during(OP, Phase::Connect)?;

            self.install(database, pool_config.ping_freshness).await;
            Ok(())
         })
         .await
   }

   /// Roll back open transactions and close the pool.
   ///
   /// Closing a manager that is not connected does nothing.
   pub async fn close(&self, options: CallOptions) -> Result<()> {
      self
         .call("Close", &options)
         .await
         .run(None, async {
            self.shutdown().await;
            Ok(())
         })
         .await
   }

   /// Check that the server is reachable.
   ///
   /// Succeeds without a round trip when the last successful ping falls
   /// within the pool's freshness window.
   pub async fn ping(&self, options: CallOptions) -> Result<()> {
      const OP: &str = "Ping";
      self
         .call(OP, &options)
         .await
         .run(None, async {
            self.ensure_live(OP).await?;
            Ok(())
         })
         .await
   }

   /// Begin a transaction on a connection of its own.
   pub async fn begin(&self, options: CallOptions) -> Result<MySqlTransaction> {
      const OP: &str = "Begin";
      let parent = self.resolve_parent(&options).await;

      Call::new(self.tracer(), OP, parent.clone(), options.timeout)
         .run(Some("BEGIN"), async {
            let (database, generation) = self.ensure_live(OP).await?;

            let connection = database.acquire().await.during(OP, Phase::Begin)?;
            let slot = Arc::new(TransactionSlot::new(TransactionId::generate(), connection));
            slot.begin().await.during(OP, Phase::Begin)?;
            slot.set_segment(trace::begin_segment(
               self.tracer(),
               "MySql-Transaction",
               parent.as_ref(),
            ));

            let registered = {
               let mut state = self.inner.state.write().await;
               let current = state.database.is_some() && state.generation == generation;
               if current {
                  state.transactions.insert(Arc::clone(&slot));
               }
               current
            };

            if !registered {
               // The pool was closed or replaced while BEGIN was in flight
               slot.abort().await;
               return Err(Error::NotConnected.during(OP, Phase::Precondition));
            }

            debug!("Transaction {} begun", slot.id());
            Ok(MySqlTransaction::new(self.clone(), slot))
         })
         .await
   }

   /// Run a query and map every row to `T`.
   pub async fn fetch_all_as<T>(
      &self,
      query: &str,
      params: impl Into<Params>,
      options: CallOptions,
   ) -> Result<Vec<T>>
   where
      T: for<'r> FromRow<'r, MySqlRow> + Send + Unpin,
   {
      const OP: &str = "FetchAllAs";
      let params = params.into();
      self
         .call(OP, &options)
         .await
         .run(Some(query), async {
            let (database, _) = self.ensure_live(OP).await?;
            facade::fetch_all_as(database.pool(), OP, query, params).await
         })
         .await
   }

   /// Run a query and map the first row to `T`. `None` when nothing matched.
   pub async fn fetch_one_as<T>(
      &self,
      query: &str,
      params: impl Into<Params>,
      options: CallOptions,
   ) -> Result<Option<T>>
   where
      T: for<'r> FromRow<'r, MySqlRow> + Send + Unpin,
   {
      const OP: &str = "FetchOneAs";
      let params = params.into();
      self
         .call(OP, &options)
         .await
         .run(Some(query), async {
            let (database, _) = self.ensure_live(OP).await?;
            facade::fetch_one_as(database.pool(), OP, query, params).await
         })
         .await
   }

   /// Run a query and decode every row to JSON.
   pub async fn fetch_all(
      &self,
      query: &str,
      params: impl Into<Params>,
      options: CallOptions,
   ) -> Result<Vec<IndexMap<String, JsonValue>>> {
      const OP: &str = "FetchAll";
      let params = params.into();
      self
         .call(OP, &options)
         .await
         .run(Some(query), async {
            let (database, _) = self.ensure_live(OP).await?;
            facade::fetch_all(database.pool(), OP, query, params).await
         })
         .await
   }

   /// Run a query and decode the first row to JSON.
   pub async fn fetch_one(
      &self,
      query: &str,
      params: impl Into<Params>,
      options: CallOptions,
   ) -> Result<Option<IndexMap<String, JsonValue>>> {
      const OP: &str = "FetchOne";
      let params = params.into();
      self
         .call(OP, &options)
         .await
         .run(Some(query), async {
            let (database, _) = self.ensure_live(OP).await?;
            facade::fetch_one(database.pool(), OP, query, params).await
         })
         .await
   }

   /// Run a query returning a single value, as text.
   pub async fn fetch_string(
      &self,
      query: &str,
      params: impl Into<Params>,
      options: CallOptions,
   ) -> Result<Option<String>> {
      const OP: &str = "FetchString";
      let params = params.into();
      self
         .call(OP, &options)
         .await
         .run(Some(query), async {
            let (database, _) = self.ensure_live(OP).await?;
            facade::fetch_string(database.pool(), OP, query, params).await
         })
         .await
   }

   /// Execute a write statement (INSERT/UPDATE/DELETE).
   pub async fn execute(
      &self,
      query: &str,
      params: impl Into<Params>,
      options: CallOptions,
   ) -> Result<WriteQueryResult> {
      const OP: &str = "Execute";
      let params = params.into();
      self
         .call(OP, &options)
         .await
         .run(Some(query), async {
            let (database, _) = self.ensure_live(OP).await?;
            facade::execute(database.pool(), OP, query, params).await
         })
         .await
   }

   pub fn config(&self) -> &ConnectionConfig {
      &self.inner.config
   }

   pub async fn is_connected(&self) -> bool {
      self.inner.state.read().await.database.is_some()
   }

   /// When the server last answered a ping (or the pool was opened).
   pub async fn last_ping(&self) -> Option<Instant> {
      self.inner.state.read().await.last_ping
   }

   /// Number of transactions begun and not yet finished.
   pub async fn open_transactions(&self) -> usize {
      self.inner.state.read().await.transactions.len()
   }

   /// Ids of open transactions, oldest first.
   pub async fn transaction_ids(&self) -> Vec<TransactionId> {
      self.inner.state.read().await.transactions.ids()
   }

   /// Parent segment for calls that don't name one.
   pub async fn set_trace_parent(&self, parent: Option<SegmentContext>) {
      self.inner.state.write().await.trace_parent = parent;
   }

   pub async fn trace_parent(&self) -> Option<SegmentContext> {
      self.inner.state.read().await.trace_parent.clone()
   }

   pub(crate) fn tracer(&self) -> Option<&dyn Tracer> {
      self.inner.tracer.as_deref()
   }

   /// The pool and its generation, once the server is known to be reachable.
   ///
   /// Fails without touching the network when not connected. A failed probe
   /// leaves the state as it was.
   pub(crate) async fn ensure_live(&self, operation: &'static str) -> Result<(MySqlDatabase, u64)> {
      let (database, generation, fresh) = self.liveness(operation).await?;

      if !fresh {
         database.ping().await.during(operation, Phase::Ping)?;
         self.record_ping(generation).await;
      }
      Ok((database, generation))
   }

   /// Same check as [`ensure_live`](Self::ensure_live), probing over a
   /// connection the caller already holds.
   ///
   /// Transactions use this so a probe never waits for a second pool slot.
   pub(crate) async fn ensure_live_on(
      &self,
      operation: &'static str,
      conn: &mut MySqlConnection,
   ) -> Result<()> {
      let (_, generation, fresh) = self.liveness(operation).await?;

      if !fresh {
         conn.ping().await.during(operation, Phase::Ping)?;
         self.record_ping(generation).await;
      }
      Ok(())
   }

   /// The current pool, its generation, and whether the last ping is still
   /// fresh.
   async fn liveness(&self, operation: &'static str) -> Result<(MySqlDatabase, u64, bool)> {
      let state = self.inner.state.read().await;
      let Some(database) = state.database.clone() else {
         return Err(Error::NotConnected.during(operation, Phase::Precondition));
      };
      let fresh = state
         .last_ping
         .is_some_and(|at| at.elapsed() < state.ping_freshness);
      if fresh {
         trace!("Skipping ping, last success is within the freshness window");
      }
      Ok((database, state.generation, fresh))
   }

   /// Record a successful ping, unless the pool was replaced or closed since.
   async fn record_ping(&self, generation: u64) {
      let mut state = self.inner.state.write().await;
      if state.database.is_some() && state.generation == generation {
         state.last_ping = Some(Instant::now());
      }
   }

   pub(crate) async fn deregister(&self, id: &TransactionId) {
      self.inner.state.write().await.transactions.remove(id);
   }

   async fn call(&self, operation: &'static str, options: &CallOptions) -> Call<'_> {
      let parent = self.resolve_parent(options).await;
      Call::new(self.tracer(), operation, parent, options.timeout)
   }

   async fn resolve_parent(&self, options: &CallOptions) -> Option<SegmentContext> {
      match &options.trace_parent {
         Some(parent) => Some(parent.clone()),
         None => self.trace_parent().await,
      }
   }

   /// Make `database` the current pool.
   async fn install(&self, database: MySqlDatabase, ping_freshness: Duration) {
      let (replaced, orphans) = {
         let mut state = self.inner.state.write().await;
         state.generation += 1;
         state.last_ping = Some(Instant::now());
         state.ping_freshness = ping_freshness;
         (
            state.database.replace(database),
            state.transactions.drain(),
         )
      };

      // Only set when another open raced this one
      release(replaced, orphans).await;
   }

   /// Detach the pool and open transactions, then release them outside the
   /// lock.
   async fn shutdown(&self) {
      let (database, transactions) = {
         let mut state = self.inner.state.write().await;
         state.last_ping = None;
         (state.database.take(), state.transactions.drain())
      };

      release(database, transactions).await;
   }

   #[cfg(test)]
   pub(crate) async fn open_lazy(&self, pool_config: &PoolConfig) -> Result<()> {
      let connect_options = self
         .inner
         .config
         .connect_options()
         .during("Open", Phase::Config)?;
      let database = MySqlDatabase::connect_lazy(
         connect_options,
         self.inner.config.connect_timeout,
         pool_config,
      );
      self.install(database, pool_config.ping_freshness).await;
      Ok(())
   }

   #[cfg(test)]
   pub(crate) async fn register_detached(&self) -> MySqlTransaction {
      let slot = Arc::new(TransactionSlot::detached(TransactionId::generate()));
      self
         .inner
         .state
         .write()
         .await
         .transactions
         .insert(Arc::clone(&slot));
      MySqlTransaction::new(self.clone(), slot)
   }
}

/// Roll back every transaction, then close the pool.
///
/// Transactions go first: closing the pool waits for their connections.
async fn release(database: Option<MySqlDatabase>, transactions: Vec<Arc<TransactionSlot>>) {
   if !transactions.is_empty() {
      debug!("Rolling back {} open transaction(s)", transactions.len());
   }
   for slot in transactions {
      slot.abort().await;
   }

   if let Some(database) = database {
      database.close().await;
   }
}

impl fmt::Debug for MySql {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.debug_struct("MySql")
         .field("config", &self.inner.config)
         .field("traced", &self.inner.tracer.is_some())
         .finish_non_exhaustive()
   }
}
