//! MySQL connection pool with a liveness probe and an idle-connection cap

use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use sqlx::mysql::{MySqlConnectOptions, MySqlPool, MySqlPoolOptions};
use sqlx::pool::PoolConnection;
use sqlx::{Connection, MySql};
use tracing::{debug, trace};

use crate::Result;
use crate::config::PoolConfig;

/// A live MySQL connection pool.
///
/// ## Pool Tuning
///
/// - **max open**: `PoolConfig::effective_max_open` (0 maps to an unbounded cap)
/// - **idle time**: `PoolConfig::max_idle_time`, connections idle longer are closed
/// - **lifetime**: unlimited
/// - **acquire timeout**: the connection config's `connect_timeout`
/// - **max idle**: enforced by a release hook, see [`IdleCap`]
///
/// Cloning is cheap; clones share the same pool.
#[derive(Debug, Clone)]
pub struct MySqlDatabase {
   pool: Arc<MySqlPool>,
   idle_cap: Option<Arc<IdleCap>>,
}

/// Upper bound on idle connections.
///
/// sqlx keeps every released connection unless told otherwise. The release
/// hook consults this cap and closes the connection when the pool already
/// holds `max_idle` idle connections.
///
/// The hook lives inside the pool's options, so the cap only holds a weak
/// reference back to the pool.
#[derive(Debug)]
struct IdleCap {
   max_idle: u32,
   pool: OnceLock<Weak<MySqlPool>>,
}

impl IdleCap {
   fn has_room(&self) -> bool {
      match self.pool.get() {
         Some(pool) => pool
            .upgrade()
            .is_some_and(|pool| pool.num_idle() < self.max_idle as usize),
         None => true,
      }
   }
}

impl MySqlDatabase {
   /// Build the pool and probe it once.
   ///
   /// If the probe fails the pool is closed and the probe error returned, so
   /// a successful return always means a reachable server.
   pub async fn connect(
      options: MySqlConnectOptions,
      connect_timeout: Duration,
      config: &PoolConfig,
   ) -> Result<Self> {
      let database = Self::connect_lazy(options, connect_timeout, config);

      if let Err(e) = database.ping().await {
         debug!("Initial probe failed, discarding pool: {}", e);
         database.close().await;
         return Err(e);
      }

      Ok(database)
   }

   /// Build the pool without opening any connection.
   ///
   /// Must be called from within a tokio runtime.
   pub fn connect_lazy(
      options: MySqlConnectOptions,
      connect_timeout: Duration,
      config: &PoolConfig,
   ) -> Self {
      let max_idle = config.effective_max_idle();
      let idle_cap = (max_idle > 0).then(|| {
         Arc::new(IdleCap {
            max_idle,
            pool: OnceLock::new(),
         })
      });

      let mut pool_options = MySqlPoolOptions::new()
         .max_connections(config.effective_max_open())
         .min_connections(0)
         .idle_timeout(config.max_idle_time)
         .max_lifetime(None::<Duration>)
         .acquire_timeout(connect_timeout);

      if let Some(cap) = &idle_cap {
         let cap = Arc::clone(cap);
         pool_options = pool_options.after_release(move |_conn, _meta| {
            let keep = cap.has_room();
            if !keep {
               trace!("Idle cap reached, closing released connection");
            }
            Box::pin(async move { Ok(keep) })
         });
      }

      let pool = Arc::new(pool_options.connect_lazy_with(options));

      if let Some(cap) = &idle_cap {
         let _ = cap.pool.set(Arc::downgrade(&pool));
      }

      Self { pool, idle_cap }
   }

   /// Issue a live ping on a pooled connection.
   pub async fn ping(&self) -> Result<()> {
      let mut conn = self.pool.acquire().await?;
      conn.ping().await?;
      Ok(())
   }

   /// Check a connection out of the pool.
   ///
   /// The connection returns to the pool when dropped.
   pub async fn acquire(&self) -> Result<PoolConnection<MySql>> {
      Ok(self.pool.acquire().await?)
   }

   /// The underlying sqlx pool.
   pub fn pool(&self) -> &MySqlPool {
      &self.pool
   }

   /// Close the pool, waiting for checked-out connections to be returned.
   pub async fn close(&self) {
      self.pool.close().await;
      debug!("Connection pool closed");
   }
}

#[cfg(test)]
mod tests {
   use super::*;
   use crate::{ConnectionConfig, Error, UNBOUNDED_CONNECTIONS};

   /// Nothing listens on port 1, so connects are refused immediately and the
   /// pool gives up once the acquire timeout elapses.
   fn unreachable_config() -> ConnectionConfig {
      ConnectionConfig {
         host: "127.0.0.1".into(),
         port: 1,
         user: "app".into(),
         password: "secret".into(),
         database: "orders".into(),
         connect_timeout: Duration::from_millis(200),
         ..Default::default()
      }
   }

   #[tokio::test]
   async fn test_connect_lazy_applies_tuning() {
      let config = unreachable_config();
      let pool_config = PoolConfig {
         max_open_connections: 7,
         max_idle_connections: 3,
         max_idle_time: Some(Duration::from_secs(45)),
         ..Default::default()
      };

      let db = MySqlDatabase::connect_lazy(
         config.connect_options().unwrap(),
         config.connect_timeout,
         &pool_config,
      );

      let options = db.pool().options();
      assert_eq!(options.get_max_connections(), 7);
      assert_eq!(options.get_idle_timeout(), Some(Duration::from_secs(45)));
      assert_eq!(options.get_max_lifetime(), None);
      assert_eq!(options.get_acquire_timeout(), Duration::from_millis(200));
      assert!(db.idle_cap.is_some());

      // Nothing was opened
      assert_eq!(db.pool().size(), 0);

      db.close().await;
      assert!(db.pool().is_closed());
   }

   #[tokio::test]
   async fn test_unlimited_pool_without_idle_cap() {
      let config = unreachable_config();
      let pool_config = PoolConfig {
         max_open_connections: 0,
         max_idle_connections: 0,
         ..Default::default()
      };

      let db = MySqlDatabase::connect_lazy(
         config.connect_options().unwrap(),
         config.connect_timeout,
         &pool_config,
      );

      assert_eq!(db.pool().options().get_max_connections(), UNBOUNDED_CONNECTIONS);
      assert!(db.idle_cap.is_none());

      db.close().await;
   }

   #[tokio::test]
   async fn test_dropped_database_frees_pool() {
      let config = unreachable_config();
      let pool_config = PoolConfig {
         max_open_connections: 4,
         max_idle_connections: 2,
         ..Default::default()
      };

      let db = MySqlDatabase::connect_lazy(
         config.connect_options().unwrap(),
         config.connect_timeout,
         &pool_config,
      );
      let cap = Arc::clone(db.idle_cap.as_ref().unwrap());
      let pool = Arc::downgrade(&db.pool);
      assert_eq!(Arc::strong_count(&cap), 3);

      // A clone shares the pool
      let clone = db.clone();
      drop(db);
      assert!(pool.upgrade().is_some());

      drop(clone);
      tokio::task::yield_now().await;

      assert!(pool.upgrade().is_none());
      assert_eq!(Arc::strong_count(&cap), 1);
      assert!(!cap.has_room());
   }

   #[tokio::test]
   async fn test_connect_fails_against_unreachable_server() {
      let config = unreachable_config();

      let err = MySqlDatabase::connect(
         config.connect_options().unwrap(),
         config.connect_timeout,
         &PoolConfig::default(),
      )
      .await
      .unwrap_err();

      assert!(matches!(err, Error::Sqlx(_)));
   }
}
