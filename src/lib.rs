use std::collections::HashMap;
use std::sync::Arc;

use futures::future::join_all;
use sqlx_mysql_toolkit::{CallOptions, ConnectionConfig, MySql, PoolConfig, Tracer};
use tokio::sync::RwLock;
use tracing::debug;

mod error;

pub use error::{Error, Result};
pub use sqlx_mysql_toolkit as toolkit;

/// Named MySQL connection managers owned by the application.
///
/// Every manager in the set shares the tracer and pool tuning given to the
/// [`Builder`].
pub struct Databases {
   instances: RwLock<HashMap<String, MySql>>,
   tracer: Option<Arc<dyn Tracer>>,
   pool_config: PoolConfig,
}

impl Databases {
   /// Connect to a database and register it under `name`.
   ///
   /// A manager already registered under `name` is replaced and closed. If
   /// the connection fails nothing is registered.
   pub async fn load(&self, name: &str, config: ConnectionConfig) -> Result<MySql> {
      let db = match &self.tracer {
         Some(tracer) => MySql::with_tracer(config, Arc::clone(tracer)),
         None => MySql::new(config),
      };
      db.open(&self.pool_config, CallOptions::new()).await?;

      let previous = self
         .instances
         .write()
         .await
         .insert(name.to_string(), db.clone());

      if let Some(previous) = previous {
         debug!("Replacing database: {}", name);
         previous.close(CallOptions::new()).await?;
      }

      debug!("Loaded database: {}", name);
      Ok(db)
   }

   pub async fn get(&self, name: &str) -> Option<MySql> {
      self.instances.read().await.get(name).cloned()
   }

   /// Names of loaded databases, sorted.
   pub async fn names(&self) -> Vec<String> {
      let mut names: Vec<_> = self.instances.read().await.keys().cloned().collect();
      names.sort();
      names
   }

   /// Close a database and remove it from the set.
   pub async fn close(&self, name: &str) -> Result<()> {
      let db = self
         .instances
         .write()
         .await
         .remove(name)
         .ok_or_else(|| Error::DatabaseNotLoaded(name.to_string()))?;

      db.close(CallOptions::new()).await?;
      debug!("Closed database: {}", name);
      Ok(())
   }

   /// Close every database concurrently and empty the set.
   pub async fn close_all(&self) -> Result<()> {
      let instances: Vec<_> = self.instances.write().await.drain().collect();
      debug!("Closing {} database(s)", instances.len());

      let results = join_all(
         instances
            .iter()
            .map(|(_, db)| db.close(CallOptions::new())),
      )
      .await;

      for result in results {
         result?;
      }
      Ok(())
   }
}

impl Default for Databases {
   fn default() -> Self {
      Builder::new().build()
   }
}

/// Builder for a [`Databases`] set.
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
/// use sqlx_mysql_coordinator::Builder;
/// use sqlx_mysql_coordinator::toolkit::{ConnectionConfig, PoolConfig, SpanTracer};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let databases = Builder::new()
///    .tracer(Arc::new(SpanTracer::new()))
///    .pool_config(PoolConfig {
///       max_open_connections: 20,
///       ..Default::default()
///    })
///    .build();
///
/// let orders = databases
///    .load("orders", ConnectionConfig::from_env()?)
///    .await?;
/// orders.ping(Default::default()).await?;
///
/// databases.close_all().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Default)]
pub struct Builder {
   tracer: Option<Arc<dyn Tracer>>,
   pool_config: PoolConfig,
}

impl Builder {
   pub fn new() -> Self {
      Self::default()
   }

   /// Report trace segments for every database in the set.
   pub fn tracer(mut self, tracer: Arc<dyn Tracer>) -> Self {
      self.tracer = Some(tracer);
      self
   }

   /// Pool tuning applied to every database in the set.
   pub fn pool_config(mut self, pool_config: PoolConfig) -> Self {
      self.pool_config = pool_config;
      self
   }

   pub fn build(self) -> Databases {
      Databases {
         instances: RwLock::new(HashMap::new()),
         tracer: self.tracer,
         pool_config: self.pool_config,
      }
   }
}
