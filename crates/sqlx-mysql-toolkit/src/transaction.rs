//! Transaction handles and the registry of open transactions.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use indexmap::IndexMap;
use serde_json::Value as JsonValue;
use sqlx::mysql::{MySqlConnection, MySqlRow};
use sqlx::pool::PoolConnection;
use sqlx::{Executor, FromRow, MySql};
use tokio::sync::{Mutex, MutexGuard};
use tracing::debug;
use uuid::Uuid;

use crate::error::{Phase, ResultExt};
use crate::facade::{self, WriteQueryResult};
use crate::manager::MySql as Manager;
use crate::options::CallOptions;
use crate::params::Params;
use crate::trace::{Call, Segment, SegmentContext};
use crate::{Error, Result};

/// Opaque identifier of an open transaction.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransactionId(String);

impl TransactionId {
   /// A new unique id. Ids sort by creation time.
   pub(crate) fn generate() -> Self {
      Self(Uuid::now_v7().to_string())
   }

   pub fn as_str(&self) -> &str {
      &self.0
   }
}

impl fmt::Display for TransactionId {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.write_str(&self.0)
   }
}

/// Shared state of one transaction: the connection hosting it and its
/// trace segment.
///
/// The connection mutex serializes statements on the transaction and makes
/// the `closed` check atomic with respect to commit, rollback, and forced
/// cleanup.
pub(crate) struct TransactionSlot {
   id: TransactionId,
   closed: AtomicBool,
   connection: Mutex<Option<PoolConnection<MySql>>>,
   segment: parking_lot::Mutex<Option<Box<dyn Segment>>>,
}

impl TransactionSlot {
   pub(crate) fn new(id: TransactionId, connection: PoolConnection<MySql>) -> Self {
      Self {
         id,
         closed: AtomicBool::new(false),
         connection: Mutex::new(Some(connection)),
         segment: parking_lot::Mutex::new(None),
      }
   }

   /// A slot with no connection behind it.
   #[cfg(test)]
   pub(crate) fn detached(id: TransactionId) -> Self {
      Self {
         id,
         closed: AtomicBool::new(false),
         connection: Mutex::new(None),
         segment: parking_lot::Mutex::new(None),
      }
   }

   pub(crate) fn id(&self) -> &TransactionId {
      &self.id
   }

   fn is_closed(&self) -> bool {
      self.closed.load(Ordering::Acquire)
   }

   /// Issue `BEGIN` on the slot's connection.
   pub(crate) async fn begin(&self) -> Result<()> {
      let mut connection = self.connection.lock().await;
      let conn = connection
         .as_deref_mut()
         .ok_or(Error::TransactionIncomplete("connection"))?;
      conn.execute("BEGIN").await?;
      Ok(())
   }

   pub(crate) fn set_segment(&self, segment: Option<Box<dyn Segment>>) {
      *self.segment.lock() = segment;
   }

   fn segment_context(&self) -> Option<SegmentContext> {
      self.segment.lock().as_ref().map(|segment| segment.context())
   }

   fn close_segment(&self, error: Option<&Error>) {
      let segment = self.segment.lock().take();
      if let Some(mut segment) = segment {
         if let Some(error) = error {
            segment.add_error(error);
         }
         segment.close();
      }
   }

   /// Forced rollback, used when the manager closes or reopens.
   ///
   /// Rollback failures are ignored: the connection is closed instead of
   /// being returned to the pool, and the slot is closed either way.
   pub(crate) async fn abort(&self) {
      let mut connection = self.connection.lock().await;
      if self.is_closed() {
         return;
      }

      if let Some(mut conn) = connection.take() {
         if let Err(e) = (&mut *conn).execute("ROLLBACK").await {
            debug!("Forced rollback of {} failed, closing connection: {}", self.id, e);
            drop(conn.detach());
         }
      }

      self.closed.store(true, Ordering::Release);
      self.close_segment(None);
      debug!("Transaction {} rolled back by cleanup", self.id);
   }
}

impl Drop for TransactionSlot {
   fn drop(&mut self) {
      // Only reachable when a begin was cut short: never hand a connection
      // with an open transaction back to the pool
      if let Some(conn) = self.connection.get_mut().take() {
         debug!("Discarding connection of unregistered transaction {}", self.id);
         drop(conn.detach());
      }
      self.close_segment(None);
   }
}

/// Open transactions, keyed by id.
#[derive(Default)]
pub(crate) struct TransactionRegistry(HashMap<TransactionId, Arc<TransactionSlot>>);

impl TransactionRegistry {
   pub(crate) fn insert(&mut self, slot: Arc<TransactionSlot>) {
      self.0.insert(slot.id().clone(), slot);
   }

   pub(crate) fn remove(&mut self, id: &TransactionId) -> Option<Arc<TransactionSlot>> {
      self.0.remove(id)
   }

   /// Remove every entry, for forced cleanup.
   pub(crate) fn drain(&mut self) -> Vec<Arc<TransactionSlot>> {
      self.0.drain().map(|(_, slot)| slot).collect()
   }

   pub(crate) fn len(&self) -> usize {
      self.0.len()
   }

   pub(crate) fn ids(&self) -> Vec<TransactionId> {
      let mut ids: Vec<_> = self.0.keys().cloned().collect();
      ids.sort();
      ids
   }
}

/// Connection checked out of a transaction for one statement.
struct TxConnection<'a> {
   guard: MutexGuard<'a, Option<PoolConnection<MySql>>>,
}

impl TxConnection<'_> {
   fn get(&mut self, operation: &'static str) -> Result<&mut MySqlConnection> {
      self.guard.as_deref_mut().ok_or_else(|| {
         Error::TransactionIncomplete("connection").during(operation, Phase::Precondition)
      })
   }
}

/// An open transaction.
///
/// Created by [`MySql::begin`](crate::MySql::begin). The owner must finish it
/// with [`commit`](Self::commit) or [`rollback`](Self::rollback); an
/// unfinished transaction stays open until the manager is closed or
/// reopened, which rolls it back.
///
/// Statements on one transaction run one at a time.
pub struct MySqlTransaction {
   db: Manager,
   slot: Arc<TransactionSlot>,
}

impl MySqlTransaction {
   pub(crate) fn new(db: Manager, slot: Arc<TransactionSlot>) -> Self {
      Self { db, slot }
   }

   pub fn id(&self) -> &TransactionId {
      self.slot.id()
   }

   /// Whether the transaction was committed or rolled back.
   pub fn is_closed(&self) -> bool {
      self.slot.is_closed()
   }

   /// Commit the transaction.
   ///
   /// A failed liveness check or a failed `COMMIT` leaves the transaction
   /// open, so it can be retried or rolled back.
   pub async fn commit(&self, options: CallOptions) -> Result<()> {
      const OP: &str = "Commit";
      self
         .call(OP, &options)
         .await
         .run(Some("COMMIT"), async {
            let mut conn = self.checkout(OP).await?;
            conn
               .get(OP)?
               .execute("COMMIT")
               .await
               .during(OP, Phase::Commit)?;

            self.finish(conn, None).await;
            debug!("Transaction {} committed", self.slot.id());
            Ok(())
         })
         .await
   }

   /// Roll the transaction back.
   ///
   /// Once the checks pass, the transaction is closed whether or not the
   /// `ROLLBACK` itself succeeds.
   pub async fn rollback(&self, options: CallOptions) -> Result<()> {
      const OP: &str = "Rollback";
      self
         .call(OP, &options)
         .await
         .run(Some("ROLLBACK"), async {
            let mut conn = self.checkout(OP).await?;
            let result = conn.get(OP)?.execute("ROLLBACK").await;

            match result {
               Ok(_) => {
                  self.finish(conn, None).await;
                  debug!("Transaction {} rolled back", self.slot.id());
                  Ok(())
               }
               Err(e) => {
                  let err = Error::from(e).during(OP, Phase::Rollback);
                  self.finish(conn, Some(&err)).await;
                  debug!("Transaction {} closed after failed rollback", self.slot.id());
                  Err(err)
               }
            }
         })
         .await
   }

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
            let mut conn = self.checkout(OP).await?;
            facade::fetch_all_as(conn.get(OP)?, OP, query, params).await
         })
         .await
   }

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
            let mut conn = self.checkout(OP).await?;
            facade::fetch_one_as(conn.get(OP)?, OP, query, params).await
         })
         .await
   }

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
            let mut conn = self.checkout(OP).await?;
            facade::fetch_all(conn.get(OP)?, OP, query, params).await
         })
         .await
   }

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
            let mut conn = self.checkout(OP).await?;
            facade::fetch_one(conn.get(OP)?, OP, query, params).await
         })
         .await
   }

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
            let mut conn = self.checkout(OP).await?;
            facade::fetch_string(conn.get(OP)?, OP, query, params).await
         })
         .await
   }

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
            let mut conn = self.checkout(OP).await?;
            facade::execute(conn.get(OP)?, OP, query, params).await
         })
         .await
   }

   /// Segment parent: the call's, then the transaction's, then the manager's.
   async fn call(&self, operation: &'static str, options: &CallOptions) -> Call<'_> {
      let parent = match options
         .trace_parent
         .clone()
         .or_else(|| self.slot.segment_context())
      {
         Some(parent) => Some(parent),
         None => self.db.trace_parent().await,
      };
      Call::new(self.db.tracer(), operation, parent, options.timeout)
   }

   /// Lock the transaction's connection after checking that the transaction
   /// is open and the manager is reachable.
   async fn checkout(&self, operation: &'static str) -> Result<TxConnection<'_>> {
      let mut guard = self.slot.connection.lock().await;

      if self.slot.is_closed() {
         return Err(Error::TransactionClosed.during(operation, Phase::Precondition));
      }
      let Some(conn) = guard.as_deref_mut() else {
         return Err(
            Error::TransactionIncomplete("connection").during(operation, Phase::Precondition),
         );
      };

      // The probe runs over the transaction's own connection
      self.db.ensure_live_on(operation, conn).await?;

      Ok(TxConnection { guard })
   }

   /// Close the transaction and drop it from the registry.
   ///
   /// After an error the connection is closed instead of going back to the
   /// pool, since its transaction state is unknown.
   async fn finish(&self, mut conn: TxConnection<'_>, error: Option<&Error>) {
      self.db.deregister(self.slot.id()).await;
      self.slot.closed.store(true, Ordering::Release);

      if let Some(connection) = conn.guard.take() {
         if error.is_some() {
            drop(connection.detach());
         }
      }

      self.slot.close_segment(error);
   }
}

impl fmt::Debug for MySqlTransaction {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.debug_struct("MySqlTransaction")
         .field("id", self.slot.id())
         .field("closed", &self.is_closed())
         .finish()
   }
}

impl Drop for MySqlTransaction {
   fn drop(&mut self) {
      if !self.slot.is_closed() {
         debug!(
            "Transaction {} dropped while open, it stays registered until the manager closes",
            self.slot.id()
         );
      }
   }
}
