//! Statement helpers shared by the connection manager and transaction handles.
//!
//! Each helper runs against any MySQL executor: the pool outside a
//! transaction, or the transaction's connection inside one. Zero matching
//! rows is a normal outcome and comes back as `None` or an empty `Vec`.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sqlx::mysql::MySqlRow;
use sqlx::{Executor, FromRow, MySql, Row};

use crate::decode::{decode_row, decode_rows, to_json};
use crate::error::{Phase, ResultExt};
use crate::params::Params;
use crate::{Error, Result};

/// Result returned from write operations (e.g. INSERT, UPDATE, DELETE).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteQueryResult {
   /// The number of rows affected by the write operation.
   pub rows_affected: u64,
   /// The AUTO_INCREMENT value generated by the statement.
   ///
   /// Only set for statements starting with `INSERT`; always 0 otherwise.
   pub last_insert_id: u64,
}

pub(crate) async fn fetch_all_as<'e, E, T>(
   executor: E,
   operation: &'static str,
   query: &str,
   params: Params,
) -> Result<Vec<T>>
where
   E: Executor<'e, Database = MySql>,
   T: for<'r> FromRow<'r, MySqlRow> + Send + Unpin,
{
   let (sql, args) = params.prepare(query).during(operation, Phase::Bind)?;

   sqlx::query_as_with::<_, T, _>(&sql, args)
      .fetch_all(executor)
      .await
      .during(operation, Phase::Statement)
}

pub(crate) async fn fetch_one_as<'e, E, T>(
   executor: E,
   operation: &'static str,
   query: &str,
   params: Params,
) -> Result<Option<T>>
where
   E: Executor<'e, Database = MySql>,
   T: for<'r> FromRow<'r, MySqlRow> + Send + Unpin,
{
   let (sql, args) = params.prepare(query).during(operation, Phase::Bind)?;

   let row = sqlx::query_as_with::<_, T, _>(&sql, args)
      .fetch_optional(executor)
      .await;

   absent_as_none(row).during(operation, Phase::Statement)
}

pub(crate) async fn fetch_all<'e, E>(
   executor: E,
   operation: &'static str,
   query: &str,
   params: Params,
) -> Result<Vec<IndexMap<String, JsonValue>>>
where
   E: Executor<'e, Database = MySql>,
{
   let (sql, args) = params.prepare(query).during(operation, Phase::Bind)?;

   let rows = sqlx::query_with(&sql, args)
      .fetch_all(executor)
      .await
      .during(operation, Phase::Statement)?;

   decode_rows(&rows).during(operation, Phase::Statement)
}

pub(crate) async fn fetch_one<'e, E>(
   executor: E,
   operation: &'static str,
   query: &str,
   params: Params,
) -> Result<Option<IndexMap<String, JsonValue>>>
where
   E: Executor<'e, Database = MySql>,
{
   let (sql, args) = params.prepare(query).during(operation, Phase::Bind)?;

   let row = sqlx::query_with(&sql, args).fetch_optional(executor).await;

   match absent_as_none(row).during(operation, Phase::Statement)? {
      Some(row) => Ok(Some(
         decode_row(&row).during(operation, Phase::Statement)?,
      )),
      None => Ok(None),
   }
}

/// First column of the first row, as text.
///
/// Non-text scalars are rendered the way row decoding renders them, so a
/// `COUNT(*)` comes back as `"3"`.
pub(crate) async fn fetch_string<'e, E>(
   executor: E,
   operation: &'static str,
   query: &str,
   params: Params,
) -> Result<Option<String>>
where
   E: Executor<'e, Database = MySql>,
{
   let (sql, args) = params.prepare(query).during(operation, Phase::Bind)?;

   let row = sqlx::query_with(&sql, args).fetch_optional(executor).await;
   let Some(row) = absent_as_none(row).during(operation, Phase::Statement)? else {
      return Ok(None);
   };

   let scalar = row
      .try_get_raw(0)
      .map_err(Error::from)
      .and_then(to_json)
      .during(operation, Phase::Statement)?;

   match scalar {
      JsonValue::Null => Err(Error::UnexpectedNull.during(operation, Phase::Statement)),
      JsonValue::String(text) => Ok(Some(text)),
      other => Ok(Some(other.to_string())),
   }
}

pub(crate) async fn execute<'e, E>(
   executor: E,
   operation: &'static str,
   query: &str,
   params: Params,
) -> Result<WriteQueryResult>
where
   E: Executor<'e, Database = MySql>,
{
   let (sql, args) = params.prepare(query).during(operation, Phase::Bind)?;

   let result = sqlx::query_with(&sql, args)
      .execute(executor)
      .await
      .during(operation, Phase::Statement)?;

   Ok(WriteQueryResult {
      rows_affected: result.rows_affected(),
      last_insert_id: if is_insert(query) {
         result.last_insert_id()
      } else {
         0
      },
   })
}

/// Whether the statement is an INSERT, by a case-insensitive prefix check.
pub(crate) fn is_insert(query: &str) -> bool {
   query
      .trim_start()
      .get(..6)
      .is_some_and(|keyword| keyword.eq_ignore_ascii_case("insert"))
}

/// Treat `RowNotFound` as an absent row.
fn absent_as_none<T>(result: std::result::Result<Option<T>, sqlx::Error>) -> Result<Option<T>> {
   match result {
      Ok(row) => Ok(row),
      Err(sqlx::Error::RowNotFound) => Ok(None),
      Err(e) => Err(e.into()),
   }
}
