//! Integration tests against a live MySQL server.
//!
//! Connection parameters come from `MYSQL_HOST`, `MYSQL_PORT`, `MYSQL_USER`,
//! `MYSQL_PASSWORD` and `MYSQL_DATABASE`. Every test works on its own table,
//! so tests can run in parallel against one schema.
//!
//! Run with: cargo test --features mysql-tests

#![cfg(feature = "mysql-tests")]

use std::time::Duration;

use serde::Serialize;
use serde_json::json;
use sqlx_mysql_toolkit::{
   CallOptions, ConnectionConfig, MySql, Params, Phase, PoolConfig, TransactionId,
};

fn init_tracing() {
   let _ = tracing_subscriber::fmt()
      .with_max_level(tracing::Level::DEBUG)
      .with_test_writer()
      .try_init();
}

fn opts() -> CallOptions {
   CallOptions::new()
}

async fn open_db(pool_config: PoolConfig) -> MySql {
   init_tracing();
   let config = ConnectionConfig::from_env().unwrap();
   let db = MySql::new(config);
   db.open(&pool_config, opts()).await.unwrap();
   db
}

/// Open a manager and (re)create `table` with an auto-increment key.
async fn setup(table: &str) -> MySql {
   let db = open_db(PoolConfig::default()).await;

   db.execute(&format!("DROP TABLE IF EXISTS {table}"), Params::None, opts())
      .await
      .unwrap();
   db.execute(
      &format!(
         r#"
         CREATE TABLE {table} (
            id BIGINT UNSIGNED AUTO_INCREMENT PRIMARY KEY,
            name VARCHAR(64) NOT NULL,
            score INT NULL
         ) ENGINE=InnoDB
         "#
      ),
      Params::None,
      opts(),
   )
   .await
   .unwrap();

   db
}

async fn count(db: &MySql, table: &str) -> String {
   db.fetch_string(&format!("SELECT COUNT(*) FROM {table}"), Params::None, opts())
      .await
      .unwrap()
      .unwrap()
}

#[derive(Debug, sqlx::FromRow, PartialEq)]
struct Person {
   id: u64,
   name: String,
   score: Option<i32>,
}

// ============================================================================
// Lifecycle
// ============================================================================

#[tokio::test]
async fn test_close_twice_after_open() {
   let db = open_db(PoolConfig::default()).await;

   db.close(opts()).await.unwrap();
   db.close(opts()).await.unwrap();

   assert!(!db.is_connected().await);
   assert_eq!(db.last_ping().await, None);
}

#[tokio::test]
async fn test_reopen_replaces_pool() {
   let db = setup("coord_reopen").await;
   let tx = db.begin(opts()).await.unwrap();

   db.open(&PoolConfig::default(), opts()).await.unwrap();

   assert!(tx.is_closed());
   assert_eq!(db.open_transactions().await, 0);
   db.ping(opts()).await.unwrap();
   db.close(opts()).await.unwrap();
}

#[tokio::test]
async fn test_ping_freshness_window() {
   let db = open_db(PoolConfig::default()).await;
   let opened_at = db.last_ping().await.unwrap();

   db.ping(opts()).await.unwrap();
   db.ping(opts()).await.unwrap();
   assert_eq!(db.last_ping().await, Some(opened_at));
   db.close(opts()).await.unwrap();

   let db = open_db(PoolConfig {
      ping_freshness: Duration::ZERO,
      ..Default::default()
   })
   .await;
   let opened_at = db.last_ping().await.unwrap();

   db.ping(opts()).await.unwrap();
   assert!(db.last_ping().await.unwrap() > opened_at);
   db.close(opts()).await.unwrap();
}

// ============================================================================
// Transactions
// ============================================================================

#[tokio::test]
async fn test_commit_then_reuse_fails() {
   let db = setup("coord_commit").await;
   let tx = db.begin(opts()).await.unwrap();

   tx.execute(
      "INSERT INTO coord_commit (name) VALUES (?)",
      vec![json!("Alice")],
      opts(),
   )
   .await
   .unwrap();
   tx.commit(opts()).await.unwrap();

   assert!(tx.is_closed());
   assert_eq!(db.open_transactions().await, 0);
   assert_eq!(count(&db, "coord_commit").await, "1");

   let err = tx.commit(opts()).await.unwrap_err();
   assert!(err.is_transaction_closed());
   assert_eq!(err.to_string(), "Commit Failed: (Precondition) transaction already closed");

   let err = tx.rollback(opts()).await.unwrap_err();
   assert!(err.is_transaction_closed());

   let err = tx
      .fetch_all("SELECT * FROM coord_commit", Params::None, opts())
      .await
      .unwrap_err();
   assert!(err.is_transaction_closed());

   db.close(opts()).await.unwrap();
}

#[tokio::test]
async fn test_rollback_then_reuse_fails() {
   let db = setup("coord_rollback").await;
   let tx = db.begin(opts()).await.unwrap();

   tx.execute(
      "INSERT INTO coord_rollback (name) VALUES (?)",
      vec![json!("Bob")],
      opts(),
   )
   .await
   .unwrap();
   tx.rollback(opts()).await.unwrap();

   assert!(tx.is_closed());
   assert_eq!(count(&db, "coord_rollback").await, "0");

   assert!(tx.rollback(opts()).await.unwrap_err().is_transaction_closed());
   assert!(tx.commit(opts()).await.unwrap_err().is_transaction_closed());

   db.close(opts()).await.unwrap();
}

#[tokio::test]
async fn test_registry_tracks_open_transactions() {
   let db = setup("coord_registry").await;

   let t1 = db.begin(opts()).await.unwrap();
   let t2 = db.begin(opts()).await.unwrap();
   let t3 = db.begin(opts()).await.unwrap();

   let mut expected: Vec<TransactionId> =
      vec![t1.id().clone(), t2.id().clone(), t3.id().clone()];
   expected.sort();
   assert_eq!(db.transaction_ids().await, expected);

   t2.commit(opts()).await.unwrap();
   let mut expected = vec![t1.id().clone(), t3.id().clone()];
   expected.sort();
   assert_eq!(db.transaction_ids().await, expected);

   t1.rollback(opts()).await.unwrap();
   assert_eq!(db.transaction_ids().await, vec![t3.id().clone()]);

   t3.commit(opts()).await.unwrap();
   assert!(db.transaction_ids().await.is_empty());

   db.close(opts()).await.unwrap();
}

#[tokio::test]
async fn test_close_rolls_back_open_transactions() {
   let db = setup("coord_forced").await;

   let mut txs = Vec::new();
   for i in 0..3 {
      let tx = db.begin(opts()).await.unwrap();
      tx.execute(
         "INSERT INTO coord_forced (name) VALUES (?)",
         vec![json!(format!("user{i}"))],
         opts(),
      )
      .await
      .unwrap();
      txs.push(tx);
   }
   assert_eq!(db.open_transactions().await, 3);

   db.close(opts()).await.unwrap();

   assert_eq!(db.open_transactions().await, 0);
   assert!(txs.iter().all(|tx| tx.is_closed()));

   db.open(&PoolConfig::default(), opts()).await.unwrap();
   assert_eq!(count(&db, "coord_forced").await, "0");
   db.close(opts()).await.unwrap();
}

#[tokio::test]
async fn test_concurrent_transactions_are_independent() {
   let db = setup("coord_independent").await;

   let t1 = db.begin(opts()).await.unwrap();
   let t2 = db.begin(opts()).await.unwrap();

   t1.execute(
      "INSERT INTO coord_independent (name) VALUES ('one')",
      Params::None,
      opts(),
   )
   .await
   .unwrap();
   t2.execute(
      "INSERT INTO coord_independent (name) VALUES ('two')",
      Params::None,
      opts(),
   )
   .await
   .unwrap();

   t1.commit(opts()).await.unwrap();

   assert!(t1.is_closed());
   assert!(!t2.is_closed());
   assert_eq!(db.transaction_ids().await, vec![t2.id().clone()]);

   // t2 still works and its row is only visible inside it
   let seen = t2
      .fetch_string("SELECT COUNT(*) FROM coord_independent", Params::None, opts())
      .await
      .unwrap();
   assert_eq!(seen.as_deref(), Some("2"));
   assert_eq!(count(&db, "coord_independent").await, "1");

   t2.rollback(opts()).await.unwrap();
   assert_eq!(count(&db, "coord_independent").await, "1");

   db.close(opts()).await.unwrap();
}

#[tokio::test]
async fn test_transaction_on_exhausted_pool_with_stale_ping() {
   let db = open_db(PoolConfig {
      max_open_connections: 1,
      max_idle_connections: 1,
      ping_freshness: Duration::ZERO,
      ..Default::default()
   })
   .await;
   let bounded = || CallOptions::new().with_timeout(Duration::from_secs(5));

   // The transaction holds the only connection, so its liveness checks must
   // not wait on the pool
   let tx = db.begin(bounded()).await.unwrap();
   let one = tx
      .fetch_string("SELECT 1", Params::None, bounded())
      .await
      .unwrap();
   assert_eq!(one.as_deref(), Some("1"));
   tx.commit(bounded()).await.unwrap();
   assert!(tx.is_closed());

   let tx = db.begin(bounded()).await.unwrap();
   tx.rollback(bounded()).await.unwrap();
   assert!(tx.is_closed());
   assert_eq!(db.open_transactions().await, 0);

   db.close(opts()).await.unwrap();
}

#[tokio::test]
async fn test_failed_commit_stays_open_and_failed_rollback_closes() {
   let db = setup("coord_killed").await;
   let tx = db.begin(opts()).await.unwrap();

   tx.execute(
      "INSERT INTO coord_killed (name) VALUES ('lost')",
      Params::None,
      opts(),
   )
   .await
   .unwrap();
   let connection_id = tx
      .fetch_string("SELECT CONNECTION_ID()", Params::None, opts())
      .await
      .unwrap()
      .unwrap();

   db.execute(&format!("KILL {connection_id}"), Params::None, opts())
      .await
      .unwrap();

   let err = tx.commit(opts()).await.unwrap_err();
   assert_eq!(err.operation(), Some("Commit"));
   assert_eq!(err.phase(), Some(Phase::Commit));
   assert!(!tx.is_closed());
   assert_eq!(db.transaction_ids().await, vec![tx.id().clone()]);

   let err = tx.rollback(opts()).await.unwrap_err();
   assert_eq!(err.phase(), Some(Phase::Rollback));
   assert!(tx.is_closed());
   assert!(db.transaction_ids().await.is_empty());

   // Nothing was committed, and the manager keeps working on a fresh
   // connection
   assert_eq!(count(&db, "coord_killed").await, "0");
   let err = tx.commit(opts()).await.unwrap_err();
   assert!(err.is_transaction_closed());

   db.close(opts()).await.unwrap();
}

// ============================================================================
// Query/Exec facade
// ============================================================================

#[tokio::test]
async fn test_no_rows_is_not_an_error() {
   let db = setup("coord_norows").await;
   let query = "SELECT id, name, score FROM coord_norows WHERE id = ?";

   let people: Vec<Person> = db
      .fetch_all_as(query, vec![json!(42)], opts())
      .await
      .unwrap();
   assert!(people.is_empty());

   let person: Option<Person> = db
      .fetch_one_as(query, vec![json!(42)], opts())
      .await
      .unwrap();
   assert_eq!(person, None);

   assert!(db.fetch_one(query, vec![json!(42)], opts()).await.unwrap().is_none());
   assert!(
      db.fetch_string("SELECT name FROM coord_norows WHERE id = 42", Params::None, opts())
         .await
         .unwrap()
         .is_none()
   );

   let tx = db.begin(opts()).await.unwrap();
   assert!(tx.fetch_one(query, vec![json!(42)], opts()).await.unwrap().is_none());
   let person: Option<Person> = tx
      .fetch_one_as(query, vec![json!(42)], opts())
      .await
      .unwrap();
   assert_eq!(person, None);
   tx.rollback(opts()).await.unwrap();

   db.close(opts()).await.unwrap();
}

#[tokio::test]
async fn test_insert_id_only_for_insert() {
   let db = setup("coord_insert_id").await;

   let first = db
      .execute(
         "INSERT INTO coord_insert_id (name) VALUES (?)",
         vec![json!("Alice")],
         opts(),
      )
      .await
      .unwrap();
   assert_eq!(first.rows_affected, 1);
   assert!(first.last_insert_id > 0);

   let second = db
      .execute(
         "  insert into coord_insert_id (name) values (?)",
         vec![json!("Bob")],
         opts(),
      )
      .await
      .unwrap();
   assert_eq!(second.last_insert_id, first.last_insert_id + 1);

   let updated = db
      .execute(
         "UPDATE coord_insert_id SET score = 1 WHERE id = ?",
         vec![json!(second.last_insert_id)],
         opts(),
      )
      .await
      .unwrap();
   assert_eq!(updated.rows_affected, 1);
   assert_eq!(updated.last_insert_id, 0);

   db.close(opts()).await.unwrap();
}

#[tokio::test]
async fn test_named_and_struct_parameters() {
   #[derive(Serialize)]
   struct NewPerson<'a> {
      name: &'a str,
      score: i32,
   }

   let db = setup("coord_named").await;

   db.execute(
      "INSERT INTO coord_named (name, score) VALUES (:name, :score)",
      Params::named([("name", json!("Carol")), ("score", json!(7))]),
      opts(),
   )
   .await
   .unwrap();
   db.execute(
      "INSERT INTO coord_named (name, score) VALUES (:name, :score)",
      Params::from_struct(&NewPerson {
         name: "Dave",
         score: 9,
      })
      .unwrap(),
      opts(),
   )
   .await
   .unwrap();

   let people: Vec<Person> = db
      .fetch_all_as(
         "SELECT id, name, score FROM coord_named WHERE score >= :min ORDER BY id",
         Params::named([("min", json!(7))]),
         opts(),
      )
      .await
      .unwrap();
   let names: Vec<_> = people.iter().map(|p| p.name.as_str()).collect();
   assert_eq!(names, vec!["Carol", "Dave"]);

   let err = db
      .fetch_all(
         "SELECT * FROM coord_named WHERE name = :name",
         Params::named([("x", json!(1))]),
         opts(),
      )
      .await
      .unwrap_err();
   assert_eq!(err.error_code(), "MISSING_NAMED_PARAMETER");
   assert!(err.to_string().starts_with("FetchAll Failed: (Bind)"));

   db.close(opts()).await.unwrap();
}

#[tokio::test]
async fn test_row_decoding() {
   let db = open_db(PoolConfig::default()).await;

   let row = db
      .fetch_one(
         "SELECT 1 AS i, CAST(2 AS UNSIGNED) AS u, 1.5e0 AS f, CAST(10.25 AS DECIMAL(6,3)) AS d, \
          'x' AS s, NULL AS n, CAST('{\"a\":[1,2]}' AS JSON) AS j, DATE('2024-02-29') AS dt, \
          CAST('2024-02-29 13:45:10' AS DATETIME) AS ts, X'DEADBEEF' AS b, \
          CAST('-838:59:59' AS TIME) AS neg, CAST('25:00:01.5' AS TIME(1)) AS span",
         Params::None,
         opts(),
      )
      .await
      .unwrap()
      .unwrap();

   let keys: Vec<_> = row.keys().map(String::as_str).collect();
   assert_eq!(
      keys,
      vec!["i", "u", "f", "d", "s", "n", "j", "dt", "ts", "b", "neg", "span"]
   );
   assert_eq!(row["i"], json!(1));
   assert_eq!(row["u"], json!(2));
   assert_eq!(row["f"], json!(1.5));
   assert_eq!(row["d"], json!("10.250"));
   assert_eq!(row["s"], json!("x"));
   assert_eq!(row["n"], json!(null));
   assert_eq!(row["j"], json!({"a": [1, 2]}));
   assert_eq!(row["dt"], json!("2024-02-29"));
   assert_eq!(row["ts"], json!("2024-02-29 13:45:10"));
   assert_eq!(row["b"], json!("3q2+7w=="));
   assert_eq!(row["neg"], json!("-838:59:59"));
   assert_eq!(row["span"], json!("25:00:01.500000"));

   db.close(opts()).await.unwrap();
}

#[tokio::test]
async fn test_fetch_string_scalars() {
   let db = open_db(PoolConfig::default()).await;

   let text = db
      .fetch_string("SELECT 'hello'", Params::None, opts())
      .await
      .unwrap();
   assert_eq!(text.as_deref(), Some("hello"));

   let number = db
      .fetch_string("SELECT 40 + ?", vec![json!(2)], opts())
      .await
      .unwrap();
   assert_eq!(number.as_deref(), Some("42"));

   let err = db
      .fetch_string("SELECT NULL", Params::None, opts())
      .await
      .unwrap_err();
   assert_eq!(err.error_code(), "UNEXPECTED_NULL");

   db.close(opts()).await.unwrap();
}

#[tokio::test]
async fn test_statement_errors_are_wrapped() {
   let db = open_db(PoolConfig::default()).await;

   let err = db
      .fetch_all("SELECT * FROM coord_does_not_exist", Params::None, opts())
      .await
      .unwrap_err();

   assert!(err.to_string().starts_with("FetchAll Failed: (Statement)"));
   assert_eq!(err.error_code(), "MYSQL_42S02");

   db.close(opts()).await.unwrap();
}

#[tokio::test]
async fn test_call_timeout() {
   let db = open_db(PoolConfig::default()).await;

   let err = db
      .fetch_string(
         "SELECT SLEEP(2)",
         Params::None,
         CallOptions::new().with_timeout(Duration::from_millis(100)),
      )
      .await
      .unwrap_err();
   assert!(err.is_timeout());
   assert_eq!(err.error_code(), "TIMEOUT");

   // The manager is still usable afterwards
   db.ping(opts()).await.unwrap();
   db.close(opts()).await.unwrap();
}
