//! # sqlx-mysql-conn-mgr
//!
//! A minimal wrapper around SQLx that turns validated MySQL connection
//! parameters into a tuned, liveness-checked connection pool.
//!
//! ## Core Types
//!
//! - **[`ConnectionConfig`]**: Connection parameters (host, credentials, charset, timeouts)
//! - **[`PoolConfig`]**: Pool tuning (max open, max idle, idle time, ping freshness)
//! - **[`MySqlDatabase`]**: A live pool plus its idle-connection cap
//! - **[`Error`]**: Error type for configuration and connection failures
//!
//! Transactions and query helpers live one layer up, in `sqlx-mysql-toolkit`.

mod config;
mod database;
mod error;

// Re-export public types
pub use config::{ConnectionConfig, DEFAULT_PING_FRESHNESS, PoolConfig, UNBOUNDED_CONNECTIONS};
pub use database::MySqlDatabase;
pub use error::{Error, Result};
