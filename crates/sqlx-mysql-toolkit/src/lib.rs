//! # sqlx-mysql-toolkit
//!
//! Connection lifecycle and transaction coordination for MySQL on top of
//! SQLx.
//!
//! ## Core Types
//!
//! - **[`MySql`]**: Connection manager owning one pool and the registry of
//!   open transactions (`open`, `close`, `ping`, `begin`)
//! - **[`MySqlTransaction`]**: An open transaction (`commit`, `rollback`)
//! - **[`Params`]**: Positional, named, or struct-derived statement parameters
//! - **[`CallOptions`]**: Per-call timeout and trace parent
//! - **[`Tracer`]** / **[`Segment`]**: Optional tracing collaborator
//! - **[`Error`]**: Errors tagged with the operation and phase that failed
//!
//! The same query helpers exist on the manager and on a transaction:
//! `fetch_all_as`, `fetch_one_as`, `fetch_all`, `fetch_one`, `fetch_string`
//! and `execute`. Read helpers report "no matching row" as `None` (or an
//! empty `Vec`), never as an error.

pub mod decode;
mod error;
mod facade;
mod manager;
mod options;
mod params;
mod trace;
mod transaction;

pub use error::{Error, Phase, Result};
pub use facade::WriteQueryResult;
pub use manager::MySql;
pub use options::CallOptions;
pub use params::Params;
pub use trace::{Segment, SegmentContext, SpanTracer, Tracer};
pub use transaction::{MySqlTransaction, TransactionId};

pub use sqlx_mysql_conn_mgr::{ConnectionConfig, PoolConfig};
