//! Error types for sqlx-mysql-conn-mgr

use thiserror::Error;

/// Errors that may occur when configuring or connecting to MySQL
#[derive(Error, Debug)]
pub enum Error {
   /// A required connection field is blank.
   #[error("missing required connection field: {0}")]
   MissingField(&'static str),

   /// A configuration value could not be parsed.
   #[error("invalid value for {field}: {value:?}")]
   InvalidField { field: &'static str, value: String },

   /// Error from the sqlx library. Standard sqlx errors are converted to this variant
   #[error("Sqlx error: {0}")]
   Sqlx(#[from] sqlx::Error),
}

/// A type alias for Results with our Error type
pub type Result<T> = std::result::Result<T, Error>;
