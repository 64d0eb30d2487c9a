/// Result type alias for instance-set operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors from the set of named databases.
#[derive(Debug, thiserror::Error)]
pub enum Error {
   /// Error from a connection manager.
   #[error(transparent)]
   Toolkit(#[from] sqlx_mysql_toolkit::Error),

   /// No database is loaded under this name.
   #[error("database not loaded: {0}")]
   DatabaseNotLoaded(String),
}

impl Error {
   /// Extract a structured error code from the error type.
   pub fn error_code(&self) -> String {
      match self {
         Error::Toolkit(e) => e.error_code(),
         Error::DatabaseNotLoaded(_) => "DATABASE_NOT_LOADED".to_string(),
      }
   }
}
