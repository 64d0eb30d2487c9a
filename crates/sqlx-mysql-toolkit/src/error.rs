use std::fmt;
use std::time::Duration;

/// Result type alias for toolkit operations.
pub type Result<T> = std::result::Result<T, Error>;

/// The step of an operation that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
   Config,
   Connect,
   Ping,
   Precondition,
   Begin,
   Commit,
   Rollback,
   Bind,
   Statement,
   Timeout,
}

impl fmt::Display for Phase {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      let name = match self {
         Phase::Config => "Config",
         Phase::Connect => "Connect",
         Phase::Ping => "Ping",
         Phase::Precondition => "Precondition",
         Phase::Begin => "Begin",
         Phase::Commit => "Commit",
         Phase::Rollback => "Rollback",
         Phase::Bind => "Bind",
         Phase::Statement => "Statement",
         Phase::Timeout => "Timeout",
      };
      f.write_str(name)
   }
}

/// Error types for MySQL toolkit operations.
///
/// Errors returned from public operations are wrapped in [`Error::Failed`],
/// which names the operation and the phase that failed. Use [`Error::root`]
/// or the `is_*` predicates to look at the underlying cause.
#[derive(Debug, thiserror::Error)]
pub enum Error {
   /// Error from SQLx operations.
   #[error(transparent)]
   Sqlx(#[from] sqlx::Error),

   /// Error from the connection manager.
   #[error(transparent)]
   ConnectionManager(#[from] sqlx_mysql_conn_mgr::Error),

   /// The manager has no open pool.
   #[error("not connected")]
   NotConnected,

   /// The transaction has already been committed or rolled back.
   #[error("transaction already closed")]
   TransactionClosed,

   /// A transaction handle lost one of its parts.
   #[error("transaction is missing its {0}")]
   TransactionIncomplete(&'static str),

   /// The call did not finish within its timeout.
   #[error("timed out after {0:?}")]
   Timeout(Duration),

   /// MySQL type that cannot be mapped to JSON.
   #[error("unsupported datatype: {0}")]
   UnsupportedDatatype(String),

   /// A `:name` placeholder has no value.
   #[error("missing value for named parameter :{0}")]
   MissingNamedParameter(String),

   /// Named parameters were built from a value that is not a JSON object.
   #[error("named parameters must serialize to an object, got {0}")]
   InvalidNamedParameters(&'static str),

   /// Named parameters could not be serialized.
   #[error("failed to serialize named parameters: {0}")]
   Serialize(#[from] serde_json::Error),

   /// A scalar string query matched a row whose value is NULL.
   #[error("scalar query returned NULL")]
   UnexpectedNull,

   /// Generic error for operations that don't fit other categories.
   #[error("{0}")]
   Other(String),

   /// An operation failed during the given phase.
   #[error("{operation} Failed: ({phase}) {source}")]
   Failed {
      operation: &'static str,
      phase: Phase,
      #[source]
      source: Box<Error>,
   },
}

impl Error {
   /// Wrap this error with the operation and phase it occurred in.
   pub fn during(self, operation: &'static str, phase: Phase) -> Self {
      Error::Failed {
         operation,
         phase,
         source: Box::new(self),
      }
   }

   /// The innermost error, with every [`Error::Failed`] layer removed.
   pub fn root(&self) -> &Error {
      let mut current = self;
      while let Error::Failed { source, .. } = current {
         current = &**source;
      }
      current
   }

   /// The operation named by the outermost wrapper, if any.
   pub fn operation(&self) -> Option<&'static str> {
      match self {
         Error::Failed { operation, .. } => Some(*operation),
         _ => None,
      }
   }

   /// The phase named by the outermost wrapper, if any.
   pub fn phase(&self) -> Option<Phase> {
      match self {
         Error::Failed { phase, .. } => Some(*phase),
         _ => None,
      }
   }

   pub fn is_not_connected(&self) -> bool {
      matches!(self.root(), Error::NotConnected)
   }

   pub fn is_transaction_closed(&self) -> bool {
      matches!(self.root(), Error::TransactionClosed)
   }

   pub fn is_timeout(&self) -> bool {
      matches!(self.root(), Error::Timeout(_))
   }

   /// Extract a structured error code from the error type.
   ///
   /// This provides machine-readable error codes for error handling. Wrapped
   /// errors report the code of their cause.
   pub fn error_code(&self) -> String {
      match self {
         Error::Sqlx(e) => {
            if let Some(code) = e.as_database_error().and_then(|db_err| db_err.code()) {
               return format!("MYSQL_{}", code);
            }
            "SQLX_ERROR".to_string()
         }
         Error::ConnectionManager(e) => match e {
            sqlx_mysql_conn_mgr::Error::MissingField(_) => "MISSING_CONFIG".to_string(),
            sqlx_mysql_conn_mgr::Error::InvalidField { .. } => "INVALID_CONFIG".to_string(),
            sqlx_mysql_conn_mgr::Error::Sqlx(_) => "CONNECTION_ERROR".to_string(),
         },
         Error::NotConnected => "NOT_CONNECTED".to_string(),
         Error::TransactionClosed => "TRANSACTION_CLOSED".to_string(),
         Error::TransactionIncomplete(_) => "TRANSACTION_INCOMPLETE".to_string(),
         Error::Timeout(_) => "TIMEOUT".to_string(),
         Error::UnsupportedDatatype(_) => "UNSUPPORTED_DATATYPE".to_string(),
         Error::MissingNamedParameter(_) => "MISSING_NAMED_PARAMETER".to_string(),
         Error::InvalidNamedParameters(_) => "INVALID_NAMED_PARAMETERS".to_string(),
         Error::Serialize(_) => "SERIALIZE_ERROR".to_string(),
         Error::UnexpectedNull => "UNEXPECTED_NULL".to_string(),
         Error::Other(_) => "ERROR".to_string(),
         Error::Failed { source, .. } => source.error_code(),
      }
   }
}

/// Attach an operation and phase to any error convertible into [`Error`].
pub(crate) trait ResultExt<T> {
   fn during(self, operation: &'static str, phase: Phase) -> Result<T>;
}

impl<T, E: Into<Error>> ResultExt<T> for std::result::Result<T, E> {
   fn during(self, operation: &'static str, phase: Phase) -> Result<T> {
      self.map_err(|e| e.into().during(operation, phase))
   }
}
