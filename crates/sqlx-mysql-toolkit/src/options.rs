//! Per-call options accepted by every public operation.

use std::time::Duration;

use crate::trace::SegmentContext;

/// Options for a single call.
///
/// # Examples
///
/// ```
/// use sqlx_mysql_toolkit::CallOptions;
/// use std::time::Duration;
///
/// let options = CallOptions::new().with_timeout(Duration::from_secs(2));
/// assert_eq!(options.timeout, Some(Duration::from_secs(2)));
/// ```
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
   /// Bound the whole call, including the liveness check.
   ///
   /// When the deadline passes the in-flight future is dropped, which
   /// cancels the statement on the client side.
   pub timeout: Option<Duration>,

   /// Attach the call's trace segment to this parent.
   pub trace_parent: Option<SegmentContext>,
}

impl CallOptions {
   pub fn new() -> Self {
      Self::default()
   }

   pub fn with_timeout(mut self, timeout: Duration) -> Self {
      self.timeout = Some(timeout);
      self
   }

   pub fn with_trace_parent(mut self, parent: SegmentContext) -> Self {
      self.trace_parent = Some(parent);
      self
   }
}
