//! Optional distributed-tracing segments.
//!
//! A [`Tracer`] opens a [`Segment`] around every operation. Segments only
//! record what happened: a disabled or absent tracer leaves control flow and
//! return values untouched.
//!
//! [`SpanTracer`] is the built-in implementation, which maps segments onto
//! `tracing` spans. Other backends plug in by implementing the two traits.

use std::future::Future;
use std::time::{Duration, Instant};

use serde_json::Value as JsonValue;
use tracing::{Span, debug, trace};
use uuid::Uuid;

use crate::error::Phase;
use crate::{Error, Result};

/// Identifies a segment so that child segments can be attached to it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SegmentContext {
   pub trace_id: String,
   pub segment_id: String,
}

/// An open trace segment.
pub trait Segment: Send {
   /// Context for attaching child segments.
   fn context(&self) -> SegmentContext;

   fn add_metadata(&mut self, key: &str, value: JsonValue);

   fn add_error(&mut self, error: &Error);

   /// Finish the segment.
   fn close(self: Box<Self>);
}

/// Source of trace segments.
pub trait Tracer: Send + Sync {
   fn is_enabled(&self) -> bool;

   /// Open a segment, as a child of `parent` when given.
   fn begin_segment(&self, name: &str, parent: Option<&SegmentContext>) -> Box<dyn Segment>;
}

/// [`Tracer`] backed by `tracing` spans.
///
/// Sub-segments inherit their parent's trace id. Segment events are emitted
/// at debug and trace level inside the segment's span.
#[derive(Debug, Clone)]
pub struct SpanTracer {
   enabled: bool,
}

impl SpanTracer {
   pub fn new() -> Self {
      Self { enabled: true }
   }

   /// A tracer that never opens segments.
   pub fn disabled() -> Self {
      Self { enabled: false }
   }
}

impl Default for SpanTracer {
   fn default() -> Self {
      Self::new()
   }
}

impl Tracer for SpanTracer {
   fn is_enabled(&self) -> bool {
      self.enabled
   }

   fn begin_segment(&self, name: &str, parent: Option<&SegmentContext>) -> Box<dyn Segment> {
      let context = SegmentContext {
         trace_id: parent
            .map(|p| p.trace_id.clone())
            .unwrap_or_else(|| Uuid::now_v7().simple().to_string()),
         segment_id: Uuid::new_v4().simple().to_string(),
      };

      let span = tracing::debug_span!(
         "segment",
         name = %name,
         trace_id = %context.trace_id,
         segment_id = %context.segment_id,
         parent_id = parent.map(|p| p.segment_id.as_str()),
      );

      Box::new(SpanSegment {
         span,
         context,
         started: Instant::now(),
      })
   }
}

struct SpanSegment {
   span: Span,
   context: SegmentContext,
   started: Instant,
}

impl Segment for SpanSegment {
   fn context(&self) -> SegmentContext {
      self.context.clone()
   }

   fn add_metadata(&mut self, key: &str, value: JsonValue) {
      self
         .span
         .in_scope(|| trace!(%key, %value, "segment metadata"));
   }

   fn add_error(&mut self, error: &Error) {
      self
         .span
         .in_scope(|| debug!(error = %error, code = %error.error_code(), "segment error"));
   }

   fn close(self: Box<Self>) {
      let elapsed_ms = self.started.elapsed().as_millis() as u64;
      self.span.in_scope(|| debug!(elapsed_ms, "segment closed"));
   }
}

/// Open a segment if a tracer is present and enabled.
pub(crate) fn begin_segment(
   tracer: Option<&dyn Tracer>,
   name: &str,
   parent: Option<&SegmentContext>,
) -> Option<Box<dyn Segment>> {
   tracer
      .filter(|t| t.is_enabled())
      .map(|t| t.begin_segment(name, parent))
}

/// One traced, optionally time-bounded operation.
pub(crate) struct Call<'a> {
   tracer: Option<&'a dyn Tracer>,
   operation: &'static str,
   parent: Option<SegmentContext>,
   timeout: Option<Duration>,
}

impl<'a> Call<'a> {
   pub(crate) fn new(
      tracer: Option<&'a dyn Tracer>,
      operation: &'static str,
      parent: Option<SegmentContext>,
      timeout: Option<Duration>,
   ) -> Self {
      Self {
         tracer,
         operation,
         parent,
         timeout,
      }
   }

   /// Drive `fut` to completion inside a segment named `MySql-<operation>`.
   ///
   /// The segment records `statement` and any error, and is closed before
   /// the result is returned.
   pub(crate) async fn run<T, F>(self, statement: Option<&str>, fut: F) -> Result<T>
   where
      F: Future<Output = Result<T>>,
   {
      let name = format!("MySql-{}", self.operation);
      let mut segment = begin_segment(self.tracer, &name, self.parent.as_ref());

      if let (Some(segment), Some(sql)) = (segment.as_mut(), statement) {
         segment.add_metadata("sql", JsonValue::String(sql.to_string()));
      }

      let result = match self.timeout {
         Some(limit) => match tokio::time::timeout(limit, fut).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout(limit).during(self.operation, Phase::Timeout)),
         },
         None => fut.await,
      };

      if let Some(mut segment) = segment {
         if let Err(e) = &result {
            segment.add_error(e);
         }
         segment.close();
      }

      result
   }
}

#[cfg(test)]
pub(crate) mod testing {
   use std::sync::Arc;

   use parking_lot::Mutex;

   use super::*;

   /// Tracer that records every segment event as a line of text.
   #[derive(Clone, Default)]
   pub(crate) struct RecordingTracer {
      pub(crate) enabled: bool,
      pub(crate) events: Arc<Mutex<Vec<String>>>,
   }

   impl RecordingTracer {
      pub(crate) fn enabled() -> Self {
         Self {
            enabled: true,
            events: Arc::default(),
         }
      }

      pub(crate) fn events(&self) -> Vec<String> {
         self.events.lock().clone()
      }
   }

   struct RecordingSegment {
      name: String,
      context: SegmentContext,
      events: Arc<Mutex<Vec<String>>>,
   }

   impl Tracer for RecordingTracer {
      fn is_enabled(&self) -> bool {
         self.enabled
      }

      fn begin_segment(&self, name: &str, parent: Option<&SegmentContext>) -> Box<dyn Segment> {
         let parent_id = parent.map_or("-", |p| p.segment_id.as_str());
         self
            .events
            .lock()
            .push(format!("begin {} parent={}", name, parent_id));

         Box::new(RecordingSegment {
            name: name.to_string(),
            context: SegmentContext {
               trace_id: "trace".into(),
               segment_id: name.to_string(),
            },
            events: Arc::clone(&self.events),
         })
      }
   }

   impl Segment for RecordingSegment {
      fn context(&self) -> SegmentContext {
         self.context.clone()
      }

      fn add_metadata(&mut self, key: &str, value: JsonValue) {
         self
            .events
            .lock()
            .push(format!("metadata {} {}={}", self.name, key, value));
      }

      fn add_error(&mut self, error: &Error) {
         self
            .events
            .lock()
            .push(format!("error {} {}", self.name, error.error_code()));
      }

      fn close(self: Box<Self>) {
         self.events.lock().push(format!("close {}", self.name));
      }
   }
}
