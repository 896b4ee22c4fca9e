//! Telemetry utilities for pipeline timing and trace correlation.

use std::time::Instant;

/// Guard for timing the processing of one input record.
///
/// Records pipeline latency when dropped, so every exit path of the
/// handler is measured.
pub struct PipelineTimer {
    kind: &'static str,
    start: Instant,
}

impl PipelineTimer {
    /// Start timing a record of the given kind.
    pub fn new(kind: &'static str) -> Self {
        Self {
            kind,
            start: Instant::now(),
        }
    }
}

impl Drop for PipelineTimer {
    fn drop(&mut self) {
        let duration = self.start.elapsed().as_secs_f64();
        crate::metrics::record_processed(self.kind, duration);
    }
}

/// Standardized span constructors for pipeline observability.
#[allow(dead_code)]
pub mod spans {
    use tracing::{Span, info_span};

    /// Create a span for one consumed partition.
    pub fn partition(topic: &str, partition: u32) -> Span {
        info_span!("partition", topic = %topic, partition = partition)
    }

    /// Create a span for one input record.
    pub fn record(kind: &str, offset: i64) -> Span {
        info_span!("record", kind = %kind, offset = offset)
    }

    /// Create a span for work on a specific room.
    pub fn room(room_id: &str) -> Span {
        info_span!("room", room_id = %room_id)
    }
}
