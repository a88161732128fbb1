//! Telemetry
//!
//! A narrow publish surface: the core emits named events with
//! measurements and metadata, and never subscribes. The default sink
//! logs through tracing; tests swap in a recording sink.

use std::sync::{Arc, Mutex};

use serde_json::Value;

/// Receives emitted events.
pub trait TelemetrySink: Send + Sync {
    /// Handle one event.
    fn emit(&self, event: &str, measurements: &Value, metadata: &Value);
}

/// Default sink: structured debug logging.
pub struct TracingSink;

impl TelemetrySink for TracingSink {
    fn emit(&self, event: &str, measurements: &Value, metadata: &Value) {
        tracing::debug!(event, %measurements, %metadata, "telemetry");
    }
}

/// A captured telemetry event.
#[derive(Debug, Clone)]
pub struct CapturedEvent {
    /// Event name
    pub event: String,
    /// Numeric measurements
    pub measurements: Value,
    /// Identifying metadata
    pub metadata: Value,
}

/// Sink that records every event, for assertions in tests.
#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<CapturedEvent>>,
}

impl RecordingSink {
    /// Snapshot the captured events.
    pub fn events(&self) -> Vec<CapturedEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    /// Count events with the given name.
    pub fn count(&self, event: &str) -> usize {
        self.events().iter().filter(|e| e.event == event).count()
    }
}

impl TelemetrySink for RecordingSink {
    fn emit(&self, event: &str, measurements: &Value, metadata: &Value) {
        if let Ok(mut events) = self.events.lock() {
            events.push(CapturedEvent {
                event: event.to_string(),
                measurements: measurements.clone(),
                metadata: metadata.clone(),
            });
        }
    }
}

/// Clone-able handle the components emit through.
#[derive(Clone)]
pub struct Telemetry {
    sink: Arc<dyn TelemetrySink>,
}

impl Default for Telemetry {
    fn default() -> Self {
        Self::new(Arc::new(TracingSink))
    }
}

impl Telemetry {
    /// Create with an explicit sink.
    pub fn new(sink: Arc<dyn TelemetrySink>) -> Self {
        Self { sink }
    }

    /// Publish one event.
    pub fn emit(&self, event: &str, measurements: Value, metadata: Value) {
        self.sink.emit(event, &measurements, &metadata);
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_recording_sink_captures() {
        let sink = Arc::new(RecordingSink::default());
        let telemetry = Telemetry::new(sink.clone());

        telemetry.emit("stored", json!({"count": 1}), json!({"id": "abc"}));
        telemetry.emit("stored", json!({"count": 1}), json!({"id": "def"}));
        telemetry.emit("cycle", json!({"duration_ms": 12}), json!({}));

        assert_eq!(sink.count("stored"), 2);
        assert_eq!(sink.count("cycle"), 1);
        assert_eq!(sink.events()[0].metadata["id"], "abc");
    }
}
