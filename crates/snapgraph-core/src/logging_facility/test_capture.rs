//! In-memory event capture for log assertions in tests
//!
//! A single process-wide layer records every event with its fields rendered
//! as strings. Session and commit tests query it by operation name, which
//! keeps tests in one binary from seeing each other's boundaries.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::Layer;

use snapgraph_core_types::schema::{FIELD_COMPONENT, FIELD_EVENT, FIELD_OP};

/// One recorded event
#[derive(Clone, Debug)]
pub struct CapturedEvent {
    pub level: Level,
    pub component: Option<String>,
    pub op: Option<String>,
    pub event: Option<String>,
    /// Every field, `message` included, rendered as a string
    pub fields: HashMap<String, String>,
}

impl CapturedEvent {
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }

    /// Whether this is the `event` boundary of operation `op`
    pub fn is_boundary(&self, op: &str, event: &str) -> bool {
        self.op.as_deref() == Some(op) && self.event.as_deref() == Some(event)
    }
}

struct FieldRecorder<'a>(&'a mut HashMap<String, String>);

impl Visit for FieldRecorder<'_> {
    // integers and bools reach here through the default impls
    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        self.0.insert(field.name().to_string(), format!("{:?}", value));
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.0.insert(field.name().to_string(), value.to_string());
    }
}

type Buffer = Arc<Mutex<Vec<CapturedEvent>>>;

/// Layer appending every event to a shared buffer
pub struct TestCaptureLayer {
    buffer: Buffer,
}

impl TestCaptureLayer {
    pub fn new() -> (Self, TestCapture) {
        let buffer = Buffer::default();
        (
            Self {
                buffer: Arc::clone(&buffer),
            },
            TestCapture { buffer },
        )
    }
}

impl<S> Layer<S> for TestCaptureLayer
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut fields = HashMap::new();
        event.record(&mut FieldRecorder(&mut fields));
        self.buffer.lock().push(CapturedEvent {
            level: *event.metadata().level(),
            component: fields.get(FIELD_COMPONENT).cloned(),
            op: fields.get(FIELD_OP).cloned(),
            event: fields.get(FIELD_EVENT).cloned(),
            fields,
        });
    }
}

/// Read side of the capture buffer
#[derive(Clone)]
pub struct TestCapture {
    buffer: Buffer,
}

impl TestCapture {
    pub fn events(&self) -> Vec<CapturedEvent> {
        self.buffer.lock().clone()
    }

    /// Events logged under operation name `op`, in emission order
    pub fn events_for_op(&self, op: &str) -> Vec<CapturedEvent> {
        self.buffer
            .lock()
            .iter()
            .filter(|e| e.op.as_deref() == Some(op))
            .cloned()
            .collect()
    }

    /// Number of `event` boundaries (`start`, `end`, `end_error`) logged for `op`
    pub fn boundary_count(&self, op: &str, event: &str) -> usize {
        self.buffer
            .lock()
            .iter()
            .filter(|e| e.is_boundary(op, event))
            .count()
    }

    /// # Panics
    ///
    /// Panics when no `event` boundary was logged for `op`.
    pub fn assert_event_exists(&self, op: &str, event: &str) {
        let seen = self.boundary_count(op, event);
        assert!(
            seen > 0,
            "no {} event for op {} among {} captured events",
            event,
            op,
            self.buffer.lock().len()
        );
    }

    pub fn clear(&self) {
        self.buffer.lock().clear();
    }
}

static GLOBAL_CAPTURE: OnceLock<TestCapture> = OnceLock::new();

/// Install the capture subscriber (first call only) and return its handle
///
/// # Example
///
/// ```
/// use snapgraph_core::logging_facility::test_capture::init_test_capture;
/// use snapgraph_core::log_op_start;
///
/// let capture = init_test_capture();
/// log_op_start!("doc_example_op");
/// capture.assert_event_exists("doc_example_op", "start");
/// ```
pub fn init_test_capture() -> TestCapture {
    GLOBAL_CAPTURE
        .get_or_init(|| {
            let (layer, capture) = TestCaptureLayer::new();
            tracing_subscriber::registry().with(layer).init();
            capture
        })
        .clone()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_boundary_matching() {
        let event = CapturedEvent {
            level: Level::INFO,
            component: None,
            op: Some("commit".to_string()),
            event: Some("start".to_string()),
            fields: HashMap::from([("session_id".to_string(), "s1".to_string())]),
        };

        assert!(event.is_boundary("commit", "start"));
        assert!(!event.is_boundary("commit", "end"));
        assert!(!event.is_boundary("select", "start"));
        assert_eq!(event.field("session_id"), Some("s1"));
    }

    #[test]
    fn test_local_layer_records_fields() {
        let (layer, capture) = TestCaptureLayer::new();
        let subscriber = tracing_subscriber::registry().with(layer);

        tracing::subscriber::with_default(subscriber, || {
            tracing::info!(op = "flush", event = "end", entry_count = 3u64, "done");
        });

        assert_eq!(capture.boundary_count("flush", "end"), 1);
        let events = capture.events_for_op("flush");
        assert_eq!(events[0].field("entry_count"), Some("3"));
        capture.clear();
        assert!(capture.events().is_empty());
    }
}
