#![allow(dead_code, clippy::expect_used)]

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::fmt::Debug;
use std::sync::Arc;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::Layer;

/// One captured log event
#[derive(Debug, Clone)]
pub struct CapturedEvent {
    pub level: Level,
    pub message: String,
    pub fields: Vec<(String, String)>,
}

impl CapturedEvent {
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }
}

#[derive(Default)]
struct FieldVisitor {
    message: String,
    fields: Vec<(String, String)>,
}

impl Visit for FieldVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        } else {
            self.fields.push((field.name().to_string(), value.to_string()));
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn Debug) {
        let rendered = format!("{value:?}");
        if field.name() == "message" {
            self.message = rendered;
        } else {
            self.fields.push((field.name().to_string(), rendered));
        }
    }
}

struct CaptureLayer {
    events: Arc<Mutex<Vec<CapturedEvent>>>,
}

impl<S: Subscriber> Layer<S> for CaptureLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = FieldVisitor::default();
        event.record(&mut visitor);
        self.events.lock().push(CapturedEvent {
            level: *event.metadata().level(),
            message: visitor.message,
            fields: visitor.fields,
        });
    }
}

/// Process-wide log capture.
///
/// Consumer threads log outside the test thread, so the subscriber is
/// installed globally once per test binary. Tests running in parallel share
/// it; filter on a field unique to the test (e.g. its request type).
pub struct TestTracing {
    events: Arc<Mutex<Vec<CapturedEvent>>>,
}

static CAPTURE: Lazy<TestTracing> = Lazy::new(|| {
    let events = Arc::new(Mutex::new(Vec::new()));
    let subscriber = tracing_subscriber::registry().with(CaptureLayer {
        events: Arc::clone(&events),
    });
    tracing::subscriber::set_global_default(subscriber).expect("install test subscriber");
    TestTracing { events }
});

impl TestTracing {
    pub fn init() -> &'static TestTracing {
        &CAPTURE
    }

    /// Events at `level` whose `field` contains `needle`
    pub fn matching(&self, level: Level, field: &str, needle: &str) -> Vec<CapturedEvent> {
        self.events
            .lock()
            .iter()
            .filter(|event| event.level == level)
            .filter(|event| event.field(field).is_some_and(|value| value.contains(needle)))
            .cloned()
            .collect()
    }
}
