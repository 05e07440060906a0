//! Scoped capture of tracing events. Diagnostic (sandbox) authentication
//! paths run real verification logic but need its log output returned to the
//! caller instead of written to the normal pipeline.

use std::fmt::Write as _;
use std::sync::{Arc, Mutex};

use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::{Context, Layer};
use tracing_subscriber::prelude::*;
use tracing_subscriber::Registry;

/// A shared buffer of rendered log lines. Cloning is cheap and all clones
/// observe the same buffer.
#[derive(Debug, Clone, Default)]
pub struct LogCapture {
    buf: Arc<Mutex<Vec<String>>>,
}

impl LogCapture {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` with every tracing event on this thread redirected into this
    /// buffer. The previous subscriber is restored when the internal guard
    /// drops, even if `f` panics.
    pub fn scoped<T>(&self, f: impl FnOnce() -> T) -> T {
        let subscriber = Registry::default().with(CaptureLayer {
            buf: self.buf.clone(),
        });
        tracing::subscriber::with_default(subscriber, f)
    }

    pub fn lines(&self) -> Vec<String> {
        self.buf.lock().map(|buf| buf.clone()).unwrap_or_default()
    }
}

struct CaptureLayer {
    buf: Arc<Mutex<Vec<String>>>,
}

impl<S: Subscriber> Layer<S> for CaptureLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = LineVisitor::default();
        event.record(&mut visitor);
        let meta = event.metadata();
        let line = format!("{} {}: {}", meta.level(), meta.target(), visitor.line);
        if let Ok(mut buf) = self.buf.lock() {
            buf.push(line);
        }
    }
}

#[derive(Default)]
struct LineVisitor {
    line: String,
}

impl Visit for LineVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if !self.line.is_empty() {
            self.line.push(' ');
        }
        if field.name() == "message" {
            let _ = write!(self.line, "{:?}", value);
        } else {
            let _ = write!(self.line, "{}={:?}", field.name(), value);
        }
    }
}
