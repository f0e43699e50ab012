//! Reporting of analyzer output events.
//!
//! A reporter only formats and writes; [`ReporterListener`] subscribes it
//! to whichever event definitions should be shown.

mod console_reporter;

pub use console_reporter::ConsoleReporter;

use std::sync::Arc;

use crate::error::ListenerError;
use crate::event::{Event, EventContext, EventListener};

pub trait EventReporter: Send + Sync {
    fn report(&self, event: &Event);

    /// Called when capture starts on `source`.
    fn on_start(&self, source: &str);

    fn on_stop(&self);
}

/// Adapts a reporter to the event bus.
pub struct ReporterListener {
    reporter: Arc<dyn EventReporter>,
}

impl ReporterListener {
    pub fn new(reporter: Arc<dyn EventReporter>) -> Self {
        Self { reporter }
    }
}

impl EventListener for ReporterListener {
    fn name(&self) -> &str {
        "reporter"
    }

    fn on_event(&self, event: &Event, _cx: &mut EventContext<'_>) -> Result<(), ListenerError> {
        self.reporter.report(event);
        Ok(())
    }
}
