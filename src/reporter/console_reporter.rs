//! Console-based event reporter.

use std::io::{self, Write};

use crate::event::{Event, Value};
use crate::reporter::EventReporter;

const BOLD_CYAN: &str = "\x1b[1;36m";
const RESET: &str = "\x1b[0m";

/// Writes one line per event to stdout:
/// `[NAME] field=value | field=value`.
pub struct ConsoleReporter {
    use_colors: bool,
    /// Print byte fields as hex instead of their length.
    verbose: bool,
}

impl ConsoleReporter {
    pub fn new() -> Self {
        Self {
            use_colors: true,
            verbose: false,
        }
    }

    pub fn with_colors(mut self, use_colors: bool) -> Self {
        self.use_colors = use_colors;
        self
    }

    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    fn format_value(&self, value: &Value) -> String {
        match value {
            Value::Bytes(bytes) if self.verbose => {
                bytes.iter().map(|b| format!("{:02x}", b)).collect()
            }
            Value::Bytes(bytes) => format!("<{} bytes>", bytes.len()),
            other => other.to_string(),
        }
    }

    fn format_event(&self, event: &Event) -> String {
        let tag = event.name().to_uppercase();
        let mut output = if self.use_colors {
            format!("{}[{}]{}", BOLD_CYAN, tag, RESET)
        } else {
            format!("[{}]", tag)
        };

        let fields: Vec<String> = event
            .fields()
            .filter_map(|(spec, value)| {
                value.map(|value| format!("{}={}", spec.name, self.format_value(value)))
            })
            .collect();
        if !fields.is_empty() {
            output.push(' ');
            output.push_str(&fields.join(" | "));
        }
        output
    }
}

impl Default for ConsoleReporter {
    fn default() -> Self {
        Self::new()
    }
}

impl EventReporter for ConsoleReporter {
    fn report(&self, event: &Event) {
        let output = self.format_event(event);
        let mut stdout = io::stdout().lock();
        let _ = writeln!(stdout, "{}", output);
    }

    fn on_start(&self, source: &str) {
        println!("Capturing on: {}", source);
        println!("Press Ctrl+C to stop.\n");
    }

    fn on_stop(&self) {
        println!("\nStopping capture.");
    }
}
