//! The beacon facade: structured log emissions become Log events on the
//! bus, and sinks subscribe to them. The default sink bridges to
//! `tracing`, so beacon output shows up alongside the crawler's own
//! diagnostics.

use bitscrape_event::{AdapterTokens, EventAdapter, EventBus, EventSender};
use bitscrape_types::{Event, EventPayload, EventTag, LogRecord, Severity};

/// Publishing side: subsystems emit; sinks decide what to do with it.
#[derive(Clone)]
pub struct Beacon {
    sender: EventSender,
}

impl Beacon {
    pub fn new(sender: EventSender) -> Self {
        Beacon { sender }
    }

    pub fn emit(
        &self,
        severity: Severity,
        category: &'static str,
        message: impl Into<String>,
        location: &'static str,
    ) {
        self.sender.publish(Event::new(EventPayload::Log(LogRecord {
            severity,
            category,
            message: message.into(),
            location,
        })));
    }
}

/// Emits at the caller's module path.
#[macro_export]
macro_rules! beacon_emit {
    ($beacon:expr, $severity:expr, $category:expr, $($arg:tt)*) => {
        $beacon.emit($severity, $category, format!($($arg)*), module_path!())
    };
}

/// Sink adapter forwarding Log events to `tracing`.
#[derive(Default)]
pub struct TracingSink {
    tokens: AdapterTokens,
}

impl TracingSink {
    pub fn new() -> Self {
        Self::default()
    }
}

impl EventAdapter for TracingSink {
    fn name(&self) -> &'static str {
        "beacon-tracing-sink"
    }

    fn connect(&mut self, bus: &EventBus) {
        if self.tokens.is_connected() {
            return;
        }
        self.tokens
            .record(bus.subscribe_tag(EventTag::Log, |event| {
                let EventPayload::Log(record) = &event.payload else {
                    return;
                };
                let LogRecord {
                    severity,
                    category,
                    message,
                    location,
                } = record;
                match severity {
                    Severity::Debug => {
                        tracing::debug!(category, location, "{message}")
                    }
                    Severity::Info => tracing::info!(category, location, "{message}"),
                    Severity::Warning => {
                        tracing::warn!(category, location, "{message}")
                    }
                    Severity::Error | Severity::Critical => {
                        tracing::error!(category, location, "{message}")
                    }
                }
            }));
    }

    fn disconnect(&mut self, bus: &EventBus) {
        self.tokens.disconnect_all(bus);
    }

    fn is_connected(&self) -> bool {
        self.tokens.is_connected()
    }
}
