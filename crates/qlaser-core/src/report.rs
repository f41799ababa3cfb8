//! Structured event reporting
//!
//! Non-fatal conditions (clamps, truncated register fields, device error
//! lines) are delivered as [`Event`] values to an injected [`ReportSink`]
//! rather than written straight to a logger.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Mutex;

/// Event severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Severity {
    Debug,
    Info,
    Warning,
    Error,
}

/// What happened
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EventKind {
    /// An input value was clamped into its valid range before use
    Clamped {
        field: String,
        value: f64,
        bound: f64,
    },
    /// An encoded register field does not fit its width and was truncated
    OutOfRange {
        field: String,
        value: i64,
        bound: i64,
    },
    /// Entry 0 start time was raised to the profile minimum
    StartTimeRaised { requested: u32, minimum: u32 },
    /// No empty pulse-definition slot; slot 0 will be overwritten
    SlotWrapped { slots: u16 },
    /// A device line carried the error marker
    DeviceError(String),
    /// Unsolicited device output drained between commands
    DeviceOutput(String),
    /// Free-form progress note
    Note(String),
}

/// A reported event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub severity: Severity,
    pub kind: EventKind,
}

impl Event {
    pub fn new(severity: Severity, kind: EventKind) -> Self {
        Self { severity, kind }
    }

    pub fn warning(kind: EventKind) -> Self {
        Self::new(Severity::Warning, kind)
    }

    pub fn info(kind: EventKind) -> Self {
        Self::new(Severity::Info, kind)
    }

    pub fn debug(kind: EventKind) -> Self {
        Self::new(Severity::Debug, kind)
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventKind::Clamped {
                field,
                value,
                bound,
            } => write!(f, "{field} = {value} clamped to {bound}"),
            EventKind::OutOfRange {
                field,
                value,
                bound,
            } => write!(f, "{field} = {value} exceeds {bound}, truncated"),
            EventKind::StartTimeRaised { requested, minimum } => write!(
                f,
                "start_time = {requested} below minimum {minimum}, using {minimum}"
            ),
            EventKind::SlotWrapped { slots } => write!(
                f,
                "all {slots} pulse definition slots in use, overwriting slot 0"
            ),
            EventKind::DeviceError(line) => write!(f, "device error: {line}"),
            EventKind::DeviceOutput(line) => write!(f, "device: {line}"),
            EventKind::Note(text) => f.write_str(text),
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.kind.fmt(f)
    }
}

/// Consumer of reported events
pub trait ReportSink: Send + Sync {
    fn report(&self, event: Event);
}

/// Forwards events to `tracing` at the matching level
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl ReportSink for TracingSink {
    fn report(&self, event: Event) {
        match event.severity {
            Severity::Debug => tracing::debug!("{}", event),
            Severity::Info => tracing::info!("{}", event),
            Severity::Warning => tracing::warn!("{}", event),
            Severity::Error => tracing::error!("{}", event),
        }
    }
}

/// Discards everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl ReportSink for NullSink {
    fn report(&self, _event: Event) {}
}

/// Records events in memory
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<Event>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything recorded so far
    pub fn events(&self) -> Vec<Event> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    /// Events at or above `severity`
    pub fn at_least(&self, severity: Severity) -> Vec<Event> {
        self.events()
            .into_iter()
            .filter(|e| e.severity >= severity)
            .collect()
    }

    pub fn clear(&self) {
        if let Ok(mut events) = self.events.lock() {
            events.clear();
        }
    }
}

impl ReportSink for MemorySink {
    fn report(&self, event: Event) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}
