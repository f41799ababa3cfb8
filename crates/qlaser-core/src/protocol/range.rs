//! Register field range checks

use serde::{Deserialize, Serialize};

use super::ProtocolError;
use crate::report::{Event, EventKind, ReportSink};

/// What to do when an encoded field does not fit its register width
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Strictness {
    /// Report a warning and transmit the truncated value
    #[default]
    Lenient,
    /// Fail with [`ProtocolError::OutOfRange`] before anything is sent
    Strict,
}

/// A field that was truncated on encode
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeViolation {
    pub field: String,
    pub value: i64,
    pub bound: i64,
}

impl RangeViolation {
    pub fn into_error(self) -> ProtocolError {
        ProtocolError::OutOfRange {
            field: self.field,
            value: self.value,
            bound: self.bound,
        }
    }
}

/// Collects violations while a group of fields is encoded
pub(crate) struct RangeChecker<'a> {
    strictness: Strictness,
    sink: &'a dyn ReportSink,
    context: String,
    violations: Vec<RangeViolation>,
}

impl<'a> RangeChecker<'a> {
    pub(crate) fn new(strictness: Strictness, sink: &'a dyn ReportSink, context: String) -> Self {
        Self {
            strictness,
            sink,
            context,
            violations: Vec::new(),
        }
    }

    /// Check `0 <= value <= bound`
    pub(crate) fn check(&mut self, field: &str, value: i64, bound: i64) -> Result<(), ProtocolError> {
        if (0..=bound).contains(&value) {
            return Ok(());
        }
        let violation = RangeViolation {
            field: format!("{}.{}", self.context, field),
            value,
            bound,
        };
        if self.strictness == Strictness::Strict {
            return Err(violation.into_error());
        }
        self.sink.report(Event::warning(EventKind::OutOfRange {
            field: violation.field.clone(),
            value,
            bound,
        }));
        self.violations.push(violation);
        Ok(())
    }

    pub(crate) fn finish(self) -> Vec<RangeViolation> {
        self.violations
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::MemorySink;

    #[test]
    fn test_lenient_records_and_reports() {
        let sink = MemorySink::new();
        let mut checker = RangeChecker::new(Strictness::Lenient, &sink, "entry[2]".into());
        checker.check("sustain", 10, 0x1FFFF).unwrap();
        checker.check("sustain", 0x20000, 0x1FFFF).unwrap();
        let violations = checker.finish();

        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].field, "entry[2].sustain");
        assert_eq!(sink.events().len(), 1);
    }

    #[test]
    fn test_strict_rejects() {
        let sink = MemorySink::new();
        let mut checker = RangeChecker::new(Strictness::Strict, &sink, "entry[0]".into());
        let err = checker.check("scale_gain", -1, 0xFFFF).unwrap_err();
        assert!(matches!(err, ProtocolError::OutOfRange { value: -1, .. }));
        assert!(sink.events().is_empty());
    }
}
