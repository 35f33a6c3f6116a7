//! Structured reporting for protocol anomalies.
//!
//! Most of what can go wrong on an unreliable transport is not an error for the
//! caller: a stray datagram, a stale sequence number or a peer that stopped
//! acknowledging input is dropped or handled locally. Those cases are still worth
//! seeing, so they are reported as [`ProtocolViolation`]s. By default a violation
//! is logged through `tracing`; sessions can also route them to a custom
//! [`ViolationObserver`] such as the [`CollectingObserver`] used by tests.
//!
//! ```
//! use rollback_netplay::telemetry::{CollectingObserver, ViolationKind};
//!
//! let observer = CollectingObserver::new();
//! assert!(!observer.has_violation(ViolationKind::NetworkProtocol));
//! ```

use crate::Frame;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;

mod frame_serializer {
    use crate::Frame;
    use serde::Serializer;

    #[allow(clippy::ref_option)]
    pub fn serialize<S>(frame: &Option<Frame>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match frame {
            Some(f) if f.is_valid() => serializer.serialize_i32(f.as_i32()),
            _ => serializer.serialize_none(),
        }
    }
}

/// How bad a violation is. Ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationSeverity {
    /// Unexpected but recoverable; the datagram or value was dropped.
    Warning,
    /// The session continues, but behaviour may be degraded.
    Error,
    /// An internal invariant is broken.
    Critical,
}

impl ViolationSeverity {
    /// Returns a string suitable for log fields and metric labels.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Critical => "critical",
        }
    }
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The subsystem a violation was detected in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum ViolationKind {
    /// Wire-level problems: undecodable payloads, stale sequence numbers,
    /// unexpected message kinds.
    NetworkProtocol,
    /// Failures reported by the host transport.
    Transport,
    /// Handshake trouble, such as excessive retries.
    Synchronization,
    /// Frame bookkeeping went out of order.
    FrameSync,
    /// Inconsistent configuration.
    Configuration,
    /// A bug in this crate.
    InternalError,
}

impl ViolationKind {
    /// Returns a string suitable for log fields and metric labels.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::NetworkProtocol => "network_protocol",
            Self::Transport => "transport",
            Self::Synchronization => "synchronization",
            Self::FrameSync => "frame_sync",
            Self::Configuration => "configuration",
            Self::InternalError => "internal_error",
        }
    }
}

impl std::fmt::Display for ViolationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single reported anomaly.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ProtocolViolation {
    /// Severity of the violation.
    pub severity: ViolationSeverity,
    /// Subsystem that reported it.
    pub kind: ViolationKind,
    /// Human-readable description.
    pub message: String,
    /// `file:line` of the report site.
    pub location: &'static str,
    /// The frame involved, if any. Serialized as `null` when absent.
    #[serde(serialize_with = "frame_serializer::serialize")]
    pub frame: Option<Frame>,
    /// Additional key/value context.
    pub context: BTreeMap<String, String>,
}

impl ProtocolViolation {
    /// Creates a violation without frame or context.
    #[must_use]
    pub fn new(
        severity: ViolationSeverity,
        kind: ViolationKind,
        message: impl Into<String>,
        location: &'static str,
    ) -> Self {
        Self {
            severity,
            kind,
            message: message.into(),
            location,
            frame: None,
            context: BTreeMap::new(),
        }
    }

    /// Attaches the frame the violation concerns.
    #[must_use]
    pub fn with_frame(mut self, frame: Frame) -> Self {
        self.frame = Some(frame);
        self
    }

    /// Adds a context entry.
    #[must_use]
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    /// Serializes the violation to JSON.
    #[cfg(feature = "json")]
    #[must_use]
    pub fn to_json(&self) -> Option<String> {
        serde_json::to_string(self).ok()
    }

    /// Serializes the violation to indented JSON.
    #[cfg(feature = "json")]
    #[must_use]
    pub fn to_json_pretty(&self) -> Option<String> {
        serde_json::to_string_pretty(self).ok()
    }
}

impl std::fmt::Display for ProtocolViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[{}/{}] {} (at {}",
            self.severity, self.kind, self.message, self.location
        )?;
        if let Some(frame) = self.frame {
            write!(f, ", frame={frame}")?;
        }
        if !self.context.is_empty() {
            write!(f, ", context={:?}", self.context)?;
        }
        write!(f, ")")
    }
}

/// Receives violations as they are reported.
#[cfg(feature = "sync-send")]
pub trait ViolationObserver: Send + Sync {
    /// Called once per reported violation. Keep it cheap; it runs inside the poll loop.
    fn on_violation(&self, violation: &ProtocolViolation);
}

/// Receives violations as they are reported.
#[cfg(not(feature = "sync-send"))]
pub trait ViolationObserver {
    /// Called once per reported violation. Keep it cheap; it runs inside the poll loop.
    fn on_violation(&self, violation: &ProtocolViolation);
}

/// Logs violations through `tracing`.
///
/// Warnings go to `tracing::warn!`, errors and critical violations to
/// `tracing::error!`, with `severity`, `kind`, `location` and `frame` as
/// structured fields.
#[derive(Debug, Default, Clone)]
pub struct TracingObserver;

impl TracingObserver {
    fn format_frame(frame: Option<Frame>) -> String {
        match frame {
            Some(f) if f.is_valid() => f.as_i32().to_string(),
            _ => "null".to_owned(),
        }
    }
}

impl ViolationObserver for TracingObserver {
    fn on_violation(&self, violation: &ProtocolViolation) {
        let severity = violation.severity.as_str();
        let kind = violation.kind.as_str();
        let location = violation.location;
        let frame = Self::format_frame(violation.frame);
        let context = format!("{:?}", violation.context);

        match violation.severity {
            ViolationSeverity::Warning => {
                tracing::warn!(severity, kind, location, frame = %frame, context = %context, "{}", violation.message);
            },
            ViolationSeverity::Error | ViolationSeverity::Critical => {
                tracing::error!(severity, kind, location, frame = %frame, context = %context, "{}", violation.message);
            },
        }
    }
}

/// Stores every violation it sees. Intended for tests.
#[derive(Debug, Default)]
pub struct CollectingObserver {
    violations: Mutex<Vec<ProtocolViolation>>,
}

impl CollectingObserver {
    /// Creates an empty observer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of everything collected so far.
    #[must_use]
    pub fn violations(&self) -> Vec<ProtocolViolation> {
        self.violations.lock().clone()
    }

    /// Number of collected violations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.violations.lock().len()
    }

    /// `true` if nothing has been collected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.violations.lock().is_empty()
    }

    /// `true` if at least one violation of `kind` was collected.
    #[must_use]
    pub fn has_violation(&self, kind: ViolationKind) -> bool {
        self.violations.lock().iter().any(|v| v.kind == kind)
    }

    /// Forgets everything collected so far.
    pub fn clear(&self) {
        self.violations.lock().clear();
    }
}

impl ViolationObserver for CollectingObserver {
    fn on_violation(&self, violation: &ProtocolViolation) {
        self.violations.lock().push(violation.clone());
    }
}

/// Hands `violation` to `observer`, or to the [`TracingObserver`] if there is none.
pub fn report_to_observer<O: ViolationObserver + ?Sized>(
    observer: Option<&Arc<O>>,
    violation: &ProtocolViolation,
) {
    match observer {
        Some(obs) => obs.on_violation(violation),
        None => TracingObserver.on_violation(violation),
    }
}

/// Reports a violation through the [`TracingObserver`].
///
/// ```text
/// report_violation!(severity, kind, "message");
/// report_violation!(severity, kind, "message with {}", args);
/// ```
#[macro_export]
macro_rules! report_violation {
    ($severity:expr, $kind:expr, $msg:literal) => {{
        use $crate::telemetry::ViolationObserver as _;
        let violation = $crate::telemetry::ProtocolViolation::new(
            $severity,
            $kind,
            $msg,
            concat!(file!(), ":", line!()),
        );
        $crate::telemetry::TracingObserver.on_violation(&violation);
    }};

    ($severity:expr, $kind:expr, $fmt:literal, $($arg:tt)+) => {{
        use $crate::telemetry::ViolationObserver as _;
        let violation = $crate::telemetry::ProtocolViolation::new(
            $severity,
            $kind,
            format!($fmt, $($arg)+),
            concat!(file!(), ":", line!()),
        );
        $crate::telemetry::TracingObserver.on_violation(&violation);
    }};
}

/// Reports a violation to an optional observer, falling back to tracing.
///
/// ```text
/// report_violation_to!(&observer, severity, kind, "message {}", args);
/// ```
#[macro_export]
macro_rules! report_violation_to {
    ($observer:expr, $severity:expr, $kind:expr, $msg:literal) => {{
        let violation = $crate::telemetry::ProtocolViolation::new(
            $severity,
            $kind,
            $msg,
            concat!(file!(), ":", line!()),
        );
        $crate::telemetry::report_to_observer($observer.as_ref(), &violation);
    }};

    ($observer:expr, $severity:expr, $kind:expr, $fmt:literal, $($arg:tt)+) => {{
        let violation = $crate::telemetry::ProtocolViolation::new(
            $severity,
            $kind,
            format!($fmt, $($arg)+),
            concat!(file!(), ":", line!()),
        );
        $crate::telemetry::report_to_observer($observer.as_ref(), &violation);
    }};
}

#[cfg(test)]
#[allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;

    fn sample() -> ProtocolViolation {
        ProtocolViolation::new(
            ViolationSeverity::Warning,
            ViolationKind::NetworkProtocol,
            "stale sequence",
            "test.rs:1",
        )
    }

    #[test]
    fn severities_are_ordered() {
        assert!(ViolationSeverity::Warning < ViolationSeverity::Error);
        assert!(ViolationSeverity::Error < ViolationSeverity::Critical);
    }

    #[test]
    fn display_includes_frame_and_context() {
        let v = sample()
            .with_frame(Frame::new(12))
            .with_context("peer", "7");
        let text = v.to_string();
        assert!(text.contains("warning/network_protocol"));
        assert!(text.contains("frame=12"));
        assert!(text.contains("peer"));
    }

    #[test]
    fn collecting_observer_collects_and_clears() {
        let observer = CollectingObserver::new();
        observer.on_violation(&sample());
        assert_eq!(observer.len(), 1);
        assert!(observer.has_violation(ViolationKind::NetworkProtocol));
        assert!(!observer.has_violation(ViolationKind::Transport));
        observer.clear();
        assert!(observer.is_empty());
    }

    #[test]
    fn report_to_observer_prefers_the_given_observer() {
        let observer = Arc::new(CollectingObserver::new());
        report_to_observer(Some(&observer), &sample());
        report_to_observer(None::<&Arc<CollectingObserver>>, &sample());
        assert_eq!(observer.len(), 1);
    }

    #[test]
    fn report_violation_to_macro_routes_to_observer() {
        let collecting = Arc::new(CollectingObserver::new());
        let observer: Option<Arc<dyn ViolationObserver>> = Some(collecting.clone());
        report_violation_to!(
            &observer,
            ViolationSeverity::Error,
            ViolationKind::Transport,
            "send failed: {}",
            "refused"
        );
        let collected = collecting.violations();
        assert_eq!(collected.len(), 1);
        assert_eq!(collected[0].message, "send failed: refused");
        assert!(collected[0].location.contains("telemetry.rs"));
    }

    #[cfg(feature = "json")]
    #[test]
    fn json_uses_null_for_missing_frame() {
        let json = sample().to_json().unwrap();
        assert!(json.contains(r#""frame":null"#));
        assert!(json.contains(r#""kind":"network_protocol""#));
    }
}
