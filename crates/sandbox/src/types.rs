use serde::{Deserialize, Serialize};

/// Timeout applied when a request does not carry one.
pub const DEFAULT_TIMEOUT_MS: u64 = 3000;

fn default_timeout_ms() -> u64 {
    DEFAULT_TIMEOUT_MS
}

/// A single code submission, as sent from the host to a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionRequest {
    pub id: String,
    pub code: String,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub instrument: bool,
}

impl ExecutionRequest {
    pub fn new(id: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            code: code.into(),
            timeout_ms: DEFAULT_TIMEOUT_MS,
            instrument: false,
        }
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    pub fn with_instrument(mut self, instrument: bool) -> Self {
        self.instrument = instrument;
        self
    }
}

/// Console method a log entry was emitted through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogKind {
    Log,
    Warn,
    Error,
    Info,
}

impl LogKind {
    pub const ALL: [LogKind; 4] = [Self::Log, Self::Warn, Self::Error, Self::Info];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Log => "log",
            Self::Warn => "warn",
            Self::Error => "error",
            Self::Info => "info",
        }
    }
}

impl std::fmt::Display for LogKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One console call made by user code.
///
/// `timestamp_ms` is measured from the start of the run on a monotonic clock.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    #[serde(rename = "type")]
    pub kind: LogKind,
    #[serde(rename = "content")]
    pub text: String,
    #[serde(rename = "timestamp")]
    pub timestamp_ms: f64,
}

/// One instrumented statement reached during a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "WireTraceEvent", into = "WireTraceEvent")]
pub struct TraceEvent {
    pub timestamp_ms: f64,
    /// 1-indexed line in the submitted source.
    pub line: u32,
    pub snippet: String,
}

#[derive(Serialize, Deserialize)]
struct TraceData {
    line: u32,
}

/// `{ t, label, data: { line } }` as consumed by the debugger and profiler views.
#[derive(Serialize, Deserialize)]
struct WireTraceEvent {
    t: f64,
    label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    data: Option<TraceData>,
}

impl From<WireTraceEvent> for TraceEvent {
    fn from(wire: WireTraceEvent) -> Self {
        Self {
            timestamp_ms: wire.t,
            line: wire.data.map(|d| d.line).unwrap_or_default(),
            snippet: wire.label,
        }
    }
}

impl From<TraceEvent> for WireTraceEvent {
    fn from(event: TraceEvent) -> Self {
        Self {
            t: event.timestamp_ms,
            label: event.snippet,
            data: Some(TraceData { line: event.line }),
        }
    }
}

/// Discriminator for the `error` string of a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorKind {
    /// Source failed to compile as a function body.
    Syntax,
    /// Exception thrown or promise rejected while running.
    Runtime,
    /// Host-synthesized: the worker exceeded its time budget.
    Timeout,
    /// A produced value could not be transported.
    Serialization,
    /// Host-synthesized: the caller cancelled the request.
    Cancelled,
    /// Host-synthesized: the worker could not be started or died.
    Worker,
}

/// Outcome of one request. Exactly one is produced per request id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub id: String,
    #[serde(default)]
    pub logs: Vec<LogEntry>,
    /// `None` when the code returned `undefined`; a returned `null` is
    /// `Some(Value::Null)`.
    #[serde(
        default,
        deserialize_with = "present_value",
        skip_serializing_if = "Option::is_none"
    )]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    pub duration_ms: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeline: Option<Vec<TraceEvent>>,
}

/// A key that is present always yields `Some`, so JSON `null` survives.
fn present_value<'de, D>(deserializer: D) -> Result<Option<serde_json::Value>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    serde_json::Value::deserialize(deserializer).map(Some)
}

impl ExecutionResult {
    /// A result carrying no output, only an error. Used for outcomes the host
    /// synthesizes when the worker never answers.
    pub fn failed(
        id: impl Into<String>,
        kind: ErrorKind,
        message: impl Into<String>,
        duration_ms: f64,
    ) -> Self {
        Self {
            id: id.into(),
            logs: Vec::new(),
            result: None,
            error: Some(message.into()),
            error_kind: Some(kind),
            duration_ms: duration_ms.max(0.0),
            timeline: None,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_defaults_apply_when_fields_missing() {
        let req: ExecutionRequest =
            serde_json::from_value(json!({"id": "r1", "code": "1"})).unwrap();
        assert_eq!(req.timeout_ms, DEFAULT_TIMEOUT_MS);
        assert!(!req.instrument);
    }

    #[test]
    fn request_uses_camel_case_fields() {
        let req = ExecutionRequest::new("r2", "x")
            .with_timeout_ms(200)
            .with_instrument(true);
        let value = serde_json::to_value(&req).unwrap();
        assert_eq!(value["timeoutMs"], 200);
        assert_eq!(value["instrument"], true);
    }

    #[test]
    fn log_entry_wire_shape() {
        let entry = LogEntry {
            kind: LogKind::Warn,
            text: "careful".into(),
            timestamp_ms: 1.5,
        };
        let value = serde_json::to_value(&entry).unwrap();
        assert_eq!(value, json!({"type": "warn", "content": "careful", "timestamp": 1.5}));
    }

    #[test]
    fn trace_event_wire_shape() {
        let event = TraceEvent {
            timestamp_ms: 0.25,
            line: 3,
            snippet: "console.log(y);".into(),
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(
            value,
            json!({"t": 0.25, "label": "console.log(y);", "data": {"line": 3}})
        );
        let back: TraceEvent = serde_json::from_value(value).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn trace_event_without_data_has_line_zero() {
        let event: TraceEvent = serde_json::from_value(json!({"t": 1.0, "label": "x"})).unwrap();
        assert_eq!(event.line, 0);
    }

    #[test]
    fn result_omits_absent_optionals() {
        let result = ExecutionResult {
            id: "a".into(),
            logs: Vec::new(),
            result: None,
            error: None,
            error_kind: None,
            duration_ms: 0.5,
            timeline: None,
        };
        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(value, json!({"id": "a", "logs": [], "durationMs": 0.5}));
    }

    #[test]
    fn null_result_is_distinct_from_missing_result() {
        let null: ExecutionResult =
            serde_json::from_value(json!({"id": "n", "result": null, "durationMs": 1.0})).unwrap();
        assert_eq!(null.result, Some(serde_json::Value::Null));

        let missing: ExecutionResult =
            serde_json::from_value(json!({"id": "m", "durationMs": 1.0})).unwrap();
        assert_eq!(missing.result, None);
    }

    #[test]
    fn failed_result_clamps_negative_duration() {
        let result = ExecutionResult::failed("b", ErrorKind::Timeout, "timed out", -3.0);
        assert_eq!(result.duration_ms, 0.0);
        assert_eq!(result.error_kind, Some(ErrorKind::Timeout));
        assert!(!result.is_ok());
        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(value["errorKind"], "timeout");
    }
}
