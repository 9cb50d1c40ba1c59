#![forbid(unsafe_code)]

use std::sync::Arc;

use anyhow::{anyhow, Result};
use parking_lot::Mutex;
use planwise_domain::{
    format_rfc3339, hash_text, now_utc, safe_preview, Report, RunId, RunStatus, ToolArguments,
    TraceEvent, TraceEventType, TraceSummary, DEFAULT_PREVIEW_MAX_CHARS, SUMMARY_SCHEMA_VERSION,
    TRACE_SCHEMA_VERSION,
};
use serde_json::{json, Map, Value};
use tracing::{debug, warn};

pub const RELEASED_BEFORE_COMPLETION: &str = "trace_released_before_completion";

/// Durable, append-only storage for the events of one run.
pub trait TraceSink: Send + Sync {
    /// Persist one event. Must be durable when this returns `Ok`.
    #[allow(clippy::missing_errors_doc)]
    fn append_event(&self, event: &TraceEvent) -> Result<()>;

    #[allow(clippy::missing_errors_doc)]
    fn write_summary(&self, summary: &TraceSummary) -> Result<()>;

    #[allow(clippy::missing_errors_doc)]
    fn list_events(&self) -> Result<Vec<TraceEvent>>;
}

pub trait TraceSinkFactory: Send + Sync {
    #[allow(clippy::missing_errors_doc)]
    fn open(&self, run_id: RunId) -> Result<Box<dyn TraceSink>>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunMetadata {
    pub topic: String,
    pub provider: String,
    pub model: String,
    pub profile_hash: Option<String>,
    pub preview_max_chars: usize,
}

impl RunMetadata {
    #[must_use]
    pub fn new(topic: &str, provider: &str, model: &str) -> Self {
        Self {
            topic: topic.to_string(),
            provider: provider.to_string(),
            model: model.to_string(),
            profile_hash: None,
            preview_max_chars: DEFAULT_PREVIEW_MAX_CHARS,
        }
    }
}

struct TraceState {
    run_id: RunId,
    sink: Box<dyn TraceSink>,
    next_idx: u64,
    completed: bool,
    sink_failure: Option<String>,
    preview_max_chars: usize,
}

impl TraceState {
    fn append(&mut self, event_type: TraceEventType, payload: Value) -> Result<u64> {
        if self.completed {
            return Err(anyhow!(
                "trace for run {} is completed; refusing {} event",
                self.run_id,
                event_type.as_str()
            ));
        }
        if let Some(cause) = &self.sink_failure {
            return Err(anyhow!(
                "trace for run {} stopped after a failed append ({cause}); refusing {} event",
                self.run_id,
                event_type.as_str()
            ));
        }
        let idx = self.next_idx;
        let event = TraceEvent {
            ts: format_rfc3339(now_utc())?,
            run_id: self.run_id,
            idx,
            event_type,
            payload,
        };
        if let Err(err) = self.sink.append_event(&event) {
            self.sink_failure = Some(err.to_string());
            return Err(err);
        }
        self.next_idx = idx + 1;
        Ok(idx)
    }

    fn complete(&mut self, status: RunStatus, cause: Option<&str>) -> Result<TraceSummary> {
        if !status.is_terminal() {
            return Err(anyhow!("trace completion requires a terminal status"));
        }
        self.append(
            TraceEventType::RunCompleted,
            json!({ "status": status.as_str(), "error": cause }),
        )?;
        self.completed = true;

        let events = self.sink.list_events()?;
        let summary = project_summary(self.run_id, &events);
        self.sink.write_summary(&summary)?;
        debug!(run_id = %self.run_id, events = summary.event_count, status = status.as_str(), "trace completed");
        Ok(summary)
    }
}

impl Drop for TraceState {
    fn drop(&mut self) {
        if self.completed {
            return;
        }
        warn!(run_id = %self.run_id, "trace released before completion");
        if let Err(err) = self.complete(RunStatus::Error, Some(RELEASED_BEFORE_COMPLETION)) {
            warn!(run_id = %self.run_id, error = %err, "failed to close released trace");
        }
    }
}

/// Run-scoped trajectory recorder. Cloning shares the same event sequence.
#[derive(Clone)]
pub struct TraceHandle {
    run_id: RunId,
    inner: Option<Arc<Mutex<TraceState>>>,
}

impl std::fmt::Debug for TraceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TraceHandle")
            .field("run_id", &self.run_id)
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

impl TraceHandle {
    /// Open a trace and record `run_started`.
    ///
    /// # Errors
    /// Returns an error when the first event cannot be persisted.
    pub fn start(sink: Box<dyn TraceSink>, run_id: RunId, metadata: &RunMetadata) -> Result<Self> {
        let mut state = TraceState {
            run_id,
            sink,
            next_idx: 0,
            completed: false,
            sink_failure: None,
            preview_max_chars: metadata.preview_max_chars.max(1),
        };
        let started = state.append(
            TraceEventType::RunStarted,
            json!({
                "schema_version": TRACE_SCHEMA_VERSION,
                "topic": metadata.topic,
                "provider": metadata.provider,
                "model": metadata.model,
                "profile_hash": metadata.profile_hash,
            }),
        );
        if let Err(err) = started {
            // nothing was written, so there is no trace to close
            state.completed = true;
            return Err(err);
        }
        Ok(Self {
            run_id,
            inner: Some(Arc::new(Mutex::new(state))),
        })
    }

    #[must_use]
    pub fn disabled(run_id: RunId) -> Self {
        Self {
            run_id,
            inner: None,
        }
    }

    #[must_use]
    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.inner.is_some()
    }

    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.inner
            .as_ref()
            .is_some_and(|state| state.lock().completed)
    }

    fn append(&self, event_type: TraceEventType, payload: Value) -> Result<Option<u64>> {
        match &self.inner {
            None => Ok(None),
            Some(state) => state.lock().append(event_type, payload).map(Some),
        }
    }

    fn preview(&self, text: &str) -> String {
        let limit = self
            .inner
            .as_ref()
            .map_or(DEFAULT_PREVIEW_MAX_CHARS, |state| state.lock().preview_max_chars);
        safe_preview(text, limit)
    }

    /// Record a phase transition; object fields in `data` are merged into the payload.
    ///
    /// # Errors
    /// Returns an error when the event cannot be persisted.
    pub fn log_phase(&self, phase: &str, status: &str, data: Value) -> Result<Option<u64>> {
        let mut payload = Map::new();
        payload.insert("phase".to_string(), Value::String(phase.to_string()));
        payload.insert("status".to_string(), Value::String(status.to_string()));
        if let Value::Object(fields) = data {
            for (key, value) in fields {
                payload.entry(key).or_insert(value);
            }
        }
        self.append(TraceEventType::Phase, Value::Object(payload))
    }

    /// String arguments are capped like result previews.
    ///
    /// # Errors
    /// Returns an error when the event cannot be persisted.
    pub fn log_tool_call(&self, tool: &str, arguments: &ToolArguments) -> Result<Option<u64>> {
        let kwargs: Map<String, Value> = arguments
            .iter()
            .map(|(key, value)| {
                let value = match value {
                    Value::String(text) => Value::String(self.preview(text)),
                    other => other.clone(),
                };
                (key.clone(), value)
            })
            .collect();
        self.append(
            TraceEventType::ToolCall,
            json!({ "tool": tool, "kwargs": kwargs }),
        )
    }

    /// # Errors
    /// Returns an error when the event cannot be persisted.
    pub fn log_tool_result(
        &self,
        tool: &str,
        ok: bool,
        latency_ms: u64,
        result_preview: &str,
        error_code: Option<&str>,
    ) -> Result<Option<u64>> {
        let mut payload = json!({
            "tool": tool,
            "ok": ok,
            "latency_ms": latency_ms,
            "result_preview": self.preview(result_preview),
        });
        if let (Some(code), Value::Object(fields)) = (error_code, &mut payload) {
            fields.insert("error_code".to_string(), Value::String(code.to_string()));
        }
        self.append(TraceEventType::ToolResult, payload)
    }

    /// # Errors
    /// Returns an error when the event cannot be persisted.
    pub fn log_message_snapshot(&self, role: &str, text: &str) -> Result<Option<u64>> {
        self.append(
            TraceEventType::MessageSnapshot,
            json!({
                "role": role,
                "text_preview": self.preview(text),
                "text_sha256": hash_text(text),
            }),
        )
    }

    /// # Errors
    /// Returns an error when the event cannot be persisted.
    pub fn log_final_report(&self, report: &Report) -> Result<Option<u64>> {
        let report_len = u64::try_from(report.content.chars().count()).unwrap_or(u64::MAX);
        self.append(
            TraceEventType::FinalReport,
            json!({
                "report_len": report_len,
                "report_sha256": report.content_hash,
                "report_path": report.path.to_string_lossy(),
                "report_preview": self.preview(&report.content),
            }),
        )
    }

    /// Append `run_completed`, then project and persist the summary.
    /// Returns `None` when tracing is disabled.
    ///
    /// # Errors
    /// Returns an error when the trace is already completed or persistence fails.
    pub fn complete(&self, status: RunStatus, cause: Option<&str>) -> Result<Option<TraceSummary>> {
        match &self.inner {
            None => Ok(None),
            Some(state) => state.lock().complete(status, cause).map(Some),
        }
    }
}

fn payload_str(event: &TraceEvent, key: &str) -> Option<String> {
    event
        .payload
        .get(key)
        .and_then(Value::as_str)
        .map(str::to_string)
}

/// Derive the run summary purely from its event log.
#[must_use]
pub fn project_summary(run_id: RunId, events: &[TraceEvent]) -> TraceSummary {
    let mut summary = TraceSummary {
        schema: SUMMARY_SCHEMA_VERSION.to_string(),
        run_id,
        topic: None,
        provider: None,
        model: None,
        status: None,
        error: None,
        event_count: u64::try_from(events.len()).unwrap_or(u64::MAX),
        phase_event_count: 0,
        tool_call_count: 0,
        tool_error_count: 0,
        total_latency_ms: 0,
        message_snapshot_count: 0,
        report_len: None,
        report_sha256: None,
        report_path: None,
    };

    for event in events {
        match event.event_type {
            TraceEventType::RunStarted => {
                summary.topic = payload_str(event, "topic");
                summary.provider = payload_str(event, "provider");
                summary.model = payload_str(event, "model");
            }
            TraceEventType::Phase => summary.phase_event_count += 1,
            TraceEventType::ToolCall => summary.tool_call_count += 1,
            TraceEventType::ToolResult => {
                if event.payload.get("ok").and_then(Value::as_bool) != Some(true) {
                    summary.tool_error_count += 1;
                }
                let latency = event
                    .payload
                    .get("latency_ms")
                    .and_then(Value::as_u64)
                    .unwrap_or(0);
                summary.total_latency_ms = summary.total_latency_ms.saturating_add(latency);
            }
            TraceEventType::MessageSnapshot => summary.message_snapshot_count += 1,
            TraceEventType::FinalReport => {
                summary.report_len = event.payload.get("report_len").and_then(Value::as_u64);
                summary.report_sha256 = payload_str(event, "report_sha256");
                summary.report_path = payload_str(event, "report_path");
            }
            TraceEventType::RunCompleted => {
                summary.status = payload_str(event, "status")
                    .as_deref()
                    .and_then(RunStatus::parse);
                summary.error = payload_str(event, "error");
            }
        }
    }
    summary
}

/// Check that every event belongs to one run and `idx` is gap-free from 0.
///
/// # Errors
/// Returns an error describing the first violation.
pub fn verify_sequence(events: &[TraceEvent]) -> Result<()> {
    let Some(first) = events.first() else {
        return Ok(());
    };
    for (position, event) in events.iter().enumerate() {
        if event.run_id != first.run_id {
            return Err(anyhow!(
                "event {} belongs to run {}, expected {}",
                event.idx,
                event.run_id,
                first.run_id
            ));
        }
        let expected = u64::try_from(position)?;
        if event.idx != expected {
            return Err(anyhow!(
                "event idx {} at position {position}, expected {expected}",
                event.idx
            ));
        }
    }
    Ok(())
}

#[derive(Default)]
struct MemoryState {
    events: Vec<TraceEvent>,
    summary: Option<TraceSummary>,
}

/// In-process sink; clones observe the same log.
#[derive(Clone, Default)]
pub struct MemoryTraceSink {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryTraceSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn events(&self) -> Vec<TraceEvent> {
        self.state.lock().events.clone()
    }

    #[must_use]
    pub fn summary(&self) -> Option<TraceSummary> {
        self.state.lock().summary.clone()
    }
}

impl TraceSink for MemoryTraceSink {
    fn append_event(&self, event: &TraceEvent) -> Result<()> {
        self.state.lock().events.push(event.clone());
        Ok(())
    }

    fn write_summary(&self, summary: &TraceSummary) -> Result<()> {
        self.state.lock().summary = Some(summary.clone());
        Ok(())
    }

    fn list_events(&self) -> Result<Vec<TraceEvent>> {
        Ok(self.events())
    }
}

impl TraceSinkFactory for MemoryTraceSink {
    fn open(&self, _run_id: RunId) -> Result<Box<dyn TraceSink>> {
        Ok(Box::new(self.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::{
        project_summary, verify_sequence, MemoryTraceSink, RunMetadata, TraceHandle, TraceSink,
        RELEASED_BEFORE_COMPLETION,
    };
    use anyhow::{anyhow, Result};
    use planwise_domain::{
        Report, RunId, RunStatus, ToolArguments, TraceEvent, TraceEventType, TraceSummary,
        TRUNCATION_MARKER,
    };
    use serde_json::json;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Rejects the append with the given zero-based call number, accepts the rest.
    struct FailingOnceSink {
        inner: MemoryTraceSink,
        fail_at: usize,
        calls: AtomicUsize,
    }

    impl TraceSink for FailingOnceSink {
        fn append_event(&self, event: &TraceEvent) -> Result<()> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == self.fail_at {
                return Err(anyhow!("disk full"));
            }
            self.inner.append_event(event)
        }

        fn write_summary(&self, summary: &TraceSummary) -> Result<()> {
            self.inner.write_summary(summary)
        }

        fn list_events(&self) -> Result<Vec<TraceEvent>> {
            self.inner.list_events()
        }
    }

    fn started(sink: &MemoryTraceSink, run_id: RunId) -> TraceHandle {
        let metadata = RunMetadata::new("topic", "mock", "mock-planner-v1");
        match TraceHandle::start(Box::new(sink.clone()), run_id, &metadata) {
            Ok(handle) => handle,
            Err(err) => panic!("trace should start: {err}"),
        }
    }

    #[test]
    fn disabled_handle_is_a_no_op() {
        let handle = TraceHandle::disabled(RunId::new());
        assert!(!handle.is_enabled());
        assert!(matches!(handle.log_phase("planning", "started", json!({})), Ok(None)));
        assert!(matches!(handle.complete(RunStatus::Success, None), Ok(None)));
    }

    #[test]
    fn idx_is_contiguous_and_summary_projects() {
        let sink = MemoryTraceSink::new();
        let run_id = RunId::new();
        let handle = started(&sink, run_id);
        let clone = handle.clone();

        let mut args = ToolArguments::new();
        args.insert("expression".to_string(), json!("1+1"));
        assert!(handle.log_phase("execution", "started", json!({"step_count": 1})).is_ok());
        assert!(clone.log_tool_call("calculator", &args).is_ok());
        assert!(clone
            .log_tool_result("calculator", false, 12, "ERROR: boom", Some("failed"))
            .is_ok());
        assert!(handle.log_message_snapshot("synthesis", "report").is_ok());
        let report = Report::new("# report".to_string(), PathBuf::from("outputs/r.md"));
        assert!(handle.log_final_report(&report).is_ok());

        let summary = handle.complete(RunStatus::Success, None);
        let summary = match summary {
            Ok(Some(summary)) => summary,
            other => panic!("expected summary, got {other:?}"),
        };

        let events = sink.events();
        assert!(verify_sequence(&events).is_ok());
        assert_eq!(events.len(), 7);
        assert_eq!(events[0].event_type, TraceEventType::RunStarted);
        assert_eq!(events[6].event_type, TraceEventType::RunCompleted);
        assert_eq!(summary, project_summary(run_id, &events));
        assert_eq!(sink.summary(), Some(summary.clone()));
        assert_eq!(summary.tool_call_count, 1);
        assert_eq!(summary.tool_error_count, 1);
        assert_eq!(summary.total_latency_ms, 12);
        assert_eq!(summary.report_len, Some(8));
        assert_eq!(summary.status, Some(RunStatus::Success));
    }

    #[test]
    fn appends_after_completion_are_rejected() {
        let sink = MemoryTraceSink::new();
        let handle = started(&sink, RunId::new());
        assert!(handle.complete(RunStatus::Error, Some("cause")).is_ok());
        assert!(handle.is_completed());
        assert!(handle.log_phase("late", "started", json!({})).is_err());
        assert!(handle.complete(RunStatus::Success, None).is_err());
        assert_eq!(sink.events().len(), 2);
    }

    #[test]
    fn dropping_open_trace_closes_it_with_error() {
        let sink = MemoryTraceSink::new();
        {
            let handle = started(&sink, RunId::new());
            let clone = handle.clone();
            drop(handle);
            assert!(clone.log_phase("planning", "started", json!({})).is_ok());
        }
        let events = sink.events();
        assert_eq!(events.len(), 3);
        let last = &events[2];
        assert_eq!(last.event_type, TraceEventType::RunCompleted);
        assert_eq!(last.payload["status"], json!("error"));
        assert_eq!(last.payload["error"], json!(RELEASED_BEFORE_COMPLETION));
        assert!(sink.summary().is_some());
    }

    #[test]
    fn phase_data_cannot_override_phase_fields() {
        let sink = MemoryTraceSink::new();
        let handle = started(&sink, RunId::new());
        assert!(handle
            .log_phase("planning", "completed", json!({"phase": "other", "step_count": 4}))
            .is_ok());
        let events = sink.events();
        assert_eq!(events[1].payload["phase"], json!("planning"));
        assert_eq!(events[1].payload["step_count"], json!(4));
        assert!(handle.complete(RunStatus::Success, None).is_ok());
    }

    #[test]
    fn long_string_arguments_are_previewed() {
        let sink = MemoryTraceSink::new();
        let mut metadata = RunMetadata::new("topic", "mock", "mock-planner-v1");
        metadata.preview_max_chars = 50;
        let handle = TraceHandle::start(Box::new(sink.clone()), RunId::new(), &metadata)
            .unwrap_or_else(|err| panic!("trace should start: {err}"));

        let mut args = ToolArguments::new();
        args.insert("filename".to_string(), json!("report.md"));
        args.insert("content".to_string(), json!("x".repeat(20_000)));
        args.insert("limit".to_string(), json!(5));
        assert!(handle.log_tool_call("save_findings", &args).is_ok());

        let events = sink.events();
        let kwargs = &events[1].payload["kwargs"];
        assert_eq!(kwargs["filename"], json!("report.md"));
        assert_eq!(kwargs["limit"], json!(5));
        let content = kwargs["content"].as_str().unwrap_or_default();
        assert_eq!(content.chars().count(), 50 + TRUNCATION_MARKER.chars().count());
        assert!(content.ends_with(TRUNCATION_MARKER));
        assert!(handle.complete(RunStatus::Success, None).is_ok());
    }

    #[test]
    fn failed_append_stops_the_trace_without_reusing_idx() {
        let inner = MemoryTraceSink::new();
        let sink = FailingOnceSink {
            inner: inner.clone(),
            fail_at: 1,
            calls: AtomicUsize::new(0),
        };
        let metadata = RunMetadata::new("topic", "mock", "mock-planner-v1");
        let handle = TraceHandle::start(Box::new(sink), RunId::new(), &metadata)
            .unwrap_or_else(|err| panic!("trace should start: {err}"));

        assert!(handle.log_phase("planning", "started", json!({})).is_err());
        assert!(handle.log_phase("planning", "completed", json!({})).is_err());
        assert!(handle.complete(RunStatus::Error, Some("cause")).is_err());
        drop(handle);

        let events = inner.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, TraceEventType::RunStarted);
        assert!(verify_sequence(&events).is_ok());
    }

    #[test]
    fn sequence_gaps_are_detected() {
        let sink = MemoryTraceSink::new();
        let handle = started(&sink, RunId::new());
        assert!(handle.log_phase("planning", "started", json!({})).is_ok());
        assert!(handle.complete(RunStatus::Success, None).is_ok());
        let mut events = sink.events();
        events.remove(1);
        assert!(verify_sequence(&events).is_err());
    }
}
