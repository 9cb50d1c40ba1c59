#![forbid(unsafe_code)]

mod calculator;
mod save;
mod search;

use std::collections::BTreeSet;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use planwise_domain::{
    safe_preview, ToolArguments, ToolInvocation, ToolSettings, ToolStatus,
    DEFAULT_PREVIEW_MAX_CHARS,
};
use planwise_trace_core::TraceHandle;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

pub use calculator::{
    evaluate, parse_expression, BinaryOp, CalcError, Calculator, Expr, UnaryOp,
    MAX_EXPRESSION_LEN, MAX_NESTING_DEPTH,
};
pub use save::{sanitize_filename, SaveFindings};
pub use search::{
    backends_from_settings, parse_duckduckgo, parse_serper, parse_wikipedia, strip_markup,
    DuckDuckGoBackend, SearchBackend, SearchError, SearchHit, SerperBackend, WebSearch,
    WikipediaBackend,
};

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct ParamSpec {
    pub name: &'static str,
    pub description: &'static str,
    pub required: bool,
    pub max_len: usize,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct ToolSpec {
    pub name: &'static str,
    pub description: &'static str,
    pub params: &'static [ParamSpec],
    /// Parameter that receives a plan step's free-text input.
    pub primary_param: &'static str,
}

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum ToolError {
    #[error("invalid tool input: {0}")]
    Validation(String),
    #[error("unknown tool: {0}")]
    UnknownTool(String),
    #[error("tool timed out after {0}ms")]
    Timeout(u64),
    #[error("tool unavailable: {0}")]
    Unavailable(String),
    #[error("tool failed: {0}")]
    Failed(String),
}

impl ToolError {
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::UnknownTool(_) => "unknown_tool",
            Self::Timeout(_) => "timeout",
            Self::Unavailable(_) => "unavailable",
            Self::Failed(_) => "failed",
        }
    }
}

pub trait Capability: Send + Sync {
    fn spec(&self) -> &ToolSpec;

    /// Run the capability on already validated arguments.
    #[allow(clippy::missing_errors_doc)]
    fn call(&self, arguments: &ToolArguments) -> Result<Value, ToolError>;
}

pub(crate) fn required_str<'a>(arguments: &'a ToolArguments, name: &str) -> Result<&'a str, ToolError> {
    arguments
        .get(name)
        .and_then(Value::as_str)
        .ok_or_else(|| ToolError::Validation(format!("missing string parameter {name}")))
}

/// The fixed set of callable tools, in registration order.
#[derive(Default, Clone)]
pub struct CapabilityRegistry {
    capabilities: Vec<Arc<dyn Capability>>,
}

impl CapabilityRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// `web_search`, `calculator` and `save_findings` wired from settings.
    ///
    /// # Errors
    /// Returns an error if registration fails.
    pub fn standard(settings: &ToolSettings) -> Result<Self> {
        let mut registry = Self::new();
        registry.register(Arc::new(WebSearch::new(
            backends_from_settings(settings),
            settings.max_search_results,
        )))?;
        registry.register(Arc::new(Calculator))?;
        registry.register(Arc::new(SaveFindings::new(&settings.output_dir)))?;
        Ok(registry)
    }

    /// # Errors
    /// Returns an error when a capability with the same name is already registered.
    pub fn register(&mut self, capability: Arc<dyn Capability>) -> Result<()> {
        let name = capability.spec().name;
        if self.get(name).is_some() {
            return Err(anyhow!("duplicate capability: {name}"));
        }
        self.capabilities.push(capability);
        Ok(())
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Arc<dyn Capability>> {
        self.capabilities
            .iter()
            .find(|capability| capability.spec().name == name)
    }

    #[must_use]
    pub fn specs(&self) -> Vec<ToolSpec> {
        self.capabilities
            .iter()
            .map(|capability| *capability.spec())
            .collect()
    }

    #[must_use]
    pub fn names(&self) -> Vec<&'static str> {
        self.capabilities
            .iter()
            .map(|capability| capability.spec().name)
            .collect()
    }
}

/// Check arguments against a tool's declared parameters.
///
/// # Errors
/// Returns `ToolError::Validation` naming the first offending parameter.
pub fn validate_arguments(spec: &ToolSpec, arguments: &ToolArguments) -> Result<(), ToolError> {
    let known: BTreeSet<&str> = spec.params.iter().map(|param| param.name).collect();
    if let Some(unknown) = arguments.keys().find(|key| !known.contains(key.as_str())) {
        return Err(ToolError::Validation(format!(
            "{} does not accept parameter {unknown}",
            spec.name
        )));
    }
    for param in spec.params {
        let Some(value) = arguments.get(param.name) else {
            if param.required {
                return Err(ToolError::Validation(format!(
                    "{} requires parameter {}",
                    spec.name, param.name
                )));
            }
            continue;
        };
        let Some(text) = value.as_str() else {
            return Err(ToolError::Validation(format!(
                "parameter {} must be a string",
                param.name
            )));
        };
        if text.trim().is_empty() {
            return Err(ToolError::Validation(format!(
                "parameter {} must be non-empty",
                param.name
            )));
        }
        let len = text.chars().count();
        if len > param.max_len {
            return Err(ToolError::Validation(format!(
                "parameter {} is {len} characters, limit is {}",
                param.name, param.max_len
            )));
        }
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToolOutcome {
    pub invocation: ToolInvocation,
    /// Full structured result, kept for synthesis and never traced.
    pub output: Option<Value>,
}

impl ToolOutcome {
    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.invocation.is_ok()
    }
}

/// Validates, bounds and normalizes every tool call into a `ToolOutcome`.
#[derive(Clone)]
pub struct ToolExecutor {
    registry: Arc<CapabilityRegistry>,
    timeout_ms: u64,
    preview_max_chars: usize,
}

impl ToolExecutor {
    #[must_use]
    pub fn new(registry: CapabilityRegistry, timeout_ms: u64) -> Self {
        Self {
            registry: Arc::new(registry),
            timeout_ms: timeout_ms.max(1),
            preview_max_chars: DEFAULT_PREVIEW_MAX_CHARS,
        }
    }

    /// # Errors
    /// Returns an error if the standard registry cannot be built.
    pub fn standard(settings: &ToolSettings) -> Result<Self> {
        Ok(Self::new(
            CapabilityRegistry::standard(settings)?,
            settings.tool_timeout_ms,
        )
        .with_preview_limit(settings.preview_max_chars))
    }

    #[must_use]
    pub fn with_preview_limit(mut self, preview_max_chars: usize) -> Self {
        self.preview_max_chars = preview_max_chars.max(1);
        self
    }

    #[must_use]
    pub fn registry(&self) -> &CapabilityRegistry {
        &self.registry
    }

    #[must_use]
    pub fn preview_max_chars(&self) -> usize {
        self.preview_max_chars
    }

    /// Map a step's free-text input onto the tool's primary parameter.
    #[must_use]
    pub fn arguments_for(&self, tool_name: &str, input: &str) -> ToolArguments {
        let mut arguments = ToolArguments::new();
        if let Some(capability) = self.registry.get(tool_name) {
            arguments.insert(
                capability.spec().primary_param.to_string(),
                Value::String(input.trim().to_string()),
            );
        }
        arguments
    }

    /// Run one tool call. Every failure, including a capability panic, becomes an error outcome.
    #[must_use]
    pub fn invoke(&self, tool_name: &str, arguments: ToolArguments) -> ToolOutcome {
        let started = Instant::now();
        let result = self.dispatch(tool_name, &arguments);
        let latency_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        match result {
            Ok(output) => {
                let preview = match &output {
                    Value::String(text) => safe_preview(text, self.preview_max_chars),
                    other => safe_preview(&other.to_string(), self.preview_max_chars),
                };
                debug!(tool = tool_name, latency_ms, "tool call succeeded");
                ToolOutcome {
                    invocation: ToolInvocation {
                        tool_name: tool_name.to_string(),
                        arguments,
                        status: ToolStatus::Ok,
                        latency_ms,
                        result_preview: preview,
                        error_code: None,
                    },
                    output: Some(output),
                }
            }
            Err(err) => {
                warn!(tool = tool_name, latency_ms, code = err.code(), error = %err, "tool call failed");
                ToolOutcome {
                    invocation: ToolInvocation {
                        tool_name: tool_name.to_string(),
                        arguments,
                        status: ToolStatus::Error,
                        latency_ms,
                        result_preview: safe_preview(
                            &format!("ERROR: {err}"),
                            self.preview_max_chars,
                        ),
                        error_code: Some(err.code().to_string()),
                    },
                    output: None,
                }
            }
        }
    }

    fn dispatch(&self, tool_name: &str, arguments: &ToolArguments) -> Result<Value, ToolError> {
        let capability = self
            .registry
            .get(tool_name)
            .ok_or_else(|| ToolError::UnknownTool(tool_name.to_string()))?;
        validate_arguments(capability.spec(), arguments)?;
        self.run_bounded(Arc::clone(capability), arguments.clone())
    }

    fn run_bounded(
        &self,
        capability: Arc<dyn Capability>,
        arguments: ToolArguments,
    ) -> Result<Value, ToolError> {
        let name = capability.spec().name;
        let (sender, receiver) = mpsc::channel();
        thread::Builder::new()
            .name(format!("tool-{name}"))
            .spawn(move || {
                let _ = sender.send(capability.call(&arguments));
            })
            .map_err(|err| ToolError::Failed(format!("cannot start worker for {name}: {err}")))?;

        match receiver.recv_timeout(Duration::from_millis(self.timeout_ms)) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => Err(ToolError::Timeout(self.timeout_ms)),
            Err(RecvTimeoutError::Disconnected) => Err(ToolError::Failed(format!(
                "{name} terminated without a result"
            ))),
        }
    }

    /// Scope tool calls to a run's trace.
    #[must_use]
    pub fn bind(&self, trace: &TraceHandle) -> TracedTools<'_> {
        TracedTools {
            executor: self,
            trace: trace.clone(),
        }
    }
}

/// Tool executor bound to one run: each call is framed by `tool_call` / `tool_result` events.
pub struct TracedTools<'a> {
    executor: &'a ToolExecutor,
    trace: TraceHandle,
}

impl TracedTools<'_> {
    #[must_use]
    pub fn executor(&self) -> &ToolExecutor {
        self.executor
    }

    /// # Errors
    /// Returns an error only when a trace event cannot be persisted.
    pub fn invoke(&self, tool_name: &str, arguments: ToolArguments) -> Result<ToolOutcome> {
        self.trace.log_tool_call(tool_name, &arguments)?;
        let outcome = self.executor.invoke(tool_name, arguments);
        let invocation = &outcome.invocation;
        self.trace.log_tool_result(
            tool_name,
            invocation.is_ok(),
            invocation.latency_ms,
            &invocation.result_preview,
            invocation.error_code.as_deref(),
        )?;
        info!(
            run_id = %self.trace.run_id(),
            tool = tool_name,
            ok = invocation.is_ok(),
            latency_ms = invocation.latency_ms,
            "tool invocation recorded"
        );
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::{
        validate_arguments, Calculator, Capability, CapabilityRegistry, ParamSpec, ToolError,
        ToolExecutor, ToolSpec,
    };
    use planwise_domain::{RunId, RunStatus, ToolArguments, ToolSettings, ToolStatus};
    use planwise_trace_core::{MemoryTraceSink, RunMetadata, TraceHandle};
    use serde_json::{json, Value};
    use std::sync::Arc;
    use std::time::Duration;

    const SLOW_PARAMS: &[ParamSpec] = &[ParamSpec {
        name: "input",
        description: "anything",
        required: true,
        max_len: 64,
    }];

    const SLOW_SPEC: ToolSpec = ToolSpec {
        name: "slow",
        description: "sleeps past the executor deadline",
        params: SLOW_PARAMS,
        primary_param: "input",
    };

    const PANIC_SPEC: ToolSpec = ToolSpec {
        name: "explode",
        description: "panics",
        params: SLOW_PARAMS,
        primary_param: "input",
    };

    struct Slow;

    impl Capability for Slow {
        fn spec(&self) -> &ToolSpec {
            &SLOW_SPEC
        }

        fn call(&self, _arguments: &ToolArguments) -> Result<Value, ToolError> {
            std::thread::sleep(Duration::from_millis(500));
            Ok(json!("late"))
        }
    }

    struct Explode;

    impl Capability for Explode {
        fn spec(&self) -> &ToolSpec {
            &PANIC_SPEC
        }

        fn call(&self, _arguments: &ToolArguments) -> Result<Value, ToolError> {
            panic!("capability bug");
        }
    }

    fn executor_with(extra: Vec<Arc<dyn Capability>>, timeout_ms: u64) -> ToolExecutor {
        let mut registry = CapabilityRegistry::new();
        assert!(registry.register(Arc::new(Calculator)).is_ok());
        for capability in extra {
            assert!(registry.register(capability).is_ok());
        }
        ToolExecutor::new(registry, timeout_ms)
    }

    fn args(pairs: &[(&str, Value)]) -> ToolArguments {
        pairs
            .iter()
            .map(|(key, value)| ((*key).to_string(), value.clone()))
            .collect()
    }

    #[test]
    fn standard_registry_exposes_three_tools() {
        let settings = ToolSettings {
            search_backends: Vec::new(),
            ..ToolSettings::default()
        };
        let registry = CapabilityRegistry::standard(&settings);
        let mut registry = registry.unwrap_or_else(|err| panic!("registry should build: {err}"));
        assert_eq!(registry.names(), vec!["web_search", "calculator", "save_findings"]);
        assert!(registry.register(Arc::new(Calculator)).is_err());
    }

    #[test]
    fn calculator_success_is_normalized() {
        let executor = executor_with(Vec::new(), 2_000);
        let outcome = executor.invoke("calculator", executor.arguments_for("calculator", "(120-100)/100*100"));
        assert_eq!(outcome.invocation.status, ToolStatus::Ok);
        assert_eq!(outcome.output, Some(json!({"expression": "(120-100)/100*100", "value": 20.0})));
        assert!(outcome.invocation.result_preview.contains("20.0"));
    }

    #[test]
    fn invalid_calls_become_error_outcomes() {
        let executor = executor_with(Vec::new(), 2_000);

        let unknown = executor.invoke("teleport", ToolArguments::new());
        assert_eq!(unknown.invocation.error_code.as_deref(), Some("unknown_tool"));

        let missing = executor.invoke("calculator", ToolArguments::new());
        assert_eq!(missing.invocation.error_code.as_deref(), Some("validation"));

        let extra = executor.invoke(
            "calculator",
            args(&[("expression", json!("1+1")), ("mode", json!("fast"))]),
        );
        assert_eq!(extra.invocation.error_code.as_deref(), Some("validation"));

        let prose = executor.invoke(
            "calculator",
            executor.arguments_for("calculator", "Calculate CAGR from step 3"),
        );
        assert_eq!(prose.invocation.status, ToolStatus::Error);
        assert_eq!(prose.invocation.error_code.as_deref(), Some("failed"));
        assert!(prose.invocation.result_preview.starts_with("ERROR: "));
        assert!(prose.invocation.result_preview.contains("Calculate"));
    }

    #[test]
    fn argument_validation_rules() {
        let spec = Calculator.spec();
        assert!(validate_arguments(spec, &args(&[("expression", json!("1"))])).is_ok());
        assert!(validate_arguments(spec, &args(&[("expression", json!(1))])).is_err());
        assert!(validate_arguments(spec, &args(&[("expression", json!("  "))])).is_err());
        let long = "1".repeat(spec.params[0].max_len + 1);
        assert!(validate_arguments(spec, &args(&[("expression", json!(long))])).is_err());
    }

    #[test]
    fn slow_capability_times_out() {
        let executor = executor_with(vec![Arc::new(Slow)], 50);
        let outcome = executor.invoke("slow", args(&[("input", json!("x"))]));
        assert_eq!(outcome.invocation.error_code.as_deref(), Some("timeout"));
        assert!(outcome.output.is_none());
    }

    #[test]
    fn panicking_capability_is_contained() {
        let executor = executor_with(vec![Arc::new(Explode)], 2_000);
        let outcome = executor.invoke("explode", args(&[("input", json!("x"))]));
        assert_eq!(outcome.invocation.status, ToolStatus::Error);
        assert_eq!(outcome.invocation.error_code.as_deref(), Some("failed"));
    }

    #[test]
    fn bound_tools_frame_calls_with_trace_events() {
        let sink = MemoryTraceSink::new();
        let trace = TraceHandle::start(
            Box::new(sink.clone()),
            RunId::new(),
            &RunMetadata::new("t", "mock", "m"),
        )
        .unwrap_or_else(|err| panic!("trace should start: {err}"));
        let executor = executor_with(Vec::new(), 2_000);
        let tools = executor.bind(&trace);
        let outcome = tools.invoke("calculator", executor.arguments_for("calculator", "1/0"));
        let outcome = outcome.unwrap_or_else(|err| panic!("trace append should work: {err}"));
        assert!(!outcome.is_ok());

        let events = sink.events();
        assert_eq!(events.len(), 3);
        assert_eq!(events[1].payload["tool"], json!("calculator"));
        assert_eq!(events[1].payload["kwargs"]["expression"], json!("1/0"));
        assert_eq!(events[2].payload["ok"], json!(false));
        assert_eq!(events[2].payload["error_code"], json!("failed"));
        assert!(trace.complete(RunStatus::Success, None).is_ok());
    }
}
