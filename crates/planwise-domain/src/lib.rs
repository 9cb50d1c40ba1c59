#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use time::OffsetDateTime;
use ulid::Ulid;

pub type DateTimeUtc = OffsetDateTime;

/// Argument name to JSON value, as passed to a capability.
pub type ToolArguments = BTreeMap<String, Value>;

pub const TRACE_SCHEMA_VERSION: &str = "trace_event.v1";
pub const SUMMARY_SCHEMA_VERSION: &str = "trace_summary.v1";
pub const DEFAULT_PREVIEW_MAX_CHARS: usize = 1200;
pub const TRUNCATION_MARKER: &str = "...<truncated>";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct RunId(pub Ulid);

impl RunId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }

    /// Parse a run id from its ULID text form.
    ///
    /// # Errors
    /// Returns an error when the input is not a valid ULID.
    pub fn parse(input: &str) -> Result<Self> {
        let value =
            Ulid::from_str(input.trim()).map_err(|err| anyhow!("invalid run_id ULID: {err}"))?;
        Ok(Self(value))
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Success,
    Error,
}

impl RunStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Success => "success",
            Self::Error => "error",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "running" => Some(Self::Running),
            "success" => Some(Self::Success),
            "error" => Some(Self::Error),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Running)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Run {
    pub run_id: RunId,
    pub topic: String,
    pub status: RunStatus,
    pub started_at: DateTimeUtc,
    pub ended_at: Option<DateTimeUtc>,
}

impl Run {
    #[must_use]
    pub fn start(run_id: RunId, topic: &str) -> Self {
        Self {
            run_id,
            topic: topic.to_string(),
            status: RunStatus::Running,
            started_at: now_utc(),
            ended_at: None,
        }
    }

    /// Move the run into a terminal status.
    ///
    /// # Errors
    /// Returns an error when the run is already terminal or `status` is not terminal.
    pub fn finish(&mut self, status: RunStatus) -> Result<()> {
        if self.status.is_terminal() {
            return Err(anyhow!(
                "run {} is already terminal ({})",
                self.run_id,
                self.status.as_str()
            ));
        }
        if !status.is_terminal() {
            return Err(anyhow!("run can only finish with a terminal status"));
        }
        self.status = status;
        self.ended_at = Some(now_utc());
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Step {
    pub index: usize,
    pub description: String,
    #[serde(default)]
    pub tool_hint: Option<String>,
    #[serde(default)]
    pub input: Option<String>,
    #[serde(default)]
    pub expected_output: Option<String>,
}

impl Step {
    /// The string handed to the step's capability: explicit input, else the description.
    #[must_use]
    pub fn tool_input(&self) -> &str {
        match self.input.as_deref() {
            Some(input) if !input.trim().is_empty() => input,
            _ => &self.description,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum PlanSource {
    Planner,
    Fallback,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Plan {
    pub plan_text: String,
    pub steps: Vec<Step>,
    pub source: PlanSource,
    #[serde(default)]
    pub fallback_reason: Option<String>,
}

impl Plan {
    #[must_use]
    pub fn used_fallback(&self) -> bool {
        self.source == PlanSource::Fallback
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum ToolStatus {
    Ok,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolInvocation {
    pub tool_name: String,
    pub arguments: ToolArguments,
    pub status: ToolStatus,
    pub latency_ms: u64,
    pub result_preview: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
}

impl ToolInvocation {
    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.status == ToolStatus::Ok
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FindingOutcome {
    Tool {
        invocation: ToolInvocation,
        #[serde(default)]
        output: Option<Value>,
    },
    Inline {
        code: String,
        message: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FindingEntry {
    pub step: Step,
    pub outcome: FindingOutcome,
}

impl FindingEntry {
    #[must_use]
    pub fn is_ok(&self) -> bool {
        match &self.outcome {
            FindingOutcome::Tool { invocation, .. } => invocation.is_ok(),
            FindingOutcome::Inline { .. } => false,
        }
    }

    /// Short error text for error-marked entries.
    #[must_use]
    pub fn error_text(&self) -> Option<String> {
        match &self.outcome {
            FindingOutcome::Tool { invocation, .. } if !invocation.is_ok() => Some(format!(
                "step {} ({}): {}",
                self.step.index, invocation.tool_name, invocation.result_preview
            )),
            FindingOutcome::Tool { .. } => None,
            FindingOutcome::Inline { code, message } => {
                Some(format!("step {}: {code}: {message}", self.step.index))
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Report {
    pub content: String,
    pub content_hash: String,
    pub path: PathBuf,
}

impl Report {
    #[must_use]
    pub fn new(content: String, path: PathBuf) -> Self {
        let content_hash = hash_text(&content);
        Self {
            content,
            content_hash,
            path,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TraceEventType {
    RunStarted,
    Phase,
    ToolCall,
    ToolResult,
    MessageSnapshot,
    RunCompleted,
    FinalReport,
}

impl TraceEventType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RunStarted => "run_started",
            Self::Phase => "phase",
            Self::ToolCall => "tool_call",
            Self::ToolResult => "tool_result",
            Self::MessageSnapshot => "message_snapshot",
            Self::RunCompleted => "run_completed",
            Self::FinalReport => "final_report",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "run_started" => Some(Self::RunStarted),
            "phase" => Some(Self::Phase),
            "tool_call" => Some(Self::ToolCall),
            "tool_result" => Some(Self::ToolResult),
            "message_snapshot" => Some(Self::MessageSnapshot),
            "run_completed" => Some(Self::RunCompleted),
            "final_report" => Some(Self::FinalReport),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct TraceEvent {
    pub ts: String,
    pub run_id: RunId,
    pub idx: u64,
    pub event_type: TraceEventType,
    pub payload: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct TraceSummary {
    pub schema: String,
    pub run_id: RunId,
    pub topic: Option<String>,
    pub provider: Option<String>,
    pub model: Option<String>,
    pub status: Option<RunStatus>,
    pub error: Option<String>,
    pub event_count: u64,
    pub phase_event_count: u64,
    pub tool_call_count: u64,
    pub tool_error_count: u64,
    pub total_latency_ms: u64,
    pub message_snapshot_count: u64,
    pub report_len: Option<u64>,
    pub report_sha256: Option<String>,
    pub report_path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ProviderSettings {
    pub provider_name: String,
    pub model_id: String,
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_provider_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_max_output_tokens")]
    pub max_output_tokens: u32,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            provider_name: "openai".to_string(),
            model_id: "gpt-4.1-mini".to_string(),
            api_key_env: None,
            base_url: None,
            timeout_ms: default_provider_timeout_ms(),
            max_output_tokens: default_max_output_tokens(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ToolSettings {
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    #[serde(default = "default_tool_timeout_ms")]
    pub tool_timeout_ms: u64,
    #[serde(default = "default_search_timeout_ms")]
    pub search_timeout_ms: u64,
    #[serde(default = "default_max_search_results")]
    pub max_search_results: usize,
    #[serde(default = "default_preview_max_chars")]
    pub preview_max_chars: usize,
    #[serde(default = "default_search_backends")]
    pub search_backends: Vec<String>,
    #[serde(default = "default_serper_api_key_env")]
    pub serper_api_key_env: String,
}

impl Default for ToolSettings {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
            tool_timeout_ms: default_tool_timeout_ms(),
            search_timeout_ms: default_search_timeout_ms(),
            max_search_results: default_max_search_results(),
            preview_max_chars: default_preview_max_chars(),
            search_backends: default_search_backends(),
            serper_api_key_env: default_serper_api_key_env(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct TraceSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_trace_dir")]
    pub trace_dir: PathBuf,
}

impl Default for TraceSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            trace_dir: default_trace_dir(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ExecutionSettings {
    #[serde(default = "default_max_plan_steps")]
    pub max_plan_steps: usize,
    /// Fraction of failed steps (0.0..=1.0) above which the run aborts. Unset never aborts.
    #[serde(default)]
    pub max_tool_error_rate: Option<f64>,
    #[serde(default = "default_min_steps_for_error_rate")]
    pub min_steps_for_error_rate: usize,
}

impl Default for ExecutionSettings {
    fn default() -> Self {
        Self {
            max_plan_steps: default_max_plan_steps(),
            max_tool_error_rate: None,
            min_steps_for_error_rate: default_min_steps_for_error_rate(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ResearchProfile {
    pub profile_name: String,
    #[serde(default)]
    pub provider: ProviderSettings,
    #[serde(default)]
    pub tools: ToolSettings,
    #[serde(default)]
    pub trace: TraceSettings,
    #[serde(default)]
    pub execution: ExecutionSettings,
}

impl Default for ResearchProfile {
    fn default() -> Self {
        Self {
            profile_name: "default".to_string(),
            provider: ProviderSettings::default(),
            tools: ToolSettings::default(),
            trace: TraceSettings::default(),
            execution: ExecutionSettings::default(),
        }
    }
}

fn default_provider_timeout_ms() -> u64 {
    60_000
}

fn default_max_output_tokens() -> u32 {
    4096
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("outputs")
}

fn default_tool_timeout_ms() -> u64 {
    30_000
}

fn default_search_timeout_ms() -> u64 {
    10_000
}

fn default_max_search_results() -> usize {
    5
}

fn default_preview_max_chars() -> usize {
    DEFAULT_PREVIEW_MAX_CHARS
}

fn default_search_backends() -> Vec<String> {
    vec![
        "serper".to_string(),
        "duckduckgo".to_string(),
        "wikipedia".to_string(),
    ]
}

fn default_serper_api_key_env() -> String {
    "SERPER_API_KEY".to_string()
}

fn default_true() -> bool {
    true
}

fn default_trace_dir() -> PathBuf {
    PathBuf::from("trajectories")
}

fn default_max_plan_steps() -> usize {
    8
}

fn default_min_steps_for_error_rate() -> usize {
    3
}

#[must_use]
pub fn now_utc() -> DateTimeUtc {
    OffsetDateTime::now_utc()
}

/// Format a timestamp as RFC 3339.
///
/// # Errors
/// Returns an error if the timestamp cannot be represented.
pub fn format_rfc3339(value: DateTimeUtc) -> Result<String> {
    value
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| anyhow!("invalid RFC3339 value: {err}"))
}

#[must_use]
pub fn hash_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

#[must_use]
pub fn hash_text(text: &str) -> String {
    hash_bytes(text.as_bytes())
}

/// Hash a JSON value with stable `serde_json` serialization + SHA-256.
///
/// # Errors
/// Returns an error if JSON serialization fails.
pub fn hash_json(value: &Value) -> Result<String> {
    let bytes = serde_json::to_vec(value)?;
    Ok(hash_bytes(&bytes))
}

/// Ensure a string field is non-empty after trimming.
///
/// # Errors
/// Returns an error when the provided value is empty/whitespace.
pub fn ensure_non_empty(field_name: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(anyhow!("{field_name} MUST be non-empty"));
    }
    Ok(())
}

/// Bound a text to `max_chars` characters, marking truncation.
#[must_use]
pub fn safe_preview(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        None => text.to_string(),
        Some((cut, _)) => format!("{}{TRUNCATION_MARKER}", &text[..cut]),
    }
}
