#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use parking_lot::Mutex;
use planwise_domain::{ProviderSettings, RunId};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

const OPENAI_DEFAULT_BASE_URL: &str = "https://api.openai.com";
const ANTHROPIC_DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const ANTHROPIC_VERSION: &str = "2023-06-01";

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum CompletionPhase {
    Planning,
    Synthesis,
}

impl CompletionPhase {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Planning => "planning",
            Self::Synthesis => "synthesis",
        }
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct CompletionRequest {
    pub run_id: RunId,
    pub phase: CompletionPhase,
    pub topic: String,
    pub prompt: String,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Completion {
    pub text: String,
    pub provider_name: String,
    pub model_id: String,
    pub latency_ms: u64,
    pub input_tokens: Option<u64>,
    pub output_tokens: Option<u64>,
}

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum ProviderError {
    #[error("provider authentication failed: {0}")]
    Auth(String),
    #[error("provider rate limited: {0}")]
    RateLimit(String),
    #[error("provider call timed out after {0}ms")]
    Timeout(u64),
    #[error("provider error: {0}")]
    Provider(String),
}

impl ProviderError {
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Auth(_) => "auth",
            Self::RateLimit(_) => "rate_limit",
            Self::Timeout(_) => "timeout",
            Self::Provider(_) => "provider",
        }
    }
}

pub trait CompletionProvider: Send + Sync {
    fn provider_name(&self) -> &str;

    fn model_id(&self) -> &str;

    /// Cheap readiness check run before any model call, e.g. credential presence.
    #[allow(clippy::missing_errors_doc)]
    fn preflight(&self) -> Result<(), ProviderError> {
        Ok(())
    }

    #[allow(clippy::missing_errors_doc)]
    fn complete(&self, request: &CompletionRequest) -> Result<Completion, ProviderError>;
}

/// Build the adapter named by the profile, reading its credential from the environment.
///
/// # Errors
/// Returns an error for an unknown provider name.
pub fn build_provider(settings: &ProviderSettings) -> Result<Box<dyn CompletionProvider>> {
    let api_key = settings
        .api_key_env
        .as_deref()
        .and_then(|name| std::env::var(name).ok())
        .filter(|value| !value.trim().is_empty());
    match settings.provider_name.as_str() {
        "openai" => Ok(Box::new(OpenAiChatProvider::new(settings, api_key))),
        "anthropic" => Ok(Box::new(AnthropicProvider::new(settings, api_key))),
        "mock" => Ok(Box::new(MockProvider::new(&settings.model_id))),
        other => Err(anyhow!("unsupported provider_name: {other}")),
    }
}

#[derive(Debug, Clone)]
struct HttpTransport {
    agent: ureq::Agent,
    timeout_ms: u64,
}

impl HttpTransport {
    fn new(timeout_ms: u64) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout(Duration::from_millis(timeout_ms))
            .build();
        Self { agent, timeout_ms }
    }

    fn post_json(
        &self,
        url: &str,
        headers: &[(&str, &str)],
        body: &Value,
    ) -> Result<Value, ProviderError> {
        let mut req = self
            .agent
            .post(url)
            .set("content-type", "application/json");
        for (name, value) in headers {
            req = req.set(name, value);
        }

        match req.send_json(body) {
            Ok(response) => response.into_json::<Value>().map_err(|err| {
                if is_timeout_io(&err) {
                    ProviderError::Timeout(self.timeout_ms)
                } else {
                    ProviderError::Provider(format!("invalid response body: {err}"))
                }
            }),
            Err(ureq::Error::Status(code, response)) => {
                let body = response.into_string().unwrap_or_default();
                Err(classify_status(code, &body))
            }
            Err(ureq::Error::Transport(transport)) => {
                let timed_out = std::error::Error::source(&transport)
                    .and_then(|source| source.downcast_ref::<std::io::Error>())
                    .is_some_and(is_timeout_io);
                if timed_out {
                    Err(ProviderError::Timeout(self.timeout_ms))
                } else {
                    Err(ProviderError::Provider(format!(
                        "http transport failure: {transport}"
                    )))
                }
            }
        }
    }
}

fn is_timeout_io(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock
    )
}

/// Map a non-2xx HTTP status onto the provider error taxonomy.
#[must_use]
pub fn classify_status(code: u16, body: &str) -> ProviderError {
    let detail = planwise_domain::safe_preview(body.trim(), 300);
    let message = if detail.is_empty() {
        format!("http status {code}")
    } else {
        format!("http status {code}: {detail}")
    };
    match code {
        401 | 403 => ProviderError::Auth(message),
        429 => ProviderError::RateLimit(message),
        _ => ProviderError::Provider(message),
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

fn missing_key(provider_name: &str, env_name: Option<&str>) -> ProviderError {
    match env_name {
        Some(name) => ProviderError::Auth(format!("{provider_name}: environment variable {name} is not set")),
        None => ProviderError::Auth(format!("{provider_name}: no api_key_env configured")),
    }
}

#[derive(Debug, Clone)]
pub struct OpenAiChatProvider {
    model_id: String,
    base_url: String,
    api_key_env: Option<String>,
    api_key: Option<String>,
    max_output_tokens: u32,
    transport: HttpTransport,
}

impl OpenAiChatProvider {
    #[must_use]
    pub fn new(settings: &ProviderSettings, api_key: Option<String>) -> Self {
        Self {
            model_id: settings.model_id.clone(),
            base_url: settings
                .base_url
                .clone()
                .unwrap_or_else(|| OPENAI_DEFAULT_BASE_URL.to_string()),
            api_key_env: settings.api_key_env.clone(),
            api_key,
            max_output_tokens: settings.max_output_tokens,
            transport: HttpTransport::new(settings.timeout_ms),
        }
    }

    fn request_body(&self, request: &CompletionRequest) -> Value {
        json!({
            "model": self.model_id,
            "temperature": 0,
            "max_tokens": self.max_output_tokens,
            "messages": [
                { "role": "user", "content": request.prompt }
            ],
        })
    }
}

impl CompletionProvider for OpenAiChatProvider {
    fn provider_name(&self) -> &str {
        "openai"
    }

    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn preflight(&self) -> Result<(), ProviderError> {
        match self.api_key {
            Some(_) => Ok(()),
            None => Err(missing_key("openai", self.api_key_env.as_deref())),
        }
    }

    fn complete(&self, request: &CompletionRequest) -> Result<Completion, ProviderError> {
        let Some(api_key) = self.api_key.as_deref() else {
            return Err(missing_key("openai", self.api_key_env.as_deref()));
        };
        let started = Instant::now();
        let url = format!("{}/v1/chat/completions", self.base_url);
        let authorization = format!("Bearer {api_key}");
        debug!(run_id = %request.run_id, phase = request.phase.as_str(), model = %self.model_id, "openai completion request");
        let body = self.transport.post_json(
            &url,
            &[("authorization", authorization.as_str())],
            &self.request_body(request),
        )?;
        let (text, input_tokens, output_tokens) = extract_openai_text(&body)?;
        Ok(Completion {
            text,
            provider_name: self.provider_name().to_string(),
            model_id: self.model_id.clone(),
            latency_ms: elapsed_ms(started),
            input_tokens,
            output_tokens,
        })
    }
}

/// Pull the assistant text and token usage out of a chat-completions response.
///
/// # Errors
/// Returns `ProviderError::Provider` when the response has no message content.
pub fn extract_openai_text(body: &Value) -> Result<(String, Option<u64>, Option<u64>), ProviderError> {
    let text = body
        .pointer("/choices/0/message/content")
        .and_then(Value::as_str)
        .ok_or_else(|| ProviderError::Provider("response missing choices[0].message.content".to_string()))?;
    let input_tokens = body.pointer("/usage/prompt_tokens").and_then(Value::as_u64);
    let output_tokens = body.pointer("/usage/completion_tokens").and_then(Value::as_u64);
    Ok((text.to_string(), input_tokens, output_tokens))
}

#[derive(Debug, Clone)]
pub struct AnthropicProvider {
    model_id: String,
    base_url: String,
    api_key_env: Option<String>,
    api_key: Option<String>,
    max_output_tokens: u32,
    transport: HttpTransport,
}

impl AnthropicProvider {
    #[must_use]
    pub fn new(settings: &ProviderSettings, api_key: Option<String>) -> Self {
        Self {
            model_id: settings.model_id.clone(),
            base_url: settings
                .base_url
                .clone()
                .unwrap_or_else(|| ANTHROPIC_DEFAULT_BASE_URL.to_string()),
            api_key_env: settings.api_key_env.clone(),
            api_key,
            max_output_tokens: settings.max_output_tokens,
            transport: HttpTransport::new(settings.timeout_ms),
        }
    }

    fn request_body(&self, request: &CompletionRequest) -> Value {
        json!({
            "model": self.model_id,
            "max_tokens": self.max_output_tokens,
            "temperature": 0,
            "messages": [
                { "role": "user", "content": request.prompt }
            ],
        })
    }
}

impl CompletionProvider for AnthropicProvider {
    fn provider_name(&self) -> &str {
        "anthropic"
    }

    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn preflight(&self) -> Result<(), ProviderError> {
        match self.api_key {
            Some(_) => Ok(()),
            None => Err(missing_key("anthropic", self.api_key_env.as_deref())),
        }
    }

    fn complete(&self, request: &CompletionRequest) -> Result<Completion, ProviderError> {
        let Some(api_key) = self.api_key.as_deref() else {
            return Err(missing_key("anthropic", self.api_key_env.as_deref()));
        };
        let started = Instant::now();
        let url = format!("{}/v1/messages", self.base_url);
        debug!(run_id = %request.run_id, phase = request.phase.as_str(), model = %self.model_id, "anthropic completion request");
        let body = self.transport.post_json(
            &url,
            &[("x-api-key", api_key), ("anthropic-version", ANTHROPIC_VERSION)],
            &self.request_body(request),
        )?;
        let (text, input_tokens, output_tokens) = extract_anthropic_text(&body)?;
        Ok(Completion {
            text,
            provider_name: self.provider_name().to_string(),
            model_id: self.model_id.clone(),
            latency_ms: elapsed_ms(started),
            input_tokens,
            output_tokens,
        })
    }
}

/// Concatenate the text blocks of a messages-API response.
///
/// # Errors
/// Returns `ProviderError::Provider` when the response carries no text block.
pub fn extract_anthropic_text(
    body: &Value,
) -> Result<(String, Option<u64>, Option<u64>), ProviderError> {
    let blocks = body
        .get("content")
        .and_then(Value::as_array)
        .ok_or_else(|| ProviderError::Provider("response missing content blocks".to_string()))?;
    let texts: Vec<&str> = blocks
        .iter()
        .filter(|block| block.get("type").and_then(Value::as_str) == Some("text"))
        .filter_map(|block| block.get("text").and_then(Value::as_str))
        .collect();
    if texts.is_empty() {
        return Err(ProviderError::Provider(
            "response contained no text blocks".to_string(),
        ));
    }
    let input_tokens = body.pointer("/usage/input_tokens").and_then(Value::as_u64);
    let output_tokens = body.pointer("/usage/output_tokens").and_then(Value::as_u64);
    Ok((texts.join(""), input_tokens, output_tokens))
}

/// Offline provider producing a deterministic plan and report for a topic.
#[derive(Debug, Clone)]
pub struct MockProvider {
    model_id: String,
}

impl Default for MockProvider {
    fn default() -> Self {
        Self::new("mock-planner-v1")
    }
}

impl MockProvider {
    #[must_use]
    pub fn new(model_id: &str) -> Self {
        Self {
            model_id: model_id.to_string(),
        }
    }

    fn deterministic_token(&self, request: &CompletionRequest) -> String {
        let mut hasher = Sha256::new();
        hasher.update(request.phase.as_str().as_bytes());
        hasher.update(request.topic.as_bytes());
        hasher.update(self.model_id.as_bytes());
        hex::encode(hasher.finalize())
    }

    fn plan_text(topic: &str) -> String {
        let plan = json!({
            "plan_text": format!("Gather sizing, growth and competitor evidence for {topic}, then compute growth."),
            "steps": [
                {
                    "id": "step_1",
                    "tool": "web_search",
                    "input": format!("{topic} market size"),
                    "expected_output": "current market size with sources"
                },
                {
                    "id": "step_2",
                    "tool": "web_search",
                    "input": format!("{topic} growth forecast"),
                    "expected_output": "forecast figures and CAGR"
                },
                {
                    "id": "step_3",
                    "tool": "web_search",
                    "input": format!("{topic} leading companies"),
                    "expected_output": "competitive landscape"
                },
                {
                    "id": "step_4",
                    "tool": "calculator",
                    "input": "((10.9 / 3.66) ** (1/3) - 1) * 100",
                    "expected_output": "implied CAGR percentage"
                }
            ]
        });
        format!("```json\n{plan:#}\n```")
    }

    fn report_text(topic: &str, token: &str) -> String {
        let short = token.chars().take(16).collect::<String>();
        format!(
            "# {topic}: Market Research Report\n\n\
             ## Executive Summary\n\nOffline report generated for {topic}.\n\n\
             ## Market Overview\n\nSee findings gathered during execution.\n\n\
             ## Key Findings\n\n- Findings were collected by the executor.\n\n\
             ## Competitive Landscape\n\nNo live data in offline mode.\n\n\
             ## Recommendations\n\n- Re-run with a live provider for sourced figures.\n\n\
             ## Sources\n\n- mock:{short}\n"
        )
    }
}

impl CompletionProvider for MockProvider {
    fn provider_name(&self) -> &str {
        "mock"
    }

    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn complete(&self, request: &CompletionRequest) -> Result<Completion, ProviderError> {
        let token = self.deterministic_token(request);
        let text = match request.phase {
            CompletionPhase::Planning => Self::plan_text(&request.topic),
            CompletionPhase::Synthesis => Self::report_text(&request.topic, &token),
        };
        let prompt_len = u64::try_from(request.prompt.len()).unwrap_or(u64::MAX);
        Ok(Completion {
            text,
            provider_name: self.provider_name().to_string(),
            model_id: self.model_id.clone(),
            latency_ms: 5 + (prompt_len % 17),
            input_tokens: None,
            output_tokens: None,
        })
    }
}

/// Replays queued responses in order and records every request it saw.
#[derive(Debug)]
pub struct ScriptedProvider {
    model_id: String,
    responses: Mutex<VecDeque<Result<String, ProviderError>>>,
    requests: Mutex<Vec<CompletionRequest>>,
    preflight_error: Option<ProviderError>,
}

impl ScriptedProvider {
    #[must_use]
    pub fn new<I>(responses: I) -> Self
    where
        I: IntoIterator<Item = Result<String, ProviderError>>,
    {
        Self {
            model_id: "scripted".to_string(),
            responses: Mutex::new(responses.into_iter().collect()),
            requests: Mutex::new(Vec::new()),
            preflight_error: None,
        }
    }

    #[must_use]
    pub fn with_preflight_error(mut self, error: ProviderError) -> Self {
        self.preflight_error = Some(error);
        self
    }

    #[must_use]
    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().clone()
    }

    #[must_use]
    pub fn remaining(&self) -> usize {
        self.responses.lock().len()
    }
}

impl CompletionProvider for ScriptedProvider {
    fn provider_name(&self) -> &str {
        "scripted"
    }

    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn preflight(&self) -> Result<(), ProviderError> {
        match &self.preflight_error {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    fn complete(&self, request: &CompletionRequest) -> Result<Completion, ProviderError> {
        self.requests.lock().push(request.clone());
        let next = self.responses.lock().pop_front();
        match next {
            Some(Ok(text)) => Ok(Completion {
                text,
                provider_name: self.provider_name().to_string(),
                model_id: self.model_id.clone(),
                latency_ms: 1,
                input_tokens: None,
                output_tokens: None,
            }),
            Some(Err(err)) => Err(err),
            None => {
                warn!(phase = request.phase.as_str(), "scripted provider exhausted");
                Err(ProviderError::Provider("script exhausted".to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{
        build_provider, classify_status, extract_anthropic_text, extract_openai_text,
        CompletionPhase, CompletionProvider, CompletionRequest, MockProvider, OpenAiChatProvider,
        ProviderError, ScriptedProvider,
    };
    use planwise_domain::{ProviderSettings, RunId};
    use serde_json::json;

    fn fixture_request(phase: CompletionPhase) -> CompletionRequest {
        CompletionRequest {
            run_id: RunId::new(),
            phase,
            topic: "solid-state batteries".to_string(),
            prompt: "prompt body".to_string(),
        }
    }

    #[test]
    fn mock_provider_output_is_stable_for_same_input() {
        let provider = MockProvider::default();
        let request = fixture_request(CompletionPhase::Synthesis);
        let first = provider.complete(&request);
        let second = provider.complete(&request);
        assert!(first.is_ok());
        assert!(second.is_ok());
        let first = first.unwrap_or_else(|_| unreachable!());
        let second = second.unwrap_or_else(|_| unreachable!());
        assert_eq!(first.text, second.text);
        assert!(first.text.contains("## Executive Summary"));
    }

    #[test]
    fn mock_plan_is_fenced_json() {
        let provider = MockProvider::default();
        let completion = provider.complete(&fixture_request(CompletionPhase::Planning));
        let completion = completion.unwrap_or_else(|_| unreachable!());
        assert!(completion.text.starts_with("```json"));
        assert!(completion.text.contains("solid-state batteries market size"));
    }

    #[test]
    fn http_status_maps_to_error_kinds() {
        assert_eq!(classify_status(401, "").code(), "auth");
        assert_eq!(classify_status(403, "denied").code(), "auth");
        assert_eq!(classify_status(429, "slow down").code(), "rate_limit");
        assert_eq!(classify_status(500, "boom").code(), "provider");
        assert_eq!(
            classify_status(404, ""),
            ProviderError::Provider("http status 404".to_string())
        );
    }

    #[test]
    fn openai_provider_without_key_fails_preflight() {
        let settings = ProviderSettings {
            api_key_env: Some("PLANWISE_TEST_UNSET_KEY".to_string()),
            ..ProviderSettings::default()
        };
        let provider = OpenAiChatProvider::new(&settings, None);
        match provider.preflight() {
            Err(ProviderError::Auth(message)) => assert!(message.contains("PLANWISE_TEST_UNSET_KEY")),
            other => panic!("expected auth error, got {other:?}"),
        }
        assert!(matches!(
            provider.complete(&fixture_request(CompletionPhase::Planning)),
            Err(ProviderError::Auth(_))
        ));
    }

    #[test]
    fn response_text_extraction() {
        let openai = json!({
            "choices": [{"message": {"role": "assistant", "content": "hello"}}],
            "usage": {"prompt_tokens": 12, "completion_tokens": 3}
        });
        assert_eq!(
            extract_openai_text(&openai),
            Ok(("hello".to_string(), Some(12), Some(3)))
        );
        assert!(extract_openai_text(&json!({"choices": []})).is_err());

        let anthropic = json!({
            "content": [
                {"type": "text", "text": "part one, "},
                {"type": "tool_use", "id": "x"},
                {"type": "text", "text": "part two"}
            ],
            "usage": {"input_tokens": 7, "output_tokens": 9}
        });
        assert_eq!(
            extract_anthropic_text(&anthropic),
            Ok(("part one, part two".to_string(), Some(7), Some(9)))
        );
        assert!(extract_anthropic_text(&json!({"content": []})).is_err());
    }

    #[test]
    fn scripted_provider_replays_in_order() {
        let provider = ScriptedProvider::new([
            Ok("first".to_string()),
            Err(ProviderError::RateLimit("later".to_string())),
        ]);
        let request = fixture_request(CompletionPhase::Planning);
        assert_eq!(
            provider.complete(&request).map(|completion| completion.text),
            Ok("first".to_string())
        );
        assert!(matches!(
            provider.complete(&request),
            Err(ProviderError::RateLimit(_))
        ));
        assert!(provider.complete(&request).is_err());
        assert_eq!(provider.requests().len(), 3);
        assert_eq!(provider.remaining(), 0);
    }

    #[test]
    fn unknown_provider_is_rejected() {
        let settings = ProviderSettings {
            provider_name: "cohere".to_string(),
            ..ProviderSettings::default()
        };
        assert!(build_provider(&settings).is_err());
    }
}
