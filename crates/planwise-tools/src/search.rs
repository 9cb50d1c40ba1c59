use std::time::Duration;

use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::{Capability, ParamSpec, ToolError, ToolSpec};
use planwise_domain::{ToolArguments, ToolSettings};

const SERPER_URL: &str = "https://google.serper.dev/search";
const DUCKDUCKGO_URL: &str = "https://api.duckduckgo.com/";
const WIKIPEDIA_API_URL: &str = "https://en.wikipedia.org/w/api.php";
const WIKIPEDIA_PAGE_URL: &str = "https://en.wikipedia.org/wiki/";

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct SearchHit {
    pub title: String,
    pub snippet: String,
    pub url: String,
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum SearchError {
    #[error("missing credential: environment variable {0} is not set")]
    MissingCredential(String),
    #[error("timed out after {0}ms")]
    Timeout(u64),
    #[error("http status {0}")]
    Http(u16),
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("undecodable response: {0}")]
    Decode(String),
    #[error("no results")]
    Empty,
}

impl SearchError {
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::MissingCredential(_) => "missing_credential",
            Self::Timeout(_) => "timeout",
            Self::Http(_) => "http_status",
            Self::Transport(_) => "transport",
            Self::Decode(_) => "decode",
            Self::Empty => "empty",
        }
    }
}

pub trait SearchBackend: Send + Sync {
    fn name(&self) -> &str;

    #[allow(clippy::missing_errors_doc)]
    fn search(&self, query: &str, max_results: usize) -> Result<Vec<SearchHit>, SearchError>;
}

#[derive(Debug, Clone)]
struct SearchHttp {
    agent: ureq::Agent,
    timeout_ms: u64,
}

impl SearchHttp {
    fn new(timeout_ms: u64) -> Self {
        Self {
            agent: ureq::AgentBuilder::new()
                .timeout(Duration::from_millis(timeout_ms))
                .build(),
            timeout_ms,
        }
    }

    fn send(&self, request: ureq::Request, body: Option<&Value>) -> Result<Value, SearchError> {
        let response = match body {
            Some(body) => request.send_json(body),
            None => request.call(),
        };
        match response {
            Ok(response) => response.into_json::<Value>().map_err(|err| {
                if is_timeout_io(&err) {
                    SearchError::Timeout(self.timeout_ms)
                } else {
                    SearchError::Decode(err.to_string())
                }
            }),
            Err(ureq::Error::Status(code, _)) => Err(SearchError::Http(code)),
            Err(ureq::Error::Transport(transport)) => {
                let timed_out = std::error::Error::source(&transport)
                    .and_then(|source| source.downcast_ref::<std::io::Error>())
                    .is_some_and(is_timeout_io);
                if timed_out {
                    Err(SearchError::Timeout(self.timeout_ms))
                } else {
                    Err(SearchError::Transport(transport.to_string()))
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

fn non_empty(hits: Vec<SearchHit>) -> Result<Vec<SearchHit>, SearchError> {
    if hits.is_empty() {
        Err(SearchError::Empty)
    } else {
        Ok(hits)
    }
}

fn str_field(value: &Value, key: &str) -> String {
    value
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .trim()
        .to_string()
}

/// Google results through serper.dev; needs an API key.
#[derive(Debug, Clone)]
pub struct SerperBackend {
    api_key_env: String,
    api_key: Option<String>,
    http: SearchHttp,
}

impl SerperBackend {
    #[must_use]
    pub fn new(api_key_env: &str, api_key: Option<String>, timeout_ms: u64) -> Self {
        Self {
            api_key_env: api_key_env.to_string(),
            api_key: api_key.filter(|key| !key.trim().is_empty()),
            http: SearchHttp::new(timeout_ms),
        }
    }

    #[must_use]
    pub fn from_env(api_key_env: &str, timeout_ms: u64) -> Self {
        Self::new(api_key_env, std::env::var(api_key_env).ok(), timeout_ms)
    }
}

impl SearchBackend for SerperBackend {
    fn name(&self) -> &str {
        "serper"
    }

    fn search(&self, query: &str, max_results: usize) -> Result<Vec<SearchHit>, SearchError> {
        let Some(api_key) = self.api_key.as_deref() else {
            return Err(SearchError::MissingCredential(self.api_key_env.clone()));
        };
        let request = self.http.agent.post(SERPER_URL).set("X-API-KEY", api_key);
        let body = self
            .http
            .send(request, Some(&json!({ "q": query, "num": max_results })))?;
        non_empty(parse_serper(&body, max_results))
    }
}

#[must_use]
pub fn parse_serper(body: &Value, max_results: usize) -> Vec<SearchHit> {
    body.get("organic")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .take(max_results)
                .map(|item| SearchHit {
                    title: str_field(item, "title"),
                    snippet: str_field(item, "snippet"),
                    url: str_field(item, "link"),
                })
                .collect()
        })
        .unwrap_or_default()
}

/// DuckDuckGo instant-answer API; no credential.
#[derive(Debug, Clone)]
pub struct DuckDuckGoBackend {
    http: SearchHttp,
}

impl DuckDuckGoBackend {
    #[must_use]
    pub fn new(timeout_ms: u64) -> Self {
        Self {
            http: SearchHttp::new(timeout_ms),
        }
    }
}

impl SearchBackend for DuckDuckGoBackend {
    fn name(&self) -> &str {
        "duckduckgo"
    }

    fn search(&self, query: &str, max_results: usize) -> Result<Vec<SearchHit>, SearchError> {
        let request = self
            .http
            .agent
            .get(DUCKDUCKGO_URL)
            .query("q", query)
            .query("format", "json")
            .query("no_html", "1")
            .query("skip_disambig", "1");
        let body = self.http.send(request, None)?;
        non_empty(parse_duckduckgo(&body, max_results))
    }
}

#[must_use]
pub fn parse_duckduckgo(body: &Value, max_results: usize) -> Vec<SearchHit> {
    let mut hits = Vec::new();
    let abstract_text = str_field(body, "AbstractText");
    if !abstract_text.is_empty() {
        hits.push(SearchHit {
            title: str_field(body, "Heading"),
            snippet: abstract_text,
            url: str_field(body, "AbstractURL"),
        });
    }

    let topics = body
        .get("RelatedTopics")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default();
    // grouped topics nest their entries one level down
    let mut flattened = Vec::new();
    for topic in topics {
        match topic.get("Topics").and_then(Value::as_array) {
            Some(children) => flattened.extend(children.iter()),
            None => flattened.push(topic),
        }
    }
    for topic in flattened {
        let text = str_field(topic, "Text");
        let url = str_field(topic, "FirstURL");
        if text.is_empty() || url.is_empty() {
            continue;
        }
        let title = text.split(" - ").next().unwrap_or(&text).to_string();
        hits.push(SearchHit {
            title,
            snippet: text,
            url,
        });
    }
    hits.truncate(max_results);
    hits
}

/// MediaWiki full-text search; no credential.
#[derive(Debug, Clone)]
pub struct WikipediaBackend {
    http: SearchHttp,
}

impl WikipediaBackend {
    #[must_use]
    pub fn new(timeout_ms: u64) -> Self {
        Self {
            http: SearchHttp::new(timeout_ms),
        }
    }
}

impl SearchBackend for WikipediaBackend {
    fn name(&self) -> &str {
        "wikipedia"
    }

    fn search(&self, query: &str, max_results: usize) -> Result<Vec<SearchHit>, SearchError> {
        let limit = max_results.to_string();
        let request = self
            .http
            .agent
            .get(WIKIPEDIA_API_URL)
            .query("action", "query")
            .query("list", "search")
            .query("srsearch", query)
            .query("srlimit", &limit)
            .query("format", "json")
            .set("user-agent", "planwise-research/0.1");
        let body = self.http.send(request, None)?;
        non_empty(parse_wikipedia(&body, max_results))
    }
}

#[must_use]
pub fn parse_wikipedia(body: &Value, max_results: usize) -> Vec<SearchHit> {
    body.pointer("/query/search")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .take(max_results)
                .filter_map(|item| {
                    let title = str_field(item, "title");
                    if title.is_empty() {
                        return None;
                    }
                    let url = format!("{WIKIPEDIA_PAGE_URL}{}", title.replace(' ', "_"));
                    Some(SearchHit {
                        snippet: strip_markup(&str_field(item, "snippet")),
                        title,
                        url,
                    })
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Drop HTML tags and decode the handful of entities MediaWiki snippets use.
#[must_use]
pub fn strip_markup(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut in_tag = false;
    for ch in input.chars() {
        match ch {
            '<' => in_tag = true,
            '>' if in_tag => in_tag = false,
            _ if !in_tag => out.push(ch),
            _ => {}
        }
    }
    out.replace("&quot;", "\"")
        .replace("&#039;", "'")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&amp;", "&")
}

/// Build the configured backends in order. Unknown names are skipped.
#[must_use]
pub fn backends_from_settings(settings: &ToolSettings) -> Vec<Box<dyn SearchBackend>> {
    settings
        .search_backends
        .iter()
        .filter_map(|name| -> Option<Box<dyn SearchBackend>> {
            match name.as_str() {
                "serper" => Some(Box::new(SerperBackend::from_env(
                    &settings.serper_api_key_env,
                    settings.search_timeout_ms,
                ))),
                "duckduckgo" => Some(Box::new(DuckDuckGoBackend::new(settings.search_timeout_ms))),
                "wikipedia" => Some(Box::new(WikipediaBackend::new(settings.search_timeout_ms))),
                other => {
                    warn!(backend = other, "ignoring unknown search backend");
                    None
                }
            }
        })
        .collect()
}

const WEB_SEARCH_PARAMS: &[ParamSpec] = &[ParamSpec {
    name: "query",
    description: "search query text",
    required: true,
    max_len: 512,
}];

const WEB_SEARCH_SPEC: ToolSpec = ToolSpec {
    name: "web_search",
    description: "Search the web for evidence; returns titles, snippets and URLs.",
    params: WEB_SEARCH_PARAMS,
    primary_param: "query",
};

/// `web_search` capability: tries each backend in order until one returns hits.
pub struct WebSearch {
    backends: Vec<Box<dyn SearchBackend>>,
    max_results: usize,
}

impl WebSearch {
    #[must_use]
    pub fn new(backends: Vec<Box<dyn SearchBackend>>, max_results: usize) -> Self {
        Self {
            backends,
            max_results: max_results.max(1),
        }
    }

    #[must_use]
    pub fn backend_names(&self) -> Vec<String> {
        self.backends
            .iter()
            .map(|backend| backend.name().to_string())
            .collect()
    }
}

impl Capability for WebSearch {
    fn spec(&self) -> &ToolSpec {
        &WEB_SEARCH_SPEC
    }

    fn call(&self, arguments: &ToolArguments) -> Result<Value, ToolError> {
        let query = crate::required_str(arguments, "query")?;
        if self.backends.is_empty() {
            return Err(ToolError::Unavailable(
                "no search backends configured".to_string(),
            ));
        }

        let mut attempts = Vec::new();
        let mut causes = Vec::new();
        for backend in &self.backends {
            match backend.search(query, self.max_results) {
                Ok(hits) => {
                    debug!(backend = backend.name(), hits = hits.len(), "search succeeded");
                    return Ok(json!({
                        "query": query,
                        "provider": backend.name(),
                        "results": hits,
                        "attempts": attempts,
                    }));
                }
                Err(err) => {
                    warn!(backend = backend.name(), error = %err, "search backend failed; trying next");
                    attempts.push(json!({
                        "backend": backend.name(),
                        "error_code": err.code(),
                        "error": err.to_string(),
                    }));
                    causes.push(format!("{}: {err}", backend.name()));
                }
            }
        }
        Err(ToolError::Unavailable(format!(
            "all search backends failed ({})",
            causes.join("; ")
        )))
    }
}
