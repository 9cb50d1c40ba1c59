use planwise_domain::{Plan, PlanSource, Step};
use serde::Deserialize;
use serde_json::Value;

const DEFAULT_PLAN_TEXT: &str = "Planner generated a structured plan.";

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum PlanParseError {
    #[error("planner output contains no JSON")]
    MissingJson,
    #[error("planner JSON does not parse: {0}")]
    InvalidJson(String),
    #[error("planner returned no steps")]
    NoSteps,
    #[error("plan step {index} is malformed: {reason}")]
    InvalidStep { index: usize, reason: String },
}

impl PlanParseError {
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::MissingJson => "plan_json_missing",
            Self::InvalidJson(_) => "plan_json_parse_failed",
            Self::NoSteps => "plan_steps_empty",
            Self::InvalidStep { .. } => "plan_step_invalid",
        }
    }
}

/// Planner step as emitted by a model; every field is optional.
#[derive(Debug, Default, Deserialize)]
struct RawPlanStep {
    #[serde(default)]
    id: Option<Value>,
    #[serde(default, alias = "tool_hint")]
    tool: Option<Value>,
    #[serde(default)]
    input: Option<Value>,
    #[serde(default)]
    description: Option<Value>,
    #[serde(default)]
    expected_output: Option<Value>,
}

fn text_of(value: Option<&Value>) -> Option<String> {
    let text = match value? {
        Value::Null => return None,
        Value::String(text) => text.trim().to_string(),
        other => other.to_string(),
    };
    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}

impl RawPlanStep {
    fn into_step(self, index: usize) -> Step {
        let tool_hint = text_of(self.tool.as_ref());
        let input = text_of(self.input.as_ref());
        let expected_output = text_of(self.expected_output.as_ref());
        let description = text_of(self.description.as_ref())
            .or_else(|| expected_output.clone())
            .or_else(|| input.clone())
            .or_else(|| text_of(self.id.as_ref()))
            .unwrap_or_default();
        Step {
            index,
            description,
            tool_hint,
            input,
            expected_output,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedPlan {
    pub plan: Plan,
    pub truncated: bool,
}

/// Locate the JSON payload in model output: a fenced block first, else the outermost braces.
#[must_use]
pub fn extract_json_block(text: &str) -> Option<&str> {
    if let Some(start) = text.find("```json") {
        let body = &text[start + "```json".len()..];
        if let Some(end) = body.find("```") {
            return Some(body[..end].trim());
        }
    }
    let mut rest = text;
    while let Some(start) = rest.find("```") {
        let body = &rest[start + 3..];
        let Some(end) = body.find("```") else {
            break;
        };
        let inner = body[..end]
            .trim_start_matches(|ch: char| ch.is_ascii_alphanumeric())
            .trim();
        if inner.starts_with('{') || inner.starts_with('[') {
            return Some(inner);
        }
        rest = &body[end + 3..];
    }
    let mut candidates: Vec<(usize, &str)> = [('{', '}'), ('[', ']')]
        .into_iter()
        .filter_map(|(open, close)| {
            let start = text.find(open)?;
            let end = text.rfind(close)?;
            (start < end).then(|| (start, &text[start..=end]))
        })
        .collect();
    candidates.sort_by_key(|(start, _)| *start);
    candidates
        .iter()
        .find(|(_, candidate)| serde_json::from_str::<Value>(candidate).is_ok())
        .or_else(|| candidates.first())
        .map(|(_, candidate)| *candidate)
}

/// Parse planner output into a plan of at most `max_steps` steps.
///
/// # Errors
/// Returns a `PlanParseError` when no usable plan can be read from `raw`.
pub fn parse_plan(raw: &str, max_steps: usize) -> Result<ParsedPlan, PlanParseError> {
    let block = extract_json_block(raw).ok_or(PlanParseError::MissingJson)?;
    let value: Value =
        serde_json::from_str(block).map_err(|err| PlanParseError::InvalidJson(err.to_string()))?;

    let (plan_text, raw_steps) = match value {
        Value::Array(items) => (None, items),
        Value::Object(mut fields) => {
            let plan_text = text_of(fields.get("plan_text"));
            match fields.remove("steps") {
                Some(Value::Array(items)) => (plan_text, items),
                Some(Value::Null) | None => (plan_text, Vec::new()),
                Some(_) => {
                    return Err(PlanParseError::InvalidJson(
                        "steps must be an array".to_string(),
                    ))
                }
            }
        }
        _ => {
            return Err(PlanParseError::InvalidJson(
                "expected an object or array".to_string(),
            ))
        }
    };
    if raw_steps.is_empty() {
        return Err(PlanParseError::NoSteps);
    }

    let truncated = raw_steps.len() > max_steps;
    let mut steps = Vec::with_capacity(raw_steps.len().min(max_steps));
    for (index, item) in raw_steps.into_iter().take(max_steps).enumerate() {
        let raw_step: RawPlanStep =
            serde_json::from_value(item).map_err(|err| PlanParseError::InvalidStep {
                index,
                reason: err.to_string(),
            })?;
        steps.push(raw_step.into_step(index));
    }

    Ok(ParsedPlan {
        plan: Plan {
            plan_text: plan_text.unwrap_or_else(|| DEFAULT_PLAN_TEXT.to_string()),
            steps,
            source: PlanSource::Planner,
            fallback_reason: None,
        },
        truncated,
    })
}

fn fallback_step(index: usize, tool: &str, input: String, expected_output: &str) -> Step {
    Step {
        index,
        description: expected_output.to_string(),
        tool_hint: Some(tool.to_string()),
        input: Some(input),
        expected_output: Some(expected_output.to_string()),
    }
}

/// Fixed four-step plan used whenever planning yields nothing usable.
#[must_use]
pub fn fallback_plan(topic: &str, reason: &str) -> Plan {
    let topic = topic.trim();
    Plan {
        plan_text: format!("Fallback plan used ({reason})."),
        steps: vec![
            fallback_step(
                0,
                "web_search",
                format!("{topic} market size current year"),
                "current market size estimate with sources",
            ),
            fallback_step(
                1,
                "web_search",
                format!("{topic} forecast CAGR 2024 2026"),
                "growth forecast and CAGR figures",
            ),
            fallback_step(
                2,
                "web_search",
                format!("{topic} top players and competitive landscape"),
                "leading companies and market positioning",
            ),
            fallback_step(
                3,
                "calculator",
                "((10.9 / 3.66) ** (1/3) - 1) * 100".to_string(),
                "illustrative CAGR computation",
            ),
        ],
        source: PlanSource::Fallback,
        fallback_reason: Some(reason.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::{extract_json_block, fallback_plan, parse_plan, PlanParseError};
    use planwise_domain::PlanSource;

    #[test]
    fn fenced_plan_is_parsed() {
        let raw = "Here you go:\n```json\n{\"plan_text\": \"size then compute\", \"steps\": [\
            {\"id\": \"step_1\", \"tool\": \"web_search\", \"input\": \"ev market\", \"expected_output\": \"size\"},\
            {\"id\": \"step_2\", \"tool\": \"calculator\", \"input\": \"(120-100)/100*100\"}\
            ]}\n```\nDone.";
        let parsed = parse_plan(raw, 8).unwrap_or_else(|err| panic!("plan should parse: {err}"));
        assert!(!parsed.truncated);
        let plan = parsed.plan;
        assert_eq!(plan.source, PlanSource::Planner);
        assert_eq!(plan.plan_text, "size then compute");
        assert_eq!(plan.steps.len(), 2);
        assert_eq!(plan.steps[0].index, 0);
        assert_eq!(plan.steps[0].description, "size");
        assert_eq!(plan.steps[1].tool_hint.as_deref(), Some("calculator"));
        assert_eq!(plan.steps[1].tool_input(), "(120-100)/100*100");
    }

    #[test]
    fn bare_array_and_truncation() {
        let raw = r#"[{"tool":"web_search","input":"a"},{"tool":"web_search","input":"b"},{"tool":"web_search","input":"c"}]"#;
        let parsed = parse_plan(raw, 2).unwrap_or_else(|err| panic!("plan should parse: {err}"));
        assert!(parsed.truncated);
        assert_eq!(parsed.plan.steps.len(), 2);
        assert_eq!(parsed.plan.steps[1].index, 1);
    }

    #[test]
    fn malformed_output_is_classified() {
        assert_eq!(
            parse_plan("Let me think about market sizing.", 8),
            Err(PlanParseError::MissingJson)
        );
        assert!(matches!(
            parse_plan("```json\n{\"steps\": [ }\n```", 8),
            Err(PlanParseError::InvalidJson(_))
        ));
        assert_eq!(
            parse_plan("{\"plan_text\": \"x\", \"steps\": []}", 8),
            Err(PlanParseError::NoSteps)
        );
        assert!(matches!(
            parse_plan("{\"steps\": [\"just text\"]}", 8),
            Err(PlanParseError::InvalidStep { index: 0, .. })
        ));
    }

    #[test]
    fn steps_without_tool_are_kept_for_execution() {
        let parsed = parse_plan(r#"{"steps": [{"input": "something"}]}"#, 8)
            .unwrap_or_else(|err| panic!("plan should parse: {err}"));
        assert_eq!(parsed.plan.steps[0].tool_hint, None);
        assert_eq!(parsed.plan.plan_text, "Planner generated a structured plan.");
    }

    #[test]
    fn bare_array_is_not_cut_at_inner_braces() {
        let raw = r#"[{"tool":"web_search","input":"a"},{"tool":"web_search","input":"b"}]"#;
        assert_eq!(extract_json_block(raw), Some(raw));
        let parsed = parse_plan(raw, 8).unwrap_or_else(|err| panic!("plan should parse: {err}"));
        assert_eq!(parsed.plan.steps.len(), 2);
        assert_eq!(parsed.plan.steps[1].tool_input(), "b");
    }

    #[test]
    fn bracketed_prose_before_object_is_skipped() {
        let raw = r#"Plan [draft]: {"steps": [{"tool": "calculator", "input": "1+1"}]}"#;
        let parsed = parse_plan(raw, 8).unwrap_or_else(|err| panic!("plan should parse: {err}"));
        assert_eq!(parsed.plan.steps.len(), 1);
        assert_eq!(parsed.plan.steps[0].tool_hint.as_deref(), Some("calculator"));
    }

    #[test]
    fn untagged_fence_is_accepted() {
        let raw = "```\n{\"steps\": [{\"tool\": \"calculator\", \"input\": \"1+1\"}]}\n```";
        assert_eq!(
            extract_json_block(raw),
            Some("{\"steps\": [{\"tool\": \"calculator\", \"input\": \"1+1\"}]}")
        );
    }

    #[test]
    fn fallback_plan_is_topic_parameterized() {
        let plan = fallback_plan("solid-state batteries", "plan_json_missing");
        assert_eq!(plan.source, PlanSource::Fallback);
        assert_eq!(plan.steps.len(), 4);
        assert_eq!(
            plan.steps[0].tool_input(),
            "solid-state batteries market size current year"
        );
        assert_eq!(plan.steps[3].tool_hint.as_deref(), Some("calculator"));
        assert_eq!(plan.fallback_reason.as_deref(), Some("plan_json_missing"));
        for (position, step) in plan.steps.iter().enumerate() {
            assert_eq!(step.index, position);
        }
    }
}
