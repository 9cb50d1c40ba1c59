use std::fmt::Write as _;

use planwise_domain::{FindingEntry, FindingOutcome};
use planwise_tools::ToolSpec;
use serde_json::{json, Value};

/// Tools a planner may put in a step: the single-input ones.
fn plannable(specs: &[ToolSpec]) -> impl Iterator<Item = &ToolSpec> {
    specs.iter().filter(|spec| spec.params.len() == 1)
}

#[must_use]
pub fn planning_prompt(topic: &str, specs: &[ToolSpec], max_steps: usize) -> String {
    let tool_names: Vec<&str> = plannable(specs).map(|spec| spec.name).collect();
    let mut tools = String::new();
    for spec in plannable(specs) {
        let _ = writeln!(
            tools,
            "- {}: {} (input: {})",
            spec.name, spec.description, spec.primary_param
        );
    }
    let min_steps = max_steps.min(4);
    format!(
        r#"You are a planner for a market research agent.
Create a COMPLETE plan for topic: "{topic}".

Available tools:
{tools}
Return JSON only in this schema:
{{
  "plan_text": "high-level strategy",
  "steps": [
    {{
      "id": "step_1",
      "tool": "{tool_choice}",
      "input": "tool input string",
      "expected_output": "what this step should produce"
    }}
  ]
}}

Rules:
- {min_steps} to {max_steps} steps total.
- Prefer web_search for evidence gathering.
- Use calculator only for metric computations, with a plain arithmetic expression as input.
- Ensure steps are sequential and coherent.
"#,
        tool_choice = tool_names.join("\" | \""),
    )
}

fn finding_json(entry: &FindingEntry) -> Value {
    let step = &entry.step;
    let step_id = format!("step_{}", step.index + 1);
    match &entry.outcome {
        FindingOutcome::Tool { invocation, output } => json!({
            "step_id": step_id,
            "tool": invocation.tool_name,
            "input": step.tool_input(),
            "ok": invocation.is_ok(),
            "output": output.clone().unwrap_or_else(|| Value::String(invocation.result_preview.clone())),
            "expected_output": step.expected_output,
        }),
        FindingOutcome::Inline { code, message } => json!({
            "step_id": step_id,
            "tool": step.tool_hint.as_deref().unwrap_or("unknown"),
            "input": step.tool_input(),
            "ok": false,
            "output": format!("ERROR: {code}: {message}"),
            "expected_output": step.expected_output,
        }),
    }
}

#[must_use]
pub fn synthesis_prompt(
    topic: &str,
    plan_text: &str,
    findings: &[FindingEntry],
    errors: &[String],
) -> String {
    let findings: Vec<Value> = findings.iter().map(finding_json).collect();
    let findings_json =
        serde_json::to_string_pretty(&findings).unwrap_or_else(|_| "[]".to_string());
    let errors_json = serde_json::to_string_pretty(errors).unwrap_or_else(|_| "[]".to_string());
    format!(
        "You are a research synthesis agent.

Topic: {topic}
Plan summary:
{plan_text}

Findings JSON:
{findings_json}

Execution errors JSON:
{errors_json}

Write a professional markdown report with:
1) Executive Summary
2) Market Overview
3) Key Findings
4) Competitive Landscape
5) Recommendations
6) Sources

Requirements:
- Cite links from findings when available.
- Clearly state uncertainty or missing data if errors exist.
- Do NOT invent numbers without a source in findings.
"
    )
}
