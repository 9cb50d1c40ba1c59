#![forbid(unsafe_code)]

mod plan;
mod prompts;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, Result};
use planwise_domain::{
    ensure_non_empty, ExecutionSettings, FindingEntry, FindingOutcome, Plan, Report, Run, RunId,
    RunStatus, Step, ToolArguments, TraceSummary,
};
use planwise_provider::{CompletionPhase, CompletionProvider, CompletionRequest, ProviderError};
use planwise_tools::{ToolExecutor, TracedTools};
use planwise_trace_core::{RunMetadata, TraceHandle, TraceSinkFactory};
use serde_json::{json, Value};
use tracing::{info, warn};

pub use plan::{extract_json_block, fallback_plan, parse_plan, ParsedPlan, PlanParseError};
pub use prompts::{planning_prompt, synthesis_prompt};

pub const INVALID_STEP_DEFINITION: &str = "invalid_step_definition";
const SAVE_FINDINGS_TOOL: &str = "save_findings";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPhase {
    Init,
    Planning,
    Executing,
    Synthesizing,
    Completed,
    Failed,
}

impl RunPhase {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Planning => "planning",
            Self::Executing => "executing",
            Self::Synthesizing => "synthesizing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        match (self, next) {
            (Self::Init, Self::Planning)
            | (Self::Planning, Self::Executing)
            | (Self::Executing, Self::Synthesizing)
            | (Self::Synthesizing, Self::Completed) => true,
            (from, Self::Failed) => !from.is_terminal(),
            _ => false,
        }
    }
}

/// Cooperative cancellation, checked before each step and before synthesis.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum SynthesisFailure {
    #[error("synthesis provider call failed: {0}")]
    Provider(ProviderError),
    #[error("synthesis produced an empty report")]
    EmptyOutput,
    #[error("report could not be persisted: {0}")]
    ReportPersist(String),
}

#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum RunError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("{0}")]
    Synthesis(SynthesisFailure),
    #[error("run cancelled during {phase}")]
    Cancelled { phase: String },
    #[error("tool error budget exceeded: {failed} of {attempted} steps failed (limit {max_rate})")]
    ErrorBudgetExceeded {
        failed: usize,
        attempted: usize,
        max_rate: f64,
    },
}

impl RunError {
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Config(_) => "config",
            Self::Synthesis(_) => "synthesis",
            Self::Cancelled { .. } => "cancelled",
            Self::ErrorBudgetExceeded { .. } => "error_budget_exceeded",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunRequest {
    pub topic: String,
    pub run_id: Option<RunId>,
    pub report_filename: Option<String>,
    pub profile_hash: Option<String>,
}

impl RunRequest {
    #[must_use]
    pub fn new(topic: &str) -> Self {
        Self {
            topic: topic.to_string(),
            run_id: None,
            report_filename: None,
            profile_hash: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunOutcome {
    pub run: Run,
    pub plan: Option<Plan>,
    pub findings: Vec<FindingEntry>,
    pub report: Option<Report>,
    pub error: Option<RunError>,
    pub summary: Option<TraceSummary>,
}

impl RunOutcome {
    #[must_use]
    pub fn tool_error_count(&self) -> usize {
        self.findings.iter().filter(|entry| !entry.is_ok()).count()
    }
}

struct RunContext {
    phase: RunPhase,
    run: Run,
    plan: Option<Plan>,
    findings: Vec<FindingEntry>,
}

impl RunContext {
    fn advance(&mut self, next: RunPhase) -> Result<()> {
        if !self.phase.can_transition_to(next) {
            return Err(anyhow!(
                "illegal run phase transition {} -> {}",
                self.phase.as_str(),
                next.as_str()
            ));
        }
        self.phase = next;
        Ok(())
    }

    fn into_outcome(
        self,
        report: Option<Report>,
        error: Option<RunError>,
        summary: Option<TraceSummary>,
    ) -> RunOutcome {
        RunOutcome {
            run: self.run,
            plan: self.plan,
            findings: self.findings,
            report,
            error,
            summary,
        }
    }
}

pub struct Orchestrator<'a> {
    provider: &'a dyn CompletionProvider,
    tools: &'a ToolExecutor,
    trace_factory: Option<&'a dyn TraceSinkFactory>,
    settings: ExecutionSettings,
}

impl<'a> Orchestrator<'a> {
    /// `trace_factory: None` runs with tracing disabled.
    #[must_use]
    pub fn new(
        provider: &'a dyn CompletionProvider,
        tools: &'a ToolExecutor,
        trace_factory: Option<&'a dyn TraceSinkFactory>,
        settings: ExecutionSettings,
    ) -> Self {
        Self {
            provider,
            tools,
            trace_factory,
            settings,
        }
    }

    /// Run Plan -> Execute -> Synthesize for one topic.
    ///
    /// Run-level failures (configuration, synthesis, cancellation, error budget)
    /// are reported in `RunOutcome::error`.
    ///
    /// # Errors
    /// Returns an error only when the trace cannot be persisted.
    pub fn execute(&self, request: RunRequest, cancel: &CancellationToken) -> Result<RunOutcome> {
        let run_id = request.run_id.unwrap_or_default();
        let trace = self.open_trace(run_id, &request)?;
        let mut ctx = RunContext {
            phase: RunPhase::Init,
            run: Run::start(run_id, request.topic.trim()),
            plan: None,
            findings: Vec::new(),
        };
        info!(run_id = %run_id, topic = %ctx.run.topic, tracing = trace.is_enabled(), "run started");

        if let Err(err) = self.preflight(&request.topic) {
            return self.fail(ctx, &trace, err);
        }

        ctx.advance(RunPhase::Planning)?;
        let plan = self.plan(&ctx.run, &trace)?;
        ctx.plan = Some(plan.clone());

        ctx.advance(RunPhase::Executing)?;
        let tools = self.tools.bind(&trace);
        trace.log_phase(
            "execution",
            "started",
            json!({ "step_count": plan.steps.len() }),
        )?;
        for step in &plan.steps {
            if cancel.is_cancelled() {
                let phase = RunPhase::Executing.as_str().to_string();
                return self.fail(ctx, &trace, RunError::Cancelled { phase });
            }
            let entry = execute_step(&tools, step)?;
            ctx.findings.push(entry);
            if let Some(err) = self.budget_exceeded(&ctx.findings, plan.steps.len()) {
                return self.fail(ctx, &trace, err);
            }
        }
        let error_count = ctx.findings.iter().filter(|entry| !entry.is_ok()).count();
        trace.log_phase(
            "execution",
            "completed",
            json!({ "step_count": ctx.findings.len(), "error_count": error_count }),
        )?;

        if cancel.is_cancelled() {
            let phase = RunPhase::Synthesizing.as_str().to_string();
            return self.fail(ctx, &trace, RunError::Cancelled { phase });
        }

        ctx.advance(RunPhase::Synthesizing)?;
        let report_filename = request
            .report_filename
            .clone()
            .unwrap_or_else(|| format!("{run_id}_report.md"));
        let report = match self.synthesize(&ctx, &plan, &tools, &trace, &report_filename)? {
            Ok(report) => report,
            Err(failure) => return self.fail(ctx, &trace, RunError::Synthesis(failure)),
        };

        ctx.advance(RunPhase::Completed)?;
        trace.log_final_report(&report)?;
        ctx.run.finish(RunStatus::Success)?;
        let summary = trace.complete(RunStatus::Success, None)?;
        info!(
            run_id = %run_id,
            steps = ctx.findings.len(),
            tool_errors = error_count,
            report = %report.path.display(),
            "run completed"
        );
        Ok(ctx.into_outcome(Some(report), None, summary))
    }

    fn open_trace(&self, run_id: RunId, request: &RunRequest) -> Result<TraceHandle> {
        let Some(factory) = self.trace_factory else {
            return Ok(TraceHandle::disabled(run_id));
        };
        let metadata = RunMetadata {
            topic: request.topic.trim().to_string(),
            provider: self.provider.provider_name().to_string(),
            model: self.provider.model_id().to_string(),
            profile_hash: request.profile_hash.clone(),
            preview_max_chars: self.tools.preview_max_chars(),
        };
        TraceHandle::start(factory.open(run_id)?, run_id, &metadata)
    }

    fn preflight(&self, topic: &str) -> Result<(), RunError> {
        ensure_non_empty("topic", topic).map_err(|err| RunError::Config(err.to_string()))?;
        self.provider
            .preflight()
            .map_err(|err| RunError::Config(err.to_string()))
    }

    fn plan(&self, run: &Run, trace: &TraceHandle) -> Result<Plan> {
        trace.log_phase("planning", "started", json!({ "topic": run.topic }))?;
        let request = CompletionRequest {
            run_id: run.run_id,
            phase: CompletionPhase::Planning,
            topic: run.topic.clone(),
            prompt: planning_prompt(
                &run.topic,
                &self.tools.registry().specs(),
                self.settings.max_plan_steps,
            ),
        };

        let (plan, truncated) = match self.provider.complete(&request) {
            Ok(completion) => {
                trace.log_message_snapshot("planner", &completion.text)?;
                match parse_plan(&completion.text, self.settings.max_plan_steps) {
                    Ok(parsed) => (parsed.plan, parsed.truncated),
                    Err(err) => {
                        warn!(run_id = %run.run_id, code = err.code(), error = %err, "planner output unusable; using fallback plan");
                        (fallback_plan(&run.topic, &format!("{}: {err}", err.code())), false)
                    }
                }
            }
            Err(err) => {
                warn!(run_id = %run.run_id, code = err.code(), error = %err, "planner call failed; using fallback plan");
                let reason = format!("planner_provider_error: {err}");
                (fallback_plan(&run.topic, &reason), false)
            }
        };

        trace.log_phase(
            "planning",
            "completed",
            json!({
                "step_count": plan.steps.len(),
                "used_fallback": plan.used_fallback(),
                "fallback_reason": plan.fallback_reason,
                "truncated": truncated,
            }),
        )?;
        info!(run_id = %run.run_id, steps = plan.steps.len(), fallback = plan.used_fallback(), "plan ready");
        Ok(plan)
    }

    fn budget_exceeded(&self, findings: &[FindingEntry], total_steps: usize) -> Option<RunError> {
        let max_rate = self.settings.max_tool_error_rate?;
        let attempted = findings.len();
        if attempted >= total_steps || attempted < self.settings.min_steps_for_error_rate {
            return None;
        }
        let failed = findings.iter().filter(|entry| !entry.is_ok()).count();
        #[allow(clippy::cast_precision_loss)]
        let rate = failed as f64 / attempted as f64;
        if rate > max_rate {
            Some(RunError::ErrorBudgetExceeded {
                failed,
                attempted,
                max_rate,
            })
        } else {
            None
        }
    }

    /// Outer `Err` is trace I/O; inner `Err` is a synthesis-class run failure.
    fn synthesize(
        &self,
        ctx: &RunContext,
        plan: &Plan,
        tools: &TracedTools<'_>,
        trace: &TraceHandle,
        report_filename: &str,
    ) -> Result<Result<Report, SynthesisFailure>> {
        trace.log_phase(
            "synthesis",
            "started",
            json!({ "finding_count": ctx.findings.len() }),
        )?;
        let errors: Vec<String> = ctx
            .findings
            .iter()
            .filter_map(FindingEntry::error_text)
            .collect();
        let request = CompletionRequest {
            run_id: ctx.run.run_id,
            phase: CompletionPhase::Synthesis,
            topic: ctx.run.topic.clone(),
            prompt: synthesis_prompt(&ctx.run.topic, &plan.plan_text, &ctx.findings, &errors),
        };

        let content = match self.provider.complete(&request) {
            Ok(completion) => completion.text,
            Err(err) => return Ok(Err(SynthesisFailure::Provider(err))),
        };
        if content.trim().is_empty() {
            return Ok(Err(SynthesisFailure::EmptyOutput));
        }
        trace.log_message_snapshot("synthesis", &content)?;

        let mut arguments = ToolArguments::new();
        arguments.insert(
            "filename".to_string(),
            Value::String(report_filename.to_string()),
        );
        arguments.insert("content".to_string(), Value::String(content.clone()));
        let saved = tools.invoke(SAVE_FINDINGS_TOOL, arguments)?;
        let saved_path = saved
            .output
            .as_ref()
            .and_then(|output| output.get("path"))
            .and_then(Value::as_str)
            .map(PathBuf::from);
        let Some(path) = saved_path else {
            return Ok(Err(SynthesisFailure::ReportPersist(
                saved.invocation.result_preview,
            )));
        };

        trace.log_phase(
            "synthesis",
            "completed",
            json!({ "report_len": content.chars().count() }),
        )?;
        Ok(Ok(Report::new(content, path)))
    }

    fn fail(&self, mut ctx: RunContext, trace: &TraceHandle, error: RunError) -> Result<RunOutcome> {
        let from = ctx.phase;
        ctx.advance(RunPhase::Failed)?;
        ctx.run.finish(RunStatus::Error)?;
        warn!(
            run_id = %ctx.run.run_id,
            phase = from.as_str(),
            code = error.code(),
            error = %error,
            provider = self.provider.provider_name(),
            "run failed"
        );
        let cause = error.to_string();
        let summary = trace.complete(RunStatus::Error, Some(cause.as_str()))?;
        Ok(ctx.into_outcome(None, Some(error), summary))
    }
}

fn inline_error(step: &Step, message: &str) -> FindingEntry {
    FindingEntry {
        step: step.clone(),
        outcome: FindingOutcome::Inline {
            code: INVALID_STEP_DEFINITION.to_string(),
            message: message.to_string(),
        },
    }
}

fn execute_step(tools: &TracedTools<'_>, step: &Step) -> Result<FindingEntry> {
    let Some(tool_name) = step.tool_hint.as_deref() else {
        return Ok(inline_error(step, "step names no tool"));
    };
    let input = step.tool_input().trim();
    if input.is_empty() {
        return Ok(inline_error(step, "step has no input"));
    }
    let arguments = tools.executor().arguments_for(tool_name, input);
    let outcome = tools.invoke(tool_name, arguments)?;
    Ok(FindingEntry {
        step: step.clone(),
        outcome: FindingOutcome::Tool {
            invocation: outcome.invocation,
            output: outcome.output,
        },
    })
}
