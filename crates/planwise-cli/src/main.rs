use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{anyhow, Result};
use clap::{Args, Parser, Subcommand};
use planwise_domain::{RunId, RunStatus};
use planwise_orchestrator::{CancellationToken, Orchestrator, RunRequest};
use planwise_profile::{
    apply_env_overrides, default_profile, finalize_profile, load_profile_from_path,
    switch_provider, ProfileEnvelope,
};
use planwise_provider::build_provider;
use planwise_tools::ToolExecutor;
use planwise_trace_core::TraceSinkFactory;
use planwise_trace_jsonl::{events_path, JsonlTraceStore};
use serde_json::json;
use tracing::info;
use tracing_subscriber::EnvFilter;

const DEFAULT_TRACE_DIR: &str = "trajectories";

#[derive(Debug, Parser)]
#[command(name = "planwise")]
#[command(about = "Plan, execute and synthesize market research runs with JSONL trajectories")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    Run(RunArgs),
    Trace(TraceArgs),
    Replay(ReplayArgs),
    Profile(ProfileArgs),
}

#[derive(Debug, Args)]
struct RunArgs {
    topic: String,
    #[arg(long)]
    profile: Option<PathBuf>,
    #[arg(long)]
    provider: Option<String>,
    #[arg(long)]
    model: Option<String>,
    #[arg(long)]
    trace_dir: Option<PathBuf>,
    #[arg(long, default_value_t = false)]
    no_trace: bool,
    #[arg(long)]
    output_dir: Option<PathBuf>,
    #[arg(long)]
    report_name: Option<String>,
    #[arg(long)]
    run_id: Option<String>,
}

#[derive(Debug, Args)]
struct TraceArgs {
    #[command(subcommand)]
    command: TraceSubcommand,
}

#[derive(Debug, Subcommand)]
enum TraceSubcommand {
    Runs {
        #[arg(long, default_value = DEFAULT_TRACE_DIR)]
        trace_dir: PathBuf,
    },
    Events {
        #[arg(long, default_value = DEFAULT_TRACE_DIR)]
        trace_dir: PathBuf,
        #[arg(long)]
        run_id: String,
    },
}

#[derive(Debug, Args)]
struct ReplayArgs {
    #[arg(long, default_value = DEFAULT_TRACE_DIR)]
    trace_dir: PathBuf,
    #[arg(long)]
    run_id: String,
}

#[derive(Debug, Args)]
struct ProfileArgs {
    #[command(subcommand)]
    command: ProfileSubcommand,
}

#[derive(Debug, Subcommand)]
enum ProfileSubcommand {
    Show {
        #[arg(long)]
        profile: Option<PathBuf>,
    },
}

fn main() -> Result<ExitCode> {
    init_logging();
    let cli = Cli::parse();

    match cli.command {
        Commands::Run(args) => run_command(args),
        Commands::Trace(args) => trace_command(args).map(|()| ExitCode::SUCCESS),
        Commands::Replay(args) => replay_command(&args),
        Commands::Profile(args) => profile_command(args).map(|()| ExitCode::SUCCESS),
    }
}

/// Logs go to stderr; stdout carries command output only.
fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

/// Profile file (or defaults), then environment, then flags.
fn resolve_profile(path: Option<&Path>, args: Option<&RunArgs>) -> Result<ProfileEnvelope> {
    let base = match path {
        Some(path) => load_profile_from_path(path)?,
        None => default_profile()?,
    };
    let mut profile = base.profile;
    apply_env_overrides(&mut profile, |name| std::env::var(name).ok());

    if let Some(args) = args {
        if let Some(provider) = args.provider.as_deref() {
            switch_provider(&mut profile, provider);
        }
        if let Some(model) = args.model.as_deref() {
            profile.provider.model_id = model.trim().to_string();
        }
        if let Some(dir) = &args.trace_dir {
            profile.trace.trace_dir.clone_from(dir);
        }
        if args.no_trace {
            profile.trace.enabled = false;
        }
        if let Some(dir) = &args.output_dir {
            profile.tools.output_dir.clone_from(dir);
        }
    }
    finalize_profile(profile, base.source_hash)
}

#[allow(clippy::needless_pass_by_value)]
fn run_command(args: RunArgs) -> Result<ExitCode> {
    let envelope = resolve_profile(args.profile.as_deref(), Some(&args))?;
    let profile = &envelope.profile;
    let run_id = args.run_id.as_deref().map(RunId::parse).transpose()?;

    let provider = build_provider(&profile.provider)?;
    let tools = ToolExecutor::standard(&profile.tools)?;
    let store = JsonlTraceStore::new(&profile.trace.trace_dir);
    let trace_factory: Option<&dyn TraceSinkFactory> = if profile.trace.enabled {
        Some(&store)
    } else {
        None
    };
    info!(
        profile = %profile.profile_name,
        profile_hash = %envelope.profile_hash,
        provider = %profile.provider.provider_name,
        model = %profile.provider.model_id,
        tracing = profile.trace.enabled,
        "profile resolved"
    );

    let request = RunRequest {
        topic: args.topic.clone(),
        run_id,
        report_filename: args.report_name.clone(),
        profile_hash: Some(envelope.profile_hash.clone()),
    };
    let outcome = Orchestrator::new(
        provider.as_ref(),
        &tools,
        trace_factory,
        profile.execution.clone(),
    )
    .execute(request, &CancellationToken::new())?;

    let run_id = outcome.run.run_id;
    let report = outcome
        .report
        .as_ref()
        .map_or_else(|| "-".to_string(), |report| report.path.display().to_string());
    let trace = if profile.trace.enabled {
        events_path(store.dir(), run_id).display().to_string()
    } else {
        "disabled".to_string()
    };
    println!(
        "run_id={} status={} steps={} tool_errors={} report={} trace={}",
        run_id,
        outcome.run.status.as_str(),
        outcome.findings.len(),
        outcome.tool_error_count(),
        report,
        trace
    );

    match &outcome.error {
        None => Ok(ExitCode::SUCCESS),
        Some(err) => {
            eprintln!("run failed ({}): {err}", err.code());
            Ok(ExitCode::FAILURE)
        }
    }
}

fn trace_command(args: TraceArgs) -> Result<()> {
    match args.command {
        TraceSubcommand::Runs { trace_dir } => {
            let store = JsonlTraceStore::new(&trace_dir);
            for run_id in store.list_runs()? {
                let summary = store.read_summary(run_id)?;
                println!(
                    "{}",
                    json!({
                        "run_id": run_id,
                        "status": summary.as_ref().and_then(|summary| summary.status).map(RunStatus::as_str),
                        "topic": summary.as_ref().and_then(|summary| summary.topic.clone()),
                        "event_count": summary.as_ref().map(|summary| summary.event_count),
                    })
                );
            }
        }
        TraceSubcommand::Events { trace_dir, run_id } => {
            let store = JsonlTraceStore::new(&trace_dir);
            let run_id = RunId::parse(&run_id)?;
            let events = store.read_events(run_id)?;
            if events.is_empty() {
                return Err(anyhow!("no trace events for run_id {run_id}"));
            }
            for event in events {
                println!("{}", serde_json::to_string(&event)?);
            }
        }
    }
    Ok(())
}

fn replay_command(args: &ReplayArgs) -> Result<ExitCode> {
    let store = JsonlTraceStore::new(&args.trace_dir);
    let run_id = RunId::parse(&args.run_id)?;
    let report = store.replay(run_id)?;
    println!(
        "run_id={} events={} sequence_valid={} summary_matches={}",
        report.run_id,
        report.events.len(),
        report.sequence_valid(),
        report.summary_matches()
    );
    if let Some(err) = &report.sequence_error {
        eprintln!("sequence error: {err}");
    }
    if report.sequence_valid() && report.summary_matches() {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::FAILURE)
    }
}

fn profile_command(args: ProfileArgs) -> Result<()> {
    match args.command {
        ProfileSubcommand::Show { profile } => {
            let envelope = resolve_profile(profile.as_deref(), None)?;
            println!(
                "{}",
                serde_json::to_string_pretty(&json!({
                    "profile_hash": envelope.profile_hash,
                    "source_hash": envelope.source_hash,
                    "profile": envelope.profile_json,
                }))?
            );
        }
    }
    Ok(())
}
