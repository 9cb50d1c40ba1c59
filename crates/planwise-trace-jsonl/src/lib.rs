#![forbid(unsafe_code)]

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use parking_lot::Mutex;
use planwise_domain::{RunId, TraceEvent, TraceSummary};
use planwise_trace_core::{project_summary, verify_sequence, TraceSink, TraceSinkFactory};
use tracing::{debug, warn};

const EVENTS_SUFFIX: &str = ".jsonl";
const SUMMARY_SUFFIX: &str = ".summary.json";

#[must_use]
pub fn events_path(dir: &Path, run_id: RunId) -> PathBuf {
    dir.join(format!("{run_id}{EVENTS_SUFFIX}"))
}

#[must_use]
pub fn summary_path(dir: &Path, run_id: RunId) -> PathBuf {
    dir.join(format!("{run_id}{SUMMARY_SUFFIX}"))
}

/// One-file-per-run JSONL sink. The directory is created on the first append.
///
/// A failed write rolls the file back to its last complete line and stops the
/// sink; later appends are refused so the log never holds a torn or reused line.
pub struct JsonlTraceSink {
    dir: PathBuf,
    events_path: PathBuf,
    summary_path: PathBuf,
    file: Mutex<EventFile>,
}

#[derive(Default)]
struct EventFile {
    handle: Option<File>,
    failure: Option<String>,
}

impl JsonlTraceSink {
    #[must_use]
    pub fn new(dir: &Path, run_id: RunId) -> Self {
        Self {
            dir: dir.to_path_buf(),
            events_path: events_path(dir, run_id),
            summary_path: summary_path(dir, run_id),
            file: Mutex::new(EventFile::default()),
        }
    }

    #[must_use]
    pub fn events_path(&self) -> &Path {
        &self.events_path
    }

    fn open_file(&self) -> Result<File> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("failed to create trace dir {}", self.dir.display()))?;
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.events_path)
            .with_context(|| format!("failed to open {}", self.events_path.display()))
    }
}

impl TraceSink for JsonlTraceSink {
    fn append_event(&self, event: &TraceEvent) -> Result<()> {
        let mut line = serde_json::to_string(event)?;
        line.push('\n');

        let mut state = self.file.lock();
        if let Some(cause) = &state.failure {
            return Err(anyhow!(
                "trace log {} is unusable after a failed append: {cause}",
                self.events_path.display()
            ));
        }
        if state.handle.is_none() {
            state.handle = Some(self.open_file()?);
        }
        let Some(file) = state.handle.as_mut() else {
            return Err(anyhow!("trace file unavailable"));
        };
        let committed_len = file.metadata().map(|meta| meta.len()).ok();
        let written = file
            .write_all(line.as_bytes())
            .and_then(|()| file.sync_data());
        let Err(err) = written else {
            return Ok(());
        };

        if let Some(len) = committed_len {
            if let Err(truncate_err) = file.set_len(len) {
                warn!(
                    path = %self.events_path.display(),
                    error = %truncate_err,
                    "failed to roll back partial trace line"
                );
            }
        }
        state.failure = Some(err.to_string());
        Err(err).with_context(|| format!("failed to append to {}", self.events_path.display()))
    }

    fn write_summary(&self, summary: &TraceSummary) -> Result<()> {
        fs::create_dir_all(&self.dir)?;
        let body = serde_json::to_string_pretty(summary)?;
        let tmp_path = self.summary_path.with_extension("json.tmp");
        {
            let mut tmp = File::create(&tmp_path)
                .with_context(|| format!("failed to create {}", tmp_path.display()))?;
            tmp.write_all(body.as_bytes())?;
            tmp.sync_data()?;
        }
        fs::rename(&tmp_path, &self.summary_path)
            .with_context(|| format!("failed to persist {}", self.summary_path.display()))?;
        debug!(path = %self.summary_path.display(), "trace summary written");
        Ok(())
    }

    fn list_events(&self) -> Result<Vec<TraceEvent>> {
        read_events_file(&self.events_path)
    }
}

fn read_events_file(path: &Path) -> Result<Vec<TraceEvent>> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => {
            return Err(err).with_context(|| format!("failed to read {}", path.display()));
        }
    };
    content
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(number, line)| {
            serde_json::from_str::<TraceEvent>(line).with_context(|| {
                format!("invalid trace event at {}:{}", path.display(), number + 1)
            })
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplayReport {
    pub run_id: RunId,
    pub events: Vec<TraceEvent>,
    pub sequence_error: Option<String>,
    pub recomputed: TraceSummary,
    pub persisted: Option<TraceSummary>,
}

impl ReplayReport {
    #[must_use]
    pub fn sequence_valid(&self) -> bool {
        self.sequence_error.is_none()
    }

    #[must_use]
    pub fn summary_matches(&self) -> bool {
        self.persisted.as_ref() == Some(&self.recomputed)
    }
}

/// Trace directory: opens per-run sinks and reads runs back.
#[derive(Debug, Clone)]
pub struct JsonlTraceStore {
    dir: PathBuf,
}

impl JsonlTraceStore {
    #[must_use]
    pub fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
        }
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Run ids with an event log in the directory, oldest first.
    ///
    /// # Errors
    /// Returns an error when the directory exists but cannot be read.
    pub fn list_runs(&self) -> Result<Vec<RunId>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed to read {}", self.dir.display()));
            }
        };
        let mut runs = Vec::new();
        for entry in entries {
            let name = entry?.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if let Some(stem) = name.strip_suffix(EVENTS_SUFFIX) {
                if let Ok(run_id) = RunId::parse(stem) {
                    runs.push(run_id);
                }
            }
        }
        runs.sort();
        Ok(runs)
    }

    /// # Errors
    /// Returns an error when the log cannot be read or a line does not parse.
    pub fn read_events(&self, run_id: RunId) -> Result<Vec<TraceEvent>> {
        read_events_file(&events_path(&self.dir, run_id))
    }

    /// # Errors
    /// Returns an error when the summary exists but cannot be read or parsed.
    pub fn read_summary(&self, run_id: RunId) -> Result<Option<TraceSummary>> {
        let path = summary_path(&self.dir, run_id);
        match fs::read_to_string(&path) {
            Ok(body) => Ok(Some(serde_json::from_str(&body).with_context(|| {
                format!("invalid trace summary {}", path.display())
            })?)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err).with_context(|| format!("failed to read {}", path.display())),
        }
    }

    /// Recompute the summary from the event log and compare with the persisted one.
    ///
    /// # Errors
    /// Returns an error when the run has no event log or it cannot be read.
    pub fn replay(&self, run_id: RunId) -> Result<ReplayReport> {
        let events = self.read_events(run_id)?;
        if events.is_empty() {
            return Err(anyhow!("no trace events recorded for run {run_id}"));
        }
        let sequence_error = verify_sequence(&events).err().map(|err| err.to_string());
        let recomputed = project_summary(run_id, &events);
        let persisted = self.read_summary(run_id)?;
        Ok(ReplayReport {
            run_id,
            events,
            sequence_error,
            recomputed,
            persisted,
        })
    }
}

impl TraceSinkFactory for JsonlTraceStore {
    fn open(&self, run_id: RunId) -> Result<Box<dyn TraceSink>> {
        Ok(Box::new(JsonlTraceSink::new(&self.dir, run_id)))
    }
}
