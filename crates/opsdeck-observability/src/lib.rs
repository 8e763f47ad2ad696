use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub const DEFAULT_RETENTION_DAYS: u64 = 14;

const EVENT_TARGET: &str = "opsdeck.obs";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessKind {
    Server,
    Cli,
}

impl ProcessKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ProcessKind::Server => "server",
            ProcessKind::Cli => "cli",
        }
    }
}

/// Milestones of a run (and of the process hosting it) written to the
/// `opsdeck.obs` target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LifecycleEvent {
    LoggingInitialized,
    RunAdmitted,
    RunRejected,
    RunSpawned,
    RunLaunchFailed,
    RunFinished,
    RunTimedOut,
}

impl LifecycleEvent {
    pub fn name(self) -> &'static str {
        match self {
            LifecycleEvent::LoggingInitialized => "logging.initialized",
            LifecycleEvent::RunAdmitted => "run.admitted",
            LifecycleEvent::RunRejected => "run.rejected",
            LifecycleEvent::RunSpawned => "run.spawned",
            LifecycleEvent::RunLaunchFailed => "run.launch_failed",
            LifecycleEvent::RunFinished => "run.finished",
            LifecycleEvent::RunTimedOut => "run.timed_out",
        }
    }

    pub fn component(self) -> &'static str {
        match self {
            LifecycleEvent::LoggingInitialized => "engine",
            LifecycleEvent::RunAdmitted | LifecycleEvent::RunRejected => "orchestrator",
            LifecycleEvent::RunSpawned
            | LifecycleEvent::RunLaunchFailed
            | LifecycleEvent::RunFinished
            | LifecycleEvent::RunTimedOut => "launcher",
        }
    }
}

/// Run identity and outcome attached to a lifecycle event. Missing fields are
/// logged as `""` so every JSONL record has the same shape.
#[derive(Debug, Clone, Copy, Default)]
pub struct RunRecord<'a> {
    pub task_id: Option<&'a str>,
    pub run_id: Option<&'a str>,
    pub status: Option<&'a str>,
    pub error_code: Option<&'a str>,
    pub detail: Option<&'a str>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LoggingInitInfo {
    pub process: String,
    pub logs_dir: String,
    pub prefix: String,
    pub retention_days: u64,
    pub initialized_at: DateTime<Utc>,
}

/// Keeps the file writer flushing for as long as it is alive.
pub struct LoggingHandle {
    _guard: WorkerGuard,
    pub info: LoggingInitInfo,
}

pub fn redact_text(input: &str) -> String {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return String::new();
    }
    format!("[redacted len={}]", trimmed.chars().count())
}

macro_rules! lifecycle_event {
    ($level:expr, $process:expr, $event:expr, $record:expr) => {
        tracing::event!(
            target: EVENT_TARGET,
            $level,
            process = $process.as_str(),
            component = $event.component(),
            event = $event.name(),
            task_id = $record.task_id.unwrap_or(""),
            run_id = $record.run_id.unwrap_or(""),
            status = $record.status.unwrap_or(""),
            error_code = $record.error_code.unwrap_or(""),
            detail = $record.detail.unwrap_or(""),
            "lifecycle_event"
        )
    };
}

pub fn emit_lifecycle(
    level: Level,
    process: ProcessKind,
    event: LifecycleEvent,
    record: RunRecord<'_>,
) {
    // tracing callsites need a constant level
    match level {
        Level::ERROR => lifecycle_event!(Level::ERROR, process, event, record),
        Level::WARN => lifecycle_event!(Level::WARN, process, event, record),
        Level::DEBUG | Level::TRACE => lifecycle_event!(Level::DEBUG, process, event, record),
        _ => lifecycle_event!(Level::INFO, process, event, record),
    }
}

/// Daily JSONL files for one process kind: `opsdeck.<process>.YYYY-MM-DD.jsonl`.
#[derive(Debug, Clone)]
struct LogFiles<'a> {
    dir: &'a Path,
    process: ProcessKind,
}

impl<'a> LogFiles<'a> {
    fn new(dir: &'a Path, process: ProcessKind) -> Self {
        Self { dir, process }
    }

    fn prefix(&self) -> String {
        format!("opsdeck.{}", self.process.as_str())
    }

    fn date_of(&self, file_name: &str) -> Option<NaiveDate> {
        let prefix = self.prefix();
        let date = file_name
            .strip_prefix(prefix.as_str())?
            .strip_prefix('.')?
            .strip_suffix(".jsonl")?;
        NaiveDate::parse_from_str(date, "%Y-%m-%d").ok()
    }

    /// Delete this process's files dated before the retention window.
    fn prune_expired(&self, retention_days: u64) -> anyhow::Result<usize> {
        let cutoff = Utc::now().date_naive() - chrono::Duration::days(retention_days as i64);
        let mut removed = 0;
        for entry in fs::read_dir(self.dir)?.flatten() {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let Some(date) = path
                .file_name()
                .and_then(|name| name.to_str())
                .and_then(|name| self.date_of(name))
            else {
                continue;
            };
            if date < cutoff && fs::remove_file(&path).is_ok() {
                removed += 1;
            }
        }
        Ok(removed)
    }
}

pub fn init_process_logging(
    process: ProcessKind,
    logs_dir: &Path,
    retention_days: u64,
) -> anyhow::Result<LoggingHandle> {
    fs::create_dir_all(logs_dir)?;
    let files = LogFiles::new(logs_dir, process);
    let pruned = files.prune_expired(retention_days)?;

    let prefix = files.prefix();
    let file_appender = tracing_appender::rolling::Builder::new()
        .rotation(tracing_appender::rolling::Rotation::DAILY)
        .filename_prefix(&prefix)
        .filename_suffix("jsonl")
        .build(logs_dir)?;

    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_current_span(false)
        .with_span_list(false);

    // The CLI streams task output to stdout, so its console logs go to stderr.
    let console_layer = tracing_subscriber::fmt::layer()
        .compact()
        .with_target(true)
        .with_ansi(true)
        .with_writer(std::io::stderr);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .ok();

    if pruned > 0 {
        tracing::debug!(pruned, logs_dir = %logs_dir.display(), "removed expired log files");
    }

    Ok(LoggingHandle {
        _guard: guard,
        info: LoggingInitInfo {
            process: process.as_str().to_string(),
            logs_dir: logs_dir.display().to_string(),
            prefix,
            retention_days,
            initialized_at: Utc::now(),
        },
    })
}

pub fn canonical_logs_dir_from_root(root: &Path) -> PathBuf {
    root.join("logs")
}
