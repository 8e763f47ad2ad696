//! Orchestrator configuration.
//!
//! Built once at startup from environment variables. `from_lookup` takes the
//! variable source as a function so tests never touch the process environment.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_MAX_RUNS: usize = 40;
pub const DEFAULT_MAX_OUTPUT_CHARS: usize = 60_000;
pub const MIN_OUTPUT_CHARS: usize = 1024;
pub const DEFAULT_WORKSPACE_DIR_NAME: &str = "ghostai-x-bot";

pub const DEFAULT_NODE_BIN: &str = "node";
pub const DEFAULT_AI_PROVIDER: &str = "openai";
pub const DEFAULT_OPENAI_MODEL: &str = "gpt-5.2";
pub const DEFAULT_DASHBOARD_URL: &str = "http://localhost:3000";
pub const DEV_FALLBACK_SECRET: &str = "ghostai-dev-token";

/// Values injected into task environments. Each has a documented default.
#[derive(Clone, PartialEq, Eq)]
pub struct TaskEnv {
    pub node_bin: String,
    pub ai_provider: String,
    pub openai_model: String,
    pub dashboard_url: String,
    pub dashboard_secret: String,
}

impl Default for TaskEnv {
    fn default() -> Self {
        Self {
            node_bin: DEFAULT_NODE_BIN.to_string(),
            ai_provider: DEFAULT_AI_PROVIDER.to_string(),
            openai_model: DEFAULT_OPENAI_MODEL.to_string(),
            dashboard_url: DEFAULT_DASHBOARD_URL.to_string(),
            dashboard_secret: DEV_FALLBACK_SECRET.to_string(),
        }
    }
}

impl fmt::Debug for TaskEnv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskEnv")
            .field("node_bin", &self.node_bin)
            .field("ai_provider", &self.ai_provider)
            .field("openai_model", &self.openai_model)
            .field("dashboard_url", &self.dashboard_url)
            .field(
                "dashboard_secret",
                &opsdeck_observability::redact_text(&self.dashboard_secret),
            )
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrchestratorConfig {
    /// Fixed external working root every task runs in.
    pub workspace_root: PathBuf,
    /// Most-recent runs retained by the ledger.
    pub max_runs: usize,
    /// Cap on each run's output buffer, in characters.
    pub max_output_chars: usize,
    /// `None` lets a task run to natural completion.
    pub task_timeout: Option<Duration>,
    pub task_env: TaskEnv,
}

impl OrchestratorConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        let workspace_root = get("OPSDECK_WORKSPACE_ROOT")
            .or_else(|| get("BOT_COMMAND_ROOT"))
            .map(|raw| absolutize(&cwd, Path::new(&raw)))
            .unwrap_or_else(|| default_workspace_root(&cwd));

        let max_runs = get("OPSDECK_MAX_RUNS")
            .and_then(|raw| raw.parse::<usize>().ok())
            .unwrap_or(DEFAULT_MAX_RUNS)
            .max(1);
        let max_output_chars = get("OPSDECK_MAX_OUTPUT_CHARS")
            .and_then(|raw| raw.parse::<usize>().ok())
            .unwrap_or(DEFAULT_MAX_OUTPUT_CHARS)
            .max(MIN_OUTPUT_CHARS);
        let task_timeout = get("OPSDECK_TASK_TIMEOUT_SECS")
            .and_then(|raw| raw.parse::<u64>().ok())
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs);

        let defaults = TaskEnv::default();
        let task_env = TaskEnv {
            node_bin: get("OPSDECK_NODE_BIN").unwrap_or(defaults.node_bin),
            ai_provider: get("AI_PROVIDER").unwrap_or(defaults.ai_provider),
            openai_model: get("OPENAI_MODEL").unwrap_or(defaults.openai_model),
            dashboard_url: get("DASHBOARD_URL").unwrap_or(defaults.dashboard_url),
            dashboard_secret: get("DASHBOARD_SECRET").unwrap_or(defaults.dashboard_secret),
        };

        Self {
            workspace_root,
            max_runs,
            max_output_chars,
            task_timeout,
            task_env,
        }
    }

    /// Defaults with an explicit workspace root.
    pub fn for_workspace(workspace_root: impl Into<PathBuf>) -> Self {
        Self {
            workspace_root: workspace_root.into(),
            max_runs: DEFAULT_MAX_RUNS,
            max_output_chars: DEFAULT_MAX_OUTPUT_CHARS,
            task_timeout: None,
            task_env: TaskEnv::default(),
        }
    }

    pub fn with_workspace_root(mut self, workspace_root: impl Into<PathBuf>) -> Self {
        let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        self.workspace_root = absolutize(&cwd, &workspace_root.into());
        self
    }
}

fn default_workspace_root(cwd: &Path) -> PathBuf {
    let parent = cwd.parent().unwrap_or(cwd);
    parent.join(DEFAULT_WORKSPACE_DIR_NAME)
}

fn absolutize(cwd: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        cwd.join(path)
    }
}
