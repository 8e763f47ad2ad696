use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Raw operator input for one run, kept verbatim on the run for redisplay.
pub type TaskParams = Map<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Succeeded,
    Failed,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Succeeded => "succeeded",
            RunStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, RunStatus::Running)
    }

    pub fn from_exit_code(exit_code: i32) -> Self {
        if exit_code == 0 {
            RunStatus::Succeeded
        } else {
            RunStatus::Failed
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    Text,
    Textarea,
    Number,
    Boolean,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldSpec {
    pub key: String,
    #[serde(rename = "type")]
    pub kind: FieldKind,
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<i64>,
    pub default_value: Value,
}

impl FieldSpec {
    pub fn number(key: &str, label: &str, min: i64, max: i64, default_value: i64) -> Self {
        Self {
            key: key.to_string(),
            kind: FieldKind::Number,
            label: label.to_string(),
            min: Some(min),
            max: Some(max),
            default_value: Value::from(default_value),
        }
    }

    pub fn boolean(key: &str, label: &str, default_value: bool) -> Self {
        Self {
            key: key.to_string(),
            kind: FieldKind::Boolean,
            label: label.to_string(),
            min: None,
            max: None,
            default_value: Value::Bool(default_value),
        }
    }

    pub fn text(key: &str, label: &str) -> Self {
        Self::free_text(key, label, FieldKind::Text)
    }

    pub fn textarea(key: &str, label: &str) -> Self {
        Self::free_text(key, label, FieldKind::Textarea)
    }

    fn free_text(key: &str, label: &str, kind: FieldKind) -> Self {
        Self {
            key: key.to_string(),
            kind,
            label: label.to_string(),
            min: None,
            max: None,
            default_value: Value::String(String::new()),
        }
    }
}

/// Public, secret-free description of a catalog entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskSummary {
    pub id: String,
    pub title: String,
    pub description: String,
    pub single_flight: bool,
    pub fields: Vec<FieldSpec>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InvocationPlan {
    pub executable: String,
    pub arguments: Vec<String>,
    pub working_directory: PathBuf,
    pub environment_overrides: BTreeMap<String, String>,
}

impl InvocationPlan {
    pub fn new(executable: impl Into<String>, working_directory: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
            arguments: Vec::new(),
            working_directory: working_directory.into(),
            environment_overrides: BTreeMap::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.arguments.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.arguments.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment_overrides.insert(key.into(), value.into());
        self
    }

    /// Display rendering only; arguments are not quoted.
    pub fn command_line(&self) -> String {
        if self.arguments.is_empty() {
            return self.executable.clone();
        }
        format!("{} {}", self.executable, self.arguments.join(" "))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunView {
    pub id: String,
    pub task_id: String,
    pub title: String,
    pub description: String,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    pub command_line: String,
    pub output: String,
    pub params: TaskParams,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrchestratorState {
    pub executor_mode: String,
    pub workspace_root: String,
    pub tasks: Vec<TaskSummary>,
    pub runs: Vec<RunView>,
    pub running_count: usize,
}
