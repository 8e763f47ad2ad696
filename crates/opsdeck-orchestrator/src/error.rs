use std::path::PathBuf;

use serde::Serialize;
use thiserror::Error;

/// Exit code recorded when a process could not be started or ended without one.
pub const SYNTHETIC_FAILURE_EXIT_CODE: i32 = 1;

/// Exit code recorded when a run is killed for exceeding the task timeout.
pub const TIMEOUT_EXIT_CODE: i32 = 124;

#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("Unknown task: {0}")]
    UnknownTask(String),

    #[error("{title} is already running")]
    Busy {
        task_id: String,
        title: String,
        run_id: String,
    },

    #[error("{0}")]
    InvalidParams(String),

    #[error("Bot workspace not found: {}", .0.display())]
    WorkspaceMissing(PathBuf),

    #[error("Failed to start `{executable}`: {source}")]
    LaunchFailure {
        executable: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Process error: {0}")]
    RuntimeFailure(String),
}

/// Discriminator the HTTP layer maps to a status code without parsing messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    UnknownTask,
    Busy,
    InvalidParams,
    WorkspaceMissing,
    LaunchFailure,
    RuntimeFailure,
}

impl ErrorKind {
    pub fn code(self) -> &'static str {
        match self {
            ErrorKind::UnknownTask => "UNKNOWN_TASK",
            ErrorKind::Busy => "BUSY",
            ErrorKind::InvalidParams => "INVALID_PARAMS",
            ErrorKind::WorkspaceMissing => "WORKSPACE_MISSING",
            ErrorKind::LaunchFailure => "LAUNCH_FAILURE",
            ErrorKind::RuntimeFailure => "RUNTIME_FAILURE",
        }
    }

    pub fn http_status(self) -> u16 {
        match self {
            ErrorKind::Busy => 409,
            ErrorKind::UnknownTask | ErrorKind::InvalidParams => 400,
            _ => 500,
        }
    }
}

impl OrchestratorError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            OrchestratorError::UnknownTask(_) => ErrorKind::UnknownTask,
            OrchestratorError::Busy { .. } => ErrorKind::Busy,
            OrchestratorError::InvalidParams(_) => ErrorKind::InvalidParams,
            OrchestratorError::WorkspaceMissing(_) => ErrorKind::WorkspaceMissing,
            OrchestratorError::LaunchFailure { .. } => ErrorKind::LaunchFailure,
            OrchestratorError::RuntimeFailure(_) => ErrorKind::RuntimeFailure,
        }
    }

    pub fn code(&self) -> &'static str {
        self.kind().code()
    }
}

/// Validation failure raised by a task's build function.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct BuildError(pub String);

impl BuildError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

impl From<BuildError> for OrchestratorError {
    fn from(err: BuildError) -> Self {
        OrchestratorError::InvalidParams(err.0)
    }
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;
