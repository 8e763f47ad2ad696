use std::sync::Arc;

use opsdeck_observability::{emit_lifecycle, LifecycleEvent, ProcessKind, RunRecord};
use tracing::Level;

use crate::catalog::{BuildContext, TaskCatalog};
use crate::config::OrchestratorConfig;
use crate::error::{OrchestratorError, Result};
use crate::launcher::ProcessLauncher;
use crate::ledger::{new_run_id, Run, RunLedger};
use crate::model::{OrchestratorState, RunView, TaskParams, TaskSummary};

pub const EXECUTOR_MODE: &str = "local";

/// The public contract. Cheap to clone; every clone shares one ledger.
#[derive(Debug, Clone)]
pub struct Orchestrator {
    config: Arc<OrchestratorConfig>,
    catalog: Arc<TaskCatalog>,
    context: Arc<BuildContext>,
    ledger: RunLedger,
    launcher: ProcessLauncher,
    process: ProcessKind,
}

impl Orchestrator {
    pub fn new(config: OrchestratorConfig, process: ProcessKind) -> Self {
        Self::with_catalog(config, TaskCatalog::builtin(), process)
    }

    pub fn with_catalog(
        config: OrchestratorConfig,
        catalog: TaskCatalog,
        process: ProcessKind,
    ) -> Self {
        let ledger = RunLedger::new(config.max_runs);
        let launcher = ProcessLauncher::new(ledger.clone(), config.task_timeout, process);
        let context = BuildContext::from_config(&config);
        Self {
            config: Arc::new(config),
            catalog: Arc::new(catalog),
            context: Arc::new(context),
            ledger,
            launcher,
            process,
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn list_tasks(&self) -> Vec<TaskSummary> {
        self.catalog.list()
    }

    pub async fn list_runs(&self) -> Vec<RunView> {
        self.ledger.snapshot().await
    }

    pub async fn run(&self, run_id: &str) -> Option<RunView> {
        self.ledger.get(run_id).await
    }

    pub async fn state(&self) -> OrchestratorState {
        let runs = self.ledger.snapshot().await;
        let running_count = self.ledger.running_count().await;
        OrchestratorState {
            executor_mode: EXECUTOR_MODE.to_string(),
            workspace_root: self.config.workspace_root.display().to_string(),
            tasks: self.catalog.list(),
            runs,
            running_count,
        }
    }

    /// Admit and launch one run of `task_id`.
    ///
    /// Rejections create no run. Once admitted, launch problems are recorded
    /// on the returned run instead of being raised.
    pub async fn run_task(&self, task_id: &str, params: TaskParams) -> Result<RunView> {
        match self.admit(task_id, params).await {
            Ok(admitted) => Ok(admitted),
            Err(err) => {
                emit_lifecycle(
                    Level::WARN,
                    self.process,
                    LifecycleEvent::RunRejected,
                    RunRecord {
                        task_id: Some(task_id),
                        error_code: Some(err.code()),
                        detail: Some(&err.to_string()),
                        ..Default::default()
                    },
                );
                Err(err)
            }
        }
    }

    async fn admit(&self, task_id: &str, params: TaskParams) -> Result<RunView> {
        let workspace_root = &self.config.workspace_root;
        if !workspace_root.is_dir() {
            return Err(OrchestratorError::WorkspaceMissing(workspace_root.clone()));
        }
        let task = self
            .catalog
            .resolve(task_id)
            .ok_or_else(|| OrchestratorError::UnknownTask(task_id.to_string()))?;
        if task.single_flight {
            if let Some(existing) = self.ledger.find_running(&task.id).await {
                return Err(busy(&existing));
            }
        }
        let plan = task.build(&self.context, &params)?;
        let run = Run::start(
            new_run_id(),
            task,
            &plan,
            params,
            self.config.max_output_chars,
        );
        let admitted = self.ledger.try_register(run).await.map_err(|existing| busy(&existing))?;

        emit_lifecycle(
            Level::INFO,
            self.process,
            LifecycleEvent::RunAdmitted,
            RunRecord {
                task_id: Some(&admitted.task_id),
                run_id: Some(&admitted.id),
                status: Some(admitted.status.as_str()),
                detail: Some(&admitted.command_line),
                ..Default::default()
            },
        );

        if let Err(err) = self.launcher.launch(&plan, &admitted.id).await {
            tracing::warn!(run_id = %admitted.id, error = %err, "run failed to launch");
        }
        Ok(self.ledger.get(&admitted.id).await.unwrap_or(admitted))
    }
}

fn busy(existing: &RunView) -> OrchestratorError {
    OrchestratorError::Busy {
        task_id: existing.task_id.clone(),
        title: existing.title.clone(),
        run_id: existing.id.clone(),
    }
}
