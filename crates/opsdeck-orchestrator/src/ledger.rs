//! Run ledger.
//!
//! The only owner of run state. Every mutation goes through one async write
//! guard so the single-flight check and registration can never interleave.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::catalog::TaskDefinition;
use crate::error::SYNTHETIC_FAILURE_EXIT_CODE;
use crate::model::{InvocationPlan, RunStatus, RunView, TaskParams};
use crate::output::{sanitize_chunk, OutputBuffer};

/// `cmd_<unix-millis>_<6 hex>`.
pub fn new_run_id() -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("cmd_{}_{}", Utc::now().timestamp_millis(), &suffix[..6])
}

#[derive(Debug, Clone)]
pub struct Run {
    id: String,
    task_id: String,
    title: String,
    description: String,
    single_flight: bool,
    status: RunStatus,
    started_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
    exit_code: Option<i32>,
    command_line: String,
    params: TaskParams,
    output: OutputBuffer,
}

impl Run {
    pub fn start(
        id: String,
        task: &TaskDefinition,
        plan: &InvocationPlan,
        params: TaskParams,
        max_output_chars: usize,
    ) -> Self {
        Self {
            id,
            task_id: task.id.clone(),
            title: task.title.clone(),
            description: task.description.clone(),
            single_flight: task.single_flight,
            status: RunStatus::Running,
            started_at: Utc::now(),
            finished_at: None,
            exit_code: None,
            command_line: plan.command_line(),
            params,
            output: OutputBuffer::new(max_output_chars),
        }
    }

    fn is_running(&self) -> bool {
        self.status == RunStatus::Running
    }

    fn finish(&mut self, exit_code: i32) -> bool {
        if !self.is_running() {
            return false;
        }
        self.status = RunStatus::from_exit_code(exit_code);
        self.exit_code = Some(exit_code);
        self.finished_at = Some(Utc::now());
        true
    }

    pub fn view(&self) -> RunView {
        RunView {
            id: self.id.clone(),
            task_id: self.task_id.clone(),
            title: self.title.clone(),
            description: self.description.clone(),
            status: self.status,
            started_at: self.started_at,
            finished_at: self.finished_at,
            exit_code: self.exit_code,
            command_line: self.command_line.clone(),
            output: self.output.as_str().to_string(),
            params: self.params.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunLedger {
    runs: Arc<RwLock<VecDeque<Run>>>,
    max_runs: usize,
}

impl RunLedger {
    pub fn new(max_runs: usize) -> Self {
        Self {
            runs: Arc::new(RwLock::new(VecDeque::new())),
            max_runs: max_runs.max(1),
        }
    }

    pub async fn find_running(&self, task_id: &str) -> Option<RunView> {
        let guard = self.runs.read().await;
        guard
            .iter()
            .find(|run| run.task_id == task_id && run.is_running())
            .map(Run::view)
    }

    /// Insert at the front unconditionally, pruning the oldest on overflow.
    pub async fn register(&self, run: Run) -> RunView {
        let mut guard = self.runs.write().await;
        self.insert_locked(&mut guard, run)
    }

    /// Atomic single-flight admission. `Err` carries the run already in flight.
    pub async fn try_register(&self, run: Run) -> Result<RunView, RunView> {
        let mut guard = self.runs.write().await;
        if run.single_flight {
            if let Some(existing) = guard
                .iter()
                .find(|existing| existing.task_id == run.task_id && existing.is_running())
            {
                return Err(existing.view());
            }
        }
        Ok(self.insert_locked(&mut guard, run))
    }

    fn insert_locked(&self, runs: &mut VecDeque<Run>, run: Run) -> RunView {
        let view = run.view();
        runs.push_front(run);
        self.prune_locked(runs);
        view
    }

    /// Drop the oldest terminal runs beyond `max_runs`. Running runs are never
    /// evicted, so the ledger can hold more than `max_runs` while that many are
    /// in flight.
    fn prune_locked(&self, runs: &mut VecDeque<Run>) {
        while runs.len() > self.max_runs {
            let Some(idx) = runs.iter().rposition(|run| !run.is_running()) else {
                tracing::debug!(
                    retained = runs.len(),
                    max_runs = self.max_runs,
                    "ledger over capacity with every run still in flight"
                );
                return;
            };
            runs.remove(idx);
        }
    }

    /// Appends sanitized text. Returns false when the run is gone or finished.
    pub async fn append_output(&self, run_id: &str, chunk: &str) -> bool {
        let clean = sanitize_chunk(chunk);
        if clean.is_empty() {
            return false;
        }
        let mut guard = self.runs.write().await;
        match guard.iter_mut().find(|run| run.id == run_id) {
            Some(run) if run.is_running() => {
                run.output.push(&clean);
                true
            }
            _ => false,
        }
    }

    /// Terminal transition. `None` if the run is unknown or already terminal.
    pub async fn complete(&self, run_id: &str, exit_code: i32) -> Option<RunView> {
        let mut guard = self.runs.write().await;
        let run = guard.iter_mut().find(|run| run.id == run_id)?;
        if !run.finish(exit_code) {
            return None;
        }
        let view = run.view();
        self.prune_locked(&mut guard);
        Some(view)
    }

    /// Records a failure reason on the run and finishes it with exit code 1.
    pub async fn fail(&self, run_id: &str, reason: &str) -> Option<RunView> {
        let mut guard = self.runs.write().await;
        let run = guard.iter_mut().find(|run| run.id == run_id)?;
        if !run.is_running() {
            return None;
        }
        run.output
            .push(&sanitize_chunk(&format!("\n\u{274c} {reason}\n")));
        run.finish(SYNTHETIC_FAILURE_EXIT_CODE);
        let view = run.view();
        self.prune_locked(&mut guard);
        Some(view)
    }

    pub async fn get(&self, run_id: &str) -> Option<RunView> {
        let guard = self.runs.read().await;
        guard.iter().find(|run| run.id == run_id).map(Run::view)
    }

    /// Newest first.
    pub async fn snapshot(&self) -> Vec<RunView> {
        let guard = self.runs.read().await;
        guard.iter().map(Run::view).collect()
    }

    pub async fn running_count(&self) -> usize {
        let guard = self.runs.read().await;
        guard.iter().filter(|run| run.is_running()).count()
    }

    pub async fn len(&self) -> usize {
        self.runs.read().await.len()
    }
}
