//! Process launcher.
//!
//! Spawns the plan as a child process and returns immediately. A supervisor
//! task pumps both pipes into the ledger and records the terminal transition
//! only after the exit status is known and both pipes have drained.

use std::process::Stdio;
use std::time::Duration;

use opsdeck_observability::{emit_lifecycle, LifecycleEvent, ProcessKind, RunRecord};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::Level;

use crate::error::{OrchestratorError, SYNTHETIC_FAILURE_EXIT_CODE, TIMEOUT_EXIT_CODE};
use crate::ledger::RunLedger;
use crate::model::InvocationPlan;
use crate::output::StreamDecoder;

const READ_CHUNK_BYTES: usize = 4096;
/// How long pipe readers may keep draining after the child is gone.
const DRAIN_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    ledger: RunLedger,
    timeout: Option<Duration>,
    process: ProcessKind,
}

enum Outcome {
    Exited(std::io::Result<std::process::ExitStatus>),
    TimedOut(Duration),
}

impl ProcessLauncher {
    pub fn new(ledger: RunLedger, timeout: Option<Duration>, process: ProcessKind) -> Self {
        Self {
            ledger,
            timeout,
            process,
        }
    }

    /// Start `plan` for an already registered run.
    ///
    /// A spawn failure is recorded on the run before it is returned, so the
    /// caller only needs the error for reporting.
    pub async fn launch(
        &self,
        plan: &InvocationPlan,
        run_id: &str,
    ) -> Result<(), OrchestratorError> {
        let mut command = Command::new(&plan.executable);
        command
            .args(&plan.arguments)
            .current_dir(&plan.working_directory)
            .envs(&plan.environment_overrides)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = match command.spawn() {
            Ok(child) => child,
            Err(source) => {
                let err = OrchestratorError::LaunchFailure {
                    executable: plan.executable.clone(),
                    source,
                };
                self.ledger.fail(run_id, &err.to_string()).await;
                emit_lifecycle(
                    Level::ERROR,
                    self.process,
                    LifecycleEvent::RunLaunchFailed,
                    RunRecord {
                        run_id: Some(run_id),
                        status: Some("failed"),
                        error_code: Some(err.code()),
                        detail: Some(&err.to_string()),
                        ..Default::default()
                    },
                );
                return Err(err);
            }
        };

        let pid = child.id();
        emit_lifecycle(
            Level::INFO,
            self.process,
            LifecycleEvent::RunSpawned,
            RunRecord {
                run_id: Some(run_id),
                status: Some("running"),
                detail: pid.map(|pid| format!("pid={pid}")).as_deref(),
                ..Default::default()
            },
        );

        tokio::spawn(supervise(
            self.ledger.clone(),
            run_id.to_string(),
            child,
            self.timeout,
            self.process,
        ));
        Ok(())
    }
}

async fn supervise(
    ledger: RunLedger,
    run_id: String,
    mut child: Child,
    timeout: Option<Duration>,
    process: ProcessKind,
) {
    let readers: Vec<JoinHandle<()>> = [
        child
            .stdout
            .take()
            .map(|stdout| tokio::spawn(pump(ledger.clone(), run_id.clone(), stdout))),
        child
            .stderr
            .take()
            .map(|stderr| tokio::spawn(pump(ledger.clone(), run_id.clone(), stderr))),
    ]
    .into_iter()
    .flatten()
    .collect();

    let outcome = match timeout {
        Some(limit) => match tokio::time::timeout(limit, child.wait()).await {
            Ok(status) => Outcome::Exited(status),
            Err(_) => {
                if let Err(err) = child.kill().await {
                    tracing::warn!(run_id = %run_id, error = %err, "failed to kill timed out run");
                }
                Outcome::TimedOut(limit)
            }
        },
        None => Outcome::Exited(child.wait().await),
    };

    for mut reader in readers {
        if tokio::time::timeout(DRAIN_GRACE, &mut reader).await.is_err() {
            tracing::debug!(run_id = %run_id, "output pipe still open after exit; detaching");
            reader.abort();
        }
    }

    let (event, level, finished, error_code) = match outcome {
        Outcome::Exited(Ok(status)) => {
            let code = status.code().unwrap_or(SYNTHETIC_FAILURE_EXIT_CODE);
            let level = if code == 0 { Level::INFO } else { Level::WARN };
            (LifecycleEvent::RunFinished, level, ledger.complete(&run_id, code).await, None)
        }
        Outcome::Exited(Err(err)) => {
            let err = OrchestratorError::RuntimeFailure(err.to_string());
            let finished = ledger.fail(&run_id, &err.to_string()).await;
            (LifecycleEvent::RunFinished, Level::ERROR, finished, Some(err.code()))
        }
        Outcome::TimedOut(limit) => {
            ledger
                .append_output(
                    &run_id,
                    &format!("\n[timed out after {}s]\n", limit.as_secs()),
                )
                .await;
            let finished = ledger.complete(&run_id, TIMEOUT_EXIT_CODE).await;
            (LifecycleEvent::RunTimedOut, Level::WARN, finished, Some("TIMEOUT"))
        }
    };

    let Some(view) = finished else {
        tracing::debug!(run_id = %run_id, "run already terminal");
        return;
    };
    let detail = view.exit_code.map(|code| format!("exit_code={code}"));
    emit_lifecycle(
        level,
        process,
        event,
        RunRecord {
            task_id: Some(&view.task_id),
            run_id: Some(&view.id),
            status: Some(view.status.as_str()),
            error_code,
            detail: detail.as_deref(),
        },
    );
}

async fn pump<R>(ledger: RunLedger, run_id: String, mut reader: R)
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; READ_CHUNK_BYTES];
    let mut decoder = StreamDecoder::new();
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                let text = decoder.push(&buf[..n]);
                if !text.is_empty() {
                    ledger.append_output(&run_id, &text).await;
                }
            }
            Err(err) => {
                tracing::debug!(run_id = %run_id, error = %err, "output pipe read failed");
                break;
            }
        }
    }
    let rest = decoder.finish();
    if !rest.is_empty() {
        ledger.append_output(&run_id, &rest).await;
    }
}
