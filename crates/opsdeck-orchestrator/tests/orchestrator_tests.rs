use std::path::Path;
use std::time::Duration;

use opsdeck_observability::ProcessKind;
use opsdeck_orchestrator::{
    Orchestrator, OrchestratorConfig, OrchestratorError, RunStatus, RunView, TaskParams,
    SYNTHETIC_FAILURE_EXIT_CODE, TIMEOUT_EXIT_CODE,
};
use serde_json::{json, Value};
use tempfile::TempDir;

/// A workspace whose `scripts/*.js` files are shell scripts, run through `sh`.
fn workspace(scripts: &[(&str, &str)]) -> TempDir {
    let dir = tempfile::tempdir().expect("tempdir");
    std::fs::create_dir_all(dir.path().join("scripts")).expect("scripts dir");
    for (name, body) in scripts {
        std::fs::write(dir.path().join("scripts").join(name), body).expect("write script");
    }
    dir
}

fn config(root: &Path) -> OrchestratorConfig {
    let mut config = OrchestratorConfig::for_workspace(root);
    config.task_env.node_bin = "sh".to_string();
    config
}

fn params(value: Value) -> TaskParams {
    value.as_object().cloned().unwrap_or_default()
}

async fn wait_for_terminal(orchestrator: &Orchestrator, run_id: &str) -> RunView {
    tokio::time::timeout(Duration::from_secs(15), async {
        loop {
            let run = orchestrator.run(run_id).await.expect("run retained");
            if run.status.is_terminal() {
                return run;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("run should finish")
}

#[tokio::test]
async fn engage_x_clamps_limit_and_rejects_second_launch_as_busy() {
    let dir = workspace(&[("engage-x.js", "sleep 1\necho \"engaged $1\"\n")]);
    let orchestrator = Orchestrator::new(config(dir.path()), ProcessKind::Cli);

    let first = orchestrator
        .run_task("engage-x", params(json!({ "limit": 999 })))
        .await
        .expect("first launch");
    assert_eq!(first.status, RunStatus::Running);
    assert_eq!(first.command_line, "sh scripts/engage-x.js --limit=25");
    assert_eq!(first.params["limit"], json!(999));

    let err = orchestrator
        .run_task("engage-x", params(json!({ "limit": 5 })))
        .await
        .expect_err("second launch is busy");
    match err {
        OrchestratorError::Busy { task_id, run_id, .. } => {
            assert_eq!(task_id, "engage-x");
            assert_eq!(run_id, first.id);
        }
        other => panic!("expected busy, got {other:?}"),
    }
    assert_eq!(orchestrator.list_runs().await.len(), 1);

    let done = wait_for_terminal(&orchestrator, &first.id).await;
    assert_eq!(done.status, RunStatus::Succeeded);
    assert_eq!(done.exit_code, Some(0));
    assert!(done.output.contains("engaged --limit=25"));
    assert!(done.finished_at.is_some());
}

#[tokio::test]
async fn concurrent_launches_admit_exactly_one_run() {
    let dir = workspace(&[("test-connection.js", "sleep 1\n")]);
    let orchestrator = Orchestrator::new(config(dir.path()), ProcessKind::Cli);

    let (left, right) = tokio::join!(
        orchestrator.run_task("test-connections", TaskParams::new()),
        orchestrator.run_task("test-connections", TaskParams::new()),
    );
    let results = [left, right];
    let admitted = results.iter().filter(|result| result.is_ok()).count();
    let busy = results
        .iter()
        .filter(|result| matches!(result, Err(OrchestratorError::Busy { .. })))
        .count();
    assert_eq!((admitted, busy), (1, 1));
    assert_eq!(orchestrator.state().await.running_count, 1);
}

#[tokio::test]
async fn unknown_task_creates_no_run() {
    let dir = workspace(&[]);
    let orchestrator = Orchestrator::new(config(dir.path()), ProcessKind::Cli);

    let err = orchestrator
        .run_task("unknown-id", TaskParams::new())
        .await
        .expect_err("unknown");
    assert!(matches!(err, OrchestratorError::UnknownTask(ref id) if id == "unknown-id"));
    assert_eq!(err.kind().http_status(), 400);
    assert!(orchestrator.list_runs().await.is_empty());
}

#[tokio::test]
async fn invalid_params_create_no_run() {
    let dir = workspace(&[("post-all-video.js", "exit 0\n")]);
    let orchestrator = Orchestrator::new(config(dir.path()), ProcessKind::Cli);

    for body in [
        json!({ "mainCaption": "Launch", "xCaption": "Launch" }),
        json!({ "videoFile": "clip.mp4", "xCaption": "Launch" }),
    ] {
        let err = orchestrator
            .run_task("post-all-video", params(body))
            .await
            .expect_err("invalid");
        assert!(matches!(err, OrchestratorError::InvalidParams(_)));
    }
    assert!(orchestrator.list_runs().await.is_empty());
}

#[tokio::test]
async fn exit_codes_decide_terminal_status() {
    let dir = workspace(&[
        (
            "test-connection.js",
            "echo connected\necho warning 1>&2\nexit 0\n",
        ),
        ("sync-dashboard.js", "echo syncing\nexit 3\n"),
    ]);
    let orchestrator = Orchestrator::new(config(dir.path()), ProcessKind::Cli);

    let ok = orchestrator
        .run_task("test-connections", TaskParams::new())
        .await
        .expect("launch");
    let ok = wait_for_terminal(&orchestrator, &ok.id).await;
    assert_eq!(ok.status, RunStatus::Succeeded);
    assert_eq!(ok.exit_code, Some(0));
    assert!(ok.output.contains("connected"));
    assert!(ok.output.contains("warning"));

    let failed = orchestrator
        .run_task("sync-dashboard", TaskParams::new())
        .await
        .expect("launch");
    let failed = wait_for_terminal(&orchestrator, &failed.id).await;
    assert_eq!(failed.status, RunStatus::Failed);
    assert_eq!(failed.exit_code, Some(3));
    assert!(failed.output.contains("syncing"));
}

#[tokio::test]
async fn missing_executable_fails_the_run_with_a_reason() {
    let dir = workspace(&[]);
    let mut config = config(dir.path());
    config.task_env.node_bin = dir
        .path()
        .join("no-such-runtime")
        .to_string_lossy()
        .into_owned();
    let orchestrator = Orchestrator::new(config, ProcessKind::Cli);

    let run = orchestrator
        .run_task("test-connections", TaskParams::new())
        .await
        .expect("admitted even though launch fails");
    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.exit_code, Some(SYNTHETIC_FAILURE_EXIT_CODE));
    assert!(run.output.contains("Failed to start"));
    assert_eq!(orchestrator.state().await.running_count, 0);

    // The task is free again once the failed run is terminal.
    assert!(orchestrator
        .run_task("test-connections", TaskParams::new())
        .await
        .is_ok());
}

#[tokio::test]
async fn missing_workspace_rejects_before_anything_else() {
    let dir = tempfile::tempdir().expect("tempdir");
    let orchestrator = Orchestrator::new(config(&dir.path().join("absent")), ProcessKind::Cli);

    let err = orchestrator
        .run_task("unknown-id", TaskParams::new())
        .await
        .expect_err("workspace missing");
    assert!(matches!(err, OrchestratorError::WorkspaceMissing(_)));
    assert_eq!(err.kind().http_status(), 500);
    assert!(orchestrator.list_runs().await.is_empty());
}

#[tokio::test]
async fn plan_environment_and_working_directory_reach_the_process() {
    let dir = workspace(&[(
        "sync-dashboard.js",
        "printf '\\033[32m%s\\033[0m\\n' \"$DASHBOARD_URL\"\npwd\n",
    )]);
    let orchestrator = Orchestrator::new(config(dir.path()), ProcessKind::Cli);

    let run = orchestrator
        .run_task("sync-dashboard", TaskParams::new())
        .await
        .expect("launch");
    let run = wait_for_terminal(&orchestrator, &run.id).await;
    assert_eq!(run.status, RunStatus::Succeeded);
    assert!(run.output.contains("http://localhost:3000\n"));
    assert!(!run.output.contains('\u{1b}'));
    let root = dir.path().canonicalize().expect("canonical root");
    let file_name = root.file_name().and_then(|name| name.to_str()).expect("name");
    assert!(run.output.contains(file_name));
}

#[tokio::test]
async fn output_is_capped_to_the_most_recent_characters() {
    let dir = workspace(&[(
        "test-connection.js",
        "i=0\nwhile [ $i -lt 500 ]; do printf 'line-%04d\\n' $i; i=$((i+1)); done\nprintf END\n",
    )]);
    let mut config = config(dir.path());
    config.max_output_chars = 1024;
    let orchestrator = Orchestrator::new(config, ProcessKind::Cli);

    let run = orchestrator
        .run_task("test-connections", TaskParams::new())
        .await
        .expect("launch");
    let run = wait_for_terminal(&orchestrator, &run.id).await;
    assert_eq!(run.output.chars().count(), 1024);
    assert!(run.output.ends_with("line-0499\nEND"));
    assert!(!run.output.contains("line-0000"));
}

#[tokio::test]
async fn ledger_keeps_only_the_most_recent_runs() {
    let dir = workspace(&[
        ("test-connection.js", "exit 0\n"),
        ("sync-dashboard.js", "exit 0\n"),
        ("engage-x.js", "exit 0\n"),
    ]);
    let mut config = config(dir.path());
    config.max_runs = 2;
    let orchestrator = Orchestrator::new(config, ProcessKind::Cli);

    let mut ids = Vec::new();
    for task_id in ["test-connections", "sync-dashboard", "engage-x"] {
        let run = orchestrator
            .run_task(task_id, TaskParams::new())
            .await
            .expect("launch");
        wait_for_terminal(&orchestrator, &run.id).await;
        ids.push(run.id);
    }

    let runs = orchestrator.list_runs().await;
    let retained: Vec<&str> = runs.iter().map(|run| run.id.as_str()).collect();
    assert_eq!(retained, vec![ids[2].as_str(), ids[1].as_str()]);
    assert!(orchestrator.run(&ids[0]).await.is_none());
}

#[tokio::test]
async fn running_runs_are_not_evicted_by_a_small_ledger() {
    let dir = workspace(&[
        ("test-connection.js", "sleep 2\n"),
        ("sync-dashboard.js", "exit 0\n"),
    ]);
    let mut config = config(dir.path());
    config.max_runs = 1;
    let orchestrator = Orchestrator::new(config, ProcessKind::Cli);

    let slow = orchestrator
        .run_task("test-connections", TaskParams::new())
        .await
        .expect("launch");
    orchestrator
        .run_task("sync-dashboard", TaskParams::new())
        .await
        .expect("launch");
    // The finished quick run is the one that gets evicted.
    tokio::time::timeout(Duration::from_secs(15), async {
        while orchestrator.state().await.running_count > 1 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("quick run should finish");

    let err = orchestrator
        .run_task("test-connections", TaskParams::new())
        .await
        .expect_err("first run is still alive");
    assert!(matches!(err, OrchestratorError::Busy { ref run_id, .. } if *run_id == slow.id));

    let slow = wait_for_terminal(&orchestrator, &slow.id).await;
    assert_eq!(slow.status, RunStatus::Succeeded);
    let runs = orchestrator.list_runs().await;
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].id, slow.id);
}

#[tokio::test]
async fn timed_out_runs_are_killed_and_marked_failed() {
    let dir = workspace(&[("test-connection.js", "echo started\nexec sleep 30\n")]);
    let mut config = config(dir.path());
    config.task_timeout = Some(Duration::from_secs(1));
    let orchestrator = Orchestrator::new(config, ProcessKind::Cli);

    let run = orchestrator
        .run_task("test-connections", TaskParams::new())
        .await
        .expect("launch");
    let run = wait_for_terminal(&orchestrator, &run.id).await;
    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.exit_code, Some(TIMEOUT_EXIT_CODE));
    assert!(run.output.contains("started"));
    assert!(run.output.contains("[timed out after 1s]"));
}

#[tokio::test]
async fn state_reports_catalog_runs_and_executor_mode() {
    let dir = workspace(&[("engage-instagram.js", "sleep 1\n")]);
    let orchestrator = Orchestrator::new(config(dir.path()), ProcessKind::Cli);

    let run = orchestrator
        .run_task("engage-instagram", TaskParams::new())
        .await
        .expect("launch");
    assert_eq!(
        run.command_line,
        "sh scripts/engage-instagram.js --limit=10 --dry-run"
    );

    let state = orchestrator.state().await;
    assert_eq!(state.executor_mode, "local");
    assert_eq!(state.tasks.len(), 5);
    assert_eq!(state.runs.len(), 1);
    assert_eq!(state.running_count, 1);

    let value = serde_json::to_value(&state).expect("serialize");
    assert_eq!(value["executorMode"], "local");
    assert_eq!(value["runs"][0]["taskId"], "engage-instagram");
    assert_eq!(value["runs"][0]["status"], "running");
    assert!(value["runs"][0]["finishedAt"].is_null());
    assert!(value["runs"][0]["exitCode"].is_null());
}
