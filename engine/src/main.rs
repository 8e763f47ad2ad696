use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;
use std::{fs, io::Read, io::Write};

use anyhow::Context;
use clap::{Parser, Subcommand};
use opsdeck_observability::{
    canonical_logs_dir_from_root, emit_lifecycle, init_process_logging, redact_text,
    LifecycleEvent, ProcessKind, RunRecord, DEFAULT_RETENTION_DAYS,
};
use opsdeck_orchestrator::{Orchestrator, OrchestratorConfig, TaskParams};
use opsdeck_server::{serve, ApiAuth, AppState};
use tracing::info;

const POLL_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Parser, Debug)]
#[command(name = "opsdeck")]
#[command(about = "Local command orchestrator for the bot workspace")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve the HTTP API until Ctrl-C.
    Serve {
        #[arg(long, alias = "host", default_value = "127.0.0.1")]
        hostname: String,
        #[arg(long, default_value_t = 3000)]
        port: u16,
        #[arg(long)]
        workspace_root: Option<PathBuf>,
        #[arg(long, env = "OPSDECK_LOGS_DIR")]
        logs_dir: Option<PathBuf>,
        #[arg(long, env = "OPSDECK_API_TOKEN", hide_env_values = true)]
        api_token: Option<String>,
    },
    /// Print the task catalog as JSON.
    Tasks,
    /// Run one task in-process and exit with its exit code.
    Run {
        task_id: String,
        /// Inline JSON object, `@path` to a file, or `-` for stdin.
        #[arg(long)]
        params: Option<String>,
        #[arg(long)]
        workspace_root: Option<PathBuf>,
        #[arg(long, env = "OPSDECK_LOGS_DIR")]
        logs_dir: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    match cli.command {
        Command::Serve {
            hostname,
            port,
            workspace_root,
            logs_dir,
            api_token,
        } => {
            let logging = init_process_logging(
                ProcessKind::Server,
                &resolve_logs_dir(logs_dir),
                DEFAULT_RETENTION_DAYS,
            )?;
            emit_lifecycle(
                tracing::Level::INFO,
                ProcessKind::Server,
                LifecycleEvent::LoggingInitialized,
                RunRecord {
                    status: Some("ok"),
                    detail: Some("server jsonl logging initialized"),
                    ..Default::default()
                },
            );
            info!("server logging initialized: {:?}", logging.info);

            let config = build_config(workspace_root);
            let token = api_token.or_else(|| std::env::var("DASHBOARD_SECRET").ok());
            let auth = ApiAuth::resolve(token.as_deref(), is_production(env_value("OPSDECK_ENV")));
            if auth.is_dev_fallback() {
                tracing::warn!("no API token configured; accepting the development token");
            }
            let addr: SocketAddr = format!("{hostname}:{port}")
                .parse()
                .context("invalid hostname or port")?;
            let orchestrator = Orchestrator::new(config, ProcessKind::Server);
            log_startup(orchestrator.config(), &addr, &auth);
            serve(addr, AppState::new(orchestrator, auth)).await?;
        }
        Command::Tasks => {
            let orchestrator = Orchestrator::new(OrchestratorConfig::from_env(), ProcessKind::Cli);
            println!(
                "{}",
                serde_json::to_string_pretty(&orchestrator.list_tasks())?
            );
        }
        Command::Run {
            task_id,
            params,
            workspace_root,
            logs_dir,
        } => {
            let logging = init_process_logging(
                ProcessKind::Cli,
                &resolve_logs_dir(logs_dir),
                DEFAULT_RETENTION_DAYS,
            )?;
            let params = match params {
                Some(raw) => read_params_json(&raw)?,
                None => TaskParams::new(),
            };
            let orchestrator = Orchestrator::new(build_config(workspace_root), ProcessKind::Cli);
            let exit_code = run_to_completion(&orchestrator, &task_id, params).await?;
            drop(logging);
            return Ok(ExitCode::from(u8::try_from(exit_code).unwrap_or(1)));
        }
    }

    Ok(ExitCode::SUCCESS)
}

fn env_value(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn is_production(env: Option<String>) -> bool {
    env.is_some_and(|value| value.eq_ignore_ascii_case("production"))
}

fn build_config(workspace_root: Option<PathBuf>) -> OrchestratorConfig {
    let config = OrchestratorConfig::from_env();
    match workspace_root {
        Some(root) => config.with_workspace_root(root),
        None => config,
    }
}

fn resolve_logs_dir(flag: Option<PathBuf>) -> PathBuf {
    if let Some(dir) = flag {
        return dir;
    }
    let root = dirs::data_local_dir()
        .map(|dir| dir.join("opsdeck"))
        .unwrap_or_else(|| PathBuf::from(".opsdeck"));
    canonical_logs_dir_from_root(&root)
}

fn read_params_json(input: &str) -> anyhow::Result<TaskParams> {
    let raw = if input.trim() == "-" {
        let mut buf = String::new();
        std::io::stdin().read_to_string(&mut buf)?;
        buf
    } else if let Some(path) = input.strip_prefix('@') {
        fs::read_to_string(path).with_context(|| format!("failed to read params file {path}"))?
    } else {
        input.to_string()
    };
    match serde_json::from_str::<serde_json::Value>(&raw).context("params must be valid JSON")? {
        serde_json::Value::Object(map) => Ok(map),
        _ => anyhow::bail!("params must be a JSON object"),
    }
}

async fn run_to_completion(
    orchestrator: &Orchestrator,
    task_id: &str,
    params: TaskParams,
) -> anyhow::Result<i32> {
    let run = orchestrator.run_task(task_id, params).await?;
    eprintln!("{} [{}] {}", run.id, run.task_id, run.command_line);

    let mut printed = String::new();
    let mut stdout = std::io::stdout();
    loop {
        let Some(current) = orchestrator.run(&run.id).await else {
            anyhow::bail!("run {} is no longer retained", run.id);
        };
        stdout.write_all(unseen_suffix(&printed, &current.output).as_bytes())?;
        stdout.flush()?;
        printed = current.output;
        if let Some(exit_code) = current.exit_code {
            eprintln!("{} finished: {} (exit code {exit_code})", run.id, current.status.as_str());
            return Ok(exit_code);
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

/// The part of `current` not yet shown, given the previously shown window.
/// The window may have slid forward, so the old tail is searched for.
fn unseen_suffix<'a>(previous: &str, current: &'a str) -> &'a str {
    if previous.is_empty() {
        return current;
    }
    if let Some(rest) = current.strip_prefix(previous) {
        return rest;
    }
    let anchor_start = previous
        .char_indices()
        .rev()
        .nth(255)
        .map(|(idx, _)| idx)
        .unwrap_or(0);
    let anchor = &previous[anchor_start..];
    match current.rfind(anchor) {
        Some(idx) => &current[idx + anchor.len()..],
        None => current,
    }
}

fn log_startup(config: &OrchestratorConfig, addr: &SocketAddr, auth: &ApiAuth) {
    let workspace_ok = config.workspace_root.is_dir();
    info!(
        "opsdeck startup: addr={} workspace_root={} workspace_present={} max_runs={} max_output_chars={} task_timeout={:?} auth={:?}",
        addr,
        config.workspace_root.display(),
        workspace_ok,
        config.max_runs,
        config.max_output_chars,
        config.task_timeout,
        auth,
    );
    if !workspace_ok {
        tracing::warn!(
            "workspace root {} does not exist; task launches will be rejected",
            config.workspace_root.display()
        );
    }
    info!(
        "dashboard secret for sync tasks: {}",
        redact_text(&config.task_env.dashboard_secret)
    );
    log_paths(&config.workspace_root);
}

fn log_paths(workspace_root: &Path) {
    let exe = std::env::current_exe().unwrap_or_else(|_| PathBuf::from("<unknown>"));
    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("<unknown>"));
    info!(
        "opsdeck paths: exe={} cwd={} workspace_root={}",
        exe.display(),
        cwd.display(),
        workspace_root.display()
    );
}
