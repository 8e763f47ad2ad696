//! Task catalog.
//!
//! A fixed table of task definitions. Each definition carries its field schema
//! and a plain function that turns validated parameters into an invocation
//! plan. Numeric fields are clamped through the schema rather than rejected.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde_json::Value;

use crate::config::{OrchestratorConfig, TaskEnv};
use crate::error::{BuildError, OrchestratorError};
use crate::model::{FieldKind, FieldSpec, InvocationPlan, TaskParams, TaskSummary};

pub const X_CAPTION_MAX_CHARS: usize = 280;
pub const MAIN_CAPTION_MAX_CHARS: usize = 2200;

pub type BuildFn = fn(&BuildInput<'_>) -> Result<InvocationPlan, BuildError>;

/// Process-wide inputs every build function may read.
#[derive(Debug, Clone)]
pub struct BuildContext {
    pub workspace_root: PathBuf,
    pub env: TaskEnv,
}

impl BuildContext {
    pub fn from_config(config: &OrchestratorConfig) -> Self {
        Self {
            workspace_root: config.workspace_root.clone(),
            env: config.task_env.clone(),
        }
    }

    /// Resolve a path-like value against the workspace root unless absolute.
    pub fn resolve_path(&self, raw: &str) -> PathBuf {
        let path = Path::new(raw);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.workspace_root.join(path)
        }
    }

    /// A plan running `executable` inside the workspace root.
    pub fn plan(&self, executable: &str) -> InvocationPlan {
        InvocationPlan::new(executable, self.workspace_root.clone())
    }

    /// A node script plan with the model-selection overrides.
    fn node_ai_plan(&self, script: &str) -> InvocationPlan {
        self.plan(&self.env.node_bin)
            .arg(script)
            .env("AI_PROVIDER", self.env.ai_provider.clone())
            .env("OPENAI_MODEL", self.env.openai_model.clone())
    }
}

#[derive(Clone)]
pub struct TaskDefinition {
    pub id: String,
    pub title: String,
    pub description: String,
    pub single_flight: bool,
    pub fields: Vec<FieldSpec>,
    build: BuildFn,
}

impl std::fmt::Debug for TaskDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskDefinition")
            .field("id", &self.id)
            .field("single_flight", &self.single_flight)
            .field("fields", &self.fields.len())
            .finish_non_exhaustive()
    }
}

impl TaskDefinition {
    pub fn new(id: &str, title: &str, description: &str, build: BuildFn) -> Self {
        Self {
            id: id.to_string(),
            title: title.to_string(),
            description: description.to_string(),
            single_flight: true,
            fields: Vec::new(),
            build,
        }
    }

    pub fn single_flight(mut self, single_flight: bool) -> Self {
        self.single_flight = single_flight;
        self
    }

    pub fn field(mut self, field: FieldSpec) -> Self {
        self.fields.push(field);
        self
    }

    pub fn summary(&self) -> TaskSummary {
        TaskSummary {
            id: self.id.clone(),
            title: self.title.clone(),
            description: self.description.clone(),
            single_flight: self.single_flight,
            fields: self.fields.clone(),
        }
    }

    pub fn build(
        &self,
        context: &BuildContext,
        params: &TaskParams,
    ) -> Result<InvocationPlan, BuildError> {
        let input = BuildInput {
            context,
            fields: &self.fields,
            params,
        };
        (self.build)(&input)
    }
}

/// Parameters paired with the schema they are validated against.
pub struct BuildInput<'a> {
    pub context: &'a BuildContext,
    fields: &'a [FieldSpec],
    params: &'a TaskParams,
}

impl<'a> BuildInput<'a> {
    fn spec(&self, key: &str, kind: FieldKind) -> Result<&'a FieldSpec, BuildError> {
        self.fields
            .iter()
            .find(|field| field.key == key && field.kind == kind)
            .ok_or_else(|| BuildError::new(format!("{key} is not a declared {kind:?} field")))
    }

    /// Integer value clamped into the field's declared range.
    pub fn int(&self, key: &str) -> Result<i64, BuildError> {
        let spec = self.spec(key, FieldKind::Number)?;
        let fallback = spec.default_value.as_i64().unwrap_or(0);
        let value = coerce_int(self.params.get(key)).unwrap_or(fallback);
        let min = spec.min.unwrap_or(i64::MIN);
        let max = spec.max.unwrap_or(i64::MAX);
        Ok(value.clamp(min, max))
    }

    /// Boolean value, falling back to the field default when absent.
    pub fn flag(&self, key: &str) -> Result<bool, BuildError> {
        let spec = self.spec(key, FieldKind::Boolean)?;
        let fallback = spec.default_value.as_bool().unwrap_or(false);
        Ok(match self.params.get(key) {
            None | Some(Value::Null) => fallback,
            Some(value) => coerce_flag(value),
        })
    }

    /// Trimmed free text; non-string values read as empty.
    pub fn text(&self, key: &str) -> String {
        self.params
            .get(key)
            .and_then(Value::as_str)
            .map(|value| value.trim().to_string())
            .unwrap_or_default()
    }

    pub fn required_text(&self, key: &str) -> Result<String, BuildError> {
        let value = self.text(key);
        if value.is_empty() {
            return Err(BuildError::new(format!("{key} is required")));
        }
        Ok(value)
    }
}

/// Fail when `value` is longer than `max_chars` characters.
pub fn ensure_max_chars(key: &str, value: &str, max_chars: usize) -> Result<(), BuildError> {
    if value.chars().count() > max_chars {
        return Err(BuildError::new(format!(
            "{key} must be {max_chars} characters or fewer"
        )));
    }
    Ok(())
}

/// Integers from JSON numbers (truncated) or strings with a leading integer.
pub fn coerce_int(value: Option<&Value>) -> Option<i64> {
    match value? {
        Value::Number(number) => number
            .as_i64()
            .or_else(|| number.as_f64().filter(|f| f.is_finite()).map(|f| f.trunc() as i64)),
        Value::String(raw) => leading_int(raw.trim()),
        _ => None,
    }
}

fn leading_int(raw: &str) -> Option<i64> {
    let (sign, digits) = match raw.strip_prefix('-') {
        Some(rest) => (-1, rest),
        None => (1, raw.strip_prefix('+').unwrap_or(raw)),
    };
    let end = digits
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(digits.len());
    if end == 0 {
        return None;
    }
    digits[..end]
        .parse::<i64>()
        .ok()
        .map(|magnitude| sign * magnitude)
}

pub fn coerce_flag(value: &Value) -> bool {
    match value {
        Value::Bool(flag) => *flag,
        Value::Number(number) => number.as_f64().is_some_and(|f| f != 0.0),
        Value::String(raw) => !matches!(
            raw.trim().to_ascii_lowercase().as_str(),
            "" | "0" | "false" | "no" | "off"
        ),
        Value::Null => false,
        Value::Array(_) | Value::Object(_) => true,
    }
}

#[derive(Debug, Clone)]
pub struct TaskCatalog {
    tasks: Vec<TaskDefinition>,
    index: HashMap<String, usize>,
}

impl TaskCatalog {
    pub fn new(tasks: Vec<TaskDefinition>) -> Self {
        let index = tasks
            .iter()
            .enumerate()
            .map(|(idx, task)| (task.id.clone(), idx))
            .collect();
        Self { tasks, index }
    }

    pub fn builtin() -> Self {
        Self::new(builtin_tasks())
    }

    pub fn list(&self) -> Vec<TaskSummary> {
        self.tasks.iter().map(TaskDefinition::summary).collect()
    }

    pub fn resolve(&self, task_id: &str) -> Option<&TaskDefinition> {
        self.index.get(task_id).map(|idx| &self.tasks[*idx])
    }

    pub fn build(
        &self,
        task_id: &str,
        context: &BuildContext,
        params: &TaskParams,
    ) -> Result<InvocationPlan, OrchestratorError> {
        let task = self
            .resolve(task_id)
            .ok_or_else(|| OrchestratorError::UnknownTask(task_id.to_string()))?;
        Ok(task.build(context, params)?)
    }
}

pub fn builtin_tasks() -> Vec<TaskDefinition> {
    vec![
        TaskDefinition::new(
            "engage-x",
            "Engage X",
            "Reply to fresh, high-value X posts.",
            build_engage_x,
        )
        .field(FieldSpec::number("limit", "Limit", 1, 25, 10))
        .field(FieldSpec::boolean("dryRun", "Dry Run", false)),
        TaskDefinition::new(
            "engage-instagram",
            "Engage Instagram",
            "Find and comment on relevant Instagram posts.",
            build_engage_instagram,
        )
        .field(FieldSpec::number("limit", "Limit", 1, 30, 10))
        .field(FieldSpec::boolean("dryRun", "Dry Run", true)),
        TaskDefinition::new(
            "post-all-video",
            "Post Video (All Platforms)",
            "Post one local video to X, LinkedIn, Facebook, and Instagram.",
            build_post_all_video,
        )
        .field(FieldSpec::text("videoFile", "Video File Path"))
        .field(FieldSpec::textarea("xCaption", "X Caption (<= 280)"))
        .field(FieldSpec::textarea("mainCaption", "Main Caption (LI/FB/IG)"))
        .field(FieldSpec::boolean("dryRun", "Dry Run", true)),
        TaskDefinition::new(
            "test-connections",
            "Test Connections",
            "Run end-to-end platform connectivity checks.",
            build_test_connections,
        ),
        TaskDefinition::new(
            "sync-dashboard",
            "Sync Dashboard",
            "Push latest bot metrics into this dashboard.",
            build_sync_dashboard,
        ),
    ]
}

fn build_engagement(input: &BuildInput<'_>, script: &str) -> Result<InvocationPlan, BuildError> {
    let limit = input.int("limit")?;
    let dry_run = input.flag("dryRun")?;
    let mut plan = input
        .context
        .node_ai_plan(script)
        .arg(format!("--limit={limit}"));
    if dry_run {
        plan = plan.arg("--dry-run");
    }
    Ok(plan)
}

fn build_engage_x(input: &BuildInput<'_>) -> Result<InvocationPlan, BuildError> {
    build_engagement(input, "scripts/engage-x.js")
}

fn build_engage_instagram(input: &BuildInput<'_>) -> Result<InvocationPlan, BuildError> {
    build_engagement(input, "scripts/engage-instagram.js")
}

fn build_post_all_video(input: &BuildInput<'_>) -> Result<InvocationPlan, BuildError> {
    let video_file = input.required_text("videoFile")?;
    let main_caption = input.required_text("mainCaption")?;
    let x_caption = input.required_text("xCaption")?;
    ensure_max_chars("xCaption", &x_caption, X_CAPTION_MAX_CHARS)?;
    ensure_max_chars("mainCaption", &main_caption, MAIN_CAPTION_MAX_CHARS)?;
    let dry_run = input.flag("dryRun")?;

    let video_file = input.context.resolve_path(&video_file);
    let mut plan = input.context.node_ai_plan("scripts/post-all-video.js").args([
        "--video-file".to_string(),
        video_file.to_string_lossy().into_owned(),
        "--x-caption".to_string(),
        x_caption,
        "--main-caption".to_string(),
        main_caption,
    ]);
    if dry_run {
        plan = plan.arg("--dry-run");
    }
    Ok(plan)
}

fn build_test_connections(input: &BuildInput<'_>) -> Result<InvocationPlan, BuildError> {
    Ok(input
        .context
        .plan(&input.context.env.node_bin)
        .arg("scripts/test-connection.js"))
}

fn build_sync_dashboard(input: &BuildInput<'_>) -> Result<InvocationPlan, BuildError> {
    let env = &input.context.env;
    Ok(input
        .context
        .plan(&env.node_bin)
        .arg("scripts/sync-dashboard.js")
        .env("DASHBOARD_URL", env.dashboard_url.clone())
        .env("DASHBOARD_SECRET", env.dashboard_secret.clone()))
}
