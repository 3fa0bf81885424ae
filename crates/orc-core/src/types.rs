//! Core data types shared by every component of the engine.
//!
//! These mirror the data model in Section 3 of the design: workload
//! definitions as loaded from YAML, the run manifest that is the sole
//! source of truth for a run's state, and schedule records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Internal correlation id (plan id, lock key). Not the same as the
/// externally-visible `instanceId`/workload `id`/schedule `id` strings.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Id(pub String);

impl Id {
    pub fn new() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }
}

impl Default for Id {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for Id {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for Id {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Worker kinds a step may be bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerKind {
    Ai,
    Fetch,
    Exec,
    Countdown,
    Alert,
}

impl WorkerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ai => "ai",
            Self::Fetch => "fetch",
            Self::Exec => "exec",
            Self::Countdown => "countdown",
            Self::Alert => "alert",
        }
    }
}

/// Output document format for a prompt workload or an AI step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    Json,
    Markdown,
    Text,
}

impl OutputFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Markdown => "markdown",
            Self::Text => "text",
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Markdown => "md",
            Self::Text => "txt",
        }
    }
}

/// Declared type of an input parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InputType {
    String,
    Number,
    Boolean,
}

/// One entry of a workload's `input` map.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputParam {
    #[serde(rename = "type")]
    pub param_type: InputType,
    #[serde(default)]
    pub required: bool,
    pub description: Option<String>,
    pub default: Option<serde_json::Value>,
}

/// Optional alert trigger attached to a workload; evaluated against the
/// terminal output of the AI worker (Section 4.3.5).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertTrigger {
    /// A substring/keyword that must appear in the result for the alert
    /// to fire; absent means "always fire on success".
    pub condition: Option<String>,
    pub title: String,
    pub message: String,
}

/// A single step in a step-shaped workload's DAG.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepDef {
    pub id: String,
    pub name: String,
    pub worker: WorkerKind,
    #[serde(default)]
    pub config: serde_json::Value,
    #[serde(default)]
    pub input: Vec<String>,
    pub output: String,
    #[serde(default, rename = "dependsOn")]
    pub depends_on: Vec<String>,
    pub condition: Option<String>,
    pub parallel: Option<bool>,
}

/// The two mutually-exclusive execution shapes a workload may declare.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WorkloadShape {
    Prompt {
        prompt: String,
        model: Option<String>,
        output: PromptOutput,
    },
    Steps {
        steps: Vec<StepDef>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptOutput {
    pub format: OutputFormat,
}

/// A workload recipe as discovered by the loader. Legacy `type` is parsed
/// but never inspected for classification (Section 3, Open Question #1).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkloadDefinition {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub version: String,
    #[serde(default)]
    pub tags: Vec<String>,
    pub alert: Option<AlertTrigger>,
    #[serde(default)]
    pub input: HashMap<String, InputParam>,
    #[serde(rename = "type")]
    pub legacy_type: Option<String>,
    #[serde(flatten)]
    pub shape: WorkloadShape,
}

impl WorkloadDefinition {
    pub fn is_prompt(&self) -> bool {
        matches!(self.shape, WorkloadShape::Prompt { .. })
    }

    pub fn steps(&self) -> Option<&[StepDef]> {
        match &self.shape {
            WorkloadShape::Steps { steps } => Some(steps),
            WorkloadShape::Prompt { .. } => None,
        }
    }
}

/// Run lifecycle status (Section 8, invariant 1: monotonic, terminal once set).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Per-step manifest status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }
}

/// Whether an output record is the run's final document or an
/// intermediate asset consumed by a later step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputKind {
    Intermediate,
    Primary,
}

/// One entry of the manifest's `outputs[]` array.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OutputRecord {
    pub file: String,
    pub step: String,
    #[serde(rename = "type")]
    pub kind: OutputKind,
    pub format: String,
    pub size: u64,
}

/// One entry of the manifest's `steps[]` array for step-shaped workloads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestStep {
    pub id: String,
    pub name: String,
    pub worker: WorkerKind,
    pub status: StepStatus,
    pub output: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Wall-clock target for a pending durable sleep (COUNTDOWN checkpoint),
    /// recorded before the worker suspends so a restart can recompute the
    /// remaining wait instead of resleeping from scratch (Section 4.3.3).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sleep_until: Option<DateTime<Utc>>,
}

/// The run manifest: sole source of truth for a run's state (Section 3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunManifest {
    pub instance_id: String,
    pub workload_id: String,
    pub workload_name: String,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub input: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub steps: Option<Vec<ManifestStep>>,
    #[serde(default)]
    pub outputs: Vec<OutputRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub primary_output: Option<String>,
    pub version: String,
    pub created_by: String,
}

/// Summary view of a run (Section 4.2, `Summary`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub instance_id: String,
    pub workload_name: String,
    pub status: RunStatus,
    pub duration: Option<i64>,
    pub output_count: usize,
    pub primary_output: Option<String>,
}

/// Policy applied to cron occurrences missed while the daemon was not
/// ticking (Section 4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MissedExecutionPolicy {
    Catchup,
    Last,
    Skip,
    Log,
}

impl Default for MissedExecutionPolicy {
    fn default() -> Self {
        Self::Log
    }
}

/// One schedule record file under `<data>/schedules/<id>.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleRecord {
    pub id: String,
    pub name: String,
    pub workload_id: String,
    pub cron: Option<String>,
    pub interval: Option<String>,
    pub enabled: bool,
    #[serde(default)]
    pub params: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_run_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub missed_execution_policy: MissedExecutionPolicy,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A per-file accumulation of loader errors (Section 4.1); does not abort
/// the catalog reload.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ValidationError {
    pub file: String,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

/// One entry of `<data>/alerts/<alertId>.json` written by the `log` alert
/// channel (Section 4.3.4).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertRecord {
    pub id: String,
    pub title: String,
    pub message: String,
    pub priority: Option<String>,
    pub source: AlertSource,
    pub created_at: DateTime<Utc>,
    pub acknowledged: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertSource {
    pub plan_id: Id,
    pub task_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_generates_unique_values() {
        let id1 = Id::new();
        let id2 = Id::new();
        assert_ne!(id1, id2);
    }

    #[test]
    fn run_status_is_terminal() {
        assert!(RunStatus::Completed.is_terminal());
        assert!(RunStatus::Failed.is_terminal());
        assert!(!RunStatus::Running.is_terminal());
        assert!(!RunStatus::Pending.is_terminal());
    }

    #[test]
    fn step_status_is_terminal() {
        assert!(StepStatus::Completed.is_terminal());
        assert!(StepStatus::Failed.is_terminal());
        assert!(StepStatus::Skipped.is_terminal());
        assert!(!StepStatus::Running.is_terminal());
        assert!(!StepStatus::Pending.is_terminal());
    }

    #[test]
    fn missed_execution_policy_defaults_to_log() {
        assert_eq!(MissedExecutionPolicy::default(), MissedExecutionPolicy::Log);
    }

    #[test]
    fn worker_kind_serializes_snake_case() {
        assert_eq!(serde_json::to_string(&WorkerKind::Fetch).unwrap(), "\"fetch\"");
    }

    #[test]
    fn workload_shape_prompt_round_trips() {
        let yaml = r#"
id: weather
name: Weather
version: "1.0.0"
prompt: "Weather for {{location}}"
output:
  format: json
"#;
        let def: WorkloadDefinition = serde_yaml::from_str(yaml).unwrap();
        assert!(def.is_prompt());
        assert_eq!(def.steps(), None);
    }

    #[test]
    fn workload_shape_steps_round_trips() {
        let yaml = r#"
id: news-digest
name: News Digest
version: "1.0.0"
steps:
  - id: fetch-news
    name: Fetch News
    worker: fetch
    output: raw-news.json
  - id: summarize
    name: Summarize
    worker: ai
    input: [raw-news.json]
    output: digest.md
    dependsOn: [fetch-news]
"#;
        let def: WorkloadDefinition = serde_yaml::from_str(yaml).unwrap();
        assert!(!def.is_prompt());
        assert_eq!(def.steps().unwrap().len(), 2);
    }

    #[test]
    fn legacy_type_field_is_parsed_but_unused() {
        let yaml = r#"
id: legacy
name: Legacy
version: "1.0.0"
type: task
prompt: "hello"
output:
  format: text
"#;
        let def: WorkloadDefinition = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(def.legacy_type.as_deref(), Some("task"));
        assert!(def.is_prompt());
    }
}
