//! Event contract carried by the in-process event bus (Section 5.2).
//!
//! Five required events plus one internal bookkeeping event
//! (`RunRecovered`, emitted when the orchestrator reconstructs plan
//! state from the manifest after a restart). Every event carries a
//! server-assigned `Id` and timestamp for dedup/audit purposes, wrapping
//! one of the concrete payload structs in a single untagged enum.

use crate::types::{AlertTrigger, Id, WorkerKind};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    PlanCreated,
    TaskReady,
    TaskCompleted,
    PlanCompleted,
    WorkloadTrigger,
    RunRecovered,
    TaskFailed,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PlanCreated => "plan.created",
            Self::TaskReady => "task.ready",
            Self::TaskCompleted => "task.completed",
            Self::PlanCompleted => "plan.completed",
            Self::WorkloadTrigger => "workload.trigger",
            Self::RunRecovered => "run.recovered",
            Self::TaskFailed => "task.failed",
        }
    }
}

/// Emitted by the Executor (prompt-less workloads skip straight to
/// `TaskReady`) or by the Executor for step-shaped workloads, consumed by
/// the Plan Orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanCreatedPayload {
    pub plan_id: Id,
    pub template_id: String,
    pub run_path: String,
    pub steps: Vec<PlanStepRef>,
    pub input: serde_json::Value,
    #[serde(default)]
    pub is_workflow: bool,
    /// The workload's optional alert trigger, carried along so the
    /// orchestrator can attach it to the AI step that produces the final
    /// result without a back-reference to the loader (Section 4.3.5).
    #[serde(default)]
    pub alert: Option<AlertTrigger>,
}

/// A lightweight reference to a step as carried on `plan.created`; the
/// orchestrator reconstructs ready-frontier state from these plus the
/// manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanStepRef {
    pub id: String,
    pub name: String,
    pub worker: WorkerKind,
    pub config: serde_json::Value,
    pub input: Vec<String>,
    pub output: String,
    pub depends_on: Vec<String>,
}

/// Emitted by the Executor (prompt workloads) or the Orchestrator (step
/// workloads) for every dispatched task, consumed by exactly one worker
/// filtering on `worker == <name>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskReadyPayload {
    pub plan_id: Id,
    pub task_id: String,
    pub worker: WorkerKind,
    pub config: serde_json::Value,
    pub input: Vec<String>,
    pub output: String,
    pub run_path: String,
    /// Whether this task's output is the run's final document (Section
    /// 4.3 step 4: `type = primary` iff prompt workload or the step
    /// producing the workload's final result).
    #[serde(default)]
    pub primary: bool,
}

/// Emitted by a worker on completion, consumed by the Orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskCompletedPayload {
    pub plan_id: Id,
    pub task_id: String,
    pub output: String,
    pub run_path: String,
}

/// Terminal event for a plan; nothing consumes this inside the core, it
/// exists for audit/observability.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanCompletedPayload {
    pub plan_id: Id,
    pub run_path: String,
}

/// Emitted by the Scheduler on a cron tick (or a missed-execution
/// recovery decision), consumed by the trigger handler which calls the
/// Executor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkloadTriggerPayload {
    pub schedule_id: String,
    pub schedule_name: String,
    pub workload_id: String,
    pub params: serde_json::Value,
}

/// Internal bookkeeping event: the orchestrator rebuilt `PlanState` for a
/// plan id that had no in-memory cache entry (process restart or cache
/// eviction), by re-reading the manifest and original workload definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecoveredPayload {
    pub plan_id: Id,
    pub run_path: String,
}

/// Internal bookkeeping event: a worker's step exhausted its retry
/// budget (or hit a permanent error) and was marked `failed` in the
/// manifest. Distinct from `task.completed`, which per Section 4.4 is
/// only ever emitted on success; the orchestrator subscribes to this to
/// abandon the plan (`MarkRunFailed`) without further dispatch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskFailedPayload {
    pub plan_id: Id,
    pub task_id: String,
    pub run_path: String,
    pub error: String,
}

/// Union of every payload shape the bus carries.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EventPayload {
    PlanCreated(PlanCreatedPayload),
    TaskReady(TaskReadyPayload),
    TaskCompleted(TaskCompletedPayload),
    PlanCompleted(PlanCompletedPayload),
    WorkloadTrigger(WorkloadTriggerPayload),
    RunRecovered(RunRecoveredPayload),
    TaskFailed(TaskFailedPayload),
}

impl EventPayload {
    pub fn event_type(&self) -> EventType {
        match self {
            Self::PlanCreated(_) => EventType::PlanCreated,
            Self::TaskReady(_) => EventType::TaskReady,
            Self::TaskCompleted(_) => EventType::TaskCompleted,
            Self::PlanCompleted(_) => EventType::PlanCompleted,
            Self::WorkloadTrigger(_) => EventType::WorkloadTrigger,
            Self::RunRecovered(_) => EventType::RunRecovered,
            Self::TaskFailed(_) => EventType::TaskFailed,
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

/// The envelope every event carries on the bus: a payload plus the
/// dedup/audit metadata (Section 5.2's implementation note).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: Id,
    pub timestamp: DateTime<Utc>,
    pub payload: EventPayload,
}

impl Event {
    pub fn new(payload: EventPayload) -> Self {
        Self {
            id: Id::new(),
            timestamp: Utc::now(),
            payload,
        }
    }

    pub fn event_type(&self) -> EventType {
        self.payload.event_type()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_type_as_str_matches_contract_names() {
        assert_eq!(EventType::PlanCreated.as_str(), "plan.created");
        assert_eq!(EventType::TaskReady.as_str(), "task.ready");
        assert_eq!(EventType::TaskCompleted.as_str(), "task.completed");
        assert_eq!(EventType::PlanCompleted.as_str(), "plan.completed");
        assert_eq!(EventType::WorkloadTrigger.as_str(), "workload.trigger");
    }

    #[test]
    fn event_wraps_payload_and_assigns_id() {
        let event = Event::new(EventPayload::TaskCompleted(TaskCompletedPayload {
            plan_id: Id::new(),
            task_id: "fetch-news".to_string(),
            output: "raw-news.json".to_string(),
            run_path: "/data/runs/x".to_string(),
        }));
        assert_eq!(event.event_type(), EventType::TaskCompleted);
    }

    #[test]
    fn payload_round_trips_through_json() {
        let payload = EventPayload::TaskReady(TaskReadyPayload {
            plan_id: Id::new(),
            task_id: "summarize".to_string(),
            worker: WorkerKind::Ai,
            config: serde_json::json!({"prompt": "hi"}),
            input: vec!["raw-news.json".to_string()],
            output: "digest.md".to_string(),
            run_path: "/data/runs/x".to_string(),
            primary: false,
        });
        let json = payload.to_json();
        let back: EventPayload = serde_json::from_value(json).unwrap();
        assert_eq!(back.event_type(), EventType::TaskReady);
    }
}
