//! Plan Orchestrator (Section 4.4).
//!
//! Holds an in-memory `PlanState` per running step-shaped plan and walks
//! its DAG forward: on `plan.created` it computes the initial ready
//! frontier, on every `task.completed` it marks the step done and
//! recomputes the frontier, and on `task.failed` it abandons the plan.
//! `PlanState` is reconstructible at any time from the run manifest plus
//! the original workload definition, so a process restart or cache
//! eviction costs a re-read, not a correctness gap.

use dashmap::DashMap;
use orc_core::events::{
    PlanCompletedPayload, PlanStepRef, RunRecoveredPayload, TaskCompletedPayload,
    TaskFailedPayload, TaskReadyPayload,
};
use orc_core::{interpolate_value, stringify_params, AlertTrigger, EventPayload, Id, StepStatus};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::bus::Bus;
use crate::loader::Loader;
use crate::manifest::ManifestStore;

/// Reconstructed DAG state for one running plan. Independent of the
/// manifest's on-disk step statuses so the ready-frontier computation
/// never has to re-derive it from raw JSON on every event.
struct PlanState {
    run_path: PathBuf,
    steps: Vec<PlanStepRef>,
    input: serde_json::Value,
    alert: Option<AlertTrigger>,
    completed: HashSet<String>,
    dispatched: HashSet<String>,
}

impl PlanState {
    /// A step is ready iff it hasn't been dispatched, every `dependsOn`
    /// id is completed, and every input filename is the output of some
    /// already-completed step (Section 4.4).
    fn ready_steps(&self) -> Vec<PlanStepRef> {
        let produced: HashSet<&str> = self
            .steps
            .iter()
            .filter(|s| self.completed.contains(&s.id))
            .map(|s| s.output.as_str())
            .collect();
        self.steps
            .iter()
            .filter(|s| !self.dispatched.contains(&s.id))
            .filter(|s| s.depends_on.iter().all(|d| self.completed.contains(d)))
            .filter(|s| s.input.iter().all(|i| produced.contains(i.as_str())))
            .cloned()
            .collect()
    }

    fn is_complete(&self) -> bool {
        self.completed.len() == self.steps.len()
    }

    /// The step with no other step depending on it, last in definition
    /// order, is the workload's primary-output step (mirrors
    /// `manifest::last_step_output`).
    fn primary_step_id(&self) -> Option<String> {
        let depended_on: HashSet<&str> = self
            .steps
            .iter()
            .flat_map(|s| s.depends_on.iter().map(String::as_str))
            .collect();
        self.steps
            .iter()
            .rev()
            .find(|s| !depended_on.contains(s.id.as_str()))
            .or_else(|| self.steps.last())
            .map(|s| s.id.clone())
    }
}

pub struct Orchestrator {
    bus: Arc<Bus>,
    manifest: Arc<ManifestStore>,
    loader: Arc<Loader>,
    plans: DashMap<Id, PlanState>,
}

impl Orchestrator {
    pub fn new(bus: Arc<Bus>, manifest: Arc<ManifestStore>, loader: Arc<Loader>) -> Arc<Self> {
        Arc::new(Self {
            bus,
            manifest,
            loader,
            plans: DashMap::new(),
        })
    }

    /// Drains `plan.created`, `task.completed` and `task.failed` forever.
    /// Each loop owns its own receiver (taken once at startup), so the
    /// three run concurrently rather than competing for one queue.
    pub async fn run(self: Arc<Self>) {
        let created = Arc::clone(&self);
        let completed = Arc::clone(&self);
        let failed = Arc::clone(&self);
        tokio::join!(
            created.run_plan_created_loop(),
            completed.run_task_completed_loop(),
            failed.run_task_failed_loop(),
        );
    }

    async fn run_plan_created_loop(self: Arc<Self>) {
        let mut rx = self.bus.take_plan_created_receiver().await;
        info!("orchestrator plan.created loop started");
        while let Some(event) = rx.recv().await {
            if let EventPayload::PlanCreated(payload) = event.payload {
                self.start_plan(payload).await;
            }
        }
    }

    async fn run_task_completed_loop(self: Arc<Self>) {
        let mut rx = self.bus.take_task_completed_receiver().await;
        info!("orchestrator task.completed loop started");
        while let Some(event) = rx.recv().await {
            if let EventPayload::TaskCompleted(payload) = event.payload {
                self.on_task_completed(payload).await;
            }
        }
    }

    async fn run_task_failed_loop(self: Arc<Self>) {
        let mut rx = self.bus.take_task_failed_receiver().await;
        info!("orchestrator task.failed loop started");
        while let Some(event) = rx.recv().await {
            if let EventPayload::TaskFailed(payload) = event.payload {
                self.on_task_failed(payload).await;
            }
        }
    }

    async fn start_plan(&self, payload: orc_core::events::PlanCreatedPayload) {
        let run_path = PathBuf::from(&payload.run_path);
        let state = PlanState {
            run_path,
            steps: payload.steps,
            input: payload.input,
            alert: payload.alert,
            completed: HashSet::new(),
            dispatched: HashSet::new(),
        };
        self.plans.insert(payload.plan_id.clone(), state);
        self.dispatch_ready(&payload.plan_id).await;
    }

    async fn on_task_completed(&self, payload: TaskCompletedPayload) {
        if !self.plans.contains_key(&payload.plan_id) {
            self.recover_plan(&payload.plan_id, &payload.run_path).await;
        }

        let (already_done, is_complete) = {
            let Some(mut entry) = self.plans.get_mut(&payload.plan_id) else {
                warn!(plan = %payload.plan_id, task = %payload.task_id, "task.completed for an unrecoverable plan, ignoring");
                return;
            };
            // At-least-once delivery: a repeat of an already-completed
            // step is a no-op (Section 4.4, Section 8 invariant 4).
            let already_done = entry.completed.contains(&payload.task_id);
            if !already_done {
                entry.completed.insert(payload.task_id.clone());
            }
            (already_done, entry.is_complete())
        };
        if already_done {
            return;
        }

        if is_complete {
            if let Err(e) = self.manifest.mark_run_completed(Path::new(&payload.run_path)).await {
                error!(plan = %payload.plan_id, error = %e, "failed to mark run completed");
            }
            self.bus
                .publish_plan_completed(PlanCompletedPayload {
                    plan_id: payload.plan_id.clone(),
                    run_path: payload.run_path,
                })
                .await;
            self.plans.remove(&payload.plan_id);
        } else {
            self.dispatch_ready(&payload.plan_id).await;
        }
    }

    async fn on_task_failed(&self, payload: TaskFailedPayload) {
        error!(
            plan = %payload.plan_id,
            task = %payload.task_id,
            error = %payload.error,
            "step failed permanently, abandoning plan"
        );
        if let Err(e) = self
            .manifest
            .mark_run_failed(Path::new(&payload.run_path), &payload.error)
            .await
        {
            error!(plan = %payload.plan_id, error = %e, "failed to mark run failed");
        }
        self.plans.remove(&payload.plan_id);
    }

    /// Dispatches every newly-ready step of a plan, interpolating each
    /// step's config against the run's input params before publishing
    /// `task.ready` (Section 4.4's config-interpolation step).
    async fn dispatch_ready(&self, plan_id: &Id) {
        let (ready, params, primary_id, alert, run_path) = {
            let Some(mut entry) = self.plans.get_mut(plan_id) else {
                return;
            };
            let ready = entry.ready_steps();
            for step in &ready {
                entry.dispatched.insert(step.id.clone());
            }
            (
                ready,
                stringify_params(&entry.input),
                entry.primary_step_id(),
                entry.alert.clone(),
                entry.run_path.clone(),
            )
        };

        for step in ready {
            let is_primary = primary_id.as_deref() == Some(step.id.as_str());
            let mut config = interpolate_value(&step.config, &params);
            if is_primary && step.worker == orc_core::WorkerKind::Ai {
                if let Some(alert) = &alert {
                    config["__alert"] = serde_json::json!({
                        "condition": alert.condition,
                        "title": alert.title,
                        "message": alert.message,
                    });
                }
            }

            if let Err(e) = self
                .manifest
                .update_step(&run_path, &step.id, StepStatus::Running, None)
                .await
            {
                error!(plan = %plan_id, step = %step.id, error = %e, "failed to mark step running");
            }
            self.bus
                .publish_task_ready(TaskReadyPayload {
                    plan_id: plan_id.clone(),
                    task_id: step.id,
                    worker: step.worker,
                    config,
                    input: step.input,
                    output: step.output,
                    run_path: run_path.to_string_lossy().to_string(),
                    primary: is_primary,
                })
                .await;
        }
    }

    /// Reconstructs `PlanState` for a plan id with no in-memory entry by
    /// re-reading the manifest and the original workload definition.
    /// Completed/running steps in the manifest seed `completed`/
    /// `dispatched` so the recovered frontier doesn't re-dispatch
    /// in-flight work (Section 4.4, Section 7).
    async fn recover_plan(&self, plan_id: &Id, run_path: &str) {
        let run_path_buf = PathBuf::from(run_path);
        let manifest = match self.manifest.read(&run_path_buf) {
            Ok(Some(m)) => m,
            Ok(None) => {
                warn!(plan = %plan_id, run_path, "cannot recover plan: no manifest on disk");
                return;
            }
            Err(e) => {
                error!(plan = %plan_id, run_path, error = %e, "cannot recover plan: manifest unreadable");
                return;
            }
        };
        let Some(manifest_steps) = &manifest.steps else {
            // Prompt workloads have no DAG to track.
            return;
        };
        let Some(definition) = self.loader.get(&manifest.workload_id) else {
            warn!(plan = %plan_id, workload = %manifest.workload_id, "cannot recover plan: workload definition no longer in the catalog");
            return;
        };
        let Some(step_defs) = definition.steps() else {
            return;
        };

        let steps: Vec<PlanStepRef> = step_defs
            .iter()
            .map(|s| PlanStepRef {
                id: s.id.clone(),
                name: s.name.clone(),
                worker: s.worker,
                config: s.config.clone(),
                input: s.input.clone(),
                output: s.output.clone(),
                depends_on: s.depends_on.clone(),
            })
            .collect();

        let completed: HashSet<String> = manifest_steps
            .iter()
            .filter(|s| s.status == StepStatus::Completed)
            .map(|s| s.id.clone())
            .collect();
        let dispatched: HashSet<String> = manifest_steps
            .iter()
            .filter(|s| matches!(s.status, StepStatus::Running | StepStatus::Completed))
            .map(|s| s.id.clone())
            .collect();

        info!(plan = %plan_id, run_path, completed = completed.len(), total = steps.len(), "recovered plan state from manifest");
        self.plans.insert(
            plan_id.clone(),
            PlanState {
                run_path: run_path_buf,
                steps,
                input: manifest.input.clone(),
                alert: definition.alert.clone(),
                completed,
                dispatched,
            },
        );
        self.bus
            .publish_run_recovered(RunRecoveredPayload {
                plan_id: plan_id.clone(),
                run_path: run_path.to_string(),
            })
            .await;
    }
}
