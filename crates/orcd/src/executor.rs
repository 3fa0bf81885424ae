//! Executor façade (Section 2's "single entry point").
//!
//! Takes `(workloadId, inputs)`, allocates an instance id and run
//! directory, writes the initial manifest, and emits exactly one
//! `plan.created` (step workload) or `task.ready` (prompt workload).
//! Creation-time errors (unknown workload, invalid input) are surfaced
//! synchronously to the caller, never onto the bus (Section 7).

use chrono::Local;
use orc_core::events::{PlanCreatedPayload, PlanStepRef, TaskReadyPayload};
use orc_core::{interpolate_value, stringify_params, Id, WorkloadDefinition};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

use crate::bus::Bus;
use crate::loader::Loader;
use crate::manifest::{ManifestError, ManifestStore};

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("unknown workload '{0}'")]
    UnknownWorkload(String),
    #[error("manifest error: {0}")]
    Manifest(#[from] ManifestError),
}

pub struct Executor {
    loader: Arc<Loader>,
    manifest: Arc<ManifestStore>,
    bus: Arc<Bus>,
    runs_dir: PathBuf,
}

impl Executor {
    pub fn new(loader: Arc<Loader>, manifest: Arc<ManifestStore>, bus: Arc<Bus>, runs_dir: PathBuf) -> Self {
        Self { loader, manifest, bus, runs_dir }
    }

    /// Runs a workload with the given input, returning the freshly
    /// allocated `instanceId`.
    pub async fn run(&self, workload_id: &str, input: serde_json::Value) -> Result<String, ExecutorError> {
        let definition = self
            .loader
            .get(workload_id)
            .ok_or_else(|| ExecutorError::UnknownWorkload(workload_id.to_string()))?;

        let instance_id = allocate_instance_id(&definition.id);
        let run_dir = self.runs_dir.join(&instance_id);

        self.manifest
            .create(&run_dir, &instance_id, &definition, input.clone(), "executor")
            .await?;
        self.manifest.mark_run_started(&run_dir).await?;

        let run_path = run_dir.to_string_lossy().to_string();
        let plan_id = Id::new();

        match definition.steps() {
            Some(steps) => {
                let step_refs: Vec<PlanStepRef> = steps
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
                self.bus
                    .publish_plan_created(PlanCreatedPayload {
                        plan_id,
                        template_id: definition.id.clone(),
                        run_path,
                        steps: step_refs,
                        input,
                        is_workflow: true,
                        alert: definition.alert.clone(),
                    })
                    .await;
            }
            None => {
                self.dispatch_prompt_workload(&definition, plan_id, run_path, input).await;
            }
        }

        Ok(instance_id)
    }

    async fn dispatch_prompt_workload(
        &self,
        definition: &WorkloadDefinition,
        plan_id: Id,
        run_path: String,
        input: serde_json::Value,
    ) {
        let orc_core::WorkloadShape::Prompt { prompt, model, output } = &definition.shape else {
            unreachable!("dispatch_prompt_workload only called for prompt-shaped workloads");
        };
        let params = stringify_params(&input);
        let interpolated_prompt = orc_core::interpolate_string(prompt, &params);

        let mut config = serde_json::json!({
            "prompt": interpolated_prompt,
            "model": model,
            "outputFormat": output.format.as_str(),
        });
        if let Some(alert) = &definition.alert {
            config["__alert"] = serde_json::json!({
                "condition": alert.condition,
                "title": alert.title,
                "message": alert.message,
            });
        }
        let config = interpolate_value(&config, &params);

        self.bus
            .publish_task_ready(TaskReadyPayload {
                plan_id,
                task_id: "root".to_string(),
                worker: orc_core::WorkerKind::Ai,
                config,
                input: vec![],
                output: format!("result.{}", output.format.extension()),
                run_path,
                primary: true,
            })
            .await;
    }
}

/// `<workloadId>-YYYY-MM-DD-HHMMSS`, local time, zero-padded (Section 3).
fn allocate_instance_id(workload_id: &str) -> String {
    format!("{workload_id}-{}", Local::now().format("%Y-%m-%d-%H%M%S"))
}
