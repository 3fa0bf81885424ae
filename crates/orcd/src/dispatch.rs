//! Shared per-task dispatcher (Section 4.3's implementation note).
//!
//! Every worker implements only step 2 of the worker contract (execute
//! the worker-specific operation); this module performs steps 1 and 3-6
//! uniformly for all five worker kinds, so idempotence of the
//! output-write/manifest-update path is implemented once.

use orc_core::events::{TaskCompletedPayload, TaskFailedPayload, TaskReadyPayload};
use orc_core::{EventPayload, OutputKind, OutputRecord, StepStatus, WorkerKind};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::bus::Bus;
use crate::manifest::ManifestStore;
use crate::workers::{default_retry_budget, Worker, WorkerBody, WorkerContext, WorkerError};

const RETRY_BACKOFF_BASE: Duration = Duration::from_millis(200);

/// Drains the `task.ready` channel for a single worker kind, gating
/// concurrent executions behind the bus's per-kind semaphore.
pub async fn run_worker_loop(
    bus: Arc<Bus>,
    worker: Arc<dyn Worker>,
    manifest: Arc<ManifestStore>,
    data_dir: PathBuf,
) {
    let kind = worker.kind();
    let mut rx = bus.take_task_ready_receiver(kind).await;
    info!(worker = kind.as_str(), "worker loop started");
    while let Some(event) = rx.recv().await {
        let EventPayload::TaskReady(payload) = event.payload else {
            continue;
        };
        let bus = Arc::clone(&bus);
        let worker = Arc::clone(&worker);
        let manifest = Arc::clone(&manifest);
        let data_dir = data_dir.clone();
        let semaphore = bus.semaphore(kind);
        tokio::spawn(async move {
            let _permit = semaphore
                .acquire_owned()
                .await
                .expect("bus semaphore never closed");
            dispatch_task(&bus, worker.as_ref(), &manifest, &data_dir, payload).await;
        });
    }
}

async fn dispatch_task(
    bus: &Bus,
    worker: &dyn Worker,
    manifest: &Arc<ManifestStore>,
    data_dir: &Path,
    payload: TaskReadyPayload,
) {
    let run_path = PathBuf::from(&payload.run_path);
    let inputs = read_input_files(&run_path, &payload.input);
    let budget = default_retry_budget(payload.worker);

    let mut attempt: u32 = 0;
    loop {
        let ctx = WorkerContext {
            plan_id: payload.plan_id.clone(),
            task_id: payload.task_id.clone(),
            run_path: run_path.clone(),
            inputs: inputs.clone(),
            config: payload.config.clone(),
            data_dir: data_dir.to_path_buf(),
            manifest: Arc::clone(manifest),
        };

        match worker.execute(&ctx).await {
            Ok(success) => {
                if let Err(e) = finish_success(manifest, &run_path, &payload, success).await {
                    error!(task = %payload.task_id, error = %e, "failed to persist worker output");
                }
                bus.publish_task_completed(TaskCompletedPayload {
                    plan_id: payload.plan_id,
                    task_id: payload.task_id,
                    output: payload.output,
                    run_path: payload.run_path,
                })
                .await;
                return;
            }
            Err(err) => {
                if should_retry(&err, attempt, budget) {
                    attempt += 1;
                    warn!(
                        task = %payload.task_id,
                        attempt,
                        error = %err,
                        "worker step failed, retrying"
                    );
                    tokio::time::sleep(RETRY_BACKOFF_BASE * attempt.max(1)).await;
                    continue;
                }
                error!(task = %payload.task_id, error = %err, "worker step failed permanently");
                let _ = manifest
                    .update_step(&run_path, &payload.task_id, StepStatus::Failed, Some(err.message.clone()))
                    .await;
                bus.publish_task_failed(TaskFailedPayload {
                    plan_id: payload.plan_id,
                    task_id: payload.task_id,
                    run_path: payload.run_path,
                    error: err.message,
                })
                .await;
                return;
            }
        }
    }
}

fn should_retry(err: &WorkerError, attempt: u32, budget: u32) -> bool {
    !err.permanent && attempt < budget
}

async fn finish_success(
    manifest: &ManifestStore,
    run_path: &Path,
    payload: &TaskReadyPayload,
    success: crate::workers::WorkerSuccess,
) -> Result<(), crate::manifest::ManifestError> {
    let (bytes, format) = match success.body {
        WorkerBody::Json(value) => (
            serde_json::to_vec_pretty(&value).unwrap_or_default(),
            success.format,
        ),
        WorkerBody::Text(text) => (text.into_bytes(), success.format),
    };
    let output_path = run_path.join(&payload.output);
    if let Some(parent) = output_path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    std::fs::write(&output_path, &bytes).map_err(|source| crate::manifest::ManifestError::Io {
        path: output_path.clone(),
        source,
    })?;

    manifest
        .record_output(
            run_path,
            OutputRecord {
                file: payload.output.clone(),
                step: payload.task_id.clone(),
                kind: if payload.primary {
                    OutputKind::Primary
                } else {
                    OutputKind::Intermediate
                },
                format: format.to_string(),
                size: bytes.len() as u64,
            },
        )
        .await?;
    manifest
        .update_step(run_path, &payload.task_id, StepStatus::Completed, None)
        .await?;
    Ok(())
}

/// Reads every referenced input file from `runPath/<name>`, tolerating a
/// missing file as `{"error": "Could not read file"}` (Section 4.3 step 1).
fn read_input_files(run_path: &Path, names: &[String]) -> HashMap<String, serde_json::Value> {
    let mut out = HashMap::new();
    for name in names {
        let path = run_path.join(name);
        let value = match std::fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .unwrap_or_else(|_| serde_json::Value::String(String::from_utf8_lossy(&bytes).to_string())),
            Err(_) => serde_json::json!({"error": "Could not read file"}),
        };
        out.insert(name.clone(), value);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai_backend::MockAiBackend;
    use crate::workers::ai::AiWorker;
    use orc_core::Id;
    use tempfile::tempdir;

    #[tokio::test]
    async fn successful_task_emits_completion_and_writes_output() {
        let run_dir = tempdir().unwrap();
        let data_dir = tempdir().unwrap();
        let manifest = Arc::new(ManifestStore::new());
        let def = orc_core::WorkloadDefinition {
            id: "weather".to_string(),
            name: "Weather".to_string(),
            description: None,
            version: "1.0.0".to_string(),
            tags: vec![],
            alert: None,
            input: HashMap::new(),
            legacy_type: None,
            shape: orc_core::WorkloadShape::Prompt {
                prompt: "hi".to_string(),
                model: None,
                output: orc_core::PromptOutput { format: orc_core::OutputFormat::Json },
            },
        };
        manifest
            .create(run_dir.path(), "weather-x", &def, serde_json::json!({}), "executor")
            .await
            .unwrap();

        let bus = Bus::new();
        let worker: Arc<dyn Worker> = Arc::new(AiWorker::new(Arc::new(MockAiBackend)));
        let mut completed_rx = bus.take_task_completed_receiver().await;

        let payload = TaskReadyPayload {
            plan_id: Id::new(),
            task_id: "root".to_string(),
            worker: WorkerKind::Ai,
            config: serde_json::json!({"prompt": "hello", "outputFormat": "text"}),
            input: vec![],
            output: "result.txt".to_string(),
            run_path: run_dir.path().to_string_lossy().to_string(),
            primary: true,
        };
        dispatch_task(&bus, worker.as_ref(), &manifest, data_dir.path(), payload).await;

        let event = completed_rx.recv().await.expect("completion event");
        assert_eq!(event.event_type(), orc_core::EventType::TaskCompleted);
        assert!(run_dir.path().join("result.txt").is_file());
    }

    #[tokio::test]
    async fn missing_input_file_is_tolerated() {
        let run_dir = tempdir().unwrap();
        let inputs = read_input_files(run_dir.path(), &["missing.json".to_string()]);
        assert_eq!(inputs["missing.json"]["error"], "Could not read file");
    }
}
