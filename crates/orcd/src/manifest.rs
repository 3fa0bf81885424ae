//! Run Manifest Store (Section 4.2).
//!
//! The sole means of mutating `run.json`. Every mutation is a
//! read-modify-write of the whole document, written via a
//! temp-file-then-rename so a crash mid-write cannot leave a torn
//! manifest. Mutations against the same run directory are serialized by
//! an in-process lock keyed on the canonicalized `runPath`.

use chrono::Utc;
use orc_core::{
    ManifestStep, OutputRecord, RunManifest, RunStatus, RunSummary, StepDef, StepStatus,
    WorkloadDefinition,
};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex as AsyncMutex;

const MANIFEST_FILE: &str = "run.json";
const MANIFEST_VERSION: &str = "1";

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("manifest at {path} is corrupt: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("manifest not found at {0}")]
    NotFound(PathBuf),
    #[error("step '{0}' not found in manifest")]
    UnknownStep(String),
}

pub struct ManifestStore {
    locks: std::sync::Mutex<HashMap<PathBuf, Arc<AsyncMutex<()>>>>,
}

impl Default for ManifestStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ManifestStore {
    pub fn new() -> Self {
        Self {
            locks: std::sync::Mutex::new(HashMap::new()),
        }
    }

    fn lock_key(run_dir: &Path) -> PathBuf {
        std::fs::canonicalize(run_dir).unwrap_or_else(|_| run_dir.to_path_buf())
    }

    fn lock_for(&self, run_dir: &Path) -> Arc<AsyncMutex<()>> {
        let key = Self::lock_key(run_dir);
        let mut locks = self.locks.lock().expect("manifest lock map poisoned");
        Arc::clone(locks.entry(key).or_insert_with(|| Arc::new(AsyncMutex::new(()))))
    }

    fn manifest_path(run_dir: &Path) -> PathBuf {
        run_dir.join(MANIFEST_FILE)
    }

    /// Read the manifest without taking the write lock; callers outside the
    /// orchestrator must tolerate in-flight inconsistency (Section 4.2).
    pub fn read(&self, run_dir: &Path) -> Result<Option<RunManifest>, ManifestError> {
        let path = Self::manifest_path(run_dir);
        if !path.is_file() {
            return Ok(None);
        }
        let content = std::fs::read(&path).map_err(|source| ManifestError::Io {
            path: path.clone(),
            source,
        })?;
        let manifest = serde_json::from_slice(&content)
            .map_err(|source| ManifestError::Corrupt { path, source })?;
        Ok(Some(manifest))
    }

    pub fn summary(&self, run_dir: &Path) -> Result<Option<RunSummary>, ManifestError> {
        if let Some(m) = self.read(run_dir)? {
            return Ok(Some(RunSummary {
                instance_id: m.instance_id,
                workload_name: m.workload_name,
                status: m.status,
                duration: m.duration,
                output_count: m.outputs.len(),
                primary_output: m.primary_output,
            }));
        }
        Ok(derive_summary(run_dir))
    }

    async fn write_locked(
        &self,
        run_dir: &Path,
        mutate: impl FnOnce(&mut RunManifest),
    ) -> Result<RunManifest, ManifestError> {
        let lock = self.lock_for(run_dir);
        let _guard = lock.lock().await;
        let path = Self::manifest_path(run_dir);
        let mut manifest = self
            .read(run_dir)?
            .ok_or_else(|| ManifestError::NotFound(path.clone()))?;
        mutate(&mut manifest);
        self.write_whole_file(&path, &manifest)?;
        Ok(manifest)
    }

    fn write_whole_file(&self, path: &Path, manifest: &RunManifest) -> Result<(), ManifestError> {
        let bytes = serde_json::to_vec_pretty(manifest).expect("manifest always serializable");
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, bytes).map_err(|source| ManifestError::Io {
            path: tmp.clone(),
            source,
        })?;
        std::fs::rename(&tmp, path).map_err(|source| ManifestError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Create the initial manifest for a fresh run.
    pub async fn create(
        &self,
        run_dir: &Path,
        instance_id: &str,
        definition: &WorkloadDefinition,
        input: serde_json::Value,
        created_by: &str,
    ) -> Result<RunManifest, ManifestError> {
        let lock = self.lock_for(run_dir);
        let _guard = lock.lock().await;
        std::fs::create_dir_all(run_dir).map_err(|source| ManifestError::Io {
            path: run_dir.to_path_buf(),
            source,
        })?;

        let (steps, primary_output) = match definition.steps() {
            Some(steps) => (Some(initial_manifest_steps(steps)), last_step_output(steps)),
            None => (None, Some(format!("result.{}", prompt_output_extension(definition)))),
        };

        let manifest = RunManifest {
            instance_id: instance_id.to_string(),
            workload_id: definition.id.clone(),
            workload_name: definition.name.clone(),
            status: RunStatus::Pending,
            started_at: Utc::now(),
            completed_at: None,
            duration: None,
            error: None,
            input,
            steps,
            outputs: Vec::new(),
            primary_output,
            version: MANIFEST_VERSION.to_string(),
            created_by: created_by.to_string(),
        };
        let path = Self::manifest_path(run_dir);
        self.write_whole_file(&path, &manifest)?;
        Ok(manifest)
    }

    pub async fn mark_run_started(&self, run_dir: &Path) -> Result<RunManifest, ManifestError> {
        self.write_locked(run_dir, |m| {
            if m.status == RunStatus::Pending {
                m.status = RunStatus::Running;
            }
        })
        .await
    }

    pub async fn mark_run_completed(&self, run_dir: &Path) -> Result<RunManifest, ManifestError> {
        self.write_locked(run_dir, |m| {
            if !m.status.is_terminal() {
                m.status = RunStatus::Completed;
                let now = Utc::now();
                m.duration = Some((now - m.started_at).num_milliseconds());
                m.completed_at = Some(now);
            }
        })
        .await
    }

    pub async fn mark_run_failed(&self, run_dir: &Path, error: &str) -> Result<RunManifest, ManifestError> {
        self.write_locked(run_dir, |m| {
            if !m.status.is_terminal() {
                m.status = RunStatus::Failed;
                m.error = Some(error.to_string());
                let now = Utc::now();
                m.duration = Some((now - m.started_at).num_milliseconds());
                m.completed_at = Some(now);
            }
        })
        .await
    }

    pub async fn update_step(
        &self,
        run_dir: &Path,
        step_id: &str,
        status: StepStatus,
        error: Option<String>,
    ) -> Result<RunManifest, ManifestError> {
        self.write_locked(run_dir, |m| {
            let Some(steps) = m.steps.as_mut() else { return };
            let Some(step) = steps.iter_mut().find(|s| s.id == step_id) else {
                return;
            };
            if step.status == status && status.is_terminal() {
                return;
            }
            if status == StepStatus::Running && step.started_at.is_none() {
                step.started_at = Some(Utc::now());
            }
            if matches!(status, StepStatus::Completed | StepStatus::Failed | StepStatus::Skipped) {
                let now = Utc::now();
                step.completed_at = Some(now);
                if let Some(started) = step.started_at {
                    step.duration = Some((now - started).num_milliseconds());
                }
                step.sleep_until = None;
            }
            step.status = status;
            step.error = error;
        })
        .await
    }

    /// Checkpoint a durable-sleep target before a COUNTDOWN worker
    /// suspends, so a restart recomputes the remaining wait (Section 4.3.3).
    pub async fn set_sleep_checkpoint(
        &self,
        run_dir: &Path,
        step_id: &str,
        target: chrono::DateTime<Utc>,
    ) -> Result<RunManifest, ManifestError> {
        self.write_locked(run_dir, |m| {
            if let Some(steps) = m.steps.as_mut() {
                if let Some(step) = steps.iter_mut().find(|s| s.id == step_id) {
                    step.sleep_until = Some(target);
                    if step.started_at.is_none() {
                        step.started_at = Some(Utc::now());
                    }
                    step.status = StepStatus::Running;
                }
            }
        })
        .await
    }

    /// Idempotent upsert of an output record keyed by filename.
    pub async fn record_output(
        &self,
        run_dir: &Path,
        output: OutputRecord,
    ) -> Result<RunManifest, ManifestError> {
        self.write_locked(run_dir, |m| {
            if let Some(existing) = m.outputs.iter_mut().find(|o| o.file == output.file) {
                *existing = output;
            } else {
                m.outputs.push(output);
            }
        })
        .await
    }
}

fn initial_manifest_steps(steps: &[StepDef]) -> Vec<ManifestStep> {
    steps
        .iter()
        .map(|s| ManifestStep {
            id: s.id.clone(),
            name: s.name.clone(),
            worker: s.worker,
            status: StepStatus::Pending,
            output: s.output.clone(),
            started_at: None,
            completed_at: None,
            duration: None,
            error: None,
            sleep_until: None,
        })
        .collect()
}

/// The last step in definition order with no other step depending on it
/// is the workload's primary output (Section 3/4.2).
fn last_step_output(steps: &[StepDef]) -> Option<String> {
    let depended_on: std::collections::HashSet<&str> = steps
        .iter()
        .flat_map(|s| s.depends_on.iter().map(String::as_str))
        .collect();
    steps
        .iter()
        .rev()
        .find(|s| !depended_on.contains(s.id.as_str()))
        .map(|s| s.output.clone())
        .or_else(|| steps.last().map(|s| s.output.clone()))
}

/// Best-effort status for a run directory with no `run.json` (Section
/// 4.2 "Derived run status"). New code always writes the manifest
/// eagerly; this is a read-only fallback for runs that predate it or
/// survived some catastrophic write failure, never a write path.
const STALE_PENDING_THRESHOLD: chrono::Duration = chrono::Duration::minutes(5);

fn derive_summary(run_dir: &Path) -> Option<RunSummary> {
    if !run_dir.is_dir() {
        return None;
    }
    let instance_id = run_dir.file_name()?.to_string_lossy().to_string();
    let entries: Vec<_> = std::fs::read_dir(run_dir).ok()?.flatten().collect();

    let primary_output = entries.iter().find_map(|e| {
        let name = e.file_name().to_string_lossy().to_string();
        let is_result = name.starts_with("result.");
        let is_markdown_not_readme = name.ends_with(".md") && !name.eq_ignore_ascii_case("readme.md");
        (is_result || is_markdown_not_readme).then_some(name)
    });

    let status = if primary_output.is_some() {
        RunStatus::Completed
    } else {
        let oldest_mtime = entries
            .iter()
            .filter_map(|e| e.metadata().ok()?.modified().ok())
            .map(chrono::DateTime::<Utc>::from)
            .min()
            .unwrap_or_else(Utc::now);
        if Utc::now() - oldest_mtime > STALE_PENDING_THRESHOLD {
            RunStatus::Failed
        } else {
            RunStatus::Pending
        }
    };

    Some(RunSummary {
        instance_id: instance_id.clone(),
        workload_name: instance_id,
        status,
        duration: None,
        output_count: entries
            .iter()
            .filter(|e| e.file_name().to_string_lossy() != MANIFEST_FILE)
            .count(),
        primary_output,
    })
}

fn prompt_output_extension(definition: &WorkloadDefinition) -> &'static str {
    match &definition.shape {
        orc_core::WorkloadShape::Prompt { output, .. } => output.format.extension(),
        orc_core::WorkloadShape::Steps { .. } => "json",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use orc_core::{OutputKind, WorkloadShape};
    use tempfile::tempdir;

    fn prompt_definition() -> WorkloadDefinition {
        WorkloadDefinition {
            id: "weather".to_string(),
            name: "Weather".to_string(),
            description: None,
            version: "1.0.0".to_string(),
            tags: vec![],
            alert: None,
            input: HashMap::new(),
            legacy_type: None,
            shape: WorkloadShape::Prompt {
                prompt: "Weather for {{location}}".to_string(),
                model: None,
                output: orc_core::PromptOutput {
                    format: orc_core::OutputFormat::Json,
                },
            },
        }
    }

    #[tokio::test]
    async fn create_then_read_round_trips() {
        let dir = tempdir().unwrap();
        let store = ManifestStore::new();
        let def = prompt_definition();
        let manifest = store
            .create(dir.path(), "weather-2026-01-01-000000", &def, serde_json::json!({}), "executor")
            .await
            .unwrap();
        assert_eq!(manifest.status, RunStatus::Pending);
        assert_eq!(manifest.primary_output.as_deref(), Some("result.json"));
        let read_back = store.read(dir.path()).unwrap().unwrap();
        assert_eq!(read_back.instance_id, manifest.instance_id);
    }

    #[tokio::test]
    async fn mark_completed_sets_duration_once() {
        let dir = tempdir().unwrap();
        let store = ManifestStore::new();
        let def = prompt_definition();
        store
            .create(dir.path(), "weather-x", &def, serde_json::json!({}), "executor")
            .await
            .unwrap();
        store.mark_run_started(dir.path()).await.unwrap();
        let completed = store.mark_run_completed(dir.path()).await.unwrap();
        assert_eq!(completed.status, RunStatus::Completed);
        assert!(completed.duration.is_some());

        // Replaying a terminal transition must not mutate it further (idempotence).
        let completed_at = completed.completed_at;
        let replay = store.mark_run_completed(dir.path()).await.unwrap();
        assert_eq!(replay.completed_at, completed_at);
    }

    #[tokio::test]
    async fn record_output_is_idempotent_upsert() {
        let dir = tempdir().unwrap();
        let store = ManifestStore::new();
        let def = prompt_definition();
        store
            .create(dir.path(), "weather-x", &def, serde_json::json!({}), "executor")
            .await
            .unwrap();
        let record = OutputRecord {
            file: "result.json".to_string(),
            step: "root".to_string(),
            kind: OutputKind::Primary,
            format: "json".to_string(),
            size: 10,
        };
        store.record_output(dir.path(), record.clone()).await.unwrap();
        let mut updated = record.clone();
        updated.size = 20;
        let manifest = store.record_output(dir.path(), updated).await.unwrap();
        assert_eq!(manifest.outputs.len(), 1);
        assert_eq!(manifest.outputs[0].size, 20);
    }

    #[tokio::test]
    async fn summary_derives_completed_status_for_manifest_less_run_with_a_result_file() {
        let dir = tempdir().unwrap();
        let run_dir = dir.path().join("weather-x");
        std::fs::create_dir_all(&run_dir).unwrap();
        std::fs::write(run_dir.join("result.json"), "{}").unwrap();
        let store = ManifestStore::new();
        let summary = store.summary(&run_dir).unwrap().unwrap();
        assert_eq!(summary.status, RunStatus::Completed);
        assert_eq!(summary.primary_output.as_deref(), Some("result.json"));
    }

    #[tokio::test]
    async fn summary_derives_pending_status_for_fresh_manifest_less_run() {
        let dir = tempdir().unwrap();
        let run_dir = dir.path().join("weather-x");
        std::fs::create_dir_all(&run_dir).unwrap();
        std::fs::write(run_dir.join("raw-news.json"), "{}").unwrap();
        let store = ManifestStore::new();
        let summary = store.summary(&run_dir).unwrap().unwrap();
        assert_eq!(summary.status, RunStatus::Pending);
    }

    #[test]
    fn last_step_output_picks_leaf_step() {
        let steps = vec![
            StepDef {
                id: "fetch-news".to_string(),
                name: "Fetch".to_string(),
                worker: orc_core::WorkerKind::Fetch,
                config: serde_json::json!({}),
                input: vec![],
                output: "raw-news.json".to_string(),
                depends_on: vec![],
                condition: None,
                parallel: None,
            },
            StepDef {
                id: "summarize".to_string(),
                name: "Summarize".to_string(),
                worker: orc_core::WorkerKind::Ai,
                config: serde_json::json!({}),
                input: vec!["raw-news.json".to_string()],
                output: "digest.md".to_string(),
                depends_on: vec!["fetch-news".to_string()],
                condition: None,
                parallel: None,
            },
        ];
        assert_eq!(last_step_output(&steps).as_deref(), Some("digest.md"));
    }
}
