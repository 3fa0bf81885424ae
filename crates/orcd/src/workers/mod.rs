//! Worker contract (Section 4.3).
//!
//! A single `Worker` trait captures step 2 of the per-worker contract
//! ("execute the worker-specific operation"); the shared dispatcher in
//! [`crate::dispatch`] performs steps 1 and 3-6 uniformly so idempotence
//! of the output-write/manifest-update path is implemented once, not
//! once per worker.

pub mod ai;
pub mod alert;
pub mod countdown;
pub mod exec;
pub mod fetch;

use async_trait::async_trait;
use orc_core::{Id, WorkerKind};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use crate::manifest::ManifestStore;

/// Everything a worker needs to perform step 2; assembled by the shared
/// dispatcher from the `task.ready` payload plus the files it read off
/// disk in step 1.
pub struct WorkerContext {
    pub plan_id: Id,
    pub task_id: String,
    pub run_path: PathBuf,
    /// Input files read from `runPath/<name>`, keyed by filename. A
    /// missing file is tolerated as `{"error": "Could not read file"}`
    /// (Section 4.3 step 1), never a hard failure.
    pub inputs: HashMap<String, serde_json::Value>,
    pub config: serde_json::Value,
    /// Root of `<data>/`, so ALERT's `log` channel and the AI worker's
    /// alert descriptor can write `<data>/alerts/<id>.json`.
    pub data_dir: PathBuf,
    pub manifest: Arc<ManifestStore>,
}

/// The body a worker hands back to the dispatcher for step 3's write.
pub enum WorkerBody {
    Json(serde_json::Value),
    Text(String),
}

pub struct WorkerSuccess {
    pub body: WorkerBody,
    /// One of `json`, `markdown`, `text` — recorded verbatim into the
    /// manifest's `OutputRecord.format` (Section 3).
    pub format: &'static str,
}

impl WorkerSuccess {
    pub fn json(value: serde_json::Value) -> Self {
        Self {
            body: WorkerBody::Json(value),
            format: "json",
        }
    }

    pub fn markdown(text: String) -> Self {
        Self {
            body: WorkerBody::Text(text),
            format: "markdown",
        }
    }

    pub fn text(text: String) -> Self {
        Self {
            body: WorkerBody::Text(text),
            format: "text",
        }
    }
}

/// Whether a failed attempt should be retried (Section 7: transient vs
/// permanent worker errors).
#[derive(Debug, Clone)]
pub struct WorkerError {
    pub permanent: bool,
    pub message: String,
}

impl WorkerError {
    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            permanent: true,
            message: message.into(),
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            permanent: false,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for WorkerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

#[async_trait]
pub trait Worker: Send + Sync {
    fn kind(&self) -> WorkerKind;

    async fn execute(&self, ctx: &WorkerContext) -> Result<WorkerSuccess, WorkerError>;
}

/// Per-worker retry budget (Section 5.1/7); AI's is overridden at startup
/// from `ai.retries` since it is the only one the config surface exposes.
pub fn default_retry_budget(worker: WorkerKind) -> u32 {
    match worker {
        WorkerKind::Ai => 2,
        WorkerKind::Fetch => 2,
        WorkerKind::Exec => 1,
        WorkerKind::Countdown => 0,
        WorkerKind::Alert => 1,
    }
}
