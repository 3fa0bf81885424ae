//! AI worker (Section 4.3.5).
//!
//! Substitution of `{{param}}` placeholders happens once, upstream, in
//! the orchestrator/executor's config-interpolation step (Section
//! 4.4) — by the time `config.prompt` reaches this worker it is already
//! fully interpolated, which is what makes the interpolation-purity
//! invariant (Section 8, invariant 6) provable from a single
//! implementation. This worker only appends the collected input-file
//! contents and invokes the backend.

use async_trait::async_trait;
use chrono::Utc;
use orc_core::{AlertRecord, AlertSource, Id, WorkerKind};
use serde::Deserialize;
use std::sync::Arc;

use crate::ai_backend::AiBackend;
use crate::workers::{Worker, WorkerContext, WorkerError, WorkerSuccess};

pub struct AiWorker {
    backend: Arc<dyn AiBackend>,
}

impl AiWorker {
    pub fn new(backend: Arc<dyn AiBackend>) -> Self {
        Self { backend }
    }
}

#[derive(Deserialize)]
struct AiConfig {
    prompt: String,
    #[serde(default)]
    model: Option<String>,
    #[serde(default, rename = "outputFormat")]
    output_format: Option<String>,
    #[serde(default, rename = "__alert")]
    alert: Option<AlertConfig>,
}

#[derive(Deserialize)]
struct AlertConfig {
    condition: Option<String>,
    title: String,
    message: String,
}

#[async_trait]
impl Worker for AiWorker {
    fn kind(&self) -> WorkerKind {
        WorkerKind::Ai
    }

    async fn execute(&self, ctx: &WorkerContext) -> Result<WorkerSuccess, WorkerError> {
        let config: AiConfig = serde_json::from_value(ctx.config.clone())
            .map_err(|e| WorkerError::permanent(format!("invalid ai config: {e}")))?;

        let mut prompt = config.prompt.clone();
        if !ctx.inputs.is_empty() {
            let appendix = serde_json::to_string(&ctx.inputs)
                .unwrap_or_else(|_| "{}".to_string());
            prompt.push_str("\n\n--- input data ---\n");
            prompt.push_str(&appendix);
        }

        let result = self
            .backend
            .send_prompt(&prompt, config.model.as_deref())
            .await
            .map_err(|e| WorkerError::transient(e.to_string()))?;

        if let Some(alert) = &config.alert {
            self.maybe_write_alert(ctx, alert, &result)?;
        }

        Ok(wrap_result(config.output_format.as_deref(), result))
    }
}

impl AiWorker {
    fn maybe_write_alert(
        &self,
        ctx: &WorkerContext,
        alert: &AlertConfig,
        result: &str,
    ) -> Result<(), WorkerError> {
        let fires = match &alert.condition {
            Some(condition) => result.contains(condition.as_str()),
            None => true,
        };
        if !fires {
            return Ok(());
        }

        let record = AlertRecord {
            id: Id::new().to_string(),
            title: alert.title.clone(),
            message: alert.message.clone(),
            priority: None,
            source: AlertSource {
                plan_id: ctx.plan_id.clone(),
                task_id: ctx.task_id.clone(),
            },
            created_at: Utc::now(),
            acknowledged: false,
        };
        let alerts_dir = ctx.data_dir.join("alerts");
        std::fs::create_dir_all(&alerts_dir)
            .map_err(|e| WorkerError::transient(format!("could not create alerts dir: {e}")))?;
        let path = alerts_dir.join(format!("{}.json", record.id));
        let bytes = serde_json::to_vec_pretty(&record).expect("alert record always serializable");
        std::fs::write(&path, bytes)
            .map_err(|e| WorkerError::transient(format!("could not write alert: {e}")))?;
        Ok(())
    }
}

/// Extract a fenced code block's content if present, otherwise the
/// string as-is (Section 4.3.5: "extracted from any fenced code block
/// if present").
fn strip_fence(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = rest.trim_start_matches(|c: char| c.is_alphabetic());
    let rest = rest.strip_prefix('\n').unwrap_or(rest);
    rest.strip_suffix("```").unwrap_or(rest).trim()
}

fn wrap_result(output_format: Option<&str>, result: String) -> WorkerSuccess {
    match output_format {
        Some("json") => {
            let stripped = strip_fence(&result);
            match serde_json::from_str::<serde_json::Value>(stripped) {
                Ok(value) => WorkerSuccess::json(value),
                Err(_) => WorkerSuccess::json(serde_json::Value::String(stripped.to_string())),
            }
        }
        Some("text") => WorkerSuccess::text(result),
        _ => {
            let timestamp = Utc::now().to_rfc3339();
            let document = format!("# Result\n\n_Generated {timestamp}_\n\n{result}\n");
            WorkerSuccess::markdown(document)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai_backend::MockAiBackend;
    use crate::manifest::ManifestStore;
    use std::collections::HashMap;
    use tempfile::tempdir;

    fn context(run_dir: &tempfile::TempDir, data_dir: &tempfile::TempDir, config: serde_json::Value) -> WorkerContext {
        WorkerContext {
            plan_id: Id::new(),
            task_id: "root".to_string(),
            run_path: run_dir.path().to_path_buf(),
            inputs: HashMap::new(),
            config,
            data_dir: data_dir.path().to_path_buf(),
            manifest: Arc::new(ManifestStore::new()),
        }
    }

    #[tokio::test]
    async fn json_output_is_extracted_from_fence() {
        let run_dir = tempdir().unwrap();
        let data_dir = tempdir().unwrap();
        let worker = AiWorker::new(Arc::new(MockAiBackend));
        let ctx = context(
            &run_dir,
            &data_dir,
            serde_json::json!({
                "prompt": "Weather for Mooresville, NC",
                "outputFormat": "json"
            }),
        );
        let success = worker.execute(&ctx).await.unwrap();
        match success.body {
            crate::workers::WorkerBody::Json(v) => {
                assert!(v.as_str().unwrap().contains("Weather for Mooresville, NC"));
            }
            _ => panic!("expected json body"),
        }
    }

    #[tokio::test]
    async fn markdown_output_wraps_in_titled_document() {
        let run_dir = tempdir().unwrap();
        let data_dir = tempdir().unwrap();
        let worker = AiWorker::new(Arc::new(MockAiBackend));
        let ctx = context(&run_dir, &data_dir, serde_json::json!({"prompt": "hi"}));
        let success = worker.execute(&ctx).await.unwrap();
        match success.body {
            crate::workers::WorkerBody::Text(t) => assert!(t.starts_with("# Result")),
            _ => panic!("expected text body"),
        }
    }

    #[tokio::test]
    async fn alert_fires_when_condition_matches() {
        let run_dir = tempdir().unwrap();
        let data_dir = tempdir().unwrap();
        let worker = AiWorker::new(Arc::new(MockAiBackend));
        let ctx = context(
            &run_dir,
            &data_dir,
            serde_json::json!({
                "prompt": "storm warning today",
                "__alert": {"condition": "storm", "title": "Storm", "message": "brace"}
            }),
        );
        worker.execute(&ctx).await.unwrap();
        let alerts_dir = ctx.data_dir.join("alerts");
        let entries: Vec<_> = std::fs::read_dir(&alerts_dir).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn strip_fence_unwraps_json_block() {
        let text = "```json\n{\"a\":1}\n```";
        assert_eq!(strip_fence(text), "{\"a\":1}");
    }
}
