//! ALERT worker (Section 4.3.4).
//!
//! Channels are opaque system integrations (Section 1): `toast`/`sound`
//! go through the [`AlertSink`] trait, `log` is always handled in-process
//! by a direct filesystem write, mirroring the manifest store's
//! read-modify-write-whole-file discipline. Overall success requires at
//! least one requested channel to succeed.

use async_trait::async_trait;
use chrono::Utc;
use orc_core::{AlertRecord, AlertSource, Id, WorkerKind};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

use crate::alert_sink::AlertSink;
use crate::workers::{Worker, WorkerContext, WorkerError, WorkerSuccess};

pub struct AlertWorker {
    sink: Arc<dyn AlertSink>,
}

impl AlertWorker {
    pub fn new(sink: Arc<dyn AlertSink>) -> Self {
        Self { sink }
    }
}

#[derive(Deserialize)]
struct AlertConfig {
    title: String,
    message: String,
    #[serde(default = "default_type")]
    #[serde(rename = "type")]
    alert_type: String,
    #[serde(default = "default_sound")]
    sound: String,
    #[serde(default)]
    priority: Option<String>,
    #[serde(default = "default_persist")]
    persist: bool,
}

fn default_type() -> String {
    "toast".to_string()
}

fn default_sound() -> String {
    "default".to_string()
}

fn default_persist() -> bool {
    true
}

#[async_trait]
impl Worker for AlertWorker {
    fn kind(&self) -> WorkerKind {
        WorkerKind::Alert
    }

    async fn execute(&self, ctx: &WorkerContext) -> Result<WorkerSuccess, WorkerError> {
        let config: AlertConfig = serde_json::from_value(ctx.config.clone())
            .map_err(|e| WorkerError::permanent(format!("invalid alert config: {e}")))?;
        if config.title.trim().is_empty() {
            return Err(WorkerError::permanent("alert requires `title`"));
        }
        if config.message.trim().is_empty() {
            return Err(WorkerError::permanent("alert requires `message`"));
        }

        let channels = requested_channels(&config.alert_type);
        if channels.is_empty() {
            return Err(WorkerError::permanent(format!(
                "unknown alert type '{}'",
                config.alert_type
            )));
        }

        let mut statuses = serde_json::Map::new();
        let mut any_succeeded = false;

        if channels.contains(&"toast") {
            let delivered = self.sink.notify(&config.title, &config.message).await;
            any_succeeded |= delivered;
            statuses.insert("toast".to_string(), json!(delivered));
        }
        if channels.contains(&"sound") {
            let delivered = self.sink.play_sound(&config.sound).await;
            any_succeeded |= delivered;
            statuses.insert("sound".to_string(), json!(delivered));
        }
        if channels.contains(&"log") {
            let delivered = self.write_log_alert(ctx, &config).is_ok();
            any_succeeded |= delivered;
            statuses.insert("log".to_string(), json!(delivered));
        }

        Ok(WorkerSuccess::json(json!({
            "success": any_succeeded,
            "title": config.title,
            "message": config.message,
            "channels": statuses,
            "persist": config.persist,
        })))
    }
}

impl AlertWorker {
    fn write_log_alert(&self, ctx: &WorkerContext, config: &AlertConfig) -> Result<(), WorkerError> {
        let record = AlertRecord {
            id: Id::new().to_string(),
            title: config.title.clone(),
            message: config.message.clone(),
            priority: config.priority.clone(),
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
            .map_err(|e| WorkerError::transient(format!("could not write alert: {e}")))
    }
}

fn requested_channels(alert_type: &str) -> Vec<&'static str> {
    match alert_type {
        "toast" => vec!["toast"],
        "sound" => vec!["sound"],
        "log" => vec!["log"],
        "all" => vec!["toast", "sound", "log"],
        _ => vec![],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert_sink::FakeAlertSink;
    use crate::manifest::ManifestStore;
    use std::collections::HashMap;
    use tempfile::tempdir;

    fn context(run_dir: &tempfile::TempDir, data_dir: &tempfile::TempDir, config: serde_json::Value) -> WorkerContext {
        WorkerContext {
            plan_id: Id::new(),
            task_id: "alert-step".to_string(),
            run_path: run_dir.path().to_path_buf(),
            inputs: HashMap::new(),
            config,
            data_dir: data_dir.path().to_path_buf(),
            manifest: Arc::new(ManifestStore::new()),
        }
    }

    #[tokio::test]
    async fn log_channel_writes_alert_record() {
        let run_dir = tempdir().unwrap();
        let data_dir = tempdir().unwrap();
        let worker = AlertWorker::new(Arc::new(FakeAlertSink::default()));
        let ctx = context(
            &run_dir,
            &data_dir,
            json!({"title": "Storm", "message": "brace", "type": "log"}),
        );
        let success = worker.execute(&ctx).await.unwrap();
        match success.body {
            crate::workers::WorkerBody::Json(v) => assert_eq!(v["success"], true),
            _ => panic!("expected json body"),
        }
        let alerts_dir = data_dir.path().join("alerts");
        let entries: Vec<_> = std::fs::read_dir(&alerts_dir).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }

    #[tokio::test]
    async fn all_channel_fans_out_to_every_sink() {
        let run_dir = tempdir().unwrap();
        let data_dir = tempdir().unwrap();
        let worker = AlertWorker::new(Arc::new(FakeAlertSink::default()));
        let ctx = context(
            &run_dir,
            &data_dir,
            json!({"title": "Storm", "message": "brace", "type": "all"}),
        );
        let success = worker.execute(&ctx).await.unwrap();
        match success.body {
            crate::workers::WorkerBody::Json(v) => {
                assert_eq!(v["channels"]["toast"], true);
                assert_eq!(v["channels"]["sound"], true);
                assert_eq!(v["channels"]["log"], true);
            }
            _ => panic!("expected json body"),
        }
    }

    #[tokio::test]
    async fn missing_title_is_a_permanent_error() {
        let run_dir = tempdir().unwrap();
        let data_dir = tempdir().unwrap();
        let worker = AlertWorker::new(Arc::new(FakeAlertSink::default()));
        let ctx = context(&run_dir, &data_dir, json!({"title": "", "message": "x"}));
        let err = worker.execute(&ctx).await.unwrap_err();
        assert!(err.permanent);
    }
}
