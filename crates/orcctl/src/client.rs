//! HTTP client for orcd.
//!
//! Communicates with orcd via its local REST façade (Section 6.2).

use chrono::{DateTime, Utc};
use orc_core::{RunManifest, RunSummary, ScheduleRecord, WorkloadDefinition};
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("daemon not running at {addr}\n  → start with: orcd\n  → or set ORCD_ADDR if using a different address")]
    ConnectionFailed { addr: String },

    #[error("HTTP error: {status} - {message}")]
    HttpError { status: u16, message: String },

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("I/O error: {0}")]
    IoError(String),

    #[error(
        "daemon not ready after {timeout_ms}ms at {addr}\n  → ensure orcd is running\n  → check ORCD_ADDR if using a different address"
    )]
    DaemonNotReady { addr: String, timeout_ms: u64 },
}

impl From<reqwest::Error> for ClientError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_connect() {
            let addr = e.url().map(|u| u.to_string()).unwrap_or_else(|| "unknown".to_string());
            ClientError::ConnectionFailed { addr }
        } else {
            ClientError::HttpError {
                status: e.status().map(|s| s.as_u16()).unwrap_or(0),
                message: e.to_string(),
            }
        }
    }
}

/// Mirrors the wire shape of `orcd::server`'s `WorkloadSummary` (Section 6.2).
#[derive(Debug, Clone, Deserialize)]
pub struct WorkloadSummary {
    pub id: String,
    pub name: String,
    pub folder: String,
    pub description: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub validation_errors: Vec<String>,
    #[serde(default)]
    pub validation_warnings: Vec<String>,
}

/// Mirrors the wire shape of `orcd::server`'s `WorkloadDetail`: the
/// flattened definition plus the raw YAML it was parsed from.
#[derive(Debug, Clone, Deserialize)]
pub struct WorkloadDetail {
    #[serde(flatten)]
    pub definition: WorkloadDefinition,
    pub yaml: String,
}

/// Mirrors `orcd::scheduler::UpcomingEntry`.
#[derive(Debug, Clone, Deserialize)]
pub struct UpcomingEntry {
    pub schedule_id: String,
    pub schedule_name: String,
    pub next: Option<DateTime<Utc>>,
    pub previous: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
pub struct CreateWorkloadRequest {
    pub yaml: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub folder: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CreateScheduleRequest {
    pub name: String,
    pub workload_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cron: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interval: Option<String>,
    pub enabled: bool,
    #[serde(skip_serializing_if = "serde_json::Value::is_null")]
    pub params: serde_json::Value,
    pub missed_execution_policy: String,
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    error: String,
    #[serde(default)]
    details: Option<serde_json::Value>,
}

/// Default total timeout for daemon readiness probe (Section 4.1's general
/// "start fast, fail loud" posture, adapted from the readiness probe the
/// agent-loop daemon uses).
const DEFAULT_READY_TIMEOUT_MS: u64 = 5000;
const INITIAL_BACKOFF_MS: u64 = 200;

/// HTTP client for orcd's REST façade.
pub struct Client {
    base_url: String,
    http: reqwest::Client,
}

impl Client {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
        }
    }

    pub fn addr(&self) -> &str {
        &self.base_url
    }

    pub async fn check_health(&self) -> Result<bool, ClientError> {
        let url = format!("{}/health", self.base_url);
        let response = self.http.get(&url).headers(self.headers()).send().await?;
        Ok(response.status().is_success())
    }

    pub async fn wait_for_ready(&self) -> Result<(), ClientError> {
        self.wait_for_ready_with_timeout(DEFAULT_READY_TIMEOUT_MS).await
    }

    pub async fn wait_for_ready_with_timeout(&self, timeout_ms: u64) -> Result<(), ClientError> {
        let start = std::time::Instant::now();
        let mut backoff_ms = INITIAL_BACKOFF_MS;

        loop {
            match self.check_health().await {
                Ok(true) => return Ok(()),
                Ok(false) | Err(_) => {
                    let elapsed = start.elapsed().as_millis() as u64;
                    if elapsed >= timeout_ms {
                        return Err(ClientError::DaemonNotReady {
                            addr: self.base_url.clone(),
                            timeout_ms,
                        });
                    }
                    eprintln!("waiting for daemon at {} (retrying in {}ms)", self.base_url, backoff_ms);
                    let remaining = timeout_ms.saturating_sub(elapsed);
                    let sleep_ms = backoff_ms.min(remaining);
                    tokio::time::sleep(std::time::Duration::from_millis(sleep_ms)).await;
                    backoff_ms = backoff_ms.saturating_mul(2);
                }
            }
        }
    }

    fn headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers
    }

    async fn handle_error(&self, response: reqwest::Response) -> ClientError {
        let status = response.status().as_u16();
        if status == 404 {
            return ClientError::NotFound("resource not found".to_string());
        }
        let body: Result<ErrorResponse, _> = response.json().await;
        match body {
            Ok(e) => ClientError::HttpError {
                status,
                message: match e.details {
                    Some(details) => format!("{} ({})", e.error, details),
                    None => e.error,
                },
            },
            Err(_) => ClientError::HttpError { status, message: "unknown error".to_string() },
        }
    }

    // --- Workloads ---

    pub async fn list_workloads(&self) -> Result<Vec<WorkloadSummary>, ClientError> {
        let url = format!("{}/workloads", self.base_url);
        let response = self.http.get(&url).headers(self.headers()).send().await?;
        if !response.status().is_success() {
            return Err(self.handle_error(response).await);
        }
        Ok(response.json().await.map_err(|e| ClientError::InvalidResponse(e.to_string()))?)
    }

    pub async fn get_workload(&self, id: &str) -> Result<WorkloadDetail, ClientError> {
        let url = format!("{}/workloads/{}", self.base_url, id);
        let response = self.http.get(&url).headers(self.headers()).send().await?;
        if !response.status().is_success() {
            return Err(self.handle_error(response).await);
        }
        Ok(response.json().await.map_err(|e| ClientError::InvalidResponse(e.to_string()))?)
    }

    pub async fn create_workload(&self, yaml: String, folder: Option<String>) -> Result<String, ClientError> {
        let url = format!("{}/workloads", self.base_url);
        let response = self
            .http
            .post(&url)
            .headers(self.headers())
            .json(&CreateWorkloadRequest { yaml, folder })
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(self.handle_error(response).await);
        }
        let body: serde_json::Value = response.json().await.map_err(|e| ClientError::InvalidResponse(e.to_string()))?;
        Ok(body["id"].as_str().unwrap_or_default().to_string())
    }

    pub async fn update_workload(&self, id: &str, yaml: String) -> Result<(), ClientError> {
        let url = format!("{}/workloads/{}", self.base_url, id);
        let response = self
            .http
            .put(&url)
            .headers(self.headers())
            .json(&CreateWorkloadRequest { yaml, folder: None })
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(self.handle_error(response).await);
        }
        Ok(())
    }

    pub async fn validate_workload(&self, yaml: String) -> Result<(), ClientError> {
        let id = serde_yaml::from_str::<WorkloadDefinition>(&yaml)
            .map(|d| d.id)
            .map_err(|e| ClientError::InvalidResponse(format!("invalid yaml: {e}")))?;
        let url = format!("{}/workloads/{}/validate", self.base_url, id);
        let response = self
            .http
            .post(&url)
            .headers(self.headers())
            .json(&CreateWorkloadRequest { yaml, folder: None })
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(self.handle_error(response).await);
        }
        Ok(())
    }

    pub async fn delete_workload(&self, id: &str) -> Result<(), ClientError> {
        let url = format!("{}/workloads/{}", self.base_url, id);
        let response = self.http.delete(&url).headers(self.headers()).send().await?;
        if !response.status().is_success() {
            return Err(self.handle_error(response).await);
        }
        Ok(())
    }

    pub async fn move_workload(&self, id: &str, folder: &str) -> Result<(), ClientError> {
        let url = format!("{}/workloads/{}/move", self.base_url, id);
        let response = self
            .http
            .post(&url)
            .headers(self.headers())
            .json(&serde_json::json!({ "folder": folder }))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(self.handle_error(response).await);
        }
        Ok(())
    }

    pub async fn reload(&self) -> Result<usize, ClientError> {
        let url = format!("{}/reload", self.base_url);
        let response = self.http.post(&url).headers(self.headers()).send().await?;
        if !response.status().is_success() {
            return Err(self.handle_error(response).await);
        }
        let body: serde_json::Value = response.json().await.map_err(|e| ClientError::InvalidResponse(e.to_string()))?;
        Ok(body["workloads"].as_u64().unwrap_or(0) as usize)
    }

    // --- Folders ---

    pub async fn list_folders(&self) -> Result<Vec<String>, ClientError> {
        let url = format!("{}/folders", self.base_url);
        let response = self.http.get(&url).headers(self.headers()).send().await?;
        if !response.status().is_success() {
            return Err(self.handle_error(response).await);
        }
        Ok(response.json().await.map_err(|e| ClientError::InvalidResponse(e.to_string()))?)
    }

    pub async fn create_folder(&self, path: &str) -> Result<(), ClientError> {
        let url = format!("{}/folders", self.base_url);
        let response = self
            .http
            .post(&url)
            .headers(self.headers())
            .json(&serde_json::json!({ "path": path }))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(self.handle_error(response).await);
        }
        Ok(())
    }

    pub async fn rename_folder(&self, from: &str, to: &str) -> Result<(), ClientError> {
        let url = format!("{}/folders", self.base_url);
        let response = self
            .http
            .put(&url)
            .headers(self.headers())
            .json(&serde_json::json!({ "from": from, "to": to }))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(self.handle_error(response).await);
        }
        Ok(())
    }

    pub async fn delete_folder(&self, path: &str, force: bool) -> Result<(), ClientError> {
        let url = format!("{}/folders", self.base_url);
        let response = self
            .http
            .delete(&url)
            .headers(self.headers())
            .json(&serde_json::json!({ "path": path, "force": force }))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(self.handle_error(response).await);
        }
        Ok(())
    }

    // --- Runs ---

    pub async fn run_workload(&self, id: &str, params: serde_json::Value) -> Result<String, ClientError> {
        let url = format!("{}/run/{}", self.base_url, id);
        let response = self.http.post(&url).headers(self.headers()).json(&params).send().await?;
        if !response.status().is_success() {
            return Err(self.handle_error(response).await);
        }
        let body: serde_json::Value = response.json().await.map_err(|e| ClientError::InvalidResponse(e.to_string()))?;
        Ok(body["instanceId"].as_str().unwrap_or_default().to_string())
    }

    pub async fn list_runs(&self, status: Option<&str>) -> Result<Vec<RunSummary>, ClientError> {
        let mut url = format!("{}/runs", self.base_url);
        if let Some(status) = status {
            url = format!("{}?status={}", url, status);
        }
        let response = self.http.get(&url).headers(self.headers()).send().await?;
        if !response.status().is_success() {
            return Err(self.handle_error(response).await);
        }
        Ok(response.json().await.map_err(|e| ClientError::InvalidResponse(e.to_string()))?)
    }

    pub async fn get_run(&self, instance_id: &str) -> Result<RunManifest, ClientError> {
        let url = format!("{}/runs/{}", self.base_url, instance_id);
        let response = self.http.get(&url).headers(self.headers()).send().await?;
        if !response.status().is_success() {
            return Err(self.handle_error(response).await);
        }
        Ok(response.json().await.map_err(|e| ClientError::InvalidResponse(e.to_string()))?)
    }

    pub async fn delete_run(&self, instance_id: &str) -> Result<(), ClientError> {
        let url = format!("{}/runs/{}", self.base_url, instance_id);
        let response = self.http.delete(&url).headers(self.headers()).send().await?;
        if !response.status().is_success() {
            return Err(self.handle_error(response).await);
        }
        Ok(())
    }

    pub async fn purge_failed_runs(&self) -> Result<usize, ClientError> {
        let url = format!("{}/runs", self.base_url);
        let response = self.http.delete(&url).headers(self.headers()).send().await?;
        if !response.status().is_success() {
            return Err(self.handle_error(response).await);
        }
        let body: serde_json::Value = response.json().await.map_err(|e| ClientError::InvalidResponse(e.to_string()))?;
        Ok(body["purged"].as_u64().unwrap_or(0) as usize)
    }

    pub async fn get_run_file(&self, instance_id: &str, name: &str) -> Result<Vec<u8>, ClientError> {
        let url = format!("{}/runs/{}/file/{}", self.base_url, instance_id, name);
        let response = self.http.get(&url).headers(self.headers()).send().await?;
        if !response.status().is_success() {
            return Err(self.handle_error(response).await);
        }
        Ok(response.bytes().await.map(|b| b.to_vec()).map_err(|e| ClientError::InvalidResponse(e.to_string()))?)
    }

    // --- Schedules ---

    pub async fn list_schedules(&self) -> Result<Vec<ScheduleRecord>, ClientError> {
        let url = format!("{}/schedules", self.base_url);
        let response = self.http.get(&url).headers(self.headers()).send().await?;
        if !response.status().is_success() {
            return Err(self.handle_error(response).await);
        }
        Ok(response.json().await.map_err(|e| ClientError::InvalidResponse(e.to_string()))?)
    }

    pub async fn upcoming_schedules(&self) -> Result<Vec<UpcomingEntry>, ClientError> {
        let url = format!("{}/schedules/upcoming", self.base_url);
        let response = self.http.get(&url).headers(self.headers()).send().await?;
        if !response.status().is_success() {
            return Err(self.handle_error(response).await);
        }
        Ok(response.json().await.map_err(|e| ClientError::InvalidResponse(e.to_string()))?)
    }

    pub async fn create_schedule(&self, req: CreateScheduleRequest) -> Result<ScheduleRecord, ClientError> {
        let url = format!("{}/schedules", self.base_url);
        let response = self.http.post(&url).headers(self.headers()).json(&req).send().await?;
        if !response.status().is_success() {
            return Err(self.handle_error(response).await);
        }
        Ok(response.json().await.map_err(|e| ClientError::InvalidResponse(e.to_string()))?)
    }

    pub async fn delete_schedule(&self, id: &str) -> Result<(), ClientError> {
        let url = format!("{}/schedules/{}", self.base_url, id);
        let response = self.http.delete(&url).headers(self.headers()).send().await?;
        if !response.status().is_success() {
            return Err(self.handle_error(response).await);
        }
        Ok(())
    }

    pub async fn toggle_schedule(&self, id: &str) -> Result<ScheduleRecord, ClientError> {
        let url = format!("{}/schedules/{}/toggle", self.base_url, id);
        let response = self.http.patch(&url).headers(self.headers()).send().await?;
        if !response.status().is_success() {
            return Err(self.handle_error(response).await);
        }
        Ok(response.json().await.map_err(|e| ClientError::InvalidResponse(e.to_string()))?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_trims_trailing_slash() {
        let client = Client::new("http://localhost:4780/");
        assert_eq!(client.base_url, "http://localhost:4780");
    }

    #[test]
    fn client_preserves_url_without_trailing_slash() {
        let client = Client::new("http://localhost:4780");
        assert_eq!(client.base_url, "http://localhost:4780");
    }

    #[test]
    fn client_addr_returns_base_url() {
        let client = Client::new("http://localhost:4780");
        assert_eq!(client.addr(), "http://localhost:4780");
    }

    #[test]
    fn client_headers_include_content_type() {
        let client = Client::new("http://localhost:4780");
        let headers = client.headers();
        assert_eq!(headers.get(CONTENT_TYPE).unwrap(), "application/json");
    }

    #[tokio::test]
    async fn check_health_fails_when_daemon_not_running() {
        let client = Client::new("http://127.0.0.1:19999");
        let result = client.check_health().await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn wait_for_ready_times_out_when_daemon_not_running() {
        let client = Client::new("http://127.0.0.1:19999");
        let result = client.wait_for_ready_with_timeout(100).await;
        match result {
            Err(ClientError::DaemonNotReady { addr, timeout_ms }) => {
                assert_eq!(addr, "http://127.0.0.1:19999");
                assert_eq!(timeout_ms, 100);
            }
            _ => panic!("expected DaemonNotReady error"),
        }
    }

    #[test]
    fn daemon_not_ready_error_message_includes_hint() {
        let err = ClientError::DaemonNotReady { addr: "http://127.0.0.1:4780".to_string(), timeout_ms: 5000 };
        let msg = err.to_string();
        assert!(msg.contains("127.0.0.1:4780"));
        assert!(msg.contains("5000ms"));
        assert!(msg.contains("orcd"));
    }

    #[test]
    fn connection_failed_error_suggests_start_command() {
        let err = ClientError::ConnectionFailed { addr: "http://127.0.0.1:4780".to_string() };
        let msg = err.to_string();
        assert!(msg.contains("orcd"), "should suggest starting orcd");
        assert!(msg.contains("ORCD_ADDR"), "should mention ORCD_ADDR env var");
    }
}
