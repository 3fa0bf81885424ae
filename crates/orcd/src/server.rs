//! HTTP control plane (Section 6.2).
//!
//! A local-only `axum::Router` consumed by the GUI and by `orcctl`.
//! Every handler returns `Result<impl IntoResponse, (StatusCode,
//! Json<ErrorResponse>)>` so failures are always the `{error, details?}`
//! shape; nothing here panics on caller-supplied input.

use std::net::SocketAddr;
use std::path::{Path as FsPath, PathBuf};
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use orc_core::{MissedExecutionPolicy, ScheduleRecord, ValidationError, WorkloadDefinition};

use crate::executor::Executor;
use crate::loader::{self, Loader};
use crate::manifest::ManifestStore;
use crate::scheduler::{CronScheduler, ScheduleStore, UpcomingEntry};

pub struct AppState {
    pub loader: Arc<Loader>,
    pub manifest: Arc<ManifestStore>,
    pub executor: Arc<Executor>,
    pub schedules: Arc<ScheduleStore>,
    pub scheduler: Arc<CronScheduler>,
    pub runs_dir: PathBuf,
}

pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/workloads", get(list_workloads).post(create_workload))
        .route("/workloads/errors", get(list_workload_errors))
        .route(
            "/workloads/{id}",
            get(get_workload).put(update_workload).delete(delete_workload),
        )
        .route("/workloads/{id}/validate", post(validate_workload))
        .route("/workloads/{id}/move", post(move_workload))
        .route(
            "/folders",
            get(list_folders).post(create_folder).put(rename_folder).delete(delete_folder),
        )
        .route("/run/{id}", post(run_workload))
        .route("/runs", get(list_runs).delete(purge_failed_runs))
        .route("/runs/{id}", get(get_run).delete(delete_run))
        .route("/runs/{id}/file/{name}", get(get_run_file))
        .route("/schedules", get(list_schedules).post(create_schedule))
        .route("/schedules/upcoming", get(upcoming_schedules))
        .route("/schedules/{id}", axum::routing::delete(delete_schedule))
        .route("/schedules/{id}/toggle", axum::routing::patch(toggle_schedule))
        .route("/reload", post(reload_catalog))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn start_server(state: Arc<AppState>, port: u16) -> eyre::Result<()> {
    let router = create_router(state);
    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    info!(%addr, "HTTP server listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router).await?;
    Ok(())
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

fn err(status: StatusCode, message: impl Into<String>) -> (StatusCode, Json<ErrorResponse>) {
    (
        status,
        Json(ErrorResponse {
            error: message.into(),
            details: None,
        }),
    )
}

fn err_with_details(
    status: StatusCode,
    message: impl Into<String>,
    details: serde_json::Value,
) -> (StatusCode, Json<ErrorResponse>) {
    (
        status,
        Json(ErrorResponse {
            error: message.into(),
            details: Some(details),
        }),
    )
}

async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "timestamp": Utc::now(),
    }))
}

// --- Workloads ---

#[derive(Debug, Serialize)]
struct WorkloadSummary {
    id: String,
    name: String,
    folder: String,
    description: Option<String>,
    tags: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    validation_errors: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    validation_warnings: Vec<String>,
}

fn folder_of(path: &FsPath, root: &FsPath) -> String {
    path.strip_prefix(root)
        .ok()
        .and_then(|rel| rel.parent())
        .map(|p| p.to_string_lossy().replace(std::path::MAIN_SEPARATOR, "/"))
        .unwrap_or_default()
}

async fn list_workloads(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let errors_by_file: std::collections::HashMap<String, ValidationError> = state
        .loader
        .errors()
        .into_iter()
        .map(|e| (e.file.clone(), e))
        .collect();

    let root = state.loader.personal_root().to_path_buf();
    let summaries: Vec<WorkloadSummary> = state
        .loader
        .list()
        .into_iter()
        .map(|definition| {
            let path = state.loader.path_of(&definition.id).unwrap_or_default();
            let file_errors = errors_by_file.get(&path.display().to_string());
            WorkloadSummary {
                id: definition.id.clone(),
                name: definition.name,
                folder: folder_of(&path, &root),
                description: definition.description,
                tags: definition.tags,
                validation_errors: file_errors.map(|e| e.errors.clone()).unwrap_or_default(),
                validation_warnings: file_errors.map(|e| e.warnings.clone()).unwrap_or_default(),
            }
        })
        .collect();
    Json(summaries)
}

/// `GET /workloads/errors` — the loader's parallel Validation Error
/// collection (Section 4.1), surfaced on its own so the GUI can render
/// a dedicated "broken files" view without re-deriving it from
/// `/workloads`' per-item `validationErrors` fields.
async fn list_workload_errors(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.loader.errors())
}

#[derive(Debug, Serialize)]
struct WorkloadDetail {
    #[serde(flatten)]
    definition: WorkloadDefinition,
    yaml: String,
}

async fn get_workload(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, (StatusCode, Json<ErrorResponse>)> {
    let definition = state
        .loader
        .get(&id)
        .ok_or_else(|| err(StatusCode::NOT_FOUND, format!("workload '{id}' not found")))?;
    let path = state.loader.path_of(&id).unwrap_or_default();
    let yaml = std::fs::read_to_string(&path).unwrap_or_default();
    Ok(Json(WorkloadDetail { definition, yaml }))
}

#[derive(Debug, Deserialize)]
struct YamlBody {
    yaml: String,
    #[serde(default)]
    folder: Option<String>,
}

fn parse_and_validate(yaml: &str) -> Result<WorkloadDefinition, (StatusCode, Json<ErrorResponse>)> {
    let definition: WorkloadDefinition = serde_yaml::from_str(yaml)
        .map_err(|e| err(StatusCode::BAD_REQUEST, format!("invalid yaml: {e}")))?;
    let errors = loader::validate(&definition);
    if !errors.is_empty() {
        return Err(err_with_details(
            StatusCode::BAD_REQUEST,
            "workload failed validation",
            serde_json::json!({ "errors": errors }),
        ));
    }
    Ok(definition)
}

fn sanitize_folder(folder: &str) -> Result<PathBuf, (StatusCode, Json<ErrorResponse>)> {
    let trimmed = folder.trim().trim_start_matches('/');
    if trimmed.split('/').any(|part| part == ".." || part.is_empty() && !trimmed.is_empty()) {
        return Err(err(StatusCode::BAD_REQUEST, "folder path must not contain '..' segments"));
    }
    Ok(PathBuf::from(trimmed))
}

async fn create_workload(
    State(state): State<Arc<AppState>>,
    Json(body): Json<YamlBody>,
) -> Result<impl IntoResponse, (StatusCode, Json<ErrorResponse>)> {
    let definition = parse_and_validate(&body.yaml)?;
    if state.loader.get(&definition.id).is_some() {
        return Err(err(StatusCode::CONFLICT, format!("workload '{}' already exists", definition.id)));
    }

    let folder = sanitize_folder(body.folder.as_deref().unwrap_or(""))?;
    let target_dir = state.loader.personal_root().join(&folder);
    std::fs::create_dir_all(&target_dir)
        .map_err(|e| err(StatusCode::INTERNAL_SERVER_ERROR, format!("failed to create folder: {e}")))?;
    let target = target_dir.join(format!("{}.yaml", definition.id));
    std::fs::write(&target, &body.yaml)
        .map_err(|e| err(StatusCode::INTERNAL_SERVER_ERROR, format!("failed to write workload: {e}")))?;

    reload_or_warn(&state);
    info!(id = %definition.id, "workload created");
    Ok((StatusCode::CREATED, Json(serde_json::json!({ "id": definition.id }))))
}

async fn update_workload(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<YamlBody>,
) -> Result<impl IntoResponse, (StatusCode, Json<ErrorResponse>)> {
    let definition = parse_and_validate(&body.yaml)?;
    if definition.id != id {
        return Err(err(StatusCode::BAD_REQUEST, "yaml id does not match the path id"));
    }
    let path = state
        .loader
        .path_of(&id)
        .ok_or_else(|| err(StatusCode::NOT_FOUND, format!("workload '{id}' not found")))?;
    std::fs::write(&path, &body.yaml)
        .map_err(|e| err(StatusCode::INTERNAL_SERVER_ERROR, format!("failed to write workload: {e}")))?;

    reload_or_warn(&state);
    info!(%id, "workload updated");
    Ok(StatusCode::NO_CONTENT)
}

async fn validate_workload(Json(body): Json<YamlBody>) -> Result<impl IntoResponse, (StatusCode, Json<ErrorResponse>)> {
    let definition = parse_and_validate(&body.yaml)?;
    Ok(Json(serde_json::json!({ "valid": true, "id": definition.id })))
}

async fn delete_workload(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, (StatusCode, Json<ErrorResponse>)> {
    let path = state
        .loader
        .path_of(&id)
        .ok_or_else(|| err(StatusCode::NOT_FOUND, format!("workload '{id}' not found")))?;
    std::fs::remove_file(&path)
        .map_err(|e| err(StatusCode::INTERNAL_SERVER_ERROR, format!("failed to delete workload: {e}")))?;
    reload_or_warn(&state);
    info!(%id, "workload deleted");
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
struct MoveWorkloadRequest {
    folder: String,
}

async fn move_workload(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<MoveWorkloadRequest>,
) -> Result<impl IntoResponse, (StatusCode, Json<ErrorResponse>)> {
    let current = state
        .loader
        .path_of(&id)
        .ok_or_else(|| err(StatusCode::NOT_FOUND, format!("workload '{id}' not found")))?;
    let folder = sanitize_folder(&body.folder)?;
    let target_dir = state.loader.personal_root().join(&folder);
    std::fs::create_dir_all(&target_dir)
        .map_err(|e| err(StatusCode::INTERNAL_SERVER_ERROR, format!("failed to create folder: {e}")))?;
    let file_name = current
        .file_name()
        .ok_or_else(|| err(StatusCode::INTERNAL_SERVER_ERROR, "workload path has no file name"))?;
    let target = target_dir.join(file_name);
    std::fs::rename(&current, &target)
        .map_err(|e| err(StatusCode::INTERNAL_SERVER_ERROR, format!("failed to move workload: {e}")))?;
    reload_or_warn(&state);
    Ok(StatusCode::NO_CONTENT)
}

fn reload_or_warn(state: &AppState) {
    if let Err(e) = state.loader.reload() {
        warn!(error = %e, "catalog reload failed after workload mutation");
    }
}

async fn reload_catalog(
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, (StatusCode, Json<ErrorResponse>)> {
    state
        .loader
        .reload()
        .map_err(|e| err(StatusCode::INTERNAL_SERVER_ERROR, format!("reload failed: {e}")))?;
    Ok(Json(serde_json::json!({ "workloads": state.loader.list().len() })))
}

// --- Folders ---

fn walk_folders(root: &FsPath) -> Vec<String> {
    let mut out = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let Ok(entries) = std::fs::read_dir(&dir) else { continue };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                if let Ok(rel) = path.strip_prefix(root) {
                    out.push(rel.to_string_lossy().replace(std::path::MAIN_SEPARATOR, "/"));
                }
                stack.push(path);
            }
        }
    }
    out.sort();
    out
}

async fn list_folders(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(walk_folders(state.loader.personal_root()))
}

#[derive(Debug, Deserialize)]
struct FolderRequest {
    path: String,
}

async fn create_folder(
    State(state): State<Arc<AppState>>,
    Json(body): Json<FolderRequest>,
) -> Result<impl IntoResponse, (StatusCode, Json<ErrorResponse>)> {
    let folder = sanitize_folder(&body.path)?;
    std::fs::create_dir_all(state.loader.personal_root().join(folder))
        .map_err(|e| err(StatusCode::INTERNAL_SERVER_ERROR, format!("failed to create folder: {e}")))?;
    Ok(StatusCode::CREATED)
}

#[derive(Debug, Deserialize)]
struct RenameFolderRequest {
    from: String,
    to: String,
}

async fn rename_folder(
    State(state): State<Arc<AppState>>,
    Json(body): Json<RenameFolderRequest>,
) -> Result<impl IntoResponse, (StatusCode, Json<ErrorResponse>)> {
    let from = sanitize_folder(&body.from)?;
    let to = sanitize_folder(&body.to)?;
    let from_path = state.loader.personal_root().join(&from);
    let to_path = state.loader.personal_root().join(&to);
    if !from_path.is_dir() {
        return Err(err(StatusCode::NOT_FOUND, "folder not found"));
    }
    if let Some(parent) = to_path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| err(StatusCode::INTERNAL_SERVER_ERROR, format!("failed to create parent: {e}")))?;
    }
    std::fs::rename(&from_path, &to_path)
        .map_err(|e| err(StatusCode::INTERNAL_SERVER_ERROR, format!("failed to rename folder: {e}")))?;
    reload_or_warn(&state);
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
struct DeleteFolderRequest {
    path: String,
    #[serde(default)]
    force: bool,
}

async fn delete_folder(
    State(state): State<Arc<AppState>>,
    Json(body): Json<DeleteFolderRequest>,
) -> Result<impl IntoResponse, (StatusCode, Json<ErrorResponse>)> {
    let folder = sanitize_folder(&body.path)?;
    let target = state.loader.personal_root().join(folder);
    if !target.is_dir() {
        return Err(err(StatusCode::NOT_FOUND, "folder not found"));
    }
    let is_empty = std::fs::read_dir(&target)
        .map(|mut entries| entries.next().is_none())
        .unwrap_or(true);
    if !is_empty && !body.force {
        return Err(err(StatusCode::CONFLICT, "folder is not empty; pass force=true"));
    }
    std::fs::remove_dir_all(&target)
        .map_err(|e| err(StatusCode::INTERNAL_SERVER_ERROR, format!("failed to delete folder: {e}")))?;
    reload_or_warn(&state);
    Ok(StatusCode::NO_CONTENT)
}

// --- Runs ---

async fn run_workload(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(params): Json<serde_json::Value>,
) -> Result<impl IntoResponse, (StatusCode, Json<ErrorResponse>)> {
    let instance_id = state.executor.run(&id, params).await.map_err(|e| {
        warn!(workload = %id, error = %e, "failed to start run");
        err(StatusCode::BAD_REQUEST, format!("failed to start run: {e}"))
    })?;
    info!(%instance_id, workload = %id, "run started");
    Ok((
        StatusCode::CREATED,
        Json(serde_json::json!({ "instanceId": instance_id, "status": "running" })),
    ))
}

#[derive(Debug, Deserialize, Default)]
struct ListRunsQuery {
    #[serde(default)]
    status: Option<String>,
}

fn run_dirs(runs_dir: &FsPath) -> Vec<PathBuf> {
    std::fs::read_dir(runs_dir)
        .map(|entries| entries.flatten().map(|e| e.path()).filter(|p| p.is_dir()).collect())
        .unwrap_or_default()
}

async fn list_runs(State(state): State<Arc<AppState>>, Query(query): Query<ListRunsQuery>) -> impl IntoResponse {
    let mut summaries = Vec::new();
    for dir in run_dirs(&state.runs_dir) {
        if let Ok(Some(summary)) = state.manifest.summary(&dir) {
            if let Some(wanted) = &query.status {
                if summary.status.as_str() != wanted {
                    continue;
                }
            }
            summaries.push(summary);
        }
    }
    Json(summaries)
}

async fn get_run(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, (StatusCode, Json<ErrorResponse>)> {
    let dir = state.runs_dir.join(&id);
    let manifest = state
        .manifest
        .read(&dir)
        .map_err(|e| err(StatusCode::INTERNAL_SERVER_ERROR, format!("failed to read run: {e}")))?
        .ok_or_else(|| err(StatusCode::NOT_FOUND, format!("run '{id}' not found")))?;
    Ok(Json(manifest))
}

async fn delete_run(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, (StatusCode, Json<ErrorResponse>)> {
    let dir = state.runs_dir.join(&id);
    if !dir.is_dir() {
        return Err(err(StatusCode::NOT_FOUND, format!("run '{id}' not found")));
    }
    std::fs::remove_dir_all(&dir)
        .map_err(|e| err(StatusCode::INTERNAL_SERVER_ERROR, format!("failed to delete run: {e}")))?;
    Ok(StatusCode::NO_CONTENT)
}

async fn purge_failed_runs(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let mut purged = 0usize;
    for dir in run_dirs(&state.runs_dir) {
        if let Ok(Some(manifest)) = state.manifest.read(&dir) {
            if manifest.status == orc_core::RunStatus::Failed && std::fs::remove_dir_all(&dir).is_ok() {
                purged += 1;
            }
        }
    }
    Json(serde_json::json!({ "purged": purged }))
}

async fn get_run_file(
    State(state): State<Arc<AppState>>,
    Path((id, name)): Path<(String, String)>,
) -> Result<impl IntoResponse, (StatusCode, Json<ErrorResponse>)> {
    if name.contains("..") || name.contains('/') {
        return Err(err(StatusCode::BAD_REQUEST, "invalid file name"));
    }
    let path = state.runs_dir.join(&id).join(&name);
    let bytes = std::fs::read(&path).map_err(|_| err(StatusCode::NOT_FOUND, format!("file '{name}' not found")))?;
    let content_type = match path.extension().and_then(|e| e.to_str()) {
        Some("json") => "application/json",
        Some("md") => "text/markdown",
        _ => "text/plain",
    };
    Ok(([(axum::http::header::CONTENT_TYPE, content_type)], bytes))
}

// --- Schedules ---

async fn list_schedules(State(state): State<Arc<AppState>>) -> Result<impl IntoResponse, (StatusCode, Json<ErrorResponse>)> {
    let records = state
        .schedules
        .list()
        .map_err(|e| err(StatusCode::INTERNAL_SERVER_ERROR, format!("failed to list schedules: {e}")))?;
    Ok(Json(records))
}

async fn upcoming_schedules(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let entries: Vec<UpcomingEntry> = state.scheduler.upcoming(Utc::now());
    Json(entries)
}

#[derive(Debug, Deserialize)]
struct CreateScheduleRequest {
    name: String,
    workload_id: String,
    #[serde(default)]
    cron: Option<String>,
    #[serde(default)]
    interval: Option<String>,
    #[serde(default = "default_true")]
    enabled: bool,
    #[serde(default)]
    params: serde_json::Value,
    #[serde(default)]
    missed_execution_policy: MissedExecutionPolicy,
}

fn default_true() -> bool {
    true
}

async fn create_schedule(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CreateScheduleRequest>,
) -> Result<impl IntoResponse, (StatusCode, Json<ErrorResponse>)> {
    if body.cron.is_none() && body.interval.is_none() {
        return Err(err(StatusCode::BAD_REQUEST, "schedule requires `cron` or `interval`"));
    }
    if state.loader.get(&body.workload_id).is_none() {
        return Err(err(StatusCode::BAD_REQUEST, format!("unknown workload '{}'", body.workload_id)));
    }
    let now = Utc::now();
    let record = ScheduleRecord {
        id: orc_core::Id::new().to_string(),
        name: body.name,
        workload_id: body.workload_id,
        cron: body.cron,
        interval: body.interval,
        enabled: body.enabled,
        params: body.params,
        last_run_at: None,
        missed_execution_policy: body.missed_execution_policy,
        created_at: now,
        updated_at: now,
    };
    let record = state
        .schedules
        .put(record)
        .await
        .map_err(|e| err(StatusCode::INTERNAL_SERVER_ERROR, format!("failed to save schedule: {e}")))?;
    Ok((StatusCode::CREATED, Json(record)))
}

async fn delete_schedule(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, (StatusCode, Json<ErrorResponse>)> {
    state
        .schedules
        .delete(&id)
        .await
        .map_err(|e| err(StatusCode::INTERNAL_SERVER_ERROR, format!("failed to delete schedule: {e}")))?;
    Ok(StatusCode::NO_CONTENT)
}

async fn toggle_schedule(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, (StatusCode, Json<ErrorResponse>)> {
    let mut record = state
        .schedules
        .get(&id)
        .map_err(|e| err(StatusCode::INTERNAL_SERVER_ERROR, format!("failed to read schedule: {e}")))?
        .ok_or_else(|| err(StatusCode::NOT_FOUND, format!("schedule '{id}' not found")))?;
    record.enabled = !record.enabled;
    record.updated_at = Utc::now();
    let record = state
        .schedules
        .put(record)
        .await
        .map_err(|e| err(StatusCode::INTERNAL_SERVER_ERROR, format!("failed to save schedule: {e}")))?;
    Ok(Json(record))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai_backend::MockAiBackend;
    use crate::alert_sink::FakeAlertSink;
    use crate::bus::Bus;
    use crate::orchestrator::Orchestrator;
    use crate::workers::ai::AiWorker;
    use crate::workers::alert::AlertWorker;
    use axum::body::Body;
    use axum::http::Request;
    use tempfile::tempdir;
    use tower::ServiceExt;

    fn write_workload(dir: &FsPath, content: &str) {
        std::fs::write(dir.join("weather.yaml"), content).unwrap();
    }

    async fn test_state() -> (Arc<AppState>, tempfile::TempDir) {
        let root = tempdir().unwrap();
        let workloads_dir = root.path().join("workloads");
        std::fs::create_dir_all(&workloads_dir).unwrap();
        write_workload(
            &workloads_dir,
            "id: weather\nname: Weather\nversion: \"1.0.0\"\nprompt: \"Weather for {{location}}\"\noutput:\n  format: json\n",
        );
        let loader = Arc::new(Loader::new(workloads_dir.clone(), tempdir().unwrap().path().to_path_buf()));
        loader.reload().unwrap();

        let manifest = Arc::new(ManifestStore::new());
        let bus = Bus::new();
        let runs_dir = root.path().join("runs");
        let executor = Arc::new(Executor::new(Arc::clone(&loader), Arc::clone(&manifest), Arc::clone(&bus), runs_dir.clone()));

        let orchestrator = Orchestrator::new(Arc::clone(&bus), Arc::clone(&manifest), Arc::clone(&loader));
        tokio::spawn(Orchestrator::run(orchestrator));

        let ai_worker: Arc<dyn crate::workers::Worker> = Arc::new(AiWorker::new(Arc::new(MockAiBackend)));
        tokio::spawn(crate::dispatch::run_worker_loop(
            Arc::clone(&bus),
            ai_worker,
            Arc::clone(&manifest),
            root.path().to_path_buf(),
        ));
        let alert_worker: Arc<dyn crate::workers::Worker> = Arc::new(AlertWorker::new(Arc::new(FakeAlertSink::default())));
        tokio::spawn(crate::dispatch::run_worker_loop(
            Arc::clone(&bus),
            alert_worker,
            Arc::clone(&manifest),
            root.path().to_path_buf(),
        ));

        let schedules_dir = root.path().join("schedules");
        let schedules = Arc::new(ScheduleStore::new(schedules_dir));
        let scheduler = Arc::new(CronScheduler::new(Arc::clone(&schedules), Arc::clone(&bus)));

        let state = Arc::new(AppState {
            loader,
            manifest,
            executor,
            schedules,
            scheduler,
            runs_dir,
        });
        (state, root)
    }

    #[tokio::test]
    async fn health_check_returns_ok() {
        let (state, _root) = test_state().await;
        let app = create_router(state);
        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn list_workloads_returns_the_seeded_workload() {
        let (state, _root) = test_state().await;
        let app = create_router(state);
        let response = app
            .oneshot(Request::builder().uri("/workloads").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json[0]["id"], "weather");
    }

    #[tokio::test]
    async fn running_an_unknown_workload_is_a_bad_request() {
        let (state, _root) = test_state().await;
        let app = create_router(state);
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/run/ghost")
                    .header("content-type", "application/json")
                    .body(Body::from("{}"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn running_a_prompt_workload_completes_end_to_end() {
        let (state, _root) = test_state().await;
        let app = create_router(Arc::clone(&state));
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/run/weather")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"location": "Mooresville, NC"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        let instance_id = json["instanceId"].as_str().unwrap().to_string();

        // Give the in-process worker/orchestrator loops a moment to finish.
        for _ in 0..50 {
            let dir = state.runs_dir.join(&instance_id);
            if let Ok(Some(manifest)) = state.manifest.read(&dir) {
                if manifest.status.is_terminal() {
                    assert_eq!(manifest.status, orc_core::RunStatus::Completed);
                    return;
                }
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        panic!("run did not complete in time");
    }

    #[tokio::test]
    async fn creating_a_workload_with_a_duplicate_id_is_a_conflict() {
        let (state, _root) = test_state().await;
        let app = create_router(state);
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/workloads")
                    .header("content-type", "application/json")
                    .body(Body::from(serde_json::json!({
                        "yaml": "id: weather\nname: Dup\nversion: \"1.0.0\"\nprompt: hi\noutput:\n  format: text\n"
                    }).to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[test]
    fn folder_of_computes_relative_subdirectory() {
        let root = FsPath::new("/data/workloads");
        let path = FsPath::new("/data/workloads/news/digest.yaml");
        assert_eq!(folder_of(path, root), "news");
    }
}
