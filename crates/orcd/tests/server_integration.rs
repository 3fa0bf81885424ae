//! Integration tests for the REST façade (Section 6.2, Section 8).
//!
//! Exercises the router end-to-end with `tower::ServiceExt::oneshot`
//! against a real (tempdir-backed) loader, manifest store, bus, and
//! in-process worker loops — no HTTP socket is bound.

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::response::Response;
use http_body_util::BodyExt;
use orcd::ai_backend::MockAiBackend;
use orcd::alert_sink::FakeAlertSink;
use orcd::bus::Bus;
use orcd::dispatch::run_worker_loop;
use orcd::executor::Executor;
use orcd::loader::Loader;
use orcd::manifest::ManifestStore;
use orcd::orchestrator::Orchestrator;
use orcd::scheduler::{CronScheduler, ScheduleStore};
use orcd::server::{create_router, AppState};
use orcd::workers::ai::AiWorker;
use orcd::workers::alert::AlertWorker;
use orcd::workers::exec::ExecWorker;
use orcd::workers::fetch::FetchWorker;
use orcd::workers::Worker;
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;
use tower::ServiceExt;

async fn test_app() -> (axum::Router, Arc<AppState>, TempDir) {
    let root = TempDir::new().unwrap();
    let workloads_dir = root.path().join("workloads");
    std::fs::create_dir_all(&workloads_dir).unwrap();
    std::fs::write(
        workloads_dir.join("two-step.yaml"),
        r#"
id: two-step
name: Two Step
version: "1.0.0"
steps:
  - id: fetch
    name: Fetch
    worker: exec
    output: raw.json
    dependsOn: []
    config:
      command: "echo '{\"n\": 1}'"
  - id: summarize
    name: Summarize
    worker: ai
    output: digest.md
    dependsOn: [fetch]
    input: [raw.json]
    config:
      prompt: "Summarize {{n}}"
      output_format: markdown
"#,
    )
    .unwrap();

    let loader = Arc::new(Loader::new(workloads_dir, TempDir::new().unwrap().path().to_path_buf()));
    loader.reload().unwrap();

    let manifest = Arc::new(ManifestStore::new());
    let bus = Bus::new();
    let runs_dir = root.path().join("runs");
    let executor = Arc::new(Executor::new(
        Arc::clone(&loader),
        Arc::clone(&manifest),
        Arc::clone(&bus),
        runs_dir.clone(),
    ));

    let orchestrator = Orchestrator::new(Arc::clone(&bus), Arc::clone(&manifest), Arc::clone(&loader));
    tokio::spawn(Orchestrator::run(orchestrator));

    let workers: Vec<Arc<dyn Worker>> = vec![
        Arc::new(AiWorker::new(Arc::new(MockAiBackend))),
        Arc::new(AlertWorker::new(Arc::new(FakeAlertSink::default()))),
        Arc::new(ExecWorker::new("/bin/sh".to_string(), "*".to_string())),
        Arc::new(FetchWorker::new("orcd-test/0.1", std::time::Duration::from_secs(5))),
    ];
    for worker in workers {
        tokio::spawn(run_worker_loop(
            Arc::clone(&bus),
            worker,
            Arc::clone(&manifest),
            root.path().to_path_buf(),
        ));
    }

    let schedules = Arc::new(ScheduleStore::new(root.path().join("schedules")));
    let scheduler = Arc::new(CronScheduler::new(Arc::clone(&schedules), Arc::clone(&bus)));

    let state = Arc::new(AppState {
        loader,
        manifest,
        executor,
        schedules,
        scheduler,
        runs_dir,
    });
    let router = create_router(Arc::clone(&state));
    (router, state, root)
}

async fn body_to_json(response: Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

async fn wait_for_terminal(state: &AppState, instance_id: &str) -> orc_core::RunManifest {
    let dir = state.runs_dir.join(instance_id);
    for _ in 0..100 {
        if let Ok(Some(manifest)) = state.manifest.read(&dir) {
            if manifest.status.is_terminal() {
                return manifest;
            }
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
    panic!("run {instance_id} did not reach a terminal state in time");
}

#[tokio::test]
async fn two_step_workflow_runs_to_completion_over_http() {
    let (app, state, _root) = test_app().await;

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/run/two-step")
                .header("content-type", "application/json")
                .body(Body::from("{}"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let json = body_to_json(response).await;
    let instance_id = json["instanceId"].as_str().unwrap().to_string();

    let manifest = wait_for_terminal(&state, &instance_id).await;
    assert_eq!(manifest.status, orc_core::RunStatus::Completed);
    assert_eq!(manifest.primary_output.as_deref(), Some("digest.md"));
    assert!(Path::new(&state.runs_dir.join(&instance_id).join("digest.md")).is_file());

    let get_response = app
        .oneshot(
            Request::builder()
                .uri(format!("/runs/{instance_id}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(get_response.status(), StatusCode::OK);
}

#[tokio::test]
async fn creating_a_cyclic_workload_is_rejected() {
    let (app, _state, _root) = test_app().await;
    let yaml = r#"
id: cyclic
name: Cyclic
version: "1.0.0"
steps:
  - id: a
    name: A
    worker: exec
    output: a.json
    dependsOn: [b]
    config: { command: "true" }
  - id: b
    name: B
    worker: exec
    output: b.json
    dependsOn: [a]
    config: { command: "true" }
"#;
    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/workloads")
                .header("content-type", "application/json")
                .body(Body::from(serde_json::json!({ "yaml": yaml }).to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn schedule_crud_and_toggle() {
    let (app, _state, _root) = test_app().await;

    let create = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/schedules")
                .header("content-type", "application/json")
                .body(Body::from(
                    serde_json::json!({
                        "name": "nightly",
                        "workload_id": "two-step",
                        "cron": "0 0 2 * * *",
                    })
                    .to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(create.status(), StatusCode::CREATED);
    let created = body_to_json(create).await;
    let id = created["id"].as_str().unwrap().to_string();
    assert_eq!(created["enabled"], true);

    let toggled = app
        .clone()
        .oneshot(
            Request::builder()
                .method("PATCH")
                .uri(format!("/schedules/{id}/toggle"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(toggled.status(), StatusCode::OK);
    let toggled_json = body_to_json(toggled).await;
    assert_eq!(toggled_json["enabled"], false);

    let list = app
        .clone()
        .oneshot(Request::builder().uri("/schedules").body(Body::empty()).unwrap())
        .await
        .unwrap();
    let list_json = body_to_json(list).await;
    assert_eq!(list_json.as_array().unwrap().len(), 1);

    let deleted = app
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri(format!("/schedules/{id}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(deleted.status(), StatusCode::NO_CONTENT);
}

#[tokio::test]
async fn reload_endpoint_picks_up_new_workload_file() {
    let (app, state, root) = test_app().await;
    std::fs::write(
        root.path().join("workloads").join("extra.yaml"),
        "id: extra\nname: Extra\nversion: \"1.0.0\"\nprompt: hi\noutput:\n  format: text\n",
    )
    .unwrap();
    assert!(state.loader.get("extra").is_none());

    let response = app
        .oneshot(Request::builder().method("POST").uri("/reload").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(state.loader.get("extra").is_some());
}
