//! orcd - workload orchestrator daemon.
//!
//! Wires the loader, manifest store, event bus, executor, orchestrator,
//! per-worker dispatch loops, cron scheduler, and REST façade into one
//! running process. See `orc_core` for the shared types and `main.rs`
//! for CLI/process wiring.

pub mod ai_backend;
pub mod alert_sink;
pub mod bus;
pub mod dispatch;
pub mod executor;
pub mod loader;
pub mod manifest;
pub mod orchestrator;
pub mod scheduler;
pub mod server;
pub mod workers;

use std::path::PathBuf;
use std::sync::Arc;

use orc_core::events::WorkloadTriggerPayload;
use orc_core::{Config, EventPayload};
use tracing::{info, warn};

use ai_backend::{AiBackend, HttpAiBackend, MockAiBackend};
use alert_sink::DesktopAlertSink;
use bus::Bus;
use executor::Executor;
use loader::Loader;
use manifest::ManifestStore;
use orchestrator::Orchestrator;
use scheduler::{CronScheduler, ScheduleStore};
use server::AppState;
use workers::ai::AiWorker;
use workers::alert::AlertWorker;
use workers::countdown::CountdownWorker;
use workers::exec::ExecWorker;
use workers::fetch::FetchWorker;
use workers::Worker;

/// Environment variable carrying the AI backend's HTTP endpoint. Not
/// part of the layered `Config` surface (Section 6.3) because it names
/// an external collaborator's address rather than a tunable of this
/// daemon's own behaviour.
const AI_ENDPOINT_ENV: &str = "ORCD_AI_ENDPOINT";
const DEFAULT_AI_ENDPOINT: &str = "http://127.0.0.1:4790/complete";

/// Everything the daemon needs to start: the two filesystem roots and
/// the listen port, layered over `Config::load` by the CLI (Section 2.1).
pub struct DaemonConfig {
    pub config: Config,
    pub data_dir: PathBuf,
    pub workloads_dir: PathBuf,
    pub examples_dir: PathBuf,
}

/// The assembled daemon: one loader, one manifest store, one bus, and
/// the handler tasks that drain it, plus the cron scheduler and the
/// REST façade.
pub struct Daemon {
    config: DaemonConfig,
    bus: Arc<Bus>,
    loader: Arc<Loader>,
    manifest: Arc<ManifestStore>,
    executor: Arc<Executor>,
    orchestrator: Arc<Orchestrator>,
    schedules: Arc<ScheduleStore>,
    scheduler: Arc<CronScheduler>,
}

impl Daemon {
    pub fn new(config: DaemonConfig) -> eyre::Result<Self> {
        std::fs::create_dir_all(&config.data_dir)?;
        std::fs::create_dir_all(config.data_dir.join("runs"))?;
        std::fs::create_dir_all(config.data_dir.join("schedules"))?;
        std::fs::create_dir_all(config.data_dir.join("alerts"))?;
        std::fs::create_dir_all(&config.workloads_dir)?;

        let loader = Arc::new(Loader::new(config.workloads_dir.clone(), config.examples_dir.clone()));
        loader.reload()?;

        let manifest = Arc::new(ManifestStore::new());
        let bus = Bus::new();
        let runs_dir = config.data_dir.join("runs");
        let executor = Arc::new(Executor::new(
            Arc::clone(&loader),
            Arc::clone(&manifest),
            Arc::clone(&bus),
            runs_dir,
        ));
        let orchestrator = Orchestrator::new(Arc::clone(&bus), Arc::clone(&manifest), Arc::clone(&loader));

        let schedules = Arc::new(ScheduleStore::new(config.data_dir.join("schedules")));
        let scheduler = Arc::new(CronScheduler::new(Arc::clone(&schedules), Arc::clone(&bus)));

        Ok(Self {
            config,
            bus,
            loader,
            manifest,
            executor,
            orchestrator,
            schedules,
            scheduler,
        })
    }

    /// Runs every background task (worker loops, orchestrator, scheduler,
    /// trigger handler, REST façade) until one of them exits or the
    /// caller drops the future (graceful shutdown is the caller's
    /// `tokio::select!` against this future, per `main.rs`).
    pub async fn run(&self) -> eyre::Result<()> {
        let ai_backend: Arc<dyn AiBackend> = if self.config.config.ai.use_mock {
            Arc::new(MockAiBackend)
        } else {
            let endpoint = std::env::var(AI_ENDPOINT_ENV).unwrap_or_else(|_| DEFAULT_AI_ENDPOINT.to_string());
            Arc::new(HttpAiBackend::new(endpoint, self.config.config.ai.default_model.clone()))
        };

        let workers: Vec<Arc<dyn Worker>> = vec![
            Arc::new(AiWorker::new(Arc::clone(&ai_backend))),
            Arc::new(FetchWorker::new(
                &self.config.config.workers.fetch.user_agent,
                std::time::Duration::from_millis(self.config.config.workers.fetch.timeout),
            )),
            Arc::new(ExecWorker::new(
                self.config.config.workers.exec.shell.clone(),
                self.config.config.paths.allowed_write_path.clone(),
            )),
            Arc::new(CountdownWorker),
            Arc::new(AlertWorker::new(Arc::new(DesktopAlertSink))),
        ];

        let mut handles = Vec::new();
        for worker in workers {
            let bus = Arc::clone(&self.bus);
            let manifest = Arc::clone(&self.manifest);
            let data_dir = self.config.data_dir.clone();
            handles.push(tokio::spawn(dispatch::run_worker_loop(bus, worker, manifest, data_dir)));
        }

        handles.push(tokio::spawn(Orchestrator::run(Arc::clone(&self.orchestrator))));
        handles.push(tokio::spawn(run_trigger_handler(Arc::clone(&self.bus), Arc::clone(&self.executor))));
        handles.push(tokio::spawn({
            let scheduler = Arc::clone(&self.scheduler);
            async move { scheduler.run().await }
        }));

        let state = Arc::new(AppState {
            loader: Arc::clone(&self.loader),
            manifest: Arc::clone(&self.manifest),
            executor: Arc::clone(&self.executor),
            schedules: Arc::clone(&self.schedules),
            scheduler: Arc::clone(&self.scheduler),
            runs_dir: self.config.data_dir.join("runs"),
        });
        server::start_server(state, self.config.config.server.port).await?;
        Ok(())
    }

    pub async fn shutdown(&self) {
        info!("shutting down");
    }
}

/// Subscribes to `workload.trigger` and invokes the Executor directly,
/// so scheduled runs never depend on the REST façade being reachable
/// (Section 4.5).
async fn run_trigger_handler(bus: Arc<Bus>, executor: Arc<Executor>) {
    let mut rx = bus.take_workload_trigger_receiver().await;
    while let Some(event) = rx.recv().await {
        let EventPayload::WorkloadTrigger(payload) = event.payload else {
            continue;
        };
        let WorkloadTriggerPayload {
            schedule_id,
            workload_id,
            params,
            ..
        } = payload;
        match executor.run(&workload_id, params).await {
            Ok(instance_id) => info!(%schedule_id, %workload_id, %instance_id, "scheduled run started"),
            Err(e) => warn!(%schedule_id, %workload_id, error = %e, "scheduled run failed to start"),
        }
    }
}
