//! In-process event bus (Section 5.1's implementation note).
//!
//! Satisfies the durable-function contract the core requires — typed
//! publish, at-least-once delivery, per-worker concurrency ceilings — by
//! wrapping a `tokio::sync::mpsc` channel per event kind plus a
//! `tokio::sync::Semaphore` per worker kind. The bus does not depend on
//! an external message broker; §1 treats the broker as an external
//! collaborator and this core satisfies its contract locally.

use orc_core::events::{
    PlanCompletedPayload, PlanCreatedPayload, RunRecoveredPayload, TaskCompletedPayload,
    TaskFailedPayload, TaskReadyPayload, WorkloadTriggerPayload,
};
use orc_core::{Event, EventPayload, WorkerKind};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, Semaphore};
use tokio::time::{sleep, Duration};
use tracing::{error, warn};

const CHANNEL_CAPACITY: usize = 1024;
const PUBLISH_RETRY_BUDGET: u32 = 5;
const PUBLISH_RETRY_BACKOFF: Duration = Duration::from_millis(20);

/// Per-function concurrency ceilings (Section 5.1).
pub fn concurrency_ceiling(worker: WorkerKind) -> usize {
    match worker {
        WorkerKind::Ai => 1,
        WorkerKind::Fetch => 5,
        WorkerKind::Exec => 3,
        WorkerKind::Countdown => 10,
        WorkerKind::Alert => 5,
    }
}

struct Channel<T> {
    tx: mpsc::Sender<T>,
    rx: Mutex<Option<mpsc::Receiver<T>>>,
}

impl<T> Channel<T> {
    fn new() -> Self {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        Self {
            tx,
            rx: Mutex::new(Some(rx)),
        }
    }

    async fn take_receiver(&self) -> mpsc::Receiver<T> {
        self.rx
            .lock()
            .await
            .take()
            .expect("bus receiver taken more than once")
    }

    async fn publish(&self, label: &str, value: T) {
        let mut attempt = 0;
        let mut value = Some(value);
        loop {
            let v = value.take().expect("publish retried without a value");
            match self.tx.try_send(v) {
                Ok(()) => return,
                Err(mpsc::error::TrySendError::Full(v)) => {
                    attempt += 1;
                    if attempt > PUBLISH_RETRY_BUDGET {
                        error!(event = label, "publish retry budget exhausted, dropping event");
                        return;
                    }
                    warn!(event = label, attempt, "bus channel full, retrying publish");
                    value = Some(v);
                    sleep(PUBLISH_RETRY_BACKOFF).await;
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    error!(event = label, "bus channel closed, dropping event");
                    return;
                }
            }
        }
    }
}

/// The event bus. Each topic is an independent channel; workers additionally
/// gate actual execution behind a per-kind semaphore so the channel's
/// capacity and the worker's concurrency ceiling are orthogonal concerns.
pub struct Bus {
    plan_created: Channel<Event>,
    task_ready: HashMap<WorkerKind, Channel<Event>>,
    task_completed: Channel<Event>,
    task_failed: Channel<Event>,
    plan_completed: Channel<Event>,
    workload_trigger: Channel<Event>,
    run_recovered: Channel<Event>,
    semaphores: HashMap<WorkerKind, Arc<Semaphore>>,
}

impl Bus {
    pub fn new() -> Arc<Self> {
        let mut task_ready = HashMap::new();
        let mut semaphores = HashMap::new();
        for worker in [
            WorkerKind::Ai,
            WorkerKind::Fetch,
            WorkerKind::Exec,
            WorkerKind::Countdown,
            WorkerKind::Alert,
        ] {
            task_ready.insert(worker, Channel::new());
            semaphores.insert(worker, Arc::new(Semaphore::new(concurrency_ceiling(worker))));
        }
        Arc::new(Self {
            plan_created: Channel::new(),
            task_ready,
            task_completed: Channel::new(),
            task_failed: Channel::new(),
            plan_completed: Channel::new(),
            workload_trigger: Channel::new(),
            run_recovered: Channel::new(),
            semaphores,
        })
    }

    pub fn semaphore(&self, worker: WorkerKind) -> Arc<Semaphore> {
        Arc::clone(&self.semaphores[&worker])
    }

    pub async fn publish_plan_created(&self, payload: PlanCreatedPayload) {
        self.plan_created
            .publish("plan.created", Event::new(EventPayload::PlanCreated(payload)))
            .await;
    }

    pub async fn publish_task_ready(&self, payload: TaskReadyPayload) {
        let worker = payload.worker;
        self.task_ready[&worker]
            .publish("task.ready", Event::new(EventPayload::TaskReady(payload)))
            .await;
    }

    pub async fn publish_task_completed(&self, payload: TaskCompletedPayload) {
        self.task_completed
            .publish("task.completed", Event::new(EventPayload::TaskCompleted(payload)))
            .await;
    }

    pub async fn publish_task_failed(&self, payload: TaskFailedPayload) {
        self.task_failed
            .publish("task.failed", Event::new(EventPayload::TaskFailed(payload)))
            .await;
    }

    pub async fn publish_plan_completed(&self, payload: PlanCompletedPayload) {
        self.plan_completed
            .publish("plan.completed", Event::new(EventPayload::PlanCompleted(payload)))
            .await;
    }

    pub async fn publish_workload_trigger(&self, payload: WorkloadTriggerPayload) {
        self.workload_trigger
            .publish(
                "workload.trigger",
                Event::new(EventPayload::WorkloadTrigger(payload)),
            )
            .await;
    }

    pub async fn publish_run_recovered(&self, payload: RunRecoveredPayload) {
        self.run_recovered
            .publish("run.recovered", Event::new(EventPayload::RunRecovered(payload)))
            .await;
    }

    pub async fn take_plan_created_receiver(&self) -> mpsc::Receiver<Event> {
        self.plan_created.take_receiver().await
    }

    pub async fn take_task_ready_receiver(&self, worker: WorkerKind) -> mpsc::Receiver<Event> {
        self.task_ready[&worker].take_receiver().await
    }

    pub async fn take_task_completed_receiver(&self) -> mpsc::Receiver<Event> {
        self.task_completed.take_receiver().await
    }

    pub async fn take_task_failed_receiver(&self) -> mpsc::Receiver<Event> {
        self.task_failed.take_receiver().await
    }

    pub async fn take_workload_trigger_receiver(&self) -> mpsc::Receiver<Event> {
        self.workload_trigger.take_receiver().await
    }

    pub async fn take_run_recovered_receiver(&self) -> mpsc::Receiver<Event> {
        self.run_recovered.take_receiver().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn concurrency_ceilings_match_contract() {
        assert_eq!(concurrency_ceiling(WorkerKind::Ai), 1);
        assert_eq!(concurrency_ceiling(WorkerKind::Fetch), 5);
        assert_eq!(concurrency_ceiling(WorkerKind::Exec), 3);
        assert_eq!(concurrency_ceiling(WorkerKind::Countdown), 10);
        assert_eq!(concurrency_ceiling(WorkerKind::Alert), 5);
    }

    #[tokio::test]
    async fn publish_then_receive_task_ready() {
        let bus = Bus::new();
        let mut rx = bus.take_task_ready_receiver(WorkerKind::Fetch).await;
        bus.publish_task_ready(TaskReadyPayload {
            plan_id: orc_core::Id::new(),
            task_id: "fetch-news".to_string(),
            worker: WorkerKind::Fetch,
            config: serde_json::json!({}),
            input: vec![],
            output: "raw-news.json".to_string(),
            run_path: "/tmp/x".to_string(),
            primary: false,
        })
        .await;
        let event = rx.recv().await.expect("event delivered");
        assert_eq!(event.event_type(), orc_core::EventType::TaskReady);
    }
}
