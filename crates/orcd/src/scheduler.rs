//! Cron scheduler (Section 4.5).
//!
//! A single durable function ticks once a minute, enumerates schedule
//! records under `<data>/schedules/*.json`, and decides which ones fire
//! this tick by applying each schedule's missed-execution policy to the
//! occurrences it owes since `lastRunAt`. Firing means publishing
//! `workload.trigger`; a separate subscriber (wired in `lib.rs`) invokes
//! the Executor so the REST façade is never on the critical path of a
//! scheduled run.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use cron::Schedule;
use orc_core::events::WorkloadTriggerPayload;
use orc_core::{MissedExecutionPolicy, ScheduleRecord};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{info, warn};

use crate::bus::Bus;

/// Safety cap on missed-occurrence enumeration (Section 4.5 step 2).
const MAX_MISSED_OCCURRENCES: usize = 1000;
/// Tolerance for the "current match" comparison (Section 4.5 step 3).
const CURRENT_MATCH_TOLERANCE_SECS: i64 = 1;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("schedule at {path} is corrupt: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("schedule '{0}' not found")]
    NotFound(String),
}

/// Filesystem-backed CRUD store for schedule records. The scheduler tick
/// only ever mutates `lastRunAt`; the REST façade owns create/replace/
/// delete of the whole record (Section 5.4).
pub struct ScheduleStore {
    dir: PathBuf,
    lock: AsyncMutex<()>,
}

impl ScheduleStore {
    pub fn new(dir: PathBuf) -> Self {
        Self {
            dir,
            lock: AsyncMutex::new(()),
        }
    }

    fn path_for(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    pub fn list(&self) -> Result<Vec<ScheduleRecord>, SchedulerError> {
        if !self.dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        let entries = std::fs::read_dir(&self.dir).map_err(|source| SchedulerError::Io {
            path: self.dir.clone(),
            source,
        })?;
        for entry in entries {
            let entry = entry.map_err(|source| SchedulerError::Io {
                path: self.dir.clone(),
                source,
            })?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            out.push(Self::read_file(&path)?);
        }
        Ok(out)
    }

    pub fn get(&self, id: &str) -> Result<Option<ScheduleRecord>, SchedulerError> {
        let path = self.path_for(id);
        if !path.is_file() {
            return Ok(None);
        }
        Ok(Some(Self::read_file(&path)?))
    }

    fn read_file(path: &Path) -> Result<ScheduleRecord, SchedulerError> {
        let bytes = std::fs::read(path).map_err(|source| SchedulerError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_slice(&bytes).map_err(|source| SchedulerError::Corrupt {
            path: path.to_path_buf(),
            source,
        })
    }

    async fn write_file(&self, record: &ScheduleRecord) -> Result<(), SchedulerError> {
        let _guard = self.lock.lock().await;
        std::fs::create_dir_all(&self.dir).map_err(|source| SchedulerError::Io {
            path: self.dir.clone(),
            source,
        })?;
        let path = self.path_for(&record.id);
        let bytes = serde_json::to_vec_pretty(record).expect("schedule record always serializable");
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, &bytes).map_err(|source| SchedulerError::Io {
            path: tmp.clone(),
            source,
        })?;
        std::fs::rename(&tmp, &path).map_err(|source| SchedulerError::Io { path, source })
    }

    pub async fn put(&self, record: ScheduleRecord) -> Result<ScheduleRecord, SchedulerError> {
        self.write_file(&record).await?;
        Ok(record)
    }

    pub async fn delete(&self, id: &str) -> Result<(), SchedulerError> {
        let _guard = self.lock.lock().await;
        let path = self.path_for(id);
        if path.is_file() {
            std::fs::remove_file(&path).map_err(|source| SchedulerError::Io { path, source })?;
        }
        Ok(())
    }

    pub async fn set_last_run_at(&self, id: &str, at: DateTime<Utc>) -> Result<(), SchedulerError> {
        let _guard = self.lock.lock().await;
        let path = self.path_for(id);
        let Some(mut record) = (if path.is_file() {
            Some(Self::read_file(&path)?)
        } else {
            None
        }) else {
            return Ok(());
        };
        record.last_run_at = Some(at);
        let bytes = serde_json::to_vec_pretty(&record).expect("schedule record always serializable");
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, &bytes).map_err(|source| SchedulerError::Io {
            path: tmp.clone(),
            source,
        })?;
        std::fs::rename(&tmp, &path).map_err(|source| SchedulerError::Io { path, source })
    }
}

/// Outcome of a single tick, returned for logging/testing (Section 4.5
/// step 5).
#[derive(Debug, Default, Clone)]
pub struct TickReport {
    pub triggered: Vec<String>,
    pub missed: HashMap<String, usize>,
}

pub struct CronScheduler {
    store: Arc<ScheduleStore>,
    bus: Arc<Bus>,
}

impl CronScheduler {
    pub fn new(store: Arc<ScheduleStore>, bus: Arc<Bus>) -> Self {
        Self { store, bus }
    }

    /// Runs the per-minute tick loop until the process exits.
    pub async fn run(&self) {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(60));
        loop {
            interval.tick().await;
            let report = self.tick(Utc::now()).await;
            if !report.triggered.is_empty() || !report.missed.is_empty() {
                info!(
                    triggered = report.triggered.len(),
                    missed = report.missed.values().sum::<usize>(),
                    "scheduler tick"
                );
            }
        }
    }

    /// Evaluates every enabled schedule against `now` and fires the ones
    /// whose missed-execution policy says to. Exposed separately from
    /// `run` so tests can drive specific instants.
    pub async fn tick(&self, now: DateTime<Utc>) -> TickReport {
        let mut report = TickReport::default();
        let records = match self.store.list() {
            Ok(records) => records,
            Err(e) => {
                warn!(error = %e, "failed to enumerate schedules this tick");
                return report;
            }
        };

        for record in records {
            if !record.enabled {
                continue;
            }
            let Some(cron_expr) = &record.cron else { continue };
            let schedule = match parse_cron(cron_expr) {
                Ok(s) => s,
                Err(e) => {
                    warn!(schedule = %record.id, error = %e, "invalid cron expression, skipping");
                    continue;
                }
            };

            let last_run_at = record.last_run_at.unwrap_or(now - ChronoDuration::days(1));
            let missed = missed_occurrences(&schedule, last_run_at, now);
            let current = is_current_match(&schedule, now);

            if !missed.is_empty() {
                report.missed.insert(record.id.clone(), missed.len());
            }

            let fire_times = fire_times_for_policy(record.missed_execution_policy, &missed, current, now);
            if fire_times.is_empty() {
                continue;
            }

            for _ in &fire_times {
                self.bus
                    .publish_workload_trigger(WorkloadTriggerPayload {
                        schedule_id: record.id.clone(),
                        schedule_name: record.name.clone(),
                        workload_id: record.workload_id.clone(),
                        params: record.params.clone(),
                    })
                    .await;
            }
            report.triggered.push(record.id.clone());

            if let Err(e) = self.store.set_last_run_at(&record.id, now).await {
                warn!(schedule = %record.id, error = %e, "failed to persist lastRunAt");
            }
        }

        report
    }

    /// Stateless read for the REST façade: next and most-recent-previous
    /// occurrence per enabled cron schedule (Section 4.5 "Upcoming
    /// queries").
    pub fn upcoming(&self, now: DateTime<Utc>) -> Vec<UpcomingEntry> {
        let Ok(records) = self.store.list() else {
            return Vec::new();
        };
        records
            .into_iter()
            .filter(|r| r.enabled)
            .filter_map(|r| {
                let cron_expr = r.cron.as_ref()?;
                let schedule = parse_cron(cron_expr).ok()?;
                let next = schedule.after(&now).next();
                let previous = previous_occurrence(&schedule, now);
                Some(UpcomingEntry {
                    schedule_id: r.id,
                    schedule_name: r.name,
                    next,
                    previous,
                })
            })
            .collect()
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct UpcomingEntry {
    pub schedule_id: String,
    pub schedule_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous: Option<DateTime<Utc>>,
}

fn parse_cron(expr: &str) -> Result<Schedule, cron::error::Error> {
    Schedule::from_str(expr)
}

/// Ordered occurrences strictly after `last_run_at` and strictly before
/// `now`, capped at `MAX_MISSED_OCCURRENCES` regardless of how stale
/// `last_run_at` is.
fn missed_occurrences(schedule: &Schedule, last_run_at: DateTime<Utc>, now: DateTime<Utc>) -> Vec<DateTime<Utc>> {
    schedule
        .after(&last_run_at)
        .take_while(|occ| *occ < now)
        .take(MAX_MISSED_OCCURRENCES)
        .collect()
}

/// A short look-back window is enough to find the most recent occurrence
/// at-or-before `now`; cron granularity here is minutes, so a window a
/// little over a day comfortably covers even a once-daily schedule.
fn previous_occurrence(schedule: &Schedule, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let window_start = now - ChronoDuration::days(2);
    schedule
        .after(&window_start)
        .take_while(|occ| *occ <= now)
        .last()
}

/// True when `now` falls within `CURRENT_MATCH_TOLERANCE_SECS` of the
/// schedule's most recent occurrence at-or-before `now`.
fn is_current_match(schedule: &Schedule, now: DateTime<Utc>) -> bool {
    match previous_occurrence(schedule, now) {
        Some(occ) => (now - occ).num_seconds().abs() <= CURRENT_MATCH_TOLERANCE_SECS,
        None => false,
    }
}

fn fire_times_for_policy(
    policy: MissedExecutionPolicy,
    missed: &[DateTime<Utc>],
    current: bool,
    now: DateTime<Utc>,
) -> Vec<DateTime<Utc>> {
    match policy {
        MissedExecutionPolicy::Catchup => {
            let mut times = missed.to_vec();
            if current {
                times.push(now);
            }
            times
        }
        MissedExecutionPolicy::Last => {
            let mut times = missed.to_vec();
            if current {
                times.push(now);
            }
            times.into_iter().last().into_iter().collect()
        }
        MissedExecutionPolicy::Skip | MissedExecutionPolicy::Log => {
            if current {
                vec![now]
            } else {
                Vec::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn record(id: &str, cron: &str, policy: MissedExecutionPolicy, last_run_at: Option<DateTime<Utc>>) -> ScheduleRecord {
        let now = Utc::now();
        ScheduleRecord {
            id: id.to_string(),
            name: id.to_string(),
            workload_id: "weather".to_string(),
            cron: Some(cron.to_string()),
            interval: None,
            enabled: true,
            params: serde_json::json!({}),
            last_run_at,
            missed_execution_policy: policy,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn store_round_trips_a_record() {
        let dir = tempdir().unwrap();
        let store = ScheduleStore::new(dir.path().to_path_buf());
        let rec = record("s1", "0 * * * * *", MissedExecutionPolicy::Log, None);
        store.put(rec.clone()).await.unwrap();
        let read_back = store.get("s1").unwrap().unwrap();
        assert_eq!(read_back.id, "s1");
        assert_eq!(store.list().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn set_last_run_at_mutates_only_that_field() {
        let dir = tempdir().unwrap();
        let store = ScheduleStore::new(dir.path().to_path_buf());
        let rec = record("s1", "0 * * * * *", MissedExecutionPolicy::Log, None);
        store.put(rec.clone()).await.unwrap();
        let stamp = Utc::now();
        store.set_last_run_at("s1", stamp).await.unwrap();
        let read_back = store.get("s1").unwrap().unwrap();
        assert_eq!(read_back.last_run_at, Some(stamp));
        assert_eq!(read_back.name, "s1");
    }

    #[tokio::test]
    async fn catchup_policy_fires_once_per_missed_occurrence() {
        let dir = tempdir().unwrap();
        let store = Arc::new(ScheduleStore::new(dir.path().to_path_buf()));
        let bus = Bus::new();
        let mut rx = bus.take_workload_trigger_receiver().await;
        let now = Utc::now();
        // Every-minute cron, last run 3 minutes ago: 2 missed occurrences.
        let last_run_at = now - ChronoDuration::minutes(3);
        let rec = record("s1", "0 * * * * *", MissedExecutionPolicy::Catchup, Some(last_run_at));
        store.put(rec).await.unwrap();

        let scheduler = CronScheduler::new(Arc::clone(&store), Arc::clone(&bus));
        let report = scheduler.tick(now).await;
        assert!(report.triggered.contains(&"s1".to_string()));

        let mut received = 0;
        while tokio::time::timeout(std::time::Duration::from_millis(50), rx.recv())
            .await
            .ok()
            .flatten()
            .is_some()
        {
            received += 1;
        }
        assert!(received >= 2);
    }

    #[tokio::test]
    async fn skip_policy_ignores_missed_occurrences() {
        let dir = tempdir().unwrap();
        let store = Arc::new(ScheduleStore::new(dir.path().to_path_buf()));
        let bus = Bus::new();
        let now = Utc::now();
        let last_run_at = now - ChronoDuration::minutes(10);
        let rec = record("s1", "0 0 0 1 1 *", MissedExecutionPolicy::Skip, Some(last_run_at));
        store.put(rec).await.unwrap();

        let scheduler = CronScheduler::new(store, bus);
        let report = scheduler.tick(now).await;
        assert!(!report.triggered.contains(&"s1".to_string()));
    }

    #[test]
    fn missed_occurrences_respects_safety_cap() {
        let schedule = parse_cron("* * * * * *").unwrap();
        let now = Utc::now();
        let last_run_at = now - ChronoDuration::days(5);
        let missed = missed_occurrences(&schedule, last_run_at, now);
        assert!(missed.len() <= MAX_MISSED_OCCURRENCES);
    }
}
