//! COUNTDOWN worker (Section 4.3.3).
//!
//! The sleep itself is the durable primitive: before suspending, the
//! worker checkpoints its target wake time into the manifest
//! ([`ManifestStore::set_sleep_checkpoint`]) so a restart mid-sleep
//! recomputes the remaining wait from `sleep_until` rather than starting
//! the full duration over.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use orc_core::WorkerKind;
use serde::Deserialize;
use serde_json::json;

use crate::workers::{Worker, WorkerContext, WorkerError, WorkerSuccess};

#[derive(Deserialize)]
struct CountdownConfig {
    #[serde(default)]
    duration: Option<String>,
    #[serde(default)]
    until: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

pub struct CountdownWorker;

#[async_trait]
impl Worker for CountdownWorker {
    fn kind(&self) -> WorkerKind {
        WorkerKind::Countdown
    }

    async fn execute(&self, ctx: &WorkerContext) -> Result<WorkerSuccess, WorkerError> {
        let config: CountdownConfig = serde_json::from_value(ctx.config.clone())
            .map_err(|e| WorkerError::permanent(format!("invalid countdown config: {e}")))?;

        let (target, mode, label) = resolve_target(&config)?;

        ctx.manifest
            .set_sleep_checkpoint(&ctx.run_path, &ctx.task_id, target)
            .await
            .map_err(|e| WorkerError::transient(e.to_string()))?;

        let started_at = Utc::now();
        let remaining = target - started_at;
        if remaining > chrono::Duration::zero() {
            let std_remaining = remaining
                .to_std()
                .unwrap_or(std::time::Duration::from_secs(0));
            tokio::time::sleep(std_remaining).await;
        }
        let completed_at = Utc::now();
        let waited_ms = (completed_at - started_at).num_milliseconds().max(0);

        Ok(WorkerSuccess::json(json!({
            "success": true,
            "startedAt": started_at.to_rfc3339(),
            "completedAt": completed_at.to_rfc3339(),
            "waitedMs": waited_ms,
            "waitedHuman": humanize_millis(waited_ms),
            "mode": mode,
            "target": label,
            "message": config.message,
        })))
    }
}

fn resolve_target(config: &CountdownConfig) -> Result<(DateTime<Utc>, &'static str, String), WorkerError> {
    if let Some(until) = &config.until {
        let target = DateTime::parse_from_rfc3339(until)
            .map_err(|e| WorkerError::permanent(format!("invalid `until` timestamp: {e}")))?
            .with_timezone(&Utc);
        return Ok((target, "until", until.clone()));
    }
    if let Some(duration) = &config.duration {
        let parsed = parse_duration(duration)
            .ok_or_else(|| WorkerError::permanent(format!("invalid `duration`: {duration}")))?;
        let target = Utc::now()
            + chrono::Duration::from_std(parsed)
                .map_err(|e| WorkerError::permanent(e.to_string()))?;
        return Ok((target, "duration", duration.clone()));
    }
    Err(WorkerError::permanent(
        "countdown requires one of `duration` or `until`",
    ))
}

/// Parses a `"1h30m15s"`-style duration: any combination of `d`, `h`, `m`,
/// `s` components in that order, each optional but at least one required.
fn parse_duration(text: &str) -> Option<std::time::Duration> {
    let mut remaining = text.trim();
    if remaining.is_empty() {
        return None;
    }
    let mut total_secs: u64 = 0;
    let mut matched_any = false;
    for unit in ['d', 'h', 'm', 's'] {
        let Some(end) = remaining.find(unit) else {
            continue;
        };
        let (number, rest) = remaining.split_at(end);
        let value: u64 = number.parse().ok()?;
        let multiplier = match unit {
            'd' => 86_400,
            'h' => 3_600,
            'm' => 60,
            's' => 1,
            _ => unreachable!(),
        };
        total_secs += value * multiplier;
        remaining = &rest[1..];
        matched_any = true;
    }
    if !matched_any || !remaining.is_empty() {
        return None;
    }
    Some(std::time::Duration::from_secs(total_secs))
}

fn humanize_millis(ms: i64) -> String {
    let total_secs = ms / 1000;
    let days = total_secs / 86_400;
    let hours = (total_secs % 86_400) / 3_600;
    let minutes = (total_secs % 3_600) / 60;
    let seconds = total_secs % 60;
    let mut parts = Vec::new();
    if days > 0 {
        parts.push(format!("{days}d"));
    }
    if hours > 0 {
        parts.push(format!("{hours}h"));
    }
    if minutes > 0 {
        parts.push(format!("{minutes}m"));
    }
    if seconds > 0 || parts.is_empty() {
        parts.push(format!("{seconds}s"));
    }
    parts.join(" ")
}
