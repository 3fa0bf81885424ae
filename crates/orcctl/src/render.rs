//! Output rendering for orcctl.
//!
//! Formats workload, run, and schedule records for terminal display.

use crate::client::{UpcomingEntry, WorkloadSummary};
use orc_core::{RunManifest, RunStatus, RunSummary, ScheduleRecord, StepStatus};

pub fn print_workload_list(workloads: &[WorkloadSummary]) {
    if workloads.is_empty() {
        println!("No workloads found.");
        return;
    }

    println!("{:<24}  {:<28}  {:<16}  {}", "ID", "NAME", "FOLDER", "STATUS");
    println!("{}", "-".repeat(90));
    for w in workloads {
        let status = if !w.validation_errors.is_empty() {
            "invalid"
        } else if !w.validation_warnings.is_empty() {
            "warnings"
        } else {
            "ok"
        };
        println!(
            "{:<24}  {:<28}  {:<16}  {}",
            truncate(&w.id, 24),
            truncate(&w.name, 28),
            if w.folder.is_empty() { "-" } else { w.folder.as_str() },
            status,
        );
    }
    println!();
    println!("{} workload(s)", workloads.len());
}

pub fn print_run_created(instance_id: &str) {
    println!("Started run: {}", instance_id);
}

pub fn print_run_list(runs: &[RunSummary]) {
    if runs.is_empty() {
        println!("No runs found.");
        return;
    }

    println!("{:<36}  {:<24}  {:<10}  {:<8}  {}", "ID", "WORKLOAD", "STATUS", "DUR(ms)", "PRIMARY OUTPUT");
    println!("{}", "-".repeat(110));
    for run in runs {
        println!(
            "{:<36}  {:<24}  {:<10}  {:<8}  {}",
            run.instance_id,
            truncate(&run.workload_name, 24),
            format_status(run.status),
            run.duration.map(|d| d.to_string()).unwrap_or_else(|| "-".to_string()),
            run.primary_output.as_deref().unwrap_or("-"),
        );
    }
    println!();
    println!("{} run(s)", runs.len());
}

pub fn print_run_details(manifest: &RunManifest) {
    println!("Run: {}", manifest.instance_id);
    println!();
    println!("  Workload:    {} ({})", manifest.workload_name, manifest.workload_id);
    println!("  Status:      {}", format_status(manifest.status));
    println!("  Started:     {}", format_time(&manifest.started_at));
    if let Some(completed_at) = &manifest.completed_at {
        println!("  Completed:   {}", format_time(completed_at));
    }
    if let Some(duration) = manifest.duration {
        println!("  Duration:    {}ms", duration);
    }
    if let Some(error) = &manifest.error {
        println!("  Error:       {}", error);
    }

    if let Some(steps) = &manifest.steps {
        println!();
        println!("  Steps:");
        println!("    {:<20}  {:<10}  {:<10}  {}", "ID", "WORKER", "STATUS", "OUTPUT");
        println!("    {}", "-".repeat(70));
        for step in steps {
            println!(
                "    {:<20}  {:<10}  {:<10}  {}",
                step.id,
                step.worker.as_str(),
                format_step_status(step.status),
                step.output,
            );
        }
    }

    if !manifest.outputs.is_empty() {
        println!();
        println!("  Outputs:");
        for output in &manifest.outputs {
            println!("    {} ({}, {} bytes, step {})", output.file, output.format, output.size, output.step);
        }
    }
}

pub fn print_schedule_list(schedules: &[ScheduleRecord]) {
    if schedules.is_empty() {
        println!("No schedules found.");
        return;
    }

    println!("{:<36}  {:<20}  {:<24}  {:<8}  {}", "ID", "NAME", "WORKLOAD", "ENABLED", "TRIGGER");
    println!("{}", "-".repeat(110));
    for s in schedules {
        let trigger = s.cron.clone().or_else(|| s.interval.clone()).unwrap_or_else(|| "-".to_string());
        println!(
            "{:<36}  {:<20}  {:<24}  {:<8}  {}",
            s.id,
            truncate(&s.name, 20),
            truncate(&s.workload_id, 24),
            s.enabled,
            trigger,
        );
    }
    println!();
    println!("{} schedule(s)", schedules.len());
}

pub fn print_upcoming(entries: &[UpcomingEntry]) {
    if entries.is_empty() {
        println!("No scheduled runs upcoming.");
        return;
    }
    println!("{:<36}  {:<20}  {}", "SCHEDULE ID", "NAME", "NEXT");
    println!("{}", "-".repeat(90));
    for entry in entries {
        let next = entry.next.map(|t| t.to_rfc3339()).unwrap_or_else(|| "-".to_string());
        println!("{:<36}  {:<20}  {}", entry.schedule_id, truncate(&entry.schedule_name, 20), next);
    }
}

fn format_status(status: RunStatus) -> &'static str {
    match status {
        RunStatus::Pending => "PENDING",
        RunStatus::Running => "RUNNING",
        RunStatus::Completed => "COMPLETED",
        RunStatus::Failed => "FAILED",
    }
}

fn format_step_status(status: StepStatus) -> &'static str {
    match status {
        StepStatus::Pending => "PENDING",
        StepStatus::Running => "RUNNING",
        StepStatus::Completed => "COMPLETED",
        StepStatus::Failed => "FAILED",
        StepStatus::Skipped => "SKIPPED",
    }
}

fn format_time(dt: &chrono::DateTime<chrono::Utc>) -> String {
    dt.format("%Y-%m-%d %H:%M:%S").to_string()
}

pub fn truncate(s: &str, max_len: usize) -> String {
    if s.len() <= max_len {
        s.to_string()
    } else {
        format!("{}...", &s[..max_len.saturating_sub(3)])
    }
}
