//! orcctl - CLI client for orcd.
//!
//! Local control-plane client for the workload orchestrator daemon,
//! talking to its REST façade (Section 6.2).

mod client;
mod render;

use clap::{Parser, Subcommand};
use client::{Client, ClientError, CreateScheduleRequest};
use std::path::PathBuf;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

/// CLI client for the orcd workload orchestrator daemon.
#[derive(Parser)]
#[command(name = "orcctl")]
#[command(about = "Control plane for orcd")]
#[command(version)]
struct Cli {
    /// Daemon address (default: http://127.0.0.1:4780)
    #[arg(long, global = true, env = "ORCD_ADDR")]
    addr: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Workload catalog operations
    Workload {
        #[command(subcommand)]
        command: WorkloadCommand,
    },

    /// Folder operations on the personal workload tree
    Folder {
        #[command(subcommand)]
        command: FolderCommand,
    },

    /// Start a run of a workload
    Run {
        /// Workload id
        id: String,

        /// Input parameter as key=value (repeatable); values are parsed as
        /// JSON when possible, otherwise kept as strings.
        #[arg(long = "param", value_parser = parse_param)]
        params: Vec<(String, serde_json::Value)>,
    },

    /// Run manifest operations
    Runs {
        #[command(subcommand)]
        command: RunsCommand,
    },

    /// Cron schedule operations
    Schedule {
        #[command(subcommand)]
        command: ScheduleCommand,
    },

    /// Force the daemon to re-scan the workload catalog
    Reload,
}

#[derive(Subcommand)]
enum WorkloadCommand {
    /// List all known workloads
    List,
    /// Show a single workload's definition and source YAML
    Get { id: String },
    /// Create a workload from a YAML file
    Create {
        /// Path to the workload YAML file
        file: PathBuf,
        /// Destination folder under the personal workload root
        #[arg(long)]
        folder: Option<String>,
    },
    /// Replace an existing workload's YAML
    Update {
        id: String,
        /// Path to the replacement YAML file
        file: PathBuf,
    },
    /// Validate a YAML file without saving it
    Validate {
        /// Path to the workload YAML file
        file: PathBuf,
    },
    /// Delete a workload
    Delete { id: String },
    /// Move a workload to a different folder
    Move { id: String, folder: String },
}

#[derive(Subcommand)]
enum FolderCommand {
    /// List folders under the personal workload root
    List,
    /// Create a folder
    Create { path: String },
    /// Rename a folder
    Rename { from: String, to: String },
    /// Delete a folder
    Delete {
        path: String,
        /// Delete even if the folder is not empty
        #[arg(short, long)]
        force: bool,
    },
}

#[derive(Subcommand)]
enum RunsCommand {
    /// List runs, optionally filtered by status
    List {
        #[arg(long)]
        status: Option<String>,
    },
    /// Show detailed information about a run
    Get { instance_id: String },
    /// Delete a run's directory
    Delete { instance_id: String },
    /// Delete every run whose manifest status is `failed`
    Purge,
    /// Print a run's output file to stdout
    File { instance_id: String, name: String },
}

#[derive(Subcommand)]
enum ScheduleCommand {
    /// List all schedules
    List,
    /// Show the next firing time for every enabled schedule
    Upcoming,
    /// Create a new schedule
    Create {
        name: String,
        workload_id: String,
        #[arg(long)]
        cron: Option<String>,
        #[arg(long)]
        interval: Option<String>,
        #[arg(long, default_value_t = true)]
        enabled: bool,
        /// Policy for occurrences missed while the daemon was down:
        /// catchup, last, skip, or log (default: log)
        #[arg(long, default_value = "log")]
        missed_execution_policy: String,
    },
    /// Delete a schedule
    Delete { id: String },
    /// Flip a schedule's enabled flag
    Toggle { id: String },
}

fn parse_param(s: &str) -> Result<(String, serde_json::Value), String> {
    let (key, value) = s.split_once('=').ok_or_else(|| format!("expected key=value, got '{s}'"))?;
    let parsed = serde_json::from_str(value).unwrap_or_else(|_| serde_json::Value::String(value.to_string()));
    Ok((key.to_string(), parsed))
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let addr = cli.addr.unwrap_or_else(|| "http://127.0.0.1:4780".to_string());
    let client = Client::new(&addr);

    if let Err(e) = client.wait_for_ready().await {
        eprintln!("error: {}", e);
        std::process::exit(1);
    }

    let result = match cli.command {
        Command::Workload { command } => run_workload_command(&client, command).await,
        Command::Folder { command } => run_folder_command(&client, command).await,
        Command::Run { id, params } => run_start(&client, &id, params).await,
        Command::Runs { command } => run_runs_command(&client, command).await,
        Command::Schedule { command } => run_schedule_command(&client, command).await,
        Command::Reload => run_reload(&client).await,
    };

    if let Err(e) = result {
        eprintln!("error: {}", e);
        std::process::exit(1);
    }
}

async fn run_workload_command(client: &Client, command: WorkloadCommand) -> Result<(), ClientError> {
    match command {
        WorkloadCommand::List => {
            let workloads = client.list_workloads().await?;
            render::print_workload_list(&workloads);
        }
        WorkloadCommand::Get { id } => {
            let detail = client.get_workload(&id).await?;
            println!("{}", detail.yaml);
        }
        WorkloadCommand::Create { file, folder } => {
            let yaml = read_file(&file)?;
            let id = client.create_workload(yaml, folder).await?;
            println!("Created workload: {}", id);
        }
        WorkloadCommand::Update { id, file } => {
            let yaml = read_file(&file)?;
            client.update_workload(&id, yaml).await?;
            println!("Updated workload: {}", id);
        }
        WorkloadCommand::Validate { file } => {
            let yaml = read_file(&file)?;
            client.validate_workload(yaml).await?;
            println!("Valid.");
        }
        WorkloadCommand::Delete { id } => {
            client.delete_workload(&id).await?;
            println!("Deleted workload: {}", id);
        }
        WorkloadCommand::Move { id, folder } => {
            client.move_workload(&id, &folder).await?;
            println!("Moved workload {} to '{}'", id, folder);
        }
    }
    Ok(())
}

async fn run_folder_command(client: &Client, command: FolderCommand) -> Result<(), ClientError> {
    match command {
        FolderCommand::List => {
            let folders = client.list_folders().await?;
            if folders.is_empty() {
                println!("No folders.");
            } else {
                for folder in folders {
                    println!("{}", folder);
                }
            }
        }
        FolderCommand::Create { path } => {
            client.create_folder(&path).await?;
            println!("Created folder: {}", path);
        }
        FolderCommand::Rename { from, to } => {
            client.rename_folder(&from, &to).await?;
            println!("Renamed folder '{}' to '{}'", from, to);
        }
        FolderCommand::Delete { path, force } => {
            client.delete_folder(&path, force).await?;
            println!("Deleted folder: {}", path);
        }
    }
    Ok(())
}

async fn run_start(client: &Client, id: &str, params: Vec<(String, serde_json::Value)>) -> Result<(), ClientError> {
    let mut map = serde_json::Map::new();
    for (key, value) in params {
        map.insert(key, value);
    }
    let instance_id = client.run_workload(id, serde_json::Value::Object(map)).await?;
    render::print_run_created(&instance_id);
    Ok(())
}

async fn run_runs_command(client: &Client, command: RunsCommand) -> Result<(), ClientError> {
    match command {
        RunsCommand::List { status } => {
            let runs = client.list_runs(status.as_deref()).await?;
            render::print_run_list(&runs);
        }
        RunsCommand::Get { instance_id } => {
            let manifest = client.get_run(&instance_id).await?;
            render::print_run_details(&manifest);
        }
        RunsCommand::Delete { instance_id } => {
            client.delete_run(&instance_id).await?;
            println!("Deleted run: {}", instance_id);
        }
        RunsCommand::Purge => {
            let purged = client.purge_failed_runs().await?;
            println!("Purged {} failed run(s)", purged);
        }
        RunsCommand::File { instance_id, name } => {
            let bytes = client.get_run_file(&instance_id, &name).await?;
            use std::io::Write;
            std::io::stdout().write_all(&bytes).map_err(|e| ClientError::IoError(e.to_string()))?;
        }
    }
    Ok(())
}

async fn run_schedule_command(client: &Client, command: ScheduleCommand) -> Result<(), ClientError> {
    match command {
        ScheduleCommand::List => {
            let schedules = client.list_schedules().await?;
            render::print_schedule_list(&schedules);
        }
        ScheduleCommand::Upcoming => {
            let entries = client.upcoming_schedules().await?;
            render::print_upcoming(&entries);
        }
        ScheduleCommand::Create { name, workload_id, cron, interval, enabled, missed_execution_policy } => {
            let record = client
                .create_schedule(CreateScheduleRequest {
                    name,
                    workload_id,
                    cron,
                    interval,
                    enabled,
                    params: serde_json::Value::Null,
                    missed_execution_policy,
                })
                .await?;
            println!("Created schedule: {}", record.id);
        }
        ScheduleCommand::Delete { id } => {
            client.delete_schedule(&id).await?;
            println!("Deleted schedule: {}", id);
        }
        ScheduleCommand::Toggle { id } => {
            let record = client.toggle_schedule(&id).await?;
            println!("Schedule {} is now {}", record.id, if record.enabled { "enabled" } else { "disabled" });
        }
    }
    Ok(())
}

async fn run_reload(client: &Client) -> Result<(), ClientError> {
    let count = client.reload().await?;
    println!("Catalog reloaded: {} workload(s)", count);
    Ok(())
}

fn read_file(path: &PathBuf) -> Result<String, ClientError> {
    std::fs::read_to_string(path).map_err(|e| ClientError::IoError(format!("{}: {}", path.display(), e)))
}
