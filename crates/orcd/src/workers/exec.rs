//! EXEC worker (Section 4.3.2).

use async_trait::async_trait;
use orc_core::WorkerKind;
use regex::Regex;
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout;

use crate::workers::{Worker, WorkerContext, WorkerError, WorkerSuccess};

pub struct ExecWorker {
    default_shell: String,
    /// Filesystem root outside of which `cwd` may not point; `"*"`
    /// disables the check (Section 6.3 `paths.allowedWritePath`,
    /// Section 7 "write-sandbox violation").
    allowed_write_path: String,
}

impl ExecWorker {
    pub fn new(default_shell: String, allowed_write_path: String) -> Self {
        Self {
            default_shell,
            allowed_write_path,
        }
    }

    fn check_sandbox(&self, cwd: &str) -> Result<(), WorkerError> {
        if self.allowed_write_path == "*" {
            return Ok(());
        }
        let root = std::path::Path::new(&self.allowed_write_path);
        let root = std::fs::canonicalize(root).unwrap_or_else(|_| root.to_path_buf());
        let target = std::path::Path::new(cwd);
        let target = std::fs::canonicalize(target).unwrap_or_else(|_| target.to_path_buf());
        if target.starts_with(&root) {
            Ok(())
        } else {
            Err(WorkerError::permanent(format!(
                "write-sandbox violation: `cwd` {cwd} is outside {}",
                self.allowed_write_path
            )))
        }
    }
}

#[derive(Deserialize)]
struct ExecConfig {
    command: String,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    cwd: Option<String>,
    #[serde(default)]
    env: HashMap<String, String>,
    #[serde(default = "default_timeout")]
    timeout: u64,
    #[serde(default)]
    filter: Option<String>,
}

fn default_timeout() -> u64 {
    30_000
}

#[async_trait]
impl Worker for ExecWorker {
    fn kind(&self) -> WorkerKind {
        WorkerKind::Exec
    }

    async fn execute(&self, ctx: &WorkerContext) -> Result<WorkerSuccess, WorkerError> {
        let config: ExecConfig = serde_json::from_value(ctx.config.clone())
            .map_err(|e| WorkerError::permanent(format!("invalid exec config: {e}")))?;
        if config.command.trim().is_empty() {
            return Err(WorkerError::permanent("exec requires `command`"));
        }

        let filter = match &config.filter {
            Some(pattern) => Some(
                Regex::new(pattern)
                    .map_err(|e| WorkerError::permanent(format!("invalid filter regex: {e}")))?,
            ),
            None => None,
        };

        if let Some(cwd) = &config.cwd {
            self.check_sandbox(cwd)?;
        }

        let mut cmd = Command::new(&self.default_shell);
        cmd.arg("-c");
        let full_command = if config.args.is_empty() {
            config.command.clone()
        } else {
            format!("{} {}", config.command, config.args.join(" "))
        };
        cmd.arg(&full_command);
        if let Some(cwd) = &config.cwd {
            cmd.current_dir(cwd);
        }
        for (k, v) in &config.env {
            cmd.env(k, v);
        }
        cmd.current_dir_if_unset(&ctx.run_path);
        cmd.kill_on_drop(true);

        let started = std::time::Instant::now();
        let run = timeout(Duration::from_millis(config.timeout), cmd.output()).await;

        let output = match run {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(WorkerError::transient(format!("failed to spawn command: {e}")));
            }
            Err(_) => {
                return Err(WorkerError::transient(format!(
                    "command timed out after {}ms",
                    config.timeout
                )));
            }
        };

        let duration = started.elapsed().as_millis() as u64;
        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        let exit_code = output.status.code().unwrap_or(-1);
        let success = output.status.success();

        let (stdout, filtered) = match (&filter, success) {
            (Some(re), true) => {
                let filtered_lines: Vec<&str> = stdout.lines().filter(|l| re.is_match(l)).collect();
                (filtered_lines.join("\n"), Some(true))
            }
            _ => (stdout, None),
        };

        Ok(WorkerSuccess::json(json!({
            "success": success,
            "exitCode": exit_code,
            "stdout": stdout,
            "stderr": stderr,
            "command": full_command,
            "duration": duration,
            "filtered": filtered,
        })))
    }
}

/// `tokio::process::Command` has no "current dir if unset" helper; this
/// extension keeps the worker's steps read relative to the run directory
/// by default without overriding an explicit `cwd`.
trait CurrentDirIfUnset {
    fn current_dir_if_unset(&mut self, path: &std::path::Path) -> &mut Self;
}

impl CurrentDirIfUnset for Command {
    fn current_dir_if_unset(&mut self, path: &std::path::Path) -> &mut Self {
        if self.as_std().get_current_dir().is_none() {
            self.current_dir(path);
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::ManifestStore;
    use orc_core::Id;
    use std::sync::Arc;
    use tempfile::tempdir;

    fn context(run_dir: &tempfile::TempDir, config: serde_json::Value) -> WorkerContext {
        WorkerContext {
            plan_id: Id::new(),
            task_id: "run-it".to_string(),
            run_path: run_dir.path().to_path_buf(),
            inputs: HashMap::new(),
            config,
            data_dir: run_dir.path().to_path_buf(),
            manifest: Arc::new(ManifestStore::new()),
        }
    }

    #[tokio::test]
    async fn echoes_stdout_on_success() {
        let dir = tempdir().unwrap();
        let worker = ExecWorker::new("/bin/sh".to_string(), "*".to_string());
        let ctx = context(&dir, serde_json::json!({"command": "echo hello"}));
        let success = worker.execute(&ctx).await.unwrap();
        match success.body {
            crate::workers::WorkerBody::Json(v) => {
                assert_eq!(v["success"], true);
                assert_eq!(v["stdout"].as_str().unwrap().trim(), "hello");
            }
            _ => panic!("expected json body"),
        }
    }

    #[tokio::test]
    async fn nonzero_exit_is_reported_without_worker_error() {
        let dir = tempdir().unwrap();
        let worker = ExecWorker::new("/bin/sh".to_string(), "*".to_string());
        let ctx = context(&dir, serde_json::json!({"command": "exit 3"}));
        let success = worker.execute(&ctx).await.unwrap();
        match success.body {
            crate::workers::WorkerBody::Json(v) => {
                assert_eq!(v["success"], false);
                assert_eq!(v["exitCode"], 3);
            }
            _ => panic!("expected json body"),
        }
    }

    #[tokio::test]
    async fn filter_reduces_stdout_to_matching_lines() {
        let dir = tempdir().unwrap();
        let worker = ExecWorker::new("/bin/sh".to_string(), "*".to_string());
        let ctx = context(
            &dir,
            serde_json::json!({"command": "printf 'a\\nb\\nc\\n'", "filter": "b"}),
        );
        let success = worker.execute(&ctx).await.unwrap();
        match success.body {
            crate::workers::WorkerBody::Json(v) => {
                assert_eq!(v["stdout"], "b");
                assert_eq!(v["filtered"], true);
            }
            _ => panic!("expected json body"),
        }
    }

    #[tokio::test]
    async fn missing_command_is_a_permanent_error() {
        let dir = tempdir().unwrap();
        let worker = ExecWorker::new("/bin/sh".to_string(), "*".to_string());
        let ctx = context(&dir, serde_json::json!({"command": ""}));
        let err = worker.execute(&ctx).await.unwrap_err();
        assert!(err.permanent);
    }

    #[tokio::test]
    async fn cwd_outside_the_allowed_write_path_is_a_permanent_error() {
        let dir = tempdir().unwrap();
        let sandbox = tempdir().unwrap();
        let worker = ExecWorker::new(
            "/bin/sh".to_string(),
            sandbox.path().to_string_lossy().to_string(),
        );
        let ctx = context(
            &dir,
            serde_json::json!({"command": "echo hi", "cwd": dir.path().to_string_lossy()}),
        );
        let err = worker.execute(&ctx).await.unwrap_err();
        assert!(err.permanent);
        assert!(err.message.contains("write-sandbox violation"));
    }

    #[tokio::test]
    async fn cwd_inside_the_allowed_write_path_is_permitted() {
        let sandbox = tempdir().unwrap();
        let worker = ExecWorker::new(
            "/bin/sh".to_string(),
            sandbox.path().to_string_lossy().to_string(),
        );
        let ctx = context(
            &sandbox,
            serde_json::json!({"command": "echo hi", "cwd": sandbox.path().to_string_lossy()}),
        );
        let success = worker.execute(&ctx).await.unwrap();
        match success.body {
            crate::workers::WorkerBody::Json(v) => assert_eq!(v["success"], true),
            _ => panic!("expected json body"),
        }
    }
}
