//! Generic shell command handler.
//!
//! Runs `args.cmd` once through the platform shell with stdin closed,
//! enforces `args.timeout` (seconds) and reports the captured output.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::info;

use crate::coordinator::{Task, TaskUpdate};
use crate::error::TaskError;
use crate::handlers::{Flow, HandlerKind, TaskHandler, TaskReporter};

/// Maximum output size before truncation (64KB).
const MAX_OUTPUT_SIZE: usize = 64 * 1024;

/// Default command timeout.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

pub struct CommandHandler {
    task: Task,
    reporter: TaskReporter,
}

impl CommandHandler {
    pub fn new(task: Task, reporter: TaskReporter) -> Self {
        Self { task, reporter }
    }

    fn timeout(&self) -> Result<Duration, TaskError> {
        match self.task.args.get("timeout") {
            None | Some(serde_json::Value::Null) => Ok(DEFAULT_TIMEOUT),
            Some(value) => value
                .as_u64()
                .or_else(|| value.as_str().and_then(|s| s.trim().parse().ok()))
                .map(Duration::from_secs)
                .ok_or_else(|| TaskError::InvalidArgument {
                    task_id: self.task.id.clone(),
                    name: "timeout".to_string(),
                    reason: format!("expected seconds, got {value}"),
                }),
        }
    }
}

#[async_trait]
impl TaskHandler for CommandHandler {
    fn kind(&self) -> HandlerKind {
        HandlerKind::Command
    }

    fn task(&self) -> &Task {
        &self.task
    }

    async fn process(&mut self, _count: u32) -> Result<Flow, TaskError> {
        let cmd = self.task.require_arg("cmd")?;
        let timeout = self.timeout()?;

        info!(task_id = %self.task.id, cmd = %truncate_for_log(&cmd), "Running command");
        let (output, exit_code) = execute_direct(&cmd, timeout).await?;

        let mut update = TaskUpdate::new()
            .with("output", output)
            .with("exit_code", exit_code);
        if exit_code != 0 {
            update = update.error(format!("command exited with status {exit_code}"));
        }
        self.reporter.report(update.done()).await?;
        Ok(Flow::Stop)
    }
}

/// Execute a command, capturing stdout and stderr.
async fn execute_direct(cmd: &str, timeout: Duration) -> Result<(String, i32), TaskError> {
    let mut command = if cfg!(target_os = "windows") {
        let mut c = Command::new("cmd");
        c.args(["/C", cmd]);
        c
    } else {
        let mut c = Command::new("sh");
        c.args(["-c", cmd]);
        c
    };

    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = command.spawn()?;
    let mut stdout_pipe = child.stdout.take();
    let mut stderr_pipe = child.stderr.take();

    let result = tokio::time::timeout(timeout, async {
        // both pipes are drained concurrently with wait()
        let read_out = async {
            let mut buf = Vec::new();
            if let Some(out) = stdout_pipe.as_mut() {
                out.read_to_end(&mut buf).await?;
            }
            Ok::<_, std::io::Error>(buf)
        };
        let read_err = async {
            let mut buf = Vec::new();
            if let Some(err) = stderr_pipe.as_mut() {
                err.read_to_end(&mut buf).await?;
            }
            Ok::<_, std::io::Error>(buf)
        };
        let (stdout, stderr, status) = tokio::try_join!(read_out, read_err, child.wait())?;

        let stdout = String::from_utf8_lossy(&stdout).to_string();
        let stderr = String::from_utf8_lossy(&stderr).to_string();
        let output = if stderr.is_empty() {
            stdout
        } else if stdout.is_empty() {
            stderr
        } else {
            format!("{}\n\n--- stderr ---\n{}", stdout, stderr)
        };

        Ok::<_, std::io::Error>((output, status.code().unwrap_or(-1)))
    })
    .await;

    match result {
        Ok(Ok((output, code))) => Ok((truncate_output(&output), code)),
        Ok(Err(e)) => Err(TaskError::Io(e)),
        Err(_) => {
            let _ = child.kill().await;
            Err(TaskError::Timeout(timeout))
        }
    }
}

/// Truncate output to fit within limits (UTF-8 safe).
fn truncate_output(s: &str) -> String {
    if s.len() <= MAX_OUTPUT_SIZE {
        s.to_string()
    } else {
        let half = MAX_OUTPUT_SIZE / 2;
        let head_end = floor_char_boundary(s, half);
        let tail_start = floor_char_boundary(s, s.len() - half);
        format!(
            "{}\n\n... [truncated {} bytes] ...\n\n{}",
            &s[..head_end],
            s.len() - MAX_OUTPUT_SIZE,
            &s[tail_start..]
        )
    }
}

/// Find the largest byte index <= `i` that is a valid char boundary.
fn floor_char_boundary(s: &str, i: usize) -> usize {
    if i >= s.len() {
        return s.len();
    }
    let mut pos = i;
    while pos > 0 && !s.is_char_boundary(pos) {
        pos -= 1;
    }
    pos
}

fn truncate_for_log(s: &str) -> String {
    if s.chars().count() <= 100 {
        s.to_string()
    } else {
        format!("{}...", s.chars().take(100).collect::<String>())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WorkerConfig;
    use crate::coordinator::{JsonMap, MemoryRecordClient};
    use crate::handlers::HandlerDeps;
    use crate::transfer::MemoryStore;
    use serde_json::json;
    use std::sync::Arc;

    fn make(args: serde_json::Value) -> (CommandHandler, Arc<MemoryRecordClient>) {
        let records = Arc::new(MemoryRecordClient::new());
        let deps = HandlerDeps::new(
            records.clone(),
            Arc::new(MemoryStore::new("h")),
            WorkerConfig::default(),
        );
        let args: JsonMap = args.as_object().cloned().unwrap();
        let task = Task::new("c1", "command", args);
        (CommandHandler::new(task, deps.reporter("c1")), records)
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn echo_reports_output_and_done() {
        let (mut handler, records) = make(json!({"cmd": "echo hello"}));
        assert_eq!(handler.process(1).await.unwrap(), Flow::Stop);

        let update = &records.updates_for("c1")[0];
        assert!(update.is_done());
        assert!(update.get("output").unwrap().as_str().unwrap().contains("hello"));
        assert_eq!(update.get("exit_code").unwrap().as_i64(), Some(0));
        assert!(update.error_message().is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn non_zero_exit_is_an_error() {
        let (mut handler, records) = make(json!({"cmd": "echo oops >&2; exit 3"}));
        handler.process(1).await.unwrap();

        let update = &records.updates_for("c1")[0];
        assert_eq!(update.get("exit_code").unwrap().as_i64(), Some(3));
        assert!(update.get("output").unwrap().as_str().unwrap().contains("oops"));
        assert!(update.error_message().unwrap().contains("status 3"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn command_timeout() {
        let (mut handler, _) = make(json!({"cmd": "sleep 10", "timeout": 1}));
        let result = handler.process(1).await;
        assert!(matches!(result, Err(TaskError::Timeout(_))));
    }

    #[tokio::test]
    async fn missing_cmd_is_task_error() {
        let (mut handler, _) = make(json!({}));
        let result = handler.process(1).await;
        assert!(matches!(result, Err(TaskError::MissingArgument { .. })));
    }

    #[test]
    fn invalid_timeout_is_rejected() {
        let (handler, _) = make(json!({"cmd": "true", "timeout": "soon"}));
        assert!(matches!(
            handler.timeout(),
            Err(TaskError::InvalidArgument { .. })
        ));
        let (handler, _) = make(json!({"cmd": "true", "timeout": "5"}));
        assert_eq!(handler.timeout().unwrap(), Duration::from_secs(5));
    }

    #[test]
    fn truncate_output_long() {
        let s = "x".repeat(MAX_OUTPUT_SIZE + 1000);
        let result = truncate_output(&s);
        assert!(result.len() <= MAX_OUTPUT_SIZE + 100);
        assert!(result.contains("[truncated"));
        assert_eq!(truncate_output("short"), "short");
    }

    #[test]
    fn floor_char_boundary_multibyte() {
        let s = "café";
        assert_eq!(floor_char_boundary(s, 5), 5);
        assert_eq!(floor_char_boundary(s, 4), 3);
        assert_eq!(floor_char_boundary(s, 3), 3);
    }
}
