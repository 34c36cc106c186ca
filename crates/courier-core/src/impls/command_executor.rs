//! CommandExecutor - 外部コマンドで work order を処理する executor
//!
//! WorkOrder を JSON で stdin に渡し、stdout の JSON を結果として受け取る。
//! 非 0 終了・timeout・JSON でない出力はすべて ProcessingError。

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::domain::{ProcessingError, WorkOrder};
use crate::ports::TaskExecutor;

#[derive(Debug, Clone)]
pub struct CommandExecutor {
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandExecutor {
    pub fn new(program: impl Into<String>, args: Vec<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args,
            timeout,
        }
    }

    /// Split a command line on whitespace: first word is the program.
    pub fn from_command_line(line: &str, timeout: Duration) -> Option<Self> {
        let mut words = line.split_whitespace().map(str::to_string);
        let program = words.next()?;
        Some(Self::new(program, words.collect(), timeout))
    }

    async fn run(&self, input: Vec<u8>) -> Result<std::process::Output, ProcessingError> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ProcessingError::new(format!("cannot start {}: {e}", self.program)))?;

        // stdin is fed while stdout is drained; a child that echoes as it
        // reads would otherwise block on a full pipe
        let stdin = child.stdin.take();
        let feed = async move {
            let Some(mut stdin) = stdin else {
                return Ok::<(), ProcessingError>(());
            };
            match stdin.write_all(&input).await {
                Ok(()) => Ok(()),
                // child exited without reading; its exit status tells the story
                Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => Ok(()),
                Err(e) => Err(ProcessingError::new(format!(
                    "cannot write work order to executor: {e}"
                ))),
            }
            // drop closes stdin so the child sees EOF
        };

        let (fed, output) = tokio::join!(feed, child.wait_with_output());
        let output =
            output.map_err(|e| ProcessingError::new(format!("executor i/o error: {e}")))?;
        fed?;
        Ok(output)
    }
}

#[async_trait]
impl TaskExecutor for CommandExecutor {
    async fn execute(&self, order: &WorkOrder) -> Result<serde_json::Value, ProcessingError> {
        let input = serde_json::to_vec(order)
            .map_err(|e| ProcessingError::new(format!("cannot encode work order: {e}")))?;

        let output = tokio::time::timeout(self.timeout, self.run(input))
            .await
            .map_err(|_| ProcessingError::new(format!("executor timed out after {:?}", self.timeout)))??;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ProcessingError::new(format!(
                "executor exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        if stdout.trim().is_empty() {
            return Ok(serde_json::Value::Null);
        }
        serde_json::from_str(stdout.trim())
            .map_err(|e| ProcessingError::new(format!("executor output is not JSON: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::work_order::tests::order;

    fn on_path(program: &str) -> bool {
        std::process::Command::new("sh")
            .args(["-c", &format!("command -v {program}")])
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    #[tokio::test]
    async fn cat_echoes_the_order_back() {
        if !on_path("cat") {
            return;
        }
        let exec = CommandExecutor::from_command_line("cat", Duration::from_secs(10)).unwrap();
        let o = order("W1");
        let result = exec.execute(&o).await.unwrap();
        assert_eq!(result["work_id"], "W1");
        assert_eq!(result["target_identifier"], "target-W1");
    }

    #[tokio::test]
    async fn order_larger_than_the_pipe_buffer_round_trips() {
        if !on_path("cat") {
            return;
        }
        let exec = CommandExecutor::from_command_line("cat", Duration::from_secs(10)).unwrap();
        let mut o = order("W1");
        o.processed_subunits = (0..20_000).map(|i| format!("page-{i:05}")).collect();
        let result = exec.execute(&o).await.unwrap();
        assert_eq!(result["processed_subunits"].as_array().unwrap().len(), 20_000);
        assert_eq!(result["processed_subunits"][19_999], "page-19999");
    }

    #[tokio::test]
    async fn non_zero_exit_is_a_processing_error() {
        if !on_path("sh") {
            return;
        }
        let exec = CommandExecutor::new(
            "sh",
            vec!["-c".into(), "echo boom >&2; exit 3".into()],
            Duration::from_secs(10),
        );
        let err = exec.execute(&order("W3")).await.unwrap_err();
        assert!(err.message.contains("boom"), "{}", err.message);
    }

    #[tokio::test]
    async fn missing_program_is_a_processing_error() {
        let exec = CommandExecutor::new("definitely-not-a-real-program-xyz", vec![], Duration::from_secs(1));
        assert!(exec.execute(&order("W1")).await.is_err());
    }

    #[test]
    fn blank_command_line_is_rejected() {
        assert!(CommandExecutor::from_command_line("   ", Duration::from_secs(1)).is_none());
    }
}
