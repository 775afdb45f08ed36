//! Code execution tool.
//!
//! The code is piped to a configured interpreter on stdin. Two limits apply
//! independently: a wall-clock timeout and a combined stdout/stderr cap.
//! Either one kills the process; the report says which fired. Hitting a
//! limit is not a tool error, so partial output still reaches the model.

use async_trait::async_trait;
use canopy_core::error::ToolError;
use canopy_core::tool::{CodeSettings, Tool, ToolResult};
use serde::{Deserialize, Serialize};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::time::Instant;
use tracing::{debug, warn};

pub const CODE_EXEC: &str = "code_exec";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecReport {
    pub stdout: String,
    pub stderr: String,
    /// `None` when the process was killed.
    pub exit_code: Option<i32>,
    pub duration_ms: u64,
    pub truncated: bool,
    pub timed_out: bool,
}

impl ExecReport {
    pub fn succeeded(&self) -> bool {
        self.exit_code == Some(0) && !self.timed_out
    }

    fn render(&self) -> String {
        let mut out = String::new();
        match self.exit_code {
            Some(code) => out.push_str(&format!("exit code: {code}\n")),
            None => out.push_str("exit code: none (killed)\n"),
        }
        if self.timed_out {
            out.push_str(&format!("[timed out after {} ms]\n", self.duration_ms));
        }
        if self.truncated {
            out.push_str("[output truncated]\n");
        }
        if !self.stdout.is_empty() {
            out.push_str("stdout:\n");
            out.push_str(&self.stdout);
            if !self.stdout.ends_with('\n') {
                out.push('\n');
            }
        }
        if !self.stderr.is_empty() {
            out.push_str("stderr:\n");
            out.push_str(&self.stderr);
        }
        out.trim_end().to_string()
    }
}

pub struct CodeExecTool {
    settings: CodeSettings,
}

impl CodeExecTool {
    pub fn new(settings: CodeSettings) -> Self {
        Self { settings }
    }

    pub async fn run(&self, code: &str) -> Result<ExecReport, ToolError> {
        let mut parts = self.settings.command.split_whitespace();
        let program = parts
            .next()
            .ok_or_else(|| ToolError::NotConfigured("code execution command is empty".into()))?;

        let started = Instant::now();
        let deadline = started + Duration::from_millis(self.settings.timeout_ms.max(1));

        let mut child = Command::new(program)
            .args(parts)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ToolError::ExecutionFailed {
                tool_name: CODE_EXEC.into(),
                reason: format!("failed to start '{program}': {e}"),
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            let code = code.to_string();
            // A separate task so a process that never reads stdin cannot
            // stall the output readers.
            tokio::spawn(async move {
                if let Err(e) = stdin.write_all(code.as_bytes()).await {
                    debug!(error = %e, "Interpreter closed stdin early");
                }
            });
        }

        let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
            return Err(ToolError::ExecutionFailed {
                tool_name: CODE_EXEC.into(),
                reason: "process pipes unavailable".into(),
            });
        };

        let capture = read_capped(stdout, stderr, self.settings.max_output_chars, deadline).await;
        let mut timed_out = capture.timed_out;
        let truncated = capture.truncated;

        let exit_code = if timed_out || truncated {
            kill(&mut child).await;
            None
        } else {
            match tokio::time::timeout_at(deadline, child.wait()).await {
                Ok(Ok(status)) => status.code(),
                Ok(Err(e)) => {
                    return Err(ToolError::ExecutionFailed {
                        tool_name: CODE_EXEC.into(),
                        reason: e.to_string(),
                    });
                }
                Err(_) => {
                    timed_out = true;
                    kill(&mut child).await;
                    None
                }
            }
        };

        let report = ExecReport {
            stdout: capture.stdout,
            stderr: capture.stderr,
            exit_code,
            duration_ms: started.elapsed().as_millis() as u64,
            truncated,
            timed_out,
        };
        debug!(
            exit_code = ?report.exit_code,
            timed_out,
            truncated,
            duration_ms = report.duration_ms,
            "Code execution finished"
        );
        Ok(report)
    }
}

async fn kill(child: &mut tokio::process::Child) {
    if let Err(e) = child.kill().await {
        warn!(error = %e, "Failed to kill interpreter process");
    }
}

struct Capture {
    stdout: String,
    stderr: String,
    timed_out: bool,
    truncated: bool,
}

/// Read both pipes until they close, the deadline passes, or together they
/// exceed `cap` characters. On overflow the output is cut to exactly `cap`
/// characters, stdout first.
async fn read_capped<O, E>(mut stdout: O, mut stderr: E, cap: usize, deadline: Instant) -> Capture
where
    O: AsyncRead + Unpin,
    E: AsyncRead + Unpin,
{
    let mut out = Vec::new();
    let mut err = Vec::new();
    let mut out_buf = [0u8; 4096];
    let mut err_buf = [0u8; 4096];
    let (mut out_open, mut err_open) = (true, true);
    let mut timed_out = false;
    let mut truncated = false;

    let sleep = tokio::time::sleep_until(deadline);
    tokio::pin!(sleep);

    while out_open || err_open {
        tokio::select! {
            _ = &mut sleep => {
                timed_out = true;
                break;
            }
            read = stdout.read(&mut out_buf), if out_open => match read {
                Ok(0) | Err(_) => out_open = false,
                Ok(n) => out.extend_from_slice(&out_buf[..n]),
            },
            read = stderr.read(&mut err_buf), if err_open => match read {
                Ok(0) | Err(_) => err_open = false,
                Ok(n) => err.extend_from_slice(&err_buf[..n]),
            },
        }
        // Bytes bound chars from above, so only count chars once bytes overflow.
        if out.len() + err.len() > cap && char_len(&out) + char_len(&err) > cap {
            truncated = true;
            break;
        }
    }

    let mut stdout = String::from_utf8_lossy(&out).into_owned();
    let mut stderr = String::from_utf8_lossy(&err).into_owned();
    if truncated {
        stdout = take_chars(&stdout, cap);
        let left = cap.saturating_sub(stdout.chars().count());
        stderr = take_chars(&stderr, left);
    }
    Capture {
        stdout,
        stderr,
        timed_out,
        truncated,
    }
}

fn char_len(bytes: &[u8]) -> usize {
    String::from_utf8_lossy(bytes).chars().count()
}

fn take_chars(s: &str, n: usize) -> String {
    s.chars().take(n).collect()
}

#[async_trait]
impl Tool for CodeExecTool {
    fn name(&self) -> &str {
        CODE_EXEC
    }

    fn description(&self) -> &str {
        "Execute a code snippet and return its stdout, stderr and exit code. Long-running or very chatty programs are stopped."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "code": {
                    "type": "string",
                    "description": "Source code to execute"
                }
            },
            "required": ["code"]
        })
    }

    async fn execute(&self, call_id: &str, arguments: serde_json::Value) -> Result<ToolResult, ToolError> {
        let code = arguments["code"]
            .as_str()
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| ToolError::InvalidArguments("Missing 'code' argument".into()))?;

        let report = self.run(code).await?;
        let data = serde_json::to_value(&report).map_err(|e| ToolError::ExecutionFailed {
            tool_name: CODE_EXEC.into(),
            reason: e.to_string(),
        })?;
        Ok(ToolResult {
            call_id: call_id.to_string(),
            success: report.succeeded(),
            output: report.render(),
            data: Some(data),
        })
    }
}
