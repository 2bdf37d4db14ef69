//! Subprocess helpers shared by the command-line adapters.
//!
//! Children are spawned with `kill_on_drop`, so dropping the future (for
//! example when a stage budget expires) terminates the external command.

use std::process::Stdio;

use anyhow::{Context, Result};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

/// Captured result of a finished command
#[derive(Debug, Clone)]
pub struct ProcessOutput {
    /// Exit code (-1 when terminated by a signal)
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.code == 0
    }
}

/// Run a command to completion and capture its output, whatever the exit code
///
/// `stdin` is written to the child and then closed; it is never logged.
pub async fn capture(command: &mut Command, stdin: Option<&[u8]>, what: &str) -> Result<ProcessOutput> {
    let std_command = command.as_std();
    debug!(
        program = ?std_command.get_program(),
        args = ?std_command.get_args().collect::<Vec<_>>(),
        "Spawning {}",
        what
    );

    let mut child = command
        .stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .with_context(|| format!("Failed to spawn {}", what))?;

    // Stdin is fed concurrently with draining stdout/stderr
    let pipe = child.stdin.take();
    let feed = async move {
        if let (Some(input), Some(mut pipe)) = (stdin, pipe) {
            pipe.write_all(input)
                .await
                .with_context(|| format!("Failed to write to {} stdin", what))?;
            // Drop stdin to signal EOF
        }
        Ok::<_, anyhow::Error>(())
    };
    let wait = async move {
        child
            .wait_with_output()
            .await
            .with_context(|| format!("Failed to wait for {}", what))
    };
    let ((), output) = tokio::try_join!(feed, wait)?;

    Ok(ProcessOutput {
        code: output.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

/// Run a command and fail on a non-zero exit, returning stdout
pub async fn run(command: &mut Command, stdin: Option<&[u8]>, what: &str) -> Result<String> {
    let output = capture(command, stdin, what).await?;

    if !output.success() {
        anyhow::bail!(
            "{} failed with exit code {}: {}",
            what,
            output.code,
            failure_message(&output)
        );
    }

    Ok(output.stdout)
}

/// Most useful diagnostic from a failed command (stderr, else stdout tail)
pub fn failure_message(output: &ProcessOutput) -> String {
    let stderr = output.stderr.trim();
    if !stderr.is_empty() {
        return stderr.to_string();
    }

    let lines: Vec<&str> = output.stdout.trim().lines().collect();
    let start = lines.len().saturating_sub(20);
    lines[start..].join("\n")
}
