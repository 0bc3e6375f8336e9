//! External tool invocation with enforced timeouts.
//!
//! Collaborators shell out to downloaders, transcoders and model runners.
//! Every call here is bounded: when the deadline passes the child is killed
//! and the call fails transiently, so the retry policy decides what happens
//! next.

use futures::{stream, Stream};
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, BufReader, Lines};
use tokio::process::{Child, ChildStdout, Command};
use tracing::debug;

use crate::errors::StageFailure;
use crate::utils::tail;

/// Characters of stderr quoted in a failure message.
const STDERR_TAIL: usize = 2000;

/// Output of a finished command.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    /// Exit status.
    pub status: ExitStatus,
    /// Captured standard output (lossy UTF-8).
    pub stdout: String,
    /// Captured standard error (lossy UTF-8).
    pub stderr: String,
    /// Wall time.
    pub duration: Duration,
}

impl CommandOutput {
    /// Turns a non-zero exit into a transient failure quoting stderr.
    pub fn into_success(self) -> Result<Self, StageFailure> {
        if self.status.success() {
            return Ok(self);
        }
        let code = self
            .status
            .code()
            .map_or_else(|| "signal".to_string(), |c| c.to_string());
        Err(StageFailure::transient(format!(
            "exit status {code}: {}",
            tail(self.stderr.trim_end(), STDERR_TAIL)
        )))
    }
}

fn program_name(command: &Command) -> String {
    command.as_std().get_program().to_string_lossy().into_owned()
}

fn spawn_failure(program: &str, err: &std::io::Error) -> StageFailure {
    if err.kind() == std::io::ErrorKind::NotFound {
        StageFailure::permanent(format!("{program}: command not found"))
    } else {
        StageFailure::transient(format!("{program}: failed to start: {err}"))
    }
}

/// Runs `command` to completion, capturing stdout and stderr.
///
/// Spawn failures for a missing program are permanent; a timeout is
/// transient and kills the child. The exit status is returned as-is; use
/// [`CommandOutput::into_success`] to treat a non-zero exit as a failure.
pub async fn run_command(mut command: Command, timeout: Duration) -> Result<CommandOutput, StageFailure> {
    let program = program_name(&command);
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let start = Instant::now();
    let child = command.spawn().map_err(|e| spawn_failure(&program, &e))?;

    // Dropping the wait future on timeout drops the child, which kills it.
    match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(Ok(output)) => {
            let duration = start.elapsed();
            debug!(program = %program, status = %output.status, elapsed_ms = duration.as_millis() as u64, "command finished");
            Ok(CommandOutput {
                status: output.status,
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                duration,
            })
        }
        Ok(Err(e)) => Err(StageFailure::from(e)),
        Err(_) => Err(StageFailure::transient(format!(
            "{program}: timed out after {}s",
            timeout.as_secs_f64()
        ))),
    }
}

enum LineState {
    Pending(Command),
    Running {
        child: Child,
        lines: Lines<BufReader<ChildStdout>>,
    },
}

/// Streams the stdout lines of `command` as they are produced.
///
/// Used as a manifest source: the consumer may stop early, in which case the
/// child is killed when the stream is dropped. `timeout` bounds the whole
/// run. A non-zero exit after the last line is reported as a transient
/// failure.
pub fn stream_lines(mut command: Command, timeout: Duration) -> impl Stream<Item = Result<String, StageFailure>> {
    let program = program_name(&command);
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true);
    let deadline = tokio::time::Instant::now() + timeout;

    stream::unfold(Some(LineState::Pending(command)), move |state| {
        let program = program.clone();
        async move {
            let mut running = match state? {
                LineState::Pending(mut command) => {
                    let mut child = match command.spawn() {
                        Ok(child) => child,
                        Err(e) => return Some((Err(spawn_failure(&program, &e)), None)),
                    };
                    let Some(stdout) = child.stdout.take() else {
                        return Some((Err(StageFailure::permanent(format!("{program}: stdout not captured"))), None));
                    };
                    LineState::Running {
                        child,
                        lines: BufReader::new(stdout).lines(),
                    }
                }
                running @ LineState::Running { .. } => running,
            };

            let LineState::Running { child, lines } = &mut running else {
                return None;
            };
            match tokio::time::timeout_at(deadline, lines.next_line()).await {
                Ok(Ok(Some(line))) => Some((Ok(line), Some(running))),
                Ok(Ok(None)) => match child.wait().await {
                    Ok(status) if status.success() => None,
                    Ok(status) => Some((
                        Err(StageFailure::transient(format!("{program}: exited with {status}"))),
                        None,
                    )),
                    Err(e) => Some((Err(StageFailure::from(e)), None)),
                },
                Ok(Err(e)) => Some((Err(StageFailure::from(e)), None)),
                Err(_) => {
                    let _ = child.kill().await;
                    Some((
                        Err(StageFailure::transient(format!(
                            "{program}: timed out after {}s",
                            timeout.as_secs_f64()
                        ))),
                        None,
                    ))
                }
            }
        }
    })
}
