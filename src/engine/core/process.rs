// Subprocess execution with timeout and captured stderr

use std::io::Read;
use std::process::{Command, Stdio};
use std::sync::mpsc::{self, Receiver};
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(25);

/// How long to wait for pipe output once the child is gone. A grandchild that
/// inherited the pipe can keep it open well past that.
const DRAIN_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("Failed to execute {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} exited with {code}: {stderr}")]
    NonZeroExit {
        program: String,
        code: String,
        stderr: String,
    },

    #[error("{program} timed out after {timeout:?}")]
    Timeout { program: String, timeout: Duration },
}

impl ProcessError {
    /// Captured stderr, when the process got far enough to produce any
    pub fn stderr(&self) -> Option<&str> {
        match self {
            ProcessError::NonZeroExit { stderr, .. } => Some(stderr),
            _ => None,
        }
    }
}

/// Output of a successful invocation
#[derive(Debug, Clone, Default)]
pub struct ProcessOutput {
    pub stdout: String,
    pub stderr: String,
    pub elapsed: Duration,
}

/// Format a command for logging (program followed by its arguments)
pub fn format_command(cmd: &Command) -> String {
    std::iter::once(cmd.get_program().to_string_lossy().into_owned())
        .chain(cmd.get_args().map(|a| quote_arg(&a.to_string_lossy())))
        .collect::<Vec<_>>()
        .join(" ")
}

fn quote_arg(arg: &str) -> String {
    if arg.is_empty() || arg.contains(char::is_whitespace) {
        format!("'{}'", arg.replace('\'', "'\\''"))
    } else {
        arg.to_string()
    }
}

fn program_name(cmd: &Command) -> String {
    cmd.get_program().to_string_lossy().into_owned()
}

/// Run a command to completion, killing it after `timeout`
pub fn run_command(cmd: &mut Command, timeout: Duration) -> Result<ProcessOutput, ProcessError> {
    let (output, ()) = run_command_with(cmd, timeout, |_| ())?;
    Ok(output)
}

/// Run a command, calling `on_spawn` with the child pid right after it starts.
///
/// Whatever `on_spawn` returns is handed back alongside the output, so a
/// companion (e.g. a CPU sampler) can be stopped once the child has exited.
/// It is also returned on failure paths through `Drop`.
pub fn run_command_with<S, F>(
    cmd: &mut Command,
    timeout: Duration,
    on_spawn: F,
) -> Result<(ProcessOutput, S), ProcessError>
where
    F: FnOnce(u32) -> S,
{
    let program = program_name(cmd);
    debug!(command = %format_command(cmd), "spawning");

    let started = Instant::now();
    let mut child = cmd
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|source| ProcessError::Spawn {
            program: program.clone(),
            source,
        })?;

    let companion = on_spawn(child.id());

    // Drain both pipes so a chatty child never blocks on a full buffer
    let stdout_reader = child.stdout.take().map(drain);
    let stderr_reader = child.stderr.take().map(drain);

    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break Some(status),
            Ok(None) => {
                if started.elapsed() >= timeout {
                    warn!(program = %program, ?timeout, "killing process after timeout");
                    let _ = child.kill();
                    let _ = child.wait();
                    break None;
                }
                thread::sleep(POLL_INTERVAL);
            }
            Err(source) => {
                let _ = child.kill();
                return Err(ProcessError::Spawn { program, source });
            }
        }
    };

    let drain_deadline = Instant::now() + DRAIN_GRACE;
    let stdout = collect(stdout_reader, drain_deadline);
    let stderr = collect(stderr_reader, drain_deadline);
    let elapsed = started.elapsed();

    let Some(status) = status else {
        return Err(ProcessError::Timeout { program, timeout });
    };

    if !status.success() {
        let code = status
            .code()
            .map(|c| c.to_string())
            .unwrap_or_else(|| "signal".to_string());
        return Err(ProcessError::NonZeroExit {
            program,
            code,
            stderr: stderr.trim().to_string(),
        });
    }

    debug!(program = %program, elapsed_ms = elapsed.as_millis() as u64, "process finished");
    Ok((
        ProcessOutput {
            stdout,
            stderr,
            elapsed,
        },
        companion,
    ))
}

/// Read a pipe to its end on a detached thread
fn drain<R: Read + Send + 'static>(mut pipe: R) -> Receiver<Vec<u8>> {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = pipe.read_to_end(&mut buf);
        let _ = tx.send(buf);
    });
    rx
}

/// Output gathered by a drain thread, or nothing if the pipe is still held
/// open at `deadline`
fn collect(reader: Option<Receiver<Vec<u8>>>, deadline: Instant) -> String {
    reader
        .and_then(|rx| rx.recv_timeout(deadline.saturating_duration_since(Instant::now())).ok())
        .map(|buf| String::from_utf8_lossy(&buf).into_owned())
        .unwrap_or_default()
}
