// Run context: toolchain, analysis settings and the command log sink

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::process::{ProcessError, ProcessOutput, format_command, run_command_with};
use super::types::{CommandLogEntry, CommandStatus};

/// Executables used by a run. Built once from configuration and passed down.
#[derive(Debug, Clone, PartialEq)]
pub struct Toolchain {
    pub ffmpeg: PathBuf,
    pub ffprobe: PathBuf,
    pub x264: PathBuf,
    pub x265: PathBuf,
    pub vvenc: PathBuf,
    pub timeout: Duration,
}

impl Default for Toolchain {
    fn default() -> Self {
        Self {
            ffmpeg: PathBuf::from("ffmpeg"),
            ffprobe: PathBuf::from("ffprobe"),
            x264: PathBuf::from("x264"),
            x265: PathBuf::from("x265"),
            vvenc: PathBuf::from("vvencapp"),
            timeout: Duration::from_secs(600),
        }
    }
}

impl Toolchain {
    /// Resolve ffmpeg and ffprobe inside `dir`
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            ffmpeg: dir.join("ffmpeg"),
            ffprobe: dir.join("ffprobe"),
            ..Self::default()
        }
    }

    pub fn ffmpeg(&self) -> Command {
        Command::new(&self.ffmpeg)
    }

    pub fn ffprobe(&self) -> Command {
        Command::new(&self.ffprobe)
    }
}

/// Knobs that shape how a run computes metrics and samples encoders
#[derive(Debug, Clone, PartialEq)]
pub struct AnalysisSettings {
    pub parallel_metrics: bool,
    pub vmaf_threads: u32,
    pub cpu_sample_interval: Duration,
    pub strict: bool,
}

impl Default for AnalysisSettings {
    fn default() -> Self {
        Self {
            parallel_metrics: true,
            vmaf_threads: 8,
            cpu_sample_interval: Duration::from_millis(100),
            strict: false,
        }
    }
}

/// Receiver of command log entries.
///
/// `append` is called before a command starts (status pending) and returns
/// the entry id; `update` moves that entry forward.
pub trait CommandSink: Send + Sync {
    fn append(&self, kind: &str, command: &str, source: Option<&str>) -> String;
    fn update(&self, id: &str, status: CommandStatus, error: Option<&str>);
}

/// Sink that only emits tracing events
#[derive(Debug, Default)]
pub struct TracingSink;

impl CommandSink for TracingSink {
    fn append(&self, kind: &str, command: &str, source: Option<&str>) -> String {
        let id = Uuid::new_v4().to_string();
        debug!(%id, kind, source, command, "command queued");
        id
    }

    fn update(&self, id: &str, status: CommandStatus, error: Option<&str>) {
        match status {
            CommandStatus::Failed => warn!(id, error, "command failed"),
            other => debug!(id, status = ?other, "command status"),
        }
    }
}

/// Sink that keeps every entry in memory
#[derive(Debug, Default)]
pub struct MemorySink {
    entries: Mutex<Vec<CommandLogEntry>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<CommandLogEntry> {
        self.entries
            .lock()
            .map(|e| e.clone())
            .unwrap_or_default()
    }
}

impl CommandSink for MemorySink {
    fn append(&self, kind: &str, command: &str, source: Option<&str>) -> String {
        let id = Uuid::new_v4().to_string();
        if let Ok(mut entries) = self.entries.lock() {
            entries.push(CommandLogEntry::new(id.clone(), kind, command, source));
        }
        id
    }

    fn update(&self, id: &str, status: CommandStatus, error: Option<&str>) {
        if let Ok(mut entries) = self.entries.lock() {
            if let Some(entry) = entries.iter_mut().find(|e| e.id == id) {
                entry.advance(status, error);
            }
        }
    }
}

/// Everything a component needs to run external tools, passed by reference
/// through the call chain.
#[derive(Clone)]
pub struct RunContext {
    pub toolchain: Toolchain,
    pub settings: AnalysisSettings,
    sink: Arc<dyn CommandSink>,
}

impl std::fmt::Debug for RunContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunContext")
            .field("toolchain", &self.toolchain)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl RunContext {
    pub fn new(toolchain: Toolchain, settings: AnalysisSettings, sink: Arc<dyn CommandSink>) -> Self {
        Self {
            toolchain,
            settings,
            sink,
        }
    }

    /// Context that logs commands through tracing only
    pub fn with_tracing(toolchain: Toolchain, settings: AnalysisSettings) -> Self {
        Self::new(toolchain, settings, Arc::new(TracingSink))
    }

    pub fn sink(&self) -> &dyn CommandSink {
        self.sink.as_ref()
    }

    /// Run `cmd` and record it in the command log
    pub fn execute(
        &self,
        kind: &str,
        source: Option<&str>,
        cmd: &mut Command,
    ) -> Result<ProcessOutput, ProcessError> {
        self.execute_with(kind, source, cmd, |_| ()).map(|(out, ())| out)
    }

    /// Like [`execute`](Self::execute), calling `on_spawn` with the child pid
    pub fn execute_with<S, F>(
        &self,
        kind: &str,
        source: Option<&str>,
        cmd: &mut Command,
        on_spawn: F,
    ) -> Result<(ProcessOutput, S), ProcessError>
    where
        F: FnOnce(u32) -> S,
    {
        let command = format_command(cmd);
        let id = self.sink.append(kind, &command, source);
        info!(kind, source, "running {}", command);

        let result = run_command_with(cmd, self.toolchain.timeout, |pid| {
            self.sink.update(&id, CommandStatus::Running, None);
            on_spawn(pid)
        });

        match &result {
            Ok(_) => self.sink.update(&id, CommandStatus::Completed, None),
            Err(e) => self
                .sink
                .update(&id, CommandStatus::Failed, Some(&e.to_string())),
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context_with(sink: Arc<MemorySink>) -> RunContext {
        let toolchain = Toolchain {
            timeout: Duration::from_secs(5),
            ..Toolchain::in_dir(Path::new("/nonexistent/ffbd"))
        };
        RunContext::new(toolchain, AnalysisSettings::default(), sink)
    }

    #[test]
    fn spawn_failure_is_logged_as_failed() {
        let sink = Arc::new(MemorySink::new());
        let ctx = context_with(sink.clone());

        let mut cmd = ctx.toolchain.ffmpeg();
        cmd.arg("-version");
        assert!(ctx.execute("probe", Some("clip.mp4"), &mut cmd).is_err());

        let entries = sink.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].kind, "probe");
        assert_eq!(entries[0].status, CommandStatus::Failed);
        assert_eq!(entries[0].source_file.as_deref(), Some("clip.mp4"));
        assert!(entries[0].error.is_some());
    }

    #[cfg(unix)]
    #[test]
    fn successful_command_completes() {
        let sink = Arc::new(MemorySink::new());
        let ctx = context_with(sink.clone());

        let mut cmd = Command::new("true");
        ctx.execute("encode", None, &mut cmd).unwrap();

        let entries = sink.entries();
        assert_eq!(entries[0].status, CommandStatus::Completed);
        assert!(entries[0].started_at.is_some());
        assert!(entries[0].completed_at.is_some());
    }
}
