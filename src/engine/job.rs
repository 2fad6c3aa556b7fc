// Analysis jobs: the persisted document, repositories and the command-log sink

use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};
use uuid::Uuid;

use super::core::{CommandLogEntry, CommandSink, CommandStatus, RawParams};
use super::template::Template;
use super::worker::WorkerMessage;

/// File holding the job document inside its directory
pub const JOB_FILE: &str = "job.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    fn can_become(self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Pending, JobStatus::Processing)
                | (JobStatus::Processing, JobStatus::Completed)
                | (JobStatus::Processing, JobStatus::Failed)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobMode {
    BitstreamAnalysis,
    Comparison,
    MetricsAnalysis,
}

/// What a job asks for; carried inside the job document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum JobRequest {
    BitstreamAnalysis {
        reference: PathBuf,
        encoded: Vec<PathBuf>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        raw: Option<RawParams>,
    },
    Comparison {
        template: Template,
    },
    MetricsAnalysis {
        template: Template,
    },
}

impl JobRequest {
    pub fn mode(&self) -> JobMode {
        match self {
            JobRequest::BitstreamAnalysis { .. } => JobMode::BitstreamAnalysis,
            JobRequest::Comparison { .. } => JobMode::Comparison,
            JobRequest::MetricsAnalysis { .. } => JobMode::MetricsAnalysis,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub status: JobStatus,
    pub mode: JobMode,
    pub request: JobRequest,
    pub created_at: DateTime<Local>,
    pub updated_at: DateTime<Local>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Local>>,
    #[serde(default)]
    pub command_logs: Vec<CommandLogEntry>,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<String>,
}

impl Job {
    pub fn new(request: JobRequest) -> Self {
        let now = Local::now();
        Self {
            id: Uuid::new_v4().simple().to_string(),
            status: JobStatus::Pending,
            mode: request.mode(),
            request,
            created_at: now,
            updated_at: now,
            completed_at: None,
            command_logs: Vec::new(),
            result: None,
            error: None,
        }
    }

    /// Move to `next` if that is a legal transition. Returns false otherwise.
    pub fn transition(&mut self, next: JobStatus) -> bool {
        if !self.status.can_become(next) {
            warn!(job = %self.id, from = self.status.as_str(), to = next.as_str(), "illegal job transition ignored");
            return false;
        }
        let now = Local::now();
        self.status = next;
        self.updated_at = now;
        if next.is_terminal() {
            self.completed_at = Some(now);
        }
        true
    }

    pub fn complete(&mut self, result: serde_json::Value) -> bool {
        if !self.transition(JobStatus::Completed) {
            return false;
        }
        self.result = Some(result);
        true
    }

    pub fn fail(&mut self, error: impl Into<String>) -> bool {
        if !self.transition(JobStatus::Failed) {
            return false;
        }
        self.error = Some(error.into());
        true
    }
}

/// Storage for job documents, keyed by job id
pub trait JobRepository: Send + Sync {
    fn create(&self, request: JobRequest) -> Result<Job>;
    fn get(&self, id: &str) -> Result<Option<Job>>;
    /// Replace the stored document as a whole
    fn save(&self, job: &Job) -> Result<()>;
    /// Jobs with `status` (all when `None`), oldest first
    fn list(&self, status: Option<JobStatus>) -> Result<Vec<Job>>;
    /// Directory a job's artifacts are written to
    fn work_dir(&self, id: &str) -> PathBuf;
}

fn oldest_first(jobs: &mut [Job]) {
    jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
}

/// One directory per job under `root`, holding `job.json` and the job's work files
#[derive(Debug, Clone)]
pub struct FileJobRepository {
    root: PathBuf,
}

impl FileJobRepository {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)
            .with_context(|| format!("Failed to create jobs directory {}", root.display()))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn job_file(&self, id: &str) -> PathBuf {
        self.root.join(id).join(JOB_FILE)
    }

    fn read(path: &Path) -> Result<Job> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("Failed to read job file {}", path.display()))?;
        serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse job file {}", path.display()))
    }
}

impl JobRepository for FileJobRepository {
    fn create(&self, request: JobRequest) -> Result<Job> {
        let job = Job::new(request);
        self.save(&job)?;
        Ok(job)
    }

    fn get(&self, id: &str) -> Result<Option<Job>> {
        let path = self.job_file(id);
        if !path.is_file() {
            return Ok(None);
        }
        Self::read(&path).map(Some)
    }

    fn save(&self, job: &Job) -> Result<()> {
        let dir = self.root.join(&job.id);
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create job directory {}", dir.display()))?;

        // Write then rename so readers never see a half-written document
        let path = dir.join(JOB_FILE);
        let tmp = dir.join(format!("{JOB_FILE}.tmp"));
        let json = serde_json::to_string_pretty(job).context("Failed to serialize job")?;
        fs::write(&tmp, json).with_context(|| format!("Failed to write {}", tmp.display()))?;
        fs::rename(&tmp, &path).with_context(|| format!("Failed to replace {}", path.display()))?;
        Ok(())
    }

    fn list(&self, status: Option<JobStatus>) -> Result<Vec<Job>> {
        let mut jobs = Vec::new();
        let entries = fs::read_dir(&self.root)
            .with_context(|| format!("Failed to list {}", self.root.display()))?;

        for entry in entries.filter_map(|e| e.ok()) {
            let path = entry.path().join(JOB_FILE);
            if !path.is_file() {
                continue;
            }
            match Self::read(&path) {
                Ok(job) if status.is_none_or(|s| job.status == s) => jobs.push(job),
                Ok(_) => {}
                Err(e) => warn!(path = %path.display(), error = %format!("{e:#}"), "skipping unreadable job"),
            }
        }
        oldest_first(&mut jobs);
        Ok(jobs)
    }

    fn work_dir(&self, id: &str) -> PathBuf {
        self.root.join(id)
    }
}

/// Jobs held in memory; work directories still live under `root`
#[derive(Debug)]
pub struct MemoryJobRepository {
    root: PathBuf,
    jobs: Mutex<BTreeMap<String, Job>>,
}

impl MemoryJobRepository {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            jobs: Mutex::new(BTreeMap::new()),
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<String, Job>>> {
        self.jobs
            .lock()
            .map_err(|_| anyhow::anyhow!("job store lock poisoned"))
    }
}

impl JobRepository for MemoryJobRepository {
    fn create(&self, request: JobRequest) -> Result<Job> {
        let job = Job::new(request);
        self.save(&job)?;
        Ok(job)
    }

    fn get(&self, id: &str) -> Result<Option<Job>> {
        Ok(self.lock()?.get(id).cloned())
    }

    fn save(&self, job: &Job) -> Result<()> {
        self.lock()?.insert(job.id.clone(), job.clone());
        Ok(())
    }

    fn list(&self, status: Option<JobStatus>) -> Result<Vec<Job>> {
        let mut jobs: Vec<Job> = self
            .lock()?
            .values()
            .filter(|j| status.is_none_or(|s| j.status == s))
            .cloned()
            .collect();
        oldest_first(&mut jobs);
        Ok(jobs)
    }

    fn work_dir(&self, id: &str) -> PathBuf {
        self.root.join(id)
    }
}

/// Command sink that records entries on a job and saves the document after
/// every change, so observers see each command before it starts.
pub struct JobSink {
    repo: Arc<dyn JobRepository>,
    job: Mutex<Job>,
    events: Option<Sender<WorkerMessage>>,
}

impl JobSink {
    pub fn new(repo: Arc<dyn JobRepository>, job: Job, events: Option<Sender<WorkerMessage>>) -> Self {
        Self {
            repo,
            job: Mutex::new(job),
            events,
        }
    }

    /// Current state of the job, command logs included
    pub fn snapshot(&self) -> Option<Job> {
        self.job.lock().ok().map(|j| j.clone())
    }

    fn persist(&self, job: &mut Job) {
        job.updated_at = Local::now();
        if let Err(e) = self.repo.save(job) {
            warn!(job = %job.id, error = %format!("{e:#}"), "failed to persist command log");
        }
    }

    fn notify(&self, job_id: &str, command_id: &str, status: CommandStatus) {
        if let Some(tx) = &self.events {
            let _ = tx.send(WorkerMessage::CommandUpdate {
                job_id: job_id.to_string(),
                command_id: command_id.to_string(),
                status,
            });
        }
    }
}

impl CommandSink for JobSink {
    fn append(&self, kind: &str, command: &str, source: Option<&str>) -> String {
        let id = Uuid::new_v4().to_string();
        let Ok(mut job) = self.job.lock() else {
            return id;
        };
        job.command_logs
            .push(CommandLogEntry::new(id.clone(), kind, command, source));
        self.persist(&mut job);
        debug!(job = %job.id, command = %id, kind, "command logged");
        self.notify(&job.id, &id, CommandStatus::Pending);
        id
    }

    fn update(&self, id: &str, status: CommandStatus, error: Option<&str>) {
        let Ok(mut job) = self.job.lock() else {
            return;
        };
        let advanced = job
            .command_logs
            .iter_mut()
            .find(|e| e.id == id)
            .is_some_and(|e| e.advance(status, error));
        if advanced {
            self.persist(&mut job);
            self.notify(&job.id, id, status);
        }
    }
}
