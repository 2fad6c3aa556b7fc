// Job lifecycle through the file-backed repository

use anyhow::Context;
use ffbd::engine::job::{FileJobRepository, JOB_FILE, JobRepository, JobRequest, JobStatus};
use ffbd::engine::worker::{AnalysisRunner, JobProcessor, WorkerMessage};
use ffbd::engine::{AnalysisSettings, CommandStatus, RawParams, RunContext, Toolchain};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver};
use std::time::Duration;
use tempfile::TempDir;

/// Logs one failing command, then fails with a context chain
struct FailingRunner;

impl AnalysisRunner for FailingRunner {
    fn run(&self, ctx: &RunContext, _request: &JobRequest, work_dir: &Path) -> anyhow::Result<serde_json::Value> {
        assert!(work_dir.is_dir());
        let id = ctx.sink().append("normalize_reference", "ffmpeg -i ref.y4m ref.yuv", Some("ref.y4m"));
        ctx.sink().update(&id, CommandStatus::Running, None);
        ctx.sink().update(&id, CommandStatus::Failed, Some("exit status 1"));
        Err(anyhow::anyhow!("exit status 1")).context("reference could not be normalized")
    }
}

struct PanickingRunner;

impl AnalysisRunner for PanickingRunner {
    fn run(&self, _ctx: &RunContext, _request: &JobRequest, _work_dir: &Path) -> anyhow::Result<serde_json::Value> {
        panic!("metric log vanished");
    }
}

fn request() -> JobRequest {
    JobRequest::BitstreamAnalysis {
        reference: PathBuf::from("ref_16x16_30.yuv"),
        encoded: vec![PathBuf::from("a.h264"), PathBuf::from("b.h264")],
        raw: Some(RawParams::new(16, 16, 30.0)),
    }
}

fn processor(repo: Arc<FileJobRepository>, runner: Arc<dyn AnalysisRunner>) -> JobProcessor {
    JobProcessor::new(
        repo,
        runner,
        Toolchain::default(),
        AnalysisSettings::default(),
        Duration::from_millis(10),
        None,
    )
}

fn observed_processor(
    repo: Arc<FileJobRepository>,
    runner: Arc<dyn AnalysisRunner>,
) -> (JobProcessor, Receiver<WorkerMessage>) {
    let (tx, rx) = mpsc::channel();
    let processor = JobProcessor::new(
        repo,
        runner,
        Toolchain::default(),
        AnalysisSettings::default(),
        Duration::from_millis(10),
        Some(tx),
    );
    (processor, rx)
}

#[test]
fn test_failed_job_keeps_error_chain_and_logs() {
    let tmp = TempDir::new().unwrap();
    let repo = Arc::new(FileJobRepository::new(tmp.path()).unwrap());
    let job = repo.create(request()).unwrap();
    assert!(tmp.path().join(&job.id).join(JOB_FILE).is_file());

    let (worker, rx) = observed_processor(repo.clone(), Arc::new(FailingRunner));
    let done = worker.process_next().unwrap().unwrap();
    assert_eq!(done.status, JobStatus::Failed);

    let stored = repo.get(&job.id).unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Failed);
    assert_eq!(
        stored.error.as_deref(),
        Some("reference could not be normalized: exit status 1")
    );
    assert!(stored.result.is_none());
    assert!(stored.completed_at.is_some());
    assert_eq!(stored.command_logs.len(), 1);
    assert_eq!(stored.command_logs[0].status, CommandStatus::Failed);
    assert_eq!(stored.command_logs[0].error.as_deref(), Some("exit status 1"));

    let messages: Vec<WorkerMessage> = rx.try_iter().collect();
    assert!(messages.contains(&WorkerMessage::JobFailed {
        job_id: job.id.clone(),
        error: "reference could not be normalized: exit status 1".to_string(),
    }));
}

#[test]
fn test_panicking_runner_fails_the_job() {
    let tmp = TempDir::new().unwrap();
    let repo = Arc::new(FileJobRepository::new(tmp.path()).unwrap());
    let job = repo.create(request()).unwrap();

    let done = processor(repo.clone(), Arc::new(PanickingRunner))
        .process_next()
        .unwrap()
        .unwrap();
    assert_eq!(done.id, job.id);
    assert_eq!(done.status, JobStatus::Failed);
    assert_eq!(done.error.as_deref(), Some("analysis panicked"));
}

#[test]
fn test_terminal_jobs_are_not_picked_again() {
    let tmp = TempDir::new().unwrap();
    let repo = Arc::new(FileJobRepository::new(tmp.path()).unwrap());
    let first = repo.create(request()).unwrap();
    std::thread::sleep(Duration::from_millis(5));
    let second = repo.create(request()).unwrap();

    let (worker, rx) = observed_processor(repo.clone(), Arc::new(FailingRunner));
    let a = worker.process_next().unwrap().unwrap();
    let b = worker.process_next().unwrap().unwrap();
    assert_eq!(a.id, first.id, "oldest job first");
    assert_eq!(b.id, second.id);
    assert!(worker.process_next().unwrap().is_none());
    assert_eq!(rx.try_iter().last(), Some(WorkerMessage::WorkerIdle));

    assert_eq!(repo.list(Some(JobStatus::Failed)).unwrap().len(), 2);
    assert!(repo.list(Some(JobStatus::Pending)).unwrap().is_empty());

    // A terminal job cannot move again
    let mut stored = repo.get(&first.id).unwrap().unwrap();
    assert!(!stored.transition(JobStatus::Processing));
    assert!(!stored.complete(serde_json::json!({})));
}
