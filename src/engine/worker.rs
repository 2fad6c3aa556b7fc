// Background job processing: one job at a time, oldest pending first

use anyhow::{Context, Result};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{error, info};

use super::analysis::{COMPARISON_REPORT, build_bitstream_report, run_comparison, run_metrics_analysis, write_report};
use super::core::{AnalysisSettings, CommandStatus, RunContext, Toolchain};
use super::job::{Job, JobMode, JobRepository, JobRequest, JobSink, JobStatus};

/// Message from the processor to observers
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerMessage {
    /// Job picked up and marked processing
    JobStarted { job_id: String },

    /// A command log entry was added or moved forward
    CommandUpdate {
        job_id: String,
        command_id: String,
        status: CommandStatus,
    },

    /// Job completed successfully
    JobCompleted { job_id: String },

    /// Job failed with error
    JobFailed { job_id: String, error: String },

    /// No pending job was found
    WorkerIdle,
}

/// Executes the analysis behind a job request
pub trait AnalysisRunner: Send + Sync {
    fn supports(&self, mode: JobMode) -> bool {
        let _ = mode;
        true
    }

    /// Run `request`, writing artifacts under `work_dir`, and return the
    /// report as JSON
    fn run(&self, ctx: &RunContext, request: &JobRequest, work_dir: &Path) -> Result<serde_json::Value>;
}

/// Runs requests with the ffmpeg toolchain
#[derive(Debug, Default, Clone, Copy)]
pub struct FfmpegAnalysisRunner;

impl AnalysisRunner for FfmpegAnalysisRunner {
    fn run(&self, ctx: &RunContext, request: &JobRequest, work_dir: &Path) -> Result<serde_json::Value> {
        let value = match request {
            JobRequest::BitstreamAnalysis {
                reference,
                encoded,
                raw,
            } => {
                let report = build_bitstream_report(
                    ctx,
                    reference,
                    encoded,
                    &work_dir.join("analysis"),
                    raw.as_ref(),
                )?;
                write_report(&work_dir.join(COMPARISON_REPORT), &report)?;
                serde_json::to_value(report)
            }
            JobRequest::Comparison { template } => {
                serde_json::to_value(run_comparison(ctx, template, work_dir)?)
            }
            JobRequest::MetricsAnalysis { template } => {
                serde_json::to_value(run_metrics_analysis(ctx, template, work_dir)?)
            }
        };
        value.context("Failed to encode report")
    }
}

/// Picks pending jobs and drives them to a terminal state
pub struct JobProcessor {
    repo: Arc<dyn JobRepository>,
    runner: Arc<dyn AnalysisRunner>,
    toolchain: Toolchain,
    settings: AnalysisSettings,
    poll_interval: Duration,
    tx: Option<Sender<WorkerMessage>>,
}

impl JobProcessor {
    /// `tx` receives progress messages; pass `None` when nobody listens
    pub fn new(
        repo: Arc<dyn JobRepository>,
        runner: Arc<dyn AnalysisRunner>,
        toolchain: Toolchain,
        settings: AnalysisSettings,
        poll_interval: Duration,
        tx: Option<Sender<WorkerMessage>>,
    ) -> Self {
        Self {
            repo,
            runner,
            toolchain,
            settings,
            poll_interval,
            tx,
        }
    }

    fn send(&self, msg: WorkerMessage) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(msg);
        }
    }

    /// Process the oldest pending job of a supported mode, if any
    pub fn process_next(&self) -> Result<Option<Job>> {
        let next = self
            .repo
            .list(Some(JobStatus::Pending))?
            .into_iter()
            .find(|j| self.runner.supports(j.mode));
        let Some(mut job) = next else {
            self.send(WorkerMessage::WorkerIdle);
            return Ok(None);
        };

        job.transition(JobStatus::Processing);
        self.repo.save(&job)?;
        info!(job = %job.id, mode = ?job.mode, "job started");
        self.send(WorkerMessage::JobStarted {
            job_id: job.id.clone(),
        });

        let sink = Arc::new(JobSink::new(
            self.repo.clone(),
            job.clone(),
            self.tx.clone(),
        ));
        let ctx = RunContext::new(self.toolchain.clone(), self.settings.clone(), sink.clone());
        let work_dir = self.repo.work_dir(&job.id);

        let outcome = std::fs::create_dir_all(&work_dir)
            .with_context(|| format!("Failed to create work dir {}", work_dir.display()))
            .and_then(|()| {
                catch_unwind(AssertUnwindSafe(|| {
                    self.runner.run(&ctx, &job.request, &work_dir)
                }))
                .unwrap_or_else(|_| Err(anyhow::anyhow!("analysis panicked")))
            });

        // Pick up the command logs recorded during the run
        let mut job = sink.snapshot().unwrap_or(job);
        match outcome {
            Ok(result) => {
                job.complete(result);
                info!(job = %job.id, "job completed");
                self.send(WorkerMessage::JobCompleted {
                    job_id: job.id.clone(),
                });
            }
            Err(e) => {
                let message = format!("{:#}", e);
                error!(job = %job.id, error = %message, "job failed");
                job.fail(message.clone());
                self.send(WorkerMessage::JobFailed {
                    job_id: job.id.clone(),
                    error: message,
                });
            }
        }
        self.repo.save(&job)?;
        Ok(Some(job))
    }

    /// Poll for work until `stop` is set
    pub fn run(&self, stop: &AtomicBool) {
        info!(interval = ?self.poll_interval, "worker started");
        while !stop.load(Ordering::Relaxed) {
            match self.process_next() {
                Ok(Some(_)) => continue,
                Ok(None) => {}
                Err(e) => error!(error = %format!("{e:#}"), "job processing error"),
            }
            self.idle(stop);
        }
        info!("worker stopped");
    }

    fn idle(&self, stop: &AtomicBool) {
        let deadline = Instant::now() + self.poll_interval;
        while !stop.load(Ordering::Relaxed) && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(50).min(self.poll_interval));
        }
    }
}
