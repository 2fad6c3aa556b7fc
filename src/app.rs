use crate::cli::{Cli, Commands, RawArgs, SubmitCommand};
use ffbd::engine::analysis::{self, AnalysisReport, COMPARISON_REPORT, METRICS_REPORT};
use ffbd::engine::bd::{self, BdMode};
use ffbd::engine::job::{FileJobRepository, JobRepository, JobRequest, JobStatus};
use ffbd::engine::template::{Template, TemplateKind};
use ffbd::engine::worker::{FfmpegAnalysisRunner, JobProcessor};
use ffbd::{config, engine};
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

pub fn run(cli: Cli) {
    let cfg = match config::Config::load() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Error loading config: {:#}", e);
            process::exit(1);
        }
    };

    match cli.command {
        Commands::CheckFfmpeg => handle_check_ffmpeg(&cfg),
        Commands::Probe { file } => handle_probe(&cfg, file),
        Commands::Analyze {
            reference,
            encoded,
            raw,
            out,
        } => handle_analyze(&cfg, reference, encoded, &raw, out),
        Commands::RunTemplate {
            template,
            work_dir,
            strict,
        } => handle_run_template(&cfg, &template, &work_dir, strict),
        Commands::Submit { request } => handle_submit(&cfg, request),
        Commands::Jobs { status } => handle_jobs(&cfg, status),
        Commands::Show { id } => handle_show(&cfg, &id),
        Commands::Worker { once } => handle_worker(&cfg, once),
        Commands::Bd { anchor, test, mode } => handle_bd(&anchor, &test, mode),
        Commands::InitConfig => handle_init_config(),
    }
}

fn fail(context: &str, err: impl std::fmt::Display) -> ! {
    eprintln!("{}: {:#}", context, err);
    process::exit(1);
}

fn print_json<T: serde::Serialize>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(json) => println!("{}", json),
        Err(e) => fail("Error encoding JSON", e),
    }
}

fn handle_check_ffmpeg(cfg: &config::Config) {
    let toolchain = cfg.toolchain();
    match engine::ffmpeg_version(&toolchain) {
        Ok(version) => println!("ffmpeg found: {}", version),
        Err(e) => fail("Error", e),
    }
    match engine::ffprobe_version(&toolchain) {
        Ok(version) => println!("ffprobe found: {}", version),
        Err(e) => fail("Error", e),
    }
    if engine::vmaf_filter_available(&toolchain) {
        println!("libvmaf filter: available");
    } else {
        eprintln!("libvmaf filter: missing (VMAF scores will fail)");
        process::exit(1);
    }

    // Standalone encoders are optional
    for (name, program) in [
        ("x264", &toolchain.x264),
        ("x265", &toolchain.x265),
        ("vvencapp", &toolchain.vvenc),
    ] {
        match engine::encoder_version(program) {
            Ok(version) => println!("{} found: {}", name, version),
            Err(_) => println!("{} not found", name),
        }
    }
}

fn handle_probe(cfg: &config::Config, file: PathBuf) {
    let ctx = engine::RunContext::with_tracing(cfg.toolchain(), cfg.settings());
    match engine::probe::probe_stream(&ctx, &file, engine::elementary_demuxer(&file)) {
        Ok(info) => print_json(&info),
        Err(e) => fail("Error", e),
    }
}

fn handle_analyze(
    cfg: &config::Config,
    reference: PathBuf,
    encoded: Vec<PathBuf>,
    raw: &RawArgs,
    out: PathBuf,
) {
    let ctx = engine::RunContext::with_tracing(cfg.toolchain(), cfg.settings());
    let raw = raw.params().or_else(|| raw_from_name(&reference));

    let report = match analysis::build_bitstream_report(
        &ctx,
        &reference,
        &encoded,
        &out.join("analysis"),
        raw.as_ref(),
    ) {
        Ok(report) => report,
        Err(e) => fail("Analysis failed", e),
    };

    let path = out.join(COMPARISON_REPORT);
    if let Err(e) = analysis::write_report(&path, &report) {
        fail("Error writing report", e);
    }
    for variant in &report.encoded {
        println!(
            "{}: {} kbps, psnr {}, ssim {}, vmaf {}",
            variant.variant.label,
            variant.bitrate.avg_bitrate_bps / 1000,
            fmt_opt(variant.metrics.psnr.summary_value("psnr_avg")),
            fmt_opt(variant.metrics.ssim.summary_value("ssim_avg")),
            fmt_opt(variant.metrics.vmaf.summary_value("vmaf_mean")),
        );
    }
    for err in &report.errors {
        eprintln!("{}: {}", err.source, err.message);
    }
    println!("Report written to {}", path.display());
}

/// Geometry encoded in a raw reference's file name (`name_WxH_fps.yuv`)
fn raw_from_name(path: &Path) -> Option<engine::RawParams> {
    if !engine::is_raw_path(path) {
        return None;
    }
    let stem = path.file_stem()?.to_string_lossy();
    let (width, height, fps) = engine::parse_raw_name(&stem)?;
    Some(engine::RawParams::new(width, height, fps))
}

fn fmt_opt(value: Option<f64>) -> String {
    value
        .map(|v| format!("{:.3}", v))
        .unwrap_or_else(|| "n/a".to_string())
}

fn load_template(path: &Path) -> Template {
    match Template::load(path) {
        Ok(template) => template,
        Err(e) => fail("Invalid template", e),
    }
}

fn handle_run_template(cfg: &config::Config, path: &Path, work_dir: &Path, strict: bool) {
    let template = load_template(path);
    let mut settings = cfg.settings();
    settings.strict |= strict;
    let ctx = engine::RunContext::with_tracing(cfg.toolchain(), settings);

    match analysis::run_template(&ctx, &template, work_dir) {
        Ok(AnalysisReport::Comparison(report)) => {
            for record in &report.bd_metrics {
                println!(
                    "{}: BD-Rate psnr {} vmaf {} | BD-PSNR {}",
                    record.source,
                    fmt_opt(record.bd_rate.get("psnr").copied().flatten()),
                    fmt_opt(record.bd_rate.get("vmaf").copied().flatten()),
                    fmt_opt(record.bd_metric.get("psnr").copied().flatten()),
                );
            }
            report_errors(&report.errors);
            println!("Report written to {}", work_dir.join(COMPARISON_REPORT).display());
        }
        Ok(AnalysisReport::MetricsAnalysis(report)) => {
            println!("Scored {} sources", report.entries.len());
            report_errors(&report.errors);
            println!("Report written to {}", work_dir.join(METRICS_REPORT).display());
        }
        Ok(AnalysisReport::Bitstream(_)) => unreachable!("run_template never yields a bitstream report"),
        Err(e) => fail("Run failed", e),
    }
}

fn report_errors(errors: &[engine::ErrorRecord]) {
    if errors.is_empty() {
        return;
    }
    eprintln!("{} pair(s) failed:", errors.len());
    for err in errors {
        match &err.label {
            Some(label) => eprintln!("  {} / {}: [{}] {}", err.source, label, err.kind, err.message),
            None => eprintln!("  {}: [{}] {}", err.source, err.kind, err.message),
        }
    }
}

fn open_repository(cfg: &config::Config) -> FileJobRepository {
    match FileJobRepository::new(&cfg.worker.jobs_root) {
        Ok(repo) => repo,
        Err(e) => fail("Error opening job store", e),
    }
}

fn handle_submit(cfg: &config::Config, command: SubmitCommand) {
    let request = match command {
        SubmitCommand::Template { file } => {
            let template = load_template(&file);
            match template.kind {
                TemplateKind::Comparison => {
                    if let Err(e) = analysis::check_comparison_preconditions(&template) {
                        fail("Template rejected", e);
                    }
                    JobRequest::Comparison { template }
                }
                TemplateKind::MetricsAnalysis => JobRequest::MetricsAnalysis { template },
            }
        }
        SubmitCommand::Bitstream {
            reference,
            encoded,
            raw,
        } => {
            let raw = raw.params().or_else(|| raw_from_name(&reference));
            JobRequest::BitstreamAnalysis {
                reference,
                encoded,
                raw,
            }
        }
    };

    let repo = open_repository(cfg);
    match repo.create(request) {
        Ok(job) => println!("Queued job {} ({})", job.id, job.status.as_str()),
        Err(e) => fail("Error queueing job", e),
    }
}

fn handle_jobs(cfg: &config::Config, status: Option<JobStatus>) {
    let repo = open_repository(cfg);
    let jobs = match repo.list(status) {
        Ok(jobs) => jobs,
        Err(e) => fail("Error listing jobs", e),
    };

    for job in &jobs {
        let commands_done = job
            .command_logs
            .iter()
            .filter(|c| c.status.is_terminal())
            .count();
        println!(
            "{}  {:<10}  {:?}  {}  commands {}/{}{}",
            job.id,
            job.status.as_str(),
            job.mode,
            job.created_at.format("%Y-%m-%d %H:%M:%S"),
            commands_done,
            job.command_logs.len(),
            job.error
                .as_deref()
                .map(|e| format!("  error: {}", e))
                .unwrap_or_default(),
        );
    }
    println!("Total jobs: {}", jobs.len());
}

fn handle_show(cfg: &config::Config, id: &str) {
    let repo = open_repository(cfg);
    match repo.get(id) {
        Ok(Some(job)) => print_json(&job),
        Ok(None) => fail("Error", format!("no job with id {}", id)),
        Err(e) => fail("Error reading job", e),
    }
}

fn handle_worker(cfg: &config::Config, once: bool) {
    let repo = Arc::new(open_repository(cfg));
    let processor = JobProcessor::new(
        repo,
        Arc::new(FfmpegAnalysisRunner),
        cfg.toolchain(),
        cfg.settings(),
        cfg.poll_interval(),
        None,
    );

    if once {
        match processor.process_next() {
            Ok(Some(job)) => println!("Job {} {}", job.id, job.status.as_str()),
            Ok(None) => println!("No pending jobs"),
            Err(e) => fail("Worker error", e),
        }
        return;
    }

    println!("Watching {} for jobs", cfg.worker.jobs_root.display());
    let stop = AtomicBool::new(false);
    processor.run(&stop);
}

fn handle_bd(anchor: &[(f64, f64)], test: &[(f64, f64)], mode: BdMode) {
    let split = |points: &[(f64, f64)]| -> (Vec<f64>, Vec<f64>) {
        let mut points = points.to_vec();
        points.sort_by(|a, b| a.0.total_cmp(&b.0));
        points.into_iter().unzip()
    };
    let (rate_a, metric_a) = split(anchor);
    let (rate_b, metric_b) = split(test);

    let rate = bd::bd_rate_with(&rate_a, &metric_a, &rate_b, &metric_b, mode);
    let metric = bd::bd_metric_with(&rate_a, &metric_a, &rate_b, &metric_b, mode);
    if rate.is_none() && metric.is_none() {
        fail(
            "Error",
            format!(
                "curves need at least {} valid points each and an overlapping range",
                bd::MIN_POINTS
            ),
        );
    }
    println!("BD-Rate:   {}%", fmt_opt(rate));
    println!("BD-Metric: {}", fmt_opt(metric));
}

fn handle_init_config() {
    match config::Config::config_path() {
        Ok(path) if path.exists() => match config::Config::load() {
            Ok(cfg) => {
                println!("Config loaded successfully from {}", path.display());
                println!("{:#?}", cfg);
            }
            Err(e) => fail("Config invalid", e),
        },
        Ok(_) => {
            println!("Creating default config...");
            match config::Config::default().save() {
                Ok(path) => println!("Default config saved to {}", path.display()),
                Err(e) => fail("Failed to save default config", e),
            }
        }
        Err(e) => fail("Config path unknown", e),
    }
}
