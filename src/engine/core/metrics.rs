// Metric runner: one ffmpeg filter pass per quality metric

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::thread;
use tracing::debug;

use super::context::{AnalysisSettings, RunContext, Toolchain};
use super::logparse::{parse_log, truncate_series};
use super::normalize::TempArtifact;
use super::types::{CANONICAL_PIX_FMT, MetricSeries};
use crate::engine::error::AnalysisError;

/// Model used alongside the standard one for the no-enhancement-gain score
const VMAF_NEG_MODEL: &str = "version=vmaf_v0.6.1neg";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    Psnr,
    Ssim,
    Vmaf,
}

impl MetricKind {
    pub const ALL: [MetricKind; 3] = [MetricKind::Psnr, MetricKind::Ssim, MetricKind::Vmaf];

    pub fn name(self) -> &'static str {
        match self {
            MetricKind::Psnr => "psnr",
            MetricKind::Ssim => "ssim",
            MetricKind::Vmaf => "vmaf",
        }
    }

    fn log_file_name(self, label: &str) -> String {
        match self {
            MetricKind::Vmaf => format!("{label}_vmaf.csv"),
            other => format!("{label}_{}.log", other.name()),
        }
    }
}

/// Select appropriate VMAF model based on output resolution
///
/// - Below 2160p: standard vmaf_v0.6.1 model (1080p HDTV viewing distance)
/// - 2160p and up: vmaf_4k_v0.6.1 model (4K viewing distance)
pub fn select_vmaf_model(output_height: u32) -> &'static str {
    if output_height >= 2160 {
        "version=vmaf_4k_v0.6.1"
    } else {
        "version=vmaf_v0.6.1"
    }
}

/// Escape a path for use inside an ffmpeg filter argument
pub fn escape_filter_path(path: &Path) -> String {
    path.display()
        .to_string()
        .replace('\\', "\\\\")
        .replace(':', "\\:")
        .replace('\'', "\\'")
        .replace(' ', "\\ ")
        .replace('[', "\\[")
        .replace(']', "\\]")
        .replace(',', "\\,")
}

/// Filter expression for one metric writing its per-frame log to `log_path`
pub fn build_metric_filter(kind: MetricKind, log_path: &Path, height: u32, vmaf_threads: u32) -> String {
    let log = escape_filter_path(log_path);
    match kind {
        MetricKind::Psnr => format!("psnr=stats_file={log}"),
        MetricKind::Ssim => format!("ssim=stats_file={log}"),
        MetricKind::Vmaf => format!(
            "libvmaf='model={model}\\:name=vmaf|{neg}\\:name=vmaf_neg':n_threads={threads}:log_fmt=csv:log_path={log}",
            model = select_vmaf_model(height),
            neg = VMAF_NEG_MODEL,
            threads = vmaf_threads.max(1),
        ),
    }
}

/// Two normalized raw streams at the reference geometry
#[derive(Debug, Clone, Copy)]
pub struct MetricInputs<'a> {
    pub distorted: &'a Path,
    pub reference: &'a Path,
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    /// Bound on frames scored when the two streams disagree in length
    pub frame_limit: Option<u64>,
    pub label: &'a str,
}

fn push_raw_input(cmd: &mut Command, path: &Path, inputs: &MetricInputs<'_>) {
    cmd.args(["-f", "rawvideo", "-pix_fmt", CANONICAL_PIX_FMT])
        .arg("-s")
        .arg(format!("{}x{}", inputs.width, inputs.height))
        .arg("-r")
        .arg(inputs.fps.to_string())
        .arg("-i")
        .arg(path);
}

/// Build the ffmpeg command for one metric pass
///
/// # Arguments
/// * `inputs` - distorted and reference raw files, declared in that order
/// * `log_path` - where the filter writes its per-frame log
pub fn build_metric_cmd(
    toolchain: &Toolchain,
    settings: &AnalysisSettings,
    kind: MetricKind,
    inputs: &MetricInputs<'_>,
    log_path: &Path,
) -> Command {
    let mut cmd = toolchain.ffmpeg();
    cmd.args(["-hide_banner", "-y"]);
    push_raw_input(&mut cmd, inputs.distorted, inputs);
    push_raw_input(&mut cmd, inputs.reference, inputs);

    cmd.arg("-filter_complex").arg(build_metric_filter(
        kind,
        log_path,
        inputs.height,
        settings.vmaf_threads,
    ));
    if let Some(limit) = inputs.frame_limit {
        cmd.arg("-frames:v").arg(limit.to_string());
    }
    cmd.args(["-f", "null", "-"]);
    cmd
}

/// Run one metric pass. A non-zero exit fails only this pair.
pub fn run_metric(
    ctx: &RunContext,
    kind: MetricKind,
    inputs: &MetricInputs<'_>,
    log_path: &Path,
) -> Result<(), AnalysisError> {
    let mut cmd = build_metric_cmd(&ctx.toolchain, &ctx.settings, kind, inputs, log_path);
    ctx.execute(kind.name(), Some(inputs.label), &mut cmd)
        .map_err(|e| AnalysisError::MetricComputationFailed {
            metric: kind.name().to_string(),
            label: inputs.label.to_string(),
            reason: e.to_string(),
        })?;
    Ok(())
}

/// Scores of one (source, point) pair
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PairMetrics {
    pub psnr: MetricSeries,
    pub ssim: MetricSeries,
    pub vmaf: MetricSeries,
}

impl PairMetrics {
    /// Summary value by metric family key (`psnr_avg`, `ssim_avg`, `vmaf_mean`, ...)
    pub fn summary_value(&self, key: &str) -> Option<f64> {
        [&self.psnr, &self.ssim, &self.vmaf]
            .iter()
            .find_map(|s| s.summary_value(key))
    }

    /// Longest per-frame series across the three metrics
    pub fn frame_count(&self) -> usize {
        [&self.psnr, &self.ssim, &self.vmaf]
            .iter()
            .map(|s| s.frame_count())
            .max()
            .unwrap_or(0)
    }

    /// Keep the first `frames` frames of every metric, summaries included
    pub fn truncate(&mut self, frames: usize) {
        truncate_series(&mut self.psnr, MetricKind::Psnr, frames);
        truncate_series(&mut self.ssim, MetricKind::Ssim, frames);
        truncate_series(&mut self.vmaf, MetricKind::Vmaf, frames);
    }
}

fn score(
    ctx: &RunContext,
    kind: MetricKind,
    inputs: &MetricInputs<'_>,
    log_dir: &Path,
) -> Result<MetricSeries, AnalysisError> {
    let log = TempArtifact::new(log_dir.join(kind.log_file_name(inputs.label)));
    run_metric(ctx, kind, inputs, log.path())?;
    let series = parse_log(log.path(), kind)?;
    debug!(label = inputs.label, metric = kind.name(), frames = series.frame_count(), "parsed metric log");
    Ok(series)
}

/// Compute PSNR, SSIM and VMAF for one pair, concurrently when enabled.
/// Log files are removed once parsed.
pub fn run_pair_metrics(
    ctx: &RunContext,
    inputs: &MetricInputs<'_>,
    log_dir: &Path,
) -> Result<PairMetrics, AnalysisError> {
    std::fs::create_dir_all(log_dir).map_err(|e| AnalysisError::io(log_dir, e))?;

    let results: Vec<Result<MetricSeries, AnalysisError>> = if ctx.settings.parallel_metrics {
        thread::scope(|s| {
            let handles: Vec<_> = MetricKind::ALL
                .iter()
                .map(|&kind| s.spawn(move || score(ctx, kind, inputs, log_dir)))
                .collect();
            handles
                .into_iter()
                .zip(MetricKind::ALL)
                .map(|(h, kind)| {
                    h.join().unwrap_or_else(|_| {
                        Err(AnalysisError::MetricComputationFailed {
                            metric: kind.name().to_string(),
                            label: inputs.label.to_string(),
                            reason: "metric thread panicked".to_string(),
                        })
                    })
                })
                .collect()
        })
    } else {
        MetricKind::ALL
            .iter()
            .map(|&kind| score(ctx, kind, inputs, log_dir))
            .collect()
    };

    let mut results = results.into_iter();
    let mut next = || {
        results
            .next()
            .unwrap_or_else(|| Err(AnalysisError::Report("missing metric result".to_string())))
    };
    let psnr = next()?;
    let ssim = next()?;
    let vmaf = next()?;
    Ok(PairMetrics { psnr, ssim, vmaf })
}

/// Path of the per-pair log directory under `analysis_dir`
pub fn metric_log_dir(analysis_dir: &Path) -> PathBuf {
    analysis_dir.join("logs")
}
