//! Analysis orchestration
//!
//! Composes inspection, normalization, metric passes and bitrate profiling
//! into reports. Three entry points:
//! - [`build_bitstream_report`]: one reference against a list of encodes
//! - [`run_comparison`]: anchor vs test template with BD aggregation
//! - [`run_metrics_analysis`]: a single template side
//!
//! Precondition failures abort before any encoder runs. Per-pair failures are
//! collected into the report's error list unless the run is strict, in which
//! case the first one fails the run.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use super::bd::{BdMode, BdRecord, RdPoint, build_bd_record};
use super::core::{
    BitrateProfile, CANONICAL_PIX_FMT, EncodedVariant, MetricInputs, NormalizeTarget, Normalized,
    PairMetrics, PerformanceSample, RawParams, RunContext, SourceInfo, collect_sources,
    count_raw_frames, inspect, is_raw_path, list_source_files, metric_log_dir, needs_scale,
    normalize, profile_encoded, profile_raw, run_pair_metrics,
};
use super::encode::{EncodeMatrix, encode_side};
use super::error::{AnalysisError, ErrorRecord};
use super::perf::EnvironmentInfo;
use super::template::{SideConfig, Template, TemplateKind};

/// Report file written by comparison runs, relative to the work dir
pub const COMPARISON_REPORT: &str = "metrics_analysis/report_data.json";
/// Report file written by single-side runs, relative to the work dir
pub const METRICS_REPORT: &str = "metrics_analysis/analyse_data.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    CollectingSources,
    Encoding,
    Scoring,
    Aggregating,
    WritingReport,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::CollectingSources => "collecting sources",
            Phase::Encoding => "encoding",
            Phase::Scoring => "normalizing and scoring",
            Phase::Aggregating => "aggregating BD metrics",
            Phase::WritingReport => "writing report",
        };
        f.write_str(name)
    }
}

fn enter(phase: Phase, template: &str) {
    info!(template, phase = %phase, "analysis phase");
}

/// How many frames of an encode are scored against the reference
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameAlignment {
    pub frames_used: u64,
    pub mismatch: bool,
}

impl FrameAlignment {
    pub fn new(reference_frames: u64, encoded_frames: u64) -> Self {
        Self {
            frames_used: reference_frames.min(encoded_frames),
            mismatch: reference_frames != encoded_frames,
        }
    }

    /// Explicit `-frames:v` bound, only needed when the lengths disagree
    pub fn frame_limit(&self) -> Option<u64> {
        self.mismatch.then_some(self.frames_used)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferenceInfo {
    pub label: String,
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    pub frames: u64,
}

/// One scored encode in a report
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncodedEntry {
    #[serde(flatten)]
    pub variant: EncodedVariant,
    /// Rate-control value the bitstream was produced at
    #[serde(skip_serializing_if = "Option::is_none")]
    pub point: Option<f64>,
    pub metrics: PairMetrics,
    pub bitrate: BitrateProfile,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub performance: Option<PerformanceSample>,
}

impl EncodedEntry {
    fn rd_point(&self) -> RdPoint {
        let summary = [&self.metrics.psnr, &self.metrics.ssim, &self.metrics.vmaf]
            .into_iter()
            .flat_map(|s| s.summary.iter().map(|(k, v)| (k.clone(), *v)))
            .collect();
        RdPoint {
            bitrate: self.bitrate.avg_bitrate_bps as f64,
            summary,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BitstreamReport {
    pub kind: String,
    pub reference: ReferenceInfo,
    pub encoded: Vec<EncodedEntry>,
    #[serde(default)]
    pub errors: Vec<ErrorRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComparisonEntry {
    pub source: String,
    pub anchor: BitstreamReport,
    pub test: BitstreamReport,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SideEnvironments {
    pub anchor: EnvironmentInfo,
    pub test: EnvironmentInfo,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComparisonReport {
    pub kind: String,
    pub template_id: String,
    pub template_name: String,
    pub anchor_fingerprint: String,
    pub bd_mode: BdMode,
    pub environment: SideEnvironments,
    pub entries: Vec<ComparisonEntry>,
    pub bd_metrics: Vec<BdRecord>,
    pub errors: Vec<ErrorRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsEntry {
    pub source: String,
    pub reference: ReferenceInfo,
    pub encoded: Vec<EncodedEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsAnalysisReport {
    pub kind: String,
    pub template_id: String,
    pub template_name: String,
    pub environment: EnvironmentInfo,
    pub entries: Vec<MetricsEntry>,
    pub errors: Vec<ErrorRecord>,
}

/// Any report an analysis run can produce
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AnalysisReport {
    Bitstream(BitstreamReport),
    Comparison(ComparisonReport),
    MetricsAnalysis(MetricsAnalysisReport),
}

/// A bitstream to score, with what is known about how it was produced
#[derive(Debug, Clone, PartialEq)]
pub struct VariantInput {
    pub path: PathBuf,
    pub point: Option<f64>,
    pub performance: Option<PerformanceSample>,
}

impl VariantInput {
    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            point: None,
            performance: None,
        }
    }
}

/// The reference decoded once to raw and shared by every pair
struct PreparedReference {
    info: ReferenceInfo,
    target: NormalizeTarget,
    raw: Normalized,
}

fn file_label(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

fn prepare_reference(
    ctx: &RunContext,
    path: &Path,
    raw: Option<&RawParams>,
    analysis_dir: &Path,
) -> Result<PreparedReference, AnalysisError> {
    let hint = inspect(ctx, path, raw)?;
    let unreadable = |reason: &str| AnalysisError::UnreadableInput {
        path: path.to_path_buf(),
        reason: reason.to_string(),
    };
    let (width, height) = hint
        .geometry()
        .ok_or_else(|| unreadable("reference has no resolution"))?;
    let fps = hint
        .fps
        .filter(|f| *f > 0.0)
        .ok_or_else(|| unreadable("reference has no frame rate"))?;

    let target = NormalizeTarget { width, height, fps };
    let raw = normalize(
        ctx,
        path,
        &hint,
        &target,
        &analysis_dir.join("reference.yuv"),
        "normalize_reference",
    )?;
    let frames = count_raw_frames(raw.path(), width, height, CANONICAL_PIX_FMT)?;

    Ok(PreparedReference {
        info: ReferenceInfo {
            label: file_label(path),
            width,
            height,
            fps,
            frames,
        },
        target,
        raw,
    })
}

fn score_variant(
    ctx: &RunContext,
    reference: &PreparedReference,
    input: &VariantInput,
    analysis_dir: &Path,
) -> Result<EncodedEntry, AnalysisError> {
    let path = &input.path;
    let label = file_label(path);
    let target = reference.target;

    // Raw encodes are read at the reference geometry
    let raw_params = is_raw_path(path).then(|| RawParams::new(target.width, target.height, target.fps));
    let hint = inspect(ctx, path, raw_params.as_ref())?;

    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| label.clone());
    let normalized = normalize(
        ctx,
        path,
        &hint,
        &target,
        &analysis_dir.join(format!("{stem}_distorted.yuv")),
        "normalize",
    )?;
    let frames_total =
        count_raw_frames(normalized.path(), target.width, target.height, CANONICAL_PIX_FMT)?;

    let alignment = FrameAlignment::new(reference.info.frames, frames_total);
    if alignment.mismatch {
        warn!(
            label = %label,
            reference_frames = reference.info.frames,
            encoded_frames = frames_total,
            frames_used = alignment.frames_used,
            "frame count mismatch, scoring common prefix"
        );
    }

    let inputs = MetricInputs {
        distorted: normalized.path(),
        reference: reference.raw.path(),
        width: target.width,
        height: target.height,
        fps: target.fps,
        frame_limit: alignment.frame_limit(),
        label: &label,
    };
    let mut metrics = run_pair_metrics(ctx, &inputs, &metric_log_dir(analysis_dir))?;

    let (bitrate, frames_used) = if hint.is_raw() {
        let (w, h) = hint.geometry().unwrap_or((target.width, target.height));
        let pix_fmt = hint.pixel_format.as_deref().unwrap_or(CANONICAL_PIX_FMT);
        (
            profile_raw(w, h, pix_fmt, target.fps, alignment.frames_used),
            alignment.frames_used,
        )
    } else {
        profile_encoded(
            ctx,
            path,
            hint.format.demuxer(),
            target.fps,
            alignment.frames_used,
        )?
    };

    if (frames_used as usize) < metrics.frame_count() {
        metrics.truncate(frames_used as usize);
    }

    let (width, height) = hint.geometry().unwrap_or((target.width, target.height));
    let variant = EncodedVariant {
        label,
        codec: hint.codec.clone(),
        input_format: hint.format.label().to_string(),
        width,
        height,
        fps: hint.fps.unwrap_or(target.fps),
        scaled_to_reference: needs_scale(&hint, &target),
        frames_total,
        frames_used,
        frame_mismatch: alignment.mismatch || frames_used != reference.info.frames,
    };

    Ok(EncodedEntry {
        variant,
        point: input.point,
        metrics,
        bitrate,
        performance: input.performance.clone(),
    })
}

/// Score every input against a prepared reference
fn score_all(
    ctx: &RunContext,
    reference: &PreparedReference,
    inputs: &[VariantInput],
    analysis_dir: &Path,
    strict: bool,
) -> Result<BitstreamReport, AnalysisError> {
    let mut encoded = Vec::with_capacity(inputs.len());
    let mut errors = Vec::new();

    for input in inputs {
        match score_variant(ctx, reference, input, analysis_dir) {
            Ok(entry) => encoded.push(entry),
            Err(err) if strict => return Err(err),
            Err(err) => {
                let label = file_label(&input.path);
                warn!(label = %label, error = %err, "pair failed");
                errors.push(ErrorRecord::new(&reference.info.label, Some(&label), &err));
            }
        }
    }

    Ok(BitstreamReport {
        kind: "bitstream_analysis".to_string(),
        reference: reference.info.clone(),
        encoded,
        errors,
    })
}

/// Single-report mode: score `encoded` against `reference`.
///
/// `raw` describes the reference when it is a raw file. The reference is
/// normalized once; its temporary copy is removed when this returns.
pub fn build_bitstream_report(
    ctx: &RunContext,
    reference: &Path,
    encoded: &[PathBuf],
    analysis_dir: &Path,
    raw: Option<&RawParams>,
) -> Result<BitstreamReport, AnalysisError> {
    std::fs::create_dir_all(analysis_dir).map_err(|e| AnalysisError::io(analysis_dir, e))?;
    let prepared = prepare_reference(ctx, reference, raw, analysis_dir)?;
    let inputs: Vec<VariantInput> = encoded.iter().map(VariantInput::from_path).collect();
    score_all(ctx, &prepared, &inputs, analysis_dir, ctx.settings.strict)
}

/// Source stems in `dir`; two files sharing a stem would pair ambiguously
fn stems(dir: &Path) -> Result<BTreeSet<String>, AnalysisError> {
    let mut stems = BTreeSet::new();
    for file in list_source_files(dir)? {
        let Some(stem) = file.file_stem() else { continue };
        let stem = stem.to_string_lossy().into_owned();
        if stems.contains(&stem) {
            return Err(AnalysisError::DuplicateSourceStem {
                dir: dir.to_path_buf(),
                stem,
            });
        }
        stems.insert(stem);
    }
    Ok(stems)
}

fn option_name<T: fmt::Display>(value: Option<T>) -> String {
    value.map(|v| v.to_string()).unwrap_or_else(|| "none".to_string())
}

/// Checks that need no subprocess: template shape, rate control, points and
/// the source sets on both sides
pub fn check_comparison_preconditions(template: &Template) -> Result<(), AnalysisError> {
    template.validate()?;
    let anchor = &template.anchor;
    let test = template.test_side()?;

    if anchor.rate_control != test.rate_control {
        return Err(AnalysisError::RateControlMismatch {
            anchor: option_name(anchor.rate_control),
            test: option_name(test.rate_control),
        });
    }
    let (anchor_points, test_points) = (anchor.sorted_points(), test.sorted_points());
    if anchor_points != test_points {
        return Err(AnalysisError::BitratePointMismatch {
            anchor: anchor_points,
            test: test_points,
        });
    }

    let anchor_stems = stems(&anchor.source_dir)?;
    let test_stems = stems(&test.source_dir)?;
    if anchor_stems != test_stems {
        return Err(AnalysisError::SourceSetMismatch {
            anchor_only: anchor_stems.difference(&test_stems).cloned().collect(),
            test_only: test_stems.difference(&anchor_stems).cloned().collect(),
        });
    }
    Ok(())
}

fn sources_by_stem(
    ctx: &RunContext,
    side: &SideConfig,
) -> Result<BTreeMap<String, SourceInfo>, AnalysisError> {
    // Rejects ambiguous stems before anything is probed
    stems(&side.source_dir)?;
    Ok(collect_sources(ctx, &side.source_dir, &side.pixel_format)?
        .into_iter()
        .map(|s| (s.stem(), s))
        .collect())
}

fn encode_with_environment(
    ctx: &RunContext,
    side: &SideConfig,
    sources: &[SourceInfo],
    strict: bool,
) -> Result<(EncodeMatrix, EnvironmentInfo), AnalysisError> {
    let environment = EnvironmentInfo::capture();
    let mut matrix = encode_side(ctx, side, sources)?;
    if strict && !matrix.failures.is_empty() {
        let (_, _, err) = matrix.failures.remove(0);
        return Err(err);
    }
    Ok((matrix, environment))
}

fn variant_inputs(matrix: &EncodeMatrix, stem: &str) -> Vec<VariantInput> {
    matrix
        .points(stem)
        .iter()
        .map(|p| VariantInput {
            path: p.path.clone(),
            point: Some(p.value),
            performance: (!p.performance.is_empty()).then(|| p.performance.clone()),
        })
        .collect()
}

fn rd_points(report: &BitstreamReport) -> Vec<RdPoint> {
    report.encoded.iter().map(EncodedEntry::rd_point).collect()
}

/// Write `value` as JSON, creating parent directories
pub fn write_report<T: Serialize>(path: &Path, value: &T) -> Result<(), AnalysisError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| AnalysisError::io(parent, e))?;
    }
    let bytes = serde_json::to_vec_pretty(value).map_err(|e| AnalysisError::Report(e.to_string()))?;
    std::fs::write(path, bytes).map_err(|e| AnalysisError::io(path, e))?;
    info!(path = %path.display(), "report written");
    Ok(())
}

/// Anchor vs test comparison. Writes [`COMPARISON_REPORT`] under `work_dir`.
pub fn run_comparison(
    ctx: &RunContext,
    template: &Template,
    work_dir: &Path,
) -> Result<ComparisonReport, AnalysisError> {
    let strict = ctx.settings.strict || template.strict;
    let id = template.id.as_str();

    enter(Phase::CollectingSources, id);
    check_comparison_preconditions(template)?;
    let test = template.test_side()?;
    let anchor_sources = sources_by_stem(ctx, &template.anchor)?;
    let test_sources = sources_by_stem(ctx, test)?;

    // Both maps are keyed by stem and sorted, so the orders agree
    let ordered_anchor: Vec<SourceInfo> = anchor_sources.values().cloned().collect();
    let ordered_test: Vec<SourceInfo> = test_sources.values().cloned().collect();

    enter(Phase::Encoding, id);
    let (anchor_matrix, anchor_env) =
        encode_with_environment(ctx, &template.anchor, &ordered_anchor, strict)?;
    let (test_matrix, test_env) = encode_with_environment(ctx, test, &ordered_test, strict)?;

    let mut errors = anchor_matrix.error_records();
    errors.extend(test_matrix.error_records());

    enter(Phase::Scoring, id);
    let analysis_root = work_dir.join("analysis");
    let mut entries = Vec::with_capacity(ordered_anchor.len());

    for source in &ordered_anchor {
        let stem = source.stem();
        let analysis_dir = analysis_root.join(&stem);
        std::fs::create_dir_all(&analysis_dir).map_err(|e| AnalysisError::io(&analysis_dir, e))?;

        let reference = match prepare_reference(ctx, &source.path, source.raw_params().as_ref(), &analysis_dir) {
            Ok(r) => r,
            Err(err) if strict => return Err(err),
            Err(err) => {
                warn!(source = %source.file_name(), error = %err, "reference unusable, skipping source");
                errors.push(ErrorRecord::new(&source.file_name(), None, &err));
                continue;
            }
        };

        let anchor_report = score_all(
            ctx,
            &reference,
            &variant_inputs(&anchor_matrix, &stem),
            &analysis_dir.join("anchor"),
            strict,
        )?;
        let test_report = score_all(
            ctx,
            &reference,
            &variant_inputs(&test_matrix, &stem),
            &analysis_dir.join("test"),
            strict,
        )?;
        errors.extend(anchor_report.errors.iter().cloned());
        errors.extend(test_report.errors.iter().cloned());

        entries.push(ComparisonEntry {
            source: source.file_name(),
            anchor: anchor_report,
            test: test_report,
        });
    }

    enter(Phase::Aggregating, id);
    let bd_mode = BdMode::Auto;
    let bd_metrics = entries
        .iter()
        .map(|e| build_bd_record(&e.source, &rd_points(&e.anchor), &rd_points(&e.test), bd_mode))
        .collect();

    enter(Phase::WritingReport, id);
    let report = ComparisonReport {
        kind: "comparison".to_string(),
        template_id: template.id.clone(),
        template_name: template.name.clone(),
        anchor_fingerprint: template.anchor.fingerprint(),
        bd_mode,
        environment: SideEnvironments {
            anchor: anchor_env,
            test: test_env,
        },
        entries,
        bd_metrics,
        errors,
    };
    write_report(&work_dir.join(COMPARISON_REPORT), &report)?;
    Ok(report)
}

/// Single-side analysis of the anchor. Writes [`METRICS_REPORT`] under `work_dir`.
pub fn run_metrics_analysis(
    ctx: &RunContext,
    template: &Template,
    work_dir: &Path,
) -> Result<MetricsAnalysisReport, AnalysisError> {
    let strict = ctx.settings.strict || template.strict;
    let id = template.id.as_str();
    let side = &template.anchor;

    enter(Phase::CollectingSources, id);
    template.validate()?;
    let sources: Vec<SourceInfo> = sources_by_stem(ctx, side)?.into_values().collect();

    enter(Phase::Encoding, id);
    let (matrix, environment) = encode_with_environment(ctx, side, &sources, strict)?;
    let mut errors = matrix.error_records();

    enter(Phase::Scoring, id);
    let analysis_root = work_dir.join("metrics_analysis");
    let mut entries = Vec::with_capacity(sources.len());

    for source in &sources {
        let stem = source.stem();
        let analysis_dir = analysis_root.join(&stem);
        std::fs::create_dir_all(&analysis_dir).map_err(|e| AnalysisError::io(&analysis_dir, e))?;

        let reference = match prepare_reference(ctx, &source.path, source.raw_params().as_ref(), &analysis_dir) {
            Ok(r) => r,
            Err(err) if strict => return Err(err),
            Err(err) => {
                errors.push(ErrorRecord::new(&source.file_name(), None, &err));
                continue;
            }
        };
        let report = score_all(ctx, &reference, &variant_inputs(&matrix, &stem), &analysis_dir, strict)?;
        errors.extend(report.errors);
        entries.push(MetricsEntry {
            source: source.file_name(),
            reference: report.reference,
            encoded: report.encoded,
        });
    }

    enter(Phase::WritingReport, id);
    let report = MetricsAnalysisReport {
        kind: "metrics_analysis".to_string(),
        template_id: template.id.clone(),
        template_name: template.name.clone(),
        environment,
        entries,
        errors,
    };
    write_report(&work_dir.join(METRICS_REPORT), &report)?;
    Ok(report)
}

/// Run a template according to its kind
pub fn run_template(
    ctx: &RunContext,
    template: &Template,
    work_dir: &Path,
) -> Result<AnalysisReport, AnalysisError> {
    match template.kind {
        TemplateKind::Comparison => run_comparison(ctx, template, work_dir).map(AnalysisReport::Comparison),
        TemplateKind::MetricsAnalysis => {
            run_metrics_analysis(ctx, template, work_dir).map(AnalysisReport::MetricsAnalysis)
        }
    }
}
