mod bitrate;
mod context;
mod ffmpeg_info;
mod inspect;
mod logparse;
mod metrics;
mod normalize;
mod process;
mod scan;
mod types;

pub use bitrate::{profile_encoded, profile_from_frames, profile_raw};
pub use context::{AnalysisSettings, CommandSink, MemorySink, RunContext, Toolchain, TracingSink};
pub use ffmpeg_info::{encoder_version, ffmpeg_version, ffprobe_version, vmaf_filter_available};
pub use inspect::{FormatHint, InputFormat, elementary_demuxer, inspect, is_raw_path};
pub use logparse::{parse_log, parse_psnr, parse_ssim, parse_vmaf};
pub use metrics::{
    MetricInputs, MetricKind, PairMetrics, build_metric_cmd, build_metric_filter,
    escape_filter_path, metric_log_dir, run_metric, run_pair_metrics, select_vmaf_model,
};
pub use normalize::{
    FPS_TOLERANCE, NormalizeTarget, Normalized, TempArtifact, build_normalize_cmd,
    count_raw_frames, needs_scale, normalize, raw_frame_size, remove_best_effort,
};
pub use process::{ProcessError, ProcessOutput, format_command, run_command, run_command_with};
pub use scan::{collect_sources, list_source_files, parse_raw_name};
pub use types::{
    BitrateProfile, CANONICAL_PIX_FMT, CommandLogEntry, CommandStatus, EncodedVariant,
    FeatureSummary, MetricSeries, PerformanceSample, RawParams, SourceInfo,
};
