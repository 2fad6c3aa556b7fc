// Error taxonomy for analysis runs

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

use super::core::ProcessError;

/// Failure while probing a file with ffprobe
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("ffprobe failed: {0}")]
    Process(#[from] ProcessError),

    #[error("Failed to parse ffprobe JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("No video stream found in {0}")]
    NoVideoStream(PathBuf),
}

#[derive(Debug, Error)]
pub enum AnalysisError {
    // Preconditions: raised before any encoder runs
    #[error("Anchor and test source sets differ (anchor only: {anchor_only:?}, test only: {test_only:?})")]
    SourceSetMismatch {
        anchor_only: Vec<String>,
        test_only: Vec<String>,
    },

    #[error("Source directory {dir} has more than one file with stem '{stem}'")]
    DuplicateSourceStem { dir: PathBuf, stem: String },

    #[error("Raw input {0} needs width, height and fps")]
    MissingRawParameters(PathBuf),

    #[error("Rate control differs between anchor ({anchor}) and test ({test})")]
    RateControlMismatch { anchor: String, test: String },

    #[error("Bitrate points differ between anchor {anchor:?} and test {test:?}")]
    BitratePointMismatch { anchor: Vec<f64>, test: Vec<f64> },

    #[error("Invalid template: {0}")]
    InvalidTemplate(String),

    // Per (source, point) pair
    #[error("Cannot read input {path}: {reason}")]
    UnreadableInput { path: PathBuf, reason: String },

    #[error("Could not recognize the format of {0}")]
    UnrecognizedFormat(PathBuf),

    #[error("{metric} computation failed for {label}: {reason}")]
    MetricComputationFailed {
        metric: String,
        label: String,
        reason: String,
    },

    #[error("Metric log {0} contains no frame records")]
    EmptyMetricLog(PathBuf),

    #[error("Encoding {output} failed: {reason}")]
    EncodeFailed { output: PathBuf, reason: String },

    #[error("No bitstream matching {stem}.* in {dir}")]
    MissingBitstream { stem: String, dir: PathBuf },

    #[error("Decoding {path} to raw failed: {reason}")]
    DecodeFailed { path: PathBuf, reason: String },

    #[error("Raw file {path} is {size} bytes, not a multiple of the {frame_size}-byte frame")]
    RawSizeMismatch {
        path: PathBuf,
        size: u64,
        frame_size: u64,
    },

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write report: {0}")]
    Report(String),
}

impl AnalysisError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        AnalysisError::Io {
            path: path.into(),
            source,
        }
    }

    /// True for failures that abort a run before any subprocess starts
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            AnalysisError::SourceSetMismatch { .. }
                | AnalysisError::DuplicateSourceStem { .. }
                | AnalysisError::MissingRawParameters(_)
                | AnalysisError::RateControlMismatch { .. }
                | AnalysisError::BitratePointMismatch { .. }
                | AnalysisError::InvalidTemplate(_)
        )
    }

    /// Short machine-readable name used in report error lists
    pub fn kind(&self) -> &'static str {
        match self {
            AnalysisError::SourceSetMismatch { .. } => "source_set_mismatch",
            AnalysisError::DuplicateSourceStem { .. } => "duplicate_source_stem",
            AnalysisError::MissingRawParameters(_) => "missing_raw_parameters",
            AnalysisError::RateControlMismatch { .. } => "rate_control_mismatch",
            AnalysisError::BitratePointMismatch { .. } => "bitrate_point_mismatch",
            AnalysisError::InvalidTemplate(_) => "invalid_template",
            AnalysisError::UnreadableInput { .. } => "unreadable_input",
            AnalysisError::UnrecognizedFormat(_) => "unrecognized_format",
            AnalysisError::MetricComputationFailed { .. } => "metric_computation_failed",
            AnalysisError::EmptyMetricLog(_) => "empty_metric_log",
            AnalysisError::EncodeFailed { .. } => "encode_failed",
            AnalysisError::MissingBitstream { .. } => "missing_bitstream",
            AnalysisError::DecodeFailed { .. } => "decode_failed",
            AnalysisError::RawSizeMismatch { .. } => "raw_size_mismatch",
            AnalysisError::Io { .. } => "io",
            AnalysisError::Report(_) => "report",
        }
    }
}

/// A per-pair failure as it appears in reports
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub source: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    pub kind: String,
    pub message: String,
}

impl ErrorRecord {
    pub fn new(source: &str, label: Option<&str>, err: &AnalysisError) -> Self {
        Self {
            source: source.to_string(),
            label: label.map(str::to_string),
            kind: err.kind().to_string(),
            message: err.to_string(),
        }
    }
}
