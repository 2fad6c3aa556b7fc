use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Pixel format every normalized raw file is written in
pub const CANONICAL_PIX_FMT: &str = "yuv420p";

fn default_pix_fmt() -> String {
    CANONICAL_PIX_FMT.to_string()
}

/// Caller-supplied geometry for headerless raw inputs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawParams {
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    #[serde(default = "default_pix_fmt")]
    pub pixel_format: String,
}

impl RawParams {
    pub fn new(width: u32, height: u32, fps: f64) -> Self {
        Self {
            width,
            height,
            fps,
            pixel_format: default_pix_fmt(),
        }
    }
}

/// A discovered source file. Immutable once collected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceInfo {
    pub path: PathBuf,
    pub is_raw: bool,
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    pub pixel_format: String,
}

impl SourceInfo {
    /// File stem used to pair anchor and test sources
    pub fn stem(&self) -> String {
        self.path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    pub fn raw_params(&self) -> Option<RawParams> {
        self.is_raw.then(|| RawParams {
            width: self.width,
            height: self.height,
            fps: self.fps,
            pixel_format: self.pixel_format.clone(),
        })
    }
}

/// One scored encode (source x bitrate point x side)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncodedVariant {
    pub label: String,
    pub codec: Option<String>,
    pub input_format: String,
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    pub scaled_to_reference: bool,
    pub frames_total: u64,
    pub frames_used: u64,
    pub frame_mismatch: bool,
}

/// Mean and harmonic mean of one VMAF-family feature
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureSummary {
    pub mean: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub harmonic_mean: Option<f64>,
}

/// Parsed per-frame metric log
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricSeries {
    pub per_frame: BTreeMap<String, Vec<Option<f64>>>,
    pub summary: BTreeMap<String, Option<f64>>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub feature_summary: BTreeMap<String, FeatureSummary>,
}

impl MetricSeries {
    pub fn summary_value(&self, key: &str) -> Option<f64> {
        self.summary.get(key).copied().flatten()
    }

    /// Number of frames in the longest per-frame series
    pub fn frame_count(&self) -> usize {
        self.per_frame.values().map(Vec::len).max().unwrap_or(0)
    }
}

/// Per-frame rate statistics; all sequences share one length
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BitrateProfile {
    pub avg_bitrate_bps: u64,
    pub frame_types: Vec<String>,
    pub frame_sizes: Vec<u64>,
    pub frame_timestamps: Vec<f64>,
}

impl BitrateProfile {
    pub fn len(&self) -> usize {
        self.frame_sizes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frame_sizes.is_empty()
    }
}

/// Encoder performance measured while a bitstream was produced.
/// Every field is absent when the bitstream was reused from disk.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PerformanceSample {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encoding_fps: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avg_frame_time_ms: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_encoding_time_s: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_frames: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu_avg_percent: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu_max_percent: Option<f64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cpu_samples: Vec<f64>,
}

impl PerformanceSample {
    pub fn is_empty(&self) -> bool {
        self.encoding_fps.is_none()
            && self.avg_frame_time_ms.is_none()
            && self.total_encoding_time_s.is_none()
            && self.total_frames.is_none()
            && self.cpu_avg_percent.is_none()
            && self.cpu_max_percent.is_none()
            && self.cpu_samples.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl CommandStatus {
    fn rank(self) -> u8 {
        match self {
            CommandStatus::Pending => 0,
            CommandStatus::Running => 1,
            CommandStatus::Completed | CommandStatus::Failed => 2,
        }
    }

    pub fn is_terminal(self) -> bool {
        self.rank() == 2
    }
}

/// One subprocess invocation recorded against a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandLogEntry {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub command: String,
    pub status: CommandStatus,
    #[serde(default)]
    pub source_file: Option<String>,
    #[serde(default)]
    pub started_at: Option<DateTime<Local>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Local>>,
    #[serde(default)]
    pub error: Option<String>,
}

impl CommandLogEntry {
    pub fn new(id: String, kind: &str, command: &str, source_file: Option<&str>) -> Self {
        Self {
            id,
            kind: kind.to_string(),
            command: command.to_string(),
            status: CommandStatus::Pending,
            source_file: source_file.map(str::to_string),
            started_at: None,
            completed_at: None,
            error: None,
        }
    }

    /// Move to `status`. Regressions and changes after a terminal state are
    /// refused and return false.
    pub fn advance(&mut self, status: CommandStatus, error: Option<&str>) -> bool {
        if self.status.is_terminal() || status.rank() <= self.status.rank() {
            return false;
        }

        let now = Local::now();
        match status {
            CommandStatus::Running => self.started_at = Some(now),
            CommandStatus::Completed | CommandStatus::Failed => {
                if self.started_at.is_none() {
                    self.started_at = Some(now);
                }
                self.completed_at = Some(now);
            }
            CommandStatus::Pending => {}
        }
        self.status = status;
        if let Some(err) = error {
            self.error = Some(err.to_string());
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_status_never_regresses() {
        let mut entry = CommandLogEntry::new("1".into(), "psnr", "ffmpeg -i a", None);
        assert!(entry.advance(CommandStatus::Running, None));
        assert!(entry.started_at.is_some());
        assert!(!entry.advance(CommandStatus::Pending, None));
        assert!(entry.advance(CommandStatus::Failed, Some("exit 1")));
        assert!(!entry.advance(CommandStatus::Completed, None));
        assert_eq!(entry.status, CommandStatus::Failed);
        assert_eq!(entry.error.as_deref(), Some("exit 1"));
    }

    #[test]
    fn pending_can_jump_to_terminal() {
        let mut entry = CommandLogEntry::new("2".into(), "vmaf", "ffmpeg", Some("a.mp4"));
        assert!(entry.advance(CommandStatus::Failed, Some("spawn failed")));
        assert!(entry.started_at.is_some());
        assert!(entry.completed_at.is_some());
    }

    #[test]
    fn command_log_serializes_type_field() {
        let entry = CommandLogEntry::new("3".into(), "encode", "x265 --crf 28", None);
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["type"], "encode");
        assert_eq!(json["status"], "pending");
    }

    #[test]
    fn empty_performance_sample_serializes_to_empty_object() {
        let perf = PerformanceSample::default();
        assert!(perf.is_empty());
        assert_eq!(serde_json::to_string(&perf).unwrap(), "{}");
    }

    #[test]
    fn metric_series_lookup() {
        let mut series = MetricSeries::default();
        series
            .per_frame
            .insert("psnr_avg".into(), vec![Some(40.0), Some(41.0), Some(42.0)]);
        series.summary.insert("psnr_avg".into(), Some(41.0));
        series.summary.insert("psnr_y".into(), None);

        assert_eq!(series.frame_count(), 3);
        assert_eq!(series.summary_value("psnr_avg"), Some(41.0));
        assert_eq!(series.summary_value("psnr_y"), None);
        assert_eq!(series.summary_value("missing"), None);
    }
}
