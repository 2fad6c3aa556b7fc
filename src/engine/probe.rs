// Input probing using ffprobe

use serde::{Deserialize, Serialize};
use std::path::Path;

use super::core::RunContext;
use super::error::ProbeError;

/// Video stream properties reported by ffprobe. Any field may be missing for
/// headerless elementary streams.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamInfo {
    pub codec: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub fps: Option<f64>,
    pub frames: Option<u64>,
    pub duration: Option<f64>,
}

impl StreamInfo {
    /// Width and height when both are known and non-zero
    pub fn geometry(&self) -> Option<(u32, u32)> {
        match (self.width, self.height) {
            (Some(w), Some(h)) if w > 0 && h > 0 => Some((w, h)),
            _ => None,
        }
    }
}

/// One decoded frame as seen by `ffprobe -show_frames`
#[derive(Debug, Clone, PartialEq)]
pub struct FrameRecord {
    pub pict_type: String,
    pub pkt_size: u64,
    pub timestamp: Option<f64>,
}

/// Probe the first video stream of `path`, optionally forcing a demuxer
pub fn probe_stream(
    ctx: &RunContext,
    path: &Path,
    forced_demuxer: Option<&str>,
) -> Result<StreamInfo, ProbeError> {
    let mut cmd = ctx.toolchain.ffprobe();
    cmd.args(["-v", "error", "-print_format", "json"]);
    if let Some(fmt) = forced_demuxer {
        cmd.args(["-f", fmt]);
    }
    cmd.args(["-show_format", "-show_streams", "-select_streams", "v:0"])
        .arg(path);

    let source = path.display().to_string();
    let output = ctx.execute("probe", Some(&source), &mut cmd)?;
    parse_stream_info(&output.stdout, path)
}

/// Parse `-show_streams -show_format` JSON into a [`StreamInfo`]
pub fn parse_stream_info(json: &str, path: &Path) -> Result<StreamInfo, ProbeError> {
    let json: serde_json::Value = serde_json::from_str(json)?;

    let stream = json["streams"]
        .as_array()
        .and_then(|streams| {
            streams
                .iter()
                .find(|s| s["codec_type"].as_str().is_none_or(|t| t == "video"))
        })
        .ok_or_else(|| ProbeError::NoVideoStream(path.to_path_buf()))?;

    let fps = ["r_frame_rate", "avg_frame_rate"]
        .iter()
        .filter_map(|key| stream[*key].as_str())
        .filter_map(parse_fraction)
        .find(|fps| *fps > 0.0);

    let frames = stream["nb_frames"]
        .as_str()
        .and_then(|s| s.parse::<u64>().ok())
        .or_else(|| stream["nb_frames"].as_u64());

    let duration = json["format"]["duration"]
        .as_str()
        .or_else(|| stream["duration"].as_str())
        .and_then(|s| s.parse::<f64>().ok());

    Ok(StreamInfo {
        codec: stream["codec_name"].as_str().map(str::to_string),
        width: stream["width"].as_u64().map(|w| w as u32),
        height: stream["height"].as_u64().map(|h| h as u32),
        fps,
        frames,
        duration,
    })
}

/// Read per-frame picture type, packet size and timestamp
pub fn probe_frames(
    ctx: &RunContext,
    path: &Path,
    forced_demuxer: Option<&str>,
) -> Result<Vec<FrameRecord>, ProbeError> {
    let mut cmd = ctx.toolchain.ffprobe();
    cmd.args(["-v", "quiet", "-print_format", "json"]);
    if let Some(fmt) = forced_demuxer {
        cmd.args(["-f", fmt]);
    }
    cmd.args([
        "-select_streams",
        "v:0",
        "-show_frames",
        "-show_entries",
        "frame=pict_type,pkt_size,best_effort_timestamp_time,pkt_pts_time",
    ])
    .arg(path);

    let source = path.display().to_string();
    let output = ctx.execute("probe_frames", Some(&source), &mut cmd)?;
    parse_frames(&output.stdout)
}

#[derive(Debug, Deserialize)]
struct FramesOutput {
    #[serde(default)]
    frames: Vec<RawFrame>,
}

#[derive(Debug, Deserialize)]
struct RawFrame {
    pict_type: Option<String>,
    pkt_size: Option<String>,
    best_effort_timestamp_time: Option<String>,
    pkt_pts_time: Option<String>,
}

/// Parse `-show_frames` JSON. Missing picture types become `UNK`.
pub fn parse_frames(json: &str) -> Result<Vec<FrameRecord>, ProbeError> {
    let output: FramesOutput = serde_json::from_str(json)?;

    Ok(output
        .frames
        .into_iter()
        .map(|f| FrameRecord {
            pict_type: f
                .pict_type
                .filter(|t| !t.is_empty())
                .unwrap_or_else(|| "UNK".to_string()),
            pkt_size: f.pkt_size.and_then(|s| s.parse().ok()).unwrap_or(0),
            timestamp: f
                .best_effort_timestamp_time
                .and_then(|s| s.parse().ok())
                .or_else(|| f.pkt_pts_time.and_then(|s| s.parse().ok())),
        })
        .collect())
}

/// Parse a fraction string like "30000/1001" to f64
pub fn parse_fraction(s: &str) -> Option<f64> {
    let (num, den) = s.split_once('/')?;

    let numerator: f64 = num.trim().parse().ok()?;
    let denominator: f64 = den.trim().parse().ok()?;

    if denominator == 0.0 {
        return None;
    }

    Some(numerator / denominator)
}
