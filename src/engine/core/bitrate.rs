// Frame/bitrate profiling of encoded streams

use std::path::Path;
use tracing::warn;

use super::context::RunContext;
use super::normalize::raw_frame_size;
use super::types::BitrateProfile;
use crate::engine::error::AnalysisError;
use crate::engine::probe::{FrameRecord, probe_frames};

fn average_bitrate(total_bytes: u64, frames: u64, fps: f64) -> u64 {
    if frames == 0 || fps <= 0.0 {
        return 0;
    }
    let duration = frames as f64 / fps;
    (total_bytes as f64 * 8.0 / duration).round() as u64
}

/// Profile of a raw input: constant frame size, type `RAW`, timestamps `i / fps`
pub fn profile_raw(
    width: u32,
    height: u32,
    pixel_format: &str,
    fps: f64,
    frames_used: u64,
) -> BitrateProfile {
    let frame_size = raw_frame_size(width, height, pixel_format).unwrap_or(0);
    let n = frames_used as usize;

    BitrateProfile {
        avg_bitrate_bps: average_bitrate(frame_size * frames_used, frames_used, fps),
        frame_types: vec!["RAW".to_string(); n],
        frame_sizes: vec![frame_size; n],
        frame_timestamps: (0..n).map(|i| i as f64 / fps).collect(),
    }
}

/// Build a profile from probed frames, truncated to `frames_used`.
///
/// Returns the profile and the effective frame count, which shrinks when the
/// stream yields fewer frames than requested.
pub fn profile_from_frames(
    frames: &[FrameRecord],
    fps: f64,
    frames_used: u64,
) -> (BitrateProfile, u64) {
    let used = (frames_used as usize).min(frames.len());
    let frames = &frames[..used];

    let frame_sizes: Vec<u64> = frames.iter().map(|f| f.pkt_size).collect();
    let total: u64 = frame_sizes.iter().sum();

    let profile = BitrateProfile {
        avg_bitrate_bps: average_bitrate(total, used as u64, fps),
        frame_types: frames.iter().map(|f| f.pict_type.clone()).collect(),
        frame_sizes,
        frame_timestamps: frames
            .iter()
            .enumerate()
            .map(|(i, f)| f.timestamp.unwrap_or(i as f64 / fps))
            .collect(),
    };
    (profile, used as u64)
}

/// Profile an encoded stream with `ffprobe -show_frames`
pub fn profile_encoded(
    ctx: &RunContext,
    path: &Path,
    demuxer: Option<&str>,
    fps: f64,
    frames_used: u64,
) -> Result<(BitrateProfile, u64), AnalysisError> {
    let frames = probe_frames(ctx, path, demuxer).map_err(|e| AnalysisError::UnreadableInput {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;

    if (frames.len() as u64) < frames_used {
        warn!(
            path = %path.display(),
            probed = frames.len(),
            expected = frames_used,
            "stream has fewer frames than scored, shrinking frame count"
        );
    }
    Ok(profile_from_frames(&frames, fps, frames_used))
}
