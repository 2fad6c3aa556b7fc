// Raw normalization: bring any input to planar yuv420p at the reference geometry

use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{debug, warn};

use super::context::{RunContext, Toolchain};
use super::inspect::FormatHint;
use super::types::CANONICAL_PIX_FMT;
use crate::engine::error::AnalysisError;

/// Frame-rate difference tolerated before the input is overridden to the target rate
pub const FPS_TOLERANCE: f64 = 0.01;

/// Bytes per frame for common planar/semi-planar raw layouts
pub fn raw_frame_size(width: u32, height: u32, pixel_format: &str) -> Option<u64> {
    let luma = width as u64 * height as u64;
    if luma == 0 {
        return None;
    }

    let (size, bytes_per_sample) = match pixel_format {
        "yuv420p" | "nv12" | "nv21" => (luma * 3 / 2, 1),
        "yuv422p" | "nv16" => (luma * 2, 1),
        "yuv444p" => (luma * 3, 1),
        "gray" => (luma, 1),
        "yuv420p10le" | "p010le" => (luma * 3 / 2, 2),
        "yuv422p10le" => (luma * 2, 2),
        "yuv444p10le" => (luma * 3, 2),
        "gray10le" => (luma, 2),
        _ => return None,
    };
    Some(size * bytes_per_sample)
}

/// Number of whole frames in a raw file
pub fn count_raw_frames(
    path: &Path,
    width: u32,
    height: u32,
    pixel_format: &str,
) -> Result<u64, AnalysisError> {
    let frame_size = raw_frame_size(width, height, pixel_format).ok_or_else(|| {
        AnalysisError::UnreadableInput {
            path: path.to_path_buf(),
            reason: format!("unsupported raw layout {pixel_format} at {width}x{height}"),
        }
    })?;

    let size = std::fs::metadata(path)
        .map_err(|e| AnalysisError::io(path, e))?
        .len();

    if size % frame_size != 0 {
        return Err(AnalysisError::RawSizeMismatch {
            path: path.to_path_buf(),
            size,
            frame_size,
        });
    }
    Ok(size / frame_size)
}

/// A file this run produced and must remove. Deleted on drop; failures are
/// logged and never surface as errors.
#[derive(Debug)]
pub struct TempArtifact {
    path: PathBuf,
}

impl TempArtifact {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for TempArtifact {
    fn drop(&mut self) {
        remove_best_effort(&self.path);
    }
}

/// Remove a file, logging (not returning) any failure other than "already gone"
pub fn remove_best_effort(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => debug!(path = %path.display(), "removed temporary file"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "failed to remove temporary file"),
    }
}

/// Raw yuv420p input to the metric filters
#[derive(Debug)]
pub enum Normalized {
    /// The input already matched; used in place and never deleted
    Borrowed(PathBuf),
    /// Produced by a decode/scale pass, deleted when dropped
    Temporary(TempArtifact),
}

impl Normalized {
    pub fn path(&self) -> &Path {
        match self {
            Normalized::Borrowed(p) => p,
            Normalized::Temporary(t) => t.path(),
        }
    }
}

/// Geometry and rate every normalized stream must share
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NormalizeTarget {
    pub width: u32,
    pub height: u32,
    pub fps: f64,
}

/// True when the input has known geometry that differs from the target
pub fn needs_scale(hint: &FormatHint, target: &NormalizeTarget) -> bool {
    hint.geometry()
        .is_some_and(|(w, h)| w != target.width || h != target.height)
}

fn fps_mismatch(hint: &FormatHint, target: &NormalizeTarget) -> Option<f64> {
    hint.fps
        .filter(|fps| (fps - target.fps).abs() > FPS_TOLERANCE)
}

/// Build the decode/scale command writing raw yuv420p to `output`
pub fn build_normalize_cmd(
    toolchain: &Toolchain,
    input: &Path,
    hint: &FormatHint,
    target: &NormalizeTarget,
    output: &Path,
) -> Command {
    let mut cmd = toolchain.ffmpeg();
    cmd.args(["-hide_banner", "-y"]);

    if hint.is_raw() {
        let (w, h) = hint
            .geometry()
            .unwrap_or((target.width, target.height));
        let pix_fmt = hint.pixel_format.as_deref().unwrap_or(CANONICAL_PIX_FMT);
        // Raw input is reinterpreted at the target rate
        cmd.args(["-f", "rawvideo", "-pix_fmt", pix_fmt])
            .arg("-s")
            .arg(format!("{w}x{h}"))
            .arg("-r")
            .arg(target.fps.to_string());
    } else if let Some(demuxer) = hint.format.demuxer() {
        cmd.args(["-f", demuxer]);
    }

    cmd.arg("-i").arg(input);
    cmd.args(["-an", "-sn"]);

    let mut filters = Vec::new();
    if hint.geometry() != Some((target.width, target.height)) {
        filters.push(format!("scale={}:{}", target.width, target.height));
    }
    filters.push(format!("format={CANONICAL_PIX_FMT}"));
    cmd.arg("-vf").arg(filters.join(","));

    // Passthrough timing so no frames are duplicated or dropped
    cmd.args(["-vsync", "0"]);
    cmd.args(["-f", "rawvideo", "-pix_fmt", CANONICAL_PIX_FMT]);
    cmd.arg(output);
    cmd
}

/// Normalize `input` to raw yuv420p at `target`.
///
/// Raw inputs already at the target geometry and pixel format are borrowed
/// as-is. Everything else is decoded into `out_path`, which the returned
/// value owns.
pub fn normalize(
    ctx: &RunContext,
    input: &Path,
    hint: &FormatHint,
    target: &NormalizeTarget,
    out_path: &Path,
    kind: &str,
) -> Result<Normalized, AnalysisError> {
    if let Some(fps) = fps_mismatch(hint, target) {
        warn!(
            input = %input.display(),
            input_fps = fps,
            reference_fps = target.fps,
            "frame rate differs from reference, overriding to reference rate"
        );
    }

    let canonical = hint
        .pixel_format
        .as_deref()
        .is_none_or(|p| p == CANONICAL_PIX_FMT);
    if hint.is_raw() && canonical && hint.geometry() == Some((target.width, target.height)) {
        debug!(input = %input.display(), "raw input already normalized");
        return Ok(Normalized::Borrowed(input.to_path_buf()));
    }

    if let Some(parent) = out_path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| AnalysisError::io(parent, e))?;
    }

    // Owns the output from here so a failed decode leaves nothing behind
    let artifact = TempArtifact::new(out_path);
    let mut cmd = build_normalize_cmd(&ctx.toolchain, input, hint, target, out_path);
    let source = input.display().to_string();

    ctx.execute(kind, Some(&source), &mut cmd)
        .map_err(|e| AnalysisError::DecodeFailed {
            path: input.to_path_buf(),
            reason: e.to_string(),
        })?;

    Ok(Normalized::Temporary(artifact))
}
