// Format inspection: decide how ffmpeg should read an arbitrary input

use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::debug;

use super::context::RunContext;
use super::types::RawParams;
use crate::engine::error::AnalysisError;
use crate::engine::probe::{StreamInfo, probe_stream};

/// Extensions that mark headerless raw YUV
const RAW_EXTENSIONS: &[&str] = &["yuv", "raw"];

/// Extensions trusted to be elementary streams, with the demuxer to force
const ELEMENTARY_EXTENSIONS: &[(&str, &str)] = &[
    ("h264", "h264"),
    ("264", "h264"),
    ("avc", "h264"),
    ("h265", "hevc"),
    ("265", "hevc"),
    ("hevc", "hevc"),
    ("h266", "vvc"),
    ("266", "vvc"),
    ("vvc", "vvc"),
];

/// Demuxers tried in order when container probing gives no geometry.
/// The reported codec must match the demuxer for the candidate to win.
const CANDIDATE_DEMUXERS: &[(&str, &str)] = &[("h264", "h264"), ("hevc", "hevc"), ("vvc", "vvc")];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "demuxer", rename_all = "snake_case")]
pub enum InputFormat {
    /// Headerless raw frames described by caller parameters
    Raw,
    /// Elementary stream read with a forced demuxer
    Elementary(String),
    /// Anything ffprobe understands on its own
    Container,
}

impl InputFormat {
    /// Demuxer to pass with `-f`, if any
    pub fn demuxer(&self) -> Option<&str> {
        match self {
            InputFormat::Elementary(d) => Some(d),
            _ => None,
        }
    }

    /// Label used in reports
    pub fn label(&self) -> &str {
        match self {
            InputFormat::Raw => "rawvideo",
            InputFormat::Elementary(d) => d,
            InputFormat::Container => "auto",
        }
    }
}

/// What the inspector learned about an input
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FormatHint {
    pub format: InputFormat,
    pub codec: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub fps: Option<f64>,
    pub pixel_format: Option<String>,
    pub frames: Option<u64>,
}

impl FormatHint {
    fn from_stream(format: InputFormat, info: StreamInfo) -> Self {
        Self {
            format,
            codec: info.codec,
            width: info.width,
            height: info.height,
            fps: info.fps,
            pixel_format: None,
            frames: info.frames,
        }
    }

    fn raw(params: &RawParams) -> Self {
        Self {
            format: InputFormat::Raw,
            codec: None,
            width: Some(params.width),
            height: Some(params.height),
            fps: Some(params.fps),
            pixel_format: Some(params.pixel_format.clone()),
            frames: None,
        }
    }

    pub fn is_raw(&self) -> bool {
        self.format == InputFormat::Raw
    }

    pub fn geometry(&self) -> Option<(u32, u32)> {
        match (self.width, self.height) {
            (Some(w), Some(h)) if w > 0 && h > 0 => Some((w, h)),
            _ => None,
        }
    }
}

fn extension(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
}

/// True for `.yuv` / `.raw` inputs, which are never probed
pub fn is_raw_path(path: &Path) -> bool {
    extension(path).is_some_and(|ext| RAW_EXTENSIONS.contains(&ext.as_str()))
}

/// Demuxer implied by an elementary-stream extension
pub fn elementary_demuxer(path: &Path) -> Option<&'static str> {
    let ext = extension(path)?;
    ELEMENTARY_EXTENSIONS
        .iter()
        .find(|(e, _)| *e == ext)
        .map(|(_, demuxer)| *demuxer)
}

fn ensure_readable(path: &Path) -> Result<(), AnalysisError> {
    let meta = std::fs::metadata(path).map_err(|e| AnalysisError::UnreadableInput {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;

    if !meta.is_file() {
        return Err(AnalysisError::UnreadableInput {
            path: path.to_path_buf(),
            reason: "not a regular file".to_string(),
        });
    }
    if meta.len() == 0 {
        return Err(AnalysisError::UnreadableInput {
            path: path.to_path_buf(),
            reason: "file is empty".to_string(),
        });
    }
    Ok(())
}

/// Infer how to read `path`.
///
/// # Arguments
/// * `raw` - geometry for `.yuv`/`.raw` inputs; required for those, ignored otherwise
pub fn inspect(
    ctx: &RunContext,
    path: &Path,
    raw: Option<&RawParams>,
) -> Result<FormatHint, AnalysisError> {
    if is_raw_path(path) {
        let params = raw.ok_or_else(|| AnalysisError::MissingRawParameters(path.to_path_buf()))?;
        ensure_readable(path)?;
        return Ok(FormatHint::raw(params));
    }

    ensure_readable(path)?;

    if let Some(demuxer) = elementary_demuxer(path) {
        let info = probe_stream(ctx, path, Some(demuxer)).map_err(|e| {
            AnalysisError::UnreadableInput {
                path: path.to_path_buf(),
                reason: e.to_string(),
            }
        })?;
        return Ok(FormatHint::from_stream(
            InputFormat::Elementary(demuxer.to_string()),
            info,
        ));
    }

    match probe_stream(ctx, path, None) {
        Ok(info) if info.geometry().is_some() => {
            return Ok(FormatHint::from_stream(InputFormat::Container, info));
        }
        Ok(_) => debug!(path = %path.display(), "container probe gave no geometry"),
        Err(e) => debug!(path = %path.display(), error = %e, "container probe failed"),
    }

    for &(demuxer, codec) in CANDIDATE_DEMUXERS {
        match probe_stream(ctx, path, Some(demuxer)) {
            Ok(info) if info.geometry().is_some() && info.codec.as_deref() == Some(codec) => {
                debug!(path = %path.display(), demuxer, "accepted forced demuxer");
                return Ok(FormatHint::from_stream(
                    InputFormat::Elementary(demuxer.to_string()),
                    info,
                ));
            }
            _ => continue,
        }
    }

    Err(AnalysisError::UnrecognizedFormat(path.to_path_buf()))
}
