use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use super::context::RunContext;
use super::inspect::{inspect, is_raw_path};
use super::types::SourceInfo;
use crate::engine::error::AnalysisError;

fn is_hidden(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.starts_with('.'))
}

/// List the regular, non-hidden files directly inside `dir`, sorted by name.
/// No file is opened or probed.
pub fn list_source_files(dir: &Path) -> Result<Vec<PathBuf>, AnalysisError> {
    if !dir.is_dir() {
        return Err(AnalysisError::UnreadableInput {
            path: dir.to_path_buf(),
            reason: "source directory not found".to_string(),
        });
    }

    let mut files: Vec<PathBuf> = WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .follow_links(false)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file() && !is_hidden(e.path()))
        .map(|e| e.into_path())
        .collect();
    files.sort();

    if files.is_empty() {
        return Err(AnalysisError::UnreadableInput {
            path: dir.to_path_buf(),
            reason: "source directory is empty".to_string(),
        });
    }
    Ok(files)
}

/// Parse `name_WxH_FPS` (the stem of a raw source) into width, height and fps
pub fn parse_raw_name(stem: &str) -> Option<(u32, u32, f64)> {
    let mut parts = stem.rsplitn(3, '_');
    let fps_part = parts.next()?;
    let geometry = parts.next()?;
    parts.next()?;

    let (w, h) = geometry.split_once('x')?;
    if !is_digits(w) || !is_digits(h) {
        return None;
    }

    let fps_valid = match fps_part.split_once('.') {
        Some((int, frac)) => is_digits(int) && is_digits(frac),
        None => is_digits(fps_part),
    };
    if !fps_valid {
        return None;
    }

    let width: u32 = w.parse().ok()?;
    let height: u32 = h.parse().ok()?;
    let fps: f64 = fps_part.parse().ok()?;
    (width > 0 && height > 0 && fps > 0.0).then_some((width, height, fps))
}

fn is_digits(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit())
}

/// Describe every source in `dir`.
///
/// Raw sources carry their geometry in the file name; everything else is
/// probed and must report width, height and frame rate.
pub fn collect_sources(
    ctx: &RunContext,
    dir: &Path,
    pixel_format: &str,
) -> Result<Vec<SourceInfo>, AnalysisError> {
    list_source_files(dir)?
        .into_iter()
        .map(|path| describe_source(ctx, path, pixel_format))
        .collect()
}

fn describe_source(
    ctx: &RunContext,
    path: PathBuf,
    pixel_format: &str,
) -> Result<SourceInfo, AnalysisError> {
    if is_raw_path(&path) {
        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let (width, height, fps) =
            parse_raw_name(&stem).ok_or_else(|| AnalysisError::MissingRawParameters(path.clone()))?;
        return Ok(SourceInfo {
            path,
            is_raw: true,
            width,
            height,
            fps,
            pixel_format: pixel_format.to_string(),
        });
    }

    let hint = inspect(ctx, &path, None)?;
    match (hint.geometry(), hint.fps) {
        (Some((width, height)), Some(fps)) if fps > 0.0 => Ok(SourceInfo {
            path,
            is_raw: false,
            width,
            height,
            fps,
            pixel_format: hint
                .pixel_format
                .unwrap_or_else(|| pixel_format.to_string()),
        }),
        _ => Err(AnalysisError::UnreadableInput {
            path,
            reason: "cannot determine resolution and frame rate".to_string(),
        }),
    }
}
