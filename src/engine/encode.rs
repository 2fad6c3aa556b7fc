//! Encode matrix: every source of a side at every rate-control point
//!
//! Each encoder is described by an [`EncoderStrategy`] entry that knows how to
//! build its command line, which flags carry rate control, which extension
//! its bitstreams use and how to read its closing summary from stderr.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{info, warn};

use super::core::{PerformanceSample, RunContext, SourceInfo, Toolchain, remove_best_effort};
use super::error::{AnalysisError, ErrorRecord};
use super::perf::{CpuSampler, EncoderSummary, performance_sample};
use super::template::{RateControl, SideConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EncoderKind {
    Ffmpeg,
    X264,
    X265,
    Vvenc,
}

impl EncoderKind {
    pub const ALL: [EncoderKind; 4] = [
        EncoderKind::Ffmpeg,
        EncoderKind::X264,
        EncoderKind::X265,
        EncoderKind::Vvenc,
    ];

    pub fn as_str(&self) -> &'static str {
        self.strategy().name
    }

    pub fn strategy(&self) -> &'static EncoderStrategy {
        match self {
            EncoderKind::Ffmpeg => &STRATEGIES[0],
            EncoderKind::X264 => &STRATEGIES[1],
            EncoderKind::X265 => &STRATEGIES[2],
            EncoderKind::Vvenc => &STRATEGIES[3],
        }
    }
}

impl fmt::Display for EncoderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything a command builder needs for one point
#[derive(Debug)]
pub struct EncodeRequest<'a> {
    pub source: &'a SourceInfo,
    /// User parameters with rate-control flags already removed
    pub params: Vec<String>,
    pub rate_args: Vec<String>,
    pub output: &'a Path,
}

/// Per-encoder behavior table entry
pub struct EncoderStrategy {
    pub name: &'static str,
    /// Standalone encoders only read raw frames
    pub needs_raw_input: bool,
    /// Flags (taking one value) removed from user parameters
    pub rate_flags: &'static [&'static str],
    pub build: fn(&Toolchain, &EncodeRequest) -> Command,
    pub rate_args: fn(RateControl, &str) -> Vec<String>,
    pub extension: fn(&[String]) -> &'static str,
    pub parse_summary: fn(&str) -> EncoderSummary,
}

impl fmt::Debug for EncoderStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncoderStrategy")
            .field("name", &self.name)
            .field("needs_raw_input", &self.needs_raw_input)
            .finish_non_exhaustive()
    }
}

static STRATEGIES: [EncoderStrategy; 4] = [
    EncoderStrategy {
        name: "ffmpeg",
        needs_raw_input: false,
        rate_flags: &["-crf", "-b:v", "--crf", "--bitrate"],
        build: build_ffmpeg,
        rate_args: ffmpeg_rate_args,
        extension: ffmpeg_extension,
        parse_summary: parse_ffmpeg_summary,
    },
    EncoderStrategy {
        name: "x264",
        needs_raw_input: true,
        rate_flags: &["--crf", "--bitrate", "-B", "--qp", "-q"],
        build: build_x264,
        rate_args: x26x_rate_args,
        extension: h264_extension,
        parse_summary: parse_encoded_summary,
    },
    EncoderStrategy {
        name: "x265",
        needs_raw_input: true,
        rate_flags: &["--crf", "--bitrate", "--qp", "-q"],
        build: build_x265,
        rate_args: x26x_rate_args,
        extension: h265_extension,
        parse_summary: parse_encoded_summary,
    },
    EncoderStrategy {
        name: "vvenc",
        needs_raw_input: true,
        rate_flags: &["--qp", "-q", "--bitrate", "-b"],
        build: build_vvenc,
        rate_args: vvenc_rate_args,
        extension: h266_extension,
        parse_summary: parse_encoded_summary,
    },
];

fn ffmpeg_rate_args(rc: RateControl, value: &str) -> Vec<String> {
    match rc {
        RateControl::Crf => vec!["-crf".into(), value.into()],
        RateControl::Abr => vec!["-b:v".into(), format!("{value}k")],
    }
}

fn x26x_rate_args(rc: RateControl, value: &str) -> Vec<String> {
    match rc {
        RateControl::Crf => vec!["--crf".into(), value.into()],
        RateControl::Abr => vec!["--bitrate".into(), value.into()],
    }
}

fn vvenc_rate_args(rc: RateControl, value: &str) -> Vec<String> {
    match rc {
        RateControl::Crf => vec!["--qp".into(), value.into()],
        RateControl::Abr => vec!["--bitrate".into(), format!("{value}k")],
    }
}

fn h264_extension(_: &[String]) -> &'static str {
    ".h264"
}

fn h265_extension(_: &[String]) -> &'static str {
    ".h265"
}

fn h266_extension(_: &[String]) -> &'static str {
    ".h266"
}

/// Pick the elementary-stream extension from the `-c:v` codec in the params
fn ffmpeg_extension(params: &[String]) -> &'static str {
    let codec = params
        .windows(2)
        .find(|w| matches!(w[0].as_str(), "-c:v" | "-vcodec" | "-codec:v"))
        .map(|w| w[1].to_ascii_lowercase())
        .unwrap_or_default();

    if codec.contains("265") || codec.contains("hevc") {
        ".h265"
    } else if codec.contains("vvc") || codec.contains("266") {
        ".h266"
    } else {
        ".h264"
    }
}

fn fps_arg(fps: f64) -> String {
    format_point_value(fps)
}

fn build_ffmpeg(toolchain: &Toolchain, req: &EncodeRequest) -> Command {
    let src = req.source;
    let mut cmd = toolchain.ffmpeg();
    cmd.arg("-hide_banner").arg("-y");
    if src.is_raw {
        cmd.args(["-f", "rawvideo", "-pix_fmt", src.pixel_format.as_str()])
            .arg("-s:v")
            .arg(format!("{}x{}", src.width, src.height))
            .arg("-r")
            .arg(fps_arg(src.fps));
    }
    cmd.arg("-i").arg(&src.path);
    cmd.args(&req.params);
    cmd.args(&req.rate_args);
    cmd.arg(req.output);
    cmd
}

/// Colourspace name and bit depth for the standalone encoders' raw readers
fn raw_csp(pixel_format: &str) -> (&'static str, u8) {
    let depth = if pixel_format.ends_with("p10le") { 10 } else { 8 };
    let csp = match pixel_format.trim_end_matches("10le") {
        "yuv422p" => "i422",
        "yuv444p" => "i444",
        "nv12" => "nv12",
        _ => "i420",
    };
    (csp, depth)
}

fn build_x264(toolchain: &Toolchain, req: &EncodeRequest) -> Command {
    let src = req.source;
    let (csp, depth) = raw_csp(&src.pixel_format);
    let mut cmd = Command::new(&toolchain.x264);
    cmd.arg("--input-res")
        .arg(format!("{}x{}", src.width, src.height))
        .arg("--input-csp")
        .arg(csp)
        .arg("--input-depth")
        .arg(depth.to_string())
        .arg("--fps")
        .arg(fps_arg(src.fps));
    cmd.args(&req.params);
    cmd.args(&req.rate_args);
    cmd.arg("-o").arg(req.output).arg(&src.path);
    cmd
}

fn build_x265(toolchain: &Toolchain, req: &EncodeRequest) -> Command {
    let src = req.source;
    let (csp, depth) = raw_csp(&src.pixel_format);
    let mut cmd = Command::new(&toolchain.x265);
    cmd.arg("--input")
        .arg(&src.path)
        .arg("--input-res")
        .arg(format!("{}x{}", src.width, src.height))
        .arg("--input-csp")
        .arg(csp)
        .arg("--input-depth")
        .arg(depth.to_string())
        .arg("--fps")
        .arg(fps_arg(src.fps));
    cmd.args(&req.params);
    cmd.args(&req.rate_args);
    cmd.arg("--output").arg(req.output);
    cmd
}

fn build_vvenc(toolchain: &Toolchain, req: &EncodeRequest) -> Command {
    let src = req.source;
    let format = if src.pixel_format.ends_with("p10le") {
        "yuv420_10"
    } else {
        "yuv420"
    };
    let mut cmd = Command::new(&toolchain.vvenc);
    cmd.arg("-i")
        .arg(&src.path)
        .arg("-s")
        .arg(format!("{}x{}", src.width, src.height))
        .arg("-r")
        .arg(fps_arg(src.fps))
        .arg("--format")
        .arg(format);
    cmd.args(&req.params);
    cmd.args(&req.rate_args);
    cmd.arg("-o").arg(req.output);
    cmd
}

/// Parse the leading number of `s` (digits and dots)
fn leading_number(s: &str) -> Option<&str> {
    let s = s.trim_start();
    let end = s
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(s.len());
    (end > 0).then(|| &s[..end])
}

/// Last `frame= N ... fps= F` progress record
pub fn parse_ffmpeg_summary(stderr: &str) -> EncoderSummary {
    let record = stderr
        .split(['\r', '\n'])
        .rev()
        .find_map(|line| {
            let (_, after_frame) = line.split_once("frame=")?;
            let frames: u64 = leading_number(after_frame)?.parse().ok()?;
            let (_, after_fps) = after_frame.split_once("fps=")?;
            let fps: f64 = leading_number(after_fps)?.parse().ok()?;
            Some((frames, fps))
        });

    match record {
        Some((frames, fps)) => EncoderSummary {
            frames: Some(frames),
            fps: Some(fps),
            elapsed_s: (fps > 0.0).then(|| frames as f64 / fps),
        },
        None => EncoderSummary::default(),
    }
}

/// Closing line of the standalone encoders:
/// x264 `encoded N frames, F fps, ...`, x265/vvenc `encoded N frames in Ts (F fps)`
pub fn parse_encoded_summary(stderr: &str) -> EncoderSummary {
    stderr
        .lines()
        .rev()
        .find_map(|line| {
            let (_, rest) = line.split_once("encoded ")?;
            let tokens: Vec<&str> = rest.split_whitespace().collect();
            let frames: u64 = tokens.first()?.parse().ok()?;
            if !tokens.get(1)?.starts_with("frames") {
                return None;
            }

            if tokens.get(2) == Some(&"in") {
                let elapsed: f64 = tokens.get(3)?.trim_end_matches('s').parse().ok()?;
                let fps: f64 = leading_number(tokens.get(4)?.trim_start_matches('('))?
                    .parse()
                    .ok()?;
                Some(EncoderSummary {
                    frames: Some(frames),
                    fps: Some(fps),
                    elapsed_s: Some(elapsed),
                })
            } else {
                let fps: f64 = leading_number(tokens.get(2)?)?.parse().ok()?;
                Some(EncoderSummary {
                    frames: Some(frames),
                    fps: Some(fps),
                    elapsed_s: (fps > 0.0).then(|| frames as f64 / fps),
                })
            }
        })
        .unwrap_or_default()
}

/// `22.0` -> `22`, `1500.5` -> `1500.5`
pub fn format_point_value(value: f64) -> String {
    let s = value.to_string();
    match s.split_once('.') {
        Some((int, frac)) if frac.bytes().all(|b| b == b'0') => int.to_string(),
        _ => s,
    }
}

/// Cached-bitstream stem: `{source-stem}_{rc}_{value}`
pub fn output_stem(source_stem: &str, rc: Option<RateControl>, value: f64) -> String {
    let rc = rc.map(|r| r.as_str()).unwrap_or("rc");
    format!("{}_{}_{}", source_stem, rc, format_point_value(value))
}

/// Shell-split `params` and drop `flags` with their values (`--crf 22`, `--crf=22`)
pub fn split_params(params: &str, flags: &[&str]) -> Result<Vec<String>, AnalysisError> {
    let tokens = shlex::split(params).ok_or_else(|| {
        AnalysisError::InvalidTemplate(format!("cannot parse encoder parameters: {params}"))
    })?;

    let mut kept = Vec::with_capacity(tokens.len());
    let mut skip_next = false;
    for token in tokens {
        if skip_next {
            skip_next = false;
            continue;
        }
        if flags.contains(&token.as_str()) {
            skip_next = true;
            continue;
        }
        if token
            .split_once('=')
            .is_some_and(|(flag, _)| flags.contains(&flag))
        {
            continue;
        }
        kept.push(token);
    }
    Ok(kept)
}

/// First file in `dir` named `{stem}.*`, in name order
pub fn find_bitstream(dir: &Path, stem: &str) -> Option<PathBuf> {
    let prefix = format!("{stem}.");
    let mut matches: Vec<PathBuf> = std::fs::read_dir(dir)
        .ok()?
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_ok_and(|t| t.is_file()))
        .filter(|e| e.file_name().to_string_lossy().starts_with(&prefix))
        .map(|e| e.path())
        .collect();
    matches.sort();
    matches.into_iter().next()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncodedPoint {
    pub value: f64,
    pub path: PathBuf,
    /// Empty when the bitstream was reused
    pub performance: PerformanceSample,
}

/// Result of encoding one side: points per source stem plus per-point failures
#[derive(Debug, Default)]
pub struct EncodeMatrix {
    pub outputs: BTreeMap<String, Vec<EncodedPoint>>,
    /// `(source stem, point label, error)` in encounter order
    pub failures: Vec<(String, String, AnalysisError)>,
}

impl EncodeMatrix {
    pub fn points(&self, stem: &str) -> &[EncodedPoint] {
        self.outputs.get(stem).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn error_records(&self) -> Vec<ErrorRecord> {
        self.failures
            .iter()
            .map(|(source, label, err)| ErrorRecord::new(source, Some(label), err))
            .collect()
    }

    fn fail(&mut self, source: &str, label: &str, err: AnalysisError) {
        warn!(source, point = label, error = %err, "encode point failed");
        self.failures
            .push((source.to_string(), label.to_string(), err));
    }
}

/// Produce (or locate) the bitstream for every source × point of `side`.
///
/// A failed point is recorded and its siblings continue. Fails as a whole
/// only when the template itself is unusable or the bitstream directory
/// cannot be created.
pub fn encode_side(
    ctx: &RunContext,
    side: &SideConfig,
    sources: &[SourceInfo],
) -> Result<EncodeMatrix, AnalysisError> {
    let dir = &side.bitstream_dir;
    std::fs::create_dir_all(dir).map_err(|e| AnalysisError::io(dir, e))?;

    let strategy = match (side.skip_encode, side.encoder) {
        (true, _) => None,
        (false, Some(kind)) => Some(kind.strategy()),
        (false, None) => {
            return Err(AnalysisError::InvalidTemplate(
                "encoder required when not skipping encode".into(),
            ));
        }
    };
    let params = match strategy {
        Some(s) => split_params(side.encoder_params.as_deref().unwrap_or(""), s.rate_flags)?,
        None => Vec::new(),
    };

    let mut matrix = EncodeMatrix::default();
    for source in sources {
        let source_stem = source.stem();
        let mut points = Vec::with_capacity(side.bitrate_points.len());

        for &value in &side.bitrate_points {
            let stem = output_stem(&source_stem, side.rate_control, value);

            let Some(strategy) = strategy else {
                match find_bitstream(dir, &stem) {
                    Some(path) => points.push(EncodedPoint {
                        value,
                        path,
                        performance: PerformanceSample::default(),
                    }),
                    None => matrix.fail(
                        &source_stem,
                        &stem,
                        AnalysisError::MissingBitstream {
                            stem: stem.clone(),
                            dir: dir.clone(),
                        },
                    ),
                }
                continue;
            };

            let output = dir.join(format!("{}{}", stem, (strategy.extension)(&params)));
            if output.is_file() {
                info!(path = %output.display(), "reusing existing bitstream");
                points.push(EncodedPoint {
                    value,
                    path: output,
                    performance: PerformanceSample::default(),
                });
                continue;
            }

            match encode_point(ctx, strategy, side, source, &params, value, &output) {
                Ok(performance) => points.push(EncodedPoint {
                    value,
                    path: output,
                    performance,
                }),
                Err(err) => matrix.fail(&source_stem, &stem, err),
            }
        }
        matrix.outputs.insert(source_stem, points);
    }
    Ok(matrix)
}

fn encode_point(
    ctx: &RunContext,
    strategy: &EncoderStrategy,
    side: &SideConfig,
    source: &SourceInfo,
    params: &[String],
    value: f64,
    output: &Path,
) -> Result<PerformanceSample, AnalysisError> {
    if strategy.needs_raw_input && !source.is_raw {
        return Err(AnalysisError::EncodeFailed {
            output: output.to_path_buf(),
            reason: format!("{} only accepts raw sources", strategy.name),
        });
    }

    let rc = side.rate_control.unwrap_or(RateControl::Crf);
    let request = EncodeRequest {
        source,
        params: params.to_vec(),
        rate_args: (strategy.rate_args)(rc, &format_point_value(value)),
        output,
    };
    let mut cmd = (strategy.build)(&ctx.toolchain, &request);

    let interval = ctx.settings.cpu_sample_interval;
    let file_name = source.file_name();
    let result = ctx.execute_with("encode", Some(&file_name), &mut cmd, |pid| {
        CpuSampler::start(pid, interval)
    });

    match result {
        Ok((out, sampler)) => {
            let cpu = sampler.stop();
            let summary = (strategy.parse_summary)(&out.stderr);
            Ok(performance_sample(summary, out.elapsed, cpu))
        }
        Err(e) => {
            remove_best_effort(output);
            Err(AnalysisError::EncodeFailed {
                output: output.to_path_buf(),
                reason: e.to_string(),
            })
        }
    }
}
