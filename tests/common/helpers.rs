#![allow(dead_code)]

use ffbd::engine::encode::EncoderKind;
use ffbd::engine::template::{RateControl, SideConfig, Template, TemplateKind};
use ffbd::engine::{AnalysisSettings, MemorySink, RunContext, Toolchain};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;

/// Convert a Command to a string for assertions
pub fn cmd_to_string(cmd: &Command) -> String {
    let program = cmd.get_program().to_string_lossy();
    let args: Vec<String> = cmd
        .get_args()
        .map(|arg| arg.to_string_lossy().to_string())
        .collect();

    format!("{} {}", program, args.join(" "))
}

/// Toolchain whose binaries do not exist; any subprocess would fail
pub fn missing_toolchain() -> Toolchain {
    Toolchain::in_dir(Path::new("/nonexistent/ffbd-tools"))
}

/// Context recording commands in memory, plus the sink to inspect them
pub fn recording_context(toolchain: Toolchain) -> (RunContext, Arc<MemorySink>) {
    let sink = Arc::new(MemorySink::new());
    let ctx = RunContext::new(toolchain, AnalysisSettings::default(), sink.clone());
    (ctx, sink)
}

/// Write small placeholder raw sources named `stem_16x16_30.yuv`
pub fn write_raw_sources(dir: &Path, stems: &[&str]) -> Vec<PathBuf> {
    std::fs::create_dir_all(dir).unwrap();
    stems
        .iter()
        .map(|stem| {
            let path = dir.join(format!("{stem}_16x16_30.yuv"));
            // Two 16x16 yuv420p frames
            std::fs::write(&path, vec![128u8; 16 * 16 * 3 / 2 * 2]).unwrap();
            path
        })
        .collect()
}

pub fn encoding_side(source_dir: &Path, bitstream_dir: &Path) -> SideConfig {
    SideConfig {
        skip_encode: false,
        source_dir: source_dir.to_path_buf(),
        encoder: Some(EncoderKind::Ffmpeg),
        encoder_params: Some("-c:v libx264 -preset veryfast".to_string()),
        rate_control: Some(RateControl::Crf),
        bitrate_points: vec![22.0, 27.0, 32.0, 37.0],
        bitstream_dir: bitstream_dir.to_path_buf(),
        pixel_format: "yuv420p".to_string(),
    }
}

pub fn comparison_template(anchor: SideConfig, test: SideConfig) -> Template {
    Template {
        id: "cmp-1".to_string(),
        name: "preset comparison".to_string(),
        kind: TemplateKind::Comparison,
        anchor,
        test: Some(test),
        strict: false,
    }
}

/// Stand-in ffprobe: stream info for any input, `-show_frames` yields 98
/// frames of 100 bytes (96 for `clip_short.h264`)
#[cfg(unix)]
const FAKE_FFPROBE: &str = r#"#!/bin/sh
show_frames=0
last=""
for a in "$@"; do
  [ "$a" = "-show_frames" ] && show_frames=1
  last="$a"
done
case "$last" in
  *clip_short.h264) n=96 ;;
  *) n=98 ;;
esac
if [ "$show_frames" = 1 ]; then
  printf '{"frames":['
  i=0
  while [ "$i" -lt "$n" ]; do
    [ "$i" -gt 0 ] && printf ','
    printf '{"pict_type":"P","pkt_size":"100","best_effort_timestamp_time":"%s"}' "$i"
    i=$((i + 1))
  done
  printf ']}\n'
else
  printf '{"streams":[{"codec_type":"video","codec_name":"h264","width":16,"height":16,"r_frame_rate":"30/1"}],"format":{}}\n'
fi
"#;

/// Stand-in ffmpeg: a decode writes 98 blank 16x16 yuv420p frames; a metric
/// pass writes one log line per frame with frame `i` scoring psnr `30 + i`,
/// ssim 0.9 and vmaf `i + 1`
#[cfg(unix)]
const FAKE_FFMPEG: &str = r#"#!/bin/sh
prev=""
filter=""
frames=""
last=""
for a in "$@"; do
  case "$prev" in
    -filter_complex) filter="$a" ;;
    -frames:v) frames="$a" ;;
  esac
  prev="$a"
  last="$a"
done
if [ -z "$filter" ]; then
  dd if=/dev/zero of="$last" bs=384 count=98 2>/dev/null
  exit 0
fi
n=${frames:-98}
case "$filter" in
  psnr=stats_file=*)
    log="${filter#psnr=stats_file=}"
    : > "$log"
    i=0
    while [ "$i" -lt "$n" ]; do
      v=$((30 + i))
      echo "n:$((i + 1)) mse_avg:1.00 psnr_avg:$v.00 psnr_y:$v.00 psnr_u:$v.00 psnr_v:$v.00" >> "$log"
      i=$((i + 1))
    done ;;
  ssim=stats_file=*)
    log="${filter#ssim=stats_file=}"
    : > "$log"
    i=0
    while [ "$i" -lt "$n" ]; do
      echo "n:$((i + 1)) Y:0.900000 U:0.900000 V:0.900000 All:0.900000 (10.000000)" >> "$log"
      i=$((i + 1))
    done ;;
  *log_path=*)
    log="${filter##*log_path=}"
    echo "Frame,vmaf,vmaf_neg," > "$log"
    i=0
    while [ "$i" -lt "$n" ]; do
      echo "$i,$((i + 1)).000000,$((i + 1)).000000," >> "$log"
      i=$((i + 1))
    done ;;
  *) exit 1 ;;
esac
"#;

/// Toolchain backed by the stand-in ffmpeg/ffprobe scripts written to `dir`
#[cfg(unix)]
pub fn scripted_toolchain(dir: &Path) -> Toolchain {
    use std::os::unix::fs::PermissionsExt;

    std::fs::create_dir_all(dir).unwrap();
    for (name, body) in [("ffmpeg", FAKE_FFMPEG), ("ffprobe", FAKE_FFPROBE)] {
        let path = dir.join(name);
        std::fs::write(&path, body).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }
    Toolchain::in_dir(dir)
}

/// A 16x16 yuv420p raw file of `frames` blank frames
pub fn write_raw_frames(path: &Path, frames: usize) {
    std::fs::write(path, vec![128u8; 16 * 16 * 3 / 2 * frames]).unwrap();
}
