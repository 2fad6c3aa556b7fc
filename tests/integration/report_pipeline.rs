// Bitstream reports end to end against scripted ffmpeg/ffprobe stand-ins

#![cfg(unix)]

use ffbd::engine::RawParams;
use ffbd::engine::analysis::{EncodedEntry, build_bitstream_report};
use tempfile::TempDir;

use crate::common::assertions::*;
use crate::common::helpers::*;

struct Fixture {
    tmp: TempDir,
    reference: std::path::PathBuf,
}

/// 100-frame raw reference next to two encodes that decode to 98 frames
fn fixture() -> Fixture {
    let tmp = TempDir::new().unwrap();
    let reference = tmp.path().join("ref_16x16_30.yuv");
    write_raw_frames(&reference, 100);
    for name in ["clip_full.h264", "clip_short.h264"] {
        std::fs::write(tmp.path().join(name), b"\x00\x00\x00\x01stream").unwrap();
    }
    Fixture { tmp, reference }
}

fn entry<'a>(entries: &'a [EncodedEntry], label: &str) -> &'a EncodedEntry {
    entries
        .iter()
        .find(|e| e.variant.label == label)
        .unwrap_or_else(|| panic!("no entry for {label}"))
}

fn assert_series_len(entry: &EncodedEntry, frames: usize) {
    for series in [&entry.metrics.psnr, &entry.metrics.ssim, &entry.metrics.vmaf] {
        for (key, values) in &series.per_frame {
            assert_eq!(values.len(), frames, "{} series {key}", entry.variant.label);
        }
    }
    assert_eq!(entry.bitrate.len(), frames);
    assert_eq!(entry.bitrate.frame_types.len(), frames);
    assert_eq!(entry.bitrate.frame_timestamps.len(), frames);
}

#[test]
fn test_shorter_encode_scores_common_prefix() {
    let fx = fixture();
    let (ctx, sink) = recording_context(scripted_toolchain(&fx.tmp.path().join("bin")));
    let analysis_dir = fx.tmp.path().join("analysis");

    let report = build_bitstream_report(
        &ctx,
        &fx.reference,
        &[fx.tmp.path().join("clip_full.h264")],
        &analysis_dir,
        Some(&RawParams::new(16, 16, 30.0)),
    )
    .unwrap();

    assert!(report.errors.is_empty(), "{:?}", report.errors);
    assert_eq!(report.reference.frames, 100);
    let full = entry(&report.encoded, "clip_full.h264");
    assert_eq!(full.variant.frames_total, 98);
    assert_eq!(full.variant.frames_used, 98);
    assert!(full.variant.frame_mismatch);
    assert_eq!(full.variant.input_format, "h264");
    assert_series_len(full, 98);

    // psnr 30..=127, vmaf 1..=98
    assert_close(full.metrics.summary_value("psnr_avg").unwrap(), 78.5, 1e-9);
    assert_close(full.metrics.summary_value("ssim_avg").unwrap(), 0.9, 1e-9);
    assert_close(full.metrics.summary_value("vmaf_mean").unwrap(), 49.5, 1e-9);
    // 100 bytes per frame at 30 fps
    assert_eq!(full.bitrate.avg_bitrate_bps, 24_000);

    // Every metric pass was bounded to the common prefix
    let passes: Vec<_> = sink
        .entries()
        .into_iter()
        .filter(|e| ["psnr", "ssim", "vmaf"].contains(&e.kind.as_str()))
        .collect();
    assert_eq!(passes.len(), 3);
    for pass in &passes {
        assert_cmd_contains(&pass.command, "-frames:v 98");
    }

    // Intermediate files are gone, the raw reference is left alone
    assert!(!analysis_dir.join("clip_full_distorted.yuv").exists());
    assert!(fx.reference.is_file());
}

#[test]
fn test_fewer_probed_frames_recompute_summaries() {
    let fx = fixture();
    let (ctx, _sink) = recording_context(scripted_toolchain(&fx.tmp.path().join("bin")));

    let report = build_bitstream_report(
        &ctx,
        &fx.reference,
        &[
            fx.tmp.path().join("clip_full.h264"),
            fx.tmp.path().join("clip_short.h264"),
        ],
        &fx.tmp.path().join("analysis"),
        Some(&RawParams::new(16, 16, 30.0)),
    )
    .unwrap();
    assert_eq!(report.encoded.len(), 2);

    // 98 frames scored, only 96 survive the packet probe
    let short = entry(&report.encoded, "clip_short.h264");
    assert_eq!(short.variant.frames_total, 98);
    assert_eq!(short.variant.frames_used, 96);
    assert!(short.variant.frame_mismatch);
    assert_series_len(short, 96);

    // Summaries describe the 96 frames kept, not the 98 scored
    assert_close(short.metrics.summary_value("psnr_avg").unwrap(), 77.5, 1e-9);
    assert_close(short.metrics.summary_value("psnr_y").unwrap(), 77.5, 1e-9);
    assert_close(short.metrics.summary_value("vmaf_mean").unwrap(), 48.5, 1e-9);
    assert_close(short.metrics.summary_value("vmaf_neg_mean").unwrap(), 48.5, 1e-9);
    let harmonic = 96.0 / (1..=96).map(|k| 1.0 / k as f64).sum::<f64>();
    assert_close(
        short.metrics.summary_value("vmaf_harmonic_mean").unwrap(),
        harmonic,
        1e-9,
    );
    assert_close(short.metrics.vmaf.feature_summary["vmaf"].mean, 48.5, 1e-9);

    let full = entry(&report.encoded, "clip_full.h264");
    assert_close(full.metrics.summary_value("psnr_avg").unwrap(), 78.5, 1e-9);
}
