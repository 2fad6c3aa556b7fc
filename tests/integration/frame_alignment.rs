// Frame-count alignment between reference and encode

use ffbd::engine::analysis::FrameAlignment;
use ffbd::engine::probe::FrameRecord;
use ffbd::engine::{AnalysisSettings, MetricInputs, MetricKind, build_metric_cmd, profile_from_frames};
use std::path::Path;

use crate::common::assertions::*;
use crate::common::helpers::*;

fn inputs(frame_limit: Option<u64>) -> MetricInputs<'static> {
    MetricInputs {
        distorted: Path::new("/work/clip_crf_27_distorted.yuv"),
        reference: Path::new("/work/reference.yuv"),
        width: 1920,
        height: 1080,
        fps: 30.0,
        frame_limit,
        label: "clip_crf_27.h264",
    }
}

#[test]
fn test_shorter_encode_bounds_metric_passes() {
    let alignment = FrameAlignment::new(100, 98);
    assert_eq!(alignment.frames_used, 98);
    assert!(alignment.mismatch);

    let toolchain = missing_toolchain();
    let settings = AnalysisSettings::default();
    for kind in MetricKind::ALL {
        let cmd = cmd_to_string(&build_metric_cmd(
            &toolchain,
            &settings,
            kind,
            &inputs(alignment.frame_limit()),
            Path::new("/work/logs/psnr.log"),
        ));
        assert_cmd_contains(&cmd, "-frames:v 98");
        assert_cmd_contains(&cmd, "-s 1920x1080");
    }
}

#[test]
fn test_equal_lengths_need_no_bound() {
    let alignment = FrameAlignment::new(240, 240);
    assert!(!alignment.mismatch);
    assert_eq!(alignment.frame_limit(), None);

    let cmd = cmd_to_string(&build_metric_cmd(
        &missing_toolchain(),
        &AnalysisSettings::default(),
        MetricKind::Psnr,
        &inputs(alignment.frame_limit()),
        Path::new("/work/logs/psnr.log"),
    ));
    assert_cmd_not_contains(&cmd, "-frames:v");
}

#[test]
fn test_bitrate_profile_uses_aligned_frames() {
    let frames: Vec<FrameRecord> = (0..100)
        .map(|i| FrameRecord {
            pict_type: if i % 50 == 0 { "I" } else { "P" }.to_string(),
            pkt_size: if i % 50 == 0 { 5000 } else { 1000 },
            timestamp: Some(i as f64 / 25.0),
        })
        .collect();

    let alignment = FrameAlignment::new(100, 98);
    let (profile, used) = profile_from_frames(&frames, 25.0, alignment.frames_used);
    assert_eq!(used, 98);
    assert_eq!(profile.len(), 98);
    assert_eq!(profile.frame_types[50], "I");

    // 2 I frames + 96 P frames over 98 / 25 seconds
    let bytes = 2 * 5000 + 96 * 1000;
    let expected = (bytes as f64 * 8.0 / (98.0 / 25.0)).round() as u64;
    assert_eq!(profile.avg_bitrate_bps, expected);
    assert_close(profile.frame_timestamps[97], 97.0 / 25.0, 1e-9);
}
