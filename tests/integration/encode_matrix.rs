// Encode matrix behavior that does not need a working encoder

use ffbd::engine::encode::{EncoderKind, encode_side};
use ffbd::engine::{CommandStatus, SourceInfo};
use tempfile::TempDir;

use crate::common::helpers::*;

fn raw_source(path: std::path::PathBuf) -> SourceInfo {
    SourceInfo {
        path,
        is_raw: true,
        width: 16,
        height: 16,
        fps: 30.0,
        pixel_format: "yuv420p".to_string(),
    }
}

#[test]
fn test_existing_bitstreams_are_reused() {
    let tmp = TempDir::new().unwrap();
    let sources = write_raw_sources(&tmp.path().join("src"), &["clip1"]);
    let out = tmp.path().join("out");
    std::fs::create_dir_all(&out).unwrap();
    for crf in [22, 27, 32, 37] {
        std::fs::write(out.join(format!("clip1_16x16_30_crf_{crf}.h264")), b"bits").unwrap();
    }

    let side = encoding_side(&tmp.path().join("src"), &out);
    let (ctx, sink) = recording_context(missing_toolchain());
    let matrix = encode_side(&ctx, &side, &[raw_source(sources[0].clone())]).unwrap();

    let points = matrix.points("clip1_16x16_30");
    assert_eq!(points.len(), 4);
    assert!(points.iter().all(|p| p.performance.is_empty()));
    assert_eq!(points[1].value, 27.0);
    assert!(matrix.failures.is_empty());
    assert!(sink.entries().is_empty(), "reused points must not run the encoder");
}

#[test]
fn test_skip_encode_reports_missing_bitstreams() {
    let tmp = TempDir::new().unwrap();
    let sources = write_raw_sources(&tmp.path().join("src"), &["clip1"]);
    let out = tmp.path().join("provided");
    std::fs::create_dir_all(&out).unwrap();
    std::fs::write(out.join("clip1_16x16_30_crf_22.hevc"), b"bits").unwrap();
    std::fs::write(out.join("clip1_16x16_30_crf_32.mp4"), b"bits").unwrap();

    let mut side = encoding_side(&tmp.path().join("src"), &out);
    side.skip_encode = true;
    side.encoder = None;
    side.encoder_params = None;

    let (ctx, sink) = recording_context(missing_toolchain());
    let matrix = encode_side(&ctx, &side, &[raw_source(sources[0].clone())]).unwrap();

    let found: Vec<f64> = matrix.points("clip1_16x16_30").iter().map(|p| p.value).collect();
    assert_eq!(found, vec![22.0, 32.0]);

    let records = matrix.error_records();
    assert_eq!(records.len(), 2);
    assert!(records.iter().all(|r| r.kind == "missing_bitstream"));
    assert_eq!(records[0].label.as_deref(), Some("clip1_16x16_30_crf_27"));
    assert_eq!(records[1].label.as_deref(), Some("clip1_16x16_30_crf_37"));
    assert!(sink.entries().is_empty());
}

#[test]
fn test_failed_encode_continues_with_siblings() {
    let tmp = TempDir::new().unwrap();
    let sources = write_raw_sources(&tmp.path().join("src"), &["clip1", "clip2"]);
    let out = tmp.path().join("out");

    let mut side = encoding_side(&tmp.path().join("src"), &out);
    side.encoder = Some(EncoderKind::Ffmpeg);
    side.bitrate_points = vec![27.0];

    let (ctx, sink) = recording_context(missing_toolchain());
    let sources: Vec<SourceInfo> = sources.into_iter().map(raw_source).collect();
    let matrix = encode_side(&ctx, &side, &sources).unwrap();

    let records = matrix.error_records();
    assert_eq!(records.len(), 2, "every point is attempted");
    assert!(records.iter().all(|r| r.kind == "encode_failed"));
    assert_eq!(records[0].source, "clip1_16x16_30");
    assert_eq!(records[1].source, "clip2_16x16_30");

    let entries = sink.entries();
    assert_eq!(entries.len(), 2);
    assert!(entries.iter().all(|e| e.kind == "encode" && e.status == CommandStatus::Failed));
    assert!(entries[0].command.contains("-crf 27"));
}
