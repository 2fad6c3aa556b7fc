// Comparison preconditions are decided before any subprocess runs

use ffbd::engine::AnalysisError;
use ffbd::engine::analysis::{check_comparison_preconditions, run_comparison, run_metrics_analysis};
use ffbd::engine::template::{RateControl, TemplateKind};
use tempfile::TempDir;

use crate::common::helpers::*;

#[test]
fn test_source_set_mismatch_runs_nothing() {
    let tmp = TempDir::new().unwrap();
    let anchor_src = tmp.path().join("anchor_src");
    let test_src = tmp.path().join("test_src");
    write_raw_sources(&anchor_src, &["clip1", "clip2"]);
    write_raw_sources(&test_src, &["clip1", "clip3"]);

    let template = comparison_template(
        encoding_side(&anchor_src, &tmp.path().join("anchor_out")),
        encoding_side(&test_src, &tmp.path().join("test_out")),
    );
    let (ctx, sink) = recording_context(missing_toolchain());

    let err = run_comparison(&ctx, &template, tmp.path()).unwrap_err();
    match &err {
        AnalysisError::SourceSetMismatch {
            anchor_only,
            test_only,
        } => {
            assert_eq!(anchor_only, &vec!["clip2_16x16_30".to_string()]);
            assert_eq!(test_only, &vec!["clip3_16x16_30".to_string()]);
        }
        other => panic!("expected source set mismatch, got {other:?}"),
    }
    assert!(err.is_precondition());
    assert!(sink.entries().is_empty(), "no command should have been queued");
    assert!(!tmp.path().join("anchor_out").exists());
}

#[test]
fn test_rate_control_mismatch() {
    let tmp = TempDir::new().unwrap();
    let src = tmp.path().join("src");
    write_raw_sources(&src, &["clip1"]);

    let mut test = encoding_side(&src, &tmp.path().join("test_out"));
    test.rate_control = Some(RateControl::Abr);
    test.bitrate_points = vec![1000.0, 2000.0, 4000.0, 8000.0];
    let template = comparison_template(encoding_side(&src, &tmp.path().join("anchor_out")), test);

    let err = check_comparison_preconditions(&template).unwrap_err();
    assert!(matches!(err, AnalysisError::RateControlMismatch { .. }));
    assert_eq!(err.kind(), "rate_control_mismatch");
}

#[test]
fn test_point_sets_compare_unordered() {
    let tmp = TempDir::new().unwrap();
    let src = tmp.path().join("src");
    write_raw_sources(&src, &["clip1", "clip2"]);

    let anchor = encoding_side(&src, &tmp.path().join("anchor_out"));
    let mut test = encoding_side(&src, &tmp.path().join("test_out"));
    test.bitrate_points.reverse();
    test.encoder_params = Some("-c:v libx265 -preset fast".to_string());

    // Different encoders on each side are fine as long as the sets match
    assert!(check_comparison_preconditions(&comparison_template(anchor.clone(), test.clone())).is_ok());

    test.bitrate_points.push(42.0);
    let err = check_comparison_preconditions(&comparison_template(anchor, test)).unwrap_err();
    match err {
        AnalysisError::BitratePointMismatch { anchor, test } => {
            assert_eq!(anchor, vec![22.0, 27.0, 32.0, 37.0]);
            assert_eq!(test, vec![22.0, 27.0, 32.0, 37.0, 42.0]);
        }
        other => panic!("expected point mismatch, got {other:?}"),
    }
}

#[test]
fn test_same_stem_with_two_extensions_is_rejected() {
    let tmp = TempDir::new().unwrap();
    let src = tmp.path().join("src");
    write_raw_sources(&src, &["clip1", "clip2"]);
    std::fs::write(src.join("clip1_16x16_30.y4m"), b"YUV4MPEG2 W16 H16 F30:1\n").unwrap();

    let template = comparison_template(
        encoding_side(&src, &tmp.path().join("anchor_out")),
        encoding_side(&src, &tmp.path().join("test_out")),
    );
    let err = check_comparison_preconditions(&template).unwrap_err();
    match &err {
        AnalysisError::DuplicateSourceStem { dir, stem } => {
            assert_eq!(dir, &src);
            assert_eq!(stem, "clip1_16x16_30");
        }
        other => panic!("expected duplicate stem, got {other:?}"),
    }
    assert!(err.is_precondition());

    // Single-side analysis rejects it too, without probing anything
    let mut single = template.clone();
    single.kind = TemplateKind::MetricsAnalysis;
    single.test = None;
    let (ctx, sink) = recording_context(missing_toolchain());
    let err = run_metrics_analysis(&ctx, &single, tmp.path()).unwrap_err();
    assert_eq!(err.kind(), "duplicate_source_stem");
    assert!(sink.entries().is_empty());
}
