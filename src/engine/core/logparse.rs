// Parsers for psnr/ssim stats files and libvmaf logs

use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;

use super::metrics::MetricKind;
use super::types::{FeatureSummary, MetricSeries};
use crate::engine::error::AnalysisError;

/// Read and parse a metric log. A log with no frame records is an error.
pub fn parse_log(path: &Path, kind: MetricKind) -> Result<MetricSeries, AnalysisError> {
    let bytes = std::fs::read(path).map_err(|e| AnalysisError::io(path, e))?;
    let text = String::from_utf8_lossy(&bytes);

    let series = match kind {
        MetricKind::Psnr => parse_psnr(&text),
        MetricKind::Ssim => parse_ssim(&text),
        MetricKind::Vmaf => parse_vmaf(&text),
    };

    if series.frame_count() == 0 {
        return Err(AnalysisError::EmptyMetricLog(path.to_path_buf()));
    }
    Ok(series)
}

fn mean(values: &[Option<f64>]) -> Option<f64> {
    let finite: Vec<f64> = values.iter().flatten().copied().filter(|v| v.is_finite()).collect();
    if finite.is_empty() {
        return None;
    }
    Some(finite.iter().sum::<f64>() / finite.len() as f64)
}

/// Plain harmonic mean over the positive scores
fn harmonic_mean(values: &[Option<f64>]) -> Option<f64> {
    let positive: Vec<f64> = values
        .iter()
        .flatten()
        .copied()
        .filter(|v| v.is_finite() && *v > 0.0)
        .collect();
    if positive.is_empty() {
        return None;
    }
    let denom: f64 = positive.iter().map(|v| 1.0 / v).sum();
    Some(positive.len() as f64 / denom)
}

/// Cut every per-frame series to `frames` and recompute the summaries from
/// what is left
pub fn truncate_series(series: &mut MetricSeries, kind: MetricKind, frames: usize) {
    let mut per_frame = std::mem::take(&mut series.per_frame);
    for values in per_frame.values_mut() {
        values.truncate(frames);
    }
    *series = summarize(kind, per_frame);
}

fn summarize(kind: MetricKind, per_frame: BTreeMap<String, Vec<Option<f64>>>) -> MetricSeries {
    let mut series = MetricSeries::default();
    match kind {
        MetricKind::Psnr | MetricKind::Ssim => {
            for (key, values) in &per_frame {
                series.summary.insert(key.clone(), mean(values));
            }
        }
        MetricKind::Vmaf => {
            for model in ["vmaf", "vmaf_neg"] {
                let values = per_frame.get(model).map(Vec::as_slice).unwrap_or(&[]);
                series.summary.insert(format!("{model}_mean"), mean(values));
                series
                    .summary
                    .insert(format!("{model}_harmonic_mean"), harmonic_mean(values));
            }
            for (feature, values) in &per_frame {
                if let Some(m) = mean(values) {
                    series.feature_summary.insert(
                        feature.clone(),
                        FeatureSummary {
                            mean: m,
                            harmonic_mean: harmonic_mean(values),
                        },
                    );
                }
            }
        }
    }
    series.per_frame = per_frame;
    series
}

/// Collect `key:value` pairs from one stats line, renaming accepted keys
fn collect_line(
    line: &str,
    rename: impl Fn(&str) -> Option<&'static str>,
) -> BTreeMap<&'static str, f64> {
    line.split_whitespace()
        .filter_map(|part| part.split_once(':'))
        .filter_map(|(key, value)| Some((rename(key.trim())?, value.parse::<f64>().ok()?)))
        .collect()
}

fn series_from_rows(
    kind: MetricKind,
    keys: &[&'static str],
    rows: &[BTreeMap<&'static str, f64>],
) -> MetricSeries {
    let per_frame = keys
        .iter()
        .map(|key| (key.to_string(), rows.iter().map(|r| r.get(key).copied()).collect()))
        .collect();
    summarize(kind, per_frame)
}

/// ffmpeg `psnr=stats_file` lines:
/// `n:1 mse_avg:0.52 mse_y:0.48 ... psnr_avg:50.99 psnr_y:51.31 psnr_u:50.48 psnr_v:50.97`
pub fn parse_psnr(text: &str) -> MetricSeries {
    const KEYS: &[&str] = &["psnr_avg", "psnr_y", "psnr_u", "psnr_v"];

    let rows: Vec<_> = text
        .lines()
        .filter(|l| l.contains("psnr_avg:"))
        .map(|l| collect_line(l, |k| KEYS.iter().find(|key| **key == k).copied()))
        .filter(|row| row.contains_key("psnr_avg"))
        .collect();

    series_from_rows(MetricKind::Psnr, KEYS, &rows)
}

/// ffmpeg `ssim=stats_file` lines: `n:1 Y:0.9876 U:0.9901 V:0.9888 All:0.9885 (15.234)`
pub fn parse_ssim(text: &str) -> MetricSeries {
    const KEYS: &[&str] = &["ssim_avg", "ssim_y", "ssim_u", "ssim_v"];

    let rows: Vec<_> = text
        .lines()
        .filter(|l| l.contains("All:"))
        .map(|l| {
            collect_line(l, |k| match k {
                "All" => Some("ssim_avg"),
                "Y" => Some("ssim_y"),
                "U" => Some("ssim_u"),
                "V" => Some("ssim_v"),
                _ => None,
            })
        })
        .filter(|row| row.contains_key("ssim_avg"))
        .collect();

    series_from_rows(MetricKind::Ssim, KEYS, &rows)
}

#[derive(Debug, Deserialize)]
struct VmafJson {
    #[serde(default)]
    frames: Vec<VmafJsonFrame>,
}

#[derive(Debug, Deserialize)]
struct VmafJsonFrame {
    #[serde(default)]
    metrics: BTreeMap<String, serde_json::Value>,
}

/// libvmaf log in either JSON or CSV form
pub fn parse_vmaf(text: &str) -> MetricSeries {
    let per_frame = if text.trim_start().starts_with('{') {
        vmaf_json_frames(text)
    } else {
        vmaf_csv_frames(text)
    };

    summarize(MetricKind::Vmaf, per_frame)
}

fn vmaf_json_frames(text: &str) -> BTreeMap<String, Vec<Option<f64>>> {
    let Ok(log) = serde_json::from_str::<VmafJson>(text) else {
        return BTreeMap::new();
    };

    let mut per_frame: BTreeMap<String, Vec<Option<f64>>> = BTreeMap::new();
    for key in log.frames.iter().flat_map(|f| f.metrics.keys()) {
        per_frame.entry(key.clone()).or_default();
    }
    for frame in &log.frames {
        for (key, values) in per_frame.iter_mut() {
            values.push(frame.metrics.get(key).and_then(serde_json::Value::as_f64));
        }
    }
    per_frame
}

fn vmaf_csv_frames(text: &str) -> BTreeMap<String, Vec<Option<f64>>> {
    let mut lines = text.lines().filter(|l| !l.trim().is_empty());
    let Some(header) = lines.next() else {
        return BTreeMap::new();
    };
    let columns: Vec<&str> = header.split(',').map(str::trim).collect();

    let mut per_frame: BTreeMap<String, Vec<Option<f64>>> = columns
        .iter()
        .filter(|c| !c.is_empty() && !c.eq_ignore_ascii_case("frame"))
        .map(|c| (c.to_string(), Vec::new()))
        .collect();

    for line in lines {
        let cells: Vec<&str> = line.split(',').map(str::trim).collect();
        for (column, cell) in columns.iter().zip(cells.iter().chain(std::iter::repeat(&""))) {
            if let Some(values) = per_frame.get_mut(*column) {
                values.push(cell.parse::<f64>().ok());
            }
        }
    }
    per_frame
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn psnr_summary_is_mean_of_frames() {
        let log = "\
n:1 mse_avg:0.52 mse_y:0.48 mse_u:0.58 mse_v:0.52 psnr_avg:40.00 psnr_y:41.00 psnr_u:39.00 psnr_v:38.00
n:2 mse_avg:0.50 mse_y:0.47 mse_u:0.57 mse_v:0.51 psnr_avg:42.00 psnr_y:43.00 psnr_u:41.00 psnr_v:40.00
n:3 mse_avg:0.49 mse_y:0.46 mse_u:0.56 mse_v:0.50 psnr_avg:44.00 psnr_y:45.00 psnr_u:43.00 psnr_v:42.00
";
        let series = parse_psnr(log);
        assert_eq!(series.frame_count(), 3);
        assert_eq!(series.summary_value("psnr_avg"), Some(42.0));
        assert_eq!(series.summary_value("psnr_v"), Some(40.0));
        assert_eq!(series.per_frame["psnr_y"][1], Some(43.0));
    }

    #[test]
    fn psnr_accepts_inf_frames() {
        let log = "n:1 psnr_avg:inf psnr_y:inf psnr_u:inf psnr_v:inf\nn:2 psnr_avg:50.0 psnr_y:50.0 psnr_u:50.0 psnr_v:50.0\n";
        let series = parse_psnr(log);
        assert_eq!(series.frame_count(), 2);
        assert_eq!(series.per_frame["psnr_avg"][0], Some(f64::INFINITY));
        assert_eq!(series.summary_value("psnr_avg"), Some(50.0));
    }

    #[test]
    fn ssim_maps_all_to_avg() {
        let log = "\
n:1 Y:0.990000 U:0.980000 V:0.970000 All:0.985000 (18.239)
n:2 Y:0.980000 U:0.970000 V:0.960000 All:0.975000 (16.020)
";
        let series = parse_ssim(log);
        assert_eq!(series.frame_count(), 2);
        let avg = series.summary_value("ssim_avg").unwrap();
        assert!((avg - 0.98).abs() < 1e-9);
        assert_eq!(series.per_frame["ssim_u"], vec![Some(0.98), Some(0.97)]);
    }

    #[test]
    fn unrelated_text_yields_no_frames() {
        assert_eq!(parse_psnr("garbage\nmore garbage").frame_count(), 0);
        assert_eq!(parse_ssim("").frame_count(), 0);
        assert_eq!(parse_vmaf("").frame_count(), 0);
    }

    #[test]
    fn vmaf_csv_with_two_models() {
        let log = "\
Frame,integer_motion2,vmaf,vmaf_neg,
0,0.000000,90.000000,88.000000,
1,1.500000,94.000000,92.000000,
";
        let series = parse_vmaf(log);
        assert_eq!(series.frame_count(), 2);
        assert!(!series.per_frame.contains_key("Frame"));
        assert_eq!(series.summary_value("vmaf_mean"), Some(92.0));
        assert_eq!(series.summary_value("vmaf_neg_mean"), Some(90.0));

        let harmonic = series.summary_value("vmaf_harmonic_mean").unwrap();
        assert!((harmonic - 2.0 / (1.0 / 90.0 + 1.0 / 94.0)).abs() < 1e-9);
        assert!(series.feature_summary.contains_key("integer_motion2"));
    }

    #[test]
    fn vmaf_json_frames() {
        let log = r#"{
            "version": "2.3.1",
            "frames": [
                {"frameNum": 0, "metrics": {"vmaf": 80.0, "vmaf_neg": 78.0}},
                {"frameNum": 1, "metrics": {"vmaf": 100.0, "vmaf_neg": 98.0}}
            ],
            "pooled_metrics": {"vmaf": {"mean": 90.0}}
        }"#;
        let series = parse_vmaf(log);
        assert_eq!(series.per_frame["vmaf"], vec![Some(80.0), Some(100.0)]);
        assert_eq!(series.summary_value("vmaf_mean"), Some(90.0));
        assert_eq!(series.summary_value("vmaf_neg_mean"), Some(88.0));
    }

    #[test]
    fn empty_log_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("psnr.log");
        std::fs::write(&path, "").unwrap();
        let err = parse_log(&path, MetricKind::Psnr).unwrap_err();
        assert!(matches!(err, AnalysisError::EmptyMetricLog(_)));
    }

    #[test]
    fn harmonic_mean_of_equal_values() {
        let values = vec![Some(50.0), Some(50.0), None];
        let h = harmonic_mean(&values).unwrap();
        assert!((h - 50.0).abs() < 1e-9);
    }

    #[test]
    fn harmonic_mean_is_plain_over_positive_scores() {
        let h = harmonic_mean(&[Some(50.0), Some(100.0)]).unwrap();
        assert!((h - 200.0 / 3.0).abs() < 1e-9);

        // zero and missing frames are left out
        let h = harmonic_mean(&[Some(50.0), Some(0.0), None, Some(100.0)]).unwrap();
        assert!((h - 200.0 / 3.0).abs() < 1e-9);
        assert_eq!(harmonic_mean(&[Some(0.0), None]), None);
    }

    #[test]
    fn truncating_recomputes_psnr_summary() {
        let log = "\
n:1 psnr_avg:30.00 psnr_y:30.00 psnr_u:30.00 psnr_v:30.00
n:2 psnr_avg:40.00 psnr_y:40.00 psnr_u:40.00 psnr_v:40.00
n:3 psnr_avg:50.00 psnr_y:50.00 psnr_u:50.00 psnr_v:50.00
";
        let mut series = parse_psnr(log);
        assert_eq!(series.summary_value("psnr_avg"), Some(40.0));

        truncate_series(&mut series, MetricKind::Psnr, 2);
        assert_eq!(series.frame_count(), 2);
        assert_eq!(series.summary_value("psnr_avg"), Some(35.0));
        assert_eq!(series.summary_value("psnr_v"), Some(35.0));
    }

    #[test]
    fn truncating_recomputes_vmaf_pooling() {
        let log = "\
Frame,integer_motion2,vmaf,vmaf_neg,
0,1.000000,50.000000,40.000000,
1,3.000000,100.000000,80.000000,
2,8.000000,10.000000,10.000000,
";
        let mut series = parse_vmaf(log);
        truncate_series(&mut series, MetricKind::Vmaf, 2);

        assert_eq!(series.frame_count(), 2);
        assert_eq!(series.summary_value("vmaf_mean"), Some(75.0));
        assert_eq!(series.summary_value("vmaf_neg_mean"), Some(60.0));
        let harmonic = series.summary_value("vmaf_harmonic_mean").unwrap();
        assert!((harmonic - 200.0 / 3.0).abs() < 1e-9);
        assert_eq!(series.feature_summary["integer_motion2"].mean, 2.0);
    }
}
