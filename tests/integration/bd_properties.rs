// Property tests for BD-Rate and BD-Metric

use ffbd::engine::bd::{BdMode, MIN_POINTS, bd_metric_with, bd_rate_with};
use proptest::prelude::*;

/// Increasing (rate, metric) curve with 4..=8 points
fn rd_curve() -> impl Strategy<Value = (Vec<f64>, Vec<f64>)> {
    (
        100.0f64..10_000.0,
        25.0f64..35.0,
        prop::collection::vec((1.2f64..3.0, 0.5f64..4.0), MIN_POINTS..=8),
    )
        .prop_map(|(base, start, steps)| {
            let mut rate = base;
            let mut metric = start;
            let mut rates = Vec::with_capacity(steps.len());
            let mut metrics = Vec::with_capacity(steps.len());
            for (ratio, gain) in steps {
                rate *= ratio;
                metric += gain;
                rates.push(rate);
                metrics.push(metric);
            }
            (rates, metrics)
        })
}

fn mode() -> impl Strategy<Value = BdMode> {
    prop_oneof![
        Just(BdMode::Auto),
        Just(BdMode::Polynomial),
        Just(BdMode::Piecewise)
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn identical_curves_have_no_gap((rates, metrics) in rd_curve(), mode in mode()) {
        let rate = bd_rate_with(&rates, &metrics, &rates, &metrics, mode).unwrap();
        let metric = bd_metric_with(&rates, &metrics, &rates, &metrics, mode).unwrap();
        prop_assert!(rate.abs() < 1e-6, "bd_rate {}", rate);
        prop_assert!(metric.abs() < 1e-9, "bd_metric {}", metric);
    }

    #[test]
    fn scaled_rates_give_matching_bd_rate(
        (rates, metrics) in rd_curve(),
        factor in 0.5f64..2.0,
        mode in mode(),
    ) {
        let scaled: Vec<f64> = rates.iter().map(|r| r * factor).collect();
        let bd = bd_rate_with(&rates, &metrics, &scaled, &metrics, mode).unwrap();
        let expected = (factor - 1.0) * 100.0;
        prop_assert!((bd - expected).abs() < 1e-6, "bd_rate {} expected {}", bd, expected);
    }

    #[test]
    fn shifted_metric_gives_matching_bd_metric(
        (rates, metrics) in rd_curve(),
        delta in -3.0f64..3.0,
        mode in mode(),
    ) {
        let shifted: Vec<f64> = metrics.iter().map(|m| m + delta).collect();
        let bd = bd_metric_with(&rates, &metrics, &rates, &shifted, mode).unwrap();
        prop_assert!((bd - delta).abs() < 1e-6, "bd_metric {} expected {}", bd, delta);

        let reverse = bd_metric_with(&rates, &shifted, &rates, &metrics, mode).unwrap();
        prop_assert!((bd + reverse).abs() < 1e-6);
    }

    #[test]
    fn short_curves_are_rejected(
        (rates, metrics) in rd_curve(),
        keep in 0usize..MIN_POINTS,
        mode in mode(),
    ) {
        let (short_r, short_m) = (&rates[..keep], &metrics[..keep]);
        prop_assert_eq!(bd_rate_with(short_r, short_m, &rates, &metrics, mode), None);
        prop_assert_eq!(bd_metric_with(&rates, &metrics, short_r, short_m, mode), None);
    }
}
