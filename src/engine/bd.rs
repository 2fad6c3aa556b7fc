//! Bjøntegaard-Delta rate and metric computation
//!
//! Pure numeric code, no I/O. Each curve is a set of (bitrate, metric) points
//! for one configuration. `bd_rate` reports the average bitrate difference of
//! curve B against curve A at equal quality, in percent (negative means B
//! needs less bitrate). `bd_metric` reports the average quality difference at
//! equal bitrate. Both return `None` when the data cannot support a fit.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Minimum number of points per curve for a cubic fit
pub const MIN_POINTS: usize = 4;

/// Samples used by the piecewise integration
const PIECEWISE_SAMPLES: usize = 100;

const PIVOT_EPSILON: f64 = 1e-12;

/// How the area between the two curves is integrated
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BdMode {
    /// Analytic cubic integration, switching to piecewise interpolation when
    /// a fitted cubic is not monotone over the shared interval
    #[default]
    Auto,
    /// Always integrate the fitted cubics
    Polynomial,
    /// Always integrate a monotone piecewise-cubic interpolant
    Piecewise,
}

/// Least-squares cubic in a centred, scaled abscissa `t = (x - shift) / scale`
#[derive(Debug, Clone, Copy)]
struct Cubic {
    coeffs: [f64; 4],
    shift: f64,
    scale: f64,
}

impl Cubic {
    fn fit(x: &[f64], y: &[f64]) -> Option<Self> {
        let n = x.len() as f64;
        let shift = x.iter().sum::<f64>() / n;
        let scale = x.iter().map(|v| (v - shift).abs()).fold(0.0, f64::max);
        if !(scale > 0.0) {
            return None;
        }

        // Normal equations: A[j][k] = sum t^(j+k), b[j] = sum t^j y
        let mut a = [[0.0f64; 4]; 4];
        let mut b = [0.0f64; 4];
        for (&xi, &yi) in x.iter().zip(y) {
            let t = (xi - shift) / scale;
            let powers = [1.0, t, t * t, t * t * t];
            for j in 0..4 {
                b[j] += powers[j] * yi;
                for k in 0..4 {
                    a[j][k] += powers[j] * powers[k];
                }
            }
        }

        let coeffs = solve4(a, b)?;
        coeffs
            .iter()
            .all(|c| c.is_finite())
            .then_some(Self {
                coeffs,
                shift,
                scale,
            })
    }

    fn t(&self, x: f64) -> f64 {
        (x - self.shift) / self.scale
    }

    /// Antiderivative in `t`
    fn primitive(&self, t: f64) -> f64 {
        let [c0, c1, c2, c3] = self.coeffs;
        t * (c0 + t * (c1 / 2.0 + t * (c2 / 3.0 + t * c3 / 4.0)))
    }

    /// Integral over `[lo, hi]` in the original abscissa
    fn integrate(&self, lo: f64, hi: f64) -> f64 {
        self.scale * (self.primitive(self.t(hi)) - self.primitive(self.t(lo)))
    }

    /// Derivative with respect to `t`
    fn slope(&self, t: f64) -> f64 {
        let [_, c1, c2, c3] = self.coeffs;
        c1 + t * (2.0 * c2 + t * 3.0 * c3)
    }

    /// True when the cubic does not change direction across `[lo, hi]`
    fn is_monotone(&self, lo: f64, hi: f64) -> bool {
        let (t_lo, t_hi) = (self.t(lo), self.t(hi));
        let mut slopes = vec![self.slope(t_lo), self.slope(t_hi)];

        // The slope is quadratic; its extremum sits where the second derivative vanishes
        let [_, _, c2, c3] = self.coeffs;
        if c3 != 0.0 {
            let t_vertex = -c2 / (3.0 * c3);
            if t_vertex > t_lo && t_vertex < t_hi {
                slopes.push(self.slope(t_vertex));
            }
        }

        slopes.iter().all(|s| *s >= 0.0) || slopes.iter().all(|s| *s <= 0.0)
    }
}

/// Gaussian elimination with partial pivoting on a 4x4 system
fn solve4(mut a: [[f64; 4]; 4], mut b: [f64; 4]) -> Option<[f64; 4]> {
    for col in 0..4 {
        let pivot = (col..4).max_by(|&i, &j| a[i][col].abs().total_cmp(&a[j][col].abs()))?;
        if a[pivot][col].abs() < PIVOT_EPSILON {
            return None;
        }
        a.swap(col, pivot);
        b.swap(col, pivot);

        for row in col + 1..4 {
            let factor = a[row][col] / a[col][col];
            for k in col..4 {
                a[row][k] -= factor * a[col][k];
            }
            b[row] -= factor * b[col];
        }
    }

    let mut x = [0.0f64; 4];
    for row in (0..4).rev() {
        let tail: f64 = (row + 1..4).map(|k| a[row][k] * x[k]).sum();
        x[row] = (b[row] - tail) / a[row][row];
    }
    Some(x)
}

/// Monotone piecewise cubic Hermite interpolant (Fritsch-Carlson slopes)
#[derive(Debug, Clone)]
struct Pchip {
    x: Vec<f64>,
    y: Vec<f64>,
    d: Vec<f64>,
}

impl Pchip {
    /// Build from unsorted points. Points sharing an abscissa are averaged.
    fn new(x: &[f64], y: &[f64]) -> Option<Self> {
        let mut points: Vec<(f64, f64)> = x.iter().copied().zip(y.iter().copied()).collect();
        points.sort_by(|a, b| a.0.total_cmp(&b.0));

        let mut xs: Vec<f64> = Vec::with_capacity(points.len());
        let mut ys: Vec<f64> = Vec::with_capacity(points.len());
        let mut counts: Vec<f64> = Vec::with_capacity(points.len());
        for (px, py) in points {
            match xs.last() {
                Some(&last) if last == px => {
                    let i = ys.len() - 1;
                    ys[i] += py;
                    counts[i] += 1.0;
                }
                _ => {
                    xs.push(px);
                    ys.push(py);
                    counts.push(1.0);
                }
            }
        }
        for (y, c) in ys.iter_mut().zip(&counts) {
            *y /= c;
        }

        if xs.len() < 2 {
            return None;
        }

        let h: Vec<f64> = xs.windows(2).map(|w| w[1] - w[0]).collect();
        let delta: Vec<f64> = ys
            .windows(2)
            .zip(&h)
            .map(|(w, h)| (w[1] - w[0]) / h)
            .collect();

        let n = xs.len();
        let mut d = vec![0.0; n];
        if n == 2 {
            d[0] = delta[0];
            d[1] = delta[0];
        } else {
            for k in 1..n - 1 {
                if delta[k - 1] * delta[k] > 0.0 {
                    let w1 = 2.0 * h[k] + h[k - 1];
                    let w2 = h[k] + 2.0 * h[k - 1];
                    d[k] = (w1 + w2) / (w1 / delta[k - 1] + w2 / delta[k]);
                }
            }
            d[0] = edge_slope(h[0], h[1], delta[0], delta[1]);
            d[n - 1] = edge_slope(h[n - 2], h[n - 3], delta[n - 2], delta[n - 3]);
        }

        Some(Self { x: xs, y: ys, d })
    }

    fn eval(&self, at: f64) -> f64 {
        let last = self.x.len() - 1;
        let at = at.clamp(self.x[0], self.x[last]);
        let k = match self.x.partition_point(|&v| v <= at) {
            0 => 0,
            i => (i - 1).min(last - 1),
        };

        let h = self.x[k + 1] - self.x[k];
        let t = (at - self.x[k]) / h;
        let t2 = t * t;
        let t3 = t2 * t;

        let h00 = 2.0 * t3 - 3.0 * t2 + 1.0;
        let h10 = t3 - 2.0 * t2 + t;
        let h01 = -2.0 * t3 + 3.0 * t2;
        let h11 = t3 - t2;

        h00 * self.y[k] + h10 * h * self.d[k] + h01 * self.y[k + 1] + h11 * h * self.d[k + 1]
    }

    /// Trapezoid integral over evenly spaced samples of `[lo, hi]`
    fn integrate(&self, lo: f64, hi: f64) -> f64 {
        let step = (hi - lo) / (PIECEWISE_SAMPLES - 1) as f64;
        let values: Vec<f64> = (0..PIECEWISE_SAMPLES)
            .map(|i| self.eval(lo + step * i as f64))
            .collect();
        let inner: f64 = values[1..PIECEWISE_SAMPLES - 1].iter().sum();
        step * (inner + (values[0] + values[PIECEWISE_SAMPLES - 1]) / 2.0)
    }
}

/// Three-point end slope, kept shape-preserving
fn edge_slope(h0: f64, h1: f64, m0: f64, m1: f64) -> f64 {
    let d = ((2.0 * h0 + h1) * m0 - h0 * m1) / (h0 + h1);
    if d.signum() != m0.signum() || m0 == 0.0 {
        0.0
    } else if m0.signum() != m1.signum() && d.abs() > 3.0 * m0.abs() {
        3.0 * m0
    } else {
        d
    }
}

fn bounds(v: &[f64]) -> (f64, f64) {
    v.iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &x| {
            (lo.min(x), hi.max(x))
        })
}

/// Average of `y_b - y_a` over the shared abscissa range
fn average_gap(xa: &[f64], ya: &[f64], xb: &[f64], yb: &[f64], mode: BdMode) -> Option<f64> {
    let (a_lo, a_hi) = bounds(xa);
    let (b_lo, b_hi) = bounds(xb);
    let lo = a_lo.max(b_lo);
    let hi = a_hi.min(b_hi);
    if !(hi > lo) {
        return None;
    }

    let fit_a = Cubic::fit(xa, ya)?;
    let fit_b = Cubic::fit(xb, yb)?;

    let piecewise = match mode {
        BdMode::Polynomial => false,
        BdMode::Piecewise => true,
        BdMode::Auto => !(fit_a.is_monotone(lo, hi) && fit_b.is_monotone(lo, hi)),
    };

    let (int_a, int_b) = if piecewise {
        let pa = Pchip::new(xa, ya)?;
        let pb = Pchip::new(xb, yb)?;
        (pa.integrate(lo, hi), pb.integrate(lo, hi))
    } else {
        (fit_a.integrate(lo, hi), fit_b.integrate(lo, hi))
    };

    let avg = (int_b - int_a) / (hi - lo);
    avg.is_finite().then_some(avg)
}

/// Validate one curve and return (ln rate, metric)
fn prepare(rate: &[f64], metric: &[f64]) -> Option<(Vec<f64>, Vec<f64>)> {
    if rate.len() != metric.len() || rate.len() < MIN_POINTS {
        return None;
    }
    if rate.iter().any(|r| !r.is_finite() || *r <= 0.0) || metric.iter().any(|m| !m.is_finite()) {
        return None;
    }
    Some((rate.iter().map(|r| r.ln()).collect(), metric.to_vec()))
}

/// BD-Rate in percent with automatic integration mode
pub fn bd_rate(rate_a: &[f64], metric_a: &[f64], rate_b: &[f64], metric_b: &[f64]) -> Option<f64> {
    bd_rate_with(rate_a, metric_a, rate_b, metric_b, BdMode::Auto)
}

/// BD-Rate in percent: log-rate integrated as a function of the metric
pub fn bd_rate_with(
    rate_a: &[f64],
    metric_a: &[f64],
    rate_b: &[f64],
    metric_b: &[f64],
    mode: BdMode,
) -> Option<f64> {
    let (log_a, m_a) = prepare(rate_a, metric_a)?;
    let (log_b, m_b) = prepare(rate_b, metric_b)?;
    let avg = average_gap(&m_a, &log_a, &m_b, &log_b, mode)?;
    let pct = (avg.exp() - 1.0) * 100.0;
    pct.is_finite().then_some(pct)
}

/// BD-Metric (absolute metric delta) with automatic integration mode
pub fn bd_metric(rate_a: &[f64], metric_a: &[f64], rate_b: &[f64], metric_b: &[f64]) -> Option<f64> {
    bd_metric_with(rate_a, metric_a, rate_b, metric_b, BdMode::Auto)
}

/// BD-Metric: metric integrated as a function of log-rate
pub fn bd_metric_with(
    rate_a: &[f64],
    metric_a: &[f64],
    rate_b: &[f64],
    metric_b: &[f64],
    mode: BdMode,
) -> Option<f64> {
    let (log_a, m_a) = prepare(rate_a, metric_a)?;
    let (log_b, m_b) = prepare(rate_b, metric_b)?;
    average_gap(&log_a, &m_a, &log_b, &m_b, mode)
}

/// Metrics compared by BD, with the summary key each is read from
pub const BD_METRICS: [(&str, &str); 4] = [
    ("psnr", "psnr_avg"),
    ("ssim", "ssim_avg"),
    ("vmaf", "vmaf_mean"),
    ("vmaf_neg", "vmaf_neg_mean"),
];

/// One bitrate point of a rate-distortion curve
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RdPoint {
    pub bitrate: f64,
    /// Summary values keyed like `psnr_avg`, `vmaf_mean`
    pub summary: BTreeMap<String, Option<f64>>,
}

impl RdPoint {
    fn value(&self, key: &str) -> Option<f64> {
        self.summary.get(key).copied().flatten().filter(|v| v.is_finite())
    }
}

/// BD results for one source, `None` where data was insufficient
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BdRecord {
    pub source: String,
    pub bd_rate: BTreeMap<String, Option<f64>>,
    pub bd_metric: BTreeMap<String, Option<f64>>,
}

/// Usable (bitrate, metric) pairs for one metric, sorted by `by_metric`
fn curve(points: &[RdPoint], key: &str, by_metric: bool) -> (Vec<f64>, Vec<f64>) {
    let mut pairs: Vec<(f64, f64)> = points
        .iter()
        .filter(|p| p.bitrate > 0.0 && p.bitrate.is_finite())
        .filter_map(|p| Some((p.bitrate, p.value(key)?)))
        .collect();
    if by_metric {
        pairs.sort_by(|a, b| a.1.total_cmp(&b.1));
    } else {
        pairs.sort_by(|a, b| a.0.total_cmp(&b.0));
    }
    pairs.into_iter().unzip()
}

/// Compute BD-Rate and BD-Metric for every compared metric
pub fn build_bd_record(source: &str, anchor: &[RdPoint], test: &[RdPoint], mode: BdMode) -> BdRecord {
    let mut record = BdRecord {
        source: source.to_string(),
        bd_rate: BTreeMap::new(),
        bd_metric: BTreeMap::new(),
    };

    for (name, key) in BD_METRICS {
        let (ra, ma) = curve(anchor, key, true);
        let (rb, mb) = curve(test, key, true);
        record
            .bd_rate
            .insert(name.to_string(), bd_rate_with(&ra, &ma, &rb, &mb, mode));

        let (ra, ma) = curve(anchor, key, false);
        let (rb, mb) = curve(test, key, false);
        record
            .bd_metric
            .insert(name.to_string(), bd_metric_with(&ra, &ma, &rb, &mb, mode));
    }
    record
}
