//! Deviation buckets, the aggregate score and per-sample reports.

use std::fmt;

use serde::Serialize;

use crate::error::{NetError, Result};
use crate::network::Network;
use crate::numeric::Scalar;

pub const BUCKET_LABELS: [&str; 7] = ["0-10%", "10-20%", "20-30%", "30-40%", "40-50%", "50-100%", "100%+"];
pub const BUCKET_WEIGHTS: [f64; 7] = [1.0, 0.9, 0.8, 0.7, 0.6, 0.5, 0.0];

/// Index of the `100%+` bucket.
const FAILURE_BUCKET: usize = 6;

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct BucketStat {
    pub count: usize,
    /// Share of all samples, in `[0, 1]`.
    pub fraction: f64,
}

/// Result of [`Network::evaluate`].
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Performance {
    /// `100 * Σ weight * fraction`; a calibration score, not accuracy.
    pub score: f64,
    pub total: usize,
    /// Samples in the `100%+` bucket.
    pub failures: usize,
    pub buckets: [BucketStat; 7],
    /// Per-sample deviation in percent of the expected range.
    pub samples: Vec<f64>,
}

/// Bucket for a deviation given in percent.
pub fn bucket_index(deviation: f64) -> usize {
    if deviation.is_nan() || deviation > 100.0 {
        FAILURE_BUCKET
    } else if deviation >= 50.0 {
        5
    } else {
        (deviation.max(0.0) / 10.0) as usize
    }
}

/// `max - min` of the expected values, falling back to `max |e|`, then 1.
fn dynamic_range(expected: &[f64]) -> f64 {
    let (lo, hi) = expected
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &e| (lo.min(e), hi.max(e)));
    let span = hi - lo;
    if span.is_finite() && span > 0.0 {
        return span;
    }
    let peak = expected.iter().fold(0.0f64, |m, e| m.max(e.abs()));
    if peak.is_finite() && peak > 0.0 {
        peak
    } else {
        1.0
    }
}

impl Performance {
    pub fn from_pairs(expected: &[f64], predicted: &[f64]) -> Result<Self> {
        if expected.len() != predicted.len() {
            return Err(NetError::config(format!(
                "{} expected values but {} predictions",
                expected.len(),
                predicted.len()
            )));
        }
        let range = dynamic_range(expected);
        let samples: Vec<f64> = expected
            .iter()
            .zip(predicted)
            .map(|(e, p)| (e - p).abs() / range * 100.0)
            .collect();

        let mut buckets = [BucketStat::default(); 7];
        for &d in &samples {
            buckets[bucket_index(d)].count += 1;
        }
        let total = samples.len();
        let mut score = 0.0;
        if total > 0 {
            for (b, w) in buckets.iter_mut().zip(BUCKET_WEIGHTS) {
                b.fraction = b.count as f64 / total as f64;
                score += w * b.fraction;
            }
        }
        Ok(Self {
            score: 100.0 * score,
            total,
            failures: buckets[FAILURE_BUCKET].count,
            buckets,
            samples,
        })
    }
}

impl fmt::Display for Performance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "score    | {:6.2}", self.score)?;
        writeln!(f, "samples  | {}", self.total)?;
        writeln!(f, "failures | {}", self.failures)?;
        writeln!(f, "deviation buckets:")?;
        for (label, b) in BUCKET_LABELS.iter().zip(&self.buckets) {
            writeln!(f, "  {:<7} | {:5} ({:5.1}%)", label, b.count, b.fraction * 100.0)?;
        }
        Ok(())
    }
}

/// Error summary of one output vector.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SampleReport {
    pub index: usize,
    pub mean_abs_error: f64,
    pub max_error: f64,
    pub within_epsilon: bool,
}

pub fn compute_per_sample_performance(
    expected: &[Vec<f64>],
    actual: &[Vec<f64>],
    epsilon: f64,
) -> Result<Vec<SampleReport>> {
    if expected.len() != actual.len() {
        return Err(NetError::config(format!(
            "{} expected vectors but {} actual",
            expected.len(),
            actual.len()
        )));
    }
    expected
        .iter()
        .zip(actual)
        .enumerate()
        .map(|(index, (e, a))| {
            if e.len() != a.len() {
                return Err(NetError::config(format!(
                    "sample {index}: {} expected values but {} actual",
                    e.len(),
                    a.len()
                )));
            }
            let errors: Vec<f64> = e.iter().zip(a).map(|(x, y)| (x - y).abs()).collect();
            let max_error = errors.iter().fold(0.0f64, |m, &d| m.max(d));
            let mean_abs_error = if errors.is_empty() {
                0.0
            } else {
                errors.iter().sum::<f64>() / errors.len() as f64
            };
            Ok(SampleReport {
                index,
                mean_abs_error,
                max_error,
                within_epsilon: max_error <= epsilon,
            })
        })
        .collect()
}

pub fn print_sample_diagnostics(reports: &[SampleReport], epsilon: f64) {
    let within = reports.iter().filter(|r| r.within_epsilon).count();
    println!("per-sample diagnostics (epsilon {epsilon:e}):");
    for r in reports {
        println!(
            "  #{:<5} mean |e| {:.6}  max |e| {:.6}  {}",
            r.index,
            r.mean_abs_error,
            r.max_error,
            if r.within_epsilon { "ok" } else { "off" }
        );
    }
    println!("  {within}/{} within epsilon", reports.len());
}

impl<T: Scalar> Network<T> {
    /// Bucket `(expected, predicted)` pairs and keep the record on the network.
    pub fn evaluate(&mut self, expected: &[f64], predicted: &[f64]) -> Result<&Performance> {
        let perf = Performance::from_pairs(expected, predicted)?;
        Ok(self.performance.insert(perf))
    }

    pub fn print_diagnostics(&self) {
        match &self.performance {
            Some(p) => print!("{p}"),
            None => println!("no evaluation recorded"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn perfect_predictions_score_100() {
        let p = Performance::from_pairs(&[0.0, 1.0, 2.0], &[0.0, 1.0, 2.0]).unwrap();
        assert_eq!(p.score, 100.0);
        assert_eq!(p.buckets[0].count, 3);
        assert_eq!(p.failures, 0);
    }

    #[test]
    fn buckets_use_the_expected_range() {
        // range 10: deviations 5%, 15%, 60%, 200%
        let p = Performance::from_pairs(&[0.0, 10.0, 5.0, 5.0], &[0.5, 8.5, 11.0, 25.0]).unwrap();
        assert_eq!(p.total, 4);
        assert_eq!(p.buckets[0].count, 1);
        assert_eq!(p.buckets[1].count, 1);
        assert_eq!(p.buckets[5].count, 1);
        assert_eq!(p.failures, 1);
        let expected = 100.0 * (1.0 + 0.9 + 0.5 + 0.0) / 4.0;
        assert!((p.score - expected).abs() < 1e-12);
    }

    #[test]
    fn range_falls_back_to_peak_then_one() {
        assert_eq!(dynamic_range(&[4.0, 4.0]), 4.0);
        assert_eq!(dynamic_range(&[-3.0]), 3.0);
        assert_eq!(dynamic_range(&[0.0, 0.0]), 1.0);
        assert_eq!(dynamic_range(&[]), 1.0);
    }

    #[test]
    fn bucket_edges() {
        assert_eq!(bucket_index(0.0), 0);
        assert_eq!(bucket_index(9.99), 0);
        assert_eq!(bucket_index(10.0), 1);
        assert_eq!(bucket_index(49.9), 4);
        assert_eq!(bucket_index(100.0), 5);
        assert_eq!(bucket_index(100.1), 6);
        assert_eq!(bucket_index(f64::NAN), 6);
    }

    #[test]
    fn evaluate_keeps_the_record() {
        let mut n = Network::<f32>::create(
            &[(1, 1), (1, 1)],
            &[crate::activation::Activation::Linear; 2],
            &[true; 2],
            Some(1),
        )
        .unwrap();
        assert!(n.performance().is_none());
        let score = n.evaluate(&[1.0, 2.0], &[1.0, 2.0]).unwrap().score;
        assert_eq!(score, 100.0);
        assert_eq!(n.performance().unwrap().total, 2);
        assert!(n.evaluate(&[1.0], &[]).is_err());
        assert_eq!(n.performance().unwrap().total, 2);
        assert!(n.performance().unwrap().to_string().contains("100%+"));
    }

    #[test]
    fn per_sample_reports() {
        let r = compute_per_sample_performance(
            &[vec![1.0, 2.0], vec![0.0, 0.0]],
            &[vec![1.0, 2.05], vec![0.5, -0.5]],
            0.1,
        )
        .unwrap();
        assert!(r[0].within_epsilon);
        assert!((r[0].max_error - 0.05).abs() < 1e-12);
        assert!(!r[1].within_epsilon);
        assert_eq!(r[1].mean_abs_error, 0.5);
        assert!(compute_per_sample_performance(&[vec![1.0]], &[vec![]], 0.1).is_err());
    }
}
