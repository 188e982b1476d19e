//! Statistical analyzer: point estimates, confidence intervals, and
//! significance judgments over a completed run set.
//!
//! Estimator choice: Wilson score intervals per condition, combined with
//! Newcombe's score method for rate differences. Wilson intervals stay
//! valid at small n and extreme proportions (0% or 100%), where the normal
//! approximation collapses. Sample sizes here are small — ten-ish trials
//! per condition — so that regime is the common case, not the edge.
//!
//! `error` outcomes are harness malfunctions, not experimental results:
//! they are excluded from n and surfaced separately, because conflating
//! them with `fail` would invalidate the analysis.
//!
//! Everything here is a deterministic pure function of its input.

use serde::Serialize;
use statrs::distribution::{ContinuousCDF, Normal};

use crate::coordinator::RunSet;
use crate::orchestrator::Outcome;
use crate::trial::Condition;

/// A two-sided confidence interval.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct Interval {
    pub lower: f64,
    pub upper: f64,
    pub center: f64,
}

impl Interval {
    pub fn width(&self) -> f64 {
        self.upper - self.lower
    }

    pub fn contains(&self, x: f64) -> bool {
        self.lower <= x && x <= self.upper
    }
}

/// Wilson score interval for a binomial proportion.
///
/// With n = 0 there is no information: the interval is the whole unit
/// range.
pub fn wilson_interval(successes: u64, n: u64, confidence: f64) -> Interval {
    if n == 0 {
        return Interval {
            lower: 0.0,
            upper: 1.0,
            center: 0.0,
        };
    }

    let z = z_value(confidence);
    let z2 = z * z;
    let n_f = n as f64;
    let p_hat = successes as f64 / n_f;

    let denominator = 1.0 + z2 / n_f;
    let center = (p_hat + z2 / (2.0 * n_f)) / denominator;
    let spread =
        (z * (p_hat * (1.0 - p_hat) / n_f + z2 / (4.0 * n_f * n_f)).sqrt()) / denominator;

    Interval {
        lower: (center - spread).max(0.0),
        upper: (center + spread).min(1.0),
        center,
    }
}

fn z_value(confidence: f64) -> f64 {
    let confidence = confidence.clamp(0.5, 0.9999);
    let normal = Normal::new(0.0, 1.0).expect("standard normal");
    normal.inverse_cdf(1.0 - (1.0 - confidence) / 2.0)
}

/// Per-condition aggregate.
#[derive(Debug, Clone, Serialize)]
pub struct ConditionSummary {
    pub condition: Condition,
    /// Valid experimental outcomes (pass + fail). Errors are excluded.
    pub n: u64,
    pub successes: u64,
    pub error_count: u64,
    pub success_rate: f64,
    pub interval: Interval,
    pub mean_wall_time_seconds: f64,
    pub mean_total_tokens: f64,
}

/// Pairwise rate-difference estimate between two conditions.
#[derive(Debug, Clone, Serialize)]
pub struct ComparisonSummary {
    pub condition_a: Condition,
    pub condition_b: Condition,
    /// success_rate(a) − success_rate(b).
    pub rate_difference: f64,
    /// Newcombe score interval on the difference.
    pub interval: Interval,
    /// Whether the interval excludes zero at the stated confidence.
    pub excludes_zero: bool,
    /// Set when the sample is too small to distinguish the observed
    /// difference from noise; a point estimate alone is not conclusive.
    pub inconclusive: bool,
}

#[derive(Debug, Clone)]
pub struct AnalysisOptions {
    pub confidence: f64,
    /// Difference intervals wider than this are flagged inconclusive.
    pub inconclusive_width: f64,
}

impl Default for AnalysisOptions {
    fn default() -> Self {
        Self {
            confidence: 0.95,
            inconclusive_width: 0.5,
        }
    }
}

/// Full analysis of a run set.
#[derive(Debug, Clone, Serialize)]
pub struct Analysis {
    pub confidence: f64,
    pub conditions: Vec<ConditionSummary>,
    pub comparisons: Vec<ComparisonSummary>,
    pub total_records: usize,
    pub total_errors: u64,
}

/// Analyze the latest record per (trial, condition) in a run set.
pub fn analyze(run_set: &RunSet, options: &AnalysisOptions) -> Analysis {
    let latest = run_set.latest();

    let mut conditions = Vec::new();
    for condition in Condition::all() {
        let records: Vec<_> = latest
            .values()
            .filter(|r| r.condition == condition)
            .collect();
        if records.is_empty() {
            continue;
        }

        let successes = records
            .iter()
            .filter(|r| r.outcome == Outcome::Pass)
            .count() as u64;
        let error_count = records
            .iter()
            .filter(|r| r.outcome == Outcome::Error)
            .count() as u64;
        let n = records.len() as u64 - error_count;

        let measured: Vec<_> = records
            .iter()
            .filter(|r| r.outcome != Outcome::Error)
            .collect();
        let mean_wall_time_seconds = mean(measured.iter().map(|r| r.wall_time_seconds));
        let mean_total_tokens =
            mean(measured.iter().map(|r| (r.input_tokens + r.output_tokens) as f64));

        conditions.push(ConditionSummary {
            condition,
            n,
            successes,
            error_count,
            success_rate: if n > 0 { successes as f64 / n as f64 } else { 0.0 },
            interval: wilson_interval(successes, n, options.confidence),
            mean_wall_time_seconds,
            mean_total_tokens,
        });
    }

    let mut comparisons = Vec::new();
    for i in 0..conditions.len() {
        for j in (i + 1)..conditions.len() {
            comparisons.push(compare(&conditions[i], &conditions[j], options));
        }
    }

    Analysis {
        confidence: options.confidence,
        conditions,
        comparisons,
        total_records: latest.len(),
        total_errors: latest
            .values()
            .filter(|r| r.outcome == Outcome::Error)
            .count() as u64,
    }
}

/// Newcombe score interval on p_a − p_b, built from the two Wilson
/// intervals.
pub fn compare(
    a: &ConditionSummary,
    b: &ConditionSummary,
    options: &AnalysisOptions,
) -> ComparisonSummary {
    let d = a.success_rate - b.success_rate;
    let (p1, l1, u1) = (a.success_rate, a.interval.lower, a.interval.upper);
    let (p2, l2, u2) = (b.success_rate, b.interval.lower, b.interval.upper);

    let lower = d - ((p1 - l1).powi(2) + (u2 - p2).powi(2)).sqrt();
    let upper = d + ((u1 - p1).powi(2) + (p2 - l2).powi(2)).sqrt();
    let interval = Interval {
        lower: lower.max(-1.0),
        upper: upper.min(1.0),
        center: d,
    };

    let no_data = a.n == 0 || b.n == 0;
    let excludes_zero = !no_data && (interval.lower > 0.0 || interval.upper < 0.0);
    let inconclusive = no_data || interval.width() > options.inconclusive_width;

    ComparisonSummary {
        condition_a: a.condition,
        condition_b: b.condition,
        rate_difference: d,
        interval,
        excludes_zero,
        inconclusive,
    }
}

fn mean(values: impl Iterator<Item = f64>) -> f64 {
    let mut sum = 0.0;
    let mut count = 0u64;
    for v in values {
        sum += v;
        count += 1;
    }
    if count == 0 {
        0.0
    } else {
        sum / count as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f64, b: f64, eps: f64) -> bool {
        (a - b).abs() < eps
    }

    #[test]
    fn wilson_matches_published_values() {
        // 8/10 at 95%: (0.490, 0.943) per standard tables.
        let ci = wilson_interval(8, 10, 0.95);
        assert!(close(ci.lower, 0.4902, 0.005), "lower = {}", ci.lower);
        assert!(close(ci.upper, 0.9433, 0.005), "upper = {}", ci.upper);
    }

    #[test]
    fn wilson_does_not_collapse_at_extremes() {
        let all = wilson_interval(10, 10, 0.95);
        assert!(all.lower > 0.65 && all.lower < 0.75);
        assert!(close(all.upper, 1.0, 1e-9));

        let none = wilson_interval(0, 10, 0.95);
        assert!(close(none.lower, 0.0, 1e-9));
        assert!(none.upper > 0.25 && none.upper < 0.35);
    }

    #[test]
    fn wilson_with_no_data_is_the_unit_interval() {
        let ci = wilson_interval(0, 0, 0.95);
        assert!(close(ci.lower, 0.0, 1e-12));
        assert!(close(ci.upper, 1.0, 1e-12));
    }

    #[test]
    fn higher_confidence_widens_the_interval() {
        let at_90 = wilson_interval(6, 10, 0.90);
        let at_99 = wilson_interval(6, 10, 0.99);
        assert!(at_99.width() > at_90.width());
    }

    #[test]
    fn comparison_flags_small_sample_as_inconclusive() {
        let options = AnalysisOptions::default();
        let a = ConditionSummary {
            condition: Condition::Baseline,
            n: 10,
            successes: 9,
            error_count: 0,
            success_rate: 0.9,
            interval: wilson_interval(9, 10, 0.95),
            mean_wall_time_seconds: 0.0,
            mean_total_tokens: 0.0,
        };
        let b = ConditionSummary {
            condition: Condition::FlatContext,
            n: 10,
            successes: 10,
            error_count: 0,
            success_rate: 1.0,
            interval: wilson_interval(10, 10, 0.95),
            mean_wall_time_seconds: 0.0,
            mean_total_tokens: 0.0,
        };
        let cmp = compare(&a, &b, &options);
        assert!(close(cmp.rate_difference, -0.1, 1e-9));
        // One fail out of ten cannot separate the conditions.
        assert!(!cmp.excludes_zero);
        assert!(cmp.interval.contains(0.0));
    }

    #[test]
    fn comparison_with_no_data_is_inconclusive() {
        let options = AnalysisOptions::default();
        let empty = ConditionSummary {
            condition: Condition::Baseline,
            n: 0,
            successes: 0,
            error_count: 3,
            success_rate: 0.0,
            interval: wilson_interval(0, 0, 0.95),
            mean_wall_time_seconds: 0.0,
            mean_total_tokens: 0.0,
        };
        let full = ConditionSummary {
            condition: Condition::StructuredLayer,
            n: 10,
            successes: 10,
            error_count: 0,
            success_rate: 1.0,
            interval: wilson_interval(10, 10, 0.95),
            mean_wall_time_seconds: 0.0,
            mean_total_tokens: 0.0,
        };
        let cmp = compare(&empty, &full, &options);
        assert!(cmp.inconclusive);
        assert!(!cmp.excludes_zero);
    }

    #[test]
    fn large_clean_separation_excludes_zero() {
        let options = AnalysisOptions {
            confidence: 0.95,
            inconclusive_width: 1.0,
        };
        let a = ConditionSummary {
            condition: Condition::Baseline,
            n: 200,
            successes: 40,
            error_count: 0,
            success_rate: 0.2,
            interval: wilson_interval(40, 200, 0.95),
            mean_wall_time_seconds: 0.0,
            mean_total_tokens: 0.0,
        };
        let b = ConditionSummary {
            condition: Condition::StructuredLayer,
            n: 200,
            successes: 160,
            error_count: 0,
            success_rate: 0.8,
            interval: wilson_interval(160, 200, 0.95),
            mean_wall_time_seconds: 0.0,
            mean_total_tokens: 0.0,
        };
        let cmp = compare(&a, &b, &options);
        assert!(cmp.excludes_zero);
        assert!(cmp.interval.upper < 0.0);
    }
}
