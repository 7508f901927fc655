//! Winner decisioning.
//!
//! Each variant gets a weighted score over the experiment's success metrics.
//! The best-scoring variant only wins when a two-sided two-proportion z-test
//! on success rate finds it significantly better than every other variant at
//! the configured significance level.

use super::types::{ExperimentResults, SuccessMetric, VariantResults, WinnerRecommendation};
use statrs::distribution::{ContinuousCDF, Normal};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ZTestResult {
    pub z: f64,
    pub p_value: f64,
}

impl ZTestResult {
    pub fn is_significant(&self, alpha: f64) -> bool {
        self.p_value < alpha
    }
}

/// Two-sided pooled two-proportion z-test of `s1/n1` against `s2/n2`.
/// `None` when either sample is empty.
pub fn two_proportion_z_test(s1: u64, n1: u64, s2: u64, n2: u64) -> Option<ZTestResult> {
    if n1 == 0 || n2 == 0 {
        return None;
    }

    let (n1f, n2f) = (n1 as f64, n2 as f64);
    let p1 = s1 as f64 / n1f;
    let p2 = s2 as f64 / n2f;
    let pooled = (s1 + s2) as f64 / (n1f + n2f);
    let standard_error = (pooled * (1.0 - pooled) * (1.0 / n1f + 1.0 / n2f)).sqrt();

    if standard_error == 0.0 || !standard_error.is_finite() {
        // both samples all-success or all-failure: no evidence of a difference
        return Some(ZTestResult { z: 0.0, p_value: 1.0 });
    }

    let z = (p1 - p2) / standard_error;
    let normal = Normal::new(0.0, 1.0).ok()?;
    let p_value = (2.0 * (1.0 - normal.cdf(z.abs()))).clamp(0.0, 1.0);
    Some(ZTestResult { z, p_value })
}

fn ratio(value: f64, threshold: f64) -> f64 {
    if threshold > 0.0 {
        value / threshold
    } else {
        value
    }
}

/// Normalized contribution of one metric; higher is always better
pub fn normalized_metric(name: &str, metric: &SuccessMetric, variant: &VariantResults) -> f64 {
    match name {
        "success_rate" => ratio(variant.success_rate, metric.threshold),
        "avg_latency_ms" => {
            let latency = variant.avg_latency_ms;
            if latency <= 0.0 {
                1.0
            } else if metric.threshold > 0.0 {
                (metric.threshold / latency).min(1.0)
            } else {
                1.0 / (1.0 + latency)
            }
        }
        custom => variant
            .metrics
            .get(custom)
            .map(|value| ratio(*value, metric.threshold))
            .unwrap_or(0.0),
    }
}

pub fn weighted_score(
    success_metrics: &BTreeMap<String, SuccessMetric>,
    variant: &VariantResults,
) -> f64 {
    if success_metrics.is_empty() {
        return variant.success_rate;
    }
    success_metrics
        .iter()
        .map(|(name, metric)| metric.weight * normalized_metric(name, metric, variant))
        .sum()
}

pub fn recommend(
    results: &ExperimentResults,
    success_metrics: &BTreeMap<String, SuccessMetric>,
    alpha: f64,
) -> WinnerRecommendation {
    let scores: BTreeMap<String, f64> = results
        .variants
        .iter()
        .map(|v| (v.variant_name.clone(), weighted_score(success_metrics, v)))
        .collect();

    let inconclusive = |reason: String| WinnerRecommendation::Inconclusive {
        reason,
        scores: scores.clone(),
    };

    if results.variants.len() < 2 {
        return inconclusive("experiment has fewer than 2 variants".to_string());
    }

    if let Some(short) = results
        .variants
        .iter()
        .find(|v| v.sample_size == 0 || v.sample_size < results.minimum_sample_size)
    {
        return inconclusive(format!(
            "variant '{}' has {} of {} required samples",
            short.variant_name, short.sample_size, results.minimum_sample_size
        ));
    }

    let mut ranked: Vec<&VariantResults> = results.variants.iter().collect();
    ranked.sort_by(|a, b| scores[&b.variant_name].total_cmp(&scores[&a.variant_name]));
    let best = ranked[0];
    let best_score = scores[&best.variant_name];

    if (best_score - scores[&ranked[1].variant_name]).abs() < f64::EPSILON {
        return inconclusive(format!(
            "variants '{}' and '{}' are tied on score",
            best.variant_name, ranked[1].variant_name
        ));
    }

    let mut worst_p_value: f64 = 0.0;
    for other in &ranked[1..] {
        if best.success_rate <= other.success_rate {
            return inconclusive(format!(
                "top-scoring variant '{}' does not have a higher success rate than '{}'",
                best.variant_name, other.variant_name
            ));
        }

        let Some(test) = two_proportion_z_test(
            best.success_count,
            best.sample_size,
            other.success_count,
            other.sample_size,
        ) else {
            return inconclusive("success rate test could not be computed".to_string());
        };

        if !test.is_significant(alpha) {
            return inconclusive(format!(
                "difference between '{}' and '{}' is not significant (p = {:.4}, alpha = {alpha})",
                best.variant_name, other.variant_name, test.p_value
            ));
        }
        worst_p_value = worst_p_value.max(test.p_value);
    }

    WinnerRecommendation::Winner {
        variant_name: best.variant_name.clone(),
        score: best_score,
        p_value: worst_p_value,
        scores,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state_machine::ExperimentStatus;

    fn variant(name: &str, n: u64, successes: u64, latency: f64) -> VariantResults {
        VariantResults {
            variant_name: name.to_string(),
            model_name: "ranker".to_string(),
            model_version: 1,
            sample_size: n,
            success_count: successes,
            success_rate: if n == 0 { 0.0 } else { successes as f64 / n as f64 },
            avg_latency_ms: latency,
            metrics: BTreeMap::new(),
            reached_minimum: true,
        }
    }

    fn results(minimum: u64, variants: Vec<VariantResults>) -> ExperimentResults {
        ExperimentResults {
            experiment_id: "exp".to_string(),
            name: "exp".to_string(),
            status: ExperimentStatus::Running,
            minimum_sample_size: minimum,
            total_samples: variants.iter().map(|v| v.sample_size).sum(),
            minimum_reached: variants.iter().all(|v| v.sample_size >= minimum),
            variants,
        }
    }

    fn success_rate_only() -> BTreeMap<String, SuccessMetric> {
        BTreeMap::from([(
            "success_rate".to_string(),
            SuccessMetric {
                threshold: 0.0,
                weight: 1.0,
            },
        )])
    }

    #[test]
    fn test_z_test_known_values() {
        // 95/100 vs 85/100: pooled 0.9, se = sqrt(0.09 * 0.02) ~ 0.0424
        let test = two_proportion_z_test(95, 100, 85, 100).unwrap();
        assert!((test.z - 2.357).abs() < 0.01, "z = {}", test.z);
        assert!((test.p_value - 0.0184).abs() < 0.001, "p = {}", test.p_value);
        assert!(test.is_significant(0.05));
        assert!(!test.is_significant(0.01));
    }

    #[test]
    fn test_z_test_degenerate_inputs() {
        assert!(two_proportion_z_test(0, 0, 5, 10).is_none());
        let identical = two_proportion_z_test(10, 10, 20, 20).unwrap();
        assert_eq!(identical.p_value, 1.0);
    }

    #[test]
    fn test_inconclusive_below_minimum_sample_size() {
        let results = results(100, vec![variant("control", 99, 80, 10.0), variant("treatment", 150, 149, 10.0)]);
        let recommendation = recommend(&results, &success_rate_only(), 0.05);
        assert!(recommendation.is_inconclusive());
    }

    #[test]
    fn test_clear_winner() {
        let results = results(100, vec![variant("control", 100, 85, 10.0), variant("treatment", 100, 95, 10.0)]);
        let recommendation = recommend(&results, &success_rate_only(), 0.05);
        assert_eq!(recommendation.winner(), Some("treatment"));
    }

    #[test]
    fn test_small_difference_is_inconclusive() {
        let results = results(100, vec![variant("control", 100, 90, 10.0), variant("treatment", 100, 92, 10.0)]);
        let recommendation = recommend(&results, &success_rate_only(), 0.05);
        assert!(recommendation.is_inconclusive());
    }

    #[test]
    fn test_latency_weighting() {
        let metrics = BTreeMap::from([
            ("success_rate".to_string(), SuccessMetric { threshold: 0.9, weight: 0.7 }),
            ("avg_latency_ms".to_string(), SuccessMetric { threshold: 50.0, weight: 0.3 }),
        ]);
        let fast = variant("fast", 100, 90, 25.0);
        let slow = variant("slow", 100, 90, 100.0);
        assert!(weighted_score(&metrics, &fast) > weighted_score(&metrics, &slow));
        assert!((normalized_metric("avg_latency_ms", &metrics["avg_latency_ms"], &fast) - 1.0).abs() < 1e-12);
        assert!((normalized_metric("avg_latency_ms", &metrics["avg_latency_ms"], &slow) - 0.5).abs() < 1e-12);
    }
}
