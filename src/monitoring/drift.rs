//! Feature drift scoring.
//!
//! Drift is measured with the Population Stability Index. A training-time
//! baseline fixes per-feature quantile bin edges and the expected share of
//! samples in each bin; the observed share over the rolling window is then
//! compared bin by bin:
//!
//! `PSI = sum((observed - expected) * ln(observed / expected))`
//!
//! with both shares floored at [`PSI_EPSILON`]. The model's score is the mean
//! PSI across features. Rules of thumb: below 0.1 no meaningful shift,
//! 0.1 to 0.25 moderate, above 0.25 significant.

use crate::error::{ModelOpsError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Named numeric features of one prediction request
pub type FeatureVector = BTreeMap<String, f64>;

/// Floor applied to bin shares so empty bins do not produce infinities
pub const PSI_EPSILON: f64 = 1e-4;

/// Scores below this need no action
pub const NO_ACTION_THRESHOLD: f64 = 0.1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureBins {
    /// Interior cut points, ascending and unique; `edges.len() + 1` bins
    pub edges: Vec<f64>,
    /// Baseline share of samples in each bin
    pub expected: Vec<f64>,
}

impl FeatureBins {
    pub fn bin_count(&self) -> usize {
        self.edges.len() + 1
    }

    /// Bin index for a value: the number of edges strictly below it
    pub fn bin_for(&self, value: f64) -> usize {
        self.edges.partition_point(|edge| *edge < value)
    }

    pub fn proportions<'a>(&self, values: impl Iterator<Item = &'a f64>) -> Vec<f64> {
        let mut counts = vec![0u64; self.bin_count()];
        let mut total = 0u64;
        for value in values.filter(|v| v.is_finite()) {
            counts[self.bin_for(*value)] += 1;
            total += 1;
        }
        if total == 0 {
            return vec![0.0; self.bin_count()];
        }
        counts
            .into_iter()
            .map(|count| count as f64 / total as f64)
            .collect()
    }
}

/// Training-time feature distribution a model is compared against
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FeatureBaseline {
    pub features: BTreeMap<String, FeatureBins>,
    pub sample_count: usize,
}

impl FeatureBaseline {
    /// Build quantile bins (deciles for `bins = 10`) from training samples
    pub fn from_samples(samples: &[FeatureVector], bins: usize) -> Result<Self> {
        if samples.is_empty() {
            return Err(ModelOpsError::Validation(
                "a drift baseline needs at least one sample".to_string(),
            ));
        }
        if bins < 2 {
            return Err(ModelOpsError::Validation(format!(
                "a drift baseline needs at least 2 bins, got {bins}"
            )));
        }

        let mut columns: BTreeMap<&str, Vec<f64>> = BTreeMap::new();
        for sample in samples {
            for (name, value) in sample {
                if value.is_finite() {
                    columns.entry(name.as_str()).or_default().push(*value);
                }
            }
        }

        let mut features = BTreeMap::new();
        for (name, mut values) in columns {
            values.sort_by(f64::total_cmp);
            let mut edges: Vec<f64> = (1..bins)
                .map(|i| quantile(&values, i as f64 / bins as f64))
                .collect();
            edges.dedup();

            let mut feature = FeatureBins {
                edges,
                expected: Vec::new(),
            };
            feature.expected = feature.proportions(values.iter());
            features.insert(name.to_string(), feature);
        }

        Ok(Self {
            features,
            sample_count: samples.len(),
        })
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }
}

/// Linear-interpolated quantile of sorted values
fn quantile(sorted: &[f64], q: f64) -> f64 {
    if sorted.len() == 1 {
        return sorted[0];
    }
    let position = q.clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
    let lower = position.floor() as usize;
    let upper = position.ceil() as usize;
    let fraction = position - lower as f64;
    sorted[lower] + (sorted[upper] - sorted[lower]) * fraction
}

/// Population Stability Index between two share vectors of equal length
pub fn population_stability_index(expected: &[f64], observed: &[f64]) -> f64 {
    expected
        .iter()
        .zip(observed)
        .map(|(e, o)| {
            let e = e.max(PSI_EPSILON);
            let o = o.max(PSI_EPSILON);
            (o - e) * (o / e).ln()
        })
        .sum()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriftRecommendation {
    /// No baseline, too few observed samples, or no baseline feature
    /// present in the observed traffic
    InsufficientData,
    NoAction,
    Monitor,
    Retrain,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriftReport {
    pub has_drift: bool,
    pub score: f64,
    pub recommendation: DriftRecommendation,
    pub feature_scores: BTreeMap<String, f64>,
    pub sample_count: usize,
}

impl DriftReport {
    pub fn insufficient(sample_count: usize) -> Self {
        Self {
            has_drift: false,
            score: 0.0,
            recommendation: DriftRecommendation::InsufficientData,
            feature_scores: BTreeMap::new(),
            sample_count,
        }
    }
}

/// Score observed feature vectors against a baseline
pub fn score_drift<'a>(
    baseline: &FeatureBaseline,
    observed: impl Iterator<Item = &'a FeatureVector> + Clone,
    sample_count: usize,
    min_samples: usize,
    threshold: f64,
) -> DriftReport {
    if baseline.is_empty() || sample_count < min_samples.max(1) {
        return DriftReport::insufficient(sample_count);
    }

    // Features the observed vectors never carry are a schema gap, not drift
    let feature_scores: BTreeMap<String, f64> = baseline
        .features
        .iter()
        .filter(|(name, _)| {
            observed
                .clone()
                .any(|vector| vector.get(*name).is_some_and(|v| v.is_finite()))
        })
        .map(|(name, bins)| {
            let values = observed.clone().filter_map(|vector| vector.get(name));
            let shares = bins.proportions(values);
            (
                name.clone(),
                population_stability_index(&bins.expected, &shares),
            )
        })
        .collect();
    if feature_scores.is_empty() {
        return DriftReport::insufficient(sample_count);
    }

    let score = feature_scores.values().sum::<f64>() / feature_scores.len() as f64;
    let has_drift = score > threshold;
    let recommendation = if has_drift {
        DriftRecommendation::Retrain
    } else if score < NO_ACTION_THRESHOLD {
        DriftRecommendation::NoAction
    } else {
        DriftRecommendation::Monitor
    };

    DriftReport {
        has_drift,
        score,
        recommendation,
        feature_scores,
        sample_count,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn samples(offset: f64, n: usize) -> Vec<FeatureVector> {
        (0..n)
            .map(|i| {
                FeatureVector::from([
                    ("duration".to_string(), offset + (i % 100) as f64),
                    ("attendees".to_string(), offset / 10.0 + (i % 7) as f64),
                ])
            })
            .collect()
    }

    #[test]
    fn test_identical_distributions_have_zero_drift() {
        let training = samples(0.0, 500);
        let baseline = FeatureBaseline::from_samples(&training, 10).unwrap();
        let report = score_drift(&baseline, training.iter(), training.len(), 50, 0.2);

        assert!(!report.has_drift);
        assert!(report.score.abs() < 1e-9, "score was {}", report.score);
        assert_eq!(report.recommendation, DriftRecommendation::NoAction);
    }

    #[test]
    fn test_shifted_distribution_drifts() {
        let baseline = FeatureBaseline::from_samples(&samples(0.0, 500), 10).unwrap();
        let shifted = samples(80.0, 500);
        let report = score_drift(&baseline, shifted.iter(), shifted.len(), 50, 0.2);

        assert!(report.has_drift);
        assert!(report.score > 0.2);
        assert_eq!(report.recommendation, DriftRecommendation::Retrain);
        assert!(report.feature_scores.values().all(|score| *score > 0.2));
    }

    #[test]
    fn test_too_few_samples_is_neutral() {
        let baseline = FeatureBaseline::from_samples(&samples(0.0, 500), 10).unwrap();
        let few = samples(80.0, 10);
        let report = score_drift(&baseline, few.iter(), few.len(), 50, 0.2);
        assert_eq!(report.recommendation, DriftRecommendation::InsufficientData);
        assert!(!report.has_drift);
        assert_eq!(report.score, 0.0);
    }

    #[test]
    fn test_feature_missing_from_traffic_is_not_drift() {
        let baseline = FeatureBaseline::from_samples(&samples(0.0, 500), 10).unwrap();
        // serving stopped sending `attendees`; `duration` is unchanged
        let partial: Vec<FeatureVector> = samples(0.0, 500)
            .into_iter()
            .map(|mut vector| {
                vector.remove("attendees");
                vector
            })
            .collect();
        let report = score_drift(&baseline, partial.iter(), partial.len(), 50, 0.2);

        assert!(!report.has_drift);
        assert_eq!(report.recommendation, DriftRecommendation::NoAction);
        assert!(!report.feature_scores.contains_key("attendees"));
        assert!(report.feature_scores["duration"].abs() < 1e-9);
    }

    #[test]
    fn test_no_shared_features_is_insufficient_data() {
        let baseline = FeatureBaseline::from_samples(&samples(0.0, 500), 10).unwrap();
        let unrelated: Vec<FeatureVector> = (0..200)
            .map(|i| FeatureVector::from([("country_code".to_string(), i as f64)]))
            .collect();
        let report = score_drift(&baseline, unrelated.iter(), unrelated.len(), 50, 0.2);

        assert_eq!(report.recommendation, DriftRecommendation::InsufficientData);
        assert!(!report.has_drift);
        assert!(report.feature_scores.is_empty());
    }

    #[test]
    fn test_decile_edges() {
        let training: Vec<FeatureVector> = (0..1000)
            .map(|i| FeatureVector::from([("x".to_string(), i as f64)]))
            .collect();
        let baseline = FeatureBaseline::from_samples(&training, 10).unwrap();
        let bins = &baseline.features["x"];
        assert_eq!(bins.edges.len(), 9);
        for share in &bins.expected {
            assert!((share - 0.1).abs() < 0.01, "share {share}");
        }
    }

    #[test]
    fn test_constant_feature_collapses_to_two_bins() {
        let training: Vec<FeatureVector> = (0..100)
            .map(|_| FeatureVector::from([("flag".to_string(), 1.0)]))
            .collect();
        let baseline = FeatureBaseline::from_samples(&training, 10).unwrap();
        assert_eq!(baseline.features["flag"].bin_count(), 2);
        assert!(FeatureBaseline::from_samples(&[], 10).is_err());
    }

    #[test]
    fn test_psi_is_symmetric_in_magnitude_for_swapped_inputs() {
        let a = [0.5, 0.5];
        let b = [0.9, 0.1];
        let forward = population_stability_index(&a, &b);
        let backward = population_stability_index(&b, &a);
        assert!((forward - backward).abs() < 1e-12);
        assert_eq!(population_stability_index(&a, &a), 0.0);
    }
}
