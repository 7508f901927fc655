//! Traffic allocation.
//!
//! Identifiers are hashed with xxh3 over `"<experiment_id>:<identifier>"` into
//! a point in `[0, 100)`, which is then matched against the cumulative traffic
//! ranges of the variants. The hash is stable across processes and restarts,
//! and the experiment id salt keeps assignments independent between
//! experiments.

use super::types::{AllocationStrategy, Experiment, Variant};
use xxhash_rust::xxh3::xxh3_64;

/// Hash resolution: points are multiples of 0.01%
const ALLOCATION_SLOTS: u64 = 10_000;

/// Deterministic point in `[0, 100)` for an identifier within an experiment
pub fn allocation_point(experiment_id: &str, identifier: &str) -> f64 {
    let hash = xxh3_64(format!("{experiment_id}:{identifier}").as_bytes());
    (hash % ALLOCATION_SLOTS) as f64 * 100.0 / ALLOCATION_SLOTS as f64
}

/// Uniform random point in `[0, 100)`
pub fn random_point() -> f64 {
    fastrand::f64() * 100.0
}

/// Map a point onto the cumulative traffic ranges. Points past the last
/// range (traffic summing to less than 100%) go to the first variant.
pub fn variant_for_point(variants: &[Variant], point: f64) -> Option<&Variant> {
    let mut upper = 0.0;
    for variant in variants {
        upper += variant.traffic_percentage;
        if point < upper {
            return Some(variant);
        }
    }
    variants.first()
}

/// Choose the variant serving `identifier` (or a random variant when no
/// stable identifier is available)
pub fn allocate<'a>(experiment: &'a Experiment, identifier: Option<&str>) -> Option<&'a Variant> {
    let point = match (experiment.allocation_strategy, identifier) {
        (AllocationStrategy::Fixed, Some(identifier)) if !identifier.is_empty() => {
            allocation_point(&experiment.experiment_id, identifier)
        }
        _ => random_point(),
    };
    variant_for_point(&experiment.variants, point)
}
