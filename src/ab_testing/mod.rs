//! # A/B Testing Framework
//!
//! Experiments compare registry versions on live traffic. Assignment is
//! sticky per caller identifier, results are append-only, and a winner is
//! only declared when a two-proportion z-test on success rate says the
//! difference is significant.

pub mod allocation;
pub mod framework;
pub mod statistics;
pub mod types;

pub use framework::AbTestingFramework;
pub use statistics::{two_proportion_z_test, ZTestResult};
pub use types::{
    AllocationStrategy, Experiment, ExperimentResult, ExperimentResults, SuccessMetric, Variant,
    VariantResults, WinnerRecommendation,
};
