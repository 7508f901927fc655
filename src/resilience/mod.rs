//! # Resilience Module
//!
//! Retry timing for pipeline tasks. Delays grow exponentially from a base
//! delay, optionally jittered, and are capped at a configured maximum.

pub mod backoff;

pub use backoff::BackoffPolicy;
