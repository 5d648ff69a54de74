//! Common test utilities and helpers

#![allow(dead_code)] // Test utilities may not all be used in every test file

pub mod builders;
pub mod harness;

use preproc_rs::pipeline::MemorySink;
use preproc_rs::Variant;
use std::time::Duration;

/// Create a test timeout duration
pub fn test_timeout() -> Duration {
    Duration::from_millis(100)
}

/// Upper bound for waiting on threaded pipelines
pub fn pipeline_timeout() -> Duration {
    Duration::from_secs(5)
}

/// Assert two floats are approximately equal
pub fn assert_float_eq(a: f64, b: f64, epsilon: f64) {
    assert!(
        (a - b).abs() < epsilon,
        "Expected {} to be approximately equal to {} (epsilon: {})",
        a,
        b,
        epsilon
    );
}

/// `(itemid, value)` pairs in delivery order
pub fn delivered(sink: &MemorySink) -> Vec<(u64, Variant)> {
    sink.records()
        .into_iter()
        .map(|r| (r.value.itemid, r.value.value))
        .collect()
}
