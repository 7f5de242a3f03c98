//! Shared fixtures for integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use tracing_subscriber::EnvFilter;
use wl_lightgbm::testing::{stub_engine, StubProbe};
use wl_lightgbm::{Engine, Model, Params};

/// Route library logs to the test harness. Honors `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A fresh in-process engine.
pub fn engine() -> (Arc<Engine>, StubProbe) {
    init_tracing();
    stub_engine()
}

/// Params that let the tiny fixtures below actually split.
pub fn small_data_params(num_round: u32) -> Params {
    Params::new()
        .with_num_round(num_round)
        .with("min_data_in_leaf", 1)
}

pub fn model(engine: &Arc<Engine>, params: Params) -> Model {
    Model::with_engine(Arc::clone(engine), params).expect("valid params")
}

// =============================================================================
// Datasets
// =============================================================================

/// The 4-row, 2-feature binary fixture.
pub const BINARY_X: [[f64; 2]; 4] = [[1.0, 2.0], [3.0, 4.0], [5.0, 6.0], [7.0, 8.0]];

/// Three well-separated groups along one feature.
pub fn multiclass_data() -> (Vec<Vec<f64>>, Vec<i32>) {
    let x = (0..12).map(|i| vec![f64::from(i), f64::from(i % 3)]).collect();
    let y = (0..12).map(|i| [10, 20, 30][i / 4]).collect();
    (x, y)
}

/// `y = 2x + 1` on a small grid.
pub fn regression_data() -> (Vec<[f32; 1]>, Vec<f32>) {
    let x: Vec<[f32; 1]> = (0..16).map(|i| [i as f32]).collect();
    let y = x.iter().map(|[v]| 2.0 * v + 1.0).collect();
    (x, y)
}
