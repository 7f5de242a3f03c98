//! Test support: an in-process engine.
//!
//! Lets the full stack (bridge, handles, [`Model`](crate::Model), bundles)
//! run without a compiled `.wasm` module. The learner behind it is a
//! gradient-boosted stump ensemble, not LightGBM, so only qualitative
//! behavior carries over to the real engine.

mod learner;
mod stub;

pub use stub::{stub_engine, StubProbe, StubSandbox};
