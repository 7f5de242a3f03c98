//! wl-lightgbm: a safe estimator API over LightGBM running in a WebAssembly
//! sandbox.
//!
//! The engine has no access to host memory and no garbage collector, so
//! this crate does the binding work: copying data across the sandbox
//! boundary, owning engine-side objects exactly once, and turning raw
//! handles into a fit / predict / save / load workflow.
//!
//! # Key Types
//!
//! - [`Model`] - Estimator with classification label mapping and bundles
//! - [`Params`] - Orchestrator settings plus engine pass-through parameters
//! - [`Dataset`] / [`Booster`] - Owned engine objects for lower-level use
//! - [`Engine`] - A loaded engine instance
//!
//! # Loading the Engine
//!
//! The engine module is instantiated once per process by [`load`], which
//! reads [`EngineConfig::from_env`]. Everything after loading is
//! synchronous. Use [`load_with`] to host a custom [`engine::Sandbox`].
//!
//! ```no_run
//! # async fn run() -> wl_lightgbm::Result<()> {
//! use wl_lightgbm::{Model, Params, Task};
//!
//! wl_lightgbm::load().await?;
//! let mut model = Model::new(Params::new().with_task(Task::Classification))?;
//! model.fit(&[[0.0, 1.0], [1.0, 0.0]], &[3, 7])?;
//! let bytes = model.save()?;
//! model.dispose()?;
//!
//! let mut restored = Model::load(&bytes).await?;
//! restored.dispose()?;
//! # Ok(())
//! # }
//! ```

pub mod booster;
pub mod bridge;
pub mod bundle;
pub mod dataset;
pub mod engine;
pub mod error;
pub mod handle;
pub mod model;
pub mod testing;

// =============================================================================
// Convenience Re-exports
// =============================================================================

// Estimator API
pub use model::{
    AsFeatures, AsTargets, Coerce, FlatMatrix, Model, Objective, ParamValue, Params, Task,
};

// Engine objects
pub use booster::{Booster, PredictOptions, PredictType};
pub use dataset::Dataset;
pub use engine::loader::{get, load, load_with};
pub use engine::{Engine, EngineConfig, ModuleSource};

// Errors and persistence
pub use bundle::{Bundle, BundleError, Manifest};
pub use error::{Error, Result};
