//! Error types for the sandboxed engine bindings.
//!
//! Every fallible operation in the crate returns [`Result`]. Variants are
//! grouped by where the failure originates: the loader, the engine itself,
//! input validation, object lifecycle, or persisted bundles.

use thiserror::Error;

use crate::bundle::BundleError;

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur while driving the engine.
#[derive(Debug, Error)]
pub enum Error {
    /// Synchronous engine access before any `load()` completed.
    #[error("engine module not loaded; await `wl_lightgbm::load()` first")]
    EngineNotLoaded,

    /// The one-time engine initialization failed. The failure is sticky.
    #[error("engine module failed to load: {0}")]
    EngineLoad(String),

    /// The engine returned a nonzero status code.
    #[error("{call} failed: {message}")]
    NativeCall {
        /// ABI function that failed.
        call: &'static str,
        /// Engine's last-error text, read right after the failing call.
        message: String,
    },

    /// Trap, out-of-bounds access, or allocation failure inside the sandbox.
    #[error("sandbox fault: {0}")]
    Sandbox(String),

    /// Engine configuration is incomplete or the module is unusable.
    #[error("configuration error: {0}")]
    Config(String),

    /// Invalid hyperparameter value.
    #[error("invalid parameter '{name}': {reason}")]
    InvalidParameter { name: String, reason: String },

    /// Shape mismatch between arrays.
    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    /// Input rejected before any engine call.
    #[error("validation error: {0}")]
    Validation(String),

    /// Operation is not defined for the fitted objective.
    #[error("{operation} is not supported for objective '{objective}'")]
    ObjectiveMismatch {
        operation: &'static str,
        objective: String,
    },

    /// Operation on an object whose engine handle was released.
    #[error("{0} has been disposed")]
    Disposed(&'static str),

    /// Operation requires a fitted model.
    #[error("model not fitted. Call fit() first.")]
    NotFitted,

    /// Persisted bundle could not be decoded or is incomplete.
    #[error(transparent)]
    Bundle(#[from] BundleError),

    /// I/O error reading a module or bundle file.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub(crate) fn invalid_parameter(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::InvalidParameter {
            name: name.into(),
            reason: reason.into(),
        }
    }

    /// Input was rejected before reaching the engine.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Error::InvalidParameter { .. }
                | Error::ShapeMismatch(_)
                | Error::Validation(_)
                | Error::ObjectiveMismatch { .. }
        )
    }

    /// Operation was attempted in the wrong lifecycle state.
    pub fn is_lifecycle(&self) -> bool {
        matches!(self, Error::Disposed(_) | Error::NotFitted)
    }
}

// =============================================================================
// Result Type Alias
// =============================================================================

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;
