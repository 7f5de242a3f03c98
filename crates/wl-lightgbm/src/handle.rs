//! Exclusive ownership of engine-side objects.
//!
//! An [`OwnedHandle`] is the only holder of one [`RawHandle`]. It is not
//! `Clone`, so a handle can never be freed twice through two owners.
//! Releasing takes the handle out, after which every access reports
//! [`Error::Disposed`].
//!
//! # Leak detection
//!
//! Dropping an `OwnedHandle` that still holds its handle means the owner
//! forgot to call `dispose()`. The drop hook logs a warning and frees the
//! handle as a last resort. It is a safety net for bugs, not a release
//! mechanism: drop order and timing are up to the caller's code.

use std::fmt;
use std::sync::Arc;

use crate::engine::{AbiFn, Engine, RawHandle};
use crate::error::{Error, Result};

/// Kind of engine object, selecting the matching free call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleKind {
    Dataset,
    Booster,
}

impl HandleKind {
    pub fn name(self) -> &'static str {
        match self {
            HandleKind::Dataset => "Dataset",
            HandleKind::Booster => "Booster",
        }
    }

    fn free_fn(self) -> AbiFn {
        match self {
            HandleKind::Dataset => AbiFn::DatasetFree,
            HandleKind::Booster => AbiFn::BoosterFree,
        }
    }
}

/// Sole owner of one engine handle.
pub struct OwnedHandle {
    engine: Arc<Engine>,
    kind: HandleKind,
    raw: Option<RawHandle>,
}

impl OwnedHandle {
    /// Take ownership of a handle just returned by the engine.
    pub(crate) fn new(engine: Arc<Engine>, kind: HandleKind, raw: RawHandle) -> Self {
        tracing::debug!(kind = kind.name(), handle = raw.0, "acquired engine handle");
        Self {
            engine,
            kind,
            raw: Some(raw),
        }
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    pub fn kind(&self) -> HandleKind {
        self.kind
    }

    /// The live handle, or [`Error::Disposed`].
    pub fn get(&self) -> Result<RawHandle> {
        self.raw.ok_or(Error::Disposed(self.kind.name()))
    }

    pub fn is_released(&self) -> bool {
        self.raw.is_none()
    }

    /// Free the handle. A second call is a no-op.
    ///
    /// The handle is cleared before the free call, so even a failed free is
    /// never retried.
    pub fn release(&mut self) -> Result<()> {
        let Some(raw) = self.raw.take() else {
            return Ok(());
        };
        tracing::debug!(kind = self.kind.name(), handle = raw.0, "releasing engine handle");
        let free = self.kind.free_fn();
        self.engine.with_scope(|scope| scope.check(free, &[raw.as_arg()]))
    }
}

impl Drop for OwnedHandle {
    fn drop(&mut self) {
        if let Some(raw) = self.raw {
            tracing::warn!(
                kind = self.kind.name(),
                handle = raw.0,
                "engine handle dropped without dispose(); releasing it now"
            );
            if let Err(err) = self.release() {
                tracing::warn!(kind = self.kind.name(), error = %err, "leaked handle release failed");
            }
        }
    }
}

impl fmt::Debug for OwnedHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OwnedHandle")
            .field("kind", &self.kind)
            .field("raw", &self.raw)
            .finish()
    }
}
