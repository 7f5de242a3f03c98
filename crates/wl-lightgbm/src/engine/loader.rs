//! One-time, lazily triggered engine initialization.
//!
//! Instantiating the module is the only asynchronous step in the crate. The
//! first `load` runs the initializer; callers that arrive while it is in
//! flight wait on the same initialization; later callers get the cached
//! engine. A failed initialization is cached too, so there is exactly one
//! attempt per [`Loader`].

use std::future::Future;
use std::sync::Arc;

use tokio::sync::OnceCell;

use super::{Engine, EngineConfig, WasmSandbox};
use crate::error::{Error, Result};

/// Holds at most one engine instance.
#[derive(Debug, Default)]
pub struct Loader {
    cell: OnceCell<std::result::Result<Arc<Engine>, String>>,
}

impl Loader {
    pub const fn new() -> Self {
        Self {
            cell: OnceCell::const_new(),
        }
    }

    /// Initialize with `init` on first use and return the shared engine.
    ///
    /// If another caller's initializer is already running, `init` is
    /// dropped unused and this call waits for that result instead.
    pub async fn load_with<F, Fut>(&self, init: F) -> Result<Arc<Engine>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Arc<Engine>>>,
    {
        let outcome = self
            .cell
            .get_or_init(|| async move {
                tracing::debug!("initializing engine module");
                init().await.map_err(|err| {
                    tracing::error!(error = %err, "engine module initialization failed");
                    err.to_string()
                })
            })
            .await;
        outcome.clone().map_err(Error::EngineLoad)
    }

    /// The engine, if a load has completed.
    pub fn get(&self) -> Result<Arc<Engine>> {
        match self.cell.get() {
            Some(Ok(engine)) => Ok(Arc::clone(engine)),
            Some(Err(message)) => Err(Error::EngineLoad(message.clone())),
            None => Err(Error::EngineNotLoaded),
        }
    }

    /// Whether a load has completed successfully.
    pub fn is_ready(&self) -> bool {
        matches!(self.cell.get(), Some(Ok(_)))
    }
}

static GLOBAL: Loader = Loader::new();

/// Load the process-wide engine from [`EngineConfig::from_env`].
pub async fn load() -> Result<Arc<Engine>> {
    GLOBAL.load_with(|| async { instantiate(EngineConfig::from_env()?).await }).await
}

/// Load the process-wide engine with a caller-supplied initializer.
///
/// Only the first initializer ever runs; see [`Loader::load_with`].
pub async fn load_with<F, Fut>(init: F) -> Result<Arc<Engine>>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<Arc<Engine>>>,
{
    GLOBAL.load_with(init).await
}

/// The process-wide engine, if loaded.
pub fn get() -> Result<Arc<Engine>> {
    GLOBAL.get()
}

/// Read and instantiate the module described by `config`.
pub async fn instantiate(config: EngineConfig) -> Result<Arc<Engine>> {
    let bytes = config.module.read().await?;
    let sandbox = WasmSandbox::instantiate(&bytes, &config)?;
    Ok(Engine::new(sandbox))
}
