//! Engine configuration.
//!
//! [`EngineConfig`] says where the WebAssembly module comes from and how the
//! sandbox is limited. Build one explicitly with the `bon` builder, or pick
//! it up from the environment with [`EngineConfig::from_env`].
//!
//! # Example
//!
//! ```
//! use wl_lightgbm::engine::{EngineConfig, ModuleSource};
//!
//! let config = EngineConfig::builder()
//!     .module(ModuleSource::Path("lib/wl_lightgbm.wasm".into()))
//!     .max_memory_bytes(256 << 20)
//!     .build();
//! assert_eq!(config.max_memory_bytes, 256 << 20);
//! ```

use std::path::PathBuf;

use bon::Builder;

use crate::error::{Error, Result};

/// Environment variable holding the path to the engine module.
pub const MODULE_PATH_ENV: &str = "WL_LIGHTGBM_WASM";

/// Environment variable overriding the linear-memory cap, in bytes.
pub const MAX_MEMORY_ENV: &str = "WL_LIGHTGBM_MAX_MEMORY";

/// Default linear-memory cap (1 GiB).
pub const DEFAULT_MAX_MEMORY: usize = 1 << 30;

/// Where the compiled engine module is read from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModuleSource {
    /// A `.wasm` file on disk.
    Path(PathBuf),
    /// Module bytes already in memory.
    Bytes(Vec<u8>),
}

impl ModuleSource {
    /// Read the module bytes.
    pub async fn read(&self) -> Result<Vec<u8>> {
        match self {
            ModuleSource::Path(path) => tokio::fs::read(path).await.map_err(|e| {
                Error::Config(format!("cannot read engine module {}: {e}", path.display()))
            }),
            ModuleSource::Bytes(bytes) => Ok(bytes.clone()),
        }
    }
}

/// Configuration for instantiating the sandboxed engine.
#[derive(Debug, Clone, Builder)]
pub struct EngineConfig {
    /// Module to instantiate.
    pub module: ModuleSource,

    /// Upper bound on sandbox linear memory. Default: 1 GiB.
    #[builder(default = DEFAULT_MAX_MEMORY)]
    pub max_memory_bytes: usize,

    /// Forward the module's stdout/stderr to the host process.
    ///
    /// Useful with `verbosity` above -1, when the engine prints progress.
    #[builder(default)]
    pub inherit_stdio: bool,
}

impl EngineConfig {
    /// Build a configuration from `WL_LIGHTGBM_WASM` and
    /// `WL_LIGHTGBM_MAX_MEMORY`.
    pub fn from_env() -> Result<Self> {
        let path = std::env::var_os(MODULE_PATH_ENV).ok_or_else(|| {
            Error::Config(format!(
                "{MODULE_PATH_ENV} is not set; point it at the compiled engine module"
            ))
        })?;

        let max_memory_bytes = match std::env::var(MAX_MEMORY_ENV) {
            Ok(raw) => raw.trim().parse::<usize>().map_err(|_| {
                Error::Config(format!("{MAX_MEMORY_ENV} must be a byte count, got '{raw}'"))
            })?,
            Err(_) => DEFAULT_MAX_MEMORY,
        };

        Ok(Self::builder()
            .module(ModuleSource::Path(PathBuf::from(path)))
            .max_memory_bytes(max_memory_bytes)
            .build())
    }
}
