//! The sandboxed engine instance and its raw ABI.
//!
//! The engine is LightGBM compiled to WebAssembly together with a thin C
//! glue layer that narrows every 64-bit length to `i32`. All glue exports
//! take and return `i32`: pointers into linear memory, handles, counts and
//! status codes. [`Sandbox`] is that raw surface; [`Engine`] owns one
//! sandbox and hands out [`Scope`]s for marshaling.
//!
//! # Components
//!
//! - [`loader`]: process-wide, lazily initialized [`Engine`] singleton
//! - [`config`]: where the module comes from and how it is limited
//! - [`wasm`]: the wasmtime-backed [`Sandbox`]

pub mod config;
pub mod loader;
pub mod wasm;

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::bridge::Scope;
use crate::error::Result;

pub use config::{EngineConfig, ModuleSource};
pub use loader::Loader;
pub use wasm::WasmSandbox;

// =============================================================================
// Addresses and Handles
// =============================================================================

/// An address in sandbox linear memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Ptr(pub u32);

impl Ptr {
    /// The null address.
    pub const NULL: Ptr = Ptr(0);

    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Reinterpret as the `i32` the ABI expects.
    pub fn as_arg(self) -> i32 {
        self.0 as i32
    }

    /// Reinterpret an `i32` returned by the ABI.
    pub fn from_ret(value: i32) -> Self {
        Ptr(value as u32)
    }

    pub fn offset(self, bytes: usize) -> Ptr {
        Ptr(self.0.wrapping_add(bytes as u32))
    }
}

/// An opaque engine-side object handle.
///
/// Meaningful only to the engine. Ownership lives in
/// [`OwnedHandle`](crate::handle::OwnedHandle); this type is just the key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RawHandle(pub u32);

impl RawHandle {
    pub fn as_arg(self) -> i32 {
        self.0 as i32
    }
}

// =============================================================================
// ABI Surface
// =============================================================================

/// Functions exported by the engine module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AbiFn {
    Malloc,
    Free,
    GetLastError,
    DatasetCreateFromMat,
    DatasetSetField,
    DatasetFree,
    BoosterCreate,
    BoosterUpdate,
    BoosterGetNumClasses,
    BoosterFree,
    BoosterPredict,
    BoosterSaveModel,
    BoosterLoadModel,
}

impl AbiFn {
    /// Every export the engine module must provide.
    pub const ALL: [AbiFn; 13] = [
        AbiFn::Malloc,
        AbiFn::Free,
        AbiFn::GetLastError,
        AbiFn::DatasetCreateFromMat,
        AbiFn::DatasetSetField,
        AbiFn::DatasetFree,
        AbiFn::BoosterCreate,
        AbiFn::BoosterUpdate,
        AbiFn::BoosterGetNumClasses,
        AbiFn::BoosterFree,
        AbiFn::BoosterPredict,
        AbiFn::BoosterSaveModel,
        AbiFn::BoosterLoadModel,
    ];

    /// Export symbol name.
    pub fn symbol(self) -> &'static str {
        match self {
            AbiFn::Malloc => "malloc",
            AbiFn::Free => "free",
            AbiFn::GetLastError => "wl_lgb_get_last_error",
            AbiFn::DatasetCreateFromMat => "wl_lgb_dataset_create_from_mat",
            AbiFn::DatasetSetField => "wl_lgb_dataset_set_field",
            AbiFn::DatasetFree => "wl_lgb_dataset_free",
            AbiFn::BoosterCreate => "wl_lgb_booster_create",
            AbiFn::BoosterUpdate => "wl_lgb_booster_update",
            AbiFn::BoosterGetNumClasses => "wl_lgb_booster_get_num_classes",
            AbiFn::BoosterFree => "wl_lgb_booster_free",
            AbiFn::BoosterPredict => "wl_lgb_booster_predict",
            AbiFn::BoosterSaveModel => "wl_lgb_booster_save_model",
            AbiFn::BoosterLoadModel => "wl_lgb_booster_load_model",
        }
    }

    /// Number of `i32` arguments.
    pub fn arity(self) -> usize {
        match self {
            AbiFn::GetLastError => 0,
            AbiFn::Malloc | AbiFn::Free | AbiFn::DatasetFree | AbiFn::BoosterFree => 1,
            AbiFn::BoosterUpdate | AbiFn::BoosterGetNumClasses => 2,
            AbiFn::BoosterCreate | AbiFn::BoosterLoadModel => 3,
            AbiFn::BoosterSaveModel => 4,
            AbiFn::DatasetCreateFromMat | AbiFn::DatasetSetField => 5,
            AbiFn::BoosterPredict => 9,
        }
    }

    /// `free` is the only export without a return value.
    pub fn returns_value(self) -> bool {
        !matches!(self, AbiFn::Free)
    }
}

impl fmt::Display for AbiFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

/// Field data types understood by `wl_lgb_dataset_set_field`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum FieldType {
    Float32 = 0,
    Float64 = 1,
    Int32 = 2,
    Int64 = 3,
}

/// Raw access to an engine instance: export calls and linear memory.
///
/// Implementations do no marshaling; that is the bridge's job. Calls run to
/// completion synchronously.
pub trait Sandbox: Send {
    /// Invoke an export. Returns `0` for exports without a result.
    fn call(&mut self, func: AbiFn, args: &[i32]) -> Result<i32>;

    /// Copy `buf.len()` bytes out of linear memory starting at `ptr`.
    fn read(&mut self, ptr: Ptr, buf: &mut [u8]) -> Result<()>;

    /// Copy `data` into linear memory starting at `ptr`.
    fn write(&mut self, ptr: Ptr, data: &[u8]) -> Result<()>;
}

// =============================================================================
// Engine
// =============================================================================

/// A live engine instance.
///
/// Shared as `Arc<Engine>` by every handle created from it. The sandbox sits
/// behind a mutex only so the singleton is `Sync`; calls never nest, so the
/// lock is never contended in single-threaded use.
pub struct Engine {
    sandbox: Mutex<Box<dyn Sandbox>>,
}

impl Engine {
    /// Wrap an instantiated sandbox.
    pub fn new(sandbox: impl Sandbox + 'static) -> Arc<Self> {
        Arc::new(Self {
            sandbox: Mutex::new(Box::new(sandbox)),
        })
    }

    /// Run `f` with a marshaling scope.
    ///
    /// Buffers allocated through the scope are released when `f` returns,
    /// whether it succeeded or not.
    pub fn with_scope<R>(&self, f: impl FnOnce(&mut Scope<'_>) -> Result<R>) -> Result<R> {
        let mut guard = self.sandbox.lock();
        let mut scope = Scope::new(guard.as_mut());
        f(&mut scope)
    }
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine").finish_non_exhaustive()
    }
}
