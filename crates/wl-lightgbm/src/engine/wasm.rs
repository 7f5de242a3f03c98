//! wasmtime-backed [`Sandbox`].
//!
//! The engine module is a WASI reactor: it imports `wasi_snapshot_preview1`
//! for stdio and clocks, and may import a few toolchain hooks under `env`
//! that are never reached on the paths we call. Those are linked as traps.

use std::collections::HashMap;

use wasmtime::{Func, Instance, Linker, Memory, Module, Store, StoreLimits, StoreLimitsBuilder, Val};
use wasmtime_wasi::preview1::{self, WasiP1Ctx};
use wasmtime_wasi::WasiCtxBuilder;

use super::{AbiFn, EngineConfig, Ptr, Sandbox};
use crate::error::{Error, Result};

struct HostState {
    wasi: WasiP1Ctx,
    limits: StoreLimits,
}

/// An instantiated engine module.
pub struct WasmSandbox {
    store: Store<HostState>,
    memory: Memory,
    exports: HashMap<AbiFn, Func>,
}

impl WasmSandbox {
    /// Compile and instantiate `module_bytes`.
    pub fn instantiate(module_bytes: &[u8], config: &EngineConfig) -> Result<Self> {
        let engine = wasmtime::Engine::default();
        let module = Module::new(&engine, module_bytes)
            .map_err(|e| Error::Config(format!("invalid engine module: {e:#}")))?;

        let mut linker: Linker<HostState> = Linker::new(&engine);
        preview1::add_to_linker_sync(&mut linker, |state: &mut HostState| &mut state.wasi)
            .map_err(|e| Error::Config(format!("failed to link WASI: {e:#}")))?;
        linker
            .define_unknown_imports_as_traps(&module)
            .map_err(|e| Error::Config(format!("failed to link module imports: {e:#}")))?;

        let mut wasi = WasiCtxBuilder::new();
        if config.inherit_stdio {
            wasi.inherit_stdout().inherit_stderr();
        }
        let state = HostState {
            wasi: wasi.build_p1(),
            limits: StoreLimitsBuilder::new()
                .memory_size(config.max_memory_bytes)
                .build(),
        };
        let mut store = Store::new(&engine, state);
        store.limiter(|state| &mut state.limits);

        let instance = linker
            .instantiate(&mut store, &module)
            .map_err(|e| Error::Config(format!("failed to instantiate engine module: {e:#}")))?;

        if let Some(init) = instance.get_func(&mut store, "_initialize") {
            init.call(&mut store, &[], &mut [])
                .map_err(|e| Error::Sandbox(format!("module initialization trapped: {e:#}")))?;
        }

        let memory = instance
            .get_memory(&mut store, "memory")
            .ok_or_else(|| Error::Config("engine module does not export `memory`".into()))?;
        let exports = resolve_exports(&instance, &mut store)?;

        tracing::debug!(
            exports = exports.len(),
            max_memory_bytes = config.max_memory_bytes,
            "engine module instantiated"
        );

        Ok(Self {
            store,
            memory,
            exports,
        })
    }

    /// Current linear-memory size in bytes.
    pub fn memory_size(&self) -> usize {
        self.memory.data_size(&self.store)
    }
}

fn resolve_exports(instance: &Instance, store: &mut Store<HostState>) -> Result<HashMap<AbiFn, Func>> {
    AbiFn::ALL
        .iter()
        .map(|&func| {
            instance
                .get_func(&mut *store, func.symbol())
                .map(|f| (func, f))
                .ok_or_else(|| {
                    Error::Config(format!("engine module is missing export `{}`", func.symbol()))
                })
        })
        .collect()
}

impl Sandbox for WasmSandbox {
    fn call(&mut self, func: AbiFn, args: &[i32]) -> Result<i32> {
        let export = *self
            .exports
            .get(&func)
            .ok_or_else(|| Error::Config(format!("engine module is missing export `{func}`")))?;
        debug_assert_eq!(args.len(), func.arity(), "wrong arity for {func}");

        let params: Vec<Val> = args.iter().map(|&a| Val::I32(a)).collect();
        let mut results = [Val::I32(0)];
        let results = if func.returns_value() {
            &mut results[..]
        } else {
            &mut results[..0]
        };

        export
            .call(&mut self.store, &params, results)
            .map_err(|e| Error::Sandbox(format!("{func} trapped: {e:#}")))?;

        Ok(results.first().and_then(Val::i32).unwrap_or(0))
    }

    fn read(&mut self, ptr: Ptr, buf: &mut [u8]) -> Result<()> {
        self.memory
            .read(&self.store, ptr.0 as usize, buf)
            .map_err(|_| out_of_bounds(ptr, buf.len()))
    }

    fn write(&mut self, ptr: Ptr, data: &[u8]) -> Result<()> {
        self.memory
            .write(&mut self.store, ptr.0 as usize, data)
            .map_err(|_| out_of_bounds(ptr, data.len()))
    }
}

fn out_of_bounds(ptr: Ptr, len: usize) -> Error {
    Error::Sandbox(format!(
        "access of {len} bytes at {:#x} is outside linear memory",
        ptr.0
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::ModuleSource;

    fn config() -> EngineConfig {
        EngineConfig::builder()
            .module(ModuleSource::Bytes(Vec::new()))
            .build()
    }

    #[test]
    fn rejects_non_wasm_bytes() {
        let err = WasmSandbox::instantiate(b"not a module", &config()).err().unwrap();
        assert!(matches!(err, Error::Config(_)), "got {err:?}");
    }

    #[test]
    fn reports_missing_exports() {
        // (module (memory (export "memory") 1))
        let module = [
            0x00, 0x61, 0x73, 0x6d, 0x01, 0x00, 0x00, 0x00, // header
            0x05, 0x03, 0x01, 0x00, 0x01, // memory section: 1 page
            0x07, 0x0a, 0x01, 0x06, b'm', b'e', b'm', b'o', b'r', b'y', 0x02, 0x00, // export
        ];
        let err = WasmSandbox::instantiate(&module, &config()).err().unwrap();
        match err {
            Error::Config(msg) => assert!(msg.contains("malloc"), "message: {msg}"),
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
