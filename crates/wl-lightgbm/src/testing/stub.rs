//! In-process implementation of the engine ABI.
//!
//! [`StubSandbox`] keeps a flat `Vec<u8>` as linear memory, serves `malloc`
//! / `free` from a bump allocator that tracks every live block, and backs
//! datasets and boosters with [`StubTrainer`]. Status codes, out-parameters
//! and the last-error string behave like the real glue layer, so the bridge
//! and handle code paths are the ones production uses.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use super::learner::{parse_params, StubModel, StubTrainer, TrainConfig};
use crate::engine::{AbiFn, Engine, FieldType, Ptr, Sandbox};
use crate::error::{Error, Result};

/// Address of the static buffer `wl_lgb_get_last_error` points at.
const ERROR_REGION: u32 = 16;
const ERROR_REGION_LEN: usize = 1024;
const HEAP_START: u32 = 2048;
const HEAP_LIMIT: usize = 256 << 20;
const HANDLE_BASE: u32 = 0x1000;

type CallResult<T> = std::result::Result<T, String>;

#[derive(Debug)]
struct StubDataset {
    data: Vec<f32>,
    n_rows: usize,
    n_cols: usize,
    label: Option<Vec<f32>>,
}

#[derive(Debug)]
enum StubBooster {
    Training(StubTrainer),
    Loaded(StubModel),
}

impl StubBooster {
    fn model(&self) -> &StubModel {
        match self {
            StubBooster::Training(trainer) => &trainer.model,
            StubBooster::Loaded(model) => model,
        }
    }
}

#[derive(Debug)]
struct StubState {
    memory: Vec<u8>,
    next_addr: u32,
    allocations: HashMap<u32, usize>,
    last_error: String,
    next_handle: u32,
    datasets: HashMap<u32, StubDataset>,
    boosters: HashMap<u32, StubBooster>,
    calls: HashMap<AbiFn, usize>,
    failures: HashMap<AbiFn, String>,
}

impl StubState {
    fn new() -> Self {
        Self {
            memory: vec![0; HEAP_START as usize],
            next_addr: HEAP_START,
            allocations: HashMap::new(),
            last_error: String::new(),
            next_handle: HANDLE_BASE,
            datasets: HashMap::new(),
            boosters: HashMap::new(),
            calls: HashMap::new(),
            failures: HashMap::new(),
        }
    }

    // =========================================================================
    // Memory
    // =========================================================================

    fn malloc(&mut self, size: i32) -> u32 {
        let Ok(size) = usize::try_from(size) else {
            return 0;
        };
        let addr = self.next_addr;
        let end = addr as usize + size.max(1);
        if end > HEAP_LIMIT {
            return 0;
        }
        self.next_addr = (end as u32 + 7) & !7;
        if self.memory.len() < self.next_addr as usize {
            self.memory.resize(self.next_addr as usize, 0);
        }
        self.allocations.insert(addr, size);
        addr
    }

    fn free(&mut self, addr: u32) -> Result<()> {
        if addr == 0 {
            return Ok(());
        }
        if self.allocations.remove(&addr).is_none() {
            return Err(Error::Sandbox(format!("free of unallocated address {addr:#x}")));
        }
        // Nothing live: rewind so long-running callers do not exhaust the heap.
        if self.allocations.is_empty() {
            self.next_addr = HEAP_START;
        }
        Ok(())
    }

    fn range(&self, ptr: i32, len: usize) -> CallResult<std::ops::Range<usize>> {
        let start = ptr as u32 as usize;
        let end = start.checked_add(len).filter(|&end| end <= self.memory.len());
        match end {
            Some(end) if start != 0 => Ok(start..end),
            _ => Err(format!("memory access out of bounds at {start:#x} (+{len})")),
        }
    }

    fn bytes(&self, ptr: i32, len: usize) -> CallResult<&[u8]> {
        Ok(&self.memory[self.range(ptr, len)?])
    }

    fn store(&mut self, ptr: i32, data: &[u8]) -> CallResult<()> {
        let range = self.range(ptr, data.len())?;
        self.memory[range].copy_from_slice(data);
        Ok(())
    }

    fn store_i32(&mut self, ptr: i32, value: i32) -> CallResult<()> {
        self.store(ptr, &value.to_le_bytes())
    }

    fn c_string(&self, ptr: i32) -> CallResult<String> {
        let start = self.range(ptr, 0)?.start;
        let len = self.memory[start..]
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| "unterminated string".to_string())?;
        Ok(String::from_utf8_lossy(&self.memory[start..start + len]).into_owned())
    }

    fn f32s(&self, ptr: i32, count: usize) -> CallResult<Vec<f32>> {
        Ok(self
            .bytes(ptr, count * 4)?
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect())
    }

    fn publish_error(&mut self) -> u32 {
        let mut text = self.last_error.as_bytes().to_vec();
        text.truncate(ERROR_REGION_LEN - 1);
        text.push(0);
        let start = ERROR_REGION as usize;
        self.memory[start..start + text.len()].copy_from_slice(&text);
        ERROR_REGION
    }

    // =========================================================================
    // Engine Calls
    // =========================================================================

    fn new_handle(&mut self) -> u32 {
        self.next_handle += 1;
        self.next_handle
    }

    fn dispatch(&mut self, func: AbiFn, a: &[i32]) -> CallResult<()> {
        match func {
            AbiFn::DatasetCreateFromMat => self.dataset_create(a[0], a[1], a[2], a[3], a[4]),
            AbiFn::DatasetSetField => self.dataset_set_field(a[0], a[1], a[2], a[3], a[4]),
            AbiFn::DatasetFree => self
                .datasets
                .remove(&(a[0] as u32))
                .map(|_| ())
                .ok_or_else(|| format!("invalid dataset handle {}", a[0])),
            AbiFn::BoosterCreate => self.booster_create(a[0], a[1], a[2]),
            AbiFn::BoosterUpdate => {
                let finished = match self.booster_mut(a[0])? {
                    StubBooster::Training(trainer) => trainer.update(),
                    StubBooster::Loaded(_) => {
                        return Err("cannot continue training a loaded model".into())
                    }
                };
                self.store_i32(a[1], i32::from(finished))
            }
            AbiFn::BoosterGetNumClasses => {
                let k = self.booster(a[0])?.model().num_class();
                self.store_i32(a[1], k as i32)
            }
            AbiFn::BoosterFree => self
                .boosters
                .remove(&(a[0] as u32))
                .map(|_| ())
                .ok_or_else(|| format!("invalid booster handle {}", a[0])),
            AbiFn::BoosterPredict => self.booster_predict(a),
            AbiFn::BoosterSaveModel => self.booster_save(a[0], a[1], a[2], a[3]),
            AbiFn::BoosterLoadModel => self.booster_load(a[0], a[1], a[2]),
            AbiFn::Malloc | AbiFn::Free | AbiFn::GetLastError => {
                Err(format!("{func} is not an engine call"))
            }
        }
    }

    fn booster(&self, handle: i32) -> CallResult<&StubBooster> {
        self.boosters
            .get(&(handle as u32))
            .ok_or_else(|| format!("invalid booster handle {handle}"))
    }

    fn booster_mut(&mut self, handle: i32) -> CallResult<&mut StubBooster> {
        self.boosters
            .get_mut(&(handle as u32))
            .ok_or_else(|| format!("invalid booster handle {handle}"))
    }

    fn dataset_create(&mut self, data: i32, rows: i32, cols: i32, params: i32, out: i32) -> CallResult<()> {
        let (n_rows, n_cols) = match (usize::try_from(rows), usize::try_from(cols)) {
            (Ok(r), Ok(c)) if r > 0 && c > 0 => (r, c),
            _ => return Err(format!("invalid matrix shape {rows}x{cols}")),
        };
        parse_params(&self.c_string(params)?)?;
        let data = self.f32s(data, n_rows * n_cols)?;
        let handle = self.new_handle();
        self.datasets.insert(
            handle,
            StubDataset {
                data,
                n_rows,
                n_cols,
                label: None,
            },
        );
        self.store_i32(out, handle as i32)
    }

    fn dataset_set_field(&mut self, handle: i32, name: i32, data: i32, count: i32, dtype: i32) -> CallResult<()> {
        let field = self.c_string(name)?;
        if dtype != FieldType::Float32 as i32 {
            return Err(format!("field {field} must be float32, got type {dtype}"));
        }
        let n_rows = self
            .datasets
            .get(&(handle as u32))
            .ok_or_else(|| format!("invalid dataset handle {handle}"))?
            .n_rows;
        if usize::try_from(count).ok() != Some(n_rows) {
            return Err(format!("length of {field} ({count}) does not match #data ({n_rows})"));
        }
        let values = self.f32s(data, n_rows)?;
        let dataset = self
            .datasets
            .get_mut(&(handle as u32))
            .ok_or_else(|| format!("invalid dataset handle {handle}"))?;
        match field.as_str() {
            "label" => dataset.label = Some(values),
            "weight" | "init_score" => {}
            other => return Err(format!("unknown field {other}")),
        }
        Ok(())
    }

    fn booster_create(&mut self, dataset: i32, params: i32, out: i32) -> CallResult<()> {
        let config = TrainConfig::from_params(&self.c_string(params)?)?;
        let ds = self
            .datasets
            .get(&(dataset as u32))
            .ok_or_else(|| format!("invalid dataset handle {dataset}"))?;
        let labels = ds
            .label
            .clone()
            .ok_or_else(|| "dataset has no label field".to_string())?;
        let trainer = StubTrainer::new(config, ds.data.clone(), labels, ds.n_rows, ds.n_cols)?;
        let handle = self.new_handle();
        self.boosters.insert(handle, StubBooster::Training(trainer));
        self.store_i32(out, handle as i32)
    }

    fn booster_predict(&mut self, a: &[i32]) -> CallResult<()> {
        let [handle, data, rows, cols, predict_type, num_iteration, params, out_len, out] = a else {
            return Err("wrong argument count".into());
        };
        let model = self.booster(*handle)?.model();
        let n_rows = usize::try_from(*rows).map_err(|_| format!("invalid row count {rows}"))?;
        let n_cols = usize::try_from(*cols).map_err(|_| format!("invalid column count {cols}"))?;
        if n_cols != model.num_features() {
            return Err(format!(
                "The number of features in data ({n_cols}) is not the same as it was in training data ({})",
                model.num_features()
            ));
        }
        parse_params(&self.c_string(*params)?)?;
        let limit = usize::try_from(*num_iteration).ok().filter(|&n| n > 0);
        let values = self.f32s(*data, n_rows * n_cols)?;
        let preds = match predict_type {
            0 => model.predict(&values, n_rows, limit),
            1 => model.raw_scores(&values, n_rows, limit),
            other => return Err(format!("unsupported predict type {other}")),
        };
        let bytes: Vec<u8> = preds.iter().flat_map(|v| v.to_le_bytes()).collect();
        self.store(*out, &bytes)?;
        self.store_i32(*out_len, preds.len() as i32)
    }

    fn booster_save(&mut self, handle: i32, capacity: i32, out_len: i32, out: i32) -> CallResult<()> {
        let mut text = self.booster(handle)?.model().to_text().into_bytes();
        text.push(0);
        let needed = text.len();
        if usize::try_from(capacity).is_ok_and(|c| c >= needed) {
            self.store(out, &text)?;
        }
        self.store_i32(out_len, needed as i32)
    }

    fn booster_load(&mut self, text: i32, out_iterations: i32, out: i32) -> CallResult<()> {
        let model = StubModel::from_text(&self.c_string(text)?)?;
        let iterations = model.num_iterations();
        let handle = self.new_handle();
        self.boosters.insert(handle, StubBooster::Loaded(model));
        self.store_i32(out_iterations, iterations as i32)?;
        self.store_i32(out, handle as i32)
    }
}

// =============================================================================
// Sandbox + Probe
// =============================================================================

/// A [`Sandbox`] that runs the engine ABI in process.
#[derive(Debug)]
pub struct StubSandbox {
    state: Arc<Mutex<StubState>>,
}

/// Observer for a [`StubSandbox`] after it has been moved into an engine.
#[derive(Debug, Clone)]
pub struct StubProbe {
    state: Arc<Mutex<StubState>>,
}

impl StubSandbox {
    #[allow(clippy::new_ret_no_self)]
    pub fn new() -> (Self, StubProbe) {
        let state = Arc::new(Mutex::new(StubState::new()));
        let probe = StubProbe {
            state: Arc::clone(&state),
        };
        (Self { state }, probe)
    }
}

impl Sandbox for StubSandbox {
    fn call(&mut self, func: AbiFn, args: &[i32]) -> Result<i32> {
        let mut state = self.state.lock();
        *state.calls.entry(func).or_default() += 1;
        if args.len() != func.arity() {
            return Err(Error::Sandbox(format!(
                "{func} expects {} arguments, got {}",
                func.arity(),
                args.len()
            )));
        }
        match func {
            AbiFn::Malloc => Ok(state.malloc(args[0]) as i32),
            AbiFn::Free => state.free(args[0] as u32).map(|()| 0),
            AbiFn::GetLastError => Ok(state.publish_error() as i32),
            _ => {
                let outcome = match state.failures.remove(&func) {
                    Some(message) => Err(message),
                    None => state.dispatch(func, args),
                };
                match outcome {
                    Ok(()) => Ok(0),
                    Err(message) => {
                        state.last_error = message;
                        Ok(-1)
                    }
                }
            }
        }
    }

    fn read(&mut self, ptr: Ptr, buf: &mut [u8]) -> Result<()> {
        let state = self.state.lock();
        let bytes = state.bytes(ptr.as_arg(), buf.len()).map_err(Error::Sandbox)?;
        buf.copy_from_slice(bytes);
        Ok(())
    }

    fn write(&mut self, ptr: Ptr, data: &[u8]) -> Result<()> {
        self.state.lock().store(ptr.as_arg(), data).map_err(Error::Sandbox)
    }
}

impl StubProbe {
    /// Sandbox buffers allocated and not yet freed.
    pub fn live_allocations(&self) -> usize {
        self.state.lock().allocations.len()
    }

    pub fn live_datasets(&self) -> usize {
        self.state.lock().datasets.len()
    }

    pub fn live_boosters(&self) -> usize {
        self.state.lock().boosters.len()
    }

    /// How many times `func` has been invoked.
    pub fn calls(&self, func: AbiFn) -> usize {
        self.state.lock().calls.get(&func).copied().unwrap_or(0)
    }

    /// Make the next call to `func` fail with `message` as the last error.
    ///
    /// Only engine calls can be failed; `malloc`, `free` and
    /// `wl_lgb_get_last_error` ignore this.
    pub fn fail_next(&self, func: AbiFn, message: &str) {
        self.state.lock().failures.insert(func, message.to_string());
    }
}

/// A fresh engine backed by a [`StubSandbox`], plus its probe.
pub fn stub_engine() -> (Arc<Engine>, StubProbe) {
    let (sandbox, probe) = StubSandbox::new();
    (Engine::new(sandbox), probe)
}
