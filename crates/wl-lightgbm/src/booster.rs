//! Engine-side boosted ensemble.
//!
//! A [`Booster`] is created one of two ways, each with its own factory:
//!
//! - [`Booster::train`]: a new, untrained booster bound to a [`Dataset`],
//!   advanced one round at a time with [`Booster::update`];
//! - [`Booster::from_model_string`]: reconstructed from the engine's text
//!   serialization produced by [`Booster::save_model`].
//!
//! After construction the booster no longer depends on the dataset.

use std::sync::Arc;

use crate::bridge::{fetch_with_length, query_length, to_i32};
use crate::dataset::{read_handle, Dataset};
use crate::engine::{AbiFn, Engine, Ptr};
use crate::error::{Error, Result};
use crate::handle::{HandleKind, OwnedHandle};

// =============================================================================
// Prediction Options
// =============================================================================

/// What the engine's prediction call returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PredictType {
    /// Transformed output: probabilities for classification, values for
    /// regression.
    #[default]
    Normal,
    /// Untransformed margins.
    RawScore,
    /// Per-feature contributions (SHAP values) plus a bias column.
    Contrib,
}

impl PredictType {
    /// Engine selector code.
    pub fn code(self) -> i32 {
        match self {
            PredictType::Normal => 0,
            PredictType::RawScore => 1,
            PredictType::Contrib => 3,
        }
    }

    fn values_per_row(self, n_cols: usize, n_classes: usize) -> Option<usize> {
        let groups = n_classes.max(1);
        match self {
            PredictType::Normal | PredictType::RawScore => Some(groups),
            PredictType::Contrib => n_cols.checked_add(1)?.checked_mul(groups),
        }
    }
}

/// Options for [`Booster::predict`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PredictOptions {
    pub predict_type: PredictType,
    /// Iterations to use; `0` uses all trained iterations.
    pub num_iteration: u32,
    /// Extra engine parameters for prediction.
    pub params: String,
}

impl PredictOptions {
    pub fn raw_score() -> Self {
        Self {
            predict_type: PredictType::RawScore,
            ..Default::default()
        }
    }
}

// =============================================================================
// Booster
// =============================================================================

/// A boosted ensemble plus its training state, owned by the engine.
#[derive(Debug)]
pub struct Booster {
    handle: OwnedHandle,
    loaded_iterations: Option<usize>,
}

impl Booster {
    /// Create an untrained booster bound to `dataset`.
    pub fn train(dataset: &Dataset, params: &str) -> Result<Self> {
        let engine = Arc::clone(dataset.engine());
        let data = dataset.raw()?;

        let raw = engine.with_scope(|scope| {
            let params_ptr = scope.write_str(params)?;
            let out = scope.write_i32_slot()?;
            scope.check(
                AbiFn::BoosterCreate,
                &[data.as_arg(), params_ptr.as_arg(), out.as_arg()],
            )?;
            read_handle(scope.read_i32(out)?, AbiFn::BoosterCreate)
        })?;

        Ok(Self {
            handle: OwnedHandle::new(engine, HandleKind::Booster, raw),
            loaded_iterations: None,
        })
    }

    /// Reconstruct a booster from its text serialization.
    pub fn from_model_string(engine: &Arc<Engine>, model: &[u8]) -> Result<Self> {
        let (raw, iterations) = engine.with_scope(|scope| {
            let text = scope.write_c_bytes(model)?;
            let out_iterations = scope.write_i32_slot()?;
            let out = scope.write_i32_slot()?;
            scope.check(
                AbiFn::BoosterLoadModel,
                &[text.as_arg(), out_iterations.as_arg(), out.as_arg()],
            )?;
            let iterations = scope.read_i32(out_iterations)?;
            let raw = read_handle(scope.read_i32(out)?, AbiFn::BoosterLoadModel)?;
            Ok((raw, iterations))
        })?;

        let mut handle = OwnedHandle::new(Arc::clone(engine), HandleKind::Booster, raw);
        let Ok(loaded_iterations) = usize::try_from(iterations) else {
            if let Err(err) = handle.release() {
                tracing::warn!(error = %err, "failed to release booster after an error");
            }
            return Err(Error::Sandbox(format!(
                "engine reported {iterations} iterations for a loaded model"
            )));
        };
        tracing::debug!(iterations, "loaded booster from model text");
        Ok(Self {
            handle,
            loaded_iterations: Some(loaded_iterations),
        })
    }

    /// Run one boosting round.
    ///
    /// Returns `true` when the engine reports that training cannot improve
    /// any further.
    pub fn update(&mut self) -> Result<bool> {
        let raw = self.handle.get()?;
        self.handle.engine().with_scope(|scope| {
            let finished = scope.write_i32_slot()?;
            scope.check(AbiFn::BoosterUpdate, &[raw.as_arg(), finished.as_arg()])?;
            Ok(scope.read_i32(finished)? != 0)
        })
    }

    /// Number of output groups (1 for regression and binary).
    pub fn num_classes(&self) -> Result<usize> {
        let raw = self.handle.get()?;
        let count = self.handle.engine().with_scope(|scope| {
            let out = scope.write_i32_slot()?;
            scope.check(AbiFn::BoosterGetNumClasses, &[raw.as_arg(), out.as_arg()])?;
            scope.read_i32(out)
        })?;
        usize::try_from(count)
            .map_err(|_| Error::Sandbox(format!("engine reported {count} classes")))
    }

    /// Predict for a row-major float32 matrix.
    ///
    /// The result is row-major: `n_rows` blocks of per-row values (one per
    /// class for multiclass objectives).
    pub fn predict(
        &self,
        data: &[f32],
        n_rows: usize,
        n_cols: usize,
        options: &PredictOptions,
    ) -> Result<Vec<f64>> {
        let raw = self.handle.get()?;
        if n_rows.checked_mul(n_cols) != Some(data.len()) {
            return Err(Error::ShapeMismatch(format!(
                "buffer holds {} values, expected {n_rows} rows x {n_cols} columns",
                data.len()
            )));
        }
        if n_rows == 0 {
            return Ok(Vec::new());
        }
        let rows = to_i32(n_rows, "row count")?;
        let cols = to_i32(n_cols, "column count")?;
        let num_iteration = to_i32(options.num_iteration as usize, "iteration limit")?;

        let n_classes = self.num_classes()?;
        let capacity = options
            .predict_type
            .values_per_row(n_cols, n_classes)
            .and_then(|per_row| per_row.checked_mul(n_rows))
            .ok_or_else(|| {
                Error::ShapeMismatch(format!(
                    "prediction output for {n_rows} rows x {n_cols} columns is too large"
                ))
            })?;

        self.handle.engine().with_scope(|scope| {
            let data_ptr = scope.write_f32s(data)?;
            let params_ptr = scope.write_str(&options.params)?;
            let out_len = scope.write_i32_slot()?;
            let out_values = scope.alloc(capacity * std::mem::size_of::<f64>())?;
            scope.check(
                AbiFn::BoosterPredict,
                &[
                    raw.as_arg(),
                    data_ptr.as_arg(),
                    rows,
                    cols,
                    options.predict_type.code(),
                    num_iteration,
                    params_ptr.as_arg(),
                    out_len.as_arg(),
                    out_values.as_arg(),
                ],
            )?;
            let written = scope.read_i32(out_len)?;
            let written = usize::try_from(written)
                .ok()
                .filter(|&w| w <= capacity)
                .ok_or_else(|| {
                    Error::Sandbox(format!(
                        "engine reported {written} predictions for a buffer of {capacity}"
                    ))
                })?;
            scope.read_f64s(out_values, written)
        })
    }

    /// The engine's native text serialization, without the trailing NUL.
    pub fn save_model(&self) -> Result<Vec<u8>> {
        let raw = self.handle.get()?;
        let save = |scope: &mut crate::bridge::Scope<'_>, capacity: i32, out_len: Ptr, buffer: Ptr| {
            scope.check(
                AbiFn::BoosterSaveModel,
                &[raw.as_arg(), capacity, out_len.as_arg(), buffer.as_arg()],
            )
        };

        let mut text = self.handle.engine().with_scope(|scope| {
            let len = query_length(scope, save)?;
            fetch_with_length(scope, len, save)
        })?;
        if text.last() == Some(&0) {
            text.pop();
        }
        Ok(text)
    }

    /// Iterations reported by the engine when this booster was loaded.
    pub fn loaded_iterations(&self) -> Option<usize> {
        self.loaded_iterations
    }

    pub fn engine(&self) -> &Arc<Engine> {
        self.handle.engine()
    }

    pub fn is_disposed(&self) -> bool {
        self.handle.is_released()
    }

    /// Free the engine-side booster. Calling it again is a no-op.
    pub fn dispose(&mut self) -> Result<()> {
        self.handle.release()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::stub_engine;

    const X: [f32; 8] = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0];

    fn binary_dataset(engine: &Arc<Engine>) -> Dataset {
        let mut ds = Dataset::from_matrix(engine, &X, 4, 2, "").unwrap();
        ds.set_label(&[0.0, 0.0, 1.0, 1.0]).unwrap();
        ds
    }

    #[test]
    fn train_update_predict() {
        let (engine, probe) = stub_engine();
        let mut ds = binary_dataset(&engine);
        let params = "objective=binary min_data_in_leaf=1 verbosity=-1";
        let mut booster = Booster::train(&ds, params).unwrap();
        ds.dispose().unwrap();

        for _ in 0..20 {
            booster.update().unwrap();
        }
        assert_eq!(booster.num_classes().unwrap(), 1);

        let probs = booster.predict(&X, 4, 2, &PredictOptions::default()).unwrap();
        assert_eq!(probs.len(), 4);
        assert!(probs[0] < 0.5 && probs[3] > 0.5, "probs: {probs:?}");
        assert!(probs.iter().all(|p| (0.0..=1.0).contains(p)));

        let raw = booster.predict(&X, 4, 2, &PredictOptions::raw_score()).unwrap();
        assert!(raw[0] < 0.0 && raw[3] > 0.0, "raw: {raw:?}");

        booster.dispose().unwrap();
        assert_eq!(probe.live_boosters(), 0);
        assert_eq!(probe.live_allocations(), 0);
    }

    #[test]
    fn update_reports_completion_when_no_split_exists() {
        let (engine, _probe) = stub_engine();
        let mut ds = Dataset::from_matrix(&engine, &[1.0, 1.0, 1.0], 3, 1, "").unwrap();
        ds.set_label(&[1.0, 2.0, 3.0]).unwrap();
        let mut booster = Booster::train(&ds, "objective=regression min_data_in_leaf=1").unwrap();
        assert!(booster.update().unwrap());
        booster.dispose().unwrap();
        ds.dispose().unwrap();
    }

    #[test]
    fn save_and_load_round_trip() {
        let (engine, probe) = stub_engine();
        let mut ds = binary_dataset(&engine);
        let mut booster = Booster::train(&ds, "objective=binary min_data_in_leaf=1").unwrap();
        ds.dispose().unwrap();
        for _ in 0..5 {
            booster.update().unwrap();
        }

        let text = booster.save_model().unwrap();
        assert_ne!(text.last(), Some(&0));
        // Two passes: one to size, one to fetch.
        assert_eq!(probe.calls(AbiFn::BoosterSaveModel), 2);

        let mut loaded = Booster::from_model_string(&engine, &text).unwrap();
        assert_eq!(loaded.loaded_iterations(), Some(5));

        let opts = PredictOptions::default();
        let a = booster.predict(&X, 4, 2, &opts).unwrap();
        let b = loaded.predict(&X, 4, 2, &opts).unwrap();
        assert_eq!(a, b);

        booster.dispose().unwrap();
        loaded.dispose().unwrap();
        assert_eq!(probe.live_boosters(), 0);
    }

    #[test]
    fn iteration_limit_is_forwarded() {
        let (engine, _probe) = stub_engine();
        let mut ds = binary_dataset(&engine);
        let mut booster = Booster::train(&ds, "objective=binary min_data_in_leaf=1").unwrap();
        ds.dispose().unwrap();
        for _ in 0..10 {
            booster.update().unwrap();
        }
        let one = PredictOptions {
            num_iteration: 1,
            ..PredictOptions::raw_score()
        };
        let first = booster.predict(&X, 4, 2, &one).unwrap();
        let all = booster.predict(&X, 4, 2, &PredictOptions::raw_score()).unwrap();
        assert!(all[3] > first[3]);
        booster.dispose().unwrap();
    }

    #[test]
    fn corrupt_model_text_fails_without_leaking() {
        let (engine, probe) = stub_engine();
        let err = Booster::from_model_string(&engine, b"definitely not a model").unwrap_err();
        assert!(matches!(err, Error::NativeCall { call: "wl_lgb_booster_load_model", .. }));
        assert_eq!(probe.live_allocations(), 0);
        assert_eq!(probe.live_boosters(), 0);
    }

    #[test]
    fn overflowing_predict_dimensions_are_a_shape_mismatch() {
        let (engine, probe) = stub_engine();
        let mut ds = binary_dataset(&engine);
        let mut booster = Booster::train(&ds, "objective=binary min_data_in_leaf=1").unwrap();
        ds.dispose().unwrap();

        let err = booster
            .predict(&X, usize::MAX, 2, &PredictOptions::default())
            .unwrap_err();
        assert!(matches!(err, Error::ShapeMismatch(_)), "got: {err:?}");
        assert_eq!(probe.calls(AbiFn::BoosterPredict), 0);
        booster.dispose().unwrap();
    }

    /// Delegates to the in-process engine but reports a negative iteration
    /// count from every model load.
    struct NegativeIterations(crate::testing::StubSandbox);

    impl crate::engine::Sandbox for NegativeIterations {
        fn call(&mut self, func: AbiFn, args: &[i32]) -> Result<i32> {
            let status = self.0.call(func, args)?;
            if func == AbiFn::BoosterLoadModel && status == 0 {
                self.0.write(Ptr(args[1] as u32), &(-1i32).to_le_bytes())?;
            }
            Ok(status)
        }

        fn read(&mut self, ptr: Ptr, buf: &mut [u8]) -> Result<()> {
            self.0.read(ptr, buf)
        }

        fn write(&mut self, ptr: Ptr, data: &[u8]) -> Result<()> {
            self.0.write(ptr, data)
        }
    }

    #[test]
    fn negative_loaded_iterations_are_a_sandbox_error() {
        let (engine, _probe) = stub_engine();
        let mut ds = binary_dataset(&engine);
        let mut booster = Booster::train(&ds, "objective=binary min_data_in_leaf=1").unwrap();
        ds.dispose().unwrap();
        booster.update().unwrap();
        let text = booster.save_model().unwrap();
        booster.dispose().unwrap();

        let (sandbox, probe) = crate::testing::StubSandbox::new();
        let faulty = Engine::new(NegativeIterations(sandbox));
        let err = Booster::from_model_string(&faulty, &text).unwrap_err();
        assert!(
            matches!(err, Error::Sandbox(ref msg) if msg.contains("-1 iterations")),
            "got: {err:?}"
        );
        assert_eq!(probe.live_boosters(), 0);
        assert_eq!(probe.live_allocations(), 0);
    }

    #[test]
    fn disposed_booster_rejects_every_operation() {
        let (engine, _probe) = stub_engine();
        let mut ds = binary_dataset(&engine);
        let mut booster = Booster::train(&ds, "objective=binary").unwrap();
        ds.dispose().unwrap();
        booster.dispose().unwrap();
        booster.dispose().unwrap();

        assert!(matches!(booster.update(), Err(Error::Disposed("Booster"))));
        assert!(matches!(booster.save_model(), Err(Error::Disposed(_))));
        assert!(matches!(booster.num_classes(), Err(Error::Disposed(_))));
        assert!(matches!(
            booster.predict(&X, 4, 2, &PredictOptions::default()),
            Err(Error::Disposed(_))
        ));
    }
}
