//! Engine-side training dataset.

use std::sync::Arc;

use crate::bridge::to_i32;
use crate::engine::{AbiFn, Engine, FieldType, Ptr, RawHandle};
use crate::error::{Error, Result};
use crate::handle::{HandleKind, OwnedHandle};

/// A row-major float32 matrix (plus optional label field) living inside the
/// engine.
///
/// Only needed while a [`Booster`](crate::Booster) is being constructed;
/// once the booster exists the dataset can be disposed.
#[derive(Debug)]
pub struct Dataset {
    handle: OwnedHandle,
    n_rows: usize,
    n_cols: usize,
}

impl Dataset {
    /// Copy a row-major matrix into the engine.
    ///
    /// `params` is the engine parameter string (binning options and the
    /// like); it may be empty.
    pub fn from_matrix(
        engine: &Arc<Engine>,
        data: &[f32],
        n_rows: usize,
        n_cols: usize,
        params: &str,
    ) -> Result<Self> {
        if n_rows == 0 || n_cols == 0 {
            return Err(Error::Validation(format!(
                "dataset needs at least one row and one column, got {n_rows}x{n_cols}"
            )));
        }
        if n_rows.checked_mul(n_cols) != Some(data.len()) {
            return Err(Error::ShapeMismatch(format!(
                "buffer holds {} values, expected {n_rows} rows x {n_cols} columns",
                data.len()
            )));
        }
        let rows = to_i32(n_rows, "row count")?;
        let cols = to_i32(n_cols, "column count")?;

        let raw = engine.with_scope(|scope| {
            let data_ptr = scope.write_f32s(data)?;
            let params_ptr = scope.write_str(params)?;
            let out = scope.write_i32_slot()?;
            scope.check(
                AbiFn::DatasetCreateFromMat,
                &[data_ptr.as_arg(), rows, cols, params_ptr.as_arg(), out.as_arg()],
            )?;
            read_handle(scope.read_i32(out)?, AbiFn::DatasetCreateFromMat)
        })?;

        Ok(Self {
            handle: OwnedHandle::new(Arc::clone(engine), HandleKind::Dataset, raw),
            n_rows,
            n_cols,
        })
    }

    /// Attach one label per row.
    pub fn set_label(&mut self, labels: &[f32]) -> Result<()> {
        self.set_field("label", labels)
    }

    /// Attach an optional per-row float field such as `"weight"`.
    pub fn set_field(&mut self, field: &str, values: &[f32]) -> Result<()> {
        let raw = self.handle.get()?;
        if values.len() != self.n_rows {
            return Err(Error::ShapeMismatch(format!(
                "{field} has {} values but the dataset has {} rows",
                values.len(),
                self.n_rows
            )));
        }
        let count = to_i32(values.len(), "field length")?;

        self.handle.engine().with_scope(|scope| {
            let name_ptr = scope.write_str(field)?;
            let values_ptr = scope.write_f32s(values)?;
            scope.check(
                AbiFn::DatasetSetField,
                &[
                    raw.as_arg(),
                    name_ptr.as_arg(),
                    values_ptr.as_arg(),
                    count,
                    FieldType::Float32 as i32,
                ],
            )
        })
    }

    pub fn n_rows(&self) -> usize {
        self.n_rows
    }

    pub fn n_cols(&self) -> usize {
        self.n_cols
    }

    pub fn engine(&self) -> &Arc<Engine> {
        self.handle.engine()
    }

    pub(crate) fn raw(&self) -> Result<RawHandle> {
        self.handle.get()
    }

    pub fn is_disposed(&self) -> bool {
        self.handle.is_released()
    }

    /// Free the engine-side dataset. Calling it again is a no-op.
    pub fn dispose(&mut self) -> Result<()> {
        self.handle.release()
    }
}

/// Interpret an out-parameter that should hold a freshly created handle.
pub(crate) fn read_handle(value: i32, call: AbiFn) -> Result<RawHandle> {
    let ptr = Ptr::from_ret(value);
    if ptr.is_null() {
        return Err(Error::NativeCall {
            call: call.symbol(),
            message: "engine reported success but returned a null handle".into(),
        });
    }
    Ok(RawHandle(ptr.0))
}
