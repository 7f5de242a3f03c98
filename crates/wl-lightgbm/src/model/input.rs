//! Normalization of caller-supplied features and targets.
//!
//! Features become one row-major `f32` buffer ([`FeatureMatrix`]); targets
//! become a `Vec<f64>`. Accepted feature layouts:
//!
//! - nested rows: `[Vec<T>]`, `Vec<Vec<T>>`, `[[T; N]]`, `[[T; N]; M]`,
//!   `Vec<[T; N]>`
//! - `ndarray` 2-D arrays and views
//! - [`FlatMatrix`]: an already flattened row-major buffer plus dimensions
//!
//! where `T` is `f32` or `f64`.

use ndarray::{ArrayBase, Data, Ix1, Ix2};

use super::params::Coerce;
use crate::error::{Error, Result};

// =============================================================================
// Element Types
// =============================================================================

/// A feature value the engine can take.
pub trait Feature: Copy {
    /// Narrow to `f32`, reporting whether precision was lost.
    fn narrow(self) -> (f32, bool);
}

impl Feature for f32 {
    fn narrow(self) -> (f32, bool) {
        (self, false)
    }
}

impl Feature for f64 {
    fn narrow(self) -> (f32, bool) {
        let narrowed = self as f32;
        let lossy = !self.is_nan() && f64::from(narrowed) != self;
        (narrowed, lossy)
    }
}

/// A target value.
pub trait Target: Copy {
    fn to_f64(self) -> f64;
}

macro_rules! impl_target {
    ($($ty:ty),+) => {
        $(impl Target for $ty {
            fn to_f64(self) -> f64 {
                self as f64
            }
        })+
    };
}

impl_target!(f32, f64, i8, i16, i32, i64, u8, u16, u32, u64, usize);

// =============================================================================
// FeatureMatrix
// =============================================================================

/// Row-major `f32` features ready for the engine.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureMatrix {
    pub data: Vec<f32>,
    pub n_rows: usize,
    pub n_cols: usize,
}

/// Collects values row by row, applying the coercion policy once at the end.
struct Collector {
    data: Vec<f32>,
    lossy: usize,
}

impl Collector {
    fn with_capacity(n: usize) -> Self {
        Self {
            data: Vec::with_capacity(n),
            lossy: 0,
        }
    }

    fn extend<T: Feature>(&mut self, values: impl IntoIterator<Item = T>) {
        for value in values {
            let (v, lossy) = value.narrow();
            self.data.push(v);
            self.lossy += usize::from(lossy);
        }
    }

    fn finish(self, n_rows: usize, n_cols: usize, coerce: Coerce) -> Result<FeatureMatrix> {
        if n_rows == 0 || n_cols == 0 {
            return Err(Error::Validation(format!(
                "feature matrix must have at least one row and one column, got {n_rows}x{n_cols}"
            )));
        }
        if self.lossy > 0 {
            match coerce {
                Coerce::Auto => {}
                Coerce::Warn => tracing::warn!(
                    values = self.lossy,
                    "feature values lost precision when narrowed to f32"
                ),
                Coerce::Error => {
                    return Err(Error::Validation(format!(
                        "{} feature values cannot be represented exactly as f32 (coerce=error)",
                        self.lossy
                    )))
                }
            }
        }
        Ok(FeatureMatrix {
            data: self.data,
            n_rows,
            n_cols,
        })
    }
}

// =============================================================================
// AsFeatures
// =============================================================================

/// Anything that can be read as a 2-D feature matrix.
pub trait AsFeatures {
    fn to_matrix(&self, coerce: Coerce) -> Result<FeatureMatrix>;
}

impl<T: Feature> AsFeatures for [Vec<T>] {
    fn to_matrix(&self, coerce: Coerce) -> Result<FeatureMatrix> {
        let n_cols = self.first().map_or(0, Vec::len);
        let mut collector = Collector::with_capacity(self.len() * n_cols);
        for (i, row) in self.iter().enumerate() {
            if row.len() != n_cols {
                return Err(Error::ShapeMismatch(format!(
                    "row {i} has {} columns, expected {n_cols}",
                    row.len()
                )));
            }
            collector.extend(row.iter().copied());
        }
        collector.finish(self.len(), n_cols, coerce)
    }
}

impl<T: Feature> AsFeatures for Vec<Vec<T>> {
    fn to_matrix(&self, coerce: Coerce) -> Result<FeatureMatrix> {
        self.as_slice().to_matrix(coerce)
    }
}

impl<T: Feature, const N: usize> AsFeatures for [[T; N]] {
    fn to_matrix(&self, coerce: Coerce) -> Result<FeatureMatrix> {
        let mut collector = Collector::with_capacity(self.len() * N);
        collector.extend(self.iter().flatten().copied());
        collector.finish(self.len(), N, coerce)
    }
}

impl<T: Feature, const N: usize> AsFeatures for Vec<[T; N]> {
    fn to_matrix(&self, coerce: Coerce) -> Result<FeatureMatrix> {
        self.as_slice().to_matrix(coerce)
    }
}

impl<T: Feature, S: Data<Elem = T>> AsFeatures for ArrayBase<S, Ix2> {
    fn to_matrix(&self, coerce: Coerce) -> Result<FeatureMatrix> {
        let (n_rows, n_cols) = self.dim();
        let mut collector = Collector::with_capacity(n_rows * n_cols);
        // Logical (row-major) order regardless of memory layout.
        collector.extend(self.iter().copied());
        collector.finish(n_rows, n_cols, coerce)
    }
}

/// A pre-flattened row-major buffer with explicit dimensions.
#[derive(Debug, Clone, Copy)]
pub struct FlatMatrix<'a, T> {
    data: &'a [T],
    n_rows: usize,
    n_cols: usize,
}

impl<'a, T> FlatMatrix<'a, T> {
    pub fn new(data: &'a [T], n_rows: usize, n_cols: usize) -> Self {
        Self {
            data,
            n_rows,
            n_cols,
        }
    }
}

impl<T: Feature> AsFeatures for FlatMatrix<'_, T> {
    fn to_matrix(&self, coerce: Coerce) -> Result<FeatureMatrix> {
        if self.n_rows.checked_mul(self.n_cols) != Some(self.data.len()) {
            return Err(Error::ShapeMismatch(format!(
                "buffer holds {} values, expected {} rows x {} columns",
                self.data.len(),
                self.n_rows,
                self.n_cols
            )));
        }
        let mut collector = Collector::with_capacity(self.data.len());
        collector.extend(self.data.iter().copied());
        collector.finish(self.n_rows, self.n_cols, coerce)
    }
}

impl<T: Feature, const N: usize, const M: usize> AsFeatures for [[T; N]; M] {
    fn to_matrix(&self, coerce: Coerce) -> Result<FeatureMatrix> {
        self.as_slice().to_matrix(coerce)
    }
}

// =============================================================================
// AsTargets
// =============================================================================

/// Anything that can be read as a 1-D target vector.
pub trait AsTargets {
    fn to_targets(&self) -> Vec<f64>;
}

impl<T: Target> AsTargets for [T] {
    fn to_targets(&self) -> Vec<f64> {
        self.iter().map(|v| v.to_f64()).collect()
    }
}

impl<T: Target> AsTargets for Vec<T> {
    fn to_targets(&self) -> Vec<f64> {
        self.as_slice().to_targets()
    }
}

impl<T: Target, const N: usize> AsTargets for [T; N] {
    fn to_targets(&self) -> Vec<f64> {
        self.as_slice().to_targets()
    }
}

impl<T: Target, S: Data<Elem = T>> AsTargets for ArrayBase<S, Ix1> {
    fn to_targets(&self) -> Vec<f64> {
        self.iter().map(|v| v.to_f64()).collect()
    }
}
