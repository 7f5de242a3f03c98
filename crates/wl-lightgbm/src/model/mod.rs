//! Estimator API: fit, predict, score and persistence.
//!
//! [`Model`] composes a [`Dataset`] and a [`Booster`] into the usual
//! estimator workflow and owns the classification label mapping.
//!
//! # Lifecycle
//!
//! ```text
//! Unfitted --fit--> Fitted --fit--> Fitted (previous booster released first)
//!     |                |
//!     +----dispose-----+-----> Disposed (terminal)
//! ```
//!
//! # Example
//!
//! ```
//! use wl_lightgbm::testing::stub_engine;
//! use wl_lightgbm::{Model, Params};
//!
//! let (engine, _probe) = stub_engine();
//! let params = Params::new()
//!     .with_num_round(20)
//!     .with("objective", "binary")
//!     .with("min_data_in_leaf", 1);
//! let mut model = Model::with_engine(engine, params).unwrap();
//!
//! let x = [[1.0, 2.0], [3.0, 4.0], [5.0, 6.0], [7.0, 8.0]];
//! model.fit(&x, &[0, 0, 1, 1]).unwrap();
//! assert_eq!(model.predict(&x).unwrap().to_vec(), vec![0.0, 0.0, 1.0, 1.0]);
//! model.dispose().unwrap();
//! ```

pub mod input;
pub mod labels;
pub mod metrics;
pub mod objective;
pub mod params;

use std::path::Path;
use std::sync::Arc;

use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};

use crate::booster::{Booster, PredictOptions};
use crate::bundle::{decode_bundle, encode_bundle, Bundle, BundleError, Manifest};
use crate::dataset::Dataset;
use crate::engine::{loader, Engine};
use crate::error::{Error, Result};

pub use input::{AsFeatures, AsTargets, FeatureMatrix, FlatMatrix};
pub use objective::{Objective, Task};
pub use params::{Coerce, ParamValue, Params};

/// Bundle type id of a fitted classifier.
pub const CLASSIFIER_TYPE_ID: &str = "wlearn.lightgbm.classifier@1";
/// Bundle type id of a fitted regressor.
pub const REGRESSOR_TYPE_ID: &str = "wlearn.lightgbm.regressor@1";
/// Blob holding the engine's text model.
pub const MODEL_BLOB: &str = "model";

// =============================================================================
// State
// =============================================================================

#[derive(Debug)]
struct Fitted {
    booster: Booster,
    objective: Objective,
    /// 0 for non-classification objectives.
    n_classes: usize,
    /// Original label of each class id.
    classes: Vec<f64>,
    n_features: Option<usize>,
}

impl Fitted {
    /// Outputs per row for Normal / RawScore predictions.
    fn groups(&self) -> usize {
        if self.objective.is_multiclass() {
            self.n_classes
        } else {
            1
        }
    }
}

#[derive(Debug)]
enum ModelState {
    Unfitted,
    Fitted(Fitted),
    Disposed,
}

/// Persisted alongside the engine model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ModelMetadata {
    n_classes: usize,
    classes: Vec<f64>,
    objective: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    n_features: Option<usize>,
}

// =============================================================================
// Model
// =============================================================================

/// A gradient-boosted model trained inside the sandboxed engine.
#[derive(Debug)]
pub struct Model {
    engine: Arc<Engine>,
    params: Params,
    state: ModelState,
}

impl Model {
    /// Unfitted model on the process-wide engine.
    ///
    /// Fails with [`Error::EngineNotLoaded`] unless [`crate::load`] has
    /// completed.
    pub fn new(params: Params) -> Result<Self> {
        Self::with_engine(loader::get()?, params)
    }

    /// Load the process-wide engine if needed, then create an unfitted model.
    pub async fn create(params: Params) -> Result<Self> {
        Self::with_engine(loader::load().await?, params)
    }

    /// Unfitted model on an explicit engine.
    pub fn with_engine(engine: Arc<Engine>, params: Params) -> Result<Self> {
        params.validate()?;
        Ok(Self {
            engine,
            params,
            state: ModelState::Unfitted,
        })
    }

    // =========================================================================
    // Training
    // =========================================================================

    /// Train on `x` and `y`, replacing any previous fit.
    pub fn fit<X, Y>(&mut self, x: &X, y: &Y) -> Result<()>
    where
        X: AsFeatures + ?Sized,
        Y: AsTargets + ?Sized,
    {
        if matches!(self.state, ModelState::Disposed) {
            return Err(Error::Disposed("Model"));
        }
        let y = y.to_targets();
        let objective = self.resolve_objective(&y)?;

        if let ModelState::Fitted(mut previous) =
            std::mem::replace(&mut self.state, ModelState::Unfitted)
        {
            tracing::debug!("releasing previous booster before refit");
            previous.booster.dispose()?;
        }

        let features = x.to_matrix(self.params.coerce)?;
        let (label_ids, classes) = if objective.is_classification() {
            let (ids, classes) = labels::encode(&y)?;
            check_class_count(&objective, classes.len(), self.params.num_class())?;
            (ids, classes)
        } else {
            (y.iter().map(|&v| v as f32).collect(), Vec::new())
        };
        if label_ids.len() != features.n_rows {
            return Err(Error::ShapeMismatch(format!(
                "{} labels for {} rows",
                label_ids.len(),
                features.n_rows
            )));
        }

        let params = self.params.engine_string(&objective, classes.len());
        tracing::debug!(%objective, rows = features.n_rows, cols = features.n_cols, %params, "fitting model");

        let mut dataset = Dataset::from_matrix(
            &self.engine,
            &features.data,
            features.n_rows,
            features.n_cols,
            &params,
        )?;
        let trained = dataset
            .set_label(&label_ids)
            .and_then(|()| self.train(&dataset, &params));
        let released = dataset.dispose();
        let mut booster = trained?;
        if let Err(err) = released {
            release_quietly(&mut booster);
            return Err(err);
        }

        self.state = ModelState::Fitted(Fitted {
            booster,
            n_classes: classes.len(),
            classes,
            objective,
            n_features: Some(features.n_cols),
        });
        Ok(())
    }

    fn resolve_objective(&self, y: &[f64]) -> Result<Objective> {
        match (self.params.task, self.params.objective()) {
            (Some(_), Some(_)) => Err(Error::Validation(
                "task and objective are mutually exclusive".into(),
            )),
            (Some(task), None) => {
                let n_distinct = labels::distinct(y).len();
                task.resolve(n_distinct).ok_or_else(|| {
                    Error::Validation(format!(
                        "classification needs at least two distinct labels, got {n_distinct}"
                    ))
                })
            }
            (None, Some(objective)) => Ok(objective),
            (None, None) => Ok(Objective::Regression),
        }
    }

    /// Run the fixed round budget. The engine's completion signal is only
    /// logged.
    fn train(&self, dataset: &Dataset, params: &str) -> Result<Booster> {
        let mut booster = Booster::train(dataset, params)?;
        let mut finished_at = None;
        for round in 0..self.params.num_round {
            match booster.update() {
                Ok(true) if finished_at.is_none() => finished_at = Some(round),
                Ok(_) => {}
                Err(err) => {
                    release_quietly(&mut booster);
                    return Err(err);
                }
            }
        }
        if let Some(round) = finished_at {
            tracing::debug!(
                round,
                budget = self.params.num_round,
                "engine reported completion before the round budget"
            );
        }
        Ok(booster)
    }

    // =========================================================================
    // Prediction
    // =========================================================================

    fn fitted(&self) -> Result<&Fitted> {
        match &self.state {
            ModelState::Fitted(fitted) => Ok(fitted),
            ModelState::Unfitted => Err(Error::NotFitted),
            ModelState::Disposed => Err(Error::Disposed("Model")),
        }
    }

    fn features<X: AsFeatures + ?Sized>(&self, fitted: &Fitted, x: &X) -> Result<FeatureMatrix> {
        let features = x.to_matrix(self.params.coerce)?;
        if let Some(expected) = fitted.n_features {
            if features.n_cols != expected {
                return Err(Error::ShapeMismatch(format!(
                    "model was trained on {expected} features, got {}",
                    features.n_cols
                )));
            }
        }
        Ok(features)
    }

    fn engine_output(
        fitted: &Fitted,
        features: &FeatureMatrix,
        options: &PredictOptions,
    ) -> Result<Vec<f64>> {
        let out = fitted
            .booster
            .predict(&features.data, features.n_rows, features.n_cols, options)?;
        let expected = features.n_rows * fitted.groups();
        if out.len() != expected {
            return Err(Error::Sandbox(format!(
                "engine returned {} predictions, expected {expected}",
                out.len()
            )));
        }
        Ok(out)
    }

    /// Labels for classification, values otherwise.
    pub fn predict<X: AsFeatures + ?Sized>(&self, x: &X) -> Result<Array1<f64>> {
        let fitted = self.fitted()?;
        let features = self.features(fitted, x)?;
        let out = Self::engine_output(fitted, &features, &PredictOptions::default())?;

        let predictions = match &fitted.objective {
            Objective::Binary | Objective::CrossEntropy => out
                .iter()
                .map(|&p| fitted.classes[usize::from(p > 0.5)])
                .collect(),
            Objective::Multiclass | Objective::MulticlassOva => out
                .chunks_exact(fitted.n_classes)
                .map(|row| fitted.classes[labels::argmax(row)])
                .collect(),
            Objective::Regression | Objective::Other(_) => out,
        };
        Ok(Array1::from(predictions))
    }

    /// Class probabilities, `rows x n_classes`.
    pub fn predict_proba<X: AsFeatures + ?Sized>(&self, x: &X) -> Result<Array2<f64>> {
        let fitted = self.fitted()?;
        if !fitted.objective.is_classification() {
            return Err(Error::ObjectiveMismatch {
                operation: "predict_proba",
                objective: fitted.objective.name().to_string(),
            });
        }
        let features = self.features(fitted, x)?;
        let out = Self::engine_output(fitted, &features, &PredictOptions::default())?;

        let probabilities = if fitted.objective.is_multiclass() {
            out
        } else {
            out.iter().flat_map(|&p| [1.0 - p, p]).collect()
        };
        let n_classes = fitted.n_classes.max(2);
        Array2::from_shape_vec((features.n_rows, n_classes), probabilities)
            .map_err(|err| Error::ShapeMismatch(err.to_string()))
    }

    /// Untransformed margins, `rows x max(n_classes, 1)` for multiclass and
    /// `rows x 1` otherwise.
    pub fn predict_raw<X: AsFeatures + ?Sized>(&self, x: &X) -> Result<Array2<f64>> {
        let fitted = self.fitted()?;
        let features = self.features(fitted, x)?;
        let out = Self::engine_output(fitted, &features, &PredictOptions::raw_score())?;
        Array2::from_shape_vec((features.n_rows, fitted.groups()), out)
            .map_err(|err| Error::ShapeMismatch(err.to_string()))
    }

    /// Accuracy for classification, R² otherwise.
    pub fn score<X, Y>(&self, x: &X, y: &Y) -> Result<f64>
    where
        X: AsFeatures + ?Sized,
        Y: AsTargets + ?Sized,
    {
        let predictions = self.predict(x)?;
        let y = y.to_targets();
        if y.len() != predictions.len() {
            return Err(Error::ShapeMismatch(format!(
                "{} targets for {} rows",
                y.len(),
                predictions.len()
            )));
        }
        let predictions = predictions.to_vec();
        let fitted = self.fitted()?;
        Ok(if fitted.objective.is_classification() {
            metrics::accuracy(&predictions, &y)
        } else {
            metrics::r2(&predictions, &y)
        })
    }

    // =========================================================================
    // Persistence
    // =========================================================================

    /// Serialize the fitted model as a bundle.
    pub fn save(&self) -> Result<Vec<u8>> {
        let fitted = self.fitted()?;
        let text = fitted.booster.save_model()?;
        let type_id = if fitted.objective.is_classification() {
            CLASSIFIER_TYPE_ID
        } else {
            REGRESSOR_TYPE_ID
        };
        let metadata = ModelMetadata {
            n_classes: fitted.n_classes,
            classes: fitted.classes.clone(),
            objective: fitted.objective.name().to_string(),
            n_features: fitted.n_features,
        };
        let manifest = Manifest::new(
            type_id,
            serde_json::to_value(&self.params).map_err(BundleError::from)?,
            serde_json::to_value(&metadata).map_err(BundleError::from)?,
        );
        Ok(encode_bundle(&manifest, &[(MODEL_BLOB, &text)])?)
    }

    /// [`save`](Self::save) to a file.
    pub fn save_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let bytes = self.save()?;
        std::fs::write(path, bytes)?;
        Ok(())
    }

    /// Restore a saved model on the process-wide engine, loading it first if
    /// needed.
    pub async fn load(bytes: &[u8]) -> Result<Self> {
        let engine = loader::load().await?;
        Self::from_bytes(engine, bytes)
    }

    /// [`load`](Self::load) from a file.
    pub async fn load_file(path: impl AsRef<Path>) -> Result<Self> {
        let bytes = tokio::fs::read(path).await?;
        Self::load(&bytes).await
    }

    /// Restore a saved model on an explicit engine.
    pub fn from_bytes(engine: Arc<Engine>, bytes: &[u8]) -> Result<Self> {
        Self::from_bundle(engine, &decode_bundle(bytes)?)
    }

    /// Restore a decoded bundle. No training happens.
    pub fn from_bundle(engine: Arc<Engine>, bundle: &Bundle) -> Result<Self> {
        let manifest = &bundle.manifest;
        let classifier = match manifest.type_id.as_str() {
            CLASSIFIER_TYPE_ID => true,
            REGRESSOR_TYPE_ID => false,
            other => return Err(BundleError::UnsupportedType(other.to_string()).into()),
        };
        let text = bundle.require_blob(MODEL_BLOB)?;
        let params: Params =
            serde_json::from_value(manifest.params.clone()).map_err(BundleError::from)?;
        params.validate()?;
        let metadata: ModelMetadata =
            serde_json::from_value(manifest.metadata.clone()).map_err(BundleError::from)?;

        let objective = Objective::parse(&metadata.objective);
        if objective.is_classification() != classifier {
            return Err(Error::Validation(format!(
                "bundle type '{}' does not match objective '{objective}'",
                manifest.type_id
            )));
        }
        if metadata.classes.len() != metadata.n_classes {
            return Err(Error::Validation(format!(
                "bundle lists {} classes but records n_classes = {}",
                metadata.classes.len(),
                metadata.n_classes
            )));
        }

        if classifier {
            check_class_count(&objective, metadata.n_classes, None)?;
        } else if metadata.n_classes != 0 {
            return Err(Error::Validation(format!(
                "regression bundle records n_classes = {}",
                metadata.n_classes
            )));
        }

        let booster = Booster::from_model_string(&engine, text)?;
        tracing::debug!(
            type_id = %manifest.type_id,
            iterations = ?booster.loaded_iterations(),
            "restored model from bundle"
        );
        Ok(Self {
            engine,
            params,
            state: ModelState::Fitted(Fitted {
                booster,
                objective,
                n_classes: metadata.n_classes,
                classes: metadata.classes,
                n_features: metadata.n_features,
            }),
        })
    }

    // =========================================================================
    // Lifecycle + Accessors
    // =========================================================================

    /// Release the booster. The model is unusable afterwards; calling this
    /// again is a no-op.
    pub fn dispose(&mut self) -> Result<()> {
        match std::mem::replace(&mut self.state, ModelState::Disposed) {
            ModelState::Fitted(mut fitted) => fitted.booster.dispose(),
            ModelState::Unfitted | ModelState::Disposed => Ok(()),
        }
    }

    pub fn params(&self) -> &Params {
        &self.params
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    /// Objective of the current fit.
    pub fn objective(&self) -> Option<&Objective> {
        self.fitted().ok().map(|f| &f.objective)
    }

    /// Sorted original class labels; empty unless fitted for classification.
    pub fn classes(&self) -> &[f64] {
        self.fitted().map(|f| f.classes.as_slice()).unwrap_or(&[])
    }

    /// Number of classes; 0 for regression or when not fitted.
    pub fn n_classes(&self) -> usize {
        self.fitted().map_or(0, |f| f.n_classes)
    }

    pub fn is_fitted(&self) -> bool {
        matches!(self.state, ModelState::Fitted(_))
    }

    pub fn is_disposed(&self) -> bool {
        matches!(self.state, ModelState::Disposed)
    }

    /// The fitted booster, for lower-level calls.
    pub fn booster(&self) -> Option<&Booster> {
        self.fitted().ok().map(|f| &f.booster)
    }
}

fn check_class_count(objective: &Objective, n: usize, configured: Option<i64>) -> Result<()> {
    if n < 2 {
        return Err(Error::Validation(format!(
            "classification needs at least two distinct labels, got {n}"
        )));
    }
    if !objective.is_multiclass() && n > 2 {
        return Err(Error::Validation(format!(
            "objective '{objective}' supports two classes, got {n}; use multiclass"
        )));
    }
    if let Some(configured) = configured.filter(|_| objective.is_multiclass()) {
        if configured != n as i64 {
            return Err(Error::Validation(format!(
                "num_class = {configured} but the labels contain {n} classes"
            )));
        }
    }
    Ok(())
}

fn release_quietly(booster: &mut Booster) {
    if let Err(err) = booster.dispose() {
        tracing::warn!(error = %err, "failed to release booster after an error");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::stub_engine;

    fn binary_params() -> Params {
        Params::new()
            .with_num_round(10)
            .with("objective", "binary")
            .with("min_data_in_leaf", 1)
    }

    const X: [[f64; 2]; 4] = [[1.0, 2.0], [3.0, 4.0], [5.0, 6.0], [7.0, 8.0]];

    #[test]
    fn new_requires_loaded_engine_or_explicit_one() {
        let (engine, _probe) = stub_engine();
        assert!(Model::with_engine(engine, Params::new()).is_ok());
    }

    #[test]
    fn invalid_params_fail_at_construction() {
        let (engine, _probe) = stub_engine();
        let params = Params::new().with_task(Task::Regression).with("objective", "l2");
        assert!(matches!(Model::with_engine(engine, params), Err(Error::Validation(_))));
    }

    #[test]
    fn fit_releases_dataset_and_keeps_one_booster() {
        let (engine, probe) = stub_engine();
        let mut model = Model::with_engine(engine, binary_params()).unwrap();
        model.fit(&X, &[0, 0, 1, 1]).unwrap();
        assert_eq!(probe.live_datasets(), 0);
        assert_eq!(probe.live_boosters(), 1);
        assert_eq!(probe.calls(crate::engine::AbiFn::BoosterUpdate), 10);
        assert_eq!(probe.live_allocations(), 0);
        model.dispose().unwrap();
        assert_eq!(probe.live_boosters(), 0);
    }

    #[test]
    fn failing_round_releases_everything() {
        let (engine, probe) = stub_engine();
        let mut model = Model::with_engine(engine, binary_params()).unwrap();
        probe.fail_next(crate::engine::AbiFn::BoosterUpdate, "round failed");
        let err = model.fit(&X, &[0, 0, 1, 1]).unwrap_err();
        assert!(matches!(err, Error::NativeCall { .. }));
        assert!(!model.is_fitted());
        assert_eq!(probe.live_boosters(), 0);
        assert_eq!(probe.live_datasets(), 0);
    }

    #[test]
    fn binary_with_three_labels_fails_before_engine_calls() {
        let (engine, probe) = stub_engine();
        let params = Params::new().with("objective", "binary");
        let mut model = Model::with_engine(engine, params).unwrap();
        let err = model.fit(&X, &[0, 1, 2, 2]).unwrap_err();
        assert!(err.is_validation(), "{err}");
        assert_eq!(probe.calls(crate::engine::AbiFn::DatasetCreateFromMat), 0);
    }

    #[test]
    fn predict_checks_feature_count() {
        let (engine, _probe) = stub_engine();
        let mut model = Model::with_engine(engine, binary_params()).unwrap();
        model.fit(&X, &[0, 0, 1, 1]).unwrap();
        let err = model.predict(&[[1.0, 2.0, 3.0]]).unwrap_err();
        assert!(matches!(err, Error::ShapeMismatch(_)));
        model.dispose().unwrap();
    }

    #[test]
    fn num_class_must_match_labels() {
        let (engine, _probe) = stub_engine();
        let params = Params::new()
            .with("objective", "multiclass")
            .with("num_class", 4);
        let mut model = Model::with_engine(engine, params).unwrap();
        assert!(matches!(model.fit(&X, &[0, 1, 2, 2]), Err(Error::Validation(_))));
    }

    #[test]
    fn predict_raw_shape() {
        let (engine, _probe) = stub_engine();
        let mut model = Model::with_engine(engine, binary_params()).unwrap();
        model.fit(&X, &[0, 0, 1, 1]).unwrap();
        let raw = model.predict_raw(&X).unwrap();
        assert_eq!(raw.dim(), (4, 1));
        assert!(raw[[0, 0]] < 0.0 && raw[[3, 0]] > 0.0);
        model.dispose().unwrap();
    }

    #[test]
    fn accessors_follow_state() {
        let (engine, _probe) = stub_engine();
        let mut model = Model::with_engine(engine, binary_params()).unwrap();
        assert!(model.objective().is_none());
        assert!(model.classes().is_empty());
        model.fit(&X, &[3, 3, 7, 7]).unwrap();
        assert_eq!(model.objective(), Some(&Objective::Binary));
        assert_eq!(model.classes(), &[3.0, 7.0]);
        assert_eq!(model.n_classes(), 2);
        assert!(model.booster().is_some());
        model.dispose().unwrap();
        assert!(model.is_disposed());
        assert!(model.booster().is_none());
    }
}
