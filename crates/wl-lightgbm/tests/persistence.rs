//! Bundle save/load through the estimator.

mod common;

use approx::assert_abs_diff_eq;
use rstest::rstest;
use serde_json::json;

use common::{engine, model, multiclass_data, regression_data, small_data_params, BINARY_X};
use wl_lightgbm::bundle::{decode_bundle, encode_bundle};
use wl_lightgbm::engine::AbiFn;
use wl_lightgbm::{BundleError, Error, Manifest, Model, Params};

type Fixture = (Vec<Vec<f64>>, Vec<f64>, Params);

fn binary() -> Fixture {
    let x = BINARY_X.iter().map(|r| r.to_vec()).collect();
    (x, vec![0.0, 0.0, 1.0, 1.0], small_data_params(20).with("objective", "binary"))
}

fn multiclass() -> Fixture {
    let (x, y) = multiclass_data();
    let y = y.into_iter().map(f64::from).collect();
    (x, y, small_data_params(20).with("objective", "multiclass"))
}

fn multiclass_ova() -> Fixture {
    let (x, y, _) = multiclass();
    (x, y, small_data_params(20).with("objective", "multiclassova"))
}

fn regression() -> Fixture {
    let (x, y) = regression_data();
    let x = x.iter().map(|[v]| vec![f64::from(*v)]).collect();
    let y = y.into_iter().map(f64::from).collect();
    (x, y, small_data_params(20))
}

// =============================================================================
// Round Trips
// =============================================================================

#[rstest]
#[case::binary(binary())]
#[case::multiclass(multiclass())]
#[case::multiclass_ova(multiclass_ova())]
#[case::regression(regression())]
fn restored_model_predicts_identically(#[case] fixture: Fixture) {
    let (x, y, params) = fixture;
    let (engine, probe) = engine();
    let mut original = model(&engine, params);
    original.fit(&x, &y).unwrap();
    let bytes = original.save().unwrap();

    let mut restored = Model::from_bytes(engine.clone(), &bytes).unwrap();
    assert!(restored.is_fitted());
    assert_eq!(restored.objective(), original.objective());
    assert_eq!(restored.classes(), original.classes());
    assert_eq!(restored.params(), original.params());

    let expected = original.predict(&x).unwrap();
    let actual = restored.predict(&x).unwrap();
    for (a, e) in actual.iter().zip(expected.iter()) {
        assert_abs_diff_eq!(a, e, epsilon = 1e-6);
    }
    if original.n_classes() > 0 {
        let expected = original.predict_proba(&x).unwrap();
        let actual = restored.predict_proba(&x).unwrap();
        assert_eq!(actual.dim(), expected.dim());
        for (a, e) in actual.iter().zip(expected.iter()) {
            assert_abs_diff_eq!(a, e, epsilon = 1e-6);
        }
    }

    original.dispose().unwrap();
    restored.dispose().unwrap();
    assert_eq!(probe.live_boosters(), 0);
}

#[test]
fn bundle_describes_the_model() {
    let (x, y, params) = binary();
    let (engine, _probe) = engine();
    let mut m = model(&engine, params);
    m.fit(&x, &y).unwrap();

    let bundle = decode_bundle(&m.save().unwrap()).unwrap();
    assert_eq!(bundle.manifest.type_id, "wlearn.lightgbm.classifier@1");
    assert_eq!(bundle.manifest.params["numRound"], json!(20));
    assert_eq!(bundle.manifest.params["objective"], json!("binary"));
    assert_eq!(bundle.manifest.metadata["nClasses"], json!(2));
    assert_eq!(bundle.manifest.metadata["classes"], json!([0.0, 1.0]));
    assert_eq!(bundle.blob_ids().collect::<Vec<_>>(), vec!["model"]);
    m.dispose().unwrap();
}

#[test]
fn regressor_bundle_type() {
    let (x, y, params) = regression();
    let (engine, _probe) = engine();
    let mut m = model(&engine, params);
    m.fit(&x, &y).unwrap();

    let bundle = decode_bundle(&m.save().unwrap()).unwrap();
    assert_eq!(bundle.manifest.type_id, "wlearn.lightgbm.regressor@1");
    assert_eq!(bundle.manifest.metadata["nClasses"], json!(0));
    m.dispose().unwrap();
}

#[test]
fn save_file_then_restore() {
    let (x, y, params) = binary();
    let (engine, _probe) = engine();
    let mut m = model(&engine, params);
    m.fit(&x, &y).unwrap();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("binary.wlbd");
    m.save_file(&path).unwrap();

    let bytes = std::fs::read(&path).unwrap();
    let mut restored = Model::from_bytes(engine.clone(), &bytes).unwrap();
    assert_eq!(restored.predict(&x).unwrap(), m.predict(&x).unwrap());
    restored.dispose().unwrap();
    m.dispose().unwrap();
}

#[test]
fn restored_model_checks_feature_count() {
    let (x, y, params) = binary();
    let (engine, _probe) = engine();
    let mut m = model(&engine, params);
    m.fit(&x, &y).unwrap();
    let mut restored = Model::from_bytes(engine.clone(), &m.save().unwrap()).unwrap();

    let err = restored.predict(&[[1.0, 2.0, 3.0]]).unwrap_err();
    assert!(matches!(err, Error::ShapeMismatch(_)), "got: {err:?}");
    restored.dispose().unwrap();
    m.dispose().unwrap();
}

// =============================================================================
// Rejected Bundles
// =============================================================================

fn metadata() -> serde_json::Value {
    json!({ "nClasses": 2, "classes": [0.0, 1.0], "objective": "binary", "nFeatures": 2 })
}

#[test]
fn unknown_type_id_is_rejected() {
    let (engine, probe) = engine();
    let manifest = Manifest::new("wlearn.xgboost.classifier@1", json!({}), metadata());
    let bytes = encode_bundle(&manifest, &[("model", b"ignored")]).unwrap();

    let err = Model::from_bytes(engine, &bytes).unwrap_err();
    assert!(
        matches!(err, Error::Bundle(BundleError::UnsupportedType(ref id)) if id == "wlearn.xgboost.classifier@1"),
        "got: {err:?}"
    );
    assert_eq!(probe.live_boosters(), 0);
}

#[test]
fn missing_model_blob_is_rejected() {
    let (engine, _probe) = engine();
    let manifest = Manifest::new("wlearn.lightgbm.classifier@1", json!({}), metadata());
    let bytes = encode_bundle(&manifest, &[("weights", b"...")]).unwrap();

    let err = Model::from_bytes(engine, &bytes).unwrap_err();
    assert!(
        matches!(err, Error::Bundle(BundleError::MissingBlob(ref id)) if id == "model"),
        "got: {err:?}"
    );
}

#[test]
fn corrupt_model_text_surfaces_engine_error() {
    let (engine, probe) = engine();
    let manifest = Manifest::new("wlearn.lightgbm.classifier@1", json!({}), metadata());
    let bytes = encode_bundle(&manifest, &[("model", b"not a model")]).unwrap();

    let err = Model::from_bytes(engine, &bytes).unwrap_err();
    assert!(
        matches!(err, Error::NativeCall { call: "wl_lgb_booster_load_model", .. }),
        "got: {err:?}"
    );
    assert_eq!(probe.live_boosters(), 0);
    assert_eq!(probe.live_allocations(), 0);
}

/// Real model text from a small binary fit.
fn binary_model_text() -> Vec<u8> {
    let (x, y, params) = binary();
    let (engine, _probe) = engine();
    let mut m = model(&engine, params);
    m.fit(&x, &y).unwrap();
    let bundle = decode_bundle(&m.save().unwrap()).unwrap();
    let text = bundle.require_blob("model").unwrap().to_vec();
    m.dispose().unwrap();
    text
}

#[rstest]
#[case::one_class("wlearn.lightgbm.classifier@1", json!({ "nClasses": 1, "classes": [5.0], "objective": "binary", "nFeatures": 2 }))]
#[case::no_classes("wlearn.lightgbm.classifier@1", json!({ "nClasses": 0, "classes": [], "objective": "binary", "nFeatures": 2 }))]
#[case::three_binary_classes("wlearn.lightgbm.classifier@1", json!({ "nClasses": 3, "classes": [1.0, 2.0, 3.0], "objective": "cross_entropy", "nFeatures": 2 }))]
#[case::single_multiclass("wlearn.lightgbm.classifier@1", json!({ "nClasses": 1, "classes": [1.0], "objective": "multiclass", "nFeatures": 2 }))]
#[case::regressor_with_classes("wlearn.lightgbm.regressor@1", json!({ "nClasses": 2, "classes": [0.0, 1.0], "objective": "regression", "nFeatures": 2 }))]
fn unusable_class_list_is_rejected(#[case] type_id: &str, #[case] metadata: serde_json::Value) {
    let text = binary_model_text();
    let (engine, probe) = engine();
    let manifest = Manifest::new(type_id, json!({}), metadata);
    let bytes = encode_bundle(&manifest, &[("model", &text)]).unwrap();

    let err = Model::from_bytes(engine, &bytes).unwrap_err();
    assert!(matches!(err, Error::Validation(_)), "got: {err:?}");
    assert_eq!(probe.calls(AbiFn::BoosterLoadModel), 0);
    assert_eq!(probe.live_boosters(), 0);
}

#[test]
fn mismatched_objective_is_rejected() {
    let (engine, _probe) = engine();
    let metadata = json!({ "nClasses": 0, "classes": [], "objective": "regression" });
    let manifest = Manifest::new("wlearn.lightgbm.classifier@1", json!({}), metadata);
    let bytes = encode_bundle(&manifest, &[("model", b"ignored")]).unwrap();

    let err = Model::from_bytes(engine, &bytes).unwrap_err();
    assert!(err.is_validation(), "got: {err:?}");
}

#[test]
fn flipped_byte_fails_checksum() {
    let (x, y, params) = binary();
    let (engine, _probe) = engine();
    let mut m = model(&engine, params);
    m.fit(&x, &y).unwrap();
    let mut bytes = m.save().unwrap();
    m.dispose().unwrap();

    let last = bytes.len() - 1;
    bytes[last] ^= 0xff;
    let err = Model::from_bytes(engine, &bytes).unwrap_err();
    assert!(
        matches!(err, Error::Bundle(BundleError::ChecksumMismatch { .. })),
        "got: {err:?}"
    );
}

#[test]
fn non_bundle_bytes_are_rejected() {
    let (engine, _probe) = engine();
    let err = Model::from_bytes(engine, b"tree\nversion=v4\n").unwrap_err();
    assert!(matches!(err, Error::Bundle(BundleError::NotABundle)), "got: {err:?}");
}
