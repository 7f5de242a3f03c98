//! Classification label mapping.
//!
//! The engine wants class ids `0..n`. Callers may use any integer labels,
//! so fitting remaps them through the sorted distinct values and prediction
//! maps back.

use crate::error::{Error, Result};

/// Sorted distinct values of `y`, with `-0.0` folded into `0.0`.
pub fn distinct(y: &[f64]) -> Vec<f64> {
    let mut values: Vec<f64> = y.iter().map(|&v| v + 0.0).collect();
    values.sort_by(f64::total_cmp);
    values.dedup_by(|a, b| a.total_cmp(b).is_eq());
    values
}

/// Remap integer labels to contiguous class ids.
///
/// Returns the engine-ready label vector and the sorted class list whose
/// positions are the ids.
pub fn encode(y: &[f64]) -> Result<(Vec<f32>, Vec<f64>)> {
    if let Some((i, v)) = y
        .iter()
        .enumerate()
        .find(|(_, v)| !v.is_finite() || v.fract() != 0.0)
    {
        return Err(Error::Validation(format!(
            "classification labels must be integers, got {v} at index {i}"
        )));
    }
    let classes = distinct(y);
    let ids = y
        .iter()
        .map(|&v| {
            classes
                .binary_search_by(|c| c.total_cmp(&(v + 0.0)))
                .map(|id| id as f32)
                .map_err(|_| Error::Validation(format!("label {v} missing from class list")))
        })
        .collect::<Result<Vec<_>>>()?;
    Ok((ids, classes))
}

/// Index of the largest value; the first one wins ties.
pub fn argmax(row: &[f64]) -> usize {
    let mut best = 0;
    for (i, &v) in row.iter().enumerate().skip(1) {
        if v > row[best] {
            best = i;
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn remaps_to_sorted_positions() {
        let (ids, classes) = encode(&[7.0, 3.0, 7.0, -2.0]).unwrap();
        assert_eq!(classes, vec![-2.0, 3.0, 7.0]);
        assert_eq!(ids, vec![2.0, 1.0, 2.0, 0.0]);
    }

    #[test]
    fn negative_zero_is_zero() {
        let (ids, classes) = encode(&[-0.0, 0.0, 1.0]).unwrap();
        assert_eq!(classes.len(), 2);
        assert_eq!(ids, vec![0.0, 0.0, 1.0]);
    }

    #[test]
    fn non_integer_labels_are_rejected() {
        let err = encode(&[0.0, 0.5]).unwrap_err();
        assert!(err.is_validation());
        assert!(err.to_string().contains("index 1"));
        assert!(encode(&[f64::NAN]).is_err());
    }

    #[test]
    fn argmax_prefers_first() {
        assert_eq!(argmax(&[0.2, 0.4, 0.4]), 1);
        assert_eq!(argmax(&[0.5, 0.5]), 0);
        assert_eq!(argmax(&[0.1]), 0);
    }

    proptest! {
        #[test]
        fn ids_index_back_to_labels(y in prop::collection::vec(-50i32..50, 1..64)) {
            let y: Vec<f64> = y.into_iter().map(f64::from).collect();
            let (ids, classes) = encode(&y).unwrap();
            prop_assert!(classes.windows(2).all(|w| w[0] < w[1]));
            for (id, label) in ids.iter().zip(&y) {
                prop_assert_eq!(classes[*id as usize], *label);
            }
        }
    }
}
