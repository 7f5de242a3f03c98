//! Scores reported by [`Model::score`](crate::Model::score).

/// Fraction of exact matches.
pub fn accuracy(predicted: &[f64], expected: &[f64]) -> f64 {
    if expected.is_empty() {
        return 0.0;
    }
    let hits = predicted
        .iter()
        .zip(expected)
        .filter(|(p, e)| p == e)
        .count();
    hits as f64 / expected.len() as f64
}

/// Coefficient of determination.
///
/// Returns 0 when `expected` has no variance.
pub fn r2(predicted: &[f64], expected: &[f64]) -> f64 {
    if expected.is_empty() {
        return 0.0;
    }
    let mean = expected.iter().sum::<f64>() / expected.len() as f64;
    let ss_tot: f64 = expected.iter().map(|y| (y - mean).powi(2)).sum();
    if ss_tot == 0.0 {
        return 0.0;
    }
    let ss_res: f64 = predicted
        .iter()
        .zip(expected)
        .map(|(p, y)| (y - p).powi(2))
        .sum();
    1.0 - ss_res / ss_tot
}
