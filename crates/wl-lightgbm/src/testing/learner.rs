//! A deliberately small boosting learner behind the stub engine.
//!
//! Each round fits one depth-1 tree (a stump) per output group with a
//! Newton step on the objective's gradients. That is enough for the
//! orchestration layer to see real training dynamics: labels matter,
//! rounds accumulate, probabilities move, and the model text round-trips
//! bit-exactly.

use std::fmt::Write as _;

/// Objectives understood by the stub engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StubObjective {
    Regression,
    Binary,
    CrossEntropy,
    Multiclass,
    MulticlassOva,
}

impl StubObjective {
    fn parse(name: &str) -> Result<Self, String> {
        Ok(match name {
            "regression" | "regression_l2" | "l2" | "mse" | "mean_squared_error" | "rmse" => {
                Self::Regression
            }
            "binary" => Self::Binary,
            "cross_entropy" | "xentropy" => Self::CrossEntropy,
            "multiclass" | "softmax" => Self::Multiclass,
            "multiclassova" | "multiclass_ova" | "ova" | "ovr" => Self::MulticlassOva,
            other => return Err(format!("Unknown objective type name: {other}")),
        })
    }

    fn name(self) -> &'static str {
        match self {
            Self::Regression => "regression",
            Self::Binary => "binary",
            Self::CrossEntropy => "cross_entropy",
            Self::Multiclass => "multiclass",
            Self::MulticlassOva => "multiclassova",
        }
    }

    fn is_multiclass(self) -> bool {
        matches!(self, Self::Multiclass | Self::MulticlassOva)
    }
}

/// Training parameters parsed from the engine parameter string.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct TrainConfig {
    pub objective: StubObjective,
    pub num_class: usize,
    pub learning_rate: f64,
    pub min_data_in_leaf: usize,
    pub lambda_l2: f64,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            objective: StubObjective::Regression,
            num_class: 1,
            learning_rate: 0.1,
            min_data_in_leaf: 20,
            lambda_l2: 0.0,
        }
    }
}

/// Split a `key=value key=value` string, rejecting malformed tokens.
pub(crate) fn parse_params(params: &str) -> Result<Vec<(String, String)>, String> {
    params
        .split_whitespace()
        .map(|token| match token.split_once('=') {
            Some((k, v)) if !k.is_empty() => Ok((k.to_string(), v.to_string())),
            _ => Err(format!("Unknown token: {token}")),
        })
        .collect()
}

impl TrainConfig {
    pub(crate) fn from_params(params: &str) -> Result<Self, String> {
        let mut config = Self::default();
        for (key, value) in parse_params(params)? {
            match key.as_str() {
                "objective" | "objective_type" | "app" | "application" => {
                    config.objective = StubObjective::parse(&value)?;
                }
                "num_class" | "num_classes" => config.num_class = parse_num(&key, &value)?,
                "learning_rate" | "shrinkage_rate" | "eta" => {
                    config.learning_rate = parse_num(&key, &value)?;
                }
                "min_data_in_leaf" | "min_data" | "min_child_samples" => {
                    config.min_data_in_leaf = parse_num(&key, &value)?;
                }
                "lambda_l2" | "reg_lambda" | "lambda" => config.lambda_l2 = parse_num(&key, &value)?,
                _ => {}
            }
        }
        if config.objective.is_multiclass() {
            if config.num_class < 2 {
                return Err(format!(
                    "Number of classes should be specified and greater than 1 for multiclass training, got {}",
                    config.num_class
                ));
            }
        } else if config.num_class != 1 {
            return Err(format!(
                "Number of classes must be 1 for non-multiclass training, got {}",
                config.num_class
            ));
        }
        Ok(config)
    }
}

fn parse_num<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, String> {
    value
        .parse()
        .map_err(|_| format!("Parameter {key} should be of numeric type, got \"{value}\""))
}

fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

fn softmax(scores: &[f64]) -> Vec<f64> {
    let max = scores.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let exp: Vec<f64> = scores.iter().map(|s| (s - max).exp()).collect();
    let sum: f64 = exp.iter().sum();
    exp.into_iter().map(|e| e / sum).collect()
}

// =============================================================================
// Model
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq)]
struct Stump {
    class: usize,
    feature: usize,
    threshold: f64,
    left: f64,
    right: f64,
}

impl Stump {
    fn value(&self, row: &[f32]) -> f64 {
        // NaN compares false and goes right.
        if f64::from(row[self.feature]) <= self.threshold {
            self.left
        } else {
            self.right
        }
    }
}

/// Trained state: enough to predict and serialize.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct StubModel {
    objective: StubObjective,
    num_class: usize,
    num_features: usize,
    init_score: Vec<f64>,
    iterations: Vec<Vec<Stump>>,
}

const MODEL_HEADER: &str = "stub_gbm v1";
const MODEL_FOOTER: &str = "end_of_model";

impl StubModel {
    pub(crate) fn num_class(&self) -> usize {
        self.num_class
    }

    pub(crate) fn num_features(&self) -> usize {
        self.num_features
    }

    pub(crate) fn num_iterations(&self) -> usize {
        self.iterations.len()
    }

    /// Raw margins, row-major `n_rows x num_class`.
    pub(crate) fn raw_scores(&self, data: &[f32], n_rows: usize, limit: Option<usize>) -> Vec<f64> {
        let k = self.num_class;
        let used = limit.map_or(self.iterations.len(), |l| l.min(self.iterations.len()));
        let mut out = Vec::with_capacity(n_rows * k);
        for row in data.chunks_exact(self.num_features).take(n_rows) {
            let mut scores = self.init_score.clone();
            for stump in self.iterations[..used].iter().flatten() {
                scores[stump.class] += stump.value(row);
            }
            out.extend(scores);
        }
        out
    }

    /// Transformed predictions, same layout as [`raw_scores`](Self::raw_scores).
    pub(crate) fn predict(&self, data: &[f32], n_rows: usize, limit: Option<usize>) -> Vec<f64> {
        let raw = self.raw_scores(data, n_rows, limit);
        match self.objective {
            StubObjective::Regression => raw,
            StubObjective::Binary | StubObjective::CrossEntropy | StubObjective::MulticlassOva => {
                raw.into_iter().map(sigmoid).collect()
            }
            StubObjective::Multiclass => raw.chunks_exact(self.num_class).flat_map(softmax).collect(),
        }
    }

    pub(crate) fn to_text(&self) -> String {
        let mut text = String::new();
        let join = |v: &[f64]| v.iter().map(f64::to_string).collect::<Vec<_>>().join(",");
        let _ = writeln!(text, "{MODEL_HEADER}");
        let _ = writeln!(text, "objective={}", self.objective.name());
        let _ = writeln!(text, "num_class={}", self.num_class);
        let _ = writeln!(text, "num_features={}", self.num_features);
        let _ = writeln!(text, "init_score={}", join(&self.init_score));
        for (i, stumps) in self.iterations.iter().enumerate() {
            let _ = writeln!(text, "iteration={i}");
            for s in stumps {
                let _ = writeln!(
                    text,
                    "stump={} {} {} {} {}",
                    s.class, s.feature, s.threshold, s.left, s.right
                );
            }
        }
        let _ = writeln!(text, "{MODEL_FOOTER}");
        text
    }

    pub(crate) fn from_text(text: &str) -> Result<Self, String> {
        let bad = |line: &str| format!("Model format error: unexpected line '{line}'");
        let mut lines = text.lines();
        if lines.next() != Some(MODEL_HEADER) {
            return Err("Model format error: unknown model format".into());
        }

        let mut objective = None;
        let mut num_class = None;
        let mut num_features = None;
        let mut init_score = None;
        let mut iterations: Vec<Vec<Stump>> = Vec::new();
        let mut complete = false;

        for line in lines {
            if line == MODEL_FOOTER {
                complete = true;
                break;
            }
            let (key, value) = line.split_once('=').ok_or_else(|| bad(line))?;
            match key {
                "objective" => objective = Some(StubObjective::parse(value)?),
                "num_class" => num_class = Some(parse_num::<usize>(key, value)?),
                "num_features" => num_features = Some(parse_num::<usize>(key, value)?),
                "init_score" => {
                    init_score = Some(
                        value
                            .split(',')
                            .map(|v| parse_num::<f64>(key, v))
                            .collect::<Result<Vec<_>, _>>()?,
                    )
                }
                "iteration" => iterations.push(Vec::new()),
                "stump" => {
                    let f: Vec<&str> = value.split(' ').collect();
                    if f.len() != 5 {
                        return Err(bad(line));
                    }
                    let stump = Stump {
                        class: parse_num(key, f[0])?,
                        feature: parse_num(key, f[1])?,
                        threshold: parse_num(key, f[2])?,
                        left: parse_num(key, f[3])?,
                        right: parse_num(key, f[4])?,
                    };
                    iterations.last_mut().ok_or_else(|| bad(line))?.push(stump);
                }
                _ => return Err(bad(line)),
            }
        }

        if !complete {
            return Err("Model format error: model text is truncated".into());
        }
        let missing = |what: &str| format!("Model format error: missing {what}");
        let model = Self {
            objective: objective.ok_or_else(|| missing("objective"))?,
            num_class: num_class.ok_or_else(|| missing("num_class"))?,
            num_features: num_features.ok_or_else(|| missing("num_features"))?,
            init_score: init_score.ok_or_else(|| missing("init_score"))?,
            iterations,
        };
        let stumps_in_range = model
            .iterations
            .iter()
            .flatten()
            .all(|s| s.class < model.num_class && s.feature < model.num_features);
        if model.init_score.len() != model.num_class || !stumps_in_range {
            return Err("Model format error: inconsistent model dimensions".into());
        }
        Ok(model)
    }
}

// =============================================================================
// Trainer
// =============================================================================

/// Booster state while training.
#[derive(Debug, Clone)]
pub(crate) struct StubTrainer {
    config: TrainConfig,
    data: Vec<f32>,
    labels: Vec<f32>,
    n_rows: usize,
    scores: Vec<f64>,
    pub(crate) model: StubModel,
}

impl StubTrainer {
    pub(crate) fn new(
        config: TrainConfig,
        data: Vec<f32>,
        labels: Vec<f32>,
        n_rows: usize,
        n_cols: usize,
    ) -> Result<Self, String> {
        let k = config.num_class;
        match config.objective {
            StubObjective::Binary => {
                if let Some(bad) = labels.iter().find(|&&y| y != 0.0 && y != 1.0) {
                    return Err(format!("Label must be 0 or 1 for binary objective, got {bad}"));
                }
            }
            StubObjective::CrossEntropy => {
                if let Some(bad) = labels.iter().find(|&&y| !(0.0..=1.0).contains(&y)) {
                    return Err(format!("Label must be in [0, 1] for cross_entropy, got {bad}"));
                }
            }
            StubObjective::Multiclass | StubObjective::MulticlassOva => {
                if let Some(bad) = labels
                    .iter()
                    .find(|&&y| y < 0.0 || y.fract() != 0.0 || y as usize >= k)
                {
                    return Err(format!("Label must be in [0, {k}), but found {bad} in label"));
                }
            }
            StubObjective::Regression => {}
        }

        let init_score = initial_scores(&config, &labels);
        let scores = init_score.iter().copied().cycle().take(n_rows * k).collect();
        let model = StubModel {
            objective: config.objective,
            num_class: k,
            num_features: n_cols,
            init_score,
            iterations: Vec::new(),
        };
        Ok(Self {
            config,
            data,
            labels,
            n_rows,
            scores,
            model,
        })
    }

    /// One boosting round. Returns `true` when no stump could be grown.
    pub(crate) fn update(&mut self) -> bool {
        let k = self.config.num_class;
        let (grad, hess) = self.gradients();

        let mut stumps = Vec::new();
        for class in 0..k {
            let g: Vec<f64> = (0..self.n_rows).map(|i| grad[i * k + class]).collect();
            let h: Vec<f64> = (0..self.n_rows).map(|i| hess[i * k + class]).collect();
            if let Some(stump) = self.best_stump(class, &g, &h) {
                stumps.push(stump);
            }
        }
        if stumps.is_empty() {
            return true;
        }

        let n_cols = self.model.num_features;
        for (i, row) in self.data.chunks_exact(n_cols).enumerate() {
            for s in &stumps {
                self.scores[i * k + s.class] += s.value(row);
            }
        }
        self.model.iterations.push(stumps);
        false
    }

    /// Residuals (negative gradients) and hessians, row-major by class.
    fn gradients(&self) -> (Vec<f64>, Vec<f64>) {
        let k = self.config.num_class;
        let mut grad = vec![0.0; self.n_rows * k];
        let mut hess = vec![0.0; self.n_rows * k];
        for i in 0..self.n_rows {
            let y = f64::from(self.labels[i]);
            let row = &self.scores[i * k..(i + 1) * k];
            match self.config.objective {
                StubObjective::Regression => {
                    grad[i] = y - row[0];
                    hess[i] = 1.0;
                }
                StubObjective::Binary | StubObjective::CrossEntropy => {
                    let p = sigmoid(row[0]);
                    grad[i] = y - p;
                    hess[i] = p * (1.0 - p);
                }
                StubObjective::Multiclass | StubObjective::MulticlassOva => {
                    let probs = if self.config.objective == StubObjective::Multiclass {
                        softmax(row)
                    } else {
                        row.iter().copied().map(sigmoid).collect()
                    };
                    for (c, p) in probs.into_iter().enumerate() {
                        let target = if y as usize == c { 1.0 } else { 0.0 };
                        grad[i * k + c] = target - p;
                        hess[i * k + c] = p * (1.0 - p);
                    }
                }
            }
        }
        (grad, hess)
    }

    fn best_stump(&self, class: usize, grad: &[f64], hess: &[f64]) -> Option<Stump> {
        let n_cols = self.model.num_features;
        let lambda = self.config.lambda_l2;
        let min_leaf = self.config.min_data_in_leaf.max(1);
        let leaf = |g: f64, h: f64| g / (h + lambda).max(1e-12);
        let score = |g: f64, h: f64| g * g / (h + lambda).max(1e-12);

        let total_g: f64 = grad.iter().sum();
        let total_h: f64 = hess.iter().sum();
        let parent = score(total_g, total_h);

        let mut best: Option<(f64, Stump)> = None;
        for feature in 0..n_cols {
            let mut order: Vec<usize> = (0..self.n_rows)
                .filter(|&i| !self.data[i * n_cols + feature].is_nan())
                .collect();
            order.sort_by(|&a, &b| {
                self.data[a * n_cols + feature].total_cmp(&self.data[b * n_cols + feature])
            });

            let (mut gl, mut hl) = (0.0, 0.0);
            for (pos, pair) in order.windows(2).enumerate() {
                let (cur, next) = (pair[0], pair[1]);
                gl += grad[cur];
                hl += hess[cur];
                let left_count = pos + 1;
                let right_count = self.n_rows - left_count;
                let (xc, xn) = (
                    f64::from(self.data[cur * n_cols + feature]),
                    f64::from(self.data[next * n_cols + feature]),
                );
                if xc == xn || left_count < min_leaf || right_count < min_leaf {
                    continue;
                }
                let (gr, hr) = (total_g - gl, total_h - hl);
                let gain = score(gl, hl) + score(gr, hr) - parent;
                if gain > 1e-12 && best.as_ref().map_or(true, |(g, _)| gain > *g) {
                    let lr = self.config.learning_rate;
                    best = Some((
                        gain,
                        Stump {
                            class,
                            feature,
                            threshold: (xc + xn) / 2.0,
                            left: lr * leaf(gl, hl),
                            right: lr * leaf(gr, hr),
                        },
                    ));
                }
            }
        }
        best.map(|(_, stump)| stump)
    }
}

fn initial_scores(config: &TrainConfig, labels: &[f32]) -> Vec<f64> {
    let n = labels.len().max(1) as f64;
    let log_odds = |p: f64| {
        let p = p.clamp(1e-15, 1.0 - 1e-15);
        (p / (1.0 - p)).ln()
    };
    match config.objective {
        StubObjective::Regression => {
            vec![labels.iter().map(|&y| f64::from(y)).sum::<f64>() / n]
        }
        StubObjective::Binary | StubObjective::CrossEntropy => {
            vec![log_odds(labels.iter().map(|&y| f64::from(y)).sum::<f64>() / n)]
        }
        StubObjective::Multiclass => vec![0.0; config.num_class],
        StubObjective::MulticlassOva => (0..config.num_class)
            .map(|c| log_odds(labels.iter().filter(|&&y| y as usize == c).count() as f64 / n))
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trained(params: &str, data: Vec<f32>, labels: Vec<f32>, cols: usize, rounds: usize) -> StubModel {
        let rows = labels.len();
        let config = TrainConfig::from_params(params).unwrap();
        let mut trainer = StubTrainer::new(config, data, labels, rows, cols).unwrap();
        for _ in 0..rounds {
            trainer.update();
        }
        trainer.model
    }

    #[test]
    fn params_are_validated() {
        assert!(TrainConfig::from_params("objective=multiclass").is_err());
        assert!(TrainConfig::from_params("objective=binary num_class=3").is_err());
        assert!(TrainConfig::from_params("objective=lambdarank").is_err());
        assert!(TrainConfig::from_params("min_data_in_leaf").is_err());
        let config = TrainConfig::from_params("objective=softmax num_class=3 eta=0.3").unwrap();
        assert_eq!(config.objective, StubObjective::Multiclass);
        assert_eq!(config.learning_rate, 0.3);
    }

    #[test]
    fn regression_fits_a_step() {
        let model = trained(
            "objective=regression min_data_in_leaf=1 learning_rate=1",
            vec![0.0, 1.0, 2.0, 3.0],
            vec![0.0, 0.0, 10.0, 10.0],
            1,
            1,
        );
        let preds = model.predict(&[0.5, 2.5], 2, None);
        assert!((preds[0] - 0.0).abs() < 1e-9);
        assert!((preds[1] - 10.0).abs() < 1e-9);
    }

    #[test]
    fn multiclass_rows_sum_to_one() {
        let model = trained(
            "objective=multiclass num_class=3 min_data_in_leaf=1",
            vec![0.0, 1.0, 2.0, 3.0, 4.0, 5.0],
            vec![0.0, 0.0, 1.0, 1.0, 2.0, 2.0],
            1,
            10,
        );
        let probs = model.predict(&[0.0, 2.0, 5.0], 3, None);
        for row in probs.chunks(3) {
            assert!((row.iter().sum::<f64>() - 1.0).abs() < 1e-9);
        }
    }

    #[test]
    fn text_round_trip_is_exact() {
        let model = trained(
            "objective=binary min_data_in_leaf=1",
            vec![0.1, 0.7, 0.2, 0.3, 0.9, 0.05],
            vec![0.0, 1.0, 0.0],
            2,
            7,
        );
        let parsed = StubModel::from_text(&model.to_text()).unwrap();
        assert_eq!(parsed, model);
        assert_eq!(parsed.num_iterations(), 7);
    }

    #[test]
    fn truncated_text_is_rejected() {
        let model = trained("objective=binary min_data_in_leaf=1", vec![0.0, 1.0], vec![0.0, 1.0], 1, 2);
        let text = model.to_text();
        let cut = &text[..text.len() - MODEL_FOOTER.len() - 1];
        assert!(StubModel::from_text(cut).is_err());
    }
}
