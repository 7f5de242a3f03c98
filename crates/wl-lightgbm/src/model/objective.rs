//! Engine objectives and how their outputs are read.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Shorthand that picks an objective from the data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Task {
    /// Binary or multiclass, depending on the number of distinct labels.
    Classification,
    /// Plain regression.
    Regression,
}

impl Task {
    /// Concrete objective for `n_distinct` label values.
    ///
    /// Returns `None` for classification with fewer than two labels.
    pub fn resolve(self, n_distinct: usize) -> Option<Objective> {
        match self {
            Task::Regression => Some(Objective::Regression),
            Task::Classification => match n_distinct {
                0 | 1 => None,
                2 => Some(Objective::Binary),
                _ => Some(Objective::Multiclass),
            },
        }
    }
}

/// The engine's loss configuration, as far as the host needs to know it.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Objective {
    #[default]
    Regression,
    Binary,
    CrossEntropy,
    /// Softmax over all classes.
    Multiclass,
    /// One sigmoid per class.
    MulticlassOva,
    /// Any other engine objective, forwarded verbatim. Outputs are treated
    /// as plain values.
    Other(String),
}

impl Objective {
    /// Parse an engine objective name, folding aliases.
    pub fn parse(name: &str) -> Self {
        match name {
            "regression" | "regression_l2" | "l2" | "mse" | "mean_squared_error" | "rmse" => {
                Objective::Regression
            }
            "binary" => Objective::Binary,
            "cross_entropy" | "xentropy" => Objective::CrossEntropy,
            "multiclass" | "softmax" => Objective::Multiclass,
            "multiclassova" | "multiclass_ova" | "ova" | "ovr" => Objective::MulticlassOva,
            other => Objective::Other(other.to_string()),
        }
    }

    /// Canonical engine name.
    pub fn name(&self) -> &str {
        match self {
            Objective::Regression => "regression",
            Objective::Binary => "binary",
            Objective::CrossEntropy => "cross_entropy",
            Objective::Multiclass => "multiclass",
            Objective::MulticlassOva => "multiclassova",
            Objective::Other(name) => name,
        }
    }

    /// Labels are class ids and outputs are probabilities.
    pub fn is_classification(&self) -> bool {
        matches!(
            self,
            Objective::Binary
                | Objective::CrossEntropy
                | Objective::Multiclass
                | Objective::MulticlassOva
        )
    }

    /// One output per class rather than a single probability.
    pub fn is_multiclass(&self) -> bool {
        matches!(self, Objective::Multiclass | Objective::MulticlassOva)
    }
}

impl fmt::Display for Objective {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
