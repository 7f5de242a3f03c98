//! Model hyperparameters.
//!
//! [`Params`] separates the few settings the orchestrator itself interprets
//! (`numRound`, `task`, `coerce`) from everything forwarded to the engine.
//! Forwarded keys live in an explicit map and are rendered as the engine's
//! `key=value` parameter string.
//!
//! # Example
//!
//! ```
//! use wl_lightgbm::{Params, Task};
//!
//! let params = Params::new()
//!     .with_num_round(50)
//!     .with_task(Task::Classification)
//!     .with("learning_rate", 0.05)
//!     .with("num_leaves", 15);
//! params.validate().unwrap();
//! ```

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use super::objective::{Objective, Task};
use crate::error::{Error, Result};

/// Keys interpreted by the orchestrator and never sent to the engine.
pub const ORCHESTRATOR_KEYS: [&str; 3] = ["numRound", "task", "coerce"];

/// Engine spellings of the objective key.
const OBJECTIVE_KEYS: [&str; 4] = ["objective", "objective_type", "app", "application"];
const NUM_CLASS_KEYS: [&str; 2] = ["num_class", "num_classes"];
const VERBOSITY_KEYS: [&str; 2] = ["verbosity", "verbose"];

// =============================================================================
// ParamValue
// =============================================================================

/// A scalar engine parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Bool(v) => write!(f, "{v}"),
            ParamValue::Int(v) => write!(f, "{v}"),
            ParamValue::Float(v) => write!(f, "{v}"),
            ParamValue::Str(v) => f.write_str(v),
        }
    }
}

macro_rules! param_value_from {
    ($variant:ident: $($ty:ty),+) => {
        $(impl From<$ty> for ParamValue {
            fn from(value: $ty) -> Self {
                ParamValue::$variant(value.into())
            }
        })+
    };
}

param_value_from!(Bool: bool);
param_value_from!(Int: i8, i16, i32, i64, u8, u16, u32);
param_value_from!(Float: f32, f64);
param_value_from!(Str: &str, String);

impl From<usize> for ParamValue {
    fn from(value: usize) -> Self {
        i64::try_from(value).map_or(ParamValue::Float(value as f64), ParamValue::Int)
    }
}

// =============================================================================
// Coerce
// =============================================================================

/// Policy for narrowing `f64` features to the engine's `f32`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Coerce {
    /// Narrow silently.
    #[default]
    Auto,
    /// Narrow, logging a warning when precision is lost.
    Warn,
    /// Reject input that would lose precision.
    Error,
}

// =============================================================================
// Params
// =============================================================================

fn default_num_round() -> u32 {
    100
}

/// Hyperparameters of a [`Model`](crate::Model).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Params {
    /// Boosting rounds run by `fit`. Default: 100.
    #[serde(default = "default_num_round")]
    pub num_round: u32,

    /// Objective shorthand resolved from the labels at fit time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task: Option<Task>,

    /// Feature narrowing policy.
    #[serde(default)]
    pub coerce: Coerce,

    /// Parameters forwarded to the engine verbatim.
    #[serde(flatten)]
    pub engine: BTreeMap<String, ParamValue>,
}

impl Default for Params {
    fn default() -> Self {
        Self {
            num_round: default_num_round(),
            task: None,
            coerce: Coerce::default(),
            engine: BTreeMap::new(),
        }
    }
}

impl Params {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_num_round(mut self, num_round: u32) -> Self {
        self.num_round = num_round;
        self
    }

    pub fn with_task(mut self, task: Task) -> Self {
        self.task = Some(task);
        self
    }

    pub fn with_coerce(mut self, coerce: Coerce) -> Self {
        self.coerce = coerce;
        self
    }

    /// Set an engine parameter.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<ParamValue>) -> Self {
        self.engine.insert(key.into(), value.into());
        self
    }

    /// The explicitly configured objective, if any.
    pub fn objective(&self) -> Option<Objective> {
        self.lookup(&OBJECTIVE_KEYS)
            .map(|value| Objective::parse(&value.to_string()))
    }

    /// The explicitly configured class count, if any.
    pub fn num_class(&self) -> Option<i64> {
        match self.lookup(&NUM_CLASS_KEYS)? {
            ParamValue::Int(n) => Some(*n),
            other => other.to_string().parse().ok(),
        }
    }

    fn lookup(&self, aliases: &[&str]) -> Option<&ParamValue> {
        aliases.iter().find_map(|key| self.engine.get(*key))
    }

    /// Check the parameters before any engine work.
    pub fn validate(&self) -> Result<()> {
        if self.num_round == 0 {
            return Err(Error::invalid_parameter("numRound", "must be at least 1"));
        }
        for (key, value) in &self.engine {
            if ORCHESTRATOR_KEYS.contains(&key.as_str()) {
                return Err(Error::invalid_parameter(
                    key,
                    "is an orchestrator setting; use the dedicated field instead of an engine key",
                ));
            }
            if key.is_empty() || key.contains(|c: char| c.is_whitespace() || c == '=') {
                return Err(Error::invalid_parameter(
                    key,
                    "engine keys must be non-empty and contain no whitespace or '='",
                ));
            }
            match value {
                ParamValue::Str(s) if s.is_empty() || s.contains(char::is_whitespace) => {
                    return Err(Error::invalid_parameter(
                        key,
                        "engine values must be non-empty and contain no whitespace",
                    ));
                }
                ParamValue::Float(v) if !v.is_finite() => {
                    return Err(Error::invalid_parameter(key, format!("must be finite, got {v}")));
                }
                _ => {}
            }
        }
        if let (Some(task), Some(objective)) = (self.task, self.objective()) {
            return Err(Error::Validation(format!(
                "task '{task:?}' and objective '{objective}' are mutually exclusive; set only one"
            )));
        }
        Ok(())
    }

    /// Render the engine parameter string for a fit.
    ///
    /// Keys are sorted. `objective` and `verbosity` are added when absent, and
    /// `num_class` is injected for multiclass objectives.
    pub fn engine_string(&self, objective: &Objective, n_classes: usize) -> String {
        let mut entries: BTreeMap<&str, String> = self
            .engine
            .iter()
            .map(|(key, value)| (key.as_str(), value.to_string()))
            .collect();
        if self.lookup(&OBJECTIVE_KEYS).is_none() {
            entries.insert("objective", objective.name().to_string());
        }
        if self.lookup(&VERBOSITY_KEYS).is_none() {
            entries.insert("verbosity", "-1".to_string());
        }
        if objective.is_multiclass() && self.lookup(&NUM_CLASS_KEYS).is_none() {
            entries.insert("num_class", n_classes.to_string());
        }
        entries
            .iter()
            .map(|(key, value)| format!("{key}={value}"))
            .collect::<Vec<_>>()
            .join(" ")
    }
}
