//! Parameters, stratified adjustments and their resolution.
//!
//! A parameter resolves along a stratum path: walking from the most recently
//! applied stratum toward the unstratified trunk, multipliers accumulate and
//! the first overwrite ends the walk.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::compartment::StratumKey;
use crate::error::ExecutionError;
use crate::time_function::TimeFunctions;

/// Value of a parameter or adjustment.
///
/// Deserializes from a JSON number or a string naming a time function.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParameterValue {
    /// Fixed scalar.
    Constant(f64),
    /// Reference to a registered time function.
    Function(String),
}

impl ParameterValue {
    /// Returns true for a function reference.
    #[must_use]
    pub const fn is_function(&self) -> bool {
        matches!(self, Self::Function(_))
    }

    fn evaluate(&self, parameter: &str, t: f64, functions: &TimeFunctions) -> Result<f64, ExecutionError> {
        match self {
            Self::Constant(v) => Ok(*v),
            Self::Function(name) => {
                functions
                    .evaluate(name, t)
                    .ok_or_else(|| ExecutionError::UnboundParameterFunction {
                        parameter: parameter.to_string(),
                        function: name.clone(),
                    })
            }
        }
    }
}

impl From<f64> for ParameterValue {
    fn from(v: f64) -> Self {
        Self::Constant(v)
    }
}

impl From<&str> for ParameterValue {
    fn from(v: &str) -> Self {
        Self::Function(v.to_string())
    }
}

impl From<String> for ParameterValue {
    fn from(v: String) -> Self {
        Self::Function(v)
    }
}

/// How a stratum modifies the inherited value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Adjustment {
    /// Multiply the inherited value.
    Multiply(ParameterValue),
    /// Replace the inherited value.
    Overwrite(ParameterValue),
}

impl Adjustment {
    /// The adjustment's value.
    #[must_use]
    pub const fn value(&self) -> &ParameterValue {
        match self {
            Self::Multiply(v) | Self::Overwrite(v) => v,
        }
    }

    /// Returns true for an overwrite.
    #[must_use]
    pub const fn is_overwrite(&self) -> bool {
        matches!(self, Self::Overwrite(_))
    }
}

/// A parameter resolved as far as possible ahead of integration.
#[derive(Debug, Clone, PartialEq)]
pub enum ResolvedRate {
    /// Whole chain is constant.
    Constant(f64),
    /// Chain references time functions; evaluate per step.
    TimeVariant {
        /// Parameter name.
        parameter: String,
        /// Stratum path to resolve along.
        path: Vec<StratumKey>,
    },
}

/// Base parameter values plus the stratified adjustment tree.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParameterSet {
    base: BTreeMap<String, ParameterValue>,
    adjustments: HashMap<String, HashMap<StratumKey, Adjustment>>,
}

impl ParameterSet {
    /// Creates a parameter set from base values.
    #[must_use]
    pub fn new(base: BTreeMap<String, ParameterValue>) -> Self {
        Self {
            base,
            adjustments: HashMap::new(),
        }
    }

    /// Sets (or replaces) a base value.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<ParameterValue>) {
        self.base.insert(name.into(), value.into());
    }

    /// Returns true if a base value exists.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.base.contains_key(name)
    }

    /// Base (unstratified) value.
    #[must_use]
    pub fn base_value(&self, name: &str) -> Option<&ParameterValue> {
        self.base.get(name)
    }

    /// Base parameter names.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.base.keys().map(String::as_str)
    }

    /// Attaches an adjustment for one stratum of one stratification.
    pub fn adjust(&mut self, parameter: impl Into<String>, key: StratumKey, adjustment: Adjustment) {
        self.adjustments
            .entry(parameter.into())
            .or_default()
            .insert(key, adjustment);
    }

    /// Adjustment attached at a stratum, if any.
    #[must_use]
    pub fn adjustment(&self, parameter: &str, key: &StratumKey) -> Option<&Adjustment> {
        self.adjustments.get(parameter).and_then(|m| m.get(key))
    }

    /// Returns true if any adjustment exists for the parameter under the
    /// given stratification.
    #[must_use]
    pub fn is_adjusted_by(&self, parameter: &str, stratification: &str) -> bool {
        self.adjustments
            .get(parameter)
            .is_some_and(|m| m.keys().any(|k| k.stratification == stratification))
    }

    /// Resolves a parameter along a stratum path at time `t`.
    ///
    /// # Errors
    ///
    /// `UnboundParameterFunction` if a referenced function is not registered.
    /// A parameter missing from the set also reports as unbound, naming
    /// itself as the function.
    pub fn resolve(
        &self,
        name: &str,
        path: &[StratumKey],
        t: f64,
        functions: &TimeFunctions,
    ) -> Result<f64, ExecutionError> {
        let mut multiplier = 1.0;
        if let Some(adjustments) = self.adjustments.get(name) {
            for key in path.iter().rev() {
                match adjustments.get(key) {
                    Some(Adjustment::Overwrite(value)) => {
                        return Ok(multiplier * value.evaluate(name, t, functions)?);
                    }
                    Some(Adjustment::Multiply(value)) => {
                        multiplier *= value.evaluate(name, t, functions)?;
                    }
                    None => {}
                }
            }
        }
        let base = self
            .base
            .get(name)
            .ok_or_else(|| ExecutionError::UnboundParameterFunction {
                parameter: name.to_string(),
                function: name.to_string(),
            })?;
        Ok(multiplier * base.evaluate(name, t, functions)?)
    }

    /// Returns true if resolving along `path` touches a time function.
    #[must_use]
    pub fn is_time_variant(&self, name: &str, path: &[StratumKey]) -> bool {
        if let Some(adjustments) = self.adjustments.get(name) {
            for key in path.iter().rev() {
                match adjustments.get(key) {
                    Some(adjustment) if adjustment.value().is_function() => return true,
                    Some(Adjustment::Overwrite(_)) => return false,
                    _ => {}
                }
            }
        }
        self.base.get(name).is_some_and(ParameterValue::is_function)
    }

    /// Folds a constant chain ahead of time; time-variant chains are kept
    /// symbolic so they are evaluated lazily.
    ///
    /// # Errors
    ///
    /// Propagates resolution errors for constant chains.
    pub fn prepare(&self, name: &str, path: &[StratumKey]) -> Result<ResolvedRate, ExecutionError> {
        if self.is_time_variant(name, path) {
            return Ok(ResolvedRate::TimeVariant {
                parameter: name.to_string(),
                path: path.to_vec(),
            });
        }
        let value = self.resolve(name, path, 0.0, &TimeFunctions::default())?;
        Ok(ResolvedRate::Constant(value))
    }
}

impl ResolvedRate {
    /// Evaluates the rate at time `t`.
    ///
    /// # Errors
    ///
    /// Propagates `UnboundParameterFunction` for time-variant chains.
    pub fn evaluate(&self, parameters: &ParameterSet, t: f64, functions: &TimeFunctions) -> Result<f64, ExecutionError> {
        match self {
            Self::Constant(v) => Ok(*v),
            Self::TimeVariant { parameter, path } => parameters.resolve(parameter, path, t, functions),
        }
    }
}
