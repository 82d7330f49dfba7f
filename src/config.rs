//! Model construction inputs.
//!
//! [`ModelConfig`] can be deserialized from JSON or assembled through
//! [`ModelBuilder`]; either way it is checked by [`ModelConfig::validate`]
//! before a model is built from it.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::allocation::ProportionStrictness;
use crate::error::{ModelError, ModelResult, ValidationError};
use crate::flow::FlowRequest;
use crate::model::Model;
use crate::parameter::ParameterValue;

/// Parameter consumed by [`BirthApproach::AddCrudeBirthRate`].
pub const CRUDE_BIRTH_RATE: &str = "crude_birth_rate";

/// Parameter applied as a death rate to every compartment when present.
pub const UNIVERSAL_DEATH_RATE: &str = "universal_death_rate";

/// How new population enters the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BirthApproach {
    /// Closed population.
    #[default]
    NoBirth,
    /// `crude_birth_rate * total population`.
    AddCrudeBirthRate,
    /// Births equal total deaths, keeping the population constant.
    ReplaceDeaths,
}

/// A tracked flow indicator between two unstratified compartments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputConnection {
    /// Base compartment the tracked flows leave.
    pub origin: String,
    /// Base compartment the tracked flows enter.
    pub to: String,
}

/// Everything needed to construct a [`Model`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Requested output times, strictly increasing.
    pub times: Vec<f64>,
    /// Unstratified compartment names, in state-vector order.
    pub compartments: Vec<String>,
    /// Initial population per compartment; everything else starts at zero.
    pub initial_conditions: BTreeMap<String, f64>,
    /// Total population; the remainder after `initial_conditions` goes to
    /// the starting compartment.
    pub starting_population: Option<f64>,
    /// Receives the remainder; defaults to the entry compartment.
    pub starting_compartment: Option<String>,
    /// Base parameter values.
    pub parameters: BTreeMap<String, ParameterValue>,
    /// Requested flows.
    pub flows: Vec<FlowRequest>,
    /// Base compartments that contribute to the force of infection.
    pub infectious_compartments: Vec<String>,
    /// Tracked flow indicators.
    pub output_connections: BTreeMap<String, OutputConnection>,
    /// Birth approach.
    pub birth_approach: BirthApproach,
    /// Compartment receiving births.
    pub entry_compartment: String,
    /// Passed through to the integrator.
    pub equilibrium_stop: bool,
    /// Handling of entry proportions summing above one.
    pub proportion_strictness: ProportionStrictness,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            times: Vec::new(),
            compartments: Vec::new(),
            initial_conditions: BTreeMap::new(),
            starting_population: None,
            starting_compartment: None,
            parameters: BTreeMap::new(),
            flows: Vec::new(),
            infectious_compartments: vec!["infectious".to_string()],
            output_connections: BTreeMap::new(),
            birth_approach: BirthApproach::default(),
            entry_compartment: "susceptible".to_string(),
            equilibrium_stop: false,
            proportion_strictness: ProportionStrictness::default(),
        }
    }
}

impl ModelConfig {
    /// Parses a JSON configuration.
    ///
    /// # Errors
    ///
    /// `InvalidConfig` if the document does not match the schema.
    pub fn from_json_str(json: &str) -> ModelResult<Self> {
        serde_json::from_str(json).map_err(|e| {
            ModelError::from(ValidationError::InvalidConfig {
                reason: e.to_string(),
            })
        })
    }

    /// Reads and parses a JSON configuration file.
    ///
    /// # Errors
    ///
    /// `Io` if the file cannot be read, `InvalidConfig` if it does not parse.
    pub fn from_path(path: impl AsRef<Path>) -> ModelResult<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .map_err(|e| ModelError::io(format!("{}: {e}", path.display())))?;
        Self::from_json_str(&json)
    }

    /// Checks the parts of the configuration that do not need a registry.
    ///
    /// This must be called before constructing a `Model`.
    ///
    /// # Errors
    ///
    /// `InvalidConfig` describing the first problem found.
    pub fn validate(&self) -> Result<(), ValidationError> {
        let invalid = |reason: &str| ValidationError::InvalidConfig {
            reason: reason.to_string(),
        };

        if self.times.is_empty() {
            return Err(invalid("times must not be empty"));
        }
        if self.times.iter().any(|t| !t.is_finite()) {
            return Err(invalid("times must be finite"));
        }
        if self.times.windows(2).any(|w| w[1] <= w[0]) {
            return Err(invalid("times must be strictly increasing"));
        }
        if self.compartments.is_empty() {
            return Err(invalid("at least one compartment is required"));
        }
        if self.infectious_compartments.is_empty() {
            return Err(invalid("infectious_compartments must not be empty"));
        }
        if let Some(total) = self.starting_population {
            if !total.is_finite() || total < 0.0 {
                return Err(invalid("starting_population must be a non-negative number"));
            }
        }
        if let Some((name, _)) = self
            .parameters
            .iter()
            .find(|(_, v)| matches!(v, ParameterValue::Constant(c) if !c.is_finite()))
        {
            return Err(ValidationError::InvalidConfig {
                reason: format!("parameter '{name}' is not finite"),
            });
        }
        Ok(())
    }
}

/// Fluent construction of a [`Model`].
#[derive(Debug, Clone, Default)]
pub struct ModelBuilder {
    config: ModelConfig,
}

impl ModelBuilder {
    /// Starts a builder over the given compartments.
    #[must_use]
    pub fn new<I, S>(compartments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            config: ModelConfig {
                compartments: compartments.into_iter().map(Into::into).collect(),
                ..ModelConfig::default()
            },
        }
    }

    /// Sets the output times.
    #[must_use]
    pub fn times(mut self, times: impl Into<Vec<f64>>) -> Self {
        self.config.times = times.into();
        self
    }

    /// Sets the initial population of one compartment.
    #[must_use]
    pub fn initial(mut self, compartment: impl Into<String>, value: f64) -> Self {
        self.config.initial_conditions.insert(compartment.into(), value);
        self
    }

    /// Sets the total population; the remainder fills the starting compartment.
    #[must_use]
    pub fn starting_population(mut self, total: f64) -> Self {
        self.config.starting_population = Some(total);
        self
    }

    /// Sets the compartment receiving the unallocated remainder.
    #[must_use]
    pub fn starting_compartment(mut self, compartment: impl Into<String>) -> Self {
        self.config.starting_compartment = Some(compartment.into());
        self
    }

    /// Sets a base parameter.
    #[must_use]
    pub fn parameter(mut self, name: impl Into<String>, value: impl Into<ParameterValue>) -> Self {
        self.config.parameters.insert(name.into(), value.into());
        self
    }

    /// Adds a flow request.
    #[must_use]
    pub fn flow(mut self, flow: FlowRequest) -> Self {
        self.config.flows.push(flow);
        self
    }

    /// Replaces the infectious compartment list.
    #[must_use]
    pub fn infectious_compartments<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.infectious_compartments = names.into_iter().map(Into::into).collect();
        self
    }

    /// Tracks the flows from `origin` to `to` as `indicator`.
    #[must_use]
    pub fn output(mut self, indicator: impl Into<String>, origin: impl Into<String>, to: impl Into<String>) -> Self {
        self.config.output_connections.insert(
            indicator.into(),
            OutputConnection {
                origin: origin.into(),
                to: to.into(),
            },
        );
        self
    }

    /// Sets the birth approach.
    #[must_use]
    pub fn birth_approach(mut self, approach: BirthApproach) -> Self {
        self.config.birth_approach = approach;
        self
    }

    /// Sets the entry compartment.
    #[must_use]
    pub fn entry_compartment(mut self, compartment: impl Into<String>) -> Self {
        self.config.entry_compartment = compartment.into();
        self
    }

    /// Enables early stopping at equilibrium in the integrator.
    #[must_use]
    pub fn equilibrium_stop(mut self, enabled: bool) -> Self {
        self.config.equilibrium_stop = enabled;
        self
    }

    /// Sets how entry proportions above one are treated.
    #[must_use]
    pub fn proportion_strictness(mut self, strictness: ProportionStrictness) -> Self {
        self.config.proportion_strictness = strictness;
        self
    }

    /// The configuration assembled so far.
    #[must_use]
    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    /// Builds the model.
    ///
    /// # Errors
    ///
    /// Any construction error; no partial model is returned.
    pub fn build(self) -> ModelResult<Model> {
        Model::new(self.config)
    }
}
