//! The model: construction, stratification and runs.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::allocation;
use crate::assembler::Rhs;
use crate::compartment::{CompartmentRegistry, StratumKey};
use crate::config::{BirthApproach, ModelConfig, CRUDE_BIRTH_RATE, UNIVERSAL_DEATH_RATE};
use crate::error::{ModelResult, ValidationError};
use crate::flow::{Flow, FlowTable, FlowType};
use crate::ode::{Integrator, OdeSystem, Solution};
use crate::parameter::ParameterSet;
use crate::stratification::{PassSettings, StratificationRecord, StratificationRequest};
use crate::time_function::TimeFunctions;

/// Everything a stratification pass rewrites.
///
/// Cloned before each pass so a failed pass leaves the model untouched.
#[derive(Debug, Clone)]
pub(crate) struct ModelState {
    pub registry: CompartmentRegistry,
    pub flows: FlowTable,
    pub parameters: ParameterSet,
    pub initial_values: Vec<f64>,
    pub entry_proportions: BTreeMap<String, f64>,
    pub infectiousness: HashMap<StratumKey, f64>,
    pub implement_level: usize,
    pub stratifications: Vec<StratificationRecord>,
}

/// Results of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelOutputs {
    /// Compartment names, parallel to each state vector.
    pub compartments: Vec<String>,
    /// Integrator output.
    pub solution: Solution,
    /// Tracked flow indicators, one value per solution time point.
    pub derived_outputs: BTreeMap<String, Vec<f64>>,
}

impl ModelOutputs {
    /// Trajectory of one compartment.
    #[must_use]
    pub fn compartment_series(&self, name: &str) -> Option<Vec<f64>> {
        let index = self.compartments.iter().position(|c| c == name)?;
        Some(self.solution.states.iter().map(|s| s[index]).collect())
    }
}

/// A compartmental model that can be stratified and run.
#[derive(Debug, Clone)]
pub struct Model {
    config: ModelConfig,
    state: ModelState,
    functions: TimeFunctions,
}

impl Model {
    /// Builds a model from a configuration.
    ///
    /// # Errors
    ///
    /// Any validation error in the configuration, the compartments, the
    /// initial conditions, the flows or the output connections.
    pub fn new(config: ModelConfig) -> ModelResult<Self> {
        config.validate()?;
        let registry = CompartmentRegistry::new(&config.compartments)?;

        let entry = config.entry_compartment.as_str();
        if !registry.contains(entry) {
            return Err(ValidationError::UnknownCompartment {
                name: entry.to_string(),
            }
            .into());
        }
        let starting = config.starting_compartment.as_deref().unwrap_or(entry);
        let initial_values = allocation::allocate_initial(
            &registry,
            &config.initial_conditions,
            config.starting_population,
            starting,
        )?;

        let parameters = ParameterSet::new(config.parameters.clone());
        let mut flows = FlowTable::new();
        for request in &config.flows {
            request.validate(&registry)?;
            if !parameters.contains(&request.parameter) {
                return Err(ValidationError::UnknownParameter {
                    name: request.parameter.clone(),
                }
                .into());
            }
            flows.append(Flow::from_request(request));
        }

        if config.birth_approach == BirthApproach::AddCrudeBirthRate && !parameters.contains(CRUDE_BIRTH_RATE) {
            return Err(ValidationError::UnknownParameter {
                name: CRUDE_BIRTH_RATE.to_string(),
            }
            .into());
        }
        for connection in config.output_connections.values() {
            for endpoint in [&connection.origin, &connection.to] {
                if !registry.contains(endpoint) {
                    return Err(ValidationError::UnknownCompartment {
                        name: endpoint.clone(),
                    }
                    .into());
                }
            }
        }

        tracing::info!(
            compartments = registry.len(),
            flows = flows.len(),
            parameters = config.parameters.len(),
            "model constructed"
        );

        let state = ModelState {
            registry,
            flows,
            parameters,
            initial_values,
            entry_proportions: BTreeMap::from([(entry.to_string(), 1.0)]),
            infectiousness: HashMap::new(),
            implement_level: 0,
            stratifications: Vec::new(),
        };
        Ok(Self {
            config,
            state,
            functions: TimeFunctions::new(),
        })
    }

    /// Applies one stratification.
    ///
    /// On error the model is left exactly as it was before the call.
    ///
    /// # Errors
    ///
    /// Any validation error raised by the pass, or
    /// `FlowReplicationMismatch` if the flow table is inconsistent.
    pub fn stratify(&mut self, request: &StratificationRequest) -> ModelResult<()> {
        let mut staged = self.state.clone();
        staged.stratify(
            request,
            PassSettings {
                entry_compartment: &self.config.entry_compartment,
                strictness: self.config.proportion_strictness,
            },
        )?;
        self.state = staged;
        Ok(())
    }

    /// Registers a time function that parameters may reference by name.
    pub fn register_function<F>(&mut self, name: impl Into<String>, function: F)
    where
        F: Fn(f64) -> f64 + Send + Sync + 'static,
    {
        self.functions.register(name, function);
    }

    /// Registers a piecewise-linear time function through `(time, value)`
    /// points.
    ///
    /// # Errors
    ///
    /// `InvalidConfig` for an empty or non-finite series.
    pub fn register_series(&mut self, name: impl Into<String>, points: &[(f64, f64)]) -> ModelResult<()> {
        self.functions.register_series(name, points)?;
        Ok(())
    }

    /// Construction inputs.
    #[must_use]
    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    /// Current compartments.
    #[must_use]
    pub fn registry(&self) -> &CompartmentRegistry {
        &self.state.registry
    }

    /// Full flow table across all implement levels.
    #[must_use]
    pub fn flow_table(&self) -> &FlowTable {
        &self.state.flows
    }

    /// Initial state vector, parallel to the registry.
    #[must_use]
    pub fn initial_values(&self) -> &[f64] {
        &self.state.initial_values
    }

    /// Share of births entering each entry compartment.
    #[must_use]
    pub fn entry_proportions(&self) -> &BTreeMap<String, f64> {
        &self.state.entry_proportions
    }

    /// Number of stratifications applied.
    #[must_use]
    pub fn implement_level(&self) -> usize {
        self.state.implement_level
    }

    /// Base values and the adjustment tree.
    #[must_use]
    pub fn parameters(&self) -> &ParameterSet {
        &self.state.parameters
    }

    /// Registered time functions.
    #[must_use]
    pub fn functions(&self) -> &TimeFunctions {
        &self.functions
    }

    /// Applied stratifications, oldest first.
    #[must_use]
    pub fn stratifications(&self) -> &[StratificationRecord] {
        &self.state.stratifications
    }

    /// Requested output times.
    #[must_use]
    pub fn times(&self) -> &[f64] {
        &self.config.times
    }

    /// Infectiousness multiplier of one compartment.
    #[must_use]
    pub fn infectiousness_of(&self, name: &str) -> f64 {
        self.state.registry.get(name).map_or(1.0, |compartment| {
            compartment
                .strata()
                .iter()
                .map(|key| self.state.infectiousness.get(key).copied().unwrap_or(1.0))
                .product()
        })
    }

    /// Flows that feed the ODE: the active level plus one
    /// `universal_death_rate` death per compartment when that parameter
    /// exists.
    #[must_use]
    pub fn resolved_flows(&self) -> Vec<Flow> {
        let level = self.state.implement_level;
        let mut flows: Vec<Flow> = self.state.flows.active(level).cloned().collect();
        if self.state.parameters.contains(UNIVERSAL_DEATH_RATE) {
            flows.extend(self.state.registry.compartments().iter().map(|compartment| Flow {
                flow_type: FlowType::CompartmentDeath,
                parameter: UNIVERSAL_DEATH_RATE.to_string(),
                origin: compartment.name().to_string(),
                to: None,
                implement_level: level,
                strata: compartment.strata().to_vec(),
                share: 1.0,
            }));
        }
        flows
    }

    /// Assembles the right-hand side over the current state.
    ///
    /// # Errors
    ///
    /// `MissingInfectiousCompartment` if no infectious compartment exists,
    /// or a resolution error for a constant parameter chain.
    pub fn build_rhs(&self) -> ModelResult<Rhs<'_>> {
        Rhs::new(self)
    }

    /// Integrates the model with `integrator` over the configured times.
    ///
    /// # Errors
    ///
    /// Assembly errors, any error the integrator reports, and
    /// `StateDimensionMismatch` for a malformed solution.
    pub fn run(&self, integrator: &dyn Integrator) -> ModelResult<ModelOutputs> {
        let rhs = self.build_rhs()?;
        let solution = integrator.integrate(
            &rhs,
            &self.state.initial_values,
            &self.config.times,
            self.config.equilibrium_stop,
        )?;
        solution.check_shape(rhs.ndim())?;
        let derived_outputs = self.derived_outputs_with(&rhs, &solution)?;

        tracing::info!(
            time_points = solution.len(),
            requested = self.config.times.len(),
            compartments = rhs.ndim(),
            "model run complete"
        );
        Ok(ModelOutputs {
            compartments: self.state.registry.names().map(str::to_string).collect(),
            solution,
            derived_outputs,
        })
    }

    /// Evaluates every output connection at each point of `solution`.
    ///
    /// # Errors
    ///
    /// Assembly and resolution errors.
    pub fn derived_outputs(&self, solution: &Solution) -> ModelResult<BTreeMap<String, Vec<f64>>> {
        let rhs = self.build_rhs()?;
        solution.check_shape(rhs.ndim())?;
        self.derived_outputs_with(&rhs, solution)
    }

    fn derived_outputs_with(&self, rhs: &Rhs<'_>, solution: &Solution) -> ModelResult<BTreeMap<String, Vec<f64>>> {
        let compartments = self.state.registry.compartments();
        let base_of = |index: usize| compartments[index].base();

        let mut tracked: BTreeMap<String, Vec<usize>> = BTreeMap::new();
        for (indicator, connection) in &self.config.output_connections {
            let terms = rhs
                .endpoints()
                .enumerate()
                .filter(|(_, (origin, to))| {
                    base_of(*origin) == connection.origin && to.is_some_and(|to| base_of(to) == connection.to)
                })
                .map(|(i, _)| i)
                .collect();
            tracked.insert(indicator.clone(), terms);
        }

        let mut outputs: BTreeMap<String, Vec<f64>> = tracked
            .keys()
            .map(|k| (k.clone(), Vec::with_capacity(solution.len())))
            .collect();
        if tracked.is_empty() {
            return Ok(outputs);
        }
        for (t, state) in solution.times.iter().zip(&solution.states) {
            let rates = rhs.flow_rates(*t, state)?;
            for (indicator, terms) in &tracked {
                let value = terms.iter().map(|i| rates[*i]).sum::<f64>();
                if let Some(series) = outputs.get_mut(indicator) {
                    series.push(value);
                }
            }
        }
        Ok(outputs)
    }

    /// Sums a state vector by base compartment.
    #[must_use]
    pub fn base_totals(&self, state: &[f64]) -> BTreeMap<String, f64> {
        let mut totals = BTreeMap::new();
        for (compartment, value) in self.state.registry.compartments().iter().zip(state) {
            *totals.entry(compartment.base().to_string()).or_insert(0.0) += value;
        }
        totals
    }
}
