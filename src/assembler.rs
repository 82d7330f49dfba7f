//! Assembly of the ODE right-hand side from the resolved flow set.

use crate::config::{BirthApproach, CRUDE_BIRTH_RATE};
use crate::error::{ExecutionError, ModelResult, ValidationError};
use crate::flow::FlowType;
use crate::model::Model;
use crate::ode::OdeSystem;
use crate::parameter::{ParameterSet, ResolvedRate};
use crate::time_function::TimeFunctions;

#[derive(Debug, Clone)]
struct Term {
    flow_type: FlowType,
    origin: usize,
    to: Option<usize>,
    rate: ResolvedRate,
    share: f64,
}

/// Right-hand side of a model, borrowing its parameters and time functions.
///
/// Flow endpoints and constant rates are resolved once at assembly;
/// time-variant rates are resolved at every evaluation.
#[derive(Debug, Clone)]
pub struct Rhs<'a> {
    parameters: &'a ParameterSet,
    functions: &'a TimeFunctions,
    terms: Vec<Term>,
    infectious: Vec<(usize, f64)>,
    entry: Vec<(usize, f64)>,
    birth_approach: BirthApproach,
    birth_rate: Option<ResolvedRate>,
    ndim: usize,
}

impl<'a> Rhs<'a> {
    pub(crate) fn new(model: &'a Model) -> ModelResult<Self> {
        let registry = model.registry();
        let parameters = model.parameters();
        let config = model.config();
        let index = |name: &str| {
            registry
                .index_of(name)
                .ok_or_else(|| ValidationError::UnknownCompartment { name: name.to_string() })
        };

        let infectious: Vec<(usize, f64)> = registry
            .indices_of_bases(&config.infectious_compartments)
            .into_iter()
            .map(|i| (i, model.infectiousness_of(registry.compartments()[i].name())))
            .collect();
        if infectious.is_empty() {
            return Err(ValidationError::MissingInfectiousCompartment {
                names: config.infectious_compartments.clone(),
            }
            .into());
        }

        let mut terms = Vec::new();
        for flow in model.resolved_flows() {
            terms.push(Term {
                flow_type: flow.flow_type,
                origin: index(&flow.origin)?,
                to: flow.to.as_deref().map(index).transpose()?,
                rate: parameters.prepare(&flow.parameter, &flow.strata)?,
                share: flow.share,
            });
        }

        let entry = model
            .entry_proportions()
            .iter()
            .map(|(name, proportion)| Ok((index(name)?, *proportion)))
            .collect::<Result<Vec<_>, ValidationError>>()?;
        let birth_rate = match config.birth_approach {
            BirthApproach::AddCrudeBirthRate => Some(parameters.prepare(CRUDE_BIRTH_RATE, &[])?),
            BirthApproach::NoBirth | BirthApproach::ReplaceDeaths => None,
        };

        tracing::debug!(
            terms = terms.len(),
            infectious = infectious.len(),
            entry = entry.len(),
            level = model.implement_level(),
            "right-hand side assembled"
        );
        Ok(Self {
            parameters,
            functions: model.functions(),
            terms,
            infectious,
            entry,
            birth_approach: config.birth_approach,
            birth_rate,
            ndim: registry.len(),
        })
    }

    /// Number of flow terms.
    #[must_use]
    pub fn term_count(&self) -> usize {
        self.terms.len()
    }

    /// `(origin, to)` state indices of each term, in term order.
    pub fn endpoints(&self) -> impl Iterator<Item = (usize, Option<usize>)> + '_ {
        self.terms.iter().map(|term| (term.origin, term.to))
    }

    fn check_len(&self, actual: usize) -> Result<(), ExecutionError> {
        if actual == self.ndim {
            Ok(())
        } else {
            Err(ExecutionError::StateDimensionMismatch {
                expected: self.ndim,
                actual,
            })
        }
    }

    /// Net rate carried by each term at `(t, y)`, in term order.
    ///
    /// # Errors
    ///
    /// `StateDimensionMismatch` for a wrong-sized `y`, or an unbound time
    /// function.
    pub fn flow_rates(&self, t: f64, y: &[f64]) -> ModelResult<Vec<f64>> {
        self.check_len(y.len())?;
        let total: f64 = y.iter().sum();
        let infectious: f64 = self.infectious.iter().map(|(i, weight)| y[*i] * weight).sum();
        let frequency = if total > 0.0 { infectious / total } else { 0.0 };

        let mut rates = Vec::with_capacity(self.terms.len());
        for term in &self.terms {
            let rate = term.rate.evaluate(self.parameters, t, self.functions)?;
            let scale = match term.flow_type {
                FlowType::StandardFlow | FlowType::CompartmentDeath => 1.0,
                FlowType::InfectionDensity => infectious,
                FlowType::InfectionFrequency => frequency,
            };
            rates.push(rate * term.share * y[term.origin] * scale);
        }
        Ok(rates)
    }
}

impl OdeSystem for Rhs<'_> {
    fn ndim(&self) -> usize {
        self.ndim
    }

    fn rhs(&self, t: f64, y: &[f64], dydt: &mut [f64]) -> ModelResult<()> {
        self.check_len(dydt.len())?;
        let rates = self.flow_rates(t, y)?;
        dydt.fill(0.0);

        let mut deaths = 0.0;
        for (term, &rate) in self.terms.iter().zip(&rates) {
            dydt[term.origin] -= rate;
            match term.to {
                Some(to) => dydt[to] += rate,
                None => deaths += rate,
            }
        }

        let births = match (self.birth_approach, &self.birth_rate) {
            (BirthApproach::AddCrudeBirthRate, Some(rate)) => {
                rate.evaluate(self.parameters, t, self.functions)? * y.iter().sum::<f64>()
            }
            (BirthApproach::ReplaceDeaths, _) => deaths,
            _ => 0.0,
        };
        for (index, proportion) in &self.entry {
            dydt[*index] += births * proportion;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ModelBuilder, UNIVERSAL_DEATH_RATE};
    use crate::error::ModelError;
    use crate::flow::FlowRequest;

    fn sir() -> ModelBuilder {
        ModelBuilder::new(["susceptible", "infectious", "recovered"])
            .times(vec![0.0, 1.0])
            .initial("susceptible", 999.0)
            .initial("infectious", 1.0)
            .parameter("beta", 0.4)
            .parameter("gamma", 0.1)
            .flow(FlowRequest::infection_frequency("beta", "susceptible", "infectious"))
            .flow(FlowRequest::standard("gamma", "infectious", "recovered"))
    }

    fn derivative(model: &Model, y: &[f64], t: f64) -> Vec<f64> {
        let rhs = model.build_rhs().unwrap();
        let mut dydt = vec![0.0; rhs.ndim()];
        rhs.rhs(t, y, &mut dydt).unwrap();
        dydt
    }

    #[test]
    fn missing_infectious_compartment_fails_at_assembly() {
        let model = sir().infectious_compartments(["contagious"]).build().unwrap();
        let err = model.build_rhs().unwrap_err();
        assert_eq!(
            err,
            ModelError::from(ValidationError::MissingInfectiousCompartment {
                names: vec!["contagious".to_string()],
            })
        );
    }

    #[test]
    fn density_infection_scales_with_infectious_count() {
        let model = ModelBuilder::new(["susceptible", "infectious"])
            .times(vec![0.0])
            .parameter("beta", 0.01)
            .flow(FlowRequest::infection_density("beta", "susceptible", "infectious"))
            .build()
            .unwrap();
        let dydt = derivative(&model, &[100.0, 5.0], 0.0);
        assert!((dydt[1] - 0.01 * 100.0 * 5.0).abs() < 1e-12);
        assert!((dydt[0] + dydt[1]).abs() < 1e-12);
    }

    #[test]
    fn frequency_infection_with_empty_population_is_zero() {
        let model = sir().build().unwrap();
        let dydt = derivative(&model, &[0.0, 0.0, 0.0], 0.0);
        assert_eq!(dydt, vec![0.0, 0.0, 0.0]);
    }

    #[test]
    fn replace_deaths_keeps_population_constant() {
        let model = sir()
            .parameter(UNIVERSAL_DEATH_RATE, 0.02)
            .birth_approach(BirthApproach::ReplaceDeaths)
            .build()
            .unwrap();
        let dydt = derivative(&model, &[900.0, 60.0, 40.0], 0.0);
        assert!(dydt.iter().sum::<f64>().abs() < 1e-9);
        // Births land in the entry compartment only.
        let without_births = -0.4 * 900.0 * (60.0 / 1000.0) - 0.02 * 900.0;
        assert!((dydt[0] - (without_births + 0.02 * 1000.0)).abs() < 1e-9);
    }

    #[test]
    fn crude_birth_rate_can_be_time_variant() {
        let mut model = sir()
            .parameter("crude_birth_rate", "birth_series")
            .birth_approach(BirthApproach::AddCrudeBirthRate)
            .build()
            .unwrap();
        model.register_series("birth_series", &[(0.0, 0.01), (10.0, 0.03)]).unwrap();
        let y = [1000.0, 0.0, 0.0];
        let dydt = derivative(&model, &y, 5.0);
        assert!((dydt[0] - 0.02 * 1000.0).abs() < 1e-9);
    }

    #[test]
    fn wrong_state_length_is_rejected() {
        let model = sir().build().unwrap();
        let rhs = model.build_rhs().unwrap();
        let mut dydt = vec![0.0; 3];
        let err = rhs.rhs(0.0, &[1.0, 2.0], &mut dydt).unwrap_err();
        assert_eq!(
            err,
            ModelError::from(ExecutionError::StateDimensionMismatch { expected: 3, actual: 2 })
        );
    }

    #[test]
    fn endpoints_follow_term_order() {
        let model = sir().build().unwrap();
        let rhs = model.build_rhs().unwrap();
        let endpoints: Vec<_> = rhs.endpoints().collect();
        assert_eq!(endpoints, vec![(0, Some(1)), (1, Some(2))]);
        assert_eq!(rhs.term_count(), 2);
    }
}
