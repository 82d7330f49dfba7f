//! Stratification requests and the stratification pass.
//!
//! One pass expands the compartments, replicates every active flow into the
//! next implement level, adds ageing flows for `age`, redistributes initial
//! and entry populations and records parameter adjustments. The pass works
//! on a staged copy of the model state; the model only commits it on success.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::allocation::{self, ProportionStrictness, PROPORTION_TOLERANCE};
use crate::compartment::StratumKey;
use crate::error::{ModelResult, ValidationError};
use crate::flow::{Flow, FlowTable, FlowType, Replication};
use crate::model::ModelState;
use crate::naming::{self, AGE_STRATIFICATION};
use crate::parameter::{Adjustment, ParameterValue};
use crate::strata::{self, ResolvedStrata, StrataRequest};

/// Adjustments of one parameter, keyed by stratum.
///
/// A key of the form `{stratum}W`, or a stratum listed in `overwrite`,
/// replaces the inherited value; any other key multiplies it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AdjustmentRequest {
    /// Strata whose values overwrite instead of multiply.
    #[serde(default)]
    pub overwrite: Vec<String>,
    /// Value per stratum key.
    #[serde(flatten)]
    pub values: BTreeMap<String, ParameterValue>,
}

/// One requested stratification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StratificationRequest {
    /// Stratification name.
    pub name: String,
    /// Requested strata.
    pub strata: StrataRequest,
    /// Base compartments to split; empty means all.
    #[serde(default)]
    pub apply_to: Vec<String>,
    /// Parameter adjustments per stratum.
    #[serde(default)]
    pub adjustments: BTreeMap<String, AdjustmentRequest>,
    /// Share of each compartment's initial population per stratum.
    #[serde(default)]
    pub initial_splits: BTreeMap<String, f64>,
    /// Share of births per stratum of the entry compartment.
    #[serde(default)]
    pub entry_splits: BTreeMap<String, f64>,
    /// Multiplier on the infectiousness of each stratum.
    #[serde(default)]
    pub infectiousness: BTreeMap<String, f64>,
}

impl StratificationRequest {
    /// Starts a request for all compartments.
    #[must_use]
    pub fn new(name: impl Into<String>, strata: impl Into<StrataRequest>) -> Self {
        Self {
            name: name.into(),
            strata: strata.into(),
            apply_to: Vec::new(),
            adjustments: BTreeMap::new(),
            initial_splits: BTreeMap::new(),
            entry_splits: BTreeMap::new(),
            infectiousness: BTreeMap::new(),
        }
    }

    /// Restricts the stratification to the listed base compartments.
    #[must_use]
    pub fn apply_to<I, S>(mut self, compartments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.apply_to = compartments.into_iter().map(Into::into).collect();
        self
    }

    /// Multiplies `parameter` by `value` in `stratum`.
    #[must_use]
    pub fn adjust(
        mut self,
        parameter: impl Into<String>,
        stratum: impl Into<String>,
        value: impl Into<ParameterValue>,
    ) -> Self {
        self.adjustments
            .entry(parameter.into())
            .or_default()
            .values
            .insert(stratum.into(), value.into());
        self
    }

    /// Replaces `parameter` with `value` in `stratum`.
    #[must_use]
    pub fn overwrite(
        mut self,
        parameter: impl Into<String>,
        stratum: impl Into<String>,
        value: impl Into<ParameterValue>,
    ) -> Self {
        let stratum = stratum.into();
        let request = self.adjustments.entry(parameter.into()).or_default();
        request.values.insert(stratum.clone(), value.into());
        request.overwrite.push(stratum);
        self
    }

    /// Sets the share of initial population placed in `stratum`.
    #[must_use]
    pub fn initial_split(mut self, stratum: impl Into<String>, proportion: f64) -> Self {
        self.initial_splits.insert(stratum.into(), proportion);
        self
    }

    /// Sets the share of births entering `stratum`.
    #[must_use]
    pub fn entry_split(mut self, stratum: impl Into<String>, proportion: f64) -> Self {
        self.entry_splits.insert(stratum.into(), proportion);
        self
    }

    /// Scales the infectiousness of compartments in `stratum`.
    #[must_use]
    pub fn infectiousness(mut self, stratum: impl Into<String>, multiplier: f64) -> Self {
        self.infectiousness.insert(stratum.into(), multiplier);
        self
    }

    /// Parses a request from JSON.
    ///
    /// # Errors
    ///
    /// `InvalidStratumCount` for a malformed `strata` entry and
    /// `InvalidConfig` for any other schema problem.
    pub fn from_json_str(json: &str) -> Result<Self, ValidationError> {
        let invalid = |e: serde_json::Error| ValidationError::InvalidConfig {
            reason: e.to_string(),
        };
        let mut raw: serde_json::Value = serde_json::from_str(json).map_err(invalid)?;
        if let Some(strata) = raw.get_mut("strata") {
            let normalized = StrataRequest::from_json(strata)?;
            *strata = serde_json::to_value(normalized).map_err(invalid)?;
        }
        serde_json::from_value(raw).map_err(invalid)
    }
}

/// Summary of an applied stratification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StratificationRecord {
    /// Stratification name.
    pub name: String,
    /// Resolved strata.
    pub strata: Vec<String>,
    /// Base compartments split; empty means all.
    pub apply_to: Vec<String>,
    /// Implement level reached after this stratification.
    pub implement_level: usize,
}

/// Model-level settings a stratification pass reads.
#[derive(Debug, Clone, Copy)]
pub(crate) struct PassSettings<'a> {
    pub entry_compartment: &'a str,
    pub strictness: ProportionStrictness,
}

impl ModelState {
    /// Applies one stratification to this (staged) state.
    pub(crate) fn stratify(&mut self, request: &StratificationRequest, settings: PassSettings<'_>) -> ModelResult<()> {
        let name = request.name.as_str();
        naming::validate_stratification_name(name)?;
        if self.stratifications.iter().any(|s| s.name == name) {
            return Err(ValidationError::InvalidStratificationTarget {
                stratification: name.to_string(),
                reason: "stratification has already been applied".to_string(),
            }
            .into());
        }

        let resolved = strata::resolve(name, &request.strata)?;
        let names = &resolved.names;
        let (registry, expansion) = self.registry.expand(name, names, &request.apply_to)?;
        let level = self.implement_level + 1;

        let mut new_flows = Vec::new();
        let mut split_by_destination = Vec::new();
        for flow in self.flows.active(self.implement_level) {
            let (replication, copies) = FlowTable::replicate(flow, &expansion, name, names, level)?;
            if replication == Replication::ByDestination {
                split_by_destination.extend(new_flows.len()..new_flows.len() + copies.len());
            }
            new_flows.extend(copies);
        }

        if name == AGE_STRATIFICATION {
            new_flows.extend(self.ageing_flows(&resolved, level));
        }

        let initial_shares = initial_shares(name, names, &request.initial_splits)?;
        let mut initial_values = vec![0.0; registry.len()];
        for (compartment, value) in self.registry.compartments().iter().zip(&self.initial_values) {
            let descendants = expansion.descendants(compartment.name()).unwrap_or_default();
            let shares: &[f64] = if expansion.was_expanded(compartment.name()) {
                &initial_shares
            } else {
                &[1.0]
            };
            for (child, share) in descendants.iter().zip(shares) {
                if let Some(index) = registry.index_of(child) {
                    initial_values[index] = value * share;
                }
            }
        }

        let entry_shares = allocation::split(1.0, name, names, &request.entry_splits, settings.strictness)?;
        let targets_entry = request.apply_to.is_empty()
            || request.apply_to.iter().any(|c| c == settings.entry_compartment);
        if !targets_entry && !request.entry_splits.is_empty() {
            tracing::debug!(
                stratification = name,
                entry = settings.entry_compartment,
                "entry splits ignored: entry compartment is not stratified"
            );
        }
        let mut entry_proportions = BTreeMap::new();
        for (compartment, proportion) in &self.entry_proportions {
            if expansion.was_expanded(compartment) {
                let descendants = expansion.descendants(compartment).unwrap_or_default();
                for (child, share) in descendants.iter().zip(&entry_shares) {
                    entry_proportions.insert(child.clone(), proportion * share);
                }
            } else {
                entry_proportions.insert(compartment.clone(), *proportion);
            }
        }

        let mut parameters = self.parameters.clone();
        for (from, to, width) in resolved.ageing_intervals() {
            parameters.insert(ageing_parameter(from, to), 1.0 / width);
        }
        for (parameter, adjustment) in &request.adjustments {
            if !parameters.contains(parameter) {
                return Err(ValidationError::UnknownParameter {
                    name: parameter.clone(),
                }
                .into());
            }
            if let Some(unknown) = adjustment.overwrite.iter().find(|s| !names.contains(s)) {
                return Err(unknown_stratum(name, unknown).into());
            }
            for (key, value) in &adjustment.values {
                let (stratum, marked) = if names.contains(key) {
                    (key.as_str(), false)
                } else {
                    naming::split_overwrite_marker(key)
                };
                if !names.iter().any(|n| n == stratum) {
                    return Err(unknown_stratum(name, key).into());
                }
                let overwrite = marked || adjustment.overwrite.iter().any(|s| s == stratum);
                let entry = if overwrite {
                    Adjustment::Overwrite(value.clone())
                } else {
                    Adjustment::Multiply(value.clone())
                };
                parameters.adjust(parameter.clone(), StratumKey::new(name, stratum), entry);
            }
        }
        // Copies split only at their destination share the original rate
        // evenly unless the request adjusts their parameter here.
        #[allow(clippy::cast_precision_loss)]
        let even_share = 1.0 / names.len() as f64;
        for index in split_by_destination {
            let flow = &mut new_flows[index];
            if !parameters.is_adjusted_by(&flow.parameter, name) {
                flow.share *= even_share;
            }
        }

        let mut infectiousness = self.infectiousness.clone();
        for (stratum, multiplier) in &request.infectiousness {
            if !names.contains(stratum) {
                return Err(unknown_stratum(name, stratum).into());
            }
            infectiousness.insert(StratumKey::new(name, stratum.clone()), *multiplier);
        }

        tracing::debug!(
            stratification = name,
            strata = names.len(),
            compartments = registry.len(),
            flows = new_flows.len(),
            level,
            "stratification applied"
        );

        for flow in new_flows {
            self.flows.append(flow);
        }
        self.registry = registry;
        self.initial_values = initial_values;
        self.entry_proportions = entry_proportions;
        self.parameters = parameters;
        self.infectiousness = infectiousness;
        self.implement_level = level;
        self.stratifications.push(StratificationRecord {
            name: name.to_string(),
            strata: names.clone(),
            apply_to: request.apply_to.clone(),
            implement_level: level,
        });
        Ok(())
    }

    /// One ageing flow per pre-age compartment and non-terminal age stratum.
    fn ageing_flows(&self, resolved: &ResolvedStrata, level: usize) -> Vec<Flow> {
        let mut flows = Vec::new();
        for compartment in self.registry.compartments() {
            for (from, to, _) in resolved.ageing_intervals() {
                let origin = compartment.stratified(StratumKey::new(AGE_STRATIFICATION, from));
                let destination = compartment.stratified(StratumKey::new(AGE_STRATIFICATION, to));
                flows.push(Flow {
                    flow_type: FlowType::StandardFlow,
                    parameter: ageing_parameter(from, to),
                    origin: origin.name().to_string(),
                    to: Some(destination.name().to_string()),
                    implement_level: level,
                    strata: origin.strata().to_vec(),
                    share: 1.0,
                });
            }
        }
        flows
    }
}

/// Name of the parameter ageing population from stratum `from` to `to`.
#[must_use]
pub fn ageing_parameter(from: &str, to: &str) -> String {
    format!("ageing{from}to{to}")
}

fn unknown_stratum(stratification: &str, stratum: &str) -> ValidationError {
    ValidationError::UnknownStratum {
        stratification: stratification.to_string(),
        stratum: stratum.to_string(),
    }
}

/// Initial-population shares; unlike entry splits these must never leave a
/// stratum with a negative population, and a split naming every stratum
/// must account for the whole population.
fn initial_shares(
    stratification: &str,
    strata: &[String],
    requested: &BTreeMap<String, f64>,
) -> Result<Vec<f64>, ValidationError> {
    let requested_sum: f64 = requested.values().sum();
    if requested_sum > 1.0 + PROPORTION_TOLERANCE || requested.values().any(|p| *p < 0.0) {
        return Err(ValidationError::OverAllocatedPopulation {
            requested: requested_sum,
            total: 1.0,
        });
    }
    let shares = allocation::split(1.0, stratification, strata, requested, ProportionStrictness::Strict)?;
    let complete = strata.iter().all(|s| requested.contains_key(s));
    if complete && requested_sum < 1.0 - PROPORTION_TOLERANCE {
        return Err(ValidationError::UnallocatedPopulation {
            context: stratification.to_string(),
            sum: requested_sum,
        });
    }
    Ok(shares)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_records_overwrites() {
        let request = StratificationRequest::new("risk", vec!["low", "high"])
            .adjust("beta", "low", 0.5)
            .overwrite("beta", "high", 2.0)
            .apply_to(["susceptible"]);
        let beta = &request.adjustments["beta"];
        assert_eq!(beta.values.len(), 2);
        assert_eq!(beta.overwrite, vec!["high"]);
        assert_eq!(request.apply_to, vec!["susceptible"]);
    }

    #[test]
    fn json_request_with_marker_and_function() {
        let request = StratificationRequest::from_json_str(
            r#"{
                "name": "status",
                "strata": ["mild", "severe"],
                "apply_to": ["infectious"],
                "adjustments": {"gamma": {"mildW": 0.3, "severe": "slow_recovery"}},
                "initial_splits": {"mild": 0.8}
            }"#,
        )
        .unwrap();
        let gamma = &request.adjustments["gamma"];
        assert_eq!(gamma.values.get("mildW"), Some(&ParameterValue::Constant(0.3)));
        assert_eq!(
            gamma.values.get("severe"),
            Some(&ParameterValue::Function("slow_recovery".to_string()))
        );
        assert!(gamma.overwrite.is_empty());
    }

    #[test]
    fn json_request_with_count() {
        let request = StratificationRequest::from_json_str(r#"{"name": "risk", "strata": 3}"#).unwrap();
        assert_eq!(request.strata, StrataRequest::Count(3));
    }

    #[test]
    fn json_request_with_mixed_strata() {
        let request = StratificationRequest::from_json_str(r#"{"name": "dose", "strata": ["none", 2]}"#).unwrap();
        assert_eq!(request.strata, StrataRequest::from(vec!["none", "2"]));
    }

    #[test]
    fn json_request_with_bad_strata() {
        let err = StratificationRequest::from_json_str(r#"{"name": "risk", "strata": 2.5}"#).unwrap_err();
        assert!(matches!(err, ValidationError::InvalidStratumCount { .. }));
    }

    #[test]
    fn initial_shares_reject_over_allocation() {
        let strata = vec!["a".to_string(), "b".to_string()];
        let requested: BTreeMap<String, f64> = [("a".to_string(), 1.2)].into_iter().collect();
        assert!(matches!(
            initial_shares("risk", &strata, &requested),
            Err(ValidationError::OverAllocatedPopulation { .. })
        ));
    }

    #[test]
    fn initial_shares_must_cover_population() {
        let strata = vec!["a".to_string(), "b".to_string()];
        let partial: BTreeMap<String, f64> = [("a".to_string(), 0.3), ("b".to_string(), 0.3)].into_iter().collect();
        assert_eq!(
            initial_shares("risk", &strata, &partial),
            Err(ValidationError::UnallocatedPopulation {
                context: "risk".to_string(),
                sum: 0.6,
            })
        );

        let complete: BTreeMap<String, f64> = [("a".to_string(), 0.3), ("b".to_string(), 0.7)].into_iter().collect();
        let shares = initial_shares("risk", &strata, &complete).unwrap();
        assert!((shares.iter().sum::<f64>() - 1.0).abs() < 1e-12);

        let remainder: BTreeMap<String, f64> = [("a".to_string(), 0.3)].into_iter().collect();
        let shares = initial_shares("risk", &strata, &remainder).unwrap();
        assert!((shares[1] - 0.7).abs() < 1e-12);
    }

    #[test]
    fn ageing_parameter_names() {
        assert_eq!(ageing_parameter("0", "5"), "ageing0to5");
    }
}
