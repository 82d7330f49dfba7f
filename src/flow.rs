//! Flow requests and the append-only flow table.
//!
//! Flows are never removed. Each stratification replicates the active flows
//! into the next implement level; only the newest level feeds the ODE, older
//! levels remain for provenance and diagrams.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::compartment::{CompartmentRegistry, ExpansionMap, StratumKey};
use crate::error::{ExecutionError, ValidationError};

/// Kind of rate term a flow contributes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowType {
    /// `rate * origin`.
    StandardFlow,
    /// `rate * origin * infectious`.
    InfectionDensity,
    /// `rate * origin * infectious / total`.
    InfectionFrequency,
    /// `rate * origin`, leaving the system.
    CompartmentDeath,
}

impl FlowType {
    /// Returns true for flows with no destination compartment.
    #[must_use]
    pub const fn is_death(&self) -> bool {
        matches!(self, Self::CompartmentDeath)
    }

    /// Returns true for flows scaled by the infectious population.
    #[must_use]
    pub const fn is_infection(&self) -> bool {
        matches!(self, Self::InfectionDensity | Self::InfectionFrequency)
    }
}

impl fmt::Display for FlowType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StandardFlow => write!(f, "standard_flow"),
            Self::InfectionDensity => write!(f, "infection_density"),
            Self::InfectionFrequency => write!(f, "infection_frequency"),
            Self::CompartmentDeath => write!(f, "compartment_death"),
        }
    }
}

/// A user-requested flow between unstratified compartments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowRequest {
    /// Kind of flow.
    #[serde(rename = "type")]
    pub flow_type: FlowType,
    /// Base parameter name.
    pub parameter: String,
    /// Source compartment.
    pub origin: String,
    /// Destination compartment; absent for deaths.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
}

impl FlowRequest {
    /// Standard transition.
    #[must_use]
    pub fn standard(parameter: impl Into<String>, origin: impl Into<String>, to: impl Into<String>) -> Self {
        Self::between(FlowType::StandardFlow, parameter, origin, to)
    }

    /// Frequency-dependent infection.
    #[must_use]
    pub fn infection_frequency(
        parameter: impl Into<String>,
        origin: impl Into<String>,
        to: impl Into<String>,
    ) -> Self {
        Self::between(FlowType::InfectionFrequency, parameter, origin, to)
    }

    /// Density-dependent infection.
    #[must_use]
    pub fn infection_density(
        parameter: impl Into<String>,
        origin: impl Into<String>,
        to: impl Into<String>,
    ) -> Self {
        Self::between(FlowType::InfectionDensity, parameter, origin, to)
    }

    /// Compartment-specific death.
    #[must_use]
    pub fn death(parameter: impl Into<String>, origin: impl Into<String>) -> Self {
        Self {
            flow_type: FlowType::CompartmentDeath,
            parameter: parameter.into(),
            origin: origin.into(),
            to: None,
        }
    }

    fn between(
        flow_type: FlowType,
        parameter: impl Into<String>,
        origin: impl Into<String>,
        to: impl Into<String>,
    ) -> Self {
        Self {
            flow_type,
            parameter: parameter.into(),
            origin: origin.into(),
            to: Some(to.into()),
        }
    }

    /// Checks the request against the flow schema and the registry.
    ///
    /// # Errors
    ///
    /// `InvalidFlow` for a missing/forbidden destination, an empty parameter
    /// name or a self-loop; `UnknownCompartment` for unknown endpoints.
    pub fn validate(&self, registry: &CompartmentRegistry) -> Result<(), ValidationError> {
        if self.parameter.trim().is_empty() {
            return Err(ValidationError::InvalidFlow {
                reason: format!("{} flow from '{}' has no parameter", self.flow_type, self.origin),
            });
        }
        match (&self.to, self.flow_type.is_death()) {
            (None, false) => {
                return Err(ValidationError::InvalidFlow {
                    reason: format!("{} flow '{}' requires a destination", self.flow_type, self.parameter),
                })
            }
            (Some(_), true) => {
                return Err(ValidationError::InvalidFlow {
                    reason: format!("death flow '{}' cannot have a destination", self.parameter),
                })
            }
            _ => {}
        }
        for endpoint in std::iter::once(&self.origin).chain(self.to.as_ref()) {
            if !registry.contains(endpoint) {
                return Err(ValidationError::UnknownCompartment {
                    name: endpoint.clone(),
                });
            }
        }
        if self.to.as_deref() == Some(self.origin.as_str()) {
            return Err(ValidationError::InvalidFlow {
                reason: format!("flow '{}' starts and ends in '{}'", self.parameter, self.origin),
            });
        }
        Ok(())
    }
}

/// A flow record in the table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Flow {
    /// Kind of flow.
    #[serde(rename = "type")]
    pub flow_type: FlowType,
    /// Base parameter name; never rewritten by stratification.
    pub parameter: String,
    /// Source compartment at this level.
    pub origin: String,
    /// Destination compartment at this level; absent for deaths.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    /// Stratification stage at which this flow is valid.
    pub implement_level: usize,
    /// Stratum path the parameter is resolved along.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub strata: Vec<StratumKey>,
    /// Fixed factor on the resolved rate. Below one for copies of a flow
    /// whose destination alone was split; inherited by later copies.
    #[serde(default = "unit_share", skip_serializing_if = "is_unit_share")]
    pub share: f64,
}

const fn unit_share() -> f64 {
    1.0
}

#[allow(clippy::float_cmp, clippy::trivially_copy_pass_by_ref)]
fn is_unit_share(share: &f64) -> bool {
    *share == 1.0
}

impl Flow {
    /// Creates a level-0 flow from a request.
    #[must_use]
    pub fn from_request(request: &FlowRequest) -> Self {
        Self {
            flow_type: request.flow_type,
            parameter: request.parameter.clone(),
            origin: request.origin.clone(),
            to: request.to.clone(),
            implement_level: 0,
            strata: Vec::new(),
            share: 1.0,
        }
    }

    fn advanced(&self, origin: &str, to: Option<&str>, extra: Option<StratumKey>, level: usize) -> Self {
        let mut strata = self.strata.clone();
        strata.extend(extra);
        Self {
            flow_type: self.flow_type,
            parameter: self.parameter.clone(),
            origin: origin.to_string(),
            to: to.map(str::to_string),
            implement_level: level,
            strata,
            share: self.share,
        }
    }
}

/// How one flow was split during replication.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Replication {
    /// Neither end was expanded.
    Unchanged,
    /// The origin (and possibly the destination) was expanded.
    ByOrigin,
    /// Only the destination was expanded; the rate is split across strata.
    ByDestination,
}

/// Append-only, ordered ledger of flows.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FlowTable {
    flows: Vec<Flow>,
}

impl FlowTable {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a flow.
    pub fn append(&mut self, flow: Flow) {
        self.flows.push(flow);
    }

    /// Every flow across all levels, in insertion order.
    #[must_use]
    pub fn all(&self) -> &[Flow] {
        &self.flows
    }

    /// Number of flows across all levels.
    #[must_use]
    pub fn len(&self) -> usize {
        self.flows.len()
    }

    /// Returns true if the table is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }

    /// Flows valid at `level`, in insertion order.
    pub fn active(&self, level: usize) -> impl Iterator<Item = &Flow> {
        self.flows.iter().filter(move |f| f.implement_level == level)
    }

    /// Serializes the whole table for external diagram tools.
    ///
    /// # Errors
    ///
    /// Returns the serializer's error message as `InvalidConfig`.
    pub fn to_json(&self) -> Result<String, ValidationError> {
        serde_json::to_string_pretty(self).map_err(|e| ValidationError::InvalidConfig {
            reason: format!("failed to serialize flow table: {e}"),
        })
    }

    /// Replicates one flow across an expansion, stamping the copies with
    /// `level`.
    ///
    /// # Errors
    ///
    /// `FlowReplicationMismatch` if the expansion does not cover the origin
    /// or the destination.
    pub fn replicate(
        flow: &Flow,
        expansion: &ExpansionMap,
        stratification: &str,
        strata: &[String],
        level: usize,
    ) -> Result<(Replication, Vec<Flow>), ExecutionError> {
        let mismatch = |compartment: &str| ExecutionError::FlowReplicationMismatch {
            parameter: flow.parameter.clone(),
            compartment: compartment.to_string(),
        };

        let origins = expansion
            .descendants(&flow.origin)
            .ok_or_else(|| mismatch(&flow.origin))?;
        let destinations = match &flow.to {
            Some(to) => Some(expansion.descendants(to).ok_or_else(|| mismatch(to))?),
            None => None,
        };

        let origin_split = expansion.was_expanded(&flow.origin);
        let to_split = flow.to.as_deref().is_some_and(|to| expansion.was_expanded(to));
        let key = |i: usize| StratumKey::new(stratification, strata[i].clone());

        let (replication, copies) = match (origin_split, to_split, destinations) {
            (true, true, Some(destinations)) => (
                Replication::ByOrigin,
                origins
                    .iter()
                    .zip(destinations)
                    .enumerate()
                    .map(|(i, (o, d))| flow.advanced(o, Some(d.as_str()), Some(key(i)), level))
                    .collect(),
            ),
            (true, _, _) => (
                Replication::ByOrigin,
                origins
                    .iter()
                    .enumerate()
                    .map(|(i, o)| flow.advanced(o, flow.to.as_deref(), Some(key(i)), level))
                    .collect(),
            ),
            (false, true, Some(destinations)) => (
                Replication::ByDestination,
                destinations
                    .iter()
                    .enumerate()
                    .map(|(i, d)| flow.advanced(&flow.origin, Some(d.as_str()), Some(key(i)), level))
                    .collect(),
            ),
            _ => (
                Replication::Unchanged,
                vec![flow.advanced(&flow.origin, flow.to.as_deref(), None, level)],
            ),
        };
        Ok((replication, copies))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> CompartmentRegistry {
        CompartmentRegistry::new(["susceptible", "infectious", "recovered"]).unwrap()
    }

    fn strata(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| (*s).to_string()).collect()
    }

    #[test]
    fn schema_validation() {
        let reg = registry();
        FlowRequest::standard("gamma", "infectious", "recovered").validate(&reg).unwrap();
        FlowRequest::death("mu", "infectious").validate(&reg).unwrap();

        let mut missing_to = FlowRequest::standard("gamma", "infectious", "recovered");
        missing_to.to = None;
        assert!(matches!(missing_to.validate(&reg), Err(ValidationError::InvalidFlow { .. })));

        let mut death_with_to = FlowRequest::death("mu", "infectious");
        death_with_to.to = Some("recovered".to_string());
        assert!(matches!(death_with_to.validate(&reg), Err(ValidationError::InvalidFlow { .. })));

        assert!(matches!(
            FlowRequest::standard("gamma", "infectious", "exposed").validate(&reg),
            Err(ValidationError::UnknownCompartment { .. })
        ));
        assert!(FlowRequest::standard("gamma", "infectious", "infectious").validate(&reg).is_err());
    }

    #[test]
    fn request_deserializes_from_json() {
        let request: FlowRequest = serde_json::from_str(
            r#"{"type": "infection_frequency", "parameter": "beta", "origin": "susceptible", "to": "infectious"}"#,
        )
        .unwrap();
        assert_eq!(request, FlowRequest::infection_frequency("beta", "susceptible", "infectious"));
    }

    #[test]
    fn active_filters_by_level() {
        let mut table = FlowTable::new();
        let base = Flow::from_request(&FlowRequest::standard("gamma", "infectious", "recovered"));
        let mut later = base.clone();
        later.implement_level = 1;
        table.append(base);
        table.append(later);
        assert_eq!(table.active(0).count(), 1);
        assert_eq!(table.active(1).count(), 1);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn replicate_by_origin_keeps_destination() {
        let names = strata(&["mild", "severe"]);
        let (_, expansion) = registry().expand("status", &names, &strata(&["infectious"])).unwrap();
        let flow = Flow::from_request(&FlowRequest::standard("gamma", "infectious", "recovered"));

        let (replication, copies) = FlowTable::replicate(&flow, &expansion, "status", &names, 1).unwrap();
        assert_eq!(replication, Replication::ByOrigin);
        assert_eq!(copies.len(), 2);
        assert_eq!(copies[0].origin, "infectiousXstatus_mild");
        assert_eq!(copies[0].to.as_deref(), Some("recovered"));
        assert_eq!(copies[1].strata, vec![StratumKey::new("status", "severe")]);
        assert!(copies.iter().all(|f| f.implement_level == 1 && f.parameter == "gamma"));
    }

    #[test]
    fn replicate_both_ends_pairs_strata() {
        let names = strata(&["0", "5"]);
        let (_, expansion) = registry().expand("age", &names, &[]).unwrap();
        let flow = Flow::from_request(&FlowRequest::standard("gamma", "infectious", "recovered"));

        let (_, copies) = FlowTable::replicate(&flow, &expansion, "age", &names, 1).unwrap();
        let pairs: Vec<(&str, &str)> = copies
            .iter()
            .map(|f| (f.origin.as_str(), f.to.as_deref().unwrap_or_default()))
            .collect();
        assert_eq!(
            pairs,
            vec![("infectiousXage_0", "recoveredXage_0"), ("infectiousXage_5", "recoveredXage_5")]
        );
    }

    #[test]
    fn replicate_by_destination() {
        let names = strata(&["mild", "severe"]);
        let (_, expansion) = registry().expand("status", &names, &strata(&["infectious"])).unwrap();
        let flow = Flow::from_request(&FlowRequest::infection_frequency("beta", "susceptible", "infectious"));

        let (replication, copies) = FlowTable::replicate(&flow, &expansion, "status", &names, 1).unwrap();
        assert_eq!(replication, Replication::ByDestination);
        assert!(copies.iter().all(|f| f.origin == "susceptible" && f.share == 1.0));
        assert_eq!(copies[1].to.as_deref(), Some("infectiousXstatus_severe"));
    }

    #[test]
    fn replicate_death_and_untouched() {
        let names = strata(&["mild", "severe"]);
        let (_, expansion) = registry().expand("status", &names, &strata(&["infectious"])).unwrap();

        let death = Flow::from_request(&FlowRequest::death("mu", "infectious"));
        let (_, copies) = FlowTable::replicate(&death, &expansion, "status", &names, 1).unwrap();
        assert_eq!(copies.len(), 2);
        assert!(copies.iter().all(|f| f.to.is_none()));

        let waning = Flow::from_request(&FlowRequest::standard("omega", "recovered", "susceptible"));
        let (replication, copies) = FlowTable::replicate(&waning, &expansion, "status", &names, 1).unwrap();
        assert_eq!(replication, Replication::Unchanged);
        assert_eq!(copies.len(), 1);
        assert!(copies[0].strata.is_empty());
    }

    #[test]
    fn replicate_reports_uncovered_origin() {
        let names = strata(&["a"]);
        let (_, expansion) = registry().expand("risk", &names, &[]).unwrap();
        let flow = Flow::from_request(&FlowRequest::standard("gamma", "exposed", "recovered"));
        let err = FlowTable::replicate(&flow, &expansion, "risk", &names, 1).unwrap_err();
        assert!(matches!(err, ExecutionError::FlowReplicationMismatch { .. }));
    }

    #[test]
    fn table_exports_json() {
        let mut table = FlowTable::new();
        table.append(Flow::from_request(&FlowRequest::death("mu", "infectious")));
        let json = table.to_json().unwrap();
        assert!(json.contains("compartment_death"));
        assert!(!json.contains("\"to\""));
        assert!(!json.contains("share"));

        let mut split = Flow::from_request(&FlowRequest::standard("gamma", "infectious", "recovered"));
        split.share = 0.5;
        table.append(split);
        let restored: FlowTable = serde_json::from_str(&table.to_json().unwrap()).unwrap();
        assert_eq!(restored, table);
        assert_eq!(restored.all()[0].share, 1.0);
    }
}
