//! Compartments and the compartment registry.
//!
//! A compartment is a base name plus the ordered list of strata it was
//! split into. The registry keeps compartments in state-vector order and
//! rebuilds its name index after every expansion.

use std::collections::{BTreeSet, HashMap};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;
use crate::naming::{self, AGE_STRATIFICATION};

/// One `(stratification, stratum)` step on a compartment's path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StratumKey {
    /// Stratification name, e.g. `age`.
    pub stratification: String,
    /// Stratum within the stratification, e.g. `15`.
    pub stratum: String,
}

impl StratumKey {
    /// Creates a stratum key.
    #[must_use]
    pub fn new(stratification: impl Into<String>, stratum: impl Into<String>) -> Self {
        Self {
            stratification: stratification.into(),
            stratum: stratum.into(),
        }
    }
}

impl fmt::Display for StratumKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", naming::stratum_suffix(&self.stratification, &self.stratum))
    }
}

/// A named sub-population in the model state vector.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Compartment {
    base: String,
    strata: Vec<StratumKey>,
    name: String,
}

impl Compartment {
    /// Creates an unstratified compartment.
    #[must_use]
    pub fn new(base: impl Into<String>) -> Self {
        let base = base.into();
        Self {
            name: base.clone(),
            base,
            strata: Vec::new(),
        }
    }

    /// Returns the copy of this compartment split into one more stratum.
    #[must_use]
    pub fn stratified(&self, key: StratumKey) -> Self {
        let name = format!("{}{key}", self.name);
        let mut strata = self.strata.clone();
        strata.push(key);
        Self {
            base: self.base.clone(),
            strata,
            name,
        }
    }

    /// Full rendered name, unique within a registry.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Unstratified ancestor name.
    #[must_use]
    pub fn base(&self) -> &str {
        &self.base
    }

    /// Strata applied to this compartment, oldest first.
    #[must_use]
    pub fn strata(&self) -> &[StratumKey] {
        &self.strata
    }

    /// Stratum of this compartment for one stratification, if it was split by it.
    #[must_use]
    pub fn stratum_of(&self, stratification: &str) -> Option<&str> {
        self.strata
            .iter()
            .find(|k| k.stratification == stratification)
            .map(|k| k.stratum.as_str())
    }

    /// Name of the compartment this one was split from.
    #[must_use]
    pub fn parent_name(&self) -> Option<String> {
        let (_, ancestors) = self.strata.split_last()?;
        let mut parent = Compartment::new(self.base.clone());
        for key in ancestors {
            parent = parent.stratified(key.clone());
        }
        Some(parent.name)
    }
}

impl fmt::Display for Compartment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Mapping from every pre-expansion compartment name to its post-expansion
/// descendants. Compartments that were not expanded map to themselves.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExpansionMap {
    descendants: HashMap<String, Vec<String>>,
    expanded: BTreeSet<String>,
}

impl ExpansionMap {
    /// Descendants of a pre-expansion compartment, in stratum order.
    #[must_use]
    pub fn descendants(&self, name: &str) -> Option<&[String]> {
        self.descendants.get(name).map(Vec::as_slice)
    }

    /// Returns true if the compartment was split by this expansion.
    #[must_use]
    pub fn was_expanded(&self, name: &str) -> bool {
        self.expanded.contains(name)
    }

    /// Returns true if the map has an entry for the compartment.
    #[must_use]
    pub fn covers(&self, name: &str) -> bool {
        self.descendants.contains_key(name)
    }

    fn pass_through(&mut self, name: &str) {
        self.descendants
            .insert(name.to_string(), vec![name.to_string()]);
    }

    fn split(&mut self, name: &str, children: Vec<String>) {
        self.expanded.insert(name.to_string());
        self.descendants.insert(name.to_string(), children);
    }
}

/// Ordered set of compartments with a name -> state index map.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompartmentRegistry {
    compartments: Vec<Compartment>,
    index: HashMap<String, usize>,
}

impl CompartmentRegistry {
    /// Creates a registry of unstratified compartments.
    ///
    /// # Errors
    ///
    /// Returns `InvalidName` for a malformed name and
    /// `DuplicateCompartmentName` if a name repeats.
    pub fn new<I, S>(names: I) -> Result<Self, ValidationError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let compartments = names
            .into_iter()
            .map(|name| {
                let name = name.as_ref();
                naming::validate_compartment_name(name)?;
                Ok(Compartment::new(name))
            })
            .collect::<Result<Vec<_>, ValidationError>>()?;
        Self::from_compartments(compartments)
    }

    fn from_compartments(compartments: Vec<Compartment>) -> Result<Self, ValidationError> {
        let mut index = HashMap::with_capacity(compartments.len());
        for (i, compartment) in compartments.iter().enumerate() {
            if index.insert(compartment.name.clone(), i).is_some() {
                return Err(ValidationError::DuplicateCompartmentName {
                    name: compartment.name.clone(),
                });
            }
        }
        Ok(Self {
            compartments,
            index,
        })
    }

    /// Number of compartments (state-vector length).
    #[must_use]
    pub fn len(&self) -> usize {
        self.compartments.len()
    }

    /// Returns true if the registry holds no compartments.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.compartments.is_empty()
    }

    /// Compartments in state-vector order.
    #[must_use]
    pub fn compartments(&self) -> &[Compartment] {
        &self.compartments
    }

    /// Compartment names in state-vector order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.compartments.iter().map(Compartment::name)
    }

    /// State-vector index of a compartment.
    #[must_use]
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    /// Looks up a compartment by full name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Compartment> {
        self.index_of(name).map(|i| &self.compartments[i])
    }

    /// Returns true if the compartment exists.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// Returns true if any compartment descends from this base name.
    #[must_use]
    pub fn has_base(&self, base: &str) -> bool {
        self.compartments.iter().any(|c| c.base == base)
    }

    /// Pre-stratification ancestor of a compartment.
    #[must_use]
    pub fn ancestor(&self, name: &str) -> Option<String> {
        self.get(name).and_then(Compartment::parent_name)
    }

    /// Indices of all compartments whose base name is listed.
    #[must_use]
    pub fn indices_of_bases(&self, bases: &[String]) -> Vec<usize> {
        self.compartments
            .iter()
            .enumerate()
            .filter(|(_, c)| bases.iter().any(|b| b == &c.base))
            .map(|(i, _)| i)
            .collect()
    }

    /// Splits compartments into one copy per stratum.
    ///
    /// An empty `apply_to` expands every compartment; otherwise only the
    /// compartments whose base name is listed are expanded. The receiver is
    /// left untouched; the caller commits the returned registry.
    ///
    /// # Errors
    ///
    /// `InvalidStratificationTarget` for an unknown base name or a targeted
    /// age stratification, `DuplicateCompartmentName` on a name collision.
    pub fn expand(
        &self,
        stratification: &str,
        strata: &[String],
        apply_to: &[String],
    ) -> Result<(Self, ExpansionMap), ValidationError> {
        if stratification == AGE_STRATIFICATION && !apply_to.is_empty() {
            return Err(ValidationError::InvalidStratificationTarget {
                stratification: stratification.to_string(),
                reason: "age stratification must apply to all compartments".to_string(),
            });
        }
        if let Some(unknown) = apply_to.iter().find(|b| !self.has_base(b)) {
            return Err(ValidationError::InvalidStratificationTarget {
                stratification: stratification.to_string(),
                reason: format!("unknown compartment '{unknown}'"),
            });
        }

        let mut expansion = ExpansionMap::default();
        let mut next = Vec::with_capacity(self.compartments.len() * strata.len().max(1));
        for compartment in &self.compartments {
            let targeted = apply_to.is_empty() || apply_to.iter().any(|b| b == &compartment.base);
            if !targeted {
                expansion.pass_through(&compartment.name);
                next.push(compartment.clone());
                continue;
            }
            let children: Vec<Compartment> = strata
                .iter()
                .map(|s| compartment.stratified(StratumKey::new(stratification, s.clone())))
                .collect();
            expansion.split(
                &compartment.name,
                children.iter().map(|c| c.name.clone()).collect(),
            );
            next.extend(children);
        }

        Ok((Self::from_compartments(next)?, expansion))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sir() -> CompartmentRegistry {
        CompartmentRegistry::new(["susceptible", "infectious", "recovered"]).unwrap()
    }

    fn strata(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| (*s).to_string()).collect()
    }

    #[test]
    fn new_rejects_duplicates() {
        let err = CompartmentRegistry::new(["susceptible", "susceptible"]).unwrap_err();
        assert!(matches!(err, ValidationError::DuplicateCompartmentName { .. }));
    }

    #[test]
    fn expand_targeted_compartment_only() {
        let registry = sir();
        let (next, map) = registry
            .expand("status", &strata(&["mild", "severe"]), &strata(&["infectious"]))
            .unwrap();

        let names: Vec<&str> = next.names().collect();
        assert_eq!(
            names,
            vec![
                "susceptible",
                "infectiousXstatus_mild",
                "infectiousXstatus_severe",
                "recovered"
            ]
        );
        assert!(map.was_expanded("infectious"));
        assert!(!map.was_expanded("susceptible"));
        assert_eq!(map.descendants("susceptible").unwrap(), ["susceptible"]);
        assert_eq!(next.index_of("recovered"), Some(3));
        // Receiver is unchanged.
        assert_eq!(registry.len(), 3);
    }

    #[test]
    fn expand_everything_when_untargeted() {
        let (next, _) = sir().expand("age", &strata(&["0", "5"]), &[]).unwrap();
        assert_eq!(next.len(), 6);
        assert!(next.contains("recoveredXage_5"));
    }

    #[test]
    fn ancestor_is_traceable() {
        let (once, _) = sir().expand("age", &strata(&["0", "5"]), &[]).unwrap();
        let (twice, _) = once
            .expand("status", &strata(&["mild"]), &strata(&["infectious"]))
            .unwrap();
        assert_eq!(
            twice.ancestor("infectiousXage_5Xstatus_mild").as_deref(),
            Some("infectiousXage_5")
        );
        assert_eq!(twice.ancestor("infectiousXage_5").as_deref(), Some("infectious"));
        assert_eq!(twice.ancestor("susceptible"), None);
        let compartment = twice.get("infectiousXage_5Xstatus_mild").unwrap();
        assert_eq!(compartment.base(), "infectious");
        assert_eq!(compartment.stratum_of("age"), Some("5"));
    }

    #[test]
    fn expand_rejects_unknown_target() {
        let err = sir()
            .expand("status", &strata(&["a"]), &strata(&["exposed"]))
            .unwrap_err();
        assert!(matches!(err, ValidationError::InvalidStratificationTarget { .. }));
    }

    #[test]
    fn expand_rejects_targeted_age() {
        let err = sir()
            .expand("age", &strata(&["0"]), &strata(&["infectious"]))
            .unwrap_err();
        assert!(matches!(err, ValidationError::InvalidStratificationTarget { .. }));
    }

    #[test]
    fn expand_rejects_collisions() {
        let err = sir()
            .expand("status", &strata(&["a", "a"]), &[])
            .unwrap_err();
        assert!(matches!(err, ValidationError::DuplicateCompartmentName { .. }));
    }
}
