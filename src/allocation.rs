//! Distribution of populations across compartments and strata.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::compartment::CompartmentRegistry;
use crate::error::ValidationError;

/// Tolerance used when comparing proportion sums against one.
pub const PROPORTION_TOLERANCE: f64 = 1e-9;

/// What to do when requested proportions sum above one, leaving the
/// unspecified strata a negative share.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ProportionStrictness {
    /// Accept silently.
    Lenient,
    /// Accept and log a warning.
    #[default]
    Warn,
    /// Reject with `ProportionSumExceeded`.
    Strict,
}

/// Places requested initial quantities into a zeroed state vector.
///
/// With a `total_population`, the unallocated remainder goes to
/// `default_target`. A deficit within rounding of the total counts as zero.
///
/// # Errors
///
/// `UnknownCompartment` for a requested or default name missing from the
/// registry, `OverAllocatedPopulation` when the requests exceed the total,
/// `InvalidConfig` for a negative or non-finite request.
pub fn allocate_initial(
    registry: &CompartmentRegistry,
    requested: &BTreeMap<String, f64>,
    total_population: Option<f64>,
    default_target: &str,
) -> Result<Vec<f64>, ValidationError> {
    let mut values = vec![0.0; registry.len()];
    for (name, quantity) in requested {
        let index = registry
            .index_of(name)
            .ok_or_else(|| ValidationError::UnknownCompartment { name: name.clone() })?;
        if !quantity.is_finite() || *quantity < 0.0 {
            return Err(ValidationError::InvalidConfig {
                reason: format!("initial value for '{name}' must be a non-negative number"),
            });
        }
        values[index] += quantity;
    }

    if let Some(total) = total_population {
        let index = registry
            .index_of(default_target)
            .ok_or_else(|| ValidationError::UnknownCompartment {
                name: default_target.to_string(),
            })?;
        let requested_sum: f64 = requested.values().sum();
        let remainder = total - requested_sum;
        if remainder < -PROPORTION_TOLERANCE * total.max(1.0) {
            return Err(ValidationError::OverAllocatedPopulation {
                requested: requested_sum,
                total,
            });
        }
        values[index] += remainder.max(0.0);
    }

    Ok(values)
}

/// Splits `total` across `strata` according to partially requested
/// proportions. Unspecified strata share `1 - sum(requested)` equally.
///
/// The result is parallel to `strata`. When every stratum is specified the
/// requested proportions are used as given, whatever their sum.
///
/// # Errors
///
/// `UnknownStratum` for a key outside `strata`; `ProportionSumExceeded` under
/// [`ProportionStrictness::Strict`] when the requested proportions sum above
/// one.
pub fn split(
    total: f64,
    stratification: &str,
    strata: &[String],
    requested: &BTreeMap<String, f64>,
    strictness: ProportionStrictness,
) -> Result<Vec<f64>, ValidationError> {
    if let Some(unknown) = requested.keys().find(|k| !strata.contains(k)) {
        return Err(ValidationError::UnknownStratum {
            stratification: stratification.to_string(),
            stratum: unknown.clone(),
        });
    }

    let requested_sum: f64 = requested.values().sum();
    if requested_sum > 1.0 + PROPORTION_TOLERANCE {
        match strictness {
            ProportionStrictness::Lenient => {}
            ProportionStrictness::Warn => tracing::warn!(
                stratification,
                sum = requested_sum,
                "requested proportions sum above one"
            ),
            ProportionStrictness::Strict => {
                return Err(ValidationError::ProportionSumExceeded {
                    context: stratification.to_string(),
                    sum: requested_sum,
                })
            }
        }
    }

    let unspecified = strata.iter().filter(|s| !requested.contains_key(*s)).count();
    #[allow(clippy::cast_precision_loss)]
    let default_share = if unspecified == 0 {
        0.0
    } else {
        (1.0 - requested_sum) / unspecified as f64
    };

    Ok(strata
        .iter()
        .map(|s| total * requested.get(s).copied().unwrap_or(default_share))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> CompartmentRegistry {
        CompartmentRegistry::new(["susceptible", "infectious", "recovered"]).unwrap()
    }

    fn map(pairs: &[(&str, f64)]) -> BTreeMap<String, f64> {
        pairs.iter().map(|(k, v)| ((*k).to_string(), *v)).collect()
    }

    fn names(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| (*s).to_string()).collect()
    }

    #[test]
    fn allocation_without_total_keeps_requests() {
        let values = allocate_initial(&registry(), &map(&[("infectious", 1.0)]), None, "susceptible").unwrap();
        assert_eq!(values, vec![0.0, 1.0, 0.0]);
    }

    #[test]
    fn remainder_goes_to_default_target() {
        let values =
            allocate_initial(&registry(), &map(&[("infectious", 10.0)]), Some(1000.0), "susceptible").unwrap();
        assert_eq!(values, vec![990.0, 10.0, 0.0]);
        assert_eq!(values.iter().sum::<f64>(), 1000.0);
    }

    #[test]
    fn over_allocation_is_rejected() {
        let err = allocate_initial(&registry(), &map(&[("infectious", 2000.0)]), Some(1000.0), "susceptible")
            .unwrap_err();
        assert!(matches!(err, ValidationError::OverAllocatedPopulation { .. }));
    }

    #[test]
    fn rounding_deficit_is_not_over_allocation() {
        let requested = map(&[("infectious", 0.1), ("recovered", 0.2)]);
        let sum: f64 = requested.values().sum();
        assert!(sum > 0.3);

        let values = allocate_initial(&registry(), &requested, Some(0.3), "susceptible").unwrap();
        assert_eq!(values, vec![0.0, 0.1, 0.2]);
    }

    #[test]
    fn unknown_compartment_is_rejected() {
        let err = allocate_initial(&registry(), &map(&[("exposed", 1.0)]), None, "susceptible").unwrap_err();
        assert_eq!(err, ValidationError::UnknownCompartment { name: "exposed".to_string() });
    }

    #[test]
    fn split_shares_remainder_equally() {
        let shares = split(
            100.0,
            "risk",
            &names(&["low", "mid", "high"]),
            &map(&[("high", 0.5)]),
            ProportionStrictness::Strict,
        )
        .unwrap();
        assert_eq!(shares, vec![25.0, 25.0, 50.0]);
    }

    #[test]
    fn split_defaults_to_equal() {
        let shares = split(9.0, "risk", &names(&["a", "b", "c"]), &BTreeMap::new(), ProportionStrictness::Strict)
            .unwrap();
        assert_eq!(shares, vec![3.0, 3.0, 3.0]);
    }

    #[test]
    fn split_rejects_unknown_stratum() {
        let err = split(1.0, "risk", &names(&["a"]), &map(&[("z", 0.5)]), ProportionStrictness::Lenient)
            .unwrap_err();
        assert!(matches!(err, ValidationError::UnknownStratum { .. }));
    }

    #[test]
    fn split_over_one_depends_on_strictness() {
        let strata = names(&["a", "b"]);
        let requested = map(&[("a", 1.5)]);

        let lenient = split(10.0, "risk", &strata, &requested, ProportionStrictness::Lenient).unwrap();
        assert_eq!(lenient, vec![15.0, -5.0]);

        let warned = split(10.0, "risk", &strata, &requested, ProportionStrictness::Warn).unwrap();
        assert_eq!(warned, lenient);

        let err = split(10.0, "risk", &strata, &requested, ProportionStrictness::Strict).unwrap_err();
        assert!(matches!(err, ValidationError::ProportionSumExceeded { .. }));
    }
}
