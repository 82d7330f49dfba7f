//! Stratum requests and their resolution to concrete stratum names.

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;
use crate::naming::{self, AGE_STRATIFICATION};

/// How the strata of one stratification are requested.
///
/// Deserializes from a JSON integer (`3` -> `1, 2, 3`), a list of strings or
/// a list of numbers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StrataRequest {
    /// Generate `1..=n`.
    Count(i64),
    /// Numeric values, stringified (age breakpoints use these).
    Values(Vec<f64>),
    /// Explicit stratum names.
    Names(Vec<String>),
}

impl From<Vec<String>> for StrataRequest {
    fn from(v: Vec<String>) -> Self {
        Self::Names(v)
    }
}

impl From<Vec<&str>> for StrataRequest {
    fn from(v: Vec<&str>) -> Self {
        Self::Names(v.into_iter().map(str::to_string).collect())
    }
}

impl From<Vec<f64>> for StrataRequest {
    fn from(v: Vec<f64>) -> Self {
        Self::Values(v)
    }
}

impl From<i64> for StrataRequest {
    fn from(n: i64) -> Self {
        Self::Count(n)
    }
}

impl StrataRequest {
    /// Interprets an arbitrary JSON value as a strata request.
    ///
    /// # Errors
    ///
    /// `InvalidStratumCount` for anything other than a positive integer or a
    /// list of strings/numbers.
    pub fn from_json(value: &serde_json::Value) -> Result<Self, ValidationError> {
        use serde_json::Value;

        match value {
            Value::Number(n) => match n.as_i64() {
                Some(count) => Ok(Self::Count(count)),
                None => Err(ValidationError::InvalidStratumCount {
                    reason: format!("stratum count {n} is not an integer"),
                }),
            },
            Value::Array(items) => {
                let mut names = Vec::with_capacity(items.len());
                for item in items {
                    match item {
                        Value::String(s) => names.push(s.clone()),
                        Value::Number(n) => names.push(format_number(n.as_f64().unwrap_or(0.0))),
                        other => {
                            return Err(ValidationError::InvalidStratumCount {
                                reason: format!("stratum {other} is not a string or number"),
                            })
                        }
                    }
                }
                Ok(Self::Names(names))
            }
            other => Err(ValidationError::InvalidStratumCount {
                reason: format!("strata must be a list or a positive integer, got {other}"),
            }),
        }
    }
}

/// Concrete, ordered strata for one stratification.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedStrata {
    /// Stratum names in expansion order.
    pub names: Vec<String>,
    /// Lower bounds of the age intervals, parallel to `names`. Empty for
    /// non-age stratifications.
    pub age_breakpoints: Vec<f64>,
}

impl ResolvedStrata {
    /// Width of every non-terminal age interval, as `(from, to, width)`.
    #[must_use]
    pub fn ageing_intervals(&self) -> Vec<(&str, &str, f64)> {
        self.names
            .windows(2)
            .zip(self.age_breakpoints.windows(2))
            .map(|(names, bounds)| (names[0].as_str(), names[1].as_str(), bounds[1] - bounds[0]))
            .collect()
    }
}

/// Formats a stratum value: integral values without a decimal point.
#[must_use]
pub fn format_number(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        #[allow(clippy::cast_possible_truncation)]
        let whole = value as i64;
        whole.to_string()
    } else {
        value.to_string()
    }
}

/// Resolves a strata request to concrete names.
///
/// # Errors
///
/// `InvalidStratumCount` for a non-positive count, an empty list, duplicate
/// strata, or non-numeric age breakpoints. `ReservedCharacterInName` or
/// `InvalidName` for a stratum that would break compartment naming.
pub fn resolve(stratification: &str, request: &StrataRequest) -> Result<ResolvedStrata, ValidationError> {
    if stratification == AGE_STRATIFICATION {
        return resolve_age(request);
    }

    let names: Vec<String> = match request {
        StrataRequest::Count(n) if *n > 0 => (1..=*n).map(|i| i.to_string()).collect(),
        StrataRequest::Count(n) => {
            return Err(ValidationError::InvalidStratumCount {
                reason: format!("stratum count must be positive, got {n}"),
            })
        }
        StrataRequest::Values(values) => values.iter().copied().map(format_number).collect(),
        StrataRequest::Names(names) => names.clone(),
    };

    check_names(&names)?;
    Ok(ResolvedStrata {
        names,
        age_breakpoints: Vec::new(),
    })
}

fn check_names(names: &[String]) -> Result<(), ValidationError> {
    if names.is_empty() {
        return Err(ValidationError::InvalidStratumCount {
            reason: "at least one stratum is required".to_string(),
        });
    }
    for (i, name) in names.iter().enumerate() {
        if name.trim().is_empty() {
            return Err(ValidationError::InvalidStratumCount {
                reason: "stratum names cannot be empty".to_string(),
            });
        }
        naming::validate_stratum_name(name)?;
        if names[..i].contains(name) {
            return Err(ValidationError::InvalidStratumCount {
                reason: format!("stratum '{name}' is requested twice"),
            });
        }
    }
    Ok(())
}

fn resolve_age(request: &StrataRequest) -> Result<ResolvedStrata, ValidationError> {
    let mut breakpoints: Vec<f64> = match request {
        StrataRequest::Values(values) => values.clone(),
        StrataRequest::Names(names) => names
            .iter()
            .map(|n| {
                n.trim().parse::<f64>().map_err(|_| ValidationError::InvalidStratumCount {
                    reason: format!("age breakpoint '{n}' is not numeric"),
                })
            })
            .collect::<Result<_, _>>()?,
        StrataRequest::Count(_) => {
            return Err(ValidationError::InvalidStratumCount {
                reason: "age strata must be a list of breakpoints".to_string(),
            })
        }
    };

    if let Some(bad) = breakpoints.iter().find(|b| !b.is_finite() || **b < 0.0) {
        return Err(ValidationError::InvalidStratumCount {
            reason: format!("age breakpoint {bad} must be a non-negative number"),
        });
    }
    if !breakpoints.contains(&0.0) {
        breakpoints.push(0.0);
    }
    breakpoints.sort_by(f64::total_cmp);
    breakpoints.dedup();

    let names: Vec<String> = breakpoints.iter().copied().map(format_number).collect();
    Ok(ResolvedStrata {
        names,
        age_breakpoints: breakpoints,
    })
}
