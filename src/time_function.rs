//! Registry of time-variant functions referenced by name from parameters.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::error::ValidationError;

/// A callable `t -> value`.
pub type TimeFunction = Arc<dyn Fn(f64) -> f64 + Send + Sync>;

/// Named time functions available to the parameter resolver.
#[derive(Clone, Default)]
pub struct TimeFunctions {
    functions: HashMap<String, TimeFunction>,
}

impl fmt::Debug for TimeFunctions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&String> = self.functions.keys().collect();
        names.sort();
        f.debug_struct("TimeFunctions").field("names", &names).finish()
    }
}

impl TimeFunctions {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds (or rebinds) a function to a name.
    pub fn register<F>(&mut self, name: impl Into<String>, function: F)
    where
        F: Fn(f64) -> f64 + Send + Sync + 'static,
    {
        self.functions.insert(name.into(), Arc::new(function));
    }

    /// Binds a piecewise-linear interpolant through `(time, value)` points.
    ///
    /// Values are held flat before the first and after the last point.
    ///
    /// # Errors
    ///
    /// `InvalidConfig` if no points are given or a coordinate is not finite.
    pub fn register_series(
        &mut self,
        name: impl Into<String>,
        points: &[(f64, f64)],
    ) -> Result<(), ValidationError> {
        let series = ScaleUp::new(points)?;
        self.register(name, move |t| series.value_at(t));
        Ok(())
    }

    /// Looks up a function.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&TimeFunction> {
        self.functions.get(name)
    }

    /// Returns true if a function is bound to the name.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }

    /// Evaluates a bound function at `t`.
    #[must_use]
    pub fn evaluate(&self, name: &str, t: f64) -> Option<f64> {
        self.functions.get(name).map(|f| f(t))
    }
}

/// Piecewise-linear interpolation through sorted data points.
#[derive(Debug, Clone, PartialEq)]
pub struct ScaleUp {
    points: Vec<(f64, f64)>,
}

impl ScaleUp {
    /// Builds an interpolant; points are sorted by time.
    ///
    /// # Errors
    ///
    /// `InvalidConfig` if `points` is empty or holds non-finite values.
    pub fn new(points: &[(f64, f64)]) -> Result<Self, ValidationError> {
        if points.is_empty() {
            return Err(ValidationError::InvalidConfig {
                reason: "a time series needs at least one point".to_string(),
            });
        }
        if points.iter().any(|(t, v)| !t.is_finite() || !v.is_finite()) {
            return Err(ValidationError::InvalidConfig {
                reason: "time series points must be finite".to_string(),
            });
        }
        let mut points = points.to_vec();
        points.sort_by(|a, b| a.0.total_cmp(&b.0));
        Ok(Self { points })
    }

    /// Interpolated value at `t`.
    #[must_use]
    pub fn value_at(&self, t: f64) -> f64 {
        let first = self.points[0];
        let last = self.points[self.points.len() - 1];
        if t <= first.0 {
            return first.1;
        }
        if t >= last.0 {
            return last.1;
        }
        let upper = self.points.partition_point(|(pt, _)| *pt <= t);
        let (t0, v0) = self.points[upper - 1];
        let (t1, v1) = self.points[upper];
        if t1 == t0 {
            return v1;
        }
        v0 + (v1 - v0) * (t - t0) / (t1 - t0)
    }
}
