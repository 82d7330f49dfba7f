//! Boundary with external ODE integrators.
//!
//! The library never integrates by itself: it exposes an [`OdeSystem`] and
//! hands it to a caller-supplied [`Integrator`], which returns a
//! [`Solution`].

use serde::{Deserialize, Serialize};

use crate::error::{ExecutionError, ModelResult};

/// Right-hand side of an ODE system `dy/dt = f(t, y)`.
pub trait OdeSystem {
    /// Number of state variables.
    fn ndim(&self) -> usize;

    /// Evaluates `f(t, y)` into `dydt`.
    ///
    /// # Errors
    ///
    /// Fails if `y`/`dydt` have the wrong length or a time-variant parameter
    /// cannot be resolved; either error ends the integration run.
    fn rhs(&self, t: f64, y: &[f64], dydt: &mut [f64]) -> ModelResult<()>;
}

/// A numerical integrator.
pub trait Integrator {
    /// Integrates `system` from `y0`, reporting the state at each of `times`.
    ///
    /// With `equilibrium_stop`, the integrator may end early once the system
    /// settles; the returned solution is then shorter than `times`.
    ///
    /// # Errors
    ///
    /// Propagates right-hand-side errors and reports solver failures as
    /// `ExecutionError::Integration`.
    fn integrate(
        &self,
        system: &dyn OdeSystem,
        y0: &[f64],
        times: &[f64],
        equilibrium_stop: bool,
    ) -> ModelResult<Solution>;
}

/// States reported by an integrator, one per time point reached.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Solution {
    /// Time points reached.
    pub times: Vec<f64>,
    /// State vector at each time point.
    pub states: Vec<Vec<f64>>,
}

impl Solution {
    /// Creates a solution from parallel time and state sequences.
    #[must_use]
    pub fn new(times: Vec<f64>, states: Vec<Vec<f64>>) -> Self {
        Self { times, states }
    }

    /// Number of time points.
    #[must_use]
    pub fn len(&self) -> usize {
        self.times.len()
    }

    /// Returns true if no time point was reached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.times.is_empty()
    }

    /// State at the last time point.
    #[must_use]
    pub fn final_state(&self) -> Option<&[f64]> {
        self.states.last().map(Vec::as_slice)
    }

    /// Checks that every state has `ndim` entries and that times and states
    /// line up.
    ///
    /// # Errors
    ///
    /// `Integration` for mismatched sequence lengths,
    /// `StateDimensionMismatch` for a state of the wrong size.
    pub fn check_shape(&self, ndim: usize) -> Result<(), ExecutionError> {
        if self.times.len() != self.states.len() {
            return Err(ExecutionError::Integration {
                message: format!(
                    "solution has {} time points but {} states",
                    self.times.len(),
                    self.states.len()
                ),
            });
        }
        if let Some(bad) = self.states.iter().find(|s| s.len() != ndim) {
            return Err(ExecutionError::StateDimensionMismatch {
                expected: ndim,
                actual: bad.len(),
            });
        }
        Ok(())
    }
}
