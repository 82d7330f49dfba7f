//! Error types for stratamodel.
//!
//! All errors are strongly typed using thiserror. Input problems surface as
//! [`ValidationError`] at construction or stratification time; problems that
//! only appear once the right-hand side is evaluated surface as
//! [`ExecutionError`].

use thiserror::Error;

/// Validation errors raised while building or stratifying a model.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("Compartment name '{name}' already exists")]
    DuplicateCompartmentName {
        name: String,
    },

    #[error("Unknown compartment '{name}'")]
    UnknownCompartment {
        name: String,
    },

    #[error("Unknown stratum '{stratum}' for stratification '{stratification}'")]
    UnknownStratum {
        stratification: String,
        stratum: String,
    },

    #[error("Unknown parameter '{name}'")]
    UnknownParameter {
        name: String,
    },

    #[error("Invalid stratification target for '{stratification}': {reason}")]
    InvalidStratificationTarget {
        stratification: String,
        reason: String,
    },

    #[error("Name '{name}' contains reserved character '{character}'")]
    ReservedCharacterInName {
        name: String,
        character: char,
    },

    #[error("Invalid name '{name}': {reason}")]
    InvalidName {
        name: String,
        reason: String,
    },

    #[error("Invalid stratum request: {reason}")]
    InvalidStratumCount {
        reason: String,
    },

    #[error("Requested population {requested} exceeds total population {total}")]
    OverAllocatedPopulation {
        requested: f64,
        total: f64,
    },

    #[error("Proportions for '{context}' sum to {sum}, which exceeds 1")]
    ProportionSumExceeded {
        context: String,
        sum: f64,
    },

    #[error("Proportions for '{context}' cover every stratum but sum to {sum}, leaving population unallocated")]
    UnallocatedPopulation {
        context: String,
        sum: f64,
    },

    #[error("Invalid flow: {reason}")]
    InvalidFlow {
        reason: String,
    },

    #[error("None of the infectious compartments {names:?} exist in the model")]
    MissingInfectiousCompartment {
        names: Vec<String>,
    },

    #[error("Invalid configuration: {reason}")]
    InvalidConfig {
        reason: String,
    },
}

/// Execution errors raised while resolving flows or evaluating the system.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ExecutionError {
    #[error("Parameter '{parameter}' refers to unbound time function '{function}'")]
    UnboundParameterFunction {
        parameter: String,
        function: String,
    },

    #[error("Expansion does not cover compartment '{compartment}' of flow '{parameter}'")]
    FlowReplicationMismatch {
        parameter: String,
        compartment: String,
    },

    #[error("State vector has {actual} entries, expected {expected}")]
    StateDimensionMismatch {
        expected: usize,
        actual: usize,
    },

    #[error("Integration failed: {message}")]
    Integration {
        message: String,
    },
}

/// Top-level error type for stratamodel.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ModelError {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Execution error: {0}")]
    Execution(#[from] ExecutionError),

    #[error("Failed to read configuration: {message}")]
    Io {
        message: String,
    },
}

impl ModelError {
    /// Creates an I/O error from any displayable source.
    #[must_use]
    pub fn io(message: impl Into<String>) -> Self {
        Self::Io {
            message: message.into(),
        }
    }

    /// Returns true if this is a validation error.
    #[must_use]
    pub const fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }

    /// Returns true if this is an execution error.
    #[must_use]
    pub const fn is_execution(&self) -> bool {
        matches!(self, Self::Execution(_))
    }

    /// Returns true if the error aborts an integration run once it has started.
    #[must_use]
    pub const fn is_fatal_to_run(&self) -> bool {
        match self {
            Self::Execution(e) => matches!(
                e,
                ExecutionError::UnboundParameterFunction { .. }
                    | ExecutionError::StateDimensionMismatch { .. }
                    | ExecutionError::Integration { .. }
            ),
            Self::Validation(_) | Self::Io { .. } => false,
        }
    }
}

/// Result type alias for stratamodel operations.
pub type ModelResult<T> = Result<T, ModelError>;
