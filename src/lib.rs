//! # stratamodel - Stratified compartmental disease models
//!
//! stratamodel builds systems of ordinary differential equations for
//! compartmental transmission models. A model starts from a handful of
//! named compartments and flows; each stratification splits compartments
//! into parallel strata (age, risk group, treatment status, ...) and
//! rewrites every affected flow, population and parameter so that the
//! expanded model stays conservative.
//!
//! ## Core Concepts
//!
//! - **Compartment**: a named sub-population in the state vector
//! - **Flow**: a rate term moving population between compartments, or out of the system
//! - **Stratification**: a split of compartments into strata, with per-stratum parameter adjustments
//! - **Implement level**: the number of stratifications applied; only flows at the latest level are active
//!
//! Integration is delegated: the model hands an [`OdeSystem`] to any
//! caller-supplied [`Integrator`].
//!
//! ## Usage
//!
//! ```rust,ignore
//! use stratamodel::{FlowRequest, ModelBuilder, StratificationRequest};
//!
//! let mut model = ModelBuilder::new(["susceptible", "infectious", "recovered"])
//!     .times(vec![0.0, 1.0, 2.0])
//!     .initial("infectious", 1.0)
//!     .starting_population(1000.0)
//!     .parameter("beta", 0.4)
//!     .parameter("gamma", 0.1)
//!     .flow(FlowRequest::infection_frequency("beta", "susceptible", "infectious"))
//!     .flow(FlowRequest::standard("gamma", "infectious", "recovered"))
//!     .build()?;
//!
//! model.stratify(
//!     &StratificationRequest::new("age", vec![5.0, 15.0]).adjust("gamma", "15", 2.0),
//! )?;
//! let outputs = model.run(&my_integrator)?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

// Naming, compartments and strata
pub mod compartment;
pub mod error;
pub mod naming;
pub mod strata;

// Parameters and populations
pub mod allocation;
pub mod parameter;
pub mod time_function;

// Flows, stratification and assembly
pub mod assembler;
pub mod config;
pub mod flow;
pub mod model;
pub mod ode;
pub mod stratification;

pub use allocation::ProportionStrictness;
pub use assembler::Rhs;
pub use compartment::{Compartment, CompartmentRegistry, ExpansionMap, StratumKey};
pub use config::{BirthApproach, ModelBuilder, ModelConfig, OutputConnection};
pub use error::{ExecutionError, ModelError, ModelResult, ValidationError};
pub use flow::{Flow, FlowRequest, FlowTable, FlowType, Replication};
pub use model::{Model, ModelOutputs};
pub use ode::{Integrator, OdeSystem, Solution};
pub use parameter::{Adjustment, ParameterSet, ParameterValue, ResolvedRate};
pub use strata::{ResolvedStrata, StrataRequest};
pub use stratification::{AdjustmentRequest, StratificationRecord, StratificationRequest};
pub use time_function::{ScaleUp, TimeFunction, TimeFunctions};
