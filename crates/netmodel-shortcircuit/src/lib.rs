//! IEC 60909 symmetrical-component short-circuit calculation over network
//! snapshots.
//!
//! Given a [`netmodel_core::NetworkGraph`] and a fault location, this crate
//! assembles the positive-, negative-, and zero-sequence nodal admittance
//! matrices (reusing [`netmodel_solve::ybus`] for the positive sequence so
//! the admittance model matches the power-flow solvers), extracts the
//! driving-point impedance at the fault, and evaluates the four IEC 60909
//! fault-current formulas.

pub mod fault;
pub mod sequence;

pub use fault::{
    calculate, FaultLocation, FaultResult, FaultType, InverterContribution, ShortCircuitOptions,
};

use netmodel_core::Id;

#[derive(Debug, thiserror::Error)]
pub enum ShortCircuitError {
    #[error("sequence data missing for element(s): {0:?}")]
    SequenceDataMissing(Vec<Id>),
    #[error("fault is on an island without a short-circuit source")]
    FaultIslandWithoutSource,
    #[error("unknown fault node: {0}")]
    UnknownNode(Id),
    #[error("unknown fault branch: {0}")]
    UnknownBranch(Id),
    #[error("driving-point impedance is singular at the fault location")]
    SingularNetwork,
}
