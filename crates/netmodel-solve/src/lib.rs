//! Power-flow and admittance-matrix solvers for network snapshots.
//!
//! This crate is the numerics layer on top of `netmodel-core`: given a
//! [`netmodel_core::NetworkGraph`] it assembles the per-unit Y-bus and runs
//! either the Newton-Raphson or fast-decoupled AC power-flow iteration.
//!
//! - [`ybus`]: per-unit nodal admittance matrix assembly, shared by both
//!   solvers so the admittance model never diverges between them.
//! - [`power_flow::newton_raphson`]: full AC power flow, PV→PQ Q-limit
//!   switching, branch flows and losses.
//! - [`power_flow::fast_decoupled`]: XB/BX fast-decoupled power flow.

pub mod power_flow;
pub mod ybus;

pub use power_flow::{
    fast_decoupled, newton_raphson, BranchFlow, BranchLimit, BusLimit, FastDecoupledOptions,
    FdMethod, IterationTrace, JacobianBlocks, PowerFlowError, PowerFlowInput, PowerFlowOptions,
    PowerFlowSolution, PqSpec, PvSpec, PvToPqSwitch, SlackSpec, SwitchDirection, TraceLevel,
};
pub use ybus::{
    build_ybus, AppliedShunt, AppliedTap, ShuntSpec, TapOverride, TapSource, YBusBuildError,
    YBusResult, YBusTrace,
};
