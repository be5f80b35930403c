//! Primitive value objects: nodes, branches, switches, inverter sources.
//!
//! Every type here is an immutable value object with a `validate` method; none
//! of them know about the graph they live in (that ownership starts at
//! [`crate::graph::NetworkGraph`]).

use serde::{Deserialize, Serialize};

use crate::error::{NetModelError, NetModelResult};
use crate::units::{Kilovolts, Megavars, Megawatts, PerUnit, Radians};

pub type Id = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeType {
    Slack,
    Pq,
    Pv,
}

/// A bus in the network. Which optional fields must be `Some` depends on
/// `node_type` — see [`Node::validate`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: Id,
    pub name: String,
    pub node_type: NodeType,
    pub voltage_level_kv: Kilovolts,
    pub voltage_magnitude_pu: Option<PerUnit>,
    pub voltage_angle_rad: Option<Radians>,
    pub active_power_mw: Option<Megawatts>,
    pub reactive_power_mvar: Option<Megavars>,
    /// Short-circuit source strength; required by the IEC 60909 solver on the
    /// slack bus, meaningless elsewhere.
    pub sk_mva: Option<f64>,
    pub rx_ratio: Option<f64>,
    pub in_service: bool,
}

impl Node {
    pub fn validate(&self) -> NetModelResult<()> {
        if self.voltage_level_kv.value() <= 0.0 {
            return Err(NetModelError::Invariant(format!(
                "node {}: voltage_level_kv must be > 0",
                self.id
            )));
        }
        if let Some(mag) = self.voltage_magnitude_pu {
            if mag.value() <= 0.0 {
                return Err(NetModelError::Invariant(format!(
                    "node {}: voltage_magnitude_pu must be > 0",
                    self.id
                )));
            }
        }
        if let Some(angle) = self.voltage_angle_rad {
            if !angle.in_principal_range() {
                return Err(NetModelError::Invariant(format!(
                    "node {}: voltage_angle_rad must lie in [-pi, pi]",
                    self.id
                )));
            }
        }
        match self.node_type {
            NodeType::Slack => {
                if self.voltage_magnitude_pu.is_none() || self.voltage_angle_rad.is_none() {
                    return Err(NetModelError::Invariant(format!(
                        "node {}: SLACK requires voltage_magnitude_pu and voltage_angle_rad",
                        self.id
                    )));
                }
            }
            NodeType::Pq => {
                if self.active_power_mw.is_none() || self.reactive_power_mvar.is_none() {
                    return Err(NetModelError::Invariant(format!(
                        "node {}: PQ requires active_power_mw and reactive_power_mvar",
                        self.id
                    )));
                }
            }
            NodeType::Pv => {
                if self.active_power_mw.is_none() || self.voltage_magnitude_pu.is_none() {
                    return Err(NetModelError::Invariant(format!(
                        "node {}: PV requires active_power_mw and voltage_magnitude_pu",
                        self.id
                    )));
                }
            }
        }
        Ok(())
    }

    /// BLOCKER-level readiness rule "source without short-circuit parameters"
    /// checks this; only meaningful for the slack bus.
    pub fn has_short_circuit_source_data(&self) -> bool {
        self.sk_mva.is_some() && self.rx_ratio.is_some()
    }
}

/// Named totals that, when present, the Y-bus builder uses directly instead
/// of `per_km * length_km`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct LineImpedanceOverride {
    pub r_total_ohm: f64,
    pub x_total_ohm: f64,
    pub b_total_us: f64,
}

/// Opaque catalog key. The core never resolves it; the catalog lives outside
/// this workspace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeRef(pub String);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LineKind {
    Line,
    Cable,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LineBranch {
    pub kind: LineKind,
    pub r_ohm_per_km: f64,
    pub x_ohm_per_km: f64,
    pub b_us_per_km: f64,
    pub length_km: f64,
    pub rated_current_a: f64,
    pub type_ref: Option<TypeRef>,
    pub impedance_override: Option<LineImpedanceOverride>,
    /// Zero-sequence parameters; absence disables ground-fault analyses.
    pub r0_ohm_per_km: Option<f64>,
    pub x0_ohm_per_km: Option<f64>,
    pub b0_us_per_km: Option<f64>,
}

impl LineBranch {
    fn validate(&self, id: &str) -> NetModelResult<()> {
        if self.r_ohm_per_km < 0.0 || self.x_ohm_per_km < 0.0 || self.b_us_per_km < 0.0 {
            return Err(NetModelError::Invariant(format!(
                "branch {id}: per-km parameters must be >= 0"
            )));
        }
        if self.length_km <= 0.0 {
            return Err(NetModelError::Invariant(format!(
                "branch {id}: length_km must be > 0"
            )));
        }
        if self.rated_current_a <= 0.0 {
            return Err(NetModelError::Invariant(format!(
                "branch {id}: rated_current_a must be > 0"
            )));
        }
        let (r, x) = match self.impedance_override {
            Some(ov) => (ov.r_total_ohm, ov.x_total_ohm),
            None => (
                self.r_ohm_per_km * self.length_km,
                self.x_ohm_per_km * self.length_km,
            ),
        };
        if r == 0.0 && x == 0.0 {
            return Err(NetModelError::Invariant(format!(
                "branch {id}: impedance must be non-zero"
            )));
        }
        Ok(())
    }

    pub fn has_zero_sequence_data(&self) -> bool {
        self.r0_ohm_per_km.is_some() && self.x0_ohm_per_km.is_some()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransformerBranch {
    pub rated_power_mva: f64,
    pub voltage_hv_kv: f64,
    pub voltage_lv_kv: f64,
    pub uk_percent: f64,
    pub pk_kw: f64,
    pub i0_percent: f64,
    pub p0_kw: f64,
    pub vector_group: Option<String>,
    pub tap_position: i32,
    pub tap_step_percent: f64,
}

impl TransformerBranch {
    fn validate(&self, id: &str) -> NetModelResult<()> {
        if self.rated_power_mva <= 0.0 {
            return Err(NetModelError::Invariant(format!(
                "transformer {id}: rated_power_mva must be > 0"
            )));
        }
        if self.voltage_hv_kv <= 0.0 || self.voltage_lv_kv <= 0.0 {
            return Err(NetModelError::Invariant(format!(
                "transformer {id}: voltage_hv_kv and voltage_lv_kv must be > 0"
            )));
        }
        if self.uk_percent <= 0.0 {
            return Err(NetModelError::Invariant(format!(
                "transformer {id}: uk_percent must be > 0"
            )));
        }
        if self.pk_kw < 0.0 || self.i0_percent < 0.0 || self.p0_kw < 0.0 {
            return Err(NetModelError::Invariant(format!(
                "transformer {id}: pk_kw, i0_percent, p0_kw must be >= 0"
            )));
        }
        if self.short_circuit_discriminant() < 0.0 {
            return Err(NetModelError::Invariant(format!(
                "transformer {id}: (uk%/100)^2 - (pk_kw/1000/Sn)^2 must be >= 0"
            )));
        }
        Ok(())
    }

    /// `(uk/100)^2 - (pk_kw/1000/Sn)^2`, must be non-negative for a physical
    /// short-circuit reactance to exist.
    pub fn short_circuit_discriminant(&self) -> f64 {
        let z_pu = self.uk_percent / 100.0;
        let r_pu = (self.pk_kw / 1000.0) / self.rated_power_mva;
        z_pu * z_pu - r_pu * r_pu
    }

    /// `r + jx` short-circuit impedance in per unit on the transformer's own
    /// rated power.
    pub fn short_circuit_impedance_pu(&self) -> num_complex::Complex64 {
        let r_pu = (self.pk_kw / 1000.0) / self.rated_power_mva;
        let x_pu = self.short_circuit_discriminant().max(0.0).sqrt();
        num_complex::Complex64::new(r_pu, x_pu)
    }

    /// Off-nominal tap ratio `1 + tap_position * tap_step_percent / 100`.
    pub fn tap_ratio(&self) -> f64 {
        1.0 + (self.tap_position as f64) * self.tap_step_percent / 100.0
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "branch_type", rename_all = "snake_case")]
pub enum BranchKind {
    Line(LineBranch),
    Transformer(TransformerBranch),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Branch {
    pub id: Id,
    pub name: String,
    pub from_node_id: Id,
    pub to_node_id: Id,
    pub in_service: bool,
    pub kind: BranchKind,
}

impl Branch {
    pub fn validate(&self) -> NetModelResult<()> {
        if self.from_node_id == self.to_node_id {
            return Err(NetModelError::Invariant(format!(
                "branch {}: from_node_id and to_node_id must differ",
                self.id
            )));
        }
        match &self.kind {
            BranchKind::Line(line) => line.validate(&self.id),
            BranchKind::Transformer(tx) => tx.validate(&self.id),
        }
    }

    pub fn has_zero_impedance(&self) -> bool {
        match &self.kind {
            BranchKind::Line(line) => {
                let (r, x) = match line.impedance_override {
                    Some(ov) => (ov.r_total_ohm, ov.x_total_ohm),
                    None => (
                        line.r_ohm_per_km * line.length_km,
                        line.x_ohm_per_km * line.length_km,
                    ),
                };
                r == 0.0 && x == 0.0
            }
            BranchKind::Transformer(_) => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SwitchType {
    Breaker,
    Disconnector,
    LoadSwitch,
    Fuse,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SwitchState {
    Open,
    Closed,
}

/// A zero-impedance topology element. Unlike a [`Branch`], a switch never
/// contributes to the admittance matrix.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Switch {
    pub id: Id,
    pub from_node_id: Id,
    pub to_node_id: Id,
    pub switch_type: SwitchType,
    pub state: SwitchState,
    pub in_service: bool,
    pub rated_current_a: f64,
    pub rated_voltage_kv: f64,
}

impl Switch {
    pub fn validate(&self) -> NetModelResult<()> {
        if self.from_node_id == self.to_node_id {
            return Err(NetModelError::Invariant(format!(
                "switch {}: from_node_id and to_node_id must differ",
                self.id
            )));
        }
        Ok(())
    }

    pub fn is_active(&self) -> bool {
        self.in_service && self.state == SwitchState::Closed
    }
}

/// An inverter-based short-circuit source (e.g. a PV inverter or battery
/// converter) contributing a bounded current independent of synchronous
/// sub-transient reactance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InverterSource {
    pub id: Id,
    pub node_id: Id,
    pub rated_current_a: f64,
    pub k_sc: f64,
    pub contributes_negative_sequence: bool,
    pub contributes_zero_sequence: bool,
    pub in_service: bool,
}

impl InverterSource {
    pub fn validate(&self) -> NetModelResult<()> {
        if self.rated_current_a <= 0.0 {
            return Err(NetModelError::Invariant(format!(
                "inverter source {}: rated_current_a must be > 0",
                self.id
            )));
        }
        if self.k_sc <= 0.0 {
            return Err(NetModelError::Invariant(format!(
                "inverter source {}: k_sc must be > 0",
                self.id
            )));
        }
        Ok(())
    }

    /// `I_k = k_sc * I_rated`, the fault current this source contributes.
    pub fn short_circuit_current_a(&self) -> f64 {
        self.k_sc * self.rated_current_a
    }
}

/// A substation (GPZ) groups a set of buses under one physical site. The
/// core holds only the id references, not the buses themselves; resolving
/// `bus_refs` against [`crate::graph::NetworkGraph::nodes`] and flagging
/// dangling ones is the readiness validator's job, not this type's.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Substation {
    pub id: Id,
    pub name: String,
    pub bus_refs: Vec<Id>,
}

/// A corridor (trunk) is an ordered run of branches treated as one logical
/// feeder for planning views. Like [`Substation`], it carries only id
/// references.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Corridor {
    pub id: Id,
    pub name: String,
    pub segment_refs: Vec<Id>,
}
